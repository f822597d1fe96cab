// Operator-facing output for the CLI subcommands, plus the tracing setup
// the daemon logs through.

use std::env;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// ANSI color codes for CLI output
pub struct Colors;

impl Colors {
    /// Success - #5FADEB
    pub const MAIN: &'static str = "\x1b[38;2;95;173;235m";
    /// Info - #4A9BD9
    pub const SECONDARY: &'static str = "\x1b[38;2;74;155;217m";
    /// Labels and details - #808080
    pub const DIM_GRAY: &'static str = "\x1b[38;2;128;128;128m";
    /// Errors - #FF3B30
    pub const ERROR: &'static str = "\x1b[38;2;255;59;48m";
    /// Warnings - #FF9500
    pub const WARNING: &'static str = "\x1b[38;2;255;149;0m";
    pub const RESET: &'static str = "\x1b[0m";
    pub const BOLD: &'static str = "\x1b[1m";
}

pub struct Symbols;

impl Symbols {
    pub const SUCCESS: &'static str = "✓";
    pub const ERROR: &'static str = "✗";
    pub const WARNING: &'static str = "!";
    pub const INFO: &'static str = "ℹ";
    pub const ARROW: &'static str = "→";
    pub const BULLET: &'static str = "•";
}

/// Colors are off when NO_COLOR is set or stdout is not a terminal.
pub fn should_use_colors() -> bool {
    env::var("NO_COLOR").is_err() && console::Term::stdout().is_term()
}

fn paint(color: &str, text: &str, colored: bool) -> String {
    if colored {
        format!("{}{}{}", color, text, Colors::RESET)
    } else {
        text.to_string()
    }
}

fn line(color: &str, symbol: &str, message: &str, colored: bool) -> String {
    paint(color, &format!("{} {}", symbol, message), colored)
}

fn detail_line(label: &str, value: &str, colored: bool) -> String {
    format!(
        "  {} {} {}",
        paint(Colors::DIM_GRAY, label, colored),
        Symbols::ARROW,
        paint(Colors::SECONDARY, value, colored)
    )
}

pub struct Logger;

impl Logger {
    pub fn success(message: &str) {
        println!("{}", line(Colors::MAIN, Symbols::SUCCESS, message, should_use_colors()));
    }

    /// Written to stderr
    pub fn error(message: &str) {
        let colored = env::var("NO_COLOR").is_err() && console::Term::stderr().is_term();
        eprintln!("{}", line(Colors::ERROR, Symbols::ERROR, message, colored));
    }

    pub fn warning(message: &str) {
        println!("{}", line(Colors::WARNING, Symbols::WARNING, message, should_use_colors()));
    }

    pub fn info(message: &str) {
        println!("{}", line(Colors::SECONDARY, Symbols::INFO, message, should_use_colors()));
    }

    /// Indented key-value line, e.g. `  bridge → bn1`
    pub fn detail(label: &str, value: &str) {
        println!("{}", detail_line(label, value, should_use_colors()));
    }

    pub fn section(title: &str) {
        let colored = should_use_colors();
        let title = if colored {
            format!("{}{}", Colors::BOLD, paint(Colors::MAIN, title, true))
        } else {
            title.to_string()
        };
        println!("\n{}", title);
    }

    pub fn item(message: &str) {
        println!("  {}", line(Colors::DIM_GRAY, Symbols::BULLET, message, should_use_colors()));
    }
}

/// Installs the global tracing subscriber: formatted events on stderr,
/// filtered by `directive` (falls back to `info` when it does not parse).
pub fn init_tracing(directive: &str) {
    let filter = EnvFilter::try_new(directive).unwrap_or_else(|_| EnvFilter::new("info"));
    let result = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init();
    if let Err(e) = result {
        eprintln!("tracing already initialized: {}", e);
    }
}
