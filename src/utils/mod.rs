// Shared helpers: external command execution and CLI output.
pub mod command;
pub mod logger;
