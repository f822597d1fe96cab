use crate::utils::command::CommandExecutor;
use std::net::Ipv4Addr;

/// Flow-table cleanup after an application's forwarding path changed.
pub struct ConntrackManager;

impl ConntrackManager {
    /// Flush all conntrack entries for a specific IP (both source and destination).
    /// Entries that do not exist are not an error.
    pub async fn flush_for_ip(ip: Ipv4Addr) {
        let ip_str = ip.to_string();

        for direction in ["-s", "-d"] {
            match CommandExecutor::execute("conntrack", &["-D", direction, &ip_str]).await {
                Ok(result) if !result.success && !result.stderr.contains("0 flow entries") => {
                    tracing::debug!("conntrack -D {} {}: {}", direction, ip, result.stderr.trim());
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!("Failed to run conntrack for {} (non-fatal): {}", ip, e);
                    return;
                }
            }
        }

        tracing::debug!("Conntrack entries flushed for {}", ip);
    }
}
