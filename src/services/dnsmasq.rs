// DHCP/DNS lease service
// One dnsmasq per bridge, fed from a hosts directory and a dhcp-hosts
// directory under the run dir.

use crate::network::error::{NetworkError, NetworkResult};
use crate::types::DhcpRange;
use async_trait::async_trait;
use ipnetwork::Ipv4Network;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use tokio::process::{Child, Command};

/// Name under which the bridge IP is published in the hosts directory.
pub const ROUTER_HOSTNAME: &str = "router";

const LEASE_TIME: &str = "10m";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseServiceSpec {
    pub bridge_name: String,
    pub bridge_ip: Ipv4Addr,
    pub subnet: Option<Ipv4Network>,
    pub gateway: Option<Ipv4Addr>,
    pub dhcp_range: DhcpRange,
    pub uplink: String,
    pub dns_servers: Vec<IpAddr>,
    pub ntp_servers: Vec<IpAddr>,
}

#[async_trait]
pub trait LeaseService: Send + Sync {
    /// Creates `hosts.<bridge>` with a router entry for the bridge IP.
    fn create_hosts_dir(&self, bridge: &str, bridge_ip: Option<Ipv4Addr>) -> NetworkResult<()>;
    fn remove_hosts_dir(&self, bridge: &str) -> NetworkResult<()>;

    /// Publishes a static lease and a name for an app interface.
    fn add_host(&self, bridge: &str, mac: &str, ip: Ipv4Addr, hostname: &str)
        -> NetworkResult<()>;
    fn remove_host(&self, bridge: &str, mac: &str, hostname: &str) -> NetworkResult<()>;

    async fn start(&self, spec: &LeaseServiceSpec) -> NetworkResult<()>;
    async fn stop(&self, bridge: &str) -> NetworkResult<()>;
}

#[derive(Debug, Clone)]
pub struct DnsmasqPaths {
    run_dir: PathBuf,
}

impl DnsmasqPaths {
    pub fn new(run_dir: impl Into<PathBuf>) -> Self {
        Self {
            run_dir: run_dir.into(),
        }
    }

    pub fn config(&self, bridge: &str) -> PathBuf {
        self.run_dir.join(format!("dnsmasq.{}.conf", bridge))
    }

    pub fn leases(&self, bridge: &str) -> PathBuf {
        self.run_dir.join(format!("dnsmasq.{}.leases", bridge))
    }

    pub fn pid(&self, bridge: &str) -> PathBuf {
        self.run_dir.join(format!("dnsmasq.{}.pid", bridge))
    }

    pub fn hosts_dir(&self, bridge: &str) -> PathBuf {
        self.run_dir.join(format!("hosts.{}", bridge))
    }

    pub fn dhcp_hosts_dir(&self, bridge: &str) -> PathBuf {
        self.run_dir.join(format!("dhcp-hosts.{}", bridge))
    }
}

fn join_ips(ips: &[IpAddr]) -> String {
    ips.iter()
        .map(|ip| ip.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Renders the dnsmasq configuration for one bridge.
pub fn render_config(spec: &LeaseServiceSpec, paths: &DnsmasqPaths) -> String {
    let bridge = spec.bridge_name.as_str();
    let mut conf = String::new();
    let _ = writeln!(conf, "# Automatically generated by edgenet");
    for line in [
        "except-interface=lo",
        "bind-interfaces",
        "quiet-dhcp",
        "no-hosts",
        "no-ping",
        "bogus-priv",
        "stop-dns-rebind",
        "rebind-localhost-ok",
        "neg-ttl=10",
        "dhcp-ttl=600",
        "no-resolv",
    ] {
        let _ = writeln!(conf, "{}", line);
    }
    let _ = writeln!(conf, "dhcp-leasefile={}", paths.leases(bridge).display());
    let _ = writeln!(conf, "pid-file={}", paths.pid(bridge).display());
    for server in &spec.dns_servers {
        if spec.uplink.is_empty() {
            let _ = writeln!(conf, "server={}", server);
        } else {
            let _ = writeln!(conf, "server={}@{}", server, spec.uplink);
        }
    }
    let _ = writeln!(conf, "hostsdir={}", paths.hosts_dir(bridge).display());
    let _ = writeln!(conf, "dhcp-hostsdir={}", paths.dhcp_hosts_dir(bridge).display());
    let _ = writeln!(conf, "interface={}", bridge);
    let _ = writeln!(conf, "listen-address={}", spec.bridge_ip);

    if !spec.ntp_servers.is_empty() {
        let _ = writeln!(conf, "dhcp-option=option:ntp-server,{}", join_ips(&spec.ntp_servers));
    }
    match spec.gateway {
        Some(gateway) => {
            let _ = writeln!(conf, "dhcp-option=option:router,{}", gateway);
        }
        // no default route for isolated instances
        None => {
            let _ = writeln!(conf, "dhcp-option=option:router");
        }
    }
    let _ = writeln!(conf, "dhcp-option=option:dns-server,{}", spec.bridge_ip);

    if let (Some(start), Some(end)) = (spec.dhcp_range.start, spec.dhcp_range.end) {
        let netmask = spec
            .subnet
            .map(|s| s.mask().to_string())
            .unwrap_or_else(|| "255.255.255.0".to_string());
        let _ = writeln!(conf, "dhcp-range={},{},{},{}", start, end, netmask, LEASE_TIME);
    }
    conf
}

fn host_file_name(mac: &str) -> String {
    mac.replace(':', "_")
}

/// dnsmasq-backed lease service.
pub struct Dnsmasq {
    binary: String,
    paths: DnsmasqPaths,
    children: Mutex<HashMap<String, Child>>,
}

impl Dnsmasq {
    pub fn new(binary: &str, run_dir: &Path) -> Self {
        Self {
            binary: binary.to_string(),
            paths: DnsmasqPaths::new(run_dir),
            children: Mutex::new(HashMap::new()),
        }
    }

    /// Kills a dnsmasq left behind by a previous run of the agent.
    fn kill_from_pid_file(&self, bridge: &str) {
        let pid_path = self.paths.pid(bridge);
        let Ok(contents) = std::fs::read_to_string(&pid_path) else {
            return;
        };
        if let Ok(pid) = contents.trim().parse::<i32>() {
            match kill(Pid::from_raw(pid), Signal::SIGTERM) {
                Ok(()) => tracing::info!("Stopped stale dnsmasq {} for {}", pid, bridge),
                Err(e) => tracing::debug!("dnsmasq {} for {} not running: {}", pid, bridge, e),
            }
        }
        let _ = std::fs::remove_file(&pid_path);
    }
}

#[async_trait]
impl LeaseService for Dnsmasq {
    fn create_hosts_dir(&self, bridge: &str, bridge_ip: Option<Ipv4Addr>) -> NetworkResult<()> {
        let dir = self.paths.hosts_dir(bridge);
        std::fs::create_dir_all(&dir)?;
        std::fs::create_dir_all(self.paths.dhcp_hosts_dir(bridge))?;
        if let Some(ip) = bridge_ip {
            std::fs::write(
                dir.join(ROUTER_HOSTNAME),
                format!("{} {}\n", ip, ROUTER_HOSTNAME),
            )?;
        }
        Ok(())
    }

    fn remove_hosts_dir(&self, bridge: &str) -> NetworkResult<()> {
        for dir in [self.paths.hosts_dir(bridge), self.paths.dhcp_hosts_dir(bridge)] {
            match std::fs::remove_dir_all(&dir) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn add_host(
        &self,
        bridge: &str,
        mac: &str,
        ip: Ipv4Addr,
        hostname: &str,
    ) -> NetworkResult<()> {
        let dhcp_dir = self.paths.dhcp_hosts_dir(bridge);
        std::fs::create_dir_all(&dhcp_dir)?;
        std::fs::write(
            dhcp_dir.join(format!("{}.conf", host_file_name(mac))),
            format!("{},{}\n", mac, ip),
        )?;
        if !hostname.is_empty() {
            let hosts_dir = self.paths.hosts_dir(bridge);
            std::fs::create_dir_all(&hosts_dir)?;
            std::fs::write(hosts_dir.join(hostname), format!("{} {}\n", ip, hostname))?;
        }
        Ok(())
    }

    fn remove_host(&self, bridge: &str, mac: &str, hostname: &str) -> NetworkResult<()> {
        let mut paths = vec![self
            .paths
            .dhcp_hosts_dir(bridge)
            .join(format!("{}.conf", host_file_name(mac)))];
        if !hostname.is_empty() {
            paths.push(self.paths.hosts_dir(bridge).join(hostname));
        }
        for path in paths {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn start(&self, spec: &LeaseServiceSpec) -> NetworkResult<()> {
        let bridge = spec.bridge_name.as_str();
        let config_path = self.paths.config(bridge);
        std::fs::write(&config_path, render_config(spec, &self.paths))?;

        let child = Command::new(&self.binary)
            .arg("--keep-in-foreground")
            .arg("-C")
            .arg(&config_path)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| NetworkError::Command {
                cmd: format!("{} -C {}", self.binary, config_path.display()),
                stderr: e.to_string(),
            })?;

        tracing::info!(
            "Started dnsmasq for {} on {} (pid {:?})",
            bridge,
            spec.bridge_ip,
            child.id()
        );
        if let Some(mut previous) = self.children.lock().insert(bridge.to_string(), child) {
            if let Err(e) = previous.start_kill() {
                tracing::warn!("Failed to kill previous dnsmasq for {} (non-fatal): {}", bridge, e);
            }
        }
        Ok(())
    }

    async fn stop(&self, bridge: &str) -> NetworkResult<()> {
        let child = self.children.lock().remove(bridge);
        match child {
            Some(mut child) => {
                child.start_kill()?;
                let status = child.wait().await?;
                tracing::info!("Stopped dnsmasq for {} ({})", bridge, status);
                if let Err(e) = std::fs::remove_file(self.paths.pid(bridge)) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        tracing::warn!("Failed to remove pid file of {} (non-fatal): {}", bridge, e);
                    }
                }
            }
            None => self.kill_from_pid_file(bridge),
        }

        match std::fs::remove_file(self.paths.config(bridge)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn spec() -> LeaseServiceSpec {
        LeaseServiceSpec {
            bridge_name: "bn1".into(),
            bridge_ip: "10.1.0.1".parse().unwrap(),
            subnet: Some("10.1.0.0/24".parse().unwrap()),
            gateway: Some("10.1.0.1".parse().unwrap()),
            dhcp_range: DhcpRange {
                start: Some("10.1.0.2".parse().unwrap()),
                end: Some("10.1.0.100".parse().unwrap()),
            },
            uplink: "eth0".into(),
            dns_servers: vec!["192.168.1.1".parse().unwrap()],
            ntp_servers: vec!["192.168.1.2".parse().unwrap(), "192.168.1.3".parse().unwrap()],
        }
    }

    #[test]
    fn test_render_config() {
        let paths = DnsmasqPaths::new("/run/edgenet");
        let conf = render_config(&spec(), &paths);
        assert!(conf.contains("server=192.168.1.1@eth0\n"));
        assert!(conf.contains("hostsdir=/run/edgenet/hosts.bn1\n"));
        assert!(conf.contains("interface=bn1\n"));
        assert!(conf.contains("dhcp-option=option:ntp-server,192.168.1.2,192.168.1.3\n"));
        assert!(conf.contains("dhcp-option=option:router,10.1.0.1\n"));
        assert!(conf.contains("dhcp-range=10.1.0.2,10.1.0.100,255.255.255.0,10m\n"));
    }

    #[test]
    fn test_render_config_without_gateway_or_uplink() {
        let mut spec = spec();
        spec.gateway = None;
        spec.uplink.clear();
        spec.ntp_servers.clear();
        let conf = render_config(&spec, &DnsmasqPaths::new("/run/edgenet"));
        assert!(conf.contains("dhcp-option=option:router\n"));
        assert!(conf.contains("server=192.168.1.1\n"));
        assert!(!conf.contains("ntp-server"));
    }

    #[test]
    fn test_hosts_dir_lifecycle() {
        let tmp = TempDir::new().unwrap();
        let dnsmasq = Dnsmasq::new("dnsmasq", tmp.path());
        dnsmasq
            .create_hosts_dir("bn1", Some("10.1.0.1".parse().unwrap()))
            .unwrap();
        let router = std::fs::read_to_string(tmp.path().join("hosts.bn1/router")).unwrap();
        assert_eq!(router, "10.1.0.1 router\n");

        dnsmasq
            .add_host("bn1", "aa:bb:cc:dd:ee:01", "10.1.0.2".parse().unwrap(), "web")
            .unwrap();
        let lease =
            std::fs::read_to_string(tmp.path().join("dhcp-hosts.bn1/aa_bb_cc_dd_ee_01.conf"))
                .unwrap();
        assert_eq!(lease, "aa:bb:cc:dd:ee:01,10.1.0.2\n");
        assert!(tmp.path().join("hosts.bn1/web").exists());

        dnsmasq.remove_host("bn1", "aa:bb:cc:dd:ee:01", "web").unwrap();
        assert!(!tmp.path().join("hosts.bn1/web").exists());

        dnsmasq.remove_hosts_dir("bn1").unwrap();
        assert!(!tmp.path().join("hosts.bn1").exists());
        dnsmasq.remove_hosts_dir("bn1").unwrap();
    }

    #[tokio::test]
    async fn test_stop_without_process_is_ok() {
        let tmp = TempDir::new().unwrap();
        let dnsmasq = Dnsmasq::new("dnsmasq", tmp.path());
        dnsmasq.stop("bn9").await.unwrap();
    }

    #[tokio::test]
    async fn test_start_replaces_previous_process() {
        let tmp = TempDir::new().unwrap();
        let dnsmasq = Dnsmasq::new("true", tmp.path());
        dnsmasq.start(&spec()).await.unwrap();
        dnsmasq.start(&spec()).await.unwrap();
        assert_eq!(dnsmasq.children.lock().len(), 1);

        dnsmasq.stop("bn1").await.unwrap();
        assert!(dnsmasq.children.lock().is_empty());
        assert!(!tmp.path().join("dnsmasq.bn1.conf").exists());
    }
}
