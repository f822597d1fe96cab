// Forwarding ACLs for network instances and the apps attached to them.

use crate::network::conntrack::ConntrackManager;
use crate::network::error::{NetworkError, NetworkResult};
use crate::types::{NetworkInstanceType, ReprogramReason};
use crate::utils::command::CommandExecutor;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use uuid::Uuid;

/// App interface an ACL set is scoped to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppAclTarget {
    pub app: Uuid,
    pub vif_name: String,
    pub ip: Option<Ipv4Addr>,
}

/// Inputs to the ACL compiler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AclArgs {
    pub bridge_name: String,
    pub bridge_ip: Option<Ipv4Addr>,
    pub kind: NetworkInstanceType,
    pub uplinks: Vec<String>,
    /// `None` for instance-level rules
    pub app: Option<AppAclTarget>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AclRule {
    pub chain: String,
    pub spec: Vec<String>,
}

impl AclRule {
    fn new(chain: &str, spec: &[&str]) -> Self {
        Self {
            chain: chain.to_string(),
            spec: spec.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[async_trait]
pub trait AclProgrammer: Send + Sync {
    /// Installs the rules for `args` and returns what was installed.
    async fn apply_rules(&self, args: &AclArgs) -> NetworkResult<Vec<AclRule>>;

    /// Removes the rules for `args` and returns what was removed.
    async fn remove_rules(&self, args: &AclArgs) -> NetworkResult<Vec<AclRule>>;

    /// Re-derives an app's rules after something other than the app itself
    /// changed, then purges the app's tracked flows.
    async fn reprogram_app(&self, args: &AclArgs, reason: &ReprogramReason) -> NetworkResult<()> {
        let rules = self.apply_rules(args).await?;
        if let Some(ip) = args.app.as_ref().and_then(|target| target.ip) {
            ConntrackManager::flush_for_ip(ip).await;
        }
        tracing::info!(
            "Reprogrammed {} ACL rules on {} ({})",
            rules.len(),
            args.bridge_name,
            reason
        );
        Ok(())
    }
}

/// Builds the rule list for an instance or an app attachment.
pub fn compile_rules(args: &AclArgs) -> Vec<AclRule> {
    let bridge = args.bridge_name.as_str();
    let mut rules = Vec::new();

    match &args.app {
        None => {
            rules.push(AclRule::new("FORWARD", &["-i", bridge, "-o", bridge, "-j", "ACCEPT"]));
            if args.kind != NetworkInstanceType::Switch {
                rules.push(AclRule::new(
                    "INPUT",
                    &["-i", bridge, "-p", "udp", "--dport", "67", "-j", "ACCEPT"],
                ));
                rules.push(AclRule::new(
                    "INPUT",
                    &["-i", bridge, "-p", "udp", "--dport", "53", "-j", "ACCEPT"],
                ));
                if let Some(ip) = args.bridge_ip {
                    let dest = ip.to_string();
                    rules.push(AclRule::new(
                        "INPUT",
                        &["-i", bridge, "-d", &dest, "-p", "tcp", "--dport", "80", "-j", "ACCEPT"],
                    ));
                }
            }
            for uplink in &args.uplinks {
                rules.push(AclRule::new(
                    "FORWARD",
                    &[
                        "-i", uplink, "-o", bridge, "-m", "conntrack", "--ctstate",
                        "RELATED,ESTABLISHED", "-j", "ACCEPT",
                    ],
                ));
            }
        }
        Some(target) => {
            let source = match target.ip {
                Some(ip) => ip.to_string(),
                None => return rules,
            };
            for uplink in &args.uplinks {
                rules.push(AclRule::new(
                    "FORWARD",
                    &["-i", bridge, "-s", &source, "-o", uplink, "-j", "ACCEPT"],
                ));
            }
        }
    }
    rules
}

/// iptables-backed ACL programmer. Remembers what it installed per app so
/// a reprogram removes rules bound to a previous uplink.
#[derive(Default)]
pub struct IptablesAcl {
    installed: Mutex<HashMap<(String, Uuid), Vec<AclRule>>>,
}

impl IptablesAcl {
    pub fn new() -> Self {
        Self::default()
    }

    async fn iptables(op: &str, rule: &AclRule) -> NetworkResult<bool> {
        let mut args: Vec<&str> = vec![op, rule.chain.as_str()];
        args.extend(rule.spec.iter().map(String::as_str));
        let result = CommandExecutor::execute("iptables", &args).await?;
        if op == "-C" {
            return Ok(result.success);
        }
        if !result.success {
            return Err(NetworkError::Acl(format!(
                "{}: {}",
                CommandExecutor::render("iptables", &args),
                result.stderr.trim()
            )));
        }
        Ok(true)
    }

    async fn install(rules: &[AclRule]) -> NetworkResult<()> {
        for rule in rules {
            if !Self::iptables("-C", rule).await? {
                Self::iptables("-A", rule).await?;
            }
        }
        Ok(())
    }

    async fn uninstall(rules: &[AclRule]) -> NetworkResult<()> {
        let mut first_err = None;
        for rule in rules {
            let result = match Self::iptables("-C", rule).await {
                Ok(true) => Self::iptables("-D", rule).await.map(|_| ()),
                Ok(false) => Ok(()),
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                tracing::warn!("Failed to remove ACL rule in {} (non-fatal): {}", rule.chain, e);
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl AclProgrammer for IptablesAcl {
    async fn apply_rules(&self, args: &AclArgs) -> NetworkResult<Vec<AclRule>> {
        let rules = compile_rules(args);
        if let Some(target) = &args.app {
            let key = (args.bridge_name.clone(), target.app);
            let previous = self.installed.lock().remove(&key).unwrap_or_default();
            let stale: Vec<AclRule> = previous
                .into_iter()
                .filter(|rule| !rules.contains(rule))
                .collect();
            if let Err(e) = Self::uninstall(&stale).await {
                tracing::warn!("Stale ACLs for app {} not fully removed (non-fatal): {}", target.app, e);
            }
            Self::install(&rules).await?;
            self.installed.lock().insert(key, rules.clone());
        } else {
            Self::install(&rules).await?;
        }
        tracing::debug!("Applied {} ACL rules on {}", rules.len(), args.bridge_name);
        Ok(rules)
    }

    async fn remove_rules(&self, args: &AclArgs) -> NetworkResult<Vec<AclRule>> {
        let rules = match &args.app {
            Some(target) => self
                .installed
                .lock()
                .remove(&(args.bridge_name.clone(), target.app))
                .unwrap_or_else(|| compile_rules(args)),
            None => compile_rules(args),
        };
        Self::uninstall(&rules).await?;
        tracing::debug!("Removed {} ACL rules from {}", rules.len(), args.bridge_name);
        Ok(rules)
    }
}
