//! Programs a pod's `nat` table from an [`IptablesConfig`].
//!
//! Rules are rendered as an `iptables-restore` document that replaces the whole table, so
//! applying the same config again yields the same rules.

use anyhow::{bail, Context, Result};
use consul_k8s_core::iptables::IptablesConfig;
use ipnet::IpNet;
use std::{fmt::Write, net::IpAddr, process::Stdio};
use tokio::{io::AsyncWriteExt, process::Command};
use tracing::debug;

pub const INBOUND_CHAIN: &str = "CONSUL_PROXY_INBOUND";
pub const INBOUND_REDIRECT_CHAIN: &str = "CONSUL_PROXY_IN_REDIRECT";
pub const OUTPUT_CHAIN: &str = "CONSUL_PROXY_OUTPUT";
pub const OUTPUT_REDIRECT_CHAIN: &str = "CONSUL_PROXY_REDIRECT";
pub const DNS_CHAIN: &str = "CONSUL_DNS_REDIRECT";

const DNS_PORT: u16 = 53;

#[async_trait::async_trait]
pub trait Effector: Send + Sync {
    /// Replaces the redirection rules in the network namespace named by `config.netns`.
    async fn apply(&self, config: &IptablesConfig) -> Result<()>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

/// Runs `iptables-restore` (and `ip6tables-restore` for dual stack pods) inside the pod's
/// network namespace.
#[derive(Clone, Debug)]
pub struct Nsenter {
    dual_stack: bool,
}

// === impl Family ===

impl Family {
    fn restore_bin(self) -> &'static str {
        match self {
            Self::V4 => "iptables-restore",
            Self::V6 => "ip6tables-restore",
        }
    }

    fn loopback(self) -> &'static str {
        match self {
            Self::V4 => "127.0.0.1/32",
            Self::V6 => "::1/128",
        }
    }

    fn matches(self, addr: IpAddr) -> bool {
        matches!(
            (self, addr),
            (Self::V4, IpAddr::V4(_)) | (Self::V6, IpAddr::V6(_))
        )
    }
}

/// Renders the `nat` table for one address family.
///
/// Exclusions of the other family are left out. The config must have been validated.
pub fn render(config: &IptablesConfig, family: Family) -> String {
    let mut chains = vec![
        INBOUND_CHAIN,
        INBOUND_REDIRECT_CHAIN,
        OUTPUT_CHAIN,
        OUTPUT_REDIRECT_CHAIN,
    ];
    let dns = config
        .consul_dns_ip
        .as_deref()
        .and_then(|ip| ip.parse::<IpAddr>().ok())
        .filter(|ip| family.matches(*ip));
    if dns.is_some() {
        chains.push(DNS_CHAIN);
    }

    let mut rules = Vec::new();

    if let Some(ip) = dns {
        let to = match ip {
            IpAddr::V4(ip) => format!("{ip}"),
            IpAddr::V6(ip) => format!("[{ip}]"),
        };
        for proto in ["udp", "tcp"] {
            rules.push(format!(
                "-A {DNS_CHAIN} -p {proto} --dport {DNS_PORT} -j DNAT --to-destination {to}"
            ));
        }
        for proto in ["udp", "tcp"] {
            rules.push(format!("-A OUTPUT -p {proto} --dport {DNS_PORT} -j {DNS_CHAIN}"));
        }
    }

    // Outbound: everything but the proxy's own and loopback traffic goes to the proxy.
    rules.push(format!("-A OUTPUT -p tcp -j {OUTPUT_CHAIN}"));
    for port in &config.exclude_outbound_ports {
        rules.push(format!("-A {OUTPUT_CHAIN} -p tcp --dport {} -j RETURN", port.trim()));
    }
    for cidr in config
        .exclude_outbound_cidrs
        .iter()
        .map(|c| c.trim())
        .filter(|c| cidr_family(c) == Some(family))
    {
        rules.push(format!("-A {OUTPUT_CHAIN} -d {cidr} -j RETURN"));
    }
    for uid in &config.exclude_uids {
        rules.push(format!(
            "-A {OUTPUT_CHAIN} -m owner --uid-owner {} -j RETURN",
            uid.trim()
        ));
    }
    rules.push(format!(
        "-A {OUTPUT_CHAIN} -m owner --uid-owner {} -j RETURN",
        config.proxy_uid.trim()
    ));
    rules.push(format!(
        "-A {OUTPUT_CHAIN} -d {} -j RETURN",
        family.loopback()
    ));
    rules.push(format!("-A {OUTPUT_CHAIN} -j {OUTPUT_REDIRECT_CHAIN}"));
    rules.push(format!(
        "-A {OUTPUT_REDIRECT_CHAIN} -p tcp -j REDIRECT --to-ports {}",
        config.proxy_outbound_port
    ));

    // Inbound: everything but excluded ports goes to the proxy's public listener.
    rules.push(format!("-A PREROUTING -p tcp -j {INBOUND_CHAIN}"));
    for port in &config.exclude_inbound_ports {
        rules.push(format!("-A {INBOUND_CHAIN} -p tcp --dport {} -j RETURN", port.trim()));
    }
    rules.push(format!("-A {INBOUND_CHAIN} -p tcp -j {INBOUND_REDIRECT_CHAIN}"));
    rules.push(format!(
        "-A {INBOUND_REDIRECT_CHAIN} -p tcp -j REDIRECT --to-ports {}",
        config.proxy_inbound_port
    ));

    let mut doc = String::from("*nat\n");
    for builtin in ["PREROUTING", "INPUT", "OUTPUT", "POSTROUTING"] {
        let _ = writeln!(doc, ":{builtin} ACCEPT [0:0]");
    }
    for chain in chains {
        let _ = writeln!(doc, ":{chain} - [0:0]");
    }
    for rule in rules {
        doc.push_str(&rule);
        doc.push('\n');
    }
    doc.push_str("COMMIT\n");
    doc
}

fn cidr_family(cidr: &str) -> Option<Family> {
    let addr = cidr
        .parse::<IpNet>()
        .map(|net| net.addr())
        .or_else(|_| cidr.parse::<IpAddr>())
        .ok()?;
    Some(if addr.is_ipv4() { Family::V4 } else { Family::V6 })
}

// === impl Nsenter ===

impl Nsenter {
    pub fn new(dual_stack: bool) -> Self {
        Self { dual_stack }
    }

    fn families(&self) -> &'static [Family] {
        if self.dual_stack {
            &[Family::V4, Family::V6]
        } else {
            &[Family::V4]
        }
    }
}

#[async_trait::async_trait]
impl Effector for Nsenter {
    async fn apply(&self, config: &IptablesConfig) -> Result<()> {
        config.validate()?;
        if config.netns.is_empty() {
            bail!("no network namespace to apply rules in");
        }

        for family in self.families() {
            let doc = render(config, *family);
            debug!(netns = %config.netns, ?family, rules = %doc, "Restoring nat table");
            restore(&config.netns, family.restore_bin(), &doc).await?;
        }
        Ok(())
    }
}

async fn restore(netns: &str, bin: &str, doc: &str) -> Result<()> {
    let mut child = Command::new("nsenter")
        .arg(format!("--net={netns}"))
        .arg("--")
        .arg(bin)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to spawn {bin}"))?;

    let mut stdin = child.stdin.take().context("stdin must be piped")?;
    stdin.write_all(doc.as_bytes()).await?;
    drop(stdin);

    let output = child.wait_with_output().await?;
    if !output.status.success() {
        bail!(
            "{bin} failed with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}
