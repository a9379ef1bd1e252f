//! Preflight gate chain evaluated before a mode transition commits.
//!
//! Every applicable gate runs; all failures are collected so the operator
//! sees the full reason set at once. Entering QUARANTINE passes
//! unconditionally. The exit-from-QUARANTINE rule is a controller policy,
//! not a gate.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::bundle::Bundle;
use crate::config::LiveConfig;
use crate::network::{NetworkCheckResult, NetworkMonitor};
use crate::types::{BundleStatus, OperationMode};

const DISABLE_IPV6_PATH: &str = "/proc/sys/net/ipv6/conf/all/disable_ipv6";
const PROC_NET_TCP: &str = "/proc/net/tcp";
const PROC_NET_TCP6: &str = "/proc/net/tcp6";
const TCP_LISTEN_STATE: &str = "0A";

// ---------------------------------------------------------------------------
// Gate identity and failures
// ---------------------------------------------------------------------------

/// The four preflight gates, in reporting order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum GateName {
    /// Connectivity required for ONLINE.
    #[serde(rename = "network_gate")]
    Network,
    /// IPv6 egress must be disabled for isolated modes.
    #[serde(rename = "ipv6_gate")]
    Ipv6,
    /// No unauthorized inbound exposure for SOVEREIGN.
    #[serde(rename = "dmz_gate")]
    Dmz,
    /// A trusted bundle for OFFLINE/SOVEREIGN.
    #[serde(rename = "bundle_trust_gate")]
    BundleTrust,
}

impl GateName {
    /// Stable label used in rejections and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network_gate",
            Self::Ipv6 => "ipv6_gate",
            Self::Dmz => "dmz_gate",
            Self::BundleTrust => "bundle_trust_gate",
        }
    }
}

impl std::fmt::Display for GateName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One failed gate and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateFailure {
    /// Which gate.
    pub gate: GateName,
    /// Human-readable reason.
    pub reason: String,
}

impl std::fmt::Display for GateFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.gate, self.reason)
    }
}

/// A proposed transition as seen by the gates.
#[derive(Debug, Clone, Copy)]
pub struct Proposal<'a> {
    /// Mode now.
    pub current: OperationMode,
    /// Mode requested.
    pub target: OperationMode,
    /// Resolved bundle reference, if any.
    pub bundle_id: Option<&'a str>,
    /// The referenced bundle as stored, if it exists.
    pub bundle: Option<&'a Bundle>,
}

/// Outcome of one chain evaluation.
#[derive(Debug, Clone, Default)]
pub struct GateReport {
    /// Every failed gate, in [`GateName`] order.
    pub failures: Vec<GateFailure>,
    /// Connectivity check run by the network gate, if it ran.
    pub network: Option<NetworkCheckResult>,
}

impl GateReport {
    /// No gate failed.
    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Isolation probe
// ---------------------------------------------------------------------------

/// A listening TCP socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ListeningSocket {
    /// Bound address.
    pub address: IpAddr,
    /// Bound port.
    pub port: u16,
}

impl std::fmt::Display for ListeningSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.address {
            IpAddr::V4(a) => write!(f, "{a}:{}", self.port),
            IpAddr::V6(a) => write!(f, "[{a}]:{}", self.port),
        }
    }
}

/// Host isolation facts consumed by the ipv6 and dmz gates.
#[async_trait]
pub trait IsolationProbe: Send + Sync {
    /// Whether IPv6 egress is confirmed disabled.
    async fn ipv6_egress_disabled(&self) -> anyhow::Result<bool>;

    /// Listening sockets that count as unauthorized inbound exposure.
    async fn inbound_exposure(&self) -> anyhow::Result<Vec<ListeningSocket>>;
}

/// Reads isolation facts from procfs, honoring operator attestations.
pub struct SystemIsolationProbe {
    config: LiveConfig,
}

impl SystemIsolationProbe {
    /// Probe driven by the live `[egress]` settings.
    pub fn new(config: LiveConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl IsolationProbe for SystemIsolationProbe {
    async fn ipv6_egress_disabled(&self) -> anyhow::Result<bool> {
        if self.config.snapshot().egress.ipv6_disabled_confirmed {
            return Ok(true);
        }
        match tokio::fs::read_to_string(DISABLE_IPV6_PATH).await {
            Ok(value) => Ok(value.trim() == "1"),
            // No IPv6 stack at all.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
            Err(e) => Err(anyhow::anyhow!("failed to read {DISABLE_IPV6_PATH}: {e}")),
        }
    }

    async fn inbound_exposure(&self) -> anyhow::Result<Vec<ListeningSocket>> {
        let allowed = self.config.snapshot().egress.allowed_inbound_ports;
        let mut exposed = Vec::new();
        for path in [PROC_NET_TCP, PROC_NET_TCP6] {
            let contents = match tokio::fs::read_to_string(path).await {
                Ok(contents) => contents,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(anyhow::anyhow!("failed to read {path}: {e}")),
            };
            exposed.extend(
                parse_listening_sockets(&contents)
                    .into_iter()
                    .filter(|s| is_externally_reachable(s.address) && !allowed.contains(&s.port)),
            );
        }
        Ok(exposed)
    }
}

/// Parse LISTEN entries from `/proc/net/tcp` or `/proc/net/tcp6` contents.
pub fn parse_listening_sockets(contents: &str) -> Vec<ListeningSocket> {
    contents
        .lines()
        .skip(1)
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let _slot = fields.next()?;
            let local = fields.next()?;
            let _remote = fields.next()?;
            let state = fields.next()?;
            if state != TCP_LISTEN_STATE {
                return None;
            }
            let (addr_hex, port_hex) = local.split_once(':')?;
            Some(ListeningSocket {
                address: parse_hex_addr(addr_hex)?,
                port: u16::from_str_radix(port_hex, 16).ok()?,
            })
        })
        .collect()
}

/// Kernel prints each 32-bit word in host (little-endian) order.
fn parse_hex_addr(hex: &str) -> Option<IpAddr> {
    match hex.len() {
        8 => {
            let word = u32::from_str_radix(hex, 16).ok()?;
            Some(IpAddr::V4(Ipv4Addr::from(word.to_le_bytes())))
        }
        32 => {
            let mut bytes = [0_u8; 16];
            for (i, chunk) in bytes.chunks_exact_mut(4).enumerate() {
                let start = i.checked_mul(8)?;
                let end = start.checked_add(8)?;
                let word = u32::from_str_radix(hex.get(start..end)?, 16).ok()?;
                chunk.copy_from_slice(&word.to_le_bytes());
            }
            Some(IpAddr::V6(Ipv6Addr::from(bytes)))
        }
        _ => None,
    }
}

fn is_externally_reachable(address: IpAddr) -> bool {
    match address {
        IpAddr::V4(a) => !a.is_loopback(),
        IpAddr::V6(a) => match a.to_ipv4_mapped() {
            Some(v4) => !v4.is_loopback(),
            None => !a.is_loopback(),
        },
    }
}

// ---------------------------------------------------------------------------
// Chain
// ---------------------------------------------------------------------------

/// The preflight gate chain.
pub struct PreflightGateChain {
    network: Arc<NetworkMonitor>,
    isolation: Arc<dyn IsolationProbe>,
}

impl PreflightGateChain {
    /// Chain over a monitor and an isolation probe.
    pub fn new(network: Arc<NetworkMonitor>, isolation: Arc<dyn IsolationProbe>) -> Self {
        Self { network, isolation }
    }

    /// Evaluate every gate applicable to `proposal`.
    pub async fn evaluate(&self, proposal: &Proposal<'_>) -> GateReport {
        if proposal.target == OperationMode::Quarantine {
            debug!(from = %proposal.current, "entering quarantine, gates bypassed");
            return GateReport::default();
        }

        let (network, ipv6, dmz) = tokio::join!(
            self.network_gate(proposal.target),
            self.ipv6_gate(proposal.target),
            self.dmz_gate(proposal.target),
        );
        let trust = bundle_trust_gate(proposal);

        let (network_failure, network_result) = network;
        let failures: Vec<GateFailure> = [network_failure, ipv6, dmz, trust]
            .into_iter()
            .flatten()
            .collect();

        for failure in &failures {
            warn!(
                gate = failure.gate.as_str(),
                target = %proposal.target,
                reason = %failure.reason,
                "preflight gate failed"
            );
        }

        GateReport {
            failures,
            network: network_result,
        }
    }

    async fn network_gate(
        &self,
        target: OperationMode,
    ) -> (Option<GateFailure>, Option<NetworkCheckResult>) {
        match target {
            OperationMode::Online => {
                let result = self.network.check().await;
                let failure = (!result.is_online).then(|| GateFailure {
                    gate: GateName::Network,
                    reason: format!(
                        "external connectivity unavailable ({})",
                        result.error.as_deref().unwrap_or("probe failed")
                    ),
                });
                (failure, Some(result))
            }
            OperationMode::Offline | OperationMode::Sovereign | OperationMode::Quarantine => {
                (None, None)
            }
        }
    }

    async fn ipv6_gate(&self, target: OperationMode) -> Option<GateFailure> {
        if !target.requires_isolation() {
            return None;
        }
        match self.isolation.ipv6_egress_disabled().await {
            Ok(true) => None,
            Ok(false) => Some(GateFailure {
                gate: GateName::Ipv6,
                reason: "IPv6 egress is not confirmed disabled".to_owned(),
            }),
            Err(e) => Some(GateFailure {
                gate: GateName::Ipv6,
                reason: format!("cannot determine IPv6 egress state: {e:#}"),
            }),
        }
    }

    async fn dmz_gate(&self, target: OperationMode) -> Option<GateFailure> {
        match target {
            OperationMode::Sovereign => {}
            OperationMode::Online | OperationMode::Offline | OperationMode::Quarantine => {
                return None;
            }
        }
        match self.isolation.inbound_exposure().await {
            Ok(exposed) if exposed.is_empty() => None,
            Ok(exposed) => Some(GateFailure {
                gate: GateName::Dmz,
                reason: format!(
                    "unauthorized inbound exposure: {}",
                    exposed
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            }),
            Err(e) => Some(GateFailure {
                gate: GateName::Dmz,
                reason: format!("cannot determine inbound exposure: {e:#}"),
            }),
        }
    }
}

fn bundle_trust_gate(proposal: &Proposal<'_>) -> Option<GateFailure> {
    if !proposal.target.requires_bundle() {
        return None;
    }
    let reason = match (proposal.bundle_id, proposal.bundle) {
        (None, _) => "no bundle specified and no fallback bundle configured".to_owned(),
        (Some(id), None) => format!("bundle {id} not found"),
        (Some(id), Some(bundle)) => match bundle.status {
            BundleStatus::Validated | BundleStatus::Loaded => return None,
            BundleStatus::Pending => format!("bundle {id} has not been validated"),
            BundleStatus::Quarantined => format!(
                "bundle {id} is quarantined: {}",
                bundle.quarantine_reason.as_deref().unwrap_or("no reason recorded")
            ),
            BundleStatus::Failed => format!("bundle {id} failed validation"),
        },
    };
    Some(GateFailure {
        gate: GateName::BundleTrust,
        reason,
    })
}
