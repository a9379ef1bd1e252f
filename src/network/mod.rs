//! Connectivity monitoring.
//!
//! A [`NetworkMonitor`] runs its probes in order, each under the configured
//! timeout. The first probe that succeeds makes the host online. Timeouts
//! and probe errors are reported as `is_online = false` with `error` set;
//! a check never fails and never blocks past `probes * timeout`.

pub mod probe;

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::{NetworkConfig, ProbeMethod};

pub use probe::{ConnectivityProbe, DnsProbe, HttpProbe};

/// Outcome of one connectivity check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkCheckResult {
    /// At least one probe succeeded.
    pub is_online: bool,
    /// Wall time of the whole check.
    pub latency_ms: u64,
    /// Probe that decided the result (`dns`, `http`, or `none`).
    pub method: String,
    /// Every probe failure, joined, when offline.
    pub error: Option<String>,
    /// When the check finished.
    pub checked_at: DateTime<Utc>,
}

/// A periodic check together with the previous periodic verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    /// The new check.
    pub result: NetworkCheckResult,
    /// Online flag of the previous periodic check, if there was one.
    pub previous_online: Option<bool>,
}

impl Observation {
    /// Online before, offline now.
    pub fn went_offline(&self) -> bool {
        self.previous_online == Some(true) && !self.result.is_online
    }

    /// The online flag differs from the previous periodic check.
    pub fn changed(&self) -> bool {
        self.previous_online != Some(self.result.is_online)
    }
}

#[derive(Debug, Default)]
struct MonitorState {
    last_check: Option<NetworkCheckResult>,
    last_periodic_online: Option<bool>,
}

/// Connectivity monitor.
pub struct NetworkMonitor {
    probes: Vec<Arc<dyn ConnectivityProbe>>,
    timeout: Duration,
    state: Mutex<MonitorState>,
}

impl std::fmt::Debug for NetworkMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkMonitor")
            .field("probes", &self.probes.iter().map(|p| p.name()).collect::<Vec<_>>())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl NetworkMonitor {
    /// Create a monitor over explicit probes.
    pub fn new(probes: Vec<Arc<dyn ConnectivityProbe>>, timeout: Duration) -> Self {
        Self {
            probes,
            timeout,
            state: Mutex::new(MonitorState::default()),
        }
    }

    /// Build the probes named by `config.probe_method`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn from_config(config: &NetworkConfig) -> anyhow::Result<Self> {
        let timeout = Duration::from_millis(config.probe_timeout_ms);
        let dns = || -> Arc<dyn ConnectivityProbe> { Arc::new(DnsProbe::new(config.dns_host.clone())) };
        let probes: Vec<Arc<dyn ConnectivityProbe>> = match config.probe_method {
            ProbeMethod::Dns => vec![dns()],
            ProbeMethod::Http => vec![Arc::new(HttpProbe::new(&config.probe_url, timeout)?)],
            ProbeMethod::DnsThenHttp => vec![
                dns(),
                Arc::new(HttpProbe::new(&config.probe_url, timeout)?),
            ],
        };
        Ok(Self::new(probes, timeout))
    }

    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            warn!("network monitor lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Run the probes once (on demand). Updates `last_check` only.
    pub async fn check(&self) -> NetworkCheckResult {
        let result = self.run_probes().await;
        self.lock().last_check = Some(result.clone());
        result
    }

    /// Run the probes for the periodic loop and report the online edge.
    pub async fn observe(&self) -> Observation {
        let result = self.run_probes().await;
        let mut state = self.lock();
        let previous_online = state.last_periodic_online.replace(result.is_online);
        state.last_check = Some(result.clone());
        Observation {
            result,
            previous_online,
        }
    }

    /// Most recent check, periodic or on demand.
    pub fn last_check(&self) -> Option<NetworkCheckResult> {
        self.lock().last_check.clone()
    }

    async fn run_probes(&self) -> NetworkCheckResult {
        let started = Instant::now();
        let mut failures = Vec::new();

        for probe in &self.probes {
            match tokio::time::timeout(self.timeout, probe.probe()).await {
                Ok(Ok(())) => {
                    debug!(method = probe.name(), "connectivity probe succeeded");
                    return NetworkCheckResult {
                        is_online: true,
                        latency_ms: elapsed_ms(started),
                        method: probe.name().to_owned(),
                        error: None,
                        checked_at: Utc::now(),
                    };
                }
                Ok(Err(e)) => failures.push(format!("{}: {e:#}", probe.name())),
                Err(_) => failures.push(format!(
                    "{}: timed out after {}ms",
                    probe.name(),
                    self.timeout.as_millis()
                )),
            }
        }

        if failures.is_empty() {
            failures.push("no connectivity probes configured".to_owned());
        }
        let method = self.probes.last().map_or("none", |p| p.name());
        NetworkCheckResult {
            is_online: false,
            latency_ms: elapsed_ms(started),
            method: method.to_owned(),
            error: Some(failures.join("; ")),
            checked_at: Utc::now(),
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
