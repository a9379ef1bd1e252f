//! Shared fixtures: on-disk bundles, scripted probes, a switchable audit
//! sink, and a fully wired service over a temp directory.

#![allow(dead_code)]

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use sovereign::audit::AuditLog;
use sovereign::bundle::registry::BundleRegistry;
use sovereign::bundle::store::BundleStore;
use sovereign::bundle::validator::sha256_bytes;
use sovereign::config::{GovernanceConfig, LiveConfig};
use sovereign::governance::gates::ListeningSocket;
use sovereign::governance::{GovernanceEvent, GovernanceObserver, IsolationProbe, ObserverSet};
use sovereign::network::{ConnectivityProbe, NetworkMonitor};
use sovereign::service::{ServiceDeps, SovereignService};
use sovereign::signals::GovernanceSignals;

pub const SIGNER: &str = "release-team@example.org";

/// Write `<root>/<id>/{model.bin,manifest.json}` with a matching digest.
pub fn write_bundle(root: &Path, id: &str, artifact: &[u8], signer: Option<&str>) -> PathBuf {
    let dir = root.join(id);
    std::fs::create_dir_all(&dir).expect("should create bundle dir");
    std::fs::write(dir.join("model.bin"), artifact).expect("should write artifact");
    let manifest = serde_json::json!({
        "name": id,
        "version": "1.0.0",
        "model_type": "llm",
        "model_size": "7b",
        "artifact": "model.bin",
        "artifact_sha256": sha256_bytes(artifact),
        "capabilities": ["chat"],
        "requirements": { "min_ram_gb": 8 },
        "signer": signer,
    });
    std::fs::write(
        dir.join("manifest.json"),
        serde_json::to_vec_pretty(&manifest).expect("should serialize manifest"),
    )
    .expect("should write manifest");
    dir
}

/// Overwrite a bundle's artifact without touching its manifest.
pub fn tamper_artifact(root: &Path, id: &str) {
    std::fs::write(root.join(id).join("model.bin"), b"tampered weights").expect("should tamper artifact");
}

/// Connectivity probe whose answer the test controls.
#[derive(Debug)]
pub struct ScriptedProbe {
    online: AtomicBool,
}

impl ScriptedProbe {
    pub fn new(online: bool) -> Arc<Self> {
        Arc::new(Self {
            online: AtomicBool::new(online),
        })
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConnectivityProbe for ScriptedProbe {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn probe(&self) -> anyhow::Result<()> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            anyhow::bail!("scripted outage")
        }
    }
}

/// Isolation facts the test controls.
#[derive(Debug)]
pub struct StaticIsolation {
    ipv6_disabled: AtomicBool,
    exposed: Mutex<Vec<ListeningSocket>>,
}

impl StaticIsolation {
    pub fn isolated() -> Arc<Self> {
        Arc::new(Self {
            ipv6_disabled: AtomicBool::new(true),
            exposed: Mutex::new(Vec::new()),
        })
    }

    pub fn set_ipv6_disabled(&self, disabled: bool) {
        self.ipv6_disabled.store(disabled, Ordering::SeqCst);
    }

    pub fn expose(&self, socket: ListeningSocket) {
        self.exposed.lock().expect("test lock").push(socket);
    }
}

#[async_trait]
impl IsolationProbe for StaticIsolation {
    async fn ipv6_egress_disabled(&self) -> anyhow::Result<bool> {
        Ok(self.ipv6_disabled.load(Ordering::SeqCst))
    }

    async fn inbound_exposure(&self) -> anyhow::Result<Vec<ListeningSocket>> {
        Ok(self.exposed.lock().expect("test lock").clone())
    }
}

/// Audit sink that starts failing when the switch is flipped.
pub struct SwitchWriter {
    pub fail: Arc<AtomicBool>,
}

impl Write for SwitchWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(std::io::Error::other("disk full"));
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Observer recording every event.
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<GovernanceEvent>>,
}

impl Recorder {
    pub fn events(&self) -> Vec<GovernanceEvent> {
        self.events.lock().expect("test lock").clone()
    }
}

impl GovernanceObserver for Recorder {
    fn on_event(&self, event: &GovernanceEvent) {
        self.events.lock().expect("test lock").push(event.clone());
    }
}

/// Fully wired service over a temp directory.
pub struct Harness {
    pub service: Arc<SovereignService>,
    pub registry: Arc<BundleRegistry>,
    pub audit: Arc<AuditLog>,
    pub probe: Arc<ScriptedProbe>,
    pub isolation: Arc<StaticIsolation>,
    pub recorder: Arc<Recorder>,
    pub fail_audit: Arc<AtomicBool>,
    pub bundles_dir: PathBuf,
    _tmp: tempfile::TempDir,
}

/// Config used by most tests: unsigned bundles allowed, fallback enabled.
pub fn test_config() -> GovernanceConfig {
    let mut config = GovernanceConfig::default();
    config.trust.allow_unsigned_bundles = true;
    config.fallback.fallback_to_offline = true;
    config.network.auto_detect = true;
    config
}

pub async fn harness(config: GovernanceConfig) -> Harness {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let bundles_dir = tmp.path().join("bundles");
    std::fs::create_dir_all(&bundles_dir).expect("should create bundles dir");

    let store = BundleStore::open(&tmp.path().join("state.db"))
        .await
        .expect("should open state db");
    let live = LiveConfig::new(config);
    let signals = GovernanceSignals::new().expect("should register signals");
    let registry = Arc::new(BundleRegistry::new(
        store,
        bundles_dir.clone(),
        live.clone(),
        signals.clone(),
    ));

    let fail_audit = Arc::new(AtomicBool::new(false));
    let audit = Arc::new(AuditLog::from_writer(Box::new(SwitchWriter {
        fail: Arc::clone(&fail_audit),
    })));

    let probe = ScriptedProbe::new(true);
    let monitor = Arc::new(NetworkMonitor::new(
        vec![Arc::clone(&probe) as Arc<dyn ConnectivityProbe>],
        Duration::from_millis(500),
    ));
    let isolation = StaticIsolation::isolated();
    let recorder = Arc::new(Recorder::default());

    let service = Arc::new(SovereignService::new(ServiceDeps {
        config: live,
        registry: Arc::clone(&registry),
        audit: Arc::clone(&audit),
        monitor,
        isolation: Arc::clone(&isolation) as Arc<dyn IsolationProbe>,
        observers: ObserverSet::new(vec![Arc::clone(&recorder) as Arc<dyn GovernanceObserver>]),
        signals,
    }));

    Harness {
        service,
        registry,
        audit,
        probe,
        isolation,
        recorder,
        fail_audit,
        bundles_dir,
        _tmp: tmp,
    }
}

impl Harness {
    /// Write a bundle and register it through discovery.
    pub async fn add_bundle(&self, id: &str) {
        write_bundle(&self.bundles_dir, id, format!("weights for {id}").as_bytes(), Some(SIGNER));
        self.service.discover().await.expect("discovery should succeed");
    }

    /// Write, discover, and validate a bundle.
    pub async fn add_validated_bundle(&self, id: &str) {
        self.add_bundle(id).await;
        self.service
            .validate(id, false)
            .await
            .expect("validation should run");
    }

    pub fn break_audit(&self) {
        self.fail_audit.store(true, Ordering::SeqCst);
    }

    pub fn heal_audit(&self) {
        self.fail_audit.store(false, Ordering::SeqCst);
    }
}
