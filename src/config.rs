//! Configuration loading, validation, and runtime patching.
//!
//! `sovereign.toml` is human-owned. Every section carries `#[serde(default)]`
//! so a minimal or empty file is valid. Precedence: env vars > config file >
//! defaults. Runtime changes go through [`ConfigPatch`] and are validated
//! before they replace the live configuration.

use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, RwLock};

use anyhow::Context;
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

/// Domain allowlist entries: plain hostnames or a leading `*.` wildcard.
static DOMAIN_PATTERN: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^(\*\.)?([a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?\.)+[a-z]{2,63}$").ok()
});

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level governance configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernanceConfig {
    /// Connectivity monitor settings.
    pub network: NetworkConfig,
    /// Bundle trust policy.
    pub trust: TrustConfig,
    /// Egress guard flags and isolation attestations.
    pub egress: EgressConfig,
    /// Fallback policy when connectivity drops.
    pub fallback: FallbackConfig,
    /// Optional audit event classes.
    pub audit: AuditConfig,
    /// Override limits.
    pub overrides: OverrideConfig,
    /// Filesystem layout.
    pub paths: PathsConfig,
}

/// How connectivity is probed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeMethod {
    /// Resolve `dns_host` only.
    Dns,
    /// Issue a HEAD request to `probe_url` only.
    Http,
    /// DNS first, then HTTP if DNS fails.
    DnsThenHttp,
}

/// Network monitor settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Run periodic checks at all.
    pub enabled: bool,
    /// Let periodic checks trigger fallback transitions.
    pub auto_detect: bool,
    /// Seconds between periodic checks.
    pub check_interval_secs: u64,
    /// Upper bound for a single probe, in milliseconds.
    pub probe_timeout_ms: u64,
    /// Probe strategy.
    pub probe_method: ProbeMethod,
    /// Host (with port) resolved by the DNS probe.
    pub dns_host: String,
    /// URL requested by the HTTP probe.
    pub probe_url: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_detect: true,
            check_interval_secs: default_check_interval_secs(),
            probe_timeout_ms: default_probe_timeout_ms(),
            probe_method: ProbeMethod::DnsThenHttp,
            dns_host: "one.one.one.one:443".to_owned(),
            probe_url: "https://www.cloudflare.com/cdn-cgi/trace".to_owned(),
        }
    }
}

/// Bundle trust policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustConfig {
    /// Require signer identity unless unsigned bundles are allowed.
    pub strict_validation: bool,
    /// Accept bundles without a signer even under strict validation.
    pub allow_unsigned_bundles: bool,
    /// Quarantine (instead of fail) bundles that fail validation.
    pub quarantine_on_failure: bool,
    /// Upper bound for one bundle validation, in seconds.
    pub validation_timeout_secs: u64,
    /// Read size used when streaming artifacts through the digest.
    pub chunk_size_bytes: usize,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            strict_validation: true,
            allow_unsigned_bundles: false,
            quarantine_on_failure: true,
            validation_timeout_secs: default_validation_timeout_secs(),
            chunk_size_bytes: default_chunk_size_bytes(),
        }
    }
}

/// Egress guard flags consumed by the platform's outbound layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EgressConfig {
    /// Block outbound HTTP outside online mode.
    pub block_external_http: bool,
    /// Block outbound DNS outside online mode.
    pub block_external_dns: bool,
    /// Domains still reachable when egress is blocked.
    pub allowed_domains: Vec<String>,
    /// Operator attestation that IPv6 egress is disabled upstream.
    pub ipv6_disabled_confirmed: bool,
    /// Listening ports that do not count as unauthorized inbound exposure.
    pub allowed_inbound_ports: Vec<u16>,
}

/// Fallback policy for connectivity loss.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    /// Switch to offline automatically when connectivity drops.
    pub fallback_to_offline: bool,
    /// Bundle loaded when no bundle is named explicitly.
    pub fallback_bundle_id: Option<String>,
}

/// Optional audit event classes. Governance decisions are always logged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Record every bundle validation.
    pub log_validations: bool,
    /// Record discovery runs.
    pub log_discovery: bool,
    /// Record periodic network checks that change the online flag.
    pub log_network_checks: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            log_validations: true,
            log_discovery: true,
            log_network_checks: true,
        }
    }
}

/// Override limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverrideConfig {
    /// Longest TTL accepted by `begin_override`.
    pub max_ttl_secs: u64,
}

impl Default for OverrideConfig {
    fn default() -> Self {
        Self {
            max_ttl_secs: default_max_override_ttl_secs(),
        }
    }
}

/// Filesystem layout. Unset entries resolve under `data_dir`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Root state directory (`~/.sovereign` by default).
    pub data_dir: PathBuf,
    /// Bundle storage scanned by discovery.
    pub bundles_dir: Option<PathBuf>,
    /// SQLite database holding bundle rows.
    pub state_db: Option<PathBuf>,
    /// Hash-chained audit log (JSONL).
    pub audit_log: Option<PathBuf>,
    /// Rotated process logs.
    pub logs_dir: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: config_dir().unwrap_or_else(|_| PathBuf::from(".sovereign")),
            bundles_dir: None,
            state_db: None,
            audit_log: None,
            logs_dir: None,
        }
    }
}

/// Fully resolved filesystem paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimePaths {
    /// Root state directory.
    pub data_dir: PathBuf,
    /// Bundle storage.
    pub bundles_dir: PathBuf,
    /// SQLite state database.
    pub state_db: PathBuf,
    /// Audit log file.
    pub audit_log: PathBuf,
    /// Process log directory.
    pub logs_dir: PathBuf,
}

impl PathsConfig {
    /// Resolve unset paths relative to `data_dir`.
    pub fn resolve(&self) -> RuntimePaths {
        let root = &self.data_dir;
        RuntimePaths {
            data_dir: root.clone(),
            bundles_dir: self
                .bundles_dir
                .clone()
                .unwrap_or_else(|| root.join("bundles")),
            state_db: self
                .state_db
                .clone()
                .unwrap_or_else(|| root.join("state.db")),
            audit_log: self
                .audit_log
                .clone()
                .unwrap_or_else(|| root.join("audit.jsonl")),
            logs_dir: self.logs_dir.clone().unwrap_or_else(|| root.join("logs")),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl GovernanceConfig {
    /// Load with precedence env vars > file > defaults, then validate.
    ///
    /// `path` wins over `$SOVEREIGN_CONFIG_PATH`, which wins over
    /// `~/.sovereign/sovereign.toml`. A missing file yields defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if the
    /// merged configuration fails validation.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        Self::load_with(path, |key| std::env::var(key).ok())
    }

    /// [`Self::load`] with a custom env resolver.
    ///
    /// # Errors
    ///
    /// See [`Self::load`].
    pub fn load_with(path: Option<&Path>, env: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_path_with(&env)?,
        };
        let mut config = Self::load_from_file(&path)?;
        config.apply_overrides(&env);
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML string into config without env overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is malformed.
    pub fn from_toml(toml_str: &str) -> anyhow::Result<Self> {
        toml::from_str(toml_str).context("failed to parse governance config TOML")
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading governance config");
                Self::from_toml(&contents)
                    .with_context(|| format!("invalid config at {}", path.display()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no config file found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(anyhow::anyhow!(
                "failed to read config at {}: {e}",
                path.display()
            )),
        }
    }

    /// Resolve the config file path using a custom env resolver.
    ///
    /// # Errors
    ///
    /// Returns an error if the home directory cannot be determined.
    pub fn config_path_with(env: impl Fn(&str) -> Option<String>) -> anyhow::Result<PathBuf> {
        if let Some(p) = env("SOVEREIGN_CONFIG_PATH") {
            return Ok(PathBuf::from(p));
        }
        Ok(config_dir()?.join("sovereign.toml"))
    }

    /// Apply environment variable overrides.
    ///
    /// Takes a resolver function so tests never touch the process environment.
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("SOVEREIGN_DATA_DIR") {
            self.paths.data_dir = PathBuf::from(v);
        }
        if let Some(v) = env("SOVEREIGN_BUNDLES_DIR") {
            self.paths.bundles_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = env("SOVEREIGN_STATE_DB") {
            self.paths.state_db = Some(PathBuf::from(v));
        }
        if let Some(v) = env("SOVEREIGN_AUDIT_LOG") {
            self.paths.audit_log = Some(PathBuf::from(v));
        }
        if let Some(v) = env("SOVEREIGN_PROBE_URL") {
            self.network.probe_url = v;
        }
        if let Some(v) = env("SOVEREIGN_FALLBACK_BUNDLE") {
            self.fallback.fallback_bundle_id = non_empty(v);
        }
        if let Some(v) = env("SOVEREIGN_STRICT_VALIDATION") {
            match v.parse() {
                Ok(b) => self.trust.strict_validation = b,
                Err(_) => tracing::warn!(
                    var = "SOVEREIGN_STRICT_VALIDATION",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
        if let Some(v) = env("SOVEREIGN_CHECK_INTERVAL_SECS") {
            match v.parse() {
                Ok(n) => self.network.check_interval_secs = n,
                Err(_) => tracing::warn!(
                    var = "SOVEREIGN_CHECK_INTERVAL_SECS",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
    }

    /// Validate that configuration values are within sane bounds.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first offending setting.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.network.check_interval_secs >= 5,
            "network.check_interval_secs must be >= 5"
        );
        anyhow::ensure!(
            (100..=60_000).contains(&self.network.probe_timeout_ms),
            "network.probe_timeout_ms must be in [100, 60000]"
        );
        anyhow::ensure!(
            self.network.dns_host.contains(':'),
            "network.dns_host must be host:port"
        );
        let url = Url::parse(&self.network.probe_url)
            .with_context(|| format!("network.probe_url is not a URL: {}", self.network.probe_url))?;
        anyhow::ensure!(
            url.scheme() == "http" || url.scheme() == "https",
            "network.probe_url must use http or https"
        );
        anyhow::ensure!(
            self.trust.validation_timeout_secs >= 1,
            "trust.validation_timeout_secs must be >= 1"
        );
        anyhow::ensure!(
            (4_096..=16_777_216).contains(&self.trust.chunk_size_bytes),
            "trust.chunk_size_bytes must be in [4096, 16777216]"
        );
        anyhow::ensure!(
            self.overrides.max_ttl_secs >= 1,
            "overrides.max_ttl_secs must be >= 1"
        );
        for domain in &self.egress.allowed_domains {
            anyhow::ensure!(
                is_valid_domain(domain),
                "egress.allowed_domains contains invalid entry: {domain}"
            );
        }
        if let Some(id) = &self.fallback.fallback_bundle_id {
            anyhow::ensure!(
                !id.trim().is_empty(),
                "fallback.fallback_bundle_id must not be blank"
            );
        }
        Ok(())
    }
}

/// Check an allowlist entry against the accepted domain syntax.
pub fn is_valid_domain(domain: &str) -> bool {
    match DOMAIN_PATTERN.as_ref() {
        Some(re) => re.is_match(&domain.to_ascii_lowercase()),
        None => false,
    }
}

/// Resolve the default config directory (`~/.sovereign/`).
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn config_dir() -> anyhow::Result<PathBuf> {
    let home = directories::BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
    Ok(home.home_dir().join(".sovereign"))
}

/// Load `KEY=value` pairs from `<data_dir>/.env` into a resolver map.
///
/// Missing file yields an empty map.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be parsed.
pub fn load_env_file(path: &Path) -> anyhow::Result<std::collections::BTreeMap<String, String>> {
    let mut vars = std::collections::BTreeMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let iter = dotenvy::from_path_iter(path)
        .with_context(|| format!("failed to read env file at {}", path.display()))?;
    for item in iter {
        let (key, value) =
            item.with_context(|| format!("malformed entry in env file {}", path.display()))?;
        vars.insert(key, value);
    }
    Ok(vars)
}

// ---------------------------------------------------------------------------
// Live config
// ---------------------------------------------------------------------------

/// Shared, patchable view of the configuration.
///
/// Readers take a snapshot; writers replace the whole value after validation.
#[derive(Debug, Clone)]
pub struct LiveConfig {
    inner: Arc<RwLock<GovernanceConfig>>,
}

impl LiveConfig {
    /// Wrap an already validated configuration.
    pub fn new(config: GovernanceConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    /// Clone the current configuration.
    pub fn snapshot(&self) -> GovernanceConfig {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => {
                tracing::warn!("live config lock poisoned, recovering");
                poisoned.into_inner().clone()
            }
        }
    }

    /// Apply `patch` to a copy, validate it, and swap it in.
    ///
    /// Returns the changed field names and the previous configuration.
    ///
    /// # Errors
    ///
    /// Returns an error (and leaves the live value untouched) if the patched
    /// configuration fails validation.
    pub fn apply(&self, patch: &ConfigPatch) -> anyhow::Result<(Vec<&'static str>, GovernanceConfig)> {
        let mut guard = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("live config lock poisoned, recovering");
                poisoned.into_inner()
            }
        };
        let previous = guard.clone();
        let mut next = previous.clone();
        let changed = patch.apply_to(&mut next);
        next.validate().context("patched configuration is invalid")?;
        *guard = next;
        Ok((changed, previous))
    }

    /// Replace the configuration wholesale (used to revert a patch).
    pub fn replace(&self, config: GovernanceConfig) {
        match self.inner.write() {
            Ok(mut guard) => *guard = config,
            Err(poisoned) => *poisoned.into_inner() = config,
        }
    }
}

// ---------------------------------------------------------------------------
// Runtime patching
// ---------------------------------------------------------------------------

/// Partial update for the live configuration. `None` leaves a field unchanged.
///
/// `fallback_bundle_id = Some("")` clears the fallback bundle.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConfigPatch {
    /// `network.enabled`.
    pub network_enabled: Option<bool>,
    /// `network.auto_detect`.
    pub auto_detect_network: Option<bool>,
    /// `network.check_interval_secs`.
    pub network_check_interval_secs: Option<u64>,
    /// `trust.strict_validation`.
    pub strict_validation: Option<bool>,
    /// `trust.allow_unsigned_bundles`.
    pub allow_unsigned_bundles: Option<bool>,
    /// `trust.quarantine_on_failure`.
    pub quarantine_on_failure: Option<bool>,
    /// `egress.block_external_http`.
    pub block_external_http: Option<bool>,
    /// `egress.block_external_dns`.
    pub block_external_dns: Option<bool>,
    /// `egress.allowed_domains` (replaces the list).
    pub allowed_domains: Option<Vec<String>>,
    /// `fallback.fallback_to_offline`.
    pub fallback_to_offline: Option<bool>,
    /// `fallback.fallback_bundle_id`; empty string clears it.
    pub fallback_bundle_id: Option<String>,
    /// `audit.log_validations`.
    pub log_validations: Option<bool>,
    /// `audit.log_discovery`.
    pub log_discovery: Option<bool>,
    /// `audit.log_network_checks`.
    pub log_network_checks: Option<bool>,
}

impl ConfigPatch {
    /// Apply onto `config`, returning the names of fields that were set.
    pub fn apply_to(&self, config: &mut GovernanceConfig) -> Vec<&'static str> {
        let mut changed = Vec::new();

        macro_rules! set {
            ($field:ident => $target:expr) => {
                if let Some(v) = &self.$field {
                    $target = v.clone();
                    changed.push(stringify!($field));
                }
            };
        }

        set!(network_enabled => config.network.enabled);
        set!(auto_detect_network => config.network.auto_detect);
        set!(network_check_interval_secs => config.network.check_interval_secs);
        set!(strict_validation => config.trust.strict_validation);
        set!(allow_unsigned_bundles => config.trust.allow_unsigned_bundles);
        set!(quarantine_on_failure => config.trust.quarantine_on_failure);
        set!(block_external_http => config.egress.block_external_http);
        set!(block_external_dns => config.egress.block_external_dns);
        set!(allowed_domains => config.egress.allowed_domains);
        set!(fallback_to_offline => config.fallback.fallback_to_offline);
        set!(log_validations => config.audit.log_validations);
        set!(log_discovery => config.audit.log_discovery);
        set!(log_network_checks => config.audit.log_network_checks);

        if let Some(id) = &self.fallback_bundle_id {
            config.fallback.fallback_bundle_id = non_empty(id.clone());
            changed.push("fallback_bundle_id");
        }

        changed
    }

    /// Whether the patch sets nothing.
    pub fn is_empty(&self) -> bool {
        self.apply_to(&mut GovernanceConfig::default()).is_empty()
    }
}

fn non_empty(value: String) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}

// Default value functions for serde.

fn default_check_interval_secs() -> u64 {
    30
}

fn default_probe_timeout_ms() -> u64 {
    3_000
}

fn default_validation_timeout_secs() -> u64 {
    600
}

fn default_chunk_size_bytes() -> usize {
    65_536
}

fn default_max_override_ttl_secs() -> u64 {
    3_600
}
