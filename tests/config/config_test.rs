//! Coverage for config parsing, env precedence, validation, and patching.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use sovereign::config::{is_valid_domain, load_env_file, ConfigPatch, GovernanceConfig, LiveConfig, ProbeMethod};

fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: BTreeMap<String, String> = pairs
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect();
    move |key| map.get(key).cloned()
}

#[test]
fn defaults_are_conservative() {
    let config = GovernanceConfig::default();
    assert!(config.network.enabled);
    assert!(config.network.auto_detect);
    assert_eq!(config.network.check_interval_secs, 30);
    assert_eq!(config.network.probe_method, ProbeMethod::DnsThenHttp);
    assert!(config.trust.strict_validation);
    assert!(!config.trust.allow_unsigned_bundles);
    assert!(config.trust.quarantine_on_failure);
    assert!(!config.fallback.fallback_to_offline);
    assert!(config.fallback.fallback_bundle_id.is_none());
    config.validate().expect("defaults should validate");
}

#[test]
fn empty_toml_yields_defaults() {
    let config = GovernanceConfig::from_toml("").expect("empty config should parse");
    assert_eq!(config, GovernanceConfig::default());
}

#[test]
fn partial_toml_keeps_other_defaults() {
    let config = GovernanceConfig::from_toml(
        r#"
[network]
check_interval_secs = 120
probe_method = "dns"

[fallback]
fallback_to_offline = true
fallback_bundle_id = "llama-small"
"#,
    )
    .expect("partial config should parse");

    assert_eq!(config.network.check_interval_secs, 120);
    assert_eq!(config.network.probe_method, ProbeMethod::Dns);
    assert_eq!(config.network.probe_timeout_ms, 3_000);
    assert!(config.fallback.fallback_to_offline);
    assert_eq!(config.fallback.fallback_bundle_id.as_deref(), Some("llama-small"));
    assert!(config.trust.strict_validation);
}

#[test]
fn malformed_toml_is_an_error() {
    assert!(GovernanceConfig::from_toml("[network\nenabled = true").is_err());
    assert!(GovernanceConfig::from_toml("[network]\nprobe_method = \"carrier-pigeon\"").is_err());
}

#[test]
fn env_overrides_win_over_file() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let path = tmp.path().join("sovereign.toml");
    std::fs::write(
        &path,
        "[network]\ncheck_interval_secs = 60\n[trust]\nstrict_validation = true\n",
    )
    .expect("should write config");

    let env = env_from(&[
        ("SOVEREIGN_DATA_DIR", "/srv/sovereign"),
        ("SOVEREIGN_CHECK_INTERVAL_SECS", "15"),
        ("SOVEREIGN_STRICT_VALIDATION", "false"),
        ("SOVEREIGN_FALLBACK_BUNDLE", "b2"),
        ("SOVEREIGN_PROBE_URL", "http://probe.internal/health"),
    ]);
    let config = GovernanceConfig::load_with(Some(&path), env).expect("config should load");

    assert_eq!(config.paths.data_dir, PathBuf::from("/srv/sovereign"));
    assert_eq!(config.network.check_interval_secs, 15);
    assert!(!config.trust.strict_validation);
    assert_eq!(config.fallback.fallback_bundle_id.as_deref(), Some("b2"));
    assert_eq!(config.network.probe_url, "http://probe.internal/health");

    let paths = config.paths.resolve();
    assert_eq!(paths.bundles_dir, Path::new("/srv/sovereign/bundles"));
    assert_eq!(paths.audit_log, Path::new("/srv/sovereign/audit.jsonl"));
}

#[test]
fn invalid_env_values_are_ignored() {
    let mut config = GovernanceConfig::default();
    config.apply_overrides(env_from(&[
        ("SOVEREIGN_CHECK_INTERVAL_SECS", "soon"),
        ("SOVEREIGN_STRICT_VALIDATION", "maybe"),
    ]));
    assert_eq!(config, GovernanceConfig::default());
}

#[test]
fn config_path_env_is_used_when_no_path_given() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let path = tmp.path().join("custom.toml");
    std::fs::write(&path, "[overrides]\nmax_ttl_secs = 120\n").expect("should write config");
    let path_str = path.to_string_lossy().into_owned();

    let config = GovernanceConfig::load_with(None, env_from(&[("SOVEREIGN_CONFIG_PATH", path_str.as_str())]))
        .expect("config should load");
    assert_eq!(config.overrides.max_ttl_secs, 120);
}

#[test]
fn missing_file_yields_defaults() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let config = GovernanceConfig::load_with(Some(&tmp.path().join("absent.toml")), |_| None)
        .expect("missing file is not an error");
    assert_eq!(config.network, GovernanceConfig::default().network);
}

#[test]
fn load_rejects_out_of_bounds_values() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let path = tmp.path().join("sovereign.toml");
    std::fs::write(&path, "[network]\ncheck_interval_secs = 2\n").expect("should write config");

    let err = GovernanceConfig::load_with(Some(&path), |_| None).expect_err("interval too short");
    assert!(err.to_string().contains("check_interval_secs"));
}

#[test]
fn validate_checks_each_bound() {
    let cases: [(&str, fn(&mut GovernanceConfig)); 8] = [
        ("probe_timeout_ms", |c| c.network.probe_timeout_ms = 50),
        ("dns_host", |c| c.network.dns_host = "one.one.one.one".to_owned()),
        ("probe_url", |c| c.network.probe_url = "ftp://example.com".to_owned()),
        ("validation_timeout_secs", |c| c.trust.validation_timeout_secs = 0),
        ("chunk_size_bytes", |c| c.trust.chunk_size_bytes = 1_024),
        ("max_ttl_secs", |c| c.overrides.max_ttl_secs = 0),
        ("allowed_domains", |c| c.egress.allowed_domains = vec!["not a domain".to_owned()]),
        ("fallback_bundle_id", |c| c.fallback.fallback_bundle_id = Some("  ".to_owned())),
    ];

    for (setting, mutate) in cases {
        let mut config = GovernanceConfig::default();
        mutate(&mut config);
        let err = config.validate().expect_err(setting);
        assert!(
            format!("{err:#}").contains(setting),
            "error for {setting} should name it: {err:#}"
        );
    }
}

#[test]
fn domain_syntax() {
    assert!(is_valid_domain("example.com"));
    assert!(is_valid_domain("*.internal.example.org"));
    assert!(is_valid_domain("API.Example.COM"));
    assert!(!is_valid_domain("localhost"));
    assert!(!is_valid_domain("exa mple.com"));
    assert!(!is_valid_domain("*example.com"));
}

#[test]
fn patch_reports_changed_fields_and_clears_fallback() {
    let mut config = GovernanceConfig::default();
    config.fallback.fallback_bundle_id = Some("b1".to_owned());

    let patch = ConfigPatch {
        block_external_http: Some(true),
        allowed_domains: Some(vec!["updates.example.com".to_owned()]),
        fallback_bundle_id: Some(String::new()),
        ..ConfigPatch::default()
    };
    let changed = patch.apply_to(&mut config);

    assert_eq!(
        changed,
        vec!["block_external_http", "allowed_domains", "fallback_bundle_id"]
    );
    assert!(config.egress.block_external_http);
    assert!(config.fallback.fallback_bundle_id.is_none());
    assert!(ConfigPatch::default().is_empty());
    assert!(!patch.is_empty());
}

#[test]
fn patch_deserializes_from_partial_json() {
    let patch: ConfigPatch =
        serde_json::from_str(r#"{"network_enabled": false, "log_network_checks": false}"#)
            .expect("patch should parse");
    assert_eq!(patch.network_enabled, Some(false));
    assert_eq!(patch.log_network_checks, Some(false));
    assert!(patch.strict_validation.is_none());
}

#[test]
fn live_config_rejects_invalid_patch_atomically() {
    let live = LiveConfig::new(GovernanceConfig::default());
    let bad = ConfigPatch {
        network_check_interval_secs: Some(0),
        strict_validation: Some(false),
        ..ConfigPatch::default()
    };
    assert!(live.apply(&bad).is_err());
    assert_eq!(live.snapshot(), GovernanceConfig::default());

    let good = ConfigPatch {
        strict_validation: Some(false),
        ..ConfigPatch::default()
    };
    let (changed, previous) = live.apply(&good).expect("valid patch applies");
    assert_eq!(changed, vec!["strict_validation"]);
    assert!(previous.trust.strict_validation);
    assert!(!live.snapshot().trust.strict_validation);

    live.replace(previous);
    assert!(live.snapshot().trust.strict_validation);
}

#[test]
fn env_file_is_parsed_into_pairs() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let path = tmp.path().join(".env");
    assert!(load_env_file(&path).expect("missing file is empty").is_empty());

    std::fs::write(&path, "SOVEREIGN_FALLBACK_BUNDLE=b3\n# comment\nSOVEREIGN_CHECK_INTERVAL_SECS=20\n")
        .expect("should write env file");
    let vars = load_env_file(&path).expect("env file should parse");
    assert_eq!(vars.get("SOVEREIGN_FALLBACK_BUNDLE").map(String::as_str), Some("b3"));
    assert_eq!(vars.len(), 2);
}
