//! Tests for `src/governance/gates.rs`: gate applicability and full failure sets.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use sovereign::governance::gates::{GateName, ListeningSocket, PreflightGateChain, Proposal};
use sovereign::governance::IsolationProbe;
use sovereign::network::{ConnectivityProbe, NetworkMonitor};
use sovereign::types::{BundleStatus, OperationMode};

use crate::support::{harness, test_config, ScriptedProbe, StaticIsolation};

fn chain(online: bool) -> (PreflightGateChain, Arc<ScriptedProbe>, Arc<StaticIsolation>) {
    let probe = ScriptedProbe::new(online);
    let monitor = Arc::new(NetworkMonitor::new(
        vec![Arc::clone(&probe) as Arc<dyn ConnectivityProbe>],
        Duration::from_millis(200),
    ));
    let isolation = StaticIsolation::isolated();
    let gates = PreflightGateChain::new(monitor, Arc::clone(&isolation) as Arc<dyn IsolationProbe>);
    (gates, probe, isolation)
}

#[tokio::test]
async fn online_requires_connectivity() {
    let (gates, probe, _) = chain(false);
    let proposal = Proposal {
        current: OperationMode::Offline,
        target: OperationMode::Online,
        bundle_id: None,
        bundle: None,
    };

    let report = gates.evaluate(&proposal).await;
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].gate, GateName::Network);
    assert!(report.network.as_ref().is_some_and(|n| !n.is_online));

    probe.set_online(true);
    assert!(gates.evaluate(&proposal).await.passed());
}

#[tokio::test]
async fn sovereign_reports_every_failed_gate() {
    let h = harness(test_config()).await;
    h.add_bundle("b1").await;
    let pending = h.service.get_bundle("b1").await.expect("b1 exists");
    assert_eq!(pending.status, BundleStatus::Pending);

    let (gates, _, isolation) = chain(true);
    isolation.set_ipv6_disabled(false);
    isolation.expose(ListeningSocket {
        address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        port: 22,
    });

    let report = gates
        .evaluate(&Proposal {
            current: OperationMode::Online,
            target: OperationMode::Sovereign,
            bundle_id: Some("b1"),
            bundle: Some(&pending),
        })
        .await;

    let failed: Vec<GateName> = report.failures.iter().map(|f| f.gate).collect();
    assert_eq!(failed, vec![GateName::Ipv6, GateName::Dmz, GateName::BundleTrust]);
    assert!(report.failures[1].reason.contains("0.0.0.0:22"));
    assert!(report.network.is_none(), "network gate only applies to online");
}

#[tokio::test]
async fn offline_ignores_inbound_exposure() {
    let h = harness(test_config()).await;
    h.add_validated_bundle("b1").await;
    let validated = h.service.get_bundle("b1").await.expect("b1 exists");

    let (gates, _, isolation) = chain(false);
    isolation.expose(ListeningSocket {
        address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        port: 8080,
    });

    let report = gates
        .evaluate(&Proposal {
            current: OperationMode::Online,
            target: OperationMode::Offline,
            bundle_id: Some("b1"),
            bundle: Some(&validated),
        })
        .await;
    assert!(report.passed(), "failures: {:?}", report.failures);
}

#[tokio::test]
async fn missing_bundle_reference_fails_trust_gate() {
    let (gates, _, _) = chain(true);
    let report = gates
        .evaluate(&Proposal {
            current: OperationMode::Online,
            target: OperationMode::Offline,
            bundle_id: Some("ghost"),
            bundle: None,
        })
        .await;
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].gate, GateName::BundleTrust);
    assert!(report.failures[0].reason.contains("ghost"));
}

#[tokio::test]
async fn quarantine_target_always_passes() {
    let (gates, _, isolation) = chain(false);
    isolation.set_ipv6_disabled(false);
    isolation.expose(ListeningSocket {
        address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        port: 22,
    });

    for current in OperationMode::ALL {
        let report = gates
            .evaluate(&Proposal {
                current,
                target: OperationMode::Quarantine,
                bundle_id: None,
                bundle: None,
            })
            .await;
        assert!(report.passed());
    }
}
