//! End-to-end probe runs against the in-memory broker simulator
//!
//! Every test drives a full `FeatureProber` run through the public API and
//! checks both the report and that no connection outlives the run.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;

use mqttprobe::probe::{
    ConnectionParams, FailureKind, FeatureProber, ProbeKind, ProbeOutcome, ProbeReport,
    ProbeResult, ProbeSettings, RetainOutcome, SharedVerdict, SizeBoundResult,
};
use mqttprobe::protocol::{Properties, ProtocolVersion, QoS, ReasonCode};
use mqttprobe::render::render_report;
use mqttprobe::testing::{SharedMode, SimBehavior, SimBroker};

fn settings() -> ProbeSettings {
    ProbeSettings {
        message_budget: Duration::from_millis(50),
        probe_budget: Duration::from_secs(30),
        qos_tries: 5,
        topic_ceiling: 256,
        client_id_ceiling: 256,
        payload_ceiling: 4096,
        shared_sample: 6,
        ..Default::default()
    }
}

async fn run(broker: &SimBroker, settings: ProbeSettings, version: ProtocolVersion) -> ProbeReport {
    let params = ConnectionParams::new("sim.local", 1883);
    FeatureProber::new(Arc::new(broker.clone()), params, settings, version)
        .run()
        .await
}

fn size_bound(report: &ProbeReport, kind: ProbeKind) -> &SizeBoundResult {
    match report.result(kind) {
        Some(ProbeResult::SizeBound(size)) => size,
        other => panic!("expected size bound for {}, got {:?}", kind, other),
    }
}

#[tokio::test]
async fn test_full_run_against_compliant_broker() {
    let broker = SimBroker::compliant();
    let report = run(&broker, settings(), ProtocolVersion::V311).await;

    assert!(!report.aborted());
    let kinds: Vec<ProbeKind> = report.entries.iter().map(|e| e.kind).collect();
    assert_eq!(kinds, ProbeKind::ALL.to_vec());

    match report.result(ProbeKind::Connect) {
        Some(ProbeResult::Connect(connect)) => {
            assert!(connect.accepted);
            assert_eq!(connect.restrictions, None);
        }
        other => panic!("unexpected connect outcome {:?}", other),
    }

    let topic = size_bound(&report, ProbeKind::TopicLength);
    assert_eq!(topic.bound, 256);
    assert!(topic.search_exhausted_ceiling);
    assert_eq!(size_bound(&report, ProbeKind::PayloadSize).bound, 4096);
    assert_eq!(size_bound(&report, ProbeKind::ClientIdLength).bound, 256);

    for kind in [ProbeKind::Qos0, ProbeKind::Qos1, ProbeKind::Qos2] {
        match report.result(kind) {
            Some(ProbeResult::Qos(qos)) => {
                assert_eq!(qos.requested, 5);
                assert_eq!(qos.received, 5, "{}", kind);
                assert_eq!(qos.granted, qos.qos);
            }
            other => panic!("unexpected {} outcome {:?}", kind, other),
        }
    }

    match report.result(ProbeKind::Retain) {
        Some(ProbeResult::Retain(retain)) => assert_eq!(retain.outcome, RetainOutcome::Observed),
        other => panic!("unexpected retain outcome {:?}", other),
    }
    match report.result(ProbeKind::Wildcard) {
        Some(ProbeResult::Wildcard(wildcard)) => assert!(wildcard.supported()),
        other => panic!("unexpected wildcard outcome {:?}", other),
    }
    match report.result(ProbeKind::SharedSubscription) {
        Some(ProbeResult::SharedSubscription(shared)) => {
            assert_eq!(shared.verdict, SharedVerdict::Supported);
            assert_eq!(shared.delivered, 6);
        }
        other => panic!("unexpected shared outcome {:?}", other),
    }
    match report.result(ProbeKind::AsciiClientId) {
        Some(ProbeResult::AsciiClientId(ascii)) => {
            assert!(ascii.all_at_once);
            assert!(ascii.unsupported.is_empty());
        }
        other => panic!("unexpected ascii outcome {:?}", other),
    }

    assert_eq!(broker.open_connections(), 0);
    assert_eq!(broker.retained_count(), 0);
    assert!(render_report(&report).contains("Unsupported ASCII chars: ALL SUPPORTED"));
}

#[tokio::test]
async fn test_restricted_v5_broker() {
    fn alphanumeric(c: char) -> bool {
        c.is_ascii_alphanumeric()
    }

    let broker = SimBroker::new(SimBehavior {
        max_topic_length: Some(100),
        client_id_chars: alphanumeric,
        retain_available: false,
        hash_wildcard: false,
        shared: SharedMode::Reject,
        connack_properties: Properties {
            retain_available: Some(0),
            shared_subscription_available: Some(0),
            ..Default::default()
        },
        ..Default::default()
    });
    let settings = ProbeSettings {
        run_optional: true,
        ascii_candidates: "aZ9-/ #".chars().collect(),
        ..settings()
    };
    let report = run(&broker, settings, ProtocolVersion::V5).await;

    match report.result(ProbeKind::Connect) {
        Some(ProbeResult::Connect(connect)) => {
            let restrictions = connect.restrictions.as_ref().unwrap();
            assert!(!restrictions.retain_available);
            assert!(!restrictions.shared_subscription_available);
            assert!(restrictions.wildcard_subscription_available);
            assert_eq!(restrictions.maximum_qos, QoS::ExactlyOnce);
        }
        other => panic!("unexpected connect outcome {:?}", other),
    }

    let topic = size_bound(&report, ProbeKind::TopicLength);
    assert_eq!(topic.bound, 100);
    assert!(!topic.search_exhausted_ceiling);

    match report.result(ProbeKind::Retain) {
        Some(ProbeResult::Retain(retain)) => {
            assert!(!retain.observed);
            assert!(matches!(retain.outcome, RetainOutcome::PublishRejected(_)));
        }
        other => panic!("unexpected retain outcome {:?}", other),
    }
    match report.result(ProbeKind::Wildcard) {
        Some(ProbeResult::Wildcard(wildcard)) => {
            assert!(wildcard.plus_supported);
            assert!(!wildcard.hash_supported);
        }
        other => panic!("unexpected wildcard outcome {:?}", other),
    }
    match report.result(ProbeKind::SharedSubscription) {
        Some(ProbeResult::SharedSubscription(shared)) => {
            assert_eq!(shared.verdict, SharedVerdict::Unsupported)
        }
        other => panic!("unexpected shared outcome {:?}", other),
    }
    match report.result(ProbeKind::AsciiClientId) {
        Some(ProbeResult::AsciiClientId(ascii)) => {
            assert!(!ascii.all_at_once);
            assert_eq!(ascii.unsupported, BTreeSet::from(['-', '/', ' ', '#']));
        }
        other => panic!("unexpected ascii outcome {:?}", other),
    }

    assert_eq!(broker.open_connections(), 0);
}

#[tokio::test]
async fn test_v5_optional_probes_skipped_by_default() {
    let broker = SimBroker::compliant();
    let report = run(&broker, settings(), ProtocolVersion::V5).await;

    assert!(matches!(
        report.outcome(ProbeKind::Connect),
        Some(ProbeOutcome::Completed(_))
    ));
    for entry in report.entries.iter().skip(1) {
        assert_eq!(entry.outcome, ProbeOutcome::Skipped, "{}", entry.kind);
    }
    assert_eq!(broker.connect_attempts(), 1);
}

#[tokio::test]
async fn test_refused_connect_short_circuits() {
    let broker = SimBroker::new(SimBehavior {
        refuse_connect: Some(ReasonCode::NotAuthorized),
        ..Default::default()
    });
    let report = run(&broker, settings(), ProtocolVersion::V311).await;

    assert!(report.aborted());
    let failure = report
        .outcome(ProbeKind::Connect)
        .and_then(ProbeOutcome::failure)
        .unwrap();
    assert_eq!(failure.kind, FailureKind::Connect);
    assert_eq!(failure.attempted.as_deref(), Some("sim.local:1883"));
    assert_eq!(failure.reason_code, Some(ReasonCode::NotAuthorized));
    let json = serde_json::to_value(&report).unwrap();
    assert!(!json["entries"][0]["outcome"]["value"]["reason_code"].is_null());
    for entry in report.entries.iter().skip(1) {
        assert_eq!(entry.outcome, ProbeOutcome::NotAttempted, "{}", entry.kind);
    }
    assert_eq!(broker.connect_attempts(), 1);
    assert_eq!(broker.open_connections(), 0);
}

#[tokio::test]
async fn test_transport_error_pins_search_and_run_continues() {
    let broker = SimBroker::new(SimBehavior {
        io_error_at_topic_length: Some(64),
        ..Default::default()
    });
    let report = run(&broker, settings(), ProtocolVersion::V311).await;

    let topic = size_bound(&report, ProbeKind::TopicLength);
    assert_eq!(topic.bound, 32);
    assert!(!topic.search_exhausted_ceiling);
    let abort = topic.aborted.as_ref().unwrap();
    assert_eq!(abort.attempted, 64);

    // Later probes stay within the learned limit
    match report.result(ProbeKind::Qos1) {
        Some(ProbeResult::Qos(qos)) => assert_eq!(qos.received, 5),
        other => panic!("unexpected qos1 outcome {:?}", other),
    }
    assert!(render_report(&report).contains("Maximum topic length: >= 32 bytes (search stopped at 64"));
    assert_eq!(broker.open_connections(), 0);
}

#[tokio::test]
async fn test_skip_list_and_json_report() {
    let broker = SimBroker::compliant();
    let settings = ProbeSettings {
        skip: BTreeSet::from([
            ProbeKind::PayloadSize,
            ProbeKind::ClientIdLength,
            ProbeKind::AsciiClientId,
            ProbeKind::SharedSubscription,
        ]),
        ..settings()
    };
    let report = run(&broker, settings, ProtocolVersion::V311).await;

    assert_eq!(
        report.outcome(ProbeKind::PayloadSize),
        Some(&ProbeOutcome::Skipped)
    );

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["entries"][0]["kind"], "connect");
    assert_eq!(json["entries"][0]["outcome"]["status"], "completed");
    assert_eq!(json["entries"][0]["outcome"]["value"]["type"], "connect");
    assert_eq!(json["entries"][1]["kind"], "topic-length");
    assert_eq!(json["entries"][1]["outcome"]["value"]["bound"], 256);
    assert_eq!(json["entries"][8]["outcome"]["status"], "skipped");
}
