use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use test_case::test_case;

use super::*;
use crate::protocol::{Properties, ReasonCode};
use crate::testing::{SharedMode, SimBehavior, SimBroker};

struct Fixture {
    broker: SimBroker,
    params: ConnectionParams,
    settings: ProbeSettings,
    context: ProbeContext,
}

impl Fixture {
    fn new(behavior: SimBehavior) -> Self {
        Self {
            broker: SimBroker::new(behavior),
            params: ConnectionParams::new("sim", 1883),
            settings: test_settings(),
            context: ProbeContext::default(),
        }
    }

    fn env(&self) -> ProbeEnv<'_> {
        ProbeEnv {
            connector: &self.broker,
            params: &self.params,
            settings: &self.settings,
            version: ProtocolVersion::V5,
            context: &self.context,
        }
    }
}

fn test_settings() -> ProbeSettings {
    ProbeSettings {
        message_budget: Duration::from_millis(50),
        probe_budget: Duration::from_secs(20),
        topic_ceiling: 256,
        client_id_ceiling: 256,
        payload_ceiling: 4096,
        ..Default::default()
    }
}

fn alphanumeric(c: char) -> bool {
    c.is_ascii_alphanumeric()
}

#[tokio::test]
async fn test_topic_length_limit() {
    let fixture = Fixture::new(SimBehavior {
        max_topic_length: Some(100),
        ..Default::default()
    });
    let result = size::run(&fixture.env(), SizeKind::Topic, 256).await;

    assert_eq!(result.bound, 100);
    assert!(!result.search_exhausted_ceiling);
    assert!(result.aborted.is_none());
    assert!(result.evaluations <= 16);
    assert_eq!(fixture.broker.open_connections(), 0);
}

#[tokio::test]
async fn test_topic_length_reaches_ceiling() {
    let fixture = Fixture::new(SimBehavior::default());
    let result = size::run(&fixture.env(), SizeKind::Topic, 256).await;

    assert_eq!(result.bound, 256);
    assert_eq!(result.ceiling, 256);
    assert!(result.search_exhausted_ceiling);
}

#[tokio::test]
async fn test_transport_error_pins_last_success() {
    let fixture = Fixture::new(SimBehavior {
        io_error_at_topic_length: Some(40),
        ..Default::default()
    });
    let result = size::run(&fixture.env(), SizeKind::Topic, 256).await;

    assert_eq!(result.bound, 32);
    assert!(!result.search_exhausted_ceiling);
    let aborted = result.aborted.unwrap();
    assert_eq!(aborted.attempted, 64);
    assert!(aborted.detail.contains("I/O error"));
    assert_eq!(fixture.broker.open_connections(), 0);
}

#[tokio::test]
async fn test_client_id_length_limit() {
    let fixture = Fixture::new(SimBehavior {
        max_client_id_length: Some(50),
        ..Default::default()
    });
    let result = size::run(&fixture.env(), SizeKind::ClientId, 256).await;
    assert_eq!(result.bound, 50);
    assert_eq!(result.kind, SizeKind::ClientId);
}

#[test_case(false ; "rejected")]
#[test_case(true ; "silently dropped")]
#[tokio::test]
async fn test_payload_limit(drop_oversized_payloads: bool) {
    let fixture = Fixture::new(SimBehavior {
        max_payload: Some(1000),
        drop_oversized_payloads,
        ..Default::default()
    });
    let result = size::run(&fixture.env(), SizeKind::Payload, 4096).await;
    assert_eq!(result.bound, 1000);
    assert!(result.aborted.is_none());
}

#[tokio::test]
async fn test_qos2_all_delivered() {
    let fixture = Fixture::new(SimBehavior::default());
    let result = qos::run(&fixture.env(), QoS::ExactlyOnce, 10).await.unwrap();

    assert_eq!(result.requested, 10);
    assert_eq!(result.received, 10);
    assert_eq!(result.granted, QoS::ExactlyOnce);
    assert_eq!(fixture.broker.open_connections(), 0);
}

#[tokio::test]
async fn test_qos0_loss_counted() {
    let fixture = Fixture::new(SimBehavior {
        qos0_loss_every: Some(2),
        ..Default::default()
    });
    let result = qos::run(&fixture.env(), QoS::AtMostOnce, 10).await.unwrap();
    assert_eq!(result.received, 5);
    assert!(result.received <= result.requested);
}

#[tokio::test]
async fn test_duplicates_counted_once() {
    let fixture = Fixture::new(SimBehavior {
        duplicate_deliveries: true,
        ..Default::default()
    });
    let result = qos::run(&fixture.env(), QoS::AtLeastOnce, 10).await.unwrap();
    assert_eq!(result.received, 10);
}

#[tokio::test]
async fn test_qos_subscribe_rejected() {
    let fixture = Fixture::new(SimBehavior {
        max_topic_length: Some(4),
        ..Default::default()
    });
    let failure = qos::run(&fixture.env(), QoS::AtLeastOnce, 10)
        .await
        .unwrap_err();
    assert_eq!(failure.probe, ProbeKind::Qos1);
    assert_eq!(failure.kind, FailureKind::Rejected);
    assert!(failure.attempted.is_some());
}

#[tokio::test]
async fn test_wildcards_supported() {
    let fixture = Fixture::new(SimBehavior::default());
    let result = subscription::wildcard(&fixture.env()).await.unwrap();
    assert_eq!(result.plus, WildcardCheck::Ok);
    assert_eq!(result.hash, WildcardCheck::Ok);
    assert!(result.supported());
}

#[tokio::test]
async fn test_hash_wildcard_rejected() {
    let fixture = Fixture::new(SimBehavior {
        hash_wildcard: false,
        ..Default::default()
    });
    let result = subscription::wildcard(&fixture.env()).await.unwrap();
    assert!(result.plus_supported);
    assert!(!result.hash_supported);
    assert!(matches!(result.hash, WildcardCheck::SubscribeFailed(_)));
    assert!(!result.supported());
}

#[test_case(SharedMode::RoundRobin, SharedVerdict::Supported ; "round robin")]
#[test_case(SharedMode::Duplicate, SharedVerdict::Unsupported ; "duplicate")]
#[test_case(SharedMode::Reject, SharedVerdict::Unsupported ; "reject")]
#[test_case(SharedMode::Ignore, SharedVerdict::Unsupported ; "ignore")]
#[tokio::test]
async fn test_shared_subscription(shared: SharedMode, verdict: SharedVerdict) {
    let fixture = Fixture::new(SimBehavior {
        shared,
        ..Default::default()
    });
    let result = subscription::shared(&fixture.env(), 10).await.unwrap();
    assert_eq!(result.verdict, verdict);
    if verdict == SharedVerdict::Supported {
        assert_eq!(result.delivered, 10);
        assert_eq!(result.duplicates, 0);
    } else {
        assert!(result.detail.is_some());
    }
    assert_eq!(fixture.broker.open_connections(), 0);
}

#[tokio::test]
async fn test_shared_partial_delivery_indeterminate() {
    let mut fixture = Fixture::new(SimBehavior {
        qos0_loss_every: Some(3),
        ..Default::default()
    });
    fixture.context.max_qos = Some(QoS::AtMostOnce);
    let result = subscription::shared(&fixture.env(), 9).await.unwrap();
    assert_eq!(result.verdict, SharedVerdict::Indeterminate);
    assert_eq!(result.published, 9);
    assert_eq!(result.delivered, 6);
}

#[tokio::test]
async fn test_retain_observed_and_cleared() {
    let fixture = Fixture::new(SimBehavior::default());
    let result = retain::run(&fixture.env()).await.unwrap();

    assert!(result.observed);
    assert_eq!(result.outcome, RetainOutcome::Observed);
    assert_eq!(result.qos, QoS::AtLeastOnce);
    assert_eq!(fixture.broker.retained_count(), 0);
    assert_eq!(fixture.broker.open_connections(), 0);
}

#[tokio::test]
async fn test_retain_rejected() {
    let fixture = Fixture::new(SimBehavior {
        retain_available: false,
        ..Default::default()
    });
    let result = retain::run(&fixture.env()).await.unwrap();
    assert!(!result.observed);
    assert!(matches!(result.outcome, RetainOutcome::PublishRejected(_)));
}

#[tokio::test]
async fn test_retain_accepted_but_not_stored() {
    let fixture = Fixture::new(SimBehavior {
        store_retained: false,
        ..Default::default()
    });
    let result = retain::run(&fixture.env()).await.unwrap();
    assert!(!result.observed);
    assert_eq!(result.outcome, RetainOutcome::NotDelivered);
    assert_eq!(fixture.broker.retained_count(), 0);
    assert_eq!(fixture.broker.open_connections(), 0);
}

#[tokio::test]
async fn test_retain_cleared_when_verification_fails() {
    let fixture = Fixture::new(SimBehavior {
        io_error_at_topic_length: Some(1),
        ..Default::default()
    });
    let failure = retain::run(&fixture.env()).await.unwrap_err();
    assert_eq!(failure.kind, FailureKind::Transport);
    assert_eq!(fixture.broker.retained_count(), 0);
    assert_eq!(fixture.broker.open_connections(), 0);
}

#[tokio::test]
async fn test_retain_uses_qos0_when_announced() {
    let mut fixture = Fixture::new(SimBehavior::default());
    let props = Properties {
        maximum_qos: Some(0),
        ..Default::default()
    };
    fixture.context.restrictions = Some(Restrictions::from_properties(&props));
    let result = retain::run(&fixture.env()).await.unwrap();
    assert_eq!(result.qos, QoS::AtMostOnce);
    assert!(result.observed);
}

#[tokio::test]
async fn test_ascii_alphanumeric_only() {
    let mut fixture = Fixture::new(SimBehavior {
        client_id_chars: alphanumeric,
        ..Default::default()
    });
    fixture.context.max_client_id_length = Some(200);
    let candidates = ProbeSettings::default().ascii_candidates;
    let result = ascii::run(&fixture.env(), &candidates).await.unwrap();

    let expected: BTreeSet<char> = candidates
        .iter()
        .copied()
        .filter(|c| !c.is_ascii_alphanumeric())
        .collect();
    assert!(!result.all_at_once);
    assert_eq!(result.unsupported, expected);
    assert_eq!(
        result.rejections.keys().copied().collect::<BTreeSet<_>>(),
        expected
    );
}

#[tokio::test]
async fn test_ascii_all_at_once() {
    let mut fixture = Fixture::new(SimBehavior::default());
    fixture.context.max_client_id_length = Some(200);
    let candidates = ProbeSettings::default().ascii_candidates;
    let result = ascii::run(&fixture.env(), &candidates).await.unwrap();

    assert!(result.all_at_once);
    assert!(result.unsupported.is_empty());
    assert_eq!(fixture.broker.connect_attempts(), 1);
}

#[tokio::test]
async fn test_ascii_retries_once() {
    let fixture = Fixture::new(SimBehavior {
        transient_connect_failures: 1,
        ..Default::default()
    });
    let result = ascii::run(&fixture.env(), &['a', '-']).await.unwrap();
    assert!(result.unsupported.is_empty());
    assert_eq!(fixture.broker.connect_attempts(), 3);
}

#[test]
fn test_context_learns_limits() {
    let mut context = ProbeContext::default();
    assert_eq!(context.delivery_qos(), QoS::AtLeastOnce);
    assert_eq!(context.client_id_length(), SAFE_CLIENT_ID_LENGTH);

    context.learn(&ProbeResult::SizeBound(SizeBoundResult {
        kind: SizeKind::Topic,
        bound: 12,
        ceiling: 100,
        search_exhausted_ceiling: false,
        evaluations: 9,
        aborted: None,
    }));
    assert_eq!(context.max_topic_length, Some(12));
    assert_eq!(context.topic().len(), 12);

    context.learn(&ProbeResult::Qos(QosResult {
        qos: QoS::AtMostOnce,
        granted: QoS::AtMostOnce,
        requested: 10,
        received: 3,
        elapsed_nanos: 0,
    }));
    context.learn(&ProbeResult::Qos(QosResult {
        qos: QoS::AtLeastOnce,
        granted: QoS::AtLeastOnce,
        requested: 10,
        received: 0,
        elapsed_nanos: 0,
    }));
    assert_eq!(context.max_qos, Some(QoS::AtMostOnce));
    assert_eq!(context.delivery_qos(), QoS::AtMostOnce);
}

#[test]
fn test_restrictions_defaults() {
    let restrictions = Restrictions::from_properties(&Properties::default());
    assert!(restrictions.retain_available);
    assert!(restrictions.shared_subscription_available);
    assert_eq!(restrictions.maximum_qos, QoS::ExactlyOnce);
    assert_eq!(restrictions.receive_maximum, 65535);

    let restrictions = Restrictions::from_properties(&Properties {
        retain_available: Some(0),
        maximum_qos: Some(1),
        maximum_packet_size: Some(1024),
        ..Default::default()
    });
    assert!(!restrictions.retain_available);
    assert_eq!(restrictions.maximum_qos, QoS::AtLeastOnce);
    assert_eq!(restrictions.maximum_packet_size, Some(1024));
}

#[test]
fn test_probe_kind_names() {
    for kind in ProbeKind::ALL {
        assert_eq!(ProbeKind::parse(kind.name()), Some(kind));
    }
    assert_eq!(
        ProbeKind::parse("Shared_Subscription"),
        Some(ProbeKind::SharedSubscription)
    );
    assert_eq!(ProbeKind::parse("bogus"), None);
}

fn prober(
    broker: &SimBroker,
    settings: ProbeSettings,
    version: ProtocolVersion,
) -> FeatureProber {
    FeatureProber::new(
        Arc::new(broker.clone()),
        ConnectionParams::new("sim", 1883),
        settings,
        version,
    )
}

#[tokio::test]
async fn test_refused_connect_aborts_run() {
    let broker = SimBroker::new(SimBehavior {
        refuse_connect: Some(ReasonCode::NotAuthorized),
        ..Default::default()
    });
    let report = prober(&broker, test_settings(), ProtocolVersion::V311)
        .run()
        .await;

    assert!(report.aborted());
    let failure = report
        .outcome(ProbeKind::Connect)
        .and_then(ProbeOutcome::failure)
        .unwrap();
    assert_eq!(failure.kind, FailureKind::Connect);
    assert!(failure.detail.contains("Not authorized"));
    assert_eq!(failure.reason_code, Some(ReasonCode::NotAuthorized));
    for entry in &report.entries[1..] {
        assert_eq!(entry.outcome, ProbeOutcome::NotAttempted);
    }
    assert_eq!(broker.connect_attempts(), 1);
}

#[tokio::test]
async fn test_v5_optional_probes_need_opt_in() {
    let broker = SimBroker::compliant();
    let report = prober(&broker, test_settings(), ProtocolVersion::V5).run().await;

    let connect = match report.result(ProbeKind::Connect) {
        Some(ProbeResult::Connect(connect)) => connect.clone(),
        other => panic!("unexpected connect outcome {:?}", other),
    };
    assert!(connect.restrictions.is_some());
    for entry in &report.entries[1..] {
        assert_eq!(entry.outcome, ProbeOutcome::Skipped);
    }
}

#[tokio::test]
async fn test_skipped_probes() {
    let broker = SimBroker::compliant();
    let settings = ProbeSettings {
        skip: ProbeKind::ALL
            .into_iter()
            .filter(|kind| *kind != ProbeKind::Retain)
            .collect(),
        ..test_settings()
    };
    let report = prober(&broker, settings, ProtocolVersion::V311).run().await;

    let kinds: Vec<ProbeKind> = report.entries.iter().map(|e| e.kind).collect();
    assert_eq!(kinds, ProbeKind::ALL.to_vec());
    assert!(matches!(
        report.outcome(ProbeKind::Connect),
        Some(ProbeOutcome::Completed(_))
    ));
    assert!(matches!(
        report.result(ProbeKind::Retain),
        Some(ProbeResult::Retain(r)) if r.observed
    ));
    assert_eq!(report.outcome(ProbeKind::Qos0), Some(&ProbeOutcome::Skipped));
}

#[tokio::test]
async fn test_probe_budget_exceeded() {
    let broker = SimBroker::new(SimBehavior {
        latency: Some(Duration::from_millis(200)),
        ..Default::default()
    });
    let settings = ProbeSettings {
        probe_budget: Duration::from_millis(50),
        skip: [ProbeKind::AsciiClientId, ProbeKind::ClientIdLength]
            .into_iter()
            .collect(),
        ..test_settings()
    };
    let report = prober(&broker, settings, ProtocolVersion::V311).run().await;

    let failure = report
        .outcome(ProbeKind::Qos1)
        .and_then(ProbeOutcome::failure)
        .unwrap();
    assert_eq!(failure.kind, FailureKind::Timeout);
    assert_eq!(broker.open_connections(), 0);
}
