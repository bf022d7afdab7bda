//! Delivery reliability and latency at one QoS level

use std::collections::HashSet;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{ProbeEnv, ProbeFailure, ProbeKind, QosResult};
use crate::client::ProbeClient;
use crate::protocol::QoS;
use crate::topic::probe_marker;

fn probe_kind(qos: QoS) -> ProbeKind {
    match qos {
        QoS::AtMostOnce => ProbeKind::Qos0,
        QoS::AtLeastOnce => ProbeKind::Qos1,
        QoS::ExactlyOnce => ProbeKind::Qos2,
    }
}

/// Sequence number of a probe payload `<marker>:<seq>`
fn sequence(payload: &[u8], marker: &str) -> Option<u32> {
    let text = std::str::from_utf8(payload).ok()?;
    let (prefix, seq) = text.split_once(':')?;
    if prefix != marker {
        return None;
    }
    seq.parse().ok()
}

/// Publish `tries` messages at `qos` and count the distinct ones delivered
pub async fn run(env: &ProbeEnv<'_>, qos: QoS, tries: u32) -> Result<QosResult, ProbeFailure> {
    let kind = probe_kind(qos);
    let fail = |e| ProbeFailure::from_client_error(kind, &e);
    let topic = env.context.topic();

    let mut subscriber = env.open().await.map_err(fail)?;
    let granted = subscriber
        .subscribe(&topic, qos)
        .await
        .map_err(|e| fail(e).attempted(topic.clone()))?;
    if granted != qos {
        debug!(requested = %qos, granted = %granted, "subscription downgraded");
    }
    let mut publisher = env.open().await.map_err(fail)?;

    let marker = probe_marker();
    let started = Instant::now();
    for seq in 0..tries {
        let payload = Bytes::from(format!("{}:{}", marker, seq));
        if let Err(e) = publisher.publish(&topic, payload, qos, false).await {
            warn!(seq, error = %e, "{} publish failed", qos);
        }
    }

    let wait = env.settings.message_budget.saturating_mul(tries);
    let received = collect(subscriber.as_mut(), &marker, tries, started + wait).await;
    let elapsed = started.elapsed();

    publisher.disconnect().await;
    subscriber.disconnect().await;

    debug!(
        "Received {}/{} publishes in {:.2}ms",
        received,
        tries,
        elapsed.as_secs_f64() * 1000.0
    );
    Ok(QosResult {
        qos,
        granted,
        requested: tries,
        received,
        elapsed_nanos: u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX),
    })
}

/// Count distinct sequence numbers until all `tries` arrived or `deadline`
async fn collect(
    subscriber: &mut dyn ProbeClient,
    marker: &str,
    tries: u32,
    deadline: Instant,
) -> u32 {
    let mut seen = HashSet::new();
    while (seen.len() as u32) < tries {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining == Duration::ZERO {
            break;
        }
        match subscriber.recv(remaining).await {
            Ok(Some(message)) => match sequence(&message.payload, marker) {
                Some(seq) if seq < tries => {
                    if !seen.insert(seq) {
                        debug!(seq, "duplicate delivery");
                    }
                }
                _ => debug!(topic = %message.topic, "ignoring unrelated message"),
            },
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "subscriber lost");
                break;
            }
        }
    }
    seen.len() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_parsing() {
        assert_eq!(sequence(b"abc:7", "abc"), Some(7));
        assert_eq!(sequence(b"abc:x", "abc"), None);
        assert_eq!(sequence(b"other:7", "abc"), None);
        assert_eq!(sequence(b"abc", "abc"), None);
        assert_eq!(sequence(&[0xFF, b':', b'1'], "abc"), None);
    }
}
