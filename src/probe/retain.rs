//! Retained message delivery to a late subscriber
//!
//! The acknowledgement of the retained publish is the barrier that proves
//! the broker stored the message before the verifying subscription exists.
//! QoS 1 is used for that reason unless the broker announced it only
//! supports QoS 0, in which case the completed write is the only barrier.

use bytes::Bytes;
use tracing::debug;

use super::{wait_for, ProbeEnv, ProbeFailure, ProbeKind, RetainOutcome, RetainResult};
use crate::protocol::QoS;
use crate::topic::probe_marker;

pub async fn run(env: &ProbeEnv<'_>) -> Result<RetainResult, ProbeFailure> {
    let fail = |e| ProbeFailure::from_client_error(ProbeKind::Retain, &e);
    let qos = match env.context.restrictions {
        Some(ref r) if r.maximum_qos == QoS::AtMostOnce => QoS::AtMostOnce,
        _ => QoS::AtLeastOnce,
    };
    let topic = env.context.topic();
    let payload = Bytes::from(probe_marker());

    let mut publisher = env.open().await.map_err(fail)?;
    match publisher.publish(&topic, payload.clone(), qos, true).await {
        Ok(()) => {}
        Err(e) if e.is_rejection() => {
            debug!(error = %e, "retained publish rejected");
            return Ok(RetainResult {
                observed: false,
                qos,
                outcome: RetainOutcome::PublishRejected(e.to_string()),
            });
        }
        Err(e) => return Err(fail(e)),
    }

    let verified = async {
        let mut subscriber = env.open().await.map_err(fail)?;
        subscriber
            .subscribe(&topic, qos)
            .await
            .map_err(|e| fail(e).attempted(topic.clone()))?;
        let retained = wait_for(subscriber.as_mut(), env.settings.message_budget, |m| {
            m.retain && m.topic == topic && m.payload == payload
        })
        .await
        .map_err(fail)?;
        subscriber.disconnect().await;
        Ok::<_, ProbeFailure>(retained)
    }
    .await;

    // Leave nothing behind on the broker, whatever the verification did
    if let Err(e) = publisher.publish(&topic, Bytes::new(), qos, true).await {
        debug!(error = %e, "failed to clear retained message");
    }
    publisher.disconnect().await;

    let retained = verified?;
    let observed = retained.is_some();
    Ok(RetainResult {
        observed,
        qos,
        outcome: if observed {
            RetainOutcome::Observed
        } else {
            RetainOutcome::NotDelivered
        },
    })
}
