//! Size limits found by boundary search
//!
//! Each evaluation uses fresh connections and fresh names. A size counts as
//! rejected when the broker refuses it (negative ack, refused CONNACK for
//! client identifiers, closed connection) or acknowledges it without ever
//! delivering it. Anything else aborts the search.

use bytes::Bytes;
use tracing::{debug, info};

use super::boundary::{self, SearchOutcome};
use super::{wait_for, ProbeEnv, SearchAbort, SizeBoundResult, SizeKind};
use crate::client::ClientError;
use crate::topic::{fresh_client_id, fresh_topic, probe_marker};

/// Search for the largest accepted size of `kind` up to `ceiling`
pub async fn run(env: &ProbeEnv<'_>, kind: SizeKind, ceiling: usize) -> SizeBoundResult {
    let outcome: SearchOutcome<ClientError> =
        boundary::search(ceiling, |n| accepts(env, kind, n)).await;

    let result = SizeBoundResult {
        kind,
        bound: outcome.bound,
        ceiling: outcome.ceiling,
        search_exhausted_ceiling: outcome.exhausted_ceiling,
        evaluations: outcome.evaluations,
        aborted: outcome.aborted.map(|aborted| SearchAbort {
            attempted: aborted.attempted,
            detail: aborted.error.to_string(),
        }),
    };
    info!(
        bound = result.bound,
        evaluations = result.evaluations,
        exhausted = result.search_exhausted_ceiling,
        "{} search finished",
        kind
    );
    result
}

async fn accepts(env: &ProbeEnv<'_>, kind: SizeKind, n: usize) -> Result<bool, ClientError> {
    let accepted = match kind {
        SizeKind::Topic => {
            let topic = fresh_topic(n);
            let marker = Bytes::from(probe_marker());
            round_trip(env, &topic, marker).await?
        }
        SizeKind::Payload => {
            let payload: Bytes = (0..n).map(|i| (i % 251) as u8).collect();
            round_trip(env, &env.context.topic(), payload).await?
        }
        SizeKind::ClientId => match env.connect_as(&fresh_client_id(n)).await {
            Ok(mut connected) => {
                connected.client.disconnect().await;
                true
            }
            Err(e) if e.is_rejection() => {
                debug!(length = n, error = %e, "client id rejected");
                false
            }
            Err(e) => return Err(e),
        },
    };
    debug!(size = n, accepted, "{} evaluated", kind);
    Ok(accepted)
}

/// `Ok(true)` when the operation went through, `Ok(false)` when the broker
/// refused it
fn accepted<T>(result: Result<T, ClientError>) -> Result<bool, ClientError> {
    match result {
        Ok(_) => Ok(true),
        Err(e) if e.is_rejection() => {
            debug!(error = %e, "rejected");
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

/// Subscribe, publish `payload` from a second connection and check that it
/// comes back unchanged
async fn round_trip(env: &ProbeEnv<'_>, topic: &str, payload: Bytes) -> Result<bool, ClientError> {
    let qos = env.context.delivery_qos();

    let mut subscriber = env.open().await?;
    if !accepted(subscriber.subscribe(topic, qos).await)? {
        return Ok(false);
    }

    let mut publisher = env.open().await?;
    if !accepted(publisher.publish(topic, payload.clone(), qos, false).await)? {
        return Ok(false);
    }

    let received = wait_for(subscriber.as_mut(), env.settings.message_budget, |m| {
        m.topic == topic && m.payload == payload
    })
    .await;
    let delivered = match received {
        Ok(message) => message.is_some(),
        Err(e) if e.is_rejection() => false,
        Err(e) => return Err(e),
    };
    publisher.disconnect().await;
    subscriber.disconnect().await;
    Ok(delivered)
}
