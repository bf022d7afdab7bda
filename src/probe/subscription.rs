//! Wildcard and shared subscription semantics

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{
    wait_for, FailureKind, ProbeEnv, ProbeFailure, ProbeKind, SharedSubscriptionResult,
    SharedVerdict, WildcardCheck, WildcardResult,
};
use crate::client::{ClientError, Message, ProbeClient};
use crate::topic::{fresh_token, probe_marker, shared_filter, DEFAULT_TOPIC_LENGTH};

/// Appended to the base topic for the `#` check
const WILDCARD_SUFFIX: &str = "/test/subtopic";

/// Subscribe `base/+` and `base/#` and check each receives a matching
/// publish
pub async fn wildcard(env: &ProbeEnv<'_>) -> Result<WildcardResult, ProbeFailure> {
    let base_len = env
        .context
        .max_topic_length
        .map_or(DEFAULT_TOPIC_LENGTH, |max| {
            max.saturating_sub(WILDCARD_SUFFIX.len()).min(DEFAULT_TOPIC_LENGTH)
        })
        .max(1);
    let base = fresh_token(base_len);

    let plus = check(env, &format!("{}/+", base), &format!("{}/test", base)).await?;
    let hash = check(
        env,
        &format!("{}/#", base),
        &format!("{}{}", base, WILDCARD_SUFFIX),
    )
    .await?;

    Ok(WildcardResult {
        plus_supported: plus.is_ok(),
        hash_supported: hash.is_ok(),
        plus,
        hash,
    })
}

async fn check(
    env: &ProbeEnv<'_>,
    filter: &str,
    topic: &str,
) -> Result<WildcardCheck, ProbeFailure> {
    let fail = |e| ProbeFailure::from_client_error(ProbeKind::Wildcard, &e);
    let qos = env.context.delivery_qos();

    let mut subscriber = env.open().await.map_err(fail)?;
    if let Err(e) = subscriber.subscribe(filter, qos).await {
        debug!(filter, error = %e, "wildcard subscription failed");
        return Ok(WildcardCheck::SubscribeFailed(e.to_string()));
    }

    let mut publisher = env.open().await.map_err(fail)?;
    let payload = Bytes::from(probe_marker());
    if let Err(e) = publisher.publish(topic, payload.clone(), qos, false).await {
        return Ok(WildcardCheck::PublishFailed(e.to_string()));
    }

    let received = wait_for(subscriber.as_mut(), env.settings.message_budget, |m| {
        m.topic == topic && m.payload == payload
    })
    .await;
    publisher.disconnect().await;
    subscriber.disconnect().await;

    Ok(match received {
        Ok(Some(_)) => WildcardCheck::Ok,
        Ok(None) => WildcardCheck::TimedOut,
        Err(e) => {
            debug!(filter, error = %e, "wildcard subscriber lost");
            WildcardCheck::TimedOut
        }
    })
}

/// Join two subscribers to one share group and check that every message
/// reaches exactly one of them
pub async fn shared(
    env: &ProbeEnv<'_>,
    sample: u32,
) -> Result<SharedSubscriptionResult, ProbeFailure> {
    let kind = ProbeKind::SharedSubscription;
    let fail = |e| ProbeFailure::from_client_error(kind, &e);
    let qos = env.context.delivery_qos();
    let topic = env.context.topic();
    let filter = shared_filter(&fresh_token(8), &topic);

    let mut first = match join(env, &filter).await? {
        Ok(member) => member,
        Err(detail) => return Ok(unsupported(detail)),
    };
    let mut second = match join(env, &filter).await? {
        Ok(member) => member,
        Err(detail) => return Ok(unsupported(detail)),
    };

    let mut publisher = env.open().await.map_err(fail)?;
    let marker = probe_marker();
    let mut published = 0;
    for seq in 0..sample {
        let payload = Bytes::from(format!("{}:{}", marker, seq));
        match publisher.publish(&topic, payload, qos, false).await {
            Ok(()) => published += 1,
            Err(e) => warn!(seq, error = %e, "shared subscription publish failed"),
        }
    }
    publisher.disconnect().await;
    if published == 0 {
        return Err(ProbeFailure::new(
            kind,
            FailureKind::Rejected,
            "no message could be published",
        )
        .attempted(topic));
    }

    let counts = tally(
        first.as_mut(),
        second.as_mut(),
        &marker,
        published,
        env.settings.message_budget,
    )
    .await;
    first.disconnect().await;
    second.disconnect().await;

    let delivered = counts.values().filter(|c| **c > 0).count() as u32;
    let duplicates: u32 = counts.values().map(|c| c.saturating_sub(1)).sum();
    debug!(published, delivered, duplicates, "shared subscription tally");

    let (verdict, detail) = if delivered == 0 {
        (
            SharedVerdict::Unsupported,
            Some("no message delivered".to_string()),
        )
    } else if duplicates > 0 {
        (
            SharedVerdict::Unsupported,
            Some("messages delivered to more than one member".to_string()),
        )
    } else if delivered == sample && published == sample {
        (SharedVerdict::Supported, None)
    } else {
        (
            SharedVerdict::Indeterminate,
            Some(format!("{} of {} messages delivered", delivered, sample)),
        )
    };

    Ok(SharedSubscriptionResult {
        verdict,
        published,
        delivered,
        duplicates,
        detail,
    })
}

/// Subscribe one group member. The inner error carries the broker's
/// refusal.
async fn join(
    env: &ProbeEnv<'_>,
    filter: &str,
) -> Result<Result<Box<dyn ProbeClient>, String>, ProbeFailure> {
    let fail = |e| ProbeFailure::from_client_error(ProbeKind::SharedSubscription, &e);
    let mut member = env.open().await.map_err(fail)?;
    match member.subscribe(filter, env.context.delivery_qos()).await {
        Ok(_) => Ok(Ok(member)),
        Err(e) if e.is_rejection() => Ok(Err(format!("subscribe rejected: {}", e))),
        Err(e) => Err(fail(e).attempted(filter)),
    }
}

fn unsupported(detail: String) -> SharedSubscriptionResult {
    SharedSubscriptionResult {
        verdict: SharedVerdict::Unsupported,
        published: 0,
        delivered: 0,
        duplicates: 0,
        detail: Some(detail),
    }
}

/// Count copies of each sequence number received by either member. Once
/// every message has arrived, keep listening for `grace` to catch copies
/// still in flight to the other member.
async fn tally(
    first: &mut dyn ProbeClient,
    second: &mut dyn ProbeClient,
    marker: &str,
    expected: u32,
    grace: Duration,
) -> HashMap<u32, u32> {
    let mut counts: HashMap<u32, u32> = HashMap::new();
    let mut deadline = Instant::now() + grace.saturating_mul(expected);
    let mut all_seen = false;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        let received: Result<Option<Message>, ClientError> = tokio::select! {
            r = first.recv(remaining) => r,
            r = second.recv(remaining) => r,
        };
        match received {
            Ok(Some(message)) => {
                let seq = std::str::from_utf8(&message.payload)
                    .ok()
                    .and_then(|text| text.strip_prefix(marker))
                    .and_then(|rest| rest.strip_prefix(':'))
                    .and_then(|seq| seq.parse::<u32>().ok());
                if let Some(seq) = seq {
                    *counts.entry(seq).or_default() += 1;
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "shared subscriber lost");
                break;
            }
        }

        if !all_seen && counts.len() as u32 >= expected {
            all_seen = true;
            deadline = Instant::now() + grace;
        }
    }
    counts
}
