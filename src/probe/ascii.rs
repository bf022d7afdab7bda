//! Characters accepted in client identifiers

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use super::{AsciiResult, FailureKind, ProbeEnv, ProbeFailure, ProbeKind};
use crate::client::ClientError;
use crate::topic::fresh_client_id;

/// Alphanumeric prefix put in front of each candidate character
const PREFIX_LENGTH: usize = 8;

pub async fn run(env: &ProbeEnv<'_>, candidates: &[char]) -> Result<AsciiResult, ProbeFailure> {
    if candidates.is_empty() {
        return Err(ProbeFailure::new(
            ProbeKind::AsciiClientId,
            FailureKind::Indeterminate,
            "no candidate characters configured",
        ));
    }
    let all: String = candidates.iter().collect();

    // One connection with every candidate, when the identifier fits
    let fits = env
        .context
        .max_client_id_length
        .is_some_and(|max| all.len() <= max);
    if fits && attempt(env, &all).await.is_ok() {
        debug!("all candidate characters accepted at once");
        return Ok(AsciiResult {
            candidates: all,
            all_at_once: true,
            unsupported: BTreeSet::new(),
            rejections: BTreeMap::new(),
        });
    }

    let mut unsupported = BTreeSet::new();
    let mut rejections = BTreeMap::new();
    for &c in candidates {
        let client_id = format!("{}{}", fresh_client_id(PREFIX_LENGTH), c);
        if let Err(e) = attempt(env, &client_id).await {
            debug!(character = ?c, error = %e, "character not accepted");
            unsupported.insert(c);
            rejections.insert(c, e.to_string());
        }
    }

    Ok(AsciiResult {
        candidates: all,
        all_at_once: false,
        unsupported,
        rejections,
    })
}

/// Connect once, retrying a single time on any failure
async fn attempt(env: &ProbeEnv<'_>, client_id: &str) -> Result<(), ClientError> {
    let mut last = None;
    for _ in 0..2 {
        match env.connect_as(client_id).await {
            Ok(mut connected) => {
                connected.client.disconnect().await;
                return Ok(());
            }
            Err(e) => last = Some(e),
        }
    }
    Err(last.unwrap_or(ClientError::Closed(None)))
}
