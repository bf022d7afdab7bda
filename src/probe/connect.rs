//! Connection acceptance and the limits announced in CONNACK

use tracing::debug;

use super::{ConnectResult, FailureKind, ProbeEnv, ProbeFailure, ProbeKind, Restrictions};
use crate::client::{ClientError, Connected};

/// Open one connection, record the CONNACK and close it again
pub(super) async fn run(
    env: &ProbeEnv<'_>,
    reads_restrictions: bool,
) -> Result<ConnectResult, ProbeFailure> {
    let client_id = env.context.client_id();
    let Connected { connack, mut client } = env.connect_as(&client_id).await.map_err(|e| {
        let kind = match e {
            ClientError::Timeout(_) => FailureKind::Timeout,
            _ => FailureKind::Connect,
        };
        let mut failure = ProbeFailure::new(ProbeKind::Connect, kind, e.to_string())
            .attempted(format!("{}:{}", env.params.host, env.params.port));
        failure.reason_code = e.reason_code();
        failure
    })?;
    client.disconnect().await;

    debug!(
        reason = %connack.reason_code,
        session_present = connack.session_present,
        "connect accepted"
    );

    Ok(ConnectResult {
        accepted: true,
        reason_code: connack.reason_code,
        session_present: connack.session_present,
        restrictions: reads_restrictions.then(|| Restrictions::from_properties(&connack.properties)),
    })
}
