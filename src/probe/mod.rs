//! Broker capability probing
//!
//! A [`FeatureProber`] runs an ordered list of experiments against one
//! broker under one protocol version. The connect probe always runs first;
//! if it fails nothing else is attempted. Every other probe is independent:
//! its failure is recorded in its own report entry and the run continues.
//!
//! Probes share a [`ProbeContext`] of limits learned so far (topic length,
//! client identifier length, highest working QoS). Later probes read it as a
//! hint and fall back to conservative defaults when a value is missing, so
//! any probe can also run on its own.

pub mod ascii;
pub mod boundary;
mod connect;
pub mod qos;
pub mod result;
pub mod retain;
pub mod size;
pub mod subscription;

#[cfg(test)]
mod tests;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::client::{
    ClientError, ConnectRequest, Connected, Connector, Message, ProbeClient, TlsSettings,
};
use crate::protocol::{ProtocolVersion, QoS};
use crate::topic::{fresh_client_id, probe_topic};

pub use result::{
    AsciiResult, ConnectResult, FailureKind, ProbeEntry, ProbeFailure, ProbeKind, ProbeOutcome,
    ProbeReport, ProbeResult, QosResult, Restrictions, RetainOutcome, RetainResult, SearchAbort,
    SharedSubscriptionResult, SharedVerdict, SizeBoundResult, SizeKind, WildcardCheck,
    WildcardResult,
};

/// Client identifier length every compliant broker must accept
pub const SAFE_CLIENT_ID_LENGTH: usize = 23;

/// Where and how to connect
#[derive(Debug, Clone)]
pub struct ConnectionParams {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<Bytes>,
    pub tls: Option<TlsSettings>,
    /// Bound for connecting and for every acknowledgement
    pub timeout: Duration,
}

impl ConnectionParams {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            username: None,
            password: None,
            tls: None,
            timeout: Duration::from_secs(10),
        }
    }

    pub fn request(&self, version: ProtocolVersion, client_id: &str) -> ConnectRequest {
        let mut request = ConnectRequest::new(version, self.host.clone(), self.port);
        request.client_id = client_id.to_string();
        request.username = self.username.clone();
        request.password = self.password.clone();
        request.tls = self.tls.clone();
        request.timeout = self.timeout;
        request
    }
}

/// Tuning for a probe run
#[derive(Debug, Clone)]
pub struct ProbeSettings {
    /// How long to wait for each expected delivery
    pub message_budget: Duration,
    /// Overall bound for one probe
    pub probe_budget: Duration,
    pub qos_tries: u32,
    pub topic_ceiling: usize,
    pub client_id_ceiling: usize,
    pub payload_ceiling: usize,
    pub shared_sample: u32,
    pub ascii_candidates: Vec<char>,
    /// Run optional probes even where the version profile doesn't by default
    pub run_optional: bool,
    pub skip: BTreeSet<ProbeKind>,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            message_budget: Duration::from_secs(1),
            probe_budget: Duration::from_secs(300),
            qos_tries: 10,
            topic_ceiling: 65535,
            client_id_ceiling: 65535,
            payload_ceiling: 100_000,
            shared_sample: 10,
            ascii_candidates: (0x20u8..=0x7E).map(char::from).collect(),
            run_optional: false,
            skip: BTreeSet::new(),
        }
    }
}

/// Per-version behavior of the prober
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionProfile {
    pub version: ProtocolVersion,
    /// CONNACK carries restriction properties worth recording
    pub reads_restrictions: bool,
    /// Optional probes run without being asked for
    pub optional_by_default: bool,
    pub probes: Vec<ProbeKind>,
}

impl VersionProfile {
    pub fn for_version(version: ProtocolVersion) -> Self {
        match version {
            ProtocolVersion::V311 => Self {
                version,
                reads_restrictions: false,
                optional_by_default: true,
                probes: ProbeKind::ALL.to_vec(),
            },
            ProtocolVersion::V5 => Self {
                version,
                reads_restrictions: true,
                optional_by_default: false,
                probes: ProbeKind::ALL.to_vec(),
            },
        }
    }
}

/// Limits learned by earlier probes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeContext {
    pub max_topic_length: Option<usize>,
    pub max_client_id_length: Option<usize>,
    /// Highest QoS that delivered at least one message
    pub max_qos: Option<QoS>,
    pub restrictions: Option<Restrictions>,
}

impl ProbeContext {
    /// QoS for probe traffic that needs an acknowledgement but not exactly
    /// once semantics: QoS 1 unless the broker is known to do less
    pub fn delivery_qos(&self) -> QoS {
        let mut qos = self.max_qos.unwrap_or(QoS::AtLeastOnce).min(QoS::AtLeastOnce);
        if let Some(ref restrictions) = self.restrictions {
            qos = qos.min(restrictions.maximum_qos);
        }
        qos
    }

    /// Fresh topic that fits the learned topic limit
    pub fn topic(&self) -> String {
        probe_topic(self.max_topic_length)
    }

    pub fn client_id_length(&self) -> usize {
        self.max_client_id_length
            .map_or(SAFE_CLIENT_ID_LENGTH, |max| max.min(SAFE_CLIENT_ID_LENGTH))
            .max(1)
    }

    /// Fresh client identifier that fits the learned length limit
    pub fn client_id(&self) -> String {
        fresh_client_id(self.client_id_length())
    }

    fn learn(&mut self, result: &ProbeResult) {
        match result {
            ProbeResult::Connect(connect) => self.restrictions = connect.restrictions.clone(),
            ProbeResult::SizeBound(size) if size.bound > 0 => match size.kind {
                SizeKind::Topic => self.max_topic_length = Some(size.bound),
                SizeKind::ClientId => self.max_client_id_length = Some(size.bound),
                SizeKind::Payload => {}
            },
            ProbeResult::Qos(qos) if qos.received > 0 => {
                let delivered = qos.qos.min(qos.granted);
                if self.max_qos.map_or(true, |max| delivered > max) {
                    self.max_qos = Some(delivered);
                }
            }
            _ => {}
        }
    }
}

/// What a running probe can reach
pub struct ProbeEnv<'a> {
    pub connector: &'a dyn Connector,
    pub params: &'a ConnectionParams,
    pub settings: &'a ProbeSettings,
    pub version: ProtocolVersion,
    pub context: &'a ProbeContext,
}

impl ProbeEnv<'_> {
    /// Connect with a specific client identifier
    pub async fn connect_as(&self, client_id: &str) -> Result<Connected, ClientError> {
        let request = self.params.request(self.version, client_id);
        self.connector.connect(&request).await
    }

    /// Connect with a fresh client identifier
    pub async fn open(&self) -> Result<Box<dyn ProbeClient>, ClientError> {
        Ok(self.connect_as(&self.context.client_id()).await?.client)
    }
}

/// Receive until a message satisfies `matches` or `wait` elapses
pub async fn wait_for<F>(
    client: &mut dyn ProbeClient,
    wait: Duration,
    mut matches: F,
) -> Result<Option<Message>, ClientError>
where
    F: FnMut(&Message) -> bool,
{
    let deadline = Instant::now() + wait;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(None);
        }
        match client.recv(remaining).await? {
            Some(message) if matches(&message) => return Ok(Some(message)),
            Some(message) => debug!(topic = %message.topic, "ignoring unrelated message"),
            None => return Ok(None),
        }
    }
}

/// Runs the probe battery for one broker and protocol version
pub struct FeatureProber {
    connector: Arc<dyn Connector>,
    params: ConnectionParams,
    settings: ProbeSettings,
    profile: VersionProfile,
}

impl FeatureProber {
    pub fn new(
        connector: Arc<dyn Connector>,
        params: ConnectionParams,
        settings: ProbeSettings,
        version: ProtocolVersion,
    ) -> Self {
        Self::with_profile(
            connector,
            params,
            settings,
            VersionProfile::for_version(version),
        )
    }

    pub fn with_profile(
        connector: Arc<dyn Connector>,
        params: ConnectionParams,
        settings: ProbeSettings,
        profile: VersionProfile,
    ) -> Self {
        Self {
            connector,
            params,
            settings,
            profile,
        }
    }

    pub fn profile(&self) -> &VersionProfile {
        &self.profile
    }

    fn enabled(&self, kind: ProbeKind) -> bool {
        if !kind.is_optional() {
            return true;
        }
        !self.settings.skip.contains(&kind)
            && (self.profile.optional_by_default || self.settings.run_optional)
    }

    /// Run every probe in the profile and report the outcomes
    pub async fn run(self) -> ProbeReport {
        let version = self.profile.version;
        info!(
            "probing {}:{} with {}",
            self.params.host, self.params.port, version
        );

        let mut context = ProbeContext::default();
        let mut entries = Vec::with_capacity(self.profile.probes.len() + 1);
        let mut connected = true;

        let mut probes = self.profile.probes.clone();
        if probes.first() != Some(&ProbeKind::Connect) {
            probes.retain(|kind| *kind != ProbeKind::Connect);
            probes.insert(0, ProbeKind::Connect);
        }

        for kind in probes {
            let outcome = if !connected {
                ProbeOutcome::NotAttempted
            } else if !self.enabled(kind) {
                debug!(probe = %kind, "skipped");
                ProbeOutcome::Skipped
            } else {
                self.run_probe(kind, &mut context).await
            };

            if kind == ProbeKind::Connect && !matches!(outcome, ProbeOutcome::Completed(_)) {
                warn!(%version, "cannot connect, skipping remaining probes");
                connected = false;
            }
            entries.push(ProbeEntry { kind, outcome });
        }

        info!(%version, "probing finished");
        ProbeReport { version, entries }
    }

    async fn run_probe(&self, kind: ProbeKind, context: &mut ProbeContext) -> ProbeOutcome {
        debug!(probe = %kind, "starting");
        let started = Instant::now();
        let env = ProbeEnv {
            connector: self.connector.as_ref(),
            params: &self.params,
            settings: &self.settings,
            version: self.profile.version,
            context: &*context,
        };

        let outcome = match timeout(self.settings.probe_budget, self.dispatch(kind, &env)).await {
            Ok(Ok(result)) => {
                context.learn(&result);
                ProbeOutcome::Completed(result)
            }
            Ok(Err(failure)) => {
                warn!(probe = %kind, "{}", failure);
                ProbeOutcome::Failed(failure)
            }
            Err(_) => {
                warn!(probe = %kind, "probe budget exceeded");
                ProbeOutcome::Failed(ProbeFailure::new(
                    kind,
                    FailureKind::Timeout,
                    format!("did not finish within {:?}", self.settings.probe_budget),
                ))
            }
        };

        debug!(probe = %kind, elapsed = ?started.elapsed(), "finished");
        outcome
    }

    async fn dispatch(
        &self,
        kind: ProbeKind,
        env: &ProbeEnv<'_>,
    ) -> Result<ProbeResult, ProbeFailure> {
        let settings = &self.settings;
        match kind {
            ProbeKind::Connect => connect::run(env, self.profile.reads_restrictions)
                .await
                .map(ProbeResult::Connect),
            ProbeKind::TopicLength => Ok(ProbeResult::SizeBound(
                size::run(env, SizeKind::Topic, settings.topic_ceiling).await,
            )),
            ProbeKind::Qos0 => qos::run(env, QoS::AtMostOnce, settings.qos_tries)
                .await
                .map(ProbeResult::Qos),
            ProbeKind::Qos1 => qos::run(env, QoS::AtLeastOnce, settings.qos_tries)
                .await
                .map(ProbeResult::Qos),
            ProbeKind::Qos2 => qos::run(env, QoS::ExactlyOnce, settings.qos_tries)
                .await
                .map(ProbeResult::Qos),
            ProbeKind::Retain => retain::run(env).await.map(ProbeResult::Retain),
            ProbeKind::Wildcard => subscription::wildcard(env)
                .await
                .map(ProbeResult::Wildcard),
            ProbeKind::SharedSubscription => subscription::shared(env, settings.shared_sample)
                .await
                .map(ProbeResult::SharedSubscription),
            ProbeKind::PayloadSize => Ok(ProbeResult::SizeBound(
                size::run(env, SizeKind::Payload, settings.payload_ceiling).await,
            )),
            ProbeKind::ClientIdLength => Ok(ProbeResult::SizeBound(
                size::run(env, SizeKind::ClientId, settings.client_id_ceiling).await,
            )),
            ProbeKind::AsciiClientId => ascii::run(env, &settings.ascii_candidates)
                .await
                .map(ProbeResult::AsciiClientId),
        }
    }
}
