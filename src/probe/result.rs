//! Probe outcomes and the per-version report

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;

use crate::client::ClientError;
use crate::protocol::{Properties, ProtocolVersion, QoS, ReasonCode};

/// Probes in canonical run order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProbeKind {
    Connect,
    TopicLength,
    Qos0,
    Qos1,
    Qos2,
    Retain,
    Wildcard,
    SharedSubscription,
    PayloadSize,
    ClientIdLength,
    AsciiClientId,
}

impl ProbeKind {
    pub const ALL: [ProbeKind; 11] = [
        ProbeKind::Connect,
        ProbeKind::TopicLength,
        ProbeKind::Qos0,
        ProbeKind::Qos1,
        ProbeKind::Qos2,
        ProbeKind::Retain,
        ProbeKind::Wildcard,
        ProbeKind::SharedSubscription,
        ProbeKind::PayloadSize,
        ProbeKind::ClientIdLength,
        ProbeKind::AsciiClientId,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ProbeKind::Connect => "connect",
            ProbeKind::TopicLength => "topic-length",
            ProbeKind::Qos0 => "qos0",
            ProbeKind::Qos1 => "qos1",
            ProbeKind::Qos2 => "qos2",
            ProbeKind::Retain => "retain",
            ProbeKind::Wildcard => "wildcard",
            ProbeKind::SharedSubscription => "shared-subscription",
            ProbeKind::PayloadSize => "payload-size",
            ProbeKind::ClientIdLength => "client-id-length",
            ProbeKind::AsciiClientId => "ascii-client-id",
        }
    }

    /// Parse a probe name as accepted by `--skip` and `probe.skip`
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim().to_ascii_lowercase().replace('_', "-");
        Self::ALL.into_iter().find(|kind| kind.name() == s)
    }

    /// Every probe except connect may be skipped
    pub fn is_optional(self) -> bool {
        self != ProbeKind::Connect
    }

    /// QoS level measured by the reliability probes
    pub fn qos(self) -> Option<QoS> {
        match self {
            ProbeKind::Qos0 => Some(QoS::AtMostOnce),
            ProbeKind::Qos1 => Some(QoS::AtLeastOnce),
            ProbeKind::Qos2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Limits a v5 broker announced in CONNACK, with absent properties resolved
/// to their protocol defaults
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Restrictions {
    pub retain_available: bool,
    pub wildcard_subscription_available: bool,
    pub shared_subscription_available: bool,
    pub subscription_identifiers_available: bool,
    pub maximum_qos: QoS,
    pub receive_maximum: u16,
    pub maximum_packet_size: Option<u32>,
    pub topic_alias_maximum: u16,
    pub session_expiry_interval: Option<u32>,
    pub server_keep_alive: Option<u16>,
    pub assigned_client_identifier: Option<String>,
}

impl Default for Restrictions {
    fn default() -> Self {
        Self::from_properties(&Properties::default())
    }
}

impl Restrictions {
    pub fn from_properties(props: &Properties) -> Self {
        let flag = |value: Option<u8>| value.map_or(true, |v| v != 0);
        Self {
            retain_available: flag(props.retain_available),
            wildcard_subscription_available: flag(props.wildcard_subscription_available),
            shared_subscription_available: flag(props.shared_subscription_available),
            subscription_identifiers_available: flag(props.subscription_identifier_available),
            maximum_qos: props
                .maximum_qos
                .and_then(QoS::from_u8)
                .unwrap_or(QoS::ExactlyOnce),
            receive_maximum: props.receive_maximum.unwrap_or(u16::MAX),
            maximum_packet_size: props.maximum_packet_size,
            topic_alias_maximum: props.topic_alias_maximum.unwrap_or(0),
            session_expiry_interval: props.session_expiry_interval,
            server_keep_alive: props.server_keep_alive,
            assigned_client_identifier: props.assigned_client_identifier.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectResult {
    pub accepted: bool,
    pub reason_code: ReasonCode,
    pub session_present: bool,
    pub restrictions: Option<Restrictions>,
}

/// Quantity searched by a boundary probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeKind {
    Topic,
    ClientId,
    Payload,
}

impl fmt::Display for SizeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SizeKind::Topic => write!(f, "topic length"),
            SizeKind::ClientId => write!(f, "client id length"),
            SizeKind::Payload => write!(f, "payload size"),
        }
    }
}

/// Why a boundary search stopped before converging
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchAbort {
    /// Size being evaluated when the error occurred
    pub attempted: usize,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SizeBoundResult {
    pub kind: SizeKind,
    /// Largest size confirmed to work
    pub bound: usize,
    pub ceiling: usize,
    /// The ceiling itself was accepted; the real limit may be higher
    pub search_exhausted_ceiling: bool,
    pub evaluations: usize,
    /// Set when an error cut the search short, making `bound` a lower bound
    pub aborted: Option<SearchAbort>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QosResult {
    pub qos: QoS,
    pub granted: QoS,
    pub requested: u32,
    pub received: u32,
    pub elapsed_nanos: u64,
}

impl QosResult {
    pub fn elapsed_millis(&self) -> f64 {
        self.elapsed_nanos as f64 / 1_000_000.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum RetainOutcome {
    /// The late subscriber received the retained message
    Observed,
    /// The retained publish was accepted but never replayed
    NotDelivered,
    /// The broker refused the retained publish
    PublishRejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetainResult {
    pub observed: bool,
    pub qos: QoS,
    pub outcome: RetainOutcome,
}

/// Result of a single wildcard subscription check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum WildcardCheck {
    Ok,
    SubscribeFailed(String),
    PublishFailed(String),
    TimedOut,
}

impl WildcardCheck {
    pub fn is_ok(&self) -> bool {
        *self == WildcardCheck::Ok
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WildcardResult {
    pub plus_supported: bool,
    pub hash_supported: bool,
    pub plus: WildcardCheck,
    pub hash: WildcardCheck,
}

impl WildcardResult {
    pub fn supported(&self) -> bool {
        self.plus_supported && self.hash_supported
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SharedVerdict {
    Supported,
    Unsupported,
    Indeterminate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SharedSubscriptionResult {
    pub verdict: SharedVerdict,
    pub published: u32,
    /// Distinct messages received across the group
    pub delivered: u32,
    /// Extra copies beyond the first for any message
    pub duplicates: u32,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AsciiResult {
    pub candidates: String,
    /// All candidates were accepted in a single identifier
    pub all_at_once: bool,
    pub unsupported: BTreeSet<char>,
    /// Last failure seen for each unsupported character
    pub rejections: BTreeMap<char, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProbeResult {
    Connect(ConnectResult),
    SizeBound(SizeBoundResult),
    Qos(QosResult),
    Retain(RetainResult),
    Wildcard(WildcardResult),
    SharedSubscription(SharedSubscriptionResult),
    AsciiClientId(AsciiResult),
}

/// Failure category of a probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Could not establish a connection
    Connect,
    /// The broker refused an operation the probe depends on
    Rejected,
    Timeout,
    Transport,
    /// The broker's answer could not be classified
    Indeterminate,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Connect => write!(f, "connect failure"),
            FailureKind::Rejected => write!(f, "rejected"),
            FailureKind::Timeout => write!(f, "timeout"),
            FailureKind::Transport => write!(f, "transport error"),
            FailureKind::Indeterminate => write!(f, "indeterminate"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeFailure {
    pub probe: ProbeKind,
    pub kind: FailureKind,
    /// Value under test when the failure occurred
    pub attempted: Option<String>,
    /// Reason code the broker answered with
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason_code: Option<ReasonCode>,
    pub detail: String,
}

impl ProbeFailure {
    pub fn new(probe: ProbeKind, kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            probe,
            kind,
            attempted: None,
            reason_code: None,
            detail: detail.into(),
        }
    }

    /// Classify a client error raised while running `probe`
    pub fn from_client_error(probe: ProbeKind, err: &ClientError) -> Self {
        let kind = match err {
            ClientError::Refused(_) => FailureKind::Connect,
            ClientError::Rejected { .. } | ClientError::Closed(_) => FailureKind::Rejected,
            ClientError::Timeout(_) => FailureKind::Timeout,
            ClientError::Io(_) | ClientError::Tls(_) => FailureKind::Transport,
            ClientError::Protocol(_) => FailureKind::Indeterminate,
        };
        let mut failure = Self::new(probe, kind, err.to_string());
        failure.reason_code = err.reason_code();
        failure
    }

    pub fn attempted(mut self, value: impl Into<String>) -> Self {
        self.attempted = Some(value.into());
        self
    }
}

impl fmt::Display for ProbeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.probe, self.kind, self.detail)?;
        if let Some(ref attempted) = self.attempted {
            write!(f, " (attempted {})", attempted)?;
        }
        Ok(())
    }
}

impl std::error::Error for ProbeFailure {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum ProbeOutcome {
    Completed(ProbeResult),
    Failed(ProbeFailure),
    Skipped,
    NotAttempted,
}

impl ProbeOutcome {
    pub fn result(&self) -> Option<&ProbeResult> {
        match self {
            ProbeOutcome::Completed(result) => Some(result),
            _ => None,
        }
    }

    pub fn failure(&self) -> Option<&ProbeFailure> {
        match self {
            ProbeOutcome::Failed(failure) => Some(failure),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeEntry {
    pub kind: ProbeKind,
    pub outcome: ProbeOutcome,
}

/// Everything learned about one broker under one protocol version
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeReport {
    pub version: ProtocolVersion,
    pub entries: Vec<ProbeEntry>,
}

impl ProbeReport {
    pub fn outcome(&self, kind: ProbeKind) -> Option<&ProbeOutcome> {
        self.entries
            .iter()
            .find(|entry| entry.kind == kind)
            .map(|entry| &entry.outcome)
    }

    pub fn result(&self, kind: ProbeKind) -> Option<&ProbeResult> {
        self.outcome(kind).and_then(ProbeOutcome::result)
    }

    /// True when the mandatory connect probe failed
    pub fn aborted(&self) -> bool {
        !matches!(
            self.outcome(ProbeKind::Connect),
            Some(ProbeOutcome::Completed(_))
        )
    }
}
