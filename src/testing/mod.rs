//! In-memory broker simulator
//!
//! [`SimBroker`] implements [`Connector`] without any sockets so probes can
//! be exercised deterministically. Its [`SimBehavior`] decides which sizes,
//! identifiers and subscription features it accepts and how it misbehaves.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::trace;

use crate::client::{
    ClientError, ConnectRequest, Connected, Connector, Message, Operation, ProbeClient,
};
use crate::protocol::{ConnAck, Properties, ProtocolVersion, QoS, ReasonCode};
use crate::topic::{parse_shared_subscription, topic_matches_filter, validate_topic_filter};

/// How the simulator treats `$share/{group}/{filter}` subscriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SharedMode {
    /// Each message goes to exactly one member of the group
    #[default]
    RoundRobin,
    /// Every member receives every message
    Duplicate,
    /// SUBACK with Shared Subscriptions Not Supported
    Reject,
    /// Accepted but never delivered
    Ignore,
}

/// Configurable broker behavior
#[derive(Debug, Clone)]
pub struct SimBehavior {
    /// Refuse every CONNECT with this reason
    pub refuse_connect: Option<ReasonCode>,
    pub max_client_id_length: Option<usize>,
    pub max_topic_length: Option<usize>,
    pub max_payload: Option<usize>,
    /// Acknowledge oversized publishes but never deliver them, instead of
    /// rejecting them
    pub drop_oversized_payloads: bool,
    /// Characters accepted in client identifiers
    pub client_id_chars: fn(char) -> bool,
    pub retain_available: bool,
    /// Accept the retain flag but keep nothing, as a broker that only
    /// forwards live traffic does
    pub store_retained: bool,
    pub plus_wildcard: bool,
    pub hash_wildcard: bool,
    pub shared: SharedMode,
    /// Highest QoS granted to subscriptions and accepted on publish
    pub max_qos: QoS,
    /// Drop every n-th QoS 0 delivery
    pub qos0_loss_every: Option<usize>,
    /// Deliver QoS 1 and QoS 2 messages twice
    pub duplicate_deliveries: bool,
    /// Fail the first n connection attempts with a transport error
    pub transient_connect_failures: usize,
    /// Transport error when connecting with a client id at least this long
    pub io_error_at_client_id_length: Option<usize>,
    /// Transport error when subscribing to a topic at least this long
    pub io_error_at_topic_length: Option<usize>,
    /// Delay before every subscribe and publish completes
    pub latency: Option<Duration>,
    /// CONNACK properties sent to MQTT 5 clients
    pub connack_properties: Properties,
}

fn any_char(_: char) -> bool {
    true
}

impl Default for SimBehavior {
    fn default() -> Self {
        Self {
            refuse_connect: None,
            max_client_id_length: None,
            max_topic_length: None,
            max_payload: None,
            drop_oversized_payloads: false,
            client_id_chars: any_char,
            retain_available: true,
            store_retained: true,
            plus_wildcard: true,
            hash_wildcard: true,
            shared: SharedMode::RoundRobin,
            max_qos: QoS::ExactlyOnce,
            qos0_loss_every: None,
            duplicate_deliveries: false,
            transient_connect_failures: 0,
            io_error_at_client_id_length: None,
            io_error_at_topic_length: None,
            latency: None,
            connack_properties: Properties::default(),
        }
    }
}

struct SimSubscription {
    filter: String,
    group: Option<String>,
    qos: QoS,
}

struct SimSession {
    client_id: String,
    subscriptions: Vec<SimSubscription>,
    inbox: mpsc::UnboundedSender<Message>,
}

#[derive(Default)]
struct SimState {
    sessions: HashMap<u64, SimSession>,
    retained: HashMap<String, Message>,
    next_session: u64,
    connect_attempts: usize,
    qos0_deliveries: usize,
    shared_cursor: usize,
}

struct Shared {
    behavior: SimBehavior,
    state: Mutex<SimState>,
}

/// Simulated broker. Cloning shares the same state.
#[derive(Clone)]
pub struct SimBroker {
    shared: Arc<Shared>,
}

impl SimBroker {
    pub fn new(behavior: SimBehavior) -> Self {
        Self {
            shared: Arc::new(Shared {
                behavior,
                state: Mutex::new(SimState::default()),
            }),
        }
    }

    /// A broker that supports everything
    pub fn compliant() -> Self {
        Self::new(SimBehavior::default())
    }

    pub fn behavior(&self) -> &SimBehavior {
        &self.shared.behavior
    }

    /// Connections currently held open by clients
    pub fn open_connections(&self) -> usize {
        self.shared.state.lock().sessions.len()
    }

    /// Connection attempts seen so far, successful or not
    pub fn connect_attempts(&self) -> usize {
        self.shared.state.lock().connect_attempts
    }

    /// Number of retained messages currently stored
    pub fn retained_count(&self) -> usize {
        self.shared.state.lock().retained.len()
    }

    /// Store a retained message as if a client had published it earlier
    pub fn seed_retained(&self, topic: &str, payload: impl Into<Bytes>) {
        let message = Message {
            topic: topic.to_string(),
            payload: payload.into(),
            qos: QoS::AtMostOnce,
            retain: true,
        };
        self.shared
            .state
            .lock()
            .retained
            .insert(topic.to_string(), message);
    }

    fn admit(&self, request: &ConnectRequest) -> Result<(), ClientError> {
        let behavior = &self.shared.behavior;
        let id_len = request.client_id.len();

        if behavior
            .io_error_at_client_id_length
            .is_some_and(|limit| id_len >= limit)
        {
            return Err(ClientError::Io("connection reset by peer".to_string()));
        }
        if let Some(reason) = behavior.refuse_connect {
            return Err(ClientError::Refused(reason));
        }

        let id_rejected = behavior.max_client_id_length.is_some_and(|max| id_len > max)
            || !request.client_id.chars().all(behavior.client_id_chars);
        if id_rejected {
            return Err(ClientError::Refused(ReasonCode::ClientIdNotValid));
        }
        Ok(())
    }

    fn route(&self, state: &mut SimState, message: &Message) {
        let behavior = &self.shared.behavior;
        let mut targets: Vec<(u64, QoS)> = Vec::new();
        let mut groups: HashMap<&str, Vec<(u64, QoS)>> = HashMap::new();

        for (&id, session) in &state.sessions {
            for sub in &session.subscriptions {
                if !topic_matches_filter(&message.topic, &sub.filter) {
                    continue;
                }
                let qos = message.qos.min(sub.qos);
                match sub.group.as_deref() {
                    None => targets.push((id, qos)),
                    Some(group) => groups.entry(group).or_default().push((id, qos)),
                }
            }
        }

        for (_, mut members) in groups {
            match behavior.shared {
                SharedMode::Duplicate => targets.extend(members),
                SharedMode::RoundRobin => {
                    members.sort_by_key(|(id, _)| *id);
                    let pick = members[state.shared_cursor % members.len()];
                    state.shared_cursor += 1;
                    targets.push(pick);
                }
                SharedMode::Reject | SharedMode::Ignore => {}
            }
        }

        for (id, qos) in targets {
            if qos == QoS::AtMostOnce {
                state.qos0_deliveries += 1;
                if behavior
                    .qos0_loss_every
                    .is_some_and(|n| n > 0 && state.qos0_deliveries % n == 0)
                {
                    trace!(topic = %message.topic, "dropping QoS 0 delivery");
                    continue;
                }
            }
            let Some(session) = state.sessions.get(&id) else {
                continue;
            };
            let delivery = Message {
                qos,
                retain: false,
                ..message.clone()
            };
            let copies = if behavior.duplicate_deliveries && qos != QoS::AtMostOnce {
                2
            } else {
                1
            };
            for _ in 0..copies {
                let _ = session.inbox.send(delivery.clone());
            }
        }
    }
}

#[async_trait]
impl Connector for SimBroker {
    async fn connect(&self, request: &ConnectRequest) -> Result<Connected, ClientError> {
        let behavior = &self.shared.behavior;
        let mut state = self.shared.state.lock();
        state.connect_attempts += 1;
        if state.connect_attempts <= behavior.transient_connect_failures {
            return Err(ClientError::Io("connection refused".to_string()));
        }
        self.admit(request)?;

        let id = state.next_session;
        state.next_session += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        state.sessions.insert(
            id,
            SimSession {
                client_id: request.client_id.clone(),
                subscriptions: Vec::new(),
                inbox: tx,
            },
        );
        trace!(client_id = %request.client_id, "simulated client connected");

        let properties = match request.version {
            ProtocolVersion::V5 => behavior.connack_properties.clone(),
            ProtocolVersion::V311 => Properties::default(),
        };
        Ok(Connected {
            connack: ConnAck {
                session_present: false,
                reason_code: ReasonCode::Success,
                properties,
            },
            client: Box::new(SimClient {
                broker: self.clone(),
                session: id,
                client_id: request.client_id.clone(),
                inbox: rx,
                connected: true,
            }),
        })
    }
}

/// Client connection to a [`SimBroker`]. Dropping it releases the session.
pub struct SimClient {
    broker: SimBroker,
    session: u64,
    client_id: String,
    inbox: mpsc::UnboundedReceiver<Message>,
    connected: bool,
}

impl SimClient {
    fn ensure_connected(&self) -> Result<(), ClientError> {
        if self.connected {
            Ok(())
        } else {
            Err(ClientError::Closed(None))
        }
    }

    async fn delay(&self) {
        if let Some(latency) = self.broker.shared.behavior.latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn release(&mut self) {
        if self.connected {
            self.connected = false;
            self.broker.shared.state.lock().sessions.remove(&self.session);
        }
    }
}

impl Drop for SimClient {
    fn drop(&mut self) {
        self.release();
    }
}

fn rejected(operation: Operation, reason: ReasonCode) -> ClientError {
    ClientError::Rejected { operation, reason }
}

#[async_trait]
impl ProbeClient for SimClient {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    async fn subscribe(&mut self, filter: &str, qos: QoS) -> Result<QoS, ClientError> {
        self.ensure_connected()?;
        self.delay().await;

        let behavior = &self.broker.shared.behavior;
        let (group, actual) = match parse_shared_subscription(filter) {
            Some((group, actual)) => (Some(group.to_string()), actual),
            None => (None, filter),
        };

        if behavior
            .io_error_at_topic_length
            .is_some_and(|limit| actual.len() >= limit)
        {
            return Err(ClientError::Io("connection reset by peer".to_string()));
        }
        if validate_topic_filter(filter).is_err()
            || behavior.max_topic_length.is_some_and(|max| actual.len() > max)
        {
            return Err(rejected(Operation::Subscribe, ReasonCode::TopicFilterInvalid));
        }
        if (actual.contains('+') && !behavior.plus_wildcard)
            || (actual.contains('#') && !behavior.hash_wildcard)
        {
            return Err(rejected(
                Operation::Subscribe,
                ReasonCode::WildcardSubsNotSupported,
            ));
        }
        if group.is_some() && behavior.shared == SharedMode::Reject {
            return Err(rejected(
                Operation::Subscribe,
                ReasonCode::SharedSubsNotSupported,
            ));
        }

        let granted = qos.min(behavior.max_qos);
        let mut state = self.broker.shared.state.lock();
        let retained: Vec<Message> = if group.is_none() {
            state
                .retained
                .values()
                .filter(|m| topic_matches_filter(&m.topic, actual))
                .cloned()
                .collect()
        } else {
            Vec::new()
        };
        let session = state
            .sessions
            .get_mut(&self.session)
            .ok_or(ClientError::Closed(None))?;
        session.subscriptions.push(SimSubscription {
            filter: actual.to_string(),
            group,
            qos: granted,
        });
        for message in retained {
            let _ = session.inbox.send(Message {
                qos: message.qos.min(granted),
                ..message
            });
        }
        trace!(client_id = %session.client_id, filter, "simulated subscribe");
        Ok(granted)
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), ClientError> {
        self.ensure_connected()?;
        self.delay().await;

        let shared = self.broker.shared.clone();
        let behavior = &shared.behavior;
        if qos > behavior.max_qos {
            self.release();
            return Err(ClientError::Closed(Some(ReasonCode::QoSNotSupported)));
        }
        if behavior.max_topic_length.is_some_and(|max| topic.len() > max) {
            return Err(rejected(Operation::Publish, ReasonCode::TopicNameInvalid));
        }
        if retain && !behavior.retain_available {
            return Err(rejected(Operation::Publish, ReasonCode::RetainNotSupported));
        }
        if behavior.max_payload.is_some_and(|max| payload.len() > max) {
            if behavior.drop_oversized_payloads {
                return Ok(());
            }
            return Err(rejected(Operation::Publish, ReasonCode::PacketTooLarge));
        }

        let message = Message {
            topic: topic.to_string(),
            payload,
            qos,
            retain,
        };
        let mut state = self.broker.shared.state.lock();
        if retain && behavior.store_retained {
            if message.payload.is_empty() {
                state.retained.remove(topic);
            } else {
                state.retained.insert(topic.to_string(), message.clone());
            }
        }
        self.broker.route(&mut state, &message);
        Ok(())
    }

    async fn recv(&mut self, wait: Duration) -> Result<Option<Message>, ClientError> {
        match tokio::time::timeout(wait, self.inbox.recv()).await {
            Ok(Some(message)) => Ok(Some(message)),
            Ok(None) => Err(ClientError::Closed(None)),
            Err(_) => Ok(None),
        }
    }

    async fn disconnect(&mut self) {
        self.release();
    }
}
