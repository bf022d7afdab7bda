//! Connections to the broker under test
//!
//! Probes never touch sockets directly. They ask a [`Connector`] for a fresh
//! connection and drive it through the [`ProbeClient`] interface, which lets
//! the same probe logic run against a real broker ([`MqttConnector`]) or the
//! in-memory simulator in [`crate::testing`].

mod connection;
pub mod tls;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::protocol::{ConnAck, DecodeError, EncodeError, ProtocolVersion, QoS, ReasonCode};

pub use connection::{MqttClient, MqttConnector};
pub use tls::{TlsError, TlsSettings};

/// Parameters for opening one connection
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub version: ProtocolVersion,
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<Bytes>,
    pub tls: Option<TlsSettings>,
    /// Bound for the TCP/TLS handshake plus CONNACK, and for every later
    /// acknowledgement on this connection
    pub timeout: Duration,
    pub keep_alive: u16,
}

impl ConnectRequest {
    pub fn new(version: ProtocolVersion, host: impl Into<String>, port: u16) -> Self {
        Self {
            version,
            host: host.into(),
            port,
            client_id: String::new(),
            username: None,
            password: None,
            tls: None,
            timeout: Duration::from_secs(10),
            keep_alive: 60,
        }
    }

    /// Same endpoint and credentials under another client identifier
    pub fn with_client_id(&self, client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            ..self.clone()
        }
    }
}

/// Message delivered to a subscriber
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// Operation a broker acknowledged or refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Connect,
    Subscribe,
    Publish,
    Receive,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Connect => write!(f, "connect"),
            Operation::Subscribe => write!(f, "subscribe"),
            Operation::Publish => write!(f, "publish"),
            Operation::Receive => write!(f, "receive"),
        }
    }
}

/// Errors from a probe connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// Network failure (resolve, connect, read, write)
    Io(String),
    /// TLS handshake failure
    Tls(String),
    /// No response within the configured bound
    Timeout(Operation),
    /// CONNACK with a failure reason
    Refused(ReasonCode),
    /// Negative SUBACK/PUBACK/PUBREC/PUBCOMP, or a request the broker
    /// advertised it would not accept
    Rejected {
        operation: Operation,
        reason: ReasonCode,
    },
    /// Broker closed the connection, with the DISCONNECT reason if any
    Closed(Option<ReasonCode>),
    /// Malformed or unexpected packet from the broker
    Protocol(String),
}

impl ClientError {
    /// True for outcomes that carry the broker's verdict, as opposed to
    /// transport trouble that says nothing about what the broker accepts.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            ClientError::Refused(_) | ClientError::Rejected { .. } | ClientError::Closed(_)
        )
    }

    /// Reason code sent by the broker, if the error carries one
    pub fn reason_code(&self) -> Option<ReasonCode> {
        match self {
            ClientError::Refused(reason) | ClientError::Rejected { reason, .. } => Some(*reason),
            ClientError::Closed(reason) => *reason,
            _ => None,
        }
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Io(e) => write!(f, "I/O error: {}", e),
            ClientError::Tls(e) => write!(f, "TLS error: {}", e),
            ClientError::Timeout(op) => write!(f, "{} timed out", op),
            ClientError::Refused(reason) => write!(f, "connection refused: {}", reason),
            ClientError::Rejected { operation, reason } => {
                write!(f, "{} rejected: {}", operation, reason)
            }
            ClientError::Closed(Some(reason)) => {
                write!(f, "connection closed by broker: {}", reason)
            }
            ClientError::Closed(None) => write!(f, "connection closed by broker"),
            ClientError::Protocol(e) => write!(f, "protocol error: {}", e),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<std::io::Error> for ClientError {
    fn from(e: std::io::Error) -> Self {
        ClientError::Io(e.to_string())
    }
}

impl From<DecodeError> for ClientError {
    fn from(e: DecodeError) -> Self {
        ClientError::Protocol(e.to_string())
    }
}

impl From<EncodeError> for ClientError {
    fn from(e: EncodeError) -> Self {
        ClientError::Protocol(e.to_string())
    }
}

/// An established probe connection
pub struct Connected {
    pub connack: ConnAck,
    pub client: Box<dyn ProbeClient>,
}

impl fmt::Debug for Connected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connected")
            .field("connack", &self.connack)
            .field("client_id", &self.client.client_id())
            .finish()
    }
}

/// Opens connections to the broker under test
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open one connection and wait for a successful CONNACK
    async fn connect(&self, request: &ConnectRequest) -> Result<Connected, ClientError>;
}

/// One open connection owned by a probe.
///
/// Dropping the client releases the connection.
#[async_trait]
pub trait ProbeClient: Send {
    fn client_id(&self) -> &str;

    /// Subscribe to one filter, returning the granted QoS
    async fn subscribe(&mut self, filter: &str, qos: QoS) -> Result<QoS, ClientError>;

    /// Publish and wait for the flow to complete: the write for QoS 0, PUBACK
    /// for QoS 1, PUBCOMP for QoS 2
    async fn publish(
        &mut self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), ClientError>;

    /// Next delivered message, or `None` once `wait` elapses
    async fn recv(&mut self, wait: Duration) -> Result<Option<Message>, ClientError>;

    /// Send DISCONNECT and close
    async fn disconnect(&mut self);
}
