//! MQTT client over TCP or TLS
//!
//! The CONNECT/CONNACK handshake runs inline in [`MqttClient::connect`].
//! After that a session task owns the socket: it multiplexes commands from
//! the [`MqttClient`] handle, inbound packets and keep-alive pings, completes
//! QoS 1 and QoS 2 flows in both directions, and queues deliveries for
//! [`ProbeClient::recv`]. Dropping the handle closes the command channel and
//! the task disconnects.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use super::{
    ClientError, ConnectRequest, Connected, Connector, Message, Operation, ProbeClient,
};
use crate::codec::{Decoder, Encoder};
use crate::protocol::{
    Ack, ConnAck, Connect, Disconnect, Packet, Properties, Publish, QoS, ReasonCode, Subscribe,
    Subscription,
};

trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

type BoxedStream = Box<dyn AsyncStream>;

/// [`Connector`] that opens real network connections
#[derive(Debug, Clone, Copy, Default)]
pub struct MqttConnector;

impl MqttConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for MqttConnector {
    async fn connect(&self, request: &ConnectRequest) -> Result<Connected, ClientError> {
        let (client, connack) = MqttClient::connect(request).await?;
        Ok(Connected {
            connack,
            client: Box::new(client),
        })
    }
}

/// Request sent from the handle to the session task
enum Command {
    Publish {
        publish: Publish,
        done: oneshot::Sender<Result<(), ClientError>>,
    },
    Subscribe {
        filter: String,
        qos: QoS,
        done: oneshot::Sender<Result<ReasonCode, ClientError>>,
    },
    Disconnect {
        done: oneshot::Sender<()>,
    },
}

/// Operation waiting for the broker, keyed by packet identifier
enum Pending {
    /// QoS 1 waits for PUBACK, QoS 2 for PUBREC then PUBCOMP
    Publish(oneshot::Sender<Result<(), ClientError>>),
    Subscribe(oneshot::Sender<Result<ReasonCode, ClientError>>),
}

/// Handle to one connected client
pub struct MqttClient {
    client_id: String,
    commands: mpsc::Sender<Command>,
    inbox: mpsc::UnboundedReceiver<Message>,
    ack_timeout: Duration,
    close_reason: Arc<Mutex<Option<ClientError>>>,
}

impl MqttClient {
    /// Open the transport, perform the CONNECT handshake and start the
    /// session task.
    pub async fn connect(request: &ConnectRequest) -> Result<(Self, ConnAck), ClientError> {
        let stream = open_stream(request).await?;
        let (mut reader, mut writer) = tokio::io::split(stream);

        let encoder = Encoder::new(request.version);
        let decoder = Decoder::new(request.version);

        let connect = Packet::Connect(Box::new(Connect {
            protocol_version: request.version,
            client_id: request.client_id.clone(),
            clean_start: true,
            keep_alive: request.keep_alive,
            username: request.username.clone(),
            password: request.password.clone(),
            properties: Properties::default(),
        }));
        let mut buf = BytesMut::new();
        encoder.encode(&connect, &mut buf)?;

        timeout(request.timeout, writer.write_all(&buf))
            .await
            .map_err(|_| ClientError::Timeout(Operation::Connect))??;
        trace!(client_id = %request.client_id, "CONNECT sent");

        let mut read_buf = BytesMut::with_capacity(4096);
        let connack = timeout(
            request.timeout,
            read_connack(&mut reader, &decoder, &mut read_buf),
        )
        .await
        .map_err(|_| ClientError::Timeout(Operation::Connect))??;

        if connack.reason_code != ReasonCode::Success {
            debug!(
                client_id = %request.client_id,
                reason = %connack.reason_code,
                "connection refused"
            );
            return Err(ClientError::Refused(connack.reason_code));
        }

        debug!(
            client_id = %request.client_id,
            session_present = connack.session_present,
            "connected to {}:{}",
            request.host,
            request.port
        );

        let keep_alive = connack
            .properties
            .server_keep_alive
            .unwrap_or(request.keep_alive);
        let close_reason = Arc::new(Mutex::new(None));
        let (command_tx, command_rx) = mpsc::channel(64);
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();

        let session = Session {
            client_id: request.client_id.clone(),
            writer,
            encoder,
            decoder,
            pending: HashMap::new(),
            incoming_qos2: HashSet::new(),
            inbox: inbox_tx,
            next_packet_id: 1,
            max_packet_size: connack.properties.maximum_packet_size,
            write_timeout: request.timeout,
            close_reason: close_reason.clone(),
        };
        tokio::spawn(session.run(reader, read_buf, command_rx, keep_alive));

        Ok((
            Self {
                client_id: request.client_id.clone(),
                commands: command_tx,
                inbox: inbox_rx,
                ack_timeout: request.timeout,
                close_reason,
            },
            connack,
        ))
    }

    fn closed_error(&self) -> ClientError {
        self.close_reason
            .lock()
            .clone()
            .unwrap_or(ClientError::Closed(None))
    }

    /// Hand a command to the session task and wait for its outcome
    async fn request<T>(
        &mut self,
        operation: Operation,
        command: Command,
        done: oneshot::Receiver<Result<T, ClientError>>,
    ) -> Result<T, ClientError> {
        if self.commands.send(command).await.is_err() {
            return Err(self.closed_error());
        }
        match timeout(self.ack_timeout, done).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(self.closed_error()),
            Err(_) => Err(ClientError::Timeout(operation)),
        }
    }
}

#[async_trait]
impl ProbeClient for MqttClient {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    async fn subscribe(&mut self, filter: &str, qos: QoS) -> Result<QoS, ClientError> {
        let (tx, rx) = oneshot::channel();
        let command = Command::Subscribe {
            filter: filter.to_string(),
            qos,
            done: tx,
        };
        let reason = self.request(Operation::Subscribe, command, rx).await?;
        if reason.is_error() {
            return Err(ClientError::Rejected {
                operation: Operation::Subscribe,
                reason,
            });
        }
        reason
            .granted_qos()
            .ok_or_else(|| ClientError::Protocol(format!("unexpected SUBACK code {}", reason)))
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), ClientError> {
        let (tx, rx) = oneshot::channel();
        let publish = Publish {
            qos,
            retain,
            topic: topic.to_string(),
            payload,
            ..Default::default()
        };
        let command = Command::Publish { publish, done: tx };
        self.request(Operation::Publish, command, rx).await
    }

    async fn recv(&mut self, wait: Duration) -> Result<Option<Message>, ClientError> {
        match timeout(wait, self.inbox.recv()).await {
            Ok(Some(message)) => Ok(Some(message)),
            Ok(None) => Err(self.closed_error()),
            Err(_) => Ok(None),
        }
    }

    async fn disconnect(&mut self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Disconnect { done: tx }).await.is_ok() {
            let _ = timeout(self.ack_timeout, rx).await;
        }
    }
}

async fn open_stream(request: &ConnectRequest) -> Result<BoxedStream, ClientError> {
    let tcp = timeout(
        request.timeout,
        TcpStream::connect((request.host.as_str(), request.port)),
    )
    .await
    .map_err(|_| ClientError::Timeout(Operation::Connect))??;
    if let Err(e) = tcp.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY: {}", e);
    }

    match &request.tls {
        None => Ok(Box::new(tcp)),
        Some(tls) => {
            let stream = timeout(
                request.timeout,
                tls.connector().connect(tls.server_name(), tcp),
            )
            .await
            .map_err(|_| ClientError::Timeout(Operation::Connect))?
            .map_err(|e| ClientError::Tls(e.to_string()))?;
            Ok(Box::new(stream))
        }
    }
}

async fn read_connack(
    reader: &mut ReadHalf<BoxedStream>,
    decoder: &Decoder,
    buf: &mut BytesMut,
) -> Result<ConnAck, ClientError> {
    loop {
        if let Some((packet, used)) = decoder.decode(buf)? {
            buf.advance(used);
            return match packet {
                Packet::ConnAck(connack) => Ok(connack),
                Packet::Disconnect(disconnect) => {
                    Err(ClientError::Closed(Some(disconnect.reason_code)))
                }
                other => Err(ClientError::Protocol(format!(
                    "expected CONNACK, got {}",
                    other.name()
                ))),
            };
        }
        if reader.read_buf(buf).await? == 0 {
            return Err(ClientError::Closed(None));
        }
    }
}

/// State owned by the session task
struct Session {
    client_id: String,
    writer: WriteHalf<BoxedStream>,
    encoder: Encoder,
    decoder: Decoder,
    pending: HashMap<u16, Pending>,
    /// Inbound QoS 2 packet ids between PUBREC and PUBREL
    incoming_qos2: HashSet<u16>,
    inbox: mpsc::UnboundedSender<Message>,
    next_packet_id: u16,
    /// Broker's advertised limit (v5)
    max_packet_size: Option<u32>,
    write_timeout: Duration,
    close_reason: Arc<Mutex<Option<ClientError>>>,
}

impl Session {
    async fn run(
        mut self,
        mut reader: ReadHalf<BoxedStream>,
        mut read_buf: BytesMut,
        mut commands: mpsc::Receiver<Command>,
        keep_alive: u16,
    ) {
        let mut ping = tokio::time::interval(Duration::from_secs(keep_alive.max(1) as u64));
        ping.reset();

        // Bytes that arrived together with the CONNACK
        let mut outcome = self.drain(&mut read_buf).await;

        while outcome.is_ok() {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => outcome = self.handle_command(command).await,
                    None => {
                        self.send_disconnect().await;
                        break;
                    }
                },
                read = reader.read_buf(&mut read_buf) => outcome = match read {
                    Ok(0) => Err(ClientError::Closed(None)),
                    Ok(_) => self.drain(&mut read_buf).await,
                    Err(e) => Err(e.into()),
                },
                _ = ping.tick(), if keep_alive > 0 => {
                    outcome = self.send(&Packet::PingReq).await;
                }
            }
        }

        let reason = match outcome {
            Ok(()) | Err(ClientError::Closed(None)) => {
                debug!(client_id = %self.client_id, "session closed");
                ClientError::Closed(None)
            }
            Err(e) => {
                debug!(client_id = %self.client_id, "session ended: {}", e);
                e
            }
        };
        for (_, pending) in self.pending.drain() {
            match pending {
                Pending::Publish(done) => {
                    let _ = done.send(Err(reason.clone()));
                }
                Pending::Subscribe(done) => {
                    let _ = done.send(Err(reason.clone()));
                }
            }
        }
        *self.close_reason.lock() = Some(reason);
    }

    fn next_packet_id(&mut self) -> u16 {
        loop {
            let id = self.next_packet_id;
            self.next_packet_id = self.next_packet_id.checked_add(1).unwrap_or(1);
            if !self.pending.contains_key(&id) {
                return id;
            }
        }
    }

    async fn write_buf(&mut self, buf: &[u8]) -> Result<(), ClientError> {
        match timeout(self.write_timeout, self.writer.write_all(buf)).await {
            Ok(result) => result.map_err(ClientError::from),
            Err(_) => Err(ClientError::Io("write timed out".to_string())),
        }
    }

    async fn send(&mut self, packet: &Packet) -> Result<(), ClientError> {
        let mut buf = BytesMut::new();
        self.encoder.encode(packet, &mut buf)?;
        trace!(client_id = %self.client_id, packet = packet.name(), "send");
        self.write_buf(&buf).await
    }

    async fn send_disconnect(&mut self) {
        let _ = self.send(&Packet::Disconnect(Disconnect::default())).await;
        let _ = self.writer.shutdown().await;
    }

    async fn handle_command(&mut self, command: Command) -> Result<(), ClientError> {
        match command {
            Command::Publish { mut publish, done } => {
                if publish.qos != QoS::AtMostOnce {
                    publish.packet_id = Some(self.next_packet_id());
                }
                let packet_id = publish.packet_id;
                let packet = Packet::Publish(publish);

                let mut buf = BytesMut::new();
                if let Err(e) = self.encoder.encode(&packet, &mut buf) {
                    let _ = done.send(Err(e.into()));
                    return Ok(());
                }
                if let Some(max) = self.max_packet_size {
                    if buf.len() > max as usize {
                        let _ = done.send(Err(ClientError::Rejected {
                            operation: Operation::Publish,
                            reason: ReasonCode::PacketTooLarge,
                        }));
                        return Ok(());
                    }
                }

                let immediate = match packet_id {
                    Some(id) => {
                        self.pending.insert(id, Pending::Publish(done));
                        None
                    }
                    None => Some(done),
                };
                trace!(client_id = %self.client_id, ?packet_id, "send PUBLISH");
                let written = self.write_buf(&buf).await;
                if let Some(done) = immediate {
                    let _ = done.send(written.clone());
                }
                written
            }
            Command::Subscribe { filter, qos, done } => {
                let packet_id = self.next_packet_id();
                self.pending.insert(packet_id, Pending::Subscribe(done));
                self.send(&Packet::Subscribe(Subscribe {
                    packet_id,
                    subscriptions: vec![Subscription { filter, qos }],
                    properties: Properties::default(),
                }))
                .await
            }
            Command::Disconnect { done } => {
                self.send_disconnect().await;
                let _ = done.send(());
                Err(ClientError::Closed(None))
            }
        }
    }

    async fn drain(&mut self, read_buf: &mut BytesMut) -> Result<(), ClientError> {
        while let Some((packet, used)) = self.decoder.decode(read_buf)? {
            read_buf.advance(used);
            trace!(client_id = %self.client_id, packet = packet.name(), "recv");
            self.handle_packet(packet).await?;
        }
        Ok(())
    }

    async fn handle_packet(&mut self, packet: Packet) -> Result<(), ClientError> {
        match packet {
            Packet::Publish(publish) => self.handle_publish(publish).await,
            Packet::PubAck(ack) | Packet::PubComp(ack) => {
                self.complete_publish(ack.packet_id, ack.reason_code);
                Ok(())
            }
            Packet::PubRec(ack) => {
                if ack.reason_code.is_error() {
                    self.complete_publish(ack.packet_id, ack.reason_code);
                    return Ok(());
                }
                if !matches!(self.pending.get(&ack.packet_id), Some(Pending::Publish(_))) {
                    warn!(
                        client_id = %self.client_id,
                        packet_id = ack.packet_id,
                        "PUBREC for unknown packet id"
                    );
                }
                self.send(&Packet::PubRel(Ack::new(ack.packet_id))).await
            }
            Packet::PubRel(ack) => {
                self.incoming_qos2.remove(&ack.packet_id);
                self.send(&Packet::PubComp(Ack::new(ack.packet_id))).await
            }
            Packet::SubAck(suback) => {
                match self.pending.remove(&suback.packet_id) {
                    Some(Pending::Subscribe(done)) => {
                        let reason = suback
                            .reason_codes
                            .first()
                            .copied()
                            .unwrap_or(ReasonCode::UnspecifiedError);
                        let _ = done.send(Ok(reason));
                    }
                    Some(other) => {
                        self.pending.insert(suback.packet_id, other);
                        warn!(client_id = %self.client_id, "SUBACK for a publish packet id");
                    }
                    None => warn!(client_id = %self.client_id, "unexpected SUBACK"),
                }
                Ok(())
            }
            Packet::PingResp => Ok(()),
            Packet::Disconnect(disconnect) => Err(ClientError::Closed(Some(disconnect.reason_code))),
            other => Err(ClientError::Protocol(format!(
                "unexpected {} from broker",
                other.name()
            ))),
        }
    }

    async fn handle_publish(&mut self, publish: Publish) -> Result<(), ClientError> {
        let message = Message {
            topic: publish.topic,
            payload: publish.payload,
            qos: publish.qos,
            retain: publish.retain,
        };

        match (publish.qos, publish.packet_id) {
            (QoS::AtMostOnce, _) => {
                let _ = self.inbox.send(message);
                Ok(())
            }
            (QoS::AtLeastOnce, Some(id)) => {
                let _ = self.inbox.send(message);
                self.send(&Packet::PubAck(Ack::new(id))).await
            }
            (QoS::ExactlyOnce, Some(id)) => {
                // Redeliveries before PUBREL are acknowledged but not queued again
                if self.incoming_qos2.insert(id) {
                    let _ = self.inbox.send(message);
                }
                self.send(&Packet::PubRec(Ack::new(id))).await
            }
            _ => Err(ClientError::Protocol(
                "PUBLISH without packet id".to_string(),
            )),
        }
    }

    fn complete_publish(&mut self, packet_id: u16, reason: ReasonCode) {
        match self.pending.remove(&packet_id) {
            Some(Pending::Publish(done)) => {
                let result = if reason.is_error() {
                    Err(ClientError::Rejected {
                        operation: Operation::Publish,
                        reason,
                    })
                } else {
                    Ok(())
                };
                let _ = done.send(result);
            }
            Some(other) => {
                self.pending.insert(packet_id, other);
                warn!(client_id = %self.client_id, packet_id, "publish ack for a subscribe");
            }
            None => trace!(client_id = %self.client_id, packet_id, "late publish ack"),
        }
    }
}
