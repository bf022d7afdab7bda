//! MqttConnector against scripted TCP peers
//!
//! Each test binds a local listener that plays a broker byte by byte, so the
//! client's handshake, acknowledgement and error mapping can be checked
//! without a real broker.

use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use mqttprobe::client::{
    ClientError, ConnectRequest, Connector, MqttConnector, Operation, ProbeClient,
};
use mqttprobe::protocol::{ProtocolVersion, QoS, ReasonCode};

const CONNACK_ACCEPTED: [u8; 4] = [0x20, 0x02, 0x00, 0x00];

/// Read one packet, returning its first byte and body
async fn read_packet(stream: &mut TcpStream) -> std::io::Result<(u8, Vec<u8>)> {
    let first = stream.read_u8().await?;
    let mut remaining = 0usize;
    let mut shift = 0;
    loop {
        let byte = stream.read_u8().await?;
        remaining |= ((byte & 0x7F) as usize) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    let mut body = vec![0u8; remaining];
    stream.read_exact(&mut body).await?;
    Ok((first, body))
}

async fn listen() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

fn request(version: ProtocolVersion, port: u16) -> ConnectRequest {
    let mut request = ConnectRequest::new(version, "127.0.0.1", port).with_client_id("probe-test");
    request.timeout = Duration::from_secs(2);
    request
}

/// Accept one connection, check the CONNECT and answer with `connack`
fn serve_connack(listener: TcpListener, connack: Vec<u8>) -> JoinHandle<TcpStream> {
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let (first, body) = read_packet(&mut stream).await.unwrap();
        assert_eq!(first, 0x10, "expected CONNECT");
        assert_eq!(&body[0..6], b"\x00\x04MQTT");
        stream.write_all(&connack).await.unwrap();
        stream
    })
}

#[tokio::test]
async fn test_refused_connack_maps_to_refused() {
    let (listener, port) = listen().await;
    let peer = serve_connack(listener, vec![0x20, 0x02, 0x00, 0x05]);

    let result = MqttConnector::new()
        .connect(&request(ProtocolVersion::V311, port))
        .await;
    assert!(matches!(
        result,
        Err(ClientError::Refused(ReasonCode::NotAuthorized))
    ));
    peer.await.unwrap();
}

#[tokio::test]
async fn test_closed_port_maps_to_io() {
    let (listener, port) = listen().await;
    drop(listener);

    let result = MqttConnector::new()
        .connect(&request(ProtocolVersion::V311, port))
        .await;
    assert!(matches!(result, Err(ClientError::Io(_))), "{:?}", result.err());
}

#[tokio::test]
async fn test_silent_peer_times_out() {
    let (listener, port) = listen().await;
    let peer = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let _ = read_packet(&mut stream).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
    });

    let mut request = request(ProtocolVersion::V311, port);
    request.timeout = Duration::from_millis(200);
    let result = MqttConnector::new().connect(&request).await;
    assert!(matches!(
        result,
        Err(ClientError::Timeout(Operation::Connect))
    ));
    peer.abort();
}

#[tokio::test]
async fn test_v5_connack_properties() {
    let (listener, port) = listen().await;
    // Maximum QoS 1, Retain Available 0
    let connack = vec![0x20, 0x07, 0x00, 0x00, 0x04, 0x24, 0x01, 0x25, 0x00];
    let peer = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let (first, body) = read_packet(&mut stream).await.unwrap();
        assert_eq!(first, 0x10);
        // Protocol level follows the protocol name
        assert_eq!(body[6], 5);
        stream.write_all(&connack).await.unwrap();
        let (first, _) = read_packet(&mut stream).await.unwrap();
        assert_eq!(first, 0xE0, "expected DISCONNECT");
    });

    let mut connected = MqttConnector::new()
        .connect(&request(ProtocolVersion::V5, port))
        .await
        .unwrap();
    assert_eq!(connected.connack.reason_code, ReasonCode::Success);
    assert_eq!(connected.connack.properties.maximum_qos, Some(1));
    assert_eq!(connected.connack.properties.retain_available, Some(0));

    connected.client.disconnect().await;
    peer.await.unwrap();
}

#[tokio::test]
async fn test_subscribe_publish_and_inbound_qos1() {
    let (listener, port) = listen().await;
    let peer = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        read_packet(&mut stream).await.unwrap();
        stream.write_all(&CONNACK_ACCEPTED).await.unwrap();

        // SUBSCRIBE: packet id, filter, requested QoS
        let (first, body) = read_packet(&mut stream).await.unwrap();
        assert_eq!(first, 0x82);
        let (id_hi, id_lo) = (body[0], body[1]);
        let filter_len = u16::from_be_bytes([body[2], body[3]]) as usize;
        assert_eq!(&body[4..4 + filter_len], b"probe/+");
        assert_eq!(body[4 + filter_len], 1);
        stream
            .write_all(&[0x90, 0x03, id_hi, id_lo, 0x01])
            .await
            .unwrap();

        // QoS 1 PUBLISH from the client, acknowledged
        let (first, body) = read_packet(&mut stream).await.unwrap();
        assert_eq!(first & 0xF0, 0x30);
        assert_eq!((first >> 1) & 0x03, 1);
        let topic_len = u16::from_be_bytes([body[0], body[1]]) as usize;
        assert_eq!(&body[2..2 + topic_len], b"probe/out");
        let (id_hi, id_lo) = (body[2 + topic_len], body[3 + topic_len]);
        assert_eq!(&body[4 + topic_len..], b"hello");
        stream
            .write_all(&[0x40, 0x02, id_hi, id_lo])
            .await
            .unwrap();

        // QoS 1 PUBLISH to the client with packet id 7
        let mut publish = vec![0x32, 0x00, 0x00, 0x08];
        publish.extend_from_slice(b"probe/in");
        publish.extend_from_slice(&[0x00, 0x07]);
        publish.extend_from_slice(b"world");
        publish[1] = (publish.len() - 2) as u8;
        stream.write_all(&publish).await.unwrap();

        let (first, body) = read_packet(&mut stream).await.unwrap();
        assert_eq!(first, 0x40, "expected PUBACK");
        assert_eq!(body, vec![0x00, 0x07]);
    });

    let mut connected = MqttConnector::new()
        .connect(&request(ProtocolVersion::V311, port))
        .await
        .unwrap();
    let client = connected.client.as_mut();

    let granted = client.subscribe("probe/+", QoS::AtLeastOnce).await.unwrap();
    assert_eq!(granted, QoS::AtLeastOnce);

    client
        .publish("probe/out", Bytes::from_static(b"hello"), QoS::AtLeastOnce, false)
        .await
        .unwrap();

    let message = client
        .recv(Duration::from_secs(2))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.topic, "probe/in");
    assert_eq!(message.payload, Bytes::from_static(b"world"));
    assert_eq!(message.qos, QoS::AtLeastOnce);
    assert!(!message.retain);

    peer.await.unwrap();
}

#[tokio::test]
async fn test_qos2_flows() {
    let (listener, port) = listen().await;
    let peer = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        read_packet(&mut stream).await.unwrap();
        stream.write_all(&CONNACK_ACCEPTED).await.unwrap();

        // Outbound: PUBLISH, PUBREC, PUBREL, PUBCOMP
        let (first, body) = read_packet(&mut stream).await.unwrap();
        assert_eq!(first, 0x34, "expected QoS 2 PUBLISH");
        let topic_len = u16::from_be_bytes([body[0], body[1]]) as usize;
        let (id_hi, id_lo) = (body[2 + topic_len], body[3 + topic_len]);
        stream
            .write_all(&[0x50, 0x02, id_hi, id_lo])
            .await
            .unwrap();
        let (first, body) = read_packet(&mut stream).await.unwrap();
        assert_eq!(first, 0x62, "expected PUBREL");
        assert_eq!(body, vec![id_hi, id_lo]);
        stream
            .write_all(&[0x70, 0x02, id_hi, id_lo])
            .await
            .unwrap();

        // Inbound: PUBLISH id 9, redelivered with DUP before PUBREL
        let mut publish = vec![0x34, 0x00, 0x00, 0x08];
        publish.extend_from_slice(b"probe/in");
        publish.extend_from_slice(&[0x00, 0x09]);
        publish.extend_from_slice(b"once");
        publish[1] = (publish.len() - 2) as u8;
        stream.write_all(&publish).await.unwrap();
        assert_eq!(
            read_packet(&mut stream).await.unwrap(),
            (0x50, vec![0x00, 0x09])
        );

        publish[0] |= 0x08;
        stream.write_all(&publish).await.unwrap();
        assert_eq!(
            read_packet(&mut stream).await.unwrap(),
            (0x50, vec![0x00, 0x09])
        );

        stream.write_all(&[0x62, 0x02, 0x00, 0x09]).await.unwrap();
        assert_eq!(
            read_packet(&mut stream).await.unwrap(),
            (0x70, vec![0x00, 0x09])
        );

        // QoS 0 marker after the exchange
        let mut marker = vec![0x30, 0x00, 0x00, 0x09];
        marker.extend_from_slice(b"probe/end");
        marker[1] = (marker.len() - 2) as u8;
        stream.write_all(&marker).await.unwrap();

        let _ = read_packet(&mut stream).await;
    });

    let mut connected = MqttConnector::new()
        .connect(&request(ProtocolVersion::V311, port))
        .await
        .unwrap();
    let client = connected.client.as_mut();

    client
        .publish("probe/out", Bytes::from_static(b"twice"), QoS::ExactlyOnce, false)
        .await
        .unwrap();

    let first = client.recv(Duration::from_secs(2)).await.unwrap().unwrap();
    assert_eq!(first.topic, "probe/in");
    assert_eq!(first.payload, Bytes::from_static(b"once"));
    assert_eq!(first.qos, QoS::ExactlyOnce);

    // The redelivery was acknowledged but not queued
    let next = client.recv(Duration::from_secs(2)).await.unwrap().unwrap();
    assert_eq!(next.topic, "probe/end");

    client.disconnect().await;
    peer.await.unwrap();
}

#[tokio::test]
async fn test_subscribe_failure_maps_to_rejected() {
    let (listener, port) = listen().await;
    let peer = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        read_packet(&mut stream).await.unwrap();
        stream.write_all(&CONNACK_ACCEPTED).await.unwrap();

        let (_, body) = read_packet(&mut stream).await.unwrap();
        stream
            .write_all(&[0x90, 0x03, body[0], body[1], 0x80])
            .await
            .unwrap();
        // Hold the connection until the client is done
        let _ = read_packet(&mut stream).await;
    });

    let mut connected = MqttConnector::new()
        .connect(&request(ProtocolVersion::V311, port))
        .await
        .unwrap();
    let result = connected.client.subscribe("a/#", QoS::AtMostOnce).await;
    assert!(matches!(
        result,
        Err(ClientError::Rejected {
            operation: Operation::Subscribe,
            ..
        })
    ));
    assert!(result.unwrap_err().is_rejection());

    connected.client.disconnect().await;
    peer.await.unwrap();
}

#[tokio::test]
async fn test_peer_close_surfaces_as_closed() {
    let (listener, port) = listen().await;
    let peer = serve_connack(listener, CONNACK_ACCEPTED.to_vec());

    let mut connected = MqttConnector::new()
        .connect(&request(ProtocolVersion::V311, port))
        .await
        .unwrap();
    drop(peer.await.unwrap());

    let result = connected.client.recv(Duration::from_secs(2)).await;
    assert_eq!(result, Err(ClientError::Closed(None)));
}
