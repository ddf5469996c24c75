//! Frames over every transport protocol, end to end on loopback


use bytes::Bytes;
use chorus_transport::{Protocol, TransportError};
use integration_harness::{PROTOCOLS, Pki, connected_pair};
use std::time::Duration;
use tokio::time::timeout;

const STEP: Duration = Duration::from_secs(10);

#[tokio::test]
async fn test_frames_flow_both_ways() {
    let pki = Pki::new();

    for protocol in PROTOCOLS {
        let (client, server) = connected_pair(&pki, protocol).await;
        assert_eq!(client.protocol(), protocol);
        assert_eq!(server.protocol(), protocol);

        for i in 0..5u8 {
            let frame = Bytes::from(vec![i; 100 + i as usize * 300]);
            client.send(frame.clone()).await.unwrap();
            let received = timeout(STEP, server.receive()).await.unwrap().unwrap();
            assert_eq!(received, frame, "{:?} client -> server frame {}", protocol, i);
        }

        server.send(Bytes::from_static(b"pong")).await.unwrap();
        let reply = timeout(STEP, client.receive()).await.unwrap().unwrap();
        assert_eq!(&reply[..], b"pong", "{:?} server -> client", protocol);

        // A frame spanning many datagrams or data frames arrives whole
        let large = Bytes::from((0..200_000u32).map(|i| (i % 251) as u8).collect::<Vec<_>>());
        client.send(large.clone()).await.unwrap();
        let received = timeout(STEP, server.receive()).await.unwrap().unwrap();
        assert_eq!(received, large, "{:?} large frame", protocol);
    }
}

#[tokio::test]
async fn test_operations_fail_after_close() {
    let pki = Pki::new();

    for protocol in PROTOCOLS {
        let (client, _server) = connected_pair(&pki, protocol).await;
        client.close().await;

        assert!(client.is_closed(), "{:?}", protocol);
        let receive = timeout(STEP, client.receive()).await.unwrap();
        assert!(
            matches!(receive, Err(TransportError::StreamClosed)),
            "{:?} receive after close: {:?}",
            protocol,
            receive
        );
        let send = client.send(Bytes::from_static(b"late")).await;
        assert!(
            matches!(send, Err(TransportError::StreamClosed)),
            "{:?} send after close: {:?}",
            protocol,
            send
        );
    }
}

#[tokio::test]
async fn test_client_certificate_required() {
    let pki = Pki::new();

    for protocol in PROTOCOLS {
        let mut server_config = pki.server_config(protocol);
        server_config.tls.require_client_cert = true;
        let mut listener = chorus_transport::listen(&server_config).await.unwrap();
        let client_config = pki.client_config(protocol, listener.local_addr());

        let anonymous = chorus_transport::open(&client_config).await;
        assert!(
            matches!(anonymous, Err(TransportError::TlsHandshake(_)) | Err(TransportError::Connect(_))),
            "{:?} accepted a client without a certificate: {:?}",
            protocol,
            anonymous.map(|c| c.peer_addr())
        );
        let refused = timeout(STEP, listener.accept()).await.unwrap();
        assert!(refused.is_err(), "{:?}", protocol);

        let identified = pki.with_client_identity(client_config);
        let (client, server) = tokio::join!(chorus_transport::open(&identified), listener.accept());
        let client = client.unwrap();
        let server = server.unwrap();

        assert_eq!(
            server.peer_fingerprint(),
            Some(pki.client.info.fingerprint.as_str()),
            "{:?}",
            protocol
        );
        assert_eq!(
            client.peer_fingerprint(),
            Some(pki.server.info.fingerprint.as_str()),
            "{:?}",
            protocol
        );
    }
}

#[tokio::test]
async fn test_refused_reliable_udp_client_is_reported_once() {
    let pki = Pki::new();
    let mut server_config = pki.server_config(Protocol::ReliableUdp);
    server_config.tls.require_client_cert = true;
    let mut listener = chorus_transport::listen(&server_config).await.unwrap();
    let client_config = pki.client_config(Protocol::ReliableUdp, listener.local_addr());

    assert!(chorus_transport::open(&client_config).await.is_err());
    let refused = timeout(STEP, listener.accept()).await.unwrap();
    assert!(matches!(refused, Err(TransportError::TlsHandshake(_))), "{:?}", refused.map(|c| c.peer_addr()));

    // late datagrams of the refused conversation must not look like a new client
    let next = timeout(Duration::from_secs(3), listener.accept()).await;
    assert!(next.is_err(), "unexpected outcome: {:?}", next.map(|r| r.map(|c| c.peer_addr())));
}

#[tokio::test]
async fn test_oversized_frames_are_rejected() {
    let pki = Pki::new();

    // Caught locally before anything is sent
    for protocol in [Protocol::Multiplex, Protocol::ReliableUdp] {
        let mut listener = chorus_transport::listen(&pki.server_config(protocol)).await.unwrap();
        let mut client_config = pki.client_config(protocol, listener.local_addr());
        client_config.max_frame_size = 1024;

        let (client, server) = tokio::join!(chorus_transport::open(&client_config), listener.accept());
        let client = client.unwrap();
        let _server = server.unwrap();

        let result = client.send(Bytes::from(vec![0u8; 2048])).await;
        assert!(
            matches!(result, Err(TransportError::MessageTooLarge { size: 2048, max: 1024 })),
            "{:?}: {:?}",
            protocol,
            result
        );
    }

    // RPC enforces the receiver's limit too, reported back by the listener
    let mut server_config = pki.server_config(Protocol::Rpc);
    server_config.rpc.max_recv_message_size = 1024;
    let mut listener = chorus_transport::listen(&server_config).await.unwrap();
    let client_config = pki.client_config(Protocol::Rpc, listener.local_addr());

    let (client, server) = tokio::join!(chorus_transport::open(&client_config), listener.accept());
    let client = client.unwrap();
    let server = server.unwrap();

    let result = client.send(Bytes::from(vec![0u8; 4096])).await;
    assert!(
        matches!(result, Err(TransportError::MessageTooLarge { size: 4096, .. })),
        "{:?}",
        result
    );

    // The link survives the rejected call
    client.send(Bytes::from_static(b"small")).await.unwrap();
    let received = timeout(STEP, server.receive()).await.unwrap().unwrap();
    assert_eq!(&received[..], b"small");
}
