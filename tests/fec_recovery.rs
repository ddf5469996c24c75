//! Reed-Solomon recovery, directly and underneath a reliable-UDP link


use bytes::Bytes;
use chorus_transport::{FecCodec, FecError, Protocol};
use integration_harness::Pki;
use std::time::Duration;
use tokio::time::timeout;

fn sample_unit() -> Vec<u8> {
    (0..1200u32).map(|i| (i * 7 % 256) as u8).collect()
}

#[test]
fn test_every_pair_of_lost_shards_is_recoverable() {
    let codec = FecCodec::new(4, 2).unwrap();
    let unit = sample_unit();
    let shards = codec.encode(&unit).unwrap();
    assert_eq!(shards.len(), 6);

    for a in 0..6 {
        for b in (a + 1)..6 {
            let received: Vec<Option<Vec<u8>>> = shards
                .iter()
                .enumerate()
                .map(|(i, shard)| (i != a && i != b).then(|| shard.clone()))
                .collect();
            assert_eq!(codec.decode(received).unwrap(), unit, "lost shards {} and {}", a, b);
        }
    }
}

#[test]
fn test_three_lost_shards_are_reported() {
    let codec = FecCodec::new(4, 2).unwrap();
    let shards = codec.encode(&sample_unit()).unwrap();

    let received: Vec<Option<Vec<u8>>> = shards
        .into_iter()
        .enumerate()
        .map(|(i, shard)| (i >= 3).then_some(shard))
        .collect();
    assert_eq!(
        codec.decode(received),
        Err(FecError::InsufficientShards {
            present: 3,
            required: 4
        })
    );
}

#[tokio::test]
async fn test_links_carry_frames_with_various_shard_layouts() {
    let pki = Pki::new();

    for (data_shards, parity_shards, mtu) in [(4, 2, 1350), (0, 0, 1350), (8, 4, 512)] {
        let mut server_config = pki.server_config(Protocol::ReliableUdp);
        server_config.reliable_udp.data_shards = data_shards;
        server_config.reliable_udp.parity_shards = parity_shards;
        server_config.reliable_udp.mtu = mtu;
        let mut listener = chorus_transport::listen(&server_config).await.unwrap();

        let mut client_config = pki.client_config(Protocol::ReliableUdp, listener.local_addr());
        client_config.reliable_udp = server_config.reliable_udp.clone();

        let (client, server) = tokio::join!(chorus_transport::open(&client_config), listener.accept());
        let client = client.unwrap();
        let server = server.unwrap();

        for i in 0..20usize {
            let frame = Bytes::from(vec![i as u8; 50 + i * 400]);
            client.send(frame.clone()).await.unwrap();
            let received = timeout(Duration::from_secs(10), server.receive())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(received, frame, "{}+{} shards, frame {}", data_shards, parity_shards, i);
        }
    }
}
