//! Integration-level exercise of [`bridge::splice`] against real loopback
//! TCP sockets on both ends, pushing enough bytes through each direction to
//! cross [`bridge::HIGH_WATERMARK`]/[`bridge::LOW_WATERMARK`] rather than the
//! single small write `bridge`'s own unit test uses. Grounded the same way
//! as that test (`utp_bufferevent.h`'s `tcp_connect_utp`/`utp_connect_tcp`),
//! just scaled up to the sizes §4.3's back-pressure rule is actually for.

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use dcdn_core::bridge::{self, HIGH_WATERMARK};
use dcdn_core::transport::{fake_stream_pair, UtpStream};

async fn loopback_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connect = TcpStream::connect(addr);
    let (accept, connect) = tokio::join!(listener.accept(), connect);
    (accept.unwrap().0, connect.unwrap())
}

fn addr(n: u8) -> std::net::SocketAddrV4 {
    std::net::SocketAddrV4::new(std::net::Ipv4Addr::new(10, 0, 0, n), 7500)
}

#[tokio::test]
async fn large_transfer_past_the_high_watermark_arrives_intact_both_ways() {
    let (server_tcp, mut client_tcp) = loopback_pair().await;
    let (bridge_side, mut test_side) = fake_stream_pair(addr(1), addr(2));

    let bridge = tokio::spawn(async move { bridge::splice(server_tcp, bridge_side).await });

    // TCP client -> uTP side: a few multiples of HIGH_WATERMARK so the
    // pending-byte counter would have tripped the gate at least once if the
    // read-gating condition were wrong.
    let payload_len = HIGH_WATERMARK * 3 + 777;
    let client_to_injector: Vec<u8> = (0..payload_len).map(|i| (i % 251) as u8).collect();
    let writer = {
        let payload = client_to_injector.clone();
        tokio::spawn(async move {
            client_tcp.write_all(&payload).await.unwrap();
            client_tcp.shutdown().await.unwrap();
            client_tcp
        })
    };

    let mut received = Vec::with_capacity(payload_len);
    while received.len() < payload_len {
        let chunk = test_side.read().await.unwrap().expect("stream closed before full payload arrived");
        received.extend_from_slice(&chunk);
    }
    assert_eq!(received, client_to_injector);
    assert_eq!(test_side.read().await.unwrap(), None, "half-close should propagate once drained");

    let mut client_tcp = writer.await.unwrap();

    // uTP side -> TCP client, same scale in the other direction.
    let injector_to_client: Vec<u8> = (0..payload_len).map(|i| ((i * 7) % 251) as u8).collect();
    for chunk in injector_to_client.chunks(32 * 1024) {
        test_side.write(Bytes::copy_from_slice(chunk)).await.unwrap();
    }
    test_side.shutdown_write().await.unwrap();

    let mut got = vec![0u8; payload_len];
    client_tcp.read_exact(&mut got).await.unwrap();
    assert_eq!(got, injector_to_client);

    bridge.await.unwrap().unwrap();
}
