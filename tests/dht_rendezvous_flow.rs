//! End-to-end DHT announce/get_peers across two real UDP sockets, feeding the
//! discovered endpoint into a [`RendezvousController`] the way `reactor::
//! Reactor::fire_discovery`'s callback does. Unlike `dht::mod`'s own unit
//! tests (which exercise `DhtClient` against an in-process peer id without a
//! socket in the loop), this drives the whole wire path: `announce` on one
//! node, `get_peers` on the other, a bounded pump of real datagrams between
//! them, and the resulting endpoint rejected or accepted by §4.4's rules.

use std::net::SocketAddrV4;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::time::timeout;

use dcdn_core::dht::DhtClient;
use dcdn_core::rendezvous::RendezvousController;
use dcdn_core::types::{Endpoint, InfoHash};

fn v4(socket: &UdpSocket) -> SocketAddrV4 {
    match socket.local_addr().unwrap() {
        std::net::SocketAddr::V4(v4) => v4,
        _ => unreachable!(),
    }
}

/// Pumps datagrams between two sockets/clients until `done` reports true or
/// the overall deadline elapses, mirroring what `Reactor::run`'s select loop
/// does one packet at a time.
async fn pump_until(
    socket_a: &UdpSocket,
    dht_a: &mut DhtClient,
    socket_b: &UdpSocket,
    dht_b: &mut DhtClient,
    mut done: impl FnMut(&DhtClient) -> bool,
) {
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut buf = [0u8; 2048];
    loop {
        dht_a.tick();
        dht_b.tick();
        for (bytes, to) in dht_a.drain_outgoing() {
            socket_a.send_to(&bytes, to).await.unwrap();
        }
        for (bytes, to) in dht_b.drain_outgoing() {
            socket_b.send_to(&bytes, to).await.unwrap();
        }

        if done(dht_b) || Instant::now() > deadline {
            return;
        }

        tokio::select! {
            result = timeout(Duration::from_millis(50), socket_a.recv_from(&mut buf)) => {
                if let Ok(Ok((len, std::net::SocketAddr::V4(from)))) = result {
                    dht_a.process_udp(&buf[..len], from);
                }
            }
            result = timeout(Duration::from_millis(50), socket_b.recv_from(&mut buf)) => {
                if let Ok(Ok((len, std::net::SocketAddr::V4(from)))) = result {
                    dht_b.process_udp(&buf[..len], from);
                }
            }
        }

        if done(dht_b) || Instant::now() > deadline {
            return;
        }
    }
}

#[tokio::test]
async fn announced_injector_is_discovered_and_feeds_rendezvous() {
    let socket_a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let socket_b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr_a = v4(&socket_a);
    let addr_b = v4(&socket_b);

    let mut dht_a = DhtClient::new([1u8; 20]);
    let mut dht_b = DhtClient::new([2u8; 20]);
    // Each side needs the other in its routing table; there's no bootstrap
    // ritual here, just enough of one to drive `get_peers` at the target.
    dht_a.add_node([2u8; 20], addr_b);
    dht_b.add_node([1u8; 20], addr_a);

    let swarm = InfoHash::from_sha1(b"integration-test-swarm");
    let announce_port = 9001u16;
    dht_a.announce(swarm, announce_port, Box::new(|_| {}));

    let found = Arc::new(Mutex::new(Vec::<Endpoint>::new()));
    {
        let found = found.clone();
        dht_b.get_peers(
            swarm,
            Box::new(move |batch| {
                found.lock().unwrap().extend_from_slice(batch);
            }),
        );
    }

    pump_until(&socket_a, &mut dht_a, &socket_b, &mut dht_b, |_| !found.lock().unwrap().is_empty()).await;

    let peers = found.lock().unwrap().clone();
    assert!(!peers.is_empty(), "expected at least one announced peer to surface");
    assert!(peers.iter().any(|ep| ep.ip == addr_a.ip().octets() && ep.port == announce_port));

    let mut rendezvous = RendezvousController::new();
    let now = Instant::now();
    let mut started_announcing = false;
    for ep in peers {
        started_announcing |= rendezvous.add_injector(ep, now);
    }
    assert!(started_announcing);
    assert!(rendezvous.is_announcing());
    assert_eq!(rendezvous.pick_random(), Some(Endpoint::new(addr_a.ip().octets(), announce_port)));
}
