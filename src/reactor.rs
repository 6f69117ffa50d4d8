//! The single-threaded cooperative reactor (§3, §4.1).
//!
//! Grounded in `network.c`'s `network_setup`/`network_poll`/`network_loop`:
//! one thread owns the UDP socket, the uTP context, and the DHT, and feeds
//! every inbound datagram to uTP first, then the DHT (`utp_process_udp`
//! before `dht_process_udp`), bounding its poll wait at 500ms so timers
//! still fire promptly even with no traffic. SIGINT sets a quit flag
//! instead of tearing anything down from a signal handler. `network_setup`
//! also ignores `SIGPIPE` up front; tokio's sockets never raise it in the
//! first place (a half-closed peer surfaces as a normal write error), so
//! there is nothing for this reactor to ignore.

use std::net::SocketAddrV4;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;

use crate::dht::DhtClient;
use crate::rendezvous::RendezvousController;
use crate::timer::TimerWheel;
use crate::transport::UtpTransport;
use crate::types::{injector_proxy_swarm, injector_swarm, InfoHash};

/// Ceiling on how long a single poll iteration blocks waiting for a
/// datagram before re-checking timers (`poll(p, lenof(p), 500)`).
const POLL_TIMEOUT: Duration = Duration::from_millis(500);
const MAX_DATAGRAM: usize = 4096;

/// A recurring `dht_announce` the reactor fires on its own, replacing the
/// original's `timer_repeating(n, period, ^{ dht_announce(...) })`: a boxed
/// Block there captures `n` by pointer and can freely call back into it,
/// but a `'static` Rust closure in [`TimerWheel`] can't hold a borrow of the
/// very reactor that owns the timer wheel, so this is reactor state instead
/// of a timer callback.
struct SelfAnnounce {
    info_hash: InfoHash,
    port: u16,
    period: Duration,
    next_fire: Instant,
}

/// The helper's injector-discovery cadence (`start_injector_search`):
/// periodic `dht_get_peers(injector_swarm, ...)`, feeding results into a
/// [`RendezvousController`] shared with the TCP-accept side of the helper
/// binary, which lives outside the reactor since it never touches the DHT
/// or the UDP socket. The cadence itself (§4.4: 1 minute while empty, 25
/// minutes otherwise) is re-armed from `pending_interval`, which the
/// `get_peers` callback fills in once its lookup reaches the terminal
/// empty-batch call — the callback only ever touches the shared
/// `rendezvous` lock, never the reactor directly, since it may still be
/// queued when `dht.tick()` returns.
struct Discovery {
    info_hash: InfoHash,
    rendezvous: Arc<Mutex<RendezvousController>>,
    announce_info_hash: InfoHash,
    announce_port: u16,
    next_poll: Instant,
    in_flight: bool,
    pending_interval: Arc<Mutex<Option<Duration>>>,
}

pub struct Reactor<U: UtpTransport> {
    socket: Arc<UdpSocket>,
    dht: DhtClient,
    utp: U,
    timers: TimerWheel,
    self_announce: Option<SelfAnnounce>,
    discovery: Option<Discovery>,
}

impl<U: UtpTransport> Reactor<U> {
    pub fn new(socket: Arc<UdpSocket>, dht: DhtClient, utp: U) -> Self {
        Self { socket, dht, utp, timers: TimerWheel::new(), self_announce: None, discovery: None }
    }

    pub fn dht(&mut self) -> &mut DhtClient {
        &mut self.dht
    }

    pub fn utp(&self) -> &U {
        &self.utp
    }

    pub fn timers(&mut self) -> &mut TimerWheel {
        &mut self.timers
    }

    /// Schedules a recurring self-announce, firing once immediately and
    /// then every `period` (`do_announce(); timer_start(n, period, do_announce)`
    /// in the original).
    pub fn schedule_self_announce(&mut self, info_hash: InfoHash, port: u16, period: Duration) {
        self.dht.announce(info_hash, port, Box::new(|_| {}));
        self.self_announce = Some(SelfAnnounce { info_hash, port, period, next_fire: Instant::now() + period });
    }

    /// Starts the helper's injector-discovery loop (`start_injector_search`):
    /// an immediate `get_peers(injector_swarm)`, re-armed at the cadence
    /// `rendezvous.next_discovery_interval()` reports once each lookup
    /// finishes. The helper's own `injector_proxy_swarm` self-announce is
    /// started and stopped automatically as `rendezvous`'s known-injector
    /// set becomes non-empty and empty again (§4.4, §9 Open Question 4).
    pub fn start_discovery(&mut self, rendezvous: Arc<Mutex<RendezvousController>>, announce_port: u16) {
        self.discovery = Some(Discovery {
            info_hash: injector_swarm(),
            rendezvous,
            announce_info_hash: injector_proxy_swarm(),
            announce_port,
            next_poll: Instant::now(),
            in_flight: false,
            pending_interval: Arc::new(Mutex::new(None)),
        });
    }

    fn fire_discovery(&mut self) {
        let Some(discovery) = &mut self.discovery else { return };

        if let Some(interval) = discovery.pending_interval.lock().unwrap().take() {
            discovery.next_poll = Instant::now() + interval;
            discovery.in_flight = false;
        }

        if discovery.in_flight || Instant::now() < discovery.next_poll {
            return;
        }
        discovery.in_flight = true;

        let info_hash = discovery.info_hash;
        let rendezvous = discovery.rendezvous.clone();
        let pending_interval = discovery.pending_interval.clone();

        self.dht.get_peers(
            info_hash,
            Box::new(move |batch| {
                if batch.is_empty() {
                    let interval = rendezvous.lock().unwrap().next_discovery_interval();
                    *pending_interval.lock().unwrap() = Some(interval);
                } else {
                    let now = Instant::now();
                    let mut controller = rendezvous.lock().unwrap();
                    for ep in batch {
                        controller.add_injector(*ep, now);
                    }
                }
            }),
        );
    }

    /// Starts or stops the helper's own `injector_proxy_swarm` announce as
    /// `rendezvous`'s known-injector set transitions to/from empty, read
    /// fresh every tick rather than trusted from the last callback (the
    /// TCP-accept side may also evict injectors directly via
    /// [`RendezvousController::mark_failure`]).
    fn sync_helper_announce(&mut self) {
        let Some((announcing, info_hash, port)) = self.discovery.as_ref().map(|d| {
            (d.rendezvous.lock().unwrap().is_announcing(), d.announce_info_hash, d.announce_port)
        }) else {
            return;
        };

        if announcing && self.self_announce.is_none() {
            self.schedule_self_announce(info_hash, port, RendezvousController::announce_interval());
        } else if !announcing && self.self_announce.is_some() {
            self.self_announce = None;
        }
    }

    /// Runs until `ctrl_c()` resolves, mirroring `network_loop`'s
    /// `while (!quit_flag)`.
    pub async fn run(mut self) {
        let mut shutdown = Box::pin(tokio::signal::ctrl_c());
        loop {
            let deadline = self.timers.next_deadline().map(|d| d.saturating_duration_since(Instant::now()));
            let wait = deadline.map(|d| d.min(POLL_TIMEOUT)).unwrap_or(POLL_TIMEOUT);

            let mut buf = [0u8; MAX_DATAGRAM];
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("caught SIGINT, shutting down");
                    break;
                }
                result = tokio::time::timeout(wait, self.socket.recv_from(&mut buf)) => {
                    if let Ok(Ok((len, from))) = result {
                        if let std::net::SocketAddr::V4(from_v4) = from {
                            self.on_datagram(&buf[..len], from_v4).await;
                        }
                    }
                }
            }

            self.timers.fire_expired(Instant::now());
            self.fire_self_announce();
            self.fire_discovery();
            self.dht.tick();
            self.sync_helper_announce();
            self.flush_dht_outgoing().await;
        }

        tracing::info!(routing_table_len = self.dht.routing_table_len(), "reactor stopped");
    }

    fn fire_self_announce(&mut self) {
        let Some(announce) = &mut self.self_announce else { return };
        if Instant::now() < announce.next_fire {
            return;
        }
        let info_hash = announce.info_hash;
        let port = announce.port;
        announce.next_fire = Instant::now() + announce.period;
        tracing::debug!(?info_hash, "re-announcing self");
        self.dht.announce(info_hash, port, Box::new(|_| {}));
    }

    async fn on_datagram(&mut self, bytes: &[u8], from: SocketAddrV4) {
        if self.utp.process_udp(bytes, from) {
            return;
        }
        self.dht.process_udp(bytes, from);
    }

    async fn flush_dht_outgoing(&mut self) {
        for (bytes, to) in self.dht.drain_outgoing() {
            if let Err(err) = self.socket.send_to(&bytes, to).await {
                tracing::debug!(%to, error = %err, "failed to send DHT datagram");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dht_query_sent_through_the_reactor_socket_reaches_a_peer_socket() {
        let socket_a = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let socket_b = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let addr_b = match socket_b.local_addr().unwrap() {
            std::net::SocketAddr::V4(v4) => v4,
            _ => unreachable!(),
        };

        let mut dht_a = DhtClient::new([1u8; 20]);
        dht_a.add_node([2u8; 20], addr_b);
        dht_a.get_peers(crate::types::InfoHash([9u8; 20]), Box::new(|_| {}));
        dht_a.tick();

        for (bytes, to) in dht_a.drain_outgoing() {
            socket_a.send_to(&bytes, to).await.unwrap();
        }

        let mut buf = [0u8; 1024];
        let (len, _from) = tokio::time::timeout(Duration::from_secs(1), socket_b.recv_from(&mut buf)).await.unwrap().unwrap();
        assert!(crate::dht::message::Message::from_bytes(&buf[..len]).is_ok());
    }
}
