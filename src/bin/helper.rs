//! Helper (proxy-helper) binary: accepts local TCP connections from a
//! browser on the client-facing port, picks a random known injector, and
//! splices the accepted socket onto a fresh uTP connection toward it.
//!
//! Mirrors `injector_helper.c`'s `proxy_create`/`start_taking_requests`/
//! `start_injector_search`/`listener_cb`: bind the client-facing TCP
//! listener, start the `injector_swarm` discovery loop, and on every
//! accepted connection call `pick_random_injector` then `tcp_connect_utp`.
//! Scenario A (spec.md §8) is explicit that the request bytes are forwarded
//! verbatim, so unlike the original's detour through a second loopback
//! `evhttp` connection (itself just re-serializing the same method/URI/
//! headers unchanged) this splices the accepted socket directly — the
//! redirect-port indirection is a Redesign Flag this core simplifies away.

use std::net::{SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use clap::Parser;
use rand::RngCore;
use tokio::net::{TcpListener, TcpStream, UdpSocket};

use dcdn_core::bridge;
use dcdn_core::config::HelperArgs;
use dcdn_core::dht::DhtClient;
use dcdn_core::reactor::Reactor;
use dcdn_core::rendezvous::RendezvousController;
use dcdn_core::transport::{UnimplementedUtp, UtpTransport};
use dcdn_core::types::Endpoint;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = HelperArgs::parse();

    let filter = tracing_subscriber::EnvFilter::try_new(&args.common.log_filter).unwrap_or_default();
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let bind_addr = SocketAddr::V4(SocketAddrV4::new(args.common.address, args.common.port));
    let socket = Arc::new(UdpSocket::bind(bind_addr).await.expect("failed to bind UDP socket"));
    tracing::info!(local = %socket.local_addr().unwrap(), "helper listening");

    let mut local_id = [0u8; 20];
    rand::thread_rng().fill_bytes(&mut local_id);
    let dht = DhtClient::new(local_id);

    let rendezvous = Arc::new(Mutex::new(RendezvousController::new()));
    let utp = Arc::new(UnimplementedUtp::default());

    // `start_injector_search` / `start_announcing_self_in_dht`: the reactor
    // drives both the discovery cadence and the helper's own
    // `injector_proxy_swarm` announce off the same shared rendezvous state.
    let mut reactor = Reactor::new(socket, dht, UnimplementedUtp::default());
    reactor.start_discovery(rendezvous.clone(), args.common.port);

    let client_listener = TcpListener::bind(SocketAddrV4::new(args.common.address, args.client_port))
        .await
        .expect("failed to bind client-facing TCP listener");
    tracing::info!(local = %client_listener.local_addr().unwrap(), "accepting proxy clients");

    let accept_loop = {
        let rendezvous = rendezvous.clone();
        tokio::spawn(async move {
            loop {
                match client_listener.accept().await {
                    Ok((tcp, peer)) => {
                        tracing::debug!(%peer, "accepted client connection");
                        tokio::spawn(handle_client(tcp, rendezvous.clone(), utp.clone()));
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "failed to accept client connection");
                    }
                }
            }
        })
    };

    tokio::select! {
        _ = accept_loop => {}
        _ = reactor.run() => {}
    }
}

/// `listener_cb`: picks a random known injector (`pick_random_injector`) and
/// splices the freshly-accepted TCP socket onto a uTP connection toward it
/// (`tcp_connect_utp`), updating the rendezvous state machine per §4.4 as
/// the connection attempt and splice succeed or fail.
async fn handle_client<U: UtpTransport>(tcp: TcpStream, rendezvous: Arc<Mutex<RendezvousController>>, utp: Arc<U>) {
    let Some(endpoint) = rendezvous.lock().unwrap().pick_random() else {
        tracing::debug!("no known injector yet, dropping client connection");
        return;
    };

    rendezvous.lock().unwrap().mark_in_use(endpoint, Instant::now());

    match utp.connect(endpoint.to_socket_addr()).await {
        Ok(utp_stream) => match bridge::splice(tcp, utp_stream).await {
            Ok(()) => {
                rendezvous.lock().unwrap().mark_success(endpoint);
            }
            Err(err) => {
                tracing::debug!(%endpoint, error = %err, "splice to injector ended in error");
                note_failure(&rendezvous, endpoint);
            }
        },
        Err(err) => {
            tracing::debug!(%endpoint, error = %err, "uTP connect to injector failed");
            note_failure(&rendezvous, endpoint);
        }
    }
}

fn note_failure(rendezvous: &Arc<Mutex<RendezvousController>>, endpoint: Endpoint) {
    if rendezvous.lock().unwrap().mark_failure(endpoint) {
        tracing::info!(%endpoint, "injector evicted, set is now empty; stopping self-announce");
    }
}
