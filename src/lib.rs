//! Control plane for a peer-to-peer HTTP caching proxy.
//!
//! Two roles share this crate: an **injector**, which proxies and hashes
//! HTTP responses from real origin servers and publishes its findings to
//! the DHT, and a **helper**, which finds injectors via the DHT and
//! bridges local clients to them over uTP. Both roles run a single
//! cooperative reactor ([`reactor::Reactor`]) that owns one UDP socket
//! multiplexed between DHT (BEP-5/BEP-44) and uTP (BEP-29) traffic.
//!
//! Module map:
//! - [`dht`]: Kademlia routing table, KRPC wire format, and the
//!   announce/get_peers/put collaborator interface.
//! - [`transport`]: the uTP collaborator boundary and its in-process fake.
//! - [`bridge`]: the TCP↔uTP splice used by both roles.
//! - [`rendezvous`]: the helper's injector discovery/selection state machine.
//! - [`http`]: the streaming HTTP engine collaborator boundary.
//! - [`pipeline`]: the injector's per-request proxy/hash/publish pipeline.
//! - [`reactor`]: the single-threaded event loop tying the above together.
//! - [`timer`]: the one-shot/repeating timer wheel the reactor drives.
//! - [`types`]: shared data model (endpoints, hashes, keys).
//! - [`config`]: CLI argument parsing for both binaries.
//! - [`error`]: the crate-wide error type.

pub mod bridge;
pub mod config;
pub mod dht;
pub mod error;
pub mod http;
pub mod pipeline;
pub mod reactor;
pub mod rendezvous;
pub mod timer;
pub mod transport;
pub mod types;

pub use error::CoreError;
