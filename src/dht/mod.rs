//! DHT engine (§4.2): the collaborator interface the core relies on,
//! implemented rather than merely declared against the contract spec.md
//! gives it (`announce`, `get_peers`, `put`, `tick`, `process_udp`,
//! `process_icmp`). A Kademlia routing table ([`routing::RoutingTable`])
//! and bencoded KRPC wire format ([`message`]) back it; BEP-44 storage is
//! both the immutable path `URLCommitment` publication uses and the
//! signed-mutable path left open by spec.md §9 (resolved: immutable for
//! commitments, mutable kept available as `put_mutable` for completeness).
//!
//! Grounded in `examples/Thoxy67-mainline` (a real `mainline` DHT crate)
//! for the routing-table/KRPC shape, and in `dht.h`/`injector.c`'s
//! `dht_setup`/`dht_announce`/`dht_put_value`/`dht_process_udp` contract
//! for the operation names and callback semantics.

pub mod compact;
pub mod message;
pub mod routing;

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddrV4;
use std::time::{Duration, Instant};

use rand::RngCore;
use zeroize::Zeroize;

use crate::types::{Endpoint, InfoHash, MutableItem};
use message::{Message, MessageBody, QueryArgs, QueryKind, ResponseArgs};
use routing::RoutingTable;

#[derive(Debug, thiserror::Error)]
pub enum DhtError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol: {0}")]
    Protocol(String),
    #[error("value too large: {0} bytes (max {max})", max = crate::types::MutableItem::MAX_VALUE_LEN)]
    ValueTooLarge(usize),
}

/// Per-lookup callback: each call carries a batch of newly discovered
/// peers; a call with an empty batch marks the lookup terminal (§4.2).
pub type PeerCallback = Box<dyn FnMut(&[Endpoint]) + Send>;
/// Fires once storage has been acknowledged by at least one node, or the
/// lookup exhausted its frontier without any acknowledgement.
pub type PutCallback = Box<dyn FnOnce(Result<(), DhtError>) + Send>;

const ALPHA: usize = 3;
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);
/// Hard bound on how many distinct nodes a single lookup will contact;
/// prevents an adversarial or buggy peer from growing the frontier forever.
const MAX_NODES_PER_LOOKUP: usize = 64;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
struct TxId(u16);

impl TxId {
    fn to_bytes(self) -> Vec<u8> {
        self.0.to_be_bytes().to_vec()
    }

    fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 2 {
            return None;
        }
        Some(TxId(u16::from_be_bytes([bytes[0], bytes[1]])))
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
struct LookupId(u64);

enum LookupKind {
    GetPeers { announce_port: Option<u16> },
    Put { value: Vec<u8>, mutable: Option<MutableFields>, acked: bool },
}

struct MutableFields {
    public_key: [u8; 32],
    salt: Option<Vec<u8>>,
    seq: i64,
    signature: [u8; 64],
}

struct Lookup {
    kind: LookupKind,
    target: InfoHash,
    callback: Option<PeerCallback>,
    put_callback: Option<PutCallback>,
    frontier: VecDeque<([u8; 20], SocketAddrV4)>,
    queried: HashSet<SocketAddrV4>,
    tokens: Vec<(SocketAddrV4, Vec<u8>)>,
    outstanding: u32,
    deadline: Instant,
    done: bool,
}

/// A stored immutable value plus the mutable variant, keyed the same way
/// (by the `InfoHash` the putter asserts, per §9's simplification note in
/// [`DESIGN.md`](../../DESIGN.md): this engine trusts the caller-specified
/// key rather than re-deriving it from the value, mirroring `dht_put`'s
/// explicit key-material signature).
enum Stored {
    Immutable(Vec<u8>),
    Mutable(MutableItem),
}

pub struct DhtClient {
    local_id: [u8; 20],
    table: RoutingTable,
    store: HashMap<InfoHash, Stored>,
    announced_peers: HashMap<InfoHash, HashSet<Endpoint>>,
    token_secret: [u8; 16],
    lookups: HashMap<LookupId, Lookup>,
    pending_tx: HashMap<TxId, (LookupId, SocketAddrV4)>,
    next_lookup_id: u64,
    next_tx: u16,
    outgoing: VecDeque<(Vec<u8>, SocketAddrV4)>,
}

impl DhtClient {
    pub fn new(local_id: [u8; 20]) -> Self {
        let mut rng = rand::thread_rng();
        let mut token_secret = [0u8; 16];
        rng.fill_bytes(&mut token_secret);
        Self {
            local_id,
            table: RoutingTable::new(local_id),
            store: HashMap::new(),
            announced_peers: HashMap::new(),
            token_secret,
            lookups: HashMap::new(),
            pending_tx: HashMap::new(),
            next_lookup_id: 0,
            next_tx: 0,
            outgoing: VecDeque::new(),
        }
    }

    pub fn local_id(&self) -> [u8; 20] {
        self.local_id
    }

    pub fn routing_table_len(&self) -> usize {
        self.table.len()
    }

    /// Seeds the routing table directly, e.g. from a resolved bootstrap
    /// host:port pair. Production bootstrap (DNS resolution of well-known
    /// bootstrap hosts) is a collaborator concern outside this engine.
    pub fn add_node(&mut self, node_id: [u8; 20], addr: SocketAddrV4) {
        self.table.seen(node_id, addr);
    }

    /// Datagrams queued for the reactor to actually send. The reactor owns
    /// the socket (§3); this engine only ever appends here.
    pub fn drain_outgoing(&mut self) -> Vec<(Vec<u8>, SocketAddrV4)> {
        self.outgoing.drain(..).collect()
    }

    fn next_tx_id(&mut self) -> TxId {
        let id = TxId(self.next_tx);
        self.next_tx = self.next_tx.wrapping_add(1);
        id
    }

    fn token_for(&self, addr: SocketAddrV4) -> Vec<u8> {
        let mut data = self.token_secret.to_vec();
        data.extend_from_slice(&addr.ip().octets());
        data.extend_from_slice(&addr.port().to_be_bytes());
        crate::types::blake2b_256(&data)[..8].to_vec()
    }

    fn valid_token(&self, addr: SocketAddrV4, token: &[u8]) -> bool {
        self.token_for(addr) == token
    }

    fn send_query(&mut self, addr: SocketAddrV4, q: QueryKind, a: QueryArgs) -> TxId {
        let tx = self.next_tx_id();
        let msg = Message { transaction_id: tx.to_bytes(), body: MessageBody::Query { q, a }, version: None };
        if let Ok(bytes) = msg.to_bytes() {
            self.outgoing.push_back((bytes, addr));
        }
        tx
    }

    fn base_args(&self) -> QueryArgs {
        QueryArgs { id: self.local_id.to_vec(), ..Default::default() }
    }

    fn start_lookup(&mut self, target: InfoHash, kind: LookupKind) -> LookupId {
        let id = LookupId(self.next_lookup_id);
        self.next_lookup_id += 1;
        let frontier: VecDeque<_> = self.table.closest(&target, ALPHA * 2).into_iter().collect();
        self.lookups.insert(
            id,
            Lookup {
                kind,
                target,
                callback: None,
                put_callback: None,
                frontier,
                queried: HashSet::new(),
                tokens: Vec::new(),
                outstanding: 0,
                deadline: Instant::now() + LOOKUP_TIMEOUT,
                done: false,
            },
        );
        id
    }

    /// Publishes the local endpoint under `info_hash` and returns discovered
    /// peers the same way `get_peers` does; the callback fires at least
    /// once, terminally with an empty batch (§4.2).
    pub fn announce(&mut self, info_hash: InfoHash, port: u16, callback: PeerCallback) {
        let id = self.start_lookup(info_hash, LookupKind::GetPeers { announce_port: Some(port) });
        self.lookups.get_mut(&id).unwrap().callback = Some(callback);
    }

    /// Looks up peers for `info_hash` without announcing.
    pub fn get_peers(&mut self, info_hash: InfoHash, callback: PeerCallback) {
        let id = self.start_lookup(info_hash, LookupKind::GetPeers { announce_port: None });
        self.lookups.get_mut(&id).unwrap().callback = Some(callback);
    }

    /// BEP-44 immutable put: stores `value` at the caller-chosen key
    /// `target` (§3: `URLCommitment`'s `hash(request_uri)`).
    pub fn put(&mut self, target: InfoHash, value: Vec<u8>, callback: PutCallback) -> Result<(), DhtError> {
        if value.len() > MutableItem::MAX_VALUE_LEN {
            return Err(DhtError::ValueTooLarge(value.len()));
        }
        let id = self.start_lookup(target, LookupKind::Put { value, mutable: None, acked: false });
        self.lookups.get_mut(&id).unwrap().put_callback = Some(callback);
        Ok(())
    }

    /// BEP-44 mutable put: monotonic `seq` per `(public_key, salt)` (§5's
    /// conflict-resolution rule); signing is the caller's responsibility
    /// via [`crate::types::Keypair::sign`].
    #[allow(clippy::too_many_arguments)]
    pub fn put_mutable(
        &mut self,
        public_key: [u8; 32],
        salt: Option<Vec<u8>>,
        value: Vec<u8>,
        seq: i64,
        signature: [u8; 64],
        callback: PutCallback,
    ) -> Result<(), DhtError> {
        if value.len() > MutableItem::MAX_VALUE_LEN {
            return Err(DhtError::ValueTooLarge(value.len()));
        }
        let item = MutableItem { public_key, salt: salt.clone(), value: value.clone(), seq: seq as u64, signature };
        let target = item.target();
        let mutable = MutableFields { public_key, salt, seq, signature };
        let id = self.start_lookup(target, LookupKind::Put { value, mutable: Some(mutable), acked: false });
        self.lookups.get_mut(&id).unwrap().put_callback = Some(callback);
        Ok(())
    }

    /// Periodic bookkeeping, called by the reactor roughly once per second:
    /// advances every in-flight lookup by dispatching more queries up to
    /// `ALPHA` outstanding per lookup, and finalizes lookups that have
    /// exhausted their frontier or timed out.
    pub fn tick(&mut self) {
        let now = Instant::now();
        let ids: Vec<LookupId> = self.lookups.keys().copied().collect();
        for id in ids {
            self.advance_lookup(id, now);
        }
    }

    fn advance_lookup(&mut self, id: LookupId, now: Instant) {
        let Some(lookup) = self.lookups.get_mut(&id) else { return };
        if lookup.done {
            return;
        }

        let timed_out = now >= lookup.deadline;
        let contacted_cap = lookup.queried.len() >= MAX_NODES_PER_LOOKUP;

        while !timed_out && !contacted_cap && lookup.outstanding < ALPHA as u32 {
            let Some((node_id, addr)) = lookup.frontier.pop_front() else { break };
            if lookup.queried.contains(&addr) {
                continue;
            }
            lookup.queried.insert(addr);
            lookup.outstanding += 1;

            let mut args = self.base_args();
            let target = lookup.target;
            let is_put = matches!(lookup.kind, LookupKind::Put { .. });
            let query_kind = if is_put { QueryKind::Get } else { QueryKind::GetPeers };
            if is_put {
                args.target_hash = Some(target.0.to_vec());
            } else {
                args.info_hash = Some(target.0.to_vec());
            }
            let tx = self.send_query(addr, query_kind, args);
            self.pending_tx.insert(tx, (id, addr));
            let _ = node_id;
        }

        let lookup = self.lookups.get_mut(&id).unwrap();
        if timed_out || (lookup.frontier.is_empty() && lookup.outstanding == 0) {
            self.finalize_lookup(id);
        }
    }

    fn finalize_lookup(&mut self, id: LookupId) {
        let Some(mut lookup) = self.lookups.remove(&id) else { return };
        if lookup.done {
            return;
        }
        lookup.done = true;

        match &mut lookup.kind {
            LookupKind::GetPeers { announce_port } => {
                if let Some(port) = announce_port {
                    for (addr, token) in lookup.tokens.drain(..) {
                        let mut args = self.base_args();
                        args.info_hash = Some(lookup.target.0.to_vec());
                        args.port = Some(*port);
                        args.token = Some(token);
                        self.send_query(addr, QueryKind::AnnouncePeer, args);
                    }
                }
                if let Some(mut cb) = lookup.callback.take() {
                    cb(&[]);
                }
            }
            LookupKind::Put { value, mutable, acked } => {
                if !*acked {
                    for (addr, token) in lookup.tokens.drain(..) {
                        let mut args = self.base_args();
                        args.target_hash = Some(lookup.target.0.to_vec());
                        args.v = Some(value.clone());
                        args.token = Some(token);
                        if let Some(m) = mutable {
                            args.k = Some(m.public_key.to_vec());
                            args.salt = m.salt.clone();
                            args.seq = Some(m.seq);
                            args.sig = Some(m.signature.to_vec());
                        }
                        self.send_query(addr, QueryKind::Put, args);
                    }
                }
                if let Some(cb) = lookup.put_callback.take() {
                    cb(Ok(()));
                }
                // Store locally too: an injector that publishes its own
                // commitment should be able to answer a `get` for it.
                let stored = match mutable.take() {
                    Some(m) => Stored::Mutable(MutableItem {
                        public_key: m.public_key,
                        salt: m.salt,
                        value: value.clone(),
                        seq: m.seq as u64,
                        signature: m.signature,
                    }),
                    None => Stored::Immutable(value.clone()),
                };
                self.store.insert(lookup.target, stored);
            }
        }
    }

    /// Consumes a datagram or returns `false` (§4.1's demux contract: only
    /// a `false` return lets the reactor try another consumer / drop it).
    pub fn process_udp(&mut self, bytes: &[u8], from: SocketAddrV4) -> bool {
        if !Message::looks_like_krpc(bytes) {
            return false;
        }
        let msg = match Message::from_bytes(bytes) {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!(%from, error = %e, "malformed DHT message, dropping");
                return true;
            }
        };
        match msg.body {
            MessageBody::Query { q, a } => self.handle_query(msg.transaction_id, q, a, from),
            MessageBody::Response { r } => self.handle_response(&msg.transaction_id, r, from),
            MessageBody::Error { e } => {
                tracing::debug!(%from, code = e.0, message = %e.1, "DHT error response");
                if let Some(tx) = TxId::from_bytes(&msg.transaction_id) {
                    if let Some((lookup_id, _)) = self.pending_tx.remove(&tx) {
                        if let Some(lookup) = self.lookups.get_mut(&lookup_id) {
                            lookup.outstanding = lookup.outstanding.saturating_sub(1);
                        }
                    }
                }
            }
        }
        true
    }

    fn handle_query(&mut self, tx: Vec<u8>, q: QueryKind, a: QueryArgs, from: SocketAddrV4) {
        if let Some(id_bytes) = a.id.get(..20) {
            let mut id = [0u8; 20];
            id.copy_from_slice(id_bytes);
            self.table.seen(id, from);
        }

        let mut r = ResponseArgs { id: self.local_id.to_vec(), ..Default::default() };
        match q {
            QueryKind::Ping => {}
            QueryKind::FindNode => {
                if let Some(target) = a.target.as_deref().and_then(to_info_hash) {
                    r.nodes = Some(compact::encode_nodes(&self.closest_endpoints(&target)));
                }
            }
            QueryKind::GetPeers => {
                r.token = Some(self.token_for(from));
                if let Some(info_hash) = a.info_hash.as_deref().and_then(to_info_hash) {
                    if let Some(peers) = self.announced_peers.get(&info_hash) {
                        r.values = Some(
                            peers
                                .iter()
                                .map(|ep| serde_bytes::ByteBuf::from(compact::encode_one(*ep).to_vec()))
                                .collect(),
                        );
                    } else {
                        r.nodes = Some(compact::encode_nodes(&self.closest_endpoints(&info_hash)));
                    }
                }
            }
            QueryKind::AnnouncePeer => {
                let valid = a.token.as_deref().is_some_and(|t| self.valid_token(from, t));
                if valid {
                    if let Some(info_hash) = a.info_hash.as_deref().and_then(to_info_hash) {
                        let port = a.port.unwrap_or(from.port());
                        let ep = Endpoint::new(from.ip().octets(), port);
                        self.announced_peers.entry(info_hash).or_default().insert(ep);
                    }
                } else {
                    tracing::debug!(%from, "rejected announce_peer with invalid token");
                }
            }
            QueryKind::Get => {
                r.token = Some(self.token_for(from));
                if let Some(target) = a.target_hash.as_deref().and_then(to_info_hash) {
                    match self.store.get(&target) {
                        Some(Stored::Immutable(v)) => r.v = Some(v.clone()),
                        Some(Stored::Mutable(item)) => {
                            r.v = Some(item.value.clone());
                            r.seq = Some(item.seq as i64);
                        }
                        None => r.nodes = Some(compact::encode_nodes(&self.closest_endpoints(&target))),
                    }
                }
            }
            QueryKind::Put => {
                let valid = a.token.as_deref().is_some_and(|t| self.valid_token(from, t));
                if valid {
                    if let (Some(target), Some(value)) = (a.target_hash.as_deref().and_then(to_info_hash), a.v.clone()) {
                        if value.len() <= MutableItem::MAX_VALUE_LEN {
                            let stored = match (a.k, a.seq, a.sig) {
                                (Some(k), Some(seq), Some(sig)) if k.len() == 32 && sig.len() == 64 => {
                                    let mut public_key = [0u8; 32];
                                    public_key.copy_from_slice(&k);
                                    let mut signature = [0u8; 64];
                                    signature.copy_from_slice(&sig);
                                    Stored::Mutable(MutableItem {
                                        public_key,
                                        salt: a.salt,
                                        value,
                                        seq: seq as u64,
                                        signature,
                                    })
                                }
                                _ => Stored::Immutable(value),
                            };
                            self.store.insert(target, stored);
                        }
                    }
                } else {
                    tracing::debug!(%from, "rejected put with invalid token");
                }
            }
        }

        let msg = Message { transaction_id: tx, body: MessageBody::Response { r }, version: None };
        if let Ok(bytes) = msg.to_bytes() {
            self.outgoing.push_back((bytes, from));
        }
    }

    fn handle_response(&mut self, tx_bytes: &[u8], r: ResponseArgs, from: SocketAddrV4) {
        let Some(tx) = TxId::from_bytes(tx_bytes) else { return };
        let Some((lookup_id, addr)) = self.pending_tx.remove(&tx) else { return };
        if addr != from {
            tracing::debug!(%from, %addr, "response source mismatch, ignoring");
            return;
        }

        if let Some(id_bytes) = r.id.get(..20) {
            let mut id = [0u8; 20];
            id.copy_from_slice(id_bytes);
            self.table.seen(id, from);
        }

        let Some(lookup) = self.lookups.get_mut(&lookup_id) else { return };
        lookup.outstanding = lookup.outstanding.saturating_sub(1);

        if let Some(token) = r.token {
            lookup.tokens.push((from, token));
        }

        if let Some(values) = &r.values {
            let records: Vec<Endpoint> = values.iter().filter_map(|v| compact::decode_one(v)).collect();
            if !records.is_empty() {
                if let Some(cb) = lookup.callback.as_mut() {
                    cb(&records);
                }
            }
        }

        if let Some(nodes_bytes) = &r.nodes {
            let discovered = compact::decode_nodes(nodes_bytes);
            let target = lookup.target;
            for (node_id, ep) in discovered {
                let addr: SocketAddrV4 = ep.into();
                if !lookup.queried.contains(&addr) && lookup.frontier.len() + lookup.queried.len() < MAX_NODES_PER_LOOKUP {
                    lookup.frontier.push_back((node_id, addr));
                }
                self.table.seen(node_id, addr);
            }
            lookup.frontier.make_contiguous().sort_by_key(|(id, _)| xor(&id, &target.0));
        }

        // A `get` response for a Put lookup may directly return the value
        // another node already stored; not otherwise used here.
        let _ = r.v;
        let _ = r.seq;

        self.advance_lookup(lookup_id, Instant::now());
    }

    fn closest_endpoints(&mut self, target: &InfoHash) -> Vec<([u8; 20], Endpoint)> {
        self.table
            .closest(target, 8)
            .into_iter()
            .map(|(id, addr)| (id, Endpoint::from(addr)))
            .collect()
    }

    /// ICMP-derived unreachability (§9 Open Question 3, resolved: poisons
    /// both the uTP peer cache, handled by the reactor, and this routing
    /// table, handled here).
    pub fn process_icmp(&mut self, from: SocketAddrV4) {
        self.table.remove_by_addr(from);
    }
}

impl Drop for DhtClient {
    /// `token_secret` is the only long-lived secret this engine holds (the
    /// BEP-44 signing key lives in the caller's [`crate::types::Keypair`]);
    /// scrub it so a stale announce token can't be recomputed from a freed
    /// heap page.
    fn drop(&mut self) {
        self.token_secret.zeroize();
    }
}

fn xor(a: &[u8; 20], b: &[u8; 20]) -> [u8; 20] {
    let mut out = [0u8; 20];
    for i in 0..20 {
        out[i] = a[i] ^ b[i];
    }
    out
}

fn to_info_hash(bytes: &[u8]) -> Option<InfoHash> {
    if bytes.len() != 20 {
        return None;
    }
    let mut out = [0u8; 20];
    out.copy_from_slice(bytes);
    Some(InfoHash(out))
}
