//! Shared data model: §3 of the design — endpoints, DHT keys, and the
//! records the rendezvous controller and injector pipeline pass around.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

/// An IPv4 endpoint: 4-byte address plus 16-bit port. Bytewise equality,
/// matching the original `endpoint { uint8_t ip[4]; uint16_t port; }`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub ip: [u8; 4],
    pub port: u16,
}

impl Endpoint {
    pub const ZERO: Endpoint = Endpoint { ip: [0, 0, 0, 0], port: 0 };

    pub fn new(ip: [u8; 4], port: u16) -> Self {
        Self { ip, port }
    }

    pub fn is_zero_ip(&self) -> bool {
        self.ip == [0, 0, 0, 0]
    }

    pub fn to_socket_addr(self) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::from(self.ip), self.port)
    }
}

impl From<SocketAddrV4> for Endpoint {
    fn from(addr: SocketAddrV4) -> Self {
        Self { ip: addr.ip().octets(), port: addr.port() }
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}.{}:{}", self.ip[0], self.ip[1], self.ip[2], self.ip[3], self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// 20-byte DHT lookup key (BEP-5 info-hash / BEP-44 SHA-1 target).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHash(pub [u8; 20]);

impl InfoHash {
    pub fn from_sha1(data: &[u8]) -> Self {
        let digest = sha1_smol::Sha1::from(data).digest().bytes();
        InfoHash(digest)
    }
}

impl fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// The swarm every injector announces itself to, and every helper searches.
pub fn injector_swarm() -> InfoHash {
    InfoHash::from_sha1(b"clostra-dcdn-injector-swarm")
}

/// The swarm every active helper joins so injectors can find them.
pub fn injector_proxy_swarm() -> InfoHash {
    InfoHash::from_sha1(b"clostra-dcdn-injector-proxy-swarm")
}

/// Ed25519 keypair used only for BEP-44 mutable items.
pub struct Keypair {
    pub public: ed25519_dalek::VerifyingKey,
    signing: ed25519_dalek::SigningKey,
}

impl Keypair {
    pub fn generate<R: rand::RngCore + rand::CryptoRng>(rng: &mut R) -> Self {
        let signing = ed25519_dalek::SigningKey::generate(rng);
        Self { public: signing.verifying_key(), signing }
    }

    pub fn sign(&self, msg: &[u8]) -> ed25519_dalek::Signature {
        use ed25519_dalek::Signer;
        self.signing.sign(msg)
    }
}

/// A BEP-44 mutable item: (public_key, optional salt, value, seq, signature).
/// Lookup key is `SHA-1(public_key || salt)`.
#[derive(Clone, Debug)]
pub struct MutableItem {
    pub public_key: [u8; 32],
    pub salt: Option<Vec<u8>>,
    pub value: Vec<u8>,
    pub seq: u64,
    pub signature: [u8; 64],
}

impl MutableItem {
    pub const MAX_VALUE_LEN: usize = 1000;

    pub fn target(&self) -> InfoHash {
        let mut buf = Vec::with_capacity(32 + self.salt.as_ref().map_or(0, Vec::len));
        buf.extend_from_slice(&self.public_key);
        if let Some(salt) = &self.salt {
            buf.extend_from_slice(salt);
        }
        InfoHash::from_sha1(&buf)
    }
}

/// `hash(URL) -> hash(content)` commitment published by the injector and
/// verified by later consumers. Both hashes are BLAKE2b-256.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct UrlCommitment {
    pub url_hash: [u8; 32],
    pub content_hash: [u8; 32],
}

impl fmt::Debug for UrlCommitment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UrlCommitment")
            .field("url_hash", &hex(&self.url_hash))
            .field("content_hash", &hex(&self.content_hash))
            .finish()
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// BLAKE2b-256 of `request_uri`, used as the BEP-44 immutable lookup key.
pub fn hash_url(request_uri: &str) -> [u8; 32] {
    blake2b_256(request_uri.as_bytes())
}

pub fn blake2b_256(data: &[u8]) -> [u8; 32] {
    use blake2::digest::consts::U32;
    use blake2::{Blake2b, Digest};
    type Blake2b256 = Blake2b<U32>;
    let mut hasher = Blake2b256::new();
    hasher.update(data);
    let out = hasher.finalize();
    let mut result = [0u8; 32];
    result.copy_from_slice(&out);
    result
}

/// Streaming BLAKE2b-256 state, fed one buffer segment at a time in
/// network-receive order (§4.5, testable property 3).
pub struct StreamingHash {
    inner: blake2::Blake2b<blake2::digest::consts::U32>,
}

impl StreamingHash {
    pub fn new() -> Self {
        use blake2::Digest;
        Self { inner: blake2::Blake2b::<blake2::digest::consts::U32>::new() }
    }

    pub fn update(&mut self, segment: &[u8]) {
        use blake2::Digest;
        self.inner.update(segment);
    }

    pub fn finalize(self) -> [u8; 32] {
        use blake2::Digest;
        let out = self.inner.finalize();
        let mut result = [0u8; 32];
        result.copy_from_slice(&out);
        result
    }
}

impl Default for StreamingHash {
    fn default() -> Self {
        Self::new()
    }
}

/// Helper-side bookkeeping for a discovered injector (§3).
#[derive(Clone, Debug)]
pub struct InjectorRecord {
    pub endpoint: Endpoint,
    pub first_seen: std::time::Instant,
    pub last_contacted: Option<std::time::Instant>,
    pub consecutive_failures: u32,
}

impl InjectorRecord {
    pub fn new(endpoint: Endpoint, now: std::time::Instant) -> Self {
        Self { endpoint, first_seen: now, last_contacted: None, consecutive_failures: 0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_zero_detection() {
        assert!(Endpoint::ZERO.is_zero_ip());
        assert!(!Endpoint::new([10, 0, 0, 1], 7000).is_zero_ip());
    }

    #[test]
    fn streaming_hash_matches_one_shot() {
        let body = b"hello world, this is a streamed response body";
        let whole = blake2b_256(body);

        let mut streaming = StreamingHash::new();
        for chunk in body.chunks(7) {
            streaming.update(chunk);
        }
        assert_eq!(streaming.finalize(), whole);
    }

    #[test]
    fn mutable_item_target_depends_on_salt() {
        let item_no_salt = MutableItem {
            public_key: [1u8; 32],
            salt: None,
            value: vec![],
            seq: 0,
            signature: [0u8; 64],
        };
        let item_with_salt = MutableItem { salt: Some(b"s".to_vec()), ..item_no_salt.clone() };
        assert_ne!(item_no_salt.target().0, item_with_salt.target().0);
    }

    #[test]
    fn well_known_swarms_are_distinct_and_stable() {
        assert_ne!(injector_swarm().0, injector_proxy_swarm().0);
        assert_eq!(injector_swarm().0, injector_swarm().0);
    }
}
