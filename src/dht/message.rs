//! KRPC wire messages (BEP-5 + BEP-44), bencode-encoded.
//!
//! Grounded in `examples/Thoxy67-mainline/src/messages/internal.rs` (the
//! `mainline` DHT crate's own `DHTMessage`/`DHTMessageVariant` split) and
//! generalized to add the BEP-44 `get`/`put` query/response pair that
//! `dht_put_value`/§3's `URLCommitment` needs. The original `dht.h`
//! collaborator interface (`dht_setup`/`dht_process_udp`/`dht_put`) is
//! implemented against this wire format rather than merely declared.

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use crate::error::CoreError;

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("bencode encode failed: {0}")]
    Encode(String),
    #[error("bencode decode failed: {0}")]
    Decode(String),
}

impl From<MessageError> for CoreError {
    fn from(e: MessageError) -> Self {
        CoreError::Dht(crate::dht::DhtError::Protocol(e.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    #[serde(rename = "t", with = "serde_bytes")]
    pub transaction_id: Vec<u8>,

    #[serde(flatten)]
    pub body: MessageBody,

    #[serde(default, rename = "v", with = "serde_bytes", skip_serializing_if = "Option::is_none")]
    pub version: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "y")]
pub enum MessageBody {
    #[serde(rename = "q")]
    Query {
        q: QueryKind,
        a: QueryArgs,
    },
    #[serde(rename = "r")]
    Response {
        r: ResponseArgs,
    },
    #[serde(rename = "e")]
    Error {
        e: (i64, String),
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QueryKind {
    Ping,
    FindNode,
    GetPeers,
    AnnouncePeer,
    Get,
    Put,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QueryArgs {
    #[serde(with = "serde_bytes")]
    pub id: Vec<u8>,

    #[serde(default, with = "serde_bytes", skip_serializing_if = "Option::is_none")]
    pub target: Option<Vec<u8>>,

    #[serde(default, rename = "info_hash", with = "serde_bytes", skip_serializing_if = "Option::is_none")]
    pub info_hash: Option<Vec<u8>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    #[serde(default, with = "serde_bytes", skip_serializing_if = "Option::is_none")]
    pub token: Option<Vec<u8>>,

    #[serde(default, with = "serde_bytes", skip_serializing_if = "Option::is_none")]
    pub target_hash: Option<Vec<u8>>,

    #[serde(default, with = "serde_bytes", skip_serializing_if = "Option::is_none")]
    pub v: Option<Vec<u8>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<i64>,

    #[serde(default, with = "serde_bytes", skip_serializing_if = "Option::is_none")]
    pub salt: Option<Vec<u8>>,

    #[serde(default, with = "serde_bytes", skip_serializing_if = "Option::is_none")]
    pub k: Option<Vec<u8>>,

    #[serde(default, with = "serde_bytes", skip_serializing_if = "Option::is_none")]
    pub sig: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResponseArgs {
    #[serde(with = "serde_bytes")]
    pub id: Vec<u8>,

    #[serde(default, with = "serde_bytes", skip_serializing_if = "Option::is_none")]
    pub nodes: Option<Vec<u8>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<ByteBuf>>,

    #[serde(default, with = "serde_bytes", skip_serializing_if = "Option::is_none")]
    pub token: Option<Vec<u8>>,

    #[serde(default, with = "serde_bytes", skip_serializing_if = "Option::is_none")]
    pub v: Option<Vec<u8>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<i64>,
}

impl Message {
    pub fn to_bytes(&self) -> Result<Vec<u8>, MessageError> {
        serde_bencode::to_bytes(self).map_err(|e| MessageError::Encode(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Message, MessageError> {
        serde_bencode::from_bytes(bytes).map_err(|e| MessageError::Decode(e.to_string()))
    }

    /// `true` if the first byte looks like bencode's dict opener, the only
    /// cheap self-description KRPC has (cf. §4.1's uTP-header self-description).
    pub fn looks_like_krpc(bytes: &[u8]) -> bool {
        bytes.first() == Some(&b'd')
    }
}
