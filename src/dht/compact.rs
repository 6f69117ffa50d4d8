//! Compact peer record codec (§4.4, §6).
//!
//! The original C took `(endpoint*)peers + i` and dereferenced a possibly
//! misaligned pointer into the KRPC response buffer — unsound on
//! strict-alignment targets (§9's "Redesign Flags"). Every record here is
//! byte-copied out of the wire buffer instead.

use crate::types::Endpoint;

pub const RECORD_LEN: usize = 6;

/// Decodes a `values` list item (BEP-5 compact peer format: 4-byte IPv4 +
/// 2-byte port, network order) without ever casting the buffer to a struct
/// pointer. Returns `None` for a record of the wrong length or whose port
/// decodes to 0 (port 0 is never valid for a reachable peer).
pub fn decode_one(record: &[u8]) -> Option<Endpoint> {
    if record.len() != RECORD_LEN {
        return None;
    }
    let ip = [record[0], record[1], record[2], record[3]];
    let port = u16::from_be_bytes([record[4], record[5]]);
    if port == 0 {
        return None;
    }
    Some(Endpoint { ip, port })
}

/// Decodes every well-formed record from a `values` list, silently
/// dropping malformed entries (Protocol error per §7: dropped, not fatal).
pub fn decode_all<'a, I: IntoIterator<Item = &'a [u8]>>(records: I) -> Vec<Endpoint> {
    records.into_iter().filter_map(decode_one).collect()
}

pub fn encode_one(ep: Endpoint) -> [u8; RECORD_LEN] {
    let mut buf = [0u8; RECORD_LEN];
    buf[..4].copy_from_slice(&ep.ip);
    buf[4..].copy_from_slice(&ep.port.to_be_bytes());
    buf
}

pub const NODE_RECORD_LEN: usize = 26;

/// Compact node info: 20-byte id + 4-byte IPv4 + 2-byte port, used in
/// `find_node`/`get_peers` responses' `nodes` field.
pub fn encode_nodes(nodes: &[([u8; 20], Endpoint)]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(nodes.len() * NODE_RECORD_LEN);
    for (id, ep) in nodes {
        buf.extend_from_slice(id);
        buf.extend_from_slice(&ep.ip);
        buf.extend_from_slice(&ep.port.to_be_bytes());
    }
    buf
}

pub fn decode_nodes(bytes: &[u8]) -> Vec<([u8; 20], Endpoint)> {
    bytes
        .chunks_exact(NODE_RECORD_LEN)
        .filter_map(|chunk| {
            let mut id = [0u8; 20];
            id.copy_from_slice(&chunk[..20]);
            let ep = decode_one(&chunk[20..26])?;
            Some((id, ep))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_valid_record() {
        let ep = Endpoint::new([203, 0, 113, 5], 51413);
        let encoded = encode_one(ep);
        assert_eq!(decode_one(&encoded), Some(ep));
    }

    #[test]
    fn zero_ip_with_nonzero_port_still_decodes_here() {
        // Rejecting the all-zero endpoint is the *rendezvous controller's*
        // job (§4.4's add-injector invariant), not the wire decoder's: the
        // decoder only rejects structurally invalid records.
        let record = [0, 0, 0, 0, 0, 80];
        assert_eq!(decode_one(&record), Some(Endpoint::new([0, 0, 0, 0], 80)));
    }

    #[test]
    fn rejects_wrong_length_and_zero_port() {
        assert_eq!(decode_one(&[1, 2, 3, 4, 5]), None);
        assert_eq!(decode_one(&[1, 2, 3, 4, 0, 0]), None);
    }

    #[test]
    fn node_records_round_trip() {
        let nodes = vec![([7u8; 20], Endpoint::new([1, 2, 3, 4], 6881)), ([9u8; 20], Endpoint::new([5, 6, 7, 8], 51413))];
        let encoded = encode_nodes(&nodes);
        assert_eq!(decode_nodes(&encoded), nodes);
    }

    #[test]
    fn decode_all_skips_malformed_and_keeps_well_formed() {
        let good = encode_one(Endpoint::new([10, 0, 0, 1], 7000));
        let records: Vec<&[u8]> = vec![&good, &[0u8; 3]];
        let decoded = decode_all(records);
        assert_eq!(decoded, vec![Endpoint::new([10, 0, 0, 1], 7000)]);
    }
}
