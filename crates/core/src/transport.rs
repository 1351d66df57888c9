//! Transport-metadata codec.
//!
//! Provider metadata is a sequence of `(varint code, varint length,
//! payload)` segments, sorted by code, where the leading varint names the
//! primary transport a provider serves content over.

use unsigned_varint::{decode, encode};

use crate::{Error, Result};

/// Bitswap transport multicodec.
pub const TRANSPORT_BITSWAP: u64 = 0x0900;
/// Graphsync/Filecoin-v1 transport multicodec.
pub const TRANSPORT_GRAPHSYNC_FILECOINV1: u64 = 0x0910;
/// Trustless IPFS-gateway HTTP transport multicodec.
pub const TRANSPORT_IPFS_GATEWAY_HTTP: u64 = 0x0920;

/// One decoded transport segment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportEntry {
    pub code: u64,
    pub payload: Vec<u8>,
}

impl TransportEntry {
    /// Re-encode this segment as it appears on the wire.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.payload.len() + 10);
        let mut buf = encode::u64_buffer();
        out.extend_from_slice(encode::u64(self.code, &mut buf));
        out.extend_from_slice(encode::u64(self.payload.len() as u64, &mut buf));
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn protocol_name(&self) -> &'static str {
        protocol_name(self.code)
    }
}

/// Human-readable multicodec name used in delegated-routing responses
/// and transport metrics.
pub fn protocol_name(code: u64) -> &'static str {
    match code {
        TRANSPORT_BITSWAP => "transport-bitswap",
        TRANSPORT_GRAPHSYNC_FILECOINV1 => "transport-graphsync-filecoinv1",
        TRANSPORT_IPFS_GATEWAY_HTTP => "transport-ipfs-gateway-http",
        _ => "unknown",
    }
}

/// Decode a full metadata blob into its transport segments.
pub fn decode_metadata(mut bytes: &[u8]) -> Result<Vec<TransportEntry>> {
    if bytes.is_empty() {
        return Err(Error::InvalidMetadata("empty metadata".to_string()));
    }
    let mut entries = Vec::new();
    while !bytes.is_empty() {
        let (code, rest) =
            decode::u64(bytes).map_err(|e| Error::InvalidMetadata(e.to_string()))?;
        let (len, rest) = decode::u64(rest).map_err(|e| Error::InvalidMetadata(e.to_string()))?;
        let len = len as usize;
        if rest.len() < len {
            return Err(Error::InvalidMetadata(format!(
                "truncated payload for transport {code:#x}"
            )));
        }
        entries.push(TransportEntry {
            code,
            payload: rest[..len].to_vec(),
        });
        bytes = &rest[len..];
    }
    Ok(entries)
}

/// The leading varint of a metadata blob, when decodable.
pub fn primary_transport(bytes: &[u8]) -> Option<u64> {
    decode::u64(bytes).map(|(code, _)| code).ok()
}

/// Whether metadata starts with the Bitswap transport varint.
///
/// Prefix match rather than whole-value equality: transports are sorted
/// and length-prefixed, so a Bitswap-capable provider always leads with
/// this varint even when further transports follow.
pub fn starts_with_bitswap(bytes: &[u8]) -> bool {
    let mut buf = encode::u64_buffer();
    bytes.starts_with(encode::u64(TRANSPORT_BITSWAP, &mut buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_all(entries: &[TransportEntry]) -> Vec<u8> {
        entries.iter().flat_map(TransportEntry::encode).collect()
    }

    #[test]
    fn decodes_multi_transport_metadata() {
        let entries = vec![
            TransportEntry {
                code: TRANSPORT_BITSWAP,
                payload: Vec::new(),
            },
            TransportEntry {
                code: TRANSPORT_GRAPHSYNC_FILECOINV1,
                payload: b"piece".to_vec(),
            },
        ];
        let wire = encode_all(&entries);
        assert_eq!(decode_metadata(&wire).unwrap(), entries);
        assert_eq!(primary_transport(&wire), Some(TRANSPORT_BITSWAP));
    }

    #[test]
    fn bitswap_prefix_matches_with_trailing_transports() {
        let entries = vec![
            TransportEntry {
                code: TRANSPORT_BITSWAP,
                payload: Vec::new(),
            },
            TransportEntry {
                code: TRANSPORT_IPFS_GATEWAY_HTTP,
                payload: b"gw".to_vec(),
            },
        ];
        assert!(starts_with_bitswap(&encode_all(&entries)));

        let graphsync_only = TransportEntry {
            code: TRANSPORT_GRAPHSYNC_FILECOINV1,
            payload: Vec::new(),
        };
        assert!(!starts_with_bitswap(&graphsync_only.encode()));
    }

    #[test]
    fn rejects_truncated_and_empty_metadata() {
        assert!(decode_metadata(&[]).is_err());

        let entry = TransportEntry {
            code: TRANSPORT_GRAPHSYNC_FILECOINV1,
            payload: b"piece".to_vec(),
        };
        let mut wire = entry.encode();
        wire.truncate(wire.len() - 2);
        assert!(decode_metadata(&wire).is_err());
    }

    #[test]
    fn unknown_codes_decode_but_name_as_unknown() {
        let entry = TransportEntry {
            code: 0x3f42,
            payload: Vec::new(),
        };
        let got = decode_metadata(&entry.encode()).unwrap();
        assert_eq!(got[0].protocol_name(), "unknown");
    }
}
