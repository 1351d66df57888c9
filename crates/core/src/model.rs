//! Wire model shared with indexer backends.
//!
//! Byte-valued fields travel as base64 strings in JSON, matching the
//! format spoken by the backends. Peer IDs and multiaddrs are kept as
//! strings; the gateway forwards them without interpreting either.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

/// Serde adapter encoding `Vec<u8>` as standard base64.
pub mod b64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

/// Base64 adapter for `Vec<Vec<u8>>` fields.
pub mod b64_list {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::ser::SerializeSeq;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(items: &[Vec<u8>], ser: S) -> Result<S::Ok, S::Error> {
        let mut seq = ser.serialize_seq(Some(items.len()))?;
        for item in items {
            seq.serialize_element(&STANDARD.encode(item))?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<Vec<u8>>, D::Error> {
        let strings = Vec::<String>::deserialize(de)?;
        strings
            .into_iter()
            .map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom))
            .collect()
    }
}

/// Peer address book entry: a peer ID and its multiaddrs.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddrInfo {
    #[serde(rename = "ID", default)]
    pub id: String,
    #[serde(rename = "Addrs", default)]
    pub addrs: Vec<String>,
}

/// One provider's claim over a multihash.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderResult {
    #[serde(rename = "ContextID", with = "b64", default)]
    pub context_id: Vec<u8>,
    #[serde(rename = "Metadata", with = "b64", default)]
    pub metadata: Vec<u8>,
    #[serde(rename = "Provider", default)]
    pub provider: AddrInfo,
}

impl ProviderResult {
    /// Logical identity for deduplication across backends.
    pub fn same_identity(&self, other: &ProviderResult) -> bool {
        self.context_id == other.context_id && self.provider.id == other.provider.id
    }
}

/// All provider results for one multihash.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MultihashResult {
    #[serde(rename = "Multihash", with = "b64", default)]
    pub multihash: Vec<u8>,
    #[serde(rename = "ProviderResults", default)]
    pub provider_results: Vec<ProviderResult>,
}

/// Encrypted value keys for one double-hashed multihash.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EncryptedMultihashResult {
    #[serde(rename = "Multihash", with = "b64", default)]
    pub multihash: Vec<u8>,
    #[serde(rename = "EncryptedValueKeys", with = "b64_list", default)]
    pub encrypted_value_keys: Vec<Vec<u8>>,
}

/// A backend's (or the merged) answer to a find request.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FindResponse {
    #[serde(
        rename = "MultihashResults",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub multihash_results: Vec<MultihashResult>,
    #[serde(
        rename = "EncryptedMultihashResults",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub encrypted_multihash_results: Vec<EncryptedMultihashResult>,
}

impl FindResponse {
    pub fn is_empty(&self) -> bool {
        self.multihash_results.is_empty() && self.encrypted_multihash_results.is_empty()
    }
}

/// One line of an NDJSON find stream: either a plain provider result or
/// an encrypted value key.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FindRecord {
    #[serde(flatten)]
    pub result: ProviderResult,
    #[serde(
        rename = "EncryptedValueKey",
        with = "b64",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub encrypted_value_key: Vec<u8>,
}

impl FindRecord {
    pub fn is_encrypted(&self) -> bool {
        !self.encrypted_value_key.is_empty()
    }

    /// Bytes hashed into the aggregator's seen-set.
    pub fn dedup_bytes(&self) -> Vec<u8> {
        if self.is_encrypted() {
            return self.encrypted_value_key.clone();
        }
        let pid = self.result.provider.id.as_bytes();
        let mut v = Vec::with_capacity(pid.len() + self.result.context_id.len());
        v.extend_from_slice(pid);
        v.extend_from_slice(&self.result.context_id);
        v
    }
}

/// Provider metadata as returned by providers-only backends.
///
/// Unrecognized fields are preserved verbatim so the gateway does not
/// strip information the backends chose to expose.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ProviderInfo {
    #[serde(rename = "AddrInfo", default)]
    pub addr_info: AddrInfo,
    #[serde(
        rename = "LastAdvertisement",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub last_advertisement: Option<String>,
    #[serde(
        rename = "LastAdvertisementTime",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub last_advertisement_time: Option<String>,
    #[serde(rename = "Publisher", default, skip_serializing_if = "Option::is_none")]
    pub publisher: Option<AddrInfo>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ProviderInfo {
    /// Parse `LastAdvertisementTime` as RFC 3339; unparseable times lose
    /// merge conflicts.
    pub fn last_advertised_at(&self) -> Option<OffsetDateTime> {
        let raw = self.last_advertisement_time.as_deref()?;
        OffsetDateTime::parse(raw, &Rfc3339).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_fields_round_trip_as_base64() {
        let rec = FindRecord {
            result: ProviderResult {
                context_id: b"ctx".to_vec(),
                metadata: vec![0x80, 0x12],
                provider: AddrInfo {
                    id: "12D3KooWPeer".to_string(),
                    addrs: vec!["/ip4/127.0.0.1/tcp/1234".to_string()],
                },
            },
            encrypted_value_key: Vec::new(),
        };
        let line = serde_json::to_string(&rec).unwrap();
        assert!(line.contains("\"ContextID\":\"Y3R4\""));
        let back: FindRecord = serde_json::from_str(&line).unwrap();
        assert_eq!(back.result, rec.result);
    }

    #[test]
    fn encrypted_record_parses_without_provider_fields() {
        let rec: FindRecord = serde_json::from_str(r#"{"EncryptedValueKey":"c2VjcmV0"}"#).unwrap();
        assert!(rec.is_encrypted());
        assert_eq!(rec.encrypted_value_key, b"secret");
        assert_eq!(rec.dedup_bytes(), b"secret");
    }

    #[test]
    fn dedup_bytes_concatenates_provider_and_context() {
        let rec = FindRecord {
            result: ProviderResult {
                context_id: b"ctx".to_vec(),
                provider: AddrInfo {
                    id: "peer".to_string(),
                    ..Default::default()
                },
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(rec.dedup_bytes(), b"peerctx");
    }

    #[test]
    fn provider_info_keeps_unknown_fields() {
        let raw = r#"{"AddrInfo":{"ID":"p1","Addrs":[]},"LastAdvertisementTime":"2023-04-05T06:07:08Z","IndexCount":42}"#;
        let info: ProviderInfo = serde_json::from_str(raw).unwrap();
        assert_eq!(info.addr_info.id, "p1");
        assert_eq!(info.extra.get("IndexCount").unwrap(), 42);
        let out = serde_json::to_string(&info).unwrap();
        assert!(out.contains("IndexCount"));
    }

    #[test]
    fn advertisement_times_order_chronologically() {
        let info = |ts: &str| ProviderInfo {
            last_advertisement_time: Some(ts.to_string()),
            ..Default::default()
        };
        let earlier = info("2023-04-05T06:07:08Z").last_advertised_at().unwrap();
        let later = info("2023-04-05T06:07:09Z").last_advertised_at().unwrap();
        assert!(earlier < later);
        assert!(info("not a time").last_advertised_at().is_none());
        assert!(ProviderInfo::default().last_advertised_at().is_none());
    }
}
