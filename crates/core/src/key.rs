//! Lookup-key parsing and routing classification.

use std::fmt;
use std::str::FromStr;

use cid::Cid;
use multihash::Multihash;

use crate::{Error, Result};

/// Multihash code marking a double-hashed ("encrypted") lookup key.
pub const DBL_SHA2_256: u64 = 0x56;

/// A lookup key decoded from a request path.
///
/// Wraps a multihash and exposes the routing class derived from its code:
/// `DBL_SHA2_256` keys are only ever answered by double-hashed backends,
/// every other code by regular backends.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ContentKey(Multihash<64>);

impl ContentKey {
    /// Wrap a decoded multihash, rejecting empty digests.
    pub fn from_multihash(mh: Multihash<64>) -> Result<Self> {
        if mh.digest().is_empty() {
            return Err(Error::InvalidMultihash("empty digest".to_string()));
        }
        Ok(Self(mh))
    }

    /// Parse a base58btc multihash, as carried by `/multihash/{mh}` paths.
    pub fn parse_b58(s: &str) -> Result<Self> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|e| Error::InvalidMultihash(e.to_string()))?;
        let mh =
            Multihash::from_bytes(&bytes).map_err(|e| Error::InvalidMultihash(e.to_string()))?;
        Self::from_multihash(mh)
    }

    /// Parse a CID, as carried by `/cid/{cid}` paths, keeping its multihash.
    pub fn parse_cid(s: &str) -> Result<Self> {
        let c = Cid::from_str(s).map_err(|e| Error::InvalidCid(e.to_string()))?;
        Self::from_multihash(*c.hash())
    }

    /// The multihash function code.
    pub fn code(&self) -> u64 {
        self.0.code()
    }

    /// Whether this key routes to double-hashed backends.
    pub fn is_double_hashed(&self) -> bool {
        self.0.code() == DBL_SHA2_256
    }

    /// Raw multihash bytes (code + length + digest).
    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.to_bytes()
    }

    pub fn multihash(&self) -> &Multihash<64> {
        &self.0
    }
}

impl fmt::Display for ContentKey {
    /// Base58btc rendering, the same form accepted by [`ContentKey::parse_b58`].
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&bs58::encode(self.0.to_bytes()).into_string())
    }
}

impl fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentKey({self})")
    }
}
