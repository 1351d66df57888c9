//! Core domain types and shared logic for the polestar gateway.
//!
//! This crate defines the canonical data model used by the server crate:
//! - Lookup keys (multihash / CID) and their routing class
//! - The find-response wire model shared with indexer backends
//! - The transport-metadata codec carried in provider results
//! - Runtime configuration loaded from the environment

pub mod config;
pub mod error;
pub mod key;
pub mod model;
pub mod transport;

pub use config::{AppConfig, CircuitConfig, ServerConfig, load_backend_urls};
pub use error::{Error, Result};
pub use key::{ContentKey, DBL_SHA2_256};
pub use model::{
    AddrInfo, EncryptedMultihashResult, FindRecord, FindResponse, MultihashResult, ProviderInfo,
    ProviderResult,
};
