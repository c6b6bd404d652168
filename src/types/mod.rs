#![forbid(unsafe_code)]

//! Shared identifiers and the crate error type.

use std::fmt;

/// Checksum helpers used by the file-backed store.
pub mod checksum;

/// Opaque identifier of a node's durable location inside a [`NodeStorage`].
///
/// [`NodeStorage`]: crate::storage::store::NodeStorage
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct StorageHandle(pub u64);

impl StorageHandle {
    /// Encoded width of a handle in node and journal records.
    pub const ENCODED_LEN: usize = 8;

    /// Appends the big-endian encoding of the handle to `out`.
    pub fn encode(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.0.to_be_bytes());
    }

    /// Decodes a handle from the first eight bytes of `src`.
    pub fn decode(src: &[u8]) -> Result<Self> {
        let bytes: [u8; 8] = src
            .get(..Self::ENCODED_LEN)
            .and_then(|b| b.try_into().ok())
            .ok_or(TreeError::Corruption("storage handle truncated"))?;
        Ok(StorageHandle(u64::from_be_bytes(bytes)))
    }
}

impl fmt::Display for StorageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors raised by the tree, its storage and its journal.
#[derive(thiserror::Error, Debug)]
pub enum TreeError {
    /// Underlying I/O failure.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// Malformed or missing node data, or a broken structural invariant.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Argument rejected by an operation.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Option value rejected at the point of setting.
    #[error("invalid configuration for {field}: {reason}")]
    Configuration {
        /// Name of the offending setting.
        field: &'static str,
        /// Why the value was rejected.
        reason: &'static str,
    },
    /// A tree or node lock could not be acquired within the lock timeout.
    #[error("timed out acquiring {0} lock")]
    LockTimeout(&'static str),
    /// Strict insert of a key that already exists.
    #[error("duplicate key")]
    DuplicateKey,
    /// Strict lookup of a key that does not exist.
    #[error("key not found")]
    KeyNotFound,
    /// Misuse of the node transaction contract.
    #[error("transaction protocol violation: {0}")]
    Protocol(&'static str),
    /// Write attempted against read-only storage.
    #[error("storage is read-only")]
    ReadOnly,
    /// Configuration text could not be decoded.
    #[error("config parse: {0}")]
    ConfigParse(String),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, TreeError>;

impl From<toml::de::Error> for TreeError {
    fn from(err: toml::de::Error) -> Self {
        TreeError::ConfigParse(err.to_string())
    }
}

impl From<toml::ser::Error> for TreeError {
    fn from(err: toml::ser::Error) -> Self {
        TreeError::ConfigParse(err.to_string())
    }
}
