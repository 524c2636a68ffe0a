//! Conversation keys
//!
//! A [`ConversationKey`] scopes one logical conversation: its sandbox, the
//! capability calls issued from that sandbox and the retry budget of the
//! self-correction loop. The key is opaque; nothing here interprets it beyond
//! mapping it onto a filesystem-safe directory name.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Longest key (in bytes) spelled out in full in a directory name
const MAX_SPELLED_BYTES: usize = 64;

/// Opaque identifier of one ongoing conversation
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationKey(String);

impl ConversationKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Directory name for this key, at most 131 bytes
    ///
    /// - `k-<key>`: keys of at most 64 bytes made only of `[A-Za-z0-9_-]`
    /// - `h-<hex bytes>`: other keys of at most 64 bytes
    /// - `d-<hex of the first 32 bytes>-<sha256>`: longer keys
    ///
    /// The first two forms are injective, the third as collision resistant
    /// as SHA-256.
    pub fn dir_name(&self) -> String {
        let bytes = self.0.as_bytes();
        if bytes.len() > MAX_SPELLED_BYTES {
            return format!(
                "d-{}-{}",
                hex::encode(&bytes[..MAX_SPELLED_BYTES / 2]),
                hex::encode(Sha256::digest(bytes))
            );
        }
        let safe = !bytes.is_empty()
            && self
                .0
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if safe {
            format!("k-{}", self.0)
        } else {
            format!("h-{}", hex::encode(bytes))
        }
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConversationKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ConversationKey {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}
