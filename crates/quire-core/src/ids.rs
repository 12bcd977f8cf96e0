//! Identifier types used across the quire substrate.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier of one page in the remote store.
///
/// Pages are the unit of sharing and of conflict: two devices that hold the
/// same `PageId` converge on the same key→bytes mapping. Ids are opaque
/// 16-byte values; features typically derive them from stable feature names
/// so every device lands on the same page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PageId(pub Uuid);

impl PageId {
    /// Create a fresh random page id.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a page id from raw bytes.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Get the inner UUID.
    pub fn uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "page-{}", self.0)
    }
}

impl From<Uuid> for PageId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<PageId> for Uuid {
    fn from(id: PageId) -> Self {
        id.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_id_roundtrips_bytes() {
        let id = PageId::from_bytes([7u8; 16]);
        assert_eq!(id, PageId::from_bytes([7u8; 16]));
        assert_ne!(id, PageId::from_bytes([8u8; 16]));
        assert_eq!(*id.uuid().as_bytes(), [7u8; 16]);
    }

    #[test]
    fn page_id_display_is_prefixed() {
        let id = PageId::from_bytes([0u8; 16]);
        assert!(id.to_string().starts_with("page-"));
    }
}
