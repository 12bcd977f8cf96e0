//! Conflict descriptions and merge instructions.
//!
//! When two devices change the same key between a common ancestor and their
//! respective heads, the store reports the key as conflicting. The client
//! layer turns each conflicting key into a [`Conflict`], hands it to exactly
//! one registered observer for an in-place decision, and translates the
//! decision into a [`MergedValue`] instruction for the store.

use serde::{Deserialize, Serialize};

/// How the store arbitrates concurrent writes to a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergePolicy {
    /// Nobody is listening for conflicts; the store picks the later write.
    LastOneWins,
    /// Registered clients get a chance to merge; unhandled keys keep the
    /// left (local) value.
    AutomaticWithFallback,
}

/// Decision recorded on a [`Conflict`] by an observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictResolution {
    /// Keep the local value. No merge instruction is submitted; the left
    /// value wins by default.
    Left,
    /// Take the remote value.
    Right,
    /// Replace both with `merged` (or a deletion when `merged_is_deleted`).
    Merge,
}

/// One side of a conflicting key in the store's diff.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSide {
    /// Value this side wrote, absent when the side deleted the key.
    pub value: Option<Vec<u8>>,
    /// Whether this side deleted the key.
    pub deleted: bool,
}

impl DiffSide {
    /// A side that wrote `value`.
    pub fn wrote(value: impl Into<Vec<u8>>) -> Self {
        Self {
            value: Some(value.into()),
            deleted: false,
        }
    }

    /// A side that deleted the key.
    pub fn removed() -> Self {
        Self {
            value: None,
            deleted: true,
        }
    }
}

/// One conflicting key as reported by the store's diff stream.
///
/// Both sides touched the key since the common ancestor and ended up in
/// different states.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffEntry {
    /// The conflicting key.
    pub key: Vec<u8>,
    /// What this device did to the key.
    pub left: DiffSide,
    /// What the other device did to the key.
    pub right: DiffSide,
}

/// A conflicting key presented to an observer for an in-place decision.
///
/// The observer callback must set `resolution` before returning, and
/// `merged`/`merged_is_deleted` when it chooses [`ConflictResolution::Merge`].
/// The struct is consumed right after the callback; it is never retained.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    /// The key both sides changed.
    pub key: Vec<u8>,
    /// Local value, absent when locally deleted.
    pub left: Option<Vec<u8>>,
    /// Whether the local side deleted the key.
    pub left_is_deleted: bool,
    /// Remote value, absent when remotely deleted.
    pub right: Option<Vec<u8>>,
    /// Whether the remote side deleted the key.
    pub right_is_deleted: bool,
    /// The decision; starts as [`ConflictResolution::Left`].
    pub resolution: ConflictResolution,
    /// Merged value when the resolution is `Merge`.
    pub merged: Option<Vec<u8>>,
    /// Whether the merged outcome is a deletion.
    pub merged_is_deleted: bool,
}

impl Conflict {
    /// Build a conflict from a diff entry.
    pub fn from_diff(entry: &DiffEntry) -> Self {
        Self {
            key: entry.key.clone(),
            left: entry.left.value.clone(),
            left_is_deleted: entry.left.deleted,
            right: entry.right.value.clone(),
            right_is_deleted: entry.right.deleted,
            resolution: ConflictResolution::Left,
            merged: None,
            merged_is_deleted: false,
        }
    }

    /// Keep the local value.
    pub fn resolve_left(&mut self) {
        self.resolution = ConflictResolution::Left;
    }

    /// Take the remote value.
    pub fn resolve_right(&mut self) {
        self.resolution = ConflictResolution::Right;
    }

    /// Replace both sides with `value`.
    pub fn resolve_merge(&mut self, value: impl Into<Vec<u8>>) {
        self.resolution = ConflictResolution::Merge;
        self.merged = Some(value.into());
        self.merged_is_deleted = false;
    }

    /// Resolve the conflict by deleting the key.
    pub fn resolve_delete(&mut self) {
        self.resolution = ConflictResolution::Merge;
        self.merged = None;
        self.merged_is_deleted = true;
    }
}

/// Origin of the value a merge instruction installs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueSource {
    /// Take the right-side value; the store already holds the bytes.
    Right,
    /// Install the bytes carried in `new_value`.
    New,
    /// Delete the key.
    Delete,
}

/// One per-key merge instruction submitted back to the store.
///
/// Keys resolved as `Left` produce no instruction at all: the left value
/// wins by default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergedValue {
    /// Key this instruction applies to.
    pub key: Vec<u8>,
    /// Where the resulting value comes from.
    pub source: ValueSource,
    /// Replacement bytes, only for [`ValueSource::New`].
    pub new_value: Option<Vec<u8>>,
}

impl MergedValue {
    /// Instruction taking the right-side value.
    pub fn take_right(key: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            source: ValueSource::Right,
            new_value: None,
        }
    }

    /// Instruction installing freshly merged bytes.
    pub fn new_value(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            source: ValueSource::New,
            new_value: Some(value.into()),
        }
    }

    /// Instruction deleting the key.
    pub fn delete(key: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            source: ValueSource::Delete,
            new_value: None,
        }
    }
}
