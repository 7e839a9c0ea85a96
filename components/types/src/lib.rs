use std::{
    fmt::{Display, Formatter},
    ops::{Add, Sub},
};

use serde::{Deserialize, Serialize};
use tansu_common::KeyGen;

pub mod block;
pub mod entry;
pub mod path;

/// The identity of one top-level folder, the unit of isolation for
/// keys, writers and metadata history.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct TlfId(pub [u8; 16]);

impl Display for TlfId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for b in &self.0[..4] {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct BranchId(pub [u8; 16]);

/// The branch all merged writes land on.
pub const MASTER_BRANCH: BranchId = BranchId([0u8; 16]);

impl BranchId {
    pub fn is_master(&self) -> bool {
        *self == MASTER_BRANCH
    }
}

impl Display for BranchId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_master() {
            return write!(f, "master");
        }
        for b in &self.0[..4] {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct UserId(pub u64);

impl Display for UserId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "u{}", self.0)
    }
}

/// One revision in a folder's metadata history.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct MetadataRevision(pub i64);

impl MetadataRevision {
    pub const UNINITIALIZED: MetadataRevision = MetadataRevision(-1);
    pub const INITIAL: MetadataRevision = MetadataRevision(1);

    pub fn is_initialized(self) -> bool {
        self.0 >= Self::INITIAL.0
    }

    pub fn number(self) -> i64 {
        self.0
    }
}

impl Default for MetadataRevision {
    fn default() -> Self {
        Self::UNINITIALIZED
    }
}

impl Display for MetadataRevision {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Add<i64> for MetadataRevision {
    type Output = MetadataRevision;

    fn add(self, rhs: i64) -> MetadataRevision {
        MetadataRevision(self.0 + rhs)
    }
}

impl Sub<i64> for MetadataRevision {
    type Output = MetadataRevision;

    fn sub(self, rhs: i64) -> MetadataRevision {
        MetadataRevision(self.0 - rhs)
    }
}

/// The slice of folder metadata the block layer needs for a fetch or an
/// upload: which folder, under which key generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KeyMeta {
    pub tlf: TlfId,
    pub key_gen: KeyGen,
}
