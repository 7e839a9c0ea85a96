use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::{
    block::{BlockPointer, BlockRef},
    BranchId, TlfId,
};

/// The folder-and-branch a path is resolved against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct FolderBranch {
    pub tlf: TlfId,
    pub branch: BranchId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathNode {
    pub ptr: BlockPointer,
    pub name: String,
}

/// An ordered walk from the folder root to a target block. The tail
/// node identifies the target.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Path {
    pub folder: FolderBranch,
    pub nodes: Vec<PathNode>,
}

impl Path {
    pub fn is_valid(&self) -> bool {
        !self.nodes.is_empty() && self.nodes.iter().all(|n| n.ptr.is_valid())
    }

    pub fn has_valid_parent(&self) -> bool {
        self.nodes.len() >= 2 && self.parent_path().is_valid()
    }

    pub fn tail_pointer(&self) -> BlockPointer {
        self.nodes.last().map(|n| n.ptr).unwrap_or_default()
    }

    pub fn tail_name(&self) -> &str {
        self.nodes.last().map(|n| n.name.as_str()).unwrap_or("")
    }

    pub fn tail_ref(&self) -> BlockRef {
        self.tail_pointer().block_ref()
    }

    pub fn parent_path(&self) -> Path {
        let mut p = self.clone();
        p.nodes.pop();
        p
    }

    pub fn child_path(&self, name: &str, ptr: BlockPointer) -> Path {
        let mut p = self.clone();
        p.nodes.push(PathNode {
            ptr,
            name: name.to_string(),
        });
        p
    }

    /// The same walk with a different tail pointer, as produced by a
    /// completed sync.
    pub fn with_tail_pointer(&self, ptr: BlockPointer) -> Path {
        let mut p = self.clone();
        if let Some(last) = p.nodes.last_mut() {
            last.ptr = ptr;
        }
        p
    }
}

impl Display for Path {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for (i, n) in self.nodes.iter().enumerate() {
            if i > 0 {
                write!(f, "/")?;
            }
            write!(f, "{}", n.name)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockId;

    fn ptr(b: u8) -> BlockPointer {
        let mut id = [0u8; 32];
        id[0] = b;
        BlockPointer {
            id: BlockId(id),
            ..Default::default()
        }
    }

    #[test]
    fn validity() {
        let empty = Path::default();
        assert!(!empty.is_valid());
        assert!(!empty.has_valid_parent());

        let root = empty.child_path("tlf", ptr(1));
        assert!(root.is_valid());
        assert!(!root.has_valid_parent());

        let file = root.child_path("f", ptr(2));
        assert!(file.is_valid());
        assert!(file.has_valid_parent());
        assert_eq!(file.tail_name(), "f");
        assert_eq!(file.parent_path(), root);
    }

    #[test]
    fn retarget_tail() {
        let p = Path::default()
            .child_path("tlf", ptr(1))
            .child_path("f", ptr(2));
        let q = p.with_tail_pointer(ptr(9));
        assert_eq!(q.tail_pointer(), ptr(9));
        assert_eq!(q.parent_path(), p.parent_path());
    }
}
