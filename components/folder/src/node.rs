use std::sync::Arc;

use dashmap::DashMap;
use tansu_types::{
    block::{BlockPointer, BlockRef},
    path::{FolderBranch, Path, PathNode},
};

/// A name the embedding application holds on to. Nodes form a tree
/// through parent references; the folder core never keeps strong
/// references back into the tree.
#[derive(Debug)]
pub struct Node {
    pub ptr: BlockPointer,
    pub name: String,
    pub parent: Option<Arc<Node>>,
}

/// The narrow node-cache surface the core consumes.
pub trait NodeCache: Send + Sync {
    fn get(&self, r: BlockRef) -> Option<Arc<Node>>;

    fn get_or_create(
        &self,
        ptr: BlockPointer,
        name: &str,
        parent: Option<Arc<Node>>,
    ) -> Arc<Node>;

    /// The walk from the folder root down to this node.
    fn path_from_node(&self, node: &Node) -> Path;
}

/// Straightforward map-backed node cache.
pub struct SimpleNodeCache {
    folder: FolderBranch,
    nodes: DashMap<BlockRef, Arc<Node>>,
}

impl SimpleNodeCache {
    pub fn new(folder: FolderBranch) -> Arc<Self> {
        Arc::new(Self {
            folder,
            nodes: DashMap::new(),
        })
    }
}

impl NodeCache for SimpleNodeCache {
    fn get(&self, r: BlockRef) -> Option<Arc<Node>> {
        self.nodes.get(&r).map(|n| n.clone())
    }

    fn get_or_create(
        &self,
        ptr: BlockPointer,
        name: &str,
        parent: Option<Arc<Node>>,
    ) -> Arc<Node> {
        self.nodes
            .entry(ptr.block_ref())
            .or_insert_with(|| {
                Arc::new(Node {
                    ptr,
                    name: name.to_string(),
                    parent,
                })
            })
            .clone()
    }

    fn path_from_node(&self, node: &Node) -> Path {
        let mut nodes = vec![PathNode {
            ptr: node.ptr,
            name: node.name.clone(),
        }];
        let mut parent = node.parent.clone();
        while let Some(n) = parent {
            nodes.push(PathNode {
                ptr: n.ptr,
                name: n.name.clone(),
            });
            parent = n.parent.clone();
        }
        nodes.reverse();
        Path {
            folder: self.folder,
            nodes,
        }
    }
}
