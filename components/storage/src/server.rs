use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use opendal::Operator;
use sha2::{Digest, Sha256};
use snafu::ResultExt;
use tansu_types::{
    block::{Block, BlockId, BlockPointer, RefNonce},
    KeyMeta,
};
use tracing::debug;

use crate::err::{
    BlockNotFoundSnafu, EncodeBlockSnafu, OpenDalSnafu, RefNotFoundSnafu, Result,
    ServerPermanentSnafu, ServerTemporarySnafu,
};

/// A block's bytes after codec and crypto, ready for upload.
#[derive(Debug, Clone)]
pub struct ReadyBlockData {
    pub buf: Bytes,
}

impl ReadyBlockData {
    pub fn encoded_size(&self) -> usize {
        self.buf.len()
    }
}

/// The narrow transport interface the core consumes. `get` fetches and
/// decodes one block; `ready` encodes a block and derives its permanent
/// content id; `put`/`archive`/`delete` manage server-side references.
#[async_trait]
pub trait BlockOps: Send + Sync {
    async fn get(&self, kmd: &KeyMeta, ptr: BlockPointer) -> Result<Block>;

    async fn ready(&self, kmd: &KeyMeta, block: &Block)
        -> Result<(BlockId, usize, ReadyBlockData)>;

    async fn put(&self, kmd: &KeyMeta, ptr: BlockPointer, data: &ReadyBlockData) -> Result<()>;

    async fn archive(&self, kmd: &KeyMeta, ptrs: &[BlockPointer]) -> Result<()>;

    /// Removes the given references. Returns, per block id touched, how
    /// many live references remain.
    async fn delete(&self, kmd: &KeyMeta, ptrs: &[BlockPointer])
        -> Result<HashMap<BlockId, usize>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RefStatus {
    Live,
    Archived,
}

/// How an injected put failure should present itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutFailure {
    Temporary,
    Permanent,
}

/// In-memory block server. Bytes live in an object-storage operator
/// keyed by block id; reference status is tracked per (id, nonce). An
/// object is removed once its last reference is deleted.
pub struct BlockServer {
    storage: Operator,
    refs: DashMap<BlockId, HashMap<RefNonce, RefStatus>>,
    fail_puts: Mutex<HashMap<BlockPointer, PutFailure>>,
    fail_next_puts: Mutex<Option<(u32, PutFailure)>>,
}

fn block_key(id: BlockId) -> String {
    let mut key = String::with_capacity(7 + 64);
    key.push_str("blocks/");
    for b in id.0 {
        key.push_str(&format!("{:02x}", b));
    }
    key
}

impl BlockServer {
    pub fn new_in_memory() -> Arc<Self> {
        let builder = opendal::services::Memory::default();
        let op = Operator::new(builder)
            .expect("memory operator cannot fail to build")
            .finish();
        Self::with_operator(op)
    }

    pub fn with_operator(storage: Operator) -> Arc<Self> {
        Arc::new(Self {
            storage,
            refs: DashMap::new(),
            fail_puts: Mutex::new(HashMap::new()),
            fail_next_puts: Mutex::new(None),
        })
    }

    /// Make the next put of `ptr` fail. Used to exercise the sync
    /// rollback paths.
    pub fn fail_next_put(&self, ptr: BlockPointer, failure: PutFailure) {
        self.fail_puts.lock().unwrap().insert(ptr, failure);
    }

    /// Make the next `count` puts fail, whatever their pointers.
    pub fn fail_next_puts(&self, count: u32, failure: PutFailure) {
        *self.fail_next_puts.lock().unwrap() = Some((count, failure));
    }

    /// How many references (live or archived) a block currently has.
    pub fn ref_count(&self, id: BlockId) -> usize {
        self.refs.get(&id).map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_archived(&self, ptr: BlockPointer) -> bool {
        self.refs
            .get(&ptr.id)
            .and_then(|e| e.get(&ptr.ref_nonce).copied())
            == Some(RefStatus::Archived)
    }
}

#[async_trait]
impl BlockOps for BlockServer {
    async fn get(&self, _kmd: &KeyMeta, ptr: BlockPointer) -> Result<Block> {
        if self.refs.get(&ptr.id).is_none() {
            return BlockNotFoundSnafu { ptr }.fail();
        }
        let buf = self
            .storage
            .read(&block_key(ptr.id))
            .await
            .context(OpenDalSnafu)?;
        bincode::deserialize(&buf).context(crate::err::DecodeBlockSnafu)
    }

    async fn ready(
        &self,
        _kmd: &KeyMeta,
        block: &Block,
    ) -> Result<(BlockId, usize, ReadyBlockData)> {
        let buf = bincode::serialize(block).context(EncodeBlockSnafu)?;
        let digest = Sha256::digest(&buf);
        let mut id = [0u8; 32];
        id.copy_from_slice(&digest);
        Ok((
            BlockId(id),
            block.plain_size(),
            ReadyBlockData {
                buf: Bytes::from(buf),
            },
        ))
    }

    async fn put(&self, _kmd: &KeyMeta, ptr: BlockPointer, data: &ReadyBlockData) -> Result<()> {
        let injected = self.fail_puts.lock().unwrap().remove(&ptr).or_else(|| {
            let mut counted = self.fail_next_puts.lock().unwrap();
            match counted.take() {
                Some((count, failure)) if count > 0 => {
                    if count > 1 {
                        *counted = Some((count - 1, failure));
                    }
                    Some(failure)
                }
                other => {
                    *counted = other;
                    None
                }
            }
        });
        if let Some(failure) = injected {
            return match failure {
                PutFailure::Temporary => ServerTemporarySnafu {
                    message: "put throttled, try again",
                }
                .fail(),
                PutFailure::Permanent => ServerPermanentSnafu {
                    message: "quota exceeded",
                }
                .fail(),
            };
        }
        self.storage
            .write(&block_key(ptr.id), data.buf.clone())
            .await
            .context(OpenDalSnafu)?;
        self.refs
            .entry(ptr.id)
            .or_default()
            .insert(ptr.ref_nonce, RefStatus::Live);
        debug!(id = %ptr.id, size = data.buf.len(), "put block");
        Ok(())
    }

    async fn archive(&self, _kmd: &KeyMeta, ptrs: &[BlockPointer]) -> Result<()> {
        for ptr in ptrs {
            let mut entry = self
                .refs
                .get_mut(&ptr.id)
                .ok_or_else(|| BlockNotFoundSnafu { ptr: *ptr }.build())?;
            let status = entry.get_mut(&ptr.ref_nonce).ok_or_else(|| {
                RefNotFoundSnafu {
                    block_ref: ptr.block_ref(),
                }
                .build()
            })?;
            *status = RefStatus::Archived;
        }
        Ok(())
    }

    async fn delete(
        &self,
        _kmd: &KeyMeta,
        ptrs: &[BlockPointer],
    ) -> Result<HashMap<BlockId, usize>> {
        let mut live_counts = HashMap::new();
        for ptr in ptrs {
            let remaining = match self.refs.get_mut(&ptr.id) {
                Some(mut entry) => {
                    entry.remove(&ptr.ref_nonce);
                    entry.len()
                }
                // Deletes are idempotent; a missing reference already
                // counts as gone.
                None => 0,
            };
            live_counts.insert(ptr.id, remaining);
            if remaining == 0 {
                self.refs.remove(&ptr.id);
                self.storage
                    .delete(&block_key(ptr.id))
                    .await
                    .context(OpenDalSnafu)?;
            }
        }
        Ok(live_counts)
    }
}

#[cfg(test)]
mod tests {
    use tansu_types::block::{FileBlock, ZERO_REF_NONCE};

    use super::*;

    fn file_block(data: &[u8]) -> Block {
        Block::File(FileBlock {
            is_indirect: false,
            contents: data.to_vec(),
            iptrs: vec![],
        })
    }

    async fn ready_and_put(server: &BlockServer, data: &[u8], nonce: u8) -> BlockPointer {
        let kmd = KeyMeta::default();
        let block = file_block(data);
        let (id, plain, ready) = server.ready(&kmd, &block).await.unwrap();
        assert_eq!(plain, data.len());
        let ptr = BlockPointer {
            id,
            ref_nonce: RefNonce([nonce, 0, 0, 0, 0, 0, 0, 0]),
            ..Default::default()
        };
        server.put(&kmd, ptr, &ready).await.unwrap();
        ptr
    }

    #[tokio::test]
    async fn round_trip() {
        let server = BlockServer::new_in_memory();
        let ptr = ready_and_put(&server, b"hello", 0).await;
        let got = server.get(&KeyMeta::default(), ptr).await.unwrap();
        assert_eq!(got, file_block(b"hello"));
    }

    #[tokio::test]
    async fn content_addressing_is_stable() {
        let server = BlockServer::new_in_memory();
        let kmd = KeyMeta::default();
        let (id1, _, _) = server.ready(&kmd, &file_block(b"same")).await.unwrap();
        let (id2, _, _) = server.ready(&kmd, &file_block(b"same")).await.unwrap();
        let (id3, _, _) = server.ready(&kmd, &file_block(b"other")).await.unwrap();
        assert_eq!(id1, id2);
        assert_ne!(id1, id3);
    }

    #[tokio::test]
    async fn delete_counts_live_refs() {
        let server = BlockServer::new_in_memory();
        let kmd = KeyMeta::default();
        let a = ready_and_put(&server, b"shared", 1).await;
        let b = BlockPointer {
            ref_nonce: RefNonce([2, 0, 0, 0, 0, 0, 0, 0]),
            ..a
        };
        let (_, _, ready) = server.ready(&kmd, &file_block(b"shared")).await.unwrap();
        server.put(&kmd, b, &ready).await.unwrap();
        assert_eq!(server.ref_count(a.id), 2);

        let counts = server.delete(&kmd, &[a]).await.unwrap();
        assert_eq!(counts[&a.id], 1);
        assert!(server.get(&kmd, b).await.is_ok());

        let counts = server.delete(&kmd, &[b]).await.unwrap();
        assert_eq!(counts[&b.id], 0);
        assert!(server.get(&kmd, b).await.is_err());
    }

    #[tokio::test]
    async fn archive_flips_status() {
        let server = BlockServer::new_in_memory();
        let ptr = ready_and_put(&server, b"old", 0).await;
        assert!(!server.is_archived(ptr));
        server.archive(&KeyMeta::default(), &[ptr]).await.unwrap();
        assert!(server.is_archived(ptr));
        // Archiving an unknown reference is an error.
        let missing = BlockPointer {
            ref_nonce: RefNonce([9, 0, 0, 0, 0, 0, 0, 0]),
            ..ptr
        };
        assert!(server
            .archive(&KeyMeta::default(), &[missing])
            .await
            .is_err());
    }

    #[tokio::test]
    async fn injected_put_failures() {
        let server = BlockServer::new_in_memory();
        let kmd = KeyMeta::default();
        let block = file_block(b"flaky");
        let (id, _, ready) = server.ready(&kmd, &block).await.unwrap();
        let ptr = BlockPointer {
            id,
            ref_nonce: ZERO_REF_NONCE,
            ..Default::default()
        };

        server.fail_next_put(ptr, PutFailure::Temporary);
        let err = server.put(&kmd, ptr, &ready).await.unwrap_err();
        assert!(err.is_recoverable());

        // The hook fires once; the retry lands.
        server.put(&kmd, ptr, &ready).await.unwrap();
    }
}
