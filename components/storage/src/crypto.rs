use rand::RngCore;
use tansu_types::{
    block::{BlockId, RefNonce},
    BranchId, TlfId,
};

/// Identifier-minting primitives the core consumes. Real deployments
/// back this with the folder's key machinery; everything here is
/// random-bytes only.
pub trait Crypto: Send + Sync {
    /// A random id for a block that only ever lives in the dirty cache.
    fn make_temporary_block_id(&self) -> BlockId;

    /// A fresh nonce distinguishing a de-dup'd reference from the
    /// original.
    fn make_block_ref_nonce(&self) -> RefNonce;

    fn make_random_tlf_id(&self) -> TlfId;

    fn make_random_branch_id(&self) -> BranchId;
}

#[derive(Debug, Default)]
pub struct StdCrypto;

impl Crypto for StdCrypto {
    fn make_temporary_block_id(&self) -> BlockId {
        let mut id = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut id);
        BlockId(id)
    }

    fn make_block_ref_nonce(&self) -> RefNonce {
        let mut nonce = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut nonce);
        // The zero nonce is reserved for first references.
        if nonce == [0u8; 8] {
            nonce[0] = 1;
        }
        RefNonce(nonce)
    }

    fn make_random_tlf_id(&self) -> TlfId {
        let mut id = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut id);
        TlfId(id)
    }

    fn make_random_branch_id(&self) -> BranchId {
        let mut id = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut id);
        BranchId(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temporary_ids_are_distinct() {
        let crypto = StdCrypto;
        let a = crypto.make_temporary_block_id();
        let b = crypto.make_temporary_block_id();
        assert_ne!(a, b);
        assert!(a.is_initialized());
    }
}
