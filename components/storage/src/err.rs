use snafu::{Location, Snafu};
use tansu_types::block::{BlockPointer, BlockRef};

#[derive(Snafu, Debug)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("block {ptr} is not on the server"))]
    BlockNotFound {
        ptr: BlockPointer,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("block {id:?} has no reference {nonce:?}", id = block_ref.id, nonce = block_ref.ref_nonce))]
    RefNotFound {
        block_ref: BlockRef,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("dirty cache is over its byte budget"))]
    CacheFull {
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("temporary block server failure: {message}"))]
    ServerTemporary {
        message: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("permanent block server failure: {message}"))]
    ServerPermanent {
        message: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("object store operation failed"))]
    OpenDal {
        #[snafu(implicit)]
        location: Location,
        #[snafu(source)]
        error: opendal::Error,
    },

    EncodeBlock {
        #[snafu(implicit)]
        location: Location,
        source: bincode::Error,
    },

    DecodeBlock {
        #[snafu(implicit)]
        location: Location,
        source: bincode::Error,
    },

    #[snafu(display("block {ptr} cannot go from {from} to {to}"))]
    InvalidBlockState {
        ptr: BlockPointer,
        from: &'static str,
        to: &'static str,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("{count} block(s) were still mid-upload when the sync finished"))]
    BlocksStillSyncing {
        count: usize,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("retrieval queue is shut down"))]
    QueueShutdown {
        #[snafu(implicit)]
        location: Location,
    },
}

impl Error {
    /// True for failures the caller is expected to retry; these select
    /// the in-place sync rollback instead of surfacing to listeners.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::ServerTemporary { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
