use snafu::{Location, Snafu};
use tansu_types::{
    block::{BlockInfo, BlockPointer, BlockRef},
    UserId,
};

#[derive(Snafu, Debug)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("invalid path"))]
    InvalidPath {
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("path has no valid parent"))]
    InvalidParent {
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("no entry named {name}"))]
    NoSuchName {
        name: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("block {ptr} is not a file block"))]
    NotFileBlock {
        ptr: BlockPointer,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("block {ptr} is not a directory block"))]
    NotDirBlock {
        ptr: BlockPointer,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("file would grow to {size} bytes, past the limit of {limit}"))]
    FileTooBig {
        size: u64,
        limit: u64,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("{user} is not a writer of this folder"))]
    WriteAccess {
        user: UserId,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("dirty block {ptr} still carries encoded size {size}", ptr = info.ptr, size = info.encoded_size))]
    InconsistentEncodedSize {
        info: BlockInfo,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("no sync state found for file ref {file_ref:?}"))]
    NoSyncInfo {
        file_ref: BlockRef,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("read landed in a hole with nothing to fill it"))]
    BadSplit {
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("read deadline expired before any data arrived"))]
    Timeout {
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("a concurrent sync of this file failed: {message}"))]
    DeferredSyncFailed {
        message: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("block fetch failed: {message}"))]
    BlockFetch {
        message: String,
        recoverable: bool,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("quota reclamation could not take the truncate lock"))]
    TruncateLockHeld {
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("quota reclamation is only run on merged heads"))]
    UnmergedHead {
        #[snafu(implicit)]
        location: Location,
    },

    StorageError {
        source: tansu_storage::Error,
    },

    MetaError {
        source: tansu_meta::Error,
    },
}

impl Error {
    /// True when a retried sync is expected to clear this failure; the
    /// rollback path runs instead of surfacing to error listeners.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::StorageError { source } => source.is_recoverable(),
            Error::BlockFetch { recoverable, .. } => *recoverable,
            _ => false,
        }
    }
}

pub fn is_recoverable_block_error(err: &Error) -> bool {
    err.is_recoverable()
}

impl From<tansu_storage::Error> for Error {
    fn from(value: tansu_storage::Error) -> Self {
        Self::StorageError { source: value }
    }
}

impl From<tansu_meta::Error> for Error {
    fn from(value: tansu_meta::Error) -> Self {
        Self::MetaError { source: value }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
