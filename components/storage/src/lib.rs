pub mod block_cache;
pub mod crypto;
pub mod dirty_cache;
pub mod dirty_file;
pub mod err;
pub mod retrieval;
pub mod server;
pub mod splitter;

pub use err::{Error, Result};
