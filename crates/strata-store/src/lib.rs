//! # strata-store
//!
//! Chunked, content-addressed block storage engine for Strata.
//!
//! Values are split into fixed-size chunks. Each chunk is hashed with BLAKE3
//! and stored once under its hex digest, so identical chunks are shared across
//! every key in the store. A per-key node file lists the chunk hashes in order.
//!
//! ## Directory Layout
//!
//! ```text
//! <root>/
//! ├── .lock                    # held while a store handle is open
//! ├── .compression             # compressor the blocks were written with
//! ├── node/
//! │   └── avatar.png           # hash\nhash\nhash\n
//! └── block/
//!     └── 9f86d081...0f00a08   # one chunk, optionally LZ4-compressed
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use strata_store::{BlockConfig, BlockStorage};
//!
//! let store = BlockStorage::open("/var/lib/strata", BlockConfig::default())?;
//! store.write_bytes("greeting", b"hello")?;
//! assert_eq!(store.read_bytes("greeting")?, b"hello");
//! store.close()?;
//! # Ok::<(), strata_store::StoreError>(())
//! ```

mod block;
pub mod compress;
pub mod config;
mod error;
pub mod hash;
pub mod lock;
pub mod node;
pub mod path;
pub mod pool;

pub use block::{
    BlockReader, BlockStorage, CleanStats, StoreStats, STALE_TEMP_AGE, TEMP_SUFFIX,
};
pub use compress::{Compression, Compressor, FinishWrite, Lz4Compression, NoCompression};
pub use config::{default_thread_count, BlockConfig, DEFAULT_BLOCK_SIZE, DEFAULT_BUF_SIZE};
pub use error::{Result, StoreError};
pub use hash::{is_encoded_hash, ENCODED_HASH_LEN};
pub use node::Node;
pub use path::validate_key;
