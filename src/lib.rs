//! repstore — representation/content engine for a versioning filesystem
//!
//! Core functionality:
//! - Representation records (fulltext or delta chain) persisted in a
//!   transactional key-value store
//! - Random-access reads that transparently reconstruct fulltext from a
//!   delta chain by composing one window per link
//! - Checksumming read/write streams over representations
//! - Deltification (fulltext → delta against a source rep) and
//!   undeltification (delta → fulltext), both in place and content-preserving
//! - Fjall-backed persistent store and an in-memory store for tests

pub mod content;
pub mod delta;
pub mod deltify;
pub mod error;
pub mod fs;
pub mod rep;
pub mod store;
pub mod stream;

pub use error::{FsError, Result};
pub use fs::{Fs, Trail};
pub use rep::{
    digests_match, DeltaChunk, RepContents, RepKey, Representation, StringKey, TxnId, EMPTY_MD5,
    MD5_DIGEST_SIZE, ZERO_MD5,
};
pub use store::{FjallStore, MemStore, Store};
pub use stream::{ReadStream, WriteStream};
