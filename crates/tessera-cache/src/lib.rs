//! Fixture cache for Tessera workflows.
//!
//! Cache steps restore a dataset archive by literal key, falling back to the
//! newest entry matching a restore-key prefix. A miss is never an error: the
//! workflow is expected to fetch the data itself and the archive is saved
//! once the job succeeds.
//!
//! # Integrity
//!
//! Every archive is hashed with BLAKE3 when written and verified before it is
//! unpacked. An entry whose archive vanished or no longer matches its digest
//! is reported as a miss, so an unchanged key either restores identical bytes
//! or nothing at all.
//!
//! # Tiger Style
//!
//! - Max key length: 512 bytes
//! - Max metadata size: 64 KB
//! - Max paths per entry: 64

pub mod entry;
pub mod error;
pub mod store;

pub use entry::CacheEntry;
pub use entry::KeyMatch;
pub use entry::MAX_KEY_LENGTH;
pub use entry::RestoreOutcome;
pub use entry::key_digest;
pub use entry::select_entry;
pub use error::CacheError;
pub use error::Result;
pub use store::CacheStore;
pub use store::FsCacheStore;
