//! Content-addressed job cache for weft.
//!
//! Jobs are keyed by a [`Fingerprint`] over their command, backend and
//! resolved inputs. The [`CacheStore`] persists committed results on disk and
//! coordinates concurrent jobs with equal fingerprints so only one of them
//! executes.

mod canonical;
mod entry;
mod error;
mod fingerprint;
mod store;

pub use canonical::to_canonical_json;
pub use entry::{CacheEntry, SharedOutcome};
pub use error::CacheError;
pub use fingerprint::{Fingerprint, FingerprintInput, fingerprint, hash_directory, hash_file};
pub use store::{CacheStats, CacheStore, Claim, InflightGuard, InflightWaiter, PublishedBlob};
