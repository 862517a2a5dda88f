//! # Durable storage
//!
//! The on-disk counterpart to [`crate::queue::memory`]: a length-prefixed,
//! checksummed record format ([`record`]) framed into an append-only,
//! reclaiming segment log ([`segment`]), one directory per expiring
//! subscription set (§4.7).

pub mod record;
pub mod segment;

pub use segment::{EntryId, SegmentLog};

use std::path::{Path, PathBuf};

use crate::uri::encode_location;

/// The directory a subscription set's durable queue lives in, derived from
/// its location the same way [`crate::uri::encode_location`] is used
/// elsewhere to turn a location into a filesystem-safe name.
pub fn queue_dir(root: &Path, location: &str) -> PathBuf {
    root.join(encode_location(location))
}
