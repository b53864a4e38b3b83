//! Bundle container format (version 2).
//!
//! A bundle is a GNU tar whose first entries are small and fixed, followed by
//! pre-built overlay archives stored verbatim:
//!
//! ```text
//! output.tar
//!  |- version            "2"
//!  |- metadata.tar.gz    overlays.json + caller supplied metadata files
//!  |- pad                zero bytes, ends exactly at METADATA_REGION_SIZE
//!  |- dependencies.tar.gz
//!  |- workspace.tar.gz
//! ```
//!
//! `overlays.json` records the absolute offset, size and SHA-256 of every
//! overlay, so a consumer can read the first 4 MiB, then seek straight to the
//! overlay it needs.

mod reader;
mod writer;

pub use reader::BundleReader;
pub use writer::{check_metadata_size, BundleWriter};

use serde::{Deserialize, Serialize};

/// Byte offset at which the first overlay entry header starts.
pub const METADATA_REGION_SIZE: u64 = 4 * 1024 * 1024;

/// Container format written by [`BundleWriter`].
pub const BUNDLE_FORMAT_VERSION: u32 = 2;

/// Tar block size; headers and padded content are multiples of this.
pub const TAR_BLOCK_SIZE: u64 = 512;

pub const VERSION_ENTRY: &str = "version";
pub const METADATA_ENTRY: &str = "metadata.tar.gz";
pub const PAD_ENTRY: &str = "pad";
pub const OVERLAY_INDEX_FILE: &str = "overlays.json";

/// Location and checksum of one overlay inside a bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlayRecord {
    pub name: String,
    pub sha256: String,
    /// Absolute position of the first content byte.
    pub offset: u64,
    pub size: u64,
}

/// Contents of `overlays.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlayIndex {
    pub overlays: Vec<OverlayRecord>,
}

impl OverlayIndex {
    pub fn get(&self, name: &str) -> Option<&OverlayRecord> {
        self.overlays.iter().find(|o| o.name == name)
    }
}

/// What the offset planner needs to know about an overlay.
#[derive(Debug, Clone)]
pub struct OverlaySource {
    pub name: String,
    pub size: u64,
    pub sha256: String,
}

/// Size of the header block(s) the tar writer emits for an entry named
/// `name`. Names longer than the 100 byte GNU name field are preceded by a
/// `././@LongLink` entry holding the NUL-terminated name.
pub fn entry_header_len(name: &str) -> u64 {
    let len = name.len() as u64;
    if len <= 100 {
        TAR_BLOCK_SIZE
    } else {
        TAR_BLOCK_SIZE + padded_len(len + 1) + TAR_BLOCK_SIZE
    }
}

/// `size` rounded up to a whole number of tar blocks.
pub fn padded_len(size: u64) -> u64 {
    size.div_ceil(TAR_BLOCK_SIZE) * TAR_BLOCK_SIZE
}

/// Compute index records for overlays appended in order after the metadata
/// region.
pub fn plan_overlay_records(overlays: &[OverlaySource]) -> Vec<OverlayRecord> {
    let mut running = METADATA_REGION_SIZE;
    let mut records = Vec::with_capacity(overlays.len());
    for overlay in overlays {
        let offset = running + entry_header_len(&overlay.name);
        records.push(OverlayRecord {
            name: overlay.name.clone(),
            sha256: overlay.sha256.clone(),
            offset,
            size: overlay.size,
        });
        running = offset + padded_len(overlay.size);
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(name: &str, size: u64) -> OverlaySource {
        OverlaySource {
            name: name.to_string(),
            size,
            sha256: "0".repeat(64),
        }
    }

    #[test]
    fn first_overlay_follows_region_and_one_header() {
        let records = plan_overlay_records(&[source("dependencies.tar.gz", 10)]);
        assert_eq!(records[0].offset, METADATA_REGION_SIZE + 512);
        assert_eq!(records[0].size, 10);
    }

    #[test]
    fn offsets_advance_by_padded_content() {
        let records = plan_overlay_records(&[
            source("dependencies.tar.gz", 513),
            source("workspace.tar.gz", 0),
            source("extra.tar.gz", 5),
        ]);
        assert_eq!(records[0].offset, METADATA_REGION_SIZE + 512);
        // 513 bytes occupy two blocks, then the next header.
        assert_eq!(records[1].offset, records[0].offset + 1024 + 512);
        // Empty overlay has no content blocks.
        assert_eq!(records[2].offset, records[1].offset + 512);
        for pair in records.windows(2) {
            assert!(pair[0].offset + pair[0].size <= pair[1].offset);
        }
    }

    #[test]
    fn long_names_account_for_longlink_entry() {
        let name = format!("{}.tar.gz", "d".repeat(150));
        assert_eq!(entry_header_len(&name), 512 + 512 + 512);
        assert_eq!(entry_header_len(&"x".repeat(100)), 512);
        assert_eq!(entry_header_len(&"x".repeat(101)), 512 + 512 + 512);
        assert_eq!(entry_header_len(&"x".repeat(600)), 512 + 1024 + 512);
    }

    #[test]
    fn padded_len_rounds_up() {
        assert_eq!(padded_len(0), 0);
        assert_eq!(padded_len(1), 512);
        assert_eq!(padded_len(512), 512);
        assert_eq!(padded_len(513), 1024);
    }
}
