//! Bead Population Store.
//!
//! A population file holds the coordinate tensor (n_bead, n_struct, 3)
//! together with radii, the genome index, a violation score and JSON
//! summary/config blobs. Coordinates are stored as a raw little-endian f64
//! block in one of two layouts:
//!
//! - *bead-major* - a bead's slice across all structures is contiguous;
//!   this is the committed layout, equivalent to chunks of
//!   (pack_beads, n_struct, 3).
//! - *structure-major* - a structure's slice is contiguous; used for the
//!   temporary file assembled during the modeling reduce, where workers land
//!   one structure at a time.
//!
//! Commits are atomic: the reduce assembles a private temporary, repacks it
//! into bead-major order and renames it over the live file.

mod population;

pub use population::{Layout, PopulationFile, PACK_SIZE};

use std::path::Path;

use chromoplex_common::Result;

/// Atomically replace `live` with `tmp` (rename-over on the same filesystem).
pub fn publish_over(tmp: &Path, live: &Path) -> Result<()> {
    std::fs::rename(tmp, live)?;
    Ok(())
}

/// Keep a copy of a published population under an audit name.
pub fn archive_copy(live: &Path, archive: &Path) -> Result<()> {
    std::fs::copy(live, archive)?;
    Ok(())
}
