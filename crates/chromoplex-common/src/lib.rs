//! Common types shared across Chromoplex crates

pub mod datafile;
pub mod error;
pub mod index;

pub use error::{Error, Result};
pub use index::{Bead, Genome, GenomeIndex};
