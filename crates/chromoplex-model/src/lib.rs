//! Modeling target system: particles plus typed harmonic restraints.
//!
//! This is the mid-layer between the assignment artifacts and the
//! minimization kernel: builders translate data rows into restraints, the
//! kernel pattern-matches the restraint variants to evaluate forces.

pub mod builders;
mod model;
mod particle;
mod restraint;
pub mod voxmap;

pub use model::{Model, ViolationStats, ViolationSummary};
pub use particle::{Particle, ParticleKind};
pub use restraint::{Restraint, RestraintOrigin};
pub use voxmap::VoxelMap;
