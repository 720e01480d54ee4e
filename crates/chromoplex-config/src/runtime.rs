//! Mutable runtime state threaded through the pipeline steps.
//!
//! This is the state the original system kept under the `runtime` key of the
//! configuration dictionary: current sigma cutoffs, iteration counters and
//! the locations of the latest assignment artifacts. It is serialized into
//! every step-log row so that a restarted run can merge it back.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeState {
    /// Global step counter; incremented before each step runs.
    #[serde(default)]
    pub step_no: i64,
    /// Optimization iteration within the current sigma.
    #[serde(default)]
    pub opt_iter: u32,
    /// Uid of the currently executing step.
    #[serde(default)]
    pub step_hash: Option<String>,
    /// Violation score published by the latest modeling step.
    #[serde(default)]
    pub violation_score: Option<f64>,
    /// Optional consecutive-contact probability file for hic-style
    /// polymer bonds.
    #[serde(default)]
    pub consecutive_contact_probabilities: Option<PathBuf>,
    #[serde(default)]
    pub hic: Option<HicRuntime>,
    #[serde(default)]
    pub damid: Option<DamidRuntime>,
    #[serde(default)]
    pub sprite: Option<SpriteRuntime>,
    #[serde(default)]
    pub fish: Option<FishRuntime>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HicRuntime {
    /// Sigmas not yet consumed; the head becomes the active sigma.
    pub intra_sigma_list: Vec<f64>,
    pub inter_sigma_list: Vec<f64>,
    pub intra_sigma: Option<f64>,
    pub inter_sigma: Option<f64>,
    pub actdist_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DamidRuntime {
    pub sigma_list: Vec<f64>,
    pub sigma: Option<f64>,
    pub actdist_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpriteRuntime {
    pub assignment_file: Option<PathBuf>,
    /// Seed recorded for the randomized cluster order of the last
    /// assignment, for reproducibility.
    pub assignment_seed: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FishRuntime {
    pub tol_list: Vec<f64>,
    pub tol: Option<f64>,
    pub assignment_file: Option<PathBuf>,
}

impl RuntimeState {
    /// Merge a snapshot restored from the step log into the live state.
    /// The snapshot wins: it reflects the state at the recorded substep.
    pub fn merge_from(&mut self, snapshot: RuntimeState) {
        *self = snapshot;
    }
}
