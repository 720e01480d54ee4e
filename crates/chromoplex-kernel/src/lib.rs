//! Kernel adapter: single-structure constrained minimization.
//!
//! The pipeline treats the minimizer as a black box with a fixed contract:
//! particles plus typed restraints in, relaxed coordinates plus diagnostics
//! out. The built-in native kernel implements the contract directly; the
//! external kernel shells out to a separate executable, so alternative
//! back-ends can plug in without touching assignment or orchestration code.

mod external;
mod native;
mod seed;

pub use external::ExternalKernel;
pub use native::NativeKernel;
pub use seed::derive_seed;

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use chromoplex_common::{Error, Result};
use chromoplex_config::OptimizerOptions;
use chromoplex_model::Model;

/// Per-run identity and scratch-space information for one optimization.
#[derive(Debug, Clone)]
pub struct RunInfo {
    pub run_name: String,
    pub tmp_dir: PathBuf,
    pub seed: u64,
    pub keep_temporary_files: bool,
}

/// Diagnostics returned by a kernel run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KernelStats {
    pub final_energy: f64,
    pub pair_energy: f64,
    pub bond_energy: f64,
    /// Wall-clock seconds spent in the MD phase.
    pub md_time: f64,
    /// Thermodynamic observables sampled during the run.
    pub thermo: BTreeMap<String, f64>,
}

pub trait Kernel: Send + Sync {
    /// Relax the model in place and return diagnostics.
    fn optimize(&self, model: &mut Model, opts: &OptimizerOptions, run: &RunInfo)
        -> Result<KernelStats>;
}

/// Instantiate the configured kernel. `kernel_opts` is the raw
/// `optimization.kernel_opts.<name>` subtree.
pub fn create_kernel(name: &str, kernel_opts: &serde_json::Value) -> Result<Box<dyn Kernel>> {
    match name {
        "native" => Ok(Box::new(NativeKernel::default())),
        "external" => {
            let opts = kernel_opts.get("external").cloned().unwrap_or_default();
            let executable = opts
                .get("executable")
                .and_then(|v| v.as_str())
                .ok_or_else(|| {
                    Error::Config("kernel_opts.external.executable is required".into())
                })?;
            Ok(Box::new(ExternalKernel::new(PathBuf::from(executable))))
        }
        other => Err(Error::Config(format!("unknown kernel '{}'", other))),
    }
}
