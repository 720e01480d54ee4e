//! External minimizer: serialize the job, run a subprocess, read back the
//! relaxed coordinates. Lets a dedicated MD engine or a GPU kernel take the
//! place of the native one without changing callers.

use std::path::PathBuf;
use std::process::Command;

use serde::{Deserialize, Serialize};
use tracing::warn;

use chromoplex_common::{Error, Result};
use chromoplex_config::OptimizerOptions;
use chromoplex_model::{Model, Particle, ParticleKind, Restraint};

use crate::{Kernel, KernelStats, RunInfo};

pub struct ExternalKernel {
    executable: PathBuf,
}

impl ExternalKernel {
    pub fn new(executable: PathBuf) -> Self {
        Self { executable }
    }
}

#[derive(Serialize)]
struct JobParticle {
    pos: [f64; 3],
    radius: f64,
    kind: u8,
    chain: u32,
}

#[derive(Serialize)]
struct JobBond {
    i: usize,
    j: usize,
    dist: f64,
    k: f64,
    lower: bool,
}

#[derive(Serialize)]
struct JobEnvelope {
    beads: Vec<usize>,
    semiaxes: [f64; 3],
    k: f64,
}

#[derive(Serialize)]
struct JobBody {
    beads: Vec<usize>,
    center: [f64; 3],
    radius: f64,
    k: f64,
}

#[derive(Serialize)]
struct JobFile<'a> {
    particles: Vec<JobParticle>,
    bonds: Vec<JobBond>,
    ev_beads: Vec<usize>,
    evfactor: f64,
    envelopes: Vec<JobEnvelope>,
    bodies: Vec<JobBody>,
    options: &'a OptimizerOptions,
    seed: u64,
}

#[derive(Deserialize)]
struct JobResult {
    coordinates: Vec<[f64; 3]>,
    #[serde(default)]
    stats: KernelStats,
}

fn kind_tag(kind: ParticleKind) -> u8 {
    match kind {
        ParticleKind::Normal => 0,
        ParticleKind::StaticDummy => 1,
        ParticleKind::DynamicCentroid => 2,
    }
}

fn encode_job<'a>(
    particles: &[Particle],
    restraints: &[Restraint],
    opts: &'a OptimizerOptions,
    seed: u64,
) -> Result<JobFile<'a>> {
    let mut job = JobFile {
        particles: particles
            .iter()
            .map(|p| JobParticle {
                pos: p.pos,
                radius: p.radius,
                kind: kind_tag(p.kind),
                chain: p.chain,
            })
            .collect(),
        bonds: Vec::new(),
        ev_beads: Vec::new(),
        evfactor: 0.0,
        envelopes: Vec::new(),
        bodies: Vec::new(),
        options: opts,
        seed,
    };
    for r in restraints {
        match r {
            Restraint::ExcludedVolume { beads, k } => {
                job.ev_beads = beads.clone();
                job.evfactor = *k;
            }
            Restraint::HarmonicUpperBound { i, j, dist, k, .. } => {
                job.bonds.push(JobBond { i: *i, j: *j, dist: *dist, k: *k, lower: false });
            }
            Restraint::HarmonicLowerBound { i, j, dist, k, .. } => {
                job.bonds.push(JobBond { i: *i, j: *j, dist: *dist, k: *k, lower: true });
            }
            Restraint::EllipticEnvelope { beads, semiaxes, k, .. } => {
                job.envelopes.push(JobEnvelope {
                    beads: beads.clone(),
                    semiaxes: *semiaxes,
                    k: *k,
                });
            }
            Restraint::BodyExcludedVolume { beads, center, radius, k } => {
                job.bodies.push(JobBody {
                    beads: beads.clone(),
                    center: *center,
                    radius: *radius,
                    k: *k,
                });
            }
            Restraint::VolumetricEnvelope { .. } => {
                return Err(Error::Config(
                    "exp_map envelopes are not supported by the external kernel".into(),
                ));
            }
        }
    }
    Ok(job)
}

impl Kernel for ExternalKernel {
    fn optimize(
        &self,
        model: &mut Model,
        opts: &OptimizerOptions,
        run: &RunInfo,
    ) -> Result<KernelStats> {
        let job_path = run.tmp_dir.join(format!("{}.job.json", run.run_name));
        let out_path = run.tmp_dir.join(format!("{}.out.json", run.run_name));

        let cleanup = |keep: bool| {
            if !keep {
                let _ = std::fs::remove_file(&job_path);
                let _ = std::fs::remove_file(&out_path);
            }
        };

        let result = (|| -> Result<KernelStats> {
            let job = encode_job(&model.particles, &model.restraints, opts, run.seed)?;
            std::fs::write(&job_path, serde_json::to_vec(&job)?)?;

            let output = Command::new(&self.executable)
                .arg(&job_path)
                .arg(&out_path)
                .output()
                .map_err(|e| {
                    Error::Kernel(format!(
                        "cannot launch kernel {}: {}",
                        self.executable.display(),
                        e
                    ))
                })?;
            if !output.status.success() {
                return Err(Error::Kernel(format!(
                    "kernel exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr)
                )));
            }

            let text = std::fs::read(&out_path)?;
            let parsed: JobResult = serde_json::from_slice(&text)
                .map_err(|e| Error::Kernel(format!("unreadable kernel output: {}", e)))?;
            if parsed.coordinates.len() != model.particles.len() {
                return Err(Error::Kernel(format!(
                    "kernel returned {} coordinates for {} particles",
                    parsed.coordinates.len(),
                    model.particles.len()
                )));
            }
            for (p, x) in model.particles.iter_mut().zip(&parsed.coordinates) {
                p.pos = *x;
            }
            Ok(parsed.stats)
        })();

        if result.is_err() && run.keep_temporary_files {
            warn!(job = %job_path.display(), "kernel failed; keeping job files for inspection");
        }
        cleanup(run.keep_temporary_files);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_executable_reports_kernel_error() {
        let mut model = Model::new();
        model.add_particle([0.0; 3], 1.0, ParticleKind::Normal, 0);
        let kernel = ExternalKernel::new(PathBuf::from("/nonexistent/minimizer"));
        let run = RunInfo {
            run_name: "x".into(),
            tmp_dir: std::env::temp_dir(),
            seed: 1,
            keep_temporary_files: false,
        };
        let err = kernel.optimize(&mut model, &OptimizerOptions::default(), &run);
        assert!(matches!(err, Err(Error::Kernel(_))));
    }
}
