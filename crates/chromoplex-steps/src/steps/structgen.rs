//! Shared machinery for structure-generating steps (random init, relax
//! init, modeling): per-structure result files with write verification,
//! ready sentinels, the streaming reduce into a temporary population, and
//! the atomic publish with repacking.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::info;

use chromoplex_common::{Error, Result};
use chromoplex_config::Config;
use chromoplex_kernel::KernelStats;
use chromoplex_model::ViolationSummary;
use chromoplex_parallel::{FilePoller, PollerHandle};
use chromoplex_store::{publish_over, Layout, PopulationFile};

const POLL_INTERVAL: Duration = Duration::from_millis(1000);

/// Result of one structure optimization, written by a worker and streamed
/// into the temporary population by the reduce.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructResult {
    pub struct_id: usize,
    pub coordinates: Vec<[f64; 3]>,
    pub summary: ViolationSummary,
    pub stats: KernelStats,
}

impl StructResult {
    pub fn write(&self, path: &Path) -> Result<()> {
        let bytes = bincode::serialize(self)?;
        std::fs::write(path, &bytes)?;
        // read back and compare; shared filesystems occasionally lie
        let back = Self::read(path)?;
        if back.coordinates != self.coordinates {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("verification failed writing {}", path.display()),
            )));
        }
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Ok(bincode::deserialize(&bytes)?)
    }
}

pub fn result_file(tmp_dir: &Path, prefix: &str, struct_id: usize) -> PathBuf {
    tmp_dir.join(format!("{}_{}.sres", prefix, struct_id))
}

pub fn ready_file(tmp_dir: &Path, uid: &str, struct_id: usize) -> PathBuf {
    tmp_dir.join(format!("{}.{}.ready", uid, struct_id))
}

/// Uniformly distributed point in a sphere of radius `r`.
pub fn uniform_sphere(rng: &mut StdRng, r: f64) -> [f64; 3] {
    let phi = rng.gen::<f64>() * 2.0 * std::f64::consts::PI;
    let costheta = rng.gen::<f64>() * 2.0 - 1.0;
    let u = rng.gen::<f64>();
    let theta = costheta.acos();
    let rad = r * u.cbrt();
    [rad * theta.sin() * phi.cos(), rad * theta.sin() * phi.sin(), rad * theta.cos()]
}

/// Fresh uniform placement inside the envelope, one point per bead,
/// shrunk by each bead's radius. Used by the random-shuffling retry path.
pub fn random_in_sphere(rng: &mut StdRng, radii: &[f64], nucleus_radius: f64) -> Vec<[f64; 3]> {
    radii.iter().map(|&r| uniform_sphere(rng, (nucleus_radius - r).max(0.0))).collect()
}

struct ReduceState {
    tmp_pop: Option<PopulationFile>,
    summary: ViolationSummary,
    total_energy: f64,
}

/// Streaming collector shared by the structure-generating steps.
///
/// `before_map` (or `before_reduce` on a resumed run) starts the poller;
/// the reduce drains it, publishes the repacked population atomically and
/// stores the violation score.
pub struct StructGenReduce {
    prefix: &'static str,
    poller: Option<PollerHandle>,
    state: Arc<Mutex<ReduceState>>,
}

impl StructGenReduce {
    pub fn new(prefix: &'static str) -> Self {
        Self {
            prefix,
            poller: None,
            state: Arc::new(Mutex::new(ReduceState {
                tmp_pop: None,
                summary: ViolationSummary::default(),
                total_energy: 0.0,
            })),
        }
    }

    pub fn prefix(&self) -> &'static str {
        self.prefix
    }

    fn tmp_population_path(cfg: &Config) -> PathBuf {
        let mut os = cfg.optimization.structure_output.clone().into_os_string();
        os.push(".tmp");
        PathBuf::from(os)
    }

    /// Create the temporary structure-major population the workers' results
    /// are collected into. Runs in `setup`.
    pub fn prepare_tmp_population(&mut self, cfg: &Config) -> Result<()> {
        let live = PopulationFile::open(&cfg.optimization.structure_output)?;
        let tmp_path = Self::tmp_population_path(cfg);
        let tmp = PopulationFile::create(
            &tmp_path,
            &live.index().clone(),
            &live.genome().clone(),
            &live.radii().to_vec(),
            live.nstruct(),
            live.config_data(),
            Layout::StructMajor,
        )?;
        let mut state = self.state.lock().expect("reduce state");
        state.tmp_pop = Some(tmp);
        state.summary = ViolationSummary::default();
        state.total_energy = 0.0;
        Ok(())
    }

    /// Remove stale sentinels so a clean restart recomputes every
    /// structure.
    pub fn clean_sentinels(&self, cfg: &Config, tmp_dir: &Path, n_struct: usize) -> Result<()> {
        if !cfg.optimization.clean_restart {
            return Ok(());
        }
        let uid = cfg.runtime.step_hash.clone().unwrap_or_default();
        for i in 0..n_struct {
            let f = ready_file(tmp_dir, &uid, i);
            if f.is_file() {
                std::fs::remove_file(&f)?;
            }
        }
        Ok(())
    }

    pub fn poller_running(&self) -> bool {
        self.poller.is_some()
    }

    /// Start polling the ready sentinels, streaming each finished structure
    /// into the temporary population.
    pub fn start_poller(&mut self, cfg: &Config, tmp_dir: &Path, n_struct: usize) {
        let uid = cfg.runtime.step_hash.clone().unwrap_or_default();
        let files: Vec<PathBuf> = (0..n_struct).map(|i| ready_file(tmp_dir, &uid, i)).collect();
        let state = self.state.clone();
        let prefix = self.prefix;
        let tmp_dir = tmp_dir.to_path_buf();
        let poller = FilePoller::new(files, POLL_INTERVAL);
        self.poller = Some(poller.watch(move |i| {
            let res = StructResult::read(&result_file(&tmp_dir, prefix, i))?;
            let n = res.coordinates.len();
            let mut arr = Array2::zeros((n, 3));
            for (b, p) in res.coordinates.iter().enumerate() {
                arr[[b, 0]] = p[0];
                arr[[b, 1]] = p[1];
                arr[[b, 2]] = p[2];
            }
            let mut state = state.lock().expect("reduce state");
            let pop = state
                .tmp_pop
                .as_mut()
                .ok_or_else(|| Error::Parallel("reduce state not prepared".into()))?;
            pop.set_struct_crd(res.struct_id, &arr)?;
            state.summary.merge(&res.summary);
            state.total_energy += res.stats.final_energy;
            Ok(())
        }));
    }

    /// Drain the poller, publish atomically, return the violation score.
    pub async fn finish(&mut self, cfg: &mut Config, uid_tag: &str) -> Result<f64> {
        let Some(mut poller) = self.poller.take() else {
            return Err(Error::Parallel("reduce invoked without a running poller".into()));
        };
        while let Some(next) = poller.next_completed().await {
            next?;
        }

        let (mut tmp_pop, summary, _energy) = {
            let mut state = self.state.lock().expect("reduce state");
            let pop = state
                .tmp_pop
                .take()
                .ok_or_else(|| Error::Parallel("reduce state not prepared".into()))?;
            (pop, std::mem::take(&mut state.summary), state.total_energy)
        };

        let imposed = summary.total_imposed();
        let violated = summary.total_violated();
        let violation_score =
            if imposed == 0 { 0.0 } else { violated as f64 / imposed as f64 };

        tmp_pop.set_violation(violation_score)?;
        tmp_pop.set_summary(&serde_json::to_string(&summary)?)?;

        // repack into the committed bead-major layout, then rename-over
        let tmp_path = Self::tmp_population_path(cfg);
        let mut packed_os = tmp_path.clone().into_os_string();
        packed_os.push(".packed");
        let packed_path = PathBuf::from(packed_os);
        tmp_pop.repack(&packed_path)?;
        drop(tmp_pop);
        publish_over(&packed_path, &cfg.optimization.structure_output)?;
        let _ = std::fs::remove_file(&tmp_path);

        if cfg.optimization.keep_intermediate_structures {
            let archive = intermediate_name(cfg, uid_tag);
            chromoplex_store::archive_copy(&cfg.optimization.structure_output, &archive)?;
        }

        cfg.runtime.violation_score = Some(violation_score);
        info!(
            violations = violated,
            imposed, violation_score, "published population"
        );
        Ok(violation_score)
    }
}

/// Audit name for an intermediate population copy: output name tagged with
/// the current sigmas, iteration and step uid.
pub fn intermediate_name(cfg: &Config, uid: &str) -> PathBuf {
    let mut tags: Vec<String> = Vec::new();
    if let Some(hic) = &cfg.runtime.hic {
        if let Some(s) = hic.intra_sigma {
            tags.push(format!("sigma_{:.4}", s));
        }
    }
    if let Some(damid) = &cfg.runtime.damid {
        if let Some(s) = damid.sigma {
            tags.push(format!("damid_{:.4}", s));
        }
    }
    tags.push(format!("iter_{}", cfg.runtime.opt_iter));
    tags.push(uid.to_string());

    let mut os = cfg.optimization.structure_output.clone().into_os_string();
    for t in &tags {
        os.push(".");
        os.push(t);
    }
    PathBuf::from(os)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn struct_result_roundtrip_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("r_0.sres");
        let res = StructResult {
            struct_id: 0,
            coordinates: vec![[1.0, 2.0, 3.0], [-4.0, 0.5, 0.0]],
            summary: ViolationSummary::default(),
            stats: KernelStats::default(),
        };
        res.write(&path).unwrap();
        let back = StructResult::read(&path).unwrap();
        assert_eq!(back.coordinates, res.coordinates);
    }

    #[test]
    fn uniform_sphere_stays_inside() {
        let mut rng = StdRng::seed_from_u64(99);
        for _ in 0..500 {
            let p = uniform_sphere(&mut rng, 100.0);
            let r = (p[0] * p[0] + p[1] * p[1] + p[2] * p[2]).sqrt();
            assert!(r <= 100.0 + 1e-9);
        }
    }

    #[test]
    fn random_in_sphere_honors_bead_radius() {
        let mut rng = StdRng::seed_from_u64(5);
        let pts = random_in_sphere(&mut rng, &[100.0, 250.0], 1000.0);
        let r0 = (pts[0][0].powi(2) + pts[0][1].powi(2) + pts[0][2].powi(2)).sqrt();
        let r1 = (pts[1][0].powi(2) + pts[1][1].powi(2) + pts[1][2].powi(2)).sqrt();
        assert!(r0 <= 900.0 + 1e-9);
        assert!(r1 <= 750.0 + 1e-9);
    }
}
