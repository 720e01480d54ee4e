//! SPRITE assignment step: parallel candidate generation per cluster
//! batch, then the serial randomized Boltzmann reduce.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::info;

use chromoplex_assign::sprite::{
    boltzmann_assign, cluster_candidates, ClusterCandidates, ClustersFile,
};
use chromoplex_common::{Error, Result};
use chromoplex_config::{Config, SpriteRuntime};
use chromoplex_parallel::NamedTask;
use chromoplex_store::PopulationFile;

use crate::step::Step;

fn candidates_file(tmp_dir: &Path, b: usize) -> PathBuf {
    tmp_dir.join(format!("{}.cand.batch", b))
}

fn batch_range(batch_id: usize, batch_size: usize, n_clusters: usize) -> (usize, usize) {
    let start = batch_id * batch_size;
    (start, ((batch_id + 1) * batch_size).min(n_clusters))
}

pub fn sprite_assign_task(batch_id: usize, cfg: &Config, tmp_dir: &Path) -> Result<()> {
    let sprite = cfg
        .restraints
        .sprite
        .as_ref()
        .ok_or_else(|| Error::Config("SPRITE restraints not configured".into()))?;
    let clusters = ClustersFile::read(&sprite.clusters)?;
    let (start, stop) = batch_range(batch_id, sprite.batch_size.max(1), clusters.n_clusters());

    let mut pop = PopulationFile::open(&cfg.optimization.structure_output)?;
    let mut out: Vec<Option<ClusterCandidates>> = Vec::with_capacity(stop - start);
    for ci in start..stop {
        out.push(cluster_candidates(
            &mut pop,
            clusters.cluster(ci),
            sprite.keep_best,
            sprite.max_chrom_in_cluster,
        )?);
    }

    let bytes = bincode::serialize(&out)
        .map_err(|e| Error::Serialization(e.to_string()))?;
    std::fs::write(candidates_file(tmp_dir, batch_id), bytes)?;
    Ok(())
}

pub struct SpriteAssignStep {
    n_batches: usize,
    n_clusters: usize,
}

impl SpriteAssignStep {
    pub fn new() -> Self {
        Self { n_batches: 0, n_clusters: 0 }
    }

    fn assignment_path(cfg: &Config) -> PathBuf {
        cfg.restraints.sprite.as_ref().expect("configured").assignment_file.clone()
    }
}

impl Default for SpriteAssignStep {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Step for SpriteAssignStep {
    fn name(&self, cfg: &Config) -> String {
        format!(
            "SpriteAssignmentStep (volume_fraction={:.1}%)",
            cfg.restraints.sprite.as_ref().map(|s| s.volume_fraction).unwrap_or(0.0) * 100.0
        )
    }

    fn task(&self) -> NamedTask {
        NamedTask { key: "sprite_assign", func: sprite_assign_task }
    }

    fn tmp_dir(&self, cfg: &Config) -> PathBuf {
        cfg.restraints.sprite.as_ref().expect("configured").tmp_dir.clone()
    }

    fn keep_temporary_files(&self, cfg: &Config) -> bool {
        cfg.restraints.sprite.as_ref().map(|s| s.keep_temporary_files).unwrap_or(false)
    }

    fn tmp_extensions(&self) -> &'static [&'static str] {
        &["batch"]
    }

    async fn setup(&mut self, cfg: &mut Config) -> Result<Vec<usize>> {
        let sprite = cfg.restraints.sprite.clone().expect("configured");
        std::fs::create_dir_all(self.tmp_dir(cfg))?;

        let clusters = ClustersFile::read(&sprite.clusters)?;
        self.n_clusters = clusters.n_clusters();
        let batch_size = sprite.batch_size.max(1);
        self.n_batches = self.n_clusters.div_ceil(batch_size).max(1);
        Ok((0..self.n_batches).collect())
    }

    async fn reduce(&mut self, cfg: &mut Config) -> Result<()> {
        let sprite = cfg.restraints.sprite.clone().expect("configured");
        let tmp_dir = self.tmp_dir(cfg);
        let clusters = ClustersFile::read(&sprite.clusters)?;

        let mut candidates: Vec<Option<ClusterCandidates>> =
            Vec::with_capacity(self.n_clusters);
        for b in 0..self.n_batches {
            let bytes = std::fs::read(candidates_file(&tmp_dir, b))?;
            let part: Vec<Option<ClusterCandidates>> = bincode::deserialize(&bytes)
                .map_err(|e| Error::Serialization(e.to_string()))?;
            candidates.extend(part);
        }
        if candidates.len() != self.n_clusters {
            return Err(Error::Assignment(format!(
                "candidate batches cover {} clusters, expected {}",
                candidates.len(),
                self.n_clusters
            )));
        }

        let pop = PopulationFile::open(&cfg.optimization.structure_output)?;
        let n_struct = pop.nstruct();
        drop(pop);

        // explicit, recorded seed so the randomized cluster order is
        // reproducible
        let seed = cfg
            .optimization
            .optimizer_options
            .seed
            .wrapping_add(cfg.runtime.step_no as u64);
        let mut rng = StdRng::seed_from_u64(seed);
        let assignment =
            boltzmann_assign(&candidates, &clusters, n_struct, sprite.radius_kt, &mut rng);

        let out_path = Self::assignment_path(cfg);
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut tmp_os = out_path.clone().into_os_string();
        tmp_os.push(".tmp");
        let tmp_path = PathBuf::from(tmp_os);
        assignment.write(&tmp_path)?;
        std::fs::rename(&tmp_path, &out_path)?;

        let assigned = assignment.assignment.iter().filter(|&&s| s >= 0).count();
        info!(clusters = self.n_clusters, assigned, seed, "wrote SPRITE assignment");

        cfg.runtime.sprite = Some(SpriteRuntime {
            assignment_file: Some(out_path),
            assignment_seed: Some(seed),
        });
        Ok(())
    }

    fn skip(&mut self, cfg: &mut Config) -> Result<()> {
        let path = Self::assignment_path(cfg);
        let rt = cfg.runtime.sprite.get_or_insert_with(Default::default);
        rt.assignment_file = Some(path);
        Ok(())
    }
}
