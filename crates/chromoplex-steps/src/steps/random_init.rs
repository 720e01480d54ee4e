//! Random initial configuration with chromosome territories.

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::SeedableRng;

use chromoplex_common::{GenomeIndex, Result};
use chromoplex_config::Config;
use chromoplex_kernel::derive_seed;
use chromoplex_parallel::NamedTask;
use chromoplex_store::PopulationFile;

use crate::step::Step;
use crate::steps::structgen::{
    ready_file, result_file, uniform_sphere, StructGenReduce, StructResult,
};

/// One random structure: every chromosome chain is confined to a random
/// territory sphere whose radius scales with its share of the genome.
pub fn generate_territories(index: &GenomeIndex, nucleus_radius: f64, rng: &mut StdRng) -> Vec<[f64; 3]> {
    let n_tot = index.len() as f64;
    let chains = index.chain();
    let n_chains = index.n_chains();
    let mut chain_sizes = vec![0usize; n_chains];
    for &c in chains {
        chain_sizes[c as usize] += 1;
    }

    // territory radius: 75% of the chain's volumetric-share sphere
    let radii: Vec<f64> = chain_sizes
        .iter()
        .map(|&nb| 0.75 * nucleus_radius * (nb as f64 / n_tot).cbrt())
        .collect();
    let crad = radii.iter().sum::<f64>() / radii.len().max(1) as f64;

    let mut crd = vec![[0.0; 3]; index.len()];
    let mut k = 0usize;
    for &size in &chain_sizes {
        let center = uniform_sphere(rng, (nucleus_radius - crad).max(0.0));
        for _ in 0..size {
            let p = uniform_sphere(rng, crad);
            crd[k] = [center[0] + p[0], center[1] + p[1], center[2] + p[2]];
            k += 1;
        }
    }
    crd
}

pub fn random_init_task(struct_id: usize, cfg: &Config, tmp_dir: &std::path::Path) -> Result<()> {
    let uid = cfg.runtime.step_hash.clone().unwrap_or_default();
    let ready = ready_file(tmp_dir, &uid, struct_id);
    if ready.is_file() && !cfg.optimization.clean_restart {
        return Ok(());
    }

    let pop = PopulationFile::open(&cfg.optimization.structure_output)?;
    let index = pop.index().clone();
    let semiaxes = cfg.model.restraints.envelope.semiaxes();
    let radius = cfg
        .model
        .init_radius
        .unwrap_or_else(|| semiaxes.iter().cloned().fold(f64::MIN, f64::max));

    let seed = derive_seed(
        cfg.optimization.optimizer_options.seed,
        struct_id as u64,
        cfg.runtime.step_no as u64,
    );
    let mut rng = StdRng::seed_from_u64(seed);
    let coordinates = generate_territories(&index, radius, &mut rng);

    let res = StructResult {
        struct_id,
        coordinates,
        summary: Default::default(),
        stats: Default::default(),
    };
    res.write(&result_file(tmp_dir, "random", struct_id))?;
    std::fs::write(&ready, b"")?;
    Ok(())
}

pub struct RandomInitStep {
    reduce: StructGenReduce,
    n_struct: usize,
}

impl RandomInitStep {
    pub fn new() -> Self {
        Self { reduce: StructGenReduce::new("random"), n_struct: 0 }
    }
}

impl Default for RandomInitStep {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Step for RandomInitStep {
    fn name(&self, _cfg: &Config) -> String {
        "RandomInit".to_string()
    }

    fn task(&self) -> NamedTask {
        NamedTask { key: "random_init", func: random_init_task }
    }

    async fn setup(&mut self, cfg: &mut Config) -> Result<Vec<usize>> {
        self.n_struct = cfg.model.population_size;
        std::fs::create_dir_all(self.tmp_dir(cfg))?;
        self.reduce.prepare_tmp_population(cfg)?;
        Ok((0..self.n_struct).collect())
    }

    async fn before_map(&mut self, cfg: &mut Config) -> Result<()> {
        let tmp = self.tmp_dir(cfg);
        self.reduce.clean_sentinels(cfg, &tmp, self.n_struct)?;
        self.reduce.start_poller(cfg, &tmp, self.n_struct);
        Ok(())
    }

    async fn before_reduce(&mut self, cfg: &mut Config) -> Result<()> {
        if !self.reduce.poller_running() {
            let tmp = self.tmp_dir(cfg);
            self.reduce.start_poller(cfg, &tmp, self.n_struct);
        }
        Ok(())
    }

    async fn reduce(&mut self, cfg: &mut Config) -> Result<()> {
        let uid = cfg.runtime.step_hash.clone().unwrap_or_default();
        self.reduce.finish(cfg, &uid).await?;
        Ok(())
    }

    fn tmp_extensions(&self) -> &'static [&'static str] {
        &["sres", "ready"]
    }

    fn keep_temporary_files(&self, cfg: &Config) -> bool {
        cfg.optimization.keep_temporary_files
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chromoplex_common::Bead;

    #[test]
    fn territories_fill_every_bead_inside_the_nucleus() {
        let beads: Vec<Bead> = (0..20)
            .map(|i| Bead {
                id: i,
                chrom: (i / 10) as u32,
                start: (i % 10) as u64 * 100,
                end: ((i % 10) as u64 + 1) * 100,
                copy: 0,
                radius: 10.0,
            })
            .collect();
        let index = GenomeIndex::new(&beads).unwrap();
        let mut rng = StdRng::seed_from_u64(17);
        let crd = generate_territories(&index, 1000.0, &mut rng);
        assert_eq!(crd.len(), 20);
        for p in &crd {
            let r = (p[0] * p[0] + p[1] * p[1] + p[2] * p[2]).sqrt();
            // center within R - crad, bead within crad of its center
            assert!(r <= 1000.0 + 1e-9);
        }
    }
}
