//! Relaxation of the random initial configurations under the intrinsic
//! restraints only, untangling the population before data-driven
//! iterations begin.

use async_trait::async_trait;

use chromoplex_common::Result;
use chromoplex_config::Config;
use chromoplex_parallel::NamedTask;

use crate::step::Step;
use crate::steps::modeling::optimize_structure;
use crate::steps::structgen::StructGenReduce;

pub fn relax_init_task(struct_id: usize, cfg: &Config, tmp_dir: &std::path::Path) -> Result<()> {
    optimize_structure(struct_id, cfg, tmp_dir, "relax", false)
}

pub struct RelaxInitStep {
    reduce: StructGenReduce,
    n_struct: usize,
}

impl RelaxInitStep {
    pub fn new() -> Self {
        Self { reduce: StructGenReduce::new("relax"), n_struct: 0 }
    }
}

impl Default for RelaxInitStep {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Step for RelaxInitStep {
    fn name(&self, _cfg: &Config) -> String {
        "RelaxInit".to_string()
    }

    fn task(&self) -> NamedTask {
        NamedTask { key: "relax_init", func: relax_init_task }
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
