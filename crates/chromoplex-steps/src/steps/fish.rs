//! FISH assignment step: per-structure target selection by ordered
//! statistics.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use tracing::info;

use chromoplex_assign::fish::{match_targets, pair_min_max, radial_min_max, FishInput};
use chromoplex_common::{Error, Result};
use chromoplex_config::{Config, FishRuntime};
use chromoplex_parallel::NamedTask;
use chromoplex_store::PopulationFile;

use crate::step::Step;

pub const FISH_ASSIGNMENT_FILE: &str = "fish_assignment.cpxd";

#[derive(Debug, Serialize, Deserialize)]
enum BatchKind {
    Probes,
    Pairs,
}

#[derive(Debug, Serialize, Deserialize)]
struct Batch {
    kind: BatchKind,
    /// Indices into the input's probe or pair arrays.
    entries: Vec<usize>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct BatchOutput {
    radial_min: Vec<(usize, Vec<f64>)>,
    radial_max: Vec<(usize, Vec<f64>)>,
    pair_min: Vec<(usize, Vec<f64>)>,
    pair_max: Vec<(usize, Vec<f64>)>,
}

fn batch_in(tmp_dir: &Path, b: usize) -> PathBuf {
    tmp_dir.join(format!("{}.fish.in.batch", b))
}

fn batch_out(tmp_dir: &Path, b: usize) -> PathBuf {
    tmp_dir.join(format!("{}.fish.out.batch", b))
}

fn write_bincode<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = bincode::serialize(value).map_err(|e| Error::Serialization(e.to_string()))?;
    std::fs::write(path, bytes)?;
    Ok(())
}

fn read_bincode<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let bytes = std::fs::read(path)?;
    bincode::deserialize(&bytes).map_err(|e| Error::Serialization(e.to_string()))
}

/// Sorted copy of one target-distribution row.
fn sorted_row(arr: &Array2<f64>, k: usize) -> Vec<f64> {
    let mut row = arr.row(k).to_vec();
    row.sort_by(|a, b| a.partial_cmp(b).expect("finite targets"));
    row
}

pub fn fish_assign_task(batch_id: usize, cfg: &Config, tmp_dir: &Path) -> Result<()> {
    let fish = cfg
        .restraints
        .fish
        .as_ref()
        .ok_or_else(|| Error::Config("FISH restraints not configured".into()))?;
    let input = FishInput::read(&fish.input_fish)?;
    let batch: Batch = read_bincode(&batch_in(tmp_dir, batch_id))?;
    let mut pop = PopulationFile::open(&cfg.optimization.structure_output)?;

    let mut out = BatchOutput::default();
    match batch.kind {
        BatchKind::Probes => {
            for &k in &batch.entries {
                let locus = input.probes[k];
                let (min, max) = radial_min_max(&mut pop, locus)?;
                if let Some(targets) = &input.radial_min {
                    out.radial_min.push((k, match_targets(&min, &sorted_row(targets, k))));
                }
                if let Some(targets) = &input.radial_max {
                    out.radial_max.push((k, match_targets(&max, &sorted_row(targets, k))));
                }
            }
        }
        BatchKind::Pairs => {
            for &k in &batch.entries {
                let (li, lj) = input.pairs[k];
                let (min, max) = pair_min_max(&mut pop, li, lj)?;
                if let Some(targets) = &input.pair_min {
                    out.pair_min.push((k, match_targets(&min, &sorted_row(targets, k))));
                }
                if let Some(targets) = &input.pair_max {
                    out.pair_max.push((k, match_targets(&max, &sorted_row(targets, k))));
                }
            }
        }
    }
    write_bincode(&batch_out(tmp_dir, batch_id), &out)
}

pub struct FishAssignStep {
    n_batches: usize,
}

impl FishAssignStep {
    /// Pop the next tolerance into the runtime if none is active yet.
    pub fn prepare(cfg: &mut Config) -> Result<Self> {
        let fish_cfg = cfg
            .restraints
            .fish
            .as_ref()
            .ok_or_else(|| Error::Config("FISH restraints not configured".into()))?;
        let rt = cfg.runtime.fish.get_or_insert_with(|| FishRuntime {
            tol_list: fish_cfg.tol_list.clone(),
            ..Default::default()
        });
        if rt.tol.is_none() {
            if rt.tol_list.is_empty() {
                return Err(Error::Config("FISH tolerance schedule exhausted".into()));
            }
            rt.tol = Some(rt.tol_list.remove(0));
        }
        Ok(Self { n_batches: 0 })
    }

    fn assignment_path(cfg: &Config) -> PathBuf {
        cfg.restraints.fish.as_ref().expect("configured").tmp_dir.join(FISH_ASSIGNMENT_FILE)
    }
}

#[async_trait]
impl Step for FishAssignStep {
    fn name(&self, cfg: &Config) -> String {
        format!(
            "FishAssignmentStep (tol={:.2}, iter={})",
            cfg.runtime.fish.as_ref().and_then(|r| r.tol).unwrap_or(-1.0),
            cfg.runtime.opt_iter
        )
    }

    fn task(&self) -> NamedTask {
        NamedTask { key: "fish_assign", func: fish_assign_task }
    }

    fn tmp_dir(&self, cfg: &Config) -> PathBuf {
        cfg.restraints.fish.as_ref().expect("configured").tmp_dir.clone()
    }

    fn keep_temporary_files(&self, cfg: &Config) -> bool {
        cfg.restraints.fish.as_ref().map(|f| f.keep_temporary_files).unwrap_or(false)
    }

    fn tmp_extensions(&self) -> &'static [&'static str] {
        &["batch"]
    }

    async fn setup(&mut self, cfg: &mut Config) -> Result<Vec<usize>> {
        let fish = cfg.restraints.fish.clone().expect("configured");
        let tmp_dir = self.tmp_dir(cfg);
        std::fs::create_dir_all(&tmp_dir)?;

        let input = FishInput::read(&fish.input_fish)?;
        let pop = PopulationFile::open(&cfg.optimization.structure_output)?;
        // hard precondition: targets must cover exactly the population
        input.validate(pop.nstruct())?;
        drop(pop);

        let batch_size = fish.batch_size.max(1);
        let mut n_batches = 0usize;
        for chunk in (0..input.probes.len()).collect::<Vec<_>>().chunks(batch_size) {
            let batch = Batch { kind: BatchKind::Probes, entries: chunk.to_vec() };
            write_bincode(&batch_in(&tmp_dir, n_batches), &batch)?;
            n_batches += 1;
        }
        for chunk in (0..input.pairs.len()).collect::<Vec<_>>().chunks(batch_size) {
            let batch = Batch { kind: BatchKind::Pairs, entries: chunk.to_vec() };
            write_bincode(&batch_in(&tmp_dir, n_batches), &batch)?;
            n_batches += 1;
        }
        if n_batches == 0 {
            write_bincode(&batch_in(&tmp_dir, 0), &Batch { kind: BatchKind::Probes, entries: vec![] })?;
            n_batches = 1;
        }
        info!(
            probes = input.probes.len(),
            pairs = input.pairs.len(),
            n_batches,
            "prepared FISH batches"
        );
        self.n_batches = n_batches;
        Ok((0..n_batches).collect())
    }

    async fn reduce(&mut self, cfg: &mut Config) -> Result<()> {
        let fish = cfg.restraints.fish.clone().expect("configured");
        let tmp_dir = self.tmp_dir(cfg);
        let input = FishInput::read(&fish.input_fish)?;

        let pop = PopulationFile::open(&cfg.optimization.structure_output)?;
        let n_struct = pop.nstruct();
        drop(pop);

        let mut assignment = FishInput {
            probes: input.probes.clone(),
            pairs: input.pairs.clone(),
            radial_min: input
                .radial_min
                .as_ref()
                .map(|_| Array2::zeros((input.probes.len(), n_struct))),
            radial_max: input
                .radial_max
                .as_ref()
                .map(|_| Array2::zeros((input.probes.len(), n_struct))),
            pair_min: input
                .pair_min
                .as_ref()
                .map(|_| Array2::zeros((input.pairs.len(), n_struct))),
            pair_max: input
                .pair_max
                .as_ref()
                .map(|_| Array2::zeros((input.pairs.len(), n_struct))),
        };

        for b in 0..self.n_batches {
            let out: BatchOutput = read_bincode(&batch_out(&tmp_dir, b))?;
            let fill = |dst: &mut Option<Array2<f64>>, entries: &[(usize, Vec<f64>)]| {
                if let Some(arr) = dst.as_mut() {
                    for (k, values) in entries {
                        for (s, &v) in values.iter().enumerate() {
                            arr[[*k, s]] = v;
                        }
                    }
                }
            };
            fill(&mut assignment.radial_min, &out.radial_min);
            fill(&mut assignment.radial_max, &out.radial_max);
            fill(&mut assignment.pair_min, &out.pair_min);
            fill(&mut assignment.pair_max, &out.pair_max);
        }

        let out_path = Self::assignment_path(cfg);
        let tmp_path = tmp_dir.join(format!("{}.tmp", FISH_ASSIGNMENT_FILE));
        assignment.write(&tmp_path)?;

        let rt = cfg.runtime.fish.as_mut().expect("prepared");
        if let Some(last) = rt.assignment_file.take() {
            if last.is_file() {
                let suffix =
                    format!("tol_{:.4}.iter_{}", rt.tol.unwrap_or(-1.0), cfg.runtime.opt_iter);
                let mut archived = out_path.clone().into_os_string();
                archived.push(".");
                archived.push(&suffix);
                std::fs::rename(&last, PathBuf::from(archived))?;
            }
        }
        std::fs::rename(&tmp_path, &out_path)?;
        rt.assignment_file = Some(out_path);
        info!("wrote FISH per-structure targets");
        Ok(())
    }

    fn skip(&mut self, cfg: &mut Config) -> Result<()> {
        let path = Self::assignment_path(cfg);
        if let Some(rt) = cfg.runtime.fish.as_mut() {
            rt.assignment_file = Some(path);
        }
        Ok(())
    }
}
