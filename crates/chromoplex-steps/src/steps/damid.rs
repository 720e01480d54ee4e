//! Lamina-DamID activation-distance step.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::info;

use chromoplex_assign::damid::{
    compute_damid_actdist, last_probabilities, read_damid_actdist, read_profile,
    write_damid_actdist, DamidRow,
};
use chromoplex_common::datafile::{DataFileReader, DataFileWriter};
use chromoplex_common::{Error, Result};
use chromoplex_config::{Config, DamidRuntime};
use chromoplex_parallel::NamedTask;
use chromoplex_store::PopulationFile;

use crate::step::Step;

pub const DAMID_ACTDIST_FILE: &str = "damid_actdist.cpxd";

fn batch_in(tmp_dir: &Path, b: usize) -> PathBuf {
    tmp_dir.join(format!("{}.damid.in.batch", b))
}

fn batch_out(tmp_dir: &Path, b: usize) -> PathBuf {
    tmp_dir.join(format!("{}.damid.out.batch", b))
}

fn write_batch(path: &Path, rows: &[(usize, f64, f64)]) -> Result<()> {
    let mut w = DataFileWriter::new();
    let loc: Vec<i64> = rows.iter().map(|r| r.0 as i64).collect();
    let pwish: Vec<f64> = rows.iter().map(|r| r.1).collect();
    let plast: Vec<f64> = rows.iter().map(|r| r.2).collect();
    w.put_i64("loc", &loc, &[loc.len() as u64]);
    w.put_f64("pwish", &pwish, &[pwish.len() as u64]);
    w.put_f64("plast", &plast, &[plast.len() as u64]);
    w.write_to(path)
}

fn read_batch(path: &Path) -> Result<Vec<(usize, f64, f64)>> {
    let mut r = DataFileReader::open(path)?;
    let loc = r.read_i64("loc")?;
    let pwish = r.read_f64("pwish")?;
    let plast = r.read_f64("plast")?;
    Ok((0..loc.len()).map(|k| (loc[k] as usize, pwish[k], plast[k])).collect())
}

pub fn damid_actdist_task(batch_id: usize, cfg: &Config, tmp_dir: &Path) -> Result<()> {
    let damid = cfg
        .restraints
        .damid
        .as_ref()
        .ok_or_else(|| Error::Config("DamID restraints not configured".into()))?;
    let batch = read_batch(&batch_in(tmp_dir, batch_id))?;
    let mut pop = PopulationFile::open(&cfg.optimization.structure_output)?;

    let mut rows: Vec<DamidRow> = Vec::new();
    for (locus, pwish, plast) in batch {
        rows.extend(compute_damid_actdist(
            &mut pop,
            locus,
            pwish,
            plast,
            damid.contact_range,
            &cfg.model.restraints.envelope,
        )?);
    }
    write_damid_actdist(&batch_out(tmp_dir, batch_id), &rows)
}

pub struct DamidActdistStep {
    n_batches: usize,
}

impl DamidActdistStep {
    /// Pop the next sigma into the runtime if none is active yet.
    pub fn prepare(cfg: &mut Config) -> Result<Self> {
        let damid_cfg = cfg
            .restraints
            .damid
            .as_ref()
            .ok_or_else(|| Error::Config("DamID restraints not configured".into()))?;
        let rt = cfg.runtime.damid.get_or_insert_with(|| DamidRuntime {
            sigma_list: damid_cfg.sigma_list.clone(),
            ..Default::default()
        });
        if rt.sigma.is_none() {
            if rt.sigma_list.is_empty() {
                return Err(Error::Config("DamID sigma schedule exhausted".into()));
            }
            rt.sigma = Some(rt.sigma_list.remove(0));
        }
        Ok(Self { n_batches: 0 })
    }

    fn actdist_path(cfg: &Config) -> PathBuf {
        cfg.restraints.damid.as_ref().expect("configured").tmp_dir.join(DAMID_ACTDIST_FILE)
    }
}

#[async_trait]
impl Step for DamidActdistStep {
    fn name(&self, cfg: &Config) -> String {
        format!(
            "DamidActivationDistanceStep (cut={:.2}%, iter={})",
            cfg.runtime.damid.as_ref().and_then(|r| r.sigma).unwrap_or(-0.01) * 100.0,
            cfg.runtime.opt_iter
        )
    }

    fn task(&self) -> NamedTask {
        NamedTask { key: "damid_actdist", func: damid_actdist_task }
    }

    fn tmp_dir(&self, cfg: &Config) -> PathBuf {
        cfg.restraints.damid.as_ref().expect("configured").tmp_dir.clone()
    }

    fn keep_temporary_files(&self, cfg: &Config) -> bool {
        cfg.restraints.damid.as_ref().map(|d| d.keep_temporary_files).unwrap_or(false)
    }

    fn tmp_extensions(&self) -> &'static [&'static str] {
        &["batch"]
    }

    async fn setup(&mut self, cfg: &mut Config) -> Result<Vec<usize>> {
        let damid = cfg.restraints.damid.clone().expect("configured");
        let rt = cfg.runtime.damid.clone().unwrap_or_default();
        let sigma = rt.sigma.ok_or_else(|| Error::Config("DamID sigma not prepared".into()))?;
        let tmp_dir = self.tmp_dir(cfg);
        std::fs::create_dir_all(&tmp_dir)?;

        let profile = read_profile(&damid.input_profile)?;
        let pop = PopulationFile::open(&cfg.optimization.structure_output)?;
        let n_loci = pop.index().n_loci();
        drop(pop);
        if profile.len() != n_loci {
            return Err(Error::Assignment(format!(
                "DamID profile has {} entries, index has {} loci",
                profile.len(),
                n_loci
            )));
        }

        let plast = last_probabilities(rt.actdist_file.as_deref())?;
        // previous probabilities are keyed by bead; any copy works since all
        // copies of a locus share one probability
        let pop = PopulationFile::open(&cfg.optimization.structure_output)?;
        let index = pop.index().clone();
        drop(pop);

        let candidates: Vec<(usize, f64, f64)> = profile
            .iter()
            .enumerate()
            .filter(|&(_, &p)| p >= sigma)
            .map(|(locus, &pwish)| {
                let bead0 = index.copies(locus)[0];
                (locus, pwish, plast.get(&bead0).copied().unwrap_or(0.0))
            })
            .collect();

        let mut n_batches = 0usize;
        for chunk in candidates.chunks(damid.batch_size.max(1)) {
            write_batch(&batch_in(&tmp_dir, n_batches), chunk)?;
            n_batches += 1;
        }
        if candidates.is_empty() {
            write_batch(&batch_in(&tmp_dir, 0), &[])?;
            n_batches = 1;
        }
        info!(candidates = candidates.len(), n_batches, "prepared DamID batches");
        self.n_batches = n_batches;
        Ok((0..n_batches).collect())
    }

    async fn reduce(&mut self, cfg: &mut Config) -> Result<()> {
        let tmp_dir = self.tmp_dir(cfg);
        let mut rows: Vec<DamidRow> = Vec::new();
        for b in 0..self.n_batches {
            rows.extend(read_damid_actdist(&batch_out(&tmp_dir, b))?);
        }

        let actdist_file = Self::actdist_path(cfg);
        let tmp_file = tmp_dir.join(format!("{}.tmp", DAMID_ACTDIST_FILE));
        write_damid_actdist(&tmp_file, &rows)?;
        std::fs::rename(&tmp_file, &actdist_file)?;

        let rt = cfg.runtime.damid.as_mut().expect("prepared");
        rt.actdist_file = Some(actdist_file);
        info!(rows = rows.len(), "wrote DamID activation distances");
        Ok(())
    }

    fn skip(&mut self, cfg: &mut Config) -> Result<()> {
        let path = Self::actdist_path(cfg);
        if let Some(rt) = cfg.runtime.damid.as_mut() {
            rt.actdist_file = Some(path);
        }
        Ok(())
    }
}
