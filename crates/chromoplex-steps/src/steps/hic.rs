//! Hi-C activation-distance step.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::info;

use chromoplex_assign::actdist::{
    compute_pair_actdist, read_actdist, write_actdist, ActdistRow,
};
use chromoplex_assign::matrix::ContactMatrix;
use chromoplex_common::datafile::{DataFileReader, DataFileWriter};
use chromoplex_common::{Error, Result};
use chromoplex_config::{Config, HicRuntime};
use chromoplex_parallel::NamedTask;
use chromoplex_store::PopulationFile;

use crate::step::Step;

pub const ACTDIST_FILE: &str = "actdist.cpxd";

fn batch_in(tmp_dir: &Path, b: usize) -> PathBuf {
    tmp_dir.join(format!("{}.in.batch", b))
}

fn batch_out(tmp_dir: &Path, b: usize) -> PathBuf {
    tmp_dir.join(format!("{}.out.batch", b))
}

struct Candidate {
    i: usize,
    j: usize,
    pwish: f64,
    plast: f64,
}

fn write_batch(path: &Path, rows: &[Candidate]) -> Result<()> {
    let mut w = DataFileWriter::new();
    let i: Vec<i64> = rows.iter().map(|r| r.i as i64).collect();
    let j: Vec<i64> = rows.iter().map(|r| r.j as i64).collect();
    let pwish: Vec<f64> = rows.iter().map(|r| r.pwish).collect();
    let plast: Vec<f64> = rows.iter().map(|r| r.plast).collect();
    w.put_i64("i", &i, &[i.len() as u64]);
    w.put_i64("j", &j, &[j.len() as u64]);
    w.put_f64("pwish", &pwish, &[pwish.len() as u64]);
    w.put_f64("plast", &plast, &[plast.len() as u64]);
    w.write_to(path)
}

fn read_batch(path: &Path) -> Result<Vec<Candidate>> {
    let mut r = DataFileReader::open(path)?;
    let i = r.read_i64("i")?;
    let j = r.read_i64("j")?;
    let pwish = r.read_f64("pwish")?;
    let plast = r.read_f64("plast")?;
    Ok((0..i.len())
        .map(|k| Candidate {
            i: i[k] as usize,
            j: j[k] as usize,
            pwish: pwish[k],
            plast: plast[k],
        })
        .collect())
}

pub fn hic_actdist_task(batch_id: usize, cfg: &Config, tmp_dir: &Path) -> Result<()> {
    let hic = cfg
        .restraints
        .hic
        .as_ref()
        .ok_or_else(|| Error::Config("Hi-C restraints not configured".into()))?;
    let candidates = read_batch(&batch_in(tmp_dir, batch_id))?;
    let mut pop = PopulationFile::open(&cfg.optimization.structure_output)?;

    let mut rows: Vec<ActdistRow> = Vec::new();
    for c in candidates {
        rows.extend(compute_pair_actdist(
            &mut pop,
            c.i,
            c.j,
            c.pwish,
            c.plast,
            hic.contact_range,
        )?);
    }
    write_actdist(&batch_out(tmp_dir, batch_id), &rows)
}

pub struct HicActdistStep {
    n_batches: usize,
}

impl HicActdistStep {
    /// Pop the next sigma pair into the runtime if none is active yet.
    /// Runs before uid computation so the step name reflects the sigma.
    pub fn prepare(cfg: &mut Config) -> Result<Self> {
        let hic_cfg = cfg
            .restraints
            .hic
            .as_ref()
            .ok_or_else(|| Error::Config("Hi-C restraints not configured".into()))?;
        let rt = cfg.runtime.hic.get_or_insert_with(|| HicRuntime {
            intra_sigma_list: hic_cfg.intra_sigma_list.clone(),
            inter_sigma_list: hic_cfg.inter_sigma_list.clone(),
            ..Default::default()
        });
        if rt.intra_sigma.is_none() && rt.inter_sigma.is_none() {
            if rt.intra_sigma_list.is_empty() || rt.inter_sigma_list.is_empty() {
                return Err(Error::Config("Hi-C sigma schedule exhausted".into()));
            }
            rt.intra_sigma = Some(rt.intra_sigma_list.remove(0));
            rt.inter_sigma = Some(rt.inter_sigma_list.remove(0));
        }
        Ok(Self { n_batches: 0 })
    }

    fn actdist_path(cfg: &Config) -> PathBuf {
        cfg.restraints.hic.as_ref().expect("configured").tmp_dir.join(ACTDIST_FILE)
    }
}

#[async_trait]
impl Step for HicActdistStep {
    fn name(&self, cfg: &Config) -> String {
        let rt = cfg.runtime.hic.as_ref();
        format!(
            "ActivationDistanceStep (INTER sigma={:.2}%, INTRA sigma={:.2}%, iter={})",
            rt.and_then(|r| r.inter_sigma).unwrap_or(-0.01) * 100.0,
            rt.and_then(|r| r.intra_sigma).unwrap_or(-0.01) * 100.0,
            cfg.runtime.opt_iter
        )
    }

    fn task(&self) -> NamedTask {
        NamedTask { key: "hic_actdist", func: hic_actdist_task }
    }

    fn tmp_dir(&self, cfg: &Config) -> PathBuf {
        cfg.restraints.hic.as_ref().expect("configured").tmp_dir.clone()
    }

    fn keep_temporary_files(&self, cfg: &Config) -> bool {
        cfg.restraints.hic.as_ref().map(|h| h.keep_temporary_files).unwrap_or(false)
    }

    fn tmp_extensions(&self) -> &'static [&'static str] {
        &["batch"]
    }

    async fn setup(&mut self, cfg: &mut Config) -> Result<Vec<usize>> {
        let hic = cfg.restraints.hic.clone().expect("configured");
        let rt = cfg.runtime.hic.clone().unwrap_or_default();
        let tmp_dir = self.tmp_dir(cfg);
        std::fs::create_dir_all(&tmp_dir)?;

        let matrix = ContactMatrix::read(&hic.input_matrix)?;
        let pop = PopulationFile::open(&cfg.optimization.structure_output)?;
        let index = pop.index().clone();
        drop(pop);
        if matrix.n != index.n_loci() {
            return Err(Error::Assignment(format!(
                "contact matrix covers {} loci, index has {}",
                matrix.n,
                index.n_loci()
            )));
        }

        // corrected probabilities of the previous iteration, keyed by locus
        let plast: HashMap<(usize, usize), f64> = match &rt.actdist_file {
            Some(path) if path.is_file() => read_actdist(path)?
                .into_iter()
                .map(|r| {
                    let li = index.locus_of(r.row);
                    let lj = index.locus_of(r.col);
                    ((li.min(lj), li.max(lj)), r.prob)
                })
                .collect(),
            _ => HashMap::new(),
        };

        let intra_sigma = rt.intra_sigma;
        let inter_sigma = rt.inter_sigma;
        let mut batch: Vec<Candidate> = Vec::new();
        let mut n_batches = 0usize;
        let mut n_intra = 0usize;
        let mut n_inter = 0usize;
        for (i, j, pwish) in matrix.iter() {
            let same_chrom = index.locus_chrom(i) == index.locus_chrom(j);
            let keep = if same_chrom {
                intra_sigma.map(|s| pwish >= s).unwrap_or(false)
            } else {
                inter_sigma.map(|s| pwish >= s).unwrap_or(false)
            };
            if !keep {
                continue;
            }
            if same_chrom {
                n_intra += 1;
            } else {
                n_inter += 1;
            }
            let key = (i.min(j), i.max(j));
            batch.push(Candidate {
                i,
                j,
                pwish,
                plast: plast.get(&key).copied().unwrap_or(0.0),
            });
            if batch.len() == hic.batch_size {
                write_batch(&batch_in(&tmp_dir, n_batches), &batch)?;
                batch.clear();
                n_batches += 1;
            }
        }
        write_batch(&batch_in(&tmp_dir, n_batches), &batch)?;
        n_batches += 1;

        info!(n_intra, n_inter, n_batches, "prepared Hi-C candidate batches");
        self.n_batches = n_batches;
        Ok((0..n_batches).collect())
    }

    async fn reduce(&mut self, cfg: &mut Config) -> Result<()> {
        let tmp_dir = self.tmp_dir(cfg);
        let mut rows: Vec<ActdistRow> = Vec::new();
        for b in 0..self.n_batches {
            rows.extend(read_actdist(&batch_out(&tmp_dir, b))?);
        }

        let actdist_file = Self::actdist_path(cfg);
        let tmp_file = tmp_dir.join(format!("{}.tmp", ACTDIST_FILE));
        write_actdist(&tmp_file, &rows)?;

        // keep the previous table under a sigma/iteration suffix for audit
        let rt = cfg.runtime.hic.as_mut().expect("prepared");
        if let Some(last) = rt.actdist_file.take() {
            if last.is_file() {
                let suffix = format!(
                    "INTERsigma_{:.4}.INTRAsigma_{:.4}.iter_{}",
                    rt.inter_sigma.unwrap_or(-1.0),
                    rt.intra_sigma.unwrap_or(-1.0),
                    cfg.runtime.opt_iter
                );
                let mut archived = actdist_file.clone().into_os_string();
                archived.push(".");
                archived.push(&suffix);
                std::fs::rename(&last, PathBuf::from(archived))?;
            }
        }
        std::fs::rename(&tmp_file, &actdist_file)?;
        rt.actdist_file = Some(actdist_file);
        info!(rows = rows.len(), "wrote Hi-C activation distances");
        Ok(())
    }

    fn skip(&mut self, cfg: &mut Config) -> Result<()> {
        let path = Self::actdist_path(cfg);
        if let Some(rt) = cfg.runtime.hic.as_mut() {
            rt.actdist_file = Some(path);
        }
        Ok(())
    }
}
