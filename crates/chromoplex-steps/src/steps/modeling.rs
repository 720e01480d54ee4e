//! Modeling step: per-structure restraint construction and kernel
//! optimization, fanned out over the population.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::SeedableRng;

use chromoplex_assign::actdist::ActdistStream;
use chromoplex_assign::damid::read_damid_actdist;
use chromoplex_assign::fish::FishInput;
use chromoplex_assign::sprite::SpriteAssignment;
use chromoplex_common::datafile::DataFileReader;
use chromoplex_common::Result;
use chromoplex_config::{Config, EnvelopeShape};
use chromoplex_kernel::{create_kernel, derive_seed, RunInfo};
use chromoplex_model::builders::{
    add_beads, add_damid_restraint, add_envelope, add_excluded_volume, add_fish_restraints,
    add_hic_bonds, add_nuclear_bodies, add_polymer_bonds, add_sprite_cluster, FishStructTargets,
};
use chromoplex_model::{Model, VoxelMap};
use chromoplex_parallel::NamedTask;
use chromoplex_store::PopulationFile;

use crate::step::Step;
use crate::steps::structgen::{
    random_in_sphere, ready_file, result_file, StructGenReduce, StructResult,
};

const ACTDIST_CHUNK: usize = 10_000;

/// Build the intrinsic (physics-only) model of one structure.
pub(crate) fn build_intrinsic_model(
    struct_id: usize,
    cfg: &Config,
    pop: &mut PopulationFile,
    rng: &mut StdRng,
) -> Result<Model> {
    let index = pop.index().clone();
    let radii = pop.radii().to_vec();

    let crd = if cfg.optimization.random_shuffling {
        let semiaxes = cfg.model.restraints.envelope.semiaxes();
        let r = semiaxes.iter().cloned().fold(f64::MIN, f64::max);
        let pts = random_in_sphere(rng, &radii, r);
        let mut arr = ndarray::Array2::zeros((pts.len(), 3));
        for (i, p) in pts.iter().enumerate() {
            for d in 0..3 {
                arr[[i, d]] = p[d];
            }
        }
        arr
    } else {
        pop.get_struct_crd(struct_id)?
    };

    let mut model = Model::new();
    add_beads(&mut model, &crd, &radii, &index);
    add_excluded_volume(&mut model, cfg.model.restraints.excluded.evfactor);

    let env = &cfg.model.restraints.envelope;
    let map = if env.nucleus_shape == EnvelopeShape::ExpMap {
        let path = env.input_map.as_ref().expect("validated at startup");
        Some(Arc::new(VoxelMap::load(path)?))
    } else {
        None
    };
    add_envelope(&mut model, env, map)?;

    let cp = match &cfg.runtime.consecutive_contact_probabilities {
        Some(path) => Some(read_contact_probabilities(path)?),
        None => None,
    };
    add_polymer_bonds(&mut model, &index, &cfg.model.restraints.polymer, cp.as_deref());
    add_nuclear_bodies(&mut model, &cfg.model.restraints.nucleolus);
    Ok(model)
}

fn read_contact_probabilities(path: &Path) -> Result<Vec<f64>> {
    let mut r = DataFileReader::open(path)?;
    r.read_f64("prob")
}

/// Append the data-driven restraints of the current assignments.
fn add_data_restraints(
    model: &mut Model,
    struct_id: usize,
    cfg: &Config,
    pop: &mut PopulationFile,
) -> Result<()> {
    let index = pop.index().clone();

    if let (Some(hic_cfg), Some(hic_rt)) = (&cfg.restraints.hic, &cfg.runtime.hic) {
        if let Some(actdist_file) = &hic_rt.actdist_file {
            let mut stream = ActdistStream::open(actdist_file, ACTDIST_CHUNK)?;
            while let Some(chunk) = stream.next_chunk()? {
                add_hic_bonds(
                    model,
                    chunk.iter().map(|r| (r.row, r.col, r.dist)),
                    hic_cfg.contact_range,
                    hic_cfg.contact_kspring,
                );
            }
        }
    }

    if let (Some(damid_cfg), Some(damid_rt)) = (&cfg.restraints.damid, &cfg.runtime.damid) {
        if let Some(actdist_file) = &damid_rt.actdist_file {
            let rows = read_damid_actdist(actdist_file)?;
            add_damid_restraint(
                model,
                rows.iter().map(|r| (r.bead, r.dist)),
                damid_cfg.contact_range,
                &cfg.model.restraints.envelope,
                damid_cfg.kspring,
            );
        }
    }

    if let (Some(sprite_cfg), Some(sprite_rt)) = (&cfg.restraints.sprite, &cfg.runtime.sprite) {
        if let Some(assignment_file) = &sprite_rt.assignment_file {
            let assignment = SpriteAssignment::read(assignment_file)?;
            for (ci, &si) in assignment.assignment.iter().enumerate() {
                if si == struct_id as i64 {
                    let beads: Vec<usize> = assignment
                        .selected_beads(ci)
                        .iter()
                        .filter(|&&b| b >= 0)
                        .map(|&b| b as usize)
                        .collect();
                    add_sprite_cluster(
                        model,
                        &beads,
                        sprite_cfg.volume_fraction,
                        sprite_cfg.kspring,
                    );
                }
            }
        }
    }

    if let (Some(fish_cfg), Some(fish_rt)) = (&cfg.restraints.fish, &cfg.runtime.fish) {
        if let Some(assignment_file) = &fish_rt.assignment_file {
            let assignment = FishInput::read(assignment_file)?;
            let column = |arr: &Option<ndarray::Array2<f64>>| {
                arr.as_ref().map(|a| a.column(struct_id).to_vec())
            };
            let targets = FishStructTargets {
                probes: assignment.probes.clone(),
                pairs: assignment.pairs.clone(),
                radial_min: column(&assignment.radial_min),
                radial_max: column(&assignment.radial_max),
                pair_min: column(&assignment.pair_min),
                pair_max: column(&assignment.pair_max),
            };
            let tol = fish_rt.tol.unwrap_or(0.0);
            add_fish_restraints(model, &index, &targets, &fish_cfg.rtype, tol, fish_cfg.kspring)?;
        }
    }

    Ok(())
}

/// Relax one structure and write its result + sentinel. Shared by the
/// relax-init (intrinsic only) and modeling (full) steps.
pub(crate) fn optimize_structure(
    struct_id: usize,
    cfg: &Config,
    tmp_dir: &Path,
    prefix: &'static str,
    with_data: bool,
) -> Result<()> {
    let uid = cfg.runtime.step_hash.clone().unwrap_or_default();
    let ready = ready_file(tmp_dir, &uid, struct_id);
    if ready.is_file() && !cfg.optimization.clean_restart {
        return Ok(());
    }

    let seed = derive_seed(
        cfg.optimization.optimizer_options.seed,
        struct_id as u64,
        cfg.runtime.step_no as u64,
    );
    let mut rng = StdRng::seed_from_u64(seed);

    let mut pop = PopulationFile::open(&cfg.optimization.structure_output)?;
    let mut model = build_intrinsic_model(struct_id, cfg, &mut pop, &mut rng)?;
    if with_data {
        add_data_restraints(&mut model, struct_id, cfg, &mut pop)?;
    }
    drop(pop);

    let kernel = create_kernel(&cfg.optimization.kernel, &cfg.optimization.kernel_opts)?;
    let run = RunInfo {
        run_name: format!("{}_{}", uid, struct_id),
        tmp_dir: tmp_dir.to_path_buf(),
        seed,
        keep_temporary_files: cfg.optimization.keep_temporary_files,
    };
    let stats = kernel.optimize(&mut model, &cfg.optimization.optimizer_options, &run)?;

    let summary = model.evaluate(cfg.optimization.violation_tolerance);
    let coordinates: Vec<[f64; 3]> = {
        let arr = model.coordinates();
        (0..arr.nrows()).map(|i| [arr[[i, 0]], arr[[i, 1]], arr[[i, 2]]]).collect()
    };

    let res = StructResult { struct_id, coordinates, summary, stats };
    res.write(&result_file(tmp_dir, prefix, struct_id))?;
    std::fs::write(&ready, b"")?;
    Ok(())
}

pub fn modeling_task(struct_id: usize, cfg: &Config, tmp_dir: &Path) -> Result<()> {
    optimize_structure(struct_id, cfg, tmp_dir, "mstep", true)
}

pub struct ModelingStep {
    reduce: StructGenReduce,
    n_struct: usize,
}

impl ModelingStep {
    pub fn new() -> Self {
        Self { reduce: StructGenReduce::new("mstep"), n_struct: 0 }
    }
}

impl Default for ModelingStep {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Step for ModelingStep {
    fn name(&self, cfg: &Config) -> String {
        let mut extras = Vec::new();
        if let Some(hic) = &cfg.runtime.hic {
            if let Some(s) = hic.intra_sigma {
                extras.push(format!("sigma={:.2}%", s * 100.0));
            }
        }
        extras.push(format!("iter={}", cfg.runtime.opt_iter));
        format!("ModelingStep ({})", extras.join(", "))
    }

    fn task(&self) -> NamedTask {
        NamedTask { key: "modeling", func: modeling_task }
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
        &["sres", "ready", "job", "out"]
    }

    fn keep_temporary_files(&self, cfg: &Config) -> bool {
        cfg.optimization.keep_temporary_files
    }
}
