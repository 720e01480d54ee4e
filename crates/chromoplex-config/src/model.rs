//! Configuration schema structs.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::runtime::RuntimeState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub model: ModelConfig,
    #[serde(default)]
    pub restraints: RestraintsConfig,
    pub optimization: OptimizationConfig,
    #[serde(default)]
    pub parallel: ParallelConfig,
    pub parameters: ParametersConfig,
    #[serde(default)]
    pub runtime: RuntimeState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub population_size: usize,
    /// Initial placement radius for the random init; defaults to the
    /// envelope radius when absent.
    #[serde(default)]
    pub init_radius: Option<f64>,
    #[serde(default)]
    pub restraints: ModelRestraints,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelRestraints {
    #[serde(default)]
    pub envelope: EnvelopeConfig,
    #[serde(default)]
    pub excluded: ExcludedConfig,
    #[serde(default)]
    pub polymer: PolymerConfig,
    /// Optional nuclear bodies that beads are pushed out of.
    #[serde(default)]
    pub nucleolus: Vec<BodyConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeShape {
    Sphere,
    Ellipsoid,
    ExpMap,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeConfig {
    #[serde(default = "default_shape")]
    pub nucleus_shape: EnvelopeShape,
    #[serde(default = "default_nucleus_radius")]
    pub nucleus_radius: f64,
    #[serde(default = "default_semiaxes")]
    pub nucleus_semiaxes: [f64; 3],
    /// Voxel occupancy map, required for the `exp_map` shape.
    #[serde(default)]
    pub input_map: Option<PathBuf>,
    #[serde(default = "default_one")]
    pub nucleus_kspring: f64,
}

impl Default for EnvelopeConfig {
    fn default() -> Self {
        Self {
            nucleus_shape: default_shape(),
            nucleus_radius: default_nucleus_radius(),
            nucleus_semiaxes: default_semiaxes(),
            input_map: None,
            nucleus_kspring: default_one(),
        }
    }
}

impl EnvelopeConfig {
    /// Envelope semiaxes regardless of shape (a sphere has equal axes).
    pub fn semiaxes(&self) -> [f64; 3] {
        match self.nucleus_shape {
            EnvelopeShape::Sphere => [self.nucleus_radius; 3],
            _ => self.nucleus_semiaxes,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExcludedConfig {
    #[serde(default = "default_one")]
    pub evfactor: f64,
}

impl Default for ExcludedConfig {
    fn default() -> Self {
        Self { evfactor: default_one() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolymerBondsStyle {
    Simple,
    Hic,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolymerConfig {
    #[serde(default = "default_contact_range")]
    pub contact_range: f64,
    #[serde(default = "default_one")]
    pub polymer_kspring: f64,
    #[serde(default = "default_bonds_style")]
    pub polymer_bonds_style: PolymerBondsStyle,
}

impl Default for PolymerConfig {
    fn default() -> Self {
        Self {
            contact_range: default_contact_range(),
            polymer_kspring: default_one(),
            polymer_bonds_style: default_bonds_style(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BodyConfig {
    pub center: [f64; 3],
    pub radius: f64,
    #[serde(default = "default_one")]
    pub kspring: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestraintsConfig {
    #[serde(default, alias = "Hi-C")]
    pub hic: Option<HicConfig>,
    #[serde(default, alias = "DamID")]
    pub damid: Option<DamidConfig>,
    #[serde(default)]
    pub sprite: Option<SpriteConfig>,
    #[serde(default, alias = "FISH")]
    pub fish: Option<FishConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HicConfig {
    pub input_matrix: PathBuf,
    pub intra_sigma_list: Vec<f64>,
    pub inter_sigma_list: Vec<f64>,
    #[serde(default = "default_contact_range")]
    pub contact_range: f64,
    #[serde(default = "default_one")]
    pub contact_kspring: f64,
    #[serde(default = "default_hic_batch")]
    pub batch_size: usize,
    #[serde(default = "default_actdist_dir")]
    pub tmp_dir: PathBuf,
    #[serde(default)]
    pub keep_temporary_files: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DamidConfig {
    pub input_profile: PathBuf,
    pub sigma_list: Vec<f64>,
    #[serde(default = "default_damid_contact_range")]
    pub contact_range: f64,
    #[serde(default = "default_one")]
    pub kspring: f64,
    #[serde(default = "default_damid_batch")]
    pub batch_size: usize,
    #[serde(default = "default_damid_dir")]
    pub tmp_dir: PathBuf,
    #[serde(default)]
    pub keep_temporary_files: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpriteConfig {
    pub clusters: PathBuf,
    pub volume_fraction: f64,
    #[serde(default = "default_sprite_assignment")]
    pub assignment_file: PathBuf,
    #[serde(default = "default_sprite_batch")]
    pub batch_size: usize,
    #[serde(default = "default_keep_best")]
    pub keep_best: usize,
    #[serde(default = "default_max_chrom")]
    pub max_chrom_in_cluster: usize,
    #[serde(default = "default_radius_kt")]
    pub radius_kt: f64,
    #[serde(default = "default_one")]
    pub kspring: f64,
    #[serde(default = "default_sprite_dir")]
    pub tmp_dir: PathBuf,
    #[serde(default)]
    pub keep_temporary_files: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FishConfig {
    pub input_fish: PathBuf,
    pub tol_list: Vec<f64>,
    /// Restraint selector: `r`/`R` radial min/max, `p`/`P` pair min/max.
    #[serde(default = "default_fish_rtype")]
    pub rtype: String,
    #[serde(default = "default_one")]
    pub kspring: f64,
    #[serde(default = "default_fish_batch")]
    pub batch_size: usize,
    #[serde(default = "default_fish_dir")]
    pub tmp_dir: PathBuf,
    #[serde(default)]
    pub keep_temporary_files: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationConfig {
    pub structure_output: PathBuf,
    #[serde(default = "default_opt_tmp_dir")]
    pub tmp_dir: PathBuf,
    #[serde(default = "default_kernel")]
    pub kernel: String,
    #[serde(default)]
    pub kernel_opts: serde_json::Value,
    #[serde(default)]
    pub optimizer_options: OptimizerOptions,
    #[serde(default = "default_violation_tolerance")]
    pub violation_tolerance: f64,
    #[serde(default = "default_max_violations")]
    pub max_violations: f64,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default)]
    pub keep_temporary_files: bool,
    #[serde(default)]
    pub keep_intermediate_structures: bool,
    #[serde(default)]
    pub clean_restart: bool,
    #[serde(default)]
    pub random_shuffling: bool,
}

/// Minimizer options forwarded to the kernel adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerOptions {
    #[serde(default = "default_mdsteps")]
    pub mdsteps: u32,
    #[serde(default = "default_timestep")]
    pub timestep: f64,
    #[serde(default = "default_tstart")]
    pub tstart: f64,
    #[serde(default = "default_tstop")]
    pub tstop: f64,
    #[serde(default = "default_damp")]
    pub damp: f64,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_max_velocity")]
    pub max_velocity: f64,
    #[serde(default = "default_etol")]
    pub etol: f64,
    #[serde(default = "default_ftol")]
    pub ftol: f64,
    #[serde(default = "default_max_cg_iter")]
    pub max_cg_iter: u32,
    #[serde(default = "default_thermo")]
    pub thermo: u32,
    /// Optional (temperature, steps) annealing stages run before the main MD.
    #[serde(default)]
    pub annealing: Vec<(f64, u32)>,
    #[serde(default)]
    pub ev_start: f64,
    #[serde(default)]
    pub ev_stop: f64,
    #[serde(default)]
    pub ev_step: u32,
    /// Wall-clock cap for one structure optimization, seconds. Zero disables.
    #[serde(default)]
    pub max_wall_time: u64,
}

impl Default for OptimizerOptions {
    fn default() -> Self {
        Self {
            mdsteps: default_mdsteps(),
            timestep: default_timestep(),
            tstart: default_tstart(),
            tstop: default_tstop(),
            damp: default_damp(),
            seed: default_seed(),
            max_velocity: default_max_velocity(),
            etol: default_etol(),
            ftol: default_ftol(),
            max_cg_iter: default_max_cg_iter(),
            thermo: default_thermo(),
            annealing: Vec::new(),
            ev_start: 0.0,
            ev_stop: 0.0,
            ev_step: 0,
            max_wall_time: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ControllerKind {
    Serial,
    WorkerCluster,
    Batch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelConfig {
    #[serde(default = "default_controller")]
    pub controller: ControllerKind,
    #[serde(default)]
    pub controller_options: ControllerOptions,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self { controller: default_controller(), controller_options: ControllerOptions::default() }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerOptions {
    #[serde(default, alias = "worker-cluster")]
    pub worker_cluster: WorkerClusterOptions,
    #[serde(default)]
    pub batch: BatchOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerClusterOptions {
    /// Worker count; zero means one per available CPU.
    #[serde(default)]
    pub workers: usize,
    /// Per-task wall clock limit in seconds. Zero disables.
    #[serde(default)]
    pub task_timeout: u64,
}

impl Default for WorkerClusterOptions {
    fn default() -> Self {
        Self { workers: 0, task_timeout: 0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchOptions {
    #[serde(default = "default_max_tasks")]
    pub max_tasks: usize,
    #[serde(default = "default_simultaneous_tasks")]
    pub simultaneous_tasks: usize,
    #[serde(default = "default_mem")]
    pub mem: String,
    #[serde(default = "default_walltime")]
    pub walltime: String,
    #[serde(default)]
    pub template: Option<PathBuf>,
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            max_tasks: default_max_tasks(),
            simultaneous_tasks: default_simultaneous_tasks(),
            mem: default_mem(),
            walltime: default_walltime(),
            template: None,
            poll_interval: default_poll_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParametersConfig {
    pub workdir: PathBuf,
    #[serde(default = "default_tmp_dir")]
    pub tmp_dir: PathBuf,
    #[serde(default)]
    pub log: Option<PathBuf>,
    #[serde(default = "default_step_db")]
    pub step_db: PathBuf,
}

fn default_shape() -> EnvelopeShape {
    EnvelopeShape::Sphere
}
fn default_nucleus_radius() -> f64 {
    5000.0
}
fn default_semiaxes() -> [f64; 3] {
    [5000.0, 5000.0, 5000.0]
}
fn default_one() -> f64 {
    1.0
}
fn default_contact_range() -> f64 {
    2.0
}
fn default_damid_contact_range() -> f64 {
    0.05
}
fn default_bonds_style() -> PolymerBondsStyle {
    PolymerBondsStyle::Simple
}
fn default_hic_batch() -> usize {
    1000
}
fn default_damid_batch() -> usize {
    100
}
fn default_sprite_batch() -> usize {
    150
}
fn default_fish_batch() -> usize {
    100
}
fn default_keep_best() -> usize {
    50
}
fn default_max_chrom() -> usize {
    6
}
fn default_radius_kt() -> f64 {
    100.0
}
fn default_fish_rtype() -> String {
    "rRpP".to_string()
}
fn default_actdist_dir() -> PathBuf {
    PathBuf::from("actdist")
}
fn default_damid_dir() -> PathBuf {
    PathBuf::from("damid_actdist")
}
fn default_sprite_dir() -> PathBuf {
    PathBuf::from("sprite")
}
fn default_fish_dir() -> PathBuf {
    PathBuf::from("fish_assignment")
}
fn default_sprite_assignment() -> PathBuf {
    PathBuf::from("sprite_assignment.cpxd")
}
fn default_opt_tmp_dir() -> PathBuf {
    PathBuf::from("opt")
}
fn default_kernel() -> String {
    "native".to_string()
}
fn default_violation_tolerance() -> f64 {
    0.05
}
fn default_max_violations() -> f64 {
    0.01
}
fn default_max_iterations() -> u32 {
    10
}
fn default_mdsteps() -> u32 {
    20000
}
fn default_timestep() -> f64 {
    0.25
}
fn default_tstart() -> f64 {
    20.0
}
fn default_tstop() -> f64 {
    1.0
}
fn default_damp() -> f64 {
    50.0
}
fn default_seed() -> u64 {
    6_1953_9105
}
fn default_max_velocity() -> f64 {
    5.0
}
fn default_etol() -> f64 {
    1e-4
}
fn default_ftol() -> f64 {
    1e-6
}
fn default_max_cg_iter() -> u32 {
    500
}
fn default_thermo() -> u32 {
    1000
}
fn default_controller() -> ControllerKind {
    ControllerKind::Serial
}
fn default_max_tasks() -> usize {
    4000
}
fn default_simultaneous_tasks() -> usize {
    430
}
fn default_mem() -> String {
    "2GB".to_string()
}
fn default_walltime() -> String {
    "6:00:00".to_string()
}
fn default_poll_interval() -> u64 {
    5
}
fn default_tmp_dir() -> PathBuf {
    PathBuf::from("tmp")
}
fn default_step_db() -> PathBuf {
    PathBuf::from("stepdb.sqlite")
}
