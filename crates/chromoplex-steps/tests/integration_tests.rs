//! Integration tests for the step protocol and the pipeline driver.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use chromoplex_common::{Bead, Error, Genome, GenomeIndex, Result};
use chromoplex_config::Config;
use chromoplex_parallel::{create_controller, NamedTask};
use chromoplex_steps::{run_step, Step, StepContext, StepLog};
use chromoplex_store::{Layout, PopulationFile};

// ---------------------------------------------------------------------
// fixtures
// ---------------------------------------------------------------------

fn write_config(dir: &Path, extra_restraints: &str) -> PathBuf {
    let json = format!(
        r#"{{
            "model": {{
                "population_size": 1,
                "restraints": {{
                    "envelope": {{ "nucleus_shape": "sphere", "nucleus_radius": 1000.0 }},
                    "polymer": {{ "contact_range": 2.0 }}
                }}
            }},
            "restraints": {{ {extra} }},
            "optimization": {{
                "structure_output": "pop.cps",
                "violation_tolerance": 0.05,
                "max_violations": 0.01,
                "max_iterations": 5,
                "optimizer_options": {{
                    "mdsteps": 300,
                    "timestep": 0.1,
                    "tstart": 1.0,
                    "tstop": 0.01,
                    "damp": 5.0,
                    "max_velocity": 50.0,
                    "max_cg_iter": 2000,
                    "etol": 1e-10,
                    "ftol": 1e-8,
                    "seed": 4242
                }}
            }},
            "parameters": {{ "workdir": "{workdir}" }}
        }}"#,
        extra = extra_restraints,
        workdir = dir.display()
    );
    let path = dir.join("config.json");
    std::fs::write(&path, json).unwrap();
    path
}

/// Two beads of radius 100 on one haploid chromosome, one structure.
fn two_bead_population(cfg: &Config) {
    let beads = vec![
        Bead { id: 0, chrom: 0, start: 0, end: 100, copy: 0, radius: 100.0 },
        Bead { id: 1, chrom: 0, start: 100, end: 200, copy: 0, radius: 100.0 },
    ];
    let index = GenomeIndex::new(&beads).unwrap();
    let mut pop = PopulationFile::create(
        &cfg.optimization.structure_output,
        &index,
        &Genome::default(),
        &[100.0; 2],
        1,
        "{}",
        Layout::BeadMajor,
    )
    .unwrap();
    let mut crd = ndarray::Array3::zeros((2, 1, 3));
    crd[[0, 0, 0]] = -500.0;
    crd[[1, 0, 0]] = 500.0;
    pop.set_coordinates(&crd).unwrap();
}

/// Diploid chromosome with two loci, two structures.
fn diploid_population(cfg: &Config) {
    let beads = vec![
        Bead { id: 0, chrom: 0, start: 0, end: 100, copy: 0, radius: 100.0 },
        Bead { id: 1, chrom: 0, start: 100, end: 200, copy: 0, radius: 100.0 },
        Bead { id: 2, chrom: 0, start: 0, end: 100, copy: 1, radius: 100.0 },
        Bead { id: 3, chrom: 0, start: 100, end: 200, copy: 1, radius: 100.0 },
    ];
    let index = GenomeIndex::new(&beads).unwrap();
    PopulationFile::create(
        &cfg.optimization.structure_output,
        &index,
        &Genome::default(),
        &[100.0; 4],
        2,
        "{}",
        Layout::BeadMajor,
    )
    .unwrap();
}

async fn make_ctx(cfg: Config) -> StepContext {
    let log = StepLog::open(&cfg.parameters.step_db).await.unwrap();
    let controller = create_controller(&cfg);
    StepContext { cfg, controller, log }
}

// ---------------------------------------------------------------------
// step protocol
// ---------------------------------------------------------------------

fn marker_task(arg: usize, _cfg: &Config, tmp_dir: &Path) -> Result<()> {
    use std::io::Write;
    let mut f = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(tmp_dir.join(format!("task_{}.log", arg)))?;
    writeln!(f, "ran")?;
    Ok(())
}

struct ScriptedStep {
    args: Vec<usize>,
    fail_reduce: bool,
    reduce_runs: std::sync::Arc<std::sync::atomic::AtomicUsize>,
}

#[async_trait]
impl Step for ScriptedStep {
    fn name(&self, _cfg: &Config) -> String {
        "ScriptedStep".to_string()
    }

    fn task(&self) -> NamedTask {
        NamedTask { key: "test_marker", func: marker_task }
    }

    async fn setup(&mut self, cfg: &mut Config) -> Result<Vec<usize>> {
        std::fs::create_dir_all(&cfg.parameters.tmp_dir)?;
        Ok(self.args.clone())
    }

    async fn reduce(&mut self, _cfg: &mut Config) -> Result<()> {
        self.reduce_runs.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if self.fail_reduce {
            return Err(Error::Assignment("scripted reduce failure".into()));
        }
        Ok(())
    }

    async fn cleanup(&mut self, _cfg: &mut Config) -> Result<()> {
        Ok(())
    }
}

fn task_run_count(tmp_dir: &Path, arg: usize) -> usize {
    std::fs::read_to_string(tmp_dir.join(format!("task_{}.log", arg)))
        .map(|s| s.lines().count())
        .unwrap_or(0)
}

#[tokio::test]
async fn empty_argument_step_completes_without_tasks() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = Config::load(&write_config(dir.path(), "")).unwrap();
    let mut ctx = make_ctx(cfg).await;

    let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let mut step =
        ScriptedStep { args: vec![], fail_reduce: false, reduce_runs: counter.clone() };
    run_step(&mut step, &mut ctx).await.unwrap();

    let history = ctx.log.full_history().await.unwrap();
    let statuses: Vec<&str> = history.iter().map(|r| r.status.as_str()).collect();
    assert_eq!(statuses, vec!["entry", "setup", "map", "mapped", "reduced", "cleanup", "completed"]);
}

#[tokio::test]
async fn restart_resumes_at_the_earliest_missing_substep() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = Config::load(&write_config(dir.path(), "")).unwrap();
    let tmp_dir = cfg.parameters.tmp_dir.clone();
    let mut ctx = make_ctx(cfg).await;

    // first attempt: map succeeds, reduce fails after `mapped` is recorded
    let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let mut failing =
        ScriptedStep { args: vec![0, 1, 2], fail_reduce: true, reduce_runs: counter.clone() };
    let err = run_step(&mut failing, &mut ctx).await.unwrap_err();
    assert!(matches!(err, Error::StepFailed { .. }));
    for arg in 0..3 {
        assert_eq!(task_run_count(&tmp_dir, arg), 1);
    }

    // restart with the same step number: the map phase must not rerun
    ctx.cfg.runtime.step_no -= 1;
    let mut resumed =
        ScriptedStep { args: vec![0, 1, 2], fail_reduce: false, reduce_runs: counter.clone() };
    run_step(&mut resumed, &mut ctx).await.unwrap();
    for arg in 0..3 {
        assert_eq!(task_run_count(&tmp_dir, arg), 1, "map phase ran twice");
    }
    assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 2);

    // a third run skips the whole step
    ctx.cfg.runtime.step_no -= 1;
    let mut skipped =
        ScriptedStep { args: vec![0, 1, 2], fail_reduce: false, reduce_runs: counter.clone() };
    run_step(&mut skipped, &mut ctx).await.unwrap();
    assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 2, "skipped step ran reduce");
}

#[tokio::test]
async fn failed_steps_leave_a_failed_row() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = Config::load(&write_config(dir.path(), "")).unwrap();
    let mut ctx = make_ctx(cfg).await;

    let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let mut step = ScriptedStep { args: vec![0], fail_reduce: true, reduce_runs: counter };
    let _ = run_step(&mut step, &mut ctx).await;

    let history = ctx.log.full_history().await.unwrap();
    let failed: Vec<_> = history.iter().filter(|r| r.status == "failed").collect();
    assert_eq!(failed.len(), 1);
    let data = failed[0].data.as_ref().unwrap();
    assert!(data["exception"].as_str().unwrap().contains("scripted reduce failure"));
}

// ---------------------------------------------------------------------
// end-to-end scenarios
// ---------------------------------------------------------------------

#[tokio::test]
async fn two_bead_dry_run_relaxes_into_bond_and_envelope() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = Config::load(&write_config(dir.path(), "")).unwrap();
    two_bead_population(&cfg);

    chromoplex_steps::pipeline::run(cfg.clone()).await.unwrap();

    let mut pop = PopulationFile::open(&cfg.optimization.structure_output).unwrap();
    assert_eq!(pop.violation(), 0.0);
    let crd = pop.get_struct_crd(0).unwrap();
    let d = ((crd[[0, 0]] - crd[[1, 0]]).powi(2)
        + (crd[[0, 1]] - crd[[1, 1]]).powi(2)
        + (crd[[0, 2]] - crd[[1, 2]]).powi(2))
    .sqrt();
    assert!(d <= 400.0 * 1.05, "polymer bond violated: {}", d);
    for b in 0..2 {
        let r = (crd[[b, 0]].powi(2) + crd[[b, 1]].powi(2) + crd[[b, 2]].powi(2)).sqrt();
        assert!(r <= 900.0 * 1.05, "bead escaped the envelope: {}", r);
    }
}

fn hic_restraints_json(dir: &Path) -> String {
    // full-probability contact between the two loci
    let matrix_path = dir.join("hic.cpxd");
    let mut m = chromoplex_assign::matrix::ContactMatrix::new(2);
    m.push(0, 1, 1.0);
    m.write(&matrix_path).unwrap();
    format!(
        r#""hic": {{
            "input_matrix": "{}",
            "intra_sigma_list": [0.5, 0.2],
            "inter_sigma_list": [0.5, 0.2]
        }}"#,
        matrix_path.display()
    )
}

#[tokio::test]
async fn sigma_schedule_runs_one_modeling_step_per_sigma() {
    let dir = tempfile::tempdir().unwrap();
    let restraints = hic_restraints_json(dir.path());
    let config_path = write_config(dir.path(), &restraints);
    let mut cfg = Config::load(&config_path).unwrap();
    cfg.model.population_size = 2;
    diploid_population(&cfg);

    chromoplex_steps::pipeline::run(cfg.clone()).await.unwrap();

    let log = StepLog::open(&cfg.parameters.step_db).await.unwrap();
    let history = log.full_history().await.unwrap();
    let modeling_completed = history
        .iter()
        .filter(|r| r.status == "completed" && r.name.starts_with("ModelingStep"))
        .count();
    let actdist_completed = history
        .iter()
        .filter(|r| r.status == "completed" && r.name.starts_with("ActivationDistanceStep"))
        .count();
    assert_eq!(modeling_completed, 2, "one modeling step per sigma");
    assert_eq!(actdist_completed, 2, "one assignment step per sigma");

    // the activation table was published and recorded in the runtime
    let actdist = cfg.restraints.hic.as_ref().unwrap().tmp_dir.join("actdist.cpxd");
    assert!(actdist.is_file());

    let pop = PopulationFile::open(&cfg.optimization.structure_output).unwrap();
    assert!(pop.violation() <= 0.01);
}

#[tokio::test]
async fn damid_with_zero_signal_emits_an_empty_assignment() {
    let dir = tempfile::tempdir().unwrap();
    let profile_path = dir.path().join("damid_profile.txt");
    // both loci well below every sigma in the schedule
    std::fs::write(&profile_path, "0.05\n0.10\n").unwrap();
    let restraints = format!(
        r#""damid": {{
            "input_profile": "{}",
            "sigma_list": [0.8, 0.5]
        }}"#,
        profile_path.display()
    );
    let config_path = write_config(dir.path(), &restraints);
    let mut cfg = Config::load(&config_path).unwrap();
    cfg.model.population_size = 2;
    diploid_population(&cfg);

    chromoplex_steps::pipeline::run(cfg.clone()).await.unwrap();

    let actdist = cfg.restraints.damid.as_ref().unwrap().tmp_dir.join("damid_actdist.cpxd");
    assert!(actdist.is_file());
    let rows = chromoplex_assign::damid::read_damid_actdist(&actdist).unwrap();
    assert!(rows.is_empty(), "zero-signal profile produced activation rows");
}

#[tokio::test]
async fn rerunning_a_finished_pipeline_changes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = Config::load(&write_config(dir.path(), "")).unwrap();
    two_bead_population(&cfg);

    chromoplex_steps::pipeline::run(cfg.clone()).await.unwrap();
    let bytes_first = std::fs::read(&cfg.optimization.structure_output).unwrap();
    let log = StepLog::open(&cfg.parameters.step_db).await.unwrap();
    let rows_first = log.full_history().await.unwrap().len();

    // same configuration, fresh process: every step is skipped
    let cfg2 = Config::load(&dir.path().join("config.json")).unwrap();
    chromoplex_steps::pipeline::run(cfg2.clone()).await.unwrap();

    let bytes_second = std::fs::read(&cfg2.optimization.structure_output).unwrap();
    assert_eq!(bytes_first, bytes_second, "published population changed on replay");
    let rows_second = log.full_history().await.unwrap().len();
    assert_eq!(rows_first, rows_second, "skipped steps appended log rows");
}

/// Delegates to a real modeling step but dies in `reduce`, emulating a
/// crash after the `mapped` substep was recorded.
struct CrashingModelingStep {
    inner: chromoplex_steps::steps::ModelingStep,
}

#[async_trait]
impl Step for CrashingModelingStep {
    fn name(&self, cfg: &Config) -> String {
        self.inner.name(cfg)
    }
    fn task(&self) -> NamedTask {
        self.inner.task()
    }
    async fn setup(&mut self, cfg: &mut Config) -> Result<Vec<usize>> {
        self.inner.setup(cfg).await
    }
    async fn before_map(&mut self, cfg: &mut Config) -> Result<()> {
        self.inner.before_map(cfg).await
    }
    async fn before_reduce(&mut self, cfg: &mut Config) -> Result<()> {
        self.inner.before_reduce(cfg).await
    }
    async fn reduce(&mut self, _cfg: &mut Config) -> Result<()> {
        Err(Error::Io(std::io::Error::new(std::io::ErrorKind::Other, "simulated crash")))
    }
    async fn cleanup(&mut self, cfg: &mut Config) -> Result<()> {
        self.inner.cleanup(cfg).await
    }
}

#[tokio::test]
async fn crash_after_mapped_resumes_to_the_same_population() {
    // reference: an uninterrupted run
    let ref_dir = tempfile::tempdir().unwrap();
    let ref_cfg = Config::load(&write_config(ref_dir.path(), "")).unwrap();
    two_bead_population(&ref_cfg);
    chromoplex_steps::pipeline::run(ref_cfg.clone()).await.unwrap();
    let mut ref_pop = PopulationFile::open(&ref_cfg.optimization.structure_output).unwrap();
    let ref_crd = ref_pop.coordinates().unwrap();

    // interrupted: init steps, then a modeling step that dies after `mapped`
    let dir = tempfile::tempdir().unwrap();
    let cfg = Config::load(&write_config(dir.path(), "")).unwrap();
    two_bead_population(&cfg);
    let mut ctx = make_ctx(cfg).await;

    let mut random = chromoplex_steps::steps::RandomInitStep::new();
    run_step(&mut random, &mut ctx).await.unwrap();
    let mut relax = chromoplex_steps::steps::RelaxInitStep::new();
    run_step(&mut relax, &mut ctx).await.unwrap();

    ctx.cfg.runtime.opt_iter = 0;
    let mut crashing =
        CrashingModelingStep { inner: chromoplex_steps::steps::ModelingStep::new() };
    let err = run_step(&mut crashing, &mut ctx).await.unwrap_err();
    assert!(matches!(err, Error::StepFailed { .. }));

    // restart: the log shows `mapped`, so the map phase is skipped and the
    // reduce streams the already-written results
    ctx.cfg.runtime.step_no -= 1;
    let mut resumed = chromoplex_steps::steps::ModelingStep::new();
    run_step(&mut resumed, &mut ctx).await.unwrap();

    let mut pop = PopulationFile::open(&ctx.cfg.optimization.structure_output).unwrap();
    assert_eq!(pop.coordinates().unwrap(), ref_crd, "resumed population diverged");
    assert_eq!(pop.violation(), ref_pop.violation());
}

#[tokio::test]
async fn missing_population_is_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = Config::load(&write_config(dir.path(), "")).unwrap();
    let err = chromoplex_steps::pipeline::run(cfg).await.unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}
