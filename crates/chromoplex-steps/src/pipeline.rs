//! The outer optimization driver: initialization steps, then A/M
//! iterations under the decreasing sigma/tolerance schedule until the
//! violation score drops below the threshold on an exhausted schedule.

use std::sync::Arc;

use tracing::{info, warn};

use chromoplex_common::{Error, Result};
use chromoplex_config::Config;
use chromoplex_parallel::create_controller;
use chromoplex_store::PopulationFile;

use crate::step::{run_step, Step, StepContext};
use crate::steplog::StepLog;
use crate::steps::{
    DamidActdistStep, FishAssignStep, HicActdistStep, ModelingStep, RandomInitStep, RelaxInitStep,
    SpriteAssignStep,
};

/// Whether any modality still has schedule entries to consume after the
/// current ones converge.
fn advance_schedule(cfg: &mut Config) -> bool {
    let mut more = false;
    if let Some(rt) = cfg.runtime.hic.as_mut() {
        if !rt.intra_sigma_list.is_empty() && !rt.inter_sigma_list.is_empty() {
            rt.intra_sigma = None;
            rt.inter_sigma = None;
            more = true;
        }
    }
    if let Some(rt) = cfg.runtime.damid.as_mut() {
        if !rt.sigma_list.is_empty() {
            rt.sigma = None;
            more = true;
        }
    }
    if let Some(rt) = cfg.runtime.fish.as_mut() {
        if !rt.tol_list.is_empty() {
            rt.tol = None;
            more = true;
        }
    }
    more
}

/// Run the full pipeline to termination.
///
/// Exits successfully when the violation score is at most `max_violations`
/// with every schedule exhausted; fails with a convergence error when
/// `max_iterations` optimization iterations at one schedule point cannot
/// reach the threshold.
pub async fn run(mut cfg: Config) -> Result<()> {
    if !cfg.optimization.structure_output.is_file() {
        return Err(Error::Config(format!(
            "population file {} does not exist; run preprocessing first",
            cfg.optimization.structure_output.display()
        )));
    }
    std::fs::create_dir_all(&cfg.parameters.tmp_dir)?;

    let log = StepLog::open(&cfg.parameters.step_db).await?;
    let controller = create_controller(&cfg);
    let mut ctx = StepContext { cfg, controller: Arc::clone(&controller), log };

    // initialization: random territories, then relax under physics only
    let mut random = RandomInitStep::new();
    run_step(&mut random, &mut ctx).await?;
    let mut relax = RelaxInitStep::new();
    run_step(&mut relax, &mut ctx).await?;

    let max_violations = ctx.cfg.optimization.max_violations;
    let max_iterations = ctx.cfg.optimization.max_iterations;
    let mut opt_iter: u32 = 0;

    loop {
        ctx.cfg.runtime.opt_iter = opt_iter;

        // assignment steps for the configured modalities, then modeling
        let mut iter_steps: Vec<Box<dyn Step>> = Vec::new();
        if ctx.cfg.restraints.hic.is_some() {
            iter_steps.push(Box::new(HicActdistStep::prepare(&mut ctx.cfg)?));
        }
        if ctx.cfg.restraints.damid.is_some() {
            iter_steps.push(Box::new(DamidActdistStep::prepare(&mut ctx.cfg)?));
        }
        if ctx.cfg.restraints.fish.is_some() {
            iter_steps.push(Box::new(FishAssignStep::prepare(&mut ctx.cfg)?));
        }
        if ctx.cfg.restraints.sprite.is_some() {
            iter_steps.push(Box::new(SpriteAssignStep::new()));
        }
        iter_steps.push(Box::new(ModelingStep::new()));

        for step in iter_steps.iter_mut() {
            run_step(step.as_mut(), &mut ctx).await?;
        }

        let score = match ctx.cfg.runtime.violation_score {
            Some(v) => v,
            None => PopulationFile::open(&ctx.cfg.optimization.structure_output)?.violation(),
        };
        info!(score, opt_iter, "iteration finished");

        if score <= max_violations {
            opt_iter = 0;
            if !advance_schedule(&mut ctx.cfg) {
                info!("pipeline completed");
                return Ok(());
            }
            info!("advancing to the next schedule point");
        } else {
            opt_iter += 1;
            if opt_iter >= max_iterations {
                warn!(score, "maximum number of iterations reached");
                return Err(Error::Convergence { iterations: opt_iter, score });
            }
            info!(opt_iter, "violations above threshold, iterating again");
        }
    }
}
