//! The step protocol.
//!
//! A step implements the overridable hooks; `run_step` is the fixed
//! execution protocol and is deliberately a free function so it cannot be
//! overridden. It records substep transitions into the durable log and, on
//! a restarted run, resumes at the earliest missing substep, merging the
//! stored runtime back into the live configuration.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info};

use chromoplex_common::{Error, Result};
use chromoplex_config::{Config, RuntimeState};
use chromoplex_parallel::{NamedTask, ParallelController};

use crate::steplog::StepLog;

/// Shared pipeline services handed to `run_step`.
pub struct StepContext {
    pub cfg: Config,
    pub controller: Arc<dyn ParallelController>,
    pub log: StepLog,
}

#[async_trait]
pub trait Step: Send {
    /// Display name; may carry the current sigma/iteration for logs.
    fn name(&self, cfg: &Config) -> String;

    /// The static worker function with its registry key.
    fn task(&self) -> NamedTask;

    /// Prepare inputs and return the argument list to map over.
    async fn setup(&mut self, cfg: &mut Config) -> Result<Vec<usize>>;

    /// Resources needed only when the map phase actually runs.
    async fn before_map(&mut self, _cfg: &mut Config) -> Result<()> {
        Ok(())
    }

    /// Resources needed only when the reduce phase actually runs.
    async fn before_reduce(&mut self, _cfg: &mut Config) -> Result<()> {
        Ok(())
    }

    async fn reduce(&mut self, _cfg: &mut Config) -> Result<()> {
        Ok(())
    }

    /// Temporary-file extensions removed by the default cleanup.
    fn tmp_extensions(&self) -> &'static [&'static str] {
        &[]
    }

    /// Scratch directory of this step.
    fn tmp_dir(&self, cfg: &Config) -> PathBuf {
        cfg.parameters.tmp_dir.clone()
    }

    fn keep_temporary_files(&self, _cfg: &Config) -> bool {
        false
    }

    /// Remove scratch files; overriding is rarely necessary.
    async fn cleanup(&mut self, cfg: &mut Config) -> Result<()> {
        if self.keep_temporary_files(cfg) {
            return Ok(());
        }
        let dir = self.tmp_dir(cfg);
        let extensions = self.tmp_extensions();
        if extensions.is_empty() || !dir.is_dir() {
            return Ok(());
        }
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            let matches = path
                .extension()
                .map(|e| extensions.iter().any(|x| e.eq_ignore_ascii_case(x.trim_start_matches('.'))))
                .unwrap_or(false);
            if matches {
                let _ = std::fs::remove_file(&path);
            }
        }
        Ok(())
    }

    /// Called instead of the hooks when the whole step is skipped on
    /// restart; fixes up runtime values that the hooks would have set.
    fn skip(&mut self, _cfg: &mut Config) -> Result<()> {
        Ok(())
    }
}

/// Unique id of a step occurrence: display name, step number and the
/// static-configuration hash, so a resumed run against an edited
/// configuration never replays stale records.
pub fn step_uid(name: &str, step_no: i64, static_hash: &str) -> String {
    let text = format!("{}:{}:{}", name, step_no, static_hash);
    blake3::hash(text.as_bytes()).to_hex()[..32].to_string()
}

/// Execute a step under the restart protocol. Not part of the `Step` trait
/// by design: the protocol is not overridable.
pub async fn run_step(step: &mut dyn Step, ctx: &mut StepContext) -> Result<()> {
    ctx.cfg.runtime.step_no += 1;
    let name = step.name(&ctx.cfg);
    let uid = step_uid(&name, ctx.cfg.runtime.step_no, &ctx.cfg.static_hash());
    ctx.cfg.runtime.step_hash = Some(uid.clone());

    let history = ctx.log.history(&uid).await?;
    let past: HashMap<String, Option<RuntimeState>> =
        history.iter().map(|r| (r.status.clone(), r.runtime())).collect();

    if let Some(runtime) = past.get("completed") {
        if let Some(runtime) = runtime {
            ctx.cfg.runtime.merge_from(runtime.clone());
        }
        info!(step = %name, "already completed, skipping");
        step.skip(&mut ctx.cfg)?;
        return Ok(());
    }

    let outcome = drive(step, ctx, &uid, &name, &past).await;
    if let Err(e) = &outcome {
        let data = serde_json::json!({ "exception": e.to_string() });
        ctx.log.record(&uid, &name, &ctx.cfg, "failed", Some(&data)).await?;
        error!(step = %name, "failed: {}", e);
        return Err(Error::StepFailed { step: name, traceback: e.to_string() });
    }
    outcome
}

async fn drive(
    step: &mut dyn Step,
    ctx: &mut StepContext,
    uid: &str,
    name: &str,
    past: &HashMap<String, Option<RuntimeState>>,
) -> Result<()> {
    info!(step = %name, "starting");
    ctx.log.record(uid, name, &ctx.cfg, "entry", None).await?;

    let args = step.setup(&mut ctx.cfg).await?;
    ctx.log.record(uid, name, &ctx.cfg, "setup", None).await?;

    if !past.contains_key("mapped") {
        step.before_map(&mut ctx.cfg).await?;
        info!(step = %name, n_tasks = args.len(), "mapping");
        ctx.log.record(uid, name, &ctx.cfg, "map", None).await?;
        ctx.controller
            .map(step.task(), args, Arc::new(ctx.cfg.clone()), step.tmp_dir(&ctx.cfg))
            .await?;
        ctx.log.record(uid, name, &ctx.cfg, "mapped", None).await?;
    } else if let Some(Some(runtime)) = past.get("mapped") {
        ctx.cfg.runtime.merge_from(runtime.clone());
        ctx.cfg.runtime.step_hash = Some(uid.to_string());
    }

    if !past.contains_key("reduced") {
        step.before_reduce(&mut ctx.cfg).await?;
        info!(step = %name, "reducing");
        step.reduce(&mut ctx.cfg).await?;
        ctx.log.record(uid, name, &ctx.cfg, "reduced", None).await?;
    } else if let Some(Some(runtime)) = past.get("reduced") {
        ctx.cfg.runtime.merge_from(runtime.clone());
        ctx.cfg.runtime.step_hash = Some(uid.to_string());
    }

    if !past.contains_key("cleanup") {
        step.cleanup(&mut ctx.cfg).await?;
        ctx.log.record(uid, name, &ctx.cfg, "cleanup", None).await?;
    } else if let Some(Some(runtime)) = past.get("cleanup") {
        ctx.cfg.runtime.merge_from(runtime.clone());
        ctx.cfg.runtime.step_hash = Some(uid.to_string());
    }

    ctx.cfg.runtime.step_hash = None;
    ctx.log.record(uid, name, &ctx.cfg, "completed", None).await?;
    info!(step = %name, "completed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::step_uid;

    #[test]
    fn uid_depends_on_name_number_and_static_config() {
        let a = step_uid("ModelingStep (iter=0)", 3, "abcd");
        assert_eq!(a.len(), 32);
        assert_eq!(a, step_uid("ModelingStep (iter=0)", 3, "abcd"));
        assert_ne!(a, step_uid("ModelingStep (iter=0)", 4, "abcd"));
        assert_ne!(a, step_uid("ModelingStep (iter=1)", 3, "abcd"));
        // an edited configuration invalidates prior records
        assert_ne!(a, step_uid("ModelingStep (iter=0)", 3, "dcba"));
    }
}
