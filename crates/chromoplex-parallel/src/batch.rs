//! Batch-scheduler controller.
//!
//! Arguments are split into at most `max_tasks` batches. Each batch becomes
//! a job script that re-invokes this binary's `worker` subcommand with the
//! serialized payload; workers touch a `.complete` file on success, and the
//! submitting side polls the scheduler queue plus the completion files,
//! keeping at most `simultaneous_tasks` jobs in flight.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use chromoplex_common::{Error, Result};
use chromoplex_config::{BatchOptions, Config};

use crate::controller::{NamedTask, ParallelController, TaskFn};

const BASE_TEMPLATE: &str = r#"#!/bin/bash
#SBATCH --ntasks=1
#SBATCH --mem-per-cpu={{mem}}
#SBATCH --time={{walltime}}
#SBATCH --job-name={{jname}}
#SBATCH --output={{out}}
#SBATCH --error={{err}}

umask 002

{{exe}} worker --payload {{payload}} --index {{i}}
"#;

/// Everything a worker process needs to run one batch.
#[derive(Debug, Serialize, Deserialize)]
pub struct BatchPayload {
    pub task_key: String,
    pub config: Config,
    pub tmp_dir: PathBuf,
    pub out_dir: PathBuf,
    pub batches: Vec<Vec<usize>>,
}

/// Execute one batch from a deserialized payload. Called by the `worker`
/// subcommand after resolving `task_key` through the step registry.
pub fn run_batch_index(payload: &BatchPayload, index: usize, func: TaskFn) -> Result<()> {
    let batch = payload
        .batches
        .get(index)
        .ok_or_else(|| Error::Parallel(format!("batch index {} out of range", index)))?;
    for &arg in batch {
        func(arg, &payload.config, &payload.tmp_dir)?;
    }
    std::fs::write(payload.out_dir.join(format!("{}.complete", index)), b"")?;
    Ok(())
}

pub struct BatchController {
    opts: BatchOptions,
}

impl BatchController {
    pub fn new(opts: &BatchOptions) -> Self {
        Self { opts: opts.clone() }
    }

    fn template(&self) -> Result<String> {
        let raw = match &self.opts.template {
            Some(path) => std::fs::read_to_string(path)
                .map_err(|e| Error::Config(format!("cannot read job template: {}", e)))?,
            None => BASE_TEMPLATE.to_string(),
        };
        Ok(raw
            .replace("{{mem}}", &self.opts.mem)
            .replace("{{walltime}}", &self.opts.walltime))
    }

    fn send_job(&self, template: &str, out_dir: &Path, payload: &Path, i: usize) -> Result<String> {
        let exe = std::env::current_exe()
            .map_err(|e| Error::Parallel(format!("cannot locate own executable: {}", e)))?;
        let script = template
            .replace("{{jname}}", &format!("cpx{}", i))
            .replace("{{out}}", &out_dir.join(format!("{}.out", i)).display().to_string())
            .replace("{{err}}", &out_dir.join(format!("{}.err", i)).display().to_string())
            .replace("{{exe}}", &exe.display().to_string())
            .replace("{{payload}}", &payload.display().to_string())
            .replace("{{i}}", &i.to_string());
        let script_path = out_dir.join(format!("{}.job", i));
        std::fs::write(&script_path, script)?;

        let output = std::process::Command::new("sbatch")
            .arg(&script_path)
            .output()
            .map_err(|e| Error::Parallel(format!("cannot run sbatch: {}", e)))?;
        if !output.status.success() {
            return Err(Error::Parallel(format!(
                "sbatch failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        // sbatch prints "Submitted batch job <id>"
        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout
            .split_whitespace()
            .nth(3)
            .map(|s| s.to_string())
            .ok_or_else(|| Error::Parallel(format!("unexpected sbatch output: {}", stdout)))
    }

    fn job_was_successful(&self, out_dir: &Path, i: usize) -> bool {
        out_dir.join(format!("{}.complete", i)).is_file()
    }

    /// A job is finished when the queue no longer reports it; that is a
    /// success only if the completion file exists.
    fn job_is_completed(&self, out_dir: &Path, i: usize, job_id: &str) -> Result<bool> {
        let output = std::process::Command::new("squeue").args(["-j", job_id]).output();
        let queued = match output {
            Ok(out) if out.status.success() => {
                let text = String::from_utf8_lossy(&out.stdout).to_string();
                let mut lines = text.lines();
                let (keys, vals) = (lines.next(), lines.next());
                match (keys, vals) {
                    (Some(keys), Some(vals)) => {
                        let kv: HashMap<&str, &str> =
                            keys.split_whitespace().zip(vals.split_whitespace()).collect();
                        kv.get("ST").map(|&st| st != "CD").unwrap_or(false)
                    }
                    _ => false,
                }
            }
            _ => false,
        };
        if queued {
            return Ok(false);
        }
        if !self.job_was_successful(out_dir, i) {
            return Err(Error::Parallel(format!(
                "remote batch error; see {}",
                out_dir.join(format!("{}.err", i)).display()
            )));
        }
        Ok(true)
    }
}

/// Split a sequence into at most `n` contiguous, evenly-sized chunks.
pub(crate) fn split_evenly(args: &[usize], n: usize) -> Vec<Vec<usize>> {
    if args.is_empty() {
        return Vec::new();
    }
    let n = n.clamp(1, args.len());
    let mut k = args.len() / n;
    if args.len() % n != 0 {
        k += 1;
    }
    args.chunks(k).map(|c| c.to_vec()).collect()
}

#[async_trait]
impl ParallelController for BatchController {
    async fn map(
        &self,
        task: NamedTask,
        args: Vec<usize>,
        cfg: Arc<Config>,
        tmp_dir: PathBuf,
    ) -> Result<()> {
        if args.is_empty() {
            return Ok(());
        }
        let uid = format!("batchc.{}", Uuid::new_v4());
        let out_dir = tmp_dir.join(&uid);
        std::fs::create_dir_all(&out_dir)?;

        let batches = split_evenly(&args, self.opts.max_tasks);
        let n_jobs = batches.len();
        info!(task = task.key, n_jobs, "dispatching batches to the scheduler");

        let payload = BatchPayload {
            task_key: task.key.to_string(),
            config: (*cfg).clone(),
            tmp_dir: tmp_dir.clone(),
            out_dir: out_dir.clone(),
            batches,
        };
        let payload_path = out_dir.join("payload.json");
        std::fs::write(&payload_path, serde_json::to_vec(&payload)?)?;

        let template = self.template()?;
        let mut to_send: Vec<usize> = (0..n_jobs).rev().collect();
        let mut in_flight: HashMap<usize, String> = HashMap::new();
        let mut completed = 0usize;

        while completed < n_jobs {
            let mut finished: Vec<usize> = Vec::new();
            for (&i, job_id) in &in_flight {
                if self.job_is_completed(&out_dir, i, job_id)? {
                    finished.push(i);
                }
            }
            for i in finished {
                in_flight.remove(&i);
                completed += 1;
                debug!(batch = i, completed, n_jobs, "batch finished");
            }
            while in_flight.len() < self.opts.simultaneous_tasks {
                let Some(i) = to_send.pop() else { break };
                let job_id = self.send_job(&template, &out_dir, &payload_path, i)?;
                in_flight.insert(i, job_id);
            }
            if completed < n_jobs {
                tokio::time::sleep(std::time::Duration::from_secs(self.opts.poll_interval)).await;
            }
        }

        if let Err(e) = std::fs::remove_dir_all(&out_dir) {
            warn!(dir = %out_dir.display(), "cannot remove batch directory: {}", e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{run_batch_index, split_evenly, BatchPayload};
    use chromoplex_config::Config;

    fn touch_task(
        arg: usize,
        _cfg: &Config,
        tmp_dir: &std::path::Path,
    ) -> chromoplex_common::Result<()> {
        std::fs::write(tmp_dir.join(format!("{}.touched", arg)), b"")?;
        Ok(())
    }

    #[test]
    fn worker_executes_batch_and_touches_completion_file() {
        let dir = tempfile::tempdir().unwrap();
        let cfg: Config = serde_json::from_value(serde_json::json!({
            "model": { "population_size": 1 },
            "optimization": { "structure_output": "pop.cps" },
            "parameters": { "workdir": "." }
        }))
        .unwrap();
        let payload = BatchPayload {
            task_key: "touch".into(),
            config: cfg,
            tmp_dir: dir.path().to_path_buf(),
            out_dir: dir.path().to_path_buf(),
            batches: vec![vec![0, 1], vec![2]],
        };
        run_batch_index(&payload, 1, touch_task).unwrap();
        assert!(dir.path().join("2.touched").is_file());
        assert!(!dir.path().join("0.touched").exists());
        assert!(dir.path().join("1.complete").is_file());

        assert!(run_batch_index(&payload, 5, touch_task).is_err());
    }

    #[test]
    fn split_evenly_respects_max_tasks() {
        let args: Vec<usize> = (0..10).collect();
        let batches = split_evenly(&args, 3);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches.iter().map(|b| b.len()).sum::<usize>(), 10);
        let flat: Vec<usize> = batches.concat();
        assert_eq!(flat, args);
    }

    #[test]
    fn split_evenly_with_more_slots_than_args() {
        let args: Vec<usize> = (0..3).collect();
        let batches = split_evenly(&args, 10);
        assert_eq!(batches.len(), 3);
    }

    #[test]
    fn empty_args_yield_no_batches() {
        assert!(split_evenly(&[], 5).is_empty());
    }
}
