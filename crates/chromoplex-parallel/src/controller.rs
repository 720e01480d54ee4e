//! Controller trait plus the serial and worker-pool backends.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info};

use chromoplex_common::{Error, Result};
use chromoplex_config::{Config, ControllerKind, WorkerClusterOptions};

/// The task function dispatched to workers. Its return value is ignored by
/// design: results travel through files so that restarts can re-use them.
pub type TaskFn = fn(usize, &Config, &std::path::Path) -> Result<()>;

/// A task function together with its registry key, so batch workers in a
/// fresh process can look the function up again.
#[derive(Clone, Copy)]
pub struct NamedTask {
    pub key: &'static str,
    pub func: TaskFn,
}

#[async_trait]
pub trait ParallelController: Send + Sync {
    /// Run `task` over every argument; returns when all have completed.
    async fn map(
        &self,
        task: NamedTask,
        args: Vec<usize>,
        cfg: Arc<Config>,
        tmp_dir: PathBuf,
    ) -> Result<()>;
}

/// In-order execution on the local machine.
#[derive(Default)]
pub struct SerialController;

#[async_trait]
impl ParallelController for SerialController {
    async fn map(
        &self,
        task: NamedTask,
        args: Vec<usize>,
        cfg: Arc<Config>,
        tmp_dir: PathBuf,
    ) -> Result<()> {
        debug!(task = task.key, n = args.len(), "serial map");
        for arg in args {
            let cfg = cfg.clone();
            let tmp = tmp_dir.clone();
            let func = task.func;
            tokio::task::spawn_blocking(move || func(arg, &cfg, &tmp))
                .await
                .map_err(|e| Error::Parallel(format!("task {} panicked: {}", arg, e)))??;
        }
        Ok(())
    }
}

/// Bounded pool of blocking workers in the current process.
pub struct WorkerPoolController {
    workers: usize,
    task_timeout: Option<std::time::Duration>,
}

impl WorkerPoolController {
    pub fn new(opts: &WorkerClusterOptions) -> Self {
        let workers = if opts.workers == 0 {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        } else {
            opts.workers
        };
        let task_timeout = if opts.task_timeout > 0 {
            Some(std::time::Duration::from_secs(opts.task_timeout))
        } else {
            None
        };
        Self { workers, task_timeout }
    }
}

#[async_trait]
impl ParallelController for WorkerPoolController {
    async fn map(
        &self,
        task: NamedTask,
        args: Vec<usize>,
        cfg: Arc<Config>,
        tmp_dir: PathBuf,
    ) -> Result<()> {
        info!(task = task.key, n = args.len(), workers = self.workers, "pool map");
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut set: JoinSet<(usize, Result<()>)> = JoinSet::new();

        for arg in args {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| Error::Parallel(e.to_string()))?;
            let cfg = cfg.clone();
            let tmp = tmp_dir.clone();
            let func = task.func;
            let timeout = self.task_timeout;
            set.spawn(async move {
                let _permit = permit;
                let work = tokio::task::spawn_blocking(move || func(arg, &cfg, &tmp));
                let outcome = match timeout {
                    Some(limit) => match tokio::time::timeout(limit, work).await {
                        Ok(joined) => joined,
                        Err(_) => {
                            return (
                                arg,
                                Err(Error::Parallel(format!(
                                    "task {} exceeded the {}s time limit",
                                    arg,
                                    limit.as_secs()
                                ))),
                            )
                        }
                    },
                    None => work.await,
                };
                let res = match outcome {
                    Ok(r) => r,
                    Err(e) => Err(Error::Parallel(format!("task {} panicked: {}", arg, e))),
                };
                (arg, res)
            });

            // surface failures early and abort the remaining work
            while let Some(done) = set.try_join_next() {
                check_join(done, &mut set)?;
            }
        }

        while let Some(done) = set.join_next().await {
            check_join(done, &mut set)?;
        }
        Ok(())
    }
}

fn check_join(
    done: std::result::Result<(usize, Result<()>), tokio::task::JoinError>,
    set: &mut JoinSet<(usize, Result<()>)>,
) -> Result<()> {
    match done {
        Ok((_, Ok(()))) => Ok(()),
        Ok((arg, Err(e))) => {
            set.abort_all();
            Err(Error::Parallel(format!("remote failure (task {}): {}", arg, e)))
        }
        Err(e) => {
            set.abort_all();
            Err(Error::Parallel(format!("worker join failure: {}", e)))
        }
    }
}

/// Instantiate the controller selected by the configuration.
pub fn create_controller(cfg: &Config) -> Arc<dyn ParallelController> {
    match cfg.parallel.controller {
        ControllerKind::Serial => Arc::new(SerialController),
        ControllerKind::WorkerCluster => {
            Arc::new(WorkerPoolController::new(&cfg.parallel.controller_options.worker_cluster))
        }
        ControllerKind::Batch => {
            Arc::new(crate::batch::BatchController::new(&cfg.parallel.controller_options.batch))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Arc<Config> {
        Arc::new(
            serde_json::from_value(serde_json::json!({
                "model": { "population_size": 1 },
                "optimization": { "structure_output": "pop.cps" },
                "parameters": { "workdir": "." }
            }))
            .unwrap(),
        )
    }

    fn touch_task(arg: usize, _cfg: &Config, tmp_dir: &std::path::Path) -> Result<()> {
        std::fs::write(tmp_dir.join(format!("{}.done", arg)), b"")?;
        Ok(())
    }

    fn failing_task(arg: usize, _cfg: &Config, _tmp_dir: &std::path::Path) -> Result<()> {
        if arg == 2 {
            return Err(Error::Assignment("bad input".into()));
        }
        Ok(())
    }

    #[tokio::test]
    async fn serial_controller_runs_every_task() {
        let dir = tempfile::tempdir().unwrap();
        let task = NamedTask { key: "touch", func: touch_task };
        SerialController
            .map(task, vec![0, 1, 2], test_config(), dir.path().to_path_buf())
            .await
            .unwrap();
        for arg in 0..3 {
            assert!(dir.path().join(format!("{}.done", arg)).is_file());
        }
    }

    #[tokio::test]
    async fn pool_controller_runs_every_task() {
        let dir = tempfile::tempdir().unwrap();
        let pool = WorkerPoolController::new(&WorkerClusterOptions { workers: 4, task_timeout: 0 });
        let task = NamedTask { key: "touch", func: touch_task };
        pool.map(task, (0..20).collect(), test_config(), dir.path().to_path_buf())
            .await
            .unwrap();
        for arg in 0..20 {
            assert!(dir.path().join(format!("{}.done", arg)).is_file());
        }
    }

    #[tokio::test]
    async fn pool_controller_surfaces_remote_failures() {
        let dir = tempfile::tempdir().unwrap();
        let pool = WorkerPoolController::new(&WorkerClusterOptions { workers: 2, task_timeout: 0 });
        let task = NamedTask { key: "failing", func: failing_task };
        let err = pool
            .map(task, (0..8).collect(), test_config(), dir.path().to_path_buf())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("remote failure"));
    }
}
