//! Sentinel-file poller.
//!
//! Watches a list of paths and invokes a callback as each appears, feeding
//! completion indices into a channel so a reducer can stream results while
//! workers are still running. Callback errors are tolerated for a few polls
//! (shared filesystems can expose a sentinel before its data file is
//! readable) and then surfaced through the iterator.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use chromoplex_common::{Error, Result};

/// Failed callback attempts per file before the poller gives up on it.
const MAX_CALLBACK_ATTEMPTS: u32 = 5;

pub struct FilePoller {
    files: Vec<PathBuf>,
    interval: Duration,
    remove_after_callback: bool,
    timeout: Option<Duration>,
}

impl FilePoller {
    pub fn new(files: Vec<PathBuf>, interval: Duration) -> Self {
        Self { files, interval, remove_after_callback: false, timeout: None }
    }

    pub fn remove_after_callback(mut self, yes: bool) -> Self {
        self.remove_after_callback = yes;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Start watching in a background blocking task. The callback runs on
    /// the poller task, synchronously, once per completed file.
    pub fn watch<F>(self, mut callback: F) -> PollerHandle
    where
        F: FnMut(usize) -> Result<()> + Send + 'static,
    {
        let total = self.files.len();
        let (tx, rx) = mpsc::unbounded_channel::<usize>();
        let join = tokio::task::spawn_blocking(move || -> Result<()> {
            let started = std::time::Instant::now();
            let mut pending: BTreeMap<usize, u32> =
                (0..self.files.len()).map(|i| (i, 0)).collect();
            while !pending.is_empty() {
                if tx.is_closed() {
                    // receiver dropped (step aborted); stop quietly
                    return Ok(());
                }
                let cycle_started = std::time::Instant::now();
                let ready: Vec<usize> = pending
                    .keys()
                    .copied()
                    .filter(|&i| self.files[i].is_file())
                    .collect();
                for i in ready {
                    match callback(i) {
                        Ok(()) => {
                            if self.remove_after_callback {
                                let _ = std::fs::remove_file(&self.files[i]);
                            }
                            pending.remove(&i);
                            if tx.send(i).is_err() {
                                // receiver dropped; stop quietly
                                return Ok(());
                            }
                        }
                        Err(e) => {
                            let attempts = pending.get_mut(&i).expect("pending entry");
                            *attempts += 1;
                            if *attempts >= MAX_CALLBACK_ATTEMPTS {
                                return Err(Error::Parallel(format!(
                                    "callback for {} failed {} times: {}",
                                    self.files[i].display(),
                                    attempts,
                                    e
                                )));
                            }
                            warn!(
                                file = %self.files[i].display(),
                                attempts, "callback failed; will retry on next poll: {}", e
                            );
                        }
                    }
                }
                if pending.is_empty() {
                    break;
                }
                if let Some(timeout) = self.timeout {
                    if started.elapsed() > timeout {
                        return Err(Error::Parallel(format!(
                            "poller timeout expired ({:?}), {} files missing",
                            timeout,
                            pending.len()
                        )));
                    }
                }
                let elapsed = cycle_started.elapsed();
                if elapsed < self.interval {
                    std::thread::sleep(self.interval - elapsed);
                }
            }
            debug!("poller drained all files");
            Ok(())
        });
        PollerHandle { rx, join: Some(join), total, failed: false }
    }
}

/// Receiving side of a running poller.
pub struct PollerHandle {
    rx: mpsc::UnboundedReceiver<usize>,
    join: Option<tokio::task::JoinHandle<Result<()>>>,
    total: usize,
    failed: bool,
}

impl PollerHandle {
    pub fn total(&self) -> usize {
        self.total
    }

    /// Next completed index, in completion order. Returns `None` once all
    /// files have been seen; a stored callback error is raised here.
    pub async fn next_completed(&mut self) -> Option<Result<usize>> {
        if self.failed {
            return None;
        }
        match self.rx.recv().await {
            Some(i) => Some(Ok(i)),
            None => match self.join.take() {
                Some(join) => match join.await {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => {
                        self.failed = true;
                        Some(Err(e))
                    }
                    Err(e) => {
                        self.failed = true;
                        Some(Err(Error::Parallel(format!("poller task failed: {}", e))))
                    }
                },
                None => None,
            },
        }
    }

    /// Drain the poller, returning all indices in completion order.
    pub async fn wait(mut self) -> Result<Vec<usize>> {
        let mut order = Vec::with_capacity(self.total);
        while let Some(next) = self.next_completed().await {
            order.push(next?);
        }
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn streams_completions_as_files_appear() {
        let dir = tempfile::tempdir().unwrap();
        let files: Vec<PathBuf> = (0..3).map(|i| dir.path().join(format!("{}.ready", i))).collect();

        std::fs::write(&files[1], b"").unwrap();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        let poller = FilePoller::new(files.clone(), Duration::from_millis(10));
        let mut handle = poller.watch(move |_| {
            seen2.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let first = handle.next_completed().await.unwrap().unwrap();
        assert_eq!(first, 1);

        std::fs::write(&files[0], b"").unwrap();
        std::fs::write(&files[2], b"").unwrap();
        let mut rest = vec![
            handle.next_completed().await.unwrap().unwrap(),
            handle.next_completed().await.unwrap().unwrap(),
        ];
        rest.sort_unstable();
        assert_eq!(rest, vec![0, 2]);
        assert!(handle.next_completed().await.is_none());
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn persistent_callback_failure_surfaces_in_iteration() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("0.ready");
        std::fs::write(&file, b"").unwrap();

        let poller = FilePoller::new(vec![file], Duration::from_millis(1));
        let mut handle =
            poller.watch(|_| Err(Error::Parallel("corrupt result".into())));
        let outcome = handle.next_completed().await.unwrap();
        assert!(outcome.is_err());
        assert!(handle.next_completed().await.is_none());
    }

    #[tokio::test]
    async fn transient_callback_failure_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("0.ready");
        std::fs::write(&file, b"").unwrap();

        let tries = Arc::new(AtomicUsize::new(0));
        let tries2 = tries.clone();
        let poller = FilePoller::new(vec![file], Duration::from_millis(1));
        let handle = poller.watch(move |_| {
            if tries2.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Error::Parallel("not yet readable".into()))
            } else {
                Ok(())
            }
        });
        let order = handle.wait().await.unwrap();
        assert_eq!(order, vec![0]);
        assert_eq!(tries.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn timeout_raises_when_files_never_appear() {
        let dir = tempfile::tempdir().unwrap();
        let poller = FilePoller::new(
            vec![dir.path().join("never.ready")],
            Duration::from_millis(5),
        )
        .timeout(Duration::from_millis(30));
        let handle = poller.watch(|_| Ok(()));
        assert!(handle.wait().await.is_err());
    }

    #[tokio::test]
    async fn remove_after_callback_deletes_sentinels() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("0.ready");
        std::fs::write(&file, b"").unwrap();
        let poller = FilePoller::new(vec![file.clone()], Duration::from_millis(1))
            .remove_after_callback(true);
        poller.watch(|_| Ok(())).wait().await.unwrap();
        assert!(!file.exists());
    }
}
