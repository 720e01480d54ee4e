//! Parallel execution primitives.
//!
//! A step's `task` is a pure function of `(arg, cfg, tmp_dir)` whose side
//! effects are files and sentinels; controllers only guarantee that each
//! task runs at least once. Backends: in-order serial execution, an
//! in-process worker pool, and a batch-scheduler bridge that re-invokes the
//! pipeline binary on remote nodes.

mod batch;
mod controller;
mod poller;

pub use batch::{run_batch_index, BatchController, BatchPayload};
pub use controller::{
    create_controller, NamedTask, ParallelController, SerialController, TaskFn,
    WorkerPoolController,
};
pub use poller::{FilePoller, PollerHandle};
