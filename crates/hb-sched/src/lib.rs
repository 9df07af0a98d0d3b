//! Asynchronous multi-fidelity scheduling: iteration plans, the per-run
//! name registry, worker runtimes, the dispatching master, and the `fmin`
//! run driver that wires them together.

pub mod fmin;
pub mod iter;
pub mod master;
pub mod registry;
pub mod worker;

pub use fmin::{fmin, FminOptions, ParallelStrategy};
pub use iter::{Bracket, CustomIterGenerator, HyperbandIterGenerator, IterGenerator, Rung};
pub use master::{Master, MasterConfig, MasterState};
pub use registry::{NameRegistry, WorkerHandle, WorkerState};
pub use worker::{
    CompletionMsg, ConcurrencyMode, EvalFn, EvalOutcome, Worker, WorkerCommand, WorkerRuntime,
};
