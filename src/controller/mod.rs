pub mod context;
pub mod engine;
pub mod error;
pub mod queue;
pub mod state_machine;
pub mod status;
pub mod validation;
pub mod watch;

pub use context::Context;
pub use engine::{Decision, DeletionReport, Delivery, Engine, ReconcileOutcome, decide};
pub use error::{Error, Result};
pub use queue::WorkQueue;
pub use state_machine::{
    DatabaseEvent, DatabaseStateMachine, TransitionContext, TransitionResult, progress_rank,
};
pub use status::{Completion, StatusManager, StatusUpdate};
pub use validation::validate_spec;
pub use watch::{Notification, ObjectKey, WatchAdapter, run_watch};
