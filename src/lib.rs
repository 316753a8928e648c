//! Concurrency coordination for integration tests that each drive their own
//! throwaway cluster: command execution, background sessions, staggered
//! start slots, readiness polling, and process-tree teardown.

pub mod cluster;
pub mod command;
pub mod config;
pub mod harness;
pub mod kubectl;
pub mod process_tree;
pub mod readiness;
pub mod reporter;
pub mod scheduler;
pub mod session;

pub use command::{CommandError, CommandResult, CommandRunner, CommandSpec};
pub use harness::{Harness, TestCase};
pub use process_tree::{ProcessTreeTerminator, TeardownReport};
pub use readiness::{ReadinessPoller, WaitError};
pub use reporter::{MemoryReporter, Reporter, TracingReporter};
pub use scheduler::{ExecutionMode, StartSlotScheduler};
pub use session::{Session, SessionManager};
