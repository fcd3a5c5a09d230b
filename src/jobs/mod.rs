//! Background job subsystem.
//!
//! # Data Flow
//! ```text
//! POST /jobs → JobQueue::enqueue (idempotency check) → pending heap
//!     → JobExecutor worker → JobQueue::start
//!     → JobHandler (CommandHandler → CommandRunner) per attempt
//!     → retry with backoff | ArtifactStore writes → JobQueue::complete/fail/time_out
//!     → lifecycle events → EventBridge
//! ```

pub mod artifacts;
pub mod command;
pub mod executor;
pub mod queue;
pub mod types;

pub use artifacts::{ArtifactError, ArtifactStore, FsArtifactStore};
pub use command::{CommandError, CommandHandler, CommandInvocation, CommandOutput, CommandRunner, ProcessRunner};
pub use executor::{Artifact, JobContext, JobError, JobExecutor, JobHandler, JobOutput, ProgressReporter};
pub use queue::{JobQueue, QueueError, QueueSettings, QueueStats};
pub use types::{EnqueueOptions, EnqueueReceipt, JobFilter, JobId, JobKind, JobMetadata, JobPage, JobStatus, Priority, RunId};
