//! # Filejob Engine - File Transfer Jobs
//!
//! A headless engine for the long-running operations of a file manager:
//! copy, move, trash, delete, restore from trash and symlink creation.
//! Designed as the foundation for multiple front-ends (CLI, desktop shells,
//! automation).
//!
//! ## Overview
//!
//! A job takes a set of root selections and a target directory and works
//! through them one unit at a time:
//! - Lazy depth-first planning, so huge trees start transferring immediately
//! - Chunked copies that can be paused or cancelled between chunks
//! - Interactive conflict resolution with "apply to all"
//! - Error classification with bounded retries for transient failures
//! - An ask policy that hands failed units back to the caller
//! - Progress reporting via callbacks (decoupled from UI technology)
//!
//! ## Basic Usage
//!
//! ```no_run
//! use filejob_engine::{
//!     create_job, Collaborators, ConflictPolicy, EngineConfig, Entry, JobController, Operation,
//!     RunOutcome,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let job = create_job(
//!     Operation::Copy,
//!     vec![Entry::regular("/home/me/photos")],
//!     Some("/media/usb".into()),
//!     ConflictPolicy::KeepBoth,
//! )?;
//!
//! let mut controller = JobController::new(job, EngineConfig::default(), Collaborators::default())?;
//! if let RunOutcome::Finished(summary) = controller.run()? {
//!     println!("{} done, {} failed", summary.completed, summary.failed);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - **model**: Core data structures (JobDescriptor, TransferUnit, enums)
//! - **error**: Engine errors and the unit failure taxonomy
//! - **config**: Tunables for retries, chunking and progress
//! - **planner**: Root preflight and lazy tree walking
//! - **executor**: Performs one unit of work
//! - **conflict**: Name collisions and "keep both" naming
//! - **classify**: Maps raw failures to error kinds and recovery
//! - **progress**: Callback trait and throughput estimation
//! - **job**: Job orchestration (create, run, decide, cancel)
//! - **worker**: Runs a job on its own thread behind channels
//! - **trash**, **mounts**, **external**: Collaborator traits and defaults

pub mod model;
pub mod error;
pub mod config;
pub mod external;
pub mod fs_ops;
pub mod checksums;
pub mod classify;
pub mod conflict;
pub mod progress;
pub mod planner;
pub mod executor;
pub mod job;
pub mod worker;
pub mod trash;
pub mod mounts;

// Re-export main types and functions
pub use model::{
    ConflictPolicy, Entry, JobDescriptor, JobState, JobSummary, JobTotals, Operation, TransferUnit,
    UnitKind, UnitStatus, UnitStep,
};
pub use error::{
    EngineError, ErrorAction, ErrorDecision, ErrorKind, ErrorQuery, ErrorRecord, Recovery,
};
pub use config::{EngineConfig, ErrorPolicy};
pub use external::{MountInfo, NoTrash, TrashBackend, TrashRecordId};
pub use checksums::{compute_file_checksum, ChecksumAlgorithm, ChecksumValue};
pub use conflict::{ConflictAction, ConflictDecision, ConflictQuery};
pub use progress::{ProgressCallback, ProgressSnapshot};
pub use job::{create_job, Collaborators, JobController, RunOutcome};
pub use worker::{spawn_job, JobCommand, JobCommander, JobEvent, JobHandle};
pub use trash::DirectoryTrash;
pub use mounts::SystemMounts;
