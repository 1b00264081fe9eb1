//! Background execution of a job.
//!
//! The job runs on its own thread. The caller sends `JobCommand`s and reads
//! `JobEvent`s from channels; nothing is shared between the two sides.

use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::conflict::{ConflictDecision, ConflictQuery};
use crate::error::{EngineError, ErrorDecision, ErrorQuery, ErrorRecord};
use crate::job::{Collaborators, JobController, RunOutcome};
use crate::model::{JobDescriptor, JobState, JobSummary, TransferUnit};
use crate::progress::{ProgressCallback, ProgressSnapshot};

/// Requests accepted by a running job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobCommand {
    Start,
    Pause,
    Resume,
    Cancel,
    Decide(ConflictDecision),
    DecideError(ErrorDecision),
}

/// Notifications emitted by a running job.
#[derive(Debug, Clone)]
pub enum JobEvent {
    StateChanged(JobState),
    UnitStarted(TransferUnit),
    Progress(ProgressSnapshot),
    UnitFinished(TransferUnit),
    Error(ErrorRecord),
    Conflict(ConflictQuery),
    /// A unit failed and the job waits for `JobHandle::decide_error`
    ErrorQuery(ErrorQuery),
    Finished(JobSummary),
}

/// Forwards callbacks onto the event channel.
struct ChannelObserver {
    sender: Sender<JobEvent>,
}

impl ProgressCallback for ChannelObserver {
    fn on_state_changed(&self, job: &JobDescriptor) {
        let _ = self.sender.send(JobEvent::StateChanged(job.state));
    }

    fn on_unit_started(&self, _job: &JobDescriptor, unit: &TransferUnit) {
        let _ = self.sender.send(JobEvent::UnitStarted(unit.clone()));
    }

    fn on_progress(&self, _job: &JobDescriptor, snapshot: &ProgressSnapshot) {
        let _ = self.sender.send(JobEvent::Progress(snapshot.clone()));
    }

    fn on_unit_finished(&self, _job: &JobDescriptor, unit: &TransferUnit) {
        let _ = self.sender.send(JobEvent::UnitFinished(unit.clone()));
    }

    fn on_error(&self, _job: &JobDescriptor, record: &ErrorRecord) {
        let _ = self.sender.send(JobEvent::Error(record.clone()));
    }

    fn on_conflict(&self, _job: &JobDescriptor, query: &ConflictQuery) {
        let _ = self.sender.send(JobEvent::Conflict(query.clone()));
    }

    fn on_error_decision(&self, _job: &JobDescriptor, query: &ErrorQuery) {
        let _ = self.sender.send(JobEvent::ErrorQuery(query.clone()));
    }

    fn on_job_completed(&self, summary: &JobSummary) {
        let _ = self.sender.send(JobEvent::Finished(summary.clone()));
    }
}

/// Cloneable sending half, e.g. for a Ctrl-C handler.
#[derive(Debug, Clone)]
pub struct JobCommander {
    sender: Sender<JobCommand>,
}

impl JobCommander {
    /// Returns WorkerGone once the job thread has exited.
    pub fn send(&self, command: JobCommand) -> Result<(), EngineError> {
        self.sender.send(command).map_err(|_| EngineError::WorkerGone)
    }

    pub fn cancel(&self) -> Result<(), EngineError> {
        self.send(JobCommand::Cancel)
    }
}

pub struct JobHandle {
    id: Uuid,
    commander: JobCommander,
    events: Receiver<JobEvent>,
    thread: JoinHandle<Result<JobSummary, EngineError>>,
}

impl JobHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn start(&self) -> Result<(), EngineError> {
        self.commander.send(JobCommand::Start)
    }

    pub fn pause(&self) -> Result<(), EngineError> {
        self.commander.send(JobCommand::Pause)
    }

    pub fn resume(&self) -> Result<(), EngineError> {
        self.commander.send(JobCommand::Resume)
    }

    pub fn cancel(&self) -> Result<(), EngineError> {
        self.commander.cancel()
    }

    pub fn decide(&self, decision: ConflictDecision) -> Result<(), EngineError> {
        self.commander.send(JobCommand::Decide(decision))
    }

    pub fn decide_error(&self, decision: ErrorDecision) -> Result<(), EngineError> {
        self.commander.send(JobCommand::DecideError(decision))
    }

    pub fn events(&self) -> &Receiver<JobEvent> {
        &self.events
    }

    pub fn commander(&self) -> JobCommander {
        self.commander.clone()
    }

    /// Wait for the job thread to exit.
    pub fn join(self) -> Result<JobSummary, EngineError> {
        self.thread.join().map_err(|_| EngineError::WorkerPanicked)?
    }
}

/// Spawn a worker thread for `job`. Nothing runs until `JobHandle::start`.
pub fn spawn_job(
    job: JobDescriptor,
    config: EngineConfig,
    collaborators: Collaborators,
) -> Result<JobHandle, EngineError> {
    let id = job.id;
    let (command_tx, command_rx) = unbounded::<JobCommand>();
    let (event_tx, event_rx) = unbounded::<JobEvent>();

    let controller = JobController::new(job, config, collaborators)?
        .with_observer(Box::new(ChannelObserver { sender: event_tx }))
        .with_commands(command_rx.clone());

    let thread = thread::Builder::new()
        .name(format!("filejob-{}", id.simple()))
        .spawn(move || drive(controller, command_rx))
        .map_err(EngineError::WorkerSpawn)?;

    Ok(JobHandle {
        id,
        commander: JobCommander { sender: command_tx },
        events: event_rx,
        thread,
    })
}

fn drive(
    mut controller: JobController,
    commands: Receiver<JobCommand>,
) -> Result<JobSummary, EngineError> {
    // Dropping every handle before Start counts as a cancel
    loop {
        match commands.recv() {
            Ok(JobCommand::Start) => break,
            Ok(JobCommand::Cancel) | Err(_) => return controller.cancel(),
            Ok(command) => warn!(?command, "Ignoring command before start"),
        }
    }

    loop {
        match controller.run()? {
            RunOutcome::Finished(summary) => return Ok(summary),
            RunOutcome::AwaitingDecision(query) => {
                debug!(job_id = %controller.id(), dest = %query.destination.display(), "Worker waiting for decision");
                loop {
                    match commands.recv() {
                        Ok(JobCommand::Decide(decision)) => {
                            controller.supply_decision(decision)?;
                            break;
                        }
                        Ok(JobCommand::Cancel) | Err(_) => return controller.cancel(),
                        Ok(command) => warn!(?command, "Ignoring command while awaiting decision"),
                    }
                }
            }
            RunOutcome::AwaitingErrorDecision(query) => {
                debug!(job_id = %controller.id(), src = %query.unit.source.display(), "Worker waiting for error decision");
                loop {
                    match commands.recv() {
                        Ok(JobCommand::DecideError(decision)) => {
                            controller.supply_error_decision(decision)?;
                            break;
                        }
                        Ok(JobCommand::Cancel) | Err(_) => return controller.cancel(),
                        Ok(command) => warn!(?command, "Ignoring command while awaiting error decision"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ErrorPolicy;
    use crate::conflict::ConflictAction;
    use crate::error::{ErrorAction, ErrorKind};
    use crate::job::create_job;
    use crate::trash::DirectoryTrash;
    use crate::model::{ConflictPolicy, Entry, Operation};
    use std::fs;

    fn drain_until_finished(handle: &JobHandle) -> Vec<JobEvent> {
        let mut events = Vec::new();
        for event in handle.events().iter() {
            let done = matches!(event, JobEvent::Finished(_));
            events.push(event);
            if done {
                break;
            }
        }
        events
    }

    #[test]
    fn test_worker_runs_after_start() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("a.txt");
        fs::write(&src, "worker").expect("Failed to write");
        let dst = temp_dir.path().join("dst");

        let job = create_job(Operation::Copy, vec![Entry::regular(&src)], Some(dst.clone()), ConflictPolicy::Ask)
            .expect("Failed to create job");
        let handle = spawn_job(job, EngineConfig::default(), Collaborators::default())
            .expect("Failed to spawn");
        handle.start().expect("start");

        let events = drain_until_finished(&handle);
        assert!(events.iter().any(|e| matches!(e, JobEvent::UnitStarted(_))));
        let summary = handle.join().expect("Worker should finish");
        assert_eq!(summary.state, JobState::Completed);
        assert_eq!(fs::read_to_string(dst.join("a.txt")).expect("read"), "worker");
    }

    #[test]
    fn test_worker_waits_for_decision() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("a.txt");
        fs::write(&src, "new").expect("Failed to write");
        let dst = temp_dir.path().join("dst");
        fs::create_dir(&dst).expect("Failed to create dst");
        fs::write(dst.join("a.txt"), "old").expect("Failed to write");

        let job = create_job(Operation::Copy, vec![Entry::regular(&src)], Some(dst.clone()), ConflictPolicy::Ask)
            .expect("Failed to create job");
        let handle = spawn_job(job, EngineConfig::default(), Collaborators::default())
            .expect("Failed to spawn");
        handle.start().expect("start");

        for event in handle.events().iter() {
            if let JobEvent::Conflict(query) = event {
                assert_eq!(query.dest_name, "a.txt");
                break;
            }
        }
        handle
            .decide(ConflictDecision::once(ConflictAction::Replace))
            .expect("decide");

        let summary = handle.join().expect("Worker should finish");
        assert_eq!(summary.completed, 1);
        assert_eq!(fs::read_to_string(dst.join("a.txt")).expect("read"), "new");
    }

    #[cfg(unix)]
    #[test]
    fn test_worker_waits_for_error_decision() {
        use std::os::unix::fs::PermissionsExt;
        use std::sync::Arc;

        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let locked = temp_dir.path().join("locked");
        fs::create_dir(&locked).expect("Failed to create dir");
        let src = locked.join("a.txt");
        fs::write(&src, "stuck").expect("Failed to write");
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o555)).expect("chmod");
        if fs::remove_file(&src).is_ok() {
            // Running with privileges that ignore directory modes
            return;
        }

        let trash = DirectoryTrash::new(temp_dir.path().join("trash"));
        let job = create_job(Operation::Trash, vec![Entry::regular(&src)], None, ConflictPolicy::Ask)
            .expect("Failed to create job");
        let config = EngineConfig {
            error_policy: ErrorPolicy::Ask,
            ..EngineConfig::default()
        };
        let handle = spawn_job(job, config, Collaborators::with_trash(Arc::new(trash)))
            .expect("Failed to spawn");
        handle.start().expect("start");

        for event in handle.events().iter() {
            if let JobEvent::ErrorQuery(query) = event {
                assert_eq!(query.kind, ErrorKind::PermissionDenied);
                assert_eq!(query.unit.name(), "a.txt");
                break;
            }
        }
        handle
            .decide_error(ErrorDecision::once(ErrorAction::Skip))
            .expect("decide");

        let summary = handle.join().expect("Worker should finish");
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).expect("chmod");
        assert_eq!(summary.state, JobState::Completed);
        assert_eq!(summary.failed, 1);
        assert!(src.exists());
    }

    #[test]
    fn test_cancel_before_start() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("a.txt");
        fs::write(&src, "x").expect("Failed to write");

        let job = create_job(Operation::Delete, vec![Entry::regular(&src)], None, ConflictPolicy::Ask)
            .expect("Failed to create job");
        let handle = spawn_job(job, EngineConfig::default(), Collaborators::default())
            .expect("Failed to spawn");
        handle.commander().cancel().expect("cancel");

        let summary = handle.join().expect("Worker should finish");
        assert_eq!(summary.state, JobState::Cancelled);
        assert!(src.exists());
    }
}
