//! Job orchestration module.
//!
//! This module provides the job lifecycle:
//! - Creating a job from root selections
//! - Driving it unit by unit through planner, executor, resolver and reporter
//! - Suspending on conflicts and resuming with a decision
//! - Suspending on failures under the ask policy
//! - Pausing, resuming and cancelling
//!
//! `JobController` is synchronous. `crate::worker` moves one onto its own
//! thread and talks to it through channels.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use chrono::Utc;
use crossbeam_channel::{Receiver, TryRecvError};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::classify::{ErrorClassifier, Failure, IoOp, SuggestedRecovery};
use crate::config::{EngineConfig, ErrorPolicy};
use crate::conflict::{ConflictAction, ConflictDecision, ConflictQuery, ConflictResolver, Directive};
use crate::error::{
    EngineError, ErrorAction, ErrorDecision, ErrorKind, ErrorQuery, ErrorRecord, Recovery,
};
use crate::executor::{TransferExecutor, UnitOutcome};
use crate::external::{MountInfo, NoTrash, TrashBackend};
use crate::fs_ops::Flow;
use crate::model::{
    ConflictPolicy, Entry, JobDescriptor, JobState, JobSummary, JobTotals, Operation,
    TransferUnit, UnitStatus, UnitStep,
};
use crate::mounts::SystemMounts;
use crate::planner::{Planned, TaskPlanner};
use crate::progress::{ProgressCallback, ProgressReporter};
use crate::worker::JobCommand;

/// The collaborators a job talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub trash: Arc<dyn TrashBackend>,
    pub mounts: Arc<dyn MountInfo>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Collaborators {
            trash: Arc::new(NoTrash),
            mounts: Arc::new(SystemMounts::new()),
        }
    }
}

impl Collaborators {
    pub fn with_trash(trash: Arc<dyn TrashBackend>) -> Self {
        Collaborators {
            trash,
            ..Collaborators::default()
        }
    }
}

/// Why `JobController::run` returned.
#[derive(Debug)]
pub enum RunOutcome {
    /// The job reached a terminal state
    Finished(JobSummary),
    /// The job is suspended until `supply_decision` is called
    AwaitingDecision(ConflictQuery),
    /// A unit failed under the ask policy; `supply_error_decision` continues
    AwaitingErrorDecision(ErrorQuery),
}

/// Create a new job in `Planning` state.
///
/// The target directory may not exist yet; it is created when the first unit
/// needs it.
///
/// # Errors
/// Returns EngineError if the selection, the target or the entries do not fit
/// the operation.
pub fn create_job(
    operation: Operation,
    roots: Vec<Entry>,
    target: Option<PathBuf>,
    conflict_policy: ConflictPolicy,
) -> Result<JobDescriptor, EngineError> {
    if roots.is_empty() {
        return Err(EngineError::NoRoots);
    }
    if operation.requires_target() && target.is_none() {
        return Err(EngineError::MissingTarget { operation });
    }
    if let Some(target) = &target {
        if let Ok(metadata) = std::fs::metadata(target) {
            if !metadata.is_dir() {
                return Err(EngineError::TargetNotDirectory {
                    path: target.clone(),
                });
            }
        }
    }
    if operation == Operation::Restore {
        if let Some(entry) = roots.iter().find(|e| e.trash_record().is_none()) {
            return Err(EngineError::UnsupportedEntry {
                operation,
                path: entry.path().to_path_buf(),
            });
        }
    }

    Ok(JobDescriptor {
        id: Uuid::new_v4(),
        operation,
        roots,
        target,
        conflict_policy,
        totals: JobTotals::default(),
        current_unit: None,
        state: JobState::Planning,
        created_at: Utc::now(),
        started_at: None,
        finished_at: None,
    })
}

#[derive(Debug, Default, Clone, Copy)]
struct Counts {
    completed: u64,
    skipped: u64,
    failed: u64,
    cancelled: u64,
}

/// A conflict waiting for the caller.
struct Pending {
    unit: TransferUnit,
    query: ConflictQuery,
}

/// A failed unit waiting for the caller.
struct PendingError {
    unit: TransferUnit,
    /// Directive the failed attempt ran with
    directive: Option<Directive>,
    query: ErrorQuery,
}

/// Work handed from a decision to the next `run`.
enum Resume {
    Unit {
        unit: TransferUnit,
        directive: Option<Directive>,
        /// Failure the caller chose to retry
        retried: Option<ErrorQuery>,
    },
    /// The decision itself could not be carried out
    Failed(TransferUnit, Failure),
}

impl Resume {
    fn into_unit(self) -> TransferUnit {
        match self {
            Resume::Unit { unit, .. } | Resume::Failed(unit, _) => unit,
        }
    }
}

enum Step {
    Next,
    Suspend(ConflictQuery),
    AskOperator(ErrorQuery),
    Finish(JobState),
}

fn transition(job: &mut JobDescriptor, observer: Option<&dyn ProgressCallback>, state: JobState) {
    if job.state == state {
        return;
    }
    debug!(job_id = %job.id, from = %job.state, to = %state, "Job state changed");
    job.state = state;
    if let Some(observer) = observer {
        observer.on_state_changed(job);
    }
}

/// Byte accounting and command polling for the unit in flight.
struct Gate<'a> {
    job: &'a mut JobDescriptor,
    reporter: &'a mut ProgressReporter,
    observer: Option<&'a dyn ProgressCallback>,
    commands: Option<&'a Receiver<JobCommand>>,
    unit_size: u64,
    accounted: u64,
    paused: bool,
    cancelled: bool,
}

impl<'a> Gate<'a> {
    fn pass(&mut self, bytes: u64) -> Flow {
        if bytes > 0 {
            let counted = bytes.min(self.unit_size.saturating_sub(self.accounted));
            self.accounted += counted;
            self.job.totals.done_bytes += counted;
            self.reporter.record(bytes);
            if self.reporter.should_emit(Instant::now()) {
                if let Some(observer) = self.observer {
                    observer.on_progress(self.job, &self.reporter.snapshot(&self.job.totals));
                }
            }
        }
        self.poll()
    }

    fn poll(&mut self) -> Flow {
        let Some(commands) = self.commands else {
            return Flow::Continue;
        };
        loop {
            match commands.try_recv() {
                Ok(JobCommand::Pause) => {
                    if self.wait_for_resume(commands) == Flow::Stop {
                        return Flow::Stop;
                    }
                }
                Ok(JobCommand::Cancel) => {
                    self.cancelled = true;
                    return Flow::Stop;
                }
                Ok(command) => warn!(?command, "Ignoring command while running"),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return Flow::Continue,
            }
        }
    }

    fn wait_for_resume(&mut self, commands: &Receiver<JobCommand>) -> Flow {
        transition(self.job, self.observer, JobState::Paused);
        self.paused = true;
        loop {
            match commands.recv() {
                Ok(JobCommand::Resume) => {
                    transition(self.job, self.observer, JobState::Running);
                    self.reporter.reset_window();
                    return Flow::Continue;
                }
                Ok(JobCommand::Cancel) | Err(_) => {
                    self.cancelled = true;
                    return Flow::Stop;
                }
                Ok(command) => warn!(?command, "Ignoring command while paused"),
            }
        }
    }

    /// Give back the bytes counted for an attempt that did not complete.
    fn roll_back(&mut self) {
        self.job.totals.done_bytes -= self.accounted;
        self.accounted = 0;
    }

    /// Count the rest of the unit as done.
    fn top_up(&mut self) {
        let rest = self.unit_size.saturating_sub(self.accounted);
        self.job.totals.done_bytes += rest;
        self.accounted = self.unit_size;
    }
}

/// Drives one job from `Planning` to a terminal state.
pub struct JobController {
    job: JobDescriptor,
    config: EngineConfig,
    planner: TaskPlanner,
    executor: TransferExecutor,
    resolver: ConflictResolver,
    classifier: ErrorClassifier,
    reporter: ProgressReporter,
    observer: Option<Box<dyn ProgressCallback>>,
    commands: Option<Receiver<JobCommand>>,
    pending: Option<Pending>,
    pending_error: Option<PendingError>,
    resume: Option<Resume>,
    errors: Vec<ErrorRecord>,
    counts: Counts,
    sequence: u64,
}

impl JobController {
    pub fn new(
        job: JobDescriptor,
        config: EngineConfig,
        collaborators: Collaborators,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        if job.state != JobState::Planning {
            return Err(EngineError::InvalidState {
                expected: "planning",
                actual: job.state,
            });
        }

        let planner = TaskPlanner::new(
            job.operation,
            job.roots.clone(),
            job.target.clone(),
            collaborators.mounts.clone(),
        )
        .with_space_check(config.check_free_space);
        let executor = TransferExecutor::new(
            job.operation,
            config.clone(),
            collaborators.trash,
            collaborators.mounts.clone(),
        );
        let resolver = ConflictResolver::new(job.operation, config.copy_token.clone());
        let classifier = ErrorClassifier::new(config.error_policy, collaborators.mounts);
        let reporter = ProgressReporter::new(config.throughput_window(), config.progress_interval());

        Ok(JobController {
            job,
            config,
            planner,
            executor,
            resolver,
            classifier,
            reporter,
            observer: None,
            commands: None,
            pending: None,
            pending_error: None,
            resume: None,
            errors: Vec::new(),
            counts: Counts::default(),
            sequence: 0,
        })
    }

    pub fn with_observer(mut self, observer: Box<dyn ProgressCallback>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Poll `commands` for pause and cancel between chunks and units.
    pub fn with_commands(mut self, commands: Receiver<JobCommand>) -> Self {
        self.commands = Some(commands);
        self
    }

    pub fn id(&self) -> Uuid {
        self.job.id
    }

    pub fn state(&self) -> JobState {
        self.job.state
    }

    pub fn descriptor(&self) -> &JobDescriptor {
        &self.job
    }

    pub fn errors(&self) -> &[ErrorRecord] {
        &self.errors
    }

    /// The conflict the job is suspended on, if any.
    pub fn pending_conflict(&self) -> Option<&ConflictQuery> {
        self.pending.as_ref().map(|p| &p.query)
    }

    /// The failure the job is suspended on, if any.
    pub fn pending_error(&self) -> Option<&ErrorQuery> {
        self.pending_error.as_ref().map(|p| &p.query)
    }

    /// Run until the job finishes or suspends on a conflict or a failure.
    pub fn run(&mut self) -> Result<RunOutcome, EngineError> {
        match self.job.state {
            JobState::Planning => {
                self.job.started_at = Some(Utc::now());
                self.reporter.reset_window();
                info!(
                    job_id = %self.job.id,
                    operation = %self.job.operation,
                    roots = self.job.roots.len(),
                    "Job started"
                );
                self.set_state(JobState::Running);
            }
            JobState::Running => {}
            state if state.is_terminal() => return Ok(RunOutcome::Finished(self.summary())),
            actual => {
                return Err(EngineError::InvalidState {
                    expected: "running",
                    actual,
                })
            }
        }

        loop {
            if self.poll_commands() {
                if let Some(resume) = self.resume.take() {
                    self.cancel_unit(&mut resume.into_unit());
                }
                return Ok(RunOutcome::Finished(self.finish(JobState::Cancelled)));
            }

            let step = match self.resume.take() {
                Some(Resume::Unit {
                    unit,
                    directive,
                    retried,
                }) => self.process(unit, directive, retried),
                Some(Resume::Failed(unit, failure)) => self.unit_failed(unit, failure, 1, None),
                None => match self.planner.next_unit(&mut self.job.totals) {
                    Planned::Exhausted => Step::Finish(JobState::Completed),
                    Planned::Blocked(unit) => {
                        debug!(dir = %unit.source.display(), "Keeping directory with unfinished contents");
                        Step::Next
                    }
                    Planned::Rejected { unit, failure } => self.reject(unit, failure),
                    Planned::Unit(unit) => self.process(unit, None, None),
                },
            };

            match step {
                Step::Next => {}
                Step::Suspend(query) => return Ok(RunOutcome::AwaitingDecision(query)),
                Step::AskOperator(query) => return Ok(RunOutcome::AwaitingErrorDecision(query)),
                Step::Finish(state) => return Ok(RunOutcome::Finished(self.finish(state))),
            }
        }
    }

    /// Answer the pending conflict. Call `run` afterwards to continue.
    pub fn supply_decision(&mut self, decision: ConflictDecision) -> Result<(), EngineError> {
        if self.job.state != JobState::AwaitingConflictDecision {
            return Err(EngineError::InvalidState {
                expected: "awaiting conflict decision",
                actual: self.job.state,
            });
        }
        let pending = self.pending.take().ok_or(EngineError::NoPendingConflict)?;

        let action = self.resolver.apply(&mut self.job.conflict_policy, decision);
        let resume = match self.resolver.directive(action, &pending.query) {
            Ok(directive) => {
                debug!(
                    unit = %pending.unit.source.display(),
                    ?action,
                    apply_to_all = decision.apply_to_all,
                    dest = %directive.destination.display(),
                    "Conflict decided"
                );
                Resume::Unit {
                    unit: pending.unit,
                    directive: Some(directive),
                    retried: None,
                }
            }
            Err(e) => Resume::Failed(
                pending.unit,
                Failure::io(IoOp::Create, &pending.query.destination, &e),
            ),
        };
        self.resume = Some(resume);
        self.set_state(JobState::Running);
        Ok(())
    }

    /// Answer the failed unit the job is suspended on.
    ///
    /// Retry and Skip leave the job running; call `run` to continue. Abort
    /// finishes the job as failed. Skip with `apply_to_all` switches the job
    /// to the continue policy.
    pub fn supply_error_decision(&mut self, decision: ErrorDecision) -> Result<(), EngineError> {
        if self.job.state != JobState::AwaitingErrorDecision {
            return Err(EngineError::InvalidState {
                expected: "awaiting error decision",
                actual: self.job.state,
            });
        }
        let pending = self.pending_error.take().ok_or(EngineError::NoPendingError)?;
        debug!(
            unit = %pending.unit.source.display(),
            action = ?decision.action,
            apply_to_all = decision.apply_to_all,
            "Error decided"
        );

        let PendingError {
            unit,
            directive,
            query,
        } = pending;
        match decision.action {
            ErrorAction::Retry => {
                self.resume = Some(Resume::Unit {
                    unit,
                    directive,
                    retried: Some(query),
                });
                self.set_state(JobState::Running);
            }
            ErrorAction::Skip => {
                if decision.apply_to_all {
                    self.classifier.set_policy(ErrorPolicy::Continue);
                }
                self.set_state(JobState::Running);
                self.give_up(unit, query.kind, query.cause, query.attempts, false);
            }
            ErrorAction::Abort => {
                self.give_up(unit, query.kind, query.cause, query.attempts, true);
                self.finish(JobState::Failed);
            }
        }
        Ok(())
    }

    pub fn pause(&mut self) -> Result<(), EngineError> {
        if self.job.state != JobState::Running {
            return Err(EngineError::InvalidState {
                expected: "running",
                actual: self.job.state,
            });
        }
        self.set_state(JobState::Paused);
        Ok(())
    }

    pub fn resume(&mut self) -> Result<(), EngineError> {
        if self.job.state != JobState::Paused {
            return Err(EngineError::InvalidState {
                expected: "paused",
                actual: self.job.state,
            });
        }
        self.reporter.reset_window();
        self.set_state(JobState::Running);
        Ok(())
    }

    /// Cancel from any non-terminal state. Completed units stay as they are.
    pub fn cancel(&mut self) -> Result<JobSummary, EngineError> {
        if self.job.state.is_terminal() {
            return Err(EngineError::InvalidState {
                expected: "a non-terminal state",
                actual: self.job.state,
            });
        }
        if let Some(mut pending) = self.pending.take() {
            self.cancel_unit(&mut pending.unit);
        }
        if let Some(mut pending) = self.pending_error.take() {
            self.cancel_unit(&mut pending.unit);
        }
        if let Some(resume) = self.resume.take() {
            self.cancel_unit(&mut resume.into_unit());
        }
        Ok(self.finish(JobState::Cancelled))
    }

    pub fn summary(&self) -> JobSummary {
        JobSummary {
            job_id: self.job.id,
            operation: self.job.operation,
            state: self.job.state,
            completed: self.counts.completed,
            skipped: self.counts.skipped,
            failed: self.counts.failed,
            cancelled: self.counts.cancelled,
            totals: self.job.totals,
            started_at: self.job.started_at,
            finished_at: self.job.finished_at,
            errors: self.errors.clone(),
        }
    }

    fn set_state(&mut self, state: JobState) {
        transition(&mut self.job, self.observer.as_deref(), state);
    }

    fn notify(&self, f: impl FnOnce(&dyn ProgressCallback, &JobDescriptor)) {
        if let Some(observer) = self.observer.as_deref() {
            f(observer, &self.job);
        }
    }

    /// Returns true when a cancel request arrived.
    fn poll_commands(&mut self) -> bool {
        let mut gate = Gate {
            job: &mut self.job,
            reporter: &mut self.reporter,
            observer: self.observer.as_deref(),
            commands: self.commands.as_ref(),
            unit_size: 0,
            accounted: 0,
            paused: false,
            cancelled: false,
        };
        gate.poll();
        gate.cancelled
    }

    fn emit_progress(&mut self, force: bool) {
        if force || self.reporter.should_emit(Instant::now()) {
            let snapshot = self.reporter.snapshot(&self.job.totals);
            self.notify(|observer, job| observer.on_progress(job, &snapshot));
        }
    }

    fn process(
        &mut self,
        mut unit: TransferUnit,
        mut directive: Option<Directive>,
        retried: Option<ErrorQuery>,
    ) -> Step {
        self.sequence += 1;
        self.job.current_unit = Some(self.sequence);
        debug!(
            seq = self.sequence,
            src = %unit.source.display(),
            kind = ?unit.kind,
            step = ?unit.step,
            "Processing unit"
        );
        self.notify(|observer, job| observer.on_unit_started(job, &unit));

        // An operator retry continues the attempt count of the failure
        let (mut attempts, mut retried_for) = match retried {
            Some(query) => (query.attempts, Some((query.kind, query.cause))),
            None => (0, None),
        };
        loop {
            attempts += 1;
            let mut gate = Gate {
                job: &mut self.job,
                reporter: &mut self.reporter,
                observer: self.observer.as_deref(),
                commands: self.commands.as_ref(),
                unit_size: if unit.step == UnitStep::Transfer { unit.size } else { 0 },
                accounted: 0,
                paused: false,
                cancelled: false,
            };
            let outcome = self
                .executor
                .execute(&unit, directive.as_ref(), &mut |bytes| gate.pass(bytes));

            match outcome {
                UnitOutcome::Completed(completion) => {
                    if let Some(descend) = completion.descend {
                        if let Err(failure) = self.planner.descend(
                            &unit,
                            descend.destination.clone(),
                            descend.finalize,
                        ) {
                            gate.roll_back();
                            // A retry enters the directory the attempt left behind
                            let merge = descend
                                .destination
                                .map(|destination| Directive {
                                    action: ConflictAction::Merge,
                                    destination,
                                })
                                .or(directive);
                            return self.unit_failed(unit, failure, attempts, merge);
                        }
                    }
                    gate.top_up();
                    gate.job.totals.transferred_bytes += completion.bytes;
                    if let Some((kind, cause)) = retried_for.take() {
                        let record = ErrorRecord::new(
                            kind,
                            unit.clone(),
                            cause,
                            Recovery::Retried {
                                attempts: attempts - 1,
                            },
                            attempts,
                        );
                        self.push_record(record);
                    }
                    self.settle(&mut unit, UnitStatus::Completed);
                    return Step::Next;
                }
                UnitOutcome::Skipped => {
                    gate.top_up();
                    self.planner.mark_incomplete();
                    self.settle(&mut unit, UnitStatus::Skipped);
                    return Step::Next;
                }
                UnitOutcome::Interrupted => {
                    gate.roll_back();
                    self.cancel_unit(&mut unit);
                    return Step::Finish(JobState::Cancelled);
                }
                UnitOutcome::NeedsConflictDecision(query) => {
                    gate.roll_back();
                    attempts -= 1;
                    if let Some(action) = self.resolver.standing_action(self.job.conflict_policy) {
                        match self.resolver.directive(action, &query) {
                            Ok(resolved) => {
                                directive = Some(resolved);
                                continue;
                            }
                            Err(e) => {
                                let failure = Failure::io(IoOp::Create, &query.destination, &e);
                                return self.unit_failed(unit, failure, attempts.max(1), None);
                            }
                        }
                    }
                    debug!(dest = %query.destination.display(), "Waiting for a conflict decision");
                    self.pending = Some(Pending {
                        unit,
                        query: query.clone(),
                    });
                    self.set_state(JobState::AwaitingConflictDecision);
                    self.notify(|observer, job| observer.on_conflict(job, &query));
                    return Step::Suspend(query);
                }
                UnitOutcome::Failed(failure) => {
                    gate.roll_back();
                    let (paused, cancelled) = (gate.paused, gate.cancelled);
                    let destination = directive
                        .as_ref()
                        .map(|d| d.destination.clone())
                        .or_else(|| unit.destination.clone());
                    let class = self.classifier.classify(
                        &failure,
                        destination.as_deref(),
                        self.job.totals.remaining_bytes(),
                    );

                    let may_retry = class.action == SuggestedRecovery::Retry
                        && attempts <= self.config.max_retries
                        && !paused
                        && !cancelled;
                    if may_retry {
                        let backoff = self.config.retry_backoff(attempts);
                        debug!(
                            src = %unit.source.display(),
                            attempt = attempts,
                            ?backoff,
                            cause = %failure.cause,
                            "Retrying transient failure"
                        );
                        retried_for = Some((class.kind, failure.cause.clone()));
                        thread::sleep(backoff);
                        if self.poll_commands() {
                            self.cancel_unit(&mut unit);
                            return Step::Finish(JobState::Cancelled);
                        }
                        continue;
                    }

                    if cancelled {
                        self.give_up(unit, class.kind, failure.cause, attempts, false);
                        return Step::Finish(JobState::Cancelled);
                    }
                    return self.escalate(unit, class.kind, failure.cause, attempts, directive);
                }
            }
        }
    }

    /// Classify a failure raised outside the executor and escalate it.
    fn unit_failed(
        &mut self,
        unit: TransferUnit,
        failure: Failure,
        attempts: u32,
        directive: Option<Directive>,
    ) -> Step {
        let destination = directive
            .as_ref()
            .map(|d| d.destination.clone())
            .or_else(|| unit.destination.clone());
        let kind = self
            .classifier
            .classify(&failure, destination.as_deref(), self.job.totals.remaining_bytes())
            .kind;
        self.escalate(unit, kind, failure.cause, attempts, directive)
    }

    /// Apply the error policy to a unit that will not complete on its own.
    fn escalate(
        &mut self,
        unit: TransferUnit,
        kind: ErrorKind,
        cause: String,
        attempts: u32,
        directive: Option<Directive>,
    ) -> Step {
        match self.classifier.escalation() {
            SuggestedRecovery::AskOperator => {
                let query = ErrorQuery {
                    kind,
                    unit: unit.clone(),
                    cause,
                    attempts,
                };
                debug!(src = %unit.source.display(), error = %query, attempts, "Waiting for an error decision");
                self.pending_error = Some(PendingError {
                    unit,
                    directive,
                    query: query.clone(),
                });
                self.set_state(JobState::AwaitingErrorDecision);
                self.notify(|observer, job| observer.on_error_decision(job, &query));
                Step::AskOperator(query)
            }
            SuggestedRecovery::AbortJob => {
                self.give_up(unit, kind, cause, attempts, true);
                Step::Finish(JobState::Failed)
            }
            SuggestedRecovery::Skip | SuggestedRecovery::Retry => {
                self.give_up(unit, kind, cause, attempts, false);
                Step::Next
            }
        }
    }

    /// Record a unit as failed. `abort` marks it as the one that ended the job.
    fn give_up(
        &mut self,
        mut unit: TransferUnit,
        kind: ErrorKind,
        cause: String,
        attempts: u32,
        abort: bool,
    ) {
        let recovery = if abort { Recovery::Aborted } else { Recovery::Skipped };
        if unit.step == UnitStep::Transfer {
            // A failed unit counts as handled
            self.job.totals.done_bytes += unit.size;
        }
        self.planner.mark_incomplete();
        let record = ErrorRecord::new(kind, unit.clone(), cause, recovery, attempts);
        warn!(
            job_id = %self.job.id,
            src = %unit.source.display(),
            error = %record,
            attempts,
            "Unit failed"
        );
        self.push_record(record);
        self.settle(&mut unit, UnitStatus::Failed);
    }

    /// Pre-flight refusal of a root selection.
    fn reject(&mut self, unit: TransferUnit, failure: Failure) -> Step {
        let class = self
            .classifier
            .classify(&failure, unit.destination.as_deref(), self.job.totals.remaining_bytes());
        debug!(src = %unit.source.display(), kind = %class.kind, "Root selection rejected");
        if class.kind.is_preflight() {
            // Root-scoped: siblings carry on regardless of the error policy
            self.give_up(unit, class.kind, failure.cause, 1, false);
            return Step::Next;
        }
        self.escalate(unit, class.kind, failure.cause, 1, None)
    }

    fn push_record(&mut self, record: ErrorRecord) {
        self.notify(|observer, job| observer.on_error(job, &record));
        self.errors.push(record);
    }

    fn cancel_unit(&mut self, unit: &mut TransferUnit) {
        debug!(src = %unit.source.display(), "Unit cancelled");
        self.counts.cancelled += 1;
        unit.set_status(UnitStatus::Cancelled);
        self.notify(|observer, job| observer.on_unit_finished(job, unit));
    }

    /// Terminal bookkeeping for a unit that ran to an outcome.
    fn settle(&mut self, unit: &mut TransferUnit, status: UnitStatus) {
        if unit.step == UnitStep::Transfer {
            self.job.totals.done_items += 1;
            match status {
                UnitStatus::Completed => self.counts.completed += 1,
                UnitStatus::Skipped => self.counts.skipped += 1,
                UnitStatus::Failed => self.counts.failed += 1,
                _ => {}
            }
        } else if status == UnitStatus::Failed {
            self.counts.failed += 1;
        }
        unit.set_status(status);
        trace!(src = %unit.source.display(), ?status, "Unit settled");
        self.notify(|observer, job| observer.on_unit_finished(job, unit));
        self.emit_progress(false);
    }

    fn finish(&mut self, state: JobState) -> JobSummary {
        self.job.current_unit = None;
        self.job.finished_at = Some(Utc::now());
        self.emit_progress(true);
        self.set_state(state);
        info!(
            job_id = %self.job.id,
            state = %state,
            completed = self.counts.completed,
            skipped = self.counts.skipped,
            failed = self.counts.failed,
            cancelled = self.counts.cancelled,
            done_bytes = self.job.totals.done_bytes,
            planned_bytes = self.job.totals.planned_bytes,
            "Job finished"
        );
        let summary = self.summary();
        self.notify(|observer, _| observer.on_job_completed(&summary));
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs_ops;
    use crate::mounts::LEGACY_SIZE_CEILING;
    use crate::progress::ProgressSnapshot;
    use crate::trash::DirectoryTrash;
    use crossbeam_channel::{unbounded, Sender};
    use std::fs;
    use std::io;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Mutex;

    fn quick_config() -> EngineConfig {
        EngineConfig {
            retry_backoff_ms: 1,
            ..EngineConfig::default()
        }
    }

    fn controller(job: JobDescriptor) -> JobController {
        JobController::new(job, quick_config(), Collaborators::default())
            .expect("Failed to build controller")
    }

    fn finished(outcome: Result<RunOutcome, EngineError>) -> JobSummary {
        match outcome.expect("Run should not error") {
            RunOutcome::Finished(summary) => summary,
            RunOutcome::AwaitingDecision(query) => panic!("unexpected conflict on {:?}", query),
            RunOutcome::AwaitingErrorDecision(query) => panic!("unexpected failure {:?}", query),
        }
    }

    fn awaiting_error(outcome: Result<RunOutcome, EngineError>) -> ErrorQuery {
        match outcome.expect("Run should not error") {
            RunOutcome::AwaitingErrorDecision(query) => query,
            other => panic!("expected an error decision, got {:?}", other),
        }
    }

    fn ask_config() -> EngineConfig {
        EngineConfig {
            error_policy: ErrorPolicy::Ask,
            ..quick_config()
        }
    }

    #[cfg(unix)]
    fn cross_device(_from: &Path, _to: &Path) -> io::Result<()> {
        Err(io::Error::from_raw_os_error(libc::EXDEV))
    }

    fn write_tree(root: &Path) {
        fs::create_dir_all(root.join("sub").join("deeper")).expect("Failed to create dirs");
        fs::write(root.join("a.txt"), "alpha").expect("Failed to write a");
        fs::write(root.join("sub").join("b.txt"), "bravo!").expect("Failed to write b");
        fs::write(root.join("sub").join("deeper").join("c.bin"), vec![3u8; 300])
            .expect("Failed to write c");
    }

    /// Trash that fails `failures` times with `kind` before succeeding.
    struct FlakyTrash {
        failures: u32,
        kind: io::ErrorKind,
        calls: AtomicU32,
    }

    impl FlakyTrash {
        fn new(failures: u32, kind: io::ErrorKind) -> Self {
            FlakyTrash {
                failures,
                kind,
                calls: AtomicU32::new(0),
            }
        }
    }

    impl TrashBackend for FlakyTrash {
        fn move_to_trash(&self, _path: &Path) -> io::Result<crate::external::TrashRecordId> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(io::Error::from(self.kind))
            } else {
                Ok(crate::external::TrashRecordId::new())
            }
        }

        fn restore_from_trash(
            &self,
            _record: crate::external::TrashRecordId,
            _destination: &Path,
        ) -> io::Result<()> {
            Ok(())
        }
    }

    struct FakeMounts {
        writable: bool,
        ceiling: Option<u64>,
    }

    impl MountInfo for FakeMounts {
        fn is_target_writable(&self, _path: &Path) -> bool {
            self.writable
        }

        fn free_space(&self, _path: &Path) -> io::Result<u64> {
            Ok(u64::MAX)
        }

        fn size_ceiling(&self, _path: &Path) -> Option<u64> {
            self.ceiling
        }
    }

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
    }

    struct SharedRecorder(Arc<Recorder>);

    impl ProgressCallback for SharedRecorder {
        fn on_state_changed(&self, job: &JobDescriptor) {
            self.0.push(format!("state:{}", job.state));
        }

        fn on_unit_started(&self, _job: &JobDescriptor, unit: &TransferUnit) {
            self.0.push(format!("started:{}", unit.name()));
        }

        fn on_unit_finished(&self, _job: &JobDescriptor, unit: &TransferUnit) {
            self.0.push(format!("finished:{}:{:?}", unit.name(), unit.status()));
        }

        fn on_job_completed(&self, summary: &JobSummary) {
            self.0.push(format!("completed:{}", summary.state));
        }
    }

    impl Recorder {
        fn push(&self, call: String) {
            self.calls.lock().expect("recorder lock").push(call);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().expect("recorder lock").clone()
        }
    }

    #[test]
    fn test_create_job_validates() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let file = temp_dir.path().join("f.txt");
        fs::write(&file, "x").expect("Failed to write");

        assert!(matches!(
            create_job(Operation::Copy, vec![], Some(temp_dir.path().into()), ConflictPolicy::Ask),
            Err(EngineError::NoRoots)
        ));
        assert!(matches!(
            create_job(Operation::Move, vec![Entry::regular(&file)], None, ConflictPolicy::Ask),
            Err(EngineError::MissingTarget { .. })
        ));
        assert!(matches!(
            create_job(Operation::Copy, vec![Entry::regular(&file)], Some(file.clone()), ConflictPolicy::Ask),
            Err(EngineError::TargetNotDirectory { .. })
        ));
        assert!(matches!(
            create_job(Operation::Restore, vec![Entry::regular(&file)], None, ConflictPolicy::Ask),
            Err(EngineError::UnsupportedEntry { .. })
        ));

        let job = create_job(Operation::Delete, vec![Entry::regular(&file)], None, ConflictPolicy::Ask)
            .expect("Delete needs no target");
        assert_eq!(job.state, JobState::Planning);
    }

    #[test]
    fn test_copy_tree_totals_converge() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("src");
        write_tree(&src);
        let dst = temp_dir.path().join("dst");

        let job = create_job(Operation::Copy, vec![Entry::regular(&src)], Some(dst.clone()), ConflictPolicy::Ask)
            .expect("Failed to create job");
        let summary = finished(controller(job).run());

        assert_eq!(summary.state, JobState::Completed);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.totals.done_bytes, summary.totals.planned_bytes);
        assert_eq!(summary.totals.planned_bytes, 311);
        assert_eq!(summary.totals.transferred_bytes, 311);
        assert_eq!(summary.totals.done_items, summary.totals.planned_items);
        for rel in ["a.txt", "sub/b.txt", "sub/deeper/c.bin"] {
            let a = fs::metadata(src.join(rel)).expect("source exists").len();
            let b = fs::metadata(dst.join("src").join(rel)).expect("copy exists").len();
            assert_eq!(a, b, "size of {}", rel);
        }
    }

    #[test]
    fn test_conflict_suspends_until_decided() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("a.txt");
        fs::write(&src, "incoming").expect("Failed to write");
        let dst = temp_dir.path().join("dst");
        fs::create_dir(&dst).expect("Failed to create dst");
        fs::write(dst.join("a.txt"), "existing").expect("Failed to write");

        let job = create_job(Operation::Copy, vec![Entry::regular(&src)], Some(dst.clone()), ConflictPolicy::Ask)
            .expect("Failed to create job");
        let mut controller = controller(job);

        match controller.run().expect("Run should not error") {
            RunOutcome::AwaitingDecision(query) => assert_eq!(query.dest_name, "a.txt"),
            RunOutcome::Finished(summary) => panic!("expected a conflict, got {:?}", summary),
            RunOutcome::AwaitingErrorDecision(query) => panic!("expected a conflict, got {:?}", query),
        }
        assert_eq!(controller.state(), JobState::AwaitingConflictDecision);
        assert!(matches!(controller.run(), Err(EngineError::InvalidState { .. })));

        controller
            .supply_decision(ConflictDecision::for_all(ConflictAction::KeepBoth))
            .expect("Decision should be accepted");
        assert_eq!(controller.descriptor().conflict_policy, ConflictPolicy::KeepBoth);

        let summary = finished(controller.run());
        assert_eq!(summary.completed, 1);
        assert_eq!(fs::read_to_string(dst.join("a.txt")).expect("read"), "existing");
        assert_eq!(fs::read_to_string(dst.join("a (copy).txt")).expect("read"), "incoming");
    }

    #[test]
    fn test_repeated_keep_both_jobs_never_overwrite() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("a.txt");
        fs::write(&src, "data").expect("Failed to write");
        let dst = temp_dir.path().join("dst");
        fs::create_dir(&dst).expect("Failed to create dst");
        fs::write(dst.join("a.txt"), "first").expect("Failed to write");

        for _ in 0..3 {
            let job = create_job(
                Operation::Copy,
                vec![Entry::regular(&src)],
                Some(dst.clone()),
                ConflictPolicy::KeepBoth,
            )
            .expect("Failed to create job");
            let summary = finished(controller(job).run());
            assert_eq!(summary.completed, 1);
        }
        assert!(dst.join("a (copy).txt").exists());
        assert!(dst.join("a (copy 1).txt").exists());
        assert!(dst.join("a (copy 2).txt").exists());
        assert_eq!(fs::read_to_string(dst.join("a.txt")).expect("read"), "first");
    }

    #[test]
    fn test_skip_policy_counts_skipped_bytes_as_done() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("a.txt");
        fs::write(&src, "12345").expect("Failed to write");
        let dst = temp_dir.path().join("dst");
        fs::create_dir(&dst).expect("Failed to create dst");
        fs::write(dst.join("a.txt"), "old").expect("Failed to write");

        let job = create_job(Operation::Copy, vec![Entry::regular(&src)], Some(dst.clone()), ConflictPolicy::Skip)
            .expect("Failed to create job");
        let summary = finished(controller(job).run());
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.totals.done_bytes, 5);
        assert_eq!(summary.totals.transferred_bytes, 0);
        assert_eq!(fs::read_to_string(dst.join("a.txt")).expect("read"), "old");
    }

    #[test]
    fn test_merge_policy_combines_directories() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("docs");
        fs::create_dir(&src).expect("Failed to create src");
        fs::write(src.join("new.txt"), "new").expect("Failed to write");
        let dst = temp_dir.path().join("dst");
        fs::create_dir_all(dst.join("docs")).expect("Failed to create dst");
        fs::write(dst.join("docs").join("old.txt"), "old").expect("Failed to write");

        let job = create_job(Operation::Copy, vec![Entry::regular(&src)], Some(dst.clone()), ConflictPolicy::Merge)
            .expect("Failed to create job");
        let summary = finished(controller(job).run());
        assert_eq!(summary.state, JobState::Completed);
        assert!(dst.join("docs").join("old.txt").exists());
        assert!(dst.join("docs").join("new.txt").exists());
    }

    #[test]
    fn test_target_inside_source_writes_nothing() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("src");
        write_tree(&src);
        let inner = src.join("sub");

        let job = create_job(Operation::Copy, vec![Entry::regular(&src)], Some(inner.clone()), ConflictPolicy::Ask)
            .expect("Failed to create job");
        let summary = finished(controller(job).run());

        assert_eq!(summary.failed, 1);
        assert_eq!(summary.errors[0].kind, ErrorKind::TargetInsideSource);
        assert_eq!(summary.errors[0].recovery, Recovery::Skipped);
        assert!(!inner.join("src").exists());
        assert_eq!(summary.totals.transferred_bytes, 0);
    }

    #[test]
    fn test_missing_root_leaves_siblings_running() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let present = temp_dir.path().join("present.txt");
        fs::write(&present, "here").expect("Failed to write");
        let dst = temp_dir.path().join("dst");

        let job = create_job(
            Operation::Copy,
            vec![Entry::regular(temp_dir.path().join("vanished.txt")), Entry::regular(&present)],
            Some(dst.clone()),
            ConflictPolicy::Ask,
        )
        .expect("Failed to create job");
        let config = EngineConfig {
            error_policy: ErrorPolicy::AbortOnFirstError,
            ..quick_config()
        };
        let mut controller =
            JobController::new(job, config, Collaborators::default()).expect("Failed to build");
        let summary = finished(controller.run());

        assert_eq!(summary.state, JobState::Completed);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.errors[0].kind, ErrorKind::SourceMissing);
        assert!(dst.join("present.txt").exists());
    }

    #[test]
    fn test_move_tree_within_filesystem() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("src");
        write_tree(&src);
        let dst = temp_dir.path().join("dst");

        let job = create_job(Operation::Move, vec![Entry::regular(&src)], Some(dst.clone()), ConflictPolicy::Ask)
            .expect("Failed to create job");
        let summary = finished(controller(job).run());

        assert_eq!(summary.state, JobState::Completed);
        assert!(!src.exists());
        assert_eq!(fs::read_to_string(dst.join("src").join("a.txt")).expect("read"), "alpha");
        assert_eq!(
            fs::read(dst.join("src").join("sub").join("deeper").join("c.bin")).expect("read").len(),
            300
        );
    }

    #[test]
    fn test_move_merge_removes_emptied_source() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("docs");
        fs::create_dir(&src).expect("Failed to create src");
        fs::write(src.join("new.txt"), "new").expect("Failed to write");
        let dst = temp_dir.path().join("dst");
        fs::create_dir_all(dst.join("docs")).expect("Failed to create dst");

        let job = create_job(Operation::Move, vec![Entry::regular(&src)], Some(dst.clone()), ConflictPolicy::Merge)
            .expect("Failed to create job");
        let summary = finished(controller(job).run());
        assert_eq!(summary.state, JobState::Completed);
        assert!(!src.exists());
        assert!(dst.join("docs").join("new.txt").exists());
    }

    #[test]
    fn test_move_keeps_directory_with_skipped_child() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("docs");
        fs::create_dir(&src).expect("Failed to create src");
        fs::write(src.join("clash.txt"), "mine").expect("Failed to write");
        fs::write(src.join("free.txt"), "free").expect("Failed to write");
        let dst = temp_dir.path().join("dst");
        fs::create_dir_all(dst.join("docs")).expect("Failed to create dst");
        fs::write(dst.join("docs").join("clash.txt"), "theirs").expect("Failed to write");

        let job = create_job(Operation::Move, vec![Entry::regular(&src)], Some(dst.clone()), ConflictPolicy::Ask)
            .expect("Failed to create job");
        let mut controller = controller(job);
        assert!(matches!(controller.run(), Ok(RunOutcome::AwaitingDecision(_))));
        controller
            .supply_decision(ConflictDecision::once(ConflictAction::Merge))
            .expect("merge");
        assert!(matches!(controller.run(), Ok(RunOutcome::AwaitingDecision(_))));
        controller
            .supply_decision(ConflictDecision::once(ConflictAction::Skip))
            .expect("skip");
        let summary = finished(controller.run());

        assert_eq!(summary.skipped, 1);
        assert!(src.join("clash.txt").exists());
        assert!(!src.join("free.txt").exists());
        assert!(dst.join("docs").join("free.txt").exists());
        assert_eq!(fs::read_to_string(dst.join("docs").join("clash.txt")).expect("read"), "theirs");
    }

    #[test]
    fn test_delete_tree_post_order() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("src");
        write_tree(&src);

        let job = create_job(Operation::Delete, vec![Entry::regular(&src)], None, ConflictPolicy::Ask)
            .expect("Failed to create job");
        let summary = finished(controller(job).run());
        assert_eq!(summary.state, JobState::Completed);
        assert_eq!(summary.failed, 0);
        assert!(!src.exists());
    }

    #[test]
    fn test_trash_and_restore_jobs() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let file = temp_dir.path().join("notes.txt");
        fs::write(&file, "remember").expect("Failed to write");
        let trash = Arc::new(DirectoryTrash::new(temp_dir.path().join(".trash")));

        let job = create_job(Operation::Trash, vec![Entry::regular(&file)], None, ConflictPolicy::Ask)
            .expect("Failed to create job");
        let mut trash_job = JobController::new(job, quick_config(), Collaborators::with_trash(trash.clone()))
            .expect("Failed to build");
        assert_eq!(finished(trash_job.run()).completed, 1);
        assert!(!file.exists());

        let (record, _) = trash.items().into_iter().next().expect("one trashed item");
        let entry = trash.entry(record).expect("entry for record");
        let job = create_job(Operation::Restore, vec![entry], None, ConflictPolicy::Ask)
            .expect("Failed to create job");
        let mut restore_job = JobController::new(job, quick_config(), Collaborators::with_trash(trash.clone()))
            .expect("Failed to build");
        assert_eq!(finished(restore_job.run()).completed, 1);
        assert_eq!(fs::read_to_string(&file).expect("read"), "remember");
    }

    #[test]
    fn test_transient_failure_retried_silently() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let file = temp_dir.path().join("a.txt");
        fs::write(&file, "x").expect("Failed to write");
        let trash = Arc::new(FlakyTrash::new(2, io::ErrorKind::WouldBlock));

        let job = create_job(Operation::Trash, vec![Entry::regular(&file)], None, ConflictPolicy::Ask)
            .expect("Failed to create job");
        let mut controller = JobController::new(job, quick_config(), Collaborators::with_trash(trash.clone()))
            .expect("Failed to build");
        let summary = finished(controller.run());

        assert_eq!(summary.completed, 1);
        assert_eq!(summary.failed, 0);
        assert_eq!(trash.calls.load(Ordering::SeqCst), 3);
        assert_eq!(summary.errors.len(), 1);
        assert_eq!(summary.errors[0].recovery, Recovery::Retried { attempts: 2 });
    }

    #[test]
    fn test_retries_are_bounded() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let file = temp_dir.path().join("a.txt");
        fs::write(&file, "x").expect("Failed to write");
        let trash = Arc::new(FlakyTrash::new(u32::MAX, io::ErrorKind::WouldBlock));

        let job = create_job(Operation::Trash, vec![Entry::regular(&file)], None, ConflictPolicy::Ask)
            .expect("Failed to create job");
        let mut controller = JobController::new(job, quick_config(), Collaborators::with_trash(trash.clone()))
            .expect("Failed to build");
        let summary = finished(controller.run());

        assert_eq!(summary.failed, 1);
        assert_eq!(trash.calls.load(Ordering::SeqCst), 4);
        assert_eq!(summary.errors[0].attempts, 4);
        assert_eq!(summary.errors[0].recovery, Recovery::Skipped);
    }

    #[test]
    fn test_permission_failure_never_retried() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let file = temp_dir.path().join("a.txt");
        fs::write(&file, "x").expect("Failed to write");
        let trash = Arc::new(FlakyTrash::new(u32::MAX, io::ErrorKind::PermissionDenied));

        let job = create_job(Operation::Trash, vec![Entry::regular(&file)], None, ConflictPolicy::Ask)
            .expect("Failed to create job");
        let mut controller = JobController::new(job, quick_config(), Collaborators::with_trash(trash.clone()))
            .expect("Failed to build");
        let summary = finished(controller.run());

        assert_eq!(trash.calls.load(Ordering::SeqCst), 1);
        assert_eq!(summary.errors[0].kind, ErrorKind::PermissionDenied);
        assert_eq!(summary.errors[0].attempts, 1);
        assert!(summary.errors[0].to_string().starts_with("Permission error, cause: "));
    }

    #[test]
    fn test_abort_on_first_error_stops_job() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let a = temp_dir.path().join("a.txt");
        let b = temp_dir.path().join("b.txt");
        fs::write(&a, "a").expect("Failed to write");
        fs::write(&b, "b").expect("Failed to write");
        let trash = Arc::new(FlakyTrash::new(u32::MAX, io::ErrorKind::PermissionDenied));

        let job = create_job(
            Operation::Trash,
            vec![Entry::regular(&a), Entry::regular(&b)],
            None,
            ConflictPolicy::Ask,
        )
        .expect("Failed to create job");
        let config = EngineConfig {
            error_policy: ErrorPolicy::AbortOnFirstError,
            ..quick_config()
        };
        let mut controller = JobController::new(job, config, Collaborators::with_trash(trash.clone()))
            .expect("Failed to build");
        let summary = finished(controller.run());

        assert_eq!(summary.state, JobState::Failed);
        assert!(summary.has_failures());
        assert_eq!(trash.calls.load(Ordering::SeqCst), 1);
        assert_eq!(summary.errors[0].recovery, Recovery::Aborted);
    }

    #[test]
    fn test_read_only_target_rejected() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let file = temp_dir.path().join("a.txt");
        fs::write(&file, "x").expect("Failed to write");
        let dst = temp_dir.path().join("dst");

        let job = create_job(Operation::Copy, vec![Entry::regular(&file)], Some(dst.clone()), ConflictPolicy::Ask)
            .expect("Failed to create job");
        let collaborators = Collaborators {
            mounts: Arc::new(FakeMounts {
                writable: false,
                ceiling: None,
            }),
            ..Collaborators::default()
        };
        let mut controller = JobController::new(job, quick_config(), collaborators).expect("Failed to build");
        let summary = finished(controller.run());

        assert_eq!(summary.errors[0].kind, ErrorKind::TargetReadOnly);
        assert!(!dst.exists());
    }

    #[test]
    fn test_five_gib_file_refused_on_legacy_filesystem() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let big = temp_dir.path().join("disk.img");
        let file = fs::File::create(&big).expect("Failed to create");
        file.set_len(5 * 1024 * 1024 * 1024).expect("Failed to size sparse file");
        drop(file);
        let dst = temp_dir.path().join("usb");

        let job = create_job(Operation::Copy, vec![Entry::regular(&big)], Some(dst.clone()), ConflictPolicy::Ask)
            .expect("Failed to create job");
        let collaborators = Collaborators {
            mounts: Arc::new(FakeMounts {
                writable: true,
                ceiling: Some(LEGACY_SIZE_CEILING),
            }),
            ..Collaborators::default()
        };
        let mut controller = JobController::new(job, quick_config(), collaborators).expect("Failed to build");
        let summary = finished(controller.run());

        assert_eq!(summary.failed, 1);
        assert_eq!(summary.errors[0].kind, ErrorKind::FileTooLarge);
        assert_eq!(summary.totals.transferred_bytes, 0);
        assert!(!dst.join("disk.img").exists());
        assert!(!dst.join(".disk.img.part").exists());
    }

    /// Sends Cancel once the job is partway through the second file.
    struct CancelMidway {
        commands: Sender<JobCommand>,
        threshold: u64,
        sent: AtomicBool,
    }

    impl ProgressCallback for CancelMidway {
        fn on_progress(&self, _job: &JobDescriptor, snapshot: &ProgressSnapshot) {
            if snapshot.done_bytes > self.threshold && !self.sent.swap(true, Ordering::SeqCst) {
                let _ = self.commands.send(JobCommand::Cancel);
            }
        }
    }

    #[test]
    fn test_cancel_mid_unit_keeps_completed_work() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let first = temp_dir.path().join("a.txt");
        let second = temp_dir.path().join("b.bin");
        fs::write(&first, vec![1u8; 10]).expect("Failed to write");
        fs::write(&second, vec![2u8; 4096]).expect("Failed to write");
        let dst = temp_dir.path().join("dst");

        let job = create_job(
            Operation::Copy,
            vec![Entry::regular(&first), Entry::regular(&second)],
            Some(dst.clone()),
            ConflictPolicy::Ask,
        )
        .expect("Failed to create job");
        let config = EngineConfig {
            chunk_size: 16,
            progress_interval_ms: 0,
            ..quick_config()
        };
        let (tx, rx) = unbounded();
        let observer = CancelMidway {
            commands: tx,
            threshold: 10,
            sent: AtomicBool::new(false),
        };
        let mut controller = JobController::new(job, config, Collaborators::default())
            .expect("Failed to build")
            .with_observer(Box::new(observer))
            .with_commands(rx);
        let summary = finished(controller.run());

        assert_eq!(summary.state, JobState::Cancelled);
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.cancelled, 1);
        assert_eq!(fs::read(dst.join("a.txt")).expect("read").len(), 10);
        assert!(!dst.join("b.bin").exists());
        assert!(!dst.join(".b.bin.part").exists());
        assert_eq!(summary.totals.done_bytes, 10);
    }

    #[test]
    fn test_queued_pause_and_resume() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("a.txt");
        fs::write(&src, "paused").expect("Failed to write");
        let dst = temp_dir.path().join("dst");

        let job = create_job(Operation::Copy, vec![Entry::regular(&src)], Some(dst.clone()), ConflictPolicy::Ask)
            .expect("Failed to create job");
        let (tx, rx) = unbounded();
        tx.send(JobCommand::Pause).expect("send");
        tx.send(JobCommand::Resume).expect("send");
        let recorder = Arc::new(Recorder::default());
        let mut controller = JobController::new(job, quick_config(), Collaborators::default())
            .expect("Failed to build")
            .with_observer(Box::new(SharedRecorder(recorder.clone())))
            .with_commands(rx);
        let summary = finished(controller.run());

        assert_eq!(summary.state, JobState::Completed);
        let calls = recorder.calls();
        let paused = calls.iter().position(|c| c == "state:paused").expect("paused");
        let resumed = calls.iter().rposition(|c| c == "state:running").expect("running");
        assert!(paused < resumed);
        assert!(dst.join("a.txt").exists());
    }

    #[test]
    fn test_observer_sees_lifecycle_in_order() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("a.txt");
        fs::write(&src, "x").expect("Failed to write");
        let dst = temp_dir.path().join("dst");

        let job = create_job(Operation::Copy, vec![Entry::regular(&src)], Some(dst), ConflictPolicy::Ask)
            .expect("Failed to create job");
        let recorder = Arc::new(Recorder::default());
        let mut controller = controller(job).with_observer(Box::new(SharedRecorder(recorder.clone())));
        finished(controller.run());

        assert_eq!(
            recorder.calls(),
            vec![
                "state:running".to_string(),
                "started:a.txt".to_string(),
                "finished:a.txt:Completed".to_string(),
                "state:completed".to_string(),
                "completed:completed".to_string(),
            ]
        );
    }

    #[test]
    fn test_cancel_while_awaiting_decision() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("a.txt");
        fs::write(&src, "x").expect("Failed to write");
        let dst = temp_dir.path().join("dst");
        fs::create_dir(&dst).expect("Failed to create dst");
        fs::write(dst.join("a.txt"), "y").expect("Failed to write");

        let job = create_job(Operation::Copy, vec![Entry::regular(&src)], Some(dst.clone()), ConflictPolicy::Ask)
            .expect("Failed to create job");
        let mut controller = controller(job);
        assert!(matches!(controller.run(), Ok(RunOutcome::AwaitingDecision(_))));

        let summary = controller.cancel().expect("Cancel should be accepted");
        assert_eq!(summary.state, JobState::Cancelled);
        assert_eq!(summary.cancelled, 1);
        assert!(controller.cancel().is_err());
        assert_eq!(fs::read_to_string(dst.join("a.txt")).expect("read"), "y");
    }

    #[test]
    fn test_checksum_verification_passes_for_intact_copy() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("a.bin");
        fs::write(&src, vec![9u8; 1000]).expect("Failed to write");
        let dst = temp_dir.path().join("dst");

        let job = create_job(Operation::Copy, vec![Entry::regular(&src)], Some(dst.clone()), ConflictPolicy::Ask)
            .expect("Failed to create job");
        let config = EngineConfig {
            verify: Some(crate::checksums::ChecksumAlgorithm::Blake3),
            chunk_size: 64,
            ..quick_config()
        };
        let mut controller = JobController::new(job, config, Collaborators::default()).expect("Failed to build");
        let summary = finished(controller.run());
        assert_eq!(summary.completed, 1);
        assert!(summary.errors.is_empty());
    }

    #[test]
    fn test_longest_name_copies() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let name = format!("{}.txt", "n".repeat(fs_ops::NAME_MAX - 4));
        let src = temp_dir.path().join(&name);
        fs::write(&src, "long").expect("Failed to write");
        let dst = temp_dir.path().join("dst");

        let job = create_job(Operation::Copy, vec![Entry::regular(&src)], Some(dst.clone()), ConflictPolicy::Ask)
            .expect("Failed to create job");
        let summary = finished(controller(job).run());

        assert_eq!(summary.completed, 1);
        assert!(summary.errors.is_empty());
        assert_eq!(fs::read_to_string(dst.join(&name)).expect("read"), "long");
        assert_eq!(fs::read_dir(&dst).expect("list").count(), 1);
    }

    #[test]
    fn test_keep_both_on_longest_name() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let name = format!("{}.txt", "n".repeat(fs_ops::NAME_MAX - 4));
        let src = temp_dir.path().join(&name);
        fs::write(&src, "incoming").expect("Failed to write");
        let dst = temp_dir.path().join("dst");
        fs::create_dir(&dst).expect("Failed to create dst");
        fs::write(dst.join(&name), "existing").expect("Failed to write");

        let job = create_job(
            Operation::Copy,
            vec![Entry::regular(&src)],
            Some(dst.clone()),
            ConflictPolicy::KeepBoth,
        )
        .expect("Failed to create job");
        let summary = finished(controller(job).run());

        assert_eq!(summary.completed, 1);
        let copy_name = format!("{} (copy).txt", "n".repeat(fs_ops::NAME_MAX - 11));
        assert_eq!(copy_name.len(), fs_ops::NAME_MAX);
        assert_eq!(fs::read_to_string(dst.join(&copy_name)).expect("read"), "incoming");
        assert_eq!(fs::read_to_string(dst.join(&name)).expect("read"), "existing");
    }

    #[test]
    fn test_ask_policy_suspends_on_failure() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let a = temp_dir.path().join("a.txt");
        let b = temp_dir.path().join("b.txt");
        fs::write(&a, "a").expect("Failed to write");
        fs::write(&b, "b").expect("Failed to write");
        let trash = Arc::new(FlakyTrash::new(u32::MAX, io::ErrorKind::PermissionDenied));

        let job = create_job(
            Operation::Trash,
            vec![Entry::regular(&a), Entry::regular(&b)],
            None,
            ConflictPolicy::Ask,
        )
        .expect("Failed to create job");
        let mut controller = JobController::new(job, ask_config(), Collaborators::with_trash(trash.clone()))
            .expect("Failed to build");

        let query = awaiting_error(controller.run());
        assert_eq!(query.kind, ErrorKind::PermissionDenied);
        assert_eq!(query.unit.name(), "a.txt");
        assert_eq!(query.attempts, 1);
        assert_eq!(controller.state(), JobState::AwaitingErrorDecision);
        assert_eq!(controller.pending_error().map(|q| q.unit.id), Some(query.unit.id));
        assert!(controller.run().is_err());
        assert!(controller
            .supply_decision(ConflictDecision::once(ConflictAction::Skip))
            .is_err());

        controller
            .supply_error_decision(ErrorDecision::once(ErrorAction::Skip))
            .expect("Skip should be accepted");
        assert_eq!(controller.errors().len(), 1);
        assert_eq!(controller.errors()[0].recovery, Recovery::Skipped);

        let query = awaiting_error(controller.run());
        assert_eq!(query.unit.name(), "b.txt");
        controller
            .supply_error_decision(ErrorDecision::once(ErrorAction::Skip))
            .expect("Skip should be accepted");
        let summary = finished(controller.run());

        assert_eq!(summary.state, JobState::Completed);
        assert_eq!(summary.failed, 2);
        assert_eq!(trash.calls.load(Ordering::SeqCst), 2);
        assert_eq!(summary.totals.done_bytes, summary.totals.planned_bytes);
        assert!(controller
            .supply_error_decision(ErrorDecision::once(ErrorAction::Skip))
            .is_err());
    }

    #[test]
    fn test_ask_policy_skip_for_all_stops_asking() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let paths: Vec<_> = ["a.txt", "b.txt", "c.txt"]
            .iter()
            .map(|name| temp_dir.path().join(name))
            .collect();
        for path in &paths {
            fs::write(path, "x").expect("Failed to write");
        }
        let trash = Arc::new(FlakyTrash::new(u32::MAX, io::ErrorKind::PermissionDenied));

        let job = create_job(
            Operation::Trash,
            paths.iter().map(Entry::regular).collect(),
            None,
            ConflictPolicy::Ask,
        )
        .expect("Failed to create job");
        let mut controller = JobController::new(job, ask_config(), Collaborators::with_trash(trash.clone()))
            .expect("Failed to build");

        awaiting_error(controller.run());
        controller
            .supply_error_decision(ErrorDecision::for_all(ErrorAction::Skip))
            .expect("Skip should be accepted");
        assert_eq!(controller.classifier.policy(), ErrorPolicy::Continue);
        let summary = finished(controller.run());

        assert_eq!(summary.failed, 3);
        assert_eq!(trash.calls.load(Ordering::SeqCst), 3);
        assert!(summary.errors.iter().all(|e| e.recovery == Recovery::Skipped));
    }

    #[test]
    fn test_ask_policy_retry_runs_unit_again() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let file = temp_dir.path().join("a.txt");
        fs::write(&file, "x").expect("Failed to write");
        let trash = Arc::new(FlakyTrash::new(1, io::ErrorKind::PermissionDenied));

        let job = create_job(Operation::Trash, vec![Entry::regular(&file)], None, ConflictPolicy::Ask)
            .expect("Failed to create job");
        let mut controller = JobController::new(job, ask_config(), Collaborators::with_trash(trash.clone()))
            .expect("Failed to build");

        awaiting_error(controller.run());
        controller
            .supply_error_decision(ErrorDecision::once(ErrorAction::Retry))
            .expect("Retry should be accepted");
        assert_eq!(controller.state(), JobState::Running);
        let summary = finished(controller.run());

        assert_eq!(summary.completed, 1);
        assert_eq!(summary.failed, 0);
        assert_eq!(trash.calls.load(Ordering::SeqCst), 2);
        assert_eq!(summary.errors.len(), 1);
        assert_eq!(summary.errors[0].kind, ErrorKind::PermissionDenied);
        assert_eq!(summary.errors[0].recovery, Recovery::Retried { attempts: 1 });
        assert_eq!(summary.errors[0].attempts, 2);
    }

    #[test]
    fn test_ask_policy_abort_fails_job() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let a = temp_dir.path().join("a.txt");
        let b = temp_dir.path().join("b.txt");
        fs::write(&a, "a").expect("Failed to write");
        fs::write(&b, "b").expect("Failed to write");
        let trash = Arc::new(FlakyTrash::new(u32::MAX, io::ErrorKind::PermissionDenied));

        let job = create_job(
            Operation::Trash,
            vec![Entry::regular(&a), Entry::regular(&b)],
            None,
            ConflictPolicy::Ask,
        )
        .expect("Failed to create job");
        let mut controller = JobController::new(job, ask_config(), Collaborators::with_trash(trash.clone()))
            .expect("Failed to build");

        awaiting_error(controller.run());
        controller
            .supply_error_decision(ErrorDecision::once(ErrorAction::Abort))
            .expect("Abort should be accepted");
        assert_eq!(controller.state(), JobState::Failed);
        let summary = finished(controller.run());

        assert_eq!(summary.state, JobState::Failed);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.errors[0].recovery, Recovery::Aborted);
        assert_eq!(trash.calls.load(Ordering::SeqCst), 1);
        assert!(b.exists());
    }

    #[test]
    fn test_ask_policy_covers_rejected_roots() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let file = temp_dir.path().join("a.txt");
        fs::write(&file, "x").expect("Failed to write");
        let dst = temp_dir.path().join("dst");

        let job = create_job(Operation::Copy, vec![Entry::regular(&file)], Some(dst.clone()), ConflictPolicy::Ask)
            .expect("Failed to create job");
        let collaborators = Collaborators {
            mounts: Arc::new(FakeMounts {
                writable: false,
                ceiling: None,
            }),
            ..Collaborators::default()
        };
        let mut controller = JobController::new(job, ask_config(), collaborators).expect("Failed to build");

        let query = awaiting_error(controller.run());
        assert_eq!(query.kind, ErrorKind::TargetReadOnly);
        let summary = controller.cancel().expect("Cancel should be accepted");

        assert_eq!(summary.state, JobState::Cancelled);
        assert_eq!(summary.cancelled, 1);
        assert!(summary.errors.is_empty());
        assert!(!dst.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_move_tree_across_filesystems() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("src");
        write_tree(&src);
        let dst = temp_dir.path().join("dst");

        let job = create_job(Operation::Move, vec![Entry::regular(&src)], Some(dst.clone()), ConflictPolicy::Ask)
            .expect("Failed to create job");
        let mut controller = controller(job);
        controller.executor.set_rename(cross_device);
        let summary = finished(controller.run());

        assert_eq!(summary.state, JobState::Completed);
        assert!(summary.errors.is_empty());
        assert!(!src.exists());
        assert_eq!(summary.totals.planned_bytes, 311);
        assert_eq!(summary.totals.done_bytes, 311);
        assert_eq!(summary.totals.transferred_bytes, 311);
        assert_eq!(fs::read_to_string(dst.join("src").join("sub").join("b.txt")).expect("read"), "bravo!");
        assert_eq!(
            fs::read(dst.join("src").join("sub").join("deeper").join("c.bin")).expect("read"),
            vec![3u8; 300]
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_cancel_during_cross_filesystem_move_keeps_source() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("b.bin");
        fs::write(&src, vec![2u8; 4096]).expect("Failed to write");
        let dst = temp_dir.path().join("dst");

        let job = create_job(Operation::Move, vec![Entry::regular(&src)], Some(dst.clone()), ConflictPolicy::Ask)
            .expect("Failed to create job");
        let config = EngineConfig {
            chunk_size: 16,
            progress_interval_ms: 0,
            ..quick_config()
        };
        let (tx, rx) = unbounded();
        let observer = CancelMidway {
            commands: tx,
            threshold: 100,
            sent: AtomicBool::new(false),
        };
        let mut controller = JobController::new(job, config, Collaborators::default())
            .expect("Failed to build")
            .with_observer(Box::new(observer))
            .with_commands(rx);
        controller.executor.set_rename(cross_device);
        let summary = finished(controller.run());

        assert_eq!(summary.state, JobState::Cancelled);
        assert_eq!(summary.cancelled, 1);
        assert_eq!(fs::read(&src).expect("source kept").len(), 4096);
        assert!(!dst.join("b.bin").exists());
        assert!(!dst.join(".b.bin.part").exists());
        assert_eq!(summary.totals.done_bytes, 0);
    }

    /// Pauses and immediately resumes once a copy is partway through a file.
    struct PauseMidway {
        commands: Sender<JobCommand>,
        threshold: u64,
        sent: AtomicBool,
        recorder: Arc<Recorder>,
    }

    impl ProgressCallback for PauseMidway {
        fn on_state_changed(&self, job: &JobDescriptor) {
            self.recorder.push(format!("state:{}", job.state));
        }

        fn on_unit_started(&self, _job: &JobDescriptor, unit: &TransferUnit) {
            self.recorder.push(format!("started:{}", unit.name()));
        }

        fn on_unit_finished(&self, _job: &JobDescriptor, unit: &TransferUnit) {
            self.recorder.push(format!("finished:{}:{:?}", unit.name(), unit.status()));
        }

        fn on_progress(&self, _job: &JobDescriptor, snapshot: &ProgressSnapshot) {
            if snapshot.done_bytes > self.threshold && !self.sent.swap(true, Ordering::SeqCst) {
                let _ = self.commands.send(JobCommand::Pause);
                let _ = self.commands.send(JobCommand::Resume);
            }
        }
    }

    #[test]
    fn test_pause_mid_chunk_resumes_same_unit() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let first = temp_dir.path().join("a.txt");
        let second = temp_dir.path().join("b.bin");
        fs::write(&first, vec![1u8; 10]).expect("Failed to write");
        let payload: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        fs::write(&second, &payload).expect("Failed to write");
        let dst = temp_dir.path().join("dst");

        let job = create_job(
            Operation::Copy,
            vec![Entry::regular(&first), Entry::regular(&second)],
            Some(dst.clone()),
            ConflictPolicy::Ask,
        )
        .expect("Failed to create job");
        let config = EngineConfig {
            chunk_size: 16,
            progress_interval_ms: 0,
            ..quick_config()
        };
        let (tx, rx) = unbounded();
        let recorder = Arc::new(Recorder::default());
        let observer = PauseMidway {
            commands: tx,
            threshold: 100,
            sent: AtomicBool::new(false),
            recorder: recorder.clone(),
        };
        let mut controller = JobController::new(job, config, Collaborators::default())
            .expect("Failed to build")
            .with_observer(Box::new(observer))
            .with_commands(rx);
        let summary = finished(controller.run());

        assert_eq!(summary.state, JobState::Completed);
        assert_eq!(summary.completed, 2);
        assert_eq!(summary.totals.transferred_bytes, 4106);
        assert_eq!(fs::read(dst.join("b.bin")).expect("read"), payload);

        let calls = recorder.calls();
        let position = |call: &str| calls.iter().position(|c| c == call).expect(call);
        let started = position("started:b.bin");
        let paused = position("state:paused");
        let resumed = calls.iter().rposition(|c| c == "state:running").expect("running");
        let done = position("finished:b.bin:Completed");
        assert!(started < paused && paused < resumed && resumed < done);
        assert_eq!(calls.iter().filter(|c| *c == "started:b.bin").count(), 1);
    }
}
