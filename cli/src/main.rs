//! filejob - Command-line front-end for the file transfer engine.
//!
//! Parses arguments, runs one job on a worker thread and renders its events:
//! a progress bar on stderr, interactive conflict and failure prompts, and a
//! summary on stderr or as JSON on stdout.

mod logging;

use std::fs;
use std::io::{self, BufRead, IsTerminal, Write};
use std::thread;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use crossbeam_channel::{never, select, unbounded, Receiver};
use filejob_engine::{
    create_job, spawn_job, ChecksumAlgorithm, Collaborators, ConflictAction, ConflictDecision,
    ConflictPolicy, ConflictQuery, DirectoryTrash, EngineConfig, Entry, ErrorAction,
    ErrorDecision, ErrorPolicy, ErrorQuery, ErrorRecord, JobEvent, JobHandle, JobState,
    JobSummary, Operation, ProgressSnapshot, Recovery,
};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, warn};

/// filejob - copy, move, link, trash and delete files with progress tracking
#[derive(Parser, Debug)]
#[command(name = "filejob")]
#[command(version)]
#[command(about = "Copy, move, link, trash and delete files with progress tracking")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// What to do when a destination name is taken
    #[arg(long, global = true, value_enum, default_value_t = OnConflict::Ask)]
    on_conflict: OnConflict,

    /// Stop at the first unit that cannot be completed
    #[arg(long, global = true)]
    abort_on_error: bool,

    /// Ask whether to retry, skip or abort when a unit fails
    #[arg(long, global = true, conflicts_with = "abort_on_error")]
    ask_on_error: bool,

    /// Verify copies with a checksum: crc32, md5, sha256, blake3
    #[arg(long, global = true, value_name = "ALGORITHM")]
    verify: Option<String>,

    /// Bytes per read/write chunk
    #[arg(long, global = true, value_name = "BYTES")]
    chunk_size: Option<usize>,

    /// JSON engine configuration; flags override its values
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Directory used by the trash command
    #[arg(long, global = true, value_name = "DIR")]
    trash_dir: Option<PathBuf>,

    /// Print the job summary as JSON on stdout
    #[arg(long, global = true)]
    json: bool,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Copy sources into a directory
    Copy(TransferArgs),
    /// Move sources into a directory
    Move(TransferArgs),
    /// Create symbolic links to sources inside a directory
    Link(TransferArgs),
    /// Move sources to the trash directory
    Trash(SourceArgs),
    /// Delete sources permanently
    Delete(SourceArgs),
}

#[derive(Args, Debug)]
struct TransferArgs {
    #[arg(required = true, value_name = "SOURCES")]
    sources: Vec<PathBuf>,

    /// Target directory
    #[arg(long, value_name = "DIR")]
    to: PathBuf,
}

#[derive(Args, Debug)]
struct SourceArgs {
    #[arg(required = true, value_name = "SOURCES")]
    sources: Vec<PathBuf>,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum OnConflict {
    Ask,
    Skip,
    Replace,
    KeepBoth,
    Merge,
}

impl From<OnConflict> for ConflictPolicy {
    fn from(value: OnConflict) -> Self {
        match value {
            OnConflict::Ask => ConflictPolicy::Ask,
            OnConflict::Skip => ConflictPolicy::Skip,
            OnConflict::Replace => ConflictPolicy::Replace,
            OnConflict::KeepBoth => ConflictPolicy::KeepBoth,
            OnConflict::Merge => ConflictPolicy::Merge,
        }
    }
}

/// How a run ended, as far as the exit status is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Clean,
    Failures,
    Cancelled,
}

impl Outcome {
    fn of(summary: &JobSummary) -> Self {
        if summary.state == JobState::Cancelled {
            Outcome::Cancelled
        } else if summary.has_failures() {
            Outcome::Failures
        } else {
            Outcome::Clean
        }
    }

    fn exit_code(self) -> i32 {
        match self {
            Outcome::Clean => 0,
            Outcome::Failures => 2,
            Outcome::Cancelled => 130,
        }
    }
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_idx])
}

fn format_duration(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let hours = secs / 3600;
    let mins = (secs % 3600) / 60;
    let secs = secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, mins, secs)
    } else if mins > 0 {
        format!("{}m {}s", mins, secs)
    } else {
        format!("{}s", secs)
    }
}

fn recovery_label(recovery: Recovery) -> String {
    match recovery {
        Recovery::Retried { attempts } => format!("recovered after {} retries", attempts),
        Recovery::Skipped => "skipped".to_string(),
        Recovery::Aborted => "job aborted".to_string(),
    }
}

/// Parse a conflict prompt answer. Upper case applies to all remaining conflicts.
fn parse_answer(answer: &str) -> Option<ConflictDecision> {
    let c = answer.trim().chars().next()?;
    let action = match c.to_ascii_lowercase() {
        's' => ConflictAction::Skip,
        'r' => ConflictAction::Replace,
        'k' => ConflictAction::KeepBoth,
        'm' => ConflictAction::Merge,
        _ => return None,
    };
    if c.is_ascii_uppercase() {
        Some(ConflictDecision::for_all(action))
    } else {
        Some(ConflictDecision::once(action))
    }
}

/// Parse a failure prompt answer. Upper case applies to all remaining failures.
fn parse_error_answer(answer: &str) -> Option<ErrorDecision> {
    let c = answer.trim().chars().next()?;
    let action = match c.to_ascii_lowercase() {
        'r' => ErrorAction::Retry,
        's' => ErrorAction::Skip,
        'a' => ErrorAction::Abort,
        _ => return None,
    };
    if c.is_ascii_uppercase() {
        Some(ErrorDecision::for_all(action))
    } else {
        Some(ErrorDecision::once(action))
    }
}

fn conflict_question(query: &ConflictQuery) -> String {
    format!(
        "'{}' already exists ({} bytes, incoming {} bytes). \
         [s]kip, [r]eplace, [k]eep both, [m]erge (upper case = all): ",
        query.destination.display(),
        query.dest.size,
        query.source.size
    )
}

fn error_question(query: &ErrorQuery) -> String {
    format!(
        "'{}' failed: {}. [r]etry, [s]kip, [a]bort (upper case = all): ",
        query.unit.source.display(),
        query
    )
}

/// Lines typed on stdin. A helper thread does the blocking reads so that a
/// prompt can still be interrupted; the channel disconnects at EOF.
fn stdin_lines() -> Result<Receiver<String>> {
    let (tx, rx) = unbounded();
    thread::Builder::new()
        .name("filejob-stdin".to_string())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        })
        .context("Failed to start stdin reader")?;
    Ok(rx)
}

/// Ask `question` until `parse` accepts an answer.
///
/// Returns `None` when Ctrl-C arrives first. `on_eof` answers once stdin is
/// closed, since nobody is left to ask.
fn prompt<T>(
    question: &str,
    answers: &Receiver<String>,
    interrupts: &Receiver<()>,
    parse: impl Fn(&str) -> Option<T>,
    on_eof: T,
) -> Result<Option<T>> {
    let mut stderr = io::stderr();
    loop {
        write!(stderr, "{}", question)?;
        stderr.flush()?;
        select! {
            recv(answers) -> line => match line {
                Ok(line) => {
                    if let Some(answer) = parse(&line) {
                        return Ok(Some(answer));
                    }
                }
                Err(_) => return Ok(Some(on_eof)),
            },
            recv(interrupts) -> _ => {
                writeln!(stderr)?;
                return Ok(None);
            }
        }
    }
}

fn request_cancel(bar: &ProgressBar, handle: &JobHandle) {
    bar.println("Cancelling...");
    if let Err(e) = handle.cancel() {
        warn!(error = %e, "Cancel request not delivered");
    }
}

fn load_config(cli: &Cli) -> Result<EngineConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            serde_json::from_str::<EngineConfig>(&text)
                .with_context(|| format!("Invalid config {}", path.display()))?
        }
        None => EngineConfig::default(),
    };

    if cli.abort_on_error {
        config.error_policy = ErrorPolicy::AbortOnFirstError;
    }
    if cli.ask_on_error {
        config.error_policy = ErrorPolicy::Ask;
    }
    if let Some(algo) = &cli.verify {
        config.verify = Some(algo.parse::<ChecksumAlgorithm>()?);
    }
    if let Some(chunk_size) = cli.chunk_size {
        config.chunk_size = chunk_size;
    }
    config.validate()?;
    Ok(config)
}

fn trash_dir(cli: &Cli) -> Result<PathBuf> {
    if let Some(dir) = &cli.trash_dir {
        return Ok(dir.clone());
    }
    match std::env::var_os("HOME") {
        Some(home) => Ok(PathBuf::from(home).join(".local/share/filejob/trash")),
        None => bail!("No trash directory: pass --trash-dir"),
    }
}

fn progress_bar(hidden: bool) -> Result<ProgressBar> {
    if hidden {
        return Ok(ProgressBar::hidden());
    }
    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg} {prefix}",
        )
        .context("Invalid progress template")?
        .progress_chars("=> "),
    );
    Ok(bar)
}

fn render_progress(bar: &ProgressBar, snapshot: &ProgressSnapshot) {
    bar.set_length(snapshot.planned_bytes);
    bar.set_position(snapshot.done_bytes);
    bar.set_message(format!(
        "{}/s, {} left ({}/{} items)",
        format_bytes(snapshot.throughput as u64),
        snapshot.remaining_text,
        snapshot.done_items,
        snapshot.planned_items
    ));
}

fn render_error(bar: &ProgressBar, record: &ErrorRecord) {
    bar.println(format!(
        "  {}: {} [{}]",
        record.unit.source.display(),
        record,
        recovery_label(record.recovery)
    ));
}

fn print_summary(summary: &JobSummary, elapsed: Duration) {
    eprintln!();
    eprintln!("{} {}", summary.operation, summary.state);
    eprintln!(
        "Summary: {} done, {} skipped, {} failed, {} cancelled",
        summary.completed, summary.skipped, summary.failed, summary.cancelled
    );
    eprintln!("Bytes written: {}", format_bytes(summary.totals.transferred_bytes));
    eprintln!("Elapsed: {}", format_duration(elapsed));

    let failures: Vec<_> = summary
        .errors
        .iter()
        .filter(|r| !matches!(r.recovery, Recovery::Retried { .. }))
        .collect();
    if !failures.is_empty() {
        eprintln!();
        eprintln!("Failed items:");
        for record in failures {
            eprintln!("  {}: {}", record.unit.source.display(), record);
        }
    }
}

/// Main CLI logic - separated for testability
fn run_cli(cli: &Cli, interrupts: &Receiver<()>) -> Result<Outcome> {
    let mut config = load_config(cli)?;

    let (operation, sources, target) = match &cli.command {
        Command::Copy(args) => (Operation::Copy, &args.sources, Some(args.to.clone())),
        Command::Move(args) => (Operation::Move, &args.sources, Some(args.to.clone())),
        Command::Link(args) => (Operation::Symlink, &args.sources, Some(args.to.clone())),
        Command::Trash(args) => (Operation::Trash, &args.sources, None),
        Command::Delete(args) => (Operation::Delete, &args.sources, None),
    };

    let interactive = io::stdin().is_terminal();
    let policy = match ConflictPolicy::from(cli.on_conflict) {
        ConflictPolicy::Ask if !interactive => {
            debug!("stdin is not a terminal; conflicts will be skipped");
            ConflictPolicy::Skip
        }
        policy => policy,
    };
    if config.error_policy == ErrorPolicy::Ask && !interactive {
        debug!("stdin is not a terminal; failed items will be skipped");
        config.error_policy = ErrorPolicy::Continue;
    }
    let answers = if policy == ConflictPolicy::Ask || config.error_policy == ErrorPolicy::Ask {
        stdin_lines()?
    } else {
        never()
    };

    let roots = sources.iter().map(|source| Entry::regular(source)).collect();
    let job = create_job(operation, roots, target, policy).context("Job creation failed")?;

    let collaborators = if operation == Operation::Trash {
        Collaborators::with_trash(Arc::new(DirectoryTrash::new(trash_dir(cli)?)))
    } else {
        Collaborators::default()
    };

    let handle = spawn_job(job, config, collaborators).context("Failed to start worker")?;
    let bar = progress_bar(cli.json)?;
    let started = Instant::now();
    handle.start()?;

    let events = handle.events();
    loop {
        select! {
            recv(events) -> event => match event {
                Ok(JobEvent::Progress(snapshot)) => render_progress(&bar, &snapshot),
                Ok(JobEvent::UnitStarted(unit)) => bar.set_prefix(unit.name()),
                Ok(JobEvent::Error(record)) => {
                    if !cli.json {
                        render_error(&bar, &record);
                    }
                }
                Ok(JobEvent::Conflict(query)) => {
                    let question = conflict_question(&query);
                    let skip_all = ConflictDecision::for_all(ConflictAction::Skip);
                    let answer =
                        bar.suspend(|| prompt(&question, &answers, interrupts, parse_answer, skip_all))?;
                    match answer {
                        Some(decision) => handle.decide(decision)?,
                        None => request_cancel(&bar, &handle),
                    }
                }
                Ok(JobEvent::ErrorQuery(query)) => {
                    let question = error_question(&query);
                    let skip_all = ErrorDecision::for_all(ErrorAction::Skip);
                    let answer =
                        bar.suspend(|| prompt(&question, &answers, interrupts, parse_error_answer, skip_all))?;
                    match answer {
                        Some(decision) => handle.decide_error(decision)?,
                        None => request_cancel(&bar, &handle),
                    }
                }
                Ok(JobEvent::Finished(_)) | Err(_) => break,
                Ok(_) => {}
            },
            recv(interrupts) -> _ => request_cancel(&bar, &handle),
        }
    }
    bar.finish_and_clear();

    let summary = handle.join().context("Job execution failed")?;
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary, started.elapsed());
    }
    Ok(Outcome::of(&summary))
}

fn main() {
    let cli = Cli::parse();
    logging::init_tracing(cli.verbose);

    let (interrupt_tx, interrupts) = crossbeam_channel::bounded::<()>(1);
    if let Err(e) = ctrlc::set_handler(move || {
        let _ = interrupt_tx.try_send(());
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler");
    }

    let exit_code = match run_cli(&cli, &interrupts) {
        Ok(outcome) => outcome.exit_code(),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            2
        }
    };

    std::process::exit(exit_code);
}
