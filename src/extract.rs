use std::collections::BTreeSet;
use std::fmt;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use opentelemetry::Context as OtelContext;
use opentelemetry::KeyValue;
use rayon::prelude::*;
use serde::Deserialize;

use crate::cache::FragmentCache;
use crate::propagate::CancelToken;
use crate::telemetry::Telemetry;

const FAILURE_LOG: &str = "extract-failures.log";
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// One entry of a Clang compilation database (`compile_commands.json`).
#[derive(Clone, Debug, Deserialize)]
pub(crate) struct CompileCommand {
    pub(crate) directory: PathBuf,
    pub(crate) file: PathBuf,
    #[serde(default)]
    pub(crate) command: Option<String>,
    #[serde(default)]
    pub(crate) arguments: Option<Vec<String>>,
}

impl CompileCommand {
    /// Source path resolved against the entry's working directory.
    pub(crate) fn source(&self) -> PathBuf {
        if self.file.is_absolute() {
            self.file.clone()
        } else {
            self.directory.join(&self.file)
        }
    }
}

/// Load and deduplicate a compilation database.
pub(crate) fn load_compile_db(path: &Path) -> Result<Vec<CompileCommand>> {
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let mut deserializer = serde_json::Deserializer::from_slice(&bytes);
    let commands: Vec<CompileCommand> = serde_path_to_error::deserialize(&mut deserializer)
        .with_context(|| format!("malformed compilation database {}", path.display()))?;

    // One TU per source file; repeated entries (multi-config builds) keep the
    // first occurrence.
    let mut seen = BTreeSet::new();
    let mut deduplicated = Vec::new();
    for command in commands {
        if seen.insert(command.source()) {
            deduplicated.push(command);
        }
    }
    Ok(deduplicated)
}

/// External extractor invocation settings.
#[derive(Clone, Debug)]
pub(crate) struct ExtractorConfig {
    pub(crate) program: PathBuf,
    pub(crate) include_system_header: bool,
    pub(crate) timeout: Duration,
    pub(crate) strict: bool,
}

/// Why one TU failed to extract.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum FailureKind {
    Timeout,
    Crash(i32),
    ExitCode(i32),
    Spawn(String),
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Timeout => write!(f, "timeout"),
            FailureKind::Crash(signal) => write!(f, "crash (signal {signal})"),
            FailureKind::ExitCode(code) => write!(f, "exit code {code}"),
            FailureKind::Spawn(message) => write!(f, "spawn failed: {message}"),
        }
    }
}

/// Failed TU recorded in the failure log.
#[derive(Clone, Debug)]
pub(crate) struct TuFailure {
    pub(crate) source: PathBuf,
    pub(crate) kind: FailureKind,
}

/// Outcome counts for one extraction run.
#[derive(Debug, Default)]
pub(crate) struct ExtractReport {
    pub(crate) extracted: usize,
    pub(crate) cached: usize,
    pub(crate) failures: Vec<TuFailure>,
}

enum TuOutcome {
    Extracted,
    Cached,
    Skipped,
    Failed(TuFailure),
}

/// Extract fragments for every TU not satisfied by the cache.
///
/// TUs fan out across the ambient rayon pool; cache checks, invalidation, and
/// the extractor subprocess all run inside the worker. In strict mode any
/// failure is fatal; otherwise failures are logged and the pipeline proceeds
/// with the fragments that were produced.
pub(crate) fn extract_all(
    commands: &[CompileCommand],
    config: &ExtractorConfig,
    cache: &FragmentCache,
    output_dir: &Path,
    cancel: &CancelToken,
    telemetry: Option<&Telemetry>,
) -> Result<ExtractReport> {
    cache.ensure_layout()?;
    let parent_context = OtelContext::current();
    let outcomes: Vec<TuOutcome> = commands
        .par_iter()
        .map(|command| {
            if cancel.is_cancelled() {
                return Ok(TuOutcome::Skipped);
            }
            let attributes = [KeyValue::new(
                "throwmap.tu",
                command.source().to_string_lossy().to_string(),
            )];
            match telemetry {
                Some(telemetry) => telemetry.in_span_with_parent(
                    "extract.tu",
                    &attributes,
                    &parent_context,
                    || extract_one(command, config, cache),
                ),
                None => extract_one(command, config, cache),
            }
        })
        .collect::<Result<Vec<_>>>()?;

    let mut report = ExtractReport::default();
    for outcome in outcomes {
        match outcome {
            TuOutcome::Extracted => report.extracted += 1,
            TuOutcome::Cached => report.cached += 1,
            TuOutcome::Skipped => {}
            TuOutcome::Failed(failure) => report.failures.push(failure),
        }
    }

    if !report.failures.is_empty() {
        write_failure_log(output_dir, &report.failures)?;
        tracing::warn!(
            failures = report.failures.len(),
            "extractor failed for some translation units"
        );
        if config.strict {
            anyhow::bail!(
                "{} translation unit(s) failed to extract (strict mode)",
                report.failures.len()
            );
        }
    }
    Ok(report)
}

fn extract_one(
    command: &CompileCommand,
    config: &ExtractorConfig,
    cache: &FragmentCache,
) -> Result<TuOutcome> {
    let source = command.source();
    if cache.is_fresh(&source)? {
        return Ok(TuOutcome::Cached);
    }
    cache.invalidate(&source)?;
    cache.prepare(&source)?;
    match run_extractor(command, &source, config, cache) {
        Ok(()) => {
            cache.commit(&source)?;
            Ok(TuOutcome::Extracted)
        }
        Err(kind) => Ok(TuOutcome::Failed(TuFailure { source, kind })),
    }
}

fn run_extractor(
    command: &CompileCommand,
    source: &Path,
    config: &ExtractorConfig,
    cache: &FragmentCache,
) -> std::result::Result<(), FailureKind> {
    let mut child = Command::new(&config.program);
    child
        .arg(source)
        .arg("--ipm")
        .arg(cache.ipm_path(source))
        .arg("--icg")
        .arg(cache.icg_path(source))
        .current_dir(&command.directory);
    if config.include_system_header {
        child.arg("--include-system-header");
    }
    let mut child = child
        .spawn()
        .map_err(|err| FailureKind::Spawn(err.to_string()))?;

    let deadline = Instant::now() + config.timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return classify_exit(status),
            Ok(None) => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(FailureKind::Timeout);
                }
                thread::sleep(POLL_INTERVAL);
            }
            Err(err) => return Err(FailureKind::Spawn(err.to_string())),
        }
    }
}

fn classify_exit(status: ExitStatus) -> std::result::Result<(), FailureKind> {
    if status.success() {
        return Ok(());
    }
    match status.code() {
        Some(code) => Err(FailureKind::ExitCode(code)),
        None => Err(FailureKind::Crash(crash_signal(&status).unwrap_or(0))),
    }
}

#[cfg(unix)]
fn crash_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn crash_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

fn write_failure_log(output_dir: &Path, failures: &[TuFailure]) -> Result<()> {
    fs::create_dir_all(output_dir)
        .with_context(|| format!("failed to create {}", output_dir.display()))?;
    let path = output_dir.join(FAILURE_LOG);
    let mut file =
        File::create(&path).with_context(|| format!("failed to create {}", path.display()))?;
    for failure in failures {
        writeln!(file, "{}\t{}", failure.source.display(), failure.kind)
            .with_context(|| format!("failed to write {}", path.display()))?;
    }
    Ok(())
}
