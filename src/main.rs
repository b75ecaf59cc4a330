mod cache;
mod contexts;
mod extract;
mod fixes;
mod fragments;
mod graph;
mod handlers;
mod model;
mod polymorph;
mod profile;
mod propagate;
mod sink;
mod telemetry;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result};
use clap::{Args, Parser, Subcommand};
use opentelemetry::KeyValue;

use crate::cache::FragmentCache;
use crate::extract::{ExtractReport, ExtractorConfig};
use crate::fragments::load_fragment_dir;
use crate::graph::CallGraph;
use crate::model::Function;
use crate::polymorph::{ClassRecord, PolymorphTable};
use crate::propagate::CancelToken;
use crate::sink::{Overview, PhaseReport};
use crate::telemetry::{Telemetry, with_span};

/// CLI arguments for throwmap execution.
#[derive(Parser, Debug)]
#[command(
    name = "throwmap",
    about = "Whole-program exception-propagation analysis for C++ compilation databases.",
    version,
    subcommand_negates_reqs = true
)]
struct Cli {
    #[command(flatten)]
    analyze: AnalyzeArgs,
    #[command(subcommand)]
    command: Option<Command>,
}

/// Options for running the analysis pipeline.
#[derive(Args, Debug, Clone)]
struct AnalyzeArgs {
    #[arg(
        long,
        value_name = "PATH",
        required = true,
        help = "Path to compile_commands.json"
    )]
    compile_db: Option<PathBuf>,
    #[arg(long, value_name = "DIR", default_value = "throwmap-out")]
    output_dir: PathBuf,
    #[arg(
        long,
        value_name = "PATH",
        help = "Per-TU extractor executable. Omit to reuse cached fragments."
    )]
    extractor: Option<PathBuf>,
    #[arg(long, value_name = "N", help = "Worker threads for extraction and loading")]
    jobs: Option<usize>,
    #[arg(long, value_name = "SECONDS", default_value_t = 60)]
    timeout: u64,
    #[arg(long, help = "Treat any extraction failure as fatal")]
    strict: bool,
    #[arg(long, help = "Expand virtual calls through the polymorph table")]
    expand_virtual_calls: bool,
    #[arg(long, help = "Ask the extractor to keep system-header functions")]
    include_system_header: bool,
    #[arg(long)]
    quiet: bool,
    #[arg(long)]
    timing: bool,
    #[arg(long, value_name = "URL")]
    otel: Option<String>,
}

/// Subcommands supported by the CLI.
#[derive(Subcommand, Debug)]
enum Command {
    /// Summarize reviewed exception-handling fixes by context level.
    Fixes(FixesArgs),
}

/// Arguments for the reviewed-fixes statistics.
#[derive(Args, Debug, Clone)]
struct FixesArgs {
    #[arg(long, value_name = "PATH", required = true)]
    input: PathBuf,
    #[arg(long, value_name = "DIR", default_value = "throwmap-out")]
    output_dir: PathBuf,
    #[arg(long, value_name = "URL")]
    otel: Option<String>,
}

fn main() -> std::process::ExitCode {
    telemetry::init_logging();
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err:?}");
            std::process::ExitCode::from(1)
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Some(Command::Fixes(args)) => run_fixes(args),
        None => run_analyze(cli.analyze),
    }
}

fn run_analyze(args: AnalyzeArgs) -> Result<()> {
    if let Some(jobs) = args.jobs {
        rayon::ThreadPoolBuilder::new()
            .num_threads(jobs)
            .build_global()
            .context("failed to configure worker pool")?;
    }
    let telemetry = match &args.otel {
        Some(url) => Some(Arc::new(Telemetry::new(url.clone())?)),
        None => None,
    };
    let started_at = Instant::now();
    let result = with_span(telemetry.as_deref(), "execution", &[], || {
        run_pipeline(&args, telemetry.clone(), started_at)
    });
    if let Some(telemetry) = telemetry {
        if let Err(err) = telemetry.shutdown() {
            eprintln!("telemetry shutdown failed: {err}");
        }
    }
    result
}

fn run_pipeline(
    args: &AnalyzeArgs,
    telemetry: Option<Arc<Telemetry>>,
    started_at: Instant,
) -> Result<()> {
    let cancel = CancelToken::new();
    let cache = FragmentCache::new(&args.output_dir);
    let mut phases: Vec<PhaseReport> = Vec::new();

    let extract_started_at = Instant::now();
    let report = match &args.extractor {
        Some(program) => {
            let compile_db = args
                .compile_db
                .as_deref()
                .context("--compile-db is required to run the extractor")?;
            let commands = extract::load_compile_db(compile_db)?;
            let config = ExtractorConfig {
                program: program.clone(),
                include_system_header: args.include_system_header,
                timeout: Duration::from_secs(args.timeout),
                strict: args.strict,
            };
            with_span(
                telemetry.as_deref(),
                "extract",
                &[KeyValue::new("throwmap.phase", "extract")],
                || {
                    extract::extract_all(
                        &commands,
                        &config,
                        &cache,
                        &args.output_dir,
                        &cancel,
                        telemetry.as_deref(),
                    )
                },
            )?
        }
        None => {
            cache.ensure_layout()?;
            ExtractReport::default()
        }
    };
    let extract_duration_ms = extract_started_at.elapsed().as_millis();
    phases.push(PhaseReport {
        name: "extract",
        duration_ms: extract_duration_ms,
        detail: format!(
            "{} extracted, {} cached, {} failed",
            report.extracted,
            report.cached,
            report.failures.len()
        ),
    });

    let load_started_at = Instant::now();
    let (classes, functions) = with_span(
        telemetry.as_deref(),
        "load",
        &[KeyValue::new("throwmap.phase", "load")],
        || -> Result<(Vec<ClassRecord>, Vec<Function>)> {
            let classes = load_fragment_dir::<ClassRecord>(&cache.ipm_dir())
                .context("failed to load polymorph fragments")?;
            let functions = load_fragment_dir::<Function>(&cache.icg_dir())
                .context("failed to load call-graph fragments")?;
            Ok((classes, functions))
        },
    )?;
    let load_duration_ms = load_started_at.elapsed().as_millis();
    phases.push(PhaseReport {
        name: "load",
        duration_ms: load_duration_ms,
        detail: format!("{} class records, {} functions", classes.len(), functions.len()),
    });

    let assemble_started_at = Instant::now();
    let (table, mut graph) = with_span(
        telemetry.as_deref(),
        "assemble",
        &[KeyValue::new("throwmap.phase", "assemble")],
        || {
            let mut table = PolymorphTable::new();
            table.absorb(classes);
            let mut graph = CallGraph::new();
            let polymorph = args.expand_virtual_calls.then_some(&table);
            for function in functions {
                graph.install(function, polymorph);
            }
            graph.link_callers();
            (table, graph)
        },
    );
    let assemble_duration_ms = assemble_started_at.elapsed().as_millis();
    phases.push(PhaseReport {
        name: "assemble",
        duration_ms: assemble_duration_ms,
        detail: format!(
            "{} functions, {} call sites, {} polymorph entries",
            graph.len(),
            graph.call_site_count(),
            table.len()
        ),
    });

    let propagate_started_at = Instant::now();
    let stats = with_span(
        telemetry.as_deref(),
        "propagate",
        &[KeyValue::new("throwmap.phase", "propagate")],
        || propagate::propagate(&mut graph, &cancel),
    );
    let propagate_duration_ms = propagate_started_at.elapsed().as_millis();
    phases.push(PhaseReport {
        name: "propagate",
        duration_ms: propagate_duration_ms,
        detail: format!(
            "{} visits, {} enqueues, {} reconciled",
            stats.visits, stats.enqueues, stats.reconciled
        ),
    });

    let profile_started_at = Instant::now();
    let profiles = with_span(
        telemetry.as_deref(),
        "profile",
        &[KeyValue::new("throwmap.phase", "profile")],
        || profile::profile(&graph),
    );
    let universe = profile::universe_size(&graph);
    let profile_duration_ms = profile_started_at.elapsed().as_millis();
    phases.push(PhaseReport {
        name: "profile",
        duration_ms: profile_duration_ms,
        detail: format!("{universe} sites in universe"),
    });

    let dump_started_at = Instant::now();
    let (pm_shards, cg_shards) = with_span(
        telemetry.as_deref(),
        "dump",
        &[KeyValue::new("throwmap.phase", "dump")],
        || -> Result<(usize, usize)> {
            let pm_shards = sink::dump_polymorph(&args.output_dir, &table)?;
            let cg_shards = sink::dump_callgraph(&args.output_dir, &graph)?;
            sink::dump_profile(&args.output_dir, &profiles)?;
            Ok((pm_shards, cg_shards))
        },
    )?;
    let dump_duration_ms = dump_started_at.elapsed().as_millis();
    phases.push(PhaseReport {
        name: "dump",
        duration_ms: dump_duration_ms,
        detail: format!("cg={cg_shards} pm={pm_shards}"),
    });

    let overview = Overview {
        functions: graph.len(),
        call_sites: graph.call_site_count(),
        polymorph_entries: table.len(),
        universe,
        extractor_failures: report.failures.len(),
        cg_shards,
        pm_shards,
        total_ms: started_at.elapsed().as_millis(),
        phases,
    };
    sink::write_overview(&args.output_dir, &overview)?;

    if args.timing && !args.quiet {
        eprintln!(
            "timing: total_ms={} extract_ms={} load_ms={} assemble_ms={} propagate_ms={} profile_ms={} dump_ms={} (functions={} sites={})",
            started_at.elapsed().as_millis(),
            extract_duration_ms,
            load_duration_ms,
            assemble_duration_ms,
            propagate_duration_ms,
            profile_duration_ms,
            dump_duration_ms,
            overview.functions,
            overview.call_sites
        );
    }
    if !args.quiet {
        tracing::info!(
            functions = overview.functions,
            call_sites = overview.call_sites,
            universe = overview.universe,
            failures = overview.extractor_failures,
            "analysis complete"
        );
    }
    Ok(())
}

fn run_fixes(args: FixesArgs) -> Result<()> {
    let telemetry = match &args.otel {
        Some(url) => Some(Arc::new(Telemetry::new(url.clone())?)),
        None => None,
    };
    let result = with_span(telemetry.as_deref(), "fixes", &[], || -> Result<()> {
        let fixes = fixes::load_fixes(&args.input)?;
        let stats = fixes::fix_statistics(&fixes);
        fixes::dump_fix_statistics(&args.output_dir, &stats)?;
        tracing::info!(fixes = fixes.len(), "reviewed-fixes statistics written");
        Ok(())
    });
    if let Some(telemetry) = telemetry {
        if let Err(err) = telemetry.shutdown() {
            eprintln!("telemetry shutdown failed: {err}");
        }
    }
    result
}
