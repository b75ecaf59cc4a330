use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::graph::CallGraph;
use crate::model::PolyEntry;
use crate::polymorph::PolymorphTable;
use crate::profile::ContextProfile;

/// Maximum number of records per output shard.
pub(crate) const SHARD_CAPACITY: usize = 1000;

/// Write the merged polymorph table as `pm-<k>.json` shards.
pub(crate) fn dump_polymorph(dir: &Path, table: &PolymorphTable) -> Result<usize> {
    let entries: Vec<&PolyEntry> = table.entries().collect();
    write_shards(dir, "pm", &entries, false)
}

/// Write the completed call graph as `cg-<k>.json` shards.
pub(crate) fn dump_callgraph(dir: &Path, graph: &CallGraph) -> Result<usize> {
    let functions: Vec<_> = graph.functions().map(|(_, function)| function).collect();
    write_shards(dir, "cg", &functions, should_validate_shards())
}

/// Write the context profile as `profile.json`.
pub(crate) fn dump_profile(dir: &Path, profiles: &[ContextProfile]) -> Result<()> {
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create output directory {}", dir.display()))?;
    let path = dir.join("profile.json");
    let mut file =
        File::create(&path).with_context(|| format!("failed to create {}", path.display()))?;
    serde_json::to_writer_pretty(&mut file, profiles).context("failed to serialize profile")?;
    file.write_all(b"\n").context("failed to write profile")?;
    Ok(())
}

fn write_shards<T: Serialize>(
    dir: &Path,
    prefix: &str,
    records: &[T],
    validate: bool,
) -> Result<usize> {
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create output directory {}", dir.display()))?;
    let mut shard = 0usize;
    for chunk in records.chunks(SHARD_CAPACITY) {
        shard += 1;
        if validate {
            validate_callgraph_chunk(chunk)
                .with_context(|| format!("shard {prefix}-{shard} failed schema validation"))?;
        }
        let path = dir.join(format!("{prefix}-{shard}.json"));
        let mut file =
            File::create(&path).with_context(|| format!("failed to create {}", path.display()))?;
        serde_json::to_writer(&mut file, chunk)
            .with_context(|| format!("failed to serialize {}", path.display()))?;
        file.write_all(b"\n")
            .with_context(|| format!("failed to write {}", path.display()))?;
    }
    Ok(shard)
}

fn should_validate_shards() -> bool {
    std::env::var("THROWMAP_VALIDATE_SHARDS")
        .ok()
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn validate_callgraph_chunk<T: Serialize>(chunk: &[T]) -> Result<()> {
    let schema = serde_json::from_str(include_str!("assets/callgraph-shard.schema.json"))
        .context("load shard schema")?;
    let compiled = jsonschema::validator_for(&schema)
        .map_err(|err| anyhow::anyhow!("compile shard schema: {err}"))?;
    let value = serde_json::to_value(chunk).context("serialize shard")?;
    let errors = compiled.iter_errors(&value);
    let message = errors.map(|error| error.to_string()).collect::<Vec<_>>();
    if !message.is_empty() {
        anyhow::bail!("shard schema validation failed:\n{}", message.join("\n"));
    }
    Ok(())
}

/// Run summary written alongside the shards.
#[derive(Debug, Default)]
pub(crate) struct Overview {
    pub(crate) functions: usize,
    pub(crate) call_sites: usize,
    pub(crate) polymorph_entries: usize,
    pub(crate) universe: usize,
    pub(crate) extractor_failures: usize,
    pub(crate) cg_shards: usize,
    pub(crate) pm_shards: usize,
    pub(crate) total_ms: u128,
    pub(crate) phases: Vec<PhaseReport>,
}

/// Elapsed time and outcome of one pipeline phase.
#[derive(Debug)]
pub(crate) struct PhaseReport {
    pub(crate) name: &'static str,
    pub(crate) duration_ms: u128,
    pub(crate) detail: String,
}

/// Write the human-readable `overview.txt` report.
pub(crate) fn write_overview(dir: &Path, overview: &Overview) -> Result<()> {
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create output directory {}", dir.display()))?;
    let path = dir.join("overview.txt");
    let mut file =
        File::create(&path).with_context(|| format!("failed to create {}", path.display()))?;
    writeln!(file, "functions:           {}", overview.functions)?;
    writeln!(file, "call sites:          {}", overview.call_sites)?;
    writeln!(file, "polymorph entries:   {}", overview.polymorph_entries)?;
    writeln!(file, "profiled universe:   {}", overview.universe)?;
    writeln!(file, "extractor failures:  {}", overview.extractor_failures)?;
    writeln!(
        file,
        "shards:              cg={} pm={}",
        overview.cg_shards, overview.pm_shards
    )?;
    writeln!(file, "total:               {} ms", overview.total_ms)?;
    writeln!(file)?;
    for phase in &overview.phases {
        writeln!(
            file,
            "{:<12} {:>8} ms  {}",
            phase.name, phase.duration_ms, phase.detail
        )?;
    }
    Ok(())
}
