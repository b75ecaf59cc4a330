use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::contexts::{Context as CatchContext, checked_contexts, remap_legacy};

/// Repository record of the reviewed-fixes corpus.
#[derive(Debug, Deserialize)]
struct RepoRecord {
    #[serde(default)]
    commits: Vec<CommitRecord>,
}

// Commits carry `fix_<n>` keys next to unrelated metadata; capture them all
// and pick out the fixes afterwards.
#[derive(Debug, Deserialize)]
struct CommitRecord {
    #[serde(flatten)]
    fields: BTreeMap<String, serde_json::Value>,
}

/// One reviewed exception-handling fix.
#[derive(Clone, Debug, Deserialize)]
pub(crate) struct FixRecord {
    #[serde(rename = "Context", default)]
    pub(crate) contexts: Vec<u32>,
    #[serde(rename = "Caller.is noexcept", default)]
    pub(crate) caller_noexcept: bool,
}

/// Per-context fix totals over the reviewed corpus.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub(crate) struct ContextFixStats {
    pub(crate) context: u32,
    pub(crate) fixes: u64,
    pub(crate) noexcept: u64,
}

/// Load every `fix_<n>` record across all repositories and commits.
pub(crate) fn load_fixes(path: &Path) -> Result<Vec<FixRecord>> {
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let mut deserializer = serde_json::Deserializer::from_slice(&bytes);
    let repos: Vec<RepoRecord> = serde_path_to_error::deserialize(&mut deserializer)
        .with_context(|| format!("malformed reviewed-fixes file {}", path.display()))?;

    let mut fixes = Vec::new();
    for repo in repos {
        for commit in repo.commits {
            for (key, value) in commit.fields {
                if !key.starts_with("fix_") {
                    continue;
                }
                let fix: FixRecord = serde_json::from_value(value)
                    .with_context(|| format!("malformed fix record {key}"))?;
                fixes.push(fix);
            }
        }
    }
    Ok(fixes)
}

/// Count fixes per compact context, expanding each fix over the contexts its
/// review implies were checked.
pub(crate) fn fix_statistics(fixes: &[FixRecord]) -> Vec<ContextFixStats> {
    let mut stats: BTreeMap<u32, ContextFixStats> = (1..=17)
        .map(|context| {
            (
                context,
                ContextFixStats {
                    context,
                    fixes: 0,
                    noexcept: 0,
                },
            )
        })
        .collect();

    for fix in fixes {
        for context in expanded_contexts(&fix.contexts) {
            // Out-of-range legacy numbers remap past 17 and are ignored.
            let Some(entry) = stats.get_mut(&context) else {
                continue;
            };
            entry.fixes += 1;
            if fix.caller_noexcept {
                entry.noexcept += 1;
            }
        }
    }
    stats.into_values().collect()
}

fn expanded_contexts(legacy: &[u32]) -> BTreeSet<u32> {
    let mut expanded = BTreeSet::new();
    for &context in legacy {
        let compact = remap_legacy(context);
        expanded.insert(compact);
        if let Some(context) = CatchContext::from_compact(compact) {
            for implied in checked_contexts(context) {
                expanded.insert(implied.compact());
            }
        }
    }
    expanded
}

/// Write the per-context totals as `fixes.json`.
pub(crate) fn dump_fix_statistics(dir: &Path, stats: &[ContextFixStats]) -> Result<()> {
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create output directory {}", dir.display()))?;
    let path = dir.join("fixes.json");
    let json = serde_json::to_string_pretty(stats).context("failed to serialize fix stats")?;
    fs::write(&path, json + "\n").with_context(|| format!("failed to write {}", path.display()))
}
