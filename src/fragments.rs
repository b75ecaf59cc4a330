use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rayon::prelude::*;
use serde::de::DeserializeOwned;

/// Parse one fragment file: a JSON array of records.
///
/// Some extractor builds double-escape string payloads; when the first parse
/// fails, retry once with every backslash byte stripped before giving up.
pub(crate) fn parse_fragment<T: DeserializeOwned>(bytes: &[u8]) -> Result<Vec<T>> {
    match parse_json_array(bytes) {
        Ok(records) => Ok(records),
        Err(err) => {
            let stripped: Vec<u8> = bytes
                .iter()
                .copied()
                .filter(|byte| *byte != b'\\')
                .collect();
            parse_json_array(&stripped)
                .map_err(|_| err)
                .context("fragment still malformed after backslash-stripped retry")
        }
    }
}

fn parse_json_array<T: DeserializeOwned>(bytes: &[u8]) -> Result<Vec<T>> {
    let mut deserializer = serde_json::Deserializer::from_slice(bytes);
    let records = serde_path_to_error::deserialize(&mut deserializer)
        .map_err(|err| anyhow::anyhow!("{err}"))?;
    Ok(records)
}

/// Load every fragment file under a directory, in sorted file order.
///
/// Files are parsed in parallel; the merged stream preserves the sorted order
/// so downstream consumers stay deterministic. A missing directory yields an
/// empty stream: extraction may legitimately have produced nothing.
pub(crate) fn load_fragment_dir<T>(dir: &Path) -> Result<Vec<T>>
where
    T: DeserializeOwned + Send,
{
    let files = list_fragment_files(dir)?;
    let batches = files
        .par_iter()
        .map(|path| {
            let bytes =
                fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
            parse_fragment(&bytes)
                .with_context(|| format!("malformed fragment {}", path.display()))
        })
        .collect::<Result<Vec<Vec<T>>>>()?;
    Ok(batches.into_iter().flatten().collect())
}

fn list_fragment_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    collect_files(dir, &mut files)?;
    files.sort_by(|a, b| path_key(a).cmp(&path_key(b)));
    Ok(files)
}

// Fragment caches mirror source trees, so walk nested directories too.
fn collect_files(dir: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    for entry in
        fs::read_dir(dir).with_context(|| format!("failed to read directory {}", dir.display()))?
    {
        let entry =
            entry.with_context(|| format!("failed to read entry under {}", dir.display()))?;
        let path = entry.path();
        if path.is_dir() {
            collect_files(&path, files)?;
        } else {
            files.push(path);
        }
    }
    Ok(())
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().to_string()
}
