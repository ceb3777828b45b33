//! Turning command-line arguments into the documents of a batch.
//!
//! Each argument is a file, a directory (searched recursively for markdown
//! files, skipping hidden directories) or a glob pattern.

use anyhow::{Context, Result, bail};
use glob::glob;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

const MARKDOWN_EXTENSIONS: [&str; 2] = ["md", "markdown"];

fn is_markdown(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| MARKDOWN_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with('.'))
}

fn is_pattern(arg: &str) -> bool {
    arg.contains(['*', '?', '['])
}

fn walk_markdown(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    for entry in WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_hidden(e))
    {
        let entry = entry.with_context(|| format!("Failed to read directory {}", dir.display()))?;
        if entry.file_type().is_file() && is_markdown(entry.path()) {
            found.push(entry.into_path());
        }
    }
    Ok(found)
}

/// Expand `inputs` relative to `base_dir` into a de-duplicated list of files,
/// in argument order.
pub fn collect_documents(inputs: &[String], base_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for arg in inputs {
        let path = base_dir.join(arg);
        if path.is_dir() {
            paths.extend(walk_markdown(&path)?);
        } else if path.is_file() {
            paths.push(path);
        } else if is_pattern(arg) {
            let pattern = path.to_string_lossy().into_owned();
            let matched: Vec<PathBuf> = glob(&pattern)
                .with_context(|| format!("Invalid glob pattern '{arg}'"))?
                .filter_map(|entry| entry.ok())
                .filter(|p| p.is_file())
                .collect();
            if matched.is_empty() {
                tracing::warn!(pattern = %arg, "pattern matched no files");
            }
            paths.extend(matched);
        } else {
            bail!("No such file or directory: {}", path.display());
        }
    }

    let mut seen = HashSet::new();
    paths.retain(|p| seen.insert(p.clone()));
    if paths.is_empty() {
        bail!("No markdown documents found in {}", inputs.join(", "));
    }
    Ok(paths)
}
