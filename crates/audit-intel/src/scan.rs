//! Collect the files named on the command line for ingestion.
//!
//! Files are taken as given; directories are walked recursively and only
//! files with a supported extension are kept. Hidden directories and
//! `.git` are skipped.

use anyhow::{bail, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::extract::supported_extensions;

const EXCLUDES: &[&str] = &["**/.git/**", "**/.*/**", "**/~$*"];

/// Expand `paths` into a sorted, de-duplicated list of files.
pub fn collect_files(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let include = build_globset(supported_extensions().map(|ext| format!("**/*.{ext}")))?;
    let exclude = build_globset(EXCLUDES.iter().map(|p| p.to_string()))?;

    let mut files = Vec::new();
    for path in paths {
        if path.is_file() {
            files.push(path.clone());
            continue;
        }
        if !path.is_dir() {
            bail!("No such file or directory: {}", path.display());
        }
        for entry in WalkDir::new(path).follow_links(false) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry.path().strip_prefix(path).unwrap_or(entry.path());
            if accepts(&include, &exclude, relative) {
                files.push(entry.into_path());
            }
        }
    }
    files.sort();
    files.dedup();
    Ok(files)
}

fn accepts(include: &GlobSet, exclude: &GlobSet, relative: &Path) -> bool {
    // Globs are matched on lowercase names so `REPORT.PDF` counts as a PDF.
    let lowered = PathBuf::from(relative.to_string_lossy().to_lowercase());
    include.is_match(&lowered) && !exclude.is_match(relative)
}

fn build_globset(patterns: impl IntoIterator<Item = String>) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(&pattern)?);
    }
    Ok(builder.build()?)
}
