// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Narrow interface to the persistent record catalog.
//!
//! The catalog is an external collaborator: records are queried by id and
//! replaced whole. `CoverageFile` records are immutable once created; the
//! reconciliation engine only ever creates, replaces, or deletes
//! `CoverageReport` records.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Per-project configuration overrides, layered over global defaults.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Project {
    pub name: String,
    #[serde(default)]
    pub base_dir: Option<PathBuf>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub tag_fmt: Option<String>,
    #[serde(default)]
    pub git_repo: Option<String>,
    #[serde(default)]
    pub dist_git_repo: Option<String>,
    #[serde(default)]
    pub notify_url: Option<String>,
    #[serde(default)]
    pub notify_token: Option<String>,
    #[serde(default)]
    pub project_type: Option<String>,
}

/// An uploaded raw trace, tied to a package version. Read-only here.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CoverageFile {
    pub id: u64,
    #[serde(default)]
    pub project: Option<String>,
    pub name: String,
    pub user_name: String,
    pub version: String,
    pub date: DateTime<Utc>,
    /// Location of the stored trace blob.
    pub path: PathBuf,
}

/// A published report. `path`/`url` point at the currently published
/// artifact; `tracefile` holds the merged trace for future incremental
/// merges. A report with `rules` is a merge report and accumulates members.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CoverageReport {
    pub id: u64,
    #[serde(default)]
    pub project: Option<String>,
    pub name: String,
    pub version: String,
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub tracefile: Option<PathBuf>,
    #[serde(default)]
    pub rules: Option<String>,
    #[serde(default)]
    pub coverage_files: BTreeSet<u64>,
}

pub trait Catalog: Send + Sync {
    fn coverage_file(&self, id: u64) -> Result<CoverageFile>;
    fn project(&self, name: &str) -> Result<Option<Project>>;
    fn report(&self, id: u64) -> Result<Option<CoverageReport>>;
    fn next_report_id(&self) -> Result<u64>;
    fn put_report(&self, report: &CoverageReport) -> Result<()>;
    fn delete_report(&self, id: u64) -> Result<()>;

    fn put_coverage_file(&self, file: &CoverageFile) -> Result<()>;
    fn put_project(&self, project: &Project) -> Result<()>;
}

#[derive(Debug, Deserialize, Serialize)]
struct CatalogState {
    #[serde(default)]
    files: BTreeMap<u64, CoverageFile>,
    #[serde(default)]
    reports: BTreeMap<u64, CoverageReport>,
    #[serde(default)]
    projects: BTreeMap<String, Project>,
    #[serde(default = "one")]
    next_report_id: u64,
}

fn one() -> u64 {
    1
}

impl Default for CatalogState {
    fn default() -> Self {
        Self {
            files: BTreeMap::new(),
            reports: BTreeMap::new(),
            projects: BTreeMap::new(),
            next_report_id: one(),
        }
    }
}

impl CatalogState {
    fn coverage_file(&self, id: u64) -> Result<CoverageFile> {
        self.files
            .get(&id)
            .cloned()
            .ok_or_else(|| format_err!("no such coverage file: {}", id))
    }
}

/// In-memory catalog, used by tests and callers that own their records.
#[derive(Default)]
pub struct MemCatalog {
    state: Mutex<CatalogState>,
}

impl MemCatalog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Catalog for MemCatalog {
    fn coverage_file(&self, id: u64) -> Result<CoverageFile> {
        self.state.lock().unwrap().coverage_file(id)
    }

    fn project(&self, name: &str) -> Result<Option<Project>> {
        Ok(self.state.lock().unwrap().projects.get(name).cloned())
    }

    fn report(&self, id: u64) -> Result<Option<CoverageReport>> {
        Ok(self.state.lock().unwrap().reports.get(&id).cloned())
    }

    fn next_report_id(&self) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        let id = state.next_report_id;
        state.next_report_id += 1;
        Ok(id)
    }

    fn put_report(&self, report: &CoverageReport) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.next_report_id = state.next_report_id.max(report.id + 1);
        state.reports.insert(report.id, report.clone());
        Ok(())
    }

    fn delete_report(&self, id: u64) -> Result<()> {
        self.state.lock().unwrap().reports.remove(&id);
        Ok(())
    }

    fn put_coverage_file(&self, file: &CoverageFile) -> Result<()> {
        self.state.lock().unwrap().files.insert(file.id, file.clone());
        Ok(())
    }

    fn put_project(&self, project: &Project) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .projects
            .insert(project.name.clone(), project.clone());
        Ok(())
    }
}

/// File-backed catalog: one JSON document, rewritten after every mutation.
///
/// Concurrency across worker tasks is the catalog's problem in the full
/// system; this implementation serializes through a process-local mutex and
/// is only suitable for a single worker process.
pub struct JsonCatalog {
    path: PathBuf,
    state: Mutex<CatalogState>,
}

impl JsonCatalog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let state = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("unable to read catalog: {}", path.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("unable to parse catalog: {}", path.display()))?
        } else {
            CatalogState::default()
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    // Staged to a sibling file and renamed into place, so a crash mid-write
    // never leaves a truncated catalog behind.
    fn save(&self, state: &CatalogState) -> Result<()> {
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };

        let staging = tempfile::Builder::new()
            .prefix(".catalog-")
            .tempfile_in(parent)
            .with_context(|| format!("unable to stage catalog: {}", self.path.display()))?;

        serde_json::to_writer_pretty(staging.as_file(), state)
            .with_context(|| format!("unable to serialize catalog: {}", self.path.display()))?;

        staging
            .persist(&self.path)
            .with_context(|| format!("unable to persist catalog: {}", self.path.display()))?;

        Ok(())
    }
}

impl Catalog for JsonCatalog {
    fn coverage_file(&self, id: u64) -> Result<CoverageFile> {
        self.state.lock().unwrap().coverage_file(id)
    }

    fn project(&self, name: &str) -> Result<Option<Project>> {
        Ok(self.state.lock().unwrap().projects.get(name).cloned())
    }

    fn report(&self, id: u64) -> Result<Option<CoverageReport>> {
        Ok(self.state.lock().unwrap().reports.get(&id).cloned())
    }

    fn next_report_id(&self) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        let id = state.next_report_id;
        state.next_report_id += 1;
        self.save(&state)?;
        Ok(id)
    }

    fn put_report(&self, report: &CoverageReport) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.next_report_id = state.next_report_id.max(report.id + 1);
        state.reports.insert(report.id, report.clone());
        self.save(&state)
    }

    fn delete_report(&self, id: u64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.reports.remove(&id);
        self.save(&state)
    }

    fn put_coverage_file(&self, file: &CoverageFile) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.files.insert(file.id, file.clone());
        self.save(&state)
    }

    fn put_project(&self, project: &Project) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.projects.insert(project.name.clone(), project.clone());
        self.save(&state)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    use super::*;

    fn sample_report(id: u64) -> CoverageReport {
        CoverageReport {
            id,
            project: Some("libvirt".to_string()),
            name: "weekly".to_string(),
            version: "libvirt-4.5.0-1.el7.x86_64".to_string(),
            date: Utc::now(),
            path: None,
            url: None,
            tracefile: None,
            rules: Some("merge".to_string()),
            coverage_files: BTreeSet::from([3, 5]),
        }
    }

    #[test]
    fn test_json_catalog_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("catalog.json");

        let catalog = JsonCatalog::open(&path).unwrap();
        let id = catalog.next_report_id().unwrap();
        catalog.put_report(&sample_report(id)).unwrap();

        // Reopen from disk; everything persisted.
        let catalog = JsonCatalog::open(&path).unwrap();
        let report = catalog.report(id).unwrap().unwrap();
        assert_eq!(report.coverage_files, BTreeSet::from([3, 5]));
        assert!(catalog.next_report_id().unwrap() > id);
    }

    #[test]
    fn test_save_replaces_whole_and_leaves_no_staging_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("catalog.json");

        let catalog = JsonCatalog::open(&path).unwrap();
        catalog.put_report(&sample_report(1)).unwrap();
        catalog.put_report(&sample_report(2)).unwrap();

        let entries: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(entries, vec!["catalog.json"]);

        // The rewritten file is a complete, parseable document.
        let catalog = JsonCatalog::open(&path).unwrap();
        assert!(catalog.report(1).unwrap().is_some());
        assert!(catalog.report(2).unwrap().is_some());
    }

    #[test]
    fn test_delete_report() {
        let catalog = MemCatalog::new();
        catalog.put_report(&sample_report(7)).unwrap();
        catalog.delete_report(7).unwrap();
        assert!(catalog.report(7).unwrap().is_none());
    }

    #[test]
    fn test_next_report_id_skips_existing() {
        let catalog = MemCatalog::new();
        catalog.put_report(&sample_report(10)).unwrap();
        assert_eq!(catalog.next_report_id().unwrap(), 11);
    }
}
