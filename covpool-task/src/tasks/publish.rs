// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Atomic report publication.
//!
//! A publish replaces the served artifact, the stored merged trace, and the
//! catalog record together. The previously published artifacts are moved
//! aside, not deleted, until the whole publish has succeeded, so any failure
//! restores the prior state exactly. A failed notification counts as a
//! failed publish.

use anyhow::{Context, Result};
use chrono::Utc;
use covpool::fs::{copy_dir, dir_size, exists, remove_dir_if_exists};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;

use crate::catalog::{Catalog, CoverageReport};
use crate::notify::Notifier;

use super::config::EffectiveConfig;

#[derive(Debug, Error)]
#[error("publish of report {report_id} failed: {detail}")]
pub struct PublishFailed {
    pub report_id: u64,
    pub detail: String,
}

pub struct PublishRequest {
    /// Existing report to replace; `None` publishes a brand-new report.
    pub report_id: Option<u64>,
    pub project: Option<String>,
    pub name: String,
    pub version: String,
    pub rules: Option<String>,
    /// Coverage file ids folded into this publish.
    pub members: BTreeSet<u64>,
    /// Fully rendered report directory, ready to serve.
    pub rendered_dir: PathBuf,
    /// Merged trace backing future incremental merges.
    pub merged_trace: PathBuf,
}

fn aside_path(path: &Path) -> PathBuf {
    PathBuf::from(format!("{}.pre", path.display()))
}

fn notify_fields(report: &CoverageReport) -> BTreeMap<String, String> {
    let mut fields = BTreeMap::new();
    fields.insert("name".to_string(), report.name.clone());
    fields.insert("version".to_string(), report.version.clone());
    fields.insert("date".to_string(), report.date.to_rfc3339());
    if let Some(url) = &report.url {
        fields.insert("url".to_string(), url.clone());
    }
    fields
}

/// Publish a rendered report, replacing `report_id` when given.
///
/// On success the returned record is the one now in the catalog. On error
/// the catalog, the served directory, and the stored trace are all back in
/// their pre-call state.
pub async fn publish(
    config: &EffectiveConfig,
    catalog: &dyn Catalog,
    notifier: &dyn Notifier,
    request: PublishRequest,
) -> Result<CoverageReport> {
    let prior = match request.report_id {
        Some(id) => Some(
            catalog
                .report(id)?
                .ok_or_else(|| format_err!("no such report: {}", id))?,
        ),
        None => None,
    };

    let id = match &prior {
        Some(prior) => prior.id,
        None => catalog.next_report_id()?,
    };

    fs::create_dir_all(&config.storage_dir).await?;

    if let Some(limit) = config.storage_limit {
        let used = dir_size(&config.storage_dir).await?;
        if used > limit {
            return Err(PublishFailed {
                report_id: id,
                detail: format!("storage limit exceeded: {} > {} bytes", used, limit),
            }
            .into());
        }
    }

    // Single-writer lease per report id. A stale lock means a crashed
    // publish that needs operator attention; it is never stolen.
    let lock = config.storage_dir.join(format!(".lock.{}", id));
    fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&lock)
        .await
        .map_err(|err| PublishFailed {
            report_id: id,
            detail: format!("unable to take publish lock {}: {}", lock.display(), err),
        })?;

    let result = publish_locked(config, catalog, notifier, &request, prior, id).await;

    if let Err(err) = fs::remove_file(&lock).await {
        warn!("unable to remove publish lock {}: {}", lock.display(), err);
    }

    result.map_err(|err| {
        PublishFailed {
            report_id: id,
            detail: format!("{:#}", err),
        }
        .into()
    })
}

async fn publish_locked(
    config: &EffectiveConfig,
    catalog: &dyn Catalog,
    notifier: &dyn Notifier,
    request: &PublishRequest,
    prior: Option<CoverageReport>,
    id: u64,
) -> Result<CoverageReport> {
    let target_dir = config.publish_dir(id);
    let trace_store = config.trace_store(id);

    // Step 1: move the currently published artifacts aside.
    let mut asides: Vec<(PathBuf, PathBuf)> = Vec::new();
    if let Some(prior) = &prior {
        for path in [&prior.path, &prior.tracefile].into_iter().flatten() {
            if exists(path).await? {
                let aside = aside_path(path);
                fs::rename(path, &aside)
                    .await
                    .with_context(|| format!("unable to move aside: {}", path.display()))?;
                asides.push((path.clone(), aside));
            }
        }
    }

    // Step 2: install the new artifacts and record, then notify.
    let attempt = async {
        copy_dir(&request.rendered_dir, &target_dir)
            .await
            .context("unable to install rendered report")?;
        fs::copy(&request.merged_trace, &trace_store)
            .await
            .context("unable to install merged trace")?;

        let record = CoverageReport {
            id,
            project: request
                .project
                .clone()
                .or_else(|| prior.as_ref().and_then(|p| p.project.clone())),
            name: request.name.clone(),
            version: request.version.clone(),
            date: Utc::now(),
            path: Some(target_dir.clone()),
            url: Some(config.report_url(id)),
            tracefile: Some(trace_store.clone()),
            rules: request
                .rules
                .clone()
                .or_else(|| prior.as_ref().and_then(|p| p.rules.clone())),
            coverage_files: {
                let mut members = prior
                    .as_ref()
                    .map(|p| p.coverage_files.clone())
                    .unwrap_or_default();
                members.extend(request.members.iter().copied());
                members
            },
        };

        catalog.put_report(&record)?;

        let notified = notifier.upsert_row(id, &notify_fields(&record)).await;
        if !notified.ok {
            bail!(
                "notification failed: {}",
                notified.error.unwrap_or_else(|| "unknown".to_string())
            );
        }

        Ok(record)
    }
    .await;

    match attempt {
        Ok(record) => {
            // Commit: the asides are no longer needed.
            for (_, aside) in &asides {
                if let Err(err) = remove_path(aside).await {
                    warn!("unable to remove aside {}: {:#}", aside.display(), err);
                }
            }
            info!("published report {} at {}", id, target_dir.display());
            Ok(record)
        }
        Err(err) => {
            rollback(catalog, &prior, id, &target_dir, &trace_store, &asides).await;
            Err(err)
        }
    }
}

/// Restore the pre-publish state. Best-effort: a rollback step failure is
/// logged and never masks the publish error.
async fn rollback(
    catalog: &dyn Catalog,
    prior: &Option<CoverageReport>,
    id: u64,
    target_dir: &Path,
    trace_store: &Path,
    asides: &[(PathBuf, PathBuf)],
) {
    warn!("publish of report {} failed, rolling back", id);

    if let Err(err) = remove_dir_if_exists(target_dir).await {
        warn!("rollback: unable to remove {}: {:#}", target_dir.display(), err);
    }
    if let Err(err) = remove_file_if_exists(trace_store).await {
        warn!("rollback: unable to remove {}: {:#}", trace_store.display(), err);
    }

    for (original, aside) in asides {
        if let Err(err) = fs::rename(aside, original).await {
            warn!(
                "rollback: unable to restore {} from {}: {:#}",
                original.display(),
                aside.display(),
                err
            );
        }
    }

    let restore = match prior {
        Some(prior) => catalog.put_report(prior),
        None => catalog.delete_report(id),
    };
    if let Err(err) = restore {
        warn!("rollback: unable to restore catalog record {}: {:#}", id, err);
    }
}

async fn remove_file_if_exists(path: &Path) -> Result<()> {
    if exists(path).await? {
        fs::remove_file(path)
            .await
            .with_context(|| format!("unable to remove file: {}", path.display()))?;
    }
    Ok(())
}

async fn remove_path(path: &Path) -> Result<()> {
    if !exists(path).await? {
        return Ok(());
    }
    if fs::metadata(path).await?.is_dir() {
        remove_dir_if_exists(path).await
    } else {
        fs::remove_file(path).await.context("unable to remove file")
    }
}

#[cfg(test)]
mod tests {
    use covpool::fs::write_file;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::catalog::MemCatalog;
    use crate::notify::NullNotifier;
    use crate::tasks::config::test_global;

    async fn rendered_dir(base: &Path) -> PathBuf {
        let dir = base.join("rendered");
        write_file(dir.join("index.html"), "<html>ok</html>")
            .await
            .unwrap();
        dir
    }

    #[tokio::test]
    async fn test_publish_new_report_commits() {
        let base = tempfile::tempdir().unwrap();
        let storage = base.path().join("storage");
        let config = EffectiveConfig::new(&test_global(&storage), None);
        let catalog = MemCatalog::new();

        let rendered = rendered_dir(base.path()).await;
        let trace = base.path().join("merged.info");
        write_file(&trace, "TN:\nSF:/src/a.c\nend_of_record\n")
            .await
            .unwrap();

        let report = publish(
            &config,
            &catalog,
            &NullNotifier,
            PublishRequest {
                report_id: None,
                project: Some("libvirt".to_string()),
                name: "nightly".to_string(),
                version: "libvirt-4.5.0-1.el7.x86_64".to_string(),
                rules: None,
                members: BTreeSet::from([3]),
                rendered_dir: rendered,
                merged_trace: trace,
            },
        )
        .await
        .unwrap();

        assert_eq!(report.id, 1);
        assert_eq!(report.coverage_files, BTreeSet::from([3]));
        assert!(storage.join("report_1/index.html").exists());
        assert!(storage.join("merged_report_1").exists());
        assert!(!storage.join(".lock.1").exists());
        assert!(catalog.report(1).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_publish_refuses_concurrent_writer() {
        let base = tempfile::tempdir().unwrap();
        let storage = base.path().join("storage");
        let config = EffectiveConfig::new(&test_global(&storage), None);
        let catalog = MemCatalog::new();

        std::fs::create_dir_all(&storage).unwrap();
        std::fs::write(storage.join(".lock.1"), "").unwrap();

        let rendered = rendered_dir(base.path()).await;
        let trace = base.path().join("merged.info");
        write_file(&trace, "TN:\nend_of_record\n").await.unwrap();

        let err = publish(
            &config,
            &catalog,
            &NullNotifier,
            PublishRequest {
                report_id: None,
                project: None,
                name: "nightly".to_string(),
                version: "libvirt-4.5.0-1.el7.x86_64".to_string(),
                rules: None,
                members: BTreeSet::new(),
                rendered_dir: rendered,
                merged_trace: trace,
            },
        )
        .await
        .unwrap_err();

        let failed = err.downcast_ref::<PublishFailed>().unwrap();
        assert!(failed.detail.contains("lock"), "{}", failed.detail);
        assert!(!storage.join("report_1").exists());
    }

    #[tokio::test]
    async fn test_publish_storage_limit_gate() {
        let base = tempfile::tempdir().unwrap();
        let storage = base.path().join("storage");
        let mut global = test_global(&storage);
        global.storage_limit = Some(4);
        let config = EffectiveConfig::new(&global, None);
        let catalog = MemCatalog::new();

        std::fs::create_dir_all(&storage).unwrap();
        std::fs::write(storage.join("existing.bin"), vec![0u8; 64]).unwrap();

        let rendered = rendered_dir(base.path()).await;
        let trace = base.path().join("merged.info");
        write_file(&trace, "TN:\nend_of_record\n").await.unwrap();

        let err = publish(
            &config,
            &catalog,
            &NullNotifier,
            PublishRequest {
                report_id: None,
                project: None,
                name: "nightly".to_string(),
                version: "libvirt-4.5.0-1.el7.x86_64".to_string(),
                rules: None,
                members: BTreeSet::new(),
                rendered_dir: rendered,
                merged_trace: trace,
            },
        )
        .await
        .unwrap_err();

        let failed = err.downcast_ref::<PublishFailed>().unwrap();
        assert!(failed.detail.contains("storage limit"), "{}", failed.detail);
    }
}
