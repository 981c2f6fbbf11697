// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Merge tasks: fold several coverage files into one published report.
//!
//! Plain merges require every input (and the report being extended) to
//! carry the same package version. Merge-convert lifts that restriction by
//! converting off-version traces to the target report's version first.

use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::catalog::{CoverageFile, CoverageReport};
use crate::notify::notifier_for;

use super::generate::TaskContext;
use super::publish::{publish, PublishRequest};
use super::TaskError;

fn temp_trace(prefix: &str) -> Result<PathBuf> {
    let path = tempfile::Builder::new()
        .prefix(prefix)
        .suffix(".info")
        .tempfile()
        .context("unable to create trace staging file")?
        .into_temp_path()
        .keep()
        .context("unable to persist trace staging file")?;
    Ok(path)
}

async fn remove_temps(temps: &[PathBuf]) {
    for temp in temps {
        if let Err(err) = fs::remove_file(temp).await {
            warn!("unable to remove staging file {}: {}", temp.display(), err);
        }
    }
}

fn fetch_files(ctx: &TaskContext<'_>, file_ids: &[u64]) -> Result<Vec<CoverageFile>> {
    if file_ids.is_empty() {
        bail!("no coverage files to merge");
    }
    file_ids
        .iter()
        .map(|id| ctx.catalog.coverage_file(*id))
        .collect()
}

fn existing_report(ctx: &TaskContext<'_>, id: u64) -> Result<CoverageReport> {
    ctx.catalog
        .report(id)?
        .ok_or_else(|| format_err!("no such report: {}", id))
}

/// Merge same-version coverage files, optionally extending report
/// `report_id` with them.
pub async fn merge_reports(
    ctx: &TaskContext<'_>,
    file_ids: &[u64],
    output_dir: &Path,
    report_id: Option<u64>,
) -> Result<CoverageReport> {
    let files = fetch_files(ctx, file_ids)?;

    let version = files[0].version.clone();
    for file in &files {
        if file.version != version {
            return Err(TaskError::VersionMismatch(version, file.version.clone()).into());
        }
    }

    let existing = match report_id {
        Some(id) => Some(existing_report(ctx, id)?),
        None => None,
    };
    if let Some(existing) = &existing {
        if existing.version != version {
            return Err(TaskError::VersionMismatch(existing.version.clone(), version).into());
        }
    }

    let project = existing
        .as_ref()
        .and_then(|r| r.project.clone())
        .or_else(|| files[0].project.clone());
    let config = ctx.effective(project.as_deref())?;
    let helper = ctx.helper(config.clone())?;

    let mut inputs: Vec<PathBuf> = Vec::new();
    if let Some(tracefile) = existing.as_ref().and_then(|r| r.tracefile.clone()) {
        inputs.push(tracefile);
    }
    inputs.extend(files.iter().map(|f| f.path.clone()));

    let merged = temp_trace("merged-")?;

    let result = async {
        helper.merge_tracefiles(&version, &inputs, &merged).await?;
        helper.gen_report(&version, &merged, output_dir).await?;

        let notifier = notifier_for(&config)?;
        publish(
            &config,
            ctx.catalog,
            notifier.as_ref(),
            PublishRequest {
                report_id,
                project,
                name: existing
                    .as_ref()
                    .map(|r| r.name.clone())
                    .unwrap_or_else(|| files[0].name.clone()),
                version: version.clone(),
                rules: Some("merge".to_string()),
                members: file_ids.iter().copied().collect::<BTreeSet<u64>>(),
                rendered_dir: output_dir.to_path_buf(),
                merged_trace: merged.clone(),
            },
        )
        .await
    }
    .await;

    remove_temps(&[merged]).await;

    result
}

/// Extend report `report_id` with coverage files of any version, converting
/// off-version traces to the report's version first.
pub async fn merge_convert_reports(
    ctx: &TaskContext<'_>,
    file_ids: &[u64],
    output_dir: &Path,
    report_id: u64,
) -> Result<CoverageReport> {
    let files = fetch_files(ctx, file_ids)?;
    let existing = existing_report(ctx, report_id)?;
    let target_version = existing.version.clone();

    let project = existing.project.clone();
    let config = ctx.effective(project.as_deref())?;
    let helper = ctx.helper(config.clone())?;

    let mut temps: Vec<PathBuf> = Vec::new();

    let result = async {
        let mut inputs: Vec<PathBuf> = Vec::new();
        if let Some(tracefile) = &existing.tracefile {
            inputs.push(tracefile.clone());
        }

        for file in &files {
            if file.version == target_version {
                inputs.push(file.path.clone());
                continue;
            }

            info!(
                "converting coverage file {} from {} to {}",
                file.id, file.version, target_version
            );
            let converted = temp_trace("converted-")?;
            temps.push(converted.clone());
            helper
                .convert_tracefile(&file.version, &target_version, &file.path, &converted)
                .await?;
            inputs.push(converted);
        }

        let merged = temp_trace("merged-")?;
        temps.push(merged.clone());

        helper
            .merge_tracefiles(&target_version, &inputs, &merged)
            .await?;
        helper
            .gen_report(&target_version, &merged, output_dir)
            .await?;

        let notifier = notifier_for(&config)?;
        publish(
            &config,
            ctx.catalog,
            notifier.as_ref(),
            PublishRequest {
                report_id: Some(report_id),
                project,
                name: existing.name.clone(),
                version: target_version.clone(),
                rules: Some("merge".to_string()),
                members: file_ids.iter().copied().collect::<BTreeSet<u64>>(),
                rendered_dir: output_dir.to_path_buf(),
                merged_trace: merged.clone(),
            },
        )
        .await
    }
    .await;

    remove_temps(&temps).await;

    result
}
