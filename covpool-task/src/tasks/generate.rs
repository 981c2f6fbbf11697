// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use anyhow::Result;
use std::collections::BTreeSet;
use std::path::Path;

use crate::catalog::{Catalog, CoverageReport};
use crate::notify::notifier_for;

use super::config::{EffectiveConfig, GlobalConfig};
use super::helper::{CoverageHelper, HelperRegistry};
use super::publish::{publish, PublishRequest};

/// Shared collaborators for one worker task.
pub struct TaskContext<'a> {
    pub catalog: &'a dyn Catalog,
    pub registry: &'a HelperRegistry,
    pub global: &'a GlobalConfig,
}

impl TaskContext<'_> {
    /// Effective configuration for a project, or the global defaults when
    /// the record names no project.
    pub fn effective(&self, project: Option<&str>) -> Result<EffectiveConfig> {
        let project = match project {
            Some(name) => self.catalog.project(name)?,
            None => None,
        };
        Ok(EffectiveConfig::new(self.global, project.as_ref()))
    }

    pub fn helper(&self, config: EffectiveConfig) -> Result<Box<dyn CoverageHelper>> {
        self.registry.create(config)
    }
}

/// Render and publish a report for a single uploaded coverage file.
pub async fn generate_report(
    ctx: &TaskContext<'_>,
    file_id: u64,
    output_dir: &Path,
) -> Result<CoverageReport> {
    let file = ctx.catalog.coverage_file(file_id)?;
    info!("generating report for coverage file {} ({})", file_id, file.version);

    let config = ctx.effective(file.project.as_deref())?;
    let helper = ctx.helper(config.clone())?;

    helper
        .gen_report(&file.version, &file.path, output_dir)
        .await?;

    let notifier = notifier_for(&config)?;

    publish(
        &config,
        ctx.catalog,
        notifier.as_ref(),
        PublishRequest {
            report_id: None,
            project: file.project.clone(),
            name: file.name.clone(),
            version: file.version.clone(),
            rules: None,
            members: BTreeSet::from([file_id]),
            rendered_dir: output_dir.to_path_buf(),
            merged_trace: file.path.clone(),
        },
    )
    .await
}
