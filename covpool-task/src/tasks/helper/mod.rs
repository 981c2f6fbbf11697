// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Project-type coverage helpers.
//!
//! A helper owns the tracefile operations for one kind of project. Helpers
//! are looked up through an explicit registry keyed by project type; an
//! unknown key is an error, never a silent default.

use anyhow::Result;
use async_trait::async_trait;
use covpool::pkg::PackageId;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

use super::config::EffectiveConfig;
use super::env::vcs::{DistRepo, VcsEnv};
use super::env::EnvError;

pub mod interpreted;
pub mod native;

#[derive(Debug, Error)]
pub enum HelperError {
    #[error("unknown project type: {0:?}")]
    UnknownProjectType(String),

    #[error("project type {project_type:?} does not support {op}")]
    UnsupportedOperation {
        project_type: String,
        op: &'static str,
    },
}

#[async_trait]
pub trait CoverageHelper: std::fmt::Debug + Send + Sync {
    /// Render an HTML report for one uploaded tracefile.
    async fn gen_report(&self, version: &str, tracefile: &Path, output_dir: &Path) -> Result<()>;

    /// Merge tracefiles of the same version into `output`, in input order.
    async fn merge_tracefiles(
        &self,
        version: &str,
        inputs: &[PathBuf],
        output: &Path,
    ) -> Result<()>;

    /// Re-express a tracefile captured against `src_version` in terms of
    /// `tgt_version` sources.
    async fn convert_tracefile(
        &self,
        src_version: &str,
        tgt_version: &str,
        tracefile: &Path,
        output: &Path,
    ) -> Result<()>;
}

type HelperFactory = fn(EffectiveConfig) -> Box<dyn CoverageHelper>;

pub struct HelperRegistry {
    factories: HashMap<String, HelperFactory>,
}

fn make_native(config: EffectiveConfig) -> Box<dyn CoverageHelper> {
    Box::new(native::NativeHelper::new(config))
}

fn make_interpreted(config: EffectiveConfig) -> Box<dyn CoverageHelper> {
    Box::new(interpreted::InterpretedHelper::new(config))
}

impl HelperRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with the built-in project types.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register("native", make_native);
        registry.register("interpreted", make_interpreted);
        registry
    }

    pub fn register(&mut self, project_type: impl Into<String>, factory: HelperFactory) {
        self.factories.insert(project_type.into(), factory);
    }

    pub fn create(&self, config: EffectiveConfig) -> Result<Box<dyn CoverageHelper>> {
        let factory = self
            .factories
            .get(&config.project_type)
            .ok_or_else(|| HelperError::UnknownProjectType(config.project_type.clone()))?;
        Ok(factory(config))
    }
}

impl Default for HelperRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Version-control environment for a package, per the effective config.
pub(crate) fn vcs_env(config: &EffectiveConfig, pkg: &PackageId) -> Result<VcsEnv> {
    let repo = config
        .git_repo
        .clone()
        .ok_or_else(|| EnvError::AcquisitionFailed(pkg.to_string()))?;

    let tag = config.tag(pkg);
    let dist = config.dist_git_repo.clone().map(|repo| DistRepo {
        repo,
        tag: tag.clone(),
    });

    Ok(VcsEnv::new(
        &pkg.name,
        repo,
        tag,
        &config.mirror_dir,
        config.build_tree(pkg),
        dist,
    ))
}

/// Directory path as a trace prefix, with exactly one trailing separator.
pub(crate) fn dir_prefix(path: &Path) -> String {
    let mut prefix = path.to_string_lossy().into_owned();
    if !prefix.ends_with('/') {
        prefix.push('/');
    }
    prefix
}
