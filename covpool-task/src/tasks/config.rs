// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use anyhow::{Context, Result};
use covpool::pkg::PackageId;
use covpool::tag::TagFormat;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::catalog::Project;

/// Global worker configuration, read once at startup.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct GlobalConfig {
    /// Published reports and merged trace artifacts live under here.
    pub storage_dir: PathBuf,
    /// Public URL the published directory is served from.
    pub base_url: String,
    /// Template resolving a package identifier to a version-control tag.
    pub tag_fmt: String,
    #[serde(default)]
    pub git_repo: Option<String>,
    #[serde(default)]
    pub dist_git_repo: Option<String>,
    /// Persistent per-project repository mirrors.
    pub mirror_dir: PathBuf,
    /// Tool-managed instrumented build root, e.g. `/mnt/coverage`.
    pub build_root: PathBuf,
    /// Per-version build tree under `build_root`.
    #[serde(default = "default_build_tree_fmt")]
    pub build_tree_fmt: String,
    /// Source prefix embedded in uploaded traces, e.g. `/usr/coverage/`.
    #[serde(default = "default_trace_prefix")]
    pub trace_prefix: String,
    /// Coverage-instrumentation rebuild hook, run after a package reinstall.
    #[serde(default)]
    pub rebuild_cmd: Option<Vec<String>>,
    /// Ordered external commands regenerating generated sources after a
    /// checkout. `{work_dir}` expands to the working copy path.
    #[serde(default)]
    pub extra_prepare: Vec<Vec<String>>,
    /// Marker appended to `release` by instrumented builds; stripped before
    /// tag resolution.
    #[serde(default)]
    pub instrumentation_suffix: Option<String>,
    /// Templates naming the downloadable archives holding the source tree.
    #[serde(default = "default_archive_packages")]
    pub archive_packages: Vec<String>,
    /// Additional package families reinstalled alongside the main package.
    #[serde(default)]
    pub companion_packages: Vec<String>,
    #[serde(default)]
    pub notify_url: Option<String>,
    #[serde(default)]
    pub notify_token: Option<String>,
    /// Storage-size gate in bytes; new publishes are refused once exceeded.
    #[serde(default)]
    pub storage_limit: Option<u64>,
    #[serde(default = "default_project_type")]
    pub project_type: String,
}

fn default_build_tree_fmt() -> String {
    "BUILD/{name}-{version}".to_string()
}

fn default_trace_prefix() -> String {
    "/usr/coverage/".to_string()
}

fn default_archive_packages() -> Vec<String> {
    vec!["{name}-docs-{version}-{release}".to_string()]
}

fn default_project_type() -> String {
    "native".to_string()
}

impl GlobalConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("unable to read config: {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("unable to parse config: {}", path.display()))
    }
}

/// Configuration for one request: global defaults with per-project record
/// overrides layered on top. Assembled once, passed explicitly.
#[derive(Clone, Debug)]
pub struct EffectiveConfig {
    pub storage_dir: PathBuf,
    pub base_url: String,
    pub tag_fmt: String,
    pub git_repo: Option<String>,
    pub dist_git_repo: Option<String>,
    pub mirror_dir: PathBuf,
    pub build_root: PathBuf,
    pub build_tree_fmt: String,
    pub trace_prefix: String,
    pub rebuild_cmd: Option<Vec<String>>,
    pub extra_prepare: Vec<Vec<String>>,
    pub instrumentation_suffix: Option<String>,
    pub archive_packages: Vec<String>,
    pub companion_packages: Vec<String>,
    pub notify_url: Option<String>,
    pub notify_token: Option<String>,
    pub storage_limit: Option<u64>,
    pub project_type: String,
}

impl EffectiveConfig {
    pub fn new(global: &GlobalConfig, project: Option<&Project>) -> Self {
        let mut config = Self {
            storage_dir: global.storage_dir.clone(),
            base_url: global.base_url.clone(),
            tag_fmt: global.tag_fmt.clone(),
            git_repo: global.git_repo.clone(),
            dist_git_repo: global.dist_git_repo.clone(),
            mirror_dir: global.mirror_dir.clone(),
            build_root: global.build_root.clone(),
            build_tree_fmt: global.build_tree_fmt.clone(),
            trace_prefix: global.trace_prefix.clone(),
            rebuild_cmd: global.rebuild_cmd.clone(),
            extra_prepare: global.extra_prepare.clone(),
            instrumentation_suffix: global.instrumentation_suffix.clone(),
            archive_packages: global.archive_packages.clone(),
            companion_packages: global.companion_packages.clone(),
            notify_url: global.notify_url.clone(),
            notify_token: global.notify_token.clone(),
            storage_limit: global.storage_limit,
            project_type: global.project_type.clone(),
        };

        if let Some(project) = project {
            if let Some(base_dir) = &project.base_dir {
                config.storage_dir = base_dir.clone();
            }
            if let Some(base_url) = &project.base_url {
                config.base_url = base_url.clone();
            }
            if let Some(tag_fmt) = &project.tag_fmt {
                config.tag_fmt = tag_fmt.clone();
            }
            if let Some(git_repo) = &project.git_repo {
                config.git_repo = Some(git_repo.clone());
            }
            if let Some(dist_git_repo) = &project.dist_git_repo {
                config.dist_git_repo = Some(dist_git_repo.clone());
            }
            if let Some(notify_url) = &project.notify_url {
                config.notify_url = Some(notify_url.clone());
            }
            if let Some(notify_token) = &project.notify_token {
                config.notify_token = Some(notify_token.clone());
            }
            if let Some(project_type) = &project.project_type {
                config.project_type = project_type.clone();
            }
        }

        config
    }

    /// Resolve the version-control tag for a package identifier.
    pub fn tag(&self, id: &PackageId) -> String {
        let mut fmt = TagFormat::new(&self.tag_fmt);
        if let Some(suffix) = &self.instrumentation_suffix {
            fmt = fmt.instrumentation_suffix(suffix);
        }
        fmt.evaluate(id)
    }

    /// Per-version build tree the trace paths are remapped into.
    pub fn build_tree(&self, id: &PackageId) -> PathBuf {
        self.build_root
            .join(TagFormat::new(&self.build_tree_fmt).evaluate(id))
    }

    pub fn publish_dir(&self, report_id: u64) -> PathBuf {
        self.storage_dir.join(format!("report_{}", report_id))
    }

    pub fn trace_store(&self, report_id: u64) -> PathBuf {
        self.storage_dir.join(format!("merged_report_{}", report_id))
    }

    pub fn report_url(&self, report_id: u64) -> String {
        format!(
            "{}/report_{}/",
            self.base_url.trim_end_matches('/'),
            report_id
        )
    }
}

#[cfg(test)]
pub(crate) fn test_global(storage_dir: &Path) -> GlobalConfig {
    GlobalConfig {
        storage_dir: storage_dir.to_path_buf(),
        base_url: "https://coverage.example.com/pub".to_string(),
        tag_fmt: "v{version}-{release}".to_string(),
        git_repo: Some("https://git.example.com/libvirt.git".to_string()),
        dist_git_repo: None,
        mirror_dir: storage_dir.join("mirrors"),
        build_root: PathBuf::from("/mnt/coverage"),
        build_tree_fmt: default_build_tree_fmt(),
        trace_prefix: default_trace_prefix(),
        rebuild_cmd: None,
        extra_prepare: Vec::new(),
        instrumentation_suffix: None,
        archive_packages: default_archive_packages(),
        companion_packages: Vec::new(),
        notify_url: None,
        notify_token: None,
        storage_limit: None,
        project_type: default_project_type(),
    }
}
