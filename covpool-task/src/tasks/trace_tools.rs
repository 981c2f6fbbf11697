// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use anyhow::{Context, Result};
use covpool::fs::exists;
use covpool::process::run_cmd;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;

#[derive(Debug, Error)]
pub enum TraceToolError {
    #[error("trace merge failed: {0}")]
    MergeFailed(String),
}

/// Thin front for the `lcov` binary.
#[derive(Debug)]
pub struct LcovTools {
    lcov: String,
}

impl Default for LcovTools {
    fn default() -> Self {
        Self {
            lcov: "lcov".to_string(),
        }
    }
}

impl LcovTools {
    pub fn new(lcov: impl Into<String>) -> Self {
        Self { lcov: lcov.into() }
    }

    /// Merge tracefiles into `output`, preserving input order.
    ///
    /// The merge lands in a sibling temporary file first; `output` is only
    /// ever replaced whole, never left partially written. `config_file` is
    /// handed to the tool via `--config-file`, the hook used for source-path
    /// remapping.
    pub async fn merge(
        &self,
        inputs: &[PathBuf],
        output: &Path,
        config_file: Option<&Path>,
    ) -> Result<()> {
        if inputs.is_empty() {
            return Err(TraceToolError::MergeFailed("no tracefiles to merge".to_string()).into());
        }
        for input in inputs {
            if !exists(input).await? {
                return Err(TraceToolError::MergeFailed(format!(
                    "tracefile does not exist: {}",
                    input.display()
                ))
                .into());
            }
        }

        let parent = output
            .parent()
            .ok_or_else(|| format_err!("merge output has no parent: {}", output.display()))?;
        fs::create_dir_all(parent).await?;

        let staging = tempfile::Builder::new()
            .prefix("merge-")
            .suffix(".info")
            .tempfile_in(parent)
            .context("unable to create merge staging file")?
            .into_temp_path();

        let mut argv = Vec::new();
        if let Some(config_file) = config_file {
            argv.push("--config-file".to_string());
            argv.push(config_file.to_string_lossy().into_owned());
        }
        for input in inputs {
            argv.push("-a".to_string());
            argv.push(input.to_string_lossy().into_owned());
        }
        argv.push("-o".to_string());
        argv.push(staging.to_string_lossy().into_owned());

        if let Err(err) = run_cmd(&self.lcov, &argv).await {
            return Err(TraceToolError::MergeFailed(format!("{:#}", err)).into());
        }

        staging
            .persist(output)
            .with_context(|| format!("unable to persist merge output: {}", output.display()))?;

        Ok(())
    }

    /// Convert a tracefile across source versions using a unified diff of the
    /// two trees.
    pub async fn convert(&self, tracefile: &Path, diff_file: &Path, output: &Path) -> Result<()> {
        let argv = vec![
            "--diff".to_string(),
            tracefile.to_string_lossy().into_owned(),
            diff_file.to_string_lossy().into_owned(),
            "-o".to_string(),
            output.to_string_lossy().into_owned(),
        ];
        run_cmd(&self.lcov, &argv)
            .await
            .with_context(|| format!("unable to convert tracefile: {}", tracefile.display()))?;

        Ok(())
    }
}

/// Write a tool configuration file remapping recorded source prefixes to
/// their current locations, fed to merge/render invocations via
/// `--config-file`.
pub async fn write_remap_config(path: &Path, mappings: &[(String, String)]) -> Result<()> {
    let mut text = String::new();
    for (old, new) in mappings {
        text.push_str(&format!("geninfo_adjust_src_path = {} => {}\n", old, new));
    }

    fs::write(path, text)
        .await
        .with_context(|| format!("unable to write remap config: {}", path.display()))?;

    Ok(())
}
