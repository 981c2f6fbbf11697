// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use anyhow::{Context, Result};
use covpool::process::run_cmd;
use std::path::Path;
use tokio::fs;

/// HTML report renderer backed by `genhtml`.
#[derive(Debug)]
pub struct Renderer {
    genhtml: String,
}

impl Default for Renderer {
    fn default() -> Self {
        Self {
            genhtml: "genhtml".to_string(),
        }
    }
}

impl Renderer {
    pub fn new(genhtml: impl Into<String>) -> Self {
        Self {
            genhtml: genhtml.into(),
        }
    }

    /// Render `tracefile` into `output_dir`, creating the directory if
    /// needed. `ignore_source_errors` keeps rendering going when referenced
    /// sources are missing from the tree; `config_file` carries source-path
    /// remap settings via `--config-file`.
    pub async fn render(
        &self,
        tracefile: &Path,
        output_dir: &Path,
        ignore_source_errors: bool,
        config_file: Option<&Path>,
    ) -> Result<()> {
        fs::create_dir_all(output_dir)
            .await
            .with_context(|| format!("unable to create report dir: {}", output_dir.display()))?;

        let mut argv = vec![
            tracefile.to_string_lossy().into_owned(),
            "--output-directory".to_string(),
            output_dir.to_string_lossy().into_owned(),
        ];
        if ignore_source_errors {
            argv.push("--ignore-errors".to_string());
            argv.push("source".to_string());
        }
        if let Some(config_file) = config_file {
            argv.push("--config-file".to_string());
            argv.push(config_file.to_string_lossy().into_owned());
        }

        run_cmd(&self.genhtml, &argv)
            .await
            .with_context(|| format!("unable to render report for {}", tracefile.display()))?;

        Ok(())
    }
}
