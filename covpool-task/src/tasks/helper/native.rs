// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use anyhow::Result;
use async_trait::async_trait;
use covpool::pkg::{distro_tag, installed_version, PackageId};
use covpool::process::run_cmd_in;
use covpool::tag::TagFormat;
use covpool::trace::rewrite_to_copy;
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::tasks::config::EffectiveConfig;
use crate::tasks::env::archive::ArchiveEnv;
use crate::tasks::env::reinstall::ReinstallEnv;
use crate::tasks::env::{select_strategy, with_env, SourceEnv, Strategy};
use crate::tasks::report::Renderer;
use crate::tasks::trace_tools::LcovTools;

use super::{dir_prefix, vcs_env, CoverageHelper};

/// Helper for compiled projects whose traces reference an instrumented
/// build tree.
#[derive(Debug)]
pub struct NativeHelper {
    config: EffectiveConfig,
    tools: LcovTools,
    renderer: Renderer,
}

impl NativeHelper {
    pub fn new(config: EffectiveConfig) -> Self {
        Self {
            config,
            tools: LcovTools::default(),
            renderer: Renderer::default(),
        }
    }

    /// Resolve the acquisition strategy and its environment for a package.
    async fn resolve_env(&self, pkg: &PackageId) -> Result<(Strategy, Box<dyn SourceEnv>)> {
        let installed = installed_version(&pkg.name).await.ok();
        let distro = distro_tag().ok();
        let strategy = select_strategy(pkg, installed.as_deref(), distro.as_deref());

        info!("acquiring sources for {} via {:?}", pkg, strategy);

        let env: Box<dyn SourceEnv> = match strategy {
            Strategy::Reinstall => Box::new(ReinstallEnv::new(
                pkg.clone(),
                self.config.companion_packages.clone(),
                self.config.rebuild_cmd.clone(),
            )),
            Strategy::Archive => {
                let packages = self
                    .config
                    .archive_packages
                    .iter()
                    .map(|template| TagFormat::new(template).evaluate(pkg))
                    .collect();
                Box::new(ArchiveEnv::new(packages))
            }
            Strategy::Vcs => Box::new(vcs_env(&self.config, pkg)?),
        };

        Ok((strategy, env))
    }

    async fn run_extra_prepare(&self, work_dir: &Path) -> Result<()> {
        for template in &self.config.extra_prepare {
            let argv: Vec<String> = template
                .iter()
                .map(|arg| arg.replace("{work_dir}", &work_dir.to_string_lossy()))
                .collect();
            if let Some((program, args)) = argv.split_first() {
                run_cmd_in(program, args, work_dir).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl CoverageHelper for NativeHelper {
    async fn gen_report(&self, version: &str, tracefile: &Path, output_dir: &Path) -> Result<()> {
        let pkg: PackageId = version.parse()?;
        let (strategy, env) = self.resolve_env(&pkg).await?;
        let from_vcs = strategy == Strategy::Vcs;

        with_env(env, |tree| async move {
            if from_vcs {
                if let Some(work_dir) = &tree {
                    self.run_extra_prepare(work_dir).await?;
                }
            }

            // An unpacked archive is the source tree itself; the other
            // strategies resolve into the instrumented build root.
            let new_prefix = match (strategy, &tree) {
                (Strategy::Archive, Some(dir)) => dir_prefix(dir),
                _ => dir_prefix(&self.config.build_root),
            };

            let copy =
                rewrite_to_copy(tracefile, &self.config.trace_prefix, &new_prefix, true).await?;

            let rendered = self.renderer.render(&copy, output_dir, from_vcs, None).await;

            if let Err(err) = fs::remove_file(&copy).await {
                warn!("unable to remove trace copy: {:#}", err);
            }

            rendered
        })
        .await
    }

    async fn merge_tracefiles(
        &self,
        version: &str,
        inputs: &[PathBuf],
        output: &Path,
    ) -> Result<()> {
        // The version gate: traces from another package family never merge.
        let _pkg: PackageId = version.parse()?;

        let canonical = dir_prefix(&self.config.build_root);

        let mut copies = Vec::new();
        let result = async {
            for input in inputs {
                let copy =
                    rewrite_to_copy(input, &self.config.trace_prefix, &canonical, false).await?;
                copies.push(copy);
            }
            self.tools.merge(&copies, output, None).await
        }
        .await;

        for copy in &copies {
            if let Err(err) = fs::remove_file(copy).await {
                warn!("unable to remove trace copy: {:#}", err);
            }
        }

        result
    }

    async fn convert_tracefile(
        &self,
        src_version: &str,
        tgt_version: &str,
        tracefile: &Path,
        output: &Path,
    ) -> Result<()> {
        let src: PackageId = src_version.parse()?;
        let tgt: PackageId = tgt_version.parse()?;

        let mut env = vcs_env(&self.config, &tgt)?;

        let result = async {
            env.acquire().await?;

            let diff = env
                .diff(&self.config.tag(&src), &self.config.tag(&tgt))
                .await?;

            let converted = self.tools.convert(tracefile, &diff, output).await;

            if let Err(err) = fs::remove_file(&diff).await {
                warn!("unable to remove diff file: {:#}", err);
            }

            converted
        }
        .await;

        if let Err(err) = env.release().await {
            warn!("environment release failed: {:#}", err);
            if result.is_ok() {
                return Err(err);
            }
        }

        result
    }
}
