// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use anyhow::{Context, Result};
use covpool::fs::{copy_dir, exists, remove_dir_if_exists};
use covpool::process::{run_cmd, Output};
use regex::Regex;
use std::path::{Path, PathBuf};
use tokio::fs;

use async_trait::async_trait;

use super::{EnvError, SourceEnv};

/// Secondary "distribution" repository layered on top of upstream source.
pub struct DistRepo {
    pub repo: String,
    pub tag: String,
}

/// Check out a tagged working copy from a long-lived local mirror.
///
/// The mirror (one per project name) is cloned on first use and pulled on
/// every later one; the working copy is disposable and rebuilt from the
/// mirror for each acquisition. Two concurrent acquisitions of the same
/// project race on the pull step; serialize per project externally if that
/// matters.
pub struct VcsEnv {
    name: String,
    repo: String,
    tag: String,
    mirror_base: PathBuf,
    work_dir: PathBuf,
    dist: Option<DistRepo>,
}

impl VcsEnv {
    pub fn new(
        name: impl Into<String>,
        repo: impl Into<String>,
        tag: impl Into<String>,
        mirror_base: impl Into<PathBuf>,
        work_dir: impl Into<PathBuf>,
        dist: Option<DistRepo>,
    ) -> Self {
        Self {
            name: name.into(),
            repo: repo.into(),
            tag: tag.into(),
            mirror_base: mirror_base.into(),
            work_dir: work_dir.into(),
            dist,
        }
    }

    /// Unified diff between two tags of the working copy, written to a
    /// private temporary file. The caller owns the returned path.
    pub async fn diff(&self, src_tag: &str, tgt_tag: &str) -> Result<PathBuf> {
        let output = git(
            &self.work_dir,
            &["diff".to_string(), src_tag.to_string(), tgt_tag.to_string()],
        )
        .await
        .with_context(|| format!("unable to diff {} against {}", src_tag, tgt_tag))?;

        let diff_file = tempfile::Builder::new()
            .prefix("diff-")
            .suffix(".patch")
            .tempfile()
            .context("unable to create diff file")?
            .into_temp_path()
            .keep()
            .context("unable to persist diff file")?;

        fs::write(&diff_file, output.stdout).await?;

        Ok(diff_file)
    }

    async fn apply_patches(&self, dist_work: &Path) -> Result<()> {
        let spec_file = dist_work.join(format!("{}.spec", self.name));
        let text = fs::read_to_string(&spec_file)
            .await
            .with_context(|| format!("unable to read patch spec: {}", spec_file.display()))?;

        for patch in parse_patch_series(&text) {
            let patch_file = dist_work.join(&patch);
            info!("applying distribution patch: {}", patch);

            let argv = vec![
                "am".to_string(),
                "-3".to_string(),
                patch_file.to_string_lossy().into_owned(),
            ];
            if let Err(err) = git(&self.work_dir, &argv).await {
                return Err(EnvError::PatchApplyFailed {
                    patch,
                    detail: format!("{:#}", err),
                }
                .into());
            }
        }

        Ok(())
    }
}

async fn git(work_tree: &Path, args: &[String]) -> Result<Output> {
    let git_dir = work_tree.join(".git");
    let mut argv = vec![
        "--git-dir".to_string(),
        git_dir.to_string_lossy().into_owned(),
        "--work-tree".to_string(),
        work_tree.to_string_lossy().into_owned(),
    ];
    argv.extend_from_slice(args);
    run_cmd("git", &argv).await
}

/// Clone-or-pull the mirror, then rebuild the working copy from it and
/// force-checkout `tag`, discarding any local state.
pub async fn prepare_repo(
    repo: &str,
    mirror: &Path,
    work_dir: &Path,
    tag: Option<&str>,
) -> Result<()> {
    if exists(mirror).await? {
        git(mirror, &["pull".to_string()])
            .await
            .with_context(|| format!("unable to update mirror: {}", mirror.display()))?;
    } else {
        let argv = vec![
            "clone".to_string(),
            repo.to_string(),
            mirror.to_string_lossy().into_owned(),
        ];
        run_cmd("git", &argv)
            .await
            .with_context(|| format!("unable to clone {}", repo))?;
    }

    remove_dir_if_exists(work_dir).await?;
    copy_dir(mirror, work_dir).await?;

    if let Some(tag) = tag {
        git(
            work_dir,
            &["checkout".to_string(), "-f".to_string(), tag.to_string()],
        )
        .await
        .with_context(|| format!("unable to check out {}", tag))?;
    }

    Ok(())
}

/// `Patch<N>: <file>` directives of a distribution spec, in declaration
/// order.
pub fn parse_patch_series(spec: &str) -> Vec<String> {
    let pattern = Regex::new(r"^Patch[0-9]+:\s*(\S+)").expect("static regex");

    spec.lines()
        .filter_map(|line| pattern.captures(line))
        .map(|captures| captures[1].to_string())
        .collect()
}

#[async_trait]
impl SourceEnv for VcsEnv {
    async fn acquire(&mut self) -> Result<Option<PathBuf>> {
        let mirror = self.mirror_base.join(&self.name);
        prepare_repo(&self.repo, &mirror, &self.work_dir, Some(&self.tag)).await?;

        if let Some(dist) = &self.dist {
            let dist_mirror = self.mirror_base.join(format!("{}-dist-git", self.name));
            let dist_work = tempfile::Builder::new()
                .prefix("covpool-dist-")
                .tempdir()
                .context("unable to create dist work directory")?
                .into_path();

            let result = async {
                prepare_repo(&dist.repo, &dist_mirror, &dist_work, Some(&dist.tag)).await?;
                self.apply_patches(&dist_work).await
            }
            .await;

            if let Err(cleanup) = remove_dir_if_exists(&dist_work).await {
                warn!("dist work cleanup failed: {:#}", cleanup);
            }
            result?;
        }

        Ok(Some(self.work_dir.clone()))
    }

    async fn release(&mut self) -> Result<()> {
        // The disposable working copy only; the mirror persists.
        remove_dir_if_exists(&self.work_dir).await
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_parse_patch_series_in_declaration_order() {
        let spec = "\
            Name: libvirt\n\
            Patch0: 0001-fix-leak.patch\n\
            BuildRequires: gcc\n\
            Patch2: 0003-backport.patch\n\
            Patch1: 0002-cve.patch\n\
            %description\n\
            Patch lines after the preamble are still honored in file order.\n";

        let series = parse_patch_series(spec);
        assert_eq!(
            series,
            vec![
                "0001-fix-leak.patch",
                "0003-backport.patch",
                "0002-cve.patch"
            ]
        );
    }

    #[test]
    fn test_parse_patch_series_ignores_non_patch_lines() {
        assert!(parse_patch_series("Name: x\nSource0: x.tar.gz\n").is_empty());
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let parent = tempfile::tempdir().unwrap();
        let work_dir = parent.path().join("work");
        fs::create_dir_all(&work_dir).await.unwrap();

        let mut env = VcsEnv::new(
            "libvirt",
            "https://git.example.com/libvirt.git",
            "v4.5.0",
            parent.path().join("mirrors"),
            &work_dir,
            None,
        );

        env.release().await.unwrap();
        assert!(!exists(&work_dir).await.unwrap());
        env.release().await.unwrap();
    }
}
