// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use anyhow::{Context, Result};
use async_trait::async_trait;
use covpool::fs::remove_dir_if_exists;
use covpool::process::{run_cmd, run_pipeline};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io;
use tokio::io::AsyncWriteExt;
use url::Url;

use super::SourceEnv;

/// Download one or more package archives and unpack them into a private
/// temporary directory, which becomes the source tree.
///
/// On any failure the private directory is fully removed before the error
/// propagates; `release` removes it too and only acts if a directory was
/// actually created.
pub struct ArchiveEnv {
    packages: Vec<String>,
    dir: Option<PathBuf>,
}

impl ArchiveEnv {
    pub fn new(packages: Vec<String>) -> Self {
        Self {
            packages,
            dir: None,
        }
    }

    async fn unpack_all(&self, dir: &Path) -> Result<()> {
        for package in &self.packages {
            let argv = vec!["-q".to_string(), "--urls".to_string(), package.clone()];
            let output = run_cmd("yumdownloader", &argv)
                .await
                .with_context(|| format!("unable to resolve download url for {}", package))?;

            let url = output
                .stdout
                .lines()
                .map(str::trim)
                .find(|line| !line.is_empty())
                .ok_or_else(|| format_err!("no download url reported for {}", package))?;

            info!("downloading {} from {}", package, url);
            let archive = download(url, dir).await?;

            let archive_arg = vec![archive.to_string_lossy().into_owned()];
            let cpio_args = vec!["-idm".to_string()];
            run_pipeline(("rpm2cpio", &archive_arg), ("cpio", &cpio_args), dir)
                .await
                .with_context(|| format!("unable to unpack archive for {}", package))?;

            fs::remove_file(&archive)
                .await
                .with_context(|| format!("unable to remove archive: {}", archive.display()))?;
        }

        Ok(())
    }
}

async fn download(url: &str, dst: &Path) -> Result<PathBuf> {
    let url = Url::parse(url).with_context(|| format!("invalid download url: {}", url))?;

    let file_name = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|name| !name.is_empty())
        .ok_or_else(|| format_err!("download url has no file name: {}", url))?;
    let file_path = dst.join(file_name);

    let resp = reqwest::Client::new()
        .get(url.clone())
        .send()
        .await
        .context("archive download")?
        .error_for_status()
        .context("archive download status")?;

    let body = resp.bytes().await?;
    let mut body = body.as_ref();

    let file = fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&file_path)
        .await?;
    let mut writer = io::BufWriter::new(file);

    io::copy(&mut body, &mut writer).await?;
    writer.flush().await?;

    Ok(file_path)
}

#[async_trait]
impl SourceEnv for ArchiveEnv {
    async fn acquire(&mut self) -> Result<Option<PathBuf>> {
        let dir = tempfile::Builder::new()
            .prefix("covpool-archive-")
            .tempdir()
            .context("unable to create archive work directory")?
            .into_path();
        self.dir = Some(dir.clone());

        if let Err(err) = self.unpack_all(&dir).await {
            if let Err(cleanup) = self.release().await {
                warn!("archive cleanup failed: {:#}", cleanup);
            }
            return Err(err);
        }

        Ok(Some(dir))
    }

    async fn release(&mut self) -> Result<()> {
        if let Some(dir) = self.dir.take() {
            remove_dir_if_exists(&dir).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_release_without_acquire_is_a_noop() {
        let mut env = ArchiveEnv::new(vec!["libvirt-docs-4.5.0-1.el7".to_string()]);
        env.release().await.unwrap();
        env.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_acquire_removes_private_directory() {
        // yumdownloader is not available in the test environment, so the
        // acquire fails at url resolution; the tempdir must be gone.
        let mut env = ArchiveEnv::new(vec!["libvirt-docs-4.5.0-1.el7".to_string()]);
        let result = env.acquire().await;
        assert!(result.is_err());
        assert!(env.dir.is_none());
    }
}
