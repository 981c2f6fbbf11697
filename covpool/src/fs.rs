// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::fs;

pub async fn exists(entry: impl AsRef<Path>) -> Result<bool> {
    use std::io::ErrorKind::NotFound;

    let metadata = fs::metadata(entry).await;

    if let Err(err) = &metadata {
        if err.kind() == NotFound {
            return Ok(false);
        }
    }

    // Return an error if it was anything other than `NotFound`.
    metadata?;

    Ok(true)
}

pub async fn write_file(path: impl AsRef<Path>, content: &str) -> Result<()> {
    let path = path.as_ref();
    let parent = path
        .parent()
        .ok_or_else(|| format_err!("no parent for: {}", path.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("unable to create nested path: {}", parent.display()))?;
    fs::write(path, content)
        .await
        .with_context(|| format!("unable to write file: {}", path.display()))?;
    Ok(())
}

pub async fn reset_dir(dir: impl AsRef<Path>) -> Result<()> {
    let dir = dir.as_ref();

    if exists(dir).await? {
        fs::remove_dir_all(dir).await.with_context(|| {
            format!("unable to remove directory and contents: {}", dir.display())
        })?;
    }

    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("unable to create directory: {}", dir.display()))?;

    Ok(())
}

pub async fn remove_dir_if_exists(dir: impl AsRef<Path>) -> Result<()> {
    let dir = dir.as_ref();

    if exists(dir).await? {
        fs::remove_dir_all(dir).await.with_context(|| {
            format!("unable to remove directory and contents: {}", dir.display())
        })?;
    }

    Ok(())
}

/// Recursively copy `src` into `dst`, preserving symlinks.
///
/// Symlinks matter here: checkout trees contain them, and resolving them
/// would both bloat the copy and break relative link targets.
pub async fn copy_dir(src: impl AsRef<Path>, dst: impl AsRef<Path>) -> Result<()> {
    let mut pending = vec![(src.as_ref().to_path_buf(), dst.as_ref().to_path_buf())];

    while let Some((src, dst)) = pending.pop() {
        fs::create_dir_all(&dst)
            .await
            .with_context(|| format!("unable to create directory: {}", dst.display()))?;

        let mut entries = fs::read_dir(&src)
            .await
            .with_context(|| format!("unable to read directory: {}", src.display()))?;

        while let Some(entry) = entries.next_entry().await? {
            let from = entry.path();
            let to = dst.join(entry.file_name());
            let file_type = entry.file_type().await?;

            if file_type.is_dir() {
                pending.push((from, to));
            } else if file_type.is_symlink() {
                let target = fs::read_link(&from)
                    .await
                    .with_context(|| format!("unable to read link: {}", from.display()))?;
                symlink(&target, &to).await?;
            } else {
                fs::copy(&from, &to).await.with_context(|| {
                    format!("unable to copy {} to {}", from.display(), to.display())
                })?;
            }
        }
    }

    Ok(())
}

#[cfg(unix)]
async fn symlink(target: &Path, link: &Path) -> Result<()> {
    fs::symlink(target, link)
        .await
        .with_context(|| format!("unable to create symlink: {}", link.display()))
}

#[cfg(windows)]
async fn symlink(target: &Path, link: &Path) -> Result<()> {
    fs::symlink_file(target, link)
        .await
        .with_context(|| format!("unable to create symlink: {}", link.display()))
}

/// Total size in bytes of all regular files under `dir`.
pub async fn dir_size(dir: impl AsRef<Path>) -> Result<u64> {
    let mut pending: Vec<PathBuf> = vec![dir.as_ref().to_path_buf()];
    let mut total = 0;

    while let Some(dir) = pending.pop() {
        let mut entries = fs::read_dir(&dir)
            .await
            .with_context(|| format!("unable to read directory: {}", dir.display()))?;

        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                total += entry.metadata().await?.len();
            }
        }
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    use super::*;

    #[tokio::test]
    async fn test_reset_dir_clears_contents() {
        let parent = tempdir().unwrap();
        let dir = parent.path().join("work");

        fs::create_dir(&dir).await.unwrap();
        fs::write(dir.join("stale.txt"), "stale").await.unwrap();

        reset_dir(&dir).await.unwrap();

        assert!(exists(&dir).await.unwrap());
        assert!(!exists(dir.join("stale.txt")).await.unwrap());
    }

    #[tokio::test]
    async fn test_reset_dir_creates_missing() {
        let parent = tempdir().unwrap();
        let dir = parent.path().join("fresh");

        reset_dir(&dir).await.unwrap();

        assert!(exists(&dir).await.unwrap());
    }

    #[tokio::test]
    async fn test_copy_dir_nested() {
        let parent = tempdir().unwrap();
        let src = parent.path().join("src");
        let dst = parent.path().join("dst");

        fs::create_dir_all(src.join("a/b")).await.unwrap();
        fs::write(src.join("top.txt"), "top").await.unwrap();
        fs::write(src.join("a/b/deep.txt"), "deep").await.unwrap();

        copy_dir(&src, &dst).await.unwrap();

        assert_eq!(fs::read_to_string(dst.join("top.txt")).await.unwrap(), "top");
        assert_eq!(
            fs::read_to_string(dst.join("a/b/deep.txt")).await.unwrap(),
            "deep"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_copy_dir_preserves_symlinks() {
        let parent = tempdir().unwrap();
        let src = parent.path().join("src");
        let dst = parent.path().join("dst");

        fs::create_dir_all(&src).await.unwrap();
        fs::write(src.join("real.txt"), "real").await.unwrap();
        fs::symlink("real.txt", src.join("link.txt")).await.unwrap();

        copy_dir(&src, &dst).await.unwrap();

        let meta = fs::symlink_metadata(dst.join("link.txt")).await.unwrap();
        assert!(meta.file_type().is_symlink());
        assert_eq!(
            fs::read_to_string(dst.join("link.txt")).await.unwrap(),
            "real"
        );
    }

    #[tokio::test]
    async fn test_dir_size_sums_files() {
        let parent = tempdir().unwrap();
        fs::create_dir_all(parent.path().join("sub")).await.unwrap();
        fs::write(parent.path().join("a.bin"), vec![0u8; 10])
            .await
            .unwrap();
        fs::write(parent.path().join("sub/b.bin"), vec![0u8; 32])
            .await
            .unwrap();

        assert_eq!(dir_size(parent.path()).await.unwrap(), 42);
    }
}
