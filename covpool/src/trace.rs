// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::fs;

/// Marker prefix of trace lines that carry a source file path.
pub const SOURCE_FILE_MARKER: &str = "SF:";

/// Rewrite source-path prefixes embedded in a trace file, in place.
///
/// Only lines carrying the `SF:` marker are candidates; all other lines are
/// opaque and pass through unmodified. When `rewrite_all` is false, the scan
/// stops as soon as a marker line already contains `new`: the file was
/// rewritten by an earlier run and is left untouched. The file is read whole
/// and overwritten in a single write.
pub async fn rewrite(path: &Path, old: &str, new: &str, rewrite_all: bool) -> Result<()> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("unable to read trace file: {}", path.display()))?;

    let mut lines: Vec<String> = Vec::new();
    let mut changed = false;

    for line in text.split_inclusive('\n') {
        if line.contains(SOURCE_FILE_MARKER) {
            if line.contains(old) {
                lines.push(line.replace(old, new));
                changed = true;
                continue;
            }
            if line.contains(new) && !rewrite_all {
                debug!("trace already rewritten, leaving as-is: {}", path.display());
                return Ok(());
            }
        }
        lines.push(line.to_string());
    }

    if changed {
        fs::write(path, lines.concat())
            .await
            .with_context(|| format!("unable to write trace file: {}", path.display()))?;
    }

    Ok(())
}

/// Non-destructive `rewrite`: copies the trace to a private temporary file
/// and rewrites the copy, leaving the original byte-identical.
///
/// Used whenever the trace belongs to a persisted record. The caller owns
/// the returned path and is responsible for deleting it.
pub async fn rewrite_to_copy(
    path: &Path,
    old: &str,
    new: &str,
    rewrite_all: bool,
) -> Result<PathBuf> {
    let copy = tempfile::Builder::new()
        .prefix("trace-")
        .suffix(".info")
        .tempfile()
        .context("unable to create trace copy")?
        .into_temp_path()
        .keep()
        .context("unable to persist trace copy")?;

    fs::copy(path, &copy)
        .await
        .with_context(|| format!("unable to copy trace file: {}", path.display()))?;

    rewrite(&copy, old, new, rewrite_all).await?;

    Ok(copy)
}

/// List the source file paths referenced by a trace file, in order.
pub async fn source_files(path: &Path) -> Result<Vec<String>> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("unable to read trace file: {}", path.display()))?;

    let files = text
        .lines()
        .filter_map(|line| line.strip_prefix(SOURCE_FILE_MARKER))
        .map(|p| p.trim().to_string())
        .collect();

    Ok(files)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    use super::*;

    const TRACE: &str = "TN:\n\
        SF:/usr/coverage/BUILD/libvirt-4.5.0/src/util/virfile.c\n\
        DA:10,1\n\
        DA:11,0\n\
        end_of_record\n\
        SF:/usr/coverage/BUILD/libvirt-4.5.0/src/qemu/qemu_driver.c\n\
        DA:7,3\n\
        end_of_record\n";

    async fn write_trace(dir: &Path, content: &str) -> PathBuf {
        let path = dir.join("sample.info");
        fs::write(&path, content).await.unwrap();
        path
    }

    #[tokio::test]
    async fn test_rewrite_replaces_every_marker_line() {
        let dir = tempdir().unwrap();
        let path = write_trace(dir.path(), TRACE).await;

        rewrite(&path, "/usr/coverage/", "/mnt/coverage/", true)
            .await
            .unwrap();

        let text = fs::read_to_string(&path).await.unwrap();
        assert!(!text.contains("/usr/coverage/"));

        // Marker line count is unchanged, as is everything else.
        let sf = |t: &str| t.lines().filter(|l| l.starts_with(SOURCE_FILE_MARKER)).count();
        assert_eq!(sf(&text), sf(TRACE));
        assert!(text.contains("DA:11,0"));
        assert!(text.contains("SF:/mnt/coverage/BUILD/libvirt-4.5.0/src/util/virfile.c"));
    }

    #[tokio::test]
    async fn test_rewrite_stops_early_when_already_rewritten() {
        let dir = tempdir().unwrap();
        let rewritten = TRACE.replace("/usr/coverage/", "/mnt/coverage/");
        let path = write_trace(dir.path(), &rewritten).await;

        rewrite(&path, "/usr/coverage/", "/mnt/coverage/", false)
            .await
            .unwrap();

        let text = fs::read_to_string(&path).await.unwrap();
        assert_eq!(text, rewritten);
    }

    #[tokio::test]
    async fn test_rewrite_mixed_prefixes_with_rewrite_all() {
        let dir = tempdir().unwrap();
        // First record rewritten, second still carrying the old prefix.
        let mixed = TRACE.replacen("/usr/coverage/", "/mnt/coverage/", 1);
        let path = write_trace(dir.path(), &mixed).await;

        rewrite(&path, "/usr/coverage/", "/mnt/coverage/", true)
            .await
            .unwrap();

        let text = fs::read_to_string(&path).await.unwrap();
        assert!(!text.contains("/usr/coverage/"));
    }

    #[tokio::test]
    async fn test_rewrite_to_copy_leaves_original_untouched() {
        let dir = tempdir().unwrap();
        let path = write_trace(dir.path(), TRACE).await;

        let copy = rewrite_to_copy(&path, "/usr/coverage/", "/mnt/coverage/", true)
            .await
            .unwrap();

        let original = fs::read(&path).await.unwrap();
        assert_eq!(original, TRACE.as_bytes());

        let copied = fs::read_to_string(&copy).await.unwrap();
        assert!(!copied.contains("/usr/coverage/"));

        fs::remove_file(&copy).await.unwrap();
    }

    #[tokio::test]
    async fn test_source_files_lists_marker_paths_in_order() {
        let dir = tempdir().unwrap();
        let path = write_trace(dir.path(), TRACE).await;

        let files = source_files(&path).await.unwrap();
        assert_eq!(files.len(), 2);
        assert!(files[0].ends_with("virfile.c"));
        assert!(files[1].ends_with("qemu_driver.c"));
    }
}
