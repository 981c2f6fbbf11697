// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Source acquisition strategies.
//!
//! Each strategy resolves the exact source/build tree a trace was generated
//! against. Strategies are independent: a retried acquisition starts over
//! from scratch, and `release` is safe to call after a partial `acquire`.

use anyhow::Result;
use async_trait::async_trait;
use covpool::pkg::PackageId;
use std::future::Future;
use std::path::PathBuf;
use thiserror::Error;

pub mod archive;
pub mod reinstall;
pub mod vcs;

#[derive(Debug, Error)]
pub enum EnvError {
    #[error("no acquisition strategy could resolve a source tree for {0:?}")]
    AcquisitionFailed(String),

    #[error("patch {patch:?} failed to apply: {detail}")]
    PatchApplyFailed { patch: String, detail: String },
}

#[async_trait]
pub trait SourceEnv: Send {
    /// Resolve the environment. `Some(dir)` is a source tree owned by this
    /// strategy; `None` means a fixed tool-managed build root is in use.
    async fn acquire(&mut self) -> Result<Option<PathBuf>>;

    /// Reclaim anything `acquire` created. Must be safe after a partial or
    /// failed acquire, and safe to call more than once.
    async fn release(&mut self) -> Result<()>;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Strategy {
    Reinstall,
    Archive,
    Vcs,
}

/// Pick the acquisition strategy for a requested package version.
///
/// Ordered fallback chain: an instrumented package already matching the
/// installed version is reinstalled in place; a release carrying the host's
/// distro tag has a downloadable archive; version control is the
/// unconditional default.
pub fn select_strategy(
    pkg: &PackageId,
    installed: Option<&str>,
    distro: Option<&str>,
) -> Strategy {
    if let Some(installed) = installed {
        if installed == pkg.to_string() {
            return Strategy::Reinstall;
        }
    }

    if let Some(distro) = distro {
        if pkg.release.contains(distro) {
            return Strategy::Archive;
        }
    }

    Strategy::Vcs
}

/// Scoped acquisition: acquire, run `body` on the resolved tree, release.
///
/// Release runs whether `acquire` or `body` failed; a release failure after
/// a failed body is logged but never masks the body's error.
pub async fn with_env<F, Fut, T>(mut env: Box<dyn SourceEnv>, body: F) -> Result<T>
where
    F: FnOnce(Option<PathBuf>) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let acquired = env.acquire().await;

    let result = match acquired {
        Ok(tree) => body(tree).await,
        Err(err) => Err(err),
    };

    if let Err(err) = env.release().await {
        warn!("environment release failed: {:#}", err);
        if result.is_ok() {
            return Err(err);
        }
    }

    result
}
