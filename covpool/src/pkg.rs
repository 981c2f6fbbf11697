// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::process::run_cmd;

const OS_RELEASE: &str = "/etc/os-release";

#[derive(Debug, Error)]
pub enum PkgError {
    #[error("malformed package identifier: {0:?}")]
    MalformedIdentifier(String),

    #[error("package query failed: {0}")]
    QueryFailed(String),

    #[error("unsupported distro: {0:?}")]
    UnsupportedDistro(String),
}

/// A fully qualified package identifier, `<name>-<version>-<release>.<arch>`.
///
/// `release` may itself contain dots (`1.el7`); `arch` may not. `name` may
/// contain dashes; `version` and `release` may not.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct PackageId {
    pub name: String,
    pub version: String,
    pub release: String,
    pub arch: String,
}

impl FromStr for PackageId {
    type Err = PkgError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || PkgError::MalformedIdentifier(s.to_string());

        let (nvr, arch) = s.rsplit_once('.').ok_or_else(malformed)?;
        let (nv, release) = nvr.rsplit_once('-').ok_or_else(malformed)?;
        let (name, version) = nv.rsplit_once('-').ok_or_else(malformed)?;

        if name.is_empty() || version.is_empty() || release.is_empty() || arch.is_empty() {
            return Err(malformed());
        }

        if arch.contains('-') {
            return Err(malformed());
        }

        Ok(Self {
            name: name.to_string(),
            version: version.to_string(),
            release: release.to_string(),
            arch: arch.to_string(),
        })
    }
}

impl fmt::Display for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}.{}",
            self.name, self.version, self.release, self.arch
        )
    }
}

impl PackageId {
    /// The `name-version-release` form accepted by package installers.
    pub fn base_id(&self) -> String {
        format!("{}-{}-{}", self.name, self.version, self.release)
    }
}

/// Query the local package database for the installed version of `name`.
///
/// Returns the full identifier string of the installed package.
pub async fn installed_version(name: &str) -> Result<String, PkgError> {
    let argv = vec!["-q".to_string(), name.to_string()];
    match run_cmd("rpm", &argv).await {
        Ok(output) => Ok(output.stdout.trim().to_string()),
        Err(err) => Err(PkgError::QueryFailed(format!("{:#}", err))),
    }
}

/// Short distro tag for the running host, e.g. `el7` or `fc38`.
pub fn distro_tag() -> Result<String, PkgError> {
    let text = std::fs::read_to_string(OS_RELEASE)
        .map_err(|err| PkgError::UnsupportedDistro(format!("{}: {}", OS_RELEASE, err)))?;
    distro_tag_from(&text)
}

fn distro_tag_from(os_release: &str) -> Result<String, PkgError> {
    let mut id = None;
    let mut version_id = None;

    for line in os_release.lines() {
        if let Some(value) = line.strip_prefix("ID=") {
            id = Some(value.trim_matches('"').to_string());
        } else if let Some(value) = line.strip_prefix("VERSION_ID=") {
            version_id = Some(value.trim_matches('"').to_string());
        }
    }

    let id = id.ok_or_else(|| PkgError::UnsupportedDistro("missing ID".to_string()))?;
    let version_id =
        version_id.ok_or_else(|| PkgError::UnsupportedDistro("missing VERSION_ID".to_string()))?;
    let major = version_id.split('.').next().unwrap_or(&version_id);

    match id.as_str() {
        "rhel" | "centos" | "rocky" | "almalinux" => Ok(format!("el{}", major)),
        "fedora" => Ok(format!("fc{}", major)),
        other => Err(PkgError::UnsupportedDistro(other.to_string())),
    }
}
