// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use anyhow::Result;
use async_trait::async_trait;
use covpool::pkg::PackageId;
use covpool::process::run_cmd;
use std::path::PathBuf;

use super::SourceEnv;

/// Reinstall the exact requested package from the package repository, then
/// trigger the external coverage-instrumentation rebuild hook.
///
/// Produces no source tree of its own: the rebuild hook populates a fixed,
/// tool-managed build root. Install failure is fatal and not retried.
pub struct ReinstallEnv {
    pkg: PackageId,
    companions: Vec<String>,
    rebuild_cmd: Option<Vec<String>>,
}

impl ReinstallEnv {
    pub fn new(pkg: PackageId, companions: Vec<String>, rebuild_cmd: Option<Vec<String>>) -> Self {
        Self {
            pkg,
            companions,
            rebuild_cmd,
        }
    }

    fn package_lists(&self) -> (Vec<String>, Vec<String>) {
        let mut remove = vec![self.pkg.name.clone()];
        let mut install = vec![self.pkg.base_id()];

        for companion in &self.companions {
            // A companion may be a full identifier or a bare family name.
            match companion.parse::<PackageId>() {
                Ok(id) => {
                    remove.push(id.name.clone());
                    install.push(id.base_id());
                }
                Err(_) => {
                    remove.push(companion.clone());
                    install.push(companion.clone());
                }
            }
        }

        (remove, install)
    }
}

#[async_trait]
impl SourceEnv for ReinstallEnv {
    async fn acquire(&mut self) -> Result<Option<PathBuf>> {
        let (remove, install) = self.package_lists();

        info!("reinstalling packages: {:?}", install);

        let mut argv = vec!["remove".to_string(), "-y".to_string()];
        argv.extend(remove);
        run_cmd("yum", &argv).await?;

        let mut argv = vec!["install".to_string(), "-y".to_string()];
        argv.extend(install);
        run_cmd("yum", &argv).await?;

        if let Some(rebuild) = &self.rebuild_cmd {
            if let Some((program, args)) = rebuild.split_first() {
                info!("running instrumentation rebuild hook: {:?}", rebuild);
                run_cmd(program, args).await?;
            }
        }

        Ok(None)
    }

    async fn release(&mut self) -> Result<()> {
        // Nothing to reclaim; the build root is tool-managed.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_package_lists_split_identifiers() {
        let pkg: PackageId = "libvirt-4.5.0-1.el7.x86_64".parse().unwrap();
        let env = ReinstallEnv::new(
            pkg,
            vec![
                "libvirt-client-4.5.0-1.el7.x86_64".to_string(),
                "libvirt-docs".to_string(),
            ],
            None,
        );

        let (remove, install) = env.package_lists();
        assert_eq!(remove, vec!["libvirt", "libvirt-client", "libvirt-docs"]);
        assert_eq!(
            install,
            vec![
                "libvirt-4.5.0-1.el7",
                "libvirt-client-4.5.0-1.el7",
                "libvirt-docs"
            ]
        );
    }
}
