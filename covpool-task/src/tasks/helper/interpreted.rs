// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use anyhow::Result;
use async_trait::async_trait;
use covpool::pkg::PackageId;
use std::path::{Path, PathBuf};

use crate::tasks::config::EffectiveConfig;
use crate::tasks::env::with_env;
use crate::tasks::report::Renderer;
use crate::tasks::trace_tools::{write_remap_config, LcovTools};

use super::{dir_prefix, vcs_env, CoverageHelper, HelperError};

const REMAP_FILE: &str = "remap.cfg";

/// Helper for interpreted projects.
///
/// Interpreted traces reference sources by their runtime location, so path
/// mapping goes through a remap configuration the reporting tools consume
/// directly; the tracefiles themselves are never rewritten. Sources always
/// come from version control.
#[derive(Debug)]
pub struct InterpretedHelper {
    config: EffectiveConfig,
    tools: LcovTools,
    renderer: Renderer,
}

impl InterpretedHelper {
    pub fn new(config: EffectiveConfig) -> Self {
        Self {
            config,
            tools: LcovTools::default(),
            renderer: Renderer::default(),
        }
    }
}

#[async_trait]
impl CoverageHelper for InterpretedHelper {
    async fn gen_report(&self, version: &str, tracefile: &Path, output_dir: &Path) -> Result<()> {
        let pkg: PackageId = version.parse()?;
        let env = Box::new(vcs_env(&self.config, &pkg)?);

        with_env(env, |tree| async move {
            let work_dir =
                tree.ok_or_else(|| format_err!("source checkout produced no work tree"))?;

            let remap = work_dir.join(REMAP_FILE);
            write_remap_config(
                &remap,
                &[(self.config.trace_prefix.clone(), dir_prefix(&work_dir))],
            )
            .await?;

            self.renderer
                .render(tracefile, output_dir, true, Some(&remap))
                .await
        })
        .await
    }

    async fn merge_tracefiles(
        &self,
        version: &str,
        inputs: &[PathBuf],
        output: &Path,
    ) -> Result<()> {
        let _pkg: PackageId = version.parse()?;

        let remap = match output.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => {
                let path = parent.join(REMAP_FILE);
                write_remap_config(
                    &path,
                    &[(
                        self.config.trace_prefix.clone(),
                        dir_prefix(&self.config.build_root),
                    )],
                )
                .await?;
                Some(path)
            }
            _ => None,
        };

        self.tools.merge(inputs, output, remap.as_deref()).await
    }

    async fn convert_tracefile(
        &self,
        _src_version: &str,
        _tgt_version: &str,
        _tracefile: &Path,
        _output: &Path,
    ) -> Result<()> {
        Err(HelperError::UnsupportedOperation {
            project_type: self.config.project_type.clone(),
            op: "convert_tracefile",
        }
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::config::test_global;

    #[cfg(unix)]
    fn stub_tool(dir: &Path, name: &str, script: &str) -> String {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join(name);
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_merge_feeds_remap_config_to_the_tool() {
        let dir = tempfile::tempdir().unwrap();
        let args_file = dir.path().join("args.txt");
        let script = format!("#!/bin/sh\nprintf '%s\\n' \"$@\" > {}\n", args_file.display());

        let config = EffectiveConfig::new(&test_global(dir.path()), None);
        let helper = InterpretedHelper {
            config,
            tools: LcovTools::new(stub_tool(dir.path(), "lcov", &script)),
            renderer: Renderer::default(),
        };

        let input = dir.path().join("a.info");
        std::fs::write(&input, "TN:\nSF:/usr/coverage/mod.py\nend_of_record\n").unwrap();
        let output = dir.path().join("merged.info");

        helper
            .merge_tracefiles("libvirt-python-4.5.0-1.el7.noarch", &[input], &output)
            .await
            .unwrap();

        // The remap config exists, carries the prefix mapping, and was
        // handed to the merge invocation.
        let remap = dir.path().join(REMAP_FILE);
        let text = std::fs::read_to_string(&remap).unwrap();
        assert!(
            text.contains("/usr/coverage/ => /mnt/coverage/"),
            "{}",
            text
        );

        let args = std::fs::read_to_string(&args_file).unwrap();
        let args: Vec<&str> = args.lines().collect();
        assert!(args.contains(&"--config-file"), "{:?}", args);
        assert!(
            args.contains(&remap.to_string_lossy().as_ref()),
            "{:?}",
            args
        );
    }

    #[tokio::test]
    async fn test_convert_is_unsupported_and_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let global = test_global(dir.path());
        let config = EffectiveConfig::new(&global, None);
        let helper = InterpretedHelper::new(config);

        let output = dir.path().join("converted.info");
        let err = helper
            .convert_tracefile(
                "libvirt-python-4.5.0-1.el7.noarch",
                "libvirt-python-4.6.0-1.el7.noarch",
                dir.path().join("t.info").as_path(),
                &output,
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<HelperError>(),
            Some(HelperError::UnsupportedOperation { .. })
        ));
        assert!(!output.exists());
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }
}
