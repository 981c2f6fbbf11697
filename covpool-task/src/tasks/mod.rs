// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use thiserror::Error;

pub mod config;
pub mod env;
pub mod generate;
pub mod helper;
pub mod merge_task;
pub mod publish;
pub mod report;
pub mod trace_tools;

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("version mismatch: cannot merge {0:?} with {1:?}")]
    VersionMismatch(String, String),
}
