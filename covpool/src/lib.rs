// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#[macro_use]
extern crate anyhow;

#[macro_use]
extern crate log;

pub mod fs;
pub mod pkg;
pub mod process;
pub mod tag;
pub mod trace;
