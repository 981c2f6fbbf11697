// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#[macro_use]
extern crate anyhow;

#[macro_use]
extern crate log;

pub mod catalog;
pub mod notify;
pub mod tasks;
