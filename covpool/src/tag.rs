// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use strum::IntoEnumIterator;
use strum_macros::EnumIter;

use crate::pkg::PackageId;

#[derive(Clone, Copy, Debug, EnumIter, Eq, Hash, PartialEq)]
pub enum PlaceHolder {
    Name,
    Version,
    Release,
    Arch,
}

impl PlaceHolder {
    pub fn get_string(&self) -> &'static str {
        match self {
            Self::Name => "{name}",
            Self::Version => "{version}",
            Self::Release => "{release}",
            Self::Arch => "{arch}",
        }
    }
}

/// Expands a version-control tag template from a package identifier.
///
/// When an instrumentation suffix is configured, it is stripped from the
/// release field before formatting, so the same tag resolves whether or not
/// the traced binary was built instrumented.
pub struct TagFormat<'a> {
    template: &'a str,
    instrumentation_suffix: Option<&'a str>,
}

impl<'a> TagFormat<'a> {
    pub fn new(template: &'a str) -> Self {
        Self {
            template,
            instrumentation_suffix: None,
        }
    }

    pub fn instrumentation_suffix(mut self, suffix: &'a str) -> Self {
        self.instrumentation_suffix = Some(suffix);
        self
    }

    pub fn evaluate(&self, id: &PackageId) -> String {
        let release = match self.instrumentation_suffix {
            Some(suffix) => id.release.strip_suffix(suffix).unwrap_or(&id.release),
            None => id.release.as_str(),
        };

        let mut tag = self.template.to_string();
        for placeholder in PlaceHolder::iter() {
            let value = match placeholder {
                PlaceHolder::Name => id.name.as_str(),
                PlaceHolder::Version => id.version.as_str(),
                PlaceHolder::Release => release,
                PlaceHolder::Arch => id.arch.as_str(),
            };
            tag = tag.replace(placeholder.get_string(), value);
        }
        tag
    }
}
