use std::borrow::Cow;

use crate::ConstructionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryFormat {
    Elf,
    MachO,
}

impl BinaryFormat {
    /// Apply target name-decoration rules to a source-level name, producing
    /// the linker-level name symbols are registered under.
    pub fn mangle<'a>(&self, name: &'a str) -> Cow<'a, str> {
        match self {
            BinaryFormat::Elf => Cow::Borrowed(name),
            BinaryFormat::MachO => Cow::Owned(format!("_{}", name)),
        }
    }
}

/// Description of the execution target, handed in by the front end.
/// The manager only consumes the binary format (for mangling) and logs the
/// feature set; code generation for the triple happened upstream.
#[derive(Debug, Clone)]
pub struct TargetDescription {
    triple: String,
    features: Vec<String>,
}

impl TargetDescription {
    pub fn new(triple: &str) -> Self {
        Self {
            triple: triple.to_string(),
            features: vec![],
        }
    }

    /// Target description for the process we are running in.
    pub fn host() -> Self {
        use std::env::consts::{ARCH, OS};
        let triple = match OS {
            "macos" => format!("{}-apple-darwin", ARCH),
            "windows" => format!("{}-pc-windows-msvc", ARCH),
            os => format!("{}-unknown-{}-gnu", ARCH, os),
        };
        Self::new(&triple)
    }

    pub fn with_features<I, S>(mut self, features: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.features = features.into_iter().map(Into::into).collect();
        self
    }

    pub fn triple(&self) -> &str {
        &self.triple
    }

    pub fn features(&self) -> &[String] {
        &self.features
    }

    pub fn format(&self) -> Result<BinaryFormat, ConstructionError> {
        if self.triple.contains("windows") {
            return Err(ConstructionError::UnsupportedTarget(self.triple.clone()));
        }
        if self.triple.contains("apple") || self.triple.contains("darwin") {
            Ok(BinaryFormat::MachO)
        } else {
            Ok(BinaryFormat::Elf)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_from_triple() {
        let t = TargetDescription::new("x86_64-unknown-linux-gnu");
        assert_eq!(t.format().unwrap(), BinaryFormat::Elf);

        let t = TargetDescription::new("aarch64-apple-darwin");
        assert_eq!(t.format().unwrap(), BinaryFormat::MachO);

        let t = TargetDescription::new("x86_64-pc-windows-msvc");
        assert!(t.format().is_err());
    }

    #[test]
    fn mangling() {
        assert_eq!(BinaryFormat::Elf.mangle("foo"), "foo");
        assert_eq!(BinaryFormat::MachO.mangle("foo"), "_foo");
    }

    #[test]
    fn host_is_supported() {
        // windows hosts are not supported, everything we run tests on is
        let t = TargetDescription::host();
        assert!(t.format().is_ok());
    }
}
