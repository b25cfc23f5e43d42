//! Seams for the stages that run outside this crate: bytecode-to-native
//! conversion and native library compilation.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::protect::abi::AbiSet;
use crate::protect::config::GlobalConfig;
use crate::protect::error::BoxError;
use crate::protect::units::BinaryUnit;

/// Input of the conversion stage.
#[derive(Debug, Clone, Copy)]
pub struct ConversionContext<'a> {
    /// Original units in order; the result must hold one config per unit.
    pub units: &'a [BinaryUnit],
    pub min_sdk: u32,
    /// Root of the generated C sources.
    pub sources_dir: &'a Path,
    /// Where C files and shell units are written.
    pub generated_dir: &'a Path,
}

/// Converts eligible methods to native code and stubs them out of the units.
pub trait Converter {
    fn convert(&mut self, ctx: &ConversionContext<'_>) -> Result<GlobalConfig, BoxError>;
}

/// Per ABI, the built library files and the file to package for each.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NativeLibs {
    by_abi: BTreeMap<String, BTreeMap<PathBuf, PathBuf>>,
}

impl NativeLibs {
    pub fn insert(&mut self, abi: &str, artifact: impl Into<PathBuf>, packaged: impl Into<PathBuf>) {
        self.by_abi
            .entry(abi.to_string())
            .or_default()
            .insert(artifact.into(), packaged.into());
    }

    pub fn is_empty(&self) -> bool {
        self.by_abi.values().all(BTreeMap::is_empty)
    }

    /// `(lib/<abi>/<file name>, packaged file)` for every library.
    pub fn entries(&self) -> Result<Vec<(String, PathBuf)>, BoxError> {
        let mut entries = Vec::new();
        for (abi, files) in &self.by_abi {
            for packaged in files.values() {
                let name = packaged
                    .file_name()
                    .and_then(|n| n.to_str())
                    .ok_or_else(|| format!("{} has no usable file name", packaged.display()))?;
                entries.push((format!("lib/{abi}/{name}"), packaged.clone()));
            }
        }
        Ok(entries)
    }
}

/// Builds the native library for a set of ABIs.
pub trait NativeLibBuilder {
    fn build(&self, out_root: &Path, abis: &AbiSet) -> Result<NativeLibs, BoxError>;
}

/// Libraries built ahead of time and laid out as `<root>/<abi>/*.so`.
#[derive(Debug, Clone)]
pub struct PrebuiltNativeLibs {
    root: PathBuf,
}

impl PrebuiltNativeLibs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        PrebuiltNativeLibs { root: root.into() }
    }
}

impl NativeLibBuilder for PrebuiltNativeLibs {
    fn build(&self, _out_root: &Path, abis: &AbiSet) -> Result<NativeLibs, BoxError> {
        let mut libs = NativeLibs::default();
        for abi in abis.iter() {
            let dir = self.root.join(abi);
            let mut found: Vec<PathBuf> = fs::read_dir(&dir)
                .map_err(|e| format!("no prebuilt libraries for {abi} in {}: {e}", dir.display()))?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "so"))
                .collect();
            if found.is_empty() {
                return Err(format!("no prebuilt libraries for {abi} in {}", dir.display()).into());
            }
            found.sort();
            for lib in found {
                libs.insert(abi, lib.clone(), lib);
            }
        }
        Ok(libs)
    }
}
