//! The repackaging pipeline.
//!
//! [`Protector::run`] takes an APK whose classes are to be backed by native
//! code and produces `<stem>-protect.apk`:
//!
//! 1. the dex units are extracted and ordered,
//! 2. the [`Converter`] turns them into shell units,
//! 3. the application class chain is pinned to the primary unit,
//! 4. the shell classes are packed into output units, with a registration call
//!    threaded through every native-backed class,
//! 5. a bridge class loading the native library is added to the primary unit,
//! 6. the archive is rebuilt from the new units, the native libraries and the
//!    untouched original entries.

pub mod abi;
pub mod assemble;
pub mod bridge;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod inject;
pub mod main_chain;
pub mod pool;
pub mod units;

use std::fs;
use std::path::PathBuf;

use log::info;

use crate::android::{ApkReader, ManifestInfo};
use crate::dex::clinit::{ClinitRewriter, PrependRegistrationCall};
use crate::dex::RefCounts;

pub use abi::{select_abis, AbiSet};
pub use assemble::{assemble_archive, ArchivePlan};
pub use collaborators::{ConversionContext, Converter, NativeLibBuilder, NativeLibs, PrebuiltNativeLibs};
pub use config::{CeilingMode, GlobalConfig, ProtectConfig, UnitConfig, Workspace};
pub use error::{BoxError, Diagnostic, DiagnosticSink, Diagnostics, LogSink, Outcome, ProtectError, Severity};
pub use inject::{DexPoolInjector, FlushedUnit};
pub use main_chain::{resolve_main_chain, MainChain, MainClassSet};
pub use units::{order_units, BinaryUnit, ClassIndex};

/// Oldest dex version written.
const MIN_OUTPUT_VERSION: u32 = 35;

/// Summary of a finished run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectReport {
    pub output_apk: PathBuf,
    /// `(entry name, id table sizes)` of every written dex unit, primary first.
    pub units: Vec<(String, RefCounts)>,
    pub abis: AbiSet,
    /// Descriptors pinned to the primary unit.
    pub main_chain: Vec<String>,
    pub min_sdk: u32,
    pub application_class: Option<String>,
}

/// A configured pipeline. Built through [`Protector::builder`].
pub struct Protector {
    config: ProtectConfig,
    workspace: Workspace,
    converter: Box<dyn Converter>,
    native_libs: Box<dyn NativeLibBuilder>,
    rewriter: Box<dyn ClinitRewriter>,
    sink: Option<Box<dyn DiagnosticSink>>,
}

impl Protector {
    pub fn builder(config: ProtectConfig, workspace: Workspace) -> ProtectorBuilder {
        ProtectorBuilder {
            config,
            workspace,
            converter: None,
            native_libs: None,
            rewriter: None,
            sink: None,
        }
    }

    pub fn config(&self) -> &ProtectConfig {
        &self.config
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    /// Run the whole pipeline. The extraction directory is removed on every
    /// exit path; `dex_output/` is kept.
    pub fn run(&mut self) -> Result<Outcome<ProtectReport>, ProtectError> {
        let mut diags = Diagnostics::new(self.sink.as_deref());
        let input = self.workspace.input_apk().to_path_buf();
        info!("protecting {}", input.display());

        let mut apk = ApkReader::open(&input).map_err(ProtectError::InputArchive)?;
        let manifest = apk
            .read_entry(assemble::ANDROID_MANIFEST)
            .map_err(ProtectError::InputArchive)?;
        if manifest.is_none() {
            diags.degrade(Severity::Warning, ProtectError::NotAPackage(input.clone()))?;
        }

        let extraction = self.workspace.extraction_dir()?;
        let units = match order_units(&mut apk, &input, extraction.path()) {
            Ok(units) => units,
            Err(err @ ProtectError::NoBinaryUnits(_)) => {
                diags.degrade(Severity::Warning, err)?;
                Vec::new()
            }
            Err(err) => return Err(err),
        };

        let info = manifest.as_deref().map(ManifestInfo::from_bytes).transpose()?;
        let min_sdk = info
            .as_ref()
            .and_then(|i| i.min_sdk)
            .unwrap_or(self.config.default_min_sdk);
        let application_class = self
            .config
            .application_class
            .clone()
            .or_else(|| info.as_ref().and_then(|i| i.application_class.clone()));
        info!(
            "min sdk {}, application class {}",
            min_sdk,
            application_class.as_deref().unwrap_or("<none>")
        );

        let abis = select_abis(apk.entry_names().iter().map(String::as_str), &self.config.default_abis);
        let mut plan = ArchivePlan {
            manifest: manifest.as_deref(),
            ..Default::default()
        };
        let mut report_units = Vec::new();
        let mut main_chain = Vec::new();

        if !units.is_empty() {
            let sources_dir = self.workspace.dex2c_src_dir();
            let generated_dir = self.workspace.code_generated_dir();
            fs::create_dir_all(&generated_dir)?;
            let ctx = ConversionContext {
                units: &units,
                min_sdk,
                sources_dir: &sources_dir,
                generated_dir: &generated_dir,
            };
            let global = self
                .converter
                .convert(&ctx)
                .map_err(|source| ProtectError::Collaborator { stage: "conversion", source })?;
            let holder = global.validate(units.len())?;

            let chain = match &application_class {
                Some(app) => resolve_main_chain(&ClassIndex::build(&units), app),
                None => MainChain::default(),
            };
            if let Some(missing) = &chain.missing {
                diags.record(Diagnostic::warning(
                    ProtectError::MissingMainChainClass(missing.clone()).to_string(),
                ));
            }
            main_chain = chain.classes.to_vec();

            let version = units
                .iter()
                .map(|u| u.version)
                .max()
                .unwrap_or(MIN_OUTPUT_VERSION)
                .max(MIN_OUTPUT_VERSION);
            let out_dir = self.workspace.dex_output_dir();
            let mut flushed = DexPoolInjector::new(
                self.rewriter.as_ref(),
                self.config.max_pool_refs,
                self.config.ceiling_mode,
                &out_dir,
                version,
            )
            .run(&global, &holder, &chain.classes, &mut diags)?;

            let libs = self
                .native_libs
                .build(self.workspace.out_root(), &abis)
                .map_err(|source| ProtectError::Collaborator { stage: "native library build", source })?;
            plan.native_libs = libs
                .entries()
                .map_err(|source| ProtectError::Collaborator { stage: "native library build", source })?;

            let primary = bridge::synthesize_bridge(&flushed[0], &global, &holder, &self.config.lib_name, &out_dir)?;
            flushed[0] = primary;

            for unit in &flushed {
                plan.units.push((unit.entry_name.clone(), unit.path.clone()));
                report_units.push((unit.entry_name.clone(), unit.counts));
            }
        }

        let output_apk = self.workspace.output_apk();
        assemble_archive(&mut apk, &plan, &output_apk)?;
        drop(extraction);

        let report = ProtectReport {
            output_apk,
            units: report_units,
            abis,
            main_chain,
            min_sdk,
            application_class,
        };
        Ok(diags.finish(report))
    }
}

/// Collects the collaborators of a [`Protector`]; `build` checks that the
/// required ones are present and that the configuration is valid.
pub struct ProtectorBuilder {
    config: ProtectConfig,
    workspace: Workspace,
    converter: Option<Box<dyn Converter>>,
    native_libs: Option<Box<dyn NativeLibBuilder>>,
    rewriter: Option<Box<dyn ClinitRewriter>>,
    sink: Option<Box<dyn DiagnosticSink>>,
}

impl ProtectorBuilder {
    pub fn converter(mut self, converter: impl Converter + 'static) -> Self {
        self.converter = Some(Box::new(converter));
        self
    }

    pub fn native_lib_builder(mut self, builder: impl NativeLibBuilder + 'static) -> Self {
        self.native_libs = Some(Box::new(builder));
        self
    }

    /// Replaces [`PrependRegistrationCall`].
    pub fn clinit_rewriter(mut self, rewriter: impl ClinitRewriter + 'static) -> Self {
        self.rewriter = Some(Box::new(rewriter));
        self
    }

    /// Enables best-effort mode.
    pub fn diagnostic_sink(mut self, sink: impl DiagnosticSink + 'static) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }

    pub fn build(self) -> Result<Protector, ProtectError> {
        self.config.validate()?;
        let converter = self
            .converter
            .ok_or_else(|| ProtectError::InvalidConfig("no converter registered".to_string()))?;
        let native_libs = self
            .native_libs
            .ok_or_else(|| ProtectError::InvalidConfig("no native library builder registered".to_string()))?;
        Ok(Protector {
            config: self.config,
            workspace: self.workspace,
            converter,
            native_libs,
            rewriter: self.rewriter.unwrap_or_else(|| Box::new(PrependRegistrationCall)),
            sink: self.sink,
        })
    }
}
