//! # Dexvault
//!
//! Repackages an Android application so that selected classes are backed by
//! native code.
//!
//! The crate reads the `classesN.dex` units of an APK, hands them to a
//! conversion stage that stubs out native-backed methods, repacks the shell
//! classes into units that respect the dex reference limits, threads a native
//! registration call through every affected static initializer, adds a bridge
//! class that loads the native library and writes a new APK.
//!
//! ```no_run
//! use dexvault::protect::{LogSink, PrebuiltNativeLibs, ProtectConfig, Protector, Workspace};
//! # use dexvault::protect::{BoxError, ConversionContext, Converter, GlobalConfig};
//! # struct MyConverter;
//! # impl Converter for MyConverter {
//! #     fn convert(&mut self, _: &ConversionContext<'_>) -> Result<GlobalConfig, BoxError> { unimplemented!() }
//! # }
//!
//! let config = ProtectConfig::default();
//! let workspace = Workspace::new("app.apk", "out");
//! let mut protector = Protector::builder(config, workspace)
//!     .converter(MyConverter)
//!     .native_lib_builder(PrebuiltNativeLibs::new("prebuilt"))
//!     .diagnostic_sink(LogSink)
//!     .build()
//!     .unwrap();
//! let outcome = protector.run().unwrap();
//! println!("wrote {}", outcome.value.output_apk.display());
//! ```

pub mod android;
pub mod dex;
pub mod protect;

#[cfg(test)]
mod tests;
