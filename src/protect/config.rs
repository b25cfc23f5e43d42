//! Run configuration, per-unit conversion results and the folder layout.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::TempDir;

use crate::dex::model::class_name_to_descriptor;
use crate::dex::{RefCounts, MAX_TABLE_ENTRIES};
use crate::protect::error::ProtectError;

/// How a pool's size is measured against the ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CeilingMode {
    /// Methods, fields and types summed.
    #[default]
    Combined,
    /// The largest of the method, field and type tables.
    PerSection,
}

impl CeilingMode {
    pub fn measure(self, counts: &RefCounts) -> u32 {
        match self {
            CeilingMode::Combined => counts.total(),
            CeilingMode::PerSection => counts.largest_section(),
        }
    }
}

/// Settings for one protection run, usually read from a TOML file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtectConfig {
    /// Native library loaded by the bridge class, without `lib` prefix or `.so` suffix.
    pub lib_name: String,

    /// Packing ceiling per output unit.
    pub max_pool_refs: u32,

    pub ceiling_mode: CeilingMode,

    /// ABIs to build when the input ships no native code of its own.
    pub default_abis: Vec<String>,

    /// Overrides the manifest's application class.
    pub application_class: Option<String>,

    /// Used when the manifest does not declare `minSdkVersion`.
    pub default_min_sdk: u32,
}

impl Default for ProtectConfig {
    fn default() -> Self {
        ProtectConfig {
            lib_name: "dexvault".to_string(),
            max_pool_refs: 60000,
            ceiling_mode: CeilingMode::Combined,
            default_abis: vec!["armeabi-v7a".to_string(), "arm64-v8a".to_string()],
            application_class: None,
            default_min_sdk: 21,
        }
    }
}

impl ProtectConfig {
    pub fn load(path: &Path) -> Result<Self, ProtectError> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml_str(&contents).map_err(|e| match e {
            ProtectError::InvalidConfig(msg) => {
                ProtectError::InvalidConfig(format!("{}: {}", path.display(), msg))
            }
            other => other,
        })
    }

    /// Parse and validate.
    pub fn from_toml_str(contents: &str) -> Result<Self, ProtectError> {
        let config: ProtectConfig =
            toml::from_str(contents).map_err(|e| ProtectError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ProtectError> {
        toml::to_string_pretty(self).map_err(|e| ProtectError::InvalidConfig(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ProtectError> {
        let lib_ok = !self.lib_name.is_empty()
            && self
                .lib_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
        if !lib_ok {
            return Err(ProtectError::InvalidConfig(format!(
                "lib_name {:?} is not a valid library name",
                self.lib_name
            )));
        }
        if self.max_pool_refs == 0 || self.max_pool_refs > MAX_TABLE_ENTRIES {
            return Err(ProtectError::InvalidConfig(format!(
                "max_pool_refs must be in 1..={}, got {}",
                MAX_TABLE_ENTRIES, self.max_pool_refs
            )));
        }
        if let Some(abi) = self
            .default_abis
            .iter()
            .find(|abi| abi.is_empty() || abi.contains('/'))
        {
            return Err(ProtectError::InvalidConfig(format!("invalid ABI name {abi:?}")));
        }
        if self.default_min_sdk == 0 {
            return Err(ProtectError::InvalidConfig(
                "default_min_sdk must be positive".to_string(),
            ));
        }
        if matches!(&self.application_class, Some(name) if name.trim().is_empty()) {
            return Err(ProtectError::InvalidConfig(
                "application_class must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// What the conversion stage produced for one original unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitConfig {
    /// Dex file holding the unit's classes with native-backed bodies stubbed out.
    pub shell_unit: PathBuf,
    /// Static `(I)V` method registering the unit's natives for one class.
    pub register_method: String,
    /// Class holding every unit's registration method.
    pub register_class: String,
    /// Classes whose static initializer must register natives, by descriptor.
    /// The position in this list is the index passed to the registration method.
    pub native_classes: Vec<String>,
}

impl UnitConfig {
    pub fn new(
        shell_unit: impl Into<PathBuf>,
        register_method: &str,
        register_class: &str,
        native_classes: Vec<String>,
    ) -> Self {
        UnitConfig {
            shell_unit: shell_unit.into(),
            register_method: register_method.to_string(),
            register_class: register_class.to_string(),
            native_classes: native_classes.iter().map(|c| class_name_to_descriptor(c)).collect(),
        }
    }

    pub fn holder_descriptor(&self) -> String {
        class_name_to_descriptor(&self.register_class)
    }

    /// Index of `descriptor` in [`UnitConfig::native_classes`].
    pub fn native_index(&self, descriptor: &str) -> Option<u32> {
        self.native_classes
            .iter()
            .position(|c| c == descriptor)
            .map(|i| i as u32)
    }
}

/// Index-aligned with the ordered original units; never reordered.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GlobalConfig {
    configs: Vec<UnitConfig>,
}

impl GlobalConfig {
    pub fn new(configs: Vec<UnitConfig>) -> Self {
        GlobalConfig { configs }
    }

    pub fn configs(&self) -> &[UnitConfig] {
        &self.configs
    }

    pub fn len(&self) -> usize {
        self.configs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }

    /// Check the converter's result against the `units` it was given and
    /// return the single registration holder descriptor.
    pub fn validate(&self, units: usize) -> Result<String, ProtectError> {
        if self.configs.len() != units {
            return Err(ProtectError::InvalidConfig(format!(
                "converter returned {} unit configs for {} units",
                self.configs.len(),
                units
            )));
        }
        let Some(first) = self.configs.first() else {
            return Err(ProtectError::InvalidConfig("converter returned no unit configs".to_string()));
        };
        let holder = first.holder_descriptor();
        let mut methods = std::collections::HashSet::new();
        for (i, config) in self.configs.iter().enumerate() {
            if config.holder_descriptor() != holder {
                return Err(ProtectError::InvalidConfig(format!(
                    "unit {} registers through {} but unit 0 uses {}",
                    i,
                    config.holder_descriptor(),
                    holder
                )));
            }
            if config.register_method.is_empty() || !methods.insert(config.register_method.as_str()) {
                return Err(ProtectError::InvalidConfig(format!(
                    "unit {} has an empty or duplicate registration method {:?}",
                    i, config.register_method
                )));
            }
        }
        Ok(holder)
    }
}

/// Folder layout of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    input_apk: PathBuf,
    out_root: PathBuf,
}

impl Workspace {
    pub fn new(input_apk: impl Into<PathBuf>, out_root: impl Into<PathBuf>) -> Self {
        Workspace {
            input_apk: input_apk.into(),
            out_root: out_root.into(),
        }
    }

    pub fn input_apk(&self) -> &Path {
        &self.input_apk
    }

    pub fn out_root(&self) -> &Path {
        &self.out_root
    }

    /// Root of the generated C sources.
    pub fn dex2c_src_dir(&self) -> PathBuf {
        self.out_root.join("dex2c")
    }

    /// Where the converter writes its C files and shell units.
    pub fn code_generated_dir(&self) -> PathBuf {
        self.dex2c_src_dir().join("generated")
    }

    /// Packed units; kept after the run for inspection.
    pub fn dex_output_dir(&self) -> PathBuf {
        self.out_root.join("dex_output")
    }

    pub fn output_apk(&self) -> PathBuf {
        let stem = self
            .input_apk
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "app".to_string());
        self.out_root.join(format!("{stem}-protect.apk"))
    }

    /// Fresh extraction directory, removed when the returned guard drops.
    pub fn extraction_dir(&self) -> io::Result<TempDir> {
        fs::create_dir_all(&self.out_root)?;
        tempfile::Builder::new()
            .prefix(".apk_temp")
            .tempdir_in(&self.out_root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_survive_toml() {
        let config = ProtectConfig::from_toml_str("").unwrap();
        assert_eq!(config, ProtectConfig::default());

        let text = config.to_toml_string().unwrap();
        assert_eq!(ProtectConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn reads_overrides() {
        let config = ProtectConfig::from_toml_str(
            r#"
            lib_name = "shield"
            max_pool_refs = 50000
            ceiling_mode = "per_section"
            default_abis = ["x86_64"]
            application_class = "com.app.App"
            "#,
        )
        .unwrap();
        assert_eq!(config.lib_name, "shield");
        assert_eq!(config.ceiling_mode, CeilingMode::PerSection);
        assert_eq!(config.default_abis, vec!["x86_64"]);
        assert_eq!(config.default_min_sdk, 21);
    }

    #[test]
    fn rejects_bad_ceiling_and_names() {
        for text in [
            "max_pool_refs = 0",
            "max_pool_refs = 70000",
            "lib_name = \"\"",
            "lib_name = \"a/b\"",
            "default_abis = [\"lib/x86\"]",
            "ceiling_mode = \"sideways\"",
        ] {
            assert!(
                matches!(ProtectConfig::from_toml_str(text), Err(ProtectError::InvalidConfig(_))),
                "{text}"
            );
        }
    }

    #[test]
    fn ceiling_modes_measure_differently() {
        let counts = RefCounts {
            methods: 5,
            fields: 3,
            types: 4,
            ..Default::default()
        };
        assert_eq!(CeilingMode::Combined.measure(&counts), 12);
        assert_eq!(CeilingMode::PerSection.measure(&counts), 5);
    }

    #[test]
    fn global_config_needs_one_holder_per_run() {
        let a = UnitConfig::new("a.dex", "register0", "com/app/NativeUtil", vec![]);
        let b = UnitConfig::new("b.dex", "register1", "com.app.NativeUtil", vec!["com.app.A".into()]);
        let config = GlobalConfig::new(vec![a.clone(), b.clone()]);
        assert_eq!(config.validate(2).unwrap(), "Lcom/app/NativeUtil;");
        assert_eq!(b.native_index("Lcom/app/A;"), Some(0));
        assert!(config.validate(3).is_err());

        let other = UnitConfig::new("c.dex", "register2", "com/other/Util", vec![]);
        assert!(GlobalConfig::new(vec![a.clone(), other]).validate(2).is_err());
        assert!(GlobalConfig::new(vec![a.clone(), a]).validate(2).is_err());
    }

    #[test]
    fn workspace_layout() {
        let ws = Workspace::new("/in/app-release.apk", "/out");
        assert_eq!(ws.code_generated_dir(), PathBuf::from("/out/dex2c/generated"));
        assert_eq!(ws.dex_output_dir(), PathBuf::from("/out/dex_output"));
        assert_eq!(ws.output_apk(), PathBuf::from("/out/app-release-protect.apk"));
    }

    #[test]
    fn extraction_dir_is_scoped() {
        let root = tempfile::tempdir().unwrap();
        let ws = Workspace::new("in.apk", root.path());
        let path = {
            let dir = ws.extraction_dir().unwrap();
            assert!(dir.path().starts_with(root.path()));
            dir.path().to_path_buf()
        };
        assert!(!path.exists());
    }
}
