//! Discovery and ordering of the `classesN.dex` units of an input package.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::android::ApkReader;
use crate::dex::reader::{class_table, Header};
use crate::dex::ClassEntry;
use crate::protect::error::ProtectError;

/// Entry names of binary units: `classes.dex`, `classes2.dex`, ...
pub static UNIT_ENTRY: Lazy<Regex> = Lazy::new(|| Regex::new(r"^classes(\d*)\.dex$").unwrap());

/// Numeric suffix of a unit entry name; the primary unit counts as 0.
pub fn unit_ordinal(name: &str) -> Option<u32> {
    let digits = UNIT_ENTRY.captures(name)?.get(1)?.as_str();
    if digits.is_empty() {
        Some(0)
    } else {
        digits.parse().ok()
    }
}

/// Canonical entry name of the `index`-th output unit.
pub fn unit_entry_name(index: usize) -> String {
    if index == 0 {
        "classes.dex".to_string()
    } else {
        format!("classes{}.dex", index + 1)
    }
}

/// One original dex unit extracted from the input package.
#[derive(Debug, Clone)]
pub struct BinaryUnit {
    /// Position in the ordered unit list; 0 is the primary unit.
    pub index: usize,
    pub entry_name: String,
    pub path: PathBuf,
    pub version: u32,
    pub classes: Vec<ClassEntry>,
}

impl BinaryUnit {
    pub fn open(index: usize, entry_name: &str, path: &Path) -> Result<Self, ProtectError> {
        let bytes = fs::read(path)?;
        let version = Header::read(&bytes)?.version;
        let classes = class_table(&bytes)?;
        Ok(BinaryUnit {
            index,
            entry_name: entry_name.to_string(),
            path: path.to_path_buf(),
            version,
            classes,
        })
    }
}

/// Extract every unit of `apk` into `dir` and return them ordered by numeric
/// suffix.
pub fn order_units(apk: &mut ApkReader, apk_path: &Path, dir: &Path) -> Result<Vec<BinaryUnit>, ProtectError> {
    let mut found: Vec<(u32, String, PathBuf)> = apk
        .extract_matching(&UNIT_ENTRY, dir)
        .map_err(ProtectError::InputArchive)?
        .into_iter()
        .filter_map(|(name, path)| unit_ordinal(&name).map(|n| (n, name, path)))
        .collect();
    if found.is_empty() {
        return Err(ProtectError::NoBinaryUnits(apk_path.to_path_buf()));
    }
    found.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

    let units = found
        .iter()
        .enumerate()
        .map(|(index, (_, name, path))| BinaryUnit::open(index, name, path))
        .collect::<Result<Vec<_>, _>>()?;
    info!(
        "found {} dex units: {}",
        units.len(),
        units.iter().map(|u| u.entry_name.as_str()).collect::<Vec<_>>().join(", ")
    );
    Ok(units)
}

/// Where a class is defined and what it extends, across all original units.
#[derive(Debug, Default)]
pub struct ClassIndex {
    entries: HashMap<String, (usize, Option<String>)>,
}

impl ClassIndex {
    /// The first definition of a descriptor wins, as it does at run time.
    pub fn build(units: &[BinaryUnit]) -> Self {
        let mut entries = HashMap::new();
        for unit in units {
            for class in &unit.classes {
                if entries.contains_key(&class.descriptor) {
                    debug!("{} is defined again in {}", class.descriptor, unit.entry_name);
                    continue;
                }
                entries.insert(class.descriptor.clone(), (unit.index, class.superclass.clone()));
            }
        }
        ClassIndex { entries }
    }

    pub fn contains(&self, descriptor: &str) -> bool {
        self.entries.contains_key(descriptor)
    }

    pub fn unit_of(&self, descriptor: &str) -> Option<usize> {
        self.entries.get(descriptor).map(|(unit, _)| *unit)
    }

    /// `None` when the class is unknown; `Some(None)` for a root class.
    pub fn superclass_of(&self, descriptor: &str) -> Option<Option<&str>> {
        self.entries.get(descriptor).map(|(_, s)| s.as_deref())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
