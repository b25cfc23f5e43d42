//! A bounded accumulator of classes that becomes one output unit.

use std::collections::HashSet;

use log::debug;

use crate::dex::{write_dex, ClassDef, DexError, RefCounts, RefSet};
use crate::protect::config::CeilingMode;

/// Returned by [`DexPool::try_intern`] when the class does not fit; hands the
/// class back to the caller.
#[derive(Debug)]
pub struct PoolFull(pub ClassDef);

/// Classes destined for a single dex unit.
///
/// The reference closure of the interned classes is tracked exactly, so the
/// size measured here is the size of the id tables the writer will emit.
#[derive(Debug)]
pub struct DexPool {
    classes: Vec<ClassDef>,
    descriptors: HashSet<String>,
    refs: RefSet,
    ceiling: u32,
    mode: CeilingMode,
}

impl DexPool {
    pub fn new(ceiling: u32, mode: CeilingMode) -> Self {
        DexPool {
            classes: Vec::new(),
            descriptors: HashSet::new(),
            refs: RefSet::default(),
            ceiling,
            mode,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn contains(&self, descriptor: &str) -> bool {
        self.descriptors.contains(descriptor)
    }

    pub fn counts(&self) -> RefCounts {
        self.refs.counts()
    }

    /// Current size as measured against the ceiling.
    pub fn size(&self) -> u32 {
        self.mode.measure(&self.counts())
    }

    pub fn ceiling(&self) -> u32 {
        self.ceiling
    }

    fn fits(&self, after: &RefCounts) -> bool {
        self.mode.measure(after) <= self.ceiling && after.within_table_limits()
    }

    /// Add `class` unless that would push the pool past its ceiling.
    ///
    /// A descriptor already present is dropped; the first definition is the
    /// one the runtime would load.
    pub fn try_intern(&mut self, class: ClassDef) -> Result<(), PoolFull> {
        if self.descriptors.contains(&class.descriptor) {
            debug!("{} already interned, dropping duplicate", class.descriptor);
            return Ok(());
        }
        let class_refs = class.references();
        let after = self.counts() + self.refs.delta(&class_refs);
        if !self.fits(&after) {
            return Err(PoolFull(class));
        }
        self.refs.extend(class_refs);
        self.descriptors.insert(class.descriptor.clone());
        self.classes.push(class);
        Ok(())
    }

    pub fn classes(&self) -> &[ClassDef] {
        &self.classes
    }

    pub fn into_classes(self) -> Vec<ClassDef> {
        self.classes
    }

    /// Encode the pool as a dex file.
    pub fn encode(&self, version: u32) -> Result<Vec<u8>, DexError> {
        write_dex(&self.classes, version)
    }
}
