//! Classes that must stay in the primary unit.
//!
//! The application class and its ancestors are instantiated before any other
//! code runs, so they may execute before the bridge class has loaded the native
//! library. Keeping them in `classes.dex` next to the bridge keeps that load
//! reachable from the earliest point.

use std::collections::HashSet;

use log::debug;

use crate::dex::model::class_name_to_descriptor;
use crate::protect::units::ClassIndex;

pub const PLATFORM_APPLICATION: &str = "Landroid/app/Application;";

/// Ordered set of descriptors pinned to the primary unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MainClassSet {
    ordered: Vec<String>,
    members: HashSet<String>,
}

impl MainClassSet {
    pub fn insert(&mut self, descriptor: &str) -> bool {
        if !self.members.insert(descriptor.to_string()) {
            return false;
        }
        self.ordered.push(descriptor.to_string());
        true
    }

    pub fn contains(&self, descriptor: &str) -> bool {
        self.members.contains(descriptor)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.ordered.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.ordered.clone()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MainChain {
    pub classes: MainClassSet,
    /// First descriptor of the chain that no unit defines.
    pub missing: Option<String>,
}

/// Walk the superclass chain of `entry_class` (any class name spelling) until
/// a direct subclass of `android.app.Application`, a class no unit defines,
/// or a cycle.
pub fn resolve_main_chain(index: &ClassIndex, entry_class: &str) -> MainChain {
    let mut chain = MainChain::default();
    let mut current = class_name_to_descriptor(entry_class);
    loop {
        let Some(superclass) = index.superclass_of(&current) else {
            debug!("main chain stops at undefined {}", current);
            chain.missing = Some(current);
            break;
        };
        if !chain.classes.insert(&current) {
            debug!("main chain cycles back to {}", current);
            break;
        }
        match superclass {
            Some(PLATFORM_APPLICATION) | None => break,
            Some(parent) => current = parent.to_string(),
        }
    }
    chain
}
