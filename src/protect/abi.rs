//! Choosing the ABIs the native library is built for.

use std::collections::BTreeSet;
use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;

static NATIVE_LIB_ENTRY: Lazy<Regex> = Lazy::new(|| Regex::new(r"^lib/([^/]+)/[^/]+\.so$").unwrap());

/// ABIs the native library cannot be built for.
pub const UNSUPPORTED_ABIS: [&str; 3] = ["armeabi", "mips", "mips64"];

/// Ordered set of ABI names such as `arm64-v8a`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AbiSet(BTreeSet<String>);

impl AbiSet {
    pub fn new<I, S>(abis: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        AbiSet(abis.into_iter().map(Into::into).collect())
    }

    pub fn contains(&self, abi: &str) -> bool {
        self.0.contains(abi)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for AbiSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.iter().collect::<Vec<_>>().join(", "))
    }
}

/// ABIs of the native libraries already shipped in the package, minus the
/// unsupported ones; `defaults` when nothing is left.
pub fn select_abis<'a>(entry_names: impl IntoIterator<Item = &'a str>, defaults: &[String]) -> AbiSet {
    let found: BTreeSet<String> = entry_names
        .into_iter()
        .filter_map(|name| NATIVE_LIB_ENTRY.captures(name))
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
        .filter(|abi| !UNSUPPORTED_ABIS.contains(&abi.as_str()))
        .collect();
    if found.is_empty() {
        AbiSet::new(defaults.iter().cloned())
    } else {
        AbiSet(found)
    }
}
