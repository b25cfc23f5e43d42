//! The bridge class: loads the native library and declares one native
//! registration method per original unit.

use std::fs;
use std::path::Path;

use log::info;

use crate::dex::model::{AccessFlags, Code, InsnRef, Method, MethodRef, Proto, Reference, CLINIT};
use crate::dex::{write_dex, ClassDef, DexUnit, RefCounts, RefSet};
use crate::protect::config::GlobalConfig;
use crate::protect::error::ProtectError;
use crate::protect::inject::FlushedUnit;

const JAVA_OBJECT: &str = "Ljava/lang/Object;";
const JAVA_SYSTEM: &str = "Ljava/lang/System;";
const JAVA_STRING: &str = "Ljava/lang/String;";

/// Build `holder`: its `<clinit>` runs `System.loadLibrary(lib_name)` and each
/// of `register_methods` is a `public static native void m(int)`.
pub fn bridge_class(holder: &str, lib_name: &str, register_methods: &[&str]) -> ClassDef {
    let mut class = ClassDef::new(holder, Some(JAVA_OBJECT), AccessFlags::PUBLIC | AccessFlags::FINAL);

    let load_library = MethodRef::new(JAVA_SYSTEM, "loadLibrary", Proto::new("V", &[JAVA_STRING]));
    let code = Code {
        registers_size: 1,
        ins_size: 0,
        outs_size: 1,
        // const-string v0, lib_name ; invoke-static {v0}, loadLibrary ; return-void
        insns: vec![0x001a, 0, 0x1071, 0, 0x0000, 0x000e],
        refs: vec![
            InsnRef { pc: 0, target: Reference::String(lib_name.to_string()) },
            InsnRef { pc: 2, target: Reference::Method(load_library) },
        ],
        tries: vec![],
        debug_info: None,
    };
    class.direct_methods.push(Method::new(
        MethodRef::new(holder, CLINIT, Proto::new("V", &[])),
        AccessFlags::STATIC | AccessFlags::CONSTRUCTOR,
        Some(code),
    ));

    for name in register_methods {
        class.direct_methods.push(Method::new(
            MethodRef::new(holder, name, Proto::new("V", &["I"])),
            AccessFlags::PUBLIC | AccessFlags::STATIC | AccessFlags::NATIVE,
            None,
        ));
    }
    class
}

fn check_table_limits(counts: &RefCounts) -> Result<(), ProtectError> {
    if counts.within_table_limits() {
        return Ok(());
    }
    Err(ProtectError::InjectionFailure {
        unit: 0,
        reason: format!("primary unit overflows with the bridge class: {counts}"),
    })
}

/// Rewrite the primary unit with the bridge class added, into
/// `<out_dir>/bridge/classes.dex`.
pub fn synthesize_bridge(
    primary: &FlushedUnit,
    global: &GlobalConfig,
    holder: &str,
    lib_name: &str,
    out_dir: &Path,
) -> Result<FlushedUnit, ProtectError> {
    let unit = DexUnit::from_file(&primary.path)?;
    if unit.class(holder).is_some() {
        return Err(ProtectError::InvalidConfig(format!(
            "bridge class {holder} already exists in {}",
            primary.entry_name
        )));
    }

    let methods: Vec<&str> = global.configs().iter().map(|c| c.register_method.as_str()).collect();
    let mut classes = unit.classes;
    classes.push(bridge_class(holder, lib_name, &methods));

    let mut refs = RefSet::default();
    for class in &classes {
        class.collect_references(&mut refs);
    }
    let counts = refs.counts();
    check_table_limits(&counts)?;

    let dir = out_dir.join("bridge");
    fs::create_dir_all(&dir)?;
    let path = dir.join(&primary.entry_name);
    fs::write(&path, write_dex(&classes, unit.version)?)?;
    info!("bridge {} added to {} ({})", holder, primary.entry_name, counts);

    Ok(FlushedUnit {
        entry_name: primary.entry_name.clone(),
        path,
        counts,
        classes: classes.iter().map(|c| c.descriptor.clone()).collect(),
    })
}
