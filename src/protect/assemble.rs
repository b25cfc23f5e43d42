//! Writing the output package.

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::android::{ApkReader, ApkWriter, ApkZipError};
use crate::protect::error::ProtectError;
use crate::protect::units::UNIT_ENTRY;

pub const ANDROID_MANIFEST: &str = "AndroidManifest.xml";

/// Everything generated for the output package.
#[derive(Debug, Clone, Default)]
pub struct ArchivePlan<'a> {
    /// Written unchanged; `None` when the input had no manifest.
    pub manifest: Option<&'a [u8]>,
    /// `(entry name, file)` of each dex unit, primary first.
    pub units: Vec<(String, PathBuf)>,
    /// `(entry name, file)` of each native library.
    pub native_libs: Vec<(String, PathBuf)>,
}

/// Whether an original entry is replaced by generated content.
pub fn is_regenerated_entry(name: &str) -> bool {
    name == ANDROID_MANIFEST || UNIT_ENTRY.is_match(name)
}

/// Write `plan` followed by every other entry of `source`, copied raw, and
/// publish the result at `dest`. Nothing appears at `dest` unless the whole
/// archive was written.
///
/// Returns the entry names in archive order.
pub fn assemble_archive(source: &mut ApkReader, plan: &ArchivePlan<'_>, dest: &Path) -> Result<Vec<String>, ProtectError> {
    let staging = match dest.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let mut writer = ApkWriter::new_in(&staging).map_err(ProtectError::ArchiveWriteFailure)?;
    let mut written = Vec::new();

    if let Some(manifest) = plan.manifest {
        writer
            .add_entry(ANDROID_MANIFEST, manifest)
            .map_err(ProtectError::ArchiveWriteFailure)?;
        written.push(ANDROID_MANIFEST.to_string());
    }
    for (name, path) in plan.units.iter().chain(plan.native_libs.iter()) {
        let data = fs::read(path).map_err(|e| ProtectError::ArchiveWriteFailure(ApkZipError::Io(e)))?;
        writer.add_entry(name, &data).map_err(ProtectError::ArchiveWriteFailure)?;
        written.push(name.clone());
    }

    let originals = source.entry_names().to_vec();
    let mut copied = 0usize;
    for (index, name) in originals.iter().enumerate() {
        if is_regenerated_entry(name) || writer.contains(name) {
            debug!("dropping original {}", name);
            continue;
        }
        writer
            .copy_raw(source, index)
            .map_err(ProtectError::ArchiveWriteFailure)?;
        written.push(name.clone());
        copied += 1;
    }

    writer.publish(dest).map_err(ProtectError::ArchiveWriteFailure)?;
    info!(
        "wrote {} ({} generated, {} copied entries)",
        dest.display(),
        written.len() - copied,
        copied
    );
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::fixtures::{read_apk, write_apk};

    #[test]
    fn generated_entries_replace_originals() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.apk");
        write_apk(
            &input,
            &[
                ("AndroidManifest.xml", b"old".to_vec()),
                ("classes.dex", b"old primary".to_vec()),
                ("classes2.dex", b"old secondary".to_vec()),
                ("lib/x86/libdexvault.so", b"old lib".to_vec()),
                ("res/a.xml", b"kept".to_vec()),
            ],
        );
        let unit = dir.path().join("classes2.dex");
        fs::write(&unit, b"new secondary").unwrap();
        let lib = dir.path().join("libdexvault.so");
        fs::write(&lib, b"new lib").unwrap();

        let plan = ArchivePlan {
            manifest: Some(&b"manifest"[..]),
            units: vec![("classes2.dex".into(), unit)],
            native_libs: vec![("lib/x86/libdexvault.so".into(), lib)],
        };
        let out = dir.path().join("out").join("o.apk");
        fs::create_dir_all(out.parent().unwrap()).unwrap();
        let mut reader = ApkReader::open(&input).unwrap();
        let names = assemble_archive(&mut reader, &plan, &out).unwrap();
        assert_eq!(names, ["AndroidManifest.xml", "classes2.dex", "lib/x86/libdexvault.so", "res/a.xml"]);

        let entries = read_apk(&out);
        assert_eq!(entries.len(), 4);
        let get = |n: &str| entries.iter().find(|(name, _)| name == n).map(|(_, d)| d.clone()).unwrap();
        assert_eq!(get("classes2.dex"), b"new secondary");
        assert_eq!(get("lib/x86/libdexvault.so"), b"new lib");
        assert_eq!(get("AndroidManifest.xml"), b"manifest");
    }

    #[test]
    fn failed_assembly_leaves_no_output() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.apk");
        write_apk(&input, &[("AndroidManifest.xml", b"m".to_vec())]);
        let out = dir.path().join("o.apk");
        fs::write(&out, b"previous").unwrap();

        let plan = ArchivePlan {
            manifest: Some(&b"m"[..]),
            units: vec![("classes.dex".into(), dir.path().join("missing.dex"))],
            native_libs: vec![],
        };
        let mut reader = ApkReader::open(&input).unwrap();
        let err = assemble_archive(&mut reader, &plan, &out).unwrap_err();
        assert!(matches!(err, ProtectError::ArchiveWriteFailure(_)));
        assert_eq!(fs::read(&out).unwrap(), b"previous");
        // only the input, the previous output and nothing staged
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 2);
    }
}
