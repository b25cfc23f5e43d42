//! Builders for the dex units, manifests and packages used by the tests.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;

use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::android::manifest::ANDROID_NAMESPACE_URI;
use crate::dex::model::{AccessFlags, ClassDef, Field, FieldRef};
use crate::dex::write_dex;

const OBJECT: &str = "Ljava/lang/Object;";

/// A class extending `superclass` with no members.
pub fn empty_class(descriptor: &str, superclass: &str) -> ClassDef {
    ClassDef::new(descriptor, Some(superclass), AccessFlags::PUBLIC)
}

/// A class with one `int f` instance field: two references of its own
/// (its type and the field) plus the shared `Object` and `I` types.
pub fn class_with_field(descriptor: &str) -> ClassDef {
    let mut class = empty_class(descriptor, OBJECT);
    class.instance_fields.push(Field {
        field: FieldRef::new(descriptor, "f", "I"),
        access: AccessFlags::PRIVATE,
        annotations: vec![],
    });
    class
}

pub fn dex_with(descriptors: &[&str]) -> Vec<u8> {
    let classes: Vec<_> = descriptors.iter().map(|d| class_with_field(d)).collect();
    write_dex(&classes, 35).unwrap()
}

pub fn write_dex_file(path: &Path, classes: &[ClassDef]) {
    fs::write(path, write_dex(classes, 35).unwrap()).unwrap();
}

/// Write a zip with the given entries; media and `.so` files are stored,
/// the rest deflated.
pub fn write_apk(path: &Path, entries: &[(&str, Vec<u8>)]) {
    let mut zip = ZipWriter::new(File::create(path).unwrap());
    for (name, data) in entries {
        let method = if name.ends_with(".so") || name.ends_with(".png") {
            CompressionMethod::Stored
        } else {
            CompressionMethod::Deflated
        };
        zip.start_file(*name, FileOptions::default().compression_method(method))
            .unwrap();
        zip.write_all(data).unwrap();
    }
    zip.finish().unwrap();
}

/// All entries of a zip, decompressed, in archive order.
pub fn read_apk(path: &Path) -> Vec<(String, Vec<u8>)> {
    let mut archive = ZipArchive::new(File::open(path).unwrap()).unwrap();
    (0..archive.len())
        .map(|i| {
            let mut entry = archive.by_index(i).unwrap();
            let mut data = Vec::new();
            entry.read_to_end(&mut data).unwrap();
            (entry.name().to_string(), data)
        })
        .collect()
}

const NO_ENTRY: u32 = 0xFFFF_FFFF;
const ATTR_NAME_ID: u32 = 0x0101_0003;
const ATTR_MIN_SDK_ID: u32 = 0x0101_020C;

/// Encoder for a minimal compiled manifest:
/// `<manifest package><uses-sdk minSdkVersion/><application name/></manifest>`.
pub struct BinaryManifest {
    package: String,
    application: Option<String>,
    min_sdk: Option<u32>,
    blank_names: bool,
}

impl BinaryManifest {
    pub fn new(package: &str) -> Self {
        BinaryManifest {
            package: package.to_string(),
            application: None,
            min_sdk: None,
            blank_names: false,
        }
    }

    pub fn application(mut self, name: &str) -> Self {
        self.application = Some(name.to_string());
        self
    }

    pub fn min_sdk(mut self, level: u32) -> Self {
        self.min_sdk = Some(level);
        self
    }

    /// Leave the resource-mapped attribute names empty, as resource
    /// shrinkers do.
    pub fn blank_android_names(mut self) -> Self {
        self.blank_names = true;
        self
    }

    pub fn encode(&self) -> Vec<u8> {
        // 0 and 1 line up with the resource map
        let (name, min_sdk) = if self.blank_names { ("", "") } else { ("name", "minSdkVersion") };
        let strings = [
            name,
            min_sdk,
            "android",
            ANDROID_NAMESPACE_URI,
            "manifest",
            "package",
            &self.package,
            "uses-sdk",
            "application",
            self.application.as_deref().unwrap_or(""),
        ];

        let mut body = string_pool(&strings);
        body.extend(chunk(0x0180, 8, &[ATTR_NAME_ID, ATTR_MIN_SDK_ID].map(u32::to_le_bytes).concat()));
        body.extend(node(0x0100, &[2, 3]));
        body.extend(start_element(4, &[(NO_ENTRY, 5, 6, 0x03, 6)]));
        if let Some(level) = self.min_sdk {
            body.extend(start_element(7, &[(3, 1, NO_ENTRY, 0x10, level)]));
            body.extend(node(0x0103, &[NO_ENTRY, 7]));
        }
        if self.application.is_some() {
            body.extend(start_element(8, &[(3, 0, 9, 0x03, 9)]));
            body.extend(node(0x0103, &[NO_ENTRY, 8]));
        }
        body.extend(node(0x0103, &[NO_ENTRY, 4]));
        body.extend(node(0x0101, &[2, 3]));
        chunk(0x0003, 8, &body)
    }
}

fn chunk(chunk_type: u16, header_size: u16, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + payload.len());
    out.extend(chunk_type.to_le_bytes());
    out.extend(header_size.to_le_bytes());
    out.extend((8 + payload.len() as u32).to_le_bytes());
    out.extend(payload);
    out
}

fn string_pool(strings: &[&str]) -> Vec<u8> {
    let mut data = Vec::new();
    let mut offsets = Vec::new();
    for s in strings {
        offsets.push(data.len() as u32);
        let units: Vec<u16> = s.encode_utf16().collect();
        data.extend((units.len() as u16).to_le_bytes());
        for u in units {
            data.extend(u.to_le_bytes());
        }
        data.extend([0, 0]);
    }
    while data.len() % 4 != 0 {
        data.push(0);
    }
    let strings_start = 28 + 4 * strings.len() as u32;
    let mut payload = Vec::new();
    for v in [strings.len() as u32, 0, 0, strings_start, 0] {
        payload.extend(v.to_le_bytes());
    }
    for o in offsets {
        payload.extend(o.to_le_bytes());
    }
    payload.extend(data);
    chunk(0x0001, 28, &payload)
}

/// Namespace and end-element nodes: line, comment, then two indices.
fn node(chunk_type: u16, fields: &[u32; 2]) -> Vec<u8> {
    let mut payload = Vec::new();
    for v in [1, NO_ENTRY, fields[0], fields[1]] {
        payload.extend(v.to_le_bytes());
    }
    chunk(chunk_type, 16, &payload)
}

/// `(namespace, name, raw value, data type, data)` per attribute.
fn start_element(name: u32, attrs: &[(u32, u32, u32, u8, u32)]) -> Vec<u8> {
    let mut payload = Vec::new();
    for v in [1, NO_ENTRY, NO_ENTRY, name] {
        payload.extend(v.to_le_bytes());
    }
    for v in [20u16, 20, attrs.len() as u16, 0, 0, 0] {
        payload.extend(v.to_le_bytes());
    }
    for &(ns, attr_name, raw, data_type, data) in attrs {
        for v in [ns, attr_name, raw] {
            payload.extend(v.to_le_bytes());
        }
        payload.extend(8u16.to_le_bytes());
        payload.push(0);
        payload.push(data_type);
        payload.extend(data.to_le_bytes());
    }
    chunk(0x0102, 16, &payload)
}
