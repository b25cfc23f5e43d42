use crc32fast::Hasher as Crc32;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use regex::Regex;
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Component, Path, PathBuf};
use tempfile::{NamedTempFile, TempPath};
use zip::read::ZipArchive;

/// Result alias for APK (ZIP) operations.
pub type ApkZipResult<T> = Result<T, ApkZipError>;

/// Errors surfaced by the APK reading/writing helpers.
#[derive(Debug)]
pub enum ApkZipError {
    Io(io::Error),
    Zip(zip::result::ZipError),
    InvalidInput(String),
}

impl std::fmt::Display for ApkZipError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApkZipError::Io(err) => write!(f, "I/O error: {err}"),
            ApkZipError::Zip(err) => write!(f, "ZIP error: {err}"),
            ApkZipError::InvalidInput(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for ApkZipError {}

impl From<io::Error> for ApkZipError {
    fn from(value: io::Error) -> Self {
        ApkZipError::Io(value)
    }
}

impl From<zip::result::ZipError> for ApkZipError {
    fn from(value: zip::result::ZipError) -> Self {
        ApkZipError::Zip(value)
    }
}

/// Compression preference for an APK entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApkCompression {
    Stored,
    Deflated,
}

/// Read access to an existing APK.
pub struct ApkReader {
    archive: ZipArchive<File>,
    names: Vec<String>,
}

impl ApkReader {
    pub fn open(path: impl AsRef<Path>) -> ApkZipResult<Self> {
        let file = File::open(path.as_ref())?;
        let mut archive = ZipArchive::new(file)?;
        let mut names = Vec::with_capacity(archive.len());
        for idx in 0..archive.len() {
            names.push(archive.by_index_raw(idx)?.name().to_string());
        }
        Ok(ApkReader { archive, names })
    }

    /// Entry names in central directory order.
    pub fn entry_names(&self) -> &[String] {
        &self.names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    /// Decompressed contents of `name`, or `None` when there is no such entry.
    pub fn read_entry(&mut self, name: &str) -> ApkZipResult<Option<Vec<u8>>> {
        let mut entry = match self.archive.by_name(name) {
            Ok(entry) => entry,
            Err(zip::result::ZipError::FileNotFound) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let mut data = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut data)?;
        Ok(Some(data))
    }

    /// Extract every file entry whose name matches `pattern` into `dir`.
    /// Returns `(entry name, extracted path)` pairs in archive order.
    pub fn extract_matching(
        &mut self,
        pattern: &Regex,
        dir: impl AsRef<Path>,
    ) -> ApkZipResult<Vec<(String, PathBuf)>> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let mut extracted = Vec::new();
        for idx in 0..self.names.len() {
            let name = &self.names[idx];
            if name.ends_with('/') || !pattern.is_match(name) {
                continue;
            }
            let target = dir.join(normalize_entry_name(name)?);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut entry = self.archive.by_index(idx)?;
            let mut out = File::create(&target)?;
            io::copy(&mut entry, &mut out)?;
            extracted.push((name.clone(), target));
        }
        Ok(extracted)
    }
}

#[derive(Clone, Copy)]
struct EntryPlan {
    compression: ApkCompression,
    alignment: Option<u32>,
}

#[derive(Clone)]
struct CentralDirectoryRecord {
    file_name: Vec<u8>,
    flags: u16,
    method: u16,
    mod_time: u16,
    mod_date: u16,
    crc32: u32,
    compressed_size: u32,
    uncompressed_size: u32,
    local_header_offset: u32,
    external_attrs: u32,
}

/// 1980-01-01 00:00, the earliest DOS timestamp.
const DOS_EPOCH_DATE: u16 = (1 << 5) | 1;
const FLAG_UTF8: u16 = 0x0800;
const METHOD_STORED: u16 = 0;
const METHOD_DEFLATED: u16 = 8;

/// Streaming APK writer.
///
/// Entries go to a temporary file next to the destination; nothing is visible
/// at the destination path until [`ApkWriter::publish`] renames it into place,
/// and dropping the writer removes the temporary file.
pub struct ApkWriter {
    out: BufWriter<File>,
    path: TempPath,
    offset: u64,
    records: Vec<CentralDirectoryRecord>,
    names: HashSet<String>,
}

impl ApkWriter {
    /// Start an archive whose temporary file lives in `dir`; publish it to a
    /// path on the same file system.
    pub fn new_in(dir: impl AsRef<Path>) -> ApkZipResult<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let (file, path) = NamedTempFile::new_in(dir)?.into_parts();
        Ok(ApkWriter {
            out: BufWriter::new(file),
            path,
            offset: 0,
            records: Vec::new(),
            names: HashSet::new(),
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    fn claim_name(&mut self, name: &str) -> ApkZipResult<()> {
        if !self.names.insert(name.to_string()) {
            return Err(ApkZipError::InvalidInput(format!(
                "duplicate entry {name}"
            )));
        }
        Ok(())
    }

    fn local_offset(&self) -> ApkZipResult<u32> {
        u32::try_from(self.offset).map_err(|_| {
            ApkZipError::InvalidInput("archive exceeds 4 GiB".to_string())
        })
    }

    fn emit(&mut self, bytes: &[u8]) -> ApkZipResult<()> {
        self.out.write_all(bytes)?;
        self.offset += bytes.len() as u64;
        Ok(())
    }

    /// Add a generated entry, choosing compression and alignment from its name.
    pub fn add_entry(&mut self, name: &str, data: &[u8]) -> ApkZipResult<()> {
        let name = normalize_entry_name(name)?;
        self.claim_name(&name)?;
        let plan = classify_entry(&name);
        let (compressed, method) = match plan.compression {
            ApkCompression::Stored => (data.to_vec(), METHOD_STORED),
            ApkCompression::Deflated => (deflate_bytes(data)?, METHOD_DEFLATED),
        };
        let mut crc = Crc32::new();
        crc.update(data);

        let record = CentralDirectoryRecord {
            file_name: name.as_bytes().to_vec(),
            flags: name_flags(&name),
            method,
            mod_time: 0,
            mod_date: DOS_EPOCH_DATE,
            crc32: crc.finalize(),
            compressed_size: size_u32(compressed.len() as u64)?,
            uncompressed_size: size_u32(data.len() as u64)?,
            local_header_offset: self.local_offset()?,
            external_attrs: 0o644 << 16,
        };
        self.write_local_header(&record, plan.alignment)?;
        self.emit(&compressed)?;
        self.records.push(record);
        Ok(())
    }

    /// Copy entry `index` of `source` without recompressing it: compressed
    /// bytes, CRC, sizes, method and timestamp are kept.
    pub fn copy_raw(&mut self, source: &mut ApkReader, index: usize) -> ApkZipResult<()> {
        let mut entry = source.archive.by_index_raw(index)?;
        let name = entry.name().to_string();
        self.claim_name(&name)?;

        #[allow(deprecated)]
        let method = entry.compression().to_u16();
        let modified = entry.last_modified();
        let record = CentralDirectoryRecord {
            file_name: name.as_bytes().to_vec(),
            flags: name_flags(&name),
            method,
            mod_time: modified.timepart(),
            mod_date: modified.datepart(),
            crc32: entry.crc32(),
            compressed_size: size_u32(entry.compressed_size())?,
            uncompressed_size: size_u32(entry.size())?,
            local_header_offset: self.local_offset()?,
            external_attrs: entry.unix_mode().map(|m| m << 16).unwrap_or(0),
        };
        let alignment = if method == METHOD_STORED && !name.ends_with('/') {
            classify_entry(&name).alignment.or(Some(4))
        } else {
            None
        };
        self.write_local_header(&record, alignment)?;

        let mut raw = Vec::with_capacity(record.compressed_size as usize);
        entry.read_to_end(&mut raw)?;
        self.emit(&raw)?;
        self.records.push(record);
        Ok(())
    }

    fn write_local_header(
        &mut self,
        record: &CentralDirectoryRecord,
        alignment: Option<u32>,
    ) -> ApkZipResult<()> {
        let extra_len = match alignment {
            Some(align) => {
                alignment_padding(record.local_header_offset, record.file_name.len(), align)
            }
            None => 0,
        };
        let mut buf = Vec::with_capacity(30 + record.file_name.len() + extra_len as usize);
        write_u32(&mut buf, 0x04034b50);
        write_u16(&mut buf, 20);
        write_u16(&mut buf, record.flags);
        write_u16(&mut buf, record.method);
        write_u16(&mut buf, record.mod_time);
        write_u16(&mut buf, record.mod_date);
        write_u32(&mut buf, record.crc32);
        write_u32(&mut buf, record.compressed_size);
        write_u32(&mut buf, record.uncompressed_size);
        write_u16(&mut buf, record.file_name.len() as u16);
        write_u16(&mut buf, extra_len as u16);
        buf.extend_from_slice(&record.file_name);
        buf.extend(std::iter::repeat(0u8).take(extra_len as usize));
        self.emit(&buf)
    }

    /// Write the central directory and atomically move the archive to `dest`,
    /// replacing any existing file.
    pub fn publish(mut self, dest: impl AsRef<Path>) -> ApkZipResult<()> {
        let central_start = self.local_offset()?;
        let mut central = Vec::new();
        for record in &self.records {
            write_central_directory_entry(&mut central, record);
        }
        let central_size = central.len() as u32;
        if self.records.len() > u16::MAX as usize {
            return Err(ApkZipError::InvalidInput(
                "too many entries for a zip without zip64".to_string(),
            ));
        }
        write_end_of_central_directory(&mut central, self.records.len(), central_size, central_start);
        self.emit(&central)?;

        let ApkWriter { out, path, .. } = self;
        let file = out.into_inner().map_err(|err| ApkZipError::Io(err.into_error()))?;
        file.sync_all()?;
        drop(file);

        let dest = dest.as_ref();
        if let Some(parent) = dest.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        path.persist(dest).map_err(|err| ApkZipError::Io(err.error))?;
        Ok(())
    }
}

fn size_u32(size: u64) -> ApkZipResult<u32> {
    u32::try_from(size).map_err(|_| {
        ApkZipError::InvalidInput("entry exceeds 4 GiB".to_string())
    })
}

fn name_flags(name: &str) -> u16 {
    if name.is_ascii() {
        0
    } else {
        FLAG_UTF8
    }
}

fn write_central_directory_entry(buf: &mut Vec<u8>, record: &CentralDirectoryRecord) {
    write_u32(buf, 0x02014b50);
    write_u16(buf, 0x031E);
    write_u16(buf, 20);
    write_u16(buf, record.flags);
    write_u16(buf, record.method);
    write_u16(buf, record.mod_time);
    write_u16(buf, record.mod_date);
    write_u32(buf, record.crc32);
    write_u32(buf, record.compressed_size);
    write_u32(buf, record.uncompressed_size);
    write_u16(buf, record.file_name.len() as u16);
    write_u16(buf, 0);
    write_u16(buf, 0);
    write_u16(buf, 0);
    let is_directory = record.file_name.last() == Some(&b'/');
    write_u16(buf, if is_directory { 0x10 } else { 0 });
    write_u32(buf, record.external_attrs);
    write_u32(buf, record.local_header_offset);
    buf.extend_from_slice(&record.file_name);
}

fn write_end_of_central_directory(
    buf: &mut Vec<u8>,
    entry_count: usize,
    central_size: u32,
    central_offset: u32,
) {
    write_u32(buf, 0x06054b50);
    write_u16(buf, 0);
    write_u16(buf, 0);
    write_u16(buf, entry_count as u16);
    write_u16(buf, entry_count as u16);
    write_u32(buf, central_size);
    write_u32(buf, central_offset);
    write_u16(buf, 0);
}

fn deflate_bytes(data: &[u8]) -> ApkZipResult<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn path_to_entry_name(path: &Path) -> ApkZipResult<String> {
    let mut components = Vec::new();
    for comp in path.components() {
        match comp {
            Component::Normal(part) => components.push(part.to_string_lossy().replace('\\', "/")),
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => {
                return Err(ApkZipError::InvalidInput(format!(
                    "invalid entry path component in {}",
                    path.display()
                )));
            }
            Component::ParentDir => {
                return Err(ApkZipError::InvalidInput(
                    "entry paths may not contain parent components".to_string(),
                ));
            }
        }
    }
    if components.is_empty() {
        return Err(ApkZipError::InvalidInput(
            "entry name must not be empty".to_string(),
        ));
    }
    Ok(components.join("/"))
}

fn normalize_entry_name(name: &str) -> ApkZipResult<String> {
    path_to_entry_name(Path::new(name))
}

fn write_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn write_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn alignment_padding(offset: u32, name_len: usize, alignment: u32) -> u32 {
    if alignment <= 1 {
        return 0;
    }
    let base = offset as u64 + 30 + name_len as u64;
    let align = alignment as u64;
    ((align - (base % align)) % align) as u32
}

fn classify_entry(name: &str) -> EntryPlan {
    let lower = name.to_ascii_lowercase();
    let compression = if should_store_uncompressed(&lower) {
        ApkCompression::Stored
    } else {
        ApkCompression::Deflated
    };
    let alignment = if compression == ApkCompression::Stored {
        if lower.starts_with("lib/") && lower.ends_with(".so") {
            Some(16 * 1024)
        } else {
            Some(4)
        }
    } else {
        None
    };
    EntryPlan {
        compression,
        alignment,
    }
}

fn should_store_uncompressed(name: &str) -> bool {
    name.ends_with(".arsc")
        || name.ends_with(".so")
        || matches!(
            name.rsplit('.').next(),
            Some("png" | "jpg" | "jpeg" | "gif" | "webp" | "mp3" | "ogg" | "wav" | "mp4" | "webm")
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use zip::write::{FileOptions, ZipWriter};

    fn source_apk(dir: &Path) -> PathBuf {
        let path = dir.join("in.apk");
        let mut zip = ZipWriter::new(File::create(&path).unwrap());
        let deflated = FileOptions::default().compression_method(zip::CompressionMethod::Deflated);
        let stored = FileOptions::default().compression_method(zip::CompressionMethod::Stored);
        zip.start_file("AndroidManifest.xml", deflated).unwrap();
        zip.write_all(b"manifest").unwrap();
        zip.start_file("res/raw/data.bin", deflated).unwrap();
        zip.write_all(&[7u8; 4096]).unwrap();
        zip.start_file("assets/\u{e9}t\u{e9}.txt", stored).unwrap();
        zip.write_all(b"summer").unwrap();
        zip.finish().unwrap();
        path
    }

    #[test]
    fn raw_copies_are_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let input = source_apk(dir.path());
        let mut reader = ApkReader::open(&input).unwrap();
        assert_eq!(reader.read_entry("AndroidManifest.xml").unwrap().unwrap(), b"manifest");
        assert!(reader.read_entry("missing").unwrap().is_none());

        let mut writer = ApkWriter::new_in(dir.path()).unwrap();
        writer.add_entry("classes.dex", b"dex\n035\0").unwrap();
        for idx in 1..reader.entry_names().len() {
            writer.copy_raw(&mut reader, idx).unwrap();
        }
        let out = dir.path().join("out.apk");
        writer.publish(&out).unwrap();

        let mut original = ZipArchive::new(File::open(&input).unwrap()).unwrap();
        let mut copied = ZipArchive::new(File::open(&out).unwrap()).unwrap();
        assert_eq!(copied.len(), 3);
        for name in ["res/raw/data.bin", "assets/\u{e9}t\u{e9}.txt"] {
            let mut a = original.by_name(name).unwrap();
            let mut b = copied.by_name(name).unwrap();
            assert_eq!(a.compression(), b.compression());
            assert_eq!(a.crc32(), b.crc32());
            let (mut x, mut y) = (vec![], vec![]);
            a.read_to_end(&mut x).unwrap();
            b.read_to_end(&mut y).unwrap();
            assert_eq!(x, y);
        }
    }

    #[test]
    fn native_libraries_are_page_aligned() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ApkWriter::new_in(dir.path()).unwrap();
        writer.add_entry("AndroidManifest.xml", b"m").unwrap();
        writer.add_entry("lib/arm64-v8a/libx.so", &[1u8; 100]).unwrap();
        let out = dir.path().join("out.apk");
        writer.publish(&out).unwrap();

        let bytes = fs::read(&out).unwrap();
        let mut archive = ZipArchive::new(Cursor::new(bytes)).unwrap();
        let lib = archive.by_name("lib/arm64-v8a/libx.so").unwrap();
        assert_eq!(lib.compression(), zip::CompressionMethod::Stored);
        assert_eq!(lib.data_start() % (16 * 1024), 0);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ApkWriter::new_in(dir.path()).unwrap();
        writer.add_entry("classes.dex", b"a").unwrap();
        assert!(writer.add_entry("classes.dex", b"b").is_err());
    }

    #[test]
    fn extracts_matching_entries() {
        let dir = tempfile::tempdir().unwrap();
        let input = source_apk(dir.path());
        let mut reader = ApkReader::open(&input).unwrap();
        let pattern = Regex::new(r"^res/").unwrap();
        let extracted = reader.extract_matching(&pattern, dir.path().join("x")).unwrap();
        assert_eq!(extracted.len(), 1);
        assert_eq!(fs::read(&extracted[0].1).unwrap(), vec![7u8; 4096]);
    }

    #[test]
    fn unpublished_archives_leave_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut writer = ApkWriter::new_in(dir.path()).unwrap();
            writer.add_entry("classes.dex", b"a").unwrap();
        }
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
