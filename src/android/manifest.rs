//! Just enough of a compiled `AndroidManifest.xml` reader to find the package
//! name, the application class and the minimum SDK level.

const RES_XML_TYPE: u16 = 0x0003;
const RES_STRING_POOL_TYPE: u16 = 0x0001;
const RES_XML_RESOURCE_MAP_TYPE: u16 = 0x0180;
const RES_XML_START_ELEMENT_TYPE: u16 = 0x0102;
const RES_XML_END_ELEMENT_TYPE: u16 = 0x0103;

const NO_ENTRY_INDEX: u32 = 0xFFFF_FFFF;
const STRING_FLAG_UTF8: u32 = 0x0000_0100;

pub const ANDROID_NAMESPACE_URI: &str = "http://schemas.android.com/apk/res/android";

/// `android:name`
const ATTR_NAME_ID: u32 = 0x0101_0003;
/// `android:minSdkVersion`
const ATTR_MIN_SDK_ID: u32 = 0x0101_020C;

const TYPE_STRING: u8 = 0x03;
const TYPE_INT_DEC: u8 = 0x10;
const TYPE_INT_HEX: u8 = 0x11;

pub type ManifestResult<T> = Result<T, ManifestError>;

/// Errors surfaced while decoding a binary manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestError {
    /// The document is missing the expected structure.
    MalformedDocument(String),
    /// The root `<manifest>` element has no `package` attribute.
    MissingPackage,
}

impl std::fmt::Display for ManifestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ManifestError::MalformedDocument(msg) => write!(f, "Malformed manifest: {msg}"),
            ManifestError::MissingPackage => write!(f, "Manifest declares no package"),
        }
    }
}

impl std::error::Error for ManifestError {}

fn malformed<T>(msg: &str) -> ManifestResult<T> {
    Err(ManifestError::MalformedDocument(msg.to_string()))
}

/// What the pipeline needs from the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ManifestInfo {
    pub package: String,
    /// Fully qualified `<application android:name>`, if any.
    pub application_class: Option<String>,
    pub min_sdk: Option<u32>,
}

impl ManifestInfo {
    pub fn from_bytes(data: &[u8]) -> ManifestResult<Self> {
        let mut reader = BinaryReader::new(data);
        let root = read_chunk_header(&mut reader)?;
        if root.chunk_type != RES_XML_TYPE {
            return malformed("missing XML chunk");
        }
        reader.seek(root.start + root.header_size as usize)?;

        let mut strings = StringPool::default();
        let mut resource_ids: Vec<u32> = Vec::new();
        let mut depth = 0usize;
        let mut package = None;
        let mut application = None;
        let mut min_sdk = None;

        while reader.position() < root.end() {
            let header = read_chunk_header(&mut reader)?;
            match header.chunk_type {
                RES_STRING_POOL_TYPE => {
                    strings = StringPool::parse(&mut reader, &header)?;
                }
                RES_XML_RESOURCE_MAP_TYPE => {
                    reader.seek(header.start + header.header_size as usize)?;
                    let count = (header.chunk_size as usize - header.header_size as usize) / 4;
                    resource_ids = (0..count)
                        .map(|_| reader.read_u32())
                        .collect::<ManifestResult<_>>()?;
                }
                RES_XML_START_ELEMENT_TYPE => {
                    reader.seek(header.start + header.header_size as usize)?;
                    let element = read_start_element(&mut reader, &strings, &resource_ids)?;
                    match (depth, element.name.as_str()) {
                        (0, "manifest") => {
                            package = element.attribute(None, "package", None).and_then(AttrValue::into_string);
                        }
                        (1, "application") => {
                            application = element
                                .attribute(Some(ANDROID_NAMESPACE_URI), "name", Some(ATTR_NAME_ID))
                                .and_then(AttrValue::into_string);
                        }
                        (1, "uses-sdk") => {
                            min_sdk = element
                                .attribute(Some(ANDROID_NAMESPACE_URI), "minSdkVersion", Some(ATTR_MIN_SDK_ID))
                                .and_then(AttrValue::into_int);
                        }
                        _ => {}
                    }
                    depth += 1;
                }
                RES_XML_END_ELEMENT_TYPE => {
                    depth = depth.saturating_sub(1);
                }
                _ => {}
            }
            reader.seek(header.end())?;
        }

        let package = package.filter(|p| !p.is_empty()).ok_or(ManifestError::MissingPackage)?;
        let application_class = application
            .filter(|name| !name.is_empty())
            .map(|name| qualify_class_name(&package, &name));
        Ok(ManifestInfo {
            package,
            application_class,
            min_sdk,
        })
    }
}

/// `.App` and bare `App` are relative to the package.
pub fn qualify_class_name(package: &str, name: &str) -> String {
    if name.starts_with('.') {
        format!("{package}{name}")
    } else if !name.contains('.') {
        format!("{package}.{name}")
    } else {
        name.to_string()
    }
}

struct ChunkHeader {
    chunk_type: u16,
    header_size: u16,
    chunk_size: u32,
    start: usize,
}

impl ChunkHeader {
    fn end(&self) -> usize {
        self.start + self.chunk_size as usize
    }
}

struct BinaryReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BinaryReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        BinaryReader { data, pos: 0 }
    }

    fn position(&self) -> usize {
        self.pos
    }

    fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    fn read_u16(&mut self) -> ManifestResult<u16> {
        if self.pos + 2 > self.data.len() {
            return malformed("Unexpected end of binary XML");
        }
        let value = u16::from_le_bytes([self.data[self.pos], self.data[self.pos + 1]]);
        self.pos += 2;
        Ok(value)
    }

    fn read_u32(&mut self) -> ManifestResult<u32> {
        if self.pos + 4 > self.data.len() {
            return malformed("Unexpected end of binary XML");
        }
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.data[self.pos..self.pos + 4]);
        self.pos += 4;
        Ok(u32::from_le_bytes(raw))
    }

    fn seek(&mut self, offset: usize) -> ManifestResult<()> {
        if offset > self.data.len() {
            return malformed("Attempted to seek past end of document");
        }
        self.pos = offset;
        Ok(())
    }
}

#[derive(Default)]
struct StringPool {
    strings: Vec<String>,
}

impl StringPool {
    fn parse(reader: &mut BinaryReader<'_>, header: &ChunkHeader) -> ManifestResult<Self> {
        // the pool fields sit inside the header, right after the chunk prefix
        reader.seek(header.start + 8)?;
        let string_count = reader.read_u32()? as usize;
        let _style_count = reader.read_u32()?;
        let flags = reader.read_u32()?;
        let strings_start = reader.read_u32()? as usize;
        let _styles_start = reader.read_u32()?;
        let is_utf8 = (flags & STRING_FLAG_UTF8) != 0;

        reader.seek(header.start + header.header_size as usize)?;
        let mut offsets = Vec::with_capacity(string_count.min(reader.remaining() / 4));
        for _ in 0..string_count {
            offsets.push(reader.read_u32()? as usize);
        }

        let base = header.start + strings_start;
        let limit = header.end();
        let strings = offsets
            .into_iter()
            .map(|offset| {
                if is_utf8 {
                    read_utf8_string(reader.data, base + offset, limit)
                } else {
                    read_utf16_string(reader.data, base + offset, limit)
                }
            })
            .collect::<ManifestResult<_>>()?;
        Ok(StringPool { strings })
    }

    fn get(&self, idx: u32) -> Option<&str> {
        if idx == NO_ENTRY_INDEX {
            return None;
        }
        self.strings.get(idx as usize).map(|s| s.as_str())
    }
}

fn read_utf8_string(data: &[u8], offset: usize, limit: usize) -> ManifestResult<String> {
    // character count, then byte count
    let (_, skip) = read_utf8_length(data, offset, limit)?;
    let (byte_len, len_size) = read_utf8_length(data, offset + skip, limit)?;
    let start = offset + skip + len_size;
    if start + byte_len > limit {
        return malformed("UTF-8 string exceeds chunk bounds");
    }
    std::str::from_utf8(&data[start..start + byte_len])
        .map(str::to_string)
        .map_err(|err| ManifestError::MalformedDocument(err.to_string()))
}

fn read_utf16_string(data: &[u8], offset: usize, limit: usize) -> ManifestResult<String> {
    let (char_count, header_bytes) = read_utf16_length(data, offset, limit)?;
    let start = offset + header_bytes;
    if start + char_count * 2 > limit {
        return malformed("UTF-16 string exceeds chunk bounds");
    }
    let units: Vec<u16> = data[start..start + char_count * 2]
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units).map_err(|err| ManifestError::MalformedDocument(err.to_string()))
}

fn read_utf8_length(data: &[u8], offset: usize, limit: usize) -> ManifestResult<(usize, usize)> {
    if offset >= limit {
        return malformed("Invalid UTF-8 length offset");
    }
    let first = data[offset];
    if (first & 0x80) == 0 {
        Ok((first as usize, 1))
    } else {
        if offset + 1 >= limit {
            return malformed("Truncated UTF-8 length");
        }
        Ok(((((first & 0x7F) as usize) << 8) | data[offset + 1] as usize, 2))
    }
}

fn read_utf16_length(data: &[u8], offset: usize, limit: usize) -> ManifestResult<(usize, usize)> {
    if offset + 2 > limit {
        return malformed("Invalid UTF-16 length offset");
    }
    let first = u16::from_le_bytes([data[offset], data[offset + 1]]);
    if (first & 0x8000) == 0 {
        Ok((first as usize, 2))
    } else {
        if offset + 4 > limit {
            return malformed("Truncated UTF-16 length");
        }
        let second = u16::from_le_bytes([data[offset + 2], data[offset + 3]]);
        Ok(((((first & 0x7FFF) as usize) << 16) | second as usize, 4))
    }
}

fn read_chunk_header(reader: &mut BinaryReader<'_>) -> ManifestResult<ChunkHeader> {
    let start = reader.position();
    if reader.remaining() < 8 {
        return malformed("Truncated binary XML chunk header");
    }
    let chunk_type = reader.read_u16()?;
    let header_size = reader.read_u16()?;
    let chunk_size = reader.read_u32()?;
    if chunk_size < header_size as u32 || header_size < 8 {
        return malformed("Invalid chunk sizing in binary XML");
    }
    match start.checked_add(chunk_size as usize) {
        Some(end) if end <= reader.data.len() => {}
        _ => return malformed("Chunk extends past end of document"),
    }
    Ok(ChunkHeader {
        chunk_type,
        header_size,
        chunk_size,
        start,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum AttrValue {
    String(String),
    Int(u32),
    Other,
}

impl AttrValue {
    fn into_string(self) -> Option<String> {
        match self {
            AttrValue::String(s) => Some(s),
            _ => None,
        }
    }

    fn into_int(self) -> Option<u32> {
        match self {
            AttrValue::Int(v) => Some(v),
            AttrValue::String(s) => s.trim().parse().ok(),
            AttrValue::Other => None,
        }
    }
}

struct Attribute {
    namespace: Option<String>,
    name: String,
    resource_id: Option<u32>,
    value: AttrValue,
}

struct StartElement {
    name: String,
    attributes: Vec<Attribute>,
}

impl StartElement {
    /// Match by resource id when the document carries one, since shrinkers
    /// are free to blank attribute names that resolve through the resource map.
    fn attribute(&self, namespace: Option<&str>, name: &str, resource_id: Option<u32>) -> Option<AttrValue> {
        self.attributes
            .iter()
            .find(|attr| match (resource_id, attr.resource_id) {
                (Some(want), Some(have)) => want == have,
                _ => attr.namespace.as_deref() == namespace && attr.name == name,
            })
            .map(|attr| attr.value.clone())
    }
}

fn read_start_element(
    reader: &mut BinaryReader<'_>,
    strings: &StringPool,
    resource_ids: &[u32],
) -> ManifestResult<StartElement> {
    let ext_start = reader.position();
    let _namespace = reader.read_u32()?;
    let name = strings.get(reader.read_u32()?).unwrap_or_default().to_string();
    let attribute_start = reader.read_u16()? as usize;
    let attribute_size = reader.read_u16()? as usize;
    let attribute_count = reader.read_u16()? as usize;
    if attribute_count > 0 && attribute_size < 20 {
        return malformed("Attribute records are too small");
    }

    let mut attributes = Vec::with_capacity(attribute_count);
    for i in 0..attribute_count {
        reader.seek(ext_start + attribute_start + i * attribute_size)?;
        let ns = reader.read_u32()?;
        let name_idx = reader.read_u32()?;
        let raw_value = reader.read_u32()?;
        let _size = reader.read_u16()?;
        let type_and_res0 = reader.read_u16()?;
        let data = reader.read_u32()?;
        attributes.push(Attribute {
            namespace: strings.get(ns).map(str::to_string),
            name: strings.get(name_idx).unwrap_or_default().to_string(),
            resource_id: resource_ids.get(name_idx as usize).copied().filter(|id| *id != 0),
            value: decode_value(strings, raw_value, (type_and_res0 >> 8) as u8, data)?,
        });
    }
    Ok(StartElement { name, attributes })
}

fn decode_value(strings: &StringPool, raw_value_idx: u32, data_type: u8, data: u32) -> ManifestResult<AttrValue> {
    if let Some(raw) = strings.get(raw_value_idx) {
        return Ok(AttrValue::String(raw.to_string()));
    }
    match data_type {
        TYPE_STRING => strings
            .get(data)
            .map(|s| AttrValue::String(s.to_string()))
            .ok_or_else(|| {
                ManifestError::MalformedDocument("String value references missing pool entry".to_string())
            }),
        TYPE_INT_DEC | TYPE_INT_HEX => Ok(AttrValue::Int(data)),
        _ => Ok(AttrValue::Other),
    }
}
