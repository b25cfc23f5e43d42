//! Decoding of a dex unit into the symbolic model.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use log::debug;

use crate::dex::error::{DexError, ResultExt};
use crate::dex::model::{
    AccessFlags, Annotation, CatchHandler, ClassDef, Code, DebugInfo, DebugOp, Field, FieldRef, InsnRef, Method, MethodRef, Proto,
    Reference, TryBlock, TypeAddrPair, Visibility,
};
use crate::dex::opcodes::{self, RefKind};
use crate::dex::values::{read_encoded_annotation, read_encoded_array, IdResolver};
use crate::dex::{read_sleb128, read_u1, read_u2, read_u4, read_uleb128, read_uleb128p1, read_x};

pub(crate) const NO_INDEX: u32 = 0xffff_ffff;
pub(crate) const ENDIAN_CONSTANT: u32 = 0x1234_5678;
pub(crate) const HEADER_SIZE: usize = 0x70;

/// The parts of the header needed to find the id tables.
#[derive(Debug, Clone, Default)]
pub(crate) struct Header
{
    pub version: u32,
    pub string_ids_size: u32,
    pub string_ids_off: u32,
    pub type_ids_size: u32,
    pub type_ids_off: u32,
    pub proto_ids_size: u32,
    pub proto_ids_off: u32,
    pub field_ids_size: u32,
    pub field_ids_off: u32,
    pub method_ids_size: u32,
    pub method_ids_off: u32,
    pub class_defs_size: u32,
    pub class_defs_off: u32,
}

impl Header
{
    pub fn read(bytes: &[u8]) -> Result<Header, DexError>
    {
        let mut ix = 0;
        let magic = read_x(bytes, &mut ix, 8)?;
        if &magic[0..4] != b"dex\n" || magic[7] != 0
        {
            fail!("Invalid magic value");
        }
        let digits = &magic[4..7];
        if !digits.iter().all(|d| d.is_ascii_digit())
        {
            fail!("Invalid dex version {:?}", digits);
        }
        let version = digits.iter().fold(0u32, |v, d| v * 10 + (d - b'0') as u32);

        ix = 40;
        let endian_tag = read_u4(bytes, &mut ix)?;
        if endian_tag != ENDIAN_CONSTANT
        {
            fail!("Unsupported endian tag 0x{:08x}", endian_tag);
        }

        ix = 56;
        let mut next = || read_u4(bytes, &mut ix);
        Ok(Header {
            version,
            string_ids_size: next()?,
            string_ids_off: next()?,
            type_ids_size: next()?,
            type_ids_off: next()?,
            proto_ids_size: next()?,
            proto_ids_off: next()?,
            field_ids_size: next()?,
            field_ids_off: next()?,
            method_ids_size: next()?,
            method_ids_off: next()?,
            class_defs_size: next()?,
            class_defs_off: next()?,
        })
    }
}

/// Read one string_data_item.
pub(crate) fn read_string_data(bytes: &[u8], ix: &mut usize) -> Result<String, DexError>
{
    let _utf16_size = read_uleb128(bytes, ix)?;
    let start = *ix;
    while read_u1(bytes, ix)? != 0 {}
    let raw = &bytes[start..*ix - 1];
    match cesu8::from_java_cesu8(raw)
    {
        Ok(s) => Ok(s.into_owned()),
        Err(_) => fail!("Invalid MUTF-8 string data at {}", start),
    }
}

fn string_at(bytes: &[u8], header: &Header, idx: u32) -> Result<String, DexError>
{
    if idx >= header.string_ids_size
    {
        fail!("string index {} out of range", idx);
    }
    let mut ix = header.string_ids_off as usize + idx as usize * 4;
    let mut off = read_u4(bytes, &mut ix)? as usize;
    read_string_data(bytes, &mut off)
}

fn type_at(bytes: &[u8], header: &Header, idx: u32) -> Result<String, DexError>
{
    if idx >= header.type_ids_size
    {
        fail!("type index {} out of range", idx);
    }
    let mut ix = header.type_ids_off as usize + idx as usize * 4;
    let string_idx = read_u4(bytes, &mut ix)?;
    string_at(bytes, header, string_idx)
}

fn read_type_list(bytes: &[u8], off: u32, ids: &IdTables) -> Result<Vec<String>, DexError>
{
    if off == 0
    {
        return Ok(vec![]);
    }
    let mut ix = off as usize;
    let size = read_u4(bytes, &mut ix)?;
    let mut types = Vec::with_capacity(size.min(4096) as usize);
    for _ in 0..size
    {
        types.push(ids.type_desc(read_u2(bytes, &mut ix)? as u32)?);
    }
    Ok(types)
}

/// The id tables of a unit, resolved to symbolic values.
struct IdTables
{
    strings: Vec<String>,
    types: Vec<String>,
    protos: Vec<Proto>,
    fields: Vec<FieldRef>,
    methods: Vec<MethodRef>,
}

fn lookup<'a, T>(table: &'a [T], idx: u32, what: &str) -> Result<&'a T, DexError>
{
    table.get(idx as usize).ok_or_else(|| err!("{} index {} out of range", what, idx))
}

impl IdResolver for IdTables
{
    fn string(&self, idx: u32) -> Result<String, DexError>
    {
        lookup(&self.strings, idx, "string").cloned()
    }

    fn type_desc(&self, idx: u32) -> Result<String, DexError>
    {
        lookup(&self.types, idx, "type").cloned()
    }

    fn proto(&self, idx: u32) -> Result<Proto, DexError>
    {
        lookup(&self.protos, idx, "proto").cloned()
    }

    fn field(&self, idx: u32) -> Result<FieldRef, DexError>
    {
        lookup(&self.fields, idx, "field").cloned()
    }

    fn method(&self, idx: u32) -> Result<MethodRef, DexError>
    {
        lookup(&self.methods, idx, "method").cloned()
    }
}

impl IdTables
{
    fn read(bytes: &[u8], header: &Header) -> Result<IdTables, DexError>
    {
        let mut ids = IdTables { strings: vec![], types: vec![], protos: vec![], fields: vec![], methods: vec![] };

        let mut ix = header.string_ids_off as usize;
        for _ in 0..header.string_ids_size
        {
            let mut off = read_u4(bytes, &mut ix)? as usize;
            ids.strings.push(read_string_data(bytes, &mut off)?);
        }

        ix = header.type_ids_off as usize;
        for _ in 0..header.type_ids_size
        {
            let idx = read_u4(bytes, &mut ix)?;
            let desc = ids.string(idx)?;
            ids.types.push(desc);
        }

        ix = header.proto_ids_off as usize;
        for _ in 0..header.proto_ids_size
        {
            let _shorty_idx = read_u4(bytes, &mut ix)?;
            let return_type = ids.type_desc(read_u4(bytes, &mut ix)?)?;
            let parameters = read_type_list(bytes, read_u4(bytes, &mut ix)?, &ids)?;
            ids.protos.push(Proto { return_type, parameters });
        }

        ix = header.field_ids_off as usize;
        for _ in 0..header.field_ids_size
        {
            let class = ids.type_desc(read_u2(bytes, &mut ix)? as u32)?;
            let ty = ids.type_desc(read_u2(bytes, &mut ix)? as u32)?;
            let name = ids.string(read_u4(bytes, &mut ix)?)?;
            ids.fields.push(FieldRef { class, name, ty });
        }

        ix = header.method_ids_off as usize;
        for _ in 0..header.method_ids_size
        {
            let class = ids.type_desc(read_u2(bytes, &mut ix)? as u32)?;
            let proto = ids.proto(read_u2(bytes, &mut ix)? as u32)?;
            let name = ids.string(read_u4(bytes, &mut ix)?)?;
            ids.methods.push(MethodRef { class, name, proto });
        }

        Ok(ids)
    }

    fn optional_string(&self, idx: Option<u32>) -> Result<Option<String>, DexError>
    {
        idx.map(|i| self.string(i)).transpose()
    }

    fn optional_type(&self, idx: Option<u32>) -> Result<Option<String>, DexError>
    {
        idx.map(|i| self.type_desc(i)).transpose()
    }
}

/// Descriptor and superclass of one class definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassEntry
{
    pub descriptor: String,
    pub superclass: Option<String>,
}

/// List the classes of a unit without decoding their contents.
pub fn class_table(bytes: &[u8]) -> Result<Vec<ClassEntry>, DexError>
{
    let header = Header::read(bytes)?;
    let mut entries = Vec::with_capacity(header.class_defs_size as usize);
    let mut ix = header.class_defs_off as usize;
    for _ in 0..header.class_defs_size
    {
        let start = ix;
        let class_idx = read_u4(bytes, &mut ix)?;
        let _access = read_u4(bytes, &mut ix)?;
        let superclass_idx = read_u4(bytes, &mut ix)?;
        ix = start + 32;

        let descriptor = type_at(bytes, &header, class_idx)?;
        let superclass = if superclass_idx == NO_INDEX { None } else { Some(type_at(bytes, &header, superclass_idx)?) };
        entries.push(ClassEntry { descriptor, superclass });
    }
    Ok(entries)
}

/// A decoded dex unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DexUnit
{
    /// Numeric version from the magic, e.g. 35 or 39.
    pub version: u32,
    pub classes: Vec<ClassDef>,
}

impl DexUnit
{
    pub fn from_bytes(bytes: &[u8]) -> Result<DexUnit, DexError>
    {
        let header = Header::read(bytes)?;
        let ids = IdTables::read(bytes, &header)?;

        let mut classes = Vec::with_capacity(header.class_defs_size as usize);
        let mut ix = header.class_defs_off as usize;
        for _ in 0..header.class_defs_size
        {
            let class = read_class_def(bytes, &mut ix, &ids)?;
            classes.push(class);
        }
        debug!("decoded dex {:03} with {} classes", header.version, classes.len());
        Ok(DexUnit { version: header.version, classes })
    }

    pub fn from_file(path: &Path) -> Result<DexUnit, DexError>
    {
        let bytes = fs::read(path).map_err(|e| DexError::new(&format!("io Error: {}", e)))?;
        DexUnit::from_bytes(&bytes).context(|| path.display().to_string())
    }

    pub fn class(&self, descriptor: &str) -> Option<&ClassDef>
    {
        self.classes.iter().find(|c| c.descriptor == descriptor)
    }

    pub fn class_table(&self) -> Vec<ClassEntry>
    {
        self.classes
            .iter()
            .map(|c| ClassEntry { descriptor: c.descriptor.clone(), superclass: c.superclass.clone() })
            .collect()
    }
}

#[derive(Default)]
struct AnnotationsDirectory
{
    class: Vec<Annotation>,
    fields: HashMap<u32, Vec<Annotation>>,
    methods: HashMap<u32, Vec<Annotation>>,
    parameters: HashMap<u32, Vec<Vec<Annotation>>>,
}

fn read_class_def(bytes: &[u8], ix: &mut usize, ids: &IdTables) -> Result<ClassDef, DexError>
{
    let class_idx = read_u4(bytes, ix)?;
    let access = read_u4(bytes, ix)?;
    let superclass_idx = read_u4(bytes, ix)?;
    let interfaces_off = read_u4(bytes, ix)?;
    let source_file_idx = read_u4(bytes, ix)?;
    let annotations_off = read_u4(bytes, ix)?;
    let class_data_off = read_u4(bytes, ix)?;
    let static_values_off = read_u4(bytes, ix)?;

    let descriptor = ids.type_desc(class_idx)?;
    let mut class = ClassDef::new(&descriptor, None, AccessFlags::from_bits_retain(access));
    (|| -> Result<(), DexError> {
        if superclass_idx != NO_INDEX
        {
            class.superclass = Some(ids.type_desc(superclass_idx)?);
        }
        class.interfaces = read_type_list(bytes, interfaces_off, ids)?;
        if source_file_idx != NO_INDEX
        {
            class.source_file = Some(ids.string(source_file_idx)?);
        }

        let mut directory = if annotations_off != 0 { read_annotations_directory(bytes, annotations_off, ids)? } else { Default::default() };
        class.annotations = std::mem::take(&mut directory.class);

        if class_data_off != 0
        {
            read_class_data(bytes, class_data_off, ids, &mut directory, &mut class)?;
        }
        if static_values_off != 0
        {
            let mut vix = static_values_off as usize;
            class.static_values = read_encoded_array(bytes, &mut vix, ids)?;
        }
        Ok(())
    })()
    .context(|| descriptor.clone())?;
    Ok(class)
}

fn read_annotation_set(bytes: &[u8], off: u32, ids: &IdTables) -> Result<Vec<Annotation>, DexError>
{
    if off == 0
    {
        return Ok(vec![]);
    }
    let mut ix = off as usize;
    let size = read_u4(bytes, &mut ix)?;
    let mut set = Vec::with_capacity(size.min(1024) as usize);
    for _ in 0..size
    {
        let mut aix = read_u4(bytes, &mut ix)? as usize;
        let vis = read_u1(bytes, &mut aix)?;
        let visibility = Visibility::from_u8(vis).ok_or_else(|| err!("Invalid annotation visibility {}", vis))?;
        let annotation = read_encoded_annotation(bytes, &mut aix, ids)?;
        set.push(Annotation { visibility, annotation });
    }
    Ok(set)
}

fn read_annotations_directory(bytes: &[u8], off: u32, ids: &IdTables) -> Result<AnnotationsDirectory, DexError>
{
    let mut ix = off as usize;
    let class_annotations_off = read_u4(bytes, &mut ix)?;
    let fields_size = read_u4(bytes, &mut ix)?;
    let methods_size = read_u4(bytes, &mut ix)?;
    let parameters_size = read_u4(bytes, &mut ix)?;

    let mut dir = AnnotationsDirectory { class: read_annotation_set(bytes, class_annotations_off, ids)?, ..Default::default() };
    for _ in 0..fields_size
    {
        let field_idx = read_u4(bytes, &mut ix)?;
        let set_off = read_u4(bytes, &mut ix)?;
        dir.fields.insert(field_idx, read_annotation_set(bytes, set_off, ids)?);
    }
    for _ in 0..methods_size
    {
        let method_idx = read_u4(bytes, &mut ix)?;
        let set_off = read_u4(bytes, &mut ix)?;
        dir.methods.insert(method_idx, read_annotation_set(bytes, set_off, ids)?);
    }
    for _ in 0..parameters_size
    {
        let method_idx = read_u4(bytes, &mut ix)?;
        let mut lix = read_u4(bytes, &mut ix)? as usize;
        let size = read_u4(bytes, &mut lix)?;
        let mut list = Vec::with_capacity(size.min(256) as usize);
        for _ in 0..size
        {
            list.push(read_annotation_set(bytes, read_u4(bytes, &mut lix)?, ids)?);
        }
        dir.parameters.insert(method_idx, list);
    }
    Ok(dir)
}

fn read_class_data(bytes: &[u8], off: u32, ids: &IdTables, directory: &mut AnnotationsDirectory, class: &mut ClassDef) -> Result<(), DexError>
{
    let mut ix = off as usize;
    let static_fields_size = read_uleb128(bytes, &mut ix)?;
    let instance_fields_size = read_uleb128(bytes, &mut ix)?;
    let direct_methods_size = read_uleb128(bytes, &mut ix)?;
    let virtual_methods_size = read_uleb128(bytes, &mut ix)?;

    let mut read_fields = |count: u32, ix: &mut usize| -> Result<Vec<Field>, DexError> {
        let mut fields = Vec::with_capacity(count.min(4096) as usize);
        let mut field_idx = 0u32;
        for _ in 0..count
        {
            field_idx = field_idx.wrapping_add(read_uleb128(bytes, ix)?);
            let access = AccessFlags::from_bits_retain(read_uleb128(bytes, ix)?);
            fields.push(Field {
                field: ids.field(field_idx)?,
                access,
                annotations: directory.fields.remove(&field_idx).unwrap_or_default(),
            });
        }
        Ok(fields)
    };
    class.static_fields = read_fields(static_fields_size, &mut ix)?;
    class.instance_fields = read_fields(instance_fields_size, &mut ix)?;

    let mut read_methods = |count: u32, ix: &mut usize| -> Result<Vec<Method>, DexError> {
        let mut methods = Vec::with_capacity(count.min(4096) as usize);
        let mut method_idx = 0u32;
        for _ in 0..count
        {
            method_idx = method_idx.wrapping_add(read_uleb128(bytes, ix)?);
            let access = AccessFlags::from_bits_retain(read_uleb128(bytes, ix)?);
            let code_off = read_uleb128(bytes, ix)?;
            let method_ref = ids.method(method_idx)?;
            let code = if code_off != 0
            {
                Some(read_code(bytes, code_off, ids).context(|| method_ref.to_string())?)
            }
            else
            {
                None
            };
            methods.push(Method {
                method: method_ref,
                access,
                code,
                annotations: directory.methods.remove(&method_idx).unwrap_or_default(),
                parameter_annotations: directory.parameters.remove(&method_idx).unwrap_or_default(),
            });
        }
        Ok(methods)
    };
    class.direct_methods = read_methods(direct_methods_size, &mut ix)?;
    class.virtual_methods = read_methods(virtual_methods_size, &mut ix)?;
    Ok(())
}

fn read_code(bytes: &[u8], off: u32, ids: &IdTables) -> Result<Code, DexError>
{
    let mut ix = off as usize;
    let registers_size = read_u2(bytes, &mut ix)?;
    let ins_size = read_u2(bytes, &mut ix)?;
    let outs_size = read_u2(bytes, &mut ix)?;
    let tries_size = read_u2(bytes, &mut ix)?;
    let debug_info_off = read_u4(bytes, &mut ix)?;
    let insns_size = read_u4(bytes, &mut ix)?;

    let mut insns = Vec::with_capacity(insns_size.min(1 << 20) as usize);
    for _ in 0..insns_size
    {
        insns.push(read_u2(bytes, &mut ix)?);
    }
    let refs = read_insn_refs(&insns, ids)?;

    let mut tries = Vec::with_capacity(tries_size as usize);
    if tries_size > 0
    {
        if insns_size % 2 == 1
        {
            read_u2(bytes, &mut ix)?;
        }
        let mut raw = Vec::with_capacity(tries_size as usize);
        for _ in 0..tries_size
        {
            let start_addr = read_u4(bytes, &mut ix)?;
            let insn_count = read_u2(bytes, &mut ix)?;
            let handler_off = read_u2(bytes, &mut ix)?;
            raw.push((start_addr, insn_count, handler_off));
        }
        let handlers_start = ix;
        for (start_addr, insn_count, handler_off) in raw
        {
            let mut hix = handlers_start + handler_off as usize;
            let handler = read_catch_handler(bytes, &mut hix, ids)?;
            tries.push(TryBlock { start_addr, insn_count, handler });
        }
    }

    let debug_info = if debug_info_off != 0 { Some(read_debug_info(bytes, debug_info_off, ids)?) } else { None };

    Ok(Code { registers_size, ins_size, outs_size, insns, refs, tries, debug_info })
}

/// Resolve the index operand of every referencing instruction.
fn read_insn_refs(insns: &[u16], ids: &IdTables) -> Result<Vec<InsnRef>, DexError>
{
    let mut refs = vec![];
    opcodes::walk(insns, |pc, info| {
        let unit = |i: usize| insns[pc + i] as u32;
        let target = match info.kind
        {
            RefKind::None => return Ok(()),
            RefKind::String => Reference::String(ids.string(unit(1))?),
            RefKind::StringJumbo => Reference::String(ids.string(unit(1) | (unit(2) << 16))?),
            RefKind::Type => Reference::Type(ids.type_desc(unit(1))?),
            RefKind::Field => Reference::Field(ids.field(unit(1))?),
            RefKind::Method => Reference::Method(ids.method(unit(1))?),
            RefKind::Proto => Reference::Proto(ids.proto(unit(1))?),
            RefKind::MethodAndProto =>
            {
                refs.push(InsnRef { pc: pc as u32, target: Reference::Method(ids.method(unit(1))?) });
                Reference::Proto(ids.proto(unit(3))?)
            }
            RefKind::CallSite => fail!("call sites are not supported (invoke-custom at {})", pc),
            RefKind::MethodHandle => fail!("method handles are not supported (const-method-handle at {})", pc),
        };
        refs.push(InsnRef { pc: pc as u32, target });
        Ok(())
    })?;
    Ok(refs)
}

fn read_catch_handler(bytes: &[u8], ix: &mut usize, ids: &IdTables) -> Result<CatchHandler, DexError>
{
    let size = read_sleb128(bytes, ix)?;
    let mut catches = Vec::with_capacity(size.unsigned_abs().min(256) as usize);
    for _ in 0..size.unsigned_abs()
    {
        let exception = ids.type_desc(read_uleb128(bytes, ix)?)?;
        let addr = read_uleb128(bytes, ix)?;
        catches.push(TypeAddrPair { exception, addr });
    }
    let catch_all = if size <= 0 { Some(read_uleb128(bytes, ix)?) } else { None };
    Ok(CatchHandler { catches, catch_all })
}

fn read_debug_info(bytes: &[u8], off: u32, ids: &IdTables) -> Result<DebugInfo, DexError>
{
    let mut ix = off as usize;
    let line_start = read_uleb128(bytes, &mut ix)?;
    let parameters_size = read_uleb128(bytes, &mut ix)?;
    let mut parameter_names = Vec::with_capacity(parameters_size.min(256) as usize);
    for _ in 0..parameters_size
    {
        parameter_names.push(ids.optional_string(read_uleb128p1(bytes, &mut ix)?)?);
    }

    let mut program = vec![];
    loop
    {
        let op = read_u1(bytes, &mut ix)?;
        let entry = match op
        {
            0x00 => break,
            0x01 => DebugOp::AdvancePc(read_uleb128(bytes, &mut ix)?),
            0x02 => DebugOp::AdvanceLine(read_sleb128(bytes, &mut ix)?),
            0x03 => DebugOp::StartLocal {
                register: read_uleb128(bytes, &mut ix)?,
                name: ids.optional_string(read_uleb128p1(bytes, &mut ix)?)?,
                ty: ids.optional_type(read_uleb128p1(bytes, &mut ix)?)?,
            },
            0x04 => DebugOp::StartLocalExtended {
                register: read_uleb128(bytes, &mut ix)?,
                name: ids.optional_string(read_uleb128p1(bytes, &mut ix)?)?,
                ty: ids.optional_type(read_uleb128p1(bytes, &mut ix)?)?,
                signature: ids.optional_string(read_uleb128p1(bytes, &mut ix)?)?,
            },
            0x05 => DebugOp::EndLocal(read_uleb128(bytes, &mut ix)?),
            0x06 => DebugOp::RestartLocal(read_uleb128(bytes, &mut ix)?),
            0x07 => DebugOp::PrologueEnd,
            0x08 => DebugOp::EpilogueBegin,
            0x09 => DebugOp::SetFile(ids.optional_string(read_uleb128p1(bytes, &mut ix)?)?),
            special => DebugOp::Special(special),
        };
        program.push(entry);
    }
    Ok(DebugInfo { line_start, parameter_names, program })
}
