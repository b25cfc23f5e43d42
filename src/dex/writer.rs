//! Encoding of a set of classes into a complete dex unit.
//!
//! Ids are collected from the classes themselves, sorted the way the format
//! requires and handed out fresh; instruction operands are patched from the
//! symbolic references carried by each [`Code`].

use std::collections::HashMap;

use adler::adler32_slice;
use log::debug;
use sha1::{Digest, Sha1};

use crate::dex::error::{DexError, ResultExt};
use crate::dex::model::{
    Annotation, CatchHandler, ClassDef, Code, DebugInfo, DebugOp, EncodedValue, Field, FieldRef, Method, MethodRef, Proto, Reference,
};
use crate::dex::opcodes::{self, RefKind};
use crate::dex::reader::{ENDIAN_CONSTANT, HEADER_SIZE, NO_INDEX};
use crate::dex::refs::{dex_string_cmp, RefSet};
use crate::dex::values::{write_encoded_annotation, write_encoded_array, IdIndexer};
use crate::dex::{align, write_sleb128, write_u1, write_u2, write_u4, write_uleb128, write_uleb128p1, write_x, MAX_TABLE_ENTRIES};

const TYPE_HEADER_ITEM: u16 = 0x0000;
const TYPE_STRING_ID_ITEM: u16 = 0x0001;
const TYPE_TYPE_ID_ITEM: u16 = 0x0002;
const TYPE_PROTO_ID_ITEM: u16 = 0x0003;
const TYPE_FIELD_ID_ITEM: u16 = 0x0004;
const TYPE_METHOD_ID_ITEM: u16 = 0x0005;
const TYPE_CLASS_DEF_ITEM: u16 = 0x0006;
const TYPE_MAP_LIST: u16 = 0x1000;
const TYPE_TYPE_LIST: u16 = 0x1001;
const TYPE_ANNOTATION_SET_REF_LIST: u16 = 0x1002;
const TYPE_ANNOTATION_SET_ITEM: u16 = 0x1003;
const TYPE_CLASS_DATA_ITEM: u16 = 0x2000;
const TYPE_CODE_ITEM: u16 = 0x2001;
const TYPE_STRING_DATA_ITEM: u16 = 0x2002;
const TYPE_DEBUG_INFO_ITEM: u16 = 0x2003;
const TYPE_ANNOTATION_ITEM: u16 = 0x2004;
const TYPE_ENCODED_ARRAY_ITEM: u16 = 0x2005;
const TYPE_ANNOTATIONS_DIRECTORY_ITEM: u16 = 0x2006;

/// Newest layout this writer produces; later versions use the container header.
const MAX_VERSION: u32 = 40;
const MIN_VERSION: u32 = 35;

#[derive(Debug)]
struct MapItem
{
    type_code: u16,
    size: u32,
    offset: u32,
}

/// Sorted id tables of the unit being written.
struct IdTables
{
    strings: Vec<String>,
    types: Vec<String>,
    protos: Vec<Proto>,
    fields: Vec<FieldRef>,
    methods: Vec<MethodRef>,
    string_ix: HashMap<String, u32>,
    type_ix: HashMap<String, u32>,
    proto_ix: HashMap<Proto, u32>,
    field_ix: HashMap<FieldRef, u32>,
    method_ix: HashMap<MethodRef, u32>,
}

fn index_of<T: std::hash::Hash + Eq>(items: &[T]) -> HashMap<T, u32>
where
    T: Clone,
{
    items.iter().enumerate().map(|(i, v)| (v.clone(), i as u32)).collect()
}

impl IdTables
{
    fn build(refs: RefSet) -> Result<IdTables, DexError>
    {
        let mut strings: Vec<String> = refs.strings.into_iter().collect();
        strings.sort_by(|a, b| dex_string_cmp(a, b));
        let string_ix = index_of(&strings);

        // type_ids are ordered by descriptor string index, i.e. by the descriptor itself
        let mut types: Vec<String> = refs.types.into_iter().collect();
        types.sort_by(|a, b| dex_string_cmp(a, b));
        let type_ix = index_of(&types);

        let mut ids = IdTables {
            strings,
            types,
            protos: vec![],
            fields: vec![],
            methods: vec![],
            string_ix,
            type_ix,
            proto_ix: HashMap::new(),
            field_ix: HashMap::new(),
            method_ix: HashMap::new(),
        };

        let mut protos = refs
            .protos
            .into_iter()
            .map(|p| -> Result<_, DexError> {
                let params = p.parameters.iter().map(|t| ids.type_idx(t)).collect::<Result<Vec<_>, _>>()?;
                Ok(((ids.type_idx(&p.return_type)?, params), p))
            })
            .collect::<Result<Vec<_>, DexError>>()?;
        protos.sort();
        ids.protos = protos.into_iter().map(|(_, p)| p).collect();
        ids.proto_ix = index_of(&ids.protos);

        let mut fields = refs
            .fields
            .into_iter()
            .map(|f| -> Result<_, DexError> { Ok(((ids.type_idx(&f.class)?, ids.string_idx(&f.name)?, ids.type_idx(&f.ty)?), f)) })
            .collect::<Result<Vec<_>, DexError>>()?;
        fields.sort();
        ids.fields = fields.into_iter().map(|(_, f)| f).collect();
        ids.field_ix = index_of(&ids.fields);

        let mut methods = refs
            .methods
            .into_iter()
            .map(|m| -> Result<_, DexError> { Ok(((ids.type_idx(&m.class)?, ids.string_idx(&m.name)?, ids.proto_idx(&m.proto)?), m)) })
            .collect::<Result<Vec<_>, DexError>>()?;
        methods.sort();
        ids.methods = methods.into_iter().map(|(_, m)| m).collect();
        ids.method_ix = index_of(&ids.methods);

        for (name, size) in [
            ("type", ids.types.len()),
            ("proto", ids.protos.len()),
            ("field", ids.fields.len()),
            ("method", ids.methods.len()),
        ]
        {
            if size as u32 > MAX_TABLE_ENTRIES
            {
                fail!("too many {} ids: {} exceeds {}", name, size, MAX_TABLE_ENTRIES);
            }
        }
        Ok(ids)
    }
}

impl IdIndexer for IdTables
{
    fn string_idx(&self, value: &str) -> Result<u32, DexError>
    {
        self.string_ix.get(value).copied().ok_or_else(|| err!("string {:?} is not in the id table", value))
    }

    fn type_idx(&self, descriptor: &str) -> Result<u32, DexError>
    {
        self.type_ix.get(descriptor).copied().ok_or_else(|| err!("type {} is not in the id table", descriptor))
    }

    fn proto_idx(&self, proto: &Proto) -> Result<u32, DexError>
    {
        self.proto_ix.get(proto).copied().ok_or_else(|| err!("proto {} is not in the id table", proto.descriptor()))
    }

    fn field_idx(&self, field: &FieldRef) -> Result<u32, DexError>
    {
        self.field_ix
            .get(field)
            .copied()
            .ok_or_else(|| err!("field {}->{}:{} is not in the id table", field.class, field.name, field.ty))
    }

    fn method_idx(&self, method: &MethodRef) -> Result<u32, DexError>
    {
        self.method_ix.get(method).copied().ok_or_else(|| err!("method {} is not in the id table", method))
    }
}

/// Members of one class keyed by their new ids, in class_data order.
struct ClassPlan<'a>
{
    class: &'a ClassDef,
    /// (field idx, position in `ClassDef::static_fields`, field)
    static_fields: Vec<(u32, usize, &'a Field)>,
    instance_fields: Vec<(u32, &'a Field)>,
    direct_methods: Vec<(u32, &'a Method)>,
    virtual_methods: Vec<(u32, &'a Method)>,
}

impl<'a> ClassPlan<'a>
{
    fn new(class: &'a ClassDef, ids: &IdTables) -> Result<ClassPlan<'a>, DexError>
    {
        let field_key = |f: &Field| -> Result<u32, DexError> {
            if f.field.class != class.descriptor
            {
                fail!("field {} is declared in {}", f.field.name, f.field.class);
            }
            ids.field_idx(&f.field)
        };
        let method_key = |m: &Method| -> Result<u32, DexError> {
            if m.method.class != class.descriptor
            {
                fail!("method {} is declared in {}", m.method, m.method.class);
            }
            ids.method_idx(&m.method)
        };

        let mut static_fields = Vec::with_capacity(class.static_fields.len());
        for (pos, f) in class.static_fields.iter().enumerate()
        {
            static_fields.push((field_key(f)?, pos, f));
        }
        static_fields.sort_by_key(|(idx, _, _)| *idx);

        let mut instance_fields = class.instance_fields.iter().map(|f| -> Result<_, DexError> { Ok((field_key(f)?, f)) }).collect::<Result<Vec<_>, DexError>>()?;
        instance_fields.sort_by_key(|(idx, _)| *idx);

        let mut direct_methods = class.direct_methods.iter().map(|m| -> Result<_, DexError> { Ok((method_key(m)?, m)) }).collect::<Result<Vec<_>, DexError>>()?;
        direct_methods.sort_by_key(|(idx, _)| *idx);

        let mut virtual_methods = class.virtual_methods.iter().map(|m| -> Result<_, DexError> { Ok((method_key(m)?, m)) }).collect::<Result<Vec<_>, DexError>>()?;
        virtual_methods.sort_by_key(|(idx, _)| *idx);

        let mut field_idxs: Vec<u32> = static_fields.iter().map(|(i, _, _)| *i).chain(instance_fields.iter().map(|(i, _)| *i)).collect();
        field_idxs.sort_unstable();
        if field_idxs.windows(2).any(|w| w[0] == w[1])
        {
            fail!("duplicate field definition");
        }
        let mut method_idxs: Vec<u32> = direct_methods.iter().chain(virtual_methods.iter()).map(|(i, _)| *i).collect();
        method_idxs.sort_unstable();
        if method_idxs.windows(2).any(|w| w[0] == w[1])
        {
            fail!("duplicate method definition");
        }

        Ok(ClassPlan { class, static_fields, instance_fields, direct_methods, virtual_methods })
    }

    fn methods(&self) -> impl Iterator<Item = &(u32, &'a Method)>
    {
        self.direct_methods.iter().chain(self.virtual_methods.iter())
    }

    fn is_empty(&self) -> bool
    {
        self.static_fields.is_empty() && self.instance_fields.is_empty() && self.direct_methods.is_empty() && self.virtual_methods.is_empty()
    }

    /// Static values in class_data order. Fields that moved ahead of an
    /// initialized one get their type's default value.
    fn static_values(&self) -> Vec<EncodedValue>
    {
        let explicit = &self.class.static_values;
        let last = self.static_fields.iter().rposition(|(_, pos, _)| *pos < explicit.len());
        match last
        {
            None => vec![],
            Some(last) => self.static_fields[..=last]
                .iter()
                .map(|(_, pos, f)| explicit.get(*pos).cloned().unwrap_or_else(|| default_value(&f.field.ty)))
                .collect(),
        }
    }
}

fn default_value(ty: &str) -> EncodedValue
{
    match ty.as_bytes().first()
    {
        Some(b'Z') => EncodedValue::Boolean(false),
        Some(b'B') => EncodedValue::Byte(0),
        Some(b'S') => EncodedValue::Short(0),
        Some(b'C') => EncodedValue::Char(0),
        Some(b'I') => EncodedValue::Int(0),
        Some(b'J') => EncodedValue::Long(0),
        Some(b'F') => EncodedValue::Float(0),
        Some(b'D') => EncodedValue::Double(0),
        _ => EncodedValue::Null,
    }
}

/// Order classes so that every superclass and interface defined in the
/// unit comes before its subclasses.
fn order_classes(classes: &[ClassDef]) -> Result<Vec<&ClassDef>, DexError>
{
    let mut by_desc: HashMap<&str, &ClassDef> = HashMap::with_capacity(classes.len());
    for c in classes
    {
        if by_desc.insert(c.descriptor.as_str(), c).is_some()
        {
            fail!("duplicate class definition {}", c.descriptor);
        }
    }

    fn visit<'a>(
        class: &'a ClassDef,
        by_desc: &HashMap<&str, &'a ClassDef>,
        done: &mut HashMap<&'a str, bool>,
        out: &mut Vec<&'a ClassDef>,
    ) -> Result<(), DexError>
    {
        match done.get(class.descriptor.as_str())
        {
            Some(true) => return Ok(()),
            Some(false) => fail!("class hierarchy cycle through {}", class.descriptor),
            None => {}
        }
        done.insert(class.descriptor.as_str(), false);
        for parent in class.superclass.iter().chain(class.interfaces.iter())
        {
            if let Some(p) = by_desc.get(parent.as_str())
            {
                visit(p, by_desc, done, out)?;
            }
        }
        done.insert(class.descriptor.as_str(), true);
        out.push(class);
        Ok(())
    }

    let mut done = HashMap::with_capacity(classes.len());
    let mut out = Vec::with_capacity(classes.len());
    for c in classes
    {
        visit(c, &by_desc, &mut done, &mut out)?;
    }
    Ok(out)
}

/// Patch every index operand of `code` with the ids of this unit.
fn patch_insns(code: &Code, ids: &IdTables) -> Result<Vec<u16>, DexError>
{
    let mut by_pc: HashMap<u32, Vec<&Reference>> = HashMap::new();
    for r in &code.refs
    {
        by_pc.entry(r.pc).or_default().push(&r.target);
    }

    let mut insns = code.insns.clone();
    let mut patched = 0;
    opcodes::walk(&code.insns, |pc, info| {
        if info.kind == RefKind::None
        {
            return Ok(());
        }
        let targets = by_pc.get(&(pc as u32)).ok_or_else(|| err!("missing reference for instruction at {}", pc))?;
        for &target in targets.iter()
        {
            match (info.kind, target)
            {
                (RefKind::String, Reference::String(s)) =>
                {
                    let idx = ids.string_idx(s)?;
                    if idx > 0xffff
                    {
                        fail!("string index {} does not fit const-string at {}", idx, pc);
                    }
                    insns[pc + 1] = idx as u16;
                }
                (RefKind::StringJumbo, Reference::String(s)) =>
                {
                    let idx = ids.string_idx(s)?;
                    insns[pc + 1] = idx as u16;
                    insns[pc + 2] = (idx >> 16) as u16;
                }
                (RefKind::Type, Reference::Type(t)) => insns[pc + 1] = ids.type_idx(t)? as u16,
                (RefKind::Field, Reference::Field(f)) => insns[pc + 1] = ids.field_idx(f)? as u16,
                (RefKind::Method | RefKind::MethodAndProto, Reference::Method(m)) => insns[pc + 1] = ids.method_idx(m)? as u16,
                (RefKind::Proto, Reference::Proto(p)) => insns[pc + 1] = ids.proto_idx(p)? as u16,
                (RefKind::MethodAndProto, Reference::Proto(p)) => insns[pc + 3] = ids.proto_idx(p)? as u16,
                _ => fail!("reference {:?} does not match the instruction at {}", target, pc),
            }
            patched += 1;
        }
        Ok(())
    })?;
    if patched != code.refs.len()
    {
        fail!("{} references do not point at an instruction", code.refs.len() - patched);
    }
    Ok(insns)
}

fn optional_string_idx(ids: &IdTables, s: &Option<String>) -> Result<Option<u32>, DexError>
{
    s.as_deref().map(|v| ids.string_idx(v)).transpose()
}

fn optional_type_idx(ids: &IdTables, t: &Option<String>) -> Result<Option<u32>, DexError>
{
    t.as_deref().map(|v| ids.type_idx(v)).transpose()
}

fn write_debug_info(buffer: &mut Vec<u8>, info: &DebugInfo, ids: &IdTables) -> Result<(), DexError>
{
    write_uleb128(buffer, info.line_start);
    write_uleb128(buffer, info.parameter_names.len() as u32);
    for name in &info.parameter_names
    {
        write_uleb128p1(buffer, optional_string_idx(ids, name)?);
    }
    for op in &info.program
    {
        match op
        {
            DebugOp::AdvancePc(addr) =>
            {
                write_u1(buffer, 0x01);
                write_uleb128(buffer, *addr);
            }
            DebugOp::AdvanceLine(line) =>
            {
                write_u1(buffer, 0x02);
                write_sleb128(buffer, *line);
            }
            DebugOp::StartLocal { register, name, ty } =>
            {
                write_u1(buffer, 0x03);
                write_uleb128(buffer, *register);
                write_uleb128p1(buffer, optional_string_idx(ids, name)?);
                write_uleb128p1(buffer, optional_type_idx(ids, ty)?);
            }
            DebugOp::StartLocalExtended { register, name, ty, signature } =>
            {
                write_u1(buffer, 0x04);
                write_uleb128(buffer, *register);
                write_uleb128p1(buffer, optional_string_idx(ids, name)?);
                write_uleb128p1(buffer, optional_type_idx(ids, ty)?);
                write_uleb128p1(buffer, optional_string_idx(ids, signature)?);
            }
            DebugOp::EndLocal(register) =>
            {
                write_u1(buffer, 0x05);
                write_uleb128(buffer, *register);
            }
            DebugOp::RestartLocal(register) =>
            {
                write_u1(buffer, 0x06);
                write_uleb128(buffer, *register);
            }
            DebugOp::PrologueEnd =>
            {
                write_u1(buffer, 0x07);
            }
            DebugOp::EpilogueBegin =>
            {
                write_u1(buffer, 0x08);
            }
            DebugOp::SetFile(name) =>
            {
                write_u1(buffer, 0x09);
                write_uleb128p1(buffer, optional_string_idx(ids, name)?);
            }
            DebugOp::Special(op) =>
            {
                if *op < 0x0a
                {
                    fail!("0x{:02x} is not a special debug opcode", op);
                }
                write_u1(buffer, *op);
            }
        }
    }
    write_u1(buffer, 0x00);
    Ok(())
}

fn write_catch_handler(buffer: &mut Vec<u8>, handler: &CatchHandler, ids: &IdTables) -> Result<(), DexError>
{
    let size = handler.catches.len() as i32;
    write_sleb128(buffer, if handler.catch_all.is_some() { -size } else { size });
    for pair in &handler.catches
    {
        write_uleb128(buffer, ids.type_idx(&pair.exception)?);
        write_uleb128(buffer, pair.addr);
    }
    if let Some(addr) = handler.catch_all
    {
        write_uleb128(buffer, addr);
    }
    Ok(())
}

/// Accumulates the file; id sections are reserved up front and filled last.
struct DexWriter<'a>
{
    buf: Vec<u8>,
    ids: &'a IdTables,
    map: Vec<MapItem>,
}

impl<'a> DexWriter<'a>
{
    fn pos(&self) -> u32
    {
        self.buf.len() as u32
    }

    fn record(&mut self, type_code: u16, size: u32, offset: u32)
    {
        if size > 0
        {
            self.map.push(MapItem { type_code, size, offset });
        }
    }

    fn put_u2(&mut self, at: usize, v: u16)
    {
        self.buf[at..at + 2].copy_from_slice(&v.to_le_bytes());
    }

    fn put_u4(&mut self, at: usize, v: u32)
    {
        self.buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
    }

    fn string_data(&mut self) -> Vec<u32>
    {
        let start = self.pos();
        let mut offsets = Vec::with_capacity(self.ids.strings.len());
        for s in &self.ids.strings
        {
            offsets.push(self.pos());
            write_uleb128(&mut self.buf, s.encode_utf16().count() as u32);
            write_x(&mut self.buf, &cesu8::to_java_cesu8(s));
            write_u1(&mut self.buf, 0);
        }
        self.record(TYPE_STRING_DATA_ITEM, offsets.len() as u32, start);
        offsets
    }

    fn type_lists(&mut self, plans: &[ClassPlan]) -> Result<HashMap<Vec<u32>, u32>, DexError>
    {
        let mut lists: Vec<Vec<u32>> = vec![];
        for p in &self.ids.protos
        {
            lists.push(p.parameters.iter().map(|t| self.ids.type_idx(t)).collect::<Result<_, _>>()?);
        }
        for plan in plans
        {
            lists.push(plan.class.interfaces.iter().map(|t| self.ids.type_idx(t)).collect::<Result<_, _>>()?);
        }

        align(&mut self.buf, 4);
        let start = self.pos();
        let mut offsets = HashMap::new();
        for list in lists
        {
            if list.is_empty() || offsets.contains_key(&list)
            {
                continue;
            }
            align(&mut self.buf, 4);
            let off = self.pos();
            write_u4(&mut self.buf, list.len() as u32);
            for t in &list
            {
                write_u2(&mut self.buf, *t as u16);
            }
            offsets.insert(list, off);
        }
        self.record(TYPE_TYPE_LIST, offsets.len() as u32, start);
        Ok(offsets)
    }

    fn annotation_item_bytes(&self, a: &Annotation) -> Result<Vec<u8>, DexError>
    {
        let mut bytes = vec![];
        write_u1(&mut bytes, a.visibility.to_u8());
        write_encoded_annotation(&mut bytes, &a.annotation, self.ids)?;
        Ok(bytes)
    }

    /// Writes annotation items, sets, set ref lists and directories.
    /// Returns the directory offset of each class, 0 when it has none.
    fn annotations(&mut self, plans: &[ClassPlan]) -> Result<Vec<u32>, DexError>
    {
        let mut sets: Vec<&[Annotation]> = vec![];
        for plan in plans
        {
            sets.push(&plan.class.annotations);
            sets.extend(plan.class.fields().map(|f| f.annotations.as_slice()));
            for m in plan.class.methods()
            {
                sets.push(&m.annotations);
                sets.extend(m.parameter_annotations.iter().map(|p| p.as_slice()));
            }
        }

        // annotation_item
        let start = self.pos();
        let mut items: HashMap<Vec<u8>, u32> = HashMap::new();
        for set in &sets
        {
            for a in set.iter()
            {
                let bytes = self.annotation_item_bytes(a)?;
                if !items.contains_key(&bytes)
                {
                    let off = self.pos();
                    write_x(&mut self.buf, &bytes);
                    items.insert(bytes, off);
                }
            }
        }
        self.record(TYPE_ANNOTATION_ITEM, items.len() as u32, start);

        // annotation_set_item, entries sorted by type
        let set_key = |this: &Self, set: &[Annotation]| -> Result<Vec<u32>, DexError> {
            let mut entries = Vec::with_capacity(set.len());
            for a in set
            {
                let off = items.get(&this.annotation_item_bytes(a)?).copied().ok_or_else(|| err!("annotation item missing"))?;
                entries.push((this.ids.type_idx(&a.annotation.ty)?, off));
            }
            entries.sort();
            Ok(entries.into_iter().map(|(_, off)| off).collect())
        };
        align(&mut self.buf, 4);
        let start = self.pos();
        let mut set_offsets: HashMap<Vec<u32>, u32> = HashMap::new();
        for set in sets.iter().filter(|s| !s.is_empty())
        {
            let key = set_key(self, set)?;
            if !set_offsets.contains_key(&key)
            {
                let off = self.pos();
                write_u4(&mut self.buf, key.len() as u32);
                for entry in &key
                {
                    write_u4(&mut self.buf, *entry);
                }
                set_offsets.insert(key, off);
            }
        }
        self.record(TYPE_ANNOTATION_SET_ITEM, set_offsets.len() as u32, start);

        let set_off = |this: &Self, set: &[Annotation]| -> Result<u32, DexError> {
            if set.is_empty()
            {
                return Ok(0);
            }
            let key = set_key(this, set)?;
            set_offsets.get(&key).copied().ok_or_else(|| err!("annotation set missing"))
        };

        // annotation_set_ref_list
        let start = self.pos();
        let mut ref_lists: HashMap<Vec<u32>, u32> = HashMap::new();
        let mut ref_list_of: HashMap<&MethodRef, u32> = HashMap::new();
        for plan in plans
        {
            for (_, m) in plan.methods()
            {
                if m.parameter_annotations.iter().all(|p| p.is_empty())
                {
                    continue;
                }
                let key = m.parameter_annotations.iter().map(|p| set_off(self, p)).collect::<Result<Vec<u32>, _>>()?;
                let off = match ref_lists.get(&key)
                {
                    Some(off) => *off,
                    None =>
                    {
                        let off = self.pos();
                        write_u4(&mut self.buf, key.len() as u32);
                        for entry in &key
                        {
                            write_u4(&mut self.buf, *entry);
                        }
                        ref_lists.insert(key, off);
                        off
                    }
                };
                ref_list_of.insert(&m.method, off);
            }
        }
        self.record(TYPE_ANNOTATION_SET_REF_LIST, ref_lists.len() as u32, start);

        // annotations_directory_item
        let start = self.pos();
        let mut directories = Vec::with_capacity(plans.len());
        let mut count = 0;
        for plan in plans
        {
            let class_off = set_off(self, &plan.class.annotations)?;
            let mut fields = vec![];
            for (idx, f) in plan.static_fields.iter().map(|(i, _, f)| (*i, *f)).chain(plan.instance_fields.iter().copied())
            {
                if !f.annotations.is_empty()
                {
                    fields.push((idx, set_off(self, &f.annotations)?));
                }
            }
            fields.sort();
            let mut methods = vec![];
            let mut parameters = vec![];
            for (idx, m) in plan.methods()
            {
                if !m.annotations.is_empty()
                {
                    methods.push((*idx, set_off(self, &m.annotations)?));
                }
                if let Some(off) = ref_list_of.get(&m.method)
                {
                    parameters.push((*idx, *off));
                }
            }
            methods.sort();
            parameters.sort();

            if class_off == 0 && fields.is_empty() && methods.is_empty() && parameters.is_empty()
            {
                directories.push(0);
                continue;
            }
            let off = self.pos();
            write_u4(&mut self.buf, class_off);
            write_u4(&mut self.buf, fields.len() as u32);
            write_u4(&mut self.buf, methods.len() as u32);
            write_u4(&mut self.buf, parameters.len() as u32);
            for (idx, entry) in fields.iter().chain(methods.iter()).chain(parameters.iter())
            {
                write_u4(&mut self.buf, *idx);
                write_u4(&mut self.buf, *entry);
            }
            directories.push(off);
            count += 1;
        }
        self.record(TYPE_ANNOTATIONS_DIRECTORY_ITEM, count, start);
        Ok(directories)
    }

    fn debug_infos(&mut self, plans: &[ClassPlan]) -> Result<HashMap<u32, u32>, DexError>
    {
        let start = self.pos();
        let mut offsets = HashMap::new();
        for plan in plans
        {
            for (idx, m) in plan.methods()
            {
                if let Some(info) = m.code.as_ref().and_then(|c| c.debug_info.as_ref())
                {
                    offsets.insert(*idx, self.pos());
                    write_debug_info(&mut self.buf, info, self.ids).context(|| m.method.to_string())?;
                }
            }
        }
        self.record(TYPE_DEBUG_INFO_ITEM, offsets.len() as u32, start);
        Ok(offsets)
    }

    fn code_items(&mut self, plans: &[ClassPlan], debug: &HashMap<u32, u32>) -> Result<HashMap<u32, u32>, DexError>
    {
        align(&mut self.buf, 4);
        let start = self.pos();
        let mut offsets = HashMap::new();
        for plan in plans
        {
            for (idx, m) in plan.methods()
            {
                if let Some(code) = &m.code
                {
                    let off = self.code_item(code, debug.get(idx).copied().unwrap_or(0)).context(|| m.method.to_string())?;
                    offsets.insert(*idx, off);
                }
            }
        }
        self.record(TYPE_CODE_ITEM, offsets.len() as u32, start);
        Ok(offsets)
    }

    fn code_item(&mut self, code: &Code, debug_info_off: u32) -> Result<u32, DexError>
    {
        if code.tries.len() > 0xffff
        {
            fail!("too many try blocks");
        }
        let insns = patch_insns(code, self.ids)?;

        align(&mut self.buf, 4);
        let off = self.pos();
        write_u2(&mut self.buf, code.registers_size);
        write_u2(&mut self.buf, code.ins_size);
        write_u2(&mut self.buf, code.outs_size);
        write_u2(&mut self.buf, code.tries.len() as u16);
        write_u4(&mut self.buf, debug_info_off);
        write_u4(&mut self.buf, insns.len() as u32);
        for unit in &insns
        {
            write_u2(&mut self.buf, *unit);
        }
        if code.tries.is_empty()
        {
            return Ok(off);
        }
        if insns.len() % 2 == 1
        {
            write_u2(&mut self.buf, 0);
        }

        let mut handlers: Vec<&CatchHandler> = vec![];
        let mut which = Vec::with_capacity(code.tries.len());
        for t in &code.tries
        {
            let i = match handlers.iter().position(|h| **h == t.handler)
            {
                Some(i) => i,
                None =>
                {
                    handlers.push(&t.handler);
                    handlers.len() - 1
                }
            };
            which.push(i);
        }
        let mut list = vec![];
        write_uleb128(&mut list, handlers.len() as u32);
        let mut handler_offs = Vec::with_capacity(handlers.len());
        for h in &handlers
        {
            handler_offs.push(list.len());
            write_catch_handler(&mut list, h, self.ids)?;
        }

        for (t, i) in code.tries.iter().zip(which)
        {
            let handler_off = handler_offs[i];
            if handler_off > 0xffff
            {
                fail!("catch handler list too large");
            }
            write_u4(&mut self.buf, t.start_addr);
            write_u2(&mut self.buf, t.insn_count);
            write_u2(&mut self.buf, handler_off as u16);
        }
        write_x(&mut self.buf, &list);
        Ok(off)
    }

    fn static_values(&mut self, plans: &[ClassPlan]) -> Result<Vec<u32>, DexError>
    {
        let start = self.pos();
        let mut offsets = Vec::with_capacity(plans.len());
        let mut count = 0;
        for plan in plans
        {
            let values = plan.static_values();
            if values.is_empty()
            {
                offsets.push(0);
                continue;
            }
            offsets.push(self.pos());
            write_encoded_array(&mut self.buf, &values, self.ids).context(|| plan.class.descriptor.clone())?;
            count += 1;
        }
        self.record(TYPE_ENCODED_ARRAY_ITEM, count, start);
        Ok(offsets)
    }

    fn class_data(&mut self, plans: &[ClassPlan], code: &HashMap<u32, u32>) -> Vec<u32>
    {
        let start = self.pos();
        let mut offsets = Vec::with_capacity(plans.len());
        let mut count = 0;
        for plan in plans
        {
            if plan.is_empty()
            {
                offsets.push(0);
                continue;
            }
            offsets.push(self.pos());
            count += 1;
            let buf = &mut self.buf;
            write_uleb128(buf, plan.static_fields.len() as u32);
            write_uleb128(buf, plan.instance_fields.len() as u32);
            write_uleb128(buf, plan.direct_methods.len() as u32);
            write_uleb128(buf, plan.virtual_methods.len() as u32);

            write_encoded_fields(buf, plan.static_fields.iter().map(|(i, _, f)| (*i, *f)));
            write_encoded_fields(buf, plan.instance_fields.iter().copied());

            for list in [&plan.direct_methods, &plan.virtual_methods]
            {
                let mut prev = 0;
                for (idx, m) in list
                {
                    write_uleb128(buf, idx - prev);
                    write_uleb128(buf, m.access.bits());
                    write_uleb128(buf, code.get(idx).copied().unwrap_or(0));
                    prev = *idx;
                }
            }
        }
        self.record(TYPE_CLASS_DATA_ITEM, count, start);
        offsets
    }

    fn map_list(&mut self) -> u32
    {
        align(&mut self.buf, 4);
        let off = self.pos();
        self.record(TYPE_MAP_LIST, 1, off);
        self.map.sort_by_key(|item| item.offset);
        write_u4(&mut self.buf, self.map.len() as u32);
        for item in &self.map
        {
            write_u2(&mut self.buf, item.type_code);
            write_u2(&mut self.buf, 0);
            write_u4(&mut self.buf, item.size);
            write_u4(&mut self.buf, item.offset);
        }
        off
    }
}

fn write_encoded_fields<'f>(buf: &mut Vec<u8>, fields: impl Iterator<Item = (u32, &'f Field)>)
{
    let mut prev = 0;
    for (idx, f) in fields
    {
        write_uleb128(buf, idx - prev);
        write_uleb128(buf, f.access.bits());
        prev = idx;
    }
}

fn compute_sha1(data: &[u8]) -> [u8; 20]
{
    let mut hasher = Sha1::new();
    hasher.update(data);
    let digest = hasher.finalize();
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest);
    out
}

/// Write `classes` as a dex unit of the given version (clamped to 035..=040).
pub fn write_dex(classes: &[ClassDef], version: u32) -> Result<Vec<u8>, DexError>
{
    let ordered = order_classes(classes)?;
    let mut refs = RefSet::default();
    for c in &ordered
    {
        c.collect_references(&mut refs);
    }
    let ids = IdTables::build(refs)?;
    let plans = ordered
        .iter()
        .map(|c| ClassPlan::new(c, &ids).context(|| c.descriptor.clone()))
        .collect::<Result<Vec<_>, DexError>>()?;

    let string_ids_off = HEADER_SIZE;
    let type_ids_off = string_ids_off + 4 * ids.strings.len();
    let proto_ids_off = type_ids_off + 4 * ids.types.len();
    let field_ids_off = proto_ids_off + 12 * ids.protos.len();
    let method_ids_off = field_ids_off + 8 * ids.fields.len();
    let class_defs_off = method_ids_off + 8 * ids.methods.len();
    let data_off = class_defs_off + 32 * plans.len();

    let mut w = DexWriter { buf: vec![0u8; data_off], ids: &ids, map: vec![] };
    w.record(TYPE_HEADER_ITEM, 1, 0);
    w.record(TYPE_STRING_ID_ITEM, ids.strings.len() as u32, string_ids_off as u32);
    w.record(TYPE_TYPE_ID_ITEM, ids.types.len() as u32, type_ids_off as u32);
    w.record(TYPE_PROTO_ID_ITEM, ids.protos.len() as u32, proto_ids_off as u32);
    w.record(TYPE_FIELD_ID_ITEM, ids.fields.len() as u32, field_ids_off as u32);
    w.record(TYPE_METHOD_ID_ITEM, ids.methods.len() as u32, method_ids_off as u32);
    w.record(TYPE_CLASS_DEF_ITEM, plans.len() as u32, class_defs_off as u32);

    let string_offs = w.string_data();
    let type_lists = w.type_lists(&plans)?;
    let directories = w.annotations(&plans)?;
    let debug = w.debug_infos(&plans)?;
    let code = w.code_items(&plans, &debug)?;
    let static_values = w.static_values(&plans)?;
    let class_data = w.class_data(&plans, &code);
    let map_off = w.map_list();

    let list_off = |types: &[String]| -> Result<u32, DexError> {
        if types.is_empty()
        {
            return Ok(0);
        }
        let key = types.iter().map(|t| ids.type_idx(t)).collect::<Result<Vec<_>, _>>()?;
        type_lists.get(&key).copied().ok_or_else(|| err!("type list missing"))
    };

    for (i, off) in string_offs.iter().enumerate()
    {
        w.put_u4(string_ids_off + 4 * i, *off);
    }
    for (i, t) in ids.types.iter().enumerate()
    {
        w.put_u4(type_ids_off + 4 * i, ids.string_idx(t)?);
    }
    for (i, p) in ids.protos.iter().enumerate()
    {
        let at = proto_ids_off + 12 * i;
        w.put_u4(at, ids.string_idx(&p.shorty())?);
        w.put_u4(at + 4, ids.type_idx(&p.return_type)?);
        w.put_u4(at + 8, list_off(&p.parameters)?);
    }
    for (i, f) in ids.fields.iter().enumerate()
    {
        let at = field_ids_off + 8 * i;
        w.put_u2(at, ids.type_idx(&f.class)? as u16);
        w.put_u2(at + 2, ids.type_idx(&f.ty)? as u16);
        w.put_u4(at + 4, ids.string_idx(&f.name)?);
    }
    for (i, m) in ids.methods.iter().enumerate()
    {
        let at = method_ids_off + 8 * i;
        w.put_u2(at, ids.type_idx(&m.class)? as u16);
        w.put_u2(at + 2, ids.proto_idx(&m.proto)? as u16);
        w.put_u4(at + 4, ids.string_idx(&m.name)?);
    }
    for (i, plan) in plans.iter().enumerate()
    {
        let at = class_defs_off + 32 * i;
        let class = plan.class;
        w.put_u4(at, ids.type_idx(&class.descriptor)?);
        w.put_u4(at + 4, class.access.bits());
        w.put_u4(at + 8, optional_type_idx(&ids, &class.superclass)?.unwrap_or(NO_INDEX));
        w.put_u4(at + 12, list_off(&class.interfaces)?);
        w.put_u4(at + 16, optional_string_idx(&ids, &class.source_file)?.unwrap_or(NO_INDEX));
        w.put_u4(at + 20, directories[i]);
        w.put_u4(at + 24, class_data[i]);
        w.put_u4(at + 28, static_values[i]);
    }

    let mut file = w.buf;
    let file_size = file.len() as u32;
    let version = version.clamp(MIN_VERSION, MAX_VERSION);
    let mut header = Vec::with_capacity(HEADER_SIZE);
    write_x(&mut header, format!("dex\n{:03}\0", version).as_bytes());
    write_u4(&mut header, 0); // checksum
    write_x(&mut header, &[0u8; 20]); // signature
    write_u4(&mut header, file_size);
    write_u4(&mut header, HEADER_SIZE as u32);
    write_u4(&mut header, ENDIAN_CONSTANT);
    write_u4(&mut header, 0); // link_size
    write_u4(&mut header, 0); // link_off
    write_u4(&mut header, map_off);
    for (size, off) in [
        (ids.strings.len(), string_ids_off),
        (ids.types.len(), type_ids_off),
        (ids.protos.len(), proto_ids_off),
        (ids.fields.len(), field_ids_off),
        (ids.methods.len(), method_ids_off),
        (plans.len(), class_defs_off),
    ]
    {
        write_u4(&mut header, size as u32);
        write_u4(&mut header, if size == 0 { 0 } else { off as u32 });
    }
    write_u4(&mut header, file_size - data_off as u32);
    write_u4(&mut header, data_off as u32);
    file[..HEADER_SIZE].copy_from_slice(&header);

    let signature = compute_sha1(&file[32..]);
    file[12..32].copy_from_slice(&signature);
    let checksum = adler32_slice(&file[12..]);
    file[8..12].copy_from_slice(&checksum.to_le_bytes());

    debug!("wrote dex {:03}: {} classes, {} bytes", version, plans.len(), file_size);
    Ok(file)
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::dex::model::{
        AccessFlags, AnnotationElement, EncodedAnnotation, InsnRef, TryBlock, TypeAddrPair, Visibility, CLINIT,
    };
    use crate::dex::reader::{class_table, DexUnit};

    fn void() -> Proto
    {
        Proto::new("V", &[])
    }

    fn sample_class() -> ClassDef
    {
        let foo = "Lcom/app/Foo;";
        let mut class = ClassDef::new(foo, Some("Ljava/lang/Object;"), AccessFlags::PUBLIC);
        class.source_file = Some("Foo.java".to_string());
        class.annotations.push(Annotation {
            visibility: Visibility::Runtime,
            annotation: EncodedAnnotation {
                ty: "Lcom/app/Keep;".to_string(),
                elements: vec![AnnotationElement { name: "value".to_string(), value: EncodedValue::String("x".to_string()) }],
            },
        });
        let tag = FieldRef::new(foo, "TAG", "Ljava/lang/String;");
        class.static_fields.push(Field {
            field: tag.clone(),
            access: AccessFlags::STATIC | AccessFlags::FINAL,
            annotations: vec![Annotation {
                visibility: Visibility::Build,
                annotation: EncodedAnnotation { ty: "Lcom/app/Meta;".to_string(), elements: vec![] },
            }],
        });
        class.static_values.push(EncodedValue::String("tag".to_string()));

        class.direct_methods.push(Method::new(
            MethodRef::new(foo, CLINIT, void()),
            AccessFlags::STATIC | AccessFlags::CONSTRUCTOR,
            Some(Code {
                registers_size: 1,
                ins_size: 0,
                outs_size: 0,
                insns: vec![0x001a, 0, 0x0069, 0, 0x000e],
                refs: vec![
                    InsnRef { pc: 0, target: Reference::String("tag".to_string()) },
                    InsnRef { pc: 2, target: Reference::Field(tag) },
                ],
                tries: vec![],
                debug_info: Some(DebugInfo { line_start: 3, parameter_names: vec![], program: vec![DebugOp::PrologueEnd, DebugOp::Special(0x0e)] }),
            }),
        ));
        class.virtual_methods.push(Method::new(
            MethodRef::new(foo, "run", void()),
            AccessFlags::PUBLIC,
            Some(Code {
                registers_size: 2,
                ins_size: 1,
                outs_size: 0,
                insns: vec![0x0071, 0, 0, 0x000e, 0x000d, 0x000e],
                refs: vec![InsnRef { pc: 0, target: Reference::Method(MethodRef::new("Lcom/app/Bar;", "go", void())) }],
                tries: vec![TryBlock {
                    start_addr: 0,
                    insn_count: 3,
                    handler: CatchHandler {
                        catches: vec![TypeAddrPair { exception: "Ljava/lang/Exception;".to_string(), addr: 4 }],
                        catch_all: None,
                    },
                }],
                debug_info: None,
            }),
        ));
        class
    }

    #[test]
    fn classes_survive_write_and_read()
    {
        let class = sample_class();
        let bytes = write_dex(&[class.clone()], 35).unwrap();
        let unit = DexUnit::from_bytes(&bytes).unwrap();
        assert_eq!(unit.version, 35);

        let read = &unit.classes[0];
        assert_eq!(read.superclass, class.superclass);
        assert_eq!(read.source_file, class.source_file);
        assert_eq!(read.annotations, class.annotations);
        assert_eq!(read.static_fields, class.static_fields);
        assert_eq!(read.static_values, class.static_values);
        for (got, want) in read.methods().zip(class.methods())
        {
            assert_eq!(got.method, want.method);
            assert_eq!(got.access, want.access);
            let (got, want) = (got.code.as_ref().unwrap(), want.code.as_ref().unwrap());
            // operands now hold real indices, everything else is unchanged
            assert_eq!(got.insns.len(), want.insns.len());
            assert_eq!(got.refs, want.refs);
            assert_eq!(got.tries, want.tries);
            assert_eq!(got.debug_info, want.debug_info);
        }

        // a second pass over decoded classes is byte-identical
        assert_eq!(write_dex(&unit.classes, unit.version).unwrap(), bytes);
    }

    #[test]
    fn header_checksum_and_signature()
    {
        let bytes = write_dex(&[sample_class()], 37).unwrap();
        assert_eq!(&bytes[0..8], b"dex\n037\0");
        let checksum = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        assert_eq!(checksum, adler32_slice(&bytes[12..]));
        assert_eq!(&bytes[12..32], &compute_sha1(&bytes[32..]));
        let file_size = u32::from_le_bytes([bytes[32], bytes[33], bytes[34], bytes[35]]);
        assert_eq!(file_size as usize, bytes.len());
    }

    #[test]
    fn superclasses_are_written_first()
    {
        let child = ClassDef::new("Lcom/app/Child;", Some("Lcom/app/Base;"), AccessFlags::PUBLIC);
        let base = ClassDef::new("Lcom/app/Base;", Some("Ljava/lang/Object;"), AccessFlags::PUBLIC);
        let bytes = write_dex(&[child, base], 35).unwrap();
        let table = class_table(&bytes).unwrap();
        assert_eq!(table[0].descriptor, "Lcom/app/Base;");
        assert_eq!(table[1].descriptor, "Lcom/app/Child;");
        assert_eq!(table[1].superclass.as_deref(), Some("Lcom/app/Base;"));
    }

    #[test]
    fn duplicate_classes_are_rejected()
    {
        let a = ClassDef::new("Lcom/app/A;", None, AccessFlags::PUBLIC);
        assert!(write_dex(&[a.clone(), a], 35).is_err());
    }

    #[test]
    fn static_values_follow_field_order()
    {
        let foo = "Lcom/app/Foo;";
        let mut class = ClassDef::new(foo, Some("Ljava/lang/Object;"), AccessFlags::PUBLIC);
        // TAG sorts after COUNT, so COUNT needs a filler value
        for name in ["TAG", "COUNT"]
        {
            let ty = if name == "TAG" { "Ljava/lang/String;" } else { "I" };
            class.static_fields.push(Field { field: FieldRef::new(foo, name, ty), access: AccessFlags::STATIC, annotations: vec![] });
        }
        class.static_values.push(EncodedValue::String("tag".to_string()));

        let bytes = write_dex(&[class], 35).unwrap();
        let read = &DexUnit::from_bytes(&bytes).unwrap().classes[0];
        assert_eq!(read.static_fields[0].field.name, "COUNT");
        assert_eq!(read.static_values, vec![EncodedValue::Int(0), EncodedValue::String("tag".to_string())]);
    }

    #[test]
    fn missing_instruction_reference_is_an_error()
    {
        let mut class = sample_class();
        class.direct_methods[0].code.as_mut().unwrap().refs.pop();
        assert!(write_dex(&[class], 35).is_err());
    }
}
