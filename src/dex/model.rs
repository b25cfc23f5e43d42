//! Index-free view of dex classes.
//!
//! Every cross reference (strings, types, protos, fields, methods) is held by
//! value, so a [`ClassDef`] read from one unit can be written into any other.

use bitflags::bitflags;

use crate::dex::refs::RefSet;

bitflags! {
    /// `access_flags` of classes, fields and methods.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AccessFlags: u32 {
        const PUBLIC = 0x1;
        const PRIVATE = 0x2;
        const PROTECTED = 0x4;
        const STATIC = 0x8;
        const FINAL = 0x10;
        const SYNCHRONIZED = 0x20;
        const VOLATILE = 0x40;
        const TRANSIENT = 0x80;
        const NATIVE = 0x100;
        const INTERFACE = 0x200;
        const ABSTRACT = 0x400;
        const STRICT = 0x800;
        const SYNTHETIC = 0x1000;
        const ANNOTATION = 0x2000;
        const ENUM = 0x4000;
        const CONSTRUCTOR = 0x10000;
        const DECLARED_SYNCHRONIZED = 0x20000;
    }
}

/// Name of the static initializer.
pub const CLINIT: &str = "<clinit>";

/// A method prototype: return type and parameter types as descriptors.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Proto
{
    pub return_type: String,
    pub parameters: Vec<String>,
}

impl Proto
{
    pub fn new(return_type: &str, parameters: &[&str]) -> Self
    {
        Proto {
            return_type: return_type.to_string(),
            parameters: parameters.iter().map(|p| p.to_string()).collect(),
        }
    }

    /// Short-form descriptor: one character per type, references collapsed to `L`.
    pub fn shorty(&self) -> String
    {
        let mut s = String::with_capacity(self.parameters.len() + 1);
        s.push(shorty_char(&self.return_type));
        for p in &self.parameters
        {
            s.push(shorty_char(p));
        }
        s
    }

    /// JNI style descriptor, e.g. `(ILjava/lang/String;)V`.
    pub fn descriptor(&self) -> String
    {
        format!("({}){}", self.parameters.concat(), self.return_type)
    }
}

fn shorty_char(descriptor: &str) -> char
{
    match descriptor.as_bytes().first()
    {
        Some(b'L') | Some(b'[') => 'L',
        Some(c) => *c as char,
        None => 'V',
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldRef
{
    pub class: String,
    pub name: String,
    pub ty: String,
}

impl FieldRef
{
    pub fn new(class: &str, name: &str, ty: &str) -> Self
    {
        FieldRef { class: class.to_string(), name: name.to_string(), ty: ty.to_string() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodRef
{
    pub class: String,
    pub name: String,
    pub proto: Proto,
}

impl MethodRef
{
    pub fn new(class: &str, name: &str, proto: Proto) -> Self
    {
        MethodRef { class: class.to_string(), name: name.to_string(), proto }
    }
}

impl std::fmt::Display for MethodRef
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        write!(f, "{}->{}{}", self.class, self.name, self.proto.descriptor())
    }
}

/// Value of a static field initializer or an annotation element.
///
/// Floating point values are kept as raw bits so that values survive a
/// read/write cycle unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EncodedValue
{
    Byte(i8),
    Short(i16),
    Char(u16),
    Int(i32),
    Long(i64),
    Float(u32),
    Double(u64),
    MethodType(Proto),
    String(String),
    Type(String),
    Field(FieldRef),
    Method(MethodRef),
    Enum(FieldRef),
    Array(Vec<EncodedValue>),
    Annotation(EncodedAnnotation),
    Null,
    Boolean(bool),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EncodedAnnotation
{
    pub ty: String,
    pub elements: Vec<AnnotationElement>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AnnotationElement
{
    pub name: String,
    pub value: EncodedValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Visibility
{
    Build,
    Runtime,
    System,
}

impl Visibility
{
    pub fn from_u8(v: u8) -> Option<Visibility>
    {
        match v
        {
            0x00 => Some(Visibility::Build),
            0x01 => Some(Visibility::Runtime),
            0x02 => Some(Visibility::System),
            _ => None,
        }
    }

    pub fn to_u8(self) -> u8
    {
        match self
        {
            Visibility::Build => 0x00,
            Visibility::Runtime => 0x01,
            Visibility::System => 0x02,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Annotation
{
    pub visibility: Visibility,
    pub annotation: EncodedAnnotation,
}

/// A reference operand of one instruction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Reference
{
    String(String),
    Type(String),
    Field(FieldRef),
    Method(MethodRef),
    Proto(Proto),
}

/// Reference carried by the instruction starting at code unit `pc`.
///
/// The index operand in [`Code::insns`] is meaningless until the writer
/// patches it; `invoke-polymorphic` carries two entries (method then proto).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InsnRef
{
    pub pc: u32,
    pub target: Reference,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TypeAddrPair
{
    pub exception: String,
    pub addr: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CatchHandler
{
    pub catches: Vec<TypeAddrPair>,
    pub catch_all: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TryBlock
{
    pub start_addr: u32,
    pub insn_count: u16,
    pub handler: CatchHandler,
}

/// One entry of a debug_info_item state machine program.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DebugOp
{
    AdvancePc(u32),
    AdvanceLine(i32),
    StartLocal { register: u32, name: Option<String>, ty: Option<String> },
    StartLocalExtended { register: u32, name: Option<String>, ty: Option<String>, signature: Option<String> },
    EndLocal(u32),
    RestartLocal(u32),
    PrologueEnd,
    EpilogueBegin,
    SetFile(Option<String>),
    Special(u8),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DebugInfo
{
    pub line_start: u32,
    pub parameter_names: Vec<Option<String>>,
    pub program: Vec<DebugOp>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Code
{
    pub registers_size: u16,
    pub ins_size: u16,
    pub outs_size: u16,
    pub insns: Vec<u16>,
    pub refs: Vec<InsnRef>,
    pub tries: Vec<TryBlock>,
    pub debug_info: Option<DebugInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Field
{
    pub field: FieldRef,
    pub access: AccessFlags,
    pub annotations: Vec<Annotation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Method
{
    pub method: MethodRef,
    pub access: AccessFlags,
    pub code: Option<Code>,
    pub annotations: Vec<Annotation>,
    pub parameter_annotations: Vec<Vec<Annotation>>,
}

impl Method
{
    pub fn new(method: MethodRef, access: AccessFlags, code: Option<Code>) -> Self
    {
        Method { method, access, code, annotations: vec![], parameter_annotations: vec![] }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassDef
{
    pub descriptor: String,
    pub access: AccessFlags,
    pub superclass: Option<String>,
    pub interfaces: Vec<String>,
    pub source_file: Option<String>,
    pub annotations: Vec<Annotation>,
    pub static_fields: Vec<Field>,
    pub instance_fields: Vec<Field>,
    pub direct_methods: Vec<Method>,
    pub virtual_methods: Vec<Method>,
    /// Initial values of the leading static fields, in `static_fields` order.
    pub static_values: Vec<EncodedValue>,
}

impl ClassDef
{
    pub fn new(descriptor: &str, superclass: Option<&str>, access: AccessFlags) -> Self
    {
        ClassDef {
            descriptor: descriptor.to_string(),
            access,
            superclass: superclass.map(|s| s.to_string()),
            interfaces: vec![],
            source_file: None,
            annotations: vec![],
            static_fields: vec![],
            instance_fields: vec![],
            direct_methods: vec![],
            virtual_methods: vec![],
            static_values: vec![],
        }
    }

    pub fn methods(&self) -> impl Iterator<Item = &Method>
    {
        self.direct_methods.iter().chain(self.virtual_methods.iter())
    }

    pub fn fields(&self) -> impl Iterator<Item = &Field>
    {
        self.static_fields.iter().chain(self.instance_fields.iter())
    }

    pub fn static_initializer(&self) -> Option<&Method>
    {
        self.direct_methods.iter().find(|m| m.method.name == CLINIT)
    }

    pub fn static_initializer_mut(&mut self) -> Option<&mut Method>
    {
        self.direct_methods.iter_mut().find(|m| m.method.name == CLINIT)
    }

    /// Every string, type, proto, field and method id this class needs in a unit.
    pub fn references(&self) -> RefSet
    {
        let mut set = RefSet::default();
        self.collect_references(&mut set);
        set
    }

    pub fn collect_references(&self, set: &mut RefSet)
    {
        set.add_type(&self.descriptor);
        if let Some(s) = &self.superclass
        {
            set.add_type(s);
        }
        for i in &self.interfaces
        {
            set.add_type(i);
        }
        if let Some(s) = &self.source_file
        {
            set.add_string(s);
        }
        collect_annotations(set, &self.annotations);
        for f in self.fields()
        {
            set.add_field(&f.field);
            collect_annotations(set, &f.annotations);
        }
        for v in &self.static_values
        {
            collect_value(set, v);
        }
        for m in self.methods()
        {
            set.add_method(&m.method);
            collect_annotations(set, &m.annotations);
            for p in &m.parameter_annotations
            {
                collect_annotations(set, p);
            }
            if let Some(code) = &m.code
            {
                collect_code(set, code);
            }
        }
    }
}

fn collect_annotations(set: &mut RefSet, annotations: &[Annotation])
{
    for a in annotations
    {
        collect_encoded_annotation(set, &a.annotation);
    }
}

fn collect_encoded_annotation(set: &mut RefSet, a: &EncodedAnnotation)
{
    set.add_type(&a.ty);
    for e in &a.elements
    {
        set.add_string(&e.name);
        collect_value(set, &e.value);
    }
}

fn collect_value(set: &mut RefSet, value: &EncodedValue)
{
    match value
    {
        EncodedValue::MethodType(p) => set.add_proto(p),
        EncodedValue::String(s) => set.add_string(s),
        EncodedValue::Type(t) => set.add_type(t),
        EncodedValue::Field(f) | EncodedValue::Enum(f) => set.add_field(f),
        EncodedValue::Method(m) => set.add_method(m),
        EncodedValue::Array(items) =>
        {
            for i in items
            {
                collect_value(set, i);
            }
        }
        EncodedValue::Annotation(a) => collect_encoded_annotation(set, a),
        _ => {}
    }
}

fn collect_code(set: &mut RefSet, code: &Code)
{
    for r in &code.refs
    {
        match &r.target
        {
            Reference::String(s) => set.add_string(s),
            Reference::Type(t) => set.add_type(t),
            Reference::Field(f) => set.add_field(f),
            Reference::Method(m) => set.add_method(m),
            Reference::Proto(p) => set.add_proto(p),
        }
    }
    for t in &code.tries
    {
        for c in &t.handler.catches
        {
            set.add_type(&c.exception);
        }
    }
    if let Some(debug) = &code.debug_info
    {
        for name in debug.parameter_names.iter().flatten()
        {
            set.add_string(name);
        }
        for op in &debug.program
        {
            match op
            {
                DebugOp::StartLocal { name, ty, .. } =>
                {
                    if let Some(n) = name { set.add_string(n); }
                    if let Some(t) = ty { set.add_type(t); }
                }
                DebugOp::StartLocalExtended { name, ty, signature, .. } =>
                {
                    if let Some(n) = name { set.add_string(n); }
                    if let Some(t) = ty { set.add_type(t); }
                    if let Some(s) = signature { set.add_string(s); }
                }
                DebugOp::SetFile(Some(f)) => set.add_string(f),
                _ => {}
            }
        }
    }
}

/// Convert a class name in any of the usual spellings (`com.app.App`,
/// `com/app/App` or `Lcom/app/App;`) into a type descriptor.
pub fn class_name_to_descriptor(name: &str) -> String
{
    if name.starts_with('L') && name.ends_with(';')
    {
        return name.to_string();
    }
    format!("L{};", name.replace('.', "/"))
}

/// Inverse of [`class_name_to_descriptor`] for class descriptors; other
/// descriptors are returned unchanged.
pub fn descriptor_to_class_name(descriptor: &str) -> String
{
    match descriptor.strip_prefix('L').and_then(|d| d.strip_suffix(';'))
    {
        Some(inner) => inner.replace('/', "."),
        None => descriptor.to_string(),
    }
}
