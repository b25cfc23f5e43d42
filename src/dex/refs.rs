//! Id bookkeeping shared by the pool packer and the writer.
//!
//! A [`RefSet`] holds the closure of ids a set of classes needs: adding a
//! method also adds its class type, its name and its proto, adding a proto
//! adds its shorty and every type it mentions, adding a type adds its
//! descriptor string. The writer emits exactly these ids, so counts taken
//! from a set are the counts the unit will declare.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::ops::Add;

use crate::dex::model::{FieldRef, MethodRef, Proto};
use crate::dex::MAX_TABLE_ENTRIES;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefSet
{
    pub strings: HashSet<String>,
    pub types: HashSet<String>,
    pub protos: HashSet<Proto>,
    pub fields: HashSet<FieldRef>,
    pub methods: HashSet<MethodRef>,
}

impl RefSet
{
    pub fn add_string(&mut self, s: &str)
    {
        if !self.strings.contains(s)
        {
            self.strings.insert(s.to_string());
        }
    }

    pub fn add_type(&mut self, descriptor: &str)
    {
        if !self.types.contains(descriptor)
        {
            self.types.insert(descriptor.to_string());
            self.add_string(descriptor);
        }
    }

    pub fn add_proto(&mut self, proto: &Proto)
    {
        if !self.protos.contains(proto)
        {
            self.add_string(&proto.shorty());
            self.add_type(&proto.return_type);
            for p in &proto.parameters
            {
                self.add_type(p);
            }
            self.protos.insert(proto.clone());
        }
    }

    pub fn add_field(&mut self, field: &FieldRef)
    {
        if !self.fields.contains(field)
        {
            self.add_type(&field.class);
            self.add_type(&field.ty);
            self.add_string(&field.name);
            self.fields.insert(field.clone());
        }
    }

    pub fn add_method(&mut self, method: &MethodRef)
    {
        if !self.methods.contains(method)
        {
            self.add_type(&method.class);
            self.add_string(&method.name);
            self.add_proto(&method.proto);
            self.methods.insert(method.clone());
        }
    }

    /// Merge `other` into this set.
    pub fn extend(&mut self, other: RefSet)
    {
        self.strings.extend(other.strings);
        self.types.extend(other.types);
        self.protos.extend(other.protos);
        self.fields.extend(other.fields);
        self.methods.extend(other.methods);
    }

    pub fn counts(&self) -> RefCounts
    {
        RefCounts {
            strings: self.strings.len() as u32,
            types: self.types.len() as u32,
            protos: self.protos.len() as u32,
            fields: self.fields.len() as u32,
            methods: self.methods.len() as u32,
        }
    }

    /// How many ids of `other` are not yet part of this set.
    pub fn delta(&self, other: &RefSet) -> RefCounts
    {
        RefCounts {
            strings: other.strings.iter().filter(|s| !self.strings.contains(*s)).count() as u32,
            types: other.types.iter().filter(|t| !self.types.contains(*t)).count() as u32,
            protos: other.protos.iter().filter(|p| !self.protos.contains(*p)).count() as u32,
            fields: other.fields.iter().filter(|f| !self.fields.contains(*f)).count() as u32,
            methods: other.methods.iter().filter(|m| !self.methods.contains(*m)).count() as u32,
        }
    }

    pub fn is_empty(&self) -> bool
    {
        self.strings.is_empty()
    }
}

/// Sizes of the id tables of a unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct RefCounts
{
    pub strings: u32,
    pub types: u32,
    pub protos: u32,
    pub fields: u32,
    pub methods: u32,
}

impl RefCounts
{
    /// Methods, fields and types taken together.
    pub fn total(&self) -> u32
    {
        self.methods + self.fields + self.types
    }

    /// Largest of the method, field and type tables.
    pub fn largest_section(&self) -> u32
    {
        self.methods.max(self.fields).max(self.types)
    }

    /// Every table fits the 16-bit indices instructions use.
    pub fn within_table_limits(&self) -> bool
    {
        [self.strings, self.types, self.protos, self.fields, self.methods]
            .iter()
            .all(|&n| n <= MAX_TABLE_ENTRIES)
    }
}

impl Add for RefCounts
{
    type Output = RefCounts;

    fn add(self, rhs: RefCounts) -> RefCounts
    {
        RefCounts {
            strings: self.strings + rhs.strings,
            types: self.types + rhs.types,
            protos: self.protos + rhs.protos,
            fields: self.fields + rhs.fields,
            methods: self.methods + rhs.methods,
        }
    }
}

impl std::fmt::Display for RefCounts
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        write!(
            f,
            "{} methods, {} fields, {} types, {} protos, {} strings",
            self.methods, self.fields, self.types, self.protos, self.strings
        )
    }
}

/// Order of `string_ids`: by UTF-16 code units, not by UTF-8 bytes.
pub fn dex_string_cmp(a: &str, b: &str) -> Ordering
{
    if a.is_ascii() && b.is_ascii()
    {
        return a.cmp(b);
    }
    a.encode_utf16().cmp(b.encode_utf16())
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn delta_counts_only_new_ids()
    {
        let mut pool = RefSet::default();
        pool.add_method(&MethodRef::new("La;", "f", Proto::new("V", &[])));

        let mut class = RefSet::default();
        class.add_method(&MethodRef::new("La;", "f", Proto::new("V", &[])));
        class.add_method(&MethodRef::new("Lb;", "g", Proto::new("V", &["I"])));

        let delta = pool.delta(&class);
        assert_eq!(delta.methods, 1);
        assert_eq!(delta.types, 2); // Lb; and I
        assert_eq!(delta.protos, 1);

        pool.extend(class);
        assert_eq!(pool.counts().methods, 2);
        assert_eq!(pool.counts().total(), 2 + 0 + 4);
    }

    #[test]
    fn utf16_order_differs_from_utf8_for_supplementary_chars()
    {
        let bmp_high = "\u{FF21}";
        let astral = "\u{1F600}";
        // UTF-8 puts the astral char last, UTF-16 puts its surrogate (0xD83D) first.
        assert_eq!(bmp_high.cmp(astral), Ordering::Less);
        assert_eq!(dex_string_cmp(bmp_high, astral), Ordering::Greater);
    }
}
