// The type algebra.
//
// Types live in a single arena and are addressed by TypeId; identity is the
// id, which is what dissolves the type-owns-scope / scope-owns-type cycle of
// a pointer-based design. A TypeDef carries its kind, its storage model and
// sizes, an optional declared name, a back-reference to the owning scope,
// and the lazily derived children (vector / set / reference / range), which
// are interned: deriving twice yields the same id.
//
// Ordinals are ranges [min, max] of 64-bit integers; their physical width
// (1, 4 or 8 bytes) is chosen from the range, and for integers the width
// also selects the storage class. Char, Enum and Bool are byte-stored
// regardless of range. Vectors and arrays are pointer-to-buffer storage;
// a string is a vector of full-range char; a set is an array whose element
// type is void, keyed by the member type.

use log::debug;

use crate::error::{Error, Result};
use crate::source::mk_printable_char;


// Word size and data alignment; 64-bit host assumed.
pub const MEM_ALIGN: i32 = 8;

pub fn mem_align(size: i32) -> i32 {
    if size == 0 {
        0
    } else {
        (((size - 1) / MEM_ALIGN) + 1) * MEM_ALIGN
    }
}


// Storage width of an ordinal with the given inclusive range.
pub fn physical_size(min: i64, max: i64) -> i32 {
    if min >= 0 {
        // only ordinals within 0..255 can be unsigned
        if max <= 255 {
            1
        } else if max <= i32::max_value() as i64 {
            4
        } else {
            8
        }
    } else {
        // signed ordinals are always 4 or 8 bytes
        if min == i64::min_value() {
            return 8;
        }
        let t = (!min).max(max);
        if t <= i32::max_value() as i64 {
            4
        } else {
            8
        }
    }
}


#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct TypeId(pub(crate) u32);

impl TypeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Debug for TypeId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "t{}", self.0)
    }
}


#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct ScopeId(pub(crate) u32);

impl ScopeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Debug for ScopeId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "s{}", self.0)
    }
}


// Order matters: the first three select int widths, and code generation
// computes load/store opcodes as base + storage discriminant.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Storage {
    Byte = 0,
    Int = 1,
    Large = 2,
    Ptr = 3,
    Vec = 4,
    Void = 5,
}

impl Storage {
    pub fn size(self) -> i32 {
        match self {
            Storage::Byte => 1,
            Storage::Int => 4,
            Storage::Large => 8,
            Storage::Ptr => MEM_ALIGN,
            Storage::Vec => MEM_ALIGN,
            Storage::Void => 0,
        }
    }
}


#[derive(Clone, Debug, PartialEq)]
pub enum TypeKind {
    Int { min: i64, max: i64 },
    Char { min: i64, max: i64 },
    Enum { table: usize, min: i64, max: i64 },
    Bool,
    Vector { elem: TypeId },
    // A set is an array whose element type is void.
    Array { elem: TypeId, index: TypeId },
    TypeRef,
    Range { base: TypeId },
    Reference { base: TypeId },
    Module,
    Void,
}


pub struct TypeDef {
    pub name: Option<String>,
    pub kind: TypeKind,
    pub storage: Storage,
    pub static_size: i32,
    pub aligned_size: i32,
    owner: Option<ScopeId>,
    derived_vector: Option<TypeId>,
    derived_set: Option<TypeId>,
    derived_ref: Option<TypeId>,
    derived_range: Option<TypeId>,
}


fn storage_of(kind: &TypeKind) -> Storage {
    match kind {
        TypeKind::Int { min, max } => match physical_size(*min, *max) {
            1 => Storage::Byte,
            4 => Storage::Int,
            _ => Storage::Large,
        },
        TypeKind::Char { .. } | TypeKind::Enum { .. } | TypeKind::Bool => Storage::Byte,
        TypeKind::Vector { .. } | TypeKind::Array { .. } => Storage::Vec,
        TypeKind::TypeRef | TypeKind::Reference { .. } => Storage::Ptr,
        TypeKind::Range { .. } => Storage::Large,
        TypeKind::Module | TypeKind::Void => Storage::Void,
    }
}


pub struct Types {
    defs: Vec<TypeDef>,
    enum_tables: Vec<Vec<String>>,
}


impl Types {
    pub fn new() -> Types {
        Types { defs: Vec::new(), enum_tables: Vec::new() }
    }

    fn alloc(&mut self, name: Option<String>, kind: TypeKind) -> TypeId {
        let storage = storage_of(&kind);
        let static_size = storage.size();
        let id = TypeId(self.defs.len() as u32);
        debug!("type {:?}: {:?} ({:?})", id, kind, storage);
        self.defs.push(TypeDef {
            name,
            kind,
            storage,
            static_size,
            aligned_size: mem_align(static_size),
            owner: None,
            derived_vector: None,
            derived_set: None,
            derived_ref: None,
            derived_range: None,
        });
        id
    }

    pub fn get(&self, id: TypeId) -> &TypeDef {
        &self.defs[id.index()]
    }

    fn get_mut(&mut self, id: TypeId) -> &mut TypeDef {
        &mut self.defs[id.index()]
    }

    pub fn count(&self) -> usize {
        self.defs.len()
    }

    pub fn set_owner(&mut self, id: TypeId, owner: ScopeId) -> Result<()> {
        let def = self.get_mut(id);
        if def.owner.is_some() {
            return Err(Error::internal(3));
        }
        def.owner = Some(owner);
        Ok(())
    }

    pub fn owner(&self, id: TypeId) -> Option<ScopeId> {
        self.get(id).owner
    }

    // --- constructors ---

    pub fn new_int(&mut self, name: Option<&str>, min: i64, max: i64) -> TypeId {
        self.alloc(name.map(String::from), TypeKind::Int { min, max })
    }

    pub fn new_char(&mut self, name: Option<&str>, min: i64, max: i64) -> TypeId {
        self.alloc(name.map(String::from), TypeKind::Char { min, max })
    }

    pub fn new_bool(&mut self, name: &str) -> TypeId {
        self.alloc(Some(name.to_string()), TypeKind::Bool)
    }

    pub fn new_void(&mut self, name: &str) -> TypeId {
        self.alloc(Some(name.to_string()), TypeKind::Void)
    }

    pub fn new_typeref(&mut self, name: &str) -> TypeId {
        self.alloc(Some(name.to_string()), TypeKind::TypeRef)
    }

    pub fn new_vector(&mut self, name: Option<&str>, elem: TypeId) -> TypeId {
        self.alloc(name.map(String::from), TypeKind::Vector { elem })
    }

    pub fn new_module_type(&mut self, name: &str) -> TypeId {
        self.alloc(Some(name.to_string()), TypeKind::Module)
    }

    // A fresh enum with an empty member table and range [0, 0]; members are
    // registered one by one and finish() fixes the upper bound.
    pub fn new_enum(&mut self) -> TypeId {
        let table = self.enum_tables.len();
        self.enum_tables.push(Vec::new());
        self.alloc(None, TypeKind::Enum { table, min: 0, max: 0 })
    }

    pub fn enum_next_value(&self, id: TypeId) -> i32 {
        match &self.get(id).kind {
            TypeKind::Enum { table, .. } => self.enum_tables[*table].len() as i32,
            _ => 0,
        }
    }

    pub fn enum_register(&mut self, id: TypeId, member: &str) -> Result<()> {
        match &self.get(id).kind {
            TypeKind::Enum { table, .. } => {
                let table = *table;
                self.enum_tables[table].push(member.to_string());
                Ok(())
            }
            _ => Err(Error::internal(15)),
        }
    }

    pub fn enum_finish(&mut self, id: TypeId) -> Result<()> {
        let (table, min) = match &self.get(id).kind {
            TypeKind::Enum { table, min, .. } => (*table, *min),
            _ => return Err(Error::internal(15)),
        };
        let max = self.enum_tables[table].len() as i64 - 1;
        if max >= 256 {
            return Err(Error::internal(15));
        }
        self.get_mut(id).kind = TypeKind::Enum { table, min, max };
        Ok(())
    }

    pub fn enum_member(&self, id: TypeId, value: i64) -> Option<&str> {
        match &self.get(id).kind {
            TypeKind::Enum { table, .. } => self.enum_tables[*table]
                .get(value as usize)
                .map(|s| s.as_str()),
            _ => None,
        }
    }

    // --- classification ---

    pub fn storage(&self, id: TypeId) -> Storage {
        self.get(id).storage
    }

    pub fn static_size(&self, id: TypeId) -> i32 {
        self.get(id).static_size
    }

    pub fn aligned_size(&self, id: TypeId) -> i32 {
        self.get(id).aligned_size
    }

    pub fn is_void(&self, id: TypeId) -> bool {
        self.get(id).kind == TypeKind::Void
    }

    pub fn is_typeref(&self, id: TypeId) -> bool {
        self.get(id).kind == TypeKind::TypeRef
    }

    pub fn is_range(&self, id: TypeId) -> bool {
        matches!(self.get(id).kind, TypeKind::Range { .. })
    }

    pub fn is_int(&self, id: TypeId) -> bool {
        matches!(self.get(id).kind, TypeKind::Int { .. })
    }

    pub fn is_char(&self, id: TypeId) -> bool {
        matches!(self.get(id).kind, TypeKind::Char { .. })
    }

    pub fn is_enum(&self, id: TypeId) -> bool {
        matches!(self.get(id).kind, TypeKind::Enum { .. })
    }

    pub fn is_bool(&self, id: TypeId) -> bool {
        self.get(id).kind == TypeKind::Bool
    }

    pub fn is_ordinal(&self, id: TypeId) -> bool {
        matches!(
            self.get(id).kind,
            TypeKind::Int { .. } | TypeKind::Char { .. } | TypeKind::Enum { .. } | TypeKind::Bool
        )
    }

    pub fn is_vector(&self, id: TypeId) -> bool {
        matches!(self.get(id).kind, TypeKind::Vector { .. })
    }

    pub fn is_array(&self, id: TypeId) -> bool {
        matches!(self.get(id).kind, TypeKind::Array { .. })
    }

    pub fn is_reference(&self, id: TypeId) -> bool {
        matches!(self.get(id).kind, TypeKind::Reference { .. })
    }

    pub fn is_large_int(&self, id: TypeId) -> bool {
        self.is_int(id) && self.storage(id) == Storage::Large
    }

    pub fn is_pod(&self, id: TypeId) -> bool {
        self.storage(id) != Storage::Vec
    }

    pub fn vector_elem(&self, id: TypeId) -> Option<TypeId> {
        match self.get(id).kind {
            TypeKind::Vector { elem } | TypeKind::Array { elem, .. } => Some(elem),
            _ => None,
        }
    }

    pub fn array_index(&self, id: TypeId) -> Option<TypeId> {
        match self.get(id).kind {
            TypeKind::Array { index, .. } => Some(index),
            _ => None,
        }
    }

    pub fn is_string(&self, id: TypeId) -> bool {
        if !self.is_vector(id) {
            return false;
        }
        match self.vector_elem(id) {
            Some(elem) => matches!(self.get(elem).kind, TypeKind::Char { min: 0, max: 255 }),
            None => false,
        }
    }

    pub fn is_empty_vec(&self, id: TypeId) -> bool {
        self.is_vector(id) && self.vector_elem(id).map_or(false, |e| self.is_void(e))
    }

    pub fn is_pod_vector(&self, id: TypeId) -> bool {
        self.vector_elem(id).map_or(false, |e| self.is_pod(e))
    }

    pub fn ord_range(&self, id: TypeId) -> Option<(i64, i64)> {
        match self.get(id).kind {
            TypeKind::Int { min, max }
            | TypeKind::Char { min, max }
            | TypeKind::Enum { min, max, .. } => Some((min, max)),
            TypeKind::Bool => Some((0, 1)),
            _ => None,
        }
    }

    pub fn contains(&self, id: TypeId, value: i64) -> bool {
        match self.ord_range(id) {
            Some((min, max)) => value >= min && value <= max,
            None => false,
        }
    }

    pub fn range_base(&self, id: TypeId) -> Option<TypeId> {
        match self.get(id).kind {
            TypeKind::Range { base } => Some(base),
            _ => None,
        }
    }

    pub fn reference_base(&self, id: TypeId) -> Option<TypeId> {
        match self.get(id).kind {
            TypeKind::Reference { base } => Some(base),
            _ => None,
        }
    }

    // --- predicates ---

    pub fn equals(&self, a: TypeId, b: TypeId) -> bool {
        if a == b {
            return true;
        }
        match (&self.get(a).kind, &self.get(b).kind) {
            (TypeKind::Int { min, max }, TypeKind::Int { min: m2, max: x2 }) => {
                min == m2 && max == x2
            }
            (TypeKind::Char { min, max }, TypeKind::Char { min: m2, max: x2 }) => {
                min == m2 && max == x2
            }
            (TypeKind::Bool, TypeKind::Bool) => true,
            // distinct enum definitions are never equal
            (TypeKind::Enum { .. }, TypeKind::Enum { .. }) => false,
            (TypeKind::Vector { elem: e1 }, TypeKind::Vector { elem: e2 }) => {
                self.equals(*e1, *e2)
            }
            (
                TypeKind::Array { elem: e1, index: i1 },
                TypeKind::Array { elem: e2, index: i2 },
            ) => self.equals(*e1, *e2) && self.equals(*i1, *i2),
            (TypeKind::TypeRef, TypeKind::TypeRef) => true,
            (TypeKind::Range { base: b1 }, TypeKind::Range { base: b2 }) => {
                self.equals(*b1, *b2)
            }
            (TypeKind::Reference { base: b1 }, TypeKind::Reference { base: b2 }) => {
                self.equals(*b1, *b2)
            }
            (TypeKind::Void, TypeKind::Void) => true,
            _ => false,
        }
    }

    pub fn can_assign(&self, target: TypeId, source: TypeId) -> bool {
        match &self.get(target).kind {
            TypeKind::Int { .. } => {
                self.is_int(source) && self.is_large_int(target) == self.is_large_int(source)
            }
            TypeKind::Char { .. } => self.is_char(source),
            TypeKind::Bool => self.is_bool(source),
            TypeKind::Enum { table, .. } => match &self.get(source).kind {
                TypeKind::Enum { table: t2, .. } => table == t2,
                _ => false,
            },
            TypeKind::Vector { elem } => {
                self.equals(target, source)
                    || self.equals(*elem, source)
                    || self.is_empty_vec(source)
            }
            _ => self.equals(target, source),
        }
    }

    // Admissibility of ordered comparison (<, <=, >, >=) and, through
    // can_check_eq, of equality tests.
    pub fn can_compare_with(&self, left: TypeId, right: TypeId) -> bool {
        match &self.get(left).kind {
            TypeKind::Int { .. } => self.can_assign(left, right),
            TypeKind::Char { .. } => self.is_char(right) || self.is_string(right),
            TypeKind::Bool => self.is_bool(right),
            TypeKind::Enum { .. } => self.can_assign(left, right),
            TypeKind::Vector { .. } => {
                self.is_string(left) && (self.is_string(right) || self.is_char(right))
            }
            _ => false,
        }
    }

    pub fn can_check_eq(&self, left: TypeId, right: TypeId) -> bool {
        match &self.get(left).kind {
            TypeKind::TypeRef => self.is_typeref(right),
            TypeKind::Vector { .. } => {
                self.can_compare_with(left, right)
                    || self.equals(left, right)
                    || self.is_empty_vec(left)
                    || self.is_empty_vec(right)
            }
            _ => self.can_compare_with(left, right),
        }
    }

    pub fn can_static_cast_to(&self, from: TypeId, to: TypeId) -> bool {
        if self.is_ordinal(from) {
            self.is_ordinal(to)
        } else if self.is_vector(from) {
            self.is_empty_vec(from) || self.equals(from, to)
        } else {
            self.equals(from, to)
        }
    }

    pub fn can_be_array_index(&self, id: TypeId) -> bool {
        self.can_compare_with(id, id)
    }

    pub fn can_be_array_element(&self, id: TypeId) -> bool {
        self.static_size(id) > 0
    }

    // --- derivation ---

    fn inherit_owner(&mut self, derived: TypeId, base: TypeId) {
        self.get_mut(derived).owner = self.owner(base);
    }

    pub fn derive_vector(&mut self, base: TypeId) -> Result<TypeId> {
        if self.is_void(base) {
            return Err(Error::internal(11));
        }
        if let Some(v) = self.get(base).derived_vector {
            return Ok(v);
        }
        let v = self.alloc(None, TypeKind::Vector { elem: base });
        self.inherit_owner(v, base);
        self.get_mut(base).derived_vector = Some(v);
        Ok(v)
    }

    // Used once, to wire the built-in "str" as char's vector type.
    pub fn set_derived_vector(&mut self, base: TypeId, vec: TypeId) {
        self.get_mut(base).derived_vector = Some(vec);
    }

    // Arrays are not interned; sets (element type void) are cached on the
    // index type.
    pub fn derive_array(&mut self, elem: TypeId, index: TypeId) -> Result<TypeId> {
        if !self.can_be_array_index(index) {
            return Err(Error::internal(7));
        }
        if self.is_void(elem) {
            return self.derive_set(index, elem);
        }
        let a = self.alloc(None, TypeKind::Array { elem, index });
        self.inherit_owner(a, elem);
        Ok(a)
    }

    fn derive_set(&mut self, index: TypeId, void_elem: TypeId) -> Result<TypeId> {
        if let Some(s) = self.get(index).derived_set {
            return Ok(s);
        }
        let s = self.alloc(None, TypeKind::Array { elem: void_elem, index });
        self.inherit_owner(s, index);
        self.get_mut(index).derived_set = Some(s);
        Ok(s)
    }

    pub fn derive_reference(&mut self, base: TypeId) -> Result<TypeId> {
        if let Some(r) = self.get(base).derived_ref {
            return Ok(r);
        }
        let r = self.alloc(None, TypeKind::Reference { base });
        self.inherit_owner(r, base);
        self.get_mut(base).derived_ref = Some(r);
        Ok(r)
    }

    pub fn derive_range(&mut self, base: TypeId) -> Result<TypeId> {
        if !self.is_ordinal(base) {
            return Err(Error::internal(10));
        }
        if let Some(r) = self.get(base).derived_range {
            return Ok(r);
        }
        let r = self.alloc(None, TypeKind::Range { base });
        self.inherit_owner(r, base);
        self.get_mut(base).derived_range = Some(r);
        Ok(r)
    }

    // A subrange literal [min, max] applied to an ordinal: the base itself
    // when the ranges coincide, a clone with the tightened range when it is
    // properly contained, an error otherwise.
    pub fn derive_ordinal_from_range(&mut self, base: TypeId, min: i64, max: i64) -> Result<TypeId> {
        let (bmin, bmax) = self
            .ord_range(base)
            .ok_or_else(|| Error::internal(10))?;
        if bmin == min && bmax == max {
            return Ok(base);
        }
        if min >= max || !(bmin <= min && bmax >= max) {
            return Err(Error::InvalidSubrange(self.definition(base)));
        }
        let clone = match &self.get(base).kind {
            TypeKind::Int { .. } => self.alloc(None, TypeKind::Int { min, max }),
            TypeKind::Char { .. } => self.alloc(None, TypeKind::Char { min, max }),
            TypeKind::Enum { table, .. } => {
                let table = *table;
                self.alloc(None, TypeKind::Enum { table, min, max })
            }
            _ => return Err(Error::InvalidSubrange(self.definition(base))),
        };
        self.inherit_owner(clone, base);
        Ok(clone)
    }

    // --- rendering ---

    pub fn definition_with(&self, id: TypeId, obj: &str) -> String {
        let def = self.get(id);
        if let Some(name) = &def.name {
            return if obj.is_empty() {
                name.clone()
            } else {
                format!("{} {}", name, obj)
            };
        }
        let base = match &def.kind {
            TypeKind::Int { min, max } => format!("{}..{}", min, max),
            TypeKind::Char { min, max } => format!(
                "'{}'..'{}'",
                mk_printable_char(*min as u8),
                mk_printable_char(*max as u8)
            ),
            TypeKind::Enum { table, min, max } => {
                let t = &self.enum_tables[*table];
                let lo = t.get(*min as usize).map(String::as_str).unwrap_or("?");
                let hi = t.get(*max as usize).map(String::as_str).unwrap_or("?");
                format!("{}..{}", lo, hi)
            }
            TypeKind::Bool => "false..true".to_string(),
            TypeKind::Vector { elem } => return format!("{}[]", self.definition_with(*elem, obj)),
            TypeKind::Array { elem, index } => {
                return format!(
                    "{}[{}]",
                    self.definition_with(*elem, obj),
                    self.definition(*index)
                );
            }
            TypeKind::TypeRef => "typeref".to_string(),
            TypeKind::Range { base } => return format!("{}[..]", self.definition_with(*base, obj)),
            TypeKind::Reference { base } => {
                return format!("{}^", self.definition_with(*base, obj));
            }
            TypeKind::Module => "module".to_string(),
            TypeKind::Void => "void".to_string(),
        };
        if obj.is_empty() {
            base
        } else {
            format!("{} {}", base, obj)
        }
    }

    pub fn definition(&self, id: TypeId) -> String {
        self.definition_with(id, "")
    }

    pub fn definition_q(&self, id: TypeId) -> String {
        format!("'{}'", self.definition(id))
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_physical_size() {
        assert_eq!(1, physical_size(0, 255));
        assert_eq!(4, physical_size(0, 256));
        assert_eq!(4, physical_size(0, i32::max_value() as i64));
        assert_eq!(8, physical_size(0, i32::max_value() as i64 + 1));
        assert_eq!(4, physical_size(-1, 1));
        assert_eq!(4, physical_size(i32::min_value() as i64, i32::max_value() as i64));
        assert_eq!(8, physical_size(i32::min_value() as i64 - 1, 0));
        assert_eq!(8, physical_size(i64::min_value(), i64::max_value()));
        assert_eq!(1, physical_size(10, 20));
    }

    #[test]
    fn test_mem_align() {
        assert_eq!(0, mem_align(0));
        assert_eq!(8, mem_align(1));
        assert_eq!(8, mem_align(8));
        assert_eq!(16, mem_align(9));
    }

    #[test]
    fn test_storage_selection() {
        let mut t = Types::new();
        let byte = t.new_int(None, 10, 20);
        let int = t.new_int(Some("int"), i32::min_value() as i64, i32::max_value() as i64);
        let large = t.new_int(Some("large"), i64::min_value(), i64::max_value());
        assert_eq!(Storage::Byte, t.storage(byte));
        assert_eq!(Storage::Int, t.storage(int));
        assert_eq!(Storage::Large, t.storage(large));
        assert_eq!(1, t.static_size(byte));
        assert_eq!(8, t.aligned_size(byte));
        assert!(!t.is_large_int(int));
        assert!(t.is_large_int(large));
    }

    fn base_types(t: &mut Types) -> (TypeId, TypeId, TypeId, TypeId, TypeId) {
        let int = t.new_int(Some("int"), i32::min_value() as i64, i32::max_value() as i64);
        let ch = t.new_char(Some("char"), 0, 255);
        let b = t.new_bool("bool");
        let void = t.new_void("void");
        let s = t.new_vector(Some("str"), ch);
        t.set_derived_vector(ch, s);
        (int, ch, b, void, s)
    }

    #[test]
    fn test_derivation_interning() {
        let mut t = Types::new();
        let (int, ch, _b, void, s) = base_types(&mut t);

        let v1 = t.derive_vector(int).unwrap();
        let v2 = t.derive_vector(int).unwrap();
        assert_eq!(v1, v2);
        assert_eq!(s, t.derive_vector(ch).unwrap());

        let r1 = t.derive_reference(int).unwrap();
        assert_eq!(r1, t.derive_reference(int).unwrap());

        let rng = t.derive_range(int).unwrap();
        assert_eq!(rng, t.derive_range(int).unwrap());
        assert_eq!(Some(int), t.range_base(rng));
        assert!(t.derive_range(s).is_err());

        // sets are cached on the index type; plain arrays are not interned
        let set1 = t.derive_array(void, int).unwrap();
        let set2 = t.derive_array(void, int).unwrap();
        assert_eq!(set1, set2);
        let a1 = t.derive_array(int, ch).unwrap();
        let a2 = t.derive_array(int, ch).unwrap();
        assert_ne!(a1, a2);
        assert!(t.equals(a1, a2));

        assert!(t.derive_vector(void).is_err());
    }

    #[test]
    fn test_string_classification() {
        let mut t = Types::new();
        let (_int, ch, _b, void, s) = base_types(&mut t);
        assert!(t.is_string(s));
        assert!(t.is_pod_vector(s));
        let sub = t.new_char(None, 0, 127);
        let subvec = t.derive_vector(sub).unwrap();
        assert!(!t.is_string(subvec));
        let empty = t.new_vector(None, void);
        assert!(t.is_empty_vec(empty));
        assert!(!t.is_empty_vec(s));
        let vv = t.derive_vector(s).unwrap();
        assert!(!t.is_pod_vector(vv));
        assert_eq!(Some(ch), t.vector_elem(s));
    }

    #[test]
    fn test_equality_and_assign() {
        let mut t = Types::new();
        let (int, ch, b, void, s) = base_types(&mut t);

        // equality is structural for ordinal ranges
        let i2 = t.new_int(None, i32::min_value() as i64, i32::max_value() as i64);
        assert!(t.equals(int, i2));
        let i3 = t.new_int(None, 0, 10);
        assert!(!t.equals(int, i3));

        // ...and consistency with assignability
        assert!(t.can_assign(int, i2) && t.can_assign(i2, int));
        assert!(t.can_assign(int, i3)); // same largeness suffices
        let large = t.new_int(None, i64::min_value(), i64::max_value());
        assert!(!t.can_assign(int, large));
        assert!(!t.can_assign(large, int));

        assert!(t.can_assign(ch, ch) && !t.can_assign(ch, int));
        assert!(t.can_assign(b, b) && !t.can_assign(b, int));

        // str accepts str, its element, and the empty vector
        let empty = t.new_vector(None, void);
        assert!(t.can_assign(s, s));
        assert!(t.can_assign(s, ch));
        assert!(t.can_assign(s, empty));
        let iv = t.derive_vector(int).unwrap();
        assert!(!t.can_assign(s, iv));

        // two enums with identical members are still distinct
        let e1 = t.new_enum();
        t.enum_register(e1, "a").unwrap();
        t.enum_finish(e1).unwrap();
        let e2 = t.new_enum();
        t.enum_register(e2, "a").unwrap();
        t.enum_finish(e2).unwrap();
        assert!(t.equals(e1, e1));
        assert!(!t.equals(e1, e2));
        assert!(t.can_assign(e1, e1));
        assert!(!t.can_assign(e1, e2));
    }

    #[test]
    fn test_compare_and_cast() {
        let mut t = Types::new();
        let (int, ch, b, _void, s) = base_types(&mut t);
        let tr = t.new_typeref("typeref");

        assert!(t.can_compare_with(int, int));
        assert!(!t.can_compare_with(int, ch));
        assert!(t.can_compare_with(ch, s));
        assert!(t.can_compare_with(s, ch));
        assert!(t.can_compare_with(s, s));
        assert!(t.can_compare_with(b, b));
        assert!(!t.can_compare_with(tr, tr));
        assert!(t.can_check_eq(tr, tr));

        let iv = t.derive_vector(int).unwrap();
        assert!(!t.can_compare_with(iv, iv));
        assert!(t.can_check_eq(iv, iv));

        assert!(t.can_static_cast_to(int, ch));
        assert!(t.can_static_cast_to(ch, int));
        assert!(t.can_static_cast_to(b, int));
        assert!(!t.can_static_cast_to(s, int));
        assert!(t.can_static_cast_to(s, s));
    }

    #[test]
    fn test_subrange_derivation() {
        let mut t = Types::new();
        let (int, _ch, b, _void, _s) = base_types(&mut t);

        let sub = t.derive_ordinal_from_range(int, 10, 20).unwrap();
        assert_ne!(sub, int);
        assert_eq!(Some((10, 20)), t.ord_range(sub));
        assert_eq!(Storage::Byte, t.storage(sub));
        assert!(t.contains(sub, 15));
        assert!(!t.contains(sub, 21));

        // the full range is the base itself
        let same = t
            .derive_ordinal_from_range(int, i32::min_value() as i64, i32::max_value() as i64)
            .unwrap();
        assert_eq!(int, same);

        // inverted and escaping ranges are invalid
        assert!(matches!(
            t.derive_ordinal_from_range(int, 10, 5),
            Err(Error::InvalidSubrange(_))
        ));
        assert!(matches!(
            t.derive_ordinal_from_range(sub, 10, 30),
            Err(Error::InvalidSubrange(_))
        ));
        assert!(t.derive_ordinal_from_range(b, 0, 1).map(|x| x == b).unwrap_or(false));
    }

    #[test]
    fn test_enum_cap() {
        let mut t = Types::new();
        let e = t.new_enum();
        for i in 0..256 {
            t.enum_register(e, &format!("m{}", i)).unwrap();
        }
        assert!(t.enum_finish(e).is_ok());
        assert_eq!(Some((0, 255)), t.ord_range(e));

        let e2 = t.new_enum();
        for i in 0..257 {
            t.enum_register(e2, &format!("m{}", i)).unwrap();
        }
        assert_eq!(Err(Error::Internal(15)), t.enum_finish(e2));
    }

    #[test]
    fn test_definitions() {
        let mut t = Types::new();
        let (int, ch, _b, _void, s) = base_types(&mut t);
        assert_eq!("int", t.definition(int));
        assert_eq!("'int'", t.definition_q(int));
        let sub = t.derive_ordinal_from_range(int, 10, 20).unwrap();
        assert_eq!("10..20", t.definition(sub));
        assert_eq!("10..20 x", t.definition_with(sub, "x"));
        let iv = t.derive_vector(int).unwrap();
        assert_eq!("int[]", t.definition(iv));
        let rng = t.derive_range(ch).unwrap();
        assert_eq!("char[..]", t.definition(rng));
        assert_eq!("str", t.definition(s));
    }

    #[test]
    fn test_owner_set_once() {
        let mut t = Types::new();
        let int = t.new_int(None, 0, 10);
        assert!(t.set_owner(int, ScopeId(0)).is_ok());
        assert_eq!(Err(Error::Internal(3)), t.set_owner(int, ScopeId(1)));
        assert_eq!(Some(ScopeId(0)), t.owner(int));
    }
}
