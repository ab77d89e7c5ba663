// Tagged literal values: a TypeId plus 8 raw bytes.
//
// Values are plain bits and deliberately do not implement Drop: they
// migrate between containers (named constants, the gen stack, emitted code,
// VM results) without passing through constructors, so the refcount of a
// vector payload is managed through three explicit operations instead:
// retain (clone_retained, assign_to_buf), release (release, finalize_vec)
// and take (wrapping a pointer whose reference is being transferred).
// The owning containers - scopes for constants, the driver for expression
// results - call release when they are done.

use crate::buf;
use crate::types::{Storage, TypeId, Types};


#[derive(Copy, Clone, Debug)]
pub struct Value {
    pub type_id: TypeId,
    raw: u64,
}


impl Value {
    pub fn int(type_id: TypeId, v: i32) -> Value {
        Value { type_id, raw: v as i64 as u64 }
    }

    pub fn large(type_id: TypeId, v: i64) -> Value {
        Value { type_id, raw: v as u64 }
    }

    // A range literal packs (max << 32) | min.
    pub fn range(type_id: TypeId, min: i32, max: i32) -> Value {
        Value {
            type_id,
            raw: ((max as u32 as u64) << 32) | min as u32 as u64,
        }
    }

    pub fn typeref(type_id: TypeId, target: TypeId) -> Value {
        Value { type_id, raw: target.index() as u64 }
    }

    pub fn void(type_id: TypeId) -> Value {
        Value { type_id, raw: 0 }
    }

    // Take ownership of a raw vector payload pointer: the pointer's
    // reference is transferred into the value, no retain happens.
    pub fn vec_take(type_id: TypeId, p: *mut u8) -> Value {
        Value { type_id, raw: p as u64 }
    }

    // Wrap a borrowed payload pointer, retaining it.
    pub fn vec_retain(type_id: TypeId, p: *mut u8) -> Value {
        unsafe { buf::retain_raw(p) };
        Value { type_id, raw: p as u64 }
    }

    pub fn bits(&self) -> u64 {
        self.raw
    }

    pub fn from_bits(type_id: TypeId, raw: u64) -> Value {
        Value { type_id, raw }
    }

    pub fn int_(&self) -> i32 {
        self.raw as u32 as i32
    }

    pub fn large_(&self) -> i64 {
        self.raw as i64
    }

    pub fn ptr_(&self) -> *mut u8 {
        self.raw as usize as *mut u8
    }

    pub fn as_typeref(&self) -> TypeId {
        TypeId(self.raw as u32)
    }

    pub fn range_min(&self) -> i32 {
        self.raw as u32 as i32
    }

    pub fn range_max(&self) -> i32 {
        (self.raw >> 32) as u32 as i32
    }

    // The ordinal value widened to 64 bits, honoring the storage width.
    pub fn ord_value(&self, types: &Types) -> i64 {
        if types.is_large_int(self.type_id) {
            self.large_()
        } else {
            self.int_() as i64
        }
    }

    pub fn clone_retained(&self, types: &Types) -> Value {
        if types.storage(self.type_id) == Storage::Vec {
            unsafe { buf::retain_raw(self.ptr_()) };
        }
        *self
    }

    pub fn release(&self, types: &Types) {
        if types.storage(self.type_id) == Storage::Vec {
            unsafe { finalize_vec(types, self.type_id, self.ptr_()) };
        }
    }

    pub fn vec_bytes(&self) -> &[u8] {
        unsafe { buf::raw_bytes(self.ptr_()) }
    }

    // Read a value of the given type out of raw memory. Vector payload
    // pointers are retained: the resulting value owns a reference.
    pub unsafe fn assign_from_buf(types: &Types, type_id: TypeId, p: *const u8) -> Value {
        match types.storage(type_id) {
            Storage::Byte => Value::int(type_id, *p as i32),
            Storage::Int => Value::int(type_id, (p as *const i32).read_unaligned()),
            Storage::Large => Value::large(type_id, (p as *const i64).read_unaligned()),
            Storage::Ptr => Value::from_bits(type_id, (p as *const u64).read_unaligned()),
            Storage::Vec => {
                let v = (p as *const u64).read_unaligned();
                buf::retain_raw(v as usize as *mut u8);
                Value::from_bits(type_id, v)
            }
            Storage::Void => Value::void(type_id),
        }
    }

    // Write this value into raw memory at the type's static (unaligned)
    // size. A stored vector pointer is retained: the destination becomes
    // an owner.
    pub unsafe fn assign_to_buf(&self, types: &Types, p: *mut u8) {
        match types.storage(self.type_id) {
            Storage::Byte => *p = self.int_() as u8,
            Storage::Int => (p as *mut i32).write_unaligned(self.int_()),
            Storage::Large => (p as *mut i64).write_unaligned(self.large_()),
            Storage::Ptr => (p as *mut u64).write_unaligned(self.raw),
            Storage::Vec => {
                buf::retain_raw(self.ptr_());
                (p as *mut u64).write_unaligned(self.raw);
            }
            Storage::Void => {}
        }
    }
}


// Release one reference to a vector payload. When this was the last
// reference and the element type is itself vector-class, the element
// pointers are released first.
pub unsafe fn finalize_vec(types: &Types, vec_type: TypeId, p: *mut u8) {
    if p.is_null() {
        return;
    }
    if !types.is_pod_vector(vec_type) && buf::raw_refcount(p) == 1 {
        if let Some(elem) = types.vector_elem(vec_type) {
            let bytes = buf::raw_bytes(p);
            let mut at = 0;
            while at + 8 <= bytes.len() {
                let ep = (bytes.as_ptr().add(at) as *const u64).read_unaligned();
                finalize_vec(types, elem, ep as usize as *mut u8);
                at += 8;
            }
        }
    }
    buf::release_raw(p);
}


impl Types {
    // Human-readable rendering, quoting strings and chars; used by error
    // messages and the debug dump.
    pub fn display_value(&self, v: &Value) -> String {
        use crate::source::{mk_printable, mk_printable_char};
        let ty = v.type_id;
        if self.is_large_int(ty) {
            format!("{}L", v.large_())
        } else if self.is_int(ty) {
            format!("{}", v.int_())
        } else if self.is_char(ty) {
            format!("'{}'", mk_printable_char(v.int_() as u8))
        } else if self.is_enum(ty) {
            match self.enum_member(ty, v.int_() as i64) {
                Some(name) => name.to_string(),
                None => format!("{}", v.int_()),
            }
        } else if self.is_bool(ty) {
            if v.int_() != 0 { "true" } else { "false" }.to_string()
        } else if self.is_typeref(ty) {
            format!("typeof({})", self.definition(v.as_typeref()))
        } else if self.is_range(ty) {
            let base = self.range_base(ty).unwrap();
            let lo = Value::int(base, v.range_min());
            let hi = Value::int(base, v.range_max());
            format!("{}..{}", self.display_value(&lo), self.display_value(&hi))
        } else if self.is_string(ty) {
            format!("'{}'", mk_printable(v.vec_bytes()))
        } else if self.is_vector(ty) {
            let elem = self.vector_elem(ty).unwrap();
            let elem_size = self.static_size(elem);
            if elem_size == 0 {
                return "[]".to_string();
            }
            let bytes = v.vec_bytes();
            let mut items = Vec::new();
            let mut at = 0;
            while at + elem_size as usize <= bytes.len() {
                let ev = unsafe {
                    Value::assign_from_buf(self, elem, bytes.as_ptr().add(at))
                };
                items.push(self.display_value(&ev));
                ev.release(self);
                at += elem_size as usize;
            }
            format!("[{}]", items.join(", "))
        } else if self.is_reference(ty) {
            let base = self.reference_base(ty).unwrap();
            self.display_value(&Value::from_bits(base, v.bits()))
        } else {
            "null".to_string()
        }
    }

    // Rendering for the echo statement: strings and chars print raw, all
    // other values as displayed.
    pub fn echo_value(&self, v: &Value) -> Vec<u8> {
        if self.is_string(v.type_id) {
            v.vec_bytes().to_vec()
        } else if self.is_char(v.type_id) {
            vec![v.int_() as u8]
        } else {
            self.display_value(v).into_bytes()
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::buf::Buf;

    fn setup() -> (Types, TypeId, TypeId, TypeId, TypeId) {
        let mut t = Types::new();
        let int = t.new_int(Some("int"), i32::min_value() as i64, i32::max_value() as i64);
        let ch = t.new_char(Some("char"), 0, 255);
        let s = t.new_vector(Some("str"), ch);
        t.set_derived_vector(ch, s);
        let b = t.new_bool("bool");
        (t, int, ch, s, b)
    }

    #[test]
    fn test_range_packing() {
        let (mut t, int, _ch, _s, _b) = setup();
        let rt = t.derive_range(int).unwrap();
        let v = Value::range(rt, 1, 5);
        assert_eq!(1, v.range_min());
        assert_eq!(5, v.range_max());
        assert_eq!(((5u64) << 32) | 1, v.bits());
        let neg = Value::range(rt, -5, 5);
        assert_eq!(-5, neg.range_min());
        assert_eq!(5, neg.range_max());
        assert_eq!("1..5", t.display_value(&v));
    }

    #[test]
    fn test_buf_roundtrip() {
        let (t, int, _ch, s, _b) = setup();
        let mut mem = [0u8; 16];

        let v = Value::int(int, -42);
        unsafe { v.assign_to_buf(&t, mem.as_mut_ptr()) };
        let back = unsafe { Value::assign_from_buf(&t, int, mem.as_ptr()) };
        assert_eq!(-42, back.int_());

        let before = Buf::allocated();
        let b = Buf::from_bytes(b"hello");
        let v = Value::vec_retain(s, b.raw());
        assert_eq!(2, b.refcount());
        unsafe { v.assign_to_buf(&t, mem.as_mut_ptr()) };
        assert_eq!(3, b.refcount());
        let back = unsafe { Value::assign_from_buf(&t, s, mem.as_ptr()) };
        assert_eq!(b"hello", back.vec_bytes());
        assert_eq!(4, b.refcount());
        back.release(&t);
        v.release(&t);
        // hand back the reference held by the memory slot itself
        let slot = unsafe { (mem.as_ptr() as *const u64).read_unaligned() };
        unsafe { buf::release_raw(slot as usize as *mut u8) };
        assert_eq!(1, b.refcount());
        drop(b);
        assert_eq!(before, Buf::allocated());
    }

    #[test]
    fn test_nested_finalize() {
        let (mut t, _int, _ch, s, _b) = setup();
        let vv = t.derive_vector(s).unwrap();
        let before = Buf::allocated();

        // build ['ab', 'cd'] by hand: two retained pointers in a payload
        let a = Buf::from_bytes(b"ab");
        let b = Buf::from_bytes(b"cd");
        let mut outer = Buf::from_bytes(&[0u8; 16]);
        let va = Value::vec_retain(s, a.raw());
        let vb = Value::vec_retain(s, b.raw());
        unsafe {
            va.assign_to_buf(&t, outer.raw());
            vb.assign_to_buf(&t, outer.raw().add(8));
        }
        va.release(&t);
        vb.release(&t);
        assert_eq!(2, a.refcount());
        drop(a);
        drop(b);

        let outer_val = Value::vec_take(vv, outer.into_raw());
        outer_val.release(&t);
        assert_eq!(before, Buf::allocated());
    }

    #[test]
    fn test_display() {
        let (mut t, int, ch, s, b) = setup();
        assert_eq!("42", t.display_value(&Value::int(int, 42)));
        assert_eq!("'a'", t.display_value(&Value::int(ch, b'a' as i32)));
        assert_eq!("true", t.display_value(&Value::int(b, 1)));
        let large = t.new_int(None, i64::min_value(), i64::max_value());
        assert_eq!("7L", t.display_value(&Value::large(large, 7)));

        let buf = Buf::from_bytes(b"hi");
        let v = Value::vec_retain(s, buf.raw());
        assert_eq!("'hi'", t.display_value(&v));
        assert_eq!(b"hi".to_vec(), t.echo_value(&v));
        v.release(&t);

        let e = t.new_enum();
        t.enum_register(e, "Red").unwrap();
        t.enum_register(e, "Green").unwrap();
        t.enum_finish(e).unwrap();
        assert_eq!("Green", t.display_value(&Value::int(e, 1)));

        let tr = t.new_typeref("typeref");
        assert_eq!("typeof(int)", t.display_value(&Value::typeref(tr, int)));
    }

    #[test]
    fn test_int_vector_display() {
        let (mut t, int, _ch, _s, _b) = setup();
        let iv = t.derive_vector(int).unwrap();
        let mut payload = Buf::null();
        for n in &[1i32, 2, 3] {
            payload.append(&n.to_le_bytes());
        }
        let v = Value::vec_retain(iv, payload.raw());
        assert_eq!("[1, 2, 3]", t.display_value(&v));
        v.release(&t);
    }
}
