// The code generator.
//
// CodeGen keeps a compile-time mirror of the runtime stack: every emit
// first applies the shape change (pop inputs, push output) to the gen
// stack, then appends the opcode, so after a well-formed expression the gen
// stack holds exactly one entry whose aligned size equals the running
// total. Literal loads also record their value; run_const_expr uses that to
// return a top-of-stack literal without spinning up the VM, and otherwise
// appends Ret + temp finalizers + End and executes the snippet against a
// null data segment.
//
// Temps: every opcode producing a new vector writes it through a reserved
// local slot, and the matching finalizer is queued into a separate segment
// that is concatenated just before End. That gives each temp exactly one
// release, in LIFO order, on every normal completion.

use log::debug;

use crate::error::{Error, Result};
use crate::scope::{VarId, World};
use crate::types::{Storage, TypeId};
use crate::value::Value;
use crate::vm::{CodeSegment, Op, Vm};


#[derive(Copy, Clone, Debug)]
pub struct GenStackItem {
    pub type_id: TypeId,
    pub value: Option<u64>,
    pub is_func_call: bool,
}


pub struct CodeGen {
    codeseg: CodeSegment,
    finseg: CodeSegment,
    gen_stack: Vec<GenStackItem>,
    gen_stack_size: i32,

    // The scope whose variables this code may address; None for contexts
    // with no runtime data (constant expressions, typeof).
    pub host_scope: Option<crate::types::ScopeId>,
    // Element-type oracle for compound constructors; reset by every push.
    pub result_type_hint: Option<TypeId>,
}


impl CodeGen {
    pub fn new(host_scope: Option<crate::types::ScopeId>) -> CodeGen {
        CodeGen {
            codeseg: CodeSegment::new(),
            finseg: CodeSegment::new(),
            gen_stack: Vec::new(),
            gen_stack_size: 0,
            host_scope,
            result_type_hint: None,
        }
    }

    // --- gen stack ---

    fn gen_push(&mut self, world: &World, t: TypeId) {
        self.gen_stack.push(GenStackItem { type_id: t, value: None, is_func_call: false });
        self.gen_stack_size += world.types.aligned_size(t);
        if self.gen_stack_size > self.codeseg.reserve_stack {
            self.codeseg.reserve_stack = self.gen_stack_size;
        }
        self.result_type_hint = None;
    }

    fn gen_push_value(&mut self, world: &World, t: TypeId, bits: u64) {
        self.gen_push(world, t);
        self.gen_stack.last_mut().unwrap().value = Some(bits);
    }

    pub fn gen_pop(&mut self, world: &World) -> GenStackItem {
        let item = self.gen_stack.pop().unwrap();
        self.gen_stack_size -= world.types.aligned_size(item.type_id);
        item
    }

    // The top entry is now a runtime-computed value; drop any literal it
    // carried so the fold fast path cannot resurrect a stale operand.
    fn gen_invalidate_top(&mut self) {
        if let Some(top) = self.gen_stack.last_mut() {
            top.value = None;
        }
    }

    pub fn gen_top(&self) -> &GenStackItem {
        self.gen_stack.last().unwrap()
    }

    pub fn gen_top_type(&self) -> TypeId {
        self.gen_top().type_id
    }

    pub fn gen_top_is_value(&self) -> bool {
        self.gen_top().value.is_some()
    }

    pub fn gen_pop_type(&mut self, world: &World) -> TypeId {
        self.gen_pop(world).type_id
    }

    pub fn gen_offset(&self) -> i32 {
        self.codeseg.size()
    }

    pub fn gen_stack_depth(&self) -> usize {
        self.gen_stack.len()
    }

    pub fn gen_stack_size(&self) -> i32 {
        self.gen_stack_size
    }

    pub fn verify_clean(&self) -> Result<()> {
        if !self.gen_stack.is_empty() || self.gen_stack_size != 0 {
            return Err(Error::internal(52));
        }
        Ok(())
    }

    // --- constant loads ---

    pub fn gen_load_int_const(&mut self, world: &World, t: TypeId, value: i32) {
        self.gen_push_value(world, t, value as i64 as u64);
        if world.types.is_bool(t) {
            self.codeseg.add_op(if value != 0 { Op::LoadTrue } else { Op::LoadFalse });
        } else if value == 0 {
            self.codeseg.add_op(Op::LoadZero);
        } else if value == 1 {
            self.codeseg.add_op(Op::LoadOne);
        } else {
            self.codeseg.add_op(Op::LoadIntConst);
            self.codeseg.add_int(value);
        }
    }

    pub fn gen_load_large_const(&mut self, world: &World, t: TypeId, value: i64) {
        self.gen_push_value(world, t, value as u64);
        if value == 0 {
            self.codeseg.add_op(Op::LoadLargeZero);
        } else if value == 1 {
            self.codeseg.add_op(Op::LoadLargeOne);
        } else {
            self.codeseg.add_op(Op::LoadLargeConst);
            self.codeseg.add_large(value);
        }
    }

    pub fn gen_load_typeref(&mut self, world: &World, target: TypeId) {
        self.gen_push_value(world, world.default_typeref, target.index() as u64);
        self.codeseg.add_op(Op::LoadTypeRef);
        self.codeseg.add_type(target);
    }

    // The pointer must be interned in the module's constant pool (or
    // otherwise outlive the segment); the gen stack borrows it.
    pub fn gen_load_vec_const(&mut self, world: &World, t: TypeId, p: *const u8) {
        self.gen_push_value(world, t, p as usize as u64);
        if unsafe { crate::buf::raw_len(p) } == 0 {
            self.codeseg.add_op(Op::LoadNullVec);
        } else {
            self.codeseg.add_op(Op::LoadVecConst);
            self.codeseg.add_ptr(p);
        }
    }

    pub fn gen_load_null(&mut self, world: &World) {
        self.gen_push_value(world, world.default_empty_vec, 0);
        self.codeseg.add_op(Op::LoadNullVec);
    }

    pub fn gen_load_const(&mut self, world: &World, t: TypeId, value: &Value) -> Result<()> {
        match world.types.storage(t) {
            Storage::Byte | Storage::Int => self.gen_load_int_const(world, t, value.int_()),
            Storage::Large => self.gen_load_large_const(world, t, value.large_()),
            Storage::Ptr => {
                if world.types.is_typeref(t) {
                    self.gen_load_typeref(world, value.as_typeref());
                } else {
                    return Err(Error::internal(50));
                }
            }
            Storage::Vec => self.gen_load_vec_const(world, t, value.ptr_()),
            Storage::Void => return Err(Error::internal(50)),
        }
        Ok(())
    }

    // --- operations ---

    pub fn gen_mk_subrange(&mut self, world: &mut World) -> Result<()> {
        self.gen_pop(world);
        let t = self.gen_pop_type(world);
        if !world.types.is_ordinal(t) {
            return Err(Error::internal(51));
        }
        let range = world.types.derive_range(t)?;
        self.gen_push(world, range);
        self.codeseg.add_op(Op::MkSubrange);
        Ok(())
    }

    pub fn gen_comparison(&mut self, world: &World, cmp_index: u8) -> Result<()> {
        let right = self.gen_pop_type(world);
        let left = self.gen_pop_type(world);
        let types = &world.types;

        let left_str = types.is_string(left);
        let right_str = types.is_string(right);
        let op = if left_str && types.is_char(right) {
            Some(Op::CmpStrChr)
        } else if left_str && right_str {
            Some(Op::CmpPodVec)
        } else if right_str && types.is_char(left) {
            Some(Op::CmpChrStr)
        } else if types.is_ordinal(left) && types.is_ordinal(right) {
            // if either operand is 64-bit the parser has cast the other
            Some(if types.is_large_int(left) { Op::CmpLarge } else { Op::CmpInt })
        } else if types.is_range(left) && types.is_range(right) {
            Some(Op::CmpLarge)
        } else if types.is_vector(left) && types.is_vector(right)
            && (cmp_index == 0 || cmp_index == 5)
        {
            // vectors admit == and != only
            Some(Op::CmpPodVec)
        } else if types.is_typeref(left) && types.is_typeref(right) {
            Some(Op::CmpTypeRef)
        } else {
            None
        };
        let op = op.ok_or_else(|| Error::internal(52))?;

        self.gen_push(world, world.default_bool);
        self.codeseg.add_op(op);
        let sel = Op::cmp_selector(cmp_index);
        debug_assert!(sel.is_cmp_selector());
        self.codeseg.add_op(sel);
        Ok(())
    }

    pub fn gen_static_cast(&mut self, world: &World, to: TypeId) -> Result<()> {
        let from = self.gen_pop_type(world);
        self.gen_push(world, to);
        let sto_from = world.types.storage(from);
        let sto_to = world.types.storage(to);
        match (sto_from, sto_to) {
            (Storage::Large, Storage::Byte) | (Storage::Large, Storage::Int) => {
                self.codeseg.add_op(Op::LargeToInt)
            }
            (Storage::Byte, Storage::Large) | (Storage::Int, Storage::Large) => {
                self.codeseg.add_op(Op::IntToLarge)
            }
            (Storage::Byte, Storage::Byte)
            | (Storage::Byte, Storage::Int)
            | (Storage::Int, Storage::Byte)
            | (Storage::Int, Storage::Int)
            | (Storage::Large, Storage::Large)
            | (Storage::Ptr, Storage::Ptr)
            | (Storage::Vec, Storage::Vec) => {}
            _ => return Err(Error::internal(59)),
        }
        Ok(())
    }

    pub fn gen_bin_arithm(&mut self, world: &World, op: Op, result: TypeId) {
        self.gen_pop(world);
        self.gen_pop(world);
        self.gen_push(world, result);
        self.codeseg.add_op(op.sized(world.types.is_large_int(result)));
    }

    pub fn gen_un_arithm(&mut self, world: &World, op: Op, result: TypeId) {
        self.gen_pop(world);
        self.gen_push(world, result);
        self.codeseg.add_op(op.sized(world.types.is_large_int(result)));
    }

    pub fn gen_bool_xor(&mut self, world: &World) {
        self.gen_pop(world);
        self.gen_invalidate_top();
        self.codeseg.add_op(Op::BitXor);
    }

    pub fn gen_bool_not(&mut self) {
        self.gen_invalidate_top();
        self.codeseg.add_op(Op::BoolNot);
    }

    pub fn gen_bit_not(&mut self, world: &World) {
        let large = world.types.is_large_int(self.gen_top_type());
        self.gen_invalidate_top();
        self.codeseg.add_op(Op::BitNot.sized(large));
    }

    // --- temps and vector operations ---

    // Reserve a local slot for a vector produced mid-expression and queue
    // its finalizer; runs even without a runtime context, because constant
    // folding needs temps too.
    fn gen_reserve_temp_var(&mut self, world: &World, t: TypeId) -> i32 {
        let offset = self.codeseg.reserve_local_var(world.types.aligned_size(t));
        gen_fin(&mut self.finseg, world, t, offset, true);
        offset
    }

    pub fn gen_elem_to_vec(&mut self, world: &World, vec_type: TypeId) {
        let elem = world.types.vector_elem(vec_type).unwrap();
        self.gen_pop(world);
        self.gen_push(world, vec_type);
        let tmp = self.gen_reserve_temp_var(world, vec_type);
        self.codeseg.add_op(Op::ElemToVec);
        self.codeseg.add_type(elem);
        self.codeseg.add_offs(tmp);
    }

    pub fn gen_vec_cat(&mut self, world: &World) -> Result<()> {
        self.gen_pop(world);
        let vec_type = self.gen_pop_type(world);
        if !world.types.is_vector(vec_type) {
            return Err(Error::internal(64));
        }
        self.gen_push(world, vec_type);
        let tmp = self.gen_reserve_temp_var(world, vec_type);
        self.codeseg.add_op(Op::VecCat);
        self.codeseg.add_type(world.types.vector_elem(vec_type).unwrap());
        self.codeseg.add_offs(tmp);
        Ok(())
    }

    pub fn gen_vec_elem_cat(&mut self, world: &World) -> Result<()> {
        self.gen_pop(world);
        let vec_type = self.gen_pop_type(world);
        if !world.types.is_vector(vec_type) {
            return Err(Error::internal(64));
        }
        self.gen_push(world, vec_type);
        let tmp = self.gen_reserve_temp_var(world, vec_type);
        self.codeseg.add_op(Op::VecElemCat);
        self.codeseg.add_type(world.types.vector_elem(vec_type).unwrap());
        self.codeseg.add_offs(tmp);
        Ok(())
    }

    pub fn gen_copy_to_tmp_vec(&mut self, world: &World) -> Result<i32> {
        let t = self.gen_top_type();
        if !world.types.is_vector(t) {
            return Err(Error::internal(63));
        }
        let tmp = self.gen_reserve_temp_var(world, t);
        self.codeseg.add_op(Op::CopyToTmpVec);
        self.codeseg.add_offs(tmp);
        Ok(tmp)
    }

    pub fn gen_int_to_str(&mut self, world: &World) -> Result<()> {
        let t = self.gen_pop_type(world);
        if !world.types.is_ordinal(t) {
            return Err(Error::internal(68));
        }
        let str_type = world.default_str;
        self.gen_push(world, str_type);
        let tmp = self.gen_reserve_temp_var(world, str_type);
        self.codeseg.add_op(if world.types.is_large_int(t) {
            Op::LargeToStr
        } else {
            Op::IntToStr
        });
        self.codeseg.add_offs(tmp);
        Ok(())
    }

    // --- jumps ---

    pub fn gen_forward_bool_jump(&mut self, world: &World, op: Op) -> Result<i32> {
        if !world.types.is_bool(self.gen_pop_type(world)) {
            return Err(Error::internal(69));
        }
        Ok(self.gen_forward_jump(op))
    }

    pub fn gen_forward_jump(&mut self, op: Op) -> i32 {
        let at = self.gen_offset();
        self.codeseg.add_op(op);
        self.codeseg.add_offs(0);
        at
    }

    pub fn gen_resolve_jump(&mut self, jump_offset: i32) -> Result<()> {
        if !self.codeseg.at(jump_offset).op()?.is_jump() {
            return Err(Error::internal(53));
        }
        self.codeseg
            .patch_offs(jump_offset + 1, self.gen_offset() - (jump_offset + 2));
        // whichever branch ran decides the value at run time
        self.gen_invalidate_top();
        Ok(())
    }

    pub fn gen_jump(&mut self, target: i32) {
        let o = target - (self.gen_offset() + 2);
        self.codeseg.add_op(Op::Jump);
        self.codeseg.add_offs(o);
    }

    // A case label test: emits the selector comparison and a forward jump
    // on its outcome; the selector value stays on the stack.
    pub fn gen_case(&mut self, world: &World, value: &Value, jump_op: Op) -> Result<i32> {
        let types = &world.types;
        let t = value.type_id;
        if types.is_range(t) {
            self.codeseg.add_op(Op::CaseRange);
            self.codeseg.add_large(value.large_());
        } else if types.is_string(t) {
            self.codeseg.add_op(Op::CaseStr);
            self.codeseg.add_ptr(value.ptr_());
        } else if types.is_typeref(t) {
            self.codeseg.add_op(Op::CaseTypeRef);
            self.codeseg.add_type(value.as_typeref());
        } else if types.is_ordinal(t) && !types.is_large_int(t) {
            self.codeseg.add_op(Op::CaseInt);
            self.codeseg.add_int(value.int_());
        } else {
            return Err(Error::internal(65));
        }
        self.gen_push(world, world.default_bool);
        self.gen_pop(world);
        Ok(self.gen_forward_jump(jump_op))
    }

    // --- variables ---

    fn verify_context(&self, world: &World, var: VarId) -> Result<()> {
        match self.host_scope {
            None => Err(Error::NoContext),
            Some(scope) => {
                if world.variable(var).owner != scope {
                    Err(Error::internal(70))
                } else {
                    Ok(())
                }
            }
        }
    }

    pub fn gen_load_var(&mut self, world: &World, var: VarId) -> Result<()> {
        self.verify_context(world, var)?;
        let v = world.variable(var);
        let (t, offset, local) = (v.type_id, v.data_offset, v.local);
        self.gen_push(world, t);
        self.codeseg
            .add_op(Op::load_var_for(world.types.storage(t), local));
        self.codeseg.add_offs(offset);
        Ok(())
    }

    pub fn gen_store_var(&mut self, world: &World, var: VarId) -> Result<()> {
        self.verify_context(world, var)?;
        let v = world.variable(var);
        self.codeseg
            .add_op(Op::store_var_for(world.types.storage(v.type_id), v.local));
        self.codeseg.add_offs(v.data_offset);
        Ok(())
    }

    // First store into a fresh (zeroed) variable slot.
    pub fn gen_init_var(&mut self, world: &World, var: VarId) -> Result<()> {
        self.gen_pop(world);
        self.gen_store_var(world, var)
    }

    pub fn gen_fin_var(&mut self, world: &World, var: VarId) -> Result<()> {
        self.verify_context(world, var)?;
        let v = world.variable(var);
        gen_fin(&mut self.codeseg, world, v.type_id, v.data_offset, v.local);
        Ok(())
    }

    pub fn gen_reserve_local_var(&mut self, world: &World, t: TypeId) -> i32 {
        self.codeseg.reserve_local_var(world.types.aligned_size(t))
    }

    // --- statements ---

    pub fn gen_pop_value(&mut self, world: &World, finalize: bool) {
        let item = self.gen_pop(world);
        match world.types.storage(item.type_id) {
            Storage::Byte | Storage::Int => self.codeseg.add_op(Op::PopInt),
            Storage::Large => self.codeseg.add_op(Op::PopLarge),
            Storage::Ptr => self.codeseg.add_op(Op::PopPtr),
            Storage::Vec => {
                if finalize {
                    self.codeseg.add_op(Op::PopVec);
                    self.codeseg.add_type(item.type_id);
                } else {
                    self.codeseg.add_op(Op::PopPtr);
                }
            }
            Storage::Void => {}
        }
    }

    pub fn gen_echo(&mut self, world: &World) {
        let t = self.gen_pop_type(world);
        self.codeseg.add_op(Op::Echo);
        self.codeseg.add_type(t);
    }

    pub fn gen_echo_ln(&mut self) {
        self.codeseg.add_op(Op::EchoLn);
    }

    pub fn gen_assert(&mut self, world: &World, file: *const u8, line: i32) {
        self.gen_pop(world);
        self.codeseg.add_op(Op::Assert);
        self.codeseg.add_ptr(file);
        self.codeseg.add_int(line);
    }

    pub fn gen_linenum(&mut self, file: *const u8, line: i32) {
        self.codeseg.add_op(Op::Linenum);
        self.codeseg.add_ptr(file);
        self.codeseg.add_int(line);
    }

    pub fn gen_return(&mut self, world: &World) {
        let t = self.gen_pop_type(world);
        self.codeseg.add_op(Op::ret_for(world.types.storage(t)));
    }

    fn gen_finalize_temps(&mut self) {
        if !self.finseg.is_empty() {
            self.codeseg.append(&mut self.finseg);
        }
    }

    fn gen_end(&mut self) {
        if !self.codeseg.is_empty() {
            self.codeseg.add_op(Op::End);
        }
    }

    // Seal and hand over the finished segment (statement-level code).
    pub fn into_code_seg(mut self) -> CodeSegment {
        self.gen_finalize_temps();
        self.gen_end();
        self.codeseg
    }

    // --- constant folding ---

    // Evaluate the expression currently on the gen stack. A literal top is
    // returned directly; otherwise the snippet is sealed with Ret, the
    // temp finalizers and End, and run with no data segment.
    pub fn run_const_expr(&mut self, world: &World, vm: &mut Vm) -> Result<Value> {
        let top = *self.gen_top();
        if let Some(bits) = top.value {
            let v = Value::from_bits(top.type_id, bits);
            return Ok(v.clone_retained(&world.types));
        }

        let result_type = top.type_id;
        self.gen_return(world);
        self.gen_finalize_temps();
        self.gen_end();
        debug!("const expr:\n{}", self.codeseg.dump(&world.types));
        self.verify_clean()?;

        let mut out: Vec<u8> = Vec::new();
        let result = self.codeseg.execute(&world.types, vm, None, &mut out)?;
        debug_assert_eq!(0, vm.stack.bytesize());
        match result {
            Some(v) => Ok(Value::from_bits(result_type, v.bits())),
            None => Ok(Value::void(result_type)),
        }
    }

    // Evaluate a type expression: a typeref yields its target, a range
    // literal yields the derived subrange ordinal; any_obj admits any
    // other value and yields its type (the typeof semantics).
    pub fn run_type_expr(&mut self, world: &mut World, vm: &mut Vm, any_obj: bool) -> Result<Option<TypeId>> {
        {
            let top = self.gen_top();
            if let Some(bits) = top.value {
                if world.types.is_typeref(top.type_id) {
                    return Ok(Some(Value::from_bits(top.type_id, bits).as_typeref()));
                }
            }
        }
        let value = self.run_const_expr(world, vm)?;
        let t = value.type_id;
        if world.types.is_typeref(t) {
            Ok(Some(value.as_typeref()))
        } else if world.types.is_range(t) {
            let base = world.types.range_base(t).unwrap();
            let derived = world.types.derive_ordinal_from_range(
                base,
                value.range_min() as i64,
                value.range_max() as i64,
            )?;
            Ok(Some(derived))
        } else {
            value.release(&world.types);
            Ok(if any_obj { Some(t) } else { None })
        }
    }
}


// Emit the finalizer for a slot of the given type, if it needs one.
fn gen_fin(seg: &mut CodeSegment, world: &World, t: TypeId, offset: i32, local: bool) {
    if world.types.storage(t) != Storage::Vec {
        return;
    }
    if world.types.is_pod_vector(t) {
        seg.add_op(if local { Op::FinLocPodVec } else { Op::FinThisPodVec });
    } else {
        seg.add_op(if local { Op::FinLoc } else { Op::FinThis });
        seg.add_type(t);
    }
    seg.add_offs(offset);
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::buf::Buf;

    fn setup() -> (World, Vm) {
        (World::new(), Vm::new())
    }

    #[test]
    fn test_shape_mirroring() {
        let (w, mut vm) = setup();
        let int = w.default_int;
        let mut cg = CodeGen::new(None);
        cg.gen_load_int_const(&w, int, 2);
        cg.gen_load_int_const(&w, int, 3);
        assert_eq!(2, cg.gen_stack_depth());
        assert_eq!(16, cg.gen_stack_size());
        cg.gen_bin_arithm(&w, Op::Add, int);
        assert_eq!(1, cg.gen_stack_depth());
        assert_eq!(8, cg.gen_stack_size());
        assert_eq!(w.types.aligned_size(cg.gen_top_type()), cg.gen_stack_size());

        let v = cg.run_const_expr(&w, &mut vm).unwrap();
        assert_eq!(5, v.int_());
    }

    #[test]
    fn test_literal_fast_path() {
        let (w, mut vm) = setup();
        let mut cg = CodeGen::new(None);
        cg.gen_load_int_const(&w, w.default_int, 42);
        assert!(cg.gen_top_is_value());
        let v = cg.run_const_expr(&w, &mut vm).unwrap();
        assert_eq!(42, v.int_());
        // nothing was executed, the segment still lacks Ret/End
        assert_eq!(0, vm.stack.bytesize());
    }

    #[test]
    fn test_folding_runs_the_vm() {
        let (w, mut vm) = setup();
        let int = w.default_int;
        let mut cg = CodeGen::new(None);
        cg.gen_load_int_const(&w, int, 6);
        cg.gen_load_int_const(&w, int, 7);
        cg.gen_bin_arithm(&w, Op::Mul, int);
        assert!(!cg.gen_top_is_value());
        let v = cg.run_const_expr(&w, &mut vm).unwrap();
        assert_eq!(42, v.int_());
        assert_eq!(int, v.type_id);
    }

    #[test]
    fn test_string_concat_fold() {
        let (mut w, mut vm) = setup();
        let before = Buf::allocated();
        {
            let m = w.new_module("test", "test.sn").unwrap();
            let s = w.default_str;
            let foo = w.intern(m, b"foo");
            let bar = w.intern(m, b"bar");

            let mut cg = CodeGen::new(None);
            cg.gen_load_vec_const(&w, s, foo);
            cg.gen_load_vec_const(&w, s, bar);
            cg.gen_vec_cat(&w).unwrap();
            let v = cg.run_const_expr(&w, &mut vm).unwrap();
            assert_eq!(s, v.type_id);
            assert_eq!(b"foobar", v.vec_bytes());
            v.release(&w.types);
        }
        drop(w);
        assert_eq!(before, Buf::allocated());
    }

    #[test]
    fn test_elem_to_vec_fold() {
        let (mut w, mut vm) = setup();
        let s = w.default_str;
        let ch = w.default_char;
        let mut cg = CodeGen::new(None);
        cg.gen_load_int_const(&w, ch, b'x' as i32);
        cg.gen_elem_to_vec(&w, s);
        assert_eq!(s, cg.gen_top_type());
        let v = cg.run_const_expr(&w, &mut vm).unwrap();
        assert_eq!(b"x", v.vec_bytes());
        v.release(&w.types);
    }

    #[test]
    fn test_subrange_gen() {
        let (mut w, mut vm) = setup();
        let int = w.default_int;
        let mut cg = CodeGen::new(None);
        cg.gen_load_int_const(&w, int, 1);
        cg.gen_load_int_const(&w, int, 5);
        cg.gen_mk_subrange(&mut w).unwrap();
        assert!(w.types.is_range(cg.gen_top_type()));
        let v = cg.run_const_expr(&w, &mut vm).unwrap();
        assert_eq!(1, v.range_min());
        assert_eq!(5, v.range_max());
    }

    #[test]
    fn test_comparison_selection() {
        let (w, mut vm) = setup();
        let int = w.default_int;
        let b = w.default_bool;

        // 2 < 3
        let mut cg = CodeGen::new(None);
        cg.gen_load_int_const(&w, int, 2);
        cg.gen_load_int_const(&w, int, 3);
        cg.gen_comparison(&w, 1).unwrap();
        assert_eq!(b, cg.gen_top_type());
        let v = cg.run_const_expr(&w, &mut vm).unwrap();
        assert_eq!(1, v.int_());

        // typerefs only compare for equality
        let mut cg = CodeGen::new(None);
        cg.gen_load_typeref(&w, int);
        cg.gen_load_typeref(&w, int);
        cg.gen_comparison(&w, 0).unwrap();
        let v = cg.run_const_expr(&w, &mut vm).unwrap();
        assert_eq!(1, v.int_());
    }

    #[test]
    fn test_static_cast_selection() {
        let (w, mut vm) = setup();
        let int = w.default_int;
        let large = w.default_large;
        let ch = w.default_char;

        let mut cg = CodeGen::new(None);
        cg.gen_load_int_const(&w, int, 65);
        cg.gen_static_cast(&w, large).unwrap();
        assert_eq!(large, cg.gen_top_type());
        let v = cg.run_const_expr(&w, &mut vm).unwrap();
        assert_eq!(65, v.large_());

        let mut cg = CodeGen::new(None);
        cg.gen_load_large_const(&w, large, 0x1_0000_0041);
        cg.gen_static_cast(&w, int).unwrap();
        let v = cg.run_const_expr(&w, &mut vm).unwrap();
        assert_eq!(0x41, v.int_());

        // int to char is a no-op at runtime, only the gen type changes
        let mut cg = CodeGen::new(None);
        cg.gen_load_int_const(&w, int, 65);
        cg.gen_static_cast(&w, ch).unwrap();
        assert_eq!(ch, cg.gen_top_type());

        let mut cg = CodeGen::new(None);
        cg.gen_load_vec_const(&w, w.default_str, std::ptr::null());
        assert!(cg.gen_static_cast(&w, int).is_err());
    }

    #[test]
    fn test_jump_patching() {
        let (w, mut vm) = setup();
        let b = w.default_bool;
        // true and false
        let mut cg = CodeGen::new(None);
        cg.gen_load_int_const(&w, b, 1);
        let j = cg.gen_forward_bool_jump(&w, Op::JumpAnd).unwrap();
        cg.gen_load_int_const(&w, b, 0);
        cg.gen_resolve_jump(j).unwrap();
        let v = cg.run_const_expr(&w, &mut vm).unwrap();
        assert_eq!(0, v.int_());

        // resolving a non-jump is an internal error
        let mut cg = CodeGen::new(None);
        cg.gen_load_int_const(&w, w.default_int, 7);
        assert!(cg.gen_resolve_jump(0).is_err());
    }

    #[test]
    fn test_run_type_expr() {
        let (mut w, mut vm) = setup();
        let int = w.default_int;

        // a typeref literal short-circuits
        let mut cg = CodeGen::new(None);
        cg.gen_load_typeref(&w, int);
        assert_eq!(Some(int), cg.run_type_expr(&mut w, &mut vm, false).unwrap());

        // a range value derives a subrange ordinal
        let mut cg = CodeGen::new(None);
        cg.gen_load_int_const(&w, int, 10);
        cg.gen_load_int_const(&w, int, 20);
        cg.gen_mk_subrange(&mut w).unwrap();
        let sub = cg.run_type_expr(&mut w, &mut vm, false).unwrap().unwrap();
        assert_eq!(Some((10, 20)), w.types.ord_range(sub));

        // any other value only passes with any_obj (typeof semantics)
        let mut cg = CodeGen::new(None);
        cg.gen_load_int_const(&w, int, 7);
        assert_eq!(None, cg.run_type_expr(&mut w, &mut vm, false).unwrap());
        let mut cg = CodeGen::new(None);
        cg.gen_load_int_const(&w, int, 7);
        assert_eq!(Some(int), cg.run_type_expr(&mut w, &mut vm, true).unwrap());
    }

    #[test]
    fn test_var_access_requires_context() {
        let (mut w, _vm) = setup();
        let m = w.new_module("test", "test.sn").unwrap();
        let var = w.add_module_variable(m, "x", w.default_int).unwrap();

        let mut cg = CodeGen::new(None);
        assert_eq!(Err(Error::NoContext), cg.gen_load_var(&w, var));

        let scope = w.module(m).scope;
        let mut cg = CodeGen::new(Some(scope));
        assert!(cg.gen_load_var(&w, var).is_ok());
        assert_eq!(w.default_int, cg.gen_top_type());
    }

    #[test]
    fn test_statement_segment() {
        let (mut w, mut vm) = setup();
        let m = w.new_module("test", "test.sn").unwrap();
        let scope = w.module(m).scope;
        let s = w.default_str;
        let var = w.add_module_variable(m, "greeting", s).unwrap();
        let hello = w.intern(m, b"hello");
        let file = w.intern(m, b"test.sn");

        let mut cg = CodeGen::new(Some(scope));
        cg.gen_linenum(file, 2);
        cg.gen_load_vec_const(&w, s, hello);
        cg.gen_init_var(&w, var).unwrap();
        cg.gen_load_var(&w, var).unwrap();
        cg.gen_echo(&w);
        cg.gen_echo_ln();
        // static finalization before End, as the module driver does
        cg.gen_fin_var(&w, var).unwrap();
        let seg = cg.into_code_seg();

        let mut data = vec![0u8; w.module(m).data_size as usize];
        let mut out: Vec<u8> = Vec::new();
        seg.execute(&w.types, &mut vm, Some(&mut data), &mut out).unwrap();
        assert_eq!(b"hello\n".to_vec(), out);
    }

    #[test]
    fn test_temp_helpers() {
        let (w, mut vm) = setup();
        let int = w.default_int;

        // ordinal formatted into a string through a temp slot
        let mut cg = CodeGen::new(None);
        cg.gen_load_int_const(&w, int, 42);
        cg.gen_int_to_str(&w).unwrap();
        assert_eq!(w.default_str, cg.gen_top_type());
        let v = cg.run_const_expr(&w, &mut vm).unwrap();
        assert_eq!(b"42", v.vec_bytes());
        v.release(&w.types);

        let mut cg = CodeGen::new(None);
        cg.gen_load_large_const(&w, w.default_large, 1 << 40);
        cg.gen_int_to_str(&w).unwrap();
        let v = cg.run_const_expr(&w, &mut vm).unwrap();
        assert_eq!(b"1099511627776", v.vec_bytes());
        v.release(&w.types);

        // anchoring a produced vector in a second temp slot
        let mut cg = CodeGen::new(None);
        cg.gen_load_int_const(&w, w.default_char, b'q' as i32);
        cg.gen_elem_to_vec(&w, w.default_str);
        cg.gen_copy_to_tmp_vec(&w).unwrap();
        let v = cg.run_const_expr(&w, &mut vm).unwrap();
        assert_eq!(b"q", v.vec_bytes());
        v.release(&w.types);
    }

    #[test]
    fn test_jump_and_pop_helpers() {
        let (w, mut vm) = setup();
        let int = w.default_int;

        // forward jump to a backward jump into an island of code
        let mut cg = CodeGen::new(None);
        let f = cg.gen_forward_jump(Op::Jump);
        let island = cg.gen_offset();
        cg.gen_load_int_const(&w, int, 7);
        let out = cg.gen_forward_jump(Op::Jump);
        cg.gen_resolve_jump(f).unwrap();
        cg.gen_jump(island);
        cg.gen_resolve_jump(out).unwrap();
        let v = cg.run_const_expr(&w, &mut vm).unwrap();
        assert_eq!(7, v.int_());

        // a discarded intermediate value
        let mut cg = CodeGen::new(None);
        cg.gen_load_int_const(&w, int, 2);
        cg.gen_load_int_const(&w, int, 3);
        cg.gen_bin_arithm(&w, Op::Add, int);
        cg.gen_pop_value(&w, false);
        cg.gen_load_int_const(&w, int, 1);
        cg.gen_load_int_const(&w, int, 1);
        cg.gen_bin_arithm(&w, Op::Add, int);
        let v = cg.run_const_expr(&w, &mut vm).unwrap();
        assert_eq!(2, v.int_());
    }

    #[test]
    fn test_case_shape() {
        let (w, _vm) = setup();
        let int = w.default_int;
        let mut cg = CodeGen::new(None);
        cg.gen_load_int_const(&w, int, 3);
        let v = Value::int(int, 3);
        let j = cg.gen_case(&w, &v, Op::JumpTrue).unwrap();
        cg.gen_resolve_jump(j).unwrap();
        // the selector is still the top of the gen stack
        assert_eq!(1, cg.gen_stack_depth());
        assert_eq!(int, cg.gen_top_type());
    }
}
