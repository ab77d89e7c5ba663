// (C) 2020 Brandon Lewis
//
// The bytecode virtual machine.
//
// A CodeSegment is an append-only vector of word-sized quanta; an opcode
// occupies one quantum and its operands the following ones (int, offset,
// large, type id or raw pointer - one word each on a 64-bit host).
//
// Execution is a single-threaded fetch-dispatch loop over a byte stack and
// an optional module data segment. Every stack slot is one aligned word;
// only vector payloads pack tighter. Vector payload pointers sitting on the
// stack are borrowed - the owners are interned constants, named variables,
// codegen temp slots and result values - so plain pops never touch the
// refcount, and the Fin*/PopVec family releases through the stored type
// descriptor.
//
// The segment layout for an expression is: code, Ret*, temp finalizers,
// End. Ret captures the result but does not stop the loop; the finalizers
// then release the temps and End restores the stack, which is what makes
// at-most-once release of every temp a structural property.

use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::convert::TryFrom;

use crate::buf::{self, Buf};
use crate::error::{Error, Result};
use crate::types::{Storage, TypeId, Types};
use crate::value::{finalize_vec, Value};


// The opcode alphabet. Group order is load-bearing: Ret*, LoadThis*,
// StoreThis*, LoadLoc* and StoreLoc* advance in Storage order, binary and
// unary arithmetic pairs sit at (op, op + 1) for the int/large selection,
// and the comparator selectors EQ..NE mirror the comparison token order.
#[derive(Copy, Clone, PartialEq, Eq, Debug, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Op {
    End = 0,
    Nop,

    RetByte,
    RetInt,
    RetLarge,
    RetPtr,
    RetVec,
    RetVoid,

    LoadZero,
    LoadLargeZero,
    LoadOne,
    LoadLargeOne,
    LoadIntConst,   // [int]
    LoadLargeConst, // [large]
    LoadFalse,
    LoadTrue,
    LoadNullVec,
    LoadVecConst, // [ptr]
    LoadTypeRef,  // [type]

    LoadThisByte, // [offs]
    LoadThisInt,
    LoadThisLarge,
    LoadThisPtr,
    LoadThisVec,
    LoadThisVoid,
    StoreThisByte, // [offs]
    StoreThisInt,
    StoreThisLarge,
    StoreThisPtr,
    StoreThisVec,
    StoreThisVoid,
    FinThisPodVec, // [offs]
    FinThis,       // [type, offs]

    LoadLocByte, // [offs]
    LoadLocInt,
    LoadLocLarge,
    LoadLocPtr,
    LoadLocVec,
    LoadLocVoid,
    StoreLocByte, // [offs]
    StoreLocInt,
    StoreLocLarge,
    StoreLocPtr,
    StoreLocVec,
    StoreLocVoid,
    FinLocPodVec, // [offs]
    FinLoc,       // [type, offs]

    LoadRef, // [offs]

    PopInt,
    PopLarge,
    PopPtr,
    PopVec, // [type]

    CopyToTmpVec, // [offs]
    ElemToVec,    // [type, offs]
    VecCat,       // [type, offs]
    VecElemCat,   // [type, offs]

    CmpInt,
    CmpLarge,
    CmpStrChr,
    CmpChrStr,
    CmpPodVec,
    CmpTypeRef,

    CaseInt,     // [int]
    CaseRange,   // [large]
    CaseStr,     // [ptr]
    CaseTypeRef, // [type]

    EQ,
    LT,
    LE,
    GE,
    GT,
    NE,

    LargeToInt,
    IntToLarge,
    IntToStr,   // [offs]
    LargeToStr, // [offs]

    MkSubrange,

    Add,
    AddLarge,
    Sub,
    SubLarge,
    Mul,
    MulLarge,
    Div,
    DivLarge,
    Mod,
    ModLarge,
    BitAnd,
    BitAndLarge,
    BitOr,
    BitOrLarge,
    BitXor,
    BitXorLarge,
    BitShl,
    BitShlLarge,
    BitShr,
    BitShrLarge,

    Neg,
    NegLarge,
    BitNot,
    BitNotLarge,
    BoolNot,

    JumpOr,    // [offs]
    JumpAnd,   // [offs]
    JumpTrue,  // [offs]
    JumpFalse, // [offs]
    Jump,      // [offs]

    Call, // [ptr]

    Echo, // [type]
    EchoLn,
    Assert,  // [ptr, int]
    Linenum, // [ptr, int]
}


impl Op {
    fn plus(self, delta: u8) -> Op {
        Op::try_from(u8::from(self) + delta).unwrap()
    }

    pub fn ret_for(sto: Storage) -> Op {
        Op::RetByte.plus(sto as u8)
    }

    pub fn load_var_for(sto: Storage, local: bool) -> Op {
        let base = if local { Op::LoadLocByte } else { Op::LoadThisByte };
        base.plus(sto as u8)
    }

    pub fn store_var_for(sto: Storage, local: bool) -> Op {
        let base = if local { Op::StoreLocByte } else { Op::StoreThisByte };
        base.plus(sto as u8)
    }

    // Select the int or the large flavor of an arithmetic pair.
    pub fn sized(self, large: bool) -> Op {
        self.plus(large as u8)
    }

    // Comparator selector from the comparison token index (==, <, <=, >=,
    // >, !=).
    pub fn cmp_selector(index: u8) -> Op {
        Op::EQ.plus(index)
    }

    pub fn is_jump(self) -> bool {
        let c = u8::from(self);
        c >= u8::from(Op::JumpOr) && c <= u8::from(Op::Jump)
    }

    pub fn is_cmp_selector(self) -> bool {
        let c = u8::from(self);
        c >= u8::from(Op::EQ) && c <= u8::from(Op::NE)
    }

    // Operand quanta following the opcode.
    pub fn operand_count(self) -> usize {
        use Op::*;
        match self {
            LoadIntConst | LoadLargeConst | LoadVecConst | LoadTypeRef | CaseInt | CaseRange
            | CaseStr | CaseTypeRef | Call => 1,
            LoadThisByte | LoadThisInt | LoadThisLarge | LoadThisPtr | LoadThisVec
            | LoadThisVoid | StoreThisByte | StoreThisInt | StoreThisLarge | StoreThisPtr
            | StoreThisVec | StoreThisVoid | FinThisPodVec | LoadLocByte | LoadLocInt
            | LoadLocLarge | LoadLocPtr | LoadLocVec | LoadLocVoid | StoreLocByte
            | StoreLocInt | StoreLocLarge | StoreLocPtr | StoreLocVec | StoreLocVoid
            | FinLocPodVec | LoadRef | CopyToTmpVec | IntToStr | LargeToStr | JumpOr
            | JumpAnd | JumpTrue | JumpFalse | Jump | PopVec | Echo => 1,
            FinThis | FinLoc | ElemToVec | VecCat | VecElemCat | Assert | Linenum => 2,
            _ => 0,
        }
    }
}


// One word of code: an opcode or an operand, type-punned by the accessors.
#[derive(Copy, Clone)]
pub struct Quant(u64);

impl Quant {
    pub fn from_op(op: Op) -> Quant {
        Quant(u8::from(op) as u64)
    }

    pub fn from_int(v: i32) -> Quant {
        Quant(v as u32 as u64)
    }

    pub fn from_offs(v: i32) -> Quant {
        Quant(v as u32 as u64)
    }

    pub fn from_large(v: i64) -> Quant {
        Quant(v as u64)
    }

    pub fn from_ptr(p: *const u8) -> Quant {
        Quant(p as usize as u64)
    }

    pub fn from_type(t: TypeId) -> Quant {
        Quant(t.index() as u64)
    }

    pub fn op(self) -> Result<Op> {
        Op::try_from(self.0 as u8).map_err(|_| Error::IllegalOpcode)
    }

    pub fn int_(self) -> i32 {
        self.0 as u32 as i32
    }

    pub fn offs_(self) -> i32 {
        self.0 as u32 as i32
    }

    pub fn large_(self) -> i64 {
        self.0 as i64
    }

    pub fn ptr_(self) -> *const u8 {
        self.0 as usize as *const u8
    }

    pub fn type_(self) -> TypeId {
        TypeId(self.0 as u32)
    }
}


pub struct CodeSegment {
    quants: Vec<Quant>,
    // High-water of the compile-time stack shape, in bytes.
    pub reserve_stack: i32,
    // Size of the local frame (codegen temps), in bytes.
    pub reserve_locals: i32,
}


impl CodeSegment {
    pub fn new() -> CodeSegment {
        CodeSegment { quants: Vec::new(), reserve_stack: 0, reserve_locals: 0 }
    }

    pub fn size(&self) -> i32 {
        self.quants.len() as i32
    }

    pub fn is_empty(&self) -> bool {
        self.quants.is_empty()
    }

    pub fn clear(&mut self) {
        self.quants.clear();
        self.reserve_stack = 0;
        self.reserve_locals = 0;
    }

    pub fn add_op(&mut self, op: Op) {
        self.quants.push(Quant::from_op(op));
    }

    pub fn add_int(&mut self, v: i32) {
        self.quants.push(Quant::from_int(v));
    }

    pub fn add_offs(&mut self, v: i32) {
        self.quants.push(Quant::from_offs(v));
    }

    pub fn add_large(&mut self, v: i64) {
        self.quants.push(Quant::from_large(v));
    }

    pub fn add_ptr(&mut self, p: *const u8) {
        self.quants.push(Quant::from_ptr(p));
    }

    pub fn add_type(&mut self, t: TypeId) {
        self.quants.push(Quant::from_type(t));
    }

    pub fn at(&self, i: i32) -> Quant {
        self.quants[i as usize]
    }

    pub fn patch_offs(&mut self, i: i32, v: i32) {
        self.quants[i as usize] = Quant::from_offs(v);
    }

    // Reserve an aligned local slot; returns its frame offset.
    pub fn reserve_local_var(&mut self, aligned_size: i32) -> i32 {
        let offset = self.reserve_locals;
        self.reserve_locals += aligned_size;
        offset
    }

    // Concatenate another segment (the finalization segment).
    pub fn append(&mut self, other: &mut CodeSegment) {
        self.quants.append(&mut other.quants);
    }

    // Opcode-by-opcode rendering for diagnostics.
    pub fn dump(&self, types: &Types) -> String {
        let mut out = format!(
            "  $locals({})  $stack({})\n",
            self.reserve_locals, self.reserve_stack
        );
        let mut i = 0;
        while i < self.size() {
            let op = match self.at(i).op() {
                Ok(op) => op,
                Err(_) => {
                    out.push_str("  ???\n");
                    break;
                }
            };
            if op == Op::Linenum {
                let file = unsafe { buf::raw_bytes(self.at(i + 1).ptr_()) };
                out.push_str(&format!(
                    "; --- {}({})\n",
                    String::from_utf8_lossy(file),
                    self.at(i + 2).int_()
                ));
                i += 3;
                continue;
            }
            out.push_str(&format!("  {:<15}", format!("{:?}", op)));
            match op {
                Op::LoadIntConst | Op::CaseInt => {
                    out.push_str(&format!(" {}", self.at(i + 1).int_()))
                }
                Op::LoadLargeConst | Op::CaseRange => {
                    out.push_str(&format!(" {}", self.at(i + 1).large_()))
                }
                Op::LoadVecConst | Op::CaseStr => {
                    let s = unsafe { buf::raw_bytes(self.at(i + 1).ptr_()) };
                    out.push_str(&format!(" '{}'", String::from_utf8_lossy(s)));
                }
                Op::LoadTypeRef | Op::PopVec | Op::Echo | Op::CaseTypeRef => {
                    out.push_str(&format!(" {}", types.definition(self.at(i + 1).type_())))
                }
                Op::FinThis | Op::FinLoc | Op::ElemToVec | Op::VecCat | Op::VecElemCat => {
                    out.push_str(&format!(
                        " {}, *{}",
                        types.definition(self.at(i + 1).type_()),
                        self.at(i + 2).offs_()
                    ));
                }
                Op::Assert => {
                    out.push_str(&format!(" line {}", self.at(i + 2).int_()));
                }
                _ if op.operand_count() == 1 => {
                    out.push_str(&format!(" *{}", self.at(i + 1).offs_()))
                }
                _ => {}
            }
            out.push('\n');
            i += 1 + op.operand_count() as i32;
        }
        out
    }
}


// The runtime byte stack. Every push and pop moves one aligned word; the
// typed accessors only interpret the bits.
pub struct DataStack {
    buf: Vec<u8>,
}


impl DataStack {
    pub fn new() -> DataStack {
        DataStack { buf: Vec::new() }
    }

    pub fn bytesize(&self) -> i32 {
        self.buf.len() as i32
    }

    pub fn push_slot(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn pop_slot(&mut self) -> u64 {
        let at = self.buf.len() - 8;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.buf[at..]);
        self.buf.truncate(at);
        u64::from_le_bytes(raw)
    }

    pub fn top_slot(&self) -> u64 {
        let at = self.buf.len() - 8;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.buf[at..]);
        u64::from_le_bytes(raw)
    }

    pub fn push_int(&mut self, v: i32) {
        self.push_slot(v as i64 as u64);
    }

    pub fn pop_int(&mut self) -> i32 {
        self.pop_slot() as u32 as i32
    }

    pub fn push_large(&mut self, v: i64) {
        self.push_slot(v as u64);
    }

    pub fn pop_large(&mut self) -> i64 {
        self.pop_slot() as i64
    }

    pub fn push_ptr(&mut self, p: u64) {
        self.push_slot(p);
    }

    pub fn pop_ptr(&mut self) -> u64 {
        self.pop_slot()
    }

    pub fn grow_zeroed(&mut self, bytes: i32) {
        self.buf.resize(self.buf.len() + bytes as usize, 0);
    }

    pub fn truncate(&mut self, bytesize: i32) {
        self.buf.truncate(bytesize as usize);
    }

    pub fn read_slot_at(&self, at: i32) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.buf[at as usize..at as usize + 8]);
        u64::from_le_bytes(raw)
    }

    pub fn write_slot_at(&mut self, at: i32, v: u64) {
        self.buf[at as usize..at as usize + 8].copy_from_slice(&v.to_le_bytes());
    }
}


// Where echo output goes; tests capture it in a Vec<u8>.
pub trait Output {
    fn echo(&mut self, bytes: &[u8]);
}

impl Output for Vec<u8> {
    fn echo(&mut self, bytes: &[u8]) {
        self.extend_from_slice(bytes);
    }
}

impl Output for std::io::Stdout {
    fn echo(&mut self, bytes: &[u8]) {
        use std::io::Write;
        let _ = self.write_all(bytes);
        let _ = self.flush();
    }
}


// The runtime context: the process-wide stack as an explicit value.
pub struct Vm {
    pub stack: DataStack,
}


impl Vm {
    pub fn new() -> Vm {
        Vm { stack: DataStack::new() }
    }
}


// Copy a vector payload. For non-POD elements every copied element pointer
// is retained, because the copy owns them independently.
unsafe fn clone_payload(types: &Types, elem: TypeId, p: *const u8) -> Buf {
    let b = Buf::from_bytes(buf::raw_bytes(p));
    if !types.is_pod(elem) {
        let bytes = b.as_bytes();
        let mut at = 0;
        while at + 8 <= bytes.len() {
            let ep = (bytes.as_ptr().add(at) as *const u64).read_unaligned();
            buf::retain_raw(ep as usize as *mut u8);
            at += 8;
        }
    }
    b
}


struct Frame<'a> {
    data: Option<&'a mut [u8]>,
    base: i32,
    file: String,
    line: i32,
}

impl<'a> Frame<'a> {
    fn data_ptr(&mut self, offs: i32) -> Result<*mut u8> {
        match &mut self.data {
            Some(d) => Ok(unsafe { d.as_mut_ptr().add(offs as usize) }),
            None => Err(Error::NoContext),
        }
    }
}


impl CodeSegment {
    pub fn execute(
        &self,
        types: &Types,
        vm: &mut Vm,
        data: Option<&mut [u8]>,
        out: &mut dyn Output,
    ) -> Result<Option<Value>> {
        if self.is_empty() {
            return Ok(None);
        }
        let base = vm.stack.bytesize();
        vm.stack.grow_zeroed(self.reserve_locals);
        let mut frame = Frame { data, base, file: String::new(), line: 0 };
        let result = self.run(types, vm, &mut frame, out);
        vm.stack.truncate(base);
        result
    }

    fn run(
        &self,
        types: &Types,
        vm: &mut Vm,
        frame: &mut Frame,
        out: &mut dyn Output,
    ) -> Result<Option<Value>> {
        let stk = &mut vm.stack;
        let mut result: Option<Value> = None;
        let mut pc: i32 = 0;

        macro_rules! binop {
            (int $f:expr) => {{
                let b = stk.pop_int();
                let a = stk.pop_int();
                stk.push_int($f(a, b));
            }};
            (large $f:expr) => {{
                let b = stk.pop_large();
                let a = stk.pop_large();
                stk.push_large($f(a, b));
            }};
        }

        loop {
            let op = self.at(pc).op()?;
            trace!("{:?} {:?}", pc, op);
            let opc = pc;
            pc += 1 + op.operand_count() as i32;

            match op {
                Op::End => break,
                Op::Nop => {}

                Op::RetByte | Op::RetInt => {
                    let v = stk.pop_int();
                    result = Some(Value::int(TypeId(0), v));
                }
                Op::RetLarge => {
                    let v = stk.pop_large();
                    result = Some(Value::large(TypeId(0), v));
                }
                Op::RetPtr => {
                    let v = stk.pop_ptr();
                    result = Some(Value::from_bits(TypeId(0), v));
                }
                Op::RetVec => {
                    let p = stk.pop_ptr();
                    // the stack slot was borrowed; the result owns
                    result = Some(Value::vec_retain(TypeId(0), p as usize as *mut u8));
                }
                Op::RetVoid => {
                    result = Some(Value::void(TypeId(0)));
                }

                Op::LoadZero => stk.push_int(0),
                Op::LoadOne => stk.push_int(1),
                Op::LoadLargeZero => stk.push_large(0),
                Op::LoadLargeOne => stk.push_large(1),
                Op::LoadFalse => stk.push_int(0),
                Op::LoadTrue => stk.push_int(1),
                Op::LoadNullVec => stk.push_ptr(0),
                Op::LoadIntConst => stk.push_int(self.at(opc + 1).int_()),
                Op::LoadLargeConst => stk.push_large(self.at(opc + 1).large_()),
                Op::LoadVecConst => stk.push_ptr(self.at(opc + 1).ptr_() as u64),
                Op::LoadTypeRef => stk.push_ptr(self.at(opc + 1).type_().index() as u64),

                Op::LoadThisByte => {
                    let p = frame.data_ptr(self.at(opc + 1).offs_())?;
                    stk.push_int(unsafe { *p } as i32);
                }
                Op::LoadThisInt => {
                    let p = frame.data_ptr(self.at(opc + 1).offs_())?;
                    stk.push_int(unsafe { (p as *const i32).read_unaligned() });
                }
                Op::LoadThisLarge => {
                    let p = frame.data_ptr(self.at(opc + 1).offs_())?;
                    stk.push_large(unsafe { (p as *const i64).read_unaligned() });
                }
                Op::LoadThisPtr | Op::LoadThisVec => {
                    let p = frame.data_ptr(self.at(opc + 1).offs_())?;
                    stk.push_ptr(unsafe { (p as *const u64).read_unaligned() });
                }
                Op::LoadThisVoid => {}

                Op::StoreThisByte => {
                    let v = stk.pop_int();
                    let p = frame.data_ptr(self.at(opc + 1).offs_())?;
                    unsafe { *p = v as u8 };
                }
                Op::StoreThisInt => {
                    let v = stk.pop_int();
                    let p = frame.data_ptr(self.at(opc + 1).offs_())?;
                    unsafe { (p as *mut i32).write_unaligned(v) };
                }
                Op::StoreThisLarge => {
                    let v = stk.pop_large();
                    let p = frame.data_ptr(self.at(opc + 1).offs_())?;
                    unsafe { (p as *mut i64).write_unaligned(v) };
                }
                Op::StoreThisPtr => {
                    let v = stk.pop_ptr();
                    let p = frame.data_ptr(self.at(opc + 1).offs_())?;
                    unsafe { (p as *mut u64).write_unaligned(v) };
                }
                Op::StoreThisVec => {
                    let v = stk.pop_ptr();
                    // the variable slot becomes an owner
                    unsafe { buf::retain_raw(v as usize as *mut u8) };
                    let p = frame.data_ptr(self.at(opc + 1).offs_())?;
                    unsafe { (p as *mut u64).write_unaligned(v) };
                }
                Op::StoreThisVoid => {}

                Op::FinThisPodVec => {
                    let p = frame.data_ptr(self.at(opc + 1).offs_())?;
                    unsafe {
                        let v = (p as *const u64).read_unaligned();
                        buf::release_raw(v as usize as *mut u8);
                        (p as *mut u64).write_unaligned(0);
                    }
                }
                Op::FinThis => {
                    let ty = self.at(opc + 1).type_();
                    let p = frame.data_ptr(self.at(opc + 2).offs_())?;
                    unsafe {
                        let v = (p as *const u64).read_unaligned();
                        finalize_vec(types, ty, v as usize as *mut u8);
                        (p as *mut u64).write_unaligned(0);
                    }
                }

                Op::LoadLocByte => {
                    let v = stk.read_slot_at(frame.base + self.at(opc + 1).offs_());
                    stk.push_int((v as u8) as i32);
                }
                Op::LoadLocInt => {
                    let v = stk.read_slot_at(frame.base + self.at(opc + 1).offs_());
                    stk.push_int(v as u32 as i32);
                }
                Op::LoadLocLarge => {
                    let v = stk.read_slot_at(frame.base + self.at(opc + 1).offs_());
                    stk.push_large(v as i64);
                }
                Op::LoadLocPtr | Op::LoadLocVec => {
                    let v = stk.read_slot_at(frame.base + self.at(opc + 1).offs_());
                    stk.push_ptr(v);
                }
                Op::LoadLocVoid => {}

                Op::StoreLocByte | Op::StoreLocInt => {
                    let v = stk.pop_int();
                    stk.write_slot_at(frame.base + self.at(opc + 1).offs_(), v as u32 as u64);
                }
                Op::StoreLocLarge => {
                    let v = stk.pop_large();
                    stk.write_slot_at(frame.base + self.at(opc + 1).offs_(), v as u64);
                }
                Op::StoreLocPtr => {
                    let v = stk.pop_ptr();
                    stk.write_slot_at(frame.base + self.at(opc + 1).offs_(), v);
                }
                Op::StoreLocVec => {
                    let v = stk.pop_ptr();
                    unsafe { buf::retain_raw(v as usize as *mut u8) };
                    stk.write_slot_at(frame.base + self.at(opc + 1).offs_(), v);
                }
                Op::StoreLocVoid => {}

                Op::FinLocPodVec => {
                    let at = frame.base + self.at(opc + 1).offs_();
                    let v = stk.read_slot_at(at);
                    unsafe { buf::release_raw(v as usize as *mut u8) };
                    stk.write_slot_at(at, 0);
                }
                Op::FinLoc => {
                    let ty = self.at(opc + 1).type_();
                    let at = frame.base + self.at(opc + 2).offs_();
                    let v = stk.read_slot_at(at);
                    unsafe { finalize_vec(types, ty, v as usize as *mut u8) };
                    stk.write_slot_at(at, 0);
                }

                Op::LoadRef => {
                    let p = frame.data_ptr(self.at(opc + 1).offs_())?;
                    stk.push_ptr(p as u64);
                }

                Op::PopInt | Op::PopLarge | Op::PopPtr => {
                    stk.pop_slot();
                }
                Op::PopVec => {
                    let ty = self.at(opc + 1).type_();
                    let p = stk.pop_ptr();
                    unsafe { finalize_vec(types, ty, p as usize as *mut u8) };
                }

                Op::CopyToTmpVec => {
                    let p = stk.top_slot();
                    unsafe { buf::retain_raw(p as usize as *mut u8) };
                    stk.write_slot_at(frame.base + self.at(opc + 1).offs_(), p);
                }
                Op::ElemToVec => {
                    let elem = self.at(opc + 1).type_();
                    let bits = stk.pop_slot();
                    let mut b = Buf::null();
                    b.append_n(types.static_size(elem));
                    unsafe {
                        Value::from_bits(elem, bits).assign_to_buf(types, b.raw());
                    }
                    let p = b.into_raw();
                    stk.write_slot_at(frame.base + self.at(opc + 2).offs_(), p as u64);
                    stk.push_ptr(p as u64);
                }
                Op::VecCat => {
                    let elem = self.at(opc + 1).type_();
                    let src = stk.pop_ptr();
                    let dst = stk.pop_ptr();
                    let mut b = unsafe { clone_payload(types, elem, dst as usize as *const u8) };
                    let src_copy =
                        unsafe { clone_payload(types, elem, src as usize as *const u8) };
                    b.append(src_copy.as_bytes());
                    // src_copy's element references transfer into b; only
                    // its own allocation is handed back
                    unsafe { buf::release_raw(src_copy.into_raw()) };
                    let p = b.into_raw();
                    stk.write_slot_at(frame.base + self.at(opc + 2).offs_(), p as u64);
                    stk.push_ptr(p as u64);
                }
                Op::VecElemCat => {
                    let elem = self.at(opc + 1).type_();
                    let bits = stk.pop_slot();
                    let dst = stk.pop_ptr();
                    let mut b = unsafe { clone_payload(types, elem, dst as usize as *const u8) };
                    let at = b.append_n(types.static_size(elem));
                    unsafe {
                        Value::from_bits(elem, bits)
                            .assign_to_buf(types, b.raw().add(at as usize));
                    }
                    let p = b.into_raw();
                    stk.write_slot_at(frame.base + self.at(opc + 2).offs_(), p as u64);
                    stk.push_ptr(p as u64);
                }

                Op::CmpInt => {
                    let b = stk.pop_int();
                    let a = stk.pop_int();
                    stk.push_int(compare(a as i64, b as i64));
                }
                Op::CmpLarge => {
                    let b = stk.pop_large();
                    let a = stk.pop_large();
                    stk.push_int(compare(a, b));
                }
                Op::CmpStrChr => {
                    let b = stk.pop_int();
                    let a = stk.pop_ptr();
                    let a = unsafe { buf::raw_bytes(a as usize as *const u8) };
                    stk.push_int(compare_bytes(a, &[b as u8]));
                }
                Op::CmpChrStr => {
                    let b = stk.pop_ptr();
                    let a = stk.pop_int();
                    let b = unsafe { buf::raw_bytes(b as usize as *const u8) };
                    stk.push_int(compare_bytes(&[a as u8], b));
                }
                Op::CmpPodVec => {
                    let b = stk.pop_ptr();
                    let a = stk.pop_ptr();
                    let a = unsafe { buf::raw_bytes(a as usize as *const u8) };
                    let b = unsafe { buf::raw_bytes(b as usize as *const u8) };
                    stk.push_int(compare_bytes(a, b));
                }
                Op::CmpTypeRef => {
                    let b = stk.pop_ptr();
                    let a = stk.pop_ptr();
                    stk.push_int(if a == b { 0 } else { 1 });
                }

                // The case family tests the selector without consuming it.
                Op::CaseInt => {
                    let v = stk.top_slot() as u32 as i32;
                    stk.push_int((v == self.at(opc + 1).int_()) as i32);
                }
                Op::CaseRange => {
                    let v = stk.top_slot() as u32 as i32;
                    let range = self.at(opc + 1).large_();
                    let lo = range as u32 as i32;
                    let hi = (range >> 32) as u32 as i32;
                    stk.push_int((v >= lo && v <= hi) as i32);
                }
                Op::CaseStr => {
                    let v = stk.top_slot();
                    let a = unsafe { buf::raw_bytes(v as usize as *const u8) };
                    let b = unsafe { buf::raw_bytes(self.at(opc + 1).ptr_()) };
                    stk.push_int((a == b) as i32);
                }
                Op::CaseTypeRef => {
                    let v = stk.top_slot();
                    stk.push_int((v == self.at(opc + 1).type_().index() as u64) as i32);
                }

                Op::EQ | Op::LT | Op::LE | Op::GE | Op::GT | Op::NE => {
                    let c = stk.pop_int();
                    stk.push_int(match op {
                        Op::EQ => (c == 0) as i32,
                        Op::LT => (c < 0) as i32,
                        Op::LE => (c <= 0) as i32,
                        Op::GE => (c >= 0) as i32,
                        Op::GT => (c > 0) as i32,
                        _ => (c != 0) as i32,
                    });
                }

                Op::LargeToInt => {
                    let v = stk.pop_large();
                    stk.push_int(v as i32);
                }
                Op::IntToLarge => {
                    let v = stk.pop_int();
                    stk.push_large(v as i64);
                }
                Op::IntToStr => {
                    let v = stk.pop_int();
                    let p = Buf::from_bytes(format!("{}", v).as_bytes()).into_raw();
                    stk.write_slot_at(frame.base + self.at(opc + 1).offs_(), p as u64);
                    stk.push_ptr(p as u64);
                }
                Op::LargeToStr => {
                    let v = stk.pop_large();
                    let p = Buf::from_bytes(format!("{}", v).as_bytes()).into_raw();
                    stk.write_slot_at(frame.base + self.at(opc + 1).offs_(), p as u64);
                    stk.push_ptr(p as u64);
                }

                Op::MkSubrange => {
                    let max = stk.pop_int();
                    let min = stk.pop_int();
                    stk.push_large((((max as u32 as u64) << 32) | min as u32 as u64) as i64);
                }

                Op::Add => binop!(int i32::wrapping_add),
                Op::AddLarge => binop!(large i64::wrapping_add),
                Op::Sub => binop!(int i32::wrapping_sub),
                Op::SubLarge => binop!(large i64::wrapping_sub),
                Op::Mul => binop!(int i32::wrapping_mul),
                Op::MulLarge => binop!(large i64::wrapping_mul),
                Op::Div | Op::Mod => {
                    let b = stk.pop_int();
                    let a = stk.pop_int();
                    if b == 0 {
                        return Err(Error::DivByZero {
                            file: frame.file.clone(),
                            line: frame.line,
                        });
                    }
                    stk.push_int(if op == Op::Div {
                        a.wrapping_div(b)
                    } else {
                        a.wrapping_rem(b)
                    });
                }
                Op::DivLarge | Op::ModLarge => {
                    let b = stk.pop_large();
                    let a = stk.pop_large();
                    if b == 0 {
                        return Err(Error::DivByZero {
                            file: frame.file.clone(),
                            line: frame.line,
                        });
                    }
                    stk.push_large(if op == Op::DivLarge {
                        a.wrapping_div(b)
                    } else {
                        a.wrapping_rem(b)
                    });
                }
                Op::BitAnd => binop!(int |a, b| a & b),
                Op::BitAndLarge => binop!(large |a: i64, b: i64| a & b),
                Op::BitOr => binop!(int |a, b| a | b),
                Op::BitOrLarge => binop!(large |a: i64, b: i64| a | b),
                Op::BitXor => binop!(int |a, b| a ^ b),
                Op::BitXorLarge => binop!(large |a: i64, b: i64| a ^ b),
                Op::BitShl => binop!(int |a: i32, b: i32| a.wrapping_shl(b as u32)),
                Op::BitShlLarge => binop!(large |a: i64, b: i64| a.wrapping_shl(b as u32)),
                Op::BitShr => binop!(int |a: i32, b: i32| a.wrapping_shr(b as u32)),
                Op::BitShrLarge => binop!(large |a: i64, b: i64| a.wrapping_shr(b as u32)),

                Op::Neg => {
                    let v = stk.pop_int();
                    stk.push_int(v.wrapping_neg());
                }
                Op::NegLarge => {
                    let v = stk.pop_large();
                    stk.push_large(v.wrapping_neg());
                }
                Op::BitNot => {
                    let v = stk.pop_int();
                    stk.push_int(!v);
                }
                Op::BitNotLarge => {
                    let v = stk.pop_large();
                    stk.push_large(!v);
                }
                Op::BoolNot => {
                    let v = stk.pop_int();
                    stk.push_int((v == 0) as i32);
                }

                // Short-circuit jumps keep the decided value on the stack
                // and discard it on the fall-through path.
                Op::JumpOr => {
                    if stk.top_slot() as u32 as i32 != 0 {
                        pc = opc + 2 + self.at(opc + 1).offs_();
                    } else {
                        stk.pop_slot();
                    }
                }
                Op::JumpAnd => {
                    if stk.top_slot() as u32 as i32 == 0 {
                        pc = opc + 2 + self.at(opc + 1).offs_();
                    } else {
                        stk.pop_slot();
                    }
                }
                Op::JumpTrue => {
                    if stk.pop_int() != 0 {
                        pc = opc + 2 + self.at(opc + 1).offs_();
                    }
                }
                Op::JumpFalse => {
                    if stk.pop_int() == 0 {
                        pc = opc + 2 + self.at(opc + 1).offs_();
                    }
                }
                Op::Jump => {
                    pc = opc + 2 + self.at(opc + 1).offs_();
                }

                Op::Call => return Err(Error::NotImplemented),

                Op::Echo => {
                    let ty = self.at(opc + 1).type_();
                    let bits = match types.storage(ty) {
                        Storage::Void => 0,
                        _ => stk.pop_slot(),
                    };
                    let v = Value::from_bits(ty, bits);
                    out.echo(&types.echo_value(&v));
                }
                Op::EchoLn => out.echo(b"\n"),
                Op::Assert => {
                    let cond = stk.pop_int();
                    if cond == 0 {
                        let file = unsafe { buf::raw_bytes(self.at(opc + 1).ptr_()) };
                        return Err(Error::RuntimeAssert {
                            file: String::from_utf8_lossy(file).to_string(),
                            line: self.at(opc + 2).int_(),
                        });
                    }
                }
                Op::Linenum => {
                    let file = unsafe { buf::raw_bytes(self.at(opc + 1).ptr_()) };
                    frame.file = String::from_utf8_lossy(file).to_string();
                    frame.line = self.at(opc + 2).int_();
                }
            }
        }

        Ok(result)
    }
}


fn compare(a: i64, b: i64) -> i32 {
    if a < b {
        -1
    } else {
        (a > b) as i32
    }
}

fn compare_bytes(a: &[u8], b: &[u8]) -> i32 {
    use std::cmp::Ordering;
    match a.cmp(b) {
        Ordering::Less => -1,
        Ordering::Equal => 0,
        Ordering::Greater => 1,
    }
}
