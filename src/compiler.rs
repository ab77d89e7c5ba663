// His majesty the compiler.
//
// A recursive-descent driver over the token stream; each expression
// production emits through a CodeGen and returns with the resulting type on
// top of the gen stack. Constant expressions are folded by sealing the
// just-emitted snippet and running it on the VM; the folded value is then
// loaded back as a constant at the point of use or stored under a name.
//
// Precedence, low to high:
//   ..  <  or xor  <  and shl shr  <  not  <  == != < <= > >=
//      <  + - ++  <  * / mod  <  unary -  <  designator/atom

use enumflags2::BitFlags;
use log::debug;

use crate::buf::Buf;
use crate::codegen::CodeGen;
use crate::error::{Error, Result};
use crate::scope::{ModuleId, Sym, World};
use crate::source::{extract_file_name, Parser, Token};
use crate::types::{Storage, TypeId};
use crate::value::Value;
use crate::vm::{Op, Output, Vm};


// Per-module compiler options; all on by default.
#[derive(BitFlags, Copy, Clone, Debug, PartialEq)]
#[repr(u8)]
pub enum Opt {
    Echo = 0b001,
    Assert = 0b010,
    LinenumInfo = 0b100,
}


pub struct Compiler {
    pub world: World,
    pub vm: Vm,
    parser: Parser,
    pub module: ModuleId,
    current_scope: crate::types::ScopeId,
    pub options: BitFlags<Opt>,
    file_ptr: *const u8,
    pub compiled: bool,
}


fn type_vs_type(world: &World, a: TypeId, b: TypeId) -> String {
    format!(
        "{} vs. {}",
        world.types.definition_q(a),
        world.types.definition_q(b)
    )
}


impl Compiler {
    pub fn open(path: &str) -> Result<Compiler> {
        let parser = Parser::open(path)?;
        Compiler::with_parser(parser, &extract_file_name(path))
    }

    pub fn from_bytes(file_name: &str, source: &[u8]) -> Result<Compiler> {
        let parser = Parser::from_bytes(file_name, source);
        Compiler::with_parser(parser, &extract_file_name(file_name))
    }

    fn with_parser(parser: Parser, module_name: &str) -> Result<Compiler> {
        let mut world = World::new();
        let module = world.new_module(module_name, parser.file_name())?;
        let file_name = parser.file_name().to_string();
        let file_ptr = world.intern(module, file_name.as_bytes());
        let current_scope = world.module(module).scope;
        Ok(Compiler {
            world,
            vm: Vm::new(),
            parser,
            module,
            current_scope,
            options: BitFlags::all(),
            file_ptr,
            compiled: false,
        })
    }

    // --- name resolution ---

    fn get_qualified_name(&mut self) -> Result<Sym> {
        let ident = self.parser.get_ident()?;
        let mut obj = match self.world.deep_find(self.current_scope, &ident) {
            Some(obj) => obj,
            None => return self.parser.error_not_found(&ident),
        };
        let mut err_ident = ident;
        while self.parser.token == Token::Period {
            let scope = match obj {
                Sym::Module(m) => self.world.module(m).scope,
                _ => return Ok(obj),
            };
            self.parser.next()?; // "."
            let ident = self.parser.get_ident()?;
            err_ident.push('.');
            err_ident.push_str(&ident);
            obj = match self.world.find(scope, &ident) {
                Some(obj) => obj,
                None => return self.parser.error_not_found(&err_ident),
            };
        }
        Ok(obj)
    }

    // Attach the current source location to scope-level errors.
    fn located(&self, e: Error) -> Error {
        match e {
            Error::Duplicate(entry) => Error::Parser {
                file: self.parser.file_name().to_string(),
                line: self.parser.line_num(),
                msg: format!("Duplicate identifier '{}'", entry),
            },
            e => e,
        }
    }

    // --- expression grammar ---

    fn parse_atom(&mut self, code: &mut CodeGen) -> Result<TypeId> {
        if self.parser.skip_if(Token::LParen)? {
            self.parse_expr(code)?;
            self.parser.skip(Token::RParen, ")")?;
        } else if self.parser.token == Token::IntValue {
            // literals are unsigned; anything beyond the default int needs
            // the explicit large form
            let value = self.parser.int_value;
            self.parser.next()?;
            if value > i32::max_value() as u64 {
                return self
                    .parser
                    .error("Value out of range (use the 'L' suffix for large consts)");
            }
            code.gen_load_int_const(&self.world, self.world.default_int, value as i32);
        } else if self.parser.token == Token::LargeValue {
            let value = self.parser.large_value;
            self.parser.next()?;
            code.gen_load_large_const(&self.world, self.world.default_large, value as i64);
        } else if self.parser.token == Token::StrValue {
            let bytes = crate::source::literal_bytes(&self.parser.str_value);
            self.parser.next()?;
            if bytes.len() == 1 {
                code.gen_load_int_const(&self.world, self.world.default_char, bytes[0] as i32);
            } else {
                let p = self.world.intern(self.module, &bytes);
                code.gen_load_vec_const(&self.world, self.world.default_str, p);
            }
        } else if self.parser.token == Token::Ident {
            match self.get_qualified_name()? {
                Sym::Const(c) => {
                    let cval = self.world.constant(c).value;
                    if self.world.types.is_typeref(cval.type_id) {
                        // a type name: function-style static cast, or a
                        // typeref value with optional derivators
                        let target = cval.as_typeref();
                        if self.parser.token == Token::LParen {
                            self.parser.next()?;
                            code.result_type_hint = Some(target);
                            self.parse_expr(code)?;
                            self.parser.skip(Token::RParen, ")")?;
                            let from = code.gen_top_type();
                            if !self.world.types.can_static_cast_to(from, target) {
                                return self.parser.error(&format!(
                                    "Can't do static typecast from {} to {}",
                                    self.world.types.definition_q(from),
                                    self.world.types.definition_q(target)
                                ));
                            }
                            code.gen_static_cast(&self.world, target)?;
                        } else {
                            let derived = self.get_derivators(target)?;
                            code.gen_load_typeref(&self.world, derived);
                        }
                    } else {
                        code.gen_load_const(&self.world, cval.type_id, &cval)?;
                    }
                }
                Sym::Var(v) => {
                    // only valid where the code has a runtime context;
                    // constant expressions and typeof have none
                    code.gen_load_var(&self.world, v)?;
                }
                Sym::Module(_) => return self.parser.error("Feature not implemented"),
            }
        } else if self.parser.skip_if(Token::TypeOf)? {
            self.parser.skip(Token::LParen, "(")?;
            let t = {
                let mut tcode = CodeGen::new(None);
                self.parse_expr(&mut tcode)?;
                tcode
                    .run_type_expr(&mut self.world, &mut self.vm, true)?
                    .ok_or_else(|| Error::internal(20))?
            };
            self.parser.skip(Token::RParen, ")")?;
            code.gen_load_typeref(&self.world, t);
        } else if self.parser.skip_if(Token::True)? {
            code.gen_load_int_const(&self.world, self.world.default_bool, 1);
        } else if self.parser.skip_if(Token::False)? {
            code.gen_load_int_const(&self.world, self.world.default_bool, 0);
        } else if self.parser.skip_if(Token::Null)? {
            code.gen_load_null(&self.world);
        } else if self.parser.skip_if(Token::LSquare)? {
            let comp = self.get_const_compound(code.result_type_hint)?;
            if !self.world.types.is_vector(comp.type_id) {
                return Err(Error::internal(20));
            }
            code.gen_load_vec_const(&self.world, comp.type_id, comp.ptr_());
            // the pool keeps the payload alive; the value's own reference
            // is no longer needed
            comp.release(&self.world.types);
        } else {
            return self.parser.error_with_loc("Expression syntax");
        }

        Ok(code.gen_top_type())
    }

    fn parse_designator(&mut self, code: &mut CodeGen) -> Result<TypeId> {
        self.parse_atom(code)
    }

    fn parse_factor(&mut self, code: &mut CodeGen) -> Result<TypeId> {
        let is_neg = self.parser.skip_if(Token::Minus)?;
        let mut result = self.parse_designator(code)?;
        if is_neg {
            result = code.gen_top_type();
            if !self.world.types.is_int(result) {
                return self.parser.error("Invalid operand for arithmetic negation");
            }
            code.gen_un_arithm(&self.world, Op::Neg, result);
        }
        Ok(result)
    }

    // The result of a binary arithmetic operation: same large-ness
    // required, the wider range wins.
    fn arithm_result_type(&mut self, left: TypeId, right: TypeId) -> Result<TypeId> {
        let types = &self.world.types;
        if types.is_large_int(left) != types.is_large_int(right) {
            return self
                .parser
                .error("Mixing int and large: typecast needed (or 'L' with numbers)");
        }
        let (lmin, lmax) = types.ord_range(left).unwrap();
        let (rmin, rmax) = types.ord_range(right).unwrap();
        Ok(if rmin <= lmin && rmax >= lmax { right } else { left })
    }

    fn parse_term(&mut self, code: &mut CodeGen) -> Result<TypeId> {
        let mut left = self.parse_factor(code)?;
        while self.parser.token == Token::Mul
            || self.parser.token == Token::Div
            || self.parser.token == Token::Mod
        {
            let tok = self.parser.token;
            self.parser.next()?;
            let right = self.parse_factor(code)?;
            if self.world.types.is_int(left) && self.world.types.is_int(right) {
                left = self.arithm_result_type(left, right)?;
                let op = match tok {
                    Token::Mul => Op::Mul,
                    Token::Div => Op::Div,
                    _ => Op::Mod,
                };
                code.gen_bin_arithm(&self.world, op, left);
            } else {
                return self.parser.error("Invalid operands for arithmetic operator");
            }
        }
        Ok(left)
    }

    fn parse_arithm_expr(&mut self, code: &mut CodeGen) -> Result<TypeId> {
        let mut left = self.parse_term(code)?;
        while self.parser.token == Token::Plus || self.parser.token == Token::Minus {
            let tok = self.parser.token;
            self.parser.next()?;
            let right = self.parse_term(code)?;
            if self.world.types.is_int(left) && self.world.types.is_int(right) {
                left = self.arithm_result_type(left, right)?;
                code.gen_bin_arithm(
                    &self.world,
                    if tok == Token::Plus { Op::Add } else { Op::Sub },
                    left,
                );
            } else {
                return self.parser.error("Invalid operands for arithmetic operator");
            }
        }
        Ok(left)
    }

    fn parse_simple_expr(&mut self, code: &mut CodeGen) -> Result<TypeId> {
        let mut left = self.parse_arithm_expr(code)?;
        while self.parser.skip_if(Token::Cat)? {
            // a non-vector lhs becomes a single-element vector before the
            // rhs lands on the stack
            if !self.world.types.is_vector(left) {
                if !self.world.types.can_be_array_element(left) {
                    return self.parser.error("Invalid vector element type");
                }
                let vec = self.world.types.derive_vector(left)?;
                code.gen_elem_to_vec(&self.world, vec);
                left = vec;
            }
            let right = self.parse_arithm_expr(code)?;
            if self.world.types.is_vector(right) {
                if !self.world.types.equals(left, right) {
                    return self
                        .parser
                        .error("Operands of vector concatenation are incompatible");
                }
                code.gen_vec_cat(&self.world)?;
            } else if self
                .world
                .types
                .vector_elem(left)
                .map_or(false, |e| self.world.types.equals(e, right))
            {
                code.gen_vec_elem_cat(&self.world)?;
            } else {
                return self
                    .parser
                    .error("Operands of vector concatenation are incompatible");
            }
        }
        Ok(left)
    }

    fn parse_rel_expr(&mut self, code: &mut CodeGen) -> Result<TypeId> {
        let mut left = self.parse_simple_expr(code)?;
        if let Some(cmp) = self.parser.token.comparison() {
            self.parser.next()?;
            let right = self.parse_simple_expr(code)?;
            let eq_only = cmp == 0 || cmp == 5;
            if self.world.types.can_compare_with(left, right)
                || (eq_only && self.world.types.can_check_eq(left, right))
            {
                code.gen_comparison(&self.world, cmp)?;
                left = code.gen_top_type();
            } else {
                return self.parser.error(&format!(
                    "Type mismatch in comparison: {}",
                    type_vs_type(&self.world, left, right)
                ));
            }
        }
        Ok(left)
    }

    fn parse_not_level(&mut self, code: &mut CodeGen) -> Result<TypeId> {
        let is_not = self.parser.skip_if(Token::Not)?;
        let t = self.parse_rel_expr(code)?;
        if is_not {
            if self.world.types.is_int(t) {
                code.gen_bit_not(&self.world);
            } else if self.world.types.is_bool(t) {
                code.gen_bool_not();
            } else {
                return self
                    .parser
                    .error("Boolean or integer expression expected after 'not'");
            }
        }
        Ok(t)
    }

    fn parse_and_level(&mut self, code: &mut CodeGen) -> Result<TypeId> {
        let mut left = self.parse_not_level(code)?;
        if self.world.types.is_bool(left) {
            if self.parser.skip_if(Token::And)? {
                let save_offset = code.gen_forward_bool_jump(&self.world, Op::JumpAnd)?;
                let right = self.parse_and_level(code)?;
                if !self.world.types.is_bool(right) {
                    return self.parser.error("Boolean expression expected after 'and'");
                }
                code.gen_resolve_jump(save_offset)?;
            }
        } else if self.world.types.is_int(left) {
            while self.parser.token == Token::Shl
                || self.parser.token == Token::Shr
                || self.parser.token == Token::And
            {
                let tok = self.parser.token;
                self.parser.next()?;
                let right = self.parse_not_level(code)?;
                if self.world.types.is_int(right) {
                    if (tok == Token::Shl || tok == Token::Shr)
                        && self.world.types.is_large_int(right)
                    {
                        return self
                            .parser
                            .error("Right operand of a bit shift can not be large");
                    }
                    left = self.arithm_result_type(left, right)?;
                    let op = match tok {
                        Token::Shl => Op::BitShl,
                        Token::Shr => Op::BitShr,
                        _ => Op::BitAnd,
                    };
                    code.gen_bin_arithm(&self.world, op, left);
                } else {
                    return self.parser.error("Invalid operands for bitwise operator");
                }
            }
        }
        Ok(left)
    }

    fn parse_or_level(&mut self, code: &mut CodeGen) -> Result<TypeId> {
        let mut left = self.parse_and_level(code)?;
        if self.world.types.is_bool(left) {
            if self.parser.skip_if(Token::Or)? {
                let save_offset = code.gen_forward_bool_jump(&self.world, Op::JumpOr)?;
                let right = self.parse_or_level(code)?;
                if !self.world.types.is_bool(right) {
                    return self.parser.error("Boolean expression expected after 'or'");
                }
                code.gen_resolve_jump(save_offset)?;
            } else if self.parser.skip_if(Token::Xor)? {
                let right = self.parse_or_level(code)?;
                if !self.world.types.is_bool(right) {
                    return self.parser.error("Boolean expression expected after 'xor'");
                }
                code.gen_bool_xor(&self.world);
            }
        } else if self.world.types.is_int(left) {
            while self.parser.token == Token::Or || self.parser.token == Token::Xor {
                let tok = self.parser.token;
                self.parser.next()?;
                let right = self.parse_and_level(code)?;
                if self.world.types.is_int(right) {
                    left = self.arithm_result_type(left, right)?;
                    code.gen_bin_arithm(
                        &self.world,
                        if tok == Token::Or { Op::BitOr } else { Op::BitXor },
                        left,
                    );
                } else {
                    return self.parser.error("Invalid operands for bitwise operator");
                }
            }
        }
        Ok(left)
    }

    fn parse_subrange(&mut self, code: &mut CodeGen) -> Result<TypeId> {
        let mut left = self.parse_or_level(code)?;
        if self.parser.token == Token::Range {
            self.parser.next()?;
            let right = self.parse_or_level(code)?;
            if !self.world.types.is_ordinal(left) || !self.world.types.is_ordinal(right) {
                return self.parser.error("Only ordinal types are allowed in subranges");
            }
            if !self.world.types.equals(left, right) {
                return self
                    .parser
                    .error("Left and right values of a subrange must be compatible");
            }
            if self.world.types.is_large_int(left) || self.world.types.is_large_int(right) {
                return self.parser.error("Large subrange bounds are not supported");
            }
            code.gen_mk_subrange(&mut self.world)?;
            left = code.gen_top_type();
        }
        Ok(left)
    }

    fn parse_bool_expr(&mut self, code: &mut CodeGen) -> Result<TypeId> {
        self.parse_or_level(code)
    }

    fn parse_expr(&mut self, code: &mut CodeGen) -> Result<TypeId> {
        self.parse_subrange(code)
    }

    // --- constant folding ---

    // Parse a constant expression, fold it, and check it against the
    // optional type hint. The caller owns the returned value.
    fn get_const_expr(&mut self, type_hint: Option<TypeId>) -> Result<Value> {
        let mut code = CodeGen::new(None);
        code.result_type_hint = type_hint;

        match type_hint {
            Some(hint)
                if self.world.types.is_bool(hint) || self.world.types.is_int(hint) =>
            {
                self.parse_bool_expr(&mut code)?;
            }
            Some(hint) if !self.world.types.is_range(hint) => {
                self.parse_simple_expr(&mut code)?;
            }
            _ => {
                self.parse_expr(&mut code)?;
            }
        }

        let top_type = code.gen_top_type();
        let hint_is_vec =
            type_hint.map_or(false, |h| self.world.types.is_vector(h));

        // elem-to-vector assignment, e.g. str constant from a char
        if let Some(hint) = type_hint {
            if hint_is_vec
                && self.world.types.can_assign(hint, top_type)
                && self
                    .world
                    .types
                    .vector_elem(hint)
                    .map_or(false, |e| self.world.types.equals(e, top_type))
            {
                code.gen_elem_to_vec(&self.world, hint);
            } else if self.world.types.is_ordinal(hint)
                && !self.world.types.equals(hint, top_type)
            {
                // ordinal typecast so that the constant gets a proper type
                code.gen_static_cast(&self.world, hint)?;
            }
        }

        let mut result = code.run_const_expr(&self.world, &mut self.vm)?;

        let hint = match type_hint {
            Some(hint) => {
                if hint_is_vec && self.world.types.is_empty_vec(result.type_id) {
                    // empty vectors are of void element type; adopt the hint
                    result = Value::from_bits(hint, result.bits());
                }
                hint
            }
            None => result.type_id,
        };

        if !self.world.types.can_assign(hint, result.type_id) {
            let msg = format!(
                "Type mismatch in constant expression: {}",
                type_vs_type(&self.world, hint, result.type_id)
            );
            result.release(&self.world.types);
            return self.parser.error(&msg);
        }

        // even without a hint a constant can be out of range of its own
        // type, e.g. byte(257)
        if self.world.types.is_ordinal(hint) && self.world.types.is_ordinal(result.type_id) {
            let v = result.ord_value(&self.world.types);
            if !self.world.types.contains(hint, v) {
                return self.parser.error("Value out of range");
            }
        } else if self.world.types.is_range(result.type_id)
            && result.range_min() >= result.range_max()
        {
            return self.parser.error("Invalid range");
        }

        Ok(result)
    }

    // A compound vector constructor after '['; the hint supplies the
    // element type when there is one.
    fn get_const_compound(&mut self, type_hint: Option<TypeId>) -> Result<Value> {
        let hint = type_hint.filter(|&t| self.world.types.is_vector(t));
        if self.parser.skip_if(Token::RSquare)? {
            return Ok(Value::void(self.world.default_empty_vec));
        }

        let mut elem_type = hint.and_then(|h| self.world.types.vector_elem(h));
        let mut vec = Buf::null();
        loop {
            let value = self.get_const_expr(elem_type)?;
            let elem = match elem_type {
                Some(e) => e,
                None => {
                    elem_type = Some(value.type_id);
                    value.type_id
                }
            };
            let elem_size = self.world.types.static_size(elem);
            let at = vec.append_n(elem_size);
            unsafe {
                value.assign_to_buf(&self.world.types, vec.raw().add(at as usize));
            }
            value.release(&self.world.types);
            if self.parser.skip_if(Token::RSquare)? {
                break;
            }
            self.parser.skip(Token::Comma, "]")?;
        }

        let vec_type = self.world.types.derive_vector(elem_type.unwrap())?;
        let p = self.world.intern_buf(self.module, vec_type, vec);
        Ok(Value::vec_retain(vec_type, p))
    }

    // --- types ---

    fn get_derivators(&mut self, mut t: TypeId) -> Result<TypeId> {
        if self.parser.skip_if(Token::LSquare)? {
            if self.parser.skip_if(Token::RSquare)? {
                if !self.world.types.can_be_array_element(t) {
                    return self.parser.error("Invalid vector element type");
                }
                t = self.world.types.derive_vector(t)?;
            } else if self.parser.skip_if(Token::Range)? {
                self.parser.skip(Token::RSquare, "]")?;
                if !self.world.types.is_ordinal(t) {
                    return self.parser.error("Ranges apply only to ordinal types");
                }
                t = self.world.types.derive_range(t)?;
            } else {
                let index = self.get_type(true)?.unwrap();
                self.parser.skip(Token::RSquare, "]")?;
                if !self.world.types.can_be_array_index(index) {
                    return self.parser.error(&format!(
                        "{} can't be used as array index",
                        self.world.types.definition(index)
                    ));
                }
                t = self.world.types.derive_array(t, index)?;
            }
            t = self.get_derivators(t)?;
        }
        Ok(t)
    }

    // Evaluate a type expression: a typeref names a type directly, a range
    // literal derives a subrange ordinal.
    fn get_type(&mut self, require: bool) -> Result<Option<TypeId>> {
        let value = self.get_const_expr(None)?;
        if self.world.types.is_typeref(value.type_id) {
            return Ok(Some(value.as_typeref()));
        }
        if self.world.types.is_range(value.type_id) {
            let base = self.world.types.range_base(value.type_id).unwrap();
            let t = self.world.types.derive_ordinal_from_range(
                base,
                value.range_min() as i64,
                value.range_max() as i64,
            )?;
            return Ok(Some(t));
        }
        value.release(&self.world.types);
        if require {
            self.parser.error_with_loc("Type specification expected")
        } else {
            Ok(None)
        }
    }

    // The single NotFound recovery point: at the head of a declaration an
    // unknown identifier means "this is the new name", anything deeper is a
    // real resolution failure.
    fn get_type_or_new_ident(&mut self) -> Result<(Option<TypeId>, String)> {
        let ident = if self.parser.token == Token::Ident {
            self.parser.str_value.clone()
        } else {
            String::new()
        };

        match self.get_type(false) {
            Ok(Some(t)) => Ok((Some(t), ident)),
            Ok(None) => self
                .parser
                .error_with_loc("Type specification or new identifier expected"),
            Err(Error::NotFound { entry, .. }) if entry == ident => Ok((None, ident)),
            Err(Error::InvalidSubrange(msg)) => {
                self.parser.error(&format!("Invalid subrange for {}", msg))
            }
            Err(e) => Err(e),
        }
    }

    // --- statements and definitions ---

    fn parse_enum_type(&mut self) -> Result<TypeId> {
        let enum_type = self.world.types.new_enum();
        let scope = self.current_scope;
        self.world.add_anon_type(scope, enum_type)?;
        self.parser.skip(Token::LParen, "(")?;
        loop {
            let ident = self.parser.get_ident()?;
            let next_value = self.world.types.enum_next_value(enum_type);
            self.world
                .add_constant(scope, &ident, Value::int(enum_type, next_value))
                .map_err(|e| self.located(e))?;
            self.world.types.enum_register(enum_type, &ident)?;
            if self.parser.skip_if(Token::RParen)? {
                break;
            }
            self.parser.skip(Token::Comma, ")")?;
        }
        self.world.types.enum_finish(enum_type)?;
        Ok(enum_type)
    }

    fn parse_type_def(&mut self) -> Result<()> {
        let (ident, t) = if self.parser.skip_if(Token::Enum)? {
            let ident = self.parser.get_ident()?;
            self.parser.skip(Token::Assign, "=")?;
            (ident, self.parse_enum_type()?)
        } else {
            let ident = self.parser.get_ident()?;
            self.parser.skip(Token::Assign, "=")?;
            let t = self.get_type(true)?.unwrap();
            (ident, t)
        };
        let scope = self.current_scope;
        self.world
            .add_type_alias(scope, &ident, t)
            .map_err(|e| self.located(e))?;
        debug!("def {} = {}", ident, self.world.types.definition(t));
        Ok(())
    }

    fn parse_var_const_def(&mut self, is_var: bool, main: &mut CodeGen) -> Result<()> {
        let (declared, ident) = {
            let (t, ident0) = self.get_type_or_new_ident()?;
            match t {
                Some(t) => {
                    let ident = self.parser.get_ident()?;
                    (Some(self.get_derivators(t)?), ident)
                }
                None => (None, ident0),
            }
        };

        self.parser.skip(Token::Assign, "=")?;
        let value = self.get_const_expr(declared)?;
        let t = declared.unwrap_or(value.type_id);

        if is_var {
            let var = self
                .world
                .add_module_variable(self.module, &ident, t)
                .map_err(|e| {
                    value.release(&self.world.types);
                    self.located(e)
                })?;
            // initialization happens at module run time: reload the folded
            // constant and store it into the fresh slot
            if self.options.contains(Opt::LinenumInfo) {
                main.gen_linenum(self.file_ptr, self.parser.line_num());
            }
            if self.world.types.storage(t) == Storage::Vec {
                // the init code needs the payload alive for the module's
                // lifetime; move the value's reference into the pool
                let p = unsafe { Buf::from_raw(value.ptr_()) };
                let p = self.world.intern_buf(self.module, t, p);
                main.gen_load_vec_const(&self.world, t, p);
            } else {
                main.gen_load_const(&self.world, t, &value)?;
            }
            main.gen_init_var(&self.world, var)?;
            debug!("var {}", self.world.types.definition_with(t, &ident));
        } else {
            let scope = self.current_scope;
            // the constant takes over the value's reference
            let retyped = Value::from_bits(t, value.bits());
            self.world
                .add_constant(scope, &ident, retyped)
                .map_err(|e| {
                    value.release(&self.world.types);
                    self.located(e)
                })?;
            debug!("const {}", self.world.types.definition_with(t, &ident));
        }
        Ok(())
    }

    fn parse_echo(&mut self, main: &mut CodeGen) -> Result<()> {
        let enabled = self.options.contains(Opt::Echo);
        // disabled statements still parse fully, they just emit nowhere
        let mut scratch = CodeGen::new(Some(self.current_scope));
        let space = self.world.intern(self.module, b" ");
        if enabled && self.options.contains(Opt::LinenumInfo) {
            main.gen_linenum(self.file_ptr, self.parser.line_num());
        }
        loop {
            let code: &mut CodeGen = if enabled { &mut *main } else { &mut scratch };
            self.parse_expr(code)?;
            code.gen_echo(&self.world);
            if !self.parser.skip_if(Token::Comma)? {
                break;
            }
            if enabled {
                main.gen_load_vec_const(&self.world, self.world.default_str, space);
                main.gen_echo(&self.world);
            }
        }
        if enabled {
            main.gen_echo_ln();
        }
        Ok(())
    }

    fn parse_assert(&mut self, main: &mut CodeGen) -> Result<()> {
        let enabled = self.options.contains(Opt::Assert);
        let line = self.parser.line_num();
        let mut scratch = CodeGen::new(Some(self.current_scope));
        if enabled && self.options.contains(Opt::LinenumInfo) {
            main.gen_linenum(self.file_ptr, line);
        }
        let code: &mut CodeGen = if enabled { &mut *main } else { &mut scratch };
        let t = self.parse_bool_expr(code)?;
        if !self.world.types.is_bool(t) {
            return self.parser.error("Boolean expression expected");
        }
        if enabled {
            main.gen_assert(&self.world, self.file_ptr, line);
        }
        Ok(())
    }

    // --- top level ---

    pub fn compile(&mut self) -> Result<()> {
        let mut main = CodeGen::new(Some(self.current_scope));

        self.parser.next()?;

        if self.parser.token == Token::Module {
            self.parser.next()?;
            let mod_name = self.parser.get_ident()?;
            if !mod_name.eq_ignore_ascii_case(&self.world.module(self.module).name) {
                return self.parser.error("Module name mismatch");
            }
            self.world.module_mut(self.module).name = mod_name;
            self.parser.skip_sep()?;
        }

        while self.parser.token != Token::Eof {
            if self.parser.skip_if(Token::Sep)? {
                continue;
            }
            if self.parser.skip_if(Token::Def)? {
                self.parse_type_def()?;
            } else if self.parser.skip_if(Token::Const)? {
                self.parse_var_const_def(false, &mut main)?;
            } else if self.parser.skip_if(Token::Var)? {
                self.parse_var_const_def(true, &mut main)?;
            } else if self.parser.skip_if(Token::Echo)? {
                self.parse_echo(&mut main)?;
            } else if self.parser.skip_if(Token::Assert)? {
                self.parse_assert(&mut main)?;
            } else {
                return self.parser.error_with_loc("Expected definition or statement");
            }
            self.parser.skip_sep()?;
        }

        // static vector variables are released before End, newest first
        let vars: Vec<_> = self
            .world
            .scope(self.current_scope)
            .vars
            .iter()
            .rev()
            .cloned()
            .collect();
        for var in vars {
            if self.world.types.storage(self.world.variable(var).type_id) == Storage::Vec {
                main.gen_fin_var(&self.world, var)?;
            }
        }

        main.verify_clean()?;
        let seg = main.into_code_seg();
        debug!("module code:\n{}", seg.dump(&self.world.types));
        self.world.module_mut(self.module).main_code = Some(seg);
        self.compiled = true;
        Ok(())
    }

    // Run the compiled module's statement code against a fresh zeroed data
    // segment.
    pub fn execute(&mut self, out: &mut dyn Output) -> Result<()> {
        let module = self.world.module(self.module);
        let seg = module.main_code.as_ref().ok_or_else(|| Error::internal(1))?;
        let mut data = vec![0u8; module.data_size as usize];
        seg.execute(&self.world.types, &mut self.vm, Some(&mut data), out)?;
        Ok(())
    }
}


// Compile and run one source file; the single entry the CLI uses.
pub fn run_file(path: &str, out: &mut dyn Output) -> Result<()> {
    let mut compiler = Compiler::open(path)?;
    compiler.compile()?;
    compiler.execute(out)
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::Sym;

    fn compile(src: &str) -> Result<Compiler> {
        let mut c = Compiler::from_bytes("test.sn", src.as_bytes())?;
        c.compile()?;
        Ok(c)
    }

    fn compile_err(src: &str) -> Error {
        match compile(src) {
            Ok(_) => panic!("expected a compile error for: {}", src),
            Err(e) => e,
        }
    }

    fn const_value(c: &Compiler, name: &str) -> Value {
        let scope = c.world.module(c.module).scope;
        match c.world.find(scope, name) {
            Some(Sym::Const(id)) => c.world.constant(id).value,
            other => panic!("no constant '{}': {:?}", name, other),
        }
    }

    fn run(src: &str) -> (Compiler, String) {
        let mut c = compile(src).unwrap();
        let mut out: Vec<u8> = Vec::new();
        c.execute(&mut out).unwrap();
        (c, String::from_utf8(out).unwrap())
    }

    #[test]
    fn test_subrange_inference() {
        // S1: a range constant over the default int
        let c = compile("const r = 1..5\n").unwrap();
        let v = const_value(&c, "r");
        assert!(c.world.types.is_range(v.type_id));
        assert_eq!(1, v.range_min());
        assert_eq!(5, v.range_max());
        assert_eq!(
            Some(c.world.default_int),
            c.world.types.range_base(v.type_id)
        );

        // typeof on a range value derives the subrange ordinal
        let c = compile("const r = 1..5\nconst t = typeof(r)\n").unwrap();
        let t = const_value(&c, "t");
        assert!(c.world.types.is_typeref(t.type_id));
        let sub = t.as_typeref();
        assert!(c.world.types.is_int(sub));
        assert_eq!(Some((1, 5)), c.world.types.ord_range(sub));
    }

    #[test]
    fn test_enum_definition() {
        // S2: byte-sized enum, member values in declaration order
        let c = compile("def enum Color = (Red, Green, Blue)\n").unwrap();
        let red = const_value(&c, "Red");
        let blue = const_value(&c, "Blue");
        assert_eq!(0, red.int_());
        assert_eq!(2, blue.int_());
        let color = const_value(&c, "Color").as_typeref();
        assert!(c.world.types.is_enum(color));
        assert_eq!(crate::types::Storage::Byte, c.world.types.storage(color));
        assert_eq!(1, c.world.types.static_size(color));
        assert_eq!(red.type_id, color);

        // the 257th member trips the internal limit
        let members: Vec<String> = (0..257).map(|i| format!("m{}", i)).collect();
        let src = format!("def enum Big = ({})\n", members.join(", "));
        assert_eq!(Error::Internal(15), compile_err(&src));
    }

    #[test]
    fn test_string_concat_fold() {
        // S3: folded at compile time, one surviving owner
        let c = compile("const s = 'foo' ++ 'bar'\n").unwrap();
        let v = const_value(&c, "s");
        assert!(c.world.types.is_string(v.type_id));
        assert_eq!(b"foobar", v.vec_bytes());
        assert_eq!(1, unsafe { crate::buf::raw_refcount(v.ptr_()) });
    }

    #[test]
    fn test_typeof() {
        // S4: the value is the built-in str type itself
        let c = compile("const t = typeof('abc')\n").unwrap();
        let v = const_value(&c, "t");
        assert!(c.world.types.is_typeref(v.type_id));
        assert_eq!(c.world.default_str, v.as_typeref());
    }

    #[test]
    fn test_out_of_range_literal() {
        // S5: enum-typed constant out of the declared range
        let e = compile_err("def enum Color = (Red, Green, Blue)\nconst Color c = 4\n");
        match e {
            Error::Parser { msg, .. } => assert!(msg.contains("Value out of range"), "{}", msg),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_subrange_definition() {
        // S6: a derived byte-sized int ordinal
        let c = compile("def sub = 10..20\n").unwrap();
        let sub = const_value(&c, "sub").as_typeref();
        assert!(c.world.types.is_int(sub));
        assert_eq!(Some((10, 20)), c.world.types.ord_range(sub));
        assert_eq!(1, c.world.types.static_size(sub));

        let e = compile_err("def sub = 10..5\n");
        match e {
            Error::Parser { msg, .. } => assert!(msg.contains("Invalid range"), "{}", msg),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_arithmetic_folding() {
        let c = compile(
            "const a = 2 + 3 * 4\n\
             const b = (2 + 3) * 4\n\
             const c = 100 / 7\n\
             const d = 100 mod 7\n\
             const e = -5 + 1\n\
             const f = 1 shl 10\n\
             const g = 0xff and 0x0f\n\
             const h = 1 or 6 xor 2\n",
        )
        .unwrap();
        assert_eq!(14, const_value(&c, "a").int_());
        assert_eq!(20, const_value(&c, "b").int_());
        assert_eq!(14, const_value(&c, "c").int_());
        assert_eq!(2, const_value(&c, "d").int_());
        assert_eq!(-4, const_value(&c, "e").int_());
        assert_eq!(1024, const_value(&c, "f").int_());
        assert_eq!(0x0f, const_value(&c, "g").int_());
        assert_eq!(5, const_value(&c, "h").int_());
    }

    #[test]
    fn test_large_arithmetic() {
        let c = compile("const a = 5000000000L - 1L\n").unwrap();
        let v = const_value(&c, "a");
        assert!(c.world.types.is_large_int(v.type_id));
        assert_eq!(4999999999, v.large_());

        let e = compile_err("const a = 1 + 2L\n");
        match e {
            Error::Parser { msg, .. } => assert!(msg.contains("Mixing int and large"), "{}", msg),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_bool_folding() {
        let c = compile(
            "const a = true and false\n\
             const b = true or false\n\
             const c = true xor true\n\
             const d = not false\n\
             const e = 2 < 3\n\
             const f = 'abc' == 'abc'\n\
             const g = 'abc' < 'abd'\n\
             const h = 'a' == 'ab'\n",
        )
        .unwrap();
        assert_eq!(0, const_value(&c, "a").int_());
        assert_eq!(1, const_value(&c, "b").int_());
        assert_eq!(0, const_value(&c, "c").int_());
        assert_eq!(1, const_value(&c, "d").int_());
        assert_eq!(1, const_value(&c, "e").int_());
        assert_eq!(1, const_value(&c, "f").int_());
        assert_eq!(1, const_value(&c, "g").int_());
        assert_eq!(0, const_value(&c, "h").int_());
    }

    #[test]
    fn test_division_by_zero_in_const() {
        let e = compile_err("const a = 1 / 0\n");
        match e {
            Error::DivByZero { .. } => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_char_and_string() {
        let c = compile(
            "const ch = 'x'\n\
             const str s = 'y'\n\
             const t = 'hello' ++ '!'\n\
             const u = 'a' ++ 'bc'\n",
        )
        .unwrap();
        let ch = const_value(&c, "ch");
        assert!(c.world.types.is_char(ch.type_id));
        assert_eq!(b'x' as i32, ch.int_());

        // a char literal under a str hint becomes a one-char string
        let s = const_value(&c, "s");
        assert!(c.world.types.is_string(s.type_id));
        assert_eq!(b"y", s.vec_bytes());

        assert_eq!(b"hello!", const_value(&c, "t").vec_bytes());
        assert_eq!(b"abc", const_value(&c, "u").vec_bytes());
    }

    #[test]
    fn test_compound_literal() {
        let c = compile(
            "const v = [1, 2, 3]\n\
             const int[] w = []\n\
             const s = ['ab', 'cd']\n",
        )
        .unwrap();
        let v = const_value(&c, "v");
        assert!(c.world.types.is_vector(v.type_id));
        assert_eq!(
            Some(c.world.default_int),
            c.world.types.vector_elem(v.type_id)
        );
        assert_eq!(12, v.vec_bytes().len());

        let w = const_value(&c, "w");
        assert_eq!(
            Some(c.world.default_int),
            c.world.types.vector_elem(w.type_id)
        );
        assert_eq!(0, w.vec_bytes().len());

        // vector of strings: two pointer-sized elements
        let s = const_value(&c, "s");
        assert_eq!(16, s.vec_bytes().len());
        assert!(!c.world.types.is_pod_vector(s.type_id));
    }

    #[test]
    fn test_type_definitions() {
        let c = compile(
            "def vec = int[]\n\
             def r = char[..]\n\
             def myint = int\n\
             const myint x = 7\n",
        )
        .unwrap();
        let vec = const_value(&c, "vec").as_typeref();
        assert!(c.world.types.is_vector(vec));
        let r = const_value(&c, "r").as_typeref();
        assert!(c.world.types.is_range(r));
        assert_eq!(7, const_value(&c, "x").int_());
    }

    #[test]
    fn test_array_and_set_types() {
        let c = compile(
            "def arr = int[char]\n\
             def set = void[int]\n",
        )
        .unwrap();
        let arr = const_value(&c, "arr").as_typeref();
        assert!(c.world.types.is_array(arr));
        assert_eq!(Some(c.world.default_int), c.world.types.vector_elem(arr));
        assert_eq!(Some(c.world.default_char), c.world.types.array_index(arr));

        // a set is an array with a void element, keyed by the member type
        let set = const_value(&c, "set").as_typeref();
        assert!(c.world.types.is_array(set));
        assert!(c.world.types.is_void(c.world.types.vector_elem(set).unwrap()));
        assert_eq!(Some(c.world.default_int), c.world.types.array_index(set));

        let e = compile_err("def bad = int[void]\n");
        match e {
            Error::Parser { msg, .. } => {
                assert!(msg.contains("array index"), "{}", msg)
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_static_cast() {
        let c = compile(
            "const a = char(65)\n\
             const b = int('A')\n\
             const c = large(3)\n\
             const d = int(5000000000L mod 10L)\n",
        )
        .unwrap();
        assert!(c.world.types.is_char(const_value(&c, "a").type_id));
        assert_eq!(65, const_value(&c, "a").int_());
        assert_eq!(65, const_value(&c, "b").int_());
        assert!(c.world.types.is_large_int(const_value(&c, "c").type_id));
        assert_eq!(3, const_value(&c, "c").large_());
        assert_eq!(0, const_value(&c, "d").int_());

        let e = compile_err("const a = int('abc')\n");
        match e {
            Error::Parser { msg, .. } => {
                assert!(msg.contains("static typecast"), "{}", msg)
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_and_unknown() {
        // typed form: the name is parsed as a fresh identifier and the
        // symbol table rejects it
        let e = compile_err("const int a = 1\nconst int a = 2\n");
        match e {
            Error::Parser { msg, line, .. } => {
                assert!(msg.contains("Duplicate identifier 'a'"), "{}", msg);
                assert_eq!(2, line);
            }
            other => panic!("unexpected: {:?}", other),
        }

        // untyped form: the existing constant evaluates as an expression,
        // which cannot be a type specification
        let e = compile_err("const a = 1\nconst a = 2\n");
        match e {
            Error::Parser { msg, .. } => {
                assert!(msg.contains("Type specification or new identifier"), "{}", msg)
            }
            other => panic!("unexpected: {:?}", other),
        }

        let e = compile_err("const a = b + 1\n");
        match e {
            Error::NotFound { entry, .. } => assert_eq!("b", entry),
            other => panic!("unexpected: {:?}", other),
        }

        // deeper resolution failures are not misread as declarations
        let e = compile_err("const a = System.nosuch\n");
        match e {
            Error::NotFound { entry, .. } => assert_eq!("System.nosuch", entry),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_qualified_names() {
        let c = compile("const a = System.int(65)\n").unwrap();
        assert_eq!(65, const_value(&c, "a").int_());
    }

    #[test]
    fn test_module_header() {
        assert!(compile("module test\nconst a = 1\n").is_ok());
        let e = compile_err("module other\n");
        match e {
            Error::Parser { msg, .. } => assert!(msg.contains("Module name mismatch")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_constant_reuse() {
        let c = compile(
            "const a = 6\n\
             const b = a * 7\n\
             const s = 'x' ++ 'y'\n\
             const t = s ++ s\n",
        )
        .unwrap();
        assert_eq!(42, const_value(&c, "b").int_());
        assert_eq!(b"xyxy", const_value(&c, "t").vec_bytes());
    }

    #[test]
    fn test_echo_statements() {
        let (_c, out) = run(
            "const name = 'world'\n\
             echo 'hello', name\n\
             echo 2 + 3\n",
        );
        assert_eq!("hello world\n5\n", out);
    }

    #[test]
    fn test_echo_disabled() {
        let mut c = Compiler::from_bytes("test.sn", b"echo 'hi'\n").unwrap();
        c.options.remove(Opt::Echo);
        c.compile().unwrap();
        let mut out: Vec<u8> = Vec::new();
        c.execute(&mut out).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_assert_statements() {
        let (_c, out) = run("assert 2 + 2 == 4\n");
        assert_eq!("", out);

        let mut c = compile("assert 2 + 2 == 5\n").unwrap();
        let mut out: Vec<u8> = Vec::new();
        match c.execute(&mut out) {
            Err(Error::RuntimeAssert { file, line }) => {
                assert_eq!("test.sn", file);
                assert_eq!(1, line);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_var_initialization() {
        let (c, out) = run(
            "var x = 3 * 4\n\
             var greeting = 'hi ' ++ 'there'\n\
             var int y = 0\n\
             echo greeting\n",
        );
        assert_eq!("hi there\n", out);
        assert_eq!(24, c.world.module(c.module).data_size);
    }

    #[test]
    fn test_refcount_conservation() {
        use crate::buf::Buf;
        let before = Buf::allocated();
        {
            let (_c, out) = run(
                "const s = 'foo' ++ 'bar'\n\
                 const t = s ++ 'baz'\n\
                 var v = t ++ t\n\
                 const vs = ['ab', 'cd'] \n\
                 echo s, t\n",
            );
            assert_eq!("foobar foobarbaz\n", out);
        }
        assert_eq!(before, Buf::allocated());
    }

    #[test]
    fn test_short_circuit_no_side_effect() {
        // the rhs would divide by zero if evaluated
        let c = compile("const a = false and 1 / 0 == 1\n").unwrap();
        assert_eq!(0, const_value(&c, "a").int_());
        let c = compile("const b = true or 1 / 0 == 1\n").unwrap();
        assert_eq!(1, const_value(&c, "b").int_());
    }

    #[test]
    fn test_new_ident_recovery() {
        // 'x' is unknown, so it is the declared name; but an unknown name
        // in a deeper expression still errors
        assert!(compile("const x = 1\n").is_ok());
        let e = compile_err("const x = 1\nconst y = x + zz\n");
        match e {
            Error::NotFound { entry, .. } => assert_eq!("zz", entry),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_var_in_const_expr_has_no_context() {
        let e = compile_err("var x = 1\nconst y = x + 1\n");
        assert_eq!(Error::NoContext, e);
        // same for typeof, which evaluates in a context-free child
        let e = compile_err("var x = 1\nconst t = typeof(x)\n");
        assert_eq!(Error::NoContext, e);
    }

    #[test]
    fn test_echo_of_variables() {
        let (_c, out) = run(
            "var x = 6 * 7\n\
             var s = 'value: '\n\
             echo s, x\n",
        );
        assert_eq!("value:  42\n", out);
    }

    #[test]
    fn test_typed_var_out_of_range() {
        let e = compile_err("def sub = 10..20\nvar sub x = 30\n");
        match e {
            Error::Parser { msg, .. } => assert!(msg.contains("Value out of range"), "{}", msg),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_empty_module() {
        let (_c, out) = run("module test\n");
        assert_eq!("", out);
        let (_c, out) = run("");
        assert_eq!("", out);
    }
}
