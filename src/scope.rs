// Symbol scopes, modules and the World.
//
// A scope is a sorted symbol table plus a parent pointer and a `uses` list;
// name resolution goes own symbols, then the uses list newest first, then
// the parent chain. Scopes own their constants and variables; types are
// owned through the arena's back-reference. Type aliases are constants of
// typeref value.
//
// World packages what would otherwise be process-wide state (the built-in
// module, the module registry, the type arena) as one explicit value
// created at startup and passed down; dropping it releases every constant
// value it owns.

use log::debug;

use crate::buf::Buf;
use crate::error::{Error, Result};
use crate::types::{ScopeId, TypeId, Types};
use crate::value::{finalize_vec, Value};
use crate::vm::CodeSegment;


#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct VarId(u32);

impl VarId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct ConstId(u32);

impl ConstId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct ModuleId(u32);

impl ModuleId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}


#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Sym {
    Const(ConstId),
    Var(VarId),
    Module(ModuleId),
}


pub struct Variable {
    pub name: String,
    pub type_id: TypeId,
    pub data_offset: i32,
    pub local: bool,
    pub owner: ScopeId,
}


pub struct Constant {
    pub name: String,
    pub value: Value,
}


pub struct Scope {
    pub parent: Option<ScopeId>,
    uses: Vec<ModuleId>,
    symbols: Vec<(String, Sym)>,
    pub vars: Vec<VarId>,
    pub consts: Vec<ConstId>,
}


pub struct Module {
    pub name: String,
    pub file_name: String,
    pub scope: ScopeId,
    pub type_id: TypeId,
    // Interned string/vector constant payloads with their vector type;
    // emitted code refers to these by raw pointer, so the pool must
    // outlive the code segment, and teardown finalizes through the type.
    pub consts_pool: Vec<(TypeId, Buf)>,
    pub data_size: i32,
    // The statement code produced by the driver.
    pub main_code: Option<CodeSegment>,
}


pub struct World {
    pub types: Types,
    scopes: Vec<Scope>,
    pub vars: Vec<Variable>,
    pub consts: Vec<Constant>,
    pub modules: Vec<Module>,

    pub system: ModuleId,
    pub default_int: TypeId,
    pub default_large: TypeId,
    pub default_char: TypeId,
    pub default_str: TypeId,
    pub default_bool: TypeId,
    pub default_void: TypeId,
    pub default_typeref: TypeId,
    pub default_empty_vec: TypeId,
}


impl World {
    pub fn new() -> World {
        let mut types = Types::new();

        let default_typeref = types.new_typeref("typeref");
        let default_int =
            types.new_int(Some("int"), i32::min_value() as i64, i32::max_value() as i64);
        let default_large =
            types.new_int(Some("large"), i64::min_value(), i64::max_value());
        let default_char = types.new_char(Some("char"), 0, 255);
        let default_str = types.new_vector(Some("str"), default_char);
        types.set_derived_vector(default_char, default_str);
        let default_bool = types.new_bool("bool");
        let default_void = types.new_void("void");
        let default_empty_vec = types.new_vector(None, default_void);
        let system_type = types.new_module_type("System");

        let mut world = World {
            types,
            scopes: Vec::new(),
            vars: Vec::new(),
            consts: Vec::new(),
            modules: Vec::new(),
            system: ModuleId(0),
            default_int,
            default_large,
            default_char,
            default_str,
            default_bool,
            default_void,
            default_typeref,
            default_empty_vec,
        };

        let scope = world.add_scope(None);
        world.modules.push(Module {
            name: "System".to_string(),
            file_name: String::new(),
            scope,
            type_id: system_type,
            consts_pool: Vec::new(),
            data_size: 0,
            main_code: None,
        });

        for &t in &[
            default_typeref,
            default_int,
            default_large,
            default_char,
            default_str,
            default_bool,
            default_void,
            default_empty_vec,
            system_type,
        ] {
            world.types.set_owner(t, scope).unwrap();
        }

        for &t in &[
            default_typeref,
            default_int,
            default_large,
            default_char,
            default_str,
            default_bool,
            default_void,
        ] {
            let name = world.types.get(t).name.clone().unwrap();
            world.add_type_alias(scope, &name, t).unwrap();
        }

        world
    }

    // --- scopes ---

    pub fn add_scope(&mut self, parent: Option<ScopeId>) -> ScopeId {
        let id = ScopeId(self.scopes.len() as u32);
        self.scopes.push(Scope {
            parent,
            uses: Vec::new(),
            symbols: Vec::new(),
            vars: Vec::new(),
            consts: Vec::new(),
        });
        id
    }

    pub fn scope(&self, id: ScopeId) -> &Scope {
        &self.scopes[id.index()]
    }

    fn scope_mut(&mut self, id: ScopeId) -> &mut Scope {
        &mut self.scopes[id.index()]
    }

    pub fn add_symbol(&mut self, scope: ScopeId, name: &str, sym: Sym) -> Result<()> {
        if name.is_empty() {
            return Err(Error::internal(4));
        }
        let s = self.scope_mut(scope);
        match s.symbols.binary_search_by(|(n, _)| n.as_str().cmp(name)) {
            Ok(_) => Err(Error::Duplicate(name.to_string())),
            Err(at) => {
                s.symbols.insert(at, (name.to_string(), sym));
                Ok(())
            }
        }
    }

    // Single-scope lookup: binary search in the sorted table.
    pub fn find(&self, scope: ScopeId, name: &str) -> Option<Sym> {
        let s = self.scope(scope);
        s.symbols
            .binary_search_by(|(n, _)| n.as_str().cmp(name))
            .ok()
            .map(|i| s.symbols[i].1)
    }

    // Own symbols, then the uses list from last to first, then the parent.
    pub fn deep_find(&self, scope: ScopeId, name: &str) -> Option<Sym> {
        if let Some(sym) = self.find(scope, name) {
            return Some(sym);
        }
        let s = self.scope(scope);
        for &m in s.uses.iter().rev() {
            if let Some(sym) = self.find(self.modules[m.index()].scope, name) {
                return Some(sym);
            }
        }
        match s.parent {
            Some(p) => self.deep_find(p, name),
            None => None,
        }
    }

    pub fn add_uses(&mut self, scope: ScopeId, module: ModuleId) -> Result<()> {
        self.scope_mut(scope).uses.push(module);
        let name = self.modules[module.index()].name.clone();
        self.add_symbol(scope, &name, Sym::Module(module))
    }

    // --- constants / aliases / variables ---

    pub fn add_constant(&mut self, scope: ScopeId, name: &str, value: Value) -> Result<ConstId> {
        let id = ConstId(self.consts.len() as u32);
        self.add_symbol(scope, name, Sym::Const(id))?;
        self.consts.push(Constant { name: name.to_string(), value });
        self.scope_mut(scope).consts.push(id);
        Ok(id)
    }

    // A type alias is a constant of typeref value.
    pub fn add_type_alias(&mut self, scope: ScopeId, name: &str, ty: TypeId) -> Result<ConstId> {
        let value = Value::typeref(self.default_typeref, ty);
        self.add_constant(scope, name, value)
    }

    pub fn constant(&self, id: ConstId) -> &Constant {
        &self.consts[id.index()]
    }

    pub fn variable(&self, id: VarId) -> &Variable {
        &self.vars[id.index()]
    }

    // A module-level variable: assign the current data size as its offset,
    // then advance by the aligned size.
    pub fn add_module_variable(
        &mut self,
        module: ModuleId,
        name: &str,
        ty: TypeId,
    ) -> Result<VarId> {
        let scope = self.modules[module.index()].scope;
        let offset = self.modules[module.index()].data_size;
        let id = VarId(self.vars.len() as u32);
        self.add_symbol(scope, name, Sym::Var(id))?;
        self.modules[module.index()].data_size = offset + self.types.aligned_size(ty);
        self.vars.push(Variable {
            name: name.to_string(),
            type_id: ty,
            data_offset: offset,
            local: false,
            owner: scope,
        });
        self.scope_mut(scope).vars.push(id);
        Ok(id)
    }

    pub fn add_local_variable(
        &mut self,
        scope: ScopeId,
        name: &str,
        ty: TypeId,
        offset: i32,
    ) -> Result<VarId> {
        let id = VarId(self.vars.len() as u32);
        self.add_symbol(scope, name, Sym::Var(id))?;
        self.vars.push(Variable {
            name: name.to_string(),
            type_id: ty,
            data_offset: offset,
            local: true,
            owner: scope,
        });
        self.scope_mut(scope).vars.push(id);
        Ok(id)
    }

    // Register an anonymous type under a scope (ownership bookkeeping only;
    // the arena keeps the storage).
    pub fn add_anon_type(&mut self, scope: ScopeId, ty: TypeId) -> Result<()> {
        if self.types.owner(ty).is_none() {
            self.types.set_owner(ty, scope)?;
        }
        Ok(())
    }

    // --- modules ---

    pub fn new_module(&mut self, name: &str, file_name: &str) -> Result<ModuleId> {
        let scope = self.add_scope(None);
        let type_id = self.types.new_module_type(name);
        self.types.set_owner(type_id, scope)?;
        let id = ModuleId(self.modules.len() as u32);
        self.modules.push(Module {
            name: name.to_string(),
            file_name: file_name.to_string(),
            scope,
            type_id,
            consts_pool: Vec::new(),
            data_size: 0,
            main_code: None,
        });
        let system = self.system;
        self.add_uses(scope, system)?;
        debug!("module '{}' ({})", name, file_name);
        Ok(id)
    }

    pub fn module(&self, id: ModuleId) -> &Module {
        &self.modules[id.index()]
    }

    pub fn module_mut(&mut self, id: ModuleId) -> &mut Module {
        &mut self.modules[id.index()]
    }

    pub fn find_module(&self, name: &str) -> Option<ModuleId> {
        self.modules
            .iter()
            .position(|m| m.name.eq_ignore_ascii_case(name))
            .map(|i| ModuleId(i as u32))
    }

    // Intern a string payload in the module's pool; the returned payload
    // pointer stays valid for the module's lifetime.
    pub fn intern(&mut self, module: ModuleId, bytes: &[u8]) -> *mut u8 {
        let str_type = self.default_str;
        self.intern_buf(module, str_type, Buf::from_bytes(bytes))
    }

    pub fn intern_buf(&mut self, module: ModuleId, vec_type: TypeId, b: Buf) -> *mut u8 {
        let p = b.raw();
        self.modules[module.index()].consts_pool.push((vec_type, b));
        p
    }

    // Debug rendering of a module's contents, in definition order:
    // constants, variables, then owned types.
    pub fn dump_module(&self, id: ModuleId) -> String {
        let m = self.module(id);
        let mut out = format!("module {}\n", m.name);
        let scope = self.scope(m.scope);
        for &c in &scope.consts {
            let c = self.constant(c);
            out.push_str(&format!(
                "const {} = {}\n",
                self.types.definition_with(c.value.type_id, &c.name),
                self.types.display_value(&c.value)
            ));
        }
        for &v in &scope.vars {
            let v = self.variable(v);
            out.push_str(&format!(
                "var {} @{}\n",
                self.types.definition_with(v.type_id, &v.name),
                v.data_offset
            ));
        }
        out
    }
}


impl Drop for World {
    fn drop(&mut self) {
        // Constants release first, while the types they reference are still
        // valid. The interned pools go last, finalizing through their
        // element types so nested vector constants drop their members.
        for c in &self.consts {
            c.value.release(&self.types);
        }
        for m in &mut self.modules {
            for (vec_type, b) in std::mem::replace(&mut m.consts_pool, Vec::new()) {
                unsafe { finalize_vec(&self.types, vec_type, b.into_raw()) };
            }
        }
    }
}
