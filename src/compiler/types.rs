//! The type pool: structural interning of every type the front/middle end
//! ever names.
//!
//! Every `make_*` constructor performs a structural-equality search over the
//! existing entries and returns the matching id, or appends a new one. The
//! search here is linear (`v0`, matching the reference implementation) —
//! the pool stays small relative to program size, so a hash-consing index is
//! not worth the complexity yet.

use serde::{Deserialize, Serialize};

pub type TypeId = u32;

/// Canonical error type, always id 0.
pub const ERROR_TYPE: TypeId = 0;
/// Sentinel returned on malformed input. The pool never aborts; callers
/// check for this id where a constructor might otherwise fail.
pub const INVALID_TYPE: TypeId = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(non_camel_case_types)]
pub enum Builtin {
    Unit,
    Never,
    Bool,
    Char,
    Text,
    Null,
    I8,
    I16,
    I32,
    I64,
    I128,
    U8,
    U16,
    U32,
    U64,
    U128,
    ISize,
    USize,
    F32,
    F64,
    F128,
    /// Internal placeholder for an unsuffixed integer literal. Must never
    /// appear in surface spellings; [`builtin_from_name`]/[`builtin_name`]
    /// deliberately have no entry for it.
    InferInteger,
}

impl Builtin {
    pub const ALL: [Builtin; 22] = [
        Builtin::Unit,
        Builtin::Never,
        Builtin::Bool,
        Builtin::Char,
        Builtin::Text,
        Builtin::Null,
        Builtin::I8,
        Builtin::I16,
        Builtin::I32,
        Builtin::I64,
        Builtin::I128,
        Builtin::U8,
        Builtin::U16,
        Builtin::U32,
        Builtin::U64,
        Builtin::U128,
        Builtin::ISize,
        Builtin::USize,
        Builtin::F32,
        Builtin::F64,
        Builtin::F128,
        Builtin::InferInteger,
    ];

    pub fn is_integer(self) -> bool {
        matches!(
            self,
            Builtin::I8
                | Builtin::I16
                | Builtin::I32
                | Builtin::I64
                | Builtin::I128
                | Builtin::U8
                | Builtin::U16
                | Builtin::U32
                | Builtin::U64
                | Builtin::U128
                | Builtin::ISize
                | Builtin::USize
        )
    }

    pub fn is_signed(self) -> bool {
        matches!(
            self,
            Builtin::I8 | Builtin::I16 | Builtin::I32 | Builtin::I64 | Builtin::I128 | Builtin::ISize
        )
    }

    pub fn is_float(self) -> bool {
        matches!(self, Builtin::F32 | Builtin::F64 | Builtin::F128)
    }
}

/// `name` -> [`Builtin`], including the fixed alias table. `InferInteger` has
/// no surface spelling and is deliberately absent.
pub fn builtin_from_name(name: &str) -> Option<Builtin> {
    Some(match name {
        "null" => Builtin::Null,
        "void" => Builtin::Unit,
        "never" => Builtin::Never,
        "bool" => Builtin::Bool,
        "char" => Builtin::Char,
        "text" => Builtin::Text,
        "i8" => Builtin::I8,
        "i16" => Builtin::I16,
        "i32" => Builtin::I32,
        "i64" => Builtin::I64,
        "i128" => Builtin::I128,
        "u8" => Builtin::U8,
        "u16" => Builtin::U16,
        "u32" => Builtin::U32,
        "u64" => Builtin::U64,
        "u128" => Builtin::U128,
        "isize" => Builtin::ISize,
        "usize" => Builtin::USize,
        "f32" => Builtin::F32,
        "f64" => Builtin::F64,
        "f128" => Builtin::F128,
        _ => return None,
    })
}

pub fn builtin_name(b: Builtin) -> &'static str {
    match b {
        Builtin::Null => "null",
        Builtin::Unit => "void",
        Builtin::Never => "never",
        Builtin::Bool => "bool",
        Builtin::Char => "char",
        Builtin::Text => "text",
        Builtin::I8 => "i8",
        Builtin::I16 => "i16",
        Builtin::I32 => "i32",
        Builtin::I64 => "i64",
        Builtin::I128 => "i128",
        Builtin::U8 => "u8",
        Builtin::U16 => "u16",
        Builtin::U32 => "u32",
        Builtin::U64 => "u64",
        Builtin::U128 => "u128",
        Builtin::ISize => "isize",
        Builtin::USize => "usize",
        Builtin::F32 => "f32",
        Builtin::F64 => "f64",
        Builtin::F128 => "f128",
        Builtin::InferInteger => "{integer}",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Kind {
    Error,
    Builtin,
    Optional,
    Array,
    Borrow,
    Escape,
    Ptr,
    Fn,
    NamedUser,
}

/// A single interned type record. Variable-length data (function params,
/// labels, default flags, path segments, named type args) lives in parallel
/// side vectors on [`TypePool`], referenced here by `(begin, count)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Type {
    pub kind: Kind,
    pub builtin: Builtin,
    pub elem: TypeId,
    pub array_has_size: bool,
    pub array_size: u32,
    pub borrow_is_mut: bool,
    pub ptr_is_mut: bool,
    pub ret: TypeId,
    pub param_begin: u32,
    pub param_count: u32,
    pub positional_param_count: u32,
    pub label_begin: u32,
    pub default_begin: u32,
    pub path_begin: u32,
    pub path_count: u32,
    pub named_arg_begin: u32,
    pub named_arg_count: u32,
}

impl Type {
    fn blank(kind: Kind) -> Self {
        Self {
            kind,
            builtin: Builtin::Unit,
            elem: INVALID_TYPE,
            array_has_size: false,
            array_size: 0,
            borrow_is_mut: false,
            ptr_is_mut: false,
            ret: INVALID_TYPE,
            param_begin: 0,
            param_count: 0,
            positional_param_count: 0,
            label_begin: 0,
            default_begin: 0,
            path_begin: 0,
            path_count: 0,
            named_arg_begin: 0,
            named_arg_count: 0,
        }
    }
}

#[derive(Debug, Default)]
pub struct TypePool {
    types: Vec<Type>,
    fn_params: Vec<TypeId>,
    fn_param_labels: Vec<String>,
    fn_param_has_default: Vec<bool>,
    user_path_segs: Vec<String>,
    named_type_args: Vec<TypeId>,
    builtin_ids: Vec<TypeId>,
}

impl TypePool {
    pub fn new() -> Self {
        let mut pool = Self::default();
        let mut err = Type::blank(Kind::Error);
        err.builtin = Builtin::Unit;
        pool.types.push(err);

        for b in Builtin::ALL {
            let mut t = Type::blank(Kind::Builtin);
            t.builtin = b;
            pool.builtin_ids.push(pool.types.len() as TypeId);
            pool.types.push(t);
        }
        pool
    }

    fn push(&mut self, t: Type) -> TypeId {
        let id = self.types.len() as TypeId;
        self.types.push(t);
        id
    }

    pub fn error(&self) -> TypeId {
        ERROR_TYPE
    }

    pub fn builtin(&self, b: Builtin) -> TypeId {
        self.builtin_ids[b as usize]
    }

    pub fn get(&self, id: TypeId) -> &Type {
        if id == INVALID_TYPE || id as usize >= self.types.len() {
            return &self.types[ERROR_TYPE as usize];
        }
        &self.types[id as usize]
    }

    pub fn count(&self) -> u32 {
        self.types.len() as u32
    }

    pub fn is_valid(&self, id: TypeId) -> bool {
        id != INVALID_TYPE && (id as usize) < self.types.len()
    }

    // ---- constructors ----

    pub fn make_named_user_path(&mut self, segs: &[String]) -> TypeId {
        self.make_named_user_path_with_args(segs, &[])
    }

    pub fn make_named_user_path_with_args(&mut self, segs: &[String], args: &[TypeId]) -> TypeId {
        for i in 0..self.types.len() {
            let t = &self.types[i];
            if t.kind != Kind::NamedUser {
                continue;
            }
            if t.path_count as usize != segs.len() || t.named_arg_count as usize != args.len() {
                continue;
            }
            let path_ok = (0..segs.len()).all(|k| {
                self.user_path_segs[t.path_begin as usize + k] == segs[k]
            });
            let args_ok = (0..args.len()).all(|k| {
                self.named_type_args[t.named_arg_begin as usize + k] == args[k]
            });
            if path_ok && args_ok {
                return i as TypeId;
            }
        }

        let mut t = Type::blank(Kind::NamedUser);
        t.path_begin = self.user_path_segs.len() as u32;
        t.path_count = segs.len() as u32;
        t.named_arg_begin = self.named_type_args.len() as u32;
        t.named_arg_count = args.len() as u32;
        self.user_path_segs.extend(segs.iter().cloned());
        self.named_type_args.extend_from_slice(args);
        self.push(t)
    }

    /// Rejects `Unit`/`InferInteger` spellings: those builtins have no
    /// surface name, so a path that happens to match one lexically is
    /// treated as a (fresh) user type rather than aliased to the builtin.
    pub fn intern_path(&mut self, segs: &[String]) -> TypeId {
        if segs.len() == 1 {
            if let Some(b) = builtin_from_name(&segs[0]) {
                if !matches!(b, Builtin::InferInteger) {
                    return self.builtin(b);
                }
            }
        }
        self.make_named_user_path(segs)
    }

    pub fn intern_named_path_with_args(&mut self, segs: &[String], args: &[TypeId]) -> TypeId {
        if args.is_empty() {
            return self.intern_path(segs);
        }
        self.make_named_user_path_with_args(segs, args)
    }

    pub fn intern_ident(&mut self, name: &str) -> TypeId {
        self.intern_path(std::slice::from_ref(&name.to_string()))
    }

    pub fn make_optional(&mut self, elem: TypeId) -> TypeId {
        for i in 0..self.types.len() {
            let t = &self.types[i];
            if t.kind == Kind::Optional && t.elem == elem {
                return i as TypeId;
            }
        }
        let mut t = Type::blank(Kind::Optional);
        t.elem = elem;
        self.push(t)
    }

    pub fn make_array(&mut self, elem: TypeId, has_size: bool, size: u32) -> TypeId {
        for i in 0..self.types.len() {
            let t = &self.types[i];
            if t.kind != Kind::Array || t.elem != elem || t.array_has_size != has_size {
                continue;
            }
            if has_size && t.array_size != size {
                continue;
            }
            return i as TypeId;
        }
        let mut t = Type::blank(Kind::Array);
        t.elem = elem;
        t.array_has_size = has_size;
        t.array_size = if has_size { size } else { 0 };
        self.push(t)
    }

    pub fn make_borrow(&mut self, elem: TypeId, is_mut: bool) -> TypeId {
        for i in 0..self.types.len() {
            let t = &self.types[i];
            if t.kind == Kind::Borrow && t.elem == elem && t.borrow_is_mut == is_mut {
                return i as TypeId;
            }
        }
        let mut t = Type::blank(Kind::Borrow);
        t.elem = elem;
        t.borrow_is_mut = is_mut;
        self.push(t)
    }

    pub fn make_escape(&mut self, elem: TypeId) -> TypeId {
        for i in 0..self.types.len() {
            let t = &self.types[i];
            if t.kind == Kind::Escape && t.elem == elem {
                return i as TypeId;
            }
        }
        let mut t = Type::blank(Kind::Escape);
        t.elem = elem;
        self.push(t)
    }

    pub fn make_ptr(&mut self, elem: TypeId, is_mut: bool) -> TypeId {
        for i in 0..self.types.len() {
            let t = &self.types[i];
            if t.kind == Kind::Ptr && t.elem == elem && t.ptr_is_mut == is_mut {
                return i as TypeId;
            }
        }
        let mut t = Type::blank(Kind::Ptr);
        t.elem = elem;
        t.ptr_is_mut = is_mut;
        self.push(t)
    }

    /// `positional_count = None` means "all positional". `labels`/`defaults`
    /// default to empty-label / no-default when shorter than `params`.
    pub fn make_fn(
        &mut self,
        ret: TypeId,
        params: &[TypeId],
        positional_count: Option<u32>,
        labels: &[String],
        has_default: &[bool],
    ) -> TypeId {
        let positional_count = positional_count
            .unwrap_or(params.len() as u32)
            .min(params.len() as u32);

        'outer: for i in 0..self.types.len() {
            let t = &self.types[i];
            if t.kind != Kind::Fn || t.ret != ret {
                continue;
            }
            if t.param_count as usize != params.len() || t.positional_param_count != positional_count {
                continue;
            }
            for k in 0..params.len() {
                if self.fn_params[t.param_begin as usize + k] != params[k] {
                    continue 'outer;
                }
                let lhs_label = &self.fn_param_labels[t.label_begin as usize + k];
                let rhs_label = labels.get(k).cloned().unwrap_or_default();
                if *lhs_label != rhs_label {
                    continue 'outer;
                }
                let lhs_def = self.fn_param_has_default[t.default_begin as usize + k];
                let rhs_def = has_default.get(k).copied().unwrap_or(false);
                if lhs_def != rhs_def {
                    continue 'outer;
                }
            }
            return i as TypeId;
        }

        let mut t = Type::blank(Kind::Fn);
        t.ret = ret;
        t.param_begin = self.fn_params.len() as u32;
        t.param_count = params.len() as u32;
        t.positional_param_count = positional_count;
        t.label_begin = self.fn_param_labels.len() as u32;
        t.default_begin = self.fn_param_has_default.len() as u32;
        for k in 0..params.len() {
            self.fn_params.push(params[k]);
            self.fn_param_labels.push(labels.get(k).cloned().unwrap_or_default());
            self.fn_param_has_default.push(has_default.get(k).copied().unwrap_or(false));
        }
        self.push(t)
    }

    pub fn is_fn(&self, id: TypeId) -> bool {
        self.is_valid(id) && self.types[id as usize].kind == Kind::Fn
    }

    pub fn fn_param_at(&self, def: TypeId, i: u32) -> TypeId {
        if !self.is_fn(def) {
            return self.error();
        }
        let t = &self.types[def as usize];
        if i >= t.param_count {
            return self.error();
        }
        self.fn_params[(t.param_begin + i) as usize]
    }

    pub fn fn_positional_count(&self, def: TypeId) -> u32 {
        if !self.is_fn(def) {
            return 0;
        }
        self.types[def as usize].positional_param_count
    }

    pub fn fn_param_label_at(&self, def: TypeId, i: u32) -> &str {
        if !self.is_fn(def) {
            return "";
        }
        let t = &self.types[def as usize];
        if i >= t.param_count {
            return "";
        }
        &self.fn_param_labels[(t.label_begin + i) as usize]
    }

    pub fn fn_param_has_default_at(&self, def: TypeId, i: u32) -> bool {
        if !self.is_fn(def) {
            return false;
        }
        let t = &self.types[def as usize];
        if i >= t.param_count {
            return false;
        }
        self.fn_param_has_default[(t.default_begin + i) as usize]
    }

    pub fn decompose_named_user(&self, id: TypeId) -> Option<(Vec<String>, Vec<TypeId>)> {
        if !self.is_valid(id) {
            return None;
        }
        let t = &self.types[id as usize];
        if t.kind != Kind::NamedUser || t.path_count == 0 {
            return None;
        }
        let path = self.user_path_segs[t.path_begin as usize..(t.path_begin + t.path_count) as usize]
            .to_vec();
        let args = self.named_type_args
            [t.named_arg_begin as usize..(t.named_arg_begin + t.named_arg_count) as usize]
            .to_vec();
        Some((path, args))
    }

    // ---- pretty-printing ----

    /// Parser-friendly pretty print. `export` omits parameter labels and
    /// default markers so the text is stable across ABI boundaries.
    pub fn display(&self, id: TypeId, export: bool) -> String {
        if !self.is_valid(id) {
            return "<invalid>".to_string();
        }
        let t = &self.types[id as usize];
        match t.kind {
            Kind::Error => "<error>".to_string(),
            Kind::Builtin => builtin_name(t.builtin).to_string(),
            Kind::Optional => format!("{}?", self.display(t.elem, export)),
            Kind::Array => {
                if t.array_has_size {
                    format!("{}[{}]", self.display(t.elem, export), t.array_size)
                } else {
                    format!("{}[]", self.display(t.elem, export))
                }
            }
            Kind::Borrow => {
                let inner = self.display(t.elem, export);
                let needs_parens = self.is_fn(t.elem);
                let inner = if needs_parens { format!("({inner})") } else { inner };
                if t.borrow_is_mut {
                    format!("&mut {inner}")
                } else {
                    format!("&{inner}")
                }
            }
            Kind::Escape => format!("^&{}", self.display(t.elem, export)),
            Kind::Ptr => {
                if t.ptr_is_mut {
                    format!("*mut {}", self.display(t.elem, export))
                } else {
                    format!("*{}", self.display(t.elem, export))
                }
            }
            Kind::Fn => {
                let mut parts = Vec::new();
                for k in 0..t.param_count {
                    let pid = self.fn_params[(t.param_begin + k) as usize];
                    let mut piece = String::new();
                    if !export && k >= t.positional_param_count {
                        let label = &self.fn_param_labels[(t.label_begin + k) as usize];
                        if !label.is_empty() {
                            piece.push_str(label);
                            piece.push_str(": ");
                        }
                    }
                    piece.push_str(&self.display(pid, export));
                    if !export && self.fn_param_has_default[(t.default_begin + k) as usize] {
                        piece.push_str(" = ..");
                    }
                    parts.push(piece);
                }
                format!("fn({}) -> {}", parts.join(", "), self.display(t.ret, export))
            }
            Kind::NamedUser => {
                let path = self.user_path_segs
                    [t.path_begin as usize..(t.path_begin + t.path_count) as usize]
                    .join("::");
                if t.named_arg_count == 0 {
                    path
                } else {
                    let args: Vec<String> = (0..t.named_arg_count)
                        .map(|k| self.display(self.named_type_args[(t.named_arg_begin + k) as usize], export))
                        .collect();
                    format!("{path}<{}>", args.join(", "))
                }
            }
        }
    }
}
