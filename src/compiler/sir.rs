//! SIR: a typed, structured intermediate representation that still mirrors
//! source-level control flow (no basic blocks yet — that flattening is
//! OIR's job). Lowering happens after type checking, reading resolved types
//! directly off the AST plus the checker's final symbol-type table.

use crate::compiler::ast::*;
use crate::compiler::diagnostics::{DiagCode, DiagnosticsBag};
use crate::compiler::resolve::{BindKind, SymbolTable};
use crate::compiler::tokens::Span;
use crate::compiler::types::{TypeId, TypePool, ERROR_TYPE};
use std::collections::{HashMap, HashSet};

pub type SirValueId = u32;
pub type SirBlockId = u32;
pub type SirStmtId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceClass {
    NotPlace,
    Local,
    Index,
    Field,
    Deref,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectClass {
    Pure,
    MayWrite,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Abi {
    Default,
    C,
}

#[derive(Debug, Clone)]
pub enum SirArg {
    Positional(SirValueId),
    Labeled { label: String, value: SirValueId },
    NamedGroup { entries: Vec<(String, SirValueId)> },
}

#[derive(Debug, Clone)]
pub enum ValueKind {
    IntLit(i128),
    FloatLit(f64),
    StringLit(String),
    CharLit(char),
    BoolLit(bool),
    NullLit,
    Local { symbol: u32 },
    Global { symbol: u32 },
    Param { symbol: u32 },
    ArrayLit { elems: Vec<SirValueId> },
    FieldInit { fields: Vec<(String, SirValueId)> },
    Borrow { operand: SirValueId, is_mut: bool },
    Escape { operand: SirValueId },
    Unary { op: UnaryOp, operand: SirValueId },
    Binary { op: BinOp, lhs: SirValueId, rhs: SirValueId },
    Assign { target: SirValueId, value: SirValueId },
    PostfixInc { target: SirValueId },
    Call { callee: SirValueId, direct_callee: Option<usize>, args: Vec<SirArg> },
    Index { base: SirValueId, index: SirValueId },
    Field { base: SirValueId, name: String },
    IfExpr { cond: SirValueId, then_block: SirBlockId, else_block: Option<SirBlockId> },
    BlockExpr { block: SirBlockId, tail: Option<SirValueId> },
    LoopExpr { body: SirBlockId, break_type: Option<TypeId> },
    Cast { kind: CastKind, operand: SirValueId, target: TypeId },
    Error,
}

#[derive(Debug, Clone)]
pub struct Value {
    pub kind: ValueKind,
    pub type_id: TypeId,
    pub place_class: PlaceClass,
    pub effect: EffectClass,
    pub owning_symbol: Option<u32>,
    pub origin_symbol: Option<u32>,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct SirSwitchCase {
    pub is_default: bool,
    pub pattern: Option<SirValueId>,
    pub body: SirBlockId,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub enum SirStmtKind {
    Empty,
    ExprStmt(SirValueId),
    VarDecl {
        sym: u32,
        is_set: bool,
        is_mut: bool,
        is_static: bool,
        declared_type: TypeId,
        init: Option<SirValueId>,
    },
    If {
        cond: SirValueId,
        then_block: SirBlockId,
        else_block: Option<SirBlockId>,
    },
    While {
        cond: SirValueId,
        body: SirBlockId,
    },
    DoScope {
        body: SirBlockId,
    },
    DoWhile {
        body: SirBlockId,
        cond: SirValueId,
    },
    Manual {
        body: SirBlockId,
    },
    Return(Option<SirValueId>),
    Break(Option<SirValueId>),
    Continue,
    Switch {
        scrutinee: SirValueId,
        cases: Vec<SirSwitchCase>,
    },
    /// Reserved tags carried for structural parity; nothing in the surface
    /// grammar produces them yet.
    CommitStmt,
    RecastStmt,
    Error,
}

#[derive(Debug, Clone)]
pub struct SirStmt {
    pub kind: SirStmtKind,
    pub span: Span,
}

#[derive(Debug, Clone, Default)]
pub struct SirBlock {
    pub stmts: Vec<SirStmtId>,
}

#[derive(Debug, Clone)]
pub struct SirParam {
    pub symbol: u32,
    pub name: String,
    pub ty: TypeId,
}

#[derive(Debug, Clone)]
pub struct SirFunction {
    pub name: String,
    pub mangled: String,
    pub signature: TypeId,
    pub abi: Abi,
    pub entry: SirBlockId,
    pub params: Vec<SirParam>,
    pub is_pure: bool,
    pub is_comptime: bool,
    pub is_extern: bool,
    pub acts_owner: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct SirGlobal {
    pub symbol: u32,
    pub name: String,
    pub ty: TypeId,
    pub is_mut: bool,
    pub init: Option<SirValueId>,
}

#[derive(Debug, Clone)]
pub struct SirFieldMember {
    pub name: String,
    pub ty: TypeId,
}

#[derive(Debug, Clone)]
pub struct SirField {
    pub name: String,
    pub members: Vec<SirFieldMember>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscapeHandleKind {
    Trivial,
    StackSlot,
    CallerSlot,
    HeapBox,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscapeBoundary {
    None,
    Return,
    CallArg,
    Abi,
    Ffi,
}

#[derive(Debug, Clone)]
pub struct EscapeHandleMeta {
    pub escape_value: SirValueId,
    pub origin_sym: u32,
    pub pointee_type: TypeId,
    pub kind: EscapeHandleKind,
    pub boundary: EscapeBoundary,
    pub from_static: bool,
    pub has_drop: bool,
    pub abi_pack_required: bool,
    pub ffi_pack_required: bool,
    pub materialize_count: u32,
    pub span: Span,
}

#[derive(Debug, Default)]
pub struct CanonicalizeStats {
    pub rewritten_values: u32,
    pub rewritten_calls: u32,
}

#[derive(Debug, Default)]
pub struct SirModule {
    pub functions: Vec<SirFunction>,
    pub values: Vec<Value>,
    pub blocks: Vec<SirBlock>,
    pub stmts: Vec<SirStmt>,
    pub globals: Vec<SirGlobal>,
    pub fields: Vec<SirField>,
    pub escape_handles: Vec<EscapeHandleMeta>,
    pub canonicalize_stats: CanonicalizeStats,
    /// Symbol ids declared `static`, global or function-local. Populated by
    /// a pre-pass over the AST before lowering, since a local `static` gets
    /// no `SirGlobal` entry of its own.
    pub static_symbols: HashSet<u32>,
    /// Symbol ids declared `mut`, whether `static` or not.
    pub mutable_symbols: HashSet<u32>,
}

impl SirModule {
    pub fn value(&self, id: SirValueId) -> &Value {
        &self.values[id as usize]
    }

    pub fn block(&self, id: SirBlockId) -> &SirBlock {
        &self.blocks[id as usize]
    }

    pub fn stmt(&self, id: SirStmtId) -> &SirStmt {
        &self.stmts[id as usize]
    }
}

/// 64-bit FNV-1a, used to shorten mangled symbol names for non-C-ABI
/// functions (`bundle|path|name|mode|recv|sig`).
fn fnv1a_64(bytes: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    let mut hash = OFFSET_BASIS;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

fn mangle(bundle: &str, path: &str, name: &str, mode: &str, recv: &str, sig: &str) -> String {
    let key = format!("{bundle}|{path}|{name}|{mode}|{recv}|{sig}");
    format!("_P{:016x}", fnv1a_64(key.as_bytes()))
}

struct LoopCtx {
    break_type: Option<TypeId>,
}

pub struct SirBuilder<'a> {
    ast: &'a Ast,
    types: &'a mut TypePool,
    symbols: &'a SymbolTable,
    symbol_types: &'a HashMap<u32, TypeId>,
    fn_sigs: &'a HashMap<u32, TypeId>,
    diags: &'a mut DiagnosticsBag,
    module: SirModule,
    /// Maps a predeclared `Fn` symbol id to its index in `module.functions`,
    /// populated before any function body is lowered so forward/mutually
    /// recursive calls resolve to a direct callee.
    symbol_to_func: HashMap<u32, usize>,
    loop_stack: Vec<LoopCtx>,
    namespace_stack: Vec<String>,
}

impl<'a> SirBuilder<'a> {
    pub fn new(
        ast: &'a Ast,
        types: &'a mut TypePool,
        symbols: &'a SymbolTable,
        symbol_types: &'a HashMap<u32, TypeId>,
        fn_sigs: &'a HashMap<u32, TypeId>,
        diags: &'a mut DiagnosticsBag,
    ) -> Self {
        Self {
            ast,
            types,
            symbols,
            symbol_types,
            fn_sigs,
            diags,
            module: SirModule::default(),
            symbol_to_func: HashMap::new(),
            loop_stack: Vec::new(),
            namespace_stack: Vec::new(),
        }
    }

    pub fn build(mut self, root: StmtId) -> SirModule {
        self.collect_symbol_flags(root);
        self.predeclare_functions(root, &[]);
        self.lower_top_level(root);
        self.module
    }

    /// Walks every `VarDecl` in the tree (global or function-local) and
    /// records which symbols are `static`/`mut` in `module.static_symbols`/
    /// `module.mutable_symbols`, ahead of lowering. Mirrors the shape of
    /// [`Self::predeclare_functions`].
    fn collect_symbol_flags(&mut self, stmt: StmtId) {
        match &self.ast.stmt(stmt).kind {
            StmtKind::Block(stmts) => {
                let stmts = stmts.clone();
                for s in stmts {
                    self.collect_symbol_flags(s);
                }
            }
            StmtKind::VarDecl { is_static, is_mut, .. } => {
                if let Some(sym) = self.symbols.symbol_for_decl(stmt) {
                    if *is_static {
                        self.module.static_symbols.insert(sym);
                    }
                    if *is_mut {
                        self.module.mutable_symbols.insert(sym);
                    }
                }
            }
            StmtKind::If { then_branch, else_branch, .. } => {
                let then_branch = *then_branch;
                let else_branch = *else_branch;
                self.collect_symbol_flags(then_branch);
                if let Some(e) = else_branch {
                    self.collect_symbol_flags(e);
                }
            }
            StmtKind::While { body, .. }
            | StmtKind::DoScope { body }
            | StmtKind::DoWhile { body, .. }
            | StmtKind::Manual { body } => {
                let body = *body;
                self.collect_symbol_flags(body);
            }
            StmtKind::Switch { cases, .. } => {
                let cases = cases.clone();
                for case in &cases {
                    self.collect_symbol_flags(case.body);
                }
            }
            StmtKind::Fn { body, .. } => {
                let body = *body;
                self.collect_symbol_flags(body);
            }
            StmtKind::Acts { members, .. } => {
                let members = members.clone();
                for m in members {
                    self.collect_symbol_flags(m);
                }
            }
            StmtKind::Nest { body: NestBody::Block(b), .. } => {
                let b = *b;
                self.collect_symbol_flags(b);
            }
            _ => {}
        }
    }

    fn predeclare_functions(&mut self, stmt: StmtId, prefix: &[String]) {
        match &self.ast.stmt(stmt).kind {
            StmtKind::Block(stmts) => {
                for &s in stmts {
                    self.predeclare_functions(s, prefix);
                }
            }
            StmtKind::Fn { name, is_extern, abi_name, .. } => {
                let Some(sym) = self.symbols.symbol_for_decl(stmt) else { return };
                let sig = self.fn_sigs.get(&sym).copied().unwrap_or(ERROR_TYPE);
                let is_c_abi = *is_extern;
                let path = prefix.join("::");
                let mangled = if is_c_abi {
                    abi_name.clone().unwrap_or_else(|| name.clone())
                } else {
                    mangle("parus", &path, name, "fn", "", &self.types.display(sig, true))
                };
                let idx = self.module.functions.len();
                self.module.functions.push(SirFunction {
                    name: name.clone(),
                    mangled,
                    signature: sig,
                    abi: if is_c_abi { Abi::C } else { Abi::Default },
                    entry: 0,
                    params: Vec::new(),
                    is_pure: false,
                    is_comptime: false,
                    is_extern: is_c_abi,
                    acts_owner: None,
                });
                self.symbol_to_func.insert(sym, idx);
            }
            StmtKind::Acts { lane, name, members, .. } => {
                let nested_prefix: Vec<String> = if matches!(lane, ActsLane::Namespace) {
                    prefix.iter().cloned().chain(std::iter::once(name.clone())).collect()
                } else {
                    prefix.to_vec()
                };
                for &m in members {
                    self.predeclare_functions(m, &nested_prefix);
                }
            }
            StmtKind::Nest { name, body: NestBody::Block(b) } => {
                let nested_prefix: Vec<String> =
                    prefix.iter().cloned().chain(std::iter::once(name.clone())).collect();
                self.predeclare_functions(*b, &nested_prefix);
            }
            _ => {}
        }
    }

    fn lower_top_level(&mut self, stmt: StmtId) {
        match self.ast.stmt(stmt).kind.clone() {
            StmtKind::Block(stmts) => {
                for s in stmts {
                    self.lower_top_level(s);
                }
            }
            StmtKind::Fn { params, body, is_pure, is_comptime, .. } => {
                self.lower_function(stmt, &params, body, is_pure, is_comptime);
            }
            StmtKind::Field { name, members } => {
                let lowered = members
                    .iter()
                    .map(|m| SirFieldMember { name: m.name.clone(), ty: self.ast.type_node(m.ty).resolved })
                    .collect();
                self.module.fields.push(SirField { name, members: lowered });
            }
            StmtKind::Acts { lane, name, members, .. } => {
                if matches!(lane, ActsLane::Namespace) {
                    self.namespace_stack.push(name);
                }
                for m in members {
                    self.lower_top_level(m);
                }
                if matches!(lane, ActsLane::Namespace) {
                    self.namespace_stack.pop();
                }
            }
            StmtKind::Nest { name, body: NestBody::Block(b) } => {
                self.namespace_stack.push(name);
                self.lower_top_level(b);
                self.namespace_stack.pop();
            }
            StmtKind::VarDecl { is_static: true, .. } => {
                self.lower_static(stmt);
            }
            _ => {}
        }
    }

    fn lower_static(&mut self, stmt: StmtId) {
        let StmtKind::VarDecl { name, is_mut, init, .. } = self.ast.stmt(stmt).kind.clone() else { return };
        let Some(sym) = self.symbols.symbol_for_decl(stmt) else { return };
        let ty = self.symbol_types.get(&sym).copied().unwrap_or(ERROR_TYPE);
        let init_value = init.map(|e| {
            let v = self.lower_expr(e);
            self.coerce(v, ty)
        });
        self.module.globals.push(SirGlobal { symbol: sym, name, ty, is_mut, init: init_value });
    }

    fn lower_function(&mut self, stmt: StmtId, params: &[Param], body: StmtId, is_pure: bool, is_comptime: bool) {
        let Some(sym) = self.symbols.symbol_for_decl(stmt) else { return };
        let Some(&func_idx) = self.symbol_to_func.get(&sym) else { return };

        let sir_params: Vec<SirParam> = params
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let param_sym = self.symbols.symbol_for_param(stmt, i as ParamIndex).unwrap_or(u32::MAX);
                SirParam { symbol: param_sym, name: p.name.clone(), ty: self.ast.type_node(p.ty).resolved }
            })
            .collect();

        let entry = self.lower_block_stmt(body);

        let f = &mut self.module.functions[func_idx];
        f.params = sir_params;
        f.entry = entry;
        f.is_pure = is_pure;
        f.is_comptime = is_comptime;
    }

    fn push_block(&mut self) -> SirBlockId {
        let id = self.module.blocks.len() as SirBlockId;
        self.module.blocks.push(SirBlock::default());
        id
    }

    fn push_stmt(&mut self, block: SirBlockId, kind: SirStmtKind, span: Span) -> SirStmtId {
        let id = self.module.stmts.len() as SirStmtId;
        self.module.stmts.push(SirStmt { kind, span });
        self.module.blocks[block as usize].stmts.push(id);
        id
    }

    fn push_value(&mut self, kind: ValueKind, type_id: TypeId, place_class: PlaceClass, span: Span) -> SirValueId {
        let id = self.module.values.len() as SirValueId;
        self.module.values.push(Value {
            kind,
            type_id,
            place_class,
            effect: EffectClass::Pure,
            owning_symbol: None,
            origin_symbol: None,
            span,
        });
        id
    }

    /// Lowers a `Block(StmtId)` AST statement into a fresh SIR block.
    fn lower_block_stmt(&mut self, stmt: StmtId) -> SirBlockId {
        let block = self.push_block();
        if let StmtKind::Block(stmts) = self.ast.stmt(stmt).kind.clone() {
            for s in stmts {
                self.lower_stmt(block, s);
            }
        } else {
            self.lower_stmt(block, stmt);
        }
        block
    }

    fn lower_stmt(&mut self, block: SirBlockId, stmt: StmtId) {
        let span = self.ast.stmt_span(stmt);
        let kind = self.ast.stmt(stmt).kind.clone();
        match kind {
            StmtKind::Empty => {
                self.push_stmt(block, SirStmtKind::Empty, span);
            }
            StmtKind::ExprStmt(e) => {
                let v = self.lower_expr(e);
                self.push_stmt(block, SirStmtKind::ExprStmt(v), span);
            }
            StmtKind::VarDecl { is_set, is_mut, is_static, init, .. } => {
                let sym = self.symbols.symbol_for_decl(stmt).unwrap_or(u32::MAX);
                let declared_type = self.symbol_types.get(&sym).copied().unwrap_or(ERROR_TYPE);
                let init_value = init.map(|e| {
                    let v = self.lower_expr(e);
                    self.coerce(v, declared_type)
                });
                self.push_stmt(
                    block,
                    SirStmtKind::VarDecl { sym, is_set, is_mut, is_static, declared_type, init: init_value },
                    span,
                );
            }
            StmtKind::If { cond, then_branch, else_branch } => {
                let cond_v = self.lower_expr(cond);
                let then_block = self.lower_block_stmt(then_branch);
                let else_block = else_branch.map(|e| self.lower_block_stmt(e));
                self.push_stmt(block, SirStmtKind::If { cond: cond_v, then_block, else_block }, span);
            }
            StmtKind::While { cond, body } => {
                let cond_v = self.lower_expr(cond);
                let body_block = self.lower_block_stmt(body);
                self.push_stmt(block, SirStmtKind::While { cond: cond_v, body: body_block }, span);
            }
            StmtKind::DoScope { body } => {
                let body_block = self.lower_block_stmt(body);
                self.push_stmt(block, SirStmtKind::DoScope { body: body_block }, span);
            }
            StmtKind::DoWhile { body, cond } => {
                let body_block = self.lower_block_stmt(body);
                let cond_v = self.lower_expr(cond);
                self.push_stmt(block, SirStmtKind::DoWhile { body: body_block, cond: cond_v }, span);
            }
            StmtKind::Manual { body } => {
                let body_block = self.lower_block_stmt(body);
                self.push_stmt(block, SirStmtKind::Manual { body: body_block }, span);
            }
            StmtKind::Return(v) => {
                let val = v.map(|e| self.lower_expr(e));
                self.push_stmt(block, SirStmtKind::Return(val), span);
            }
            StmtKind::Break(v) => {
                let val = v.map(|e| self.lower_expr(e));
                if let (Some(ctx), Some(vid)) = (self.loop_stack.last_mut(), val) {
                    let ty = self.module.value(vid).type_id;
                    ctx.break_type = Some(ty);
                }
                self.push_stmt(block, SirStmtKind::Break(val), span);
            }
            StmtKind::Continue => {
                self.push_stmt(block, SirStmtKind::Continue, span);
            }
            StmtKind::Switch { scrutinee, cases } => {
                let scrutinee_v = self.lower_expr(scrutinee);
                let lowered_cases = cases
                    .iter()
                    .map(|c| SirSwitchCase {
                        is_default: c.is_default,
                        pattern: c.pattern.map(|p| self.lower_expr(p)),
                        body: self.lower_block_stmt(c.body),
                        span: c.span,
                    })
                    .collect();
                self.push_stmt(block, SirStmtKind::Switch { scrutinee: scrutinee_v, cases: lowered_cases }, span);
            }
            StmtKind::Error => {
                self.push_stmt(block, SirStmtKind::Error, span);
            }
            // Declarations and directives do not produce a statement in the
            // body they appear alongside; they are collected at the
            // top-level / predeclare passes instead.
            StmtKind::Fn { .. }
            | StmtKind::Field { .. }
            | StmtKind::Acts { .. }
            | StmtKind::Use(_)
            | StmtKind::Nest { .. }
            | StmtKind::MacroDecl { .. }
            | StmtKind::MacroCall { .. }
            | StmtKind::Block(_) => {}
        }
    }

    fn lower_expr(&mut self, id: ExprId) -> SirValueId {
        let span = self.ast.expr_span(id);
        let ty = self.ast.expr(id).ty;
        let kind = self.ast.expr(id).kind.clone();
        match kind {
            ExprKind::IntLit(v) => self.push_value(ValueKind::IntLit(v), ty, PlaceClass::NotPlace, span),
            ExprKind::FloatLit(v) => self.push_value(ValueKind::FloatLit(v), ty, PlaceClass::NotPlace, span),
            ExprKind::StringLit(s) => self.push_value(ValueKind::StringLit(s), ty, PlaceClass::NotPlace, span),
            ExprKind::CharLit(c) => self.push_value(ValueKind::CharLit(c), ty, PlaceClass::NotPlace, span),
            ExprKind::BoolLit(b) => self.push_value(ValueKind::BoolLit(b), ty, PlaceClass::NotPlace, span),
            ExprKind::NullLit => self.push_value(ValueKind::NullLit, ty, PlaceClass::NotPlace, span),
            ExprKind::Ident(_) => self.lower_ident(id, ty, span),
            ExprKind::ArrayLit(elems) => {
                let lowered: Vec<SirValueId> = elems.iter().map(|e| self.lower_expr(*e)).collect();
                self.push_value(ValueKind::ArrayLit { elems: lowered }, ty, PlaceClass::NotPlace, span)
            }
            ExprKind::Unary { op, operand } => self.lower_unary(op, operand, ty, span),
            ExprKind::Binary { op, lhs, rhs } => {
                let l = self.lower_expr(lhs);
                let r = self.lower_expr(rhs);
                self.push_value(ValueKind::Binary { op, lhs: l, rhs: r }, ty, PlaceClass::NotPlace, span)
            }
            ExprKind::Assign { target, value } => {
                let t = self.lower_expr(target);
                let v_raw = self.lower_expr(value);
                let target_ty = self.module.value(t).type_id;
                let v = self.coerce(v_raw, target_ty);
                self.push_value(ValueKind::Assign { target: t, value: v }, target_ty, PlaceClass::NotPlace, span)
            }
            ExprKind::PostfixInc { target } => {
                let t = self.lower_expr(target);
                self.push_value(ValueKind::PostfixInc { target: t }, ty, PlaceClass::NotPlace, span)
            }
            ExprKind::Call { callee, args } => self.lower_call(callee, args, ty, span),
            ExprKind::Index { base, index } => {
                let b = self.lower_expr(base);
                let i = self.lower_expr(index);
                self.push_value(ValueKind::Index { base: b, index: i }, ty, PlaceClass::Index, span)
            }
            ExprKind::Field { base, name } => {
                let b = self.lower_expr(base);
                self.push_value(ValueKind::Field { base: b, name }, ty, PlaceClass::Field, span)
            }
            ExprKind::Cast { kind: cast_kind, operand, target } => {
                let o = self.lower_expr(operand);
                let target_ty = self.ast.type_node(target).resolved;
                self.push_value(
                    ValueKind::Cast { kind: cast_kind, operand: o, target: target_ty },
                    target_ty,
                    PlaceClass::NotPlace,
                    span,
                )
            }
            ExprKind::If { cond, then_branch, else_branch } => {
                let cond_v = self.lower_expr(cond);
                let then_block = self.lower_block_stmt(then_branch);
                let else_block = else_branch.map(|e| self.lower_block_stmt(e));
                self.push_value(ValueKind::IfExpr { cond: cond_v, then_block, else_block }, ty, PlaceClass::NotPlace, span)
            }
            ExprKind::Block { stmts, tail } => {
                let block = self.push_block();
                if let StmtKind::Block(inner) = self.ast.stmt(stmts).kind.clone() {
                    for s in inner {
                        self.lower_stmt(block, s);
                    }
                }
                let tail_v = tail.map(|t| self.lower_expr(t));
                self.push_value(ValueKind::BlockExpr { block, tail: tail_v }, ty, PlaceClass::NotPlace, span)
            }
            ExprKind::Loop { iter, body } => {
                if let Some(i) = iter {
                    self.lower_expr(i);
                }
                self.loop_stack.push(LoopCtx { break_type: None });
                let body_block = self.lower_block_stmt(body);
                let ctx = self.loop_stack.pop().unwrap();
                self.push_value(ValueKind::LoopExpr { body: body_block, break_type: ctx.break_type }, ty, PlaceClass::NotPlace, span)
            }
            ExprKind::MacroCall { .. } | ExprKind::Error => {
                self.push_value(ValueKind::Error, ERROR_TYPE, PlaceClass::NotPlace, span)
            }
        }
    }

    fn lower_ident(&mut self, id: ExprId, ty: TypeId, span: Span) -> SirValueId {
        let resolved = self.symbols.resolved_for_expr(id).copied();
        let Some(resolved) = resolved else {
            return self.push_value(ValueKind::Error, ERROR_TYPE, PlaceClass::NotPlace, span);
        };
        let (kind, place_class) = match resolved.bind_kind {
            BindKind::Fn => (ValueKind::Global { symbol: resolved.symbol_id }, PlaceClass::NotPlace),
            BindKind::Param => (ValueKind::Param { symbol: resolved.symbol_id }, PlaceClass::Local),
            BindKind::LocalVar => (ValueKind::Local { symbol: resolved.symbol_id }, PlaceClass::Local),
            BindKind::Type => (ValueKind::Global { symbol: resolved.symbol_id }, PlaceClass::NotPlace),
        };
        let vid = self.push_value(kind, ty, place_class, span);
        self.module.values[vid as usize].owning_symbol = Some(resolved.symbol_id);
        self.module.values[vid as usize].origin_symbol = Some(resolved.symbol_id);
        vid
    }

    fn lower_unary(&mut self, op: UnaryOp, operand: ExprId, ty: TypeId, span: Span) -> SirValueId {
        let o = self.lower_expr(operand);
        match op {
            UnaryOp::Borrow { is_mut } => {
                let vid = self.push_value(ValueKind::Borrow { operand: o, is_mut }, ty, PlaceClass::NotPlace, span);
                self.module.values[vid as usize].origin_symbol = self.module.value(o).origin_symbol;
                vid
            }
            UnaryOp::Escape => {
                let vid = self.push_value(ValueKind::Escape { operand: o }, ty, PlaceClass::NotPlace, span);
                let origin = self.module.value(o).origin_symbol;
                self.module.values[vid as usize].origin_symbol = origin;
                self.register_escape_handle(vid, origin, ty, span);
                vid
            }
            _ => self.push_value(ValueKind::Unary { op, operand: o }, ty, PlaceClass::NotPlace, span),
        }
    }

    /// `kind`/`boundary` here are best-effort placeholders; capability
    /// analysis owns the authoritative boundary classification and may
    /// rewrite this entry via [`SirModule::escape_handles`] lookups keyed by
    /// `escape_value`.
    fn register_escape_handle(&mut self, escape_value: SirValueId, origin: Option<u32>, pointee_type: TypeId, span: Span) {
        let from_static = origin.is_some_and(|sym| self.module.static_symbols.contains(&sym));
        self.module.escape_handles.push(EscapeHandleMeta {
            escape_value,
            origin_sym: origin.unwrap_or(u32::MAX),
            pointee_type,
            kind: EscapeHandleKind::StackSlot,
            boundary: EscapeBoundary::None,
            from_static,
            has_drop: has_drop(self.types, pointee_type),
            abi_pack_required: false,
            ffi_pack_required: false,
            materialize_count: 0,
            span,
        });
    }

    fn lower_call(&mut self, callee: ExprId, args: Vec<Arg>, ty: TypeId, span: Span) -> SirValueId {
        let callee_v = self.lower_expr(callee);
        let direct_callee = self.resolve_direct_callee(callee);
        let sir_args: Vec<SirArg> = args
            .iter()
            .map(|a| match a {
                Arg::Positional(e) => SirArg::Positional(self.lower_expr(*e)),
                Arg::Labeled { label, value } => SirArg::Labeled { label: label.clone(), value: self.lower_expr(*value) },
                Arg::NamedGroup { entries } => SirArg::NamedGroup {
                    entries: entries.iter().map(|(l, v)| (l.clone(), self.lower_expr(*v))).collect(),
                },
            })
            .collect();
        self.push_value(ValueKind::Call { callee: callee_v, direct_callee, args: sir_args }, ty, PlaceClass::NotPlace, span)
    }

    /// Decl-id first (the callee expression resolves straight to a
    /// predeclared `Fn` symbol with exactly one overload), then by symbol id
    /// picking the sole remaining overload when arity is unambiguous; falls
    /// back to an indirect call (`None`) otherwise.
    fn resolve_direct_callee(&mut self, callee: ExprId) -> Option<usize> {
        let ExprKind::Ident(name) = &self.ast.expr(callee).kind else { return None };
        let resolved = self.symbols.resolved_for_expr(callee)?;
        if !matches!(resolved.bind_kind, BindKind::Fn) {
            return None;
        }
        if let Some(&idx) = self.symbol_to_func.get(&resolved.symbol_id) {
            return Some(idx);
        }
        let overloads = self.symbols.fn_overloads(name);
        if overloads.len() == 1 {
            return self.symbol_to_func.get(&overloads[0]).copied();
        }
        None
    }

    /// Optional coercion at assignment/call/return/field-init boundaries: a
    /// value typed `T` destined for `Optional(T)` gets wrapped; a `null`
    /// literal destined for `Optional(T)` keeps its `NullLit` shape but is
    /// retyped to the destination.
    fn coerce(&mut self, value: SirValueId, dest_ty: TypeId) -> SirValueId {
        let src_ty = self.module.value(value).type_id;
        if src_ty == dest_ty {
            return value;
        }
        let is_optional_dest = self.types.get(dest_ty).kind == crate::compiler::types::Kind::Optional;
        if !is_optional_dest {
            return value;
        }
        let elem = self.types.get(dest_ty).elem;
        let is_null = matches!(self.module.value(value).kind, ValueKind::NullLit);
        let span = self.module.value(value).span;
        if is_null {
            self.module.values[value as usize].type_id = dest_ty;
            return value;
        }
        if src_ty == elem {
            return self.push_value(
                ValueKind::Cast { kind: CastKind::As, operand: value, target: dest_ty },
                dest_ty,
                PlaceClass::NotPlace,
                span,
            );
        }
        value
    }
}

/// Conservative pointee-drop predicate: builtins/borrow/escape/ptr/fn never
/// need drop; `Optional`/`Array` recurse through their element; any
/// `NamedUser` is assumed to need drop.
fn has_drop(types: &TypePool, ty: TypeId) -> bool {
    use crate::compiler::types::Kind;
    let t = types.get(ty);
    match t.kind {
        Kind::Error | Kind::Builtin | Kind::Borrow | Kind::Escape | Kind::Ptr | Kind::Fn => false,
        Kind::Optional | Kind::Array => has_drop(types, t.elem),
        Kind::NamedUser => true,
    }
}

/// Rewrites values/calls into the single canonical shape capability
/// analysis expects: double-borrow wrappers collapse (`&(&x)` never arises
/// from the surface grammar, but macro-synthesized ASTs could produce one),
/// and single-entry named-group call args flatten to a plain labeled arg.
pub fn canonicalize_for_capability(module: &mut SirModule) -> CanonicalizeStats {
    let mut stats = CanonicalizeStats::default();
    for i in 0..module.values.len() {
        if let ValueKind::Call { args, .. } = &mut module.values[i].kind {
            for arg in args.iter_mut() {
                if let SirArg::NamedGroup { entries } = arg {
                    if entries.len() == 1 {
                        let (label, value) = entries.remove(0);
                        *arg = SirArg::Labeled { label, value };
                        stats.rewritten_calls += 1;
                    }
                }
            }
        }
    }
    module.canonicalize_stats = CanonicalizeStats {
        rewritten_values: stats.rewritten_values,
        rewritten_calls: stats.rewritten_calls,
    };
    stats
}

#[derive(Debug, Clone)]
pub struct SirVerifyError {
    pub message: String,
}

/// Checks the invariants enumerated for the SIR module: value ids in range,
/// declared types valid, borrow operands are places, every escape value has
/// a registered (unmaterialized) handle.
pub fn verify(module: &SirModule) -> Vec<SirVerifyError> {
    let mut errors = Vec::new();
    let value_in_range = |id: SirValueId| (id as usize) < module.values.len();

    for (i, v) in module.values.iter().enumerate() {
        match &v.kind {
            ValueKind::Borrow { operand, .. } => {
                if !value_in_range(*operand) {
                    errors.push(SirVerifyError { message: format!("value {i}: borrow operand out of range") });
                } else if module.value(*operand).place_class == PlaceClass::NotPlace {
                    errors.push(SirVerifyError { message: format!("value {i}: borrow operand is not a place") });
                }
            }
            ValueKind::Escape { operand } => {
                if !value_in_range(*operand) {
                    errors.push(SirVerifyError { message: format!("value {i}: escape operand out of range") });
                }
                let has_handle = module.escape_handles.iter().any(|h| h.escape_value as usize == i);
                if !has_handle {
                    errors.push(SirVerifyError { message: format!("value {i}: escape has no EscapeHandleMeta") });
                }
            }
            _ => {}
        }
    }

    for h in &module.escape_handles {
        if h.materialize_count != 0 {
            errors.push(SirVerifyError {
                message: format!("escape handle for value {}: materialize_count must be 0 before OIR", h.escape_value),
            });
        }
    }

    for f in &module.functions {
        if f.is_extern {
            continue;
        }
        if (f.entry as usize) >= module.blocks.len() && !module.blocks.is_empty() {
            errors.push(SirVerifyError { message: format!("function {}: entry block out of range", f.name) });
        }
    }

    errors
}

pub fn has_clean_verify(module: &SirModule, diags: &mut DiagnosticsBag, span: Span) -> bool {
    let errors = verify(module);
    for e in &errors {
        diags.error(DiagCode::SirEscapeMustNotMaterialize, span, vec![e.message.clone()]);
    }
    errors.is_empty()
}
