//! The AST arena.
//!
//! Expressions, statements, and type nodes live in append-only pools on
//! [`Ast`]; every cross-reference is a `u32` index into one of those pools
//! and no index is ever reused. Variable-length children (call arguments,
//! block statement lists, parameters, field members, switch cases, path
//! segments, macro token captures) live in side tables referenced by
//! `(begin, count)` slices, mirroring the type pool's interning side
//! vectors.
//!
//! Generic `(a, b, c)` child slots reinterpreted per `Kind` become named
//! fields on a proper tagged sum (`ExprKind`/`StmtKind`) here instead, which
//! is the idiomatic Rust shape for the same invariant (block exprs still
//! carry exactly a statement list plus an optional tail expression; loop
//! exprs still carry an optional iterator expression plus a body).

use crate::compiler::tokens::Span;
use crate::compiler::types::TypeId;
use serde::{Deserialize, Serialize};

pub type ExprId = u32;
pub type StmtId = u32;
pub type TypeNodeId = u32;
pub type ParamIndex = u32;

pub const INVALID_EXPR: ExprId = u32::MAX;
pub const INVALID_STMT: StmtId = u32::MAX;

// ---- type syntax (macro-expandable) ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TypeNodeKind {
    Named { path: Vec<String>, args: Vec<TypeNodeId> },
    Optional(TypeNodeId),
    Array { elem: TypeNodeId, size: Option<u32> },
    Borrow { elem: TypeNodeId, is_mut: bool },
    Escape(TypeNodeId),
    Ptr { elem: TypeNodeId, is_mut: bool },
    Fn { params: Vec<TypeNodeId>, ret: TypeNodeId },
    /// Raw token stream awaiting macro expansion before it can be parsed as
    /// a type (see `parse_type_full_for_macro`).
    MacroTokens { tokens: Vec<crate::compiler::tokens::Token> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeNode {
    pub kind: TypeNodeKind,
    pub span: Span,
    /// Filled in once the node has been resolved against the type pool.
    pub resolved: TypeId,
}

// ---- parameters, fields, call args ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub ty: TypeNodeId,
    pub has_default: bool,
    pub default: Option<ExprId>,
    pub label: Option<String>,
    pub span: Span,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldMember {
    pub name: String,
    pub ty: TypeNodeId,
    pub span: Span,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Arg {
    Positional(ExprId),
    Labeled { label: String, value: ExprId },
    /// Trailing named-group `{ label: value, ... }`. No argument may follow.
    NamedGroup { entries: Vec<(String, ExprId)> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    NullCoalesce,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Not,
    BitNot,
    Borrow { is_mut: bool },
    Escape,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CastKind {
    As,
    AsQ,
    AsBang,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchCase {
    pub is_default: bool,
    /// Literal pattern token lexeme (int/char/string/bool/null/ident), empty
    /// for `default`.
    pub pattern: Option<ExprId>,
    pub body: StmtId,
    pub span: Span,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ExprKind {
    IntLit(i128),
    FloatLit(f64),
    StringLit(String),
    CharLit(char),
    BoolLit(bool),
    NullLit,
    Ident(String),
    ArrayLit(Vec<ExprId>),
    Unary { op: UnaryOp, operand: ExprId },
    Binary { op: BinOp, lhs: ExprId, rhs: ExprId },
    Assign { target: ExprId, value: ExprId },
    PostfixInc { target: ExprId },
    Call { callee: ExprId, args: Vec<Arg> },
    Index { base: ExprId, index: ExprId },
    Field { base: ExprId, name: String },
    Cast { kind: CastKind, operand: ExprId, target: TypeNodeId },
    /// `if` as an expression: both arms required to be value-producing.
    If { cond: ExprId, then_branch: StmtId, else_branch: Option<StmtId> },
    /// `do { }` scope expression / block tail-value carrier. Holds the
    /// statement list plus an optional tail expression.
    Block { stmts: StmtId, tail: Option<ExprId> },
    /// `loop { }`. `iter` is unused by the current surface grammar (plain
    /// `loop { }` loops) but is retained on the data model for a future
    /// iterator-driven loop-expression.
    Loop { iter: Option<ExprId>, body: StmtId },
    /// `$name(...)` call site in expression position, still holding its raw
    /// argument tokens. Macro expansion rewrites this node's `kind` in place
    /// once it has matched an arm and re-parsed the substituted output.
    MacroCall { name: String, call_tokens: Vec<crate::compiler::tokens::Token> },
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
    /// Filled in by the type checker.
    pub ty: TypeId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum UseDecl {
    Import { path: Vec<String>, alias: Option<String> },
    TypeAlias { name: String, target: TypeNodeId },
    PathAlias { name: String, target: Vec<String> },
    TextSubst { name: String, tokens: Vec<crate::compiler::tokens::Token> },
    FfiFunc { sig: TypeNodeId, name: String },
    FfiStruct { name: String, fields: Vec<FieldMember> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NestBody {
    /// File-scoped `nest Name;` directive: the rest of the file belongs to
    /// the namespace.
    Directive,
    Block(StmtId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActsLane {
    /// `acts Name { ... }`: namespace function set exposed as `Name::member`.
    Namespace,
    /// `acts [Name] for T { ... }`: method/operator lane bindings not
    /// exposed as plain paths.
    ForType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StmtKind {
    Empty,
    ExprStmt(ExprId),
    VarDecl {
        name: String,
        is_set: bool,
        is_mut: bool,
        is_static: bool,
        declared_ty: Option<TypeNodeId>,
        init: Option<ExprId>,
    },
    If {
        cond: ExprId,
        then_branch: StmtId,
        else_branch: Option<StmtId>,
    },
    While {
        cond: ExprId,
        body: StmtId,
    },
    DoScope {
        body: StmtId,
    },
    DoWhile {
        body: StmtId,
        cond: ExprId,
    },
    Manual {
        body: StmtId,
    },
    Return(Option<ExprId>),
    Break(Option<ExprId>),
    Continue,
    Switch {
        scrutinee: ExprId,
        cases: Vec<SwitchCase>,
    },
    /// Block of statements: `[stmt_begin, stmt_count)` conceptually, carried
    /// here as an owned `Vec` of child statement ids.
    Block(Vec<StmtId>),
    Fn {
        name: String,
        params: Vec<Param>,
        ret: Option<TypeNodeId>,
        body: StmtId,
        is_pure: bool,
        is_comptime: bool,
        is_extern: bool,
        abi_name: Option<String>,
    },
    Field {
        name: String,
        members: Vec<FieldMember>,
    },
    Acts {
        lane: ActsLane,
        name: String,
        for_type: Option<TypeNodeId>,
        members: Vec<StmtId>,
    },
    Use(UseDecl),
    Nest {
        name: String,
        body: NestBody,
    },
    MacroDecl {
        name: String,
        groups: Vec<crate::compiler::macros::MacroGroup>,
    },
    /// `$name(...)` call site in statement position, still holding its raw
    /// argument tokens. See [`ExprKind::MacroCall`].
    MacroCall {
        name: String,
        call_tokens: Vec<crate::compiler::tokens::Token>,
    },
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stmt {
    pub kind: StmtKind,
    pub span: Span,
}

/// The append-only AST arena. `exprs`/`stmts`/`type_nodes` are indexed by
/// `ExprId`/`StmtId`/`TypeNodeId`.
#[derive(Debug, Default)]
pub struct Ast {
    exprs: Vec<Expr>,
    stmts: Vec<Stmt>,
    type_nodes: Vec<TypeNode>,
}

impl Ast {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_expr(&mut self, kind: ExprKind, span: Span) -> ExprId {
        let id = self.exprs.len() as ExprId;
        self.exprs.push(Expr { kind, span, ty: crate::compiler::types::INVALID_TYPE });
        id
    }

    pub fn add_stmt(&mut self, kind: StmtKind, span: Span) -> StmtId {
        let id = self.stmts.len() as StmtId;
        self.stmts.push(Stmt { kind, span });
        id
    }

    pub fn add_type_node(&mut self, kind: TypeNodeKind, span: Span) -> TypeNodeId {
        let id = self.type_nodes.len() as TypeNodeId;
        self.type_nodes.push(TypeNode { kind, span, resolved: crate::compiler::types::INVALID_TYPE });
        id
    }

    pub fn expr(&self, id: ExprId) -> &Expr {
        &self.exprs[id as usize]
    }

    pub fn expr_mut(&mut self, id: ExprId) -> &mut Expr {
        &mut self.exprs[id as usize]
    }

    pub fn stmt(&self, id: StmtId) -> &Stmt {
        &self.stmts[id as usize]
    }

    pub fn stmt_mut(&mut self, id: StmtId) -> &mut Stmt {
        &mut self.stmts[id as usize]
    }

    pub fn type_node(&self, id: TypeNodeId) -> &TypeNode {
        &self.type_nodes[id as usize]
    }

    pub fn type_node_mut(&mut self, id: TypeNodeId) -> &mut TypeNode {
        &mut self.type_nodes[id as usize]
    }

    pub fn expr_count(&self) -> usize {
        self.exprs.len()
    }

    pub fn stmt_count(&self) -> usize {
        self.stmts.len()
    }

    pub fn expr_span(&self, id: ExprId) -> Span {
        self.expr(id).span
    }

    pub fn stmt_span(&self, id: StmtId) -> Span {
        self.stmt(id).span
    }
}
