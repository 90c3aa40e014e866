//! Name resolution: predeclaration of namespace members followed by a
//! scoped walk that resolves every identifier expression to a symbol.

use crate::compiler::ast::*;
use crate::compiler::diagnostics::{DiagCode, DiagnosticsBag};
use crate::compiler::tokens::Span;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindKind {
    LocalVar,
    Param,
    Fn,
    Type,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShadowPolicy {
    Allow,
    Warn,
    Error,
}

#[derive(Debug, Clone, Copy)]
pub struct ResolvedSymbol {
    pub bind_kind: BindKind,
    pub symbol_id: u32,
    pub span: Span,
}

/// Output of the resolver: a span-stable lookup from name-bearing AST nodes
/// to the symbol they denote.
#[derive(Debug, Default)]
pub struct SymbolTable {
    by_expr: HashMap<ExprId, ResolvedSymbol>,
    by_decl_stmt: HashMap<StmtId, u32>,
    by_param: HashMap<(StmtId, ParamIndex), u32>,
    pub import_aliases: Vec<(String, Vec<String>)>,
    /// Every symbol id ever predeclared under a fully-qualified `Fn` name, in
    /// declaration order. A plain `ResolvedSymbol` only ever names one of
    /// these; overload disambiguation by arity/signature happens downstream
    /// (SIR direct-callee resolution) by consulting this list.
    fn_overloads: HashMap<String, Vec<u32>>,
}

impl SymbolTable {
    pub fn resolved_for_expr(&self, id: ExprId) -> Option<&ResolvedSymbol> {
        self.by_expr.get(&id)
    }

    pub fn symbol_for_decl(&self, stmt: StmtId) -> Option<u32> {
        self.by_decl_stmt.get(&stmt).copied()
    }

    pub fn symbol_for_param(&self, fn_stmt: StmtId, index: ParamIndex) -> Option<u32> {
        self.by_param.get(&(fn_stmt, index)).copied()
    }

    pub fn fn_overloads(&self, qualified_name: &str) -> &[u32] {
        self.fn_overloads.get(qualified_name).map(|v| v.as_slice()).unwrap_or(&[])
    }
}

#[derive(Debug, Clone, Copy)]
struct Binding {
    bind_kind: BindKind,
    symbol_id: u32,
}

pub struct Resolver<'a> {
    ast: &'a Ast,
    diags: &'a mut DiagnosticsBag,
    table: SymbolTable,
    scopes: Vec<HashMap<String, Binding>>,
    namespace_stack: Vec<String>,
    /// Fully-qualified `Fn`/`Field`/`Acts` names registered by the
    /// predeclaration walk, reachable regardless of textual order.
    globals: HashMap<String, Binding>,
    import_aliases: HashMap<String, Vec<String>>,
    next_symbol_id: u32,
    shadow_policy: ShadowPolicy,
}

impl<'a> Resolver<'a> {
    pub fn new(ast: &'a Ast, diags: &'a mut DiagnosticsBag, shadow_policy: ShadowPolicy) -> Self {
        Self {
            ast,
            diags,
            table: SymbolTable::default(),
            scopes: vec![HashMap::new()],
            namespace_stack: Vec::new(),
            globals: HashMap::new(),
            import_aliases: HashMap::new(),
            next_symbol_id: 0,
            shadow_policy,
        }
    }

    pub fn resolve_program(mut self, root: StmtId) -> SymbolTable {
        self.predeclare(root, &[]);
        self.walk_stmt(root);
        self.table.import_aliases = self.import_aliases.into_iter().collect();
        self.table
    }

    fn fresh_symbol(&mut self) -> u32 {
        let id = self.next_symbol_id;
        self.next_symbol_id += 1;
        id
    }

    fn qualify(prefix: &[String], name: &str) -> String {
        if prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}::{}", prefix.join("::"), name)
        }
    }

    /// Registers every `Fn`/`Field`/`Acts` (namespace lane) name reachable
    /// from `stmt`, fully qualified by enclosing `nest` namespaces, so that
    /// forward references resolve regardless of textual order.
    fn predeclare(&mut self, stmt: StmtId, prefix: &[String]) {
        match &self.ast.stmt(stmt).kind {
            StmtKind::Block(stmts) => {
                for &s in stmts {
                    self.predeclare(s, prefix);
                }
            }
            StmtKind::Fn { name, .. } => {
                let qualified = Self::qualify(prefix, name);
                let id = self.fresh_symbol();
                self.globals.insert(qualified.clone(), Binding { bind_kind: BindKind::Fn, symbol_id: id });
                self.table.fn_overloads.entry(qualified).or_default().push(id);
                self.table.by_decl_stmt.insert(stmt, id);
            }
            StmtKind::Field { name, .. } => {
                let qualified = Self::qualify(prefix, name);
                let id = self.fresh_symbol();
                self.globals.insert(qualified, Binding { bind_kind: BindKind::Type, symbol_id: id });
                self.table.by_decl_stmt.insert(stmt, id);
            }
            StmtKind::Acts { lane, name, members, .. } => {
                let id = self.fresh_symbol();
                self.table.by_decl_stmt.insert(stmt, id);
                if matches!(lane, ActsLane::Namespace) {
                    let acts_prefix: Vec<String> =
                        prefix.iter().cloned().chain(std::iter::once(name.clone())).collect();
                    for &m in members {
                        self.predeclare(m, &acts_prefix);
                    }
                } else {
                    for &m in members {
                        self.predeclare(m, prefix);
                    }
                }
            }
            StmtKind::Nest { name, body } => {
                let nested_prefix: Vec<String> =
                    prefix.iter().cloned().chain(std::iter::once(name.clone())).collect();
                if let NestBody::Block(b) = body {
                    self.predeclare(*b, &nested_prefix);
                }
            }
            StmtKind::VarDecl { is_static: true, name, .. } => {
                let qualified = Self::qualify(prefix, name);
                let id = self.fresh_symbol();
                self.globals.insert(qualified, Binding { bind_kind: BindKind::LocalVar, symbol_id: id });
                self.table.by_decl_stmt.insert(stmt, id);
            }
            _ => {}
        }
    }

    fn push_scope(&mut self) {
        self.scopes.push(HashMap::new());
    }

    fn pop_scope(&mut self) {
        self.scopes.pop();
    }

    fn declare(&mut self, name: &str, bind_kind: BindKind, span: Span) -> u32 {
        let scope = self.scopes.last().unwrap();
        if let Some(existing) = scope.get(name) {
            if matches!(bind_kind, BindKind::Fn) && matches!(existing.bind_kind, BindKind::Fn) {
                // overloading: function names may duplicate within a scope.
            } else {
                self.diags.error(DiagCode::DuplicateDecl, span, vec![name.to_string()]);
            }
        } else if let Some(_shadowed) = self.find_in_enclosing_scopes(name) {
            match self.shadow_policy {
                ShadowPolicy::Allow => {}
                ShadowPolicy::Warn => self.diags.warning(DiagCode::Shadowing, span, vec![name.to_string()]),
                ShadowPolicy::Error => {
                    self.diags.error(DiagCode::ShadowingNotAllowed, span, vec![name.to_string()])
                }
            }
        }
        let id = self.fresh_symbol();
        self.scopes.last_mut().unwrap().insert(name.to_string(), Binding { bind_kind, symbol_id: id });
        id
    }

    fn find_in_enclosing_scopes(&self, name: &str) -> Option<Binding> {
        self.scopes[..self.scopes.len().saturating_sub(1)]
            .iter()
            .rev()
            .find_map(|s| s.get(name).copied())
    }

    fn lookup_local(&self, name: &str) -> Option<Binding> {
        self.scopes.iter().rev().find_map(|s| s.get(name).copied())
    }

    /// Deferred: `T::acts(SetName)::member` paths are resolved by the type
    /// checker's acts-resolution stage, not here.
    fn is_deferred_acts_path(name: &str) -> bool {
        name.contains("::acts(")
    }

    fn resolve_ident(&mut self, name: &str, span: Span) -> Option<ResolvedSymbol> {
        if Self::is_deferred_acts_path(name) {
            return None;
        }

        let (head, rest) = match name.split_once("::") {
            Some((h, r)) => (h, Some(r)),
            None => (name, None),
        };
        let rewritten = if let Some(target) = self.import_aliases.get(head) {
            let mut path = target.clone();
            if let Some(r) = rest {
                path.push(r.to_string());
            }
            Some(path.join("::"))
        } else {
            None
        };
        let lookup_name = rewritten.as_deref().unwrap_or(name);

        if let Some(b) = self.lookup_local(lookup_name) {
            return Some(ResolvedSymbol { bind_kind: b.bind_kind, symbol_id: b.symbol_id, span });
        }
        if let Some(b) = self.globals.get(lookup_name) {
            return Some(ResolvedSymbol { bind_kind: b.bind_kind, symbol_id: b.symbol_id, span });
        }

        if !lookup_name.contains("::") {
            for depth in (0..self.namespace_stack.len()).rev() {
                let prefix = self.namespace_stack[..=depth].join("::");
                let candidate = format!("{prefix}::{lookup_name}");
                if let Some(b) = self.globals.get(&candidate) {
                    return Some(ResolvedSymbol { bind_kind: b.bind_kind, symbol_id: b.symbol_id, span });
                }
            }
        }

        self.diags.error(DiagCode::UndefinedName, span, vec![name.to_string()]);
        None
    }

    fn walk_stmt(&mut self, id: StmtId) {
        let kind = self.ast.stmt(id).kind.clone();
        match kind {
            StmtKind::Block(stmts) => {
                self.push_scope();
                for s in stmts {
                    self.walk_stmt(s);
                }
                self.pop_scope();
            }
            StmtKind::VarDecl { name, init, is_static, .. } => {
                if let Some(e) = init {
                    self.walk_expr(e);
                }
                // `static` declarations are already registered by the
                // predeclaration walk; only locals get declared here.
                if !is_static {
                    let sym = self.declare(&name, BindKind::LocalVar, self.ast.stmt_span(id));
                    self.table.by_decl_stmt.insert(id, sym);
                }
            }
            StmtKind::If { cond, then_branch, else_branch } => {
                self.walk_expr(cond);
                self.walk_stmt(then_branch);
                if let Some(e) = else_branch {
                    self.walk_stmt(e);
                }
            }
            StmtKind::While { cond, body } => {
                self.push_scope();
                self.walk_expr(cond);
                self.walk_stmt(body);
                self.pop_scope();
            }
            StmtKind::DoScope { body } | StmtKind::Manual { body } => {
                self.walk_stmt(body);
            }
            StmtKind::DoWhile { body, cond } => {
                self.walk_stmt(body);
                self.walk_expr(cond);
            }
            StmtKind::Return(v) | StmtKind::Break(v) => {
                if let Some(e) = v {
                    self.walk_expr(e);
                }
            }
            StmtKind::Continue | StmtKind::Empty | StmtKind::Error => {}
            StmtKind::ExprStmt(e) => self.walk_expr(e),
            StmtKind::Switch { scrutinee, cases } => {
                self.walk_expr(scrutinee);
                for case in cases {
                    self.push_scope();
                    if let Some(p) = case.pattern {
                        self.walk_expr(p);
                    }
                    self.walk_stmt(case.body);
                    self.pop_scope();
                }
            }
            StmtKind::Fn { params, body, .. } => {
                self.push_scope();
                for (i, p) in params.iter().enumerate() {
                    if let Some(d) = p.default {
                        self.walk_expr(d);
                    }
                    let sym = self.declare(&p.name, BindKind::Param, p.span);
                    self.table.by_param.insert((id, i as ParamIndex), sym);
                }
                self.walk_stmt(body);
                self.pop_scope();
            }
            StmtKind::Field { .. } => {}
            StmtKind::Acts { lane, name, members, .. } => {
                if matches!(lane, ActsLane::Namespace) {
                    self.namespace_stack.push(name);
                }
                self.push_scope();
                for m in members {
                    self.walk_stmt(m);
                }
                self.pop_scope();
                if matches!(lane, ActsLane::Namespace) {
                    self.namespace_stack.pop();
                }
            }
            StmtKind::Use(decl) => {
                if let UseDecl::Import { path, alias } = decl {
                    if let Some(a) = alias {
                        self.import_aliases.insert(a, path);
                    }
                }
            }
            StmtKind::Nest { name, body } => {
                self.namespace_stack.push(name);
                if let NestBody::Block(b) = body {
                    self.walk_stmt(b);
                }
                self.namespace_stack.pop();
            }
            StmtKind::MacroDecl { .. } => {}
            // Expanded (and re-parsed in place) before resolution runs; a
            // node still in this shape here means expansion failed and
            // already reported a diagnostic.
            StmtKind::MacroCall { .. } => {}
        }
    }

    fn walk_expr(&mut self, id: ExprId) {
        let kind = self.ast.expr(id).kind.clone();
        match kind {
            ExprKind::Ident(name) => {
                if let Some(resolved) = self.resolve_ident(&name, self.ast.expr_span(id)) {
                    self.table.by_expr.insert(id, resolved);
                }
            }
            ExprKind::Unary { operand, .. } | ExprKind::PostfixInc { target: operand } => {
                self.walk_expr(operand);
            }
            ExprKind::Binary { lhs, rhs, .. } => {
                self.walk_expr(lhs);
                self.walk_expr(rhs);
            }
            ExprKind::Assign { target, value } => {
                self.walk_expr(target);
                self.walk_expr(value);
            }
            ExprKind::Call { callee, args } => {
                self.walk_expr(callee);
                for a in args {
                    match a {
                        Arg::Positional(e) | Arg::Labeled { value: e, .. } => self.walk_expr(e),
                        Arg::NamedGroup { entries } => {
                            for (_, e) in entries {
                                self.walk_expr(e);
                            }
                        }
                    }
                }
            }
            ExprKind::Index { base, index } => {
                self.walk_expr(base);
                self.walk_expr(index);
            }
            ExprKind::Field { base, .. } => self.walk_expr(base),
            ExprKind::Cast { operand, .. } => self.walk_expr(operand),
            ExprKind::ArrayLit(elems) => {
                for e in elems {
                    self.walk_expr(e);
                }
            }
            ExprKind::If { cond, then_branch, else_branch } => {
                self.walk_expr(cond);
                self.walk_stmt(then_branch);
                if let Some(e) = else_branch {
                    self.walk_stmt(e);
                }
            }
            ExprKind::Block { stmts, tail } => {
                self.walk_stmt(stmts);
                if let Some(t) = tail {
                    self.walk_expr(t);
                }
            }
            ExprKind::Loop { iter, body } => {
                if let Some(i) = iter {
                    self.walk_expr(i);
                }
                self.walk_stmt(body);
            }
            ExprKind::IntLit(_)
            | ExprKind::FloatLit(_)
            | ExprKind::StringLit(_)
            | ExprKind::CharLit(_)
            | ExprKind::BoolLit(_)
            | ExprKind::NullLit
            | ExprKind::MacroCall { .. }
            | ExprKind::Error => {}
        }
    }
}
