//! Type checker: writes resolved types back onto the AST and enforces the
//! deferred-integer, assignability, and borrow/escape-context rules.

use crate::compiler::ast::*;
use crate::compiler::diagnostics::{DiagCode, DiagnosticsBag};
use crate::compiler::resolve::{BindKind, SymbolTable};
use crate::compiler::tokens::Span;
use crate::compiler::types::{Builtin, TypeId, TypePool, ERROR_TYPE};
use std::collections::HashMap;

/// Tracks a `set x = <int literal>;` binding whose type is still the
/// `InferInteger` placeholder, resolved at first consumption or defaulted to
/// the smallest signed type the literal fits when nothing ever consumes it.
#[derive(Debug, Clone, Copy)]
struct PendingInt {
    literal_value: i128,
    resolved_type: Option<TypeId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopKind {
    /// `loop { }` expression: `break <value>` is legal and contributes to
    /// the loop's result type.
    Expr,
    /// `while`/`do-while` statement: `break` may not carry a value.
    Stmt,
}

struct LoopCtx {
    kind: LoopKind,
    break_types: Vec<TypeId>,
}

struct FnCtx {
    return_type: TypeId,
    is_pure: bool,
    is_comptime: bool,
}

pub struct TypeChecker<'a> {
    ast: &'a mut Ast,
    types: &'a mut TypePool,
    symbols: &'a SymbolTable,
    diags: &'a mut DiagnosticsBag,
    symbol_types: HashMap<u32, TypeId>,
    fn_sigs: HashMap<u32, TypeId>,
    field_members: HashMap<String, Vec<FieldMember>>,
    pending_int: HashMap<u32, PendingInt>,
    string_type: TypeId,
    loop_stack: Vec<LoopCtx>,
    fn_stack: Vec<FnCtx>,
}

impl<'a> TypeChecker<'a> {
    pub fn new(ast: &'a mut Ast, types: &'a mut TypePool, symbols: &'a SymbolTable, diags: &'a mut DiagnosticsBag) -> Self {
        let string_type = types.intern_ident("string");
        Self {
            ast,
            types,
            symbols,
            diags,
            symbol_types: HashMap::new(),
            fn_sigs: HashMap::new(),
            field_members: HashMap::new(),
            pending_int: HashMap::new(),
            string_type,
            loop_stack: Vec::new(),
            fn_stack: Vec::new(),
        }
    }

    pub fn check_program(&mut self, root: StmtId) {
        self.first_pass_collect_top_level(root);
        self.check_stmt(root);
        self.finalize_pending_ints();
    }

    /// Final declared type per symbol, post deferred-integer resolution.
    /// Consumed by the SIR builder when lowering `VarDecl` (the SIR field
    /// must carry the resolved declared type, not the raw init expression
    /// type).
    pub fn symbol_types(&self) -> &HashMap<u32, TypeId> {
        &self.symbol_types
    }

    pub fn fn_sigs(&self) -> &HashMap<u32, TypeId> {
        &self.fn_sigs
    }

    // ---- first pass: signatures visible regardless of textual order ----

    fn first_pass_collect_top_level(&mut self, stmt: StmtId) {
        let kind = self.ast.stmt(stmt).kind.clone();
        match kind {
            StmtKind::Block(stmts) => {
                for s in stmts {
                    self.first_pass_collect_top_level(s);
                }
            }
            StmtKind::Fn { params, ret, .. } => {
                let param_tys: Vec<TypeId> = params.iter().map(|p| self.resolve_type_node(p.ty)).collect();
                let labels: Vec<String> = params.iter().map(|p| p.label.clone().unwrap_or_default()).collect();
                let has_default: Vec<bool> = params.iter().map(|p| p.has_default).collect();
                let positional = params.iter().take_while(|p| p.label.is_none()).count() as u32;
                let ret_ty = ret.map(|t| self.resolve_type_node(t)).unwrap_or(self.types.builtin(Builtin::Unit));
                let sig = self.types.make_fn(ret_ty, &param_tys, Some(positional), &labels, &has_default);
                if let Some(sym) = self.symbols.symbol_for_decl(stmt) {
                    self.fn_sigs.insert(sym, sig);
                }
            }
            StmtKind::Field { name, members } => {
                self.field_members.insert(name.clone(), members);
            }
            StmtKind::Acts { members, .. } => {
                for m in members {
                    self.first_pass_collect_top_level(m);
                }
            }
            StmtKind::Nest { body: NestBody::Block(b), .. } => {
                self.first_pass_collect_top_level(b);
            }
            StmtKind::VarDecl { is_static: true, declared_ty: Some(ty), .. } => {
                let resolved = self.resolve_type_node(ty);
                if let Some(sym) = self.symbols.symbol_for_decl(stmt) {
                    self.symbol_types.insert(sym, resolved);
                }
            }
            _ => {}
        }
    }

    fn finalize_pending_ints(&mut self) {
        let unresolved: Vec<u32> = self
            .pending_int
            .iter()
            .filter(|(_, p)| p.resolved_type.is_none())
            .map(|(&sym, _)| sym)
            .collect();
        for sym in unresolved {
            if let Some(&ty) = self.symbol_types.get(&sym) {
                if self.types.get(ty).builtin == Builtin::InferInteger {
                    let value = self.pending_int.get(&sym).map(|p| p.literal_value).unwrap_or(0);
                    let default = self.types.builtin(self.smallest_signed_fit(value));
                    self.symbol_types.insert(sym, default);
                }
            }
        }
    }

    // ---- type node resolution ----

    fn resolve_type_node(&mut self, node: TypeNodeId) -> TypeId {
        let kind = self.ast.type_node(node).kind.clone();
        let id = match kind {
            TypeNodeKind::Named { path, args } => {
                if args.is_empty() {
                    self.types.intern_path(&path)
                } else {
                    let arg_ids: Vec<TypeId> = args.iter().map(|a| self.resolve_type_node(*a)).collect();
                    self.types.intern_named_path_with_args(&path, &arg_ids)
                }
            }
            TypeNodeKind::Optional(elem) => {
                let e = self.resolve_type_node(elem);
                self.types.make_optional(e)
            }
            TypeNodeKind::Array { elem, size } => {
                let e = self.resolve_type_node(elem);
                self.types.make_array(e, size.is_some(), size.unwrap_or(0))
            }
            TypeNodeKind::Borrow { elem, is_mut } => {
                let e = self.resolve_type_node(elem);
                self.types.make_borrow(e, is_mut)
            }
            TypeNodeKind::Escape(elem) => {
                let e = self.resolve_type_node(elem);
                self.types.make_escape(e)
            }
            TypeNodeKind::Ptr { elem, is_mut } => {
                let e = self.resolve_type_node(elem);
                self.types.make_ptr(e, is_mut)
            }
            TypeNodeKind::Fn { params, ret } => {
                let param_ids: Vec<TypeId> = params.iter().map(|p| self.resolve_type_node(*p)).collect();
                let ret_id = self.resolve_type_node(ret);
                self.types.make_fn(ret_id, &param_ids, None, &[], &[])
            }
            TypeNodeKind::MacroTokens { .. } => {
                // Macro expansion runs before type checking; any surviving
                // token-stream node means expansion failed upstream.
                ERROR_TYPE
            }
        };
        self.ast.type_node_mut(node).resolved = id;
        id
    }

    // ---- assignability / numeric helpers ----

    fn fits_builtin_int(&self, value: i128, b: Builtin) -> bool {
        match b {
            Builtin::I8 => i8::try_from(value).is_ok(),
            Builtin::I16 => i16::try_from(value).is_ok(),
            Builtin::I32 => i32::try_from(value).is_ok(),
            Builtin::I64 => i64::try_from(value).is_ok(),
            Builtin::I128 => true,
            Builtin::U8 => u8::try_from(value).is_ok(),
            Builtin::U16 => u16::try_from(value).is_ok(),
            Builtin::U32 => u32::try_from(value).is_ok(),
            Builtin::U64 => u64::try_from(value).is_ok(),
            Builtin::U128 => u128::try_from(value).is_ok(),
            Builtin::ISize => isize::try_from(value).is_ok(),
            Builtin::USize => usize::try_from(value).is_ok(),
            _ => false,
        }
    }

    fn smallest_signed_fit(&self, value: i128) -> Builtin {
        for b in [Builtin::I8, Builtin::I16, Builtin::I32, Builtin::I64, Builtin::I128] {
            if self.fits_builtin_int(value, b) {
                return b;
            }
        }
        Builtin::I128
    }

    fn is_integer_ty(&self, ty: TypeId) -> bool {
        self.types.get(ty).builtin.is_integer()
    }

    fn is_float_ty(&self, ty: TypeId) -> bool {
        self.types.get(ty).builtin.is_float()
    }

    fn is_infer_integer(&self, ty: TypeId) -> bool {
        self.types.get(ty).builtin == Builtin::InferInteger
    }

    fn is_optional(&self, ty: TypeId) -> bool {
        self.types.get(ty).kind == crate::compiler::types::Kind::Optional
    }

    fn is_null_literal_ty(&self, ty: TypeId) -> bool {
        self.types.get(ty).builtin == Builtin::Null
    }

    fn can_assign(&self, dst: TypeId, src: TypeId) -> bool {
        if dst == src {
            return true;
        }
        if self.is_null_literal_ty(src) && self.is_optional(dst) {
            return true;
        }
        if self.is_infer_integer(src) && self.is_integer_ty(dst) {
            return true;
        }
        false
    }

    fn is_place(&self, id: ExprId) -> bool {
        matches!(self.ast.expr(id).kind, ExprKind::Ident(_) | ExprKind::Index { .. } | ExprKind::Field { .. })
    }

    // ---- statements ----

    fn check_stmt(&mut self, id: StmtId) {
        let kind = self.ast.stmt(id).kind.clone();
        match kind {
            StmtKind::Block(stmts) => {
                for s in stmts {
                    self.check_stmt(s);
                }
            }
            StmtKind::ExprStmt(e) => {
                self.check_expr(e);
            }
            StmtKind::VarDecl { name, is_set, declared_ty, init, .. } => {
                self.check_var_decl(id, &name, is_set, declared_ty, init);
            }
            StmtKind::If { cond, then_branch, else_branch } => {
                let cond_ty = self.check_expr(cond);
                if cond_ty != self.types.builtin(Builtin::Bool) && cond_ty != ERROR_TYPE {
                    self.diags.error(DiagCode::TypeMismatch, self.ast.expr_span(cond), vec!["bool".into()]);
                }
                self.check_stmt(then_branch);
                if let Some(e) = else_branch {
                    self.check_stmt(e);
                }
            }
            StmtKind::While { cond, body } => {
                self.check_expr(cond);
                self.loop_stack.push(LoopCtx { kind: LoopKind::Stmt, break_types: Vec::new() });
                self.check_stmt(body);
                self.loop_stack.pop();
            }
            StmtKind::DoWhile { body, cond } => {
                self.loop_stack.push(LoopCtx { kind: LoopKind::Stmt, break_types: Vec::new() });
                self.check_stmt(body);
                self.loop_stack.pop();
                self.check_expr(cond);
            }
            StmtKind::DoScope { body } | StmtKind::Manual { body } => {
                self.check_stmt(body);
            }
            StmtKind::Return(v) => {
                let ret_ty = self.fn_stack.last().map(|f| f.return_type).unwrap_or(ERROR_TYPE);
                let span = v.map(|e| self.ast.expr_span(e)).unwrap_or(self.ast.stmt_span(id));
                let val_ty = v.map(|e| self.check_expr(e)).unwrap_or(self.types.builtin(Builtin::Unit));
                if !self.can_assign(ret_ty, val_ty) && val_ty != ERROR_TYPE {
                    self.diags.error(DiagCode::TypeMismatch, span, vec![self.types.display(ret_ty, false)]);
                }
            }
            StmtKind::Break(v) => {
                let span = self.ast.stmt_span(id);
                let val_ty = v.map(|e| self.check_expr(e));
                if let Some(ctx) = self.loop_stack.last_mut() {
                    match (ctx.kind, val_ty) {
                        (LoopKind::Expr, Some(t)) => ctx.break_types.push(t),
                        (LoopKind::Expr, None) => {}
                        (LoopKind::Stmt, Some(_)) => {
                            self.diags.error(DiagCode::TypeBreakValueOnlyInLoopExpr, span, vec![]);
                        }
                        (LoopKind::Stmt, None) => {}
                    }
                }
            }
            StmtKind::Continue | StmtKind::Empty | StmtKind::Error => {}
            StmtKind::Switch { scrutinee, cases } => {
                let scrutinee_ty = self.check_expr(scrutinee);
                for case in cases {
                    if let Some(p) = case.pattern {
                        let pat_ty = self.check_expr(p);
                        if !self.can_assign(scrutinee_ty, pat_ty) && pat_ty != ERROR_TYPE && scrutinee_ty != ERROR_TYPE
                        {
                            self.diags.error(DiagCode::TypeMismatch, self.ast.expr_span(p), vec![]);
                        }
                    }
                    self.check_stmt(case.body);
                }
            }
            StmtKind::Fn { params, ret, body, is_pure, is_comptime, .. } => {
                let ret_ty = ret.map(|t| self.resolve_type_node(t)).unwrap_or(self.types.builtin(Builtin::Unit));
                self.fn_stack.push(FnCtx { return_type: ret_ty, is_pure, is_comptime });
                for (i, p) in params.iter().enumerate() {
                    let pty = self.resolve_type_node(p.ty);
                    if let Some(sym) = self.symbols.symbol_for_param(id, i as ParamIndex) {
                        self.symbol_types.insert(sym, pty);
                    }
                    if let Some(d) = p.default {
                        let dty = self.check_expr(d);
                        if !self.can_assign(pty, dty) && dty != ERROR_TYPE {
                            self.diags.error(DiagCode::TypeMismatch, self.ast.expr_span(d), vec![]);
                        }
                    }
                }
                self.check_stmt(body);
                self.fn_stack.pop();
            }
            StmtKind::Field { .. } => {}
            StmtKind::Acts { members, .. } => {
                for m in members {
                    self.check_stmt(m);
                }
            }
            StmtKind::Use(_) => {}
            StmtKind::Nest { body, .. } => {
                if let NestBody::Block(b) = body {
                    self.check_stmt(b);
                }
            }
            StmtKind::MacroDecl { .. } => {}
            StmtKind::MacroCall { .. } => {}
        }
    }

    fn check_var_decl(
        &mut self,
        stmt: StmtId,
        name: &str,
        is_set: bool,
        declared_ty: Option<TypeNodeId>,
        init: Option<ExprId>,
    ) {
        let span = self.ast.stmt_span(stmt);
        let sym = self.symbols.symbol_for_decl(stmt);

        if is_set {
            let Some(init_id) = init else { return };
            if matches!(self.ast.expr(init_id).kind, ExprKind::NullLit) {
                self.diags.error(DiagCode::SetCannotInferFromNull, span, vec![name.to_string()]);
                if let Some(s) = sym {
                    self.symbol_types.insert(s, ERROR_TYPE);
                }
                return;
            }
            let init_ty = self.check_expr(init_id);
            if let Some(s) = sym {
                self.symbol_types.insert(s, init_ty);
                if self.is_infer_integer(init_ty) {
                    let literal_value = match self.ast.expr(init_id).kind {
                        ExprKind::IntLit(v) => v,
                        _ => 0,
                    };
                    self.pending_int.insert(s, PendingInt { literal_value, resolved_type: None });
                }
            }
        } else {
            let Some(declared) = declared_ty else { return };
            let declared_id = self.resolve_type_node(declared);
            if let Some(init_id) = init {
                let init_ty = self.check_expr(init_id);
                if !self.can_assign(declared_id, init_ty) && init_ty != ERROR_TYPE {
                    self.diags.error(
                        DiagCode::TypeLetInitMismatch,
                        self.ast.expr_span(init_id),
                        vec![self.types.display(declared_id, false)],
                    );
                }
                if self.is_infer_integer(init_ty) && matches!(self.ast.expr(init_id).kind, ExprKind::Ident(_)) {
                    if let Some(resolved) = self.symbols.resolved_for_expr(init_id) {
                        if matches!(resolved.bind_kind, BindKind::LocalVar) {
                            if let Some(p) = self.pending_int.get_mut(&resolved.symbol_id) {
                                p.resolved_type = Some(declared_id);
                            }
                        }
                    }
                }
            }
            if let Some(s) = sym {
                self.symbol_types.insert(s, declared_id);
            }
        }
    }

    // ---- expressions ----

    fn check_expr(&mut self, id: ExprId) -> TypeId {
        let kind = self.ast.expr(id).kind.clone();
        let span = self.ast.expr_span(id);
        let ty = match kind {
            ExprKind::IntLit(_) => self.types.builtin(Builtin::InferInteger),
            ExprKind::FloatLit(_) => self.types.builtin(Builtin::F64),
            ExprKind::StringLit(_) => self.string_type,
            ExprKind::CharLit(_) => self.types.builtin(Builtin::Char),
            ExprKind::BoolLit(_) => self.types.builtin(Builtin::Bool),
            ExprKind::NullLit => self.types.builtin(Builtin::Null),
            ExprKind::Ident(_) => self.check_ident(id, span),
            ExprKind::ArrayLit(elems) => {
                let mut elem_ty = ERROR_TYPE;
                for (i, e) in elems.iter().enumerate() {
                    let t = self.check_expr(*e);
                    if i == 0 {
                        elem_ty = t;
                    } else if !self.can_assign(elem_ty, t) && t != ERROR_TYPE {
                        self.diags.error(DiagCode::TypeMismatch, self.ast.expr_span(*e), vec![]);
                    }
                }
                self.types.make_array(elem_ty, false, 0)
            }
            ExprKind::Unary { op, operand } => self.check_unary(op, operand, span),
            ExprKind::Binary { op, lhs, rhs } => self.check_binary(op, lhs, rhs, span),
            ExprKind::Assign { target, value } => {
                if !self.is_place(target) {
                    self.diags.error(DiagCode::TypeMismatch, self.ast.expr_span(target), vec!["place".into()]);
                }
                let target_ty = self.check_expr(target);
                let value_ty = self.check_expr(value);
                if !self.can_assign(target_ty, value_ty) && value_ty != ERROR_TYPE && target_ty != ERROR_TYPE {
                    self.diags.error(DiagCode::TypeMismatch, span, vec![self.types.display(target_ty, false)]);
                }
                target_ty
            }
            ExprKind::PostfixInc { target } => self.check_expr(target),
            ExprKind::Call { callee, args } => self.check_call(callee, args, span),
            ExprKind::Index { base, index } => self.check_index(base, index, span),
            ExprKind::Field { base, name } => self.check_field(base, &name, span),
            ExprKind::Cast { operand, target, .. } => {
                self.check_expr(operand);
                self.resolve_type_node(target)
            }
            ExprKind::If { cond, then_branch, else_branch } => {
                let cond_ty = self.check_expr(cond);
                if cond_ty != self.types.builtin(Builtin::Bool) && cond_ty != ERROR_TYPE {
                    self.diags.error(DiagCode::TypeMismatch, self.ast.expr_span(cond), vec!["bool".into()]);
                }
                let then_ty = self.check_block_value(then_branch);
                let else_ty = else_branch.map(|e| self.check_block_value(e)).unwrap_or(ERROR_TYPE);
                if else_branch.is_some() && !self.can_assign(then_ty, else_ty) && then_ty != ERROR_TYPE && else_ty != ERROR_TYPE {
                    self.diags.error(DiagCode::TypeMismatch, span, vec![]);
                }
                then_ty
            }
            ExprKind::Block { stmts, tail } => {
                self.check_stmt(stmts);
                tail.map(|t| self.check_expr(t)).unwrap_or(self.types.builtin(Builtin::Unit))
            }
            ExprKind::Loop { iter, body } => {
                if let Some(i) = iter {
                    self.check_expr(i);
                }
                self.loop_stack.push(LoopCtx { kind: LoopKind::Expr, break_types: Vec::new() });
                self.check_stmt(body);
                let ctx = self.loop_stack.pop().unwrap();
                if ctx.break_types.is_empty() {
                    self.types.builtin(Builtin::Never)
                } else {
                    ctx.break_types[0]
                }
            }
            ExprKind::MacroCall { .. } => ERROR_TYPE,
            ExprKind::Error => ERROR_TYPE,
        };
        self.ast.expr_mut(id).ty = ty;
        ty
    }

    /// Evaluates a statement that is used in expression position (`if`/`do`
    /// branches): its "value" is the tail expression of its block, or Unit.
    fn check_block_value(&mut self, stmt: StmtId) -> TypeId {
        self.check_stmt(stmt);
        if let StmtKind::Block(stmts) = self.ast.stmt(stmt).kind.clone() {
            if let Some(&last) = stmts.last() {
                if let StmtKind::ExprStmt(e) = self.ast.stmt(last).kind.clone() {
                    return self.ast.expr(e).ty;
                }
            }
        }
        self.types.builtin(Builtin::Unit)
    }

    fn check_ident(&mut self, id: ExprId, span: Span) -> TypeId {
        let Some(resolved) = self.symbols.resolved_for_expr(id) else {
            return ERROR_TYPE;
        };
        match resolved.bind_kind {
            BindKind::Fn => self.fn_sigs.get(&resolved.symbol_id).copied().unwrap_or(ERROR_TYPE),
            BindKind::LocalVar | BindKind::Param | BindKind::Type => {
                if let Some(p) = self.pending_int.get(&resolved.symbol_id) {
                    if let Some(t) = p.resolved_type {
                        return t;
                    }
                }
                self.symbol_types.get(&resolved.symbol_id).copied().unwrap_or_else(|| {
                    self.diags.error(DiagCode::UndefinedName, span, vec![]);
                    ERROR_TYPE
                })
            }
        }
    }

    fn check_unary(&mut self, op: UnaryOp, operand: ExprId, span: Span) -> TypeId {
        match op {
            UnaryOp::Neg => {
                let t = self.check_expr(operand);
                if self.is_integer_ty(t) || self.is_float_ty(t) || self.is_infer_integer(t) || t == ERROR_TYPE {
                    t
                } else {
                    self.diags.error(DiagCode::TypeMismatch, span, vec!["numeric".into()]);
                    ERROR_TYPE
                }
            }
            UnaryOp::Not => {
                let t = self.check_expr(operand);
                if t != self.types.builtin(Builtin::Bool) && t != ERROR_TYPE {
                    self.diags.error(DiagCode::TypeMismatch, span, vec!["bool".into()]);
                }
                self.types.builtin(Builtin::Bool)
            }
            UnaryOp::BitNot => {
                let t = self.check_expr(operand);
                if !self.is_integer_ty(t) && !self.is_infer_integer(t) && t != ERROR_TYPE {
                    self.diags.error(DiagCode::TypeMismatch, span, vec!["integer".into()]);
                }
                t
            }
            UnaryOp::Borrow { is_mut } => {
                let t = self.check_expr(operand);
                self.reject_in_pure_comptime(DiagCode::TypeBorrowNotAllowedInPureComptime, span);
                if !self.is_place(operand) {
                    self.diags.error(DiagCode::BorrowOperandMustBePlace, span, vec![]);
                }
                self.types.make_borrow(t, is_mut)
            }
            UnaryOp::Escape => {
                let t = self.check_expr(operand);
                self.reject_in_pure_comptime(DiagCode::TypeEscapeNotAllowedInPureComptime, span);
                if !self.is_place(operand) {
                    self.diags.error(DiagCode::EscapeOperandMustBePlace, span, vec![]);
                }
                self.types.make_escape(t)
            }
        }
    }

    fn reject_in_pure_comptime(&mut self, code: DiagCode, span: Span) {
        if let Some(ctx) = self.fn_stack.last() {
            if ctx.is_pure || ctx.is_comptime {
                self.diags.error(code, span, vec![]);
            }
        }
    }

    fn check_binary(&mut self, op: BinOp, lhs: ExprId, rhs: ExprId, span: Span) -> TypeId {
        let lhs_ty = self.check_expr(lhs);
        let rhs_ty = self.check_expr(rhs);
        if lhs_ty == ERROR_TYPE || rhs_ty == ERROR_TYPE {
            return ERROR_TYPE;
        }

        match op {
            BinOp::And | BinOp::Or => {
                let b = self.types.builtin(Builtin::Bool);
                if lhs_ty != b || rhs_ty != b {
                    self.diags.error(DiagCode::TypeMismatch, span, vec!["bool".into()]);
                }
                b
            }
            BinOp::Eq | BinOp::Ne => {
                if self.is_null_literal_ty(lhs_ty) || self.is_null_literal_ty(rhs_ty) {
                    let other = if self.is_null_literal_ty(lhs_ty) { rhs_ty } else { lhs_ty };
                    if !self.is_optional(other) && !self.is_null_literal_ty(other) {
                        self.diags.error(DiagCode::TypeMismatch, span, vec!["optional".into()]);
                    }
                } else if !self.compatible_operands(lhs_ty, rhs_ty) {
                    self.diags.error(DiagCode::TypeMismatch, span, vec![]);
                }
                self.types.builtin(Builtin::Bool)
            }
            BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                if !self.compatible_operands(lhs_ty, rhs_ty) {
                    self.diags.error(DiagCode::TypeMismatch, span, vec![]);
                }
                self.types.builtin(Builtin::Bool)
            }
            BinOp::NullCoalesce => {
                if self.is_optional(lhs_ty) {
                    self.types.get(lhs_ty).elem
                } else {
                    lhs_ty
                }
            }
            BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod | BinOp::BitAnd | BinOp::BitOr
            | BinOp::BitXor | BinOp::Shl | BinOp::Shr => self.check_arithmetic(lhs_ty, rhs_ty, lhs, rhs, span),
        }
    }

    fn compatible_operands(&self, a: TypeId, b: TypeId) -> bool {
        a == b || (self.is_infer_integer(a) && self.is_integer_ty(b)) || (self.is_infer_integer(b) && self.is_integer_ty(a))
    }

    fn check_arithmetic(&mut self, lhs_ty: TypeId, rhs_ty: TypeId, lhs: ExprId, rhs: ExprId, span: Span) -> TypeId {
        if self.is_infer_integer(lhs_ty) && self.is_infer_integer(rhs_ty) {
            return lhs_ty;
        }
        if self.is_infer_integer(lhs_ty) && self.is_float_ty(rhs_ty) {
            self.diags.error(DiagCode::TypeMismatch, span, vec![]);
            return ERROR_TYPE;
        }
        if self.is_infer_integer(rhs_ty) && self.is_float_ty(lhs_ty) {
            self.diags.error(DiagCode::TypeMismatch, span, vec![]);
            return ERROR_TYPE;
        }
        if self.is_infer_integer(lhs_ty) && self.is_integer_ty(rhs_ty) {
            self.resolve_pending_for(lhs, rhs_ty);
            return rhs_ty;
        }
        if self.is_infer_integer(rhs_ty) && self.is_integer_ty(lhs_ty) {
            self.resolve_pending_for(rhs, lhs_ty);
            return lhs_ty;
        }
        if lhs_ty != rhs_ty {
            self.diags.error(DiagCode::TypeMismatch, span, vec![]);
            return ERROR_TYPE;
        }
        lhs_ty
    }

    fn resolve_pending_for(&mut self, expr: ExprId, resolved: TypeId) {
        if let ExprKind::Ident(_) = &self.ast.expr(expr).kind {
            if let Some(sym) = self.symbols.resolved_for_expr(expr) {
                if let Some(p) = self.pending_int.get_mut(&sym.symbol_id) {
                    p.resolved_type = Some(resolved);
                }
            }
        }
    }

    fn check_call(&mut self, callee: ExprId, args: Vec<Arg>, span: Span) -> TypeId {
        let callee_ty = self.check_expr(callee);
        let arg_tys: Vec<(Option<String>, TypeId, Span)> = args
            .iter()
            .flat_map(|a| match a {
                Arg::Positional(e) => vec![(None, self.check_expr(*e), self.ast.expr_span(*e))],
                Arg::Labeled { label, value } => vec![(Some(label.clone()), self.check_expr(*value), self.ast.expr_span(*value))],
                Arg::NamedGroup { entries } => entries
                    .iter()
                    .map(|(l, v)| (Some(l.clone()), self.check_expr(*v), self.ast.expr_span(*v)))
                    .collect(),
            })
            .collect();

        if !self.types.is_fn(callee_ty) {
            if callee_ty != ERROR_TYPE {
                self.diags.error(DiagCode::TypeMismatch, span, vec!["function".into()]);
            }
            return ERROR_TYPE;
        }

        let positional_count = self.types.fn_positional_count(callee_ty);
        for (i, (label, ty, arg_span)) in arg_tys.iter().enumerate() {
            let param_index = if label.is_none() {
                i as u32
            } else {
                let mut found = None;
                for p in positional_count..self.types.get(callee_ty).param_count {
                    if self.types.fn_param_label_at(callee_ty, p) == label.as_deref().unwrap_or("") {
                        found = Some(p);
                        break;
                    }
                }
                match found {
                    Some(p) => p,
                    None => continue,
                }
            };
            let param_ty = self.types.fn_param_at(callee_ty, param_index);
            if !self.can_assign(param_ty, *ty) && *ty != ERROR_TYPE {
                self.diags.error(DiagCode::TypeMismatch, *arg_span, vec![self.types.display(param_ty, false)]);
            }
        }

        self.types.get(callee_ty).ret
    }

    fn check_index(&mut self, base: ExprId, index: ExprId, span: Span) -> TypeId {
        let base_ty = self.check_expr(base);
        let index_ty = self.check_expr(index);
        if !self.is_integer_ty(index_ty) && !self.is_infer_integer(index_ty) && index_ty != ERROR_TYPE {
            self.diags.error(DiagCode::TypeMismatch, self.ast.expr_span(index), vec!["integer".into()]);
        }
        match self.types.get(base_ty).kind {
            crate::compiler::types::Kind::Array | crate::compiler::types::Kind::Ptr => self.types.get(base_ty).elem,
            _ if base_ty == ERROR_TYPE => ERROR_TYPE,
            _ => {
                self.diags.error(DiagCode::TypeMismatch, span, vec!["indexable".into()]);
                ERROR_TYPE
            }
        }
    }

    fn check_field(&mut self, base: ExprId, name: &str, span: Span) -> TypeId {
        let base_ty = self.check_expr(base);
        let Some((path, _args)) = self.types.decompose_named_user(base_ty) else {
            if base_ty != ERROR_TYPE {
                self.diags.error(DiagCode::TypeMismatch, span, vec!["struct".into()]);
            }
            return ERROR_TYPE;
        };
        let type_name = path.join("::");
        let Some(members) = self.field_members.get(&type_name) else {
            self.diags.error(DiagCode::TypeMismatch, span, vec![type_name]);
            return ERROR_TYPE;
        };
        let Some(member) = members.iter().find(|m| m.name == name).cloned() else {
            self.diags.error(DiagCode::TypeMismatch, span, vec![name.to_string()]);
            return ERROR_TYPE;
        };
        self.resolve_type_node(member.ty)
    }
}
