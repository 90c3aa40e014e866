//! Capability analysis: the borrow/escape dataflow pass that runs over SIR
//! before OIR lowering is allowed to proceed.
//!
//! This walks every function body tracking which places are currently
//! borrowed (shared or mutable) and which symbols have been moved out via
//! `^&`, merging at `if`/`switch` join points and iterating loop bodies to a
//! fixed point. Nothing here touches OIR; it only annotates `SirModule` and
//! reports diagnostics, same as every other stage.

use crate::compiler::diagnostics::{DiagCode, DiagnosticsBag};
use crate::compiler::sir::*;
use crate::compiler::tokens::Span;
use crate::compiler::types::{Kind, TypeId, TypePool};

const MAX_LOOP_ITERATIONS: u32 = 16;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Projection {
    Index(Option<i128>),
    Field(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PlaceRef {
    root: u32,
    projections: Vec<Projection>,
}

impl PlaceRef {
    /// Two places overlap if one is a prefix of the other's projection
    /// chain (so `x` overlaps `x.a` and `x.a.b`, but `x.a` and `x.b` do
    /// not). An `Index(None)` projection (unknown constant index) overlaps
    /// any other index projection on the same root, conservatively.
    fn overlaps(&self, other: &PlaceRef) -> bool {
        if self.root != other.root {
            return false;
        }
        let n = self.projections.len().min(other.projections.len());
        for i in 0..n {
            match (&self.projections[i], &other.projections[i]) {
                (Projection::Field(a), Projection::Field(b)) => {
                    if a != b {
                        return false;
                    }
                }
                (Projection::Index(a), Projection::Index(b)) => {
                    if let (Some(a), Some(b)) = (a, b) {
                        if a != b {
                            return false;
                        }
                    }
                }
                _ => return false,
            }
        }
        true
    }
}

#[derive(Debug, Clone)]
struct ActiveBorrow {
    place: PlaceRef,
    is_mut: bool,
    owner_value: SirValueId,
}

#[derive(Debug, Clone, Default)]
struct State {
    borrows: Vec<ActiveBorrow>,
    moved: std::collections::HashSet<u32>,
}

impl State {
    fn merge(a: &State, b: &State) -> State {
        let mut out = State::default();
        for ba in &a.borrows {
            let upgraded = b
                .borrows
                .iter()
                .any(|bb| bb.place.overlaps(&ba.place) && (bb.is_mut || ba.is_mut));
            out.borrows.push(ActiveBorrow { is_mut: ba.is_mut || upgraded, ..ba.clone() });
        }
        for bb in &b.borrows {
            if !out.borrows.iter().any(|o| o.place == bb.place) {
                out.borrows.push(bb.clone());
            }
        }
        out.moved = a.moved.union(&b.moved).cloned().collect();
        out
    }
}

pub struct CapabilityChecker<'a> {
    module: &'a mut SirModule,
    types: &'a TypePool,
    diags: &'a mut DiagnosticsBag,
    scope_stack: Vec<usize>,
}

impl<'a> CapabilityChecker<'a> {
    pub fn new(module: &'a mut SirModule, types: &'a TypePool, diags: &'a mut DiagnosticsBag) -> Self {
        Self { module, types, diags, scope_stack: Vec::new() }
    }

    pub fn run(mut self) {
        let fn_count = self.module.functions.len();
        for i in 0..fn_count {
            if self.module.functions[i].is_extern {
                continue;
            }
            let entry = self.module.functions[i].entry;
            let mut state = State::default();
            self.check_block(entry, &mut state);
        }
        self.finalize_escape_handles();
    }

    fn place_of(&self, value: SirValueId) -> Option<PlaceRef> {
        let v = self.module.value(value);
        match &v.kind {
            ValueKind::Local { symbol } | ValueKind::Param { symbol } | ValueKind::Global { symbol } => {
                Some(PlaceRef { root: *symbol, projections: Vec::new() })
            }
            ValueKind::Index { base, index } => {
                let mut p = self.place_of(*base)?;
                let const_index = match &self.module.value(*index).kind {
                    ValueKind::IntLit(n) => Some(*n),
                    _ => None,
                };
                p.projections.push(Projection::Index(const_index));
                Some(p)
            }
            ValueKind::Field { base, name } => {
                let mut p = self.place_of(*base)?;
                p.projections.push(Projection::Field(name.clone()));
                Some(p)
            }
            _ => None,
        }
    }

    fn push_scope(&mut self, state: &State) {
        self.scope_stack.push(state.borrows.len());
    }

    fn pop_scope(&mut self, state: &mut State) {
        if let Some(mark) = self.scope_stack.pop() {
            state.borrows.truncate(mark);
        }
    }

    fn check_block(&mut self, block: SirBlockId, state: &mut State) {
        self.push_scope(state);
        let stmts = self.module.block(block).stmts.clone();
        for stmt in stmts {
            self.check_stmt(stmt, state);
        }
        self.pop_scope(state);
    }

    fn check_stmt(&mut self, stmt: SirStmtId, state: &mut State) {
        let span = self.module.stmt(stmt).span;
        let kind = self.module.stmt(stmt).kind.clone();
        match kind {
            SirStmtKind::Empty | SirStmtKind::Continue | SirStmtKind::CommitStmt | SirStmtKind::RecastStmt | SirStmtKind::Error => {}
            SirStmtKind::ExprStmt(v) => self.check_value(v, state),
            SirStmtKind::VarDecl { init, .. } => {
                if let Some(v) = init {
                    self.check_value(v, state);
                }
            }
            SirStmtKind::If { cond, then_block, else_block } => {
                self.check_value(cond, state);
                let mut then_state = state.clone();
                self.check_block(then_block, &mut then_state);
                let merged = if let Some(eb) = else_block {
                    let mut else_state = state.clone();
                    self.check_block(eb, &mut else_state);
                    State::merge(&then_state, &else_state)
                } else {
                    State::merge(&then_state, state)
                };
                *state = merged;
            }
            SirStmtKind::While { cond, body } => {
                self.check_value(cond, state);
                self.fixed_point_loop(body, state);
            }
            SirStmtKind::DoWhile { body, cond } => {
                self.fixed_point_loop(body, state);
                self.check_value(cond, state);
            }
            SirStmtKind::DoScope { body } | SirStmtKind::Manual { body } => {
                self.check_block(body, state);
            }
            SirStmtKind::Return(v) => {
                if let Some(v) = v {
                    self.check_value_as_return(v, state, span);
                }
            }
            SirStmtKind::Break(v) => {
                if let Some(v) = v {
                    self.check_value(v, state);
                }
            }
            SirStmtKind::Switch { scrutinee, cases } => {
                self.check_value(scrutinee, state);
                let mut merged: Option<State> = None;
                for case in &cases {
                    if let Some(p) = case.pattern {
                        self.check_value(p, state);
                    }
                    let mut case_state = state.clone();
                    self.check_block(case.body, &mut case_state);
                    merged = Some(match merged {
                        Some(m) => State::merge(&m, &case_state),
                        None => case_state,
                    });
                }
                if let Some(m) = merged {
                    *state = m;
                }
            }
        }
    }

    fn fixed_point_loop(&mut self, body: SirBlockId, state: &mut State) {
        let mut iterations = 0;
        loop {
            let mut trial = state.clone();
            self.check_block(body, &mut trial);
            let converged = trial.moved == state.moved && trial.borrows.len() == state.borrows.len();
            *state = trial;
            iterations += 1;
            if converged || iterations >= MAX_LOOP_ITERATIONS {
                break;
            }
        }
    }

    fn check_value_as_return(&mut self, value: SirValueId, state: &mut State, span: Span) {
        self.check_value(value, state);
        match self.module.value(value).kind {
            ValueKind::Escape { .. } => self.classify_boundary(value, EscapeBoundary::Return, span),
            ValueKind::Borrow { .. } => {
                self.diags.error(DiagCode::BorrowEscapeFromReturn, span, vec![]);
            }
            _ => {}
        }
    }

    fn check_value(&mut self, value: SirValueId, state: &mut State) {
        let span = self.module.value(value).span;
        let kind = self.module.value(value).kind.clone();
        match kind {
            ValueKind::Borrow { operand, is_mut } => {
                self.check_value(operand, state);
                let Some(place) = self.place_of(operand) else {
                    self.diags.error(DiagCode::BorrowOperandMustBePlace, span, vec![]);
                    return;
                };
                if is_mut && !self.module.mutable_symbols.contains(&place.root) {
                    self.diags.error(DiagCode::BorrowMutRequiresMutablePlace, span, vec![]);
                }
                for existing in &state.borrows {
                    if !existing.place.overlaps(&place) {
                        continue;
                    }
                    if existing.is_mut && is_mut {
                        self.diags.error(DiagCode::BorrowMutConflict, span, vec![]);
                    } else if existing.is_mut && !is_mut {
                        self.diags.error(DiagCode::BorrowSharedConflictWithMut, span, vec![]);
                    } else if !existing.is_mut && is_mut {
                        self.diags.error(DiagCode::BorrowMutConflictWithShared, span, vec![]);
                    }
                }
                if state.moved.contains(&place.root) {
                    self.diags.error(DiagCode::BorrowOperandMustBeOwnedPlace, span, vec![]);
                }
                state.borrows.push(ActiveBorrow { place, is_mut, owner_value: value });
            }
            ValueKind::Escape { operand } => {
                self.check_value(operand, state);
                let Some(place) = self.place_of(operand) else {
                    self.diags.error(DiagCode::EscapeOperandMustBePlace, span, vec![]);
                    return;
                };
                if matches!(self.module.value(operand).kind, ValueKind::Borrow { .. }) {
                    self.diags.error(DiagCode::EscapeOperandMustNotBeBorrow, span, vec![]);
                }
                for existing in &state.borrows {
                    if existing.place.overlaps(&place) {
                        if existing.is_mut {
                            self.diags.error(DiagCode::EscapeWhileMutBorrowActive, span, vec![]);
                        } else {
                            self.diags.error(DiagCode::EscapeWhileBorrowActive, span, vec![]);
                        }
                    }
                }
                state.moved.insert(place.root);
            }
            ValueKind::Assign { target, value: v } => {
                self.check_value(v, state);
                self.check_value(target, state);
                if let Some(place) = self.place_of(target) {
                    if state.borrows.iter().any(|b| !b.is_mut && b.place.overlaps(&place)) {
                        self.diags.error(DiagCode::BorrowSharedWriteConflict, span, vec![]);
                    }
                    if self.module.static_symbols.contains(&place.root)
                        && matches!(self.module.value(v).kind, ValueKind::Borrow { .. })
                    {
                        self.diags.error(DiagCode::BorrowEscapeToStorage, span, vec![]);
                    }
                    state.moved.remove(&place.root);
                }
            }
            ValueKind::Unary { operand, .. } | ValueKind::PostfixInc { target: operand } => {
                self.check_value(operand, state);
            }
            ValueKind::Binary { lhs, rhs, .. } => {
                self.check_value(lhs, state);
                self.check_value(rhs, state);
            }
            ValueKind::Call { callee, args, .. } => {
                self.check_value(callee, state);
                for a in &args {
                    match a {
                        SirArg::Positional(v) => self.check_value(*v, state),
                        SirArg::Labeled { value, .. } => self.check_value(*value, state),
                        SirArg::NamedGroup { entries } => {
                            for (_, v) in entries {
                                self.check_value(*v, state);
                            }
                        }
                    }
                    if let SirArg::Positional(v) | SirArg::Labeled { value: v, .. } = a {
                        if matches!(self.module.value(*v).kind, ValueKind::Escape { .. }) {
                            self.classify_boundary(*v, EscapeBoundary::CallArg, span);
                        }
                    }
                }
            }
            ValueKind::Index { base, index } => {
                self.check_value(base, state);
                self.check_value(index, state);
            }
            ValueKind::Field { base, .. } => {
                self.check_value(base, state);
            }
            ValueKind::ArrayLit { elems } => {
                for e in elems {
                    self.check_value(e, state);
                }
            }
            ValueKind::FieldInit { fields } => {
                for (_, v) in fields {
                    self.check_value(v, state);
                }
            }
            ValueKind::Cast { operand, .. } => self.check_value(operand, state),
            ValueKind::IfExpr { cond, then_block, else_block } => {
                self.check_value(cond, state);
                let mut then_state = state.clone();
                self.check_block(then_block, &mut then_state);
                let merged = if let Some(eb) = else_block {
                    let mut else_state = state.clone();
                    self.check_block(eb, &mut else_state);
                    State::merge(&then_state, &else_state)
                } else {
                    State::merge(&then_state, state)
                };
                *state = merged;
            }
            ValueKind::BlockExpr { block, tail } => {
                self.check_block(block, state);
                if let Some(t) = tail {
                    self.check_value(t, state);
                }
            }
            ValueKind::LoopExpr { body, .. } => {
                self.fixed_point_loop(body, state);
            }
            ValueKind::Local { symbol } | ValueKind::Param { symbol } => {
                if state.moved.contains(&symbol) {
                    self.diags.error(DiagCode::SirUseAfterEscapeMove, span, vec![]);
                }
                let root = PlaceRef { root: symbol, projections: Vec::new() };
                if state.borrows.iter().any(|b| b.is_mut && b.place.overlaps(&root)) {
                    self.diags.error(DiagCode::BorrowMutDirectAccessConflict, span, vec![]);
                }
            }
            ValueKind::Global { symbol } => {
                if state.moved.contains(&symbol) {
                    self.diags.error(DiagCode::SirUseAfterEscapeMove, span, vec![]);
                }
            }
            ValueKind::IntLit(_)
            | ValueKind::FloatLit(_)
            | ValueKind::StringLit(_)
            | ValueKind::CharLit(_)
            | ValueKind::BoolLit(_)
            | ValueKind::NullLit
            | ValueKind::Error => {}
        }
    }

    fn classify_boundary(&mut self, escape_value: SirValueId, boundary: EscapeBoundary, _span: Span) {
        if let Some(h) = self.module.escape_handles.iter_mut().find(|h| h.escape_value == escape_value) {
            h.boundary = boundary;
            h.kind = match boundary {
                EscapeBoundary::Return | EscapeBoundary::CallArg => {
                    if h.from_static {
                        EscapeHandleKind::Trivial
                    } else {
                        EscapeHandleKind::CallerSlot
                    }
                }
                EscapeBoundary::Abi | EscapeBoundary::Ffi => EscapeHandleKind::HeapBox,
                EscapeBoundary::None => {
                    if h.from_static {
                        EscapeHandleKind::Trivial
                    } else {
                        EscapeHandleKind::StackSlot
                    }
                }
            };
        }
    }

    /// `&&place` is only legitimate when the use context classified it as
    /// `Return`/`CallArg` or its root is a `static` symbol. A handle that
    /// never got classified and isn't rooted in a static is an escape with
    /// no sanctioned boundary.
    fn finalize_escape_handles(&mut self) {
        for h in &mut self.module.escape_handles {
            if matches!(h.boundary, EscapeBoundary::None) {
                h.kind = if h.from_static { EscapeHandleKind::Trivial } else { EscapeHandleKind::StackSlot };
            }
        }
        let violations: Vec<Span> = self
            .module
            .escape_handles
            .iter()
            .filter(|h| matches!(h.boundary, EscapeBoundary::None) && !h.from_static)
            .map(|h| h.span)
            .collect();
        for span in violations {
            self.diags.error(DiagCode::SirEscapeBoundaryViolation, span, vec![]);
        }
    }
}

/// `T` needs an ABI/FFI pack wrapper if it is not a builtin scalar, pointer,
/// or borrow — same recursion as [`crate::compiler::sir::has_drop`] but
/// answering a different question (packing, not destruction).
pub fn needs_abi_pack(types: &TypePool, ty: TypeId) -> bool {
    let t = types.get(ty);
    matches!(t.kind, Kind::NamedUser | Kind::Array)
}

pub fn run_capability_analysis(module: &mut SirModule, types: &TypePool, diags: &mut DiagnosticsBag) -> bool {
    let error_count_before = diags.error_count();
    {
        let checker = CapabilityChecker::new(module, types, diags);
        checker.run();
    }
    for h in module.escape_handles.iter_mut() {
        h.abi_pack_required = matches!(h.boundary, EscapeBoundary::Abi) && needs_abi_pack(types, h.pointee_type);
        h.ffi_pack_required = matches!(h.boundary, EscapeBoundary::Ffi) && needs_abi_pack(types, h.pointee_type);
    }
    diags.error_count() == error_count_before
}
