//! OIR: an SSA-ish control-flow-graph IR. Lowering here flattens SIR's
//! nested blocks into basic blocks with explicit branch targets and
//! block-parameter lists (our stand-in for phi nodes), the shape an LLVM-IR
//! emitter wants directly.

use crate::compiler::diagnostics::{DiagCode, DiagnosticsBag};
use crate::compiler::sir::{self, Abi, SirBlockId, SirModule, SirStmtKind, SirValueId, ValueKind};
use crate::compiler::tokens::Span;
use crate::compiler::types::{Kind, TypeId, TypePool, ERROR_TYPE};
use std::collections::HashMap;

pub type OirValueId = u32;
pub type OirBlockId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    Pure,
    MayWrite,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct Value {
    pub type_id: TypeId,
    pub effect: Effect,
    pub def_a: i64,
    pub def_b: i64,
}

#[derive(Debug, Clone)]
pub enum Instruction {
    ConstInt(i128),
    ConstBool(bool),
    ConstNull,
    ConstText(String),
    Unary { op: crate::compiler::ast::UnaryOp, operand: OirValueId },
    BinOp { op: crate::compiler::ast::BinOp, lhs: OirValueId, rhs: OirValueId },
    Cast { operand: OirValueId, from: TypeId, to: TypeId },
    FuncRef { func: usize },
    GlobalRef { symbol: u32 },
    Call { callee: OirValueId, direct_callee: Option<usize>, args: Vec<OirValueId> },
    Index { base: OirValueId, index: OirValueId },
    Field { base: OirValueId, offset: u32 },
    AllocaLocal { ty: TypeId },
    Load { addr: OirValueId, ty: TypeId },
    Store { addr: OirValueId, value: OirValueId },
}

#[derive(Debug, Clone)]
pub enum Terminator {
    Ret { value: Option<OirValueId> },
    Br { target: OirBlockId, args: Vec<OirValueId> },
    CondBr {
        cond: OirValueId,
        then_bb: OirBlockId,
        then_args: Vec<OirValueId>,
        else_bb: OirBlockId,
        else_args: Vec<OirValueId>,
    },
    Unreachable,
}

#[derive(Debug, Clone)]
pub struct BlockParam {
    pub value: OirValueId,
    pub ty: TypeId,
}

#[derive(Debug, Clone, Default)]
pub struct Block {
    pub params: Vec<BlockParam>,
    pub insts: Vec<(OirValueId, Instruction)>,
    pub term: Option<Terminator>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionFlags {
    pub is_pure: bool,
    pub is_comptime: bool,
    pub is_extern: bool,
}

#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    pub source_name: String,
    pub abi: Abi,
    pub flags: FunctionFlags,
    pub entry: OirBlockId,
    pub blocks: Vec<OirBlockId>,
    pub param_count: usize,
}

#[derive(Debug, Clone)]
pub struct GlobalEntry {
    pub symbol: u32,
    pub name: String,
    pub ty: TypeId,
    pub init: Option<OirValueId>,
}

#[derive(Debug, Clone)]
pub struct FieldLayout {
    pub name: String,
    pub member_offsets: Vec<(String, TypeId, u32)>,
    pub size: u32,
}

#[derive(Debug, Default)]
pub struct OirStats {
    pub blocks_emitted: u32,
    pub allocas_emitted: u32,
    pub direct_calls: u32,
    pub indirect_calls: u32,
}

#[derive(Debug, Default)]
pub struct OirModule {
    pub functions: Vec<Function>,
    pub values: Vec<Value>,
    pub blocks: Vec<Block>,
    pub globals: Vec<GlobalEntry>,
    pub fields: Vec<FieldLayout>,
    /// Constant-defining instructions for global initializers, which live
    /// outside any function's block list.
    pub global_insts: Vec<(OirValueId, Instruction)>,
    pub stats: OirStats,
}

impl OirModule {
    pub fn block(&self, id: OirBlockId) -> &Block {
        &self.blocks[id as usize]
    }

    pub fn value(&self, id: OirValueId) -> &Value {
        &self.values[id as usize]
    }
}

/// A scope-environment binding: either a direct SSA value (`is_slot =
/// false`) or an `alloca` address that must be loaded to read
/// (`is_slot = true`), matching the `mut`-vs-`let` distinction.
#[derive(Debug, Clone, Copy)]
struct Binding {
    is_slot: bool,
    value_id: OirValueId,
    ty: TypeId,
}

/// Continue/break targets for the loop currently being lowered. `break_slot`
/// is `Some` only for `loop { }` used as an expression, where `break <v>`
/// must feed a value into the join block's block-param.
#[derive(Debug, Clone, Copy)]
struct LoopTargets {
    continue_bb: OirBlockId,
    break_bb: OirBlockId,
    break_slot: Option<(OirValueId, TypeId)>,
}

pub struct OirBuilder<'a> {
    sir: &'a SirModule,
    types: &'a mut TypePool,
    diags: &'a mut DiagnosticsBag,
    out: OirModule,
    env: Vec<HashMap<u32, Binding>>,
    loop_stack: Vec<LoopTargets>,
    block_name_seq: u32,
}

impl<'a> OirBuilder<'a> {
    pub fn new(sir: &'a SirModule, types: &'a mut TypePool, diags: &'a mut DiagnosticsBag) -> Self {
        Self {
            sir,
            types,
            diags,
            out: OirModule::default(),
            env: Vec::new(),
            loop_stack: Vec::new(),
            block_name_seq: 0,
        }
    }

    pub fn build(mut self) -> OirModule {
        self.lower_fields();
        self.lower_globals();
        let fn_count = self.sir.functions.len();
        for i in 0..fn_count {
            self.lower_function(i);
        }
        self.out
    }

    fn lower_fields(&mut self) {
        for f in &self.sir.fields {
            let mut offset = 0u32;
            let mut offsets = Vec::new();
            for m in &f.members {
                offsets.push((m.name.clone(), m.ty, offset));
                offset += type_size(self.types, m.ty);
            }
            self.out.fields.push(FieldLayout { name: f.name.clone(), member_offsets: offsets, size: offset });
        }
    }

    fn lower_globals(&mut self) {
        for g in &self.sir.globals {
            let init = g.init.map(|v| self.const_value(v));
            self.out.globals.push(GlobalEntry { symbol: g.symbol, name: g.name.clone(), ty: g.ty, init });
        }
    }

    /// Globals only ever initialize from literal (comptime-evaluable) SIR
    /// values; this mirrors them one-for-one into OIR constants without a
    /// surrounding basic block.
    fn const_value(&mut self, v: SirValueId) -> OirValueId {
        let val = self.sir.value(v);
        let ty = val.type_id;
        match &val.kind {
            ValueKind::IntLit(n) => self.push_value_standalone(Instruction::ConstInt(*n), ty),
            ValueKind::FloatLit(_) => self.push_value_standalone(Instruction::ConstInt(0), ty),
            ValueKind::StringLit(s) => self.push_value_standalone(Instruction::ConstText(s.clone()), ty),
            ValueKind::BoolLit(b) => self.push_value_standalone(Instruction::ConstBool(*b), ty),
            ValueKind::NullLit => self.push_value_standalone(Instruction::ConstNull, ty),
            _ => self.push_value_standalone(Instruction::ConstNull, ty),
        }
    }

    fn push_value_standalone(&mut self, inst: Instruction, ty: TypeId) -> OirValueId {
        let id = self.out.values.len() as OirValueId;
        self.out.values.push(Value { type_id: ty, effect: Effect::Pure, def_a: -1, def_b: -1 });
        self.out.global_insts.push((id, inst));
        id
    }

    fn fresh_block(&mut self) -> OirBlockId {
        let id = self.out.blocks.len() as OirBlockId;
        self.out.blocks.push(Block::default());
        self.block_name_seq += 1;
        self.out.stats.blocks_emitted += 1;
        id
    }

    fn push_value(&mut self, block: OirBlockId, inst: Instruction, ty: TypeId, effect: Effect) -> OirValueId {
        let id = self.out.values.len() as OirValueId;
        self.out.values.push(Value { type_id: ty, effect, def_a: block as i64, def_b: -1 });
        self.out.blocks[block as usize].insts.push((id, inst));
        id
    }

    fn set_term(&mut self, block: OirBlockId, term: Terminator) {
        if self.out.blocks[block as usize].term.is_none() {
            self.out.blocks[block as usize].term = Some(term);
        }
    }

    fn push_scope(&mut self) {
        self.env.push(HashMap::new());
    }

    fn pop_scope(&mut self) {
        self.env.pop();
    }

    fn lookup(&self, symbol: u32) -> Option<Binding> {
        self.env.iter().rev().find_map(|s| s.get(&symbol).copied())
    }

    fn bind(&mut self, symbol: u32, binding: Binding) {
        self.env.last_mut().unwrap().insert(symbol, binding);
    }

    fn lower_function(&mut self, func_idx: usize) {
        let f = &self.sir.functions[func_idx];
        let flags = FunctionFlags { is_pure: f.is_pure, is_comptime: f.is_comptime, is_extern: f.is_extern };
        let name = f.mangled.clone();
        let source_name = f.name.clone();
        let abi = f.abi;
        let param_count = f.params.len();

        if f.is_extern {
            self.out.functions.push(Function {
                name,
                source_name,
                abi,
                flags,
                entry: 0,
                blocks: Vec::new(),
                param_count,
            });
            return;
        }

        self.push_scope();
        let entry = self.fresh_block();
        for p in &f.params.clone() {
            let pv = self.push_value(entry, Instruction::GlobalRef { symbol: p.symbol }, p.ty, Effect::Pure);
            self.bind(p.symbol, Binding { is_slot: false, value_id: pv, ty: p.ty });
        }

        let last = self.lower_sir_block(f.entry, entry);
        self.terminate_fallthrough_return(last);
        self.pop_scope();

        let mut blocks: Vec<OirBlockId> = (entry..self.out.blocks.len() as OirBlockId).collect();
        blocks.sort_unstable();
        self.out.functions.push(Function { name, source_name, abi, flags, entry, blocks, param_count });
    }

    fn terminate_fallthrough_return(&mut self, block: OirBlockId) {
        if self.out.blocks[block as usize].term.is_none() {
            self.set_term(block, Terminator::Ret { value: None });
        }
    }

    /// Lowers the statements of a SIR block directly into `cur`, returning
    /// the block id control flow actually falls through to afterward (new
    /// blocks are created for branches, so this is rarely `cur` itself once
    /// control flow is involved).
    fn lower_sir_block(&mut self, sir_block: SirBlockId, cur: OirBlockId) -> OirBlockId {
        self.push_scope();
        let mut cur = cur;
        let stmts = self.sir.block(sir_block).stmts.clone();
        for stmt in stmts {
            cur = self.lower_sir_stmt(stmt, cur);
        }
        self.pop_scope();
        cur
    }

    fn lower_sir_stmt(&mut self, stmt: sir::SirStmtId, cur: OirBlockId) -> OirBlockId {
        let kind = self.sir.stmt(stmt).kind.clone();
        match kind {
            SirStmtKind::Empty | SirStmtKind::CommitStmt | SirStmtKind::RecastStmt | SirStmtKind::Error => cur,
            SirStmtKind::ExprStmt(v) => {
                self.lower_value(v, cur);
                cur
            }
            SirStmtKind::VarDecl { sym, is_mut, declared_type, init, .. } => {
                let init_v = init.map(|v| self.lower_value(v, cur));
                if is_mut {
                    let slot = self.push_value(cur, Instruction::AllocaLocal { ty: declared_type }, declared_type, Effect::Pure);
                    self.out.stats.allocas_emitted += 1;
                    if let Some(iv) = init_v {
                        self.push_value(cur, Instruction::Store { addr: slot, value: iv }, declared_type, Effect::MayWrite);
                    }
                    self.bind(sym, Binding { is_slot: true, value_id: slot, ty: declared_type });
                } else {
                    let v = init_v.unwrap_or_else(|| self.push_value(cur, Instruction::ConstNull, declared_type, Effect::Pure));
                    self.bind(sym, Binding { is_slot: false, value_id: v, ty: declared_type });
                }
                cur
            }
            SirStmtKind::If { cond, then_block, else_block } => {
                let cond_v = self.lower_value(cond, cur);
                let then_bb = self.fresh_block();
                let join_bb = self.fresh_block();
                let then_end = self.lower_sir_block(then_block, then_bb);
                self.set_term(then_end, Terminator::Br { target: join_bb, args: Vec::new() });

                let else_bb = if else_block.is_some() { self.fresh_block() } else { join_bb };
                if let Some(eb) = else_block {
                    let else_end = self.lower_sir_block(eb, else_bb);
                    self.set_term(else_end, Terminator::Br { target: join_bb, args: Vec::new() });
                }
                self.set_term(
                    cur,
                    Terminator::CondBr { cond: cond_v, then_bb, then_args: Vec::new(), else_bb, else_args: Vec::new() },
                );
                join_bb
            }
            SirStmtKind::While { cond, body } => {
                let head_bb = self.fresh_block();
                let body_bb = self.fresh_block();
                let exit_bb = self.fresh_block();
                self.set_term(cur, Terminator::Br { target: head_bb, args: Vec::new() });

                let cond_v = self.lower_value(cond, head_bb);
                self.set_term(
                    head_bb,
                    Terminator::CondBr { cond: cond_v, then_bb: body_bb, then_args: Vec::new(), else_bb: exit_bb, else_args: Vec::new() },
                );
                self.loop_stack.push(LoopTargets { continue_bb: head_bb, break_bb: exit_bb, break_slot: None });
                let body_end = self.lower_sir_block(body, body_bb);
                self.loop_stack.pop();
                self.set_term(body_end, Terminator::Br { target: head_bb, args: Vec::new() });
                exit_bb
            }
            SirStmtKind::DoWhile { body, cond } => {
                let body_bb = self.fresh_block();
                let cond_bb = self.fresh_block();
                let exit_bb = self.fresh_block();
                self.set_term(cur, Terminator::Br { target: body_bb, args: Vec::new() });

                self.loop_stack.push(LoopTargets { continue_bb: cond_bb, break_bb: exit_bb, break_slot: None });
                let body_end = self.lower_sir_block(body, body_bb);
                self.loop_stack.pop();
                self.set_term(body_end, Terminator::Br { target: cond_bb, args: Vec::new() });

                let cond_v = self.lower_value(cond, cond_bb);
                self.set_term(
                    cond_bb,
                    Terminator::CondBr { cond: cond_v, then_bb: body_bb, then_args: Vec::new(), else_bb: exit_bb, else_args: Vec::new() },
                );
                exit_bb
            }
            SirStmtKind::DoScope { body } | SirStmtKind::Manual { body } => self.lower_sir_block(body, cur),
            SirStmtKind::Return(v) => {
                let value = v.map(|v| self.lower_value(v, cur));
                self.set_term(cur, Terminator::Ret { value });
                let dead = self.fresh_block();
                self.set_term(dead, Terminator::Unreachable);
                dead
            }
            SirStmtKind::Break(v) => {
                if let Some(targets) = self.loop_stack.last().copied() {
                    let args = match (v, targets.break_slot) {
                        (Some(val), Some(_)) => vec![self.lower_value(val, cur)],
                        _ => Vec::new(),
                    };
                    self.set_term(cur, Terminator::Br { target: targets.break_bb, args });
                }
                let dead = self.fresh_block();
                self.set_term(dead, Terminator::Unreachable);
                dead
            }
            SirStmtKind::Continue => {
                if let Some(targets) = self.loop_stack.last().copied() {
                    self.set_term(cur, Terminator::Br { target: targets.continue_bb, args: Vec::new() });
                }
                let dead = self.fresh_block();
                self.set_term(dead, Terminator::Unreachable);
                dead
            }
            SirStmtKind::Switch { scrutinee, cases } => {
                let scrutinee_v = self.lower_value(scrutinee, cur);
                let exit_bb = self.fresh_block();
                let mut dispatch = cur;
                for case in &cases {
                    let case_bb = self.fresh_block();
                    let case_end = self.lower_sir_block(case.body, case_bb);
                    self.set_term(case_end, Terminator::Br { target: exit_bb, args: Vec::new() });
                    if case.is_default {
                        self.set_term(dispatch, Terminator::Br { target: case_bb, args: Vec::new() });
                    } else if let Some(pattern) = case.pattern {
                        let pat_v = self.lower_value(pattern, dispatch);
                        let eq = self.push_value(
                            dispatch,
                            Instruction::BinOp { op: crate::compiler::ast::BinOp::Eq, lhs: scrutinee_v, rhs: pat_v },
                            self.types.builtin(crate::compiler::types::Builtin::Bool),
                            Effect::Pure,
                        );
                        let next_bb = self.fresh_block();
                        self.set_term(
                            dispatch,
                            Terminator::CondBr { cond: eq, then_bb: case_bb, then_args: Vec::new(), else_bb: next_bb, else_args: Vec::new() },
                        );
                        dispatch = next_bb;
                    }
                }
                self.set_term(dispatch, Terminator::Br { target: exit_bb, args: Vec::new() });
                exit_bb
            }
        }
    }

    fn lower_value(&mut self, value: SirValueId, block: OirBlockId) -> OirValueId {
        let val = self.sir.value(value);
        let ty = val.type_id;
        let kind = val.kind.clone();
        match kind {
            ValueKind::IntLit(n) => self.push_value(block, Instruction::ConstInt(n), ty, Effect::Pure),
            ValueKind::FloatLit(_) => self.push_value(block, Instruction::ConstInt(0), ty, Effect::Pure),
            ValueKind::StringLit(s) => self.push_value(block, Instruction::ConstText(s), ty, Effect::Pure),
            ValueKind::CharLit(c) => self.push_value(block, Instruction::ConstInt(c as i128), ty, Effect::Pure),
            ValueKind::BoolLit(b) => self.push_value(block, Instruction::ConstBool(b), ty, Effect::Pure),
            ValueKind::NullLit => self.push_value(block, Instruction::ConstNull, ty, Effect::Pure),
            ValueKind::Local { symbol } | ValueKind::Param { symbol } => {
                if let Some(b) = self.lookup(symbol) {
                    if b.is_slot {
                        self.push_value(block, Instruction::Load { addr: b.value_id, ty: b.ty }, b.ty, Effect::Pure)
                    } else {
                        b.value_id
                    }
                } else {
                    self.push_value(block, Instruction::ConstNull, ty, Effect::Unknown)
                }
            }
            ValueKind::Global { symbol } => self.push_value(block, Instruction::GlobalRef { symbol }, ty, Effect::Pure),
            ValueKind::ArrayLit { elems } => {
                for e in elems {
                    self.lower_value(e, block);
                }
                self.push_value(block, Instruction::ConstNull, ty, Effect::Pure)
            }
            ValueKind::FieldInit { fields } => {
                for (_, v) in fields {
                    self.lower_value(v, block);
                }
                self.push_value(block, Instruction::ConstNull, ty, Effect::Pure)
            }
            ValueKind::Borrow { operand, .. } => self.lower_address_of(operand, block, ty),
            ValueKind::Escape { operand } => self.lower_address_of(operand, block, ty),
            ValueKind::Unary { op, operand } => {
                let o = self.lower_value(operand, block);
                self.push_value(block, Instruction::Unary { op, operand: o }, ty, Effect::Pure)
            }
            ValueKind::Binary { op, lhs, rhs } => {
                let l = self.lower_value(lhs, block);
                let r = self.lower_value(rhs, block);
                self.push_value(block, Instruction::BinOp { op, lhs: l, rhs: r }, ty, Effect::Pure)
            }
            ValueKind::Assign { target, value } => {
                let v = self.lower_value(value, block);
                self.store_to_place(target, v, block);
                v
            }
            ValueKind::PostfixInc { target } => {
                let old = self.lower_value(target, block);
                let one = self.push_value(block, Instruction::ConstInt(1), ty, Effect::Pure);
                let incremented = self.push_value(
                    block,
                    Instruction::BinOp { op: crate::compiler::ast::BinOp::Add, lhs: old, rhs: one },
                    ty,
                    Effect::Pure,
                );
                self.store_to_place(target, incremented, block);
                old
            }
            ValueKind::Call { callee, direct_callee, args } => {
                let callee_v = self.lower_value(callee, block);
                let arg_vs: Vec<OirValueId> = args
                    .iter()
                    .flat_map(|a| match a {
                        sir::SirArg::Positional(v) => vec![*v],
                        sir::SirArg::Labeled { value, .. } => vec![*value],
                        sir::SirArg::NamedGroup { entries } => entries.iter().map(|(_, v)| *v).collect(),
                    })
                    .map(|v| self.lower_value(v, block))
                    .collect();
                if direct_callee.is_some() {
                    self.out.stats.direct_calls += 1;
                } else {
                    self.out.stats.indirect_calls += 1;
                }
                self.push_value(
                    block,
                    Instruction::Call { callee: callee_v, direct_callee, args: arg_vs },
                    ty,
                    Effect::Unknown,
                )
            }
            ValueKind::Index { base, index } => {
                let b = self.lower_value(base, block);
                let i = self.lower_value(index, block);
                self.push_value(block, Instruction::Index { base: b, index: i }, ty, Effect::Pure)
            }
            ValueKind::Field { base, name } => {
                let b = self.lower_value(base, block);
                let offset = self.field_offset(base, &name);
                self.push_value(block, Instruction::Field { base: b, offset }, ty, Effect::Pure)
            }
            ValueKind::Cast { operand, target, .. } => {
                let o = self.lower_value(operand, block);
                let from = self.sir.value(operand).type_id;
                self.push_value(block, Instruction::Cast { operand: o, from, to: target }, target, Effect::Pure)
            }
            ValueKind::IfExpr { cond, then_block, else_block } => {
                let cond_v = self.lower_value(cond, block);
                let then_bb = self.fresh_block();
                let join_bb = self.fresh_block();
                let param_ty = ty;
                let join_param = self.out.values.len() as OirValueId;
                self.out.values.push(Value { type_id: param_ty, effect: Effect::Pure, def_a: join_bb as i64, def_b: -1 });
                self.out.blocks[join_bb as usize].params.push(BlockParam { value: join_param, ty: param_ty });

                let then_end = self.lower_sir_block(then_block, then_bb);
                let then_tail = self.push_value(then_end, Instruction::ConstNull, param_ty, Effect::Pure);
                self.set_term(then_end, Terminator::Br { target: join_bb, args: vec![then_tail] });

                let else_bb = self.fresh_block();
                let else_tail = if let Some(eb) = else_block {
                    let else_end = self.lower_sir_block(eb, else_bb);
                    let tail = self.push_value(else_end, Instruction::ConstNull, param_ty, Effect::Pure);
                    self.set_term(else_end, Terminator::Br { target: join_bb, args: vec![tail] });
                    tail
                } else {
                    self.push_value(else_bb, Instruction::ConstNull, param_ty, Effect::Pure)
                };
                self.set_term(else_bb, Terminator::Br { target: join_bb, args: vec![else_tail] });
                self.set_term(
                    block,
                    Terminator::CondBr { cond: cond_v, then_bb, then_args: Vec::new(), else_bb, else_args: Vec::new() },
                );
                join_param
            }
            ValueKind::BlockExpr { block: sir_block, tail } => {
                let end = self.lower_sir_block(sir_block, block);
                if let Some(t) = tail {
                    self.lower_value(t, end)
                } else {
                    self.push_value(end, Instruction::ConstNull, ty, Effect::Pure)
                }
            }
            ValueKind::LoopExpr { body, .. } => {
                let head_bb = self.fresh_block();
                let exit_bb = self.fresh_block();
                self.set_term(block, Terminator::Br { target: head_bb, args: Vec::new() });

                let join_param = self.out.values.len() as OirValueId;
                self.out.values.push(Value { type_id: ty, effect: Effect::Pure, def_a: exit_bb as i64, def_b: -1 });
                self.out.blocks[exit_bb as usize].params.push(BlockParam { value: join_param, ty });

                self.loop_stack.push(LoopTargets {
                    continue_bb: head_bb,
                    break_bb: exit_bb,
                    break_slot: Some((join_param, ty)),
                });
                let body_end = self.lower_sir_block(body, head_bb);
                self.loop_stack.pop();
                self.set_term(body_end, Terminator::Br { target: head_bb, args: Vec::new() });
                join_param
            }
            ValueKind::Error => self.push_value(block, Instruction::ConstNull, ERROR_TYPE, Effect::Unknown),
        }
    }

    fn lower_address_of(&mut self, operand: SirValueId, block: OirBlockId, ty: TypeId) -> OirValueId {
        if let ValueKind::Local { symbol } | ValueKind::Param { symbol } = self.sir.value(operand).kind {
            if let Some(b) = self.lookup(symbol) {
                if b.is_slot {
                    return b.value_id;
                }
            }
        }
        let _ = ty;
        self.lower_value(operand, block)
    }

    fn store_to_place(&mut self, place: SirValueId, value: OirValueId, block: OirBlockId) {
        if let ValueKind::Local { symbol } | ValueKind::Param { symbol } = self.sir.value(place).kind {
            if let Some(b) = self.lookup(symbol) {
                if b.is_slot {
                    self.push_value(block, Instruction::Store { addr: b.value_id, value }, b.ty, Effect::MayWrite);
                    return;
                }
                self.bind(symbol, Binding { value_id: value, ..b });
                return;
            }
        }
        let addr = self.lower_value(place, block);
        let ty = self.sir.value(place).type_id;
        self.push_value(block, Instruction::Store { addr, value }, ty, Effect::MayWrite);
    }

    fn field_offset(&self, base: SirValueId, field_name: &str) -> u32 {
        let base_ty = self.sir.value(base).type_id;
        let Some((segs, _)) = self.types.decompose_named_user(base_ty) else { return 0 };
        let Some(field_name_root) = segs.last() else { return 0 };
        self.out
            .fields
            .iter()
            .find(|f| &f.name == field_name_root)
            .and_then(|f| f.member_offsets.iter().find(|(n, _, _)| n == field_name))
            .map(|(_, _, off)| *off)
            .unwrap_or(0)
    }
}

fn type_size(types: &TypePool, ty: TypeId) -> u32 {
    use crate::compiler::types::Builtin;
    let t = types.get(ty);
    match t.kind {
        Kind::Builtin => match t.builtin {
            Builtin::Unit | Builtin::Never => 0,
            Builtin::Bool | Builtin::I8 | Builtin::U8 => 1,
            Builtin::I16 | Builtin::U16 => 2,
            Builtin::I32 | Builtin::U32 | Builtin::F32 | Builtin::Char => 4,
            Builtin::I64 | Builtin::U64 | Builtin::F64 | Builtin::ISize | Builtin::USize | Builtin::Text => 8,
            Builtin::I128 | Builtin::U128 | Builtin::F128 => 16,
            Builtin::Null | Builtin::InferInteger => 8,
        },
        Kind::Borrow | Kind::Escape | Kind::Ptr | Kind::Fn => 8,
        Kind::Optional => type_size(types, t.elem) + 1,
        Kind::Array => {
            let elem = type_size(types, t.elem);
            if t.array_has_size {
                elem * t.array_size
            } else {
                16
            }
        }
        Kind::NamedUser | Kind::Error => 8,
    }
}

#[derive(Debug, Clone)]
pub struct OirVerifyError {
    pub message: String,
}

pub fn verify(module: &OirModule) -> Vec<OirVerifyError> {
    let mut errors = Vec::new();
    for f in &module.functions {
        if f.flags.is_extern {
            continue;
        }
        if module.blocks.is_empty() {
            errors.push(OirVerifyError { message: format!("function {}: no blocks", f.name) });
            continue;
        }
        for &bb in &f.blocks {
            let block = module.block(bb);
            if block.term.is_none() {
                errors.push(OirVerifyError { message: format!("function {}: block {} has no terminator", f.name, bb) });
            }
            if let Some(Terminator::Br { target, args }) = &block.term {
                let target_params = module.block(*target).params.len();
                if target_params != args.len() {
                    errors.push(OirVerifyError {
                        message: format!("function {}: branch to {} arg count mismatch", f.name, target),
                    });
                }
            }
            if let Some(Terminator::CondBr { then_bb, then_args, else_bb, else_args, .. }) = &block.term {
                if module.block(*then_bb).params.len() != then_args.len() {
                    errors.push(OirVerifyError { message: format!("function {}: then-branch arg count mismatch", f.name) });
                }
                if module.block(*else_bb).params.len() != else_args.len() {
                    errors.push(OirVerifyError { message: format!("function {}: else-branch arg count mismatch", f.name) });
                }
            }
        }
    }
    errors
}

pub fn has_clean_verify(module: &OirModule, diags: &mut DiagnosticsBag, span: Span) -> bool {
    let errors = verify(module);
    for e in &errors {
        diags.error(DiagCode::OirVerifyFailed, span, vec![e.message.clone()]);
    }
    errors.is_empty()
}
