//! Textual LLVM-IR emitter. Walks an [`OirModule`] and produces a `.ll`
//! module as a plain `String` — no `llvm-sys`/`inkwell` dependency, just
//! careful text generation, matching the rest of the pipeline's
//! never-fail-fast, always-produce-something philosophy (an emitted module
//! that fails to verify upstream still gets printed; it just carries the
//! diagnostics that explain why).

use crate::compiler::ast::{BinOp, UnaryOp};
use crate::compiler::oir::{Block, Instruction, OirModule, Terminator};
use crate::compiler::types::{Builtin, Kind, TypeId, TypePool};
use std::fmt::Write as _;

const CALL_STUB_NAME: &str = "parus_oir_call_stub";

pub struct Emitter<'a> {
    oir: &'a OirModule,
    types: &'a TypePool,
    out: String,
    tmp_seq: u32,
    call_stub_used: bool,
}

impl<'a> Emitter<'a> {
    pub fn new(oir: &'a OirModule, types: &'a TypePool) -> Self {
        Self { oir, types, out: String::new(), tmp_seq: 0, call_stub_used: false }
    }

    pub fn emit(mut self) -> String {
        for g in &self.oir.globals {
            self.emit_global(g);
        }
        for f in &self.oir.functions {
            self.emit_function(f);
        }
        if self.call_stub_used {
            let _ = writeln!(self.out, "declare void @{CALL_STUB_NAME}()");
        }
        self.out
    }

    fn emit_global(&mut self, g: &crate::compiler::oir::GlobalEntry) {
        let llty = llvm_type(self.types, g.ty);
        let init = g
            .init
            .and_then(|v| self.const_literal(v))
            .unwrap_or_else(|| zero_value(self.types, g.ty));
        let _ = writeln!(self.out, "@{} = global {} {}", sanitize_name(&g.name), llty, init);
    }

    fn const_literal(&self, id: crate::compiler::oir::OirValueId) -> Option<String> {
        self.oir.global_insts.iter().find(|(vid, _)| *vid == id).map(|(_, inst)| match inst {
            Instruction::ConstInt(n) => n.to_string(),
            Instruction::ConstBool(b) => if *b { "1".to_string() } else { "0".to_string() },
            Instruction::ConstText(s) => format!("c{:?}", s),
            Instruction::ConstNull => "zeroinitializer".to_string(),
            _ => "zeroinitializer".to_string(),
        })
    }

    fn emit_function(&mut self, f: &crate::compiler::oir::Function) {
        let name = sanitize_name(&f.name);
        if f.flags.is_extern {
            let ret_ty = "void";
            let _ = writeln!(self.out, "declare {} @{}(...)", ret_ty, name);
            return;
        }
        let ret_ty = "i64";
        let params: Vec<String> = (0..f.param_count).map(|i| format!("i64 %p{i}")).collect();
        let _ = writeln!(self.out, "define {} @{}({}) {{", ret_ty, name, params.join(", "));
        for &bb in &f.blocks {
            self.emit_block(bb);
        }
        let _ = writeln!(self.out, "}}");
    }

    fn emit_block(&mut self, bb_id: crate::compiler::oir::OirBlockId) {
        let block: &Block = self.oir.block(bb_id);
        let _ = writeln!(self.out, "bb{bb_id}:");
        if !block.params.is_empty() {
            for p in &block.params {
                let preds = self.predecessor_args(bb_id, p.value);
                let ty = llvm_type(self.types, p.ty);
                if preds.is_empty() {
                    let _ = writeln!(self.out, "  %v{} = {} undef", p.value, ty);
                } else {
                    let joined = preds
                        .iter()
                        .map(|(val, from)| format!("[ %v{val}, %bb{from} ]"))
                        .collect::<Vec<_>>()
                        .join(", ");
                    let _ = writeln!(self.out, "  %v{} = phi {} {}", p.value, ty, joined);
                }
            }
        }
        for (id, inst) in &block.insts {
            self.emit_inst(*id, inst);
        }
        match &block.term {
            Some(Terminator::Ret { value: Some(v) }) => {
                let ty = llvm_type(self.types, self.oir.value(*v).type_id);
                let _ = writeln!(self.out, "  ret {} %v{}", ty, v);
            }
            Some(Terminator::Ret { value: None }) => {
                let _ = writeln!(self.out, "  ret i64 0");
            }
            Some(Terminator::Br { target, .. }) => {
                let _ = writeln!(self.out, "  br label %bb{target}");
            }
            Some(Terminator::CondBr { cond, then_bb, else_bb, .. }) => {
                let _ = writeln!(self.out, "  br i1 %v{cond}, label %bb{then_bb}, label %bb{else_bb}");
            }
            Some(Terminator::Unreachable) | None => {
                let _ = writeln!(self.out, "  unreachable");
            }
        }
    }

    /// Every predecessor block that branches into `bb` carrying `param`'s
    /// slot is found by position: the Nth block-param of `bb` corresponds
    /// to the Nth arg of every `Br`/`CondBr` edge that targets it.
    fn predecessor_args(&self, bb: crate::compiler::oir::OirBlockId, param_value: crate::compiler::oir::OirValueId) -> Vec<(crate::compiler::oir::OirValueId, crate::compiler::oir::OirBlockId)> {
        let param_index = self
            .oir
            .block(bb)
            .params
            .iter()
            .position(|p| p.value == param_value)
            .unwrap_or(0);
        let mut out = Vec::new();
        for (idx, block) in self.oir.blocks.iter().enumerate() {
            let from = idx as crate::compiler::oir::OirBlockId;
            match &block.term {
                Some(Terminator::Br { target, args }) if *target == bb => {
                    if let Some(&v) = args.get(param_index) {
                        out.push((v, from));
                    }
                }
                Some(Terminator::CondBr { then_bb, then_args, .. }) if *then_bb == bb => {
                    if let Some(&v) = then_args.get(param_index) {
                        out.push((v, from));
                    }
                }
                Some(Terminator::CondBr { else_bb, else_args, .. }) if *else_bb == bb => {
                    if let Some(&v) = else_args.get(param_index) {
                        out.push((v, from));
                    }
                }
                _ => {}
            }
        }
        out
    }

    fn emit_inst(&mut self, id: crate::compiler::oir::OirValueId, inst: &Instruction) {
        let ty = llvm_type(self.types, self.oir.value(id).type_id);
        match inst {
            Instruction::ConstInt(n) => {
                let _ = writeln!(self.out, "  %v{id} = add {} 0, {}", ty, n);
            }
            Instruction::ConstBool(b) => {
                let _ = writeln!(self.out, "  %v{id} = add i1 0, {}", if *b { 1 } else { 0 });
            }
            Instruction::ConstNull => {
                let _ = writeln!(self.out, "  %v{id} = add {} 0, 0", ty);
            }
            Instruction::ConstText(s) => {
                let _ = writeln!(self.out, "  ; %v{id} string constant {:?} elided in v0 textual emission", s);
                let _ = writeln!(self.out, "  %v{id} = add {} 0, 0", ty);
            }
            Instruction::Unary { op, operand } => self.emit_unary(id, *op, *operand, &ty),
            Instruction::BinOp { op, lhs, rhs } => self.emit_binop(id, *op, *lhs, *rhs, &ty),
            Instruction::Cast { operand, from, to } => self.emit_cast(id, *operand, *from, *to),
            Instruction::FuncRef { func } => {
                let _ = writeln!(self.out, "  %v{id} = add {} 0, 0 ; funcref {}", ty, func);
            }
            Instruction::GlobalRef { symbol } => {
                let _ = writeln!(self.out, "  %v{id} = add {} 0, 0 ; globalref sym{}", ty, symbol);
            }
            Instruction::Call { direct_callee, args, .. } => self.emit_call(id, *direct_callee, args, &ty),
            Instruction::Index { base, index } => {
                let _ = writeln!(self.out, "  %v{id} = getelementptr {}, {}* %v{}, i64 %v{}", ty, ty, base, index);
            }
            Instruction::Field { base, offset } => {
                let _ = writeln!(self.out, "  %v{id} = getelementptr i8, i8* %v{}, i64 {}", base, offset);
            }
            Instruction::AllocaLocal { ty: alloca_ty } => {
                let _ = writeln!(self.out, "  %v{id} = alloca {}", llvm_type(self.types, *alloca_ty));
            }
            Instruction::Load { addr, ty: load_ty } => {
                let _ = writeln!(self.out, "  %v{id} = load {}, {}* %v{}", llvm_type(self.types, *load_ty), llvm_type(self.types, *load_ty), addr);
            }
            Instruction::Store { addr, value } => {
                let value_ty = llvm_type(self.types, self.oir.value(*value).type_id);
                let _ = writeln!(self.out, "  store {} %v{}, {}* %v{}", value_ty, value, value_ty, addr);
            }
        }
    }

    fn emit_unary(&mut self, id: crate::compiler::oir::OirValueId, op: UnaryOp, operand: crate::compiler::oir::OirValueId, ty: &str) {
        match op {
            UnaryOp::Neg if ty.starts_with('f') => {
                let _ = writeln!(self.out, "  %v{id} = fneg {} %v{}", ty, operand);
            }
            UnaryOp::Neg => {
                let _ = writeln!(self.out, "  %v{id} = sub {} 0, %v{}", ty, operand);
            }
            UnaryOp::Not => {
                let _ = writeln!(self.out, "  %v{id} = xor i1 %v{}, 1", operand);
            }
            UnaryOp::BitNot => {
                let _ = writeln!(self.out, "  %v{id} = xor {} %v{}, -1", ty, operand);
            }
            UnaryOp::Borrow { .. } | UnaryOp::Escape => {
                let _ = writeln!(self.out, "  %v{id} = bitcast {}* %v{} to {}*", ty, operand, ty);
            }
        }
    }

    fn emit_binop(&mut self, id: crate::compiler::oir::OirValueId, op: BinOp, lhs: crate::compiler::oir::OirValueId, rhs: crate::compiler::oir::OirValueId, ty: &str) {
        let is_float = ty.starts_with('f');
        let mnemonic = match op {
            BinOp::Add => if is_float { "fadd" } else { "add" },
            BinOp::Sub => if is_float { "fsub" } else { "sub" },
            BinOp::Mul => if is_float { "fmul" } else { "mul" },
            BinOp::Div => if is_float { "fdiv" } else { "sdiv" },
            BinOp::Mod => if is_float { "frem" } else { "srem" },
            BinOp::BitAnd | BinOp::And => "and",
            BinOp::BitOr | BinOp::Or => "or",
            BinOp::BitXor => "xor",
            BinOp::Shl => "shl",
            BinOp::Shr => "ashr",
            BinOp::NullCoalesce => {
                // v0 simplification: identity of the left-hand operand.
                let _ = writeln!(self.out, "  %v{id} = add {} 0, %v{}", ty, lhs);
                return;
            }
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                let cmp_op = if is_float {
                    match op {
                        BinOp::Eq => "oeq",
                        BinOp::Ne => "one",
                        BinOp::Lt => "olt",
                        BinOp::Le => "ole",
                        BinOp::Gt => "ogt",
                        _ => "oge",
                    }
                } else {
                    match op {
                        BinOp::Eq => "eq",
                        BinOp::Ne => "ne",
                        BinOp::Lt => "slt",
                        BinOp::Le => "sle",
                        BinOp::Gt => "sgt",
                        _ => "sge",
                    }
                };
                let instr = if is_float { "fcmp" } else { "icmp" };
                let _ = writeln!(self.out, "  %v{id} = {} {} {} %v{}, %v{}", instr, cmp_op, ty, lhs, rhs);
                return;
            }
        };
        let _ = writeln!(self.out, "  %v{id} = {} {} %v{}, %v{}", mnemonic, ty, lhs, rhs);
    }

    /// Conservative coercion: widen/narrow integers and floats through the
    /// matching LLVM conversion op; anything crossing the pointer/integer
    /// boundary gets `ptrtoint`/`inttoptr`; anything else falls back to a
    /// same-width `bitcast`.
    fn emit_cast(&mut self, id: crate::compiler::oir::OirValueId, operand: crate::compiler::oir::OirValueId, from: TypeId, to: TypeId) {
        let from_ty = llvm_type(self.types, from);
        let to_ty = llvm_type(self.types, to);
        let from_bits = llvm_bit_width(self.types, from);
        let to_bits = llvm_bit_width(self.types, to);
        let from_float = from_ty.starts_with('f');
        let to_float = to_ty.starts_with('f');
        let from_ptr = from_ty.ends_with('*');
        let to_ptr = to_ty.ends_with('*');

        let op = if from_ptr && to_ptr {
            "bitcast"
        } else if from_ptr && !to_ptr {
            "ptrtoint"
        } else if !from_ptr && to_ptr {
            "inttoptr"
        } else if from_float && to_float {
            if to_bits > from_bits { "fpext" } else { "fptrunc" }
        } else if from_float && !to_float {
            "fptosi"
        } else if !from_float && to_float {
            "sitofp"
        } else if to_bits > from_bits {
            "sext"
        } else if to_bits < from_bits {
            "trunc"
        } else {
            "bitcast"
        };
        let _ = writeln!(self.out, "  %v{id} = {} {} %v{} to {}", op, from_ty, operand, to_ty);
    }

    fn emit_call(&mut self, id: crate::compiler::oir::OirValueId, direct_callee: Option<usize>, args: &[crate::compiler::oir::OirValueId], ty: &str) {
        match direct_callee {
            Some(idx) => {
                let name = self.oir.functions.get(idx).map(|f| sanitize_name(&f.name)).unwrap_or_else(|| "unknown".to_string());
                let arg_list = args.iter().map(|a| format!("i64 %v{a}")).collect::<Vec<_>>().join(", ");
                let _ = writeln!(self.out, "  %v{id} = call {} @{}({})", ty, name, arg_list);
            }
            None => {
                self.call_stub_used = true;
                let _ = writeln!(self.out, "  call void @{CALL_STUB_NAME}()");
                let _ = writeln!(self.out, "  %v{id} = add {} 0, 0", ty);
            }
        }
    }
}

fn llvm_bit_width(types: &TypePool, ty: TypeId) -> u32 {
    let t = types.get(ty);
    if t.kind != Kind::Builtin {
        return 64;
    }
    match t.builtin {
        Builtin::Bool => 1,
        Builtin::Char | Builtin::I8 | Builtin::U8 => 8,
        Builtin::I16 | Builtin::U16 => 16,
        Builtin::I32 | Builtin::U32 | Builtin::F32 => 32,
        Builtin::I64 | Builtin::U64 | Builtin::F64 | Builtin::ISize | Builtin::USize => 64,
        Builtin::I128 | Builtin::U128 | Builtin::F128 => 128,
        _ => 64,
    }
}

fn llvm_type(types: &TypePool, ty: TypeId) -> String {
    let t = types.get(ty);
    match t.kind {
        Kind::Builtin => match t.builtin {
            Builtin::Unit | Builtin::Never => "void".to_string(),
            Builtin::Bool => "i1".to_string(),
            Builtin::Char | Builtin::I8 | Builtin::U8 => "i8".to_string(),
            Builtin::I16 | Builtin::U16 => "i16".to_string(),
            Builtin::I32 | Builtin::U32 => "i32".to_string(),
            Builtin::I64 | Builtin::U64 | Builtin::ISize | Builtin::USize => "i64".to_string(),
            Builtin::I128 | Builtin::U128 => "i128".to_string(),
            Builtin::F32 => "float".to_string(),
            Builtin::F64 => "double".to_string(),
            Builtin::F128 => "fp128".to_string(),
            Builtin::Text => "i8*".to_string(),
            Builtin::Null | Builtin::InferInteger => "i64".to_string(),
        },
        Kind::Optional => format!("{{ {}, i1 }}", llvm_type(types, t.elem)),
        Kind::Array => format!("{}*", llvm_type(types, t.elem)),
        Kind::Borrow | Kind::Escape | Kind::Ptr => format!("{}*", llvm_type(types, t.elem)),
        Kind::Fn => "i8*".to_string(),
        Kind::NamedUser | Kind::Error => "i8*".to_string(),
    }
}

fn zero_value(types: &TypePool, ty: TypeId) -> String {
    let llty = llvm_type(types, ty);
    if llty.ends_with('*') {
        "null".to_string()
    } else if llty.starts_with('f') || llty == "double" {
        "0.0".to_string()
    } else if llty.starts_with('{') {
        "zeroinitializer".to_string()
    } else {
        "0".to_string()
    }
}

/// Sanitizes a mangled/source name into the `[A-Za-z0-9_$.]` charset LLVM
/// identifiers require. A numeric-leading result gets a `_` prefix; an
/// empty result becomes `anon_fn`.
pub fn sanitize_name(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '$' || c == '.' { c } else { '_' })
        .collect();
    if out.is_empty() {
        return "anon_fn".to_string();
    }
    if out.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false) {
        out.insert(0, '_');
    }
    out
}
