//! End-to-end pipeline tests against literal source strings, covering the
//! concrete scenarios the capability analyzer and type checker are meant to
//! accept or reject.

use parus_compiler::compiler::diagnostics::DiagCode;
use parus_compiler::compiler::sir::{EscapeBoundary, EscapeHandleKind, EscapeHandleMeta};
use parus_compiler::compiler::tokens::Span;
use parus_compiler::{compile, has_blocking_errors};

fn codes(source: &str) -> Vec<DiagCode> {
    match compile("test.par", source) {
        Ok(out) => out.diagnostics.iter().map(|d| d.code).collect(),
        Err(_) => {
            // Even on a gate failure we still want to inspect *which*
            // diagnostics were raised; re-run the earlier stages directly
            // isn't worth it here since `compile`'s Err variant only
            // carries a count. Scenarios that expect Err check that
            // directly instead of through this helper.
            Vec::new()
        }
    }
}

#[test]
fn scenario_a_deferred_integer_promoted_to_i64() {
    let src = "fn main() -> i64 { set x = 1; let y: i64 = x; return y; }";
    let out = compile("a.par", src).expect("scenario A should compile cleanly");
    assert!(!has_blocking_errors(&out.diagnostics));
}

#[test]
fn scenario_b_use_after_escape_rejected() {
    let src = "fn main() -> i32 { set x = 1i32; set h = &&x; return 0i32; }";
    let result = compile("b.par", src);
    match result {
        Ok(out) => assert!(out.diagnostics.iter().any(|d| d.code == DiagCode::SirEscapeBoundaryViolation)),
        Err(_) => {
            // Pipeline gated out before producing a `CompileOutput`, which
            // is also an acceptable way to surface the rejection.
        }
    }
}

#[test]
fn scenario_c_shared_with_mut_conflict() {
    let src = "fn main() -> i32 { set mut x = 1i32; set m = &mut x; set r = &x; return 0i32; }";
    let result = compile("c.par", src);
    match result {
        Ok(out) => assert!(out.diagnostics.iter().any(|d| {
            matches!(d.code, DiagCode::BorrowSharedConflictWithMut | DiagCode::BorrowMutConflictWithShared)
        })),
        Err(_) => {}
    }
}

#[test]
fn scenario_d_loop_break_value() {
    let src = "fn main() -> i32 { set x = loop { break 7i32; }; return x; }";
    let out = compile("d.par", src).expect("scenario D should compile cleanly");
    assert!(!has_blocking_errors(&out.diagnostics));
}

#[test]
fn scenario_e_while_break_with_value_rejected() {
    let src = "fn main() -> i32 { while (true) { break 1i32; } return 0i32; }";
    let diag_codes = codes(src);
    assert!(
        diag_codes.contains(&DiagCode::TypeBreakValueOnlyInLoopExpr)
            || compile("e.par", src).is_err()
    );
}

#[test]
fn scenario_f_static_escape_permitted() {
    let src = "static let G: i32 = 7i32; static mut set HG = &&G; fn main() -> i32 { return 0i32; }";
    let out = compile("f.par", src).expect("scenario F should compile cleanly");
    assert!(!has_blocking_errors(&out.diagnostics));
    let handles: Vec<_> = out.sir.escape_handles.iter().filter(|h| h.from_static).collect();
    assert_eq!(handles.len(), 1);
    assert_eq!(handles[0].kind, EscapeHandleKind::Trivial);
}

#[test]
fn scenario_g_oir_gate_rejects_materialized_handle() {
    use parus_compiler::compiler::sir::{self, SirModule};

    let mut module = SirModule::default();
    module.escape_handles.push(EscapeHandleMeta {
        escape_value: 0,
        origin_sym: 0,
        pointee_type: 0,
        kind: EscapeHandleKind::Trivial,
        boundary: EscapeBoundary::Return,
        from_static: false,
        has_drop: false,
        abi_pack_required: false,
        ffi_pack_required: false,
        materialize_count: 1,
        span: Span::dummy(),
    });

    let errors = sir::verify(&module);
    assert!(
        errors.iter().any(|e| e.message.to_lowercase().contains("materialize")),
        "expected a materialize_count verify failure, got {errors:?}"
    );
}

#[test]
fn rejects_set_inference_from_null() {
    let src = "fn main() -> i32 { set x = null; return 0i32; }";
    let diag_codes = codes(src);
    assert!(
        diag_codes.contains(&DiagCode::SetCannotInferFromNull) || compile("null.par", src).is_err()
    );
}

#[test]
fn empty_program_compiles_with_no_diagnostics() {
    let out = compile("empty.par", "fn main() -> i32 { return 0i32; }").unwrap();
    assert!(out.diagnostics.is_empty());
    assert!(out.llvm_ir.contains("define"));
}
