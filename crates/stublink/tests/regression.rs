//! Regression tests for bug fixes.
//!
//! Each test documents a specific bug that was found and fixed, ensuring the
//! fix is never accidentally reverted.

use stublink::il::{IlStubLinker, IlStubOptions, StreamKind};
use stublink::{StubLinker, CODE_RUN_SIZE};

#[cfg(feature = "x86_64")]
use stublink::x86::JMP64;

const BASE: u64 = 0x40_0000;

/// Regression: a label bound right after a completely full code run must
/// resolve to the end of that run, not to the start of the next one.
#[test]
#[cfg(feature = "x86_64")]
fn label_after_full_code_run() {
    let mut sl = StubLinker::new();
    sl.emit_bytes(&[0x90; CODE_RUN_SIZE]);
    let end = sl.emit_new_code_label().unwrap();
    sl.emit_label_ref(end, &JMP64, 0);
    let code = sl.link_at(BASE).unwrap();
    assert_eq!(sl.label_offset(end), Some(CODE_RUN_SIZE as u32));
    // jmp $-0: rel8 measured from the end of the jump
    assert_eq!(&code[CODE_RUN_SIZE..], &[0xEB, 0xFE]);
}

/// Regression: a backward rel8 of exactly -128 is still in range.
#[test]
#[cfg(feature = "x86_64")]
fn backward_rel8_lower_bound_is_inclusive() {
    let mut sl = StubLinker::new();
    let top = sl.emit_new_code_label().unwrap();
    sl.emit_bytes(&[0x90; 126]);
    sl.emit_label_ref(top, &JMP64, 0);
    let code = sl.link_at(BASE).unwrap();
    assert_eq!(&code[126..], &[0xEB, 0x80]);
}

/// Regression: one byte past the rel8 range must widen, and the new
/// displacement accounts for the longer instruction.
#[test]
#[cfg(feature = "x86_64")]
fn backward_rel8_overflow_widens() {
    let mut sl = StubLinker::new();
    let top = sl.emit_new_code_label().unwrap();
    sl.emit_bytes(&[0x90; 127]);
    sl.emit_label_ref(top, &JMP64, 0);
    let code = sl.link_at(BASE).unwrap();
    // jmp rel32 -132
    assert_eq!(&code[127..], &[0xE9, 0x7C, 0xFF, 0xFF, 0xFF]);
}

/// Regression: `switch` displacements are relative to the end of the whole
/// instruction (after the target table), not to the end of the opcode.
#[test]
fn switch_displacement_from_end_of_table() {
    let mut il = IlStubLinker::new(IlStubOptions::default());
    let s = il.new_code_stream(StreamKind::Dispatch);
    let top = il.new_code_label();
    il.stream(s)
        .emit_label(top)
        .emit_ldarg(0)
        .emit_switch(&[top])
        .emit_ret();
    let stub = il.build().unwrap();
    // ldarg.0 | switch (1) top | ret
    assert_eq!(
        stub.code(),
        &[0x02, 0x45, 0x01, 0x00, 0x00, 0x00, 0xF6, 0xFF, 0xFF, 0xFF, 0x2A]
    );
}

/// Regression: `ldc.i4` must pick the boundary forms correctly: -1 and 8
/// have dedicated opcodes, 9 and 127 fit `ldc.i4.s`, 128 does not.
#[test]
fn ldc_boundaries() {
    let mut il = IlStubLinker::new(IlStubOptions::default());
    let s = il.new_code_stream(StreamKind::Marshal);
    for v in [-1, 8, 9, 127, 128, -128, -129] {
        il.stream(s).emit_ldc(v).emit_pop();
    }
    let stub = il.build().unwrap();
    assert_eq!(
        stub.code(),
        &[
            0x15, 0x26, // ldc.i4.m1
            0x1E, 0x26, // ldc.i4.8
            0x1F, 0x09, 0x26, // ldc.i4.s 9
            0x1F, 0x7F, 0x26, // ldc.i4.s 127
            0x20, 0x80, 0x00, 0x00, 0x00, 0x26, // ldc.i4 128
            0x1F, 0x80, 0x26, // ldc.i4.s -128
            0x20, 0x7F, 0xFF, 0xFF, 0xFF, 0x26, // ldc.i4 -129
        ]
    );
}

/// Regression: argument index 255 still fits the short form; 256 needs the
/// two-byte opcode with a 16-bit operand.
#[test]
fn ldarg_short_form_boundary() {
    let mut il = IlStubLinker::new(IlStubOptions::default());
    let s = il.new_code_stream(StreamKind::Marshal);
    il.stream(s)
        .emit_ldarg(255)
        .emit_ldarg(256)
        .emit_pop()
        .emit_pop();
    let stub = il.build().unwrap();
    assert_eq!(
        stub.code(),
        &[0x0E, 0xFF, 0xFE, 0x09, 0x00, 0x01, 0x26, 0x26]
    );
    assert_eq!(stub.max_stack(), 2);
}

/// Regression: with an implicit `this`, user argument 0 is physical
/// argument 1 and `load_this` is physical argument 0.
#[test]
fn has_this_shifts_argument_indices() {
    let mut il = IlStubLinker::new(IlStubOptions {
        has_this: true,
        ..IlStubOptions::default()
    });
    let s = il.new_code_stream(StreamKind::Setup);
    il.stream(s)
        .emit_load_this()
        .emit_ldarg(0)
        .emit_ldarg(2)
        .emit_pop()
        .emit_pop()
        .emit_pop();
    let stub = il.build().unwrap();
    // ldarg.0 | ldarg.1 | ldarg.3
    assert_eq!(&stub.code()[..3], &[0x02, 0x03, 0x05]);
}

/// Regression: call arities above `i16::MAX` used to wrap, so a call popping
/// 40000 arguments was counted as a push and produced a bogus max stack.
#[test]
fn wide_call_arity_underflows() {
    let mut il = IlStubLinker::new(IlStubOptions::default());
    let s = il.new_code_stream(StreamKind::Dispatch);
    il.stream(s).emit_call(0x0600_0001, 40000, 0).emit_ret();
    assert!(matches!(
        il.link(),
        Err(stublink::LinkError::StackUnderflow { depth: -40000, .. })
    ));
}

/// Regression: the running stack depth used to be summed in `i32` and
/// overflowed on long push-only sequences instead of linking.
#[test]
fn push_only_sequence_links() {
    let mut il = IlStubLinker::new(IlStubOptions::default());
    let s = il.new_code_stream(StreamKind::Dispatch);
    for _ in 0..65540 {
        il.stream(s).emit_call(0x0600_0001, 0, 32767);
    }
    let info = il.link().unwrap();
    assert_eq!(u64::from(info.max_stack), 65540 * 32767);
    assert_eq!(il.streams()[0].stack_delta(), 65540 * 32767);
}
