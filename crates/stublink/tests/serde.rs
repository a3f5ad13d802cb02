//! Serde round-trip tests for the plain-data types of `stublink`.
//!
//! Options, layout summaries and exception clauses serialize to JSON and
//! come back identical.

#![cfg(feature = "serde")]

use stublink::il::{
    BranchForm, CallingConvention, EhClause, EhClauseKind, ElementType, IlLinkInfo,
    IlStubLinker, IlStubOptions, SigType, StreamKind, TokenKind,
};
use stublink::{
    AppliedFixup, LinkState, RefSize, RefSizes, StubFlags, StubLayout, StubLinker,
    StubLinkerOptions,
};

/// Helper: serialize to JSON, deserialize back, assert equality.
fn round_trip<T>(val: &T)
where
    T: serde::Serialize + serde::de::DeserializeOwned + PartialEq + core::fmt::Debug,
{
    let json = serde_json::to_string(val).expect("serialize");
    let back: T = serde_json::from_str(&json).expect("deserialize");
    assert_eq!(val, &back, "round-trip mismatch for JSON: {json}");
}

// ─── Native ─────────────────────────────────────────────────────────────────

#[test]
fn serde_linker_options() {
    round_trip(&StubLinkerOptions::default());
    round_trip(&StubLinkerOptions {
        data_alignment: 16,
        pointer_width: 4,
        max_code_bytes: 4096,
        max_labels: 64,
    });
}

#[test]
fn serde_ref_sizes() {
    for size in [RefSize::K8, RefSize::K16, RefSize::K32, RefSize::K64] {
        round_trip(&size);
    }
    round_trip(&RefSizes::of(&[RefSize::K8, RefSize::K32]));
    round_trip(&RefSizes::NONE);
}

#[test]
fn serde_layout_and_state() {
    round_trip(&StubLayout {
        code_size: 139,
        data_offset: 144,
        data_size: 8,
        total_size: 152,
        passes: 3,
    });
    for state in [LinkState::Building, LinkState::Linked, LinkState::Emitted] {
        round_trip(&state);
    }
}

#[test]
fn serde_flags_and_fixups() {
    round_trip(&StubFlags::NONE);
    round_trip(&(StubFlags::MULTICAST | StubFlags::UNWIND_INFO));

    let mut sl = StubLinker::new();
    let label = sl.new_code_label();
    round_trip(&label);
    round_trip(&AppliedFixup {
        offset: 10,
        size: RefSize::K32,
        label,
        value: -0x80,
    });
}

// ─── IL ─────────────────────────────────────────────────────────────────────

#[test]
fn serde_il_options() {
    round_trip(&IlStubOptions::default());
    round_trip(&IlStubOptions {
        has_this: true,
        returns_value: true,
        branch_form: BranchForm::Relaxed,
        max_instructions: 10,
    });
    round_trip(&IlLinkInfo {
        code_size: 56,
        max_stack: 3,
        num_eh_clauses: 2,
        passes: 1,
    });
}

#[test]
fn serde_eh_clauses() {
    for kind in [EhClauseKind::Catch, EhClauseKind::Finally, EhClauseKind::Fault] {
        round_trip(&kind);
    }
    round_trip(&EhClause {
        kind: EhClauseKind::Catch,
        try_offset: 0,
        try_length: 6,
        handler_offset: 6,
        handler_length: 6,
        class_token: 0x0200_0001,
    });
}

#[test]
fn serde_streams_tokens_labels() {
    for kind in [
        StreamKind::Setup,
        StreamKind::Marshal,
        StreamKind::Dispatch,
        StreamKind::ReturnUnmarshal,
        StreamKind::Unmarshal,
        StreamKind::ExceptionCleanup,
        StreamKind::Cleanup,
        StreamKind::ExceptionHandler,
    ] {
        round_trip(&kind);
    }
    for kind in [
        TokenKind::Method,
        TokenKind::Field,
        TokenKind::Type,
        TokenKind::Signature,
        TokenKind::String,
    ] {
        round_trip(&kind);
    }
    let il = IlStubLinker::new(IlStubOptions::default());
    round_trip(&il.new_code_label());
}

#[test]
fn serde_signature_types() {
    round_trip(&CallingConvention::StdCall);
    round_trip(&SigType::from(ElementType::I4));
    round_trip(&SigType::pinned(SigType::by_ref(ElementType::U1)));
    round_trip(&SigType::sz_array(SigType::Class(0x0100_0002)));
}
