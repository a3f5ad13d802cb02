//! # stublink: Runtime Stub Linker
//!
//! `stublink` synthesizes small pieces of code at run time: interop thunks,
//! trampolines, and marshaling glue.  It has two sibling linkers that share
//! one error type and one lifecycle (`Building → Linked → Emitted`):
//!
//! - [`StubLinker`] lays out native machine code.  Raw bytes and
//!   relocatable instructions are appended in order; every relocatable
//!   instruction starts at its smallest encoding and grows until it reaches
//!   its target, then the stub is written into a block of a [`StubHeap`] and
//!   handed back as a ref-counted [`Stub`].
//! - [`il::IlStubLinker`] builds IL method bodies out of ordered code
//!   streams: opcodes are lowered to their short forms, the operand stack
//!   depth is checked and its maximum recorded, branch displacements and
//!   exception clauses are resolved.
//!
//! ## Quick Start
//!
//! ```rust
//! # #[cfg(feature = "x86_64")] {
//! use std::sync::Arc;
//! use stublink::{BumpHeap, StubFlags, StubLinker};
//! use stublink::x86::JMP64;
//!
//! let mut sl = StubLinker::new();
//! let target = sl.new_external_code_label(0x7fff_0000_1000);
//! sl.emit8(0x90);
//! sl.emit_label_ref(target, &JMP64, 0);
//!
//! let heap = Arc::new(BumpHeap::new(0x1000_0000, 0x1_0000));
//! let stub = sl.link(heap, StubFlags::NONE)?;
//! assert_eq!(stub.code()[0], 0x90);
//! // mov r11, imm64; jmp r11
//! assert_eq!(stub.code().len(), 1 + 13);
//! # }
//! # Ok::<(), stublink::LinkError>(())
//! ```
//!
//! ## Features
//!
//! - **`no_std` + `alloc`**: the linkers only need an allocator.
//! - **Pluggable formats**: any [`InstructionFormat`] can be referenced;
//!   x86, x86-64 and AArch64 formats ship behind feature flags.
//! - **Checked defects**: unbound labels, unreachable targets, stack
//!   underflow and misnested exception blocks come back as [`LinkError`]s.

#![cfg_attr(not(feature = "std"), no_std)]
#![forbid(unsafe_code)]
// Encoders narrow and reinterpret integers constantly, and opcode tables
// read best as dense hex.
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_lossless,
    clippy::cast_possible_wrap,
    clippy::unreadable_literal,
    clippy::match_same_arms,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::uninlined_format_args,
    clippy::doc_markdown,
    clippy::similar_names,
    clippy::too_many_lines,
    clippy::return_self_not_must_use,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::new_without_default,
    clippy::len_without_is_empty
)]

extern crate alloc;

/// AArch64 instruction formats.
#[cfg(feature = "aarch64")]
pub mod aarch64;
/// Error type and linker lifecycle states.
pub mod error;
/// The instruction-format contract: reference sizes, reach, fixups.
pub mod format;
/// IL stub linker: code streams, opcodes, exception clauses, signatures.
pub mod il;
/// Native stub linker: code runs, labels, layout, emission.
pub mod linker;
/// Emitted stubs and the heaps they live in.
pub mod stub;
/// x86 and x86-64 instruction formats.
#[cfg(any(feature = "x86", feature = "x86_64"))]
pub mod x86;

pub use error::{LinkError, LinkState};
pub use format::{EmitSite, Fixup, InstructionFormat, Reach, RefSize, RefSizes};
pub use il::{IlStub, IlStubLinker, IlStubOptions};
pub use linker::{
    CodeLabel, CodeRun, LabelRef, StubLayout, StubLinker, StubLinkerOptions, CODE_RUN_SIZE,
};
pub use stub::{AppliedFixup, BumpHeap, Stub, StubFlags, StubHeap};
