//! The finished product of an IL link: code, exception table, locals, and
//! a readable listing.

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::Write;

use super::eh::{fat_eh_section, EhClause};
use super::opcode::OperandKind;
use super::stream::StreamKind;
use super::token::TokenMap;
use super::{FlatItem, FlatKind, Resolved};
use crate::error::LinkError;

/// `CorILMethod_FatFormat` with a 3-dword header.
const FAT_FORMAT: u16 = 0x3003;
const MORE_SECTS: u16 = 0x0008;
const INIT_LOCALS: u16 = 0x0010;

/// A linked IL stub.
#[derive(Debug, Clone)]
pub struct IlStub {
    code: Vec<u8>,
    max_stack: u32,
    eh_clauses: Vec<EhClause>,
    local_signature: Vec<u8>,
    tokens: TokenMap,
    listing: String,
}

impl IlStub {
    pub(super) fn new(
        code: Vec<u8>,
        max_stack: u32,
        eh_clauses: Vec<EhClause>,
        local_signature: Vec<u8>,
        tokens: TokenMap,
        listing: String,
    ) -> Self {
        Self {
            code,
            max_stack,
            eh_clauses,
            local_signature,
            tokens,
            listing,
        }
    }

    /// IL bytes.
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Maximum operand stack depth.
    pub fn max_stack(&self) -> u32 {
        self.max_stack
    }

    /// Exception clauses.
    pub fn eh_clauses(&self) -> &[EhClause] {
        &self.eh_clauses
    }

    /// The clauses as a fat exception section (empty without clauses).
    pub fn eh_section(&self) -> Vec<u8> {
        fat_eh_section(&self.eh_clauses)
    }

    /// `LOCAL_SIG` blob for the declared locals.
    pub fn local_signature(&self) -> &[u8] {
        &self.local_signature
    }

    /// Tokens referenced by the code.
    pub fn tokens(&self) -> &TokenMap {
        &self.tokens
    }

    /// One line per instruction, grouped by stream.
    pub fn listing(&self) -> &str {
        &self.listing
    }

    /// A complete fat method body: header, code, and (4-byte aligned)
    /// exception section.  `local_sig_token` is the token under which the
    /// caller registered [`IlStub::local_signature`], or 0 for no locals.
    ///
    /// # Errors
    ///
    /// [`LinkError::ResourceLimitExceeded`] if the max stack does not fit
    /// the 16-bit header field.
    pub fn method_body(&self, local_sig_token: u32) -> Result<Vec<u8>, LinkError> {
        let max_stack = u16::try_from(self.max_stack).map_err(|_| {
            LinkError::ResourceLimitExceeded {
                resource: String::from("max stack"),
                limit: u16::MAX as usize,
            }
        })?;
        let mut flags = FAT_FORMAT;
        if !self.eh_clauses.is_empty() {
            flags |= MORE_SECTS;
        }
        if local_sig_token != 0 {
            flags |= INIT_LOCALS;
        }

        let mut out = Vec::with_capacity(12 + self.code.len());
        out.extend_from_slice(&flags.to_le_bytes());
        out.extend_from_slice(&max_stack.to_le_bytes());
        out.extend_from_slice(&(self.code.len() as u32).to_le_bytes());
        out.extend_from_slice(&local_sig_token.to_le_bytes());
        out.extend_from_slice(&self.code);
        if !self.eh_clauses.is_empty() {
            while out.len() % 4 != 0 {
                out.push(0);
            }
            out.extend_from_slice(&self.eh_section());
        }
        Ok(out)
    }
}

pub(super) fn render_listing(items: &[FlatItem], kinds: &[StreamKind]) -> String {
    let mut out = String::new();
    let mut current = None;
    for item in items {
        if current != Some(item.stream) {
            current = Some(item.stream);
            let _ = writeln!(out, "// {}", kinds[item.stream]);
        }
        match &item.kind {
            FlatKind::Mark { label, .. } => {
                let _ = writeln!(out, "L{}:", label.id());
            }
            FlatKind::Instr {
                opcode,
                arg,
                resolved,
                ..
            } => {
                let end = (item.offset + item.size()) as i64;
                let target = |d: i32| format!("IL_{:04x}", end + d as i64);
                let raw = arg.raw();
                let operand = match (opcode.operand(), resolved) {
                    (OperandKind::None, _) => String::new(),
                    (OperandKind::ShortBrTarget | OperandKind::BrTarget, Resolved::Branch(d)) => {
                        target(*d)
                    }
                    (OperandKind::Switch, Resolved::Switch(disps)) => {
                        let targets: Vec<String> = disps.iter().map(|&d| target(d)).collect();
                        format!("({})", targets.join(", "))
                    }
                    (OperandKind::ShortR, _) => format!("{:?}", f32::from_bits(raw as u32)),
                    (OperandKind::R, _) => format!("{:?}", f64::from_bits(raw as u64)),
                    (OperandKind::Token, _) => format!("{:#010x}", raw as u32),
                    _ => format!("{}", raw),
                };
                if operand.is_empty() {
                    let _ = writeln!(out, "IL_{:04x}: {}", item.offset, opcode);
                } else {
                    let _ = writeln!(out, "IL_{:04x}: {} {}", item.offset, opcode, operand);
                }
            }
        }
    }
    out
}
