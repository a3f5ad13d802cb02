//! Exception clauses: the per-stream builder stack and the fat table format.

use alloc::format;
use alloc::vec::Vec;

use super::stream::{IlCodeLabel, IlCodeStream};
use crate::error::LinkError;

/// Kind of an exception-handling clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum EhClauseKind {
    /// Typed catch handler.
    Catch,
    /// Finally handler.
    Finally,
    /// Fault handler (runs only on exceptional exit).
    Fault,
}

impl EhClauseKind {
    /// `Flags` field of a fat clause record.
    pub const fn flags(self) -> u32 {
        match self {
            EhClauseKind::Catch => 0x0,
            EhClauseKind::Finally => 0x2,
            EhClauseKind::Fault => 0x4,
        }
    }
}

/// A resolved exception clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EhClause {
    /// Handler kind.
    pub kind: EhClauseKind,
    /// Start of the protected region.
    pub try_offset: u32,
    /// Length of the protected region.
    pub try_length: u32,
    /// Start of the handler.
    pub handler_offset: u32,
    /// Length of the handler.
    pub handler_length: u32,
    /// Caught type for catch clauses, 0 otherwise.
    pub class_token: u32,
}

/// Size of one fat clause record.
pub const FAT_CLAUSE_SIZE: usize = 24;

/// `CorILMethod_Sect_EHTable | CorILMethod_Sect_FatFormat`.
const SECT_EH_TABLE_FAT: u8 = 0x01 | 0x40;

impl EhClause {
    /// Write the 24-byte fat record.
    pub fn write_fat(&self, out: &mut Vec<u8>) {
        for field in [
            self.kind.flags(),
            self.try_offset,
            self.try_length,
            self.handler_offset,
            self.handler_length,
            self.class_token,
        ] {
            out.extend_from_slice(&field.to_le_bytes());
        }
    }
}

/// Encode a complete fat exception section (header plus records).
/// Returns an empty vector when there are no clauses.
pub fn fat_eh_section(clauses: &[EhClause]) -> Vec<u8> {
    if clauses.is_empty() {
        return Vec::new();
    }
    let data_size = 4 + clauses.len() * FAT_CLAUSE_SIZE;
    let mut out = Vec::with_capacity(data_size);
    out.push(SECT_EH_TABLE_FAT);
    out.extend_from_slice(&(data_size as u32).to_le_bytes()[..3]);
    for clause in clauses {
        clause.write_fat(&mut out);
    }
    out
}

// ─── builders ──────────────────────────────────────────────

/// An exception clause under construction.
#[derive(Debug, Clone)]
pub(crate) struct ClauseBuilder {
    try_begin: IlCodeLabel,
    try_end: Option<IlCodeLabel>,
    handler: Option<(EhClauseKind, u32, IlCodeLabel)>,
}

/// A clause whose four boundaries are bound.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FinishedClause {
    pub(crate) kind: EhClauseKind,
    pub(crate) class_token: u32,
    pub(crate) try_begin: IlCodeLabel,
    pub(crate) try_end: IlCodeLabel,
    pub(crate) handler_begin: IlCodeLabel,
    pub(crate) handler_end: IlCodeLabel,
}

fn mismatch(detail: alloc::string::String) -> LinkError {
    LinkError::ExceptionBlockMismatch { detail }
}

/// Exception blocks.  Each boundary binds a fresh label at the current
/// position; clauses nest like a stack per stream.
impl IlCodeStream {
    /// Open a protected region.
    pub fn begin_try_block(&mut self) -> &mut Self {
        let try_begin = self.new_code_label();
        self.bind(try_begin, 0);
        self.open.push(ClauseBuilder {
            try_begin,
            try_end: None,
            handler: None,
        });
        self
    }

    /// Close the innermost protected region.
    ///
    /// # Errors
    ///
    /// [`LinkError::ExceptionBlockMismatch`] if no try block is open or its
    /// body is already closed.
    pub fn end_try_block(&mut self) -> Result<&mut Self, LinkError> {
        let label = self.new_code_label();
        let kind = self.kind;
        let builder = self
            .open
            .last_mut()
            .ok_or_else(|| mismatch(format!("end_try_block with no open try in '{}'", kind)))?;
        if builder.try_end.is_some() {
            return Err(mismatch(format!("try block in '{}' already ended", kind)));
        }
        builder.try_end = Some(label);
        Ok(self.bind(label, 0))
    }

    fn begin_handler(
        &mut self,
        kind: EhClauseKind,
        class_token: u32,
    ) -> Result<&mut Self, LinkError> {
        let label = self.new_code_label();
        let stream = self.kind;
        let builder = self.open.last_mut().ok_or_else(|| {
            mismatch(format!("{:?} handler with no open try in '{}'", kind, stream))
        })?;
        if builder.try_end.is_none() || builder.handler.is_some() {
            return Err(mismatch(format!(
                "{:?} handler must follow end_try_block in '{}'",
                kind, stream
            )));
        }
        builder.handler = Some((kind, class_token, label));
        // The runtime pushes the exception object on entry to a catch.
        let entry_delta = if kind == EhClauseKind::Catch { 1 } else { 0 };
        Ok(self.bind(label, entry_delta))
    }

    fn end_handler(&mut self, kind: EhClauseKind) -> Result<&mut Self, LinkError> {
        let stream = self.kind;
        let builder = self.open.pop().ok_or_else(|| {
            mismatch(format!(
                "end of {:?} handler with nothing open in '{}'",
                kind, stream
            ))
        })?;
        let handler = builder.handler;
        let (class_token, handler_begin, try_end) = match (handler, builder.try_end) {
            (Some((found, class_token, begin)), Some(try_end)) if found == kind => {
                (class_token, begin, try_end)
            }
            _ => {
                self.open.push(builder);
                return Err(mismatch(format!(
                    "expected end of {:?} handler in '{}', innermost is {:?}",
                    kind,
                    stream,
                    handler.map(|h| h.0)
                )));
            }
        };
        let handler_end = self.new_code_label();
        self.finished.push(FinishedClause {
            kind,
            class_token,
            try_begin: builder.try_begin,
            try_end,
            handler_begin,
            handler_end,
        });
        log::trace!(
            "IlCodeStream({}): finished {:?} clause #{}",
            stream,
            kind,
            self.finished.len()
        );
        Ok(self.bind(handler_end, 0))
    }

    /// Open a catch handler for `class_token` after the try block.
    pub fn begin_catch_block(&mut self, class_token: u32) -> Result<&mut Self, LinkError> {
        self.begin_handler(EhClauseKind::Catch, class_token)
    }

    /// Close the catch handler and finish its clause.
    pub fn end_catch_block(&mut self) -> Result<&mut Self, LinkError> {
        self.end_handler(EhClauseKind::Catch)
    }

    /// Open a finally handler after the try block.
    pub fn begin_finally_block(&mut self) -> Result<&mut Self, LinkError> {
        self.begin_handler(EhClauseKind::Finally, 0)
    }

    /// Close the finally handler and finish its clause.
    pub fn end_finally_block(&mut self) -> Result<&mut Self, LinkError> {
        self.end_handler(EhClauseKind::Finally)
    }

    /// Open a fault handler after the try block.
    pub fn begin_fault_block(&mut self) -> Result<&mut Self, LinkError> {
        self.begin_handler(EhClauseKind::Fault, 0)
    }

    /// Close the fault handler and finish its clause.
    pub fn end_fault_block(&mut self) -> Result<&mut Self, LinkError> {
        self.end_handler(EhClauseKind::Fault)
    }

    /// Number of clauses still open.
    pub fn open_exception_blocks(&self) -> usize {
        self.open.len()
    }

    /// Number of finished clauses.
    pub fn num_eh_clauses(&self) -> usize {
        self.finished.len()
    }
}
