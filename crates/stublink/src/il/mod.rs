//! IL stub linker: named code streams, opcode lowering, two-pass link, and
//! exception tables.
//!
//! Streams are concatenated in creation order.  [`IlStubLinker::link`]
//! lowers every instruction to its smallest form, assigns offsets and label
//! positions, checks the running stack depth (recording its maximum), and
//! then resolves branch displacements.  [`IlStubLinker::generate_code`]
//! writes the final bytes and [`IlStubLinker::write_eh_clauses`] the
//! flattened exception table.
//!
//! # Examples
//!
//! ```rust
//! use stublink::il::{IlStubLinker, IlStubOptions, StreamKind};
//!
//! let mut il = IlStubLinker::new(IlStubOptions {
//!     returns_value: true,
//!     ..IlStubOptions::default()
//! });
//! let body = il.new_code_stream(StreamKind::Dispatch);
//! il.stream(body).emit_ldarg(0).emit_ldc(5).emit_add().emit_ret();
//!
//! let info = il.link()?;
//! assert_eq!(info.max_stack, 2);
//! let mut code = vec![0u8; info.code_size as usize];
//! il.generate_code(&mut code)?;
//! assert_eq!(code, [0x02, 0x1B, 0x58, 0x2A]);
//! # Ok::<(), stublink::LinkError>(())
//! ```

mod body;
mod eh;
mod opcode;
mod signature;
mod stream;
mod token;

pub use body::IlStub;
pub use eh::{fat_eh_section, EhClause, EhClauseKind, FAT_CLAUSE_SIZE};
pub use opcode::{Opcode, OperandKind, StackEffect};
pub use signature::{
    read_compressed_u32, write_compressed_u32, CallingConvention, ElementType,
    FunctionSigBuilder, LocalSigBuilder, SigType, MAX_COMPRESSED,
};
pub use stream::{IlArg, IlCodeLabel, IlCodeStream, IlInstruction, StreamKind};
pub use token::{TokenKind, TokenMap, MAX_RID};

use alloc::rc::Rc;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use core::cell::Cell;

use crate::error::{LinkError, LinkState};
use crate::linker::next_owner;
use stream::StreamItem;

// ─── Options ───────────────────────────────────────────────

/// How branches are sized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BranchForm {
    /// Every branch uses its 4-byte form; one pass.
    #[default]
    Long,
    /// Start every branch at its 1-byte form and widen the ones that do not
    /// reach until nothing changes.
    Relaxed,
}

/// Configuration for an [`IlStubLinker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IlStubOptions {
    /// The stub has an implicit `this` argument; argument indices passed to
    /// the emitters skip it.  Default: `false`.
    pub has_this: bool,
    /// `ret` pops a return value.  Default: `false`.
    pub returns_value: bool,
    /// Branch sizing.  Default: [`BranchForm::Long`].
    pub branch_form: BranchForm,
    /// Maximum number of instructions across all streams.  Default: 1,000,000.
    pub max_instructions: usize,
}

impl Default for IlStubOptions {
    fn default() -> Self {
        Self {
            has_this: false,
            returns_value: false,
            branch_form: BranchForm::Long,
            max_instructions: 1_000_000,
        }
    }
}

/// State shared by a linker and its streams.
#[derive(Debug)]
pub(crate) struct StreamContext {
    options: IlStubOptions,
    owner: u32,
    next_label: Cell<u32>,
    linked: Cell<bool>,
}

impl StreamContext {
    fn new_label(&self) -> IlCodeLabel {
        let id = self.next_label.get();
        self.next_label.set(id + 1);
        IlCodeLabel(id, self.owner)
    }

    fn owns(&self, label: IlCodeLabel) -> bool {
        label.1 == self.owner
    }

    fn is_linked(&self) -> bool {
        self.linked.get()
    }
}

/// Handle to a stream of an [`IlStubLinker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(u32);

/// Summary returned by [`IlStubLinker::link`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IlLinkInfo {
    /// Bytes of IL.
    pub code_size: u32,
    /// Maximum operand stack depth.
    pub max_stack: u32,
    /// Exception clauses across all streams.
    pub num_eh_clauses: usize,
    /// Layout passes (always 1 with [`BranchForm::Long`]).
    pub passes: u32,
}

// ─── Flattened instruction list ────────────────────────────

#[derive(Debug, Clone)]
enum Resolved {
    None,
    Branch(i32),
    Switch(Vec<i32>),
}

#[derive(Debug, Clone)]
enum FlatKind {
    Instr {
        opcode: Opcode,
        arg: IlArg,
        delta: i32,
        resolved: Resolved,
    },
    Mark {
        label: IlCodeLabel,
        delta: i32,
    },
}

#[derive(Debug, Clone)]
struct FlatItem {
    stream: usize,
    offset: u32,
    kind: FlatKind,
}

impl FlatItem {
    fn size(&self) -> u32 {
        match &self.kind {
            FlatKind::Instr {
                opcode,
                arg: IlArg::Switch(targets),
                ..
            } => opcode.size() + 4 * targets.len() as u32,
            FlatKind::Instr { opcode, .. } => opcode.size(),
            FlatKind::Mark { .. } => 0,
        }
    }

    fn delta(&self) -> i32 {
        match &self.kind {
            FlatKind::Instr { delta, .. } | FlatKind::Mark { delta, .. } => *delta,
        }
    }
}

#[derive(Debug)]
struct Linked {
    items: Vec<FlatItem>,
    /// For each label id, the index of its mark in `items`.
    label_items: Vec<Option<usize>>,
    code_size: u32,
    max_stack: u32,
    clauses: Vec<EhClause>,
}

fn label_position(items: &[FlatItem], label_items: &[Option<usize>], label: IlCodeLabel) -> u32 {
    label_items
        .get(label.0 as usize)
        .copied()
        .flatten()
        .map_or(0, |index| items[index].offset)
}

// ─── IlStubLinker ──────────────────────────────────────────

/// Builds one IL method body out of ordered code streams.
#[derive(Debug)]
pub struct IlStubLinker {
    ctx: Rc<StreamContext>,
    streams: Vec<IlCodeStream>,
    locals: LocalSigBuilder,
    tokens: TokenMap,
    state: LinkState,
    linked: Option<Linked>,
}

impl Default for IlStubLinker {
    fn default() -> Self {
        Self::new(IlStubOptions::default())
    }
}

impl IlStubLinker {
    /// An empty linker.
    pub fn new(options: IlStubOptions) -> Self {
        Self {
            ctx: Rc::new(StreamContext {
                options,
                owner: next_owner(),
                next_label: Cell::new(0),
                linked: Cell::new(false),
            }),
            streams: Vec::new(),
            locals: LocalSigBuilder::new(),
            tokens: TokenMap::new(),
            state: LinkState::Building,
            linked: None,
        }
    }

    /// Options given at construction.
    pub fn options(&self) -> IlStubOptions {
        self.ctx.options
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Append a new stream.  It is placed after every existing stream.
    pub fn new_code_stream(&mut self, kind: StreamKind) -> StreamId {
        assert!(!self.ctx.is_linked(), "IlStubLinker: new stream after link");
        let id = StreamId(self.streams.len() as u32);
        self.streams
            .push(IlCodeStream::new(kind, Rc::clone(&self.ctx)));
        id
    }

    /// The stream behind `id`.
    ///
    /// # Panics
    ///
    /// Panics if `id` does not name a stream of this linker.
    pub fn stream(&mut self, id: StreamId) -> &mut IlCodeStream {
        let count = self.streams.len();
        self.streams
            .get_mut(id.0 as usize)
            .unwrap_or_else(|| panic!("stream #{} out of range ({} streams)", id.0, count))
    }

    /// Every stream, in link order.
    pub fn streams(&self) -> &[IlCodeStream] {
        &self.streams
    }

    /// Allocate an unbound label.
    pub fn new_code_label(&self) -> IlCodeLabel {
        self.ctx.new_label()
    }

    /// Declare a local variable, returning its index.
    ///
    /// # Errors
    ///
    /// [`LinkError::ResourceLimitExceeded`] past 65,535 locals.
    pub fn new_local(&mut self, ty: impl Into<SigType>) -> Result<u16, LinkError> {
        self.locals.new_local(ty)
    }

    /// Locals declared so far.
    pub fn locals(&self) -> &LocalSigBuilder {
        &self.locals
    }

    /// Intern a runtime handle as a token.
    ///
    /// # Errors
    ///
    /// See [`TokenMap::get_token`].
    pub fn get_token(&mut self, kind: TokenKind, handle: u64) -> Result<u32, LinkError> {
        self.tokens.get_token(kind, handle)
    }

    /// Tokens handed out so far.
    pub fn tokens(&self) -> &TokenMap {
        &self.tokens
    }

    /// Exception clauses finished so far across all streams.
    pub fn num_eh_clauses(&self) -> usize {
        self.streams.iter().map(|s| s.finished.len()).sum()
    }

    fn expect_state(&self, expected: LinkState) -> Result<(), LinkError> {
        if self.state != expected {
            return Err(LinkError::InvalidState {
                expected,
                found: self.state,
            });
        }
        Ok(())
    }

    fn linked(&self) -> Result<&Linked, LinkError> {
        self.linked.as_ref().ok_or(LinkError::InvalidState {
            expected: LinkState::Linked,
            found: self.state,
        })
    }

    // ── link ───────────────────────────────────────────────

    /// Lower, lay out, check, and resolve every stream.
    ///
    /// # Errors
    ///
    /// - [`LinkError::UnclosedExceptionBlock`] if a stream has open clauses.
    /// - [`LinkError::UnboundLabel`], [`LinkError::LabelAlreadyBound`],
    ///   [`LinkError::ForeignLabel`] for label misuse.
    /// - [`LinkError::StackUnderflow`] if the running depth goes negative.
    /// - [`LinkError::ResourceLimitExceeded`] past `max_instructions`.
    pub fn link(&mut self) -> Result<IlLinkInfo, LinkError> {
        self.expect_state(LinkState::Building)?;
        for stream in &self.streams {
            if !stream.open.is_empty() {
                return Err(LinkError::UnclosedExceptionBlock {
                    stream: stream.kind,
                    open: stream.open.len(),
                });
            }
        }

        let (mut items, label_items) = self.flatten()?;
        let (code_size, passes) = layout(&mut items, &label_items);
        let max_stack = self.count_stack(&items)?;
        resolve_branches(&mut items, &label_items);
        let clauses = self.resolve_clauses(&items, &label_items)?;

        log::debug!(
            "IlStubLinker: linked {} stream(s): code={} maxstack={} clauses={} passes={}",
            self.streams.len(),
            code_size,
            max_stack,
            clauses.len(),
            passes
        );
        let info = IlLinkInfo {
            code_size,
            max_stack,
            num_eh_clauses: clauses.len(),
            passes,
        };
        self.linked = Some(Linked {
            items,
            label_items,
            code_size,
            max_stack,
            clauses,
        });
        self.ctx.linked.set(true);
        self.state = LinkState::Linked;
        Ok(info)
    }

    /// Pass 1a: concatenate the streams, lower every instruction, and record
    /// where each label is bound.
    fn flatten(&self) -> Result<(Vec<FlatItem>, Vec<Option<usize>>), LinkError> {
        let label_count = self.ctx.next_label.get() as usize;
        let relaxed = self.ctx.options.branch_form == BranchForm::Relaxed;
        let max_instructions = self.ctx.options.max_instructions;

        let mut items = Vec::new();
        let mut label_items: Vec<Option<usize>> = vec![None; label_count];
        let mut instructions = 0usize;

        for (index, stream) in self.streams.iter().enumerate() {
            for item in &stream.items {
                match item {
                    StreamItem::Instruction(ins) => {
                        instructions += 1;
                        if instructions > max_instructions {
                            return Err(LinkError::ResourceLimitExceeded {
                                resource: String::from("instructions"),
                                limit: max_instructions,
                            });
                        }
                        if let Some(t) = ins
                            .arg
                            .targets()
                            .iter()
                            .find(|t| t.0 as usize >= label_count || !self.ctx.owns(**t))
                        {
                            return Err(LinkError::ForeignLabel { label: t.0 });
                        }
                        let mut opcode = ins.lowered();
                        if relaxed {
                            opcode = opcode.short_form().unwrap_or(opcode);
                        }
                        if opcode != ins.opcode {
                            log::trace!("IlStubLinker: lower {} -> {}", ins.opcode, opcode);
                        }
                        items.push(FlatItem {
                            stream: index,
                            offset: 0,
                            kind: FlatKind::Instr {
                                opcode,
                                arg: ins.arg.clone(),
                                delta: ins.stack_delta,
                                resolved: Resolved::None,
                            },
                        });
                    }
                    StreamItem::Label { label, stack_delta } => {
                        let slot = label_items
                            .get_mut(label.0 as usize)
                            .filter(|_| self.ctx.owns(*label))
                            .ok_or(LinkError::ForeignLabel { label: label.0 })?;
                        if slot.is_some() {
                            return Err(LinkError::LabelAlreadyBound { label: label.0 });
                        }
                        *slot = Some(items.len());
                        items.push(FlatItem {
                            stream: index,
                            offset: 0,
                            kind: FlatKind::Mark {
                                label: *label,
                                delta: *stack_delta,
                            },
                        });
                    }
                }
            }
        }

        for item in &items {
            if let FlatKind::Instr { arg, .. } = &item.kind {
                if let Some(t) = arg.targets().iter().find(|t| label_items[t.0 as usize].is_none()) {
                    return Err(LinkError::UnboundLabel { label: t.0 });
                }
            }
        }
        Ok((items, label_items))
    }

    /// Pass 1b: the running stack depth over the concatenated streams.
    ///
    /// Depth is tracked in `i64`; a maximum beyond `u32` is reported as a
    /// resource limit.
    fn count_stack(&self, items: &[FlatItem]) -> Result<u32, LinkError> {
        let mut depth = 0i64;
        let mut max = 0i64;
        for item in items {
            depth += i64::from(item.delta());
            if depth < 0 {
                return Err(LinkError::StackUnderflow {
                    offset: item.offset,
                    stream: self.streams[item.stream].kind,
                    // previous depth >= 0 and delta >= -65536
                    depth: depth as i32,
                });
            }
            max = max.max(depth);
        }
        u32::try_from(max).map_err(|_| LinkError::ResourceLimitExceeded {
            resource: String::from("max stack"),
            limit: u32::MAX as usize,
        })
    }

    fn resolve_clauses(
        &self,
        items: &[FlatItem],
        label_items: &[Option<usize>],
    ) -> Result<Vec<EhClause>, LinkError> {
        let offset_of = |label: IlCodeLabel| -> Result<u32, LinkError> {
            label_items
                .get(label.0 as usize)
                .copied()
                .flatten()
                .map(|index| items[index].offset)
                .ok_or(LinkError::UnboundLabel { label: label.0 })
        };
        let mut clauses = Vec::with_capacity(self.num_eh_clauses());
        for stream in &self.streams {
            for c in &stream.finished {
                let try_begin = offset_of(c.try_begin)?;
                let try_end = offset_of(c.try_end)?;
                let handler_begin = offset_of(c.handler_begin)?;
                let handler_end = offset_of(c.handler_end)?;
                clauses.push(EhClause {
                    kind: c.kind,
                    try_offset: try_begin,
                    try_length: try_end - try_begin,
                    handler_offset: handler_begin,
                    handler_length: handler_end - handler_begin,
                    class_token: c.class_token,
                });
            }
        }
        Ok(clauses)
    }

    // ── results ────────────────────────────────────────────

    /// Bytes of IL, once linked.
    pub fn code_size(&self) -> Option<u32> {
        self.linked.as_ref().map(|l| l.code_size)
    }

    /// Maximum stack depth, once linked.
    pub fn max_stack(&self) -> Option<u32> {
        self.linked.as_ref().map(|l| l.max_stack)
    }

    /// Resolved offset of `label`, once linked.
    pub fn label_offset(&self, label: IlCodeLabel) -> Option<u32> {
        let linked = self.linked.as_ref()?;
        if !self.ctx.owns(label) {
            return None;
        }
        let index = (*linked.label_items.get(label.0 as usize)?)?;
        Some(linked.items[index].offset)
    }

    /// Resolved exception clauses, once linked.  Clauses of each stream
    /// appear innermost first, streams in link order.
    pub fn eh_clauses(&self) -> Option<&[EhClause]> {
        self.linked.as_ref().map(|l| l.clauses.as_slice())
    }

    /// Write the IL bytes into `out`, returning the number written.
    ///
    /// # Errors
    ///
    /// [`LinkError::InvalidState`] unless linked and not yet emitted,
    /// [`LinkError::BufferTooSmall`] if `out` is shorter than the code.
    pub fn generate_code(&mut self, out: &mut [u8]) -> Result<usize, LinkError> {
        self.expect_state(LinkState::Linked)?;
        let linked = self.linked()?;
        let size = linked.code_size as usize;
        if out.len() < size {
            return Err(LinkError::BufferTooSmall {
                needed: size,
                available: out.len(),
            });
        }
        let mut pos = 0;
        for item in &linked.items {
            if let FlatKind::Instr {
                opcode,
                arg,
                resolved,
                ..
            } = &item.kind
            {
                pos += encode(*opcode, arg, resolved, &mut out[pos..]);
            }
        }
        debug_assert_eq!(pos, size);
        self.state = LinkState::Emitted;
        Ok(size)
    }

    /// Copy the flattened exception table into `out`, returning the number
    /// of clauses written.
    ///
    /// # Errors
    ///
    /// [`LinkError::InvalidState`] before linking,
    /// [`LinkError::BufferTooSmall`] if `out` has too few entries.
    pub fn write_eh_clauses(&self, out: &mut [EhClause]) -> Result<usize, LinkError> {
        let clauses = &self.linked()?.clauses;
        if out.len() < clauses.len() {
            return Err(LinkError::BufferTooSmall {
                needed: clauses.len(),
                available: out.len(),
            });
        }
        out[..clauses.len()].copy_from_slice(clauses);
        Ok(clauses.len())
    }

    /// Link (if needed), generate the code, and package everything.
    ///
    /// # Errors
    ///
    /// Any error of [`IlStubLinker::link`] or [`IlStubLinker::generate_code`],
    /// or a signature encoding error.
    pub fn build(mut self) -> Result<IlStub, LinkError> {
        if self.state == LinkState::Building {
            self.link()?;
        }
        let size = self.linked()?.code_size as usize;
        let mut code = vec![0u8; size];
        self.generate_code(&mut code)?;
        let local_signature = self.locals.build()?;
        let linked = self.linked.take().ok_or(LinkError::InvalidState {
            expected: LinkState::Linked,
            found: self.state,
        })?;
        let kinds: Vec<StreamKind> = self.streams.iter().map(|s| s.kind).collect();
        let listing = body::render_listing(&linked.items, &kinds);
        Ok(IlStub::new(
            code,
            linked.max_stack,
            linked.clauses,
            local_signature,
            self.tokens,
            listing,
        ))
    }
}

/// Assign offsets; with short branches present, widen the ones that do
/// not reach and repeat.  Returns `(code_size, passes)`.
fn layout(items: &mut [FlatItem], label_items: &[Option<usize>]) -> (u32, u32) {
    let mut passes = 0;
    loop {
        passes += 1;
        let mut offset = 0u32;
        for item in items.iter_mut() {
            item.offset = offset;
            offset += item.size();
        }

        let mut changed = false;
        for i in 0..items.len() {
            let (opcode, target) = match &items[i].kind {
                FlatKind::Instr {
                    opcode,
                    arg: IlArg::Label(target),
                    ..
                } if opcode.operand() == OperandKind::ShortBrTarget => (*opcode, *target),
                _ => continue,
            };
            let end = items[i].offset + opcode.size();
            let disp = label_position(items, label_items, target) as i64 - end as i64;
            if i8::try_from(disp).is_ok() {
                continue;
            }
            let long = opcode.long_form().unwrap_or(opcode);
            log::trace!(
                "IlStubLinker: pass {}: widen {} -> {} at IL_{:04x} (disp {})",
                passes,
                opcode,
                long,
                items[i].offset,
                disp
            );
            if let FlatKind::Instr { opcode, .. } = &mut items[i].kind {
                *opcode = long;
            }
            changed = true;
        }

        if !changed {
            return (offset, passes);
        }
    }
}

/// Pass 2: displacement = target − end of the branch instruction.
fn resolve_branches(items: &mut [FlatItem], label_items: &[Option<usize>]) {
    for i in 0..items.len() {
        let end = items[i].offset + items[i].size();
        let disp = |label: IlCodeLabel| label_position(items, label_items, label) as i64 - end as i64;
        let resolved = match &items[i].kind {
            FlatKind::Instr {
                arg: IlArg::Label(target),
                ..
            } => Resolved::Branch(disp(*target) as i32),
            FlatKind::Instr {
                arg: IlArg::Switch(targets),
                ..
            } => Resolved::Switch(targets.iter().map(|&t| disp(t) as i32).collect()),
            _ => continue,
        };
        if let FlatKind::Instr { resolved: slot, .. } = &mut items[i].kind {
            *slot = resolved;
        }
    }
}

/// Write one instruction, returning its size.
fn encode(opcode: Opcode, arg: &IlArg, resolved: &Resolved, out: &mut [u8]) -> usize {
    let mut pos = opcode.write(out);
    match (opcode.operand(), resolved) {
        (OperandKind::Switch, Resolved::Switch(disps)) => {
            out[pos..pos + 4].copy_from_slice(&(disps.len() as u32).to_le_bytes());
            pos += 4;
            for d in disps {
                out[pos..pos + 4].copy_from_slice(&d.to_le_bytes());
                pos += 4;
            }
        }
        (kind, resolved) => {
            let value = match resolved {
                Resolved::Branch(d) => *d as i64,
                _ => arg.raw(),
            };
            let n = kind.size() as usize;
            out[pos..pos + n].copy_from_slice(&value.to_le_bytes()[..n]);
            pos += n;
        }
    }
    pos
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linker() -> IlStubLinker {
        IlStubLinker::new(IlStubOptions::default())
    }

    fn code_of(il: &mut IlStubLinker) -> Vec<u8> {
        let info = il.link().unwrap();
        let mut code = vec![0u8; info.code_size as usize];
        il.generate_code(&mut code).unwrap();
        code
    }

    #[test]
    fn lowers_constants_and_args() {
        let mut il = linker();
        let s = il.new_code_stream(StreamKind::Marshal);
        il.stream(s)
            .emit_ldarg(0)
            .emit_ldc(5)
            .emit_add()
            .emit_ldc(100)
            .emit_add()
            .emit_ldc(1000)
            .emit_add()
            .emit_ret();
        assert_eq!(
            code_of(&mut il),
            [0x02, 0x1B, 0x58, 0x1F, 100, 0x58, 0x20, 0xE8, 0x03, 0x00, 0x00, 0x58, 0x2A]
        );
        assert_eq!(il.max_stack(), Some(2));
    }

    #[test]
    fn has_this_shifts_arguments() {
        let mut il = IlStubLinker::new(IlStubOptions {
            has_this: true,
            ..IlStubOptions::default()
        });
        let s = il.new_code_stream(StreamKind::Setup);
        il.stream(s).emit_load_this().emit_ldarg(0).emit_ldarg(2).emit_pop().emit_pop().emit_pop().emit_ret();
        let code = code_of(&mut il);
        assert_eq!(&code[..4], &[0x02, 0x03, 0x05, 0x26]);
    }

    #[test]
    fn long_branch_forward_and_backward() {
        let mut il = linker();
        let s = il.new_code_stream(StreamKind::Dispatch);
        let top = il.new_code_label();
        let done = il.new_code_label();
        il.stream(s)
            .emit_label(top)
            .emit_nop()
            .emit_br(done)
            .emit_br(top)
            .emit_label(done)
            .emit_ret();
        let code = code_of(&mut il);
        // nop; br +5; br -11; ret
        assert_eq!(
            code,
            [0x00, 0x38, 5, 0, 0, 0, 0x38, 0xF5, 0xFF, 0xFF, 0xFF, 0x2A]
        );
        assert_eq!(il.label_offset(done), Some(11));
    }

    #[test]
    fn relaxed_branches_shrink() {
        let mut il = IlStubLinker::new(IlStubOptions {
            branch_form: BranchForm::Relaxed,
            ..IlStubOptions::default()
        });
        let s = il.new_code_stream(StreamKind::Dispatch);
        let near = il.new_code_label();
        let far = il.new_code_label();
        il.stream(s).emit_br(near).emit_label(near).emit_br(far);
        for _ in 0..200 {
            il.stream(s).emit_nop();
        }
        il.stream(s).emit_label(far).emit_ret();
        let info = il.link().unwrap();
        assert_eq!(info.passes, 2);
        // br.s (2) + br (5) + 200 nops + ret
        assert_eq!(info.code_size, 2 + 5 + 200 + 1);
        let mut code = vec![0u8; info.code_size as usize];
        il.generate_code(&mut code).unwrap();
        assert_eq!(&code[..7], &[0x2B, 0x00, 0x38, 200, 0, 0, 0]);
    }

    #[test]
    fn switch_targets_relative_to_end() {
        let mut il = linker();
        let s = il.new_code_stream(StreamKind::Dispatch);
        let a = il.new_code_label();
        let b = il.new_code_label();
        il.stream(s)
            .emit_ldarg(0)
            .emit_switch(&[a, b])
            .emit_label(a)
            .emit_nop()
            .emit_label(b)
            .emit_ret();
        let code = code_of(&mut il);
        // ldarg.0; switch(2) +0 +1; nop; ret
        assert_eq!(
            code,
            [0x02, 0x45, 2, 0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0, 0x00, 0x2A]
        );
    }

    #[test]
    fn streams_concatenate_in_creation_order() {
        let mut il = linker();
        let cleanup = il.new_code_stream(StreamKind::Cleanup);
        let setup = il.new_code_stream(StreamKind::Setup);
        il.stream(setup).emit_ret();
        il.stream(cleanup).emit_nop();
        assert_eq!(code_of(&mut il), [0x00, 0x2A]);
    }

    #[test]
    fn branch_across_streams() {
        let mut il = linker();
        let first = il.new_code_stream(StreamKind::Marshal);
        let second = il.new_code_stream(StreamKind::Cleanup);
        let target = il.stream(second).new_code_label();
        il.stream(first).emit_br(target).emit_nop();
        il.stream(second).emit_label(target).emit_ret();
        let code = code_of(&mut il);
        assert_eq!(&code[..5], &[0x38, 1, 0, 0, 0]);
    }

    #[test]
    fn stack_underflow_is_reported() {
        let mut il = linker();
        let s = il.new_code_stream(StreamKind::Unmarshal);
        il.stream(s).emit_ldc(1).emit_add().emit_add();
        assert_eq!(
            il.link().unwrap_err(),
            LinkError::StackUnderflow {
                offset: 2,
                stream: StreamKind::Unmarshal,
                depth: -1,
            }
        );
    }

    #[test]
    fn call_arity_beyond_i16_is_counted_exactly() {
        let mut il = linker();
        let s = il.new_code_stream(StreamKind::Dispatch);
        il.stream(s).emit_call(0x0600_0001, 40000, 0).emit_ret();
        assert_eq!(
            il.link().unwrap_err(),
            LinkError::StackUnderflow {
                offset: 0,
                stream: StreamKind::Dispatch,
                depth: -40000,
            }
        );

        let mut il = linker();
        let s = il.new_code_stream(StreamKind::Dispatch);
        il.stream(s).emit_newobj(0x0600_0002, 32768);
        assert!(matches!(
            il.link(),
            Err(LinkError::StackUnderflow { depth: -32767, .. })
        ));
    }

    #[test]
    fn deep_stacks_do_not_overflow() {
        let mut il = linker();
        let s = il.new_code_stream(StreamKind::Dispatch);
        for _ in 0..65540 {
            il.stream(s).emit_call(0x0600_0001, 0, 32767);
        }
        let info = il.link().unwrap();
        assert_eq!(info.max_stack, 65540 * 32767);
        assert!(info.max_stack > i32::MAX as u32);

        let mut il = linker();
        let s = il.new_code_stream(StreamKind::Dispatch);
        for _ in 0..65538 {
            il.stream(s).emit_call(0x0600_0001, 0, u16::MAX);
        }
        assert!(matches!(
            il.link(),
            Err(LinkError::ResourceLimitExceeded { ref resource, .. }) if resource == "max stack"
        ));
    }

    #[test]
    fn unbound_and_double_bound_labels() {
        let mut il = linker();
        let s = il.new_code_stream(StreamKind::Dispatch);
        let l = il.new_code_label();
        il.stream(s).emit_br(l);
        assert_eq!(il.link().unwrap_err(), LinkError::UnboundLabel { label: l.id() });

        let mut il = linker();
        let s = il.new_code_stream(StreamKind::Dispatch);
        let l = il.new_code_label();
        il.stream(s).emit_label(l).emit_nop().emit_label(l);
        assert_eq!(
            il.link().unwrap_err(),
            LinkError::LabelAlreadyBound { label: l.id() }
        );
    }

    #[test]
    fn foreign_label_rejected() {
        let other = linker();
        other.new_code_label();
        let foreign = other.new_code_label();
        let mut il = linker();
        let s = il.new_code_stream(StreamKind::Dispatch);
        il.stream(s).emit_br(foreign);
        assert_eq!(il.link().unwrap_err(), LinkError::ForeignLabel { label: 1 });
    }

    #[test]
    fn foreign_label_with_local_id_rejected() {
        let other = linker();
        let foreign = other.new_code_label();
        let mut il = linker();
        let own = il.new_code_label();
        assert_eq!(own.id(), foreign.id());
        let s = il.new_code_stream(StreamKind::Dispatch);
        il.stream(s).emit_label(own).emit_br(foreign);
        assert_eq!(il.link().unwrap_err(), LinkError::ForeignLabel { label: 0 });

        let mut il = linker();
        il.new_code_label();
        let s = il.new_code_stream(StreamKind::Dispatch);
        il.stream(s).emit_label(foreign).emit_ret();
        assert_eq!(il.link().unwrap_err(), LinkError::ForeignLabel { label: 0 });
    }

    #[test]
    fn unclosed_try_is_reported() {
        let mut il = linker();
        let s = il.new_code_stream(StreamKind::Cleanup);
        il.stream(s).begin_try_block().emit_nop();
        assert_eq!(
            il.link().unwrap_err(),
            LinkError::UnclosedExceptionBlock {
                stream: StreamKind::Cleanup,
                open: 1,
            }
        );
    }

    #[test]
    fn try_finally_clause() {
        let mut il = linker();
        let s = il.new_code_stream(StreamKind::Dispatch);
        let after = il.new_code_label();
        let st = il.stream(s);
        st.begin_try_block().emit_nop().emit_leave(after);
        st.end_try_block().unwrap();
        st.begin_finally_block().unwrap().emit_endfinally();
        st.end_finally_block().unwrap();
        st.emit_label(after).emit_ret();
        il.link().unwrap();
        let mut table = [EhClause {
            kind: EhClauseKind::Catch,
            try_offset: 0,
            try_length: 0,
            handler_offset: 0,
            handler_length: 0,
            class_token: 0,
        }; 1];
        assert_eq!(il.write_eh_clauses(&mut table).unwrap(), 1);
        assert_eq!(
            table[0],
            EhClause {
                kind: EhClauseKind::Finally,
                try_offset: 0,
                try_length: 6,
                handler_offset: 6,
                handler_length: 1,
                class_token: 0,
            }
        );
        assert_eq!(il.label_offset(after), Some(7));
    }

    #[test]
    fn mismatched_handler_end() {
        let mut il = linker();
        let s = il.new_code_stream(StreamKind::Dispatch);
        let st = il.stream(s);
        st.begin_try_block();
        st.end_try_block().unwrap();
        st.begin_catch_block(0x0200_0001).unwrap();
        let err = st.end_finally_block().unwrap_err();
        assert!(matches!(err, LinkError::ExceptionBlockMismatch { .. }));
        // the catch is still open and can be closed properly
        st.emit_pop();
        st.end_catch_block().unwrap();
        assert_eq!(st.open_exception_blocks(), 0);
    }

    #[test]
    fn lifecycle_and_buffers() {
        let mut il = linker();
        let s = il.new_code_stream(StreamKind::Dispatch);
        il.stream(s).emit_nop().emit_ret();
        assert!(il.generate_code(&mut [0u8; 8]).is_err());
        il.link().unwrap();
        assert!(matches!(il.link(), Err(LinkError::InvalidState { .. })));
        let err = il.generate_code(&mut [0u8; 1]).unwrap_err();
        assert_eq!(
            err,
            LinkError::BufferTooSmall {
                needed: 2,
                available: 1
            }
        );
        assert_eq!(il.generate_code(&mut [0u8; 8]).unwrap(), 2);
        assert_eq!(il.state(), LinkState::Emitted);
    }

    #[test]
    #[should_panic(expected = "emit after link")]
    fn emit_after_link_panics() {
        let mut il = linker();
        let s = il.new_code_stream(StreamKind::Dispatch);
        il.stream(s).emit_ret();
        il.link().unwrap();
        il.stream(s).emit_nop();
    }

    #[test]
    fn instruction_limit() {
        let mut il = IlStubLinker::new(IlStubOptions {
            max_instructions: 2,
            ..IlStubOptions::default()
        });
        let s = il.new_code_stream(StreamKind::Dispatch);
        il.stream(s).emit_nop().emit_nop().emit_nop();
        assert!(matches!(
            il.link(),
            Err(LinkError::ResourceLimitExceeded { .. })
        ));
    }

    #[test]
    fn clear_code_discards_stream() {
        let mut il = linker();
        let s = il.new_code_stream(StreamKind::Marshal);
        il.stream(s).emit_ldc(1).begin_try_block();
        il.stream(s).clear_code();
        il.stream(s).emit_ret();
        assert_eq!(code_of(&mut il), [0x2A]);
    }

    #[test]
    fn float_constants_keep_bits() {
        let mut il = linker();
        let s = il.new_code_stream(StreamKind::Dispatch);
        let nan = f64::from_bits(0x7FF8_0000_0000_0001);
        il.stream(s).emit_ldc_r8(nan).emit_ldc_r4(1.5).emit_pop().emit_pop();
        let code = code_of(&mut il);
        assert_eq!(code[0], 0x23);
        assert_eq!(&code[1..9], &0x7FF8_0000_0000_0001u64.to_le_bytes());
        assert_eq!(code[9], 0x22);
        assert_eq!(&code[10..14], &1.5f32.to_bits().to_le_bytes());
    }
}
