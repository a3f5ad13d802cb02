//! Native stub linker: code runs, labels, width relaxation, and emission.
//!
//! A caller appends raw bytes and relocatable instructions ([`LabelRef`]s)
//! in order.  [`StubLinker::calculate_size`] grows every reference from its
//! smallest allowed width until all of them reach their targets (monotonic
//! growth, so the loop always terminates), then [`StubLinker::emit_stub`]
//! writes the final bytes into a block taken from a [`StubHeap`].

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::error::{LinkError, LinkState};
use crate::format::{EmitSite, Fixup, InstructionFormat, Reach, RefSize};
use crate::stub::{AppliedFixup, Stub, StubFlags, StubHeap};

/// Capacity of one [`CodeRun`] chunk.
pub const CODE_RUN_SIZE: usize = 32;

// ─── Options ───────────────────────────────────────────────

/// Configuration for a [`StubLinker`].
///
/// # Examples
///
/// ```rust
/// use stublink::{StubLinker, StubLinkerOptions};
///
/// let mut sl = StubLinker::new();
/// sl.options(StubLinkerOptions {
///     pointer_width: 4,
///     ..StubLinkerOptions::default()
/// });
/// sl.emit_ptr(0xDEAD_BEEF);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StubLinkerOptions {
    /// Alignment of the trailing data blob (power of two).  Default: 8.
    pub data_alignment: u32,
    /// Byte width written by [`StubLinker::emit_ptr`] (4 or 8).  Default: 8.
    pub pointer_width: u8,
    /// Maximum total stub size in bytes.  Default: 16 MiB.
    pub max_code_bytes: usize,
    /// Maximum number of labels.  Default: 100,000.
    pub max_labels: usize,
}

impl Default for StubLinkerOptions {
    fn default() -> Self {
        Self {
            data_alignment: 8,
            pointer_width: 8,
            max_code_bytes: 16 * 1024 * 1024,
            max_labels: 100_000,
        }
    }
}

/// Source of the per-linker ids stamped into label handles.
static NEXT_OWNER: AtomicU32 = AtomicU32::new(1);

pub(crate) fn next_owner() -> u32 {
    NEXT_OWNER.fetch_add(1, Ordering::Relaxed)
}

// ─── Labels ────────────────────────────────────────────────

/// Handle to a label owned by a [`StubLinker`].
///
/// The handle records which linker created it; any other linker rejects it
/// with [`LinkError::ForeignLabel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CodeLabel(u32, u32);

impl CodeLabel {
    /// Numeric id, unique within its linker.
    pub fn id(self) -> u32 {
        self.0
    }
}

#[derive(Debug, Clone, Copy)]
enum LabelKind {
    /// Bound (once) to `local_offset` bytes into the code run at `element`.
    Internal(Option<LabelSite>),
    External(u64),
}

#[derive(Debug, Clone, Copy)]
struct LabelSite {
    element: usize,
    local_offset: u32,
}

#[derive(Debug, Clone, Copy)]
struct LabelDef {
    kind: LabelKind,
    absolute: bool,
}

// ─── Code elements ─────────────────────────────────────────

/// A fixed-capacity chunk of raw bytes.
#[derive(Clone)]
pub struct CodeRun {
    data: [u8; CODE_RUN_SIZE],
    len: u8,
}

impl CodeRun {
    const fn new() -> Self {
        Self {
            data: [0; CODE_RUN_SIZE],
            len: 0,
        }
    }

    #[inline]
    fn remaining(&self) -> usize {
        CODE_RUN_SIZE - self.len as usize
    }

    /// Copy as much of `bytes` as fits; returns how many were taken.
    #[inline]
    fn fill(&mut self, bytes: &[u8]) -> usize {
        let take = bytes.len().min(self.remaining());
        let start = self.len as usize;
        self.data[start..start + take].copy_from_slice(&bytes[..take]);
        self.len += take as u8;
        take
    }

    /// The bytes written so far.
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }
}

impl fmt::Debug for CodeRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.bytes().iter()).finish()
    }
}

/// A relocatable instruction referring to a [`CodeLabel`].
#[derive(Clone, Copy)]
pub struct LabelRef<'f> {
    target: CodeLabel,
    format: &'f dyn InstructionFormat,
    variation: u32,
    size: RefSize,
}

impl fmt::Debug for LabelRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LabelRef")
            .field("target", &self.target)
            .field("format", &self.format)
            .field("variation", &self.variation)
            .field("size", &self.size)
            .finish()
    }
}

#[derive(Debug, Clone)]
enum ElementKind<'f> {
    Run(CodeRun),
    Ref(LabelRef<'f>),
}

/// One entry of the element list, with its layout offsets.
#[derive(Debug, Clone)]
struct CodeElement<'f> {
    kind: ElementKind<'f>,
    /// Offset from the start of the code section.
    global_offset: u32,
    /// Offset into the trailing data blob.
    data_offset: u32,
}

/// Result of [`StubLinker::calculate_size`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StubLayout {
    /// Bytes of machine code.
    pub code_size: u32,
    /// Start of the data blob (code size aligned up).
    pub data_offset: u32,
    /// Bytes of trailing data.
    pub data_size: u32,
    /// Full stub size.
    pub total_size: u32,
    /// Layout passes run before reaching the fixed point.
    pub passes: u32,
}

// ─── StubLinker ────────────────────────────────────────────

/// Builds one native stub.
///
/// # Examples
///
/// ```rust
/// # #[cfg(feature = "x86_64")] {
/// use std::sync::Arc;
/// use stublink::{BumpHeap, StubFlags, StubLinker};
/// use stublink::x86::JMP64;
///
/// let heap = Arc::new(BumpHeap::new(0x10_0000, 0x1_0000));
/// let mut sl = StubLinker::new();
/// let done = sl.new_code_label();
/// sl.emit_label_ref(done, &JMP64, 0);
/// sl.emit8(0xCC);
/// sl.emit_label(done)?;
/// sl.emit8(0xC3);
///
/// let stub = sl.link(heap, StubFlags::NONE)?;
/// assert_eq!(stub.code(), &[0xEB, 0x01, 0xCC, 0xC3]);
/// # }
/// # Ok::<(), stublink::LinkError>(())
/// ```
#[derive(Debug)]
pub struct StubLinker<'f> {
    elements: Vec<CodeElement<'f>>,
    labels: Vec<LabelDef>,
    options: StubLinkerOptions,
    /// Stamped into every label this linker creates.
    owner: u32,
    /// Total bytes appended so far, for the size limit.
    raw_bytes: usize,
    state: LinkState,
    layout: Option<StubLayout>,
}

impl Default for StubLinker<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'f> StubLinker<'f> {
    /// Create an empty linker with default options.
    pub fn new() -> Self {
        Self {
            elements: Vec::new(),
            labels: Vec::new(),
            options: StubLinkerOptions::default(),
            owner: next_owner(),
            raw_bytes: 0,
            state: LinkState::Building,
            layout: None,
        }
    }

    /// Replace the options.
    pub fn options(&mut self, options: StubLinkerOptions) -> &mut Self {
        self.options = options;
        self
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Number of elements (code runs plus label references).
    pub fn element_count(&self) -> usize {
        self.elements.len()
    }

    /// Layout computed by the last [`StubLinker::calculate_size`].
    pub fn layout(&self) -> Option<StubLayout> {
        self.layout
    }

    // ── raw bytes ──────────────────────────────────────────

    /// Append raw bytes.
    ///
    /// # Panics
    ///
    /// Panics if the linker has already been laid out.
    pub fn emit_bytes(&mut self, mut bytes: &[u8]) -> &mut Self {
        self.assert_building();
        self.raw_bytes += bytes.len();
        while !bytes.is_empty() {
            let taken = self.open_run().fill(bytes);
            bytes = &bytes[taken..];
        }
        self
    }

    /// Append one byte.
    pub fn emit8(&mut self, value: u8) -> &mut Self {
        self.emit_bytes(&[value])
    }

    /// Append a little-endian `u16`.
    pub fn emit16(&mut self, value: u16) -> &mut Self {
        self.emit_bytes(&value.to_le_bytes())
    }

    /// Append a little-endian `u32`.
    pub fn emit32(&mut self, value: u32) -> &mut Self {
        self.emit_bytes(&value.to_le_bytes())
    }

    /// Append a little-endian `u64`.
    pub fn emit64(&mut self, value: u64) -> &mut Self {
        self.emit_bytes(&value.to_le_bytes())
    }

    /// Append a pointer-sized value (see [`StubLinkerOptions::pointer_width`]).
    pub fn emit_ptr(&mut self, value: u64) -> &mut Self {
        if self.options.pointer_width == 4 {
            self.emit32(value as u32)
        } else {
            self.emit64(value)
        }
    }

    /// The last code run if it still has room, else a new one.
    fn open_run(&mut self) -> &mut CodeRun {
        let reuse = matches!(
            self.elements.last(),
            Some(CodeElement { kind: ElementKind::Run(run), .. }) if run.remaining() > 0
        );
        if !reuse {
            self.push_run();
        }
        match self.elements.last_mut() {
            Some(CodeElement {
                kind: ElementKind::Run(run),
                ..
            }) => run,
            _ => unreachable!("a code run was just ensured"),
        }
    }

    fn push_run(&mut self) {
        self.elements.push(CodeElement {
            kind: ElementKind::Run(CodeRun::new()),
            global_offset: 0,
            data_offset: 0,
        });
    }

    // ── labels ─────────────────────────────────────────────

    fn new_label(&mut self, kind: LabelKind, absolute: bool) -> CodeLabel {
        let id = self.labels.len() as u32;
        self.labels.push(LabelDef { kind, absolute });
        CodeLabel(id, self.owner)
    }

    /// Allocate an unbound label resolving to a displacement.
    pub fn new_code_label(&mut self) -> CodeLabel {
        self.new_label(LabelKind::Internal(None), false)
    }

    /// Allocate an unbound label resolving to its absolute address.
    pub fn new_absolute_code_label(&mut self) -> CodeLabel {
        self.new_label(LabelKind::Internal(None), true)
    }

    /// A label for a fixed address outside the stub.
    pub fn new_external_code_label(&mut self, address: u64) -> CodeLabel {
        self.new_label(LabelKind::External(address), false)
    }

    /// A label for a fixed address outside the stub, resolving to the
    /// address itself rather than a displacement.
    pub fn new_absolute_external_code_label(&mut self, address: u64) -> CodeLabel {
        self.new_label(LabelKind::External(address), true)
    }

    /// Bind `label` to the current write position.
    ///
    /// # Errors
    ///
    /// [`LinkError::LabelAlreadyBound`] on a second bind,
    /// [`LinkError::ExternalLabelBound`] for external labels,
    /// [`LinkError::ForeignLabel`] for a handle this linker did not create.
    pub fn emit_label(&mut self, label: CodeLabel) -> Result<&mut Self, LinkError> {
        self.expect_state(LinkState::Building)?;
        match self.label_def(label)?.kind {
            LabelKind::External(_) => {
                return Err(LinkError::ExternalLabelBound { label: label.0 })
            }
            LabelKind::Internal(Some(_)) => {
                return Err(LinkError::LabelAlreadyBound { label: label.0 })
            }
            LabelKind::Internal(None) => {}
        }

        let needs_run = !matches!(
            self.elements.last(),
            Some(CodeElement {
                kind: ElementKind::Run(_),
                ..
            })
        );
        if needs_run {
            self.push_run();
        }
        let element = self.elements.len() - 1;
        let local_offset = match &self.elements[element].kind {
            ElementKind::Run(run) => run.len as u32,
            ElementKind::Ref(_) => 0,
        };
        log::trace!(
            "StubLinker: bind label #{} -> element {} +{}",
            label.0,
            element,
            local_offset
        );
        self.labels[label.0 as usize].kind = LabelKind::Internal(Some(LabelSite {
            element,
            local_offset,
        }));
        Ok(self)
    }

    /// Allocate a label and bind it here.
    pub fn emit_new_code_label(&mut self) -> Result<CodeLabel, LinkError> {
        let label = self.new_code_label();
        self.emit_label(label)?;
        Ok(label)
    }

    /// Append a relocatable instruction referring to `target`.
    ///
    /// # Panics
    ///
    /// Panics if the linker has already been laid out, or if `format` allows
    /// no sizes at all.
    pub fn emit_label_ref(
        &mut self,
        target: CodeLabel,
        format: &'f dyn InstructionFormat,
        variation: u32,
    ) -> &mut Self {
        self.assert_building();
        let size = format
            .allowed_sizes()
            .smallest()
            .unwrap_or_else(|| panic!("instruction format {:?} allows no sizes", format));
        self.elements.push(CodeElement {
            kind: ElementKind::Ref(LabelRef {
                target,
                format,
                variation,
                size,
            }),
            global_offset: 0,
            data_offset: 0,
        });
        self
    }

    /// Offset of a bound internal label from the start of the stub.
    /// Available once the linker has been laid out.
    pub fn label_offset(&self, label: CodeLabel) -> Option<u32> {
        if self.state == LinkState::Building {
            return None;
        }
        match self.label_def(label).ok()?.kind {
            LabelKind::Internal(Some(site)) => {
                Some(self.elements[site.element].global_offset + site.local_offset)
            }
            _ => None,
        }
    }

    /// Chosen width of every label reference, in emission order.
    pub fn ref_sizes(&self) -> Vec<RefSize> {
        self.elements
            .iter()
            .filter_map(|e| match &e.kind {
                ElementKind::Ref(r) => Some(r.size),
                ElementKind::Run(_) => None,
            })
            .collect()
    }

    fn label_def(&self, label: CodeLabel) -> Result<&LabelDef, LinkError> {
        self.labels
            .get(label.0 as usize)
            .filter(|_| label.1 == self.owner)
            .ok_or(LinkError::ForeignLabel { label: label.0 })
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

    fn assert_building(&self) {
        assert!(
            self.state == LinkState::Building,
            "StubLinker: emit after layout (state: {})",
            self.state
        );
    }

    // ── layout ─────────────────────────────────────────────

    /// Lay out the stub: choose the width of every label reference and
    /// assign offsets.
    ///
    /// Every reference starts at its format's smallest width.  Each pass
    /// recomputes all offsets, then widens (never narrows) every reference
    /// whose current width cannot reach its target.  The loop stops after a
    /// pass that widens nothing.
    ///
    /// # Errors
    ///
    /// [`LinkError::UnboundLabel`] if a referenced internal label was never
    /// bound, [`LinkError::UnreachableTarget`] if even the widest size cannot
    /// reach, [`LinkError::ResourceLimitExceeded`] on configured limits.
    pub fn calculate_size(&mut self) -> Result<StubLayout, LinkError> {
        self.expect_state(LinkState::Building)?;
        self.check_limits()?;
        self.check_targets()?;

        let mut passes = 0;
        let layout = loop {
            passes += 1;
            let (code_size, data_size) = self.assign_offsets();
            let mut changed = false;

            for i in 0..self.elements.len() {
                let ElementKind::Ref(r) = self.elements[i].kind else {
                    continue;
                };
                let reach = self.reach_of(&r, self.elements[i].global_offset);
                if r.format.can_reach(r.size, r.variation, reach) {
                    continue;
                }
                let next = r.format.allowed_sizes().next_after(r.size).ok_or(
                    LinkError::UnreachableTarget {
                        label: r.target.0,
                        size: r.size,
                        value: reach.value(),
                    },
                )?;
                log::trace!(
                    "StubLinker: pass {}: widen ref to label #{} {} -> {} ({:?})",
                    passes,
                    r.target.0,
                    r.size,
                    next,
                    reach
                );
                if let ElementKind::Ref(r) = &mut self.elements[i].kind {
                    r.size = next;
                }
                changed = true;
            }

            if !changed {
                let align = self.options.data_alignment.max(1);
                let data_offset = code_size.div_ceil(align) * align;
                break StubLayout {
                    code_size,
                    data_offset,
                    data_size,
                    total_size: data_offset + data_size,
                    passes,
                };
            }
        };

        if layout.total_size as usize > self.options.max_code_bytes {
            return Err(LinkError::ResourceLimitExceeded {
                resource: String::from("code bytes"),
                limit: self.options.max_code_bytes,
            });
        }

        log::debug!(
            "StubLinker: layout converged after {} pass(es): code={} data={} total={}",
            layout.passes,
            layout.code_size,
            layout.data_size,
            layout.total_size
        );
        self.state = LinkState::Linked;
        self.layout = Some(layout);
        Ok(layout)
    }

    fn check_limits(&self) -> Result<(), LinkError> {
        if self.labels.len() > self.options.max_labels {
            return Err(LinkError::ResourceLimitExceeded {
                resource: String::from("labels"),
                limit: self.options.max_labels,
            });
        }
        if self.raw_bytes > self.options.max_code_bytes {
            return Err(LinkError::ResourceLimitExceeded {
                resource: String::from("code bytes"),
                limit: self.options.max_code_bytes,
            });
        }
        Ok(())
    }

    /// Every reference must point at an external label or a bound one.
    fn check_targets(&self) -> Result<(), LinkError> {
        for element in &self.elements {
            if let ElementKind::Ref(r) = &element.kind {
                if let LabelKind::Internal(None) = self.label_def(r.target)?.kind {
                    return Err(LinkError::UnboundLabel { label: r.target.0 });
                }
            }
        }
        Ok(())
    }

    /// One linear pass assigning global and data offsets.  Returns
    /// `(code_size, data_size)`.
    fn assign_offsets(&mut self) -> (u32, u32) {
        let mut global = 0u32;
        let mut data = 0u32;
        for element in &mut self.elements {
            element.global_offset = global;
            element.data_offset = data;
            match &element.kind {
                ElementKind::Run(run) => global += run.len as u32,
                ElementKind::Ref(r) => {
                    global += r.format.size_of_instruction(r.size, r.variation);
                    data += r.format.size_of_data(r.size, r.variation);
                }
            }
        }
        (global, data)
    }

    /// Offset of an internal label under the current layout.
    fn internal_offset(&self, site: LabelSite) -> u32 {
        self.elements[site.element].global_offset + site.local_offset
    }

    fn reach_of(&self, r: &LabelRef<'_>, global_offset: u32) -> Reach {
        let def = self.labels[r.target.0 as usize];
        match (def.kind, def.absolute) {
            (LabelKind::Internal(Some(site)), false) => {
                let hot = global_offset + r.format.hot_spot_offset(r.size, r.variation);
                Reach::Relative(self.internal_offset(site) as i64 - hot as i64)
            }
            (LabelKind::Internal(Some(site)), true) => {
                Reach::AbsoluteInternal(self.internal_offset(site) as u64)
            }
            (LabelKind::External(address), false) => Reach::External(address),
            (LabelKind::External(address), true) => Reach::AbsoluteExternal(address),
            (LabelKind::Internal(None), _) => unreachable!("targets are checked before layout"),
        }
    }

    // ── emission ───────────────────────────────────────────

    /// Write the laid-out stub into a block from `heap`.
    ///
    /// Code runs are copied verbatim; every label reference is written by
    /// its format with the final fixup.  Gaps are zero-filled.  The heap's
    /// instruction cache is flushed once over the whole block.
    ///
    /// # Errors
    ///
    /// [`LinkError::InvalidState`] unless laid out and not yet emitted,
    /// [`LinkError::OutOfMemory`] if the heap or buffer cannot be reserved,
    /// or any error returned by an instruction format.
    pub fn emit_stub(&mut self, heap: Arc<dyn StubHeap>, flags: StubFlags) -> Result<Stub, LinkError> {
        self.expect_state(LinkState::Linked)?;
        let layout = self.layout.ok_or(LinkError::InvalidState {
            expected: LinkState::Linked,
            found: self.state,
        })?;

        let total = layout.total_size as usize;
        let mut buffer: Vec<u8> = Vec::new();
        buffer
            .try_reserve_exact(total)
            .map_err(|_| LinkError::OutOfMemory { requested: total })?;
        buffer.resize(total, 0);

        let align = self.options.data_alignment.max(1) as usize;
        let base = heap.allocate(total, align)?;
        let data_base = base + layout.data_offset as u64;

        let (code, data) = buffer.split_at_mut(layout.data_offset as usize);
        let mut fixups = Vec::new();

        for element in &self.elements {
            let start = element.global_offset as usize;
            match &element.kind {
                ElementKind::Run(run) => {
                    code[start..start + run.len as usize].copy_from_slice(run.bytes());
                }
                ElementKind::Ref(r) => {
                    let fixup = self.fixup_for(r, base, element.global_offset);
                    let len = r.format.size_of_instruction(r.size, r.variation) as usize;
                    let data_len = r.format.size_of_data(r.size, r.variation) as usize;
                    let data_start = element.data_offset as usize;
                    let site = EmitSite {
                        code: &mut code[start..start + len],
                        code_address: base + start as u64,
                        data: &mut data[data_start..data_start + data_len],
                        data_address: data_base + data_start as u64,
                    };
                    if let Err(e) = r.format.emit_instruction(r.size, r.variation, fixup, site) {
                        heap.release(base, total);
                        return Err(e);
                    }
                    fixups.push(AppliedFixup {
                        offset: element.global_offset,
                        size: r.size,
                        label: r.target,
                        value: fixup.value(),
                    });
                }
            }
        }

        heap.flush_instruction_cache(base, total);
        log::debug!(
            "StubLinker: emitted {} bytes @ {:#x} ({} fixups)",
            total,
            base,
            fixups.len()
        );
        self.state = LinkState::Emitted;
        Ok(Stub::new(
            heap,
            base,
            total,
            buffer.into_boxed_slice(),
            layout.code_size,
            layout.data_offset,
            flags,
            fixups,
        ))
    }

    fn fixup_for(&self, r: &LabelRef<'_>, base: u64, global_offset: u32) -> Fixup {
        let def = self.labels[r.target.0 as usize];
        let target = match def.kind {
            LabelKind::Internal(Some(site)) => base + self.internal_offset(site) as u64,
            LabelKind::External(address) => address,
            LabelKind::Internal(None) => unreachable!("targets are checked before layout"),
        };
        let hot_spot =
            base + global_offset as u64 + r.format.hot_spot_offset(r.size, r.variation) as u64;
        Fixup {
            target,
            hot_spot,
            absolute: def.absolute,
        }
    }

    /// Lay out and emit in one step.
    ///
    /// # Errors
    ///
    /// See [`StubLinker::calculate_size`] and [`StubLinker::emit_stub`].
    pub fn link(&mut self, heap: Arc<dyn StubHeap>, flags: StubFlags) -> Result<Stub, LinkError> {
        self.calculate_size()?;
        self.emit_stub(heap, flags)
    }

    /// Lay out and emit into a plain buffer placed at `base`, without a heap.
    /// Useful for inspection and tests.
    ///
    /// # Errors
    ///
    /// See [`StubLinker::calculate_size`] and [`StubLinker::emit_stub`].
    pub fn link_at(&mut self, base: u64) -> Result<Box<[u8]>, LinkError> {
        let heap = Arc::new(crate::stub::BumpHeap::new(base, u64::MAX - base));
        let stub = self.link(heap, StubFlags::NONE)?;
        Ok(stub.bytes().into())
    }
}
