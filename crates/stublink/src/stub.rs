//! Finished native stubs and the heaps they live in.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::error::LinkError;
use crate::format::RefSize;
use crate::linker::CodeLabel;

// ─── StubFlags ─────────────────────────────────────────────

/// Descriptive flags recorded on a [`Stub`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StubFlags(u32);

impl StubFlags {
    /// No flags.
    pub const NONE: StubFlags = StubFlags(0);
    /// Multicast delegate invoke stub.
    pub const MULTICAST: StubFlags = StubFlags(1 << 0);
    /// Argument-shuffling thunk.
    pub const SHUFFLE_THUNK: StubFlags = StubFlags(1 << 1);
    /// Instantiating (generic dictionary passing) stub.
    pub const INSTANTIATING: StubFlags = StubFlags(1 << 2);
    /// Stub carries unwind information.
    pub const UNWIND_INFO: StubFlags = StubFlags(1 << 3);

    /// Raw bits.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Whether every flag in `other` is set.
    pub const fn contains(self, other: StubFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl core::ops::BitOr for StubFlags {
    type Output = StubFlags;
    fn bitor(self, rhs: StubFlags) -> StubFlags {
        StubFlags(self.0 | rhs.0)
    }
}

impl core::ops::BitOrAssign for StubFlags {
    fn bitor_assign(&mut self, rhs: StubFlags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for StubFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (StubFlags::MULTICAST, "MULTICAST"),
            (StubFlags::SHUFFLE_THUNK, "SHUFFLE_THUNK"),
            (StubFlags::INSTANTIATING, "INSTANTIATING"),
            (StubFlags::UNWIND_INFO, "UNWIND_INFO"),
        ];
        let mut set = f.debug_set();
        for (flag, name) in names {
            if self.contains(flag) {
                set.entry(&format_args!("{}", name));
            }
        }
        set.finish()
    }
}

// ─── StubHeap ──────────────────────────────────────────────

/// Address space that finished stubs are placed in.
///
/// The heap hands out addresses; the bytes themselves are owned by the
/// [`Stub`].  A heap is typically shared by every linker in the process.
pub trait StubHeap: Send + Sync + fmt::Debug {
    /// Reserve `size` bytes aligned to `align`, returning the start address.
    fn allocate(&self, size: usize, align: usize) -> Result<u64, LinkError>;

    /// Give back a block previously returned by [`StubHeap::allocate`].
    fn release(&self, address: u64, size: usize);

    /// Called once over the whole written region after emission.
    fn flush_instruction_cache(&self, _address: u64, _len: usize) {}
}

/// A lock-free bump heap over a fixed address range.
///
/// Released blocks are not reused; [`BumpHeap::live_bytes`] tracks how much
/// is still referenced.
#[derive(Debug)]
pub struct BumpHeap {
    base: u64,
    limit: u64,
    next: AtomicU64,
    live: AtomicUsize,
    flushes: AtomicUsize,
}

impl BumpHeap {
    /// A heap covering `[base, base + capacity)`.
    pub fn new(base: u64, capacity: u64) -> Self {
        Self {
            base,
            limit: base.saturating_add(capacity),
            next: AtomicU64::new(base),
            live: AtomicUsize::new(0),
            flushes: AtomicUsize::new(0),
        }
    }

    /// First address of the range.
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Bytes handed out and not yet released.
    pub fn live_bytes(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Bytes consumed from the range, including released blocks.
    pub fn used_bytes(&self) -> u64 {
        self.next.load(Ordering::Acquire) - self.base
    }

    /// Number of instruction-cache flushes requested.
    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::Acquire)
    }
}

impl StubHeap for BumpHeap {
    fn allocate(&self, size: usize, align: usize) -> Result<u64, LinkError> {
        let align = align.max(1) as u64;
        let mut current = self.next.load(Ordering::Relaxed);
        loop {
            let start = current.div_ceil(align) * align;
            let end = start
                .checked_add(size as u64)
                .filter(|&end| end <= self.limit)
                .ok_or(LinkError::OutOfMemory { requested: size })?;
            match self
                .next
                .compare_exchange_weak(current, end, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => {
                    self.live.fetch_add(size, Ordering::AcqRel);
                    return Ok(start);
                }
                Err(observed) => current = observed,
            }
        }
    }

    fn release(&self, _address: u64, size: usize) {
        self.live.fetch_sub(size, Ordering::AcqRel);
    }

    fn flush_instruction_cache(&self, _address: u64, _len: usize) {
        self.flushes.fetch_add(1, Ordering::AcqRel);
    }
}

// ─── Stub ──────────────────────────────────────────────────

/// A fixup as it was written into a finished stub.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AppliedFixup {
    /// Offset of the instruction from the start of the stub.
    pub offset: u32,
    /// Width the instruction was emitted at.
    pub size: RefSize,
    /// Target label.
    pub label: CodeLabel,
    /// The value handed to the format (displacement or absolute address).
    pub value: i64,
}

struct StubBlob {
    heap: Arc<dyn StubHeap>,
    address: u64,
    reserved: usize,
    bytes: Box<[u8]>,
    code_size: u32,
    data_offset: u32,
    flags: StubFlags,
    fixups: Vec<AppliedFixup>,
}

impl Drop for StubBlob {
    fn drop(&mut self) {
        log::trace!("Stub: release {} bytes @ {:#x}", self.reserved, self.address);
        self.heap.release(self.address, self.reserved);
    }
}

/// A finished, immutable, reference-counted native stub.
///
/// `inc_ref` hands out another reference; `dec_ref` drops one.  When the last
/// reference goes away the block is returned to its heap.  A `Stub` is
/// `Send + Sync` and may be shared by concurrently executing callers.
#[derive(Clone)]
pub struct Stub(Arc<StubBlob>);

impl Stub {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        heap: Arc<dyn StubHeap>,
        address: u64,
        reserved: usize,
        bytes: Box<[u8]>,
        code_size: u32,
        data_offset: u32,
        flags: StubFlags,
        fixups: Vec<AppliedFixup>,
    ) -> Self {
        Stub(Arc::new(StubBlob {
            heap,
            address,
            reserved,
            bytes,
            code_size,
            data_offset,
            flags,
            fixups,
        }))
    }

    /// Take another reference.
    pub fn inc_ref(&self) -> Stub {
        self.clone()
    }

    /// Drop this reference.  Returns `true` if it was the last one and the
    /// stub's memory went back to the heap.
    pub fn dec_ref(self) -> bool {
        Arc::into_inner(self.0).is_some()
    }

    /// Current number of references.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    /// Address of the first instruction.
    pub fn entry_point(&self) -> u64 {
        self.0.address
    }

    /// The whole stub: code, alignment padding and trailing data.
    pub fn bytes(&self) -> &[u8] {
        &self.0.bytes
    }

    /// Machine code only.
    pub fn code(&self) -> &[u8] {
        &self.0.bytes[..self.0.code_size as usize]
    }

    /// Trailing data blob.
    pub fn data(&self) -> &[u8] {
        &self.0.bytes[self.0.data_offset as usize..]
    }

    /// Size of the machine code in bytes.
    pub fn code_size(&self) -> u32 {
        self.0.code_size
    }

    /// Offset of the data blob from the start of the stub.
    pub fn data_offset(&self) -> u32 {
        self.0.data_offset
    }

    /// Total size in bytes.
    pub fn len(&self) -> usize {
        self.0.bytes.len()
    }

    /// Whether the stub is empty.
    pub fn is_empty(&self) -> bool {
        self.0.bytes.is_empty()
    }

    /// Flags given at link time.
    pub fn flags(&self) -> StubFlags {
        self.0.flags
    }

    /// Every fixup written into the stub, in emission order.
    pub fn fixups(&self) -> &[AppliedFixup] {
        &self.0.fixups
    }
}

impl fmt::Debug for Stub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stub")
            .field("entry_point", &format_args!("{:#x}", self.0.address))
            .field("code_size", &self.0.code_size)
            .field("len", &self.0.bytes.len())
            .field("flags", &self.0.flags)
            .field("refs", &self.ref_count())
            .finish()
    }
}
