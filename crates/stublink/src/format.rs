//! The relocatable-instruction contract between the native linker and an
//! architecture backend.
//!
//! An [`InstructionFormat`] describes one family of instructions that refer to
//! a [`CodeLabel`](crate::CodeLabel): which encoding widths it has, how large
//! each one is, where the relocation is measured from, whether a width can
//! reach a given target, and how to write the final bytes.

use core::fmt;

use crate::error::LinkError;

// ─── RefSize ───────────────────────────────────────────────

/// One encoding width of a relocatable instruction.
///
/// Each size is a single bit, so the set of widths a format allows is a
/// plain bitmask ([`RefSizes`]).  Bits are ordered: a higher bit is always a
/// wider (and never shorter) encoding.  The *meaning* of a level is up to the
/// format: `K8` is a `rel8` branch on x86 but an `imm19` conditional branch
/// on AArch64.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RefSize(u32);

impl RefSize {
    /// Smallest level (typically an 8-bit displacement).
    pub const K8: RefSize = RefSize(1 << 0);
    /// Second level (typically a 16-bit displacement).
    pub const K16: RefSize = RefSize(1 << 1);
    /// Third level (typically a 32-bit displacement).
    pub const K32: RefSize = RefSize(1 << 2);
    /// Widest level (typically a full 64-bit address).
    pub const K64: RefSize = RefSize(1 << 3);

    /// The raw bit.
    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Position of the bit, usable as a table index.
    #[inline]
    pub const fn level(self) -> u32 {
        self.0.trailing_zeros()
    }
}

impl fmt::Debug for RefSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RefSize({})", self)
    }
}

impl fmt::Display for RefSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            RefSize::K8 => write!(f, "k8"),
            RefSize::K16 => write!(f, "k16"),
            RefSize::K32 => write!(f, "k32"),
            RefSize::K64 => write!(f, "k64"),
            RefSize(bits) => write!(f, "k?{:#x}", bits),
        }
    }
}

/// A set of [`RefSize`]s.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RefSizes(u32);

impl RefSizes {
    /// The empty set.
    pub const NONE: RefSizes = RefSizes(0);

    /// Build a set from individual sizes.
    pub const fn of(sizes: &[RefSize]) -> Self {
        let mut bits = 0;
        let mut i = 0;
        while i < sizes.len() {
            bits |= sizes[i].0;
            i += 1;
        }
        RefSizes(bits)
    }

    /// Whether `size` is in the set.
    #[inline]
    pub const fn contains(self, size: RefSize) -> bool {
        self.0 & size.0 != 0
    }

    /// The smallest size in the set.
    #[inline]
    pub fn smallest(self) -> Option<RefSize> {
        (self.0 != 0).then(|| RefSize(self.0 & self.0.wrapping_neg()))
    }

    /// The largest size in the set.
    #[inline]
    pub fn largest(self) -> Option<RefSize> {
        (self.0 != 0).then(|| RefSize(1 << (31 - self.0.leading_zeros())))
    }

    /// The next larger size after `size`, if any.
    #[inline]
    pub fn next_after(self, size: RefSize) -> Option<RefSize> {
        let above = self.0 & !((size.0 << 1).wrapping_sub(1));
        RefSizes(above).smallest()
    }

    /// Number of sizes in the set.
    #[inline]
    pub const fn len(self) -> u32 {
        self.0.count_ones()
    }

    /// Whether the set is empty.
    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Iterate from smallest to largest.
    pub fn iter(self) -> impl Iterator<Item = RefSize> {
        (0..32)
            .map(|bit| RefSize(1 << bit))
            .filter(move |s| self.contains(*s))
    }
}

impl fmt::Debug for RefSizes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

// ─── Reach / Fixup ─────────────────────────────────────────

/// What the linker knows about a fixup while laying out the stub.
///
/// The stub's final address is only known after sizing, so displacements to
/// external addresses and absolute addresses of internal labels can only be
/// judged conservatively at this point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reach {
    /// Displacement from the hot spot to a label inside the stub.
    Relative(i64),
    /// Displacement to an address outside the stub (not yet known).
    External(u64),
    /// Absolute address of a label inside the stub; given as its offset from
    /// the start of the stub.
    AbsoluteInternal(u64),
    /// Absolute address outside the stub.
    AbsoluteExternal(u64),
}

impl Reach {
    /// Whether the label asked for its absolute address.
    #[inline]
    pub fn is_absolute(self) -> bool {
        matches!(self, Reach::AbsoluteInternal(_) | Reach::AbsoluteExternal(_))
    }

    /// Raw value carried by the query (for diagnostics).
    #[inline]
    pub fn value(self) -> i64 {
        match self {
            Reach::Relative(d) => d,
            Reach::External(a) | Reach::AbsoluteInternal(a) | Reach::AbsoluteExternal(a) => {
                a as i64
            }
        }
    }
}

/// A resolved fixup handed to [`InstructionFormat::emit_instruction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fixup {
    /// Final address of the referenced label.
    pub target: u64,
    /// Final address of the instruction's hot spot.
    pub hot_spot: u64,
    /// Whether the label asked for its absolute address.
    pub absolute: bool,
}

impl Fixup {
    /// Signed distance from the hot spot to the target.
    #[inline]
    pub fn displacement(&self) -> i64 {
        self.target.wrapping_sub(self.hot_spot) as i64
    }

    /// The value the label asks for: its address if absolute, otherwise the
    /// displacement from the hot spot.
    #[inline]
    pub fn value(&self) -> i64 {
        if self.absolute {
            self.target as i64
        } else {
            self.displacement()
        }
    }
}

/// Where one relocatable instruction is written.
///
/// `code` and `data` are writable views of exactly the instruction's bytes
/// and its slot in the trailing data blob; `code_address` and `data_address`
/// are the addresses those bytes will execute/be read from.
#[derive(Debug)]
pub struct EmitSite<'a> {
    /// Writable instruction bytes.
    pub code: &'a mut [u8],
    /// Execution address of `code[0]`.
    pub code_address: u64,
    /// Writable data-blob slot (empty when the format needs no data).
    pub data: &'a mut [u8],
    /// Address of `data[0]`.
    pub data_address: u64,
}

// ─── InstructionFormat ─────────────────────────────────────

/// A family of relocatable instructions.
///
/// Implementations are stateless; one value usually lives in a `static` per
/// architecture.  `variation` is a format-private code (condition code,
/// register number, …) passed through from
/// [`StubLinker::emit_label_ref`](crate::StubLinker::emit_label_ref).
pub trait InstructionFormat: fmt::Debug {
    /// Widths this format can be encoded at.
    fn allowed_sizes(&self) -> RefSizes;

    /// Byte size of the instruction at `size`.
    fn size_of_instruction(&self, size: RefSize, variation: u32) -> u32;

    /// Bytes needed in the trailing data blob at `size`.
    fn size_of_data(&self, _size: RefSize, _variation: u32) -> u32 {
        0
    }

    /// Offset within the instruction from which relative fixups are measured.
    ///
    /// Defaults to the end of the instruction.
    fn hot_spot_offset(&self, size: RefSize, variation: u32) -> u32 {
        self.size_of_instruction(size, variation)
    }

    /// Whether the instruction at `size` can encode `reach`.
    fn can_reach(&self, size: RefSize, variation: u32, reach: Reach) -> bool;

    /// Write the final instruction (and data-blob slot, if any).
    fn emit_instruction(
        &self,
        size: RefSize,
        variation: u32,
        fixup: Fixup,
        site: EmitSite<'_>,
    ) -> Result<(), LinkError>;
}

/// Whether `value` fits in a signed field of `bits` bits.
#[inline]
pub(crate) fn fits_signed(value: i64, bits: u32) -> bool {
    let min = -(1i64 << (bits - 1));
    let max = (1i64 << (bits - 1)) - 1;
    (min..=max).contains(&value)
}
