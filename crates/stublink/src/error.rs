//! Error type shared by the native and IL linkers.

use alloc::string::String;
use core::fmt;

use crate::format::RefSize;
use crate::il::StreamKind;

/// Lifecycle state of a linker instance.
///
/// Transitions are one-way: `Building → Linked → Emitted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum LinkState {
    /// Emit calls are allowed.
    Building,
    /// Offsets are resolved; no further emits.
    Linked,
    /// Final bytes have been produced.
    Emitted,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Building => write!(f, "building"),
            LinkState::Linked => write!(f, "linked"),
            LinkState::Emitted => write!(f, "emitted"),
        }
    }
}

/// Linking error.
///
/// Apart from [`LinkError::OutOfMemory`] and [`LinkError::ResourceLimitExceeded`],
/// every variant reports a defect in the code that drives the linker (a stub
/// generator), never a problem with end-user data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// A label was referenced but never bound to a position.
    UnboundLabel {
        /// Label id.
        label: u32,
    },

    /// A label was bound a second time.
    LabelAlreadyBound {
        /// Label id.
        label: u32,
    },

    /// An external label cannot be bound to a position in the code.
    ExternalLabelBound {
        /// Label id.
        label: u32,
    },

    /// A label handle that was not created by this linker.
    ForeignLabel {
        /// Label id.
        label: u32,
    },

    /// No width allowed by the instruction format can encode the fixup.
    UnreachableTarget {
        /// Target label id.
        label: u32,
        /// Widest size that was tried.
        size: RefSize,
        /// Displacement or address that could not be encoded.
        value: i64,
    },

    /// An operation was called in the wrong lifecycle state.
    InvalidState {
        /// The state the operation requires.
        expected: LinkState,
        /// The state the linker is in.
        found: LinkState,
    },

    /// The running operand-stack depth went negative.
    StackUnderflow {
        /// IL offset of the instruction that underflowed.
        offset: u32,
        /// Stream the instruction belongs to.
        stream: StreamKind,
        /// Depth after the instruction.
        depth: i32,
    },

    /// A stream was linked while a try/catch/finally block was still open.
    UnclosedExceptionBlock {
        /// Stream with the open block.
        stream: StreamKind,
        /// Number of unfinished clause builders.
        open: usize,
    },

    /// A Begin/End exception-block call arrived out of order.
    ExceptionBlockMismatch {
        /// What went wrong.
        detail: String,
    },

    /// A caller-supplied buffer is too short.
    BufferTooSmall {
        /// Bytes or entries needed.
        needed: usize,
        /// Bytes or entries provided.
        available: usize,
    },

    /// Memory for the stub could not be reserved.
    OutOfMemory {
        /// Requested size in bytes.
        requested: usize,
    },

    /// A configured limit was exceeded.
    ResourceLimitExceeded {
        /// Name of the resource (e.g. "labels", "code bytes").
        resource: String,
        /// The configured limit.
        limit: usize,
    },

    /// An instruction format rejected a final fixup value.
    InvalidEncoding {
        /// What the format could not encode.
        detail: String,
    },
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkError::UnboundLabel { label } => {
                write!(f, "label #{} is referenced but never bound", label)
            }
            LinkError::LabelAlreadyBound { label } => {
                write!(f, "label #{} is already bound", label)
            }
            LinkError::ExternalLabelBound { label } => {
                write!(f, "external label #{} cannot be bound to a code position", label)
            }
            LinkError::ForeignLabel { label } => {
                write!(f, "label #{} does not belong to this linker", label)
            }
            LinkError::UnreachableTarget { label, size, value } => {
                write!(
                    f,
                    "fixup to label #{} unreachable even at widest size {} (value={})",
                    label, size, value
                )
            }
            LinkError::InvalidState { expected, found } => {
                write!(f, "linker is {} but must be {}", found, expected)
            }
            LinkError::StackUnderflow {
                offset,
                stream,
                depth,
            } => {
                write!(
                    f,
                    "IL_{:04x} ({}): operand stack underflow (depth {})",
                    offset, stream, depth
                )
            }
            LinkError::UnclosedExceptionBlock { stream, open } => {
                write!(
                    f,
                    "stream '{}' has {} unfinished exception clause(s)",
                    stream, open
                )
            }
            LinkError::ExceptionBlockMismatch { detail } => {
                write!(f, "malformed exception block: {}", detail)
            }
            LinkError::BufferTooSmall { needed, available } => {
                write!(
                    f,
                    "buffer too small: need {}, have {}",
                    needed, available
                )
            }
            LinkError::OutOfMemory { requested } => {
                write!(f, "out of memory reserving {} bytes", requested)
            }
            LinkError::ResourceLimitExceeded { resource, limit } => {
                write!(
                    f,
                    "resource limit exceeded: {} (limit: {})",
                    resource, limit
                )
            }
            LinkError::InvalidEncoding { detail } => {
                write!(f, "invalid encoding: {}", detail)
            }
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for LinkError {}
