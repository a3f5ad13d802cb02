//! Local-variable and method signature blobs.
//!
//! Signatures use the ECMA-335 binary layout: element-type bytes, compressed
//! unsigned integers for counts, and `TypeDefOrRef` coded indices for class
//! and value types.

use alloc::boxed::Box;
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use crate::error::LinkError;

/// Largest value a compressed unsigned integer can hold.
pub const MAX_COMPRESSED: u32 = 0x1FFF_FFFF;

/// Append `value` as a compressed unsigned integer (1, 2 or 4 bytes,
/// big-endian with a length tag in the top bits).
///
/// # Errors
///
/// [`LinkError::InvalidEncoding`] if `value` exceeds [`MAX_COMPRESSED`].
pub fn write_compressed_u32(value: u32, out: &mut Vec<u8>) -> Result<(), LinkError> {
    match value {
        0..=0x7F => out.push(value as u8),
        0x80..=0x3FFF => out.extend_from_slice(&(0x8000 | value as u16).to_be_bytes()),
        0x4000..=MAX_COMPRESSED => out.extend_from_slice(&(0xC000_0000 | value).to_be_bytes()),
        _ => {
            return Err(LinkError::InvalidEncoding {
                detail: format!("{:#x} does not fit a compressed integer", value),
            })
        }
    }
    Ok(())
}

/// Read a compressed unsigned integer, returning the value and its length.
pub fn read_compressed_u32(bytes: &[u8]) -> Option<(u32, usize)> {
    let first = *bytes.first()?;
    match first {
        _ if first & 0x80 == 0 => Some((first as u32, 1)),
        _ if first & 0xC0 == 0x80 => {
            let second = *bytes.get(1)?;
            Some(((((first & 0x3F) as u32) << 8) | second as u32, 2))
        }
        _ if first & 0xE0 == 0xC0 => {
            let b = bytes.get(..4)?;
            let value = u32::from_be_bytes([b[0] & 0x1F, b[1], b[2], b[3]]);
            Some((value, 4))
        }
        _ => None,
    }
}

/// Primitive element types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum ElementType {
    /// `void` (return types only).
    Void = 0x01,
    /// `bool`.
    Boolean = 0x02,
    /// UTF-16 code unit.
    Char = 0x03,
    /// `int8`.
    I1 = 0x04,
    /// `uint8`.
    U1 = 0x05,
    /// `int16`.
    I2 = 0x06,
    /// `uint16`.
    U2 = 0x07,
    /// `int32`.
    I4 = 0x08,
    /// `uint32`.
    U4 = 0x09,
    /// `int64`.
    I8 = 0x0A,
    /// `uint64`.
    U8 = 0x0B,
    /// `float32`.
    R4 = 0x0C,
    /// `float64`.
    R8 = 0x0D,
    /// `string`.
    String = 0x0E,
    /// `typedref`.
    TypedByRef = 0x16,
    /// Native-sized signed integer.
    I = 0x18,
    /// Native-sized unsigned integer.
    U = 0x19,
    /// `object`.
    Object = 0x1C,
}

const ELEMENT_TYPE_PTR: u8 = 0x0F;
const ELEMENT_TYPE_BYREF: u8 = 0x10;
const ELEMENT_TYPE_VALUETYPE: u8 = 0x11;
const ELEMENT_TYPE_CLASS: u8 = 0x12;
const ELEMENT_TYPE_SZARRAY: u8 = 0x1D;
const ELEMENT_TYPE_PINNED: u8 = 0x45;

const SIG_LOCAL: u8 = 0x07;
const SIG_HASTHIS: u8 = 0x20;

/// A type in a signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SigType {
    /// A primitive.
    Primitive(ElementType),
    /// A value type, by `TypeDef`/`TypeRef`/`TypeSpec` token.
    ValueType(u32),
    /// A reference type, by `TypeDef`/`TypeRef`/`TypeSpec` token.
    Class(u32),
    /// Unmanaged pointer.
    Ptr(Box<SigType>),
    /// Managed reference.
    ByRef(Box<SigType>),
    /// Single-dimension zero-based array.
    SzArray(Box<SigType>),
    /// Pinned local (locals signatures only).
    Pinned(Box<SigType>),
}

impl From<ElementType> for SigType {
    fn from(e: ElementType) -> Self {
        SigType::Primitive(e)
    }
}

impl SigType {
    /// Pointer to `inner`.
    pub fn ptr(inner: impl Into<SigType>) -> Self {
        SigType::Ptr(Box::new(inner.into()))
    }

    /// Managed reference to `inner`.
    pub fn by_ref(inner: impl Into<SigType>) -> Self {
        SigType::ByRef(Box::new(inner.into()))
    }

    /// Array of `inner`.
    pub fn sz_array(inner: impl Into<SigType>) -> Self {
        SigType::SzArray(Box::new(inner.into()))
    }

    /// Pinned `inner`.
    pub fn pinned(inner: impl Into<SigType>) -> Self {
        SigType::Pinned(Box::new(inner.into()))
    }

    /// Append the encoded type.
    ///
    /// # Errors
    ///
    /// [`LinkError::InvalidEncoding`] for a type token outside the
    /// `TypeDef`, `TypeRef` and `TypeSpec` tables.
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<(), LinkError> {
        match self {
            SigType::Primitive(e) => out.push(*e as u8),
            SigType::ValueType(token) => {
                out.push(ELEMENT_TYPE_VALUETYPE);
                write_compressed_u32(type_def_or_ref(*token)?, out)?;
            }
            SigType::Class(token) => {
                out.push(ELEMENT_TYPE_CLASS);
                write_compressed_u32(type_def_or_ref(*token)?, out)?;
            }
            SigType::Ptr(inner) => {
                out.push(ELEMENT_TYPE_PTR);
                inner.encode(out)?;
            }
            SigType::ByRef(inner) => {
                out.push(ELEMENT_TYPE_BYREF);
                inner.encode(out)?;
            }
            SigType::SzArray(inner) => {
                out.push(ELEMENT_TYPE_SZARRAY);
                inner.encode(out)?;
            }
            SigType::Pinned(inner) => {
                out.push(ELEMENT_TYPE_PINNED);
                inner.encode(out)?;
            }
        }
        Ok(())
    }
}

/// `TypeDefOrRef` coded index for a type token.
fn type_def_or_ref(token: u32) -> Result<u32, LinkError> {
    let rid = token & 0x00FF_FFFF;
    let tag = match token >> 24 {
        0x02 => 0,
        0x01 => 1,
        0x1B => 2,
        table => {
            return Err(LinkError::InvalidEncoding {
                detail: format!("token {:#010x} (table {:#04x}) is not a type", token, table),
            })
        }
    };
    Ok((rid << 2) | tag)
}

fn too_many(what: &str, limit: usize) -> LinkError {
    LinkError::ResourceLimitExceeded {
        resource: String::from(what),
        limit,
    }
}

// ─── LocalSigBuilder ───────────────────────────────────────

/// Builds the `LOCAL_SIG` blob of a stub's locals.
#[derive(Debug, Clone, Default)]
pub struct LocalSigBuilder {
    locals: Vec<SigType>,
}

impl LocalSigBuilder {
    /// An empty locals list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a local, returning its index.
    ///
    /// # Errors
    ///
    /// [`LinkError::ResourceLimitExceeded`] past 65,535 locals.
    pub fn new_local(&mut self, ty: impl Into<SigType>) -> Result<u16, LinkError> {
        let index = u16::try_from(self.locals.len())
            .ok()
            .filter(|&i| i < u16::MAX)
            .ok_or_else(|| too_many("locals", u16::MAX as usize))?;
        self.locals.push(ty.into());
        Ok(index)
    }

    /// Number of locals.
    pub fn len(&self) -> usize {
        self.locals.len()
    }

    /// Whether there are no locals.
    pub fn is_empty(&self) -> bool {
        self.locals.is_empty()
    }

    /// Declared locals, by index.
    pub fn locals(&self) -> &[SigType] {
        &self.locals
    }

    /// Encode the signature blob: `0x07`, count, types.
    ///
    /// # Errors
    ///
    /// See [`SigType::encode`].
    pub fn build(&self) -> Result<Vec<u8>, LinkError> {
        let mut out = Vec::with_capacity(2 + self.locals.len());
        out.push(SIG_LOCAL);
        write_compressed_u32(self.locals.len() as u32, &mut out)?;
        for local in &self.locals {
            local.encode(&mut out)?;
        }
        Ok(out)
    }
}

// ─── FunctionSigBuilder ────────────────────────────────────

/// Unmanaged and managed calling conventions of a method signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CallingConvention {
    /// Managed default.
    #[default]
    Default = 0x00,
    /// `cdecl`.
    C = 0x01,
    /// `stdcall`.
    StdCall = 0x02,
    /// `thiscall`.
    ThisCall = 0x03,
    /// `fastcall`.
    FastCall = 0x04,
    /// Managed variadic.
    VarArg = 0x05,
}

/// Builds a method signature blob (`calli` targets, stub signatures).
#[derive(Debug, Clone)]
pub struct FunctionSigBuilder {
    convention: CallingConvention,
    has_this: bool,
    return_type: SigType,
    params: Vec<SigType>,
}

impl Default for FunctionSigBuilder {
    fn default() -> Self {
        Self::new(CallingConvention::Default)
    }
}

impl FunctionSigBuilder {
    /// A `void ()` signature with the given convention.
    pub fn new(convention: CallingConvention) -> Self {
        Self {
            convention,
            has_this: false,
            return_type: SigType::Primitive(ElementType::Void),
            params: Vec::new(),
        }
    }

    /// Mark the signature as an instance method.
    pub fn set_has_this(&mut self, has_this: bool) -> &mut Self {
        self.has_this = has_this;
        self
    }

    /// Set the return type.
    pub fn set_return_type(&mut self, ty: impl Into<SigType>) -> &mut Self {
        self.return_type = ty.into();
        self
    }

    /// Append a parameter, returning its index.
    pub fn new_arg(&mut self, ty: impl Into<SigType>) -> u16 {
        self.params.push(ty.into());
        (self.params.len() - 1) as u16
    }

    /// Number of parameters (excluding `this`).
    pub fn num_args(&self) -> usize {
        self.params.len()
    }

    /// Whether the return type is not `void`.
    pub fn returns_value(&self) -> bool {
        self.return_type != SigType::Primitive(ElementType::Void)
    }

    /// Encode: convention byte, parameter count, return type, parameters.
    ///
    /// # Errors
    ///
    /// [`LinkError::ResourceLimitExceeded`] past 65,535 parameters, or see
    /// [`SigType::encode`].
    pub fn build(&self) -> Result<Vec<u8>, LinkError> {
        if self.params.len() > u16::MAX as usize {
            return Err(too_many("parameters", u16::MAX as usize));
        }
        let mut out = Vec::new();
        let this_flag = if self.has_this { SIG_HASTHIS } else { 0 };
        out.push(self.convention as u8 | this_flag);
        write_compressed_u32(self.params.len() as u32, &mut out)?;
        self.return_type.encode(&mut out)?;
        for param in &self.params {
            param.encode(&mut out)?;
        }
        Ok(out)
    }
}
