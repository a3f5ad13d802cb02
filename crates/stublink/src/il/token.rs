//! Stub-private metadata tokens.
//!
//! A stub refers to runtime entities (methods, fields, types, signature
//! blobs, string literals) by handle.  [`TokenMap`] interns each handle once
//! and hands out a token whose top byte names the metadata table and whose
//! low 24 bits are a 1-based row id, so IL operands stay 4 bytes wide.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

use crate::error::LinkError;

/// Largest row id a token can carry.
pub const MAX_RID: u32 = 0x00FF_FFFF;

/// Entity kind of a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TokenKind {
    /// A method (`MethodDef`, table `0x06`).
    Method,
    /// A field (`Field`, table `0x04`).
    Field,
    /// A type (`TypeDef`, table `0x02`).
    Type,
    /// A stand-alone signature (`StandAloneSig`, table `0x11`).
    Signature,
    /// A user string (heap `0x70`).
    String,
}

impl TokenKind {
    const ALL: [TokenKind; 5] = [
        TokenKind::Method,
        TokenKind::Field,
        TokenKind::Type,
        TokenKind::Signature,
        TokenKind::String,
    ];

    /// Table byte stored in the top 8 bits of the token.
    pub const fn table(self) -> u8 {
        match self {
            TokenKind::Method => 0x06,
            TokenKind::Field => 0x04,
            TokenKind::Type => 0x02,
            TokenKind::Signature => 0x11,
            TokenKind::String => 0x70,
        }
    }

    fn from_table(table: u8) -> Option<TokenKind> {
        TokenKind::ALL.into_iter().find(|k| k.table() == table)
    }

    fn slot(self) -> usize {
        self as usize
    }
}

/// Interns runtime handles into stub-private tokens.
#[derive(Debug, Clone, Default)]
pub struct TokenMap {
    rows: [Vec<u64>; 5],
    index: BTreeMap<(TokenKind, u64), u32>,
}

impl TokenMap {
    /// An empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// The token for `handle`, allocating one on first use.
    ///
    /// # Errors
    ///
    /// [`LinkError::ResourceLimitExceeded`] once a table holds
    /// [`MAX_RID`] entries.
    pub fn get_token(&mut self, kind: TokenKind, handle: u64) -> Result<u32, LinkError> {
        if let Some(&token) = self.index.get(&(kind, handle)) {
            return Ok(token);
        }
        let rows = &mut self.rows[kind.slot()];
        if rows.len() >= MAX_RID as usize {
            return Err(LinkError::ResourceLimitExceeded {
                resource: String::from("tokens"),
                limit: MAX_RID as usize,
            });
        }
        rows.push(handle);
        let token = ((kind.table() as u32) << 24) | rows.len() as u32;
        self.index.insert((kind, handle), token);
        log::trace!("TokenMap: {:?} {:#x} -> {:#010x}", kind, handle, token);
        Ok(token)
    }

    /// The kind and handle behind `token`.
    pub fn lookup(&self, token: u32) -> Option<(TokenKind, u64)> {
        let kind = TokenKind::from_table((token >> 24) as u8)?;
        let rid = (token & MAX_RID) as usize;
        let handle = *self.rows[kind.slot()].get(rid.checked_sub(1)?)?;
        Some((kind, handle))
    }

    /// Number of tokens handed out.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Whether no tokens were handed out.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Every `(token, kind, handle)`, grouped by kind in row order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, TokenKind, u64)> + '_ {
        TokenKind::ALL.into_iter().flat_map(move |kind| {
            self.rows[kind.slot()]
                .iter()
                .enumerate()
                .map(move |(i, &handle)| {
                    (((kind.table() as u32) << 24) | (i as u32 + 1), kind, handle)
                })
        })
    }
}
