//! x86 and x86-64 relocatable instruction formats.
//!
//! | format                | `K8`          | `K32`                  | `K64` (64-bit mode only)              |
//! |-----------------------|---------------|------------------------|---------------------------------------|
//! | [`X86Branch`] jump    | `EB rel8`     | `E9 rel32`             | `mov r11, imm64; jmp r11`             |
//! | [`X86Branch`] call    | n/a           | `E8 rel32`             | `mov r11, imm64; call r11`            |
//! | [`X86Branch`] jcc     | `7x rel8`     | `0F 8x rel32`          | `j!cc +13; mov r11, imm64; jmp r11`   |
//! | [`X86LoadAddress`]    | n/a           | `lea reg, [rip+disp32]`| `mov reg, imm64`                      |
//!
//! Relative fixups are measured from the end of the instruction (the default
//! hot spot), so the decoded displacement is `target - hot_spot` exactly.
//!
//! In 32-bit mode `rel32` wraps around the whole address space, so it reaches
//! every target, external ones included.  In 64-bit mode the final stub
//! address is unknown while sizing, so references to external addresses and
//! absolute labels go straight to the `K64` form.

use alloc::format;

use crate::error::LinkError;
use crate::format::{fits_signed, EmitSite, Fixup, InstructionFormat, Reach, RefSize, RefSizes};

/// Register used by the 64-bit absolute branch forms.  Volatile and never
/// an argument register in either the SysV or the Windows x64 convention.
const SCRATCH_R11: u8 = 11;

/// Processor mode a format encodes for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum X86Mode {
    /// 32-bit protected mode.
    Bits32,
    /// 64-bit long mode.
    Bits64,
}

/// Kind of control transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BranchKind {
    /// Unconditional jump.
    Jump,
    /// Near call.
    Call,
    /// Conditional jump; the variation code is the condition (`0x0`–`0xF`,
    /// as in the low nibble of `Jcc`).
    Conditional,
}

/// Condition codes for [`BranchKind::Conditional`] variation codes.
pub mod cond {
    /// Overflow.
    pub const O: u32 = 0x0;
    /// No overflow.
    pub const NO: u32 = 0x1;
    /// Below (unsigned <).
    pub const B: u32 = 0x2;
    /// Above or equal (unsigned >=).
    pub const AE: u32 = 0x3;
    /// Equal / zero.
    pub const E: u32 = 0x4;
    /// Not equal / not zero.
    pub const NE: u32 = 0x5;
    /// Below or equal (unsigned <=).
    pub const BE: u32 = 0x6;
    /// Above (unsigned >).
    pub const A: u32 = 0x7;
    /// Sign.
    pub const S: u32 = 0x8;
    /// No sign.
    pub const NS: u32 = 0x9;
    /// Parity even.
    pub const P: u32 = 0xA;
    /// Parity odd.
    pub const NP: u32 = 0xB;
    /// Less (signed <).
    pub const L: u32 = 0xC;
    /// Greater or equal (signed >=).
    pub const GE: u32 = 0xD;
    /// Less or equal (signed <=).
    pub const LE: u32 = 0xE;
    /// Greater (signed >).
    pub const G: u32 = 0xF;
}

// ─── X86Branch ─────────────────────────────────────────────

/// `jmp` / `call` / `jcc` to a label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct X86Branch {
    mode: X86Mode,
    kind: BranchKind,
}

/// 32-bit `jmp`.
pub static JMP32: X86Branch = X86Branch::new(X86Mode::Bits32, BranchKind::Jump);
/// 32-bit `call`.
pub static CALL32: X86Branch = X86Branch::new(X86Mode::Bits32, BranchKind::Call);
/// 32-bit `jcc` (variation = condition code).
pub static JCC32: X86Branch = X86Branch::new(X86Mode::Bits32, BranchKind::Conditional);
/// 64-bit `jmp`.
pub static JMP64: X86Branch = X86Branch::new(X86Mode::Bits64, BranchKind::Jump);
/// 64-bit `call`.
pub static CALL64: X86Branch = X86Branch::new(X86Mode::Bits64, BranchKind::Call);
/// 64-bit `jcc` (variation = condition code).
pub static JCC64: X86Branch = X86Branch::new(X86Mode::Bits64, BranchKind::Conditional);

impl X86Branch {
    /// A branch format for `mode`.
    pub const fn new(mode: X86Mode, kind: BranchKind) -> Self {
        Self { mode, kind }
    }

    /// Bytes of `mov r11, imm64` + `jmp/call r11`.
    const ABS_SEQ_LEN: u32 = 13;

    fn write_abs_sequence(&self, out: &mut [u8], address: u64, call: bool) {
        out[0] = 0x49; // REX.W + REX.B
        out[1] = 0xB8 + (SCRATCH_R11 & 7);
        out[2..10].copy_from_slice(&address.to_le_bytes());
        out[10] = 0x41; // REX.B
        out[11] = 0xFF;
        out[12] = if call { 0xD0 } else { 0xE0 } | (SCRATCH_R11 & 7);
    }
}

impl InstructionFormat for X86Branch {
    fn allowed_sizes(&self) -> RefSizes {
        match (self.mode, self.kind) {
            (X86Mode::Bits32, BranchKind::Call) => RefSizes::of(&[RefSize::K32]),
            (X86Mode::Bits32, _) => RefSizes::of(&[RefSize::K8, RefSize::K32]),
            (X86Mode::Bits64, BranchKind::Call) => RefSizes::of(&[RefSize::K32, RefSize::K64]),
            (X86Mode::Bits64, _) => RefSizes::of(&[RefSize::K8, RefSize::K32, RefSize::K64]),
        }
    }

    fn size_of_instruction(&self, size: RefSize, _variation: u32) -> u32 {
        match (self.kind, size) {
            (_, RefSize::K8) => 2,
            (BranchKind::Conditional, RefSize::K32) => 6,
            (_, RefSize::K32) => 5,
            (BranchKind::Conditional, _) => 2 + Self::ABS_SEQ_LEN,
            (_, _) => Self::ABS_SEQ_LEN,
        }
    }

    fn hot_spot_offset(&self, size: RefSize, variation: u32) -> u32 {
        match size {
            // The address field of `mov r11, imm64`.
            RefSize::K64 => {
                let skip = if self.kind == BranchKind::Conditional { 2 } else { 0 };
                skip + 2
            }
            _ => self.size_of_instruction(size, variation),
        }
    }

    fn can_reach(&self, size: RefSize, _variation: u32, reach: Reach) -> bool {
        match (self.mode, size, reach) {
            (_, RefSize::K8, Reach::Relative(d)) => fits_signed(d, 8),
            (X86Mode::Bits32, RefSize::K32, Reach::Relative(_) | Reach::External(_)) => true,
            (X86Mode::Bits64, RefSize::K32, Reach::Relative(d)) => fits_signed(d, 32),
            (X86Mode::Bits64, RefSize::K64, _) => true,
            _ => false,
        }
    }

    fn emit_instruction(
        &self,
        size: RefSize,
        variation: u32,
        fixup: Fixup,
        site: EmitSite<'_>,
    ) -> Result<(), LinkError> {
        let cc = (variation & 0xF) as u8;
        let code = site.code;
        match size {
            RefSize::K8 => {
                let disp = fixup.displacement();
                if !fits_signed(disp, 8) {
                    return Err(LinkError::InvalidEncoding {
                        detail: format!("rel8 displacement {} out of range", disp),
                    });
                }
                code[0] = match self.kind {
                    BranchKind::Conditional => 0x70 | cc,
                    _ => 0xEB,
                };
                code[1] = disp as i8 as u8;
            }
            RefSize::K32 => {
                let disp = fixup.displacement();
                let rel = if self.mode == X86Mode::Bits32 {
                    disp as i32
                } else {
                    i32::try_from(disp).map_err(|_| LinkError::InvalidEncoding {
                        detail: format!("rel32 displacement {} out of range", disp),
                    })?
                };
                let field = match self.kind {
                    BranchKind::Jump => {
                        code[0] = 0xE9;
                        &mut code[1..5]
                    }
                    BranchKind::Call => {
                        code[0] = 0xE8;
                        &mut code[1..5]
                    }
                    BranchKind::Conditional => {
                        code[0] = 0x0F;
                        code[1] = 0x80 | cc;
                        &mut code[2..6]
                    }
                };
                field.copy_from_slice(&rel.to_le_bytes());
            }
            _ => match self.kind {
                BranchKind::Conditional => {
                    // Skip the absolute jump when the condition is false.
                    code[0] = 0x70 | (cc ^ 1);
                    code[1] = Self::ABS_SEQ_LEN as u8;
                    self.write_abs_sequence(&mut code[2..], fixup.target, false);
                }
                kind => self.write_abs_sequence(code, fixup.target, kind == BranchKind::Call),
            },
        }
        Ok(())
    }
}

// ─── X86LoadAddress ────────────────────────────────────────

/// Load the address of a label into a 64-bit register
/// (variation = register number 0–15).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct X86LoadAddress;

/// `lea reg, [rip+disp32]` or `mov reg, imm64`.
pub static LOAD_ADDRESS64: X86LoadAddress = X86LoadAddress;

impl InstructionFormat for X86LoadAddress {
    fn allowed_sizes(&self) -> RefSizes {
        RefSizes::of(&[RefSize::K32, RefSize::K64])
    }

    fn size_of_instruction(&self, size: RefSize, _variation: u32) -> u32 {
        if size == RefSize::K32 {
            7
        } else {
            10
        }
    }

    fn hot_spot_offset(&self, size: RefSize, variation: u32) -> u32 {
        if size == RefSize::K32 {
            self.size_of_instruction(size, variation)
        } else {
            2
        }
    }

    fn can_reach(&self, size: RefSize, _variation: u32, reach: Reach) -> bool {
        match (size, reach) {
            (RefSize::K32, Reach::Relative(d)) => fits_signed(d, 32),
            // An internal absolute label is the stub address plus a small
            // offset; a RIP-relative lea computes the same value.
            (RefSize::K32, Reach::AbsoluteInternal(_)) => true,
            (RefSize::K64, _) => true,
            _ => false,
        }
    }

    fn emit_instruction(
        &self,
        size: RefSize,
        variation: u32,
        fixup: Fixup,
        site: EmitSite<'_>,
    ) -> Result<(), LinkError> {
        let reg = (variation & 0xF) as u8;
        let code = site.code;
        if size == RefSize::K32 {
            let disp = fixup.displacement();
            let rel = i32::try_from(disp).map_err(|_| LinkError::InvalidEncoding {
                detail: format!("rip-relative displacement {} out of range", disp),
            })?;
            code[0] = 0x48 | ((reg >> 3) << 2); // REX.W + REX.R
            code[1] = 0x8D;
            code[2] = 0x05 | ((reg & 7) << 3);
            code[3..7].copy_from_slice(&rel.to_le_bytes());
        } else {
            code[0] = 0x48 | (reg >> 3); // REX.W + REX.B
            code[1] = 0xB8 + (reg & 7);
            code[2..10].copy_from_slice(&fixup.target.to_le_bytes());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linker::StubLinker;

    #[test]
    fn short_forward_jump() {
        let mut sl = StubLinker::new();
        let l = sl.new_code_label();
        sl.emit_label_ref(l, &JMP64, 0);
        sl.emit8(0x90);
        sl.emit_label(l).unwrap();
        assert_eq!(&*sl.link_at(0x1000).unwrap(), &[0xEB, 0x01, 0x90]);
    }

    #[test]
    fn jcc_grows_to_rel32() {
        let mut sl = StubLinker::new();
        let l = sl.new_code_label();
        sl.emit_label_ref(l, &JCC64, cond::NE);
        sl.emit_bytes(&[0x90; 200]);
        sl.emit_label(l).unwrap();
        let bytes = sl.link_at(0).unwrap();
        assert_eq!(&bytes[..6], &[0x0F, 0x85, 200, 0, 0, 0]);
        assert_eq!(bytes.len(), 206);
    }

    #[test]
    fn call_starts_at_rel32() {
        let mut sl = StubLinker::new();
        let l = sl.emit_new_code_label().unwrap();
        sl.emit_label_ref(l, &CALL32, 0);
        let bytes = sl.link_at(0x400000).unwrap();
        assert_eq!(&*bytes, &[0xE8, 0xFB, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn external_call_32bit_uses_rel32() {
        let mut sl = StubLinker::new();
        let target = sl.new_external_code_label(0x0040_1000);
        sl.emit_label_ref(target, &CALL32, 0);
        let bytes = sl.link_at(0x0040_0000).unwrap();
        // 0x401000 - (0x400000 + 5)
        assert_eq!(&*bytes, &[0xE8, 0xFB, 0x0F, 0x00, 0x00]);
    }

    #[test]
    fn external_jump_64bit_uses_absolute_form() {
        let mut sl = StubLinker::new();
        let target = sl.new_external_code_label(0x7FFF_1234_5678);
        sl.emit_label_ref(target, &JMP64, 0);
        let bytes = sl.link_at(0x1000).unwrap();
        let mut expected = alloc::vec![0x49, 0xBB];
        expected.extend_from_slice(&0x7FFF_1234_5678u64.to_le_bytes());
        expected.extend_from_slice(&[0x41, 0xFF, 0xE3]);
        assert_eq!(&*bytes, &expected[..]);
    }

    #[test]
    fn external_jcc_64bit_inverts_condition() {
        let mut sl = StubLinker::new();
        let target = sl.new_external_code_label(0x1234);
        sl.emit_label_ref(target, &JCC64, cond::E);
        let bytes = sl.link_at(0).unwrap();
        assert_eq!(bytes.len(), 15);
        assert_eq!(&bytes[..4], &[0x75, 13, 0x49, 0xBB]);
        assert_eq!(&bytes[12..], &[0x41, 0xFF, 0xE3]);
    }

    #[test]
    fn absolute_call_64bit() {
        let mut sl = StubLinker::new();
        let target = sl.new_absolute_external_code_label(0xAABB);
        sl.emit_label_ref(target, &CALL64, 0);
        let bytes = sl.link_at(0).unwrap();
        assert_eq!(&bytes[10..], &[0x41, 0xFF, 0xD3]);
        assert_eq!(&bytes[2..10], &0xAABBu64.to_le_bytes());
    }

    #[test]
    fn absolute_label_unreachable_in_32bit_mode() {
        let mut sl = StubLinker::new();
        let target = sl.new_absolute_external_code_label(0x1000);
        sl.emit_label_ref(target, &JMP32, 0);
        let err = sl.calculate_size().unwrap_err();
        assert!(matches!(
            err,
            LinkError::UnreachableTarget {
                size: RefSize::K32,
                ..
            }
        ));
    }

    #[test]
    fn lea_rip_relative_to_data_label() {
        let mut sl = StubLinker::new();
        let data = sl.new_code_label();
        sl.emit_label_ref(data, &LOAD_ADDRESS64, 1); // rcx
        sl.emit8(0xC3);
        sl.emit_label(data).unwrap();
        sl.emit64(0x1122_3344);
        let bytes = sl.link_at(0).unwrap();
        assert_eq!(&bytes[..7], &[0x48, 0x8D, 0x0D, 1, 0, 0, 0]);
    }

    #[test]
    fn lea_extended_register() {
        let mut sl = StubLinker::new();
        let data = sl.emit_new_code_label().unwrap();
        sl.emit_label_ref(data, &LOAD_ADDRESS64, 10); // r10
        let bytes = sl.link_at(0).unwrap();
        assert_eq!(&bytes[..3], &[0x4C, 0x8D, 0x15]);
        assert_eq!(i32::from_le_bytes([bytes[3], bytes[4], bytes[5], bytes[6]]), -7);
    }

    #[test]
    fn mov_imm64_for_external_address() {
        let mut sl = StubLinker::new();
        let ext = sl.new_absolute_external_code_label(0x0123_4567_89AB_CDEF);
        sl.emit_label_ref(ext, &LOAD_ADDRESS64, 9); // r9
        let bytes = sl.link_at(0).unwrap();
        assert_eq!(&bytes[..2], &[0x49, 0xB9]);
        assert_eq!(&bytes[2..], &0x0123_4567_89AB_CDEFu64.to_le_bytes());
    }
}
