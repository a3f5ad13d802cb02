//! AArch64 relocatable instruction formats.
//!
//! All AArch64 instructions are 4 bytes and PC-relative offsets are measured
//! from the *start* of the instruction, so every format here overrides the
//! hot spot.  The widest form of each format loads the target address from
//! the stub's trailing data blob with `ldr x16, <literal>` and branches
//! through `x16` (IP0, the intra-procedure-call scratch register).
//!
//! | format                 | `K8`            | `K32`                    | `K64`                                   |
//! |------------------------|-----------------|--------------------------|-----------------------------------------|
//! | [`A64Branch`]          | n/a             | `b`/`bl imm26`           | `ldr x16, lit; br`/`blr x16`            |
//! | [`A64CondBranch`]      | `b.cond imm19`  | `b.!cond +8; b imm26`    | `b.!cond +12; ldr x16, lit; br x16`     |
//! | [`A64LoadAddress`]     | `adr xd, imm21` | n/a                      | `ldr xd, lit`                           |

use alloc::format;

use crate::error::LinkError;
use crate::format::{fits_signed, EmitSite, Fixup, InstructionFormat, Reach, RefSize, RefSizes};

/// IP0.
const SCRATCH_X16: u32 = 16;

/// Condition codes for [`A64CondBranch`] variation codes.
pub mod cond {
    /// Equal.
    pub const EQ: u32 = 0x0;
    /// Not equal.
    pub const NE: u32 = 0x1;
    /// Carry set / unsigned higher or same.
    pub const HS: u32 = 0x2;
    /// Carry clear / unsigned lower.
    pub const LO: u32 = 0x3;
    /// Negative.
    pub const MI: u32 = 0x4;
    /// Positive or zero.
    pub const PL: u32 = 0x5;
    /// Overflow.
    pub const VS: u32 = 0x6;
    /// No overflow.
    pub const VC: u32 = 0x7;
    /// Unsigned higher.
    pub const HI: u32 = 0x8;
    /// Unsigned lower or same.
    pub const LS: u32 = 0x9;
    /// Signed greater or equal.
    pub const GE: u32 = 0xA;
    /// Signed less than.
    pub const LT: u32 = 0xB;
    /// Signed greater than.
    pub const GT: u32 = 0xC;
    /// Signed less or equal.
    pub const LE: u32 = 0xD;
}

// ─── encoders ──────────────────────────────────────────────

#[inline]
fn enc_b(link: bool, imm26: i64) -> u32 {
    let op = if link { 0x9400_0000 } else { 0x1400_0000 };
    op | (imm26 as u32 & 0x03FF_FFFF)
}

#[inline]
fn enc_b_cond(cond: u32, imm19: i64) -> u32 {
    0x5400_0000 | ((imm19 as u32 & 0x7_FFFF) << 5) | (cond & 0xF)
}

#[inline]
fn enc_ldr_literal(rt: u32, imm19: i64) -> u32 {
    0x5800_0000 | ((imm19 as u32 & 0x7_FFFF) << 5) | (rt & 0x1F)
}

#[inline]
fn enc_br(link: bool, rn: u32) -> u32 {
    let op = if link { 0xD63F_0000 } else { 0xD61F_0000 };
    op | ((rn & 0x1F) << 5)
}

#[inline]
fn enc_adr(rd: u32, imm21: i64) -> u32 {
    let imm = imm21 as u32;
    0x1000_0000 | ((imm & 3) << 29) | (((imm >> 2) & 0x7_FFFF) << 5) | (rd & 0x1F)
}

#[inline]
fn put(code: &mut [u8], at: usize, word: u32) {
    code[at..at + 4].copy_from_slice(&word.to_le_bytes());
}

/// Whether a byte displacement fits a word-scaled field of `bits` bits.
#[inline]
fn fits_scaled(disp: i64, bits: u32) -> bool {
    disp & 3 == 0 && fits_signed(disp >> 2, bits)
}

fn scaled(disp: i64, bits: u32, what: &str) -> Result<i64, LinkError> {
    if fits_scaled(disp, bits) {
        Ok(disp >> 2)
    } else {
        Err(LinkError::InvalidEncoding {
            detail: format!("{} offset {} out of range or misaligned", what, disp),
        })
    }
}

/// Write `ldr rt, <slot>` at `code[at..]` and the target address into the
/// data slot.
fn emit_literal_load(
    code: &mut [u8],
    at: usize,
    rt: u32,
    fixup: &Fixup,
    site_address: u64,
    data: &mut [u8],
    data_address: u64,
) -> Result<(), LinkError> {
    let ldr_address = site_address + at as u64;
    let disp = data_address.wrapping_sub(ldr_address) as i64;
    let imm19 = scaled(disp, 19, "ldr literal")?;
    put(code, at, enc_ldr_literal(rt, imm19));
    data[..8].copy_from_slice(&fixup.target.to_le_bytes());
    Ok(())
}

// ─── A64Branch ─────────────────────────────────────────────

/// `b` / `bl` to a label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct A64Branch {
    link: bool,
}

/// Unconditional branch.
pub static B: A64Branch = A64Branch { link: false };
/// Branch with link (call).
pub static BL: A64Branch = A64Branch { link: true };

impl InstructionFormat for A64Branch {
    fn allowed_sizes(&self) -> RefSizes {
        RefSizes::of(&[RefSize::K32, RefSize::K64])
    }

    fn size_of_instruction(&self, size: RefSize, _variation: u32) -> u32 {
        if size == RefSize::K32 {
            4
        } else {
            8
        }
    }

    fn size_of_data(&self, size: RefSize, _variation: u32) -> u32 {
        if size == RefSize::K64 {
            8
        } else {
            0
        }
    }

    fn hot_spot_offset(&self, _size: RefSize, _variation: u32) -> u32 {
        0
    }

    fn can_reach(&self, size: RefSize, _variation: u32, reach: Reach) -> bool {
        match (size, reach) {
            (RefSize::K32, Reach::Relative(d)) => fits_scaled(d, 26),
            (RefSize::K64, _) => true,
            _ => false,
        }
    }

    fn emit_instruction(
        &self,
        size: RefSize,
        _variation: u32,
        fixup: Fixup,
        site: EmitSite<'_>,
    ) -> Result<(), LinkError> {
        if size == RefSize::K32 {
            let imm26 = scaled(fixup.displacement(), 26, "branch")?;
            put(site.code, 0, enc_b(self.link, imm26));
        } else {
            emit_literal_load(
                site.code,
                0,
                SCRATCH_X16,
                &fixup,
                site.code_address,
                site.data,
                site.data_address,
            )?;
            put(site.code, 4, enc_br(self.link, SCRATCH_X16));
        }
        Ok(())
    }
}

// ─── A64CondBranch ─────────────────────────────────────────

/// `b.cond` to a label (variation = condition code).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct A64CondBranch;

/// Conditional branch.
pub static B_COND: A64CondBranch = A64CondBranch;

impl InstructionFormat for A64CondBranch {
    fn allowed_sizes(&self) -> RefSizes {
        RefSizes::of(&[RefSize::K8, RefSize::K32, RefSize::K64])
    }

    fn size_of_instruction(&self, size: RefSize, _variation: u32) -> u32 {
        match size {
            RefSize::K8 => 4,
            RefSize::K32 => 8,
            _ => 12,
        }
    }

    fn size_of_data(&self, size: RefSize, _variation: u32) -> u32 {
        if size == RefSize::K64 {
            8
        } else {
            0
        }
    }

    /// The instruction that carries the displacement: the `b.cond` itself,
    /// or the `b` after the inverted skip.
    fn hot_spot_offset(&self, size: RefSize, _variation: u32) -> u32 {
        if size == RefSize::K8 {
            0
        } else {
            4
        }
    }

    fn can_reach(&self, size: RefSize, _variation: u32, reach: Reach) -> bool {
        match (size, reach) {
            (RefSize::K8, Reach::Relative(d)) => fits_scaled(d, 19),
            (RefSize::K32, Reach::Relative(d)) => fits_scaled(d, 26),
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
        let cc = variation & 0xF;
        match size {
            RefSize::K8 => {
                let imm19 = scaled(fixup.displacement(), 19, "conditional branch")?;
                put(site.code, 0, enc_b_cond(cc, imm19));
            }
            RefSize::K32 => {
                let imm26 = scaled(fixup.displacement(), 26, "branch")?;
                put(site.code, 0, enc_b_cond(cc ^ 1, 2));
                put(site.code, 4, enc_b(false, imm26));
            }
            _ => {
                put(site.code, 0, enc_b_cond(cc ^ 1, 3));
                emit_literal_load(
                    site.code,
                    4,
                    SCRATCH_X16,
                    &fixup,
                    site.code_address,
                    site.data,
                    site.data_address,
                )?;
                put(site.code, 8, enc_br(false, SCRATCH_X16));
            }
        }
        Ok(())
    }
}

// ─── A64LoadAddress ────────────────────────────────────────

/// Load the address of a label into `xd` (variation = register 0–30).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct A64LoadAddress;

/// `adr` or a literal-pool load.
pub static LOAD_ADDRESS: A64LoadAddress = A64LoadAddress;

impl InstructionFormat for A64LoadAddress {
    fn allowed_sizes(&self) -> RefSizes {
        RefSizes::of(&[RefSize::K8, RefSize::K64])
    }

    fn size_of_instruction(&self, _size: RefSize, _variation: u32) -> u32 {
        4
    }

    fn size_of_data(&self, size: RefSize, _variation: u32) -> u32 {
        if size == RefSize::K64 {
            8
        } else {
            0
        }
    }

    fn hot_spot_offset(&self, _size: RefSize, _variation: u32) -> u32 {
        0
    }

    fn can_reach(&self, size: RefSize, _variation: u32, reach: Reach) -> bool {
        match (size, reach) {
            (RefSize::K8, Reach::Relative(d)) => fits_signed(d, 21),
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
        let rd = variation & 0x1F;
        if size == RefSize::K8 {
            let disp = fixup.displacement();
            if !fits_signed(disp, 21) {
                return Err(LinkError::InvalidEncoding {
                    detail: format!("adr offset {} out of range", disp),
                });
            }
            put(site.code, 0, enc_adr(rd, disp));
        } else {
            emit_literal_load(
                site.code,
                0,
                rd,
                &fixup,
                site.code_address,
                site.data,
                site.data_address,
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linker::StubLinker;

    fn word(bytes: &[u8], at: usize) -> u32 {
        u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
    }

    const NOP: u32 = 0xD503_201F;
    const RET: u32 = 0xD65F_03C0;

    #[test]
    fn forward_branch() {
        let mut sl = StubLinker::new();
        let l = sl.new_code_label();
        sl.emit_label_ref(l, &B, 0);
        sl.emit32(NOP);
        sl.emit_label(l).unwrap();
        sl.emit32(RET);
        let bytes = sl.link_at(0x1000).unwrap();
        assert_eq!(word(&bytes, 0), 0x1400_0002);
    }

    #[test]
    fn backward_call() {
        let mut sl = StubLinker::new();
        let top = sl.emit_new_code_label().unwrap();
        sl.emit32(NOP);
        sl.emit_label_ref(top, &BL, 0);
        let bytes = sl.link_at(0).unwrap();
        // -4 bytes = imm26 -1
        assert_eq!(word(&bytes, 4), 0x97FF_FFFF);
    }

    #[test]
    fn cond_branch_short() {
        let mut sl = StubLinker::new();
        let l = sl.new_code_label();
        sl.emit_label_ref(l, &B_COND, cond::NE);
        sl.emit32(NOP);
        sl.emit_label(l).unwrap();
        let bytes = sl.link_at(0).unwrap();
        assert_eq!(word(&bytes, 0), 0x5400_0041);
    }

    #[test]
    fn cond_branch_grows_past_imm19() {
        let mut sl = StubLinker::new();
        let l = sl.new_code_label();
        sl.emit_label_ref(l, &B_COND, cond::EQ);
        for _ in 0..(1 << 18) {
            sl.emit32(NOP);
        }
        sl.emit_label(l).unwrap();
        let layout = sl.calculate_size().unwrap();
        assert_eq!(sl.ref_sizes(), [RefSize::K32]);
        assert_eq!(layout.code_size, 8 + (1 << 20));
    }

    #[test]
    fn external_branch_uses_literal_pool() {
        let mut sl = StubLinker::new();
        let ext = sl.new_external_code_label(0xFFFF_0000_1234_5678);
        sl.emit_label_ref(ext, &B, 0);
        let stub_bytes = sl.link_at(0x8000).unwrap();
        // code = 8 bytes, data at 8: ldr x16, #8 ; br x16
        assert_eq!(word(&stub_bytes, 0), 0x5800_0050);
        assert_eq!(word(&stub_bytes, 4), 0xD61F_0200);
        assert_eq!(&stub_bytes[8..16], &0xFFFF_0000_1234_5678u64.to_le_bytes());
    }

    #[test]
    fn external_cond_branch_inverts_and_skips() {
        let mut sl = StubLinker::new();
        let ext = sl.new_external_code_label(0x4000);
        sl.emit_label_ref(ext, &B_COND, cond::LT);
        let bytes = sl.link_at(0).unwrap();
        // b.ge +12
        assert_eq!(word(&bytes, 0), 0x5400_006A);
        // ldr x16, #(16 - 4)
        assert_eq!(word(&bytes, 4), 0x5800_0070);
        assert_eq!(word(&bytes, 8), 0xD61F_0200);
        assert_eq!(&bytes[16..24], &0x4000u64.to_le_bytes());
    }

    #[test]
    fn adr_to_nearby_data() {
        let mut sl = StubLinker::new();
        let data = sl.new_code_label();
        sl.emit_label_ref(data, &LOAD_ADDRESS, 2);
        sl.emit32(RET);
        sl.emit_label(data).unwrap();
        sl.emit64(7);
        let bytes = sl.link_at(0).unwrap();
        // adr x2, #8: immlo = 0, immhi = 2
        assert_eq!(word(&bytes, 0), 0x1000_0042);
    }

    #[test]
    fn absolute_address_via_literal() {
        let mut sl = StubLinker::new();
        let ext = sl.new_absolute_external_code_label(0xCAFE);
        sl.emit_label_ref(ext, &LOAD_ADDRESS, 0);
        let bytes = sl.link_at(0).unwrap();
        assert_eq!(word(&bytes, 0), 0x5800_0040);
        assert_eq!(&bytes[8..], &0xCAFEu64.to_le_bytes());
    }

    #[test]
    fn misaligned_data_blob_is_rejected() {
        let mut sl = StubLinker::new();
        sl.options(crate::StubLinkerOptions {
            data_alignment: 1,
            ..Default::default()
        });
        let ext = sl.new_external_code_label(0x10);
        sl.emit_label_ref(ext, &LOAD_ADDRESS, 0);
        // data slot lands at offset 5
        sl.emit8(0);
        assert!(matches!(
            sl.link_at(0).unwrap_err(),
            LinkError::InvalidEncoding { .. }
        ));
    }
}
