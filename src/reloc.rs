//! Relocation kinds and site patching.
//!
//! Relocation kinds form a closed set, so a tagged enum with a single
//! `apply` function replaces per-architecture dispatch. Absolute-address
//! kinds overwrite their site outright; the self-relative kinds read the
//! displacement already encoded at the site as an addend before rewriting.

use anyhow::{bail, ensure, Result};
use object::pe;

pub mod arm64;
pub mod thumb;

/// `IMAGE_REL_BASED_THUMB_MOV32` file relocation type.
///
/// Reference: <https://learn.microsoft.com/windows/win32/debug/pe-format#base-relocation-types>
pub const IMAGE_REL_BASED_THUMB_MOV32: u16 = 7;

/// Semantic relocation kinds the code generator can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelocType {
    /// No-op placeholder; patches nothing and never reaches `.reloc`.
    Absolute,
    /// 32-bit virtual address (x86).
    HighLow,
    /// 64-bit virtual address (x64).
    Dir64,
    /// 32-bit PC-relative displacement, measured from the end of the site.
    Rel32,
    /// 32-bit virtual address split across a Thumb-2 MOVW/MOVT pair.
    ThumbMov32,
    /// ARM64 B/BL 26-bit branch displacement.
    Arm64Branch26,
    /// ARM64 ADRP 21-bit page delta.
    Arm64PageBaseRel21,
    /// ARM64 ADD 12-bit page offset.
    Arm64PageOffset12A,
    /// ARM64 LDR scaled 12-bit page offset (8-byte access).
    Arm64PageOffset12L,
}

impl RelocType {
    /// Width of the encoded site in bytes.
    pub fn site_len(self) -> usize {
        match self {
            RelocType::Absolute => 0,
            RelocType::HighLow
            | RelocType::Rel32
            | RelocType::Arm64Branch26
            | RelocType::Arm64PageBaseRel21
            | RelocType::Arm64PageOffset12A
            | RelocType::Arm64PageOffset12L => 4,
            RelocType::Dir64 | RelocType::ThumbMov32 => 8,
        }
    }

    /// The `IMAGE_REL_BASED_*` type emitted into `.reloc` for this kind.
    ///
    /// PC-relative and instruction-encoded forms are self-relative; they map
    /// to `IMAGE_REL_BASED_ABSOLUTE` and get no `.reloc` entry.
    pub fn file_reloc_type(self) -> u16 {
        match self {
            RelocType::HighLow => pe::IMAGE_REL_BASED_HIGHLOW,
            RelocType::Dir64 => pe::IMAGE_REL_BASED_DIR64,
            RelocType::ThumbMov32 => IMAGE_REL_BASED_THUMB_MOV32,
            _ => pe::IMAGE_REL_BASED_ABSOLUTE,
        }
    }

    /// Rewrites the placeholder bytes at a relocation site.
    ///
    /// `site` must be exactly `site_len` bytes taken from the assembled
    /// image at the relocation's file position.
    pub fn apply(self, site_rva: u32, target_rva: u32, image_base: u64, site: &mut [u8]) -> Result<()> {
        ensure!(
            site.len() == self.site_len(),
            "relocation site length mismatch: {} != {}",
            site.len(),
            self.site_len()
        );
        match self {
            RelocType::Absolute => {}
            RelocType::HighLow => {
                let value = target_rva.wrapping_add(image_base as u32);
                site.copy_from_slice(&value.to_le_bytes());
            }
            RelocType::Dir64 => {
                let value = u64::from(target_rva).wrapping_add(image_base);
                site.copy_from_slice(&value.to_le_bytes());
            }
            RelocType::Rel32 => {
                let addend = i64::from(read_u32(site) as i32);
                let value = addend + i64::from(target_rva) - i64::from(site_rva) - 4;
                ensure!(
                    i32::try_from(value).is_ok(),
                    "REL32 displacement out of range: {:#x} -> {:#x}",
                    site_rva,
                    target_rva
                );
                site.copy_from_slice(&(value as i32).to_le_bytes());
            }
            RelocType::ThumbMov32 => {
                thumb::ensure_mov32(site)?;
                thumb::put_mov32(site, target_rva.wrapping_add(image_base as u32));
            }
            RelocType::Arm64Branch26 => {
                let addend = arm64::get_rel28(site);
                let value = addend + i64::from(target_rva) - i64::from(site_rva);
                ensure!(value & 3 == 0, "BRANCH26 target not 4-byte aligned");
                ensure!(
                    (-(1 << 27)..1 << 27).contains(&value),
                    "BRANCH26 displacement out of range: {:#x} -> {:#x}",
                    site_rva,
                    target_rva
                );
                arm64::put_rel28(site, value);
            }
            RelocType::Arm64PageBaseRel21 => {
                let addend = arm64::get_rel21(site);
                let value =
                    addend + i64::from(target_rva >> 12) - i64::from(site_rva >> 12);
                ensure!(
                    (-(1 << 20)..1 << 20).contains(&value),
                    "PAGEBASE_REL21 page delta out of range: {:#x} -> {:#x}",
                    site_rva,
                    target_rva
                );
                arm64::put_rel21(site, value);
            }
            RelocType::Arm64PageOffset12A => {
                let value = u64::from(arm64::get_imm12(site)) + u64::from(target_rva & 0xfff);
                ensure!(value < 0x1000, "PAGEOFFSET_12A offset out of range");
                arm64::put_imm12(site, value as u32);
            }
            RelocType::Arm64PageOffset12L => {
                // The LDR imm12 field is scaled for an 8-byte access.
                let value =
                    (u64::from(arm64::get_imm12(site)) << 3) + u64::from(target_rva & 0xfff);
                if value & 7 != 0 {
                    bail!("PAGEOFFSET_12L target {:#x} not 8-byte aligned", target_rva);
                }
                ensure!(value < 0x1000, "PAGEOFFSET_12L offset out of range");
                arm64::put_imm12(site, (value >> 3) as u32);
            }
        }
        Ok(())
    }
}

fn read_u32(site: &[u8]) -> u32 {
    u32::from_le_bytes([site[0], site[1], site[2], site[3]])
}
