//! `.reloc` base relocation stream encoding.
//!
//! Base relocations are grouped into blocks covering one 4096-byte page
//! each: a `u32` page RVA, a `u32` block size, then 16-bit entries holding
//! the relocation type in the top 4 bits and the page offset in the bottom
//! 12. Entries whose file type is `IMAGE_REL_BASED_ABSOLUTE` never reach
//! the stream.

use anyhow::{ensure, Result};
use object::endian::{LittleEndian as LE, U32};
use object::pe;
use object::pod::bytes_of;

const PAGE_MASK: u32 = 0xfff;

/// Encodes `(site rva, IMAGE_REL_BASED_* type)` pairs into the `.reloc`
/// stream. The pairs must arrive in ascending RVA order.
pub(crate) fn serialize(relocs: impl IntoIterator<Item = (u32, u16)>) -> Result<Vec<u8>> {
    let mut blob = Vec::new();
    let mut block_rva = 0u32;
    let mut entries: Vec<u16> = Vec::new();

    for (rva, file_type) in relocs {
        if file_type == pe::IMAGE_REL_BASED_ABSOLUTE {
            continue;
        }
        let page = rva & !PAGE_MASK;
        if page != block_rva && !entries.is_empty() {
            flush_block(&mut blob, block_rva, &entries)?;
            entries.clear();
        }
        block_rva = page;
        entries.push(file_type << 12 | (rva & PAGE_MASK) as u16);
    }
    if !entries.is_empty() {
        flush_block(&mut blob, block_rva, &entries)?;
    }
    Ok(blob)
}

fn flush_block(blob: &mut Vec<u8>, block_rva: u32, entries: &[u16]) -> Result<()> {
    let size = 8u64 + 2 * entries.len() as u64;
    ensure!(size <= u64::from(u32::MAX), ".reloc block size overflow");
    let header = pe::ImageBaseRelocation {
        virtual_address: U32::new(LE, block_rva),
        size_of_block: U32::new(LE, size as u32),
    };
    blob.extend_from_slice(bytes_of(&header));
    for entry in entries {
        blob.extend_from_slice(&entry.to_le_bytes());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_blocks(blob: &[u8]) -> Vec<(u32, Vec<u16>)> {
        let mut blocks = Vec::new();
        let mut offset = 0;
        while offset < blob.len() {
            let rva = u32::from_le_bytes(blob[offset..offset + 4].try_into().unwrap());
            let size =
                u32::from_le_bytes(blob[offset + 4..offset + 8].try_into().unwrap()) as usize;
            let mut entries = Vec::new();
            for chunk in blob[offset + 8..offset + size].chunks_exact(2) {
                entries.push(u16::from_le_bytes([chunk[0], chunk[1]]));
            }
            blocks.push((rva, entries));
            offset += size;
        }
        blocks
    }

    #[test]
    fn splits_blocks_at_page_boundaries() {
        let mut relocs: Vec<(u32, u16)> = (0..0x400)
            .map(|i| (0x1000 + 4 * i, pe::IMAGE_REL_BASED_HIGHLOW))
            .collect();
        relocs.push((0x2000, pe::IMAGE_REL_BASED_HIGHLOW));

        let blob = serialize(relocs).unwrap();
        let blocks = parse_blocks(&blob);
        assert_eq!(blocks.len(), 2);

        let (rva, entries) = &blocks[0];
        assert_eq!(*rva, 0x1000);
        assert_eq!(entries.len(), 0x400);
        assert_eq!(entries[0], 0x3000);
        assert_eq!(entries[0x3ff], 0x3ffc);

        let (rva, entries) = &blocks[1];
        assert_eq!(*rva, 0x2000);
        assert_eq!(entries.as_slice(), &[0x3000]);
    }

    #[test]
    fn absolute_entries_are_elided() {
        let blob = serialize(vec![
            (0x1000, pe::IMAGE_REL_BASED_ABSOLUTE),
            (0x1008, pe::IMAGE_REL_BASED_ABSOLUTE),
        ])
        .unwrap();
        assert!(blob.is_empty());
    }

    #[test]
    fn block_base_is_page_aligned() {
        let blob = serialize(vec![(0x1abc, pe::IMAGE_REL_BASED_DIR64)]).unwrap();
        let blocks = parse_blocks(&blob);
        assert_eq!(blocks.len(), 1);
        let (rva, entries) = &blocks[0];
        assert_eq!(*rva, 0x1000);
        assert_eq!(entries.as_slice(), &[(10 << 12) | 0xabc]);
    }
}
