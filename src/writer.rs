//! PE envelope writer.
//!
//! This module drives a `SectionBuilder` end-to-end: it lays out every
//! physical section, wraps them in PE32+ headers, and runs the final
//! relocation pass over the assembled image.

use anyhow::{bail, ensure, Result};
use object::endian::{LittleEndian as LE, U16, U32, U64};
use object::pe;
use object::pod::bytes_of;
use std::mem;
use tracing::debug;

use crate::builder::{Directories, SectionBuilder, RELOC_SECTION_NAME};
use crate::section::SectionLocation;
use crate::utils::align_up;

const DOS_HEADER_SIZE: u32 = 64;
const NUM_DIRECTORIES: usize = 16;

fn u16(v: u16) -> U16<LE> {
    U16::new(LE, v)
}
fn u32(v: u32) -> U32<LE> {
    U32::new(LE, v)
}
fn u64(v: u64) -> U64<LE> {
    U64::new(LE, v)
}

/// Header values supplied by the compilation driver, typically copied from
/// the input assembly.
#[derive(Debug, Clone)]
pub struct PeParameters {
    pub machine: u16,
    pub image_base: u64,
    pub section_alignment: u32,
    pub file_alignment: u32,
    pub subsystem: u16,
    pub dll_characteristics: u16,
    pub file_characteristics: u16,
}

impl Default for PeParameters {
    fn default() -> Self {
        Self {
            machine: pe::IMAGE_FILE_MACHINE_AMD64,
            image_base: 0x1_4000_0000,
            section_alignment: 0x1000,
            file_alignment: 0x200,
            subsystem: pe::IMAGE_SUBSYSTEM_WINDOWS_CUI,
            dll_characteristics: pe::IMAGE_DLLCHARACTERISTICS_DYNAMIC_BASE
                | pe::IMAGE_DLLCHARACTERISTICS_NX_COMPAT
                | pe::IMAGE_DLLCHARACTERISTICS_HIGH_ENTROPY_VA,
            file_characteristics: pe::IMAGE_FILE_EXECUTABLE_IMAGE
                | pe::IMAGE_FILE_LARGE_ADDRESS_AWARE
                | pe::IMAGE_FILE_DLL,
        }
    }
}

struct PlacedSection {
    name: [u8; 8],
    characteristics: u32,
    rva: u32,
    virtual_size: u32,
    file_offset: u32,
    raw_size: u32,
    content: Vec<u8>,
}

/// Writes a complete PE32+ image and returns the patched bytes.
pub fn write_image(builder: &mut SectionBuilder, params: &PeParameters) -> Result<Vec<u8>> {
    // Physical sections in layout order. `.reloc` references every earlier
    // placement, so it always goes last.
    let mut names: Vec<(String, u32)> = builder
        .get_sections()
        .into_iter()
        .filter(|(name, _)| builder.section_has_content(name))
        .collect();
    if builder.has_base_relocations() {
        if names.iter().any(|(name, _)| name == RELOC_SECTION_NAME) {
            bail!("{} must not be added as a content section", RELOC_SECTION_NAME);
        }
        names.push((
            RELOC_SECTION_NAME.to_string(),
            pe::IMAGE_SCN_CNT_INITIALIZED_DATA
                | pe::IMAGE_SCN_MEM_READ
                | pe::IMAGE_SCN_MEM_DISCARDABLE,
        ));
    }
    ensure!(!names.is_empty(), "no sections to emit");

    let headers_len = DOS_HEADER_SIZE
        + 4
        + mem::size_of::<pe::ImageFileHeader>() as u32
        + mem::size_of::<pe::ImageOptionalHeader64>() as u32
        + (NUM_DIRECTORIES * mem::size_of::<pe::ImageDataDirectory>()) as u32
        + (names.len() * mem::size_of::<pe::ImageSectionHeader>()) as u32;
    let size_of_headers = align_up(headers_len, params.file_alignment);

    // Serialize the sections at their final locations.
    let mut placed: Vec<PlacedSection> = Vec::new();
    let mut rva = align_up(size_of_headers, params.section_alignment);
    let mut file_offset = size_of_headers;
    for (name, characteristics) in &names {
        let location = SectionLocation { rva, file_offset };
        let content = builder.serialize_section(name, location)?;
        if content.is_empty() {
            continue;
        }
        let virtual_size = content.len() as u32;
        let raw_size = align_up(virtual_size, params.file_alignment);
        placed.push(PlacedSection {
            name: section_name_bytes(name)?,
            characteristics: *characteristics,
            rva,
            virtual_size,
            file_offset,
            raw_size,
            content,
        });
        rva = align_up(rva + virtual_size, params.section_alignment);
        file_offset += raw_size;
    }
    let size_of_image = rva;
    let total_file_size = file_offset;

    let mut directories = Directories::default();
    builder.update_directories(&mut directories)?;

    let mut size_of_code = 0u32;
    let mut size_of_initialized_data = 0u32;
    let mut base_of_code = 0u32;
    for section in &placed {
        if section.characteristics & pe::IMAGE_SCN_CNT_CODE != 0 {
            if base_of_code == 0 {
                base_of_code = section.rva;
            }
            size_of_code += section.raw_size;
        } else if section.characteristics & pe::IMAGE_SCN_CNT_INITIALIZED_DATA != 0 {
            size_of_initialized_data += section.raw_size;
        }
    }

    // Assemble the unpatched image.
    let mut image = Vec::with_capacity(total_file_size as usize);

    let dos_header = pe::ImageDosHeader {
        e_magic: u16(pe::IMAGE_DOS_SIGNATURE),
        e_cblp: u16(0),
        e_cp: u16(0),
        e_crlc: u16(0),
        e_cparhdr: u16(0),
        e_minalloc: u16(0),
        e_maxalloc: u16(0),
        e_ss: u16(0),
        e_sp: u16(0),
        e_csum: u16(0),
        e_ip: u16(0),
        e_cs: u16(0),
        e_lfarlc: u16(0),
        e_ovno: u16(0),
        e_res: [u16(0); 4],
        e_oemid: u16(0),
        e_oeminfo: u16(0),
        e_res2: [u16(0); 10],
        e_lfanew: u32(DOS_HEADER_SIZE),
    };
    image.extend_from_slice(bytes_of(&dos_header));
    image.extend_from_slice(&pe::IMAGE_NT_SIGNATURE.to_le_bytes());

    let file_header = pe::ImageFileHeader {
        machine: u16(params.machine),
        number_of_sections: u16(placed.len() as u16),
        time_date_stamp: u32(0),
        pointer_to_symbol_table: u32(0),
        number_of_symbols: u32(0),
        size_of_optional_header: u16(
            (mem::size_of::<pe::ImageOptionalHeader64>()
                + NUM_DIRECTORIES * mem::size_of::<pe::ImageDataDirectory>()) as u16,
        ),
        characteristics: u16(params.file_characteristics),
    };
    image.extend_from_slice(bytes_of(&file_header));

    let optional_header = pe::ImageOptionalHeader64 {
        magic: u16(pe::IMAGE_NT_OPTIONAL_HDR64_MAGIC),
        major_linker_version: 0,
        minor_linker_version: 0,
        size_of_code: u32(size_of_code),
        size_of_initialized_data: u32(size_of_initialized_data),
        size_of_uninitialized_data: u32(0),
        address_of_entry_point: u32(directories.entry_point_rva),
        base_of_code: u32(base_of_code),
        image_base: u64(params.image_base),
        section_alignment: u32(params.section_alignment),
        file_alignment: u32(params.file_alignment),
        major_operating_system_version: u16(6),
        minor_operating_system_version: u16(0),
        major_image_version: u16(0),
        minor_image_version: u16(0),
        major_subsystem_version: u16(6),
        minor_subsystem_version: u16(0),
        win32_version_value: u32(0),
        size_of_image: u32(size_of_image),
        size_of_headers: u32(size_of_headers),
        check_sum: u32(0),
        subsystem: u16(params.subsystem),
        dll_characteristics: u16(params.dll_characteristics),
        size_of_stack_reserve: u64(0x10_0000),
        size_of_stack_commit: u64(0x1000),
        size_of_heap_reserve: u64(0x10_0000),
        size_of_heap_commit: u64(0x1000),
        loader_flags: u32(0),
        number_of_rva_and_sizes: u32(NUM_DIRECTORIES as u32),
    };
    image.extend_from_slice(bytes_of(&optional_header));

    for entry in &directories.entries {
        let directory = pe::ImageDataDirectory {
            virtual_address: u32(entry.rva),
            size: u32(entry.size),
        };
        image.extend_from_slice(bytes_of(&directory));
    }

    for section in &placed {
        let header = pe::ImageSectionHeader {
            name: section.name,
            virtual_size: u32(section.virtual_size),
            virtual_address: u32(section.rva),
            size_of_raw_data: u32(section.raw_size),
            pointer_to_raw_data: u32(section.file_offset),
            pointer_to_relocations: u32(0),
            pointer_to_linenumbers: u32(0),
            number_of_relocations: u16(0),
            number_of_linenumbers: u16(0),
            characteristics: u32(section.characteristics),
        };
        image.extend_from_slice(bytes_of(&header));
    }

    for section in &placed {
        image.resize(section.file_offset as usize, 0);
        image.extend_from_slice(&section.content);
    }
    image.resize(total_file_size as usize, 0);

    // Final relocation pass over the assembled bytes.
    let mut output = Vec::with_capacity(image.len());
    builder.relocate_output_file(&image, params.image_base, &mut output)?;
    debug!(size = output.len(), sections = placed.len(), "wrote PE image");
    Ok(output)
}

fn section_name_bytes(name: &str) -> Result<[u8; 8]> {
    let bytes = name.as_bytes();
    ensure!(bytes.len() <= 8, "section name {} longer than 8 bytes", name);
    let mut out = [0u8; 8];
    out[..bytes.len()].copy_from_slice(bytes);
    Ok(out)
}
