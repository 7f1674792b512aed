//! Read-only view of the input managed assembly.
//!
//! The builder consumes the upstream assembly only through this narrow
//! interface: headers, entry-point metadata, the COR header, and raw
//! section contents. The caller owns the mapping; the view borrows it.

use anyhow::{Context, Result};
use memmap2::Mmap;
use object::endian::LittleEndian as LE;
use object::pe;
use object::read::pe::PeFile64;
use object::{Object, ObjectSection};
use std::fs::File;
use std::path::Path;

use crate::cor::CorHeader;

/// Memory-maps an assembly for parsing.
pub fn map_file(path: &Path) -> Result<Mmap> {
    let file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mmap = unsafe { Mmap::map(&file)? };
    Ok(mmap)
}

pub struct InputImage<'data> {
    data: &'data [u8],
    pe: PeFile64<'data>,
}

impl<'data> InputImage<'data> {
    pub fn parse(data: &'data [u8]) -> Result<Self> {
        let pe = PeFile64::parse(data).context("failed to parse input assembly")?;
        Ok(Self { data, pe })
    }

    pub fn machine(&self) -> u16 {
        self.pe.nt_headers().file_header.machine.get(LE)
    }

    pub fn is_dll(&self) -> bool {
        self.pe.nt_headers().file_header.characteristics.get(LE) & pe::IMAGE_FILE_DLL != 0
    }

    pub fn image_base(&self) -> u64 {
        self.pe.nt_headers().optional_header.image_base.get(LE)
    }

    pub fn section_alignment(&self) -> u32 {
        self.pe.nt_headers().optional_header.section_alignment.get(LE)
    }

    pub fn file_alignment(&self) -> u32 {
        self.pe.nt_headers().optional_header.file_alignment.get(LE)
    }

    pub fn entry_point_rva(&self) -> u32 {
        self.pe
            .nt_headers()
            .optional_header
            .address_of_entry_point
            .get(LE)
    }

    /// RVA of the COM descriptor directory, zero for native images.
    pub fn cor_header_rva(&self) -> u32 {
        self.pe
            .data_directories()
            .get(pe::IMAGE_DIRECTORY_ENTRY_COM_DESCRIPTOR)
            .map(|dir| dir.virtual_address.get(LE))
            .unwrap_or(0)
    }

    pub fn cor_header(&self) -> Result<Option<CorHeader>> {
        let rva = self.cor_header_rva();
        if rva == 0 {
            return Ok(None);
        }
        let data = self
            .pe
            .section_table()
            .pe_data_at(self.data, rva)
            .context("COR header RVA lies outside every section")?;
        CorHeader::parse(data).map(Some)
    }

    /// Raw contents of a named section, if present.
    pub fn section_data(&self, name: &str) -> Result<Option<&'data [u8]>> {
        match self.pe.section_by_name(name) {
            Some(section) => Ok(Some(section.data()?)),
            None => Ok(None),
        }
    }
}
