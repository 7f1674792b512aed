//! COR (CLI) header serialization.
//!
//! The COR header identifies the image as managed and carries the directory
//! entries for metadata, resources, and Ready-to-Run content. The builder
//! keeps it as plain values until the patcher rewrites it in the output
//! stream.

use anyhow::{ensure, Result};
use object::endian::{LittleEndian as LE, U16, U32};
use object::pe;
use object::pod::bytes_of;

/// Size of the serialized COR header in bytes.
pub const COR_HEADER_SIZE: usize = 72;

/// An `(rva, size)` pair as stored in PE directory tables.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub rva: u32,
    pub size: u32,
}

impl DirectoryEntry {
    pub fn new(rva: u32, size: u32) -> Self {
        Self { rva, size }
    }

    fn to_pe(self) -> pe::ImageDataDirectory {
        pe::ImageDataDirectory {
            virtual_address: U32::new(LE, self.rva),
            size: U32::new(LE, self.size),
        }
    }

    fn read(data: &[u8], offset: usize) -> Self {
        Self {
            rva: read_u32(data, offset),
            size: read_u32(data, offset + 4),
        }
    }
}

fn read_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

/// The `IMAGE_COR20_HEADER` contents.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CorHeader {
    pub major_runtime_version: u16,
    pub minor_runtime_version: u16,
    pub metadata: DirectoryEntry,
    pub flags: u32,
    pub entry_point_token_or_rva: u32,
    pub resources: DirectoryEntry,
    pub strong_name_signature: DirectoryEntry,
    pub code_manager_table: DirectoryEntry,
    pub vtable_fixups: DirectoryEntry,
    pub export_address_table_jumps: DirectoryEntry,
    pub managed_native_header: DirectoryEntry,
}

impl CorHeader {
    pub fn serialize(&self) -> Vec<u8> {
        let raw = pe::ImageCor20Header {
            cb: U32::new(LE, COR_HEADER_SIZE as u32),
            major_runtime_version: U16::new(LE, self.major_runtime_version),
            minor_runtime_version: U16::new(LE, self.minor_runtime_version),
            meta_data: self.metadata.to_pe(),
            flags: U32::new(LE, self.flags),
            entry_point_token_or_rva: U32::new(LE, self.entry_point_token_or_rva),
            resources: self.resources.to_pe(),
            strong_name_signature: self.strong_name_signature.to_pe(),
            code_manager_table: self.code_manager_table.to_pe(),
            vtable_fixups: self.vtable_fixups.to_pe(),
            export_address_table_jumps: self.export_address_table_jumps.to_pe(),
            managed_native_header: self.managed_native_header.to_pe(),
        };
        bytes_of(&raw).to_vec()
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        ensure!(data.len() >= COR_HEADER_SIZE, "COR header truncated");
        let cb = read_u32(data, 0);
        ensure!(
            cb as usize == COR_HEADER_SIZE,
            "unexpected COR header size {}",
            cb
        );
        Ok(Self {
            major_runtime_version: read_u16(data, 4),
            minor_runtime_version: read_u16(data, 6),
            metadata: DirectoryEntry::read(data, 8),
            flags: read_u32(data, 16),
            entry_point_token_or_rva: read_u32(data, 20),
            resources: DirectoryEntry::read(data, 24),
            strong_name_signature: DirectoryEntry::read(data, 32),
            code_manager_table: DirectoryEntry::read(data, 40),
            vtable_fixups: DirectoryEntry::read(data, 48),
            export_address_table_jumps: DirectoryEntry::read(data, 56),
            managed_native_header: DirectoryEntry::read(data, 64),
        })
    }
}
