//! `.edata` export directory encoding.
//!
//! The export section is a single contiguous blob: the name string table,
//! the DLL name, the name pointer table, the ordinal table, the address
//! table, and finally the 40-byte export directory. Exports are sorted by
//! byte-wise ordinal comparison of their names before any table is written;
//! the address table alone is indexed by ordinal rather than sort order.

use anyhow::{ensure, Context, Result};
use object::endian::{LittleEndian as LE, U16, U32};
use object::pe;
use object::pod::bytes_of;

use crate::cor::DirectoryEntry;
use crate::section::SectionLocation;
use crate::symbol::Symbol;

/// Largest address table the encoder will emit.
const MAX_ADDRESS_TABLE_LEN: u32 = 4096;

/// A symbol exported by name and ordinal from the output image.
#[derive(Debug, Clone)]
pub struct ExportSymbol {
    pub name: String,
    pub ordinal: u16,
    pub symbol: Symbol,
    /// RVA of the name string, assigned while `.edata` is serialized.
    pub name_rva_when_placed: u32,
}

impl ExportSymbol {
    pub fn new(name: &str, ordinal: u16, symbol: Symbol) -> Self {
        Self {
            name: name.to_string(),
            ordinal,
            symbol,
            name_rva_when_placed: 0,
        }
    }
}

/// Serializes the export section at `location`.
///
/// `resolve` maps an export's target symbol to its final RVA; every target
/// must already be placed. Returns the section bytes and the directory
/// entry to record in the PE header.
pub(crate) fn serialize(
    exports: &mut [ExportSymbol],
    dll_name: &str,
    location: SectionLocation,
    resolve: impl Fn(Symbol) -> Result<u32>,
) -> Result<(Vec<u8>, DirectoryEntry)> {
    ensure!(!exports.is_empty(), "no exports to serialize");
    exports.sort_by(|a, b| a.name.as_bytes().cmp(b.name.as_bytes()));

    let min_ordinal = exports.iter().map(|e| e.ordinal).min().unwrap_or(0);
    let max_ordinal = exports.iter().map(|e| e.ordinal).max().unwrap_or(0);
    let address_table_len = u32::from(max_ordinal - min_ordinal) + 1;
    ensure!(
        address_table_len <= MAX_ADDRESS_TABLE_LEN,
        "export ordinal range {}..={} exceeds the address table limit",
        min_ordinal,
        max_ordinal
    );

    let mut blob = Vec::new();

    // Name string table.
    for export in exports.iter_mut() {
        export.name_rva_when_placed = location.rva + blob.len() as u32;
        blob.extend_from_slice(export.name.as_bytes());
        blob.push(0);
    }

    let dll_name_rva = location.rva + blob.len() as u32;
    blob.extend_from_slice(dll_name.as_bytes());
    blob.push(0);

    // Address table entries default to zero; holes in the ordinal range
    // stay unexported.
    let mut address_table = vec![0u32; address_table_len as usize];
    for export in exports.iter() {
        let rva = resolve(export.symbol)
            .with_context(|| format!("resolving export '{}'", export.name))?;
        address_table[usize::from(export.ordinal - min_ordinal)] = rva;
    }

    let name_pointer_table_rva = location.rva + blob.len() as u32;
    for export in exports.iter() {
        blob.extend_from_slice(&export.name_rva_when_placed.to_le_bytes());
    }

    let ordinal_table_rva = location.rva + blob.len() as u32;
    for export in exports.iter() {
        blob.extend_from_slice(&(export.ordinal - min_ordinal).to_le_bytes());
    }

    let address_table_rva = location.rva + blob.len() as u32;
    for entry in &address_table {
        blob.extend_from_slice(&entry.to_le_bytes());
    }

    let directory_rva = location.rva + blob.len() as u32;
    let directory = pe::ImageExportDirectory {
        characteristics: U32::new(LE, 0),
        time_date_stamp: U32::new(LE, 0),
        major_version: U16::new(LE, 0),
        minor_version: U16::new(LE, 0),
        name: U32::new(LE, dll_name_rva),
        base: U32::new(LE, u32::from(min_ordinal)),
        number_of_functions: U32::new(LE, address_table_len),
        number_of_names: U32::new(LE, exports.len() as u32),
        address_of_functions: U32::new(LE, address_table_rva),
        address_of_names: U32::new(LE, name_pointer_table_rva),
        address_of_name_ordinals: U32::new(LE, ordinal_table_rva),
    };
    blob.extend_from_slice(bytes_of(&directory));

    let entry = DirectoryEntry::new(directory_rva, blob.len() as u32);
    Ok((blob, entry))
}
