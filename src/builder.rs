//! PE section builder.
//!
//! 1. Ingest object-data blocks into named sections
//! 2. Place sections at their final RVAs and file positions
//! 3. Encode `.reloc` / `.edata` from the recorded placements
//! 4. Patch every relocation site while streaming the image out

use anyhow::{bail, ensure, Context, Result};
use object::pe;
use std::collections::HashMap;
use std::io::Write;
use tracing::debug;

use crate::baserel;
use crate::cor::{CorHeader, DirectoryEntry};
use crate::edata::{self, ExportSymbol};
use crate::patcher::ImagePatcher;
use crate::section::{
    ObjectData, PlacedRelocations, Section, SectionLocation, SectionPlacement,
};
use crate::symbol::{Symbol, SymbolTarget};
use crate::utils::align_up;

pub const RELOC_SECTION_NAME: &str = ".reloc";
pub const EXPORT_SECTION_NAME: &str = ".edata";

/// Values the builder feeds back into the PE header once the auxiliary
/// sections have been serialized.
#[derive(Debug, Clone)]
pub struct Directories {
    /// The sixteen `(rva, size)` data directory slots.
    pub entries: [DirectoryEntry; 16],
    /// `AddressOfEntryPoint`, zero when no entry point was set.
    pub entry_point_rva: u32,
}

impl Default for Directories {
    fn default() -> Self {
        Self {
            entries: [DirectoryEntry::default(); 16],
            entry_point_rva: 0,
        }
    }
}

/// One-way lifecycle of the builder. Configuration calls are only legal
/// before layout begins; patching consumes the layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Phase {
    Configuring,
    LaidOut,
    Sealed,
    Done,
}

pub struct SectionBuilder {
    sections: Vec<Section>,
    placements: Vec<Option<SectionPlacement>>,
    symbols: HashMap<Symbol, SymbolTarget>,
    exports: Vec<ExportSymbol>,
    dll_name: Option<String>,
    entry_point: Option<Symbol>,
    ready_to_run_header: Option<(Symbol, u32)>,
    cor_header: Option<(CorHeader, Symbol)>,
    export_directory: Option<DirectoryEntry>,
    base_reloc_directory: Option<DirectoryEntry>,
    phase: Phase,
}

impl Default for SectionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SectionBuilder {
    pub fn new() -> Self {
        Self {
            sections: Vec::new(),
            placements: Vec::new(),
            symbols: HashMap::new(),
            exports: Vec::new(),
            dll_name: None,
            entry_point: None,
            ready_to_run_header: None,
            cor_header: None,
            export_directory: None,
            base_reloc_directory: None,
            phase: Phase::Configuring,
        }
    }

    fn ensure_configuring(&self) -> Result<()> {
        ensure!(
            self.phase == Phase::Configuring,
            "configuration call after layout has begun"
        );
        Ok(())
    }

    /// Appends a new logical section and returns its handle.
    ///
    /// Names need not be unique; logical sections sharing a name fold into
    /// one physical output section at layout time.
    pub fn add_section(&mut self, name: &str, characteristics: u32, alignment: u32) -> Result<usize> {
        self.ensure_configuring()?;
        ensure!(
            alignment.is_power_of_two(),
            "section alignment {} is not a power of two",
            alignment
        );
        self.sections.push(Section::new(name, characteristics, alignment));
        self.placements.push(None);
        Ok(self.sections.len() - 1)
    }

    /// Handle of the first section with the given name.
    pub fn find_section(&self, name: &str) -> Option<usize> {
        self.sections.iter().position(|s| s.name == name)
    }

    pub fn section(&self, index: usize) -> Option<&Section> {
        self.sections.get(index)
    }

    /// Placement of a logical section, if it has been laid out.
    pub fn placement(&self, index: usize) -> Option<SectionPlacement> {
        self.placements.get(index).copied().flatten()
    }

    /// Appends one object-data block to a section, registering its defined
    /// symbols and recording its outbound relocations.
    pub fn add_object_data(&mut self, data: ObjectData, section_index: usize) -> Result<()> {
        self.ensure_configuring()?;
        let ObjectData {
            bytes,
            alignment,
            defined_symbols,
            relocations,
        } = data;
        ensure!(
            alignment >= 1 && alignment.is_power_of_two(),
            "object data alignment {} is not a power of two",
            alignment
        );

        let section = self
            .sections
            .get_mut(section_index)
            .with_context(|| format!("invalid section index {}", section_index))?;
        let current = section.data.len() as u64;
        let aligned = (current + u64::from(alignment) - 1) & !(u64::from(alignment) - 1);
        ensure!(
            aligned + bytes.len() as u64 <= u64::from(u32::MAX),
            "section {} exceeds 4 GiB",
            section.name
        );
        section.data.resize(aligned as usize, 0);
        section.data.extend_from_slice(&bytes);
        let aligned = aligned as u32;

        for def in &defined_symbols {
            ensure!(
                u64::from(def.offset) <= bytes.len() as u64,
                "symbol {} defined outside its block",
                def.symbol.id()
            );
            let target = SymbolTarget {
                section_index,
                offset: aligned + def.offset,
            };
            if self.symbols.insert(def.symbol, target).is_some() {
                bail!("duplicate definition of symbol {}", def.symbol.id());
            }
        }

        for reloc in &relocations {
            ensure!(
                u64::from(reloc.offset) + reloc.kind.site_len() as u64 <= bytes.len() as u64,
                "relocation site at {:#x} extends beyond its block",
                reloc.offset
            );
        }
        if !relocations.is_empty() {
            self.sections[section_index].relocations.push(PlacedRelocations {
                offset: aligned,
                relocations,
            });
        }
        Ok(())
    }

    /// Exports `symbol` under `name` with the given ordinal. Name and
    /// ordinal uniqueness is the caller's responsibility.
    pub fn add_export_symbol(&mut self, name: &str, ordinal: u16, symbol: Symbol) -> Result<()> {
        self.ensure_configuring()?;
        self.exports.push(ExportSymbol::new(name, ordinal, symbol));
        Ok(())
    }

    pub fn set_dll_name(&mut self, name: &str) -> Result<()> {
        self.ensure_configuring()?;
        self.dll_name = Some(name.to_string());
        Ok(())
    }

    pub fn set_entry_point(&mut self, symbol: Symbol) -> Result<()> {
        self.ensure_configuring()?;
        self.entry_point = Some(symbol);
        Ok(())
    }

    /// Records the symbol and size of the Ready-to-Run header so the COR
    /// header's managed-native-header directory can point at it.
    pub fn set_ready_to_run_header(&mut self, symbol: Symbol, size: u32) -> Result<()> {
        self.ensure_configuring()?;
        self.ready_to_run_header = Some((symbol, size));
        Ok(())
    }

    /// Supplies the COR header to rewrite during patching. `symbol` marks
    /// where the serialized header bytes live in the output image, so this
    /// is part of the patch wiring rather than section configuration and
    /// stays legal after layout.
    pub fn set_cor_header(&mut self, header: CorHeader, symbol: Symbol) -> Result<()> {
        ensure!(self.phase != Phase::Done, "output already relocated");
        self.cor_header = Some((header, symbol));
        Ok(())
    }

    /// Deduplicated `(name, characteristics)` pairs in first-appearance
    /// order, plus a synthetic `.edata` when exports exist but the caller
    /// never added one.
    pub fn get_sections(&self) -> Vec<(String, u32)> {
        let mut result: Vec<(String, u32)> = Vec::new();
        for section in &self.sections {
            if !result.iter().any(|(name, _)| name == &section.name) {
                result.push((section.name.clone(), section.characteristics));
            }
        }
        if !self.exports.is_empty() && !result.iter().any(|(name, _)| name == EXPORT_SECTION_NAME) {
            result.push((
                EXPORT_SECTION_NAME.to_string(),
                pe::IMAGE_SCN_CNT_INITIALIZED_DATA | pe::IMAGE_SCN_MEM_READ,
            ));
        }
        result
    }

    /// True when at least one recorded relocation will reach `.reloc`.
    pub fn has_base_relocations(&self) -> bool {
        self.sections
            .iter()
            .flat_map(|s| &s.relocations)
            .flat_map(|b| &b.relocations)
            .any(|r| r.kind.file_reloc_type() != pe::IMAGE_REL_BASED_ABSOLUTE)
    }

    /// Whether serializing `name` would produce any bytes.
    pub fn section_has_content(&self, name: &str) -> bool {
        if name == EXPORT_SECTION_NAME && !self.exports.is_empty() {
            return true;
        }
        self.sections.iter().any(|s| s.name == name && !s.is_empty())
    }

    /// Final RVA of a defined symbol; fails while its section is unplaced.
    pub fn symbol_rva(&self, symbol: Symbol) -> Result<u32> {
        resolve_rva(&self.symbols, &self.placements, symbol)
    }

    /// Serializes the physical section `name` at `location`.
    ///
    /// For ordinary names this folds every logical section sharing the name,
    /// in insertion order, with combining-alignment padding between them,
    /// and freezes their placements. `.reloc` and `.edata` are encoded from
    /// the placements instead and must come after every ordinary section.
    pub fn serialize_section(&mut self, name: &str, location: SectionLocation) -> Result<Vec<u8>> {
        match name {
            RELOC_SECTION_NAME => self.serialize_base_relocations(location),
            EXPORT_SECTION_NAME if !self.exports.is_empty() => self.serialize_exports(location),
            _ => self.serialize_folded(name, location),
        }
    }

    fn serialize_folded(&mut self, name: &str, location: SectionLocation) -> Result<Vec<u8>> {
        ensure!(
            self.phase <= Phase::LaidOut,
            "section {} serialized after the layout was sealed",
            name
        );
        self.phase = Phase::LaidOut;

        let mut blob = Vec::new();
        for index in 0..self.sections.len() {
            if self.sections[index].name != name {
                continue;
            }
            ensure!(
                self.placements[index].is_none(),
                "section {} serialized twice",
                name
            );
            let padded =
                align_up(location.rva + blob.len() as u32, self.sections[index].alignment)
                    - location.rva;
            blob.resize(padded as usize, 0);
            let placement = SectionPlacement {
                rva: location.rva + padded,
                file_pos: location.file_offset + padded,
            };
            debug!(
                name,
                rva = placement.rva,
                size = self.sections[index].len(),
                "placed section"
            );
            self.placements[index] = Some(placement);
            blob.extend_from_slice(&self.sections[index].data);
        }
        Ok(blob)
    }

    fn serialize_exports(&mut self, location: SectionLocation) -> Result<Vec<u8>> {
        ensure!(
            matches!(self.phase, Phase::LaidOut | Phase::Sealed),
            "export section serialized before layout"
        );
        let dll_name = self
            .dll_name
            .clone()
            .context("DLL name not set for the export directory")?;

        let mut exports = std::mem::take(&mut self.exports);
        let symbols = &self.symbols;
        let placements = &self.placements;
        let result = edata::serialize(&mut exports, &dll_name, location, |symbol| {
            resolve_rva(symbols, placements, symbol)
        });
        self.exports = exports;

        let (blob, directory) = result?;
        debug!(count = self.exports.len(), size = blob.len(), "serialized export section");
        self.export_directory = Some(directory);
        self.phase = Phase::Sealed;
        Ok(blob)
    }

    fn serialize_base_relocations(&mut self, location: SectionLocation) -> Result<Vec<u8>> {
        ensure!(
            matches!(self.phase, Phase::LaidOut | Phase::Sealed),
            ".reloc serialized before layout"
        );

        let mut pairs = Vec::new();
        for &index in &self.relocated_section_order()? {
            let placement = self.placements[index].context("section placement missing")?;
            for block in &self.sections[index].relocations {
                for reloc in &block.relocations {
                    pairs.push((
                        placement.rva + block.offset + reloc.offset,
                        reloc.kind.file_reloc_type(),
                    ));
                }
            }
        }

        let blob = baserel::serialize(pairs)?;
        if !blob.is_empty() {
            self.base_reloc_directory =
                Some(DirectoryEntry::new(location.rva, blob.len() as u32));
        }
        debug!(size = blob.len(), "serialized base relocation section");
        self.phase = Phase::Sealed;
        Ok(blob)
    }

    /// Indices of relocation-carrying sections in ascending placement
    /// order. Fails if any of them was never placed, which would mean the
    /// auxiliary sections were serialized too early.
    fn relocated_section_order(&self) -> Result<Vec<usize>> {
        let mut order = Vec::new();
        for (index, section) in self.sections.iter().enumerate() {
            if section.relocations.is_empty() {
                continue;
            }
            ensure!(
                self.placements[index].is_some(),
                "section {} carries relocations but was never placed",
                section.name
            );
            order.push(index);
        }
        order.sort_by_key(|&index| self.placements[index].map(|p| p.rva));
        Ok(order)
    }

    /// Writes the export, base-relocation, and entry-point values back into
    /// the caller's PE header state.
    pub fn update_directories(&self, directories: &mut Directories) -> Result<()> {
        if let Some(entry) = self.export_directory {
            directories.entries[pe::IMAGE_DIRECTORY_ENTRY_EXPORT] = entry;
        }
        if let Some(entry) = self.base_reloc_directory {
            directories.entries[pe::IMAGE_DIRECTORY_ENTRY_BASERELOC] = entry;
        }
        if let Some((_, symbol)) = &self.cor_header {
            let rva = self
                .symbol_rva(*symbol)
                .context("resolving the COR header")?;
            directories.entries[pe::IMAGE_DIRECTORY_ENTRY_COM_DESCRIPTOR] =
                DirectoryEntry::new(rva, crate::cor::COR_HEADER_SIZE as u32);
        }
        if let Some(symbol) = self.entry_point {
            directories.entry_point_rva = self
                .symbol_rva(symbol)
                .context("resolving the entry point")?;
        }
        Ok(())
    }

    /// Rewrites a COR header for the emitted image: points the
    /// managed-native-header directory at the Ready-to-Run header and flips
    /// the image from IL-only to IL-library.
    pub fn update_cor_header(&self, header: &mut CorHeader) -> Result<()> {
        if let Some((symbol, size)) = self.ready_to_run_header {
            let rva = self
                .symbol_rva(symbol)
                .context("resolving the ready-to-run header")?;
            header.managed_native_header = DirectoryEntry::new(rva, size);
        }
        header.flags = (header.flags & !pe::COMIMAGE_FLAGS_ILONLY) | pe::COMIMAGE_FLAGS_IL_LIBRARY;
        Ok(())
    }

    /// Streams the assembled image to `output`, substituting the rewritten
    /// COR header and the final value at every relocation site.
    ///
    /// Every referenced symbol must be defined and every
    /// relocation-carrying section placed; the stream's own write errors
    /// propagate unchanged.
    pub fn relocate_output_file<W: Write>(
        &mut self,
        image: &[u8],
        image_base: u64,
        output: W,
    ) -> Result<()> {
        ensure!(self.phase != Phase::Done, "output already relocated");

        let mut patcher = ImagePatcher::new(image, image_base, output);

        if let Some((header, symbol)) = &self.cor_header {
            let target = self
                .symbols
                .get(symbol)
                .context("COR header symbol is undefined")?;
            let placement = self.placements[target.section_index]
                .context("COR header section was never placed")?;
            let file_pos = placement.file_pos + target.offset;
            let mut header = header.clone();
            self.update_cor_header(&mut header)?;
            patcher.write_cor_header(&header, file_pos as usize)?;
        }

        let mut patched = 0usize;
        for &index in &self.relocated_section_order()? {
            let placement = self.placements[index].context("section placement missing")?;
            for block in &self.sections[index].relocations {
                for reloc in &block.relocations {
                    let site_rva = placement.rva + block.offset + reloc.offset;
                    let site_file = placement.file_pos + block.offset + reloc.offset;
                    let target_rva = resolve_rva(&self.symbols, &self.placements, reloc.target)
                        .with_context(|| {
                            format!("relocation at {:#x} in {}", site_rva, self.sections[index].name)
                        })?;
                    patcher.patch(reloc.kind, site_rva, target_rva, site_file as usize)?;
                    patched += 1;
                }
            }
        }
        patcher.finish()?;
        debug!(patched, "relocated output file");

        self.phase = Phase::Done;
        Ok(())
    }
}

fn resolve_rva(
    symbols: &HashMap<Symbol, SymbolTarget>,
    placements: &[Option<SectionPlacement>],
    symbol: Symbol,
) -> Result<u32> {
    let target = symbols
        .get(&symbol)
        .with_context(|| format!("undefined symbol {}", symbol.id()))?;
    let placement = placements[target.section_index]
        .with_context(|| format!("section {} was never placed", target.section_index))?;
    Ok(placement.rva + target.offset)
}
