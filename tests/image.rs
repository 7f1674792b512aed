//! End-to-end image emission tests.
//!
//! Builds small images through the PE envelope and reads them back with
//! `object` to check that the headers, directories, and patched sites all
//! agree with what was configured.

use object::endian::LittleEndian as LE;
use object::pe;
use object::read::pe::PeFile64;

use r2rpe::builder::SectionBuilder;
use r2rpe::cor::{CorHeader, DirectoryEntry};
use r2rpe::input::InputImage;
use r2rpe::reloc::RelocType;
use r2rpe::section::{ObjectData, Relocation, SymbolDefinition};
use r2rpe::symbol::Symbol;
use r2rpe::writer::{write_image, PeParameters};

const TEXT: u32 = pe::IMAGE_SCN_CNT_CODE | pe::IMAGE_SCN_MEM_READ | pe::IMAGE_SCN_MEM_EXECUTE;
const DATA: u32 =
    pe::IMAGE_SCN_CNT_INITIALIZED_DATA | pe::IMAGE_SCN_MEM_READ | pe::IMAGE_SCN_MEM_WRITE;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap())
}

fn read_u64(data: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(data[offset..offset + 8].try_into().unwrap())
}

fn section_names(file: &PeFile64) -> Vec<String> {
    file.section_table()
        .iter()
        .map(|header| {
            String::from_utf8_lossy(&header.name)
                .trim_end_matches('\0')
                .to_string()
        })
        .collect()
}

/// RVA and raw contents of a named section, straight from the headers.
fn section<'a>(image: &'a [u8], file: &PeFile64<'a>, name: &str) -> (u32, &'a [u8]) {
    for header in file.section_table().iter() {
        if String::from_utf8_lossy(&header.name).trim_end_matches('\0') == name {
            let offset = header.pointer_to_raw_data.get(LE) as usize;
            let size = header.size_of_raw_data.get(LE) as usize;
            return (header.virtual_address.get(LE), &image[offset..offset + size]);
        }
    }
    panic!("missing section {}", name);
}

/// Parses a `.reloc` stream back into `(rva, type)` pairs.
fn parse_reloc_stream(data: &[u8]) -> Vec<(u32, u16)> {
    let mut pairs = Vec::new();
    let mut offset = 0;
    while offset + 8 <= data.len() {
        let base_rva = read_u32(data, offset);
        let block_size = read_u32(data, offset + 4) as usize;
        for entry_offset in (offset + 8..offset + block_size).step_by(2) {
            let entry = u16::from_le_bytes([data[entry_offset], data[entry_offset + 1]]);
            pairs.push((base_rva + u32::from(entry & 0xfff), entry >> 12));
        }
        offset += block_size;
    }
    pairs
}

#[test]
fn emits_a_parsable_relocated_image() {
    init_logging();

    let mut builder = SectionBuilder::new();
    let text = builder.add_section(".text", TEXT, 16).unwrap();
    let data = builder.add_section(".data", DATA, 8).unwrap();

    let func = Symbol::new(0);
    let cell = Symbol::new(1);

    // Code block referencing the data cell PC-relatively.
    let mut code = ObjectData::new(vec![0x90; 16], 16);
    code.defined_symbols.push(SymbolDefinition { symbol: func, offset: 0 });
    code.relocations.push(Relocation {
        offset: 4,
        kind: RelocType::Rel32,
        target: cell,
    });
    builder.add_object_data(code, text).unwrap();

    // Data cell holding the function's full and low-32 addresses.
    let mut bytes = ObjectData::new(vec![0; 16], 8);
    bytes.defined_symbols.push(SymbolDefinition { symbol: cell, offset: 0 });
    bytes.relocations.push(Relocation {
        offset: 0,
        kind: RelocType::Dir64,
        target: func,
    });
    bytes.relocations.push(Relocation {
        offset: 8,
        kind: RelocType::HighLow,
        target: func,
    });
    builder.add_object_data(bytes, data).unwrap();

    builder.set_dll_name("sample.dll").unwrap();
    builder.add_export_symbol("Run", 1, func).unwrap();
    builder.set_entry_point(func).unwrap();

    let params = PeParameters::default();
    let image = write_image(&mut builder, &params).unwrap();

    let func_rva = builder.symbol_rva(func).unwrap();
    let cell_rva = builder.symbol_rva(cell).unwrap();

    let file = PeFile64::parse(&*image).unwrap();
    let optional = &file.nt_headers().optional_header;
    assert_eq!(file.nt_headers().file_header.machine.get(LE), params.machine);
    assert_eq!(optional.image_base.get(LE), params.image_base);
    assert_eq!(optional.address_of_entry_point.get(LE), func_rva);

    assert_eq!(section_names(&file), [".text", ".data", ".edata", ".reloc"]);

    let (text_rva, text_data) = section(&image, &file, ".text");
    let (data_rva, data_data) = section(&image, &file, ".data");
    assert_eq!(text_rva, func_rva);
    assert_eq!(data_rva, cell_rva);

    // Patched sites.
    let rel32 = read_u32(text_data, 4) as i32;
    assert_eq!(rel32, cell_rva as i32 - (func_rva as i32 + 4) - 4);
    assert_eq!(read_u64(data_data, 0), params.image_base + u64::from(func_rva));
    assert_eq!(
        read_u32(data_data, 8),
        (params.image_base as u32).wrapping_add(func_rva)
    );

    // The base relocation directory round-trips to the recorded set; the
    // self-relative REL32 never enters it.
    let reloc_dir = file
        .data_directories()
        .get(pe::IMAGE_DIRECTORY_ENTRY_BASERELOC)
        .unwrap();
    let (reloc_rva, reloc_data) = section(&image, &file, ".reloc");
    assert_eq!(reloc_dir.virtual_address.get(LE), reloc_rva);
    let mut pairs = parse_reloc_stream(&reloc_data[..reloc_dir.size.get(LE) as usize]);
    pairs.sort();
    assert_eq!(
        pairs,
        [
            (cell_rva, pe::IMAGE_REL_BASED_DIR64),
            (cell_rva + 8, pe::IMAGE_REL_BASED_HIGHLOW),
        ]
    );

    // Export directory points into .edata and lists the one export.
    let export_dir = file
        .data_directories()
        .get(pe::IMAGE_DIRECTORY_ENTRY_EXPORT)
        .unwrap();
    let (edata_rva, edata) = section(&image, &file, ".edata");
    let dir_offset = (export_dir.virtual_address.get(LE) - edata_rva) as usize;
    assert_eq!(read_u32(edata, dir_offset + 16), 1, "ordinal base");
    assert_eq!(read_u32(edata, dir_offset + 20), 1, "address table length");
    let address_table = (read_u32(edata, dir_offset + 28) - edata_rva) as usize;
    assert_eq!(read_u32(edata, address_table), func_rva);
    assert!(edata.starts_with(b"Run\0"));
}

#[test]
fn rewrites_the_cor_header_for_ready_to_run() {
    init_logging();

    let mut builder = SectionBuilder::new();
    let text = builder.add_section(".text", TEXT, 16).unwrap();

    let cor_symbol = Symbol::new(0);
    let r2r_symbol = Symbol::new(1);

    let input_cor = CorHeader {
        major_runtime_version: 2,
        minor_runtime_version: 5,
        metadata: DirectoryEntry::new(0x9000, 0x100),
        flags: pe::COMIMAGE_FLAGS_ILONLY,
        entry_point_token_or_rva: 0x0600_0001,
        ..Default::default()
    };

    let mut cor_block = ObjectData::new(input_cor.serialize(), 4);
    cor_block.defined_symbols.push(SymbolDefinition {
        symbol: cor_symbol,
        offset: 0,
    });
    builder.add_object_data(cor_block, text).unwrap();

    let mut r2r_block = ObjectData::new(vec![0xaa; 0x20], 8);
    r2r_block.defined_symbols.push(SymbolDefinition {
        symbol: r2r_symbol,
        offset: 0,
    });
    builder.add_object_data(r2r_block, text).unwrap();

    builder.set_cor_header(input_cor.clone(), cor_symbol).unwrap();
    builder.set_ready_to_run_header(r2r_symbol, 0x20).unwrap();

    let image = write_image(&mut builder, &PeParameters::default()).unwrap();

    let view = InputImage::parse(&image).unwrap();
    assert_eq!(view.cor_header_rva(), builder.symbol_rva(cor_symbol).unwrap());
    let emitted = view.cor_header().unwrap().unwrap();
    assert_eq!(emitted.major_runtime_version, 2);
    assert_eq!(emitted.minor_runtime_version, 5);
    assert_eq!(emitted.metadata, input_cor.metadata);
    assert_eq!(emitted.entry_point_token_or_rva, 0x0600_0001);
    assert_eq!(emitted.flags & pe::COMIMAGE_FLAGS_ILONLY, 0);
    assert_ne!(emitted.flags & pe::COMIMAGE_FLAGS_IL_LIBRARY, 0);
    assert_eq!(
        emitted.managed_native_header,
        DirectoryEntry::new(builder.symbol_rva(r2r_symbol).unwrap(), 0x20)
    );
}
