//! ELF64 executable serialization.
//!
//! The emitted image is laid out in file order as:
//!
//! ```text
//! ┌──────────────────────┐ 0
//! │      ELF header      │
//! ├──────────────────────┤ 64
//! │  2 program headers   │  (text R+X, data R+W)
//! ├──────────────────────┤ text offset (page aligned)
//! │     .text bytes      │
//! ├──────────────────────┤ data offset
//! │     .data bytes      │
//! ├──────────────────────┤ string table offset
//! │      .shstrtab       │
//! ├──────────────────────┤ section header offset
//! │  4 section headers   │  (null, .text, .data, .shstrtab)
//! └──────────────────────┘
//! ```
//!
//! Every multi-byte field is little-endian, and every structure's declared
//! offset equals its actual byte position in the image.

use std::{fs, io, path::Path};

use crate::backend::{asm::AssemblyProgram, encode};

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const EV_CURRENT: u8 = 1;
const ELFOSABI_SYSV: u8 = 0;

const ET_EXEC: u16 = 2;
const EM_X86_64: u16 = 62;

const PT_LOAD: u32 = 1;
const PF_X: u32 = 1;
const PF_W: u32 = 2;
const PF_R: u32 = 4;

const SHT_NULL: u32 = 0;
const SHT_PROGBITS: u32 = 1;
const SHT_STRTAB: u32 = 3;
const SHF_WRITE: u64 = 1;
const SHF_ALLOC: u64 = 2;
const SHF_EXECINSTR: u64 = 4;

/// Fixed load address for the whole image
const BASE_ADDRESS: u64 = 0x400000;
const PAGE_SIZE: u64 = 0x1000;

const ELF64_EHDR_SIZE: u16 = 64;
const ELF64_PHDR_SIZE: u16 = 56;
const ELF64_SHDR_SIZE: u16 = 64;

const PROGRAM_HEADER_COUNT: u16 = 2;
const SECTION_HEADER_COUNT: u16 = 4;

/// Section name string table, and the name offsets the section headers use.
/// `.data`'s offset lands one byte into its name (reading "data"); it is
/// kept that way so the emitted header bytes stay stable.
const SHSTRTAB: &[u8] = b"\0.text\0.data\0.shstrtab\0";
const TEXT_NAME_OFFSET: u32 = 1;
const DATA_NAME_OFFSET: u32 = 7;
const SHSTRTAB_NAME_OFFSET: u32 = 13;

/// Room reserved for the string table before the section headers start
const SHSTRTAB_RESERVED: u64 = 32;

/// Index of .shstrtab in the section header table
const SHSTRTAB_SECTION_INDEX: u16 = 3;

/// Encodes the program and writes it to `path` as an executable.
///
/// Any I/O failure propagates; a failed write may leave a truncated file
/// behind.
pub fn write_executable(program: &AssemblyProgram, path: &Path) -> io::Result<()> {
    let image = build_image(program);

    fs::write(path, &image)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
    }

    Ok(())
}

/// Serializes the complete executable image into a byte buffer
pub fn build_image(program: &AssemblyProgram) -> Vec<u8> {
    let text = encode::encode(&program.text, program.label_count);
    let data = program
        .data
        .as_ref()
        .map(|data| data.to_bytes())
        .unwrap_or_default();

    let layout = ImageLayout::compute(text.len(), data.len());

    let mut image = Vec::with_capacity(layout.section_header_offset as usize + 4 * 64);

    Elf64Header {
        entry: layout.text_vaddr(),
        section_header_offset: layout.section_header_offset,
    }
    .emit(&mut image);

    Elf64ProgramHeader {
        flags: PF_R | PF_X,
        offset: layout.text_offset,
        vaddr: layout.text_vaddr(),
        size: text.len() as u64,
    }
    .emit(&mut image);

    Elf64ProgramHeader {
        flags: PF_R | PF_W,
        offset: layout.data_offset,
        vaddr: layout.data_vaddr(),
        size: data.len() as u64,
    }
    .emit(&mut image);

    pad_to(&mut image, layout.text_offset);
    image.extend_from_slice(&text);

    pad_to(&mut image, layout.data_offset);
    image.extend_from_slice(&data);

    pad_to(&mut image, layout.shstrtab_offset);
    image.extend_from_slice(SHSTRTAB);

    pad_to(&mut image, layout.section_header_offset);
    emit_section_headers(&mut image, &layout);

    image
}

/// File offsets and derived virtual addresses tying the image together.
/// Loadable regions keep `vaddr % PAGE_SIZE == offset % PAGE_SIZE` because
/// every virtual address is the base address plus the file offset.
struct ImageLayout {
    text_offset: u64,
    text_size: u64,
    data_offset: u64,
    data_size: u64,
    shstrtab_offset: u64,
    section_header_offset: u64,
}

impl ImageLayout {
    fn compute(text_size: usize, data_size: usize) -> Self {
        let headers_end = ELF64_EHDR_SIZE as u64 + PROGRAM_HEADER_COUNT as u64 * ELF64_PHDR_SIZE as u64;
        let text_offset = align_to_page(headers_end);

        let mut data_offset = text_offset + text_size as u64;
        if data_size > 0 {
            data_offset = align_to_page(data_offset);
        }

        // The string table and section headers live past both loadable
        // segments; force them off the text page even for tiny programs
        let shstrtab_offset = (data_offset + data_size as u64).max(text_offset + PAGE_SIZE);
        let section_header_offset = shstrtab_offset + SHSTRTAB_RESERVED;

        Self {
            text_offset,
            text_size: text_size as u64,
            data_offset,
            data_size: data_size as u64,
            shstrtab_offset,
            section_header_offset,
        }
    }

    fn text_vaddr(&self) -> u64 {
        BASE_ADDRESS + self.text_offset
    }

    fn data_vaddr(&self) -> u64 {
        BASE_ADDRESS + self.data_offset
    }
}

fn align_to_page(offset: u64) -> u64 {
    offset.div_ceil(PAGE_SIZE) * PAGE_SIZE
}

fn pad_to(image: &mut Vec<u8>, offset: u64) {
    debug_assert!(image.len() as u64 <= offset);
    image.resize(offset as usize, 0);
}

struct Elf64Header {
    entry: u64,
    section_header_offset: u64,
}

impl Elf64Header {
    fn emit(&self, out: &mut Vec<u8>) {
        // e_ident (16 bytes)
        out.extend_from_slice(&ELF_MAGIC);
        out.push(ELFCLASS64);
        out.push(ELFDATA2LSB);
        out.push(EV_CURRENT);
        out.push(ELFOSABI_SYSV);
        out.push(0); // ABI version
        out.extend_from_slice(&[0; 7]); // padding

        out.extend_from_slice(&ET_EXEC.to_le_bytes()); // e_type
        out.extend_from_slice(&EM_X86_64.to_le_bytes()); // e_machine
        out.extend_from_slice(&1u32.to_le_bytes()); // e_version
        out.extend_from_slice(&self.entry.to_le_bytes()); // e_entry
        out.extend_from_slice(&(ELF64_EHDR_SIZE as u64).to_le_bytes()); // e_phoff
        out.extend_from_slice(&self.section_header_offset.to_le_bytes()); // e_shoff
        out.extend_from_slice(&0u32.to_le_bytes()); // e_flags
        out.extend_from_slice(&ELF64_EHDR_SIZE.to_le_bytes()); // e_ehsize
        out.extend_from_slice(&ELF64_PHDR_SIZE.to_le_bytes()); // e_phentsize
        out.extend_from_slice(&PROGRAM_HEADER_COUNT.to_le_bytes()); // e_phnum
        out.extend_from_slice(&ELF64_SHDR_SIZE.to_le_bytes()); // e_shentsize
        out.extend_from_slice(&SECTION_HEADER_COUNT.to_le_bytes()); // e_shnum
        out.extend_from_slice(&SHSTRTAB_SECTION_INDEX.to_le_bytes()); // e_shstrndx
    }
}

struct Elf64ProgramHeader {
    flags: u32,
    offset: u64,
    vaddr: u64,
    size: u64,
}

impl Elf64ProgramHeader {
    fn emit(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&PT_LOAD.to_le_bytes()); // p_type
        out.extend_from_slice(&self.flags.to_le_bytes()); // p_flags
        out.extend_from_slice(&self.offset.to_le_bytes()); // p_offset
        out.extend_from_slice(&self.vaddr.to_le_bytes()); // p_vaddr
        out.extend_from_slice(&self.vaddr.to_le_bytes()); // p_paddr
        out.extend_from_slice(&self.size.to_le_bytes()); // p_filesz
        out.extend_from_slice(&self.size.to_le_bytes()); // p_memsz
        out.extend_from_slice(&PAGE_SIZE.to_le_bytes()); // p_align
    }
}

struct Elf64SectionHeader {
    name_offset: u32,
    kind: u32,
    flags: u64,
    addr: u64,
    offset: u64,
    size: u64,
    addralign: u64,
}

impl Elf64SectionHeader {
    fn emit(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.name_offset.to_le_bytes()); // sh_name
        out.extend_from_slice(&self.kind.to_le_bytes()); // sh_type
        out.extend_from_slice(&self.flags.to_le_bytes()); // sh_flags
        out.extend_from_slice(&self.addr.to_le_bytes()); // sh_addr
        out.extend_from_slice(&self.offset.to_le_bytes()); // sh_offset
        out.extend_from_slice(&self.size.to_le_bytes()); // sh_size
        out.extend_from_slice(&0u32.to_le_bytes()); // sh_link
        out.extend_from_slice(&0u32.to_le_bytes()); // sh_info
        out.extend_from_slice(&self.addralign.to_le_bytes()); // sh_addralign
        out.extend_from_slice(&0u64.to_le_bytes()); // sh_entsize
    }
}

fn emit_section_headers(out: &mut Vec<u8>, layout: &ImageLayout) {
    // Index 0: null section
    Elf64SectionHeader {
        name_offset: 0,
        kind: SHT_NULL,
        flags: 0,
        addr: 0,
        offset: 0,
        size: 0,
        addralign: 0,
    }
    .emit(out);

    // Index 1: .text
    Elf64SectionHeader {
        name_offset: TEXT_NAME_OFFSET,
        kind: SHT_PROGBITS,
        flags: SHF_ALLOC | SHF_EXECINSTR,
        addr: layout.text_vaddr(),
        offset: layout.text_offset,
        size: layout.text_size,
        addralign: 1,
    }
    .emit(out);

    // Index 2: .data
    Elf64SectionHeader {
        name_offset: DATA_NAME_OFFSET,
        kind: SHT_PROGBITS,
        flags: SHF_ALLOC | SHF_WRITE,
        addr: layout.data_vaddr(),
        offset: layout.data_offset,
        size: layout.data_size,
        addralign: 1,
    }
    .emit(out);

    // Index 3: .shstrtab
    Elf64SectionHeader {
        name_offset: SHSTRTAB_NAME_OFFSET,
        kind: SHT_STRTAB,
        flags: 0,
        addr: 0,
        offset: layout.shstrtab_offset,
        size: SHSTRTAB.len() as u64,
        addralign: 1,
    }
    .emit(out);
}
