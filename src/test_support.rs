//! Fixtures shared by the unit and integration test suites: a canned seL4
//! info record and a builder for small but well-formed x86-64 ELF images.
//!
//! This lives in the crate proper (rather than under `#[cfg(test)]`) so the
//! integration tests can drive the full pipeline against the same fixtures
//! the unit tests use.

use crate::context::{Context, Options};
use crate::elf::ElfImage;
use crate::sel4::SeL4Info;
use indexmap::IndexMap;

pub const TEST_INFO_JSON: &str = r#"{
  "arch": "x86_64",
  "endianness": "little",
  "literals": {
    "seL4_PageBits": 12,
    "seL4_SlotBits": 5,
    "seL4_WordBits": 64,
    "sizeof(int)": 4,
    "offsetof(auxv_t, a_un)": 8,
    "AT_NULL": 0,
    "AT_SEL4_IPC_BUFFER_PTR": 34,
    "AT_SYSINFO": 32
  },
  "object_sizes": {
    "seL4_TCBObject": 11,
    "seL4_EndpointObject": 4,
    "seL4_CapTableObject": 5,
    "seL4_X64_PML4Object": 12,
    "seL4_X86_PDPTObject": 12,
    "seL4_X86_PageDirectoryObject": 12,
    "seL4_X86_PageTableObject": 12,
    "seL4_X86_4K": 12
  }
}"#;

pub fn test_info() -> SeL4Info {
    serde_json::from_str(TEST_INFO_JSON).expect("fixture json parses")
}

pub fn test_context() -> Context {
    Context::new(
        test_info(),
        Options {
            config_path: "config.yaml".into(),
            startup_threads_paths: IndexMap::new(),
            output_header_path: "out/tailspring_generated.hpp".into(),
            output_obj_path: "out/startup_threads.o".into(),
        },
    )
    .expect("fixture info is supported")
}

/// One load segment of a fixture binary.
pub struct Segment {
    pub vaddr: u64,
    pub data: Vec<u8>,
    pub mem_size: u64,
}

/// Builds a minimal 64-bit little-endian ELF: load segments, an entry
/// point, and optionally a symbol table. Just enough structure for the
/// parser; nothing here is runnable.
#[derive(Default)]
pub struct ElfFixture {
    entry: u64,
    segments: Vec<Segment>,
    symbols: Vec<(String, u64)>,
}

const EHDR_LEN: usize = 64;
const PHDR_LEN: usize = 56;
const SHDR_LEN: usize = 64;
const SYM_LEN: usize = 24;

impl ElfFixture {
    pub fn new() -> ElfFixture {
        ElfFixture::default()
    }

    pub fn entry(mut self, entry: u64) -> ElfFixture {
        self.entry = entry;
        self
    }

    pub fn segment(mut self, segment: Segment) -> ElfFixture {
        self.segments.push(segment);
        self
    }

    pub fn symbol(mut self, name: &str, value: u64) -> ElfFixture {
        self.symbols.push((name.to_string(), value));
        self
    }

    pub fn image(self, name: &str) -> ElfImage {
        ElfImage::from_bytes(name, self.build())
    }

    pub fn build(self) -> Vec<u8> {
        let phoff = EHDR_LEN;
        let mut data_off = phoff + PHDR_LEN * self.segments.len();

        // Program headers and their data blobs.
        let mut phdrs: Vec<u8> = Vec::new();
        let mut blobs: Vec<u8> = Vec::new();
        for segment in &self.segments {
            phdrs.extend_from_slice(&1u32.to_le_bytes()); // p_type = PT_LOAD
            phdrs.extend_from_slice(&7u32.to_le_bytes()); // p_flags = rwx
            phdrs.extend_from_slice(&(data_off as u64).to_le_bytes());
            phdrs.extend_from_slice(&segment.vaddr.to_le_bytes());
            phdrs.extend_from_slice(&segment.vaddr.to_le_bytes()); // p_paddr
            phdrs.extend_from_slice(&(segment.data.len() as u64).to_le_bytes());
            phdrs.extend_from_slice(&segment.mem_size.to_le_bytes());
            phdrs.extend_from_slice(&0x1000u64.to_le_bytes()); // p_align
            blobs.extend_from_slice(&segment.data);
            data_off += segment.data.len();
        }

        // Optional .symtab/.strtab/.shstrtab plus the null section.
        let mut sections: Vec<u8> = Vec::new();
        let mut shdrs: Vec<u8> = Vec::new();
        let (shoff, shnum, shstrndx);
        if self.symbols.is_empty() {
            shoff = 0;
            shnum = 0;
            shstrndx = 0;
        } else {
            // Symbol entries want 8-byte alignment in the file.
            let mut cursor = data_off;
            let symtab_pad = cursor.wrapping_neg() % 8;
            sections.resize(symtab_pad, 0);
            cursor += symtab_pad;

            let symtab_off = cursor;
            let mut strtab = vec![0u8];
            let mut symtab = vec![0u8; SYM_LEN]; // null symbol
            for (name, value) in &self.symbols {
                let name_off = strtab.len() as u32;
                strtab.extend_from_slice(name.as_bytes());
                strtab.push(0);
                symtab.extend_from_slice(&name_off.to_le_bytes());
                symtab.push(0); // st_info
                symtab.push(0); // st_other
                symtab.extend_from_slice(&1u16.to_le_bytes()); // st_shndx
                symtab.extend_from_slice(&value.to_le_bytes());
                symtab.extend_from_slice(&0u64.to_le_bytes()); // st_size
            }
            sections.extend_from_slice(&symtab);
            cursor += symtab.len();

            let strtab_off = cursor;
            sections.extend_from_slice(&strtab);
            cursor += strtab.len();

            let shstrtab: &[u8] = b"\0.symtab\0.strtab\0.shstrtab\0";
            let shstrtab_off = cursor;
            sections.extend_from_slice(shstrtab);
            cursor += shstrtab.len();

            shoff = cursor;
            shnum = 4u16;
            shstrndx = 3u16;
            shdrs.extend_from_slice(&[0u8; SHDR_LEN]); // null section
            shdrs.extend_from_slice(&section_header(
                1, // ".symtab" in shstrtab
                2, // SHT_SYMTAB
                symtab_off as u64,
                symtab.len() as u64,
                2, // link: .strtab
                SYM_LEN as u64,
            ));
            shdrs.extend_from_slice(&section_header(
                9, // ".strtab"
                3, // SHT_STRTAB
                strtab_off as u64,
                strtab.len() as u64,
                0,
                0,
            ));
            shdrs.extend_from_slice(&section_header(
                17, // ".shstrtab"
                3,
                shstrtab_off as u64,
                shstrtab.len() as u64,
                0,
                0,
            ));
        }

        let mut elf: Vec<u8> = Vec::new();
        elf.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
        elf.extend_from_slice(&[0u8; 8]);
        elf.extend_from_slice(&2u16.to_le_bytes()); // e_type = EXEC
        elf.extend_from_slice(&62u16.to_le_bytes()); // e_machine = x86-64
        elf.extend_from_slice(&1u32.to_le_bytes()); // e_version
        elf.extend_from_slice(&self.entry.to_le_bytes());
        elf.extend_from_slice(&(phoff as u64).to_le_bytes());
        elf.extend_from_slice(&(shoff as u64).to_le_bytes());
        elf.extend_from_slice(&0u32.to_le_bytes()); // e_flags
        elf.extend_from_slice(&(EHDR_LEN as u16).to_le_bytes());
        elf.extend_from_slice(&(PHDR_LEN as u16).to_le_bytes());
        elf.extend_from_slice(&(self.segments.len() as u16).to_le_bytes());
        elf.extend_from_slice(&(SHDR_LEN as u16).to_le_bytes());
        elf.extend_from_slice(&shnum.to_le_bytes());
        elf.extend_from_slice(&shstrndx.to_le_bytes());
        debug_assert_eq!(elf.len(), EHDR_LEN);

        elf.extend_from_slice(&phdrs);
        elf.extend_from_slice(&blobs);
        elf.extend_from_slice(&sections);
        elf.extend_from_slice(&shdrs);
        elf
    }
}

fn section_header(
    name: u32,
    sh_type: u32,
    offset: u64,
    size: u64,
    link: u32,
    entsize: u64,
) -> Vec<u8> {
    let mut shdr: Vec<u8> = Vec::new();
    shdr.extend_from_slice(&name.to_le_bytes());
    shdr.extend_from_slice(&sh_type.to_le_bytes());
    shdr.extend_from_slice(&0u64.to_le_bytes()); // sh_flags
    shdr.extend_from_slice(&0u64.to_le_bytes()); // sh_addr
    shdr.extend_from_slice(&offset.to_le_bytes());
    shdr.extend_from_slice(&size.to_le_bytes());
    shdr.extend_from_slice(&link.to_le_bytes());
    shdr.extend_from_slice(&0u32.to_le_bytes()); // sh_info
    shdr.extend_from_slice(&1u64.to_le_bytes()); // sh_addralign
    shdr.extend_from_slice(&entsize.to_le_bytes());
    debug_assert_eq!(shdr.len(), SHDR_LEN);
    shdr
}
