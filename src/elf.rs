//! Read-only access to thread ELF binaries.
//!
//! Images are memory-mapped once when the config is ingested and stay mapped
//! for the generator's lifetime; parsing happens on demand against the
//! mapping, so repeated symbol lookups stay cheap without a self-referential
//! cache.

use std::fs::File;
use std::path::{Path, PathBuf};

use memmap::Mmap;
use xmas_elf::program::Type;
use xmas_elf::sections::SectionData;
use xmas_elf::symbol_table::Entry;
use xmas_elf::ElfFile;

use crate::error::IoError;

/// One PT_LOAD program header with its file-backed bytes.
///
/// `data` holds exactly `p_filesz` bytes; the remainder up to `p_memsz` is
/// the .bss excess the image packer materialises as zeroes.
#[derive(Debug, Clone)]
pub struct LoadSegment {
    pub vaddr: u64,
    pub mem_size: u64,
    pub data: Vec<u8>,
}

enum Backing {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

/// An ELF image held open for the generator's lifetime.
pub struct ElfImage {
    path: PathBuf,
    backing: Backing,
}

impl std::fmt::Debug for ElfImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElfImage").field("path", &self.path).finish()
    }
}

impl ElfImage {
    pub fn open(path: &Path) -> Result<ElfImage, IoError> {
        let file = File::open(path).map_err(|source| IoError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let map = unsafe { Mmap::map(&file) }.map_err(|source| IoError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(ElfImage {
            path: path.to_path_buf(),
            backing: Backing::Mapped(map),
        })
    }

    /// Wrap in-memory ELF bytes; used by tests that have no file to map.
    pub fn from_bytes(name: &str, bytes: Vec<u8>) -> ElfImage {
        ElfImage {
            path: PathBuf::from(name),
            backing: Backing::Owned(bytes),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn bytes(&self) -> &[u8] {
        match &self.backing {
            Backing::Mapped(map) => &map[..],
            Backing::Owned(bytes) => &bytes[..],
        }
    }

    fn parse(&self) -> Result<ElfFile<'_>, IoError> {
        ElfFile::new(self.bytes()).map_err(|reason| IoError::ElfParse {
            path: self.path.clone(),
            reason: reason.to_string(),
        })
    }

    /// All PT_LOAD segments in program-header order.
    pub fn load_segments(&self) -> Result<Vec<LoadSegment>, IoError> {
        let elf = self.parse()?;
        let mut segments = Vec::new();
        for header in elf.program_iter() {
            match header.get_type() {
                Ok(Type::Load) => (),
                Ok(_) => continue,
                Err(reason) => {
                    return Err(IoError::ElfParse {
                        path: self.path.clone(),
                        reason: reason.to_string(),
                    })
                }
            }
            let offset = header.offset() as usize;
            let file_size = header.file_size() as usize;
            let data = self
                .bytes()
                .get(offset..offset + file_size)
                .ok_or_else(|| IoError::ElfParse {
                    path: self.path.clone(),
                    reason: format!(
                        "load segment at offset {:#x} extends past the end of the file",
                        offset
                    ),
                })?
                .to_vec();
            segments.push(LoadSegment {
                vaddr: header.virtual_addr(),
                mem_size: header.mem_size(),
                data,
            });
        }
        Ok(segments)
    }

    pub fn entry_point(&self) -> Result<u64, IoError> {
        Ok(self.parse()?.header.pt2.entry_point())
    }

    /// Value of a named symbol, or `None` when the image carries no symbol
    /// table or no symbol of that name.
    pub fn symbol(&self, name: &str) -> Result<Option<u64>, IoError> {
        let elf = self.parse()?;
        let symtab = match elf.find_section_by_name(".symtab") {
            Some(section) => section,
            None => return Ok(None),
        };
        let data = symtab.get_data(&elf).map_err(|reason| IoError::ElfParse {
            path: self.path.clone(),
            reason: reason.to_string(),
        })?;
        match data {
            SectionData::SymbolTable64(entries) => {
                for entry in entries {
                    if entry.get_name(&elf) == Ok(name) {
                        return Ok(Some(entry.value()));
                    }
                }
                Ok(None)
            }
            SectionData::SymbolTable32(entries) => {
                for entry in entries {
                    if entry.get_name(&elf) == Ok(name) {
                        return Ok(Some(entry.value()));
                    }
                }
                Ok(None)
            }
            _ => Err(IoError::ElfParse {
                path: self.path.clone(),
                reason: ".symtab is not a symbol table".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ElfFixture, Segment};

    #[test]
    fn load_segments_carry_filesz_bytes_only() {
        let image = ElfFixture::new()
            .entry(0x401020)
            .segment(Segment {
                vaddr: 0x401020,
                data: vec![0xAA; 0x100],
                mem_size: 0x180,
            })
            .image("seg");

        let segments = image.load_segments().unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].vaddr, 0x401020);
        assert_eq!(segments[0].data.len(), 0x100);
        assert_eq!(segments[0].mem_size, 0x180);
        assert_eq!(image.entry_point().unwrap(), 0x401020);
    }

    #[test]
    fn symbols_resolve_and_absence_is_not_an_error() {
        let image = ElfFixture::new()
            .segment(Segment {
                vaddr: 0x400000,
                data: vec![0; 8],
                mem_size: 8,
            })
            .symbol("sel4_vsyscall", 0x500000)
            .image("syms");

        assert_eq!(image.symbol("sel4_vsyscall").unwrap(), Some(0x500000));
        assert_eq!(image.symbol("missing").unwrap(), None);

        let bare = ElfFixture::new()
            .segment(Segment {
                vaddr: 0x400000,
                data: vec![0; 8],
                mem_size: 8,
            })
            .image("bare");
        assert_eq!(bare.symbol("sel4_vsyscall").unwrap(), None);
    }
}
