//! VSpaces and the chunks of bytes loaded into them.
//!
//! A VSpace is the root of one address space, backed by a thread ELF binary.
//! Everything that ends up in the memory of that address space travels as a
//! `BinaryChunk`: one chunk per ELF load segment at ingestion, plus one chunk
//! per thread stack added during layout.

use std::path::PathBuf;

use crate::elf::ElfImage;
use crate::error::{ConfigError, Error, IoError};
use crate::paging::VaddrRange;

/// A blob of bytes with a destination virtual address, padded out to
/// alignment-unit boundaries.
///
/// The runtime loader copies memory only at alignment-unit granularity (it
/// remaps frames rather than copying byte ranges), so a chunk destined for
/// the middle of a page is stored with head padding and its load address
/// rounded down. `min_length` reserves the full `p_memsz` of a segment; the
/// excess over the file-backed bytes is the .bss region, pre-materialised
/// here as zeroes. Tail padding keeps the next chunk in the linked image
/// aligned as well.
#[derive(Debug, Clone)]
pub struct BinaryChunk {
    pub name: String,
    pub dest_vaddr: u64,
    pub min_length: u64,
    pub alignment: u64,
    pub dest_vaddr_aligned: u64,
    pub data_aligned: Vec<u8>,
    pub total_length: u64,
    pub start_symbol: String,
}

impl BinaryChunk {
    pub fn new(
        name: String,
        data: Vec<u8>,
        dest_vaddr: u64,
        min_length: u64,
        alignment: u64,
    ) -> BinaryChunk {
        let head_pad = dest_vaddr % alignment;
        let dest_vaddr_aligned = dest_vaddr - head_pad;

        let bss_pad = min_length.saturating_sub(data.len() as u64);

        let occupied = head_pad + data.len() as u64 + bss_pad;
        let tail_pad = occupied.wrapping_neg() % alignment;

        let total_length = occupied + tail_pad;
        let mut data_aligned = Vec::with_capacity(total_length as usize);
        data_aligned.resize(head_pad as usize, 0);
        data_aligned.extend_from_slice(&data);
        data_aligned.resize((head_pad + data.len() as u64 + bss_pad) as usize, 0);
        data_aligned.resize(total_length as usize, 0);
        debug_assert_eq!(total_length % alignment, 0);

        let start_symbol = format!("_binary_{}_bin_start", name);

        BinaryChunk {
            name,
            dest_vaddr,
            min_length,
            alignment,
            dest_vaddr_aligned,
            data_aligned,
            total_length,
            start_symbol,
        }
    }

    /// The half-open range of virtual addresses this chunk occupies.
    pub fn range(&self) -> VaddrRange {
        VaddrRange {
            lower: self.dest_vaddr_aligned,
            upper: self.dest_vaddr_aligned + self.total_length,
        }
    }
}

/// One address space and the binary it is loaded from.
///
/// Several vspaces may share the same ELF file; each gets a nonce so their
/// chunk names, and therefore the linker symbols generated from them, do not
/// collide.
#[derive(Debug)]
pub struct VSpace {
    pub name: String,
    pub binary_name: String,
    pub binary_name_unique: String,
    pub nonce: usize,
    pub binary_path: PathBuf,
    pub alignment: u64,
    pub image: ElfImage,
    pub chunks: Vec<BinaryChunk>,
}

impl VSpace {
    pub fn new(
        name: &str,
        binary_name: &str,
        nonce: usize,
        image: ElfImage,
        alignment: u64,
    ) -> Result<VSpace, Error> {
        let binary_name_unique = format!("{}_num{}", binary_name, nonce);

        let segments = image.load_segments()?;
        if segments.is_empty() {
            return Err(ConfigError::NoLoadSegments {
                binary: binary_name.to_string(),
            }
            .into());
        }
        let mut chunks = Vec::with_capacity(segments.len());
        for (index, segment) in segments.into_iter().enumerate() {
            chunks.push(BinaryChunk::new(
                format!("thread_{}_segment{}", binary_name_unique, index),
                segment.data,
                segment.vaddr,
                segment.mem_size,
                alignment,
            ));
        }

        Ok(VSpace {
            name: name.to_string(),
            binary_name: binary_name.to_string(),
            binary_name_unique,
            nonce,
            binary_path: image.path().to_path_buf(),
            alignment,
            image,
            chunks,
        })
    }

    pub fn symbol(&self, symbol: &str) -> Result<Option<u64>, IoError> {
        self.image.symbol(symbol)
    }

    pub fn entry_point(&self) -> Result<u64, IoError> {
        self.image.entry_point()
    }

    /// First address above every chunk currently in this vspace.
    pub fn chunks_end(&self) -> u64 {
        self.chunks
            .iter()
            .map(|chunk| chunk.dest_vaddr_aligned + chunk.total_length)
            .max()
            .unwrap_or(0)
    }
}
