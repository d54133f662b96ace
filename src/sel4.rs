//! The seL4 info record.
//!
//! Kernel-dependent constants are not baked into the generator; a small
//! companion binary compiled against the target kernel's headers prints them
//! as JSON on stdout, and everything downstream (page geometry, object
//! sizes, auxv layout, word encoding) reads from this record.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::arch::Arch;
use crate::cap::CapKind;
use crate::error::ToolError;
use crate::tool::Tool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endianness {
    Little,
    Big,
}

/// Literal constants lifted from the kernel and runtime headers. The JSON
/// keys are spelled the way the info getter prints them, C expressions
/// included.
#[derive(Debug, Clone, Deserialize)]
pub struct Literals {
    #[serde(rename = "seL4_PageBits")]
    pub page_bits: u8,
    #[serde(rename = "seL4_SlotBits")]
    pub slot_bits: u8,
    #[serde(rename = "seL4_WordBits")]
    pub word_bits: u8,
    #[serde(rename = "sizeof(int)")]
    pub int_bytes: u8,
    #[serde(rename = "offsetof(auxv_t, a_un)")]
    pub auxv_un_offset: u8,
    #[serde(rename = "AT_NULL")]
    pub at_null: u64,
    #[serde(rename = "AT_SEL4_IPC_BUFFER_PTR")]
    pub at_sel4_ipc_buffer_ptr: u64,
    #[serde(rename = "AT_SYSINFO")]
    pub at_sysinfo: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeL4Info {
    pub arch: String,
    pub endianness: Endianness,
    pub literals: Literals,
    /// seL4 object-kind name to the `size_bits` used when retyping it.
    pub object_sizes: BTreeMap<String, u8>,
}

impl SeL4Info {
    /// Run the info getter and parse its stdout.
    pub fn from_getter(getter: &dyn Tool) -> Result<SeL4Info, ToolError> {
        let output = getter.run_checked(&[], None)?;
        serde_json::from_slice(&output.stdout).map_err(|e| ToolError::MalformedInfo {
            reason: e.to_string(),
        })
    }

    pub fn page_size(&self) -> u64 {
        1 << self.literals.page_bits
    }

    pub fn word_len(&self) -> usize {
        usize::from(self.literals.word_bits) / 8
    }

    /// `size_bits` for retyping an object of the given kind.
    pub fn object_size_bits(&self, kind: CapKind, arch: Arch) -> Result<u8, ToolError> {
        let object = kind.sel4_object_name(arch);
        self.object_sizes
            .get(object)
            .copied()
            .ok_or_else(|| ToolError::MissingObjectSize {
                object: object.to_string(),
            })
    }

    /// Encode a value as a target word.
    pub fn encode_word(&self, value: u64) -> Vec<u8> {
        self.encode(value, self.word_len())
    }

    /// Encode a value as a target `int`.
    pub fn encode_int(&self, value: u64) -> Vec<u8> {
        self.encode(value, usize::from(self.literals.int_bytes))
    }

    fn encode(&self, value: u64, len: usize) -> Vec<u8> {
        match self.endianness {
            Endianness::Little => value.to_le_bytes()[..len].to_vec(),
            Endianness::Big => value.to_be_bytes()[8 - len..].to_vec(),
        }
    }
}
