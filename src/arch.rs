//! Per-architecture description of the paging hierarchy.
//!
//! The paging structures are laid out as follows on x86-64:
//!   L0: PML4            (9 bits)
//!   L1: |_ PDPT         (9 bits)
//!   L2:    |_ PageDirectory (9 bits)
//!   L3:       |_ PageTable  (9 bits)
//!               |_ 4K page  (12 bits)
//!
//! The last entry of the order is always the leaf page kind. Each level also
//! names the mapping primitive the generated header must enable so the
//! runtime loader can install structures of that level; for the top level
//! that primitive is the ASID-pool assignment rather than a map.

use crate::cap::CapKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    X86_64,
}

impl Arch {
    /// Resolve the `arch` string of the seL4 info record.
    pub fn from_info_name(name: &str) -> Option<Arch> {
        match name {
            "x86_64" => Some(Arch::X86_64),
            _ => None,
        }
    }
}

const X86_64_ORDER: &[CapKind] = &[
    CapKind::Pml4,
    CapKind::Pdpt,
    CapKind::PageDirectory,
    CapKind::PageTable,
    CapKind::X86_4K,
];

/// Top-down view of one architecture's paging-structure order, with the
/// translation bits and mapping primitive of each level.
#[derive(Debug, Clone, Copy)]
pub struct PagingLayout {
    order: &'static [CapKind],
}

impl PagingLayout {
    pub fn for_arch(arch: Arch) -> PagingLayout {
        match arch {
            Arch::X86_64 => PagingLayout { order: X86_64_ORDER },
        }
    }

    /// Paging-structure kinds from the top of the hierarchy down to the leaf
    /// page kind.
    pub fn order(&self) -> &'static [CapKind] {
        self.order
    }

    pub fn topmost(&self) -> CapKind {
        self.order[0]
    }

    pub fn is_topmost(&self, kind: CapKind) -> bool {
        kind == self.topmost()
    }

    /// The structure kind one level below `kind`, or `None` at the leaf.
    pub fn next_below(&self, kind: CapKind) -> Option<CapKind> {
        let index = self.level_of(kind);
        self.order.get(index + 1).copied()
    }

    /// Number of virtual-address bits translated at this level.
    pub fn bits(&self, kind: CapKind) -> u32 {
        match kind {
            CapKind::X86_4K => 12,
            _ => 9,
        }
    }

    /// Total virtual-address bits covered by one structure of this kind,
    /// i.e. the sum of `bits` from `kind` down through the leaf.
    pub fn cumulative_bits_at_or_below(&self, kind: CapKind) -> u32 {
        self.order[self.level_of(kind)..]
            .iter()
            .map(|k| self.bits(*k))
            .sum()
    }

    /// Name of the mapping primitive for this level, without the `wrapper_`
    /// or `ENABLE_` prefixes the emitter adds.
    pub fn mapping_func(&self, kind: CapKind) -> &'static str {
        match kind {
            CapKind::Pml4 => "X86_ASIDPool_Assign",
            CapKind::Pdpt => "X86_PDPT_Map",
            CapKind::PageDirectory => "X86_PageDirectory_Map",
            CapKind::PageTable => "X86_PageTable_Map",
            CapKind::X86_4K => "X86_PAGE_MAP",
            _ => unreachable!("kind {:?} is not a paging structure", kind),
        }
    }

    fn level_of(&self, kind: CapKind) -> usize {
        self.order
            .iter()
            .position(|k| *k == kind)
            .unwrap_or_else(|| panic!("kind {:?} is not in the paging order", kind))
    }
}
