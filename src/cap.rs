//! The capability object model.
//!
//! Every kernel object the runtime loader will create is represented here as
//! a named `Cap` with a slot address handed out by the `CapTable`. Entities
//! never point at each other; a CNode's slots, a modification's source, and a
//! thread's tcb are all plain names resolved through the table. That keeps
//! ownership a tree: the table owns the caps, and caps are values carrying
//! their own slot.

use indexmap::IndexMap;

use crate::arch::Arch;
use crate::error::ConfigError;

/// The kinds of kernel object a cap may refer to.
///
/// `Frame` and `VSpace` are aliases for whatever the active architecture uses
/// as its leaf page and top-level paging structure; the aliasing is resolved
/// when the seL4 object name is looked up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CapKind {
    Tcb,
    Endpoint,
    CNode,
    Frame,
    VSpace,
    Pml4,
    Pdpt,
    PageDirectory,
    PageTable,
    X86_4K,
}

impl CapKind {
    pub fn from_config_name(name: &str) -> Option<CapKind> {
        match name {
            "tcb" => Some(CapKind::Tcb),
            "endpoint" => Some(CapKind::Endpoint),
            "cnode" => Some(CapKind::CNode),
            "frame" => Some(CapKind::Frame),
            "vspace" => Some(CapKind::VSpace),
            "pml4" => Some(CapKind::Pml4),
            "pdpt" => Some(CapKind::Pdpt),
            "page_directory" => Some(CapKind::PageDirectory),
            "page_table" => Some(CapKind::PageTable),
            "x86_4K" => Some(CapKind::X86_4K),
            _ => None,
        }
    }

    /// The name used in the config file and in generated cap names.
    pub fn config_name(self) -> &'static str {
        match self {
            CapKind::Tcb => "tcb",
            CapKind::Endpoint => "endpoint",
            CapKind::CNode => "cnode",
            CapKind::Frame => "frame",
            CapKind::VSpace => "vspace",
            CapKind::Pml4 => "pml4",
            CapKind::Pdpt => "pdpt",
            CapKind::PageDirectory => "page_directory",
            CapKind::PageTable => "page_table",
            CapKind::X86_4K => "x86_4K",
        }
    }

    /// The seL4 object-type identifier the generated header references, and
    /// the key into the info record's object-size map. This is where the
    /// `Frame`/`VSpace` aliases collapse onto concrete per-arch objects.
    pub fn sel4_object_name(self, arch: Arch) -> &'static str {
        match arch {
            Arch::X86_64 => match self {
                CapKind::Tcb => "seL4_TCBObject",
                CapKind::Endpoint => "seL4_EndpointObject",
                CapKind::CNode => "seL4_CapTableObject",
                CapKind::Frame | CapKind::X86_4K => "seL4_X86_4K",
                CapKind::VSpace | CapKind::Pml4 => "seL4_X64_PML4Object",
                CapKind::Pdpt => "seL4_X86_PDPTObject",
                CapKind::PageDirectory => "seL4_X86_PageDirectoryObject",
                CapKind::PageTable => "seL4_X86_PageTableObject",
            },
        }
    }

    /// Whether a cap of this kind may be the source of a mint or copy.
    /// Intermediate paging structures may not; notably, the top-level
    /// structure may.
    pub fn derivable(self) -> bool {
        !matches!(
            self,
            CapKind::Pdpt | CapKind::PageDirectory | CapKind::PageTable
        )
    }
}

/// One right that may be carried across a mint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapRight {
    Read,
    Write,
    Grant,
    GrantReply,
}

impl CapRight {
    pub fn from_config_name(name: &str) -> Option<CapRight> {
        match name {
            "read" => Some(CapRight::Read),
            "write" => Some(CapRight::Write),
            "grant" => Some(CapRight::Grant),
            "grant_reply" => Some(CapRight::GrantReply),
            _ => None,
        }
    }

    pub fn c_name(self) -> &'static str {
        match self {
            CapRight::Read => "CAP_ALLOW_READ",
            CapRight::Write => "CAP_ALLOW_WRITE",
            CapRight::Grant => "CAP_ALLOW_GRANT",
            CapRight::GrantReply => "CAP_ALLOW_GRANT_REPLY",
        }
    }
}

/// Render a rights list as the C expression the generated header uses.
pub fn rights_c_expr(rights: &[CapRight]) -> String {
    if rights.is_empty() {
        return "0".to_string();
    }
    let names: Vec<&str> = rights.iter().map(|r| r.c_name()).collect();
    format!("({})", names.join(" | "))
}

/// A named capability with its assigned slot.
#[derive(Debug, Clone)]
pub struct Cap {
    pub name: String,
    pub kind: CapKind,
    pub address: u64,
}

/// The central slot allocator. Slot 0 is reserved as the loader's scratch
/// slot and is never assigned, so addresses start at 1.
///
/// Lookup is a linear scan. It only runs a small handful of times per entity
/// while the model is built, so it is not worth an index.
#[derive(Debug, Default)]
pub struct CapTable {
    caps: Vec<Cap>,
    next_free_slot: u64,
}

impl CapTable {
    pub fn new() -> CapTable {
        CapTable {
            caps: Vec::new(),
            next_free_slot: 1,
        }
    }

    /// Assign the next free slot to a new cap. Names are unique across the
    /// whole table, no matter which config section introduced them.
    pub fn append(&mut self, name: &str, kind: CapKind) -> Result<u64, ConfigError> {
        if self.contains(name) {
            return Err(ConfigError::DuplicateName(name.to_string()));
        }
        let address = self.next_free_slot;
        self.caps.push(Cap {
            name: name.to_string(),
            kind,
            address,
        });
        self.next_free_slot += 1;
        Ok(address)
    }

    pub fn get(&self, name: &str) -> Option<&Cap> {
        self.caps.iter().find(|cap| cap.name == name)
    }

    pub fn address_of(&self, name: &str) -> Option<u64> {
        self.get(name).map(|cap| cap.address)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// One more than the highest assigned address; the loader must reserve
    /// this many slots (including the scratch slot).
    pub fn slots_required(&self) -> u64 {
        self.next_free_slot
    }

    pub fn iter(&self) -> impl Iterator<Item = &Cap> {
        self.caps.iter()
    }
}

/// A CNode: a cap over a table of capability slots, with extra geometry and
/// the slots the loader should fill.
///
/// The kernel depth of a cap installed in this CNode is `size_bits +
/// guard_bits`.
#[derive(Debug, Clone)]
pub struct CNode {
    pub name: String,
    pub size_bits: u8,
    pub guard_bits: u8,
    /// Slot index to name of the cap copied there. Insertion order is the
    /// config order and is preserved through to the emitted copy operations.
    pub slots: IndexMap<u64, String>,
    /// Set when this CNode is designated to receive the leftover
    /// general-purpose untypeds.
    pub gp_untypeds: Option<GpUntypedRange>,
}

/// Slot range within a CNode reserved for handed-off untypeds.
#[derive(Debug, Clone, Copy)]
pub struct GpUntypedRange {
    pub start_slot: u64,
    pub end_slot: u64,
}

impl CNode {
    /// Depth the loader must use to address slots of this CNode.
    pub fn depth(&self) -> u8 {
        self.size_bits + self.guard_bits
    }
}

/// A derived cap: mint `src` into `dest` with restricted rights and a badge.
/// The destination cap is appended to the table when the modification is
/// ingested.
#[derive(Debug, Clone)]
pub struct CapModification {
    pub dest: String,
    pub src: String,
    pub rights: Vec<CapRight>,
    pub badge: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses_start_at_one_and_are_unique() {
        let mut table = CapTable::new();
        let a = table.append("a", CapKind::Endpoint).unwrap();
        let b = table.append("b", CapKind::Tcb).unwrap();
        let c = table.append("c", CapKind::Frame).unwrap();
        assert_eq!((a, b, c), (1, 2, 3));
        assert_eq!(table.slots_required(), 4);

        let mut seen = std::collections::HashSet::new();
        for cap in table.iter() {
            assert!(cap.address >= 1 && cap.address < table.slots_required());
            assert!(seen.insert(cap.address));
        }
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut table = CapTable::new();
        table.append("ep", CapKind::Endpoint).unwrap();
        match table.append("ep", CapKind::Tcb) {
            Err(ConfigError::DuplicateName(name)) => assert_eq!(name, "ep"),
            other => panic!("expected duplicate-name error, got {:?}", other),
        }
    }

    #[test]
    fn only_intermediate_paging_kinds_are_underivable() {
        assert!(CapKind::Pml4.derivable());
        assert!(CapKind::VSpace.derivable());
        assert!(CapKind::Endpoint.derivable());
        assert!(!CapKind::Pdpt.derivable());
        assert!(!CapKind::PageDirectory.derivable());
        assert!(!CapKind::PageTable.derivable());
    }

    #[test]
    fn rights_render_as_a_c_expression() {
        assert_eq!(rights_c_expr(&[]), "0");
        assert_eq!(
            rights_c_expr(&[CapRight::Read, CapRight::Write]),
            "(CAP_ALLOW_READ | CAP_ALLOW_WRITE)"
        );
    }
}
