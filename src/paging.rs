//! The per-VSpace paging-structure planner.
//!
//! For every address range that must be mapped (ELF chunks, stacks, IPC
//! buffers, the gp-memory-info frame) the planner grows a tree of paging
//! structures rooted at the architecture's top-level kind. A missing
//! intermediate layer is created the first time a range needs it and reused
//! by every later range. Individual leaf pages are never tracked here; the
//! runtime maps frames directly, so the recursion stops one level above the
//! leaf page kind.

use std::collections::BTreeMap;

use crate::arch::{Arch, PagingLayout};
use crate::cap::{CapKind, CapTable};
use crate::error::Error;
use crate::ops::{CapCreateOp, MapOp, Operation};
use crate::sel4::SeL4Info;

/// A half-open `[lower, upper)` range of virtual addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VaddrRange {
    pub lower: u64,
    pub upper: u64,
}

impl VaddrRange {
    pub fn overlaps(&self, other: &VaddrRange) -> bool {
        self.lower.max(other.lower) < self.upper.min(other.upper)
    }
}

/// One paging structure at a known virtual address, with the structures it
/// maps beneath it keyed by entry index.
#[derive(Debug)]
pub struct PagingNode {
    kind: CapKind,
    vaddr: u64,
    /// log2 of the number of entries in this structure.
    index_bits: u32,
    /// Virtual-address bits covered by this whole structure.
    span_bits: u32,
    children: BTreeMap<u64, PagingNode>,
}

impl PagingNode {
    fn new(kind: CapKind, layout: &PagingLayout, vaddr: u64) -> PagingNode {
        PagingNode {
            kind,
            vaddr,
            index_bits: layout.bits(kind),
            span_bits: layout.cumulative_bits_at_or_below(kind),
            children: BTreeMap::new(),
        }
    }

    pub fn kind(&self) -> CapKind {
        self.kind
    }

    pub fn vaddr(&self) -> u64 {
        self.vaddr
    }

    pub fn span_bits(&self) -> u32 {
        self.span_bits
    }

    pub fn children(&self) -> impl Iterator<Item = &PagingNode> {
        self.children.values()
    }

    fn cover(&mut self, layout: &PagingLayout, range: VaddrRange) {
        let child_kind = match layout.next_below(self.kind) {
            Some(kind) => kind,
            None => return,
        };
        // Children of the penultimate level would be leaf pages; those are
        // the runtime's business, not the tree's.
        if layout.next_below(child_kind).is_none() {
            return;
        }

        let child_span_bits = self.span_bits - self.index_bits;
        for index in 0..(1u64 << self.index_bits) {
            let child_lower = self.vaddr + (index << child_span_bits);
            let child_range = VaddrRange {
                lower: child_lower,
                upper: child_lower + (1 << child_span_bits),
            };
            if range.overlaps(&child_range) {
                self.children
                    .entry(index)
                    .or_insert_with(|| PagingNode::new(child_kind, layout, child_lower))
                    .cover(layout, range);
            }
        }
    }

    fn plan_ops(
        &self,
        vspace_name: &str,
        vspace_addr: u64,
        layout: &PagingLayout,
        arch: Arch,
        info: &SeL4Info,
        table: &mut CapTable,
        ops: &mut Vec<Operation>,
    ) -> Result<(), Error> {
        // The root of the tree is the vspace's own cap; every other node
        // materialises a fresh one.
        let address = if layout.is_topmost(self.kind) {
            vspace_addr
        } else {
            let cap_name = format!(
                "{}_{}_{}__",
                vspace_name,
                self.kind.config_name(),
                self.vaddr
            );
            table.append(&cap_name, self.kind)?
        };

        let size_bits = info.object_size_bits(self.kind, arch)?;
        ops.push(Operation::CapCreate(CapCreateOp {
            cap_type: self.kind.sel4_object_name(arch),
            dest: address,
            size_bits,
            bytes_required: 1 << size_bits,
        }));
        ops.push(Operation::Map(MapOp {
            service: address,
            vspace: vspace_addr,
            vaddr: self.vaddr,
            map_func: format!("wrapper_{}", layout.mapping_func(self.kind)),
        }));

        for child in self.children.values() {
            child.plan_ops(vspace_name, vspace_addr, layout, arch, info, table, ops)?;
        }
        Ok(())
    }
}

/// The paging-structure tree of one vspace.
#[derive(Debug)]
pub struct PagingTree {
    root: PagingNode,
}

impl PagingTree {
    pub fn new(layout: &PagingLayout) -> PagingTree {
        PagingTree {
            root: PagingNode::new(layout.topmost(), layout, 0),
        }
    }

    /// Grow the tree so that every structure needed to map `range` exists.
    /// Already-present structures are reused, never duplicated.
    pub fn cover(&mut self, layout: &PagingLayout, range: VaddrRange) {
        self.root.cover(layout, range);
    }

    pub fn root(&self) -> &PagingNode {
        &self.root
    }

    /// Emit one create and one map operation per node, parents before
    /// children, materialising a cap for every non-root node.
    pub fn plan_ops(
        &self,
        vspace_name: &str,
        vspace_addr: u64,
        layout: &PagingLayout,
        arch: Arch,
        info: &SeL4Info,
        table: &mut CapTable,
        ops: &mut Vec<Operation>,
    ) -> Result<(), Error> {
        self.root
            .plan_ops(vspace_name, vspace_addr, layout, arch, info, table, ops)
    }
}
