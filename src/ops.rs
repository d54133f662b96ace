//! The primitive operations the runtime loader executes, and the total order
//! they are executed in.
//!
//! Every entity in the object model lowers to one or more operations. After
//! all stages have contributed, the list is stably sorted into execution
//! order: creation operations first, largest objects first (the loader's
//! bump-style untyped allocator satisfies tight alignments before smaller
//! objects fragment the space), then every other class in a fixed sequence
//! chosen so each operation's preconditions are met by earlier classes.

use crate::error::{Error, InternalInvariant};

#[derive(Debug, Clone)]
pub enum Operation {
    CapCreate(CapCreateOp),
    CNodeCreate(CNodeCreateOp),
    Mint(MintOp),
    Copy(CopyOp),
    Map(MapOp),
    BinaryChunkLoad(BinaryChunkLoadOp),
    MapFrame(MapFrameOp),
    TcbSetup(TcbSetupOp),
    PassGpUntypeds(PassGpUntypedsOp),
    PassGpMemoryInfo(PassGpMemoryInfoOp),
    TcbStart(TcbStartOp),
}

/// Retype an object of `cap_type` into the scratch-relative slot `dest`.
#[derive(Debug, Clone)]
pub struct CapCreateOp {
    pub cap_type: &'static str,
    pub dest: u64,
    pub size_bits: u8,
    pub bytes_required: u64,
}

/// Retype a CNode into slot 0, then mutate it to its final slot while
/// setting the guard. Renders as two consecutive entries.
#[derive(Debug, Clone)]
pub struct CNodeCreateOp {
    pub dest: u64,
    pub size_bits: u8,
    pub guard: u8,
    pub bytes_required: u64,
}

#[derive(Debug, Clone)]
pub struct MintOp {
    pub badge: u64,
    pub src: u64,
    pub dest: u64,
    pub rights: String,
}

#[derive(Debug, Clone)]
pub struct CopyOp {
    pub src: u64,
    pub dest_root: u64,
    pub dest_index: u64,
    pub dest_depth: u8,
}

impl CopyOp {
    /// Only derivable kinds may be copied. Paging leaf caps are never placed
    /// in CNode slots, so this cannot fire from planner-generated input; it
    /// guards the model against a regression.
    pub fn new(
        src: u64,
        src_name: &str,
        src_derivable: bool,
        dest_root: u64,
        dest_index: u64,
        dest_depth: u8,
    ) -> Result<CopyOp, Error> {
        debug_assert!(src_derivable, "copy of underivable cap '{}'", src_name);
        if !src_derivable {
            return Err(InternalInvariant::UnderivableCopySource {
                src: src_name.to_string(),
            }
            .into());
        }
        Ok(CopyOp {
            src,
            dest_root,
            dest_index,
            dest_depth,
        })
    }
}

/// Map a paging structure `service` into `vspace` at `vaddr` through the
/// per-level wrapper named by `map_func`.
#[derive(Debug, Clone)]
pub struct MapOp {
    pub service: u64,
    pub vspace: u64,
    pub vaddr: u64,
    pub map_func: String,
}

#[derive(Debug, Clone)]
pub struct BinaryChunkLoadOp {
    /// Linker symbol of the chunk's first byte; rendered as `SYM_VAL(..)`.
    pub src_vaddr_sym: String,
    pub dest_vaddr: u64,
    pub length: u64,
    pub dest_vspace: u64,
}

#[derive(Debug, Clone)]
pub struct MapFrameOp {
    pub frame: u64,
    pub vspace: u64,
    pub vaddr: u64,
}

#[derive(Debug, Clone)]
pub struct TcbSetupOp {
    pub tcb: u64,
    pub cspace: u64,
    pub vspace: u64,
    pub ipc_buffer: u64,
    pub ipc_buffer_addr: u64,
    pub entry_addr: u64,
    pub stack_pointer_addr: u64,
    pub arg0: u64,
    pub arg1: u64,
    pub arg2: u64,
}

#[derive(Debug, Clone)]
pub struct PassGpUntypedsOp {
    pub cnode_dest: u64,
    pub start_slot: u64,
    pub end_slot: u64,
    pub cnode_depth: u8,
}

#[derive(Debug, Clone)]
pub struct PassGpMemoryInfoOp {
    pub dest_vaddr: u64,
    pub frame: u64,
    pub dest_vspace: u64,
}

#[derive(Debug, Clone)]
pub struct TcbStartOp {
    pub tcb: u64,
}

/// Format one designated-initializer element of the C operation array:
/// `{OP_NAME, .op_name = {.k=v, ...}}`.
fn c_entry(op_name: &str, fields: &[(&str, String)]) -> String {
    let initializers: Vec<String> = fields
        .iter()
        .map(|(key, value)| format!(".{}={}", key, value))
        .collect();
    format!(
        "{{{}, .{} = {{{}}}}}",
        op_name.to_uppercase(),
        op_name,
        initializers.join(", ")
    )
}

impl Operation {
    /// The C array entries for this operation. All operations contribute one
    /// entry except `CNodeCreate`, which contributes its create and mutate
    /// pair.
    pub fn c_entries(&self) -> Vec<String> {
        match self {
            Operation::CapCreate(op) => vec![c_entry(
                "create_op",
                &[
                    ("cap_type", op.cap_type.to_string()),
                    ("bytes_required", op.bytes_required.to_string()),
                    ("dest", op.dest.to_string()),
                    ("size_bits", op.size_bits.to_string()),
                ],
            )],
            Operation::CNodeCreate(op) => vec![
                c_entry(
                    "create_op",
                    &[
                        ("cap_type", "seL4_CapTableObject".to_string()),
                        ("bytes_required", op.bytes_required.to_string()),
                        ("dest", "0".to_string()),
                        ("size_bits", op.size_bits.to_string()),
                    ],
                ),
                c_entry(
                    "mutate_op",
                    &[
                        ("guard", op.guard.to_string()),
                        ("src", "0".to_string()),
                        ("dest", op.dest.to_string()),
                    ],
                ),
            ],
            Operation::Mint(op) => vec![c_entry(
                "mint_op",
                &[
                    ("badge", op.badge.to_string()),
                    ("src", op.src.to_string()),
                    ("dest", op.dest.to_string()),
                    ("rights", op.rights.clone()),
                ],
            )],
            Operation::Copy(op) => vec![c_entry(
                "copy_op",
                &[
                    ("src", op.src.to_string()),
                    ("dest_root", op.dest_root.to_string()),
                    ("dest_index", op.dest_index.to_string()),
                    ("dest_depth", op.dest_depth.to_string()),
                ],
            )],
            Operation::Map(op) => vec![c_entry(
                "map_op",
                &[
                    ("map_func", op.map_func.clone()),
                    ("vaddr", op.vaddr.to_string()),
                    ("service", op.service.to_string()),
                    ("vspace", op.vspace.to_string()),
                ],
            )],
            Operation::BinaryChunkLoad(op) => vec![c_entry(
                "binary_chunk_load_op",
                &[
                    ("src_vaddr", format!("SYM_VAL({})", op.src_vaddr_sym)),
                    ("dest_vaddr", op.dest_vaddr.to_string()),
                    ("length", op.length.to_string()),
                    ("dest_vspace", op.dest_vspace.to_string()),
                ],
            )],
            Operation::MapFrame(op) => vec![c_entry(
                "map_frame_op",
                &[
                    ("vaddr", op.vaddr.to_string()),
                    ("frame", op.frame.to_string()),
                    ("vspace", op.vspace.to_string()),
                ],
            )],
            Operation::TcbSetup(op) => vec![c_entry(
                "tcb_setup_op",
                &[
                    ("entry_addr", op.entry_addr.to_string()),
                    ("stack_pointer_addr", op.stack_pointer_addr.to_string()),
                    ("ipc_buffer_addr", op.ipc_buffer_addr.to_string()),
                    ("arg0", op.arg0.to_string()),
                    ("arg1", op.arg1.to_string()),
                    ("arg2", op.arg2.to_string()),
                    ("cspace", op.cspace.to_string()),
                    ("vspace", op.vspace.to_string()),
                    ("ipc_buffer", op.ipc_buffer.to_string()),
                    ("tcb", op.tcb.to_string()),
                ],
            )],
            Operation::PassGpUntypeds(op) => vec![c_entry(
                "pass_gp_untypeds_op",
                &[
                    ("cnode_dest", op.cnode_dest.to_string()),
                    ("start_slot", op.start_slot.to_string()),
                    ("end_slot", op.end_slot.to_string()),
                    ("cnode_depth", op.cnode_depth.to_string()),
                ],
            )],
            Operation::PassGpMemoryInfo(op) => vec![c_entry(
                "pass_gp_memory_info_op",
                &[
                    ("dest_vaddr", op.dest_vaddr.to_string()),
                    ("frame", op.frame.to_string()),
                    ("dest_vspace", op.dest_vspace.to_string()),
                ],
            )],
            Operation::TcbStart(op) => {
                vec![c_entry("tcb_start_op", &[("tcb", op.tcb.to_string())])]
            }
        }
    }

    /// Bytes the loader's untyped allocator must supply for this operation;
    /// `None` for non-creating operations.
    pub fn bytes_required(&self) -> Option<u64> {
        match self {
            Operation::CapCreate(op) => Some(op.bytes_required),
            Operation::CNodeCreate(op) => Some(op.bytes_required),
            _ => None,
        }
    }

    fn class_rank(&self) -> i64 {
        match self {
            Operation::CapCreate(_) | Operation::CNodeCreate(_) => -1,
            Operation::Mint(_) => 0,
            Operation::Copy(_) => 1,
            Operation::Map(_) => 2,
            Operation::BinaryChunkLoad(_) => 3,
            Operation::MapFrame(_) => 4,
            Operation::TcbSetup(_) => 5,
            Operation::PassGpUntypeds(_) => 6,
            Operation::PassGpMemoryInfo(_) => 7,
            Operation::TcbStart(_) => 8,
        }
    }
}

/// Stable sort into execution order: creates first by descending
/// `bytes_required`, everything else by class; insertion order breaks ties.
pub fn sort_into_execution_order(ops: &mut [Operation]) {
    ops.sort_by_key(|op| {
        let size = op.bytes_required().unwrap_or(0);
        (op.class_rank(), -(size as i64))
    });
}
