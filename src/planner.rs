//! Lowers the object model into the flat operation list.
//!
//! Most entities contribute their operations here, in a fixed pass order;
//! the thread-layout pass has already contributed the operations that fall
//! out of placing things in memory (IPC-buffer maps, gp-memory-info
//! frames). The final stable sort puts the combined list into execution
//! order.

use crate::context::Context;
use crate::error::Error;
use crate::ops::{
    self, BinaryChunkLoadOp, CNodeCreateOp, CapCreateOp, CopyOp, MintOp, Operation,
    PassGpUntypedsOp, TcbSetupOp, TcbStartOp,
};

pub fn plan(ctx: &mut Context) -> Result<(), Error> {
    plan_cap_creates(ctx)?;
    plan_cnode_creates(ctx);
    plan_mints(ctx);
    plan_copies(ctx)?;
    plan_paging(ctx)?;
    plan_binary_chunk_loads(ctx);
    plan_tcb_setups(ctx);
    plan_pass_gp_untypeds(ctx);
    plan_tcb_starts(ctx);

    ops::sort_into_execution_order(&mut ctx.ops);
    log::debug!("planned {} operations", ctx.ops.len());
    Ok(())
}

/// One retype per cap declared under `caps`.
fn plan_cap_creates(ctx: &mut Context) -> Result<(), Error> {
    for name in &ctx.initial_caps {
        let cap = ctx.cap_table.get(name).expect("initial cap in table");
        let size_bits = ctx.sel4_info.object_size_bits(cap.kind, ctx.arch)?;
        ctx.ops.push(Operation::CapCreate(CapCreateOp {
            cap_type: cap.kind.sel4_object_name(ctx.arch),
            dest: cap.address,
            size_bits,
            bytes_required: 1 << size_bits,
        }));
    }
    Ok(())
}

/// CNodes retype into the scratch slot and then mutate into place; the pair
/// is carried as one operation so the allocator sees a single object of
/// `1 << (size + slot_bits)` bytes.
fn plan_cnode_creates(ctx: &mut Context) {
    let slot_bits = ctx.sel4_info.literals.slot_bits;
    for cnode in ctx.cnodes.values() {
        let address = ctx
            .cap_table
            .address_of(&cnode.name)
            .expect("cnode cap in table");
        ctx.ops.push(Operation::CNodeCreate(CNodeCreateOp {
            dest: address,
            size_bits: cnode.size_bits,
            guard: cnode.guard_bits,
            bytes_required: 1 << (cnode.size_bits + slot_bits),
        }));
    }
}

fn plan_mints(ctx: &mut Context) {
    for modification in ctx.cap_modifications.values() {
        let src = ctx
            .cap_table
            .address_of(&modification.src)
            .expect("mint source in table");
        let dest = ctx
            .cap_table
            .address_of(&modification.dest)
            .expect("mint dest in table");
        ctx.ops.push(Operation::Mint(MintOp {
            badge: modification.badge,
            src,
            dest,
            rights: crate::cap::rights_c_expr(&modification.rights),
        }));
    }
}

/// Copy every filled CNode slot from the flat table into its final home.
fn plan_copies(ctx: &mut Context) -> Result<(), Error> {
    for cnode in ctx.cnodes.values() {
        let dest_root = ctx
            .cap_table
            .address_of(&cnode.name)
            .expect("cnode cap in table");
        for (slot, cap_name) in &cnode.slots {
            let src = ctx.cap_table.get(cap_name).expect("slot cap in table");
            let copy = CopyOp::new(
                src.address,
                &src.name,
                src.kind.derivable(),
                dest_root,
                *slot,
                cnode.depth(),
            )?;
            ctx.ops.push(Operation::Copy(copy));
        }
    }
    Ok(())
}

/// Walk each vspace's paging tree, materialising caps for the structures and
/// emitting their create and map operations.
fn plan_paging(ctx: &mut Context) -> Result<(), Error> {
    for (vspace_name, tree) in &ctx.paging_trees {
        let vspace_addr = ctx
            .cap_table
            .address_of(vspace_name)
            .expect("vspace cap in table");
        tree.plan_ops(
            vspace_name,
            vspace_addr,
            &ctx.layout,
            ctx.arch,
            &ctx.sel4_info,
            &mut ctx.cap_table,
            &mut ctx.ops,
        )?;
    }
    Ok(())
}

fn plan_binary_chunk_loads(ctx: &mut Context) {
    for vspace in ctx.vspaces.values() {
        let vspace_addr = ctx
            .cap_table
            .address_of(&vspace.name)
            .expect("vspace cap in table");
        for chunk in &vspace.chunks {
            ctx.ops.push(Operation::BinaryChunkLoad(BinaryChunkLoadOp {
                src_vaddr_sym: chunk.start_symbol.clone(),
                dest_vaddr: chunk.dest_vaddr_aligned,
                length: chunk.total_length,
                dest_vspace: vspace_addr,
            }));
        }
    }
}

fn plan_tcb_setups(ctx: &mut Context) {
    for thread in ctx.threads.values() {
        let address_of = |name: &str| {
            ctx.cap_table
                .address_of(name)
                .expect("thread references checked at ingestion")
        };
        ctx.ops.push(Operation::TcbSetup(TcbSetupOp {
            tcb: address_of(&thread.name),
            cspace: address_of(&thread.cspace),
            vspace: address_of(&thread.vspace),
            ipc_buffer: address_of(&thread.ipc_buffer),
            ipc_buffer_addr: thread.ipc_buffer_addr,
            entry_addr: thread.entry_addr,
            stack_pointer_addr: thread.stack_pointer_addr,
            arg0: thread.arg0,
            arg1: thread.arg1,
            arg2: thread.arg2,
        }));
    }
}

fn plan_pass_gp_untypeds(ctx: &mut Context) {
    let cnode_name = match &ctx.gp_untypeds_cnode {
        Some(name) => name,
        None => return,
    };
    let cnode = &ctx.cnodes[cnode_name.as_str()];
    let range = cnode.gp_untypeds.expect("range set with the designation");
    let address = ctx
        .cap_table
        .address_of(cnode_name)
        .expect("cnode cap in table");
    ctx.ops.push(Operation::PassGpUntypeds(PassGpUntypedsOp {
        cnode_dest: address,
        start_slot: range.start_slot,
        end_slot: range.end_slot,
        cnode_depth: cnode.depth(),
    }));
}

fn plan_tcb_starts(ctx: &mut Context) {
    for thread in ctx.threads.values() {
        let tcb = ctx
            .cap_table
            .address_of(&thread.name)
            .expect("tcb cap in table");
        ctx.ops.push(Operation::TcbStart(TcbStartOp { tcb }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;
    use crate::test_support::test_context;

    fn plan_from_yaml(yaml: &str) -> Context {
        let mut ctx = test_context();
        let doc: serde_yaml::Value = serde_yaml::from_str(yaml).unwrap();
        config::ingest(&mut ctx, &doc).unwrap();
        plan(&mut ctx).unwrap();
        ctx
    }

    #[test]
    fn single_endpoint_mint_produces_a_create_then_a_mint() {
        let ctx = plan_from_yaml(
            "caps:\n  ep: endpoint\ncap_modifications:\n  ep2:\n    original: ep\n    rights: [read, write]\n    badge: 42\n",
        );
        assert_eq!(ctx.cap_table.slots_required(), 3);

        let entries: Vec<String> = ctx.ops.iter().flat_map(|op| op.c_entries()).collect();
        assert_eq!(
            entries,
            vec![
                "{CREATE_OP, .create_op = {.cap_type=seL4_EndpointObject, .bytes_required=16, \
                 .dest=1, .size_bits=4}}",
                "{MINT_OP, .mint_op = {.badge=42, .src=1, .dest=2, \
                 .rights=(CAP_ALLOW_READ | CAP_ALLOW_WRITE)}}",
            ]
        );
    }

    #[test]
    fn cnode_with_a_filled_slot_creates_mutates_then_copies() {
        let ctx = plan_from_yaml(
            "caps:\n  ep: endpoint\ncnodes:\n  c:\n    size: 4\n    guard: 0\n    1: ep\n",
        );

        let entries: Vec<String> = ctx.ops.iter().flat_map(|op| op.c_entries()).collect();
        // The cnode needs 1 << (4 + 5) = 512 bytes, more than the endpoint's
        // 16, so its create comes first.
        assert_eq!(
            entries,
            vec![
                "{CREATE_OP, .create_op = {.cap_type=seL4_CapTableObject, .bytes_required=512, \
                 .dest=0, .size_bits=4}}",
                "{MUTATE_OP, .mutate_op = {.guard=0, .src=0, .dest=2}}",
                "{CREATE_OP, .create_op = {.cap_type=seL4_EndpointObject, .bytes_required=16, \
                 .dest=1, .size_bits=4}}",
                "{COPY_OP, .copy_op = {.src=1, .dest_root=2, .dest_index=1, .dest_depth=4}}",
            ]
        );
    }

    #[test]
    fn gp_untypeds_handoff_uses_the_cnode_depth() {
        let ctx = plan_from_yaml(
            "cnodes:\n  c:\n    size: 6\n    guard: 2\ngp_untypeds_cnode:\n  cnode: c\n  start_slot: 2\n  end_slot: 40\n",
        );
        let pass = ctx
            .ops
            .iter()
            .find_map(|op| match op {
                Operation::PassGpUntypeds(op) => Some(op.clone()),
                _ => None,
            })
            .expect("pass op planned");
        assert_eq!(pass.cnode_dest, 1);
        assert_eq!((pass.start_slot, pass.end_slot), (2, 40));
        assert_eq!(pass.cnode_depth, 8);
    }
}
