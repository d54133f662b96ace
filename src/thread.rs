//! Threads and the per-VSpace memory layout pass.
//!
//! Threads that share a VSpace compete for the address range above the
//! loaded segments, so they are laid out together: stack, then IPC buffer,
//! then the next thread's stack, with unmapped guard pages in between so a
//! stack overrun faults instead of silently corrupting a neighbour. VSpaces
//! are independent of one another.

use crate::cap::CapKind;
use crate::context::Context;
use crate::error::{ConfigError, Error, InternalInvariant};
use crate::ops::{CapCreateOp, MapFrameOp, Operation, PassGpMemoryInfoOp};
use crate::paging::VaddrRange;
use crate::stack::StackBuilder;
use crate::vspace::BinaryChunk;

/// One startup thread. The addresses and entry arguments are filled in by
/// the layout pass; until then they are zero.
#[derive(Debug, Clone)]
pub struct Thread {
    /// Also the name of the tcb cap.
    pub name: String,
    pub cspace: String,
    pub vspace: String,
    pub ipc_buffer: String,
    pub stack_size: u64,
    pub entry_addr: u64,
    pub args: Vec<String>,
    pub envps: Vec<String>,

    pub ipc_buffer_addr: u64,
    pub stack_top_addr: u64,
    pub stack_pointer_addr: u64,
    pub arg0: u64,
    pub arg1: u64,
    pub arg2: u64,
}

/// Lay out stacks and IPC buffers for every vspace, growing the paging trees
/// over everything that gets mapped and building each thread's initial stack
/// chunk. Map and create operations for IPC buffers and gp-memory-info
/// frames are emitted here as a side effect of placing them.
pub fn run_layout(ctx: &mut Context) -> Result<(), Error> {
    let vspace_names: Vec<String> = ctx.vspaces.keys().cloned().collect();
    for vspace_name in vspace_names {
        layout_shared_vspace(ctx, &vspace_name)?;
    }
    Ok(())
}

fn layout_shared_vspace(ctx: &mut Context, vspace_name: &str) -> Result<(), Error> {
    let page_size = ctx.page_size;
    let thread_names: Vec<String> = ctx
        .threads
        .iter()
        .filter(|(_, thread)| thread.vspace == vspace_name)
        .map(|(name, _)| name.clone())
        .collect();

    // Everything above the loaded segments is free for stacks and buffers.
    let last_chunk_vaddr = ctx.vspaces[vspace_name].chunks_end();
    if last_chunk_vaddr % page_size != 0 {
        return Err(InternalInvariant::UnalignedChunkEnd {
            vspace: vspace_name.to_string(),
            vaddr: last_chunk_vaddr,
        }
        .into());
    }
    let mut addr_ptr = last_chunk_vaddr;

    // Guard page between the segments and the first stack.
    addr_ptr += page_size;

    // If any thread here holds a cspace designated for leftover untypeds, it
    // will want to know what it was given; reserve one frame per vspace for
    // that memory-info record.
    let wants_gp_info = thread_names.iter().any(|name| {
        ctx.cnodes
            .get(&ctx.threads[name].cspace)
            .map_or(false, |cnode| cnode.gp_untypeds.is_some())
    });
    let mut gp_info_vaddr = None;
    if wants_gp_info {
        let frame_name = format!("{}_gp_memory_info_frame__", vspace_name);
        let frame_addr = ctx.cap_table.append(&frame_name, CapKind::Frame)?;
        let size_bits = ctx.sel4_info.object_size_bits(CapKind::Frame, ctx.arch)?;
        let vspace_addr = ctx
            .cap_table
            .address_of(vspace_name)
            .expect("vspace cap appended at ingestion");
        ctx.ops.push(Operation::CapCreate(CapCreateOp {
            cap_type: CapKind::Frame.sel4_object_name(ctx.arch),
            dest: frame_addr,
            size_bits,
            bytes_required: 1 << size_bits,
        }));
        ctx.ops.push(Operation::PassGpMemoryInfo(PassGpMemoryInfoOp {
            dest_vaddr: addr_ptr,
            frame: frame_addr,
            dest_vspace: vspace_addr,
        }));
        cover(ctx, vspace_name, addr_ptr, addr_ptr + page_size);
        gp_info_vaddr = Some(addr_ptr);
        log::debug!(
            "vspace '{}': gp memory info frame at {:#x}",
            vspace_name,
            addr_ptr
        );
        // The frame plus a guard page above it.
        addr_ptr += 2 * page_size;
    }

    for thread_name in thread_names {
        addr_ptr = layout_thread(ctx, vspace_name, &thread_name, addr_ptr, gp_info_vaddr)?;
    }
    Ok(())
}

fn layout_thread(
    ctx: &mut Context,
    vspace_name: &str,
    thread_name: &str,
    mut addr_ptr: u64,
    gp_info_vaddr: Option<u64>,
) -> Result<u64, Error> {
    let page_size = ctx.page_size;
    let vspace_addr = ctx
        .cap_table
        .address_of(vspace_name)
        .expect("vspace cap appended at ingestion");

    // Stacks are mapped at page granularity, so round the requested size up.
    let stack_size = {
        let thread = &ctx.threads[thread_name];
        thread.stack_size + thread.stack_size.wrapping_neg() % page_size
    };

    addr_ptr += stack_size;
    let stack_top_addr = addr_ptr;

    // Guard page between the stack and the IPC buffer.
    addr_ptr += page_size;

    let ipc_buffer_addr = addr_ptr;
    let ipc_frame_addr = ctx
        .cap_table
        .address_of(&ctx.threads[thread_name].ipc_buffer)
        .expect("ipc buffer cap checked at ingestion");
    ctx.ops.push(Operation::MapFrame(MapFrameOp {
        frame: ipc_frame_addr,
        vspace: vspace_addr,
        vaddr: ipc_buffer_addr,
    }));
    cover(ctx, vspace_name, ipc_buffer_addr, ipc_buffer_addr + page_size);
    addr_ptr += page_size;

    // Guard page between the IPC buffer and whatever comes next.
    addr_ptr += page_size;

    {
        let thread = ctx.threads.get_mut(thread_name).expect("thread exists");
        thread.stack_size = stack_size;
        thread.stack_top_addr = stack_top_addr;
        thread.ipc_buffer_addr = ipc_buffer_addr;
        thread.envps.push(format!("ipc_buffer={}", ipc_buffer_addr));
        if let Some(vaddr) = gp_info_vaddr {
            thread.envps.push(format!("gp_memory_info={}", vaddr));
        }
    }

    build_stack_chunk(ctx, vspace_name, thread_name)?;
    log::debug!(
        "thread '{}': stack top {:#x}, ipc buffer {:#x}",
        thread_name,
        stack_top_addr,
        ipc_buffer_addr
    );
    Ok(addr_ptr)
}

/// Assemble the thread's initial stack image and append it to its vspace as
/// a right-aligned chunk covering the whole stack.
fn build_stack_chunk(ctx: &mut Context, vspace_name: &str, thread_name: &str) -> Result<(), Error> {
    let thread = &ctx.threads[thread_name];
    let vspace = &ctx.vspaces[vspace_name];

    let mut builder = StackBuilder::new(&ctx.sel4_info, thread.stack_top_addr);
    // The thread's own name is always argv[0].
    builder.push_arg(&thread.name);
    for arg in &thread.args {
        builder.push_arg(arg);
    }
    for env in &thread.envps {
        builder.push_env(env);
    }
    builder.push_auxv(
        ctx.sel4_info.literals.at_sel4_ipc_buffer_ptr,
        thread.ipc_buffer_addr,
    );
    if let Some(vsyscall) = vspace.symbol("sel4_vsyscall")? {
        builder.push_auxv(ctx.sel4_info.literals.at_sysinfo, vsyscall);
    }
    let image = builder.finish();

    if image.bytes.len() as u64 > thread.stack_size {
        return Err(ConfigError::StackImageTooLarge {
            thread: thread.name.clone(),
            image_len: image.bytes.len(),
            stack_size: thread.stack_size,
        }
        .into());
    }

    // The stack grows down; pad below the image so its last byte touches the
    // stack top.
    let mut padded = vec![0u8; (thread.stack_size - image.bytes.len() as u64) as usize];
    padded.extend_from_slice(&image.bytes);
    let chunk = BinaryChunk::new(
        format!("{}_stack_frame__", thread.name),
        padded,
        thread.stack_top_addr - thread.stack_size,
        thread.stack_size,
        vspace.alignment,
    );
    let chunk_range = chunk.range();

    {
        let thread = ctx.threads.get_mut(thread_name).expect("thread exists");
        thread.stack_pointer_addr = image.stack_pointer_addr;
        thread.arg0 = image.arg0;
        thread.arg1 = image.arg1;
        thread.arg2 = image.arg2;
    }
    ctx.vspaces
        .get_mut(vspace_name)
        .expect("vspace exists")
        .chunks
        .push(chunk);
    cover(ctx, vspace_name, chunk_range.lower, chunk_range.upper);
    Ok(())
}

fn cover(ctx: &mut Context, vspace_name: &str, lower: u64, upper: u64) {
    let layout = ctx.layout;
    ctx.paging_trees
        .get_mut(vspace_name)
        .expect("paging tree built before layout")
        .cover(&layout, VaddrRange { lower, upper });
}
