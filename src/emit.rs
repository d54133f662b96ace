//! Emits the generated header the runtime loader compiles against.
//!
//! Four fragments, concatenated in a fixed order: the preamble (include and
//! slot count), one extern declaration per chunk's linker start symbol, the
//! per-level mapping-function enables for the active architecture, and the
//! operation array itself.

use std::fmt::Write as _;
use std::fs;

use crate::context::Context;
use crate::error::IoError;

pub fn write_header(ctx: &Context) -> Result<(), IoError> {
    let header = render_header(ctx);
    fs::write(&ctx.output_header_path, header).map_err(|source| IoError::Write {
        path: ctx.output_header_path.clone(),
        source,
    })
}

pub fn render_header(ctx: &Context) -> String {
    let mut header = String::new();
    header.push_str(&preamble_fragment(ctx));
    header.push_str(&extern_linker_symbols_fragment(ctx));
    header.push_str(&mapping_func_enables_fragment(ctx));
    header.push_str(&ops_fragment(ctx));
    header
}

fn preamble_fragment(ctx: &Context) -> String {
    let mut fragment = String::new();
    fragment.push_str("#pragma once\n");
    fragment.push_str("#include \"tailspring.hpp\"\n");
    writeln!(
        fragment,
        "#define SLOTS_REQUIRED ((seL4_Word){})",
        ctx.cap_table.slots_required()
    )
    .unwrap();
    fragment
}

fn extern_linker_symbols_fragment(ctx: &Context) -> String {
    let mut fragment = String::new();
    for vspace in ctx.vspaces.values() {
        for chunk in &vspace.chunks {
            writeln!(fragment, "extern void* {};", chunk.start_symbol).unwrap();
        }
    }
    fragment
}

fn mapping_func_enables_fragment(ctx: &Context) -> String {
    let mut fragment = String::new();
    for kind in ctx.layout.order() {
        writeln!(
            fragment,
            "ENABLE_{}",
            ctx.layout.mapping_func(*kind).to_uppercase()
        )
        .unwrap();
    }
    fragment
}

fn ops_fragment(ctx: &Context) -> String {
    let mut fragment = String::new();
    fragment.push_str("CapOperation cap_operations[] = {\n");
    for op in &ctx.ops {
        for entry in op.c_entries() {
            fragment.push_str(&entry);
            fragment.push_str(",\n");
        }
    }
    fragment.push_str("};\n");
    fragment
}
