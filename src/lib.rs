//! Tailspring generator: build-time companion to the Tailspring seL4
//! startup-thread loader.
//!
//! From a declarative system description (capabilities, CNodes, address
//! spaces, threads) and a set of thread ELF binaries, the generator emits
//! two artifacts the loader consumes at boot:
//!
//!  * a relocatable object whose single `.startup_threads_data` section
//!    holds every thread's load segments and initial stacks, page-aligned
//!    and tagged with linker symbols, and
//!  * a header declaring the flat, totally-ordered list of capability
//!    operations the loader executes verbatim to materialise the system.
//!
//! The pipeline is strictly sequential; every stage consumes the complete
//! output of the previous ones through a shared [`context::Context`]. The
//! only suspensions are the synchronous invocations of the seL4 info getter
//! and the compiler driver.

#[cfg(test)]
#[macro_use]
extern crate proptest;

pub mod arch;
pub mod cap;
pub mod config;
pub mod context;
pub mod elf;
pub mod emit;
pub mod error;
pub mod image;
pub mod ops;
pub mod paging;
pub mod planner;
pub mod sel4;
pub mod stack;
pub mod thread;
pub mod tool;
pub mod vspace;

#[doc(hidden)]
pub mod test_support;

use std::fs;

use crate::context::{Context, Options};
use crate::error::{ConfigError, Error, IoError};
use crate::paging::PagingTree;
use crate::sel4::SeL4Info;
use crate::tool::Tool;

/// Run the whole pipeline: ingest the config, plan paging and thread
/// layout, pack and link the startup-threads object, and emit the header.
pub fn generate(options: Options, info_getter: &dyn Tool, gcc: &dyn Tool) -> Result<(), Error> {
    let config_text =
        fs::read_to_string(&options.config_path).map_err(|source| IoError::Open {
            path: options.config_path.clone(),
            source,
        })?;
    let doc: serde_yaml::Value =
        serde_yaml::from_str(&config_text).map_err(|e| ConfigError::MalformedYaml(e.to_string()))?;

    let sel4_info = SeL4Info::from_getter(info_getter)?;
    log::debug!(
        "seL4 info: arch {}, {} bit words, {} byte pages",
        sel4_info.arch,
        sel4_info.literals.word_bits,
        sel4_info.page_size()
    );

    let mut ctx = Context::new(sel4_info, options)?;
    config::ingest(&mut ctx, &doc)?;
    build_paging_trees(&mut ctx);
    thread::run_layout(&mut ctx)?;
    image::pack(&ctx, gcc)?;
    planner::plan(&mut ctx)?;
    emit::write_header(&ctx)?;
    Ok(())
}

/// Seed each vspace's paging tree with the ranges of its ELF chunks. The
/// layout pass grows the trees further as it places stacks and buffers.
fn build_paging_trees(ctx: &mut Context) {
    for (name, vspace) in &ctx.vspaces {
        let mut tree = PagingTree::new(&ctx.layout);
        for chunk in &vspace.chunks {
            tree.cover(&ctx.layout, chunk.range());
        }
        ctx.paging_trees.insert(name.clone(), tree);
    }
}
