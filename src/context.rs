//! The shared state threaded through the pipeline.
//!
//! Each stage consumes the complete output of the stages before it and adds
//! its own; nothing here is global and nothing is mutated once the operation
//! list has been sorted.

use std::path::PathBuf;

use indexmap::IndexMap;

use crate::arch::{Arch, PagingLayout};
use crate::cap::{CNode, CapModification, CapTable};
use crate::error::ConfigError;
use crate::ops::Operation;
use crate::paging::PagingTree;
use crate::sel4::SeL4Info;
use crate::thread::Thread;
use crate::vspace::VSpace;

/// Where the generator reads from and writes to.
#[derive(Debug, Clone)]
pub struct Options {
    pub config_path: PathBuf,
    /// Thread binaries are referenced by name in the config; this maps those
    /// names to on-disk paths.
    pub startup_threads_paths: IndexMap<String, PathBuf>,
    pub output_header_path: PathBuf,
    pub output_obj_path: PathBuf,
}

#[derive(Debug)]
pub struct Context {
    pub arch: Arch,
    pub layout: PagingLayout,
    pub sel4_info: SeL4Info,
    pub page_size: u64,

    pub startup_threads_paths: IndexMap<String, PathBuf>,
    pub output_header_path: PathBuf,
    pub output_obj_path: PathBuf,
    /// Working directory for the per-chunk compiler runs; the output
    /// object's parent, assumed writable and owned by this run.
    pub temp_dir: PathBuf,

    pub cap_table: CapTable,
    /// Names declared under `caps`, in config order; these get plain create
    /// operations.
    pub initial_caps: Vec<String>,
    pub cap_modifications: IndexMap<String, CapModification>,
    pub cnodes: IndexMap<String, CNode>,
    /// Name of the CNode designated to receive leftover untypeds, if any.
    pub gp_untypeds_cnode: Option<String>,
    pub vspaces: IndexMap<String, VSpace>,
    pub threads: IndexMap<String, Thread>,

    pub paging_trees: IndexMap<String, PagingTree>,
    pub ops: Vec<Operation>,
}

impl Context {
    pub fn new(sel4_info: SeL4Info, options: Options) -> Result<Context, ConfigError> {
        let arch = Arch::from_info_name(&sel4_info.arch)
            .ok_or_else(|| ConfigError::UnsupportedArch(sel4_info.arch.clone()))?;
        let layout = PagingLayout::for_arch(arch);
        let page_size = sel4_info.page_size();
        let temp_dir = options
            .output_obj_path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));

        Ok(Context {
            arch,
            layout,
            sel4_info,
            page_size,
            startup_threads_paths: options.startup_threads_paths,
            output_header_path: options.output_header_path,
            output_obj_path: options.output_obj_path,
            temp_dir,
            cap_table: CapTable::new(),
            initial_caps: Vec::new(),
            cap_modifications: IndexMap::new(),
            cnodes: IndexMap::new(),
            gp_untypeds_cnode: None,
            vspaces: IndexMap::new(),
            threads: IndexMap::new(),
            paging_trees: IndexMap::new(),
            ops: Vec::new(),
        })
    }
}
