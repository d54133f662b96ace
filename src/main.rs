//! Command-line entry point for the Tailspring generator.

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use clap::Parser;
use indexmap::IndexMap;

use tailspring::context::Options;
use tailspring::error::IoError;
use tailspring::tool::HostTool;

/// Generates C headers and the startup-threads object from a configuration
/// file for the Tailspring thread loader.
#[derive(Debug, Parser)]
#[command(name = "tailspring")]
struct Cli {
    /// Path to the configuration file.
    #[arg(long, value_name = "PATH")]
    config: PathBuf,

    /// Path to the compiled sel4_info_getter binary.
    #[arg(long = "sel4-info-getter", value_name = "PATH")]
    sel4_info_getter: PathBuf,

    /// Path to the GCC compiler (used for linking).
    #[arg(long, value_name = "PATH")]
    gcc: PathBuf,

    /// Key-value pairs mapping startup thread names in the config file to
    /// the path of the thread binary.
    #[arg(
        long = "startup-threads-paths",
        value_name = "NAME=PATH",
        num_args = 0..,
        value_parser = parse_name_path
    )]
    startup_threads_paths: Vec<(String, PathBuf)>,

    /// Path to the output generated header file.
    #[arg(long = "output-header", value_name = "PATH")]
    output_header: PathBuf,

    /// Path to the output generated object file containing startup thread
    /// data.
    #[arg(long = "output-startup-threads-obj", value_name = "PATH")]
    output_startup_threads_obj: PathBuf,
}

fn parse_name_path(value: &str) -> Result<(String, PathBuf), String> {
    match value.split_once('=') {
        Some((name, path)) if !name.is_empty() => Ok((name.to_string(), PathBuf::from(path))),
        _ => Err(format!("expected NAME=PATH, got '{}'", value)),
    }
}

fn require_file(path: &Path) -> Result<(), IoError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(IoError::Missing(path.to_path_buf()))
    }
}

/// Outputs must land in an existing directory; a bare file name counts as
/// the current directory.
fn require_writable_parent(path: &Path) -> Result<(), IoError> {
    match path.parent() {
        None => Err(IoError::UnwritableParent(path.to_path_buf())),
        Some(parent) if parent.as_os_str().is_empty() => Ok(()),
        Some(parent) if parent.is_dir() => Ok(()),
        Some(_) => Err(IoError::UnwritableParent(path.to_path_buf())),
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    require_file(&cli.config)?;
    require_file(&cli.sel4_info_getter)?;
    require_file(&cli.gcc)?;
    require_writable_parent(&cli.output_header)?;
    require_writable_parent(&cli.output_startup_threads_obj)?;

    let mut startup_threads_paths = IndexMap::new();
    for (name, path) in cli.startup_threads_paths {
        require_file(&path)
            .with_context(|| format!("startup thread binary '{}'", name))?;
        startup_threads_paths.insert(name, path);
    }

    let info_getter = HostTool::new(cli.sel4_info_getter);
    let gcc = HostTool::new(cli.gcc);
    let options = Options {
        config_path: cli.config,
        startup_threads_paths,
        output_header_path: cli.output_header,
        output_obj_path: cli.output_startup_threads_obj,
    };
    tailspring::generate(options, &info_getter, &gcc)?;
    Ok(())
}
