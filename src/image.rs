//! The image packer: turns every chunk into a relocatable object and links
//! them into the single startup-threads object.
//!
//! Each chunk's padded bytes are dumped to `<chunk>.bin` and handed to the
//! compiler driver with `-Wl,-r,-b,binary`, which wraps them in an object
//! whose start/end/size symbols are derived from the input file name. The
//! driver runs from the temp directory with bare file names so those symbols
//! do not pick up path components. One final relocatable link under a
//! one-line linker script gathers everything into `.startup_threads_data`.

use std::ffi::OsString;
use std::fs;
use std::path::Path;

use crate::context::Context;
use crate::error::{Error, InternalInvariant, IoError};
use crate::tool::{os, Tool};

const LINKER_SCRIPT: &str = "SECTIONS { .startup_threads_data : { *(.data) } }\n";

pub fn pack(ctx: &Context, gcc: &dyn Tool) -> Result<(), Error> {
    check_chunks_disjoint(ctx)?;

    let temp_dir = &ctx.temp_dir;
    let mut object_names: Vec<String> = Vec::new();
    for vspace in ctx.vspaces.values() {
        for chunk in &vspace.chunks {
            let bin_name = format!("{}.bin", chunk.name);
            let obj_name = format!("{}.o", chunk.name);
            write_file(&temp_dir.join(&bin_name), &chunk.data_aligned)?;
            gcc.run_checked(
                &[
                    os("-static"),
                    os("-nostdlib"),
                    os("-fno-lto"),
                    os("-Wl,-r,-b,binary"),
                    os(&bin_name),
                    os("-o"),
                    os(&obj_name),
                ],
                Some(temp_dir),
            )?;
            object_names.push(obj_name);
        }
    }

    let script_path = temp_dir.join("script.ld");
    write_file(&script_path, LINKER_SCRIPT.as_bytes())?;

    let mut args: Vec<OsString> = vec![
        os("-static"),
        os("-nostdlib"),
        os("-Wl,-r,--build-id=none"),
        os("-Wl,-T"),
        os(script_path.as_os_str()),
        os("-o"),
        os(ctx.output_obj_path.as_os_str()),
    ];
    args.extend(object_names.iter().map(|name| os(temp_dir.join(name))));
    gcc.run_checked(&args, None)?;
    log::debug!(
        "linked {} chunk objects into {}",
        object_names.len(),
        ctx.output_obj_path.display()
    );
    Ok(())
}

/// Within one vspace every chunk must occupy its own address range; an
/// overlap would make two load operations fight over the same frames.
fn check_chunks_disjoint(ctx: &Context) -> Result<(), InternalInvariant> {
    for vspace in ctx.vspaces.values() {
        for (index, chunk) in vspace.chunks.iter().enumerate() {
            for other in &vspace.chunks[index + 1..] {
                if chunk.range().overlaps(&other.range()) {
                    return Err(InternalInvariant::OverlappingChunks {
                        vspace: vspace.name.clone(),
                        a: chunk.name.clone(),
                        b: other.name.clone(),
                    });
                }
            }
        }
    }
    Ok(())
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<(), IoError> {
    fs::write(path, bytes).map_err(|source| IoError::Write {
        path: path.to_path_buf(),
        source,
    })
}
