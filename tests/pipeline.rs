//! End-to-end runs of the generator pipeline against stubbed external tools.
//!
//! The seL4 info getter is replaced with a stub that prints the canned info
//! record, and the compiler driver with one that records its invocations.
//! ELF inputs are built with the in-crate fixture builder and written to a
//! scratch directory, so everything from YAML parsing to header emission
//! runs for real.

use std::cell::RefCell;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use tailspring::context::Options;
use tailspring::error::{Error, ToolError};
use tailspring::test_support::{ElfFixture, Segment, TEST_INFO_JSON};
use tailspring::tool::{Tool, ToolOutput};

#[derive(Debug, Clone)]
struct Invocation {
    args: Vec<OsString>,
    cwd: Option<PathBuf>,
}

/// A tool that always succeeds, printing canned stdout and remembering how
/// it was called.
struct StubTool {
    program: PathBuf,
    stdout: Vec<u8>,
    exit_code: i32,
    stderr: Vec<u8>,
    calls: RefCell<Vec<Invocation>>,
}

impl StubTool {
    fn new(program: &str, stdout: &[u8]) -> StubTool {
        StubTool {
            program: PathBuf::from(program),
            stdout: stdout.to_vec(),
            exit_code: 0,
            stderr: Vec::new(),
            calls: RefCell::new(Vec::new()),
        }
    }

    fn failing(program: &str, stderr: &str) -> StubTool {
        StubTool {
            program: PathBuf::from(program),
            stdout: Vec::new(),
            exit_code: 1,
            stderr: stderr.as_bytes().to_vec(),
            calls: RefCell::new(Vec::new()),
        }
    }

    fn calls(&self) -> Vec<Invocation> {
        self.calls.borrow().clone()
    }
}

impl Tool for StubTool {
    fn program(&self) -> &Path {
        &self.program
    }

    fn run(&self, args: &[OsString], cwd: Option<&Path>) -> Result<ToolOutput, ToolError> {
        self.calls.borrow_mut().push(Invocation {
            args: args.to_vec(),
            cwd: cwd.map(|p| p.to_path_buf()),
        });
        Ok(ToolOutput {
            exit_code: Some(self.exit_code),
            stdout: self.stdout.clone(),
            stderr: self.stderr.clone(),
        })
    }
}

struct Run {
    dir: tempfile::TempDir,
    header: String,
    gcc_calls: Vec<Invocation>,
}

impl Run {
    fn temp_path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}

/// Write the config and binaries into a scratch directory and run the whole
/// pipeline there.
fn run_pipeline(config_yaml: &str, binaries: &[(&str, Vec<u8>)]) -> Result<Run, Error> {
    let dir = tempfile::tempdir().expect("scratch dir");
    let config_path = dir.path().join("config.yaml");
    fs::write(&config_path, config_yaml).unwrap();

    let mut startup_threads_paths = IndexMap::new();
    for (name, bytes) in binaries {
        let path = dir.path().join(format!("{}.elf", name));
        fs::write(&path, bytes).unwrap();
        startup_threads_paths.insert(name.to_string(), path);
    }

    let header_path = dir.path().join("tailspring_generated.hpp");
    let options = Options {
        config_path,
        startup_threads_paths,
        output_header_path: header_path.clone(),
        output_obj_path: dir.path().join("startup_threads.o"),
    };

    let info_getter = StubTool::new("sel4_info_getter", TEST_INFO_JSON.as_bytes());
    let gcc = StubTool::new("gcc", b"");
    tailspring::generate(options, &info_getter, &gcc)?;

    Ok(Run {
        header: fs::read_to_string(header_path).unwrap(),
        gcc_calls: gcc.calls(),
        dir,
    })
}

fn simple_elf() -> Vec<u8> {
    // One page-aligned segment ending at 0x402000.
    ElfFixture::new()
        .entry(0x401000)
        .segment(Segment {
            vaddr: 0x401000,
            data: vec![0x90; 0x1000],
            mem_size: 0x1000,
        })
        .build()
}

#[test]
fn empty_system_emits_a_bare_header_and_still_links() {
    let run = run_pipeline(
        "caps:\ncap_modifications:\ncnodes:\nvspaces:\nthreads:\n",
        &[],
    )
    .unwrap();

    assert!(run.header.contains("#pragma once"));
    assert!(run
        .header
        .contains("#define SLOTS_REQUIRED ((seL4_Word)1)"));
    assert!(!run.header.contains("extern void*"));
    assert!(run
        .header
        .contains("CapOperation cap_operations[] = {\n};\n"));

    // Only the final link runs; there are no chunks to assemble.
    assert_eq!(run.gcc_calls.len(), 1);
    let link = &run.gcc_calls[0];
    assert_eq!(link.args[0], "-static");
    assert_eq!(link.args[1], "-nostdlib");
    assert_eq!(link.args[2], "-Wl,-r,--build-id=none");
    assert_eq!(link.args[3], "-Wl,-T");
    assert!(run.temp_path("script.ld").is_file());
    assert_eq!(
        fs::read_to_string(run.temp_path("script.ld")).unwrap(),
        "SECTIONS { .startup_threads_data : { *(.data) } }\n"
    );
}

#[test]
fn single_endpoint_mint_orders_create_before_mint() {
    let run = run_pipeline(
        "caps:\n  ep: endpoint\ncap_modifications:\n  ep2:\n    original: ep\n    rights: [read, write]\n    badge: 42\n",
        &[],
    )
    .unwrap();

    assert!(run
        .header
        .contains("#define SLOTS_REQUIRED ((seL4_Word)3)"));
    let create = run
        .header
        .find("{CREATE_OP, .create_op = {.cap_type=seL4_EndpointObject, .bytes_required=16, .dest=1, .size_bits=4}}")
        .expect("endpoint create present");
    let mint = run
        .header
        .find("{MINT_OP, .mint_op = {.badge=42, .src=1, .dest=2, .rights=(CAP_ALLOW_READ | CAP_ALLOW_WRITE)}}")
        .expect("mint present");
    assert!(create < mint);
}

#[test]
fn single_segment_vspace_builds_one_paging_chain() {
    let elf = ElfFixture::new()
        .entry(0x401020)
        .segment(Segment {
            vaddr: 0x401020,
            data: vec![0xAB; 0x100],
            mem_size: 0x100,
        })
        .build();
    let run = run_pipeline("vspaces:\n  main_vspace: app\n", &[("app", elf)]).unwrap();

    // vspace cap plus pdpt, page directory, and page table caps.
    assert!(run
        .header
        .contains("#define SLOTS_REQUIRED ((seL4_Word)5)"));
    assert!(run
        .header
        .contains("extern void* _binary_thread_app_num0_segment0_bin_start;"));

    // The root reuses the vspace's own cap and the chain hangs beneath it.
    assert!(run.header.contains(
        "{MAP_OP, .map_op = {.map_func=wrapper_X86_ASIDPool_Assign, .vaddr=0, .service=1, .vspace=1}}"
    ));
    for func in [
        "wrapper_X86_PDPT_Map",
        "wrapper_X86_PageDirectory_Map",
        "wrapper_X86_PageTable_Map",
    ] {
        assert!(
            run.header.contains(&format!(".map_func={}", func)),
            "missing {}",
            func
        );
    }
    assert!(run.header.contains(
        "{BINARY_CHUNK_LOAD_OP, .binary_chunk_load_op = {.src_vaddr=SYM_VAL(_binary_thread_app_num0_segment0_bin_start), .dest_vaddr=4198400, .length=4096, .dest_vspace=1}}"
    ));

    // The packed bin carries head padding, the segment bytes, and tail
    // padding out to one page.
    let bin = fs::read(run.temp_path("thread_app_num0_segment0.bin")).unwrap();
    assert_eq!(bin.len(), 0x1000);
    assert!(bin[..0x20].iter().all(|b| *b == 0));
    assert_eq!(&bin[0x20..0x120], &[0xABu8; 0x100][..]);
    assert!(bin[0x120..].iter().all(|b| *b == 0));

    // Per-chunk assembly runs from the temp dir on bare file names.
    let assemble = &run.gcc_calls[0];
    assert_eq!(
        assemble.args,
        vec![
            OsString::from("-static"),
            OsString::from("-nostdlib"),
            OsString::from("-fno-lto"),
            OsString::from("-Wl,-r,-b,binary"),
            OsString::from("thread_app_num0_segment0.bin"),
            OsString::from("-o"),
            OsString::from("thread_app_num0_segment0.o"),
        ]
    );
    assert_eq!(assemble.cwd.as_deref(), Some(run.dir.path()));
}

const TWO_THREAD_CONFIG: &str = "\
caps:
  thread_a: tcb
  thread_b: tcb
  ipc_a: frame
  ipc_b: frame
cnodes:
  cs:
    size: 4
    guard: 0
vspaces:
  main_vspace: app
threads:
  thread_a:
    cspace: cs
    vspace: main_vspace
    ipc_buffer: ipc_a
    stack_size: 8192
  thread_b:
    cspace: cs
    vspace: main_vspace
    ipc_buffer: ipc_b
    stack_size: 8192
";

#[test]
fn two_threads_share_a_vspace_with_guard_pages_between() {
    let run = run_pipeline(TWO_THREAD_CONFIG, &[("app", simple_elf())]).unwrap();

    // Segments end at 0x402000; thread A's stack occupies
    // [0x403000, 0x405000) with its IPC buffer at 0x406000, thread B's
    // stack [0x408000, 0x40a000) with its buffer at 0x40b000.
    assert!(run
        .header
        .contains(".vaddr=4218880, .frame=3, .vspace=6")); // 0x406000, ipc_a
    assert!(run
        .header
        .contains(".vaddr=4239360, .frame=4, .vspace=6")); // 0x40b000, ipc_b

    // Each stack travels as a chunk covering the whole stack range.
    assert!(run.header.contains(
        ".src_vaddr=SYM_VAL(_binary_thread_a_stack_frame___bin_start), .dest_vaddr=4206592, .length=8192"
    ));
    assert!(run.header.contains(
        ".src_vaddr=SYM_VAL(_binary_thread_b_stack_frame___bin_start), .dest_vaddr=4227072, .length=8192"
    ));

    // TCB setups carry the computed addresses; argv is just the tcb name.
    assert!(run.header.contains(".ipc_buffer_addr=4218880"));
    assert!(run.header.contains(".ipc_buffer_addr=4239360"));
    assert!(run.header.contains(".arg0=1"));

    // The stack image sits at the top of the stack chunk and names the
    // thread as argv[0].
    let stack_a = fs::read(run.temp_path("thread_a_stack_frame__.bin")).unwrap();
    assert_eq!(stack_a.len(), 0x2000);
    assert!(find_subslice(&stack_a, b"thread_a\0").is_some());
    assert!(find_subslice(&stack_a, b"ipc_buffer=4218880\0").is_some());

    // TCB setup precedes start for both threads.
    let setup = run.header.find("tcb_setup_op").unwrap();
    let start = run.header.find("tcb_start_op").unwrap();
    assert!(setup < start);
}

#[test]
fn creates_lead_and_classes_follow_in_order() {
    let run = run_pipeline(TWO_THREAD_CONFIG, &[("app", simple_elf())]).unwrap();

    let class_markers = [
        "map_op =",
        "binary_chunk_load_op =",
        "map_frame_op =",
        "tcb_setup_op =",
        "tcb_start_op =",
    ];
    let mut last = 0;
    for marker in class_markers {
        let position = run
            .header
            .find(marker)
            .unwrap_or_else(|| panic!("missing {}", marker));
        assert!(position > last, "{} out of order", marker);
        last = position;
    }

    // All create operations precede the first non-create class.
    let first_map = run.header.find("map_op =").unwrap();
    let last_create = run.header.rfind("create_op =").unwrap();
    assert!(last_create < first_map);

    // bytes_required is non-increasing across the create prefix.
    let mut sizes = Vec::new();
    for chunk in run.header.split(".bytes_required=").skip(1) {
        let digits: String = chunk.chars().take_while(|c| c.is_ascii_digit()).collect();
        sizes.push(digits.parse::<u64>().unwrap());
    }
    let mut sorted = sizes.clone();
    sorted.sort_unstable_by(|a, b| b.cmp(a));
    assert_eq!(sizes, sorted);
}

#[test]
fn gp_untypeds_cnode_reserves_a_memory_info_frame() {
    let config = "\
caps:
  thread_a: tcb
  ipc_a: frame
cnodes:
  cs:
    size: 6
    guard: 0
gp_untypeds_cnode:
  cnode: cs
  start_slot: 2
  end_slot: 40
vspaces:
  main_vspace: app
threads:
  thread_a:
    cspace: cs
    vspace: main_vspace
    ipc_buffer: ipc_a
    stack_size: 8192
";
    let run = run_pipeline(config, &[("app", simple_elf())]).unwrap();

    assert!(run.header.contains(
        "{PASS_GP_UNTYPEDS_OP, .pass_gp_untypeds_op = {.cnode_dest=3, .start_slot=2, .end_slot=40, .cnode_depth=6}}"
    ));
    // The info frame lands on the first free page above the segments
    // (0x403000), pushing thread A's stack up to [0x405000, 0x407000).
    assert!(run
        .header
        .contains(".pass_gp_memory_info_op = {.dest_vaddr=4206592, .frame=5, .dest_vspace=4}"));
    let stack = fs::read(run.temp_path("thread_a_stack_frame__.bin")).unwrap();
    assert!(find_subslice(&stack, b"gp_memory_info=4206592\0").is_some());
}

#[test]
fn vsyscall_symbol_feeds_the_sysinfo_auxv_entry() {
    let with_vsyscall = ElfFixture::new()
        .entry(0x401000)
        .segment(Segment {
            vaddr: 0x401000,
            data: vec![0x90; 0x1000],
            mem_size: 0x1000,
        })
        .symbol("sel4_vsyscall", 0x500000)
        .build();

    let config = "\
caps:
  thread_a: tcb
  ipc_a: frame
cnodes:
  cs:
    size: 4
    guard: 0
vspaces:
  main_vspace: app
threads:
  thread_a:
    cspace: cs
    vspace: main_vspace
    ipc_buffer: ipc_a
    stack_size: 8192
";
    // AT_SYSINFO (32) as a little-endian int, padding to the union offset,
    // then the symbol value as a word.
    let mut sysinfo_entry = Vec::new();
    sysinfo_entry.extend_from_slice(&32u32.to_le_bytes());
    sysinfo_entry.extend_from_slice(&[0u8; 4]);
    sysinfo_entry.extend_from_slice(&0x500000u64.to_le_bytes());

    let run = run_pipeline(config, &[("app", with_vsyscall)]).unwrap();
    let stack = fs::read(run.temp_path("thread_a_stack_frame__.bin")).unwrap();
    assert!(find_subslice(&stack, &sysinfo_entry).is_some());

    let run = run_pipeline(config, &[("app", simple_elf())]).unwrap();
    let stack = fs::read(run.temp_path("thread_a_stack_frame__.bin")).unwrap();
    assert!(find_subslice(&stack, &sysinfo_entry).is_none());
}

#[test]
fn entry_symbol_overrides_the_elf_entry_point() {
    let elf = ElfFixture::new()
        .entry(0x401000)
        .segment(Segment {
            vaddr: 0x401000,
            data: vec![0x90; 0x1000],
            mem_size: 0x1000,
        })
        .symbol("worker_main", 0x401234)
        .build();
    let config = "\
caps:
  thread_a: tcb
  ipc_a: frame
cnodes:
  cs:
    size: 4
    guard: 0
vspaces:
  main_vspace: app
threads:
  thread_a:
    cspace: cs
    vspace: main_vspace
    ipc_buffer: ipc_a
    stack_size: 8192
    entry: worker_main
    args: [\"--fast\"]
";
    let run = run_pipeline(config, &[("app", elf)]).unwrap();
    assert!(run.header.contains(".entry_addr=4198964")); // 0x401234
    assert!(run.header.contains(".arg0=2"));

    let stack = fs::read(run.temp_path("thread_a_stack_frame__.bin")).unwrap();
    assert!(find_subslice(&stack, b"--fast\0").is_some());
}

#[test]
fn rerunning_identical_inputs_is_deterministic() {
    let a = run_pipeline(TWO_THREAD_CONFIG, &[("app", simple_elf())]).unwrap();
    let b = run_pipeline(TWO_THREAD_CONFIG, &[("app", simple_elf())]).unwrap();
    assert_eq!(a.header, b.header);
}

#[test]
fn linker_failures_surface_the_tool_stderr() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("config.yaml");
    fs::write(&config_path, "caps:\n  ep: endpoint\n").unwrap();
    let options = Options {
        config_path,
        startup_threads_paths: IndexMap::new(),
        output_header_path: dir.path().join("out.hpp"),
        output_obj_path: dir.path().join("startup_threads.o"),
    };

    let info_getter = StubTool::new("sel4_info_getter", TEST_INFO_JSON.as_bytes());
    let gcc = StubTool::failing("gcc", "undefined reference to happiness");
    match tailspring::generate(options, &info_getter, &gcc) {
        Err(Error::Tool(ToolError::Failed { stderr, .. })) => {
            assert!(stderr.contains("undefined reference to happiness"))
        }
        other => panic!("expected tool failure, got {:?}", other),
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
