//! Error types for the generator.
//!
//! Failures fall into four kinds: problems with the system description
//! (`ConfigError`), problems touching the filesystem (`IoError`), failures of
//! an external tool (`ToolError`), and violated postconditions of a pipeline
//! stage (`InternalInvariant`). There is no recovery path anywhere; the first
//! error aborts the run with a single-line message naming the failing entity.

use std::fmt;
use std::io;
use std::path::PathBuf;

#[derive(Debug)]
pub enum Error {
    Config(ConfigError),
    Io(IoError),
    Tool(ToolError),
    Invariant(InternalInvariant),
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Error::Config(e)
    }
}

impl From<IoError> for Error {
    fn from(e: IoError) -> Self {
        Error::Io(e)
    }
}

impl From<ToolError> for Error {
    fn from(e: ToolError) -> Self {
        Error::Tool(e)
    }
}

impl From<InternalInvariant> for Error {
    fn from(e: InternalInvariant) -> Self {
        Error::Invariant(e)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Config(e) => write!(f, "config error: {}", e),
            Error::Io(e) => write!(f, "io error: {}", e),
            Error::Tool(e) => write!(f, "tool error: {}", e),
            Error::Invariant(e) => write!(f, "internal invariant violated: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl std::error::Error for ConfigError {}
impl std::error::Error for IoError {}
impl std::error::Error for ToolError {}
impl std::error::Error for InternalInvariant {}

/// A problem with the system description: malformed sections, dangling
/// references, kind mismatches, and the like.
#[derive(Debug)]
pub enum ConfigError {
    MalformedYaml(String),
    Malformed {
        section: &'static str,
        reason: String,
    },
    DuplicateName(String),
    UnknownCapKind {
        name: String,
        kind: String,
    },
    NestedCNode(String),
    UnknownReference {
        referrer: String,
        name: String,
    },
    WrongKind {
        name: String,
        expected: &'static str,
    },
    SlotOutOfRange {
        cnode: String,
        slot: u64,
        size_bits: u8,
    },
    BadStackSize {
        thread: String,
    },
    EntrySymbolNotFound {
        thread: String,
        symbol: String,
    },
    StackImageTooLarge {
        thread: String,
        image_len: usize,
        stack_size: u64,
    },
    UnderivableSource {
        dest: String,
        src: String,
    },
    NoLoadSegments {
        binary: String,
    },
    UnsupportedArch(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::MalformedYaml(reason) => write!(f, "malformed yaml: {}", reason),
            ConfigError::Malformed { section, reason } => {
                write!(f, "malformed '{}' section: {}", section, reason)
            }
            ConfigError::DuplicateName(name) => {
                write!(f, "found duplicate cap with name '{}'", name)
            }
            ConfigError::UnknownCapKind { name, kind } => {
                write!(f, "unknown cap kind '{}' for cap '{}'", kind, name)
            }
            ConfigError::NestedCNode(name) => write!(
                f,
                "nested CNode caps are not allowed (cap name: '{}'); declare CNodes under 'cnodes'",
                name
            ),
            ConfigError::UnknownReference { referrer, name } => {
                write!(f, "'{}' references undeclared name '{}'", referrer, name)
            }
            ConfigError::WrongKind { name, expected } => {
                write!(f, "expected '{}' to be a {}", name, expected)
            }
            ConfigError::SlotOutOfRange {
                cnode,
                slot,
                size_bits,
            } => write!(
                f,
                "slot {} is out of range for cnode '{}' of size {} bits",
                slot, cnode, size_bits
            ),
            ConfigError::BadStackSize { thread } => write!(
                f,
                "expected stack size of thread '{}' to be a non-negative integer",
                thread
            ),
            ConfigError::EntrySymbolNotFound { thread, symbol } => write!(
                f,
                "entry symbol '{}' for thread '{}' not found in its vspace",
                symbol, thread
            ),
            ConfigError::StackImageTooLarge {
                thread,
                image_len,
                stack_size,
            } => write!(
                f,
                "initial stack image of thread '{}' is {} bytes but its stack is only {} bytes",
                thread, image_len, stack_size
            ),
            ConfigError::UnderivableSource { dest, src } => write!(
                f,
                "cap modification '{}' derives from '{}', whose kind cannot be derived",
                dest, src
            ),
            ConfigError::NoLoadSegments { binary } => {
                write!(f, "binary '{}' has no load segments", binary)
            }
            ConfigError::UnsupportedArch(arch) => {
                write!(f, "unsupported architecture '{}'", arch)
            }
        }
    }
}

/// A filesystem-level failure: a missing input, an unwritable output
/// location, or an unreadable ELF.
#[derive(Debug)]
pub enum IoError {
    Missing(PathBuf),
    UnwritableParent(PathBuf),
    Open { path: PathBuf, source: io::Error },
    Write { path: PathBuf, source: io::Error },
    ElfParse { path: PathBuf, reason: String },
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoError::Missing(path) => write!(f, "'{}' is not a valid file path", path.display()),
            IoError::UnwritableParent(path) => write!(
                f,
                "output path '{}' is not inside an existing directory",
                path.display()
            ),
            IoError::Open { path, source } => {
                write!(f, "failed to open '{}': {}", path.display(), source)
            }
            IoError::Write { path, source } => {
                write!(f, "failed to write '{}': {}", path.display(), source)
            }
            IoError::ElfParse { path, reason } => {
                write!(f, "failed to parse '{}' as an ELF: {}", path.display(), reason)
            }
        }
    }
}

/// Failure of an external tool invocation. Stderr of the failed process is
/// carried verbatim.
#[derive(Debug)]
pub enum ToolError {
    Spawn {
        program: PathBuf,
        source: io::Error,
    },
    Failed {
        program: PathBuf,
        exit_code: Option<i32>,
        stderr: String,
    },
    MalformedInfo {
        reason: String,
    },
    MissingObjectSize {
        object: String,
    },
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolError::Spawn { program, source } => {
                write!(f, "failed to run '{}': {}", program.display(), source)
            }
            ToolError::Failed {
                program,
                exit_code,
                stderr,
            } => match exit_code {
                Some(code) => write!(
                    f,
                    "'{}' exited with status {}: {}",
                    program.display(),
                    code,
                    stderr.trim_end()
                ),
                None => write!(
                    f,
                    "'{}' was terminated by a signal: {}",
                    program.display(),
                    stderr.trim_end()
                ),
            },
            ToolError::MalformedInfo { reason } => {
                write!(f, "malformed seL4 info json: {}", reason)
            }
            ToolError::MissingObjectSize { object } => {
                write!(f, "seL4 info json has no object size for '{}'", object)
            }
        }
    }
}

/// A postcondition of a pipeline stage failed. These indicate a bug in the
/// generator rather than in the input.
#[derive(Debug)]
pub enum InternalInvariant {
    UnalignedChunkEnd { vspace: String, vaddr: u64 },
    UnderivableCopySource { src: String },
    OverlappingChunks { vspace: String, a: String, b: String },
}

impl fmt::Display for InternalInvariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InternalInvariant::UnalignedChunkEnd { vspace, vaddr } => write!(
                f,
                "last chunk of vspace '{}' ends at {:#x}, which is not page-aligned",
                vspace, vaddr
            ),
            InternalInvariant::UnderivableCopySource { src } => write!(
                f,
                "attempted to copy cap '{}', whose kind cannot be derived",
                src
            ),
            InternalInvariant::OverlappingChunks { vspace, a, b } => write!(
                f,
                "chunks '{}' and '{}' of vspace '{}' overlap",
                a, b, vspace
            ),
        }
    }
}
