use thiserror::Error as ThisError;
use vm_memory::{GuestMemoryError, mmap::FromRangesError};

/// Fatal-tier errors (spec §7): every one of these terminates the owning VM.
/// Recoverable, in-run outcomes (a user-mode fault, a rejected `set_brk`)
/// never go through this type — they are booleans, `Option`s, or a
/// [`crate::fault::FaultInfo`] delivered to a sink, precisely so a caller
/// cannot accidentally `?`-propagate a routine "not mapped" outcome into a
/// path that tears down the VM.
#[derive(ThisError, Debug)]
pub enum Error {
    #[error("kvm error: {0}")]
    Kvm(#[from] kvm_ioctls::Error),

    #[error("guest memory error: {0}")]
    GuestMemory(#[from] GuestMemoryError),

    #[error("from ranges error: {0}")]
    FromRanges(#[from] FromRangesError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("elf parse error: {0}")]
    Parsing(#[from] goblin::error::Error),

    #[error("unexpected vCPU exit: {0}")]
    UnexpectedExit(String),

    #[error("kvm api version mismatch: expected {expected}, got {got}")]
    ApiVersionMismatch { expected: i32, got: i32 },

    #[error("invalid target image: {0}")]
    InvalidImage(&'static str),

    #[error("guest physical memory exhausted: no frames left")]
    FramesExhausted,

    #[error("kernel-mode page fault at rip={rip:#x} addr={addr:#x}")]
    KernelModeFault { rip: u64, addr: u64 },

    #[error("unrecognized hypercall tag {0}")]
    UnrecognizedHypercall(u32),

    #[error("invalid memory size suffix in {0:?}")]
    InvalidMemorySize(String),

    #[error("failed to write all MSRs: wrote {wrote} of {expected}")]
    PartialMsrWrite { wrote: usize, expected: usize },
}

pub type Result<T> = std::result::Result<T, Error>;
