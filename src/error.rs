use nix::errno::Errno;

use crate::target::Pid;


pub type Result<T> = std::result::Result<T, Error>;

/// Tracing primitive that the kernel rejected.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Request {
    Detach,
    Step,
    Continue,
    Syscall,
    Wait,
    GetRegisters,
    SetRegisters,
    SetOptions,
    GetSiginfo,
    Kill,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Could not attach to process = {pid}")]
    Attach {
        pid: Pid,
        source: nix::Error,
    },

    #[error("Process = {pid} is not attached")]
    NotAttached { pid: Pid },

    #[error("Could not access {len} bytes of memory at {addr:#x} in process = {pid}")]
    MemoryAccess {
        pid: Pid,
        addr: u64,
        len: usize,
        source: nix::Error,
    },

    #[error("Could not access instruction word at {addr:#x} in process = {pid}")]
    InstructionAccess {
        pid: Pid,
        addr: u64,
        source: nix::Error,
    },

    #[error("Breakpoint already set at {addr:#x}")]
    BreakpointConflict { addr: u64 },

    #[error("No breakpoint set at {addr:#x}")]
    BreakpointNotFound { addr: u64 },

    #[error("Unrecognized register name `{name}`")]
    RegisterNameInvalid { name: String },

    #[error("Tracing request {request:?} failed for process = {pid}")]
    Tracing {
        pid: Pid,
        request: Request,
        source: nix::Error,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True if the failure was caused by the traced process no longer existing.
    pub fn tracee_died(&self) -> bool {
        let source = match self {
            Error::Attach { source, .. } |
            Error::MemoryAccess { source, .. } |
            Error::InstructionAccess { source, .. } |
            Error::Tracing { source, .. } => source,
            _ => return false,
        };

        *source == Errno::ESRCH
    }
}

pub(crate) trait ResultExt<T> {
    /// Attach the process and the rejected tracing request to an OS error.
    fn context(self, pid: Pid, request: Request) -> Result<T>;
}

impl<T> ResultExt<T> for nix::Result<T> {
    fn context(self, pid: Pid, request: Request) -> Result<T> {
        self.map_err(|source| Error::Tracing { pid, request, source })
    }
}

macro_rules! internal_error {
    ($msg: expr) => {
        return Err($crate::error::Error::Internal($msg.into()))
    };
}
