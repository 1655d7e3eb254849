#[macro_use]
pub mod error;

#[macro_use]
pub mod arch;

pub mod breakpoint;
mod memory;
pub mod target;

#[cfg(target_arch = "aarch64")]
pub mod aarch64;

#[cfg(target_arch = "x86_64")]
pub mod x86;

pub use arch::{Arch, Endianness, NativeArch, Register, Registers, WORD_SIZE};
pub use breakpoint::Breakpoint;
pub use error::{Error, Request, Result};
pub use target::{
    Options, Pid, ResourceUsage, Restart, Siginfo, Signal, StopStatus, TargetProcess, Wait,
};
