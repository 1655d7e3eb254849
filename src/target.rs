//! Types for attaching to a process, resuming it, and interpreting its stops.

use std::time::Duration;

use nix::{
    errno::Errno,
    sys::{
        ptrace,
        signal,
        wait::{WaitPidFlag, WaitStatus},
    },
};
use tracing::{debug, info};

use crate::arch::{Arch, Endianness, NativeArch, Register, Registers};
use crate::breakpoint::BreakpointTable;
use crate::error::{Error, Request, Result, ResultExt};
use crate::memory::Memory;

pub use nix::unistd::Pid;
pub use nix::sys::ptrace::Options;

/// POSIX signal.
pub use nix::sys::signal::Signal;

/// Extra signal info, such as its cause.
pub type Siginfo = libc::siginfo_t;

/// Restart requests, which resume a stopped process.
///
/// The restart mode determines the possible subsequent stops.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Restart {
    Step,
    Continue,
    Syscall,
}

/// State change of a traced process, as reported by `wait(2)`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StopStatus {
    // signal-delivery-stop, including breakpoint and single-step traps
    Stopped { signal: Signal },

    // syscall-stop, reported when `PTRACE_O_TRACESYSGOOD` is set
    Syscall,

    // ptrace-event-stop, with its `PTRACE_EVENT_*` code
    Event { signal: Signal, event: i32 },

    Exited { exit_code: i32 },
    Signaled { signal: Signal, core_dumped: bool },
    Continued,
}

/// Resources consumed by the waited-on process, from the `rusage` filled in by `wait4(2)`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ResourceUsage {
    pub user_time: Duration,
    pub system_time: Duration,

    /// Peak resident set size, in kilobytes.
    pub max_rss: i64,

    pub minor_faults: i64,
    pub major_faults: i64,
    pub voluntary_context_switches: i64,
    pub involuntary_context_switches: i64,
}

impl From<&libc::rusage> for ResourceUsage {
    fn from(usage: &libc::rusage) -> Self {
        Self {
            user_time: duration(usage.ru_utime),
            system_time: duration(usage.ru_stime),
            max_rss: usage.ru_maxrss as i64,
            minor_faults: usage.ru_minflt as i64,
            major_faults: usage.ru_majflt as i64,
            voluntary_context_switches: usage.ru_nvcsw as i64,
            involuntary_context_switches: usage.ru_nivcsw as i64,
        }
    }
}

fn duration(tv: libc::timeval) -> Duration {
    Duration::from_secs(tv.tv_sec as u64) + Duration::from_micros(tv.tv_usec as u64)
}

/// An observed stop, exit, or other state change.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Wait {
    pub status: StopStatus,
    pub usage: ResourceUsage,
}

/// A process (or thread) under our control.
///
/// All requests must be issued from the thread that attached. Register and memory state
/// is only meaningful while the process is stopped, and any restart invalidates
/// previously read register snapshots.
#[derive(Debug)]
pub struct TargetProcess {
    pid: Pid,
    attached: bool,
    is_thread: bool,
    endianness: Endianness,
    pub(crate) breakpoints: BreakpointTable,
}

impl TargetProcess {
    /// Take control of `pid`.
    ///
    /// If `already_attached` is false, this issues `PTRACE_ATTACH`, which delivers a
    /// `SIGSTOP`; the process may not be considered stopped until seen via
    /// [`TargetProcess::wait()`]. Otherwise the caller asserts that we are already its
    /// tracer, e.g. because it requested `PTRACE_TRACEME`.
    pub fn new(pid: Pid, already_attached: bool, is_thread: bool) -> Result<Self> {
        if !already_attached {
            ptrace::attach(pid).map_err(|source| Error::Attach { pid, source })?;
            info!(pid = pid.as_raw(), is_thread, "attached");
        }

        let attached = true;
        let endianness = NativeArch::ENDIANNESS;
        let breakpoints = BreakpointTable::default();

        Ok(Self { pid, attached, is_thread, endianness, breakpoints })
    }

    /// Attach to a running process.
    pub fn attach(pid: Pid) -> Result<Self> {
        Self::new(pid, false, false)
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    pub fn is_thread(&self) -> bool {
        self.is_thread
    }

    /// Byte order used to interpret memory words.
    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    pub fn set_endianness(&mut self, endianness: Endianness) {
        self.endianness = endianness;
    }

    /// Stop tracing the process. Does nothing if already detached.
    ///
    /// Breakpoints are left in place.
    pub fn detach(&mut self) -> Result<()> {
        if !self.attached {
            return Ok(());
        }

        let res = ptrace::detach(self.pid, None);
        self.attached = false;
        info!(pid = self.pid.as_raw(), "detached");

        res.context(self.pid, Request::Detach)
    }

    /// Set ptrace options, such as `PTRACE_O_TRACESYSGOOD`.
    pub fn set_options(&mut self, options: Options) -> Result<()> {
        self.ensure_attached()?;

        ptrace::setoptions(self.pid, options).context(self.pid, Request::SetOptions)
    }

    /// Execute exactly one instruction.
    pub fn single_step(&mut self) -> Result<()> {
        self.restart(Restart::Step, None)
    }

    pub fn cont(&mut self) -> Result<()> {
        self.restart(Restart::Continue, None)
    }

    /// Continue, delivering `signal` unless it is a `SIGTRAP`.
    pub fn cont_with_signal(&mut self, signal: Signal) -> Result<()> {
        self.restart(Restart::Continue, filter_signal(signal))
    }

    /// Continue until the next syscall-enter or syscall-exit.
    pub fn syscall(&mut self) -> Result<()> {
        self.restart(Restart::Syscall, None)
    }

    /// Like [`TargetProcess::syscall()`], delivering `signal` unless it is a `SIGTRAP`.
    pub fn syscall_with_signal(&mut self, signal: Signal) -> Result<()> {
        self.restart(Restart::Syscall, filter_signal(signal))
    }

    fn restart(&mut self, restart: Restart, pending: Option<Signal>) -> Result<()> {
        self.ensure_attached()?;

        debug!(pid = self.pid.as_raw(), ?restart, ?pending, "restarting");

        let (res, request) = match restart {
            Restart::Step => (ptrace::step(self.pid, pending), Request::Step),
            Restart::Continue => (ptrace::cont(self.pid, pending), Request::Continue),
            Restart::Syscall => (ptrace::syscall(self.pid, pending), Request::Syscall),
        };

        res.context(self.pid, request)
    }

    /// Wait for the process to change state.
    ///
    /// If `block` is false and no state change is pending, returns `None` immediately.
    /// Seeing the process exit or die ends our attachment to it.
    pub fn wait(&mut self, block: bool) -> Result<Option<Wait>> {
        self.ensure_attached()?;

        let mut flags = WaitPidFlag::__WALL;
        if !block {
            flags |= WaitPidFlag::WNOHANG;
        }

        let mut raw_status: libc::c_int = 0;
        let mut usage = std::mem::MaybeUninit::<libc::rusage>::zeroed();

        // SAFETY: both out-pointers are valid for writes for the duration of the call.
        let res = unsafe {
            libc::wait4(self.pid.as_raw(), &mut raw_status, flags.bits(), usage.as_mut_ptr())
        };
        let res = Errno::result(res).context(self.pid, Request::Wait)?;

        if res == 0 {
            return Ok(None);
        }

        // SAFETY: zero-initialized, and only ever written by the kernel.
        let usage = ResourceUsage::from(unsafe { usage.assume_init_ref() });

        let raw = WaitStatus::from_raw(self.pid, raw_status).context(self.pid, Request::Wait)?;

        let status = match raw {
            WaitStatus::Stopped(_, signal) => StopStatus::Stopped { signal },
            WaitStatus::PtraceSyscall(_) => StopStatus::Syscall,
            WaitStatus::PtraceEvent(_, signal, event) => StopStatus::Event { signal, event },
            WaitStatus::Exited(_, exit_code) => {
                info!(pid = self.pid.as_raw(), exit_code, "process exited");
                self.attached = false;
                StopStatus::Exited { exit_code }
            },
            WaitStatus::Signaled(_, signal, core_dumped) => {
                info!(pid = self.pid.as_raw(), ?signal, core_dumped, "process killed by signal");
                self.attached = false;
                StopStatus::Signaled { signal, core_dumped }
            },
            WaitStatus::Continued(_) => StopStatus::Continued,
            WaitStatus::StillAlive => {
                internal_error!("nonzero `wait4()` result for live process")
            },
        };

        Ok(Some(Wait { status, usage }))
    }

    /// Fetch a fresh register snapshot.
    pub fn registers(&self) -> Result<Registers> {
        self.ensure_attached()?;

        NativeArch::get_registers(self.pid).context(self.pid, Request::GetRegisters)
    }

    pub fn set_registers(&mut self, regs: Registers) -> Result<()> {
        self.ensure_attached()?;

        NativeArch::set_registers(self.pid, regs).context(self.pid, Request::SetRegisters)
    }

    // Read-modify-write of the full register snapshot.
    fn update_registers(&mut self, update: impl FnOnce(&mut Registers)) -> Result<()> {
        let mut regs = self.registers()?;
        update(&mut regs);
        self.set_registers(regs)
    }

    pub fn program_counter(&self) -> Result<u64> {
        Ok(NativeArch::pc(&self.registers()?))
    }

    pub fn set_program_counter(&mut self, pc: u64) -> Result<()> {
        debug!(pid = self.pid.as_raw(), pc, "setting program counter");
        self.update_registers(|regs| NativeArch::set_pc(regs, pc))
    }

    pub fn stack_pointer(&self) -> Result<u64> {
        Ok(NativeArch::sp(&self.registers()?))
    }

    pub fn set_stack_pointer(&mut self, sp: u64) -> Result<()> {
        debug!(pid = self.pid.as_raw(), sp, "setting stack pointer");
        self.update_registers(|regs| NativeArch::set_sp(regs, sp))
    }

    pub fn frame_pointer(&self) -> Result<u64> {
        Ok(NativeArch::fp(&self.registers()?))
    }

    pub fn set_frame_pointer(&mut self, fp: u64) -> Result<()> {
        debug!(pid = self.pid.as_raw(), fp, "setting frame pointer");
        self.update_registers(|regs| NativeArch::set_fp(regs, fp))
    }

    pub fn register(&self, reg: Register) -> Result<u64> {
        Ok(NativeArch::register(&self.registers()?, reg))
    }

    pub fn set_register(&mut self, reg: Register, value: u64) -> Result<()> {
        debug!(pid = self.pid.as_raw(), %reg, value, "setting register");
        self.update_registers(|regs| NativeArch::set_register(regs, reg, value))
    }

    /// Read a register by name, such as `"rax"` or `"pc"`.
    pub fn register_by_name(&self, name: &str) -> Result<u64> {
        self.register(name.parse()?)
    }

    pub fn set_register_by_name(&mut self, name: &str, value: u64) -> Result<()> {
        self.set_register(name.parse()?, value)
    }

    /// Fetch details of the signal that caused the current stop.
    pub fn siginfo(&self) -> Result<Siginfo> {
        self.ensure_attached()?;

        ptrace::getsiginfo(self.pid).context(self.pid, Request::GetSiginfo)
    }

    /// Send `signal` to the process, with `kill(2)`.
    pub fn send_signal(&self, signal: Signal) -> Result<()> {
        signal::kill(self.pid, signal).context(self.pid, Request::Kill)
    }

    pub fn kill(&self) -> Result<()> {
        self.send_signal(Signal::SIGKILL)
    }

    pub(crate) fn ensure_attached(&self) -> Result<()> {
        if self.attached {
            Ok(())
        } else {
            Err(Error::NotAttached { pid: self.pid })
        }
    }

    pub(crate) fn memory(&self) -> Result<Memory> {
        self.ensure_attached()?;

        Ok(Memory::new(self.pid, self.endianness))
    }
}

// A `SIGTRAP` is how the process reports our own breakpoints and steps. Passing it back
// on restart would deliver it to the process as if it came from elsewhere.
fn filter_signal(signal: Signal) -> Option<Signal> {
    if signal == Signal::SIGTRAP {
        None
    } else {
        Some(signal)
    }
}
