//! Software breakpoints, installed by patching a trap word over program text.

use std::collections::BTreeMap;

use tracing::debug;

use crate::arch::{Arch, NativeArch, WORD_SIZE};
use crate::error::{Error, Result};
use crate::memory::WordMemory;
use crate::target::TargetProcess;

/// A patched address and the word it displaced.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Breakpoint {
    addr: u64,
    backup: u64,
    enabled: bool,
}

impl Breakpoint {
    pub fn addr(&self) -> u64 {
        self.addr
    }

    /// Original word at [`Breakpoint::addr()`], before patching.
    pub fn backup(&self) -> u64 {
        self.backup
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    // Save the word at `addr` and overwrite it with `trap`.
    fn enable(memory: &mut impl WordMemory, addr: u64, trap: u64) -> Result<Self> {
        let pid = memory.pid();

        let backup = memory.read_word(addr)
            .map_err(|source| Error::InstructionAccess { pid, addr, source })?;

        memory.write_word(addr, trap)
            .map_err(|source| Error::InstructionAccess { pid, addr, source })?;

        Ok(Self { addr, backup, enabled: true })
    }

    // Put the saved word back.
    fn disable(&mut self, memory: &mut impl WordMemory) -> Result<()> {
        let pid = memory.pid();
        let addr = self.addr;

        memory.write_word(addr, self.backup)
            .map_err(|source| Error::InstructionAccess { pid, addr, source })?;

        self.enabled = false;

        Ok(())
    }
}

/// Breakpoints of one process, keyed by address.
///
/// An entry exists exactly when its address currently holds the trap pattern.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct BreakpointTable {
    entries: BTreeMap<u64, Breakpoint>,
}

impl BreakpointTable {
    pub fn get(&self, addr: u64) -> Option<&Breakpoint> {
        self.entries.get(&addr)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Breakpoint> {
        self.entries.values()
    }

    /// First breakpoint whose patched word shares a byte with the word at `addr`.
    pub fn overlapping(&self, addr: u64) -> Option<&Breakpoint> {
        let span = WORD_SIZE as u64 - 1;
        let lo = addr.saturating_sub(span);
        let hi = addr.saturating_add(span);

        self.entries.range(lo..=hi).map(|(_, bp)| bp).next()
    }

    pub fn insert(
        &mut self,
        memory: &mut impl WordMemory,
        addr: u64,
        trap: u64,
    ) -> Result<&Breakpoint> {
        // Patched words may not share bytes, or a backup would capture another trap.
        if let Some(other) = self.overlapping(addr) {
            return Err(Error::BreakpointConflict { addr: other.addr });
        }

        let bp = Breakpoint::enable(memory, addr, trap)?;
        debug!(pid = memory.pid().as_raw(), addr, backup = bp.backup, "set breakpoint");

        Ok(self.entries.entry(addr).or_insert(bp))
    }

    pub fn remove(&mut self, memory: &mut impl WordMemory, addr: u64) -> Result<Breakpoint> {
        let mut bp = self.entries.remove(&addr).ok_or(Error::BreakpointNotFound { addr })?;

        // Dropped from the table even if the restore fails: the patched word is now in an
        // unknown state, and the caller learns of it from the error.
        bp.disable(memory)?;
        debug!(pid = memory.pid().as_raw(), addr, "deleted breakpoint");

        Ok(bp)
    }
}

impl TargetProcess {
    /// Patch the trap pattern over the word at `addr`.
    ///
    /// `addr` must be readable and writable as a whole word through ptrace. Fails with
    /// [`Error::BreakpointConflict`] if the word overlaps an existing breakpoint's word.
    /// On failure, no breakpoint is recorded.
    pub fn set_breakpoint(&mut self, addr: u64) -> Result<Breakpoint> {
        let mut memory = self.memory()?;
        let trap = NativeArch::trap_word(self.endianness());

        self.breakpoints.insert(&mut memory, addr, trap).map(|bp| *bp)
    }

    /// Restore the original word at `addr` and forget the breakpoint.
    ///
    /// If `reset_pc` is set, also rewind the program counter to `addr`, so the restored
    /// instruction runs on the next resume.
    pub fn delete_breakpoint(&mut self, addr: u64, reset_pc: bool) -> Result<Breakpoint> {
        let mut memory = self.memory()?;

        let bp = self.breakpoints.remove(&mut memory, addr)?;

        if reset_pc {
            self.set_program_counter(addr)?;
        }

        Ok(bp)
    }

    pub fn breakpoint(&self, addr: u64) -> Option<Breakpoint> {
        self.breakpoints.get(addr).copied()
    }

    pub fn breakpoints(&self) -> impl Iterator<Item = &Breakpoint> {
        self.breakpoints.iter()
    }
}
