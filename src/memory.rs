//! Reading and writing the memory of a traced process.
//!
//! Two backends are used. Word-granular `PTRACE_PEEKDATA`/`PTRACE_POKEDATA` serves
//! single-word patches and small transfers, and `process_vm_readv(2)`/`process_vm_writev(2)`
//! serves bulk copies.

use std::io::{IoSlice, IoSliceMut};

use nix::{
    errno::Errno,
    sys::{
        ptrace::{self, AddressType},
        uio::{self, RemoteIoVec},
    },
};
use tracing::trace;

use crate::arch::{Endianness, WORD_SIZE};
use crate::error::{Error, Result};
use crate::target::{Pid, TargetProcess};

/// Word-granular access to target memory.
pub(crate) trait WordMemory {
    fn pid(&self) -> Pid;

    fn read_word(&self, addr: u64) -> nix::Result<u64>;

    fn write_word(&mut self, addr: u64, word: u64) -> nix::Result<()>;
}

/// Memory of one traced process.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Memory {
    pid: Pid,
    endianness: Endianness,
}

impl Memory {
    pub fn new(pid: Pid, endianness: Endianness) -> Self {
        Self { pid, endianness }
    }

    // Read one word, as bytes in memory order.
    fn peek(&self, addr: u64) -> nix::Result<[u8; WORD_SIZE]> {
        let raw = ptrace::read(self.pid, addr as AddressType)?;
        trace!(pid = self.pid.as_raw(), addr, "peek");

        Ok((raw as i64).to_ne_bytes())
    }

    // Write one word, given as bytes in memory order.
    fn poke(&self, addr: u64, bytes: [u8; WORD_SIZE]) -> nix::Result<()> {
        let raw = i64::from_ne_bytes(bytes);

        // SAFETY: `POKEDATA` passes `data` by value. It is never dereferenced by us or
        // the kernel, and `addr` is only interpreted in the tracee address space.
        unsafe {
            ptrace::write(self.pid, addr as AddressType, raw as AddressType)?;
        }
        trace!(pid = self.pid.as_raw(), addr, "poke");

        Ok(())
    }

    pub fn read_bytes(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        let chunks = word_chunks(addr, len).map_err(|source| self.error(addr, len, source))?;

        let mut data = vec![0; len];

        for chunk in chunks {
            let word = self.peek(chunk.word_addr)
                .map_err(|source| self.error(chunk.word_addr, WORD_SIZE, source))?;

            let dst = &mut data[chunk.offset..chunk.offset + chunk.len];
            dst.copy_from_slice(&word[chunk.skip..chunk.skip + chunk.len]);
        }

        Ok(data)
    }

    pub fn write_bytes(&self, addr: u64, data: &[u8]) -> Result<()> {
        let len = data.len();
        let chunks = word_chunks(addr, len).map_err(|source| self.error(addr, len, source))?;

        for chunk in chunks {
            let src = &data[chunk.offset..chunk.offset + chunk.len];

            // Partial words keep the bytes we were not asked to overwrite.
            let mut word = if chunk.len == WORD_SIZE {
                [0; WORD_SIZE]
            } else {
                self.peek(chunk.word_addr)
                    .map_err(|source| self.error(chunk.word_addr, WORD_SIZE, source))?
            };
            word[chunk.skip..chunk.skip + chunk.len].copy_from_slice(src);

            self.poke(chunk.word_addr, word)
                .map_err(|source| self.error(chunk.word_addr, WORD_SIZE, source))?;
        }

        Ok(())
    }

    pub fn read_memory(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        check_range(addr, len).map_err(|source| self.error(addr, len, source))?;

        let mut data = vec![0; len];
        let remote = [RemoteIoVec { base: addr as usize, len }];

        let read = uio::process_vm_readv(self.pid, &mut [IoSliceMut::new(&mut data)], &remote)
            .map_err(|source| self.error(addr, len, source))?;
        trace!(pid = self.pid.as_raw(), addr, len, read, "process_vm_readv");

        if read < len {
            return Err(self.error(addr + read as u64, len - read, Errno::EFAULT));
        }

        Ok(data)
    }

    pub fn write_memory(&self, addr: u64, data: &[u8]) -> Result<()> {
        let len = data.len();
        check_range(addr, len).map_err(|source| self.error(addr, len, source))?;

        let remote = [RemoteIoVec { base: addr as usize, len }];

        let written = uio::process_vm_writev(self.pid, &[IoSlice::new(data)], &remote)
            .map_err(|source| self.error(addr, len, source))?;
        trace!(pid = self.pid.as_raw(), addr, len, written, "process_vm_writev");

        if written < len {
            return Err(self.error(addr + written as u64, len - written, Errno::EFAULT));
        }

        Ok(())
    }

    fn error(&self, addr: u64, len: usize, source: nix::Error) -> Error {
        Error::MemoryAccess { pid: self.pid, addr, len, source }
    }
}

impl WordMemory for Memory {
    fn pid(&self) -> Pid {
        self.pid
    }

    fn read_word(&self, addr: u64) -> nix::Result<u64> {
        let bytes = self.peek(addr)?;
        Ok(self.endianness.word_from_bytes(bytes))
    }

    fn write_word(&mut self, addr: u64, word: u64) -> nix::Result<()> {
        self.poke(addr, self.endianness.word_to_bytes(word))
    }
}

/// One word-sized transfer serving part of a byte range.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct Chunk {
    /// Offset of the served bytes into the requested range.
    offset: usize,

    /// Address of the word transferred.
    word_addr: u64,

    /// Leading bytes of the word outside the requested range.
    skip: usize,

    /// Number of bytes of the word inside the requested range.
    len: usize,
}

// Split `[addr, addr + len)` into word transfers that never touch bytes outside the
// range when it spans at least one word. Shorter ranges use the aligned words holding
// them, which never cross a page boundary.
fn word_chunks(addr: u64, len: usize) -> nix::Result<Vec<Chunk>> {
    check_range(addr, len)?;

    if len < WORD_SIZE {
        return Ok(aligned_chunks(addr, len));
    }

    let chunks = (0..len)
        .step_by(WORD_SIZE)
        .map(|offset| {
            let remaining = len - offset;

            if remaining >= WORD_SIZE {
                Chunk { offset, word_addr: addr + offset as u64, skip: 0, len: WORD_SIZE }
            } else {
                // Back the last word up so it ends exactly at `addr + len`.
                let word_addr = addr + (len - WORD_SIZE) as u64;
                Chunk { offset, word_addr, skip: WORD_SIZE - remaining, len: remaining }
            }
        })
        .collect();

    Ok(chunks)
}

fn aligned_chunks(addr: u64, len: usize) -> Vec<Chunk> {
    let end = addr + len as u64;
    let mut word_addr = addr & !(WORD_SIZE as u64 - 1);
    let mut chunks = vec![];

    while word_addr < end {
        let start = addr.max(word_addr);
        let next = word_addr.saturating_add(WORD_SIZE as u64);
        let stop = end.min(next);

        chunks.push(Chunk {
            offset: (start - addr) as usize,
            word_addr,
            skip: (start - word_addr) as usize,
            len: (stop - start) as usize,
        });

        word_addr = next;
    }

    chunks
}

fn check_range(addr: u64, len: usize) -> nix::Result<()> {
    if len == 0 {
        return Err(Errno::EINVAL);
    }

    if addr.checked_add(len as u64).is_none() {
        return Err(Errno::EFAULT);
    }

    Ok(())
}

impl TargetProcess {
    /// Read one machine word, interpreted with the target's byte order.
    pub fn read_word(&self, addr: u64) -> Result<u64> {
        let memory = self.memory()?;

        memory.read_word(addr).map_err(|source| memory.error(addr, WORD_SIZE, source))
    }

    /// Write one machine word, encoded with the target's byte order.
    pub fn write_word(&mut self, addr: u64, word: u64) -> Result<()> {
        let mut memory = self.memory()?;

        memory.write_word(addr, word).map_err(|source| memory.error(addr, WORD_SIZE, source))
    }

    /// Read `len` bytes using word-sized ptrace transfers.
    ///
    /// Intended for small reads. Neither `addr` nor `len` need be word-aligned.
    pub fn read_bytes(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        self.memory()?.read_bytes(addr, len)
    }

    /// Write `data` using word-sized ptrace transfers, preserving adjacent bytes.
    pub fn write_bytes(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        self.memory()?.write_bytes(addr, data)
    }

    /// Read `len` bytes with a single cross-process vectorized copy.
    pub fn read_memory(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        self.memory()?.read_memory(addr, len)
    }

    /// Write `data` with a single cross-process vectorized copy.
    ///
    /// Unlike [`TargetProcess::write_bytes()`], this cannot write to read-only mappings
    /// such as program text.
    pub fn write_memory(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        self.memory()?.write_memory(addr, data)
    }
}
