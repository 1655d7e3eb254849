use nix::sys::ptrace;

use crate::arch::{Arch, Endianness, WORD_SIZE};
use crate::target::Pid;

pub type Registers = libc::user_regs_struct;

/// `INT3`, repeated across the word.
const INT3: u8 = 0xcc;

register_table! {
    Registers;
    R15 = "r15" => r15;
    R14 = "r14" => r14;
    R13 = "r13" => r13;
    R12 = "r12" => r12;
    Rbp = "rbp" | "fp" => rbp;
    Rbx = "rbx" => rbx;
    R11 = "r11" => r11;
    R10 = "r10" => r10;
    R9 = "r9" => r9;
    R8 = "r8" => r8;
    Rax = "rax" => rax;
    Rcx = "rcx" => rcx;
    Rdx = "rdx" => rdx;
    Rsi = "rsi" => rsi;
    Rdi = "rdi" => rdi;
    OrigRax = "orig_rax" => orig_rax;
    Rip = "rip" | "pc" => rip;
    Cs = "cs" => cs;
    Eflags = "eflags" => eflags;
    Rsp = "rsp" | "sp" => rsp;
    Ss = "ss" => ss;
    FsBase = "fs_base" => fs_base;
    GsBase = "gs_base" => gs_base;
    Ds = "ds" => ds;
    Es = "es" => es;
    Fs = "fs" => fs;
    Gs = "gs" => gs;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct X86_64;

impl Arch for X86_64 {
    type Registers = Registers;
    type Register = Register;

    const ENDIANNESS: Endianness = Endianness::Little;
    const TRAP: [u8; WORD_SIZE] = [INT3; WORD_SIZE];
    const TRAP_PC_OFFSET: u64 = 1;

    fn pc(regs: &Registers) -> u64 {
        regs.rip
    }

    fn set_pc(regs: &mut Registers, value: u64) {
        regs.rip = value;
    }

    fn sp(regs: &Registers) -> u64 {
        regs.rsp
    }

    fn set_sp(regs: &mut Registers, value: u64) {
        regs.rsp = value;
    }

    fn fp(regs: &Registers) -> u64 {
        regs.rbp
    }

    fn set_fp(regs: &mut Registers, value: u64) {
        regs.rbp = value;
    }

    fn register(regs: &Registers, reg: Register) -> u64 {
        reg.read(regs)
    }

    fn set_register(regs: &mut Registers, reg: Register, value: u64) {
        reg.write(regs, value)
    }

    fn get_registers(pid: Pid) -> nix::Result<Registers> {
        ptrace::getregs(pid)
    }

    fn set_registers(pid: Pid, regs: Registers) -> nix::Result<()> {
        ptrace::setregs(pid, regs)
    }
}
