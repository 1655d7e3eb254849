use nix::errno::Errno;

use crate::arch::{Arch, Endianness, WORD_SIZE};
use crate::target::Pid;

/// Linux constant defined in `include/uapi/linux/elf.h`.
const NT_PRSTATUS: i32 = 0x1;

/// `BRK #0`, encoded little-endian, twice per word.
const BRK: [u8; 4] = [0x00, 0x00, 0x20, 0xd4];

/// Defined in [`arch/arm64/include/uapi/asm/ptrace.h`](https://android.googlesource.com/kernel/common/+/refs/heads/android-mainline/arch/arm64/include/uapi/asm/ptrace.h#88).
#[allow(non_camel_case_types)]
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct user_pt_regs {
    pub regs: [u64; 31],
    pub sp: u64,
    pub pc: u64,
    pub pstate: u64
}

pub type Registers = user_pt_regs;

register_table! {
    Registers;
    X0 = "x0" => regs[0];
    X1 = "x1" => regs[1];
    X2 = "x2" => regs[2];
    X3 = "x3" => regs[3];
    X4 = "x4" => regs[4];
    X5 = "x5" => regs[5];
    X6 = "x6" => regs[6];
    X7 = "x7" => regs[7];
    X8 = "x8" => regs[8];
    X9 = "x9" => regs[9];
    X10 = "x10" => regs[10];
    X11 = "x11" => regs[11];
    X12 = "x12" => regs[12];
    X13 = "x13" => regs[13];
    X14 = "x14" => regs[14];
    X15 = "x15" => regs[15];
    X16 = "x16" => regs[16];
    X17 = "x17" => regs[17];
    X18 = "x18" => regs[18];
    X19 = "x19" => regs[19];
    X20 = "x20" => regs[20];
    X21 = "x21" => regs[21];
    X22 = "x22" => regs[22];
    X23 = "x23" => regs[23];
    X24 = "x24" => regs[24];
    X25 = "x25" => regs[25];
    X26 = "x26" => regs[26];
    X27 = "x27" => regs[27];
    X28 = "x28" => regs[28];
    X29 = "x29" | "fp" => regs[29];
    X30 = "x30" | "lr" => regs[30];
    Sp = "sp" => sp;
    Pc = "pc" => pc;
    Pstate = "pstate" => pstate;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Aarch64;

impl Arch for Aarch64 {
    type Registers = Registers;
    type Register = Register;

    const ENDIANNESS: Endianness = Endianness::Little;
    const TRAP: [u8; WORD_SIZE] = [BRK[0], BRK[1], BRK[2], BRK[3], BRK[0], BRK[1], BRK[2], BRK[3]];

    // The kernel reports `BRK` with the PC still on the trapping instruction.
    const TRAP_PC_OFFSET: u64 = 0;

    fn pc(regs: &Registers) -> u64 {
        regs.pc
    }

    fn set_pc(regs: &mut Registers, value: u64) {
        regs.pc = value;
    }

    fn sp(regs: &Registers) -> u64 {
        regs.sp
    }

    fn set_sp(regs: &mut Registers, value: u64) {
        regs.sp = value;
    }

    fn fp(regs: &Registers) -> u64 {
        regs.regs[29]
    }

    fn set_fp(regs: &mut Registers, value: u64) {
        regs.regs[29] = value;
    }

    fn register(regs: &Registers, reg: Register) -> u64 {
        reg.read(regs)
    }

    fn set_register(regs: &mut Registers, reg: Register, value: u64) {
        reg.write(regs, value)
    }

    fn get_registers(pid: Pid) -> nix::Result<Registers> {
        let mut data = std::mem::MaybeUninit::<Registers>::uninit();
        let mut rv = libc::iovec {
            iov_base: data.as_mut_ptr() as *mut libc::c_void,
            iov_len: std::mem::size_of::<Registers>(),
        };

        // SAFETY: `rv` describes `data`, which is valid for writes of `iov_len` bytes and
        // outlives the call.
        let res = unsafe {
            libc::ptrace(
                libc::PTRACE_GETREGSET,
                pid.as_raw(),
                NT_PRSTATUS,
                &mut rv as *mut _ as *mut libc::c_void,
            )
        };

        Errno::result(res)?;

        // SAFETY: the kernel filled the whole `NT_PRSTATUS` regset, as the call succeeded.
        Ok(unsafe { data.assume_init() })
    }

    fn set_registers(pid: Pid, regs: Registers) -> nix::Result<()> {
        let mut rv = libc::iovec {
            iov_base: &regs as *const _ as *const libc::c_void as *mut libc::c_void,
            iov_len: std::mem::size_of::<Registers>(),
        };

        // SAFETY: `rv` describes `regs`, which outlives the call and is only read by the
        // kernel.
        let res = unsafe {
            libc::ptrace(
                libc::PTRACE_SETREGSET,
                pid.as_raw(),
                NT_PRSTATUS,
                &mut rv as *mut _ as *mut libc::c_void,
            )
        };

        Errno::result(res)?;

        Ok(())
    }
}
