//! Architecture-specific register access and instruction patching.

use std::fmt::Debug;
use std::str::FromStr;

use crate::error::Error;
use crate::target::Pid;

/// Size in bytes of a machine word, the unit of `PTRACE_PEEKDATA` and `PTRACE_POKEDATA`.
pub const WORD_SIZE: usize = 8;

/// Byte order used to interpret target memory words.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Endianness {
    Little,
    Big,
}

impl Endianness {
    pub fn word_from_bytes(self, bytes: [u8; WORD_SIZE]) -> u64 {
        match self {
            Endianness::Little => u64::from_le_bytes(bytes),
            Endianness::Big => u64::from_be_bytes(bytes),
        }
    }

    pub fn word_to_bytes(self, word: u64) -> [u8; WORD_SIZE] {
        match self {
            Endianness::Little => word.to_le_bytes(),
            Endianness::Big => word.to_be_bytes(),
        }
    }
}

/// Register layout and breakpoint encoding of an instruction set.
///
/// Everything outside the per-ISA modules reaches registers only through this trait.
pub trait Arch {
    /// Register snapshot, as transferred by the kernel.
    type Registers: Copy + Debug;

    /// Closed set of register identifiers.
    type Register: Copy + Debug + Eq + FromStr<Err = Error>;

    const ENDIANNESS: Endianness;

    /// Trap instruction(s) filling one word, in memory order.
    const TRAP: [u8; WORD_SIZE];

    /// Distance the program counter has moved past a trap when the tracee stops on it.
    const TRAP_PC_OFFSET: u64;

    fn pc(regs: &Self::Registers) -> u64;
    fn set_pc(regs: &mut Self::Registers, value: u64);

    fn sp(regs: &Self::Registers) -> u64;
    fn set_sp(regs: &mut Self::Registers, value: u64);

    fn fp(regs: &Self::Registers) -> u64;
    fn set_fp(regs: &mut Self::Registers, value: u64);

    fn register(regs: &Self::Registers, reg: Self::Register) -> u64;
    fn set_register(regs: &mut Self::Registers, reg: Self::Register, value: u64);

    fn get_registers(pid: Pid) -> nix::Result<Self::Registers>;
    fn set_registers(pid: Pid, regs: Self::Registers) -> nix::Result<()>;

    /// The trap pattern as a word value, under the given byte order.
    fn trap_word(endianness: Endianness) -> u64 {
        endianness.word_from_bytes(Self::TRAP)
    }
}

#[cfg(target_arch = "x86_64")]
pub type NativeArch = crate::x86::X86_64;

#[cfg(target_arch = "aarch64")]
pub type NativeArch = crate::aarch64::Aarch64;

/// Register identifiers of the build target.
#[cfg(target_arch = "x86_64")]
pub use crate::x86::Register;

/// Register identifiers of the build target.
#[cfg(target_arch = "aarch64")]
pub use crate::aarch64::Register;

/// Register state of a traced process.
pub type Registers = <NativeArch as Arch>::Registers;

// Declares a `Register` enum over the fields of a register snapshot. Each entry names
// the variant, its canonical lowercase name, any aliases, and the snapshot field.
macro_rules! register_table {
    (
        $regs: ty;
        $(
            $variant: ident = $name: literal $(| $alias: literal)* =>
                $field: ident $([$index: literal])? ;
        )+
    ) => {
        #[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
        pub enum Register {
            $( $variant, )+
        }

        impl Register {
            pub const ALL: &'static [Register] = &[ $( Register::$variant, )+ ];

            pub fn name(self) -> &'static str {
                match self {
                    $( Register::$variant => $name, )+
                }
            }

            pub(crate) fn read(self, regs: &$regs) -> u64 {
                match self {
                    $( Register::$variant => regs.$field $([$index])? as u64, )+
                }
            }

            pub(crate) fn write(self, regs: &mut $regs, value: u64) {
                match self {
                    $( Register::$variant => regs.$field $([$index])? = value as _, )+
                }
            }
        }

        impl std::str::FromStr for Register {
            type Err = $crate::error::Error;

            fn from_str(name: &str) -> std::result::Result<Self, Self::Err> {
                match name.to_ascii_lowercase().as_str() {
                    $( $name $(| $alias)* => Ok(Register::$variant), )+
                    _ => Err($crate::error::Error::RegisterNameInvalid { name: name.into() }),
                }
            }
        }

        impl std::fmt::Display for Register {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.name())
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_byte_order() {
        let bytes = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];

        assert_eq!(Endianness::Little.word_from_bytes(bytes), 0x0807_0605_0403_0201);
        assert_eq!(Endianness::Big.word_from_bytes(bytes), 0x0102_0304_0506_0708);

        for &endianness in &[Endianness::Little, Endianness::Big] {
            let word = endianness.word_from_bytes(bytes);
            assert_eq!(endianness.word_to_bytes(word), bytes);
        }
    }

    #[test]
    fn test_trap_word_keeps_memory_order() {
        for &endianness in &[Endianness::Little, Endianness::Big] {
            let word = NativeArch::trap_word(endianness);
            assert_eq!(endianness.word_to_bytes(word), NativeArch::TRAP);
        }
    }

    #[test]
    fn test_aliases_resolve_to_accessors() {
        let mut regs = zeroed_registers();

        NativeArch::set_pc(&mut regs, 0x1000);
        NativeArch::set_sp(&mut regs, 0x2000);
        NativeArch::set_fp(&mut regs, 0x3000);

        let pc: Register = "pc".parse().unwrap();
        let sp: Register = "SP".parse().unwrap();
        let fp: Register = "fp".parse().unwrap();

        assert_eq!(NativeArch::register(&regs, pc), 0x1000);
        assert_eq!(NativeArch::register(&regs, sp), 0x2000);
        assert_eq!(NativeArch::register(&regs, fp), 0x3000);
    }

    #[test]
    fn test_unknown_register_name() {
        let err = "nope".parse::<Register>().unwrap_err();
        assert!(matches!(err, Error::RegisterNameInvalid { ref name } if name == "nope"));
    }

    #[test]
    fn test_every_register_is_independent() {
        let mut regs = zeroed_registers();

        for (i, &reg) in Register::ALL.iter().enumerate() {
            NativeArch::set_register(&mut regs, reg, 0x100 + i as u64);
        }

        for (i, &reg) in Register::ALL.iter().enumerate() {
            assert_eq!(NativeArch::register(&regs, reg), 0x100 + i as u64, "{}", reg);
            assert_eq!(reg.name().parse::<Register>().unwrap(), reg);
        }
    }

    fn zeroed_registers() -> Registers {
        // SAFETY: register snapshots are plain integer structs.
        unsafe { std::mem::zeroed() }
    }
}
