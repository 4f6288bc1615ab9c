//! The instruction sets whose syscall conventions the remote execution engine
//! knows how to drive.
//!
//! Each [`Arch`] ties together an ELF class, a register file and a way of
//! handing a memory-mapping request to the kernel. The variant matching the
//! host is exported as [`Native`]; the others remain available so that a
//! [`Target`](crate::Target) backend for a different tracee can name them.
use bitflags::bitflags;
use object::read::elf::FileHeader;
use std::fmt::Debug;

pub use self::x86::{Registers32, X86};
pub use self::x86_64::{Registers64, X86_64};

mod x86;
mod x86_64;

/// The architecture this crate was built for.
#[cfg(target_arch = "x86_64")]
pub type Native = X86_64;
/// The architecture this crate was built for.
#[cfg(target_arch = "x86")]
pub type Native = X86;

/// Return codes the kernel leaves in the result register of a syscall that
/// was interrupted and will be restarted when the task resumes.
const RESTART_CODES: [i64; 4] = [
    -512, // ERESTARTSYS
    -513, // ERESTARTNOINTR
    -514, // ERESTARTNOHAND
    -516, // ERESTART_RESTARTBLOCK
];

bitflags! {
    /// Memory protection of a remote mapping.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct ProtFlags: u32 {
        /// No access allowed.
        const PROT_NONE = 0;
        /// The mapping can be read.
        const PROT_READ = 1;
        /// The mapping can be written.
        const PROT_WRITE = 2;
        /// The mapping can be executed.
        const PROT_EXEC = 4;
    }
}

bitflags! {
    /// How a remote mapping is created.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        /// Changes are shared with other mappings of the same object.
        const MAP_SHARED = 0x01;
        /// Copy-on-write mapping private to the target.
        const MAP_PRIVATE = 0x02;
        /// Place the mapping at exactly the requested address.
        const MAP_FIXED = 0x10;
        /// Not backed by any file.
        const MAP_ANONYMOUS = 0x20;
    }
}

/// The arguments of an `mmap` call made on behalf of the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmapRequest {
    /// Requested address, or 0 to let the kernel choose.
    pub addr: u64,
    /// Length of the mapping in bytes.
    pub len: u64,
    /// Protection of the new pages.
    pub prot: ProtFlags,
    /// Mapping flags.
    pub flags: MapFlags,
    /// Backing file descriptor, -1 for anonymous mappings.
    pub fd: i64,
    /// Offset into the backing file.
    pub offset: u64,
}

impl MmapRequest {
    /// An anonymous mapping request.
    #[must_use]
    pub const fn anonymous(addr: u64, len: u64, flags: MapFlags, prot: ProtFlags) -> Self {
        Self {
            addr,
            len,
            prot,
            flags,
            fd: -1,
            offset: 0,
        }
    }
}

/// A block of memory that has to be written into the target before a syscall
/// can run, because the calling convention passes arguments by reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgumentBlock {
    /// Where the block goes in the target.
    pub address: u64,
    /// The encoded block.
    pub bytes: Vec<u8>,
}

/// An instruction set together with the ELF class and syscall conventions of
/// processes running on it.
pub trait Arch: Copy + Debug + 'static {
    /// The ELF class (and byte order) of binaries for this architecture.
    type Elf: FileHeader;
    /// The general purpose register file as exposed by `PTRACE_GETREGS`.
    type Registers: Copy + Debug + Default + PartialEq;

    /// Human-readable name, for logs.
    const NAME: &'static str;
    /// Size of a pointer in bytes.
    const WORD_SIZE: usize;
    /// Syscall number of the `mmap` variant used by [`Arch::marshal_mmap`].
    const MMAP_SYSCALL: u64;
    /// The instruction that enters the kernel.
    const SYSCALL_INSN: &'static [u8];

    /// Current instruction pointer.
    fn instruction_pointer(regs: &Self::Registers) -> u64;
    /// Redirect the instruction pointer.
    fn set_instruction_pointer(regs: &mut Self::Registers, ip: u64);
    /// Current stack pointer.
    fn stack_pointer(regs: &Self::Registers) -> u64;
    /// Move the stack pointer.
    fn set_stack_pointer(regs: &mut Self::Registers, sp: u64);
    /// The register that carries the syscall number in and the result out.
    fn syscall_register(regs: &Self::Registers) -> u64;
    /// Load the syscall number register.
    fn set_syscall_register(regs: &mut Self::Registers, value: u64);
    /// The syscall the task was in when it stopped, or a negative value if
    /// it was not in one.
    fn orig_syscall(regs: &Self::Registers) -> i64;

    /// Put the arguments of `request` where the kernel expects them.
    ///
    /// Returns the block that must be written into the target before the
    /// syscall runs, if the convention passes arguments through memory.
    fn marshal_mmap(regs: &mut Self::Registers, request: &MmapRequest) -> Option<ArgumentBlock>;

    /// The syscall result register, sign-extended from the word size.
    fn syscall_result(regs: &Self::Registers) -> i64 {
        let raw = Self::syscall_register(regs);
        if Self::WORD_SIZE == 4 {
            i64::from(raw as u32 as i32)
        } else {
            raw as i64
        }
    }

    /// How far the instruction pointer has to be moved forward so that the
    /// kernel's syscall-restart rewind lands on the intended address.
    ///
    /// Zero unless the task was stopped inside a syscall whose result
    /// register holds one of the restart codes.
    fn restart_adjustment(regs: &Self::Registers) -> u64 {
        if Self::orig_syscall(regs) >= 0 && RESTART_CODES.contains(&Self::syscall_result(regs)) {
            Self::SYSCALL_INSN.len() as u64
        } else {
            0
        }
    }
}

/// Decode a syscall result into an errno, if it is one.
pub(crate) const fn errno_of(result: i64) -> Option<i32> {
    if result < 0 && result >= -4095 {
        Some(-result as i32)
    } else {
        None
    }
}
