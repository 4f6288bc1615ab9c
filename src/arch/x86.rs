use super::{Arch, ArgumentBlock, MmapRequest};
use object::{elf::FileHeader32, LittleEndian};

/// 32-bit x86, using `int 0x80` and the legacy `mmap` that takes a pointer
/// to its arguments.
#[derive(Debug, Clone, Copy)]
pub struct X86;

/// The i386 `user_regs_struct`.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Registers32 {
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
    pub eax: u32,
    pub xds: u32,
    pub xes: u32,
    pub xfs: u32,
    pub xgs: u32,
    pub orig_eax: u32,
    pub eip: u32,
    pub xcs: u32,
    pub eflags: u32,
    pub esp: u32,
    pub xss: u32,
}

/// `struct mmap_arg_struct`: six `unsigned long`s.
const MMAP_ARG_WORDS: usize = 6;

impl Arch for X86 {
    type Elf = FileHeader32<LittleEndian>;
    type Registers = Registers32;

    const NAME: &'static str = "x86";
    const WORD_SIZE: usize = 4;
    // __NR_mmap on i386 is the old single-argument `old_mmap`.
    const MMAP_SYSCALL: u64 = 90;
    const SYSCALL_INSN: &'static [u8] = &[0xcd, 0x80]; // int 0x80

    fn instruction_pointer(regs: &Registers32) -> u64 {
        u64::from(regs.eip)
    }

    fn set_instruction_pointer(regs: &mut Registers32, ip: u64) {
        regs.eip = ip as u32;
    }

    fn stack_pointer(regs: &Registers32) -> u64 {
        u64::from(regs.esp)
    }

    fn set_stack_pointer(regs: &mut Registers32, sp: u64) {
        regs.esp = sp as u32;
    }

    fn syscall_register(regs: &Registers32) -> u64 {
        u64::from(regs.eax)
    }

    fn set_syscall_register(regs: &mut Registers32, value: u64) {
        regs.eax = value as u32;
    }

    fn orig_syscall(regs: &Registers32) -> i64 {
        i64::from(regs.orig_eax as i32)
    }

    fn marshal_mmap(regs: &mut Registers32, request: &MmapRequest) -> Option<ArgumentBlock> {
        let words = [
            request.addr as u32,
            request.len as u32,
            request.prot.bits(),
            request.flags.bits(),
            request.fd as u32,
            request.offset as u32,
        ];
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        debug_assert_eq!(bytes.len(), MMAP_ARG_WORDS * Self::WORD_SIZE);
        regs.esp = regs
            .esp
            .wrapping_sub(bytes.len().next_multiple_of(Self::WORD_SIZE) as u32);
        regs.ebx = regs.esp;
        Some(ArgumentBlock {
            address: u64::from(regs.esp),
            bytes,
        })
    }
}
