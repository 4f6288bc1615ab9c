use super::{Arch, ArgumentBlock, MmapRequest};
use object::{elf::FileHeader64, LittleEndian};

/// 64-bit x86, using the `syscall` instruction and register arguments.
#[derive(Debug, Clone, Copy)]
pub struct X86_64;

/// The x86_64 `user_regs_struct`.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Registers64 {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub orig_rax: u64,
    pub rip: u64,
    pub cs: u64,
    pub eflags: u64,
    pub rsp: u64,
    pub ss: u64,
    pub fs_base: u64,
    pub gs_base: u64,
    pub ds: u64,
    pub es: u64,
    pub fs: u64,
    pub gs: u64,
}

impl Arch for X86_64 {
    type Elf = FileHeader64<LittleEndian>;
    type Registers = Registers64;

    const NAME: &'static str = "x86_64";
    const WORD_SIZE: usize = 8;
    const MMAP_SYSCALL: u64 = 9;
    const SYSCALL_INSN: &'static [u8] = &[0x0f, 0x05]; // syscall

    fn instruction_pointer(regs: &Registers64) -> u64 {
        regs.rip
    }

    fn set_instruction_pointer(regs: &mut Registers64, ip: u64) {
        regs.rip = ip;
    }

    fn stack_pointer(regs: &Registers64) -> u64 {
        regs.rsp
    }

    fn set_stack_pointer(regs: &mut Registers64, sp: u64) {
        regs.rsp = sp;
    }

    fn syscall_register(regs: &Registers64) -> u64 {
        regs.rax
    }

    fn set_syscall_register(regs: &mut Registers64, value: u64) {
        regs.rax = value;
    }

    fn orig_syscall(regs: &Registers64) -> i64 {
        regs.orig_rax as i64
    }

    fn marshal_mmap(regs: &mut Registers64, request: &MmapRequest) -> Option<ArgumentBlock> {
        // The kernel's syscall ABI uses r10 where the C ABI would use rcx,
        // since `syscall` clobbers rcx.
        regs.rdi = request.addr;
        regs.rsi = request.len;
        regs.rdx = u64::from(request.prot.bits());
        regs.r10 = u64::from(request.flags.bits());
        regs.r8 = request.fd as u64;
        regs.r9 = request.offset;
        None
    }
}
