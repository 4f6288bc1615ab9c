//! Making the target do things it never asked to: run a syscall, or jump into
//! injected code.
use crate::{
    arch::{errno_of, MapFlags, MmapRequest, ProtFlags},
    session::{encode_word, Flags},
    target::RegistersOf,
    Arch, Error, Result, Session, Target,
};
use nix::errno::Errno;

impl<T: Target> Session<T> {
    /// Map `len` bytes of fresh memory in the target, wherever the kernel
    /// chooses.
    ///
    /// Needs a syscall instruction, see [`Session::locate_syscall`].
    pub fn map_memory(&mut self, len: u64, flags: MapFlags, prot: ProtFlags) -> Result<u64> {
        self.map_memory_at(0, len, flags, prot)
    }

    /// Map `len` bytes of fresh memory in the target at (or, without
    /// [`MapFlags::MAP_FIXED`], near) `addr`.
    pub fn map_memory_at(
        &mut self,
        addr: u64,
        len: u64,
        flags: MapFlags,
        prot: ProtFlags,
    ) -> Result<u64> {
        self.map_memory_with(&MmapRequest::anonymous(addr, len, flags, prot))
    }

    /// Make the target call `mmap` with the given arguments and return the
    /// address of the new mapping.
    ///
    /// The target's registers, and any stack memory used to pass the
    /// arguments, are restored afterwards whether or not the call succeeded.
    /// The target runs one instruction at a time until the syscall returns;
    /// there is no timeout.
    pub fn map_memory_with(&mut self, request: &MmapRequest) -> Result<u64> {
        let result = self.remote_mmap(request);
        self.record(result)
    }

    fn remote_mmap(&mut self, request: &MmapRequest) -> Result<u64> {
        let verbose = self.is_flag_set(Flags::DEBUG_VERBOSE);
        let gadget = self.syscall_addr;
        let target = self.target_mut()?;
        let gadget = gadget.ok_or(Error::Missing("syscall instruction"))?;
        log::debug!(
            "Mapping {:#x} bytes in {} process {} via syscall at {gadget:x}",
            request.len,
            T::Arch::NAME,
            target.pid()
        );

        let saved = target.registers()?;
        log::trace!("Saved registers: {saved:x?}");
        let mut clobbered = None;
        let outcome = run_mmap(target, saved, gadget, request, verbose, &mut clobbered);

        // Put everything back before looking at the outcome.
        let restored_memory = match &clobbered {
            Some((addr, bytes)) => target.write_memory(*addr, bytes),
            None => Ok(()),
        };
        let restored = target.set_registers(saved);
        log::trace!("Restored registers");
        let regs = outcome?;
        restored?;
        restored_memory?;

        if let Some(errno) = errno_of(T::Arch::syscall_result(&regs)) {
            let errno = Errno::from_i32(errno);
            log::debug!("Could not map memory, mmap in the target failed with {errno}");
            return Err(Error::ChildError { errno });
        }
        let addr = T::Arch::syscall_register(&regs);
        log::info!("Mapped {:#x} bytes at {addr:x}", request.len);
        Ok(addr)
    }

    /// Write `code` into the target at `addr` and arrange for the target to
    /// run it next, as if it had been called from wherever it was stopped.
    ///
    /// The current instruction pointer is pushed as a return address. If the
    /// target was stopped in an interrupted syscall that the kernel is going
    /// to restart, the kernel will rewind the instruction pointer by the
    /// length of the syscall instruction when the target resumes; the new
    /// instruction pointer is advanced by that much so that execution still
    /// starts at `addr`.
    ///
    /// If this fails after the code is written, the code stays in the target
    /// but its control flow is unchanged.
    pub fn inject_shellcode(&mut self, addr: u64, code: &[u8]) -> Result<()> {
        let result = self.inject(addr, code);
        self.record(result)
    }

    fn inject(&mut self, addr: u64, code: &[u8]) -> Result<()> {
        let endian = Self::endian();
        let word = Self::word_size();
        let target = self.target_mut()?;
        target.write_memory(addr, code)?;
        log::trace!("Wrote {} bytes of shellcode at {addr:x}", code.len());

        let mut regs = target.registers()?;
        let ip = T::Arch::instruction_pointer(&regs);
        let sp = T::Arch::stack_pointer(&regs);
        let sp = sp.checked_sub(word as u64).ok_or(Error::Memory { addr: sp, len: word })?;
        log::trace!("Pushing return address {ip:x} at {sp:x}");
        target.write_memory(sp, &encode_word(endian, ip, word))?;
        T::Arch::set_stack_pointer(&mut regs, sp);

        let adjustment = T::Arch::restart_adjustment(&regs);
        if adjustment != 0 {
            log::debug!("Adjusting instruction pointer due to syscall restart");
        }
        // The kernel takes the adjustment back off, wrapping the same way.
        T::Arch::set_instruction_pointer(&mut regs, addr.wrapping_add(adjustment));
        target.set_registers(regs)?;
        log::debug!(
            "Redirected {} process {} to shellcode at {addr:x}",
            T::Arch::NAME,
            target.pid()
        );
        Ok(())
    }
}

/// Point the target at the syscall instruction with the `mmap` arguments
/// loaded, and step it until the syscall has returned.
///
/// `clobbered` receives the original contents of any memory overwritten with
/// arguments, as soon as it has been overwritten.
fn run_mmap<T: Target>(
    target: &mut T,
    saved: RegistersOf<T>,
    gadget: u64,
    request: &MmapRequest,
    verbose: bool,
    clobbered: &mut Option<(u64, Vec<u8>)>,
) -> Result<RegistersOf<T>> {
    let mut regs = saved;
    T::Arch::set_instruction_pointer(&mut regs, gadget);
    T::Arch::set_syscall_register(&mut regs, T::Arch::MMAP_SYSCALL);
    if let Some(block) = T::Arch::marshal_mmap(&mut regs, request) {
        let original = target.read_memory(block.address, block.bytes.len())?;
        target.write_memory(block.address, &block.bytes)?;
        log::trace!("Wrote mmap arguments at {:x}", block.address);
        *clobbered = Some((block.address, original));
    }
    target.set_registers(regs)?;

    // The syscall number register holds the number until the kernel replaces
    // it with the result.
    loop {
        target.step()?;
        regs = target.registers()?;
        if verbose {
            log::trace!("Stepped: {regs:x?}");
        }
        if T::Arch::syscall_register(&regs) != T::Arch::MMAP_SYSCALL {
            return Ok(regs);
        }
    }
}
