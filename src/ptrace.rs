//! A [`Target`] backed by a real ptrace attachment.
use crate::{Error, Process, Registers64, Result, Target, X86_64};
use pete::{Ptracer, Restart, Tracee};
use std::process::Command;

/// A process stopped under ptrace.
///
/// The process stays stopped while this exists, except for the single
/// instructions run by [`Target::step`]. Use [`PtraceTarget::resume`] to let
/// it go; dropping the target detaches from it, killing a spawned child.
pub struct PtraceTarget {
    process: Process,
    tracer: Ptracer,
    tracee: Tracee,
}

impl std::fmt::Debug for PtraceTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtraceTarget")
            .field("process", &self.process)
            .field("stop", &self.tracee.stop)
            .finish_non_exhaustive()
    }
}

impl PtraceTarget {
    /// Attach to an existing process and wait for it to stop.
    pub fn attach(process: Process) -> Result<Self> {
        let mut tracer = Ptracer::new();
        tracer.attach((&process).into())?;
        log::trace!("Attached to process with PID {}", process);
        Self::first_stop(process, tracer)
    }

    /// Spawn a new process traced from its first instruction.
    pub fn spawn(command: Command) -> Result<Self> {
        let mut tracer = Ptracer::new();
        let child = tracer.spawn(command)?;
        let process = Process::get(child.id())?;
        log::info!("Spawned process with PID {}", process);
        Self::first_stop(process, tracer)
    }

    fn first_stop(process: Process, mut tracer: Ptracer) -> Result<Self> {
        let Some(tracee) = tracer.wait()? else {
            log::debug!("Process {process} exited as soon as we started tracing it");
            return Err(Error::TargetExited);
        };
        log::debug!("Process {process} stopped with {:?}", tracee.stop);
        Ok(Self {
            process,
            tracer,
            tracee,
        })
    }

    /// The traced process.
    #[must_use]
    pub const fn process(&self) -> &Process {
        &self.process
    }

    /// Let the process continue running where it is stopped, with whatever
    /// registers it now has.
    pub fn resume(mut self) -> Result<()> {
        log::debug!("Resuming process {}", self.process);
        self.tracer.restart(self.tracee, Restart::Continue)?;
        Ok(())
    }
}

impl From<pete::Registers> for Registers64 {
    fn from(r: pete::Registers) -> Self {
        Self {
            r15: r.r15,
            r14: r.r14,
            r13: r.r13,
            r12: r.r12,
            rbp: r.rbp,
            rbx: r.rbx,
            r11: r.r11,
            r10: r.r10,
            r9: r.r9,
            r8: r.r8,
            rax: r.rax,
            rcx: r.rcx,
            rdx: r.rdx,
            rsi: r.rsi,
            rdi: r.rdi,
            orig_rax: r.orig_rax,
            rip: r.rip,
            cs: r.cs,
            eflags: r.eflags,
            rsp: r.rsp,
            ss: r.ss,
            fs_base: r.fs_base,
            gs_base: r.gs_base,
            ds: r.ds,
            es: r.es,
            fs: r.fs,
            gs: r.gs,
        }
    }
}

impl From<Registers64> for pete::Registers {
    fn from(r: Registers64) -> Self {
        Self {
            r15: r.r15,
            r14: r.r14,
            r13: r.r13,
            r12: r.r12,
            rbp: r.rbp,
            rbx: r.rbx,
            r11: r.r11,
            r10: r.r10,
            r9: r.r9,
            r8: r.r8,
            rax: r.rax,
            rcx: r.rcx,
            rdx: r.rdx,
            rsi: r.rsi,
            rdi: r.rdi,
            orig_rax: r.orig_rax,
            rip: r.rip,
            cs: r.cs,
            eflags: r.eflags,
            rsp: r.rsp,
            ss: r.ss,
            fs_base: r.fs_base,
            gs_base: r.gs_base,
            ds: r.ds,
            es: r.es,
            fs: r.fs,
            gs: r.gs,
        }
    }
}

impl Target for PtraceTarget {
    type Arch = X86_64;

    fn pid(&self) -> u32 {
        self.process.pid()
    }

    fn read_memory(&mut self, addr: u64, len: usize) -> Result<Vec<u8>> {
        let bytes = self.tracee.read_memory(addr, len)?;
        if bytes.len() != len {
            log::trace!("Short read at {addr:x}: {} of {len} bytes", bytes.len());
            return Err(Error::Memory { addr, len });
        }
        Ok(bytes)
    }

    fn write_memory(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        let written = self.tracee.write_memory(addr, data)?;
        if written != data.len() {
            log::trace!("Short write at {addr:x}: {written} of {} bytes", data.len());
            return Err(Error::Memory {
                addr,
                len: data.len(),
            });
        }
        Ok(())
    }

    fn registers(&mut self) -> Result<Registers64> {
        Ok(self.tracee.registers()?.into())
    }

    fn set_registers(&mut self, regs: Registers64) -> Result<()> {
        self.tracee.set_registers(regs.into())?;
        Ok(())
    }

    fn step(&mut self) -> Result<()> {
        self.tracer.restart(self.tracee, Restart::Step)?;
        let Some(tracee) = self.tracer.wait()? else {
            log::debug!("Process {} exited while single-stepping", self.process);
            return Err(Error::TargetExited);
        };
        self.tracee = tracee;
        Ok(())
    }

    fn mapped_end(&mut self, addr: u64) -> Option<u64> {
        self.process.mapping_end(addr).unwrap_or_else(|e| {
            log::debug!("Couldn't read memory maps of process {}: {e}", self.process);
            None
        })
    }
}
