use crate::{Arch, Error, Result};

/// Longest string [`Target::read_string`] will read before giving up on
/// finding a terminator.
pub const MAX_STRING_LEN: usize = 4096;

const PAGE_SIZE: u64 = 0x1000;
const STRING_CHUNK: u64 = 128;

/// Register file of a target's architecture.
pub type RegistersOf<T> = <<T as Target>::Arch as Arch>::Registers;

/// A stopped process whose memory and registers can be manipulated.
///
/// This is the contract the introspection and execution engines need from
/// whatever holds the trace attachment. Every method operates on a target
/// that is stopped; only [`Target::step`] lets it run, and only for a single
/// instruction.
pub trait Target {
    /// Instruction set and ELF class of the target.
    type Arch: Arch;

    /// Process ID of the target.
    fn pid(&self) -> u32;

    /// Read exactly `len` bytes at `addr`.
    fn read_memory(&mut self, addr: u64, len: usize) -> Result<Vec<u8>>;

    /// Write all of `data` at `addr`.
    fn write_memory(&mut self, addr: u64, data: &[u8]) -> Result<()>;

    /// Read the general purpose registers.
    fn registers(&mut self) -> Result<RegistersOf<Self>>;

    /// Overwrite the general purpose registers.
    fn set_registers(&mut self, regs: RegistersOf<Self>) -> Result<()>;

    /// Execute a single instruction and wait until the target stops again.
    fn step(&mut self) -> Result<()>;

    /// End of the mapping that contains `addr`, if the backend knows it.
    fn mapped_end(&mut self, _addr: u64) -> Option<u64> {
        None
    }

    /// Read a NUL-terminated string at `addr`.
    ///
    /// Reads never cross a page boundary in one go, and a chunk that can't
    /// be read is retried in halves down to a single byte, so a string that
    /// ends just before unreadable memory can still be read.
    fn read_string(&mut self, addr: u64) -> Result<String> {
        let mut bytes = Vec::new();
        let mut cursor = addr;
        while bytes.len() < MAX_STRING_LEN {
            let page_left = PAGE_SIZE - cursor % PAGE_SIZE;
            let mut want = STRING_CHUNK.min(page_left) as usize;
            let chunk = loop {
                match self.read_memory(cursor, want) {
                    Ok(chunk) => break chunk,
                    Err(e) if want == 1 => return Err(e),
                    Err(_) => want /= 2,
                }
            };
            if let Some(nul) = chunk.iter().position(|&b| b == 0) {
                bytes.extend_from_slice(&chunk[..nul]);
                return Ok(String::from_utf8_lossy(&bytes).into_owned());
            }
            cursor += chunk.len() as u64;
            bytes.extend(chunk);
        }
        log::debug!("String at {addr:x} has no terminator within {MAX_STRING_LEN} bytes");
        Err(Error::Missing("string terminator"))
    }
}
