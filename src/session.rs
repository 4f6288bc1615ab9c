use crate::{
    elf::ElfHeaders, linkmap::ModuleNode, symbols::Function, Arch, Error, ErrorCode, Result,
    Target,
};
use bitflags::bitflags;
use object::{read::elf::FileHeader, Endian};

/// ELF class of a target's architecture.
pub type ElfOf<T> = <<T as Target>::Arch as Arch>::Elf;
pub(crate) type EndianOf<T> = <ElfOf<T> as FileHeader>::Endian;

bitflags! {
    /// Diagnostics switches of a [`Session`].
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Flags: u32 {
        /// Log every milestone of an operation.
        const DEBUG = 1;
        /// Also log per-step register dumps and per-slot GOT scans.
        const DEBUG_VERBOSE = 1 << 1;
    }
}

/// Everything known about one traced target.
///
/// The derived fields (headers, PLT/GOT, link map head, syscall address and
/// function list) are filled in lazily by the operations that compute them
/// and are never invalidated automatically: if the target's memory map
/// changes, call the relevant operation again.
#[derive(Debug)]
pub struct Session<T: Target> {
    target: Option<T>,
    base: u64,
    last_error: ErrorCode,
    flags: Flags,
    pub(crate) headers: Option<ElfHeaders<ElfOf<T>>>,
    pub(crate) pltgot: Option<u64>,
    pub(crate) link_head: Option<ModuleNode>,
    pub(crate) syscall_addr: Option<u64>,
    pub(crate) functions: Vec<Function>,
}

impl<T: Target> Session<T> {
    /// A detached session for an executable loaded at `base`.
    #[must_use]
    pub fn new(base: u64) -> Self {
        Self {
            target: None,
            base,
            last_error: ErrorCode::None,
            flags: Flags::empty(),
            headers: None,
            pltgot: None,
            link_head: None,
            syscall_addr: None,
            functions: Vec::new(),
        }
    }

    /// A session already attached to `target`.
    #[must_use]
    pub fn attached(target: T, base: u64) -> Self {
        let mut session = Self::new(base);
        session.attach(target);
        session
    }

    /// Start operating on `target`, replacing any previous one.
    ///
    /// Derived state from a previous target is dropped, since none of it is
    /// meaningful for another process.
    pub fn attach(&mut self, target: T) {
        log::debug!("Session attached to process {}", target.pid());
        self.headers = None;
        self.pltgot = None;
        self.link_head = None;
        self.syscall_addr = None;
        self.functions.clear();
        self.target = Some(target);
        self.last_error = ErrorCode::None;
    }

    /// Stop operating on the target and hand it back.
    pub fn detach(&mut self) -> Option<T> {
        let target = self.target.take();
        if let Some(target) = &target {
            log::debug!("Session detached from process {}", target.pid());
        }
        target
    }

    /// Whether a target is attached.
    #[must_use]
    pub const fn is_attached(&self) -> bool {
        self.target.is_some()
    }

    /// PID of the attached target.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.target.as_ref().map(Target::pid)
    }

    /// Address the target's executable is loaded at.
    #[must_use]
    pub const fn base(&self) -> u64 {
        self.base
    }

    /// Change the executable's load address; takes effect on the next
    /// [`Session::init_elf_headers`].
    pub fn set_base(&mut self, base: u64) {
        self.base = base;
    }

    /// Class of the error the last operation ran into.
    #[must_use]
    pub const fn last_error(&self) -> ErrorCode {
        self.last_error
    }

    /// Turn diagnostics flags on or off.
    pub fn set_flag(&mut self, flag: Flags, on: bool) {
        self.flags.set(flag, on);
    }

    /// Flip diagnostics flags.
    pub fn toggle_flag(&mut self, flag: Flags) {
        self.flags.toggle(flag);
    }

    /// Whether all of `flag` is set.
    #[must_use]
    pub const fn is_flag_set(&self, flag: Flags) -> bool {
        self.flags.contains(flag)
    }

    /// Cached ELF headers of the executable.
    #[must_use]
    pub const fn headers(&self) -> Option<&ElfHeaders<ElfOf<T>>> {
        self.headers.as_ref()
    }

    /// Cached PLT/GOT address of the executable.
    #[must_use]
    pub const fn pltgot(&self) -> Option<u64> {
        self.pltgot
    }

    /// Cached first entry of the dynamic linker's module list.
    #[must_use]
    pub const fn link_head(&self) -> Option<&ModuleNode> {
        self.link_head.as_ref()
    }

    /// Cached address of a syscall instruction in the target.
    #[must_use]
    pub const fn syscall_addr(&self) -> Option<u64> {
        self.syscall_addr
    }

    /// Use a known syscall instruction instead of searching for one.
    pub fn set_syscall_addr(&mut self, addr: u64) {
        self.syscall_addr = Some(addr);
    }

    /// Functions cached by [`Session::locate_all_functions`].
    #[must_use]
    pub fn cached_functions(&self) -> &[Function] {
        &self.functions
    }

    /// Mutable access to the attached target.
    pub fn target_mut(&mut self) -> Result<&mut T> {
        self.target.as_mut().ok_or(Error::NotAttached)
    }

    /// Mirror the outcome of an operation into [`Session::last_error`].
    pub(crate) fn record<V>(&mut self, result: Result<V>) -> Result<V> {
        self.last_error = match &result {
            Ok(_) => ErrorCode::None,
            Err(e) => e.code(),
        };
        result
    }

    /// Mirror an error that was handled rather than returned.
    pub(crate) fn note(&mut self, error: &Error) {
        self.last_error = error.code();
    }

    pub(crate) fn endian() -> EndianOf<T> {
        <EndianOf<T> as Default>::default()
    }

    pub(crate) const fn word_size() -> usize {
        <T::Arch as Arch>::WORD_SIZE
    }

    /// Read one pointer-sized value.
    pub(crate) fn read_word(&mut self, addr: u64) -> Result<u64> {
        let bytes = self.target_mut()?.read_memory(addr, Self::word_size())?;
        decode_word(Self::endian(), &bytes).ok_or(Error::Memory {
            addr,
            len: Self::word_size(),
        })
    }

    /// Read one 32-bit value.
    pub(crate) fn read_u32(&mut self, addr: u64) -> Result<u32> {
        let bytes = self.target_mut()?.read_memory(addr, 4)?;
        let bytes: [u8; 4] = bytes
            .try_into()
            .map_err(|_| Error::Memory { addr, len: 4 })?;
        Ok(Self::endian().read_u32_bytes(bytes))
    }

    /// Write one pointer-sized value.
    pub(crate) fn write_word(&mut self, addr: u64, value: u64) -> Result<()> {
        let bytes = encode_word(Self::endian(), value, Self::word_size());
        self.target_mut()?.write_memory(addr, &bytes)
    }
}

/// `addr + offset` for addresses computed from target data, which may be
/// corrupt. Overflow means the structure named by `what` can't be where the
/// target says it is.
pub(crate) fn offset_addr(addr: u64, offset: u64, what: &'static str) -> Result<u64> {
    addr.checked_add(offset).ok_or_else(|| {
        log::debug!("{what} at {addr:x} + {offset:x} is outside the address space");
        Error::Missing(what)
    })
}

/// Decode a 4- or 8-byte word.
pub(crate) fn decode_word<E: Endian>(endian: E, bytes: &[u8]) -> Option<u64> {
    match bytes.len() {
        4 => Some(u64::from(endian.read_u32_bytes(bytes.try_into().ok()?))),
        8 => Some(endian.read_u64_bytes(bytes.try_into().ok()?)),
        _ => None,
    }
}

/// Encode a word of `size` bytes, truncating `value` if needed.
pub(crate) fn encode_word<E: Endian>(endian: E, value: u64, size: usize) -> Vec<u8> {
    if size == 4 {
        endian.write_u32_bytes(value as u32).to_vec()
    } else {
        endian.write_u64_bytes(value).to_vec()
    }
}
