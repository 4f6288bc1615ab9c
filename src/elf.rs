//! Reading the executable's headers and dynamic section out of the target.
use crate::{
    session::{offset_addr, ElfOf, Flags},
    Error, Result, Session, Target,
};
use object::{
    elf,
    pod,
    read::elf::{Dyn, FileHeader, ProgramHeader},
};
use std::mem::size_of;

/// Most dynamic entries a walk will read before deciding the terminator is
/// missing.
pub const MAX_DYNAMIC_ENTRIES: usize = 4096;

type Phdr<T> = <ElfOf<T> as FileHeader>::ProgramHeader;
type Shdr<T> = <ElfOf<T> as FileHeader>::SectionHeader;
type DynEntry<T> = <ElfOf<T> as FileHeader>::Dyn;

/// The ELF identification header and the program and section header tables of
/// the target's executable, as found in its memory.
#[derive(Debug, Clone)]
pub struct ElfHeaders<H: FileHeader> {
    header: H,
    program_headers: Vec<H::ProgramHeader>,
    section_headers: Vec<H::SectionHeader>,
}

impl<H: FileHeader> ElfHeaders<H> {
    /// The identification header.
    pub const fn header(&self) -> &H {
        &self.header
    }

    /// The program header table.
    pub fn program_headers(&self) -> &[H::ProgramHeader] {
        &self.program_headers
    }

    /// The section header table. Empty when the table is not part of the
    /// loaded image.
    pub fn section_headers(&self) -> &[H::SectionHeader] {
        &self.section_headers
    }

    /// Whether the executable is position independent, i.e. its addresses are
    /// relative to the load base.
    pub fn is_position_independent(&self) -> bool {
        self.header.e_type(H::Endian::default()) == elf::ET_DYN
    }

    /// The `PT_DYNAMIC` program header, if any.
    pub fn dynamic_segment(&self) -> Option<&H::ProgramHeader> {
        let endian = H::Endian::default();
        self.program_headers
            .iter()
            .find(|ph| ph.p_type(endian) == elf::PT_DYNAMIC)
    }
}

/// Decode and sanity check an identification header.
fn parse_header<H: FileHeader>(bytes: &[u8]) -> Result<H> {
    let (header, _) = pod::from_bytes::<H>(bytes).map_err(|()| Error::Missing("ELF header"))?;
    let ident = header.e_ident();
    let class = if H::is_type_64_sized() {
        elf::ELFCLASS64
    } else {
        elf::ELFCLASS32
    };
    if ident.magic != elf::ELFMAG || ident.class != class {
        log::debug!("Bad ELF identification: {ident:x?}");
        return Err(Error::Missing("ELF header"));
    }
    Ok(*header)
}

/// Check that a table's entry size is the one this ELF class uses, and return
/// the table's size in bytes.
fn table_size<Entry>(entsize: u16, count: u16, what: &'static str) -> Result<usize> {
    if usize::from(entsize) != size_of::<Entry>() {
        log::debug!(
            "{what} entry size is {entsize}, expected {}",
            size_of::<Entry>()
        );
        return Err(Error::Missing(what));
    }
    Ok(usize::from(entsize) * usize::from(count))
}

/// Tags and values of a dynamic section, up to but excluding `DT_NULL`.
pub(crate) fn dynamic_entries<H: FileHeader>(bytes: &[u8]) -> Result<Vec<(u64, u64)>> {
    let endian = H::Endian::default();
    let count = bytes.len() / size_of::<H::Dyn>();
    let (entries, _) = pod::slice_from_bytes::<H::Dyn>(bytes, count)
        .map_err(|()| Error::Missing("dynamic section"))?;
    let mut out = Vec::new();
    for entry in entries.iter().take(MAX_DYNAMIC_ENTRIES) {
        let tag: u64 = entry.d_tag(endian).into();
        if tag == u64::from(elf::DT_NULL) {
            return Ok(out);
        }
        out.push((tag, entry.d_val(endian).into()));
    }
    Err(Error::Missing("DT_NULL"))
}

/// The dynamic linker rewrites some pointers in a module's dynamic section to
/// absolute addresses, but not on every platform and not in every version.
/// Pointers below the bias are still relative.
pub(crate) const fn relocate(ptr: u64, bias: u64) -> u64 {
    if bias != 0 && ptr < bias {
        ptr.wrapping_add(bias)
    } else {
        ptr
    }
}

impl<T: Target> Session<T> {
    /// Read the executable's identification header, program header table and
    /// section header table from the session's base address.
    ///
    /// The section header table is rarely part of a loaded segment; when the
    /// target can tell that it lies beyond the image's mapping, it is left
    /// empty rather than failing.
    pub fn init_elf_headers(&mut self) -> Result<&ElfHeaders<ElfOf<T>>> {
        let result = self.read_elf_headers();
        let headers = self.record(result)?;
        Ok(self.headers.insert(headers))
    }

    fn read_elf_headers(&mut self) -> Result<ElfHeaders<ElfOf<T>>> {
        let endian = Self::endian();
        let base = self.base();
        log::debug!("Reading ELF headers at {base:x}");
        let target = self.target_mut()?;

        let bytes = target.read_memory(base, size_of::<ElfOf<T>>())?;
        let header: ElfOf<T> = parse_header(&bytes)?;

        let phoff: u64 = header.e_phoff(endian).into();
        let phnum = header.e_phnum(endian);
        if phoff == 0 || phnum == 0 {
            return Err(Error::Missing("program header table"));
        }
        let phsize = table_size::<Phdr<T>>(
            header.e_phentsize(endian),
            phnum,
            "program header table",
        )?;
        let phaddr = offset_addr(base, phoff, "program header table")?;
        let bytes = target.read_memory(phaddr, phsize)?;
        let (program_headers, _) = pod::slice_from_bytes::<Phdr<T>>(&bytes, usize::from(phnum))
            .map_err(|()| Error::Missing("program header table"))?;
        let program_headers = program_headers.to_vec();
        log::trace!("Read {phnum} program headers at {phaddr:x}");

        let shoff: u64 = header.e_shoff(endian).into();
        let shnum = header.e_shnum(endian);
        let section_headers = if shoff == 0 || shnum == 0 {
            Vec::new()
        } else {
            let shsize = table_size::<Shdr<T>>(
                header.e_shentsize(endian),
                shnum,
                "section header table",
            )?;
            let start = offset_addr(base, shoff, "section header table")?;
            let end_of_table = offset_addr(start, shsize as u64, "section header table")?;
            match target.mapped_end(base) {
                Some(end) if end_of_table > end => {
                    log::debug!("Section headers at {start:x} are outside the loaded image");
                    Vec::new()
                }
                _ => {
                    let bytes = target.read_memory(start, shsize)?;
                    let (section_headers, _) =
                        pod::slice_from_bytes::<Shdr<T>>(&bytes, usize::from(shnum))
                            .map_err(|()| Error::Missing("section header table"))?;
                    log::trace!("Read {shnum} section headers at {start:x}");
                    section_headers.to_vec()
                }
            }
        };

        Ok(ElfHeaders {
            header,
            program_headers,
            section_headers,
        })
    }

    /// Read the executable's dynamic section, as `(tag, value)` pairs.
    fn executable_dynamic(&mut self) -> Result<Vec<(u64, u64)>> {
        let endian = Self::endian();
        let headers = self
            .headers
            .as_ref()
            .ok_or(Error::Missing("ELF headers"))?;
        let Some(segment) = headers.dynamic_segment() else {
            log::debug!("Could not locate the PT_DYNAMIC program header");
            return Err(Error::Missing("PT_DYNAMIC"));
        };
        let bias = if headers.is_position_independent() {
            self.base()
        } else {
            0
        };
        let vaddr: u64 = segment.p_vaddr(endian).into();
        let memsz: u64 = segment.p_memsz(endian).into();
        let addr = offset_addr(vaddr, bias, "dynamic section")?;
        // Nothing past the walk's bound is ever looked at.
        let len = memsz.min((MAX_DYNAMIC_ENTRIES * size_of::<DynEntry<T>>()) as u64);
        let bytes = self.target_mut()?.read_memory(addr, len as usize)?;
        dynamic_entries::<ElfOf<T>>(&bytes)
    }

    /// The load bias of the executable: the base address if it is position
    /// independent, zero otherwise.
    fn executable_bias(&self) -> u64 {
        match &self.headers {
            Some(headers) if headers.is_position_independent() => self.base(),
            _ => 0,
        }
    }

    /// Find the executable's PLT/GOT through the `DT_PLTGOT` entry of its
    /// dynamic section.
    ///
    /// Reads the ELF headers first if they have not been read yet.
    pub fn find_pltgot(&mut self) -> Result<u64> {
        log::debug!("Attempting to find PLT/GOT");
        let result = self.locate_pltgot();
        self.record(result)
    }

    fn locate_pltgot(&mut self) -> Result<u64> {
        if self.headers.is_none() {
            let headers = self.read_elf_headers()?;
            self.headers = Some(headers);
        }
        let bias = self.executable_bias();
        let pltgot = self
            .executable_dynamic()?
            .into_iter()
            .find(|&(tag, _)| tag == u64::from(elf::DT_PLTGOT))
            .map(|(_, ptr)| relocate(ptr, bias));
        match pltgot {
            Some(pltgot) => {
                log::debug!("Found PLT/GOT at {pltgot:x}");
                Ok(pltgot)
            }
            None => {
                log::debug!("Could not locate PLT/GOT");
                Err(Error::Missing("DT_PLTGOT"))
            }
        }
    }

    /// Find the address of the dynamic linker's first module entry.
    ///
    /// The dynamic linker keeps it in the GOT slot right after the one
    /// pointing at `_DYNAMIC`. Under eager binding that slot stays zero, in
    /// which case the rendezvous structure named by `DT_DEBUG` is used.
    pub fn find_link_map_addr(&mut self) -> Result<u64> {
        let result = self.locate_link_map();
        self.record(result)
    }

    fn locate_link_map(&mut self) -> Result<u64> {
        let pltgot = match self.pltgot {
            Some(pltgot) => pltgot,
            None => self.locate_pltgot()?,
        };
        let word = Self::word_size() as u64;
        let addr = self.read_word(offset_addr(pltgot, word, "link map")?)?;
        if addr != 0 {
            log::debug!("Link map at {addr:x} (from GOT)");
            return Ok(addr);
        }
        log::debug!("GOT has no link map, falling back to DT_DEBUG");
        let r_debug = self
            .executable_dynamic()?
            .into_iter()
            .find(|&(tag, _)| tag == u64::from(elf::DT_DEBUG))
            .map(|(_, ptr)| ptr)
            .filter(|&ptr| ptr != 0)
            .ok_or(Error::Missing("DT_DEBUG"))?;
        // `struct r_debug` starts with an int, padded to pointer alignment,
        // followed by `r_map`.
        let addr = self.read_word(offset_addr(r_debug, word, "link map")?)?;
        if addr == 0 {
            return Err(Error::Missing("link map"));
        }
        log::debug!("Link map at {addr:x} (from r_debug at {r_debug:x})");
        Ok(addr)
    }

    /// Establish the baseline state every other operation builds on: ELF
    /// headers, PLT/GOT address and the head of the module list.
    ///
    /// Stops at the first failure; anything resolved before it stays cached in
    /// the session.
    pub fn init_system(&mut self) -> Result<()> {
        let result = self.bootstrap();
        self.record(result)
    }

    fn bootstrap(&mut self) -> Result<()> {
        if !self.is_attached() {
            return Err(Error::NotAttached);
        }
        let headers = self.read_elf_headers()?;
        if self.is_flag_set(Flags::DEBUG) {
            let endian = Self::endian();
            for ph in headers.program_headers() {
                let vaddr: u64 = ph.p_vaddr(endian).into();
                let memsz: u64 = ph.p_memsz(endian).into();
                log::debug!(
                    "Program header {:#x}: vaddr {vaddr:x} memsz {memsz:x}",
                    ph.p_type(endian)
                );
            }
        }
        self.headers = Some(headers);
        let pltgot = self.locate_pltgot()?;
        self.pltgot = Some(pltgot);
        let addr = self.locate_link_map()?;
        let head = self.read_module(addr)?.ok_or(Error::Missing("link map"))?;
        log::info!(
            "Initialised session for process {}: PLT/GOT at {pltgot:x}, link map at {addr:x}",
            self.pid().unwrap_or_default()
        );
        self.link_head = Some(head);
        Ok(())
    }
}
