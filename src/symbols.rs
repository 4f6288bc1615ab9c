//! Enumerating the functions each loaded module exports, and locating things
//! in them.
use crate::{
    elf::{relocate, MAX_DYNAMIC_ENTRIES},
    linkmap::ModuleNode,
    session::{offset_addr, ElfOf, Flags},
    Arch, Error, Result, Session, Target,
};
use object::{
    elf, pod,
    read::elf::{Dyn, FileHeader, Sym},
};
use std::{mem::size_of, ops::ControlFlow};

/// Most GOT slots a scan will look at.
pub const MAX_GOT_SLOTS: usize = 0x10000;

/// GOT slots reserved for the dynamic linker: `_DYNAMIC`, the module entry
/// and the lazy resolver. They may legitimately be zero.
const RESERVED_GOT_SLOTS: usize = 3;

/// Upper bound on a symbol count derived from a hash table.
const MAX_SYMBOLS: u32 = 1 << 20;

type DynOf<T> = <ElfOf<T> as FileHeader>::Dyn;
type SymOf<T> = <ElfOf<T> as FileHeader>::Sym;

/// One function found in a module's dynamic symbol table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Function {
    /// Symbol name.
    pub name: String,
    /// Run-time address: the module's load bias plus the symbol value.
    pub address: u64,
    /// Size of the function's code in bytes.
    pub size: u64,
    /// Name of the module defining the function.
    pub module: String,
}

/// A module together with the PLT/GOT its dynamic section points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plt {
    /// Name of the module; empty for the main executable.
    pub module: String,
    /// Address of the module's PLT/GOT.
    pub address: u64,
}

/// The parts of a module's dynamic section that symbol lookup needs, with
/// pointers already relocated by the module's load bias.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DynamicInfo {
    /// `DT_STRTAB`
    pub strtab: Option<u64>,
    /// `DT_SYMTAB`
    pub symtab: Option<u64>,
    /// `DT_HASH`
    pub hash: Option<u64>,
    /// `DT_GNU_HASH`
    pub gnu_hash: Option<u64>,
    /// `DT_PLTGOT`
    pub pltgot: Option<u64>,
}

impl<T: Target> Session<T> {
    /// Read a module's dynamic section one entry at a time, up to `DT_NULL`.
    pub fn module_dynamic(&mut self, module: &ModuleNode) -> Result<DynamicInfo> {
        let result = self.read_module_dynamic(module);
        self.record(result)
    }

    fn read_module_dynamic(&mut self, module: &ModuleNode) -> Result<DynamicInfo> {
        let endian = Self::endian();
        let entry_size = size_of::<DynOf<T>>();
        let bias = module.load_bias;
        let mut info = DynamicInfo::default();
        for index in 0..MAX_DYNAMIC_ENTRIES {
            let addr = offset_addr(module.dynamic, (index * entry_size) as u64, "dynamic section")?;
            let bytes = self.target_mut()?.read_memory(addr, entry_size)?;
            let (entry, _) = pod::from_bytes::<DynOf<T>>(&bytes)
                .map_err(|()| Error::Memory { addr, len: entry_size })?;
            let tag: u64 = entry.d_tag(endian).into();
            let value = relocate(entry.d_val(endian).into(), bias);
            match u32::try_from(tag) {
                Ok(elf::DT_NULL) => return Ok(info),
                Ok(elf::DT_STRTAB) => info.strtab = Some(value),
                Ok(elf::DT_SYMTAB) => info.symtab = Some(value),
                Ok(elf::DT_HASH) => info.hash = Some(value),
                Ok(elf::DT_GNU_HASH) => info.gnu_hash = Some(value),
                Ok(elf::DT_PLTGOT) => info.pltgot = Some(value),
                _ => {}
            }
        }
        log::debug!(
            "Dynamic section of {:?} has no DT_NULL within {MAX_DYNAMIC_ENTRIES} entries",
            module.name
        );
        Err(Error::Missing("DT_NULL"))
    }

    /// Number of entries in the symbol table, from `DT_HASH`'s `nchain`.
    fn symbol_count(&mut self, info: &DynamicInfo) -> Result<u32> {
        if let Some(hash) = info.hash {
            return self.read_u32(offset_addr(hash, 4, "hash table")?);
        }
        match info.gnu_hash {
            Some(gnu_hash) => self.gnu_hash_symbol_count(gnu_hash),
            None => Err(Error::Missing("hash table")),
        }
    }

    /// A GNU hash table has no symbol count; it is one past the highest
    /// symbol index reachable through the buckets and chains.
    fn gnu_hash_symbol_count(&mut self, table: u64) -> Result<u32> {
        let nbuckets = self.read_u32(table)?;
        let symoffset = self.read_u32(offset_addr(table, 4, "GNU hash table")?)?;
        let bloom_size = self.read_u32(offset_addr(table, 8, "GNU hash table")?)?;
        if nbuckets == 0 || nbuckets > MAX_SYMBOLS || bloom_size > MAX_SYMBOLS {
            return Err(Error::Missing("GNU hash buckets"));
        }
        let bloom_len = 16 + u64::from(bloom_size) * Self::word_size() as u64;
        let buckets = offset_addr(table, bloom_len, "GNU hash buckets")?;
        let chains = offset_addr(buckets, u64::from(nbuckets) * 4, "GNU hash chains")?;
        let bytes = self
            .target_mut()?
            .read_memory(buckets, nbuckets as usize * 4)?;
        let endian = Self::endian();
        let last = bytes
            .chunks_exact(4)
            .filter_map(|b| b.try_into().ok())
            .map(|b| object::Endian::read_u32_bytes(endian, b))
            .max()
            .unwrap_or_default();
        if last < symoffset {
            return Ok(symoffset);
        }
        let mut index = last;
        while index < MAX_SYMBOLS {
            let link = offset_addr(chains, u64::from(index - symoffset) * 4, "GNU hash chains")?;
            let hash = self.read_u32(link)?;
            index += 1;
            if hash & 1 == 1 {
                return Ok(index);
            }
        }
        Err(Error::Missing("end of GNU hash chain"))
    }

    /// Call `callback` for every function in `module`'s dynamic symbol table,
    /// in table order, with the function's name, run-time address and size.
    ///
    /// The walk over this module ends early when the callback breaks; the
    /// returned `ControlFlow` says whether it did. Modules without a name
    /// (the main executable) or without string, symbol or hash tables cannot
    /// be enumerated.
    pub fn walk_functions<F>(&mut self, module: &ModuleNode, callback: F) -> Result<ControlFlow<()>>
    where
        F: FnMut(&mut Self, &ModuleNode, &str, u64, u64) -> ControlFlow<()>,
    {
        let result = self.enumerate_functions(module, callback);
        self.record(result)
    }

    fn enumerate_functions<F>(&mut self, module: &ModuleNode, mut callback: F) -> Result<ControlFlow<()>>
    where
        F: FnMut(&mut Self, &ModuleNode, &str, u64, u64) -> ControlFlow<()>,
    {
        if module.name.is_empty() {
            return Err(Error::Missing("module name"));
        }
        let info = self.read_module_dynamic(module)?;
        let (Some(strtab), Some(symtab)) = (info.strtab, info.symtab) else {
            log::debug!("{} lacks a string or symbol table", module.name);
            return Err(Error::Missing("symbol tables"));
        };
        let mut count = u64::from(self.symbol_count(&info)?);
        let sym_size = size_of::<SymOf<T>>() as u64;
        if let Some(end) = self.target_mut()?.mapped_end(symtab) {
            let fits = end.saturating_sub(symtab) / sym_size;
            if fits < count {
                log::warn!(
                    "{} claims {count} symbols but only {fits} fit in its mapping",
                    module.name
                );
                count = fits;
            }
        }
        log::debug!("Enumerating {count} symbols of {}", module.name);

        let endian = Self::endian();
        let debug = self.is_flag_set(Flags::DEBUG);
        // Index 0 is the reserved undefined symbol.
        for index in 1..count {
            let addr = offset_addr(symtab, index * sym_size, "symbol table")?;
            let bytes = self.target_mut()?.read_memory(addr, sym_size as usize)?;
            let (sym, _) = pod::from_bytes::<SymOf<T>>(&bytes).map_err(|()| Error::Memory {
                addr,
                len: sym_size as usize,
            })?;
            if sym.st_type() != elf::STT_FUNC {
                continue;
            }
            let name = match offset_addr(strtab, u64::from(sym.st_name(endian)), "string table")
                .and_then(|name_addr| self.target_mut()?.read_string(name_addr))
            {
                Ok(name) => name,
                Err(e) => {
                    log::trace!("Skipping symbol {index}, unreadable name: {e}");
                    continue;
                }
            };
            let value: u64 = sym.st_value(endian).into();
            let size: u64 = sym.st_size(endian).into();
            let address = module.load_bias.wrapping_add(value);
            if debug {
                log::debug!("{name} at {address:x}, {size} bytes");
            }
            if callback(self, module, &name, address, size).is_break() {
                log::trace!("Callback stopped the walk at {name}");
                return Ok(ControlFlow::Break(()));
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    /// Every function in one module.
    pub fn functions(&mut self, module: &ModuleNode) -> Result<Vec<Function>> {
        let mut functions = Vec::new();
        self.walk_functions(module, |_, module, name, address, size| {
            functions.push(Function {
                name: name.to_owned(),
                address,
                size,
                module: module.name.clone(),
            });
            ControlFlow::Continue(())
        })?;
        Ok(functions)
    }

    /// Walk the module list and collect the module entries, failing on the
    /// first one that can't be read.
    fn snapshot_modules(&mut self) -> Result<Vec<ModuleNode>> {
        self.modules().collect()
    }

    /// Every function of every module, also kept in the session (see
    /// [`Session::cached_functions`]).
    ///
    /// Modules that cannot be enumerated are skipped; the last such failure
    /// is left in [`Session::last_error`].
    pub fn locate_all_functions(&mut self) -> Result<&[Function]> {
        let modules = self.snapshot_modules()?;
        let mut all = Vec::new();
        let mut skipped = None;
        for module in &modules {
            match self.functions(module) {
                Ok(functions) => all.extend(functions),
                Err(e) => {
                    log::debug!("Skipping module {:?}: {e}", module.name);
                    skipped = Some(e);
                }
            }
        }
        log::debug!("Located {} functions in {} modules", all.len(), modules.len());
        self.functions = all;
        match skipped {
            Some(e) => self.note(&e),
            None => {
                self.record(Ok(()))?;
            }
        }
        Ok(&self.functions)
    }

    /// Functions named exactly `name` in modules whose name contains
    /// `library`.
    pub fn find_function(&mut self, library: &str, name: &str) -> Result<Vec<Function>> {
        let modules = self.snapshot_modules()?;
        let mut found = Vec::new();
        for module in modules.iter().filter(|m| m.matches(library)) {
            let walked = self.walk_functions(module, |_, module, candidate, address, size| {
                if candidate == name {
                    found.push(Function {
                        name: candidate.to_owned(),
                        address,
                        size,
                        module: module.name.clone(),
                    });
                }
                ControlFlow::Continue(())
            });
            if let Err(e) = walked {
                log::debug!("Couldn't search {:?}: {e}", module.name);
            }
        }
        log::debug!("Found {} function(s) named {name} in {library}", found.len());
        Ok(found)
    }

    /// The PLT/GOT of every module that has one. The main executable's entry
    /// uses the address found by [`Session::find_pltgot`].
    pub fn plts(&mut self) -> Result<Vec<Plt>> {
        let modules = self.snapshot_modules()?;
        let mut plts = Vec::new();
        for module in modules {
            let address = if module.name.is_empty() {
                self.pltgot
            } else {
                match self.read_module_dynamic(&module) {
                    Ok(info) => info.pltgot,
                    Err(e) => {
                        log::debug!("Skipping PLT of {:?}: {e}", module.name);
                        None
                    }
                }
            };
            if let Some(address) = address {
                plts.push(Plt {
                    module: module.name,
                    address,
                });
            }
        }
        self.record(Ok(plts))
    }

    /// Find the GOT slot at or after `plt` that holds `addr`.
    ///
    /// The GOT has no recorded length, so the scan ends at the first zero
    /// slot past the reserved ones, at the end of the mapping, or after
    /// [`MAX_GOT_SLOTS`] slots, whichever comes first. A zero slot in the
    /// middle of a table therefore hides the slots after it.
    pub fn find_func_addr_in_got(&mut self, plt: u64, addr: u64) -> Result<u64> {
        let result = self.scan_got(plt, addr);
        self.record(result)
    }

    fn scan_got(&mut self, plt: u64, addr: u64) -> Result<u64> {
        let word = Self::word_size() as u64;
        let end = self.target_mut()?.mapped_end(plt);
        let verbose = self.is_flag_set(Flags::DEBUG_VERBOSE);
        for index in 0..MAX_GOT_SLOTS {
            let Some(slot) = plt.checked_add(index as u64 * word) else {
                break;
            };
            if end.is_some_and(|end| slot.saturating_add(word) > end) {
                break;
            }
            let value = self.read_word(slot)?;
            if verbose {
                log::trace!("got[{index}]: {value:#x}");
            }
            if value == addr {
                return Ok(slot);
            }
            if value == 0 && index >= RESERVED_GOT_SLOTS {
                break;
            }
        }
        Err(Error::Missing("GOT slot"))
    }

    /// Absolute address of the first occurrence of `pattern` in the `len`
    /// bytes at `addr`.
    ///
    /// When the target knows where the mapping containing `addr` ends, the
    /// search stops there.
    pub fn search_mem(&mut self, addr: u64, len: usize, pattern: &[u8]) -> Result<Option<u64>> {
        let result = self.search(addr, len, pattern);
        self.record(result)
    }

    fn search(&mut self, addr: u64, len: usize, pattern: &[u8]) -> Result<Option<u64>> {
        let target = self.target_mut()?;
        let len = match target.mapped_end(addr) {
            Some(end) => len.min(usize::try_from(end - addr).unwrap_or(usize::MAX)),
            None => len,
        };
        if pattern.is_empty() || len < pattern.len() {
            return Ok(None);
        }
        let data = target.read_memory(addr, len)?;
        Ok(data
            .windows(pattern.len())
            .position(|window| window == pattern)
            .map(|offset| addr + offset as u64))
    }

    /// Find a syscall instruction inside some loaded function, for use by the
    /// remote execution engine, and remember it in the session.
    ///
    /// Returns the cached address if one was already found.
    pub fn locate_syscall(&mut self) -> Result<u64> {
        if let Some(addr) = self.syscall_addr {
            return Ok(addr);
        }
        let result = self.search_syscall();
        self.record(result)
    }

    fn search_syscall(&mut self) -> Result<u64> {
        let insn = <T::Arch as Arch>::SYSCALL_INSN;
        for module in self.snapshot_modules()? {
            let walked = self.enumerate_functions(&module, |session, _, name, address, size| {
                match session.search(address, size as usize, insn) {
                    Ok(Some(found)) => {
                        log::debug!("Found syscall instruction at {found:x} in {name}");
                        session.syscall_addr = Some(found);
                        ControlFlow::Break(())
                    }
                    Ok(None) => ControlFlow::Continue(()),
                    Err(e) => {
                        log::trace!("Couldn't read {name} at {address:x}: {e}");
                        ControlFlow::Continue(())
                    }
                }
            });
            match walked {
                Ok(ControlFlow::Break(())) => break,
                Ok(ControlFlow::Continue(())) => {}
                Err(e) => log::debug!("Skipping module {:?}: {e}", module.name),
            }
        }
        self.syscall_addr
            .ok_or(Error::Missing("syscall instruction"))
    }
}
