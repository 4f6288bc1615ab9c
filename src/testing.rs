//! An in-memory process for exercising the engines without a real tracee.
//!
//! [`FakeTarget`] holds a sparse set of memory regions and a register file.
//! Stepping it executes nothing except the architecture's syscall
//! instruction, and then only `mmap`. [`ImageBuilder`] lays out an
//! executable, a dynamic linker module list and any number of shared
//! libraries in such a target, the way the dynamic linker would.
use crate::{
    arch::{MapFlags, MmapRequest, ProtFlags},
    symbols::Function,
    target::RegistersOf,
    Arch, Error, Registers32, Result, Session, Target, X86, X86_64,
};
use nix::errno::Errno;
use object::elf;
use std::{collections::BTreeMap, marker::PhantomData};

const PAGE_SIZE: u64 = 0x1000;
const STACK_SIZE: u64 = 0x2000;
/// Stepping past this many instructions counts as the target running away.
const STEP_LIMIT: usize = 10_000;
const ENOSYS: i64 = 38;

/// Where a fake process of an architecture keeps things.
pub trait FakeArch: Arch {
    const EXE_BASE: u64;
    const LIB_BASE: u64;
    const STACK_TOP: u64;
    const MMAP_BASE: u64;
    /// Machine number for the ELF header.
    const MACHINE: u16;

    /// Read back the arguments of the `mmap` the target is about to make.
    fn decode_mmap(target: &mut FakeTarget<Self>) -> Result<MmapRequest>;
}

impl FakeArch for X86_64 {
    const EXE_BASE: u64 = 0x40_0000;
    const LIB_BASE: u64 = 0x7f00_0000_0000;
    const STACK_TOP: u64 = 0x7ffe_0001_0000;
    const MMAP_BASE: u64 = 0x7f80_0000_0000;
    const MACHINE: u16 = 62;

    fn decode_mmap(target: &mut FakeTarget<Self>) -> Result<MmapRequest> {
        let regs = target.regs;
        Ok(MmapRequest {
            addr: regs.rdi,
            len: regs.rsi,
            prot: ProtFlags::from_bits_retain(regs.rdx as u32),
            flags: MapFlags::from_bits_retain(regs.r10 as u32),
            fd: regs.r8 as i64,
            offset: regs.r9,
        })
    }
}

impl FakeArch for X86 {
    const EXE_BASE: u64 = 0x0804_8000;
    const LIB_BASE: u64 = 0xb700_0000;
    const STACK_TOP: u64 = 0xbf80_0000;
    const MMAP_BASE: u64 = 0x4000_0000;
    const MACHINE: u16 = 3;

    fn decode_mmap(target: &mut FakeTarget<Self>) -> Result<MmapRequest> {
        let Registers32 { ebx, .. } = target.regs;
        let block = target.read_memory(u64::from(ebx), 24)?;
        let word = |i: usize| {
            u32::from_le_bytes([block[i * 4], block[i * 4 + 1], block[i * 4 + 2], block[i * 4 + 3]])
        };
        Ok(MmapRequest {
            addr: u64::from(word(0)),
            len: u64::from(word(1)),
            prot: ProtFlags::from_bits_retain(word(2)),
            flags: MapFlags::from_bits_retain(word(3)),
            fd: i64::from(word(4) as i32),
            offset: u64::from(word(5)),
        })
    }
}

/// A stopped process that exists only in memory.
#[derive(Debug, Clone)]
pub struct FakeTarget<A: Arch> {
    pid: u32,
    regions: BTreeMap<u64, Vec<u8>>,
    regs: A::Registers,
    steps: usize,
    next_mmap: u64,
    mmap_errno: Option<Errno>,
    last_mmap: Option<MmapRequest>,
}

impl<A: FakeArch> FakeTarget<A> {
    /// A process with nothing mapped but its stack, stopped with its
    /// instruction pointer in the executable's code.
    pub fn new(pid: u32) -> Self {
        let mut regs = A::Registers::default();
        A::set_stack_pointer(&mut regs, A::STACK_TOP - 0x100);
        A::set_instruction_pointer(&mut regs, A::EXE_BASE + CODE);
        let mut target = Self {
            pid,
            regions: BTreeMap::new(),
            regs,
            steps: 0,
            next_mmap: A::MMAP_BASE,
            mmap_errno: None,
            last_mmap: None,
        };
        target.map(A::STACK_TOP - STACK_SIZE, vec![0xaa; STACK_SIZE as usize]);
        target
    }

    /// Add a region of memory, replacing any region starting at the same
    /// address.
    pub fn map(&mut self, addr: u64, bytes: Vec<u8>) {
        self.regions.insert(addr, bytes);
    }

    /// Instructions executed so far.
    pub const fn steps(&self) -> usize {
        self.steps
    }

    /// Make every following `mmap` fail with `errno`.
    pub fn fail_mmap(&mut self, errno: Errno) {
        self.mmap_errno = Some(errno);
    }

    /// Arguments of the most recent `mmap`.
    pub const fn last_mmap(&self) -> Option<MmapRequest> {
        self.last_mmap
    }

    /// Start of the region holding `len` bytes at `addr`.
    fn region_start(&self, addr: u64, len: usize) -> Option<u64> {
        let (&start, bytes) = self.regions.range(..=addr).next_back()?;
        let offset = usize::try_from(addr - start).ok()?;
        (offset.checked_add(len)? <= bytes.len()).then_some(start)
    }

    fn mmap(&mut self, request: MmapRequest) -> i64 {
        self.last_mmap = Some(request);
        if let Some(errno) = self.mmap_errno {
            return -(errno as i64);
        }
        let len = request.len.div_ceil(PAGE_SIZE) * PAGE_SIZE;
        let addr = if request.flags.contains(MapFlags::MAP_FIXED) {
            request.addr
        } else {
            let addr = self.next_mmap;
            self.next_mmap += len + PAGE_SIZE;
            addr
        };
        self.map(addr, vec![0; len as usize]);
        addr as i64
    }
}

impl<A: FakeArch> Target for FakeTarget<A> {
    type Arch = A;

    fn pid(&self) -> u32 {
        self.pid
    }

    fn read_memory(&mut self, addr: u64, len: usize) -> Result<Vec<u8>> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let start = self
            .region_start(addr, len)
            .ok_or(Error::Memory { addr, len })?;
        let offset = (addr - start) as usize;
        Ok(self.regions[&start][offset..offset + len].to_vec())
    }

    fn write_memory(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        let len = data.len();
        if len == 0 {
            return Ok(());
        }
        let start = self
            .region_start(addr, len)
            .ok_or(Error::Memory { addr, len })?;
        let offset = (addr - start) as usize;
        if let Some(region) = self.regions.get_mut(&start) {
            region[offset..offset + len].copy_from_slice(data);
        }
        Ok(())
    }

    fn registers(&mut self) -> Result<RegistersOf<Self>> {
        Ok(self.regs)
    }

    fn set_registers(&mut self, regs: RegistersOf<Self>) -> Result<()> {
        self.regs = regs;
        Ok(())
    }

    fn step(&mut self) -> Result<()> {
        self.steps += 1;
        if self.steps > STEP_LIMIT {
            return Err(Error::TargetExited);
        }
        let ip = A::instruction_pointer(&self.regs);
        let insn = A::SYSCALL_INSN;
        let at_syscall = self
            .read_memory(ip, insn.len())
            .is_ok_and(|bytes| bytes == insn);
        if !at_syscall {
            A::set_instruction_pointer(&mut self.regs, ip + 1);
            return Ok(());
        }
        let result = if A::syscall_register(&self.regs) == A::MMAP_SYSCALL {
            let request = A::decode_mmap(self)?;
            self.mmap(request)
        } else {
            -ENOSYS
        };
        A::set_syscall_register(&mut self.regs, result as u64);
        A::set_instruction_pointer(&mut self.regs, ip + insn.len() as u64);
        Ok(())
    }

    fn mapped_end(&mut self, addr: u64) -> Option<u64> {
        let (&start, bytes) = self.regions.range(..=addr).next_back()?;
        let end = start + bytes.len() as u64;
        (addr < end).then_some(end)
    }
}

// Layout of the executable, relative to its base.
const EXE_SIZE: usize = 0x2000;
const EXE_DYNAMIC: u64 = 0x100;
const R_DEBUG: u64 = 0x180;
const EXE_GOT: u64 = 0x200;
const SECTION_HEADERS: u64 = 0x400;
const LINK_MAP: u64 = 0x500;
const LINK_MAP_STRIDE: u64 = 0x40;
const NAMES: u64 = 0x800;
const NAME_STRIDE: u64 = 0x80;
const CODE: u64 = 0x1000;

// Layout of each library, relative to its load bias.
const LIB_SIZE: usize = 0x4000;
const LIB_STRIDE: u64 = 0x10000;
const LIB_DYNAMIC: u64 = 0x000;
const LIB_HASH: u64 = 0x100;
const LIB_STRTAB: u64 = 0x200;
const LIB_SYMTAB: u64 = 0x800;
const LIB_CODE: u64 = 0x1000;
const LIB_DATA: u64 = 0x2800;
const LIB_GOT: u64 = 0x3000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HashStyle {
    Sysv,
    Gnu,
    Missing,
}

#[derive(Debug, Clone)]
enum SymbolSpec {
    Function { name: String, size: u64 },
    Object { name: String },
}

#[derive(Debug, Clone)]
struct PlannedLibrary {
    name: String,
    symbols: Vec<SymbolSpec>,
    hash: HashStyle,
    symbol_count: Option<u32>,
    syscall: Option<(String, u64)>,
}

/// Where [`ImageBuilder`] put a library.
#[derive(Debug, Clone)]
pub struct LibraryLayout {
    pub name: String,
    pub load_bias: u64,
    pub pltgot: u64,
    /// The library's functions, in symbol table order.
    pub functions: Vec<Function>,
}

/// Builds a [`FakeTarget`] holding an executable and its shared libraries.
///
/// Settings such as [`ImageBuilder::gnu_hash`] apply to the library added
/// last.
#[derive(Debug, Clone)]
pub struct ImageBuilder<A> {
    libraries: Vec<PlannedLibrary>,
    eager: bool,
    _arch: PhantomData<A>,
}

/// A laid out process.
#[derive(Debug, Clone)]
pub struct FakeImage<A: Arch> {
    pub target: FakeTarget<A>,
    pub base: u64,
    pub libraries: Vec<LibraryLayout>,
}

impl<A: FakeArch> FakeImage<A> {
    /// The layout of the library called `name`.
    pub fn library(&self, name: &str) -> &LibraryLayout {
        self.libraries
            .iter()
            .find(|lib| lib.name == name)
            .unwrap_or_else(|| panic!("no library {name}"))
    }

    /// A fresh session on a copy of the process.
    pub fn session(&self) -> Session<FakeTarget<A>> {
        Session::attached(self.target.clone(), self.base)
    }

    /// A fresh session on a copy of the process, with
    /// [`Session::init_system`] done.
    pub fn bootstrapped(&self) -> Session<FakeTarget<A>> {
        let mut session = self.session();
        session.init_system().expect("fake image bootstraps");
        session
    }
}

/// Little-endian writer for words of the architecture's size.
struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
    word: usize,
}

impl<'a> Writer<'a> {
    fn at(buf: &'a mut [u8], pos: u64, word: usize) -> Self {
        Self {
            buf,
            pos: pos as usize,
            word,
        }
    }

    fn bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
        self
    }

    fn u8(&mut self, value: u8) -> &mut Self {
        self.bytes(&[value])
    }

    fn u16(&mut self, value: u16) -> &mut Self {
        self.bytes(&value.to_le_bytes())
    }

    fn u32(&mut self, value: u32) -> &mut Self {
        self.bytes(&value.to_le_bytes())
    }

    fn word(&mut self, value: u64) -> &mut Self {
        if self.word == 4 {
            self.u32(value as u32)
        } else {
            self.bytes(&value.to_le_bytes())
        }
    }

    fn dyn_entry(&mut self, tag: u64, value: u64) -> &mut Self {
        self.word(tag).word(value)
    }
}

impl<A: FakeArch> Default for ImageBuilder<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: FakeArch> ImageBuilder<A> {
    pub const fn new() -> Self {
        Self {
            libraries: Vec::new(),
            eager: false,
            _arch: PhantomData,
        }
    }

    /// Add a library exporting `functions`, given as names and sizes.
    pub fn library(mut self, name: &str, functions: &[(&str, u64)]) -> Self {
        self.libraries.push(PlannedLibrary {
            name: name.to_owned(),
            symbols: functions
                .iter()
                .map(|&(name, size)| SymbolSpec::Function {
                    name: name.to_owned(),
                    size,
                })
                .collect(),
            hash: HashStyle::Sysv,
            symbol_count: None,
            syscall: None,
        });
        self
    }

    fn last(&mut self) -> &mut PlannedLibrary {
        self.libraries.last_mut().expect("add a library first")
    }

    /// Export a data symbol as well.
    pub fn object(mut self, name: &str) -> Self {
        self.last().symbols.push(SymbolSpec::Object {
            name: name.to_owned(),
        });
        self
    }

    /// Put a syscall instruction `offset` bytes into `function`.
    pub fn syscall_in(mut self, function: &str, offset: u64) -> Self {
        self.last().syscall = Some((function.to_owned(), offset));
        self
    }

    pub fn without_hash(mut self) -> Self {
        self.last().hash = HashStyle::Missing;
        self
    }

    /// Describe the symbol table with `DT_GNU_HASH` instead of `DT_HASH`.
    pub fn gnu_hash(mut self) -> Self {
        self.last().hash = HashStyle::Gnu;
        self
    }

    /// Claim `count` symbols in `DT_HASH`, whatever the table holds.
    pub fn symbol_count(mut self, count: u32) -> Self {
        self.last().symbol_count = Some(count);
        self
    }

    /// Leave the executable's reserved GOT slots empty, as with `-z now`.
    pub fn eager_binding(mut self) -> Self {
        self.eager = true;
        self
    }

    pub fn build(self) -> FakeImage<A> {
        let word = A::WORD_SIZE;
        let base = A::EXE_BASE;
        let mut target = FakeTarget::<A>::new(4242);

        let mut libraries = Vec::new();
        for (index, lib) in self.libraries.iter().enumerate() {
            let load_bias = A::LIB_BASE + index as u64 * LIB_STRIDE;
            let (bytes, layout) = Self::build_library(lib, load_bias);
            target.map(load_bias, bytes);
            libraries.push(layout);
        }

        let mut exe = vec![0; EXE_SIZE];
        Self::write_headers(&mut exe, base);

        let dynamic_end = {
            let mut w = Writer::at(&mut exe, EXE_DYNAMIC, word);
            w.dyn_entry(u64::from(elf::DT_PLTGOT), base + EXE_GOT)
                .dyn_entry(u64::from(elf::DT_DEBUG), base + R_DEBUG)
                .dyn_entry(u64::from(elf::DT_NULL), 0);
            w.pos as u64
        };
        debug_assert!(dynamic_end <= R_DEBUG);

        let head = base + LINK_MAP;
        let node = |i: usize| head + i as u64 * LINK_MAP_STRIDE;
        let name = |i: usize| base + NAMES + i as u64 * NAME_STRIDE;
        let count = libraries.len() + 1;
        for i in 0..count {
            let (bias, dynamic) = match i {
                0 => (0, base + EXE_DYNAMIC),
                _ => (libraries[i - 1].load_bias, libraries[i - 1].load_bias + LIB_DYNAMIC),
            };
            let next = if i + 1 < count { node(i + 1) } else { 0 };
            let prev = if i > 0 { node(i - 1) } else { 0 };
            Writer::at(&mut exe, node(i) - base, word)
                .word(bias)
                .word(name(i))
                .word(dynamic)
                .word(next)
                .word(prev);
            if i > 0 {
                Writer::at(&mut exe, name(i) - base, word).bytes(libraries[i - 1].name.as_bytes());
            }
        }

        // struct r_debug { int r_version; struct link_map *r_map; ... }
        Writer::at(&mut exe, R_DEBUG, word).word(1).word(head);

        let mut got = Writer::at(&mut exe, EXE_GOT, word);
        got.word(base + EXE_DYNAMIC);
        if self.eager {
            got.word(0).word(0);
        } else {
            got.word(head).word(base + CODE + 0x10);
        }
        for function in libraries.iter().flat_map(|lib| &lib.functions) {
            got.word(function.address);
        }
        got.word(0);

        exe[CODE as usize..].fill(0x90);
        target.map(base, exe);

        FakeImage {
            target,
            base,
            libraries,
        }
    }

    /// ELF header, program headers and section headers of the executable.
    fn write_headers(exe: &mut [u8], base: u64) {
        let word = A::WORD_SIZE;
        let wide = word == 8;
        let (ehsize, phentsize, shentsize): (u16, u16, u16) =
            if wide { (64, 56, 64) } else { (52, 32, 40) };
        let dyn_size = 2 * word as u64 * 3;

        let mut w = Writer::at(exe, 0, word);
        w.bytes(&[0x7f, b'E', b'L', b'F'])
            .u8(if wide { 2 } else { 1 })
            .u8(1)
            .u8(1)
            .bytes(&[0; 9])
            .u16(2) // ET_EXEC
            .u16(A::MACHINE)
            .u32(1)
            .word(base + CODE)
            .word(u64::from(ehsize))
            .word(SECTION_HEADERS)
            .u32(0)
            .u16(ehsize)
            .u16(phentsize)
            .u16(2)
            .u16(shentsize)
            .u16(2)
            .u16(0);

        let segments = [
            (1, 5, 0, EXE_SIZE as u64),                // PT_LOAD
            (2, 6, EXE_DYNAMIC, dyn_size),             // PT_DYNAMIC
        ];
        for (p_type, flags, offset, size) in segments {
            if wide {
                w.u32(p_type)
                    .u32(flags)
                    .word(offset)
                    .word(base + offset)
                    .word(base + offset)
                    .word(size)
                    .word(size)
                    .word(PAGE_SIZE);
            } else {
                w.u32(p_type)
                    .u32(offset as u32)
                    .u32((base + offset) as u32)
                    .u32((base + offset) as u32)
                    .u32(size as u32)
                    .u32(size as u32)
                    .u32(flags)
                    .u32(PAGE_SIZE as u32);
            }
        }

        // A null section followed by .dynamic.
        let mut w = Writer::at(exe, SECTION_HEADERS + u64::from(shentsize), word);
        w.u32(0)
            .u32(6) // SHT_DYNAMIC
            .word(3)
            .word(base + EXE_DYNAMIC)
            .word(EXE_DYNAMIC)
            .word(dyn_size)
            .u32(0)
            .u32(0)
            .word(word as u64)
            .word(2 * word as u64);
    }

    fn build_library(lib: &PlannedLibrary, load_bias: u64) -> (Vec<u8>, LibraryLayout) {
        let word = A::WORD_SIZE;
        let mut bytes = vec![0; LIB_SIZE];
        bytes[LIB_CODE as usize..LIB_DATA as usize].fill(0x90);

        let mut w = Writer::at(&mut bytes, LIB_DYNAMIC, word);
        w.dyn_entry(u64::from(elf::DT_STRTAB), load_bias + LIB_STRTAB)
            .dyn_entry(u64::from(elf::DT_SYMTAB), load_bias + LIB_SYMTAB);
        match lib.hash {
            HashStyle::Sysv => {
                w.dyn_entry(u64::from(elf::DT_HASH), load_bias + LIB_HASH);
            }
            HashStyle::Gnu => {
                w.dyn_entry(u64::from(elf::DT_GNU_HASH), load_bias + LIB_HASH);
            }
            HashStyle::Missing => {}
        }
        w.dyn_entry(u64::from(elf::DT_PLTGOT), load_bias + LIB_GOT)
            .dyn_entry(u64::from(elf::DT_NULL), 0);

        // Symbol 0 is the reserved undefined symbol; the string table starts
        // with the empty name.
        let mut strtab_len = 1;
        let mut code = LIB_CODE;
        let mut data = LIB_DATA;
        let mut functions = Vec::new();
        for (index, symbol) in lib.symbols.iter().enumerate() {
            let (name, info, value, size) = match symbol {
                SymbolSpec::Function { name, size } => {
                    let value = code;
                    code += size.div_ceil(0x10).max(1) * 0x10;
                    functions.push(Function {
                        name: name.clone(),
                        address: load_bias + value,
                        size: *size,
                        module: lib.name.clone(),
                    });
                    (name, 0x12, value, *size)
                }
                SymbolSpec::Object { name } => {
                    let value = data;
                    data += 8;
                    (name, 0x11, value, 8)
                }
            };
            let name_offset = strtab_len;
            Writer::at(&mut bytes, LIB_STRTAB + name_offset, word).bytes(name.as_bytes());
            strtab_len += name.len() as u64 + 1;

            let sym = LIB_SYMTAB + (index as u64 + 1) * Self::sym_size();
            let mut w = Writer::at(&mut bytes, sym, word);
            if word == 8 {
                w.u32(name_offset as u32)
                    .u8(info)
                    .u8(0)
                    .u16(1)
                    .word(value)
                    .word(size);
            } else {
                w.u32(name_offset as u32)
                    .u32(value as u32)
                    .u32(size as u32)
                    .u8(info)
                    .u8(0)
                    .u16(1);
            }
        }
        assert!(LIB_STRTAB + strtab_len <= LIB_SYMTAB, "string table overflow");
        assert!(code <= LIB_DATA, "code overflow");

        let symbols = lib.symbols.len() as u32 + 1;
        match lib.hash {
            HashStyle::Sysv => {
                let nchain = lib.symbol_count.unwrap_or(symbols);
                // nbucket, nchain, one empty bucket; chains stay zero.
                Writer::at(&mut bytes, LIB_HASH, word).u32(1).u32(nchain).u32(0);
            }
            HashStyle::Gnu => {
                let mut w = Writer::at(&mut bytes, LIB_HASH, word);
                // nbuckets, symoffset, bloom_size, bloom_shift, bloom, buckets
                w.u32(1).u32(1).u32(1).u32(6).word(u64::MAX);
                w.u32(if symbols > 1 { 1 } else { 0 });
                for index in 1..symbols {
                    // Even hashes, except the chain terminator.
                    w.u32(if index + 1 == symbols { 0x10 | 1 } else { 0x10 });
                }
            }
            HashStyle::Missing => {}
        }

        if let Some((name, offset)) = &lib.syscall {
            let function = functions
                .iter()
                .find(|f| &f.name == name)
                .expect("syscall_in names a function of the library");
            let at = (function.address - load_bias + offset) as usize;
            bytes[at..at + A::SYSCALL_INSN.len()].copy_from_slice(A::SYSCALL_INSN);
        }

        let layout = LibraryLayout {
            name: lib.name.clone(),
            load_bias,
            pltgot: load_bias + LIB_GOT,
            functions,
        };
        (bytes, layout)
    }

    const fn sym_size() -> u64 {
        if A::WORD_SIZE == 8 {
            24
        } else {
            16
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_mmap_allocates_fresh_pages() {
        let mut target = FakeTarget::<X86_64>::new(1);
        let first = target.mmap(MmapRequest::anonymous(0, 1, MapFlags::MAP_PRIVATE, ProtFlags::PROT_READ));
        let second = target.mmap(MmapRequest::anonymous(0, 1, MapFlags::MAP_PRIVATE, ProtFlags::PROT_READ));
        assert!(second as u64 >= first as u64 + PAGE_SIZE);
        assert_eq!(target.mapped_end(first as u64), Some(first as u64 + PAGE_SIZE));
    }

    #[test]
    fn memory_access_stays_inside_regions() {
        let mut target = FakeTarget::<X86>::new(1);
        target.map(0x1000, vec![1, 2, 3, 4]);
        assert_eq!(target.read_memory(0x1001, 2).unwrap(), [2, 3]);
        assert!(target.read_memory(0x1002, 4).is_err());
        assert!(target.write_memory(0x0fff, &[0]).is_err());
        assert_eq!(target.mapped_end(0x1004), None);
    }
}
