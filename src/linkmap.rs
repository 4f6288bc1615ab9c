//! Walking the dynamic linker's list of loaded modules (`struct link_map`).
use crate::{session::decode_word, Error, Result, Session, Target};
use std::collections::HashSet;

/// Most modules a walk will visit before assuming the list is corrupt.
pub const MAX_MODULES: usize = 4096;

/// Words in the public part of `struct link_map`: `l_addr`, `l_name`, `l_ld`,
/// `l_next` and `l_prev`.
const LINK_MAP_WORDS: usize = 5;

/// A snapshot of one entry of the target's module list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleNode {
    /// Where this entry lives in the target.
    pub address: u64,
    /// Difference between the module's link-time and run-time addresses.
    pub load_bias: u64,
    /// Path of the module; empty for the main executable.
    pub name: String,
    /// Address of the module's dynamic section.
    pub dynamic: u64,
    /// Address of the next entry, or 0 for the last one.
    pub next: u64,
    /// Address of the previous entry, or 0 for the first one.
    pub prev: u64,
}

impl ModuleNode {
    /// Final path component of the module's name.
    #[must_use]
    pub fn file_name(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(&self.name)
    }

    /// Whether `pattern` appears in the module's name.
    #[must_use]
    pub fn matches(&self, pattern: &str) -> bool {
        !self.name.is_empty() && self.name.contains(pattern)
    }
}

impl<T: Target> Session<T> {
    /// Read the module entry at `addr`. An address of 0 marks the end of the
    /// list and yields `None`.
    ///
    /// This does not follow `next`; use [`Session::modules`] to walk the list.
    pub fn next_module(&mut self, addr: u64) -> Result<Option<ModuleNode>> {
        let result = self.read_module(addr);
        self.record(result)
    }

    pub(crate) fn read_module(&mut self, addr: u64) -> Result<Option<ModuleNode>> {
        if addr == 0 {
            return Ok(None);
        }
        let word = Self::word_size();
        let endian = Self::endian();
        let target = self.target_mut()?;
        let bytes = target.read_memory(addr, LINK_MAP_WORDS * word)?;
        let mut words = bytes
            .chunks_exact(word)
            .map(|chunk| decode_word(endian, chunk).unwrap_or_default());
        let mut field = || words.next().unwrap_or_default();
        let (load_bias, name_ptr, dynamic, next, prev) = (field(), field(), field(), field(), field());
        let name = if name_ptr == 0 {
            String::new()
        } else {
            target.read_string(name_ptr).unwrap_or_else(|e| {
                log::debug!("Couldn't read module name at {name_ptr:x}: {e}");
                String::new()
            })
        };
        log::trace!("Module at {addr:x}: {name:?} bias {load_bias:x} dynamic {dynamic:x}");
        Ok(Some(ModuleNode {
            address: addr,
            load_bias,
            name,
            dynamic,
            next,
            prev,
        }))
    }

    /// Walk the target's module list from the head found by
    /// [`Session::init_system`].
    ///
    /// Every entry is read fresh from the target as the iterator advances, so
    /// the result reflects the list at the time of the walk. The iterator is
    /// finite: it ends at the last entry, after an error, on a cycle, or after
    /// [`MAX_MODULES`] entries.
    pub fn modules(&mut self) -> Modules<'_, T> {
        let start = self.link_head.as_ref().map(|head| head.address);
        Modules {
            session: self,
            next: start,
            seen: HashSet::new(),
        }
    }

    /// Walk the module list starting at an arbitrary entry.
    pub fn modules_from(&mut self, addr: u64) -> Modules<'_, T> {
        Modules {
            session: self,
            next: Some(addr),
            seen: HashSet::new(),
        }
    }

    /// The first module whose name contains `name`.
    pub fn module_by_name(&mut self, name: &str) -> Result<Option<ModuleNode>> {
        for module in self.modules() {
            let module = module?;
            if module.matches(name) {
                return Ok(Some(module));
            }
        }
        Ok(None)
    }
}

/// Iterator over a snapshot of the target's module list.
///
/// See [`Session::modules`].
pub struct Modules<'a, T: Target> {
    session: &'a mut Session<T>,
    /// `None` once the walk is over.
    next: Option<u64>,
    seen: HashSet<u64>,
}

impl<T: Target> Modules<'_, T> {
    fn fail(&mut self, error: Error) -> Option<Result<ModuleNode>> {
        self.next = None;
        Some(self.session.record(Err(error)))
    }
}

impl<T: Target> Iterator for Modules<'_, T> {
    type Item = Result<ModuleNode>;

    fn next(&mut self) -> Option<Self::Item> {
        let Some(addr) = self.next else {
            if self.seen.is_empty() {
                // Never started: the session has not been bootstrapped.
                self.seen.insert(0);
                return self.fail(Error::Missing("link map"));
            }
            return None;
        };
        if !self.seen.insert(addr) || self.seen.len() > MAX_MODULES {
            log::debug!("Module list loops back to {addr:x}, stopping");
            return self.fail(Error::Missing("end of the module list"));
        }
        match self.session.read_module(addr) {
            Ok(Some(node)) => {
                self.next = Some(node.next).filter(|&next| next != 0);
                Some(Ok(node))
            }
            Ok(None) => {
                self.next = None;
                None
            }
            Err(e) => self.fail(e),
        }
    }
}
