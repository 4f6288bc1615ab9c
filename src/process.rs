use crate::{Error, Result};
use procfs::process::{self, MMapPath};
use std::{fmt::Display, path::PathBuf};

/// A process to attach to.
#[derive(Debug)]
pub struct Process(process::Process);

impl Display for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.pid)
    }
}

impl Process {
    /// Get the current running process.
    pub fn current() -> Result<Self> {
        Ok(Self(process::Process::myself()?))
    }

    /// Get a process by its PID.
    pub fn get(id: u32) -> Result<Self> {
        // https://unix.stackexchange.com/a/16884 - A PID should fit in 31 bits comfortably.
        let id = i32::try_from(id).map_err(|_| Error::Missing("process with that PID"))?;
        log::trace!("Getting process with PID {}", id);
        Ok(Self(process::Process::new(id)?))
    }

    /// Search for a process by the name of its executable.
    ///
    /// This ignores errors when the executable name of certain processes cannot
    /// be read (usually because of lack of permissions).
    pub fn by_name(name: &str) -> Result<Option<Self>> {
        log::debug!("Searching for process with executable name {}", name);
        for process in process::all_processes()? {
            let process = process?;
            log::trace!("Checking process {}", process.pid);
            if let Ok(exe) = process.exe() {
                if exe.ends_with(name) {
                    log::info!("Found process with PID {}", process.pid);
                    return Ok(Some(Self(process)));
                }
            } else {
                // This is common, if we don't have permissions to read certain
                // processes information.
                log::trace!("Could not read executable name of process {}", process.pid);
            }
        }
        Ok(None)
    }

    /// The PID of the process.
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.0.pid.unsigned_abs()
    }

    /// Address the process's executable is loaded at: the start of the lowest
    /// mapping of the executable file.
    pub fn base_address(&self) -> Result<u64> {
        let exe = self.0.exe()?;
        log::trace!("Finding load address of {} in process {}", exe.display(), self);
        self.0
            .maps()?
            .into_iter()
            .filter(|m| matches!(&m.pathname, MMapPath::Path(path) if *path == exe))
            .map(|m| m.address.0)
            .min()
            .ok_or(Error::Missing("executable mapping"))
    }

    /// End of the mapping containing `addr`, if there is one.
    pub fn mapping_end(&self, addr: u64) -> Result<Option<u64>> {
        Ok(self
            .0
            .maps()?
            .into_iter()
            .find(|m| (m.address.0..m.address.1).contains(&addr))
            .map(|m| m.address.1))
    }

    /// File backing the mapping containing `addr`, if it is file-backed.
    pub fn mapping_path(&self, addr: u64) -> Result<Option<PathBuf>> {
        Ok(self
            .0
            .maps()?
            .into_iter()
            .find(|m| (m.address.0..m.address.1).contains(&addr))
            .and_then(|m| match m.pathname {
                MMapPath::Path(path) => Some(path),
                _ => None,
            }))
    }
}

impl From<&Process> for pete::Pid {
    fn from(proc: &Process) -> Self {
        Self::from_raw(proc.0.pid)
    }
}
