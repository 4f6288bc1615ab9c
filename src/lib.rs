//! A library for looking inside running processes via ptrace, and making them
//! run code they never asked for.
//!
//! Given a stopped process, a [`Session`] reads the executable's ELF headers
//! out of the process's memory, follows the dynamic linker's own bookkeeping
//! to every loaded module, and enumerates the functions each module exports.
//! It can then borrow a `syscall` instruction from one of those functions to
//! make the process map fresh memory, and redirect the process into code
//! written there.
//!
//! # Platform support
//!
//! The engines work over any [`Target`], and know both the x86_64 and the
//! i386 syscall conventions. The ptrace-backed [`PtraceTarget`] is only
//! available on x86_64 Linux.
//!
//! # Example
//!
//! ```no_run
//! use ptrace_hijack::{MapFlags, Process, ProtFlags, PtraceTarget, Session};
//!
//! # fn main() -> Result<(), ptrace_hijack::Error> {
//! let process = Process::by_name("target-process")?.expect("to find target process");
//! let base = process.base_address()?;
//! let mut session = Session::attached(PtraceTarget::attach(process)?, base);
//! session.init_system()?;
//!
//! for function in session.find_function("libc", "write")? {
//!     println!("{} at {:#x}", function.name, function.address);
//! }
//!
//! session.locate_syscall()?;
//! let page = session.map_memory(
//!     0x1000,
//!     MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
//!     ProtFlags::PROT_READ | ProtFlags::PROT_WRITE | ProtFlags::PROT_EXEC,
//! )?;
//! session.inject_shellcode(page, &[0xcc])?; // int3
//! # Ok(())
//! # }
//! ```
//!
//! # Ptrace note
//!
//! > On many Linux distributions, the kernel is configured by default to
//! > prevent any process from calling ptrace() on another process that it did
//! > not create (e.g. via `fork()`). You can temporarily disable it until the
//! > next reboot using the following command:
//! > ```text
//! > echo 0 | sudo tee /proc/sys/kernel/yama/ptrace_scope
//! > ```
//!
//! This library uses [`log`][1] for logging.
//!
//!  [1]: https://crates.io/crates/log
#![warn(clippy::all, clippy::pedantic, clippy::nursery, missing_docs)]
#![allow(
    // Errors can happen for such a diverse set of reasons out of the user's
    // control that listing them all in a form other than the variants of `Error`
    // would not be feasible or useful.
    clippy::missing_errors_doc,
    // Register names like `rsi` and `rdi` break this.
    clippy::similar_names,
    // Addresses and sizes move between the target's word size, u64 and usize.
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss,
)]
#[cfg(any(target_arch = "x86_64", target_arch = "x86"))]
pub use arch::Native;
pub use arch::{Arch, MapFlags, MmapRequest, ProtFlags, Registers32, Registers64, X86, X86_64};
pub use elf::{ElfHeaders, MAX_DYNAMIC_ENTRIES};
pub use error::{Error, ErrorCode, Result};
pub use linkmap::{ModuleNode, Modules, MAX_MODULES};
pub use process::Process;
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub use ptrace::PtraceTarget;
pub use session::{ElfOf, Flags, Session};
pub use symbols::{DynamicInfo, Function, Plt, MAX_GOT_SLOTS};
pub use target::{RegistersOf, Target, MAX_STRING_LEN};

pub mod arch;
mod elf;
mod error;
mod linkmap;
mod process;
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
mod ptrace;
mod remote;
mod session;
mod symbols;
mod target;
#[cfg(test)]
mod testing;
