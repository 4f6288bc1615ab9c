use clap::{ArgGroup, Parser, Subcommand};
use color_eyre::{
    eyre::{eyre, WrapErr},
    Result,
};
use ptrace_hijack::{Flags, MapFlags, ModuleNode, Process, ProtFlags, PtraceTarget, Session};
use std::path::PathBuf;

type LiveSession = Session<PtraceTarget>;

const PAGE_SIZE: u64 = 0x1000;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(group(ArgGroup::new("target").required(true)))]
struct Args {
    #[command(flatten)]
    verbose: clap_verbosity_flag::Verbosity<clap_verbosity_flag::WarnLevel>,

    /// Name of a process to attach to.
    #[arg(short, long, group = "target")]
    name: Option<String>,

    /// PID of a process to attach to.
    #[arg(short, long, group = "target")]
    pid: Option<u32>,

    /// Load address of the process's executable, if not the one in
    /// `/proc/<pid>/maps`.
    #[arg(short, long, value_parser = parse_number)]
    base: Option<u64>,

    /// Log registers at every single step and every GOT slot scanned.
    #[arg(long)]
    trace_steps: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the modules loaded by the dynamic linker.
    Modules,
    /// List exported functions and where the executable's GOT refers to them.
    Functions {
        /// Only list modules whose name contains this.
        #[arg(short, long)]
        library: Option<String>,
    },
    /// Find a function by exact name, in modules whose name contains LIBRARY.
    Find { library: String, function: String },
    /// Find a syscall instruction in the process.
    Syscall,
    /// Map anonymous read/write/execute memory in the process.
    Map {
        /// Size in bytes.
        #[arg(value_parser = parse_number)]
        size: u64,
        /// Preferred address.
        #[arg(long, value_parser = parse_number)]
        at: Option<u64>,
    },
    /// Write the contents of a file into the process and jump to it.
    Inject {
        /// Raw machine code.
        file: PathBuf,
        /// Writable, executable address to put the code at; fresh memory is
        /// mapped if not given.
        #[arg(long, value_parser = parse_number)]
        at: Option<u64>,
    },
}

/// Parse a decimal or `0x`-prefixed hexadecimal number.
fn parse_number(s: &str) -> std::result::Result<u64, std::num::ParseIntError> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    }
}

fn rwx() -> ProtFlags {
    ProtFlags::PROT_READ | ProtFlags::PROT_WRITE | ProtFlags::PROT_EXEC
}

fn anonymous() -> MapFlags {
    MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS
}

fn display_name(module: &ModuleNode) -> &str {
    if module.name.is_empty() {
        "<main>"
    } else {
        &module.name
    }
}

impl Args {
    fn run(self) -> Result<()> {
        let level = self.verbose.log_level_filter();
        pretty_env_logger::formatted_builder()
            .filter_level(level)
            .init();
        let process = if let Some(name) = self.name {
            Process::by_name(&name)?
                .ok_or_else(|| eyre!("could not find process with name {name:?}"))?
        } else if let Some(pid) = self.pid {
            Process::get(pid)?
        } else {
            panic!("no target specified, but clap should have caught this");
        };
        let base = match self.base {
            Some(base) => base,
            None => process
                .base_address()
                .wrap_err("couldn't find where the executable is loaded")?,
        };
        let target = PtraceTarget::attach(process).wrap_err("failed to attach to given process")?;
        let mut session = Session::attached(target, base);
        session.set_flag(Flags::DEBUG, level >= log::LevelFilter::Debug);
        session.set_flag(Flags::DEBUG_VERBOSE, self.trace_steps);
        session
            .init_system()
            .wrap_err("failed to read the dynamic linker's state")?;

        let outcome = self.command.run(&mut session);
        if let Some(target) = session.detach() {
            target.resume().wrap_err("failed to resume the process")?;
        }
        outcome
    }
}

impl Command {
    fn run(self, session: &mut LiveSession) -> Result<()> {
        match self {
            Self::Modules => {
                for module in session.modules() {
                    let module = module.wrap_err("failed to walk the module list")?;
                    println!(
                        "{:#018x} {:#018x} {}",
                        module.address,
                        module.load_bias,
                        display_name(&module)
                    );
                }
            }
            Self::Functions { library } => functions(session, library.as_deref())?,
            Self::Find { library, function } => {
                let found = session.find_function(&library, &function)?;
                if found.is_empty() {
                    return Err(eyre!("no function {function:?} in any module matching {library:?}"));
                }
                for f in found {
                    println!("{:#018x} {:>8} {} ({})", f.address, f.size, f.name, f.module);
                }
            }
            Self::Syscall => {
                let addr = session.locate_syscall()?;
                println!("{addr:#x}");
            }
            Self::Map { size, at } => {
                session.locate_syscall()?;
                let addr = session
                    .map_memory_at(at.unwrap_or(0), size, anonymous(), rwx())
                    .wrap_err("mmap in the process failed")?;
                if at.is_some_and(|at| at != addr) {
                    log::warn!("Mapping was placed at {addr:#x} instead");
                }
                println!("{addr:#x}");
            }
            Self::Inject { file, at } => {
                let code = std::fs::read(&file)
                    .wrap_err_with(|| format!("couldn't read {}", file.display()))?;
                let addr = if let Some(at) = at {
                    at
                } else {
                    session.locate_syscall()?;
                    let len = (code.len() as u64).div_ceil(PAGE_SIZE).max(1) * PAGE_SIZE;
                    session
                        .map_memory(len, anonymous(), rwx())
                        .wrap_err("couldn't map memory for the code")?
                };
                session
                    .inject_shellcode(addr, &code)
                    .wrap_err("failed to inject the code")?;
                log::info!("Injected {} bytes at {addr:#x}", code.len());
                println!("{addr:#x}");
            }
        }
        Ok(())
    }
}

/// Print every function of the matching modules, with the executable's GOT
/// slot for it if it imports it.
fn functions(session: &mut LiveSession, library: Option<&str>) -> Result<()> {
    let modules = session
        .modules()
        .collect::<Result<Vec<_>, _>>()
        .wrap_err("failed to walk the module list")?;
    let pltgot = session.pltgot();
    for module in modules {
        if module.name.is_empty() || library.is_some_and(|library| !module.matches(library)) {
            continue;
        }
        let functions = match session.functions(&module) {
            Ok(functions) => functions,
            Err(e) => {
                log::warn!("Couldn't list functions of {}: {e}", module.name);
                continue;
            }
        };
        println!("{}:", module.name);
        for f in functions {
            let slot = pltgot.and_then(|pltgot| session.find_func_addr_in_got(pltgot, f.address).ok());
            match slot {
                Some(slot) => println!("  {:#018x} {:>8} {} (GOT {slot:#x})", f.address, f.size, f.name),
                None => println!("  {:#018x} {:>8} {}", f.address, f.size, f.name),
            }
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    color_eyre::install()?;
    Args::parse().run()
}
