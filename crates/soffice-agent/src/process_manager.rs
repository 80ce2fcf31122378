//! Finding office processes in the OS process table and killing them.

use std::{fmt, io, sync::Arc};

use soffice_process::{Pid, ProcessQuery};
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};
use tokio::process::Child;
use wildmatch::WildMatch;

#[derive(Debug, thiserror::Error)]
pub enum KillError {
    #[error("no usable process handle or pid to kill (pid {pid})")]
    InvalidTarget { pid: Pid },

    #[error("failed to signal pid {pid}")]
    Signal {
        pid: u32,
        #[source]
        source: io::Error,
    },

    #[error("failed to kill child process")]
    Child(#[source] io::Error),
}

/// Process lookup and kill capability shared by every supervised instance.
pub trait ProcessManager: Send + Sync + fmt::Debug {
    /// `Pid::Unknown` means this implementation cannot enumerate processes.
    fn find_pid(&self, query: &ProcessQuery) -> io::Result<Pid>;

    /// Forcibly terminates `pid`, falling back to `child` when the pid is not usable.
    fn kill(&self, child: Option<&mut Child>, pid: Pid) -> Result<(), KillError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessManagerKind {
    Auto,
    Sysinfo,
    Pure,
}

impl ProcessManagerKind {
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "auto" => Ok(Self::Auto),
            "sysinfo" | "os" => Ok(Self::Sysinfo),
            "pure" | "none" => Ok(Self::Pure),
            other => anyhow::bail!("unknown process manager: {other}"),
        }
    }
}

pub fn build(kind: ProcessManagerKind) -> Arc<dyn ProcessManager> {
    match kind {
        ProcessManagerKind::Auto => detect(),
        ProcessManagerKind::Sysinfo => Arc::new(SysinfoProcessManager),
        ProcessManagerKind::Pure => Arc::new(PureProcessManager),
    }
}

/// Picks the best implementation for the running platform.
pub fn detect() -> Arc<dyn ProcessManager> {
    if sysinfo::IS_SUPPORTED_SYSTEM {
        Arc::new(SysinfoProcessManager)
    } else {
        Arc::new(PureProcessManager)
    }
}

/// Enumerates the OS process table through `sysinfo`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SysinfoProcessManager;

impl ProcessManager for SysinfoProcessManager {
    fn find_pid(&self, query: &ProcessQuery) -> io::Result<Pid> {
        let mut system = System::new();
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing().with_cmd(UpdateKind::Always),
        );
        let processes = system
            .processes()
            .iter()
            // Linux lists threads as tasks that share the command line.
            .filter(|(_, process)| process.thread_kind().is_none())
            .map(|(pid, process)| {
                let args: Vec<String> = process
                    .cmd()
                    .iter()
                    .map(|a| a.to_string_lossy().into_owned())
                    .collect();
                (pid.as_u32(), args)
            });
        Ok(find_in_processes(processes, query))
    }

    fn kill(&self, child: Option<&mut Child>, pid: Pid) -> Result<(), KillError> {
        kill_target(child, pid)
    }
}

/// Cannot enumerate processes; kills through the child handle only.
#[derive(Debug, Clone, Copy, Default)]
pub struct PureProcessManager;

impl ProcessManager for PureProcessManager {
    fn find_pid(&self, _query: &ProcessQuery) -> io::Result<Pid> {
        Ok(Pid::Unknown)
    }

    fn kill(&self, child: Option<&mut Child>, pid: Pid) -> Result<(), KillError> {
        match child {
            Some(child) => kill_child(child),
            None => Err(KillError::InvalidTarget { pid }),
        }
    }
}

struct QueryMatcher<'a> {
    command: WildMatch,
    argument: &'a str,
}

impl<'a> QueryMatcher<'a> {
    fn new(query: &'a ProcessQuery) -> Self {
        Self {
            command: WildMatch::new(&query.command),
            argument: &query.argument,
        }
    }

    /// An element naming the command must come before one holding the argument.
    fn matches<S: AsRef<str>>(&self, args: &[S]) -> bool {
        args.iter().enumerate().any(|(i, arg)| {
            self.command.matches(file_name(arg.as_ref()))
                && args[i + 1..]
                    .iter()
                    .any(|a| a.as_ref().contains(self.argument))
        })
    }
}

fn file_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

/// First process whose command line satisfies `query`.
fn find_in_processes<I, S>(processes: I, query: &ProcessQuery) -> Pid
where
    I: IntoIterator<Item = (u32, Vec<S>)>,
    S: AsRef<str>,
{
    let matcher = QueryMatcher::new(query);
    processes
        .into_iter()
        .find(|(_, args)| matcher.matches(args))
        .map_or(Pid::NotFound, |(pid, _)| Pid::Running(pid))
}

fn kill_target(child: Option<&mut Child>, pid: Pid) -> Result<(), KillError> {
    #[cfg(unix)]
    {
        if let Pid::Running(raw) = pid {
            return kill_pid(raw).map_err(|source| KillError::Signal { pid: raw, source });
        }
    }
    #[cfg(not(unix))]
    {
        if let Pid::Running(raw) = pid
            && kill_listed_pid(raw)
        {
            return Ok(());
        }
    }

    match child {
        Some(child) => kill_child(child),
        None => Err(KillError::InvalidTarget { pid }),
    }
}

#[cfg(unix)]
fn kill_pid(pid: u32) -> io::Result<()> {
    let Ok(raw) = libc::pid_t::try_from(pid) else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("pid out of range: {pid}"),
        ));
    };
    let rc = unsafe { libc::kill(raw, libc::SIGKILL) };
    if rc == -1 {
        let err = io::Error::last_os_error();
        // Already gone.
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        return Err(err);
    }
    Ok(())
}

#[cfg(not(unix))]
fn kill_listed_pid(pid: u32) -> bool {
    let target = sysinfo::Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[target]),
        true,
        ProcessRefreshKind::nothing(),
    );
    system.process(target).is_some_and(|p| p.kill())
}

fn kill_child(child: &mut Child) -> Result<(), KillError> {
    match child.start_kill() {
        Ok(()) => Ok(()),
        // tokio reports an already reaped child as InvalidInput.
        Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
        Err(e) => Err(KillError::Child(e)),
    }
}
