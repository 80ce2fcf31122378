//! Shared fixtures for supervisor tests.

use std::{
    collections::VecDeque,
    io,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use soffice_process::{Pid, ProcessQuery, UnoUrl};
use tokio::process::Child;

use crate::office_paths::Platform;
use crate::office_process::OfficeProcess;
use crate::process_manager::{KillError, ProcessManager};

pub const SLEEPER: &str = "sleep 30\n";
pub const POLL: Duration = Duration::from_millis(10);
pub const BUDGET: Duration = Duration::from_secs(10);

/// Process manager that answers lookups from a script and records every call.
#[derive(Debug, Default)]
pub struct ScriptedLookup {
    pub answers: Mutex<VecDeque<Pid>>,
    pub fallback: Pid,
    pub ignore_kills: bool,
    pub queries: Mutex<Vec<ProcessQuery>>,
    pub kills: Mutex<Vec<Pid>>,
}

impl ScriptedLookup {
    pub fn new(answers: &[Pid], fallback: Pid) -> Arc<Self> {
        Arc::new(Self {
            answers: Mutex::new(answers.iter().copied().collect()),
            fallback,
            ..Default::default()
        })
    }

    pub fn commands(&self) -> Vec<String> {
        self.queries
            .lock()
            .unwrap()
            .iter()
            .map(|q| q.command.clone())
            .collect()
    }
}

impl ProcessManager for ScriptedLookup {
    fn find_pid(&self, query: &ProcessQuery) -> io::Result<Pid> {
        self.queries.lock().unwrap().push(query.clone());
        Ok(self
            .answers
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.fallback))
    }

    // Only ever kills through the handle; scripted pids are not real.
    fn kill(&self, child: Option<&mut Child>, pid: Pid) -> Result<(), KillError> {
        self.kills.lock().unwrap().push(pid);
        if self.ignore_kills {
            return Ok(());
        }
        let child = child.ok_or(KillError::InvalidTarget { pid })?;
        child.start_kill().map_err(KillError::Child)
    }
}

pub struct Fixture {
    _root: tempfile::TempDir,
    pub home: PathBuf,
    pub work: PathBuf,
}

/// Office home whose launcher is a shell script run through `/bin/sh`.
pub fn fixture(script: &str) -> Fixture {
    let root = tempfile::tempdir().unwrap();
    let home = root.path().join("office");
    let work = root.path().join("work");
    std::fs::create_dir_all(home.join("program")).unwrap();
    std::fs::create_dir_all(&work).unwrap();
    std::fs::write(home.join("program").join("soffice.bin"), script).unwrap();
    Fixture {
        home,
        work,
        _root: root,
    }
}

pub fn office(fx: &Fixture, url: UnoUrl, pm: Arc<dyn ProcessManager>) -> OfficeProcess {
    OfficeProcess::new(
        &fx.home,
        url,
        vec!["/bin/sh".to_string()],
        None,
        &fx.work,
        pm,
    )
    .with_platform(Platform::Linux)
    .with_pid_poll(POLL, Duration::from_millis(200))
}
