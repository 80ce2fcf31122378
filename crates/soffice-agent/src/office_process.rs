use std::{
    ffi::OsString,
    io,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    sync::Arc,
    time::Duration,
};

use soffice_process::{Pid, ProcessQuery, UnoUrl};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{Child, Command},
};

use crate::error::OfficeError;
use crate::office_paths::{self, Platform};
use crate::process_manager::{KillError, ProcessManager};
use crate::profile_dir;
use crate::retry::{Attempt, Retry, RetryError};

const FIND_PID_RETRY: Duration = Duration::from_millis(500);
const FIND_PID_TIMEOUT: Duration = Duration::from_millis(5000);

/// Executable name used to detect an instance before and right after launch.
const START_LOOKUP_COMMAND: &str = "soffice.bin";
/// Broader name used at kill time, when the launch-time pid was never learned.
const KILL_LOOKUP_COMMAND: &str = "soffice.*";

const HEADLESS_FLAGS: [&str; 7] = [
    "-headless",
    "-nocrashreport",
    "-nodefault",
    "-nofirststartwizard",
    "-nolockcheck",
    "-nologo",
    "-norestore",
];

/// One supervised office process bound to a single endpoint.
///
/// Every state change goes through `&mut self`, so a handle has exactly one
/// controlling task. Distinct handles share nothing but the process manager.
#[derive(Debug)]
pub struct OfficeProcess {
    office_home: PathBuf,
    uno_url: UnoUrl,
    run_as: Vec<String>,
    template_profile_dir: Option<PathBuf>,
    instance_profile_dir: PathBuf,
    process_manager: Arc<dyn ProcessManager>,
    platform: Platform,
    pid_poll: Retry,
    child: Option<Child>,
    pid: Pid,
}

impl OfficeProcess {
    pub fn new(
        office_home: impl Into<PathBuf>,
        uno_url: UnoUrl,
        run_as: Vec<String>,
        template_profile_dir: Option<PathBuf>,
        work_dir: &Path,
        process_manager: Arc<dyn ProcessManager>,
    ) -> Self {
        let instance_profile_dir = profile_dir::instance_profile_dir(work_dir, &uno_url);
        Self {
            office_home: office_home.into(),
            uno_url,
            run_as,
            template_profile_dir,
            instance_profile_dir,
            process_manager,
            platform: Platform::current(),
            pid_poll: Retry::new(FIND_PID_RETRY, FIND_PID_TIMEOUT),
            child: None,
            pid: Pid::Unknown,
        }
    }

    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    /// Overrides how long `start` waits for the new process to show up.
    pub fn with_pid_poll(mut self, interval: Duration, timeout: Duration) -> Self {
        self.pid_poll = Retry::new(interval, timeout);
        self
    }

    pub fn uno_url(&self) -> &UnoUrl {
        &self.uno_url
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn instance_profile_dir(&self) -> &Path {
        &self.instance_profile_dir
    }

    /// Launches the office process and waits until it can be found by pid.
    ///
    /// With `restart` set the existing instance profile dir is reused as-is.
    pub async fn start(&mut self, restart: bool) -> Result<(), OfficeError> {
        let accept = self.uno_url.accept_string().to_string();
        let query = ProcessQuery::new(START_LOOKUP_COMMAND, accept.as_str());
        let existing = find_pid(self.process_manager.clone(), query.clone())
            .await
            .map_err(|source| OfficeError::Lookup {
                accept: accept.clone(),
                source,
            })?;
        if existing.is_running() {
            return Err(OfficeError::AlreadyRunning {
                accept,
                pid: existing,
            });
        }

        if !restart {
            profile_dir::prepare(
                &self.instance_profile_dir,
                self.template_profile_dir.as_deref(),
            )
            .map_err(|source| OfficeError::ProfileDir {
                path: self.instance_profile_dir.clone(),
                source,
            })?;
        }

        let executable = office_paths::office_executable(&self.office_home, self.platform);
        let mut cmd = self.command(&executable)?;
        tracing::info!(
            accept = %self.uno_url,
            profile_dir = %self.instance_profile_dir.display(),
            "starting process"
        );

        let mut child = cmd.spawn().map_err(|source| OfficeError::Spawn {
            executable: executable.clone(),
            source,
        })?;
        forward_output(&mut child, &accept);
        self.child = Some(child);
        self.pid = Pid::Unknown;

        let process_manager = self.process_manager.clone();
        let found = self
            .pid_poll
            .execute_async(|| {
                let lookup = find_pid(process_manager.clone(), query.clone());
                let accept = accept.clone();
                async move {
                    match lookup.await {
                        Ok(Pid::NotFound) => Err(Attempt::temporary("pid not found yet")),
                        // Unknown is final: this platform cannot enumerate processes.
                        Ok(pid) => Ok(pid),
                        Err(source) => Err(Attempt::Permanent(OfficeError::Lookup { accept, source })),
                    }
                }
            })
            .await;

        match found {
            Ok(pid) => self.pid = pid,
            Err(RetryError::Timeout(source)) => {
                self.pid = Pid::NotFound;
                return Err(OfficeError::PidNotFound { accept, source });
            }
            Err(RetryError::Failed(e)) => return Err(e),
        }

        tracing::info!(accept = %self.uno_url, pid = %self.pid, "started process");
        Ok(())
    }

    /// Full argv: run-as prefix, launcher, then the office arguments.
    pub fn command_line(&self, executable: &Path) -> Result<Vec<OsString>, OfficeError> {
        let profile_url =
            profile_url(&self.instance_profile_dir).map_err(|source| OfficeError::ProfileDir {
                path: self.instance_profile_dir.clone(),
                source,
            })?;

        let mut args: Vec<OsString> = self.run_as.iter().map(OsString::from).collect();
        args.push(executable.as_os_str().to_os_string());
        args.push(format!("-accept={};urp;", self.uno_url.accept_string()).into());
        args.push(format!("-env:UserInstallation={profile_url}").into());
        args.extend(HEADLESS_FLAGS.iter().map(OsString::from));
        Ok(args)
    }

    fn command(&self, executable: &Path) -> Result<Command, OfficeError> {
        let args = self.command_line(executable)?;
        let (program, rest) = args.split_first().ok_or_else(|| OfficeError::Spawn {
            executable: executable.to_path_buf(),
            source: io::Error::new(io::ErrorKind::InvalidInput, "empty command line"),
        })?;

        let mut cmd = Command::new(program);
        cmd.args(rest)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if self.platform.needs_runtime_path() {
            let paths = office_paths::runtime_paths(&self.office_home).map_err(|source| {
                OfficeError::OfficeHome {
                    home: self.office_home.clone(),
                    source,
                }
            })?;
            match paths {
                Some(paths) => {
                    let (key, current) = office_paths::path_var(std::env::vars_os());
                    let value = office_paths::augmented_path(current.as_deref(), &paths);
                    tracing::debug!(
                        key = %key.to_string_lossy(),
                        value = %value.to_string_lossy(),
                        "setting office PATH"
                    );
                    cmd.env(key, value);
                }
                None => tracing::debug!(
                    office_home = %self.office_home.display(),
                    "no basis-link or ure-link found; not changing PATH"
                ),
            }
        }

        #[cfg(unix)]
        {
            unsafe {
                cmd.pre_exec(set_parent_death_signal);
            }
        }

        Ok(cmd)
    }

    /// False once the process has exited, and also once its status can no longer be read.
    pub fn is_running(&mut self) -> bool {
        let Some(child) = self.child.as_mut() else {
            return false;
        };
        let status = child.try_wait();
        if let Err(e) = &status {
            tracing::warn!(accept = %self.uno_url, error = %e, "could not query process status");
        }
        still_running(&status)
    }

    /// Exit code if the process has terminated, `None` while it is still alive.
    pub fn exit_code(&mut self) -> Option<i32> {
        let child = self.child.as_mut()?;
        match child.try_wait() {
            Ok(status) => status.map(exit_code_of),
            Err(e) => {
                tracing::warn!(accept = %self.uno_url, error = %e, "could not query process status");
                None
            }
        }
    }

    /// Polls until the process exits, failing with a timeout if it outlives `timeout`.
    pub async fn wait_exit_code(
        &mut self,
        interval: Duration,
        timeout: Duration,
    ) -> Result<i32, OfficeError> {
        let accept = self.uno_url.accept_string().to_string();
        let pid = self.pid;
        let Some(child) = self.child.as_mut() else {
            return Err(OfficeError::NotStarted { accept });
        };

        Retry::new(interval, timeout)
            .execute(|| match child.try_wait() {
                Ok(Some(status)) => Ok(exit_code_of(status)),
                Ok(None) => Err(Attempt::temporary("process has not exited yet")),
                Err(e) => Err(Attempt::Permanent(e)),
            })
            .await
            .map_err(|e| match e {
                RetryError::Timeout(source) => OfficeError::ExitTimeout {
                    accept,
                    pid,
                    source,
                },
                RetryError::Failed(source) => OfficeError::Wait { accept, source },
            })
    }

    /// Kills the process and waits for its exit code.
    pub async fn forcibly_terminate(
        &mut self,
        interval: Duration,
        timeout: Duration,
    ) -> Result<i32, OfficeError> {
        let accept = self.uno_url.accept_string().to_string();
        if self.child.is_none() {
            return Err(OfficeError::NotStarted { accept });
        }
        // The recorded pid may already belong to another process.
        if let Some(code) = self.exit_code() {
            tracing::info!(accept = %accept, exit_code = code, "process already exited; not killing");
            return Ok(code);
        }
        tracing::info!(accept = %accept, pid = %self.pid, "trying to forcibly terminate process");

        let target = if self.pid == Pid::Unknown {
            let query = ProcessQuery::new(KILL_LOOKUP_COMMAND, accept.as_str());
            match find_pid(self.process_manager.clone(), query).await {
                Ok(pid) => pid,
                Err(e) => {
                    tracing::warn!(accept = %accept, error = %e, "pid lookup before kill failed");
                    Pid::NotFound
                }
            }
        } else {
            self.pid
        };

        match self.process_manager.kill(self.child.as_mut(), target) {
            Ok(()) => {}
            Err(e @ KillError::InvalidTarget { .. }) => {
                tracing::error!(accept = %accept, error = %e, "failed to forcibly terminate process");
            }
            Err(source) => {
                return Err(OfficeError::Kill {
                    accept,
                    pid: target,
                    source,
                });
            }
        }

        self.wait_exit_code(interval, timeout).await
    }

    pub fn delete_profile_dir(&self) {
        profile_dir::delete(&self.instance_profile_dir);
    }
}

fn profile_url(dir: &Path) -> io::Result<String> {
    let abs = std::path::absolute(dir)?;
    let url = url::Url::from_file_path(&abs).map_err(|()| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("cannot express {} as a file url", abs.display()),
        )
    })?;
    Ok(url.as_str().trim_end_matches('/').to_string())
}

/// Runs a lookup on the blocking pool; enumerating the process table is synchronous.
async fn find_pid(process_manager: Arc<dyn ProcessManager>, query: ProcessQuery) -> io::Result<Pid> {
    tokio::task::spawn_blocking(move || process_manager.find_pid(&query))
        .await
        .map_err(io::Error::other)?
}

fn still_running(status: &io::Result<Option<ExitStatus>>) -> bool {
    matches!(status, Ok(None))
}

fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

fn forward_output(child: &mut Child, accept: &str) {
    if let Some(out) = child.stdout.take() {
        let accept = accept.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(out).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(accept = %accept, stream = "stdout", "{line}");
            }
        });
    }
    if let Some(err) = child.stderr.take() {
        let accept = accept.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(err).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(accept = %accept, stream = "stderr", "{line}");
            }
        });
    }
}

#[cfg(target_os = "linux")]
fn set_parent_death_signal() -> io::Result<()> {
    // Take the office process down with the agent if the agent dies first.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "linux")))]
fn set_parent_death_signal() -> io::Result<()> {
    Ok(())
}
