use std::{io, path::PathBuf};

use soffice_process::Pid;

use crate::process_manager::KillError;
use crate::retry::RetryTimeout;

pub type Cause = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum OfficeError {
    #[error("a process with acceptString '{accept}' is already running; pid {pid}")]
    AlreadyRunning { accept: String, pid: Pid },

    #[error("process with acceptString '{accept}' started but its pid could not be found")]
    PidNotFound {
        accept: String,
        #[source]
        source: RetryTimeout,
    },

    #[error("failed to prepare profile dir {}", path.display())]
    ProfileDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to resolve office paths under {}", home.display())]
    OfficeHome {
        home: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to spawn office process {}", executable.display())]
    Spawn {
        executable: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("process lookup failed for acceptString '{accept}'")]
    Lookup {
        accept: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to kill process with acceptString '{accept}' (pid {pid})")]
    Kill {
        accept: String,
        pid: Pid,
        #[source]
        source: KillError,
    },

    #[error("process with acceptString '{accept}' (pid {pid}) did not exit in time")]
    ExitTimeout {
        accept: String,
        pid: Pid,
        #[source]
        source: RetryTimeout,
    },

    #[error("failed to query exit status of process with acceptString '{accept}'")]
    Wait {
        accept: String,
        #[source]
        source: io::Error,
    },

    #[error("process with acceptString '{accept}' was never started")]
    NotStarted { accept: String },
}

impl OfficeError {
    /// True for failures caused by a retry budget running out.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            OfficeError::ExitTimeout { .. } | OfficeError::PidNotFound { .. }
        )
    }
}

/// Renders an error and its sources as a single `a: b: c` line.
pub fn format_error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut parts = Vec::<String>::new();
    let mut cur = Some(err);
    while let Some(e) = cur {
        let s = e.to_string();
        if !s.is_empty() && parts.last() != Some(&s) {
            parts.push(s);
        }
        cur = e.source();
    }
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        parts.join(": ")
    }
}
