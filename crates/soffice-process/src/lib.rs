use std::fmt;

/// Connection descriptor of one office instance.
///
/// The accept string is passed to the office process at launch and is also the
/// argument used to find that process again in the OS process table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct UnoUrl {
    accept: String,
    connect: String,
}

impl UnoUrl {
    pub const DEFAULT_HOST: &'static str = "127.0.0.1";

    pub fn socket(port: u16) -> Self {
        Self::socket_on(Self::DEFAULT_HOST, port)
    }

    pub fn socket_on(host: &str, port: u16) -> Self {
        let accept = format!("socket,host={host},port={port}");
        let connect = format!("{accept},tcpNoDelay=1");
        Self { accept, connect }
    }

    pub fn pipe(name: &str) -> Self {
        let accept = format!("pipe,name={name}");
        Self {
            connect: accept.clone(),
            accept,
        }
    }

    pub fn accept_string(&self) -> &str {
        &self.accept
    }

    pub fn connect_string(&self) -> &str {
        &self.connect
    }

    /// Full UNO URL a client resolves to reach the component context.
    pub fn uno_connection_url(&self) -> String {
        format!("uno:{};urp;StarOffice.ComponentContext", self.connect)
    }
}

impl fmt::Display for UnoUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.accept)
    }
}

/// Result of looking a process up in the OS process table.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize,
)]
pub enum Pid {
    /// The lookup capability is unavailable, or no lookup happened yet.
    #[default]
    Unknown,
    /// The lookup ran and nothing matched.
    NotFound,
    Running(u32),
}

impl Pid {
    pub fn is_running(&self) -> bool {
        matches!(self, Pid::Running(_))
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Pid::Running(pid) => Some(*pid),
            _ => None,
        }
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pid::Unknown => f.write_str("PID_UNKNOWN"),
            Pid::NotFound => f.write_str("PID_NOT_FOUND"),
            Pid::Running(pid) => write!(f, "{pid}"),
        }
    }
}

/// Selects a process by executable-name glob and a command-line substring.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ProcessQuery {
    pub command: String,
    pub argument: String,
}

impl ProcessQuery {
    pub fn new(command: impl Into<String>, argument: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            argument: argument.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct InstanceId(pub String);

impl InstanceId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum InstanceState {
    Starting,
    Running,
    Stopping,
    Exited,
    Failed,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct InstanceStatus {
    pub id: InstanceId,
    pub accept: String,
    pub state: InstanceState,
    pub pid: Pid,
    pub exit_code: Option<i32>,
    pub restarts: u32,
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_id_is_non_empty() {
        let id = InstanceId::new();
        assert!(!id.0.is_empty());
    }

    #[test]
    fn socket_url_strings() {
        let url = UnoUrl::socket(2002);
        assert_eq!(url.accept_string(), "socket,host=127.0.0.1,port=2002");
        assert_eq!(
            url.connect_string(),
            "socket,host=127.0.0.1,port=2002,tcpNoDelay=1"
        );
        assert_eq!(
            url.uno_connection_url(),
            "uno:socket,host=127.0.0.1,port=2002,tcpNoDelay=1;urp;StarOffice.ComponentContext"
        );
        assert_eq!(url.to_string(), url.accept_string());
    }

    #[test]
    fn pipe_url_strings() {
        let url = UnoUrl::pipe("office_1");
        assert_eq!(url.accept_string(), "pipe,name=office_1");
        assert_eq!(url.connect_string(), "pipe,name=office_1");
    }

    #[test]
    fn pid_states_are_distinct() {
        assert_ne!(Pid::Unknown, Pid::NotFound);
        assert!(Pid::Running(12).is_running());
        assert!(!Pid::NotFound.is_running());
        assert_eq!(Pid::Unknown.as_u32(), None);
        assert_eq!(Pid::Running(7).as_u32(), Some(7));
        assert_eq!(Pid::Unknown.to_string(), "PID_UNKNOWN");
        assert_eq!(Pid::NotFound.to_string(), "PID_NOT_FOUND");
    }

    #[test]
    fn status_serializes_pid_tag() {
        let status = InstanceStatus {
            id: InstanceId("a".to_string()),
            accept: "pipe,name=x".to_string(),
            state: InstanceState::Running,
            pid: Pid::Running(42),
            exit_code: None,
            restarts: 0,
            message: None,
        };
        let v = serde_json::to_value(&status).unwrap();
        assert_eq!(v["pid"]["Running"], 42);
        assert_eq!(v["state"], "Running");
    }
}
