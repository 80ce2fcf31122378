use std::{path::PathBuf, time::Duration};

use anyhow::Context;
use soffice_process::UnoUrl;

use crate::office_paths::{self, Platform};
use crate::process_manager::ProcessManagerKind;
use crate::profile_dir;

const DEFAULT_PORT: u16 = 2002;
const DEFAULT_RETRY_INTERVAL_MS: u64 = 250;
const DEFAULT_RETRY_TIMEOUT_MS: u64 = 120_000;
const DEFAULT_HEALTH_INTERVAL_MS: u64 = 2000;

pub(crate) fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    env_string(name).and_then(|v| v.parse::<u64>().ok())
}

pub(crate) fn env_u32(name: &str) -> Option<u32> {
    env_string(name).and_then(|v| v.parse::<u32>().ok())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RestartPolicy {
    Off,
    Always,
    OnFailure,
}

impl RestartPolicy {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "always" => RestartPolicy::Always,
            "on-failure" | "on_failure" | "onfailure" => RestartPolicy::OnFailure,
            _ => RestartPolicy::Off,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RestartConfig {
    pub policy: RestartPolicy,
    pub max_retries: u32,
    pub backoff_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            policy: RestartPolicy::OnFailure,
            max_retries: 10,
            backoff_ms: 1000,
            backoff_max_ms: 30_000,
        }
    }
}

impl RestartConfig {
    fn from_env() -> Self {
        let d = Self::default();
        let policy = env_string("SOFFICE_AGENT_RESTART_POLICY")
            .map(|v| RestartPolicy::parse(&v))
            .unwrap_or(d.policy);
        let max_retries = env_u32("SOFFICE_AGENT_RESTART_MAX_RETRIES")
            .unwrap_or(d.max_retries)
            .clamp(0, 1000);
        let backoff_ms = env_u64("SOFFICE_AGENT_RESTART_BACKOFF_MS")
            .unwrap_or(d.backoff_ms)
            .clamp(100, 10 * 60 * 1000);
        let backoff_max_ms = env_u64("SOFFICE_AGENT_RESTART_BACKOFF_MAX_MS")
            .unwrap_or(d.backoff_max_ms)
            .clamp(backoff_ms, 60 * 60 * 1000);
        Self {
            policy,
            max_retries,
            backoff_ms,
            backoff_max_ms,
        }
    }

    /// Whether an exit with `exit_code` should be followed by restart number `attempt`.
    pub fn should_restart(&self, exit_code: Option<i32>, attempt: u32) -> bool {
        if attempt > self.max_retries {
            return false;
        }
        match self.policy {
            RestartPolicy::Off => false,
            RestartPolicy::Always => true,
            RestartPolicy::OnFailure => exit_code != Some(0),
        }
    }
}

pub fn compute_backoff_ms(cfg: RestartConfig, attempt: u32) -> u64 {
    // attempt is 1-based.
    let pow = attempt.saturating_sub(1).min(30);
    let mult = 1u64.checked_shl(pow).unwrap_or(u64::MAX);
    cfg.backoff_ms.saturating_mul(mult).min(cfg.backoff_max_ms)
}

#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub office_home: PathBuf,
    pub endpoints: Vec<UnoUrl>,
    pub work_dir: PathBuf,
    pub template_profile_dir: Option<PathBuf>,
    pub run_as: Vec<String>,
    pub process_manager: ProcessManagerKind,
    pub retry_interval: Duration,
    pub retry_timeout: Duration,
    pub health_interval: Duration,
    pub restart: RestartConfig,
    pub platform: Platform,
}

pub fn parse_ports(s: &str) -> anyhow::Result<Vec<u16>> {
    s.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| {
            p.parse::<u16>()
                .ok()
                .filter(|port| *port != 0)
                .ok_or_else(|| anyhow::anyhow!("invalid port: {p}"))
        })
        .collect()
}

pub fn parse_pipes(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

impl AgentConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let platform = Platform::current();

        let office_home = match env_string("SOFFICE_AGENT_OFFICE_HOME") {
            Some(v) => PathBuf::from(v),
            None => office_paths::default_office_home(platform).ok_or_else(|| {
                anyhow::anyhow!(
                    "no office installation found in default locations (set SOFFICE_AGENT_OFFICE_HOME)"
                )
            })?,
        };

        let host = env_string("SOFFICE_AGENT_HOST").unwrap_or_else(|| UnoUrl::DEFAULT_HOST.to_string());
        let pipes = env_string("SOFFICE_AGENT_PIPES")
            .map(|v| parse_pipes(&v))
            .unwrap_or_default();
        let ports = match env_string("SOFFICE_AGENT_PORTS") {
            Some(v) => parse_ports(&v).context("parse SOFFICE_AGENT_PORTS")?,
            None if pipes.is_empty() => vec![DEFAULT_PORT],
            None => Vec::new(),
        };
        let mut endpoints: Vec<UnoUrl> = ports
            .into_iter()
            .map(|port| UnoUrl::socket_on(&host, port))
            .collect();
        endpoints.extend(pipes.iter().map(|name| UnoUrl::pipe(name)));

        let work_dir = env_string("SOFFICE_AGENT_WORK_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir);

        let process_manager = match env_string("SOFFICE_AGENT_PROCESS_MANAGER") {
            Some(v) => ProcessManagerKind::parse(&v)?,
            None => ProcessManagerKind::Auto,
        };

        let cfg = Self {
            office_home,
            endpoints,
            work_dir,
            template_profile_dir: env_string("SOFFICE_AGENT_TEMPLATE_PROFILE_DIR").map(PathBuf::from),
            run_as: env_string("SOFFICE_AGENT_RUN_AS")
                .map(|v| v.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
            process_manager,
            retry_interval: Duration::from_millis(
                env_u64("SOFFICE_AGENT_RETRY_INTERVAL_MS")
                    .map(|v| v.clamp(10, 10_000))
                    .unwrap_or(DEFAULT_RETRY_INTERVAL_MS),
            ),
            retry_timeout: Duration::from_millis(
                env_u64("SOFFICE_AGENT_RETRY_TIMEOUT_MS")
                    .map(|v| v.clamp(1000, 60 * 60 * 1000))
                    .unwrap_or(DEFAULT_RETRY_TIMEOUT_MS),
            ),
            health_interval: Duration::from_millis(
                env_u64("SOFFICE_AGENT_HEALTH_INTERVAL_MS")
                    .map(|v| v.clamp(100, 60_000))
                    .unwrap_or(DEFAULT_HEALTH_INTERVAL_MS),
            ),
            restart: RestartConfig::from_env(),
            platform,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let exe = office_paths::office_executable(&self.office_home, self.platform);
        if !exe.is_file() {
            anyhow::bail!(
                "invalid office home {}: launcher {} not found",
                self.office_home.display(),
                exe.display()
            );
        }
        if let Some(template) = &self.template_profile_dir
            && !profile_dir::is_valid_template(template)
        {
            anyhow::bail!(
                "invalid template profile dir {}: expected a 'user' subdirectory",
                template.display()
            );
        }
        if self.endpoints.is_empty() {
            anyhow::bail!("no endpoints configured (set SOFFICE_AGENT_PORTS or SOFFICE_AGENT_PIPES)");
        }
        let mut accepts: Vec<&str> = self.endpoints.iter().map(UnoUrl::accept_string).collect();
        accepts.sort_unstable();
        if let Some(w) = accepts.windows(2).find(|w| w[0] == w[1]) {
            anyhow::bail!("duplicate endpoint: {}", w[0]);
        }
        Ok(())
    }
}
