use std::{
    error::Error,
    fmt,
    path::{Path, PathBuf},
};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Yaml},
};
use serde::{Deserialize, Serialize};

/// Supervisor runtime configuration.
///
/// Layered defaults < optional YAML file < `KNOCKGATE_SUPERVISOR_*`
/// environment variables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisorConf {
    /// Directory holding one `<rule_id>.pid` file per running listener.
    pub pid_dir: PathBuf,
    /// Shared append-only log receiving every listener's stdout/stderr.
    pub log_file: PathBuf,
    /// Listener executable to spawn; resolved via PATH when relative.
    pub listener_bin: PathBuf,
    /// How long to wait after spawning before checking that the listener
    /// has not already exited (failed starts exit within milliseconds).
    pub start_probe_ms: u64,
}

impl Default for SupervisorConf {
    fn default() -> Self {
        SupervisorConf {
            pid_dir: PathBuf::from("/var/run/knockgate"),
            log_file: PathBuf::from("/var/log/knockgate/knockd.log"),
            listener_bin: PathBuf::from("knockgate"),
            start_probe_ms: 200,
        }
    }
}

impl SupervisorConf {
    pub fn load(config_path: Option<&Path>) -> Result<Self, ConfError> {
        let mut figment = Figment::new().merge(Serialized::defaults(SupervisorConf::default()));

        if let Some(path) = config_path {
            figment = figment.merge(Yaml::file(path));
        }

        let conf = figment
            .merge(Env::prefixed("KNOCKGATE_SUPERVISOR_"))
            .extract()?;
        Ok(conf)
    }
}

#[derive(Debug)]
pub enum ConfError {
    Extraction(figment::Error),
}

impl fmt::Display for ConfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfError::Extraction(e) => write!(f, "configuration error: {e}"),
        }
    }
}

impl Error for ConfError {}

impl From<figment::Error> for ConfError {
    fn from(e: figment::Error) -> Self {
        ConfError::Extraction(e)
    }
}
