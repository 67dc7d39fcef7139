//! Lifecycle supervisor for per-rule knock listeners.
//!
//! One isolated listener process guards one rule; a capture or logic fault
//! under one rule can never corrupt another rule's sessions. The supervisor
//! tracks each listener through a PID file under a runtime directory and
//! exposes the lifecycle surface the management layer drives:
//! [`Supervisor::start`], [`Supervisor::update`], [`Supervisor::stop`],
//! [`Supervisor::stop_all`], [`Supervisor::list`].
//!
//! Every operation that spawns or signals a listener requires root on the
//! host and fails fast with [`SupervisorError::InsufficientPrivilege`]
//! before touching the network or firewall.

pub mod conf;
mod handle;

pub use conf::{ConfError, SupervisorConf};
pub use handle::ListenerHandle;

use std::{
    error::Error,
    fmt, fs, io,
    os::unix::fs::PermissionsExt,
    path::PathBuf,
    process::{Command, Stdio},
    thread,
    time::Duration,
};

use knockgate_common::{ConfigError, KnockRule};
use tracing::{debug, info, warn};

pub struct Supervisor {
    conf: SupervisorConf,
}

impl Supervisor {
    /// Create a supervisor and bootstrap its runtime directories: the PID
    /// directory (mode 755) and the shared listener log (mode 644).
    pub fn new(conf: SupervisorConf) -> Result<Self, SupervisorError> {
        fs::create_dir_all(&conf.pid_dir).map_err(SupervisorError::PidFile)?;
        fs::set_permissions(&conf.pid_dir, fs::Permissions::from_mode(0o755))
            .map_err(SupervisorError::PidFile)?;

        if let Some(parent) = conf.log_file.parent() {
            fs::create_dir_all(parent).map_err(SupervisorError::LogFile)?;
        }
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&conf.log_file)
            .map_err(SupervisorError::LogFile)?;
        fs::set_permissions(&conf.log_file, fs::Permissions::from_mode(0o644))
            .map_err(SupervisorError::LogFile)?;

        Ok(Supervisor { conf })
    }

    pub fn conf(&self) -> &SupervisorConf {
        &self.conf
    }

    /// Launch a listener for `rule`, or report the one already running.
    ///
    /// A live recorded process means success without spawning a duplicate;
    /// a stale PID file is discarded. A listener that exits within the
    /// probe window (bad sequence syntax, missing privilege, capture bind
    /// failure) is reported as [`SupervisorError::ListenerExited`], not as
    /// running.
    pub fn start(&self, rule: &KnockRule) -> Result<ListenerHandle, SupervisorError> {
        Self::require_root()?;
        rule.validate().map_err(SupervisorError::InvalidRule)?;

        let rule_id = rule.id();
        let pid_path = self.pid_path(&rule_id);

        if pid_path.exists() {
            match handle::read_pid(&pid_path) {
                Ok(pid) if handle::process_alive(pid) => {
                    info!(
                        event.name = "supervisor.already_running",
                        rule.id = %rule_id,
                        process.pid = pid,
                        "listener already running, not spawning a duplicate"
                    );
                    return Ok(ListenerHandle {
                        rule_id,
                        pid,
                        log_file: self.conf.log_file.clone(),
                    });
                }
                _ => {
                    debug!(
                        event.name = "supervisor.stale_handle_removed",
                        rule.id = %rule_id,
                        "removing stale pid file"
                    );
                    fs::remove_file(&pid_path).map_err(SupervisorError::PidFile)?;
                }
            }
        }

        let stdout = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.conf.log_file)
            .map_err(SupervisorError::LogFile)?;
        let stderr = stdout.try_clone().map_err(SupervisorError::LogFile)?;

        let mut child = Command::new(&self.conf.listener_bin)
            .args(Self::listener_args(rule))
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .spawn()
            .map_err(SupervisorError::Spawn)?;

        // A listener that cannot parse its sequence or bind capture exits
        // within milliseconds; catch that instead of recording a dead pid.
        thread::sleep(Duration::from_millis(self.conf.start_probe_ms));
        if let Some(status) = child.try_wait().map_err(SupervisorError::Spawn)? {
            return Err(SupervisorError::ListenerExited {
                rule_id,
                code: status.code(),
            });
        }

        let pid = child.id();
        handle::write_pid(&pid_path, pid).map_err(SupervisorError::PidFile)?;

        info!(
            event.name = "supervisor.listener_started",
            rule.id = %rule_id,
            process.pid = pid,
            "listener process started"
        );

        Ok(ListenerHandle {
            rule_id,
            pid,
            log_file: self.conf.log_file.clone(),
        })
    }

    /// Stop, then start with the new parameters. Edits are never applied to
    /// a running listener in place.
    pub fn update(&self, rule: &KnockRule) -> Result<ListenerHandle, SupervisorError> {
        self.stop(rule)?;
        self.start(rule)
    }

    /// Terminate the listener recorded for `rule` and remove its handle.
    /// A missing handle or an already-gone process counts as success.
    pub fn stop(&self, rule: &KnockRule) -> Result<(), SupervisorError> {
        Self::require_root()?;
        self.stop_by_id(&rule.id())
    }

    /// Stop every persisted listener. Each handle is attempted
    /// independently; one failure never prevents the rest.
    pub fn stop_all(&self) -> Result<(), SupervisorError> {
        Self::require_root()?;

        let entries = match fs::read_dir(&self.conf.pid_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(SupervisorError::PidFile(e)),
        };

        let mut failed = 0usize;
        for entry in entries {
            let path = match entry {
                Ok(entry) => entry.path(),
                Err(e) => {
                    warn!(
                        event.name = "supervisor.stop_failed",
                        error = %e,
                        "cannot read pid directory entry, continuing"
                    );
                    failed += 1;
                    continue;
                }
            };

            if path.extension().and_then(|e| e.to_str()) != Some("pid") {
                continue;
            }
            let Some(rule_id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };

            if let Err(e) = self.stop_by_id(rule_id) {
                warn!(
                    event.name = "supervisor.stop_failed",
                    rule.id = %rule_id,
                    error = %e,
                    "failed to stop listener, continuing with the rest"
                );
                failed += 1;
            }
        }

        if failed > 0 {
            return Err(SupervisorError::StopAll { failed });
        }
        Ok(())
    }

    /// Known rule → handle mappings as last persisted. Liveness is whatever
    /// it was when the handle was recorded; nothing is re-probed here.
    pub fn list(&self) -> Result<Vec<ListenerHandle>, SupervisorError> {
        let entries = match fs::read_dir(&self.conf.pid_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(SupervisorError::PidFile(e)),
        };

        let mut handles = Vec::new();
        for entry in entries {
            let path = entry.map_err(SupervisorError::PidFile)?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("pid") {
                continue;
            }
            let Some(rule_id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };

            match handle::read_pid(&path) {
                Ok(pid) => handles.push(ListenerHandle {
                    rule_id: rule_id.to_string(),
                    pid,
                    log_file: self.conf.log_file.clone(),
                }),
                Err(e) => {
                    warn!(
                        event.name = "supervisor.unreadable_handle",
                        rule.id = %rule_id,
                        error = %e,
                        "skipping unreadable pid file"
                    );
                }
            }
        }
        Ok(handles)
    }

    fn stop_by_id(&self, rule_id: &str) -> Result<(), SupervisorError> {
        let pid_path = self.pid_path(rule_id);
        if !pid_path.exists() {
            debug!(
                event.name = "supervisor.stop_no_handle",
                rule.id = %rule_id,
                "no pid file, nothing to stop"
            );
            return Ok(());
        }

        let pid = handle::read_pid(&pid_path).map_err(SupervisorError::PidFile)?;
        handle::terminate(pid).map_err(SupervisorError::Signal)?;
        fs::remove_file(&pid_path).map_err(SupervisorError::PidFile)?;

        info!(
            event.name = "supervisor.listener_stopped",
            rule.id = %rule_id,
            process.pid = pid,
            "listener stopped and handle removed"
        );
        Ok(())
    }

    fn require_root() -> Result<(), SupervisorError> {
        if unsafe { libc::geteuid() } != 0 {
            return Err(SupervisorError::InsufficientPrivilege);
        }
        Ok(())
    }

    fn pid_path(&self, rule_id: &str) -> PathBuf {
        self.conf.pid_dir.join(format!("{rule_id}.pid"))
    }

    /// Command line handed to a listener for this rule.
    fn listener_args(rule: &KnockRule) -> Vec<String> {
        vec![
            "--port-list".to_string(),
            rule.port_sequence.to_string(),
            "--target-port".to_string(),
            rule.target_port.to_string(),
            "--passwd".to_string(),
            rule.password_hash.clone(),
            "--window".to_string(),
            rule.time_window.to_string(),
            "--timeout".to_string(),
            rule.timeout.to_string(),
            "--zone".to_string(),
            rule.zone.clone(),
        ]
    }
}

#[derive(Debug)]
pub enum SupervisorError {
    /// Spawning and signaling listeners requires root on the host.
    InsufficientPrivilege,
    InvalidRule(ConfigError),
    Spawn(io::Error),
    PidFile(io::Error),
    LogFile(io::Error),
    Signal(io::Error),
    /// The listener exited during the start probe window instead of
    /// staying up; its exit code classifies the failure.
    ListenerExited { rule_id: String, code: Option<i32> },
    /// `stop_all` attempted every handle; this many could not be stopped.
    StopAll { failed: usize },
}

impl fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SupervisorError::InsufficientPrivilege => {
                write!(f, "root privilege required to manage knock listeners")
            }
            SupervisorError::InvalidRule(e) => write!(f, "invalid rule: {e}"),
            SupervisorError::Spawn(e) => write!(f, "cannot spawn listener: {e}"),
            SupervisorError::PidFile(e) => write!(f, "pid file error: {e}"),
            SupervisorError::LogFile(e) => write!(f, "log file error: {e}"),
            SupervisorError::Signal(e) => write!(f, "cannot signal listener: {e}"),
            SupervisorError::ListenerExited {
                rule_id,
                code: Some(code),
            } => {
                write!(f, "listener for rule {rule_id} exited with status {code} during startup")
            }
            SupervisorError::ListenerExited { rule_id, code: None } => {
                write!(f, "listener for rule {rule_id} was killed during startup")
            }
            SupervisorError::StopAll { failed } => {
                write!(f, "failed to stop {failed} listener(s)")
            }
        }
    }
}

impl Error for SupervisorError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            SupervisorError::InvalidRule(e) => Some(e),
            SupervisorError::Spawn(e)
            | SupervisorError::PidFile(e)
            | SupervisorError::LogFile(e)
            | SupervisorError::Signal(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        env,
        time::{SystemTime, UNIX_EPOCH},
    };

    use knockgate_common::{KnockRule, RuleStatus};

    use super::*;

    fn unique_temp_dir(tag: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = env::temp_dir().join(format!("knockgate_sup_{nanos}_{tag}"));
        fs::create_dir_all(&dir).expect("create temp dir");
        dir
    }

    fn test_supervisor(tag: &str) -> Supervisor {
        let root = unique_temp_dir(tag);
        Supervisor::new(SupervisorConf {
            pid_dir: root.join("run"),
            log_file: root.join("log/knockd.log"),
            listener_bin: PathBuf::from("knockgate"),
            start_probe_ms: 10,
        })
        .expect("supervisor bootstraps in temp dir")
    }

    fn rule() -> KnockRule {
        KnockRule {
            port_sequence: "1201:TCP,2301:UDP,3401:TCP".parse().unwrap(),
            target_port: 22,
            time_window: 10,
            timeout: 30,
            password_hash: "5ebe2294ecd0e0f08eab7690d2a6ee69".to_string(),
            zone: "public".to_string(),
            status: RuleStatus::Enabled,
        }
    }

    #[test]
    fn new_bootstraps_runtime_directories() {
        let sup = test_supervisor("bootstrap");
        assert!(sup.conf().pid_dir.is_dir());
        assert!(sup.conf().log_file.is_file());

        let mode = fs::metadata(&sup.conf().pid_dir).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
        let mode = fs::metadata(&sup.conf().log_file).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);
    }

    #[test]
    fn stop_without_handle_is_success() {
        let sup = test_supervisor("stop_absent");
        assert!(sup.stop_by_id("deadbeef").is_ok());
    }

    #[test]
    fn stop_terminates_recorded_process_and_removes_handle() {
        let sup = test_supervisor("stop_live");
        let mut child = Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("spawn sleep child");

        let pid_path = sup.pid_path("abc123");
        handle::write_pid(&pid_path, child.id()).expect("write pid");

        sup.stop_by_id("abc123").expect("stop succeeds");
        assert!(!pid_path.exists());

        let status = child.wait().expect("child reaped");
        assert!(!status.success());
    }

    #[test]
    fn stop_with_stale_pid_still_removes_handle() {
        let sup = test_supervisor("stop_stale");
        let pid_path = sup.pid_path("stale");
        handle::write_pid(&pid_path, 99_999_999).expect("write pid");

        sup.stop_by_id("stale").expect("absent process tolerated");
        assert!(!pid_path.exists());
    }

    #[test]
    fn list_is_empty_without_handles() {
        let sup = test_supervisor("list_empty");
        assert!(sup.list().expect("list").is_empty());
    }

    #[test]
    fn list_tolerates_missing_pid_dir() {
        let sup = test_supervisor("list_missing");
        fs::remove_dir_all(&sup.conf().pid_dir).expect("remove pid dir");
        assert!(sup.list().expect("list").is_empty());
    }

    #[test]
    fn list_returns_persisted_handles() {
        let sup = test_supervisor("list_handles");
        handle::write_pid(&sup.pid_path("rule-a"), 101).unwrap();
        handle::write_pid(&sup.pid_path("rule-b"), 202).unwrap();
        // Non-pid files are not handles.
        fs::write(sup.conf().pid_dir.join("notes.txt"), "x").unwrap();

        let mut handles = sup.list().expect("list");
        handles.sort_by(|a, b| a.rule_id.cmp(&b.rule_id));

        assert_eq!(handles.len(), 2);
        assert_eq!(handles[0].rule_id, "rule-a");
        assert_eq!(handles[0].pid, 101);
        assert_eq!(handles[1].rule_id, "rule-b");
        assert_eq!(handles[1].pid, 202);
    }

    #[test]
    fn list_skips_unreadable_pid_files() {
        let sup = test_supervisor("list_unreadable");
        handle::write_pid(&sup.pid_path("good"), 303).unwrap();
        fs::write(sup.pid_path("bad"), "not-a-pid").unwrap();

        let handles = sup.list().expect("list");
        assert_eq!(handles.len(), 1);
        assert_eq!(handles[0].rule_id, "good");
    }

    #[test]
    fn listener_args_cover_the_invocation_surface() {
        let args = Supervisor::listener_args(&rule());
        assert_eq!(
            args,
            vec![
                "--port-list",
                "1201:TCP,2301:UDP,3401:TCP",
                "--target-port",
                "22",
                "--passwd",
                "5ebe2294ecd0e0f08eab7690d2a6ee69",
                "--window",
                "10",
                "--timeout",
                "30",
                "--zone",
                "public",
            ]
        );
    }

    #[test]
    fn pid_path_is_keyed_by_rule_id() {
        let sup = test_supervisor("pid_path");
        let path = sup.pid_path(&rule().id());
        assert_eq!(
            path.file_name().and_then(|n| n.to_str()),
            Some("c31ce0e425fa657c0d73ea7e894d668a.pid")
        );
    }
}
