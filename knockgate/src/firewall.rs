//! Firewall grant lifecycle for one listener.
//!
//! A completed knock buys the client a rich rule in the host firewall,
//! opening the rule's target port for exactly that source address. Grants
//! expire on their own detached timer; the grant set is the sole source of
//! truth for "is this address currently authorized".
//!
//! The OS side sits behind [`FirewallBackend`] so the state machine can be
//! exercised without a running firewalld.

use std::{
    borrow::Cow,
    error::Error,
    fmt,
    net::IpAddr,
    process::Command,
    sync::Arc,
    time::Duration,
};

use shell_escape::escape;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::knock::ListenerState;

/// Issues the host firewall commands backing grant activation and removal.
pub trait FirewallBackend: Send + Sync {
    fn add_rule(&self, addr: IpAddr, port: u16, zone: &str) -> Result<(), FirewallCommandError>;
    fn remove_rule(&self, addr: IpAddr, port: u16, zone: &str) -> Result<(), FirewallCommandError>;
}

/// Rich rule text for one grant.
///
/// The rule is always `protocol="tcp"`, independent of which transports
/// appeared in the knock sequence; the knock only proves identity, the
/// opened service is TCP. Address and port are shell-escaped before
/// substitution.
pub fn rich_rule(addr: IpAddr, port: u16) -> String {
    let ip = escape(Cow::Owned(addr.to_string()));
    let port = escape(Cow::Owned(port.to_string()));
    format!(
        r#"rule family="ipv4" source address="{ip}" port port="{port}" protocol="tcp" accept"#
    )
}

/// Production backend driving `firewall-cmd`.
pub struct FirewalldBackend;

impl FirewalldBackend {
    fn run(
        verb: &'static str,
        addr: IpAddr,
        port: u16,
        zone: &str,
    ) -> Result<(), FirewallCommandError> {
        let status = Command::new("firewall-cmd")
            .arg(format!("--zone={zone}"))
            .arg(verb)
            .arg(rich_rule(addr, port))
            .status()
            .map_err(FirewallCommandError::Spawn)?;

        if status.success() {
            Ok(())
        } else {
            Err(FirewallCommandError::Exit {
                verb,
                code: status.code(),
            })
        }
    }
}

impl FirewallBackend for FirewalldBackend {
    fn add_rule(&self, addr: IpAddr, port: u16, zone: &str) -> Result<(), FirewallCommandError> {
        Self::run("--add-rich-rule", addr, port, zone)
    }

    fn remove_rule(&self, addr: IpAddr, port: u16, zone: &str) -> Result<(), FirewallCommandError> {
        Self::run("--remove-rich-rule", addr, port, zone)
    }
}

/// Manages grant activation and scheduled expiry for one rule.
pub struct FirewallManager {
    zone: String,
    target_port: u16,
    grant_ttl: Duration,
    backend: Arc<dyn FirewallBackend>,
    state: Arc<Mutex<ListenerState>>,
    runtime: tokio::runtime::Handle,
}

impl FirewallManager {
    pub fn new(
        zone: String,
        target_port: u16,
        grant_ttl: Duration,
        backend: Arc<dyn FirewallBackend>,
        state: Arc<Mutex<ListenerState>>,
        runtime: tokio::runtime::Handle,
    ) -> Self {
        Self {
            zone,
            target_port,
            grant_ttl,
            backend,
            state,
            runtime,
        }
    }

    /// Open the target port for `addr`.
    ///
    /// Called with the listener lock held; the firewall command completes
    /// before any further packet from this listener is processed. Idempotent
    /// against the grant set: an already-granted pair is a no-op with no OS
    /// call. On command failure the grant is not registered, so a later
    /// knock can retry.
    pub fn activate(&self, state: &mut ListenerState, addr: IpAddr) {
        let key = (addr, self.target_port);
        if state.grants.contains(&key) {
            debug!(
                event.name = "firewall.grant_already_active",
                client.address = %addr,
                network.port = self.target_port,
                "grant already active, skipping firewall command"
            );
            return;
        }

        match self.backend.add_rule(addr, self.target_port, &self.zone) {
            Ok(()) => {
                state.grants.insert(key);
                info!(
                    event.name = "firewall.grant_added",
                    client.address = %addr,
                    network.port = self.target_port,
                    firewall.zone = %self.zone,
                    grant.ttl_secs = self.grant_ttl.as_secs(),
                    "target port opened for client"
                );
                self.schedule_expiry(addr);
            }
            Err(e) => {
                warn!(
                    event.name = "firewall.add_failed",
                    client.address = %addr,
                    network.port = self.target_port,
                    error = %e,
                    "firewall command failed, grant not registered"
                );
            }
        }
    }

    /// Detached expiry timer for one successful activation. Every
    /// activation gets its own timer; timers for the same pair are not
    /// collapsed. Removal runs off the capture path and the pair is
    /// discarded from the grant set whatever the command outcome.
    fn schedule_expiry(&self, addr: IpAddr) {
        let backend = Arc::clone(&self.backend);
        let state = Arc::clone(&self.state);
        let zone = self.zone.clone();
        let port = self.target_port;
        let ttl = self.grant_ttl;

        self.runtime.spawn(async move {
            tokio::time::sleep(ttl).await;

            let command_zone = zone.clone();
            let outcome = tokio::task::spawn_blocking(move || {
                backend.remove_rule(addr, port, &command_zone)
            })
            .await;

            match outcome {
                Ok(Ok(())) => {
                    info!(
                        event.name = "firewall.grant_removed",
                        client.address = %addr,
                        network.port = port,
                        firewall.zone = %zone,
                        "expired grant removed from firewall"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        event.name = "firewall.remove_failed",
                        client.address = %addr,
                        network.port = port,
                        error = %e,
                        "firewall removal failed, discarding grant anyway"
                    );
                }
                Err(e) => {
                    warn!(
                        event.name = "firewall.remove_failed",
                        client.address = %addr,
                        network.port = port,
                        error = %e,
                        "firewall removal task failed, discarding grant anyway"
                    );
                }
            }

            state.lock().await.grants.remove(&(addr, port));
        });
    }
}

#[derive(Debug)]
pub enum FirewallCommandError {
    Spawn(std::io::Error),
    Exit {
        verb: &'static str,
        code: Option<i32>,
    },
}

impl fmt::Display for FirewallCommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FirewallCommandError::Spawn(e) => write!(f, "cannot spawn firewall-cmd: {e}"),
            FirewallCommandError::Exit { verb, code: Some(code) } => {
                write!(f, "firewall-cmd {verb} exited with status {code}")
            }
            FirewallCommandError::Exit { verb, code: None } => {
                write!(f, "firewall-cmd {verb} terminated by signal")
            }
        }
    }
}

impl Error for FirewallCommandError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            FirewallCommandError::Spawn(e) => Some(e),
            FirewallCommandError::Exit { .. } => None,
        }
    }
}
