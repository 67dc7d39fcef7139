mod capture;
mod cli;
mod error;
mod firewall;
mod knock;
mod packet;

use std::{
    process,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use clap::Parser;
use knockgate_common::{ConfigError, KnockSequence};
use tokio::{
    runtime::Handle,
    signal,
    signal::unix::{SignalKind, signal as unix_signal},
    sync::Mutex,
};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, filter::LevelFilter};

use crate::{
    capture::Listener,
    cli::Cli,
    error::ListenerError,
    firewall::{FirewallManager, FirewalldBackend},
    knock::{KnockStateMachine, ListenerState},
};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::from_level(cli.log_level).into())
                .from_env_lossy(),
        )
        .init();

    if let Err(e) = run(cli).await {
        error!(
            event.name = "listener.fatal",
            error = %e,
            exit_code = e.exit_code(),
            "listener terminating"
        );
        process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<(), ListenerError> {
    // Privilege gate before any capture or firewall action.
    if unsafe { libc::geteuid() } != 0 {
        return Err(ListenerError::MissingPrivilege);
    }

    let sequence: KnockSequence = cli.port_list.parse()?;
    if cli.window == 0 {
        return Err(ConfigError::ZeroWindow.into());
    }
    if cli.timeout == 0 {
        return Err(ConfigError::ZeroTimeout.into());
    }
    if cli.password_hash.is_empty() {
        return Err(ConfigError::EmptyPasswordHash.into());
    }

    info!(
        event.name = "listener.starting",
        knock.sequence = %sequence,
        network.target_port = cli.target_port,
        knock.window_secs = cli.window,
        grant.ttl_secs = cli.timeout,
        firewall.zone = %cli.zone,
        "knock listener starting"
    );

    let state = Arc::new(Mutex::new(ListenerState::default()));
    let firewall = FirewallManager::new(
        cli.zone.clone(),
        cli.target_port,
        Duration::from_secs(cli.timeout),
        Arc::new(FirewalldBackend),
        Arc::clone(&state),
        Handle::current(),
    );
    let machine = KnockStateMachine::new(
        sequence.clone(),
        Duration::from_secs(cli.window),
        cli.password_hash.clone(),
        Arc::clone(&state),
        firewall,
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    let listener = Listener::new(
        cli.iface.clone(),
        capture::build_filter(&sequence),
        Arc::clone(&shutdown),
    );

    let mut capture_task = tokio::task::spawn_blocking(move || listener.run(&machine));

    let mut sigterm = unix_signal(SignalKind::terminate())
        .map_err(|e| ListenerError::Runtime(format!("cannot install SIGTERM handler: {e}")))?;

    tokio::select! {
        res = &mut capture_task => {
            let res = res
                .map_err(|e| ListenerError::Runtime(format!("capture task failed: {e}")))?;
            res?;
        }
        _ = signal::ctrl_c() => {
            info!(event.name = "listener.signal", "interrupt received, shutting down");
            shutdown.store(true, Ordering::Relaxed);
            let _ = capture_task.await;
        }
        _ = sigterm.recv() => {
            info!(event.name = "listener.signal", "termination requested, shutting down");
            shutdown.store(true, Ordering::Relaxed);
            let _ = capture_task.await;
        }
    }

    Ok(())
}
