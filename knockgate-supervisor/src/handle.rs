//! Persisted listener process handles.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

/// Runtime record for one supervised listener, as recorded when it was
/// started or last listed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerHandle {
    pub rule_id: String,
    pub pid: u32,
    pub log_file: PathBuf,
}

pub(crate) fn read_pid(path: &Path) -> io::Result<u32> {
    let raw = fs::read_to_string(path)?;
    raw.trim().parse::<u32>().map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid pid file {}: {e}", path.display()),
        )
    })
}

pub(crate) fn write_pid(path: &Path, pid: u32) -> io::Result<()> {
    fs::write(path, format!("{pid}\n"))
}

/// True when a process with this pid exists. `EPERM` counts as alive: the
/// process is there, we just do not own it.
pub(crate) fn process_alive(pid: u32) -> bool {
    let ret = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if ret == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Send SIGTERM. A process that is already gone is not an error.
pub(crate) fn terminate(pid: u32) -> io::Result<()> {
    let ret = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if ret == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(err)
    }
}
