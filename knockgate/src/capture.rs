//! Live capture bound to a single knock rule.
//!
//! The filter admits only TCP/UDP traffic destined to the ports referenced
//! by the rule's sequence, so the state machine never sees unrelated
//! traffic. Capture is non-promiscuous and streaming: frames are decoded,
//! delivered, and dropped.

use std::{
    error::Error,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Instant,
};

use knockgate_common::KnockSequence;
use pcap::{Active, Capture, Device};
use tracing::info;

use crate::{knock::KnockStateMachine, packet};

/// Read timeout in milliseconds. The capture loop wakes at least this often
/// to observe the shutdown flag.
const CAPTURE_POLL_MS: i32 = 200;

/// BPF program matching the union of ports in the sequence, e.g.
/// `(tcp or udp) and (dst port 1201 or 2301 or 3401)`.
pub fn build_filter(sequence: &KnockSequence) -> String {
    let ports: Vec<String> = sequence.ports().iter().map(|p| p.to_string()).collect();
    format!("(tcp or udp) and (dst port {})", ports.join(" or "))
}

pub struct Listener {
    device: Option<String>,
    filter: String,
    shutdown: Arc<AtomicBool>,
}

impl Listener {
    pub fn new(device: Option<String>, filter: String, shutdown: Arc<AtomicBool>) -> Self {
        Self {
            device,
            filter,
            shutdown,
        }
    }

    /// Capture until the shutdown flag is raised, delivering every decoded
    /// frame to the state machine in capture order.
    pub fn run(&self, machine: &KnockStateMachine) -> Result<(), CaptureError> {
        let mut cap = self.open()?;

        info!(
            event.name = "listener.capture_started",
            capture.filter = %self.filter,
            capture.device = self.device.as_deref().unwrap_or("<default>"),
            "live capture running"
        );

        while !self.shutdown.load(Ordering::Relaxed) {
            match cap.next_packet() {
                Ok(pkt) => {
                    if let Some(knock) = packet::decode_frame(pkt.data) {
                        machine.process_packet(&knock, Instant::now());
                    }
                }
                // Read timeout: woke up to check the shutdown flag.
                Err(pcap::Error::TimeoutExpired) => continue,
                Err(e) => return Err(CaptureError::Read(e)),
            }
        }

        info!(
            event.name = "listener.capture_stopped",
            "capture loop exited on shutdown"
        );
        Ok(())
    }

    fn open(&self) -> Result<Capture<Active>, CaptureError> {
        let inactive = match &self.device {
            Some(name) => Capture::from_device(name.as_str()).map_err(CaptureError::Open)?,
            None => {
                let device = Device::lookup()
                    .map_err(CaptureError::Open)?
                    .ok_or(CaptureError::NoDevice)?;
                Capture::from_device(device).map_err(CaptureError::Open)?
            }
        };

        let mut cap = inactive
            .promisc(false)
            .timeout(CAPTURE_POLL_MS)
            .open()
            .map_err(CaptureError::Open)?;

        cap.filter(&self.filter, true)
            .map_err(CaptureError::Filter)?;

        Ok(cap)
    }
}

#[derive(Debug)]
pub enum CaptureError {
    NoDevice,
    Open(pcap::Error),
    Filter(pcap::Error),
    Read(pcap::Error),
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureError::NoDevice => write!(f, "no capture device available"),
            CaptureError::Open(e) => write!(f, "cannot open capture: {e}"),
            CaptureError::Filter(e) => write!(f, "cannot apply capture filter: {e}"),
            CaptureError::Read(e) => write!(f, "capture read failed: {e}"),
        }
    }
}

impl Error for CaptureError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            CaptureError::NoDevice => None,
            CaptureError::Open(e) | CaptureError::Filter(e) | CaptureError::Read(e) => Some(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_covers_every_sequence_port() {
        let seq: KnockSequence = "1201:TCP,2301:UDP,3401:TCP".parse().unwrap();
        assert_eq!(
            build_filter(&seq),
            "(tcp or udp) and (dst port 1201 or 2301 or 3401)"
        );
    }

    #[test]
    fn filter_deduplicates_repeated_ports() {
        let seq: KnockSequence = "1201:TCP,1201:UDP,2301:TCP".parse().unwrap();
        assert_eq!(build_filter(&seq), "(tcp or udp) and (dst port 1201 or 2301)");
    }

    #[test]
    fn filter_handles_single_step_sequences() {
        let seq: KnockSequence = "9000:UDP".parse().unwrap();
        assert_eq!(build_filter(&seq), "(tcp or udp) and (dst port 9000)");
    }
}
