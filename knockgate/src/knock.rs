//! The knock authentication state machine.
//!
//! One machine guards one rule. Every captured packet is evaluated against
//! the per-client session table: a packet matching the first sequence step
//! opens a session, each subsequent packet must hit the next step within the
//! time window, and the final step must carry the rule's password in its
//! payload. Completion opens the firewall for the client; any deviation
//! silently destroys the session. Nothing is ever answered on the network —
//! to an unauthenticated peer the host looks identical before, during, and
//! after a failed knock.

use std::{
    collections::{HashMap, HashSet},
    net::IpAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use knockgate_common::KnockSequence;
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

use crate::{firewall::FirewallManager, packet::KnockPacket};

/// Progress of one client through the knock sequence. `step` is the index
/// of the next expected sequence entry; `started_at` resets on every valid
/// advance.
#[derive(Debug, Clone, Copy)]
pub struct ClientSession {
    pub step: usize,
    pub started_at: Instant,
}

/// All mutable state owned by one listener: the session table the capture
/// path drives, and the grant set the expiry timers also mutate. Both live
/// behind a single lock so a timer firing can never interleave with a
/// half-processed packet.
#[derive(Debug, Default)]
pub struct ListenerState {
    pub sessions: HashMap<IpAddr, ClientSession>,
    pub grants: HashSet<(IpAddr, u16)>,
}

pub struct KnockStateMachine {
    sequence: KnockSequence,
    window: Duration,
    password_hash: String,
    state: Arc<Mutex<ListenerState>>,
    firewall: FirewallManager,
}

impl KnockStateMachine {
    pub fn new(
        sequence: KnockSequence,
        window: Duration,
        password_hash: String,
        state: Arc<Mutex<ListenerState>>,
        firewall: FirewallManager,
    ) -> Self {
        Self {
            sequence,
            window,
            password_hash,
            state,
            firewall,
        }
    }

    /// Evaluate one captured packet at observation time `now`.
    ///
    /// Runs on the capture thread; packets from one listener are processed
    /// strictly sequentially. Rejections destroy the offending session and
    /// are logged only — no error escapes a single packet's processing.
    pub fn process_packet(&self, pkt: &KnockPacket, now: Instant) {
        let mut state = self.state.blocking_lock();

        trace!(
            event.name = "knock.packet_observed",
            client.address = %pkt.src_addr,
            network.transport = %pkt.transport.protocol(),
            network.port = pkt.transport.port(),
            payload_len = pkt.transport.payload().len(),
            "packet delivered to state machine"
        );

        let observed = pkt.transport.step();

        let Some(session) = state.sessions.get(&pkt.src_addr).copied() else {
            if observed != self.sequence.first() {
                // Not a knock opening; no state change, not an error.
                return;
            }

            if self.sequence.len() == 1 {
                // Single-step rule: the opening packet is also the
                // password-bearing packet, verified in the same pass.
                if !self.password_matches(pkt.transport.payload()) {
                    warn!(
                        event.name = "knock.auth_failed",
                        client.address = %pkt.src_addr,
                        "password mismatch on final step"
                    );
                    return;
                }
                info!(
                    event.name = "knock.sequence_complete",
                    client.address = %pkt.src_addr,
                    "knock sequence completed"
                );
                self.firewall.activate(&mut state, pkt.src_addr);
                return;
            }

            state.sessions.insert(
                pkt.src_addr,
                ClientSession {
                    step: 1,
                    started_at: now,
                },
            );
            info!(
                event.name = "knock.session_opened",
                client.address = %pkt.src_addr,
                "client matched first knock step"
            );
            return;
        };

        if now.duration_since(session.started_at) > self.window {
            state.sessions.remove(&pkt.src_addr);
            warn!(
                event.name = "knock.session_timeout",
                client.address = %pkt.src_addr,
                knock.step = session.step,
                "time window exceeded, session destroyed"
            );
            // The packet that exposed the timeout is consumed, not
            // re-evaluated against the fresh state.
            return;
        }

        let expected = self.sequence.steps()[session.step];
        if observed != expected {
            state.sessions.remove(&pkt.src_addr);
            warn!(
                event.name = "knock.sequence_violation",
                client.address = %pkt.src_addr,
                knock.expected = %expected,
                knock.observed = %observed,
                "unexpected step, session destroyed"
            );
            return;
        }

        if session.step == self.sequence.len() - 1
            && !self.password_matches(pkt.transport.payload())
        {
            state.sessions.remove(&pkt.src_addr);
            warn!(
                event.name = "knock.auth_failed",
                client.address = %pkt.src_addr,
                "password mismatch on final step"
            );
            return;
        }

        let advanced = ClientSession {
            step: session.step + 1,
            started_at: now,
        };

        if advanced.step == self.sequence.len() {
            state.sessions.remove(&pkt.src_addr);
            info!(
                event.name = "knock.sequence_complete",
                client.address = %pkt.src_addr,
                "knock sequence completed"
            );
            self.firewall.activate(&mut state, pkt.src_addr);
        } else {
            state.sessions.insert(pkt.src_addr, advanced);
            debug!(
                event.name = "knock.step_advanced",
                client.address = %pkt.src_addr,
                knock.step = advanced.step,
                "client advanced to next step"
            );
        }
    }

    fn password_matches(&self, payload: &[u8]) -> bool {
        // Plain byte equality; the payload is an already-hashed opaque
        // token, not the secret itself.
        normalize_payload(payload) == self.password_hash.as_bytes()
    }
}

/// Strip embedded NUL bytes and surrounding ASCII whitespace from a final
/// knock payload. Clients pad or newline-terminate the password packet
/// depending on how they were generated.
fn normalize_payload(raw: &[u8]) -> Vec<u8> {
    let cleaned: Vec<u8> = raw.iter().copied().filter(|b| *b != 0).collect();
    let start = cleaned.iter().position(|b| !b.is_ascii_whitespace());
    let end = cleaned.iter().rposition(|b| !b.is_ascii_whitespace());
    match (start, end) {
        (Some(start), Some(end)) => cleaned[start..=end].to_vec(),
        _ => Vec::new(),
    }
}
