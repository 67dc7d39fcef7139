//! Decoding of captured frames into the one shape the state machine
//! understands.
//!
//! The capture filter already narrows traffic to TCP/UDP destined for the
//! knock ports, so everything else is dropped here without ceremony. Only
//! IPv4 is inspected: the grant the knock ultimately buys is an
//! `family="ipv4"` firewall rule, so there is nothing useful to observe on
//! other network layers.

use std::net::IpAddr;

use etherparse::{InternetSlice, SlicedPacket, TransportSlice};
use knockgate_common::{KnockStep, Protocol};

/// Transport half of a knock packet, normalized before it reaches the
/// state machine so nothing downstream branches on the protocol again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    Tcp { port: u16, payload: Vec<u8> },
    Udp { port: u16, payload: Vec<u8> },
}

impl Transport {
    pub fn protocol(&self) -> Protocol {
        match self {
            Transport::Tcp { .. } => Protocol::Tcp,
            Transport::Udp { .. } => Protocol::Udp,
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Transport::Tcp { port, .. } | Transport::Udp { port, .. } => *port,
        }
    }

    pub fn payload(&self) -> &[u8] {
        match self {
            Transport::Tcp { payload, .. } | Transport::Udp { payload, .. } => payload,
        }
    }

    /// The `(port, protocol)` pair this packet represents, for comparison
    /// against a sequence entry.
    pub fn step(&self) -> KnockStep {
        KnockStep {
            port: self.port(),
            protocol: self.protocol(),
        }
    }
}

/// A single observed knock attempt: who sent it and what they hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnockPacket {
    pub src_addr: IpAddr,
    pub transport: Transport,
}

/// Decode a raw Ethernet frame into a [`KnockPacket`].
///
/// Returns `None` for anything that is not IPv4 TCP/UDP; malformed frames
/// are silently dropped the same way.
pub fn decode_frame(data: &[u8]) -> Option<KnockPacket> {
    let sliced = match SlicedPacket::from_ethernet(data) {
        Ok(s) => s,
        Err(_) => return None,
    };

    let src_addr = match sliced.ip {
        Some(InternetSlice::Ipv4(header, _)) => IpAddr::V4(header.source_addr()),
        _ => return None,
    };

    let transport = match sliced.transport {
        Some(TransportSlice::Tcp(tcp)) => Transport::Tcp {
            port: tcp.destination_port(),
            payload: sliced.payload.to_vec(),
        },
        Some(TransportSlice::Udp(udp)) => Transport::Udp {
            port: udp.destination_port(),
            payload: sliced.payload.to_vec(),
        },
        _ => return None,
    };

    Some(KnockPacket {
        src_addr,
        transport,
    })
}
