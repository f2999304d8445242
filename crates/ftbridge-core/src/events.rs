//! Event system for UI decoupling.
//!
//! Sessions report lifecycle changes and bulk traffic through a
//! [`BridgeObserver`], so a CLI or other front end can follow along without
//! reaching into the session itself.

use std::fmt;

use crate::protocol::{ModemLines, SerialConfig};
use crate::transport::EndpointDirection;

/// Lifecycle of a port session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No claim held.
    Unclaimed,
    /// Interface claimed, UART not yet configured.
    Claimed,
    /// Serial parameters applied.
    Configured,
    /// Claim released; no further I/O.
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Unclaimed => write!(f, "Unclaimed"),
            SessionState::Claimed => write!(f, "Claimed"),
            SessionState::Configured => write!(f, "Configured"),
            SessionState::Closed => write!(f, "Closed"),
        }
    }
}

/// Events emitted by a port session.
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    /// Interface claimed.
    SessionOpened { vid: u16, pid: u16, interface: u8 },
    /// Lifecycle state changed.
    StateChanged { from: SessionState, to: SessionState },
    /// Baud rate, line format and flow control applied.
    Configured { config: SerialConfig },
    /// DTR/RTS driven.
    ModemLinesSet { lines: ModemLines },
    /// Bulk pipe opened on first use.
    PipeOpened {
        direction: EndpointDirection,
        address: u8,
    },
    /// Bulk payload sent or received.
    Packet {
        direction: EndpointDirection,
        length: usize,
        data: Option<Vec<u8>>,
    },
    /// Claim released.
    SessionClosed { vid: u16, pid: u16 },
}

/// Observer trait for receiving bridge events.
pub trait BridgeObserver: Send + Sync {
    fn on_event(&self, event: &BridgeEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl BridgeObserver for NullObserver {
    fn on_event(&self, _event: &BridgeEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl BridgeObserver for TracingObserver {
    fn on_event(&self, event: &BridgeEvent) {
        match event {
            BridgeEvent::SessionOpened {
                vid,
                pid,
                interface,
            } => {
                tracing::info!(
                    vid = %format!("{:04X}", vid),
                    pid = %format!("{:04X}", pid),
                    interface,
                    "Session opened"
                );
            }
            BridgeEvent::StateChanged { from, to } => {
                tracing::debug!(from = %from, to = %to, "State changed");
            }
            BridgeEvent::Configured { config } => {
                tracing::info!(config = %config, "Port configured");
            }
            BridgeEvent::ModemLinesSet { lines } => {
                tracing::debug!(dtr = lines.dtr, rts = lines.rts, "Modem lines set");
            }
            BridgeEvent::PipeOpened { direction, address } => {
                tracing::debug!(
                    direction = %direction,
                    endpoint = %format!("0x{:02X}", address),
                    "Pipe opened"
                );
            }
            BridgeEvent::Packet {
                direction,
                length,
                data,
            } => {
                let preview = data
                    .as_deref()
                    .map(|d| {
                        d.iter()
                            .take(16)
                            .map(|b| format!("{b:02X}"))
                            .collect::<Vec<_>>()
                            .join(" ")
                    })
                    .unwrap_or_default();
                tracing::trace!(direction = %direction, length, data = %preview, "Packet");
            }
            BridgeEvent::SessionClosed { vid, pid } => {
                tracing::info!(
                    vid = %format!("{:04X}", vid),
                    pid = %format!("{:04X}", pid),
                    "Session closed"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder(Mutex<Vec<String>>);

    impl BridgeObserver for Recorder {
        fn on_event(&self, event: &BridgeEvent) {
            self.0.lock().unwrap().push(format!("{event:?}"));
        }
    }

    #[test]
    fn test_state_display() {
        assert_eq!(SessionState::Configured.to_string(), "Configured");
        assert_eq!(SessionState::Closed.to_string(), "Closed");
    }

    #[test]
    fn test_observer_receives_events() {
        let recorder = Recorder(Mutex::new(Vec::new()));
        let observer: &dyn BridgeObserver = &recorder;
        observer.on_event(&BridgeEvent::StateChanged {
            from: SessionState::Claimed,
            to: SessionState::Configured,
        });
        TracingObserver.on_event(&BridgeEvent::Packet {
            direction: EndpointDirection::Out,
            length: 2,
            data: Some(vec![0x55, 0x02]),
        });

        let seen = recorder.0.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].contains("Configured"));
    }
}
