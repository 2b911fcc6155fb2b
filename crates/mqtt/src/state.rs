//! Observable broker-session and network-link states.
//!
//! The connection kernel publishes a [`ConnectionState`] on a watch channel
//! every time the session changes. The reachability probe publishes a
//! [`LinkState`] on another watch channel that the kernel listens to.
//!
//! ```
//! use stacklight_mqtt::ConnectionState;
//!
//! let state = ConnectionState::Reconnecting(4.0);
//! assert_eq!(state.to_string(), "Reconnecting (in 4 seconds)");
//! assert!(!state.is_connected());
//! ```

use std::fmt;

/// Lifecycle of the broker session.
///
/// ```text
/// Connecting -> Connected -> Disconnected(reason) -> Reconnecting(secs) -> Connecting ...
///            \-> Suspended (link down) -> Connecting (link up)
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// CONNECT sent or about to be sent, waiting for CONNACK.
    Connecting,

    /// CONNACK accepted. The only state in which publishes are handed to the client.
    Connected,

    /// Session lost. Carries the root-cause message.
    Disconnected(String),

    /// Sleeping before the next attempt. Carries the pause in seconds.
    Reconnecting(f64),

    /// The reachability probe reported the network down; the kernel has
    /// dropped the socket and stopped polling until the link comes back.
    Suspended,
}

impl ConnectionState {
    /// Short static name, for logs and the live readout.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Disconnected(_) => "Disconnected",
            ConnectionState::Reconnecting(_) => "Reconnecting",
            ConnectionState::Suspended => "Suspended",
        }
    }

    /// Reason for `Disconnected`, pause for `Reconnecting`, empty otherwise.
    pub fn details(&self) -> String {
        match self {
            ConnectionState::Disconnected(reason) => reason.clone(),
            ConnectionState::Reconnecting(seconds) => format!("in {seconds} seconds"),
            _ => String::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())?;
        let details = self.details();
        if !details.is_empty() {
            write!(f, " ({details})")?;
        }
        Ok(())
    }
}

/// Reachability of the broker network as seen by an external probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkState {
    #[default]
    Up,
    Down,
}

impl LinkState {
    pub fn is_up(self) -> bool {
        matches!(self, LinkState::Up)
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Up => f.write_str("up"),
            LinkState::Down => f.write_str("down"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_as_str() {
        assert_eq!(ConnectionState::Connecting.as_str(), "Connecting");
        assert_eq!(ConnectionState::Connected.as_str(), "Connected");
        assert_eq!(
            ConnectionState::Disconnected("x".into()).as_str(),
            "Disconnected"
        );
        assert_eq!(ConnectionState::Reconnecting(1.0).as_str(), "Reconnecting");
        assert_eq!(ConnectionState::Suspended.as_str(), "Suspended");
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Connected.to_string(), "Connected");
        assert_eq!(ConnectionState::Suspended.to_string(), "Suspended");
        assert_eq!(
            ConnectionState::Reconnecting(2.0).to_string(),
            "Reconnecting (in 2 seconds)"
        );
        assert_eq!(
            ConnectionState::Disconnected("broker closed".into()).to_string(),
            "Disconnected (broker closed)"
        );
    }

    #[test]
    fn test_is_connected() {
        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::Suspended.is_connected());
        assert!(!ConnectionState::Reconnecting(1.0).is_connected());
    }

    #[test]
    fn test_link_state() {
        assert_eq!(LinkState::default(), LinkState::Up);
        assert!(LinkState::Up.is_up());
        assert!(!LinkState::Down.is_up());
        assert_eq!(LinkState::Down.to_string(), "down");
    }
}
