use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a [`Connection`](super::Connection)
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Ready,
    Failed,
    Disconnecting,
    Cancelled,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Ready => "ready",
            ConnectionState::Failed => "failed",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Cancelled => "cancelled",
        }
    }

    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        matches!(
            (self, next),
            (Idle, Connecting)
                | (Idle, Cancelled)
                | (Connecting, Ready)
                | (Connecting, Failed)
                | (Connecting, Cancelled)
                | (Ready, Failed)
                | (Ready, Disconnecting)
                | (Failed, Connecting)
                | (Failed, Cancelled)
                | (Disconnecting, Cancelled)
                | (Cancelled, Connecting)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::ConnectionState::*;
    use super::*;

    const ALL: [ConnectionState; 6] = [Idle, Connecting, Ready, Failed, Disconnecting, Cancelled];

    #[test]
    fn test_reconnect_loop_allowed() {
        assert!(Ready.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Failed));
    }

    #[test]
    fn test_ready_only_reached_from_connecting() {
        for state in ALL {
            assert_eq!(state.can_transition_to(Ready), state == Connecting);
        }
    }

    #[test]
    fn test_every_live_state_can_be_cancelled() {
        for state in ALL {
            let direct = state.can_transition_to(Cancelled);
            let via_disconnecting =
                state.can_transition_to(Disconnecting) && Disconnecting.can_transition_to(Cancelled);
            assert_eq!(direct || via_disconnecting, state != Cancelled, "{}", state);
        }
    }

    #[test]
    fn test_cancelled_restarts_only_through_connecting() {
        for state in ALL {
            assert_eq!(Cancelled.can_transition_to(state), state == Connecting);
        }
    }

    #[test]
    fn test_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Disconnecting).unwrap(), "\"disconnecting\"");
    }
}
