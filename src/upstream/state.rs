//! Upstream pusher states
//!
//! ```text
//!   DISABLED ──enable──► CONNECTING ──overrun──► WAITING ◄──────┐
//!                                                   │ underrun   │ no data
//!                                                   ▼            │ within 5 s
//!                         ┌───────────────── TRANSMITTING ───────┘
//!          5 overruns     │ adaptive off           │ adaptive on
//!                         ▼                        ▼
//!                      OVERLOAD ──20 s──►     ADJUSTING ──20 s──► TRANSMITTING
//! ```
//!
//! FAILED is only ever announced, right before the pusher goes DISABLED.

/// State of the upstream pusher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum UpstreamState {
    #[default]
    Disabled,
    Connecting,
    Waiting,
    Transmitting,
    Overload,
    Adjusting,
    /// Notification-only: the peer went away
    Failed,
}

impl UpstreamState {
    /// Numeric code published to observers
    pub fn code(&self) -> i32 {
        match self {
            UpstreamState::Disabled => 0,
            UpstreamState::Connecting => 1,
            UpstreamState::Waiting => 2,
            UpstreamState::Transmitting => 3,
            UpstreamState::Overload => 4,
            UpstreamState::Adjusting => 5,
            UpstreamState::Failed => 9,
        }
    }

    /// True from CONNECTING until the pusher is disabled again
    pub fn is_enabled(&self) -> bool {
        !matches!(self, UpstreamState::Disabled | UpstreamState::Failed)
    }
}

impl std::fmt::Display for UpstreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            UpstreamState::Disabled => "DISABLED",
            UpstreamState::Connecting => "CONNECTING",
            UpstreamState::Waiting => "WAITING",
            UpstreamState::Transmitting => "TRANSMITTING",
            UpstreamState::Overload => "OVERLOAD",
            UpstreamState::Adjusting => "ADJUSTING",
            UpstreamState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(UpstreamState::Disabled.code(), 0);
        assert_eq!(UpstreamState::Adjusting.code(), 5);
        assert_eq!(UpstreamState::Failed.code(), 9);
    }

    #[test]
    fn test_enabled() {
        assert!(!UpstreamState::Disabled.is_enabled());
        assert!(!UpstreamState::Failed.is_enabled());
        assert!(UpstreamState::Connecting.is_enabled());
        assert!(UpstreamState::Overload.is_enabled());
    }
}
