use serde::{Deserialize, Serialize};

/// Controller lifecycle state.
///
/// Transitions follow the generic NVMe host rules restricted to the states this engine uses:
///
/// ```text
/// New ──► Resetting ──► Connecting ──► Live
///  │          ▲  │          │           │
///  │          └──┼──────────┼───────────┘ (reset from Live)
///  └─────────────┴──────────┴──► Deleting
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CtrlState {
    /// Probed, never reset.
    New,
    Resetting,
    Connecting,
    Live,
    /// Terminal. Entered on removal or after a failed reset.
    Deleting,
}

impl CtrlState {
    pub fn can_transition_to(self, next: CtrlState) -> bool {
        use CtrlState::*;
        matches!(
            (self, next),
            (New | Live, Resetting)
                | (Resetting, Connecting)
                | (Connecting, Live)
                | (New | Resetting | Connecting | Live, Deleting)
        )
    }

    /// States in which the block layer may still have requests queued against the device.
    pub(crate) fn admits_io(self) -> bool {
        matches!(self, CtrlState::Live | CtrlState::Resetting)
    }
}

#[cfg(test)]
mod tests {
    use super::CtrlState::*;

    #[test]
    fn reset_only_from_new_or_live() {
        assert!(New.can_transition_to(Resetting));
        assert!(Live.can_transition_to(Resetting));
        assert!(!Resetting.can_transition_to(Resetting));
        assert!(!Connecting.can_transition_to(Resetting));
        assert!(!Deleting.can_transition_to(Resetting));
    }

    #[test]
    fn deleting_is_terminal() {
        for next in [New, Resetting, Connecting, Live, Deleting] {
            assert!(!Deleting.can_transition_to(next), "{next:?}");
        }
    }

    #[test]
    fn connect_path() {
        assert!(Resetting.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Live));
        assert!(!Resetting.can_transition_to(Live));
        assert!(!New.can_transition_to(Live));
    }
}
