use parking_lot::Mutex;

/// Connection lifecycle states.
///
/// `Failed` is transient, never terminal: an unhandled error during open or
/// steady-state I/O reports `Failed` and is always followed by
/// `Closing -> Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Closed,
    Opening,
    Opened,
    Closing,
    Failed,
}

/// Open/close state machine, independent of the transport.
///
/// Only one open/close cycle may be in flight: `try_begin_open` succeeds
/// only from `Closed`, `try_begin_close` only while running or failed, so
/// concurrent open/close attempts collapse into no-ops for the losers.
#[derive(Debug)]
pub struct Lifecycle {
    state: Mutex<ChannelState>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Lifecycle::new()
    }
}

impl Lifecycle {
    pub fn new() -> Lifecycle {
        Lifecycle {
            state: Mutex::new(ChannelState::Closed),
        }
    }

    pub fn state(&self) -> ChannelState {
        *self.state.lock()
    }

    /// Opening or Opened.
    pub fn is_running(&self) -> bool {
        matches!(self.state(), ChannelState::Opening | ChannelState::Opened)
    }

    pub fn is_opened(&self) -> bool {
        self.state() == ChannelState::Opened
    }

    /// `Closed -> Opening`; false (no-op) from any other state.
    pub fn try_begin_open(&self) -> bool {
        let mut state = self.state.lock();
        if *state == ChannelState::Closed {
            *state = ChannelState::Opening;
            true
        } else {
            false
        }
    }

    /// `Opening -> Opened`.
    pub fn mark_opened(&self) -> bool {
        let mut state = self.state.lock();
        if *state == ChannelState::Opening {
            *state = ChannelState::Opened;
            true
        } else {
            false
        }
    }

    /// Any state except Closed/Closing -> `Failed`. The first caller wins;
    /// a connection already failed or on its way down stays put.
    pub fn mark_failed(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            ChannelState::Closed | ChannelState::Closing | ChannelState::Failed => false,
            _ => {
                *state = ChannelState::Failed;
                true
            }
        }
    }

    /// `Opening | Opened | Failed -> Closing`; false (no-op) when not
    /// running.
    pub fn try_begin_close(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            ChannelState::Opening | ChannelState::Opened | ChannelState::Failed => {
                *state = ChannelState::Closing;
                true
            }
            _ => false,
        }
    }

    /// `Closing -> Closed`.
    pub fn mark_closed(&self) -> bool {
        let mut state = self.state.lock();
        if *state == ChannelState::Closing {
            *state = ChannelState::Closed;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_close_cycle() {
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.state(), ChannelState::Closed);
        assert!(lifecycle.try_begin_open());
        assert!(lifecycle.is_running());
        assert!(lifecycle.mark_opened());
        assert!(lifecycle.is_opened());
        assert!(lifecycle.try_begin_close());
        assert!(!lifecycle.is_running());
        assert!(lifecycle.mark_closed());
        assert_eq!(lifecycle.state(), ChannelState::Closed);
    }

    #[test]
    fn test_reopen_after_close() {
        let lifecycle = Lifecycle::new();
        assert!(lifecycle.try_begin_open());
        assert!(lifecycle.mark_opened());
        assert!(lifecycle.try_begin_close());
        assert!(lifecycle.mark_closed());
        assert!(lifecycle.try_begin_open());
    }

    #[test]
    fn test_second_open_is_a_no_op() {
        let lifecycle = Lifecycle::new();
        assert!(lifecycle.try_begin_open());
        assert!(!lifecycle.try_begin_open());
        lifecycle.mark_opened();
        assert!(!lifecycle.try_begin_open());
    }

    #[test]
    fn test_close_when_not_running_is_a_no_op() {
        let lifecycle = Lifecycle::new();
        assert!(!lifecycle.try_begin_close());
        lifecycle.try_begin_open();
        lifecycle.mark_opened();
        lifecycle.try_begin_close();
        // second close attempt loses
        assert!(!lifecycle.try_begin_close());
    }

    #[test]
    fn test_failed_is_transient() {
        let lifecycle = Lifecycle::new();
        lifecycle.try_begin_open();
        assert!(lifecycle.mark_failed());
        assert_eq!(lifecycle.state(), ChannelState::Failed);
        // failed must still close down
        assert!(lifecycle.try_begin_close());
        assert!(lifecycle.mark_closed());
        assert_eq!(lifecycle.state(), ChannelState::Closed);
    }

    #[test]
    fn test_failed_does_not_fire_twice() {
        let lifecycle = Lifecycle::new();
        lifecycle.try_begin_open();
        assert!(lifecycle.mark_failed());
        assert!(!lifecycle.mark_failed());
    }
}
