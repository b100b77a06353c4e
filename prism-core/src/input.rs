//! Input events fed to the render loop.
//!
//! The engine does not read devices itself. The launcher supplies a
//! non-blocking [`InputSource`]; the render loop drains it between frames and
//! ignores anything it does not recognize.

/// Events the core reacts to. Everything else is the launcher's business.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputEvent {
    Quit,
    ToggleOverlay,
    /// Select keystone corner 0..=3 for subsequent nudges.
    SelectCorner(u8),
    /// Move the selected corner by whole steps on each axis.
    NudgeCorner { dx: i32, dy: i32 },
    ResetKeystone,
}

/// Non-blocking event source. `poll` returns immediately with the next
/// pending event or `None`.
pub trait InputSource: Send {
    fn poll(&mut self) -> Option<InputEvent>;
}

/// A source that never produces events, for headless runs.
pub struct NullInput;

impl InputSource for NullInput {
    fn poll(&mut self) -> Option<InputEvent> {
        None
    }
}

impl InputSource for std::sync::mpsc::Receiver<InputEvent> {
    fn poll(&mut self) -> Option<InputEvent> {
        self.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_source_is_non_blocking() {
        let (tx, mut rx) = std::sync::mpsc::channel();
        assert_eq!(rx.poll(), None);
        tx.send(InputEvent::SelectCorner(2)).unwrap();
        tx.send(InputEvent::NudgeCorner { dx: 1, dy: -1 }).unwrap();
        assert_eq!(rx.poll(), Some(InputEvent::SelectCorner(2)));
        assert_eq!(rx.poll(), Some(InputEvent::NudgeCorner { dx: 1, dy: -1 }));
        assert_eq!(rx.poll(), None);
    }
}
