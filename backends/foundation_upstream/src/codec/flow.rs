//! HTTP/2 send windows (RFC 9113 section 6.9).

use crate::errors::{CodecError, CodecResult};

/// Initial window for the connection and every new stream.
pub const DEFAULT_WINDOW_SIZE: i64 = 65_535;

/// Largest window a peer may grant.
pub const MAX_WINDOW_SIZE: i64 = 0x7fff_ffff;

/// How many bytes the peer currently lets us send. Goes negative when the
/// peer shrinks SETTINGS_INITIAL_WINDOW_SIZE under data already in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SendWindow {
    window: i64,
}

impl SendWindow {
    pub(crate) fn new(initial: i64) -> Self {
        Self { window: initial }
    }

    pub(crate) fn available(self) -> usize {
        usize::try_from(self.window.max(0)).unwrap_or(usize::MAX)
    }

    /// Takes `amount` bytes out of the window. Callers never send more than
    /// [`Self::available`].
    pub(crate) fn consume(&mut self, amount: usize) {
        self.window -= i64::try_from(amount).unwrap_or(MAX_WINDOW_SIZE);
    }

    /// Applies a WINDOW_UPDATE increment.
    pub(crate) fn increase(&mut self, increment: u32) -> CodecResult<()> {
        self.adjust(i64::from(increment))
    }

    /// Applies the change in SETTINGS_INITIAL_WINDOW_SIZE, which may be
    /// negative.
    pub(crate) fn adjust(&mut self, delta: i64) -> CodecResult<()> {
        let window = self.window + delta;
        if window > MAX_WINDOW_SIZE {
            return Err(CodecError::FlowControl);
        }
        self.window = window;
        Ok(())
    }
}

impl Default for SendWindow {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consume_then_increase() {
        let mut window = SendWindow::default();
        window.consume(1_000);
        assert_eq!(window.available(), 64_535);
        window.increase(500).expect("within bounds");
        assert_eq!(window.available(), 65_035);
    }

    #[test]
    fn shrinking_below_zero_leaves_nothing_available() {
        let mut window = SendWindow::new(100);
        window.consume(100);
        window.adjust(-50).expect("negative windows are allowed");
        assert_eq!(window.available(), 0);
        window.increase(60).expect("within bounds");
        assert_eq!(window.available(), 10);
    }

    #[test]
    fn increase_past_maximum_is_an_error() {
        let mut window = SendWindow::new(MAX_WINDOW_SIZE);
        assert_eq!(window.increase(1), Err(CodecError::FlowControl));
        assert_eq!(window.available(), 0x7fff_ffff);
    }
}
