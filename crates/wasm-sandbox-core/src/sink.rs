//! Where guest output goes.

use std::fmt;

/// Receives bytes the guest prints through the native callback set.
///
/// Implementations decide framing: the bytes are passed through exactly as
/// the guest produced them.
pub trait PrintSink: Send + Sync + fmt::Debug {
    /// Emit `bytes`.
    fn print(&self, bytes: &[u8]);

    /// Emit a string.
    fn print_str(&self, text: &str) {
        self.print(text.as_bytes());
    }
}
