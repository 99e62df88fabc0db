//! Cancellation signal
//!
//! A one-shot shared abort flag. Each time context owns one token; canceling
//! a context fires its token and, transitively, every descendant's token.
//! The flag only ever transitions false -> true.

use std::cell::Cell;
use std::rc::Rc;

/// A one-shot, cloneable cancellation flag.
///
/// Clones share the same underlying flag, so a context handle can observe
/// cancellation even after the context's arena slot has been released.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    fired: Rc<Cell<bool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the token. Returns `false` if it was already fired.
    pub fn fire(&self) -> bool {
        if self.fired.get() {
            return false;
        }
        self.fired.set(true);
        true
    }

    pub fn is_fired(&self) -> bool {
        self.fired.get()
    }
}
