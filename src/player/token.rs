use std::sync::atomic::{AtomicU64, Ordering};

/// Generation captured by every piece of asynchronous playback work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlayToken(u64);

impl PlayToken {
    pub fn generation(&self) -> u64 {
        self.0
    }
}

/// Issues play generations. Exactly one token is current; issuing a new one
/// makes every earlier token stale.
#[derive(Debug, Default)]
pub struct PlayTokens {
    current: AtomicU64,
}

impl PlayTokens {
    pub fn issue(&self) -> PlayToken {
        PlayToken(self.current.fetch_add(1, Ordering::AcqRel) + 1)
    }

    pub fn current(&self) -> PlayToken {
        PlayToken(self.current.load(Ordering::Acquire))
    }

    pub fn is_current(&self, token: PlayToken) -> bool {
        self.current() == token
    }
}
