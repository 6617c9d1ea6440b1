//! Forward-threaded warm-start chain.

/// The warm-start handle currently in effect while walking the trajectory.
///
/// The chain is advanced exactly once per frame that computes; cached
/// frames leave it untouched. `H` is whatever the walker threads forward:
/// the orchestrator stores a pending handle that resolves once the frame's
/// main job has been accepted.
#[derive(Debug, Clone)]
pub struct GuessChain<H> {
    current: Option<H>,
    advances: usize,
}

impl<H> Default for GuessChain<H> {
    fn default() -> Self {
        Self {
            current: None,
            advances: 0,
        }
    }
}

impl<H> GuessChain<H> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<&H> {
        self.current.as_ref()
    }

    /// Make `handle` the chain head for every following frame.
    pub fn advance(&mut self, handle: H) {
        self.current = Some(handle);
        self.advances += 1;
    }

    /// How many times the chain has been advanced.
    pub fn advances(&self) -> usize {
        self.advances
    }
}
