use std::sync::Arc;

use futures::future::{BoxFuture, Shared};

use crate::auth::Credential;
use crate::error::RefreshError;

pub(crate) type RefreshFuture = Shared<BoxFuture<'static, Result<Arc<Credential>, RefreshError>>>;

/// The refresh currently awaited by every caller of `SessionManager::refresh`.
pub(crate) struct InFlight {
    pub(crate) id: u64,
    pub(crate) future: RefreshFuture,
}

/// Mutable state of the one session a manager owns.
///
/// Created by `login`/`bootstrap`, destroyed by `logout` or teardown. Only the
/// manager's own methods touch it, and never across an `.await`.
#[derive(Default)]
pub(crate) struct SessionState {
    pub(crate) active: Option<Arc<Credential>>,
    pub(crate) refresh_in_flight: Option<InFlight>,
    /// Bumped whenever a session starts or ends; late results from an older
    /// generation are discarded.
    pub(crate) generation: u64,
    pub(crate) live: bool,
    pub(crate) next_flight_id: u64,
}

impl SessionState {
    /// Begin a new session around `credential`, returning its generation.
    pub(crate) fn start(&mut self, credential: Arc<Credential>) -> u64 {
        self.generation += 1;
        self.live = true;
        self.active = Some(credential);
        self.refresh_in_flight = None;
        self.generation
    }

    /// End the live session if it is `expected` (or any, when `None`).
    /// Returns the generation that ended.
    pub(crate) fn end(&mut self, expected: Option<u64>) -> Option<u64> {
        if !self.live || expected.is_some_and(|g| g != self.generation) {
            return None;
        }
        let ended = self.generation;
        self.live = false;
        self.active = None;
        self.refresh_in_flight = None;
        self.generation += 1;
        Some(ended)
    }

    pub(crate) fn live_generation(&self) -> Option<u64> {
        self.live.then_some(self.generation)
    }
}
