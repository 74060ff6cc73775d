//! Scoped ownership of engine sessions.
//!
//! A [`SessionScope`] owns every session opened through it and releases them
//! in reverse acquisition order when dropped, on success, error and unwind
//! alike. A failed `open` leaves earlier sessions owned by the scope, so only
//! the handles actually acquired are torn down.

use crate::events::Observers;
use crate::traits::{EngineProvider, EngineResult, EngineSession};

/// Index of a session inside its [`SessionScope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSlot(usize);

pub struct SessionScope<'p> {
    provider: &'p dyn EngineProvider,
    sessions: Vec<Box<dyn EngineSession>>,
}

impl<'p> SessionScope<'p> {
    pub fn new(provider: &'p dyn EngineProvider) -> Self {
        Self {
            provider,
            sessions: Vec::new(),
        }
    }

    pub fn open(&mut self) -> EngineResult<SessionSlot> {
        let session = self.provider.open()?;
        self.sessions.push(session);
        let slot = SessionSlot(self.sessions.len() - 1);
        tracing::debug!(slot = slot.0, "engine session opened");
        Ok(slot)
    }

    /// Open a session with observers attached before any other call.
    pub fn open_observed(&mut self, observers: &Observers) -> EngineResult<SessionSlot> {
        let slot = self.open()?;
        if !observers.is_empty() {
            self.get(slot).attach(observers.clone());
        }
        Ok(slot)
    }

    pub fn get(&mut self, slot: SessionSlot) -> &mut dyn EngineSession {
        self.sessions[slot.0].as_mut()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Drop for SessionScope<'_> {
    fn drop(&mut self) {
        while let Some(mut session) = self.sessions.pop() {
            let slot = self.sessions.len();
            // Observers go first so no handler outlives its session.
            session.detach();
            match session.close() {
                Ok(()) => tracing::debug!(slot, "engine session released"),
                Err(e) => tracing::warn!(slot, error = %e, "engine session release failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{EngineScript, ScriptedProvider};
    use crate::traits::EngineError;

    #[test]
    fn test_sessions_released_in_reverse_order() {
        let provider = ScriptedProvider::new(EngineScript::default());
        {
            let mut scope = SessionScope::new(&provider);
            scope.open().unwrap();
            scope.open().unwrap();
            assert_eq!(scope.len(), 2);
        }
        let closes: Vec<String> = provider
            .journal()
            .entries()
            .into_iter()
            .filter(|e| e.starts_with("close"))
            .collect();
        assert_eq!(closes, vec!["close#2", "close#1"]);
        assert_eq!(provider.live_sessions(), 0);
    }

    #[test]
    fn test_partial_acquisition_releases_acquired_only() {
        let provider = ScriptedProvider::new(EngineScript::default()).fail_open_at(2);
        let err = {
            let mut scope = SessionScope::new(&provider);
            scope.open().unwrap();
            scope.open().unwrap_err()
        };
        assert!(matches!(err, EngineError::Fault { .. }));
        assert_eq!(provider.journal().count("close#1"), 1);
        assert_eq!(provider.live_sessions(), 0);
    }

    #[test]
    fn test_release_on_unwind() {
        let provider = ScriptedProvider::new(EngineScript::default());
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let mut scope = SessionScope::new(&provider);
            scope.open().unwrap();
            panic!("boom");
        }));
        assert!(outcome.is_err());
        assert_eq!(provider.live_sessions(), 0);
    }

    #[test]
    fn test_detach_precedes_close() {
        let provider = ScriptedProvider::new(EngineScript::default());
        {
            let mut scope = SessionScope::new(&provider);
            let observers = Observers::none().with_progress(std::sync::Arc::new(
                crate::testing::RecordingObserver::default(),
            ));
            scope.open_observed(&observers).unwrap();
        }
        let entries = provider.journal().entries();
        let detach = entries.iter().position(|e| e == "detach#1").unwrap();
        let close = entries.iter().position(|e| e == "close#1").unwrap();
        assert!(detach < close);
    }
}
