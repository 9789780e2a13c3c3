//! Registry of live transport handles

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::transport::TransportHandle;

/// A live handle together with the pairing attempt that opened it
#[derive(Clone)]
pub struct LiveSession {
    pub handle: Arc<dyn TransportHandle>,
    /// Distinguishes events of this handle from those of earlier handles
    pub generation: u64,
    pub opened_at: DateTime<Utc>,
}

impl LiveSession {
    pub fn new(handle: Arc<dyn TransportHandle>, generation: u64) -> Self {
        Self {
            handle,
            generation,
            opened_at: Utc::now(),
        }
    }
}

/// Source of truth for "which sessions have a live handle"
pub trait SessionRegistry: Send + Sync {
    /// Register a handle, returning the one it displaced (if any)
    fn insert(&self, session_id: &str, session: LiveSession) -> Option<LiveSession>;

    fn get(&self, session_id: &str) -> Option<LiveSession>;

    fn remove(&self, session_id: &str) -> Option<LiveSession>;

    /// Remove the entry only while it still belongs to `generation`
    fn remove_generation(&self, session_id: &str, generation: u64) -> Option<LiveSession>;

    fn session_ids(&self) -> Vec<String>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn contains(&self, session_id: &str) -> bool {
        self.get(session_id).is_some()
    }
}

/// In-process registry backed by DashMap
#[derive(Default)]
pub struct InMemoryRegistry {
    sessions: DashMap<String, LiveSession>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionRegistry for InMemoryRegistry {
    fn insert(&self, session_id: &str, session: LiveSession) -> Option<LiveSession> {
        self.sessions.insert(session_id.to_string(), session)
    }

    fn get(&self, session_id: &str) -> Option<LiveSession> {
        self.sessions.get(session_id).map(|s| s.clone())
    }

    fn remove(&self, session_id: &str) -> Option<LiveSession> {
        self.sessions.remove(session_id).map(|(_, s)| s)
    }

    fn remove_generation(&self, session_id: &str, generation: u64) -> Option<LiveSession> {
        self.sessions
            .remove_if(session_id, |_, s| s.generation == generation)
            .map(|(_, s)| s)
    }

    fn session_ids(&self) -> Vec<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    fn len(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Result;
    use async_trait::async_trait;

    struct NoopHandle;

    #[async_trait]
    impl TransportHandle for NoopHandle {
        async fn send(&self, _recipient: &str, _content: &str) -> Result<String> {
            Ok("id".to_string())
        }

        async fn check_registered(&self, _phone: &str) -> Result<Option<String>> {
            Ok(None)
        }

        async fn end(&self) -> Result<()> {
            Ok(())
        }

        fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_insert_replaces_and_reports() {
        let registry = InMemoryRegistry::new();
        assert!(registry.is_empty());

        assert!(registry
            .insert("s1", LiveSession::new(Arc::new(NoopHandle), 1))
            .is_none());
        let displaced = registry.insert("s1", LiveSession::new(Arc::new(NoopHandle), 2));
        assert_eq!(displaced.unwrap().generation, 1);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("s1").unwrap().generation, 2);

        assert!(registry.remove("s1").is_some());
        assert!(!registry.contains("s1"));
    }

    #[test]
    fn test_remove_generation_ignores_newer_handle() {
        let registry = InMemoryRegistry::new();
        registry.insert("s1", LiveSession::new(Arc::new(NoopHandle), 7));

        assert!(registry.remove_generation("s1", 6).is_none());
        assert!(registry.contains("s1"));
        assert_eq!(registry.remove_generation("s1", 7).unwrap().generation, 7);
        assert!(registry.is_empty());
    }
}
