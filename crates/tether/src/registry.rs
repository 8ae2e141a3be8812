//! Process-wide session and codec registries.
//!
//! Both are explicit, statically built tables: sessions are registered when
//! created and removed when closed; codecs are registered once at process
//! start and looked up by name when a session is built. There is no runtime
//! discovery.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tether_core::{ProtocolCodec, SessionId};
use tracing::debug;

use crate::session::Session;

/// All live sessions of a process, keyed by session id.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<RwLock<HashMap<SessionId, Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session. Replacing a live session under the same id is a
    /// caller bug; the old handle is returned so it can at least be closed.
    pub fn register(&self, session: Session) -> Option<Session> {
        let id = session.id();
        let previous = self.inner.write().insert(id, session);
        debug!(session_id = id, "session registered");
        previous
    }

    pub fn get(&self, id: SessionId) -> Option<Session> {
        self.inner.read().get(&id).cloned()
    }

    pub fn remove(&self, id: SessionId) -> Option<Session> {
        let removed = self.inner.write().remove(&id);
        if removed.is_some() {
            debug!(session_id = id, "session deregistered");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Close every registered session. Used at process shutdown.
    pub fn close_all(&self) {
        let sessions: Vec<Session> = self.inner.read().values().cloned().collect();
        for session in sessions {
            session.close();
        }
    }
}

/// Codec lookup table, built once at process start.
#[derive(Default)]
pub struct CodecRegistry {
    codecs: HashMap<&'static str, Arc<dyn ProtocolCodec>>,
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        mut self,
        name: &'static str,
        codec: impl ProtocolCodec,
    ) -> Self {
        self.codecs.insert(name, Arc::new(codec));
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ProtocolCodec>> {
        self.codecs.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.codecs.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use tether_core::FrameCodec;

    use super::*;

    #[test]
    fn codec_lookup_by_name() {
        let registry = CodecRegistry::new().register("frame", FrameCodec::new());
        assert!(registry.get("frame").is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.names().count(), 1);
    }
}
