//! # Session Registry
//!
//! Server-side [`SessionDirectory`]: allocates connection ids and resumption tokens,
//! and re-associates a resumed session with its new communicator.
//!
//! ## Session lifecycle
//! - **Active**: bound to a live communicator
//! - **Migrating**: the client was told to reconnect elsewhere; kept for the resume TTL
//! - **Suspended**: an authenticated connection dropped; kept for the resume TTL
//!
//! Expired entries are purged lazily on every registration or resume. The registry is
//! memory-bounded: registration fails once `capacity` live sessions exist.
//!
//! ## Usage
//! ```ignore
//! let registry = Arc::new(SessionRegistry::new(1024, Duration::from_secs(30)));
//! let handshake = ServerHandshake::new(registry.clone());
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, info, trace};

use crate::communicator::{Communicator, ConnectionId};
use crate::config::ServerConfig;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::handshake::{Admission, Identity, SessionDirectory};
use crate::utils::lock;

/// Length of a generated resumption token
pub const TOKEN_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Active,
    Migrating { until: Instant },
    Suspended { until: Instant },
}

impl SessionState {
    fn is_expired(self, now: Instant) -> bool {
        match self {
            SessionState::Active => false,
            SessionState::Migrating { until } | SessionState::Suspended { until } => now >= until,
        }
    }
}

struct Session {
    token: Vec<u8>,
    communicator: Communicator,
    state: SessionState,
}

#[derive(Default)]
struct RegistryInner {
    sessions: HashMap<ConnectionId, Session>,
    tokens: HashMap<Vec<u8>, ConnectionId>,
}

impl RegistryInner {
    fn purge_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<ConnectionId> = self
            .sessions
            .iter()
            .filter(|(_, session)| session.state.is_expired(now))
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            self.remove(*id);
        }
        expired.len()
    }

    fn remove(&mut self, id: ConnectionId) {
        if let Some(session) = self.sessions.remove(&id) {
            self.tokens.remove(&session.token);
        }
    }
}

/// Tracks live, migrating and suspended sessions
pub struct SessionRegistry {
    capacity: usize,
    resume_ttl: Duration,
    next_id: AtomicU32,
    inner: Mutex<RegistryInner>,
}

impl SessionRegistry {
    pub fn new(capacity: usize, resume_ttl: Duration) -> Self {
        Self {
            capacity,
            resume_ttl,
            next_id: AtomicU32::new(1),
            inner: Mutex::new(RegistryInner::default()),
        }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(config.max_sessions, config.resume_ttl)
    }

    /// Sessions currently held, in any state
    pub fn len(&self) -> usize {
        lock(&self.inner).sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        lock(&self.inner).sessions.contains_key(&id)
    }

    /// Whether `id` is bound to a live communicator
    pub fn is_active(&self, id: ConnectionId) -> bool {
        lock(&self.inner)
            .sessions
            .get(&id)
            .is_some_and(|session| session.state == SessionState::Active)
    }

    /// Drop expired migrating and suspended sessions
    pub fn purge_expired(&self) -> usize {
        let purged = lock(&self.inner).purge_expired(Instant::now());
        if purged > 0 {
            debug!(purged, "Expired sessions purged");
        }
        purged
    }

    /// Called when `communicator` disconnects.
    ///
    /// Only acts if `id` is still bound to that communicator: a session that has
    /// already moved to a newer transport is left alone. Migrating sessions stay
    /// parked; authenticated ones are suspended for the resume TTL; anything else
    /// is forgotten.
    pub fn release(&self, id: ConnectionId, communicator: &Communicator) {
        let mut inner = lock(&self.inner);
        let Some(session) = inner.sessions.get_mut(&id) else {
            return;
        };
        if !session.communicator.same_as(communicator) {
            trace!(%id, "Release from a superseded transport ignored");
            return;
        }
        let state = session.state;
        match state {
            SessionState::Migrating { .. } => {}
            SessionState::Active | SessionState::Suspended { .. }
                if communicator.is_authenticated() =>
            {
                session.state = SessionState::Suspended {
                    until: Instant::now() + self.resume_ttl,
                };
                debug!(%id, "Session suspended");
            }
            _ => {
                inner.remove(id);
                debug!(%id, "Session released");
            }
        }
    }

    fn allocate_id(&self, inner: &RegistryInner) -> ConnectionId {
        loop {
            let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
            if id.is_registered() && !inner.sessions.contains_key(&id) {
                return id;
            }
        }
    }

    fn generate_token(inner: &RegistryInner) -> Vec<u8> {
        let mut rng = rand::rng();
        loop {
            let mut token = vec![0u8; TOKEN_LEN];
            rng.fill(&mut token[..]);
            if !inner.tokens.contains_key(&token) {
                return token;
            }
        }
    }
}

impl SessionDirectory for SessionRegistry {
    fn register(&self, communicator: &Communicator) -> Result<Identity> {
        let mut inner = lock(&self.inner);
        inner.purge_expired(Instant::now());
        if inner.sessions.len() >= self.capacity {
            return Err(ProtocolError::InitializationError(
                constants::ERR_SESSION_CAPACITY.into(),
            ));
        }
        let id = self.allocate_id(&inner);
        let token = Self::generate_token(&inner);
        inner.tokens.insert(token.clone(), id);
        inner.sessions.insert(
            id,
            Session {
                token: token.clone(),
                communicator: communicator.clone(),
                state: SessionState::Active,
            },
        );
        info!(%id, endpoint = %communicator.endpoint(), "Session registered");
        Ok(Identity { id, token })
    }

    fn resume(&self, token: &[u8], communicator: &Communicator) -> Result<Admission> {
        let (admission, superseded) = {
            let mut inner = lock(&self.inner);
            inner.purge_expired(Instant::now());
            let unknown = || ProtocolError::InitializationError(constants::ERR_UNKNOWN_SESSION.into());
            let id = *inner.tokens.get(token).ok_or_else(unknown)?;
            let session = inner.sessions.get_mut(&id).ok_or_else(unknown)?;

            let migrated = matches!(session.state, SessionState::Migrating { .. });
            let previous = std::mem::replace(&mut session.communicator, communicator.clone());
            session.state = SessionState::Active;
            let superseded = (!previous.same_as(communicator) && !previous.is_closed()).then_some(previous);
            let identity = Identity {
                id,
                token: session.token.clone(),
            };
            (Admission { identity, migrated }, superseded)
        };
        // Closing runs disconnect listeners, which may call back into `release`.
        if let Some(previous) = superseded {
            debug!(id = %admission.identity.id, "Closing superseded transport");
            previous.close();
        }
        info!(
            id = %admission.identity.id,
            migrated = admission.migrated,
            endpoint = %communicator.endpoint(),
            "Session resumed"
        );
        Ok(admission)
    }

    fn mark_migrating(&self, id: ConnectionId) -> Result<()> {
        let mut inner = lock(&self.inner);
        let session = inner.sessions.get_mut(&id).ok_or_else(|| {
            ProtocolError::InitializationError(constants::ERR_UNKNOWN_SESSION.into())
        })?;
        session.state = SessionState::Migrating {
            until: Instant::now() + self.resume_ttl,
        };
        debug!(%id, ttl_ms = self.resume_ttl.as_millis() as u64, "Session parked for migration");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(2, Duration::from_secs(30))
    }

    #[test]
    fn test_register_issues_distinct_identities() {
        let registry = registry();
        let a = registry.register(&Communicator::new("a")).unwrap();
        let b = registry.register(&Communicator::new("b")).unwrap();
        assert_ne!(a.id, b.id);
        assert_ne!(a.token, b.token);
        assert_eq!(a.token.len(), TOKEN_LEN);
        assert!(registry.is_active(a.id));
    }

    #[test]
    fn test_capacity_limit() {
        let registry = registry();
        registry.register(&Communicator::new("a")).unwrap();
        registry.register(&Communicator::new("b")).unwrap();
        assert!(matches!(
            registry.register(&Communicator::new("c")),
            Err(ProtocolError::InitializationError(message)) if message == constants::ERR_SESSION_CAPACITY
        ));
    }

    #[test]
    fn test_migrating_session_survives_release() {
        let registry = registry();
        let origin = Communicator::new("origin");
        let identity = registry.register(&origin).unwrap();
        registry.mark_migrating(identity.id).unwrap();
        registry.release(identity.id, &origin);

        let target = Communicator::new("target");
        let admission = registry.resume(&identity.token, &target).unwrap();
        assert!(admission.migrated);
        assert_eq!(admission.identity, identity);
        assert!(registry.is_active(identity.id));
    }

    #[test]
    fn test_unauthenticated_release_forgets_session() {
        let registry = registry();
        let comm = Communicator::new("a");
        let identity = registry.register(&comm).unwrap();
        registry.release(identity.id, &comm);
        assert!(registry.is_empty());
        assert!(registry.resume(&identity.token, &comm).is_err());
    }

    #[test]
    fn test_authenticated_release_suspends() {
        let registry = registry();
        let comm = Communicator::new("a");
        let identity = registry.register(&comm).unwrap();
        comm.set_authenticated();
        registry.release(identity.id, &comm);
        assert!(registry.contains(identity.id));
        assert!(!registry.is_active(identity.id));

        let admission = registry.resume(&identity.token, &Communicator::new("b")).unwrap();
        assert!(!admission.migrated);
    }

    #[test]
    fn test_release_from_superseded_transport_is_ignored() {
        let registry = registry();
        let first = Communicator::new("first");
        let identity = registry.register(&first).unwrap();
        let second = Communicator::new("second");
        registry.resume(&identity.token, &second).unwrap();
        assert!(first.is_closed());

        registry.release(identity.id, &first);
        assert!(registry.is_active(identity.id));
    }

    #[test]
    fn test_expired_sessions_are_purged() {
        let registry = SessionRegistry::new(4, Duration::ZERO);
        let comm = Communicator::new("a");
        let identity = registry.register(&comm).unwrap();
        registry.mark_migrating(identity.id).unwrap();
        assert_eq!(registry.purge_expired(), 1);
        assert!(registry.resume(&identity.token, &comm).is_err());
    }
}
