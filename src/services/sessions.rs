use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use rusqlite::Connection;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::db::queries;
use crate::models::BookingSession;

/// Sqlite-backed store of booking sessions keyed by conversation id.
///
/// `acquire` hands out a per-conversation async lock so pipeline transitions
/// for one conversation are serialized (load → mutate → save happens under
/// the guard, including an in-flight commit) while distinct conversations
/// proceed in parallel.
pub struct SessionStore {
    db: Arc<StdMutex<Connection>>,
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionStore {
    pub fn new(db: Arc<StdMutex<Connection>>) -> Self {
        Self {
            db,
            locks: StdMutex::new(HashMap::new()),
        }
    }

    pub async fn acquire(&self, conversation_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap();
            Arc::clone(
                locks
                    .entry(conversation_id.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };
        lock.lock_owned().await
    }

    pub fn load(&self, conversation_id: &str) -> anyhow::Result<Option<BookingSession>> {
        let db = self.db.lock().unwrap();
        queries::get_session(&db, conversation_id)
    }

    pub fn load_or_new(&self, conversation_id: &str) -> anyhow::Result<BookingSession> {
        Ok(self
            .load(conversation_id)?
            .unwrap_or_else(|| BookingSession::new(conversation_id)))
    }

    pub fn save(&self, session: &BookingSession) -> anyhow::Result<()> {
        let db = self.db.lock().unwrap();
        queries::save_session(&db, session)
    }

    /// Remove a conversation's session. Callers must hold the conversation
    /// lock, which makes teardown wait for any in-flight transition. The lock
    /// entry itself stays: dropping it while a turn holds or awaits the old
    /// mutex would let a later `acquire` mint a fresh one and run two turns
    /// for the same conversation concurrently. Idle entries are pruned by
    /// `sweep_expired`.
    pub fn delete(&self, conversation_id: &str) -> anyhow::Result<bool> {
        let db = self.db.lock().unwrap();
        queries::delete_session(&db, conversation_id)
    }

    /// Drop expired session rows and prune lock entries nobody holds or
    /// awaits. A guard (or a queued `acquire`) keeps a clone of the `Arc`, so
    /// a strong count of one means the entry is safe to drop.
    pub fn sweep_expired(&self) -> anyhow::Result<usize> {
        let removed = {
            let db = self.db.lock().unwrap();
            queries::expire_old_sessions(&db)?
        };

        let mut locks = self.locks.lock().unwrap();
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);

        Ok(removed)
    }
}
