use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Serializes writers of the same `(session, index)` within this process.
///
/// Entries are weak, so a slot disappears once its last guard is dropped.
#[derive(Debug, Default)]
pub struct ChunkLocks {
    slots: Mutex<HashMap<(String, u32), Weak<AsyncMutex<()>>>>,
}

impl ChunkLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to one chunk.
    pub async fn acquire(&self, session_id: &str, index: u32) -> OwnedMutexGuard<()> {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots.retain(|_, weak| weak.strong_count() > 0);
            let key = (session_id.to_string(), index);
            match slots.get(&key).and_then(Weak::upgrade) {
                Some(existing) => existing,
                None => {
                    let fresh = Arc::new(AsyncMutex::new(()));
                    slots.insert(key, Arc::downgrade(&fresh));
                    fresh
                }
            }
        };
        slot.lock_owned().await
    }

    /// Number of chunks currently locked or waited on.
    pub fn active(&self) -> usize {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.values().filter(|w| w.strong_count() > 0).count()
    }
}

/// Sessions whose finalization claim is held by a task in this process.
///
/// The reaper consults this set before deleting a `PROCESSING` session.
#[derive(Debug, Clone, Default)]
pub struct ActiveClaims {
    inner: Arc<Mutex<HashSet<String>>>,
}

impl ActiveClaims {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `session_id` until the returned guard is dropped.
    pub fn hold(&self, session_id: &str) -> ClaimGuard {
        self.lock().insert(session_id.to_string());
        ClaimGuard {
            claims: self.clone(),
            session_id: session_id.to_string(),
        }
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.lock().contains(session_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Releases a claim registration on drop.
#[derive(Debug)]
pub struct ClaimGuard {
    claims: ActiveClaims,
    session_id: String,
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        self.claims.lock().remove(&self.session_id);
    }
}
