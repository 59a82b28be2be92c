#![forbid(unsafe_code)]

// Session registry - room name -> room, created at most once per name

use crate::media::{MediaConfig, MediaError, MediaResult, WorkerPool};
use crate::metrics::{Counter, ServerMetrics};
use crate::room::state::{FanOut, Member};
use crate::room::{Room, RoomHandle};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Instant;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// How many times a join chases a room that closed under it
const JOIN_ATTEMPTS: usize = 3;

/// Name-keyed map whose values are created by exactly one caller.
///
/// The map lock is held only to fetch or insert a cell; creation itself runs
/// inside the cell, so concurrent callers for the same name wait on the
/// in-flight creation instead of starting their own.
pub struct Registry<T> {
    entries: StdMutex<HashMap<String, Arc<OnceCell<T>>>>,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self {
            entries: StdMutex::new(HashMap::new()),
        }
    }
}

impl<T: Clone> Registry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the value for `name`, running `create` if nobody has yet.
    /// The flag is true for the single caller whose `create` produced the value.
    pub async fn resolve_or_create<F, Fut, E>(&self, name: &str, create: F) -> Result<(T, bool), E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let cell = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            entries
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let mut created = false;
        let result = cell
            .get_or_try_init(|| {
                created = true;
                create()
            })
            .await
            .cloned();

        match result {
            Ok(value) => Ok((value, created)),
            Err(e) => {
                self.discard_failed(name, &cell);
                Err(e)
            }
        }
    }

    /// Removes a cell whose creation failed, unless another caller is
    /// already waiting on it and will retry the creation itself.
    fn discard_failed(&self, name: &str, cell: &Arc<OnceCell<T>>) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let idle = entries
            .get(name)
            .is_some_and(|current| Arc::ptr_eq(current, cell) && Arc::strong_count(cell) == 2);
        if idle && !cell.initialized() {
            entries.remove(name);
        }
    }

    pub fn get(&self, name: &str) -> Option<T> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(name).and_then(|cell| cell.get().cloned())
    }

    /// Drops the entry for `name` if its value still satisfies `is_current`.
    /// A newer value registered under the same name is left alone.
    pub fn remove_if(&self, name: &str, is_current: impl Fn(&T) -> bool) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let matches = entries
            .get(name)
            .and_then(|cell| cell.get())
            .is_some_and(|v| is_current(v));
        if matches {
            entries.remove(name);
        }
        matches
    }

    pub fn values(&self) -> Vec<T> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.values().filter_map(|cell| cell.get().cloned()).collect()
    }

    pub fn drain(&self) -> Vec<T> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.drain().filter_map(|(_, cell)| cell.get().cloned()).collect()
    }

    /// Initialised entries only
    pub fn len(&self) -> usize {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.values().filter(|cell| cell.initialized()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct Shared {
    rooms: Registry<RoomHandle>,
    pool: Arc<WorkerPool>,
    config: MediaConfig,
    metrics: ServerMetrics,
    eviction: bool,
}

/// Owns every live room
#[derive(Clone)]
pub struct SessionManager {
    shared: Arc<Shared>,
}

impl SessionManager {
    pub fn new(pool: Arc<WorkerPool>, config: MediaConfig, metrics: ServerMetrics, eviction: bool) -> Self {
        Self {
            shared: Arc::new(Shared {
                rooms: Registry::new(),
                pool,
                config,
                metrics,
                eviction,
            }),
        }
    }

    pub fn config(&self) -> &MediaConfig {
        &self.shared.config
    }

    /// Looks up a room by name, creating it (worker lease, router, observer)
    /// on first use.
    ///
    /// # Errors
    /// Returns an error if the router or observer cannot be created. No entry
    /// is left behind, so the next caller tries again.
    pub async fn resolve_or_create_room(&self, name: &str) -> MediaResult<(RoomHandle, bool)> {
        let shared = &self.shared;
        let on_empty = self.eviction_hook(name);
        let (room, created) = shared
            .rooms
            .resolve_or_create(name, move || async move {
                info!("Creating new room: {}", name);
                let started = Instant::now();
                let room = Room::create(name, &shared.pool, &shared.config, on_empty).await?;
                shared.metrics.observe_room_setup(started.elapsed());
                Ok::<_, MediaError>(room)
            })
            .await?;

        if created {
            shared.metrics.inc(Counter::RoomsCreated);
            debug!("Room {} placed on worker index {}", name, room.worker_index());
        }
        Ok((room, created))
    }

    /// Joins `member` to the named room. A room that closes between lookup
    /// and join is replaced by a fresh one.
    pub async fn join_room(&self, name: &str, member: Member) -> MediaResult<(RoomHandle, bool, FanOut)> {
        let mut last_err = MediaError::RoomClosed(name.to_string());
        for attempt in 1..=JOIN_ATTEMPTS {
            let (room, created) = self.resolve_or_create_room(name).await?;
            match room.join(member.clone()).await {
                Ok(fan_out) => return Ok((room, created, fan_out)),
                Err(MediaError::RoomClosed(_)) => {
                    debug!("Room {} closed during join (attempt {}), retrying", name, attempt);
                    self.shared.rooms.remove_if(name, |r| r.id() == room.id());
                    last_err = MediaError::RoomClosed(name.to_string());
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err)
    }

    /// Callback run by a room task when its last member leaves
    fn eviction_hook(&self, name: &str) -> Option<Box<dyn FnOnce(u64) + Send>> {
        if !self.shared.eviction {
            return None;
        }
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        let name = name.to_string();
        Some(Box::new(move |room_id| {
            if let Some(shared) = weak.upgrade() {
                if shared.rooms.remove_if(&name, |r| r.id() == room_id) {
                    info!("Evicted empty room {}", name);
                    shared.metrics.inc(Counter::RoomsEvicted);
                }
            }
        }))
    }

    pub fn room_count(&self) -> usize {
        self.shared.rooms.len()
    }

    pub fn participant_count(&self) -> usize {
        self.shared.rooms.values().iter().map(RoomHandle::participant_count).sum()
    }

    /// Current router count per worker
    pub fn load_distribution(&self) -> Vec<usize> {
        self.shared.pool.load_distribution()
    }

    /// Closes every room. Members still connected are left to their own
    /// connection handlers, which see the closed room on their next request.
    pub async fn shutdown(&self) {
        info!("Shutting down all rooms...");
        let rooms = self.shared.rooms.drain();
        for room in &rooms {
            if let Err(e) = room.close().await {
                warn!("Failed to close room {}: {}", room.name(), e);
            }
        }
        info!("All rooms shut down ({} total)", rooms.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn concurrent_first_joins_create_once() {
        let registry = Arc::new(Registry::<usize>::new());
        let creations = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..32 {
            let registry = registry.clone();
            let creations = creations.clone();
            handles.push(tokio::spawn(async move {
                registry
                    .resolve_or_create("standup", || async move {
                        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                        Ok::<_, String>(creations.fetch_add(1, Ordering::SeqCst) + 100)
                    })
                    .await
            }));
        }

        let mut newly_created = 0;
        for handle in handles {
            let (value, created) = handle.await.unwrap().unwrap();
            assert_eq!(value, 100);
            if created {
                newly_created += 1;
            }
        }
        assert_eq!(creations.load(Ordering::SeqCst), 1);
        assert_eq!(newly_created, 1);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn distinct_names_create_independently() {
        let registry = Registry::<String>::new();
        let (a, a_new) = registry
            .resolve_or_create("a", || async { Ok::<_, ()>("room-a".to_string()) })
            .await
            .unwrap();
        let (b, b_new) = registry
            .resolve_or_create("b", || async { Ok::<_, ()>("room-b".to_string()) })
            .await
            .unwrap();
        assert_eq!((a.as_str(), a_new), ("room-a", true));
        assert_eq!((b.as_str(), b_new), ("room-b", true));
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn failed_creation_lets_the_next_caller_retry() {
        let registry = Registry::<u32>::new();
        let failed = registry
            .resolve_or_create("r", || async { Err::<u32, _>("router creation failed") })
            .await;
        assert!(failed.is_err());
        assert!(registry.get("r").is_none());
        assert!(registry.entries.lock().unwrap().is_empty());

        let (value, created) = registry
            .resolve_or_create("r", || async { Ok::<_, &str>(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert!(created);
    }

    #[tokio::test]
    async fn remove_if_only_drops_the_matching_generation() {
        let registry = Registry::<u32>::new();
        registry.resolve_or_create("r", || async { Ok::<_, ()>(1) }).await.unwrap();

        assert!(!registry.remove_if("r", |v| *v == 2));
        assert_eq!(registry.get("r"), Some(1));
        assert!(registry.remove_if("r", |v| *v == 1));
        assert!(registry.get("r").is_none());

        let (value, created) = registry
            .resolve_or_create("r", || async { Ok::<_, ()>(2) })
            .await
            .unwrap();
        assert_eq!((value, created), (2, true));
    }

    #[tokio::test]
    async fn existing_value_is_returned_without_creating() {
        let registry = Registry::<u32>::new();
        registry.resolve_or_create("r", || async { Ok::<_, ()>(1) }).await.unwrap();
        let (value, created) = registry
            .resolve_or_create("r", || async { Ok::<_, ()>(99) })
            .await
            .unwrap();
        assert_eq!((value, created), (1, false));
        assert_eq!(registry.drain(), vec![1]);
        assert!(registry.is_empty());
    }
}
