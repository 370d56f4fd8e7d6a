use std::sync::{Arc, Weak};

use confab_config::Settings;
use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error};

use crate::error::MediaResult;
use crate::throttle::{ThrottleCliShaper, ThrottleCoordinator};

use super::room::{Room, RoomEvent};
use super::scheduler::RoomScheduler;
use super::types::RoomId;
use super::worker_pool::WorkerPool;

/// Top-level supervisor: owns the worker pool, the room map, the creation
/// scheduler and the throttle coordinator, and reacts to room lifecycle
/// events on its own task (the "scheduler turn" rooms close themselves on).
#[derive(Clone)]
pub struct RoomManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    pool: Arc<WorkerPool>,
    rooms: Arc<DashMap<RoomId, Room>>,
    scheduler: RoomScheduler,
    throttle: Arc<ThrottleCoordinator>,
    fatal: watch::Sender<bool>,
}

impl RoomManager {
    /// Boots the worker pool and the supervisor loops. Fails if the engine
    /// workers cannot be spawned.
    pub async fn new(settings: Settings) -> anyhow::Result<Self> {
        let settings = Arc::new(settings);
        let pool = Arc::new(WorkerPool::new(&settings.mediasoup).await?);
        let rooms: Arc<DashMap<RoomId, Room>> = Arc::new(DashMap::new());

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (deaths_tx, deaths_rx) = mpsc::unbounded_channel();
        pool.watch_deaths(deaths_tx);

        let scheduler = RoomScheduler::spawn(
            rooms.clone(),
            pool.clone(),
            settings.clone(),
            events_tx,
        );
        let throttle = Arc::new(ThrottleCoordinator::new(
            settings.throttle.secret.clone(),
            Arc::new(ThrottleCliShaper),
        ));
        let (fatal, _) = watch::channel(false);

        let inner = Arc::new(ManagerInner {
            pool,
            rooms,
            scheduler,
            throttle,
            fatal,
        });
        Self::spawn_event_loop(Arc::downgrade(&inner), events_rx, deaths_rx);

        Ok(Self { inner })
    }

    fn spawn_event_loop(
        weak: Weak<ManagerInner>,
        mut events_rx: mpsc::UnboundedReceiver<RoomEvent>,
        mut deaths_rx: mpsc::UnboundedReceiver<usize>,
    ) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events_rx.recv() => {
                        let Some(event) = event else { break };
                        let Some(inner) = weak.upgrade() else { break };
                        match event {
                            RoomEvent::PeerLeft(room_id) => {
                                if let Some(room) = inner.rooms.get(&room_id) {
                                    room.close_if_empty();
                                }
                            }
                            RoomEvent::RouterClosed(room_id) => {
                                let room = inner.rooms.get(&room_id).map(|r| r.clone());
                                if let Some(room) = room {
                                    room.close();
                                }
                            }
                            RoomEvent::Closed(room_id) => {
                                inner.rooms.remove(&room_id);
                                inner.throttle.on_room_closed(&room_id).await;
                            }
                        }
                    }
                    index = deaths_rx.recv() => {
                        let Some(index) = index else { break };
                        let Some(inner) = weak.upgrade() else { break };
                        error!(worker = index, "engine worker died, shutting down all rooms");
                        close_all(&inner);
                        let _ = inner.fatal.send(true);
                    }
                }
            }
            debug!("room manager event loop stopped");
        });
    }

    /// Resolves a room, creating it through the serialized scheduler when
    /// absent. Two concurrent callers for the same id observe one creation.
    pub async fn get_or_create_room(
        &self,
        room_id: RoomId,
        consumer_replicas: u32,
        use_pipe_transports: bool,
    ) -> MediaResult<Room> {
        if let Some(room) = self.inner.rooms.get(&room_id) {
            if !room.is_closed() {
                return Ok(room.clone());
            }
        }
        self.inner
            .scheduler
            .get_or_create(room_id, consumer_replicas, use_pipe_transports)
            .await
    }

    pub fn room(&self, room_id: &RoomId) -> Option<Room> {
        self.inner
            .rooms
            .get(room_id)
            .filter(|room| !room.is_closed())
            .map(|room| room.clone())
    }

    pub fn room_count(&self) -> usize {
        self.inner.rooms.len()
    }

    pub fn worker_count(&self) -> usize {
        self.inner.pool.len()
    }

    pub fn throttle(&self) -> &Arc<ThrottleCoordinator> {
        &self.inner.throttle
    }

    /// Flips to `true` when an engine worker dies; the process should exit.
    pub fn subscribe_fatal(&self) -> watch::Receiver<bool> {
        self.inner.fatal.subscribe()
    }

    pub fn close_all_rooms(&self) {
        close_all(&self.inner);
    }
}

fn close_all(inner: &ManagerInner) {
    let rooms: Vec<Room> = inner.rooms.iter().map(|entry| entry.value().clone()).collect();
    inner.rooms.clear();
    for room in rooms {
        room.close();
    }
}
