use std::sync::Arc;

use confab_config::Settings;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::{MediaError, MediaResult};

use super::room::{Room, RoomEvent};
use super::types::RoomId;
use super::worker_pool::WorkerPool;

struct CreateRoomJob {
    room_id: RoomId,
    consumer_replicas: u32,
    use_pipe_transports: bool,
    reply: oneshot::Sender<MediaResult<Room>>,
}

/// Serialized FIFO room creation with exactly-once-per-id semantics: one
/// consumer task runs each job to completion before the next starts, so two
/// concurrent callers asking for the same id observe a single creation. Once
/// the supervisor drops the scheduler, queued jobs are rejected with a
/// shutdown error.
pub(crate) struct RoomScheduler {
    jobs: mpsc::UnboundedSender<CreateRoomJob>,
}

impl RoomScheduler {
    pub(crate) fn spawn(
        rooms: Arc<DashMap<RoomId, Room>>,
        pool: Arc<WorkerPool>,
        settings: Arc<Settings>,
        events: mpsc::UnboundedSender<RoomEvent>,
    ) -> Self {
        let (jobs_tx, mut jobs_rx) = mpsc::unbounded_channel::<CreateRoomJob>();

        tokio::spawn(async move {
            while let Some(job) = jobs_rx.recv().await {
                // An earlier job in the queue may have created this id; the
                // later caller gets the same instance, never a second router
                // pair.
                if let Some(existing) = rooms.get(&job.room_id) {
                    if existing.is_closed() {
                        drop(existing);
                        rooms.remove(&job.room_id);
                    } else {
                        let _ = job.reply.send(Ok(existing.clone()));
                        continue;
                    }
                }

                let result = Room::create(
                    job.room_id.clone(),
                    job.consumer_replicas,
                    job.use_pipe_transports,
                    &pool,
                    settings.clone(),
                    events.clone(),
                )
                .await;
                match result {
                    Ok(room) => {
                        rooms.insert(job.room_id, room.clone());
                        let _ = job.reply.send(Ok(room));
                    }
                    Err(err) => {
                        warn!(room_id = %job.room_id, %err, "room creation failed");
                        let _ = job.reply.send(Err(err));
                    }
                }
            }
            debug!("room scheduler stopped");
        });

        Self { jobs: jobs_tx }
    }

    pub(crate) async fn get_or_create(
        &self,
        room_id: RoomId,
        consumer_replicas: u32,
        use_pipe_transports: bool,
    ) -> MediaResult<Room> {
        let (reply, reply_rx) = oneshot::channel();
        self.jobs
            .send(CreateRoomJob {
                room_id,
                consumer_replicas,
                use_pipe_transports,
                reply,
            })
            .map_err(|_| shutdown_error())?;
        reply_rx.await.unwrap_or_else(|_| Err(shutdown_error()))
    }
}

fn shutdown_error() -> MediaError {
    MediaError::InvalidState("room scheduler is shut down".into())
}
