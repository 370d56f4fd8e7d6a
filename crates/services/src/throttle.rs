use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{MediaError, MediaResult};
use crate::media::types::RoomId;
use crate::signal::messages::ApplyNetworkThrottleData;

/// Which of the shaper's scopes to tear down on stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaperScope {
    Default,
    Localhost,
}

/// Process-wide network shaper. One implementation shells out to the
/// `throttle` CLI; tests substitute a recording mock.
#[async_trait]
pub trait Shaper: Send + Sync {
    async fn start(&self, opts: &ApplyNetworkThrottleData) -> anyhow::Result<()>;
    async fn stop(&self, scope: ShaperScope) -> anyhow::Result<()>;
}

/// Drives the `throttle` command-line tool (tc/netem wrapper).
#[derive(Debug, Default)]
pub struct ThrottleCliShaper;

#[async_trait]
impl Shaper for ThrottleCliShaper {
    async fn start(&self, opts: &ApplyNetworkThrottleData) -> anyhow::Result<()> {
        let mut command = Command::new("throttle");
        if let Some(uplink) = opts.uplink {
            command.arg("--up").arg(uplink.to_string());
        }
        if let Some(downlink) = opts.downlink {
            command.arg("--down").arg(downlink.to_string());
        }
        if let Some(rtt) = opts.rtt {
            command.arg("--rtt").arg(rtt.to_string());
        }
        if let Some(packet_loss) = opts.packet_loss {
            command.arg("--packetLoss").arg(packet_loss.to_string());
        }
        run(command).await
    }

    async fn stop(&self, scope: ShaperScope) -> anyhow::Result<()> {
        let mut command = Command::new("throttle");
        if scope == ShaperScope::Localhost {
            command.arg("--localhost");
        }
        command.arg("stop");
        run(command).await
    }
}

async fn run(mut command: Command) -> anyhow::Result<()> {
    let status = command.status().await?;
    if !status.success() {
        anyhow::bail!("throttle command exited with {status}");
    }
    Ok(())
}

#[derive(Debug, Clone, Default)]
struct ThrottleState {
    enabled: bool,
    enabled_by: Option<RoomId>,
}

/// Single-owner coordinator for the process-wide shaper. Guarded by the
/// shared secret; operations are serialized through a fair mutex, so
/// overlapping apply/stop calls run one at a time.
pub struct ThrottleCoordinator {
    secret: Option<String>,
    shaper: Arc<dyn Shaper>,
    state: Mutex<ThrottleState>,
}

impl ThrottleCoordinator {
    pub fn new(secret: Option<String>, shaper: Arc<dyn Shaper>) -> Self {
        Self {
            secret,
            shaper,
            state: Mutex::new(ThrottleState::default()),
        }
    }

    fn verify_secret(&self, provided: Option<&str>) -> MediaResult<()> {
        match (&self.secret, provided) {
            (Some(expected), Some(given)) if expected == given => Ok(()),
            _ => Err(MediaError::Forbidden(
                "operation requires a valid network throttle secret".into(),
            )),
        }
    }

    pub async fn is_enabled(&self) -> bool {
        self.state.lock().await.enabled
    }

    /// Applies the shaper, stopping a previous application first. On success
    /// the requesting room becomes the owner.
    pub async fn apply(
        &self,
        room_id: &RoomId,
        opts: &ApplyNetworkThrottleData,
    ) -> MediaResult<()> {
        self.verify_secret(opts.secret.as_deref())?;

        let mut state = self.state.lock().await;
        if state.enabled {
            self.stop_locked(&mut state).await?;
        }
        self.shaper
            .start(opts)
            .await
            .map_err(MediaError::engine)?;
        state.enabled = true;
        state.enabled_by = Some(room_id.clone());
        info!(%room_id, "network throttle applied");
        Ok(())
    }

    pub async fn stop(&self, secret: Option<&str>) -> MediaResult<()> {
        self.verify_secret(secret)?;
        let mut state = self.state.lock().await;
        self.stop_locked(&mut state).await
    }

    /// Marks the shaper disabled, then tears down both scopes. If any stop
    /// call fails, the prior state is restored and the last error surfaced
    /// to the caller.
    async fn stop_locked(&self, state: &mut ThrottleState) -> MediaResult<()> {
        let prior = state.clone();
        state.enabled = false;
        state.enabled_by = None;

        let mut last_err = None;
        for scope in [ShaperScope::Default, ShaperScope::Localhost] {
            if let Err(err) = self.shaper.stop(scope).await {
                last_err = Some(err);
            }
        }
        if let Some(err) = last_err {
            *state = prior;
            return Err(MediaError::engine(err));
        }
        info!("network throttle stopped");
        Ok(())
    }

    /// Implicit stop when the owning room goes away.
    pub async fn on_room_closed(&self, room_id: &RoomId) {
        let mut state = self.state.lock().await;
        if state.enabled_by.as_ref() != Some(room_id) {
            return;
        }
        if let Err(err) = self.stop_locked(&mut state).await {
            warn!(%room_id, %err, "failed to stop network throttle for closed room");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct MockShaper {
        calls: SyncMutex<Vec<String>>,
        fail_stop: AtomicBool,
    }

    #[async_trait]
    impl Shaper for MockShaper {
        async fn start(&self, _opts: &ApplyNetworkThrottleData) -> anyhow::Result<()> {
            self.calls.lock().push("start".into());
            Ok(())
        }

        async fn stop(&self, scope: ShaperScope) -> anyhow::Result<()> {
            self.calls.lock().push(format!("stop:{scope:?}"));
            if self.fail_stop.load(Ordering::SeqCst) {
                anyhow::bail!("stop failed");
            }
            Ok(())
        }
    }

    fn opts(secret: Option<&str>) -> ApplyNetworkThrottleData {
        ApplyNetworkThrottleData {
            secret: secret.map(String::from),
            uplink: Some(1000),
            downlink: Some(1000),
            rtt: Some(50),
            packet_loss: None,
        }
    }

    fn coordinator(shaper: Arc<MockShaper>) -> ThrottleCoordinator {
        ThrottleCoordinator::new(Some("s3cret".into()), shaper)
    }

    #[tokio::test]
    async fn wrong_secret_is_forbidden_and_state_unchanged() {
        let shaper = Arc::new(MockShaper::default());
        let coordinator = coordinator(shaper.clone());

        let err = coordinator
            .apply(&"r1".to_string(), &opts(Some("wrong")))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "Forbidden");
        assert!(!coordinator.is_enabled().await);
        assert!(shaper.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn missing_secret_is_forbidden_even_when_gate_disabled() {
        let shaper = Arc::new(MockShaper::default());
        let coordinator = ThrottleCoordinator::new(None, shaper);
        let err = coordinator
            .apply(&"r1".to_string(), &opts(None))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "Forbidden");
    }

    #[tokio::test]
    async fn apply_then_stop_round_trips_to_initial_state() {
        let shaper = Arc::new(MockShaper::default());
        let coordinator = coordinator(shaper.clone());

        coordinator
            .apply(&"r1".to_string(), &opts(Some("s3cret")))
            .await
            .unwrap();
        assert!(coordinator.is_enabled().await);

        coordinator.stop(Some("s3cret")).await.unwrap();
        assert!(!coordinator.is_enabled().await);
        assert_eq!(
            *shaper.calls.lock(),
            vec!["start", "stop:Default", "stop:Localhost"]
        );
    }

    #[tokio::test]
    async fn reapply_stops_before_starting_again() {
        let shaper = Arc::new(MockShaper::default());
        let coordinator = coordinator(shaper.clone());

        coordinator
            .apply(&"r1".to_string(), &opts(Some("s3cret")))
            .await
            .unwrap();
        coordinator
            .apply(&"r2".to_string(), &opts(Some("s3cret")))
            .await
            .unwrap();
        assert_eq!(
            *shaper.calls.lock(),
            vec!["start", "stop:Default", "stop:Localhost", "start"]
        );
    }

    #[tokio::test]
    async fn failed_stop_restores_prior_state() {
        let shaper = Arc::new(MockShaper::default());
        let coordinator = coordinator(shaper.clone());

        coordinator
            .apply(&"r1".to_string(), &opts(Some("s3cret")))
            .await
            .unwrap();
        shaper.fail_stop.store(true, Ordering::SeqCst);

        let err = coordinator.stop(Some("s3cret")).await.unwrap_err();
        assert_eq!(err.kind(), "ServerError");
        assert!(coordinator.is_enabled().await);
    }

    #[tokio::test]
    async fn owning_room_close_stops_the_shaper() {
        let shaper = Arc::new(MockShaper::default());
        let coordinator = coordinator(shaper.clone());

        coordinator
            .apply(&"r1".to_string(), &opts(Some("s3cret")))
            .await
            .unwrap();

        // Some other room closing changes nothing.
        coordinator.on_room_closed(&"r2".to_string()).await;
        assert!(coordinator.is_enabled().await);

        coordinator.on_room_closed(&"r1".to_string()).await;
        assert!(!coordinator.is_enabled().await);
    }
}
