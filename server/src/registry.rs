//! Session registry for connected players
//!
//! This module owns the authoritative set of players currently present on the
//! server. It is responsible for:
//! - Handing out session identifiers (monotonic, never reused)
//! - Storing each player's position, map, facing direction and party snapshot
//! - Answering point-in-time snapshot queries
//! - Evicting sessions that stopped moving for longer than the timeout
//!
//! All state lives behind a single mutex. The background sweep task takes the
//! same lock as request handlers, so evictions interleave safely with updates.

use log::{debug, error, info, warn};
use shared::{
    Direction, PartySnapshot, PlayerView, SessionId, DEFAULT_CHECK_INTERVAL_SECS,
    DEFAULT_TIMEOUT_SECS,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid registry configuration: {0}")]
    InvalidConfig(String),
    #[error("session sweep task failed: {0}")]
    SweepTaskFailed(#[from] tokio::task::JoinError),
}

/// Decides which updates count as player activity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActivityPolicy {
    /// Only a change of position, map or direction refreshes the session
    #[default]
    MovementOnly,
    /// A changed party snapshot refreshes the session as well
    AnyChange,
}

/// Tunables fixed at registry construction
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Sessions idle for at least this long are evicted
    pub timeout: Duration,
    /// How often the sweep task scans for idle sessions
    pub check_interval: Duration,
    /// Upper bound on how long `stop` waits for the sweep task
    pub shutdown_grace: Duration,
    pub activity_policy: ActivityPolicy,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            check_interval: Duration::from_secs(DEFAULT_CHECK_INTERVAL_SECS),
            shutdown_grace: Duration::from_secs(2),
            activity_policy: ActivityPolicy::MovementOnly,
        }
    }
}

impl RegistryConfig {
    pub fn validate(&self) -> Result<(), RegistryError> {
        if self.timeout.is_zero() {
            return Err(RegistryError::InvalidConfig(
                "timeout must be greater than zero".to_string(),
            ));
        }
        if self.check_interval.is_zero() {
            return Err(RegistryError::InvalidConfig(
                "check interval must be greater than zero".to_string(),
            ));
        }
        if self.check_interval >= self.timeout {
            return Err(RegistryError::InvalidConfig(format!(
                "check interval ({:?}) must be shorter than timeout ({:?})",
                self.check_interval, self.timeout
            )));
        }
        Ok(())
    }
}

/// Server-side state of one connected player
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub x: f32,
    pub y: f32,
    pub map: String,
    pub direction: Direction,
    /// Passed through verbatim, never inspected
    pub party: Option<PartySnapshot>,
    /// Last time the player actually changed state
    pub last_activity: Instant,
}

impl Session {
    /// Creates a session at the origin with no map and default facing
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            x: 0.0,
            y: 0.0,
            map: String::new(),
            direction: Direction::default(),
            party: None,
            last_activity: Instant::now(),
        }
    }

    /// Overwrites every field with the reported state
    ///
    /// The activity clock only moves when the reported state differs from
    /// the stored one, so a client repeating the same heartbeat still times
    /// out. Coordinates are compared bit for bit, which keeps a repeated NaN
    /// from counting as movement. Returns true if activity was refreshed.
    pub fn apply_update(
        &mut self,
        x: f32,
        y: f32,
        map: String,
        direction: Direction,
        party: Option<PartySnapshot>,
        policy: ActivityPolicy,
    ) -> bool {
        let moved = x.to_bits() != self.x.to_bits()
            || y.to_bits() != self.y.to_bits()
            || map != self.map
            || direction != self.direction;
        let party_changed = policy == ActivityPolicy::AnyChange && party != self.party;

        let active = moved || party_changed;
        if active {
            self.last_activity = Instant::now();
        }

        self.x = x;
        self.y = y;
        self.map = map;
        self.direction = direction;
        self.party = party;

        active
    }

    pub fn is_inactive(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_activity) >= timeout
    }

    pub fn view(&self) -> PlayerView {
        PlayerView {
            id: self.id,
            x: self.x,
            y: self.y,
            map: self.map.clone(),
            direction: self.direction,
            party: self.party.clone(),
        }
    }
}

struct RegistryState {
    sessions: HashMap<SessionId, Session>,
    next_id: SessionId,
    #[cfg(test)]
    panic_on_sweep: bool,
}

impl RegistryState {
    fn evict_inactive(&mut self, now: Instant, timeout: Duration) -> Vec<SessionId> {
        let expired: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(_, session)| session.is_inactive(now, timeout))
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            self.sessions.remove(id);
        }

        expired
    }
}

struct Sweeper {
    shutdown_tx: watch::Sender<bool>,
    /// Closes when the sweep task's future is dropped, however it ended
    done_rx: watch::Receiver<()>,
    task: JoinHandle<()>,
}

/// Thread-safe registry of connected players
///
/// Share it behind an `Arc` with whatever layer talks to clients. The sweep
/// task is not running until [`SessionRegistry::start`] is called.
pub struct SessionRegistry {
    state: Arc<Mutex<RegistryState>>,
    sweeper: Mutex<Option<Sweeper>>,
    config: RegistryConfig,
}

impl SessionRegistry {
    pub fn new(config: RegistryConfig) -> Result<Self, RegistryError> {
        config.validate()?;

        Ok(Self {
            state: Arc::new(Mutex::new(RegistryState {
                sessions: HashMap::new(),
                next_id: 0,
                #[cfg(test)]
                panic_on_sweep: false,
            })),
            sweeper: Mutex::new(None),
            config,
        })
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Allocates a fresh session and returns its identifier
    pub async fn register(&self) -> SessionId {
        let mut state = self.state.lock().await;

        let id = state.next_id;
        state.next_id += 1;
        state.sessions.insert(id, Session::new(id));

        info!("Session {} registered", id);
        id
    }

    /// Applies a state report from a client
    ///
    /// Returns false without touching anything if the session is unknown,
    /// which tells the caller the client has to register again.
    pub async fn update(
        &self,
        id: SessionId,
        x: f32,
        y: f32,
        map: impl Into<String>,
        direction: Direction,
        party: Option<PartySnapshot>,
    ) -> bool {
        let map = map.into();
        let mut state = self.state.lock().await;

        match state.sessions.get_mut(&id) {
            Some(session) => {
                session.apply_update(x, y, map, direction, party, self.config.activity_policy);
                true
            }
            None => {
                debug!("Update for unknown session {}", id);
                false
            }
        }
    }

    /// Point-in-time copy of every registered session
    pub async fn list(&self) -> HashMap<SessionId, PlayerView> {
        let state = self.state.lock().await;
        state
            .sessions
            .iter()
            .map(|(id, session)| (*id, session.view()))
            .collect()
    }

    /// Removes a session. Unknown identifiers are ignored.
    ///
    /// Returns true if a session was actually removed.
    pub async fn unregister(&self, id: SessionId) -> bool {
        let mut state = self.state.lock().await;
        if state.sessions.remove(&id).is_some() {
            info!("Session {} unregistered", id);
            true
        } else {
            false
        }
    }

    pub async fn last_activity(&self, id: SessionId) -> Option<Instant> {
        let state = self.state.lock().await;
        state.sessions.get(&id).map(|session| session.last_activity)
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.sessions.is_empty()
    }

    /// Runs one eviction pass and returns the removed identifiers
    pub async fn sweep(&self) -> Vec<SessionId> {
        sweep_once(&self.state, self.config.timeout).await
    }

    /// Spawns the background sweep task. Does nothing if it is already running.
    ///
    /// If a previous sweep task died, its failure is returned instead and
    /// nothing is spawned; calling `start` again launches a fresh task.
    pub async fn start(&self) -> Result<(), RegistryError> {
        let mut sweeper = self.sweeper.lock().await;
        if let Some(existing) = sweeper.as_ref() {
            if !existing.task.is_finished() {
                return Ok(());
            }
            if let Some(dead) = sweeper.take() {
                if let Err(e) = dead.task.await {
                    if e.is_panic() {
                        error!("Session sweeper had crashed: {}", e);
                        return Err(RegistryError::SweepTaskFailed(e));
                    }
                }
            }
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(());
        let task = tokio::spawn(run_sweeper(
            Arc::clone(&self.state),
            self.config.timeout,
            self.config.check_interval,
            shutdown_rx,
            done_tx,
        ));

        info!(
            "Session sweeper started (timeout {:?}, interval {:?})",
            self.config.timeout, self.config.check_interval
        );
        *sweeper = Some(Sweeper {
            shutdown_tx,
            done_rx,
            task,
        });
        Ok(())
    }

    /// Resolves once the running sweep task dies on its own
    ///
    /// A sweep ended through [`SessionRegistry::stop`] is not a failure, and
    /// with no sweep task running this never resolves. Meant to sit in a
    /// `select!` next to the owner's main loop; keep the same future pinned
    /// across iterations rather than recreating it.
    pub async fn sweep_failure(&self) -> RegistryError {
        loop {
            let done_rx = self
                .sweeper
                .lock()
                .await
                .as_ref()
                .map(|sweeper| sweeper.done_rx.clone());
            let Some(mut done_rx) = done_rx else {
                return std::future::pending().await;
            };

            while done_rx.changed().await.is_ok() {}

            // stop() takes the sweeper before signalling, so finding it here
            // means nobody asked the task to exit
            let sweeper = self.sweeper.lock().await.take();
            let Some(sweeper) = sweeper else {
                return std::future::pending().await;
            };
            match sweeper.task.await {
                Err(e) if !e.is_cancelled() => {
                    error!("Session sweeper crashed: {}", e);
                    return RegistryError::SweepTaskFailed(e);
                }
                _ => warn!("Session sweeper exited unexpectedly"),
            }
        }
    }

    /// Makes every following sweep pass panic while holding the lock
    #[cfg(test)]
    pub(crate) async fn set_sweep_panics(&self, panics: bool) {
        self.state.lock().await.panic_on_sweep = panics;
    }

    pub async fn is_running(&self) -> bool {
        self.sweeper
            .lock()
            .await
            .as_ref()
            .is_some_and(|sweeper| !sweeper.task.is_finished())
    }

    /// Signals the sweep task to exit and waits for it
    ///
    /// Waits at most `shutdown_grace`; past that the task is aborted. A
    /// panic inside the sweep task is reported as an error since the
    /// registry can no longer be trusted to evict anything.
    pub async fn stop(&self) -> Result<(), RegistryError> {
        let Some(Sweeper {
            shutdown_tx,
            mut task,
            ..
        }) = self.sweeper.lock().await.take()
        else {
            return Ok(());
        };

        let _ = shutdown_tx.send(true);

        match tokio::time::timeout(self.config.shutdown_grace, &mut task).await {
            Ok(Ok(())) => {
                info!("Session sweeper stopped");
                Ok(())
            }
            Ok(Err(e)) if e.is_cancelled() => Ok(()),
            Ok(Err(e)) => Err(RegistryError::SweepTaskFailed(e)),
            Err(_) => {
                warn!(
                    "Session sweeper did not stop within {:?}, aborting",
                    self.config.shutdown_grace
                );
                task.abort();
                Ok(())
            }
        }
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.get_mut().take() {
            sweeper.task.abort();
        }
    }
}

async fn sweep_once(state: &Mutex<RegistryState>, timeout: Duration) -> Vec<SessionId> {
    let now = Instant::now();
    let evicted = {
        let mut state = state.lock().await;
        #[cfg(test)]
        if state.panic_on_sweep {
            panic!("sweep pass failed");
        }
        state.evict_inactive(now, timeout)
    };

    for id in &evicted {
        info!("Session {} evicted after {:?} of inactivity", id, timeout);
    }

    evicted
}

async fn run_sweeper(
    state: Arc<Mutex<RegistryState>>,
    timeout: Duration,
    check_interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
    _done_tx: watch::Sender<()>,
) {
    let mut ticker = interval_at(Instant::now() + check_interval, check_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let evicted = sweep_once(&state, timeout).await;
                if !evicted.is_empty() {
                    debug!("Sweep removed {} session(s)", evicted.len());
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::PartyValue;
    use std::collections::HashSet;

    fn test_registry() -> SessionRegistry {
        SessionRegistry::new(RegistryConfig::default()).unwrap()
    }

    fn party(name: &str, hp: i64) -> PartySnapshot {
        let mut party = PartySnapshot::new();
        party.insert("name".to_string(), PartyValue::from(name));
        party.insert("hp".to_string(), PartyValue::Int(hp));
        party
    }

    #[test]
    fn test_config_defaults() {
        let config = RegistryConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(60));
        assert_eq!(config.check_interval, Duration::from_secs(10));
        assert_eq!(config.activity_policy, ActivityPolicy::MovementOnly);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_rejects_interval_not_shorter_than_timeout() {
        let config = RegistryConfig {
            timeout: Duration::from_secs(10),
            check_interval: Duration::from_secs(10),
            ..RegistryConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(RegistryError::InvalidConfig(_))
        ));
        assert!(SessionRegistry::new(config).is_err());
    }

    #[test]
    fn test_config_rejects_zero_interval() {
        let config = RegistryConfig {
            check_interval: Duration::ZERO,
            ..RegistryConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_defaults() {
        let session = Session::new(7);
        assert_eq!(session.id, 7);
        assert_eq!(session.x, 0.0);
        assert_eq!(session.y, 0.0);
        assert_eq!(session.map, "");
        assert_eq!(session.direction, Direction::Down);
        assert!(session.party.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_inactivity_boundary() {
        let session = Session::new(1);
        let timeout = Duration::from_secs(60);

        assert!(!session.is_inactive(session.last_activity + Duration::from_secs(59), timeout));
        assert!(session.is_inactive(session.last_activity + timeout, timeout));
    }

    #[tokio::test]
    async fn test_register_sequential_ids() {
        let registry = test_registry();

        for expected in 0..10 {
            assert_eq!(registry.register().await, expected);
        }
        assert_eq!(registry.len().await, 10);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_register_concurrent_ids_unique() {
        let registry = Arc::new(test_registry());

        let handles: Vec<_> = (0..200)
            .map(|_| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move { registry.register().await })
            })
            .collect();

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        ids.sort_unstable();

        assert_eq!(ids, (0..200).collect::<Vec<SessionId>>());
    }

    #[tokio::test]
    async fn test_ids_never_reused() {
        let registry = test_registry();

        let first = registry.register().await;
        registry.unregister(first).await;
        let second = registry.register().await;

        assert_eq!(first, 0);
        assert_eq!(second, 1);
    }

    #[tokio::test]
    async fn test_update_unknown_session() {
        let registry = test_registry();

        let updated = registry
            .update(999, 1.0, 2.0, "town.tmx", Direction::Up, None)
            .await;

        assert!(!updated);
        assert!(registry.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_update_stores_state() {
        let registry = test_registry();
        let id = registry.register().await;

        let updated = registry
            .update(id, 32.0, 64.0, "route1.tmx", Direction::Right, Some(party("Eevee", 20)))
            .await;
        assert!(updated);

        let players = registry.list().await;
        let view = &players[&id];
        assert_eq!(view.id, id);
        assert_eq!(view.x, 32.0);
        assert_eq!(view.y, 64.0);
        assert_eq!(view.map, "route1.tmx");
        assert_eq!(view.direction, Direction::Right);
        assert_eq!(view.party, Some(party("Eevee", 20)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_identical_update_keeps_activity() {
        let registry = test_registry();
        let id = registry.register().await;

        registry
            .update(id, 5.0, 5.0, "town.tmx", Direction::Down, None)
            .await;
        let first = registry.last_activity(id).await.unwrap();

        tokio::time::advance(Duration::from_secs(5)).await;
        registry
            .update(id, 5.0, 5.0, "town.tmx", Direction::Down, None)
            .await;
        let second = registry.last_activity(id).await.unwrap();
        assert_eq!(first, second);

        tokio::time::advance(Duration::from_secs(5)).await;
        registry
            .update(id, 6.0, 5.0, "town.tmx", Direction::Down, None)
            .await;
        let third = registry.last_activity(id).await.unwrap();
        assert!(third > second);
        assert_eq!(third - first, Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_nan_position_still_times_out() {
        let registry = test_registry();
        let id = registry.register().await;

        registry
            .update(id, f32::NAN, 5.0, "town.tmx", Direction::Down, None)
            .await;
        let first = registry.last_activity(id).await.unwrap();

        for _ in 0..7 {
            tokio::time::advance(Duration::from_secs(10)).await;
            registry
                .update(id, f32::NAN, 5.0, "town.tmx", Direction::Down, None)
                .await;
        }

        assert_eq!(registry.last_activity(id).await.unwrap(), first);
        assert_eq!(registry.sweep().await, vec![id]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_direction_change_refreshes_activity() {
        let registry = test_registry();
        let id = registry.register().await;
        let registered = registry.last_activity(id).await.unwrap();

        tokio::time::advance(Duration::from_secs(3)).await;
        registry
            .update(id, 0.0, 0.0, "", Direction::Left, None)
            .await;

        let refreshed = registry.last_activity(id).await.unwrap();
        assert_eq!(refreshed - registered, Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_party_change_alone_does_not_refresh_by_default() {
        let registry = test_registry();
        let id = registry.register().await;
        registry
            .update(id, 1.0, 1.0, "town.tmx", Direction::Down, Some(party("Onix", 40)))
            .await;
        let before = registry.last_activity(id).await.unwrap();

        tokio::time::advance(Duration::from_secs(5)).await;
        registry
            .update(id, 1.0, 1.0, "town.tmx", Direction::Down, Some(party("Onix", 0)))
            .await;

        assert_eq!(registry.last_activity(id).await.unwrap(), before);
        // overwritten even though it did not count as activity
        assert_eq!(registry.list().await[&id].party, Some(party("Onix", 0)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_party_change_refreshes_with_any_change_policy() {
        let config = RegistryConfig {
            activity_policy: ActivityPolicy::AnyChange,
            ..RegistryConfig::default()
        };
        let registry = SessionRegistry::new(config).unwrap();
        let id = registry.register().await;
        registry
            .update(id, 1.0, 1.0, "town.tmx", Direction::Down, Some(party("Onix", 40)))
            .await;
        let before = registry.last_activity(id).await.unwrap();

        tokio::time::advance(Duration::from_secs(5)).await;
        registry
            .update(id, 1.0, 1.0, "town.tmx", Direction::Down, Some(party("Onix", 0)))
            .await;

        assert!(registry.last_activity(id).await.unwrap() > before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_evicts_after_timeout() {
        let registry = test_registry();
        let stale = registry.register().await;

        tokio::time::advance(Duration::from_secs(30)).await;
        let fresh = registry.register().await;

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(registry.sweep().await.is_empty());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(registry.sweep().await, vec![stale]);

        let players = registry.list().await;
        assert!(!players.contains_key(&stale));
        assert!(players.contains_key(&fresh));
        assert!(
            !registry
                .update(stale, 1.0, 1.0, "town.tmx", Direction::Up, None)
                .await
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sweep_evicts_idle_session() {
        let registry = test_registry();
        registry.start().await.unwrap();
        assert!(registry.is_running().await);

        let idle = registry.register().await;
        let active = registry.register().await;

        // keep one session moving, leave the other alone
        for step in 1..=8 {
            tokio::time::sleep(Duration::from_secs(10)).await;
            registry
                .update(active, step as f32, 0.0, "town.tmx", Direction::Right, None)
                .await;
        }

        let players = registry.list().await;
        assert!(!players.contains_key(&idle));
        assert!(players.contains_key(&active));
        assert!(
            !registry
                .update(idle, 1.0, 1.0, "town.tmx", Direction::Up, None)
                .await
        );

        registry.stop().await.unwrap();
        assert!(!registry.is_running().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_heartbeat_still_times_out() {
        let registry = test_registry();
        registry.start().await.unwrap();
        let id = registry.register().await;
        registry
            .update(id, 3.0, 4.0, "town.tmx", Direction::Down, None)
            .await;

        for _ in 0..7 {
            tokio::time::sleep(Duration::from_secs(10)).await;
            registry
                .update(id, 3.0, 4.0, "town.tmx", Direction::Down, None)
                .await;
        }

        assert!(registry.list().await.is_empty());
        registry.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_unregister_idempotent() {
        let registry = test_registry();
        let keep = registry.register().await;
        let gone = registry.register().await;

        assert!(registry.unregister(gone).await);
        let after_first = registry.list().await;

        assert!(!registry.unregister(gone).await);
        assert!(!registry.unregister(12345).await);
        let after_second = registry.list().await;

        assert_eq!(after_first, after_second);
        assert!(after_second.contains_key(&keep));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_list_is_a_snapshot() {
        let registry = test_registry();
        let id = registry.register().await;
        registry
            .update(id, 1.0, 2.0, "town.tmx", Direction::Up, Some(party("Mew", 10)))
            .await;

        let mut snapshot = registry.list().await;

        registry
            .update(id, 9.0, 9.0, "cave.tmx", Direction::Left, Some(party("Mew", 1)))
            .await;

        let view = &snapshot[&id];
        assert_eq!(view.x, 1.0);
        assert_eq!(view.y, 2.0);
        assert_eq!(view.map, "town.tmx");
        assert_eq!(view.direction, Direction::Up);
        assert_eq!(view.party, Some(party("Mew", 10)));

        // and mutating the copy leaves the registry alone
        snapshot.get_mut(&id).unwrap().map = "elsewhere".to_string();
        assert_eq!(registry.list().await[&id].map, "cave.tmx");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_updates_distinct_sessions() {
        let registry = Arc::new(test_registry());

        let mut ids = Vec::new();
        for _ in 0..64 {
            ids.push(registry.register().await);
        }

        let handles: Vec<_> = ids
            .iter()
            .map(|&id| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    for step in 0..20 {
                        let map = format!("map-{}", id);
                        registry
                            .update(
                                id,
                                id as f32,
                                step as f32,
                                map,
                                Direction::Up,
                                Some(party(&format!("mon-{}", id), step)),
                            )
                            .await;
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap();
        }

        let players = registry.list().await;
        assert_eq!(players.len(), ids.len());
        let seen: HashSet<SessionId> = players.keys().copied().collect();
        assert_eq!(seen, ids.iter().copied().collect());

        for id in ids {
            let view = &players[&id];
            assert_eq!(view.x, id as f32);
            assert_eq!(view.y, 19.0);
            assert_eq!(view.map, format!("map-{}", id));
            assert_eq!(view.party, Some(party(&format!("mon-{}", id), 19)));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_prompt_and_repeatable() {
        let registry = test_registry();
        registry.start().await.unwrap();
        registry.start().await.unwrap();

        let started = Instant::now();
        registry.stop().await.unwrap();
        assert!(started.elapsed() < registry.config().shutdown_grace);

        // stopping again, or without a running task, is fine
        registry.stop().await.unwrap();
        assert!(!registry.is_running().await);

        // the registry keeps working after shutdown
        let id = registry.register().await;
        assert!(registry.unregister(id).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_after_stop() {
        let registry = test_registry();
        registry.start().await.unwrap();
        registry.stop().await.unwrap();

        registry.start().await.unwrap();
        assert!(registry.is_running().await);

        registry.register().await;
        tokio::time::sleep(Duration::from_secs(75)).await;
        assert!(registry.is_empty().await);

        registry.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_failure_resolves_when_task_panics() {
        let registry = test_registry();
        registry.start().await.unwrap();
        registry.set_sweep_panics(true).await;

        let error = tokio::time::timeout(Duration::from_secs(30), registry.sweep_failure())
            .await
            .expect("sweep failure was never reported");

        match error {
            RegistryError::SweepTaskFailed(e) => assert!(e.is_panic()),
            other => panic!("Unexpected error: {:?}", other),
        }
        assert!(!registry.is_running().await);
        assert!(registry.stop().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_failure_pending_after_clean_stop() {
        let registry = test_registry();
        registry.start().await.unwrap();

        let (stopped, failure) = tokio::join!(
            async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                registry.stop().await
            },
            tokio::time::timeout(Duration::from_secs(30), registry.sweep_failure())
        );

        assert!(stopped.is_ok());
        assert!(failure.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_reports_panicked_sweep() {
        let registry = test_registry();
        registry.start().await.unwrap();
        registry.set_sweep_panics(true).await;

        tokio::time::sleep(Duration::from_secs(15)).await;
        assert!(!registry.is_running().await);

        assert!(matches!(
            registry.stop().await,
            Err(RegistryError::SweepTaskFailed(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_reports_previous_panic_then_restarts() {
        let registry = test_registry();
        registry.start().await.unwrap();
        registry.set_sweep_panics(true).await;

        tokio::time::sleep(Duration::from_secs(15)).await;
        assert!(matches!(
            registry.start().await,
            Err(RegistryError::SweepTaskFailed(_))
        ));
        assert!(!registry.is_running().await);

        registry.set_sweep_panics(false).await;
        registry.start().await.unwrap();
        assert!(registry.is_running().await);

        registry.register().await;
        tokio::time::sleep(Duration::from_secs(75)).await;
        assert!(registry.is_empty().await);

        registry.stop().await.unwrap();
    }
}
