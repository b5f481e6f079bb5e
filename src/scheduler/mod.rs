//! Periodic refresh scheduler.
//!
//! One background loop wakes every tick, lists enabled credentials and spawns
//! an independent refresh task for each one that is due. The loop never waits
//! for those tasks. A credential whose previous attempt is still running is
//! skipped until that attempt finishes.

use crate::credentials::CredentialStore;
use crate::refresher::RefreshEngine;
use dashmap::DashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default period between ticks.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(60);

/// Owns the tick loop. Idle until [`Scheduler::start`], idle again after
/// [`Scheduler::stop`].
pub struct Scheduler {
    dispatcher: Dispatcher,
    tick_interval: Duration,
    running: Mutex<Option<RunningLoop>>,
}

struct RunningLoop {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Per-tick work, cloned into the loop task.
#[derive(Clone)]
struct Dispatcher {
    store: Arc<CredentialStore>,
    engine: Arc<RefreshEngine>,
    /// Ids of credentials with an attempt in progress
    in_flight: Arc<DashSet<i64>>,
}

/// Removes a credential from the in-flight set when its attempt ends,
/// including when the task panics.
struct InFlightGuard {
    in_flight: Arc<DashSet<i64>>,
    credential_id: i64,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.remove(&self.credential_id);
    }
}

impl Dispatcher {
    fn try_acquire(&self, credential_id: i64) -> Option<InFlightGuard> {
        if !self.in_flight.insert(credential_id) {
            return None;
        }
        Some(InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
            credential_id,
        })
    }

    /// Dispatches every due credential. Returns how many attempts were spawned.
    fn tick(&self) -> usize {
        let credentials = match self.store.list_enabled() {
            Ok(credentials) => credentials,
            Err(e) => {
                error!(error = %e, "Failed to list enabled credentials");
                return 0;
            }
        };

        let mut dispatched = 0;
        for credential in credentials {
            if !self.engine.should_refresh(&credential) {
                continue;
            }

            let Some(guard) = self.try_acquire(credential.id) else {
                debug!(
                    credential_id = credential.id,
                    "Refresh already in progress, skipping"
                );
                continue;
            };

            let engine = Arc::clone(&self.engine);
            tokio::spawn(async move {
                let _guard = guard;
                if let Err(e) = engine.refresh(&credential).await {
                    error!(
                        credential_id = credential.id,
                        name = %credential.name,
                        error = %e,
                        "Scheduled refresh failed"
                    );
                }
            });
            dispatched += 1;
        }

        if dispatched > 0 {
            info!(dispatched, "Dispatched token refreshes");
        }
        dispatched
    }
}

impl Scheduler {
    /// Creates an idle scheduler. A zero interval falls back to the default.
    pub fn new(
        store: Arc<CredentialStore>,
        engine: Arc<RefreshEngine>,
        tick_interval: Duration,
    ) -> Self {
        let tick_interval = if tick_interval.is_zero() {
            DEFAULT_TICK_INTERVAL
        } else {
            tick_interval
        };

        Self {
            dispatcher: Dispatcher {
                store,
                engine,
                in_flight: Arc::new(DashSet::new()),
            },
            tick_interval,
            running: Mutex::new(None),
        }
    }

    fn running(&self) -> MutexGuard<'_, Option<RunningLoop>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawns the tick loop. The first tick runs immediately.
    ///
    /// Calling this while already running logs a warning and does nothing.
    pub fn start(&self) {
        let mut running = self.running();
        if running.is_some() {
            warn!("Scheduler already running, ignoring start");
            return;
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let dispatcher = self.dispatcher.clone();
        let period = self.tick_interval;

        let handle = tokio::spawn(async move {
            info!(interval_secs = period.as_secs(), "Refresh scheduler started");

            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        info!("Refresh scheduler stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        dispatcher.tick();
                    }
                }
            }
        });

        *running = Some(RunningLoop { cancel, handle });
    }

    /// Stops the tick loop and waits for it to exit.
    ///
    /// In-flight refresh attempts keep running. Stopping an idle scheduler is
    /// a no-op.
    pub async fn stop(&self) {
        let running = self.running().take();
        let Some(running) = running else {
            debug!("Scheduler not running, nothing to stop");
            return;
        };

        running.cancel.cancel();
        if let Err(e) = running.handle.await {
            if !e.is_cancelled() {
                error!(error = %e, "Scheduler loop ended abnormally");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running().is_some()
    }

    /// Runs a single tick on the caller's runtime.
    pub fn run_tick(&self) -> usize {
        self.dispatcher.tick()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{CredentialConfig, NewCredential, RefreshStatus};
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use chrono::{Duration as ChronoDuration, Utc};
    use std::collections::BTreeMap;

    fn make_store() -> Arc<CredentialStore> {
        let key = BASE64.encode([0u8; 32]);
        Arc::new(CredentialStore::new(":memory:", &key).expect("Failed to create test store"))
    }

    fn make_scheduler(store: &Arc<CredentialStore>, tick: Duration) -> Scheduler {
        let engine = Arc::new(RefreshEngine::new(Arc::clone(store)));
        Scheduler::new(Arc::clone(store), engine, tick)
    }

    fn create(store: &CredentialStore, name: &str, url: &str) -> i64 {
        store
            .create(NewCredential {
                config: CredentialConfig {
                    name: name.to_string(),
                    description: String::new(),
                    refresh_url: url.to_string(),
                    refresh_method: "POST".to_string(),
                    refresh_headers: BTreeMap::new(),
                    refresh_body_template: String::new(),
                    access_token_path: "access_token".to_string(),
                    refresh_token_path: "refresh_token".to_string(),
                    expires_in_path: Some("expires_in".to_string()),
                    custom_variables: String::new(),
                    refresh_before_seconds: 300,
                },
                refresh_token: "seed".to_string(),
            })
            .unwrap()
            .id
    }

    async fn wait_for_logs(store: &CredentialStore, id: i64, count: usize) -> bool {
        for _ in 0..100 {
            if store.list_logs(id, 50).unwrap().len() >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    async fn token_server() -> (mockito::ServerGuard, mockito::Mock) {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/token")
            .with_status(200)
            .with_body(r#"{"access_token":"ACCESS","refresh_token":"REFRESH","expires_in":3600}"#)
            .create_async()
            .await;
        (server, mock)
    }

    #[tokio::test]
    async fn test_tick_dispatches_due_credential() {
        let (server, _mock) = token_server().await;
        let store = make_store();
        let id = create(&store, "due", &format!("{}/token", server.url()));
        let scheduler = make_scheduler(&store, DEFAULT_TICK_INTERVAL);

        assert_eq!(scheduler.run_tick(), 1);
        assert!(wait_for_logs(&store, id, 1).await);

        let stored = store.get(id).unwrap().unwrap();
        assert_eq!(stored.current_access_token, "ACCESS");
        assert_eq!(stored.last_refresh_status, Some(RefreshStatus::Success));
    }

    #[tokio::test]
    async fn test_tick_skips_disabled_and_not_due() {
        let store = make_store();
        let disabled = create(&store, "disabled", "http://127.0.0.1:1/token");
        store.toggle(disabled).unwrap();

        let fresh = create(&store, "fresh", "http://127.0.0.1:1/token");
        store
            .update_tokens(
                fresh,
                "tok",
                "ref",
                Some(Utc::now() + ChronoDuration::hours(1)),
                RefreshStatus::Success,
            )
            .unwrap();

        let scheduler = make_scheduler(&store, DEFAULT_TICK_INTERVAL);
        assert_eq!(scheduler.run_tick(), 0);
        assert!(store.list_logs(disabled, 50).unwrap().is_empty());
        assert!(store.list_logs(fresh, 50).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_in_flight_credential_is_skipped() {
        let store = make_store();
        let id = create(&store, "busy", "http://127.0.0.1:1/token");
        let scheduler = make_scheduler(&store, DEFAULT_TICK_INTERVAL);

        let guard = scheduler.dispatcher.try_acquire(id).expect("first acquire");
        assert!(scheduler.dispatcher.try_acquire(id).is_none());
        assert_eq!(scheduler.run_tick(), 0);

        drop(guard);
        assert!(!scheduler.dispatcher.in_flight.contains(&id));
    }

    #[tokio::test]
    async fn test_guard_released_after_attempt() {
        let (server, _mock) = token_server().await;
        let store = make_store();
        let id = create(&store, "release", &format!("{}/token", server.url()));
        let scheduler = make_scheduler(&store, DEFAULT_TICK_INTERVAL);

        assert_eq!(scheduler.run_tick(), 1);
        assert!(wait_for_logs(&store, id, 1).await);

        for _ in 0..100 {
            if !scheduler.dispatcher.in_flight.contains(&id) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!scheduler.dispatcher.in_flight.contains(&id));
    }

    #[tokio::test]
    async fn test_start_runs_first_tick_immediately() {
        let (server, _mock) = token_server().await;
        let store = make_store();
        let id = create(&store, "startup", &format!("{}/token", server.url()));
        let scheduler = make_scheduler(&store, Duration::from_secs(3600));

        scheduler.start();
        assert!(wait_for_logs(&store, id, 1).await);
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let store = make_store();
        let scheduler = make_scheduler(&store, Duration::from_secs(3600));
        assert!(!scheduler.is_running());

        // Stopping an idle scheduler is a no-op
        scheduler.stop().await;
        assert!(!scheduler.is_running());

        scheduler.start();
        assert!(scheduler.is_running());

        // Second start is ignored
        scheduler.start();
        assert!(scheduler.is_running());

        scheduler.stop().await;
        assert!(!scheduler.is_running());

        scheduler.stop().await;
        assert!(!scheduler.is_running());

        // Restart after stop
        scheduler.start();
        assert!(scheduler.is_running());
        scheduler.stop().await;
    }

    #[test]
    fn test_zero_interval_falls_back_to_default() {
        let store = make_store();
        let scheduler = make_scheduler(&store, Duration::ZERO);
        assert_eq!(scheduler.tick_interval, DEFAULT_TICK_INTERVAL);
    }
}
