//! Owner of the session lifecycle.
//!
//! `SessionManager` is the only place that decides when a session starts,
//! when its credential is refreshed, and when it ends. Everything it needs is
//! passed in at construction; there is no ambient global session.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use futures::FutureExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::state::{InFlight, SessionState};
use crate::auth::{Claims, Credential, CredentialValidator};
use crate::clock::Clock;
use crate::config::SessionConfig;
use crate::error::{ConfigError, RefreshError, SessionError};
use crate::events::{ExpiryReason, SessionEvent, SessionEventBus, SessionEventKind, Subscription};
use crate::monitor::{MonitorSignal, MonitorState, SessionMonitor};
use crate::refresh::CredentialRefresher;
use crate::vault::CredentialVault;

struct Inner {
    config: SessionConfig,
    vault: CredentialVault,
    refresher: CredentialRefresher,
    validator: CredentialValidator,
    monitor: SessionMonitor,
    bus: SessionEventBus,
    clock: Arc<dyn Clock>,
    /// Held across a state transition and the vault write or clear that goes
    /// with it, so a sign-out cannot interleave with a store. Taken before
    /// `state`; never held while publishing.
    persist: Mutex<()>,
    state: Mutex<SessionState>,
}

/// Cloneable handle; clones share one session.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    /// Must be called from within a tokio runtime: it spawns the task that
    /// reacts to expiry timers.
    pub fn new(
        config: SessionConfig,
        vault: CredentialVault,
        refresher: CredentialRefresher,
        validator: CredentialValidator,
        bus: SessionEventBus,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let (tx, rx) = mpsc::unbounded_channel();
        let monitor = SessionMonitor::new(validator.clone(), config.warning_lead_secs, tx);
        let inner = Arc::new(Inner {
            config,
            vault,
            refresher,
            validator,
            monitor,
            bus,
            clock,
            persist: Mutex::new(()),
            state: Mutex::new(SessionState::default()),
        });

        tokio::spawn(drive_monitor(Arc::downgrade(&inner), rx));
        Ok(Self { inner })
    }

    // ===== Lifecycle =====

    /// Start a session with a freshly issued credential, replacing any live one.
    pub fn login(&self, credential: Credential) -> Result<u64, SessionError> {
        if !CredentialValidator::is_structurally_valid(&credential) {
            warn!("Rejecting malformed credential at login");
            return Err(SessionError::Structural);
        }
        let now = self.now();
        if self.inner.validator.is_expired(&credential, now) {
            warn!("Rejecting expired credential at login");
            return Err(SessionError::Expired);
        }

        self.end_session(None, None);
        let credential = Arc::new(credential);
        let generation = {
            let _persist = self.lock_persist();
            self.inner.vault.store(&credential)?;
            self.start_locked(&credential, now)
        };
        self.announce_started(generation);
        Ok(generation)
    }

    /// Restore the persisted session at app start. Returns whether a session
    /// is live afterwards.
    pub async fn bootstrap(&self) -> bool {
        if self.is_live() {
            return true;
        }
        let credential = match self.inner.vault.retrieve() {
            Ok(Some(credential)) => credential,
            Ok(None) => return false,
            Err(e) => {
                warn!(error = %e, "Could not read persisted session");
                return false;
            }
        };

        let now = self.now();
        let due = self.needs_refresh(&credential, now);
        self.activate(credential, now);
        if !due {
            return true;
        }

        info!("Restored credential is due for refresh");
        if let Err(e) = self.refresh().await {
            debug!(error = %e, "Refresh after restore failed");
        }
        self.is_live()
    }

    /// The credential to use for the next request, refreshed first if it is
    /// inside the refresh window. `None` means there is no usable session.
    pub async fn current_credential(&self) -> Option<Arc<Credential>> {
        let live = self.live_generation();
        match (self.inner.vault.retrieve(), live) {
            (Ok(None), Some(generation)) => {
                warn!(generation, "Persisted credential missing or rejected, ending session");
                self.end_session(Some(generation), Some(ExpiryReason::InvalidCredential));
                return None;
            }
            (Ok(None), None) => return None,
            (Ok(Some(credential)), None) => {
                let now = self.now();
                self.activate(credential, now);
            }
            (Ok(Some(_)), Some(_)) => {}
            (Err(e), Some(_)) => {
                warn!(error = %e, "Vault unreadable, continuing with in-memory credential");
            }
            (Err(e), None) => {
                warn!(error = %e, "Vault unreadable and no live session");
                return None;
            }
        }

        let active = self.lock_state().active.clone()?;
        if !self.needs_refresh(&active, self.now()) {
            return Some(active);
        }
        match self.refresh().await {
            Ok(credential) => Some(credential),
            Err(e) => {
                debug!(error = %e, "No usable credential after refresh");
                None
            }
        }
    }

    /// Refresh the active credential. Concurrent callers share one exchange
    /// and all receive the same result.
    pub async fn refresh(&self) -> Result<Arc<Credential>, RefreshError> {
        let future = {
            let mut state = self.lock_state();
            let Some(generation) = state.live_generation() else {
                return Err(RefreshError::NoSession);
            };
            let joined = state
                .refresh_in_flight
                .as_ref()
                .map(|flight| (flight.id, flight.future.clone()));
            match joined {
                Some((id, future)) => {
                    debug!(flight = id, "Joining in-flight refresh");
                    future
                }
                None => {
                    let Some(current) = state.active.clone() else {
                        return Err(RefreshError::NoSession);
                    };
                    state.next_flight_id += 1;
                    let id = state.next_flight_id;

                    // Spawned so the exchange settles even if every caller
                    // stops waiting.
                    let task = tokio::spawn(self.clone().run_refresh(current, generation, id));
                    let future = async move {
                        task.await.unwrap_or_else(|e| {
                            warn!(error = %e, "Refresh task did not complete");
                            Err(RefreshError::SessionEnded)
                        })
                    }
                    .boxed()
                    .shared();
                    state.refresh_in_flight = Some(InFlight {
                        id,
                        future: future.clone(),
                    });
                    future
                }
            }
        };
        future.await
    }

    /// Coarse user-interaction signal. Re-arms the monitor from the current
    /// credential's real remaining lifetime; never extends past expiry.
    pub fn record_activity(&self) {
        let Some(active) = self.lock_state().active.clone() else {
            return;
        };
        if self.inner.monitor.state() == MonitorState::Expired {
            return;
        }
        let now = self.now();
        if self.inner.validator.is_expired(&active, now) {
            return;
        }
        self.inner.monitor.arm(&active, now);
    }

    /// Explicit sign-out. Returns false if no session was live.
    pub fn logout(&self) -> bool {
        self.end_session(None, None)
    }

    // ===== Queries =====

    pub fn is_live(&self) -> bool {
        self.live_generation().is_some()
    }

    /// Generation of the live session, if any.
    pub fn live_generation(&self) -> Option<u64> {
        self.lock_state().live_generation()
    }

    pub fn claims(&self) -> Option<Claims> {
        let active = self.lock_state().active.clone()?;
        self.inner.validator.decoder().decode(&active.access_token).ok()
    }

    pub fn seconds_until_expiry(&self) -> Option<i64> {
        let active = self.lock_state().active.clone()?;
        self.inner.validator.seconds_until_expiry(&active, self.now())
    }

    pub fn monitor_state(&self) -> MonitorState {
        self.inner.monitor.state()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn vault(&self) -> &CredentialVault {
        &self.inner.vault
    }

    pub fn events(&self) -> &SessionEventBus {
        &self.inner.bus
    }

    pub fn subscribe<F>(&self, kind: SessionEventKind, handler: F) -> Subscription
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.inner.bus.subscribe(kind, handler)
    }

    // ===== Internals =====

    fn now(&self) -> i64 {
        self.inner.clock.now()
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_persist(&self) -> MutexGuard<'_, ()> {
        self.inner.persist.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn needs_refresh(&self, credential: &Credential, now: i64) -> bool {
        self.inner.validator.is_expired(credential, now)
            || self.inner.validator.is_within_refresh_window(
                credential,
                now,
                self.inner.config.refresh_window_secs,
            )
    }

    /// Start a session around a credential that is already persisted.
    fn activate(&self, credential: Credential, now: i64) -> u64 {
        let credential = Arc::new(credential);
        let generation = {
            let _persist = self.lock_persist();
            self.start_locked(&credential, now)
        };
        self.announce_started(generation);
        generation
    }

    /// Caller holds `persist`.
    fn start_locked(&self, credential: &Arc<Credential>, now: i64) -> u64 {
        let generation = self.lock_state().start(credential.clone());
        self.inner.monitor.arm(credential, now);
        generation
    }

    fn announce_started(&self, generation: u64) {
        info!(generation, "Session started");
        self.inner
            .bus
            .publish(SessionEvent::SessionStarted { generation });
    }

    /// Tear down the live session once. `reason` of `None` is a sign-out.
    /// Returns false when the session was already gone, so racing callers
    /// publish at most one event.
    fn end_session(&self, expected: Option<u64>, reason: Option<ExpiryReason>) -> bool {
        let ended = {
            let _persist = self.lock_persist();
            let Some(ended) = self.lock_state().end(expected) else {
                return false;
            };
            self.inner.monitor.disarm();
            self.inner.vault.clear();
            ended
        };

        let event = match reason {
            Some(reason) => {
                warn!(generation = ended, ?reason, "Session expired");
                SessionEvent::SessionExpired {
                    generation: ended,
                    reason,
                }
            }
            None => {
                info!(generation = ended, "Session ended");
                SessionEvent::SessionEnded { generation: ended }
            }
        };
        self.inner.bus.publish(event);
        true
    }

    async fn run_refresh(
        self,
        current: Arc<Credential>,
        generation: u64,
        flight_id: u64,
    ) -> Result<Arc<Credential>, RefreshError> {
        let outcome = match self.inner.refresher.refresh(&current).await {
            Ok(credential) => self.adopt_refreshed(credential, generation),
            Err(e) => Err(e),
        };

        if let Err(e) = &outcome {
            let reason = match e {
                RefreshError::RefreshRejected(_) => Some(ExpiryReason::RefreshRejected),
                RefreshError::RefreshExhausted { .. } => Some(ExpiryReason::RefreshExhausted),
                _ => None,
            };
            if reason.is_some() {
                self.end_session(Some(generation), reason);
            }
        }

        {
            let mut state = self.lock_state();
            if state
                .refresh_in_flight
                .as_ref()
                .is_some_and(|flight| flight.id == flight_id)
            {
                state.refresh_in_flight = None;
            }
        }
        outcome
    }

    fn adopt_refreshed(
        &self,
        credential: Credential,
        generation: u64,
    ) -> Result<Arc<Credential>, RefreshError> {
        let now = self.now();
        if self.inner.validator.is_expired(&credential, now) {
            return Err(RefreshError::RefreshRejected(
                "issuer returned an already expired credential".to_string(),
            ));
        }

        let credential = Arc::new(credential);
        {
            let _persist = self.lock_persist();
            {
                let mut state = self.lock_state();
                if state.live_generation() != Some(generation) {
                    info!(generation, "Discarding refresh result for ended session");
                    return Err(RefreshError::SessionEnded);
                }
                state.active = Some(credential.clone());
            }

            // The in-memory credential is already current; a failed write
            // leaves the last good envelope in place.
            if let Err(e) = self.inner.vault.store(&credential) {
                warn!(error = %e, "Refreshed credential could not be persisted");
            }
            self.inner.monitor.arm(&credential, now);
        }
        self.inner
            .bus
            .publish(SessionEvent::SessionRefreshed { generation });
        Ok(credential)
    }

    async fn handle_signal(&self, signal: MonitorSignal) {
        if !self.inner.monitor.is_current(signal.arm_id()) {
            debug!(arm_id = signal.arm_id(), "Ignoring stale monitor signal");
            return;
        }
        let Some(generation) = self.live_generation() else {
            return;
        };

        match signal {
            MonitorSignal::Warning {
                seconds_remaining, ..
            } => {
                info!(generation, seconds_remaining, "Session expiring soon");
                self.inner.bus.publish(SessionEvent::ExpiryWarning {
                    generation,
                    seconds_remaining,
                });
            }
            MonitorSignal::Expired { .. } => {
                let can_refresh = self
                    .lock_state()
                    .active
                    .as_ref()
                    .is_some_and(|c| c.has_refresh_token());
                if can_refresh {
                    if let Err(e) = self.refresh().await {
                        debug!(error = %e, "Refresh at expiry failed");
                    }
                } else {
                    self.end_session(Some(generation), Some(ExpiryReason::CredentialExpired));
                }
            }
        }
    }
}

/// Feed monitor signals to the manager for as long as it exists.
async fn drive_monitor(inner: Weak<Inner>, mut signals: mpsc::UnboundedReceiver<MonitorSignal>) {
    while let Some(signal) = signals.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        SessionManager { inner }.handle_signal(signal).await;
    }
    debug!("Session monitor driver stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::InstantClock;
    use crate::error::{ExchangeError, StorageError};
    use crate::testing::{credential_expiring_at, credential_for, ScriptedTransport};
    use crate::vault::{ChaChaCipher, MemoryStorage, StorageMedium};
    use std::time::Duration;

    const NOW: i64 = 1_750_000_000;

    struct Harness {
        manager: SessionManager,
        medium: Arc<MemoryStorage>,
        transport: Arc<ScriptedTransport>,
        events: Arc<Mutex<Vec<SessionEvent>>>,
        clock: InstantClock,
    }

    impl Harness {
        fn new(script: Vec<Result<Credential, ExchangeError>>) -> Self {
            Self::with_delay(script, Duration::ZERO)
        }

        fn with_delay(script: Vec<Result<Credential, ExchangeError>>, delay: Duration) -> Self {
            let config = SessionConfig::default();
            let medium = Arc::new(MemoryStorage::new());
            let cipher = Arc::new(ChaChaCipher::from_key(&[5u8; 32]).unwrap());
            let vault = CredentialVault::new(&config, medium.clone(), cipher);
            let transport = Arc::new(ScriptedTransport::new(script).with_delay(delay));
            let refresher = CredentialRefresher::new(&config, transport.clone());

            let bus = SessionEventBus::new();
            let events = Arc::new(Mutex::new(Vec::new()));
            for kind in [
                SessionEventKind::SessionStarted,
                SessionEventKind::SessionRefreshed,
                SessionEventKind::ExpiryWarning,
                SessionEventKind::SessionExpired,
                SessionEventKind::SessionEnded,
            ] {
                let sink = events.clone();
                let _ = bus.subscribe(kind, move |e| sink.lock().unwrap().push(e.clone()));
            }

            let clock = InstantClock::starting_at(NOW);
            let manager = SessionManager::new(
                config,
                vault,
                refresher,
                CredentialValidator::default(),
                bus,
                Arc::new(clock),
            )
            .unwrap();

            Self {
                manager,
                medium,
                transport,
                events,
                clock,
            }
        }

        fn count(&self, kind: SessionEventKind) -> usize {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter(|e| e.kind() == kind)
                .count()
        }

        fn expired_events(&self) -> Vec<SessionEvent> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter(|e| e.kind() == SessionEventKind::SessionExpired)
                .cloned()
                .collect()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_stores_and_arms() {
        let h = Harness::new(vec![]);
        let generation = h.manager.login(credential_expiring_at(NOW + 3600, 3600)).unwrap();

        assert!(h.manager.is_live());
        assert_eq!(h.manager.live_generation(), Some(generation));
        assert_eq!(h.manager.monitor_state(), MonitorState::Armed);
        assert_eq!(h.medium.keys(), vec!["dpc.session.v2.credential".to_string()]);
        assert_eq!(
            h.manager.claims().unwrap().subject.as_deref(),
            Some("user-1")
        );
        assert_eq!(h.manager.seconds_until_expiry(), Some(3600));
        assert_eq!(
            *h.events.lock().unwrap(),
            vec![SessionEvent::SessionStarted { generation }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_rejects_malformed_and_expired() {
        let h = Harness::new(vec![]);

        let mut malformed = credential_expiring_at(NOW + 3600, 3600);
        malformed.access_token = "not-a-token".to_string();
        assert_eq!(h.manager.login(malformed), Err(SessionError::Structural));

        let expired = credential_expiring_at(NOW, 3600);
        assert_eq!(h.manager.login(expired), Err(SessionError::Expired));

        assert!(!h.manager.is_live());
        assert!(h.medium.keys().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_reports_storage_failure() {
        let h = Harness::new(vec![]);
        h.medium.set_available(false);
        assert!(matches!(
            h.manager.login(credential_expiring_at(NOW + 3600, 3600)),
            Err(SessionError::Storage(_))
        ));
        assert!(!h.manager.is_live());
    }

    #[tokio::test(start_paused = true)]
    async fn test_current_credential_outside_window_is_returned_as_is() {
        let h = Harness::new(vec![]);
        let credential = credential_expiring_at(NOW + 3600, 3600);
        h.manager.login(credential.clone()).unwrap();

        let current = h.manager.current_credential().await.unwrap();
        assert_eq!(*current, credential);
        assert_eq!(h.transport.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_current_credential_refreshes_inside_window() {
        let next = credential_expiring_at(NOW + 3600, 3600);
        let h = Harness::new(vec![Ok(next.clone())]);
        h.manager.login(credential_expiring_at(NOW + 200, 200)).unwrap();

        let current = h.manager.current_credential().await.unwrap();
        assert_eq!(*current, next);
        assert_eq!(h.transport.calls(), 1);
        assert_eq!(h.manager.vault().retrieve().unwrap(), Some(next));
        assert_eq!(h.count(SessionEventKind::SessionRefreshed), 1);
        assert_eq!(h.manager.monitor_state(), MonitorState::Armed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_refreshes_share_one_exchange() {
        let next = credential_expiring_at(NOW + 7200, 7200);
        let h = Harness::with_delay(vec![Ok(next.clone())], Duration::from_secs(5));
        h.manager.login(credential_expiring_at(NOW + 3600, 3600)).unwrap();

        let (a, b, c) = tokio::join!(
            h.manager.refresh(),
            h.manager.refresh(),
            h.manager.refresh()
        );
        let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());

        assert_eq!(*a, next);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&a, &c));
        assert_eq!(h.transport.calls(), 1);
        assert_eq!(h.count(SessionEventKind::SessionRefreshed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_refresh_tears_down_once() {
        let h = Harness::new(vec![
            Err(ExchangeError::Transient("timeout".into())),
            Err(ExchangeError::Transient("timeout".into())),
            Err(ExchangeError::Transient("timeout".into())),
        ]);
        let generation = h.manager.login(credential_expiring_at(NOW + 3600, 3600)).unwrap();

        let (a, b) = tokio::join!(h.manager.refresh(), h.manager.refresh());
        assert!(matches!(a, Err(RefreshError::RefreshExhausted { attempts: 3, .. })));
        assert_eq!(a, b);

        // A second teardown path racing the first changes nothing.
        assert!(!h
            .manager
            .end_session(Some(generation), Some(ExpiryReason::CredentialExpired)));
        assert!(!h.manager.logout());

        assert!(h.medium.keys().is_empty());
        assert!(!h.manager.is_live());
        assert_eq!(h.manager.monitor_state(), MonitorState::Idle);
        assert_eq!(
            h.expired_events(),
            vec![SessionEvent::SessionExpired {
                generation,
                reason: ExpiryReason::RefreshExhausted
            }]
        );
        assert_eq!(h.transport.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_during_failing_refresh_publishes_once() {
        let h = Harness::with_delay(
            vec![
                Err(ExchangeError::Transient("503".into())),
                Err(ExchangeError::Transient("503".into())),
                Err(ExchangeError::Transient("503".into())),
            ],
            Duration::from_secs(1),
        );
        h.manager.login(credential_expiring_at(NOW + 2, 2)).unwrap();

        // Explicit refresh starts at t=0; the monitor's terminal signal at
        // t=2 joins the same flight instead of starting another.
        let result = h.manager.refresh().await;
        assert!(matches!(result, Err(RefreshError::RefreshExhausted { .. })));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(h.transport.calls(), 3);
        assert_eq!(h.count(SessionEventKind::SessionExpired), 1);
        assert!(h.medium.keys().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_logout_during_refresh_discards_result() {
        let h = Harness::with_delay(
            vec![Ok(credential_expiring_at(NOW + 7200, 7200))],
            Duration::from_secs(5),
        );
        let generation = h.manager.login(credential_expiring_at(NOW + 3600, 3600)).unwrap();

        let manager = h.manager.clone();
        let pending = tokio::spawn(async move { manager.refresh().await });
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(h.manager.logout());

        assert_eq!(pending.await.unwrap(), Err(RefreshError::SessionEnded));
        assert_eq!(h.transport.calls(), 1);
        assert!(h.medium.keys().is_empty());
        assert!(h.manager.claims().is_none());
        assert_eq!(h.count(SessionEventKind::SessionRefreshed), 0);
        assert_eq!(
            h.events.lock().unwrap().last(),
            Some(&SessionEvent::SessionEnded { generation })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_sixty_second_credential_expires_and_terminal_callback_fires() {
        let h = Harness::with_delay(
            vec![Err(ExchangeError::Rejected("status 401".into()))],
            Duration::from_secs(10),
        );
        h.manager.login(credential_expiring_at(NOW + 60, 60)).unwrap();

        tokio::time::sleep(Duration::from_secs(61)).await;

        let stored = h.manager.vault().retrieve().unwrap().unwrap();
        let validator = CredentialValidator::default();
        assert!(validator.is_expired(&stored, h.clock.now()));
        assert_eq!(h.manager.monitor_state(), MonitorState::Expired);
        // The terminal callback started a refresh.
        assert_eq!(h.transport.calls(), 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(h.count(SessionEventKind::SessionExpired), 1);
        assert_eq!(
            h.expired_events()[0],
            SessionEvent::SessionExpired {
                generation: 1,
                reason: ExpiryReason::RefreshRejected
            }
        );
        assert!(h.medium.keys().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejections_on_consecutive_sessions_stay_isolated() {
        let h = Harness::new(vec![
            Err(ExchangeError::Rejected("status 401".into())),
            Err(ExchangeError::Rejected("status 403".into())),
        ]);

        let first = h.manager.login(credential_for("user-a", NOW + 3600, 3600)).unwrap();
        assert!(matches!(
            h.manager.refresh().await,
            Err(RefreshError::RefreshRejected(_))
        ));
        assert!(h.medium.keys().is_empty());
        assert!(h.manager.claims().is_none());

        let second = h.manager.login(credential_for("user-b", NOW + 3600, 3600)).unwrap();
        assert_eq!(
            h.manager.claims().unwrap().subject.as_deref(),
            Some("user-b")
        );
        assert!(matches!(
            h.manager.refresh().await,
            Err(RefreshError::RefreshRejected(_))
        ));
        assert!(h.medium.keys().is_empty());

        assert_eq!(
            h.expired_events(),
            vec![
                SessionEvent::SessionExpired {
                    generation: first,
                    reason: ExpiryReason::RefreshRejected
                },
                SessionEvent::SessionExpired {
                    generation: second,
                    reason: ExpiryReason::RefreshRejected
                },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_bootstrap_restores_persisted_session() {
        let h = Harness::new(vec![]);
        assert!(!h.manager.bootstrap().await);

        let credential = credential_expiring_at(NOW + 3600, 3600);
        h.manager.vault().store(&credential).unwrap();

        assert!(h.manager.bootstrap().await);
        assert_eq!(*h.manager.current_credential().await.unwrap(), credential);
        assert_eq!(h.manager.monitor_state(), MonitorState::Armed);
        assert_eq!(h.transport.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bootstrap_refreshes_expired_credential() {
        let next = credential_expiring_at(NOW + 3600, 3600);
        let h = Harness::new(vec![Ok(next.clone())]);
        h.manager
            .vault()
            .store(&credential_expiring_at(NOW - 10, 3600))
            .unwrap();

        assert!(h.manager.bootstrap().await);
        assert_eq!(*h.manager.current_credential().await.unwrap(), next);
        assert_eq!(h.transport.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bootstrap_with_rejected_refresh_ends_clean() {
        let h = Harness::new(vec![Err(ExchangeError::Rejected("revoked".into()))]);
        h.manager
            .vault()
            .store(&credential_expiring_at(NOW - 10, 3600))
            .unwrap();

        assert!(!h.manager.bootstrap().await);
        assert!(h.medium.keys().is_empty());
        assert_eq!(h.count(SessionEventKind::SessionExpired), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tampered_vault_ends_live_session() {
        let h = Harness::new(vec![]);
        let generation = h.manager.login(credential_expiring_at(NOW + 3600, 3600)).unwrap();
        h.medium.set("dpc.session.v2.credential", "garbage").unwrap();

        assert!(h.manager.current_credential().await.is_none());
        assert!(!h.manager.is_live());
        assert_eq!(
            h.expired_events(),
            vec![SessionEvent::SessionExpired {
                generation,
                reason: ExpiryReason::InvalidCredential
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreadable_vault_keeps_live_session() {
        let h = Harness::new(vec![]);
        let credential = credential_expiring_at(NOW + 3600, 3600);
        h.manager.login(credential.clone()).unwrap();
        h.medium.set_available(false);

        assert_eq!(*h.manager.current_credential().await.unwrap(), credential);
        assert!(h.manager.is_live());
    }

    #[tokio::test(start_paused = true)]
    async fn test_warning_event_before_expiry() {
        let h = Harness::new(vec![]);
        let generation = h.manager.login(credential_expiring_at(NOW + 600, 600)).unwrap();

        tokio::time::sleep(Duration::from_secs(481)).await;
        assert_eq!(h.manager.monitor_state(), MonitorState::Warning);
        assert!(h.events.lock().unwrap().contains(&SessionEvent::ExpiryWarning {
            generation,
            seconds_remaining: 120
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_rearms_without_extending_lifetime() {
        let h = Harness::new(vec![Ok(credential_expiring_at(NOW + 4000, 3400))]);
        h.manager.login(credential_expiring_at(NOW + 600, 600)).unwrap();

        tokio::time::sleep(Duration::from_secs(500)).await;
        assert_eq!(h.manager.monitor_state(), MonitorState::Warning);

        h.manager.record_activity();
        assert_eq!(h.manager.monitor_state(), MonitorState::Armed);

        tokio::time::sleep(Duration::from_secs(99)).await;
        assert_eq!(h.transport.calls(), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(h.transport.calls(), 1);
        assert_eq!(h.count(SessionEventKind::SessionRefreshed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_without_session() {
        let h = Harness::new(vec![]);
        assert_eq!(h.manager.refresh().await, Err(RefreshError::NoSession));
        assert!(h.manager.current_credential().await.is_none());
        assert!(!h.manager.logout());
        h.manager.record_activity();
        assert_eq!(h.manager.monitor_state(), MonitorState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_refresh_result_is_rejected() {
        let h = Harness::new(vec![Ok(credential_expiring_at(NOW - 1, 60))]);
        h.manager.login(credential_expiring_at(NOW + 3600, 3600)).unwrap();

        assert!(matches!(
            h.manager.refresh().await,
            Err(RefreshError::RefreshRejected(_))
        ));
        assert!(!h.manager.is_live());
        assert!(h.medium.keys().is_empty());
    }

    /// Memory storage that runs a one-shot callback before the next write.
    #[derive(Default)]
    struct HookedStorage {
        inner: MemoryStorage,
        before_set: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    }

    impl StorageMedium for HookedStorage {
        fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
            self.inner.get(key)
        }

        fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
            let hook = self.before_set.lock().unwrap().take();
            if let Some(hook) = hook {
                hook();
            }
            self.inner.set(key, value)
        }

        fn remove(&self, key: &str) -> Result<(), StorageError> {
            self.inner.remove(key)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_logout_during_refresh_write_leaves_vault_empty() {
        let config = SessionConfig::default();
        let medium = Arc::new(HookedStorage::default());
        let cipher = Arc::new(ChaChaCipher::from_key(&[5u8; 32]).unwrap());
        let vault = CredentialVault::new(&config, medium.clone(), cipher);
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(credential_expiring_at(
            NOW + 7200,
            7200,
        ))]));
        let manager = SessionManager::new(
            config.clone(),
            vault,
            CredentialRefresher::new(&config, transport),
            CredentialValidator::default(),
            SessionEventBus::new(),
            Arc::new(InstantClock::starting_at(NOW)),
        )
        .unwrap();
        manager.login(credential_expiring_at(NOW + 3600, 3600)).unwrap();

        // Sign out from another thread while the refreshed credential is
        // being written.
        let signed_out = Arc::new(Mutex::new(None));
        {
            let manager = manager.clone();
            let signed_out = signed_out.clone();
            *medium.before_set.lock().unwrap() = Some(Box::new(move || {
                let handle = std::thread::spawn(move || manager.logout());
                *signed_out.lock().unwrap() = Some(handle);
                std::thread::sleep(Duration::from_millis(50));
            }));
        }

        let _ = manager.refresh().await;
        let handle = signed_out.lock().unwrap().take().unwrap();
        assert!(handle.join().unwrap());

        assert!(medium.inner.keys().is_empty());
        assert!(!manager.is_live());
        assert!(manager.current_credential().await.is_none());
        assert!(!manager.is_live());
    }

    #[tokio::test(start_paused = true)]
    async fn test_relogin_ends_previous_session() {
        let h = Harness::new(vec![]);
        let first = h.manager.login(credential_for("user-a", NOW + 3600, 3600)).unwrap();
        let second = h.manager.login(credential_for("user-b", NOW + 3600, 3600)).unwrap();

        assert!(second > first);
        assert!(h
            .events
            .lock()
            .unwrap()
            .contains(&SessionEvent::SessionEnded { generation: first }));
        assert_eq!(h.medium.keys().len(), 1);
        assert_eq!(
            h.manager.claims().unwrap().subject.as_deref(),
            Some("user-b")
        );
        assert_eq!(h.count(SessionEventKind::SessionExpired), 0);
    }
}
