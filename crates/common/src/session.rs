use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::{
    AccountInfo, Error, OrderRequest, OrderResult, Position, PositionFilter, Result, SymbolInfo,
    Tick, Venue, VenueIdentity, VenueSession,
};

/// Hands out venue sessions, at most one per strategy at any instant.
///
/// Every component that touches the venue (enrichment for balance reads,
/// execution, risk management) acquires through the same broker, so
/// account-scoped reads and writes for a strategy never interleave.
pub struct SessionBroker {
    venue: Arc<dyn Venue>,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl SessionBroker {
    pub fn new(venue: Arc<dyn Venue>) -> Self {
        Self {
            venue,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Wait for exclusive access to the strategy's identity, then log in.
    ///
    /// Hand the session back with `release`. A session that is only dropped
    /// logs out on a background task, and the lock stays held until that
    /// logout has finished.
    pub async fn acquire(&self, identity: &VenueIdentity) -> Result<StrategySession> {
        let lock = self.lock_for(&identity.strategy_id);
        let guard = lock.lock_owned().await;
        debug!(strategy = %identity.strategy_id, "Session lock acquired");

        // On connect failure `guard` drops here and the lock is released.
        let session = self.venue.connect(identity).await?;

        Ok(StrategySession {
            strategy_id: identity.strategy_id.clone(),
            session,
            guard: Some(guard),
        })
    }

    fn lock_for(&self, strategy_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry(strategy_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}

/// An open venue session bound to one strategy.
pub struct StrategySession {
    strategy_id: String,
    session: Box<dyn VenueSession>,
    /// `None` once the session has been handed back.
    guard: Option<OwnedMutexGuard<()>>,
}

impl StrategySession {
    pub fn strategy_id(&self) -> &str {
        &self.strategy_id
    }

    /// Log out, then release the strategy's lock. A failed logout is logged;
    /// the lock is released either way.
    pub async fn release(mut self) {
        let guard = self.guard.take();
        let mut session = std::mem::replace(&mut self.session, Box::new(Released));
        if let Err(e) = session.disconnect().await {
            warn!(strategy = %self.strategy_id, error = %e, "Venue logout failed");
        }
        drop(guard);
        debug!(strategy = %self.strategy_id, "Session released");
    }
}

impl Deref for StrategySession {
    type Target = dyn VenueSession;

    fn deref(&self) -> &Self::Target {
        self.session.as_ref()
    }
}

impl DerefMut for StrategySession {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.session.as_mut()
    }
}

impl Drop for StrategySession {
    fn drop(&mut self) {
        let Some(guard) = self.guard.take() else {
            return;
        };
        let mut session = std::mem::replace(&mut self.session, Box::new(Released));
        let strategy = std::mem::take(&mut self.strategy_id);
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(strategy = %strategy, "No runtime to log out on, session abandoned");
            return;
        };
        runtime.spawn(async move {
            if let Err(e) = session.disconnect().await {
                warn!(strategy = %strategy, error = %e, "Venue logout failed");
            }
            drop(guard);
            debug!(strategy = %strategy, "Session released");
        });
    }
}

/// Stands in for a session that has been handed back.
struct Released;

impl Released {
    fn fault() -> Error {
        Error::Venue("session already released".into())
    }
}

#[async_trait]
impl VenueSession for Released {
    async fn account_info(&mut self) -> Result<AccountInfo> {
        Err(Self::fault())
    }

    async fn symbol_info(&mut self, _symbol: &str) -> Result<SymbolInfo> {
        Err(Self::fault())
    }

    async fn tick(&mut self, _symbol: &str) -> Result<Tick> {
        Err(Self::fault())
    }

    async fn positions_get(&mut self, _filter: &PositionFilter) -> Result<Vec<Position>> {
        Err(Self::fault())
    }

    async fn order_send(&mut self, _request: &OrderRequest) -> Result<OrderResult> {
        Err(Self::fault())
    }

    async fn disconnect(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Gauge {
        open: AtomicUsize,
        max_open: AtomicUsize,
        disconnects: AtomicUsize,
    }

    struct CountingVenue {
        gauge: Arc<Gauge>,
        refuse: bool,
        logout_delay: Duration,
    }

    impl CountingVenue {
        fn new(gauge: Arc<Gauge>) -> Self {
            Self {
                gauge,
                refuse: false,
                logout_delay: Duration::ZERO,
            }
        }
    }

    struct CountingSession {
        gauge: Arc<Gauge>,
        logout_delay: Duration,
    }

    #[async_trait]
    impl Venue for CountingVenue {
        async fn connect(&self, identity: &VenueIdentity) -> Result<Box<dyn VenueSession>> {
            if self.refuse {
                return Err(Error::VenueConnect {
                    strategy: identity.strategy_id.clone(),
                    reason: "refused".into(),
                });
            }
            let open = self.gauge.open.fetch_add(1, Ordering::SeqCst) + 1;
            self.gauge.max_open.fetch_max(open, Ordering::SeqCst);
            Ok(Box::new(CountingSession {
                gauge: self.gauge.clone(),
                logout_delay: self.logout_delay,
            }))
        }
    }

    #[async_trait]
    impl VenueSession for CountingSession {
        async fn account_info(&mut self) -> Result<AccountInfo> {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(AccountInfo { balance: 1.0 })
        }
        async fn symbol_info(&mut self, symbol: &str) -> Result<SymbolInfo> {
            Err(Error::MarketData { symbol: symbol.into(), reason: "none".into() })
        }
        async fn tick(&mut self, symbol: &str) -> Result<Tick> {
            Err(Error::MarketData { symbol: symbol.into(), reason: "none".into() })
        }
        async fn positions_get(&mut self, _filter: &PositionFilter) -> Result<Vec<Position>> {
            Ok(Vec::new())
        }
        async fn order_send(&mut self, _request: &OrderRequest) -> Result<OrderResult> {
            Err(Error::Venue("read-only".into()))
        }
        async fn disconnect(&mut self) -> Result<()> {
            tokio::time::sleep(self.logout_delay).await;
            self.gauge.open.fetch_sub(1, Ordering::SeqCst);
            self.gauge.disconnects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn identity(strategy: &str) -> VenueIdentity {
        VenueIdentity {
            strategy_id: strategy.into(),
            terminal: "t".into(),
            login: 1,
            server: "s".into(),
            password: "p".into(),
        }
    }

    #[tokio::test]
    async fn one_session_per_strategy_at_a_time() {
        let gauge = Arc::new(Gauge::default());
        let broker = Arc::new(SessionBroker::new(Arc::new(CountingVenue::new(gauge.clone()))));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let broker = broker.clone();
            handles.push(tokio::spawn(async move {
                let mut session = broker.acquire(&identity("alpha")).await.unwrap();
                session.account_info().await.unwrap();
                session.release().await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(gauge.max_open.load(Ordering::SeqCst), 1);
        assert_eq!(gauge.disconnects.load(Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn different_strategies_may_overlap() {
        let gauge = Arc::new(Gauge::default());
        let broker = SessionBroker::new(Arc::new(CountingVenue::new(gauge.clone())));

        let a = broker.acquire(&identity("alpha")).await.unwrap();
        let b = broker.acquire(&identity("beta")).await.unwrap();
        assert_eq!(gauge.open.load(Ordering::SeqCst), 2);
        a.release().await;
        b.release().await;
        assert_eq!(gauge.open.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn dropped_session_holds_lock_until_logout_completes() {
        let gauge = Arc::new(Gauge::default());
        let broker = SessionBroker::new(Arc::new(CountingVenue {
            logout_delay: Duration::from_millis(30),
            ..CountingVenue::new(gauge.clone())
        }));

        let first = broker.acquire(&identity("alpha")).await.unwrap();
        drop(first);
        let second = broker.acquire(&identity("alpha")).await.unwrap();

        assert_eq!(gauge.disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(gauge.max_open.load(Ordering::SeqCst), 1);
        second.release().await;
        assert_eq!(gauge.disconnects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn released_session_logs_out_before_unlocking() {
        let gauge = Arc::new(Gauge::default());
        let broker = SessionBroker::new(Arc::new(CountingVenue {
            logout_delay: Duration::from_millis(30),
            ..CountingVenue::new(gauge.clone())
        }));

        let session = broker.acquire(&identity("alpha")).await.unwrap();
        session.release().await;

        assert_eq!(gauge.open.load(Ordering::SeqCst), 0);
        assert_eq!(gauge.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_connect_releases_lock() {
        let gauge = Arc::new(Gauge::default());
        let broker = SessionBroker::new(Arc::new(CountingVenue {
            refuse: true,
            ..CountingVenue::new(gauge)
        }));

        assert!(broker.acquire(&identity("alpha")).await.is_err());
        // A second attempt must not deadlock on the first attempt's lock.
        let second = tokio::time::timeout(
            Duration::from_millis(200),
            broker.acquire(&identity("alpha")),
        )
        .await
        .expect("lock was not released");
        assert!(second.is_err());
    }
}
