//! End-to-end booking flow over the in-memory store.

#![allow(clippy::unwrap_used, clippy::panic)]

use async_trait::async_trait;
use seatlock_core::store::SharedStore;
use seatlock_core::{InMemoryStore, LockSettings, SeatlockConfig};
use seatlock_delay::{DelayHandler, DelayMessage};
use seatlock_locks::{HolderId, LockInfoResolver, LockKind, LockManager, Locker, ResolverRegistry, SERVICE_LOCK};
use seatlock_runtime::TaskContext;
use seatlock_testing::mocks::{test_clock, UnavailableStore};
use seatlock_ticketing::{
    BookingError, ExpiryHandler, Inventory, Platform, PlatformBuilder, Reservation, ReservationStatus,
    ReservationTimeout, ReserveRequest, StoreInventory, TicketingConfig, EXPIRY_TOPIC,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

fn platform(store: Arc<dyn SharedStore>, config: SeatlockConfig, ticketing: TicketingConfig) -> Platform {
    PlatformBuilder::new(config, store).ticketing(ticketing).build().unwrap()
}

fn fast_delivery() -> SeatlockConfig {
    let mut config = SeatlockConfig::default();
    config.delay = config.delay.with_partitions(2).with_poll_interval(Duration::from_millis(20));
    config
}

async fn wait_until_available(platform: &Platform, show: &str, seats: u32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if platform.service().available(show).await.unwrap() == seats {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Store inventory whose seat check takes a while, as a slow database would.
struct SlowInventory {
    inner: StoreInventory,
    take_delay: Duration,
}

#[async_trait]
impl Inventory for SlowInventory {
    async fn stock(&self, show: &str, seats: u32) -> seatlock_ticketing::Result<()> {
        self.inner.stock(show, seats).await
    }

    async fn available(&self, show: &str) -> seatlock_ticketing::Result<u32> {
        self.inner.available(show).await
    }

    async fn take(&self, show: &str, seats: u32) -> seatlock_ticketing::Result<bool> {
        tokio::time::sleep(self.take_delay).await;
        self.inner.take(show, seats).await
    }

    async fn give_back(&self, show: &str, seats: u32) -> seatlock_ticketing::Result<()> {
        self.inner.give_back(show, seats).await
    }

    async fn save(&self, reservation: &Reservation) -> seatlock_ticketing::Result<()> {
        self.inner.save(reservation).await
    }

    async fn load(&self, id: &str) -> seatlock_ticketing::Result<Option<Reservation>> {
        self.inner.load(id).await
    }

    async fn remove(&self, id: &str) -> seatlock_ticketing::Result<bool> {
        self.inner.remove(id).await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_last_seat_race_between_instances() {
    let store: Arc<dyn SharedStore> = Arc::new(InMemoryStore::new());
    let mut config = SeatlockConfig::default();
    config.locks = LockSettings::default()
        .with_wait_time(Duration::from_secs(1))
        .with_lease_time(Some(Duration::from_secs(2)));

    // Two service instances: separate local caches, one shared store.
    let instance = |store: &Arc<dyn SharedStore>| {
        let inventory = SlowInventory {
            inner: StoreInventory::new(Arc::clone(store), "seatlock"),
            take_delay: Duration::from_millis(1500),
        };
        Arc::new(
            PlatformBuilder::new(config.clone(), Arc::clone(store))
                .inventory(Arc::new(inventory))
                .build()
                .unwrap(),
        )
    };
    let first = instance(&store);
    let second = instance(&store);
    first.service().stock("finale", 1).await.unwrap();

    let a = {
        let platform = Arc::clone(&first);
        tokio::spawn(async move { platform.service().reserve(ReserveRequest::new("alice", "finale", 1)).await })
    };
    let b = {
        let platform = Arc::clone(&second);
        tokio::spawn(async move { platform.service().reserve(ReserveRequest::new("bob", "finale", 1)).await })
    };
    let outcomes = [a.await.unwrap(), b.await.unwrap()];

    let winners = outcomes.iter().filter(|outcome| outcome.is_ok()).count();
    assert_eq!(winners, 1, "{outcomes:?}");
    let loser = outcomes.iter().find_map(|outcome| outcome.as_ref().err()).unwrap();
    assert!(matches!(loser, BookingError::Busy { show } if show == "finale"), "{loser:?}");
    assert!(loser.is_retry_later());
    assert_eq!(first.service().available("finale").await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_no_overselling_under_contention() {
    let platform = Arc::new(platform(
        Arc::new(InMemoryStore::new()),
        SeatlockConfig::default(),
        TicketingConfig::default(),
    ));
    platform.service().stock("s-1", 5).await.unwrap();

    let handles: Vec<_> = (0..20)
        .map(|index| {
            let platform = Arc::clone(&platform);
            tokio::spawn(async move {
                platform
                    .service()
                    .reserve(ReserveRequest::new(format!("c-{index}"), "s-1", 1))
                    .await
            })
        })
        .collect();

    let mut reserved = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(reservation) => {
                assert_eq!(reservation.status, ReservationStatus::Pending);
                reserved += 1;
            }
            Err(BookingError::SoldOut { available, .. }) => assert_eq!(available, 0),
            Err(other) => panic!("unexpected outcome: {other:?}"),
        }
    }
    assert_eq!(reserved, 5);
    assert_eq!(platform.service().available("s-1").await.unwrap(), 0);
}

#[tokio::test]
async fn test_unpaid_reservation_expires_and_returns_seats() {
    let platform = platform(
        Arc::new(InMemoryStore::new()),
        fast_delivery(),
        TicketingConfig::default().with_payment_window(Duration::from_millis(300)),
    );
    let (shutdown, _) = broadcast::channel(1);
    let running = platform.start(&shutdown).await.unwrap();

    platform.service().stock("s-1", 2).await.unwrap();
    let reservation = platform
        .service()
        .reserve(ReserveRequest::new("c-1", "s-1", 2))
        .await
        .unwrap();
    assert_eq!(platform.service().available("s-1").await.unwrap(), 0);

    assert!(wait_until_available(&platform, "s-1", 2, Duration::from_secs(5)).await);
    assert_eq!(platform.service().reservation(&reservation.id).await.unwrap(), None);

    let late = platform.service().pay("c-1", &reservation.id, true).await.unwrap_err();
    assert!(matches!(late, BookingError::NotFound(_)), "{late:?}");

    running.shutdown().await;
}

#[tokio::test]
async fn test_paid_reservation_keeps_its_seats() {
    let platform = platform(
        Arc::new(InMemoryStore::new()),
        fast_delivery(),
        TicketingConfig::default().with_payment_window(Duration::from_millis(300)),
    );
    let (shutdown, _) = broadcast::channel(1);
    let running = platform.start(&shutdown).await.unwrap();

    platform.service().stock("s-1", 3).await.unwrap();
    let reservation = platform
        .service()
        .reserve(ReserveRequest::new("c-1", "s-1", 2))
        .await
        .unwrap();
    let paid = platform.service().pay("c-1", &reservation.id, true).await.unwrap();
    assert_eq!(paid.status, ReservationStatus::Paid);

    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(platform.service().available("s-1").await.unwrap(), 1);
    let stored = platform.service().reservation(&reservation.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ReservationStatus::Paid);

    // Paying again is harmless.
    let again = platform.service().pay("c-1", &reservation.id, true).await.unwrap();
    assert_eq!(again.status, ReservationStatus::Paid);

    running.shutdown().await;
}

#[tokio::test]
async fn test_rate_limit_refuses_excess_requests() {
    let mut config = SeatlockConfig::default();
    config.admission.rate_threshold = 2;
    config.admission.rate_window = Duration::from_secs(60);
    // A frozen clock keeps every request in one window.
    let clock = test_clock();
    let platform = PlatformBuilder::new(config, Arc::new(InMemoryStore::with_clock(clock.shared())))
        .clock(clock.shared())
        .build()
        .unwrap();
    let service = platform.service();
    for show in ["a", "b", "c"] {
        service.stock(show, 5).await.unwrap();
    }

    service.reserve(ReserveRequest::new("c-1", "a", 1)).await.unwrap();
    service.reserve(ReserveRequest::new("c-1", "b", 1)).await.unwrap();
    let third = service.reserve(ReserveRequest::new("c-1", "c", 1)).await.unwrap_err();
    assert!(matches!(third, BookingError::RateLimited { count: 3 }), "{third:?}");
    assert!(third.is_retry_later());

    service.reserve(ReserveRequest::new("c-2", "c", 1)).await.unwrap();
    assert_eq!(service.available("c").await.unwrap(), 4);
}

#[tokio::test]
async fn test_payment_failures_require_challenge() {
    let mut config = SeatlockConfig::default();
    config.admission.challenge_threshold = 2;
    let platform = platform(Arc::new(InMemoryStore::new()), config, TicketingConfig::default());
    let service = platform.service();
    service.stock("a", 5).await.unwrap();
    service.stock("b", 5).await.unwrap();

    let reservation = service.reserve(ReserveRequest::new("c-1", "a", 1)).await.unwrap();
    let first = service.pay("c-1", &reservation.id, false).await.unwrap_err();
    assert!(matches!(first, BookingError::PaymentDeclined { failures: 1 }), "{first:?}");
    let second = service.pay("c-1", &reservation.id, false).await.unwrap_err();
    assert!(matches!(second, BookingError::PaymentDeclined { failures: 2 }), "{second:?}");

    let pay = service.pay("c-1", &reservation.id, true).await.unwrap_err();
    assert!(matches!(pay, BookingError::ChallengeRequired { failures: 2 }), "{pay:?}");
    let reserve = service.reserve(ReserveRequest::new("c-1", "b", 1)).await.unwrap_err();
    assert!(matches!(reserve, BookingError::ChallengeRequired { .. }), "{reserve:?}");

    service.reserve(ReserveRequest::new("c-2", "b", 1)).await.unwrap();
}

#[tokio::test]
async fn test_repeated_submission_refused_until_failure() {
    let platform = platform(
        Arc::new(InMemoryStore::new()),
        SeatlockConfig::default(),
        TicketingConfig::default(),
    );
    let service = platform.service();
    service.stock("a", 5).await.unwrap();

    service.reserve(ReserveRequest::new("c-1", "a", 1)).await.unwrap();
    let repeat = service.reserve(ReserveRequest::new("c-1", "a", 1)).await.unwrap_err();
    assert!(matches!(repeat, BookingError::DuplicateSubmission), "{repeat:?}");
    assert_eq!(service.available("a").await.unwrap(), 4);

    // A failed attempt clears its marker, so the client may retry at once.
    let sold_out = service.reserve(ReserveRequest::new("c-2", "empty", 1)).await.unwrap_err();
    assert!(matches!(sold_out, BookingError::SoldOut { requested: 1, available: 0, .. }));
    let retried = service.reserve(ReserveRequest::new("c-2", "empty", 1)).await.unwrap_err();
    assert!(matches!(retried, BookingError::SoldOut { .. }), "{retried:?}");
}

#[tokio::test]
async fn test_invalid_requests_rejected() {
    let platform = platform(
        Arc::new(InMemoryStore::new()),
        SeatlockConfig::default(),
        TicketingConfig::default(),
    );
    let zero = platform
        .service()
        .reserve(ReserveRequest::new("c-1", "a", 0))
        .await
        .unwrap_err();
    assert!(matches!(zero, BookingError::InvalidRequest(_)));

    let foreign = platform.service().pay("c-1", "missing", true).await.unwrap_err();
    assert!(matches!(foreign, BookingError::NotFound(_)));
}

#[tokio::test]
async fn test_store_outage_fails_closed() {
    let store = UnavailableStore::new();
    let platform = platform(
        Arc::new(store.clone()),
        SeatlockConfig::default(),
        TicketingConfig::default(),
    );

    let error = platform
        .service()
        .reserve(ReserveRequest::new("c-1", "a", 1))
        .await
        .unwrap_err();
    assert!(matches!(error, BookingError::Gate(_)), "{error:?}");
    assert!(error.is_retry_later());
    // Refused at the rate gate; inventory was never touched.
    assert_eq!(store.calls(), 1);
}

#[tokio::test]
async fn test_expiry_postponed_while_show_is_locked() {
    let store: Arc<dyn SharedStore> = Arc::new(InMemoryStore::new());
    let mut config = fast_delivery();
    config.locks = LockSettings::default().with_wait_time(Duration::from_millis(100));
    let platform = platform(
        Arc::clone(&store),
        config.clone(),
        TicketingConfig::default().with_expiry_retry(Duration::from_secs(60)),
    );
    platform.service().stock("s-1", 1).await.unwrap();
    let reservation = platform
        .service()
        .reserve(ReserveRequest::new("c-1", "s-1", 1))
        .await
        .unwrap();

    // Someone else holds the show's inventory lock.
    let manager = LockManager::new(Arc::clone(&store), config.locks.clone());
    let lock_id = ResolverRegistry::with_builtins(&config.store.key_prefix)
        .get(SERVICE_LOCK)
        .unwrap()
        .resolve("inventory", &["s-1".to_string()])
        .unwrap();
    let holder = HolderId::named("admin");
    let locker = manager.get(LockKind::Reentrant);
    assert!(locker.try_lock(&lock_id, &holder, Duration::ZERO, None).await.unwrap());

    let handler = ExpiryHandler::new(Arc::clone(platform.service()));
    let message = DelayMessage {
        id: "m-1".to_string(),
        topic: EXPIRY_TOPIC.to_string(),
        partition: 0,
        payload: serde_json::to_string(&ReservationTimeout {
            reservation_id: reservation.id.clone(),
        })
        .unwrap(),
        not_before_ms: 0,
        attempt: 1,
        context: TaskContext::new(),
    };
    handler.execute(message.clone()).await.unwrap();

    // Still reserved, and a second expiry is queued.
    assert_eq!(platform.service().available("s-1").await.unwrap(), 0);
    let mut pending = 0;
    for partition in 0..config.delay.partitions {
        pending += platform.dispatcher().pending(EXPIRY_TOPIC, partition).await.unwrap();
    }
    assert_eq!(pending, 2);

    locker.unlock(&lock_id, &holder).await.unwrap();
    handler.execute(message.clone()).await.unwrap();
    assert_eq!(platform.service().available("s-1").await.unwrap(), 1);

    // Redelivery after release is a no-op.
    handler.execute(message).await.unwrap();
    assert_eq!(platform.service().available("s-1").await.unwrap(), 1);
}
