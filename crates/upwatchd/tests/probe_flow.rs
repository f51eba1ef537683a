//! Cross-crate flow: roster bus → replica → prober → recorder → reconstructor.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::net::TcpListener;
use tokio::sync::watch;

use upwatch_health::{HealthProber, ProberConfig, StatusRecorder, TcpPinger};
use upwatch_registry::{RosterConsumer, RosterReplica, memory_bus};
use upwatch_report::UptimeReconstructor;
use upwatch_scheduler::{HealthCycle, ProbeCycle};
use upwatch_state::{
    Clock, Endpoint, EventLog, RosterMutation, RosterSource, StateStore, SystemClock, TimeWindow,
};

fn prober_config() -> ProberConfig {
    ProberConfig {
        attempts: 1,
        attempt_timeout: Duration::from_millis(500),
        max_in_flight: 8,
    }
}

async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn recorder(store: &Arc<StateStore>, clock: &Arc<dyn Clock>) -> Arc<StatusRecorder> {
    Arc::new(StatusRecorder::new(
        store.clone(),
        store.clone(),
        Arc::clone(clock),
        Duration::from_secs(60),
    ))
}

fn around_now() -> TimeWindow {
    let now = Utc::now();
    TimeWindow::new(now - chrono::Duration::hours(1), now + chrono::Duration::hours(1))
}

#[tokio::test]
async fn unreachable_endpoint_twice_gives_two_false_events() {
    let store = Arc::new(StateStore::open_in_memory().unwrap());
    store
        .put_endpoint(&Endpoint::new("db-1", "127.0.0.1", "database"))
        .unwrap();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let replica = Arc::new(RosterReplica::new());
    replica.bootstrap_from(&*store).unwrap();

    let cycle = HealthCycle::new(
        Arc::clone(&replica),
        HealthProber::new(TcpPinger::new(closed_port().await), prober_config()),
        recorder(&store, &clock),
    );
    let (_tx, rx) = watch::channel(false);
    cycle.run_cycle(rx.clone()).await;
    cycle.run_cycle(rx).await;

    let events = store.query("db-1", around_now()).unwrap();
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|e| !e.status && e.credit_minutes == 0.0));
    assert!(events[0].timestamp <= events[1].timestamp);
    assert!(!store.get_endpoint("db-1").unwrap().unwrap().last_known_status);
}

#[tokio::test]
async fn streamed_roster_change_is_probed_and_reported() {
    let store = Arc::new(StateStore::open_in_memory().unwrap());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    // Consumer first, then the snapshot, as the daemon does.
    let replica = Arc::new(RosterReplica::new());
    let (publisher, source) = memory_bus(16);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let consumer =
        tokio::spawn(RosterConsumer::new(source, Arc::clone(&replica)).run(shutdown_rx.clone()));

    let web = store
        .put_endpoint(&Endpoint::new("web-1", "127.0.0.1", "web"))
        .unwrap();
    publisher.publish(&RosterMutation::from(&web)).await.unwrap();
    replica.bootstrap_from(&*store).unwrap();

    // Added after the snapshot: only the bus carries it.
    let api = store
        .put_endpoint(&Endpoint::new("api-1", "127.0.0.1", "api"))
        .unwrap();
    publisher.publish(&RosterMutation::from(&api)).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while replica.len() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let cycle = HealthCycle::new(
        Arc::clone(&replica),
        HealthProber::new(TcpPinger::new(port), prober_config()),
        recorder(&store, &clock),
    );
    cycle.run_cycle(shutdown_rx.clone()).await;

    for id in ["web-1", "api-1"] {
        let ep = store.get_endpoint(id).unwrap().unwrap();
        assert!(ep.last_known_status, "{id} should be up");
    }

    let reconstructor = UptimeReconstructor::new(store.clone(), clock, chrono_tz::Asia::Bangkok);
    let report = reconstructor.fleet_summary(around_now()).unwrap();
    assert_eq!(report.total, 2);
    assert_eq!(report.online, 2);
    assert_eq!(report.offline, 0);

    let credit = reconstructor.fleet_credit_average(around_now()).unwrap();
    assert!((credit.average_uptime_hours - 1.0 / 60.0).abs() < 1e-9);

    // A drop stops the server from being probed.
    let dropped = store.delete_endpoint("api-1").unwrap().unwrap();
    publisher.publish(&dropped).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while replica.len() > 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    cycle.run_cycle(shutdown_rx).await;
    assert_eq!(store.query("api-1", around_now()).unwrap().len(), 1);
    assert_eq!(store.query("web-1", around_now()).unwrap().len(), 2);

    shutdown_tx.send(true).unwrap();
    let stats = consumer.await.unwrap();
    assert_eq!(stats.malformed, 0);
    assert!(stats.applied + stats.stale + stats.buffered >= 3);
    drop(listener);
}

#[tokio::test]
async fn bus_requests_are_persisted_by_the_consumer() {
    let store = Arc::new(StateStore::open_in_memory().unwrap());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let replica = Arc::new(RosterReplica::new());
    let (publisher, source) = memory_bus(16);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let consumer = tokio::spawn(
        RosterConsumer::new(source, Arc::clone(&replica))
            .with_store(store.clone())
            .run(shutdown_rx.clone()),
    );
    replica.bootstrap_from(&*store).unwrap();

    // What `upwatchd roster add` publishes while the daemon owns the store.
    publisher
        .publish(&RosterMutation::from(&Endpoint::new("db-2", "127.0.0.1", "database")))
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while replica.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let stored = store.get_endpoint("db-2").unwrap().unwrap();
    assert!(stored.revision > 0);
    assert_eq!(replica.get("db-2").unwrap().revision, stored.revision);

    let cycle = HealthCycle::new(
        Arc::clone(&replica),
        HealthProber::new(TcpPinger::new(port), prober_config()),
        recorder(&store, &clock),
    );
    cycle.run_cycle(shutdown_rx.clone()).await;
    let events = store.query("db-2", around_now()).unwrap();
    assert_eq!(events.len(), 1);
    assert!(events[0].status);
    assert!(store.get_endpoint("db-2").unwrap().unwrap().last_known_status);
    assert!(replica.get("db-2").unwrap().last_known_status);

    // What `upwatchd roster remove` publishes.
    publisher
        .publish(&RosterMutation::Drop {
            id: "db-2".to_string(),
            revision: 0,
        })
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while !replica.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert!(store.get_endpoint("db-2").unwrap().is_none());
    assert!(store.list_endpoints().unwrap().is_empty());

    shutdown_tx.send(true).unwrap();
    let stats = consumer.await.unwrap();
    assert_eq!(stats.applied, 2);
    assert_eq!(stats.store_errors, 0);
    drop(listener);
}
