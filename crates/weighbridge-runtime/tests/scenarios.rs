//! End-to-end weighing scenarios against simulated scales.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use weighbridge_hal::{LinkCommand, LinkRegistry, SimLink};
use weighbridge_kernel::{AccessEvaluator, HealthVerdict, ScaleRegistry};
use weighbridge_middleware::Delivery;
use weighbridge_runtime::{BroadcastHub, ConnectionHealthMonitor, EngineConfig, MonitorConfig};
use weighbridge_types::{
    ClientIdentity, NewStation, ScaleError, SessionEventKind, SessionState, StationPatch,
    WeighCommand,
};

fn engine_config() -> EngineConfig {
    EngineConfig {
        command_timeout: Duration::from_millis(200),
        sample_interval: Duration::from_secs(3600),
        ..Default::default()
    }
}

fn hub_for(link: Arc<SimLink>) -> BroadcastHub {
    let mut links = LinkRegistry::new();
    links.register(link);
    BroadcastHub::new(links, engine_config())
}

async fn next(rx: &mut weighbridge_middleware::SessionReceiver) -> Delivery {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("delivery within deadline")
        .expect("lane still open")
}

#[test]
fn ip_allow_list_grants_access_to_station() {
    let registry = Arc::new(ScaleRegistry::new());
    registry
        .register(NewStation::new("Gate 1").with_id("S1").allow_ip("10.0.0.5"))
        .unwrap();
    let evaluator = AccessEvaluator::new(registry);

    let identity = ClientIdentity::observe("x", Some("10.0.0.5"), None, None);
    let decision = evaluator.evaluate(&identity);
    assert!(decision.has_access);
    assert_eq!(decision.station.map(|s| s.id), Some("S1".to_string()));
    assert_eq!(decision.allowed_ips, vec!["10.0.0.5".to_string()]);
}

#[test]
fn transport_address_overrides_claimed_address() {
    let registry = Arc::new(ScaleRegistry::new());
    registry
        .register(NewStation::new("Gate 1").with_id("S1").allow_ip("10.0.0.5"))
        .unwrap();
    let evaluator = AccessEvaluator::new(registry);

    let observed: IpAddr = "192.168.1.20".parse().unwrap();
    let spoofed = ClientIdentity::observe("x", Some("10.0.0.5"), Some(observed), None);
    let decision = evaluator.evaluate(&spoofed);
    assert!(!decision.has_access);
    assert_eq!(decision.allowed_ips, vec!["10.0.0.5".to_string()]);
}

#[test]
fn deactivated_station_stops_matching() {
    let registry = Arc::new(ScaleRegistry::new());
    registry
        .register(NewStation::new("Gate 1").with_id("S1").allow_hostname("WB-01"))
        .unwrap();
    let evaluator = AccessEvaluator::new(Arc::clone(&registry));
    let identity = ClientIdentity::observe("WB-01", None, None, None);
    assert!(evaluator.evaluate(&identity).has_access);

    registry
        .update(
            "S1",
            StationPatch {
                is_active: Some(false),
                ..Default::default()
            },
        )
        .unwrap();
    let decision = evaluator.evaluate(&identity);
    assert!(!decision.has_access);
    assert!(decision.station.is_none());
}

#[tokio::test]
async fn subscribe_then_start_delivers_first_event() {
    let link = Arc::new(SimLink::new("S1"));
    let hub = hub_for(link.clone());

    let mut sub = hub.subscribe("S1", "console-1").await.unwrap();
    assert_eq!(sub.snapshot.state, SessionState::Idle);

    hub.submit("S1", "console-1", WeighCommand::Start).await.unwrap();
    match next(&mut sub.receiver).await {
        Delivery::Event(event) => {
            assert_eq!(event.state, SessionState::Weighing);
            assert_eq!(event.sequence, 1);
        }
        other => panic!("expected event, got {other:?}"),
    }
}

#[tokio::test]
async fn three_failed_probes_disconnect_and_one_success_recovers() {
    let link = Arc::new(SimLink::new("S1"));
    let hub = hub_for(link.clone());
    let mut sub = hub.subscribe("S1", "console-1").await.unwrap();
    let handle = hub.session("S1").expect("session exists after subscribe");
    let mut monitor = ConnectionHealthMonitor::new(handle.clone(), &MonitorConfig::default());
    link.set_alive(false);
    for _ in 0..2 {
        assert_eq!(monitor.probe_once().await.unwrap(), HealthVerdict::Steady);
        assert_eq!(handle.state(), SessionState::Idle);
    }
    assert_eq!(monitor.probe_once().await.unwrap(), HealthVerdict::LinkLost);
    assert!(matches!(
        next(&mut sub.receiver).await,
        Delivery::Event(e) if e.state == SessionState::Disconnected
    ));

    link.set_alive(true);
    assert_eq!(monitor.probe_once().await.unwrap(), HealthVerdict::Recovered);
    assert!(matches!(
        next(&mut sub.receiver).await,
        Delivery::Event(e) if e.state == SessionState::Idle && e.kind == SessionEventKind::Recovered
    ));
}

#[tokio::test]
async fn start_waits_behind_in_flight_tare() {
    let link = Arc::new(
        SimLink::new("S1")
            .with_load(25.0)
            .with_latency(Duration::from_millis(30)),
    );
    let hub = hub_for(link.clone());
    let mut sub = hub.subscribe("S1", "console-1").await.unwrap();

    let (tare, start) = tokio::join!(
        hub.submit("S1", "console-1", WeighCommand::Tare),
        async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            hub.submit("S1", "console-1", WeighCommand::Start).await
        },
    );
    let tare = tare.unwrap();
    let start = start.unwrap();
    assert!(tare.sequence < start.sequence);
    assert_eq!(start.state, SessionState::Weighing);
    assert_eq!(link.commands(), vec![LinkCommand::Tare, LinkCommand::Start]);
    assert_eq!(link.max_in_flight(), 1);

    let first = next(&mut sub.receiver).await;
    let second = next(&mut sub.receiver).await;
    assert_eq!((first.sequence(), second.sequence()), (1, 2));
}

#[tokio::test]
async fn sequence_numbers_increase_by_one_per_event() {
    let link = Arc::new(SimLink::new("S1").with_load(500.0));
    let hub = hub_for(link);
    let mut sub = hub.subscribe("S1", "console-1").await.unwrap();

    hub.submit("S1", "console-1", WeighCommand::Start).await.unwrap();
    for _ in 0..5 {
        hub.submit("S1", "console-1", WeighCommand::Read).await.unwrap();
    }
    hub.submit("S1", "console-1", WeighCommand::Tare).await.unwrap();
    hub.submit("S1", "console-1", WeighCommand::Stop).await.unwrap();

    let mut seen = Vec::new();
    for _ in 0..8 {
        seen.push(next(&mut sub.receiver).await.sequence());
    }
    assert_eq!(seen, (1..=8).collect::<Vec<u64>>());
}

#[tokio::test]
async fn fault_is_surfaced_to_every_subscriber() {
    let link = Arc::new(SimLink::new("S1"));
    link.push_command_outcomes([weighbridge_hal::SimStep::Fault("overvoltage".into())]);
    let hub = hub_for(link);
    let mut a = hub.subscribe("S1", "console-1").await.unwrap();
    let mut b = hub.subscribe("S1", "console-2").await.unwrap();

    let err = hub.submit("S1", "console-1", WeighCommand::Start).await.unwrap_err();
    assert!(matches!(err, ScaleError::HardwareFault { .. }));

    for rx in [&mut a.receiver, &mut b.receiver] {
        match next(rx).await {
            Delivery::Event(e) => {
                assert_eq!(e.state, SessionState::Error);
                assert!(matches!(e.kind, SessionEventKind::Fault { .. }));
            }
            other => panic!("expected fault event, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn disconnecting_subscriber_cancels_its_queued_commands() {
    let link = Arc::new(SimLink::new("S1").with_latency(Duration::from_millis(60)));
    let hub = Arc::new(hub_for(link.clone()));
    let _keep = hub.subscribe("S1", "console-1").await.unwrap();
    let _leaving = hub.subscribe("S1", "console-2").await.unwrap();

    let start = tokio::spawn({
        let hub = Arc::clone(&hub);
        async move { hub.submit("S1", "console-1", WeighCommand::Start).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    let tare = tokio::spawn({
        let hub = Arc::clone(&hub);
        async move { hub.submit("S1", "console-2", WeighCommand::Tare).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(hub.unsubscribe("S1", "console-2").await);

    assert!(start.await.unwrap().is_ok());
    assert!(tare.await.unwrap().is_err());
    assert_eq!(link.commands(), vec![LinkCommand::Start]);
}
