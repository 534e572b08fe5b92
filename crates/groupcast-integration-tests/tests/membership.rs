//! Integration tests: view changes while traffic is flowing.

use std::time::Duration;

use groupcast_integration_tests::{init_tracing, value_of, TestGroup};
use groupcast_protocol::testing::FaultConfig;
use groupcast_protocol::{MessageClass, ProtocolEvent, Scope, View};

const TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn departed_member_stops_holding_back_stability() {
    init_tracing();
    let mut group = TestGroup::start(3, FaultConfig::default()).await.unwrap();
    // Member 2 disappears before any traffic; nobody has noticed yet.
    group.kill(2).await;

    let values = (1..=5).map(|v| (v, MessageClass::Regular));
    group.send_values(0, Scope::Group, values).await.unwrap();
    for member in 0..2 {
        group.recv_deliveries(member, 5, TIMEOUT).await.unwrap();
    }
    let stuck = group.wait_stable(&[0, 1], Duration::from_millis(400)).await;
    assert!(stuck.is_err());

    group.install(View::new(2, vec![group.id(0), group.id(1)])).await.unwrap();
    group.wait_stable(&[0, 1], TIMEOUT).await.unwrap();

    let installed = group
        .drain_events(0)
        .into_iter()
        .any(|e| matches!(e, ProtocolEvent::ViewInstalled { view_id: 2, .. }));
    assert!(installed);
    group.shutdown().await;
}

#[tokio::test]
async fn traffic_continues_in_the_smaller_view() {
    init_tracing();
    let mut group = TestGroup::start(3, FaultConfig::duplicating(2, 2)).await.unwrap();
    group.kill(2).await;
    group.install(View::new(2, vec![group.id(0), group.id(1)])).await.unwrap();

    let values = (1..=10).map(|v| (v, MessageClass::Regular));
    group.send_values(1, Scope::Group, values).await.unwrap();
    for member in 0..2 {
        let got = group.recv_deliveries(member, 10, TIMEOUT).await.unwrap();
        let got: Vec<u64> = got.iter().map(value_of).collect();
        assert_eq!(got, (1..=10).collect::<Vec<u64>>());
        group.assert_quiet(member, Duration::from_millis(200)).await.unwrap();
    }
    group.wait_stable(&[0, 1], TIMEOUT).await.unwrap();
    group.shutdown().await;
}

#[tokio::test]
async fn unicast_to_a_departed_member_is_rejected() {
    init_tracing();
    let group = TestGroup::start(3, FaultConfig::default()).await.unwrap();
    let gone = group.id(2);
    group.install(View::new(2, vec![group.id(0), group.id(1)])).await.unwrap();

    let result = group.members[0]
        .handle
        .send(Scope::Unicast(gone), vec![1u8], MessageClass::Regular)
        .await;
    assert!(result.is_err());
    group.shutdown().await;
}
