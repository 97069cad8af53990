//! Publisher and receiver running together over loopback TCP.

use live_results_core::{Competitor, Course, Results, Snapshot};
use live_results_proto::{DialConfig, HandshakeConfig};
use live_results_publisher::{ConnectionConfig, Distributor, DistributorConfig, DistributorHandle};
use live_results_receiver::{
    BroadcastSink, Published, ReceiverHandle, ResultsReceiver, RpcServer, ServerConfig,
};
use std::time::Duration;
use tokio::sync::broadcast;

const SECRET: &str = "correct horse battery staple";

struct Harness {
    address: String,
    receiver: ReceiverHandle,
    updates: broadcast::Receiver<Published>,
    distributor: DistributorHandle,
}

async fn harness(service_name: &str) -> Harness {
    let mut handshake = HandshakeConfig::new(SECRET);
    handshake.service_name = service_name.to_string();

    let sink = BroadcastSink::new(16);
    let updates = sink.subscribe();
    let (receiver, _task) = ResultsReceiver::spawn(sink);
    let config = ServerConfig::new(handshake.clone());
    let server = RpcServer::bind("127.0.0.1:0", config, receiver.clone())
        .await
        .unwrap();
    let address = server.local_addr().unwrap().to_string();
    tokio::spawn(server.run());

    let (distributor, _task) = Distributor::spawn(DistributorConfig {
        connection: ConnectionConfig::new(DialConfig::new(handshake)),
        poll_interval: Duration::from_millis(20),
        ..DistributorConfig::default()
    });

    Harness {
        address,
        receiver,
        updates,
        distributor,
    }
}

async fn next_update(updates: &mut broadcast::Receiver<Published>) -> Published {
    tokio::time::timeout(Duration::from_secs(5), updates.recv())
        .await
        .expect("timed out waiting for an update")
        .expect("broadcast closed")
}

fn men_elite(names: &[&str]) -> Snapshot {
    let competitors = names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            Competitor::new(*name, "SYO", Duration::from_secs(900 + 10 * i as u64), true)
        })
        .collect();
    Snapshot::new(Results::new(
        "Sprint Champs",
        vec![
            Course::new("Men Elite", "2.9km 85m", competitors),
            Course::new("Women Elite", "2.6km 70m", Vec::new()),
        ],
    ))
}

#[tokio::test]
async fn receiver_follows_publisher() {
    let mut h = harness("Live Results").await;

    let a = men_elite(&["Alice", "Bob"]);
    let b = men_elite(&["Alice", "Carol"]);

    h.distributor.add_target(h.address.clone()).await.unwrap();
    h.distributor.new_snapshot(a.clone()).await.unwrap();

    let first = next_update(&mut h.updates).await;
    assert_eq!(first.snapshot, a);
    assert!(first.delta.is_none());

    h.distributor.new_snapshot(b.clone()).await.unwrap();
    let second = next_update(&mut h.updates).await;
    assert_eq!(second.snapshot, b);

    let delta = second.delta.expect("second update should be a delta");
    let changes = &delta.competitors.as_ref().unwrap()[&0];
    assert_eq!(changes.removed.iter().copied().collect::<Vec<_>>(), vec![1]);
    assert_eq!(changes.added[&1].name, "Carol");
    assert!(delta.courses.is_none());

    assert_eq!(h.receiver.current().await.unwrap(), b);
    assert_eq!(h.receiver.current().await.unwrap().hash(), b.hash());
}

#[tokio::test]
async fn watched_file_reaches_receiver() {
    let mut h = harness("Otheday").await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("results.json");
    std::fs::write(
        &path,
        r#"{"Title": "Sprint Champs", "Courses": [{"Title": "Men Elite", "Info": "2.9km",
            "Competitors": [{"Name": "Bob", "Club": "SYO", "Time": "16:02"},
                            {"Name": "Alice", "Club": "SYO", "Time": "15:50"}]}]}"#,
    )
    .unwrap();

    h.distributor.add_target(h.address.clone()).await.unwrap();
    h.distributor.start_watch(&path).await.unwrap();

    let update = next_update(&mut h.updates).await;
    let course = &update.snapshot.results().courses[0];
    assert_eq!(course.competitors[0].name, "Alice");
    assert_eq!(course.competitors[1].name, "Bob");

    let status = h.distributor.status().await.unwrap();
    assert!(status.active_watch);
    assert_eq!(status.targets, vec![h.address.clone()]);

    h.distributor.stop().await.unwrap();
}

#[tokio::test]
async fn wrong_secret_is_refused() {
    let h = harness("Live Results").await;

    let (other, _task) = Distributor::spawn(DistributorConfig {
        connection: ConnectionConfig::new(DialConfig::new(HandshakeConfig::new("wrong secret"))),
        ..DistributorConfig::default()
    });
    assert!(other.add_target(h.address.clone()).await.is_err());
    assert!(other.status().await.unwrap().targets.is_empty());
}
