//! End-to-end election and watch scenarios against the in-memory store.

use std::sync::Arc;
use std::time::Duration;

use ballot::Client;
use ballot::ClientConfig;
use ballot::store::KeyValueStore;
use ballot::store::memory::MemoryKvStore;
use tokio::sync::mpsc;

fn new_client(store: &Arc<MemoryKvStore>) -> Client {
    Client::new(ClientConfig {
        store: Some(store.clone()),
        clock: None,
    })
    .unwrap()
}

async fn recv_within(rx: &mut mpsc::Receiver<String>, ms: u64) -> Option<String> {
    tokio::time::timeout(Duration::from_millis(ms), rx.recv())
        .await
        .ok()
        .flatten()
}

#[tokio::test]
async fn solo_leader_claims_renews_and_persists_until_close() {
    let store = MemoryKvStore::new();
    let client = new_client(&store);
    client.add_voter("/leader", "A", Duration::from_secs(1)).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    let claimed = store.get("/leader").await.unwrap();
    assert_eq!(claimed.entry.value, "A");

    // With a 1 s term the lease is extended roughly every 600 ms.
    tokio::time::sleep(Duration::from_millis(800)).await;
    let renewed = store.get("/leader").await.unwrap();
    assert_eq!(renewed.entry.value, "A");
    assert!(renewed.entry.modified_index > claimed.entry.modified_index);

    client.close();
}

#[tokio::test]
async fn contested_election_keeps_exactly_one_leader() {
    let store = MemoryKvStore::new();
    let first = new_client(&store);
    let second = new_client(&store);
    first.add_voter("/leader", "A", Duration::from_secs(1)).await.unwrap();
    second.add_voter("/leader", "B", Duration::from_secs(1)).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    let winner = store.get("/leader").await.unwrap().entry.value;
    assert!(winner == "A" || winner == "B");

    // The winner extends indefinitely; the loser never overwrites.
    for _ in 0..10 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.get("/leader").await.unwrap().entry.value, winner);
    }

    first.close();
    second.close();
}

#[tokio::test]
async fn step_down_hands_leadership_to_the_other_participant() {
    let store = MemoryKvStore::new();
    let leader = new_client(&store);
    let challenger = new_client(&store);
    let observer = new_client(&store);

    leader.add_voter("/svc", "X", Duration::from_secs(1)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(store.get("/svc").await.unwrap().entry.value, "X");

    let (tx, mut rx) = mpsc::channel(16);
    observer.add_watch("/svc", Duration::from_millis(50), tx);
    assert_eq!(recv_within(&mut rx, 1_000).await.as_deref(), Some("X"));

    leader.step_down().await.unwrap();
    challenger.add_voter("/svc", "Y", Duration::from_secs(1)).await.unwrap();

    // X's lease lapses inside its 2 s pause and Y takes over; the watch sees
    // the handover without ever re-emitting "X".
    assert_eq!(recv_within(&mut rx, 4_000).await.as_deref(), Some("Y"));
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(store.get("/svc").await.unwrap().entry.value, "Y");

    leader.close();
    challenger.close();
    observer.close();
}

#[tokio::test]
async fn step_down_suspends_election_attempts_for_two_terms() {
    let store = MemoryKvStore::new();
    let client = new_client(&store);
    client.add_voter("/solo", "X", Duration::from_secs(1)).await.unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(store.get("/solo").await.unwrap().entry.value, "X");
    client.step_down().await.unwrap();

    // The lease lapses within one term and nothing reclaims it while paused.
    tokio::time::sleep(Duration::from_millis(1_200)).await;
    assert!(store.get("/solo").await.is_err());

    // After the 2 s pause the voter resumes and reclaims the key.
    tokio::time::sleep(Duration::from_millis(1_400)).await;
    assert_eq!(store.get("/solo").await.unwrap().entry.value, "X");

    client.close();
}

#[tokio::test]
async fn remove_voter_lets_the_lease_lapse() {
    let store = MemoryKvStore::new();
    let client = new_client(&store);
    client.add_voter("/leader", "A", Duration::from_secs(1)).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(store.get("/leader").await.unwrap().entry.value, "A");

    client.remove_voter().await.unwrap();
    tokio::time::sleep(Duration::from_millis(1_300)).await;
    assert!(store.get("/leader").await.is_err());

    // Re-enabling resumes claiming.
    client.add_voter("/leader", "A", Duration::from_secs(1)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(store.get("/leader").await.unwrap().entry.value, "A");

    client.close();
}

#[tokio::test]
async fn watch_on_an_absent_key_emits_once_the_key_appears() {
    let store = MemoryKvStore::new();
    let client = new_client(&store);
    let (tx, mut rx) = mpsc::channel(16);
    client.add_watch("/k", Duration::from_millis(100), tx);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(rx.try_recv().is_err());

    store.put("/k", "v1").await;
    assert_eq!(recv_within(&mut rx, 1_000).await.as_deref(), Some("v1"));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(rx.try_recv().is_err());

    client.close();
}

#[tokio::test]
async fn watch_recovers_from_history_loss() {
    let store = MemoryKvStore::with_history_capacity(2);
    let client = new_client(&store);
    store.put("/h", "v1").await;

    let (tx, mut rx) = mpsc::channel(16);
    client.add_watch("/h", Duration::from_millis(20), tx);
    assert_eq!(recv_within(&mut rx, 1_000).await.as_deref(), Some("v1"));

    // Roll the history window past the watch anchor.
    for round in 0..5 {
        store.put("/churn", &format!("x{round}")).await;
    }
    tokio::time::sleep(Duration::from_millis(150)).await;
    // The re-armed watch re-reads "v1" and suppresses the duplicate.
    assert!(rx.try_recv().is_err());

    store.put("/h", "v2").await;
    assert_eq!(recv_within(&mut rx, 1_000).await.as_deref(), Some("v2"));

    client.close();
}

#[tokio::test]
async fn deleting_a_watched_key_emits_nothing() {
    let store = MemoryKvStore::new();
    let client = new_client(&store);
    store.put("/k", "v1").await;

    let (tx, mut rx) = mpsc::channel(16);
    client.add_watch("/k", Duration::from_millis(20), tx);
    assert_eq!(recv_within(&mut rx, 1_000).await.as_deref(), Some("v1"));

    store.delete("/k").await;
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(rx.try_recv().is_err());

    client.close();
}

#[tokio::test]
async fn close_during_bootstrap_ends_the_watch_silently() {
    let store = MemoryKvStore::new();
    let client = new_client(&store);
    let (tx, mut rx) = mpsc::channel(16);
    client.add_watch("/never", Duration::from_millis(100), tx);

    tokio::time::sleep(Duration::from_millis(50)).await;
    client.close();

    // The watcher terminates within a retry period without delivering.
    assert_eq!(recv_within(&mut rx, 1_000).await, None);
}

#[tokio::test]
async fn callback_watch_observes_the_handover() {
    let store = MemoryKvStore::new();
    let client = new_client(&store);
    store.put("/cb", "first").await;

    let (seen_tx, mut seen_rx) = mpsc::channel(16);
    client.add_watch_callback("/cb", Duration::from_millis(20), move |key, previous, value| {
        let _ = seen_tx.try_send(format!("{key}:{previous}->{value}"));
    });

    assert_eq!(
        recv_within(&mut seen_rx, 1_000).await.as_deref(),
        Some("/cb:first->first")
    );

    store.put("/cb", "second").await;
    assert_eq!(
        recv_within(&mut seen_rx, 1_000).await.as_deref(),
        Some("/cb:first->second")
    );

    client.close();
}
