//! Integration tests for keying and ledger signing across several nodes.
//!
//! Nodes share one redb file standing in for consensus-ordered state: every
//! submission lands in it directly, in the order nodes run.
//!
//! Run with: cargo test --test `tss_flow`

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;
use tokio::sync::mpsc;

use ledger_tss::config::{Settings, SignerFeatures};
use ledger_tss::roster::{NodeId, Roster};
use ledger_tss::storage::{Storage, TssStore};
use ledger_tss::test_support::{FakeCryptoEngine, FakeNodeSigner, StoreSubmissions};
use ledger_tss::tss::{RosterToKey, TssKeyingStatus, TssShareSignatureRecord, TssStatus};
use ledger_tss::TssService;

const NODES: [NodeId; 3] = [1, 2, 3];

fn create_network(
    temp_dir: &TempDir,
    sign_with_ledger_id: bool,
) -> (Vec<TssService>, Storage, mpsc::UnboundedReceiver<TssShareSignatureRecord>) {
    let storage = Storage::open(&temp_dir.path().join("ledger.redb")).expect("Failed to create storage");
    let store: Arc<dyn TssStore> = Arc::new(storage.clone());
    let (tx, rx) = mpsc::unbounded_channel();

    let services = NODES
        .iter()
        .map(|&node_id| {
            let settings = Settings::for_tests(node_id, temp_dir.path())
                .with_max_shares_per_node(1)
                .with_features(SignerFeatures {
                    hints: true,
                    history: false,
                })
                .with_sign_with_ledger_id(sign_with_ledger_id);
            TssService::new(
                &settings,
                Arc::new(FakeCryptoEngine::new()),
                Arc::clone(&store),
                Arc::new(FakeNodeSigner::new(node_id)),
                Arc::new(StoreSubmissions::new(Arc::clone(&store), node_id, tx.clone())),
                None,
            )
            .expect("Failed to create service")
        })
        .collect();

    (services, storage, rx)
}

/// Run rounds until every node has reported `KeyingComplete` once.
///
/// Nodes can finish a round apart; a finished node sits out the remaining
/// rounds so its completed status is what gets returned.
async fn run_until_keyed(services: &[TssService], roster: &Roster, candidate: Option<&Roster>) -> Vec<TssStatus> {
    let mut completed: Vec<Option<TssStatus>> = services.iter().map(|_| None).collect();
    for _ in 0..8 {
        for (service, slot) in services.iter().zip(completed.iter_mut()) {
            if slot.is_some() {
                continue;
            }
            let status = service.on_round(roster, candidate, false, Utc::now()).await.unwrap();
            if status.keying_status == TssKeyingStatus::KeyingComplete {
                *slot = Some(status);
            }
        }
        if completed.iter().all(Option::is_some) {
            return completed.into_iter().flatten().collect();
        }
    }
    panic!("network did not finish keying");
}

#[tokio::test]
async fn test_genesis_keying_agrees_on_ledger_id() {
    let temp_dir = TempDir::new().unwrap();
    let (services, storage, _rx) = create_network(&temp_dir, false);
    let roster = Roster::from_weights(NODES.iter().map(|&node_id| (node_id, 1)));

    let statuses = run_until_keyed(&services, &roster, None).await;

    let ledger_id = statuses[0].ledger_id.clone();
    assert!(!ledger_id.is_empty());
    for status in &statuses {
        assert_eq!(status.ledger_id, ledger_id);
    }

    // Two of three shares met the threshold before the last node sent anything.
    let messages = storage.messages_for_target(&roster.hash()).unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(
        messages.iter().map(|m| m.share_index).collect::<Vec<_>>(),
        vec![1, 2]
    );

    for (service, node_id) in services.iter().zip(NODES) {
        let keys = service.keys().keys().unwrap();
        assert_eq!(keys.total_shares(), 3);
        assert_eq!(keys.directory().threshold(), 2);
        assert_eq!(
            keys.private_shares().iter().map(|s| s.share_id).collect::<Vec<_>>(),
            vec![u32::try_from(node_id).unwrap()]
        );
        assert!(service.block_signer().is_ready());
    }

    // Keying complete is followed by a rest state that keeps the ledger id.
    for service in &services {
        let status = service.on_round(&roster, None, false, Utc::now()).await.unwrap();
        assert_eq!(status.roster_to_key, RosterToKey::None);
        assert_eq!(status.ledger_id, ledger_id);
    }
}

#[tokio::test]
async fn test_block_hash_signed_with_ledger_id() {
    let temp_dir = TempDir::new().unwrap();
    let (services, _storage, mut rx) = create_network(&temp_dir, true);
    let roster = Roster::from_weights(NODES.iter().map(|&node_id| (node_id, 1)));
    run_until_keyed(&services, &roster, None).await;

    let block_hash = b"block-hash-0001".to_vec();
    let handles: Vec<_> = services
        .iter()
        .map(|service| tokio::spawn(service.block_signer().sign_future(&block_hash).unwrap()))
        .collect();

    // One share signature per node; every node sees them in the same order.
    for _ in 0..NODES.len() {
        let record = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("share signature not submitted")
            .expect("channel closed");
        assert_eq!(record.message_hash, block_hash);
        for service in &services {
            service.on_share_signature(&record).unwrap();
        }
    }

    let mut signatures = Vec::new();
    for handle in handles {
        let signature = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("signature not aggregated")
            .unwrap()
            .unwrap();
        signatures.push(signature);
    }

    assert!(!signatures[0].is_empty());
    assert!(signatures.iter().all(|signature| signature == &signatures[0]));
}

#[tokio::test]
async fn test_restarted_node_resumes_from_store() {
    let temp_dir = TempDir::new().unwrap();
    let roster = Roster::from_weights(NODES.iter().map(|&node_id| (node_id, 1)));

    let ledger_id = {
        let (services, _storage, _rx) = create_network(&temp_dir, false);
        run_until_keyed(&services, &roster, None).await[0].ledger_id.clone()
    };

    // Fresh services over the same file start out keyed.
    let (services, _storage, _rx) = create_network(&temp_dir, false);
    let status = services[1].on_round(&roster, None, false, Utc::now()).await.unwrap();
    assert_eq!(status.ledger_id, ledger_id);
    assert!(services[1].keys().is_populated());
    assert!(services[1].block_signer().is_ready());

    // A new candidate roster is picked up at the next stake period boundary.
    let candidate = Roster::from_weights([(1, 1), (2, 1), (3, 1), (4, 1)]);
    let status = services[1]
        .on_round(&roster, Some(&candidate), true, Utc::now())
        .await
        .unwrap();
    assert_eq!(status.roster_to_key, RosterToKey::CandidateRoster);
    assert_eq!(status.keying_status, TssKeyingStatus::WaitingForThresholdTssMessages);
    assert_eq!(status.ledger_id, ledger_id);
}

#[tokio::test]
async fn test_candidate_roster_rekey_completes() {
    let temp_dir = TempDir::new().unwrap();
    let (services, storage, _rx) = create_network(&temp_dir, false);
    let roster = Roster::from_weights(NODES.iter().map(|&node_id| (node_id, 1)));
    run_until_keyed(&services, &roster, None).await;

    // Rest round, then the stake period boundary picks up the candidate.
    let candidate = Roster::from_weights([(1, 1), (2, 1), (3, 1), (4, 1)]);
    for service in &services {
        let status = service.on_round(&roster, None, false, Utc::now()).await.unwrap();
        assert_eq!(status.roster_to_key, RosterToKey::None);
    }
    for service in &services {
        let status = service
            .on_round(&roster, Some(&candidate), true, Utc::now())
            .await
            .unwrap();
        assert_eq!(status.roster_to_key, RosterToKey::CandidateRoster);
        assert_eq!(status.keying_status, TssKeyingStatus::WaitingForThresholdTssMessages);
    }

    let statuses = run_until_keyed(&services, &roster, Some(&candidate)).await;

    let ledger_id = statuses[0].ledger_id.clone();
    assert!(!ledger_id.is_empty());
    for status in &statuses {
        assert_eq!(status.roster_to_key, RosterToKey::CandidateRoster);
        assert_eq!(status.ledger_id, ledger_id);
    }

    // Every active share was re-shared once; four candidate shares need three.
    let messages = storage.messages_for_target(&candidate.hash()).unwrap();
    assert_eq!(
        messages.iter().map(|m| m.share_index).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert!(messages.iter().all(|m| m.source_roster_hash == roster.hash()));

    let votes = storage.votes_for_target(&candidate.hash()).unwrap();
    assert!(!votes.is_empty());
    assert!(votes.iter().all(|(node_id, vote)| {
        NODES.contains(node_id) && vote.ledger_id == ledger_id
    }));
}
