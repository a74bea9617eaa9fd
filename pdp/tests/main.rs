//! Integration tests for the PDP pipeline: watcher confirmation depth,
//! proving-period deferral, typed-revert handling, full possession-proof
//! assembly, and the delete reconciler.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy_primitives::{Address, Bytes, B256, U256};
use alloy_sol_types::{SolCall, SolError, SolEvent, SolValue};
use piri_chainsched::{ChainClient, ChainHandler, HeadChange, TipSet, TipSetKey};
use piri_db::Db;
use piri_lib::merkle::MerkleTree;
use piri_pdp::commp::commitment_to_cid;
use piri_pdp::contract::{
    nextProvingPeriodCall, provePossessionCall, InvalidChallengeEpoch, ProofSetDeleted,
    ProviderRegistered, RootsAdded,
};
use piri_pdp::eth::{EthClient, EthLog, EthReceipt, EthTx};
use piri_pdp::proving::{InitProvingPeriodTask, NextProvingPeriodTask, ProveTask};
use piri_pdp::sender::{Sender, SenderError, UnsignedTx};
use piri_pdp::service::{PdpConfig, Service};
use piri_pdp::store::{self, ProofSetRootRow, ProofSetRow};
use piri_pdp::verifier::{ActivePiece, PieceLocation, Verifier};
use piri_pdp::watch::{DeleteWatcher, ProviderRegisterWatcher, RootAddWatcher};
use piri_pdp::watcher::MessageWatcher;
use piri_pdp::pieces::PieceReader;
use piri_tasks::{TaskHandler, TaskResult};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn tipset(height: i64) -> TipSet {
    TipSet {
        height,
        key: TipSetKey(height.to_be_bytes().to_vec()),
    }
}

struct MockChain {
    head: Mutex<TipSet>,
    randomness: [u8; 32],
}

impl MockChain {
    fn new(height: i64) -> Arc<Self> {
        Arc::new(Self {
            head: Mutex::new(tipset(height)),
            randomness: [9u8; 32],
        })
    }
}

#[async_trait::async_trait]
impl ChainClient for MockChain {
    async fn chain_head(&self) -> anyhow::Result<TipSet> {
        Ok(self.head.lock().unwrap().clone())
    }

    async fn chain_notify(&self) -> anyhow::Result<mpsc::Receiver<Vec<HeadChange>>> {
        let (_tx, rx) = mpsc::channel(1);
        Ok(rx)
    }

    async fn beacon_randomness(
        &self,
        _epoch: i64,
        _key: &TipSetKey,
    ) -> anyhow::Result<[u8; 32]> {
        Ok(self.randomness)
    }
}

#[derive(Default)]
struct MockVerifier {
    finality: i64,
    challenge_leaves: u64,
    piece_id: u64,
    removals: Mutex<Vec<u64>>,
    fee: u64,
    active: Vec<ActivePiece>,
}

#[async_trait::async_trait]
impl Verifier for MockVerifier {
    fn address(&self) -> Address {
        Address::repeat_byte(0x11)
    }

    async fn challenge_finality(&self) -> anyhow::Result<i64> {
        Ok(self.finality)
    }

    async fn challenge_range(&self, _set_id: u64) -> anyhow::Result<u64> {
        Ok(self.challenge_leaves)
    }

    async fn find_piece_ids(
        &self,
        _set_id: u64,
        leaves: &[u64],
    ) -> anyhow::Result<Vec<PieceLocation>> {
        Ok(leaves
            .iter()
            .map(|&leaf| PieceLocation {
                piece_id: self.piece_id,
                leaf_offset: leaf,
            })
            .collect())
    }

    async fn next_challenge_epoch(&self, _set_id: u64) -> anyhow::Result<i64> {
        Ok(500)
    }

    async fn calculate_proof_fee(&self, _set_id: u64) -> anyhow::Result<U256> {
        Ok(U256::from(self.fee))
    }

    async fn data_set_storage_provider(&self, _set_id: u64) -> anyhow::Result<Address> {
        Ok(Address::repeat_byte(0x22))
    }

    async fn data_set_listener(&self, _set_id: u64) -> anyhow::Result<Address> {
        Ok(Address::repeat_byte(0x33))
    }

    async fn scheduled_removals(&self, _set_id: u64) -> anyhow::Result<Vec<u64>> {
        Ok(self.removals.lock().unwrap().clone())
    }

    async fn active_piece_count(&self, _set_id: u64) -> anyhow::Result<u64> {
        Ok(self.active.len() as u64)
    }

    async fn active_pieces(
        &self,
        _set_id: u64,
        offset: u64,
        limit: u64,
    ) -> anyhow::Result<Vec<ActivePiece>> {
        Ok(self
            .active
            .iter()
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect())
    }
}

struct MockService {
    window_start: i64,
}

#[async_trait::async_trait]
impl Service for MockService {
    async fn pdp_config(&self) -> anyhow::Result<PdpConfig> {
        Ok(PdpConfig {
            max_proving_period: 60,
            challenge_window: 30,
        })
    }

    async fn next_challenge_window_start(&self, _set_id: u64) -> anyhow::Result<i64> {
        Ok(self.window_start)
    }
}

#[derive(Default)]
struct MockSender {
    sends: Mutex<Vec<(Address, UnsignedTx, String)>>,
    revert_with: Mutex<Option<Bytes>>,
}

#[async_trait::async_trait]
impl Sender for MockSender {
    async fn send(
        &self,
        from: Address,
        tx: UnsignedTx,
        reason: &str,
    ) -> Result<B256, SenderError> {
        if let Some(data) = self.revert_with.lock().unwrap().take() {
            return Err(SenderError::Reverted(data));
        }
        let mut sends = self.sends.lock().unwrap();
        sends.push((from, tx, reason.to_string()));
        Ok(B256::repeat_byte(sends.len() as u8))
    }
}

#[derive(Default)]
struct MockEth {
    receipts: Mutex<HashMap<B256, EthReceipt>>,
    txs: Mutex<HashMap<B256, EthTx>>,
}

#[async_trait::async_trait]
impl EthClient for MockEth {
    async fn transaction_receipt(&self, hash: B256) -> anyhow::Result<Option<EthReceipt>> {
        Ok(self.receipts.lock().unwrap().get(&hash).cloned())
    }

    async fn transaction_by_hash(&self, hash: B256) -> anyhow::Result<Option<EthTx>> {
        Ok(self.txs.lock().unwrap().get(&hash).cloned())
    }
}

struct MockPieces {
    data: HashMap<i64, Vec<u8>>,
}

#[async_trait::async_trait]
impl PieceReader for MockPieces {
    async fn read_piece(&self, ref_id: i64) -> anyhow::Result<Vec<u8>> {
        self.data
            .get(&ref_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no piece for ref {ref_id}"))
    }
}

fn proof_set(id: u64) -> ProofSetRow {
    ProofSetRow {
        id,
        service: "test-service".to_string(),
        challenge_request_msg_hash: None,
        challenge_request_task_id: None,
        prev_challenge_request_epoch: None,
        prove_at_epoch: None,
        challenge_window: 30,
        proving_period: 60,
        init_ready: false,
    }
}

#[tokio::test]
async fn watcher_confirms_at_depth() {
    let dir = tempfile::tempdir().unwrap();
    let db = Db::open(&dir.path().join("pdp.sqlite")).unwrap();
    store::migrate(&db).await.unwrap();

    let hash = B256::repeat_byte(0xab);
    store::add_message_wait(&db, hash).await.unwrap();

    let eth = Arc::new(MockEth::default());
    eth.receipts.lock().unwrap().insert(
        hash,
        EthReceipt {
            transaction_hash: hash,
            block_number: 1000,
            status: true,
            logs: vec![],
        },
    );
    eth.txs.lock().unwrap().insert(
        hash,
        EthTx {
            hash,
            to: Some(Address::repeat_byte(0x11)),
            value: U256::ZERO,
            input: Bytes::new(),
            nonce: 1,
        },
    );

    let watcher = MessageWatcher::new(db.clone(), eth, "machine-a".to_string());
    watcher.start().await.unwrap();

    // Depth 1004 - 1000 < MinConfidence: stays pending.
    watcher
        .on_head_change(None, Some(&tipset(1001)))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let row = store::get_message_wait(&db, &store::hash_hex(hash))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.tx_status, "pending");

    watcher
        .on_head_change(None, Some(&tipset(1005)))
        .await
        .unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let row = store::get_message_wait(&db, &store::hash_hex(hash))
            .await
            .unwrap()
            .unwrap();
        if row.tx_status == "confirmed" {
            assert_eq!(row.tx_success, Some(true));
            assert_eq!(row.confirmed_block_number, Some(1000));
            assert_eq!(row.waiter_machine_id, None);
            assert!(row.tx_receipt.is_some());
            assert!(row.confirmed_tx_data.is_some());
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "message never confirmed"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    watcher.stop(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn next_proving_period_defers_slipped_window() {
    let dir = tempfile::tempdir().unwrap();
    let db = Db::open(&dir.path().join("pdp.sqlite")).unwrap();
    store::migrate(&db).await.unwrap();

    let mut set = proof_set(1);
    set.challenge_request_task_id = Some(42);
    set.prove_at_epoch = Some(1000);
    store::insert_proof_set(&db, set).await.unwrap();

    let chain = MockChain::new(1100);
    let verifier = Arc::new(MockVerifier {
        finality: 2,
        ..Default::default()
    });
    let sender = Arc::new(MockSender::default());
    let task = NextProvingPeriodTask::new(
        db.clone(),
        chain,
        verifier,
        Arc::new(MockService { window_start: 1000 }),
        sender.clone(),
        Address::repeat_byte(0x44),
    );

    let result = task.do_work(42, CancellationToken::new()).await;
    assert!(matches!(result, TaskResult::Done(None)));

    // windowEnd 1030 < minAllowed 1102: deferred, nothing sent.
    assert!(sender.sends.lock().unwrap().is_empty());
    let row = store::get_proof_set(&db, 1).await.unwrap().unwrap();
    assert_eq!(row.prove_at_epoch, Some(1102));
    assert_eq!(row.challenge_request_task_id, None);
    assert_eq!(row.challenge_request_msg_hash, None);
}

#[tokio::test]
async fn next_proving_period_sends_inside_reachable_window() {
    let dir = tempfile::tempdir().unwrap();
    let db = Db::open(&dir.path().join("pdp.sqlite")).unwrap();
    store::migrate(&db).await.unwrap();

    let mut set = proof_set(1);
    set.challenge_request_task_id = Some(11);
    set.prove_at_epoch = Some(960);
    store::insert_proof_set(&db, set).await.unwrap();

    // head 995 + finality 2 = min 997; window [1000, 1030] is ahead of
    // the minimum, so the request targets the window start.
    let sender = Arc::new(MockSender::default());
    let task = NextProvingPeriodTask::new(
        db.clone(),
        MockChain::new(995),
        Arc::new(MockVerifier {
            finality: 2,
            ..Default::default()
        }),
        Arc::new(MockService { window_start: 1000 }),
        sender.clone(),
        Address::repeat_byte(0x44),
    );

    let result = task.do_work(11, CancellationToken::new()).await;
    assert!(matches!(result, TaskResult::Done(None)));

    let sends = sender.sends.lock().unwrap();
    assert_eq!(sends.len(), 1);
    let (_, tx, reason) = &sends[0];
    assert_eq!(reason, "pdp-next-proving-period");
    let call = nextProvingPeriodCall::abi_decode(&tx.input, true).unwrap();
    assert_eq!(call.challengeEpoch, U256::from(1000));
    drop(sends);

    let row = store::get_proof_set(&db, 1).await.unwrap().unwrap();
    assert_eq!(row.prove_at_epoch, Some(1000));
    assert_eq!(row.prev_challenge_request_epoch, Some(995));
    assert_eq!(row.challenge_request_task_id, None);
    let msg = row.challenge_request_msg_hash.unwrap();
    let wait = store::get_message_wait(&db, &msg).await.unwrap().unwrap();
    assert_eq!(wait.tx_status, "pending");
}

#[tokio::test]
async fn init_retries_until_data_arrives_then_schedules() {
    let dir = tempfile::tempdir().unwrap();
    let db = Db::open(&dir.path().join("pdp.sqlite")).unwrap();
    store::migrate(&db).await.unwrap();

    let mut set = proof_set(3);
    set.init_ready = true;
    set.challenge_request_task_id = Some(21);
    store::insert_proof_set(&db, set).await.unwrap();

    let sender = Arc::new(MockSender::default());
    let task = InitProvingPeriodTask::new(
        db.clone(),
        MockChain::new(100),
        Arc::new(MockVerifier::default()),
        Arc::new(MockService { window_start: 130 }),
        sender.clone(),
        Address::repeat_byte(0x44),
    );

    // No data yet: the task asks to be retried, nothing is sent.
    let result = task.do_work(21, CancellationToken::new()).await;
    assert!(matches!(result, TaskResult::Retry(_)));
    assert!(sender.sends.lock().unwrap().is_empty());

    // One 4-leaf subroot lands; init schedules mid-window: 130 + 30/2.
    let piece = store::insert_parked_piece(&db, "bafy-init-piece", 128, 128)
        .await
        .unwrap();
    let piece_ref = store::insert_piece_ref(&db, piece, None).await.unwrap();
    store::insert_proofset_root(
        &db,
        ProofSetRootRow {
            proofset_id: 3,
            root_id: 1,
            root_cid: "bafy-init-piece".to_string(),
            subroot_cid: "bafy-init-piece".to_string(),
            subroot_offset: 0,
            subroot_size: 128,
            pdp_pieceref: piece_ref,
        },
    )
    .await
    .unwrap();

    let result = task.do_work(21, CancellationToken::new()).await;
    assert!(matches!(result, TaskResult::Done(None)));

    let row = store::get_proof_set(&db, 3).await.unwrap().unwrap();
    assert_eq!(row.prove_at_epoch, Some(145));
    assert_eq!(row.prev_challenge_request_epoch, Some(100));
    assert_eq!(row.challenge_request_task_id, None);
    assert!(row.challenge_request_msg_hash.is_some());
}

#[tokio::test]
async fn root_add_watcher_materializes_from_receipt() {
    let dir = tempfile::tempdir().unwrap();
    let db = Db::open(&dir.path().join("pdp.sqlite")).unwrap();
    store::migrate(&db).await.unwrap();

    let msg = B256::repeat_byte(0xee);
    let msg_hex = store::hash_hex(msg);
    // Two roots in one add message; the second has two subroots.
    for (index, subroot, offset) in [(0u64, "a", 0u64), (1, "b", 0), (1, "c", 128)] {
        store::insert_root_add(
            &db,
            store::RootAddRow {
                proofset_id: 2,
                add_message_hash: msg_hex.clone(),
                add_message_index: index,
                add_message_ok: None,
                root_cid: format!("root-{index}"),
                subroot_cid: format!("subroot-{subroot}"),
                subroot_offset: offset,
                subroot_size: 128,
                pdp_pieceref: 10 + index as i64,
            },
        )
        .await
        .unwrap();
    }

    store::add_message_wait(&db, msg).await.unwrap();
    let receipt = EthReceipt {
        transaction_hash: msg,
        block_number: 50,
        status: true,
        logs: vec![EthLog {
            address: Address::ZERO,
            topics: vec![RootsAdded::SIGNATURE_HASH, B256::from(U256::from(2))],
            data: vec![U256::from(70), U256::from(71)].abi_encode().into(),
        }],
    };
    store::confirm_wait(
        &db,
        store::Confirmation {
            signed_tx_hash: msg_hex.clone(),
            confirmed_tx_hash: msg_hex.clone(),
            block_number: 50,
            success: true,
            receipt_json: serde_json::to_vec(&receipt).unwrap(),
            tx_json: b"{}".to_vec(),
        },
    )
    .await
    .unwrap();

    let watcher = RootAddWatcher::new(db.clone(), Arc::new(MockVerifier::default()));
    watcher
        .on_head_change(None, Some(&tipset(60)))
        .await
        .unwrap();

    // Intents are gone, roots carry the chain-assigned ids aligned by
    // message index.
    assert!(store::root_add_rows(&db, 2, &msg_hex).await.unwrap().is_empty());
    let first = store::subroots_for_piece(&db, 2, 70).await.unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].subroot_cid, "subroot-a");
    let second = store::subroots_for_piece(&db, 2, 71).await.unwrap();
    assert_eq!(second.len(), 2);
    assert_eq!(second[0].subroot_offset, 0);
    assert_eq!(second[1].subroot_offset, 128);
}

#[tokio::test]
async fn register_watcher_extracts_provider_id() {
    let dir = tempfile::tempdir().unwrap();
    let db = Db::open(&dir.path().join("pdp.sqlite")).unwrap();
    store::migrate(&db).await.unwrap();

    let msg = B256::repeat_byte(0xf1);
    let msg_hex = store::hash_hex(msg);
    store::insert_registration_intent(&db, &msg_hex).await.unwrap();
    store::add_message_wait(&db, msg).await.unwrap();

    let receipt = EthReceipt {
        transaction_hash: msg,
        block_number: 10,
        status: true,
        logs: vec![EthLog {
            address: Address::ZERO,
            topics: vec![
                ProviderRegistered::SIGNATURE_HASH,
                B256::from(U256::from(314)),
            ],
            data: Address::repeat_byte(0x22).abi_encode().into(),
        }],
    };
    store::confirm_wait(
        &db,
        store::Confirmation {
            signed_tx_hash: msg_hex.clone(),
            confirmed_tx_hash: msg_hex.clone(),
            block_number: 10,
            success: true,
            receipt_json: serde_json::to_vec(&receipt).unwrap(),
            tx_json: b"{}".to_vec(),
        },
    )
    .await
    .unwrap();

    let watcher = ProviderRegisterWatcher::new(db.clone());
    watcher
        .on_head_change(None, Some(&tipset(20)))
        .await
        .unwrap();

    assert_eq!(
        store::get_registration(&db, &msg_hex).await.unwrap(),
        Some((Some(314), true))
    );
    assert!(store::pending_registrations(&db).await.unwrap().is_empty());
}

#[tokio::test]
async fn next_proving_period_handles_typed_revert() {
    let dir = tempfile::tempdir().unwrap();
    let db = Db::open(&dir.path().join("pdp.sqlite")).unwrap();
    store::migrate(&db).await.unwrap();

    let mut set = proof_set(1);
    set.challenge_request_task_id = Some(7);
    set.prove_at_epoch = Some(900);
    store::insert_proof_set(&db, set).await.unwrap();

    let sender = Arc::new(MockSender::default());
    *sender.revert_with.lock().unwrap() = Some(
        InvalidChallengeEpoch {
            minAllowed: U256::from(1050),
            maxAllowed: U256::from(1080),
        }
        .abi_encode()
        .into(),
    );

    let task = NextProvingPeriodTask::new(
        db.clone(),
        MockChain::new(990),
        Arc::new(MockVerifier {
            finality: 2,
            ..Default::default()
        }),
        Arc::new(MockService { window_start: 1000 }),
        sender.clone(),
        Address::repeat_byte(0x44),
    );

    let result = task.do_work(7, CancellationToken::new()).await;
    assert!(matches!(result, TaskResult::Done(Some(_))));

    let row = store::get_proof_set(&db, 1).await.unwrap().unwrap();
    // Clamped into the window covering the contract's minimum.
    assert_eq!(row.prove_at_epoch, Some(1050));
    assert_eq!(row.challenge_request_task_id, None);
    assert!(sender.sends.lock().unwrap().is_empty());
}

#[tokio::test]
async fn prove_task_builds_verifiable_proofs() {
    let dir = tempfile::tempdir().unwrap();
    let db = Db::open(&dir.path().join("pdp.sqlite")).unwrap();
    store::migrate(&db).await.unwrap();

    // One piece of 4 leaves in a single subroot.
    let data: Vec<u8> = (0..128u32).map(|b| b as u8).collect();
    let tree = MerkleTree::from_padded_bytes(&data, 4);
    let subroot_cid = commitment_to_cid(tree.root()).unwrap().to_string();

    let mut set = proof_set(1);
    set.challenge_request_msg_hash = Some(store::hash_hex(B256::repeat_byte(0xcc)));
    set.prove_at_epoch = Some(400);
    store::insert_proof_set(&db, set).await.unwrap();

    let piece = store::insert_parked_piece(&db, &subroot_cid, 128, 128)
        .await
        .unwrap();
    let piece_ref = store::insert_piece_ref(&db, piece, None).await.unwrap();
    store::insert_proofset_root(
        &db,
        ProofSetRootRow {
            proofset_id: 1,
            root_id: 5,
            root_cid: subroot_cid.clone(),
            subroot_cid: subroot_cid.clone(),
            subroot_offset: 0,
            subroot_size: 128,
            pdp_pieceref: piece_ref,
        },
    )
    .await
    .unwrap();

    // Claim like the producer would: consume the message hash, record
    // the prove task.
    let claimed = db
        .with_tx(|tx| store::claim_prove_task(tx, 1, 77))
        .await
        .unwrap();
    assert!(claimed);

    let sender = Arc::new(MockSender::default());
    let verifier = Arc::new(MockVerifier {
        finality: 2,
        challenge_leaves: 4,
        piece_id: 5,
        fee: 7,
        ..Default::default()
    });
    let task = ProveTask::new(
        db.clone(),
        MockChain::new(600),
        verifier,
        sender.clone(),
        Arc::new(MockPieces {
            data: HashMap::from([(piece_ref, data)]),
        }),
        Address::repeat_byte(0x44),
    );

    let result = task.do_work(77, CancellationToken::new()).await;
    match &result {
        TaskResult::Done(None) => {}
        TaskResult::Done(Some(err)) => panic!("unexpected terminal error: {err}"),
        TaskResult::Retry(err) => panic!("unexpected retry: {err}"),
    }

    let sends = sender.sends.lock().unwrap();
    assert_eq!(sends.len(), 1);
    let (_, tx, reason) = &sends[0];
    assert_eq!(reason, "pdp-prove-possession");
    // 3x headroom over the estimated fee.
    assert_eq!(tx.value, U256::from(21));

    let call = provePossessionCall::abi_decode(&tx.input, true).unwrap();
    assert_eq!(call.setId, U256::from(1));
    assert_eq!(call.proofs.len(), 5);
    for proof in &call.proofs {
        // Each proof must recompute to the piece root. Positions are
        // recoverable because the mock maps challenge i to leaf i.
        let leaf_index = (0..4u64)
            .find(|&i| tree.proof(i).unwrap().leaf == proof.leaf)
            .expect("leaf not in piece");
        let mut node = proof.leaf;
        let mut index = leaf_index;
        for sibling in &proof.proof {
            node = if index & 1 == 1 {
                piri_lib::merkle::hash_pair(sibling, &node)
            } else {
                piri_lib::merkle::hash_pair(&node, sibling)
            };
            index >>= 1;
        }
        assert_eq!(node, tree.root());
    }
    drop(sends);

    // The send opened a wait for the prove transaction and retired the
    // claim row.
    let sent_hash = store::hash_hex(B256::repeat_byte(0x01));
    let wait = store::get_message_wait(&db, &sent_hash).await.unwrap();
    assert!(wait.is_some());
    assert_eq!(store::prove_task_set(&db, 77).await.unwrap(), None);
}

#[tokio::test]
async fn cleanup_deleted_roots_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let db = Db::open(&dir.path().join("pdp.sqlite")).unwrap();
    store::migrate(&db).await.unwrap();

    let piece = store::insert_parked_piece(&db, "bafy-test-piece", 128, 128)
        .await
        .unwrap();
    let piece_ref = store::insert_piece_ref(&db, piece, None).await.unwrap();
    store::insert_proofset_root(
        &db,
        ProofSetRootRow {
            proofset_id: 1,
            root_id: 5,
            root_cid: "bafy-test-piece".to_string(),
            subroot_cid: "bafy-test-piece".to_string(),
            subroot_offset: 0,
            subroot_size: 128,
            pdp_pieceref: piece_ref,
        },
    )
    .await
    .unwrap();

    // Root 99 never existed; it is skipped both times.
    let removed = store::cleanup_deleted_roots(&db, 1, vec![5, 99]).await.unwrap();
    assert_eq!(removed, 1);
    assert_eq!(store::count_roots(&db, 1).await.unwrap(), 0);
    assert_eq!(store::count_piece_refs(&db).await.unwrap(), 0);

    let removed = store::cleanup_deleted_roots(&db, 1, vec![5, 99]).await.unwrap();
    assert_eq!(removed, 0);
}

#[tokio::test]
async fn delete_watcher_tears_down_confirmed_set() {
    let dir = tempfile::tempdir().unwrap();
    let db = Db::open(&dir.path().join("pdp.sqlite")).unwrap();
    store::migrate(&db).await.unwrap();

    store::insert_proof_set(&db, proof_set(9)).await.unwrap();
    let piece = store::insert_parked_piece(&db, "bafy-del-piece", 128, 128)
        .await
        .unwrap();
    let piece_ref = store::insert_piece_ref(&db, piece, None).await.unwrap();
    store::insert_proofset_root(
        &db,
        ProofSetRootRow {
            proofset_id: 9,
            root_id: 1,
            root_cid: "bafy-del-piece".to_string(),
            subroot_cid: "bafy-del-piece".to_string(),
            subroot_offset: 0,
            subroot_size: 128,
            pdp_pieceref: piece_ref,
        },
    )
    .await
    .unwrap();

    let msg = B256::repeat_byte(0xdd);
    let msg_hex = store::hash_hex(msg);
    store::insert_delete_intent(&db, 9, &msg_hex).await.unwrap();
    store::add_message_wait(&db, msg).await.unwrap();

    let receipt = EthReceipt {
        transaction_hash: msg,
        block_number: 100,
        status: true,
        logs: vec![EthLog {
            address: Address::ZERO,
            topics: vec![ProofSetDeleted::SIGNATURE_HASH, B256::from(U256::from(9))],
            data: U256::from(4096).abi_encode().into(),
        }],
    };
    store::confirm_wait(
        &db,
        store::Confirmation {
            signed_tx_hash: msg_hex.clone(),
            confirmed_tx_hash: msg_hex.clone(),
            block_number: 100,
            success: true,
            receipt_json: serde_json::to_vec(&receipt).unwrap(),
            tx_json: b"{}".to_vec(),
        },
    )
    .await
    .unwrap();

    let watcher = DeleteWatcher::new(db.clone());
    watcher
        .on_head_change(None, Some(&tipset(200)))
        .await
        .unwrap();

    assert_eq!(store::get_proof_set(&db, 9).await.unwrap(), None);
    assert_eq!(store::count_roots(&db, 9).await.unwrap(), 0);
    assert_eq!(store::count_piece_refs(&db).await.unwrap(), 0);
    assert_eq!(store::pending_deletes(&db).await.unwrap(), vec![]);
}
