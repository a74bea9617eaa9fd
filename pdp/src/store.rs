//! Schema and row-level operations for the PDP tables: proof sets,
//! message waits, root-add intents, materialized roots, delete and
//! provider-registration intents, and parked piece refs.
//!
//! Offsets and sizes on subroot rows are padded bytes; divide by the
//! leaf size for tree arithmetic.

use alloy_primitives::B256;
use piri_db::{Db, DbResult};
use piri_lib::ChainEpoch;
use piri_tasks::TaskId;
use rusqlite::{named_params, Transaction};

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS pdp_proof_set(
  id INTEGER PRIMARY KEY,
  service TEXT NOT NULL,
  challenge_request_msg_hash TEXT,
  challenge_request_task_id INTEGER,
  prev_challenge_request_epoch INTEGER,
  prove_at_epoch INTEGER,
  challenge_window INTEGER NOT NULL,
  proving_period INTEGER NOT NULL,
  init_ready INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS message_waits_eth(
  signed_tx_hash TEXT PRIMARY KEY,
  waiter_machine_id TEXT,
  tx_status TEXT NOT NULL DEFAULT 'pending',
  confirmed_block_number INTEGER,
  confirmed_tx_hash TEXT,
  confirmed_tx_data BLOB,
  tx_receipt BLOB,
  tx_success INTEGER
);

CREATE TABLE IF NOT EXISTS pdp_proofset_root_adds(
  proofset_id INTEGER NOT NULL,
  add_message_hash TEXT NOT NULL,
  add_message_index INTEGER NOT NULL,
  add_message_ok INTEGER,
  root_cid TEXT NOT NULL,
  subroot_cid TEXT NOT NULL,
  subroot_offset INTEGER NOT NULL,
  subroot_size INTEGER NOT NULL,
  pdp_pieceref INTEGER NOT NULL,
  PRIMARY KEY (proofset_id, add_message_hash, add_message_index, subroot_offset)
);

CREATE TABLE IF NOT EXISTS pdp_proofset_roots(
  proofset_id INTEGER NOT NULL,
  root_id INTEGER NOT NULL,
  root_cid TEXT NOT NULL,
  subroot_cid TEXT NOT NULL,
  subroot_offset INTEGER NOT NULL,
  subroot_size INTEGER NOT NULL,
  pdp_pieceref INTEGER NOT NULL,
  add_message_hash TEXT NOT NULL,
  add_message_index INTEGER NOT NULL,
  PRIMARY KEY (proofset_id, root_id, subroot_offset)
);

CREATE TABLE IF NOT EXISTS pdp_proofset_deletes(
  proofset_id INTEGER PRIMARY KEY,
  delete_message_hash TEXT NOT NULL,
  processed INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS pdp_provider_registrations(
  registration_message_hash TEXT PRIMARY KEY,
  provider_id INTEGER,
  processed INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS parked_pieces(
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  piece_cid TEXT NOT NULL UNIQUE,
  piece_padded_size INTEGER NOT NULL,
  piece_raw_size INTEGER NOT NULL,
  complete INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS parked_piece_refs(
  ref_id INTEGER PRIMARY KEY AUTOINCREMENT,
  piece_id INTEGER NOT NULL REFERENCES parked_pieces(id),
  data_url TEXT
);

CREATE TABLE IF NOT EXISTS pdp_prove_tasks(
  proofset_id INTEGER NOT NULL,
  task_id INTEGER NOT NULL,
  PRIMARY KEY (proofset_id, task_id)
);
"#;

pub async fn migrate(db: &Db) -> DbResult<()> {
    db.migrate(SCHEMA).await
}

pub fn hash_hex(hash: B256) -> String {
    format!("{hash:#x}")
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProofSetRow {
    pub id: u64,
    pub service: String,
    pub challenge_request_msg_hash: Option<String>,
    pub challenge_request_task_id: Option<TaskId>,
    pub prev_challenge_request_epoch: Option<ChainEpoch>,
    pub prove_at_epoch: Option<ChainEpoch>,
    pub challenge_window: u64,
    pub proving_period: u64,
    pub init_ready: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageWaitRow {
    pub signed_tx_hash: String,
    pub waiter_machine_id: Option<String>,
    pub tx_status: String,
    pub confirmed_block_number: Option<u64>,
    pub confirmed_tx_hash: Option<String>,
    pub confirmed_tx_data: Option<Vec<u8>>,
    pub tx_receipt: Option<Vec<u8>>,
    pub tx_success: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RootAddRow {
    pub proofset_id: u64,
    pub add_message_hash: String,
    pub add_message_index: u64,
    pub add_message_ok: Option<bool>,
    pub root_cid: String,
    pub subroot_cid: String,
    pub subroot_offset: u64,
    pub subroot_size: u64,
    pub pdp_pieceref: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProofSetRootRow {
    pub proofset_id: u64,
    pub root_id: u64,
    pub root_cid: String,
    pub subroot_cid: String,
    pub subroot_offset: u64,
    pub subroot_size: u64,
    pub pdp_pieceref: i64,
}

fn proof_set_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProofSetRow> {
    Ok(ProofSetRow {
        id: row.get(0)?,
        service: row.get(1)?,
        challenge_request_msg_hash: row.get(2)?,
        challenge_request_task_id: row.get(3)?,
        prev_challenge_request_epoch: row.get(4)?,
        prove_at_epoch: row.get(5)?,
        challenge_window: row.get(6)?,
        proving_period: row.get(7)?,
        init_ready: row.get(8)?,
    })
}

const PROOF_SET_COLS: &str = "id, service, challenge_request_msg_hash, challenge_request_task_id,
     prev_challenge_request_epoch, prove_at_epoch, challenge_window, proving_period, init_ready";

pub async fn insert_proof_set(db: &Db, row: ProofSetRow) -> DbResult<()> {
    db.with_conn(move |conn| {
        conn.execute(
            "INSERT INTO pdp_proof_set
               (id, service, challenge_request_msg_hash, challenge_request_task_id,
                prev_challenge_request_epoch, prove_at_epoch, challenge_window, proving_period,
                init_ready)
             VALUES (:id, :service, :msg, :task, :prev, :at, :window, :period, :ready)",
            named_params! {
                ":id": row.id,
                ":service": row.service,
                ":msg": row.challenge_request_msg_hash,
                ":task": row.challenge_request_task_id,
                ":prev": row.prev_challenge_request_epoch,
                ":at": row.prove_at_epoch,
                ":window": row.challenge_window,
                ":period": row.proving_period,
                ":ready": row.init_ready,
            },
        )?;
        Ok(())
    })
    .await
}

pub async fn get_proof_set(db: &Db, id: u64) -> DbResult<Option<ProofSetRow>> {
    db.with_conn(move |conn| {
        conn.query_row(
            &format!("SELECT {PROOF_SET_COLS} FROM pdp_proof_set WHERE id = :id"),
            named_params! { ":id": id },
            proof_set_row,
        )
        .map(Some)
        .or_else(none_on_empty)
    })
    .await
}

/// Proof set currently owning a proving-period task.
pub async fn proof_set_for_challenge_task(
    db: &Db,
    task_id: TaskId,
) -> DbResult<Option<ProofSetRow>> {
    db.with_conn(move |conn| {
        conn.query_row(
            &format!(
                "SELECT {PROOF_SET_COLS} FROM pdp_proof_set
                 WHERE challenge_request_task_id = :task"
            ),
            named_params! { ":task": task_id },
            proof_set_row,
        )
        .map(Some)
        .or_else(none_on_empty)
    })
    .await
}

/// Sets ready for their very first proving-period schedule.
pub async fn proof_sets_needing_init(db: &Db) -> DbResult<Vec<u64>> {
    db.with_conn(|conn| {
        collect_ids(conn.prepare_cached(
            "SELECT id FROM pdp_proof_set
             WHERE challenge_request_task_id IS NULL
               AND init_ready = 1 AND prove_at_epoch IS NULL",
        )?)
    })
    .await
}

/// Sets whose current challenge window has fully elapsed.
pub async fn proof_sets_needing_next(db: &Db, height: ChainEpoch) -> DbResult<Vec<u64>> {
    db.with_conn(move |conn| {
        let mut stmt = conn.prepare_cached(
            "SELECT id FROM pdp_proof_set
             WHERE challenge_request_task_id IS NULL
               AND prove_at_epoch IS NOT NULL
               AND prove_at_epoch + challenge_window <= :height",
        )?;
        let rows = stmt.query_map(named_params! { ":height": height }, |row| row.get(0))?;
        let mut ids = Vec::new();
        for id in rows {
            ids.push(id?);
        }
        Ok(ids)
    })
    .await
}

/// Sets whose proving-period request confirmed and whose challenge epoch
/// has arrived.
pub async fn proof_sets_needing_prove(
    db: &Db,
    height: ChainEpoch,
    limit: u32,
) -> DbResult<Vec<u64>> {
    db.with_conn(move |conn| {
        let mut stmt = conn.prepare_cached(
            "SELECT ps.id FROM pdp_proof_set ps
             JOIN message_waits_eth mw ON mw.signed_tx_hash = ps.challenge_request_msg_hash
             WHERE ps.challenge_request_msg_hash IS NOT NULL
               AND mw.tx_status = 'confirmed' AND mw.tx_success = 1
               AND ps.prove_at_epoch IS NOT NULL AND ps.prove_at_epoch < :height
             LIMIT :limit",
        )?;
        let rows = stmt.query_map(
            named_params! { ":height": height, ":limit": limit },
            |row| row.get(0),
        )?;
        let mut ids = Vec::new();
        for id in rows {
            ids.push(id?);
        }
        Ok(ids)
    })
    .await
}

/// Adder-side claim of the single proving-period task slot. False when
/// another task already holds it.
pub fn claim_challenge_task(tx: &Transaction, set_id: u64, task_id: TaskId) -> DbResult<bool> {
    let affected = tx.execute(
        "UPDATE pdp_proof_set SET challenge_request_task_id = :task
         WHERE id = :id AND challenge_request_task_id IS NULL",
        named_params! { ":task": task_id, ":id": set_id },
    )?;
    Ok(affected == 1)
}

/// Adder-side claim for a Prove task: consumes the confirmed request
/// hash and records the task under the same transaction.
pub fn claim_prove_task(tx: &Transaction, set_id: u64, task_id: TaskId) -> DbResult<bool> {
    let affected = tx.execute(
        "UPDATE pdp_proof_set SET challenge_request_msg_hash = NULL
         WHERE id = :id AND challenge_request_msg_hash IS NOT NULL",
        named_params! { ":id": set_id },
    )?;
    if affected != 1 {
        return Ok(false);
    }
    tx.execute(
        "INSERT INTO pdp_prove_tasks (proofset_id, task_id) VALUES (:set, :task)",
        named_params! { ":set": set_id, ":task": task_id },
    )?;
    Ok(true)
}

/// Retire a prove task's claim row once its transaction is on the wire.
pub fn finish_prove_task(tx: &Transaction, set_id: u64, task_id: TaskId) -> DbResult<()> {
    tx.execute(
        "DELETE FROM pdp_prove_tasks WHERE proofset_id = :set AND task_id = :task",
        named_params! { ":set": set_id, ":task": task_id },
    )?;
    Ok(())
}

pub async fn prove_task_set(db: &Db, task_id: TaskId) -> DbResult<Option<u64>> {
    db.with_conn(move |conn| {
        conn.query_row(
            "SELECT proofset_id FROM pdp_prove_tasks WHERE task_id = :task",
            named_params! { ":task": task_id },
            |row| row.get(0),
        )
        .map(Some)
        .or_else(none_on_empty)
    })
    .await
}

/// Record a sent proving-period request: stamp the message hash and new
/// schedule, release the task slot, and open the message wait.
pub fn record_challenge_request(
    tx: &Transaction,
    set_id: u64,
    msg_hash: B256,
    prev_epoch: ChainEpoch,
    prove_at: ChainEpoch,
) -> DbResult<()> {
    tx.execute(
        "UPDATE pdp_proof_set
         SET challenge_request_msg_hash = :msg, prev_challenge_request_epoch = :prev,
             prove_at_epoch = :at, challenge_request_task_id = NULL
         WHERE id = :id",
        named_params! {
            ":msg": hash_hex(msg_hash),
            ":prev": prev_epoch,
            ":at": prove_at,
            ":id": set_id,
        },
    )?;
    insert_message_wait(tx, msg_hash)?;
    Ok(())
}

/// Defer a slipped window without sending: reschedule and release the
/// task slot.
pub async fn defer_prove_at(db: &Db, set_id: u64, prove_at: ChainEpoch) -> DbResult<()> {
    db.retry_tx(move |tx| {
        tx.execute(
            "UPDATE pdp_proof_set
             SET prove_at_epoch = :at, challenge_request_task_id = NULL
             WHERE id = :id",
            named_params! { ":at": prove_at, ":id": set_id },
        )?;
        Ok(())
    })
    .await
}

/// Open (or keep) a pending wait for a submitted transaction.
pub fn insert_message_wait(tx: &Transaction, msg_hash: B256) -> DbResult<()> {
    tx.execute(
        "INSERT INTO message_waits_eth (signed_tx_hash, tx_status)
         VALUES (:hash, 'pending')
         ON CONFLICT(signed_tx_hash) DO NOTHING",
        named_params! { ":hash": hash_hex(msg_hash) },
    )?;
    Ok(())
}

pub async fn add_message_wait(db: &Db, msg_hash: B256) -> DbResult<()> {
    db.with_tx(move |tx| insert_message_wait(tx, msg_hash)).await
}

pub async fn get_message_wait(db: &Db, hash: &str) -> DbResult<Option<MessageWaitRow>> {
    let hash = hash.to_string();
    db.with_conn(move |conn| {
        conn.query_row(
            "SELECT signed_tx_hash, waiter_machine_id, tx_status, confirmed_block_number,
                    confirmed_tx_hash, confirmed_tx_data, tx_receipt, tx_success
             FROM message_waits_eth WHERE signed_tx_hash = :hash",
            named_params! { ":hash": hash },
            |row| {
                Ok(MessageWaitRow {
                    signed_tx_hash: row.get(0)?,
                    waiter_machine_id: row.get(1)?,
                    tx_status: row.get(2)?,
                    confirmed_block_number: row.get(3)?,
                    confirmed_tx_hash: row.get(4)?,
                    confirmed_tx_data: row.get(5)?,
                    tx_receipt: row.get(6)?,
                    tx_success: row.get(7)?,
                })
            },
        )
        .map(Some)
        .or_else(none_on_empty)
    })
    .await
}

/// Adopt pending waits abandoned by other watcher instances.
pub async fn release_stale_waiters(db: &Db, ours: &str) -> DbResult<usize> {
    let ours = ours.to_string();
    db.with_conn(move |conn| {
        Ok(conn.execute(
            "UPDATE message_waits_eth SET waiter_machine_id = NULL
             WHERE waiter_machine_id IS NOT NULL AND waiter_machine_id != :ours",
            named_params! { ":ours": ours },
        )?)
    })
    .await
}

/// Claim all unclaimed pending waits for this watcher.
pub async fn claim_pending_waits(db: &Db, machine: &str) -> DbResult<usize> {
    let machine = machine.to_string();
    db.with_conn(move |conn| {
        Ok(conn.execute(
            "UPDATE message_waits_eth SET waiter_machine_id = :machine
             WHERE waiter_machine_id IS NULL AND tx_status = 'pending'",
            named_params! { ":machine": machine },
        )?)
    })
    .await
}

pub async fn pending_claimed(db: &Db, machine: &str, limit: u32) -> DbResult<Vec<String>> {
    let machine = machine.to_string();
    db.with_conn(move |conn| {
        let mut stmt = conn.prepare_cached(
            "SELECT signed_tx_hash FROM message_waits_eth
             WHERE waiter_machine_id = :machine AND tx_status = 'pending'
             LIMIT :limit",
        )?;
        let rows = stmt.query_map(
            named_params! { ":machine": machine, ":limit": limit },
            |row| row.get(0),
        )?;
        let mut hashes = Vec::new();
        for hash in rows {
            hashes.push(hash?);
        }
        Ok(hashes)
    })
    .await
}

pub struct Confirmation {
    pub signed_tx_hash: String,
    pub confirmed_tx_hash: String,
    pub block_number: u64,
    pub success: bool,
    pub receipt_json: Vec<u8>,
    pub tx_json: Vec<u8>,
}

pub async fn confirm_wait(db: &Db, confirmation: Confirmation) -> DbResult<()> {
    db.retry_tx(move |tx| {
        tx.execute(
            "UPDATE message_waits_eth
             SET tx_status = 'confirmed', tx_success = :success,
                 confirmed_block_number = :block, confirmed_tx_hash = :conf_hash,
                 tx_receipt = :receipt, confirmed_tx_data = :tx_data,
                 waiter_machine_id = NULL
             WHERE signed_tx_hash = :hash",
            named_params! {
                ":success": confirmation.success,
                ":block": confirmation.block_number,
                ":conf_hash": confirmation.confirmed_tx_hash,
                ":receipt": confirmation.receipt_json,
                ":tx_data": confirmation.tx_json,
                ":hash": confirmation.signed_tx_hash,
            },
        )?;
        Ok(())
    })
    .await
}

// Root-add intents -----------------------------------------------------

pub async fn insert_root_add(db: &Db, row: RootAddRow) -> DbResult<()> {
    db.with_conn(move |conn| {
        conn.execute(
            "INSERT INTO pdp_proofset_root_adds
               (proofset_id, add_message_hash, add_message_index, add_message_ok,
                root_cid, subroot_cid, subroot_offset, subroot_size, pdp_pieceref)
             VALUES (:set, :hash, :idx, :ok, :root, :subroot, :offset, :size, :piece_ref)",
            named_params! {
                ":set": row.proofset_id,
                ":hash": row.add_message_hash,
                ":idx": row.add_message_index,
                ":ok": row.add_message_ok,
                ":root": row.root_cid,
                ":subroot": row.subroot_cid,
                ":offset": row.subroot_offset,
                ":size": row.subroot_size,
                ":piece_ref": row.pdp_pieceref,
            },
        )?;
        Ok(())
    })
    .await
}

/// Stamp intent rows with the outcome of their confirmed add message.
pub async fn mark_root_adds(db: &Db) -> DbResult<usize> {
    db.with_conn(|conn| {
        Ok(conn.execute(
            "UPDATE pdp_proofset_root_adds AS ra
             SET add_message_ok = mw.tx_success
             FROM message_waits_eth mw
             WHERE mw.signed_tx_hash = ra.add_message_hash
               AND ra.add_message_ok IS NULL
               AND mw.tx_status = 'confirmed'",
            [],
        )?)
    })
    .await
}

/// Distinct (set, message) pairs whose add confirmed successfully.
pub async fn ready_root_add_messages(db: &Db) -> DbResult<Vec<(u64, String)>> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare_cached(
            "SELECT DISTINCT proofset_id, add_message_hash
             FROM pdp_proofset_root_adds WHERE add_message_ok = 1",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut out = Vec::new();
        for pair in rows {
            out.push(pair?);
        }
        Ok(out)
    })
    .await
}

pub async fn root_add_rows(db: &Db, set_id: u64, msg_hash: &str) -> DbResult<Vec<RootAddRow>> {
    let msg_hash = msg_hash.to_string();
    db.with_conn(move |conn| {
        let mut stmt = conn.prepare_cached(
            "SELECT proofset_id, add_message_hash, add_message_index, add_message_ok,
                    root_cid, subroot_cid, subroot_offset, subroot_size, pdp_pieceref
             FROM pdp_proofset_root_adds
             WHERE proofset_id = :set AND add_message_hash = :hash
             ORDER BY add_message_index ASC, subroot_offset ASC",
        )?;
        let rows = stmt.query_map(
            named_params! { ":set": set_id, ":hash": msg_hash },
            |row| {
                Ok(RootAddRow {
                    proofset_id: row.get(0)?,
                    add_message_hash: row.get(1)?,
                    add_message_index: row.get(2)?,
                    add_message_ok: row.get(3)?,
                    root_cid: row.get(4)?,
                    subroot_cid: row.get(5)?,
                    subroot_offset: row.get(6)?,
                    subroot_size: row.get(7)?,
                    pdp_pieceref: row.get(8)?,
                })
            },
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    })
    .await
}

/// Materialize a confirmed add: per-subroot root rows in, intent rows
/// out, atomically. `root_ids` aligns with `add_message_index`.
pub async fn resolve_root_add(
    db: &Db,
    set_id: u64,
    msg_hash: &str,
    rows: Vec<RootAddRow>,
    root_ids: Vec<(u64, u64)>,
) -> DbResult<()> {
    let msg_hash = msg_hash.to_string();
    db.retry_tx(move |tx| {
        for row in &rows {
            let root_id = root_ids
                .iter()
                .find(|(index, _)| *index == row.add_message_index)
                .map(|(_, id)| *id)
                .ok_or_else(|| {
                    piri_db::DbError::Other(anyhow::anyhow!(
                        "no root id for add index {}",
                        row.add_message_index
                    ))
                })?;
            tx.execute(
                "INSERT INTO pdp_proofset_roots
                   (proofset_id, root_id, root_cid, subroot_cid, subroot_offset,
                    subroot_size, pdp_pieceref, add_message_hash, add_message_index)
                 VALUES (:set, :root_id, :root, :subroot, :offset, :size, :piece_ref,
                         :hash, :idx)",
                named_params! {
                    ":set": row.proofset_id,
                    ":root_id": root_id,
                    ":root": row.root_cid,
                    ":subroot": row.subroot_cid,
                    ":offset": row.subroot_offset,
                    ":size": row.subroot_size,
                    ":piece_ref": row.pdp_pieceref,
                    ":hash": row.add_message_hash,
                    ":idx": row.add_message_index,
                },
            )?;
        }
        tx.execute(
            "DELETE FROM pdp_proofset_root_adds
             WHERE proofset_id = :set AND add_message_hash = :hash",
            named_params! { ":set": set_id, ":hash": msg_hash },
        )?;
        Ok(())
    })
    .await
}

pub async fn insert_proofset_root(db: &Db, row: ProofSetRootRow) -> DbResult<()> {
    db.with_conn(move |conn| {
        conn.execute(
            "INSERT INTO pdp_proofset_roots
               (proofset_id, root_id, root_cid, subroot_cid, subroot_offset, subroot_size,
                pdp_pieceref, add_message_hash, add_message_index)
             VALUES (:set, :root_id, :root, :subroot, :offset, :size, :piece_ref, '', 0)",
            named_params! {
                ":set": row.proofset_id,
                ":root_id": row.root_id,
                ":root": row.root_cid,
                ":subroot": row.subroot_cid,
                ":offset": row.subroot_offset,
                ":size": row.subroot_size,
                ":piece_ref": row.pdp_pieceref,
            },
        )?;
        Ok(())
    })
    .await
}

/// Subroots of one piece, lowest offset first.
pub async fn subroots_for_piece(
    db: &Db,
    set_id: u64,
    root_id: u64,
) -> DbResult<Vec<ProofSetRootRow>> {
    db.with_conn(move |conn| {
        let mut stmt = conn.prepare_cached(
            "SELECT proofset_id, root_id, root_cid, subroot_cid, subroot_offset, subroot_size,
                    pdp_pieceref
             FROM pdp_proofset_roots
             WHERE proofset_id = :set AND root_id = :root
             ORDER BY subroot_offset ASC",
        )?;
        let rows = stmt.query_map(
            named_params! { ":set": set_id, ":root": root_id },
            |row| {
                Ok(ProofSetRootRow {
                    proofset_id: row.get(0)?,
                    root_id: row.get(1)?,
                    root_cid: row.get(2)?,
                    subroot_cid: row.get(3)?,
                    subroot_offset: row.get(4)?,
                    subroot_size: row.get(5)?,
                    pdp_pieceref: row.get(6)?,
                })
            },
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    })
    .await
}

pub async fn count_roots(db: &Db, set_id: u64) -> DbResult<i64> {
    db.with_conn(move |conn| {
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM pdp_proofset_roots WHERE proofset_id = :set",
            named_params! { ":set": set_id },
            |row| row.get(0),
        )?)
    })
    .await
}

/// Total challengeable leaves across a proof set, from local subroot
/// sizes.
pub async fn total_leaves(db: &Db, set_id: u64) -> DbResult<u64> {
    db.with_conn(move |conn| {
        let total: u64 = conn.query_row(
            "SELECT COALESCE(SUM(subroot_size), 0) FROM pdp_proofset_roots
             WHERE proofset_id = :set",
            named_params! { ":set": set_id },
            |row| row.get(0),
        )?;
        Ok(total / piri_lib::LEAF_SIZE)
    })
    .await
}

/// Drop the local state of scheduled removals: the piece refs and the
/// root rows. Ids already absent are skipped, which keeps a replayed
/// cleanup idempotent.
pub async fn cleanup_deleted_roots(db: &Db, set_id: u64, removals: Vec<u64>) -> DbResult<usize> {
    db.retry_tx(move |tx| {
        let mut removed = 0;
        for root_id in &removals {
            tx.execute(
                "DELETE FROM parked_piece_refs WHERE ref_id IN (
                   SELECT pdp_pieceref FROM pdp_proofset_roots
                   WHERE proofset_id = :set AND root_id = :root)",
                named_params! { ":set": set_id, ":root": root_id },
            )?;
            removed += tx.execute(
                "DELETE FROM pdp_proofset_roots
                 WHERE proofset_id = :set AND root_id = :root",
                named_params! { ":set": set_id, ":root": root_id },
            )?;
        }
        Ok(removed)
    })
    .await
}

// Delete intents -------------------------------------------------------

pub async fn insert_delete_intent(db: &Db, set_id: u64, msg_hash: &str) -> DbResult<()> {
    let msg_hash = msg_hash.to_string();
    db.with_conn(move |conn| {
        conn.execute(
            "INSERT INTO pdp_proofset_deletes (proofset_id, delete_message_hash)
             VALUES (:set, :hash)",
            named_params! { ":set": set_id, ":hash": msg_hash },
        )?;
        Ok(())
    })
    .await
}

/// Unprocessed delete intents whose message confirmed successfully.
pub async fn pending_deletes(db: &Db) -> DbResult<Vec<(u64, String)>> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare_cached(
            "SELECT d.proofset_id, d.delete_message_hash
             FROM pdp_proofset_deletes d
             JOIN message_waits_eth mw ON mw.signed_tx_hash = d.delete_message_hash
             WHERE d.processed = 0 AND mw.tx_status = 'confirmed' AND mw.tx_success = 1",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut out = Vec::new();
        for pair in rows {
            out.push(pair?);
        }
        Ok(out)
    })
    .await
}

/// Remove a deleted proof set and everything hanging off it.
pub async fn finish_delete(db: &Db, set_id: u64) -> DbResult<()> {
    db.retry_tx(move |tx| {
        tx.execute(
            "DELETE FROM parked_piece_refs WHERE ref_id IN (
               SELECT pdp_pieceref FROM pdp_proofset_roots WHERE proofset_id = :set)",
            named_params! { ":set": set_id },
        )?;
        tx.execute(
            "DELETE FROM pdp_proofset_roots WHERE proofset_id = :set",
            named_params! { ":set": set_id },
        )?;
        tx.execute(
            "DELETE FROM pdp_proof_set WHERE id = :set",
            named_params! { ":set": set_id },
        )?;
        tx.execute(
            "UPDATE pdp_proofset_deletes SET processed = 1 WHERE proofset_id = :set",
            named_params! { ":set": set_id },
        )?;
        Ok(())
    })
    .await
}

// Provider registrations ----------------------------------------------

pub async fn insert_registration_intent(db: &Db, msg_hash: &str) -> DbResult<()> {
    let msg_hash = msg_hash.to_string();
    db.with_conn(move |conn| {
        conn.execute(
            "INSERT INTO pdp_provider_registrations (registration_message_hash)
             VALUES (:hash)",
            named_params! { ":hash": msg_hash },
        )?;
        Ok(())
    })
    .await
}

pub async fn pending_registrations(db: &Db) -> DbResult<Vec<String>> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare_cached(
            "SELECT r.registration_message_hash
             FROM pdp_provider_registrations r
             JOIN message_waits_eth mw ON mw.signed_tx_hash = r.registration_message_hash
             WHERE r.processed = 0 AND mw.tx_status = 'confirmed' AND mw.tx_success = 1",
        )?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        let mut out = Vec::new();
        for hash in rows {
            out.push(hash?);
        }
        Ok(out)
    })
    .await
}

pub async fn finish_registration(db: &Db, msg_hash: &str, provider_id: u64) -> DbResult<()> {
    let msg_hash = msg_hash.to_string();
    db.with_conn(move |conn| {
        conn.execute(
            "UPDATE pdp_provider_registrations SET provider_id = :provider, processed = 1
             WHERE registration_message_hash = :hash",
            named_params! { ":provider": provider_id, ":hash": msg_hash },
        )?;
        Ok(())
    })
    .await
}

pub async fn get_registration(db: &Db, msg_hash: &str) -> DbResult<Option<(Option<u64>, bool)>> {
    let msg_hash = msg_hash.to_string();
    db.with_conn(move |conn| {
        conn.query_row(
            "SELECT provider_id, processed FROM pdp_provider_registrations
             WHERE registration_message_hash = :hash",
            named_params! { ":hash": msg_hash },
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .map(Some)
        .or_else(none_on_empty)
    })
    .await
}

// Parked pieces (test/off-band seeding) --------------------------------

pub async fn insert_parked_piece(
    db: &Db,
    piece_cid: &str,
    padded_size: u64,
    raw_size: u64,
) -> DbResult<i64> {
    let piece_cid = piece_cid.to_string();
    db.with_conn(move |conn| {
        conn.execute(
            "INSERT INTO parked_pieces (piece_cid, piece_padded_size, piece_raw_size, complete)
             VALUES (:cid, :padded, :raw, 1)",
            named_params! { ":cid": piece_cid, ":padded": padded_size, ":raw": raw_size },
        )?;
        Ok(conn.last_insert_rowid())
    })
    .await
}

pub async fn insert_piece_ref(db: &Db, piece_id: i64, data_url: Option<&str>) -> DbResult<i64> {
    let data_url = data_url.map(str::to_string);
    db.with_conn(move |conn| {
        conn.execute(
            "INSERT INTO parked_piece_refs (piece_id, data_url) VALUES (:piece, :url)",
            named_params! { ":piece": piece_id, ":url": data_url },
        )?;
        Ok(conn.last_insert_rowid())
    })
    .await
}

pub async fn count_piece_refs(db: &Db) -> DbResult<i64> {
    db.with_conn(|conn| {
        Ok(conn.query_row("SELECT COUNT(*) FROM parked_piece_refs", [], |row| {
            row.get(0)
        })?)
    })
    .await
}

fn none_on_empty<T>(err: rusqlite::Error) -> Result<Option<T>, piri_db::DbError> {
    match err {
        rusqlite::Error::QueryReturnedNoRows => Ok(None),
        other => Err(other.into()),
    }
}

fn collect_ids(mut stmt: rusqlite::CachedStatement<'_>) -> DbResult<Vec<u64>> {
    let rows = stmt.query_map([], |row| row.get(0))?;
    let mut ids = Vec::new();
    for id in rows {
        ids.push(id?);
    }
    Ok(ids)
}
