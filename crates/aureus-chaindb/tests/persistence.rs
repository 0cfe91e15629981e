//! End-to-end persistence tests: reopen durability, crash recovery of the
//! coin commit protocol and block-tree reconstruction.

use aureus_chaindb::{
    BlockIndexNode, BlockIndexRecord, BlockStatus, BlockTreeDb, CoinCacheEntry, CoinsDb,
    CoinsDbOptions, CoinsDiff, Error, Interrupt, NodeHandle, StakeFlags,
};
use aureus_primitives::{Coin, COIN};
use bitcoin::hashes::Hash;
use bitcoin::{BlockHash, OutPoint, ScriptBuf, Txid};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn coin(height: u32, amount: u64) -> Coin {
    Coin {
        amount,
        script_pubkey: ScriptBuf::new_p2pkh(&bitcoin::PubkeyHash::from_slice(&[0x42; 20]).unwrap()),
        height,
        is_coinbase: height == 0,
        is_coinstake: false,
    }
}

fn outpoint(byte: u8, vout: u32) -> OutPoint {
    OutPoint {
        txid: Txid::from_byte_array([byte; 32]),
        vout,
    }
}

fn sample_diff(entries: u8) -> CoinsDiff {
    let mut diff = CoinsDiff::new();
    for i in 0..entries {
        diff.insert(
            outpoint(i + 1, u32::from(i)),
            CoinCacheEntry::updated(coin(u32::from(i) + 1, u64::from(i + 1) * COIN)),
        );
    }
    diff
}

#[test]
fn test_committed_coins_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let tip = BlockHash::from_byte_array([0xA1; 32]);

    let db = CoinsDb::open(dir.path(), CoinsDbOptions::default()).unwrap();
    db.commit(sample_diff(5), tip).unwrap();
    drop(db);

    let db = CoinsDb::open(dir.path(), CoinsDbOptions::default()).unwrap();
    assert_eq!(db.best_block().unwrap(), Some(tip));
    assert_eq!(db.head_blocks().unwrap(), None);
    for i in 0..5u8 {
        let c = db.coin(&outpoint(i + 1, u32::from(i))).unwrap().unwrap();
        assert_eq!(c.amount, u64::from(i + 1) * COIN);
    }
    assert!(db.estimate_size().unwrap() > 0);
}

#[test]
fn test_interrupted_commit_leaves_marker_and_converges_on_retry() {
    let dir = tempfile::tempdir().unwrap();
    let control_dir = tempfile::tempdir().unwrap();
    let tip = BlockHash::from_byte_array([0xB2; 32]);
    let diff = sample_diff(8);

    // Zero threshold: every dirty entry forces a flush, and the hook kills
    // the commit right after the first one.
    let crashing = CoinsDbOptions {
        batch_size: 0,
        crash_hook: Some(Arc::new(|| true)),
    };
    let db = CoinsDb::open(dir.path(), crashing).unwrap();
    assert!(matches!(
        db.commit(diff.clone(), tip),
        Err(Error::CrashSimulated)
    ));
    drop(db);

    // After the "crash" the best block is gone and the transition marker
    // names the target tip and the empty-store sentinel.
    let db = CoinsDb::open(dir.path(), CoinsDbOptions::default()).unwrap();
    assert_eq!(db.best_block().unwrap(), None);
    assert_eq!(
        db.head_blocks().unwrap(),
        Some((tip, BlockHash::all_zeros()))
    );

    // Replaying the same diff completes the transition.
    db.commit(diff.clone(), tip).unwrap();
    assert_eq!(db.best_block().unwrap(), Some(tip));
    assert_eq!(db.head_blocks().unwrap(), None);

    // The recovered store matches one that never crashed.
    let control = CoinsDb::open(control_dir.path(), CoinsDbOptions::default()).unwrap();
    control.commit(diff, tip).unwrap();
    let mut recovered: Vec<_> = db.cursor().map(Result::unwrap).collect();
    let mut expected: Vec<_> = control.cursor().map(Result::unwrap).collect();
    recovered.sort_by_key(|(op, _)| *op);
    expected.sort_by_key(|(op, _)| *op);
    assert_eq!(recovered, expected);
}

#[test]
fn test_commit_to_wrong_tip_after_interruption_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let tip = BlockHash::from_byte_array([0xC3; 32]);

    let crashing = CoinsDbOptions {
        batch_size: 0,
        crash_hook: Some(Arc::new(|| true)),
    };
    let db = CoinsDb::open(dir.path(), crashing).unwrap();
    assert!(db.commit(sample_diff(4), tip).is_err());
    drop(db);

    let db = CoinsDb::open(dir.path(), CoinsDbOptions::default()).unwrap();
    let other_tip = BlockHash::from_byte_array([0xC4; 32]);
    assert!(matches!(
        db.commit(sample_diff(4), other_tip),
        Err(Error::Corruption(_))
    ));
}

#[test]
fn test_batch_threshold_splits_commit_into_multiple_writes() {
    let dir = tempfile::tempdir().unwrap();
    let flushes = Arc::new(AtomicUsize::new(0));
    let counter = flushes.clone();
    let options = CoinsDbOptions {
        batch_size: 0,
        crash_hook: Some(Arc::new(move || {
            counter.fetch_add(1, Ordering::Relaxed);
            false
        })),
    };

    let db = CoinsDb::open(dir.path(), options).unwrap();
    let tip = BlockHash::from_byte_array([0xD5; 32]);
    db.commit(sample_diff(6), tip).unwrap();

    // One intermediate flush per dirty entry, plus the untracked final batch.
    assert_eq!(flushes.load(Ordering::Relaxed), 6);
    assert_eq!(db.best_block().unwrap(), Some(tip));
    assert_eq!(db.cursor().count(), 6);
}

#[test]
fn test_cursor_returns_coins_in_key_order() {
    let dir = tempfile::tempdir().unwrap();
    let db = CoinsDb::open(dir.path(), CoinsDbOptions::default()).unwrap();

    let mut diff = CoinsDiff::new();
    let mut outpoints = Vec::new();
    for _ in 0..50 {
        let mut txid = [0u8; 32];
        for byte in &mut txid {
            *byte = fastrand::u8(..);
        }
        let op = OutPoint {
            txid: Txid::from_byte_array(txid),
            vout: fastrand::u32(..1000),
        };
        outpoints.push(op);
        diff.insert(op, CoinCacheEntry::updated(coin(9, COIN)));
    }
    db.commit(diff, BlockHash::from_byte_array([0xE6; 32]))
        .unwrap();

    let scanned: Vec<_> = db.cursor().map(|item| item.unwrap().0).collect();

    outpoints.sort_by_key(|op| aureus_chaindb::keys::DbKey::Coin(*op).encode());
    outpoints.dedup();
    assert_eq!(scanned, outpoints);
}

fn block_record(hash: BlockHash, prev_hash: BlockHash, height: u32, bits: u32) -> BlockIndexRecord {
    BlockIndexRecord {
        hash,
        prev_hash,
        height,
        file: 0,
        data_pos: 8 + height * 1000,
        undo_pos: 0,
        version: 4,
        merkle_root: bitcoin::TxMerkleNode::all_zeros(),
        time: 1_500_000_000 + height * 60,
        bits,
        nonce: height,
        status: (BlockStatus::VALID_CHAIN | BlockStatus::HAVE_DATA).bits(),
        tx_count: 1 + height,
        shielded_root: [0; 32],
        accumulator_checkpoint: [0; 32],
        stake_modifier: vec![height as u8],
        stake_flags: StakeFlags::empty().bits(),
    }
}

#[test]
fn test_block_tree_reconstruction_links_predecessors() {
    let dir = tempfile::tempdir().unwrap();
    let db = BlockTreeDb::open(dir.path()).unwrap();

    let genesis_hash = BlockHash::from_byte_array([0x01; 32]);
    let child_hash = BlockHash::from_byte_array([0x02; 32]);
    let genesis = block_record(genesis_hash, BlockHash::all_zeros(), 0, 0x207fffff);
    let child = block_record(child_hash, genesis_hash, 1, 0x207fffff);
    db.write_batch_sync(&[], 0, &[genesis.clone(), child.clone()])
        .unwrap();
    drop(db);

    let db = BlockTreeDb::open(dir.path()).unwrap();
    let mut nodes: HashMap<BlockHash, NodeHandle> = HashMap::new();
    db.load_block_index_guts(&Interrupt::new(), |_| true, |hash| {
        nodes
            .entry(hash)
            .or_insert_with(|| Arc::new(RwLock::new(BlockIndexNode::new(hash))))
            .clone()
    })
    .unwrap();

    assert_eq!(nodes.len(), 2);
    let genesis_node = nodes[&genesis_hash].clone();
    let child_node = nodes[&child_hash].clone();

    let g = genesis_node.read();
    assert!(g.prev.is_none());
    assert_eq!(g.height, 0);
    assert_eq!(g.status, BlockStatus::VALID_CHAIN | BlockStatus::HAVE_DATA);

    let c = child_node.read();
    let prev = c.prev.clone().unwrap();
    assert!(Arc::ptr_eq(&prev, &genesis_node));
    assert_eq!(c.height, 1);
    assert_eq!(c.data_pos, child.data_pos);
    assert_eq!(c.tx_count, 2);
    assert_eq!(c.stake_modifier, vec![1]);
}

#[test]
fn test_load_verifies_proof_of_work_before_stake_activation() {
    let dir = tempfile::tempdir().unwrap();
    let db = BlockTreeDb::open(dir.path()).unwrap();

    // Compact 0x03000001 is a target of one; no hash can meet it.
    let hash = BlockHash::from_byte_array([0x7A; 32]);
    let record = block_record(hash, BlockHash::all_zeros(), 0, 0x03000001);
    db.write_block_index(&record).unwrap();

    let mut nodes: HashMap<BlockHash, NodeHandle> = HashMap::new();
    let result = db.load_block_index_guts(&Interrupt::new(), |_| false, |hash| {
        nodes
            .entry(hash)
            .or_insert_with(|| Arc::new(RwLock::new(BlockIndexNode::new(hash))))
            .clone()
    });
    assert!(matches!(result, Err(Error::Corruption(_))));

    // The same record loads fine once the height is past stake activation.
    let mut nodes: HashMap<BlockHash, NodeHandle> = HashMap::new();
    db.load_block_index_guts(&Interrupt::new(), |_| true, |hash| {
        nodes
            .entry(hash)
            .or_insert_with(|| Arc::new(RwLock::new(BlockIndexNode::new(hash))))
            .clone()
    })
    .unwrap();
    assert_eq!(nodes.len(), 1);
}

#[test]
fn test_block_tree_metadata_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();

    let db = BlockTreeDb::open(dir.path()).unwrap();
    db.write_flag("txindex", true).unwrap();
    db.write_int("dbversion", 3).unwrap();
    db.write_reindexing(true).unwrap();
    drop(db);

    let db = BlockTreeDb::open(dir.path()).unwrap();
    assert_eq!(db.read_flag("txindex").unwrap(), Some(true));
    assert_eq!(db.read_int("dbversion").unwrap(), Some(3));
    assert!(db.read_reindexing().unwrap());
}
