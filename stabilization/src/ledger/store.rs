use lmdb::{Cursor, Database, DatabaseFlags, Environment, EnvironmentFlags, Transaction, WriteFlags};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

use super::{BlockUndo, Coin, CoinChange, LedgerError, MintStats, StabilizationRecord};
use crate::currency::{CurrencyCode, CurrencyStabilityInfo};
use crate::transaction::{TxHash, UtxoId};

/// LMDB-backed stabilization state.
///
/// Everything a block changes is written in one read-write transaction, so
/// the store is always at a block boundary.
pub struct StabilizationStore {
    env: Environment,
    /// stability: currency -> CurrencyStabilityInfo
    stability_db: Database,
    /// records: tx_id (32 bytes) -> StabilizationRecord
    records_db: Database,
    /// by_currency: len || currency || height (8 bytes BE) || tx_id -> empty
    /// Ordered so a range scan returns one currency's records by height
    by_currency_db: Database,
    /// coins: UtxoId (36 bytes) -> Coin
    coins_db: Database,
    /// undo: height (8 bytes BE) -> BlockUndo
    undo_db: Database,
    /// metadata: key -> value
    meta_db: Database,
}

// Metadata keys
const META_TIP_HEIGHT: &[u8; 10] = b"tip_height";
const META_MINT_STATS: &[u8; 10] = b"mint_stats";
const META_TIP_HASH: &[u8; 8] = b"tip_hash";

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, LedgerError> {
    Ok(bincode::serialize(value)?)
}

fn read<T: DeserializeOwned, Txn: Transaction, K: AsRef<[u8]>>(
    txn: &Txn,
    db: Database,
    key: &K,
) -> Result<Option<T>, LedgerError> {
    match txn.get(db, key) {
        Ok(bytes) => Ok(Some(bincode::deserialize(bytes)?)),
        Err(lmdb::Error::NotFound) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn delete<K: AsRef<[u8]>>(
    txn: &mut lmdb::RwTransaction<'_>,
    db: Database,
    key: &K,
) -> Result<(), LedgerError> {
    match txn.del(db, key, None) {
        Ok(()) | Err(lmdb::Error::NotFound) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn currency_prefix(currency: &CurrencyCode) -> Vec<u8> {
    currency.to_hash_bytes()
}

fn index_key(currency: &CurrencyCode, height: u64, tx_id: &TxHash) -> Vec<u8> {
    let mut key = currency_prefix(currency);
    key.extend_from_slice(&height.to_be_bytes());
    key.extend_from_slice(tx_id);
    key
}

impl StabilizationStore {
    /// Open or create the store under `path`.
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        fs::create_dir_all(path)?;

        let env = Environment::new()
            .set_flags(EnvironmentFlags::NO_SUB_DIR)
            .set_max_dbs(6)
            .set_map_size(1024 * 1024 * 1024) // 1GB
            .open(&path.join("stabilization.mdb"))?;

        let stability_db = env.create_db(Some("stability"), DatabaseFlags::empty())?;
        let records_db = env.create_db(Some("records"), DatabaseFlags::empty())?;
        let by_currency_db = env.create_db(Some("by_currency"), DatabaseFlags::empty())?;
        let coins_db = env.create_db(Some("coins"), DatabaseFlags::empty())?;
        let undo_db = env.create_db(Some("undo"), DatabaseFlags::empty())?;
        let meta_db = env.create_db(Some("meta"), DatabaseFlags::empty())?;

        info!(path = %path.display(), "Opened stabilization store");

        Ok(Self {
            env,
            stability_db,
            records_db,
            by_currency_db,
            coins_db,
            undo_db,
            meta_db,
        })
    }

    /// Persist a connected block.
    pub fn commit_block(
        &self,
        block_hash: &[u8; 32],
        undo: &BlockUndo,
        stability: &BTreeMap<CurrencyCode, CurrencyStabilityInfo>,
        records: &[StabilizationRecord],
        coin_changes: &[CoinChange],
        stats: &MintStats,
    ) -> Result<(), LedgerError> {
        let mut txn = self.env.begin_rw_txn()?;

        self.write_stability(&mut txn, stability)?;

        for record in records {
            txn.put(self.records_db, &record.tx_id, &encode(record)?, WriteFlags::empty())?;
            let key = index_key(&record.unstable_currency, record.block_height, &record.tx_id);
            txn.put(self.by_currency_db, &key, b"", WriteFlags::empty())?;
        }

        self.write_coins(&mut txn, coin_changes)?;

        txn.put(
            self.undo_db,
            &undo.height.to_be_bytes(),
            &encode(undo)?,
            WriteFlags::empty(),
        )?;
        txn.put(self.meta_db, META_MINT_STATS, &encode(stats)?, WriteFlags::empty())?;
        txn.put(
            self.meta_db,
            META_TIP_HEIGHT,
            &undo.height.to_le_bytes(),
            WriteFlags::empty(),
        )?;
        txn.put(self.meta_db, META_TIP_HASH, block_hash, WriteFlags::empty())?;

        txn.commit()?;

        debug!(
            height = undo.height,
            block = hex::encode(&block_hash[0..8]),
            records = records.len(),
            coin_changes = coin_changes.len(),
            "Committed stabilization state"
        );
        Ok(())
    }

    /// Persist a disconnected block. `stability`, `coin_changes` and `stats`
    /// describe the state after the undo was applied in memory;
    /// `parent_hash` becomes the new tip.
    pub fn revert_block(
        &self,
        undo: &BlockUndo,
        parent_hash: &[u8; 32],
        stability: &BTreeMap<CurrencyCode, CurrencyStabilityInfo>,
        coin_changes: &[CoinChange],
        stats: &MintStats,
    ) -> Result<(), LedgerError> {
        let mut txn = self.env.begin_rw_txn()?;

        for tx_id in &undo.records {
            let record: Option<StabilizationRecord> = read(&txn, self.records_db, tx_id)?;
            if let Some(record) = record {
                let key = index_key(&record.unstable_currency, record.block_height, tx_id);
                delete(&mut txn, self.by_currency_db, &key)?;
            }
            delete(&mut txn, self.records_db, tx_id)?;
        }

        self.write_stability(&mut txn, stability)?;
        self.write_coins(&mut txn, coin_changes)?;

        delete(&mut txn, self.undo_db, &undo.height.to_be_bytes())?;
        txn.put(self.meta_db, META_MINT_STATS, &encode(stats)?, WriteFlags::empty())?;
        if undo.height == 0 {
            delete(&mut txn, self.meta_db, META_TIP_HEIGHT)?;
            delete(&mut txn, self.meta_db, META_TIP_HASH)?;
        } else {
            txn.put(
                self.meta_db,
                META_TIP_HEIGHT,
                &(undo.height - 1).to_le_bytes(),
                WriteFlags::empty(),
            )?;
            txn.put(self.meta_db, META_TIP_HASH, parent_hash, WriteFlags::empty())?;
        }

        txn.commit()?;
        debug!(height = undo.height, "Reverted stabilization state");
        Ok(())
    }

    fn write_stability(
        &self,
        txn: &mut lmdb::RwTransaction<'_>,
        stability: &BTreeMap<CurrencyCode, CurrencyStabilityInfo>,
    ) -> Result<(), LedgerError> {
        txn.clear_db(self.stability_db)?;
        for (currency, info) in stability {
            txn.put(
                self.stability_db,
                &currency.as_str(),
                &encode(info)?,
                WriteFlags::empty(),
            )?;
        }
        Ok(())
    }

    fn write_coins(
        &self,
        txn: &mut lmdb::RwTransaction<'_>,
        changes: &[CoinChange],
    ) -> Result<(), LedgerError> {
        for change in changes {
            match change {
                CoinChange::Added(id, coin) => {
                    txn.put(self.coins_db, &id.to_bytes(), &encode(coin)?, WriteFlags::empty())?;
                }
                CoinChange::Removed(id) => delete(txn, self.coins_db, &id.to_bytes())?,
            }
        }
        Ok(())
    }

    /// Height of the last committed block.
    pub fn tip_height(&self) -> Result<Option<u64>, LedgerError> {
        let txn = self.env.begin_ro_txn()?;
        match txn.get(self.meta_db, META_TIP_HEIGHT) {
            Ok(bytes) => {
                let bytes: [u8; 8] = bytes
                    .try_into()
                    .map_err(|_| LedgerError::Serialization("bad tip height".to_string()))?;
                Ok(Some(u64::from_le_bytes(bytes)))
            }
            Err(lmdb::Error::NotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Hash of the last committed block.
    pub fn tip_hash(&self) -> Result<Option<[u8; 32]>, LedgerError> {
        let txn = self.env.begin_ro_txn()?;
        match txn.get(self.meta_db, META_TIP_HASH) {
            Ok(bytes) => {
                let hash: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| LedgerError::Serialization("bad tip hash".to_string()))?;
                Ok(Some(hash))
            }
            Err(lmdb::Error::NotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn mint_stats(&self) -> Result<MintStats, LedgerError> {
        let txn = self.env.begin_ro_txn()?;
        Ok(read(&txn, self.meta_db, META_MINT_STATS)?.unwrap_or_default())
    }

    pub fn stability_map(
        &self,
    ) -> Result<BTreeMap<CurrencyCode, CurrencyStabilityInfo>, LedgerError> {
        let txn = self.env.begin_ro_txn()?;
        let mut cursor = txn.open_ro_cursor(self.stability_db)?;

        let mut map = BTreeMap::new();
        for result in cursor.iter_start() {
            let (_, value) = result?;
            let info: CurrencyStabilityInfo = bincode::deserialize(value)?;
            map.insert(info.currency.clone(), info);
        }
        Ok(map)
    }

    pub fn record(&self, tx_id: &TxHash) -> Result<Option<StabilizationRecord>, LedgerError> {
        let txn = self.env.begin_ro_txn()?;
        read(&txn, self.records_db, tx_id)
    }

    /// Every stored record, ordered by tx id.
    pub fn records(&self) -> Result<Vec<StabilizationRecord>, LedgerError> {
        let txn = self.env.begin_ro_txn()?;
        let mut cursor = txn.open_ro_cursor(self.records_db)?;

        let mut records = Vec::new();
        for result in cursor.iter_start() {
            let (_, value) = result?;
            records.push(bincode::deserialize(value)?);
        }
        Ok(records)
    }

    /// Records for `currency` with `start <= height <= end`, oldest first.
    pub fn history(
        &self,
        currency: &CurrencyCode,
        start: u64,
        end: u64,
    ) -> Result<Vec<StabilizationRecord>, LedgerError> {
        if start > end {
            return Ok(Vec::new());
        }

        let prefix = currency_prefix(currency);
        let mut from = prefix.clone();
        from.extend_from_slice(&start.to_be_bytes());

        let txn = self.env.begin_ro_txn()?;
        let mut tx_ids = Vec::new();
        {
            let mut cursor = txn.open_ro_cursor(self.by_currency_db)?;
            for result in cursor.iter_from(&from) {
                let (key, _) = result?;
                if !key.starts_with(&prefix) || key.len() != prefix.len() + 8 + 32 {
                    break;
                }
                let mut height = [0u8; 8];
                height.copy_from_slice(&key[prefix.len()..prefix.len() + 8]);
                if u64::from_be_bytes(height) > end {
                    break;
                }
                let mut tx_id = [0u8; 32];
                tx_id.copy_from_slice(&key[prefix.len() + 8..]);
                tx_ids.push(tx_id);
            }
        }

        let mut records = Vec::with_capacity(tx_ids.len());
        for tx_id in &tx_ids {
            if let Some(record) = read(&txn, self.records_db, tx_id)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    pub fn coin(&self, id: &UtxoId) -> Result<Option<Coin>, LedgerError> {
        let txn = self.env.begin_ro_txn()?;
        read(&txn, self.coins_db, &id.to_bytes())
    }

    /// Every stored coin.
    pub fn coins(&self) -> Result<Vec<(UtxoId, Coin)>, LedgerError> {
        let txn = self.env.begin_ro_txn()?;
        let mut cursor = txn.open_ro_cursor(self.coins_db)?;

        let mut coins = Vec::new();
        for result in cursor.iter_start() {
            let (key, value) = result?;
            let id = UtxoId::from_bytes(key)
                .ok_or_else(|| LedgerError::Serialization("bad coin key".to_string()))?;
            coins.push((id, bincode::deserialize(value)?));
        }
        Ok(coins)
    }

    pub fn undo(&self, height: u64) -> Result<BlockUndo, LedgerError> {
        let txn = self.env.begin_ro_txn()?;
        read(&txn, self.undo_db, &height.to_be_bytes())?.ok_or(LedgerError::UndoNotFound(height))
    }

    /// Drop audit records and undo data below `cutoff`. Totals are kept.
    ///
    /// Blocks below `cutoff` can no longer be disconnected afterwards.
    pub fn prune(&self, cutoff: u64) -> Result<usize, LedgerError> {
        let mut txn = self.env.begin_rw_txn()?;

        let mut stale_records = Vec::new();
        {
            let mut cursor = txn.open_ro_cursor(self.records_db)?;
            for result in cursor.iter_start() {
                let (_, value) = result?;
                let record: StabilizationRecord = bincode::deserialize(value)?;
                if record.block_height < cutoff {
                    stale_records.push(record);
                }
            }
        }

        let mut stale_undo = Vec::new();
        {
            let mut cursor = txn.open_ro_cursor(self.undo_db)?;
            for result in cursor.iter_start() {
                let (key, _) = result?;
                if key.len() == 8 && key < &cutoff.to_be_bytes()[..] {
                    stale_undo.push(key.to_vec());
                } else {
                    break;
                }
            }
        }

        for record in &stale_records {
            let key = index_key(&record.unstable_currency, record.block_height, &record.tx_id);
            delete(&mut txn, self.by_currency_db, &key)?;
            delete(&mut txn, self.records_db, &record.tx_id)?;
        }
        for key in &stale_undo {
            delete(&mut txn, self.undo_db, key)?;
        }

        txn.commit()?;

        info!(
            cutoff,
            records = stale_records.len(),
            undo = stale_undo.len(),
            "Pruned stabilization history"
        );
        Ok(stale_records.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::currency::StabilityStatus;
    use crate::identity::IdentityKey;
    use crate::transaction::TxOutput;
    use tempfile::tempdir;

    fn usd() -> CurrencyCode {
        "OUSD".parse().unwrap()
    }

    fn record(height: u64, tag: u8) -> StabilizationRecord {
        StabilizationRecord {
            tx_id: [tag; 32],
            unstable_currency: usd(),
            coins_created: 1_000,
            recipients: vec![IdentityKey([tag; 32])],
            block_height: height,
            timestamp: height * 600,
            deviation_ratio_ppm: 150_000,
        }
    }

    fn coin(height: u64) -> Coin {
        Coin {
            output: TxOutput {
                amount: 1_000,
                currency: usd(),
                recipient: IdentityKey([1; 32]),
            },
            height,
            issuance: true,
        }
    }

    fn stability_at(height: u64) -> BTreeMap<CurrencyCode, CurrencyStabilityInfo> {
        let mut info = CurrencyStabilityInfo::new(usd(), 1);
        info.status = StabilityStatus::Unstable { since: 2 };
        info.last_check_height = height;
        BTreeMap::from([(usd(), info)])
    }

    fn commit(store: &StabilizationStore, height: u64, tag: u8) -> BlockUndo {
        let id = UtxoId::new([tag; 32], 0);
        let undo = BlockUndo {
            height,
            prior_stability: BTreeMap::new(),
            created_coins: vec![id],
            records: vec![[tag; 32]],
        };
        store
            .commit_block(
                &[height as u8; 32],
                &undo,
                &stability_at(height),
                &[record(height, tag)],
                &[CoinChange::Added(id, coin(height))],
                &MintStats::default(),
            )
            .unwrap();
        undo
    }

    #[test]
    fn test_empty_store() {
        let dir = tempdir().unwrap();
        let store = StabilizationStore::open(dir.path()).unwrap();

        assert_eq!(store.tip_height().unwrap(), None);
        assert_eq!(store.tip_hash().unwrap(), None);
        assert!(store.stability_map().unwrap().is_empty());
        assert!(store.records().unwrap().is_empty());
        assert_eq!(store.mint_stats().unwrap(), MintStats::default());
        assert!(matches!(store.undo(1), Err(LedgerError::UndoNotFound(1))));
    }

    #[test]
    fn test_commit_and_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = StabilizationStore::open(dir.path()).unwrap();
            commit(&store, 10, 1);
            commit(&store, 11, 2);
        }

        let store = StabilizationStore::open(dir.path()).unwrap();
        assert_eq!(store.tip_height().unwrap(), Some(11));
        assert_eq!(store.tip_hash().unwrap(), Some([11; 32]));
        assert_eq!(store.stability_map().unwrap()[&usd()].last_check_height, 11);
        assert_eq!(store.records().unwrap().len(), 2);
        assert_eq!(store.coins().unwrap().len(), 2);
        assert_eq!(store.record(&[1; 32]).unwrap(), Some(record(10, 1)));
        assert_eq!(store.undo(11).unwrap().records, vec![[2u8; 32]]);
    }

    #[test]
    fn test_history_range() {
        let dir = tempdir().unwrap();
        let store = StabilizationStore::open(dir.path()).unwrap();
        for (i, height) in [5u64, 300, 70_000].iter().enumerate() {
            commit(&store, *height, i as u8 + 1);
        }

        let heights = |start, end| -> Vec<u64> {
            store
                .history(&usd(), start, end)
                .unwrap()
                .iter()
                .map(|r| r.block_height)
                .collect()
        };
        assert_eq!(heights(0, u64::MAX), vec![5, 300, 70_000]);
        assert_eq!(heights(6, 70_000), vec![300, 70_000]);
        assert_eq!(heights(6, 299), Vec::<u64>::new());
        assert!(store.history(&"OEUR".parse().unwrap(), 0, u64::MAX).unwrap().is_empty());
    }

    #[test]
    fn test_revert_block() {
        let dir = tempdir().unwrap();
        let store = StabilizationStore::open(dir.path()).unwrap();
        commit(&store, 10, 1);
        let undo = commit(&store, 11, 2);

        store
            .revert_block(
                &undo,
                &[10; 32],
                &stability_at(10),
                &[CoinChange::Removed(UtxoId::new([2; 32], 0))],
                &MintStats::default(),
            )
            .unwrap();

        assert_eq!(store.tip_height().unwrap(), Some(10));
        assert_eq!(store.tip_hash().unwrap(), Some([10; 32]));
        assert_eq!(store.record(&[2; 32]).unwrap(), None);
        assert_eq!(store.coin(&UtxoId::new([2; 32], 0)).unwrap(), None);
        assert!(store.coin(&UtxoId::new([1; 32], 0)).unwrap().is_some());
        assert_eq!(store.history(&usd(), 0, 100).unwrap().len(), 1);
        assert!(matches!(store.undo(11), Err(LedgerError::UndoNotFound(11))));
    }

    #[test]
    fn test_prune() {
        let dir = tempdir().unwrap();
        let store = StabilizationStore::open(dir.path()).unwrap();
        commit(&store, 10, 1);
        commit(&store, 20, 2);
        commit(&store, 30, 3);

        assert_eq!(store.prune(25).unwrap(), 2);
        assert_eq!(store.records().unwrap().len(), 1);
        assert_eq!(store.history(&usd(), 0, 100).unwrap().len(), 1);
        assert!(store.undo(20).is_err());
        assert!(store.undo(30).is_ok());
        // coins are untouched
        assert_eq!(store.coins().unwrap().len(), 3);
    }
}
