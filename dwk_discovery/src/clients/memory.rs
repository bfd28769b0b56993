use super::{Explorer, ExplorerError, ScriptHash};
use crate::model::TxHistoryEntry;
use bitcoin::absolute::LockTime;
use bitcoin::consensus::serialize;
use bitcoin::hashes::Hash;
use bitcoin::transaction::Version;
use bitcoin::{
    Amount, OutPoint, Script, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness,
};
use std::collections::HashMap;

const DEFAULT_IRREVERSIBLE_DEPTH: u32 = 6;

/// A deterministic in-memory blockchain, the explorer used by the test suite
/// and handy for examples: no network, no daemon.
///
/// Transactions enter via [`MemoryExplorer::broadcast()`] and sit in the
/// mempool until [`MemoryExplorer::generate()`] mines them. A script's history
/// lists the transactions paying to it and the ones spending those payments,
/// as an Electrum server would report it.
pub struct MemoryExplorer {
    height: u32,
    irreversible_depth: u32,
    txs: HashMap<Txid, Transaction>,
    confirmed_at: HashMap<Txid, u32>,
    history: HashMap<ScriptHash, Vec<Txid>>,
    funding_counter: u64,
}

impl Default for MemoryExplorer {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryExplorer {
    pub fn new() -> Self {
        Self {
            height: 0,
            irreversible_depth: DEFAULT_IRREVERSIBLE_DEPTH,
            txs: HashMap::new(),
            confirmed_at: HashMap::new(),
            history: HashMap::new(),
            funding_counter: 0,
        }
    }

    /// Confirmations after which a transaction is reported irreversible.
    pub fn with_irreversible_depth(mut self, depth: u32) -> Self {
        self.irreversible_depth = depth;
        self
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Add a transaction to the mempool, indexing its output scripts and the
    /// scripts of the known prevouts it spends.
    pub fn broadcast(&mut self, tx: Transaction) -> Txid {
        let txid = tx.compute_txid();
        for output in &tx.output {
            let hash = ScriptHash::new(&output.script_pubkey);
            self.history.entry(hash).or_default().push(txid);
        }
        for input in &tx.input {
            let prev = input.previous_output;
            if let Some(prev_tx) = self.txs.get(&prev.txid) {
                if let Some(prev_out) = prev_tx.output.get(prev.vout as usize) {
                    let hash = ScriptHash::new(&prev_out.script_pubkey);
                    let entry = self.history.entry(hash).or_default();
                    if !entry.contains(&txid) {
                        entry.push(txid);
                    }
                }
            }
        }
        self.txs.insert(txid, tx);
        txid
    }

    /// Mine `blocks` blocks; the current mempool confirms in the first one.
    pub fn generate(&mut self, blocks: u32) {
        if blocks == 0 {
            return;
        }
        let confirm_height = self.height + 1;
        let mempool: Vec<Txid> = self
            .txs
            .keys()
            .filter(|txid| !self.confirmed_at.contains_key(*txid))
            .copied()
            .collect();
        for txid in mempool {
            self.confirmed_at.insert(txid, confirm_height);
        }
        self.height += blocks;
    }

    /// Broadcast a coin of `value` paid to `script_pubkey`, funded from a
    /// synthetic prevout. Returns the outpoint of the created coin.
    pub fn fund_script(&mut self, script_pubkey: &Script, value: u64) -> OutPoint {
        self.funding_counter += 1;
        let mut bytes = [0xaau8; 32];
        bytes[..8].copy_from_slice(&self.funding_counter.to_le_bytes());
        let synthetic_prevout = OutPoint::new(Txid::from_byte_array(bytes), 0);

        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: synthetic_prevout,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::default(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(value),
                script_pubkey: script_pubkey.to_owned(),
            }],
        };
        let txid = self.broadcast(tx);
        OutPoint::new(txid, 0)
    }

    fn entry(&self, txid: Txid) -> TxHistoryEntry {
        let block_height = self.confirmed_at.get(&txid).copied().unwrap_or(0);
        let irreversible =
            block_height > 0 && self.height - block_height + 1 >= self.irreversible_depth;
        TxHistoryEntry {
            tx_id: txid,
            block_height,
            irreversible,
        }
    }
}

impl Explorer for MemoryExplorer {
    fn block_height(&mut self) -> Result<u32, ExplorerError> {
        Ok(self.height)
    }

    fn tx_history(
        &mut self,
        script_hash: &ScriptHash,
    ) -> Result<Vec<TxHistoryEntry>, ExplorerError> {
        Ok(self
            .history
            .get(script_hash)
            .map(|txids| txids.iter().map(|txid| self.entry(*txid)).collect())
            .unwrap_or_default())
    }

    fn tx(&mut self, txid: &Txid) -> Result<Vec<u8>, ExplorerError> {
        let tx = self
            .txs
            .get(txid)
            .ok_or_else(|| ExplorerError::Protocol(format!("unknown transaction {txid}")))?;
        Ok(serialize(tx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spk(byte: u8) -> ScriptBuf {
        ScriptBuf::from_bytes(vec![0x51, byte])
    }

    #[test]
    fn test_fund_confirm_irreversible() {
        let mut explorer = MemoryExplorer::new().with_irreversible_depth(3);
        let script = spk(1);
        let outpoint = explorer.fund_script(&script, 1000);

        let hash = ScriptHash::new(&script);
        let history = explorer.tx_history(&hash).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].tx_id, outpoint.txid);
        assert_eq!(history[0].block_height, 0);
        assert!(!history[0].irreversible);

        explorer.generate(1);
        let history = explorer.tx_history(&hash).unwrap();
        assert_eq!(history[0].block_height, 1);
        assert!(!history[0].irreversible);

        explorer.generate(2);
        let history = explorer.tx_history(&hash).unwrap();
        assert!(history[0].irreversible);
    }

    #[test]
    fn test_spend_appears_in_history() {
        let mut explorer = MemoryExplorer::new();
        let script = spk(1);
        let outpoint = explorer.fund_script(&script, 1000);
        explorer.generate(1);

        let spend = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: outpoint,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::default(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(900),
                script_pubkey: spk(2),
            }],
        };
        let spend_txid = explorer.broadcast(spend);

        let history = explorer.tx_history(&ScriptHash::new(&script)).unwrap();
        let txids: Vec<Txid> = history.iter().map(|entry| entry.tx_id).collect();
        assert_eq!(txids, vec![outpoint.txid, spend_txid]);
    }

    #[test]
    fn test_tx_round_trip() {
        let mut explorer = MemoryExplorer::new();
        let outpoint = explorer.fund_script(&spk(1), 1000);
        let bytes = explorer.tx(&outpoint.txid).unwrap();
        let tx: Transaction = bitcoin::consensus::deserialize(&bytes).unwrap();
        assert_eq!(tx.compute_txid(), outpoint.txid);

        let missing = Txid::all_zeros();
        assert!(explorer.tx(&missing).is_err());
    }
}
