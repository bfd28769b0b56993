use crate::config::DEFAULT_GAP_LIMIT;
use crate::error::Error;
use crate::store::{DescriptorIndex, Timestamp};
use bitcoin::Txid;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

/// An unspent transaction output, encoded as `"{txid}:{vout}"`.
pub type Utxo = String;

/// A spent transaction output, encoded as
/// `"{txid}:{vout}:{spending_txid}:{spending_vin}"`.
pub type Stxo = String;

/// Reverse index from a txo to the `"{descriptor}~{index}"` that owns it.
pub type TxoMap = HashMap<Utxo, String>;

/// Confirmation filter applied to derived views.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TxStatus {
    /// Mempool and confirmed transactions alike.
    #[default]
    All,
    /// Only transactions in a block.
    Confirmed,
    /// Only transactions the explorer flagged as irreversible.
    Irreversible,
}

impl TxStatus {
    pub(crate) fn accepts(&self, block_height: u32, irreversible: bool) -> bool {
        match self {
            TxStatus::All => true,
            TxStatus::Confirmed => block_height != 0,
            TxStatus::Irreversible => irreversible,
        }
    }
}

/// Position of a transaction in the wallet history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxHistoryEntry {
    /// Transaction id.
    pub tx_id: Txid,

    /// Confirmation height, 0 when in the mempool.
    pub block_height: u32,

    /// Whether the explorer considers the transaction permanent.
    pub irreversible: bool,
}

/// UTXO set, STXO set, ownership index and balance of a group of outputs.
///
/// The collection fields keep their identity across queries while the
/// underlying data is unchanged, so holding on to a previous result and
/// comparing with [`Arc::ptr_eq`] is a cheap change detector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UtxosAndBalance {
    pub utxos: Arc<Vec<Utxo>>,
    pub stxos: Arc<Vec<Stxo>>,
    pub txo_map: Arc<TxoMap>,
    /// Sum of the unspent output values, in satoshi.
    pub balance: u64,
}

/// How a transaction moved funds with respect to the wallet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxType {
    /// Some outputs owned, no owned input spent.
    Received,
    /// Owned inputs spent, some outputs leave the wallet.
    Sent,
    /// Mixed ownership on both sides.
    ReceivedAndSent,
    /// Every input and every output owned.
    Consolidated,
}

/// Ownership and value of one transaction input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputAttribution {
    /// Whether the spent prevout belongs to the wallet.
    pub owned: bool,

    /// Value of the spent prevout in satoshi, known only for owned prevouts.
    pub value: Option<u64>,
}

/// Ownership and value of one transaction output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputAttribution {
    /// Whether the output belongs to the wallet.
    pub owned: bool,

    /// Value of the output in satoshi.
    pub value: u64,
}

/// What the wallet received and spent in one transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxAttribution {
    pub tx_id: Txid,
    pub block_height: u32,
    pub irreversible: bool,
    /// Per-input ownership, respecting input order.
    pub ins: Vec<InputAttribution>,
    /// Per-output ownership, respecting output order.
    pub outs: Vec<OutputAttribution>,
    /// Owned outputs minus owned inputs, in satoshi.
    pub net_received: i64,
    pub tx_type: TxType,
}

/// Fetch progress of a descriptor or of one of its outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchStatus {
    pub fetching: bool,
    pub time_fetched: Timestamp,
}

/// Selects the outputs a derived-view query runs over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputCriteria {
    /// Descriptors, canonicalized on use.
    pub descriptors: Vec<String>,
    /// Restrict to one index of a single ranged descriptor.
    pub index: Option<u32>,
    /// Confirmation filter, [`TxStatus::All`] by default.
    pub tx_status: TxStatus,
}

impl OutputCriteria {
    /// Criteria covering every used output of one descriptor.
    pub fn descriptor(descriptor: &str) -> Self {
        Self {
            descriptors: vec![descriptor.to_string()],
            index: None,
            tx_status: TxStatus::All,
        }
    }

    /// Criteria covering every used output of a group of descriptors.
    pub fn descriptors<S: Into<String>, I: IntoIterator<Item = S>>(descriptors: I) -> Self {
        Self {
            descriptors: descriptors.into_iter().map(Into::into).collect(),
            index: None,
            tx_status: TxStatus::All,
        }
    }

    pub fn with_index(mut self, index: u32) -> Self {
        self.index = Some(index);
        self
    }

    pub fn with_tx_status(mut self, tx_status: TxStatus) -> Self {
        self.tx_status = tx_status;
        self
    }
}

/// Parameters of a [`crate::Discovery::fetch()`] call.
pub struct FetchRequest {
    pub(crate) descriptors: Vec<String>,
    pub(crate) index: Option<u32>,
    pub(crate) gap_limit: u32,
    pub(crate) on_checking: Option<Box<dyn FnMut(&str, DescriptorIndex)>>,
    pub(crate) on_used: Option<Box<dyn FnMut(&str)>>,
}

impl FetchRequest {
    /// Fetch a single descriptor.
    pub fn descriptor(descriptor: &str) -> Self {
        Self::descriptors([descriptor])
    }

    /// Fetch a group of descriptors, walked one after the other.
    pub fn descriptors<S: Into<String>, I: IntoIterator<Item = S>>(descriptors: I) -> Self {
        Self {
            descriptors: descriptors.into_iter().map(Into::into).collect(),
            index: None,
            gap_limit: DEFAULT_GAP_LIMIT,
            on_checking: None,
            on_used: None,
        }
    }

    /// Fetch only this index of a single ranged descriptor.
    pub fn index(mut self, index: u32) -> Self {
        self.index = Some(index);
        self
    }

    /// Consecutive unused indices after which the ranged walk stops.
    pub fn gap_limit(mut self, gap_limit: u32) -> Self {
        self.gap_limit = gap_limit;
        self
    }

    /// Observer invoked before each output is checked.
    pub fn on_checking(mut self, f: impl FnMut(&str, DescriptorIndex) + 'static) -> Self {
        self.on_checking = Some(Box::new(f));
        self
    }

    /// Observer invoked the first time a used output of the request is found.
    pub fn on_used(mut self, f: impl FnMut(&str) + 'static) -> Self {
        self.on_used = Some(Box::new(f));
        self
    }
}

impl std::fmt::Debug for FetchRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchRequest")
            .field("descriptors", &self.descriptors)
            .field("index", &self.index)
            .field("gap_limit", &self.gap_limit)
            .finish()
    }
}

/// Parameters of [`crate::Discovery::fetch_standard_accounts()`].
pub struct StandardAccountsRequest {
    pub(crate) gap_limit: u32,
    pub(crate) on_account_checking: Option<Box<dyn FnMut(crate::descriptor::StandardScriptType, u32)>>,
    pub(crate) on_account_used: Option<Box<dyn FnMut(crate::descriptor::StandardScriptType, u32)>>,
}

impl Default for StandardAccountsRequest {
    fn default() -> Self {
        Self {
            gap_limit: DEFAULT_GAP_LIMIT,
            on_account_checking: None,
            on_account_used: None,
        }
    }
}

impl StandardAccountsRequest {
    pub fn gap_limit(mut self, gap_limit: u32) -> Self {
        self.gap_limit = gap_limit;
        self
    }

    pub fn on_account_checking(
        mut self,
        f: impl FnMut(crate::descriptor::StandardScriptType, u32) + 'static,
    ) -> Self {
        self.on_account_checking = Some(Box::new(f));
        self
    }

    pub fn on_account_used(
        mut self,
        f: impl FnMut(crate::descriptor::StandardScriptType, u32) + 'static,
    ) -> Self {
        self.on_account_used = Some(Box::new(f));
        self
    }
}

pub(crate) fn format_txo(txid: Txid, vout: u32) -> String {
    format!("{txid}:{vout}")
}

pub(crate) fn parse_txo(txo: &str) -> Result<(Txid, u32), Error> {
    let mut parts = txo.splitn(2, ':');
    let txid = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::InvalidArgument(format!("invalid txo '{txo}'")))?;
    let vout = parts
        .next()
        .ok_or_else(|| Error::InvalidArgument(format!("invalid txo '{txo}'")))?;
    let txid = Txid::from_str(txid)?;
    let vout: u32 = vout
        .parse()
        .map_err(|_| Error::InvalidArgument(format!("invalid txo '{txo}'")))?;
    Ok((txid, vout))
}

/// The `"{txid}:{vout}"` prefix of a stxo.
pub(crate) fn stxo_txo_prefix(stxo: &str) -> &str {
    let mut end = stxo.len();
    for (count, (position, _)) in stxo.match_indices(':').enumerate() {
        if count == 1 {
            end = position;
            break;
        }
    }
    &stxo[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;

    #[test]
    fn test_txo_round_trip() {
        let txid = Txid::all_zeros();
        let txo = format_txo(txid, 7);
        assert_eq!(parse_txo(&txo).unwrap(), (txid, 7));
        assert!(parse_txo("deadbeef").is_err());
        assert!(parse_txo(":1").is_err());
    }

    #[test]
    fn test_stxo_prefix() {
        let txid = Txid::all_zeros();
        let spender = Txid::all_zeros();
        let stxo = format!("{txid}:1:{spender}:0");
        assert_eq!(stxo_txo_prefix(&stxo), format!("{txid}:1"));
        // a plain txo is its own prefix
        assert_eq!(stxo_txo_prefix(&format!("{txid}:1")), format!("{txid}:1"));
    }

    #[test]
    fn test_tx_status_filter() {
        assert!(TxStatus::All.accepts(0, false));
        assert!(TxStatus::All.accepts(5, true));
        assert!(!TxStatus::Confirmed.accepts(0, false));
        assert!(TxStatus::Confirmed.accepts(5, false));
        assert!(!TxStatus::Irreversible.accepts(5, false));
        assert!(TxStatus::Irreversible.accepts(5, true));
    }
}
