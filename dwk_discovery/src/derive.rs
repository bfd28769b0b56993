//! Pure derivation of wallet views from the store.
//!
//! Every deriver is a function of the store and its parameters, wrapped by the
//! caches of [`crate::memo`]: recomputations are skipped when the `Arc`
//! identities of the inputs are unchanged, and recomputed results equal to the
//! previous ones are returned as the previous allocation.

use crate::config::DiscoveryOptions;
use crate::descriptor::{account_of, DiscoveryDescriptor};
use crate::error::Error;
use crate::memo::{pin_map, pin_vec, Lru, OutputCache};
use crate::model::{
    format_txo, parse_txo, stxo_txo_prefix, InputAttribution, OutputAttribution, Stxo,
    TxAttribution, TxHistoryEntry, TxStatus, TxType, TxoMap, Utxo, UtxosAndBalance,
};
use crate::store::{DescriptorData, DescriptorIndex, NetworkData, TxData};
use bitcoin::{Network, ScriptBuf, Transaction, Txid};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

/// Bound of the parsed-transaction cache. Parsed bodies are hot-path but
/// derived, so they live here and never in the store.
const TX_CACHE_SIZE: usize = 1000;

/// The indices of a descriptor whose history is non-empty, ascending.
pub(crate) fn used_indices(descriptor_data: &DescriptorData) -> Vec<DescriptorIndex> {
    let mut indices: Vec<DescriptorIndex> = descriptor_data
        .range
        .iter()
        .filter(|(_, output)| !output.tx_ids.is_empty())
        .map(|(index, _)| *index)
        .collect();
    indices.sort();
    indices
}

/// Canonical transaction ordering.
///
/// Mempool transactions sort after confirmed ones, confirmed ones ascend by
/// height, and same-height pairs (including two mempool transactions) are
/// resolved by input dependency: a spender sorts after the transaction it
/// spends. Anything else is a tie, left to the stable sort. Explorers do not
/// guarantee intra-block order, hence the dependency step.
pub(crate) fn compare_tx_order(
    a_height: u32,
    a_txid: &Txid,
    a_tx: &Transaction,
    b_height: u32,
    b_txid: &Txid,
    b_tx: &Transaction,
) -> Ordering {
    match (a_height, b_height) {
        (0, 0) => compare_tx_dependency(a_txid, a_tx, b_txid, b_tx),
        (0, _) => Ordering::Greater,
        (_, 0) => Ordering::Less,
        (a, b) if a != b => a.cmp(&b),
        _ => compare_tx_dependency(a_txid, a_tx, b_txid, b_tx),
    }
}

fn compare_tx_dependency(
    a_txid: &Txid,
    a_tx: &Transaction,
    b_txid: &Txid,
    b_tx: &Transaction,
) -> Ordering {
    if a_tx
        .input
        .iter()
        .any(|input| input.previous_output.txid == *b_txid)
    {
        return Ordering::Greater;
    }
    if b_tx
        .input
        .iter()
        .any(|input| input.previous_output.txid == *a_txid)
    {
        return Ordering::Less;
    }
    Ordering::Equal
}

fn classify(
    txid: Txid,
    ins: &[InputAttribution],
    outs: &[OutputAttribution],
) -> Result<TxType, Error> {
    let ins_owned = ins.iter().filter(|input| input.owned).count();
    let outs_owned = outs.iter().filter(|output| output.owned).count();
    let all_ins = ins_owned == ins.len();
    let all_outs = outs_owned == outs.len();
    let some_ins = ins_owned > 0;
    let some_outs = outs_owned > 0;

    if all_ins && all_outs {
        Ok(TxType::Consolidated)
    } else if some_ins && !all_ins && some_outs && !all_outs {
        Ok(TxType::ReceivedAndSent)
    } else if some_ins && !all_outs {
        Ok(TxType::Sent)
    } else if !all_ins && some_outs {
        Ok(TxType::Received)
    } else {
        Err(Error::UnknownTransactionType(txid))
    }
}

/// Sum of the values of a utxo set, failing on double counting.
fn balance_from_utxos(utxos: &[Utxo], values: &HashMap<Utxo, u64>) -> Result<u64, Error> {
    let mut seen = HashSet::with_capacity(utxos.len());
    let mut balance: u64 = 0;
    for utxo in utxos {
        if !seen.insert(utxo) {
            return Err(Error::DuplicateUtxo(utxo.clone()));
        }
        let value = values
            .get(utxo)
            .ok_or_else(|| Error::Generic(format!("no value recorded for utxo {utxo}")))?;
        balance += value;
    }
    Ok(balance)
}

fn same_tx_entries(a: &[(Txid, Arc<TxData>)], b: &[(Txid, Arc<TxData>)]) -> bool {
    a.len() == b.len()
        && a.iter()
            .zip(b.iter())
            .all(|((a_txid, a_data), (b_txid, b_data))| {
                a_txid == b_txid && Arc::ptr_eq(a_data, b_data)
            })
}

/// Txos of one output slot, with the values backing balance aggregation.
#[derive(Clone)]
pub(crate) struct OutputTxos {
    pub utxos: Arc<Vec<Utxo>>,
    pub stxos: Arc<Vec<Stxo>>,
    pub txo_map: Arc<TxoMap>,
    pub values: Arc<HashMap<Utxo, u64>>,
}

#[derive(Default)]
struct ScriptPubKeySlot {
    spk: Option<Arc<ScriptBuf>>,
}

#[derive(Default)]
struct TxDataSlot {
    entries: Vec<(Txid, Arc<TxData>)>,
    result: Option<Arc<Vec<(Txid, Arc<TxData>)>>>,
}

#[derive(Default)]
struct TxosSlot {
    input: Option<Arc<Vec<(Txid, Arc<TxData>)>>>,
    utxos: Option<Arc<Vec<Utxo>>>,
    stxos: Option<Arc<Vec<Stxo>>>,
    txo_map: Option<Arc<TxoMap>>,
    values: Option<Arc<HashMap<Utxo, u64>>>,
}

#[derive(Default)]
struct AggregateSlot {
    // identities of the per-output parts the aggregate was computed from
    parts: Vec<(Arc<Vec<Utxo>>, Arc<Vec<Stxo>>, Arc<TxoMap>)>,
    utxos: Option<Arc<Vec<Utxo>>>,
    stxos: Option<Arc<Vec<Stxo>>>,
    txo_map: Option<Arc<TxoMap>>,
    balance: u64,
}

#[derive(Default)]
struct HistorySlot {
    entries: Vec<(Txid, Arc<TxData>)>,
    result: Option<Arc<Vec<TxHistoryEntry>>>,
}

#[derive(Default)]
struct AttributionsSlot {
    history: Option<Arc<Vec<TxHistoryEntry>>>,
    utxos: Option<Arc<Vec<Utxo>>>,
    stxos: Option<Arc<Vec<Stxo>>>,
    result: Option<Arc<Vec<TxAttribution>>>,
}

#[derive(Default)]
struct UsedSlot {
    input: Option<Arc<NetworkData>>,
    result: Option<Arc<Vec<String>>>,
}

type GroupKey = (Arc<str>, Option<DescriptorIndex>, TxStatus);

/// The memoized derivation engine. All state here is cache: dropping it only
/// costs recomputation.
pub(crate) struct Derivations {
    descriptors: Lru<Arc<str>, Arc<DiscoveryDescriptor>>,
    tx_cache: Lru<Txid, Arc<Transaction>>,
    script_pub_keys: OutputCache<DescriptorIndex, ScriptPubKeySlot>,
    tx_data_arrays: OutputCache<DescriptorIndex, TxDataSlot>,
    txos: OutputCache<(DescriptorIndex, TxStatus), TxosSlot>,
    aggregates: Lru<GroupKey, AggregateSlot>,
    histories: Lru<GroupKey, HistorySlot>,
    attributions: Lru<GroupKey, AttributionsSlot>,
    used_descriptors: HashMap<Network, UsedSlot>,
    used_accounts: HashMap<Network, UsedSlot>,
}

impl Derivations {
    pub fn new(options: DiscoveryOptions) -> Self {
        let DiscoveryOptions {
            descriptors_cache_size,
            outputs_per_descriptor_cache_size,
        } = options;
        Self {
            descriptors: Lru::new(descriptors_cache_size),
            tx_cache: Lru::new(TX_CACHE_SIZE),
            script_pub_keys: OutputCache::new(
                descriptors_cache_size,
                outputs_per_descriptor_cache_size,
            ),
            tx_data_arrays: OutputCache::new(
                descriptors_cache_size,
                outputs_per_descriptor_cache_size,
            ),
            txos: OutputCache::new(descriptors_cache_size, outputs_per_descriptor_cache_size),
            aggregates: Lru::new(descriptors_cache_size),
            histories: Lru::new(descriptors_cache_size),
            attributions: Lru::new(descriptors_cache_size),
            used_descriptors: HashMap::new(),
            used_accounts: HashMap::new(),
        }
    }

    /// Parsed form of a canonical descriptor.
    pub fn descriptor(&mut self, canonical: &Arc<str>) -> Result<Arc<DiscoveryDescriptor>, Error> {
        if let Some(descriptor) = self.descriptors.get_mut(canonical) {
            return Ok(descriptor.clone());
        }
        let parsed: DiscoveryDescriptor = canonical.parse()?;
        let descriptor = Arc::new(parsed);
        self.descriptors.put(canonical.clone(), descriptor.clone());
        Ok(descriptor)
    }

    /// Parse arbitrary descriptor text, keyed by its canonical form so that
    /// every spelling of the same descriptor shares one cache entry.
    pub fn intern(&mut self, descriptor: &str) -> Result<Arc<DiscoveryDescriptor>, Error> {
        let key: Arc<str> = descriptor.into();
        if let Some(parsed) = self.descriptors.get_mut(&key) {
            return Ok(parsed.clone());
        }
        let parsed: DiscoveryDescriptor = descriptor.parse()?;
        let canonical = parsed.canonical().clone();
        if let Some(parsed) = self.descriptors.get_mut(&canonical) {
            return Ok(parsed.clone());
        }
        let parsed = Arc::new(parsed);
        self.descriptors.put(canonical, parsed.clone());
        Ok(parsed)
    }

    /// Script pub key of an output slot. Identical inputs yield the identical
    /// buffer.
    pub fn script_pub_key(
        &mut self,
        descriptor: &Arc<str>,
        index: DescriptorIndex,
    ) -> Result<Arc<ScriptBuf>, Error> {
        if let Some(spk) = self.script_pub_keys.entry(descriptor, index).spk.clone() {
            return Ok(spk);
        }
        let parsed = self.descriptor(descriptor)?;
        let spk = Arc::new(parsed.script_pubkey(index)?);
        self.script_pub_keys.entry(descriptor, index).spk = Some(spk.clone());
        Ok(spk)
    }

    pub(crate) fn parse_tx(&mut self, txid: Txid, bytes: &[u8]) -> Result<Arc<Transaction>, Error> {
        if let Some(tx) = self.tx_cache.get_mut(&txid) {
            return Ok(tx.clone());
        }
        let tx: Transaction = bitcoin::consensus::deserialize(bytes)?;
        let tx = Arc::new(tx);
        self.tx_cache.put(txid, tx.clone());
        Ok(tx)
    }

    /// The [`TxData`] entries referenced by one output, in explorer order.
    /// Fails with [`Error::MissingTxData`] on a dangling reference.
    pub fn tx_data_array(
        &mut self,
        network_data: &NetworkData,
        descriptor: &Arc<str>,
        index: DescriptorIndex,
    ) -> Result<Arc<Vec<(Txid, Arc<TxData>)>>, Error> {
        let tx_ids: &[Txid] = network_data
            .output_data(descriptor, index)
            .map(|output| output.tx_ids.as_slice())
            .unwrap_or(&[]);

        let mut entries = Vec::with_capacity(tx_ids.len());
        for txid in tx_ids {
            let data = network_data
                .tx_map
                .get(txid)
                .ok_or(Error::MissingTxData(*txid))?;
            entries.push((*txid, data.clone()));
        }

        let slot = self.tx_data_arrays.entry(descriptor, index);
        if same_tx_entries(&slot.entries, &entries) {
            if let Some(result) = &slot.result {
                return Ok(result.clone());
            }
        }
        slot.entries = entries.clone();
        let result = Arc::new(entries);
        slot.result = Some(result.clone());
        Ok(result)
    }

    /// Utxos, stxos and ownership of one output under a status filter.
    ///
    /// The spent map is keyed by every prevout seen in the inputs: a prevout
    /// unrelated to this output lands in the map but never in `utxos`, which
    /// keeps the per-output derivation self-contained.
    pub fn txos_by_output(
        &mut self,
        descriptor: &Arc<str>,
        index: DescriptorIndex,
        tx_data_array: &Arc<Vec<(Txid, Arc<TxData>)>>,
        tx_status: TxStatus,
    ) -> Result<OutputTxos, Error> {
        {
            let slot = self.txos.entry(descriptor, (index, tx_status));
            if let Some(input) = &slot.input {
                if Arc::ptr_eq(input, tx_data_array) {
                    if let (Some(utxos), Some(stxos), Some(txo_map), Some(values)) =
                        (&slot.utxos, &slot.stxos, &slot.txo_map, &slot.values)
                    {
                        return Ok(OutputTxos {
                            utxos: utxos.clone(),
                            stxos: stxos.clone(),
                            txo_map: txo_map.clone(),
                            values: values.clone(),
                        });
                    }
                }
            }
        }

        let spk = self.script_pub_key(descriptor, index)?;

        // parse each body once, set semantics over duplicated history entries
        let mut seen = HashSet::new();
        let mut txs: Vec<(Txid, Arc<Transaction>)> = Vec::new();
        for (txid, data) in tx_data_array.iter() {
            if !tx_status.accepts(data.block_height, data.irreversible) {
                continue;
            }
            if !seen.insert(*txid) {
                continue;
            }
            let bytes = data.tx.as_ref().ok_or(Error::MissingTxHex(*txid))?;
            txs.push((*txid, self.parse_tx(*txid, bytes)?));
        }

        let owner = format!("{descriptor}~{index}");
        let mut spent: HashMap<Utxo, (Txid, u32)> = HashMap::new();
        let mut txos: Vec<Utxo> = Vec::new();
        let mut txo_map: TxoMap = HashMap::new();
        let mut values: HashMap<Utxo, u64> = HashMap::new();
        for (txid, tx) in &txs {
            for (vin, input) in tx.input.iter().enumerate() {
                let prev_txo = format_txo(input.previous_output.txid, input.previous_output.vout);
                spent.insert(prev_txo, (*txid, vin as u32));
            }
            for (vout, output) in tx.output.iter().enumerate() {
                if output.script_pubkey == *spk {
                    let txo = format_txo(*txid, vout as u32);
                    txo_map.insert(txo.clone(), owner.clone());
                    values.insert(txo.clone(), output.value.to_sat());
                    txos.push(txo);
                }
            }
        }

        let mut utxos: Vec<Utxo> = Vec::new();
        let mut stxos: Vec<Stxo> = Vec::new();
        for txo in txos {
            match spent.get(&txo) {
                Some((spending_txid, vin)) => stxos.push(format!("{txo}:{spending_txid}:{vin}")),
                None => utxos.push(txo),
            }
        }

        let slot = self.txos.entry(descriptor, (index, tx_status));
        slot.input = Some(tx_data_array.clone());
        let utxos = pin_vec(&mut slot.utxos, utxos);
        let stxos = pin_vec(&mut slot.stxos, stxos);
        let txo_map = pin_map(&mut slot.txo_map, txo_map);
        let values = pin_map(&mut slot.values, values);
        Ok(OutputTxos {
            utxos,
            stxos,
            txo_map,
            values,
        })
    }

    fn group_outputs(
        network_data: &NetworkData,
        descriptors: &[Arc<str>],
        index: Option<DescriptorIndex>,
    ) -> Vec<(Arc<str>, DescriptorIndex)> {
        let mut outputs = Vec::new();
        for descriptor in descriptors {
            let indices = match index {
                Some(index) => vec![index],
                None => network_data
                    .descriptor_data(descriptor)
                    .map(|data| used_indices(data))
                    .unwrap_or_default(),
            };
            for index in indices {
                outputs.push((descriptor.clone(), index));
            }
        }
        outputs
    }

    fn group_key(
        descriptors: &[Arc<str>],
        index: Option<DescriptorIndex>,
        tx_status: TxStatus,
    ) -> GroupKey {
        let joined: Arc<str> = descriptors
            .iter()
            .map(|descriptor| descriptor.as_ref())
            .collect::<Vec<_>>()
            .join("\n")
            .into();
        (joined, index, tx_status)
    }

    /// Utxo set, stxo set, ownership index and balance over every used output
    /// of the given descriptors (or the single given index), deduplicated.
    pub fn utxos_and_balance(
        &mut self,
        network_data: &NetworkData,
        descriptors: &[Arc<str>],
        index: Option<DescriptorIndex>,
        tx_status: TxStatus,
    ) -> Result<UtxosAndBalance, Error> {
        let outputs = Self::group_outputs(network_data, descriptors, index);
        let mut parts = Vec::with_capacity(outputs.len());
        for (descriptor, index) in &outputs {
            let array = self.tx_data_array(network_data, descriptor, *index)?;
            parts.push(self.txos_by_output(descriptor, *index, &array, tx_status)?);
        }

        let key = Self::group_key(descriptors, index, tx_status);
        {
            let slot = self.aggregates.get_or_insert_with(key.clone(), Default::default);
            let unchanged = slot.parts.len() == parts.len()
                && slot.parts.iter().zip(parts.iter()).all(|(old, part)| {
                    Arc::ptr_eq(&old.0, &part.utxos)
                        && Arc::ptr_eq(&old.1, &part.stxos)
                        && Arc::ptr_eq(&old.2, &part.txo_map)
                });
            if unchanged {
                if let (Some(utxos), Some(stxos), Some(txo_map)) =
                    (&slot.utxos, &slot.stxos, &slot.txo_map)
                {
                    return Ok(UtxosAndBalance {
                        utxos: utxos.clone(),
                        stxos: stxos.clone(),
                        txo_map: txo_map.clone(),
                        balance: slot.balance,
                    });
                }
            }
        }

        let mut utxos: Vec<Utxo> = Vec::new();
        let mut stxos: Vec<Stxo> = Vec::new();
        let mut txo_map: TxoMap = HashMap::new();
        let mut values: HashMap<Utxo, u64> = HashMap::new();
        let mut seen_utxos = HashSet::new();
        let mut seen_stxos = HashSet::new();
        for part in &parts {
            for utxo in part.utxos.iter() {
                if seen_utxos.insert(utxo.clone()) {
                    utxos.push(utxo.clone());
                }
            }
            for stxo in part.stxos.iter() {
                if seen_stxos.insert(stxo.clone()) {
                    stxos.push(stxo.clone());
                }
            }
            for (txo, owner) in part.txo_map.iter() {
                txo_map.insert(txo.clone(), owner.clone());
            }
            for (txo, value) in part.values.iter() {
                values.insert(txo.clone(), *value);
            }
        }
        let balance = balance_from_utxos(&utxos, &values)?;

        let slot = self.aggregates.get_or_insert_with(key, Default::default);
        slot.parts = parts
            .iter()
            .map(|part| (part.utxos.clone(), part.stxos.clone(), part.txo_map.clone()))
            .collect();
        let utxos = pin_vec(&mut slot.utxos, utxos);
        let stxos = pin_vec(&mut slot.stxos, stxos);
        let txo_map = pin_map(&mut slot.txo_map, txo_map);
        slot.balance = balance;
        Ok(UtxosAndBalance {
            utxos,
            stxos,
            txo_map,
            balance,
        })
    }

    /// Chronological history over the given outputs: merged, deduplicated by
    /// txid, ordered by [`compare_tx_order`].
    pub fn history(
        &mut self,
        network_data: &NetworkData,
        descriptors: &[Arc<str>],
        index: Option<DescriptorIndex>,
        tx_status: TxStatus,
    ) -> Result<Arc<Vec<TxHistoryEntry>>, Error> {
        let outputs = Self::group_outputs(network_data, descriptors, index);
        let mut seen = HashSet::new();
        let mut entries: Vec<(Txid, Arc<TxData>)> = Vec::new();
        for (descriptor, index) in &outputs {
            let array = self.tx_data_array(network_data, descriptor, *index)?;
            for (txid, data) in array.iter() {
                if !tx_status.accepts(data.block_height, data.irreversible) {
                    continue;
                }
                if seen.insert(*txid) {
                    entries.push((*txid, data.clone()));
                }
            }
        }

        let key = Self::group_key(descriptors, index, tx_status);
        {
            let slot = self.histories.get_or_insert_with(key.clone(), Default::default);
            if same_tx_entries(&slot.entries, &entries) {
                if let Some(result) = &slot.result {
                    return Ok(result.clone());
                }
            }
        }

        let mut parsed: HashMap<Txid, Arc<Transaction>> = HashMap::new();
        for (txid, data) in &entries {
            let bytes = data.tx.as_ref().ok_or(Error::MissingTxHex(*txid))?;
            parsed.insert(*txid, self.parse_tx(*txid, bytes)?);
        }

        let mut sorted = entries.clone();
        sorted.sort_by(|(a_txid, a_data), (b_txid, b_data)| {
            compare_tx_order(
                a_data.block_height,
                a_txid,
                &parsed[a_txid],
                b_data.block_height,
                b_txid,
                &parsed[b_txid],
            )
        });
        let result: Vec<TxHistoryEntry> = sorted
            .iter()
            .map(|(txid, data)| TxHistoryEntry {
                tx_id: *txid,
                block_height: data.block_height,
                irreversible: data.irreversible,
            })
            .collect();

        let slot = self.histories.get_or_insert_with(key, Default::default);
        slot.entries = entries;
        let result = pin_vec(&mut slot.result, result);
        Ok(result)
    }

    /// Per-transaction attribution of the sorted history: what the wallet
    /// received and spent, with the transaction classified by the ownership
    /// of its inputs and outputs.
    pub fn attributions(
        &mut self,
        network_data: &NetworkData,
        descriptors: &[Arc<str>],
        index: Option<DescriptorIndex>,
        tx_status: TxStatus,
    ) -> Result<Arc<Vec<TxAttribution>>, Error> {
        let history = self.history(network_data, descriptors, index, tx_status)?;
        let aggregate = self.utxos_and_balance(network_data, descriptors, index, tx_status)?;

        let key = Self::group_key(descriptors, index, tx_status);
        {
            let slot = self
                .attributions
                .get_or_insert_with(key.clone(), Default::default);
            let unchanged = slot
                .history
                .as_ref()
                .is_some_and(|old| Arc::ptr_eq(old, &history))
                && slot
                    .utxos
                    .as_ref()
                    .is_some_and(|old| Arc::ptr_eq(old, &aggregate.utxos))
                && slot
                    .stxos
                    .as_ref()
                    .is_some_and(|old| Arc::ptr_eq(old, &aggregate.stxos));
            if unchanged {
                if let Some(result) = &slot.result {
                    return Ok(result.clone());
                }
            }
        }

        // the wallet's txos: unspent ones plus the txo prefix of spent ones
        let mut owned: HashSet<String> = aggregate.utxos.iter().cloned().collect();
        for stxo in aggregate.stxos.iter() {
            owned.insert(stxo_txo_prefix(stxo).to_string());
        }

        let mut result = Vec::with_capacity(history.len());
        for entry in history.iter() {
            let data = network_data
                .tx_map
                .get(&entry.tx_id)
                .ok_or(Error::MissingTxData(entry.tx_id))?
                .clone();
            let bytes = data.tx.as_ref().ok_or(Error::MissingTxHex(entry.tx_id))?;
            let tx = self.parse_tx(entry.tx_id, bytes)?;

            let mut ins = Vec::with_capacity(tx.input.len());
            for input in &tx.input {
                let prev = input.previous_output;
                let prev_txo = format_txo(prev.txid, prev.vout);
                if owned.contains(&prev_txo) {
                    let prev_data = network_data
                        .tx_map
                        .get(&prev.txid)
                        .ok_or(Error::MissingTxData(prev.txid))?
                        .clone();
                    let prev_bytes = prev_data.tx.as_ref().ok_or(Error::MissingTxHex(prev.txid))?;
                    let prev_tx = self.parse_tx(prev.txid, prev_bytes)?;
                    let value = prev_tx
                        .output
                        .get(prev.vout as usize)
                        .ok_or(Error::MissingTxData(prev.txid))?
                        .value
                        .to_sat();
                    ins.push(InputAttribution {
                        owned: true,
                        value: Some(value),
                    });
                } else {
                    ins.push(InputAttribution {
                        owned: false,
                        value: None,
                    });
                }
            }

            let mut outs = Vec::with_capacity(tx.output.len());
            for (vout, output) in tx.output.iter().enumerate() {
                let txo = format_txo(entry.tx_id, vout as u32);
                outs.push(OutputAttribution {
                    owned: owned.contains(&txo),
                    value: output.value.to_sat(),
                });
            }

            let received: i64 = outs
                .iter()
                .filter(|output| output.owned)
                .map(|output| output.value as i64)
                .sum();
            let spent: i64 = ins.iter().filter_map(|input| input.value).map(|v| v as i64).sum();
            let tx_type = classify(entry.tx_id, &ins, &outs)?;
            result.push(TxAttribution {
                tx_id: entry.tx_id,
                block_height: entry.block_height,
                irreversible: entry.irreversible,
                ins,
                outs,
                net_received: received - spent,
                tx_type,
            });
        }

        let slot = self.attributions.get_or_insert_with(key, Default::default);
        slot.history = Some(history);
        slot.utxos = Some(aggregate.utxos);
        slot.stxos = Some(aggregate.stxos);
        let result = pin_vec(&mut slot.result, result);
        Ok(result)
    }

    /// Descriptors of the network with at least one used output, sorted.
    pub fn used_descriptors(
        &mut self,
        network: Network,
        network_data: &Arc<NetworkData>,
    ) -> Arc<Vec<String>> {
        let slot = self.used_descriptors.entry(network).or_default();
        if let (Some(input), Some(result)) = (&slot.input, &slot.result) {
            if Arc::ptr_eq(input, network_data) {
                return result.clone();
            }
        }
        let mut descriptors: Vec<String> = network_data
            .descriptor_map
            .iter()
            .filter(|(_, data)| !used_indices(data).is_empty())
            .map(|(descriptor, _)| descriptor.to_string())
            .collect();
        descriptors.sort();
        slot.input = Some(network_data.clone());
        pin_vec(&mut slot.result, descriptors)
    }

    /// External-branch representatives of the used `{/0/*, /1/*}` descriptor
    /// pairs of the network, deduplicated and sorted.
    pub fn used_accounts(
        &mut self,
        network: Network,
        network_data: &Arc<NetworkData>,
    ) -> Arc<Vec<String>> {
        let descriptors = self.used_descriptors(network, network_data);
        let slot = self.used_accounts.entry(network).or_default();
        if let (Some(input), Some(result)) = (&slot.input, &slot.result) {
            if Arc::ptr_eq(input, network_data) {
                return result.clone();
            }
        }
        let accounts: BTreeSet<String> = descriptors
            .iter()
            .filter_map(|descriptor| account_of(descriptor))
            .collect();
        slot.input = Some(network_data.clone());
        pin_vec(&mut slot.result, accounts.into_iter().collect())
    }

    /// Reject binding a script pub key already bound to a *used* output of
    /// another descriptor of the network. Called before an output slot is
    /// created, so a violation leaves the store untouched.
    pub fn ensure_script_pub_key_uniqueness(
        &mut self,
        network_data: &NetworkData,
        descriptor: &Arc<str>,
        index: DescriptorIndex,
    ) -> Result<(), Error> {
        let candidate = self.script_pub_key(descriptor, index)?;
        let outputs: Vec<(Arc<str>, DescriptorIndex)> = network_data
            .descriptor_map
            .iter()
            .flat_map(|(existing, data)| {
                data.range
                    .iter()
                    .filter(|(_, output)| !output.tx_ids.is_empty())
                    .map(|(existing_index, _)| (existing.clone(), *existing_index))
                    .collect::<Vec<_>>()
            })
            .collect();
        for (existing, existing_index) in outputs {
            if existing == *descriptor && existing_index == index {
                continue;
            }
            let other = self.script_pub_key(&existing, existing_index)?;
            if *other == *candidate {
                return Err(Error::DuplicateScriptPubKey {
                    descriptor: descriptor.to_string(),
                    index,
                    existing_descriptor: existing.to_string(),
                    existing_index,
                });
            }
        }
        Ok(())
    }

    /// Smallest index of a ranged descriptor whose filtered history is empty.
    pub fn next_index(
        &mut self,
        network_data: &NetworkData,
        descriptor: &Arc<str>,
        tx_status: TxStatus,
    ) -> Result<u32, Error> {
        let descriptor_data = network_data.descriptor_data(descriptor);
        for index in 0.. {
            let output = descriptor_data.and_then(|data| data.range.get(&DescriptorIndex::Ranged(index)));
            let used = match output {
                None => false,
                Some(output) => {
                    let mut used = false;
                    for txid in output.tx_ids.iter() {
                        let data = network_data
                            .tx_map
                            .get(txid)
                            .ok_or(Error::MissingTxData(*txid))?;
                        if tx_status.accepts(data.block_height, data.irreversible) {
                            used = true;
                            break;
                        }
                    }
                    used
                }
            };
            if !used {
                return Ok(index);
            }
        }
        unreachable!("the index walk always finds an unused index")
    }

    /// The owner of a utxo, looked up through the ownership index of every
    /// used descriptor. Fails when two descriptors claim the same utxo.
    pub fn descriptor_of_utxo(
        &mut self,
        network: Network,
        network_data: &Arc<NetworkData>,
        utxo: &str,
    ) -> Result<Option<(String, DescriptorIndex)>, Error> {
        parse_txo(utxo)?;
        let descriptors: Vec<Arc<str>> = self
            .used_descriptors(network, network_data)
            .iter()
            .map(|descriptor| Arc::from(descriptor.as_str()))
            .collect();

        let mut owner: Option<(String, DescriptorIndex)> = None;
        for descriptor in &descriptors {
            let indices = network_data
                .descriptor_data(descriptor)
                .map(|data| used_indices(data))
                .unwrap_or_default();
            for index in indices {
                let array = self.tx_data_array(network_data, descriptor, index)?;
                let part = self.txos_by_output(descriptor, index, &array, TxStatus::All)?;
                if part.txo_map.contains_key(utxo) {
                    match &owner {
                        Some((existing, existing_index))
                            if existing.as_str() != descriptor.as_ref()
                                || *existing_index != index =>
                        {
                            return Err(Error::DuplicateUtxo(utxo.to_string()));
                        }
                        _ => owner = Some((descriptor.to_string(), index)),
                    }
                }
            }
        }
        Ok(owner)
    }
}
