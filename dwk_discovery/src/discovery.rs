use crate::clients::{Explorer, ScriptHash};
use crate::config::DiscoveryOptions;
use crate::derive::{used_indices, Derivations};
use crate::descriptor::{
    account_descriptors, standard_account_descriptor, DiscoveryDescriptor, StandardScriptType,
};
use crate::error::Error;
use crate::model::{
    parse_txo, FetchRequest, FetchStatus, OutputCriteria, StandardAccountsRequest, TxAttribution,
    TxHistoryEntry, TxStatus, Utxo, UtxosAndBalance,
};
use crate::store::{
    DescriptorIndex, DiscoveryData, NetworkData, OutputData,
};
use crate::util::now;
use bitcoin::bip32::Xpriv;
use bitcoin::hex::DisplayHex;
use bitcoin::{Network, Transaction, Txid};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

// Fire the used observer the first time a used output is seen in a call.
fn report_used(
    original: &str,
    used_reported: &mut bool,
    on_used: &mut Option<Box<dyn FnMut(&str)>>,
) {
    if !*used_reported {
        *used_reported = true;
        if let Some(f) = on_used.as_mut() {
            f(original);
        }
    }
}

/// The discovery engine of a set of descriptor-defined wallets on one network.
///
/// [`Discovery::fetch()`] walks descriptors against the explorer and updates
/// the immutable store; the `get_*` accessors answer from memoized derivations
/// over that store. Since the store is replaced wholesale on each update while
/// untouched sub-trees keep their identity, two calls with equal parameters on
/// an unchanged store return the *same* collections, not merely equal ones.
pub struct Discovery<E: Explorer> {
    network: Network,
    explorer: E,
    data: Arc<DiscoveryData>,
    derivations: Mutex<Derivations>,
    empty_network: Arc<NetworkData>,
}

impl<E: Explorer> std::fmt::Debug for Discovery<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "discovery({:?})", self.network)
    }
}

impl<E: Explorer> Discovery<E> {
    /// Create a new discovery engine with default cache bounds.
    pub fn new(explorer: E, network: Network) -> Result<Self, Error> {
        Self::with_options(explorer, network, DiscoveryOptions::default())
    }

    /// Create a new discovery engine with explicit cache bounds.
    pub fn with_options(
        mut explorer: E,
        network: Network,
        options: DiscoveryOptions,
    ) -> Result<Self, Error> {
        explorer.connect()?;
        Ok(Self {
            network,
            explorer,
            data: Arc::new(DiscoveryData::default()),
            derivations: Mutex::new(Derivations::new(options)),
            empty_network: Arc::new(NetworkData::default()),
        })
    }

    /// Get the network.
    pub fn network(&self) -> Network {
        self.network
    }

    /// The explorer, e.g. to drive a [`crate::MemoryExplorer`] chain.
    pub fn explorer_mut(&mut self) -> &mut E {
        &mut self.explorer
    }

    /// The current store handle. Holding it keeps that version of the tree
    /// alive unchanged while discovery moves on.
    pub fn store(&self) -> Arc<DiscoveryData> {
        self.data.clone()
    }

    /// Height of the chain tip as reported by the explorer.
    pub fn fetch_block_height(&mut self) -> Result<u32, Error> {
        Ok(self.explorer.block_height()?)
    }

    /// A cheap fingerprint of the store, changing whenever its content does.
    pub fn status(&self) -> u64 {
        self.data.status()
    }

    /// Serialize the store to the versioned JSON export format.
    pub fn export(&self) -> Result<String, Error> {
        self.data.to_json()
    }

    /// Replace the store with a previously exported one. Rejects exports with
    /// an unknown `data_model_version`.
    pub fn import(&mut self, json: &str) -> Result<(), Error> {
        self.data = Arc::new(DiscoveryData::from_json(json)?);
        Ok(())
    }

    fn derivations(&self) -> Result<MutexGuard<'_, Derivations>, Error> {
        self.derivations
            .lock()
            .map_err(|_| Error::Generic("derivations lock poisoned".into()))
    }

    fn network_data(&self) -> Arc<NetworkData> {
        self.data
            .network_data(self.network)
            .cloned()
            .unwrap_or_else(|| self.empty_network.clone())
    }

    /// Discover the outputs of one or more descriptors and record their
    /// histories in the store, then backfill missing transaction bodies.
    ///
    /// Ranged descriptors are walked from index 0 (or the request index) until
    /// `gap_limit` consecutive unused indices are seen. A
    /// [`Error::DuplicateScriptPubKey`] leaves the store exactly as it was
    /// before the call; an explorer failure keeps the consistent partial
    /// progress.
    pub fn fetch(&mut self, request: FetchRequest) -> Result<(), Error> {
        let FetchRequest {
            descriptors,
            index,
            gap_limit,
            mut on_checking,
            mut on_used,
        } = request;
        if descriptors.is_empty() {
            return Err(Error::InvalidArgument("no descriptor given".into()));
        }
        if index.is_some() && descriptors.len() != 1 {
            return Err(Error::InvalidArgument(
                "an explicit index requires a single descriptor".into(),
            ));
        }

        let mut parsed = Vec::with_capacity(descriptors.len());
        for text in &descriptors {
            let descriptor = self.derivations()?.intern(text)?;
            if index.is_some() && !descriptor.is_ranged() {
                return Err(Error::InvalidArgument(
                    "an explicit index requires a ranged descriptor".into(),
                ));
            }
            parsed.push((text.clone(), descriptor));
        }

        let checkpoint = self.data.clone();
        let mut used_reported = false;
        let result = (|| {
            for (original, descriptor) in &parsed {
                self.fetch_descriptor(
                    original,
                    descriptor,
                    index,
                    gap_limit,
                    &mut on_checking,
                    &mut on_used,
                    &mut used_reported,
                )?;
            }
            self.fetch_txs()
        })();
        if let Err(error) = result {
            if matches!(error, Error::DuplicateScriptPubKey { .. }) {
                self.data = checkpoint;
            }
            return Err(error);
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn fetch_descriptor(
        &mut self,
        original: &str,
        descriptor: &Arc<DiscoveryDescriptor>,
        index: Option<u32>,
        gap_limit: u32,
        on_checking: &mut Option<Box<dyn FnMut(&str, DescriptorIndex)>>,
        on_used: &mut Option<Box<dyn FnMut(&str)>>,
        used_reported: &mut bool,
    ) -> Result<(), Error> {
        let canonical = descriptor.canonical().clone();

        self.data = self.data.edit_network(self.network, |network_data| {
            network_data.edit_descriptor(&canonical, |descriptor_data| {
                descriptor_data.fetching = true;
            });
            Ok(true)
        })?;

        if descriptor.is_ranged() {
            let mut child = index.unwrap_or(0);
            let mut gap = 0u32;
            loop {
                let slot = DescriptorIndex::Ranged(child);
                if let Some(f) = on_checking.as_mut() {
                    f(original, slot);
                }
                let used = self.fetch_output(descriptor, slot)?;
                if used {
                    gap = 0;
                    report_used(original, used_reported, on_used);
                } else {
                    gap += 1;
                    if gap >= gap_limit {
                        break;
                    }
                }
                child += 1;
            }
        } else {
            if let Some(f) = on_checking.as_mut() {
                f(original, DescriptorIndex::NonRanged);
            }
            if self.fetch_output(descriptor, DescriptorIndex::NonRanged)? {
                report_used(original, used_reported, on_used);
            }
        }

        // Slots checked past the highest used index carry no information the
        // next walk cannot rediscover, so they are not retained; empty slots
        // under a used index stay, they feed `get_next_index`.
        self.data = self.data.edit_network(self.network, |network_data| {
            network_data.edit_descriptor(&canonical, |descriptor_data| {
                let max_used = descriptor_data
                    .range
                    .iter()
                    .filter(|(_, output)| !output.tx_ids.is_empty())
                    .filter_map(|(slot, _)| match slot {
                        DescriptorIndex::Ranged(child) => Some(*child),
                        DescriptorIndex::NonRanged => None,
                    })
                    .max();
                descriptor_data.range.retain(|slot, output| match slot {
                    DescriptorIndex::Ranged(child) => {
                        !output.tx_ids.is_empty() || max_used.is_some_and(|max| *child <= max)
                    }
                    DescriptorIndex::NonRanged => true,
                });
                descriptor_data.fetching = false;
                descriptor_data.time_fetched = now();
            });
            Ok(true)
        })?;
        Ok(())
    }

    /// Fetch the history of one output: derive its script, gate the slot on
    /// script uniqueness, call the explorer, record positions and history.
    /// Returns whether the history is non-empty.
    fn fetch_output(
        &mut self,
        descriptor: &Arc<DiscoveryDescriptor>,
        index: DescriptorIndex,
    ) -> Result<bool, Error> {
        let canonical = descriptor.canonical().clone();
        let script_hash = {
            let mut derivations = self.derivations()?;
            let spk = derivations.script_pub_key(&canonical, index)?;
            ScriptHash::new(&spk)
        };

        let slot_exists = self
            .data
            .network_data(self.network)
            .and_then(|network_data| network_data.output_data(&canonical, index))
            .is_some();
        if !slot_exists {
            if let Some(network_data) = self.data.network_data(self.network) {
                let network_data = network_data.clone();
                self.derivations()?.ensure_script_pub_key_uniqueness(
                    &network_data,
                    &canonical,
                    index,
                )?;
            }
            self.data = self.data.edit_network(self.network, |network_data| {
                network_data.edit_descriptor(&canonical, |descriptor_data| {
                    descriptor_data
                        .range
                        .insert(index, Arc::new(OutputData::default()));
                });
                Ok(true)
            })?;
        } else {
            self.data = self.data.edit_network(self.network, |network_data| {
                network_data.edit_descriptor(&canonical, |descriptor_data| {
                    if let Some(output) = descriptor_data.range.get(&index) {
                        let mut output = (**output).clone();
                        output.fetching = true;
                        descriptor_data.range.insert(index, Arc::new(output));
                    }
                });
                Ok(true)
            })?;
        }

        let history = self.explorer.tx_history(&script_hash)?;
        log::debug!("{canonical} at {index}: {} history entries", history.len());

        self.data = self.data.edit_network(self.network, |network_data| {
            for entry in &history {
                network_data.upsert_tx(entry.tx_id, entry.block_height, entry.irreversible);
            }
            network_data.edit_descriptor(&canonical, |descriptor_data| {
                let new_ids: Vec<Txid> = history.iter().map(|entry| entry.tx_id).collect();
                // keep the old list identity when the history is unchanged
                let tx_ids = match descriptor_data.range.get(&index) {
                    Some(output) if *output.tx_ids == new_ids => output.tx_ids.clone(),
                    _ => Arc::new(new_ids),
                };
                descriptor_data.range.insert(
                    index,
                    Arc::new(OutputData {
                        tx_ids,
                        fetching: false,
                        time_fetched: now(),
                    }),
                );
            });
            Ok(true)
        })?;
        Ok(!history.is_empty())
    }

    /// Body backfill: download the raw bytes of every referenced transaction
    /// that has none yet, and write them in a single store edit.
    fn fetch_txs(&mut self) -> Result<(), Error> {
        let network_data = match self.data.network_data(self.network) {
            Some(network_data) => network_data.clone(),
            None => return Ok(()),
        };
        let mut seen = HashSet::new();
        let mut missing: Vec<Txid> = Vec::new();
        for descriptor_data in network_data.descriptor_map.values() {
            for output in descriptor_data.range.values() {
                for txid in output.tx_ids.iter() {
                    if seen.insert(*txid) {
                        match network_data.tx_map.get(txid) {
                            Some(data) if data.tx.is_none() => missing.push(*txid),
                            Some(_) => {}
                            None => return Err(Error::MissingTxData(*txid)),
                        }
                    }
                }
            }
        }
        if missing.is_empty() {
            return Ok(());
        }
        log::debug!("{} transaction bodies to download", missing.len());

        let mut bodies = Vec::with_capacity(missing.len());
        for txid in &missing {
            bodies.push((*txid, self.explorer.tx(txid)?));
        }
        self.data = self.data.edit_network(self.network, |network_data| {
            for (txid, bytes) in bodies {
                network_data.set_tx_body(txid, bytes)?;
            }
            Ok(true)
        })?;
        Ok(())
    }

    /// Walk the three standard script types over incrementing account numbers,
    /// fetching the `{/0/*, /1/*}` pair of each account and moving to the next
    /// account while the current one turns out used. Returns the external
    /// descriptors of the used accounts.
    pub fn fetch_standard_accounts(
        &mut self,
        master: &Xpriv,
        request: StandardAccountsRequest,
    ) -> Result<Vec<String>, Error> {
        let StandardAccountsRequest {
            gap_limit,
            mut on_account_checking,
            mut on_account_used,
        } = request;

        let mut discovered = Vec::new();
        for script_type in StandardScriptType::ALL {
            let mut account = 0u32;
            loop {
                if let Some(f) = on_account_checking.as_mut() {
                    f(script_type, account);
                }
                let external =
                    standard_account_descriptor(script_type, master, self.network, account)?;
                let (external, internal) = account_descriptors(&external)?;
                self.fetch(
                    FetchRequest::descriptors([external.clone(), internal.clone()])
                        .gap_limit(gap_limit),
                )?;

                let network_data = self.network_data();
                let used = [&external, &internal].iter().any(|descriptor| {
                    network_data
                        .descriptor_data(descriptor.as_str())
                        .map(|data| !used_indices(data).is_empty())
                        .unwrap_or(false)
                });
                if !used {
                    break;
                }
                if let Some(f) = on_account_used.as_mut() {
                    f(script_type, account);
                }
                discovered.push(external);
                account += 1;
            }
        }
        Ok(discovered)
    }

    /// Fetch progress of a descriptor, or of one of its outputs when `index`
    /// is given. `None` when the descriptor or output was never seen.
    pub fn when_fetched(
        &self,
        descriptor: &str,
        index: Option<u32>,
    ) -> Result<Option<FetchStatus>, Error> {
        let parsed: DiscoveryDescriptor = descriptor.parse()?;
        let slot = match (index, parsed.is_ranged()) {
            (None, _) => None,
            (Some(child), true) => Some(DescriptorIndex::Ranged(child)),
            (Some(_), false) => {
                return Err(Error::InvalidArgument(
                    "index given for non-ranged descriptor".into(),
                ))
            }
        };
        let network_data = match self.data.network_data(self.network) {
            Some(network_data) => network_data,
            None => return Ok(None),
        };
        let descriptor_data = match network_data.descriptor_data(parsed.canonical()) {
            Some(descriptor_data) => descriptor_data,
            None => return Ok(None),
        };
        Ok(match slot {
            None => Some(FetchStatus {
                fetching: descriptor_data.fetching,
                time_fetched: descriptor_data.time_fetched,
            }),
            Some(slot) => descriptor_data.range.get(&slot).map(|output| FetchStatus {
                fetching: output.fetching,
                time_fetched: output.time_fetched,
            }),
        })
    }

    // Derived-view accessors reject descriptors that were never fetched, so a
    // typo cannot read as an empty wallet.
    fn resolve_criteria(
        &self,
        criteria: &OutputCriteria,
    ) -> Result<(Vec<Arc<str>>, Option<DescriptorIndex>), Error> {
        if criteria.descriptors.is_empty() {
            return Err(Error::InvalidArgument("no descriptor given".into()));
        }
        if criteria.index.is_some() && criteria.descriptors.len() != 1 {
            return Err(Error::InvalidArgument(
                "an explicit index requires a single descriptor".into(),
            ));
        }
        let mut canonicals = Vec::with_capacity(criteria.descriptors.len());
        let mut slot = None;
        for text in &criteria.descriptors {
            let parsed: DiscoveryDescriptor = text.parse()?;
            if let Some(child) = criteria.index {
                if !parsed.is_ranged() {
                    return Err(Error::InvalidArgument(
                        "an explicit index requires a ranged descriptor".into(),
                    ));
                }
                slot = Some(DescriptorIndex::Ranged(child));
            }
            let canonical = parsed.canonical().clone();
            let descriptor_data = self
                .data
                .network_data(self.network)
                .and_then(|network_data| network_data.descriptor_data(&canonical).cloned())
                .ok_or_else(|| Error::NotFetched {
                    descriptor: canonical.to_string(),
                    index: None,
                })?;
            if let Some(slot) = slot {
                if !descriptor_data.range.contains_key(&slot) {
                    return Err(Error::NotFetched {
                        descriptor: canonical.to_string(),
                        index: Some(slot),
                    });
                }
            }
            canonicals.push(canonical);
        }
        Ok((canonicals, slot))
    }

    /// Utxos, stxos, ownership index and balance over the selected outputs.
    pub fn get_utxos_and_balance(
        &self,
        criteria: &OutputCriteria,
    ) -> Result<UtxosAndBalance, Error> {
        let (descriptors, index) = self.resolve_criteria(criteria)?;
        let network_data = self.network_data();
        self.derivations()?
            .utxos_and_balance(&network_data, &descriptors, index, criteria.tx_status)
    }

    /// Balance of the selected outputs, in satoshi.
    pub fn get_balance(&self, criteria: &OutputCriteria) -> Result<u64, Error> {
        Ok(self.get_utxos_and_balance(criteria)?.balance)
    }

    /// Utxo set of the selected outputs. Stable identity on an unchanged
    /// store.
    pub fn get_utxos(&self, criteria: &OutputCriteria) -> Result<Arc<Vec<Utxo>>, Error> {
        Ok(self.get_utxos_and_balance(criteria)?.utxos)
    }

    /// Chronological transaction history of the selected outputs.
    pub fn get_history(&self, criteria: &OutputCriteria) -> Result<Arc<Vec<TxHistoryEntry>>, Error> {
        let (descriptors, index) = self.resolve_criteria(criteria)?;
        let network_data = self.network_data();
        self.derivations()?
            .history(&network_data, &descriptors, index, criteria.tx_status)
    }

    /// Chronological history with per-transaction attribution: what the wallet
    /// received and spent, and the transaction classification.
    pub fn get_history_with_attributions(
        &self,
        criteria: &OutputCriteria,
    ) -> Result<Arc<Vec<TxAttribution>>, Error> {
        let (descriptors, index) = self.resolve_criteria(criteria)?;
        let network_data = self.network_data();
        self.derivations()?
            .attributions(&network_data, &descriptors, index, criteria.tx_status)
    }

    /// Smallest index of a ranged descriptor whose history under the filter is
    /// empty.
    pub fn get_next_index(&self, descriptor: &str, tx_status: TxStatus) -> Result<u32, Error> {
        let parsed: DiscoveryDescriptor = descriptor.parse()?;
        if !parsed.is_ranged() {
            return Err(Error::InvalidArgument(
                "next index is defined only for ranged descriptors".into(),
            ));
        }
        let canonical = parsed.canonical().clone();
        self.data
            .network_data(self.network)
            .and_then(|network_data| network_data.descriptor_data(&canonical))
            .ok_or_else(|| Error::NotFetched {
                descriptor: canonical.to_string(),
                index: None,
            })?;
        let network_data = self.network_data();
        self.derivations()?
            .next_index(&network_data, &canonical, tx_status)
    }

    /// Descriptors of this network with at least one used output, sorted.
    pub fn get_used_descriptors(&self) -> Result<Arc<Vec<String>>, Error> {
        let network_data = self.network_data();
        Ok(self
            .derivations()?
            .used_descriptors(self.network, &network_data))
    }

    /// External-branch representatives of the used `{/0/*, /1/*}` descriptor
    /// pairs of this network, sorted.
    pub fn get_used_accounts(&self) -> Result<Arc<Vec<String>>, Error> {
        let network_data = self.network_data();
        Ok(self
            .derivations()?
            .used_accounts(self.network, &network_data))
    }

    /// The `(external, internal)` descriptor pair of an account.
    pub fn get_account_descriptors(&self, account: &str) -> Result<(String, String), Error> {
        account_descriptors(account)
    }

    /// Raw transaction body as hex.
    pub fn get_tx_hex(&self, tx_id: &Txid) -> Result<String, Error> {
        let network_data = self
            .data
            .network_data(self.network)
            .ok_or(Error::MissingTxData(*tx_id))?;
        let data = network_data
            .tx_map
            .get(tx_id)
            .ok_or(Error::MissingTxData(*tx_id))?;
        let bytes = data.tx.as_ref().ok_or(Error::MissingTxHex(*tx_id))?;
        Ok(bytes.to_lower_hex_string())
    }

    /// Raw body of the transaction that created a utxo, as hex.
    pub fn get_utxo_tx_hex(&self, utxo: &str) -> Result<String, Error> {
        let (txid, _) = parse_txo(utxo)?;
        self.get_tx_hex(&txid)
    }

    /// Parsed transaction body.
    pub fn get_transaction(&self, tx_id: &Txid) -> Result<Arc<Transaction>, Error> {
        let network_data = self.network_data();
        let data = network_data
            .tx_map
            .get(tx_id)
            .ok_or(Error::MissingTxData(*tx_id))?;
        let bytes = data.tx.as_ref().ok_or(Error::MissingTxHex(*tx_id))?;
        self.derivations()?.parse_tx(*tx_id, bytes)
    }

    /// The `(descriptor, index)` owning a utxo, if any. Fails when two
    /// descriptors claim the same utxo.
    pub fn get_descriptor(
        &self,
        utxo: &str,
    ) -> Result<Option<(String, DescriptorIndex)>, Error> {
        let network_data = self.network_data();
        self.derivations()?
            .descriptor_of_utxo(self.network, &network_data, utxo)
    }
}

impl<E: Explorer> Drop for Discovery<E> {
    fn drop(&mut self) {
        let _ = self.explorer.close();
    }
}
