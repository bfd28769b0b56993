use crate::error::Error;
use bitcoin::{Network, Txid};
use fxhash::FxHasher;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::Arc;

pub type Timestamp = u64;

/// Version tag attached to every exported store. Imports with a different tag
/// are rejected.
pub const DATA_MODEL_VERSION: &str = "V1";

/// Position of an output within a descriptor: the wildcard child index for
/// ranged descriptors, or the single output of a non-ranged one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DescriptorIndex {
    Ranged(u32),
    NonRanged,
}

impl fmt::Display for DescriptorIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DescriptorIndex::Ranged(index) => write!(f, "{index}"),
            DescriptorIndex::NonRanged => write!(f, "non-ranged"),
        }
    }
}

impl FromStr for DescriptorIndex {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "non-ranged" {
            Ok(DescriptorIndex::NonRanged)
        } else {
            let index: u32 = s
                .parse()
                .map_err(|_| Error::InvalidArgument(format!("invalid descriptor index '{s}'")))?;
            Ok(DescriptorIndex::Ranged(index))
        }
    }
}

// Serialized as a string so it can key JSON maps in the exported store.
impl Serialize for DescriptorIndex {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for DescriptorIndex {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// What is known about a transaction involving the wallet.
///
/// Between history discovery and body backfill only the position is known and
/// `tx` is `None`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxData {
    /// Confirmation height, 0 when the transaction is in the mempool.
    pub block_height: u32,

    /// Whether the explorer considers the transaction buried deep enough to be
    /// permanent. Implies `block_height > 0`.
    pub irreversible: bool,

    /// Raw consensus-encoded body, hex in the exported store.
    #[serde(
        rename = "tx_hex",
        with = "crate::util::serde_opt_hex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub tx: Option<Vec<u8>>,
}

/// History of a single output slot of a descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutputData {
    /// Transaction ids affecting this output, in the order returned by the
    /// explorer. May contain duplicates.
    pub tx_ids: Arc<Vec<Txid>>,

    /// Whether a fetch for this output is in flight.
    pub fetching: bool,

    /// Unix seconds of the last completed fetch, 0 if never.
    pub time_fetched: Timestamp,
}

impl Default for OutputData {
    fn default() -> Self {
        Self {
            tx_ids: Arc::new(vec![]),
            fetching: true,
            time_fetched: 0,
        }
    }
}

/// Per-descriptor discovery state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorData {
    /// Whether a fetch for this descriptor is in flight.
    pub fetching: bool,

    /// Unix seconds of the last completed fetch, 0 if never.
    pub time_fetched: Timestamp,

    /// Output slots by descriptor index.
    pub range: HashMap<DescriptorIndex, Arc<OutputData>>,
}

impl std::hash::Hash for DescriptorData {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.fetching.hash(state);
        self.time_fetched.hash(state);

        let mut vec: Vec<_> = self.range.iter().collect();
        vec.sort_by_key(|kv| *kv.0);
        vec.hash(state);
    }
}

/// All discovery state of a single network: the descriptors being tracked and
/// every transaction any of their outputs is involved in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkData {
    /// Tracked descriptors, keyed by canonical descriptor text.
    pub descriptor_map: HashMap<Arc<str>, Arc<DescriptorData>>,

    /// Transactions referenced by any output slot of this network.
    pub tx_map: HashMap<Txid, Arc<TxData>>,
}

impl std::hash::Hash for NetworkData {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let mut vec: Vec<_> = self.descriptor_map.iter().collect();
        vec.sort_by_key(|kv| kv.0.clone());
        vec.hash(state);

        let mut vec: Vec<_> = self.tx_map.iter().collect();
        vec.sort_by_key(|kv| *kv.0);
        vec.hash(state);
    }
}

impl NetworkData {
    pub fn descriptor_data(&self, descriptor: &str) -> Option<&Arc<DescriptorData>> {
        self.descriptor_map.get(descriptor)
    }

    pub fn output_data(
        &self,
        descriptor: &str,
        index: DescriptorIndex,
    ) -> Option<&Arc<OutputData>> {
        self.descriptor_map
            .get(descriptor)?
            .range
            .get(&index)
    }

    /// Upsert the position of a transaction, preserving a previously known
    /// body. Returns whether the map changed.
    pub(crate) fn upsert_tx(&mut self, txid: Txid, block_height: u32, irreversible: bool) -> bool {
        debug_assert!(!irreversible || block_height > 0);
        match self.tx_map.get(&txid) {
            Some(existing)
                if existing.block_height == block_height
                    && existing.irreversible == irreversible =>
            {
                false
            }
            Some(existing) => {
                let tx = existing.tx.clone();
                self.tx_map.insert(
                    txid,
                    Arc::new(TxData {
                        block_height,
                        irreversible,
                        tx,
                    }),
                );
                true
            }
            None => {
                self.tx_map.insert(
                    txid,
                    Arc::new(TxData {
                        block_height,
                        irreversible,
                        tx: None,
                    }),
                );
                true
            }
        }
    }

    /// Attach the raw body to an already known transaction.
    pub(crate) fn set_tx_body(&mut self, txid: Txid, bytes: Vec<u8>) -> Result<(), Error> {
        let existing = self.tx_map.get(&txid).ok_or(Error::MissingTxData(txid))?;
        if existing.tx.is_some() {
            return Ok(());
        }
        self.tx_map.insert(
            txid,
            Arc::new(TxData {
                block_height: existing.block_height,
                irreversible: existing.irreversible,
                tx: Some(bytes),
            }),
        );
        Ok(())
    }

    /// Replace a descriptor entry with an edited copy of its current state.
    pub(crate) fn edit_descriptor(
        &mut self,
        descriptor: &Arc<str>,
        f: impl FnOnce(&mut DescriptorData),
    ) {
        let mut descriptor_data = self
            .descriptor_map
            .get(descriptor.as_ref())
            .map(|data| (**data).clone())
            .unwrap_or_default();
        f(&mut descriptor_data);
        self.descriptor_map
            .insert(descriptor.clone(), Arc::new(descriptor_data));
    }
}

/// The root of the immutable store: one [`NetworkData`] per network.
///
/// The facade holds it behind an [`Arc`]; every edit produces a new root while
/// untouched sub-trees keep pointer identity, so readers and memoized derivers
/// can detect change with [`Arc::ptr_eq`] instead of deep comparison.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryData {
    pub networks: HashMap<Network, Arc<NetworkData>>,
}

impl std::hash::Hash for DiscoveryData {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let mut vec: Vec<_> = self.networks.iter().collect();
        vec.sort_by_key(|kv| kv.0.to_string());
        vec.hash(state);
    }
}

// Exported form of the store. Network ids serialize as their lowercase tags,
// maps as objects keyed by the string form of their keys.
#[derive(Serialize, Deserialize)]
struct Envelope {
    data_model_version: String,
    networks: HashMap<Network, Arc<NetworkData>>,
}

impl DiscoveryData {
    pub fn network_data(&self, network: Network) -> Option<&Arc<NetworkData>> {
        self.networks.get(&network)
    }

    /// Apply an edit to one network, producing a new root.
    ///
    /// The closure works on a shallow copy of the network spine: replacing an
    /// entry swaps its `Arc` while every other entry keeps identity. When the
    /// closure reports no change the original root is returned untouched.
    pub(crate) fn edit_network<F>(
        self: &Arc<Self>,
        network: Network,
        f: F,
    ) -> Result<Arc<Self>, Error>
    where
        F: FnOnce(&mut NetworkData) -> Result<bool, Error>,
    {
        let mut network_data = self
            .networks
            .get(&network)
            .map(|data| (**data).clone())
            .unwrap_or_default();
        let changed = f(&mut network_data)?;
        if !changed {
            return Ok(self.clone());
        }
        let mut networks = self.networks.clone();
        networks.insert(network, Arc::new(network_data));
        Ok(Arc::new(DiscoveryData { networks }))
    }

    /// A cheap fingerprint of the whole store, changing whenever any content
    /// changes. Cryptographic strength is not needed here so the hasher is the
    /// fast one used by the rust compiler.
    pub fn status(&self) -> u64 {
        let mut hasher = FxHasher::default();
        std::hash::Hash::hash(self, &mut hasher);
        hasher.finish()
    }

    /// Serialize to the versioned JSON export format.
    pub fn to_json(&self) -> Result<String, Error> {
        let envelope = Envelope {
            data_model_version: DATA_MODEL_VERSION.to_string(),
            networks: self.networks.clone(),
        };
        Ok(serde_json::to_string(&envelope)?)
    }

    /// Deserialize from the JSON export format, rejecting unknown versions.
    pub fn from_json(json: &str) -> Result<Self, Error> {
        let envelope: Envelope = serde_json::from_str(json)?;
        if envelope.data_model_version != DATA_MODEL_VERSION {
            return Err(Error::VersionMismatch(envelope.data_model_version));
        }
        Ok(DiscoveryData {
            networks: envelope.networks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;

    #[test]
    fn test_descriptor_index_round_trip() {
        for (index, repr) in [
            (DescriptorIndex::Ranged(0), "\"0\""),
            (DescriptorIndex::Ranged(42), "\"42\""),
            (DescriptorIndex::NonRanged, "\"non-ranged\""),
        ] {
            let json = serde_json::to_string(&index).unwrap();
            assert_eq!(json, repr);
            let back: DescriptorIndex = serde_json::from_str(&json).unwrap();
            assert_eq!(back, index);
        }
        assert!("nope".parse::<DescriptorIndex>().is_err());
    }

    #[test]
    fn test_edit_preserves_untouched_subtrees() {
        let descriptor: Arc<str> = "wpkh(k/0/*)".into();
        let other: Arc<str> = "wpkh(k/1/*)".into();

        let mut initial = NetworkData::default();
        initial.edit_descriptor(&descriptor, |_| {});
        initial.edit_descriptor(&other, |_| {});
        let mut networks = HashMap::new();
        networks.insert(Network::Regtest, Arc::new(initial));
        let store = Arc::new(DiscoveryData { networks });

        let untouched_before = store.networks[&Network::Regtest].descriptor_map[&other].clone();

        let edited = store
            .edit_network(Network::Regtest, |network_data| {
                network_data.edit_descriptor(&descriptor, |descriptor_data| {
                    descriptor_data.time_fetched = 7;
                });
                Ok(true)
            })
            .unwrap();

        assert!(!Arc::ptr_eq(&store, &edited));
        let untouched_after = &edited.networks[&Network::Regtest].descriptor_map[&other];
        assert!(Arc::ptr_eq(&untouched_before, untouched_after));
        assert_eq!(
            edited.networks[&Network::Regtest].descriptor_map[&descriptor].time_fetched,
            7
        );
    }

    #[test]
    fn test_edit_without_change_keeps_root() {
        let store = Arc::new(DiscoveryData::default());
        let same = store.edit_network(Network::Regtest, |_| Ok(false)).unwrap();
        assert!(Arc::ptr_eq(&store, &same));
    }

    #[test]
    fn test_upsert_tx_preserves_body() {
        let mut network_data = NetworkData::default();
        let txid = Txid::all_zeros();
        assert!(network_data.upsert_tx(txid, 0, false));
        network_data.set_tx_body(txid, vec![1, 2, 3]).unwrap();

        // confirming the tx must not drop the body
        assert!(network_data.upsert_tx(txid, 100, false));
        assert_eq!(network_data.tx_map[&txid].tx, Some(vec![1, 2, 3]));

        // identical position is a no-op
        assert!(!network_data.upsert_tx(txid, 100, false));
    }

    #[test]
    fn test_export_version_guard() {
        let store = DiscoveryData::default();
        let json = store.to_json().unwrap();
        assert!(json.contains("\"data_model_version\":\"V1\""));
        DiscoveryData::from_json(&json).unwrap();

        let bad = json.replace("\"V1\"", "\"V0\"");
        match DiscoveryData::from_json(&bad) {
            Err(Error::VersionMismatch(version)) => assert_eq!(version, "V0"),
            other => panic!("expected version mismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_populated_store_round_trip() {
        let descriptor: Arc<str> = "wpkh(k/0/*)".into();
        let txid = Txid::all_zeros();

        let store = Arc::new(DiscoveryData::default());
        let store = store
            .edit_network(Network::Testnet, |network_data| {
                network_data.upsert_tx(txid, 7, false);
                network_data.set_tx_body(txid, vec![0xca, 0xfe])?;
                network_data.edit_descriptor(&descriptor, |descriptor_data| {
                    descriptor_data.time_fetched = 99;
                    descriptor_data.range.insert(
                        DescriptorIndex::Ranged(3),
                        Arc::new(OutputData {
                            tx_ids: Arc::new(vec![txid]),
                            fetching: false,
                            time_fetched: 100,
                        }),
                    );
                });
                Ok(true)
            })
            .unwrap();

        let json = store.to_json().unwrap();
        assert!(json.contains("\"testnet\""));
        assert!(json.contains("\"tx_hex\":\"cafe\""));
        assert!(json.contains("\"3\""));

        let back = DiscoveryData::from_json(&json).unwrap();
        assert_eq!(back, *store);
        let output = back.networks[&Network::Testnet]
            .output_data(&descriptor, DescriptorIndex::Ranged(3))
            .unwrap()
            .clone();
        assert_eq!(*output.tx_ids, vec![txid]);
    }

    #[test]
    fn test_status_changes_with_content() {
        let store = Arc::new(DiscoveryData::default());
        let initial = store.status();
        let edited = store
            .edit_network(Network::Regtest, |network_data| {
                Ok(network_data.upsert_tx(Txid::all_zeros(), 1, false))
            })
            .unwrap();
        assert_ne!(initial, edited.status());
    }
}
