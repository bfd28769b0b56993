#![cfg_attr(not(test), deny(clippy::unwrap_used))]

//! # Discovery
//!
//! An on-chain state engine for Bitcoin wallets defined by
//! [output descriptors](https://github.com/bitcoin/bips/blob/master/bip-0380.mediawiki):
//! it walks ranged descriptors under a gap limit against a pluggable
//! [`Explorer`], records histories in an immutable structural-sharing store,
//! and derives utxo sets, balances, histories and per-transaction attributions
//! with stable identities.
//!
//! For an entry point see [`Discovery::new()`].

pub mod clients;
mod config;
mod derive;
mod descriptor;
mod discovery;
mod error;
mod memo;
mod model;
mod store;
mod util;

pub use crate::clients::{Explorer, ExplorerError, MemoryExplorer, ScriptHash};
pub use crate::config::{coin_type, DiscoveryOptions, DEFAULT_GAP_LIMIT};
pub use crate::descriptor::{
    account_descriptors, canonicalize, standard_account_descriptor, DiscoveryDescriptor,
    StandardScriptType,
};
pub use crate::discovery::Discovery;
pub use crate::error::Error;
pub use crate::model::{
    FetchRequest, FetchStatus, InputAttribution, OutputAttribution, OutputCriteria,
    StandardAccountsRequest, Stxo, TxAttribution, TxHistoryEntry, TxStatus, TxType, TxoMap, Utxo,
    UtxosAndBalance,
};
pub use crate::store::{
    DescriptorData, DescriptorIndex, DiscoveryData, NetworkData, OutputData, Timestamp, TxData,
    DATA_MODEL_VERSION,
};
pub use crate::util::EC;

#[cfg(feature = "electrum")]
pub use crate::clients::{ElectrumClient, ElectrumUrl};

#[cfg(feature = "esplora")]
pub use crate::clients::EsploraClient;

pub use bitcoin;
pub use miniscript;
