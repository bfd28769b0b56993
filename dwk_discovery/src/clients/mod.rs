//! Clients to fetch data from the blockchain.

use crate::model::TxHistoryEntry;
use bitcoin::hashes::{sha256, Hash};
use bitcoin::hex::DisplayHex;
use bitcoin::{Script, Txid};
use std::fmt;

mod memory;
pub use memory::MemoryExplorer;

#[cfg(feature = "esplora")]
mod esplora;
#[cfg(feature = "esplora")]
pub use esplora::EsploraClient;

#[cfg(feature = "electrum")]
mod electrum;
#[cfg(feature = "electrum")]
pub use electrum::{ElectrumClient, ElectrumUrl};

/// sha256 of a script pub key, byte-reversed as the Electrum protocol renders
/// it. The engine computes it once per output and hands it to the explorer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScriptHash([u8; 32]);

impl ScriptHash {
    pub fn new(script: &Script) -> Self {
        let mut bytes = sha256::Hash::hash(script.as_bytes()).to_byte_array();
        bytes.reverse();
        ScriptHash(bytes)
    }

    pub fn to_byte_array(&self) -> [u8; 32] {
        self.0
    }
}

impl fmt::Display for ScriptHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_lower_hex_string())
    }
}

/// Transport-level failures of an [`Explorer`]. The engine re-raises them
/// untouched and never retries; retry policy belongs to the client.
#[derive(thiserror::Error, Debug)]
pub enum ExplorerError {
    #[error("{0}")]
    Protocol(String),

    #[cfg(feature = "electrum")]
    #[error(transparent)]
    Electrum(#[from] electrum_client::Error),

    #[cfg(feature = "esplora")]
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// A source of blockchain data keyed by script hash.
///
/// Calls may block; the engine serializes them with its own store updates.
/// `irreversible` is the explorer's judgement that a transaction is buried
/// deeply enough to be permanent, and implies a non-zero height.
pub trait Explorer {
    /// Open the underlying connection, if the transport has one.
    fn connect(&mut self) -> Result<(), ExplorerError> {
        Ok(())
    }

    /// Close the underlying connection, if the transport has one.
    fn close(&mut self) -> Result<(), ExplorerError> {
        Ok(())
    }

    /// Height of the chain tip.
    fn block_height(&mut self) -> Result<u32, ExplorerError>;

    /// Every transaction involving the script with this hash, in the order the
    /// data source reports them.
    fn tx_history(&mut self, script_hash: &ScriptHash)
        -> Result<Vec<TxHistoryEntry>, ExplorerError>;

    /// Raw consensus-encoded body of a transaction.
    fn tx(&mut self, txid: &Txid) -> Result<Vec<u8>, ExplorerError>;
}

impl<E: Explorer + ?Sized> Explorer for Box<E> {
    fn connect(&mut self) -> Result<(), ExplorerError> {
        (**self).connect()
    }

    fn close(&mut self) -> Result<(), ExplorerError> {
        (**self).close()
    }

    fn block_height(&mut self) -> Result<u32, ExplorerError> {
        (**self).block_height()
    }

    fn tx_history(
        &mut self,
        script_hash: &ScriptHash,
    ) -> Result<Vec<TxHistoryEntry>, ExplorerError> {
        (**self).tx_history(script_hash)
    }

    fn tx(&mut self, txid: &Txid) -> Result<Vec<u8>, ExplorerError> {
        (**self).tx(txid)
    }
}
