use crate::store::DescriptorIndex;
use bitcoin::Txid;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Generic(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Descriptor '{descriptor}' has not been fetched yet")]
    NotFetched {
        descriptor: String,
        index: Option<DescriptorIndex>,
    },

    #[error("Output ({descriptor}, {index}) derives a script pub key already bound to ({existing_descriptor}, {existing_index})")]
    DuplicateScriptPubKey {
        descriptor: String,
        index: DescriptorIndex,
        existing_descriptor: String,
        existing_index: DescriptorIndex,
    },

    #[error("Duplicate utxo {0} in aggregated result")]
    DuplicateUtxo(String),

    #[error("Transaction {0} is referenced by an output but missing from the tx map")]
    MissingTxData(Txid),

    #[error("Transaction {0} has no body yet")]
    MissingTxHex(Txid),

    #[error("Transaction type could not be determined for {0}")]
    UnknownTransactionType(Txid),

    #[error("Unknown data model version '{0}'")]
    VersionMismatch(String),

    #[error(transparent)]
    Explorer(#[from] crate::clients::ExplorerError),

    #[error(transparent)]
    Miniscript(#[from] miniscript::Error),

    #[error(transparent)]
    DescConversion(#[from] miniscript::descriptor::ConversionError),

    #[error(transparent)]
    Bip32(#[from] bitcoin::bip32::Error),

    #[error(transparent)]
    Encode(#[from] bitcoin::consensus::encode::Error),

    #[error(transparent)]
    Secp256k1(#[from] bitcoin::secp256k1::Error),

    #[error(transparent)]
    HexToBytes(#[from] bitcoin::hex::HexToBytesError),

    #[error(transparent)]
    HexToArray(#[from] bitcoin::hex::HexToArrayError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
