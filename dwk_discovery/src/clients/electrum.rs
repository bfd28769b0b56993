use super::{Explorer, ExplorerError, ScriptHash};
use crate::model::TxHistoryEntry;
use bitcoin::Txid;
use electrum_client::{Client, ConfigBuilder, ElectrumApi, Param};
use serde::Deserialize;
use std::fmt::Debug;

const DEFAULT_IRREVERSIBLE_DEPTH: u32 = 6;

/// Url of an electrum server, with or without TLS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectrumUrl {
    /// Host and port with TLS; the boolean enables domain validation.
    Tls(String, bool),
    /// Host and port, plaintext TCP.
    Plaintext(String),
}

impl ElectrumUrl {
    pub fn new(host_port: &str, tls: bool, validate_domain: bool) -> Result<Self, ExplorerError> {
        match (tls, validate_domain) {
            (true, _) => Ok(ElectrumUrl::Tls(host_port.into(), validate_domain)),
            (false, false) => Ok(ElectrumUrl::Plaintext(host_port.into())),
            (false, true) => Err(ExplorerError::Protocol(
                "Cannot validate the domain without tls".into(),
            )),
        }
    }

    fn build_client(&self, timeout: Option<u8>) -> Result<Client, ExplorerError> {
        let builder = ConfigBuilder::new();
        let (url, builder) = match self {
            ElectrumUrl::Tls(url, validate) => {
                (format!("ssl://{url}"), builder.validate_domain(*validate))
            }
            ElectrumUrl::Plaintext(url) => (format!("tcp://{url}"), builder),
        };
        let builder = builder.timeout(timeout);
        Ok(Client::from_config(&url, builder.build())?)
    }
}

/// An [`Explorer`] issuing TCP requests to an electrum server.
pub struct ElectrumClient {
    client: Client,
    tip: u32,
    irreversible_depth: u32,
}

impl Debug for ElectrumClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElectrumClient")
            .field("tip", &self.tip)
            .finish()
    }
}

/// Options for the [`ElectrumClient::with_options()`] method.
#[derive(Default)]
pub struct ElectrumOptions {
    /// The timeout in seconds for the requests.
    pub timeout: Option<u8>,

    /// Confirmations after which a transaction is reported irreversible,
    /// 6 if unset.
    pub irreversible_depth: Option<u32>,
}

impl ElectrumClient {
    /// Creates an Electrum client with default options.
    pub fn new(url: &ElectrumUrl) -> Result<Self, ExplorerError> {
        Self::with_options(url, ElectrumOptions::default())
    }

    /// Creates an Electrum client specifying non default options like timeout.
    pub fn with_options(url: &ElectrumUrl, options: ElectrumOptions) -> Result<Self, ExplorerError> {
        let client = url.build_client(options.timeout)?;
        let tip = client.block_headers_subscribe()?.height as u32;
        Ok(Self {
            client,
            tip,
            irreversible_depth: options.irreversible_depth.unwrap_or(DEFAULT_IRREVERSIBLE_DEPTH),
        })
    }

    /// Ping the Electrum server.
    pub fn ping(&self) -> Result<(), ExplorerError> {
        Ok(self.client.ping()?)
    }
}

// Row of a `blockchain.scripthash.get_history` response. Height -1 means
// unconfirmed with unconfirmed parents, 0 unconfirmed with confirmed parents.
#[derive(Deserialize)]
struct GetHistoryRow {
    tx_hash: Txid,
    height: i64,
}

impl Explorer for ElectrumClient {
    fn block_height(&mut self) -> Result<u32, ExplorerError> {
        let mut popped = None;
        while let Some(notification) = self.client.block_headers_pop()? {
            popped = Some(notification);
        }
        match popped {
            Some(notification) => self.tip = notification.height as u32,
            None => {
                // https://github.com/bitcoindevkit/rust-electrum-client/issues/124
                // The client may have reconnected and subscriptions don't
                // persist across connections.
                if let Ok(notification) = self.client.block_headers_subscribe() {
                    self.tip = notification.height as u32;
                }
            }
        }
        Ok(self.tip)
    }

    fn tx_history(
        &mut self,
        script_hash: &ScriptHash,
    ) -> Result<Vec<TxHistoryEntry>, ExplorerError> {
        let tip = self.block_height()?;
        let value = self.client.raw_call(
            "blockchain.scripthash.get_history",
            [Param::String(script_hash.to_string())],
        )?;
        let rows: Vec<GetHistoryRow> = serde_json::from_value(value)
            .map_err(|e| ExplorerError::Protocol(format!("unexpected get_history response: {e}")))?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let block_height = row.height.max(0) as u32;
                let irreversible = block_height > 0
                    && tip.saturating_sub(block_height) + 1 >= self.irreversible_depth;
                TxHistoryEntry {
                    tx_id: row.tx_hash,
                    block_height,
                    irreversible,
                }
            })
            .collect())
    }

    fn tx(&mut self, txid: &Txid) -> Result<Vec<u8>, ExplorerError> {
        Ok(self.client.transaction_get_raw(txid)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_electrum_url() {
        let url = ElectrumUrl::new("blockstream.info:666", true, true).unwrap();
        assert_eq!(url, ElectrumUrl::Tls("blockstream.info:666".into(), true));

        let url = ElectrumUrl::new("1.1.1.1:666", false, false).unwrap();
        assert_eq!(url, ElectrumUrl::Plaintext("1.1.1.1:666".into()));

        let err = ElectrumUrl::new("example.com:666", false, true).unwrap_err();
        assert_eq!(err.to_string(), "Cannot validate the domain without tls");
    }

    #[test]
    fn test_get_history_row_parsing() {
        let json = r#"[{"tx_hash":"0000000000000000000000000000000000000000000000000000000000000001","height":-1},
                       {"tx_hash":"0000000000000000000000000000000000000000000000000000000000000002","height":120}]"#;
        let rows: Vec<GetHistoryRow> = serde_json::from_str(json).unwrap();
        assert_eq!(rows[0].height, -1);
        assert_eq!(rows[1].height, 120);
    }
}
