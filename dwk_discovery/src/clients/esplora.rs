use super::{Explorer, ExplorerError, ScriptHash};
use crate::model::TxHistoryEntry;
use bitcoin::hex::FromHex;
use bitcoin::Txid;
use serde::Deserialize;

const DEFAULT_IRREVERSIBLE_DEPTH: u32 = 6;

// Esplora pages confirmed history 25 transactions at a time.
const CHAIN_PAGE_SIZE: usize = 25;

/// An [`Explorer`] over the
/// [esplora HTTP API](https://github.com/blockstream/esplora/blob/master/API.md).
///
/// Examples:
/// `https://blockstream.info/api/scripthash/b50a…8ba3/txs`,
/// `https://blockstream.info/api/tx/{txid}/hex`.
#[derive(Debug)]
pub struct EsploraClient {
    base_url: String,
    client: reqwest::blocking::Client,
    irreversible_depth: u32,
}

impl EsploraClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::blocking::Client::new(),
            irreversible_depth: DEFAULT_IRREVERSIBLE_DEPTH,
        }
    }

    /// Confirmations after which a transaction is reported irreversible.
    pub fn with_irreversible_depth(mut self, depth: u32) -> Self {
        self.irreversible_depth = depth;
        self
    }

    fn get_text(&self, url: &str) -> Result<String, ExplorerError> {
        let response = self.client.get(url).send()?.error_for_status()?;
        Ok(response.text()?)
    }

    fn get_page(&self, url: &str) -> Result<Vec<EsploraTx>, ExplorerError> {
        let text = self.get_text(url)?;
        serde_json::from_str(&text).map_err(|e| {
            log::warn!("error {e:?} in converting following text:\n{text}");
            ExplorerError::Protocol(format!("unexpected esplora response: {e}"))
        })
    }
}

impl Explorer for EsploraClient {
    fn block_height(&mut self) -> Result<u32, ExplorerError> {
        let text = self.get_text(&format!("{}/blocks/tip/height", self.base_url))?;
        text.trim()
            .parse()
            .map_err(|_| ExplorerError::Protocol(format!("unexpected tip height '{text}'")))
    }

    fn tx_history(
        &mut self,
        script_hash: &ScriptHash,
    ) -> Result<Vec<TxHistoryEntry>, ExplorerError> {
        let tip = self.block_height()?;

        let mut page = self.get_page(&format!("{}/scripthash/{script_hash}/txs", self.base_url))?;
        let mut txs: Vec<EsploraTx> = Vec::new();
        loop {
            let confirmed = page.iter().filter(|tx| tx.status.confirmed).count();
            let last_confirmed = page.iter().rev().find(|tx| tx.status.confirmed).map(|tx| tx.txid);
            txs.extend(page);
            if confirmed < CHAIN_PAGE_SIZE {
                break;
            }
            let last = match last_confirmed {
                Some(txid) => txid,
                None => break,
            };
            page = self.get_page(&format!(
                "{}/scripthash/{script_hash}/txs/chain/{last}",
                self.base_url
            ))?;
        }

        // esplora reports newest first, flip to the oldest-first convention
        // the electrum protocol uses
        txs.reverse();
        Ok(txs
            .into_iter()
            .map(|tx| {
                let block_height = match (tx.status.confirmed, tx.status.block_height) {
                    (true, Some(height)) => height,
                    _ => 0,
                };
                let irreversible =
                    block_height > 0 && tip.saturating_sub(block_height) + 1 >= self.irreversible_depth;
                TxHistoryEntry {
                    tx_id: tx.txid,
                    block_height,
                    irreversible,
                }
            })
            .collect())
    }

    fn tx(&mut self, txid: &Txid) -> Result<Vec<u8>, ExplorerError> {
        let text = self.get_text(&format!("{}/tx/{txid}/hex", self.base_url))?;
        Vec::<u8>::from_hex(text.trim())
            .map_err(|e| ExplorerError::Protocol(format!("invalid tx hex for {txid}: {e}")))
    }
}

#[derive(Deserialize)]
struct EsploraTx {
    txid: Txid,
    status: Status,
}

#[derive(Deserialize)]
struct Status {
    confirmed: bool,
    block_height: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_history_page() {
        let json = r#"[
            {"txid":"0000000000000000000000000000000000000000000000000000000000000001",
             "status":{"confirmed":true,"block_height":100,"block_hash":"x"}},
            {"txid":"0000000000000000000000000000000000000000000000000000000000000002",
             "status":{"confirmed":false}}
        ]"#;
        let page: Vec<EsploraTx> = serde_json::from_str(json).unwrap();
        assert_eq!(page.len(), 2);
        assert!(page[0].status.confirmed);
        assert_eq!(page[0].status.block_height, Some(100));
        assert!(!page[1].status.confirmed);
        assert_eq!(page[1].status.block_height, None);
    }
}
