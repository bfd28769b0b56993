extern crate dwk_discovery;

use dwk_discovery::{
    Discovery, EsploraClient, FetchRequest, OutputCriteria, TxStatus,
};
use dwk_discovery::bitcoin::Network;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // This example discovers a testnet wallet defined by a ranged descriptor
    // and prints its balance and transaction history with attributions.
    // Run this example with cargo:
    // cargo run --example list_history

    let desc = "wpkh([280f3e58/84'/1'/0']tpubDD7tXK8KeQ3YY83yWq755fHY2JW8Ha8Q765tknUM5rSvjPcGWfUppDFMpQ1ScziKfW3ZNtZvAD7M3u7bSs7HofjTD3KP3YxPK7X6hwV8Rk2/0/*)";

    // Walk the descriptor against a public esplora instance
    let esplora = EsploraClient::new("https://blockstream.info/testnet/api");
    let mut discovery = Discovery::new(esplora, Network::Testnet)?;
    discovery.fetch(
        FetchRequest::descriptor(desc)
            .on_checking(|_, index| println!("checking index {index}"))
            .on_used(|descriptor| println!("descriptor is used: {descriptor}")),
    )?;

    let criteria = OutputCriteria::descriptor(desc).with_tx_status(TxStatus::All);
    let result = discovery.get_utxos_and_balance(&criteria)?;
    println!("balance: {} sat over {} utxos", result.balance, result.utxos.len());

    for attribution in discovery.get_history_with_attributions(&criteria)?.iter() {
        println!(
            "TXID: {} height: {} {:?} net: {} sat",
            attribution.tx_id,
            attribution.block_height,
            attribution.tx_type,
            attribution.net_received,
        );
    }
    Ok(())
}
