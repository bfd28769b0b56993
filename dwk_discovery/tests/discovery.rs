use dwk_discovery::bitcoin::absolute::LockTime;
use dwk_discovery::bitcoin::transaction::Version;
use dwk_discovery::bitcoin::{
    Amount, Network, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness,
};
use dwk_discovery::{
    DescriptorIndex, Discovery, DiscoveryDescriptor, DiscoveryOptions, Error, Explorer,
    ExplorerError, FetchRequest, MemoryExplorer, OutputCriteria, ScriptHash,
    StandardAccountsRequest, StandardScriptType, TxHistoryEntry, TxStatus, TxType,
};
use std::cell::Cell;
use std::io::Write;
use std::rc::Rc;
use std::sync::Arc;

const TPUB: &str = "tpubDD7tXK8KeQ3YY83yWq755fHY2JW8Ha8Q765tknUM5rSvjPcGWfUppDFMpQ1ScziKfW3ZNtZvAD7M3u7bSs7HofjTD3KP3YxPK7X6hwV8Rk2";

fn external() -> String {
    format!("pkh({TPUB}/0/*)")
}

fn internal() -> String {
    format!("pkh({TPUB}/1/*)")
}

fn spk(descriptor: &str, index: DescriptorIndex) -> ScriptBuf {
    descriptor
        .parse::<DiscoveryDescriptor>()
        .unwrap()
        .script_pubkey(index)
        .unwrap()
}

fn spend(inputs: &[OutPoint], outputs: &[(ScriptBuf, u64)]) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: inputs
            .iter()
            .map(|outpoint| TxIn {
                previous_output: *outpoint,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::default(),
            })
            .collect(),
        output: outputs
            .iter()
            .map(|(script_pubkey, value)| TxOut {
                value: Amount::from_sat(*value),
                script_pubkey: script_pubkey.clone(),
            })
            .collect(),
    }
}

struct TestDiscovery {
    discovery: Discovery<MemoryExplorer>,
}

impl TestDiscovery {
    fn new() -> Self {
        let explorer = MemoryExplorer::new().with_irreversible_depth(3);
        Self {
            discovery: Discovery::new(explorer, Network::Regtest).unwrap(),
        }
    }

    fn fund(&mut self, descriptor: &str, index: DescriptorIndex, value: u64) -> OutPoint {
        let script = spk(descriptor, index);
        self.discovery.explorer_mut().fund_script(&script, value)
    }

    fn generate(&mut self, blocks: u32) {
        self.discovery.explorer_mut().generate(blocks);
    }

    fn fetch(&mut self, descriptor: &str) {
        self.discovery
            .fetch(FetchRequest::descriptor(descriptor))
            .unwrap();
    }
}

#[test]
fn test_gap_limit_walk() {
    // S1: funds at indices 1, 4, 14 and 25, gap limit 20
    let mut test = TestDiscovery::new();
    let descriptor = external();
    for index in [1u32, 4, 14, 25] {
        test.fund(&descriptor, DescriptorIndex::Ranged(index), 10_000);
    }
    test.generate(1);

    let checked = Rc::new(Cell::new(0u32));
    let used = Rc::new(Cell::new(0u32));
    let checked_in_cb = checked.clone();
    let used_in_cb = used.clone();
    test.discovery
        .fetch(
            FetchRequest::descriptor(&descriptor)
                .gap_limit(20)
                .on_checking(move |_, _| checked_in_cb.set(checked_in_cb.get() + 1))
                .on_used(move |_| used_in_cb.set(used_in_cb.get() + 1)),
        )
        .unwrap();

    // the walk inspects indices 0..=45: the gap reaches 20 right after 25 + 20
    assert_eq!(checked.get(), 46);
    // on_used fires exactly once per fetch call
    assert_eq!(used.get(), 1);

    let result = test
        .discovery
        .get_utxos_and_balance(&OutputCriteria::descriptor(&descriptor))
        .unwrap();
    assert_eq!(result.utxos.len(), 4);
    assert_eq!(result.balance, 40_000);

    // indices within the used region report their fetch time, even unused ones
    for index in [0u32, 2, 14, 25] {
        let status = test
            .discovery
            .when_fetched(&descriptor, Some(index))
            .unwrap();
        assert!(status.is_some(), "index {index} should have been seen");
        assert!(!status.unwrap().fetching);
    }
    // anything past the highest used index reads as never seen
    for index in [26u32, 44, 45, 100] {
        assert_eq!(
            test.discovery.when_fetched(&descriptor, Some(index)).unwrap(),
            None,
            "index {index} should not be retained"
        );
    }

    // index 0 is unused, so it is the next one to hand out
    assert_eq!(
        test.discovery.get_next_index(&descriptor, TxStatus::All).unwrap(),
        0
    );
}

#[test]
fn test_non_ranged_output() {
    // S2: a single-output descriptor funded with 123 123 sats
    let mut test = TestDiscovery::new();
    let descriptor = format!("pkh({TPUB}/0/0)");
    test.fund(&descriptor, DescriptorIndex::NonRanged, 123_123);
    test.generate(1);
    test.fetch(&descriptor);

    let result = test
        .discovery
        .get_utxos_and_balance(&OutputCriteria::descriptor(&descriptor))
        .unwrap();
    assert_eq!(result.utxos.len(), 1);
    assert_eq!(result.balance, 123_123);
    assert_eq!(result.stxos.len(), 0);

    let owner = result.txo_map.get(&result.utxos[0]).unwrap();
    assert!(owner.ends_with("~non-ranged"));
}

#[test]
fn test_duplicate_script_pub_key() {
    // S3: a ranged descriptor covering an address already bound to a
    // non-ranged one must be rejected without touching the store
    let mut test = TestDiscovery::new();
    let single = format!("pkh({TPUB}/0/0)");
    test.fund(&single, DescriptorIndex::NonRanged, 123_123);
    test.generate(1);
    test.fetch(&single);

    let status_before = test.discovery.status();
    let export_before = test.discovery.export().unwrap();

    let err = test
        .discovery
        .fetch(FetchRequest::descriptor(&external()))
        .unwrap_err();
    assert!(matches!(err, Error::DuplicateScriptPubKey { .. }));

    assert_eq!(test.discovery.status(), status_before);
    let store_before = dwk_discovery::DiscoveryData::from_json(&export_before).unwrap();
    assert_eq!(*test.discovery.store(), store_before);
}

#[test]
fn test_status_filtering() {
    // S4: one utxo moving from mempool to confirmed to irreversible
    let mut test = TestDiscovery::new();
    let descriptor = external();
    test.fund(&descriptor, DescriptorIndex::Ranged(0), 55_000);
    test.fetch(&descriptor);

    let all = OutputCriteria::descriptor(&descriptor);
    let confirmed = OutputCriteria::descriptor(&descriptor).with_tx_status(TxStatus::Confirmed);
    let irreversible =
        OutputCriteria::descriptor(&descriptor).with_tx_status(TxStatus::Irreversible);

    let result = test.discovery.get_utxos_and_balance(&all).unwrap();
    assert_eq!((result.utxos.len(), result.balance), (1, 55_000));
    let result = test.discovery.get_utxos_and_balance(&confirmed).unwrap();
    assert_eq!((result.utxos.len(), result.balance), (0, 0));

    test.generate(1);
    test.fetch(&descriptor);
    let result = test.discovery.get_utxos_and_balance(&confirmed).unwrap();
    assert_eq!((result.utxos.len(), result.balance), (1, 55_000));
    let result = test.discovery.get_utxos_and_balance(&irreversible).unwrap();
    assert_eq!((result.utxos.len(), result.balance), (0, 0));

    // depth 3: two more blocks on top of the confirmation
    test.generate(2);
    test.fetch(&descriptor);
    let result = test.discovery.get_utxos_and_balance(&irreversible).unwrap();
    assert_eq!((result.utxos.len(), result.balance), (1, 55_000));
}

#[test]
fn test_export_import_round_trip() {
    // S5: an imported store answers queries exactly like the original
    let mut test = TestDiscovery::new();
    let descriptor = external();
    for index in [0u32, 3] {
        test.fund(&descriptor, DescriptorIndex::Ranged(index), 20_000);
    }
    test.generate(1);
    test.fetch(&descriptor);

    let exported = test.discovery.export().unwrap();

    let mut tempfile = tempfile::NamedTempFile::new().unwrap();
    tempfile.write_all(exported.as_bytes()).unwrap();
    let read_back = std::fs::read_to_string(tempfile.path()).unwrap();

    let mut imported: Discovery<MemoryExplorer> =
        Discovery::new(MemoryExplorer::new(), Network::Regtest).unwrap();
    imported.import(&read_back).unwrap();

    for criteria in [
        OutputCriteria::descriptor(&descriptor),
        OutputCriteria::descriptor(&descriptor).with_tx_status(TxStatus::Confirmed),
        OutputCriteria::descriptor(&descriptor).with_index(0),
    ] {
        let original = test.discovery.get_utxos_and_balance(&criteria).unwrap();
        let round_tripped = imported.get_utxos_and_balance(&criteria).unwrap();
        assert_eq!(original, round_tripped);
    }
    assert_eq!(
        test.discovery
            .get_history(&OutputCriteria::descriptor(&descriptor))
            .unwrap(),
        imported
            .get_history(&OutputCriteria::descriptor(&descriptor))
            .unwrap()
    );
}

#[test]
fn test_import_then_continue_fetching() {
    // an imported store is a live starting point: discovery picks up where
    // the exporting engine left off
    let mut test = TestDiscovery::new();
    let descriptor = external();
    test.fund(&descriptor, DescriptorIndex::Ranged(0), 10_000);
    test.generate(1);
    test.fetch(&descriptor);
    let exported = test.discovery.export().unwrap();

    // the chain moves on after the export
    test.fund(&descriptor, DescriptorIndex::Ranged(1), 5_000);
    test.generate(1);

    // hand the store over to a fresh engine on the same chain
    let explorer = std::mem::take(test.discovery.explorer_mut());
    let mut restored = Discovery::new(explorer, Network::Regtest).unwrap();
    restored.import(&exported).unwrap();

    let criteria = OutputCriteria::descriptor(&descriptor);
    assert_eq!(restored.get_balance(&criteria).unwrap(), 10_000);

    restored.fetch(FetchRequest::descriptor(&descriptor)).unwrap();
    assert_eq!(restored.get_balance(&criteria).unwrap(), 15_000);
}

#[test]
fn test_txo_map_contents() {
    let mut test = TestDiscovery::new();
    let descriptor = external();
    test.fund(&descriptor, DescriptorIndex::Ranged(0), 10_000);
    test.fund(&descriptor, DescriptorIndex::Ranged(2), 20_000);
    test.generate(1);
    test.fetch(&descriptor);

    let result = test
        .discovery
        .get_utxos_and_balance(&OutputCriteria::descriptor(&descriptor))
        .unwrap();
    let canonical = dwk_discovery::canonicalize(&descriptor).unwrap();
    assert_eq!(result.txo_map.len(), 2);
    for utxo in result.utxos.iter() {
        let owner = result.txo_map.get(utxo).unwrap();
        let (owner_descriptor, owner_index) = owner.rsplit_once('~').unwrap();
        assert_eq!(owner_descriptor, canonical);
        assert!(matches!(
            owner_index.parse::<DescriptorIndex>().unwrap(),
            DescriptorIndex::Ranged(0) | DescriptorIndex::Ranged(2)
        ));
    }
}

#[test]
fn test_import_rejects_unknown_version() {
    let test = TestDiscovery::new();
    let exported = test.discovery.export().unwrap();
    let tampered = exported.replace("\"V1\"", "\"V7\"");

    let mut imported: Discovery<MemoryExplorer> =
        Discovery::new(MemoryExplorer::new(), Network::Regtest).unwrap();
    assert!(matches!(
        imported.import(&tampered),
        Err(Error::VersionMismatch(_))
    ));
}

#[test]
fn test_attributions() {
    // S6: receive, send with change, self-consolidation
    let mut test = TestDiscovery::new();
    let descriptor = external();
    let funded = test.fund(&descriptor, DescriptorIndex::Ranged(0), 100_000);
    test.generate(1);
    test.fetch(&descriptor);

    let criteria = OutputCriteria::descriptor(&descriptor);
    let attributions = test
        .discovery
        .get_history_with_attributions(&criteria)
        .unwrap();
    assert_eq!(attributions.len(), 1);
    assert_eq!(attributions[0].tx_type, TxType::Received);
    assert_eq!(attributions[0].net_received, 100_000);

    // send 60 000 away, 35 000 back to index 1, fee 5 000
    let stranger = ScriptBuf::from_bytes(vec![0x51, 0x99]);
    let change = spk(&descriptor, DescriptorIndex::Ranged(1));
    let send = spend(&[funded], &[(stranger, 60_000), (change, 35_000)]);
    test.discovery.explorer_mut().broadcast(send);
    test.generate(1);
    test.fetch(&descriptor);

    let attributions = test
        .discovery
        .get_history_with_attributions(&criteria)
        .unwrap();
    assert_eq!(attributions.len(), 2);
    let send_attribution = &attributions[1];
    assert_eq!(send_attribution.tx_type, TxType::Sent);
    assert_eq!(send_attribution.net_received, 35_000 - 100_000);
    assert!(send_attribution.ins[0].owned);
    assert_eq!(send_attribution.ins[0].value, Some(100_000));
    assert!(!send_attribution.outs[0].owned);
    assert!(send_attribution.outs[1].owned);

    // consolidate the remaining coins of indices 1 and 2 into index 3
    let extra = test.fund(&descriptor, DescriptorIndex::Ranged(2), 50_000);
    test.generate(1);
    test.fetch(&descriptor);

    let change_outpoint = OutPoint::new(attributions[1].tx_id, 1);
    let target = spk(&descriptor, DescriptorIndex::Ranged(3));
    let consolidation = spend(&[change_outpoint, extra], &[(target, 84_000)]);
    test.discovery.explorer_mut().broadcast(consolidation);
    test.generate(1);
    test.fetch(&descriptor);

    let attributions = test
        .discovery
        .get_history_with_attributions(&criteria)
        .unwrap();
    let consolidated = attributions.last().unwrap();
    assert_eq!(consolidated.tx_type, TxType::Consolidated);
    // a consolidation only pays the fee: 35 000 + 50 000 - 84 000
    assert_eq!(consolidated.net_received, -1_000);

    // no utxo may be double counted: the spent ones moved to the stxo set
    let result = test.discovery.get_utxos_and_balance(&criteria).unwrap();
    assert_eq!(result.balance, 84_000);
    for stxo in result.stxos.iter() {
        let prefix = stxo.rsplitn(3, ':').nth(2).unwrap();
        assert!(!result.utxos.contains(&prefix.to_string()));
    }
}

#[test]
fn test_reference_equality_of_views() {
    // identical queries on an unchanged store return the same allocations
    let mut test = TestDiscovery::new();
    let descriptor = external();
    test.fund(&descriptor, DescriptorIndex::Ranged(0), 10_000);
    test.generate(1);
    test.fetch(&descriptor);

    let criteria = OutputCriteria::descriptor(&descriptor);
    let utxos_first = test.discovery.get_utxos(&criteria).unwrap();
    let utxos_second = test.discovery.get_utxos(&criteria).unwrap();
    assert!(Arc::ptr_eq(&utxos_first, &utxos_second));

    let history_first = test.discovery.get_history(&criteria).unwrap();
    let history_second = test.discovery.get_history(&criteria).unwrap();
    assert!(Arc::ptr_eq(&history_first, &history_second));

    let used_first = test.discovery.get_used_descriptors().unwrap();
    let used_second = test.discovery.get_used_descriptors().unwrap();
    assert!(Arc::ptr_eq(&used_first, &used_second));

    let accounts_first = test.discovery.get_used_accounts().unwrap();
    let accounts_second = test.discovery.get_used_accounts().unwrap();
    assert!(Arc::ptr_eq(&accounts_first, &accounts_second));

    let attributions_first = test
        .discovery
        .get_history_with_attributions(&criteria)
        .unwrap();
    let attributions_second = test
        .discovery
        .get_history_with_attributions(&criteria)
        .unwrap();
    assert!(Arc::ptr_eq(&attributions_first, &attributions_second));
}

#[test]
fn test_unrelated_change_preserves_identity() {
    // structural sharing: refreshing descriptor B must not change the
    // identity of descriptor A's views
    let mut test = TestDiscovery::new();
    let descriptor_a = external();
    let descriptor_b = internal();
    test.fund(&descriptor_a, DescriptorIndex::Ranged(0), 10_000);
    test.fund(&descriptor_b, DescriptorIndex::Ranged(0), 20_000);
    test.generate(1);
    test.fetch(&descriptor_a);
    test.fetch(&descriptor_b);

    let criteria_a = OutputCriteria::descriptor(&descriptor_a);
    let utxos_before = test.discovery.get_utxos(&criteria_a).unwrap();

    // a new payment lands on B only
    test.fund(&descriptor_b, DescriptorIndex::Ranged(1), 30_000);
    test.generate(1);
    test.fetch(&descriptor_b);

    let utxos_after = test.discovery.get_utxos(&criteria_a).unwrap();
    assert!(Arc::ptr_eq(&utxos_before, &utxos_after));

    // while B's views did change
    let result_b = test
        .discovery
        .get_utxos_and_balance(&OutputCriteria::descriptor(&descriptor_b))
        .unwrap();
    assert_eq!(result_b.balance, 50_000);
}

#[test]
fn test_fetch_order_independence() {
    // the resulting store does not depend on the order disjoint descriptors
    // are fetched in
    let build = |first: &str, second: &str| {
        let mut test = TestDiscovery::new();
        test.fund(&external(), DescriptorIndex::Ranged(0), 10_000);
        test.fund(&internal(), DescriptorIndex::Ranged(2), 20_000);
        test.generate(1);
        test.fetch(first);
        test.fetch(second);
        test
    };
    let forward = build(&external(), &internal());
    let backward = build(&internal(), &external());
    // time stamps differ between runs, so compare the derived views and the
    // descriptor/tx structure instead of raw equality
    assert_eq!(
        forward.discovery.get_used_descriptors().unwrap(),
        backward.discovery.get_used_descriptors().unwrap()
    );
    let criteria = OutputCriteria::descriptors([external(), internal()]);
    assert_eq!(
        forward.discovery.get_utxos_and_balance(&criteria).unwrap(),
        backward.discovery.get_utxos_and_balance(&criteria).unwrap()
    );
    assert_eq!(
        forward.discovery.get_history(&criteria).unwrap(),
        backward.discovery.get_history(&criteria).unwrap()
    );
}

#[test]
fn test_history_ordering() {
    // mempool entries always sort after confirmed ones
    let mut test = TestDiscovery::new();
    let descriptor = external();
    test.fund(&descriptor, DescriptorIndex::Ranged(0), 10_000);
    test.generate(1);
    test.fund(&descriptor, DescriptorIndex::Ranged(1), 20_000);
    test.fetch(&descriptor);

    let history = test
        .discovery
        .get_history(&OutputCriteria::descriptor(&descriptor))
        .unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].block_height, 1);
    assert_eq!(history[1].block_height, 0);

    // a spender confirmed in the same block sorts after its parent
    let spender = spend(
        &[OutPoint::new(history[1].tx_id, 0)],
        &[(spk(&descriptor, DescriptorIndex::Ranged(2)), 19_000)],
    );
    test.discovery.explorer_mut().broadcast(spender);
    test.generate(1);
    test.fetch(&descriptor);

    let history = test
        .discovery
        .get_history(&OutputCriteria::descriptor(&descriptor))
        .unwrap();
    assert_eq!(history.len(), 3);
    assert_eq!(history[1].block_height, history[2].block_height);
    // history[1] funded index 1, history[2] spends it
    let spender_entry = &history[2];
    let parent_entry = &history[1];
    let spender_tx = test.discovery.get_transaction(&spender_entry.tx_id).unwrap();
    assert!(spender_tx
        .input
        .iter()
        .any(|input| input.previous_output.txid == parent_entry.tx_id));
}

#[test]
fn test_same_descriptor_twice_does_not_double_count() {
    let mut test = TestDiscovery::new();
    let descriptor = external();
    test.fund(&descriptor, DescriptorIndex::Ranged(0), 10_000);
    test.generate(1);
    test.fetch(&descriptor);

    let criteria = OutputCriteria::descriptors([descriptor.clone(), descriptor.clone()]);
    let result = test.discovery.get_utxos_and_balance(&criteria).unwrap();
    assert_eq!(result.utxos.len(), 1);
    assert_eq!(result.balance, 10_000);
}

#[test]
fn test_get_descriptor_and_tx_lookup() {
    let mut test = TestDiscovery::new();
    let descriptor = external();
    test.fund(&descriptor, DescriptorIndex::Ranged(7), 10_000);
    test.generate(1);
    test.fetch(&descriptor);

    let utxos = test
        .discovery
        .get_utxos(&OutputCriteria::descriptor(&descriptor))
        .unwrap();
    let utxo = &utxos[0];

    let (owner, index) = test.discovery.get_descriptor(utxo).unwrap().unwrap();
    assert_eq!(owner, dwk_discovery::canonicalize(&descriptor).unwrap());
    assert_eq!(index, DescriptorIndex::Ranged(7));

    let hex = test.discovery.get_utxo_tx_hex(utxo).unwrap();
    let history = test
        .discovery
        .get_history(&OutputCriteria::descriptor(&descriptor))
        .unwrap();
    assert_eq!(hex, test.discovery.get_tx_hex(&history[0].tx_id).unwrap());
    let tx = test.discovery.get_transaction(&history[0].tx_id).unwrap();
    assert_eq!(tx.compute_txid(), history[0].tx_id);

    // an unknown utxo has no owner
    let unknown = format!("{}:0", "11".repeat(32));
    assert_eq!(test.discovery.get_descriptor(&unknown).unwrap(), None);
}

#[test]
fn test_used_accounts_pairing() {
    let mut test = TestDiscovery::new();
    test.fund(&external(), DescriptorIndex::Ranged(0), 10_000);
    test.fund(&internal(), DescriptorIndex::Ranged(0), 20_000);
    test.generate(1);
    test.fetch(&external());
    test.fetch(&internal());

    // both branches collapse into the single external account
    let accounts = test.discovery.get_used_accounts().unwrap();
    assert_eq!(accounts.len(), 1);
    assert_eq!(accounts[0], dwk_discovery::canonicalize(&external()).unwrap());

    let (account_external, account_internal) = test
        .discovery
        .get_account_descriptors(&accounts[0])
        .unwrap();
    assert_eq!(account_external, dwk_discovery::canonicalize(&external()).unwrap());
    assert_eq!(account_internal, dwk_discovery::canonicalize(&internal()).unwrap());
}

#[test]
fn test_fetch_standard_accounts() {
    use dwk_discovery::bitcoin::bip32::Xpriv;

    let master = Xpriv::new_master(Network::Regtest, &[42u8; 16]).unwrap();
    let mut test = TestDiscovery::new();

    // fund accounts 0 and 1 of the BIP84 chain before discovery
    let account0 =
        dwk_discovery::standard_account_descriptor(StandardScriptType::P2wpkh, &master, Network::Regtest, 0)
            .unwrap();
    let account1 =
        dwk_discovery::standard_account_descriptor(StandardScriptType::P2wpkh, &master, Network::Regtest, 1)
            .unwrap();
    test.fund(&account0, DescriptorIndex::Ranged(0), 10_000);
    test.fund(&account1, DescriptorIndex::Ranged(5), 20_000);
    test.generate(1);

    let checked = Rc::new(Cell::new(0u32));
    let checked_in_cb = checked.clone();
    let discovered = test
        .discovery
        .fetch_standard_accounts(
            &master,
            StandardAccountsRequest::default()
                .on_account_checking(move |_, _| checked_in_cb.set(checked_in_cb.get() + 1)),
        )
        .unwrap();

    assert_eq!(discovered, vec![account0.clone(), account1.clone()]);
    // per script type: accounts walked until the first unused one
    // p2pkh: 1 check, p2sh-wpkh: 1 check, p2wpkh: 3 checks
    assert_eq!(checked.get(), 5);

    let accounts = test.discovery.get_used_accounts().unwrap();
    assert_eq!(*accounts, vec![account0, account1]);
}

#[test]
fn test_next_index_with_status_filter() {
    let mut test = TestDiscovery::new();
    let descriptor = external();
    test.fund(&descriptor, DescriptorIndex::Ranged(0), 10_000);
    test.generate(1);
    // index 1 funded but only in the mempool
    test.fund(&descriptor, DescriptorIndex::Ranged(1), 10_000);
    test.fetch(&descriptor);

    assert_eq!(
        test.discovery.get_next_index(&descriptor, TxStatus::All).unwrap(),
        2
    );
    assert_eq!(
        test.discovery
            .get_next_index(&descriptor, TxStatus::Confirmed)
            .unwrap(),
        1
    );
}

#[test]
fn test_refetch_of_unchanged_chain_preserves_identity() {
    // the history short-circuit keeps the old tx id list, so a refetch that
    // discovers nothing new leaves every derived view with its old identity
    let mut test = TestDiscovery::new();
    let descriptor = external();
    test.fund(&descriptor, DescriptorIndex::Ranged(0), 10_000);
    test.generate(1);
    test.fetch(&descriptor);

    let criteria = OutputCriteria::descriptor(&descriptor);
    let utxos_before = test.discovery.get_utxos(&criteria).unwrap();
    let history_before = test.discovery.get_history(&criteria).unwrap();

    test.fetch(&descriptor);

    let utxos_after = test.discovery.get_utxos(&criteria).unwrap();
    let history_after = test.discovery.get_history(&criteria).unwrap();
    assert!(Arc::ptr_eq(&utxos_before, &utxos_after));
    assert!(Arc::ptr_eq(&history_before, &history_after));
}

/// Delegates to a [`MemoryExplorer`] but fails a set number of body downloads,
/// simulating a transport that dies between two calls.
struct FlakyExplorer {
    inner: MemoryExplorer,
    failing_tx_calls: u32,
}

impl Explorer for FlakyExplorer {
    fn block_height(&mut self) -> Result<u32, ExplorerError> {
        self.inner.block_height()
    }

    fn tx_history(
        &mut self,
        script_hash: &ScriptHash,
    ) -> Result<Vec<TxHistoryEntry>, ExplorerError> {
        self.inner.tx_history(script_hash)
    }

    fn tx(&mut self, txid: &dwk_discovery::bitcoin::Txid) -> Result<Vec<u8>, ExplorerError> {
        if self.failing_tx_calls > 0 {
            self.failing_tx_calls -= 1;
            return Err(ExplorerError::Protocol("connection reset".into()));
        }
        self.inner.tx(txid)
    }
}

#[test]
fn test_explorer_failure_keeps_partial_progress() {
    let mut inner = MemoryExplorer::new();
    let descriptor = external();
    let script = spk(&descriptor, DescriptorIndex::Ranged(0));
    inner.fund_script(&script, 10_000);
    inner.generate(1);

    // the walk succeeds but the body backfill dies once
    let explorer = FlakyExplorer {
        inner,
        failing_tx_calls: 1,
    };
    let mut discovery = Discovery::new(explorer, Network::Regtest).unwrap();
    let err = discovery
        .fetch(FetchRequest::descriptor(&descriptor))
        .unwrap_err();
    assert!(matches!(err, Error::Explorer(_)));

    // the history recorded before the failure is retained and consistent
    let status = discovery
        .when_fetched(&descriptor, Some(0))
        .unwrap()
        .unwrap();
    assert!(!status.fetching);
    assert!(status.time_fetched > 0);
    assert_eq!(
        discovery.get_next_index(&descriptor, TxStatus::All).unwrap(),
        1
    );
    // the body is still missing, and the engine says so rather than guessing
    assert!(matches!(
        discovery.get_utxos_and_balance(&OutputCriteria::descriptor(&descriptor)),
        Err(Error::MissingTxHex(_))
    ));

    // a retry against a healed transport completes the backfill
    discovery
        .fetch(FetchRequest::descriptor(&descriptor))
        .unwrap();
    let result = discovery
        .get_utxos_and_balance(&OutputCriteria::descriptor(&descriptor))
        .unwrap();
    assert_eq!(result.balance, 10_000);
}

#[test]
fn test_tight_cache_bounds_stay_correct() {
    // with single-entry caches every level keeps evicting, which costs
    // identity stability but never correctness
    let explorer = MemoryExplorer::new();
    let mut discovery = Discovery::with_options(
        explorer,
        Network::Regtest,
        DiscoveryOptions {
            descriptors_cache_size: 1,
            outputs_per_descriptor_cache_size: 1,
        },
    )
    .unwrap();

    let descriptor_a = external();
    let descriptor_b = internal();
    for (descriptor, index, value) in [
        (&descriptor_a, 0u32, 10_000u64),
        (&descriptor_a, 1, 15_000),
        (&descriptor_b, 0, 20_000),
    ] {
        let script = spk(descriptor, DescriptorIndex::Ranged(index));
        discovery.explorer_mut().fund_script(&script, value);
    }
    discovery.explorer_mut().generate(1);
    discovery
        .fetch(FetchRequest::descriptors([
            descriptor_a.clone(),
            descriptor_b.clone(),
        ]))
        .unwrap();

    for _ in 0..3 {
        assert_eq!(
            discovery
                .get_balance(&OutputCriteria::descriptor(&descriptor_a))
                .unwrap(),
            25_000
        );
        assert_eq!(
            discovery
                .get_balance(&OutputCriteria::descriptor(&descriptor_b))
                .unwrap(),
            20_000
        );
    }
}

#[test]
fn test_export_shape() {
    let mut test = TestDiscovery::new();
    let descriptor = format!("pkh({TPUB}/0/0)");
    test.fund(&descriptor, DescriptorIndex::NonRanged, 1_000);
    test.generate(1);
    test.fetch(&descriptor);

    let exported = test.discovery.export().unwrap();
    // versioned envelope, lowercase network tags, string indices, hex bodies
    assert!(exported.contains("\"data_model_version\":\"V1\""));
    assert!(exported.contains("\"regtest\""));
    assert!(exported.contains("\"non-ranged\""));
    assert!(exported.contains("\"tx_hex\""));
}

#[test]
fn test_unused_descriptor_is_fetched_but_empty() {
    let mut test = TestDiscovery::new();
    let descriptor = external();
    test.fetch(&descriptor);

    let status = test.discovery.when_fetched(&descriptor, None).unwrap().unwrap();
    assert!(!status.fetching);
    assert!(status.time_fetched > 0);

    // nothing was found: no used descriptors, no utxos, next index 0
    assert!(test.discovery.get_used_descriptors().unwrap().is_empty());
    let result = test
        .discovery
        .get_utxos_and_balance(&OutputCriteria::descriptor(&descriptor))
        .unwrap();
    assert_eq!((result.utxos.len(), result.balance), (0, 0));
    assert_eq!(
        test.discovery.get_next_index(&descriptor, TxStatus::All).unwrap(),
        0
    );

    // an index query on a non-ranged descriptor is a caller error
    let single = format!("pkh({TPUB}/0/0)");
    assert!(matches!(
        test.discovery.when_fetched(&single, Some(0)),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn test_explicit_index_fetch() {
    let mut test = TestDiscovery::new();
    let descriptor = external();
    test.fund(&descriptor, DescriptorIndex::Ranged(3), 10_000);
    test.generate(1);

    // walk starting from index 2 with a small gap limit
    test.discovery
        .fetch(FetchRequest::descriptor(&descriptor).index(2).gap_limit(5))
        .unwrap();

    let result = test
        .discovery
        .get_utxos_and_balance(&OutputCriteria::descriptor(&descriptor).with_index(3))
        .unwrap();
    assert_eq!(result.balance, 10_000);
    // index 2 was checked and kept (below the used index), index 9 was not
    assert!(test
        .discovery
        .when_fetched(&descriptor, Some(2))
        .unwrap()
        .is_some());
    assert_eq!(test.discovery.when_fetched(&descriptor, Some(9)).unwrap(), None);
    // a never-walked index is rejected rather than read as empty
    assert!(matches!(
        test.discovery
            .get_utxos_and_balance(&OutputCriteria::descriptor(&descriptor).with_index(30)),
        Err(Error::NotFetched { .. })
    ));
}
