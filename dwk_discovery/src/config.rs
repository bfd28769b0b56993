use bitcoin::Network;

/// Default number of consecutive unused indices after which a ranged walk stops.
pub const DEFAULT_GAP_LIMIT: u32 = 20;

/// Cache bounds for the derivation layer.
///
/// `descriptors_cache_size` limits how many distinct descriptors keep memoized
/// views at any level keyed by descriptor; `outputs_per_descriptor_cache_size`
/// limits the distinct indices kept beneath a single descriptor. Levels keyed
/// by network or transaction status are unbounded since their domain is small.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryOptions {
    pub descriptors_cache_size: usize,
    pub outputs_per_descriptor_cache_size: usize,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            descriptors_cache_size: 1000,
            outputs_per_descriptor_cache_size: 10_000,
        }
    }
}

/// The BIP44 coin type of the network, used when building standard account
/// descriptors.
pub fn coin_type(network: Network) -> u32 {
    match network {
        Network::Bitcoin => 0,
        _ => 1,
    }
}
