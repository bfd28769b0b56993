use crate::config::coin_type;
use crate::error::Error;
use crate::store::DescriptorIndex;
use crate::util::EC;
use bitcoin::bip32::{ChildNumber, DerivationPath, Xpriv, Xpub};
use bitcoin::{Network, ScriptBuf};
use miniscript::{Descriptor, DescriptorPublicKey};
use std::fmt::Display;
use std::str::FromStr;
use std::sync::Arc;

/// A parsed descriptor together with its canonical text.
///
/// The canonical text (checksummed `to_string` of the parsed descriptor) is
/// the store key: two spellings of the same descriptor collapse to one entry.
#[derive(Debug, Clone)]
pub struct DiscoveryDescriptor {
    inner: Descriptor<DescriptorPublicKey>,
    canonical: Arc<str>,
}

impl Display for DiscoveryDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.canonical, f)
    }
}

impl std::hash::Hash for DiscoveryDescriptor {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.canonical.hash(state);
    }
}

impl PartialEq for DiscoveryDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.canonical == other.canonical
    }
}

impl Eq for DiscoveryDescriptor {}

impl FromStr for DiscoveryDescriptor {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let inner = Descriptor::<DescriptorPublicKey>::from_str(s)?;
        if inner.is_multipath() {
            return Err(Error::InvalidArgument(
                "multipath descriptors are not supported, pass the /0/* and /1/* members separately"
                    .into(),
            ));
        }
        let canonical: Arc<str> = inner.to_string().into();
        Ok(DiscoveryDescriptor { inner, canonical })
    }
}

impl serde::Serialize for DiscoveryDescriptor {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.canonical)
    }
}

impl<'de> serde::Deserialize<'de> for DiscoveryDescriptor {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl DiscoveryDescriptor {
    /// The canonical descriptor text used as store key.
    pub fn canonical(&self) -> &Arc<str> {
        &self.canonical
    }

    /// Whether the descriptor contains a wildcard and thus denotes a range of
    /// outputs.
    pub fn is_ranged(&self) -> bool {
        self.inner.has_wildcard()
    }

    /// The index of the only output slot for a non-ranged descriptor, or the
    /// starting slot of a ranged one.
    pub fn first_index(&self) -> DescriptorIndex {
        if self.is_ranged() {
            DescriptorIndex::Ranged(0)
        } else {
            DescriptorIndex::NonRanged
        }
    }

    /// Derive the script pub key of the output slot at `index`.
    pub fn script_pubkey(&self, index: DescriptorIndex) -> Result<ScriptBuf, Error> {
        let child = match (index, self.is_ranged()) {
            (DescriptorIndex::Ranged(child), true) => child,
            (DescriptorIndex::NonRanged, false) => 0,
            (DescriptorIndex::Ranged(_), false) => {
                return Err(Error::InvalidArgument(format!(
                    "index given for non-ranged descriptor {}",
                    self.canonical
                )))
            }
            (DescriptorIndex::NonRanged, true) => {
                return Err(Error::InvalidArgument(format!(
                    "ranged descriptor {} needs an index",
                    self.canonical
                )))
            }
        };
        let derived = self
            .inner
            .at_derivation_index(child)?
            .derived_descriptor(&EC)?;
        Ok(derived.script_pubkey())
    }
}

/// Normalize descriptor text to its canonical, checksummed form. Idempotent.
pub fn canonicalize(descriptor: &str) -> Result<String, Error> {
    Ok(descriptor.parse::<DiscoveryDescriptor>()?.to_string())
}

fn strip_checksum(descriptor: &str) -> &str {
    descriptor.split('#').next().unwrap_or(descriptor)
}

/// The external-branch (`/0/*`) representative of the `{/0/*, /1/*}` pair a
/// descriptor belongs to, or `None` when the descriptor has neither branch.
pub(crate) fn account_of(canonical: &str) -> Option<String> {
    if canonical.contains("/0/*") {
        Some(canonical.to_string())
    } else if canonical.contains("/1/*") {
        let external = strip_checksum(canonical).replace("/1/*", "/0/*");
        canonicalize(&external).ok()
    } else {
        None
    }
}

/// The `(external, internal)` descriptor pair of an account.
pub fn account_descriptors(account: &str) -> Result<(String, String), Error> {
    let external = canonicalize(account)?;
    if !external.contains("/0/*") {
        return Err(Error::InvalidArgument(format!(
            "'{account}' is not an account: missing /0/* key path"
        )));
    }
    let internal = canonicalize(&strip_checksum(&external).replace("/0/*", "/1/*"))?;
    Ok((external, internal))
}

/// The three standard singlesig script types walked by
/// [`crate::Discovery::fetch_standard_accounts()`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StandardScriptType {
    /// BIP44 legacy `pkh`.
    P2pkh,
    /// BIP49 nested segwit `sh(wpkh)`.
    P2shWpkh,
    /// BIP84 native segwit `wpkh`.
    P2wpkh,
}

impl StandardScriptType {
    pub const ALL: [StandardScriptType; 3] = [
        StandardScriptType::P2pkh,
        StandardScriptType::P2shWpkh,
        StandardScriptType::P2wpkh,
    ];

    fn purpose(&self) -> u32 {
        match self {
            StandardScriptType::P2pkh => 44,
            StandardScriptType::P2shWpkh => 49,
            StandardScriptType::P2wpkh => 84,
        }
    }
}

/// Build the external account descriptor of a standard script type, with the
/// key origin of the master node.
pub fn standard_account_descriptor(
    script_type: StandardScriptType,
    master: &Xpriv,
    network: Network,
    account: u32,
) -> Result<String, Error> {
    let purpose = script_type.purpose();
    let coin = coin_type(network);
    let path = DerivationPath::from(vec![
        ChildNumber::from_hardened_idx(purpose)?,
        ChildNumber::from_hardened_idx(coin)?,
        ChildNumber::from_hardened_idx(account)?,
    ]);
    let account_xpub = Xpub::from_priv(&EC, &master.derive_priv(&EC, &path)?);
    let origin = format!("[{}/{purpose}'/{coin}'/{account}']", master.fingerprint(&EC));
    let key = format!("{origin}{account_xpub}/0/*");
    let descriptor = match script_type {
        StandardScriptType::P2pkh => format!("pkh({key})"),
        StandardScriptType::P2shWpkh => format!("sh(wpkh({key}))"),
        StandardScriptType::P2wpkh => format!("wpkh({key})"),
    };
    canonicalize(&descriptor)
}
