use std::collections::BTreeSet;

/// Device-level change markers carried by a delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeviceFlag {
    /// The peers in the delta are the complete new peer set.
    ReplacePeers,
    HasPrivateKey,
    HasPublicKey,
    HasListenPort,
    HasFwmark,
}

/// Peer-level change markers carried by a peer delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PeerFlag {
    /// Delete the peer; every other field of the delta is ignored.
    RemoveMe,
    ReplaceAllowedIps,
    HasPublicKey,
    HasPresharedKey,
    HasPersistentKeepaliveInterval,
    HasEndpoint,
}

/// A set of pending-change markers.
///
/// Fields of a delta whose marker is absent are left untouched by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flags<F: Ord>(BTreeSet<F>);

impl<F: Ord> Default for Flags<F> {
    fn default() -> Self {
        Flags(BTreeSet::new())
    }
}

impl<F: Ord + Copy> Flags<F> {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, flag: F) {
        self.0.insert(flag);
    }

    pub fn with(mut self, flag: F) -> Self {
        self.insert(flag);
        self
    }

    pub fn contains(&self, flag: F) -> bool {
        self.0.contains(&flag)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = F> + '_ {
        self.0.iter().copied()
    }
}

impl<F: Ord> FromIterator<F> for Flags<F> {
    fn from_iter<I: IntoIterator<Item = F>>(iter: I) -> Self {
        Flags(iter.into_iter().collect())
    }
}

impl<F: Ord + Copy, const N: usize> From<[F; N]> for Flags<F> {
    fn from(flags: [F; N]) -> Self {
        flags.into_iter().collect()
    }
}

pub type DeviceFlags = Flags<DeviceFlag>;
pub type PeerFlags = Flags<PeerFlag>;
