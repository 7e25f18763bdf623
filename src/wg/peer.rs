use super::{
    AllowedIp, Endpoint, Key, Transport, dedup_allowed_ips,
    device::Device,
    flags::{PeerFlag, PeerFlags},
};

/// A peer as held by the driver, and as mirrored by the device model.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    // PublicKey
    pub public_key: Key,

    // PresharedKey
    pub preshared_key: Option<Key>,

    // Endpoint
    pub endpoint: Option<Endpoint>,

    // AllowedIPs
    pub allowed_ips: Vec<AllowedIp>,

    // PersistentKeepalive
    pub persistent_keepalive: Option<u16>,

    // LatestHandshake
    pub latest_handshake: Option<u64>,

    // Transfer (rx, tx)
    pub transfer: Option<(u64, u64)>,
}

impl PeerInfo {
    pub fn new(public_key: Key) -> Self {
        Self {
            public_key,
            ..Default::default()
        }
    }
}

/// The per-peer part of a [`DeviceDelta`](super::instance::DeviceDelta).
///
/// The `with_*` builders set a field together with its flag, so a delta
/// never carries a value the driver would ignore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerDelta {
    pub public_key: Key,
    pub flags: PeerFlags,
    pub preshared_key: Option<Key>,
    pub endpoint: Option<Endpoint>,
    pub persistent_keepalive: Option<u16>,
    pub allowed_ips: Vec<AllowedIp>,
}

impl PeerDelta {
    pub fn new(public_key: Key) -> Self {
        Self {
            public_key,
            flags: PeerFlags::empty(),
            preshared_key: None,
            endpoint: None,
            persistent_keepalive: None,
            allowed_ips: Vec::new(),
        }
    }

    pub fn removal(public_key: Key) -> Self {
        Self::new(public_key).with_remove()
    }

    /// Everything needed to create the peer from scratch.
    ///
    /// Allowed IPs, public key and preshared key are always sent; endpoint and
    /// keepalive only when the source has them.
    pub fn creation(peer: &PeerInfo) -> Self {
        let mut delta = Self::new(peer.public_key)
            .with_public_key()
            .with_preshared_key(peer.preshared_key)
            .with_allowed_ips(peer.allowed_ips.iter().copied());

        if let Some(endpoint) = &peer.endpoint {
            delta = delta.with_endpoint(endpoint.clone());
        }

        if peer.persistent_keepalive.is_some() {
            delta = delta.with_persistent_keepalive(peer.persistent_keepalive);
        }

        delta
    }

    pub fn with_remove(mut self) -> Self {
        self.flags.insert(PeerFlag::RemoveMe);
        self
    }

    pub fn with_public_key(mut self) -> Self {
        self.flags.insert(PeerFlag::HasPublicKey);
        self
    }

    pub fn with_preshared_key(mut self, key: Option<Key>) -> Self {
        self.flags.insert(PeerFlag::HasPresharedKey);
        self.preshared_key = key.filter(|k| !k.is_zero());
        self
    }

    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.flags.insert(PeerFlag::HasEndpoint);
        self.endpoint = Some(endpoint);
        self
    }

    pub fn with_persistent_keepalive(mut self, secs: Option<u16>) -> Self {
        self.flags.insert(PeerFlag::HasPersistentKeepaliveInterval);
        self.persistent_keepalive = secs.filter(|s| *s != 0);
        self
    }

    pub fn with_allowed_ips(mut self, ips: impl IntoIterator<Item = AllowedIp>) -> Self {
        self.flags.insert(PeerFlag::ReplaceAllowedIps);
        self.allowed_ips = dedup_allowed_ips(ips);
        self
    }

    pub fn is_removal(&self) -> bool {
        self.flags.contains(PeerFlag::RemoveMe)
    }
}

/// Mutable access to one peer of a [`Device`].
///
/// The handle borrows the device and addresses the peer by its position in
/// the device's collection; it never owns the device. Every mutator stages the
/// change, sends one peer-scoped delta and commits only when the transport
/// accepted it.
pub struct PeerHandle<'a, T: Transport> {
    device: &'a mut Device<T>,
    index: usize,
}

impl<'a, T: Transport> PeerHandle<'a, T> {
    pub(super) fn new(device: &'a mut Device<T>, index: usize) -> Self {
        Self { device, index }
    }

    pub fn info(&self) -> &PeerInfo {
        &self.device.info.peers[self.index]
    }

    pub fn public_key(&self) -> &Key {
        &self.info().public_key
    }

    /// Replaces the whole allowed-IP set; there is no incremental variant.
    pub fn set_allowed_ips(
        &mut self,
        ips: impl IntoIterator<Item = AllowedIp>,
    ) -> Result<&mut Self, T::Error> {
        let delta = PeerDelta::new(*self.public_key()).with_allowed_ips(ips);

        let mut staged = self.info().clone();
        staged.allowed_ips = delta.allowed_ips.clone();

        self.apply(staged, delta)
    }

    /// Changes the peer's identity.
    ///
    /// The driver keys peers by public key, so this removes the old entry and
    /// creates the peer again under `key` with its full state, in one delta.
    /// If `key` already names a sibling, the driver merges into that sibling
    /// and so does the model.
    pub fn set_public_key(&mut self, key: Key) -> Result<&mut Self, T::Error> {
        let old = *self.public_key();

        let mut staged = self.info().clone();
        staged.public_key = key;
        let creation = PeerDelta::creation(&staged)
            .with_persistent_keepalive(staged.persistent_keepalive);

        if key == old {
            self.device.apply_peer(creation)?;
            return Ok(self);
        }
        self.device
            .apply_peers([PeerDelta::removal(old), creation.clone()])?;

        let peers = &mut self.device.info.peers;
        peers.remove(self.index);

        match peers.iter().position(|p| p.public_key == key) {
            Some(index) => {
                log::warn!("peer {old} renamed to existing peer {key}, merging");
                let sibling = &mut peers[index];
                sibling.preshared_key = creation.preshared_key;
                sibling.allowed_ips = creation.allowed_ips;
                sibling.persistent_keepalive = creation.persistent_keepalive;
                if creation.endpoint.is_some() {
                    sibling.endpoint = creation.endpoint;
                }
                self.index = index;
            }
            None => {
                peers.push(PeerInfo {
                    public_key: key,
                    preshared_key: creation.preshared_key,
                    endpoint: creation.endpoint,
                    allowed_ips: creation.allowed_ips,
                    persistent_keepalive: creation.persistent_keepalive,
                    latest_handshake: None,
                    transfer: None,
                });
                self.index = peers.len() - 1;
            }
        }
        log::info!("peer {old} is now {key}");

        Ok(self)
    }

    pub fn set_preshared_key(&mut self, key: Key) -> Result<&mut Self, T::Error> {
        let delta = PeerDelta::new(*self.public_key()).with_preshared_key(Some(key));

        let mut staged = self.info().clone();
        staged.preshared_key = delta.preshared_key;

        self.apply(staged, delta)
    }

    pub fn set_endpoint(&mut self, endpoint: Endpoint) -> Result<&mut Self, T::Error> {
        let delta = PeerDelta::new(*self.public_key()).with_endpoint(endpoint);

        let mut staged = self.info().clone();
        staged.endpoint = delta.endpoint.clone();

        self.apply(staged, delta)
    }

    /// Zero disables keepalive.
    pub fn set_persistent_keepalive(&mut self, secs: u16) -> Result<&mut Self, T::Error> {
        let delta =
            PeerDelta::new(*self.public_key()).with_persistent_keepalive(Some(secs));

        let mut staged = self.info().clone();
        staged.persistent_keepalive = delta.persistent_keepalive;

        self.apply(staged, delta)
    }

    /// Deletes the peer from the driver, then from the device.
    pub fn remove(self) -> Result<(), T::Error> {
        let key = *self.public_key();
        self.device.apply_peer(PeerDelta::removal(key))?;

        self.device.info.peers.remove(self.index);
        log::info!("removed peer {} from {}", key, self.device.name());

        Ok(())
    }

    fn apply(&mut self, staged: PeerInfo, delta: PeerDelta) -> Result<&mut Self, T::Error> {
        self.device.apply_peer(delta)?;
        self.device.info.peers[self.index] = staged;

        Ok(self)
    }
}
