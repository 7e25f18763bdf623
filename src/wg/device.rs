use std::net::IpAddr;

use super::{
    AddressFamily, InterfaceAddress, Key, Transport,
    instance::{DeviceDelta, DeviceInfo},
    peer::{PeerDelta, PeerHandle, PeerInfo},
};

/// The configuration model of one WireGuard interface.
///
/// Every setter sends exactly one delta through the transport and updates
/// the local mirror only after the transport accepted it, so a failed call
/// leaves the model as it was.
pub struct Device<T: Transport> {
    pub(super) transport: T,
    pub(super) info: DeviceInfo,
}

impl<T: Transport> Device<T> {
    /// Binds to an interface that already exists.
    pub fn open(transport: T, name: &str) -> Result<Self, T::Error> {
        let info = transport.read_device(name)?;
        log::debug!("opened {} with {} peers", info.name, info.peers.len());

        Ok(Self::from_info(transport, info))
    }

    /// Creates a fresh interface and binds to it.
    pub fn create(mut transport: T, name: &str) -> Result<Self, T::Error> {
        transport.create_interface(name)?;
        log::info!("created interface {name}");

        Self::open(transport, name)
    }

    pub fn from_info(transport: T, info: DeviceInfo) -> Self {
        Self { transport, info }
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn ifindex(&self) -> u32 {
        self.info.ifindex
    }

    pub fn public_key(&self) -> Option<&Key> {
        self.info.public_key.as_ref()
    }

    pub fn private_key(&self) -> Option<&Key> {
        self.info.private_key.as_ref()
    }

    pub fn listen_port(&self) -> Option<u16> {
        self.info.listen_port
    }

    pub fn fwmark(&self) -> Option<u32> {
        self.info.fwmark
    }

    /// Peers in creation order.
    pub fn peers(&self) -> &[PeerInfo] {
        &self.info.peers
    }

    pub fn peer(&self, key: &Key) -> Option<&PeerInfo> {
        self.info.peer(key)
    }

    pub fn peer_mut(&mut self, key: &Key) -> Option<PeerHandle<'_, T>> {
        let index = self.info.peers.iter().position(|p| &p.public_key == key)?;
        Some(PeerHandle::new(self, index))
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// OS-level addresses, read through on every call.
    pub fn get_interface_address(&self) -> Result<Vec<InterfaceAddress>, T::Error> {
        self.transport.get_interface_address(&self.info.name)
    }

    pub fn set_interface_address(
        &mut self,
        family: AddressFamily,
        ip: IpAddr,
    ) -> Result<&mut Self, T::Error> {
        self.transport
            .set_interface_address(&self.info.name, &InterfaceAddress { family, ip })?;
        log::info!("assigned {family} {ip} to {}", self.info.name);

        Ok(self)
    }

    pub fn set_public_key(&mut self, key: Key) -> Result<&mut Self, T::Error> {
        self.apply(DeviceDelta::new(&self.info.name).with_public_key(key))?;
        self.info.public_key = Some(key);

        Ok(self)
    }

    /// Sets the private key. The public key follows it, derived the same way
    /// the driver does; the zero key clears both.
    pub fn set_private_key(&mut self, key: Key) -> Result<&mut Self, T::Error> {
        self.apply(DeviceDelta::new(&self.info.name).with_private_key(key))?;

        let key = Some(key).filter(|k| !k.is_zero());
        self.info.private_key = key;
        self.info.public_key = key.as_ref().map(Key::public_key);

        Ok(self)
    }

    pub fn set_fwmark(&mut self, fwmark: u32) -> Result<&mut Self, T::Error> {
        self.apply(DeviceDelta::new(&self.info.name).with_fwmark(fwmark))?;
        self.info.fwmark = Some(fwmark).filter(|m| *m != 0);

        Ok(self)
    }

    pub fn set_listen_port(&mut self, port: u16) -> Result<&mut Self, T::Error> {
        self.apply(DeviceDelta::new(&self.info.name).with_listen_port(port))?;
        self.info.listen_port = Some(port);

        Ok(self)
    }

    /// Creates a peer with its allowed IPs, public and preshared key fully
    /// specified in a single delta.
    ///
    /// If a peer with the same key is already known the driver merges into
    /// it, and so does the model.
    pub fn add_peer(&mut self, source: PeerInfo) -> Result<&mut Self, T::Error> {
        let delta = PeerDelta::creation(&source);
        self.apply_peer(delta.clone())?;

        let peer = PeerInfo {
            public_key: delta.public_key,
            preshared_key: delta.preshared_key,
            endpoint: delta.endpoint,
            allowed_ips: delta.allowed_ips,
            persistent_keepalive: delta.persistent_keepalive,
            latest_handshake: None,
            transfer: None,
        };

        match self.info.peers.iter_mut().find(|p| p.public_key == peer.public_key) {
            Some(existing) => {
                log::debug!("peer {} already present, replacing", peer.public_key);
                *existing = peer;
            }
            None => {
                log::info!("added peer {} to {}", peer.public_key, self.info.name);
                self.info.peers.push(peer);
            }
        }

        Ok(self)
    }

    /// Makes `sources` the complete peer set, dropping every other peer.
    pub fn replace_peers(
        &mut self,
        sources: impl IntoIterator<Item = PeerInfo>,
    ) -> Result<&mut Self, T::Error> {
        let mut peers: Vec<PeerInfo> = Vec::new();
        for source in sources {
            match peers.iter_mut().find(|p| p.public_key == source.public_key) {
                Some(existing) => *existing = source,
                None => peers.push(source),
            }
        }

        // peers that stay keep driver state we do not send, so keepalive is explicit
        let delta = DeviceDelta::new(&self.info.name).replacing_peers(
            peers
                .iter()
                .map(|p| PeerDelta::creation(p).with_persistent_keepalive(p.persistent_keepalive)),
        );
        self.apply(delta)?;

        log::info!("replaced peers of {}, now {}", self.info.name, peers.len());
        self.info.peers = peers
            .into_iter()
            .map(|p| PeerInfo {
                allowed_ips: super::dedup_allowed_ips(p.allowed_ips),
                preshared_key: p.preshared_key.filter(|k| !k.is_zero()),
                persistent_keepalive: p.persistent_keepalive.filter(|s| *s != 0),
                latest_handshake: None,
                transfer: None,
                ..p
            })
            .collect();

        Ok(self)
    }

    /// Replaces the local mirror with what the driver currently holds.
    pub fn refresh(&mut self) -> Result<&mut Self, T::Error> {
        self.info = self.transport.read_device(&self.info.name)?;
        Ok(self)
    }

    /// Destroys the interface. The device cannot be used afterwards.
    pub fn remove(mut self) -> Result<(), T::Error> {
        self.transport.destroy_interface(&self.info.name)?;
        log::info!("destroyed interface {}", self.info.name);

        Ok(())
    }

    /// Sends a delta that only concerns `peer`.
    pub(super) fn apply_peer(&mut self, peer: PeerDelta) -> Result<(), T::Error> {
        self.apply_peers([peer])
    }

    /// Sends one delta carrying several peer changes and no device fields.
    pub(super) fn apply_peers(
        &mut self,
        peers: impl IntoIterator<Item = PeerDelta>,
    ) -> Result<(), T::Error> {
        let delta = peers
            .into_iter()
            .fold(DeviceDelta::new(&self.info.name), DeviceDelta::with_peer);
        self.apply(delta)
    }

    fn apply(&mut self, delta: DeviceDelta) -> Result<(), T::Error> {
        log::debug!(
            "applying to {}: flags {:?}, {} peer deltas",
            delta.name,
            delta.flags,
            delta.peers.len()
        );

        self.transport.apply_device(&delta)
    }
}

impl<T: Transport> std::fmt::Debug for Device<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.info.name)
            .field("ifindex", &self.info.ifindex)
            .field("listen_port", &self.info.listen_port)
            .field("fwmark", &self.info.fwmark)
            .field("peers", &self.info.peers.len())
            .finish()
    }
}
