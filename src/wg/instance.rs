use std::fmt;

use super::{
    Key,
    flags::{DeviceFlag, DeviceFlags},
    peer::{PeerDelta, PeerInfo},
};

/// A full read-back of one interface and its peers.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,

    pub ifindex: u32,

    // PrivateKey
    pub private_key: Option<Key>,

    // derived from PrivateKey
    pub public_key: Option<Key>,

    // ListenPort
    pub listen_port: Option<u16>,

    // FwMark
    pub fwmark: Option<u32>,

    pub peers: Vec<PeerInfo>,
}

impl DeviceInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn peer(&self, key: &Key) -> Option<&PeerInfo> {
        self.peers.iter().find(|p| &p.public_key == key)
    }
}

/// Renders the device in configuration-file form.
impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "[Interface]")?;
        if let Some(key) = &self.private_key {
            writeln!(f, "PrivateKey = {key}")?;
        }
        if let Some(port) = self.listen_port {
            writeln!(f, "ListenPort = {port}")?;
        }
        if let Some(mark) = self.fwmark {
            writeln!(f, "FwMark = {mark:#x}")?;
        }

        for peer in &self.peers {
            writeln!(f)?;
            writeln!(f, "[Peer]")?;
            writeln!(f, "PublicKey = {}", peer.public_key)?;
            if let Some(key) = &peer.preshared_key {
                writeln!(f, "PresharedKey = {key}")?;
            }
            if !peer.allowed_ips.is_empty() {
                writeln!(f, "AllowedIPs = {}", join(&peer.allowed_ips))?;
            }
            if let Some(endpoint) = &peer.endpoint {
                writeln!(f, "Endpoint = {endpoint}")?;
            }
            if let Some(secs) = peer.persistent_keepalive {
                writeln!(f, "PersistentKeepalive = {secs}")?;
            }
        }

        Ok(())
    }
}

/// A partial update of one interface.
///
/// Scalar fields are only meaningful when their flag is set; the `with_*`
/// builders keep the two in step. Peers listed here are touched according
/// to their own flags, peers not listed are left alone unless
/// [`DeviceFlag::ReplacePeers`] is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDelta {
    pub name: String,
    pub flags: DeviceFlags,
    pub private_key: Option<Key>,
    pub public_key: Option<Key>,
    pub listen_port: Option<u16>,
    pub fwmark: Option<u32>,
    pub peers: Vec<PeerDelta>,
}

impl DeviceDelta {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            flags: DeviceFlags::empty(),
            private_key: None,
            public_key: None,
            listen_port: None,
            fwmark: None,
            peers: Vec::new(),
        }
    }

    pub fn with_private_key(mut self, key: Key) -> Self {
        self.flags.insert(DeviceFlag::HasPrivateKey);
        self.private_key = Some(key);
        self
    }

    pub fn with_public_key(mut self, key: Key) -> Self {
        self.flags.insert(DeviceFlag::HasPublicKey);
        self.public_key = Some(key);
        self
    }

    pub fn with_listen_port(mut self, port: u16) -> Self {
        self.flags.insert(DeviceFlag::HasListenPort);
        self.listen_port = Some(port);
        self
    }

    pub fn with_fwmark(mut self, fwmark: u32) -> Self {
        self.flags.insert(DeviceFlag::HasFwmark);
        self.fwmark = Some(fwmark);
        self
    }

    pub fn with_peer(mut self, peer: PeerDelta) -> Self {
        self.peers.push(peer);
        self
    }

    /// Makes `peers` the complete peer set of the device.
    pub fn replacing_peers(mut self, peers: impl IntoIterator<Item = PeerDelta>) -> Self {
        self.flags.insert(DeviceFlag::ReplacePeers);
        self.peers = peers.into_iter().collect();
        self
    }

    pub fn replaces_peers(&self) -> bool {
        self.flags.contains(DeviceFlag::ReplacePeers)
    }
}

fn join<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
