//! An in-process stand-in for the kernel driver.
//!
//! Applies deltas with the same rules the driver uses, which makes it the
//! backend for tests and for dry runs.

use std::collections::BTreeMap;

use crate::error::Error;

use super::{
    InterfaceAddress, Key, Transport,
    flags::{DeviceFlag, PeerFlag},
    instance::{DeviceDelta, DeviceInfo},
    peer::{PeerDelta, PeerInfo},
};

#[derive(Debug, Default, Clone)]
struct Interface {
    device: DeviceInfo,
    addresses: Vec<InterfaceAddress>,
}

#[derive(Debug, Default, Clone)]
pub struct MemoryBackend {
    interfaces: BTreeMap<String, Interface>,
    next_ifindex: u32,
    applied: usize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of deltas accepted so far.
    pub fn applied(&self) -> usize {
        self.applied
    }

    fn interface(&self, name: &str) -> Result<&Interface, Error> {
        self.interfaces
            .get(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    fn interface_mut(&mut self, name: &str) -> Result<&mut Interface, Error> {
        self.interfaces
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }
}

fn validate_peer(delta: &PeerDelta) -> Result<(), Error> {
    for ip in &delta.allowed_ips {
        if ip.cidr > ip.family().max_prefix() {
            return Err(Error::Rejected(format!(
                "allowed ip {ip} of peer {} exceeds the {} prefix limit",
                delta.public_key,
                ip.family()
            )));
        }
    }

    Ok(())
}

fn apply_peer(peers: &mut Vec<PeerInfo>, delta: &PeerDelta) {
    let index = peers.iter().position(|p| p.public_key == delta.public_key);

    if delta.is_removal() {
        if let Some(index) = index {
            peers.remove(index);
        }
        return;
    }

    let peer = match index {
        Some(index) => &mut peers[index],
        None => {
            peers.push(PeerInfo::new(delta.public_key));
            let last = peers.len() - 1;
            &mut peers[last]
        }
    };

    if delta.flags.contains(PeerFlag::HasPresharedKey) {
        peer.preshared_key = delta.preshared_key;
    }
    if delta.flags.contains(PeerFlag::HasEndpoint) {
        peer.endpoint = delta.endpoint.clone();
    }
    if delta.flags.contains(PeerFlag::HasPersistentKeepaliveInterval) {
        peer.persistent_keepalive = delta.persistent_keepalive;
    }
    if delta.flags.contains(PeerFlag::ReplaceAllowedIps) {
        peer.allowed_ips = delta.allowed_ips.clone();
    }
}

impl Transport for MemoryBackend {
    type Error = Error;

    fn create_interface(&mut self, name: &str) -> Result<(), Self::Error> {
        if self.interfaces.contains_key(name) {
            return Err(Error::AlreadyExists(name.to_string()));
        }

        self.next_ifindex += 1;
        let mut device = DeviceInfo::new(name);
        device.ifindex = self.next_ifindex;

        self.interfaces.insert(
            name.to_string(),
            Interface {
                device,
                addresses: Vec::new(),
            },
        );
        Ok(())
    }

    fn destroy_interface(&mut self, name: &str) -> Result<(), Self::Error> {
        self.interfaces
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    fn list_interface_names(&self) -> Result<Vec<String>, Self::Error> {
        Ok(self.interfaces.keys().cloned().collect())
    }

    fn read_device(&self, name: &str) -> Result<DeviceInfo, Self::Error> {
        Ok(self.interface(name)?.device.clone())
    }

    fn apply_device(&mut self, delta: &DeviceDelta) -> Result<(), Self::Error> {
        for peer in &delta.peers {
            validate_peer(peer)?;
        }

        let device = &mut self.interface_mut(&delta.name)?.device;

        if delta.flags.contains(DeviceFlag::HasPrivateKey) {
            device.private_key = delta.private_key.filter(|k| !k.is_zero());
            device.public_key = device.private_key.as_ref().map(Key::public_key);
        }
        if delta.flags.contains(DeviceFlag::HasPublicKey) && !delta.flags.contains(DeviceFlag::HasPrivateKey) {
            device.public_key = delta.public_key;
        }
        if delta.flags.contains(DeviceFlag::HasListenPort) {
            device.listen_port = delta.listen_port;
        }
        if delta.flags.contains(DeviceFlag::HasFwmark) {
            device.fwmark = delta.fwmark.filter(|m| *m != 0);
        }
        if delta.flags.contains(DeviceFlag::ReplacePeers) {
            device.peers.clear();
        }

        for peer in &delta.peers {
            apply_peer(&mut device.peers, peer);
        }

        self.applied += 1;
        Ok(())
    }

    fn generate_private_key(&self) -> Result<Key, Self::Error> {
        let mut bytes: [u8; 32] = rand::random();
        bytes[0] &= 248;
        bytes[31] = (bytes[31] & 127) | 64;
        Ok(Key::from(bytes))
    }

    fn generate_public_key(&self, private_key: &Key) -> Result<Key, Self::Error> {
        Ok(private_key.public_key())
    }

    fn generate_preshared_key(&self) -> Result<Key, Self::Error> {
        Ok(Key::random())
    }

    fn get_interface_address(&self, name: &str) -> Result<Vec<InterfaceAddress>, Self::Error> {
        Ok(self.interface(name)?.addresses.clone())
    }

    fn set_interface_address(
        &mut self,
        name: &str,
        address: &InterfaceAddress,
    ) -> Result<(), Self::Error> {
        if address.family != InterfaceAddress::from(address.ip).family {
            return Err(Error::Rejected(format!(
                "{} is not an {} address",
                address.ip, address.family
            )));
        }

        let addresses = &mut self.interface_mut(name)?.addresses;
        if !addresses.contains(address) {
            addresses.push(*address);
        }
        Ok(())
    }
}
