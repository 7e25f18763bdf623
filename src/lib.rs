//! Configure a WireGuard interface and its peers through partial updates.
//!
//! A [`Device`] mirrors one interface. Each setter turns into a single
//! flag-tagged [`DeviceDelta`] handed to a [`Transport`], and the mirror is
//! only updated once the transport has accepted the delta.
//!
//! ```no_run
//! use wg_delta::{Device, Transport, wg::{cmd::WgCmdBackend, peer::PeerInfo}};
//!
//! # fn main() -> Result<(), wg_delta::Error> {
//! let backend = WgCmdBackend::new();
//! let psk = backend.generate_preshared_key()?;
//! let private = backend.generate_private_key()?;
//! let peer_key = backend.generate_public_key(&backend.generate_private_key()?)?;
//!
//! let mut device = Device::create(backend, "wgtest0")?;
//! device
//!     .set_interface_address(wg_delta::AddressFamily::Inet, "10.0.0.1".parse().unwrap())?
//!     .set_listen_port(1234)?
//!     .set_private_key(private)?
//!     .add_peer(PeerInfo {
//!         preshared_key: Some(psk),
//!         endpoint: Some("192.168.0.1:8080".parse()?),
//!         allowed_ips: vec!["10.0.0.2/32".parse()?],
//!         persistent_keepalive: Some(30),
//!         ..PeerInfo::new(peer_key)
//!     })?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod wg;

pub use error::Error;
pub use wg::{
    AddressFamily, AllowedIp, Endpoint, InterfaceAddress, Key, Transport,
    device::Device,
    flags::{DeviceFlag, PeerFlag},
    instance::{DeviceDelta, DeviceInfo},
    peer::{PeerDelta, PeerHandle, PeerInfo},
};
