use base64::prelude::*;
use config::ParseError;
use instance::{DeviceDelta, DeviceInfo};
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    str::FromStr,
};
use x25519_dalek::{PublicKey, StaticSecret};

pub mod cmd;
pub mod config;
pub mod device;
pub mod flags;
pub mod instance;
pub mod memory;
pub mod peer;

pub const KEY_LEN: usize = 32;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key([u8; KEY_LEN]);

impl AsRef<[u8]> for Key {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; KEY_LEN]> for Key {
    fn from(bytes: [u8; KEY_LEN]) -> Self {
        Key(bytes)
    }
}

impl FromStr for Key {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // one spare byte so that over-long input is reported as a length error
        let mut inner = [0u8; KEY_LEN + 1];
        let len = BASE64_STANDARD.decode_slice(s.trim(), &mut inner)?;
        if len != KEY_LEN {
            return Err(ParseError::KeyLength(len));
        }

        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&inner[..KEY_LEN]);
        Ok(Key(key))
    }
}

impl Key {
    pub fn random() -> Key {
        Key(rand::random())
    }

    /// The all-zero key, which the driver reads as "no key".
    pub const fn zero() -> Key {
        Key([0; KEY_LEN])
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// The public key of this private key, as the driver derives it.
    pub fn public_key(&self) -> Key {
        let secret = StaticSecret::from(self.0);
        Key(PublicKey::from(&secret).to_bytes())
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", BASE64_STANDARD.encode(self.0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AddressFamily {
    Inet,
    Inet6,
}

impl AddressFamily {
    pub fn of(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => AddressFamily::Inet,
            IpAddr::V6(_) => AddressFamily::Inet6,
        }
    }

    pub fn max_prefix(&self) -> u8 {
        match self {
            AddressFamily::Inet => 32,
            AddressFamily::Inet6 => 128,
        }
    }
}

impl std::fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AddressFamily::Inet => write!(f, "inet"),
            AddressFamily::Inet6 => write!(f, "inet6"),
        }
    }
}

/// A destination prefix routed to a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AllowedIp {
    pub addr: IpAddr,
    pub cidr: u8,
}

impl AllowedIp {
    pub fn new(addr: impl Into<IpAddr>, cidr: u8) -> Self {
        Self {
            addr: addr.into(),
            cidr,
        }
    }

    pub fn family(&self) -> AddressFamily {
        AddressFamily::of(&self.addr)
    }
}

impl Default for AllowedIp {
    fn default() -> Self {
        Self {
            addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            cidr: 0,
        }
    }
}

impl FromStr for AllowedIp {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, cidr) = s.split_once('/').unwrap_or((s, ""));
        let addr: IpAddr = addr.trim().parse()?;
        let cidr = cidr.trim();

        let cidr = if !cidr.is_empty() {
            cidr.parse()?
        } else {
            AddressFamily::of(&addr).max_prefix()
        };

        Ok(AllowedIp { addr, cidr })
    }
}

impl std::fmt::Display for AllowedIp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.addr, self.cidr)
    }
}

/// Drops repeated (family, address, prefix) entries, keeping first occurrences in order.
pub fn dedup_allowed_ips(ips: impl IntoIterator<Item = AllowedIp>) -> Vec<AllowedIp> {
    let mut out: Vec<AllowedIp> = Vec::new();
    for ip in ips {
        if !out.contains(&ip) {
            out.push(ip);
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Domain(String),
    Ip(SocketAddr),
}

impl From<String> for Endpoint {
    fn from(v: String) -> Self {
        Self::Domain(v)
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(v: SocketAddr) -> Self {
        Self::Ip(v)
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Domain(dom) => write!(f, "{dom}"),
            Endpoint::Ip(addr) => write!(f, "{addr}"),
        }
    }
}

impl FromStr for Endpoint {
    type Err = ParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if !s.contains(':') {
            return Err(ParseError::Expected(':'));
        }

        Ok(if let Ok(addr) = s.parse() {
            Self::Ip(addr)
        } else {
            Self::Domain(s.to_string())
        })
    }
}

/// An OS-level address assigned to the interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InterfaceAddress {
    pub family: AddressFamily,
    pub ip: IpAddr,
}

impl From<IpAddr> for InterfaceAddress {
    fn from(ip: IpAddr) -> Self {
        Self {
            family: AddressFamily::of(&ip),
            ip,
        }
    }
}

/// The boundary to whatever actually applies configuration to the driver.
///
/// Every call is synchronous and expected to be atomic. Implementations own
/// all validation; the model forwards values as given.
pub trait Transport {
    type Error;

    fn create_interface(&mut self, name: &str) -> Result<(), Self::Error>;
    fn destroy_interface(&mut self, name: &str) -> Result<(), Self::Error>;
    fn list_interface_names(&self) -> Result<Vec<String>, Self::Error>;

    fn read_device(&self, name: &str) -> Result<DeviceInfo, Self::Error>;
    fn apply_device(&mut self, delta: &DeviceDelta) -> Result<(), Self::Error>;

    fn generate_private_key(&self) -> Result<Key, Self::Error>;
    fn generate_public_key(&self, private_key: &Key) -> Result<Key, Self::Error>;
    fn generate_preshared_key(&self) -> Result<Key, Self::Error>;

    fn get_interface_address(&self, name: &str) -> Result<Vec<InterfaceAddress>, Self::Error>;
    fn set_interface_address(
        &mut self,
        name: &str,
        address: &InterfaceAddress,
    ) -> Result<(), Self::Error>;
}

impl<B: Transport + ?Sized> Transport for &mut B {
    type Error = B::Error;

    fn create_interface(&mut self, name: &str) -> Result<(), Self::Error> {
        (**self).create_interface(name)
    }

    fn destroy_interface(&mut self, name: &str) -> Result<(), Self::Error> {
        (**self).destroy_interface(name)
    }

    fn list_interface_names(&self) -> Result<Vec<String>, Self::Error> {
        (**self).list_interface_names()
    }

    fn read_device(&self, name: &str) -> Result<DeviceInfo, Self::Error> {
        (**self).read_device(name)
    }

    fn apply_device(&mut self, delta: &DeviceDelta) -> Result<(), Self::Error> {
        (**self).apply_device(delta)
    }

    fn generate_private_key(&self) -> Result<Key, Self::Error> {
        (**self).generate_private_key()
    }

    fn generate_public_key(&self, private_key: &Key) -> Result<Key, Self::Error> {
        (**self).generate_public_key(private_key)
    }

    fn generate_preshared_key(&self) -> Result<Key, Self::Error> {
        (**self).generate_preshared_key()
    }

    fn get_interface_address(&self, name: &str) -> Result<Vec<InterfaceAddress>, Self::Error> {
        (**self).get_interface_address(name)
    }

    fn set_interface_address(
        &mut self,
        name: &str,
        address: &InterfaceAddress,
    ) -> Result<(), Self::Error> {
        (**self).set_interface_address(name, address)
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, Ipv6Addr};

    use super::*;

    #[test]
    fn test_key_parse() {
        let key = Key::random();
        let parsed: Key = key.to_string().parse().unwrap();
        assert_eq!(key, parsed);

        assert!(matches!(
            "AAAA".parse::<Key>(),
            Err(ParseError::KeyLength(3))
        ));
        assert!("not base64!".parse::<Key>().is_err());
        assert!(Key::zero().is_zero());
        assert_eq!(
            Key::zero().to_string(),
            "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA="
        );
    }

    fn hex_key(hex: &str) -> Key {
        let mut bytes = [0u8; KEY_LEN];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).unwrap();
        }
        Key::from(bytes)
    }

    #[test]
    fn test_public_key_derivation() {
        // RFC 7748, section 6.1
        let private = hex_key("77076d0a7318a57d3c16c17251b26645df4c2f87ebc0992ab177fba51db92c2a");
        let public = hex_key("8520f0098930a754748b7ddcb43ef75a0dbf3a0d26381af4eba4a98eaa9b4e6a");
        assert_eq!(private.public_key(), public);
    }

    #[test]
    fn test_allowed_ip_parse() {
        let ip: AllowedIp = "10.0.0.0/24".parse().unwrap();
        assert_eq!(ip, AllowedIp::new(Ipv4Addr::new(10, 0, 0, 0), 24));
        assert_eq!(ip.family(), AddressFamily::Inet);

        let ip: AllowedIp = " 10.0.0.2 ".parse().unwrap();
        assert_eq!(ip.cidr, 32);

        let ip: AllowedIp = "fd00::1".parse().unwrap();
        assert_eq!(ip, AllowedIp::new(Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 1), 128));
        assert_eq!(ip.family(), AddressFamily::Inet6);

        assert!("10.0.0.0/abc".parse::<AllowedIp>().is_err());
        assert!("host/24".parse::<AllowedIp>().is_err());
    }

    #[test]
    fn test_dedup_allowed_ips() {
        let a = AllowedIp::new(Ipv4Addr::new(10, 0, 0, 2), 32);
        let b = AllowedIp::new(Ipv4Addr::new(10, 0, 0, 2), 24);
        assert_eq!(dedup_allowed_ips([a, b, a]), vec![a, b]);
    }

    #[test]
    fn test_endpoint_parse() {
        assert_eq!(
            "192.168.0.1:8080".parse::<Endpoint>().unwrap(),
            Endpoint::Ip("192.168.0.1:8080".parse().unwrap())
        );
        assert_eq!(
            "example.com:51820".parse::<Endpoint>().unwrap(),
            Endpoint::Domain("example.com:51820".to_string())
        );
        assert!("example.com".parse::<Endpoint>().is_err());
    }
}
