use std::{
    fs,
    io::Write,
    net::IpAddr,
    path::PathBuf,
    process::{Command, Stdio},
};

use crate::error::Error;

use super::{
    AllowedIp, InterfaceAddress, Key, Transport,
    config::{Mark, ParseError},
    flags::{DeviceFlag, PeerFlag},
    instance::{DeviceDelta, DeviceInfo},
    peer::PeerInfo,
};

const NONE: &str = "(none)";

/// Drives the stock `wg` and `ip` tools.
pub struct WgCmdBackend;
impl WgCmdBackend {
    pub fn new() -> Self {
        Self
    }

    fn run(program: &str, args: &[&str], stdin: Option<&[u8]>) -> Result<String, Error> {
        log::debug!("running {} {}", program, args.join(" "));

        let mut child = Command::new(program)
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input)?;
        }

        let out = child.wait_with_output()?;
        if !out.status.success() {
            return Err(Error::Command {
                program: format!("{} {}", program, args.first().unwrap_or(&"")),
                code: out.status.code(),
                stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }

    fn wg(args: &[&str]) -> Result<String, Error> {
        Self::run("wg", args, None)
    }

    fn ip(args: &[&str]) -> Result<String, Error> {
        Self::run("ip", args, None)
    }

    fn ifindex(name: &str) -> Result<u32, Error> {
        let raw = fs::read_to_string(format!("/sys/class/net/{name}/ifindex"))?;
        Ok(parse_ifindex(&raw)?)
    }
}

impl Default for WgCmdBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// A key written to an owner-only file for the lifetime of one command.
struct SecretFile(PathBuf);

impl SecretFile {
    fn write(key: &Key) -> Result<Self, Error> {
        let path = std::env::temp_dir().join(format!("wg-delta-{}.key", uuid::Uuid::new_v4()));

        let mut options = fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut out = options.open(&path)?;
        let file = SecretFile(path);
        writeln!(out, "{key}")?;

        Ok(file)
    }

    fn path(&self) -> String {
        self.0.to_string_lossy().into_owned()
    }
}

impl Drop for SecretFile {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.0) {
            log::warn!("could not remove {}: {err}", self.0.display());
        }
    }
}

/// Translates a delta into `wg set` arguments.
///
/// `key_file` turns a key into a path `wg` can read it from. Absent keys
/// map to `/dev/null`, which `wg` reads as "clear". `existing` lists the
/// peers on the interface; a peer-replacing delta removes those it does
/// not name, leaving interface settings alone.
fn set_args(
    delta: &DeviceDelta,
    existing: &[Key],
    mut key_file: impl FnMut(&Key) -> Result<String, Error>,
) -> Result<Vec<String>, Error> {
    let mut args = vec!["set".to_string(), delta.name.clone()];
    let mut key_arg = |key: Option<&Key>| match key.filter(|k| !k.is_zero()) {
        Some(key) => key_file(key),
        None => Ok("/dev/null".to_string()),
    };

    if delta.flags.contains(DeviceFlag::HasPrivateKey) {
        args.push("private-key".into());
        args.push(key_arg(delta.private_key.as_ref())?);
    } else if delta.flags.contains(DeviceFlag::HasPublicKey) {
        return Err(Error::Rejected(format!(
            "{}: the public key follows the private key and cannot be set alone",
            delta.name
        )));
    }

    if let Some(port) = delta.listen_port.filter(|_| delta.flags.contains(DeviceFlag::HasListenPort)) {
        args.push("listen-port".into());
        args.push(port.to_string());
    }

    if delta.flags.contains(DeviceFlag::HasFwmark) {
        args.push("fwmark".into());
        args.push(match delta.fwmark.filter(|m| *m != 0) {
            Some(mark) => format!("{mark:#x}"),
            None => "off".into(),
        });
    }

    if delta.replaces_peers() {
        for key in existing
            .iter()
            .filter(|k| !delta.peers.iter().any(|p| p.public_key == **k))
        {
            args.push("peer".into());
            args.push(key.to_string());
            args.push("remove".into());
        }
    }

    for peer in &delta.peers {
        args.push("peer".into());
        args.push(peer.public_key.to_string());

        if peer.is_removal() {
            args.push("remove".into());
            continue;
        }

        if peer.flags.contains(PeerFlag::HasPresharedKey) {
            args.push("preshared-key".into());
            args.push(key_arg(peer.preshared_key.as_ref())?);
        }

        if let Some(endpoint) = peer.endpoint.as_ref().filter(|_| peer.flags.contains(PeerFlag::HasEndpoint)) {
            args.push("endpoint".into());
            args.push(endpoint.to_string());
        }

        if peer.flags.contains(PeerFlag::HasPersistentKeepaliveInterval) {
            args.push("persistent-keepalive".into());
            args.push(match peer.persistent_keepalive {
                Some(secs) => secs.to_string(),
                None => "off".into(),
            });
        }

        if peer.flags.contains(PeerFlag::ReplaceAllowedIps) {
            args.push("allowed-ips".into());
            args.push(
                peer.allowed_ips
                    .iter()
                    .map(AllowedIp::to_string)
                    .collect::<Vec<_>>()
                    .join(","),
            );
        }
    }

    Ok(args)
}

fn none_or<T>(field: &str, parse: impl FnOnce(&str) -> Result<T, ParseError>) -> Result<Option<T>, ParseError> {
    match field {
        NONE | "off" | "" => Ok(None),
        _ => parse(field).map(Some),
    }
}

fn parse_ifindex(raw: &str) -> Result<u32, ParseError> {
    Ok(raw.trim().parse()?)
}

/// Parses the output of `wg show <name> peers`.
fn parse_peer_keys(out: &str) -> Result<Vec<Key>, ParseError> {
    out.split_whitespace().map(str::parse).collect()
}

/// Parses the output of `wg show <name> dump`.
fn parse_dump(name: &str, ifindex: u32, dump: &str) -> Result<DeviceInfo, ParseError> {
    let mut lines = dump.lines().filter(|l| !l.trim().is_empty());

    let head = lines
        .next()
        .ok_or_else(|| ParseError::UnexpectedToken("empty dump".into()))?;
    let fields: Vec<&str> = head.split('\t').collect();
    let [private_key, public_key, listen_port, fwmark] = fields[..] else {
        return Err(ParseError::UnexpectedToken(head.to_string()));
    };

    let mut device = DeviceInfo::new(name);
    device.ifindex = ifindex;
    device.private_key = none_or(private_key, |s| s.parse())?;
    device.public_key = none_or(public_key, |s| s.parse())?;
    device.listen_port = none_or(listen_port, |s| Ok(s.parse::<u16>()?))?.filter(|p| *p != 0);
    device.fwmark = none_or(fwmark, |s| Ok(s.parse::<Mark>()?.0))?.flatten();

    for line in lines {
        let fields: Vec<&str> = line.split('\t').collect();
        let [public_key, preshared_key, endpoint, allowed_ips, handshake, rx, tx, keepalive] =
            fields[..]
        else {
            return Err(ParseError::UnexpectedToken(line.to_string()));
        };

        let handshake: u64 = handshake.parse()?;
        device.peers.push(PeerInfo {
            public_key: public_key.parse()?,
            preshared_key: none_or(preshared_key, |s| s.parse())?.filter(|k: &Key| !k.is_zero()),
            endpoint: none_or(endpoint, |s| s.parse())?,
            allowed_ips: none_or(allowed_ips, |s| {
                s.split(',').map(|ip| ip.trim().parse()).collect()
            })?
            .unwrap_or_default(),
            persistent_keepalive: none_or(keepalive, |s| Ok(s.parse::<u16>()?))?.filter(|s| *s != 0),
            latest_handshake: Some(handshake).filter(|h| *h != 0),
            transfer: Some((rx.parse()?, tx.parse()?)),
        });
    }

    Ok(device)
}

/// Parses `ip -o address show` output into the addresses it lists.
fn parse_addresses(out: &str) -> Result<Vec<InterfaceAddress>, ParseError> {
    let mut addresses = Vec::new();

    for line in out.lines() {
        let mut tokens = line.split_whitespace();
        if tokens.by_ref().find(|t| *t == "inet" || *t == "inet6").is_none() {
            continue;
        }

        let Some(cidr) = tokens.next() else {
            return Err(ParseError::UnexpectedToken(line.to_string()));
        };
        let ip: IpAddr = cidr.split_once('/').map_or(cidr, |(ip, _)| ip).parse()?;
        addresses.push(InterfaceAddress::from(ip));
    }

    Ok(addresses)
}

impl Transport for WgCmdBackend {
    type Error = Error;

    fn create_interface(&mut self, name: &str) -> Result<(), Self::Error> {
        Self::ip(&["link", "add", "dev", name, "type", "wireguard"])?;
        Ok(())
    }

    fn destroy_interface(&mut self, name: &str) -> Result<(), Self::Error> {
        Self::ip(&["link", "delete", "dev", name])?;
        Ok(())
    }

    fn list_interface_names(&self) -> Result<Vec<String>, Self::Error> {
        let out = Self::wg(&["show", "interfaces"])?;
        Ok(out.split_whitespace().map(String::from).collect())
    }

    fn read_device(&self, name: &str) -> Result<DeviceInfo, Self::Error> {
        let dump = Self::wg(&["show", name, "dump"])?;
        Ok(parse_dump(name, Self::ifindex(name)?, &dump)?)
    }

    fn apply_device(&mut self, delta: &DeviceDelta) -> Result<(), Self::Error> {
        let existing = if delta.replaces_peers() {
            parse_peer_keys(&Self::wg(&["show", delta.name.as_str(), "peers"])?)?
        } else {
            Vec::new()
        };

        let mut secrets = Vec::new();
        let args = set_args(delta, &existing, |key| {
            let file = SecretFile::write(key)?;
            let path = file.path();
            secrets.push(file);
            Ok(path)
        })?;

        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        Self::wg(&args)?;
        Ok(())
    }

    fn generate_private_key(&self) -> Result<Key, Self::Error> {
        Ok(Self::wg(&["genkey"])?.parse()?)
    }

    fn generate_public_key(&self, private_key: &Key) -> Result<Key, Self::Error> {
        let input = format!("{private_key}\n");
        Ok(Self::run("wg", &["pubkey"], Some(input.as_bytes()))?.parse()?)
    }

    fn generate_preshared_key(&self) -> Result<Key, Self::Error> {
        Ok(Self::wg(&["genpsk"])?.parse()?)
    }

    fn get_interface_address(&self, name: &str) -> Result<Vec<InterfaceAddress>, Self::Error> {
        let out = Self::ip(&["-o", "address", "show", "dev", name])?;
        Ok(parse_addresses(&out)?)
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

        let family = match address.family {
            super::AddressFamily::Inet => "-4",
            super::AddressFamily::Inet6 => "-6",
        };
        let ip = address.ip.to_string();
        Self::ip(&[family, "address", "add", ip.as_str(), "dev", name])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::wg::{AddressFamily, Endpoint, peer::PeerDelta};

    fn placeholder(key: &Key) -> Result<String, Error> {
        Ok(format!("<{key}>"))
    }

    #[test]
    fn test_set_args_device_only() {
        let key = Key::random();
        let delta = DeviceDelta::new("wg0")
            .with_private_key(key)
            .with_listen_port(51820)
            .with_fwmark(0);

        assert_eq!(
            set_args(&delta, &[], placeholder).unwrap(),
            vec![
                "set".to_string(),
                "wg0".into(),
                "private-key".into(),
                format!("<{key}>"),
                "listen-port".into(),
                "51820".into(),
                "fwmark".into(),
                "off".into(),
            ]
        );
    }

    #[test]
    fn test_set_args_peer_scoped() {
        let key = Key::random();
        let peer = PeerDelta::new(key)
            .with_preshared_key(None)
            .with_endpoint(Endpoint::Domain("example.com:51820".into()))
            .with_persistent_keepalive(Some(25))
            .with_allowed_ips([
                AllowedIp::new(Ipv4Addr::new(10, 0, 0, 2), 32),
                AllowedIp::new(Ipv4Addr::new(10, 0, 1, 0), 24),
            ]);

        let args = set_args(&DeviceDelta::new("wg0").with_peer(peer), &[], placeholder).unwrap();
        assert_eq!(
            args,
            vec![
                "set".to_string(),
                "wg0".into(),
                "peer".into(),
                key.to_string(),
                "preshared-key".into(),
                "/dev/null".into(),
                "endpoint".into(),
                "example.com:51820".into(),
                "persistent-keepalive".into(),
                "25".into(),
                "allowed-ips".into(),
                "10.0.0.2/32,10.0.1.0/24".into(),
            ]
        );
    }

    #[test]
    fn test_set_args_removal_skips_fields() {
        let key = Key::random();
        let peer = PeerDelta::removal(key).with_persistent_keepalive(Some(5));

        let args = set_args(&DeviceDelta::new("wg0").with_peer(peer), &[], placeholder).unwrap();
        assert_eq!(args[2..], ["peer".to_string(), key.to_string(), "remove".into()]);
    }

    #[test]
    fn test_set_args_replace_peers_keeps_interface_settings() {
        let kept = Key::random();
        let dropped = Key::random();
        let added = Key::random();
        let delta = DeviceDelta::new("wg0").replacing_peers([
            PeerDelta::new(kept).with_allowed_ips([AllowedIp::new(Ipv4Addr::new(10, 0, 0, 2), 32)]),
            PeerDelta::new(added).with_persistent_keepalive(None),
        ]);

        let args = set_args(&delta, &[kept, dropped], placeholder).unwrap();
        assert_eq!(
            args,
            vec![
                "set".to_string(),
                "wg0".into(),
                "peer".into(),
                dropped.to_string(),
                "remove".into(),
                "peer".into(),
                kept.to_string(),
                "allowed-ips".into(),
                "10.0.0.2/32".into(),
                "peer".into(),
                added.to_string(),
                "persistent-keepalive".into(),
                "off".into(),
            ]
        );
        for field in ["private-key", "listen-port", "fwmark"] {
            assert!(!args.iter().any(|a| a == field));
        }

        let args = set_args(&DeviceDelta::new("wg0").replacing_peers([]), &[kept], placeholder).unwrap();
        assert_eq!(args, vec!["set".to_string(), "wg0".into(), "peer".into(), kept.to_string(), "remove".into()]);
    }

    #[test]
    fn test_set_args_rejects_lone_public_key() {
        let delta = DeviceDelta::new("wg0").with_public_key(Key::random());
        assert!(matches!(set_args(&delta, &[], placeholder), Err(Error::Rejected(_))));

        let private = Key::random();
        let delta = DeviceDelta::new("wg0")
            .with_private_key(private)
            .with_public_key(private.public_key());
        let args = set_args(&delta, &[], placeholder).unwrap();
        assert_eq!(args[2..], ["private-key".to_string(), format!("<{private}>")]);
    }

    #[test]
    fn test_parse_ifindex_and_peer_keys() {
        assert_eq!(parse_ifindex("12\n").unwrap(), 12);
        assert!(parse_ifindex("").is_err());
        assert!(parse_ifindex("wg0").is_err());

        let (a, b) = (Key::random(), Key::random());
        assert_eq!(parse_peer_keys(&format!("{a}\n{b}\n")).unwrap(), vec![a, b]);
        assert!(parse_peer_keys("").unwrap().is_empty());
        assert!(parse_peer_keys("AAAA\n").is_err());
    }

    #[test]
    fn test_parse_dump() {
        let private = Key::random();
        let public = Key::random();
        let peer = Key::random();
        let dump = format!(
            "{private}\t{public}\t51820\toff\n\
             {peer}\t(none)\t192.168.0.1:8080\t10.0.0.2/32,10.0.3.0/24\t1700000000\t1024\t2048\t30\n"
        );

        let device = parse_dump("wg0", 7, &dump).unwrap();
        assert_eq!(device.name, "wg0");
        assert_eq!(device.ifindex, 7);
        assert_eq!(device.private_key, Some(private));
        assert_eq!(device.public_key, Some(public));
        assert_eq!(device.listen_port, Some(51820));
        assert_eq!(device.fwmark, None);
        assert_eq!(device.peers.len(), 1);

        let p = &device.peers[0];
        assert_eq!(p.public_key, peer);
        assert_eq!(p.preshared_key, None);
        assert_eq!(p.endpoint, Some(Endpoint::Ip("192.168.0.1:8080".parse().unwrap())));
        assert_eq!(
            p.allowed_ips,
            vec![
                AllowedIp::new(Ipv4Addr::new(10, 0, 0, 2), 32),
                AllowedIp::new(Ipv4Addr::new(10, 0, 3, 0), 24),
            ]
        );
        assert_eq!(p.latest_handshake, Some(1_700_000_000));
        assert_eq!(p.transfer, Some((1024, 2048)));
        assert_eq!(p.persistent_keepalive, Some(30));
    }

    #[test]
    fn test_parse_dump_fresh_interface() {
        let device = parse_dump("wg1", 0, "(none)\t(none)\t0\toff\n").unwrap();
        assert_eq!(device.private_key, None);
        assert_eq!(device.listen_port, None);
        assert!(device.peers.is_empty());

        assert!(parse_dump("wg1", 0, "garbage\n").is_err());
    }

    #[test]
    fn test_parse_addresses() {
        let out = "5: wg0    inet 10.0.0.1/32 scope global wg0\\       valid_lft forever preferred_lft forever\n\
                   5: wg0    inet6 fd00::1/128 scope global \\       valid_lft forever preferred_lft forever\n";

        let addresses = parse_addresses(out).unwrap();
        assert_eq!(addresses.len(), 2);
        assert_eq!(addresses[0].family, AddressFamily::Inet);
        assert_eq!(addresses[0].ip, IpAddr::from(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(addresses[1].family, AddressFamily::Inet6);
    }
}
