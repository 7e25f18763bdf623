use std::{
    net::AddrParseError,
    num::ParseIntError,
    result::Result,
    str::FromStr,
};

use super::{AllowedIp, Endpoint, Key, peer::PeerInfo};

/// A wg-quick style configuration: one `[Interface]` and any number of `[Peer]`s.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WgConfig {
    pub interface: WgConfigInterface,
    pub peers: Vec<PeerInfo>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WgConfigInterface {
    // PrivateKey
    pub private_key: Option<Key>,

    // Address
    pub address: Vec<AllowedIp>,

    // ListenPort
    pub listen_port: Option<u16>,

    // FwMark
    pub fwmark: Option<u32>,
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("unexpected token: {0}")]
    UnexpectedToken(String),

    #[error("key parse error: {0}")]
    KeyParseError(#[from] base64::DecodeSliceError),

    #[error("key must be 32 bytes, got {0}")]
    KeyLength(usize),

    #[error("addr parse error: {0}")]
    SocketAddrParseError(#[from] AddrParseError),

    #[error("expected char: {0}")]
    Expected(char),

    #[error("int parse error: {0}")]
    ParseIntError(#[from] ParseIntError),

    #[error("no interface section")]
    NoInterfaceSection,

    #[error("peer without public key")]
    MissingPublicKey,

    #[error("line {line}: {source}")]
    Line {
        line: usize,
        #[source]
        source: Box<ParseError>,
    },
}

struct List<I>(Vec<I>);
impl<I: FromStr> FromStr for List<I> {
    type Err = I::Err;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut items = Vec::new();

        for s in s.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            items.push(s.parse()?);
        }

        Ok(List(items))
    }
}

/// A firewall mark; `off` and `0` both mean unset.
pub struct Mark(pub Option<u32>);
impl FromStr for Mark {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let mark = if s == "off" {
            0
        } else if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            u32::from_str_radix(hex, 16)?
        } else {
            s.parse()?
        };

        Ok(Mark(Some(mark).filter(|m| *m != 0)))
    }
}

enum WgPropKind {
    PublicKey,
    PresharedKey,
    Endpoint,
    AllowedIPs,
    PersistentKeepalive,
    PrivateKey,
    Address,
    ListenPort,
    FwMark,
    Unknown,
}

impl FromStr for WgPropKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "publickey" => WgPropKind::PublicKey,
            "presharedkey" => WgPropKind::PresharedKey,
            "endpoint" => WgPropKind::Endpoint,
            "allowedips" => WgPropKind::AllowedIPs,
            "persistentkeepalive" => WgPropKind::PersistentKeepalive,
            "privatekey" => WgPropKind::PrivateKey,
            "address" => WgPropKind::Address,
            "listenport" => WgPropKind::ListenPort,
            "fwmark" => WgPropKind::FwMark,
            _ => WgPropKind::Unknown,
        })
    }
}

enum Section {
    Preamble,
    Interface,
    Peer,
}

/// Splits off the next line, without its comment.
fn next_line<'a>(input: &mut &'a str) -> &'a str {
    let (line, rest) = input.split_once('\n').unwrap_or((*input, ""));
    *input = rest;

    line.split_once('#').map_or(line, |(l, _)| l).trim()
}

fn parse_keepalive(value: &str) -> Result<Option<u16>, ParseError> {
    if value == "off" {
        return Ok(None);
    }
    let secs: u16 = value.parse()?;
    Ok(Some(secs).filter(|s| *s != 0))
}

impl WgConfig {
    pub fn parse_config(input: &mut &str) -> Result<Self, ParseError> {
        let mut interface = None;
        let mut peers: Vec<(bool, PeerInfo)> = Vec::new();
        let mut section = Section::Preamble;
        let mut line_no = 0;

        while !input.is_empty() {
            line_no += 1;
            let line = next_line(input);
            if line.is_empty() {
                continue;
            }

            Self::parse_line(line, &mut section, &mut interface, &mut peers).map_err(|e| {
                ParseError::Line {
                    line: line_no,
                    source: Box::new(e),
                }
            })?;
        }

        let peers = peers
            .into_iter()
            .map(|(has_key, peer)| has_key.then_some(peer).ok_or(ParseError::MissingPublicKey))
            .collect::<Result<_, _>>()?;

        Ok(WgConfig {
            interface: interface.ok_or(ParseError::NoInterfaceSection)?,
            peers,
        })
    }

    fn parse_line(
        line: &str,
        section: &mut Section,
        interface: &mut Option<WgConfigInterface>,
        peers: &mut Vec<(bool, PeerInfo)>,
    ) -> Result<(), ParseError> {
        if line.starts_with('[') {
            match line.to_ascii_lowercase().as_str() {
                "[interface]" => {
                    *section = Section::Interface;
                    interface.get_or_insert_with(Default::default);
                }
                "[peer]" => {
                    *section = Section::Peer;
                    peers.push((false, PeerInfo::default()));
                }
                _ => return Err(ParseError::UnexpectedToken(line.to_string())),
            }
            return Ok(());
        }

        let (prop, value) = line.split_once('=').ok_or(ParseError::Expected('='))?;
        let value = value.trim();

        match section {
            Section::Preamble => Err(ParseError::UnexpectedToken(line.to_string())),
            Section::Interface => {
                let iface = interface.get_or_insert_with(Default::default);
                match prop.trim().parse::<WgPropKind>()? {
                    WgPropKind::PrivateKey => iface.private_key = Some(value.parse()?),
                    WgPropKind::Address => iface.address = value.parse::<List<AllowedIp>>()?.0,
                    WgPropKind::ListenPort => iface.listen_port = Some(value.parse()?),
                    WgPropKind::FwMark => iface.fwmark = value.parse::<Mark>()?.0,
                    _ => log::debug!("ignoring interface property {}", prop.trim()),
                }
                Ok(())
            }
            Section::Peer => {
                let Some((has_key, peer)) = peers.last_mut() else {
                    return Err(ParseError::UnexpectedToken(line.to_string()));
                };
                match prop.trim().parse::<WgPropKind>()? {
                    WgPropKind::PublicKey => {
                        peer.public_key = value.parse()?;
                        *has_key = true;
                    }
                    WgPropKind::PresharedKey => {
                        peer.preshared_key = Some(value.parse::<Key>()?).filter(|k| !k.is_zero())
                    }
                    WgPropKind::Endpoint => peer.endpoint = Some(value.parse::<Endpoint>()?),
                    WgPropKind::AllowedIPs => {
                        peer.allowed_ips.extend(value.parse::<List<AllowedIp>>()?.0)
                    }
                    WgPropKind::PersistentKeepalive => {
                        peer.persistent_keepalive = parse_keepalive(value)?
                    }
                    _ => log::debug!("ignoring peer property {}", prop.trim()),
                }
                Ok(())
            }
        }
    }
}
