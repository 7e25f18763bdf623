use std::{fs, net::IpAddr, path::PathBuf};

use clap::{Parser, Subcommand};
use wg_delta::{
    AllowedIp, Device, Endpoint, Error, Key, PeerInfo, Transport,
    wg::{cmd::WgCmdBackend, config::WgConfig, memory::MemoryBackend},
};

const DEFAULT_CONFIG_DIR: &str = "/etc/wireguard";

#[derive(Debug, clap::Parser)]
#[command(version, about = "Apply WireGuard configuration as partial updates")]
struct Args {
    /// Apply to an in-memory driver and print the outcome instead of touching the system
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// List WireGuard interfaces
    List,
    /// Print an interface in configuration-file form
    Show { iface: String },
    /// Create the interface if needed and apply its configuration file
    Up {
        iface: String,
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Destroy the interface
    Down { iface: String },
    /// Add a fully specified peer
    AddPeer {
        iface: String,
        public_key: Key,
        #[arg(long, value_delimiter = ',')]
        allowed_ips: Vec<AllowedIp>,
        #[arg(long)]
        endpoint: Option<Endpoint>,
        #[arg(long)]
        preshared_key: Option<Key>,
        #[arg(long)]
        keepalive: Option<u16>,
    },
    /// Remove a peer
    RemovePeer { iface: String, public_key: Key },
    /// Replace the allowed IPs of a peer
    SetAllowedIps {
        iface: String,
        public_key: Key,
        #[arg(value_delimiter = ',')]
        allowed_ips: Vec<AllowedIp>,
    },
    /// Generate a private key
    Genkey,
    /// Generate a preshared key
    Genpsk,
    /// Derive the public key of a private key
    Pubkey { private_key: Key },
}

impl Cmd {
    fn iface(&self) -> Option<&str> {
        match self {
            Cmd::Show { iface }
            | Cmd::Up { iface, .. }
            | Cmd::Down { iface }
            | Cmd::AddPeer { iface, .. }
            | Cmd::RemovePeer { iface, .. }
            | Cmd::SetAllowedIps { iface, .. } => Some(iface),
            Cmd::List | Cmd::Genkey | Cmd::Genpsk | Cmd::Pubkey { .. } => None,
        }
    }
}

fn main() -> Result<(), Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    if args.dry_run {
        let mut backend = MemoryBackend::new();
        if let Some(iface) = args.command.iface().filter(|_| !matches!(args.command, Cmd::Up { .. })) {
            backend.create_interface(iface)?;
        }

        let iface = args.command.iface().map(String::from);
        run(&mut backend, args.command)?;

        if let Some(iface) = iface {
            match backend.read_device(&iface) {
                Ok(device) => print!("{device}"),
                Err(_) => log::info!("{iface} does not exist"),
            }
            log::info!("dry run applied {} deltas", backend.applied());
        }
        Ok(())
    } else {
        run(WgCmdBackend::new(), args.command)
    }
}

fn run<T: Transport<Error = Error>>(backend: T, command: Cmd) -> Result<(), Error> {
    match command {
        Cmd::List => {
            for name in backend.list_interface_names()? {
                println!("{name}");
            }
        }

        Cmd::Show { iface } => {
            let device = Device::open(backend, &iface)?;
            print!("{}", device.info());
            for address in device.get_interface_address()? {
                println!("# {} {}", address.family, address.ip);
            }
        }

        Cmd::Up { iface, config } => {
            let config = load_wg_config(&iface, config)?;

            let mut device = if backend.list_interface_names()?.contains(&iface) {
                Device::open(backend, &iface)?
            } else {
                Device::create(backend, &iface)?
            };

            if let Some(key) = config.interface.private_key {
                device.set_private_key(key)?;
            }
            if let Some(port) = config.interface.listen_port {
                device.set_listen_port(port)?;
            }
            if let Some(mark) = config.interface.fwmark {
                device.set_fwmark(mark)?;
            }

            let present: Vec<IpAddr> = device
                .get_interface_address()?
                .into_iter()
                .map(|a| a.ip)
                .collect();
            for address in config.interface.address {
                if !present.contains(&address.addr) {
                    device.set_interface_address(address.family(), address.addr)?;
                }
            }

            device.replace_peers(config.peers)?;
            log::info!("{iface} is up with {} peers", device.peers().len());
        }

        Cmd::Down { iface } => {
            Device::open(backend, &iface)?.remove()?;
        }

        Cmd::AddPeer {
            iface,
            public_key,
            allowed_ips,
            endpoint,
            preshared_key,
            keepalive,
        } => {
            Device::open(backend, &iface)?.add_peer(PeerInfo {
                preshared_key,
                endpoint,
                allowed_ips,
                persistent_keepalive: keepalive,
                ..PeerInfo::new(public_key)
            })?;
        }

        Cmd::RemovePeer { iface, public_key } => {
            let mut device = Device::open(backend, &iface)?;
            device
                .peer_mut(&public_key)
                .ok_or_else(|| Error::NotFound(format!("peer {public_key} on {iface}")))?
                .remove()?;
        }

        Cmd::SetAllowedIps {
            iface,
            public_key,
            allowed_ips,
        } => {
            let mut device = Device::open(backend, &iface)?;
            device
                .peer_mut(&public_key)
                .ok_or_else(|| Error::NotFound(format!("peer {public_key} on {iface}")))?
                .set_allowed_ips(allowed_ips)?;
        }

        Cmd::Genkey => println!("{}", backend.generate_private_key()?),
        Cmd::Genpsk => println!("{}", backend.generate_preshared_key()?),
        Cmd::Pubkey { private_key } => {
            println!("{}", backend.generate_public_key(&private_key)?)
        }
    }

    Ok(())
}

fn load_wg_config(iface: &str, path: Option<PathBuf>) -> Result<WgConfig, Error> {
    let path = path.unwrap_or_else(|| {
        let dir = std::env::var("WG_CONFIG_DIR").unwrap_or_else(|_| DEFAULT_CONFIG_DIR.into());
        PathBuf::from(dir).join(format!("{iface}.conf"))
    });

    log::debug!("reading {}", path.display());
    let data = fs::read_to_string(&path)?;
    let mut reader = data.as_str();

    Ok(WgConfig::parse_config(&mut reader)?)
}
