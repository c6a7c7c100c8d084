use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use crypto::{Fingerprint, IdentityKeypair};
use pq_channel::{
    ChannelConfig, FileSink, FramedTransport, SecureChannel, TransferManifest, TransferOffer,
};
use pq_keystore::{parse_public, KeyManager, PublicKeyFormat};
use tokio::net::{TcpListener, TcpStream};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;

use config::FileConfig;

#[derive(Parser, Debug)]
#[command(name = "pqxfer", version, about = "Hybrid post-quantum file transfer")]
struct Cli {
    /// TOML configuration file
    #[arg(long, env = "PQXFER_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Key store directory
    #[arg(long, env = "PQXFER_KEY_DIR", global = true)]
    key_dir: Option<PathBuf>,

    /// Key store passphrase; prompted for when unset
    #[arg(long, env = "PQXFER_PASSPHRASE", hide_env_values = true, global = true)]
    passphrase: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a new identity key
    Keygen {
        name: String,
        /// Replace an existing key of the same name
        #[arg(long)]
        force: bool,
    },
    /// List stored keys
    List {
        /// Show rotated-out keys instead
        #[arg(long)]
        archived: bool,
    },
    /// Replace a key, keeping the old one for the grace period
    Rotate { name: String },
    /// Delete archived keys past their grace period
    Purge {
        /// Also delete active keys older than this many days
        #[arg(long)]
        older_than_days: Option<u64>,
    },
    /// Delete a key and its archived versions
    Delete { name: String },
    /// Export a public key, or the encrypted record with --record
    Export {
        name: String,
        #[arg(long, default_value = "pem")]
        format: PublicKeyFormat,
        #[arg(long)]
        record: bool,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Import an encrypted record produced by `export --record`
    Import {
        name: String,
        file: PathBuf,
        #[arg(long)]
        force: bool,
    },
    /// Print the fingerprint of a stored key or a public key file
    Fingerprint {
        name: Option<String>,
        #[arg(long, conflicts_with = "name")]
        public_key: Option<PathBuf>,
        #[arg(long, default_value = "pem")]
        format: PublicKeyFormat,
    },
    /// Manage pinned peer public keys
    Contact {
        #[command(subcommand)]
        command: ContactCommand,
    },
    /// Send a file to a listening receiver
    Send {
        #[arg(long)]
        to: String,
        #[arg(long)]
        identity: String,
        /// Expected receiver fingerprint (hex)
        #[arg(long)]
        peer: Option<String>,
        /// Expected receiver, by contact name
        #[arg(long, conflicts_with = "peer")]
        peer_name: Option<String>,
        /// Name announced to the receiver; defaults to the file name
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        chunk_size: Option<usize>,
        file: PathBuf,
    },
    /// Accept one transfer and write it to a file
    Receive {
        #[arg(long, default_value = "127.0.0.1:7878")]
        listen: String,
        #[arg(long)]
        identity: String,
        /// Expected sender fingerprint (hex)
        #[arg(long)]
        peer: Option<String>,
        /// Expected sender, by contact name
        #[arg(long, conflicts_with = "peer")]
        peer_name: Option<String>,
        /// Refuse offers declaring more than this many bytes
        #[arg(long)]
        max_size: Option<u64>,
        #[arg(long)]
        out: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum ContactCommand {
    /// Pin a peer's public key file under a name
    Add {
        name: String,
        file: PathBuf,
        #[arg(long, default_value = "pem")]
        format: PublicKeyFormat,
        /// Replace an existing contact of the same name
        #[arg(long)]
        force: bool,
    },
    /// List pinned contacts
    List,
    /// Forget a contact
    Remove { name: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();

    let file_config = match &cli.config {
        Some(path) => FileConfig::load(path).await?,
        None => FileConfig::default(),
    };
    let key_dir = file_config.key_dir(cli.key_dir.as_deref());

    match cli.command {
        Commands::Fingerprint {
            name: None,
            public_key: Some(path),
            format,
        } => cmd_fingerprint_file(&path, format),
        Commands::Fingerprint { name: None, .. } => {
            bail!("either a key name or --public-key is required")
        }
        command => {
            let passphrase = resolve_passphrase(cli.passphrase)?;
            let store = KeyManager::open(&key_dir, &passphrase, file_config.keystore.clone())
                .with_context(|| format!("failed to open key store {}", key_dir.display()))?;
            run(command, &store, &passphrase, file_config.channel).await
        }
    }
}

async fn run(
    command: Commands,
    store: &KeyManager,
    passphrase: &str,
    channel: ChannelConfig,
) -> Result<()> {
    match command {
        Commands::Keygen { name, force } => {
            let fingerprint = store.generate(&name, force)?;
            println!("{name} {fingerprint}");
        }
        Commands::List { archived } => {
            let keys = if archived {
                store.list_archived()?
            } else {
                store.list()?
            };
            for key in keys {
                match key.retired_at {
                    Some(retired) => println!(
                        "{}\t{}\t{}\tcreated {}\tretired {}",
                        key.name, key.algorithm_id, key.fingerprint, key.created_at, retired
                    ),
                    None => println!(
                        "{}\t{}\t{}\tcreated {}",
                        key.name, key.algorithm_id, key.fingerprint, key.created_at
                    ),
                }
            }
        }
        Commands::Rotate { name } => {
            let (old, new) = store.rotate(&name)?;
            println!("{name} {old} -> {new}");
        }
        Commands::Purge { older_than_days } => {
            let purged = store.purge_expired()?;
            println!("purged {purged} archived keys");
            if let Some(days) = older_than_days {
                let max_age = Duration::from_secs(days.saturating_mul(24 * 60 * 60));
                let deleted = store.cleanup_older_than(max_age)?;
                println!("deleted {deleted} keys older than {days} days");
            }
        }
        Commands::Delete { name } => {
            store.delete(&name)?;
            println!("deleted {name}");
        }
        Commands::Export {
            name,
            format,
            record,
            out,
        } => {
            if record {
                let Some(out) = out else {
                    bail!("--record requires --out");
                };
                let bytes = store.export_record(&name)?;
                std::fs::write(&out, bytes)
                    .with_context(|| format!("failed to write {}", out.display()))?;
                println!("wrote {}", out.display());
            } else {
                let text = store.export_public(&name, format)?;
                match out {
                    Some(out) => std::fs::write(&out, text)
                        .with_context(|| format!("failed to write {}", out.display()))?,
                    None => print!("{text}"),
                }
            }
        }
        Commands::Import { name, file, force } => {
            let bytes = std::fs::read(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let fingerprint = store.import_record(&name, &bytes, force)?;
            println!("{name} {fingerprint}");
        }
        Commands::Fingerprint { name, .. } => {
            let name = name.context("a key name is required")?;
            println!("{}", store.fingerprint(&name)?);
        }
        Commands::Contact { command } => run_contact(command, store)?,
        Commands::Send {
            to,
            identity,
            peer,
            peer_name,
            name,
            chunk_size,
            file,
        } => {
            let peer = resolve_peer(store, peer.as_deref(), peer_name.as_deref())?;
            let identity = store.load(&identity, passphrase)?;
            let config = match chunk_size {
                Some(size) => channel.with_chunk_size(size),
                None => channel,
            };
            let manifest = send_file(&to, &identity, peer, config, &file, name).await?;
            print_manifest("sent", &manifest);
        }
        Commands::Receive {
            listen,
            identity,
            peer,
            peer_name,
            max_size,
            out,
        } => {
            let peer = resolve_peer(store, peer.as_deref(), peer_name.as_deref())?;
            let identity = store.load(&identity, passphrase)?;
            let received = receive_file(&listen, &identity, peer, channel, max_size, &out).await?;
            let from = match store.find_contact(&received.peer)? {
                Some(contact) => contact.name,
                None => received.peer.short(),
            };
            print_offer(&received.offer, &from);
            print_manifest("received", &received.manifest);
        }
    }
    Ok(())
}

fn run_contact(command: ContactCommand, store: &KeyManager) -> Result<()> {
    match command {
        ContactCommand::Add {
            name,
            file,
            format,
            force,
        } => {
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let key = parse_public(&text, format)?;
            let fingerprint = store.add_contact(&name, &key, force)?;
            println!("{name} {fingerprint}");
        }
        ContactCommand::List => {
            for contact in store.list_contacts()? {
                println!(
                    "{}\t{}\t{}\tadded {}",
                    contact.name, contact.algorithm_id, contact.fingerprint, contact.added_at
                );
            }
        }
        ContactCommand::Remove { name } => {
            store.remove_contact(&name)?;
            println!("removed {name}");
        }
    }
    Ok(())
}

/// Outcome of one accepted transfer.
struct Received {
    manifest: TransferManifest,
    offer: TransferOffer,
    peer: Fingerprint,
}

async fn send_file(
    addr: &str,
    identity: &IdentityKeypair,
    peer: Option<Fingerprint>,
    config: ChannelConfig,
    path: &Path,
    name: Option<String>,
) -> Result<TransferManifest> {
    config.validate()?;
    let source = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("failed to open {}", path.display()))?;
    let size = source
        .metadata()
        .await
        .with_context(|| format!("failed to stat {}", path.display()))?
        .len();
    let name = name.unwrap_or_else(|| {
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    });
    let offer = TransferOffer::new(name).with_size(size);
    let socket = TcpStream::connect(addr)
        .await
        .with_context(|| format!("failed to connect to {addr}"))?;
    let transport = FramedTransport::new(socket, config.max_frame_size());

    let mut channel = SecureChannel::connect(transport, identity, peer, config)
        .await
        .context("handshake failed")?;
    info!(peer = %channel.peer_fingerprint(), "connected");
    let manifest = channel
        .send_offered(offer, source)
        .await
        .context("transfer failed")?;
    channel.close().await?;
    Ok(manifest)
}

async fn receive_file(
    addr: &str,
    identity: &IdentityKeypair,
    peer: Option<Fingerprint>,
    config: ChannelConfig,
    max_size: Option<u64>,
    out: &Path,
) -> Result<Received> {
    config.validate()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to listen on {addr}"))?;
    info!(addr = %listener.local_addr()?, "waiting for sender");
    let (socket, remote) = listener.accept().await?;
    info!(%remote, "sender connected");
    let transport = FramedTransport::new(socket, config.max_frame_size());

    let mut channel = SecureChannel::accept(transport, identity, peer, config)
        .await
        .context("handshake failed")?;
    let mut sink = FileSink::create(out)
        .await
        .with_context(|| format!("failed to create {}", out.display()))?;
    let accept = |offer: &TransferOffer| match (max_size, offer.size) {
        (Some(max), Some(size)) if size > max => {
            tracing::warn!(name = %offer.name, size, max, "refusing oversized offer");
            false
        }
        _ => true,
    };
    let manifest = channel
        .receive_with(&mut sink, accept)
        .await
        .context("transfer failed")?;
    let offer = channel.offer().cloned().unwrap_or_default();
    let peer = channel.peer_fingerprint();
    channel.close().await?;
    Ok(Received {
        manifest,
        offer,
        peer,
    })
}

fn cmd_fingerprint_file(path: &Path, format: PublicKeyFormat) -> Result<()> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let key = parse_public(&text, format)?;
    println!("{}", key.fingerprint());
    Ok(())
}

/// Pinned peer from `--peer` (hex) or `--peer-name` (contact).
fn resolve_peer(
    store: &KeyManager,
    peer: Option<&str>,
    peer_name: Option<&str>,
) -> Result<Option<Fingerprint>> {
    if let Some(name) = peer_name {
        return Ok(Some(store.contact_fingerprint(name)?));
    }
    peer.map(|hex| Fingerprint::from_hex(hex).context("invalid peer fingerprint"))
        .transpose()
}

fn resolve_passphrase(passphrase: Option<String>) -> Result<String> {
    match passphrase {
        Some(passphrase) => Ok(passphrase),
        None => rpassword::prompt_password("key store passphrase: ")
            .context("failed to read passphrase"),
    }
}

fn print_offer(offer: &TransferOffer, from: &str) {
    let name = if offer.name.is_empty() {
        "<unnamed>"
    } else {
        offer.name.as_str()
    };
    match offer.size {
        Some(size) => println!("offer {name} ({size} bytes) from {from}"),
        None => println!("offer {name} from {from}"),
    }
}

fn print_manifest(verb: &str, manifest: &TransferManifest) {
    println!(
        "{verb} {} bytes in {} chunks, sha256 {}",
        manifest.total_size,
        manifest.chunk_count,
        manifest.digest_hex()
    );
}
