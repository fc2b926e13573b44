use anyhow::{bail, Context, Result};
use clap::{Arg, ArgAction, Command};
use peervault_crypto::EncryptionKey;
use peervault_network::{netutil, FileServer, ServerConfig, TcpTransport, TransportConfig};
use peervault_storage::{format_bytes, parse_storage_size, QuotaError, QuotaManager};
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const ENC_KEY_ENV: &str = "PEERVAULT_ENC_KEY";

fn cli() -> Command {
    Command::new("peervault")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Peer-to-peer, content-addressable, encrypted file store")
        .arg(
            Arg::new("listen")
                .long("listen")
                .value_name("ADDR")
                .required(true)
                .help("Listen address, e.g. :3000 or 0.0.0.0:3000"),
        )
        .arg(
            Arg::new("key")
                .long("key")
                .value_name("HEX")
                .help(format!("Network encryption key as hex (falls back to ${ENC_KEY_ENV})")),
        )
        .arg(
            Arg::new("seed")
                .long("seed")
                .value_name("ADDR")
                .action(ArgAction::Append)
                .help("Seed node to connect to; repeatable"),
        )
        .arg(
            Arg::new("root")
                .long("root")
                .value_name("DIR")
                .help("Storage root directory (default: storage/node_<port>)"),
        )
        .arg(
            Arg::new("quota")
                .long("quota")
                .value_name("SIZE")
                .help("Storage quota used on first run, e.g. 1GB or 500MB"),
        )
        .arg(
            Arg::new("advertise")
                .long("advertise")
                .value_name("ADDR")
                .help("Address advertised to other nodes (default: local IP + listen port)"),
        )
        .arg(
            Arg::new("mdns")
                .long("mdns")
                .action(ArgAction::SetTrue)
                .help("Enable mDNS discovery on the local network"),
        )
        .arg(
            Arg::new("pex")
                .long("pex")
                .action(ArgAction::SetTrue)
                .help("Enable gossip-based peer exchange"),
        )
        .arg(
            Arg::new("interactive")
                .long("interactive")
                .short('i')
                .action(ArgAction::SetTrue)
                .help("Run the interactive shell"),
        )
}

/// Accept Go-style `:3000` listen addresses alongside full ones.
fn normalize_listen_addr(listen: &str) -> String {
    if listen.starts_with(':') {
        format!("0.0.0.0{listen}")
    } else {
        listen.to_string()
    }
}

fn resolve_key(flag: Option<&String>) -> Result<EncryptionKey> {
    if let Some(hex) = flag {
        return EncryptionKey::from_hex(hex).context("invalid --key");
    }
    if let Ok(hex) = std::env::var(ENC_KEY_ENV) {
        return EncryptionKey::from_hex(&hex).context("invalid key in environment");
    }
    warn!("no encryption key supplied, generating an ephemeral one; other nodes will not be able to decrypt this node's blobs");
    Ok(EncryptionKey::generate()?)
}

/// Load the quota descriptor, or create it from the flag or an
/// interactive prompt. With neither available, startup fails.
fn resolve_quota(root: &PathBuf, flag: Option<&String>) -> Result<QuotaManager> {
    match QuotaManager::load_existing(root) {
        Ok(manager) => return Ok(manager),
        Err(QuotaError::MissingDescriptor(_)) => {}
        Err(e) => return Err(e.into()),
    }
    if let Some(size) = flag {
        let bytes = parse_storage_size(size)?;
        return Ok(QuotaManager::create(root, bytes)?);
    }
    QuotaManager::load_or_create(root, prompt_for_quota)
}

fn prompt_for_quota() -> Result<u64> {
    println!("First run for this storage location.");
    let mut line = String::new();
    loop {
        print!("Enter maximum storage size (e.g. 1GB, 500MB): ");
        std::io::stdout().flush()?;
        line.clear();
        if std::io::stdin().read_line(&mut line)? == 0 {
            bail!("no quota configured and no input available");
        }
        match parse_storage_size(line.trim()) {
            Ok(bytes) => {
                println!("Storage quota set to {}", format_bytes(bytes));
                return Ok(bytes);
            }
            Err(e) => println!("{e}, try again"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let matches = cli().get_matches();

    let listen_flag = matches
        .get_one::<String>("listen")
        .context("--listen is required")?;
    let listen = normalize_listen_addr(listen_flag);
    let port = netutil::parse_listen_port(&listen)?;

    let key = resolve_key(matches.get_one::<String>("key"))?;

    let root: PathBuf = match matches.get_one::<String>("root") {
        Some(root) => root.into(),
        None => format!("storage/node_{port}").into(),
    };
    let quota = resolve_quota(&root, matches.get_one::<String>("quota"))?;

    let advertise = match matches.get_one::<String>("advertise") {
        Some(addr) => addr.clone(),
        None => netutil::build_advertise_addr(&netutil::local_ip(), &listen)?,
    };

    let transport = TcpTransport::new(TransportConfig::new(listen));

    let mut config = ServerConfig::new(key, root);
    config.seed_peers = matches
        .get_many::<String>("seed")
        .map(|seeds| seeds.cloned().collect())
        .unwrap_or_default();
    config.advertise_addr = Some(advertise);

    let server = FileServer::new(config, transport, quota)?;
    if matches.get_flag("pex") {
        server.enable_pex();
    }
    server.start().await.context("failed to start file server")?;
    if matches.get_flag("mdns") {
        server
            .enable_local_discovery()
            .context("failed to start mDNS discovery")?;
    }

    if matches.get_flag("interactive") {
        run_shell(&server).await?;
    } else {
        tokio::signal::ctrl_c().await?;
        info!("interrupt received, shutting down");
    }

    server.shutdown().await;
    Ok(())
}

const SHELL_HELP: &str = "\
Commands:
  store <name> [text]   store text, or the contents of a local file <name>
  get <name>            fetch a blob and print it
  delete <name>         delete a blob everywhere
  list                  list stored blobs
  quota                 show storage usage
  gc                    run a garbage-collection sweep now
  metrics               show server counters
  peers                 show connected peers
  discover              show mDNS/PEX discovery state
  status                show node status
  clean                 wipe local storage
  quit                  exit";

async fn run_shell(server: &Arc<FileServer>) -> Result<()> {
    println!("PeerVault interactive mode. Type 'help' for commands.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("peervault> ");
        std::io::stdout().flush()?;

        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => break,
        };
        let Some(line) = line else { break };
        let mut parts = line.trim().split_whitespace();
        let Some(command) = parts.next() else { continue };

        match command {
            "store" => {
                let Some(name) = parts.next() else {
                    println!("usage: store <name> [text]");
                    continue;
                };
                let rest = parts.collect::<Vec<_>>().join(" ");
                let data = if rest.is_empty() {
                    match tokio::fs::read(name).await {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            println!("cannot read local file {name}: {e}");
                            continue;
                        }
                    }
                } else {
                    rest.into_bytes()
                };
                match server.put(name, &mut &data[..]).await {
                    Ok(n) => println!("stored {name} ({n} bytes)"),
                    Err(e) => println!("store failed: {e}"),
                }
            }
            "get" => {
                let Some(name) = parts.next() else {
                    println!("usage: get <name>");
                    continue;
                };
                match server.get(name).await {
                    Ok((size, mut file)) => {
                        let mut data = Vec::new();
                        tokio::io::AsyncReadExt::read_to_end(&mut file, &mut data).await?;
                        println!("{name} ({size} bytes):");
                        println!("{}", String::from_utf8_lossy(&data));
                    }
                    Err(e) => println!("get failed: {e}"),
                }
            }
            "delete" => {
                let Some(name) = parts.next() else {
                    println!("usage: delete <name>");
                    continue;
                };
                match server.delete(name).await {
                    Ok(()) => println!("deleted {name} from the network"),
                    Err(e) => println!("delete failed: {e}"),
                }
            }
            "list" => {
                match server.list_files(server.id()) {
                    Ok(files) if files.is_empty() => println!("no blobs stored on this node"),
                    Ok(files) => {
                        for f in files {
                            println!("{:40} {:>12} {}", f.key, format_bytes(f.size), &f.key_id[..8]);
                        }
                    }
                    Err(e) => println!("list failed: {e}"),
                }
                if let Ok(all) = server.list_all_files() {
                    for (owner, files) in all {
                        if owner != server.id() && !files.is_empty() {
                            println!("replicas for node {} ({} blobs)", &owner[..8.min(owner.len())], files.len());
                        }
                    }
                }
            }
            "quota" => match server.quota_stats() {
                Ok(stats) => {
                    let pct = if stats.total > 0 {
                        (stats.used as f64 / stats.total as f64) * 100.0
                    } else {
                        0.0
                    };
                    println!(
                        "used {} of {} ({pct:.1}%), {} available",
                        format_bytes(stats.used),
                        format_bytes(stats.total),
                        format_bytes(stats.available)
                    );
                }
                Err(e) => println!("quota check failed: {e}"),
            },
            "gc" => {
                let stats = server.gc().run_sweep_now().await;
                println!(
                    "sweep done: {} corrupted, {} orphaned, {} removed",
                    stats.corrupted, stats.orphaned, stats.removed
                );
            }
            "metrics" => println!("{:#?}", server.metrics().snapshot()),
            "peers" => {
                let peers = server.peer_addrs();
                if peers.is_empty() {
                    println!("no peers connected");
                } else {
                    println!("{} connected:", peers.len());
                    for addr in peers {
                        println!("  {addr}");
                    }
                }
            }
            "discover" => {
                let mdns = server.discovered_peers();
                println!("mDNS discovered: {}", mdns.len());
                for addr in mdns {
                    println!("  {addr}");
                }
                let known = server.pex().known_peers();
                println!("PEX known: {}", known.len());
                for peer in known {
                    println!("  {} (via {})", peer.address, peer.source);
                }
            }
            "status" => {
                println!("node id:    {}", server.id());
                println!("listening:  {}", server.local_addr().map(|a| a.to_string()).unwrap_or_default());
                println!("advertise:  {}", server.advertise_addr());
                println!("peers:      {}", server.peer_count());
            }
            "clean" => {
                match server.clear_storage().await {
                    Ok(()) => {
                        server.clear_name_mappings();
                        println!("local storage cleared");
                    }
                    Err(e) => println!("clean failed: {e}"),
                }
            }
            "help" => println!("{SHELL_HELP}"),
            "quit" | "exit" => break,
            other => println!("unknown command {other:?}, type 'help'"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listen_addr_normalization() {
        assert_eq!(normalize_listen_addr(":3000"), "0.0.0.0:3000");
        assert_eq!(normalize_listen_addr("127.0.0.1:4000"), "127.0.0.1:4000");
    }

    #[test]
    fn cli_parses_repeatable_seeds() {
        let matches = cli().get_matches_from([
            "peervault",
            "--listen",
            ":3000",
            "--seed",
            "127.0.0.1:4000",
            "--seed",
            "127.0.0.1:5000",
            "--pex",
        ]);
        let seeds: Vec<_> = matches
            .get_many::<String>("seed")
            .unwrap()
            .cloned()
            .collect();
        assert_eq!(seeds, ["127.0.0.1:4000", "127.0.0.1:5000"]);
        assert!(matches.get_flag("pex"));
        assert!(!matches.get_flag("mdns"));
    }

    #[test]
    fn cli_requires_listen() {
        assert!(cli().try_get_matches_from(["peervault"]).is_err());
    }
}
