//! agentd — agent configuration distribution core.
//!
//! Single binary:
//!   agentd run [--config <path>]       → start the daemon (foreground)
//!   agentd rebuild [--config <path>]   → force one Bundle Builder pass, then exit
//!   agentd status [--config <path>]    → print a one-shot snapshot as JSON

use std::io::Read;
use std::net::{TcpListener, TcpStream, UdpSocket};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use agentd::config::DaemonConfig;
use agentd::core::collaborators::{
    AutoKeyStore, InMemoryGroupStore, NullRequestRouter, TcpTransport, UdpTransport,
};
use agentd::core::{AgentId, Core, GroupStore, KeyStore, RequestRouter, Transport};
use agentd::logging;

const AFTER_HELP: &str = "\
EXAMPLES:
    agentd run --config /etc/agentd/agentd.toml
    agentd rebuild --config /etc/agentd/agentd.toml
    agentd status --config /etc/agentd/agentd.toml --json";

/// Inbound messages on the stream transport are framed with a 4-byte
/// little-endian length prefix so one TCP connection can carry more than
/// one heartbeat over its lifetime. This framing is this binary's own
/// listener convention; the receive-side transport is not part of the
/// reconciliation core itself, so nothing in `core/` depends on it.
const MAX_INBOUND_MESSAGE: usize = 1 << 20;

#[derive(Parser)]
#[command(
    name = "agentd",
    about = "agent configuration distribution core",
    after_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon in the foreground
    Run {
        /// Path to the TOML configuration file
        #[arg(long, env = "AGENTD_CONFIG", default_value = "agentd.toml")]
        config: PathBuf,
    },
    /// Force one Bundle Builder rebuild and exit
    Rebuild {
        #[arg(long, env = "AGENTD_CONFIG", default_value = "agentd.toml")]
        config: PathBuf,
    },
    /// Print a one-shot snapshot of the index and pending queue
    Status {
        #[arg(long, env = "AGENTD_CONFIG", default_value = "agentd.toml")]
        config: PathBuf,
        /// Emit JSON instead of a human-readable summary
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => run(&config),
        Commands::Rebuild { config } => rebuild(&config),
        Commands::Status { config, json } => status(&config, json),
    }
}

fn load(config_path: &std::path::Path) -> Result<DaemonConfig> {
    DaemonConfig::load(config_path)
        .with_context(|| format!("loading configuration from {}", config_path.display()))
}

fn rebuild(config_path: &std::path::Path) -> Result<()> {
    let config = load(config_path)?;
    logging::init_tracing(&config.log_level, &config.log_format)?;
    let core = Core::new(&config).context("constructing core")?;
    core.rebuild_now();
    let status = core.status();
    println!(
        "rebuilt {} group(s), {} agent(s) known, {} pending",
        status.groups, status.agents_seen, status.queue_len
    );
    Ok(())
}

fn status(config_path: &std::path::Path, json: bool) -> Result<()> {
    let config = load(config_path)?;
    logging::init_tracing(&config.log_level, &config.log_format)?;
    let core = Core::new(&config).context("constructing core")?;
    let status = core.status();

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        println!("groups:       {}", status.groups);
        println!("agents seen:  {}", status.agents_seen);
        println!("queue length: {}", status.queue_len);
    }
    Ok(())
}

fn run(config_path: &std::path::Path) -> Result<()> {
    let config = load(config_path)?;
    logging::init_tracing(&config.log_level, &config.log_format)?;

    tracing::info!(
        shared_dir = %config.shared_dir.display(),
        listen_addr = %config.listen_addr,
        protocol = ?config.protocol,
        shared_reload = config.shared_reload,
        "starting agentd"
    );

    let core = Arc::new(Core::new(&config).context("constructing core")?);

    // The key store, group store, and request router are external
    // collaborators this core only ever calls through a trait. These are
    // the minimal stand-ins that let `agentd run` actually accept
    // connections; a real deployment wires its own implementations in
    // behind the same traits.
    let key_store = Arc::new(AutoKeyStore::new());
    let group_store: Arc<dyn GroupStore> = Arc::new(InMemoryGroupStore::new());
    let router: Arc<dyn RequestRouter> = Arc::new(NullRequestRouter);

    match config.protocol {
        agentd::config::Protocol::Stream => {
            run_stream(core, key_store, group_store, router, &config.listen_addr)
        }
        agentd::config::Protocol::Datagram => {
            run_datagram(core, key_store, group_store, router, &config.listen_addr)
        }
    }
}

fn run_stream(
    core: Arc<Core>,
    key_store: Arc<AutoKeyStore>,
    group_store: Arc<dyn GroupStore>,
    router: Arc<dyn RequestRouter>,
    listen_addr: &str,
) -> Result<()> {
    let transport = Arc::new(TcpTransport::new());
    core.spawn_background(Arc::clone(&group_store), transport.clone() as Arc<dyn Transport>);

    let listener = TcpListener::bind(listen_addr)
        .with_context(|| format!("binding stream transport on {listen_addr}"))?;
    tracing::info!(listen_addr, "stream transport listening");

    let mut next_index: u32 = 0;
    for incoming in listener.incoming() {
        let stream = match incoming {
            Ok(s) => s,
            Err(err) => {
                tracing::warn!(error = %err, "accept failed");
                continue;
            }
        };
        let core = Arc::clone(&core);
        let key_store = Arc::clone(&key_store);
        let router = Arc::clone(&router);
        let transport = Arc::clone(&transport);
        let agent_index = next_index;
        next_index += 1;

        std::thread::spawn(move || {
            handle_stream_connection(&core, &key_store, router.as_ref(), &transport, agent_index, stream);
        });
    }
    Ok(())
}

fn handle_stream_connection(
    core: &Core,
    key_store: &AutoKeyStore,
    router: &dyn RequestRouter,
    transport: &Arc<TcpTransport>,
    agent_index: u32,
    mut stream: TcpStream,
) {
    let peer = stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "unknown".to_owned());
    key_store.note_peer(agent_index, peer.clone());
    let Some(key) = key_store.lookup(agent_index) else {
        return;
    };

    match stream.try_clone() {
        Ok(clone) => transport.register(key.id.clone(), clone),
        Err(err) => {
            tracing::warn!(agent = %key.id, error = %err, "cloning connection for outbound sends failed");
            return;
        }
    }

    tracing::debug!(agent = %key.id, peer = %peer, "agent connected");
    loop {
        match read_framed_message(&mut stream) {
            Ok(Some(message)) => {
                core.ingest(&key, &message, router, transport.as_ref());
            }
            Ok(None) => break,
            Err(err) => {
                tracing::warn!(agent = %key.id, error = %err, "reading framed message failed");
                break;
            }
        }
    }
    tracing::debug!(agent = %key.id, "agent disconnected");
}

/// Read one length-prefixed message, or `Ok(None)` at a clean EOF between
/// messages.
fn read_framed_message(stream: &mut TcpStream) -> std::io::Result<Option<String>> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len == 0 || len > MAX_INBOUND_MESSAGE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("message length {len} out of bounds"),
        ));
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body)?;
    Ok(Some(String::from_utf8_lossy(&body).into_owned()))
}

fn run_datagram(
    core: Arc<Core>,
    key_store: Arc<AutoKeyStore>,
    group_store: Arc<dyn GroupStore>,
    router: Arc<dyn RequestRouter>,
    listen_addr: &str,
) -> Result<()> {
    let socket = UdpSocket::bind(listen_addr)
        .with_context(|| format!("binding datagram transport on {listen_addr}"))?;
    let transport = Arc::new(UdpTransport::new(
        socket.try_clone().context("cloning datagram socket")?,
    ));
    core.spawn_background(Arc::clone(&group_store), transport.clone() as Arc<dyn Transport>);
    tracing::info!(listen_addr, "datagram transport listening");

    let mut next_index: u32 = 0;
    let mut buf = vec![0u8; MAX_INBOUND_MESSAGE];
    loop {
        let (len, peer_addr) = match socket.recv_from(&mut buf) {
            Ok(result) => result,
            Err(err) => {
                tracing::warn!(error = %err, "datagram receive failed");
                continue;
            }
        };
        let agent_id = AgentId::new(peer_addr.to_string());
        let agent_index = next_index;
        next_index += 1;
        key_store.note_peer(agent_index, peer_addr.to_string());
        let key = agentd::core::AgentKey {
            id: agent_id.clone(),
            name: format!("agent-{agent_index}"),
            peer_address: peer_addr.to_string(),
        };
        transport.register(agent_id, peer_addr);

        let message = String::from_utf8_lossy(&buf[..len]).into_owned();
        core.ingest(&key, &message, router.as_ref(), transport.as_ref());
    }
}
