//! External collaborator traits: the systems this core reads from and
//! writes to but does not own. Modeling them as trait objects keeps the
//! Reconciliation Worker and Intake modules testable without a real
//! socket, a real key store, or a real group assignment service.

use std::io;
use std::net::{TcpStream, UdpSocket};
use std::sync::Mutex;

use super::types::AgentId;

/// An agent's shared-key material, as handed back by the key store given
/// an agent index. Opaque here beyond those three fields — this core
/// only ever reads them to derive the keep-alive file path and to log.
#[derive(Debug, Clone)]
pub struct AgentKey {
    pub id: AgentId,
    pub name: String,
    pub peer_address: String,
}

/// Delivers bytes to a connected agent. Implementations decide whether
/// pacing applies: [`Transport::is_datagram`] tells the Reconciliation
/// Worker whether to sleep between chunks.
pub trait Transport: Send + Sync {
    /// Send `buf` to `agent`. Errors are logged by the caller and treated
    /// as "agent unreachable" — never fatal to the core.
    fn send(&self, agent: &AgentId, buf: &[u8]) -> io::Result<()>;

    /// Whether this transport is a datagram transport and therefore needs
    /// the every-30-frames pacing sleep.
    fn is_datagram(&self) -> bool;
}

/// Resolves an agent's shared-key material by its numeric index in the key
/// store. This core only ever calls `lookup`; it does not own the store.
pub trait KeyStore: Send + Sync {
    fn lookup(&self, agent_index: u32) -> Option<AgentKey>;
}

/// Tracks which group an agent is currently assigned to, and lets the
/// Reconciliation Worker record an inferred assignment.
pub trait GroupStore: Send + Sync {
    fn get_agent_group(&self, agent: &AgentId) -> Option<String>;
    fn set_agent_group(&self, agent: &AgentId, group: &str);
}

/// Forwards non-heartbeat control messages to the request subsystem.
/// This core only routes them; it does not own the subsystem itself.
pub trait RequestRouter: Send + Sync {
    fn req_save(&self, counter: &str, payload: &[u8]);
}

/// [`Transport`] over a connected TCP stream, one per agent.
pub struct TcpTransport {
    streams: Mutex<std::collections::HashMap<AgentId, TcpStream>>,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self {
            streams: Mutex::new(std::collections::HashMap::new()),
        }
    }

    pub fn register(&self, agent: AgentId, stream: TcpStream) {
        self.streams
            .lock()
            .expect("transport mutex poisoned")
            .insert(agent, stream);
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for TcpTransport {
    fn send(&self, agent: &AgentId, buf: &[u8]) -> io::Result<()> {
        use std::io::Write;
        let mut streams = self.streams.lock().expect("transport mutex poisoned");
        let stream = streams
            .get_mut(agent)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "agent not connected"))?;
        stream.write_all(buf)
    }

    fn is_datagram(&self) -> bool {
        false
    }
}

/// [`Transport`] over a single shared UDP socket, one agent address per
/// send; pacing applies here.
pub struct UdpTransport {
    socket: UdpSocket,
    addresses: Mutex<std::collections::HashMap<AgentId, std::net::SocketAddr>>,
}

impl UdpTransport {
    pub fn new(socket: UdpSocket) -> Self {
        Self {
            socket,
            addresses: Mutex::new(std::collections::HashMap::new()),
        }
    }

    pub fn register(&self, agent: AgentId, addr: std::net::SocketAddr) {
        self.addresses
            .lock()
            .expect("transport mutex poisoned")
            .insert(agent, addr);
    }
}

impl Transport for UdpTransport {
    fn send(&self, agent: &AgentId, buf: &[u8]) -> io::Result<()> {
        let addresses = self.addresses.lock().expect("transport mutex poisoned");
        let addr = addresses
            .get(agent)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "agent address unknown"))?;
        self.socket.send_to(buf, addr)?;
        Ok(())
    }

    fn is_datagram(&self) -> bool {
        true
    }
}

/// In-memory [`Transport`] used by tests: records every send in order
/// instead of touching a socket.
#[derive(Default)]
pub struct RecordingTransport {
    datagram: bool,
    sent: Mutex<Vec<(AgentId, Vec<u8>)>>,
}

impl RecordingTransport {
    pub fn new(datagram: bool) -> Self {
        Self {
            datagram,
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn sent_to(&self, agent: &AgentId) -> Vec<u8> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == agent)
            .flat_map(|(_, bytes)| bytes.clone())
            .collect()
    }

    pub fn send_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

impl Transport for RecordingTransport {
    fn send(&self, agent: &AgentId, buf: &[u8]) -> io::Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((agent.clone(), buf.to_vec()));
        Ok(())
    }

    fn is_datagram(&self) -> bool {
        self.datagram
    }
}

/// In-memory [`GroupStore`] used by tests and by the `rebuild`/`status`
/// CLI subcommands, which never need a real assignment service.
#[derive(Default)]
pub struct InMemoryGroupStore {
    assignments: Mutex<std::collections::HashMap<AgentId, String>>,
}

impl InMemoryGroupStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_assignment(self, agent: AgentId, group: impl Into<String>) -> Self {
        self.assignments
            .lock()
            .unwrap()
            .insert(agent, group.into());
        self
    }
}

impl GroupStore for InMemoryGroupStore {
    fn get_agent_group(&self, agent: &AgentId) -> Option<String> {
        self.assignments.lock().unwrap().get(agent).cloned()
    }

    fn set_agent_group(&self, agent: &AgentId, group: &str) {
        self.assignments
            .lock()
            .unwrap()
            .insert(agent.clone(), group.to_owned());
    }
}

/// [`RequestRouter`] that drops every message. Used when the request
/// subsystem has not been wired up for a given deployment.
#[derive(Default)]
pub struct NullRequestRouter;

impl RequestRouter for NullRequestRouter {
    fn req_save(&self, _counter: &str, _payload: &[u8]) {}
}

/// [`KeyStore`] stand-in for deployments with no real shared-key
/// infrastructure wired up: assigns each never-before-seen numeric index a
/// stable identity derived from the index itself. The real key store
/// (shared-key material, peer address resolution) is out of scope for this
/// core — this exists only so `agentd run` has something to
/// call.
#[derive(Default)]
pub struct AutoKeyStore {
    peers: Mutex<std::collections::HashMap<u32, String>>,
}

impl AutoKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the peer address a given index connected from, so subsequent
    /// lookups report it accurately.
    pub fn note_peer(&self, agent_index: u32, peer_address: impl Into<String>) {
        self.peers
            .lock()
            .expect("key store mutex poisoned")
            .insert(agent_index, peer_address.into());
    }
}

impl KeyStore for AutoKeyStore {
    fn lookup(&self, agent_index: u32) -> Option<AgentKey> {
        let peer_address = self
            .peers
            .lock()
            .expect("key store mutex poisoned")
            .get(&agent_index)
            .cloned()
            .unwrap_or_else(|| "unknown".to_owned());
        Some(AgentKey {
            id: AgentId::new(format!("{agent_index:03}")),
            name: format!("agent-{agent_index}"),
            peer_address,
        })
    }
}
