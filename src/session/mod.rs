//! Client Sessions
//!
//! A [`Session`] is the server-side state of one handshaken client: its
//! identity, negotiated capabilities, the cache it is bound to, its event
//! queue and a handle on its transport. Sessions are shared as
//! `Arc<Session>` between the owning connection and the [`SessionRegistry`].
//!
//! ## Lifecycle
//!
//! ```text
//!  connect ──> ClientConnection (no session)
//!                 │ INIT
//!                 ▼
//!              Session registered ──── same identity registers again ───┐
//!                 │                                                    ▼
//!                 │ connection closes                    marked replaced, disposed:
//!                 ▼                                      transport closed, queue unbound,
//!              unregistered + disposed:                  NO disconnect notification
//!              transport closed, queue unbound,
//!              store told the client disconnected
//! ```

pub mod events;
pub mod registry;

pub use events::{CacheEvent, EventHub, EventQueue, SlaveId};
pub use registry::SessionRegistry;

use crate::storage::CacheStore;
use parking_lot::Mutex;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// Describes the client process behind a connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientDescriptor {
    pub client_id: String,
    pub app_name: Option<String>,
    pub process_id: Option<u32>,
    pub machine_name: Option<String>,
    /// Address the server observed for the connection
    pub address: Option<IpAddr>,
}

/// What was negotiated during the handshake.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub supports_acknowledgement: bool,
    pub is_dotnet_client: bool,
    pub is_azure_client: bool,
    /// Client predates structured descriptors
    pub legacy_client: bool,
}

/// Lets anyone holding it ask the connection task to shut its socket.
#[derive(Debug, Clone)]
pub struct TransportHandle {
    close_tx: Arc<watch::Sender<bool>>,
}

impl TransportHandle {
    /// Creates a handle and the receiver the connection task watches.
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (close_tx, close_rx) = watch::channel(false);
        (
            Self {
                close_tx: Arc::new(close_tx),
            },
            close_rx,
        )
    }

    pub fn close(&self) {
        self.close_tx.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.close_tx.borrow()
    }
}

/// Errors raised while tearing a session down.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("event queue {0} was not bound to the hub")]
    UnknownSlave(SlaveId),
}

/// A session's event queue together with its registration on the hub.
#[derive(Debug)]
pub struct EventBinding {
    hub: Arc<EventHub>,
    queue: EventQueue,
    slave: SlaveId,
}

impl EventBinding {
    pub fn new(hub: Arc<EventHub>, queue: EventQueue, slave: SlaveId) -> Self {
        Self { hub, queue, slave }
    }

    pub fn slave(&self) -> SlaveId {
        self.slave
    }
}

/// Everything needed to create a [`Session`].
pub struct SessionSettings {
    pub client_id: String,
    pub client_version: i32,
    pub command_version: i32,
    pub capabilities: Capabilities,
    pub descriptor: ClientDescriptor,
    pub cache: Arc<dyn CacheStore>,
    pub peer: SocketAddr,
    pub transport: TransportHandle,
}

/// Server-side state for one connected client.
pub struct Session {
    client_id: String,
    client_version: i32,
    command_version: i32,
    capabilities: Capabilities,
    descriptor: ClientDescriptor,
    cache: Arc<dyn CacheStore>,
    peer: SocketAddr,
    transport: TransportHandle,
    events: Mutex<Option<EventBinding>>,
    replaced: AtomicBool,
    disposed: AtomicBool,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("client_id", &self.client_id)
            .field("cache_id", &self.cache.cache_id())
            .field("peer", &self.peer)
            .field("replaced", &self.is_replaced())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl Session {
    pub fn new(settings: SessionSettings) -> Self {
        Self {
            client_id: settings.client_id,
            client_version: settings.client_version,
            command_version: settings.command_version,
            capabilities: settings.capabilities,
            descriptor: settings.descriptor,
            cache: settings.cache,
            peer: settings.peer,
            transport: settings.transport,
            events: Mutex::new(None),
            replaced: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn client_version(&self) -> i32 {
        self.client_version
    }

    pub fn command_version(&self) -> i32 {
        self.command_version
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn descriptor(&self) -> &ClientDescriptor {
        &self.descriptor
    }

    pub fn cache(&self) -> &Arc<dyn CacheStore> {
        &self.cache
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Stores the event binding created after registration.
    pub fn attach_events(&self, binding: EventBinding) {
        *self.events.lock() = Some(binding);
    }

    pub fn slave_id(&self) -> Option<SlaveId> {
        self.events.lock().as_ref().map(EventBinding::slave)
    }

    /// Takes the consuming half of this session's event queue.
    pub fn take_event_receiver(&self) -> Option<mpsc::UnboundedReceiver<CacheEvent>> {
        self.events
            .lock()
            .as_ref()
            .and_then(|binding| binding.queue.take_receiver())
    }

    /// Flags the session as superseded by a newer one with the same identity.
    pub fn mark_replaced(&self) {
        self.replaced.store(true, Ordering::Release);
    }

    pub fn is_replaced(&self) -> bool {
        self.replaced.load(Ordering::Acquire)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Tears the session down. Only the first call has any effect.
    ///
    /// The store hears about the disconnect only when the session was not
    /// replaced: a replacement is a reconnect from the cache's point of view.
    pub fn dispose(&self) -> Result<(), SessionError> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let binding = self.events.lock().take();
        self.transport.close();

        if !self.is_replaced() {
            self.cache.client_disconnected(&self.client_id);
        }
        debug!(
            client_id = %self.client_id,
            replaced = self.is_replaced(),
            "Session disposed"
        );

        match binding {
            Some(binding) if !binding.hub.unbind(binding.slave) => {
                Err(SessionError::UnknownSlave(binding.slave))
            }
            _ => Ok(()),
        }
    }
}

/// Per-connection state owned by the connection task.
///
/// Exists from accept until close; gains a [`Session`] on a successful
/// handshake.
#[derive(Debug)]
pub struct ClientConnection {
    peer: SocketAddr,
    local: SocketAddr,
    transport: TransportHandle,
    session: Option<Arc<Session>>,
}

impl ClientConnection {
    pub fn new(peer: SocketAddr, local: SocketAddr, transport: TransportHandle) -> Self {
        Self {
            peer,
            local,
            transport,
            session: None,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn local(&self) -> SocketAddr {
        self.local
    }

    pub fn transport(&self) -> &TransportHandle {
        &self.transport
    }

    pub fn session(&self) -> Option<&Arc<Session>> {
        self.session.as_ref()
    }

    pub fn attach(&mut self, session: Arc<Session>) {
        self.session = Some(session);
    }

    pub fn take_session(&mut self) -> Option<Arc<Session>> {
        self.session.take()
    }
}
