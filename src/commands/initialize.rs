//! Session handshake (`INIT`).
//!
//! ```text
//!  Parsing ──> Establishing ──> Registering ──> EventBinding ──> Responding ──> Established
//!     │             │                │                │              │
//!     └─────────────┴────────────────┴──── Rejected ──┴──────────────┘
//! ```
//!
//! - **Parsing** decodes identity, versions, licence and builds the client
//!   descriptor. Which descriptor parser runs is picked from
//!   [`DESCRIPTOR_STRATEGIES`] by client version.
//! - **Establishing** applies the [`DeploymentPolicy`] and opens the cache.
//! - **Registering** installs the session in the [`SessionRegistry`]. A
//!   session evicted for the same identity is disposed after the registry
//!   lock is released, without a disconnect notification.
//! - **EventBinding** creates the session's event queue and binds it to the
//!   [`EventHub`]. Skipped when event push is turned off.
//! - **Responding** reports server capabilities and draining nodes.
//!
//! Steps that already happened are not undone when a later one fails.

use crate::commands::{
    CommandError, CommandHandler, CommandKind, ParseError, RawCommand, ResponseBody, SetupError,
};
use crate::commands::response::InitializeResponse;
use crate::commands::request::bytes_at;
use crate::protocol::Frame;
use crate::session::{
    Capabilities, ClientConnection, ClientDescriptor, EventBinding, EventHub, Session,
    SessionRegistry, SessionSettings,
};
use crate::storage::{CacheCatalog, CacheOpenRequest};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::{info, warn};

/// Clients older than this send an unstructured identity string.
pub const LEGACY_CLIENT_VERSION: i32 = 4620;

/// Lowest command version able to acknowledge logged requests.
pub const ACK_MIN_COMMAND_VERSION: i32 = 2;

/// Client id recorded for legacy clients, which cannot report an app name.
pub const LEGACY_CLIENT_LABEL: &str = "Legacy Client (AppName Not Supported)";

mod field {
    pub const CACHE_ID: usize = 0;
    pub const CLIENT_ID: usize = 1;
    pub const LICENCE: usize = 2;
    pub const CLIENT_VERSION: usize = 3;
    pub const IS_DOTNET: usize = 4;
    pub const IS_AZURE: usize = 5;
    pub const CLIENT_IP: usize = 6;
    pub const CLIENT_INFO: usize = 7;
}

/// Which peers may open sessions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeploymentPolicy {
    #[default]
    AcceptRemote,
    /// Only clients on the server's own address
    LocalOnly,
}

impl DeploymentPolicy {
    pub fn admits(self, peer: SocketAddr, local: SocketAddr) -> bool {
        match self {
            DeploymentPolicy::AcceptRemote => true,
            DeploymentPolicy::LocalOnly => peer.ip() == local.ip(),
        }
    }
}

/// Decoded `INIT` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitializeRequest {
    pub cache_id: String,
    pub client_id: String,
    pub licence: String,
    pub client_version: i32,
    pub command_version: i32,
    pub is_dotnet_client: bool,
    pub is_azure_client: bool,
    /// Address the client reports for itself
    pub client_ip: Option<String>,
    pub descriptor: ClientDescriptor,
    pub legacy_client: bool,
}

/// Inputs available to a descriptor parser.
pub struct DescriptorInput<'a> {
    pub client_id: &'a str,
    pub client_info: Option<&'a [Frame]>,
    pub peer: IpAddr,
}

pub type DescriptorStrategy = for<'a> fn(&DescriptorInput<'a>) -> Result<ClientDescriptor, ParseError>;

/// Ordered by descending minimum client version; the first match wins.
pub const DESCRIPTOR_STRATEGIES: [(i32, DescriptorStrategy); 2] = [
    (LEGACY_CLIENT_VERSION, structured_descriptor),
    (i32::MIN, legacy_descriptor),
];

fn descriptor_strategy(client_version: i32) -> DescriptorStrategy {
    DESCRIPTOR_STRATEGIES
        .iter()
        .find(|(min_version, _)| client_version >= *min_version)
        .map_or(legacy_descriptor as DescriptorStrategy, |(_, strategy)| *strategy)
}

/// `[client_id, app_name, process_id, machine_name]` as sent by current clients.
fn structured_descriptor(input: &DescriptorInput<'_>) -> Result<ClientDescriptor, ParseError> {
    let info = input
        .client_info
        .ok_or(ParseError::MissingField("client_info"))?;

    let text = |index: usize| {
        info.get(index)
            .filter(|f| !f.is_null())
            .and_then(Frame::as_str)
            .map(str::to_string)
    };
    let process_id = match info.get(2).filter(|f| !f.is_null()) {
        Some(frame) => Some(
            frame
                .as_integer()
                .and_then(|pid| u32::try_from(pid).ok())
                .ok_or_else(|| ParseError::InvalidField {
                    field: "client_info.process_id",
                    reason: "expected a process id".to_string(),
                })?,
        ),
        None => None,
    };
    let client_id = bytes_at(info, 0, "client_info.client_id")?;

    Ok(ClientDescriptor {
        client_id: String::from_utf8_lossy(&client_id).into_owned(),
        app_name: text(1),
        process_id,
        machine_name: text(3),
        address: Some(input.peer),
    })
}

/// Best-effort reading of a legacy `machine:pid:...` identity. Never fails.
fn legacy_descriptor(input: &DescriptorInput<'_>) -> Result<ClientDescriptor, ParseError> {
    let mut parts = input.client_id.split(':');
    let machine_name = parts
        .next()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    let process_id = parts.next().and_then(|s| s.trim().parse::<u32>().ok());

    Ok(ClientDescriptor {
        client_id: LEGACY_CLIENT_LABEL.to_string(),
        app_name: None,
        process_id,
        machine_name,
        address: Some(input.peer),
    })
}

/// Performs the session handshake.
pub struct InitializeHandler {
    catalog: Arc<dyn CacheCatalog>,
    registry: Arc<SessionRegistry>,
    events: Arc<EventHub>,
    request_logging_enabled: bool,
    policy: DeploymentPolicy,
    event_push: bool,
}

impl InitializeHandler {
    pub fn new(
        catalog: Arc<dyn CacheCatalog>,
        registry: Arc<SessionRegistry>,
        events: Arc<EventHub>,
        request_logging_enabled: bool,
        policy: DeploymentPolicy,
    ) -> Self {
        Self {
            catalog,
            registry,
            events,
            request_logging_enabled,
            policy,
            event_push: true,
        }
    }

    /// Whether new sessions get an event queue. Without one nothing is
    /// buffered for the client.
    pub fn with_event_push(mut self, enabled: bool) -> Self {
        self.event_push = enabled;
        self
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }
}

impl CommandHandler for InitializeHandler {
    type Request = InitializeRequest;

    fn kind(&self) -> CommandKind {
        CommandKind::Initialize
    }

    fn parse(&self, raw: &RawCommand, conn: &ClientConnection) -> Result<InitializeRequest, ParseError> {
        let cache_id = raw.required_str(field::CACHE_ID, "cache_id")?.to_string();
        let client_id = raw.required_str(field::CLIENT_ID, "client_id")?.to_string();
        let licence = raw
            .optional_str(field::LICENCE, "licence")?
            .unwrap_or_default()
            .to_string();
        let client_version = i32::try_from(raw.required_int(field::CLIENT_VERSION, "client_version")?)
            .map_err(|_| ParseError::InvalidField {
                field: "client_version",
                reason: "out of range".to_string(),
            })?;

        let input = DescriptorInput {
            client_id: &client_id,
            client_info: raw.optional_array(field::CLIENT_INFO, "client_info")?,
            peer: conn.peer().ip(),
        };
        let descriptor = descriptor_strategy(client_version)(&input)?;

        Ok(InitializeRequest {
            is_dotnet_client: raw.flag(field::IS_DOTNET, "is_dotnet")?,
            is_azure_client: raw.flag(field::IS_AZURE, "is_azure")?,
            client_ip: raw.optional_str(field::CLIENT_IP, "client_ip")?.map(str::to_string),
            command_version: raw.command_version(),
            legacy_client: client_version < LEGACY_CLIENT_VERSION,
            cache_id,
            client_id,
            licence,
            client_version,
            descriptor,
        })
    }

    fn execute(
        &self,
        conn: &mut ClientConnection,
        _raw: &RawCommand,
        request: &InitializeRequest,
    ) -> Result<ResponseBody, CommandError> {
        if let Some(existing) = conn.session() {
            return Err(SetupError::AlreadyInitialized(existing.client_id().to_string()).into());
        }

        // Establishing
        if !self.policy.admits(conn.peer(), conn.local()) {
            return Err(SetupError::RemoteClientsUnsupported.into());
        }
        let cache = self
            .catalog
            .open(&CacheOpenRequest {
                cache_id: &request.cache_id,
                licence: &request.licence,
                client: &request.descriptor,
                is_dotnet_client: request.is_dotnet_client,
            })
            .map_err(SetupError::CacheUnavailable)?;

        let supports_acknowledgement =
            request.command_version >= ACK_MIN_COMMAND_VERSION && self.request_logging_enabled;
        let session = Arc::new(Session::new(SessionSettings {
            client_id: request.client_id.clone(),
            client_version: request.client_version,
            command_version: request.command_version,
            capabilities: Capabilities {
                supports_acknowledgement,
                is_dotnet_client: request.is_dotnet_client,
                is_azure_client: request.is_azure_client,
                legacy_client: request.legacy_client,
            },
            descriptor: request.descriptor.clone(),
            cache: Arc::clone(&cache),
            peer: conn.peer(),
            transport: conn.transport().clone(),
        }));

        // Registering
        if let Some(evicted) = self.registry.register(&request.client_id, Arc::clone(&session)) {
            warn!(
                client_id = %request.client_id,
                previous = %evicted.peer(),
                client = %conn.peer(),
                "Another client with the same id exists, replacing it"
            );
            if let Err(e) = evicted.dispose() {
                warn!(client_id = %request.client_id, error = %e, "Failed to dispose replaced session");
            }
        }
        conn.attach(Arc::clone(&session));

        // EventBinding
        if self.event_push {
            let queue = self.events.create_queue();
            let slave = self.events.bind(&queue, &request.client_id);
            session.attach_events(EventBinding::new(Arc::clone(&self.events), queue, slave));
        }

        // Responding
        let draining_servers = cache.shutdown_servers();
        info!(
            client = %conn.peer(),
            client_id = %request.client_id,
            cache_id = %request.cache_id,
            legacy = request.legacy_client,
            "Client connected"
        );

        Ok(ResponseBody::Initialize(InitializeResponse {
            request_logging_enabled: supports_acknowledgement,
            persistence_enabled: cache.is_persistence_enabled(),
            persistence_interval: cache.persistence_interval(),
            cache_type: cache.cache_type().to_lowercase(),
            shutdown_in_progress: !draining_servers.is_empty(),
            draining_servers,
        }))
    }
}
