//! Per-connection command dispatch.
//!
//! [`CommandExecutor`] is shared by all connection tasks. Each task hands it
//! decoded frames together with its own [`ClientConnection`], so commands of
//! one connection run strictly in order while different connections run
//! concurrently.

use crate::commands::{
    execute_command, BulkMutateHandler, CommandKind, CommandServices, CommandStats,
    InitializeHandler, ParseError, RawCommand, Response, ResponseBuilder,
};
use crate::protocol::Frame;
use crate::session::{ClientConnection, SessionRegistry};
use std::sync::Arc;
use tracing::{info, trace, warn};

pub struct CommandExecutor {
    initialize: InitializeHandler,
    add_bulk: BulkMutateHandler,
    insert_bulk: BulkMutateHandler,
    services: CommandServices,
    registry: Arc<SessionRegistry>,
}

impl CommandExecutor {
    pub fn new(initialize: InitializeHandler, services: CommandServices) -> Self {
        let registry = Arc::clone(initialize.registry());
        Self {
            initialize,
            add_bulk: BulkMutateHandler::add(),
            insert_bulk: BulkMutateHandler::insert(),
            services,
            registry,
        }
    }

    pub fn stats(&self) -> &Arc<CommandStats> {
        &self.services.stats
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Executes one request frame and returns the frame to send back.
    ///
    /// A frame without a readable header cannot be correlated and gets a
    /// plain error frame instead of an exception response.
    pub fn execute(&self, conn: &mut ClientConnection, frame: Frame) -> Frame {
        match RawCommand::from_frame(frame) {
            Ok(raw) => self.execute_raw(conn, &raw).to_frame(),
            Err(e) => {
                warn!(client = %conn.peer(), error = %e, "Undecodable command header");
                Frame::error(format!("ERR {}", e))
            }
        }
    }

    pub fn execute_raw(&self, conn: &mut ClientConnection, raw: &RawCommand) -> Response {
        trace!(
            client = %conn.peer(),
            command = %raw.tag(),
            request_id = raw.request_id(),
            "Dispatching command"
        );

        match CommandKind::from_tag(raw.tag()) {
            Some(CommandKind::Initialize) => {
                execute_command(&self.initialize, &self.services, conn, raw)
            }
            Some(CommandKind::AddBulk) => execute_command(&self.add_bulk, &self.services, conn, raw),
            Some(CommandKind::InsertBulk) => {
                execute_command(&self.insert_bulk, &self.services, conn, raw)
            }
            None => ResponseBuilder::for_command(raw)
                .exception(&ParseError::UnknownCommand(raw.tag().to_string()).into()),
        }
    }

    /// Tears down whatever session the connection holds.
    ///
    /// The registry entry is removed only if it still belongs to this
    /// session; a session that was replaced leaves its successor alone.
    pub fn close_connection(&self, conn: &mut ClientConnection) {
        let Some(session) = conn.take_session() else {
            return;
        };

        let unregistered = self.registry.unregister_if(session.client_id(), &session);
        if let Err(e) = session.dispose() {
            warn!(client_id = %session.client_id(), error = %e, "Session disposal failed");
        }
        info!(
            client = %conn.peer(),
            client_id = %session.client_id(),
            replaced = session.is_replaced(),
            unregistered,
            "Client session closed"
        );
    }
}
