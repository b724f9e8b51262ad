//! The contract every command handler follows.
//!
//! ```text
//! RawCommand ──parse()──> Request ──execute()──> ResponseBody
//!      │          │                    │
//!      │          └── ParseError ──────┴── SetupError / StoreError
//!      │                                         │
//!      └─ ResponseBuilder (request id, command id) ──> Response
//! ```
//!
//! [`execute_command`] is the only place handlers are invoked. It times the
//! whole invocation, turns every error into an exception response carrying
//! the original correlation ids, reports the handler's statistic and then
//! writes the optional audit entry. Nothing a handler returns can escape as
//! anything but a [`Response`].

use crate::commands::{
    AuditEntry, AuditSink, CommandKind, CommandStats, ParseError, RawCommand, Response,
    ResponseBody, ResponseBuilder,
};
use crate::session::ClientConnection;
use crate::storage::StoreError;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, warn};

/// Handshake-specific rejections.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SetupError {
    #[error("server can not accept remote clients in this configuration")]
    RemoteClientsUnsupported,

    #[error("cache is unavailable: {0}")]
    CacheUnavailable(StoreError),

    #[error("connection is already initialized as '{0}'")]
    AlreadyInitialized(String),

    #[error("connection has not been initialized")]
    NotInitialized,
}

/// Everything that can turn a command into an exception response.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Setup(#[from] SetupError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One command type.
pub trait CommandHandler {
    /// Handler-local typed form of the command.
    type Request;

    fn kind(&self) -> CommandKind;

    /// Decodes the command. Must not touch the store or any session state.
    fn parse(&self, raw: &RawCommand, conn: &ClientConnection) -> Result<Self::Request, ParseError>;

    fn execute(
        &self,
        conn: &mut ClientConnection,
        raw: &RawCommand,
        request: &Self::Request,
    ) -> Result<ResponseBody, CommandError>;

    /// Adds this invocation to the handler's counter.
    fn report_statistic(&self, stats: &CommandStats, elapsed: Duration) {
        stats.record(self.kind(), elapsed);
    }

    /// Describes the invocation for the audit log, if the handler audits.
    fn audit_entry(
        &self,
        _conn: &ClientConnection,
        _request: &Self::Request,
        _elapsed: Duration,
        _error: Option<&CommandError>,
    ) -> Option<AuditEntry> {
        None
    }
}

/// Shared collaborators handed to every command invocation.
#[derive(Clone, Default)]
pub struct CommandServices {
    pub stats: Arc<CommandStats>,
    pub audit: Option<Arc<dyn AuditSink>>,
}

impl std::fmt::Debug for CommandServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandServices")
            .field("stats", &self.stats)
            .field("audit", &self.audit.is_some())
            .finish()
    }
}

impl CommandServices {
    pub fn new(stats: Arc<CommandStats>) -> Self {
        Self { stats, audit: None }
    }

    pub fn with_audit(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }
}

/// Runs one command through `handler`.
pub fn execute_command<H: CommandHandler>(
    handler: &H,
    services: &CommandServices,
    conn: &mut ClientConnection,
    raw: &RawCommand,
) -> Response {
    let builder = ResponseBuilder::for_command(raw);
    let started = Instant::now();

    let request = handler.parse(raw, conn);
    let outcome = match &request {
        Ok(request) => handler.execute(conn, raw, request),
        Err(e) => Err(CommandError::from(e.clone())),
    };

    let elapsed = started.elapsed();
    handler.report_statistic(&services.stats, elapsed);

    if let (Ok(request), Some(sink)) = (&request, &services.audit) {
        record_audit(handler, services, sink.as_ref(), conn, request, elapsed, &outcome);
    }

    match outcome {
        Ok(body) => builder.success(body),
        Err(e) => {
            match &e {
                CommandError::Store(_) => warn!(
                    client = %conn.peer(),
                    command = %handler.kind(),
                    request_id = raw.request_id(),
                    error = %e,
                    "Command failed"
                ),
                _ => error!(
                    client = %conn.peer(),
                    command = %handler.kind(),
                    request_id = raw.request_id(),
                    error = %e,
                    "Command rejected"
                ),
            }
            builder.exception(&e)
        }
    }
}

fn record_audit<H: CommandHandler>(
    handler: &H,
    services: &CommandServices,
    sink: &dyn AuditSink,
    conn: &ClientConnection,
    request: &H::Request,
    elapsed: Duration,
    outcome: &Result<ResponseBody, CommandError>,
) {
    let Some(entry) = handler.audit_entry(conn, request, elapsed, outcome.as_ref().err()) else {
        return;
    };
    if let Err(e) = sink.record(&entry) {
        services.stats.record_audit_failure();
        debug!(command = %handler.kind(), error = %e, "Audit entry dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::AuditError;
    use crate::protocol::Frame;
    use crate::session::tests::loopback;
    use crate::session::TransportHandle;
    use crate::storage::Expiration;
    use parking_lot::Mutex;

    /// Echoes field 0, fails with whatever field 1 names.
    struct EchoHandler;

    impl CommandHandler for EchoHandler {
        type Request = (String, Option<String>);

        fn kind(&self) -> CommandKind {
            CommandKind::AddBulk
        }

        fn parse(&self, raw: &RawCommand, _conn: &ClientConnection) -> Result<Self::Request, ParseError> {
            let value = raw.required_str(0, "value")?.to_string();
            let fail = raw.optional_str(1, "fail")?.map(str::to_string);
            Ok((value, fail))
        }

        fn execute(
            &self,
            _conn: &mut ClientConnection,
            _raw: &RawCommand,
            request: &Self::Request,
        ) -> Result<ResponseBody, CommandError> {
            match request.1.as_deref() {
                Some("store") => Err(StoreError::Internal("boom".into()).into()),
                Some("setup") => Err(SetupError::RemoteClientsUnsupported.into()),
                _ => Ok(ResponseBody::Exception(crate::commands::response::ExceptionResponse {
                    description: request.0.clone(),
                })),
            }
        }

        fn audit_entry(
            &self,
            conn: &ClientConnection,
            request: &Self::Request,
            elapsed: Duration,
            error: Option<&CommandError>,
        ) -> Option<AuditEntry> {
            Some(AuditEntry {
                method: "echo",
                key_count: 1,
                value_count: 1,
                expiration: Expiration::none(),
                priority: 0,
                tags: Vec::new(),
                group: None,
                subgroup: None,
                provider: Some(request.0.clone()),
                resync_provider: None,
                method_overload: 0,
                update_callback_id: -1,
                ds_added_callback_id: -1,
                exception: error.map(ToString::to_string),
                elapsed,
                client_id: String::new(),
                client_address: conn.peer(),
            })
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        entries: Mutex<Vec<AuditEntry>>,
        fail: bool,
    }

    impl AuditSink for RecordingSink {
        fn record(&self, entry: &AuditEntry) -> Result<(), AuditError> {
            if self.fail {
                return Err(AuditError::Unavailable("disk full".into()));
            }
            self.entries.lock().push(entry.clone());
            Ok(())
        }
    }

    fn conn() -> ClientConnection {
        let (transport, _closed) = TransportHandle::new();
        ClientConnection::new(loopback(50000), loopback(9800), transport)
    }

    fn raw(fields: Vec<Frame>) -> RawCommand {
        RawCommand::new("ADDBULK", 77, 12, 2, fields)
    }

    #[test]
    fn test_success_echoes_ids() {
        let services = CommandServices::default();
        let response = execute_command(&EchoHandler, &services, &mut conn(), &raw(vec![Frame::bulk("hi")]));
        assert_eq!((response.request_id, response.command_id), (77, 12));
        assert_eq!(services.stats.count(CommandKind::AddBulk), 1);
    }

    #[test]
    fn test_every_failure_echoes_ids_and_is_timed() {
        let services = CommandServices::default();
        let cases = vec![
            raw(vec![]),
            raw(vec![Frame::bulk("x"), Frame::bulk("store")]),
            raw(vec![Frame::bulk("x"), Frame::bulk("setup")]),
        ];
        for command in &cases {
            let response = execute_command(&EchoHandler, &services, &mut conn(), command);
            assert!(response.is_exception());
            assert_eq!((response.request_id, response.command_id), (77, 12));
        }
        assert_eq!(services.stats.count(CommandKind::AddBulk), 3);
    }

    #[test]
    fn test_parse_failure_description() {
        let response = execute_command(&EchoHandler, &CommandServices::default(), &mut conn(), &raw(vec![]));
        assert_eq!(
            response.body,
            ResponseBody::Exception(crate::commands::response::ExceptionResponse {
                description: "required field 'value' is missing".to_string(),
            })
        );
    }

    #[test]
    fn test_audit_records_exception_text() {
        let sink = Arc::new(RecordingSink::default());
        let services = CommandServices::default().with_audit(sink.clone());

        execute_command(&EchoHandler, &services, &mut conn(), &raw(vec![Frame::bulk("a"), Frame::bulk("store")]));
        execute_command(&EchoHandler, &services, &mut conn(), &raw(vec![]));

        // Unparsed commands are not audited.
        let entries = sink.entries.lock();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].exception.as_deref(), Some("store failure: boom"));
        assert_eq!(entries[0].client_address, loopback(50000));
    }

    #[test]
    fn test_audit_failure_is_swallowed() {
        let sink = Arc::new(RecordingSink {
            fail: true,
            ..Default::default()
        });
        let services = CommandServices::default().with_audit(sink);

        let response = execute_command(&EchoHandler, &services, &mut conn(), &raw(vec![Frame::bulk("ok")]));

        assert!(matches!(response.body, ResponseBody::Exception(ref e) if e.description == "ok"));
        assert_eq!(services.stats.audit_failures(), 1);
        assert_eq!(services.stats.count(CommandKind::AddBulk), 1);
    }
}
