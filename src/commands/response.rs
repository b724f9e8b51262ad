//! Response envelopes.
//!
//! Every response echoes the request id and command id of the command it
//! answers, including exception responses. [`ResponseBuilder`] captures the
//! pair once, before the handler runs, so no code path can produce a
//! response without them.
//!
//! Encoded shapes:
//!
//! ```text
//! [INIT,       rid, cid, logging, persistence, interval_ms, cache_type, draining, [[ip, port, blocking_id, timeout_ms], ...]]
//! [ADDBULK,    rid, cid, [[key, error], ...], [[key, version], ...] | nil, recipient | nil]
//! [INSERTBULK, rid, cid, ... same as ADDBULK ...]
//! [EXCEPTION,  rid, cid, description]
//! ```

use crate::commands::{CommandError, CommandKind, RawCommand};
use crate::protocol::Frame;
use crate::storage::{BulkOutcome, DrainingServer, KeyFailure, KeyOutcome, Version};
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Handshake reply: what the server offers this client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitializeResponse {
    pub request_logging_enabled: bool,
    pub persistence_enabled: bool,
    pub persistence_interval: Duration,
    /// Lower-cased store type tag
    pub cache_type: String,
    pub shutdown_in_progress: bool,
    pub draining_servers: Vec<DrainingServer>,
}

impl InitializeResponse {
    fn to_frames(&self, out: &mut Vec<Frame>) {
        out.push(Frame::boolean(self.request_logging_enabled));
        out.push(Frame::boolean(self.persistence_enabled));
        out.push(Frame::integer(duration_ms(self.persistence_interval)));
        out.push(Frame::bulk(Bytes::from(self.cache_type.clone())));
        out.push(Frame::boolean(self.shutdown_in_progress));
        out.push(Frame::array(
            self.draining_servers
                .iter()
                .map(|server| {
                    Frame::array(vec![
                        Frame::bulk(Bytes::from(server.address.to_string())),
                        Frame::integer(i64::from(server.port)),
                        Frame::bulk(Bytes::copy_from_slice(server.blocking_id.as_bytes())),
                        Frame::integer(duration_ms(server.timeout)),
                    ])
                })
                .collect(),
        ));
    }
}

/// Keys that failed, with why.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyExceptionPackage {
    pub entries: Vec<(Bytes, KeyFailure)>,
}

impl KeyExceptionPackage {
    pub fn keys(&self) -> Vec<&Bytes> {
        self.entries.iter().map(|(key, _)| key).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Keys that were stored, with their new versions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyVersionPackage {
    pub entries: Vec<(Bytes, Version)>,
}

impl KeyVersionPackage {
    pub fn keys(&self) -> Vec<&Bytes> {
        self.entries.iter().map(|(key, _)| key).collect()
    }
}

/// Reply to a bulk mutation. Always success-shaped, even when keys failed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkMutateResponse {
    pub key_exceptions: KeyExceptionPackage,
    /// Present only when the caller asked for versions
    pub key_versions: Option<KeyVersionPackage>,
    pub intended_recipient: Option<String>,
}

impl BulkMutateResponse {
    /// Splits per-key outcomes into the exception and version packages.
    ///
    /// Each key appears at most once across both packages. A key repeated in
    /// the batch reports its latest stored version if any occurrence was
    /// stored, otherwise its first failure.
    pub fn from_outcome(
        outcome: BulkOutcome,
        return_version: bool,
        intended_recipient: Option<String>,
    ) -> Self {
        let mut versions = KeyVersionPackage::default();
        let mut stored: HashMap<Bytes, usize> = HashMap::new();
        let mut failures = Vec::new();

        for (key, result) in outcome.results {
            match result {
                KeyOutcome::Stored { version } => match stored.get(&key) {
                    Some(&slot) => versions.entries[slot].1 = version,
                    None => {
                        stored.insert(key.clone(), versions.entries.len());
                        versions.entries.push((key, version));
                    }
                },
                KeyOutcome::Failed(failure) => failures.push((key, failure)),
            }
        }

        let mut reported = HashSet::new();
        let key_exceptions = KeyExceptionPackage {
            entries: failures
                .into_iter()
                .filter(|(key, _)| !stored.contains_key(key) && reported.insert(key.clone()))
                .collect(),
        };

        Self {
            key_exceptions,
            key_versions: return_version.then_some(versions),
            intended_recipient,
        }
    }

    fn to_frames(&self, out: &mut Vec<Frame>) {
        out.push(Frame::array(
            self.key_exceptions
                .entries
                .iter()
                .map(|(key, failure)| {
                    Frame::array(vec![
                        Frame::bulk(key.clone()),
                        Frame::bulk(Bytes::from(failure.to_string())),
                    ])
                })
                .collect(),
        ));
        out.push(match &self.key_versions {
            Some(package) => Frame::array(
                package
                    .entries
                    .iter()
                    .map(|(key, version)| {
                        Frame::array(vec![
                            Frame::bulk(key.clone()),
                            Frame::integer(i64::try_from(*version).unwrap_or(i64::MAX)),
                        ])
                    })
                    .collect(),
            ),
            None => Frame::Null,
        });
        out.push(Frame::optional_bulk(self.intended_recipient.as_deref()));
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionResponse {
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseBody {
    Initialize(InitializeResponse),
    BulkMutate {
        kind: CommandKind,
        body: BulkMutateResponse,
    },
    Exception(ExceptionResponse),
}

/// A complete response, addressed back to its request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub request_id: i64,
    pub command_id: i64,
    pub body: ResponseBody,
}

impl Response {
    pub fn is_exception(&self) -> bool {
        matches!(self.body, ResponseBody::Exception(_))
    }

    pub fn to_frame(&self) -> Frame {
        let tag = match &self.body {
            ResponseBody::Initialize(_) => CommandKind::Initialize.tag(),
            ResponseBody::BulkMutate { kind, .. } => kind.tag(),
            ResponseBody::Exception(_) => "EXCEPTION",
        };
        let mut items = vec![
            Frame::simple(tag),
            Frame::integer(self.request_id),
            Frame::integer(self.command_id),
        ];
        match &self.body {
            ResponseBody::Initialize(init) => init.to_frames(&mut items),
            ResponseBody::BulkMutate { body, .. } => body.to_frames(&mut items),
            ResponseBody::Exception(exception) => {
                items.push(Frame::bulk(Bytes::from(exception.description.clone())))
            }
        }
        Frame::array(items)
    }
}

/// Stamps correlation ids onto every response for one command.
#[derive(Debug, Clone, Copy)]
pub struct ResponseBuilder {
    request_id: i64,
    command_id: i64,
}

impl ResponseBuilder {
    pub fn new(request_id: i64, command_id: i64) -> Self {
        Self {
            request_id,
            command_id,
        }
    }

    pub fn for_command(raw: &RawCommand) -> Self {
        Self::new(raw.request_id(), raw.command_id())
    }

    pub fn success(&self, body: ResponseBody) -> Response {
        Response {
            request_id: self.request_id,
            command_id: self.command_id,
            body,
        }
    }

    pub fn exception(&self, error: &CommandError) -> Response {
        self.success(ResponseBody::Exception(ExceptionResponse {
            description: error.to_string(),
        }))
    }
}

fn duration_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::ParseError;
    use std::net::{IpAddr, Ipv4Addr};

    fn outcome(failed: &[usize], total: usize) -> BulkOutcome {
        BulkOutcome {
            results: (1..=total)
                .map(|i| {
                    let key = Bytes::from(format!("k{}", i));
                    if failed.contains(&i) {
                        (key, KeyOutcome::Failed(KeyFailure::AlreadyExists))
                    } else {
                        (key, KeyOutcome::Stored { version: i as u64 })
                    }
                })
                .collect(),
        }
    }

    #[test]
    fn test_partition_with_versions() {
        let response = BulkMutateResponse::from_outcome(outcome(&[2, 4], 5), true, None);

        assert_eq!(
            response.key_exceptions.keys(),
            vec![&Bytes::from("k2"), &Bytes::from("k4")]
        );
        let versions = response.key_versions.unwrap();
        assert_eq!(
            versions.keys(),
            vec![&Bytes::from("k1"), &Bytes::from("k3"), &Bytes::from("k5")]
        );
    }

    #[test]
    fn test_repeated_key_reported_once() {
        let key = Bytes::from("dup");
        let outcome = BulkOutcome {
            results: vec![
                (key.clone(), KeyOutcome::Stored { version: 7 }),
                (key.clone(), KeyOutcome::Failed(KeyFailure::AlreadyExists)),
                (Bytes::from("other"), KeyOutcome::Failed(KeyFailure::Locked)),
                (Bytes::from("other"), KeyOutcome::Failed(KeyFailure::AlreadyExists)),
                (key.clone(), KeyOutcome::Stored { version: 9 }),
            ],
        };

        let response = BulkMutateResponse::from_outcome(outcome, true, None);

        assert_eq!(
            response.key_exceptions.entries,
            vec![(Bytes::from("other"), KeyFailure::Locked)]
        );
        assert_eq!(response.key_versions.unwrap().entries, vec![(key, 9)]);
    }

    #[test]
    fn test_version_beyond_wire_range_saturates() {
        let outcome = BulkOutcome {
            results: vec![(Bytes::from("big"), KeyOutcome::Stored { version: u64::MAX })],
        };
        let response = ResponseBuilder::new(1, 2).success(ResponseBody::BulkMutate {
            kind: CommandKind::InsertBulk,
            body: BulkMutateResponse::from_outcome(outcome, true, None),
        });

        let frame = response.to_frame();
        let versions = frame.as_array().unwrap()[4].as_array().unwrap();
        assert_eq!(
            versions[0],
            Frame::array(vec![Frame::bulk("big"), Frame::integer(i64::MAX)])
        );
    }

    #[test]
    fn test_partition_without_versions() {
        let response = BulkMutateResponse::from_outcome(outcome(&[], 3), false, Some("node-b".into()));
        assert!(response.key_exceptions.is_empty());
        assert!(response.key_versions.is_none());
        assert_eq!(response.intended_recipient.as_deref(), Some("node-b"));
    }

    #[test]
    fn test_exception_echoes_ids() {
        let builder = ResponseBuilder::new(41, 17);
        let response = builder.exception(&CommandError::Parse(ParseError::EmptyBatch));

        assert!(response.is_exception());
        assert_eq!(
            response.to_frame(),
            Frame::array(vec![
                Frame::simple("EXCEPTION"),
                Frame::integer(41),
                Frame::integer(17),
                Frame::bulk("bulk operation requires at least one key"),
            ])
        );
    }

    #[test]
    fn test_initialize_frame() {
        let response = ResponseBuilder::new(1, 2).success(ResponseBody::Initialize(InitializeResponse {
            request_logging_enabled: true,
            persistence_enabled: false,
            persistence_interval: Duration::from_secs(5),
            cache_type: "partitioned".to_string(),
            shutdown_in_progress: true,
            draining_servers: vec![DrainingServer {
                address: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
                port: 9800,
                blocking_id: "b-1".to_string(),
                timeout: Duration::from_millis(1500),
            }],
        }));

        let frame = response.to_frame();
        let items = frame.as_array().unwrap();
        assert_eq!(items[0], Frame::simple("INIT"));
        assert_eq!(items[5], Frame::integer(5000));
        assert_eq!(items[6], Frame::bulk("partitioned"));
        assert_eq!(items[7], Frame::integer(1));
        assert_eq!(
            items[8],
            Frame::array(vec![Frame::array(vec![
                Frame::bulk("10.0.0.2"),
                Frame::integer(9800),
                Frame::bulk("b-1"),
                Frame::integer(1500),
            ])])
        );
    }

    #[test]
    fn test_bulk_frame_without_versions() {
        let body = BulkMutateResponse::from_outcome(outcome(&[1], 2), false, None);
        let frame = ResponseBuilder::new(3, 4)
            .success(ResponseBody::BulkMutate {
                kind: CommandKind::InsertBulk,
                body,
            })
            .to_frame();
        let items = frame.as_array().unwrap();

        assert_eq!(items[0], Frame::simple("INSERTBULK"));
        assert_eq!(items[3].as_array().unwrap().len(), 1);
        assert!(items[4].is_null());
        assert!(items[5].is_null());
    }
}
