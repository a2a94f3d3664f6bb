//! STUN client component
//!
//! Owns any number of concurrent [`StunSession`]s keyed by session id and
//! emits one [`NatDetected`] event per finished run.

use crate::error::StunError;
use crate::session::{Classification, ServerPair, StunSession};
use nattra_core::{Address, Component, Context, Datagram, Payload, SessionId, StunMessage, TimerId};
use std::collections::HashMap;
use std::time::Duration;

/// Default echo timeout
pub const DEFAULT_ECHO_TIMEOUT: Duration = Duration::from_secs(2);

/// STUN client configuration
#[derive(Debug, Clone)]
pub struct StunClientConfig {
    /// Time to wait for each echo response
    pub echo_timeout: Duration,
    /// Start one classification run as soon as the component starts
    pub classify_on_start: bool,
}

impl Default for StunClientConfig {
    fn default() -> Self {
        Self {
            echo_timeout: DEFAULT_ECHO_TIMEOUT,
            classify_on_start: true,
        }
    }
}

/// Requests accepted by [`StunClient`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StunCommand {
    /// Start a new classification run
    Classify,
}

/// Outcome of one classification run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatDetected {
    /// Run id
    pub session: SessionId,
    /// Classification or terminal failure
    pub result: Result<Classification, StunError>,
}

/// NAT classifier component
pub struct StunClient {
    local: [Address; 2],
    servers: [ServerPair; 2],
    config: StunClientConfig,
    sessions: HashMap<SessionId, StunSession>,
}

impl StunClient {
    /// Create a client for a local address pair and two STUN servers
    #[must_use]
    pub fn new(local: [Address; 2], servers: [ServerPair; 2], config: StunClientConfig) -> Self {
        Self {
            local,
            servers,
            config,
            sessions: HashMap::new(),
        }
    }

    /// Number of runs still in progress
    #[must_use]
    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Start a new classification run and return its id
    pub fn classify(&mut self, ctx: &mut dyn Context) -> SessionId {
        let id = loop {
            let id = SessionId::random();
            if !self.sessions.contains_key(&id) {
                break id;
            }
        };

        let mut session = StunSession::new(id, self.local, self.servers, self.config.echo_timeout);
        session.start(ctx);
        self.sessions.insert(id, session);
        id
    }

    fn finish(
        &mut self,
        id: SessionId,
        outcome: Option<Result<Classification, StunError>>,
    ) -> Vec<NatDetected> {
        let Some(result) = outcome else {
            return Vec::new();
        };
        self.sessions.remove(&id);

        match &result {
            Ok(classification) => tracing::info!(
                "NAT classification {} finished: {} (public ip {:?})",
                id,
                classification.descriptor,
                classification.public_ip
            ),
            Err(e) => tracing::warn!("NAT classification {} failed: {}", id, e),
        }

        vec![NatDetected {
            session: id,
            result,
        }]
    }
}

impl Component for StunClient {
    type Command = StunCommand;
    type Event = NatDetected;

    fn local_addresses(&self) -> Vec<Address> {
        self.local.to_vec()
    }

    fn start(&mut self, ctx: &mut dyn Context) -> Vec<NatDetected> {
        if self.config.classify_on_start {
            self.classify(ctx);
        }
        Vec::new()
    }

    fn handle_datagram(&mut self, ctx: &mut dyn Context, datagram: Datagram) -> Vec<NatDetected> {
        let message = match datagram.payload {
            Payload::Stun(message) => message,
            other => {
                tracing::trace!(
                    "STUN client ignoring {} from {}",
                    other.message_type(),
                    datagram.src
                );
                return Vec::new();
            }
        };

        let (session, outcome) = match message {
            StunMessage::EchoResponse {
                id,
                session,
                observed,
                ..
            } => match self.sessions.get_mut(&session) {
                Some(s) => (session, s.handle_response(ctx, id, observed)),
                None => {
                    tracing::debug!("Late echo response for closed session {}", session);
                    return Vec::new();
                }
            },
            StunMessage::EchoReset { id, session, .. } => match self.sessions.get_mut(&session) {
                Some(s) => (session, s.handle_reset(ctx, id)),
                None => {
                    tracing::debug!("Late echo reset for closed session {}", session);
                    return Vec::new();
                }
            },
            StunMessage::EchoRequest { .. } => {
                tracing::warn!("STUN client dropping echo request from {}", datagram.src);
                return Vec::new();
            }
        };

        self.finish(session, outcome)
    }

    fn handle_timeout(&mut self, ctx: &mut dyn Context, timer: TimerId) -> Vec<NatDetected> {
        let owner = self
            .sessions
            .iter()
            .find(|(_, s)| s.pending_timer() == Some(timer))
            .map(|(id, _)| *id);

        match owner {
            Some(id) => {
                let outcome = self
                    .sessions
                    .get_mut(&id)
                    .and_then(|s| s.handle_timeout(ctx, timer));
                self.finish(id, outcome)
            }
            None => {
                tracing::debug!("STUN client ignoring late {}", timer);
                Vec::new()
            }
        }
    }

    fn handle_command(&mut self, ctx: &mut dyn Context, command: StunCommand) -> Vec<NatDetected> {
        match command {
            StunCommand::Classify => {
                self.classify(ctx);
            }
        }
        Vec::new()
    }
}

impl Drop for StunClient {
    fn drop(&mut self) {
        if !self.sessions.is_empty() {
            tracing::debug!(
                "STUN client dropped with {} run(s) in progress",
                self.sessions.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nattra_core::testing::RecordingContext;
    use nattra_core::{EchoKind, NatDescriptor, NodeId};

    fn addr(s: &str, id: u64) -> Address {
        Address::new(s.parse().unwrap(), NodeId(id))
    }

    fn client(config: StunClientConfig) -> StunClient {
        StunClient::new(
            [addr("10.0.0.2:4000", 1), addr("10.0.0.2:4001", 1)],
            [
                ServerPair::new(addr("198.51.100.1:3478", 10), addr("198.51.100.1:3479", 10)),
                ServerPair::new(addr("198.51.100.2:3478", 11), addr("198.51.100.2:3479", 11)),
            ],
            config,
        )
    }

    fn answer(request: &Datagram, observed: &str) -> Datagram {
        match &request.payload {
            Payload::Stun(StunMessage::EchoRequest {
                id, session, kind, ..
            }) => request.reply(Payload::Stun(StunMessage::EchoResponse {
                id: *id,
                session: *session,
                kind: *kind,
                observed: Some(observed.parse().unwrap()),
            })),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_classify_on_start() {
        let mut ctx = RecordingContext::new();
        let mut c = client(StunClientConfig::default());
        assert!(c.start(&mut ctx).is_empty());
        assert_eq!(c.active_sessions(), 1);
        assert_eq!(ctx.sent.len(), 1);
    }

    #[test]
    fn test_open_detection_event() {
        let mut ctx = RecordingContext::new();
        let mut c = client(StunClientConfig::default());
        c.start(&mut ctx);

        let req = ctx.take_sent().pop().unwrap();
        assert!(c.handle_datagram(&mut ctx, answer(&req, "10.0.0.2:4000")).is_empty());

        let req = ctx.take_sent().pop().unwrap();
        let events = c.handle_datagram(&mut ctx, answer(&req, "10.0.0.2:4000"));
        assert_eq!(events.len(), 1);
        let detected = events[0].result.as_ref().unwrap();
        assert_eq!(detected.descriptor, NatDescriptor::Open);
        assert_eq!(c.active_sessions(), 0);
    }

    #[test]
    fn test_concurrent_sessions_are_independent() {
        let mut ctx = RecordingContext::new();
        let mut c = client(StunClientConfig {
            classify_on_start: false,
            ..StunClientConfig::default()
        });
        c.start(&mut ctx);
        assert_eq!(c.active_sessions(), 0);

        let first = c.classify(&mut ctx);
        let second = c.classify(&mut ctx);
        assert_ne!(first, second);

        // first run times out in Test1 -> UdpBlocked
        let timer = ctx.active.keys().next().copied().unwrap();
        ctx.fire(timer);
        let events = c.handle_timeout(&mut ctx, timer);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].session, first);
        assert_eq!(
            events[0].result.as_ref().unwrap().descriptor,
            NatDescriptor::UdpBlocked
        );
        assert_eq!(c.active_sessions(), 1);
    }

    #[test]
    fn test_reset_surfaces_error() {
        let mut ctx = RecordingContext::new();
        let mut c = client(StunClientConfig::default());
        c.start(&mut ctx);

        let req = ctx.take_sent().pop().unwrap();
        let reset = match &req.payload {
            Payload::Stun(StunMessage::EchoRequest {
                id, session, kind, ..
            }) => req.reply(Payload::Stun(StunMessage::EchoReset {
                id: *id,
                session: *session,
                kind: *kind,
            })),
            _ => unreachable!(),
        };

        let events = c.handle_datagram(&mut ctx, reset);
        assert!(matches!(
            events[0].result,
            Err(StunError::ServerReset {
                kind: EchoKind::SipSp,
                ..
            })
        ));
        assert!(ctx.active.is_empty());
    }

    #[test]
    fn test_unknown_timer_ignored() {
        let mut ctx = RecordingContext::new();
        let mut c = client(StunClientConfig::default());
        c.start(&mut ctx);
        assert!(c.handle_timeout(&mut ctx, TimerId(999)).is_empty());
        assert_eq!(c.active_sessions(), 1);
    }
}
