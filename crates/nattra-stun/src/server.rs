//! STUN echo server
//!
//! A server owns two addresses on the same IP and, optionally, a partner
//! server on another IP. Requests for a different IP are forwarded to the
//! partner, which replies straight to the client.

use nattra_core::{
    Address, Component, Context, Datagram, EchoId, EchoKind, Payload, SessionId, StunMessage,
    TimerId,
};
use std::convert::Infallible;

/// Counters kept by the server
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StunServerStats {
    /// Echo responses sent
    pub responses: u64,
    /// Requests forwarded to the partner
    pub forwarded: u64,
    /// Requests answered with a reset
    pub resets: u64,
    /// Requests dropped
    pub dropped: u64,
}

/// STUN echo server component
pub struct StunServer {
    addresses: [Address; 2],
    partner: Option<[Address; 2]>,
    stats: StunServerStats,
}

impl StunServer {
    /// Create a server on a primary and secondary address
    #[must_use]
    pub fn new(primary: Address, secondary: Address) -> Self {
        Self {
            addresses: [primary, secondary],
            partner: None,
            stats: StunServerStats::default(),
        }
    }

    /// Set the partner server used for other-IP echoes
    #[must_use]
    pub fn with_partner(mut self, primary: Address, secondary: Address) -> Self {
        self.partner = Some([primary, secondary]);
        self
    }

    /// Server counters
    #[must_use]
    pub fn stats(&self) -> StunServerStats {
        self.stats
    }

    fn respond(&mut self, ctx: &mut dyn Context, from: Address, to: Address, echo: Echo) {
        self.stats.responses += 1;
        let response = StunMessage::EchoResponse {
            id: echo.id,
            session: echo.session,
            kind: echo.kind,
            observed: Some(to.socket),
        };
        ctx.send(Datagram::new(from, to, Payload::Stun(response)));
    }

    fn reset(&mut self, ctx: &mut dyn Context, request: &Datagram, echo: Echo) {
        self.stats.resets += 1;
        tracing::debug!("Resetting {} echo from {}", echo.kind, request.src);
        ctx.send(request.reply(Payload::Stun(StunMessage::EchoReset {
            id: echo.id,
            session: echo.session,
            kind: echo.kind,
        })));
    }

    fn handle_other_ip(
        &mut self,
        ctx: &mut dyn Context,
        request: &Datagram,
        local: usize,
        echo: Echo,
        target: Option<Address>,
    ) {
        let Some(target) = target else {
            self.reset(ctx, request, echo);
            return;
        };

        if target.id == request.src.id {
            // Client asking: hand over to the partner along with the
            // client address as seen from here.
            let Some(partner) = self.partner else {
                self.reset(ctx, request, echo);
                return;
            };
            self.stats.forwarded += 1;
            tracing::trace!("Forwarding {} echo from {} to partner", echo.kind, request.src);
            let forward = StunMessage::EchoRequest {
                id: echo.id,
                session: echo.session,
                kind: echo.kind,
                target: Some(request.src),
            };
            ctx.send(Datagram::new(
                self.addresses[local],
                partner[0],
                Payload::Stun(forward),
            ));
            return;
        }

        let from_partner = self
            .partner
            .is_some_and(|p| p.iter().any(|a| a.socket == request.src.socket));
        if !from_partner {
            self.stats.dropped += 1;
            tracing::warn!(
                "Dropping {} echo for {} from non-partner {}",
                echo.kind,
                target,
                request.src
            );
            return;
        }

        let from = match echo.kind {
            EchoKind::DipSp => self.addresses[0],
            _ => self.addresses[1],
        };
        self.respond(ctx, from, target, echo);
    }
}

#[derive(Debug, Clone, Copy)]
struct Echo {
    id: EchoId,
    session: SessionId,
    kind: EchoKind,
}

impl Component for StunServer {
    type Command = Infallible;
    type Event = Infallible;

    fn local_addresses(&self) -> Vec<Address> {
        self.addresses.to_vec()
    }

    fn start(&mut self, _ctx: &mut dyn Context) -> Vec<Infallible> {
        tracing::info!(
            "STUN server listening on {} and {} (partner: {})",
            self.addresses[0],
            self.addresses[1],
            self.partner.is_some()
        );
        Vec::new()
    }

    fn handle_datagram(&mut self, ctx: &mut dyn Context, datagram: Datagram) -> Vec<Infallible> {
        let Some(local) = self
            .addresses
            .iter()
            .position(|a| a.socket == datagram.dst.socket)
        else {
            self.stats.dropped += 1;
            tracing::warn!("STUN server got datagram for foreign address {}", datagram.dst);
            return Vec::new();
        };

        let Payload::Stun(StunMessage::EchoRequest {
            id,
            session,
            kind,
            target,
        }) = &datagram.payload
        else {
            self.stats.dropped += 1;
            tracing::trace!(
                "STUN server ignoring {} from {}",
                datagram.payload.message_type(),
                datagram.src
            );
            return Vec::new();
        };

        let (kind, target) = (*kind, *target);
        let echo = Echo {
            id: *id,
            session: *session,
            kind,
        };
        match kind {
            EchoKind::SipSp => self.respond(ctx, self.addresses[local], datagram.src, echo),
            EchoKind::SipDp => self.respond(ctx, self.addresses[1 - local], datagram.src, echo),
            EchoKind::DipDp | EchoKind::DipSp => {
                self.handle_other_ip(ctx, &datagram, local, echo, target);
            }
        }
        Vec::new()
    }

    fn handle_timeout(&mut self, _ctx: &mut dyn Context, _timer: TimerId) -> Vec<Infallible> {
        Vec::new()
    }

    fn handle_command(&mut self, _ctx: &mut dyn Context, command: Infallible) -> Vec<Infallible> {
        match command {}
    }
}
