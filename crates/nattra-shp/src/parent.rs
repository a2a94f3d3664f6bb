//! Parent relay role
//!
//! An open node that NAT'd children keep a mapping to. Initiators send it a
//! `Relay` naming one of its children; the parent forwards an `Initiate`
//! carrying the initiator address exactly as the parent observed it.

use crate::error::ShpError;
use nattra_core::{Address, Component, Context, Datagram, NodeId, Payload, ShpMessage, TimerId};
use std::collections::HashMap;
use std::convert::Infallible;

/// Rendezvous parent
#[derive(Debug, Default)]
pub struct ShpParent {
    local: Vec<Address>,
    children: HashMap<NodeId, Address>,
    relayed: u64,
}

impl ShpParent {
    /// Create a parent listening on `local`
    #[must_use]
    pub fn new(local: Address) -> Self {
        Self {
            local: vec![local],
            ..Self::default()
        }
    }

    /// Register a child at the address it is reachable on
    ///
    /// Re-registering replaces the previous address of the same node.
    pub fn register_child(&mut self, child: Address) {
        if let Some(previous) = self.children.insert(child.id, child) {
            if previous != child {
                tracing::debug!("Child {} moved from {} to {}", child.id, previous, child);
            }
        } else {
            tracing::info!("Registered child {}", child);
        }
    }

    /// Forget a child
    pub fn unregister_child(&mut self, id: NodeId) -> Option<Address> {
        self.children.remove(&id)
    }

    /// True if `id` is a registered child
    #[must_use]
    pub fn is_child(&self, id: NodeId) -> bool {
        self.children.contains_key(&id)
    }

    /// Number of registered children
    #[must_use]
    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    /// Number of relays forwarded so far
    #[must_use]
    pub fn relayed(&self) -> u64 {
        self.relayed
    }

    /// Forward a `Relay` to the named child
    ///
    /// # Errors
    ///
    /// Returns [`ShpError::UnknownChild`] if the target is not registered.
    /// Datagrams that are not relays are ignored.
    pub fn handle_relay(&mut self, ctx: &mut dyn Context, datagram: &Datagram) -> Result<(), ShpError> {
        let Payload::Shp(ShpMessage::Relay { session, msg, target }) = &datagram.payload else {
            return Ok(());
        };

        let Some(child) = self.children.get(&target.id).copied() else {
            tracing::warn!(
                "Dropping relay {} from {}: {} is not a child",
                session,
                datagram.src,
                target
            );
            return Err(ShpError::UnknownChild(*target));
        };

        tracing::debug!("Relaying {} from {} to child {}", msg, datagram.src, child);
        self.relayed += 1;
        ctx.send(Datagram::new(
            datagram.dst,
            child,
            Payload::Shp(ShpMessage::Initiate {
                msg: *msg,
                connect_to: datagram.src,
            }),
        ));
        Ok(())
    }
}

impl Component for ShpParent {
    type Command = Infallible;
    type Event = Infallible;

    fn local_addresses(&self) -> Vec<Address> {
        self.local.clone()
    }

    fn start(&mut self, _ctx: &mut dyn Context) -> Vec<Infallible> {
        Vec::new()
    }

    fn handle_datagram(&mut self, ctx: &mut dyn Context, datagram: Datagram) -> Vec<Infallible> {
        if let Err(e) = self.handle_relay(ctx, &datagram) {
            tracing::debug!("Relay from {} not forwarded: {}", datagram.src, e);
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
