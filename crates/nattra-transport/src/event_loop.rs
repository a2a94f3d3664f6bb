//! Tokio driver for sans-IO components
//!
//! The [`EventLoop`] binds one UDP socket per local address of its
//! [`Component`], decodes inbound bytes with the [`WireCodec`], fires timers
//! from a deadline queue and forwards commands from the application. Every
//! handler runs on the loop task, so the component never sees two events at
//! once. Datagrams the component sends are collected while the handler runs
//! and written after it returns, from the socket matching their source
//! address.

use crate::config::TransportConfig;
use crate::transport::{Transport, TransportError, TransportResult};
use crate::udp::AsyncUdpTransport;
use nattra_core::{Component, Context, Datagram, TimerId, WireCodec};
use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Shortest period a periodic timer is re-armed with
const MIN_TIMER_PERIOD: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy)]
struct Timer {
    deadline: Instant,
    period: Option<Duration>,
}

/// Pending timers ordered by deadline
#[derive(Debug, Default)]
struct TimerQueue {
    next_id: u64,
    deadlines: BTreeSet<(Instant, TimerId)>,
    timers: HashMap<TimerId, Timer>,
}

impl TimerQueue {
    fn schedule(&mut self, now: Instant, delay: Duration, period: Option<Duration>) -> TimerId {
        self.next_id += 1;
        let id = TimerId(self.next_id);
        let deadline = now + delay;
        let period = period.map(|p| p.max(MIN_TIMER_PERIOD));
        self.deadlines.insert((deadline, id));
        self.timers.insert(id, Timer { deadline, period });
        id
    }

    fn cancel(&mut self, id: TimerId) {
        if let Some(timer) = self.timers.remove(&id) {
            self.deadlines.remove(&(timer.deadline, id));
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.first().map(|(deadline, _)| *deadline)
    }

    /// Pop the earliest timer due at `now`, re-arming it if periodic
    fn pop_expired(&mut self, now: Instant) -> Option<TimerId> {
        let (deadline, id) = *self.deadlines.first()?;
        if deadline > now {
            return None;
        }
        self.deadlines.remove(&(deadline, id));

        let timer = self.timers.get_mut(&id)?;
        match timer.period {
            Some(period) => {
                timer.deadline = deadline + period;
                self.deadlines.insert((timer.deadline, id));
            }
            None => {
                self.timers.remove(&id);
            }
        }
        Some(id)
    }

    fn len(&self) -> usize {
        self.timers.len()
    }
}

/// Context handed to the component for the duration of one handler
struct LoopContext<'a> {
    now: Instant,
    timers: &'a mut TimerQueue,
    outbox: &'a mut Vec<Datagram>,
}

impl Context for LoopContext<'_> {
    fn send(&mut self, datagram: Datagram) {
        self.outbox.push(datagram);
    }

    fn schedule_once(&mut self, delay: Duration) -> TimerId {
        self.timers.schedule(self.now, delay, None)
    }

    fn schedule_periodic(&mut self, delay: Duration, period: Duration) -> TimerId {
        self.timers.schedule(self.now, delay, Some(period))
    }

    fn cancel(&mut self, timer: TimerId) {
        self.timers.cancel(timer);
    }
}

struct Inbound {
    bytes: Vec<u8>,
    from: SocketAddr,
    local: SocketAddr,
}

/// Application side of a running event loop
pub struct EventLoopHandle<Cmd> {
    commands: mpsc::UnboundedSender<Cmd>,
    shutdown: watch::Sender<bool>,
}

impl<Cmd> EventLoopHandle<Cmd> {
    /// Queue a command for the component
    ///
    /// # Errors
    /// Returns `TransportError::Closed` if the loop has stopped
    pub fn command(&self, command: Cmd) -> TransportResult<()> {
        self.commands
            .send(command)
            .map_err(|_| TransportError::Closed)
    }

    /// Ask the loop to stop after the current event
    pub fn shutdown(&self) {
        // the loop may already be gone
        let _ = self.shutdown.send(true);
    }
}

/// Drives one component over real UDP sockets
pub struct EventLoop<C: Component> {
    component: C,
    config: TransportConfig,
    codec: WireCodec,
    commands: mpsc::UnboundedReceiver<C::Command>,
    events: mpsc::UnboundedSender<C::Event>,
    shutdown: watch::Receiver<bool>,
    timers: TimerQueue,
    outbox: Vec<Datagram>,
    sockets: HashMap<SocketAddr, Arc<AsyncUdpTransport>>,
}

impl<C> EventLoop<C>
where
    C: Component + Send + 'static,
    C::Command: Send + 'static,
    C::Event: Send + 'static,
{
    /// Create a loop for `component`
    ///
    /// Returns the loop, the handle used to command and stop it, and the
    /// receiver of the component's events.
    #[must_use]
    pub fn new(
        component: C,
        config: TransportConfig,
    ) -> (
        Self,
        EventLoopHandle<C::Command>,
        mpsc::UnboundedReceiver<C::Event>,
    ) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let codec = WireCodec::new(config.max_datagram_size);
        let event_loop = Self {
            component,
            config,
            codec,
            commands: command_rx,
            events: event_tx,
            shutdown: shutdown_rx,
            timers: TimerQueue::default(),
            outbox: Vec::new(),
            sockets: HashMap::new(),
        };
        let handle = EventLoopHandle {
            commands: command_tx,
            shutdown: shutdown_tx,
        };
        (event_loop, handle, event_rx)
    }

    /// Bind the component's addresses and run until shutdown
    ///
    /// The loop also stops when its handle is dropped. Returns the component
    /// so its final state can be inspected.
    ///
    /// # Errors
    /// Returns `TransportError` if the configuration is invalid or a local
    /// address cannot be bound.
    pub async fn run(mut self) -> TransportResult<C> {
        self.config
            .validate()
            .map_err(TransportError::InvalidConfig)?;

        let (inbound_tx, mut inbound_rx) = mpsc::channel(self.config.inbound_queue);
        let mut receivers = Vec::new();
        for address in self.component.local_addresses() {
            let transport =
                Arc::new(AsyncUdpTransport::bind_with_config(address.socket, &self.config).await?);
            receivers.push(spawn_receiver(
                Arc::clone(&transport),
                address.socket,
                self.config.max_datagram_size,
                inbound_tx.clone(),
            ));
            self.sockets.insert(address.socket, transport);
        }
        drop(inbound_tx);

        tracing::info!("Event loop started on {} socket(s)", self.sockets.len());

        let mut ctx = LoopContext {
            now: Instant::now(),
            timers: &mut self.timers,
            outbox: &mut self.outbox,
        };
        let events = self.component.start(&mut ctx);
        self.dispatch(events).await;

        let mut receiving = true;
        loop {
            let deadline = self.timers.next_deadline();
            let sleep = async {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
                inbound = inbound_rx.recv(), if receiving => {
                    match inbound {
                        Some(inbound) => self.on_inbound(inbound).await,
                        // no sockets, or every receiver has exited
                        None => receiving = false,
                    }
                }
                command = self.commands.recv() => {
                    let Some(command) = command else { break };
                    let mut ctx = LoopContext {
                        now: Instant::now(),
                        timers: &mut self.timers,
                        outbox: &mut self.outbox,
                    };
                    let events = self.component.handle_command(&mut ctx, command);
                    self.dispatch(events).await;
                }
                () = sleep => {
                    self.on_deadline().await;
                }
            }
        }

        for receiver in &receivers {
            receiver.abort();
        }
        for transport in self.sockets.values() {
            transport.close().await?;
        }
        tracing::info!(
            "Event loop stopped with {} timer(s) pending",
            self.timers.len()
        );

        Ok(self.component)
    }

    async fn on_inbound(&mut self, inbound: Inbound) {
        let datagram = match self
            .codec
            .decode(&inbound.bytes, inbound.from, inbound.local)
        {
            Ok(datagram) => datagram,
            Err(e) => {
                tracing::debug!("Dropping undecodable datagram from {}: {}", inbound.from, e);
                return;
            }
        };

        tracing::trace!(
            "Received {} from {} on {}",
            datagram.payload.message_type(),
            datagram.src,
            datagram.dst
        );

        let mut ctx = LoopContext {
            now: Instant::now(),
            timers: &mut self.timers,
            outbox: &mut self.outbox,
        };
        let events = self.component.handle_datagram(&mut ctx, datagram);
        self.dispatch(events).await;
    }

    async fn on_deadline(&mut self) {
        let now = Instant::now();
        while let Some(timer) = self.timers.pop_expired(now) {
            let mut ctx = LoopContext {
                now,
                timers: &mut self.timers,
                outbox: &mut self.outbox,
            };
            let events = self.component.handle_timeout(&mut ctx, timer);
            self.dispatch(events).await;
        }
    }

    /// Flush the outbox and forward events to the application
    async fn dispatch(&mut self, events: Vec<C::Event>) {
        for datagram in std::mem::take(&mut self.outbox) {
            if let Err(e) = self.transmit(&datagram).await {
                tracing::warn!(
                    "Failed to send {} to {}: {}",
                    datagram.payload.message_type(),
                    datagram.dst,
                    e
                );
            }
        }

        for event in events {
            // nobody listening is not an error
            let _ = self.events.send(event);
        }
    }

    async fn transmit(&self, datagram: &Datagram) -> TransportResult<()> {
        let transport = self
            .sockets
            .get(&datagram.src.socket)
            .ok_or(TransportError::NoSocket(datagram.src.socket))?;
        let bytes = self.codec.encode(datagram)?;
        transport.send_to(&bytes, datagram.dst.socket).await?;
        tracing::trace!(
            "Sent {} from {} to {}",
            datagram.payload.message_type(),
            datagram.src,
            datagram.dst
        );
        Ok(())
    }
}

fn spawn_receiver(
    transport: Arc<AsyncUdpTransport>,
    local: SocketAddr,
    max_datagram_size: usize,
    tx: mpsc::Sender<Inbound>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; max_datagram_size];
        loop {
            match transport.recv_from(&mut buf).await {
                Ok((size, from)) => {
                    let inbound = Inbound {
                        bytes: buf[..size].to_vec(),
                        from,
                        local,
                    };
                    if tx.send(inbound).await.is_err() {
                        break;
                    }
                }
                Err(TransportError::Closed) => break,
                Err(e) => {
                    tracing::debug!("Receive error on {}: {}", local, e);
                }
            }
        }
    })
}
