//! FakeWire link exchange: handshake, credit-based flow control and packet framing
//! over one pair of byte streams.
//!
//! Inbound bytes are decoded and applied to the session from the wire's
//! readability callback. Three cooperative tasks do everything that transmits:
//!
//! - `deliver`: hands completed inbound packets upward and re-issues the
//!   flow-control grant (FCT) once the packet has been accepted;
//! - `transmit`: sends an outbound packet once the peer has granted an FCT;
//! - `handshake`: paces primary handshakes and answers with secondaries.
//!
//! All three wake on the shared `changed` dispatcher. Any protocol violation
//! resets the session to `Connecting`; resets never surface to the packet API.

use crate::codec::{
    encode_control, encode_control_param, encode_data, CodecError, ControlChar, DecodedEvent, Decoder,
};
use crate::config::{ConfigError, LinkConfig};
use crate::dispatch::{EventDispatcher, EventSource};
use crate::packet::{PacketSink, PacketSource};
use crate::scheduler::{Cancel, Scheduler};
use crate::task::{CoopTask, TaskContext, TaskState};
use crate::wire::{ByteSink, ByteSource};
use core::cell::{Cell, RefCell};
use core::fmt;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::rc::Rc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LinkState {
    #[default]
    Connecting,
    Handshaking,
    Operating,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub resets: u64,
    pub primary_handshakes_sent: u64,
    pub secondary_handshakes_sent: u64,
    pub fcts_sent: u64,
    pub fcts_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_aborted: u64,
    pub codec_errors: u64,
    pub bytes_received: u64,
}

/// Point-in-time copy of the session flags, for inspection and reporting.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub state: LinkState,
    pub local_handshake_id: u32,
    pub remote_handshake_id: u32,
    pub send_secondary_pending: bool,
    pub inbound_len: usize,
    pub inbound_complete: bool,
    pub has_sent_fct: bool,
    pub remote_sent_fct: bool,
    pub recv_in_progress: bool,
    pub tx_busy: bool,
}

/// The byte streams and packet endpoints a link sits between.
pub struct LinkPorts {
    pub wire_in: Rc<dyn ByteSource>,
    pub wire_out: Rc<dyn ByteSink>,
    /// Packets waiting to be sent to the peer.
    pub outbound: Rc<dyn PacketSource>,
    /// Where packets received from the peer are delivered.
    pub inbound: Rc<dyn PacketSink>,
}

#[derive(Debug, Default)]
struct Session {
    state: LinkState,
    local_handshake_id: u32,
    remote_handshake_id: u32,
    send_secondary_pending: bool,
    inbound_buffer: Vec<u8>,
    inbound_complete: bool,
    has_sent_fct: bool,
    remote_sent_fct: bool,
    recv_in_progress: bool,
    // Owned by the wire write in progress; survives resets.
    tx_busy: bool,
}

impl Session {
    fn check_invariants(&self) {
        assert!(
            !(self.inbound_complete && self.recv_in_progress),
            "packet both complete and mid-reception"
        );
        assert!(
            !(self.has_sent_fct && self.recv_in_progress),
            "receive grant outstanding during reception"
        );
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            local_handshake_id: self.local_handshake_id,
            remote_handshake_id: self.remote_handshake_id,
            send_secondary_pending: self.send_secondary_pending,
            inbound_len: self.inbound_buffer.len(),
            inbound_complete: self.inbound_complete,
            has_sent_fct: self.has_sent_fct,
            remote_sent_fct: self.remote_sent_fct,
            recv_in_progress: self.recv_in_progress,
            tx_busy: self.tx_busy,
        }
    }
}

#[derive(Debug)]
enum ResetCause {
    Requested,
    Codec(CodecError),
    Unexpected { ch: ControlChar, state: LinkState },
    StrayData { len: usize, state: LinkState },
    HandshakeCollision { id: u32 },
    HandshakeMismatch { expected: u32, received: u32 },
    DuplicateFlowControl,
}

impl fmt::Display for ResetCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResetCause::Requested => write!(f, "requested"),
            ResetCause::Codec(error) => write!(f, "codec error: {}", error),
            ResetCause::Unexpected { ch, state } => write!(f, "unexpected {:?} while {:?}", ch, state),
            ResetCause::StrayData { len, state } => write!(f, "{} stray data bytes while {:?}", len, state),
            ResetCause::HandshakeCollision { id } => write!(f, "primary handshake {:#010x} outside Connecting", id),
            ResetCause::HandshakeMismatch { expected, received } => {
                write!(f, "secondary handshake {:#010x}, expected {:#010x}", received, expected)
            }
            ResetCause::DuplicateFlowControl => write!(f, "duplicate flow-control token"),
        }
    }
}

struct Link {
    label: String,
    sim: Scheduler,
    config: LinkConfig,
    session: RefCell<Session>,
    decoder: RefCell<Decoder>,
    // Bumped by every reset; writers compare it across suspension points.
    epoch: Cell<u64>,
    stats: RefCell<LinkStats>,
    changed: EventDispatcher,
    ports: LinkPorts,
}

impl Link {
    fn pump_rx(&self) {
        let mut buf = vec![0u8; self.config.read_chunk];
        loop {
            let count = self.ports.wire_in.try_read(&mut buf);
            if count == 0 {
                break;
            }
            let events = self.decoder.borrow_mut().decode(&buf[..count]);
            for event in events {
                self.handle_event(event);
            }
        }
    }

    fn handle_event(&self, event: DecodedEvent) {
        match event {
            DecodedEvent::Data(bytes) => self.on_data(&bytes),
            DecodedEvent::Control { ch, param } => self.on_control(ch, param),
            DecodedEvent::CodecError(error) => {
                self.stats.borrow_mut().codec_errors += 1;
                self.reset_with(ResetCause::Codec(error));
            }
        }
    }

    fn on_data(&self, bytes: &[u8]) {
        let mut session = self.session.borrow_mut();
        if session.state == LinkState::Operating && session.recv_in_progress {
            session.inbound_buffer.extend_from_slice(bytes);
            self.stats.borrow_mut().bytes_received += bytes.len() as u64;
            return;
        }
        let state = session.state;
        drop(session);
        self.reset_with(ResetCause::StrayData {
            len: bytes.len(),
            state,
        });
    }

    fn on_control(&self, ch: ControlChar, param: Option<u32>) {
        let mut session = self.session.borrow_mut();
        let outcome = match (ch, param, session.state) {
            (ControlChar::Handshake1, Some(id), LinkState::Connecting) => {
                debug!(link = %self.label, id, "primary handshake received");
                session.remote_handshake_id = id;
                session.send_secondary_pending = true;
                Ok(())
            }
            (ControlChar::Handshake1, Some(id), _) => Err(ResetCause::HandshakeCollision { id }),
            (ControlChar::Handshake2, Some(id), LinkState::Handshaking) => {
                if id == session.local_handshake_id {
                    session.state = LinkState::Operating;
                    info!(link = %self.label, time = %self.sim.now(), id, "link operating");
                    Ok(())
                } else {
                    Err(ResetCause::HandshakeMismatch {
                        expected: session.local_handshake_id,
                        received: id,
                    })
                }
            }
            (ControlChar::FlowControl, None, LinkState::Operating) => {
                if session.remote_sent_fct {
                    Err(ResetCause::DuplicateFlowControl)
                } else {
                    session.remote_sent_fct = true;
                    self.stats.borrow_mut().fcts_received += 1;
                    Ok(())
                }
            }
            (ControlChar::StartPacket, None, LinkState::Operating) if session.has_sent_fct => {
                session.has_sent_fct = false;
                session.recv_in_progress = true;
                session.inbound_buffer.clear();
                Ok(())
            }
            (ControlChar::EndPacket, None, LinkState::Operating) if session.recv_in_progress => {
                session.recv_in_progress = false;
                session.inbound_complete = true;
                Ok(())
            }
            (ControlChar::ErrorEndPacket, None, LinkState::Operating) if session.recv_in_progress => {
                debug!(link = %self.label, len = session.inbound_buffer.len(), "inbound packet aborted");
                session.recv_in_progress = false;
                session.inbound_buffer.clear();
                self.stats.borrow_mut().packets_aborted += 1;
                Ok(())
            }
            (ch, _, state) => Err(ResetCause::Unexpected { ch, state }),
        };

        match outcome {
            Ok(()) => {
                session.check_invariants();
                drop(session);
                self.changed.dispatch_later();
            }
            Err(cause) => {
                drop(session);
                self.reset_with(cause);
            }
        }
    }

    fn reset_with(&self, cause: ResetCause) {
        {
            let mut session = self.session.borrow_mut();
            let tx_busy = session.tx_busy;
            *session = Session {
                tx_busy,
                ..Session::default()
            };
        }
        self.epoch.set(self.epoch.get() + 1);
        self.stats.borrow_mut().resets += 1;
        match cause {
            ResetCause::Requested => info!(link = %self.label, time = %self.sim.now(), "link reset requested"),
            cause => warn!(link = %self.label, time = %self.sim.now(), %cause, "link reset"),
        }
        self.changed.dispatch_later();
    }

    fn retransmit_delay(&self) -> Duration {
        let min = self.config.handshake_interval_min().as_nanos() as u64;
        let max = self.config.handshake_interval_max().as_nanos() as u64;
        Duration::from_nanos(self.sim.rng().gen_range(min..max))
    }

    /// Put `frame` on the wire as one unit. Returns `false` if a reset cut it short.
    async fn transmit(&self, ctx: &TaskContext, frame: &[u8]) -> bool {
        {
            let mut session = self.session.borrow_mut();
            assert!(!session.tx_busy, "{}: transmission started while wire is busy", self.label);
            session.tx_busy = true;
        }
        let epoch = self.epoch.get();
        let mut offset = 0;
        let complete = loop {
            offset += self.ports.wire_out.try_write(&frame[offset..]);
            if offset == frame.len() {
                break true;
            }
            ctx.yield_wait(&[&self.ports.wire_out, &self.changed]).await;
            if self.epoch.get() != epoch {
                break false;
            }
        };
        {
            let mut session = self.session.borrow_mut();
            assert!(session.tx_busy, "{}: wire released twice", self.label);
            session.tx_busy = false;
        }
        self.changed.dispatch_later();
        complete
    }

    fn take_completed_packet(&self) -> Option<Vec<u8>> {
        if !self.ports.inbound.can_accept_packet() {
            return None;
        }
        let mut session = self.session.borrow_mut();
        if !session.inbound_complete {
            return None;
        }
        session.inbound_complete = false;
        Some(core::mem::take(&mut session.inbound_buffer))
    }

    /// Claims the receive grant if one should be issued now.
    fn claim_grant(&self) -> bool {
        let mut session = self.session.borrow_mut();
        let ready = session.state == LinkState::Operating
            && !session.has_sent_fct
            && !session.recv_in_progress
            && !session.inbound_complete
            && !session.tx_busy;
        if ready {
            session.has_sent_fct = true;
        }
        ready
    }

    async fn deliver_loop(&self, ctx: &TaskContext) {
        loop {
            if let Some(packet) = self.take_completed_packet() {
                debug!(link = %self.label, len = packet.len(), "packet delivered");
                self.ports.inbound.send_packet(packet);
                self.stats.borrow_mut().packets_received += 1;
                self.changed.dispatch_later();
                continue;
            }

            if self.claim_grant() {
                let mut frame = Vec::with_capacity(1);
                encode_control(ControlChar::FlowControl, &mut frame);
                if self.transmit(ctx, &frame).await {
                    self.stats.borrow_mut().fcts_sent += 1;
                }
                continue;
            }

            ctx.yield_wait(&[&self.changed, &self.ports.inbound]).await;
        }
    }

    fn take_outbound_packet(&self) -> Option<Vec<u8>> {
        {
            let session = self.session.borrow();
            if session.state != LinkState::Operating || !session.remote_sent_fct || session.tx_busy {
                return None;
            }
        }
        let packet = self.ports.outbound.receive_packet()?;
        self.session.borrow_mut().remote_sent_fct = false;
        Some(packet)
    }

    async fn transmit_loop(&self, ctx: &TaskContext) {
        loop {
            if let Some(packet) = self.take_outbound_packet() {
                let mut frame = Vec::with_capacity(packet.len() + packet.len() / 4 + 2);
                encode_control(ControlChar::StartPacket, &mut frame);
                encode_data(&packet, &mut frame);
                encode_control(ControlChar::EndPacket, &mut frame);

                if self.transmit(ctx, &frame).await {
                    debug!(link = %self.label, len = packet.len(), "packet sent");
                    self.stats.borrow_mut().packets_sent += 1;
                } else {
                    debug!(link = %self.label, len = packet.len(), "packet cut short by reset");
                }
                continue;
            }

            ctx.yield_wait(&[&self.changed, &self.ports.outbound]).await;
        }
    }

    async fn send_primary(&self, ctx: &TaskContext) {
        let id: u32 = self.sim.rng().gen();
        {
            let mut session = self.session.borrow_mut();
            session.local_handshake_id = id;
            session.state = LinkState::Handshaking;
        }
        debug!(link = %self.label, time = %self.sim.now(), id, "sending primary handshake");
        self.changed.dispatch_later();

        let mut frame = Vec::with_capacity(9);
        encode_control_param(ControlChar::Handshake1, id, &mut frame);
        if self.transmit(ctx, &frame).await {
            self.stats.borrow_mut().primary_handshakes_sent += 1;
        }
    }

    async fn send_secondary(&self, ctx: &TaskContext, id: u32) {
        self.session.borrow_mut().send_secondary_pending = false;
        let epoch = self.epoch.get();
        debug!(link = %self.label, time = %self.sim.now(), id, "sending secondary handshake");

        let mut frame = Vec::with_capacity(9);
        encode_control_param(ControlChar::Handshake2, id, &mut frame);
        let sent = self.transmit(ctx, &frame).await;
        if sent {
            self.stats.borrow_mut().secondary_handshakes_sent += 1;
        }

        let mut session = self.session.borrow_mut();
        if sent
            && self.epoch.get() == epoch
            && session.state == LinkState::Connecting
            && session.remote_handshake_id == id
        {
            session.state = LinkState::Operating;
            drop(session);
            info!(link = %self.label, time = %self.sim.now(), id, "link operating");
            self.changed.dispatch_later();
        } else {
            debug!(link = %self.label, id, "secondary handshake superseded");
        }
    }

    async fn handshake_loop(&self, ctx: &TaskContext) {
        let mut epoch = self.epoch.get();
        let mut next_primary = ctx.now() + self.retransmit_delay();
        loop {
            if self.epoch.get() != epoch {
                epoch = self.epoch.get();
                next_primary = ctx.now() + self.retransmit_delay();
            }

            let (state, tx_busy, secondary) = {
                let session = self.session.borrow();
                let secondary = session
                    .send_secondary_pending
                    .then_some(session.remote_handshake_id);
                (session.state, session.tx_busy, secondary)
            };

            if !tx_busy {
                if let Some(id) = secondary {
                    self.send_secondary(ctx, id).await;
                    continue;
                }
                if state != LinkState::Operating && ctx.now() >= next_primary {
                    self.send_primary(ctx).await;
                    next_primary = ctx.now() + self.retransmit_delay();
                    continue;
                }
            }

            if state == LinkState::Operating {
                ctx.yield_wait(&[&self.changed]).await;
            } else {
                ctx.yield_wait_until(&[&self.changed], next_primary).await;
            }
        }
    }
}

/// One end of a FakeWire link.
pub struct LinkExchange {
    link: Rc<Link>,
    tasks: Vec<CoopTask>,
    rx_subscription: Option<Cancel>,
}

impl LinkExchange {
    /// Build a link in the `Connecting` state. Its tasks first run at the current
    /// instant, once the scheduler is advanced.
    pub fn new(
        sim: &Scheduler,
        label: impl Into<String>,
        config: LinkConfig,
        ports: LinkPorts,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let link = Rc::new(Link {
            label: label.into(),
            sim: sim.clone(),
            config,
            session: RefCell::new(Session::default()),
            decoder: RefCell::new(Decoder::parametrized()),
            epoch: Cell::new(0),
            stats: RefCell::new(LinkStats::default()),
            changed: EventDispatcher::new(sim, "fw-changed"),
            ports,
        });

        let weak = Rc::downgrade(&link);
        let rx_subscription = link.ports.wire_in.subscribe(Rc::new(move || {
            if let Some(link) = weak.upgrade() {
                link.pump_rx();
            }
        }));
        let weak = Rc::downgrade(&link);
        sim.later("fw-rx-initial", move || {
            if let Some(link) = weak.upgrade() {
                link.pump_rx();
            }
        });

        let deliver = Rc::clone(&link);
        let transmit = Rc::clone(&link);
        let handshake = Rc::clone(&link);
        let tasks = vec![
            CoopTask::start(sim, "fw-deliver", &[&link.changed], move |ctx| async move {
                deliver.deliver_loop(&ctx).await;
            }),
            CoopTask::start(sim, "fw-transmit", &[&link.changed], move |ctx| async move {
                transmit.transmit_loop(&ctx).await;
            }),
            CoopTask::start(sim, "fw-handshake", &[&link.changed], move |ctx| async move {
                handshake.handshake_loop(&ctx).await;
            }),
        ];
        link.changed.dispatch_later();

        Ok(Self {
            link,
            tasks,
            rx_subscription: Some(rx_subscription),
        })
    }

    pub fn label(&self) -> &str {
        &self.link.label
    }

    pub fn state(&self) -> LinkState {
        self.link.session.borrow().state
    }

    pub fn is_operating(&self) -> bool {
        self.state() == LinkState::Operating
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.link.session.borrow().snapshot()
    }

    pub fn stats(&self) -> LinkStats {
        self.link.stats.borrow().clone()
    }

    /// Drop all session state and start connecting again.
    pub fn reset(&self) {
        self.link.reset_with(ResetCause::Requested);
    }

    pub fn task_states(&self) -> Vec<(&'static str, TaskState)> {
        self.tasks.iter().map(|task| (task.name(), task.state())).collect()
    }
}

impl Drop for LinkExchange {
    fn drop(&mut self) {
        if let Some(subscription) = self.rx_subscription.take() {
            subscription.cancel();
        }
    }
}

impl fmt::Debug for LinkExchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkExchange")
            .field("label", &self.link.label)
            .field("session", &self.snapshot())
            .finish()
    }
}
