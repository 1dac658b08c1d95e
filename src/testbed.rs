//! Two cross-wired link endpoints on one scheduler, with optional random traffic.

use crate::config::{ConfigError, SimConfig};
use crate::dispatch::EventDispatcher;
use crate::exchange::{LinkExchange, LinkPorts, LinkState, LinkStats};
use crate::fault_injection::{FaultInjectionStats, FaultInjector};
use crate::packet::{PacketQueue, PacketSink, PacketSource};
use crate::scheduler::Scheduler;
use crate::task::{CoopTask, TaskContext};
use crate::time::VirtualTime;
use crate::wire::{byte_pipe, PipeSink, PipeSource};
use core::cell::RefCell;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    A,
    B,
}

impl Side {
    pub fn peer(self) -> Side {
        match self {
            Side::A => Side::B,
            Side::B => Side::A,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Side::A => "A",
            Side::B => "B",
        }
    }
}

/// Raw byte counts on the pipes around one endpoint. Injected bytes are not counted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct WireStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Delivery accounting for one direction of generated traffic.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct TrafficStats {
    pub offered: u64,
    pub delivered: u64,
    /// Offered packets overtaken by a later delivery; dropped by a reset.
    pub lost: u64,
    /// Delivered packets that match nothing still in flight.
    pub mismatched: u64,
}

#[derive(Debug, Default)]
struct Direction {
    in_flight: VecDeque<Vec<u8>>,
    stats: TrafficStats,
}

impl Direction {
    fn record_delivery(&mut self, packet: &[u8]) -> bool {
        match self.in_flight.iter().position(|sent| sent.as_slice() == packet) {
            Some(index) => {
                self.stats.lost += index as u64;
                self.in_flight.drain(..=index);
                self.stats.delivered += 1;
                true
            }
            None => {
                self.stats.mismatched += 1;
                false
            }
        }
    }
}

/// One side of the testbed: a link and the packet queues above it.
pub struct Endpoint {
    link: LinkExchange,
    outbound: PacketQueue,
    inbound: PacketQueue,
    wire_in: PipeSource,
    // Carries this endpoint's bytes towards the peer.
    wire_out: PipeSink,
}

impl Endpoint {
    pub fn link(&self) -> &LinkExchange {
        &self.link
    }

    /// Packets queued here are sent to the peer.
    pub fn outbound(&self) -> &PacketQueue {
        &self.outbound
    }

    /// Packets received from the peer land here.
    pub fn inbound(&self) -> &PacketQueue {
        &self.inbound
    }

    pub fn wire_out(&self) -> &PipeSink {
        &self.wire_out
    }
}

pub struct Testbed {
    sim: Scheduler,
    config: SimConfig,
    a: Endpoint,
    b: Endpoint,
    traffic: [Rc<RefCell<Direction>>; 2],
    generators: Vec<CoopTask>,
    traffic_start: EventDispatcher,
}

impl Testbed {
    pub fn new(config: &SimConfig) -> Result<Self, ConfigError> {
        Self::build(Scheduler::new(config.seed), config)
    }

    /// Like [`Testbed::new`], but the scheduler records every fired timer.
    pub fn with_trace(config: &SimConfig) -> Result<Self, ConfigError> {
        Self::build(Scheduler::with_trace(config.seed), config)
    }

    fn build(sim: Scheduler, config: &SimConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let (a_out, b_in) = byte_pipe(&sim, "wire-a-to-b", config.pipe_capacity);
        let (b_out, a_in) = byte_pipe(&sim, "wire-b-to-a", config.pipe_capacity);
        if config.faults.enabled {
            a_out.attach_faults(FaultInjector::new_with_config(&sim, config.faults.clone()));
            b_out.attach_faults(FaultInjector::new_with_config(&sim, config.faults.clone()));
        }

        let endpoint = |side: Side, wire_in: PipeSource, wire_out: PipeSink| -> Result<Endpoint, ConfigError> {
            let outbound = PacketQueue::new(&sim);
            let inbound = PacketQueue::new(&sim);
            let link = LinkExchange::new(
                &sim,
                side.label(),
                config.link.clone(),
                LinkPorts {
                    wire_in: Rc::new(wire_in.clone()),
                    wire_out: Rc::new(wire_out.clone()),
                    outbound: Rc::new(outbound.clone()),
                    inbound: Rc::new(inbound.clone()),
                },
            )?;
            Ok(Endpoint {
                link,
                outbound,
                inbound,
                wire_in,
                wire_out,
            })
        };
        let a = endpoint(Side::A, a_in, a_out)?;
        let b = endpoint(Side::B, b_in, b_out)?;
        let traffic_start = EventDispatcher::new(&sim, "traffic-start");

        Ok(Self {
            sim,
            config: config.clone(),
            a,
            b,
            traffic: [Rc::default(), Rc::default()],
            generators: Vec::new(),
            traffic_start,
        })
    }

    pub fn sim(&self) -> &Scheduler {
        &self.sim
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn endpoint(&self, side: Side) -> &Endpoint {
        match side {
            Side::A => &self.a,
            Side::B => &self.b,
        }
    }

    pub fn link(&self, side: Side) -> &LinkExchange {
        &self.endpoint(side).link
    }

    pub fn both_operating(&self) -> bool {
        self.a.link.state() == LinkState::Operating && self.b.link.state() == LinkState::Operating
    }

    /// Append raw bytes to the stream `side` receives, bypassing capacity and faults.
    pub fn inject(&self, side: Side, raw: &[u8]) {
        self.endpoint(side.peer()).wire_out.inject(raw);
    }

    pub fn run_for(&self, span: Duration) -> VirtualTime {
        self.sim.advance_by(span)
    }

    pub fn run_until(&self, target: VirtualTime) -> VirtualTime {
        self.sim.advance(target)
    }

    pub fn link_stats(&self, side: Side) -> LinkStats {
        self.link(side).stats()
    }

    /// Corruption applied to the bytes `side` transmits, if faults are enabled.
    pub fn fault_stats(&self, side: Side) -> Option<FaultInjectionStats> {
        self.endpoint(side).wire_out.fault_stats()
    }

    /// Turn line corruption off or back on in both directions mid-run. Returns `false`
    /// when the testbed was built without fault injection.
    pub fn set_faults_enabled(&self, enabled: bool) -> bool {
        let a = self.a.wire_out.set_faults_enabled(enabled);
        let b = self.b.wire_out.set_faults_enabled(enabled);
        a && b
    }

    pub fn wire_stats(&self, side: Side) -> WireStats {
        let endpoint = self.endpoint(side);
        WireStats {
            bytes_sent: endpoint.wire_out.bytes_written(),
            bytes_received: endpoint.wire_in.bytes_read(),
        }
    }

    /// Traffic accounting for packets sent by `from`.
    pub fn traffic_stats(&self, from: Side) -> TrafficStats {
        self.direction(from).borrow().stats.clone()
    }

    fn direction(&self, from: Side) -> &Rc<RefCell<Direction>> {
        match from {
            Side::A => &self.traffic[0],
            Side::B => &self.traffic[1],
        }
    }

    /// Offer random packets on both sides every `packet_interval_ms` and check every
    /// delivery against what was offered. A zero interval leaves the links idle.
    pub fn start_traffic(&mut self) {
        if self.config.packet_interval_ms == 0 || !self.generators.is_empty() {
            return;
        }
        let start = self.traffic_start.clone();
        let interval = Duration::from_millis(self.config.packet_interval_ms);
        let max_size = self.config.packet_size;

        for side in [Side::A, Side::B] {
            let outbound = self.endpoint(side).outbound.clone();
            let direction = Rc::clone(self.direction(side));
            self.generators.push(CoopTask::start(
                &self.sim,
                "traffic-offer",
                &[&start],
                move |ctx| async move {
                    offer_loop(&ctx, side, &outbound, &direction, interval, max_size).await;
                },
            ));

            let inbound = self.endpoint(side).inbound.clone();
            let direction = Rc::clone(self.direction(side.peer()));
            self.generators.push(CoopTask::start(
                &self.sim,
                "traffic-check",
                &[&start],
                move |ctx| async move {
                    check_loop(&ctx, side, &inbound, &direction).await;
                },
            ));
        }
        start.dispatch_later();
    }
}

async fn offer_loop(
    ctx: &TaskContext,
    side: Side,
    outbound: &PacketQueue,
    direction: &RefCell<Direction>,
    interval: Duration,
    max_size: usize,
) {
    loop {
        while !outbound.can_accept_packet() {
            ctx.yield_wait(&[outbound]).await;
        }
        let packet: Vec<u8> = {
            let mut rng = ctx.sim().rng();
            let len = rng.gen_range(1..=max_size);
            (0..len).map(|_| rng.gen()).collect()
        };
        debug!(side = side.label(), len = packet.len(), "offering packet");
        {
            let mut direction = direction.borrow_mut();
            direction.in_flight.push_back(packet.clone());
            direction.stats.offered += 1;
        }
        outbound.send_packet(packet);
        ctx.yield_until(ctx.now() + interval).await;
    }
}

async fn check_loop(ctx: &TaskContext, side: Side, inbound: &PacketQueue, direction: &RefCell<Direction>) {
    loop {
        while let Some(packet) = inbound.receive_packet() {
            if !direction.borrow_mut().record_delivery(&packet) {
                warn!(side = side.label(), len = packet.len(), "delivered packet matches nothing sent");
            }
        }
        ctx.yield_wait(&[inbound]).await;
    }
}
