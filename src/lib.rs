//! # FakeWire Simulator
//!
//! A deterministic, single-threaded discrete-event simulator and the FakeWire
//! link protocol that runs on it.
//!
//! ## Features
//!
//! - **Virtual time**: nanosecond clock that only moves when the simulation advances it
//! - **Seeded randomness**: one RNG per scheduler, so every run replays exactly
//! - **Cooperative tasks**: sequential protocol scripts suspended at explicit yields
//! - **FakeWire codec**: control-symbol escaping with parametrised handshakes
//! - **Self-healing link**: any protocol violation resets and re-handshakes
//!
//! ## Quick Start
//!
//! ```rust
//! use fwsim::{SimConfig, Side, Testbed};
//! use std::time::Duration;
//!
//! let bed = Testbed::new(&SimConfig::default()).unwrap();
//! bed.run_for(Duration::from_millis(100));
//! assert!(bed.both_operating());
//! ```
//!
//! ## Architecture
//!
//! - [`time`] / [`scheduler`] - virtual clock, timer queue and seeded RNG
//! - [`dispatch`] - debounced publish/subscribe on top of the scheduler
//! - [`task`] - cooperative tasks driven by events and deadlines
//! - [`codec`] - FakeWire byte-stream encoding and decoding
//! - [`wire`] / [`packet`] - byte and packet endpoints, with in-memory implementations
//! - [`exchange`] - the link protocol state machine
//! - [`fault_injection`] - seeded line corruption
//! - [`testbed`] - two cross-wired endpoints with generated traffic

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::new_without_default)]

pub mod codec;
pub mod config;
pub mod dispatch;
pub mod exchange;
pub mod fault_injection;
pub mod packet;
pub mod scheduler;
pub mod task;
pub mod testbed;
pub mod time;
pub mod wire;

// Re-export main public types for convenience
pub use codec::{CodecError, ControlChar, DecodedEvent, Decoder};
pub use config::{ConfigError, LinkConfig, SimConfig};
pub use dispatch::{EventDispatcher, EventSource};
pub use exchange::{LinkExchange, LinkPorts, LinkState, LinkStats};
pub use fault_injection::{FaultInjectionConfig, FaultInjector};
pub use packet::{PacketQueue, PacketSink, PacketSource};
pub use scheduler::{Cancel, Scheduler};
pub use task::{CoopTask, TaskContext, TaskState};
pub use testbed::{Side, Testbed, TrafficStats, WireStats};
pub use time::VirtualTime;
pub use wire::{byte_pipe, ByteSink, ByteSource, PipeSink, PipeSource};
