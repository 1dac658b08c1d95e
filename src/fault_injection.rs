use crate::codec::ControlChar;
use crate::scheduler::Scheduler;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::trace;

// Per-byte probabilities when injection is switched on without further tuning.
const DEFAULT_BIT_FLIP_RATE: f64 = 1e-4;
const DEFAULT_CONTROL_INSERT_RATE: f64 = 1e-5;

/// Control symbols the injector may splice into a stream.
const INSERTABLE_CONTROLS: [ControlChar; 6] = [
    ControlChar::Handshake1,
    ControlChar::Handshake2,
    ControlChar::StartPacket,
    ControlChar::EndPacket,
    ControlChar::ErrorEndPacket,
    ControlChar::FlowControl,
];

/// Fault injection statistics
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct FaultInjectionStats {
    pub bytes_seen: u64,
    pub bits_flipped: u64,
    pub controls_inserted: u64,
}

/// Configuration for line fault injection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FaultInjectionConfig {
    pub enabled: bool,
    /// Probability that any one byte has a single random bit flipped.
    pub bit_flip_rate: f64,
    /// Probability that a random control symbol is inserted before any one byte.
    pub control_insert_rate: f64,
}

impl Default for FaultInjectionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bit_flip_rate: DEFAULT_BIT_FLIP_RATE,
            control_insert_rate: DEFAULT_CONTROL_INSERT_RATE,
        }
    }
}

impl FaultInjectionConfig {
    pub fn validate(&self) -> Result<(), &'static str> {
        if !(0.0..=1.0).contains(&self.bit_flip_rate) {
            return Err("bit_flip_rate must be within [0, 1]");
        }
        if !(0.0..=1.0).contains(&self.control_insert_rate) {
            return Err("control_insert_rate must be within [0, 1]");
        }
        Ok(())
    }
}

/// Probabilistic corruption of a byte stream in transit.
///
/// Draws from the scheduler's RNG, so a corrupted run replays exactly under the
/// same seed.
#[derive(Debug)]
pub struct FaultInjector {
    sim: Scheduler,
    config: FaultInjectionConfig,
    stats: FaultInjectionStats,
}

impl FaultInjector {
    pub fn new(sim: &Scheduler) -> Self {
        Self::new_with_config(sim, FaultInjectionConfig::default())
    }

    /// # Panics
    /// If a rate lies outside `[0, 1]`.
    pub fn new_with_config(sim: &Scheduler, config: FaultInjectionConfig) -> Self {
        if let Err(reason) = config.validate() {
            panic!("invalid fault injection config: {}", reason);
        }
        Self {
            sim: sim.clone(),
            config,
            stats: FaultInjectionStats::default(),
        }
    }

    /// Copy `input` to `out`, corrupting it according to the configuration.
    pub fn corrupt(&mut self, input: &[u8], out: &mut Vec<u8>) {
        if !self.config.enabled {
            out.extend_from_slice(input);
            return;
        }

        let mut rng = self.sim.rng();
        for &byte in input {
            self.stats.bytes_seen += 1;

            if rng.gen_bool(self.config.control_insert_rate) {
                if let Some(ch) = INSERTABLE_CONTROLS.choose(&mut *rng) {
                    trace!(control = ?ch, "injecting control symbol");
                    out.push(ch.code());
                    self.stats.controls_inserted += 1;
                }
            }

            if rng.gen_bool(self.config.bit_flip_rate) {
                let bit = rng.gen_range(0..8);
                trace!(byte, bit, "flipping bit");
                out.push(byte ^ (1 << bit));
                self.stats.bits_flipped += 1;
            } else {
                out.push(byte);
            }
        }
    }

    pub fn get_stats(&self) -> &FaultInjectionStats {
        &self.stats
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.config.enabled = enabled;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(bit_flip_rate: f64, control_insert_rate: f64) -> FaultInjectionConfig {
        FaultInjectionConfig {
            enabled: true,
            bit_flip_rate,
            control_insert_rate,
        }
    }

    #[test]
    fn test_disabled_injector_is_transparent() {
        let sim = Scheduler::new(3);
        let mut injector = FaultInjector::new(&sim);
        let mut out = Vec::new();
        injector.corrupt(b"hello", &mut out);
        assert_eq!(out, b"hello");
        assert_eq!(injector.get_stats().bytes_seen, 0);
    }

    #[test]
    fn test_certain_bit_flip_changes_every_byte() {
        let sim = Scheduler::new(3);
        let mut injector = FaultInjector::new_with_config(&sim, config(1.0, 0.0));
        let input = [0u8; 64];
        let mut out = Vec::new();
        injector.corrupt(&input, &mut out);

        assert_eq!(out.len(), input.len());
        assert!(out.iter().all(|b| b.count_ones() == 1));
        assert_eq!(injector.get_stats().bits_flipped, 64);
    }

    #[test]
    fn test_control_insertion_grows_stream() {
        let sim = Scheduler::new(3);
        let mut injector = FaultInjector::new_with_config(&sim, config(0.0, 1.0));
        let mut out = Vec::new();
        injector.corrupt(&[0x11, 0x22], &mut out);

        assert_eq!(out.len(), 4);
        assert!(ControlChar::from_code(out[0]).is_some());
        assert_eq!(out[1], 0x11);
        assert_eq!(injector.get_stats().controls_inserted, 2);
    }

    #[test]
    fn test_same_seed_same_corruption() {
        let run = |seed| {
            let sim = Scheduler::new(seed);
            let mut injector = FaultInjector::new_with_config(&sim, config(0.3, 0.1));
            let mut out = Vec::new();
            injector.corrupt(&[0x55; 256], &mut out);
            out
        };
        assert_eq!(run(9), run(9));
    }

    #[test]
    fn test_invalid_rate_rejected() {
        assert!(config(1.5, 0.0).validate().is_err());
        assert!(config(0.0, -0.1).validate().is_err());
        assert!(config(0.5, 0.5).validate().is_ok());
    }
}
