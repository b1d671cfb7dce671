//! Fault-injecting network link for testing.
//!
//! Real networks drop, reorder, duplicate and corrupt datagrams.  To exercise
//! the reliability mechanisms without depending on actual network
//! conditions, [`Port::pair_with`](crate::port::Port::pair_with) routes each
//! direction of an in-memory link through a [`Simulator`] that applies a
//! configurable fault model:
//!
//! | Fault            | Description                                      |
//! |------------------|--------------------------------------------------|
//! | Packet loss      | Drop a datagram with probability `loss_rate`.    |
//! | Duplication      | Deliver a datagram twice.                        |
//! | Corruption       | Flip one random bit at or after `corrupt_offset`.|
//! | Reordering       | Hold a datagram back by `reorder_delay`, letting |
//! |                  | later datagrams overtake it.                     |
//! | Delay            | Fixed latency added to every datagram.           |
//!
//! The RNG is seeded from the config so a failing run can be reproduced.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;

/// Configuration for the fault-injection model.
///
/// All probabilities are in the range `[0.0, 1.0]`; values outside it are
/// clamped.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Probability that any given datagram is silently dropped.
    pub loss_rate: f64,
    /// Probability that a datagram is delivered twice.
    pub duplicate_rate: f64,
    /// Probability that a delivered copy has one bit flipped.
    pub corrupt_rate: f64,
    /// First byte eligible for corruption (e.g. skip the segment header).
    pub corrupt_offset: usize,
    /// Probability that a datagram is reordered.
    pub reorder_rate: f64,
    /// Extra delay applied to reordered datagrams.
    pub reorder_delay: Duration,
    /// Latency applied to every datagram.
    pub delay: Duration,
    /// RNG seed.
    pub seed: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        // No faults: a transparent pass-through.
        Self {
            loss_rate: 0.0,
            duplicate_rate: 0.0,
            corrupt_rate: 0.0,
            corrupt_offset: 0,
            reorder_rate: 0.0,
            reorder_delay: Duration::ZERO,
            delay: Duration::ZERO,
            seed: 0,
        }
    }
}

/// Running totals of the faults injected so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimulatorStats {
    pub forwarded: u64,
    pub dropped: u64,
    pub duplicated: u64,
    pub corrupted: u64,
    pub reordered: u64,
}

/// One direction of a faulty link.
pub struct Simulator {
    pub config: SimulatorConfig,
    rng: StdRng,
    stats: SimulatorStats,
}

impl Simulator {
    pub fn new(config: SimulatorConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            config,
            rng,
            stats: SimulatorStats::default(),
        }
    }

    pub fn stats(&self) -> SimulatorStats {
        self.stats
    }

    /// Decide the fate of one datagram.
    ///
    /// Returns every copy that should be delivered, each with the delay to
    /// apply before delivery.  An empty result means the datagram was lost.
    pub fn apply(&mut self, bytes: Vec<u8>) -> Vec<(Duration, Vec<u8>)> {
        if self.roll(self.config.loss_rate) {
            self.stats.dropped += 1;
            return Vec::new();
        }

        let copies = if self.roll(self.config.duplicate_rate) {
            self.stats.duplicated += 1;
            2
        } else {
            1
        };

        let mut out = Vec::with_capacity(copies);
        for _ in 0..copies {
            let mut copy = bytes.clone();
            if self.roll(self.config.corrupt_rate) && copy.len() > self.config.corrupt_offset {
                let byte = self.rng.random_range(self.config.corrupt_offset..copy.len());
                let bit = self.rng.random_range(0..8u8);
                copy[byte] ^= 1 << bit;
                self.stats.corrupted += 1;
            }
            let mut delay = self.config.delay;
            if self.roll(self.config.reorder_rate) {
                delay += self.config.reorder_delay;
                self.stats.reordered += 1;
            }
            self.stats.forwarded += 1;
            out.push((delay, copy));
        }
        out
    }

    /// Relay datagrams from `rx` to `tx` until either side closes.
    pub async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
        tx: mpsc::UnboundedSender<Vec<u8>>,
    ) {
        while let Some(bytes) = rx.recv().await {
            for (delay, copy) in self.apply(bytes) {
                if delay.is_zero() {
                    if tx.send(copy).is_err() {
                        return;
                    }
                } else {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = tx.send(copy);
                    });
                }
            }
        }
        log::debug!("[sim] link closed: {:?}", self.stats);
    }

    fn roll(&mut self, p: f64) -> bool {
        self.rng.random_bool(p.clamp(0.0, 1.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> SimulatorConfig {
        SimulatorConfig::default()
    }

    #[test]
    fn default_is_pass_through() {
        let mut sim = Simulator::new(cfg());
        for i in 0..100u8 {
            let out = sim.apply(vec![i; 16]);
            assert_eq!(out, vec![(Duration::ZERO, vec![i; 16])]);
        }
        assert_eq!(sim.stats().forwarded, 100);
        assert_eq!(sim.stats().dropped, 0);
    }

    #[test]
    fn full_loss_drops_everything() {
        let mut sim = Simulator::new(SimulatorConfig {
            loss_rate: 1.0,
            ..cfg()
        });
        assert!(sim.apply(vec![1, 2, 3]).is_empty());
        assert_eq!(sim.stats().dropped, 1);
    }

    #[test]
    fn duplication_yields_two_copies() {
        let mut sim = Simulator::new(SimulatorConfig {
            duplicate_rate: 1.0,
            ..cfg()
        });
        let out = sim.apply(vec![9; 4]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].1, out[1].1);
    }

    #[test]
    fn corruption_flips_exactly_one_bit_past_offset() {
        let mut sim = Simulator::new(SimulatorConfig {
            corrupt_rate: 1.0,
            corrupt_offset: 8,
            seed: 42,
            ..cfg()
        });
        let original = vec![0u8; 32];
        for _ in 0..50 {
            let (_, copy) = sim.apply(original.clone()).remove(0);
            let flipped: u32 = copy.iter().map(|b| b.count_ones()).sum();
            assert_eq!(flipped, 1);
            assert!(copy[..8].iter().all(|&b| b == 0), "header region touched");
        }
    }

    #[test]
    fn reordered_copies_are_delayed() {
        let mut sim = Simulator::new(SimulatorConfig {
            reorder_rate: 1.0,
            reorder_delay: Duration::from_millis(20),
            delay: Duration::from_millis(1),
            ..cfg()
        });
        let out = sim.apply(vec![0]);
        assert_eq!(out[0].0, Duration::from_millis(21));
        assert_eq!(sim.stats().reordered, 1);
    }

    #[test]
    fn same_seed_same_faults() {
        let config = SimulatorConfig {
            loss_rate: 0.5,
            seed: 7,
            ..cfg()
        };
        let mut a = Simulator::new(config.clone());
        let mut b = Simulator::new(config);
        let fate_a: Vec<bool> = (0..64).map(|_| a.apply(vec![0]).is_empty()).collect();
        let fate_b: Vec<bool> = (0..64).map(|_| b.apply(vec![0]).is_empty()).collect();
        assert_eq!(fate_a, fate_b);
    }

    #[tokio::test]
    async fn run_relays_until_sender_closes() {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let relay = tokio::spawn(Simulator::new(cfg()).run(in_rx, out_tx));

        in_tx.send(vec![1]).unwrap();
        in_tx.send(vec![2]).unwrap();
        drop(in_tx);

        assert_eq!(out_rx.recv().await, Some(vec![1]));
        assert_eq!(out_rx.recv().await, Some(vec![2]));
        relay.await.unwrap();
        assert_eq!(out_rx.recv().await, None);
    }
}
