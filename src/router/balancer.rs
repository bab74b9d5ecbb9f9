/// Replica selection policies
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Picks one of `candidates` healthy replicas
pub trait SelectionPolicy: Send + Sync {
    /// Index into the candidate list, `None` when there are no candidates
    fn select(&self, candidates: usize) -> Option<usize>;
}

/// Round-robin selection
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }
}

impl SelectionPolicy for RoundRobin {
    fn select(&self, candidates: usize) -> Option<usize> {
        if candidates == 0 {
            return None;
        }

        let index = self.counter.fetch_add(1, Ordering::Relaxed) % candidates;
        Some(index)
    }
}

/// Uniform random selection
#[derive(Debug, Default)]
pub struct Random;

impl SelectionPolicy for Random {
    fn select(&self, candidates: usize) -> Option<usize> {
        if candidates == 0 {
            return None;
        }

        Some(rand::thread_rng().gen_range(0..candidates))
    }
}

/// Configured selection strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    #[default]
    RoundRobin,
    Random,
}

impl SelectionStrategy {
    pub fn build(self) -> Box<dyn SelectionPolicy> {
        match self {
            SelectionStrategy::RoundRobin => Box::new(RoundRobin::new()),
            SelectionStrategy::Random => Box::new(Random),
        }
    }
}

impl fmt::Display for SelectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectionStrategy::RoundRobin => write!(f, "round_robin"),
            SelectionStrategy::Random => write!(f, "random"),
        }
    }
}
