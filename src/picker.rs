//! Chain selection policies
//!
//! A picker owns the loaded chains and hands one out per client
//! request. Implementations are safe to share across tasks; none of
//! the operations suspend.

use crate::proxy::Chain;
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Selection policy over a set of loaded chains
pub trait ChainPicker: Send + Sync {
    /// Add a chain to the set.
    fn add(&self, chain: Chain);

    /// Select a chain, or `None` when the set is empty.
    fn next(&self) -> Option<Chain>;

    /// Snapshot of every loaded chain, for diagnostics.
    fn all(&self) -> Vec<Chain>;

    /// Number of loaded chains.
    fn len(&self) -> usize;

    /// Whether no chains are loaded.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Build the picker selected on the command line.
pub fn picker_by_name(name: &str) -> Option<Arc<dyn ChainPicker>> {
    match name {
        "round-robin" => Some(Arc::new(RoundRobin::new())),
        "random" => Some(Arc::new(Random::new())),
        _ => None,
    }
}

fn read_chains(chains: &RwLock<Vec<Chain>>) -> RwLockReadGuard<'_, Vec<Chain>> {
    chains.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_chains(chains: &RwLock<Vec<Chain>>) -> RwLockWriteGuard<'_, Vec<Chain>> {
    chains.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Cycles through chains in load order
///
/// The counter may skip or repeat an index under heavy contention,
/// which is fine for spreading connections over upstreams.
#[derive(Debug, Default)]
pub struct RoundRobin {
    chains: RwLock<Vec<Chain>>,
    index: AtomicUsize,
}

impl RoundRobin {
    /// Create an empty round-robin picker.
    pub fn new() -> Self {
        RoundRobin::default()
    }
}

impl ChainPicker for RoundRobin {
    fn add(&self, chain: Chain) {
        write_chains(&self.chains).push(chain);
    }

    fn next(&self) -> Option<Chain> {
        let chains = read_chains(&self.chains);
        if chains.is_empty() {
            return None;
        }
        let index = self.index.fetch_add(1, Ordering::Relaxed) % chains.len();
        Some(chains[index].clone())
    }

    fn all(&self) -> Vec<Chain> {
        read_chains(&self.chains).clone()
    }

    fn len(&self) -> usize {
        read_chains(&self.chains).len()
    }
}

/// Selects a uniformly random chain per request
#[derive(Debug, Default)]
pub struct Random {
    chains: RwLock<Vec<Chain>>,
}

impl Random {
    /// Create an empty random picker.
    pub fn new() -> Self {
        Random::default()
    }
}

impl ChainPicker for Random {
    fn add(&self, chain: Chain) {
        write_chains(&self.chains).push(chain);
    }

    fn next(&self) -> Option<Chain> {
        let chains = read_chains(&self.chains);
        if chains.is_empty() {
            return None;
        }
        let index = rand::thread_rng().gen_range(0..chains.len());
        Some(chains[index].clone())
    }

    fn all(&self) -> Vec<Chain> {
        read_chains(&self.chains).clone()
    }

    fn len(&self) -> usize {
        read_chains(&self.chains).len()
    }
}
