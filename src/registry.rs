//! Tracking and sampling of connected participants.

use std::collections::HashMap;

use rand::{seq::SliceRandom, SeedableRng};
use rand_chacha::ChaCha12Rng;
use thiserror::Error;
use tracing::debug;

use crate::client::{ClientHandle, ClientId};

/// Raised when a selection cannot reach its quorum.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("{available} clients available, {required} required")]
pub struct InsufficientClients {
    pub available: u32,
    pub required: u32,
}

/// The set of currently connected participants.
///
/// Membership may change between rounds as clients join or leave, so
/// callers re-query availability at each selection instead of caching
/// handles across rounds.
pub struct ClientRegistry {
    clients: HashMap<ClientId, ClientHandle>,
    // registration order; sampling from the map directly would not be
    // reproducible under a fixed seed
    order: Vec<ClientId>,
    rng: ChaCha12Rng,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::with_rng(ChaCha12Rng::from_entropy())
    }

    /// Creates a registry whose sampling is reproducible for the given seed.
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(ChaCha12Rng::seed_from_u64(seed))
    }

    fn with_rng(rng: ChaCha12Rng) -> Self {
        Self {
            clients: HashMap::new(),
            order: Vec::new(),
            rng,
        }
    }

    /// Makes the participant available for selection.
    pub fn register(&mut self, handle: ClientHandle) {
        let id = handle.id();
        if self.clients.insert(id, handle).is_none() {
            self.order.push(id);
        }
        debug!(%id, available = self.order.len(), "client registered");
    }

    /// Removes the participant from the selectable set.
    pub fn unregister(&mut self, id: &ClientId) -> Option<ClientHandle> {
        let handle = self.clients.remove(id)?;
        self.order.retain(|known| known != id);
        debug!(%id, available = self.order.len(), "client unregistered");
        Some(handle)
    }

    /// The number of currently connected participants.
    pub fn num_available(&self) -> u32 {
        self.clients.len() as u32
    }

    /// Samples `num_clients` distinct participants uniformly at random.
    ///
    /// Fails when fewer than `min_num_clients` participants are connected,
    /// or when the request itself exceeds availability. Never returns a
    /// short sample.
    pub fn sample(
        &mut self,
        num_clients: u32,
        min_num_clients: u32,
    ) -> Result<Vec<ClientHandle>, InsufficientClients> {
        let available = self.num_available();
        if available < min_num_clients {
            return Err(InsufficientClients {
                available,
                required: min_num_clients,
            });
        }
        if available < num_clients {
            return Err(InsufficientClients {
                available,
                required: num_clients,
            });
        }

        let chosen: Vec<ClientId> = self
            .order
            .choose_multiple(&mut self.rng, num_clients as usize)
            .copied()
            .collect();
        Ok(chosen.iter().map(|id| self.clients[id].clone()).collect())
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, sync::Arc};

    use async_trait::async_trait;

    use super::*;
    use crate::{
        client::{Client, ClientError, EvaluateResult, FitResult},
        model::ParameterSet,
        round::{Metrics, RoundConfig},
    };

    struct StubClient(ClientId);

    #[async_trait]
    impl Client for StubClient {
        fn id(&self) -> ClientId {
            self.0
        }

        async fn get_parameters(&self) -> Result<ParameterSet, ClientError> {
            Ok(ParameterSet::from(Vec::new()))
        }

        async fn fit(
            &self,
            parameters: ParameterSet,
            _config: RoundConfig,
        ) -> Result<FitResult, ClientError> {
            Ok(FitResult {
                parameters,
                num_examples: 1,
                metrics: Metrics::new(),
            })
        }

        async fn evaluate(
            &self,
            _parameters: ParameterSet,
            _config: RoundConfig,
        ) -> Result<EvaluateResult, ClientError> {
            Ok(EvaluateResult {
                loss: 0.0,
                num_examples: 1,
                metrics: Metrics::new(),
            })
        }
    }

    fn registry(seed: u64, ids: &[ClientId]) -> ClientRegistry {
        let mut registry = ClientRegistry::with_seed(seed);
        for id in ids {
            registry.register(Arc::new(StubClient(*id)));
        }
        registry
    }

    #[test]
    fn test_sample_returns_distinct_handles() {
        let ids: Vec<ClientId> = (0..10).map(|_| ClientId::new()).collect();
        let mut registry = registry(3, &ids);

        let sampled = registry.sample(4, 2).unwrap();
        assert_eq!(sampled.len(), 4);

        let distinct: HashSet<ClientId> = sampled.iter().map(|handle| handle.id()).collect();
        assert_eq!(distinct.len(), 4);
    }

    #[test]
    fn test_sample_below_quorum() {
        let ids: Vec<ClientId> = (0..3).map(|_| ClientId::new()).collect();
        let mut registry = registry(3, &ids);

        assert_eq!(
            registry.sample(2, 5).err(),
            Some(InsufficientClients {
                available: 3,
                required: 5,
            })
        );
        assert_eq!(
            registry.sample(7, 2).err(),
            Some(InsufficientClients {
                available: 3,
                required: 7,
            })
        );
    }

    #[test]
    fn test_sampling_is_reproducible_under_a_seed() {
        let ids: Vec<ClientId> = (0..10).map(|_| ClientId::new()).collect();
        let mut first = registry(42, &ids);
        let mut second = registry(42, &ids);

        let left: Vec<ClientId> = first
            .sample(5, 1)
            .unwrap()
            .iter()
            .map(|handle| handle.id())
            .collect();
        let right: Vec<ClientId> = second
            .sample(5, 1)
            .unwrap()
            .iter()
            .map(|handle| handle.id())
            .collect();
        assert_eq!(left, right);
    }

    #[test]
    fn test_unregister_shrinks_availability() {
        let ids: Vec<ClientId> = (0..3).map(|_| ClientId::new()).collect();
        let mut registry = registry(3, &ids);

        assert!(registry.unregister(&ids[0]).is_some());
        assert!(registry.unregister(&ids[0]).is_none());
        assert_eq!(registry.num_available(), 2);
    }
}
