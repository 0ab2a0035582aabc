//! Bidirectional map between player identities and transport endpoints.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::hash::Hash;

use crate::telemetry::{InvariantChecker, InvariantViolation};
use crate::PlayerId;

/// Outcome of [`EndpointRegistry::identify`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identified<E> {
    /// First time this identity has been seen.
    New {
        /// Identity that carried this endpoint before and has been dropped.
        displaced: Option<PlayerId>,
    },
    /// The identity was known at another endpoint and now lives at this one.
    Rehomed {
        /// Where the identity used to live.
        previous: E,
        /// Identity that carried this endpoint before and has been dropped.
        displaced: Option<PlayerId>,
    },
    /// The identity was already mapped to this endpoint.
    Known,
}

impl<E> Identified<E> {
    /// Identity pushed off the endpoint by this identification, if any.
    #[must_use]
    pub const fn displaced(&self) -> Option<PlayerId> {
        match self {
            Self::New { displaced } | Self::Rehomed { displaced, .. } => *displaced,
            Self::Known => None,
        }
    }
}

/// Keeps `PlayerId <-> endpoint` consistent in both directions.
///
/// Each identity lives at exactly one endpoint and each endpoint carries at most one
/// identity. Re-identifying from a new endpoint moves the identity there; releasing the
/// old endpoint afterwards does not touch the moved identity.
#[derive(Debug, Clone)]
pub struct EndpointRegistry<E> {
    by_player: BTreeMap<PlayerId, E>,
    by_endpoint: HashMap<E, PlayerId>,
}

impl<E> Default for EndpointRegistry<E> {
    fn default() -> Self {
        Self {
            by_player: BTreeMap::new(),
            by_endpoint: HashMap::new(),
        }
    }
}

impl<E: Clone + Eq + Hash + Debug> EndpointRegistry<E> {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `player` was seen at `endpoint`.
    ///
    /// If `endpoint` previously carried a different identity, that identity is dropped and
    /// returned as `displaced`.
    pub fn identify(&mut self, player: PlayerId, endpoint: E) -> Identified<E> {
        let mut displaced = None;
        if let Some(other) = self.by_endpoint.get(&endpoint).copied() {
            if other == player {
                return Identified::Known;
            }
            self.by_player.remove(&other);
            displaced = Some(other);
        }

        let previous = self.by_player.insert(player, endpoint.clone());
        self.by_endpoint.insert(endpoint, player);
        match previous {
            None => Identified::New { displaced },
            Some(previous) => {
                self.by_endpoint.remove(&previous);
                Identified::Rehomed {
                    previous,
                    displaced,
                }
            },
        }
    }

    /// Forgets `endpoint`, returning the identity that still lived there.
    ///
    /// Returns `None` if the endpoint was unknown or its identity has since moved away.
    pub fn release_endpoint(&mut self, endpoint: &E) -> Option<PlayerId> {
        let player = self.by_endpoint.remove(endpoint)?;
        self.by_player.remove(&player);
        Some(player)
    }

    /// Forgets `player`, returning the endpoint it lived at.
    pub fn release_player(&mut self, player: PlayerId) -> Option<E> {
        let endpoint = self.by_player.remove(&player)?;
        self.by_endpoint.remove(&endpoint);
        Some(endpoint)
    }

    /// Current endpoint of `player`.
    #[must_use]
    pub fn endpoint_of(&self, player: PlayerId) -> Option<&E> {
        self.by_player.get(&player)
    }

    /// Identity currently living at `endpoint`.
    #[must_use]
    pub fn player_at(&self, endpoint: &E) -> Option<PlayerId> {
        self.by_endpoint.get(endpoint).copied()
    }

    /// Every known identity in ascending order.
    pub fn players(&self) -> impl Iterator<Item = PlayerId> + '_ {
        self.by_player.keys().copied()
    }

    /// `(identity, endpoint)` pairs in ascending identity order.
    pub fn entries(&self) -> impl Iterator<Item = (PlayerId, &E)> + '_ {
        self.by_player.iter().map(|(player, endpoint)| (*player, endpoint))
    }

    /// Number of known identities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_player.len()
    }

    /// Returns `true` if no identity is known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_player.is_empty()
    }
}

impl<E: Clone + Eq + Hash + Debug> InvariantChecker for EndpointRegistry<E> {
    fn check_invariants(&self) -> Result<(), InvariantViolation> {
        if self.by_player.len() != self.by_endpoint.len() {
            return Err(InvariantViolation::new(
                "EndpointRegistry",
                "forward and reverse maps differ in size",
            )
            .with_details(format!(
                "players={}, endpoints={}",
                self.by_player.len(),
                self.by_endpoint.len()
            )));
        }
        for (player, endpoint) in &self.by_player {
            if self.by_endpoint.get(endpoint) != Some(player) {
                return Err(InvariantViolation::new(
                    "EndpointRegistry",
                    "reverse map disagrees with forward map",
                )
                .with_details(format!("player={player}, endpoint={endpoint:?}")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    const A: &str = "10.0.0.1:5000";
    const B: &str = "10.0.0.1:5001";

    #[test]
    fn first_identification_is_new() {
        let mut registry = EndpointRegistry::new();
        assert_eq!(
            registry.identify(PlayerId::new(7), A),
            Identified::New { displaced: None }
        );
        assert_eq!(registry.identify(PlayerId::new(7), A), Identified::Known);
        assert_eq!(registry.endpoint_of(PlayerId::new(7)), Some(&A));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn reconnect_rehomes_without_duplicate() {
        let mut registry = EndpointRegistry::new();
        registry.identify(PlayerId::new(7), A);
        assert_eq!(
            registry.identify(PlayerId::new(7), B),
            Identified::Rehomed {
                previous: A,
                displaced: None
            }
        );
        assert_eq!(registry.endpoint_of(PlayerId::new(7)), Some(&B));
        assert_eq!(registry.player_at(&A), None);
        assert_eq!(registry.len(), 1);
        assert!(registry.check_invariants().is_ok());
    }

    #[test]
    fn releasing_old_endpoint_keeps_rehomed_identity() {
        let mut registry = EndpointRegistry::new();
        registry.identify(PlayerId::new(7), A);
        registry.identify(PlayerId::new(7), B);
        assert_eq!(registry.release_endpoint(&A), None);
        assert_eq!(registry.endpoint_of(PlayerId::new(7)), Some(&B));
        assert_eq!(registry.release_endpoint(&B), Some(PlayerId::new(7)));
        assert!(registry.is_empty());
    }

    #[test]
    fn endpoint_taken_over_by_new_identity() {
        let mut registry = EndpointRegistry::new();
        registry.identify(PlayerId::new(1), A);
        assert_eq!(
            registry.identify(PlayerId::new(2), A),
            Identified::New {
                displaced: Some(PlayerId::new(1))
            }
        );
        assert_eq!(registry.endpoint_of(PlayerId::new(1)), None);
        assert_eq!(registry.player_at(&A), Some(PlayerId::new(2)));
        assert!(registry.check_invariants().is_ok());
    }

    #[test]
    fn rehoming_onto_an_occupied_endpoint_reports_both_sides() {
        let mut registry = EndpointRegistry::new();
        registry.identify(PlayerId::new(1), A);
        registry.identify(PlayerId::new(2), B);
        let outcome = registry.identify(PlayerId::new(1), B);
        assert_eq!(
            outcome,
            Identified::Rehomed {
                previous: A,
                displaced: Some(PlayerId::new(2))
            }
        );
        assert_eq!(outcome.displaced(), Some(PlayerId::new(2)));
        assert_eq!(registry.players().collect::<Vec<_>>(), vec![PlayerId::new(1)]);
        assert_eq!(registry.player_at(&A), None);
        assert!(registry.check_invariants().is_ok());
    }

    #[test]
    fn players_are_listed_in_order() {
        let mut registry = EndpointRegistry::new();
        registry.identify(PlayerId::new(3), A);
        registry.identify(PlayerId::new(1), B);
        assert_eq!(
            registry.players().collect::<Vec<_>>(),
            vec![PlayerId::new(1), PlayerId::new(3)]
        );
        assert_eq!(registry.release_player(PlayerId::new(3)), Some(A));
        assert!(registry.check_invariants().is_ok());
    }
}
