//! Priority/weight ranking of the servers behind a virtual model
//!
//! Servers are grouped into tiers by priority (lower first) and ordered by weight within a tier.
//! Two modes are offered:
//! 1. [`Ranking::full_order`] - a deterministic retry order over every server in every tier. This
//!    is what dispatch walks.
//! 2. [`Ranking::pick_one`] - health-check one tier at a time and pick among its healthy members
//!    by weighted random selection. Used by diagnostics.

use crate::client::HttpClient;
use crate::health::{HealthProber, HealthProbeResult};
use crate::registry::ServerRecord;
use futures_util::future::join_all;
use rand::Rng;
use std::collections::BTreeMap;
use tracing::{info, warn};

/// All servers sharing one priority value, heaviest first.
#[derive(Debug, Clone)]
pub struct PriorityTier {
    pub priority: u32,
    members: Vec<ServerRecord>,
}

impl PriorityTier {
    fn new(priority: u32, mut members: Vec<ServerRecord>) -> Self {
        // sort_by is stable, so equal weights keep registry order.
        members.sort_by(|a, b| b.weight.cmp(&a.weight));
        Self { priority, members }
    }

    pub fn members(&self) -> &[ServerRecord] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// A server chosen by [`Ranking::pick_one`], with the probe that cleared it.
#[derive(Debug, Clone)]
pub struct Selection {
    pub server: ServerRecord,
    pub health: HealthProbeResult,
}

#[derive(Debug, Clone)]
pub struct Ranking {
    tiers: Vec<PriorityTier>,
}

impl Ranking {
    pub fn new(servers: Vec<ServerRecord>) -> Self {
        let mut groups: BTreeMap<u32, Vec<ServerRecord>> = BTreeMap::new();
        for server in servers {
            groups.entry(server.priority).or_default().push(server);
        }
        let tiers = groups
            .into_iter()
            .map(|(priority, members)| PriorityTier::new(priority, members))
            .collect();
        Self { tiers }
    }

    pub fn tiers(&self) -> &[PriorityTier] {
        &self.tiers
    }

    /// Total number of servers across all tiers.
    pub fn len(&self) -> usize {
        self.tiers.iter().map(PriorityTier::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }

    /// Every server, priority ascending then weight descending. Performs no health checks.
    pub fn full_order(&self) -> Vec<ServerRecord> {
        self.tiers
            .iter()
            .flat_map(|tier| tier.members.iter().cloned())
            .collect()
    }

    /// Pick one healthy server from the most preferred tier that has any.
    ///
    /// A tier with a single member is probed directly. Larger tiers are probed concurrently and
    /// the healthy subset is sampled by weight.
    pub async fn pick_one<T: HttpClient + Send + Sync>(
        &self,
        prober: &HealthProber<T>,
    ) -> Option<Selection> {
        for tier in &self.tiers {
            let probes = join_all(
                tier.members
                    .iter()
                    .map(|s| prober.probe(&s.server_url, &s.actual_model_name)),
            )
            .await;

            let healthy: Vec<(&ServerRecord, HealthProbeResult)> = tier
                .members
                .iter()
                .zip(probes)
                .filter(|(_, probe)| probe.healthy)
                .collect();

            let weights: Vec<u32> = healthy.iter().map(|(s, _)| s.weight).collect();
            let picked = weighted_index(&weights, &mut rand::rng());
            if let Some(idx) = picked {
                let (server, health) = &healthy[idx];
                info!(
                    server_url = %server.server_url,
                    actual_model = %server.actual_model_name,
                    weight = server.weight,
                    priority = server.priority,
                    "Selected server for {}", server.virtual_model_name
                );
                return Some(Selection {
                    server: (*server).clone(),
                    health: health.clone(),
                });
            }
            warn!("No healthy server in priority tier {}", tier.priority);
        }
        None
    }
}

/// Weighted random choice over `weights`: draw from `[0, total)` and walk cumulative weights.
/// When every weight is zero the choice is uniform. `None` only for an empty slice.
pub fn weighted_index<R: Rng + ?Sized>(weights: &[u32], rng: &mut R) -> Option<usize> {
    match weights.len() {
        0 => return None,
        1 => return Some(0),
        _ => {}
    }

    let total_weight: u64 = weights.iter().map(|&w| u64::from(w)).sum();
    if total_weight == 0 {
        return Some(rng.random_range(0..weights.len()));
    }

    let random_weight = rng.random_range(0..total_weight);
    let mut cumulative_weight = 0u64;
    for (idx, &weight) in weights.iter().enumerate() {
        cumulative_weight += u64::from(weight);
        if random_weight < cumulative_weight {
            return Some(idx);
        }
    }
    Some(weights.len() - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockHttpClient, MockResponse};
    use axum::http::StatusCode;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::collections::HashMap;
    use std::time::Duration;

    fn server(id: u64, host: &str, priority: u32, weight: u32) -> ServerRecord {
        ServerRecord::builder()
            .id(id)
            .virtual_model_name("qwen3")
            .server_url(format!("http://{host}:11434").parse().unwrap())
            .actual_model_name("qwen3:14b")
            .priority(priority)
            .weight(weight)
            .build()
    }

    fn ids(servers: &[ServerRecord]) -> Vec<u64> {
        servers.iter().map(|s| s.id).collect()
    }

    #[test]
    fn full_order_is_priority_then_weight_with_stable_ties() {
        let ranking = Ranking::new(vec![
            server(1, "a", 2, 50),
            server(2, "b", 1, 30),
            server(3, "c", 1, 70),
            server(4, "d", 3, 10),
            server(5, "e", 1, 30),
            server(6, "f", 2, 50),
        ]);

        assert_eq!(ids(&ranking.full_order()), vec![3, 2, 5, 1, 6, 4]);
        let priorities: Vec<u32> = ranking.tiers().iter().map(|t| t.priority).collect();
        assert_eq!(priorities, vec![1, 2, 3]);
        assert_eq!(ranking.len(), 6);
    }

    #[test]
    fn full_order_is_deterministic() {
        let servers = vec![
            server(1, "a", 1, 100),
            server(2, "b", 1, 100),
            server(3, "c", 2, 0),
            server(4, "d", 1, 100),
        ];
        let first = Ranking::new(servers.clone()).full_order();
        for _ in 0..20 {
            assert_eq!(Ranking::new(servers.clone()).full_order(), first);
        }
        assert_eq!(ids(&first), vec![1, 2, 4, 3]);
    }

    #[test]
    fn empty_input_has_no_order() {
        let ranking = Ranking::new(vec![]);
        assert!(ranking.is_empty());
        assert!(ranking.full_order().is_empty());
    }

    #[test]
    fn weighted_index_follows_weights() {
        let mut rng = StdRng::seed_from_u64(7);
        let weights = [30, 70];
        let mut counts = [0usize; 2];
        for _ in 0..10_000 {
            counts[weighted_index(&weights, &mut rng).unwrap()] += 1;
        }
        let share = counts[1] as f64 / 10_000.0;
        assert!((0.65..0.75).contains(&share), "expected ~0.7, got {share}");
    }

    #[test]
    fn zero_total_weight_is_uniform() {
        let mut rng = StdRng::seed_from_u64(11);
        let weights = [0, 0, 0, 0];
        let mut counts = [0usize; 4];
        for _ in 0..8_000 {
            counts[weighted_index(&weights, &mut rng).unwrap()] += 1;
        }
        for count in counts {
            assert!((1_700..2_300).contains(&count), "uneven pick: {counts:?}");
        }
    }

    #[test]
    fn zero_weight_member_is_never_drawn_when_others_have_weight() {
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..1_000 {
            assert_eq!(weighted_index(&[0, 5], &mut rng), Some(1));
        }
        assert_eq!(weighted_index(&[], &mut rng), None);
    }

    fn prober_with_down_hosts(down: &'static [&'static str]) -> (HealthProber<MockHttpClient>, MockHttpClient) {
        let client = MockHttpClient::with_handler(move |req| {
            if down.contains(&req.host().as_str()) {
                MockResponse::TransportError("connection refused".into())
            } else {
                MockResponse::json(StatusCode::OK, serde_json::json!({"models": []}))
            }
        });
        (HealthProber::new(client.clone(), Duration::from_millis(100)), client)
    }

    #[tokio::test]
    async fn pick_one_samples_healthy_members_of_first_tier() {
        let (prober, client) = prober_with_down_hosts(&["a"]);
        let ranking = Ranking::new(vec![
            server(1, "a", 1, 1000),
            server(2, "b", 1, 30),
            server(3, "c", 1, 70),
            server(4, "d", 2, 100),
        ]);

        let mut counts: HashMap<u64, usize> = HashMap::new();
        for _ in 0..200 {
            let picked = ranking.pick_one(&prober).await.unwrap();
            assert!(picked.health.healthy);
            *counts.entry(picked.server.id).or_default() += 1;
        }
        assert!(!counts.contains_key(&1));
        assert!(!counts.contains_key(&4));
        assert!(counts[&3] > counts[&2]);
        // Each pick probes the whole first tier and nothing else.
        assert!(client.get_requests().iter().all(|r| r.host() != "d"));
    }

    #[tokio::test]
    async fn pick_one_falls_through_to_next_tier() {
        let (prober, _) = prober_with_down_hosts(&["a", "b"]);
        let ranking = Ranking::new(vec![
            server(1, "a", 1, 30),
            server(2, "b", 1, 70),
            server(3, "c", 2, 100),
        ]);
        let picked = ranking.pick_one(&prober).await.unwrap();
        assert_eq!(picked.server.id, 3);
    }

    #[tokio::test]
    async fn pick_one_single_member_tier() {
        let (prober, client) = prober_with_down_hosts(&[]);
        let ranking = Ranking::new(vec![server(1, "a", 1, 0)]);
        assert_eq!(ranking.pick_one(&prober).await.unwrap().server.id, 1);
        assert_eq!(client.get_requests().len(), 1);
    }

    #[tokio::test]
    async fn pick_one_none_when_everything_is_down() {
        let (prober, _) = prober_with_down_hosts(&["a", "b"]);
        let ranking = Ranking::new(vec![server(1, "a", 1, 30), server(2, "b", 2, 70)]);
        assert!(ranking.pick_one(&prober).await.is_none());
    }
}
