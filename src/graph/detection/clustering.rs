//! Weighted-modularity clustering pass.
//!
//! Single-level local-moving optimization (Louvain-style): every node
//! starts in its own community and greedily moves to the neighboring
//! community with the highest modularity gain, in shuffled order, until a
//! sweep produces no move. The hierarchy layer drives repeated passes over
//! induced subgraphs; this module only ever flattens one level.

use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Higher resolution favors more, smaller communities.
    pub resolution: f64,
    /// Cap on local-moving sweeps.
    pub max_iterations: usize,
    /// Minimum modularity delta to keep sweeping.
    pub min_improvement: f64,
    pub seed: Option<u64>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            resolution: 1.0,
            max_iterations: 50,
            min_improvement: 1e-6,
            seed: None,
        }
    }
}

/// One flat partition of the input nodes.
#[derive(Debug, Clone)]
pub struct Partition {
    /// Community index per node, contiguous from 0.
    pub assignment: Vec<u32>,
    pub community_count: u32,
    pub modularity: f64,
}

impl Partition {
    /// Population variance of community sizes; the tie-break metric when
    /// two partitions score equal modularity.
    pub fn size_variance(&self) -> f64 {
        if self.community_count == 0 {
            return 0.0;
        }
        let mut sizes = vec![0usize; self.community_count as usize];
        for &c in &self.assignment {
            sizes[c as usize] += 1;
        }
        let mean = self.assignment.len() as f64 / self.community_count as f64;
        sizes
            .iter()
            .map(|&s| (s as f64 - mean).powi(2))
            .sum::<f64>()
            / self.community_count as f64
    }
}

/// Undirected weighted adjacency lists: `neighbors[i]` holds
/// `(j, weight)` pairs, symmetric by construction.
pub fn cluster(neighbors: &[Vec<(usize, f64)>], config: &ClusterConfig) -> Partition {
    let n = neighbors.len();
    if n == 0 {
        return Partition {
            assignment: Vec::new(),
            community_count: 0,
            modularity: 0.0,
        };
    }

    let degrees: Vec<f64> = neighbors
        .iter()
        .map(|adj| adj.iter().map(|(_, w)| w).sum())
        .collect();
    let total_weight: f64 = degrees.iter().sum::<f64>() / 2.0;

    // No edges: every node is its own community.
    if total_weight <= 0.0 {
        return Partition {
            assignment: (0..n as u32).collect(),
            community_count: n as u32,
            modularity: 0.0,
        };
    }

    let mut rng = match config.seed {
        Some(seed) => rand::rngs::StdRng::seed_from_u64(seed),
        None => rand::rngs::StdRng::from_entropy(),
    };

    let mut assignment: Vec<u32> = (0..n as u32).collect();
    let mut current = modularity(neighbors, &assignment, &degrees, total_weight, config.resolution);

    for _sweep in 0..config.max_iterations {
        let moved = local_moving_sweep(
            neighbors,
            &mut assignment,
            &degrees,
            total_weight,
            config.resolution,
            &mut rng,
        );

        let next = modularity(neighbors, &assignment, &degrees, total_weight, config.resolution);
        let improvement = next - current;
        current = next;

        if !moved || improvement < config.min_improvement {
            break;
        }
    }

    let (assignment, community_count) = renumber(&assignment);
    Partition {
        modularity: current,
        assignment,
        community_count,
    }
}

/// Modularity of an arbitrary assignment over the same adjacency.
pub fn partition_modularity(
    neighbors: &[Vec<(usize, f64)>],
    assignment: &[u32],
    resolution: f64,
) -> f64 {
    let degrees: Vec<f64> = neighbors
        .iter()
        .map(|adj| adj.iter().map(|(_, w)| w).sum())
        .collect();
    let total_weight: f64 = degrees.iter().sum::<f64>() / 2.0;
    if total_weight <= 0.0 {
        return 0.0;
    }
    modularity(neighbors, assignment, &degrees, total_weight, resolution)
}

fn local_moving_sweep<R: Rng>(
    neighbors: &[Vec<(usize, f64)>],
    assignment: &mut [u32],
    degrees: &[f64],
    total_weight: f64,
    resolution: f64,
    rng: &mut R,
) -> bool {
    let n = assignment.len();
    let mut moved = false;

    // Degree mass per community, maintained incrementally across moves.
    let mut community_degree: HashMap<u32, f64> = HashMap::new();
    for (node, &c) in assignment.iter().enumerate() {
        *community_degree.entry(c).or_default() += degrees[node];
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.shuffle(rng);

    for &node in &order {
        let current = assignment[node];

        let mut edge_weight_to: HashMap<u32, f64> = HashMap::new();
        for &(neighbor, weight) in &neighbors[node] {
            if neighbor != node {
                *edge_weight_to.entry(assignment[neighbor]).or_default() += weight;
            }
        }

        let weight_to_current = edge_weight_to.get(&current).copied().unwrap_or(0.0);
        let current_degree_without =
            community_degree.get(&current).copied().unwrap_or(0.0) - degrees[node];
        let loss = weight_to_current
            - resolution * degrees[node] * current_degree_without / (2.0 * total_weight);

        let mut best = current;
        let mut best_gain = 0.0;

        for (&candidate, &weight_to_candidate) in &edge_weight_to {
            if candidate == current {
                continue;
            }
            let candidate_degree = community_degree.get(&candidate).copied().unwrap_or(0.0);
            let gain = weight_to_candidate
                - resolution * degrees[node] * candidate_degree / (2.0 * total_weight)
                - loss;

            if gain > best_gain {
                best_gain = gain;
                best = candidate;
            }
        }

        if best != current {
            assignment[node] = best;
            *community_degree.entry(current).or_default() -= degrees[node];
            *community_degree.entry(best).or_default() += degrees[node];
            moved = true;
        }
    }

    moved
}

fn modularity(
    neighbors: &[Vec<(usize, f64)>],
    assignment: &[u32],
    degrees: &[f64],
    total_weight: f64,
    resolution: f64,
) -> f64 {
    // Q = (1/2m) * sum_ij [A_ij - r * k_i k_j / 2m] over same-community pairs.
    let mut internal = 0.0;
    for (i, adj) in neighbors.iter().enumerate() {
        for &(j, w) in adj {
            if assignment[i] == assignment[j] {
                internal += w;
            }
        }
    }

    let mut community_degree: HashMap<u32, f64> = HashMap::new();
    for (node, &c) in assignment.iter().enumerate() {
        *community_degree.entry(c).or_default() += degrees[node];
    }
    let expected: f64 = community_degree
        .values()
        .map(|&d| resolution * d * d / (2.0 * total_weight))
        .sum();

    (internal - expected) / (2.0 * total_weight)
}

fn renumber(assignment: &[u32]) -> (Vec<u32>, u32) {
    let mut mapping: HashMap<u32, u32> = HashMap::new();
    let mut next_id = 0u32;

    let renumbered = assignment
        .iter()
        .map(|&c| {
            *mapping.entry(c).or_insert_with(|| {
                let id = next_id;
                next_id += 1;
                id
            })
        })
        .collect();

    (renumbered, next_id)
}
