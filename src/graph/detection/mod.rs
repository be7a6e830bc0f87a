//! Hierarchical community detection.
//!
//! Level 0 partitions the whole entity graph; deeper levels re-cluster the
//! induced subgraph of each parent community. The recursion is expressed as
//! an explicit worklist of (parent, level) pairs, and the resulting tree is
//! stored flat through `parent_id` back-references.

pub mod clustering;

use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, info, warn};

use crate::core::config::DetectionConfig;
use crate::core::error::{RepographError, Result};
use crate::graph::model::{Community, Entity, GraphError, Relationship};
use clustering::{cluster, partition_modularity, ClusterConfig, Partition};

pub struct DetectionOutcome {
    pub communities: Vec<Community>,
    pub warnings: Vec<GraphError>,
}

pub struct CommunityDetector {
    config: DetectionConfig,
}

impl CommunityDetector {
    pub fn new(config: DetectionConfig) -> Self {
        Self { config }
    }

    /// Assigns every entity to exactly one community per level it
    /// participates in, updates entity ranks with detection-time degree
    /// statistics, and returns the full flat community list.
    pub fn detect(
        &self,
        entities: &mut [Entity],
        relationships: &[Relationship],
    ) -> Result<DetectionOutcome> {
        if entities.is_empty() {
            return Err(RepographError::Detection(
                "cannot detect communities over an empty entity set".to_string(),
            ));
        }

        let index: HashMap<&str, usize> = entities
            .iter()
            .enumerate()
            .map(|(i, e)| (e.id.as_str(), i))
            .collect();

        // Undirected adjacency; direction is irrelevant for clustering and
        // parallel edges collapse into summed weights.
        let mut pair_weights: HashMap<(usize, usize), f64> = HashMap::new();
        for rel in relationships {
            let (Some(&a), Some(&b)) = (index.get(rel.source.as_str()), index.get(rel.target.as_str()))
            else {
                return Err(RepographError::Detection(format!(
                    "relationship {} references an entity outside the snapshot",
                    rel.id
                )));
            };
            if a == b {
                continue;
            }
            let key = if a < b { (a, b) } else { (b, a) };
            *pair_weights.entry(key).or_default() += rel.weight;
        }

        let mut adjacency: Vec<Vec<(usize, f64)>> = vec![Vec::new(); entities.len()];
        for (&(a, b), &w) in &pair_weights {
            adjacency[a].push((b, w));
            adjacency[b].push((a, w));
        }

        self.update_ranks(entities, &adjacency);

        let mut communities: Vec<Community> = Vec::new();
        let mut warnings: Vec<GraphError> = Vec::new();
        let mut sequence: HashMap<u32, usize> = HashMap::new();

        // Isolated entities become level-0 singletons and stop there.
        let connected: Vec<usize> = (0..entities.len())
            .filter(|&i| !adjacency[i].is_empty())
            .collect();
        for i in 0..entities.len() {
            if adjacency[i].is_empty() {
                let id = next_id(&mut sequence, 0);
                let mut community =
                    Community::new(id.clone(), 0, None, vec![entities[i].id.clone()]);
                community.rank = entities[i].rank;
                entities[i].communities.push(id);
                communities.push(community);
            }
        }

        if connected.is_empty() {
            info!(
                "No relationships to cluster; emitted {} singleton communities",
                communities.len()
            );
            return Ok(DetectionOutcome {
                communities,
                warnings,
            });
        }

        // Worklist of (member indices, level, parent community id).
        let mut worklist: VecDeque<(Vec<usize>, u32, Option<String>)> = VecDeque::new();
        worklist.push_back((connected, 0, None));

        while let Some((members, level, parent_id)) = worklist.pop_front() {
            let Some(groups) = self.split(&members, &adjacency, level, &mut warnings) else {
                continue;
            };

            for group in groups {
                let id = next_id(&mut sequence, level);
                for &i in &group {
                    entities[i].communities.push(id.clone());
                }

                let member_ids: Vec<String> =
                    group.iter().map(|&i| entities[i].id.clone()).collect();
                let mut community = Community::new(id.clone(), level, parent_id.clone(), member_ids);
                community.rank = group.iter().map(|&i| entities[i].rank).sum::<f64>()
                    / group.len().max(1) as f64;
                communities.push(community);

                if level + 1 < self.config.max_levels && group.len() > self.config.min_community_size
                {
                    // Low-ranked entities stay in their coarse community but
                    // are excluded from finer levels.
                    let refined: Vec<usize> = group
                        .iter()
                        .copied()
                        .filter(|&i| entities[i].rank >= self.config.entity_rank_threshold)
                        .collect();
                    if refined.len() > self.config.min_community_size {
                        worklist.push_back((refined, level + 1, Some(id)));
                    }
                }
            }
        }

        normalize_community_ranks(&mut communities);

        let max_level = communities.iter().map(|c| c.level).max().unwrap_or(0);
        info!(
            "Detected {} communities across {} levels ({} warnings)",
            communities.len(),
            max_level + 1,
            warnings.len()
        );

        Ok(DetectionOutcome {
            communities,
            warnings,
        })
    }

    /// One clustering pass over the induced subgraph of `members`.
    ///
    /// Returns `None` when the subgraph should not be split (the parent
    /// stays a leaf); otherwise the member groups of the new communities.
    fn split(
        &self,
        members: &[usize],
        adjacency: &[Vec<(usize, f64)>],
        level: u32,
        warnings: &mut Vec<GraphError>,
    ) -> Option<Vec<Vec<usize>>> {
        let local_index: HashMap<usize, usize> =
            members.iter().enumerate().map(|(li, &gi)| (gi, li)).collect();

        let mut local_adjacency: Vec<Vec<(usize, f64)>> = vec![Vec::new(); members.len()];
        for (li, &gi) in members.iter().enumerate() {
            for &(neighbor, weight) in &adjacency[gi] {
                if let Some(&lj) = local_index.get(&neighbor) {
                    local_adjacency[li].push((lj, weight));
                }
            }
        }

        let partition = self.best_partition(&local_adjacency);

        if partition.community_count <= 1 {
            // Nothing finer than the parent itself.
            if level > 0 {
                return None;
            }
        }

        // Deeper levels must actually improve on keeping the parent whole.
        if level > 0 {
            let single = vec![0u32; members.len()];
            let whole = partition_modularity(&local_adjacency, &single, self.config.resolution);
            if partition.modularity <= whole {
                return None;
            }
        }

        let mut groups: Vec<Vec<usize>> = vec![Vec::new(); partition.community_count as usize];
        for (li, &c) in partition.assignment.iter().enumerate() {
            groups[c as usize].push(members[li]);
        }

        Some(self.merge_undersized(groups, adjacency, level, warnings))
    }

    /// Runs the clustering pass twice and keeps the better partition;
    /// equal modularity breaks toward the more size-balanced one.
    fn best_partition(&self, local_adjacency: &[Vec<(usize, f64)>]) -> Partition {
        let base = ClusterConfig {
            resolution: self.config.resolution,
            max_iterations: self.config.max_iterations,
            min_improvement: 1e-6,
            seed: self.config.seed,
        };
        let alternate = ClusterConfig {
            seed: self.config.seed.map(|s| s.wrapping_add(1)),
            ..base.clone()
        };

        let first = cluster(local_adjacency, &base);
        let second = cluster(local_adjacency, &alternate);

        if (first.modularity - second.modularity).abs() < 1e-9 {
            if second.size_variance() < first.size_variance() {
                return second;
            }
            return first;
        }
        if second.modularity > first.modularity {
            second
        } else {
            first
        }
    }

    /// Folds groups below `min_community_size` into the neighboring group
    /// they share the most edge weight with.
    fn merge_undersized(
        &self,
        mut groups: Vec<Vec<usize>>,
        adjacency: &[Vec<(usize, f64)>],
        level: u32,
        warnings: &mut Vec<GraphError>,
    ) -> Vec<Vec<usize>> {
        let mut unmergeable: HashSet<usize> = HashSet::new();
        loop {
            let Some(small) = groups
                .iter()
                .enumerate()
                .position(|(gi, g)| {
                    !g.is_empty()
                        && g.len() < self.config.min_community_size
                        && !unmergeable.contains(&gi)
                })
                .filter(|_| groups.iter().filter(|g| !g.is_empty()).count() > 1)
            else {
                break;
            };

            let group_of: HashMap<usize, usize> = groups
                .iter()
                .enumerate()
                .flat_map(|(gi, g)| g.iter().map(move |&n| (n, gi)))
                .collect();

            // Total edge weight from the small group to each other group.
            let mut weight_to: HashMap<usize, f64> = HashMap::new();
            for &node in &groups[small] {
                for &(neighbor, weight) in &adjacency[node] {
                    if let Some(&target) = group_of.get(&neighbor) {
                        if target != small {
                            *weight_to.entry(target).or_default() += weight;
                        }
                    }
                }
            }

            let Some((&target, _)) = weight_to
                .iter()
                .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
            else {
                // No edges out of this group: keep it rather than orphan its
                // entities, but flag that the size floor was not met.
                warn!(
                    "Community of {} entities at level {} has no merge target",
                    groups[small].len(),
                    level
                );
                warnings.push(GraphError::warning(
                    "community-detection",
                    format!(
                        "community below minimum size ({} < {}) at level {} retained: no merge target",
                        groups[small].len(),
                        self.config.min_community_size,
                        level
                    ),
                ));
                unmergeable.insert(small);
                continue;
            };

            debug!(
                "Merging undersized community ({} entities) into neighbor at level {}",
                groups[small].len(),
                level
            );
            let moved = std::mem::take(&mut groups[small]);
            groups[target].extend(moved);
        }

        groups.retain(|g| !g.is_empty());
        groups
    }

    /// Detection-time rank refresh: blend the ingest-time prior with the
    /// entity's degree share in the undirected projection.
    fn update_ranks(&self, entities: &mut [Entity], adjacency: &[Vec<(usize, f64)>]) {
        let degrees: Vec<f64> = adjacency
            .iter()
            .map(|adj| adj.iter().map(|(_, w)| w).sum())
            .collect();
        let max_degree = degrees.iter().cloned().fold(0.0_f64, f64::max).max(1e-9);

        for (i, entity) in entities.iter_mut().enumerate() {
            let centrality = degrees[i] / max_degree;
            entity.rank = (entity.rank + centrality) / 2.0;
        }
    }
}

fn next_id(sequence: &mut HashMap<u32, usize>, level: u32) -> String {
    let seq = sequence.entry(level).or_insert(0);
    let id = format!("com-{}-{}", level, *seq);
    *seq += 1;
    id
}

fn normalize_community_ranks(communities: &mut [Community]) {
    let max_raw = communities
        .iter()
        .map(|c| c.rank * c.member_ids.len() as f64)
        .fold(0.0_f64, f64::max)
        .max(1e-9);
    for community in communities {
        community.rank = (community.rank * community.member_ids.len() as f64) / max_raw;
    }
}
