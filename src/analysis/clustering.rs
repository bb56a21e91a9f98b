// SPDX-License-Identifier: Apache-2.0

//! Density based grouping (DBSCAN) of one client's records.
//!
//! Two records are close when they happened within a few seconds of each
//! other and asked for the same kind of thing. The distance is the time gap
//! in seconds plus [`SHAPE_PENALTY`] when the request shapes differ.

use crate::servicelog::InputRecord;

pub const SHAPE_PENALTY: f64 = 1.0;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Clustering {
    /// Member indices of each cluster, ascending.
    pub clusters: Vec<Vec<usize>>,
    /// Indices not reachable from any core point.
    pub noise: Vec<usize>,
}

impl Clustering {
    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    /// Earliest member of each cluster, with its cluster size set to the
    /// number of members. `records` must be the slice that was clustered.
    pub fn representatives<R: InputRecord + Clone>(&self, records: &[R]) -> Vec<R> {
        self.clusters
            .iter()
            .filter_map(|members| {
                let first = *members
                    .iter()
                    .min_by_key(|&&i| (records[i].time(), i))?;
                let mut rep = records[first].clone();
                rep.set_cluster_size(members.len());
                Some(rep)
            })
            .collect()
    }
}

pub fn distance<R: InputRecord>(a: &R, b: &R) -> f64 {
    let gap = (a.time() - b.time()).num_milliseconds().abs() as f64 / 1000.0;
    if a.request_shape() == b.request_shape() {
        gap
    } else {
        gap + SHAPE_PENALTY
    }
}

fn neighbours<R: InputRecord>(records: &[R], i: usize, epsilon: f64) -> Vec<usize> {
    (0..records.len())
        .filter(|&j| distance(&records[i], &records[j]) <= epsilon)
        .collect()
}

/// Cluster `records` as given. A point is a core point when at least
/// `min_density` points (itself included) lie within `epsilon`.
pub fn dbscan<R: InputRecord>(records: &[R], min_density: usize, epsilon: f64) -> Clustering {
    let mut labels: Vec<Option<usize>> = vec![None; records.len()];
    let mut visited = vec![false; records.len()];
    let mut clusters: Vec<Vec<usize>> = Vec::new();

    for i in 0..records.len() {
        if visited[i] {
            continue;
        }
        visited[i] = true;
        let seeds = neighbours(records, i, epsilon);
        if seeds.len() < min_density.max(1) {
            continue;
        }

        let cluster_id = clusters.len();
        labels[i] = Some(cluster_id);
        let mut members = vec![i];
        let mut queue = seeds;
        let mut pos = 0;
        while pos < queue.len() {
            let j = queue[pos];
            pos += 1;
            if labels[j].is_none() {
                labels[j] = Some(cluster_id);
                members.push(j);
            }
            if visited[j] {
                continue;
            }
            visited[j] = true;
            let expansion = neighbours(records, j, epsilon);
            if expansion.len() >= min_density.max(1) {
                queue.extend(expansion);
            }
        }
        members.sort_unstable();
        clusters.push(members);
    }

    let noise = labels
        .iter()
        .enumerate()
        .filter(|(_, l)| l.is_none())
        .map(|(i, _)| i)
        .collect();

    Clustering { clusters, noise }
}

/// Sort by time (stable) and cluster. Returns the sorted records along with
/// the clustering, so the indices refer to the returned slice.
pub fn cluster_sorted<R: InputRecord>(
    mut records: Vec<R>,
    min_density: usize,
    epsilon: f64,
) -> (Vec<R>, Clustering) {
    records.sort_by_key(|r| r.time());
    let clustering = dbscan(&records, min_density, epsilon);
    (records, clustering)
}

/// Cluster representatives of `records`; empty when nothing clusters.
pub fn analyze<R: InputRecord + Clone>(records: Vec<R>, min_density: usize, epsilon: f64) -> Vec<R> {
    let (sorted, clustering) = cluster_sorted(records, min_density, epsilon);
    clustering.representatives(&sorted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::servicelog::{AppRecord, mapka};
    use chrono::DateTime;

    fn rec(secs: i64, path: &str) -> AppRecord {
        AppRecord::Mapka(mapka::InputRecord {
            time: DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap(),
            client_ip: "10.0.0.1".parse().ok(),
            user_id: None,
            method: "GET".to_string(),
            path: path.to_string(),
            query: String::new(),
            status: 200,
            referrer: String::new(),
            user_agent: "test".to_string(),
            proc_time: None,
            cluster_size: 0,
        })
    }

    fn offsets(records: &[AppRecord]) -> Vec<i64> {
        records
            .iter()
            .map(|r| r.time().timestamp() - 1_700_000_000)
            .collect()
    }

    #[test]
    fn test_distance() {
        assert_eq!(distance(&rec(0, "/a"), &rec(3, "/a")), 3.0);
        assert_eq!(distance(&rec(3, "/a"), &rec(0, "/b")), 4.0);
    }

    #[test]
    fn test_two_bursts_and_noise() {
        let records = vec![
            rec(0, "/a"),
            rec(1, "/a"),
            rec(2, "/a"),
            rec(100, "/a"),
            rec(200, "/a"),
            rec(201, "/a"),
            rec(202, "/a"),
            rec(203, "/a"),
        ];
        let clustering = dbscan(&records, 3, 1.5);
        assert_eq!(clustering.clusters, vec![vec![0, 1, 2], vec![4, 5, 6, 7]]);
        assert_eq!(clustering.noise, vec![3]);

        let reps = clustering.representatives(&records);
        assert_eq!(offsets(&reps), vec![0, 200]);
        assert_eq!(reps[0].cluster_size(), 3);
        assert_eq!(reps[1].cluster_size(), 4);
    }

    #[test]
    fn test_shape_penalty_separates_requests() {
        let records = vec![rec(0, "/a"), rec(0, "/b"), rec(0, "/a"), rec(0, "/b")];
        let clustering = dbscan(&records, 2, 0.5);
        assert_eq!(clustering.clusters, vec![vec![0, 2], vec![1, 3]]);
        assert!(clustering.noise.is_empty());
    }

    #[test]
    fn test_sparse_input_has_no_clusters() {
        let records: Vec<AppRecord> = (0..5).map(|i| rec(i * 60, "/a")).collect();
        assert!(analyze(records, 2, 5.0).is_empty());
    }

    #[test]
    fn test_deterministic_under_shuffled_input() {
        let ordered = vec![
            rec(0, "/a"),
            rec(1, "/a"),
            rec(2, "/b"),
            rec(50, "/a"),
            rec(51, "/a"),
            rec(52, "/a"),
            rec(300, "/c"),
        ];
        let mut shuffled = ordered.clone();
        shuffled.reverse();
        shuffled.swap(1, 4);

        let a = analyze(ordered.clone(), 2, 2.0);
        let b = analyze(shuffled, 2, 2.0);
        assert_eq!(a, b);
        assert_eq!(analyze(ordered.clone(), 2, 2.0), a);
        assert_eq!(offsets(&a), vec![0, 50]);
    }
}
