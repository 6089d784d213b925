//! K-means clustering of entities by their raw feature values.

use itertools::Itertools;
use log::{debug, info};
use polars::prelude::*;

use crate::error::Result;
use crate::table::TabularResult;
use crate::COL;

pub const DEFAULT_CLUSTER_COUNT: usize = 3;

/// Features the dashboard clusters countries by. Values are used as-is, without scaling.
pub const FEATURES: [&str; 3] = [COL::TOTAL_CASES, COL::TOTAL_DEATH, COL::POPULATION];

const MAX_ITERATIONS: usize = 300;

fn squared_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

fn nearest(point: &[f64], centroids: &[Vec<f64>]) -> usize {
    centroids
        .iter()
        .map(|c| squared_distance(point, c))
        .position_min_by(|a, b| a.total_cmp(b))
        .unwrap_or(0)
}

/// Farthest-point seeding: start from the first point, then repeatedly take the point farthest
/// from every centroid chosen so far. Ties go to the earliest point.
fn seed(points: &[Vec<f64>], k: usize) -> Vec<Vec<f64>> {
    let mut centroids = vec![points[0].clone()];
    while centroids.len() < k {
        let mut farthest = (0, f64::NEG_INFINITY);
        for (idx, point) in points.iter().enumerate() {
            let distance = centroids
                .iter()
                .map(|c| squared_distance(point, c))
                .fold(f64::INFINITY, f64::min);
            if distance > farthest.1 {
                farthest = (idx, distance);
            }
        }
        centroids.push(points[farthest.0].clone());
    }
    centroids
}

/// Assign each point to one of `k` clusters with Lloyd's algorithm. Points must share one
/// dimension. No points or no clusters give no labels.
pub fn kmeans(points: &[Vec<f64>], k: usize) -> Vec<usize> {
    if points.is_empty() || k == 0 {
        return Vec::new();
    }
    let mut centroids = seed(points, k);
    let mut labels = points.iter().map(|p| nearest(p, &centroids)).collect_vec();
    for iteration in 0..MAX_ITERATIONS {
        for (cluster, centroid) in centroids.iter_mut().enumerate() {
            let members = points
                .iter()
                .zip(&labels)
                .filter(|(_, label)| **label == cluster)
                .map(|(p, _)| p)
                .collect_vec();
            // An empty cluster keeps its previous centroid
            if members.is_empty() {
                continue;
            }
            for (dim, value) in centroid.iter_mut().enumerate() {
                *value = members.iter().map(|p| p[dim]).sum::<f64>() / members.len() as f64;
            }
        }
        let next = points.iter().map(|p| nearest(p, &centroids)).collect_vec();
        if next == labels {
            debug!("k-means converged after {} iterations", iteration + 1);
            break;
        }
        labels = next;
    }
    labels
}

/// Cluster the rows of `table` by `features`, attaching a [`COL::CLUSTER`] label column. Rows
/// missing any feature are dropped first. Returns `None` when fewer than `k` rows remain.
pub fn assign_clusters(
    table: &TabularResult,
    features: &[&str],
    k: usize,
) -> Result<Option<TabularResult>> {
    if table.is_empty() {
        info!("no rows to cluster");
        return Ok(None);
    }
    let columns = features
        .iter()
        .map(|f| table.column_f64(f))
        .collect::<Result<Vec<_>>>()?;
    let mut keep = vec![false; table.height()];
    let mut points = vec![];
    for (row, complete) in keep.iter_mut().enumerate() {
        if let Some(point) = columns.iter().map(|c| c[row]).collect::<Option<Vec<f64>>>() {
            *complete = true;
            points.push(point);
        }
    }
    if k == 0 || points.len() < k {
        info!(
            "not clustering {} complete rows into {k} clusters",
            points.len()
        );
        return Ok(None);
    }

    let mask = BooleanChunked::from_slice("keep", &keep);
    let mut clustered = TabularResult::from_frame(table.frame().filter(&mask)?);
    let labels = kmeans(&points, k)
        .into_iter()
        .map(|label| label as i64)
        .collect_vec();
    clustered.attach_column(Series::new(COL::CLUSTER, labels))?;
    Ok(Some(clustered))
}
