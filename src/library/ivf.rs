//! IVF (inverted file) vector index library.
//!
//! Clusters the vectors with k-means (k-means++ seeding, fixed iteration
//! budget) and writes the centroids, the per-cluster row lists and the
//! prepared vectors.

use std::fs::File;
use std::io::{BufWriter, Write};

use byteorder::{LittleEndian, WriteBytesExt};
use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use crate::error::Result;
use crate::gate::BuildPermit;
use crate::library::{
    BuildOutput, BuildRequest, VectorIndexLibrary, prepare_vectors, write_vector_file,
};

pub const IVF_CENTROIDS_FILE: &str = "centroids.ivf";
pub const IVF_LISTS_FILE: &str = "lists.ivf";
pub const IVF_DATA_FILE: &str = "data.ivf";

const DEFAULT_ITERATIONS: usize = 10;

/// Builds IVF indexes.
#[derive(Debug, Default)]
pub struct IvfIndexLibrary;

impl IvfIndexLibrary {
    pub fn new() -> Self {
        IvfIndexLibrary
    }

    /// sqrt(rows) clusters unless configured, never more than rows.
    fn cluster_count(configured: Option<usize>, rows: usize) -> usize {
        if rows == 0 {
            return 0;
        }
        let wanted = configured.unwrap_or_else(|| (rows as f64).sqrt() as usize);
        wanted.clamp(1, rows)
    }
}

fn squared_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

fn nearest(centroids: &[f32], dimension: usize, row: &[f32]) -> usize {
    centroids
        .chunks_exact(dimension)
        .enumerate()
        .map(|(i, c)| (i, squared_distance(row, c)))
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map_or(0, |(i, _)| i)
}

struct KMeans<'a> {
    values: &'a [f32],
    dimension: usize,
    clusters: usize,
}

impl KMeans<'_> {
    fn rows(&self) -> usize {
        self.values.len() / self.dimension
    }

    fn row(&self, i: usize) -> &[f32] {
        &self.values[i * self.dimension..(i + 1) * self.dimension]
    }

    /// k-means++ seeding.
    fn init_centroids(&self, rng: &mut StdRng) -> Vec<f32> {
        let rows = self.rows();
        let mut centroids = Vec::with_capacity(self.clusters * self.dimension);
        centroids.extend_from_slice(self.row(rng.random_range(0..rows)));

        let mut distances: Vec<f32> = (0..rows)
            .map(|i| squared_distance(self.row(i), &centroids[..self.dimension]))
            .collect();

        while centroids.len() < self.clusters * self.dimension {
            let total: f32 = distances.iter().sum();
            let pick = if total <= 0.0 {
                rng.random_range(0..rows)
            } else {
                let target = rng.random::<f32>() * total;
                let mut cumsum = 0.0;
                distances
                    .iter()
                    .position(|d| {
                        cumsum += d;
                        cumsum >= target
                    })
                    .unwrap_or(rows - 1)
            };
            let start = centroids.len();
            centroids.extend_from_slice(self.row(pick));
            let newest = &centroids[start..start + self.dimension];
            for (i, d) in distances.iter_mut().enumerate() {
                *d = d.min(squared_distance(self.row(i), newest));
            }
        }
        centroids
    }

    fn assign(&self, centroids: &[f32]) -> Vec<usize> {
        (0..self.rows())
            .into_par_iter()
            .map(|i| nearest(centroids, self.dimension, self.row(i)))
            .collect()
    }

    fn update(&self, assignments: &[usize], centroids: &mut [f32]) {
        let mut sums = vec![0f32; self.clusters * self.dimension];
        let mut counts = vec![0usize; self.clusters];
        for (i, &cluster) in assignments.iter().enumerate() {
            counts[cluster] += 1;
            let sum = &mut sums[cluster * self.dimension..(cluster + 1) * self.dimension];
            for (s, v) in sum.iter_mut().zip(self.row(i)) {
                *s += v;
            }
        }
        for (cluster, &count) in counts.iter().enumerate() {
            // Empty clusters keep their previous centroid.
            if count == 0 {
                continue;
            }
            let range = cluster * self.dimension..(cluster + 1) * self.dimension;
            for (c, s) in centroids[range.clone()].iter_mut().zip(&sums[range]) {
                *c = s / count as f32;
            }
        }
    }
}

impl VectorIndexLibrary for IvfIndexLibrary {
    fn name(&self) -> &str {
        "ivf"
    }

    fn build(&self, request: &BuildRequest<'_>, permit: &BuildPermit) -> Result<BuildOutput> {
        let description = request.description;
        let dimension = description.dimension;
        let values = prepare_vectors(request, permit)?;
        let rows = values.len() / dimension;

        let configured = description
            .usize_param("nlist")
            .map_err(crate::error::PartIndexError::build)?;
        let iterations = description
            .usize_param("iterations")
            .map_err(crate::error::PartIndexError::build)?
            .unwrap_or(DEFAULT_ITERATIONS);
        let clusters = Self::cluster_count(configured, rows);

        let (centroids, assignments) = if clusters == 0 {
            (Vec::new(), Vec::new())
        } else {
            let kmeans = KMeans {
                values: &values,
                dimension,
                clusters,
            };
            let mut rng = StdRng::seed_from_u64(rows as u64);
            let mut centroids = kmeans.init_centroids(&mut rng);
            let mut assignments = kmeans.assign(&centroids);
            for iteration in 0..iterations {
                permit.check()?;
                kmeans.update(&assignments, &mut centroids);
                let next = kmeans.assign(&centroids);
                let converged = next == assignments;
                assignments = next;
                if converged {
                    debug!(
                        "k-means for {} converged after {} iterations",
                        request.part_name,
                        iteration + 1
                    );
                    break;
                }
            }
            (centroids, assignments)
        };

        permit.check()?;
        write_vector_file(
            &request.scratch_dir.join(IVF_CENTROIDS_FILE),
            dimension,
            &centroids,
        )?;

        let mut lists: Vec<Vec<u64>> = vec![Vec::new(); clusters];
        for (row, &cluster) in assignments.iter().enumerate() {
            lists[cluster].push(row as u64);
        }
        let mut writer = BufWriter::new(File::create(request.scratch_dir.join(IVF_LISTS_FILE))?);
        writer.write_u32::<LittleEndian>(clusters as u32)?;
        for list in &lists {
            writer.write_u64::<LittleEndian>(list.len() as u64)?;
            for row in list {
                writer.write_u64::<LittleEndian>(*row)?;
            }
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;

        permit.check()?;
        write_vector_file(&request.scratch_dir.join(IVF_DATA_FILE), dimension, &values)?;

        Ok(BuildOutput {
            files: vec![
                IVF_CENTROIDS_FILE.to_string(),
                IVF_LISTS_FILE.to_string(),
                IVF_DATA_FILE.to_string(),
            ],
            indexed_rows: rows,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::BuildGate;
    use crate::metadata::{VectorIndexDescription, VectorIndexKind};
    use crate::part::VectorColumn;
    use tempfile::TempDir;

    #[test]
    fn test_cluster_count() {
        assert_eq!(IvfIndexLibrary::cluster_count(None, 0), 0);
        assert_eq!(IvfIndexLibrary::cluster_count(None, 100), 10);
        assert_eq!(IvfIndexLibrary::cluster_count(Some(50), 4), 4);
        assert_eq!(IvfIndexLibrary::cluster_count(None, 2), 1);
    }

    #[test]
    fn test_two_obvious_clusters() {
        let mut rows = Vec::new();
        for i in 0..20 {
            let jitter = i as f32 * 0.001;
            rows.push(vec![1.0 + jitter, 0.0]);
            rows.push(vec![0.0, 1.0 + jitter]);
        }
        let vectors = VectorColumn::from_rows(2, &rows).unwrap();
        let description = VectorIndexDescription::new("v", "e", 2, VectorIndexKind::Ivf)
            .with_param("nlist", "2");
        let dir = TempDir::new().unwrap();
        let gate = BuildGate::new();
        let permit = gate.acquire_permit().unwrap();

        let output = IvfIndexLibrary::new()
            .build(
                &BuildRequest {
                    part_name: "all_1_1_0",
                    description: &description,
                    vectors: &vectors,
                    scratch_dir: dir.path(),
                },
                &permit,
            )
            .unwrap();
        assert_eq!(output.indexed_rows, 40);
        assert_eq!(output.files.len(), 3);

        let lists = std::fs::read(dir.path().join(IVF_LISTS_FILE)).unwrap();
        assert_eq!(&lists[0..4], &2u32.to_le_bytes());
        let first_len = u64::from_le_bytes(lists[4..12].try_into().unwrap());
        assert_eq!(first_len, 20);
    }

    #[test]
    fn test_empty_part() {
        let vectors = VectorColumn::new(3);
        let description = VectorIndexDescription::new("v", "e", 3, VectorIndexKind::Ivf);
        let dir = TempDir::new().unwrap();
        let gate = BuildGate::new();
        let permit = gate.acquire_permit().unwrap();

        let output = IvfIndexLibrary::new()
            .build(
                &BuildRequest {
                    part_name: "all_1_1_0",
                    description: &description,
                    vectors: &vectors,
                    scratch_dir: dir.path(),
                },
                &permit,
            )
            .unwrap();
        assert_eq!(output.indexed_rows, 0);
    }
}
