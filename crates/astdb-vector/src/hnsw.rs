//! In-memory multi-layer HNSW graph keyed by dense labels.
//!
//! The index knows nothing about node ids; the façade owns that mapping.
//! Deletes are tombstones: the slot stays in the graph for routing but is
//! never returned from a search, and labels are never reused. Persistence
//! is a fixed 64-byte header (`ASTX` magic) followed by a bincode-encoded
//! graph payload; loading a different format version fails instead of
//! guessing.

use astdb_core::{AstDbError, Label, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::io::Write;
use std::path::Path;
use tracing::{debug, info};

pub const INDEX_MAGIC: [u8; 4] = *b"ASTX";
pub const INDEX_FORMAT_VERSION: u32 = 2;
const HEADER_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Space {
    Cosine,
    L2,
    Ip,
}

impl Space {
    pub fn as_u8(&self) -> u8 {
        match self {
            Space::Cosine => 0,
            Space::L2 => 1,
            Space::Ip => 2,
        }
    }

    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Space::Cosine),
            1 => Ok(Space::L2),
            2 => Ok(Space::Ip),
            other => Err(AstDbError::IndexFormatIncompatible(format!(
                "unknown space tag {}",
                other
            ))),
        }
    }

    /// Distance between two equal-length vectors. Cosine distance against a
    /// zero vector is defined as 1.0, which clamps to score 0 downstream.
    pub fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Space::Cosine => {
                let (mut dot, mut norm_a, mut norm_b) = (0.0f32, 0.0f32, 0.0f32);
                for (x, y) in a.iter().zip(b.iter()) {
                    dot += x * y;
                    norm_a += x * x;
                    norm_b += y * y;
                }
                if norm_a == 0.0 || norm_b == 0.0 {
                    return 1.0;
                }
                1.0 - dot / (norm_a.sqrt() * norm_b.sqrt())
            }
            Space::L2 => a
                .iter()
                .zip(b.iter())
                .map(|(x, y)| (x - y) * (x - y))
                .sum::<f32>()
                .sqrt(),
            Space::Ip => {
                let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
                1.0 - dot
            }
        }
    }
}

impl std::fmt::Display for Space {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Space::Cosine => "cosine",
            Space::L2 => "l2",
            Space::Ip => "ip",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for Space {
    type Err = AstDbError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cosine" => Ok(Space::Cosine),
            "l2" => Ok(Space::L2),
            "ip" => Ok(Space::Ip),
            other => Err(AstDbError::InvalidConfig(format!("unknown space {}", other))),
        }
    }
}

/// Candidate ordered by distance with label as the deterministic
/// tie-break.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Candidate {
    distance: f32,
    slot: u32,
}

impl Eq for Candidate {}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .partial_cmp(&other.distance)
            .unwrap_or(Ordering::Equal)
            .then_with(|| self.slot.cmp(&other.slot))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Max-heap over `Candidate` (furthest on top) for bounded result sets.
#[derive(Debug)]
struct FurthestQueue(BinaryHeap<Candidate>);

/// Min-heap behavior via `Reverse`.
#[derive(Debug)]
struct NearestQueue(BinaryHeap<std::cmp::Reverse<Candidate>>);

impl FurthestQueue {
    fn new() -> Self {
        Self(BinaryHeap::new())
    }
    fn push(&mut self, c: Candidate) {
        self.0.push(c)
    }
    fn pop(&mut self) -> Option<Candidate> {
        self.0.pop()
    }
    fn peek(&self) -> Option<&Candidate> {
        self.0.peek()
    }
    fn len(&self) -> usize {
        self.0.len()
    }
    fn into_sorted(self) -> Vec<Candidate> {
        self.0.into_sorted_vec()
    }
}

impl NearestQueue {
    fn new() -> Self {
        Self(BinaryHeap::new())
    }
    fn push(&mut self, c: Candidate) {
        self.0.push(std::cmp::Reverse(c))
    }
    fn pop(&mut self) -> Option<Candidate> {
        self.0.pop().map(|r| r.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GraphNode {
    label: Label,
    level: usize,
    deleted: bool,
    /// Neighbor slots per layer, `links[0]` is the base layer.
    links: Vec<Vec<u32>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GraphPayload {
    vectors: Vec<Vec<f32>>,
    nodes: Vec<GraphNode>,
    entry_point: Option<u32>,
    max_level: usize,
    ef_default: usize,
    max_elements: usize,
    seed: u64,
}

pub struct HnswIndex {
    dimensions: usize,
    space: Space,
    m: usize,
    m0: usize,
    ef_construction: usize,
    ef_default: usize,
    max_elements: usize,
    level_mult: f64,
    rng: StdRng,
    seed: u64,

    vectors: Vec<Vec<f32>>,
    nodes: Vec<GraphNode>,
    slot_by_label: HashMap<Label, u32>,
    entry_point: Option<u32>,
    max_level: usize,
    live_count: usize,
    label_watermark: Label,
}

impl HnswIndex {
    pub fn new(
        dimensions: usize,
        space: Space,
        m: usize,
        ef_construction: usize,
        ef_default: usize,
        max_elements: usize,
        seed: u64,
    ) -> Result<Self> {
        if dimensions == 0 {
            return Err(AstDbError::InvalidDimension(
                "dimensions must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            dimensions,
            space,
            m,
            m0: m * 2,
            ef_construction,
            ef_default,
            max_elements,
            level_mult: 1.0 / (m as f64).ln(),
            rng: StdRng::seed_from_u64(seed),
            seed,
            vectors: Vec::new(),
            nodes: Vec::new(),
            slot_by_label: HashMap::new(),
            entry_point: None,
            max_level: 0,
            live_count: 0,
            label_watermark: 0,
        })
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn space(&self) -> Space {
        self.space
    }

    /// Live (non-tombstoned) vectors.
    pub fn count(&self) -> usize {
        self.live_count
    }

    pub fn capacity(&self) -> usize {
        self.max_elements
    }

    pub fn contains(&self, label: Label) -> bool {
        self.slot_by_label
            .get(&label)
            .is_some_and(|&slot| !self.nodes[slot as usize].deleted)
    }

    pub fn add(&mut self, label: Label, vector: Vec<f32>) -> Result<()> {
        if vector.len() != self.dimensions {
            return Err(AstDbError::DimensionMismatch {
                expected: self.dimensions,
                actual: vector.len(),
            });
        }
        if self.contains(label) {
            return Err(AstDbError::DuplicateId(format!("label {}", label)));
        }
        if self.live_count >= self.max_elements {
            return Err(AstDbError::IndexFull(format!(
                "capacity {} reached",
                self.max_elements
            )));
        }

        let level = self.sample_level();
        let slot = self.vectors.len() as u32;
        self.vectors.push(vector);
        self.nodes.push(GraphNode {
            label,
            level,
            deleted: false,
            links: vec![Vec::new(); level + 1],
        });
        self.slot_by_label.insert(label, slot);
        self.live_count += 1;
        if label >= self.label_watermark {
            self.label_watermark = label + 1;
        }

        let Some(mut current) = self.entry_point else {
            self.entry_point = Some(slot);
            self.max_level = level;
            return Ok(());
        };

        let query = self.vectors[slot as usize].clone();

        // Greedy descent through the layers above this node's level.
        if level < self.max_level {
            for layer in ((level + 1)..=self.max_level).rev() {
                current = self.greedy_closest(&query, current, layer);
            }
        }

        for layer in (0..=level.min(self.max_level)).rev() {
            let found = self.search_layer(&query, current, self.ef_construction, layer);
            let m_max = if layer == 0 { self.m0 } else { self.m };
            let neighbors = self.select_neighbors(found, m_max);

            for &neighbor in &neighbors {
                self.nodes[slot as usize].links[layer].push(neighbor);
                self.nodes[neighbor as usize].links[layer].push(slot);
                self.shrink_links(neighbor, layer);
            }
            if let Some(&closest) = neighbors.first() {
                current = closest;
            }
        }

        if level > self.max_level {
            self.max_level = level;
            self.entry_point = Some(slot);
        }
        Ok(())
    }

    /// Replace the vector for an existing label without changing the label.
    /// The old slot is tombstoned internally; the label re-enters the graph
    /// at a fresh slot.
    pub fn update(&mut self, label: Label, vector: Vec<f32>) -> Result<()> {
        let slot = *self
            .slot_by_label
            .get(&label)
            .ok_or_else(|| AstDbError::NotFound(format!("label {}", label)))?;
        if self.nodes[slot as usize].deleted {
            return Err(AstDbError::NotFound(format!("label {}", label)));
        }
        self.nodes[slot as usize].deleted = true;
        self.live_count -= 1;
        self.slot_by_label.remove(&label);
        self.add(label, vector)
    }

    /// Tombstone a label. Returns `false` when the label is absent or
    /// already deleted.
    pub fn mark_deleted(&mut self, label: Label) -> bool {
        match self.slot_by_label.get(&label) {
            Some(&slot) if !self.nodes[slot as usize].deleted => {
                self.nodes[slot as usize].deleted = true;
                self.live_count -= 1;
                true
            }
            _ => false,
        }
    }

    /// k nearest live labels, ascending distance, ties broken by ascending
    /// label.
    pub fn search(&self, query: &[f32], k: usize, ef: Option<usize>) -> Result<Vec<(Label, f32)>> {
        if query.len() != self.dimensions {
            return Err(AstDbError::DimensionMismatch {
                expected: self.dimensions,
                actual: query.len(),
            });
        }
        if k == 0 || self.live_count == 0 {
            return Ok(Vec::new());
        }
        let entry = match self.entry_point {
            Some(e) => e,
            None => return Ok(Vec::new()),
        };
        let ef = ef.unwrap_or(self.ef_default).max(k);

        let mut current = entry;
        for layer in (1..=self.max_level).rev() {
            current = self.greedy_closest(query, current, layer);
        }

        let found = self.search_layer(query, current, ef, 0);
        let mut results: Vec<(Label, f32)> = found
            .into_sorted()
            .into_iter()
            .filter(|c| !self.nodes[c.slot as usize].deleted)
            .map(|c| (self.nodes[c.slot as usize].label, c.distance))
            .collect();

        results.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        results.truncate(k);
        Ok(results)
    }

    fn sample_level(&mut self) -> usize {
        let uniform: f64 = self.rng.random::<f64>().max(f64::MIN_POSITIVE);
        ((-uniform.ln()) * self.level_mult).floor() as usize
    }

    fn distance_to(&self, query: &[f32], slot: u32) -> f32 {
        self.space.distance(query, &self.vectors[slot as usize])
    }

    fn greedy_closest(&self, query: &[f32], start: u32, layer: usize) -> u32 {
        let mut current = start;
        let mut current_dist = self.distance_to(query, current);
        loop {
            let mut improved = false;
            for &neighbor in self.layer_links(current, layer) {
                let d = self.distance_to(query, neighbor);
                if d < current_dist {
                    current = neighbor;
                    current_dist = d;
                    improved = true;
                }
            }
            if !improved {
                return current;
            }
        }
    }

    fn layer_links(&self, slot: u32, layer: usize) -> &[u32] {
        let node = &self.nodes[slot as usize];
        node.links.get(layer).map(|v| v.as_slice()).unwrap_or(&[])
    }

    fn search_layer(&self, query: &[f32], entry: u32, ef: usize, layer: usize) -> FurthestQueue {
        let mut visited: HashSet<u32> = HashSet::new();
        let mut candidates = NearestQueue::new();
        let mut results = FurthestQueue::new();

        let entry_dist = self.distance_to(query, entry);
        visited.insert(entry);
        candidates.push(Candidate {
            distance: entry_dist,
            slot: entry,
        });
        results.push(Candidate {
            distance: entry_dist,
            slot: entry,
        });

        while let Some(nearest) = candidates.pop() {
            let furthest = results.peek().map(|c| c.distance).unwrap_or(f32::MAX);
            if nearest.distance > furthest && results.len() >= ef {
                break;
            }
            for &neighbor in self.layer_links(nearest.slot, layer) {
                if !visited.insert(neighbor) {
                    continue;
                }
                let d = self.distance_to(query, neighbor);
                let furthest = results.peek().map(|c| c.distance).unwrap_or(f32::MAX);
                if results.len() < ef || d < furthest {
                    candidates.push(Candidate {
                        distance: d,
                        slot: neighbor,
                    });
                    results.push(Candidate {
                        distance: d,
                        slot: neighbor,
                    });
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }
        results
    }

    /// Closest-first truncation. Sorted ascending so callers can use the
    /// head as the new routing entry.
    fn select_neighbors(&self, found: FurthestQueue, m: usize) -> Vec<u32> {
        let mut sorted = found.into_sorted();
        sorted.truncate(m);
        sorted.into_iter().map(|c| c.slot).collect()
    }

    fn shrink_links(&mut self, slot: u32, layer: usize) {
        let m_max = if layer == 0 { self.m0 } else { self.m };
        if self.nodes[slot as usize].links[layer].len() <= m_max {
            return;
        }
        let base = self.vectors[slot as usize].clone();
        let mut scored: Vec<Candidate> = self.nodes[slot as usize].links[layer]
            .iter()
            .map(|&n| Candidate {
                distance: self.space.distance(&base, &self.vectors[n as usize]),
                slot: n,
            })
            .collect();
        scored.sort();
        scored.truncate(m_max);
        self.nodes[slot as usize].links[layer] = scored.into_iter().map(|c| c.slot).collect();
    }

    // ---- persistence ----

    pub fn label_watermark(&self) -> Label {
        self.label_watermark
    }

    /// Serialize to the versioned on-disk form without touching the
    /// filesystem, so callers can snapshot under a short lock and write the
    /// bytes out lock-free.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut header = [0u8; HEADER_LEN];
        header[0..4].copy_from_slice(&INDEX_MAGIC);
        header[4..8].copy_from_slice(&INDEX_FORMAT_VERSION.to_le_bytes());
        header[8..12].copy_from_slice(&(self.dimensions as u32).to_le_bytes());
        header[12] = self.space.as_u8();
        header[13..15].copy_from_slice(&(self.m as u16).to_le_bytes());
        header[15..17].copy_from_slice(&(self.ef_construction as u16).to_le_bytes());
        header[17..25].copy_from_slice(&(self.live_count as u64).to_le_bytes());
        header[25..33].copy_from_slice(&self.label_watermark.to_le_bytes());

        let payload = GraphPayload {
            vectors: self.vectors.clone(),
            nodes: self.nodes.clone(),
            entry_point: self.entry_point,
            max_level: self.max_level,
            ef_default: self.ef_default,
            max_elements: self.max_elements,
            seed: self.seed,
        };
        let encoded = bincode::serde::encode_to_vec(&payload, bincode::config::standard())
            .map_err(|e| AstDbError::Index(format!("encode graph: {}", e)))?;

        let mut out = Vec::with_capacity(HEADER_LEN + encoded.len());
        out.extend_from_slice(&header);
        out.extend_from_slice(&encoded);
        Ok(out)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let bytes = self.to_bytes()?;
        write_index_bytes(&bytes, path)?;
        info!(
            "saved index: {} live vectors, watermark {}, {} bytes",
            self.live_count,
            self.label_watermark,
            bytes.len()
        );
        Ok(())
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(AstDbError::IndexFormatIncompatible(
                "file shorter than header".to_string(),
            ));
        }
        let header = &bytes[..HEADER_LEN];

        if header[0..4] != INDEX_MAGIC {
            return Err(AstDbError::IndexFormatIncompatible(
                "bad magic, not an index file".to_string(),
            ));
        }
        let version = u32::from_le_bytes(header[4..8].try_into().unwrap());
        if version != INDEX_FORMAT_VERSION {
            return Err(AstDbError::IndexFormatIncompatible(format!(
                "format version {} (supported {})",
                version, INDEX_FORMAT_VERSION
            )));
        }
        let dimensions = u32::from_le_bytes(header[8..12].try_into().unwrap()) as usize;
        let space = Space::from_u8(header[12])?;
        let m = u16::from_le_bytes(header[13..15].try_into().unwrap()) as usize;
        let ef_construction = u16::from_le_bytes(header[15..17].try_into().unwrap()) as usize;
        let live_count = u64::from_le_bytes(header[17..25].try_into().unwrap()) as usize;
        let label_watermark = u64::from_le_bytes(header[25..33].try_into().unwrap());

        let (payload, _): (GraphPayload, usize) =
            bincode::serde::decode_from_slice(&bytes[HEADER_LEN..], bincode::config::standard())
                .map_err(|e| AstDbError::CorruptMetadata(format!("decode graph: {}", e)))?;

        let mut slot_by_label = HashMap::with_capacity(payload.nodes.len());
        for (slot, node) in payload.nodes.iter().enumerate() {
            if !node.deleted {
                slot_by_label.insert(node.label, slot as u32);
            }
        }

        debug!(
            "loaded index: {} live / {} total slots, dim {}",
            live_count,
            payload.nodes.len(),
            dimensions
        );
        Ok(Self {
            dimensions,
            space,
            m,
            m0: m * 2,
            ef_construction,
            ef_default: payload.ef_default,
            max_elements: payload.max_elements,
            level_mult: 1.0 / (m as f64).ln(),
            rng: StdRng::seed_from_u64(payload.seed),
            seed: payload.seed,
            vectors: payload.vectors,
            nodes: payload.nodes,
            slot_by_label,
            entry_point: payload.entry_point,
            max_level: payload.max_level,
            live_count,
            label_watermark,
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Self::from_bytes(&bytes)
    }
}

/// Write via a sibling temp file, then rename: a crashed save never leaves
/// a torn index behind.
pub fn write_index_bytes(bytes: &[u8], path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("bin.tmp");
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn index(dim: usize, space: Space) -> HnswIndex {
        HnswIndex::new(dim, space, 16, 100, 64, 1000, 42).unwrap()
    }

    fn unit(dim: usize, hot: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[hot] = 1.0;
        v
    }

    #[test]
    fn single_vector_exact_match() {
        let mut idx = index(4, Space::Cosine);
        idx.add(0, vec![0.0, 0.0, 0.0, 1.0]).unwrap();
        let results = idx.search(&[0.0, 0.0, 0.0, 1.0], 1, None).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, 0);
        assert_relative_eq!(results[0].1, 0.0, epsilon = 1e-6);
    }

    #[test]
    fn recall_on_small_set() {
        let mut idx = index(8, Space::L2);
        for i in 0..200u64 {
            let mut v = vec![0.0f32; 8];
            v[(i % 8) as usize] = 1.0;
            v[((i / 8) % 8) as usize] += 0.5;
            v[0] += (i as f32) * 0.001;
            idx.add(i, v).unwrap();
        }
        let query = {
            let mut v = vec![0.0f32; 8];
            v[3] = 1.0;
            v
        };
        let results = idx.search(&query, 10, Some(128)).unwrap();
        assert_eq!(results.len(), 10);
        // Ascending distance ordering.
        for pair in results.windows(2) {
            assert!(pair[0].1 <= pair[1].1);
        }
        // Brute-force closest must be found with a generous ef.
        let brute_best = (0..200u64)
            .map(|i| {
                let mut v = vec![0.0f32; 8];
                v[(i % 8) as usize] = 1.0;
                v[((i / 8) % 8) as usize] += 0.5;
                v[0] += (i as f32) * 0.001;
                (i, Space::L2.distance(&query, &v))
            })
            .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap())
            .unwrap();
        assert!(results.iter().any(|(label, _)| *label == brute_best.0));
    }

    #[test]
    fn tombstoned_labels_never_returned() {
        let mut idx = index(4, Space::Cosine);
        idx.add(1, unit(4, 0)).unwrap();
        idx.add(2, unit(4, 1)).unwrap();
        assert!(idx.mark_deleted(1));
        assert!(!idx.mark_deleted(1));
        assert_eq!(idx.count(), 1);

        let results = idx.search(&unit(4, 0), 2, None).unwrap();
        assert!(results.iter().all(|(label, _)| *label != 1));
    }

    #[test]
    fn equal_distances_tie_break_by_label() {
        let mut idx = index(2, Space::L2);
        // Three identical vectors: distance ties across all of them.
        idx.add(30, vec![1.0, 0.0]).unwrap();
        idx.add(10, vec![1.0, 0.0]).unwrap();
        idx.add(20, vec![1.0, 0.0]).unwrap();

        let results = idx.search(&[1.0, 0.0], 3, None).unwrap();
        let labels: Vec<Label> = results.iter().map(|(l, _)| *l).collect();
        assert_eq!(labels, vec![10, 20, 30]);
    }

    #[test]
    fn zero_query_vector_is_valid_for_cosine() {
        let mut idx = index(3, Space::Cosine);
        idx.add(0, vec![1.0, 0.0, 0.0]).unwrap();
        let results = idx.search(&[0.0, 0.0, 0.0], 1, None).unwrap();
        assert_eq!(results.len(), 1);
        assert_relative_eq!(results[0].1, 1.0, epsilon = 1e-6);
    }

    #[test]
    fn add_rejects_wrong_dimension_and_duplicates() {
        let mut idx = index(4, Space::Cosine);
        idx.add(0, unit(4, 0)).unwrap();
        assert!(matches!(
            idx.add(1, vec![1.0, 0.0]),
            Err(AstDbError::DimensionMismatch { expected: 4, actual: 2 })
        ));
        assert!(matches!(
            idx.add(0, unit(4, 1)),
            Err(AstDbError::DuplicateId(_))
        ));
    }

    #[test]
    fn capacity_overflow_reports_index_full() {
        let mut idx = HnswIndex::new(2, Space::L2, 4, 16, 16, 2, 7).unwrap();
        idx.add(0, vec![0.0, 1.0]).unwrap();
        idx.add(1, vec![1.0, 0.0]).unwrap();
        assert!(matches!(
            idx.add(2, vec![1.0, 1.0]),
            Err(AstDbError::IndexFull(_))
        ));
    }

    #[test]
    fn update_preserves_label_with_new_vector() {
        let mut idx = index(2, Space::L2);
        idx.add(5, vec![0.0, 1.0]).unwrap();
        idx.update(5, vec![1.0, 0.0]).unwrap();
        assert_eq!(idx.count(), 1);
        let results = idx.search(&[1.0, 0.0], 1, None).unwrap();
        assert_eq!(results[0].0, 5);
        assert_relative_eq!(results[0].1, 0.0, epsilon = 1e-6);
    }

    #[test]
    fn k_zero_returns_empty() {
        let mut idx = index(2, Space::L2);
        idx.add(0, vec![1.0, 0.0]).unwrap();
        assert!(idx.search(&[1.0, 0.0], 0, None).unwrap().is_empty());
    }

    #[test]
    fn dimension_one_works() {
        let mut idx = HnswIndex::new(1, Space::L2, 4, 16, 16, 10, 3).unwrap();
        idx.add(0, vec![0.5]).unwrap();
        idx.add(1, vec![2.0]).unwrap();
        let results = idx.search(&[0.4], 2, None).unwrap();
        assert_eq!(results[0].0, 0);
    }

    #[test]
    fn save_load_round_trip_preserves_search() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.bin");

        let mut idx = index(4, Space::Cosine);
        for i in 0..50u64 {
            let mut v = vec![0.1f32; 4];
            v[(i % 4) as usize] = 1.0 + i as f32 * 0.01;
            idx.add(i, v).unwrap();
        }
        idx.mark_deleted(7);
        let before = idx.search(&unit(4, 2), 5, None).unwrap();
        idx.save(&path).unwrap();

        let loaded = HnswIndex::load(&path).unwrap();
        assert_eq!(loaded.count(), 49);
        assert_eq!(loaded.label_watermark(), 50);
        let after = loaded.search(&unit(4, 2), 5, None).unwrap();
        assert_eq!(before.len(), after.len());
        for (b, a) in before.iter().zip(after.iter()) {
            assert_eq!(b.0, a.0);
            assert_relative_eq!(b.1, a.1, epsilon = 1e-6);
        }
    }

    #[test]
    fn load_rejects_foreign_and_future_formats() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.bin");

        std::fs::write(&path, b"not an index at all, far too short").unwrap();
        assert!(matches!(
            HnswIndex::load(&path),
            Err(AstDbError::IndexFormatIncompatible(_))
        ));

        let mut header = [0u8; 64];
        header[0..4].copy_from_slice(b"ASTX");
        header[4..8].copy_from_slice(&999u32.to_le_bytes());
        std::fs::write(&path, header).unwrap();
        assert!(matches!(
            HnswIndex::load(&path),
            Err(AstDbError::IndexFormatIncompatible(_))
        ));
    }
}
