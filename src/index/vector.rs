//! Vector Index - HNSW-style layered proximity graph
//!
//! Approximate nearest-neighbor search over per-feed embedding vectors. A feed
//! may carry several vectors (one per content chunk); its similarity to a
//! query is the best cosine similarity over all (query, chunk) pairs.
//!
//! # Structure
//!
//! ```text
//! layer 2:  [a]
//! layer 1:  [a, d]
//! layer 0:  [a, b, c, d, e, ...]      every node lives here
//! ```
//!
//! Nodes are owned by a single `id → Node` map. Friend edges and layer
//! membership are stored as ids, never as references, so the graph has no
//! ownership cycles and serializes as flat tables.
//!
//! # Locking
//!
//! One RwLock guards the whole graph. `add` holds the write lock for its full
//! multi-level procedure; `search` and `encode_to` hold the read lock. Graph
//! mutation is single-writer.
//!
//! # File format
//!
//! ```text
//! magic: [u8; 16] = "feedlinevectors1"
//! version: u8
//! m: u32 | ml: f64 | ef_search: u32 | ef_construct: u32
//! node_count: u64
//! per node:
//!   id: u64 | chunk_count: u32 | dimension: u32
//!   per chunk: min: f32 | scale: f32 | codes: [i8; dimension]
//!   friend_layers: u32
//!   per layer: friend_count: u32, per friend: id: u64 | score: f32
//! layer_count: u32
//! per layer: level: u32 | member_count: u64 | ids: [u64; member_count]
//! ```

use crate::heap::TopK;
use crate::index::codec::{self, MAGIC_LEN};
use crate::index::quantize::{dequantize, quantize, Quantized};
use crate::index::{read_lock, write_lock};
use crate::storage::error::{StorageError, StorageResult};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};
use std::sync::RwLock;

const VECTOR_MAGIC: [u8; MAGIC_LEN] = *b"feedlinevectors1";
const VECTOR_VERSION: u8 = 1;

/// A friend-of-friend whose circle overlaps the evicted node's circle this
/// much or more adds no new connectivity and is skipped during repair.
const SIMILARITY_CIRCLE: f32 = 0.8;

const MAX_NODES: u64 = 1 << 32;
const MAX_CHUNKS: u64 = 1 << 16;
const MAX_DIMENSION: u64 = 1 << 16;
const MAX_LAYERS: u64 = 64;

/// Graph construction and search parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VectorIndexConfig {
    /// Max friends per node per layer; doubled at layer 0
    pub m: usize,
    /// Level generation probability
    pub ml: f64,
    /// Candidate-set size for queries
    pub ef_search: usize,
    /// Candidate-set size for insertion
    pub ef_construct: usize,
}

impl Default for VectorIndexConfig {
    fn default() -> Self {
        Self {
            m: 8,
            ml: 1.0 / 32f64.ln(),
            ef_search: 64,
            ef_construct: 128,
        }
    }
}

impl VectorIndexConfig {
    fn cap(&self, level: usize) -> usize {
        if level == 0 {
            self.m * 2
        } else {
            self.m
        }
    }
}

/// Cosine similarity of two equal-length vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> StorageResult<f32> {
    if a.len() != b.len() {
        return Err(StorageError::DimensionMismatch {
            expected: a.len(),
            actual: b.len(),
        });
    }
    Ok(cosine(a, b))
}

/// Best cosine similarity over all pairs drawn from `a` and `b`
pub fn max_similarity(a: &[Vec<f32>], b: &[Vec<f32>]) -> StorageResult<f32> {
    let mut best = f32::NEG_INFINITY;
    for x in a {
        for y in b {
            best = best.max(cosine_similarity(x, y)?);
        }
    }
    Ok(best)
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut na = 0.0f32;
    let mut nb = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

// Dimensions already validated by the caller.
fn best_cosine(a: &[Vec<f32>], b: &[Vec<f32>]) -> f32 {
    a.iter()
        .flat_map(|x| b.iter().map(move |y| cosine(x, y)))
        .fold(f32::NEG_INFINITY, f32::max)
}

fn admit_all(_: u64) -> bool {
    true
}

/// (score, id) pair ordered by score, ties broken by id
#[derive(Debug, Clone, Copy)]
struct Scored {
    score: f32,
    id: u64,
}

impl PartialEq for Scored {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Scored {}

impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scored {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.id.cmp(&self.id))
    }
}

/// Candidate set bounded by `ef`, kept sorted ascending so the best
/// candidate pops from the back and the weakest is evicted from the front.
struct Candidates {
    items: Vec<Scored>,
    ef: usize,
}

impl Candidates {
    fn new(ef: usize) -> Self {
        Self {
            items: Vec::with_capacity(ef.min(1024) + 1),
            ef: ef.max(1),
        }
    }

    fn push(&mut self, item: Scored) {
        if self.items.len() >= self.ef && self.items.first().map_or(false, |w| item <= *w) {
            return;
        }
        let pos = self.items.partition_point(|x| *x < item);
        self.items.insert(pos, item);
        if self.items.len() > self.ef {
            self.items.remove(0);
        }
    }

    fn pop_best(&mut self) -> Option<Scored> {
        self.items.pop()
    }

    fn best(&self) -> Option<&Scored> {
        self.items.last()
    }
}

#[derive(Debug, Clone)]
struct Node {
    vectors: Vec<Vec<f32>>,
    /// `friends[level]`: neighbor id → similarity
    friends: Vec<HashMap<u64, f32>>,
}

#[derive(Debug, Clone, Default)]
struct Layer {
    level: usize,
    members: Vec<u64>,
}

struct Graph {
    config: VectorIndexConfig,
    nodes: HashMap<u64, Node>,
    layers: Vec<Layer>,
    dimension: Option<usize>,
    rng: StdRng,
}

impl Graph {
    fn validate_dimension(&self, vectors: &[Vec<f32>]) -> StorageResult<usize> {
        let first = vectors
            .first()
            .ok_or_else(|| StorageError::InvalidFeed("no vectors given".into()))?;
        let dim = first.len();
        if dim == 0 {
            return Err(StorageError::InvalidFeed("vectors must be non-empty".into()));
        }

        let expected = self.dimension.unwrap_or(dim);
        for v in vectors {
            if v.len() != expected {
                return Err(StorageError::DimensionMismatch {
                    expected,
                    actual: v.len(),
                });
            }
        }
        Ok(expected)
    }

    fn score(&self, query: &[Vec<f32>], id: u64) -> f32 {
        self.nodes
            .get(&id)
            .map(|n| best_cosine(query, &n.vectors))
            .unwrap_or(f32::NEG_INFINITY)
    }

    /// Layer count follows ⌊log_{1/ml}(N)⌋ + 1 for N nodes on layer 0
    fn grow_layers(&mut self) {
        let n = self.layers.first().map_or(0, |l| l.members.len()).max(1) as f64;
        let target = (n.ln() / (1.0 / self.config.ml).ln()).floor() as usize + 1;
        while self.layers.len() < target {
            let level = self.layers.len();
            self.layers.push(Layer {
                level,
                members: Vec::new(),
            });
        }
    }

    /// Walk up from level 0, stopping at each level with probability 1 - ml
    fn random_level(&mut self) -> usize {
        let max_level = self.layers.len().saturating_sub(1);
        let stop = 1.0 - self.config.ml;
        for level in 0..max_level {
            if self.rng.gen::<f64>() < stop {
                return level;
            }
        }
        max_level
    }

    fn top_nonempty(&self) -> Option<usize> {
        self.layers.iter().rposition(|l| !l.members.is_empty())
    }

    /// Greedy beam search on one layer; results best-first.
    ///
    /// Every reached node steers the traversal, but only nodes passing
    /// `admit` enter the result set.
    fn search_layer(
        &self,
        level: usize,
        entry: u64,
        query: &[Vec<f32>],
        ef: usize,
        top_k: usize,
        threshold: f32,
        admit: &dyn Fn(u64) -> bool,
    ) -> Vec<Scored> {
        let mut visited = HashSet::from([entry]);
        let mut candidates = Candidates::new(ef);
        let mut results = TopK::new(top_k);

        candidates.push(Scored {
            score: self.score(query, entry),
            id: entry,
        });

        while let Some(current) = candidates.pop_best() {
            if current.score >= threshold && admit(current.id) {
                results.push(current);
            }

            let Some(friends) = self.nodes.get(&current.id).and_then(|n| n.friends.get(level))
            else {
                continue;
            };

            for &friend in friends.keys() {
                if visited.insert(friend) {
                    candidates.push(Scored {
                        score: self.score(query, friend),
                        id: friend,
                    });
                }
            }

            // Stop once no pending newly-seen node can beat the worst result
            if results.is_full() {
                let pending_better = match (candidates.best(), results.worst()) {
                    (Some(best), Some(worst)) => best > worst,
                    _ => false,
                };
                if !pending_better {
                    break;
                }
            }
        }

        results.into_sorted_desc()
    }

    fn add(&mut self, id: u64, vectors: Vec<Vec<f32>>) -> StorageResult<()> {
        if self.nodes.contains_key(&id) {
            return Ok(());
        }
        let dim = self.validate_dimension(&vectors)?;

        self.grow_layers();
        let node_level = self.random_level();
        let top = self.top_nonempty();

        // Entry point: a random member of the highest populated layer
        let mut entry = match top {
            Some(t) => {
                let pick = self.rng.gen_range(0..self.layers[t].members.len());
                Some(self.layers[t].members[pick])
            }
            None => None,
        };

        self.nodes.insert(
            id,
            Node {
                vectors: vectors.clone(),
                friends: vec![HashMap::new(); node_level + 1],
            },
        );
        self.dimension = Some(dim);

        for level in (0..self.layers.len()).rev() {
            let populated = top.map_or(false, |t| level <= t);
            let ep = match entry {
                Some(ep) if populated => ep,
                _ => {
                    if level <= node_level {
                        self.layers[level].members.push(id);
                    }
                    continue;
                }
            };

            if level > node_level {
                let found =
                    self.search_layer(level, ep, &vectors, 1, 1, f32::NEG_INFINITY, &admit_all);
                entry = found.first().map(|s| s.id).or(entry);
                continue;
            }

            let cap = self.config.cap(level);
            let ef = self.config.ef_construct.max(cap);
            let found =
                self.search_layer(level, ep, &vectors, ef, cap, f32::NEG_INFINITY, &admit_all);

            self.layers[level].members.push(id);
            for friend in &found {
                self.link(level, id, friend.id, friend.score);
            }
            entry = found.first().map(|s| s.id).or(entry);
        }

        Ok(())
    }

    fn set_edge(&mut self, level: usize, a: u64, b: u64, score: f32) {
        if let Some(layer) = self.nodes.get_mut(&a).and_then(|n| n.friends.get_mut(level)) {
            layer.insert(b, score);
        }
        if let Some(layer) = self.nodes.get_mut(&b).and_then(|n| n.friends.get_mut(level)) {
            layer.insert(a, score);
        }
    }

    fn remove_edge(&mut self, level: usize, a: u64, b: u64) {
        if let Some(layer) = self.nodes.get_mut(&a).and_then(|n| n.friends.get_mut(level)) {
            layer.remove(&b);
        }
        if let Some(layer) = self.nodes.get_mut(&b).and_then(|n| n.friends.get_mut(level)) {
            layer.remove(&a);
        }
    }

    fn degree(&self, level: usize, id: u64) -> usize {
        self.nodes
            .get(&id)
            .and_then(|n| n.friends.get(level))
            .map_or(0, |f| f.len())
    }

    /// Add a bidirectional edge, then enforce the cap on both ends
    fn link(&mut self, level: usize, a: u64, b: u64, score: f32) {
        if a == b {
            return;
        }
        self.set_edge(level, a, b, score);
        self.enforce_cap(level, a);
        self.enforce_cap(level, b);
    }

    fn enforce_cap(&mut self, level: usize, hub: u64) {
        let cap = self.config.cap(level);
        while self.degree(level, hub) > cap {
            let weakest = self
                .nodes
                .get(&hub)
                .and_then(|n| n.friends.get(level))
                .and_then(|f| {
                    f.iter()
                        .map(|(&id, &score)| Scored { score, id })
                        .min()
                });
            let Some(weakest) = weakest else {
                return;
            };

            self.remove_edge(level, hub, weakest.id);
            self.repair(level, hub, weakest.id);
        }
    }

    /// Try to give an evicted node a replacement edge to one of the hub's
    /// other friends, preferring friends that widen its circle.
    fn repair(&mut self, level: usize, hub: u64, evicted: u64) {
        let cap = self.config.cap(level);
        if self.degree(level, evicted) >= cap {
            return;
        }
        let circle: HashSet<u64> = match self.nodes.get(&evicted).and_then(|n| n.friends.get(level)) {
            Some(f) => f.keys().copied().collect(),
            None => return,
        };

        let mut sample: Vec<Scored> = match self.nodes.get(&hub).and_then(|n| n.friends.get(level)) {
            Some(f) => f.iter().map(|(&id, &score)| Scored { score, id }).collect(),
            None => return,
        };
        sample.sort_unstable_by(|a, b| b.cmp(a));
        sample.truncate(cap / 4 + 1);

        for candidate in sample {
            if candidate.id == evicted || circle.contains(&candidate.id) {
                continue;
            }
            let Some(friends) = self
                .nodes
                .get(&candidate.id)
                .and_then(|n| n.friends.get(level))
            else {
                continue;
            };
            if friends.len() >= cap {
                continue;
            }

            let shared = friends.keys().filter(|id| circle.contains(id)).count();
            let overlap = shared as f32 / circle.len().max(1) as f32;
            if overlap >= SIMILARITY_CIRCLE {
                continue;
            }

            let score = match (self.nodes.get(&evicted), self.nodes.get(&candidate.id)) {
                (Some(e), Some(c)) => best_cosine(&e.vectors, &c.vectors),
                _ => continue,
            };
            self.set_edge(level, evicted, candidate.id, score);
            return;
        }
    }

    fn search(
        &self,
        query: &[Vec<f32>],
        threshold: f32,
        limit: usize,
        admit: &dyn Fn(u64) -> bool,
    ) -> StorageResult<HashMap<u64, f32>> {
        if self.dimension.is_some() {
            self.validate_dimension(query)?;
        }
        let Some(top) = self.top_nonempty() else {
            return Ok(HashMap::new());
        };
        if limit == 0 {
            return Ok(HashMap::new());
        }

        let mut entry = self.layers[top].members[0];
        for level in (1..=top).rev() {
            let found =
                self.search_layer(level, entry, query, 1, 1, f32::NEG_INFINITY, &admit_all);
            if let Some(best) = found.first() {
                entry = best.id;
            }
        }

        let ef = self.config.ef_search.max(limit);
        Ok(self
            .search_layer(0, entry, query, ef, limit, threshold, admit)
            .into_iter()
            .map(|s| (s.id, s.score))
            .collect())
    }
}

/// Thread-safe approximate nearest-neighbor index
pub struct VectorIndex {
    graph: RwLock<Graph>,
}

impl VectorIndex {
    pub fn new(config: VectorIndexConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    /// Deterministic level generation, for reproducible graphs
    pub fn with_seed(config: VectorIndexConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: VectorIndexConfig, rng: StdRng) -> Self {
        Self {
            graph: RwLock::new(Graph {
                config,
                nodes: HashMap::new(),
                layers: Vec::new(),
                dimension: None,
                rng,
            }),
        }
    }

    pub fn config(&self) -> VectorIndexConfig {
        read_lock(&self.graph).config
    }

    /// Insert a feed's vectors. A duplicate id is a no-op; a dimension
    /// mismatch is an error and leaves the graph untouched.
    pub fn add(&self, id: u64, vectors: Vec<Vec<f32>>) -> StorageResult<()> {
        write_lock(&self.graph).add(id, vectors)
    }

    /// Best-scoring feeds with score >= `threshold`, at most `limit` of them
    pub fn search(
        &self,
        query: &[Vec<f32>],
        threshold: f32,
        limit: usize,
    ) -> StorageResult<HashMap<u64, f32>> {
        read_lock(&self.graph).search(query, threshold, limit, &admit_all)
    }

    /// Like `search`, but only ids passing `admit` are returned. Rejected
    /// nodes are still traversed, so they never crowd out admitted ones.
    pub fn search_filtered<F>(
        &self,
        query: &[Vec<f32>],
        threshold: f32,
        limit: usize,
        admit: F,
    ) -> StorageResult<HashMap<u64, f32>>
    where
        F: Fn(u64) -> bool,
    {
        read_lock(&self.graph).search(query, threshold, limit, &admit)
    }

    /// Check vectors against the established dimension without inserting
    pub fn check_dimension(&self, vectors: &[Vec<f32>]) -> StorageResult<()> {
        read_lock(&self.graph).validate_dimension(vectors).map(|_| ())
    }

    pub fn dimension(&self) -> Option<usize> {
        read_lock(&self.graph).dimension
    }

    pub fn contains(&self, id: u64) -> bool {
        read_lock(&self.graph).nodes.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        read_lock(&self.graph).nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Member count per layer, layer 0 first
    pub fn layer_sizes(&self) -> Vec<usize> {
        read_lock(&self.graph)
            .layers
            .iter()
            .map(|l| l.members.len())
            .collect()
    }

    /// Encode the graph under one read lock. Vectors are int8-quantized.
    pub fn encode_to<W: Write>(&self, w: &mut W) -> StorageResult<()> {
        let graph = read_lock(&self.graph);
        let config = graph.config;

        codec::write_header(w, &VECTOR_MAGIC, VECTOR_VERSION)?;
        codec::write_u32(w, config.m as u32)?;
        codec::write_f64(w, config.ml)?;
        codec::write_u32(w, config.ef_search as u32)?;
        codec::write_u32(w, config.ef_construct as u32)?;

        let mut ids: Vec<u64> = graph.nodes.keys().copied().collect();
        ids.sort_unstable();
        codec::write_u64(w, ids.len() as u64)?;

        for id in ids {
            let node = &graph.nodes[&id];
            let dim = node.vectors.first().map_or(0, |v| v.len());

            codec::write_u64(w, id)?;
            codec::write_u32(w, node.vectors.len() as u32)?;
            codec::write_u32(w, dim as u32)?;
            for vector in &node.vectors {
                let q = quantize(vector);
                codec::write_f32(w, q.min)?;
                codec::write_f32(w, q.scale)?;
                let bytes: Vec<u8> = q.codes.iter().map(|&c| c as u8).collect();
                w.write_all(&bytes)?;
            }

            codec::write_u32(w, node.friends.len() as u32)?;
            for friends in &node.friends {
                codec::write_u32(w, friends.len() as u32)?;
                let mut sorted: Vec<(&u64, &f32)> = friends.iter().collect();
                sorted.sort_unstable_by_key(|(id, _)| **id);
                for (friend, score) in sorted {
                    codec::write_u64(w, *friend)?;
                    codec::write_f32(w, *score)?;
                }
            }
        }

        codec::write_u32(w, graph.layers.len() as u32)?;
        for layer in &graph.layers {
            codec::write_u32(w, layer.level as u32)?;
            codec::write_u64(w, layer.members.len() as u64)?;
            for member in &layer.members {
                codec::write_u64(w, *member)?;
            }
        }
        Ok(())
    }

    /// Decode an encoded graph, replacing the current one.
    ///
    /// Graph parameters are taken from the file header. The input must be
    /// complete and internally consistent or nothing is replaced.
    pub fn decode_from<R: Read>(&self, r: &mut R) -> StorageResult<()> {
        let mut graph = write_lock(&self.graph);

        codec::read_header(r, &VECTOR_MAGIC, VECTOR_VERSION, "vector index")?;
        let config = VectorIndexConfig {
            m: codec::read_u32(r)? as usize,
            ml: codec::read_f64(r)?,
            ef_search: codec::read_u32(r)? as usize,
            ef_construct: codec::read_u32(r)? as usize,
        };
        if config.m == 0 || !(config.ml > 0.0 && config.ml < 1.0) {
            return Err(StorageError::Corruption(format!(
                "vector index: invalid parameters m={} ml={}",
                config.m, config.ml
            )));
        }

        let node_count = codec::checked_len(codec::read_u64(r)?, MAX_NODES, "vector nodes")?;
        let mut nodes = HashMap::with_capacity(node_count.min(1 << 20));
        let mut dimension = None;

        for _ in 0..node_count {
            let id = codec::read_u64(r)?;
            let chunks = codec::checked_len(codec::read_u32(r)? as u64, MAX_CHUNKS, "chunks")?;
            let dim = codec::checked_len(codec::read_u32(r)? as u64, MAX_DIMENSION, "dimension")?;

            if *dimension.get_or_insert(dim) != dim {
                return Err(StorageError::Corruption(format!(
                    "vector index: node {} has dimension {}",
                    id, dim
                )));
            }

            let mut vectors = Vec::with_capacity(chunks);
            for _ in 0..chunks {
                let min = codec::read_f32(r)?;
                let scale = codec::read_f32(r)?;
                let mut bytes = vec![0u8; dim];
                r.read_exact(&mut bytes)?;
                vectors.push(dequantize(&Quantized {
                    min,
                    scale,
                    codes: bytes.into_iter().map(|b| b as i8).collect(),
                }));
            }

            let friend_layers =
                codec::checked_len(codec::read_u32(r)? as u64, MAX_LAYERS, "friend layers")?;
            let mut friends = Vec::with_capacity(friend_layers);
            for _ in 0..friend_layers {
                let count =
                    codec::checked_len(codec::read_u32(r)? as u64, MAX_NODES, "friends")?;
                let mut layer = HashMap::with_capacity(count.min(1024));
                for _ in 0..count {
                    let friend = codec::read_u64(r)?;
                    let score = codec::read_f32(r)?;
                    layer.insert(friend, score);
                }
                friends.push(layer);
            }

            nodes.insert(id, Node { vectors, friends });
        }

        let layer_count = codec::checked_len(codec::read_u32(r)? as u64, MAX_LAYERS, "layers")?;
        let mut layers = Vec::with_capacity(layer_count);
        for expected_level in 0..layer_count {
            let level = codec::read_u32(r)? as usize;
            if level != expected_level {
                return Err(StorageError::Corruption(format!(
                    "vector index: layer {} found at position {}",
                    level, expected_level
                )));
            }
            let count = codec::checked_len(codec::read_u64(r)?, MAX_NODES, "members")?;
            let mut members = Vec::with_capacity(count.min(1 << 20));
            for _ in 0..count {
                members.push(codec::read_u64(r)?);
            }
            layers.push(Layer { level, members });
        }

        // Every id reference must resolve through the node table
        for (id, node) in &nodes {
            for friends in &node.friends {
                if let Some(missing) = friends.keys().find(|f| !nodes.contains_key(f)) {
                    return Err(StorageError::Corruption(format!(
                        "vector index: node {} references unknown friend {}",
                        id, missing
                    )));
                }
            }
        }
        for layer in &layers {
            if let Some(missing) = layer.members.iter().find(|m| !nodes.contains_key(m)) {
                return Err(StorageError::Corruption(format!(
                    "vector index: layer {} references unknown node {}",
                    layer.level, missing
                )));
            }
        }

        graph.config = config;
        graph.nodes = nodes;
        graph.layers = layers;
        graph.dimension = dimension;
        Ok(())
    }
}

impl std::fmt::Debug for VectorIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let graph = read_lock(&self.graph);
        f.debug_struct("VectorIndex")
            .field("nodes", &graph.nodes.len())
            .field("layers", &graph.layers.len())
            .field("dimension", &graph.dimension)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn scenario_index() -> VectorIndex {
        let index = VectorIndex::with_seed(VectorIndexConfig::default(), 7);
        index.add(1, vec![vec![1.0, 0.0, 0.0]]).unwrap();
        index.add(2, vec![vec![0.8, 1.0, 0.0]]).unwrap();
        index
            .add(3, vec![vec![0.8, 0.1, 0.1], vec![0.7, 0.1, 0.9]])
            .unwrap();
        index
    }

    fn random_vectors(rng: &mut StdRng, count: usize, dim: usize) -> Vec<Vec<f32>> {
        (0..count)
            .map(|_| (0..dim).map(|_| rng.gen_range(-1.0f32..1.0)).collect())
            .collect()
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]).unwrap() - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).unwrap().abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]).unwrap(), 0.0);
        assert!(cosine_similarity(&[1.0], &[1.0, 0.0]).is_err());
    }

    #[test]
    fn test_max_similarity_over_chunks() {
        let q = vec![vec![1.0, 0.0, 0.0]];
        let feed = vec![vec![0.0, 1.0, 0.0], vec![1.0, 0.0, 0.0]];
        assert!((max_similarity(&q, &feed).unwrap() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_search_scenario() {
        let index = scenario_index();
        let result = index.search(&[vec![1.0, 0.0, 0.0]], 0.9, 5).unwrap();

        assert_eq!(result.len(), 2);
        assert!((result[&1] - 1.0).abs() < 1e-6);
        assert!((result[&3] - 0.9847).abs() < 1e-3);
        assert!(!result.contains_key(&2));
    }

    #[test]
    fn test_empty_index_search() {
        let index = VectorIndex::new(VectorIndexConfig::default());
        let result = index.search(&[vec![1.0, 2.0]], 0.0, 10).unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn test_dimension_guard_add() {
        let index = scenario_index();
        let before = index.layer_sizes();

        let err = index.add(4, vec![vec![1.0, 0.0]]).unwrap_err();
        assert!(matches!(
            err,
            StorageError::DimensionMismatch {
                expected: 3,
                actual: 2
            }
        ));

        // Mixed dimensions inside one feed are rejected too
        assert!(index
            .add(5, vec![vec![1.0, 0.0, 0.0], vec![1.0, 0.0]])
            .is_err());

        assert!(!index.contains(4));
        assert!(!index.contains(5));
        assert_eq!(index.len(), 3);
        assert_eq!(index.layer_sizes(), before);
    }

    #[test]
    fn test_dimension_guard_search() {
        let index = scenario_index();
        let err = index.search(&[vec![1.0, 0.0]], 0.0, 5).unwrap_err();
        assert!(matches!(err, StorageError::DimensionMismatch { .. }));
    }

    #[test]
    fn test_duplicate_add_is_noop() {
        let index = scenario_index();
        let before = {
            let graph = read_lock(&index.graph);
            (graph.nodes[&1].vectors.clone(), graph.nodes[&1].friends.clone())
        };
        let sizes = index.layer_sizes();

        index.add(1, vec![vec![0.0, 0.0, 1.0]]).unwrap();

        let graph = read_lock(&index.graph);
        assert_eq!(graph.nodes[&1].vectors, before.0);
        assert_eq!(graph.nodes[&1].friends, before.1);
        drop(graph);
        assert_eq!(index.layer_sizes(), sizes);
    }

    #[test]
    fn test_search_contract() {
        let mut rng = StdRng::seed_from_u64(42);
        let index = VectorIndex::with_seed(VectorIndexConfig::default(), 1);
        for (i, v) in random_vectors(&mut rng, 300, 12).into_iter().enumerate() {
            index.add(i as u64 + 1, vec![v]).unwrap();
        }

        for q in random_vectors(&mut rng, 20, 12) {
            for (threshold, limit) in [(0.0, 5), (0.3, 10), (0.6, 50), (0.95, 3)] {
                let result = index.search(&[q.clone()], threshold, limit).unwrap();
                assert!(result.len() <= limit);
                assert!(result.values().all(|&s| s >= threshold));
            }
        }
    }

    #[test]
    fn test_finds_exact_match() {
        let mut rng = StdRng::seed_from_u64(3);
        let vectors = random_vectors(&mut rng, 200, 16);
        let index = VectorIndex::with_seed(VectorIndexConfig::default(), 3);
        for (i, v) in vectors.iter().enumerate() {
            index.add(i as u64 + 1, vec![v.clone()]).unwrap();
        }

        let mut hits = 0;
        for (i, v) in vectors.iter().enumerate().take(50) {
            let result = index.search(&[v.clone()], 0.0, 5).unwrap();
            if result.get(&(i as u64 + 1)).map_or(false, |s| *s > 0.999) {
                hits += 1;
            }
        }
        assert!(hits >= 45, "only {} of 50 exact matches found", hits);
    }

    #[test]
    fn test_layer_invariants() {
        let mut rng = StdRng::seed_from_u64(11);
        let index = VectorIndex::with_seed(VectorIndexConfig::default(), 11);
        for (i, v) in random_vectors(&mut rng, 500, 8).into_iter().enumerate() {
            index.add(i as u64 + 1, vec![v]).unwrap();
        }

        let graph = read_lock(&index.graph);
        assert_eq!(graph.layers[0].members.len(), 500);
        assert!(graph.layers.len() > 1);

        // Membership at level L implies membership at every level below
        for level in 1..graph.layers.len() {
            let below: HashSet<u64> = graph.layers[level - 1].members.iter().copied().collect();
            for id in &graph.layers[level].members {
                assert!(below.contains(id));
                assert!(graph.nodes[id].friends.len() > level);
            }
        }

        // Friendship is symmetric
        for (id, node) in &graph.nodes {
            for (level, friends) in node.friends.iter().enumerate() {
                for friend in friends.keys() {
                    assert!(graph.nodes[friend].friends[level].contains_key(id));
                }
            }
        }
    }

    #[test]
    fn test_degree_bounded_under_sustained_insertion() {
        let config = VectorIndexConfig {
            m: 4,
            ..VectorIndexConfig::default()
        };
        let mut rng = StdRng::seed_from_u64(99);
        let index = VectorIndex::with_seed(config, 99);

        // Clustered data tends to concentrate edges on a few hubs
        let centers = random_vectors(&mut rng, 4, 8);
        for i in 0..2000u64 {
            let center = &centers[i as usize % centers.len()];
            let v: Vec<f32> = center
                .iter()
                .map(|c| c + rng.gen_range(-0.05f32..0.05))
                .collect();
            index.add(i + 1, vec![v]).unwrap();
        }

        let graph = read_lock(&index.graph);
        for node in graph.nodes.values() {
            for (level, friends) in node.friends.iter().enumerate() {
                assert!(friends.len() <= config.cap(level));
            }
        }
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let index = scenario_index();
        let q = vec![vec![1.0, 0.0, 0.0]];
        let original = index.search(&q, 0.5, 5).unwrap();

        let mut buf = Vec::new();
        index.encode_to(&mut buf).unwrap();

        let restored = VectorIndex::new(VectorIndexConfig {
            m: 2,
            ..VectorIndexConfig::default()
        });
        restored.decode_from(&mut Cursor::new(&buf)).unwrap();

        assert_eq!(restored.config(), index.config());
        assert_eq!(restored.len(), 3);
        assert_eq!(restored.dimension(), Some(3));
        assert_eq!(restored.layer_sizes(), index.layer_sizes());

        let decoded = restored.search(&q, 0.5, 5).unwrap();
        assert_eq!(
            decoded.keys().collect::<HashSet<_>>(),
            original.keys().collect::<HashSet<_>>()
        );
        for (id, score) in &original {
            assert!((decoded[id] - score).abs() < 1e-3);
        }
    }

    #[test]
    fn test_decoded_index_accepts_inserts() {
        let index = scenario_index();
        let mut buf = Vec::new();
        index.encode_to(&mut buf).unwrap();

        let restored = VectorIndex::new(VectorIndexConfig::default());
        restored.decode_from(&mut Cursor::new(&buf)).unwrap();
        restored.add(4, vec![vec![0.0, 0.0, 1.0]]).unwrap();
        assert!(restored.add(5, vec![vec![1.0]]).is_err());

        let result = restored.search(&[vec![0.0, 0.0, 1.0]], 0.99, 1).unwrap();
        assert!(result.contains_key(&4));
    }

    fn normalized(mut v: Vec<f32>) -> Vec<f32> {
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        v.iter_mut().for_each(|x| *x /= norm);
        v
    }

    #[test]
    fn test_decoded_scores_track_originals_for_embeddings() {
        let mut rng = StdRng::seed_from_u64(11);
        let dim = 256;
        let index = VectorIndex::with_seed(VectorIndexConfig::default(), 5);
        let stored: Vec<Vec<f32>> = random_vectors(&mut rng, 300, dim)
            .into_iter()
            .map(normalized)
            .collect();
        for (id, v) in stored.iter().enumerate() {
            index.add(id as u64, vec![v.clone()]).unwrap();
        }

        let mut buf = Vec::new();
        index.encode_to(&mut buf).unwrap();
        let restored = VectorIndex::new(VectorIndexConfig::default());
        restored.decode_from(&mut Cursor::new(&buf)).unwrap();

        let mut deltas = Vec::new();
        let mut overlap = 0;
        let mut expected = 0;
        for source in stored.iter().step_by(15) {
            let q = vec![normalized(
                source
                    .iter()
                    .map(|x| x + rng.gen_range(-0.05f32..0.05))
                    .collect(),
            )];
            let before = index.search(&q, -1.0, 10).unwrap();
            let after = restored.search(&q, -1.0, 10).unwrap();
            expected += before.len();
            for (id, score) in &before {
                if let Some(decoded) = after.get(id) {
                    overlap += 1;
                    deltas.push((decoded - score).abs());
                }
            }
        }

        let mean = deltas.iter().sum::<f32>() / deltas.len() as f32;
        let worst = deltas.iter().cloned().fold(0.0f32, f32::max);
        assert!(mean < 1e-3, "mean score drift {}", mean);
        assert!(worst < 5e-3, "worst score drift {}", worst);
        assert!(overlap as f32 >= 0.8 * expected as f32);
    }

    #[test]
    fn test_search_filtered_only_returns_admitted() {
        let mut rng = StdRng::seed_from_u64(3);
        let index = VectorIndex::with_seed(VectorIndexConfig::default(), 3);
        for (id, v) in random_vectors(&mut rng, 200, 8).into_iter().enumerate() {
            index.add(id as u64, vec![v]).unwrap();
        }
        let q = random_vectors(&mut rng, 1, 8);

        let result = index
            .search_filtered(&q, -1.0, 10, |id| id % 2 == 0)
            .unwrap();
        assert_eq!(result.len(), 10);
        assert!(result.keys().all(|id| id % 2 == 0));

        // Admitting nothing yields nothing rather than unfiltered hits
        assert!(index.search_filtered(&q, -1.0, 10, |_| false).unwrap().is_empty());
    }

    #[test]
    fn test_decode_rejects_bad_header() {
        let index = scenario_index();
        let mut buf = Vec::new();
        index.encode_to(&mut buf).unwrap();

        let mut bad_magic = buf.clone();
        bad_magic[3] = b'X';
        let target = VectorIndex::new(VectorIndexConfig::default());
        assert!(matches!(
            target.decode_from(&mut Cursor::new(&bad_magic)),
            Err(StorageError::InvalidFormat(_))
        ));

        let mut bad_version = buf.clone();
        bad_version[MAGIC_LEN] = 9;
        assert!(matches!(
            target.decode_from(&mut Cursor::new(&bad_version)),
            Err(StorageError::InvalidFormat(_))
        ));
        assert!(target.is_empty());
    }

    #[test]
    fn test_decode_rejects_truncated() {
        let index = scenario_index();
        let mut buf = Vec::new();
        index.encode_to(&mut buf).unwrap();
        buf.truncate(buf.len() - 5);

        let target = VectorIndex::new(VectorIndexConfig::default());
        assert!(target.decode_from(&mut Cursor::new(&buf)).is_err());
        assert!(target.is_empty());
    }
}
