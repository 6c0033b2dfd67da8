use std::collections::HashMap;

/// Hash function used to place keys and virtual replicas on the ring.
pub type HashFn = fn(&[u8]) -> u32;

pub const DEFAULT_REPLICAS: usize = 50;

/// CRC-32 (IEEE). Rings built by other implementations of this key layout use
/// the same function, so mixed fleets agree on ownership.
pub fn crc32_ieee(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Consistent hash ring over node identifiers.
///
/// Each node occupies `replicas` positions at `hash(i.to_string() + node)`.
/// A key belongs to the node holding the first position at or after
/// `hash(key)`, wrapping around to the lowest position. Rings are built once
/// per membership snapshot and never shrink.
#[derive(Debug, Clone)]
pub struct HashRing {
    hash: HashFn,
    replicas: usize,
    positions: Vec<u32>,
    owners: HashMap<u32, String>,
}

impl Default for HashRing {
    fn default() -> Self {
        Self::new(DEFAULT_REPLICAS, crc32_ieee)
    }
}

impl HashRing {
    pub fn new(replicas: usize, hash: HashFn) -> Self {
        Self {
            hash,
            replicas: replicas.max(1),
            positions: Vec::new(),
            owners: HashMap::new(),
        }
    }

    /// Build a ring holding every node in `nodes`.
    pub fn with_nodes<S: AsRef<str>>(replicas: usize, hash: HashFn, nodes: &[S]) -> Self {
        let mut ring = Self::new(replicas, hash);
        for node in nodes {
            ring.add(node.as_ref());
        }
        ring
    }

    pub fn add(&mut self, node: &str) {
        for i in 0..self.replicas {
            let position = (self.hash)(format!("{i}{node}").as_bytes());
            match self.owners.get(&position) {
                // Collisions keep the smaller id so insertion order never matters
                Some(existing) if existing.as_str() <= node => {}
                Some(_) => {
                    self.owners.insert(position, node.to_string());
                }
                None => {
                    self.owners.insert(position, node.to_string());
                    self.positions.push(position);
                }
            }
        }
        self.positions.sort_unstable();
    }

    /// Owner of `key`, or `None` for an empty ring.
    pub fn get(&self, key: &str) -> Option<&str> {
        if self.positions.is_empty() {
            return None;
        }
        let hash = (self.hash)(key.as_bytes());
        let idx = self.positions.partition_point(|&p| p < hash);
        let position = self.positions[idx % self.positions.len()];
        self.owners.get(&position).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn replicas(&self) -> usize {
        self.replicas
    }
}
