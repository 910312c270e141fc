//! Content-addressed embedding cache keyed on `(evidence fingerprint, model
//! id)`. Lives in memory during a run; the blob encoding below lets callers
//! persist entries through the opaque store and pre-load them on startup.

use std::collections::HashMap;

/// Store key for one cached vector: `hex(fingerprint) + ":" + hex(model_id)`.
pub fn blob_key(fingerprint: u64, model_id: &str) -> String {
    let mut key = format!("{fingerprint:016x}:");
    for byte in model_id.as_bytes() {
        key.push_str(&format!("{byte:02x}"));
    }
    key
}

/// Inverse of [`blob_key`]. `None` for keys that don't follow the layout.
pub fn parse_blob_key(key: &str) -> Option<(u64, String)> {
    let (fp_hex, model_hex) = key.split_once(':')?;
    let fingerprint = u64::from_str_radix(fp_hex, 16).ok()?;
    if model_hex.len() % 2 != 0 {
        return None;
    }
    let bytes: Option<Vec<u8>> = (0..model_hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&model_hex[i..i + 2], 16).ok())
        .collect();
    let model_id = String::from_utf8(bytes?).ok()?;
    Some((fingerprint, model_id))
}

/// Little-endian f32 blob encoding for a cached vector.
pub fn encode_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|x| x.to_le_bytes()).collect()
}

pub fn decode_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[derive(Debug, Default)]
pub struct EmbeddingCache {
    entries: HashMap<(u64, String), Vec<f32>>,
    hits: u64,
    misses: u64,
}

impl EmbeddingCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, fingerprint: u64, model_id: &str) -> bool {
        self.entries.contains_key(&(fingerprint, model_id.to_string()))
    }

    pub fn insert(&mut self, fingerprint: u64, model_id: String, vector: Vec<f32>) {
        self.entries.insert((fingerprint, model_id), vector);
    }

    pub fn get(&self, fingerprint: u64, model_id: &str) -> Option<&Vec<f32>> {
        let key = (fingerprint, model_id.to_string());
        match self.entries.get(&key) {
            Some(v) => Some(v),
            None => None,
        }
    }

    /// Fraction of lookups served from cache this process's lifetime.
    /// Used by the cost projector as a default moving average when no
    /// history exists yet.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    pub fn record_lookup(&mut self, hit: bool) {
        if hit {
            self.hits += 1;
        } else {
            self.misses += 1;
        }
    }

    /// Every cached entry, for persistence through the opaque store.
    pub fn entries(&self) -> impl Iterator<Item = (u64, &str, &[f32])> {
        self.entries
            .iter()
            .map(|((fingerprint, model_id), vector)| (*fingerprint, model_id.as_str(), vector.as_slice()))
    }
}
