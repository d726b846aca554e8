//! Key/value caches in BLOOM's layout.
//!
//! Keys are stored transposed as `[batch * heads, head_dim, kv_len]` and values
//! as `[batch * heads, kv_len, head_dim]`, so both concatenate along their
//! sequence axis (2 for keys, 1 for values).

pub mod api;
pub mod concat;
pub mod format;
pub mod layout;
pub mod preallocated;

use candle_core::Tensor;

use crate::core::AttentionError;

pub use api::KeyValueCache;
pub use concat::ConcatCache;
pub use format::{from_standard_layout, to_standard_layout};
pub use layout::CacheLayout;
pub use preallocated::PreallocatedCache;

pub(crate) const KEY_SEQ_DIM: usize = 2;
pub(crate) const VALUE_SEQ_DIM: usize = 1;

/// Cache for a single decoder layer.
#[derive(Debug)]
pub enum LayerCache {
    Concat(ConcatCache),
    Preallocated(PreallocatedCache),
}

impl KeyValueCache for LayerCache {
    fn append(&mut self, key: &Tensor, value: &Tensor) -> Result<(Tensor, Tensor), AttentionError> {
        match self {
            LayerCache::Concat(cache) => cache.append(key, value),
            LayerCache::Preallocated(cache) => cache.append(key, value),
        }
    }

    fn write_at(
        &mut self,
        position: usize,
        key: &Tensor,
        value: &Tensor,
    ) -> Result<(Tensor, Tensor), AttentionError> {
        match self {
            LayerCache::Concat(cache) => cache.write_at(position, key, value),
            LayerCache::Preallocated(cache) => cache.write_at(position, key, value),
        }
    }

    fn view(&self) -> Result<Option<(Tensor, Tensor)>, AttentionError> {
        match self {
            LayerCache::Concat(cache) => cache.view(),
            LayerCache::Preallocated(cache) => cache.view(),
        }
    }

    fn seq_len(&self) -> usize {
        match self {
            LayerCache::Concat(cache) => cache.seq_len(),
            LayerCache::Preallocated(cache) => cache.seq_len(),
        }
    }

    fn capacity(&self) -> Option<usize> {
        match self {
            LayerCache::Concat(cache) => cache.capacity(),
            LayerCache::Preallocated(cache) => cache.capacity(),
        }
    }

    fn reset(&mut self) {
        match self {
            LayerCache::Concat(cache) => cache.reset(),
            LayerCache::Preallocated(cache) => cache.reset(),
        }
    }
}

/// One [`LayerCache`] per decoder layer.
#[derive(Debug)]
pub struct BloomCache {
    layers: Vec<LayerCache>,
}

impl BloomCache {
    /// Growing caches, the default decoding path.
    pub fn concat(n_layer: usize) -> Self {
        Self {
            layers: (0..n_layer)
                .map(|_| LayerCache::Concat(ConcatCache::new()))
                .collect(),
        }
    }

    /// Fixed-size caches updated in place.
    pub fn preallocated(n_layer: usize, layout: &CacheLayout) -> Result<Self, AttentionError> {
        let layers = (0..n_layer)
            .map(|_| PreallocatedCache::new(layout.clone()).map(LayerCache::Preallocated))
            .collect::<Result<Vec<_>, _>>()?;
        log::info!(
            "kv-cache init: layers={} batch={} heads={} head_dim={} max_seq_len={} dtype={:?}",
            n_layer,
            layout.batch,
            layout.num_heads,
            layout.head_dim,
            layout.max_seq_len,
            layout.dtype
        );
        Ok(Self { layers })
    }

    /// Builds concatenation caches from `[batch, heads, seq, head_dim]` pairs.
    pub fn from_standard(pairs: &[(Tensor, Tensor)]) -> Result<Self, AttentionError> {
        let layers = pairs
            .iter()
            .map(|(key, value)| {
                let (key, value) = from_standard_layout(key, value)?;
                Ok(LayerCache::Concat(ConcatCache::from_tensors(key, value)?))
            })
            .collect::<Result<Vec<_>, AttentionError>>()?;
        Ok(Self { layers })
    }

    /// Filled prefixes of every layer in `[batch, heads, seq, head_dim]`.
    pub fn to_standard(&self, num_heads: usize) -> Result<Vec<(Tensor, Tensor)>, AttentionError> {
        let mut pairs = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            if let Some((key, value)) = layer.view()? {
                pairs.push(to_standard_layout(&key, &value, num_heads)?);
            }
        }
        Ok(pairs)
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn layer_mut(&mut self, index: usize) -> Option<&mut LayerCache> {
        self.layers.get_mut(index)
    }

    pub fn layers_mut(&mut self) -> impl Iterator<Item = &mut LayerCache> {
        self.layers.iter_mut()
    }

    /// Tokens already cached (taken from the first layer).
    pub fn past_len(&self) -> usize {
        self.layers.first().map(KeyValueCache::seq_len).unwrap_or(0)
    }

    /// Fixed capacity for preallocated caches, `None` for growing ones.
    pub fn capacity(&self) -> Option<usize> {
        self.layers.first().and_then(KeyValueCache::capacity)
    }

    pub fn is_empty(&self) -> bool {
        self.past_len() == 0
    }

    pub fn reset(&mut self) {
        self.layers.iter_mut().for_each(KeyValueCache::reset);
    }
}
