//! KV memory manager for token-granular cache slots.
//!
//! Every layer keeps one key and one value tensor indexed by slot:
//! `[capacity, num_kv_heads, head_dim]`. The slot indices handed out by the
//! [`SlotAllocator`](super::slot_allocator::SlotAllocator) address the first
//! dimension directly.
//!
//! On a decode node the transfer worker writes KV rows computed by a prefill
//! node into this memory with [`KvMemory::receive_from_prefill_node`].

use candle_core::{DType, Device, Tensor};

use crate::core::slot_allocator::SlotIndex;
use crate::error::{Error, Result};

/// Shape of the KV memory.
#[derive(Debug, Clone)]
pub struct KvMemoryConfig {
    /// Number of token slots.
    pub capacity: usize,
    /// Number of KV heads held by this rank.
    pub num_kv_heads: usize,
    /// Dimension per head.
    pub head_dim: usize,
    /// Number of transformer layers.
    pub num_layers: usize,
    /// Data type for cache tensors.
    pub dtype: DType,
}

impl KvMemoryConfig {
    pub fn new(capacity: usize, num_kv_heads: usize, head_dim: usize, num_layers: usize) -> Self {
        Self {
            capacity,
            num_kv_heads,
            head_dim,
            num_layers,
            dtype: DType::F32,
        }
    }

    /// Set the data type.
    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    /// Memory size in bytes for one layer's K or V tensor.
    pub fn layer_size_bytes(&self) -> usize {
        self.capacity * self.num_kv_heads * self.head_dim * self.dtype.size_in_bytes()
    }

    /// Total memory size in bytes (all layers, K and V).
    pub fn total_size_bytes(&self) -> usize {
        self.layer_size_bytes() * self.num_layers * 2
    }
}

/// KV rows for a set of slots, one `[n, num_kv_heads, head_dim]` tensor per layer.
#[derive(Debug, Clone)]
pub struct KvRows {
    pub keys: Vec<Tensor>,
    pub values: Vec<Tensor>,
}

impl KvRows {
    /// Number of token rows carried.
    pub fn num_rows(&self) -> usize {
        self.keys.first().map_or(0, |k| k.dims()[0])
    }
}

/// Per-layer KV storage addressed by slot index.
#[derive(Debug)]
pub struct KvMemory {
    keys: Vec<Tensor>,
    values: Vec<Tensor>,
    config: KvMemoryConfig,
    device: Device,
}

impl KvMemory {
    /// Allocate zeroed storage for every layer.
    pub fn new(config: KvMemoryConfig, device: Device) -> Result<Self> {
        let shape = (config.capacity, config.num_kv_heads, config.head_dim);
        let mut keys = Vec::with_capacity(config.num_layers);
        let mut values = Vec::with_capacity(config.num_layers);
        for _ in 0..config.num_layers {
            keys.push(Tensor::zeros(shape, config.dtype, &device)?);
            values.push(Tensor::zeros(shape, config.dtype, &device)?);
        }
        Ok(Self {
            keys,
            values,
            config,
            device,
        })
    }

    pub fn config(&self) -> &KvMemoryConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn num_layers(&self) -> usize {
        self.keys.len()
    }

    /// Key and value tensors of one layer.
    pub fn layer(&self, layer_idx: usize) -> Option<(&Tensor, &Tensor)> {
        Some((self.keys.get(layer_idx)?, self.values.get(layer_idx)?))
    }

    /// Gather the rows stored at `slots` from every layer.
    pub fn read_rows(&self, slots: &[SlotIndex]) -> Result<KvRows> {
        self.validate_slots(slots)?;
        let index = Tensor::new(slots, &self.device)?;
        let keys = self
            .keys
            .iter()
            .map(|k| k.index_select(&index, 0))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let values = self
            .values
            .iter()
            .map(|v| v.index_select(&index, 0))
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(KvRows { keys, values })
    }

    /// Write one layer's key/value rows at `slots`.
    ///
    /// `key` and `value` have shape `[slots.len(), num_kv_heads, head_dim]`.
    pub fn write_layer(
        &mut self,
        layer_idx: usize,
        slots: &[SlotIndex],
        key: &Tensor,
        value: &Tensor,
    ) -> Result<()> {
        self.validate_slots(slots)?;
        if layer_idx >= self.num_layers() {
            return Err(Error::Config(format!(
                "layer {} out of bounds (max {})",
                layer_idx,
                self.num_layers()
            )));
        }
        self.keys[layer_idx] = scatter_rows(&self.keys[layer_idx], slots, key)?;
        self.values[layer_idx] = scatter_rows(&self.values[layer_idx], slots, value)?;
        Ok(())
    }

    /// Write rows for every layer at `slots`.
    pub fn write_rows(&mut self, slots: &[SlotIndex], rows: &KvRows) -> Result<()> {
        if rows.keys.len() != self.num_layers() || rows.values.len() != self.num_layers() {
            return Err(Error::Config(format!(
                "expected rows for {} layers, got {}",
                self.num_layers(),
                rows.keys.len()
            )));
        }
        for layer_idx in 0..self.num_layers() {
            self.write_layer(layer_idx, slots, &rows.keys[layer_idx], &rows.values[layer_idx])?;
        }
        Ok(())
    }

    /// Store KV rows produced on a prefill node at the decode-side slots.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transfer`] if the payload does not carry exactly one
    /// row per destination slot.
    pub fn receive_from_prefill_node(
        &mut self,
        decode_token_indexes: &[SlotIndex],
        rows: &KvRows,
    ) -> Result<()> {
        if rows.num_rows() != decode_token_indexes.len() {
            return Err(Error::Transfer(format!(
                "payload has {} rows for {} destination slots",
                rows.num_rows(),
                decode_token_indexes.len()
            )));
        }
        self.write_rows(decode_token_indexes, rows)
    }

    fn validate_slots(&self, slots: &[SlotIndex]) -> Result<()> {
        match slots.iter().find(|&&s| s as usize >= self.config.capacity) {
            Some(&slot) => Err(Error::SlotOutOfRange {
                slot,
                capacity: self.config.capacity,
            }),
            None => Ok(()),
        }
    }
}

/// Scatter `rows` into `cache` along dim 0, one contiguous run at a time.
fn scatter_rows(cache: &Tensor, slots: &[SlotIndex], rows: &Tensor) -> Result<Tensor> {
    if rows.dims()[0] != slots.len() {
        return Err(Error::Config(format!(
            "{} rows for {} slots",
            rows.dims()[0],
            slots.len()
        )));
    }
    let mut cache = cache.clone();
    let mut start = 0;
    while start < slots.len() {
        let mut end = start + 1;
        while end < slots.len() && slots[end] == slots[end - 1] + 1 {
            end += 1;
        }
        let run = rows.narrow(0, start, end - start)?;
        cache = cache.slice_scatter0(&run, slots[start] as usize)?;
        start = end;
    }
    Ok(cache)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> KvMemoryConfig {
        KvMemoryConfig::new(16, 2, 4, 2)
    }

    fn filled_rows(n: usize, base: f32) -> KvRows {
        let data: Vec<f32> = (0..n * 8).map(|i| base + i as f32).collect();
        let t = Tensor::from_vec(data, (n, 2, 4), &Device::Cpu).unwrap();
        KvRows {
            keys: vec![t.clone(), (&t + 100.0).unwrap()],
            values: vec![(&t * 2.0).unwrap(), (&t * 3.0).unwrap()],
        }
    }

    #[test]
    fn test_memory_config_sizes() {
        let config = test_config();
        // 16 * 2 * 4 * 4 bytes
        assert_eq!(config.layer_size_bytes(), 512);
        assert_eq!(config.total_size_bytes(), 2048);
    }

    #[test]
    fn test_memory_creation() {
        let mem = KvMemory::new(test_config(), Device::Cpu).unwrap();
        assert_eq!(mem.num_layers(), 2);
        let (k, v) = mem.layer(0).unwrap();
        assert_eq!(k.dims(), &[16, 2, 4]);
        assert_eq!(v.dims(), &[16, 2, 4]);
        assert!(mem.layer(2).is_none());
    }

    #[test]
    fn test_write_then_read_scattered_slots() {
        let mut mem = KvMemory::new(test_config(), Device::Cpu).unwrap();
        let rows = filled_rows(3, 1.0);
        mem.write_rows(&[7, 2, 3], &rows).unwrap();

        let back = mem.read_rows(&[7, 2, 3]).unwrap();
        for layer in 0..2 {
            assert_eq!(
                back.keys[layer].to_vec3::<f32>().unwrap(),
                rows.keys[layer].to_vec3::<f32>().unwrap()
            );
            assert_eq!(
                back.values[layer].to_vec3::<f32>().unwrap(),
                rows.values[layer].to_vec3::<f32>().unwrap()
            );
        }

        // Untouched slot stays zero.
        let zero = mem.read_rows(&[0]).unwrap();
        assert!(zero.keys[0]
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap()
            .iter()
            .all(|&x| x == 0.0));
    }

    #[test]
    fn test_receive_rejects_row_mismatch() {
        let mut mem = KvMemory::new(test_config(), Device::Cpu).unwrap();
        let rows = filled_rows(2, 0.0);
        assert!(matches!(
            mem.receive_from_prefill_node(&[1, 2, 3], &rows),
            Err(Error::Transfer(_))
        ));
    }

    #[test]
    fn test_out_of_range_slot() {
        let mem = KvMemory::new(test_config(), Device::Cpu).unwrap();
        assert!(matches!(
            mem.read_rows(&[16]),
            Err(Error::SlotOutOfRange { slot: 16, .. })
        ));
    }
}
