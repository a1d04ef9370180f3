//! Content-addressable program indexes
//!
//! In-memory lookup from guest code to translated variants. Compute programs
//! are keyed directly by their code bytes. Graphics programs go through two
//! levels: each stage's code maps to a small dense id, and the tuple of stage
//! ids maps to the list of specialization variants.

use crate::channel::{GpuChannelPoolState, GpuChannelState, GuestMemory};
use crate::hash::fnv1a_32;
use crate::types::{CachedShaderProgram, GRAPHICS_STAGE_SLOTS};
use std::collections::HashMap;
use std::sync::Arc;

/// Variants of one guest code combination.
///
/// Lists stay short in practice, so lookups are a linear scan.
#[derive(Debug, Default)]
pub struct ShaderSpecializationList {
    programs: Vec<Arc<CachedShaderProgram>>,
}

impl ShaderSpecializationList {
    pub fn add(&mut self, program: Arc<CachedShaderProgram>) {
        self.programs.push(program);
    }

    /// First variant whose recorded state matches the live state
    pub fn try_find(
        &self,
        channel: &dyn GpuChannelState,
        pool: &GpuChannelPoolState,
    ) -> Option<Arc<CachedShaderProgram>> {
        self.programs
            .iter()
            .find(|p| p.specialization.matches(channel, pool))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.programs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }
}

/// Hash table keyed by byte strings, partitioned by key length so a lookup
/// from guest memory only reads spans of lengths that were ever inserted
#[derive(Debug)]
pub struct PartitionedHashTable<T> {
    /// Distinct key sizes, ascending
    sizes: Vec<usize>,
    buckets: HashMap<(usize, u32), Vec<(Arc<[u8]>, T)>>,
    len: usize,
}

impl<T> Default for PartitionedHashTable<T> {
    fn default() -> Self {
        Self {
            sizes: Vec::new(),
            buckets: HashMap::new(),
            len: 0,
        }
    }
}

impl<T> PartitionedHashTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn bucket_index(bucket: &[(Arc<[u8]>, T)], data: &[u8]) -> Option<usize> {
        bucket.iter().position(|(key, _)| **key == *data)
    }

    pub fn get(&self, data: &[u8]) -> Option<&T> {
        let bucket = self.buckets.get(&(data.len(), fnv1a_32(data)))?;
        Self::bucket_index(bucket, data).map(|i| &bucket[i].1)
    }

    /// Get the value for `data`, inserting `make()` if absent
    pub fn get_or_add(&mut self, data: &[u8], make: impl FnOnce() -> T) -> &mut T {
        let key = (data.len(), fnv1a_32(data));
        let bucket = self.buckets.entry(key).or_default();

        let index = match Self::bucket_index(bucket, data) {
            Some(index) => index,
            None => {
                bucket.push((Arc::from(data), make()));
                self.len += 1;
                if let Err(pos) = self.sizes.binary_search(&data.len()) {
                    self.sizes.insert(pos, data.len());
                }
                bucket.len() - 1
            }
        };

        &mut bucket[index].1
    }

    /// Find the entry whose key is present in guest memory at `gpu_va`.
    ///
    /// Candidate keys are confirmed by a byte comparison against memory.
    pub fn try_find(&self, memory: &dyn GuestMemory, gpu_va: u64) -> Option<&T> {
        if !memory.is_mapped(gpu_va) {
            return None;
        }

        self.sizes.iter().find_map(|&size| {
            let span = memory.get_span(gpu_va, size)?;
            self.get(span)
        })
    }

    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.buckets.values().flatten().map(|(_, v)| v)
    }
}

/// Index of compute programs keyed by their guest code
#[derive(Debug, Default)]
pub struct ComputeShaderCacheHashTable {
    table: PartitionedHashTable<ShaderSpecializationList>,
}

impl ComputeShaderCacheHashTable {
    pub fn add(&mut self, program: Arc<CachedShaderProgram>) {
        let Some(Some(stage)) = program.stages.first() else {
            tracing::warn!("Compute program without a stage was not indexed");
            return;
        };
        let code = stage.code.clone();
        self.table
            .get_or_add(&code, ShaderSpecializationList::default)
            .add(program);
    }

    /// Look up the program for the compute shader at `gpu_va`
    pub fn find(
        &self,
        channel: &dyn GpuChannelState,
        pool: &GpuChannelPoolState,
        memory: &dyn GuestMemory,
        gpu_va: u64,
    ) -> Option<Arc<CachedShaderProgram>> {
        self.table.try_find(memory, gpu_va)?.try_find(channel, pool)
    }

    /// Number of distinct compute shaders
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn program_count(&self) -> usize {
        self.table.values().map(|l| l.len()).sum()
    }
}

/// Maps a stage's guest code to a dense id. Id 0 means "stage absent".
#[derive(Debug, Default)]
struct IdCache {
    table: PartitionedHashTable<u32>,
    next_id: u32,
}

impl IdCache {
    fn get_or_add(&mut self, code: &[u8]) -> u32 {
        let next_id = &mut self.next_id;
        *self.table.get_or_add(code, || {
            *next_id += 1;
            *next_id
        })
    }

    fn try_find(&self, memory: &dyn GuestMemory, gpu_va: u64) -> Option<u32> {
        self.table.try_find(memory, gpu_va).copied()
    }
}

/// Guest code address of each graphics stage slot, `None` for absent stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShaderAddresses(pub [Option<u64>; GRAPHICS_STAGE_SLOTS]);

/// Index of graphics programs
#[derive(Debug, Default)]
pub struct ShaderCacheHashTable {
    id_caches: [IdCache; GRAPHICS_STAGE_SLOTS],
    programs: HashMap<[u32; GRAPHICS_STAGE_SLOTS], ShaderSpecializationList>,
}

impl ShaderCacheHashTable {
    pub fn add(&mut self, program: Arc<CachedShaderProgram>) {
        let mut key = [0u32; GRAPHICS_STAGE_SLOTS];
        for (slot, stage) in program.stages.iter().enumerate().take(GRAPHICS_STAGE_SLOTS) {
            if let Some(stage) = stage {
                key[slot] = self.id_caches[slot].get_or_add(&stage.code);
            }
        }

        self.programs.entry(key).or_default().add(program);
    }

    /// Look up the program for the stages at `addresses`
    pub fn find(
        &self,
        channel: &dyn GpuChannelState,
        pool: &GpuChannelPoolState,
        memory: &dyn GuestMemory,
        addresses: &ShaderAddresses,
    ) -> Option<Arc<CachedShaderProgram>> {
        let mut key = [0u32; GRAPHICS_STAGE_SLOTS];
        for (slot, address) in addresses.0.iter().enumerate() {
            if let Some(va) = address {
                key[slot] = self.id_caches[slot].try_find(memory, *va)?;
            }
        }

        self.programs.get(&key)?.try_find(channel, pool)
    }

    /// Number of distinct stage combinations
    pub fn len(&self) -> usize {
        self.programs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }

    pub fn program_count(&self) -> usize {
        self.programs.values().map(|l| l.len()).sum()
    }
}

/// Both program indexes
#[derive(Debug, Default)]
pub struct ShaderIndexes {
    pub compute: ComputeShaderCacheHashTable,
    pub graphics: ShaderCacheHashTable,
}

impl ShaderIndexes {
    pub fn add(&mut self, program: Arc<CachedShaderProgram>) {
        if program.is_compute() {
            self.compute.add(program);
        } else {
            self.graphics.add(program);
        }
    }

    pub fn program_count(&self) -> usize {
        self.compute.program_count() + self.graphics.program_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{TextureDescriptor, TextureTarget};
    use crate::specialization::{
        ComputeStaticState, GraphicsStaticState, SpecializationState, TransformFeedbackDescriptor,
    };
    use crate::types::{CachedShaderStage, HostProgramHandle, ShaderStage};
    use std::cell::Cell;

    struct Memory {
        regions: Vec<(u64, Vec<u8>)>,
        reads: Cell<usize>,
    }

    impl GuestMemory for Memory {
        fn is_mapped(&self, gpu_va: u64) -> bool {
            self.regions
                .iter()
                .any(|(base, bytes)| gpu_va >= *base && gpu_va < base + bytes.len() as u64)
        }

        fn get_span(&self, gpu_va: u64, size: usize) -> Option<&[u8]> {
            self.reads.set(self.reads.get() + 1);
            self.regions.iter().find_map(|(base, bytes)| {
                let start = gpu_va.checked_sub(*base)? as usize;
                bytes.get(start..start.checked_add(size)?)
            })
        }
    }

    struct Channel {
        coord_normalized: bool,
    }

    impl GpuChannelState for Channel {
        fn texture_descriptor(
            &self,
            _stage: ShaderStage,
            _handle: i32,
            _cbuf_slot: i32,
            _pool: &GpuChannelPoolState,
        ) -> Option<TextureDescriptor> {
            Some(TextureDescriptor {
                format: 0,
                srgb: false,
                target: TextureTarget::Texture2D,
                coord_normalized: self.coord_normalized,
            })
        }

        fn constant_buffer1(&self, _stage: ShaderStage) -> &[u8] {
            &[]
        }

        fn constant_buffer_use(&self, _stage: ShaderStage) -> u32 {
            0
        }

        fn transform_feedback(&self) -> Option<Vec<TransformFeedbackDescriptor>> {
            None
        }
    }

    fn stage(code: &[u8]) -> Option<CachedShaderStage> {
        Some(CachedShaderStage {
            reflection: None,
            code: Arc::from(code),
            cb1_data: Arc::from(&[][..]),
        })
    }

    fn graphics(
        vertex: &[u8],
        fragment: &[u8],
        coord_normalized: bool,
        handle: u64,
    ) -> Arc<CachedShaderProgram> {
        let mut spec = SpecializationState::new_graphics(GraphicsStaticState::default());
        let descriptor = TextureDescriptor {
            coord_normalized,
            ..Default::default()
        };
        spec.register_texture(ShaderStage::Fragment, 1, -1, &descriptor);
        spec.record_texture_coord_normalized(ShaderStage::Fragment, 1, -1);

        Arc::new(CachedShaderProgram {
            host_program: HostProgramHandle(handle),
            specialization: spec,
            stages: vec![None, stage(vertex), None, None, None, stage(fragment)],
        })
    }

    #[test]
    fn test_partitioned_table() {
        let mut table = PartitionedHashTable::new();
        *table.get_or_add(b"abcd", || 0) += 1;
        *table.get_or_add(b"abcd", || 0) += 1;
        table.get_or_add(b"xy", || 7);

        assert_eq!(table.len(), 2);
        assert_eq!(table.get(b"abcd"), Some(&2));
        assert_eq!(table.get(b"abce"), None);

        let memory = Memory {
            regions: vec![(0x100, b"..xy..abcd".to_vec())],
            reads: Cell::new(0),
        };
        assert_eq!(table.try_find(&memory, 0x106), Some(&2));
        assert_eq!(table.try_find(&memory, 0x102), Some(&7));
        assert_eq!(table.try_find(&memory, 0x900), None);
        assert_eq!(table.try_find(&memory, 0x101), None);
    }

    #[test]
    fn test_graphics_lookup_selects_matching_variant() {
        let mut table = ShaderCacheHashTable::default();
        table.add(graphics(b"VERT", b"FRAG0001", true, 1));
        table.add(graphics(b"VERT", b"FRAG0001", false, 2));
        table.add(graphics(b"VERT", b"FRAG0002", true, 3));
        assert_eq!(table.len(), 2);
        assert_eq!(table.program_count(), 3);

        let memory = Memory {
            regions: vec![(0x1000, b"VERT".to_vec()), (0x2000, b"FRAG0001".to_vec())],
            reads: Cell::new(0),
        };
        let mut addresses = ShaderAddresses::default();
        addresses.0[1] = Some(0x1000);
        addresses.0[5] = Some(0x2000);

        let pool = GpuChannelPoolState::default();
        let found = table
            .find(&Channel { coord_normalized: false }, &pool, &memory, &addresses)
            .unwrap();
        assert_eq!(found.host_program, HostProgramHandle(2));

        let found = table
            .find(&Channel { coord_normalized: true }, &pool, &memory, &addresses)
            .unwrap();
        assert_eq!(found.host_program, HostProgramHandle(1));

        // A geometry stage that was never cached misses
        addresses.0[4] = Some(0x1000);
        assert!(table
            .find(&Channel { coord_normalized: true }, &pool, &memory, &addresses)
            .is_none());
    }

    #[test]
    fn test_compute_lookup_confirms_bytes() {
        let mut table = ComputeShaderCacheHashTable::default();
        table.add(Arc::new(CachedShaderProgram {
            host_program: HostProgramHandle(9),
            specialization: SpecializationState::new_compute(ComputeStaticState::default()),
            stages: vec![stage(b"COMPUTE!")],
        }));

        let memory = Memory {
            regions: vec![(0x10, b"COMPUTE!".to_vec()), (0x40, b"COMPUTE?".to_vec())],
            reads: Cell::new(0),
        };
        let channel = Channel { coord_normalized: true };
        let pool = GpuChannelPoolState::default();

        assert_eq!(
            table.find(&channel, &pool, &memory, 0x10).unwrap().host_program,
            HostProgramHandle(9)
        );
        assert!(table.find(&channel, &pool, &memory, 0x40).is_none());
        assert!(memory.reads.get() >= 2);
    }
}
