//! Video memory bookkeeping for uploaded grids.
//!
//! The renderer owns the actual GPU objects. What lives here is the
//! descriptor in the video memory cache, keyed like the grid it was made from
//! (source and request), so that a texture is shared by every consumer of the
//! same grid and evicted under the video memory ceiling like any other cache
//! entry.

use std::sync::Arc;

use wxflow_core::{GpuTexture, SourceId};
use wxflow_storage::{MemoryManager, OwnerScopedKey, ResourceCache, ResourceHandle};

use crate::source::DataHandle;

/// Acquired reference on a texture descriptor.
pub type TextureHandle = ResourceHandle<GpuTexture>;

const BYTES_PER_FLOAT_TEXEL: u32 = 4;

/// Texture key field naming the source the grid came from.
const GRID_SOURCE: &str = "GRID_SOURCE";

/// Creates (or reuses) texture descriptors for grids.
#[derive(Debug, Clone)]
pub struct TextureUploader {
    owner: SourceId,
    video_cache: Arc<ResourceCache<GpuTexture>>,
}

impl TextureUploader {
    pub fn new(owner: SourceId, video_cache: Arc<ResourceCache<GpuTexture>>) -> Self {
        Self { owner, video_cache }
    }

    /// Texture for the grid behind `data`. `None` if `data` is not a grid or
    /// video memory is exhausted.
    pub fn upload(&self, data: &DataHandle) -> Option<TextureHandle> {
        let key = self.texture_key(data);
        if self.video_cache.reserve(&key) {
            tracing::trace!(key = %key, "Texture already resident");
            return self.video_cache.checkout(&key);
        }

        let grid = data.as_grid()?;
        let texture = GpuTexture {
            label: grid.variable.clone(),
            width: grid.lons.len() as u32,
            height: grid.lats.len() as u32,
            depth: grid.levels.len().max(1) as u32,
            bytes_per_texel: BYTES_PER_FLOAT_TEXEL,
        };
        if let Err(e) = self.video_cache.store(key.clone(), Arc::new(texture), 1) {
            tracing::warn!(key = %key, error = %e, "Texture upload failed");
            return None;
        }
        self.video_cache.checkout(&key)
    }

    fn texture_key(&self, data: &DataHandle) -> OwnerScopedKey {
        let mut rb = data.request().to_builder();
        rb.insert(GRID_SOURCE, data.key().owner().to_string());
        OwnerScopedKey::new(self.owner, rb.build())
    }

    pub fn video_cache(&self) -> &Arc<ResourceCache<GpuTexture>> {
        &self.video_cache
    }
}
