//! RenderTargetPool: hand out render targets keyed by `(name, width, height)`. The
//! key/reuse/eviction logic is kept allocator-agnostic so it can be unit-tested without a GPU
//! context; [`WgpuTargetAllocator`] is the only piece that actually touches `wgpu`.

use std::collections::HashMap;

use crate::error::EngineError;
use crate::pass::RenderTargetInfo;

/// Knows how to allocate, clear, and free one physical render target.
pub trait TargetAllocator {
    type Target;

    fn allocate(
        &mut self,
        info: &RenderTargetInfo,
        has_depth_stencil: bool,
    ) -> Result<Self::Target, EngineError>;

    /// Clears colour and depth/stencil to `(0,0,0,0)` before a reused target re-enters service.
    fn clear(&mut self, target: &mut Self::Target);

    fn free(&mut self, target: Self::Target);
}

/// One pool instance per Engine, owned and passed explicitly rather than a process-wide
/// singleton — global state offers no benefit here and complicates testing.
pub struct RenderTargetPool<A: TargetAllocator> {
    allocator: A,
    free: HashMap<String, A::Target>,
    in_use: HashMap<String, A::Target>,
    default_target_name: String,
    default_target: Option<A::Target>,
}

impl<A: TargetAllocator> RenderTargetPool<A> {
    pub fn new(allocator: A, default_target_name: impl Into<String>) -> Self {
        RenderTargetPool {
            allocator,
            free: HashMap::new(),
            in_use: HashMap::new(),
            default_target_name: default_target_name.into(),
            default_target: None,
        }
    }

    /// Installs the externally supplied "screen"/offscreen-final target. Its handles are
    /// sentinels and are never freed by the pool.
    pub fn set_default_target(&mut self, target: A::Target) {
        self.default_target = Some(target);
    }

    /// Hands out the target for `info`. If its key is already `in_use` this frame, returns the
    /// same physical target (two passes may legitimately share one). Else pulls from the free
    /// pool (clearing it first) or allocates fresh.
    pub fn acquire(
        &mut self,
        info: &RenderTargetInfo,
        has_depth_stencil: bool,
    ) -> Result<&A::Target, EngineError> {
        if info.name == self.default_target_name {
            return self.default_target.as_ref().ok_or_else(|| {
                EngineError::FramebufferIncomplete {
                    name: info.name.clone(),
                    width: info.width,
                    height: info.height,
                }
            });
        }

        let key = info.pool_key();
        if self.in_use.contains_key(&key) {
            return Ok(self.in_use.get(&key).unwrap());
        }

        if let Some(mut target) = self.free.remove(&key) {
            self.allocator.clear(&mut target);
            self.in_use.insert(key.clone(), target);
            return Ok(self.in_use.get(&key).unwrap());
        }

        let target = self.allocator.allocate(info, has_depth_stencil)?;
        self.in_use.insert(key.clone(), target);
        Ok(self.in_use.get(&key).unwrap())
    }

    pub fn release(&mut self, key: &str) {
        if key == self.default_target_name {
            return;
        }
        if let Some(target) = self.in_use.remove(key) {
            self.free.insert(key.to_string(), target);
        }
    }

    /// Moves every `in_use` target back to the free pool. Called once per top-level `render()`
    /// batch, at frame end — not per pass.
    pub fn release_unused(&mut self) {
        for (key, target) in self.in_use.drain() {
            self.free.insert(key, target);
        }
    }

    /// Destroys all pooled GPU resources. The default/screen target, if installed, is left
    /// alone — it's externally owned.
    pub fn reset(&mut self) {
        for (_, target) in self.free.drain() {
            self.allocator.free(target);
        }
        for (_, target) in self.in_use.drain() {
            self.allocator.free(target);
        }
    }

    pub fn in_use_count(&self) -> usize {
        self.in_use.len()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }
}

/// The physical resource handed out by [`WgpuTargetAllocator`]: a colour texture (RGBA8,
/// clamp-to-edge, linear-filterable) and an optional depth/stencil attachment.
pub struct RenderTarget {
    pub color_texture: wgpu::Texture,
    pub color_view: wgpu::TextureView,
    pub depth_view: Option<wgpu::TextureView>,
    pub width: u32,
    pub height: u32,
}

pub struct WgpuTargetAllocator {
    device: std::sync::Arc<wgpu::Device>,
}

impl WgpuTargetAllocator {
    pub fn new(device: std::sync::Arc<wgpu::Device>) -> Self {
        WgpuTargetAllocator { device }
    }
}

impl TargetAllocator for WgpuTargetAllocator {
    type Target = RenderTarget;

    fn allocate(
        &mut self,
        info: &RenderTargetInfo,
        has_depth_stencil: bool,
    ) -> Result<RenderTarget, EngineError> {
        if info.width == 0 || info.height == 0 {
            return Err(EngineError::FramebufferIncomplete {
                name: info.name.clone(),
                width: info.width,
                height: info.height,
            });
        }

        let color_texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(&info.name),
            size: wgpu::Extent3d {
                width: info.width,
                height: info.height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let color_view = color_texture.create_view(&wgpu::TextureViewDescriptor::default());

        let depth_view = has_depth_stencil.then(|| {
            let depth_texture = self.device.create_texture(&wgpu::TextureDescriptor {
                label: Some(&format!("{}_depth", info.name)),
                size: wgpu::Extent3d {
                    width: info.width,
                    height: info.height,
                    depth_or_array_layers: 1,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: wgpu::TextureFormat::Depth24PlusStencil8,
                usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
                view_formats: &[],
            });
            depth_texture.create_view(&wgpu::TextureViewDescriptor::default())
        });

        Ok(RenderTarget {
            color_texture,
            color_view,
            depth_view,
            width: info.width,
            height: info.height,
        })
    }

    fn clear(&mut self, _target: &mut RenderTarget) {
        // Clearing is expressed as a `LoadOp::Clear((0,0,0,0))` on the render pass that next
        // binds this target (RenderPassExecutor), rather than an out-of-band GPU command here.
    }

    fn free(&mut self, _target: RenderTarget) {
        // Dropping `RenderTarget` releases the underlying wgpu resources.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct FakeAllocator {
        next_id: u32,
        allocate_calls: u32,
        clear_calls: u32,
        free_calls: u32,
    }

    impl TargetAllocator for FakeAllocator {
        type Target = u32;

        fn allocate(
            &mut self,
            info: &RenderTargetInfo,
            _has_depth_stencil: bool,
        ) -> Result<u32, EngineError> {
            if info.width == 0 {
                return Err(EngineError::FramebufferIncomplete {
                    name: info.name.clone(),
                    width: info.width,
                    height: info.height,
                });
            }
            self.allocate_calls += 1;
            self.next_id += 1;
            Ok(self.next_id)
        }

        fn clear(&mut self, _target: &mut u32) {
            self.clear_calls += 1;
        }

        fn free(&mut self, _target: u32) {
            self.free_calls += 1;
        }
    }

    fn info(name: &str, w: u32, h: u32) -> RenderTargetInfo {
        RenderTargetInfo {
            name: name.to_string(),
            width: w,
            height: h,
            width_expr: None,
            height_expr: None,
        }
    }

    #[test]
    fn scenario_e_pool_reuse() {
        let mut pool = RenderTargetPool::new(FakeAllocator::default(), "default");
        let seq = info("seq", 1920, 1080);

        let handle = *pool.acquire(&seq, false).unwrap();
        pool.release_unused();
        let handle2 = *pool.acquire(&seq, false).unwrap();
        assert_eq!(handle, handle2, "reacquiring the same key should return the same handle");
    }

    #[test]
    fn same_frame_acquire_of_same_key_shares_the_target() {
        let mut pool = RenderTargetPool::new(FakeAllocator::default(), "default");
        let seq = info("seq", 640, 480);
        let a = *pool.acquire(&seq, false).unwrap();
        let b = *pool.acquire(&seq, false).unwrap();
        assert_eq!(a, b);
        assert_eq!(pool.in_use_count(), 1);
    }

    #[test]
    fn release_unused_moves_everything_to_free_pool_at_once() {
        let mut pool = RenderTargetPool::new(FakeAllocator::default(), "default");
        pool.acquire(&info("a", 100, 100), false).unwrap();
        pool.acquire(&info("b", 200, 200), false).unwrap();
        assert_eq!(pool.in_use_count(), 2);
        pool.release_unused();
        assert_eq!(pool.in_use_count(), 0);
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn default_target_is_never_allocated_or_freed() {
        let mut pool = RenderTargetPool::new(FakeAllocator::default(), "default");
        pool.set_default_target(999);
        let handle = *pool.acquire(&info("default", 0, 0), false).unwrap();
        assert_eq!(handle, 999);
        pool.release_unused();
        pool.reset();
        // Still retrievable: reset() never touches the externally supplied default target.
        assert_eq!(*pool.acquire(&info("default", 0, 0), false).unwrap(), 999);
    }

    #[test]
    fn incomplete_allocation_is_reported_and_nothing_is_inserted() {
        let mut pool = RenderTargetPool::new(FakeAllocator::default(), "default");
        assert!(pool.acquire(&info("broken", 0, 100), false).is_err());
        assert_eq!(pool.in_use_count(), 0);
    }
}
