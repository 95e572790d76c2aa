//! RenderPassExecutor: the single-pass draw procedure and the dependency-first traversal that
//! drives it across a frame's Pass DAG.
//!
//! The traversal/memoisation logic is itself pure data manipulation; only
//! [`RenderPassExecutor::render`]'s per-pass body touches `wgpu`. [`dependency_first_order`] is
//! exercised directly in tests against an in-memory `PassArena`, with no GPU context involved —
//! mirroring a recursive `renderedSet`-guarded walk.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bytemuck::NoUninit;
use log::warn;

use crate::error::EngineError;
use crate::pass::{AttributeBufferRef, PassArena, PassId, TextureHandle, UniformValue};
use crate::render_target_pool::{RenderTargetPool, WgpuTargetAllocator};
use crate::shader_manager::{BindingKind, ShaderManager, ShaderStage};

/// Dependency-first, cycle-safe traversal order over `roots`.
///
/// A pass already fully visited is never revisited (diamond dependencies render once), and a
/// pass currently being visited higher up the call stack is treated the same way if reached
/// again before it finishes — the back-edge is silently dropped rather than causing unbounded
/// recursion.
pub fn dependency_first_order(arena: &PassArena, roots: &[PassId]) -> Vec<PassId> {
    let mut order = Vec::new();
    let mut rendered = HashSet::new();
    let mut visiting = HashSet::new();
    for &root in roots {
        visit(arena, root, &mut visiting, &mut rendered, &mut order);
    }
    order
}

fn visit(arena: &PassArena, id: PassId, visiting: &mut HashSet<PassId>, rendered: &mut HashSet<PassId>, order: &mut Vec<PassId>) {
    if rendered.contains(&id) || visiting.contains(&id) {
        return;
    }
    visiting.insert(id);
    for dep in arena.get(id).material_ptr_dependencies() {
        visit(arena, dep, visiting, rendered, order);
    }
    visiting.remove(&id);
    if rendered.insert(id) {
        order.push(id);
    }
}

/// Resolves a named/shared vertex buffer for a Pass's `attributeBuffer` reference.
pub trait VertexBufferSource {
    fn buffer(&self, reference: &AttributeBufferRef) -> Option<&wgpu::Buffer>;
}

/// Resolves the texture view behind a `Texture2D` uniform's opaque handle.
pub trait TextureViewSource {
    fn view(&self, handle: TextureHandle) -> Option<&wgpu::TextureView>;
}

/// One cached pipeline plus the bind-group layout and reflected binding shape it was built from.
struct CachedPipeline {
    pipeline: wgpu::RenderPipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    bindings: Arc<Vec<crate::shader_manager::BindingInfo>>,
}

/// Drives `ShaderManager` + `RenderTargetPool` through one frame's Pass DAG.
pub struct RenderPassExecutor {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    sampler: wgpu::Sampler,
    pipelines: HashMap<String, CachedPipeline>,
    uniform_buffers: HashMap<(PassId, String), wgpu::Buffer>,
}

const VERTEX_STRIDE: u64 = 5 * 4; // [x, y, z, u, v], all f32.

impl RenderPassExecutor {
    pub fn new(device: Arc<wgpu::Device>, queue: Arc<wgpu::Queue>) -> Self {
        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("render-pass-executor-sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });
        RenderPassExecutor {
            device,
            queue,
            sampler,
            pipelines: HashMap::new(),
            uniform_buffers: HashMap::new(),
        }
    }

    /// `render(passes, release)`: dependency-first execution of every root in `roots` and
    /// everything they transitively depend on, via [`dependency_first_order`]. Never aborts on a single Pass's failure — it's logged and skipped, and traversal
    /// continues with its siblings/dependents.
    #[allow(clippy::too_many_arguments)]
    pub fn render(
        &mut self,
        arena: &PassArena,
        roots: &[PassId],
        shaders: &mut ShaderManager,
        pool: &mut RenderTargetPool<WgpuTargetAllocator>,
        vertex_buffers: &impl VertexBufferSource,
        textures: &impl TextureViewSource,
        release: bool,
    ) {
        let order = dependency_first_order(arena, roots);
        for id in order {
            let pass = arena.get(id);
            if let Err(err) = self.render_single_pass(arena, id, pass, shaders, pool, vertex_buffers, textures) {
                crate::shader_manager::log_skipped_pass(&pass.pass_name, &err);
            }
        }
        if release {
            pool.release_unused();
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn render_single_pass(
        &mut self,
        arena: &PassArena,
        id: PassId,
        pass: &crate::pass::Pass,
        shaders: &mut ShaderManager,
        pool: &mut RenderTargetPool<WgpuTargetAllocator>,
        vertex_buffers: &impl VertexBufferSource,
        textures: &impl TextureViewSource,
    ) -> Result<(), EngineError> {
        let _ = id;
        // Step 1: resolve the GPU program.
        let program = shaders.resolve(&self.device, &pass.pass_name, &pass.vertex_shader, &pass.fragment_shader)?;

        // Step 2: acquire the output target. Clone the view (a cheap, reference-counted handle
        // in wgpu) immediately so the pool's mutable borrow doesn't outlive this statement —
        // resolving texture-uniform dependencies below needs to re-acquire the pool for other
        // targets, which a held borrow of this pass's own target would forbid.
        let own_color_view = pool.acquire(&pass.render_target_info, false)?.color_view.clone();

        let cache_key = format!("{}|{}", pass.vertex_shader, pass.fragment_shader);
        if !self.pipelines.contains_key(&cache_key) {
            let cached = build_pipeline(&self.device, &program, wgpu::TextureFormat::Rgba8Unorm);
            self.pipelines.insert(cache_key.clone(), cached);
        }
        let cached = self.pipelines.get(&cache_key).expect("just inserted");

        // Step 3/4: bind group — textures/sampler/uniform buffers resolved by reflected name.
        // `texture_views`/`scratch_buffers` are pre-sized to the binding count so the `entries`
        // vec's references into them stay valid — a mid-loop reallocation of either would
        // invalidate references already pushed into `entries`.
        let mut entries = Vec::with_capacity(cached.bindings.len());
        let mut current_texture_unit = 0u32;
        let mut scratch_buffers: Vec<wgpu::Buffer> = Vec::with_capacity(cached.bindings.len());
        let mut texture_views: Vec<wgpu::TextureView> = Vec::with_capacity(cached.bindings.len());
        for binding in cached.bindings.iter() {
            match binding.kind {
                BindingKind::Sampler => {
                    entries.push(wgpu::BindGroupEntry {
                        binding: binding.binding,
                        resource: wgpu::BindingResource::Sampler(&self.sampler),
                    });
                }
                BindingKind::Texture => {
                    let Some(uniform) = pass.uniforms.get(&binding.name) else {
                        warn!("pass '{}': no uniform bound for texture '{}'", pass.pass_name, binding.name);
                        continue;
                    };
                    let view: Option<wgpu::TextureView> = match &uniform.value {
                        UniformValue::Texture2D(handle) => textures.view(*handle).cloned(),
                        UniformValue::MaterialPtr(dep_id) => {
                            // Already rendered earlier in dependency-first order; look up its
                            // target by the same `RenderTargetInfo` key it was rendered into.
                            let dep_info = &arena.get(*dep_id).render_target_info;
                            pool.acquire(dep_info, false).ok().map(|t| t.color_view.clone())
                        }
                        UniformValue::RenderTarget(info) => pool.acquire(info, false).ok().map(|t| t.color_view.clone()),
                        _ => None,
                    };
                    let Some(view) = view else {
                        warn!("pass '{}': texture '{}' unresolved", pass.pass_name, binding.name);
                        continue;
                    };
                    texture_views.push(view);
                    entries.push(wgpu::BindGroupEntry {
                        binding: binding.binding,
                        resource: wgpu::BindingResource::TextureView(texture_views.last().expect("just pushed")),
                    });
                    current_texture_unit += 1;
                }
                BindingKind::Uniform { .. } => {
                    let Some(uniform) = pass.uniforms.get(&binding.name) else {
                        warn!("pass '{}': no uniform bound for '{}'", pass.pass_name, binding.name);
                        continue;
                    };
                    let bytes = uniform_bytes(&uniform.value);
                    let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
                        label: Some(&binding.name),
                        size: bytes.len().max(16) as u64,
                        usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                        mapped_at_creation: false,
                    });
                    self.queue.write_buffer(&buffer, 0, &bytes);
                    scratch_buffers.push(buffer);
                    entries.push(wgpu::BindGroupEntry {
                        binding: binding.binding,
                        resource: scratch_buffers.last().expect("just pushed").as_entire_binding(),
                    });
                }
            }
        }
        let _ = current_texture_unit;

        // wgpu requires a bind group entry for every binding the layout declares; a shader
        // binding this pass never supplied a uniform for (already warned about above) means the
        // whole pass can't be drawn this frame, not just that one binding.
        if entries.len() != cached.bindings.len() {
            return Err(EngineError::ShaderCompileError {
                pass_name: pass.pass_name.clone(),
                vertex_key: pass.vertex_shader.clone(),
                fragment_key: pass.fragment_shader.clone(),
                message: "one or more shader bindings had no matching uniform".to_string(),
            });
        }

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(&pass.pass_name),
            layout: &cached.bind_group_layout,
            entries: &entries,
        });

        let Some(vertex_buffer) = vertex_buffers.buffer(&pass.attribute_buffer) else {
            return Err(EngineError::FramebufferIncomplete {
                name: pass.render_target_info.name.clone(),
                width: pass.render_target_info.width,
                height: pass.render_target_info.height,
            });
        };

        // Step 5/6: clear-mask/clear-color (independent of each other) and the draw itself.
        let load_op = match &pass.clear_mask {
            Some(mask) if mask.color => {
                let [r, g, b, a] = pass.clear_color.unwrap_or([0.0, 0.0, 0.0, 0.0]);
                wgpu::LoadOp::Clear(wgpu::Color { r: r as f64, g: g as f64, b: b as f64, a: a as f64 })
            }
            _ => wgpu::LoadOp::Load,
        };

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some(&pass.pass_name),
        });
        {
            let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some(&pass.pass_name),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &own_color_view,
                    resolve_target: None,
                    ops: wgpu::Operations { load: load_op, store: wgpu::StoreOp::Store },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            render_pass.set_pipeline(&cached.pipeline);
            render_pass.set_bind_group(0, &bind_group, &[]);
            render_pass.set_vertex_buffer(0, vertex_buffer.slice(..));
            render_pass.draw(0..4, 0..1);
        }
        self.queue.submit(std::iter::once(encoder.finish()));

        Ok(())
    }
}

/// Raw little-endian bytes for a uniform value, matching the WGSL scalar/vector/matrix layout
/// its declared type implies.
fn uniform_bytes(value: &UniformValue) -> Vec<u8> {
    fn bytes_of<T: NoUninit>(v: &T) -> Vec<u8> {
        bytemuck::bytes_of(v).to_vec()
    }
    match value {
        UniformValue::Int(v) => bytes_of(v),
        UniformValue::Float(v) => bytes_of(&(*v as f32)),
        UniformValue::Bool(v) => bytes_of(&(*v as u32)),
        UniformValue::Vec2i(v) => bytes_of(v),
        UniformValue::Vec3i(v) => bytes_of(v),
        UniformValue::Vec2f(v) => bytes_of(v),
        UniformValue::Vec3f(v) => bytes_of(v),
        UniformValue::Vec4f(v) => bytes_of(v),
        UniformValue::Mat4(v) => bytes_of(v),
        UniformValue::Texture2D(_) | UniformValue::MaterialPtr(_) | UniformValue::RenderTarget(_) => Vec::new(),
    }
}

/// A binding's reflected stage maps straight to the bind-group-layout visibility wgpu needs —
/// narrower than "visible to every stage" so a vertex-only matrix and a fragment-only texture
/// don't each force the other stage to declare a binding it never reads.
fn stage_visibility(stage: ShaderStage) -> wgpu::ShaderStages {
    match stage {
        ShaderStage::Vertex => wgpu::ShaderStages::VERTEX,
        ShaderStage::Fragment => wgpu::ShaderStages::FRAGMENT,
    }
}

fn build_pipeline(device: &wgpu::Device, program: &crate::shader_manager::CompiledProgram, format: wgpu::TextureFormat) -> CachedPipeline {
    let mut layout_entries = Vec::with_capacity(program.bindings.len());
    for binding in program.bindings.iter() {
        let visibility = stage_visibility(binding.stage);
        let entry = match binding.kind {
            BindingKind::Sampler => wgpu::BindGroupLayoutEntry {
                binding: binding.binding,
                visibility,
                ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                count: None,
            },
            BindingKind::Texture => wgpu::BindGroupLayoutEntry {
                binding: binding.binding,
                visibility,
                ty: wgpu::BindingType::Texture {
                    sample_type: wgpu::TextureSampleType::Float { filterable: true },
                    view_dimension: wgpu::TextureViewDimension::D2,
                    multisampled: false,
                },
                count: None,
            },
            BindingKind::Uniform { .. } => wgpu::BindGroupLayoutEntry {
                binding: binding.binding,
                visibility,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            },
        };
        layout_entries.push(entry);
    }

    let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("render-pass-executor-bind-group-layout"),
        entries: &layout_entries,
    });

    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some("render-pass-executor-pipeline-layout"),
        bind_group_layouts: &[&bind_group_layout],
        push_constant_ranges: &[],
    });

    let vertex_layout = wgpu::VertexBufferLayout {
        array_stride: VERTEX_STRIDE,
        step_mode: wgpu::VertexStepMode::Vertex,
        attributes: &[
            wgpu::VertexAttribute { format: wgpu::VertexFormat::Float32x3, offset: 0, shader_location: 0 },
            wgpu::VertexAttribute { format: wgpu::VertexFormat::Float32x2, offset: 3 * 4, shader_location: 1 },
        ],
    };

    let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some("render-pass-executor-pipeline"),
        layout: Some(&pipeline_layout),
        vertex: wgpu::VertexState {
            module: &program.vertex,
            entry_point: Some("vs_main"),
            buffers: &[vertex_layout],
            compilation_options: Default::default(),
        },
        fragment: Some(wgpu::FragmentState {
            module: &program.fragment,
            entry_point: Some("fs_main"),
            targets: &[Some(wgpu::ColorTargetState {
                format,
                // Premultiplied-alpha blending: `(1, 1-src_alpha, ADD)` for both colour and
                // alpha channels.
                blend: Some(wgpu::BlendState {
                    color: wgpu::BlendComponent { src_factor: wgpu::BlendFactor::One, dst_factor: wgpu::BlendFactor::OneMinusSrcAlpha, operation: wgpu::BlendOperation::Add },
                    alpha: wgpu::BlendComponent { src_factor: wgpu::BlendFactor::One, dst_factor: wgpu::BlendFactor::OneMinusSrcAlpha, operation: wgpu::BlendOperation::Add },
                }),
                write_mask: wgpu::ColorWrites::ALL,
            })],
            compilation_options: Default::default(),
        }),
        primitive: wgpu::PrimitiveState {
            topology: wgpu::PrimitiveTopology::TriangleStrip,
            ..Default::default()
        },
        depth_stencil: None,
        multisample: wgpu::MultisampleState::default(),
        multiview: None,
        cache: None,
    });

    CachedPipeline { pipeline, bind_group_layout, bindings: program.bindings.clone() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pass::{AttributeBufferRef, ClearMask, Pass, RenderTargetInfo, Uniform};
    use std::collections::HashMap as Map;

    fn leaf(name: &str) -> Pass {
        Pass {
            pass_name: name.to_string(),
            render_target_info: RenderTargetInfo { name: "seq".to_string(), width: 100, height: 100, width_expr: None, height_expr: None },
            vertex_shader: "default.vert".to_string(),
            fragment_shader: "default.frag".to_string(),
            attribute_buffer: AttributeBufferRef::NdcQuad,
            uniforms: Map::new(),
            clear_color: None,
            clear_mask: None,
        }
    }

    #[test]
    fn linear_chain_renders_dependencies_before_dependents() {
        let mut arena = PassArena::new();
        let base = arena.alloc(leaf("base"));
        let mut mid = leaf("mid");
        mid.uniforms.insert("u_texture".to_string(), Uniform { value: UniformValue::MaterialPtr(base), expression: None });
        let mid_id = arena.alloc(mid);
        let mut top = leaf("top");
        top.uniforms.insert("u_texture".to_string(), Uniform { value: UniformValue::MaterialPtr(mid_id), expression: None });
        let top_id = arena.alloc(top);

        let order = dependency_first_order(&arena, &[top_id]);
        assert_eq!(order, vec![base, mid_id, top_id]);
    }

    #[test]
    fn diamond_dependency_renders_shared_node_once() {
        let mut arena = PassArena::new();
        let shared = arena.alloc(leaf("shared"));
        let mut left = leaf("left");
        left.uniforms.insert("u_texture".to_string(), Uniform { value: UniformValue::MaterialPtr(shared), expression: None });
        let left_id = arena.alloc(left);
        let mut right = leaf("right");
        right.uniforms.insert("u_texture".to_string(), Uniform { value: UniformValue::MaterialPtr(shared), expression: None });
        let right_id = arena.alloc(right);
        let mut root = leaf("root");
        root.uniforms.insert("u_left".to_string(), Uniform { value: UniformValue::MaterialPtr(left_id), expression: None });
        root.uniforms.insert("u_right".to_string(), Uniform { value: UniformValue::MaterialPtr(right_id), expression: None });
        let root_id = arena.alloc(root);

        let order = dependency_first_order(&arena, &[root_id]);
        assert_eq!(order.iter().filter(|&&id| id == shared).count(), 1);
        let shared_pos = order.iter().position(|&id| id == shared).unwrap();
        let root_pos = order.iter().position(|&id| id == root_id).unwrap();
        assert!(shared_pos < root_pos);
    }

    #[test]
    fn back_edge_cycle_does_not_infinitely_recurse() {
        let mut arena = PassArena::new();
        let a_id = arena.alloc(leaf("a"));
        let b_id = arena.alloc(leaf("b"));
        arena.get_mut(a_id).uniforms.insert("u_texture".to_string(), Uniform { value: UniformValue::MaterialPtr(b_id), expression: None });
        arena.get_mut(b_id).uniforms.insert("u_texture".to_string(), Uniform { value: UniformValue::MaterialPtr(a_id), expression: None });

        let order = dependency_first_order(&arena, &[a_id]);
        assert_eq!(order.len(), 2);
    }

    #[test]
    fn clear_mask_and_clear_color_are_independent() {
        let mut with_color_no_mask = leaf("p1");
        with_color_no_mask.clear_color = Some([1.0, 0.0, 0.0, 1.0]);
        assert!(with_color_no_mask.clear_mask.is_none());

        let mut with_mask_no_color = leaf("p2");
        with_mask_no_color.clear_mask = Some(ClearMask { color: true, depth: false, stencil: false });
        assert!(with_mask_no_color.clear_color.is_none());
    }

    #[test]
    fn uniform_bytes_sizes_match_declared_shape() {
        assert_eq!(uniform_bytes(&UniformValue::Float(1.0)).len(), 4);
        assert_eq!(uniform_bytes(&UniformValue::Vec4f([0.0; 4])).len(), 16);
        assert_eq!(uniform_bytes(&UniformValue::Mat4([0.0; 16])).len(), 64);
    }
}
