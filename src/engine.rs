//! Engine: the per-frame orchestrator.
//!
//! `update_tracks` rebuilds the Pass DAG and on-timeline entities from a [`Timeline`];
//! `play` steps global time forward, refreshing keyframed/expression-bound state each frame,
//! executing the DAG, and handing the readback bytes to [`FrameEncoder`].

use std::collections::HashMap;
use std::sync::Arc;

use log::warn;

use crate::color::{self, HexColor};
use crate::entities::{
    resize_ndc_quad_for_plugin, resize_quad_for_dependency, PluginRenderer, Renderer,
    Transform2D, TransitionRenderer,
};
use crate::error::EngineError;
use crate::executor::{RenderPassExecutor, TextureViewSource, VertexBufferSource};
use crate::expr::ExpressionCache;
use crate::frame_encoder::{EncoderConfig, FrameEncoder};
use crate::keyframe_path::{apply_adjust_and_resource_keyframes, apply_control_keyframes};
use crate::param_evaluator::{collect_passes_with_suffix, control_value_to_variable, ParamEvaluator};
use crate::pass::{AttributeBufferRef, Pass, PassArena, PassId, RenderTargetInfo, ResourceTextureLookup, TextureHandle, Uniform, UniformValue};
use crate::render_target_pool::{RenderTarget, RenderTargetPool, WgpuTargetAllocator};
use crate::resource::{
    generate_vertices, normalize_rotation, FfmpegVideoSource, FontdueTextRasterizer, ImageSource,
    RendererResource, ResourceBacking, StaticImageSource, TextRasterizer, TextureTable, VideoSource,
};
use crate::shader_manager::ShaderManager;
use crate::timeline::{self, Adjust, Resource, Sequence, Timeline, Track, TrackType};
use crate::track_timing;

/// The externally-supplied final composite target; its handles are sentinels never freed by
/// the pool.
const DEFAULT_TARGET_NAME: &str = "screen";
/// The shared accumulation buffer every visible sequence composites onto, in order, before the
/// final blit to [`DEFAULT_TARGET_NAME`].
const SEQUENCE_TARGET_NAME: &str = "seq";

impl TextureViewSource for TextureTable {
    fn view(&self, handle: TextureHandle) -> Option<&wgpu::TextureView> {
        TextureTable::view(self, handle)
    }
}

struct VertexBuffers {
    ndc: wgpu::Buffer,
    screen: wgpu::Buffer,
    named: HashMap<String, wgpu::Buffer>,
}

impl VertexBufferSource for VertexBuffers {
    fn buffer(&self, reference: &AttributeBufferRef) -> Option<&wgpu::Buffer> {
        match reference {
            AttributeBufferRef::NdcQuad => Some(&self.ndc),
            AttributeBufferRef::ScreenQuad => Some(&self.screen),
            AttributeBufferRef::Named(id) => self.named.get(id),
        }
    }
}

fn quad_buffer(device: &wgpu::Device, label: &str, geometry: &crate::entities::QuadGeometry) -> wgpu::Buffer {
    use wgpu::util::DeviceExt;
    device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some(label),
        contents: bytemuck::cast_slice(geometry),
        usage: wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::COPY_DST,
    })
}

/// Smallest multiple of `alignment` that is `>= value` (`wgpu`'s `COPY_BYTES_PER_ROW_ALIGNMENT`
/// requirement on buffer-backed texture copies).
fn align_up(value: u32, alignment: u32) -> u32 {
    value.div_ceil(alignment) * alignment
}

/// `adjust.transform.{x,y}` are normalised, multiplied by the render target's width/height; y
/// is inverted. Pure and testable without a GPU context.
fn transform_from_adjust(adjust: &Adjust, target_size: (f64, f64)) -> Transform2D {
    Transform2D {
        position: (adjust.transform.x * target_size.0, -adjust.transform.y * target_size.1),
        rotation_degrees: adjust.rotate,
        scale: (adjust.scale.x, adjust.scale.y),
        anchor: (0.0, 0.0),
    }
}

/// `u_color = rgba`: a text sequence's fill colour (or white for graphic sequences, which have
/// no `resource.color`), with alpha modulated by `adjust.opacity`.
fn base_color_for_resource(resource: &Resource, opacity: f64) -> [f32; 4] {
    let base = resource
        .color
        .as_deref()
        .and_then(color::parse_hex)
        .unwrap_or(HexColor { r: 255, g: 255, b: 255, a: 255 });
    let [r, g, b, a] = base.to_rgba_f32();
    [r, g, b, a * opacity.clamp(0.0, 1.0) as f32]
}

/// A transition attached to sequence `i` within a track of `track_len` sequences bridges it to
/// the next sequence on the same track, if one exists.
fn transition_partner_index(track_len: usize, i: usize) -> Option<usize> {
    (i + 1 < track_len).then_some(i + 1)
}

/// One track's sequences, kept in the composite order decided at `update_tracks` time (reverse
/// track order; sequences within a track stay in document order).
struct TrackEntities {
    sequence_ids: Vec<String>,
}

/// Live, per-sequence mutable state that keyframes write into each frame: a scratch copy of the
/// sequence's `adjust`/`resource`/plugin `control` maps, seeded from the timeline at
/// `update_tracks` time.
struct LiveSequenceState {
    adjust: Adjust,
    resource: Resource,
    plugin_controls: Vec<HashMap<String, serde_json::Value>>,
}

pub struct Engine {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    width: u32,
    height: u32,

    pool: RenderTargetPool<WgpuTargetAllocator>,
    shaders: ShaderManager,
    expr_cache: ExpressionCache,
    arena: PassArena,
    textures: TextureTable,
    vertex_buffers: VertexBuffers,
    executor: RenderPassExecutor,

    screen_color_texture: wgpu::Texture,
    readback: ReadbackPipeline,

    resources: HashMap<String, RendererResource>,
    renderers: HashMap<String, Renderer>,
    plugin_renderers: HashMap<String, PluginRenderer>,
    transitions: HashMap<String, TransitionRenderer>,
    live_state: HashMap<String, LiveSequenceState>,
    tracks: Vec<TrackEntities>,
}

impl Engine {
    /// One-time setup: the offscreen final-composite target, the double-buffered readback
    /// pipeline, and the shared NDC/screen-space quad buffers.
    pub fn new(device: Arc<wgpu::Device>, queue: Arc<wgpu::Queue>, width: u32, height: u32) -> Self {
        let allocator = WgpuTargetAllocator::new(device.clone());
        let mut pool = RenderTargetPool::new(allocator, DEFAULT_TARGET_NAME);

        let screen_color_texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("engine-screen-target"),
            size: wgpu::Extent3d { width, height, depth_or_array_layers: 1 },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let screen_color_view = screen_color_texture.create_view(&wgpu::TextureViewDescriptor::default());
        pool.set_default_target(RenderTarget {
            color_texture: screen_color_texture.clone(),
            color_view: screen_color_view,
            depth_view: None,
            width,
            height,
        });

        let ndc_quad = crate::entities::resize_ndc_quad_for_plugin((1.0, 1.0), (1.0, 1.0));
        let screen_quad = crate::entities::resize_quad_for_dependency((1.0, 1.0), None);
        let vertex_buffers = VertexBuffers {
            ndc: quad_buffer(&device, "ndc-quad", &ndc_quad),
            screen: quad_buffer(&device, "screen-quad", &screen_quad),
            named: HashMap::new(),
        };

        let executor = RenderPassExecutor::new(device.clone(), queue.clone());
        let textures = TextureTable::new(device.clone());
        let readback = ReadbackPipeline::new(&device, width, height);

        Engine {
            device,
            queue,
            width,
            height,
            pool,
            shaders: ShaderManager::new(),
            expr_cache: ExpressionCache::new(),
            arena: PassArena::new(),
            textures,
            vertex_buffers,
            executor,
            screen_color_texture,
            readback,
            resources: HashMap::new(),
            renderers: HashMap::new(),
            plugin_renderers: HashMap::new(),
            transitions: HashMap::new(),
            live_state: HashMap::new(),
            tracks: Vec::new(),
        }
    }

    fn sequence_target(&self) -> RenderTargetInfo {
        RenderTargetInfo {
            name: SEQUENCE_TARGET_NAME.to_string(),
            width: self.width,
            height: self.height,
            width_expr: None,
            height_expr: None,
        }
    }

    /// Rebuilds every Renderer/PluginRenderer/TransitionRenderer and the Pass DAG from
    /// `timeline`. Discards all entities from the
    /// previous call.
    pub fn update_tracks(&mut self, timeline: &Timeline) {
        self.arena.clear();
        self.resources.clear();
        self.renderers.clear();
        self.plugin_renderers.clear();
        self.transitions.clear();
        self.live_state.clear();
        self.tracks.clear();
        self.vertex_buffers.named.clear();

        self.shaders.install_extended_shaders(timeline.material_data.shaders.clone());

        // Step 2: visible tracks in reverse order determine composite (paint) order.
        for track in timeline.tracks.iter().rev() {
            if !track.visible {
                continue;
            }
            let mut sequence_ids = Vec::with_capacity(track.sequences.len());
            for seq in track.sequences.iter() {
                sequence_ids.push(seq.id.clone());
                self.live_state.insert(
                    seq.id.clone(),
                    LiveSequenceState {
                        adjust: seq.adjust,
                        resource: seq.resource.clone(),
                        plugin_controls: seq.plugins.iter().map(|p| p.control.clone()).collect(),
                    },
                );

                match track.track_type {
                    TrackType::Plugin => self.instantiate_plugin_renderer(timeline, seq),
                    TrackType::Graphic | TrackType::Text => self.instantiate_renderer(timeline, seq),
                }

                if let Some(transition) = &seq.transition {
                    let t = TransitionRenderer::build(
                        &mut self.arena,
                        &transition.id,
                        self.sequence_target(),
                        self.width,
                        self.height,
                    );
                    self.transitions.insert(seq.id.clone(), t);
                }
            }
            self.tracks.push(TrackEntities { sequence_ids });
        }
    }

    fn instantiate_renderer(&mut self, timeline: &Timeline, seq: &Sequence) {
        let resource = match build_resource(seq, timeline.global_render_scale) {
            Ok(r) => r,
            Err(err) => {
                warn!("{err}");
                return;
            }
        };

        let handle = self.textures.upload(
            &self.queue,
            &seq.id,
            resource.source_width(),
            resource.source_height(),
            resource_raster(&resource.backing),
        );
        let mut resource = resource;
        resource.texture = handle;

        let native_geometry = generate_vertices(
            resource.source_width() as f64,
            resource.source_height() as f64,
            resource.rotation_degrees,
        );
        self.vertex_buffers.named.insert(seq.id.clone(), quad_buffer(&self.device, &seq.id, &native_geometry));

        let mut uniforms = HashMap::new();
        uniforms.insert("u_texture".to_string(), Uniform { value: UniformValue::Texture2D(handle), expression: None });
        uniforms.insert("u_modelMatrix".to_string(), Uniform { value: UniformValue::Mat4(crate::entities::mat4_identity()), expression: None });
        uniforms.insert("u_viewMatrix".to_string(), Uniform { value: UniformValue::Mat4(crate::entities::mat4_identity()), expression: None });
        uniforms.insert("u_projectionMatrix".to_string(), Uniform { value: UniformValue::Mat4(crate::entities::mat4_identity()), expression: None });
        uniforms.insert("u_color".to_string(), Uniform { value: UniformValue::Vec4f([1.0, 1.0, 1.0, 1.0]), expression: None });

        let final_pass = Pass {
            pass_name: format!("{}_final", seq.id),
            render_target_info: self.sequence_target(),
            vertex_shader: "builtin/renderer.vert".to_string(),
            fragment_shader: "builtin/color_blit.frag".to_string(),
            attribute_buffer: AttributeBufferRef::Named(seq.id.clone()),
            uniforms,
            clear_color: None,
            clear_mask: None,
        };
        let final_pass_id = self.arena.alloc(final_pass);

        // Step 3/4: a non-empty plugins array gets its effect-chain Pass tree deserialised and
        // spliced in as the final pass's `u_texture`, then each plugin's uniforms/size are
        // initialised via ParamEvaluator.
        if !seq.plugins.is_empty() {
            if let Some(head_id) = self.build_effect_chain(timeline, &seq.id) {
                self.arena.get_mut(final_pass_id).uniforms.insert(
                    "u_texture".to_string(),
                    Uniform { value: UniformValue::MaterialPtr(head_id), expression: None },
                );
                self.initialise_plugin_params(&seq.id, &resource, final_pass_id, &seq.plugins);
            }
        }

        self.renderers.insert(
            seq.id.clone(),
            Renderer {
                name: seq.id.clone(),
                final_pass: final_pass_id,
                transform: transform_from_adjust(&seq.adjust, (self.width as f64, self.height as f64)),
                color: base_color_for_resource(&seq.resource, seq.adjust.opacity),
                resource_rotation_degrees: resource.rotation_degrees,
            },
        );
        self.resources.insert(seq.id.clone(), resource);
    }

    fn instantiate_plugin_renderer(&mut self, timeline: &Timeline, seq: &Sequence) {
        let Some(head_id) = self.build_effect_chain(timeline, &seq.id) else {
            warn!("plugin sequence '{}' has no materialData.materialPasses entry", seq.id);
            return;
        };
        self.initialise_plugin_params(&seq.id, &PluginSourceDims { width: self.width, height: self.height }, head_id, &seq.plugins);
        self.plugin_renderers.insert(
            seq.id.clone(),
            PluginRenderer {
                name: seq.id.clone(),
                pass_head: head_id,
                attribute_buffer: AttributeBufferRef::NdcQuad,
                has_time_uniform: false,
                is_generate_effect: true,
            },
        );
    }

    fn build_effect_chain(&mut self, timeline: &Timeline, sequence_id: &str) -> Option<PassId> {
        let json = timeline.material_data.material_passes.get(sequence_id)?;
        match crate::pass::build_pass_tree(json, &self.textures, &mut self.arena) {
            Ok(id) => Some(id),
            Err(err) => {
                warn!("failed to build effect chain for '{sequence_id}': {err}");
                None
            }
        }
    }

    /// Step 4: for each plugin at index `i`, run ParamEvaluator against every Pass whose name
    /// ends with `_plugin_<i>`.
    fn initialise_plugin_params(
        &mut self,
        sequence_id: &str,
        source: &impl SourceDims,
        chain_head: PassId,
        plugins: &[timeline::Plugin],
    ) {
        let evaluator = ParamEvaluator::new(&self.expr_cache);
        for (i, plugin) in plugins.iter().enumerate() {
            let (source_width, source_height) = if i == 0 {
                (source.width() as f64, source.height() as f64)
            } else {
                let prev_suffix = format!("_plugin_{}", i - 1);
                let prev = collect_passes_with_suffix(&self.arena, chain_head, &prev_suffix);
                match prev.first() {
                    Some(&id) => {
                        let info = &self.arena.get(id).render_target_info;
                        (info.width as f64, info.height as f64)
                    }
                    None => (source.width() as f64, source.height() as f64),
                }
            };

            let vars = evaluator.build_environment(source_width, source_height, &plugin.control);
            let suffix = format!("_plugin_{i}");
            for id in collect_passes_with_suffix(&self.arena, chain_head, &suffix) {
                let pass = self.arena.get_mut(id);
                evaluator.refresh_pass(pass, &vars, sequence_id, &plugin.id);
            }
        }
    }

    /// Opens the encoder, steps global time forward by `timeline.step_time`, and renders/encodes
    /// each frame.
    pub fn play(&mut self, timeline: &Timeline) -> Result<(), EngineError> {
        let mut encoder = FrameEncoder::start(EncoderConfig {
            width: self.width,
            height: self.height,
            fps: timeline.fps,
            m_bit_rate: timeline.m_bit_rate,
            output_path: timeline.output_path.clone(),
        })?;

        let mut t = timeline.start_time;
        while t < timeline.end_time {
            self.render_frame(timeline, t, &mut encoder);
            t += timeline.step_time;
        }

        if let Some(rgba) = self.readback.take_final_pending(&self.device) {
            encoder.push_frame(rgba, t);
        }
        encoder.stop();
        Ok(())
    }

    fn render_frame(&mut self, timeline: &Timeline, t: f64, encoder: &mut FrameEncoder) {
        let mut roots = vec![self.clear_pass()];

        // Cloned up front so each `step_sequence` call can borrow `self` mutably without also
        // holding a borrow of `self.tracks` across the call.
        let tracks: Vec<Vec<String>> = self.tracks.iter().map(|t| t.sequence_ids.clone()).collect();
        for sequence_ids in &tracks {
            for i in 0..sequence_ids.len() {
                let seq_id = &sequence_ids[i];
                let partner_id = transition_partner_index(sequence_ids.len(), i).map(|j| sequence_ids[j].as_str());
                self.step_sequence(timeline, seq_id, partner_id, t, &mut roots);
            }
        }

        roots.push(self.screen_blit_pass());

        self.executor.render(
            &self.arena,
            &roots,
            &mut self.shaders,
            &mut self.pool,
            &self.vertex_buffers,
            &self.textures,
            true,
        );

        self.readback.submit_copy(&self.device, &self.queue, &self.screen_color_texture);
        if let Some(rgba) = self.readback.take_ready(&self.device) {
            encoder.push_frame(rgba, t);
        }
    }

    fn clear_pass(&mut self) -> PassId {
        let pass = Pass {
            pass_name: "__clear_seq".to_string(),
            render_target_info: self.sequence_target(),
            vertex_shader: "builtin/quad.vert".to_string(),
            fragment_shader: "builtin/clear.frag".to_string(),
            attribute_buffer: AttributeBufferRef::NdcQuad,
            uniforms: HashMap::new(),
            clear_color: Some([0.0, 0.0, 0.0, 0.0]),
            clear_mask: Some(crate::pass::ClearMask { color: true, depth: false, stencil: false }),
        };
        self.arena.alloc(pass)
    }

    fn screen_blit_pass(&mut self) -> PassId {
        let mut uniforms = HashMap::new();
        uniforms.insert(
            "u_texture".to_string(),
            Uniform { value: UniformValue::RenderTarget(self.sequence_target()), expression: None },
        );
        let pass = Pass {
            pass_name: "__screen_blit".to_string(),
            render_target_info: RenderTargetInfo {
                name: DEFAULT_TARGET_NAME.to_string(),
                width: self.width,
                height: self.height,
                width_expr: None,
                height_expr: None,
            },
            vertex_shader: "builtin/quad.vert".to_string(),
            fragment_shader: "builtin/blit.frag".to_string(),
            attribute_buffer: AttributeBufferRef::ScreenQuad,
            uniforms,
            clear_color: None,
            clear_mask: None,
        };
        self.arena.alloc(pass)
    }

    fn step_sequence(
        &mut self,
        timeline: &Timeline,
        seq_id: &str,
        partner_id: Option<&str>,
        t: f64,
        roots: &mut Vec<PassId>,
    ) {
        let Some(seq) = find_sequence(timeline, seq_id) else { return };
        let is_visible = track_timing::is_visible(&seq.timer, t);

        if seq.sequence_type != TrackType::Plugin {
            if let Some(resource) = self.resources.get_mut(seq_id) {
                if matches!(resource.backing, ResourceBacking::Video(_)) {
                    let original_time_ms = track_timing::original_time(&seq.timer, t);
                    if let Err(err) = resource.refresh_video_frame(&mut self.textures, &self.queue, original_time_ms / 1000.0) {
                        warn!("{err}");
                    }
                }
            }
        }

        if !is_visible {
            return;
        }

        let sequence_local_t = track_timing::sequence_time(&seq.timer, t);
        if let Some(live) = self.live_state.get_mut(seq_id) {
            let resource_changed =
                apply_adjust_and_resource_keyframes(&mut live.adjust, &mut live.resource, &seq.keyframe, sequence_local_t);

            if resource_changed && seq.sequence_type == TrackType::Text {
                self.rebuild_text_raster(seq_id, &live.resource, timeline.global_render_scale);
            }

            for (i, plugin) in seq.plugins.iter().enumerate() {
                if let Some(controls) = live.plugin_controls.get_mut(i) {
                    apply_control_keyframes(controls, &plugin.keyframe, sequence_local_t);
                }
            }

            let adjust = live.adjust;
            let resource_state = live.resource.clone();
            let plugin_controls = live.plugin_controls.clone();
            self.refresh_renderer(seq_id, &adjust, &resource_state, &seq.plugins, &plugin_controls);
        }

        if let Some(renderer) = self.renderers.get(seq_id) {
            roots.push(renderer.final_pass);
        }

        self.step_transition(seq, partner_id, t, roots);
    }

    fn refresh_renderer(
        &mut self,
        seq_id: &str,
        adjust: &Adjust,
        resource_state: &Resource,
        plugins: &[timeline::Plugin],
        plugin_controls: &[HashMap<String, serde_json::Value>],
    ) {
        let target_size = (self.width as f64, self.height as f64);
        let Some(resource) = self.resources.get(seq_id) else { return };
        let source_dims = (resource.source_width() as f64, resource.source_height() as f64);

        let effect_chain_output_size = {
            let renderer = self.renderers.get(seq_id);
            renderer.and_then(|r| match self.arena.get(r.final_pass).uniforms.get("u_texture") {
                Some(Uniform { value: UniformValue::MaterialPtr(dep), .. }) => {
                    let info = &self.arena.get(*dep).render_target_info;
                    Some((info.width as f64, info.height as f64))
                }
                _ => None,
            })
        };

        if let Some(renderer) = self.renderers.get_mut(seq_id) {
            renderer.transform = transform_from_adjust(adjust, target_size);
            renderer.color = base_color_for_resource(resource_state, adjust.opacity);
            renderer.update_material_uniforms(&mut self.arena, (self.width as f32, self.height as f32));
        }

        if let Some(buffer) = self.vertex_buffers.named.get(seq_id) {
            let quad = resize_quad_for_dependency(source_dims, effect_chain_output_size);
            self.queue.write_buffer(buffer, 0, bytemuck::cast_slice(&quad));
        }

        if !plugins.is_empty() {
            let evaluator = ParamEvaluator::new(&self.expr_cache);
            let Some(renderer) = self.renderers.get(seq_id) else { return };
            let chain_head = match self.arena.get(renderer.final_pass).uniforms.get("u_texture") {
                Some(Uniform { value: UniformValue::MaterialPtr(id), .. }) => *id,
                _ => return,
            };
            for (i, plugin) in plugins.iter().enumerate() {
                let control = plugin_controls.get(i).cloned().unwrap_or_default();
                let vars = evaluator.build_environment(source_dims.0, source_dims.1, &control);
                let suffix = format!("_plugin_{i}");
                for id in collect_passes_with_suffix(&self.arena, chain_head, &suffix) {
                    let pass = self.arena.get_mut(id);
                    evaluator.refresh_pass(pass, &vars, seq_id, &plugin.id);
                }
            }
        }
    }

    /// Bridges `seq` (the outgoing sequence) to `partner_id` (the next sequence on the same
    /// track) through `seq.transition`, if any. While active, both renderers' effect-chain
    /// output targets are redirected to the transition's own dedicated sub-targets so the
    /// transition pass can sample them separately; outside the active window they're restored
    /// to the shared sequence target so normal compositing resumes.
    fn step_transition(&mut self, seq: &Sequence, partner_id: Option<&str>, t: f64, roots: &mut Vec<PassId>) {
        let Some(transition) = &seq.transition else { return };
        let Some(first_pass) = self.renderers.get(&seq.id).map(|r| r.final_pass) else { return };
        let Some(partner_id) = partner_id else { return };
        let Some(second_pass) = self.renderers.get(partner_id).map(|r| r.final_pass) else { return };

        let active = track_timing::transition_is_active(&seq.timer, transition.duration, t);
        let shared_target = self.sequence_target();
        let Some(transition_entity) = self.transitions.get(&seq.id) else { return };

        if !active {
            transition_entity.update_render_target_info(&mut self.arena, first_pass, second_pass, Some(&shared_target));
            return;
        }

        transition_entity.update_render_target_info(&mut self.arena, first_pass, second_pass, None);
        let transition_time_ms = track_timing::transition_time(&seq.timer, transition.duration, t);
        transition_entity.update_time(&mut self.arena, transition_time_ms, transition.duration);

        roots.push(first_pass);
        roots.push(second_pass);
        roots.push(transition_entity.pass);
    }

    fn rebuild_text_raster(&mut self, seq_id: &str, resource_state: &Resource, global_render_scale: f32) {
        let Some(rasterizer) = TEXT_RASTERIZER.with(|cell| cell.borrow().clone()) else { return };
        let font_size = resource_state.font_size as f32 * global_render_scale;
        let fill = resource_state.color.as_deref().and_then(color::parse_hex).unwrap_or(HexColor { r: 255, g: 255, b: 255, a: 255 });
        let stroke = resource_state.stroke_enabled.then(|| {
            let stroke_color = resource_state.stroke_color.as_deref().and_then(color::parse_hex).unwrap_or(HexColor { r: 0, g: 0, b: 0, a: 255 });
            (resource_state.stroke_width * global_render_scale as f64, stroke_color)
        });
        let raster = rasterizer.rasterize(&resource_state.text, font_size, fill, stroke);

        if let Some(resource) = self.resources.get_mut(seq_id) {
            self.textures.write(&self.queue, resource.texture, raster.width, raster.height, &raster.pixels);
        }
    }
}

// A process-wide font rasterizer is awkward to thread through every call site that might
// rebuild a text raster; callers needing a real font install one via `set_text_rasterizer`.
thread_local! {
    static TEXT_RASTERIZER: std::cell::RefCell<Option<Arc<FontdueTextRasterizer>>> = const { std::cell::RefCell::new(None) };
}

pub fn set_text_rasterizer(rasterizer: Arc<FontdueTextRasterizer>) {
    TEXT_RASTERIZER.with(|cell| *cell.borrow_mut() = Some(rasterizer));
}

trait SourceDims {
    fn width(&self) -> u32;
    fn height(&self) -> u32;
}

impl SourceDims for RendererResource {
    fn width(&self) -> u32 {
        self.source_width()
    }
    fn height(&self) -> u32 {
        self.source_height()
    }
}

struct PluginSourceDims {
    width: u32,
    height: u32,
}

impl SourceDims for PluginSourceDims {
    fn width(&self) -> u32 {
        self.width
    }
    fn height(&self) -> u32 {
        self.height
    }
}

fn find_sequence<'a>(timeline: &'a Timeline, seq_id: &str) -> Option<&'a Sequence> {
    timeline.tracks.iter().flat_map(|t: &Track| t.sequences.iter()).find(|s| s.id == seq_id)
}

fn resource_raster(backing: &ResourceBacking) -> &[u8] {
    match backing {
        ResourceBacking::Video(v) => {
            // Safety valve for the initial upload: the first frame hasn't been decoded yet at
            // construction time in this simple model, so upload a transparent placeholder sized
            // to the source's native dimensions; `refresh_video_frame` overwrites it before the
            // first visible frame is drawn.
            let _ = v;
            &[]
        }
        ResourceBacking::Image(i) => i.raster(),
        ResourceBacking::Text { raster } => &raster.pixels,
    }
}

/// Opens/decodes a sequence's backing media. A single failing sequence
/// is reported and dropped (`EngineError::ResourceLoadError`); the caller logs and skips it
/// rather than aborting `update_tracks`.
fn build_resource(seq: &Sequence, global_render_scale: f32) -> Result<RendererResource, EngineError> {
    let backing = match seq.sequence_type {
        TrackType::Text => {
            let rasterizer = TEXT_RASTERIZER
                .with(|cell| cell.borrow().clone())
                .ok_or_else(|| EngineError::ResourceLoadError {
                    sequence_id: seq.id.clone(),
                    source: anyhow::anyhow!("no font rasterizer installed"),
                })?;
            let font_size = seq.resource.font_size as f32 * global_render_scale;
            let fill = seq.resource.color.as_deref().and_then(color::parse_hex).unwrap_or(HexColor { r: 255, g: 255, b: 255, a: 255 });
            let stroke = seq.resource.stroke_enabled.then(|| {
                let c = seq.resource.stroke_color.as_deref().and_then(color::parse_hex).unwrap_or(HexColor { r: 0, g: 0, b: 0, a: 255 });
                (seq.resource.stroke_width * global_render_scale as f64, c)
            });
            let raster = rasterizer.rasterize(&seq.resource.text, font_size, fill, stroke);
            ResourceBacking::Text { raster }
        }
        _ if timeline::is_video_path(&seq.resource.absolute_path) => {
            let source = FfmpegVideoSource::open(&seq.resource.absolute_path)
                .map_err(|source| EngineError::ResourceLoadError { sequence_id: seq.id.clone(), source })?;
            ResourceBacking::Video(Box::new(source))
        }
        _ => {
            let source = StaticImageSource::open(&seq.resource.absolute_path)
                .map_err(|source| EngineError::ResourceLoadError { sequence_id: seq.id.clone(), source })?;
            ResourceBacking::Image(Box::new(source))
        }
    };

    Ok(RendererResource { resource_id: seq.id.clone(), rotation_degrees: 0.0, texture: 0, backing })
}

/// Double-buffered PBO-equivalent readback: frame N's copy is
/// submitted while frame N-1's mapped bytes are handed to the encoder, overlapping GPU
/// readback latency with encoder ingestion.
struct ReadbackPipeline {
    buffers: [wgpu::Buffer; 2],
    width: u32,
    height: u32,
    padded_bytes_per_row: u32,
    current: usize,
    /// Slot whose copy completed a full call ago and is safe to map now.
    pending: Option<usize>,
    /// Slot `submit_copy` just wrote into this call; promoted to `pending` by `take_ready` only
    /// after the previous `pending` slot has been consumed, keeping the two exactly one frame
    /// apart.
    just_submitted: Option<usize>,
}

impl ReadbackPipeline {
    fn new(device: &wgpu::Device, width: u32, height: u32) -> Self {
        let padded_bytes_per_row = align_up(width * 4, wgpu::COPY_BYTES_PER_ROW_ALIGNMENT);
        let size = (padded_bytes_per_row * height) as u64;
        let make = |label| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size,
                usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
                mapped_at_creation: false,
            })
        };
        ReadbackPipeline {
            buffers: [make("readback-0"), make("readback-1")],
            width,
            height,
            padded_bytes_per_row,
            current: 0,
            pending: None,
            just_submitted: None,
        }
    }

    /// Submits this frame's GPU copy into `buffers[current]` and flips `current` for next call.
    /// Does not touch `pending` yet: `take_ready` promotes `just_submitted` to `pending` only
    /// after it has consumed whatever `pending` already held, so the slot submitted this frame
    /// isn't mapped until the *next* call — overlapping this frame's copy with the previous
    /// frame's readback.
    fn submit_copy(&mut self, device: &wgpu::Device, queue: &wgpu::Queue, source: &wgpu::Texture) {
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("readback-copy") });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo { texture: source, mip_level: 0, origin: wgpu::Origin3d::ZERO, aspect: wgpu::TextureAspect::All },
            wgpu::TexelCopyBufferInfo {
                buffer: &self.buffers[self.current],
                layout: wgpu::TexelCopyBufferLayout { offset: 0, bytes_per_row: Some(self.padded_bytes_per_row), rows_per_image: Some(self.height) },
            },
            wgpu::Extent3d { width: self.width, height: self.height, depth_or_array_layers: 1 },
        );
        queue.submit(std::iter::once(encoder.finish()));
        self.just_submitted = Some(self.current);
        self.current = 1 - self.current;
    }

    /// Maps the slot made pending on a *previous* call (if any), extracts tightly-packed RGBA8
    /// bytes, and unmaps it; promotes this call's freshly submitted slot to `pending` for next
    /// time.
    fn take_ready(&mut self, device: &wgpu::Device) -> Option<Vec<u8>> {
        let slot = self.pending.take();
        self.pending = self.just_submitted.take();
        Some(self.map_and_extract(device, slot?))
    }

    fn take_final_pending(&mut self, device: &wgpu::Device) -> Option<Vec<u8>> {
        self.take_ready(device)
    }

    fn map_and_extract(&self, device: &wgpu::Device, slot: usize) -> Vec<u8> {
        let buffer = &self.buffers[slot];
        let slice = buffer.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        device.poll(wgpu::PollType::Wait).ok();
        rx.recv().ok();

        let data = slice.get_mapped_range();
        let row_bytes = (self.width * 4) as usize;
        let mut out = Vec::with_capacity(row_bytes * self.height as usize);
        for row in 0..self.height as usize {
            let start = row * self.padded_bytes_per_row as usize;
            out.extend_from_slice(&data[start..start + row_bytes]);
        }
        drop(data);
        buffer.unmap();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeline::Point2;

    #[test]
    fn align_up_rounds_to_next_multiple() {
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(257, 256), 512);
    }

    #[test]
    fn transform_inverts_y_and_scales_by_target_size() {
        let adjust = Adjust { transform: Point2 { x: 0.5, y: 0.25 }, rotate: 0.0, scale: Point2 { x: 1.0, y: 1.0 }, opacity: 1.0 };
        let t = transform_from_adjust(&adjust, (1920.0, 1080.0));
        assert_eq!(t.position, (960.0, -270.0));
    }

    #[test]
    fn base_color_defaults_to_white_and_opacity_modulates_alpha() {
        let resource = Resource::default();
        let color = base_color_for_resource(&resource, 0.5);
        assert_eq!(color, [1.0, 1.0, 1.0, 0.5]);
    }

    #[test]
    fn base_color_uses_resource_hex_when_present() {
        let resource = Resource { color: Some("#ff0000ff".to_string()), ..Resource::default() };
        let color = base_color_for_resource(&resource, 1.0);
        assert_eq!(color[0], 1.0);
        assert_eq!(color[1], 0.0);
    }

    #[test]
    fn transition_partner_is_the_next_sequence_unless_last() {
        assert_eq!(transition_partner_index(3, 0), Some(1));
        assert_eq!(transition_partner_index(3, 1), Some(2));
        assert_eq!(transition_partner_index(3, 2), None);
    }
}
