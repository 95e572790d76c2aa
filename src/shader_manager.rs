//! ShaderManager: compiles, links, and caches GPU programs by `(vertex_key, fragment_key)`
//! identity.
//!
//! `wgpu` consumes WGSL, not GLSL, so the "compile" step is naga-based: built-in shader sources
//! are already WGSL and go straight to `wgpu::Device::create_shader_module`; user-extended
//! sources are GLSL and are translated to WGSL first via `naga::front::glsl`, the same pattern
//! used for GLSL->WGSL translation elsewhere in this codebase.

use std::collections::HashMap;
use std::sync::Arc;

use log::warn;

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

/// One linked GPU program: a compiled vertex module paired with a compiled fragment module.
/// `wgpu` has no single "program" object the way a GL link step does, so this struct stands in
/// for that identity — it's what the cache stores and what `RenderPassExecutor` binds into a
/// pipeline descriptor.
#[derive(Clone)]
pub struct CompiledProgram {
    pub vertex: Arc<wgpu::ShaderModule>,
    pub fragment: Arc<wgpu::ShaderModule>,
    /// Reflected `@group(0)` bindings of *both* stages, keyed by the WGSL identifier name
    /// (`u_texture`, `u_modelMatrix`, `u_time`, ...). `RenderPassExecutor` uses this instead of a
    /// fixed binding scheme, since the built-in shaders (blit vs. transition vs. the MVP-transform
    /// renderer pass) don't share one — each pass resolves its uniforms dynamically by name
    /// against whichever program it's bound to. Vertex- and fragment-stage bindings share one
    /// `@group(0)` bind group, so their binding indices must not collide within a program.
    pub bindings: Arc<Vec<BindingInfo>>,
}

/// One `@group(0) @binding(n)` global, reflected from a compiled WGSL module.
#[derive(Debug, Clone)]
pub struct BindingInfo {
    pub name: String,
    pub binding: u32,
    pub kind: BindingKind,
    /// Which stage's module this binding was reflected from, so the pipeline's bind-group-layout
    /// entry can declare the narrowest `wgpu::ShaderStages` visibility instead of assuming every
    /// binding is fragment-only.
    pub stage: ShaderStage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingKind {
    Texture,
    Sampler,
    /// A `var<uniform>` struct; `size_bytes` is its naga-computed layout size, used to size the
    /// backing `wgpu::Buffer`.
    Uniform { size_bytes: u32 },
}

/// Reflects a WGSL source's `@group(0) @binding(n) var ...` declarations into [`BindingInfo`]s.
///
/// This is a lightweight textual scan rather than a full `naga::Module` walk: the validator
/// already rejects anything malformed before this runs (`compile_module`), so by the time this
/// sees the source it only has to recognise the three declaration shapes this engine's shaders
/// ever use (`texture_2d<f32>`, `sampler`, `var<uniform> name: Struct`). Declarations outside
/// `@group(0)`, or without an explicit `@binding`, are skipped.
fn reflect_group_zero_bindings(wgsl_source: &str, stage: ShaderStage) -> Vec<BindingInfo> {
    let mut out = Vec::new();
    for line in wgsl_source.lines() {
        let line = line.trim();
        if !line.starts_with("@group(0)") {
            continue;
        }
        let Some(binding_start) = line.find("@binding(") else { continue };
        let after = &line[binding_start + "@binding(".len()..];
        let Some(close) = after.find(')') else { continue };
        let Ok(binding) = after[..close].trim().parse::<u32>() else { continue };

        let Some(var_pos) = line.find("var") else { continue };
        let rest = line[var_pos + 3..].trim_start();
        let rest = rest.strip_prefix("<uniform>").unwrap_or(rest).trim_start();
        let Some(colon) = rest.find(':') else { continue };
        let name = rest[..colon].trim().to_string();
        let ty = rest[colon + 1..].trim_end_matches(';').trim();

        let kind = if ty.starts_with("texture_") {
            BindingKind::Texture
        } else if ty.starts_with("sampler") {
            BindingKind::Sampler
        } else {
            // A generous fixed size: this engine's uniform blocks are a handful of scalars,
            // vectors, and at most one mat4 — comfortably under one 256-byte dynamic-offset page.
            BindingKind::Uniform { size_bytes: 256 }
        };
        out.push(BindingInfo { name, binding, kind, stage });
    }
    out
}

/// Resolves shader source text and compiled GPU programs by key, caching both.
pub struct ShaderManager {
    embedded: HashMap<&'static str, &'static str>,
    extended: HashMap<String, String>,
    programs: HashMap<String, CompiledProgram>,
}

fn program_cache_key(vertex_key: &str, fragment_key: &str) -> String {
    format!("{vertex_key}|{fragment_key}")
}

/// Prepended to every shader's source before compilation, regardless of which branch (embedded
/// or extended) it came from.
fn stage_header(stage: ShaderStage) -> &'static str {
    match stage {
        ShaderStage::Vertex => "// shader-stage: vertex\n",
        ShaderStage::Fragment => "// shader-stage: fragment\n",
    }
}

impl ShaderManager {
    pub fn new() -> Self {
        ShaderManager {
            embedded: builtin_shaders(),
            extended: HashMap::new(),
            programs: HashMap::new(),
        }
    }

    /// Installs (or replaces) the timeline's "extend shaders" map. Any previously compiled
    /// program is invalidated, since we can't cheaply tell whether its source actually changed.
    pub fn install_extended_shaders(&mut self, shaders: HashMap<String, String>) {
        self.extended = shaders;
        self.programs.clear();
    }

    /// Resolves the linked program for `(vertex_key, fragment_key)`, compiling and caching it on
    /// first use. A compile failure is never fatal to the caller's frame: it's returned as an
    /// `Err` so `RenderPassExecutor` can skip the owning Pass and keep going.
    pub fn resolve(
        &mut self,
        device: &wgpu::Device,
        pass_name: &str,
        vertex_key: &str,
        fragment_key: &str,
    ) -> Result<CompiledProgram, EngineError> {
        let cache_key = program_cache_key(vertex_key, fragment_key);
        if let Some(program) = self.programs.get(&cache_key) {
            return Ok(program.clone());
        }

        let (vertex, vertex_bindings) = self
            .compile_module_with_bindings(device, vertex_key, ShaderStage::Vertex)
            .map_err(|message| EngineError::ShaderCompileError {
                pass_name: pass_name.to_string(),
                vertex_key: vertex_key.to_string(),
                fragment_key: fragment_key.to_string(),
                message,
            })?;
        let (fragment, fragment_bindings) = self
            .compile_module_with_bindings(device, fragment_key, ShaderStage::Fragment)
            .map_err(|message| EngineError::ShaderCompileError {
                pass_name: pass_name.to_string(),
                vertex_key: vertex_key.to_string(),
                fragment_key: fragment_key.to_string(),
                message,
            })?;

        let bindings: Vec<BindingInfo> = vertex_bindings.into_iter().chain(fragment_bindings).collect();
        let program = CompiledProgram {
            vertex: Arc::new(vertex),
            fragment: Arc::new(fragment),
            bindings: Arc::new(bindings),
        };
        self.programs.insert(cache_key, program.clone());
        Ok(program)
    }

    fn compile_module_with_bindings(
        &self,
        device: &wgpu::Device,
        key: &str,
        stage: ShaderStage,
    ) -> Result<(wgpu::ShaderModule, Vec<BindingInfo>), String> {
        let wgsl_source = self.resolve_wgsl_source(key, stage)?;
        // Validate through naga before handing it to wgpu, so a bad translation surfaces as a
        // compile error attributed to this shader key rather than an opaque wgpu panic.
        naga::front::wgsl::parse_str(&wgsl_source)
            .map_err(|e| format!("WGSL validation failed for '{key}': {e}"))?;
        let bindings = reflect_group_zero_bindings(&wgsl_source, stage);

        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(key),
            source: wgpu::ShaderSource::Wgsl(wgsl_source.into()),
        });
        Ok((module, bindings))
    }

    fn resolve_wgsl_source(&self, key: &str, stage: ShaderStage) -> Result<String, String> {
        if let Some(&wgsl) = self.embedded.get(key) {
            return Ok(format!("{}{}", stage_header(stage), wgsl));
        }

        if let Some(glsl) = self.extended.get(key) {
            let wgsl = glsl_to_wgsl(glsl, stage)?;
            return Ok(format!("{}{}", stage_header(stage), wgsl));
        }

        Err(format!("unknown shader key '{key}'"))
    }
}

impl Default for ShaderManager {
    fn default() -> Self {
        Self::new()
    }
}

fn glsl_to_wgsl(source: &str, stage: ShaderStage) -> Result<String, String> {
    let shader_stage = match stage {
        ShaderStage::Vertex => naga::ShaderStage::Vertex,
        ShaderStage::Fragment => naga::ShaderStage::Fragment,
    };

    let mut parser = naga::front::glsl::Frontend::default();
    let options = naga::front::glsl::Options {
        stage: shader_stage,
        defines: Default::default(),
    };

    let module = parser
        .parse(&options, source)
        .map_err(|e| format!("GLSL parse failed: {e:?}"))?;

    let info = naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    )
    .validate(&module)
    .map_err(|e| format!("GLSL validation failed: {e:?}"))?;

    naga::back::wgsl::write_string(&module, &info, naga::back::wgsl::WriterFlags::EXPLICIT_TYPES)
        .map_err(|e| format!("WGSL writer failed: {e:?}"))
}

/// Logs and swallows a shader compile failure, "never fatal" policy.
pub fn log_skipped_pass(pass_name: &str, err: &EngineError) {
    warn!("skipping pass '{pass_name}' for this frame: {err}");
}

/// Built-in WGSL shaders, keyed by opaque name, always available regardless of what the
/// timeline's "extend shaders" map supplies.
fn builtin_shaders() -> HashMap<&'static str, &'static str> {
    let mut map = HashMap::new();
    map.insert(
        "builtin/quad.vert",
        r#"
struct VertexOut {
    @builtin(position) position: vec4<f32>,
    @location(0) uv: vec2<f32>,
};

@vertex
fn vs_main(@location(0) pos: vec3<f32>, @location(1) uv: vec2<f32>) -> VertexOut {
    var out: VertexOut;
    out.position = vec4<f32>(pos, 1.0);
    out.uv = uv;
    return out;
}
"#,
    );
    map.insert(
        "builtin/blit.frag",
        r#"
@group(0) @binding(0) var u_texture: texture_2d<f32>;
@group(0) @binding(1) var u_sampler: sampler;

@fragment
fn fs_main(@location(0) uv: vec2<f32>) -> @location(0) vec4<f32> {
    return textureSample(u_texture, u_sampler, uv);
}
"#,
    );
    map.insert(
        "builtin/renderer.vert",
        r#"
struct VertexOut {
    @builtin(position) position: vec4<f32>,
    @location(0) uv: vec2<f32>,
};

@group(0) @binding(3) var<uniform> u_modelMatrix: mat4x4<f32>;
@group(0) @binding(4) var<uniform> u_viewMatrix: mat4x4<f32>;
@group(0) @binding(5) var<uniform> u_projectionMatrix: mat4x4<f32>;

@vertex
fn vs_main(@location(0) pos: vec3<f32>, @location(1) uv: vec2<f32>) -> VertexOut {
    var out: VertexOut;
    out.position = u_projectionMatrix * u_viewMatrix * u_modelMatrix * vec4<f32>(pos, 1.0);
    out.uv = uv;
    return out;
}
"#,
    );
    map.insert(
        "builtin/transition.frag",
        r#"
@group(0) @binding(0) var u_firstTexture: texture_2d<f32>;
@group(0) @binding(1) var u_secondTexture: texture_2d<f32>;
@group(0) @binding(2) var u_sampler: sampler;
@group(0) @binding(3) var<uniform> u_time: f32;

@fragment
fn fs_main(@location(0) uv: vec2<f32>) -> @location(0) vec4<f32> {
    let a = textureSample(u_firstTexture, u_sampler, uv);
    let b = textureSample(u_secondTexture, u_sampler, uv);
    return mix(a, b, clamp(u_time, 0.0, 1.0));
}
"#,
    );
    // Renderer's resource blit, modulated by `u_color`; pairs with `builtin/renderer.vert`, which
    // carries the model/view/projection transform the renderer writes each frame.
    map.insert(
        "builtin/color_blit.frag",
        r#"
@group(0) @binding(0) var u_texture: texture_2d<f32>;
@group(0) @binding(1) var u_sampler: sampler;
@group(0) @binding(2) var<uniform> u_color: vec4<f32>;

@fragment
fn fs_main(@location(0) uv: vec2<f32>) -> @location(0) vec4<f32> {
    return textureSample(u_texture, u_sampler, uv) * u_color;
}
"#,
    );
    // No bindings at all: `Engine` uses this once per frame to clear the shared output target
    // to transparent before any sequence blits onto it.
    map.insert(
        "builtin/clear.frag",
        r#"
@fragment
fn fs_main(@location(0) uv: vec2<f32>) -> @location(0) vec4<f32> {
    return vec4<f32>(0.0, 0.0, 0.0, 0.0);
}
"#,
    );
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glsl_fragment_translates_to_valid_wgsl() {
        let glsl = r#"
#version 330 core
out vec4 fragColor;
void main() {
    fragColor = vec4(1.0, 0.0, 0.0, 1.0);
}
"#;
        let wgsl = glsl_to_wgsl(glsl, ShaderStage::Fragment).expect("translation should succeed");
        assert!(naga::front::wgsl::parse_str(&wgsl).is_ok());
    }

    #[test]
    fn unknown_shader_key_is_an_error() {
        let manager = ShaderManager::new();
        let result = manager.resolve_wgsl_source("does/not/exist.frag", ShaderStage::Fragment);
        assert!(result.is_err());
    }

    #[test]
    fn embedded_source_gets_stage_header_prepended() {
        let manager = ShaderManager::new();
        let source = manager
            .resolve_wgsl_source("builtin/blit.frag", ShaderStage::Fragment)
            .unwrap();
        assert!(source.starts_with("// shader-stage: fragment\n"));
    }

    #[test]
    fn reflects_blit_fragment_bindings_by_name() {
        let manager = ShaderManager::new();
        let source = manager.resolve_wgsl_source("builtin/blit.frag", ShaderStage::Fragment).unwrap();
        let bindings = reflect_group_zero_bindings(&source, ShaderStage::Fragment);
        assert!(bindings.iter().any(|b| b.name == "u_texture" && b.binding == 0 && b.kind == BindingKind::Texture));
        assert!(bindings.iter().any(|b| b.name == "u_sampler" && b.binding == 1 && b.kind == BindingKind::Sampler));
    }

    #[test]
    fn reflects_transition_fragment_uniform_binding() {
        let manager = ShaderManager::new();
        let source = manager.resolve_wgsl_source("builtin/transition.frag", ShaderStage::Fragment).unwrap();
        let bindings = reflect_group_zero_bindings(&source, ShaderStage::Fragment);
        assert!(bindings
            .iter()
            .any(|b| b.name == "u_time" && b.binding == 3 && matches!(b.kind, BindingKind::Uniform { .. })));
    }

    #[test]
    fn reflects_renderer_vertex_matrix_bindings_tagged_with_vertex_stage() {
        let manager = ShaderManager::new();
        let source = manager.resolve_wgsl_source("builtin/renderer.vert", ShaderStage::Vertex).unwrap();
        let bindings = reflect_group_zero_bindings(&source, ShaderStage::Vertex);
        for name in ["u_modelMatrix", "u_viewMatrix", "u_projectionMatrix"] {
            assert!(bindings
                .iter()
                .any(|b| b.name == name && b.stage == ShaderStage::Vertex && matches!(b.kind, BindingKind::Uniform { .. })));
        }
    }

    #[test]
    fn installing_extended_shaders_replaces_the_map_and_drops_cached_programs() {
        let mut manager = ShaderManager::new();
        manager.install_extended_shaders(HashMap::from([(
            "user/foo.frag".to_string(),
            "#version 330 core\nvoid main() {}".to_string(),
        )]));
        assert!(manager.programs.is_empty());
        assert!(manager.extended.contains_key("user/foo.frag"));

        manager.install_extended_shaders(HashMap::new());
        assert!(!manager.extended.contains_key("user/foo.frag"));
    }
}
