//! Pass/Material data model: the arena-indexed render-pass DAG.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;

use crate::error::EngineError;

/// Opaque handle into the texture side-table owned by the resource layer: a stable id addressing
/// a side table of GPU textures, which lets a resource's texture be hot-swapped (e.g. after a
/// video re-decode) without walking every Pass that references it.
pub type TextureHandle = u64;

/// Logical identity of an offscreen render target.
///
/// `width_expr`/`height_expr` are parsed together or not at all: the wire format only ever
/// carries the pair (`widthExpress`/`heightExpress`); an object with only one of the two keys
/// present is treated as carrying neither.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderTargetInfo {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub width_expr: Option<String>,
    pub height_expr: Option<String>,
}

impl RenderTargetInfo {
    /// Key under which the `RenderTargetPool` indexes this info.
    pub fn pool_key(&self) -> String {
        format!("{}_{}x{}", self.name, self.width, self.height)
    }
}

/// Index into a [`PassArena`]: an arena handle rather than a pointer graph between Passes, so
/// dependency edges between Passes are plain integer references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PassId(pub u32);

/// One draw invocation's uniform value.
#[derive(Debug, Clone, PartialEq)]
pub enum UniformValue {
    Int(i32),
    Float(f64),
    Bool(bool),
    Vec2i([i32; 2]),
    Vec3i([i32; 3]),
    Vec2f([f32; 2]),
    Vec3f([f32; 3]),
    Vec4f([f32; 4]),
    Mat4([f32; 16]),
    Texture2D(TextureHandle),
    MaterialPtr(PassId),
    RenderTarget(RenderTargetInfo),
}

/// A uniform slot: current value plus an optional driving expression.
/// If `expression` is non-empty, `value` is rebuilt from it each frame before the Pass executes.
#[derive(Debug, Clone)]
pub struct Uniform {
    pub value: UniformValue,
    pub expression: Option<String>,
}

/// Which shared/named vertex buffer a Pass draws from.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeBufferRef {
    /// `"bufferResourceId:sreenBuffer"` — the screen-space quad. That misspelling is the wire
    /// contract, not a typo to correct.
    ScreenQuad,
    /// `"bufferResourceId:ndcBuffer"` — the NDC quad.
    NdcQuad,
    /// `"bufferResourceId:<id>"` — a named renderer resource's own vertex data.
    Named(String),
}

pub fn parse_attribute_buffer_ref(raw: &str) -> AttributeBufferRef {
    match raw.strip_prefix("bufferResourceId:") {
        Some("sreenBuffer") => AttributeBufferRef::ScreenQuad,
        Some("ndcBuffer") => AttributeBufferRef::NdcQuad,
        Some(id) => AttributeBufferRef::Named(id.to_string()),
        None => AttributeBufferRef::Named(raw.to_string()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClearMask {
    pub color: bool,
    pub depth: bool,
    pub stencil: bool,
}

/// One draw invocation. Behaviour is imposed by consumers
/// (`RenderPassExecutor`, `ParamEvaluator`) — this is a plain data record.
#[derive(Debug, Clone)]
pub struct Pass {
    pub pass_name: String,
    pub render_target_info: RenderTargetInfo,
    pub vertex_shader: String,
    pub fragment_shader: String,
    pub attribute_buffer: AttributeBufferRef,
    pub uniforms: HashMap<String, Uniform>,
    pub clear_color: Option<[f32; 4]>,
    pub clear_mask: Option<ClearMask>,
}

/// Owns every `Pass` built for the current frame set; passes reference each other by
/// [`PassId`] rather than by pointer.
#[derive(Debug, Default)]
pub struct PassArena {
    passes: Vec<Pass>,
}

impl PassArena {
    pub fn new() -> Self {
        PassArena { passes: Vec::new() }
    }

    pub fn alloc(&mut self, pass: Pass) -> PassId {
        let id = PassId(self.passes.len() as u32);
        self.passes.push(pass);
        id
    }

    pub fn get(&self, id: PassId) -> &Pass {
        &self.passes[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: PassId) -> &mut Pass {
        &mut self.passes[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.passes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }

    pub fn clear(&mut self) {
        self.passes.clear();
    }
}

impl Pass {
    /// Every other Pass this one directly depends on through a `MaterialPtr` uniform. Used by
    /// both `ParamEvaluator`'s effect-chain walk and `RenderPassExecutor`'s dependency-first
    /// traversal.
    pub fn material_ptr_dependencies(&self) -> impl Iterator<Item = PassId> + '_ {
        self.uniforms.values().filter_map(|u| match u.value {
            UniformValue::MaterialPtr(id) => Some(id),
            _ => None,
        })
    }
}

// --- Wire format ------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct RenderTargetInfoJson {
    pub name: String,
    pub width: u32,
    pub height: u32,
    #[serde(rename = "widthExpress", default)]
    pub width_express: Option<String>,
    #[serde(rename = "heightExpress", default)]
    pub height_express: Option<String>,
}

impl From<RenderTargetInfoJson> for RenderTargetInfo {
    fn from(json: RenderTargetInfoJson) -> Self {
        let (width_expr, height_expr) = match (json.width_express, json.height_express) {
            (Some(w), Some(h)) => (Some(w), Some(h)),
            _ => (None, None),
        };
        RenderTargetInfo {
            name: json.name,
            width: json.width,
            height: json.height,
            width_expr,
            height_expr,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UniformJson {
    #[serde(rename = "type")]
    pub value_type: String,
    pub value: Value,
    #[serde(default)]
    pub express: Option<String>,
}

/// The `MaterialPass` wire format. `uniforms["u_texture"]`'s `sampler2D`
/// value may recursively nest another `PassJson`, a `{name,width,height}` render-target
/// reference, or a `"textureResourceId:<id>"` string — see [`build_pass_tree`].
#[derive(Debug, Clone, Deserialize)]
pub struct PassJson {
    #[serde(rename = "passName")]
    pub pass_name: String,
    #[serde(rename = "renderTarget")]
    pub render_target: RenderTargetInfoJson,
    #[serde(rename = "vertexShader")]
    pub vertex_shader: String,
    #[serde(rename = "fragmentShader")]
    pub fragment_shader: String,
    #[serde(rename = "attributeBuffer")]
    pub attribute_buffer: String,
    #[serde(default)]
    pub uniforms: HashMap<String, UniformJson>,
}

/// Resolves a `"textureResourceId:<id>"` string to the GPU texture handle backing it. Passed
/// by reference into [`build_pass_tree`] so the Pass layer never needs to know how resources
/// are stored.
pub trait ResourceTextureLookup {
    fn lookup(&self, resource_id: &str) -> Option<TextureHandle>;
}

/// Recursively deserialises a `PassJson` tree into the arena, returning the root [`PassId`].
///
/// A malformed nested Pass (missing `passName`/`vertexShader`/`fragmentShader`) or an
/// unresolvable texture-resource reference surfaces as an `Err`; the
/// caller is expected to log this and fall back to the sequence's bare resource texture,
/// rather than aborting the whole `update_tracks` call.
pub fn build_pass_tree(
    json: &PassJson,
    resources: &impl ResourceTextureLookup,
    arena: &mut PassArena,
) -> Result<PassId, EngineError> {
    let render_target_info = RenderTargetInfo::from(json.render_target.clone());
    let attribute_buffer = parse_attribute_buffer_ref(&json.attribute_buffer);

    let mut uniforms = HashMap::with_capacity(json.uniforms.len());
    for (name, uniform_json) in &json.uniforms {
        let value = build_uniform_value(name, uniform_json, resources, arena)?;
        uniforms.insert(
            name.clone(),
            Uniform {
                value,
                expression: uniform_json.express.clone(),
            },
        );
    }

    let pass = Pass {
        pass_name: json.pass_name.clone(),
        render_target_info,
        vertex_shader: json.vertex_shader.clone(),
        fragment_shader: json.fragment_shader.clone(),
        attribute_buffer,
        uniforms,
        clear_color: None,
        clear_mask: None,
    };
    Ok(arena.alloc(pass))
}

fn build_uniform_value(
    uniform_name: &str,
    uniform_json: &UniformJson,
    resources: &impl ResourceTextureLookup,
    arena: &mut PassArena,
) -> Result<UniformValue, EngineError> {
    match uniform_json.value_type.as_str() {
        "int" => Ok(UniformValue::Int(json_as_i64(&uniform_json.value, uniform_name)? as i32)),
        "float" => Ok(UniformValue::Float(json_as_f64(&uniform_json.value, uniform_name)?)),
        "bool" => Ok(UniformValue::Bool(uniform_json.value.as_bool().unwrap_or(false))),
        "vec2" => Ok(UniformValue::Vec2f(json_as_f32_array(&uniform_json.value, uniform_name)?)),
        "vec3" => Ok(UniformValue::Vec3f(json_as_f32_array(&uniform_json.value, uniform_name)?)),
        "vec4" => Ok(UniformValue::Vec4f(json_as_f32_array(&uniform_json.value, uniform_name)?)),
        "ivec2" => Ok(UniformValue::Vec2i(json_as_i32_array(&uniform_json.value, uniform_name)?)),
        "ivec3" => Ok(UniformValue::Vec3i(json_as_i32_array(&uniform_json.value, uniform_name)?)),
        "mat4" => Ok(UniformValue::Mat4(json_as_f32_array::<16>(&uniform_json.value, uniform_name)?)),
        "sampler2D" => build_sampler_value(uniform_name, &uniform_json.value, resources, arena),
        other => Err(EngineError::InputParseError(format!(
            "unknown uniform type '{other}' for uniform '{uniform_name}'"
        ))),
    }
}

fn build_sampler_value(
    uniform_name: &str,
    value: &Value,
    resources: &impl ResourceTextureLookup,
    arena: &mut PassArena,
) -> Result<UniformValue, EngineError> {
    match value {
        Value::String(s) => {
            let resource_id = s.strip_prefix("textureResourceId:").unwrap_or(s);
            let handle = resources.lookup(resource_id).ok_or_else(|| {
                EngineError::InputParseError(format!(
                    "unknown texture resource '{resource_id}' for uniform '{uniform_name}'"
                ))
            })?;
            Ok(UniformValue::Texture2D(handle))
        }
        Value::Object(map) if map.contains_key("passName") => {
            let nested: PassJson = serde_json::from_value(value.clone())
                .map_err(|e| EngineError::InputParseError(e.to_string()))?;
            let child_id = build_pass_tree(&nested, resources, arena)?;
            Ok(UniformValue::MaterialPtr(child_id))
        }
        Value::Object(map) if map.contains_key("name") => {
            let name = map
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let width = map.get("width").and_then(Value::as_u64).unwrap_or(0) as u32;
            let height = map.get("height").and_then(Value::as_u64).unwrap_or(0) as u32;
            Ok(UniformValue::RenderTarget(RenderTargetInfo {
                name,
                width,
                height,
                width_expr: None,
                height_expr: None,
            }))
        }
        other => Err(EngineError::InputParseError(format!(
            "unrecognised sampler2D value for uniform '{uniform_name}': {other}"
        ))),
    }
}

fn json_as_f64(value: &Value, uniform_name: &str) -> Result<f64, EngineError> {
    value.as_f64().ok_or_else(|| {
        EngineError::InputParseError(format!(
            "expected a number for uniform '{uniform_name}', got {value}"
        ))
    })
}

fn json_as_i64(value: &Value, uniform_name: &str) -> Result<i64, EngineError> {
    value.as_i64().ok_or_else(|| {
        EngineError::InputParseError(format!(
            "expected an integer for uniform '{uniform_name}', got {value}"
        ))
    })
}

fn json_as_f32_array<const N: usize>(
    value: &Value,
    uniform_name: &str,
) -> Result<[f32; N], EngineError> {
    let arr = value.as_array().ok_or_else(|| {
        EngineError::InputParseError(format!(
            "expected an array of {N} numbers for uniform '{uniform_name}', got {value}"
        ))
    })?;
    if arr.len() != N {
        return Err(EngineError::InputParseError(format!(
            "uniform '{uniform_name}' expected {N} components, got {}",
            arr.len()
        )));
    }
    let mut out = [0f32; N];
    for (i, v) in arr.iter().enumerate() {
        out[i] = json_as_f64(v, uniform_name)? as f32;
    }
    Ok(out)
}

fn json_as_i32_array<const N: usize>(
    value: &Value,
    uniform_name: &str,
) -> Result<[i32; N], EngineError> {
    let arr = value.as_array().ok_or_else(|| {
        EngineError::InputParseError(format!(
            "expected an array of {N} integers for uniform '{uniform_name}', got {value}"
        ))
    })?;
    if arr.len() != N {
        return Err(EngineError::InputParseError(format!(
            "uniform '{uniform_name}' expected {N} components, got {}",
            arr.len()
        )));
    }
    let mut out = [0i32; N];
    for (i, v) in arr.iter().enumerate() {
        out[i] = json_as_i64(v, uniform_name)? as i32;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct NoTextures;
    impl ResourceTextureLookup for NoTextures {
        fn lookup(&self, _resource_id: &str) -> Option<TextureHandle> {
            None
        }
    }

    struct OneTexture(&'static str, TextureHandle);
    impl ResourceTextureLookup for OneTexture {
        fn lookup(&self, resource_id: &str) -> Option<TextureHandle> {
            (resource_id == self.0).then_some(self.1)
        }
    }

    fn leaf_pass_json(name: &str) -> Value {
        json!({
            "passName": name,
            "renderTarget": {"name": "seq", "width": 1920, "height": 1080},
            "vertexShader": "default.vert",
            "fragmentShader": "default.frag",
            "attributeBuffer": "bufferResourceId:ndcBuffer",
            "uniforms": {}
        })
    }

    #[test]
    fn attribute_buffer_parsing_matches_wire_spellings() {
        assert_eq!(
            parse_attribute_buffer_ref("bufferResourceId:sreenBuffer"),
            AttributeBufferRef::ScreenQuad
        );
        assert_eq!(
            parse_attribute_buffer_ref("bufferResourceId:ndcBuffer"),
            AttributeBufferRef::NdcQuad
        );
        assert_eq!(
            parse_attribute_buffer_ref("bufferResourceId:abc123"),
            AttributeBufferRef::Named("abc123".to_string())
        );
    }

    #[test]
    fn render_target_info_requires_both_expressions_or_neither() {
        let both: RenderTargetInfoJson = serde_json::from_value(json!({
            "name": "seq", "width": 100, "height": 200,
            "widthExpress": "sourceWidth", "heightExpress": "sourceHeight"
        }))
        .unwrap();
        let info: RenderTargetInfo = both.into();
        assert_eq!(info.width_expr.as_deref(), Some("sourceWidth"));
        assert_eq!(info.height_expr.as_deref(), Some("sourceHeight"));

        let only_width: RenderTargetInfoJson = serde_json::from_value(json!({
            "name": "seq", "width": 100, "height": 200, "widthExpress": "sourceWidth"
        }))
        .unwrap();
        let info2: RenderTargetInfo = only_width.into();
        assert!(info2.width_expr.is_none());
        assert!(info2.height_expr.is_none());
    }

    #[test]
    fn builds_flat_pass_with_scalar_uniforms() {
        let mut value = leaf_pass_json("p1");
        value["uniforms"] = json!({
            "u_time": {"type": "float", "value": 0.5},
            "u_count": {"type": "int", "value": 3, "express": "a+b"}
        });
        let pass_json: PassJson = serde_json::from_value(value).unwrap();
        let mut arena = PassArena::new();
        let id = build_pass_tree(&pass_json, &NoTextures, &mut arena).unwrap();
        assert_eq!(arena.len(), 1);
        let pass = arena.get(id);
        assert_eq!(pass.pass_name, "p1");
        assert_eq!(pass.attribute_buffer, AttributeBufferRef::NdcQuad);
        assert_eq!(pass.uniforms["u_time"].value, UniformValue::Float(0.5));
        assert_eq!(pass.uniforms["u_count"].value, UniformValue::Int(3));
        assert_eq!(pass.uniforms["u_count"].expression.as_deref(), Some("a+b"));
    }

    #[test]
    fn nested_pass_name_uniform_becomes_material_ptr() {
        let mut root = leaf_pass_json("root");
        root["uniforms"] = json!({ "u_texture": { "type": "sampler2D", "value": leaf_pass_json("child") } });
        let pass_json: PassJson = serde_json::from_value(root).unwrap();
        let mut arena = PassArena::new();
        let root_id = build_pass_tree(&pass_json, &NoTextures, &mut arena).unwrap();
        assert_eq!(arena.len(), 2);
        match arena.get(root_id).uniforms["u_texture"].value {
            UniformValue::MaterialPtr(child_id) => {
                assert_eq!(arena.get(child_id).pass_name, "child");
            }
            ref other => panic!("expected MaterialPtr, got {other:?}"),
        }
    }

    #[test]
    fn render_target_reference_uniform_ignores_expressions() {
        let mut root = leaf_pass_json("root");
        root["uniforms"] = json!({
            "u_texture": {
                "type": "sampler2D",
                "value": {"name": "seq", "width": 960, "height": 540}
            }
        });
        let pass_json: PassJson = serde_json::from_value(root).unwrap();
        let mut arena = PassArena::new();
        let id = build_pass_tree(&pass_json, &NoTextures, &mut arena).unwrap();
        match &arena.get(id).uniforms["u_texture"].value {
            UniformValue::RenderTarget(info) => {
                assert_eq!(info.name, "seq");
                assert_eq!(info.width, 960);
                assert!(info.width_expr.is_none());
            }
            other => panic!("expected RenderTarget, got {other:?}"),
        }
    }

    #[test]
    fn texture_resource_id_resolves_through_lookup() {
        let mut root = leaf_pass_json("root");
        root["uniforms"] = json!({
            "u_texture": {"type": "sampler2D", "value": "textureResourceId:video-1"}
        });
        let pass_json: PassJson = serde_json::from_value(root).unwrap();
        let mut arena = PassArena::new();
        let id = build_pass_tree(&pass_json, &OneTexture("video-1", 42), &mut arena).unwrap();
        assert_eq!(
            arena.get(id).uniforms["u_texture"].value,
            UniformValue::Texture2D(42)
        );
    }

    #[test]
    fn unresolvable_texture_resource_is_an_error() {
        let mut root = leaf_pass_json("root");
        root["uniforms"] = json!({
            "u_texture": {"type": "sampler2D", "value": "textureResourceId:missing"}
        });
        let pass_json: PassJson = serde_json::from_value(root).unwrap();
        let mut arena = PassArena::new();
        assert!(build_pass_tree(&pass_json, &NoTextures, &mut arena).is_err());
    }

    #[test]
    fn missing_required_field_fails_to_deserialise() {
        let malformed = json!({
            "renderTarget": {"name": "seq", "width": 1920, "height": 1080},
            "vertexShader": "default.vert",
            "fragmentShader": "default.frag",
            "attributeBuffer": "bufferResourceId:ndcBuffer"
        });
        let result: Result<PassJson, _> = serde_json::from_value(malformed);
        assert!(result.is_err());
    }
}
