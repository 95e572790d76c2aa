//! Renderer, PluginRenderer, and TransitionRenderer: the on-timeline entities that own a final
//! Pass and keep its uniforms/vertex geometry in sync with the current transform and effect
//! chain.
//!
//! Matrices are stored column-major, `[col0, col1, col2, col3]`, sixteen floats, and
//! `mat4_mul(a, b)` means "apply `b`, then `a`" to a column vector.

use std::collections::HashMap;

use crate::pass::{AttributeBufferRef, Pass, PassArena, PassId, RenderTargetInfo, Uniform, UniformValue};

/// The engine's fixed orthographic-ish projection: scales by `2/size` on each axis (mapping the
/// render target's pixel extents into clip space) with a depth term retained from the legacy
/// perspective camera this format's `u_projectionMatrix` was originally derived from.
fn legacy_projection_camera_matrix(target_size: [f32; 2]) -> [f32; 16] {
    let w = if target_size[0].is_finite() && target_size[0] > 0.0 {
        target_size[0]
    } else {
        1.0
    };
    let h = if target_size[1].is_finite() && target_size[1] > 0.0 {
        target_size[1]
    } else {
        1.0
    };

    [
        2.0 / w,
        0.0,
        0.0,
        0.0,
        0.0,
        2.0 / h,
        0.0,
        0.0,
        0.0,
        0.0,
        1.0 / w,
        0.0,
        -1.0,
        -1.0,
        0.0,
        1.0,
    ]
}

pub fn mat4_identity() -> [f32; 16] {
    [
        1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0,
    ]
}

pub fn mat4_mul(a: &[f32; 16], b: &[f32; 16]) -> [f32; 16] {
    let mut out = [0.0f32; 16];
    for col in 0..4 {
        for row in 0..4 {
            out[col * 4 + row] = a[row] * b[col * 4]
                + a[4 + row] * b[col * 4 + 1]
                + a[8 + row] * b[col * 4 + 2]
                + a[12 + row] * b[col * 4 + 3];
        }
    }
    out
}

pub fn mat4_translate(x: f32, y: f32, z: f32) -> [f32; 16] {
    let mut m = mat4_identity();
    m[12] = x;
    m[13] = y;
    m[14] = z;
    m
}

pub fn mat4_scale(x: f32, y: f32, z: f32) -> [f32; 16] {
    let mut m = mat4_identity();
    m[0] = x;
    m[5] = y;
    m[10] = z;
    m
}

pub fn mat4_rotate_z(radians: f32) -> [f32; 16] {
    let (s, c) = radians.sin_cos();
    let mut m = mat4_identity();
    m[0] = c;
    m[1] = s;
    m[4] = -s;
    m[5] = c;
    m
}

/// One vertex: `[x, y, z, u, v]`.
pub type QuadVertex = [f32; 5];
pub type QuadGeometry = [QuadVertex; 4];

fn centered_quad(half_width: f32, half_height: f32) -> QuadGeometry {
    [
        [-half_width, -half_height, 0.0, 0.0, 1.0],
        [half_width, -half_height, 0.0, 1.0, 1.0],
        [-half_width, half_height, 0.0, 0.0, 0.0],
        [half_width, half_height, 0.0, 1.0, 0.0],
    ]
}

/// Rescales a resource's quad to match its dependency's footprint: each corner's x is
/// scaled to half the dependency width (sign preserved), similarly for y; with no
/// dependency (or an equal-sized one), the resource's native geometry is unchanged.
pub fn resize_quad_for_dependency(native_size: (f32, f32), dependency_size: Option<(f32, f32)>) -> QuadGeometry {
    match dependency_size {
        Some((dw, dh)) if (dw, dh) != native_size => centered_quad(dw / 2.0, dh / 2.0),
        _ => centered_quad(native_size.0 / 2.0, native_size.1 / 2.0),
    }
}

/// A PluginRenderer's NDC-quad resize: when the plugin head's output size
/// differs from its input, the quad shape is retained in the smaller dimension — a single
/// uniform scale factor (`min(scale_x, scale_y)`), rather than independent x/y scaling, so the
/// aspect ratio of the plugin's content is preserved.
pub fn resize_ndc_quad_for_plugin(input_size: (f32, f32), output_size: (f32, f32)) -> QuadGeometry {
    if input_size == output_size || input_size.0 <= 0.0 || input_size.1 <= 0.0 {
        return centered_quad(1.0, 1.0);
    }
    let scale = (output_size.0 / input_size.0).min(output_size.1 / input_size.1);
    centered_quad(scale, scale)
}

fn set_uniform(pass: &mut Pass, name: &str, value: UniformValue) {
    pass.uniforms.insert(name.to_string(), Uniform { value, expression: None });
}

/// An on-timeline item's transform state: position, rotation, scale, anchor.
#[derive(Debug, Clone, Copy)]
pub struct Transform2D {
    pub position: (f64, f64),
    /// Degrees, `adjust.rotate` on the wire — the only rotation axis this 2D compositing format
    /// exposes; `R(x)`/`R(y)` in the model-matrix formula are always identity here.
    pub rotation_degrees: f64,
    pub scale: (f64, f64),
    pub anchor: (f64, f64),
}

pub struct Renderer {
    pub name: String,
    pub final_pass: PassId,
    pub transform: Transform2D,
    pub color: [f32; 4],
    /// Intrinsic rotation carried by the backing resource (e.g. EXIF orientation). No resource
    /// kind in this engine's data model currently surfaces one, so callers pass `0.0`; kept as an
    /// explicit parameter rather than hardcoded so the `R(−z + resource_rotation)` composition
    /// is expressed faithfully.
    pub resource_rotation_degrees: f64,
}

impl Renderer {
    /// `u_modelMatrix = T(position)·R(x)·R(y)·R(−z + resource_rotation)·S(scale)·T(−anchor)`,
    /// `u_viewMatrix`/`u_projectionMatrix` from the scene camera, `u_color = rgba`.
    pub fn update_material_uniforms(&self, arena: &mut PassArena, render_target_size: (f32, f32)) {
        let translate_position = mat4_translate(self.transform.position.0 as f32, self.transform.position.1 as f32, 0.0);
        let z_angle = (-self.transform.rotation_degrees + self.resource_rotation_degrees).to_radians() as f32;
        let rotate_z = mat4_rotate_z(z_angle);
        let scale = mat4_scale(self.transform.scale.0 as f32, self.transform.scale.1 as f32, 1.0);
        let translate_anchor = mat4_translate(-self.transform.anchor.0 as f32, -self.transform.anchor.1 as f32, 0.0);

        let model = mat4_mul(&translate_position, &mat4_mul(&rotate_z, &mat4_mul(&scale, &translate_anchor)));
        let view = mat4_identity();
        let projection = legacy_projection_camera_matrix([render_target_size.0, render_target_size.1]);

        let pass = arena.get_mut(self.final_pass);
        set_uniform(pass, "u_modelMatrix", UniformValue::Mat4(model));
        set_uniform(pass, "u_viewMatrix", UniformValue::Mat4(view));
        set_uniform(pass, "u_projectionMatrix", UniformValue::Mat4(projection));
        set_uniform(pass, "u_color", UniformValue::Vec4f(self.color));
    }
}

/// A plugin-only entity that owns a Pass tree without a resource-backed leaf.
pub struct PluginRenderer {
    pub name: String,
    pub pass_head: PassId,
    pub attribute_buffer: AttributeBufferRef,
    pub has_time_uniform: bool,
    pub is_generate_effect: bool,
}

/// `{first_renderer, second_renderer, pass}`, composing two Renderers into one Pass with a
/// `time` uniform.
pub struct TransitionRenderer {
    pub id: String,
    pub pass: PassId,
    pub first_render_target: RenderTargetInfo,
    pub second_render_target: RenderTargetInfo,
}

impl TransitionRenderer {
    /// Allocates the transition's materialPass: `"Transition" + id`, bound to the engine's
    /// shared sequence target and NDC buffer, with two dedicated full-output-resolution
    /// sub-targets and a `u_time` uniform.
    pub fn build(
        arena: &mut PassArena,
        id: &str,
        sequence_target: RenderTargetInfo,
        output_width: u32,
        output_height: u32,
    ) -> Self {
        let first_render_target = RenderTargetInfo {
            name: format!("{id}_firstRenderTarget"),
            width: output_width,
            height: output_height,
            width_expr: None,
            height_expr: None,
        };
        let second_render_target = RenderTargetInfo {
            name: format!("{id}_secondRenderTarget"),
            width: output_width,
            height: output_height,
            width_expr: None,
            height_expr: None,
        };

        let mut uniforms = HashMap::new();
        uniforms.insert(
            "u_firstTexture".to_string(),
            Uniform { value: UniformValue::RenderTarget(first_render_target.clone()), expression: None },
        );
        uniforms.insert(
            "u_secondTexture".to_string(),
            Uniform { value: UniformValue::RenderTarget(second_render_target.clone()), expression: None },
        );
        uniforms.insert(
            "u_time".to_string(),
            Uniform { value: UniformValue::Float(0.0), expression: None },
        );

        let pass = Pass {
            pass_name: format!("Transition{id}"),
            render_target_info: sequence_target,
            vertex_shader: "builtin/quad.vert".to_string(),
            fragment_shader: "builtin/transition.frag".to_string(),
            attribute_buffer: AttributeBufferRef::NdcQuad,
            uniforms,
            clear_color: None,
            clear_mask: None,
        };
        let pass_id = arena.alloc(pass);

        TransitionRenderer { id: id.to_string(), pass: pass_id, first_render_target, second_render_target }
    }

    /// `u_time = transition_time / transition_duration`.
    pub fn update_time(&self, arena: &mut PassArena, transition_time_ms: f64, transition_duration_ms: f64) {
        let progress = if transition_duration_ms > 0.0 {
            (transition_time_ms / transition_duration_ms).clamp(0.0, 1.0)
        } else {
            0.0
        };
        set_uniform(arena.get_mut(self.pass), "u_time", UniformValue::Float(progress));
    }

    /// When `override_target` is `Some`, redirects both upstream renderers' effect-chain output
    /// targets to it for this frame; when `None`, restores each to its own dedicated
    /// first/second sub-target.
    pub fn update_render_target_info(
        &self,
        arena: &mut PassArena,
        first_output_pass: PassId,
        second_output_pass: PassId,
        override_target: Option<&RenderTargetInfo>,
    ) {
        let first = override_target.cloned().unwrap_or_else(|| self.first_render_target.clone());
        let second = override_target.cloned().unwrap_or_else(|| self.second_render_target.clone());
        arena.get_mut(first_output_pass).render_target_info = first;
        arena.get_mut(second_output_pass).render_target_info = second;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pass::RenderTargetInfo as RTI;

    fn leaf_pass(name: &str) -> Pass {
        Pass {
            pass_name: name.to_string(),
            render_target_info: RTI { name: "seq".to_string(), width: 100, height: 100, width_expr: None, height_expr: None },
            vertex_shader: "default.vert".to_string(),
            fragment_shader: "default.frag".to_string(),
            attribute_buffer: AttributeBufferRef::NdcQuad,
            uniforms: HashMap::new(),
            clear_color: None,
            clear_mask: None,
        }
    }

    #[test]
    fn identity_matrix_is_a_no_op_under_mul() {
        let m = mat4_rotate_z(0.7);
        let i = mat4_identity();
        assert_eq!(mat4_mul(&i, &m), m);
        assert_eq!(mat4_mul(&m, &i), m);
    }

    #[test]
    fn translate_then_mul_moves_origin() {
        let t = mat4_translate(3.0, -2.0, 0.0);
        // Column-major: translation lives in column 3 (indices 12..16).
        assert_eq!([t[12], t[13], t[14]], [3.0, -2.0, 0.0]);
    }

    #[test]
    fn quad_resize_preserves_sign_and_uses_dependency_half_size() {
        let quad = resize_quad_for_dependency((100.0, 50.0), Some((200.0, 80.0)));
        assert_eq!(quad[0][0], -100.0); // bottom-left x = -half dependency width
        assert_eq!(quad[3][0], 100.0); // bottom-right... top-right x = +half
        assert_eq!(quad[0][1], -40.0);
        assert_eq!(quad[3][1], 40.0);
    }

    #[test]
    fn quad_resize_falls_back_to_native_when_no_dependency() {
        let quad = resize_quad_for_dependency((100.0, 50.0), None);
        assert_eq!(quad[0][0], -50.0);
        assert_eq!(quad[0][1], -25.0);
    }

    #[test]
    fn ndc_resize_retains_shape_in_smaller_dimension() {
        // Input 100x100 scaled to fit an output of 200x50: x would want scale 2, y wants 0.5.
        let quad = resize_ndc_quad_for_plugin((100.0, 100.0), (200.0, 50.0));
        assert_eq!(quad[3][0], 0.5);
        assert_eq!(quad[3][1], 0.5);
    }

    #[test]
    fn renderer_writes_model_view_projection_and_color() {
        let mut arena = PassArena::new();
        let pass_id = arena.alloc(leaf_pass("final"));
        let renderer = Renderer {
            name: "r1".to_string(),
            final_pass: pass_id,
            transform: Transform2D { position: (10.0, 20.0), rotation_degrees: 0.0, scale: (1.0, 1.0), anchor: (0.0, 0.0) },
            color: [1.0, 1.0, 1.0, 1.0],
            resource_rotation_degrees: 0.0,
        };
        renderer.update_material_uniforms(&mut arena, (1920.0, 1080.0));

        let pass = arena.get(pass_id);
        match pass.uniforms["u_modelMatrix"].value {
            UniformValue::Mat4(m) => assert_eq!([m[12], m[13]], [10.0, 20.0]),
            ref other => panic!("expected Mat4, got {other:?}"),
        }
        assert_eq!(pass.uniforms["u_color"].value, UniformValue::Vec4f([1.0, 1.0, 1.0, 1.0]));
    }

    #[test]
    fn transition_time_clamps_to_unit_interval() {
        let mut arena = PassArena::new();
        let transition = TransitionRenderer::build(
            &mut arena,
            "t1",
            RTI { name: "seq".to_string(), width: 1920, height: 1080, width_expr: None, height_expr: None },
            1920,
            1080,
        );
        transition.update_time(&mut arena, 50.0, 200.0);
        assert_eq!(arena.get(transition.pass).uniforms["u_time"].value, UniformValue::Float(0.25));

        transition.update_time(&mut arena, 999.0, 200.0);
        assert_eq!(arena.get(transition.pass).uniforms["u_time"].value, UniformValue::Float(1.0));
    }

    #[test]
    fn render_target_override_redirects_both_upstream_outputs() {
        let mut arena = PassArena::new();
        let transition = TransitionRenderer::build(
            &mut arena,
            "t1",
            RTI { name: "seq".to_string(), width: 1920, height: 1080, width_expr: None, height_expr: None },
            1920,
            1080,
        );
        let first = arena.alloc(leaf_pass("a_final"));
        let second = arena.alloc(leaf_pass("b_final"));

        let shared = RTI { name: "shared".to_string(), width: 1920, height: 1080, width_expr: None, height_expr: None };
        transition.update_render_target_info(&mut arena, first, second, Some(&shared));
        assert_eq!(arena.get(first).render_target_info.name, "shared");
        assert_eq!(arena.get(second).render_target_info.name, "shared");

        transition.update_render_target_info(&mut arena, first, second, None);
        assert_eq!(arena.get(first).render_target_info.name, "t1_firstRenderTarget");
        assert_eq!(arena.get(second).render_target_info.name, "t1_secondRenderTarget");
    }
}
