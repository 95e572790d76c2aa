//! ParamEvaluator: builds a plugin's variable environment and refreshes its Pass's
//! expression-bound uniforms and output size each frame.

use std::collections::{HashMap, HashSet};

use log::warn;
use serde_json::Value;

use crate::color;
use crate::expr::cache::Variable;
use crate::expr::{transform_expression, ExpressionCache};
use crate::pass::{Pass, PassArena, PassId, UniformValue};

/// Converts one `control` entry's raw JSON value into the `Variable` shape ParamEvaluator
/// binds as `control_<k>`: a number becomes a scalar, a 2/3/4-length
/// numeric array becomes a vector, and a hex colour string becomes an RGBA `Vec4f`-shaped
/// vector.
pub fn control_value_to_variable(value: &Value) -> Option<Variable> {
    if let Some(n) = value.as_f64() {
        return Some(Variable::scalar(n));
    }
    if let Some(arr) = value.as_array() {
        if matches!(arr.len(), 2 | 3 | 4) {
            let components: Option<Vec<f64>> = arr.iter().map(Value::as_f64).collect();
            return components.map(Variable::vector);
        }
        return None;
    }
    if let Some(s) = value.as_str() {
        if let Some(hex) = color::parse_hex(s) {
            let [r, g, b, a] = hex.to_rgba_f32();
            return Some(Variable::vector(vec![r as f64, g as f64, b as f64, a as f64]));
        }
    }
    None
}

/// Splits `"[a, b+(c,d), e]"` into `["a", "b+(c,d)", "e"]`: strips one layer of enclosing
/// brackets, then splits on commas that sit outside any nested `(...)`/`[...]`.
fn split_bracketed_components(expr: &str) -> Option<Vec<String>> {
    let trimmed = expr.trim();
    let inner = trimmed.strip_prefix('[')?.strip_suffix(']')?;

    let mut out = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (i, c) in inner.char_indices() {
        match c {
            '(' | '[' => depth += 1,
            ')' | ']' => depth -= 1,
            ',' if depth == 0 => {
                out.push(inner[start..i].trim().to_string());
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    out.push(inner[start..].trim().to_string());
    Some(out)
}

/// Collects every Pass reachable (via `MaterialPtr`) from `root`, whose `pass_name` ends with
/// `suffix`. Cycle-safe via a visited set, matching the tolerance
/// `RenderPassExecutor` applies elsewhere in this engine.
pub fn collect_passes_with_suffix(arena: &PassArena, root: PassId, suffix: &str) -> Vec<PassId> {
    let mut found = Vec::new();
    let mut visited = HashSet::new();
    let mut stack = vec![root];
    while let Some(id) = stack.pop() {
        if !visited.insert(id) {
            continue;
        }
        let pass = arena.get(id);
        if pass.pass_name.ends_with(suffix) {
            found.push(id);
        }
        stack.extend(pass.material_ptr_dependencies());
    }
    found
}

fn log_uniform_error(sequence_id: &str, plugin_id: &str, uniform_name: &str, message: &str) {
    warn!(
        "expression eval failed for {sequence_id}/{plugin_id}/{uniform_name}: {message}; retaining previous value"
    );
}

pub struct ParamEvaluator<'a> {
    cache: &'a ExpressionCache,
}

impl<'a> ParamEvaluator<'a> {
    pub fn new(cache: &'a ExpressionCache) -> Self {
        ParamEvaluator { cache }
    }

    /// Step 1: the variable environment for one plugin instance.
    pub fn build_environment(
        &self,
        source_width: f64,
        source_height: f64,
        control: &HashMap<String, Value>,
    ) -> HashMap<String, Variable> {
        let mut vars = HashMap::with_capacity(control.len() + 2);
        vars.insert("sourceWidth".to_string(), Variable::scalar(source_width));
        vars.insert("sourceHeight".to_string(), Variable::scalar(source_height));
        for (k, v) in control {
            if let Some(var) = control_value_to_variable(v) {
                vars.insert(format!("control_{k}"), var);
            }
        }
        vars
    }

    fn eval_scalar(&self, expr: &str, variables: &HashMap<String, Variable>) -> Result<f64, String> {
        let closed = transform_expression(expr);
        self.cache.evaluate(&closed, variables)
    }

    fn eval_vector<const N: usize>(
        &self,
        expr: &str,
        variables: &HashMap<String, Variable>,
    ) -> Result<[f32; N], String> {
        let components = split_bracketed_components(expr)
            .ok_or_else(|| format!("expected a bracketed {N}-component list, got '{expr}'"))?;
        if components.len() != N {
            return Err(format!(
                "expected {N} components, got {} in '{expr}'",
                components.len()
            ));
        }
        let mut out = [0f32; N];
        for (i, component) in components.iter().enumerate() {
            out[i] = self.eval_scalar(component, variables)? as f32;
        }
        Ok(out)
    }

    /// Step 3: refreshes `pass`'s output size (if its `RenderTargetInfo` carries
    /// `width_expr`/`height_expr`) and every uniform with a non-empty `expression`, coercing the
    /// evaluated result into that uniform's declared type. Failures are logged per-uniform and
    /// leave the previous value untouched, never aborting the remaining uniforms.
    pub fn refresh_pass(
        &self,
        pass: &mut Pass,
        variables: &HashMap<String, Variable>,
        sequence_id: &str,
        plugin_id: &str,
    ) {
        if let Some(width_expr) = pass.render_target_info.width_expr.clone() {
            match self.eval_scalar(&width_expr, variables) {
                Ok(v) => pass.render_target_info.width = v.round().max(0.0) as u32,
                Err(message) => log_uniform_error(sequence_id, plugin_id, "renderTarget.width", &message),
            }
        }
        if let Some(height_expr) = pass.render_target_info.height_expr.clone() {
            match self.eval_scalar(&height_expr, variables) {
                Ok(v) => pass.render_target_info.height = v.round().max(0.0) as u32,
                Err(message) => {
                    log_uniform_error(sequence_id, plugin_id, "renderTarget.height", &message)
                }
            }
        }

        let uniform_names: Vec<String> = pass.uniforms.keys().cloned().collect();
        for name in uniform_names {
            let Some(expression) = pass.uniforms[&name].expression.clone() else {
                continue;
            };
            if expression.is_empty() {
                continue;
            }
            if let Err(message) = self.apply_uniform_expression(pass, &name, &expression, variables) {
                log_uniform_error(sequence_id, plugin_id, &name, &message);
            }
        }
    }

    fn apply_uniform_expression(
        &self,
        pass: &mut Pass,
        name: &str,
        expression: &str,
        variables: &HashMap<String, Variable>,
    ) -> Result<(), String> {
        let current = &pass.uniforms.get(name).expect("checked by caller").value;
        let new_value = match current {
            UniformValue::Int(_) => UniformValue::Int(self.eval_scalar(expression, variables)?.round() as i32),
            UniformValue::Float(_) => UniformValue::Float(self.eval_scalar(expression, variables)?),
            UniformValue::Bool(_) => UniformValue::Bool(self.eval_scalar(expression, variables)? != 0.0),
            UniformValue::Vec2f(_) => UniformValue::Vec2f(self.eval_vector::<2>(expression, variables)?),
            UniformValue::Vec3f(_) => UniformValue::Vec3f(self.eval_vector::<3>(expression, variables)?),
            UniformValue::Vec4f(_) => UniformValue::Vec4f(self.eval_vector::<4>(expression, variables)?),
            UniformValue::Vec2i(_) => {
                let v = self.eval_vector::<2>(expression, variables)?;
                UniformValue::Vec2i([v[0] as i32, v[1] as i32])
            }
            UniformValue::Vec3i(_) => {
                let v = self.eval_vector::<3>(expression, variables)?;
                UniformValue::Vec3i([v[0] as i32, v[1] as i32, v[2] as i32])
            }
            UniformValue::Mat4(_)
            | UniformValue::Texture2D(_)
            | UniformValue::MaterialPtr(_)
            | UniformValue::RenderTarget(_) => {
                return Err(format!(
                    "uniform '{name}' has a type expressions cannot drive"
                ));
            }
        };
        pass.uniforms.get_mut(name).unwrap().value = new_value;
        Ok(())
    }
}
