//! `ExpressionCache`: compiles an expression string once per unique text, then re-evaluates
//! it against updated variable bindings on every subsequent call.

use std::collections::HashMap;
use std::sync::Mutex;

use super::eval::{self, CompiledExpr};

/// A variable value as handed to [`ExpressionCache::evaluate`]: a scalar, or a fixed-size
/// vector (2/3/4 lanes) addressed downstream as `name_1..name_n`.
#[derive(Debug, Clone)]
pub enum Variable {
    Scalar(f64),
    Vector(Vec<f64>),
}

impl Variable {
    pub fn scalar(v: f64) -> Self {
        Variable::Scalar(v)
    }

    pub fn vector(v: impl Into<Vec<f64>>) -> Self {
        Variable::Vector(v.into())
    }
}

#[derive(Debug)]
struct CachedExpression {
    compiled: CompiledExpr,
    /// All slots, scalar and vector-component, in one flat store.
    slots: Vec<f64>,
    scalar_bindings: HashMap<String, usize>,
    /// Slot 0 of each vector is unused, matching the rewriter's 1-based `name_1..name_n`
    /// convention; `vector_bindings[name][i]` is the slot for lane `i` (1-based).
    vector_bindings: HashMap<String, Vec<usize>>,
}

impl CachedExpression {
    fn compile(rewritten_expr: &str, variables: &HashMap<String, Variable>) -> Result<Self, String> {
        let mut slots: Vec<f64> = Vec::new();
        let mut scalar_bindings: HashMap<String, usize> = HashMap::new();
        let mut vector_bindings: HashMap<String, Vec<usize>> = HashMap::new();

        for (name, value) in variables {
            match value {
                Variable::Scalar(v) => {
                    let slot = slots.len();
                    slots.push(*v);
                    scalar_bindings.insert(name.clone(), slot);
                }
                Variable::Vector(v) => {
                    let mut lane_slots = vec![0usize]; // lane 0 unused
                    for lane in v {
                        let slot = slots.len();
                        slots.push(*lane);
                        lane_slots.push(slot);
                    }
                    vector_bindings.insert(name.clone(), lane_slots);
                }
            }
        }

        let compiled = eval::compile(rewritten_expr, |ident| {
            if let Some(&slot) = scalar_bindings.get(ident) {
                return slot;
            }
            if let Some((base, lane)) = split_vector_component(ident) {
                if let Some(lane_slots) = vector_bindings.get(base) {
                    if let Some(&slot) = lane_slots.get(lane) {
                        return slot;
                    }
                }
            }
            // Unbound identifier (absent from `variables` at compile time): allocate a dead
            // scalar slot defaulting to 0.0, so evaluation never panics.
            let slot = slots.len();
            slots.push(0.0);
            slot
        })?;

        Ok(CachedExpression {
            compiled,
            slots,
            scalar_bindings,
            vector_bindings,
        })
    }

    fn update(&mut self, variables: &HashMap<String, Variable>) {
        for (name, value) in variables {
            match value {
                Variable::Scalar(v) => {
                    if let Some(&slot) = self.scalar_bindings.get(name) {
                        self.slots[slot] = *v;
                    }
                }
                Variable::Vector(v) => {
                    if let Some(lane_slots) = self.vector_bindings.get(name) {
                        for (lane, value) in v.iter().enumerate() {
                            if let Some(&slot) = lane_slots.get(lane + 1) {
                                self.slots[slot] = *value;
                            }
                        }
                    }
                }
            }
        }
    }

    fn eval(&self) -> f64 {
        self.compiled.eval(&self.slots)
    }
}

/// `name[k]` -> `name_k`, the array-subscript rewrite applied before compilation.
fn rewrite_array_subscripts(expr: &str) -> String {
    let bytes = expr.as_bytes();
    let mut out = String::with_capacity(expr.len());
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b.is_ascii_alphabetic() || b == b'_' {
            let start = i;
            i += 1;
            while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                i += 1;
            }
            out.push_str(&expr[start..i]);

            // Zero or more immediately-following `[<digits>]` subscripts.
            while i < bytes.len() && bytes[i] == b'[' {
                let digits_start = i + 1;
                let mut j = digits_start;
                while j < bytes.len() && bytes[j].is_ascii_digit() {
                    j += 1;
                }
                if j > digits_start && j < bytes.len() && bytes[j] == b']' {
                    out.push('_');
                    out.push_str(&expr[digits_start..j]);
                    i = j + 1;
                } else {
                    break;
                }
            }
        } else {
            out.push(b as char);
            i += 1;
        }
    }
    out
}

fn split_vector_component(ident: &str) -> Option<(&str, usize)> {
    let (base, lane) = ident.rsplit_once('_')?;
    if base.is_empty() {
        return None;
    }
    let lane: usize = lane.parse().ok()?;
    Some((base, lane))
}

/// Parse-compile-evaluate cache for plugin parameter expressions.
///
/// Guarded by a mutex so it is safe to share across threads, though the render loop is the
/// only expected writer.
pub struct ExpressionCache {
    entries: Mutex<HashMap<String, CachedExpression>>,
}

impl Default for ExpressionCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ExpressionCache {
    pub fn new() -> Self {
        ExpressionCache {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Evaluates `expr_string` against `variables`. On first sight of `expr_string`, slots are
    /// allocated and seeded from the *full* `variables` map passed on that first call; on every
    /// call thereafter, only variables already bound get their slot updated in place —
    /// variables absent at compile time are silently ignored, not added.
    pub fn evaluate(
        &self,
        expr_string: &str,
        variables: &HashMap<String, Variable>,
    ) -> Result<f64, String> {
        let mut entries = self.entries.lock().unwrap();

        if let Some(cached) = entries.get_mut(expr_string) {
            cached.update(variables);
            return Ok(cached.eval());
        }

        let rewritten = rewrite_array_subscripts(expr_string);
        let mut cached = CachedExpression::compile(&rewritten, variables)?;
        cached.update(variables);
        let result = cached.eval();
        entries.insert(expr_string.to_string(), cached);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn array_subscript_rewrite() {
        assert_eq!(rewrite_array_subscripts("foo[1]+bar[23]"), "foo_1+bar_23");
        assert_eq!(rewrite_array_subscripts("a+b"), "a+b");
    }

    #[test]
    fn scalar_variables_roundtrip() {
        let cache = ExpressionCache::new();
        let mut vars = HashMap::new();
        vars.insert("sourceWidth".to_string(), Variable::scalar(100.0));
        let v = cache.evaluate("sourceWidth/2", &vars).unwrap();
        assert_eq!(v, 50.0);

        vars.insert("sourceWidth".to_string(), Variable::scalar(200.0));
        let v2 = cache.evaluate("sourceWidth/2", &vars).unwrap();
        assert_eq!(v2, 100.0);
    }

    #[test]
    fn vector_component_access() {
        let cache = ExpressionCache::new();
        let mut vars = HashMap::new();
        vars.insert(
            "control_offset".to_string(),
            Variable::vector(vec![1.0, 2.0, 3.0]),
        );
        assert_eq!(
            cache.evaluate("control_offset[2]", &vars).unwrap(),
            2.0
        );
    }

    #[test]
    fn evaluate_is_pure_given_fixed_variables() {
        let cache = ExpressionCache::new();
        let mut vars = HashMap::new();
        vars.insert("a".to_string(), Variable::scalar(3.0));
        vars.insert("b".to_string(), Variable::scalar(4.0));
        let r1 = cache.evaluate("a*a+b*b", &vars).unwrap();
        let r2 = cache.evaluate("a*a+b*b", &vars).unwrap();
        assert_eq!(r1, r2);
        assert_eq!(r1, 25.0);
    }

    #[test]
    fn unbound_variable_at_compile_time_is_ignored_on_later_calls() {
        let cache = ExpressionCache::new();
        let vars_without_b = HashMap::from([("a".to_string(), Variable::scalar(10.0))]);
        // `b` isn't referenced, so this just exercises the normal path.
        let v1 = cache.evaluate("a+1", &vars_without_b).unwrap();
        assert_eq!(v1, 11.0);

        let vars_with_b = HashMap::from([
            ("a".to_string(), Variable::scalar(20.0)),
            ("b".to_string(), Variable::scalar(999.0)),
        ]);
        // Same expr string: "b" was never part of the compiled expression, so it's a no-op
        // update; only "a" actually affects the result.
        let v2 = cache.evaluate("a+1", &vars_with_b).unwrap();
        assert_eq!(v2, 21.0);
    }
}
