//! Applies one sequence's (or plugin's) keyframe map to its live `Adjust`/`Resource`/`control`
//! state by dotted path: `"adjust.transform.x"`, `"resource.fontSize"`,
//! `"control.foo[1]"`.
//!
//! `KeyframeEngine` (`keyframe.rs`) only answers "what's the value of this one list at time t";
//! this module owns the write side — walking a sequence's full keyframe map and mutating the
//! timeline state it targets, once per frame in `Engine::play`.

use std::collections::HashMap;

use serde_json::Value;

use crate::keyframe::{keyframe_value_at, KeyframeValue};
use crate::timeline::{Adjust, Keyframe, Resource};

/// Applies every `"adjust.*"`/`"resource.*"` entry in `keyframes` at time `t` (sequence-local
/// milliseconds). Returns `true` if any `resource.*` field changed — the trigger `update_text_renderer`
/// uses to decide whether the text raster needs rebuilding this frame.
pub fn apply_adjust_and_resource_keyframes(
    adjust: &mut Adjust,
    resource: &mut Resource,
    keyframes: &HashMap<String, Vec<Keyframe>>,
    t: f64,
) -> bool {
    let mut resource_changed = false;
    for (path, list) in keyframes {
        let Some(value) = keyframe_value_at(list, t) else { continue };
        if apply_adjust_path(adjust, path, &value) {
            continue;
        }
        if apply_resource_path(resource, path, &value) {
            resource_changed = true;
        }
    }
    resource_changed
}

/// Applies every `"control.*"` entry in a plugin's own keyframe map at time `t`.
pub fn apply_control_keyframes(control: &mut HashMap<String, Value>, keyframes: &HashMap<String, Vec<Keyframe>>, t: f64) {
    for (path, list) in keyframes {
        let Some(rest) = path.strip_prefix("control.") else { continue };
        let Some(value) = keyframe_value_at(list, t) else { continue };
        set_control_value(control, rest, &value);
    }
}

fn apply_adjust_path(adjust: &mut Adjust, path: &str, value: &KeyframeValue) -> bool {
    match path {
        "adjust.transform.x" => assign_f64(&mut adjust.transform.x, value),
        "adjust.transform.y" => assign_f64(&mut adjust.transform.y, value),
        "adjust.rotate" => assign_f64(&mut adjust.rotate, value),
        "adjust.scale.x" => assign_f64(&mut adjust.scale.x, value),
        "adjust.scale.y" => assign_f64(&mut adjust.scale.y, value),
        "adjust.opacity" => assign_f64(&mut adjust.opacity, value),
        _ => false,
    }
}

fn apply_resource_path(resource: &mut Resource, path: &str, value: &KeyframeValue) -> bool {
    match path {
        "resource.fontSize" => assign_f64(&mut resource.font_size, value),
        "resource.strokeWidth" => assign_f64(&mut resource.stroke_width, value),
        "resource.color" => assign_hex(&mut resource.color, value),
        "resource.strokeColor" => assign_hex(&mut resource.stroke_color, value),
        _ => false,
    }
}

fn assign_f64(slot: &mut f64, value: &KeyframeValue) -> bool {
    match value.as_f64() {
        Some(v) => {
            *slot = v;
            true
        }
        None => false,
    }
}

fn assign_hex(slot: &mut Option<String>, value: &KeyframeValue) -> bool {
    match value {
        KeyframeValue::Hex(s) => {
            *slot = Some(s.clone());
            true
        }
        KeyframeValue::Number(_) => false,
    }
}

/// Splits `"foo[1]"` into `("foo", Some(1))`, or `"foo"` into `("foo", None)`.
fn split_control_subscript(rest: &str) -> (&str, Option<usize>) {
    let Some(bracket) = rest.find('[') else {
        return (rest, None);
    };
    let name = &rest[..bracket];
    let index = rest[bracket + 1..].trim_end_matches(']').parse::<usize>().ok();
    (name, index)
}

fn keyframe_value_to_json(value: &KeyframeValue) -> Value {
    match value {
        KeyframeValue::Number(n) => Value::from(*n),
        KeyframeValue::Hex(s) => Value::from(s.clone()),
    }
}

fn set_control_value(control: &mut HashMap<String, Value>, rest: &str, value: &KeyframeValue) {
    let (name, index) = split_control_subscript(rest);
    let json_value = keyframe_value_to_json(value);

    match index {
        None => {
            control.insert(name.to_string(), json_value);
        }
        Some(idx) => {
            let entry = control.entry(name.to_string()).or_insert_with(|| Value::Array(Vec::new()));
            if let Value::Array(arr) = entry {
                while arr.len() <= idx {
                    arr.push(Value::from(0.0));
                }
                arr[idx] = json_value;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeline::Point2;
    use serde_json::json;

    fn kf(offset: f64, value: Value) -> Keyframe {
        Keyframe { offset, value, value_type: String::new() }
    }

    fn default_adjust() -> Adjust {
        Adjust { transform: Point2 { x: 0.0, y: 0.0 }, rotate: 0.0, scale: Point2 { x: 1.0, y: 1.0 }, opacity: 1.0 }
    }

    #[test]
    fn adjust_transform_x_is_driven_by_its_keyframe_list() {
        let mut adjust = default_adjust();
        let mut resource = Resource::default();
        let keyframes = HashMap::from([(
            "adjust.transform.x".to_string(),
            vec![kf(0.0, json!(0.0)), kf(1000.0, json!(100.0))],
        )]);

        let changed = apply_adjust_and_resource_keyframes(&mut adjust, &mut resource, &keyframes, 500.0);
        assert!(!changed, "adjust.* paths never flag a resource rebuild");
        assert_eq!(adjust.transform.x, 50.0);
    }

    #[test]
    fn resource_font_size_keyframe_flags_a_rebuild() {
        let mut adjust = default_adjust();
        let mut resource = Resource::default();
        let keyframes = HashMap::from([(
            "resource.fontSize".to_string(),
            vec![kf(0.0, json!(12.0)), kf(1000.0, json!(48.0))],
        )]);

        let changed = apply_adjust_and_resource_keyframes(&mut adjust, &mut resource, &keyframes, 1000.0);
        assert!(changed);
        assert_eq!(resource.font_size, 48.0);
    }

    #[test]
    fn resource_color_keyframe_assigns_hex_string() {
        let mut adjust = default_adjust();
        let mut resource = Resource::default();
        let keyframes = HashMap::from([(
            "resource.color".to_string(),
            vec![kf(0.0, json!("#ff0000ff"))],
        )]);

        let changed = apply_adjust_and_resource_keyframes(&mut adjust, &mut resource, &keyframes, 0.0);
        assert!(changed);
        assert_eq!(resource.color.as_deref(), Some("#ff0000ff"));
    }

    #[test]
    fn control_scalar_path_overwrites_the_whole_value() {
        let mut control = HashMap::from([("amount".to_string(), json!(1.0))]);
        let keyframes = HashMap::from([(
            "control.amount".to_string(),
            vec![kf(0.0, json!(0.0)), kf(1000.0, json!(10.0))],
        )]);
        apply_control_keyframes(&mut control, &keyframes, 500.0);
        assert_eq!(control["amount"], json!(5.0));
    }

    #[test]
    fn control_subscript_path_updates_one_array_lane() {
        let mut control = HashMap::from([("offset".to_string(), json!([1.0, 2.0, 3.0]))]);
        let keyframes = HashMap::from([(
            "control.offset[1]".to_string(),
            vec![kf(0.0, json!(2.0)), kf(1000.0, json!(20.0))],
        )]);
        apply_control_keyframes(&mut control, &keyframes, 0.0);
        assert_eq!(control["offset"], json!([1.0, 2.0, 3.0]));

        apply_control_keyframes(&mut control, &keyframes, 1000.0);
        assert_eq!(control["offset"], json!([1.0, 20.0, 3.0]));
    }

    #[test]
    fn control_subscript_grows_a_missing_array() {
        let mut control = HashMap::new();
        let keyframes = HashMap::from([(
            "control.pos[2]".to_string(),
            vec![kf(0.0, json!(9.0))],
        )]);
        apply_control_keyframes(&mut control, &keyframes, 0.0);
        assert_eq!(control["pos"], json!([0.0, 0.0, 9.0]));
    }

    #[test]
    fn unknown_path_is_ignored_rather_than_panicking() {
        let mut adjust = default_adjust();
        let mut resource = Resource::default();
        let keyframes = HashMap::from([("adjust.nonsense".to_string(), vec![kf(0.0, json!(1.0))])]);
        let changed = apply_adjust_and_resource_keyframes(&mut adjust, &mut resource, &keyframes, 0.0);
        assert!(!changed);
    }
}
