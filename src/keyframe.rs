//! Piecewise keyframe interpolation over an offset-sorted list.

use serde_json::Value;

use crate::color::{self, HexColor};
use crate::timeline::Keyframe;

/// Resolved value of a keyframe list at a point in time: either numeric or a colour, mirroring
/// the untyped `value: Number|HexString` field on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyframeValue {
    Number(f64),
    Hex(String),
}

impl KeyframeValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            KeyframeValue::Number(n) => Some(*n),
            KeyframeValue::Hex(_) => None,
        }
    }

    fn from_json(v: &Value) -> Option<KeyframeValue> {
        if let Some(n) = v.as_f64() {
            return Some(KeyframeValue::Number(n));
        }
        if let Some(s) = v.as_str() {
            return Some(KeyframeValue::Hex(s.to_string()));
        }
        None
    }
}

/// `keyframe_value_at(list, t)`: returns `None` for an empty or entirely-malformed list.
///
/// Malformed entries (missing offset/value/type after JSON decoding — here: a value that is
/// neither a number nor a string) are skipped during the walk rather than aborting it.
pub fn keyframe_value_at(list: &[Keyframe], t: f64) -> Option<KeyframeValue> {
    let entries: Vec<(f64, KeyframeValue)> = list
        .iter()
        .filter_map(|k| KeyframeValue::from_json(&k.value).map(|v| (k.offset, v)))
        .collect();

    if entries.is_empty() {
        return None;
    }

    let mut prev: Option<&(f64, KeyframeValue)> = None;
    for entry in &entries {
        if entry.0 > t {
            let Some(prev) = prev else {
                return Some(entry.1.clone());
            };
            let factor = (t - prev.0) / (entry.0 - prev.0);
            return Some(interpolate(&prev.1, &entry.1, factor));
        }
        prev = Some(entry);
    }

    // t exceeds (or equals) every offset: return the last entry's value.
    entries.last().map(|(_, v)| v.clone())
}

/// Interpolate two raw keyframe values: hex colours of equal channel-layout interpolate
/// per-channel; numeric values interpolate linearly; anything else tolerantly falls back to
/// `prev`.
fn interpolate(prev: &KeyframeValue, curr: &KeyframeValue, factor: f64) -> KeyframeValue {
    if let (KeyframeValue::Hex(a), KeyframeValue::Hex(b)) = (prev, curr) {
        if let (Some(ca), Some(cb)) = (color::parse_hex(a), color::parse_hex(b)) {
            let mixed: HexColor = color::lerp_hex(ca, cb, factor);
            return KeyframeValue::Hex(color::to_hex(mixed));
        }
    }

    if let (Some(a), Some(b)) = (prev.as_f64(), curr.as_f64()) {
        return KeyframeValue::Number(a + factor * (b - a));
    }

    prev.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn kf(offset: f64, value: Value) -> Keyframe {
        Keyframe {
            offset,
            value,
            value_type: String::new(),
        }
    }

    #[test]
    fn empty_list_returns_none() {
        assert_eq!(keyframe_value_at(&[], 100.0), None);
    }

    #[test]
    fn scenario_b_scalar_keyframe() {
        let list = vec![kf(0.0, json!(10.0)), kf(1000.0, json!(30.0))];
        assert_eq!(keyframe_value_at(&list, 0.0), Some(KeyframeValue::Number(10.0)));
        assert_eq!(keyframe_value_at(&list, 500.0), Some(KeyframeValue::Number(20.0)));
        assert_eq!(keyframe_value_at(&list, 1000.0), Some(KeyframeValue::Number(30.0)));
        assert_eq!(keyframe_value_at(&list, 1500.0), Some(KeyframeValue::Number(30.0)));
    }

    #[test]
    fn scenario_c_hex_keyframe() {
        let list = vec![
            kf(0.0, json!("#000000ff")),
            kf(100.0, json!("#ffffffff")),
        ];
        let KeyframeValue::Hex(mid) = keyframe_value_at(&list, 50.0).unwrap() else {
            panic!("expected hex value");
        };
        let c = color::parse_hex(&mid).unwrap();
        for ch in c.channels() {
            assert!((ch as i32 - 128).abs() <= 1);
        }
    }

    #[test]
    fn boundary_offsets_return_exact_values_no_interpolation() {
        let list = vec![
            kf(0.0, json!(1.0)),
            kf(10.0, json!(2.0)),
            kf(20.0, json!(3.0)),
        ];
        for (offset, expected) in [(0.0, 1.0), (10.0, 2.0), (20.0, 3.0)] {
            assert_eq!(
                keyframe_value_at(&list, offset),
                Some(KeyframeValue::Number(expected))
            );
        }
    }

    #[test]
    fn type_mismatch_falls_through_to_previous_value() {
        let list = vec![kf(0.0, json!("#ff0000ff")), kf(100.0, json!(5.0))];
        assert_eq!(
            keyframe_value_at(&list, 50.0),
            Some(KeyframeValue::Hex("#ff0000ff".to_string()))
        );
    }

    #[test]
    fn malformed_entry_is_skipped() {
        let list = vec![
            kf(0.0, json!(10.0)),
            kf(50.0, Value::Null),
            kf(100.0, json!(30.0)),
        ];
        // Null entry is dropped entirely, leaving a 2-point list.
        assert_eq!(keyframe_value_at(&list, 75.0), Some(KeyframeValue::Number(20.0)));
    }

    #[test]
    fn identical_values_interpolate_to_same_value() {
        let list = vec![kf(0.0, json!(7.0)), kf(100.0, json!(7.0))];
        for t in [0.0, 25.0, 50.0, 75.0, 100.0] {
            assert_eq!(keyframe_value_at(&list, t), Some(KeyframeValue::Number(7.0)));
        }
    }
}
