//! Timeline JSON data model.
//!
//! This is the declarative input document: tracks of sequences, each carrying timing,
//! adjustment, resource, plugin, transition and keyframe data. Deserialisation is purely
//! structural; semantic defaults (e.g. `globalRenderScale`) are applied by `Timeline::from_str`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::pass::PassJson;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Timeline {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    #[serde(rename = "mBitRate")]
    pub m_bit_rate: f64,
    #[serde(rename = "globalRenderScale", default = "default_render_scale")]
    pub global_render_scale: f32,
    #[serde(rename = "startTime")]
    pub start_time: f64,
    #[serde(rename = "endTime")]
    pub end_time: f64,
    #[serde(rename = "stepTime")]
    pub step_time: f64,
    #[serde(rename = "outputPath")]
    pub output_path: String,
    #[serde(rename = "isDebug", default)]
    pub is_debug: bool,
    #[serde(default)]
    pub tracks: Vec<Track>,
    #[serde(rename = "materialData", default)]
    pub material_data: MaterialData,
}

fn default_render_scale() -> f32 {
    1.0
}

impl Timeline {
    pub fn from_str(text: &str) -> anyhow::Result<Self> {
        let timeline: Timeline = serde_json::from_str(text)?;
        Ok(timeline)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MaterialData {
    #[serde(rename = "materialPasses", default)]
    pub material_passes: HashMap<String, PassJson>,
    #[serde(default)]
    pub shaders: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackType {
    Graphic,
    Text,
    Plugin,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Track {
    pub id: String,
    #[serde(rename = "type")]
    pub track_type: TrackType,
    #[serde(default = "default_true")]
    pub visible: bool,
    #[serde(default)]
    pub sequences: Vec<Sequence>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Sequence {
    pub id: String,
    #[serde(rename = "type")]
    pub sequence_type: TrackType,
    pub timer: Timer,
    pub adjust: Adjust,
    #[serde(default)]
    pub resource: Resource,
    #[serde(default)]
    pub plugins: Vec<Plugin>,
    pub transition: Option<Transition>,
    #[serde(default)]
    pub keyframe: HashMap<String, Vec<Keyframe>>,
}

/// `timer = {offset, duration, originalDuration, rate, start}`.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct Timer {
    pub offset: f64,
    pub duration: f64,
    #[serde(rename = "originalDuration")]
    pub original_duration: f64,
    pub rate: f64,
    pub start: f64,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct Adjust {
    pub transform: Point2,
    #[serde(default)]
    pub rotate: f64,
    #[serde(default = "Point2::one")]
    pub scale: Point2,
    #[serde(default = "default_opacity")]
    pub opacity: f64,
}

fn default_opacity() -> f64 {
    1.0
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize)]
pub struct Point2 {
    pub x: f64,
    pub y: f64,
}

impl Point2 {
    fn one() -> Self {
        Point2 { x: 1.0, y: 1.0 }
    }
}

/// Union of the three resource shapes (graphic / text / plugin) keyed by `sequence_type`.
///
/// Kept as an untagged-looking flat struct (all fields optional) rather than an enum because
/// the wire format never tags which shape is present; the caller consults `sequence_type`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Resource {
    #[serde(rename = "absolutePath", default)]
    pub absolute_path: String,
    #[serde(default)]
    pub text: String,
    #[serde(rename = "fontSize", default)]
    pub font_size: f64,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(rename = "strokeEnabled", default)]
    pub stroke_enabled: bool,
    #[serde(rename = "strokeWidth", default)]
    pub stroke_width: f64,
    #[serde(rename = "strokeColor", default)]
    pub stroke_color: Option<String>,
}

const VIDEO_EXTENSIONS: &[&str] = &[
    "mp4", "avi", "mov", "mkv", "flv", "wmv", "mpeg", "mpg", "m4v", "3gp", "webm",
];

/// Extension-based video/image split.
pub fn is_video_path(path: &str) -> bool {
    let Some(ext) = path.rsplit('.').next() else {
        return false;
    };
    VIDEO_EXTENSIONS
        .iter()
        .any(|v| v.eq_ignore_ascii_case(ext))
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Plugin {
    pub id: String,
    #[serde(default)]
    pub control: HashMap<String, Value>,
    #[serde(default)]
    pub keyframe: HashMap<String, Vec<Keyframe>>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Transition {
    pub id: String,
    pub duration: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Keyframe {
    pub offset: f64,
    pub value: Value,
    #[serde(rename = "type", default)]
    pub value_type: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_extension_detection() {
        assert!(is_video_path("/a/b/clip.MP4"));
        assert!(is_video_path("foo.webm"));
        assert!(!is_video_path("foo.png"));
        assert!(!is_video_path("no-extension"));
    }

    #[test]
    fn timeline_parses_minimal_document() {
        let json = r#"{
            "width": 1920, "height": 1080, "fps": 30, "mBitRate": 8,
            "startTime": 0, "endTime": 1000, "stepTime": 33.333,
            "outputPath": "/tmp/out.mp4", "isDebug": false, "tracks": []
        }"#;
        let timeline = Timeline::from_str(json).unwrap();
        assert_eq!(timeline.width, 1920);
        assert_eq!(timeline.global_render_scale, 1.0);
        assert!(timeline.tracks.is_empty());
    }
}
