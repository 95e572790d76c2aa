// JSON-fixture-driven integration tests: exercise timeline parsing, track timing, keyframe
// interpolation and pass-tree construction together, the way a real render invocation chains
// them, without touching a GPU device.

use std::collections::HashMap;

use render_graph_core::keyframe::{keyframe_value_at, KeyframeValue};
use render_graph_core::pass::{build_pass_tree, PassArena, ResourceTextureLookup, TextureHandle, UniformValue};
use render_graph_core::timeline::{Timeline, TrackType};
use render_graph_core::track_timing::{is_visible, original_time, sequence_time};

const FIXTURE: &str = include_str!("fixtures/two-track-timeline.json");

struct FakeResources(HashMap<String, TextureHandle>);

impl ResourceTextureLookup for FakeResources {
    fn lookup(&self, resource_id: &str) -> Option<TextureHandle> {
        self.0.get(resource_id).copied()
    }
}

fn load_fixture() -> Timeline {
    Timeline::from_str(FIXTURE).expect("fixture timeline must parse")
}

#[test]
fn parses_tracks_and_sequences_with_expected_shape() {
    let timeline = load_fixture();

    assert_eq!(timeline.width, 1280);
    assert_eq!(timeline.height, 720);
    assert_eq!(timeline.tracks.len(), 2);

    let background = &timeline.tracks[0];
    assert_eq!(background.track_type, TrackType::Graphic);
    assert_eq!(background.sequences.len(), 1);
    assert_eq!(background.sequences[0].id, "seq-bg-clip");

    let overlay = &timeline.tracks[1];
    assert_eq!(overlay.track_type, TrackType::Text);
    assert_eq!(overlay.sequences[0].resource.text, "Hello");
}

#[test]
fn track_timing_matches_each_sequences_offset_window() {
    let timeline = load_fixture();
    let bg_timer = timeline.tracks[0].sequences[0].timer;
    let overlay_timer = timeline.tracks[1].sequences[0].timer;

    // Background clip spans the whole render window.
    assert!(is_visible(&bg_timer, 0.0));
    assert!(is_visible(&bg_timer, 3000.0));

    // Overlay starts 500ms in and only lasts its own (short) trimmed duration.
    assert!(!is_visible(&overlay_timer, 0.0));
    assert!(is_visible(&overlay_timer, 500.0));
    assert_eq!(sequence_time(&overlay_timer, 500.0), 0.0);

    // Source playhead never runs past `originalDuration` for either sequence.
    for t in [0.0, 500.0, 1500.0, 3000.0] {
        assert!(original_time(&bg_timer, t) <= bg_timer.original_duration);
    }
}

#[test]
fn keyframes_resolve_through_the_parsed_timeline() {
    let timeline = load_fixture();
    let opacity_track = &timeline.tracks[0].sequences[0].keyframe["opacity"];

    assert_eq!(keyframe_value_at(opacity_track, 0.0), Some(KeyframeValue::Number(0.0)));
    assert_eq!(keyframe_value_at(opacity_track, 3000.0), Some(KeyframeValue::Number(1.0)));
    assert_eq!(keyframe_value_at(opacity_track, 1500.0), Some(KeyframeValue::Number(0.5)));
}

#[test]
fn pass_tree_builds_from_material_data_and_resolves_texture_uniform() {
    let timeline = load_fixture();
    let blit = timeline
        .material_data
        .material_passes
        .get("blit")
        .expect("fixture must declare a 'blit' pass");

    let resources = FakeResources(HashMap::from([("seq-bg-clip".to_string(), 42u64)]));
    let mut arena = PassArena::new();
    let root = build_pass_tree(blit, &resources, &mut arena).expect("pass tree must build");

    let pass = arena.get(root);
    assert_eq!(pass.pass_name, "blit");
    assert_eq!(pass.render_target_info.name, "screen");

    let texture_uniform = &pass.uniforms["u_texture"];
    assert_eq!(texture_uniform.value, UniformValue::Texture2D(42));

    let opacity_uniform = &pass.uniforms["u_opacity"];
    assert_eq!(opacity_uniform.expression.as_deref(), Some("opacity"));
}

#[test]
fn pass_tree_build_fails_on_unresolvable_texture_reference() {
    let timeline = load_fixture();
    let blit = timeline.material_data.material_passes.get("blit").unwrap();

    let resources = FakeResources(HashMap::new());
    let mut arena = PassArena::new();
    let result = build_pass_tree(blit, &resources, &mut arena);

    assert!(result.is_err());
}
