//! Global time -> sequence-local time, source time, visibility, transition time.

use crate::timeline::Timer;

/// `sequence_time = global_time - offset`.
pub fn sequence_time(timer: &Timer, global_time: f64) -> f64 {
    global_time - timer.offset
}

/// `trimmed_duration = duration * (originalDuration / rate)`.
pub fn trimmed_duration(timer: &Timer) -> f64 {
    timer.duration * (timer.original_duration / timer.rate)
}

/// `is_visible = 0 <= sequence_time <= trimmed_duration` (closed upper bound, intentionally: a
/// sequence is still visible on the exact frame its trimmed duration ends).
pub fn is_visible(timer: &Timer, global_time: f64) -> bool {
    let t = sequence_time(timer, global_time);
    let d = trimmed_duration(timer);
    t >= 0.0 && t <= d
}

/// `original_time = clamp(sequence_time * rate + start * originalDuration,
///                         start * originalDuration, originalDuration)`.
///
/// The upper clamp bound is `originalDuration`, not `start*originalDuration + trimmed_duration`.
/// Kept as-is rather than symmetrised: whether the asymmetry is deliberate slack for
/// time-stretched sources can't be determined from timing data alone, so it isn't "fixed" here.
pub fn original_time(timer: &Timer, global_time: f64) -> f64 {
    let t = sequence_time(timer, global_time);
    let lo = timer.start * timer.original_duration;
    let hi = timer.original_duration;
    (t * timer.rate + lo).clamp(lo.min(hi), lo.max(hi))
}

/// Transition timing for a transition of `duration` attached to the end of sequence `timer`.
///
/// `transition_time = global_time - (sequence_end - duration/2)`; active when
/// `0 <= transition_time < duration`.
pub fn transition_time(timer: &Timer, transition_duration: f64, global_time: f64) -> f64 {
    let sequence_end = timer.offset + trimmed_duration(timer);
    global_time - (sequence_end - transition_duration / 2.0)
}

pub fn transition_is_active(timer: &Timer, transition_duration: f64, global_time: f64) -> bool {
    let t = transition_time(timer, transition_duration, global_time);
    t >= 0.0 && t < transition_duration
}

/// `transition_time / duration`, the normalised [0,1] parameter fed to `u_time`.
pub fn transition_progress(timer: &Timer, transition_duration: f64, global_time: f64) -> f64 {
    if transition_duration <= 0.0 {
        return 0.0;
    }
    transition_time(timer, transition_duration, global_time) / transition_duration
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scenario_a_timer() -> Timer {
        Timer {
            offset: 1000.0,
            duration: 2000.0,
            original_duration: 2000.0,
            rate: 1.0,
            start: 0.0,
        }
    }

    #[test]
    fn scenario_a_visibility() {
        let timer = scenario_a_timer();
        assert!(!is_visible(&timer, 999.0));
        assert!(is_visible(&timer, 1000.0));
        assert!(is_visible(&timer, 3000.0));
        assert!(!is_visible(&timer, 3001.0));
    }

    #[test]
    fn original_time_is_monotonic_and_bounded() {
        let timer = Timer {
            offset: 500.0,
            duration: 1.0,
            original_duration: 4000.0,
            rate: 1.5,
            start: 0.1,
        };
        let lo = timer.start * timer.original_duration;
        let hi = timer.original_duration;

        let window_end = timer.offset + trimmed_duration(&timer);
        let mut prev = original_time(&timer, timer.offset);
        assert!(prev >= lo && prev <= hi);

        let mut t = timer.offset;
        while t <= window_end {
            let cur = original_time(&timer, t);
            assert!(cur >= lo && cur <= hi);
            assert!(cur >= prev - 1e-9, "not monotonic at t={t}: {prev} -> {cur}");
            prev = cur;
            t += 17.0;
        }
    }

    #[test]
    fn transition_progress_reaches_bounds() {
        let timer = Timer {
            offset: 0.0,
            duration: 1.0,
            original_duration: 1000.0,
            rate: 1.0,
            start: 0.0,
        };
        let duration = 200.0;
        let seq_end = timer.offset + trimmed_duration(&timer);

        assert!(!transition_is_active(&timer, duration, seq_end - duration / 2.0 - 1.0));
        assert!(transition_is_active(&timer, duration, seq_end - duration / 2.0));
        assert!(transition_is_active(&timer, duration, seq_end + duration / 2.0 - 1.0));
        assert!(!transition_is_active(&timer, duration, seq_end + duration / 2.0));

        let progress = transition_progress(&timer, duration, seq_end);
        assert!((progress - 0.5).abs() < 1e-9);
    }
}
