//! crates/skillswap_core/src/fraud.rs
//!
//! Deterministic fraud heuristics, run on every ingested snapshot regardless
//! of oracle availability. Each rule can independently set the combined fraud
//! verdict for a window; none of them can clear a flag the oracle raised.
//! Normal teaching includes one-sided explanation stretches, so the rules are
//! gated on the absence of any secondary evidence of activity.

use crate::domain::{MonitoringSnapshot, ParticipantActivity};

/// Silence past this many seconds stops counting as a teaching pause.
const MUTUAL_SILENCE_SECS: u32 = 180;
/// Transcript shorter than this carries no meaningful content for the
/// mutual-silence rule.
const SILENCE_TRANSCRIPT_CHARS: usize = 20;
/// Transcript shorter than this carries no meaningful content for the
/// dual-camera-off rule.
const CAMERA_OFF_TRANSCRIPT_CHARS: usize = 30;
/// A transcript longer than this is taken as evidence the teacher is talking.
const TEACHER_ACTIVITY_CHARS: usize = 50;

/// Evaluates all heuristics over a raw (unenriched) snapshot.
///
/// `prior_windows` is the number of windows already recorded before this
/// snapshot; the no-two-way rule grants the first window a grace period to
/// avoid flagging setup time.
pub fn evaluate(snapshot: &MonitoringSnapshot, prior_windows: usize) -> bool {
    let Some(activity) = &snapshot.speaker_activity else {
        return false;
    };
    let transcript = snapshot.transcript.as_deref().unwrap_or("").trim();

    let teacher_active = has_teacher_activity(&activity.teacher, transcript);
    let learner_active = has_learner_activity(&activity.learner, transcript);
    if teacher_active || learner_active {
        return false;
    }

    // Prolonged mutual silence: both quiet past the threshold with no
    // meaningful transcript content.
    let both_silent_too_long = !activity.teacher.speaking
        && !activity.learner.speaking
        && silence_exceeds(&activity.teacher, MUTUAL_SILENCE_SECS)
        && silence_exceeds(&activity.learner, MUTUAL_SILENCE_SECS)
        && transcript.len() < SILENCE_TRANSCRIPT_CHARS;
    if both_silent_too_long {
        return true;
    }

    // Both cameras off for the window with nothing said.
    if !activity.teacher.camera_on
        && !activity.learner.camera_on
        && transcript.len() < CAMERA_OFF_TRANSCRIPT_CHARS
    {
        return true;
    }

    // No two-way exchange at all. The first window gets a grace period.
    let no_two_way = !activity.teacher.speaking
        && !activity.learner.speaking
        && transcript.is_empty()
        && prior_windows >= 1;
    if no_two_way {
        return true;
    }

    false
}

/// A missing silence measurement is treated as "silent the whole window".
fn silence_exceeds(activity: &ParticipantActivity, threshold_secs: u32) -> bool {
    match activity.silence_duration {
        Some(secs) => secs > threshold_secs,
        None => true,
    }
}

fn has_teacher_activity(activity: &ParticipantActivity, transcript: &str) -> bool {
    activity.speaking
        || transcript.to_lowercase().contains("teacher")
        || transcript.len() > TEACHER_ACTIVITY_CHARS
}

fn has_learner_activity(activity: &ParticipantActivity, transcript: &str) -> bool {
    activity.speaking
        || transcript.contains('?')
        || transcript.to_lowercase().contains("question")
        || transcript.to_lowercase().contains("learner")
}
