//! crates/skillswap_core/src/monitor.rs
//!
//! Monitoring window helpers: transcript enrichment for the oracle,
//! lecture-quality derivation and window construction. The append-only
//! window history itself lives on [`Session`](crate::domain::Session).

use chrono::Utc;

use crate::domain::{AiWindow, AnalysisResult, LectureQuality, MonitoringSnapshot};

/// Appends a textual summary of the interaction metrics to the raw
/// transcript. The enrichment exists purely to give the oracle richer
/// context; the stored window keeps the raw transcript untouched.
pub fn enrich_transcript(snapshot: &MonitoringSnapshot) -> String {
    let mut enriched = snapshot.transcript.clone().unwrap_or_default();
    if let Some(metrics) = &snapshot.interaction_metrics {
        enriched.push_str(&format!(
            " [Interaction Metrics: Teacher speaking {}s, Learner speaking {}s, \
             Questions asked: {}, Two-way interaction: {}] ",
            metrics.teacher_speaking_time,
            metrics.learner_speaking_time,
            metrics.question_count,
            if metrics.has_two_way_interaction {
                "Yes"
            } else {
                "No"
            }
        ));
    }
    enriched
}

/// Derives a lecture quality from the mean of the three scores when the
/// oracle did not supply one.
pub fn derive_lecture_quality(analysis: &AnalysisResult) -> LectureQuality {
    if let Some(quality) = analysis.lecture_quality {
        return quality;
    }
    let avg = analysis.mean_score();
    if avg >= 80.0 {
        LectureQuality::Excellent
    } else if avg >= 60.0 {
        LectureQuality::Good
    } else if avg >= 40.0 {
        LectureQuality::Fair
    } else {
        LectureQuality::Poor
    }
}

/// Builds the window record for one classified snapshot. The index is
/// provisional; [`Session::append_window`](crate::domain::Session::append_window)
/// re-stamps it under the store's serialization so it stays gapless.
pub fn build_window(
    snapshot: &MonitoringSnapshot,
    analysis: &AnalysisResult,
    fraud_detected: bool,
) -> AiWindow {
    AiWindow {
        window_index: 0,
        timestamp: Utc::now(),
        transcript: snapshot.transcript.clone(),
        speaker_activity: snapshot.speaker_activity.clone(),
        interaction_metrics: snapshot.interaction_metrics.clone(),
        engagement_score: analysis.engagement_score,
        teaching_score: analysis.teaching_score,
        participation_score: analysis.participation_score,
        fraud_detected,
        notes: Some(analysis.notes.clone()),
        analysis: analysis.clone(),
    }
}
