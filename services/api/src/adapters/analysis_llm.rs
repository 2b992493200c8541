//! services/api/src/adapters/analysis_llm.rs
//!
//! This module contains the adapter for the session-scoring LLM. It implements
//! the `SessionAnalysisService` port from the `core` crate.
//!
//! The port is infallible by contract: every transport, timeout or parse
//! failure is absorbed here and replaced with the neutral verdict, so the
//! monitoring pipeline upstream never has to handle oracle errors.

const SYSTEM_INSTRUCTIONS: &str = "You are an AI education monitoring system. \
Provide accurate, fair assessments of learning sessions.";

const USER_PROMPT_TEMPLATE: &str = r#"You are monitoring a live TWO-WAY learning session. Analyze the session data focusing on interactive teaching and learning.

Session Context:
- Skill: {skill}
- Category: {category}
- Transcript snippet: {transcript}
- Teacher activity: {teacher_activity}
- Learner activity: {learner_activity}

IMPORTANT: This is a TWO-WAY COMMUNICATION session where the teacher explains concepts, the learner asks questions, and both parties actively participate. Normal teaching includes explanations, Q&A, clarifications, examples and practice.

Analyze and provide:
1. Engagement Score (0-100): how engaged is the learner? Questions asked, responses to explanations, camera on, active participation.
2. Teaching Score (0-100): how effective is the teacher? Clear explanations, answering questions, checking for understanding, interactive teaching rather than one-way talking.
3. Participation Score (0-100): quality of the TWO-WAY interaction. Turn-taking, questions asked and answered, active dialogue.
4. Fraud Detection (boolean): ONLY flag if genuinely suspicious, such as both parties completely silent for extended periods, no evidence of any two-way communication at all, cameras off for the entire window with no interaction, or clearly fake content. DO NOT flag the teacher explaining while the learner listens, brief pauses for thinking or note-taking, or natural conversation pauses.
5. Notes: detailed feedback on the interaction, with evidence of teaching and learning, interaction patterns and what makes this a good or bad lecture.
6. Recommendations: actionable advice for improvement, if any.

Return ONLY a valid JSON object with this exact structure:
{
  "engagement_score": <number 0-100>,
  "teaching_score": <number 0-100>,
  "participation_score": <number 0-100>,
  "fraud_detected": <boolean>,
  "notes": "<detailed string>",
  "recommendations": ["<actionable string>", ...],
  "lecture_quality": "<'excellent' | 'good' | 'fair' | 'poor'>",
  "key_strengths": ["<string>", ...],
  "improvement_areas": ["<string>", ...]
}"#;

use async_openai::{
    config::OpenAIConfig,
    types::chat::{
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs, ResponseFormat,
    },
    Client,
};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::warn;

use skillswap_core::domain::{AnalysisResult, LectureQuality, MonitoringSnapshot};
use skillswap_core::ports::SessionAnalysisService;

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// An adapter that implements `SessionAnalysisService` using an
/// OpenAI-compatible LLM in JSON mode.
#[derive(Clone)]
pub struct OpenAiAnalysisAdapter {
    client: Client<OpenAIConfig>,
    model: String,
    timeout: Duration,
}

impl OpenAiAnalysisAdapter {
    /// Creates a new `OpenAiAnalysisAdapter`.
    pub fn new(client: Client<OpenAIConfig>, model: String, timeout: Duration) -> Self {
        Self {
            client,
            model,
            timeout,
        }
    }

    async fn request_analysis(&self, prompt: String) -> Result<AnalysisResult, String> {
        let messages = vec![
            ChatCompletionRequestSystemMessageArgs::default()
                .content(SYSTEM_INSTRUCTIONS)
                .build()
                .map_err(|e| e.to_string())?
                .into(),
            ChatCompletionRequestUserMessageArgs::default()
                .content(prompt)
                .build()
                .map_err(|e| e.to_string())?
                .into(),
        ];

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(messages)
            .temperature(0.3)
            .response_format(ResponseFormat::JsonObject)
            .build()
            .map_err(|e| e.to_string())?;

        let response = tokio::time::timeout(self.timeout, self.client.chat().create(request))
            .await
            .map_err(|_| "analysis request timed out".to_string())?
            .map_err(|e| e.to_string())?;

        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| "analysis response contained no text content".to_string())?;

        let raw: RawAnalysis =
            serde_json::from_str(&content).map_err(|e| format!("malformed analysis JSON: {e}"))?;
        Ok(raw.into_domain())
    }
}

//=========================================================================================
// Response Parsing
//=========================================================================================

/// The untrusted wire shape. Missing fields fall back to neutral values and
/// scores are clamped into [0, 100] before anything reaches the domain.
#[derive(Deserialize)]
struct RawAnalysis {
    #[serde(default = "default_score")]
    engagement_score: f64,
    #[serde(default = "default_score")]
    teaching_score: f64,
    #[serde(default = "default_score")]
    participation_score: f64,
    #[serde(default)]
    fraud_detected: bool,
    #[serde(default)]
    notes: Option<String>,
    #[serde(default)]
    recommendations: Vec<String>,
    #[serde(default)]
    lecture_quality: Option<LectureQuality>,
    #[serde(default)]
    key_strengths: Vec<String>,
    #[serde(default)]
    improvement_areas: Vec<String>,
}

fn default_score() -> f64 {
    50.0
}

impl RawAnalysis {
    fn into_domain(self) -> AnalysisResult {
        AnalysisResult {
            engagement_score: self.engagement_score.clamp(0.0, 100.0),
            teaching_score: self.teaching_score.clamp(0.0, 100.0),
            participation_score: self.participation_score.clamp(0.0, 100.0),
            fraud_detected: self.fraud_detected,
            notes: self
                .notes
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| "No analysis notes provided".to_string()),
            recommendations: self.recommendations,
            lecture_quality: self.lecture_quality,
            key_strengths: self.key_strengths,
            improvement_areas: self.improvement_areas,
        }
    }
}

//=========================================================================================
// `SessionAnalysisService` Trait Implementation
//=========================================================================================

#[async_trait]
impl SessionAnalysisService for OpenAiAnalysisAdapter {
    async fn analyze_snapshot(
        &self,
        snapshot: &MonitoringSnapshot,
        skill: &str,
        skill_category: &str,
    ) -> AnalysisResult {
        let activity = snapshot.speaker_activity.clone().unwrap_or_default();
        let teacher_activity =
            serde_json::to_string(&activity.teacher).unwrap_or_else(|_| "{}".to_string());
        let learner_activity =
            serde_json::to_string(&activity.learner).unwrap_or_else(|_| "{}".to_string());
        let prompt = USER_PROMPT_TEMPLATE
            .replace("{skill}", skill)
            .replace("{category}", skill_category)
            .replace(
                "{transcript}",
                snapshot
                    .transcript
                    .as_deref()
                    .filter(|t| !t.trim().is_empty())
                    .unwrap_or("No transcript available"),
            )
            .replace("{teacher_activity}", &teacher_activity)
            .replace("{learner_activity}", &learner_activity);

        match self.request_analysis(prompt).await {
            Ok(analysis) => analysis,
            Err(reason) => {
                warn!(%reason, "session analysis failed, using neutral verdict");
                AnalysisResult::neutral()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_analysis_clamps_and_defaults() {
        let raw: RawAnalysis = serde_json::from_str(
            r#"{"engagement_score": 140.0, "teaching_score": -5, "fraud_detected": true}"#,
        )
        .unwrap();
        let analysis = raw.into_domain();
        assert_eq!(analysis.engagement_score, 100.0);
        assert_eq!(analysis.teaching_score, 0.0);
        assert_eq!(analysis.participation_score, 50.0);
        assert!(analysis.fraud_detected);
        assert_eq!(analysis.notes, "No analysis notes provided");
        assert!(analysis.lecture_quality.is_none());
    }

    #[test]
    fn raw_analysis_parses_full_payload() {
        let raw: RawAnalysis = serde_json::from_str(
            r#"{
                "engagement_score": 82,
                "teaching_score": 88,
                "participation_score": 79,
                "fraud_detected": false,
                "notes": "Strong back-and-forth with worked examples.",
                "recommendations": ["Slow down on new terminology"],
                "lecture_quality": "excellent",
                "key_strengths": ["clear examples"],
                "improvement_areas": ["pacing"]
            }"#,
        )
        .unwrap();
        let analysis = raw.into_domain();
        assert_eq!(analysis.teaching_score, 88.0);
        assert_eq!(analysis.lecture_quality, Some(LectureQuality::Excellent));
        assert_eq!(analysis.recommendations.len(), 1);
    }
}
