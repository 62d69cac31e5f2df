//! AI-written narrative reports over a student's exam history.
//!
//! The model is asked for JSON matching a declared schema. Anything that is
//! empty, not JSON, or outside the declared shape is an error; partial
//! reports are never returned.

use crate::model::{Exam, GradeRecord};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_MODEL: &str = "gemini-3-flash-preview";
pub const DEFAULT_RELATIONSHIP: &str = "parent";

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("student has no exam results yet")]
    NoHistory,
    #[error("AI service is not configured")]
    Unavailable,
    #[error("AI request failed: {0}")]
    Request(String),
    #[error("AI service returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("AI service returned an empty response")]
    EmptyResponse,
    #[error("AI response is not valid JSON for the requested shape: {0}")]
    Malformed(String),
    #[error("AI response failed validation: {0}")]
    Invalid(String),
}

impl AnalysisError {
    pub fn code(&self) -> &'static str {
        match self {
            AnalysisError::NoHistory => "no_history",
            AnalysisError::Unavailable => "ai_unavailable",
            _ => "ai_failed",
        }
    }
}

/// Prompt + response schema in, raw JSON text out.
pub trait GenerativeModel {
    fn generate(&self, prompt: &str, schema: &Value) -> Result<String, AnalysisError>;
}

#[derive(Debug, Clone)]
pub struct AiSettings {
    pub endpoint: String,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

pub struct GeminiClient {
    endpoint: String,
    model: String,
    api_key: String,
    client: reqwest::blocking::Client,
}

impl GeminiClient {
    /// `Ok(None)` when no API key is configured.
    pub fn from_settings(settings: &AiSettings) -> Result<Option<Self>, AnalysisError> {
        let Some(api_key) = settings.api_key.clone().filter(|k| !k.trim().is_empty()) else {
            return Ok(None);
        };
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| AnalysisError::Request(e.to_string()))?;
        Ok(Some(Self {
            endpoint: settings.endpoint.trim_end_matches('/').to_string(),
            model: settings.model.clone(),
            api_key,
            client,
        }))
    }
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: Option<String>,
}

impl GenerativeModel for GeminiClient {
    fn generate(&self, prompt: &str, schema: &Value) -> Result<String, AnalysisError> {
        let url = format!("{}/models/{}:generateContent", self.endpoint, self.model);
        let body = json!({
            "contents": [{ "parts": [{ "text": prompt }] }],
            "generationConfig": {
                "responseMimeType": "application/json",
                "responseSchema": schema,
            }
        });
        let resp = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .map_err(|e| AnalysisError::Request(e.to_string()))?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().unwrap_or_default();
            return Err(AnalysisError::Status { status, body });
        }
        let parsed: GenerateResponse = resp
            .json()
            .map_err(|e| AnalysisError::Malformed(e.to_string()))?;
        let text: String = parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
            .unwrap_or_default();
        Ok(text)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamHistoryEntry {
    pub exam_name: String,
    pub date: String,
    pub results: String,
}

/// The student's records as prompt context, oldest exam first.
pub fn exam_history(records: &[GradeRecord], exams: &[Exam]) -> Vec<ExamHistoryEntry> {
    let mut history: Vec<ExamHistoryEntry> = records
        .iter()
        .map(|rec| {
            let exam = exams.iter().find(|e| e.id == rec.exam_id);
            ExamHistoryEntry {
                exam_name: exam
                    .map(|e| e.name.clone())
                    .unwrap_or_else(|| "Unknown exam".to_string()),
                date: exam.map(|e| e.date.clone()).unwrap_or_default(),
                results: rec
                    .grades
                    .iter()
                    .map(|g| format!("{}: {}/{}", g.subject, g.score, g.full_score))
                    .collect::<Vec<_>>()
                    .join(", "),
            }
        })
        .collect();
    history.sort_by(|a, b| a.date.cmp(&b.date));
    history
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisReport {
    pub overall_assessment: String,
    pub strengths: Vec<String>,
    pub weaknesses: Vec<String>,
    pub trend_analysis: String,
    pub suggestions: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Rising,
    Falling,
    Stable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectPrediction {
    pub subject: String,
    pub predicted_min: f64,
    pub predicted_max: f64,
    pub trend: Trend,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictionReport {
    pub predicted_exam_name: String,
    pub confidence_score: f64,
    pub subject_predictions: Vec<SubjectPrediction>,
    pub growth_areas: Vec<String>,
    pub risk_factors: Vec<String>,
    pub strategic_advice: String,
}

fn history_json(history: &[ExamHistoryEntry]) -> String {
    serde_json::to_string_pretty(history).unwrap_or_else(|_| "[]".to_string())
}

pub fn analysis_prompt(student_name: &str, relationship: &str, history: &[ExamHistoryEntry]) -> String {
    format!(
        "You are an experienced education expert and student counsellor. \
You are preparing a learning report on {student} for the student's {rel}.\n\n\
Exam history (oldest first):\n{history}\n\n\
Write the report in a professional and caring tone.\n\
1. Address the {rel} directly and give concrete suggestions for supporting the student at home.\n\
2. Describe how the results have moved over time and name the subjects showing potential or difficulty.\n\
3. Keep every suggestion actionable (for example how to practise a weak subject).",
        student = student_name,
        rel = relationship,
        history = history_json(history),
    )
}

pub fn prediction_prompt(student_name: &str, history: &[ExamHistoryEntry]) -> String {
    format!(
        "You are an education data analyst. Based on the exam history of {student} below, \
predict the student's next exam.\n\n\
Exam history (oldest first):\n{history}\n\n\
For each subject give a predicted score range and whether the subject is rising, falling or stable. \
Give a confidence score between 0 and 100, the areas with the most room to grow, \
the main risk factors, and one paragraph of strategic advice.",
        student = student_name,
        history = history_json(history),
    )
}

fn string_array(description: &str) -> Value {
    json!({ "type": "ARRAY", "items": { "type": "STRING" }, "description": description })
}

pub fn analysis_schema() -> Value {
    json!({
        "type": "OBJECT",
        "properties": {
            "overallAssessment": { "type": "STRING", "description": "Overall summary of the student's recent learning" },
            "strengths": string_array("Strong subjects or notable achievements"),
            "weaknesses": string_array("Weak points or current challenges"),
            "trendAnalysis": { "type": "STRING", "description": "Whether results are improving, flat or fluctuating" },
            "suggestions": string_array("Concrete actions for the family")
        },
        "required": ["overallAssessment", "strengths", "weaknesses", "trendAnalysis", "suggestions"]
    })
}

pub fn prediction_schema() -> Value {
    json!({
        "type": "OBJECT",
        "properties": {
            "predictedExamName": { "type": "STRING" },
            "confidenceScore": { "type": "NUMBER", "description": "0 to 100" },
            "subjectPredictions": {
                "type": "ARRAY",
                "items": {
                    "type": "OBJECT",
                    "properties": {
                        "subject": { "type": "STRING" },
                        "predictedMin": { "type": "NUMBER" },
                        "predictedMax": { "type": "NUMBER" },
                        "trend": { "type": "STRING", "enum": ["rising", "falling", "stable"] }
                    },
                    "required": ["subject", "predictedMin", "predictedMax", "trend"]
                }
            },
            "growthAreas": string_array("Subjects or skills with the most room to grow"),
            "riskFactors": string_array("Risks that could pull results down"),
            "strategicAdvice": { "type": "STRING" }
        },
        "required": [
            "predictedExamName",
            "confidenceScore",
            "subjectPredictions",
            "growthAreas",
            "riskFactors",
            "strategicAdvice"
        ]
    })
}

fn parse_response<T: DeserializeOwned>(text: &str) -> Result<T, AnalysisError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(AnalysisError::EmptyResponse);
    }
    serde_json::from_str(text).map_err(|e| AnalysisError::Malformed(e.to_string()))
}

pub fn analyze(
    model: &dyn GenerativeModel,
    student_name: &str,
    relationship: &str,
    history: &[ExamHistoryEntry],
) -> Result<AnalysisReport, AnalysisError> {
    if history.is_empty() {
        return Err(AnalysisError::NoHistory);
    }
    let prompt = analysis_prompt(student_name, relationship, history);
    let report: AnalysisReport = parse_response(&model.generate(&prompt, &analysis_schema())?)?;
    if report.overall_assessment.trim().is_empty() {
        return Err(AnalysisError::Invalid("overallAssessment is empty".into()));
    }
    Ok(report)
}

pub fn predict(
    model: &dyn GenerativeModel,
    student_name: &str,
    history: &[ExamHistoryEntry],
) -> Result<PredictionReport, AnalysisError> {
    if history.is_empty() {
        return Err(AnalysisError::NoHistory);
    }
    let prompt = prediction_prompt(student_name, history);
    let report: PredictionReport = parse_response(&model.generate(&prompt, &prediction_schema())?)?;

    if !report.confidence_score.is_finite() || !(0.0..=100.0).contains(&report.confidence_score) {
        return Err(AnalysisError::Invalid(format!(
            "confidenceScore {} outside 0..=100",
            report.confidence_score
        )));
    }
    for p in &report.subject_predictions {
        if !p.predicted_min.is_finite()
            || !p.predicted_max.is_finite()
            || p.predicted_min > p.predicted_max
        {
            return Err(AnalysisError::Invalid(format!(
                "bad predicted range for {}",
                p.subject
            )));
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SubjectGrade;
    use std::cell::RefCell;

    struct FakeModel {
        reply: String,
        prompts: RefCell<Vec<String>>,
    }

    impl FakeModel {
        fn new(reply: &str) -> Self {
            Self {
                reply: reply.to_string(),
                prompts: RefCell::new(Vec::new()),
            }
        }
    }

    impl GenerativeModel for FakeModel {
        fn generate(&self, prompt: &str, _schema: &Value) -> Result<String, AnalysisError> {
            self.prompts.borrow_mut().push(prompt.to_string());
            Ok(self.reply.clone())
        }
    }

    fn history() -> Vec<ExamHistoryEntry> {
        let exams = vec![
            Exam {
                id: "e2".into(),
                school_id: "s".into(),
                semester_id: "sem".into(),
                name: "Final".into(),
                date: "2024-06-20".into(),
            },
            Exam {
                id: "e1".into(),
                school_id: "s".into(),
                semester_id: "sem".into(),
                name: "Midterm".into(),
                date: "2024-04-10".into(),
            },
        ];
        let rec = |id: &str, exam: &str, score: f64| GradeRecord {
            id: id.into(),
            student_id: "st".into(),
            exam_id: exam.into(),
            school_id: "s".into(),
            grades: vec![SubjectGrade {
                subject: "math".into(),
                score,
                full_score: 100.0,
            }],
        };
        exam_history(&[rec("r2", "e2", 91.0), rec("r1", "e1", 78.0)], &exams)
    }

    #[test]
    fn history_is_oldest_first_with_score_summaries() {
        let h = history();
        assert_eq!(h[0].exam_name, "Midterm");
        assert_eq!(h[0].results, "math: 78/100");
        assert_eq!(h[1].date, "2024-06-20");
    }

    #[test]
    fn analysis_prompt_names_relationship_and_history() {
        let model = FakeModel::new(
            r#"{"overallAssessment":"Steady","strengths":["math"],"weaknesses":[],"trendAnalysis":"Rising","suggestions":["Read daily"]}"#,
        );
        let report = analyze(&model, "Zhang San", "father", &history()).expect("report");
        assert_eq!(report.strengths, vec!["math".to_string()]);

        let prompts = model.prompts.borrow();
        assert!(prompts[0].contains("Zhang San"));
        assert!(prompts[0].contains("father"));
        assert!(prompts[0].contains("Midterm"));
    }

    #[test]
    fn empty_and_malformed_responses_fail() {
        let err = analyze(&FakeModel::new("  "), "A", "parent", &history()).expect_err("empty");
        assert!(matches!(err, AnalysisError::EmptyResponse));
        assert_eq!(err.code(), "ai_failed");

        let err = analyze(&FakeModel::new(r#"{"overallAssessment":"x"}"#), "A", "parent", &history())
            .expect_err("partial");
        assert!(matches!(err, AnalysisError::Malformed(_)));
    }

    #[test]
    fn no_history_is_refused_before_calling_the_model() {
        let model = FakeModel::new("{}");
        let err = predict(&model, "A", &[]).expect_err("no history");
        assert!(matches!(err, AnalysisError::NoHistory));
        assert!(model.prompts.borrow().is_empty());
    }

    #[test]
    fn prediction_is_validated() {
        let good = r#"{
            "predictedExamName": "Final",
            "confidenceScore": 82,
            "subjectPredictions": [{"subject":"math","predictedMin":85,"predictedMax":95,"trend":"rising"}],
            "growthAreas": ["geometry"],
            "riskFactors": [],
            "strategicAdvice": "Keep going"
        }"#;
        let p = predict(&FakeModel::new(good), "A", &history()).expect("prediction");
        assert_eq!(p.subject_predictions[0].trend, Trend::Rising);

        let bad_trend = good.replace("rising", "sideways");
        assert!(matches!(
            predict(&FakeModel::new(&bad_trend), "A", &history()),
            Err(AnalysisError::Malformed(_))
        ));

        let inverted = good.replace("\"predictedMin\":85", "\"predictedMin\":99");
        assert!(matches!(
            predict(&FakeModel::new(&inverted), "A", &history()),
            Err(AnalysisError::Invalid(_))
        ));

        let overconfident = good.replace("82", "140");
        assert!(matches!(
            predict(&FakeModel::new(&overconfident), "A", &history()),
            Err(AnalysisError::Invalid(_))
        ));
    }

    #[test]
    fn client_is_absent_without_api_key() {
        let settings = AiSettings {
            endpoint: DEFAULT_ENDPOINT.into(),
            model: DEFAULT_MODEL.into(),
            api_key: Some("  ".into()),
            timeout_secs: 5,
        };
        assert!(GeminiClient::from_settings(&settings).expect("settings").is_none());
    }
}
