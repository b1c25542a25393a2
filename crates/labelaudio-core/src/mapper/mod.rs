//! Schema mapper
//!
//! Maps a normalized analysis into an [`AnnotationRecord`] for one of the
//! closed set of labeling templates. Mapping is pure: the same analysis and
//! task type always produce the same record, region ids included.

mod normalize;
mod template;

pub use normalize::{normalize_analysis, AnalysisArtifacts};
pub use template::{Template, TurnMode};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

use crate::store::{ResultRef, ResultStore, StoreError};

#[derive(Debug, Error)]
pub enum MapError {
    #[error("unknown task type '{0}' (expected speech, music or mixed)")]
    UnknownTaskType(String),

    #[error("malformed analysis: {0}")]
    MalformedAnalysis(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Speech,
    Music,
    Mixed,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Speech => "speech",
            Self::Music => "music",
            Self::Mixed => "mixed",
        }
    }

    pub fn template(&self) -> &'static Template {
        Template::for_task_type(*self)
    }
}

impl FromStr for TaskType {
    type Err = MapError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "speech" => Ok(Self::Speech),
            "music" => Ok(Self::Music),
            "mixed" => Ok(Self::Mixed),
            _ => Err(MapError::UnknownTaskType(value.to_string())),
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized analysis, timings in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub audio_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub turns: Vec<SpeakerTurn>,
    #[serde(default)]
    pub events: Vec<AudioEvent>,
    #[serde(default)]
    pub keywords: Vec<KeywordSpan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sentiment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeakerTurn {
    pub speaker: String,
    pub start_ms: u64,
    pub end_ms: u64,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sentiment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioEvent {
    pub label: String,
    pub start_ms: u64,
    pub end_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

/// Keyword occurrence: `start..end` is a char range in `turns[turn].text`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordSpan {
    pub keyword: String,
    pub turn: usize,
    pub start: usize,
    pub end: usize,
}

impl AnalysisResult {
    pub fn new(audio_url: impl Into<String>) -> Self {
        Self {
            audio_url: audio_url.into(),
            duration_ms: None,
            turns: Vec::new(),
            events: Vec::new(),
            keywords: Vec::new(),
            topic: None,
            sentiment: None,
        }
    }

    /// Check internal consistency. Every violation is reported, never
    /// repaired.
    pub fn validate(&self) -> Result<(), MapError> {
        if self.audio_url.trim().is_empty() {
            return Err(MapError::MalformedAnalysis("audio_url is empty".to_string()));
        }
        for (idx, turn) in self.turns.iter().enumerate() {
            if turn.end_ms < turn.start_ms {
                return Err(MapError::MalformedAnalysis(format!(
                    "turn {} ends ({}ms) before it starts ({}ms)",
                    idx, turn.end_ms, turn.start_ms
                )));
            }
        }
        for (idx, event) in self.events.iter().enumerate() {
            if event.end_ms < event.start_ms {
                return Err(MapError::MalformedAnalysis(format!(
                    "event {} ('{}') ends before it starts",
                    idx, event.label
                )));
            }
        }
        for (idx, span) in self.keywords.iter().enumerate() {
            let turn = self.turns.get(span.turn).ok_or_else(|| {
                MapError::MalformedAnalysis(format!(
                    "keyword {} refers to turn {} of {}",
                    idx,
                    span.turn,
                    self.turns.len()
                ))
            })?;
            let chars: Vec<char> = turn.text.chars().collect();
            if span.start >= span.end || span.end > chars.len() {
                return Err(MapError::MalformedAnalysis(format!(
                    "keyword {} range {}..{} outside turn {} text",
                    idx, span.start, span.end, span.turn
                )));
            }
            let found: String = chars[span.start..span.end].iter().collect();
            if found.to_lowercase() != span.keyword.to_lowercase() {
                return Err(MapError::MalformedAnalysis(format!(
                    "keyword {} expected '{}' but turn {} has '{}'",
                    idx, span.keyword, span.turn, found
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegionKind {
    SpeakerTurn,
    Lyrics,
    Event,
}

/// Annotated span inside a region's text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextSpan {
    pub id: String,
    pub keyword: String,
    pub start: usize,
    pub end: usize,
}

/// Timed region; times are in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub id: String,
    pub kind: RegionKind,
    pub start: f64,
    pub end: f64,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub spans: Vec<TextSpan>,
    /// Per-region choices keyed by control name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

/// Whole-task choice, e.g. topic or overall sentiment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Choice {
    pub control: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationRecord {
    pub task_type: TaskType,
    pub template: String,
    pub audio_url: String,
    pub regions: Vec<Region>,
    #[serde(default)]
    pub choices: Vec<Choice>,
}

impl AnnotationRecord {
    pub fn region(&self, id: &str) -> Option<&Region> {
        self.regions.iter().find(|r| r.id == id)
    }

    /// Distinct speaker labels in first-seen order.
    pub fn speakers(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for speaker in self.regions.iter().filter_map(|r| r.speaker.as_deref()) {
            if !out.contains(&speaker) {
                out.push(speaker);
            }
        }
        out
    }

    /// Distinct event labels in first-seen order.
    pub fn event_labels(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for region in self.regions.iter().filter(|r| r.kind == RegionKind::Event) {
            if !out.contains(&region.label.as_str()) {
                out.push(region.label.as_str());
            }
        }
        out
    }

    /// Labeling-config XML for this record's template.
    pub fn label_config(&self) -> String {
        self.task_type.template().label_config(self)
    }

    /// Task import payload: `{data: {audio}, annotations: [{result}]}`.
    pub fn to_import_task(&self) -> Value {
        let template = self.task_type.template();
        let mut result = Vec::new();
        for region in &self.regions {
            let timing = |extra: Value| {
                let mut value = json!({"start": region.start, "end": region.end, "channel": 0});
                if let (Some(base), Some(more)) = (value.as_object_mut(), extra.as_object()) {
                    base.extend(more.clone());
                }
                value
            };
            let item = |from_name: &str, kind: &str, value: Value| {
                json!({
                    "id": region.id,
                    "from_name": from_name,
                    "to_name": "audio",
                    "type": kind,
                    "origin": "prediction",
                    "value": value,
                })
            };

            result.push(item(
                template.labels_control,
                "labels",
                timing(json!({"labels": [region.label]})),
            ));
            if let Some(text) = &region.text {
                result.push(item(
                    template.text_control,
                    "textarea",
                    timing(json!({"text": [text]})),
                ));
            }
            if let Some(speaker) = &region.speaker {
                result.push(item(
                    template.speaker_control,
                    "choices",
                    timing(json!({"choices": [speaker]})),
                ));
            }
            for (control, choice) in &region.attributes {
                result.push(item(control.as_str(), "choices", timing(json!({"choices": [choice]}))));
            }
            for span in &region.spans {
                result.push(json!({
                    "id": span.id,
                    "parentID": region.id,
                    "from_name": template.keyword_control,
                    "to_name": "audio",
                    "type": "textarea",
                    "origin": "prediction",
                    "value": timing(json!({"text": [span.keyword]})),
                    "meta": {"text_range": [span.start, span.end]},
                }));
            }
        }
        for choice in &self.choices {
            result.push(json!({
                "id": format!("choice-{}", choice.control),
                "from_name": choice.control,
                "to_name": "audio",
                "type": "choices",
                "origin": "prediction",
                "value": {"choices": [choice.value]},
            }));
        }

        json!({
            "data": {"audio": self.audio_url},
            "annotations": [{"result": result}],
        })
    }
}

/// Map an analysis payload for `task_type`. Pure.
pub fn map_analysis(task_type: TaskType, analysis: &AnalysisResult) -> Result<AnnotationRecord, MapError> {
    analysis.validate()?;
    let template = task_type.template();
    let mut regions = Vec::new();

    let speaker_mode = template.turns == TurnMode::Speaker;
    for (idx, turn) in analysis.turns.iter().enumerate() {
        let id = format!("turn-{}", idx);
        let spans = if template.keywords {
            analysis
                .keywords
                .iter()
                .enumerate()
                .filter(|(_, span)| span.turn == idx)
                .map(|(k, span)| TextSpan {
                    id: format!("{}-kw-{}", id, k),
                    keyword: span.keyword.clone(),
                    start: span.start,
                    end: span.end,
                })
                .collect()
        } else {
            Vec::new()
        };
        let mut attributes = BTreeMap::new();
        if speaker_mode {
            if let Some(gender) = &turn.gender {
                attributes.insert("gender".to_string(), gender.clone());
            }
            if let Some(sentiment) = &turn.sentiment {
                attributes.insert("segment_sentiment".to_string(), sentiment.clone());
            }
        }
        regions.push(Region {
            id,
            kind: if speaker_mode {
                RegionKind::SpeakerTurn
            } else {
                RegionKind::Lyrics
            },
            start: seconds(turn.start_ms),
            end: seconds(turn.end_ms),
            label: template.turn_label.to_string(),
            speaker: speaker_mode.then(|| turn.speaker.clone()),
            text: Some(turn.text.clone()),
            spans,
            attributes,
        });
    }

    for (idx, event) in analysis.events.iter().enumerate() {
        regions.push(Region {
            id: format!("event-{}", idx),
            kind: RegionKind::Event,
            start: seconds(event.start_ms),
            end: seconds(event.end_ms),
            label: event.label.clone(),
            speaker: None,
            text: None,
            spans: Vec::new(),
            attributes: BTreeMap::new(),
        });
    }

    let mut choices = Vec::new();
    if let Some(topic) = &analysis.topic {
        choices.push(Choice {
            control: "topic".to_string(),
            value: topic.clone(),
        });
    }
    if let Some(sentiment) = &analysis.sentiment {
        choices.push(Choice {
            control: "global_sentiment".to_string(),
            value: sentiment.clone(),
        });
    }

    Ok(AnnotationRecord {
        task_type,
        template: template.name.to_string(),
        audio_url: analysis.audio_url.clone(),
        regions,
        choices,
    })
}

fn seconds(ms: u64) -> f64 {
    ms as f64 / 1000.0
}

/// Resolves analysis references and maps them.
pub struct SchemaMapper {
    store: Arc<dyn ResultStore>,
}

impl SchemaMapper {
    pub fn new(store: Arc<dyn ResultStore>) -> Self {
        Self { store }
    }

    pub async fn map(&self, task_type: &str, analysis_ref: &ResultRef) -> Result<AnnotationRecord, MapError> {
        let task_type = task_type.parse::<TaskType>()?;
        let payload = self.store.get(analysis_ref).await?;
        let record = self.map_value(task_type, &payload)?;
        tracing::debug!(
            run_id = %analysis_ref.run_id,
            task_type = %task_type,
            regions = record.regions.len(),
            "analysis mapped"
        );
        Ok(record)
    }

    /// Map an already resolved payload.
    pub fn map_value(&self, task_type: TaskType, payload: &Value) -> Result<AnnotationRecord, MapError> {
        let analysis: AnalysisResult = serde_json::from_value(payload.clone())
            .map_err(|err| MapError::MalformedAnalysis(err.to_string()))?;
        map_analysis(task_type, &analysis)
    }
}
