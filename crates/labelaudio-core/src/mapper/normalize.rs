use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{AnalysisResult, AudioEvent, KeywordSpan, MapError, SpeakerTurn};

/// Raw provider outputs feeding one normalized analysis. Each part is
/// optional; a missing part simply contributes nothing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalysisArtifacts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diarization: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub events: Option<Value>,
    /// One keyword search result or an array of them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyword_hits: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker_analysis: Option<Value>,
}

#[derive(Deserialize)]
struct Transcript {
    #[serde(default)]
    text: String,
    #[serde(default)]
    duration_ms: Option<u64>,
    #[serde(default)]
    sentences: Vec<Sentence>,
}

#[derive(Deserialize)]
struct Sentence {
    #[serde(default)]
    text: String,
    #[serde(alias = "start_ms", alias = "start")]
    begin_time: u64,
    #[serde(alias = "end_ms", alias = "end")]
    end_time: u64,
    #[serde(default, alias = "speaker")]
    speaker_id: Option<Value>,
}

#[derive(Deserialize)]
struct Diarization {
    #[serde(alias = "segments")]
    turns: Vec<DiarizedTurn>,
}

#[derive(Deserialize)]
struct DiarizedTurn {
    #[serde(alias = "speaker_id")]
    speaker: Value,
    #[serde(alias = "begin_time", alias = "start")]
    start_ms: u64,
    #[serde(alias = "end_time", alias = "end")]
    end_ms: u64,
}

#[derive(Deserialize)]
struct Events {
    events: Vec<EventEntry>,
}

#[derive(Deserialize)]
struct EventEntry {
    #[serde(alias = "event_type", alias = "type")]
    label: String,
    #[serde(alias = "begin_time", alias = "start")]
    start_ms: u64,
    #[serde(alias = "end_time", alias = "end")]
    end_ms: u64,
    #[serde(default)]
    confidence: Option<f64>,
}

#[derive(Deserialize)]
struct KeywordHit {
    keyword: String,
    #[serde(default = "found_default")]
    found: bool,
}

fn found_default() -> bool {
    true
}

#[derive(Deserialize)]
struct SpeakerAnalysis {
    #[serde(default)]
    speakers: Vec<SpeakerProfile>,
    #[serde(default)]
    topic: Option<String>,
    #[serde(default)]
    sentiment: Option<String>,
}

#[derive(Deserialize)]
struct SpeakerProfile {
    speaker: Value,
    #[serde(default)]
    gender: Option<String>,
    #[serde(default, alias = "emotion")]
    sentiment: Option<String>,
}

fn parse<T: DeserializeOwned>(part: &str, value: &Option<Value>) -> Result<Option<T>, MapError> {
    value
        .as_ref()
        .map(|v| {
            serde_json::from_value(v.clone())
                .map_err(|err| MapError::MalformedAnalysis(format!("{}: {}", part, err)))
        })
        .transpose()
}

/// Merge provider artifacts into one normalized analysis.
///
/// Transcript sentences become turns; their speaker comes from the
/// sentence itself, else from the diarization turn overlapping it most,
/// else `speaker 0`. Without a transcript, diarization turns become
/// untranscribed turns. Keyword hits are located in every turn's text.
pub fn normalize_analysis(
    audio_url: &str,
    artifacts: &AnalysisArtifacts,
) -> Result<AnalysisResult, MapError> {
    let transcript: Option<Transcript> = parse("transcript", &artifacts.transcript)?;
    let diarization: Option<Diarization> = parse("diarization", &artifacts.diarization)?;
    let events: Option<Events> = parse("events", &artifacts.events)?;
    let profiles: Option<SpeakerAnalysis> =
        parse("speaker_analysis", &artifacts.speaker_analysis)?;
    let keyword_hits: Vec<KeywordHit> = match &artifacts.keyword_hits {
        Some(Value::Array(items)) => parse("keyword_hits", &Some(Value::Array(items.clone())))?
            .unwrap_or_default(),
        other => parse::<KeywordHit>("keyword_hits", other)?
            .into_iter()
            .collect(),
    };

    let diarized = diarization.map(|d| d.turns).unwrap_or_default();
    let mut analysis = AnalysisResult::new(audio_url);

    match transcript {
        Some(transcript) => {
            analysis.duration_ms = transcript.duration_ms;
            if transcript.sentences.is_empty() && !transcript.text.trim().is_empty() {
                analysis.turns.push(SpeakerTurn {
                    speaker: dominant_speaker(&diarized, 0, transcript.duration_ms.unwrap_or(0)),
                    start_ms: 0,
                    end_ms: transcript.duration_ms.unwrap_or(0),
                    text: transcript.text.trim().to_string(),
                    gender: None,
                    sentiment: None,
                });
            }
            for sentence in transcript.sentences {
                let speaker = match &sentence.speaker_id {
                    Some(id) => speaker_label(id),
                    None => dominant_speaker(&diarized, sentence.begin_time, sentence.end_time),
                };
                analysis.turns.push(SpeakerTurn {
                    speaker,
                    start_ms: sentence.begin_time,
                    end_ms: sentence.end_time,
                    text: sentence.text,
                    gender: None,
                    sentiment: None,
                });
            }
        }
        None => {
            for turn in &diarized {
                analysis.turns.push(SpeakerTurn {
                    speaker: speaker_label(&turn.speaker),
                    start_ms: turn.start_ms,
                    end_ms: turn.end_ms,
                    text: String::new(),
                    gender: None,
                    sentiment: None,
                });
            }
        }
    }

    if let Some(events) = events {
        analysis.events = events
            .events
            .into_iter()
            .map(|e| AudioEvent {
                label: e.label,
                start_ms: e.start_ms,
                end_ms: e.end_ms,
                confidence: e.confidence,
            })
            .collect();
    }

    for hit in keyword_hits.iter().filter(|hit| hit.found) {
        for (turn_idx, turn) in analysis.turns.iter().enumerate() {
            for (start, end) in find_all(&turn.text, &hit.keyword) {
                analysis.keywords.push(KeywordSpan {
                    keyword: hit.keyword.clone(),
                    turn: turn_idx,
                    start,
                    end,
                });
            }
        }
    }

    if let Some(profiles) = profiles {
        for profile in &profiles.speakers {
            let label = speaker_label(&profile.speaker);
            for turn in analysis.turns.iter_mut().filter(|t| t.speaker == label) {
                turn.gender = profile.gender.clone();
                turn.sentiment = profile.sentiment.clone();
            }
        }
        analysis.topic = profiles.topic;
        analysis.sentiment = profiles.sentiment;
    }

    if analysis.duration_ms.is_none() {
        analysis.duration_ms = analysis
            .turns
            .iter()
            .map(|t| t.end_ms)
            .chain(analysis.events.iter().map(|e| e.end_ms))
            .max();
    }

    analysis.validate()?;
    Ok(analysis)
}

fn speaker_label(id: &Value) -> String {
    match id {
        Value::Number(n) => format!("speaker {}", n),
        Value::String(s) if s.trim().parse::<u64>().is_ok() => format!("speaker {}", s.trim()),
        Value::String(s) => s.trim().to_string(),
        other => format!("speaker {}", other),
    }
}

fn dominant_speaker(turns: &[DiarizedTurn], start_ms: u64, end_ms: u64) -> String {
    turns
        .iter()
        .map(|t| (t.end_ms.min(end_ms).saturating_sub(t.start_ms.max(start_ms)), t))
        .filter(|(overlap, _)| *overlap > 0)
        .max_by_key(|(overlap, _)| *overlap)
        .map(|(_, t)| speaker_label(&t.speaker))
        .unwrap_or_else(|| "speaker 0".to_string())
}

/// Non-overlapping, case-insensitive char ranges of `needle` in `text`.
fn find_all(text: &str, needle: &str) -> Vec<(usize, usize)> {
    let hay: Vec<char> = text.chars().collect();
    let pat: Vec<char> = needle.trim().chars().collect();
    let mut out = Vec::new();
    if pat.is_empty() {
        return out;
    }
    let mut i = 0;
    while i + pat.len() <= hay.len() {
        let hit = hay[i..i + pat.len()]
            .iter()
            .zip(&pat)
            .all(|(a, b)| a.to_lowercase().eq(b.to_lowercase()));
        if hit {
            out.push((i, i + pat.len()));
            i += pat.len();
        } else {
            i += 1;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::{map_analysis, TaskType};
    use serde_json::json;

    fn transcript() -> Value {
        json!({
            "text": "Hello, I need a Refund. Sure, refund approved.",
            "duration_ms": 6000,
            "sentences": [
                {"id": 0, "text": "Hello, I need a Refund.", "begin_time": 0, "end_time": 2500},
                {"id": 1, "text": "Sure, refund approved.", "begin_time": 2600, "end_time": 6000}
            ]
        })
    }

    #[test]
    fn test_speakers_come_from_diarization_overlap() {
        let artifacts = AnalysisArtifacts {
            transcript: Some(transcript()),
            diarization: Some(json!({"turns": [
                {"speaker": 0, "start_ms": 0, "end_ms": 2550},
                {"speaker": 1, "start_ms": 2550, "end_ms": 6000}
            ]})),
            ..Default::default()
        };
        let analysis = normalize_analysis("https://a.test/c.wav", &artifacts).expect("normalize");
        let speakers: Vec<&str> = analysis.turns.iter().map(|t| t.speaker.as_str()).collect();
        assert_eq!(speakers, vec!["speaker 0", "speaker 1"]);
        assert_eq!(analysis.duration_ms, Some(6000));
    }

    #[test]
    fn test_keyword_hits_located_case_insensitively() {
        let artifacts = AnalysisArtifacts {
            transcript: Some(transcript()),
            keyword_hits: Some(json!({"keyword": "refund", "found": true, "time_positions": []})),
            ..Default::default()
        };
        let analysis = normalize_analysis("https://a.test/c.wav", &artifacts).expect("normalize");
        assert_eq!(
            analysis.keywords,
            vec![
                KeywordSpan { keyword: "refund".to_string(), turn: 0, start: 16, end: 22 },
                KeywordSpan { keyword: "refund".to_string(), turn: 1, start: 6, end: 12 },
            ]
        );

        let record = map_analysis(TaskType::Speech, &analysis).expect("map");
        assert_eq!(record.regions[0].spans.len(), 1);
        assert_eq!(record.regions[1].spans.len(), 1);
    }

    #[test]
    fn test_not_found_keyword_adds_nothing() {
        let artifacts = AnalysisArtifacts {
            transcript: Some(transcript()),
            keyword_hits: Some(json!([{"keyword": "refund", "found": false}])),
            ..Default::default()
        };
        let analysis = normalize_analysis("https://a.test/c.wav", &artifacts).expect("normalize");
        assert!(analysis.keywords.is_empty());
    }

    #[test]
    fn test_diarization_only_and_profiles() {
        let artifacts = AnalysisArtifacts {
            diarization: Some(json!({"turns": [{"speaker": "2", "begin_time": 100, "end_time": 900}]})),
            events: Some(json!({"events": [{"event_type": "applause", "start": 500, "end": 800}]})),
            speaker_analysis: Some(json!({
                "speakers": [{"speaker": 2, "gender": "male", "emotion": "positive"}],
                "topic": "keynote"
            })),
            ..Default::default()
        };
        let analysis = normalize_analysis("https://a.test/c.wav", &artifacts).expect("normalize");
        assert_eq!(analysis.turns.len(), 1);
        assert_eq!(analysis.turns[0].speaker, "speaker 2");
        assert_eq!(analysis.turns[0].gender.as_deref(), Some("male"));
        assert_eq!(analysis.turns[0].sentiment.as_deref(), Some("positive"));
        assert_eq!(analysis.events[0].label, "applause");
        assert_eq!(analysis.topic.as_deref(), Some("keynote"));
        assert_eq!(analysis.duration_ms, Some(900));
    }

    #[test]
    fn test_inconsistent_artifact_is_malformed() {
        let artifacts = AnalysisArtifacts {
            events: Some(json!({"events": [{"label": "bang", "start_ms": 900, "end_ms": 100}]})),
            ..Default::default()
        };
        assert!(matches!(
            normalize_analysis("https://a.test/c.wav", &artifacts),
            Err(MapError::MalformedAnalysis(_))
        ));

        let shapeless = AnalysisArtifacts {
            diarization: Some(json!({"speakers": 2})),
            ..Default::default()
        };
        assert!(matches!(
            normalize_analysis("https://a.test/c.wav", &shapeless),
            Err(MapError::MalformedAnalysis(ref msg)) if msg.starts_with("diarization")
        ));
    }
}
