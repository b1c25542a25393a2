use std::fmt::Write;

use super::{AnnotationRecord, TaskType};

/// How speaker turns are rendered by a template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnMode {
    /// Timed region with speaker choice and transcript text area.
    Speaker,
    /// Timed "vocals" region carrying the lyrics, no speaker.
    Lyrics,
}

/// Labeling template: how turns and keywords are rendered and the control
/// names they land in. Detected events are always kept as timed regions.
#[derive(Debug)]
pub struct Template {
    pub task_type: TaskType,
    pub name: &'static str,
    pub turns: TurnMode,
    pub keywords: bool,
    pub turn_label: &'static str,
    pub labels_control: &'static str,
    pub text_control: &'static str,
    pub speaker_control: &'static str,
    pub keyword_control: &'static str,
}

static SPEECH: Template = Template {
    task_type: TaskType::Speech,
    name: "speech",
    turns: TurnMode::Speaker,
    keywords: true,
    turn_label: "speech",
    labels_control: "labels",
    text_control: "segment_transcription",
    speaker_control: "speaker",
    keyword_control: "keywords",
};

static MUSIC: Template = Template {
    task_type: TaskType::Music,
    name: "music",
    turns: TurnMode::Lyrics,
    keywords: false,
    turn_label: "vocals",
    labels_control: "labels",
    text_control: "lyrics",
    speaker_control: "speaker",
    keyword_control: "keywords",
};

static MIXED: Template = Template {
    task_type: TaskType::Mixed,
    name: "mixed",
    turns: TurnMode::Speaker,
    keywords: true,
    turn_label: "speech",
    labels_control: "labels",
    text_control: "segment_transcription",
    speaker_control: "speaker",
    keyword_control: "keywords",
};

const GENDERS: &[&str] = &["male", "female", "unknown"];
const SENTIMENTS: &[&str] = &["positive", "neutral", "negative"];

impl Template {
    pub fn for_task_type(task_type: TaskType) -> &'static Template {
        match task_type {
            TaskType::Speech => &SPEECH,
            TaskType::Music => &MUSIC,
            TaskType::Mixed => &MIXED,
        }
    }

    /// Render the labeling-config XML for a project holding `record`.
    ///
    /// Label and choice values cover everything the record uses, so the
    /// imported prediction always validates against the project.
    pub fn label_config(&self, record: &AnnotationRecord) -> String {
        let mut labels: Vec<&str> = vec![self.turn_label];
        for label in record.event_labels() {
            if !labels.contains(&label) {
                labels.push(label);
            }
        }

        let mut xml = String::from("<View>\n");
        xml.push_str("  <Audio name=\"audio\" value=\"$audio\"/>\n");
        push_labels(&mut xml, self.labels_control, &labels);

        let _ = writeln!(
            xml,
            "  <TextArea name=\"{}\" toName=\"audio\" perRegion=\"true\" editable=\"true\"/>",
            self.text_control
        );
        if self.turns == TurnMode::Speaker {
            push_choices(&mut xml, self.speaker_control, &record.speakers(), true);
            push_choices(&mut xml, "gender", GENDERS, true);
            push_choices(&mut xml, "segment_sentiment", SENTIMENTS, true);
        }
        if self.keywords {
            let _ = writeln!(
                xml,
                "  <TextArea name=\"{}\" toName=\"audio\" perRegion=\"true\"/>",
                self.keyword_control
            );
        }
        xml.push_str("  <TextArea name=\"topic\" toName=\"audio\" maxSubmissions=\"1\"/>\n");
        push_choices(&mut xml, "global_sentiment", SENTIMENTS, false);
        xml.push_str("</View>\n");
        xml
    }
}

fn push_labels(xml: &mut String, name: &str, values: &[&str]) {
    let _ = writeln!(xml, "  <Labels name=\"{}\" toName=\"audio\">", name);
    for value in values {
        let _ = writeln!(xml, "    <Label value=\"{}\"/>", escape(value));
    }
    xml.push_str("  </Labels>\n");
}

fn push_choices(xml: &mut String, name: &str, values: &[&str], per_region: bool) {
    let scope = if per_region { " perRegion=\"true\"" } else { "" };
    let _ = writeln!(xml, "  <Choices name=\"{}\" toName=\"audio\"{}>", name, scope);
    for value in values {
        let _ = writeln!(xml, "    <Choice value=\"{}\"/>", escape(value));
    }
    xml.push_str("  </Choices>\n");
}

fn escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::{map_analysis, AnalysisResult, AudioEvent, SpeakerTurn};

    fn analysis() -> AnalysisResult {
        let mut analysis = AnalysisResult::new("https://a.test/a.wav");
        analysis.turns.push(SpeakerTurn {
            speaker: "speaker 3".to_string(),
            start_ms: 0,
            end_ms: 1000,
            text: "hello".to_string(),
            gender: None,
            sentiment: None,
        });
        analysis.events.push(AudioEvent {
            label: "door <slam>".to_string(),
            start_ms: 200,
            end_ms: 400,
            confidence: Some(0.9),
        });
        analysis
    }

    #[test]
    fn test_speech_config_lists_speakers_and_events() {
        let record = map_analysis(TaskType::Speech, &analysis()).expect("map");
        let xml = record.label_config();
        assert!(xml.contains("<Audio name=\"audio\" value=\"$audio\"/>"));
        assert!(xml.contains("<Choice value=\"speaker 3\"/>"));
        assert!(xml.contains("name=\"segment_transcription\""));
        assert!(xml.contains("<Label value=\"speech\"/>"));
        assert!(xml.contains("<Label value=\"door &lt;slam&gt;\"/>"));
    }

    #[test]
    fn test_music_config_escapes_event_labels() {
        let record = map_analysis(TaskType::Music, &analysis()).expect("map");
        let xml = record.label_config();
        assert!(xml.contains("<Label value=\"vocals\"/>"));
        assert!(xml.contains("<Label value=\"door &lt;slam&gt;\"/>"));
        assert!(xml.contains("name=\"lyrics\""));
        assert!(!xml.contains("name=\"speaker\""));
    }
}
