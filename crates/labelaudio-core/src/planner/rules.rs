use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};
use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::LazyLock;

use super::{BuildError, IntentClassifier, IntentMatch};
use crate::capability::CapabilityRegistry;
use crate::types::Instruction;

static URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"https?://[^\s"'<>，。；、）)]+"#).expect("valid url regex")
});

static QUOTED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""[^"]*"|“[^”]*”|「[^」]*」"#).expect("valid quote regex"));

static CLAUSE_SPLIT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\s*(?:[;；。]|\bthen\b|\bafter that\b|\bafterwards\b|\bfinally\b|然后|接着|之后|最后)\s*")
        .expect("valid clause regex")
});

static LANGUAGE_CODE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:language|lang)\s*(?:is|=|:)?\s*(zh|en|ja|ko|yue|de|fr|ru)\b")
        .expect("valid language regex")
});

static LANGUAGE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\bin (chinese|mandarin|english|japanese|korean|cantonese|german|french|russian)\b|(中文|普通话|英文|英语|日语|韩语|粤语|德语|法语|俄语)",
    )
    .expect("valid language name regex")
});

static KEYWORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)(?:\bkeywords?|\bsearch for|\blook for|\bfind)\s*(?:is|=|:)?\s*["“「]([^"”」]+)["”」]|关键词\s*[:：]?\s*["“「]?([^"”」\s，。,]+)"#,
    )
    .expect("valid keyword regex")
});

static PROJECT_TITLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\bproject\s+(?:title\s+|named\s+|called\s+)?(?:is\s+|=\s*|:\s*)?["“]([^"”]+)["”]"#)
        .expect("valid project regex")
});

static TASK_TYPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\btask[ _-]?type\s*(?:is|=|:)?\s*(speech|music|mixed)\b")
        .expect("valid task type regex")
});

static SPEAKER_COUNT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(\d{1,3})\s+speakers\b|(\d{1,3})\s*(?:个|位)说话人")
        .expect("valid speaker count regex")
});

static DEFAULT_RULES: LazyLock<Vec<IntentRule>> = LazyLock::new(|| {
    let rule = |target: RuleTarget, pattern: &str| IntentRule {
        pattern: Regex::new(pattern).expect("valid intent regex"),
        target,
    };
    let single = |name: &str| RuleTarget::Capability(name.to_string());
    vec![
        rule(
            single("transcribe_audio"),
            r"(?i)\btranscri\w*|\bspeech[- ]to[- ]text\b|\basr\b|转写|转录|语音识别",
        ),
        rule(
            single("diarize_speakers"),
            r"(?i)\bdiari[sz]\w*|\bwho (?:is )?speaking\b|\bspeaker (?:turns?|separation|segmentation|identification)\b|说话人分离|区分说话人",
        ),
        rule(
            single("detect_audio_events"),
            r"(?i)\b(?:sound|audio|acoustic) events?\b|\bevent detection\b|\bdetect (?:the )?events\b|\bsound effects?\b|声音事件|音频事件|事件检测",
        ),
        rule(
            single("search_keyword"),
            r"(?i)\bkeywords?\b|\bsearch for\b|\blook for\b|\bfind (?:the )?(?:word|phrase|mentions?)\b|关键词|搜索",
        ),
        rule(
            single("analyze_speaker"),
            r"(?i)\bspeaker (?:analysis|profiles?|attributes)\b|\bemotions?\b|\bsentiment\b|\bgender\b|情绪|情感|性别|说话人分析",
        ),
        rule(
            single("annotate_audio"),
            r"(?i)\bannotat\w*|\blabel studio\b|\blabell?ing\b|\bimport\b|标注|导入",
        ),
        rule(
            RuleTarget::Composite(vec![
                "transcribe_audio".to_string(),
                "diarize_speakers".to_string(),
                "detect_audio_events".to_string(),
            ]),
            r"(?i)\b(?:comprehensive|full|complete|overall)\s+(?:audio\s+)?analy\w+|全面分析|综合分析|完整分析",
        ),
    ]
});

/// What a rule resolves to when it fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleTarget {
    Capability(String),
    /// A broad intent standing for several independent capabilities.
    Composite(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct IntentRule {
    pub pattern: Regex,
    pub target: RuleTarget,
}

impl IntentRule {
    pub fn capability(name: impl Into<String>, pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            target: RuleTarget::Capability(name.into()),
        })
    }

    pub fn composite(members: Vec<String>, pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            target: RuleTarget::Composite(members),
        })
    }
}

/// Keyword classifier over ordered clauses.
///
/// The instruction is split on sequencing words ("then", "然后", ";"), and
/// each clause contributes its matches in textual order. Overlapping
/// matches are settled by narrowest output schema, then longest match, then
/// registration order. A composite rule fires only in a clause where no
/// single capability matched.
#[derive(Debug, Clone)]
pub struct RuleClassifier {
    rules: Vec<IntentRule>,
}

impl Default for RuleClassifier {
    fn default() -> Self {
        Self {
            rules: DEFAULT_RULES.clone(),
        }
    }
}

struct Candidate<'a> {
    capability: &'a str,
    start: usize,
    end: usize,
    breadth: usize,
    position: usize,
}

impl Candidate<'_> {
    fn overlaps(&self, other: &Candidate<'_>) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl RuleClassifier {
    pub fn new(rules: Vec<IntentRule>) -> Self {
        Self { rules }
    }

    pub fn with_rule(mut self, rule: IntentRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn rules(&self) -> &[IntentRule] {
        &self.rules
    }

    /// Classify without the async wrapper; used as a fallback elsewhere.
    pub fn classify_text(&self, text: &str, registry: &CapabilityRegistry) -> Vec<IntentMatch> {
        let masked = mask_literals(text);
        let arguments = extract_parameters(text);
        let mut matches = Vec::new();

        for (clause_start, clause_end) in clause_ranges(&masked) {
            let clause = &masked[clause_start..clause_end];
            let mut singles: Vec<Candidate<'_>> = Vec::new();
            let mut composite: Option<(usize, &[String])> = None;

            for rule in &self.rules {
                for found in rule.pattern.find_iter(clause) {
                    match &rule.target {
                        RuleTarget::Capability(name) => {
                            let Some(position) = registry.position(name) else {
                                continue;
                            };
                            let breadth = registry
                                .lookup(name)
                                .map(|d| d.output_breadth())
                                .unwrap_or(usize::MAX);
                            singles.push(Candidate {
                                capability: name,
                                start: clause_start + found.start(),
                                end: clause_start + found.end(),
                                breadth,
                                position,
                            });
                        }
                        RuleTarget::Composite(members) => {
                            if composite.map_or(true, |(start, _)| found.start() < start) {
                                composite = Some((found.start(), members.as_slice()));
                            }
                        }
                    }
                }
            }

            singles.sort_by_key(|c| (c.breadth, Reverse(c.end - c.start), c.position, c.start));
            let mut selected: Vec<Candidate<'_>> = Vec::new();
            for candidate in singles {
                let clash = selected
                    .iter()
                    .any(|s| s.overlaps(&candidate) || s.capability == candidate.capability);
                if !clash {
                    selected.push(candidate);
                }
            }
            selected.sort_by_key(|c| c.start);

            if !selected.is_empty() {
                for candidate in selected {
                    matches.push(
                        IntentMatch::new(candidate.capability)
                            .with_arguments(arguments.clone())
                            .with_evidence(text.get(candidate.start..candidate.end).unwrap_or_default()),
                    );
                }
            } else if let Some((_, members)) = composite {
                let evidence = text.get(clause_start..clause_end).unwrap_or_default().trim();
                for member in members.iter().filter(|m| registry.contains(m)) {
                    matches.push(
                        IntentMatch::new(member.clone())
                            .with_arguments(arguments.clone())
                            .with_evidence(evidence),
                    );
                }
            }
        }
        matches
    }
}

#[async_trait]
impl IntentClassifier for RuleClassifier {
    fn name(&self) -> &str {
        "rules"
    }

    async fn classify(
        &self,
        instruction: &Instruction,
        registry: &CapabilityRegistry,
    ) -> Result<Vec<IntentMatch>, BuildError> {
        Ok(self.classify_text(&instruction.text, registry))
    }
}

/// Blank out URLs and quoted text so their contents never trigger a rule.
/// Byte offsets are preserved.
fn mask_literals(text: &str) -> String {
    let blank = |caps: &regex::Captures<'_>| " ".repeat(caps[0].len());
    let masked = URL.replace_all(text, blank);
    QUOTED.replace_all(&masked, blank).into_owned()
}

fn clause_ranges(masked: &str) -> Vec<(usize, usize)> {
    let mut ranges = Vec::new();
    let mut start = 0;
    for sep in CLAUSE_SPLIT.find_iter(masked) {
        if sep.start() > start {
            ranges.push((start, sep.start()));
        }
        start = sep.end();
    }
    if start < masked.len() {
        ranges.push((start, masked.len()));
    }
    ranges
}

/// Pull well-known parameters out of free text.
///
/// Recognised: `audio_url`, `language`, `keyword`, `project_title`,
/// `task_type` and `speaker_count`.
pub fn extract_parameters(text: &str) -> BTreeMap<String, Value> {
    let mut params = BTreeMap::new();

    if let Some(found) = URL.find(text) {
        let url = found
            .as_str()
            .trim_end_matches(|c: char| matches!(c, '.' | ',' | ';' | ':' | '!' | '?'));
        params.insert("audio_url".to_string(), json!(url));
    }

    let language = LANGUAGE_CODE
        .captures(text)
        .map(|caps| caps[1].to_ascii_lowercase())
        .or_else(|| {
            LANGUAGE_NAME.captures(text).and_then(|caps| {
                caps.get(1)
                    .or_else(|| caps.get(2))
                    .and_then(|m| language_code(m.as_str()))
                    .map(ToString::to_string)
            })
        });
    if let Some(language) = language {
        params.insert("language".to_string(), json!(language));
    }

    if let Some(caps) = KEYWORD.captures(text) {
        if let Some(keyword) = caps.get(1).or_else(|| caps.get(2)) {
            let keyword = keyword.as_str().trim();
            if !keyword.is_empty() {
                params.insert("keyword".to_string(), json!(keyword));
            }
        }
    }

    if let Some(caps) = PROJECT_TITLE.captures(text) {
        params.insert("project_title".to_string(), json!(caps[1].trim()));
    }

    if let Some(caps) = TASK_TYPE.captures(text) {
        params.insert("task_type".to_string(), json!(caps[1].to_ascii_lowercase()));
    }

    if let Some(caps) = SPEAKER_COUNT.captures(text) {
        let count = caps
            .get(1)
            .or_else(|| caps.get(2))
            .and_then(|m| m.as_str().parse::<u64>().ok());
        if let Some(count) = count {
            params.insert("speaker_count".to_string(), json!(count));
        }
    }

    params
}

fn language_code(name: &str) -> Option<&'static str> {
    let code = match name.to_lowercase().as_str() {
        "chinese" | "mandarin" | "中文" | "普通话" => "zh",
        "english" | "英文" | "英语" => "en",
        "japanese" | "日语" => "ja",
        "korean" | "韩语" => "ko",
        "cantonese" | "粤语" => "yue",
        "german" | "德语" => "de",
        "french" | "法语" => "fr",
        "russian" | "俄语" => "ru",
        _ => return None,
    };
    Some(code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{CapabilityDescriptor, TransportHandle};
    use crate::planner::fixtures;

    fn names(matches: &[IntentMatch]) -> Vec<&str> {
        matches.iter().map(|m| m.capability.as_str()).collect()
    }

    #[test]
    fn test_extract_parameters() {
        let params = extract_parameters(
            "Search for \"refund policy\" in https://a.test/x.wav. language: EN, task type mixed, 3 speakers, project named \"Calls Q3\"",
        );
        assert_eq!(params.get("audio_url"), Some(&json!("https://a.test/x.wav")));
        assert_eq!(params.get("keyword"), Some(&json!("refund policy")));
        assert_eq!(params.get("language"), Some(&json!("en")));
        assert_eq!(params.get("task_type"), Some(&json!("mixed")));
        assert_eq!(params.get("speaker_count"), Some(&json!(3)));
        assert_eq!(params.get("project_title"), Some(&json!("Calls Q3")));
    }

    #[test]
    fn test_extract_chinese_parameters() {
        let params = extract_parameters("转写这段粤语音频 https://a.test/y.mp3，关键词：退款");
        assert_eq!(params.get("audio_url"), Some(&json!("https://a.test/y.mp3")));
        assert_eq!(params.get("language"), Some(&json!("yue")));
        assert_eq!(params.get("keyword"), Some(&json!("退款")));
    }

    #[test]
    fn test_url_contents_do_not_trigger_rules() {
        let registry = fixtures::registry();
        let matches = RuleClassifier::default()
            .classify_text("diarize https://a.test/transcribe/annotate.wav", &registry);
        assert_eq!(names(&matches), vec!["diarize_speakers"]);
    }

    #[test]
    fn test_single_match_beats_composite_in_same_clause() {
        let registry = fixtures::registry();
        let matches = RuleClassifier::default().classify_text(
            "comprehensive analysis, mainly transcription of https://a.test/x.wav",
            &registry,
        );
        assert_eq!(names(&matches), vec!["transcribe_audio"]);
    }

    #[test]
    fn test_clauses_keep_textual_order() {
        let registry = fixtures::registry();
        let matches = RuleClassifier::default().classify_text(
            "detect sound events and transcribe it; then annotate",
            &registry,
        );
        assert_eq!(
            names(&matches),
            vec!["detect_audio_events", "transcribe_audio", "annotate_audio"]
        );
        assert_eq!(matches[0].evidence, "sound events");
    }

    #[test]
    fn test_unregistered_rule_targets_are_skipped() {
        let registry = fixtures::registry();
        let matches = RuleClassifier::default()
            .classify_text("analyze speaker emotion in https://a.test/x.wav", &registry);
        assert!(matches.is_empty());
    }

    fn overlapping_registry(narrow_first: bool) -> CapabilityRegistry {
        let wide = CapabilityDescriptor::new("profile", TransportHandle::local("t"))
            .with_output_schema(json!({"properties": {"a": {}, "b": {}, "c": {}}}));
        let narrow = CapabilityDescriptor::new("summary", TransportHandle::local("t"))
            .with_output_schema(json!({"properties": {"a": {}}}));
        let mut registry = CapabilityRegistry::new();
        let ordered = if narrow_first {
            vec![narrow, wide]
        } else {
            vec![wide, narrow]
        };
        registry.register_all(ordered).expect("register");
        registry
    }

    #[test]
    fn test_overlap_prefers_narrowest_output() {
        let classifier = RuleClassifier::new(vec![
            IntentRule::capability("profile", r"speaker profile summary").expect("rule"),
            IntentRule::capability("summary", r"profile summary").expect("rule"),
        ]);
        let matches =
            classifier.classify_text("give me a speaker profile summary", &overlapping_registry(false));
        assert_eq!(names(&matches), vec!["summary"]);
    }

    #[test]
    fn test_overlap_with_equal_breadth_prefers_longer_then_registration() {
        let mut registry = CapabilityRegistry::new();
        registry
            .register_all(vec![
                CapabilityDescriptor::new("first", TransportHandle::local("t")),
                CapabilityDescriptor::new("second", TransportHandle::local("t")),
            ])
            .expect("register");

        let longer = RuleClassifier::new(vec![
            IntentRule::capability("first", r"clean").expect("rule"),
            IntentRule::capability("second", r"clean up").expect("rule"),
        ]);
        assert_eq!(names(&longer.classify_text("clean up", &registry)), vec!["second"]);

        let same = RuleClassifier::new(vec![
            IntentRule::capability("second", r"tidy").expect("rule"),
            IntentRule::capability("first", r"tidy").expect("rule"),
        ]);
        assert_eq!(names(&same.classify_text("tidy", &registry)), vec!["first"]);
    }
}
