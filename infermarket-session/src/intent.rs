//! Intent routing: spot image-generation requests inside free-text prompts.
//!
//! The router looks only at the last user turn of a prompt, so a transcript
//! that mentions drawing in an earlier turn is not rerouted. Matching is
//! prefix-anchored: "describe the image" stays a text prompt.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::OperationKind;

// ═══════════════════════════════════════════════════════════════════════════════
// IMAGE PARAMETERS
// ═══════════════════════════════════════════════════════════════════════════════

/// Output dimensions for an image request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

impl ImageSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_allowed(&self) -> bool {
        ALLOWED_SIZES.contains(self)
    }
}

impl fmt::Display for ImageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Sizes hosts accept.
pub const ALLOWED_SIZES: [ImageSize; 6] = [
    ImageSize::new(256, 256),
    ImageSize::new(512, 512),
    ImageSize::new(768, 768),
    ImageSize::new(1024, 1024),
    ImageSize::new(1024, 768),
    ImageSize::new(768, 1024),
];

pub const DEFAULT_IMAGE_SIZE: ImageSize = ImageSize::new(512, 512);
pub const DEFAULT_STEPS: u32 = 20;
pub const MIN_STEPS: u32 = 1;
pub const MAX_STEPS: u32 = 50;

/// Parameters pulled out of a prompt. `None` means "use the default".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageParameters {
    pub size: Option<ImageSize>,
    pub steps: Option<u32>,
}

impl ImageParameters {
    pub fn size_or_default(&self) -> ImageSize {
        self.size.unwrap_or(DEFAULT_IMAGE_SIZE)
    }

    pub fn steps_or_default(&self) -> u32 {
        self.steps.unwrap_or(DEFAULT_STEPS)
    }
}

/// Routing decision for one prompt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IntentResult {
    pub is_structured_intent: bool,
    /// Prompt with trigger and parameter tokens removed. The untouched input
    /// when the prompt is not structured.
    pub clean_prompt: String,
    pub extracted_parameters: ImageParameters,
}

impl IntentResult {
    pub fn operation(&self) -> OperationKind {
        if self.is_structured_intent {
            OperationKind::ImageGeneration
        } else {
            OperationKind::TextStream
        }
    }

    fn text(prompt: &str) -> Self {
        Self {
            is_structured_intent: false,
            clean_prompt: prompt.to_string(),
            extracted_parameters: ImageParameters::default(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ROUTER
// ═══════════════════════════════════════════════════════════════════════════════

const DEFAULT_TRIGGERS: &[&str] = &[
    "generate an image of",
    "generate a picture of",
    "generate image of",
    "create an image of",
    "create a picture of",
    "create image of",
    "make an image of",
    "make a picture of",
    "draw me",
    "draw",
    "paint me",
    "paint",
    "sketch",
    "illustrate",
];

const USER_SPEAKERS: &[&str] = &["user", "human", "you"];
const OTHER_SPEAKERS: &[&str] = &["assistant", "ai", "bot", "system"];

/// Pure prompt classifier. Cheap to clone and share.
#[derive(Clone, Debug)]
pub struct IntentRouter {
    /// Lowercase triggers, longest first.
    triggers: Vec<String>,
}

impl Default for IntentRouter {
    fn default() -> Self {
        Self::with_triggers(DEFAULT_TRIGGERS.iter().copied())
    }
}

impl IntentRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_triggers<'a>(triggers: impl IntoIterator<Item = &'a str>) -> Self {
        let mut triggers: Vec<String> = triggers
            .into_iter()
            .map(|t| t.trim().to_ascii_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        triggers.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        triggers.dedup();
        Self { triggers }
    }

    pub fn route(&self, prompt: &str) -> IntentResult {
        let turn = last_user_turn(prompt);
        let turn = turn.trim();

        let Some(remainder) = self.strip_trigger(turn) else {
            return IntentResult::text(prompt);
        };

        let (clean_prompt, extracted_parameters) = extract_parameters(remainder);
        if clean_prompt.is_empty() {
            // "draw" with no subject is not something a host can render.
            return IntentResult::text(prompt);
        }

        tracing::debug!(
            size = ?extracted_parameters.size,
            steps = ?extracted_parameters.steps,
            "prompt routed to image generation"
        );

        IntentResult {
            is_structured_intent: true,
            clean_prompt,
            extracted_parameters,
        }
    }

    fn strip_trigger<'a>(&self, turn: &'a str) -> Option<&'a str> {
        let lower = turn.to_ascii_lowercase();
        self.triggers.iter().find_map(|trigger| {
            if !lower.starts_with(trigger.as_str()) {
                return None;
            }
            let rest = &turn[trigger.len()..];
            match rest.chars().next() {
                Some(c) if c.is_alphanumeric() => None,
                _ => Some(rest),
            }
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TRANSCRIPTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Last user turn of a ChatML, Llama-3 or `Speaker:` transcript, or the whole
/// prompt when no transcript markup is present.
pub fn last_user_turn(prompt: &str) -> &str {
    if let Some(turn) = tagged_turn(prompt, "<|im_start|>user", "<|im_end|>") {
        return turn;
    }
    if let Some(turn) = tagged_turn(
        prompt,
        "<|start_header_id|>user<|end_header_id|>",
        "<|eot_id|>",
    ) {
        return turn;
    }
    if let Some(turn) = speaker_turn(prompt) {
        return turn;
    }
    prompt
}

fn tagged_turn<'a>(prompt: &'a str, open: &str, close: &str) -> Option<&'a str> {
    let start = prompt.rfind(open)? + open.len();
    let body = &prompt[start..];
    let end = body.find(close).unwrap_or(body.len());
    Some(body[..end].trim())
}

/// Returns `Some` once any known speaker label is seen. A transcript with no
/// user turn yields an empty string so it is never rerouted.
fn speaker_turn(prompt: &str) -> Option<&str> {
    let mut saw_speaker = false;
    // Byte range of the current turn's text and whether it is a user turn.
    let mut current: Option<(usize, usize, bool)> = None;
    let mut last_user: Option<(usize, usize)> = None;

    let mut offset = 0;
    for line in prompt.split_inclusive('\n') {
        let line_start = offset;
        offset += line.len();
        let content = line.trim_end_matches(['\n', '\r']);
        let content_end = line_start + content.len();

        if let Some((label, body_offset)) = speaker_label(content) {
            saw_speaker = true;
            if let Some((s, e, true)) = current {
                last_user = Some((s, e));
            }
            let is_user = USER_SPEAKERS.contains(&label.as_str());
            current = Some((line_start + body_offset, content_end, is_user));
        } else if let Some((s, _, is_user)) = current {
            current = Some((s, content_end, is_user));
        }
    }
    if let Some((s, e, true)) = current {
        last_user = Some((s, e));
    }

    if !saw_speaker {
        return None;
    }
    Some(match last_user {
        Some((s, e)) => prompt[s..e].trim(),
        None => "",
    })
}

/// Lowercased speaker label and the byte offset where its text begins.
fn speaker_label(line: &str) -> Option<(String, usize)> {
    let (label, _) = line.split_once(':')?;
    let label = label.trim().to_ascii_lowercase();
    if USER_SPEAKERS.contains(&label.as_str()) || OTHER_SPEAKERS.contains(&label.as_str()) {
        let colon = line.find(':')?;
        Some((label, colon + 1))
    } else {
        None
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PARAMETER EXTRACTION
// ═══════════════════════════════════════════════════════════════════════════════

const SIZE_CONNECTORS: &[&str] = &["in", "at", "size"];
const STEP_CONNECTORS: &[&str] = &["with", "using", "in"];
const TRAILING_PUNCT: &[char] = &['.', ',', ';', ':', '!', '?'];

fn extract_parameters(text: &str) -> (String, ImageParameters) {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    let mut kept: Vec<&str> = Vec::with_capacity(tokens.len());
    let mut params = ImageParameters::default();

    let mut i = 0;
    while i < tokens.len() {
        let token = tokens[i];
        let bare = token.trim_end_matches(TRAILING_PUNCT);

        if let Some(size) = parse_size(bare) {
            if params.size.is_none() && size.is_allowed() {
                params.size = Some(size);
            }
            pop_connector(&mut kept, SIZE_CONNECTORS);
            i += 1;
            continue;
        }

        // "20 steps"
        if let (Some(n), Some(next)) = (parse_count(bare), tokens.get(i + 1)) {
            if is_steps_word(next) {
                set_steps(&mut params, n);
                pop_connector(&mut kept, STEP_CONNECTORS);
                i += 2;
                continue;
            }
        }

        // "steps: 20", "steps:20", "steps=20"
        let lower = token
            .trim_end_matches(['.', ',', ';', '!', '?'])
            .to_ascii_lowercase();
        if let Some(rest) = lower
            .strip_prefix("steps")
            .and_then(|r| r.strip_prefix(':').or_else(|| r.strip_prefix('=')))
        {
            let inline = if rest.is_empty() { None } else { parse_count(rest) };
            let (value, consumed) = match inline {
                Some(n) => (Some(n), 1),
                None if rest.is_empty() => {
                    let next = tokens
                        .get(i + 1)
                        .and_then(|t| parse_count(t.trim_end_matches(TRAILING_PUNCT)));
                    (next, 2)
                }
                None => (None, 0),
            };
            if let Some(n) = value {
                set_steps(&mut params, n);
                pop_connector(&mut kept, STEP_CONNECTORS);
                i += consumed;
                continue;
            }
        }

        kept.push(token);
        i += 1;
    }

    (tidy(&kept.join(" ")), params)
}

fn parse_size(token: &str) -> Option<ImageSize> {
    let mut parts = token.split(['x', 'X', '×']);
    let width = parse_count(parts.next()?)?;
    let height = parse_count(parts.next()?)?;
    if parts.next().is_some() {
        return None;
    }
    Some(ImageSize::new(width, height))
}

fn parse_count(token: &str) -> Option<u32> {
    if token.is_empty() || !token.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    // Oversized numbers saturate; steps are clamped afterwards anyway.
    Some(token.parse().unwrap_or(u32::MAX))
}

fn is_steps_word(token: &str) -> bool {
    let bare = token.trim_end_matches(TRAILING_PUNCT).to_ascii_lowercase();
    bare == "steps" || bare == "step"
}

fn set_steps(params: &mut ImageParameters, n: u32) {
    if params.steps.is_none() {
        params.steps = Some(n.clamp(MIN_STEPS, MAX_STEPS));
    }
}

fn pop_connector(kept: &mut Vec<&str>, connectors: &[&str]) {
    if let Some(last) = kept.last() {
        if connectors.contains(&last.to_ascii_lowercase().as_str()) {
            kept.pop();
        }
    }
}

fn tidy(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed
        .trim_start_matches(|c: char| c.is_whitespace() || matches!(c, ':' | ',' | ';' | '-'))
        .trim_end_matches(|c: char| c.is_whitespace() || TRAILING_PUNCT.contains(&c))
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(prompt: &str) -> IntentResult {
        IntentRouter::new().route(prompt)
    }

    #[test]
    fn test_plain_trigger() {
        let result = route("generate an image of a cat");
        assert!(result.is_structured_intent);
        assert_eq!(result.clean_prompt, "a cat");
        assert_eq!(result.extracted_parameters, ImageParameters::default());
        assert_eq!(result.operation(), OperationKind::ImageGeneration);
    }

    #[test]
    fn test_trigger_must_be_prefix() {
        let result = route("describe the image");
        assert!(!result.is_structured_intent);
        assert_eq!(result.clean_prompt, "describe the image");

        assert!(!route("can you draw a cat").is_structured_intent);
    }

    #[test]
    fn test_speaker_transcript_uses_last_user_turn() {
        let result = route("User: Hello\nAssistant: Hi\nUser: draw a sunset with 20 steps");
        assert!(result.is_structured_intent);
        assert_eq!(result.clean_prompt, "a sunset");
        assert_eq!(result.extracted_parameters.steps, Some(20));
        assert_eq!(result.extracted_parameters.size, None);
    }

    #[test]
    fn test_unlisted_size_is_stripped_but_ignored() {
        let result = route("generate image of cat in 999x999");
        assert!(result.is_structured_intent);
        assert_eq!(result.clean_prompt, "cat");
        assert_eq!(result.extracted_parameters.size, None);
        assert_eq!(result.extracted_parameters.size_or_default(), DEFAULT_IMAGE_SIZE);
    }

    #[test]
    fn test_allowed_size_and_steps_forms() {
        let result = route("Paint me a lighthouse at 1024x768, steps: 80.");
        assert!(result.is_structured_intent);
        assert_eq!(result.clean_prompt, "a lighthouse");
        assert_eq!(result.extracted_parameters.size, Some(ImageSize::new(1024, 768)));
        assert_eq!(result.extracted_parameters.steps, Some(MAX_STEPS));

        let result = route("sketch a fox 768×1024 steps=0");
        assert_eq!(result.extracted_parameters.size, Some(ImageSize::new(768, 1024)));
        assert_eq!(result.extracted_parameters.steps, Some(MIN_STEPS));
        assert_eq!(result.clean_prompt, "a fox");
    }

    #[test]
    fn test_case_insensitive_longest_trigger_first() {
        let result = route("DRAW ME a dragon");
        assert!(result.is_structured_intent);
        assert_eq!(result.clean_prompt, "a dragon");
    }

    #[test]
    fn test_word_boundary_after_trigger() {
        assert!(!route("drawing tips for beginners").is_structured_intent);
        assert!(!route("sketchy neighbourhoods").is_structured_intent);
        assert!(route("Illustrate: a tree").is_structured_intent);
    }

    #[test]
    fn test_trigger_without_subject_is_text() {
        assert!(!route("draw").is_structured_intent);
        assert!(!route("draw in 512x512").is_structured_intent);
    }

    #[test]
    fn test_earlier_turn_does_not_trigger() {
        let result = route("User: draw a cat\nAssistant: done\nUser: thanks, now explain it");
        assert!(!result.is_structured_intent);
    }

    #[test]
    fn test_continuation_lines_join_turn() {
        let turn = last_user_turn("User: hi\nAssistant: hello\nUser: draw a ship\nat dawn");
        assert_eq!(turn, "draw a ship\nat dawn");
        let result = route("User: hi\nAssistant: hello\nUser: draw a ship\nat dawn");
        assert_eq!(result.clean_prompt, "a ship at dawn");
    }

    #[test]
    fn test_chatml_transcript() {
        let prompt = "<|im_start|>system\nYou are helpful<|im_end|>\n\
                      <|im_start|>user\ncreate a picture of a red barn in 512x512<|im_end|>\n\
                      <|im_start|>assistant\n";
        let result = route(prompt);
        assert!(result.is_structured_intent);
        assert_eq!(result.clean_prompt, "a red barn");
        assert_eq!(result.extracted_parameters.size, Some(ImageSize::new(512, 512)));
    }

    #[test]
    fn test_llama3_transcript() {
        let prompt = "<|begin_of_text|><|start_header_id|>user<|end_header_id|>\n\nhello<|eot_id|>\
                      <|start_header_id|>assistant<|end_header_id|>\n\nhi<|eot_id|>\
                      <|start_header_id|>user<|end_header_id|>\n\nmake an image of a moon using 30 steps<|eot_id|>";
        let result = route(prompt);
        assert!(result.is_structured_intent);
        assert_eq!(result.clean_prompt, "a moon");
        assert_eq!(result.extracted_parameters.steps, Some(30));
    }

    #[test]
    fn test_transcript_without_user_turn() {
        assert_eq!(last_user_turn("Assistant: draw a cat"), "");
        assert!(!route("Assistant: draw a cat").is_structured_intent);
    }
}
