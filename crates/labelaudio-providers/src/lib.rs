//! # labelaudio providers
//!
//! Concrete clients for the external collaborators:
//! - [`HttpTransport`]: capability providers behind HTTP
//! - [`ProcessTransport`]: capability providers run as child processes
//! - [`LabelStudioClient`]: the labeling platform
//! - [`HttpReasoningClient`]: an OpenAI-compatible reasoning model

mod http;
mod label_studio;
mod process;
mod reasoning;

pub use http::HttpTransport;
pub use label_studio::LabelStudioClient;
pub use process::{ProcessTransport, PROCESS_PROTOCOL};
pub use reasoning::{HttpReasoningClient, HttpReasoningConfig};

const BODY_PREVIEW_CHARS: usize = 2_000;

pub(crate) fn preview_text(input: &str, max_chars: usize) -> String {
    let char_count = input.chars().count();
    if char_count <= max_chars {
        return input.to_string();
    }
    let mut preview: String = input.chars().take(max_chars).collect();
    preview.push_str(&format!("... [truncated, total_chars={}]", char_count));
    preview
}

pub(crate) fn preview_body(body: &str) -> String {
    preview_text(body, BODY_PREVIEW_CHARS)
}
