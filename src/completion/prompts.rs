use crate::completion::CompletionRequest;

const SUMMARY_SYSTEM_PROMPT: &str =
    "You are a helpful assistant that creates concise summaries of voice transcripts.";
const SUMMARY_INSTRUCTIONS: &str = "Please provide a brief 2-3 sentence summary of the following transcript. Focus on the main ideas and key points:";
const SUMMARY_MAX_TOKENS: u32 = 150;

const STRUCTURE_SYSTEM_PROMPT: &str = "You are a helpful assistant that transforms unstructured voice transcripts into well-organized markdown documents.";
const STRUCTURE_INSTRUCTIONS: &str = "Transform the following voice transcript into a well-structured markdown document.

Requirements:
- Organize content by topics with clear headings (##)
- Use bullet points for lists
- Use **bold** for key ideas and important points
- Maintain the original meaning and information
- Make it easy to read and scan";
const STRUCTURE_MAX_TOKENS: u32 = 2000;

const TEMPERATURE: f32 = 0.7;

/// Request asking for a short summary of `transcript`
pub fn summary_request(transcript: &str, model: &str) -> CompletionRequest {
    let prompt = format!("{SUMMARY_INSTRUCTIONS}\n\n{transcript}");
    CompletionRequest::new(SUMMARY_SYSTEM_PROMPT, prompt)
        .with_model(model)
        .with_max_tokens(SUMMARY_MAX_TOKENS)
        .with_temperature(TEMPERATURE)
}

/// Request rewriting `transcript` as a markdown document.
///
/// A non-empty `summary` is embedded verbatim on a `Summary context:` line ahead of the transcript.
pub fn structure_request(transcript: &str, summary: Option<&str>, model: &str) -> CompletionRequest {
    let context = match summary.filter(|summary| !summary.is_empty()) {
        Some(summary) => format!("Summary context: {summary}\n\n"),
        None => String::new(),
    };
    let prompt = format!("{STRUCTURE_INSTRUCTIONS}\n\n{context}Transcript:\n{transcript}");
    CompletionRequest::new(STRUCTURE_SYSTEM_PROMPT, prompt)
        .with_model(model)
        .with_max_tokens(STRUCTURE_MAX_TOKENS)
        .with_temperature(TEMPERATURE)
}
