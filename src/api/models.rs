//! Catalog of user-visible model identifiers and their provider pins.
//!
//! Requests are always constructed against the canonical identifier; unknown
//! aliases are rejected before any network call.

pub const ALLOWED_MODELS: &[&str] = &[
    "oai-resp/gpt-5-mini",
    "gemini/gemini-3-flash-preview",
    "anthropic/claude-haiku-4-5",
];

pub fn is_allowed(model: &str) -> bool {
    ALLOWED_MODELS.contains(&model)
}

/// Resolve a user-visible alias to the canonical provider identifier.
pub fn resolve(model: &str) -> Option<&'static str> {
    match model {
        "oai-resp/gpt-5-mini" => Some("gpt-5-mini-2025-08-07"),
        "gemini/gemini-3-flash-preview" => Some("gemini-3-flash-preview"),
        "anthropic/claude-haiku-4-5" => Some("claude-haiku-4-5-20251001"),
        _ => None,
    }
}
