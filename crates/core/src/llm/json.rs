use anyhow::Context;
use serde::de::DeserializeOwned;

/// Pulls a JSON value out of model output that may wrap it in a Markdown fence or
/// surrounding prose.
pub fn extract_json(text: &str) -> Option<String> {
    let trimmed = text.trim();

    if let Some(fence) = trimmed.find("```") {
        let after = &trimmed[fence + 3..];
        // Drop the language tag line (```json).
        let inner = after.split_once('\n').map(|(_, rest)| rest).unwrap_or(after);
        if let Some(end) = inner.find("```") {
            let block = inner[..end].trim();
            if block.starts_with('{') || block.starts_with('[') {
                return Some(block.to_string());
            }
        }
    }

    // Best-effort extraction: first '{' to last '}'.
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    Some(trimmed[start..=end].trim().to_string())
}

pub fn parse_json<T: DeserializeOwned>(text: &str) -> anyhow::Result<T> {
    let json_str = extract_json(text).unwrap_or_else(|| text.trim().to_string());
    serde_json::from_str::<T>(&json_str)
        .with_context(|| format!("model output is not valid JSON for the expected shape: {json_str}"))
}
