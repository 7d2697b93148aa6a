use quorum_models::AgentVerdict;

use crate::error::AgentError;

/// Pull the first JSON object out of free-form model output.
///
/// Accepts a bare object, a fenced ```json block, or an object preceded by
/// commentary. Candidates are tried in that order and the first one that
/// parses wins.
pub fn extract_json(text: &str) -> Result<String, AgentError> {
    let trimmed = text.trim();
    let candidates = [
        trimmed.starts_with('{').then(|| trimmed.to_string()),
        fenced_block(trimmed),
        first_balanced_object(trimmed),
    ];

    candidates
        .into_iter()
        .flatten()
        .find(|candidate| serde_json::from_str::<serde_json::Value>(candidate).is_ok())
        .ok_or_else(|| {
            AgentError::Parse(format!("no JSON object in response (length={})", text.len()))
        })
}

fn fenced_block(text: &str) -> Option<String> {
    let open = text.find("```")?;
    let after_fence = &text[open + 3..];
    // Skip an optional language tag on the fence line.
    let body_start = after_fence.find('\n')? + 1;
    let body = &after_fence[body_start..];
    let close = body.find("```")?;
    Some(body[..close].trim().to_string())
}

fn first_balanced_object(text: &str) -> Option<String> {
    let mut depth = 0usize;
    let mut start = None;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in text.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    return start.map(|s| text[s..=i].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse an agent's verdict from raw CLI output.
///
/// A verdict whose confidence lies outside `[0, 1]` is rejected here so it never
/// reaches aggregation.
pub fn parse_verdict(raw: &str) -> Result<AgentVerdict, AgentError> {
    let json = extract_json(raw)?;
    let verdict: AgentVerdict = serde_json::from_str(&json)
        .map_err(|e| AgentError::Parse(format!("bad verdict: {e}; json: {json}")))?;
    if !verdict.confidence_in_range() {
        return Err(AgentError::Parse(format!(
            "confidence {} outside [0, 1]",
            verdict.confidence
        )));
    }
    Ok(verdict)
}
