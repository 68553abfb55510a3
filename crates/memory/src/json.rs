//! JSON-from-LLM parsing
//!
//! Model replies wrap JSON in fenced blocks, prefix it with commentary, or
//! return it raw. The ladder here tries, in order: a ```json fence, any
//! fence, the first balanced object, the whole reply. A shared retry loop
//! re-prompts on failure and makes one final repair attempt that feeds the
//! malformed output back to the model.

use serde_json::Value;
use std::sync::Arc;

use evermem_config::{PromptKey, PromptRegistry};
use evermem_llm::ChatModel;

use crate::{MemoryError, Result};

/// Extract the content of a ```json fenced block, or any fenced block.
pub fn extract_fenced(text: &str) -> Option<&str> {
    for fence in ["```json", "```"] {
        if let Some(start) = text.find(fence) {
            let body_start = start + fence.len();
            let rest = &text[body_start..];
            // Skip a language tag on a bare fence.
            let rest = match rest.split_once('\n') {
                Some((first_line, tail))
                    if fence == "```" && first_line.trim().chars().all(char::is_alphabetic) =>
                {
                    tail
                }
                _ => rest,
            };
            if let Some(end) = rest.find("```") {
                let body = rest[..end].trim();
                if !body.is_empty() {
                    return Some(body);
                }
            }
        }
    }
    None
}

/// Scan for the first balanced `{...}` object, respecting strings/escapes.
pub fn extract_first_object(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Run the full extraction ladder over one reply.
pub fn parse_reply(reply: &str) -> Result<Value> {
    if let Some(fenced) = extract_fenced(reply) {
        if let Ok(value) = serde_json::from_str(fenced) {
            return Ok(value);
        }
    }
    if let Some(object) = extract_first_object(reply) {
        if let Ok(value) = serde_json::from_str(object) {
            return Ok(value);
        }
    }
    serde_json::from_str(reply.trim()).map_err(|_| {
        MemoryError::LlmOutputParsing(format!(
            "unparseable LLM reply: {}",
            reply.chars().take(200).collect::<String>()
        ))
    })
}

/// Generate, parse and validate with up to `max_retries` attempts. When all
/// attempts fail and the last reply produced text, a repair prompt resubmits
/// the malformed output once.
pub async fn generate_json<V>(
    chat: &Arc<dyn ChatModel>,
    prompts: &PromptRegistry,
    prompt: &str,
    max_retries: u32,
    validate: V,
) -> Result<Value>
where
    V: Fn(&Value) -> std::result::Result<(), String>,
{
    let mut last_reply: Option<String> = None;
    let mut last_error = String::new();

    for attempt in 0..max_retries {
        match chat.generate(prompt).await {
            Ok(reply) => {
                match parse_reply(&reply) {
                    Ok(value) => match validate(&value) {
                        Ok(()) => return Ok(value),
                        Err(reason) => {
                            tracing::warn!(attempt, %reason, "LLM JSON failed validation");
                            last_error = reason;
                        }
                    },
                    Err(e) => {
                        tracing::warn!(attempt, error = %e, "LLM reply did not parse as JSON");
                        last_error = e.to_string();
                    }
                }
                last_reply = Some(reply);
            }
            Err(e) => {
                tracing::warn!(attempt, error = %e, "LLM call failed");
                last_error = e.to_string();
            }
        }
    }

    // Final repair pass: ask the model to fix its own malformed output.
    if let Some(reply) = last_reply {
        let repair_prompt = prompts.render(PromptKey::JsonRepair, &[("malformed_output", &reply)])?;
        if let Ok(repaired) = chat.generate(&repair_prompt).await {
            if let Ok(value) = parse_reply(&repaired) {
                if validate(&value).is_ok() {
                    tracing::info!("repair pass recovered malformed LLM JSON");
                    return Ok(value);
                }
            }
        }
    }

    Err(MemoryError::LlmRetryExhausted(last_error))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fenced_json_block_is_preferred() {
        let reply = "Here you go:\n```json\n{\"a\": 1}\n```\ntrailing";
        assert_eq!(parse_reply(reply).unwrap(), json!({"a": 1}));
    }

    #[test]
    fn bare_fence_with_language_tag() {
        let reply = "```javascript\n{\"a\": 2}\n```";
        assert_eq!(parse_reply(reply).unwrap(), json!({"a": 2}));
    }

    #[test]
    fn first_balanced_object_is_found_in_prose() {
        let reply = "The answer is {\"should_end\": true, \"nested\": {\"x\": 1}} as requested.";
        let value = parse_reply(reply).unwrap();
        assert_eq!(value["should_end"], json!(true));
        assert_eq!(value["nested"]["x"], json!(1));
    }

    #[test]
    fn braces_inside_strings_do_not_break_scanning() {
        let reply = r#"{"text": "a } inside", "n": 1}"#;
        let value = parse_reply(reply).unwrap();
        assert_eq!(value["n"], json!(1));
    }

    #[test]
    fn raw_json_parses_directly() {
        assert_eq!(parse_reply(" {\"ok\": true} ").unwrap(), json!({"ok": true}));
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(parse_reply("no json here").is_err());
    }
}
