//! Prompt template for the extraction agent

/// Extraction prompt. `{request}` is replaced with the JSON-serialized
/// extraction request for one (tenant, source) group.
pub const EXTRACTION_PROMPT: &str = r#"You distill an agent's raw session observations into durable memory.

You receive a JSON request with:
- "episodes": raw observations to distill
- "active_facts": facts already known (do not duplicate them)
- "active_rules": behavioral rules already learned

Extract only information worth remembering across sessions. Respond with ONLY a JSON object (no prose, no markdown fences) of this shape:

{
  "new_facts": [
    {"subject": "...", "predicate": "...", "content": "...", "permanence": "permanent|stable|standard|volatile|ephemeral", "importance": 0-10}
  ],
  "new_rules": [
    {"content": "...", "supported_by": ["<fact-id>"]}
  ],
  "confirmed_facts": ["<fact-id>"],
  "confirmed_rules": ["<rule-id>"]
}

Guidelines:
- A fact is a stable subject/predicate statement ("user" / "favorite_editor").
- If an episode contradicts an active fact, emit a new fact with the same subject and predicate; it replaces the old one.
- If an episode restates an active fact or rule, list its id under confirmations instead of duplicating it.
- A rule is transferable behavioral guidance, not a one-off observation.
- Choose permanence by how quickly the information goes stale.
- Return empty lists when nothing is worth keeping.

Request:
{request}"#;
