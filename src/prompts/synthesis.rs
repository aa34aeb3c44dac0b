//! Generation and repair prompts for synthesized capabilities.
//!
//! Synthesized capabilities are Python functions executed out of process by
//! the sandbox runner, so the prompts pin down the Python calling convention
//! and the rows/columns output contract.

/// System prompt for capability generation and repair calls.
pub const CAPABILITY_SYSTEM_PROMPT: &str = "You write small, self-contained Python functions that extract or transform \
tabular data for a report pipeline. You follow the output contract exactly and reply with a single JSON object.";

/// Build the generation prompt for a capability.
///
/// `spec_json` is the pretty-printed capability spec.
pub fn build_generation_prompt(spec_json: &str, function_name: &str) -> String {
    format!(
        r#"TASK: CAPABILITY GENERATION

Write a production-ready Python function implementing the specification below.

## MANDATORY RULES

- The function is named exactly `{function_name}` and takes ONE argument: a dict matching the input shape.
- The function is self-contained: ALL imports go inside the function body, standard library only.
- Catch every exception except FileNotFoundError; on failure return {{"error": "<message>"}}.
- Let FileNotFoundError propagate when the input path does not exist.
- Output is ALWAYS {{"rows": list[dict], "columns": list[str]}}.
  - No records: {{"rows": [], "columns": []}}
  - Every dict in "rows" has IDENTICAL keys; fill missing fields with "" (never None).
  - No nested dicts or lists-of-lists in the final output.
- Nested sources (XML, JSON): flatten recursively, never assume a fixed depth,
  and propagate parent attributes to child rows.
- Do not use the network.

## CAPABILITY SPECIFICATION

{spec_json}

Respond ONLY with valid JSON (no markdown, no backticks):
{{
  "reasoning": "<structure, edge cases and output format>",
  "code": "<complete Python source as a single string>"
}}
"#
    )
}

/// Build the repair prompt after a failed sandbox test.
pub fn build_fix_prompt(
    spec_json: &str,
    function_name: &str,
    previous_source: &str,
    failure: &str,
) -> String {
    format!(
        r#"TASK: CAPABILITY REPAIR

The Python function `{function_name}` failed its sandbox test.

## SPECIFICATION

{spec_json}

## PREVIOUS SOURCE

{previous_source}

## FAILURE

{failure}

Before fixing, check:
1. What exactly caused the failure?
2. Is the output exactly {{"rows": list[dict], "columns": list[str]}} with identical keys in every row?
3. Are all imports inside the function body and all exceptions except FileNotFoundError caught?

Respond ONLY with valid JSON (no markdown, no backticks):
{{
  "reasoning": "<what went wrong and how it was fixed>",
  "code": "<corrected complete Python source>"
}}
"#
    )
}
