//! Conversation summarization prompt.

/// Build the prompt that folds older turns into the running summary.
///
/// Passing the previous summary back in makes repeated compression fold a
/// summary into a new summary instead of stacking them.
pub fn build_summary_prompt(previous_summary: Option<&str>, rendered_turns: &str, max_chars: usize) -> String {
    let previous = previous_summary
        .map(|summary| format!("Existing summary:\n{}\n\n", summary))
        .unwrap_or_default();

    format!(
        "TASK: CONVERSATION SUMMARY\n\n\
         Summarize the conversation below concisely. Keep the identified domain, \
         KPIs, reporting period, key decisions and open issues. Drop pleasantries \
         and repeated content. Stay under {max_chars} characters.\n\n\
         {previous}Conversation:\n{rendered_turns}\n\nSummary:"
    )
}
