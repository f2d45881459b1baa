//! Instruction prompt assembly for the agent runtime.
//!
//! The prompt names the three pipeline tools with example argument shapes,
//! pins the languages and file paths for this run, and inlines the review
//! guidelines for the reviewer subagent.

use df_domain::config::ToolsConfig;

use super::driver::RunInput;

/// The reviewer subagent name advertised to the runtime.
pub const REVIEWER_AGENT: &str = "doc-reviewer";

/// Build the orchestration prompt for one run.
pub fn build_prompt(input: &RunInput, tools: &ToolsConfig, guidelines: &str) -> String {
    let mut prompt = String::new();

    prompt.push_str(&format!(
        "You orchestrate a dictation-to-document pipeline. Work through the \
         four stages in order: transcribe, draft, review, export.\n\n\
         Input audio: {audio}\n\
         Document template: {template}\n\
         Output document: {outdoc}\n\
         Input language: {in_lang} (auto = detect)\n\
         Output language: {out_lang}\n\n",
        audio = input.audio.display(),
        template = input.template.display(),
        outdoc = input.outdoc.display(),
        in_lang = input.input_language,
        out_lang = input.output_language,
    ));

    prompt.push_str(&format!(
        "Stage 1 — call `{transcribe}` until every chunk is processed, e.g.\n\
         {{\"audio\": \"{audio}\", \"language\": \"{in_lang}\", \"startChunk\": 0}}\n\
         Continue with the returned nextChunk until it is null.\n\n\
         Stage 2 — call `{draft}` with the full transcript, e.g.\n\
         {{\"transcript\": \"...\", \"language\": \"{out_lang}\", \"template\": \"{template}\"}}\n\n\
         Stage 3 — hand the draft to the `{reviewer}` subagent and apply its \
         verdict. Revise once at most.\n\n\
         Stage 4 — call `{export}` with the approved draft, e.g.\n\
         {{\"draft\": \"...\", \"template\": \"{template}\", \"output\": \"{outdoc}\"}}\n\n\
         Finish by returning exactly one JSON object:\n\
         {{\"status\": \"ok\", \"draft\": \"...\", \"docx\": \"{outdoc}\"}}\n\n",
        transcribe = tools.transcribe,
        draft = tools.draft,
        export = tools.export,
        reviewer = REVIEWER_AGENT,
        audio = input.audio.display(),
        template = input.template.display(),
        outdoc = input.outdoc.display(),
        in_lang = input.input_language,
        out_lang = input.output_language,
    ));

    if !guidelines.trim().is_empty() {
        prompt.push_str("Review guidelines:\n\n");
        prompt.push_str(guidelines.trim());
        prompt.push('\n');
    }

    prompt
}

/// The reviewer subagent's own instructions.
pub fn reviewer_prompt(guidelines: &str) -> String {
    let mut prompt = String::from(
        "You review a drafted document against the guidelines below. Respond \
         with exactly one JSON object:\n\
         {\"approved\": bool, \"reasons\": [..], \"required_changes\": [..], \
         \"revised_draft\": string|null}\n\n",
    );
    if !guidelines.trim().is_empty() {
        prompt.push_str(guidelines.trim());
        prompt.push('\n');
    }
    prompt
}
