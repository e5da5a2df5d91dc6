//! Prompt builders for the background summarizer.

/// System/user prompt pair for compressing one NPC's rolling dialogue log.
pub fn npc_summary_prompts(source: &str, max_chars: usize) -> (String, String) {
    let system = "You are a game memory summarizer. Create a concise yet comprehensive, \
                  chronological summary of an NPC's dialogues that preserves key facts, \
                  relationships, goals, and unresolved threads. Output plain text only."
        .to_string();
    let user = format!(
        "Dialogue Log:\n{source}\n\nWrite an updated unified summary that captures all \
         important information so far. Keep it under ~{max_chars} characters, merge \
         duplicates, and prefer specifics over fluff."
    );
    (system, user)
}

/// System/user prompt pair for the global session summary.
pub fn session_summary_prompts(source: &str, max_chars: usize) -> (String, String) {
    let system = "You are a game session summarizer. Maintain a coherent, evolving summary \
                  of all dialogues in the session, preserving key events, relationships, \
                  goals, and unresolved threads. Output plain text only."
        .to_string();
    let user = format!(
        "Session Dialogue Log to date:\n{source}\n\nWrite an updated unified session \
         summary under ~{max_chars} characters. Merge duplicates and keep specifics."
    );
    (system, user)
}

/// System/user prompt pair for one day's summary.
pub fn day_summary_prompts(day: u32, source: &str, max_chars: usize) -> (String, String) {
    let system = "You are a game day summarizer. Rewrite the day's dialogue log into a \
                  compact account that preserves key events, relationships, and unresolved \
                  threads. Output plain text only."
        .to_string();
    let user = format!(
        "Dialogue Log of Day {day}:\n{source}\n\nWrite an updated unified summary under \
         ~{max_chars} characters. Merge duplicates and keep specifics."
    );
    (system, user)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompts_carry_source_and_budget() {
        let (system, user) = npc_summary_prompts("[Day 1 morning] a -> b: hi", 400);
        assert!(system.contains("memory summarizer"));
        assert!(user.contains("[Day 1 morning] a -> b: hi"));
        assert!(user.contains("~400 characters"));

        let (_, user) = session_summary_prompts("log", 200);
        assert!(user.contains("~200 characters"));

        let (_, user) = day_summary_prompts(3, "log", 100);
        assert!(user.contains("Day 3"));
    }
}
