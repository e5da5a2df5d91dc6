//! Prompt builders for the three per-day passes.

use folksim_config::TimePeriod;

pub const CHARACTER_LIMIT: usize = 10;

pub fn lifecycle_prompts(
    global_memory: &str,
    roster: &[String],
    previous_active: &[String],
    previous_passive: &[String],
) -> (String, String) {
    let system = "You are the 'Director' of a story, deciding which characters step into \
                  the spotlight for the next scene. Your goal is to create a dynamic and \
                  engaging narrative."
        .to_string();
    let user = format!(
        "### STORY CONTEXT\n\
         - **Recent Events (Global Dialogue History):**\n\
         ---\n{global_memory}\n---\n\
         - **The Cast (All Characters):** {roster}\n\
         - **Last Scene's Active Characters:** [{active}]\n\
         - **Last Scene's Off-stage Characters:** [{passive}]\n\n\
         ### YOUR TASK\n\
         Based on the recent events, decide which characters should be **active** in the \
         next scene to drive the story forward.\n\n\
         ### INSTRUCTIONS\n\
         - Consider who was central to the last scene and who has been quiet for too long.\n\
         - A good scene has a mix of characters, not everyone needs to be active at once.\n\
         - Your output must be a single line of comma-separated names (CSV).\n\
         - Example: `Elara, Grak, Anya`\n\n\
         ### ACTIVE CHARACTERS FOR NEXT SCENE:",
        roster = roster.join(", "),
        active = previous_active.join(", "),
        passive = previous_passive.join(", "),
    );
    (system, user)
}

pub fn introduction_prompts(
    world_description: &str,
    global_memory: &str,
    roster: &[String],
    active: &[String],
    roles: &[String],
    locations: &[String],
) -> (String, String) {
    let mut system = "You are the 'Storyteller' of a medieval fantasy world, deciding if a \
                      new character should enter the narrative. Your goal is to enrich the \
                      story by introducing new personalities and plot hooks at the right \
                      moment."
        .to_string();
    if !world_description.is_empty() {
        system.push_str(&format!("\n**World Setting:** {world_description}"));
    }

    let user = format!(
        "### STORY SO FAR\n\
         - **Recent Events:**\n\
         ---\n{global_memory}\n---\n\
         - **Current Cast:** {roster} (Total: {count}/{limit})\n\
         - **Currently Active Characters:** {active}\n\n\
         ### POTENTIAL NEW CHARACTER ARCHETYPES\n\
         - **Roles:** {roles}\n\
         - **Locations:** {locations}\n\n\
         ### YOUR TASK\n\
         Analyze the story and decide if introducing a new character would make it more \
         interesting.\n\n\
         ### INSTRUCTIONS\n\
         1. **Evaluate the Need:** Only introduce a character if they add significant value.\n\
         2. **Character Limit:** Do not introduce a new character if the cast has 7 or more \
         members. The hard limit is {limit}.\n\
         3. **Create a Character:** Make them distinct from the existing cast.\n\
         4. **Output Format:** If introducing a character, provide a JSON object with \
         `name`, `story`, `personality`, `role`, `location_home`, and `location_work`. \
         If not, return an empty JSON object {{}}.\n\
         5. **Your output must be ONLY the JSON object.**\n\n\
         ### DECISION (JSON ONLY):",
        roster = roster.join(", "),
        count = roster.len(),
        limit = CHARACTER_LIMIT,
        active = active.join(", "),
        roles = roles.join(", "),
        locations = locations.join(", "),
    );
    (system, user)
}

pub fn schedule_prompts(
    npc: &str,
    day: u32,
    phase: TimePeriod,
    available: &[String],
    already_spoken: &[String],
    memory_summary: &str,
    opinions_json: &str,
) -> (String, String) {
    let system = format!(
        "You are the 'Scheduler' for a medieval fantasy world, a silent observer who \
         decides which characters will cross paths. Your task is to create a compelling \
         social schedule for {npc} during the {phase} of day {day}."
    );
    let user = format!(
        "### CHARACTER TO SCHEDULE\n\
         - **Name:** {npc}\n\n\
         ### CONTEXT FOR YOUR DECISION\n\
         - **Time:** Day {day}, {phase}\n\
         - **Available Characters for Interaction:** {available}\n\
         - **Characters Already Spoken To Today:** {spoken}\n\
         - **{npc}'s Memory Summary:** {memory_summary}\n\
         - **Web of Opinions (What they think of others, and others of them):** {opinions_json}\n\n\
         ### YOUR TASK\n\
         Based on the context, decide who {npc} should interact with in this phase. A good \
         schedule creates drama, resolves tension, or develops relationships.\n\n\
         ### INSTRUCTIONS\n\
         1. Choose characters from the 'Available Characters' list.\n\
         2. Do not schedule {npc} to talk to themselves.\n\
         3. Prioritize characters they haven't spoken to today.\n\
         4. Your output must be a single line of comma-separated names (CSV).\n\
         5. If no interaction is logical, return an empty line.\n\n\
         ### EXAMPLE\n\
         `Elara, Grak`\n\n\
         ### SCHEDULE FOR {npc} (CSV ONLY):",
        available = available.join(", "),
        spoken = already_spoken.join(", "),
    );
    (system, user)
}
