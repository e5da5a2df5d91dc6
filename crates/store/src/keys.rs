//! Key layout of the embedded database.
//!
//! All keys are strings.  Numeric IDs are zero-padded so lexicographic key
//! order equals numeric order, which makes every index range scan come back
//! already sorted by allocation order.  Composite keys join their parts with
//! the unit separator, which cannot appear in names or session IDs that
//! originate from the character roster.

/// Separator between composite key parts.
pub const SEP: char = '\u{1f}';

pub fn id_key(id: u64) -> String {
    format!("{id:020}")
}

pub fn parse_id_key(key: &str) -> Option<u64> {
    key.parse().ok()
}

pub fn day_key(session_id: &str, day: u32) -> String {
    format!("{session_id}{SEP}{day:08}")
}

pub fn npc_key(session_id: &str, npc_name: &str) -> String {
    format!("{session_id}{SEP}{npc_name}")
}

/// `dialogues_by_session` index entry.
pub fn session_dialogue_key(session_id: &str, dialogue_id: u64) -> String {
    format!("{session_id}{SEP}{}", id_key(dialogue_id))
}

/// `messages_by_dialogue` index entry.
pub fn dialogue_message_key(dialogue_id: u64, message_id: u64) -> String {
    format!("{}{SEP}{}", id_key(dialogue_id), id_key(message_id))
}

/// `messages_by_sender` / `messages_by_receiver` index entry.
pub fn name_message_key(name: &str, message_id: u64) -> String {
    format!("{name}{SEP}{}", id_key(message_id))
}

pub fn prefix(part: &str) -> String {
    format!("{part}{SEP}")
}

/// Last path component of a composite key.
pub fn suffix(key: &str) -> &str {
    key.rsplit(SEP).next().unwrap_or(key)
}
