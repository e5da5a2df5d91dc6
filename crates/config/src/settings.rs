//! Game settings: the world definition and the character cast.
//!
//! Loaded from a JSON document; sessions keep their own copy so a running
//! simulation is unaffected by later edits to the file.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::period::TimePeriod;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeechStyle {
    pub register: String,
    pub constraints: String,
}

/// Immutable base properties of one character.  The first six fields are the
/// required core; the rest is optional flavor surfaced in persona prompts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CharacterSpec {
    pub name: String,
    pub role: String,
    pub story: String,
    pub personality: String,
    pub location_home: String,
    pub location_work: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub life_cycle: String,
    pub titles: Vec<String>,
    pub motifs: Vec<String>,
    pub quirks: Vec<String>,
    pub goals: Vec<String>,
    pub relationships: BTreeMap<String, String>,
    pub speech: SpeechStyle,
}

impl Default for CharacterSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            role: String::new(),
            story: String::new(),
            personality: String::new(),
            location_home: String::new(),
            location_work: String::new(),
            kind: "npc".to_string(),
            life_cycle: "active".to_string(),
            titles: Vec::new(),
            motifs: Vec::new(),
            quirks: Vec::new(),
            goals: Vec::new(),
            relationships: BTreeMap::new(),
            speech: SpeechStyle::default(),
        }
    }
}

impl CharacterSpec {
    /// Current location under the fixed policy: home for morning/evening,
    /// work otherwise.
    pub fn location_for(&self, period: TimePeriod) -> &str {
        if period.is_home_time() {
            &self.location_home
        } else {
            &self.location_work
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Calendar {
    pub time_periods: Vec<TimePeriod>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldSettings {
    pub name: String,
    pub description: String,
    pub calendar: Calendar,
    pub locations: Vec<String>,
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GameSettings {
    pub world: WorldSettings,
    pub character_list: Vec<CharacterSpec>,
    /// Free-form experiment metadata carried through untouched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experiment: Option<serde_json::Value>,
}

impl GameSettings {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("cannot read game settings {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("invalid game settings {}", path.display()))
    }

    pub fn character(&self, name: &str) -> Option<&CharacterSpec> {
        self.character_list
            .iter()
            .find(|c| c.name == name)
            .or_else(|| {
                self.character_list
                    .iter()
                    .find(|c| c.name.eq_ignore_ascii_case(name))
            })
    }

    pub fn character_names(&self) -> Vec<String> {
        self.character_list.iter().map(|c| c.name.clone()).collect()
    }

    pub fn add_character(&mut self, spec: CharacterSpec) {
        if self.character(&spec.name).is_none() {
            self.character_list.push(spec);
        }
    }

    /// Ordered day periods: the world calendar when present, else the full
    /// enum.
    pub fn day_periods(&self) -> Vec<TimePeriod> {
        if self.world.calendar.time_periods.is_empty() {
            TimePeriod::ALL.to_vec()
        } else {
            self.world.calendar.time_periods.clone()
        }
    }

    /// Built-in cast used when no settings file is given.
    pub fn default_cast() -> Self {
        let world = WorldSettings {
            name: "Thornbury".to_string(),
            description: "A small walled market town in a medieval fantasy realm, \
                          where rumor travels faster than any courier."
                .to_string(),
            calendar: Calendar {
                time_periods: TimePeriod::ALL.to_vec(),
            },
            locations: vec![
                "The Gilded Tankard".to_string(),
                "The Old Forge".to_string(),
                "Herb Garden".to_string(),
                "Market Square".to_string(),
            ],
            roles: vec![
                "Innkeeper".to_string(),
                "Blacksmith".to_string(),
                "Herbalist".to_string(),
                "Merchant".to_string(),
            ],
        };

        let characters = vec![
            CharacterSpec {
                name: "Elara".to_string(),
                role: "Innkeeper".to_string(),
                story: "Elara runs the Gilded Tankard, the tavern her mother left her, \
                        and hears every secret the town has to offer."
                    .to_string(),
                personality: "warm, sharp-eared, quietly ambitious".to_string(),
                location_home: "The Gilded Tankard".to_string(),
                location_work: "The Gilded Tankard".to_string(),
                quirks: vec!["polishes the same mug when thinking".to_string()],
                ..CharacterSpec::default()
            },
            CharacterSpec {
                name: "Grak".to_string(),
                role: "Blacksmith".to_string(),
                story: "Grak, a half-orc smith, settled in Thornbury after years as a \
                        caravan guard and keeps his past behind the anvil."
                    .to_string(),
                personality: "gruff, loyal, slow to trust".to_string(),
                location_home: "Forge Cottage".to_string(),
                location_work: "The Old Forge".to_string(),
                ..CharacterSpec::default()
            },
            CharacterSpec {
                name: "Anya".to_string(),
                role: "Herbalist".to_string(),
                story: "Anya gathers herbs beyond the wall and sells remedies the \
                        town physician pretends not to need."
                    .to_string(),
                personality: "curious, blunt, superstitious".to_string(),
                location_home: "Riverside Hut".to_string(),
                location_work: "Herb Garden".to_string(),
                ..CharacterSpec::default()
            },
            CharacterSpec {
                name: "Tomas".to_string(),
                role: "Merchant".to_string(),
                story: "Tomas trades in cloth and gossip, and owes money to more \
                        people than he can comfortably greet in the street."
                    .to_string(),
                personality: "charming, evasive, optimistic".to_string(),
                location_home: "Tall House".to_string(),
                location_work: "Market Square".to_string(),
                ..CharacterSpec::default()
            },
        ];

        Self {
            world,
            character_list: characters,
            experiment: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_cast_characters_resolve_by_name() {
        let settings = GameSettings::default_cast();
        assert!(settings.character("Elara").is_some());
        assert!(settings.character("elara").is_some());
        assert!(settings.character("Nobody").is_none());
    }

    #[test]
    fn location_follows_period_policy() {
        let settings = GameSettings::default_cast();
        let grak = settings.character("Grak").unwrap();
        assert_eq!(grak.location_for(TimePeriod::Morning), "Forge Cottage");
        assert_eq!(grak.location_for(TimePeriod::Noon), "The Old Forge");
        assert_eq!(grak.location_for(TimePeriod::Evening), "Forge Cottage");
    }

    #[test]
    fn add_character_ignores_duplicates() {
        let mut settings = GameSettings::default_cast();
        let before = settings.character_list.len();
        settings.add_character(CharacterSpec {
            name: "Elara".to_string(),
            ..CharacterSpec::default()
        });
        assert_eq!(settings.character_list.len(), before);

        settings.add_character(CharacterSpec {
            name: "Kaelen".to_string(),
            ..CharacterSpec::default()
        });
        assert_eq!(settings.character_list.len(), before + 1);
    }

    #[test]
    fn settings_roundtrip_as_json() {
        let settings = GameSettings::default_cast();
        let raw = serde_json::to_string(&settings).unwrap();
        let back: GameSettings = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.character_names(), settings.character_names());
        assert_eq!(back.day_periods(), settings.day_periods());
    }

    #[test]
    fn day_periods_default_to_full_enum() {
        let settings = GameSettings::default();
        assert_eq!(settings.day_periods(), TimePeriod::ALL.to_vec());
    }
}
