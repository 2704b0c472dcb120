//! Per-session voice profile
//!
//! Resolves the voice, localized tutor instructions and turn-detection
//! tuning a session is bound to when its credential is issued.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Language code that is not English or Spanish
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unsupported language: {0}")]
pub struct UnsupportedLanguage(pub String);

/// Session language
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Language {
    #[serde(rename = "en")]
    English,
    #[serde(rename = "es")]
    Spanish,
}

impl Language {
    /// Two-letter code
    pub fn code(&self) -> &'static str {
        match self {
            Language::English => "en",
            Language::Spanish => "es",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Language {
    type Err = UnsupportedLanguage;

    /// Accepts `en`, `es` and regional tags such as `en-US` or `es_MX`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        let primary = normalized
            .split(['-', '_'])
            .next()
            .unwrap_or_default();

        match primary {
            "en" => Ok(Language::English),
            "es" => Ok(Language::Spanish),
            _ => Err(UnsupportedLanguage(s.to_string())),
        }
    }
}

/// Tutor persona the child talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Persona {
    /// Patient partner for read-aloud practice
    #[default]
    ReadingBuddy,
    /// Narrates and discusses stories
    Storyteller,
    /// Short, encouraging phonics drills
    Coach,
}

impl Persona {
    pub fn name(&self) -> &'static str {
        match self {
            Persona::ReadingBuddy => "reading_buddy",
            Persona::Storyteller => "storyteller",
            Persona::Coach => "coach",
        }
    }

    /// Default provider voice for this persona in `language`
    pub fn voice(&self, language: Language) -> &'static str {
        match (self, language) {
            (Persona::ReadingBuddy, Language::English) => "shimmer",
            (Persona::ReadingBuddy, Language::Spanish) => "coral",
            (Persona::Storyteller, Language::English) => "sage",
            (Persona::Storyteller, Language::Spanish) => "ballad",
            (Persona::Coach, Language::English) => "alloy",
            (Persona::Coach, Language::Spanish) => "verse",
        }
    }

    fn description(&self, language: Language) -> &'static str {
        match (self, language) {
            (Persona::ReadingBuddy, Language::English) => {
                "You are a friendly reading buddy helping a child practice reading aloud."
            }
            (Persona::ReadingBuddy, Language::Spanish) => {
                "Eres un compañero de lectura amable que ayuda a un niño a practicar la lectura en voz alta."
            }
            (Persona::Storyteller, Language::English) => {
                "You are a warm storyteller who reads stories with a child and talks about them."
            }
            (Persona::Storyteller, Language::Spanish) => {
                "Eres un narrador cálido que lee cuentos con un niño y conversa sobre ellos."
            }
            (Persona::Coach, Language::English) => {
                "You are an encouraging reading coach running short phonics exercises."
            }
            (Persona::Coach, Language::Spanish) => {
                "Eres un entrenador de lectura alentador que guía ejercicios cortos de fonética."
            }
        }
    }
}

impl FromStr for Persona {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "reading_buddy" | "buddy" => Ok(Persona::ReadingBuddy),
            "storyteller" => Ok(Persona::Storyteller),
            "coach" => Ok(Persona::Coach),
            other => Err(format!("Unknown persona: {other}")),
        }
    }
}

/// Optional context supplied when a session is requested
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionMetadata {
    pub persona: Option<Persona>,
    /// School grade; 0 is kindergarten
    pub grade: Option<u8>,
    /// Free-form activity label, e.g. a lesson title
    pub activity: Option<String>,
}

impl SessionMetadata {
    /// Kindergarten through second grade
    pub fn is_early_reader(&self) -> bool {
        matches!(self.grade, Some(g) if g <= 2)
    }
}

/// Server-side voice activity detection parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnDetection {
    #[serde(rename = "type")]
    pub kind: String,
    pub threshold: f32,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
}

impl Default for TurnDetection {
    fn default() -> Self {
        Self {
            kind: "server_vad".to_string(),
            threshold: 0.5,
            prefix_padding_ms: 300,
            silence_duration_ms: 700,
        }
    }
}

impl TurnDetection {
    /// Tune VAD for the speaker
    ///
    /// Second-language and early readers pause longer mid-sentence, so both
    /// get extra silence tolerance before the turn is closed.
    pub fn tuned_for(language: Language, metadata: &SessionMetadata) -> Self {
        let mut detection = Self::default();

        if language == Language::Spanish {
            detection.silence_duration_ms += 300;
        }
        if metadata.is_early_reader() {
            detection.silence_duration_ms += 300;
            detection.threshold = 0.45;
        }
        detection
    }
}

/// Everything a credential is bound to at issuance
#[derive(Debug, Clone, PartialEq)]
pub struct VoiceProfile {
    pub language: Language,
    pub persona: Persona,
    pub voice: String,
    pub instructions: String,
    pub turn_detection: TurnDetection,
}

impl VoiceProfile {
    pub fn resolve(language: Language, metadata: &SessionMetadata) -> Self {
        let persona = metadata.persona.unwrap_or_default();

        Self {
            language,
            persona,
            voice: persona.voice(language).to_string(),
            instructions: build_instructions(language, persona, metadata),
            turn_detection: TurnDetection::tuned_for(language, metadata),
        }
    }
}

fn build_instructions(language: Language, persona: Persona, metadata: &SessionMetadata) -> String {
    let mut parts = vec![persona.description(language).to_string()];

    match language {
        Language::English => {
            parts.push("Speak only English, in short and simple sentences.".to_string());
            if let Some(grade) = metadata.grade {
                parts.push(match grade {
                    0 => "The reader is in kindergarten.".to_string(),
                    g => format!("The reader is in grade {g}."),
                });
            }
            if let Some(activity) = &metadata.activity {
                parts.push(format!("Today's activity: {activity}."));
            }
            parts.push(
                "Be patient, praise effort, and gently correct mispronounced words.".to_string(),
            );
        }
        Language::Spanish => {
            parts.push("Habla solo en español, con frases cortas y sencillas.".to_string());
            if let Some(grade) = metadata.grade {
                parts.push(match grade {
                    0 => "El lector está en kínder.".to_string(),
                    g => format!("El lector está en el grado {g}."),
                });
            }
            if let Some(activity) = &metadata.activity {
                parts.push(format!("Actividad de hoy: {activity}."));
            }
            parts.push(
                "Ten paciencia, elogia el esfuerzo y corrige con suavidad las palabras mal pronunciadas."
                    .to_string(),
            );
        }
    }

    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_language_parsing() {
        assert_eq!("en".parse::<Language>(), Ok(Language::English));
        assert_eq!("es-MX".parse::<Language>(), Ok(Language::Spanish));
        assert_eq!("EN_us".parse::<Language>(), Ok(Language::English));
        assert_eq!(
            "fr".parse::<Language>(),
            Err(UnsupportedLanguage("fr".to_string()))
        );
        assert!("".parse::<Language>().is_err());
    }

    #[test]
    fn test_language_serde_uses_codes() {
        assert_eq!(serde_json::to_string(&Language::Spanish).unwrap(), "\"es\"");
        let lang: Language = serde_json::from_str("\"en\"").unwrap();
        assert_eq!(lang, Language::English);
    }

    #[test]
    fn test_persona_voices_differ_by_language() {
        for persona in [Persona::ReadingBuddy, Persona::Storyteller, Persona::Coach] {
            assert_ne!(persona.voice(Language::English), persona.voice(Language::Spanish));
        }
        assert_eq!("reading-buddy".parse::<Persona>(), Ok(Persona::ReadingBuddy));
    }

    #[test]
    fn test_turn_detection_tuning() {
        let base = TurnDetection::tuned_for(Language::English, &SessionMetadata::default());
        assert_eq!(base, TurnDetection::default());

        let spanish = TurnDetection::tuned_for(Language::Spanish, &SessionMetadata::default());
        assert_eq!(spanish.silence_duration_ms, 1000);

        let young = SessionMetadata {
            grade: Some(1),
            ..Default::default()
        };
        let spanish_young = TurnDetection::tuned_for(Language::Spanish, &young);
        assert_eq!(spanish_young.silence_duration_ms, 1300);
        assert_eq!(spanish_young.threshold, 0.45);

        let older = SessionMetadata {
            grade: Some(5),
            ..Default::default()
        };
        assert_eq!(
            TurnDetection::tuned_for(Language::English, &older).silence_duration_ms,
            700
        );
    }

    #[test]
    fn test_turn_detection_wire_shape() {
        let json = serde_json::to_value(TurnDetection::default()).unwrap();
        assert_eq!(json["type"], "server_vad");
        assert_eq!(json["silence_duration_ms"], 700);
    }

    #[test]
    fn test_profile_instructions_are_localized() {
        let metadata = SessionMetadata {
            persona: Some(Persona::Storyteller),
            grade: Some(0),
            activity: Some("Los tres cerditos".to_string()),
        };
        let profile = VoiceProfile::resolve(Language::Spanish, &metadata);

        assert_eq!(profile.voice, "ballad");
        assert!(profile.instructions.contains("español"));
        assert!(profile.instructions.contains("kínder"));
        assert!(profile.instructions.contains("Los tres cerditos"));

        let english = VoiceProfile::resolve(Language::English, &SessionMetadata::default());
        assert_eq!(english.persona, Persona::ReadingBuddy);
        assert!(english.instructions.contains("English"));
        assert!(!english.instructions.contains("grade"));
    }
}
