use serde::{Deserialize, Serialize};

use crate::{ApiError, Result};

/// Message role within a dialog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional generation parameters attached to a dialog or a single send.
/// Unknown keys are rejected at deserialization; ranges are checked by
/// [`AgentConfig::validate`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
}

impl AgentConfig {
    pub fn is_empty(&self) -> bool {
        *self == AgentConfig::default()
    }

    /// Range-check every set field. `context_window` bounds `max_tokens` when
    /// the target model is known.
    pub fn validate(&self, context_window: Option<u32>) -> Result<()> {
        if let Some(t) = self.temperature {
            if !(0.0..=1.0).contains(&t) {
                return Err(ApiError::Validation(format!(
                    "Invalid temperature {t}. Must be between 0 and 1."
                )));
            }
        }
        if let Some(m) = self.max_tokens {
            if m == 0 {
                return Err(ApiError::Validation(
                    "Invalid max_tokens 0. Must be greater than 0.".to_string(),
                ));
            }
            if let Some(window) = context_window {
                if m > window {
                    return Err(ApiError::Validation(format!(
                        "Invalid max_tokens {m}. Must be <= model context window ({window})."
                    )));
                }
            }
        }
        if let Some(p) = self.top_p {
            if !(0.0..=1.0).contains(&p) {
                return Err(ApiError::Validation(format!(
                    "Invalid top_p {p}. Must be between 0 and 1."
                )));
            }
        }
        if let Some(p) = self.presence_penalty {
            if !(-2.0..=2.0).contains(&p) {
                return Err(ApiError::Validation(format!(
                    "Invalid presence_penalty {p}. Must be between -2 and 2."
                )));
            }
        }
        if let Some(p) = self.frequency_penalty {
            if !(-2.0..=2.0).contains(&p) {
                return Err(ApiError::Validation(format!(
                    "Invalid frequency_penalty {p}. Must be between -2 and 2."
                )));
            }
        }
        Ok(())
    }

    /// Overlay `self` on top of `base`: fields set here win, unset fields
    /// fall through.
    pub fn merged_over(&self, base: &AgentConfig) -> AgentConfig {
        AgentConfig {
            temperature: self.temperature.or(base.temperature),
            max_tokens: self.max_tokens.or(base.max_tokens),
            top_p: self.top_p.or(base.top_p),
            presence_penalty: self.presence_penalty.or(base.presence_penalty),
            frequency_penalty: self.frequency_penalty.or(base.frequency_penalty),
            stop_sequences: self
                .stop_sequences
                .clone()
                .or_else(|| base.stop_sequences.clone()),
        }
    }
}

/// A named generation preset selectable per send.
#[derive(Debug, Clone, Serialize)]
pub struct AgentPreset {
    pub name: &'static str,
    pub description: &'static str,
    pub config: AgentConfig,
}

/// Look up a preset by name. The table is fixed at compile time.
pub fn agent_preset(name: &str) -> Option<AgentPreset> {
    match name {
        "default" => Some(AgentPreset {
            name: "default",
            description: "Balanced assistant for general tasks",
            config: AgentConfig {
                temperature: Some(0.7),
                ..AgentConfig::default()
            },
        }),
        "code_assistant" => Some(AgentPreset {
            name: "code_assistant",
            description: "Lower temperature for accuracy on coding tasks",
            config: AgentConfig {
                temperature: Some(0.2),
                max_tokens: Some(4096),
                ..AgentConfig::default()
            },
        }),
        "creative_writer" => Some(AgentPreset {
            name: "creative_writer",
            description: "Higher temperature for varied outputs",
            config: AgentConfig {
                temperature: Some(0.9),
                ..AgentConfig::default()
            },
        }),
        _ => None,
    }
}

/// Resolve the effective config for one send.
///
/// Precedence: user-supplied > preset > dialog-level. The result is
/// validated against the model's context window.
pub fn effective_config(
    user: Option<&AgentConfig>,
    agent_type: Option<&str>,
    dialog: Option<&AgentConfig>,
    context_window: Option<u32>,
) -> Result<AgentConfig> {
    let mut merged = dialog.cloned().unwrap_or_default();

    if let Some(name) = agent_type {
        let preset = agent_preset(name).ok_or_else(|| {
            ApiError::Validation(format!(
                "Unknown agent type '{name}'. Available types: default, code_assistant, creative_writer"
            ))
        })?;
        merged = preset.config.merged_over(&merged);
    }

    if let Some(user) = user {
        merged = user.merged_over(&merged);
    }

    merged.validate(context_window)?;
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_keys() {
        let result: std::result::Result<AgentConfig, _> =
            serde_json::from_str(r#"{"temperature": 0.5, "beam_width": 4}"#);
        assert!(result.is_err());
    }

    #[test]
    fn validates_ranges() {
        let config = AgentConfig {
            temperature: Some(1.5),
            ..AgentConfig::default()
        };
        assert!(config.validate(None).is_err());

        let config = AgentConfig {
            presence_penalty: Some(-2.5),
            ..AgentConfig::default()
        };
        assert!(config.validate(None).is_err());

        let config = AgentConfig {
            temperature: Some(0.3),
            top_p: Some(0.9),
            presence_penalty: Some(1.0),
            frequency_penalty: Some(-1.0),
            ..AgentConfig::default()
        };
        assert!(config.validate(None).is_ok());
    }

    #[test]
    fn max_tokens_bounded_by_context_window() {
        let config = AgentConfig {
            max_tokens: Some(9000),
            ..AgentConfig::default()
        };
        assert!(config.validate(Some(8192)).is_err());
        assert!(config.validate(Some(16384)).is_ok());
        assert!(config.validate(None).is_ok());
    }

    #[test]
    fn merge_precedence_user_over_preset_over_dialog() {
        let dialog = AgentConfig {
            temperature: Some(0.5),
            max_tokens: Some(1000),
            top_p: Some(0.8),
            ..AgentConfig::default()
        };
        let user = AgentConfig {
            temperature: Some(0.1),
            ..AgentConfig::default()
        };
        let merged = effective_config(
            Some(&user),
            Some("code_assistant"),
            Some(&dialog),
            Some(16384),
        )
        .expect("merge");

        // user wins over the preset's 0.2
        assert_eq!(merged.temperature, Some(0.1));
        // preset wins over the dialog's 1000
        assert_eq!(merged.max_tokens, Some(4096));
        // dialog value survives where nothing overrides it
        assert_eq!(merged.top_p, Some(0.8));
    }

    #[test]
    fn unknown_agent_type_is_validation_error() {
        let err = effective_config(None, Some("poet"), None, None).unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn role_round_trips() {
        for role in [Role::User, Role::Assistant, Role::System] {
            let parsed: Role = role.as_str().parse().expect("parse");
            assert_eq!(parsed, role);
        }
        assert!("bot".parse::<Role>().is_err());
    }
}
