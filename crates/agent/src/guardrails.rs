use tabula_core::config::GuardrailConfig;
use tabula_core::{ActCode, CodeDialect, FlowType};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GuardrailIntent {
    UnsupportedAct { act: ActCode },
    /// No flow is active; the turn is answered by clarifying or chatting.
    Unrouted { act: ActCode },
    DestructiveFlow { flow_type: FlowType },
    RawCode { dialect: CodeDialect },
    Task { flow_type: FlowType },
}

impl GuardrailIntent {
    /// Classifies what a tracked turn is about to do.
    pub fn classify(act: ActCode, flow_type: Option<FlowType>, raw: Option<CodeDialect>) -> Self {
        if let Some(dialect) = raw {
            return Self::RawCode { dialect };
        }
        match flow_type {
            _ if act.is_unsupported() => Self::UnsupportedAct { act },
            None => Self::Unrouted { act },
            Some(flow_type) if flow_type.is_destructive() => Self::DestructiveFlow { flow_type },
            Some(flow_type) => Self::Task { flow_type },
        }
    }

    pub fn action_key(&self) -> String {
        match self {
            Self::UnsupportedAct { .. } => "dialogue.unsupported_act".to_string(),
            Self::Unrouted { .. } => "dialogue.unrouted".to_string(),
            Self::DestructiveFlow { flow_type } => format!("flow.{}", flow_type.as_str()),
            Self::RawCode { dialect } => format!("raw.{}", dialect.as_str()),
            Self::Task { flow_type } => format!("flow.{}", flow_type.as_str()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GuardrailDecision {
    Allow,
    Deny { reason_code: &'static str, user_message: String, fallback_path: &'static str },
    Degrade { reason_code: &'static str, user_message: String, fallback_path: &'static str },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GuardrailPolicy {
    pub allow_destructive: bool,
    pub allow_raw_code: bool,
}

impl Default for GuardrailPolicy {
    fn default() -> Self {
        Self::from_config(&GuardrailConfig::default())
    }
}

impl GuardrailPolicy {
    pub fn from_config(config: &GuardrailConfig) -> Self {
        Self { allow_destructive: config.allow_destructive, allow_raw_code: config.allow_raw_code }
    }

    pub fn evaluate(&self, intent: &GuardrailIntent) -> GuardrailDecision {
        match intent {
            GuardrailIntent::Task { .. } | GuardrailIntent::Unrouted { .. } => GuardrailDecision::Allow,
            GuardrailIntent::UnsupportedAct { .. } => GuardrailDecision::Deny {
                reason_code: "unsupported_act",
                user_message: "I can't help with that kind of request on this data yet.".to_string(),
                fallback_path: "chat",
            },
            GuardrailIntent::DestructiveFlow { .. } if self.allow_destructive => GuardrailDecision::Allow,
            GuardrailIntent::DestructiveFlow { flow_type } => GuardrailDecision::Deny {
                reason_code: "destructive_flow_disabled",
                user_message: format!(
                    "Changes to the data are turned off, so I can't {} here.",
                    flow_type.goal()
                ),
                fallback_path: "query_preview",
            },
            GuardrailIntent::RawCode { .. } if self.allow_raw_code => GuardrailDecision::Allow,
            GuardrailIntent::RawCode { dialect } => GuardrailDecision::Degrade {
                reason_code: "raw_code_disabled",
                user_message: format!(
                    "Running {} code directly is turned off, so I'll treat it as a request instead.",
                    dialect.as_str()
                ),
                fallback_path: "understand_as_text",
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use tabula_core::config::GuardrailConfig;
    use tabula_core::{ActCode, CodeDialect, FlowType};

    use super::{GuardrailDecision, GuardrailIntent, GuardrailPolicy};

    #[test]
    fn ordinary_task_is_allowed() {
        let policy = GuardrailPolicy::default();
        let intent = GuardrailIntent::classify(ActCode::QUERY, Some(FlowType::Query), None);
        assert_eq!(intent.action_key(), "flow.query");
        assert_eq!(policy.evaluate(&intent), GuardrailDecision::Allow);
    }

    #[test]
    fn destructive_flow_is_denied_by_default() {
        let policy = GuardrailPolicy::default();
        let intent = GuardrailIntent::classify(
            FlowType::DeleteColumn.canonical_act(),
            Some(FlowType::DeleteColumn),
            None,
        );

        let (reason_code, user_message, fallback_path) = match policy.evaluate(&intent) {
            GuardrailDecision::Deny { reason_code, user_message, fallback_path } => {
                (reason_code, user_message, fallback_path)
            }
            _ => ("", String::new(), ""),
        };
        assert_eq!(reason_code, "destructive_flow_disabled");
        assert!(user_message.contains("remove a column"));
        assert_eq!(fallback_path, "query_preview");

        let permissive = GuardrailPolicy::from_config(&GuardrailConfig {
            allow_destructive: true,
            allow_raw_code: true,
        });
        assert_eq!(permissive.evaluate(&intent), GuardrailDecision::Allow);
    }

    #[test]
    fn unsupported_act_is_denied() {
        let policy = GuardrailPolicy::default();
        let intent = GuardrailIntent::classify(ActCode::UNSUPPORTED, None, None);
        assert!(matches!(
            policy.evaluate(&intent),
            GuardrailDecision::Deny { reason_code: "unsupported_act", .. }
        ));
    }

    #[test]
    fn turn_without_a_flow_is_allowed() {
        let policy = GuardrailPolicy::default();
        let intent = GuardrailIntent::classify(ActCode::CHAT, None, None);
        assert_eq!(intent, GuardrailIntent::Unrouted { act: ActCode::CHAT });
        assert_eq!(policy.evaluate(&intent), GuardrailDecision::Allow);

        let denylisted = GuardrailIntent::classify(ActCode::UNSUPPORTED, Some(FlowType::Query), None);
        assert!(matches!(denylisted, GuardrailIntent::UnsupportedAct { .. }));
    }

    #[test]
    fn raw_code_follows_config() {
        let intent = GuardrailIntent::classify(ActCode::QUERY, Some(FlowType::Query), Some(CodeDialect::Query));
        assert_eq!(GuardrailPolicy::default().evaluate(&intent), GuardrailDecision::Allow);

        let locked = GuardrailPolicy { allow_destructive: false, allow_raw_code: false };
        assert!(matches!(
            locked.evaluate(&intent),
            GuardrailDecision::Degrade { reason_code: "raw_code_disabled", .. }
        ));
    }
}
