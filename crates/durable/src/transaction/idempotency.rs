//! Idempotency keys identifying one handler of one step of one transaction

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Separator between key segments
pub const KEY_SEPARATOR: char = ':';

/// Which handler of a step is being run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum HandlerType {
    Invoke,
    Compensate,
}

impl fmt::Display for HandlerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerType::Invoke => write!(f, "invoke"),
            HandlerType::Compensate => write!(f, "compensate"),
        }
    }
}

impl FromStr for HandlerType {
    type Err = IdempotencyKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "invoke" => Ok(HandlerType::Invoke),
            "compensate" => Ok(HandlerType::Compensate),
            other => Err(IdempotencyKeyError::UnknownAction(other.to_string())),
        }
    }
}

/// Errors parsing an idempotency key
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdempotencyKeyError {
    #[error("malformed idempotency key '{0}': expected workflow:transaction:step:action")]
    Malformed(String),

    #[error("unknown handler action '{0}'")]
    UnknownAction(String),
}

/// Stable identifier of a single handler invocation
///
/// Rendered as `workflow_id:transaction_id:step_id:action`. Handlers receive
/// it through their context and can hand it to external systems, which later
/// report asynchronous completion by passing it back to the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct IdempotencyKey {
    pub workflow_id: String,
    pub transaction_id: String,
    pub step_id: String,
    pub action: HandlerType,
}

impl IdempotencyKey {
    pub fn new(
        workflow_id: impl Into<String>,
        transaction_id: impl Into<String>,
        step_id: impl Into<String>,
        action: HandlerType,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            transaction_id: transaction_id.into(),
            step_id: step_id.into(),
            action,
        }
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{sep}{}{sep}{}{sep}{}",
            self.workflow_id,
            self.transaction_id,
            self.step_id,
            self.action,
            sep = KEY_SEPARATOR
        )
    }
}

impl FromStr for IdempotencyKey {
    type Err = IdempotencyKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(KEY_SEPARATOR).collect();
        match parts.as_slice() {
            [workflow_id, transaction_id, step_id, action]
                if !workflow_id.is_empty() && !transaction_id.is_empty() && !step_id.is_empty() =>
            {
                Ok(Self::new(
                    *workflow_id,
                    *transaction_id,
                    *step_id,
                    action.parse()?,
                ))
            }
            _ => Err(IdempotencyKeyError::Malformed(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_format() {
        let key = IdempotencyKey::new("order", "tx-1", "charge", HandlerType::Invoke);
        assert_eq!(key.to_string(), "order:tx-1:charge:invoke");
    }

    #[test]
    fn test_key_parse() {
        let key: IdempotencyKey = "order:tx-1:refund.charge:compensate".parse().unwrap();
        assert_eq!(key.workflow_id, "order");
        assert_eq!(key.transaction_id, "tx-1");
        assert_eq!(key.step_id, "refund.charge");
        assert_eq!(key.action, HandlerType::Compensate);
    }

    #[test]
    fn test_key_parse_errors() {
        assert!(matches!(
            "order:tx-1:charge".parse::<IdempotencyKey>(),
            Err(IdempotencyKeyError::Malformed(_))
        ));
        assert!(matches!(
            "order::charge:invoke".parse::<IdempotencyKey>(),
            Err(IdempotencyKeyError::Malformed(_))
        ));
        assert_eq!(
            "order:tx-1:charge:undo".parse::<IdempotencyKey>(),
            Err(IdempotencyKeyError::UnknownAction("undo".to_string()))
        );
    }
}
