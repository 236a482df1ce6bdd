//! Saga definitions, retry policy, and persisted transaction types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, ValidationError};
use crate::types::{Timestamp, TransactionId};

/// Default retry policy applied to every step unless overridden.
pub const DEFAULT_RETRY_POLICY: RetryPolicy = RetryPolicy {
    max_attempts: 3,
    base_delay_ms: 100,
    backoff_multiplier: 2.0,
    max_delay_ms: 5_000,
    jitter: 0.1,
};

/// Exponential-backoff retry policy for a saga step.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay_ms: u64,
    /// Multiplier applied per retry.
    pub backoff_multiplier: f64,
    /// Ceiling on the computed delay, pre-jitter.
    pub max_delay_ms: u64,
    /// Symmetric jitter fraction in `[0, 1]`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        DEFAULT_RETRY_POLICY
    }
}

/// Step-level override; `None` fields inherit the executor default.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryOverride {
    /// Override for `max_attempts`.
    pub max_attempts: Option<u32>,
    /// Override for `base_delay_ms`.
    pub base_delay_ms: Option<u64>,
    /// Override for `backoff_multiplier`.
    pub backoff_multiplier: Option<f64>,
    /// Override for `max_delay_ms`.
    pub max_delay_ms: Option<u64>,
    /// Override for `jitter`.
    pub jitter: Option<f64>,
}

impl RetryPolicy {
    /// Merges a step-level override onto this policy.
    pub fn merged(&self, over: &RetryOverride) -> RetryPolicy {
        RetryPolicy {
            max_attempts: over.max_attempts.unwrap_or(self.max_attempts),
            base_delay_ms: over.base_delay_ms.unwrap_or(self.base_delay_ms),
            backoff_multiplier: over.backoff_multiplier.unwrap_or(self.backoff_multiplier),
            max_delay_ms: over.max_delay_ms.unwrap_or(self.max_delay_ms),
            jitter: over.jitter.unwrap_or(self.jitter),
        }
    }

    /// Delay before retry `attempt` (0-indexed), jittered by
    /// `(1 + U(-jitter, +jitter))`.
    pub fn delay_for_attempt(&self, attempt: u32, rng: &mut impl rand::Rng) -> u64 {
        let base = (self.base_delay_ms as f64) * self.backoff_multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay_ms as f64);
        let factor = if self.jitter > 0.0 {
            1.0 + rng.gen_range(-self.jitter..=self.jitter)
        } else {
            1.0
        };
        (capped * factor).max(0.0) as u64
    }
}

/// Compensation ordering when a saga aborts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompensationStrategy {
    /// Reverse topological order, one at a time.
    #[default]
    Sequential,
    /// All completed steps compensated concurrently.
    Parallel,
}

/// One step of a saga.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SagaStep {
    /// Unique step id within the saga.
    pub id: String,
    /// Participant the executor invokes.
    pub participant_id: String,
    /// Method name passed to the participant.
    pub method: String,
    /// Method parameters.
    #[serde(default)]
    pub params: Value,
    /// Method invoked to undo this step; `None` means nothing to undo.
    #[serde(default)]
    pub compensation_method: Option<String>,
    /// Steps that must succeed before this one starts.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Step-level retry override.
    #[serde(default)]
    pub retry: Option<RetryOverride>,
}

/// A complete saga definition.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SagaDefinition {
    /// Transaction id; callers usually mint with `TransactionId::new()`.
    pub id: TransactionId,
    /// Optional human name.
    #[serde(default)]
    pub name: Option<String>,
    /// Steps, scheduled by `depends_on`.
    pub steps: Vec<SagaStep>,
    /// How compensations run on abort.
    #[serde(default)]
    pub compensation_strategy: CompensationStrategy,
}

impl SagaDefinition {
    /// Validates step ids are unique and dependencies resolve.
    pub fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(ValidationError::required_field("steps").into());
        }
        let mut seen = std::collections::HashSet::new();
        for step in &self.steps {
            if step.id.is_empty() {
                return Err(ValidationError::required_field("step.id").into());
            }
            if step.participant_id.is_empty() {
                return Err(ValidationError::required_field("step.participant_id").into());
            }
            if !seen.insert(step.id.as_str()) {
                return Err(ValidationError::invalid_field(
                    "step.id",
                    format!("duplicate step id '{}'", step.id),
                )
                .into());
            }
        }
        for step in &self.steps {
            for dep in &step.depends_on {
                if !seen.contains(dep.as_str()) {
                    return Err(ValidationError::invalid_field(
                        "step.depends_on",
                        format!("step '{}' depends on unknown step '{}'", step.id, dep),
                    )
                    .into());
                }
            }
        }
        Ok(())
    }
}

/// Saga state machine.
///
/// ```text
///  Pending ─► Executing ─► Committing ─► Committed (terminal)
///                 │
///                 └► Compensating ─► Aborted (terminal)
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SagaState {
    /// Persisted, not yet started.
    Pending,
    /// Steps running.
    Executing,
    /// All steps succeeded; finalizing.
    Committing,
    /// Terminal success.
    Committed,
    /// Undoing completed steps.
    Compensating,
    /// Terminal failure.
    Aborted,
}

impl SagaState {
    /// Storage string for the state column.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Executing => "executing",
            Self::Committing => "committing",
            Self::Committed => "committed",
            Self::Compensating => "compensating",
            Self::Aborted => "aborted",
        }
    }

    /// Parses the storage string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "executing" => Some(Self::Executing),
            "committing" => Some(Self::Committing),
            "committed" => Some(Self::Committed),
            "compensating" => Some(Self::Compensating),
            "aborted" => Some(Self::Aborted),
            _ => None,
        }
    }

    /// Returns true for `Committed` and `Aborted`.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::Aborted)
    }
}

/// A persisted saga transaction row.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SagaTransaction {
    /// Transaction id.
    pub id: TransactionId,
    /// Current state.
    pub state: SagaState,
    /// The definition as executed.
    pub definition: SagaDefinition,
    /// Creation time.
    pub created_at: Timestamp,
    /// Last state transition time.
    pub updated_at: Timestamp,
}

/// A persisted step (or compensation) result row.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepResult {
    /// Owning transaction.
    pub transaction_id: TransactionId,
    /// Step this result belongs to.
    pub step_id: String,
    /// True for compensation runs.
    pub is_compensation: bool,
    /// Whether the invocation succeeded.
    pub success: bool,
    /// Participant return value on success.
    pub data: Option<Value>,
    /// Error message on failure.
    pub error: Option<String>,
    /// Retries actually performed (not total attempts).
    pub retry_count: u32,
    /// When the first attempt started.
    pub started_at: Timestamp,
    /// When the final attempt finished.
    pub completed_at: Timestamp,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn step(id: &str, deps: &[&str]) -> SagaStep {
        SagaStep {
            id: id.to_string(),
            participant_id: "p".to_string(),
            method: "m".to_string(),
            params: Value::Null,
            compensation_method: None,
            depends_on: deps.iter().map(|s| s.to_string()).collect(),
            retry: None,
        }
    }

    #[test]
    fn test_merged_override() {
        let policy = DEFAULT_RETRY_POLICY.merged(&RetryOverride {
            max_attempts: Some(5),
            ..Default::default()
        });
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_delay_ms, DEFAULT_RETRY_POLICY.base_delay_ms);
    }

    #[test]
    fn test_delay_exponential_and_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay_ms: 100,
            backoff_multiplier: 2.0,
            max_delay_ms: 500,
            jitter: 0.0,
        };
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        assert_eq!(policy.delay_for_attempt(0, &mut rng), 100);
        assert_eq!(policy.delay_for_attempt(1, &mut rng), 200);
        assert_eq!(policy.delay_for_attempt(2, &mut rng), 400);
        // Capped at max_delay_ms from here on
        assert_eq!(policy.delay_for_attempt(3, &mut rng), 500);
        assert_eq!(policy.delay_for_attempt(9, &mut rng), 500);
    }

    #[test]
    fn test_delay_jitter_bounds() {
        let policy = RetryPolicy {
            jitter: 0.5,
            ..DEFAULT_RETRY_POLICY
        };
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        for attempt in 0..4 {
            let nominal = ((policy.base_delay_ms as f64)
                * policy.backoff_multiplier.powi(attempt as i32))
            .min(policy.max_delay_ms as f64);
            let delay = policy.delay_for_attempt(attempt, &mut rng) as f64;
            assert!(delay >= nominal * 0.5 - 1.0);
            assert!(delay <= nominal * 1.5 + 1.0);
        }
    }

    #[test]
    fn test_definition_validate_ok() {
        let def = SagaDefinition {
            id: TransactionId::new(),
            name: None,
            steps: vec![step("a", &[]), step("b", &["a"])],
            compensation_strategy: CompensationStrategy::Sequential,
        };
        assert!(def.validate().is_ok());
    }

    #[test]
    fn test_definition_rejects_duplicate_ids() {
        let def = SagaDefinition {
            id: TransactionId::new(),
            name: None,
            steps: vec![step("a", &[]), step("a", &[])],
            compensation_strategy: CompensationStrategy::Sequential,
        };
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_definition_rejects_unknown_dependency() {
        let def = SagaDefinition {
            id: TransactionId::new(),
            name: None,
            steps: vec![step("a", &["ghost"])],
            compensation_strategy: CompensationStrategy::Sequential,
        };
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_definition_rejects_empty() {
        let def = SagaDefinition {
            id: TransactionId::new(),
            name: None,
            steps: vec![],
            compensation_strategy: CompensationStrategy::Sequential,
        };
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_state_roundtrip() {
        for state in [
            SagaState::Pending,
            SagaState::Executing,
            SagaState::Committing,
            SagaState::Committed,
            SagaState::Compensating,
            SagaState::Aborted,
        ] {
            assert_eq!(SagaState::parse(state.as_str()), Some(state));
        }
        assert_eq!(SagaState::parse("bogus"), None);
    }

    #[test]
    fn test_terminal_states() {
        assert!(SagaState::Committed.is_terminal());
        assert!(SagaState::Aborted.is_terminal());
        assert!(!SagaState::Executing.is_terminal());
        assert!(!SagaState::Compensating.is_terminal());
    }
}
