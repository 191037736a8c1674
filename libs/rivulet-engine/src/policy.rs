use std::fmt;

use rivulet_api::record::Record;

/// Classification attached to a validation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// Record value exceeds the configured size bound.
    ValueTooLarge,
    /// Record is missing a required key.
    KeyRequired,
    /// Domain-specific predicate failed.
    Custom(String),
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::ValueTooLarge => write!(f, "value too large"),
            FailureKind::KeyRequired => write!(f, "key required"),
            FailureKind::Custom(name) => write!(f, "{name}"),
        }
    }
}

/// A validation check failed for one record.
///
/// Typed and surfaced to the runtime's supervision logic; never dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationViolation {
    pub rule: String,
    pub kind: FailureKind,
    pub detail: String,
}

impl fmt::Display for ValidationViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rule '{}' ({:?}): {}", self.rule, self.kind, self.detail)
    }
}

impl std::error::Error for ValidationViolation {}

type Predicate = Box<dyn Fn(&Record) -> bool + Send + Sync>;

/// One predicate evaluated against every record before delivery.
/// Owned by the agent that declared it.
pub struct ValidationRule {
    name: String,
    predicate: Predicate,
    on_violation: FailureKind,
}

impl ValidationRule {
    pub fn new(
        name: impl Into<String>,
        on_violation: FailureKind,
        predicate: impl Fn(&Record) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            predicate: Box::new(predicate),
            on_violation,
        }
    }

    /// Reject records whose value exceeds `max` bytes.
    pub fn max_value_length(max: usize) -> Self {
        Self::new("max_value_length", FailureKind::ValueTooLarge, move |r| {
            r.value.len() <= max
        })
    }

    /// Reject records without a key.
    pub fn key_required() -> Self {
        Self::new("key_required", FailureKind::KeyRequired, |r| {
            r.key.is_some()
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for ValidationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidationRule")
            .field("name", &self.name)
            .field("on_violation", &self.on_violation)
            .finish()
    }
}

/// Ordered rule set evaluated before the handler body runs.
#[derive(Debug, Default)]
pub struct ValidationPolicy {
    rules: Vec<ValidationRule>,
}

impl ValidationPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rule(mut self, rule: ValidationRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn push(&mut self, rule: ValidationRule) {
        self.rules.push(rule);
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Evaluate rules in registration order; the first violation
    /// short-circuits the remaining checks.
    pub fn check(&self, record: &Record) -> Result<(), ValidationViolation> {
        for rule in &self.rules {
            if !(rule.predicate)(record) {
                return Err(ValidationViolation {
                    rule: rule.name.clone(),
                    kind: rule.on_violation.clone(),
                    detail: format!(
                        "record {}[{}]@{} rejected ({} value bytes)",
                        record.topic,
                        record.partition,
                        record.offset,
                        record.value.len()
                    ),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(value: &[u8]) -> Record {
        Record {
            topic: "t".into(),
            partition: 0,
            offset: 0,
            key: None,
            value: value.to_vec(),
            ts_ms: 0,
        }
    }

    #[test]
    fn max_length_boundary() {
        let policy = ValidationPolicy::new().with_rule(ValidationRule::max_value_length(15));
        assert!(policy.check(&record(&[0u8; 15])).is_ok());

        let violation = policy.check(&record(&[0u8; 16])).unwrap_err();
        assert_eq!(violation.kind, FailureKind::ValueTooLarge);
        assert_eq!(violation.rule, "max_value_length");
    }

    #[test]
    fn first_violation_short_circuits() {
        // Second rule panics if evaluated; the first must short-circuit.
        let policy = ValidationPolicy::new()
            .with_rule(ValidationRule::max_value_length(1))
            .with_rule(ValidationRule::new(
                "must_not_run",
                FailureKind::Custom("unreachable".into()),
                |_| panic!("second rule evaluated after first violation"),
            ));

        let violation = policy.check(&record(b"too long")).unwrap_err();
        assert_eq!(violation.rule, "max_value_length");
    }

    #[test]
    fn rules_run_in_registration_order() {
        let policy = ValidationPolicy::new()
            .with_rule(ValidationRule::key_required())
            .with_rule(ValidationRule::max_value_length(1));

        // Both rules would fail; the earlier one wins.
        let violation = policy.check(&record(b"no key, too long")).unwrap_err();
        assert_eq!(violation.kind, FailureKind::KeyRequired);
    }

    #[test]
    fn empty_policy_accepts_everything() {
        let policy = ValidationPolicy::new();
        assert!(policy.check(&record(&[0u8; 4096])).is_ok());
    }
}
