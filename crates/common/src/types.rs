use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Longest saga identifier accepted from a caller.
pub const MAX_SAGA_ID_LEN: usize = 128;

/// Identifier of one purchase saga.
///
/// Opaque to the orchestrator: callers may supply their own (it doubles as
/// the idempotency key of the start request) or let one be generated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SagaId(String);

impl SagaId {
    /// Generates a fresh random saga ID.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Wraps a caller-supplied identifier after checking its shape.
    pub fn parse(raw: impl Into<String>) -> Result<Self, InvalidSagaId> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(InvalidSagaId::Empty);
        }
        if raw.len() > MAX_SAGA_ID_LEN {
            return Err(InvalidSagaId::TooLong(raw.len()));
        }
        if let Some(c) = raw
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':')))
        {
            return Err(InvalidSagaId::InvalidCharacter(c));
        }
        Ok(Self(raw))
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SagaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SagaId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Reasons a caller-supplied saga ID is refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidSagaId {
    #[error("saga id must not be empty")]
    Empty,
    #[error("saga id is {0} characters long, at most {MAX_SAGA_ID_LEN} are allowed")]
    TooLong(usize),
    #[error("saga id contains invalid character {0:?}")]
    InvalidCharacter(char),
}

/// Identifier of a platform user, as issued by the user service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(i64);

impl UserId {
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for UserId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Money amount represented in cents to avoid floating point issues.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Money(i64);

impl Money {
    /// Creates a new Money amount from cents.
    pub fn from_cents(cents: i64) -> Self {
        Self(cents)
    }

    /// Converts a decimal amount such as `8999.99` to cents, rounding to the
    /// nearest cent. Returns `None` for NaN, infinities and out-of-range values.
    pub fn from_decimal(amount: f64) -> Option<Self> {
        if !amount.is_finite() {
            return None;
        }
        let cents = (amount * 100.0).round();
        if cents.abs() >= i64::MAX as f64 {
            return None;
        }
        Some(Self(cents as i64))
    }

    /// Returns the amount in cents.
    pub fn cents(&self) -> i64 {
        self.0
    }

    /// Returns the amount as a decimal, the representation downstream services expect.
    pub fn as_decimal(&self) -> f64 {
        self.0 as f64 / 100.0
    }

    /// Returns true if the amount is positive.
    pub fn is_positive(&self) -> bool {
        self.0 > 0
    }
}

impl std::fmt::Display for Money {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}${}.{:02}", abs / 100, abs % 100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_saga_ids_are_unique_and_valid() {
        let a = SagaId::generate();
        let b = SagaId::generate();
        assert_ne!(a, b);
        assert_eq!(SagaId::parse(a.as_str()).unwrap(), a);
    }

    #[test]
    fn saga_id_parse_rejects_bad_input() {
        assert_eq!(SagaId::parse(""), Err(InvalidSagaId::Empty));
        assert_eq!(
            SagaId::parse("a".repeat(MAX_SAGA_ID_LEN + 1)),
            Err(InvalidSagaId::TooLong(MAX_SAGA_ID_LEN + 1))
        );
        assert_eq!(
            SagaId::parse("s 1"),
            Err(InvalidSagaId::InvalidCharacter(' '))
        );
        assert!(SagaId::parse("s1").is_ok());
        assert!(SagaId::parse("order:2025-01-25_x.1").is_ok());
    }

    #[test]
    fn saga_id_serializes_as_plain_string() {
        let id = SagaId::parse("s1").unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"s1\"");
    }

    #[test]
    fn money_from_decimal_rounds_to_cents() {
        assert_eq!(Money::from_decimal(8999.99), Some(Money::from_cents(899_999)));
        assert_eq!(Money::from_decimal(0.1 + 0.2), Some(Money::from_cents(30)));
        assert_eq!(Money::from_decimal(f64::NAN), None);
        assert_eq!(Money::from_decimal(f64::INFINITY), None);
    }

    #[test]
    fn money_display() {
        assert_eq!(Money::from_cents(899_999).to_string(), "$8999.99");
        assert_eq!(Money::from_cents(-5).to_string(), "-$0.05");
        assert_eq!(Money::from_cents(899_999).as_decimal(), 8999.99);
    }
}
