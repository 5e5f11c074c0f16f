//! Money: currencies and line items in integer minor units.

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// ISO-4217 currency code (three uppercase ASCII letters).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Currency(String);

impl Currency {
    pub fn new(code: impl Into<String>) -> DomainResult<Self> {
        let code = code.into();
        if code.len() != 3 || !code.bytes().all(|b| b.is_ascii_uppercase()) {
            return Err(DomainError::validation(format!(
                "currency must be a three-letter uppercase code, got '{code}'"
            )));
        }
        Ok(Self(code))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Currency {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Currency> for String {
    fn from(value: Currency) -> Self {
        value.0
    }
}

impl core::fmt::Display for Currency {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a line item charges (or credits) for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineItemKind {
    Usage,
    Subscription,
    Fee,
    Adjustment,
}

/// Statement line: `amount` is already priced, in minor currency units.
///
/// `quantity` is informational; totals are never recomputed from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub kind: LineItemKind,
    pub quantity: i64,
    pub amount: i64,
}

impl LineItem {
    pub fn new(kind: LineItemKind, quantity: i64, amount: i64) -> Self {
        Self {
            kind,
            quantity,
            amount,
        }
    }

    /// Exact sum of the items' amounts.
    pub fn total(items: &[LineItem]) -> DomainResult<i64> {
        items.iter().try_fold(0i64, |acc, item| {
            acc.checked_add(item.amount)
                .ok_or_else(|| DomainError::invariant("line item total overflow"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn currency_requires_iso_shape() {
        assert!(Currency::new("USD").is_ok());
        assert!(Currency::new("usd").is_err());
        assert!(Currency::new("EURO").is_err());
    }

    #[test]
    fn currency_deserialization_validates() {
        let ok: Currency = serde_json::from_str("\"EUR\"").unwrap();
        assert_eq!(ok.as_str(), "EUR");
        assert!(serde_json::from_str::<Currency>("\"eu\"").is_err());
    }

    #[test]
    fn total_ignores_quantity() {
        let items = vec![
            LineItem::new(LineItemKind::Usage, 3, 999),
            LineItem::new(LineItemKind::Adjustment, 1, -100),
        ];
        assert_eq!(LineItem::total(&items).unwrap(), 899);
    }

    #[test]
    fn total_overflow_is_reported() {
        let items = vec![
            LineItem::new(LineItemKind::Fee, 1, i64::MAX),
            LineItem::new(LineItemKind::Fee, 1, 1),
        ];
        assert!(matches!(
            LineItem::total(&items),
            Err(DomainError::InvariantViolation(_))
        ));
    }

    proptest! {
        /// Property: the total equals the plain integer sum of amounts.
        #[test]
        fn total_is_exact_sum(amounts in prop::collection::vec(-1_000_000i64..1_000_000i64, 0..20)) {
            let items: Vec<LineItem> = amounts
                .iter()
                .map(|a| LineItem::new(LineItemKind::Usage, 1, *a))
                .collect();
            prop_assert_eq!(LineItem::total(&items).unwrap(), amounts.iter().sum::<i64>());
        }
    }
}
