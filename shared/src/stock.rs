//! Out-of-stock records
//!
//! An active record means "item X is currently unavailable". Records are
//! created at a kitchen/bump device, persisted locally first, and
//! broadcast to peers whether or not the broadcast succeeds.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How much of the item to withdraw from in-flight orders
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "mode", content = "quantity")]
pub enum Withdraw {
    /// Withdraw a fixed quantity from each matching line
    Quantity(u32),
    /// Withdraw the item entirely (line quantity forced to zero)
    All,
}

/// Which order/table triggered the mark, for staff context
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OriginContext {
    pub order_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
}

/// Out-of-stock marker
///
/// Invariant: at most one *active* record per item name per tenant.
/// Matching against order lines is case-insensitive.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OutOfStockRecord {
    pub id: String,
    pub item_name: String,
    pub withdraw: Withdraw,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<OriginContext>,
    pub active: bool,
    /// Creation timestamp (epoch millis)
    pub created_at: i64,
    /// Staff member who marked the item, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub marked_by: Option<String>,
}

impl OutOfStockRecord {
    pub fn new(
        item_name: impl Into<String>,
        withdraw: Withdraw,
        origin: Option<OriginContext>,
        marked_by: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            item_name: item_name.into(),
            withdraw,
            origin,
            active: true,
            created_at: crate::util::now_millis(),
            marked_by,
        }
    }

    /// Case-insensitive match key
    pub fn match_key(&self) -> String {
        self.item_name.to_lowercase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_withdraw_serde() {
        let q = serde_json::to_value(Withdraw::Quantity(2)).unwrap();
        assert_eq!(q["mode"], "quantity");
        assert_eq!(q["quantity"], 2);

        let all = serde_json::to_value(Withdraw::All).unwrap();
        assert_eq!(all["mode"], "all");
    }

    #[test]
    fn test_match_key_case_insensitive() {
        let record = OutOfStockRecord::new("Pandi Curry", Withdraw::All, None, None);
        assert_eq!(record.match_key(), "pandi curry");
        assert!(record.active);
    }
}
