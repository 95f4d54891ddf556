//! Order model and status state machine

use serde::{Deserialize, Serialize};

mod totals;
pub use totals::recalculate_totals;

/// Originating channel of an order
///
/// Sequence numbers are only unique per channel per day, so two orders
/// from different channels may legitimately carry the same number.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Channel {
    /// Internal point-of-sale terminal
    Pos,
    /// Kitchen-originated (e.g. re-fire)
    Kitchen,
    /// Delivery aggregator A
    AggregatorA,
    /// Delivery aggregator B
    AggregatorB,
    /// Direct online ordering
    Online,
}

/// Order lifecycle status
///
/// Transition graph:
///
/// ```text
/// PENDING → CONFIRMED → PREPARING → READY → COMPLETED
///    │          │           │
///    └──────────┴───────────┴──→ CANCELLED
/// ```
///
/// `READY → CANCELLED` is disallowed: once the kitchen has finished,
/// only completion is valid. `COMPLETED` and `CANCELLED` are terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    #[default]
    Pending,
    Confirmed,
    Preparing,
    Ready,
    Completed,
    Cancelled,
}

impl OrderStatus {
    /// Terminal statuses admit no further transition
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Position along the forward path, for monotonicity checks
    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Confirmed => 1,
            Self::Preparing => 2,
            Self::Ready => 3,
            Self::Completed => 4,
            Self::Cancelled => 5,
        }
    }

    /// Whether `self → to` is a legal transition
    ///
    /// Forward jumps are legal (a straggling transport may never have
    /// seen the intermediate status). Backward moves are not, and
    /// cancellation is only reachable before the order is READY.
    pub fn can_transition(self, to: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        if to == Self::Cancelled {
            return matches!(self, Self::Pending | Self::Confirmed | Self::Preparing);
        }
        to.rank() > self.rank()
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Confirmed => "CONFIRMED",
            Self::Preparing => "PREPARING",
            Self::Ready => "READY",
            Self::Completed => "COMPLETED",
            Self::Cancelled => "CANCELLED",
        };
        write!(f, "{s}")
    }
}

/// Per-line status, a subset of the order lifecycle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LineStatus {
    #[default]
    Pending,
    Preparing,
    /// Terminal: the line no longer represents outstanding kitchen work
    Fulfilled,
}

/// Order line item
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderLine {
    pub name: String,
    /// Never negative; reduced to zero (and kept) rather than deleted
    pub quantity: i32,
    pub status: LineStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub modifiers: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub special_instructions: Option<String>,
    /// Price in currency unit
    pub unit_price: f64,
    /// Line total (unit_price * quantity, recomputed after adjustments)
    pub line_total: f64,
}

impl OrderLine {
    pub fn new(name: impl Into<String>, quantity: i32, unit_price: f64) -> Self {
        let quantity = quantity.max(0);
        Self {
            name: name.into(),
            quantity,
            status: LineStatus::Pending,
            modifiers: Vec::new(),
            special_instructions: None,
            unit_price,
            line_total: unit_price * quantity as f64,
        }
    }
}

/// Order entity — the central record every device converges on
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Order {
    /// Globally-unique id
    pub id: String,
    /// Human-facing sequence number, unique per tenant per day only
    pub order_number: String,
    pub channel: Channel,
    pub status: OrderStatus,
    pub items: Vec<OrderLine>,
    /// Table/seat reference, dine-in only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    /// Order total in currency unit
    pub total: f64,
    /// Creation timestamp (epoch millis)
    pub created_at: i64,
    /// Last-modified timestamp (epoch millis)
    pub updated_at: i64,
}

impl Order {
    pub fn new(
        id: impl Into<String>,
        order_number: impl Into<String>,
        channel: Channel,
        items: Vec<OrderLine>,
    ) -> Self {
        let now = crate::util::now_millis();
        let mut order = Self {
            id: id.into(),
            order_number: order_number.into(),
            channel,
            status: OrderStatus::Pending,
            items,
            table: None,
            total: 0.0,
            created_at: now,
            updated_at: now,
        };
        recalculate_totals(&mut order);
        order
    }

    /// Whether this order still needs to show on active queues
    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Normalized kitchen projection, sent alongside `order_created`
    pub fn kitchen_ticket(&self) -> KitchenTicket {
        KitchenTicket {
            order_id: self.id.clone(),
            order_number: self.order_number.clone(),
            table: self.table.clone(),
            lines: self
                .items
                .iter()
                .map(|l| TicketLine {
                    name: l.name.clone(),
                    quantity: l.quantity,
                    special_instructions: l.special_instructions.clone(),
                })
                .collect(),
        }
    }
}

/// Kitchen ticket — what the bump screen actually needs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KitchenTicket {
    pub order_id: String,
    pub order_number: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    pub lines: Vec<TicketLine>,
}

/// One line of a kitchen ticket
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TicketLine {
    pub name: String,
    pub quantity: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub special_instructions: Option<String>,
}
