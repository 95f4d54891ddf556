//! Per-screen order views
//!
//! Each display surface (kitchen queue, table map, aggregator panel,
//! online panel) holds a filtered projection of the canonical order set.
//! Views are refreshed on every merge; an order that goes terminal is
//! removed from every view that held it.

use dashmap::DashMap;
use shared::order::{Channel, Order};

/// A named, filtered projection of the canonical order set
pub trait ChannelView: Send + Sync {
    fn name(&self) -> &str;
    /// Whether this view wants the order at all (ignoring liveness)
    fn interested(&self, order: &Order) -> bool;
    fn upsert(&self, order: &Order);
    fn remove(&self, order_id: &str);
}

type Filter = Box<dyn Fn(&Order) -> bool + Send + Sync>;

/// Predicate-driven view backed by a concurrent map
pub struct QueueView {
    name: String,
    filter: Filter,
    orders: DashMap<String, Order>,
}

impl QueueView {
    pub fn new(name: impl Into<String>, filter: Filter) -> Self {
        Self {
            name: name.into(),
            filter,
            orders: DashMap::new(),
        }
    }

    /// Kitchen queue: every active order needs prep
    pub fn kitchen() -> Self {
        Self::new("kitchen", Box::new(|_| true))
    }

    /// Table map: dine-in orders only
    pub fn tables() -> Self {
        Self::new("tables", Box::new(|o: &Order| o.table.is_some()))
    }

    /// Aggregator panel: third-party delivery channels
    pub fn aggregators() -> Self {
        Self::new(
            "aggregators",
            Box::new(|o: &Order| {
                matches!(o.channel, Channel::AggregatorA | Channel::AggregatorB)
            }),
        )
    }

    /// Online panel: direct web orders
    pub fn online() -> Self {
        Self::new("online", Box::new(|o: &Order| o.channel == Channel::Online))
    }

    pub fn orders(&self) -> Vec<Order> {
        self.orders.iter().map(|e| e.value().clone()).collect()
    }

    pub fn get(&self, order_id: &str) -> Option<Order> {
        self.orders.get(order_id).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    pub fn contains(&self, order_id: &str) -> bool {
        self.orders.contains_key(order_id)
    }
}

impl ChannelView for QueueView {
    fn name(&self) -> &str {
        &self.name
    }

    fn interested(&self, order: &Order) -> bool {
        (self.filter)(order)
    }

    fn upsert(&self, order: &Order) {
        self.orders.insert(order.id.clone(), order.clone());
    }

    fn remove(&self, order_id: &str) {
        self.orders.remove(order_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::order::OrderLine;

    fn order_on(channel: Channel) -> Order {
        Order::new("o-1", "7", channel, vec![OrderLine::new("Idli", 2, 3.0)])
    }

    #[test]
    fn test_view_predicates() {
        let kitchen = QueueView::kitchen();
        let tables = QueueView::tables();
        let aggregators = QueueView::aggregators();
        let online = QueueView::online();

        let pos = order_on(Channel::Pos);
        assert!(kitchen.interested(&pos));
        assert!(!tables.interested(&pos));
        assert!(!aggregators.interested(&pos));
        assert!(!online.interested(&pos));

        let mut dine_in = order_on(Channel::Pos);
        dine_in.table = Some("T2".to_string());
        assert!(tables.interested(&dine_in));

        assert!(aggregators.interested(&order_on(Channel::AggregatorB)));
        assert!(online.interested(&order_on(Channel::Online)));
    }

    #[test]
    fn test_upsert_and_remove() {
        let view = QueueView::kitchen();
        let order = order_on(Channel::Pos);

        view.upsert(&order);
        assert!(view.contains("o-1"));
        assert_eq!(view.len(), 1);

        view.remove("o-1");
        assert!(view.is_empty());
    }
}
