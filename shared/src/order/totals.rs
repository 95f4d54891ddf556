//! Order total recomputation with precise decimal arithmetic
//!
//! Float accumulation drifts over repeated adjustments, so line totals
//! and the order total are recomputed through `rust_decimal` and only
//! converted back to f64 at the edges.

use rust_decimal::prelude::*;

use super::Order;

/// Recalculate line totals and the order total from line quantities.
///
/// Must be called after every quantity adjustment (item withdrawal,
/// merge of a fresher record with different lines).
pub fn recalculate_totals(order: &mut Order) {
    let mut total = Decimal::ZERO;

    for line in &mut order.items {
        let unit = Decimal::from_f64(line.unit_price).unwrap_or(Decimal::ZERO);
        let line_total = (unit * Decimal::from(line.quantity.max(0))).round_dp(2);
        line.line_total = line_total.to_f64().unwrap_or(0.0);
        total += line_total;
    }

    order.total = total.round_dp(2).to_f64().unwrap_or(0.0);
}

#[cfg(test)]
mod tests {
    use crate::order::{Channel, Order, OrderLine};

    #[test]
    fn test_totals_follow_quantity() {
        let mut order = Order::new(
            "o-1",
            "7",
            Channel::Online,
            vec![
                OrderLine::new("Dosa", 3, 4.5),
                OrderLine::new("Chai", 2, 1.25),
            ],
        );
        assert_eq!(order.total, 16.0);

        order.items[0].quantity = 1;
        super::recalculate_totals(&mut order);
        assert_eq!(order.items[0].line_total, 4.5);
        assert_eq!(order.total, 7.0);
    }

    #[test]
    fn test_zero_quantity_line_contributes_nothing() {
        let mut order = Order::new(
            "o-2",
            "8",
            Channel::Pos,
            vec![OrderLine::new("Idli", 0, 3.0)],
        );
        super::recalculate_totals(&mut order);
        assert_eq!(order.total, 0.0);
    }
}
