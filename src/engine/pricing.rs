use crate::geo::estimate_travel_minutes;
use crate::models::order::GeoPoint;

const SMALL_ORDER_LIMIT: f64 = 20.0;
const MEDIUM_ORDER_LIMIT: f64 = 50.0;

const SMALL_ORDER_MINUTES: i64 = 20;
const MEDIUM_ORDER_MINUTES: i64 = 30;
const LARGE_ORDER_MINUTES: i64 = 40;

/// Flat travel allowance when restaurant or delivery coordinates are unusable.
const FALLBACK_TRAVEL_MINUTES: i64 = 15;

const DRIVER_PAYOUT_SHARE: f64 = 0.30;

/// Preparation time tier, driven by the order total.
pub fn base_minutes(total: f64) -> i64 {
    if total <= SMALL_ORDER_LIMIT {
        SMALL_ORDER_MINUTES
    } else if total <= MEDIUM_ORDER_LIMIT {
        MEDIUM_ORDER_MINUTES
    } else {
        LARGE_ORDER_MINUTES
    }
}

pub fn travel_minutes(restaurant: Option<&GeoPoint>, delivery: Option<&GeoPoint>) -> i64 {
    match (restaurant, delivery) {
        (Some(from), Some(to)) if usable(from) && usable(to) => estimate_travel_minutes(from, to),
        _ => FALLBACK_TRAVEL_MINUTES,
    }
}

pub fn estimated_minutes(
    total: f64,
    restaurant: Option<&GeoPoint>,
    delivery: Option<&GeoPoint>,
) -> i64 {
    base_minutes(total) + travel_minutes(restaurant, delivery)
}

pub fn driver_payout(order_total: f64) -> f64 {
    round_currency(order_total * DRIVER_PAYOUT_SHARE)
}

pub fn round_currency(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}

fn usable(point: &GeoPoint) -> bool {
    point.is_valid() && !point.is_unset()
}
