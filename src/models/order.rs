use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    /// A zero/zero pair means the coordinates were never filled in.
    pub fn is_unset(&self) -> bool {
        self.lat == 0.0 && self.lng == 0.0
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Assigned,
    InProgress,
    Delivered,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Assigned => "ASSIGNED",
            OrderStatus::InProgress => "IN_PROGRESS",
            OrderStatus::Delivered => "DELIVERED",
            OrderStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Delivered | OrderStatus::Cancelled)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, OrderStatus::Assigned | OrderStatus::InProgress)
    }

    /// Legal edges of the order lifecycle. Everything else is rejected.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        matches!(
            (self, next),
            (OrderStatus::Pending, OrderStatus::Assigned)
                | (OrderStatus::Assigned, OrderStatus::InProgress)
                | (OrderStatus::InProgress, OrderStatus::Delivered)
                | (
                    OrderStatus::Pending | OrderStatus::Assigned | OrderStatus::InProgress,
                    OrderStatus::Cancelled
                )
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(OrderStatus::Pending),
            "ASSIGNED" => Ok(OrderStatus::Assigned),
            "IN_PROGRESS" => Ok(OrderStatus::InProgress),
            "DELIVERED" => Ok(OrderStatus::Delivered),
            "CANCELLED" => Ok(OrderStatus::Cancelled),
            other => Err(format!("unknown order status: {other}")),
        }
    }
}

sql_text_enum!(OrderStatus);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: i64,
    pub customer: String,
    pub restaurant_name: String,
    pub restaurant_address: String,
    pub restaurant_location: Option<GeoPoint>,
    pub delivery_address: String,
    pub delivery_location: Option<GeoPoint>,
    pub item_count: u32,
    pub total: f64,
    pub special_instructions: Option<String>,
    pub payment_method: String,
    pub status: OrderStatus,
    pub driver: Option<String>,
    pub created_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub picked_up_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub estimated_minutes: i64,
    pub actual_minutes: Option<i64>,
    pub delivered_notified: bool,
}

/// Caller-supplied fields of a new order. Everything else is assigned by the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewOrder {
    pub customer: String,
    pub restaurant_name: String,
    pub restaurant_address: String,
    pub restaurant_location: Option<GeoPoint>,
    pub delivery_address: String,
    pub delivery_location: Option<GeoPoint>,
    pub item_count: u32,
    pub total: f64,
    #[serde(default)]
    pub special_instructions: Option<String>,
    pub payment_method: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderItem {
    pub id: i64,
    pub order_id: i64,
    pub name: String,
    pub quantity: u32,
    pub unit_price: f64,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewOrderItem {
    pub name: String,
    pub quantity: u32,
    pub unit_price: f64,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderStatusEvent {
    pub id: i64,
    pub order_id: i64,
    pub status: OrderStatus,
    pub note: String,
    pub actor: String,
    pub created_at: DateTime<Utc>,
}

/// A committed status change together with the parties it concerns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderUpdate {
    pub customer: String,
    pub driver: Option<String>,
    pub event: OrderStatusEvent,
}
