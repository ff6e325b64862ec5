use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::order::OrderStatus;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Availability {
    Offline,
    Available,
    OnDelivery,
}

impl Availability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Availability::Offline => "OFFLINE",
            Availability::Available => "AVAILABLE",
            Availability::OnDelivery => "ON_DELIVERY",
        }
    }
}

impl FromStr for Availability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OFFLINE" => Ok(Availability::Offline),
            "AVAILABLE" => Ok(Availability::Available),
            "ON_DELIVERY" => Ok(Availability::OnDelivery),
            other => Err(format!("unknown availability: {other}")),
        }
    }
}

impl fmt::Display for Availability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountStatus {
    Active,
    Suspended,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "ACTIVE",
            AccountStatus::Suspended => "SUSPENDED",
        }
    }
}

impl FromStr for AccountStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(AccountStatus::Active),
            "SUSPENDED" => Ok(AccountStatus::Suspended),
            other => Err(format!("unknown account status: {other}")),
        }
    }
}

impl fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

sql_text_enum!(Availability);
sql_text_enum!(AccountStatus);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverProfile {
    pub username: String,
    pub vehicle_type: String,
    pub license_number: String,
    pub service_area: String,
    pub availability: Availability,
    pub completed_deliveries: i64,
    /// Mean of all customer ratings, `None` until the first rating arrives.
    pub rating: Option<f64>,
    pub account_status: AccountStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDriver {
    pub username: String,
    pub vehicle_type: String,
    pub license_number: String,
    pub service_area: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryHistoryEntry {
    pub id: i64,
    pub driver: String,
    pub order_id: i64,
    pub picked_up_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub status: OrderStatus,
    pub rating: Option<u8>,
    pub feedback: Option<String>,
    pub earnings: f64,
    pub recorded_at: DateTime<Utc>,
}
