use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Customer,
    Driver,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Customer => "customer",
            Role::Driver => "driver",
            Role::Admin => "admin",
        }
    }
}

/// A user of the system. Customers, drivers and admins share one username
/// namespace and are told apart only by their role.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Identity {
    pub role: Role,
    pub username: String,
}

impl Identity {
    pub fn customer(username: impl Into<String>) -> Self {
        Self {
            role: Role::Customer,
            username: username.into(),
        }
    }

    pub fn driver(username: impl Into<String>) -> Self {
        Self {
            role: Role::Driver,
            username: username.into(),
        }
    }

    pub fn admin(username: impl Into<String>) -> Self {
        Self {
            role: Role::Admin,
            username: username.into(),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.role.as_str(), self.username)
    }
}
