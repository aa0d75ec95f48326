use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::claims::Claims;

/// The closed set of recognized user roles.
///
/// Stored and displayed as the capitalized canonical name regardless of which
/// casing or spelling variant the backend used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoleKind {
    Admin,
    Customer,
    Cashier,
}

impl RoleKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RoleKind::Admin => "Admin",
            RoleKind::Customer => "Customer",
            RoleKind::Cashier => "Cashier",
        }
    }

    /// Parse a role string as stored or as emitted by the backend. Accepts
    /// case-insensitive canonical names plus the backend's historical aliases
    /// (`ROLE_ADMIN`, `casher`, ...). Unknown strings are `None`, never a
    /// silent default.
    pub fn from_stored(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "admin" | "role_admin" => Some(RoleKind::Admin),
            "customer" | "role_customer" => Some(RoleKind::Customer),
            "cashier" | "casher" | "role_cashier" | "role_casher" => Some(RoleKind::Cashier),
            _ => None,
        }
    }
}

impl fmt::Display for RoleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mapping from the backend's numeric role ids onto [`RoleKind`].
///
/// Deployments have disagreed on which id means Admin, so the table is
/// injected rather than hard-coded; the default is `1=Admin, 2=Customer,
/// 3=Cashier`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleIdTable {
    admin: i64,
    customer: i64,
    cashier: i64,
}

impl Default for RoleIdTable {
    fn default() -> Self {
        Self {
            admin: 1,
            customer: 2,
            cashier: 3,
        }
    }
}

impl RoleIdTable {
    pub fn new(admin: i64, customer: i64, cashier: i64) -> Self {
        Self {
            admin,
            customer,
            cashier,
        }
    }

    pub fn resolve(&self, id: i64) -> Option<RoleKind> {
        if id == self.admin {
            Some(RoleKind::Admin)
        } else if id == self.customer {
            Some(RoleKind::Customer)
        } else if id == self.cashier {
            Some(RoleKind::Cashier)
        } else {
            None
        }
    }
}

/// Resolve the session role from decoded claims.
///
/// Fallback order, each branch tried only when the previous field is absent:
/// 1. `role` as a string, matched against the alias table. An unrecognized
///    string resolves to `None` rather than a default.
/// 2. `roles`: an explicit null means Customer; otherwise the first element,
///    numeric ids going through `table` and strings through the alias match.
///    Empty arrays and unrecognized entries fold to Customer.
/// 3. Neither field present: Customer.
///
/// Ambiguity defaults to Customer by design; this path never produces Admin
/// unless the backend named it outright.
pub fn resolve_role(claims: &Claims, table: &RoleIdTable) -> Option<RoleKind> {
    if let Some(raw) = claims.get("role").and_then(Value::as_str) {
        return RoleKind::from_stored(raw);
    }

    match claims.get("roles") {
        Some(Value::Null) => Some(RoleKind::Customer),
        Some(Value::Array(items)) => Some(match items.first() {
            Some(Value::Number(id)) => id
                .as_i64()
                .and_then(|id| table.resolve(id))
                .unwrap_or(RoleKind::Customer),
            Some(Value::String(name)) => {
                RoleKind::from_stored(name).unwrap_or(RoleKind::Customer)
            }
            _ => RoleKind::Customer,
        }),
        Some(_) => Some(RoleKind::Customer),
        None => Some(RoleKind::Customer),
    }
}
