pub mod payload;
pub mod record;

pub use payload::*;
pub use record::*;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::date_util::day_stamp;
use crate::error::Error;

/// Client-authored operational record types. Each has its own local table and
/// its own FIFO lane in the sync queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionalKind {
    FuelDotation,
    StockExit,
    TransportBon,
    RentalBon,
    Breakdown,
}

impl TransactionalKind {
    pub const ALL: [TransactionalKind; 5] = [
        TransactionalKind::FuelDotation,
        TransactionalKind::StockExit,
        TransactionalKind::TransportBon,
        TransactionalKind::RentalBon,
        TransactionalKind::Breakdown,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TransactionalKind::FuelDotation => "fuel_dotation",
            TransactionalKind::StockExit => "stock_exit",
            TransactionalKind::TransportBon => "transport_bon",
            TransactionalKind::RentalBon => "rental_bon",
            TransactionalKind::Breakdown => "breakdown",
        }
    }

    /// Local cache table for this kind.
    pub fn table(self) -> &'static str {
        match self {
            TransactionalKind::FuelDotation => "transactional_fuel_dotation",
            TransactionalKind::StockExit => "transactional_stock_exit",
            TransactionalKind::TransportBon => "transactional_transport_bon",
            TransactionalKind::RentalBon => "transactional_rental_bon",
            TransactionalKind::Breakdown => "transactional_breakdown",
        }
    }

    /// REST collection name on the server.
    pub fn resource(self) -> &'static str {
        match self {
            TransactionalKind::FuelDotation => "fuel-dotations",
            TransactionalKind::StockExit => "stock-exits",
            TransactionalKind::TransportBon => "transport-bons",
            TransactionalKind::RentalBon => "rental-bons",
            TransactionalKind::Breakdown => "breakdowns",
        }
    }

    /// Prefix of the human-readable bon number, for kinds that display one.
    pub fn reference_prefix(self) -> Option<&'static str> {
        match self {
            TransactionalKind::FuelDotation => Some("DOT"),
            TransactionalKind::StockExit => Some("BS"),
            TransactionalKind::TransportBon => Some("BT"),
            TransactionalKind::RentalBon => Some("BL"),
            TransactionalKind::Breakdown => None,
        }
    }

    /// Placeholder bon number shown until the server assigns the real one,
    /// e.g. `DOT-TMP-20250402-17`.
    pub fn temporary_reference(self, created_at: DateTime<Utc>, local_id: i64) -> Option<String> {
        self.reference_prefix()
            .map(|prefix| format!("{prefix}-TMP-{}-{local_id}", day_stamp(created_at)))
    }
}

impl fmt::Display for TransactionalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionalKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        TransactionalKind::ALL
            .into_iter()
            .find(|k| k.as_str() == normalized || k.resource().replace('-', "_") == normalized)
            .ok_or_else(|| Error::UnknownKind(s.to_string()))
    }
}

/// Read-mostly lookup entities mirrored from the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceKind {
    Vehicle,
    Driver,
    Client,
    Supplier,
    Tank,
    Part,
}

impl ReferenceKind {
    pub const ALL: [ReferenceKind; 6] = [
        ReferenceKind::Vehicle,
        ReferenceKind::Driver,
        ReferenceKind::Client,
        ReferenceKind::Supplier,
        ReferenceKind::Tank,
        ReferenceKind::Part,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ReferenceKind::Vehicle => "vehicle",
            ReferenceKind::Driver => "driver",
            ReferenceKind::Client => "client",
            ReferenceKind::Supplier => "supplier",
            ReferenceKind::Tank => "tank",
            ReferenceKind::Part => "part",
        }
    }

    pub fn table(self) -> &'static str {
        match self {
            ReferenceKind::Vehicle => "reference_vehicle",
            ReferenceKind::Driver => "reference_driver",
            ReferenceKind::Client => "reference_client",
            ReferenceKind::Supplier => "reference_supplier",
            ReferenceKind::Tank => "reference_tank",
            ReferenceKind::Part => "reference_part",
        }
    }

    pub fn resource(self) -> &'static str {
        match self {
            ReferenceKind::Vehicle => "vehicles",
            ReferenceKind::Driver => "drivers",
            ReferenceKind::Client => "clients",
            ReferenceKind::Supplier => "suppliers",
            ReferenceKind::Tank => "tanks",
            ReferenceKind::Part => "parts",
        }
    }

    /// `sync_meta` key holding the last successful refresh time.
    pub fn meta_key(self) -> String {
        format!("lastSync_{}", self.as_str())
    }
}

impl fmt::Display for ReferenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReferenceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase();
        ReferenceKind::ALL
            .into_iter()
            .find(|k| k.as_str() == normalized || k.resource() == normalized)
            .ok_or_else(|| Error::UnknownKind(s.to_string()))
    }
}

/// What a queue item asks the server to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueAction {
    Create,
    Update,
    Delete,
}

impl QueueAction {
    pub fn as_str(self) -> &'static str {
        match self {
            QueueAction::Create => "create",
            QueueAction::Update => "update",
            QueueAction::Delete => "delete",
        }
    }
}

impl FromStr for QueueAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(QueueAction::Create),
            "update" => Ok(QueueAction::Update),
            "delete" => Ok(QueueAction::Delete),
            other => Err(Error::Other(format!("unknown queue action: {other}"))),
        }
    }
}
