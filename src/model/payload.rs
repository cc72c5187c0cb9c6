use chrono::{DateTime, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::TransactionalKind;

// Foreign keys below hold server identifiers of reference records. They are
// not checked locally: the referenced row may not be cached yet.

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FuelDotation {
    pub truck_id: String,
    pub driver_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tank_id: Option<String>,
    pub liters: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mileage_km: Option<u32>,
    pub dotation_date: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    /// Server-computed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_cost: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockExit {
    pub part_id: String,
    pub quantity: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub truck_id: Option<String>,
    pub exit_date: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Server-computed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_cost: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportBon {
    pub truck_id: String,
    pub driver_id: String,
    pub client_id: String,
    pub origin: String,
    pub destination: String,
    pub departure_date: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cargo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RentalBon {
    pub truck_id: String,
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_id: Option<String>,
    pub start_date: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daily_rate: Option<f64>,
    /// Server-computed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_amount: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Breakdown {
    pub truck_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_id: Option<String>,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    pub reported_at: DateTime<Utc>,
}

/// Snapshot carried by a queue item, tagged by entity kind so replay
/// dispatch is a total match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum RecordPayload {
    FuelDotation(FuelDotation),
    StockExit(StockExit),
    TransportBon(TransportBon),
    RentalBon(RentalBon),
    Breakdown(Breakdown),
}

impl RecordPayload {
    pub fn kind(&self) -> TransactionalKind {
        match self {
            RecordPayload::FuelDotation(_) => TransactionalKind::FuelDotation,
            RecordPayload::StockExit(_) => TransactionalKind::StockExit,
            RecordPayload::TransportBon(_) => TransactionalKind::TransportBon,
            RecordPayload::RentalBon(_) => TransactionalKind::RentalBon,
            RecordPayload::Breakdown(_) => TransactionalKind::Breakdown,
        }
    }

    /// The untagged body, as sent to and received from the server.
    pub fn body(&self) -> serde_json::Result<serde_json::Value> {
        match self {
            RecordPayload::FuelDotation(v) => serde_json::to_value(v),
            RecordPayload::StockExit(v) => serde_json::to_value(v),
            RecordPayload::TransportBon(v) => serde_json::to_value(v),
            RecordPayload::RentalBon(v) => serde_json::to_value(v),
            RecordPayload::Breakdown(v) => serde_json::to_value(v),
        }
    }

    /// Decode an untagged body for a known kind. Unknown fields are ignored.
    pub fn from_body(kind: TransactionalKind, body: serde_json::Value) -> serde_json::Result<Self> {
        Ok(match kind {
            TransactionalKind::FuelDotation => RecordPayload::FuelDotation(serde_json::from_value(body)?),
            TransactionalKind::StockExit => RecordPayload::StockExit(serde_json::from_value(body)?),
            TransactionalKind::TransportBon => RecordPayload::TransportBon(serde_json::from_value(body)?),
            TransactionalKind::RentalBon => RecordPayload::RentalBon(serde_json::from_value(body)?),
            TransactionalKind::Breakdown => RecordPayload::Breakdown(serde_json::from_value(body)?),
        })
    }
}

/// Binds a payload type to its kind so façades can be typed per entity.
pub trait TransactionalEntity:
    Serialize + DeserializeOwned + Clone + Send + Sync + 'static
{
    const KIND: TransactionalKind;

    fn into_payload(self) -> RecordPayload;

    fn from_payload(payload: RecordPayload) -> Option<Self>;
}

macro_rules! transactional_entity {
    ($ty:ident) => {
        impl TransactionalEntity for $ty {
            const KIND: TransactionalKind = TransactionalKind::$ty;

            fn into_payload(self) -> RecordPayload {
                RecordPayload::$ty(self)
            }

            fn from_payload(payload: RecordPayload) -> Option<Self> {
                match payload {
                    RecordPayload::$ty(v) => Some(v),
                    _ => None,
                }
            }
        }
    };
}

transactional_entity!(FuelDotation);
transactional_entity!(StockExit);
transactional_entity!(TransportBon);
transactional_entity!(RentalBon);
transactional_entity!(Breakdown);

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn dotation(truck: &str, liters: f64) -> FuelDotation {
        FuelDotation {
            truck_id: truck.to_string(),
            driver_id: "drv-1".to_string(),
            tank_id: Some("tank-1".to_string()),
            liters,
            mileage_km: Some(120_400),
            dotation_date: NaiveDate::from_ymd_opt(2025, 4, 2).unwrap(),
            notes: None,
            total_cost: None,
        }
    }

    pub fn breakdown(truck: &str) -> Breakdown {
        Breakdown {
            truck_id: truck.to_string(),
            driver_id: None,
            description: "Coolant leak".to_string(),
            location: Some("RN5 km 42".to_string()),
            reported_at: "2025-04-02T08:30:00Z".parse().unwrap(),
        }
    }

    pub fn transport_bon(truck: &str) -> TransportBon {
        TransportBon {
            truck_id: truck.to_string(),
            driver_id: "drv-2".to_string(),
            client_id: "cli-9".to_string(),
            origin: "Oran".to_string(),
            destination: "Algiers".to_string(),
            departure_date: NaiveDate::from_ymd_opt(2025, 4, 3).unwrap(),
            cargo: Some("Cement".to_string()),
            amount: None,
        }
    }
}
