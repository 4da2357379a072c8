//! Array payload expansion.
//!
//! Clients submit several queries compressed into parallel arrays. This module
//! is the only place that shape exists: [`expand`] validates it and turns it
//! into a sequence of [`PartialQuery`] units.

use serde::{Deserialize, Serialize};

use super::registry::QueryTypeRegistry;
use super::unit::{PartialQuery, TargetId};
use crate::error::{BatchError, Result};

/// Raw submission with optional parallel arrays.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialQueryPayload {
    #[serde(default)]
    pub target_ids: Option<Vec<String>>,

    #[serde(default)]
    pub type_ids: Option<Vec<String>>,

    /// Signed on the wire so that negative values can be reported.
    #[serde(default)]
    pub quantities: Option<Vec<i64>>,
}

impl PartialQueryPayload {
    /// Parses a payload from a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| BatchError::invalid_payload(e.to_string()))
    }

    /// Returns the shared length of the present arrays.
    ///
    /// All arrays absent is a legal empty batch.
    pub fn unit_count(&self) -> Result<usize> {
        let mut lengths = Vec::with_capacity(3);
        if let Some(v) = &self.target_ids {
            lengths.push(("targetIds", v.len()));
        }
        if let Some(v) = &self.type_ids {
            lengths.push(("typeIds", v.len()));
        }
        if let Some(v) = &self.quantities {
            lengths.push(("quantities", v.len()));
        }

        match lengths.first() {
            None => Ok(0),
            Some(&(_, n)) if lengths.iter().all(|&(_, len)| len == n) => Ok(n),
            Some(_) => Err(BatchError::ShapeMismatch { lengths }),
        }
    }
}

/// Values substituted for absent arrays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpansionDefaults {
    #[serde(default = "default_target_id")]
    pub target_id: String,

    #[serde(default = "default_type_id")]
    pub type_id: String,

    #[serde(default = "default_quantity")]
    pub quantity: u64,
}

fn default_target_id() -> String {
    "default".to_string()
}

fn default_type_id() -> String {
    "balance_check".to_string()
}

fn default_quantity() -> u64 {
    1
}

impl Default for ExpansionDefaults {
    fn default() -> Self {
        Self {
            target_id: default_target_id(),
            type_id: default_type_id(),
            quantity: default_quantity(),
        }
    }
}

/// Expands a payload into query units in index order.
///
/// Fails on the first invalid element; nothing is dispatched for a payload
/// that does not fully validate.
pub fn expand(
    payload: &PartialQueryPayload,
    registry: &QueryTypeRegistry,
    defaults: &ExpansionDefaults,
) -> Result<Vec<PartialQuery>> {
    let n = payload.unit_count()?;
    let mut units = Vec::with_capacity(n);

    for index in 0..n {
        let target = payload
            .target_ids
            .as_ref()
            .map_or(defaults.target_id.as_str(), |v| v[index].as_str());
        if target.trim().is_empty() {
            return Err(BatchError::InvalidTargetId { index });
        }

        let type_id = payload
            .type_ids
            .as_ref()
            .map_or(defaults.type_id.as_str(), |v| v[index].as_str());
        let query_type = registry
            .lookup(type_id)
            .ok_or_else(|| BatchError::UnknownQueryType {
                index,
                type_id: type_id.to_string(),
            })?;

        let quantity = match &payload.quantities {
            Some(v) => {
                let raw = v[index];
                u64::try_from(raw).map_err(|_| BatchError::InvalidQuantity {
                    index,
                    quantity: raw,
                })?
            }
            None => defaults.quantity,
        };

        units.push(PartialQuery::new(
            index,
            TargetId::new(target),
            query_type,
            quantity,
        ));
    }

    Ok(units)
}
