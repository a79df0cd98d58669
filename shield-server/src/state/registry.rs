use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{ShieldError, ShieldResult};
use crate::geo::Coordinates;

/// Last known state for one participant.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantRecord {
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub alerting: bool,
    pub emergency_email: Option<String>,
    pub emergency_phone: Option<String>,
    pub location_updated_at: Option<DateTime<Utc>>,
    pub alert_raised_at: Option<DateTime<Utc>>,
}

impl ParticipantRecord {
    /// Both coordinates on file.
    pub fn coordinates(&self) -> Option<Coordinates> {
        match (self.lat, self.lon) {
            (Some(lat), Some(lon)) => Some(Coordinates::new(lat, lon)),
            _ => None,
        }
    }

    pub fn is_locatable(&self) -> bool {
        self.coordinates().is_some()
    }
}

/// Entry returned by proximity queries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NearbyParticipant {
    #[serde(rename = "username")]
    pub identity: String,
    pub lat: f64,
    pub lon: f64,
    #[serde(rename = "sosActive")]
    pub alerting: bool,
    #[serde(skip)]
    pub distance_km: f64,
}

/// Identity -> last location and emergency contact.
/// Records live for the whole process; nothing is persisted.
pub struct Registry {
    records: HashMap<String, ParticipantRecord>,
}

/// Blank values are missing. Non-blank values are kept exactly as sent.
fn require<'a>(value: &'a str, field: &str) -> ShieldResult<&'a str> {
    if value.trim().is_empty() {
        return Err(ShieldError::Validation(format!("Missing field: {}", field)));
    }
    Ok(value)
}

impl Registry {
    pub fn new() -> Self {
        Self {
            records: HashMap::new(),
        }
    }

    /// Create or update emergency contact details.
    pub fn register(&mut self, identity: &str, email: &str, phone: &str) -> ShieldResult<()> {
        let identity = require(identity, "username")?;
        let email = require(email, "emergencyEmail")?;
        let phone = require(phone, "emergencyNumber")?;

        let rec = self.records.entry(identity.to_string()).or_default();
        rec.emergency_email = Some(email.to_string());
        rec.emergency_phone = Some(phone.to_string());
        Ok(())
    }

    /// Overwrite coordinates, creating the record if needed. `alerting` is untouched.
    pub fn update_location(&mut self, identity: &str, lat: Option<f64>, lon: Option<f64>) -> ShieldResult<()> {
        let identity = require(identity, "username")?;
        let (Some(lat), Some(lon)) = (lat, lon) else {
            return Err(ShieldError::Validation("Missing fields: lat and lon are required".to_string()));
        };
        if !lat.is_finite() || !lon.is_finite() {
            return Err(ShieldError::Validation("Coordinates must be finite numbers".to_string()));
        }

        let rec = self.records.entry(identity.to_string()).or_default();
        rec.lat = Some(lat);
        rec.lon = Some(lon);
        rec.location_updated_at = Some(Utc::now());
        Ok(())
    }

    pub fn get(&self, identity: &str) -> ShieldResult<&ParticipantRecord> {
        self.records
            .get(identity)
            .ok_or_else(|| ShieldError::NotFound(format!("Unknown user: {}", identity)))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Every record with both coordinates present.
    pub fn list_locatable(&self) -> impl Iterator<Item = (&String, &ParticipantRecord, Coordinates)> {
        self.records
            .iter()
            .filter_map(|(id, rec)| rec.coordinates().map(|c| (id, rec, c)))
    }

    /// Locatable participants within `radius_km` of `origin`, excluding `exclude`.
    /// Linear scan; swap for a spatial index here if registries grow.
    pub fn nearby(&self, origin: &Coordinates, radius_km: f64, exclude: &str) -> Vec<NearbyParticipant> {
        let mut out: Vec<NearbyParticipant> = self
            .list_locatable()
            .filter(|(id, _, _)| id.as_str() != exclude)
            .filter_map(|(id, rec, coords)| {
                let d = origin.distance_km(&coords);
                (d <= radius_km).then(|| NearbyParticipant {
                    identity: id.clone(),
                    lat: coords.lat,
                    lon: coords.lon,
                    alerting: rec.alerting,
                    distance_km: d,
                })
            })
            .collect();
        out.sort_by(|a, b| a.distance_km.total_cmp(&b.distance_km));
        out
    }

    /// Idle -> Active. Returns the record as it stands after the change.
    pub fn raise_alert(&mut self, identity: &str) -> ShieldResult<&ParticipantRecord> {
        let rec = self.records.get_mut(identity).ok_or_else(|| {
            ShieldError::Precondition(format!("User location data missing to trigger SOS: {}", identity))
        })?;
        if !rec.is_locatable() {
            return Err(ShieldError::Precondition(format!(
                "User location data missing to trigger SOS: {}",
                identity
            )));
        }
        rec.alerting = true;
        rec.alert_raised_at = Some(Utc::now());
        Ok(rec)
    }

    /// Active -> Idle. Returns whether an alert was actually cleared.
    pub fn resolve(&mut self, identity: &str) -> ShieldResult<bool> {
        let rec = self
            .records
            .get_mut(identity)
            .ok_or_else(|| ShieldError::NotFound(format!("Unknown user: {}", identity)))?;
        let was_alerting = rec.alerting;
        rec.alerting = false;
        rec.alert_raised_at = None;
        Ok(was_alerting)
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}

#[cfg(test)]
impl Registry {
    pub fn contains(&self, identity: &str) -> bool {
        self.records.contains_key(identity)
    }
}
