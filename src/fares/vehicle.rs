use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TripKind {
    Outstation,
    Local,
    Airport,
}

impl TripKind {
    pub const ALL: [TripKind; 3] = [TripKind::Outstation, TripKind::Local, TripKind::Airport];

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "outstation" => Some(Self::Outstation),
            "local" => Some(Self::Local),
            "airport" => Some(Self::Airport),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Outstation => "outstation",
            Self::Local => "local",
            Self::Airport => "airport",
        }
    }
}

impl fmt::Display for TripKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical vehicle class key.
///
/// Raw ids from the UI and the fare API arrive in many spellings
/// ("Innova Crysta", "innova-crysta", "INNOVA_CRYSTA"); all of them must land on
/// the same cache key, so construction always normalizes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct VehicleId(String);

pub const DEFAULT_VEHICLE: &str = "sedan";

const ALIASES: [(&str, &str); 6] = [
    ("innova", "innova_crysta"),
    ("crysta", "innova_crysta"),
    ("toyota_innova_crysta", "innova_crysta"),
    ("tempo", "tempo_traveller"),
    ("traveller", "tempo_traveller"),
    ("dzire", "sedan"),
];

fn normalize(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_sep = true;
    for c in raw.trim().chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_sep = false;
        } else if matches!(c, ' ' | '-' | '_' | '.' | '/') {
            if !last_sep {
                out.push('_');
                last_sep = true;
            }
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    if out.is_empty() {
        return DEFAULT_VEHICLE.to_string();
    }
    ALIASES
        .iter()
        .find(|(alias, _)| *alias == out)
        .map(|(_, canonical)| canonical.to_string())
        .unwrap_or(out)
}

impl VehicleId {
    pub fn new(raw: &str) -> Self {
        Self(normalize(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for VehicleId {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<String> for VehicleId {
    fn from(raw: String) -> Self {
        Self::new(&raw)
    }
}

impl From<VehicleId> for String {
    fn from(v: VehicleId) -> Self {
        v.0
    }
}

impl fmt::Display for VehicleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Cache and single-flight key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FareKey {
    pub trip_kind: TripKind,
    pub vehicle_id: VehicleId,
}

impl FareKey {
    pub fn new(trip_kind: TripKind, vehicle_id: VehicleId) -> Self {
        Self {
            trip_kind,
            vehicle_id,
        }
    }
}

impl fmt::Display for FareKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.trip_kind, self.vehicle_id)
    }
}
