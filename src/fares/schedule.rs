use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::error::FareError;
use super::vehicle::{TripKind, VehicleId};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutstationFareSchedule {
    pub base_price: f64,
    pub price_per_km: f64,
    pub round_trip_base_price: f64,
    pub round_trip_price_per_km: f64,
    pub driver_allowance: f64,
    pub night_halt_charge: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocalFareSchedule {
    pub price_4hrs_40km: f64,
    pub price_8hrs_80km: f64,
    pub price_10hrs_100km: f64,
    pub extra_km_rate: f64,
    pub extra_hour_rate: f64,
    /// Bundled into the package prices; kept for display only.
    pub driver_allowance: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AirportFareSchedule {
    pub tier1_price: f64,
    pub tier2_price: f64,
    pub tier3_price: f64,
    pub tier4_price: f64,
    pub extra_km_charge: f64,
    pub base_price: f64,
    pub price_per_km: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "trip_kind", rename_all = "lowercase")]
pub enum FareSchedule {
    Outstation(OutstationFareSchedule),
    Local(LocalFareSchedule),
    Airport(AirportFareSchedule),
}

impl FareSchedule {
    pub fn trip_kind(&self) -> TripKind {
        match self {
            Self::Outstation(_) => TripKind::Outstation,
            Self::Local(_) => TripKind::Local,
            Self::Airport(_) => TripKind::Airport,
        }
    }

    /// Body for the admin update endpoint. Both spellings of the vehicle key are
    /// sent because the backend has historically read either.
    pub fn to_update_json(&self, vehicle_id: &VehicleId) -> Value {
        let mut body = match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        body.remove("trip_kind");
        body.insert("vehicle_id".to_string(), Value::from(vehicle_id.as_str()));
        body.insert("vehicleId".to_string(), Value::from(vehicle_id.as_str()));
        Value::Object(body)
    }
}

pub(crate) fn as_f64(v: Option<&Value>) -> Option<f64> {
    let v = v?;
    v.as_f64()
        .or_else(|| v.as_i64().map(|n| n as f64))
        .or_else(|| v.as_u64().map(|n| n as f64))
        .or_else(|| v.as_str().and_then(|s| s.trim().parse::<f64>().ok()))
}

/// Missing, negative or non-finite amounts count as zero.
pub(crate) fn money(v: f64) -> f64 {
    if v.is_finite() && v > 0.0 {
        v
    } else {
        0.0
    }
}

struct Fields<'a> {
    obj: &'a Map<String, Value>,
    seen: usize,
}

impl<'a> Fields<'a> {
    fn num(&mut self, names: &[&str]) -> f64 {
        for name in names {
            if let Some(n) = as_f64(self.obj.get(*name)) {
                self.seen += 1;
                return money(n);
            }
        }
        0.0
    }
}

const OUTSTATION_FIELDS: [&[&str]; 6] = [
    &["basePrice", "base_price", "baseFare", "base_fare"],
    &["pricePerKm", "price_per_km", "perKmRate", "per_km_rate"],
    &["roundTripBasePrice", "round_trip_base_price", "roundtripBasePrice"],
    &["roundTripPricePerKm", "round_trip_price_per_km", "roundtripPricePerKm"],
    &["driverAllowance", "driver_allowance"],
    &["nightHaltCharge", "night_halt_charge", "nightHalt", "night_halt"],
];

const LOCAL_FIELDS: [&[&str]; 6] = [
    &["price4hrs40km", "price_4hrs_40km", "package4hr40km", "package_4hr_40km"],
    &["price8hrs80km", "price_8hrs_80km", "package8hr80km", "package_8hr_80km"],
    &["price10hrs100km", "price_10hrs_100km", "package10hr100km", "package_10hr_100km"],
    &["extraKmRate", "extra_km_rate", "priceExtraKm", "price_extra_km"],
    &["extraHourRate", "extra_hour_rate", "priceExtraHour", "price_extra_hour"],
    &["driverAllowance", "driver_allowance"],
];

const AIRPORT_FIELDS: [&[&str]; 7] = [
    &["tier1Price", "tier1_price", "tier_1_price"],
    &["tier2Price", "tier2_price", "tier_2_price"],
    &["tier3Price", "tier3_price", "tier_3_price"],
    &["tier4Price", "tier4_price", "tier_4_price"],
    &["extraKmCharge", "extra_km_charge"],
    &["basePrice", "base_price"],
    &["pricePerKm", "price_per_km"],
];

/// Turns one loosely shaped JSON record into the canonical schedule for `kind`.
///
/// Individual missing fields become zero; a record that carries none of the
/// known fields is rejected so that an unrelated object is never mistaken for
/// a price list.
pub fn schedule_from_json(kind: TripKind, v: &Value) -> Result<FareSchedule, FareError> {
    let Some(obj) = v.as_object() else {
        return Err(FareError::MalformedResponse(format!(
            "expected {kind} fare object, got {}",
            json_type(v)
        )));
    };
    let mut f = Fields { obj, seen: 0 };
    let schedule = match kind {
        TripKind::Outstation => {
            let [a, b, c, d, e, g] = OUTSTATION_FIELDS;
            FareSchedule::Outstation(OutstationFareSchedule {
                base_price: f.num(a),
                price_per_km: f.num(b),
                round_trip_base_price: f.num(c),
                round_trip_price_per_km: f.num(d),
                driver_allowance: f.num(e),
                night_halt_charge: f.num(g),
            })
        }
        TripKind::Local => {
            let [a, b, c, d, e, g] = LOCAL_FIELDS;
            FareSchedule::Local(LocalFareSchedule {
                price_4hrs_40km: f.num(a),
                price_8hrs_80km: f.num(b),
                price_10hrs_100km: f.num(c),
                extra_km_rate: f.num(d),
                extra_hour_rate: f.num(e),
                driver_allowance: f.num(g),
            })
        }
        TripKind::Airport => {
            let [a, b, c, d, e, g, h] = AIRPORT_FIELDS;
            FareSchedule::Airport(AirportFareSchedule {
                tier1_price: f.num(a),
                tier2_price: f.num(b),
                tier3_price: f.num(c),
                tier4_price: f.num(d),
                extra_km_charge: f.num(e),
                base_price: f.num(g),
                price_per_km: f.num(h),
            })
        }
    };
    if f.seen == 0 {
        return Err(FareError::MalformedResponse(format!(
            "object has no {kind} fare fields"
        )));
    }
    Ok(schedule)
}

/// Whether `v` looks like a schedule record rather than a map of records.
pub(crate) fn looks_like_schedule(kind: TripKind, v: &Value) -> bool {
    let Some(obj) = v.as_object() else {
        return false;
    };
    let names: &[&[&str]] = match kind {
        TripKind::Outstation => &OUTSTATION_FIELDS,
        TripKind::Local => &LOCAL_FIELDS,
        TripKind::Airport => &AIRPORT_FIELDS,
    };
    names
        .iter()
        .flat_map(|n| n.iter())
        .any(|n| obj.contains_key(*n))
}

fn json_type(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Vehicle classes with a built-in price floor.
pub const VEHICLE_CLASSES: [&str; 5] = [
    "sedan",
    "ertiga",
    "innova_crysta",
    "tempo_traveller",
    "luxury",
];

// Last-resort price floor, per vehicle class. Unknown classes price as a sedan.
//                       base,    /km,  rt base, rt /km, driver, night halt
const OUTSTATION_DEFAULTS: [(&str, [f64; 6]); 5] = [
    ("sedan", [4200.0, 14.0, 4000.0, 12.0, 250.0, 700.0]),
    ("ertiga", [5400.0, 18.0, 5000.0, 15.0, 250.0, 1000.0]),
    ("innova_crysta", [6000.0, 20.0, 5600.0, 17.0, 250.0, 1000.0]),
    ("tempo_traveller", [9000.0, 22.0, 8500.0, 19.0, 300.0, 1200.0]),
    ("luxury", [10500.0, 25.0, 10000.0, 22.0, 300.0, 1500.0]),
];

//                       4h/40,   8h/80,   10h/100, /km,  /hour, driver
const LOCAL_DEFAULTS: [(&str, [f64; 6]); 5] = [
    ("sedan", [1200.0, 2500.0, 3000.0, 14.0, 250.0, 0.0]),
    ("ertiga", [1500.0, 3000.0, 3500.0, 18.0, 300.0, 0.0]),
    ("innova_crysta", [1800.0, 3500.0, 4000.0, 20.0, 350.0, 0.0]),
    ("tempo_traveller", [3000.0, 5000.0, 5500.0, 22.0, 400.0, 0.0]),
    ("luxury", [3500.0, 5500.0, 6500.0, 25.0, 450.0, 0.0]),
];

//                       tier1,   tier2,   tier3,   tier4,  extra/km, base, /km
const AIRPORT_DEFAULTS: [(&str, [f64; 7]); 5] = [
    ("sedan", [800.0, 1200.0, 1500.0, 2000.0, 14.0, 800.0, 12.0]),
    ("ertiga", [1000.0, 1500.0, 1800.0, 2400.0, 16.0, 1000.0, 15.0]),
    ("innova_crysta", [1200.0, 1700.0, 2100.0, 2800.0, 18.0, 1200.0, 17.0]),
    ("tempo_traveller", [2000.0, 2500.0, 3000.0, 3500.0, 20.0, 2000.0, 19.0]),
    ("luxury", [2500.0, 3000.0, 3600.0, 4200.0, 22.0, 2500.0, 22.0]),
];

fn lookup<const N: usize>(table: &[(&str, [f64; N])], vehicle_id: &VehicleId) -> [f64; N] {
    table
        .iter()
        .find(|(name, _)| *name == vehicle_id.as_str())
        .or_else(|| table.first())
        .map(|(_, row)| *row)
        .unwrap_or([0.0; N])
}

pub fn default_schedule(kind: TripKind, vehicle_id: &VehicleId) -> FareSchedule {
    match kind {
        TripKind::Outstation => {
            let [a, b, c, d, e, f] = lookup(&OUTSTATION_DEFAULTS, vehicle_id);
            FareSchedule::Outstation(OutstationFareSchedule {
                base_price: a,
                price_per_km: b,
                round_trip_base_price: c,
                round_trip_price_per_km: d,
                driver_allowance: e,
                night_halt_charge: f,
            })
        }
        TripKind::Local => {
            let [a, b, c, d, e, f] = lookup(&LOCAL_DEFAULTS, vehicle_id);
            FareSchedule::Local(LocalFareSchedule {
                price_4hrs_40km: a,
                price_8hrs_80km: b,
                price_10hrs_100km: c,
                extra_km_rate: d,
                extra_hour_rate: e,
                driver_allowance: f,
            })
        }
        TripKind::Airport => {
            let [a, b, c, d, e, f, g] = lookup(&AIRPORT_DEFAULTS, vehicle_id);
            FareSchedule::Airport(AirportFareSchedule {
                tier1_price: a,
                tier2_price: b,
                tier3_price: c,
                tier4_price: d,
                extra_km_charge: e,
                base_price: f,
                price_per_km: g,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accepts_camel_and_snake_case_and_numeric_strings() {
        let camel = json!({
            "basePrice": 4200, "pricePerKm": "14", "roundTripBasePrice": 4000.0,
            "roundTripPricePerKm": 12, "driverAllowance": 250, "nightHaltCharge": 700
        });
        let snake = json!({
            "base_price": "4200", "price_per_km": 14, "round_trip_base_price": 4000,
            "round_trip_price_per_km": "12.0", "driver_allowance": 250, "night_halt": 700
        });
        let a = schedule_from_json(TripKind::Outstation, &camel).unwrap();
        let b = schedule_from_json(TripKind::Outstation, &snake).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, default_schedule(TripKind::Outstation, &VehicleId::new("sedan")));
    }

    #[test]
    fn missing_and_garbage_fields_become_zero() {
        let v = json!({ "tier4Price": 2000, "extraKmCharge": "abc", "basePrice": -5 });
        let FareSchedule::Airport(s) = schedule_from_json(TripKind::Airport, &v).unwrap() else {
            panic!("expected airport schedule");
        };
        assert_eq!(s.tier4_price, 2000.0);
        assert_eq!(s.extra_km_charge, 0.0);
        assert_eq!(s.base_price, 0.0);
        assert_eq!(s.tier1_price, 0.0);
    }

    #[test]
    fn object_without_fare_fields_is_malformed() {
        let err = schedule_from_json(TripKind::Local, &json!({ "name": "sedan" })).unwrap_err();
        assert!(matches!(err, FareError::MalformedResponse(_)));
        let err = schedule_from_json(TripKind::Local, &json!([1, 2])).unwrap_err();
        assert!(matches!(err, FareError::MalformedResponse(_)));
    }

    #[test]
    fn unknown_vehicle_defaults_to_sedan_prices() {
        let sedan = default_schedule(TripKind::Local, &VehicleId::new("sedan"));
        let odd = default_schedule(TripKind::Local, &VehicleId::new("hovercraft"));
        assert_eq!(sedan, odd);
        let innova = default_schedule(TripKind::Local, &VehicleId::new("Innova Crysta"));
        assert_ne!(sedan, innova);
    }

    #[test]
    fn update_body_carries_vehicle_id_in_both_spellings() {
        let s = default_schedule(TripKind::Airport, &VehicleId::new("ertiga"));
        let body = s.to_update_json(&VehicleId::new("ertiga"));
        assert_eq!(body["vehicle_id"], "ertiga");
        assert_eq!(body["vehicleId"], "ertiga");
        assert_eq!(body["tier4_price"], 2400.0);
        assert!(body.get("trip_kind").is_none());
    }
}
