use std::collections::BTreeMap;

use chrono::{NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};

use super::error::FareError;
use super::schedule::{
    money, AirportFareSchedule, FareSchedule, LocalFareSchedule, OutstationFareSchedule,
};

pub const OUTSTATION_MIN_KM_PER_DAY: f64 = 300.0;
pub const NIGHT_SURCHARGE_RATE: f64 = 0.10;
const AIRPORT_BANDS_KM: [f64; 4] = [10.0, 20.0, 30.0, 40.0];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TripMode {
    #[default]
    OneWay,
    RoundTrip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LocalPackage {
    Hours4Km40,
    Hours8Km80,
    Hours10Km100,
}

impl LocalPackage {
    /// Accepts the spellings seen in the wild: "8hrs-80km", "8hr_80km", "08HRS-80KM".
    pub fn parse(code: &str) -> Option<Self> {
        let digits: Vec<u32> = code
            .split(|c: char| !c.is_ascii_digit())
            .filter(|s| !s.is_empty())
            .filter_map(|s| s.parse().ok())
            .collect();
        match digits.as_slice() {
            [4, 40] => Some(Self::Hours4Km40),
            [8, 80] => Some(Self::Hours8Km80),
            [10, 100] => Some(Self::Hours10Km100),
            _ => None,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Hours4Km40 => "4hrs-40km",
            Self::Hours8Km80 => "8hrs-80km",
            Self::Hours10Km100 => "10hrs-100km",
        }
    }

    pub fn included_km(&self) -> f64 {
        match self {
            Self::Hours4Km40 => 40.0,
            Self::Hours8Km80 => 80.0,
            Self::Hours10Km100 => 100.0,
        }
    }

    pub fn included_hours(&self) -> f64 {
        match self {
            Self::Hours4Km40 => 4.0,
            Self::Hours8Km80 => 8.0,
            Self::Hours10Km100 => 10.0,
        }
    }

    fn price(&self, s: &LocalFareSchedule) -> f64 {
        match self {
            Self::Hours4Km40 => money(s.price_4hrs_40km),
            Self::Hours8Km80 => money(s.price_8hrs_80km),
            Self::Hours10Km100 => money(s.price_10hrs_100km),
        }
    }
}

/// Trip-specific inputs. For outstation trips `distance_km` is the one-way distance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TripParams {
    pub distance_km: f64,
    #[serde(default)]
    pub trip_mode: TripMode,
    #[serde(default)]
    pub pickup: Option<NaiveDateTime>,
    #[serde(default)]
    pub return_at: Option<NaiveDateTime>,
    #[serde(default)]
    pub package: Option<String>,
    #[serde(default)]
    pub duration_hours: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FareQuote {
    pub total_price: f64,
    pub base_price: f64,
    pub breakdown: BTreeMap<String, f64>,
}

impl FareQuote {
    fn new(base_price: f64) -> Self {
        let mut breakdown = BTreeMap::new();
        breakdown.insert("base_fare".to_string(), base_price);
        Self {
            total_price: base_price,
            base_price,
            breakdown,
        }
    }

    fn charge(&mut self, name: &str, amount: f64) {
        let amount = money(amount);
        if amount > 0.0 {
            self.breakdown.insert(name.to_string(), amount);
        }
    }

    fn finish(mut self, round: fn(f64) -> f64) -> Self {
        let sum: f64 = self.breakdown.values().copied().map(money).sum();
        self.total_price = round(sum);
        self
    }
}

pub fn round_up_to_ten(v: f64) -> f64 {
    let v = money(v);
    (v / 10.0).ceil() * 10.0
}

fn round_up_to_unit(v: f64) -> f64 {
    money(v).ceil()
}

fn is_night(t: NaiveTime) -> bool {
    t.hour() >= 22 || t.hour() < 5 || (t.hour() == 5 && t.minute() == 0 && t.second() == 0)
}

/// Billable days for a round trip: the inclusive calendar-day span, at least one.
pub fn calendar_days(pickup: Option<NaiveDateTime>, return_at: Option<NaiveDateTime>) -> u32 {
    match (pickup, return_at) {
        (Some(p), Some(r)) => {
            let span = (r.date() - p.date()).num_days();
            u32::try_from(span.max(0)).unwrap_or(u32::MAX - 1) + 1
        }
        _ => 1,
    }
}

pub fn outstation_fare(s: &OutstationFareSchedule, p: &TripParams) -> FareQuote {
    let one_way_rates = (money(s.base_price), money(s.price_per_km));
    let (days, (base_rate, per_km)) = match p.trip_mode {
        TripMode::OneWay => (1, one_way_rates),
        TripMode::RoundTrip => {
            let rt = (money(s.round_trip_base_price), money(s.round_trip_price_per_km));
            let rates = if rt.0 > 0.0 { rt } else { one_way_rates };
            (calendar_days(p.pickup, p.return_at), rates)
        }
    };
    let days_f = f64::from(days);
    let base = match p.trip_mode {
        TripMode::OneWay => base_rate,
        TripMode::RoundTrip => base_rate * days_f,
    };

    let mut q = FareQuote::new(base);
    let distance = money(p.distance_km);
    if distance <= 0.0 {
        return q.finish(round_up_to_ten);
    }

    let effective_km = distance * 2.0;
    let minimum_km = days_f * OUTSTATION_MIN_KM_PER_DAY;
    let extra_km = (effective_km - minimum_km).max(0.0);
    q.charge("extra_distance", extra_km * per_km);
    q.charge("driver_allowance", money(s.driver_allowance) * days_f);
    if days > 1 {
        q.charge("night_halt", money(s.night_halt_charge) * (days_f - 1.0));
    }
    if p.pickup.map(|t| is_night(t.time())).unwrap_or(false) {
        q.charge("night_surcharge", base * NIGHT_SURCHARGE_RATE);
    }
    q.finish(round_up_to_ten)
}

pub fn local_fare(s: &LocalFareSchedule, p: &TripParams) -> Result<FareQuote, FareError> {
    let code = p.package.as_deref().unwrap_or_default();
    let Some(package) = LocalPackage::parse(code) else {
        return Err(FareError::UnknownPackage(code.to_string()));
    };
    let mut q = FareQuote::new(package.price(s));
    let distance = money(p.distance_km);
    if distance <= 0.0 {
        return Ok(q.finish(round_up_to_unit));
    }

    let extra_km = (distance - package.included_km()).max(0.0);
    q.charge("extra_km", extra_km * money(s.extra_km_rate));
    if let Some(hours) = p.duration_hours {
        let extra_hours = (money(hours) - package.included_hours()).max(0.0);
        q.charge("extra_hours", extra_hours * money(s.extra_hour_rate));
    }
    Ok(q.finish(round_up_to_unit))
}

pub fn airport_fare(s: &AirportFareSchedule, p: &TripParams) -> FareQuote {
    let distance = money(p.distance_km);
    let tiers = [
        money(s.tier1_price),
        money(s.tier2_price),
        money(s.tier3_price),
        money(s.tier4_price),
    ];

    if distance <= 0.0 {
        let base = if money(s.base_price) > 0.0 {
            money(s.base_price)
        } else {
            tiers[0]
        };
        return FareQuote::new(base).finish(round_up_to_ten);
    }

    if tiers.iter().all(|t| *t == 0.0) {
        let mut q = FareQuote::new(money(s.base_price));
        q.charge("distance", distance * money(s.price_per_km));
        return q.finish(round_up_to_ten);
    }

    let band = AIRPORT_BANDS_KM
        .iter()
        .position(|limit| distance <= *limit)
        .unwrap_or(AIRPORT_BANDS_KM.len() - 1);
    let mut q = FareQuote::new(tiers[band]);
    let last_band = AIRPORT_BANDS_KM[AIRPORT_BANDS_KM.len() - 1];
    if distance > last_band {
        q.charge("extra_km", (distance - last_band) * money(s.extra_km_charge));
    }
    q.finish(round_up_to_ten)
}

/// Dispatches on the schedule's trip kind.
pub fn quote(schedule: &FareSchedule, params: &TripParams) -> Result<FareQuote, FareError> {
    match schedule {
        FareSchedule::Outstation(s) => Ok(outstation_fare(s, params)),
        FareSchedule::Local(s) => local_fare(s, params),
        FareSchedule::Airport(s) => Ok(airport_fare(s, params)),
    }
}
