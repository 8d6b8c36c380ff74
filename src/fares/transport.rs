use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CACHE_CONTROL, CONTENT_TYPE};
use serde_json::Value;

use super::clock::unix_ms;
use super::config::ApiConfig;
use super::error::{FareError, FareResult};
use super::schedule::{looks_like_schedule, schedule_from_json, FareSchedule};
use super::vehicle::{TripKind, VehicleId};

/// Where fare schedules come from. The HTTP implementation is the production
/// one; tests and embedders plug in their own.
#[async_trait]
pub trait FareTransport: Send + Sync {
    async fn fetch_schedule(
        &self,
        kind: TripKind,
        vehicle_id: &VehicleId,
    ) -> FareResult<FareSchedule>;

    async fn fetch_all(&self, kind: TripKind) -> FareResult<Vec<(VehicleId, FareSchedule)>>;

    async fn update_schedule(
        &self,
        vehicle_id: &VehicleId,
        schedule: &FareSchedule,
    ) -> FareResult<()>;
}

const VEHICLE_KEYS: [&str; 6] = [
    "vehicle_id",
    "vehicleId",
    "vehicle_type",
    "vehicleType",
    "vehicle",
    "id",
];

fn record_vehicle(v: &Value) -> Option<VehicleId> {
    VEHICLE_KEYS.iter().find_map(|k| match v.get(*k)? {
        Value::String(s) if !s.trim().is_empty() => Some(VehicleId::new(s)),
        Value::Number(n) => Some(VehicleId::new(&n.to_string())),
        _ => None,
    })
}

/// Normalizes the `{ status, fares }` envelope into canonical schedules.
///
/// `fares` may be an array of per-vehicle records, an object keyed by vehicle,
/// or a single bare record (when the request was already scoped to one
/// vehicle). Records are returned with the vehicle they name, if any.
pub fn parse_envelope(
    kind: TripKind,
    body: &Value,
) -> FareResult<Vec<(Option<VehicleId>, FareSchedule)>> {
    if !body.is_object() {
        return Err(FareError::MalformedResponse(
            "response is not a JSON object".to_string(),
        ));
    }
    let status = body
        .get("status")
        .and_then(|v| v.as_str())
        .unwrap_or("success");
    if status.eq_ignore_ascii_case("error") {
        let msg = body
            .get("message")
            .or_else(|| body.get("error"))
            .and_then(|v| v.as_str())
            .unwrap_or("unspecified error");
        return Err(FareError::NetworkFailure(format!(
            "fare api reported error: {msg}"
        )));
    }
    let Some(fares) = body.get("fares") else {
        return Err(FareError::MalformedResponse("missing `fares`".to_string()));
    };

    let mut out = Vec::new();
    match fares {
        Value::Array(items) => {
            for item in items {
                match schedule_from_json(kind, item) {
                    Ok(s) => out.push((record_vehicle(item), s)),
                    Err(e) => log::debug!("skipping {kind} fare record: {e}"),
                }
            }
            if out.is_empty() && !items.is_empty() {
                return Err(FareError::MalformedResponse(format!(
                    "no usable {kind} fare records"
                )));
            }
        }
        Value::Object(_) if looks_like_schedule(kind, fares) => {
            out.push((record_vehicle(fares), schedule_from_json(kind, fares)?));
        }
        Value::Object(map) => {
            for (name, item) in map {
                match schedule_from_json(kind, item) {
                    Ok(s) => out.push((Some(VehicleId::new(name)), s)),
                    Err(e) => log::debug!("skipping {kind} fare entry {name}: {e}"),
                }
            }
            if out.is_empty() && !map.is_empty() {
                return Err(FareError::MalformedResponse(format!(
                    "no usable {kind} fare entries"
                )));
            }
        }
        other => {
            return Err(FareError::MalformedResponse(format!(
                "`fares` has unexpected shape: {other}"
            )));
        }
    }
    Ok(out)
}

/// Picks the requested vehicle out of a parsed envelope. An unnamed lone record
/// is taken to be the one asked for.
pub fn select_schedule(
    kind: TripKind,
    vehicle_id: &VehicleId,
    records: Vec<(Option<VehicleId>, FareSchedule)>,
) -> FareResult<FareSchedule> {
    let lone_unnamed = records.len() == 1 && records[0].0.is_none();
    records
        .into_iter()
        .find(|(id, _)| lone_unnamed || id.as_ref() == Some(vehicle_id))
        .map(|(_, s)| s)
        .ok_or_else(|| FareError::NoScheduleFound {
            trip_kind: kind,
            vehicle_id: vehicle_id.clone(),
        })
}

fn cache_bust_token() -> String {
    format!("{}-{:08x}", unix_ms(), fastrand::u32(..))
}

fn build_url(base_url: &str, path: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let rel = path.trim_start_matches('/');
    format!("{base}/{rel}")
}

#[derive(Clone)]
pub struct HttpFareTransport {
    client: reqwest::Client,
    api: ApiConfig,
}

impl HttpFareTransport {
    pub fn new(api: ApiConfig) -> FareResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent("fare-engine/0.1")
            // Avoid hanging on broken TCP handshakes.
            .connect_timeout(Duration::from_secs(api.request_timeout_seconds.max(1)))
            .build()
            .map_err(|e| FareError::NetworkFailure(format!("failed to build http client: {e}")))?;
        Ok(Self { client, api })
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.api.request_timeout_seconds.max(1))
    }

    async fn get_envelope(
        &self,
        kind: TripKind,
        vehicle_id: Option<&VehicleId>,
    ) -> FareResult<Value> {
        let mut url = build_url(&self.api.base_url, self.api.fetch_path(kind));
        url.push_str(&format!("?_t={}", cache_bust_token()));
        if let Some(v) = vehicle_id {
            url.push_str(&format!("&vehicle_id={}", urlencoding::encode(v.as_str())));
        }

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));

        let resp = self
            .client
            .get(url)
            .headers(headers)
            .timeout(self.timeout())
            .send()
            .await?;
        let status = resp.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(FareError::NetworkFailure(format!("http {status}")));
        }
        resp.json::<Value>()
            .await
            .map_err(|e| FareError::MalformedResponse(e.to_string()))
    }
}

#[async_trait]
impl FareTransport for HttpFareTransport {
    async fn fetch_schedule(
        &self,
        kind: TripKind,
        vehicle_id: &VehicleId,
    ) -> FareResult<FareSchedule> {
        let body = self.get_envelope(kind, Some(vehicle_id)).await?;
        select_schedule(kind, vehicle_id, parse_envelope(kind, &body)?)
    }

    async fn fetch_all(&self, kind: TripKind) -> FareResult<Vec<(VehicleId, FareSchedule)>> {
        let body = self.get_envelope(kind, None).await?;
        Ok(parse_envelope(kind, &body)?
            .into_iter()
            .filter_map(|(id, s)| id.map(|id| (id, s)))
            .collect())
    }

    async fn update_schedule(
        &self,
        vehicle_id: &VehicleId,
        schedule: &FareSchedule,
    ) -> FareResult<()> {
        let kind = schedule.trip_kind();
        let url = build_url(&self.api.base_url, self.api.update_path(kind));
        let resp = self
            .client
            .post(url)
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .timeout(self.timeout())
            .json(&schedule.to_update_json(vehicle_id))
            .send()
            .await?;
        let status = resp.status().as_u16();
        let j = resp.json::<Value>().await.unwrap_or(Value::Null);
        if !(200..300).contains(&status) {
            return Err(FareError::NetworkFailure(format!("http {status}")));
        }
        if j.get("status").and_then(|v| v.as_str()) == Some("error") {
            let msg = j
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("update rejected");
            return Err(FareError::NetworkFailure(msg.to_string()));
        }
        Ok(())
    }
}
