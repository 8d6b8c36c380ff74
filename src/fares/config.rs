use std::path::Path;

use serde::{Deserialize, Serialize};

use super::vehicle::TripKind;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    pub outstation_path: String,
    pub local_path: String,
    pub airport_path: String,
    pub outstation_update_path: String,
    pub local_update_path: String,
    pub airport_update_path: String,
    /// Hard ceiling for one fetch; a slower response counts as a network failure.
    pub request_timeout_seconds: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".to_string(),
            outstation_path: "/api/outstation-fares".to_string(),
            local_path: "/api/local-package-fares".to_string(),
            airport_path: "/api/airport-fares".to_string(),
            outstation_update_path: "/api/admin/outstation-fares-update".to_string(),
            local_update_path: "/api/admin/local-fares-update".to_string(),
            airport_update_path: "/api/admin/airport-fares-update".to_string(),
            request_timeout_seconds: 5,
        }
    }
}

impl ApiConfig {
    pub fn fetch_path(&self, kind: TripKind) -> &str {
        match kind {
            TripKind::Outstation => &self.outstation_path,
            TripKind::Local => &self.local_path,
            TripKind::Airport => &self.airport_path,
        }
    }

    pub fn update_path(&self, kind: TripKind) -> &str {
        match kind {
            TripKind::Outstation => &self.outstation_update_path,
            TripKind::Local => &self.local_update_path,
            TripKind::Airport => &self.airport_update_path,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_seconds: u64,
    /// How long a full price list stays fresh for list views.
    pub bulk_ttl_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: 300,
            bulk_ttl_seconds: 300,
        }
    }
}

impl CacheConfig {
    pub fn ttl_ms(&self) -> u64 {
        self.ttl_seconds.saturating_mul(1000)
    }

    pub fn bulk_ttl_ms(&self) -> u64 {
        self.bulk_ttl_seconds.saturating_mul(1000)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    pub debounce_ms: u64,
    pub throttle_ms: u64,
    pub max_attempts: u32,
    pub reset_interval_ms: u64,
    /// Gap between computed and parent totals that is worth announcing.
    pub difference_threshold: f64,
    /// Gap beyond which the computed total replaces the parent total.
    pub override_threshold: f64,
    /// Trip kinds whose computed total is trusted over the parent total.
    pub override_trip_kinds: Vec<TripKind>,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 100,
            throttle_ms: 500,
            max_attempts: 3,
            reset_interval_ms: 15_000,
            difference_threshold: 10.0,
            override_threshold: 50.0,
            override_trip_kinds: vec![TripKind::Airport],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    /// Keep settled fares on disk as well as in the session map.
    pub persistent: bool,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self { persistent: true }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub api: ApiConfig,
    pub cache: CacheConfig,
    pub reconcile: ReconcileConfig,
    pub mirror: MirrorConfig,
}

pub fn load_or_init_config(path: &Path) -> anyhow::Result<EngineConfig> {
    if path.exists() {
        let txt = std::fs::read_to_string(path)?;
        let cfg: EngineConfig = toml::from_str(&txt)?;
        return Ok(cfg);
    }
    let cfg = EngineConfig::default();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, toml::to_string_pretty(&cfg)?)?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_is_written_with_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("fares.toml");
        let cfg = load_or_init_config(&path).unwrap();
        assert_eq!(cfg, EngineConfig::default());
        assert!(path.exists());
        let again = load_or_init_config(&path).unwrap();
        assert_eq!(again, cfg);
    }

    #[test]
    fn partial_config_keeps_defaults_for_the_rest() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("fares.toml");
        std::fs::write(
            &path,
            "[api]\nbase_url = \"https://fares.example.com\"\n\n[reconcile]\nmax_attempts = 5\noverride_trip_kinds = [\"airport\", \"outstation\"]\n",
        )
        .unwrap();
        let cfg = load_or_init_config(&path).unwrap();
        assert_eq!(cfg.api.base_url, "https://fares.example.com");
        assert_eq!(cfg.api.airport_path, "/api/airport-fares");
        assert_eq!(cfg.reconcile.max_attempts, 5);
        assert_eq!(cfg.reconcile.debounce_ms, 100);
        assert_eq!(
            cfg.reconcile.override_trip_kinds,
            vec![TripKind::Airport, TripKind::Outstation]
        );
        assert_eq!(cfg.cache.ttl_ms(), 300_000);
    }
}
