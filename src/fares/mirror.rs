use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::clock::unix_ms;
use super::vehicle::{TripKind, VehicleId};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MirroredFare {
    pub total: f64,
    pub settled_at_unix_ms: u64,
}

/// Best-effort copy of the last settled fare per (trip kind, vehicle).
///
/// A session map answers first; the optional sled tree survives reloads. Never
/// authoritative: it is only read when nothing fresher is available.
#[derive(Clone)]
pub struct FareMirror {
    session: Arc<RwLock<HashMap<String, MirroredFare>>>,
    db: Option<sled::Db>,
}

const KEY_PREFIX: &str = "fare:";

fn mirror_key(kind: TripKind, vehicle_id: &VehicleId) -> String {
    format!("{KEY_PREFIX}{}:{}", kind.as_str(), vehicle_id.as_str())
}

impl FareMirror {
    pub fn in_memory() -> Self {
        Self {
            session: Arc::new(RwLock::new(HashMap::new())),
            db: None,
        }
    }

    pub fn open(path: &Path) -> Result<Self, sled::Error> {
        let db = sled::open(path)?;
        Ok(Self {
            session: Arc::new(RwLock::new(HashMap::new())),
            db: Some(db),
        })
    }

    pub fn is_persistent(&self) -> bool {
        self.db.is_some()
    }

    pub fn record(
        &self,
        kind: TripKind,
        vehicle_id: &VehicleId,
        total: f64,
        settled_at_unix_ms: u64,
    ) {
        if !total.is_finite() || total <= 0.0 {
            return;
        }
        let key = mirror_key(kind, vehicle_id);
        let value = MirroredFare {
            total,
            settled_at_unix_ms,
        };
        self.session.write().insert(key.clone(), value);

        let Some(db) = &self.db else {
            return;
        };
        let bytes = match serde_json::to_vec(&value) {
            Ok(b) => b,
            Err(e) => {
                log::warn!("fare mirror encode failed for {key}: {e}");
                return;
            }
        };
        if let Err(e) = db.insert(key.as_bytes(), bytes) {
            log::warn!("fare mirror write failed for {key}: {e}");
        }
    }

    pub fn hint(&self, kind: TripKind, vehicle_id: &VehicleId) -> Option<MirroredFare> {
        let key = mirror_key(kind, vehicle_id);
        if let Some(v) = self.session.read().get(&key) {
            return Some(*v);
        }
        let raw = self.db.as_ref()?.get(key.as_bytes()).ok().flatten()?;
        let v: MirroredFare = serde_json::from_slice(&raw).ok()?;
        if !v.total.is_finite() || v.total <= 0.0 {
            return None;
        }
        Some(v)
    }

    pub fn clear(&self) {
        self.session.write().clear();
        let Some(db) = &self.db else {
            return;
        };
        let keys: Vec<sled::IVec> = db
            .scan_prefix(KEY_PREFIX.as_bytes())
            .filter_map(|res| res.ok().map(|(k, _)| k))
            .collect();
        for key in keys {
            let _ = db.remove(key);
        }
    }

    pub fn flush(&self) {
        if let Some(db) = &self.db {
            if let Err(e) = db.flush() {
                log::warn!("fare mirror flush failed: {e}");
            }
        }
    }
}

/// Opens the persistent mirror under `base/sled`.
///
/// sled may panic on a corrupted directory. A broken mirror is moved aside and
/// recreated rather than taking the host down with it.
pub fn open_mirror_dir(base: PathBuf) -> anyhow::Result<FareMirror> {
    std::fs::create_dir_all(&base)?;
    let path = base.join("sled");

    let attempt = std::panic::catch_unwind(|| FareMirror::open(&path));
    match attempt {
        Ok(Ok(mirror)) => Ok(mirror),
        Ok(Err(e)) => {
            log::warn!("fare mirror open failed, recreating: {e}");
            recover_mirror_dir(&path)?;
            Ok(FareMirror::open(&path)?)
        }
        Err(_) => {
            log::warn!("fare mirror open panicked, recreating");
            recover_mirror_dir(&path)?;
            Ok(FareMirror::open(&path)?)
        }
    }
}

fn recover_mirror_dir(path: &Path) -> anyhow::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let backup = parent.join(format!("sled.corrupt.{}", unix_ms()));
    if path.exists() {
        if let Err(e) = std::fs::rename(path, &backup) {
            log::warn!("failed to move broken mirror to {}: {e}", backup.display());
            std::fs::remove_dir_all(path)
                .map_err(|e2| anyhow::anyhow!("failed to remove broken mirror dir: {e2}"))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_mirror_answers_hints() {
        let m = FareMirror::in_memory();
        let sedan = VehicleId::new("sedan");
        assert!(m.hint(TripKind::Outstation, &sedan).is_none());
        m.record(TripKind::Outstation, &sedan, 4450.0, 10);
        assert_eq!(
            m.hint(TripKind::Outstation, &sedan),
            Some(MirroredFare {
                total: 4450.0,
                settled_at_unix_ms: 10
            })
        );
        assert!(m.hint(TripKind::Airport, &sedan).is_none());
        assert!(!m.is_persistent());
    }

    #[test]
    fn persistent_mirror_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let ertiga = VehicleId::new("Ertiga");
        {
            let m = open_mirror_dir(tmp.path().to_path_buf()).unwrap();
            m.record(TripKind::Airport, &ertiga, 2070.0, 42);
            m.flush();
        }
        let m = open_mirror_dir(tmp.path().to_path_buf()).unwrap();
        assert!(m.is_persistent());
        let hint = m.hint(TripKind::Airport, &VehicleId::new("ertiga")).unwrap();
        assert_eq!(hint.total, 2070.0);
        m.clear();
        assert!(m.hint(TripKind::Airport, &ertiga).is_none());
    }

    #[test]
    fn non_positive_totals_are_not_mirrored() {
        let m = FareMirror::in_memory();
        let v = VehicleId::new("sedan");
        m.record(TripKind::Local, &v, 0.0, 1);
        m.record(TripKind::Local, &v, f64::NAN, 2);
        assert!(m.hint(TripKind::Local, &v).is_none());
    }
}
