use thiserror::Error;

use super::vehicle::{TripKind, VehicleId};

/// Everything that can go wrong (or degrade) on the way to a displayed fare.
///
/// Cloneable because one coordinator outcome is handed to every waiter.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FareError {
    #[error("network failure: {0}")]
    NetworkFailure(String),

    #[error("malformed fare response: {0}")]
    MalformedResponse(String),

    #[error("no {trip_kind} fare schedule for {vehicle_id}")]
    NoScheduleFound {
        trip_kind: TripKind,
        vehicle_id: VehicleId,
    },

    #[error("using stale fare schedule: {cause}")]
    StaleFallbackUsed { cause: Box<FareError> },

    #[error("fare reconciliation gave up after {attempts} attempts")]
    MaxAttemptsExceeded { attempts: u32 },

    #[error("unknown local package: {0}")]
    UnknownPackage(String),
}

impl FareError {
    pub fn stale(cause: FareError) -> Self {
        Self::StaleFallbackUsed {
            cause: Box::new(cause),
        }
    }
}

impl From<reqwest::Error> for FareError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::MalformedResponse(e.to_string())
        } else {
            Self::NetworkFailure(e.to_string())
        }
    }
}

pub type FareResult<T> = Result<T, FareError>;
