pub mod cache;
pub mod clock;
pub mod compute;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod mirror;
pub mod reconcile;
pub mod schedule;
pub mod scheduler;
pub mod transport;
pub mod vehicle;

#[cfg(test)]
pub(crate) mod test_support;
