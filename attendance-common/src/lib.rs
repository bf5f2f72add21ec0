pub mod classify;
pub mod directory;
pub mod health;
pub mod ingest;
pub mod metrics;
pub mod model;
pub mod normalize;
pub mod reconcile;
pub mod store;
pub mod time;
pub mod vendor;

#[cfg(test)]
pub(crate) mod test_support;
