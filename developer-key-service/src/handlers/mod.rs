pub mod metrics;
pub mod well_known;
