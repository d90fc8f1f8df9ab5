//! Payslip extraction pipeline: job lifecycle, extraction worker, review,
//! conflict resolution and anomaly bookkeeping over SQLite.

pub mod anomalies;
pub mod config;
pub mod conflicts;
pub mod db;
pub mod inference;
pub mod jobs;
pub mod meta;
pub mod model;
pub mod normalize;
pub mod review;
pub mod storage;
pub mod worker;
