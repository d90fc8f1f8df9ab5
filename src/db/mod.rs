//! SQLite persistence.
//!
//! `model` holds the structs written by inserts and returned by aggregates;
//! `repo` holds the queries. Both are re-exported here, so callers write
//! `db::fetch_job` and `db::NewJob`.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{NewAnomaly, NewJob, NewPayslip, PayslipTotals};
