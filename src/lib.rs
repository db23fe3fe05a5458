//! Trilha: a patient-case pipeline engine with a live Kanban board.
//!
//! Cases move through fifteen stages from intake to discharge. Each stage
//! module validates and saves its own action; the [`pipeline::transition`]
//! coordinator persists the result and runs session side effects, and
//! [`pipeline::board`] keeps a per-view projection current.

pub mod config;
pub mod errors;
pub mod logging;
pub mod pipeline;
pub mod server;
