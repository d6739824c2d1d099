//! # Report Harness
//!
//! Report execution, connection pooling, and cron scheduling core for a
//! reporting dashboard.
//!
//! ## Architecture
//!
//! ```text
//!  HTTP / CLI ──▶ ReportPipeline ──▶ Retriever ──┬─▶ spreadsheet / delimited files
//!                      │                         └─▶ ConnectionManager ─▶ sqlx pools
//!                      ▼
//!                 projection (select + group/reduce)
//!
//!  Scheduler ── cron tick ──▶ HandlerRegistry ──▶ REPORT_GENERATION ──▶ ReportPipeline
//!      ▲
//!      └── Store (SQLite): sources, reports, schedules, report runs
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! rpt init                      # create database
//! rpt load catalog.toml         # register sources, reports, schedules
//! rpt run sales-by-region       # execute a report
//! rpt serve                     # start HTTP server + scheduler
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Typed report errors |
//! | [`connection`] | Cached, single-flight relational connection manager |
//! | [`engines`] | PostgreSQL and MySQL drivers |
//! | [`retrieve`] | Retrieval adapters per source kind |
//! | [`projection`] | Column selection and grouped aggregation |
//! | [`pipeline`] | Retrieve + project for one report |
//! | [`cron`] | Cron expression parsing |
//! | [`scheduler`] | Cron-driven task execution |
//! | [`store`] | Persistence trait and backends |
//! | [`catalog`] | TOML catalog loading |
//! | [`server`] | HTTP API |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod catalog;
pub mod config;
pub mod connection;
pub mod cron;
pub mod db;
pub mod engines;
pub mod error;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod projection;
pub mod report_cmd;
pub mod retrieve;
pub mod schedule_cmd;
pub mod scheduler;
pub mod server;
pub mod sources;
pub mod store;
