//! # graylog-exceptions
//!
//! Exception reporting middleware for Actix-Web applications.
//!
//! Failures seen while serving a request are turned into diagnostic records
//! (cleaned backtrace, whitelisted request environment, severity) and shipped
//! to a Graylog server as GELF. Reporting is a pure side effect:
//!
//! - **Non-blocking**: records are queued and sent by one background thread
//! - **Fail-safe**: a reporting or delivery failure is logged and dropped,
//!   it never changes the response or the error the application returned
//! - **Isolated**: every request gets its own copy of the environment
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use actix_web::{web, App, HttpResponse, HttpServer};
//! use graylog_exceptions::{Config, ExceptionNotifier, Reporter};
//!
//! async fn orders(reporter: Reporter) -> HttpResponse {
//!     let _ = reporter.warning("Orders", "low stock", None);
//!     HttpResponse::Ok().finish()
//! }
//!
//! #[actix_web::main]
//! async fn main() -> std::io::Result<()> {
//!     let notifier = ExceptionNotifier::new(Config::new("graylog.internal", 12201));
//!
//!     HttpServer::new(move || {
//!         App::new()
//!             .wrap(notifier.clone())
//!             .route("/orders", web::get().to(orders))
//!     })
//!     .bind("0.0.0.0:8080")?
//!     .run()
//!     .await
//! }
//! ```
//!
//! ## Configuration
//!
//! Build a [`Config`] in code, from a key/value map ([`Config::from_args`],
//! unknown keys become extra GELF fields) or from `GRAYLOG_*` environment
//! variables ([`Config::from_env`]). Setting `raise_on_report` switches the
//! leveled API to test mode: calls return [`ReportError::Raised`] instead of
//! sending anything.
//!
//! ## Architecture
//!
//! - `middleware`: Actix-Web capture middleware
//! - `reporter`: shared report path and the `debug`/`info`/`warning`/`error` API
//! - `event`: exception events and native backtraces
//! - `environment`: per-request environment snapshot
//! - `cleaner`: backtrace filtering and silencing
//! - `builder`: diagnostic record assembly
//! - `record`: the record and its GELF form
//! - `delivery`: bounded queue and delivery worker
//! - `notifier`: GELF over UDP and HTTP
//! - `config`: configuration and severity levels
//! - `error`: error taxonomy
//! - `utils`: hostnames, timestamps, ids, truncation

pub mod builder;
pub mod cleaner;
pub mod config;
pub mod delivery;
pub mod environment;
pub mod error;
pub mod event;
pub mod middleware;
pub mod notifier;
pub mod prelude;
pub mod record;
pub mod reporter;
pub mod utils;

pub use config::{Config, Level};
pub use environment::{Environment, ReportedException, RequestContext};
pub use error::ReportError;
pub use event::{AsException, ExceptionEvent};
pub use middleware::ExceptionNotifier;
pub use reporter::Reporter;
