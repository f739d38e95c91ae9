//! Common imports
//!
//! ```rust
//! use graylog_exceptions::prelude::*;
//! ```

pub use crate::config::{Config, Level};
pub use crate::environment::{ReportedException, RequestContext};
pub use crate::error::ReportError;
pub use crate::event::{AsException, ExceptionEvent};
pub use crate::middleware::ExceptionNotifier;
pub use crate::reporter::Reporter;
