//! Exception events and native stack traces
//!
//! An [`ExceptionEvent`] is what the reporter knows about one failure: a
//! category, a message and the raw backtrace lines. Events come from real
//! errors (actix errors, `anyhow` errors, panics) or are synthesized by the
//! leveled API from a message and the current call stack.

use serde::Serialize;
use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::cell::Cell;
use std::sync::Once;

/// Category of events synthesized without an underlying error
pub const SYNTHESIZED_CATEGORY: &str = "NO_EXCEPTION_GIVEN";

/// Category of events built from a caught panic
pub const PANIC_CATEGORY: &str = "panic";

/// Leading frames that belong to the capture machinery, not the caller
const CAPTURE_FRAME_PREFIXES: &[&str] = &[
    "std::backtrace",
    "backtrace::",
    "graylog_exceptions::event::capture_backtrace",
    "graylog_exceptions::event::install_panic_hook",
    "graylog_exceptions::event::ExceptionEvent",
    "graylog_exceptions::reporter::Reporter",
    "graylog_exceptions::middleware::ExceptionNotifierService",
    // panic plumbing between the hook and the panicking frame
    "std::panicking::",
    "std::panic::",
    "std::rt::begin_panic",
    "std::sys::",
    "std::sys_common::",
    "core::panicking::",
    "core::panic::",
    "core::result::unwrap_failed",
    "core::option::unwrap_failed",
    "core::option::expect_failed",
    "alloc::boxed::",
    "rust_begin_unwind",
    "__rustc::",
    // async plumbing between the middleware and whatever polls it
    "core::pin::",
    "core::future::",
    "futures_util::",
    "tokio::task::task_local",
];

thread_local! {
    /// Message and call stack of the last panic seen by the hook on this thread
    static PANIC_TRACE: Cell<Option<(String, Vec<String>)>> = const { Cell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

/// Chain a panic hook that records where each panic happened
///
/// A caught panic payload carries no backtrace, and by the time it is caught
/// the panicking frames are gone. The hook captures the stack while they
/// still exist; [`ExceptionEvent::from_panic`] picks it up on the same
/// thread. The previous hook still runs. Installing twice is a no-op.
pub fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let trace = (panic_message(info.payload()), capture_backtrace());
            let _ = PANIC_TRACE.try_with(|slot| slot.set(Some(trace)));
            previous(info);
        }));
    });
}

/// Stack recorded by the hook for the panic carrying `message`
fn take_panic_trace(message: &str) -> Option<Vec<String>> {
    PANIC_TRACE
        .try_with(Cell::take)
        .ok()
        .flatten()
        .filter(|(seen, _)| seen == message)
        .map(|(_, trace)| trace)
}

/// One failure as seen by the reporter
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExceptionEvent {
    pub category: String,
    pub message: String,
    pub backtrace: Vec<String>,
}

impl ExceptionEvent {
    pub fn new(category: impl Into<String>, message: impl Into<String>, backtrace: Vec<String>) -> Self {
        Self {
            category: category.into(),
            message: message.into(),
            backtrace,
        }
    }

    /// Event for a report with no underlying error, traced from the caller
    pub fn synthesized(message: impl Into<String>) -> Self {
        Self::new(SYNTHESIZED_CATEGORY, message, capture_backtrace())
    }

    /// Event for any `std::error::Error`, traced from the call site
    ///
    /// The category is the error's type name without its module path.
    pub fn from_error<E: std::error::Error + ?Sized>(err: &E) -> Self {
        Self::new(short_type_name::<E>(), err.to_string(), capture_backtrace())
    }

    /// Event for an `anyhow::Error`, using the backtrace it captured if any
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        let backtrace = match err.backtrace().status() {
            BacktraceStatus::Captured => backtrace_lines(&err.backtrace().to_string()),
            _ => capture_backtrace(),
        };
        Self::new("anyhow::Error", err.to_string(), backtrace)
    }

    /// Event for an error returned by an actix service
    pub fn from_actix(err: &actix_web::Error) -> Self {
        let status = err.as_response_error().status_code();
        Self::new(format!("HTTP {status}"), err.to_string(), capture_backtrace())
    }

    /// Event for a caught panic payload
    ///
    /// Traced from the panic site when [`install_panic_hook`] ran, from the
    /// catching frame otherwise.
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = panic_message(payload);
        let backtrace = take_panic_trace(&message).unwrap_or_else(capture_backtrace);
        Self::new(PANIC_CATEGORY, message, backtrace)
    }
}

/// Anything the reporter can turn into an [`ExceptionEvent`]
pub trait AsException {
    fn to_event(&self) -> ExceptionEvent;
}

impl AsException for ExceptionEvent {
    fn to_event(&self) -> ExceptionEvent {
        self.clone()
    }
}

impl AsException for anyhow::Error {
    fn to_event(&self) -> ExceptionEvent {
        ExceptionEvent::from_anyhow(self)
    }
}

impl AsException for actix_web::Error {
    fn to_event(&self) -> ExceptionEvent {
        ExceptionEvent::from_actix(self)
    }
}

/// Current call stack as backtrace lines, capture frames skipped
pub fn capture_backtrace() -> Vec<String> {
    let rendered = Backtrace::force_capture().to_string();
    parse_frames(&rendered)
        .into_iter()
        .skip_while(Frame::is_capture_frame)
        .map(|frame| frame.to_line())
        .collect()
}

/// Backtrace lines from a rendered `std::backtrace::Backtrace`
pub fn backtrace_lines(rendered: &str) -> Vec<String> {
    parse_frames(rendered).iter().map(Frame::to_line).collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Frame {
    symbol: String,
    location: Option<(String, u32)>,
}

impl Frame {
    fn is_capture_frame(&self) -> bool {
        let symbol = self.symbol.trim_start_matches('<');
        CAPTURE_FRAME_PREFIXES
            .iter()
            .any(|prefix| symbol.starts_with(prefix))
            || symbol.contains(" as graylog_exceptions::event::AsException>")
    }

    /// `file:line:in `symbol'`, or the bare symbol without a location
    fn to_line(&self) -> String {
        match &self.location {
            Some((file, line)) => format!("{file}:{line}:in `{}'", self.symbol),
            None => self.symbol.clone(),
        }
    }
}

/// Parse the std rendering:
///
/// ```text
///    3: shop::checkout
///              at ./src/checkout.rs:42:9
/// ```
fn parse_frames(rendered: &str) -> Vec<Frame> {
    let mut frames: Vec<Frame> = Vec::new();

    for line in rendered.lines() {
        let line = line.trim();
        if let Some(location) = line.strip_prefix("at ") {
            if let Some(frame) = frames.last_mut() {
                frame.location = parse_location(location);
            }
            continue;
        }
        if let Some((index, symbol)) = line.split_once(": ") {
            if !index.is_empty() && index.chars().all(|c| c.is_ascii_digit()) {
                frames.push(Frame {
                    symbol: symbol.trim().to_string(),
                    location: None,
                });
            }
        }
    }

    frames
}

/// `path:line:column` or `path:line`
fn parse_location(location: &str) -> Option<(String, u32)> {
    let mut parts = location.rsplitn(3, ':');
    let last = parts.next()?;
    let middle = parts.next()?;
    match parts.next() {
        Some(file) => middle.parse().ok().map(|line| (file.to_string(), line)),
        None => last.parse().ok().map(|line| (middle.to_string(), line)),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}

fn short_type_name<T: ?Sized>() -> String {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const RENDERED: &str = "   0: std::backtrace_rs::backtrace::libunwind::trace
             at /rustc/90b35a6239c3d8bdabc530a6a0816f7ff89a0aaf/library/std/src/../../backtrace/src/backtrace/libunwind.rs:116:5
   1: std::backtrace::Backtrace::create
             at /rustc/90b35a6239c3d8bdabc530a6a0816f7ff89a0aaf/library/std/src/backtrace.rs:331:13
   2: graylog_exceptions::event::capture_backtrace
             at ./src/event.rs:97:20
   3: shop::checkout
             at ./src/checkout.rs:42:9
   4: std::rt::lang_start_internal
   5: main";

    #[derive(Debug)]
    struct ChargeError;

    impl std::fmt::Display for ChargeError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("card declined")
        }
    }

    impl std::error::Error for ChargeError {}

    #[test]
    fn test_parse_frames() {
        let frames = parse_frames(RENDERED);
        assert_eq!(frames.len(), 6);
        assert_eq!(frames[3].symbol, "shop::checkout");
        assert_eq!(frames[3].location, Some(("./src/checkout.rs".to_string(), 42)));
        assert_eq!(frames[4].location, None);
    }

    #[test]
    fn test_backtrace_lines_format() {
        let lines = backtrace_lines(RENDERED);
        assert_eq!(lines[3], "./src/checkout.rs:42:in `shop::checkout'");
        assert_eq!(lines[5], "main");
    }

    #[test]
    fn test_capture_frames_are_skipped() {
        let kept: Vec<String> = parse_frames(RENDERED)
            .into_iter()
            .skip_while(Frame::is_capture_frame)
            .map(|frame| frame.to_line())
            .collect();
        assert_eq!(kept[0], "./src/checkout.rs:42:in `shop::checkout'");
        assert_eq!(kept.len(), 3);
    }

    #[test]
    fn test_middleware_and_panic_frames_are_skipped() {
        let rendered = "   0: std::backtrace::Backtrace::force_capture
   1: graylog_exceptions::event::install_panic_hook::{{closure}}
   2: <alloc::boxed::Box<F,A> as core::ops::function::Fn<Args>>::call
             at /rustc/90b35a6239c3d8bdabc530a6a0816f7ff89a0aaf/library/alloc/src/boxed.rs:2029:9
   3: std::panicking::rust_panic_with_hook
   4: std::panicking::begin_panic_handler::{{closure}}
   5: std::sys::backtrace::__rust_end_short_backtrace
   6: rust_begin_unwind
   7: core::panicking::panic_fmt
   8: <graylog_exceptions::middleware::ExceptionNotifierService<S> as actix_service::Service<actix_web::service::ServiceRequest>>::call::{{closure}}
             at ./src/middleware.rs:111:54
   9: <actix_web::error::error::Error as graylog_exceptions::event::AsException>::to_event
  10: <core::pin::Pin<P> as core::future::future::Future>::poll
  11: shop::orders::create::{{closure}}
             at ./src/orders.rs:17:5
  12: graylog_exceptions::middleware::tests::ledger_panic::{{closure}}";

        let kept: Vec<String> = parse_frames(rendered)
            .into_iter()
            .skip_while(Frame::is_capture_frame)
            .map(|frame| frame.to_line())
            .collect();
        assert_eq!(kept[0], "./src/orders.rs:17:in `shop::orders::create::{{closure}}'");
        // only leading frames are skipped; test handlers in the crate are kept
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn test_panic_trace_comes_from_the_panic_site() {
        install_panic_hook();
        install_panic_hook();

        fn settle_ledger() {
            panic!("ledger out of balance");
        }
        let payload = std::panic::catch_unwind(settle_ledger).unwrap_err();
        let event = ExceptionEvent::from_panic(payload.as_ref());

        assert_eq!(event.message, "ledger out of balance");
        assert!(event.backtrace.iter().any(|line| line.contains("settle_ledger")));
        assert!(event
            .backtrace
            .iter()
            .all(|line| !line.contains("install_panic_hook")));
        // the recorded stack is used once
        assert_eq!(take_panic_trace("ledger out of balance"), None);
    }

    #[test]
    fn test_stale_panic_trace_is_ignored() {
        PANIC_TRACE.with(|slot| slot.set(Some(("other panic".to_string(), vec!["stale".to_string()]))));
        let payload: Box<dyn Any + Send> = Box::new("fresh panic");
        let event = ExceptionEvent::from_panic(payload.as_ref());
        assert!(!event.backtrace.contains(&"stale".to_string()));
    }

    #[test]
    fn test_disabled_backtrace_has_no_frames() {
        assert!(backtrace_lines("disabled backtrace").is_empty());
    }

    #[test]
    fn test_parse_location_without_column() {
        assert_eq!(parse_location("src/lib.rs:7"), Some(("src/lib.rs".to_string(), 7)));
        assert_eq!(parse_location("nowhere"), None);
    }

    #[test]
    fn test_synthesized_event() {
        let event = ExceptionEvent::synthesized("cache warmed");
        assert_eq!(event.category, SYNTHESIZED_CATEGORY);
        assert_eq!(event.message, "cache warmed");
        assert!(event
            .backtrace
            .iter()
            .all(|line| !line.contains("graylog_exceptions::event::capture_backtrace")));
    }

    #[test]
    fn test_from_error_uses_type_name() {
        let event = ExceptionEvent::from_error(&ChargeError);
        assert_eq!(event.category, "ChargeError");
        assert_eq!(event.message, "card declined");
    }

    #[test]
    fn test_from_anyhow() {
        let err = anyhow::anyhow!("connection reset");
        let event = err.to_event();
        assert_eq!(event.category, "anyhow::Error");
        assert_eq!(event.message, "connection reset");
    }

    #[test]
    fn test_from_actix_error() {
        let err = actix_web::error::ErrorBadGateway("upstream down");
        let event = ExceptionEvent::from_actix(&err);
        assert!(event.category.contains("502"));
        assert_eq!(event.message, "upstream down");
    }

    #[test]
    fn test_from_panic_payloads() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(ExceptionEvent::from_panic(payload.as_ref()).message, "boom");

        let payload: Box<dyn Any + Send> = Box::new(String::from("owned boom"));
        let event = ExceptionEvent::from_panic(payload.as_ref());
        assert_eq!(event.category, PANIC_CATEGORY);
        assert_eq!(event.message, "owned boom");

        let payload: Box<dyn Any + Send> = Box::new(42u32);
        assert_eq!(ExceptionEvent::from_panic(payload.as_ref()).message, "Unknown panic");
    }
}
