//! Reporter and leveled API
//!
//! A [`Reporter`] owns everything a report needs: the immutable
//! configuration, the message builder and the delivery channel. The capture
//! middleware and the `debug`/`info`/`warning`/`error` calls share its
//! [`Reporter::report`] path.

use actix_web::{dev::Payload, FromRequest, HttpMessage, HttpRequest};
use futures::future::{err, ok, Ready};
use std::sync::Arc;
use std::time::Duration;

use crate::builder::MessageBuilder;
use crate::cleaner::{CleanerOptions, TraceCleaner};
use crate::config::{Config, Level};
use crate::delivery::{DeliveryChannel, StatsSnapshot};
use crate::environment::{Environment, MESSAGE_KEY};
use crate::error::ReportError;
use crate::event::{AsException, ExceptionEvent};
use crate::notifier::notifier_for;

/// Handle to one reporting pipeline; clones share it
#[derive(Debug, Clone)]
pub struct Reporter {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    config: Arc<Config>,
    builder: MessageBuilder,
    channel: DeliveryChannel,
}

impl Reporter {
    /// Reporter with the default trace cleaner and the configured transport
    ///
    /// The delivery worker is started by the first report.
    pub fn new(config: Config) -> Self {
        let cleaner = TraceCleaner::with_defaults(&CleanerOptions::from_env()).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "default trace cleaner rules rejected, backtraces will not be cleaned");
            TraceCleaner::new()
        });
        let channel = DeliveryChannel::lazy(notifier_for(&config), config.queue_capacity);
        Self::with_parts(config, cleaner, channel)
    }

    pub fn with_parts(config: Config, cleaner: TraceCleaner, channel: DeliveryChannel) -> Self {
        let config = config.into_arc();
        let builder = MessageBuilder::new(Arc::clone(&config), Arc::new(cleaner));
        Self {
            inner: Arc::new(Inner {
                config,
                builder,
                channel,
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Build a record for `event` and queue it for delivery
    pub fn report(&self, event: &ExceptionEvent, env: &Environment, level: Level) -> Result<(), ReportError> {
        let record = self.inner.builder.build(event, env, level);
        tracing::debug!(
            category = %event.category,
            level = level.as_str(),
            short_message = %record.short_message,
            "queueing diagnostic record"
        );
        self.inner.channel.submit(record)
    }

    /// Report `event` at the configured default level
    pub fn capture(&self, event: &ExceptionEvent, env: &Environment) -> Result<(), ReportError> {
        self.report(event, env, self.inner.config.level)
    }

    pub fn debug(&self, category: &str, message: &str, cause: Option<&dyn AsException>) -> Result<(), ReportError> {
        self.log(Level::Debug, category, message, cause)
    }

    pub fn info(&self, category: &str, message: &str, cause: Option<&dyn AsException>) -> Result<(), ReportError> {
        self.log(Level::Informational, category, message, cause)
    }

    pub fn warning(&self, category: &str, message: &str, cause: Option<&dyn AsException>) -> Result<(), ReportError> {
        self.log(Level::Warning, category, message, cause)
    }

    pub fn error(&self, category: &str, message: &str, cause: Option<&dyn AsException>) -> Result<(), ReportError> {
        self.log(Level::Error, category, message, cause)
    }

    /// Report a message at `level` from application code
    ///
    /// With a `cause` the record carries the cause's message and backtrace;
    /// without one the current call stack is used. The environment bound to
    /// the current request, if any, is included along with `message`.
    ///
    /// Always returns `Ok(())` unless `raise_on_report` is set, in which case
    /// nothing is queued and [`ReportError::Raised`] is returned instead.
    pub fn log(
        &self,
        level: Level,
        category: &str,
        message: &str,
        cause: Option<&dyn AsException>,
    ) -> Result<(), ReportError> {
        if self.inner.config.raise_on_report {
            return Err(ReportError::Raised {
                category: category.to_string(),
                message: message.to_string(),
                cause: cause.map(|cause| cause.to_event().message),
            });
        }

        let event = match cause {
            Some(cause) => cause.to_event(),
            None => ExceptionEvent::synthesized(message),
        };

        let mut env = Environment::current();
        env.insert(MESSAGE_KEY, message);

        if let Err(e) = self.report(&event, &env, level) {
            let e = ReportError::reporting_api(format!("could not report {category} message"), Some(Box::new(e)));
            tracing::error!(kind = e.kind(), error = %e, category, "leveled report failed");
        }
        Ok(())
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.channel.stats()
    }

    /// Wait until every queued record has been handed to the notifier
    pub fn flush(&self, timeout: Duration) -> bool {
        self.inner.channel.wait_until_idle(timeout)
    }

    /// Deliver what is queued and stop the delivery worker
    pub fn shutdown(&self) {
        self.inner.channel.shutdown();
    }
}

/// Handlers can take the reporter installed by the middleware directly
///
/// Extracting it also folds the request's [`RequestContext`] into the
/// environment of the current request, so leveled calls made by the handler
/// see context set by layers the middleware wraps.
///
/// [`RequestContext`]: crate::environment::RequestContext
impl FromRequest for Reporter {
    type Error = actix_web::Error;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        let reporter = req.extensions().get::<Reporter>().cloned();
        match reporter {
            Some(reporter) => {
                Environment::refresh_current(req);
                ok(reporter)
            }
            None => {
                tracing::error!(path = req.path(), "no Reporter in request, is ExceptionNotifier installed?");
                err(actix_web::error::ErrorInternalServerError("exception reporter not configured"))
            }
        }
    }
}
