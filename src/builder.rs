//! Message assembly
//!
//! Turns an [`ExceptionEvent`] and the request [`Environment`] into a
//! [`DiagnosticRecord`]. Building never fails: a field that cannot be
//! rendered is logged on the side channel and left out, and the rest of the
//! record is still produced.

use chrono::Utc;
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::cleaner::TraceCleaner;
use crate::config::{Config, Level, UserFormat};
use crate::environment::{Environment, CURRENT_USER_KEY, ENV_WHITELIST};
use crate::error::ReportError;
use crate::event::ExceptionEvent;
use crate::record::DiagnosticRecord;
use crate::utils::{local_hostname, truncate};

/// Short message used when the event carries none
pub const NO_MESSAGE_SENTINEL: &str = "(no message given)";

/// Longest rendered environment value, in characters
const MAX_VALUE_CHARS: usize = 2048;

const ENV_HEADER: &str = ">> MAIN_ENV <<:\n";
const BACKTRACE_HEADER: &str = ">> BACKTRACE <<\n";

/// Builds diagnostic records from events; cheap to clone
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    config: Arc<Config>,
    cleaner: Arc<TraceCleaner>,
    server: String,
}

impl MessageBuilder {
    pub fn new(config: Arc<Config>, cleaner: Arc<TraceCleaner>) -> Self {
        Self {
            config,
            cleaner,
            server: local_hostname(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn build(&self, event: &ExceptionEvent, env: &Environment, level: Level) -> DiagnosticRecord {
        let mut full_message = String::new();
        if !env.is_empty() {
            full_message.push_str(&self.environment_section(env));
        }
        if !event.backtrace.is_empty() {
            full_message.push_str(BACKTRACE_HEADER);
            full_message.push_str(&self.cleaner.clean(&event.backtrace).join("\n"));
            full_message.push('\n');
        }

        let (file, line) = event
            .backtrace
            .first()
            .map(|first| split_location(first))
            .unwrap_or((None, None));

        let short_message = if event.message.is_empty() {
            NO_MESSAGE_SENTINEL.to_string()
        } else {
            event.message.clone()
        };

        DiagnosticRecord {
            short_message,
            full_message,
            facility: self.config.facility.clone(),
            host: self.config.local_app_name.clone(),
            level,
            file,
            line,
            timestamp: Utc::now(),
            extra: self.extra_fields(env),
        }
    }

    /// Whitelisted entries in environment order, then process id and server
    fn environment_section(&self, env: &Environment) -> String {
        let mut section = String::from(ENV_HEADER);

        for (key, value) in env.iter() {
            if !ENV_WHITELIST.contains(&key) {
                continue;
            }
            match self.render_value(key, value) {
                Ok(rendered) => section.push_str(&format!(" * {key}: {rendered}\n")),
                Err(e) => tracing::warn!(key, kind = e.kind(), error = %e, "skipping environment field"),
            }
        }

        section.push_str(&format!(" * Process: {}\n", std::process::id()));
        section.push_str(&format!(" * Server: {}\n", self.server));
        section
    }

    fn render_value(&self, key: &str, value: &Value) -> Result<String, ReportError> {
        let rendered = if key == CURRENT_USER_KEY {
            render_user(value, self.config.user_format)?
        } else {
            render_plain(value)
        };
        Ok(truncate(&rendered, MAX_VALUE_CHARS))
    }

    /// Passthrough environment entries, then configured extras (which win)
    fn extra_fields(&self, env: &Environment) -> Map<String, Value> {
        let mut extra = Map::new();
        for key in &self.config.passthrough_keys {
            if let Some(value) = env.get(key) {
                extra.insert(key.clone(), value.clone());
            }
        }
        for (key, value) in &self.config.extra {
            extra.insert(key.clone(), value.clone());
        }
        extra
    }
}

fn render_plain(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn render_user(value: &Value, format: UserFormat) -> Result<String, ReportError> {
    match (format, value) {
        (_, Value::Null) => Err(ReportError::formatting("current_user is null")),
        (UserFormat::Full, value) => Ok(render_plain(value)),
        (UserFormat::Identifier, Value::Object(user)) => user
            .get("id")
            .filter(|id| !id.is_null())
            .map(render_plain)
            .ok_or_else(|| ReportError::formatting("current_user has no id")),
        (UserFormat::Identifier, Value::String(_) | Value::Number(_)) => Ok(render_plain(value)),
        (UserFormat::Identifier, other) => Err(ReportError::formatting(format!(
            "cannot take an id from current_user {other}"
        ))),
    }
}

/// File and line of a backtrace line
///
/// The line is cut at its last-but-one colon: `path:line:in `symbol'` and
/// `path:line` both yield `(path, line)`. A line without a line number is
/// returned whole as the file.
pub fn split_location(line: &str) -> (Option<String>, Option<u32>) {
    let head = match line.find(":in `") {
        Some(idx) => &line[..idx],
        None => line,
    };

    if let Some((path, number)) = head.rsplit_once(':') {
        if let Ok(number) = number.trim().parse::<u32>() {
            return (Some(path.to_string()), Some(number));
        }
    }

    let mut parts = line.rsplitn(3, ':');
    let _tail = parts.next();
    match (parts.next().map(str::parse::<u32>), parts.next()) {
        (Some(Ok(number)), Some(path)) => (Some(path.to_string()), Some(number)),
        _ => (Some(line.to_string()), None),
    }
}
