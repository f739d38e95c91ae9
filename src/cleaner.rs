//! Backtrace cleaning
//!
//! A [`TraceCleaner`] holds an ordered list of filters (line rewrites) and an
//! ordered list of silencers (line predicates). Every line goes through all
//! filters in registration order, then is dropped if any silencer matches.
//! With no silencer registered nothing is dropped.
//!
//! [`TraceCleaner::with_defaults`] builds the cleaner used by the reporter:
//! it shortens project paths, rewrites installed-package paths into
//! `name (version) rest` and keeps only application and dependency frames.

use regex::Regex;
use std::path::PathBuf;

use crate::error::ReportError;

type Filter = Box<dyn Fn(&str) -> String + Send + Sync>;
type Silencer = Box<dyn Fn(&str) -> bool + Send + Sync>;

/// Top-level project directories whose frames are application code
pub const DEFAULT_APP_DIRS: &[&str] = &["app", "config", "lib", "test", "src", "tests"];

const RENDER_TEMPLATE_PATTERN: &str = r":in `_render_template_\w*'";
const BUNDLER_GEMS_PATTERN: &str = r".*bundler/gems";
/// Output of the package rewrite: `name (version) `
const CANONICAL_PACKAGE_PATTERN: &str = r"^[^\s/()]+ \([\w.\-+]+\) ";
/// A relative source path with a line number, left behind by the root filter
const RELATIVE_SOURCE_PATTERN: &str = r"^[\w\-][\w.\-]*(/[\w.\-]+)*\.\w+:\d+";

/// Which lines [`TraceCleaner::clean_with`] returns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CleanKind {
    /// Filtered lines that no silencer rejects
    #[default]
    Silent,
    /// Filtered lines that some silencer rejects
    Noise,
    /// Every filtered line
    All,
}

/// Inputs of the default filter and silencer set
#[derive(Debug, Clone, Default)]
pub struct CleanerOptions {
    /// Project root stripped from the start of each line
    pub root: Option<String>,

    /// Search paths holding `gems/<name>-<version>/` directories
    pub gem_paths: Vec<String>,

    /// Cargo home holding `registry/src/<index>/<name>-<version>/` directories
    pub cargo_home: Option<String>,

    /// Service identifier kept when it appears above a `/service` or `/worker` path
    pub service_name: Option<String>,

    /// Application directories; empty means [`DEFAULT_APP_DIRS`]
    pub app_dirs: Vec<String>,
}

impl CleanerOptions {
    /// Options from the process environment
    ///
    /// Root is the current directory, gem paths come from `GEM_PATH` and
    /// `GEM_HOME`, cargo home from `CARGO_HOME` or `$HOME/.cargo`.
    pub fn from_env() -> Self {
        let root = std::env::current_dir()
            .ok()
            .map(|dir| dir.to_string_lossy().into_owned())
            .filter(|dir| dir != "/");

        let mut gem_paths: Vec<String> = std::env::var("GEM_PATH")
            .map(|paths| {
                paths
                    .split(':')
                    .filter(|p| !p.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        if let Ok(home) = std::env::var("GEM_HOME") {
            if !home.is_empty() && !gem_paths.contains(&home) {
                gem_paths.push(home);
            }
        }

        let cargo_home = std::env::var("CARGO_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|home| PathBuf::from(home).join(".cargo")))
            .map(|path| path.to_string_lossy().into_owned());

        Self {
            root,
            gem_paths,
            cargo_home,
            service_name: None,
            app_dirs: Vec::new(),
        }
    }

    pub fn with_root(mut self, root: impl Into<String>) -> Self {
        self.root = Some(root.into());
        self
    }

    pub fn with_gem_paths<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        self.gem_paths = paths.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = Some(name.into());
        self
    }
}

/// Ordered filter/silencer pipeline over backtrace lines
#[derive(Default)]
pub struct TraceCleaner {
    filters: Vec<Filter>,
    silencers: Vec<Silencer>,
}

impl std::fmt::Debug for TraceCleaner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceCleaner")
            .field("filters", &self.filters.len())
            .field("silencers", &self.silencers.len())
            .finish()
    }
}

impl TraceCleaner {
    /// Cleaner with no rules: every line passes through unchanged
    pub fn new() -> Self {
        Self::default()
    }

    /// Cleaner with the default filters and silencer
    pub fn with_defaults(options: &CleanerOptions) -> Result<Self, ReportError> {
        let mut cleaner = Self::new();

        if let Some(root) = options.root.as_deref().filter(|r| !r.is_empty()) {
            let prefix = format!("{}/", root.trim_end_matches('/'));
            cleaner.add_filter(move |line| match line.strip_prefix(prefix.as_str()) {
                Some(rest) => rest.to_string(),
                None => line.to_string(),
            });
        }

        let render_template = compile(RENDER_TEMPLATE_PATTERN)?;
        cleaner.add_filter(move |line| render_template.replace(line, "").into_owned());

        cleaner.add_filter(|line| line.replacen("./", "/", 1));

        let gem_paths: Vec<&str> = options
            .gem_paths
            .iter()
            .map(|p| p.trim_end_matches('/'))
            .filter(|p| !p.is_empty())
            .collect();
        if !gem_paths.is_empty() {
            let gems = compile(&format!(
                r"({})/gems/([^/]+)-([\w.]+)/(.*)",
                alternation(&gem_paths)
            ))?;
            cleaner.add_filter(move |line| gems.replace(line, "${2} (${3}) ${4}").into_owned());
        }

        if let Some(cargo_home) = options.cargo_home.as_deref().map(|p| p.trim_end_matches('/')) {
            if !cargo_home.is_empty() {
                let crates = compile(&format!(
                    r"{}/registry/src/[^/]+/([^/]+)-(\d[\w.\-+]*)/(.*)",
                    regex::escape(cargo_home)
                ))?;
                cleaner.add_filter(move |line| crates.replace(line, "${1} (${2}) ${3}").into_owned());
            }
        }

        let app_dirs: Vec<&str> = if options.app_dirs.is_empty() {
            DEFAULT_APP_DIRS.to_vec()
        } else {
            options.app_dirs.iter().map(String::as_str).collect()
        };
        let app_source = compile(&format!(r"^/?({})/", alternation(&app_dirs)))?;
        let bundler_gems = compile(BUNDLER_GEMS_PATTERN)?;
        let canonical_package = compile(CANONICAL_PACKAGE_PATTERN)?;
        let relative_source = match options.root {
            Some(_) => Some(compile(RELATIVE_SOURCE_PATTERN)?),
            None => None,
        };
        let service = match options.service_name.as_deref().filter(|s| !s.is_empty()) {
            Some(name) => Some(compile(&format!(
                r".*{}.*/(service|worker)",
                regex::escape(name)
            ))?),
            None => None,
        };

        cleaner.add_silencer(move |line| {
            let keep = app_source.is_match(line)
                || bundler_gems.is_match(line)
                || canonical_package.is_match(line)
                || relative_source.as_ref().is_some_and(|re| re.is_match(line))
                || service.as_ref().is_some_and(|re| re.is_match(line));
            !keep
        });

        Ok(cleaner)
    }

    /// Append a rewrite applied to every line, after the existing ones
    pub fn add_filter<F>(&mut self, filter: F) -> &mut Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        self.filters.push(Box::new(filter));
        self
    }

    /// Append a predicate; a line for which it returns `true` is dropped
    pub fn add_silencer<F>(&mut self, silencer: F) -> &mut Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.silencers.push(Box::new(silencer));
        self
    }

    pub fn remove_filters(&mut self) -> &mut Self {
        self.filters.clear();
        self
    }

    pub fn remove_silencers(&mut self) -> &mut Self {
        self.silencers.clear();
        self
    }

    /// Filter every line and drop the silenced ones, keeping order
    pub fn clean<S: AsRef<str>>(&self, lines: &[S]) -> Vec<String> {
        self.clean_with(lines, CleanKind::Silent)
    }

    pub fn clean_with<S: AsRef<str>>(&self, lines: &[S], kind: CleanKind) -> Vec<String> {
        lines
            .iter()
            .map(|line| self.filter(line.as_ref()))
            .filter(|line| match kind {
                CleanKind::All => true,
                CleanKind::Silent => !self.is_silenced(line),
                CleanKind::Noise => self.is_silenced(line),
            })
            .collect()
    }

    fn filter(&self, line: &str) -> String {
        self.filters
            .iter()
            .fold(line.to_string(), |line, filter| filter(&line))
    }

    fn is_silenced(&self, line: &str) -> bool {
        self.silencers.iter().any(|silencer| silencer(line))
    }
}

fn compile(pattern: &str) -> Result<Regex, ReportError> {
    Regex::new(pattern).map_err(|e| ReportError::InvalidConfig(format!("bad pattern {pattern:?}: {e}")))
}

fn alternation(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|p| regex::escape(p))
        .collect::<Vec<_>>()
        .join("|")
}
