use std::sync::Arc;

use parking_lot::RwLock;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter, Layer, Registry};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "colloquy_llm" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// Emit one JSON object per line instead of compact text.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::WARN,
            module_levels: Vec::new(),
            json: false,
        }
    }
}

/// Handle on the installed subscriber. Keep it alive for the life of the
/// process to retain runtime level control.
pub struct TelemetryGuard {
    base_level: Level,
    level_filter: Arc<RwLock<Vec<(String, Level)>>>,
    reload: Option<reload::Handle<EnvFilter, Registry>>,
}

impl TelemetryGuard {
    /// Change the log level for a specific module at runtime.
    pub fn set_module_level(&self, module: &str, level: Level) {
        let directives = {
            let mut levels = self.level_filter.write();
            if let Some(entry) = levels.iter_mut().find(|(m, _)| m == module) {
                entry.1 = level;
            } else {
                levels.push((module.to_string(), level));
            }
            filter_directives(self.base_level, &levels)
        };
        if let Some(handle) = &self.reload {
            if let Err(e) = handle.reload(EnvFilter::new(directives)) {
                tracing::warn!(error = %e, "failed to reload log filter");
            }
        }
    }

    /// Get current per-module log level overrides.
    pub fn module_levels(&self) -> Vec<(String, Level)> {
        self.level_filter.read().clone()
    }
}

/// Build an `EnvFilter` directive string: the base level followed by one
/// `module=level` entry per override.
pub fn filter_directives(base: Level, modules: &[(String, Level)]) -> String {
    let mut out = base.to_string().to_lowercase();
    for (module, level) in modules {
        out.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
    }
    out
}

/// Initialize the telemetry subsystem. Call once at startup.
///
/// Logs go to stderr so stdout stays free for streamed replies. If a global
/// subscriber is already installed the existing one is kept and runtime
/// level changes become no-ops.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let level_filter = Arc::new(RwLock::new(config.module_levels.clone()));

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(filter_directives(config.log_level, &config.module_levels))
    });
    let (filter_layer, handle) = reload::Layer::new(env_filter);

    let fmt_layer = if config.json {
        fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        fmt::layer()
            .compact()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed()
    };

    let installed = tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .try_init()
        .is_ok();

    TelemetryGuard {
        base_level: config.log_level,
        level_filter,
        reload: installed.then_some(handle),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives_base_only() {
        assert_eq!(filter_directives(Level::INFO, &[]), "info");
    }

    #[test]
    fn directives_with_modules() {
        let modules = vec![
            ("colloquy_llm".to_string(), Level::DEBUG),
            ("reqwest".to_string(), Level::ERROR),
        ];
        assert_eq!(
            filter_directives(Level::WARN, &modules),
            "warn,colloquy_llm=debug,reqwest=error"
        );
    }

    #[test]
    fn guard_tracks_module_levels() {
        let guard = init_telemetry(TelemetryConfig {
            module_levels: vec![("colloquy_engine".into(), Level::INFO)],
            ..Default::default()
        });
        guard.set_module_level("colloquy_engine", Level::TRACE);
        guard.set_module_level("colloquy_store", Level::DEBUG);

        let levels = guard.module_levels();
        assert_eq!(levels.len(), 2);
        assert_eq!(levels[0], ("colloquy_engine".to_string(), Level::TRACE));
        assert_eq!(levels[1], ("colloquy_store".to_string(), Level::DEBUG));
    }
}
