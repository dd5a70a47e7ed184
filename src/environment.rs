//! Worker process environment construction.
//!
//! Builds the environment for an extension-host worker from an explicit
//! base snapshot: optional interactive-shell merge, fixed worker-mode
//! overlays, caller overrides, PATH helper prepend and null stripping.
//! The base environment is always passed in, never read from ambient
//! process state, so builds are deterministic and testable.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde_json::json;
use thiserror::Error;
use tracing::warn;

use crate::config::ServerConfig;

/// Environment variable carrying the serialized locale configuration.
pub const ENV_NLS_CONFIG: &str = "EXTHOSTD_NLS_CONFIG";

/// Environment variable selecting piped log forwarding in the worker.
pub const ENV_PIPE_LOGGING: &str = "EXTHOSTD_PIPE_LOGGING";

/// Environment variable naming the worker entry point.
pub const ENV_ENTRY_POINT: &str = "EXTHOSTD_ENTRY";

/// Environment variable enabling verbose worker logging.
pub const ENV_VERBOSE: &str = "EXTHOSTD_VERBOSE";

/// Environment variable enabling stack traces in worker logs.
pub const ENV_LOG_STACK: &str = "EXTHOSTD_LOG_STACK";

/// Environment variable pointing the worker at its control socket.
pub const ENV_CONTROL_SOCKET: &str = "EXTHOSTD_CONTROL_SOCKET";

/// Environment variable carrying the single-use endpoint address
/// (listening-endpoint mode only).
pub const ENV_ENDPOINT: &str = "EXTHOSTD_ENDPOINT";

/// Entry point identifier for extension-host workers.
pub const ENTRY_POINT_EXTENSION_HOST: &str = "extension-host";

/// PATH entry separator.
const PATH_SEPARATOR: char = ':';

/// Best-effort shell environment resolution failure.
///
/// Never fatal: the builder logs it and proceeds with the unmerged base.
#[derive(Debug, Error)]
#[error("Shell environment resolution failed: {0}")]
pub struct ShellEnvError(pub String);

/// Inputs for one environment build.
#[derive(Debug, Default)]
pub struct EnvironmentParams {
    /// Explicit snapshot of the host process environment.
    pub base: HashMap<String, String>,
    /// Resolved interactive-shell environment, if requested. An `Err`
    /// degrades gracefully to the unmerged base.
    pub shell_env: Option<Result<HashMap<String, String>, ShellEnvError>>,
    /// Caller-supplied overrides, applied last. `None` values mark a
    /// variable for explicit removal.
    pub overrides: HashMap<String, Option<String>>,
    /// Client locale, serialized into the NLS configuration.
    pub locale: Option<String>,
    /// Enables verbose/stack-trace worker logging.
    pub debug: bool,
}

/// Immutable worker environment, ordered for deterministic iteration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    vars: BTreeMap<String, String>,
}

impl Environment {
    /// Looks a variable up by exact name.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// Iterates over all variables in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of variables.
    #[must_use]
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    /// Whether the environment is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

/// Builds the process environment for one worker spawn.
///
/// Precedence, lowest to highest: base snapshot, shell environment,
/// fixed worker-mode overlays, caller overrides. PATH prepending, browser
/// helper injection and null stripping run after all layers are merged.
/// Never fails: missing optional inputs and shell-resolution errors
/// degrade gracefully.
#[must_use]
pub fn build_worker_environment(params: EnvironmentParams, config: &ServerConfig) -> Environment {
    let mut vars: BTreeMap<String, Option<String>> = params
        .base
        .into_iter()
        .map(|(k, v)| (k, Some(v)))
        .collect();

    match params.shell_env {
        Some(Ok(shell_env)) => {
            for (key, value) in shell_env {
                vars.insert(key, Some(value));
            }
        }
        Some(Err(e)) => {
            warn!("{e}; continuing with unmerged environment");
        }
        None => {}
    }

    let nls = json!({ "locale": params.locale.as_deref().unwrap_or("en") });
    vars.insert(ENV_NLS_CONFIG.to_string(), Some(nls.to_string()));
    vars.insert(ENV_PIPE_LOGGING.to_string(), Some("true".to_string()));
    vars.insert(
        ENV_ENTRY_POINT.to_string(),
        Some(ENTRY_POINT_EXTENSION_HOST.to_string()),
    );
    if params.debug {
        vars.insert(ENV_VERBOSE.to_string(), Some("true".to_string()));
        vars.insert(ENV_LOG_STACK.to_string(), Some("true".to_string()));
    }

    for (key, value) in params.overrides {
        vars.insert(key, value);
    }

    if let Some(ref helper_dir) = config.helper_dir {
        prepend_to_path(&mut vars, helper_dir);
    }

    if let Some(ref browser) = config.browser_helper {
        if !config.suppress_browser_helper {
            vars.insert(
                "BROWSER".to_string(),
                Some(browser.to_string_lossy().into_owned()),
            );
        }
    }

    let vars = vars
        .into_iter()
        .filter_map(|(k, v)| v.map(|v| (k, v)))
        .collect();

    Environment { vars }
}

/// Prepends `helper_dir` to the PATH-equivalent variable.
///
/// The key is located case-insensitively (platforms vary in PATH casing);
/// the first match in sorted key order wins. Prepending is idempotent: a
/// value already starting with the helper directory is left untouched, so
/// re-building from prior output produces no duplicate prefix.
fn prepend_to_path(vars: &mut BTreeMap<String, Option<String>>, helper_dir: &Path) {
    let helper = helper_dir.to_string_lossy().into_owned();

    let path_key = vars
        .keys()
        .find(|k| k.eq_ignore_ascii_case("PATH"))
        .cloned();

    match path_key {
        Some(key) => {
            let current = vars.get(&key).and_then(Clone::clone).unwrap_or_default();
            if current == helper
                || current.starts_with(&format!("{helper}{PATH_SEPARATOR}"))
            {
                vars.insert(key, Some(current));
            } else if current.is_empty() {
                vars.insert(key, Some(helper));
            } else {
                vars.insert(key, Some(format!("{helper}{PATH_SEPARATOR}{current}")));
            }
        }
        None => {
            vars.insert("PATH".to_string(), Some(helper));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;

    fn base(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn config_with_helper(dir: &str) -> ServerConfig {
        ServerConfig {
            helper_dir: Some(PathBuf::from(dir)),
            ..ServerConfig::default()
        }
    }

    #[test]
    fn test_fixed_overlays_present() {
        let params = EnvironmentParams {
            base: base(&[("HOME", "/home/u")]),
            locale: Some("de".to_string()),
            ..EnvironmentParams::default()
        };
        let env = build_worker_environment(params, &ServerConfig::default());

        assert_eq!(env.get("HOME"), Some("/home/u"));
        assert_eq!(env.get(ENV_PIPE_LOGGING), Some("true"));
        assert_eq!(env.get(ENV_ENTRY_POINT), Some(ENTRY_POINT_EXTENSION_HOST));
        assert_eq!(env.get(ENV_NLS_CONFIG), Some(r#"{"locale":"de"}"#));
        assert_eq!(env.get(ENV_VERBOSE), None);
    }

    #[test]
    fn test_debug_enables_verbose_toggles() {
        let params = EnvironmentParams {
            debug: true,
            ..EnvironmentParams::default()
        };
        let env = build_worker_environment(params, &ServerConfig::default());
        assert_eq!(env.get(ENV_VERBOSE), Some("true"));
        assert_eq!(env.get(ENV_LOG_STACK), Some("true"));
    }

    #[test]
    fn test_overrides_win_and_none_strips() {
        let mut overrides = HashMap::new();
        overrides.insert("EDITOR".to_string(), Some("remote".to_string()));
        overrides.insert("SSH_AUTH_SOCK".to_string(), None);

        let params = EnvironmentParams {
            base: base(&[("EDITOR", "vi"), ("SSH_AUTH_SOCK", "/run/agent")]),
            overrides,
            ..EnvironmentParams::default()
        };
        let env = build_worker_environment(params, &ServerConfig::default());

        assert_eq!(env.get("EDITOR"), Some("remote"));
        assert_eq!(env.get("SSH_AUTH_SOCK"), None);
    }

    #[test]
    fn test_shell_env_merges_between_base_and_overrides() {
        let mut overrides = HashMap::new();
        overrides.insert("LANG".to_string(), Some("C".to_string()));

        let params = EnvironmentParams {
            base: base(&[("LANG", "en_US"), ("TERM", "dumb")]),
            shell_env: Some(Ok(base(&[("LANG", "de_DE"), ("GOPATH", "/go")]))),
            overrides,
            ..EnvironmentParams::default()
        };
        let env = build_worker_environment(params, &ServerConfig::default());

        // override > shell > base
        assert_eq!(env.get("LANG"), Some("C"));
        assert_eq!(env.get("GOPATH"), Some("/go"));
        assert_eq!(env.get("TERM"), Some("dumb"));
    }

    #[test]
    fn test_shell_env_failure_degrades_gracefully() {
        let params = EnvironmentParams {
            base: base(&[("TERM", "xterm")]),
            shell_env: Some(Err(ShellEnvError("timed out".to_string()))),
            ..EnvironmentParams::default()
        };
        let env = build_worker_environment(params, &ServerConfig::default());
        assert_eq!(env.get("TERM"), Some("xterm"));
    }

    #[test]
    fn test_path_prepend_case_insensitive() {
        let params = EnvironmentParams {
            base: base(&[("Path", "/usr/bin:/bin")]),
            ..EnvironmentParams::default()
        };
        let env = build_worker_environment(params, &config_with_helper("/opt/helpers"));
        assert_eq!(env.get("Path"), Some("/opt/helpers:/usr/bin:/bin"));
        assert_eq!(env.get("PATH"), None);
    }

    #[test]
    fn test_path_prepend_idempotent_on_own_output() {
        let config = config_with_helper("/opt/helpers");
        let params = EnvironmentParams {
            base: base(&[("PATH", "/usr/bin")]),
            ..EnvironmentParams::default()
        };
        let first = build_worker_environment(params, &config);
        assert_eq!(first.get("PATH"), Some("/opt/helpers:/usr/bin"));

        let rebuilt = build_worker_environment(
            EnvironmentParams {
                base: first.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
                ..EnvironmentParams::default()
            },
            &config,
        );
        assert_eq!(rebuilt.get("PATH"), Some("/opt/helpers:/usr/bin"));
    }

    #[test]
    fn test_path_created_when_missing() {
        let env = build_worker_environment(
            EnvironmentParams::default(),
            &config_with_helper("/opt/helpers"),
        );
        assert_eq!(env.get("PATH"), Some("/opt/helpers"));
    }

    #[test]
    fn test_browser_helper_injection_and_suppression() {
        let mut config = ServerConfig {
            browser_helper: Some(PathBuf::from("/opt/helpers/open-url")),
            ..ServerConfig::default()
        };

        let env = build_worker_environment(EnvironmentParams::default(), &config);
        assert_eq!(env.get("BROWSER"), Some("/opt/helpers/open-url"));

        config.suppress_browser_helper = true;
        let env = build_worker_environment(EnvironmentParams::default(), &config);
        assert_eq!(env.get("BROWSER"), None);
    }

    #[test]
    fn test_deterministic_given_identical_inputs() {
        let make = || {
            build_worker_environment(
                EnvironmentParams {
                    base: base(&[("B", "2"), ("A", "1"), ("PATH", "/bin")]),
                    locale: Some("fr".to_string()),
                    ..EnvironmentParams::default()
                },
                &config_with_helper("/h"),
            )
        };
        assert_eq!(make(), make());
    }
}
