//! Process-wide settings.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_APPLICATION_EMAIL, DEFAULT_DINGHY_FILENAME, DEFAULT_HTTP_RETRIES,
    DEFAULT_LOG_EVENT_TTL_MINUTES, DEFAULT_PORT, NOTIFIER_TIMEOUT, TASK_POLL_INTERVAL, TASK_TIMEOUT,
};
use crate::core::DinghyError;

/// Format rendered dinghyfiles are unmarshalled from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParserFormat {
    #[default]
    Json,
    Yaml,
    Hcl,
}

impl fmt::Display for ParserFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ParserFormat::Json => "json",
            ParserFormat::Yaml => "yaml",
            ParserFormat::Hcl => "hcl",
        })
    }
}

impl FromStr for ParserFormat {
    type Err = DinghyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(ParserFormat::Json),
            "yaml" | "yml" => Ok(ParserFormat::Yaml),
            "hcl" => Ok(ParserFormat::Hcl),
            other => Err(DinghyError::Config(format!("unknown parser format {other:?}"))),
        }
    }
}

impl ParserFormat {
    /// Parse `text` in this format into a JSON value.
    ///
    /// Errors are the parser's own diagnostic, including position.
    pub fn parse(self, text: &str) -> Result<serde_json::Value, String> {
        match self {
            ParserFormat::Json => serde_json::from_str(text).map_err(|e| e.to_string()),
            ParserFormat::Yaml => serde_yaml::from_str(text).map_err(|e| e.to_string()),
            ParserFormat::Hcl => hcl::from_str(text).map_err(|e| e.to_string()),
        }
    }
}

/// Regex dialect for ignore patterns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegexEngine {
    /// The `regex` crate: linear time, no lookaround.
    #[default]
    Standard,
    /// `fancy-regex`: adds lookaround and backreferences.
    Fancy,
}

/// Orchestrator service endpoints and polling behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    /// Application and pipeline storage service.
    pub front50_url: String,
    /// Task execution service, used to create applications.
    pub orca_url: String,
    /// Authorization service. Empty disables role lookups.
    pub fiat_url: String,
    /// Service account sent as `X-SPINNAKER-USER`.
    pub fiat_user: Option<String>,
    /// UI base URL used as the commit status link.
    pub deck_url: Option<String>,
    pub retries: usize,
    pub poll_interval_secs: u64,
    pub task_timeout_secs: u64,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            front50_url: "http://front50:8080".to_string(),
            orca_url: "http://orca:8083".to_string(),
            fiat_url: String::new(),
            fiat_user: None,
            deck_url: None,
            retries: DEFAULT_HTTP_RETRIES,
            poll_interval_secs: TASK_POLL_INTERVAL.as_secs(),
            task_timeout_secs: TASK_TIMEOUT.as_secs(),
        }
    }
}

/// Credentials and endpoint for one VCS provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    /// API base URL. Empty means the provider's public default.
    pub endpoint: String,
    /// Username for basic-auth providers (Stash, Bitbucket).
    pub username: String,
    /// Token, app password or personal access token.
    pub token: String,
}

impl ProviderSettings {
    /// Configured endpoint, or `default` when unset.
    pub fn endpoint_or<'a>(&'a self, default: &'a str) -> &'a str {
        if self.endpoint.is_empty() {
            default
        } else {
            self.endpoint.trim_end_matches('/')
        }
    }
}

/// Webhook secret for one `(provider, org, repo)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookValidation {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub provider: String,
    pub org: String,
    pub repo: String,
    #[serde(default)]
    pub secret: String,
}

/// Branch that counts as "process" for one repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepoConfig {
    pub provider: String,
    pub repo: String,
    pub branch: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlackSettings {
    pub enabled: bool,
    /// Incoming-webhook URL.
    pub webhook_url: String,
    pub channel: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifierSettings {
    pub slack: SlackSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub port: u16,
    pub notifier_timeout_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            notifier_timeout_secs: NOTIFIER_TIMEOUT.as_secs(),
        }
    }
}

/// Everything dinghy needs to run, loaded once and shared as `Arc<Settings>`.
///
/// Every field has a default so a settings file only lists what differs:
///
/// ```toml
/// template_org = "armory"
/// template_repo = "dinghy-templates"
/// parser_format = "yaml"
///
/// [orchestrator]
/// front50_url = "http://front50:8080"
///
/// [github]
/// token = "ghp_..."
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Organization holding shared modules.
    pub template_org: String,
    /// Repository holding shared modules.
    pub template_repo: String,
    /// Base name identifying root documents.
    pub dinghy_filename: String,
    pub parser_format: ParserFormat,
    /// Lock every pipeline written so it cannot be edited in the UI.
    pub auto_lock_pipelines: bool,
    /// Used when a dinghyfile does not set `deleteStalePipelines`.
    pub delete_stale_pipelines_default: bool,
    /// Email applied to application specs that omit one.
    pub default_email: String,

    pub orchestrator: OrchestratorSettings,
    pub github: ProviderSettings,
    pub gitlab: ProviderSettings,
    pub stash: ProviderSettings,
    pub bitbucket: ProviderSettings,

    /// Providers whose webhooks must carry a valid signature.
    pub webhook_validation_enabled_providers: Vec<String>,
    pub webhook_validations: Vec<WebhookValidation>,
    /// Header carrying `sha1=<hex>`.
    pub webhook_signature_header: String,

    pub repo_config: Vec<RepoConfig>,

    /// Changed files matching any of these are not processed.
    pub ignore_patterns: Vec<String>,
    pub ignore_regex_engine: RegexEngine,

    /// Require pushers to hold a WRITE role on the application.
    pub user_write_permissions_check_enabled: bool,
    /// Users exempt from the write check.
    pub user_write_permission_exceptions: Vec<String>,

    pub notifiers: NotifierSettings,
    pub log_event_ttl_minutes: u64,
    /// Persist the dependency graph here; in-memory only when unset.
    pub graph_snapshot_path: Option<String>,
    pub server: ServerSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            template_org: String::new(),
            template_repo: String::new(),
            dinghy_filename: DEFAULT_DINGHY_FILENAME.to_string(),
            parser_format: ParserFormat::default(),
            auto_lock_pipelines: false,
            delete_stale_pipelines_default: false,
            default_email: DEFAULT_APPLICATION_EMAIL.to_string(),
            orchestrator: OrchestratorSettings::default(),
            github: ProviderSettings::default(),
            gitlab: ProviderSettings::default(),
            stash: ProviderSettings::default(),
            bitbucket: ProviderSettings::default(),
            webhook_validation_enabled_providers: Vec::new(),
            webhook_validations: Vec::new(),
            webhook_signature_header: "X-Hub-Signature".to_string(),
            repo_config: Vec::new(),
            ignore_patterns: Vec::new(),
            ignore_regex_engine: RegexEngine::default(),
            user_write_permissions_check_enabled: false,
            user_write_permission_exceptions: Vec::new(),
            notifiers: NotifierSettings::default(),
            log_event_ttl_minutes: DEFAULT_LOG_EVENT_TTL_MINUTES,
            graph_snapshot_path: None,
            server: ServerSettings::default(),
        }
    }
}

const fn default_true() -> bool {
    true
}

impl Settings {
    /// Load settings from `path`, or defaults when `None`, then apply the
    /// `DINGHY_*` environment overlay and validate.
    ///
    /// Files ending in `.yaml` or `.yml` are read as YAML, anything else as TOML.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = match path {
            Some(path) => Self::load_from(path).await?,
            None => Self::default(),
        };
        settings.apply_env(|key| std::env::var(key).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parse a settings file without the environment overlay.
    pub async fn load_from(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read settings from {}", path.display()))?;
        Self::parse(&content, path)
    }

    fn parse(content: &str, path: &Path) -> Result<Self> {
        let extension = path.extension().and_then(|e| e.to_str());
        let is_yaml = extension.is_some_and(|e| e == "yaml" || e == "yml");
        if is_yaml {
            serde_yaml::from_str(content)
                .with_context(|| format!("Failed to parse settings from {}", path.display()))
        } else {
            toml::from_str(content)
                .with_context(|| format!("Failed to parse settings from {}", path.display()))
        }
    }

    /// Override scalars from environment variables found through `lookup`.
    ///
    /// | Variable | Field |
    /// |---|---|
    /// | `DINGHY_PORT` | `server.port` |
    /// | `DINGHY_TEMPLATE_ORG` | `template_org` |
    /// | `DINGHY_TEMPLATE_REPO` | `template_repo` |
    /// | `DINGHY_FILENAME` | `dinghy_filename` |
    /// | `DINGHY_PARSER_FORMAT` | `parser_format` |
    /// | `DINGHY_FRONT50_URL` | `orchestrator.front50_url` |
    /// | `DINGHY_ORCA_URL` | `orchestrator.orca_url` |
    /// | `DINGHY_FIAT_URL` | `orchestrator.fiat_url` |
    /// | `DINGHY_DECK_URL` | `orchestrator.deck_url` |
    /// | `DINGHY_GITHUB_TOKEN` | `github.token` |
    /// | `DINGHY_GITLAB_TOKEN` | `gitlab.token` |
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(port) = lookup("DINGHY_PORT") {
            self.server.port =
                port.parse().with_context(|| format!("DINGHY_PORT is not a port: {port}"))?;
        }
        if let Some(format) = lookup("DINGHY_PARSER_FORMAT") {
            self.parser_format = format.parse()?;
        }
        let strings: [(&str, &mut String); 8] = [
            ("DINGHY_TEMPLATE_ORG", &mut self.template_org),
            ("DINGHY_TEMPLATE_REPO", &mut self.template_repo),
            ("DINGHY_FILENAME", &mut self.dinghy_filename),
            ("DINGHY_FRONT50_URL", &mut self.orchestrator.front50_url),
            ("DINGHY_ORCA_URL", &mut self.orchestrator.orca_url),
            ("DINGHY_FIAT_URL", &mut self.orchestrator.fiat_url),
            ("DINGHY_GITHUB_TOKEN", &mut self.github.token),
            ("DINGHY_GITLAB_TOKEN", &mut self.gitlab.token),
        ];
        for (key, field) in strings {
            if let Some(value) = lookup(key) {
                *field = value;
            }
        }
        if let Some(deck) = lookup("DINGHY_DECK_URL") {
            self.orchestrator.deck_url = Some(deck);
        }
        Ok(())
    }

    /// Reject settings that cannot work.
    pub fn validate(&self) -> Result<(), DinghyError> {
        if self.dinghy_filename.trim().is_empty() {
            return Err(DinghyError::Config("dinghy_filename must not be empty".to_string()));
        }
        if self.template_org.is_empty() != self.template_repo.is_empty() {
            return Err(DinghyError::Config(
                "template_org and template_repo must be set together".to_string(),
            ));
        }
        if self.orchestrator.poll_interval_secs == 0 {
            return Err(DinghyError::Config(
                "orchestrator.poll_interval_secs must be positive".to_string(),
            ));
        }
        for validation in &self.webhook_validations {
            if validation.enabled && validation.secret.is_empty() {
                return Err(DinghyError::Config(format!(
                    "webhook validation for {}/{}/{} is enabled without a secret",
                    validation.provider, validation.org, validation.repo
                )));
            }
        }
        Ok(())
    }

    /// Whether `(org, repo)` is the shared module repository.
    pub fn is_template_repo(&self, org: &str, repo: &str) -> bool {
        !self.template_org.is_empty() && self.template_org == org && self.template_repo == repo
    }

    /// Branch configured for `repo` on `provider`, if any.
    pub fn repo_branch(&self, provider: &str, repo: &str) -> Option<&str> {
        self.repo_config
            .iter()
            .find(|c| c.provider == provider && c.repo == repo)
            .map(|c| c.branch.as_str())
    }
}
