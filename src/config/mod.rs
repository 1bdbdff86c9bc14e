//! Configuration for the dinghy service.
//!
//! Settings come from a TOML or YAML file whose fields all have defaults,
//! overlaid with `DINGHY_*` environment variables. A loaded [`Settings`] is
//! immutable; reloading builds a new value and swaps the shared `Arc`.

mod settings;

pub use settings::{
    NotifierSettings, OrchestratorSettings, ParserFormat, ProviderSettings, RegexEngine, RepoConfig,
    ServerSettings, Settings, SlackSettings, WebhookValidation,
};
