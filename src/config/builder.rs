//! Client configuration, builder and CLI argument construction.
//!
//! # Example
//!
//! ```ignore
//! use claude_duplex::config::{ClientConfig, Model, PermissionMode};
//!
//! let config = ClientConfig::builder()
//!     .model(Model::Opus)
//!     .permission_mode(PermissionMode::AcceptEdits)
//!     .system_prompt("You are a helpful assistant.")
//!     .max_turns(5)
//!     .echo_mode(true)
//!     .build()?;
//!
//! let command = config.persistent_command()?;
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::{Map, Value};

use super::options::{InputFormat, Model, OutputFormat, PermissionMode, SessionId};
use crate::process::{CommandSpec, SpawnOptions};
use crate::{Error, Result};

/// Environment variable that turns on per-line protocol tracing.
pub const DEBUG_ENV: &str = "CLAUDE_SDK_DEBUG";

/// Default time the blocking `query` helpers wait for a turn.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(60);

/// A JSON-valued flag: either a value to serialize, or a literal passed
/// through verbatim (a file path or pre-serialized JSON).
#[derive(Debug, Clone, PartialEq)]
pub enum JsonArg {
    Inline(Value),
    Literal(String),
}

impl JsonArg {
    fn render(&self) -> String {
        match self {
            JsonArg::Inline(Value::String(s)) => s.clone(),
            JsonArg::Inline(value) => value.to_string(),
            JsonArg::Literal(s) => s.clone(),
        }
    }
}

impl From<Value> for JsonArg {
    fn from(value: Value) -> Self {
        JsonArg::Inline(value)
    }
}

impl From<&str> for JsonArg {
    fn from(s: &str) -> Self {
        JsonArg::Literal(s.to_string())
    }
}

impl From<String> for JsonArg {
    fn from(s: String) -> Self {
        JsonArg::Literal(s)
    }
}

impl From<PathBuf> for JsonArg {
    fn from(path: PathBuf) -> Self {
        JsonArg::Literal(path.display().to_string())
    }
}

impl From<&Path> for JsonArg {
    fn from(path: &Path) -> Self {
        JsonArg::Literal(path.display().to_string())
    }
}

/// Configuration for the Claude CLI.
///
/// Use [`ClientConfig::builder()`] to create one. Every field maps to a CLI
/// flag except the client-side settings at the end (`echo_mode`, `debug`,
/// `read_timeout`), which only affect this library.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // Core
    pub(crate) model: Option<Model>,
    pub(crate) agent: Option<String>,
    pub(crate) agents: Option<Value>,

    // System prompt
    pub(crate) system_prompt: Option<String>,
    pub(crate) append_system_prompt: Option<String>,

    // Tools
    pub(crate) tools: Option<Vec<String>>,
    pub(crate) allowed_tools: Vec<String>,
    pub(crate) disallowed_tools: Vec<String>,

    // Session management
    pub(crate) continue_conversation: bool,
    pub(crate) resume: Option<String>,
    pub(crate) fork_session: bool,
    pub(crate) session_id: Option<SessionId>,
    pub(crate) no_session_persistence: bool,

    // Mode
    pub(crate) print_mode: bool,
    pub(crate) replay_user_messages: bool,
    pub(crate) permission_mode: Option<PermissionMode>,
    pub(crate) dangerously_skip_permissions: bool,
    pub(crate) output_format: OutputFormat,
    pub(crate) input_format: InputFormat,
    pub(crate) include_partial_messages: bool,

    // Budget, limits and model options
    pub(crate) max_budget_usd: Option<f64>,
    pub(crate) max_turns: Option<u32>,
    pub(crate) fallback_model: Option<Model>,
    pub(crate) max_thinking_tokens: Option<u32>,
    pub(crate) json_schema: Option<JsonArg>,

    // Directories and settings
    pub(crate) add_dirs: Vec<PathBuf>,
    pub(crate) settings: Option<JsonArg>,
    pub(crate) setting_sources: Vec<String>,

    // MCP and plugins
    pub(crate) mcp_config: Option<JsonArg>,
    pub(crate) mcp_debug: bool,
    pub(crate) strict_mcp_config: bool,
    pub(crate) plugin_dirs: Vec<PathBuf>,
    pub(crate) disable_slash_commands: bool,
    pub(crate) betas: Vec<String>,

    // CLI diagnostics and integrations
    pub(crate) cli_debug: bool,
    pub(crate) cli_debug_filter: Option<String>,
    pub(crate) debug_file: Option<PathBuf>,
    pub(crate) verbose: bool,
    pub(crate) ide: bool,
    pub(crate) chrome: Option<bool>,
    pub(crate) files: Vec<String>,
    pub(crate) from_pr: Option<String>,

    // Process
    pub(crate) cli_path: Option<PathBuf>,
    pub(crate) working_directory: Option<PathBuf>,
    pub(crate) env: HashMap<String, String>,
    pub(crate) extra_args: Vec<(String, Option<String>)>,

    // Client-side
    pub(crate) echo_mode: bool,
    pub(crate) debug: bool,
    pub(crate) read_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            model: None,
            agent: None,
            agents: None,
            system_prompt: None,
            append_system_prompt: None,
            tools: None,
            allowed_tools: Vec::new(),
            disallowed_tools: Vec::new(),
            continue_conversation: false,
            resume: None,
            fork_session: false,
            session_id: None,
            no_session_persistence: false,
            print_mode: false,
            replay_user_messages: false,
            permission_mode: None,
            dangerously_skip_permissions: false,
            output_format: OutputFormat::Text,
            input_format: InputFormat::Text,
            include_partial_messages: false,
            max_budget_usd: None,
            max_turns: None,
            fallback_model: None,
            max_thinking_tokens: None,
            json_schema: None,
            add_dirs: Vec::new(),
            settings: None,
            setting_sources: Vec::new(),
            mcp_config: None,
            mcp_debug: false,
            strict_mcp_config: false,
            plugin_dirs: Vec::new(),
            disable_slash_commands: false,
            betas: Vec::new(),
            cli_debug: false,
            cli_debug_filter: None,
            debug_file: None,
            verbose: false,
            ide: false,
            chrome: None,
            files: Vec::new(),
            from_pr: None,
            cli_path: None,
            working_directory: None,
            env: HashMap::new(),
            extra_args: Vec::new(),
            echo_mode: false,
            debug: debug_from_env(),
            read_timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }
}

fn debug_from_env() -> bool {
    std::env::var(DEBUG_ENV)
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

impl ClientConfig {
    /// Create a new builder for ClientConfig.
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    pub fn model(&self) -> Option<&Model> {
        self.model.as_ref()
    }

    pub fn permission_mode(&self) -> Option<PermissionMode> {
        self.permission_mode
    }

    pub fn session_id(&self) -> Option<&SessionId> {
        self.session_id.as_ref()
    }

    pub fn working_directory(&self) -> Option<&Path> {
        self.working_directory.as_deref()
    }

    pub fn env(&self) -> &HashMap<String, String> {
        &self.env
    }

    /// Whether clients echo their own prompts and interrupts to the handler.
    pub fn echo_mode(&self) -> bool {
        self.echo_mode
    }

    /// Whether per-line protocol traces are emitted.
    pub fn debug(&self) -> bool {
        self.debug
    }

    /// How long the blocking `query` helpers wait for a turn to finish.
    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// Copy of this config pinned to the given session id.
    pub(crate) fn with_session_id(&self, id: SessionId) -> Self {
        let mut config = self.clone();
        config.session_id = Some(id);
        config
    }

    /// Locate the CLI executable.
    ///
    /// An explicit `cli_path` must exist (and be executable on unix);
    /// otherwise `claude` is searched on `PATH`.
    pub fn resolve_cli(&self) -> Result<PathBuf> {
        if let Some(path) = &self.cli_path {
            if !path.exists() || !is_executable(path) {
                return Err(Error::CliNotFound {
                    searched: path.display().to_string(),
                });
            }
            return Ok(path.clone());
        }

        which::which("claude").map_err(|e| {
            tracing::debug!(error = %e, "claude not found on PATH");
            Error::CliNotFound {
                searched: "PATH".to_string(),
            }
        })
    }

    /// Command for a persistent duplex session.
    ///
    /// Streaming input, streaming output and verbose framing are forced on
    /// and `--print` is never emitted, whatever the config says.
    pub fn persistent_command(&self) -> Result<CommandSpec> {
        let mut config = self.clone();
        config.output_format = OutputFormat::StreamJson;
        config.input_format = InputFormat::StreamJson;
        config.verbose = true;
        config.print_mode = false;
        config.command(None)
    }

    /// Command for a one-shot `--print` run of `prompt`.
    pub fn oneshot_command(&self, prompt: &str) -> Result<CommandSpec> {
        let mut config = self.clone();
        config.print_mode = true;
        config.output_format = OutputFormat::StreamJson;
        config.verbose = true;
        config.command(Some(prompt))
    }

    fn command(&self, prompt: Option<&str>) -> Result<CommandSpec> {
        let cli = self.resolve_cli()?;
        let mut argv = vec![cli.display().to_string()];
        argv.extend(self.build_args(prompt));
        Ok(CommandSpec {
            argv,
            options: SpawnOptions {
                working_dir: self.working_directory.clone(),
                env: self.env.clone(),
            },
        })
    }

    /// CLI arguments (without the program) for this config.
    pub fn build_args(&self, prompt: Option<&str>) -> Vec<String> {
        let mut args = Args::default();

        if self.output_format != OutputFormat::Text {
            args.pair("--output-format", self.output_format.as_str());
        }
        if self.input_format != InputFormat::Text {
            args.pair("--input-format", self.input_format.as_str());
        }

        if let Some(model) = &self.model {
            args.pair("--model", model.as_str());
        }
        if let Some(agent) = &self.agent {
            args.pair("--agent", agent);
        }
        if let Some(agents) = &self.agents {
            args.pair("--agents", agents.to_string());
        }

        if let Some(prompt) = &self.system_prompt {
            args.pair("--system-prompt", prompt);
        }
        if let Some(prompt) = &self.append_system_prompt {
            args.pair("--append-system-prompt", prompt);
        }

        if let Some(tools) = &self.tools {
            args.pair("--tools", tools.join(","));
        }
        if !self.allowed_tools.is_empty() {
            args.pair("--allowedTools", self.allowed_tools.join(","));
        }
        if !self.disallowed_tools.is_empty() {
            args.pair("--disallowedTools", self.disallowed_tools.join(","));
        }

        args.flag_if("--continue", self.continue_conversation);
        if let Some(resume) = &self.resume {
            args.pair("--resume", resume);
        }
        args.flag_if("--fork-session", self.fork_session);
        if let Some(id) = &self.session_id {
            args.pair("--session-id", id.as_str());
        }
        args.flag_if("--no-session-persistence", self.no_session_persistence);

        args.flag_if("--print", self.print_mode);
        args.flag_if("--replay-user-messages", self.replay_user_messages);
        if let Some(mode) = self.permission_mode {
            args.pair("--permission-mode", mode.as_str());
        }
        args.flag_if(
            "--dangerously-skip-permissions",
            self.dangerously_skip_permissions,
        );
        args.flag_if("--include-partial-messages", self.include_partial_messages);

        if let Some(budget) = self.max_budget_usd {
            args.pair("--max-budget-usd", budget.to_string());
        }
        if let Some(turns) = self.max_turns {
            args.pair("--max-turns", turns.to_string());
        }
        if let Some(model) = &self.fallback_model {
            args.pair("--fallback-model", model.as_str());
        }
        if let Some(tokens) = self.max_thinking_tokens {
            args.pair("--max-thinking-tokens", tokens.to_string());
        }
        if let Some(schema) = &self.json_schema {
            args.pair("--json-schema", schema.render());
        }

        for dir in &self.add_dirs {
            args.pair("--add-dir", dir.display().to_string());
        }
        if let Some(settings) = &self.settings {
            args.pair("--settings", settings.render());
        }
        if !self.setting_sources.is_empty() {
            args.pair("--setting-sources", self.setting_sources.join(","));
        }

        if let Some(mcp) = &self.mcp_config {
            let rendered = match mcp {
                JsonArg::Inline(Value::Object(map)) => normalize_mcp_servers(map).to_string(),
                other => other.render(),
            };
            args.pair("--mcp-config", rendered);
        }
        args.flag_if("--mcp-debug", self.mcp_debug);
        args.flag_if("--strict-mcp-config", self.strict_mcp_config);

        for dir in &self.plugin_dirs {
            args.pair("--plugin-dir", dir.display().to_string());
        }
        args.flag_if("--disable-slash-commands", self.disable_slash_commands);
        if !self.betas.is_empty() {
            args.pair("--betas", self.betas.join(","));
        }

        if self.cli_debug {
            match &self.cli_debug_filter {
                Some(filter) => args.pair("--debug", filter),
                None => args.flag("--debug"),
            }
        }
        if let Some(path) = &self.debug_file {
            args.pair("--debug-file", path.display().to_string());
        }
        args.flag_if("--verbose", self.verbose);
        args.flag_if("--ide", self.ide);
        match self.chrome {
            Some(true) => args.flag("--chrome"),
            Some(false) => args.flag("--no-chrome"),
            None => {}
        }
        for file in &self.files {
            args.pair("--file", file);
        }
        if let Some(pr) = &self.from_pr {
            args.pair("--from-pr", pr);
        }

        for (flag, value) in &self.extra_args {
            let flag = format!("--{flag}");
            match value {
                Some(value) => args.pair(&flag, value),
                None => args.flag(&flag),
            }
        }

        if let Some(prompt) = prompt.filter(|p| !p.is_empty()) {
            args.0.push(prompt.to_string());
        }

        args.0
    }
}

#[derive(Default)]
struct Args(Vec<String>);

impl Args {
    fn flag(&mut self, flag: &str) {
        self.0.push(flag.to_string());
    }

    fn flag_if(&mut self, flag: &str, enabled: bool) {
        if enabled {
            self.flag(flag);
        }
    }

    fn pair(&mut self, flag: &str, value: impl Into<String>) {
        self.0.push(flag.to_string());
        self.0.push(value.into());
    }
}

/// Wrap bare server maps in `mcpServers` and strip the in-process
/// `instance` handle from `sdk` servers.
fn normalize_mcp_servers(config: &Map<String, Value>) -> Value {
    let servers = match config.get("mcpServers") {
        Some(Value::Object(servers)) => servers,
        _ => config,
    };

    let cleaned: Map<String, Value> = servers
        .iter()
        .map(|(name, server)| {
            let server = match server {
                Value::Object(fields) if fields.get("type").and_then(Value::as_str) == Some("sdk") => {
                    let mut fields = fields.clone();
                    fields.remove("instance");
                    Value::Object(fields)
                }
                other => other.clone(),
            };
            (name.clone(), server)
        })
        .collect();

    serde_json::json!({ "mcpServers": cleaned })
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Builder for [`ClientConfig`].
///
/// Validation happens in [`build()`](ClientConfigBuilder::build); CLI
/// discovery is deferred until a command is built.
#[derive(Debug, Clone, Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    // -------------------------------------------------------------------------
    // Core
    // -------------------------------------------------------------------------

    /// Set the model to use.
    pub fn model(mut self, model: impl Into<Model>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    /// Agent name for the session.
    pub fn agent(mut self, agent: impl Into<String>) -> Self {
        self.config.agent = Some(agent.into());
        self
    }

    /// Custom agent definitions, passed as JSON to `--agents`.
    pub fn agents(mut self, agents: Value) -> Self {
        self.config.agents = Some(agents);
        self
    }

    // -------------------------------------------------------------------------
    // System prompt
    // -------------------------------------------------------------------------

    /// Replace the default system prompt.
    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    /// Append to the default system prompt.
    pub fn append_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.append_system_prompt = Some(prompt.into());
        self
    }

    // -------------------------------------------------------------------------
    // Tools
    // -------------------------------------------------------------------------

    /// Set the complete list of available tools, replacing the built-in set.
    ///
    /// An empty list disables all tools.
    pub fn tools(mut self, tools: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.config.tools = Some(tools.into_iter().map(Into::into).collect());
        self
    }

    /// Tool rules to allow, e.g. `Bash(git:*)`.
    pub fn allowed_tools(mut self, tools: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.config.allowed_tools = tools.into_iter().map(Into::into).collect();
        self
    }

    /// Tool rules to deny.
    pub fn disallowed_tools(mut self, tools: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.config.disallowed_tools = tools.into_iter().map(Into::into).collect();
        self
    }

    // -------------------------------------------------------------------------
    // Session management
    // -------------------------------------------------------------------------

    /// Continue the most recent conversation in the working directory.
    pub fn continue_conversation(mut self, enabled: bool) -> Self {
        self.config.continue_conversation = enabled;
        self
    }

    /// Resume a conversation by session id or search term.
    pub fn resume(mut self, session: impl Into<String>) -> Self {
        self.config.resume = Some(session.into());
        self
    }

    /// When resuming, create a new session id instead of reusing the original.
    pub fn fork_session(mut self, enabled: bool) -> Self {
        self.config.fork_session = enabled;
        self
    }

    /// Use a specific session id (must be a UUID for the CLI to accept it).
    ///
    /// Clients generate one when this is not set.
    pub fn session_id(mut self, id: impl Into<SessionId>) -> Self {
        self.config.session_id = Some(id.into());
        self
    }

    pub fn no_session_persistence(mut self, enabled: bool) -> Self {
        self.config.no_session_persistence = enabled;
        self
    }

    // -------------------------------------------------------------------------
    // Mode
    // -------------------------------------------------------------------------

    /// Emit `--print`. Ignored by [`ClientConfig::persistent_command`].
    pub fn print_mode(mut self, enabled: bool) -> Self {
        self.config.print_mode = enabled;
        self
    }

    pub fn replay_user_messages(mut self, enabled: bool) -> Self {
        self.config.replay_user_messages = enabled;
        self
    }

    /// Set the permission mode for tool execution.
    pub fn permission_mode(mut self, mode: PermissionMode) -> Self {
        self.config.permission_mode = Some(mode);
        self
    }

    /// Bypass all permission checks. Only for sandboxes.
    pub fn dangerously_skip_permissions(mut self, enabled: bool) -> Self {
        self.config.dangerously_skip_permissions = enabled;
        self
    }

    pub fn output_format(mut self, format: OutputFormat) -> Self {
        self.config.output_format = format;
        self
    }

    pub fn input_format(mut self, format: InputFormat) -> Self {
        self.config.input_format = format;
        self
    }

    /// Stream partial assistant deltas as `stream_event` messages.
    pub fn include_partial_messages(mut self, enabled: bool) -> Self {
        self.config.include_partial_messages = enabled;
        self
    }

    // -------------------------------------------------------------------------
    // Budget, limits and model options
    // -------------------------------------------------------------------------

    /// Set the maximum spend in USD. Must be positive.
    pub fn max_budget_usd(mut self, budget: f64) -> Self {
        self.config.max_budget_usd = Some(budget);
        self
    }

    /// Maximum number of agentic turns. Must be non-zero.
    pub fn max_turns(mut self, turns: u32) -> Self {
        self.config.max_turns = Some(turns);
        self
    }

    /// Model to fall back to when the primary model is overloaded.
    pub fn fallback_model(mut self, model: impl Into<Model>) -> Self {
        self.config.fallback_model = Some(model.into());
        self
    }

    pub fn max_thinking_tokens(mut self, tokens: u32) -> Self {
        self.config.max_thinking_tokens = Some(tokens);
        self
    }

    /// Constrain the final output to a JSON schema (object or JSON string).
    pub fn json_schema(mut self, schema: impl Into<JsonArg>) -> Self {
        self.config.json_schema = Some(schema.into());
        self
    }

    // -------------------------------------------------------------------------
    // Directories and settings
    // -------------------------------------------------------------------------

    /// Grant tool access to an additional directory. May be repeated.
    pub fn add_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.add_dirs.push(dir.into());
        self
    }

    /// Settings file path, JSON string or inline object.
    pub fn settings(mut self, settings: impl Into<JsonArg>) -> Self {
        self.config.settings = Some(settings.into());
        self
    }

    /// Setting sources to load (`user`, `project`, `local`).
    pub fn setting_sources(mut self, sources: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.config.setting_sources = sources.into_iter().map(Into::into).collect();
        self
    }

    // -------------------------------------------------------------------------
    // MCP and plugins
    // -------------------------------------------------------------------------

    /// MCP servers: a config file path, a JSON string, or an inline object.
    ///
    /// Inline objects may be a bare server map or wrapped in `mcpServers`.
    pub fn mcp_config(mut self, config: impl Into<JsonArg>) -> Self {
        self.config.mcp_config = Some(config.into());
        self
    }

    pub fn mcp_debug(mut self, enabled: bool) -> Self {
        self.config.mcp_debug = enabled;
        self
    }

    /// Only use MCP servers from `mcp_config`.
    pub fn strict_mcp_config(mut self, enabled: bool) -> Self {
        self.config.strict_mcp_config = enabled;
        self
    }

    pub fn plugin_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.plugin_dirs.push(dir.into());
        self
    }

    pub fn disable_slash_commands(mut self, enabled: bool) -> Self {
        self.config.disable_slash_commands = enabled;
        self
    }

    /// Beta headers to include in API requests.
    pub fn betas(mut self, betas: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.config.betas = betas.into_iter().map(Into::into).collect();
        self
    }

    // -------------------------------------------------------------------------
    // CLI diagnostics and integrations
    // -------------------------------------------------------------------------

    /// Pass `--debug` to the CLI, optionally with a category filter.
    pub fn cli_debug(mut self, enabled: bool, filter: Option<String>) -> Self {
        self.config.cli_debug = enabled;
        self.config.cli_debug_filter = filter;
        self
    }

    pub fn debug_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.debug_file = Some(path.into());
        self
    }

    pub fn verbose(mut self, enabled: bool) -> Self {
        self.config.verbose = enabled;
        self
    }

    pub fn ide(mut self, enabled: bool) -> Self {
        self.config.ide = enabled;
        self
    }

    /// Force the Chrome integration on (`--chrome`) or off (`--no-chrome`).
    pub fn chrome(mut self, enabled: bool) -> Self {
        self.config.chrome = Some(enabled);
        self
    }

    /// File resource to download at startup (`file_id:relative_path`).
    pub fn file(mut self, spec: impl Into<String>) -> Self {
        self.config.files.push(spec.into());
        self
    }

    pub fn from_pr(mut self, pr: impl Into<String>) -> Self {
        self.config.from_pr = Some(pr.into());
        self
    }

    // -------------------------------------------------------------------------
    // Process
    // -------------------------------------------------------------------------

    /// Path to the claude CLI binary (default: search `PATH`).
    pub fn cli_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.cli_path = Some(path.into());
        self
    }

    /// Working directory for the CLI process.
    pub fn working_directory(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.working_directory = Some(path.into());
        self
    }

    /// Add or override an environment variable for the subprocess.
    ///
    /// Overrides are merged over the inherited environment.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.env.insert(key.into(), value.into());
        self
    }

    /// Pass an arbitrary `--flag [value]` not covered by the builder.
    pub fn extra_arg(mut self, flag: impl Into<String>, value: Option<String>) -> Self {
        self.config.extra_args.push((flag.into(), value));
        self
    }

    // -------------------------------------------------------------------------
    // Client-side
    // -------------------------------------------------------------------------

    /// Echo prompts and interrupts back through the message handler.
    pub fn echo_mode(mut self, enabled: bool) -> Self {
        self.config.echo_mode = enabled;
        self
    }

    /// Trace every protocol line. Defaults to `CLAUDE_SDK_DEBUG=true`.
    pub fn debug(mut self, enabled: bool) -> Self {
        self.config.debug = enabled;
        self
    }

    /// How long the blocking `query` helpers wait for a turn.
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = timeout;
        self
    }

    // -------------------------------------------------------------------------
    // Build
    // -------------------------------------------------------------------------

    /// Validate and build the configuration.
    pub fn build(self) -> Result<ClientConfig> {
        let config = self.config;

        if let Some(budget) = config.max_budget_usd {
            if budget.is_nan() || budget <= 0.0 {
                return Err(Error::InvalidConfig(
                    "max_budget_usd must be positive".into(),
                ));
            }
        }

        if config.max_turns == Some(0) {
            return Err(Error::InvalidConfig("max_turns must be at least 1".into()));
        }

        if let Some(dir) = &config.working_directory {
            if !dir.is_dir() {
                return Err(Error::InvalidConfig(format!(
                    "working directory does not exist: {}",
                    dir.display()
                )));
            }
        }

        if let Some((flag, _)) = config
            .extra_args
            .iter()
            .find(|(flag, _)| flag.trim_start_matches('-').is_empty())
        {
            return Err(Error::InvalidConfig(format!(
                "extra argument has an empty flag name: {flag:?}"
            )));
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn args_of(builder: ClientConfigBuilder) -> Vec<String> {
        builder.build().unwrap().build_args(None)
    }

    fn value_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        let idx = args.iter().position(|a| a == flag)?;
        args.get(idx + 1).map(String::as_str)
    }

    #[test]
    fn default_config_has_no_args() {
        assert!(args_of(ClientConfig::builder()).is_empty());
    }

    #[test]
    fn builder_invalid_budget() {
        for budget in [0.0, -1.0, f64::NAN] {
            let result = ClientConfig::builder().max_budget_usd(budget).build();
            assert!(matches!(result, Err(Error::InvalidConfig(_))));
        }
    }

    #[test]
    fn builder_zero_max_turns() {
        let result = ClientConfig::builder().max_turns(0).build();
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn builder_invalid_working_directory() {
        let result = ClientConfig::builder()
            .working_directory("/nonexistent/path/that/does/not/exist")
            .build();
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn builder_rejects_empty_extra_flag() {
        let result = ClientConfig::builder().extra_arg("--", None).build();
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn core_flags_in_order() {
        let args = args_of(
            ClientConfig::builder()
                .output_format(OutputFormat::Json)
                .model(Model::Opus)
                .agent("reviewer")
                .system_prompt("be brief")
                .append_system_prompt("really")
                .max_turns(3),
        );
        assert_eq!(
            args,
            vec![
                "--output-format",
                "json",
                "--model",
                "opus",
                "--agent",
                "reviewer",
                "--system-prompt",
                "be brief",
                "--append-system-prompt",
                "really",
                "--max-turns",
                "3",
            ]
        );
    }

    #[test]
    fn tools_flags() {
        let args = args_of(
            ClientConfig::builder()
                .tools(["Bash", "Read"])
                .allowed_tools(["Bash(git:*)", "Edit"])
                .disallowed_tools(["WebFetch"]),
        );
        assert_eq!(value_after(&args, "--tools"), Some("Bash,Read"));
        assert_eq!(value_after(&args, "--allowedTools"), Some("Bash(git:*),Edit"));
        assert_eq!(value_after(&args, "--disallowedTools"), Some("WebFetch"));
    }

    #[test]
    fn empty_tools_disables_all() {
        let args = args_of(ClientConfig::builder().tools(Vec::<String>::new()));
        assert_eq!(args, vec!["--tools", ""]);
    }

    #[test]
    fn session_flags() {
        let args = args_of(
            ClientConfig::builder()
                .continue_conversation(true)
                .resume("abc")
                .fork_session(true)
                .session_id("11111111-2222-3333-4444-555555555555")
                .no_session_persistence(true),
        );
        assert_eq!(
            args,
            vec![
                "--continue",
                "--resume",
                "abc",
                "--fork-session",
                "--session-id",
                "11111111-2222-3333-4444-555555555555",
                "--no-session-persistence",
            ]
        );
    }

    #[test]
    fn permission_mode_is_emitted_when_set() {
        let args = args_of(ClientConfig::builder().permission_mode(PermissionMode::Default));
        assert_eq!(args, vec!["--permission-mode", "default"]);

        let args = args_of(ClientConfig::builder().permission_mode(PermissionMode::DontAsk));
        assert_eq!(value_after(&args, "--permission-mode"), Some("dontAsk"));
    }

    #[test]
    fn json_valued_flags() {
        let schema = json!({"type": "object", "properties": {"n": {"type": "number"}}});
        let args = args_of(
            ClientConfig::builder()
                .json_schema(schema.clone())
                .settings("/etc/claude/settings.json")
                .agents(json!({"reviewer": {"prompt": "review"}})),
        );
        let rendered: Value = serde_json::from_str(value_after(&args, "--json-schema").unwrap()).unwrap();
        assert_eq!(rendered, schema);
        assert_eq!(value_after(&args, "--settings"), Some("/etc/claude/settings.json"));
        assert!(value_after(&args, "--agents").unwrap().contains("reviewer"));
    }

    #[test]
    fn json_schema_string_is_passed_verbatim() {
        let args = args_of(ClientConfig::builder().json_schema(json!("{\"type\":\"string\"}")));
        assert_eq!(value_after(&args, "--json-schema"), Some("{\"type\":\"string\"}"));
    }

    #[test]
    fn mcp_config_bare_servers_are_wrapped() {
        let args = args_of(ClientConfig::builder().mcp_config(json!({
            "files": {"command": "mcp-files"},
            "inproc": {"type": "sdk", "name": "inproc", "instance": "<handle>"}
        })));
        let rendered: Value = serde_json::from_str(value_after(&args, "--mcp-config").unwrap()).unwrap();
        assert_eq!(
            rendered,
            json!({"mcpServers": {
                "files": {"command": "mcp-files"},
                "inproc": {"type": "sdk", "name": "inproc"}
            }})
        );
    }

    #[test]
    fn mcp_config_wrapped_servers_and_paths() {
        let args = args_of(ClientConfig::builder().mcp_config(json!({
            "mcpServers": {"x": {"type": "sdk", "instance": 1}}
        })));
        let rendered: Value = serde_json::from_str(value_after(&args, "--mcp-config").unwrap()).unwrap();
        assert_eq!(rendered, json!({"mcpServers": {"x": {"type": "sdk"}}}));

        let args = args_of(ClientConfig::builder().mcp_config(PathBuf::from("/tmp/mcp.json")));
        assert_eq!(value_after(&args, "--mcp-config"), Some("/tmp/mcp.json"));
    }

    #[test]
    fn repeated_and_joined_flags() {
        let args = args_of(
            ClientConfig::builder()
                .add_dir("/a")
                .add_dir("/b")
                .plugin_dir("/p")
                .setting_sources(["user", "project"])
                .betas(["b1", "b2"])
                .file("f1:a.txt")
                .file("f2:b.txt"),
        );
        assert_eq!(args.iter().filter(|a| *a == "--add-dir").count(), 2);
        assert_eq!(value_after(&args, "--plugin-dir"), Some("/p"));
        assert_eq!(value_after(&args, "--setting-sources"), Some("user,project"));
        assert_eq!(value_after(&args, "--betas"), Some("b1,b2"));
        assert_eq!(args.iter().filter(|a| *a == "--file").count(), 2);
    }

    #[test]
    fn debug_and_integration_flags() {
        let args = args_of(
            ClientConfig::builder()
                .cli_debug(true, Some("api,hooks".into()))
                .debug_file("/tmp/debug.log")
                .ide(true)
                .chrome(false)
                .from_pr("123"),
        );
        assert_eq!(value_after(&args, "--debug"), Some("api,hooks"));
        assert_eq!(value_after(&args, "--debug-file"), Some("/tmp/debug.log"));
        assert!(args.contains(&"--ide".to_string()));
        assert!(args.contains(&"--no-chrome".to_string()));
        assert!(!args.contains(&"--chrome".to_string()));
        assert_eq!(value_after(&args, "--from-pr"), Some("123"));

        let args = args_of(ClientConfig::builder().cli_debug(true, None));
        assert_eq!(args, vec!["--debug"]);
    }

    #[test]
    fn extra_args_and_prompt_come_last() {
        let config = ClientConfig::builder()
            .model("haiku")
            .extra_arg("some-flag", Some("value".into()))
            .extra_arg("bool-flag", None)
            .build()
            .unwrap();
        let args = config.build_args(Some("Hello!"));
        assert_eq!(
            args,
            vec!["--model", "haiku", "--some-flag", "value", "--bool-flag", "Hello!"]
        );
        assert_eq!(config.build_args(Some("")), vec!["--model", "haiku", "--some-flag", "value", "--bool-flag"]);
    }

    #[test]
    fn explicit_missing_cli_path_is_not_found() {
        let config = ClientConfig::builder()
            .cli_path("/nonexistent/claude")
            .build()
            .unwrap();
        let err = config.resolve_cli().unwrap_err();
        assert!(matches!(err, Error::CliNotFound { searched } if searched == "/nonexistent/claude"));
        assert!(config.persistent_command().is_err());
    }

    #[cfg(unix)]
    fn fake_cli(dir: &tempfile::TempDir, mode: u32) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.path().join("claude");
        std::fs::write(&path, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).unwrap();
        path
    }

    #[cfg(unix)]
    #[test]
    fn non_executable_cli_path_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let cli = fake_cli(&dir, 0o644);
        let config = ClientConfig::builder().cli_path(cli).build().unwrap();
        assert!(matches!(config.resolve_cli(), Err(Error::CliNotFound { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn persistent_command_forces_duplex_flags() {
        let dir = tempfile::tempdir().unwrap();
        let cli = fake_cli(&dir, 0o755);
        let config = ClientConfig::builder()
            .cli_path(&cli)
            .print_mode(true)
            .output_format(OutputFormat::Text)
            .working_directory(dir.path())
            .env("FOO", "bar")
            .build()
            .unwrap();

        let command = config.persistent_command().unwrap();
        assert_eq!(command.argv[0], cli.display().to_string());
        assert_eq!(
            &command.argv[1..],
            &[
                "--output-format",
                "stream-json",
                "--input-format",
                "stream-json",
                "--verbose",
            ]
        );
        assert!(!command.argv.contains(&"--print".to_string()));
        assert_eq!(command.options.working_dir.as_deref(), Some(dir.path()));
        assert_eq!(command.options.env.get("FOO").map(String::as_str), Some("bar"));
    }

    #[cfg(unix)]
    #[test]
    fn oneshot_command_forces_print_and_appends_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let cli = fake_cli(&dir, 0o755);
        let config = ClientConfig::builder()
            .cli_path(&cli)
            .input_format(InputFormat::StreamJson)
            .build()
            .unwrap();

        let command = config.oneshot_command("What is 2+2?").unwrap();
        assert_eq!(
            &command.argv[1..],
            &[
                "--output-format",
                "stream-json",
                "--input-format",
                "stream-json",
                "--print",
                "--verbose",
                "What is 2+2?",
            ]
        );
    }

    #[test]
    fn with_session_id_pins_session_flag() {
        let config = ClientConfig::builder().build().unwrap();
        let pinned = config.with_session_id(SessionId::from("s-1"));
        assert_eq!(pinned.session_id().map(SessionId::as_str), Some("s-1"));
        assert_eq!(pinned.build_args(None), vec!["--session-id", "s-1"]);
        assert_eq!(config.session_id(), None);
    }

    #[test]
    fn client_side_settings() {
        let config = ClientConfig::builder()
            .echo_mode(true)
            .debug(true)
            .read_timeout(Duration::from_secs(5))
            .build()
            .unwrap();
        assert!(config.echo_mode());
        assert!(config.debug());
        assert_eq!(config.read_timeout(), Duration::from_secs(5));
        assert_eq!(
            ClientConfig::builder().build().unwrap().read_timeout(),
            DEFAULT_QUERY_TIMEOUT
        );
    }

    #[test]
    fn types_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ClientConfig>();
        assert_send_sync::<ClientConfigBuilder>();
    }
}
