use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::{Shell, generate};
use serde_json::{Value, json};
use std::path::PathBuf;
use std::str::FromStr;
use tracing::debug;

use flow_config::{ConfigLoader, FlowConfig, WarningSeverity};
use flow_core::{FlowError, FnTool, Result, Thread, UnifiedStatus};
use flow_runtime::{
    AgentConfig, AgentIdentity, AgentMode, CallOptions, OrchestrationResult, Orchestrator,
    ToolConfig,
};

/// kodus-flow: agent execution and context orchestration runtime
#[derive(Parser)]
#[command(name = "kflow", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to flow.toml config file
    #[arg(short, long, global = true, env = "KFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// Log level override (e.g. debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Enable verbose output (debug logging)
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Suppress all log output (errors only)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Simple,
    Workflow,
}

impl From<ModeArg> for AgentMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Simple => AgentMode::Simple,
            ModeArg::Workflow => AgentMode::Workflow,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Register an agent and call it once with the given input
    Run {
        /// Input for the agent; parsed as JSON when it is valid JSON
        input: String,

        /// Agent name
        #[arg(short, long, default_value = "echo")]
        agent: String,

        /// Agent role (identity)
        #[arg(long, default_value = "assistant")]
        role: String,

        /// Execution mode
        #[arg(short, long, value_enum, default_value = "simple")]
        mode: ModeArg,

        /// Thread id to run on (generated if omitted)
        #[arg(short, long)]
        thread: Option<String>,

        /// Tenant id (defaults to the configured tenant)
        #[arg(long)]
        tenant: Option<String>,

        /// Print the full result envelope as JSON
        #[arg(long)]
        json: bool,
    },
    /// Call a built-in tool directly
    CallTool {
        /// Tool name (see `--list`)
        #[arg(required_unless_present = "list")]
        name: Option<String>,

        /// JSON input for the tool
        #[arg(default_value = "{}")]
        input: String,

        /// List the built-in tools and exit
        #[arg(long)]
        list: bool,
    },
    /// Show service health and orchestrator stats
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the resolved configuration
    Config {
        /// Output as JSON
        #[arg(long)]
        json: bool,

        /// Only print validation findings
        #[arg(long)]
        check: bool,
    },
    /// Print the status transition table
    Transitions {
        /// Only show transitions out of this status
        #[arg(long)]
        from: Option<String>,
    },
    /// Generate shell completions for bash, zsh, or fish
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        // Load config first so we can use it for log format
        let config_loader = ConfigLoader::load(self.config.as_deref())?;
        let config = config_loader.get();

        // --verbose > --quiet > --log-level > [logging].level
        let log_level = if self.verbose {
            "debug"
        } else if self.quiet {
            "error"
        } else {
            self.log_level
                .as_deref()
                .unwrap_or(config.logging.level.as_str())
        };
        init_tracing(&config, log_level);
        debug!(path = %config_loader.path().display(), "configuration resolved");

        match self.command {
            Commands::Run {
                input,
                agent,
                role,
                mode,
                thread,
                tenant,
                json,
            } => Self::cmd_run(config, input, agent, role, mode.into(), thread, tenant, json).await,
            Commands::CallTool { name, input, list } => {
                Self::cmd_call_tool(config, name, input, list).await
            }
            Commands::Status { json } => Self::cmd_status(config, json).await,
            Commands::Config { json, check } => Self::cmd_config(config, json, check),
            Commands::Transitions { from } => Self::cmd_transitions(from),
            Commands::Completions { shell } => Self::cmd_completions(shell),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn cmd_run(
        config: FlowConfig,
        input: String,
        agent: String,
        role: String,
        mode: AgentMode,
        thread: Option<String>,
        tenant: Option<String>,
        json: bool,
    ) -> Result<()> {
        let orchestrator = Orchestrator::new(&config)?;
        register_builtin_tools(&orchestrator)?;
        orchestrator.create_agent(
            AgentConfig::new(agent.clone(), AgentIdentity::role(role)).with_mode(mode),
        )?;

        let mut options = CallOptions {
            tenant_id: tenant,
            ..Default::default()
        };
        if let Some(id) = thread {
            options = options.with_thread(Thread::new(id)?);
        }

        let result = orchestrator
            .call_agent(&agent, parse_input(&input), options)
            .await;
        orchestrator.shutdown().await;
        print_result(&result, json)
    }

    async fn cmd_call_tool(
        config: FlowConfig,
        name: Option<String>,
        input: String,
        list: bool,
    ) -> Result<()> {
        let orchestrator = Orchestrator::new(&config)?;
        register_builtin_tools(&orchestrator)?;

        let Some(name) = name.filter(|_| !list) else {
            for tool in orchestrator.tools().list() {
                println!("  {:<8} {}", tool.name, tool.description);
            }
            return Ok(());
        };

        let input: Value = serde_json::from_str(&input)
            .map_err(|e| FlowError::InvalidArgument(format!("tool input is not JSON: {e}")))?;
        let result = orchestrator.call_tool(&name, input).await;
        print_result(&result, true)
    }

    async fn cmd_status(config: FlowConfig, json: bool) -> Result<()> {
        let orchestrator = Orchestrator::new(&config)?;
        let health = orchestrator.health().await;
        let stats = orchestrator.get_stats();

        if json {
            let report = json!({ "health": health, "stats": stats });
            println!("{}", serde_json::to_string_pretty(&report)?);
            return Ok(());
        }

        println!("kodus-flow v{}", env!("CARGO_PKG_VERSION"));
        println!("  tenant:   {}", stats.tenant_id);
        println!("  memory:   {}", config.memory.backend);
        println!("  health:   {:?}", health.status);
        for component in &health.components {
            println!("    {:<8} {:?}", component.component, component.status);
        }
        println!(
            "  timeouts: agent {} ms, idle thread {} s",
            config.orchestrator.default_timeout_ms, config.registry.idle_timeout_secs
        );
        Ok(())
    }

    fn cmd_config(config: FlowConfig, json: bool, check: bool) -> Result<()> {
        // The loader already rejected hard errors, so only findings remain.
        let findings = config.validate().unwrap_or_default();
        if check {
            if findings.is_empty() {
                println!("configuration OK");
            }
            for finding in &findings {
                println!("{finding}");
            }
            return Ok(());
        }

        if json {
            println!("{}", serde_json::to_string_pretty(&config)?);
        } else {
            let rendered =
                toml::to_string_pretty(&config).map_err(|e| FlowError::Config(e.to_string()))?;
            println!("{rendered}");
        }
        for finding in findings
            .iter()
            .filter(|f| f.severity != WarningSeverity::Info)
        {
            eprintln!("{finding}");
        }
        Ok(())
    }

    fn cmd_transitions(from: Option<String>) -> Result<()> {
        let sources: Vec<UnifiedStatus> = match from {
            Some(ref s) => vec![UnifiedStatus::from_str(s)?],
            None => UnifiedStatus::ALL.to_vec(),
        };
        for status in sources {
            let targets: Vec<&str> = status
                .allowed_transitions()
                .iter()
                .map(|to| to.as_str())
                .collect();
            let targets = if targets.is_empty() {
                "(terminal)".to_string()
            } else {
                targets.join(", ")
            };
            println!("{:<20} -> {}", status.as_str(), targets);
        }
        Ok(())
    }

    fn cmd_completions(shell: Shell) -> Result<()> {
        let mut cmd = Cli::command();
        generate(shell, &mut cmd, "kflow", &mut std::io::stdout());
        Ok(())
    }
}

fn init_tracing(config: &FlowConfig, log_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match config.logging.format.as_str() {
        "json" => builder.json().with_target(true).init(),
        "compact" => builder.compact().with_target(false).init(),
        _ => builder.with_target(false).init(),
    }
}

fn register_builtin_tools(orchestrator: &Orchestrator) -> Result<()> {
    orchestrator.create_tool(ToolConfig::new(
        "echo",
        "Return the input unchanged",
        FnTool(|input: Value| async move { Ok::<_, FlowError>(input) }),
    ))?;
    orchestrator.create_tool(
        ToolConfig::new(
            "now",
            "Current UTC time (RFC 3339)",
            FnTool(|_input: Value| async move {
                Ok::<_, FlowError>(json!(chrono::Utc::now().to_rfc3339()))
            }),
        )
        .with_schema(json!({ "type": "object", "properties": {} })),
    )?;
    Ok(())
}

/// JSON when it parses, a plain string otherwise.
fn parse_input(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn print_result(result: &OrchestrationResult, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
    } else if let Some(ref value) = result.result {
        match value {
            Value::String(s) => println!("{s}"),
            other => println!("{}", serde_json::to_string_pretty(other)?),
        }
    }

    if result.success {
        Ok(())
    } else {
        Err(FlowError::Agent(
            result
                .error
                .clone()
                .unwrap_or_else(|| "call failed".to_string()),
        ))
    }
}
