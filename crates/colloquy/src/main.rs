use std::env;
use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use futures::StreamExt;
use log::{LevelFilter, debug, info, warn};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};

use colloquy::config::{self, APP_NAME, AppConfig};
use colloquy::protocol::{AuditEventType, ConverseEvent, Role, TurnResult};
use colloquy::upstream::replay_messages;
use colloquy::{
    AuditLogger, ConverseOptions, PermissionMode, ProcessUpstream, ScriptedUpstream,
    SessionManager, Upstream,
};

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging()?;
    debug!("config file: {}", ctx.config_file.display());

    match cli.command {
        Command::Ask(cmd) => async_ask(ctx, cmd),
        Command::Chat => async_chat(ctx),
        Command::Replay(cmd) => async_replay(ctx, cmd),
        Command::Init(cmd) => handle_init(&ctx, cmd),
        Command::Config { command } => handle_config(&ctx, command),
        Command::Completions { shell } => handle_completions(shell),
    }
}

#[tokio::main]
async fn async_ask(ctx: RuntimeContext, cmd: AskCommand) -> Result<()> {
    handle_ask(&ctx, cmd).await
}

#[tokio::main]
async fn async_chat(ctx: RuntimeContext) -> Result<()> {
    handle_chat(&ctx).await
}

#[tokio::main]
async fn async_replay(ctx: RuntimeContext, cmd: ReplayCommand) -> Result<()> {
    handle_replay(&ctx, cmd).await
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Colloquy - conversational session adapter for tool-using LLM agents.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Output machine readable JSON
    #[arg(long, global = true)]
    json: bool,
    /// Disable ANSI colors in output
    #[arg(long = "no-color", global = true, conflicts_with = "color")]
    no_color: bool,
    /// Control color output (auto, always, never)
    #[arg(long, value_enum, default_value_t = ColorOption::Auto, global = true)]
    color: ColorOption,
    /// Emit additional diagnostics for troubleshooting
    #[arg(long = "diagnostics", global = true)]
    diagnostics: bool,
    /// Continue an existing upstream session
    #[arg(long, value_name = "ID", global = true)]
    session: Option<String>,
    /// Override the upstream model
    #[arg(long, value_name = "MODEL", global = true)]
    model: Option<String>,
    /// Override the tool permission mode
    #[arg(long = "permission-mode", value_enum, global = true)]
    permission_mode: Option<PermissionMode>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColorOption {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Send one message and print the reply
    Ask(AskCommand),
    /// Interactive conversation (/clear, /history, /exit)
    Chat,
    /// Re-drive a recorded conversation from an audit log
    Replay(ReplayCommand),
    /// Create a config file with defaults
    Init(InitCommand),
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Args)]
struct AskCommand {
    /// Message to send
    #[arg(value_name = "MESSAGE", required = true, num_args = 1..)]
    message: Vec<String>,
}

#[derive(Debug, Args)]
struct ReplayCommand {
    /// Audit log file to replay
    #[arg(value_name = "AUDIT_FILE")]
    path: PathBuf,
}

#[derive(Debug, Args)]
struct InitCommand {
    /// Overwrite an existing config file
    #[arg(long = "force")]
    force: bool,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Print the effective configuration
    Show,
    /// Print the config file path
    Path,
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    config_file: PathBuf,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let config_file = config::config_file_path(common.config.clone())?;
        let mut config = AppConfig::load(&config_file)?;

        if let Some(model) = &common.model {
            config.upstream.model = Some(model.clone());
        }
        if let Some(mode) = common.permission_mode {
            config.upstream.permission_mode = mode;
        }

        Ok(Self {
            common,
            config_file,
            config,
        })
    }

    fn init_logging(&self) -> Result<()> {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        if self.common.quiet {
            log::set_max_level(LevelFilter::Off);
            return Ok(());
        }

        let level = self.effective_log_level();
        let level_name = match level {
            LevelFilter::Off => "off",
            LevelFilter::Error => "error",
            LevelFilter::Warn => "warn",
            LevelFilter::Info => "info",
            LevelFilter::Debug => "debug",
            LevelFilter::Trace => "trace",
        };

        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("colloquy={level_name},colloquy_protocol={level_name}"))
        });

        if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(io::stderr))
                .try_init()
                .ok();
        } else {
            let force_color = matches!(self.common.color, ColorOption::Always)
                || env::var_os("FORCE_COLOR").is_some();
            let disable_color = self.common.no_color
                || matches!(self.common.color, ColorOption::Never)
                || env::var_os("NO_COLOR").is_some()
                || (!force_color && !io::stderr().is_terminal());

            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(io::stderr)
                        .with_ansi(!disable_color)
                        .with_target(self.common.diagnostics)
                        .with_file(self.common.diagnostics)
                        .with_line_number(self.common.diagnostics),
                )
                .try_init()
                .ok();
        }

        // The library logs through the `log` facade.
        let mut builder =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"));
        builder.filter_level(level);
        builder.try_init().ok();

        Ok(())
    }

    fn effective_log_level(&self) -> LevelFilter {
        if self.common.trace {
            LevelFilter::Trace
        } else if self.common.debug {
            LevelFilter::Debug
        } else {
            match self.common.verbose {
                0 => LevelFilter::from_str(&self.config.logging.level).unwrap_or(LevelFilter::Warn),
                1 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }

    async fn open_audit(&self) -> Result<AuditLogger> {
        if !self.config.audit.enabled {
            return Ok(AuditLogger::disabled());
        }
        let dir = self.config.audit_dir()?;
        let audit = AuditLogger::open(&dir, &self.config.audit.file_prefix).await?;
        if let Some(path) = audit.path() {
            info!("audit log: {}", path.display());
        }
        Ok(audit)
    }

    async fn build_manager(&self, upstream: Arc<dyn Upstream>) -> Result<SessionManager> {
        let audit = self.open_audit().await?;
        let mut manager = SessionManager::new(upstream, audit)
            .with_permission_mode(self.config.upstream.permission_mode);
        if let Some(session) = &self.common.session {
            manager = manager.with_session_id(session.clone());
        }
        Ok(manager)
    }

    fn process_upstream(&self) -> Result<Arc<dyn Upstream>> {
        let process = self.config.upstream.to_process_config()?;
        Ok(Arc::new(ProcessUpstream::new(process)))
    }
}

async fn handle_ask(ctx: &RuntimeContext, cmd: AskCommand) -> Result<()> {
    let message = cmd.message.join(" ");
    let mut manager = ctx.build_manager(ctx.process_upstream()?).await?;

    let result = run_turn(&mut manager, &message, ctx.common.json).await?;
    manager.close().await;

    if result.is_error {
        return Err(anyhow!(
            "turn failed: {}",
            result.error.as_deref().unwrap_or("unknown error")
        ));
    }
    Ok(())
}

async fn handle_chat(ctx: &RuntimeContext) -> Result<()> {
    let mut manager = ctx.build_manager(ctx.process_upstream()?).await?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        eprint!("> ");
        io::stderr().flush().ok();

        let Some(line) = lines.next_line().await.context("reading stdin")? else {
            break;
        };
        let line = line.trim();
        match line {
            "" => continue,
            "/exit" | "/quit" => break,
            "/clear" => {
                manager.clear_history();
                eprintln!("history cleared");
            }
            "/history" => print_history(&manager, ctx.common.json)?,
            message => {
                run_turn(&mut manager, message, ctx.common.json).await?;
            }
        }
    }

    manager.close().await;
    Ok(())
}

async fn handle_replay(ctx: &RuntimeContext, cmd: ReplayCommand) -> Result<()> {
    let turns = replay_messages(&cmd.path)
        .with_context(|| format!("reading audit log {}", cmd.path.display()))?;
    if turns.is_empty() {
        warn!("no upstream messages found in {}", cmd.path.display());
        return Ok(());
    }
    let prompts = recorded_prompts(&cmd.path)?;

    let upstream = turns
        .into_iter()
        .fold(ScriptedUpstream::new(), ScriptedUpstream::with_turn);
    let turn_count = prompts.len().max(1);
    let mut manager = ctx.build_manager(Arc::new(upstream)).await?;

    for index in 0..turn_count {
        let prompt = prompts
            .get(index)
            .cloned()
            .unwrap_or_else(|| format!("(replayed turn {})", index + 1));
        if !ctx.common.json {
            println!("> {prompt}");
        }
        run_turn(&mut manager, &prompt, ctx.common.json).await?;
    }

    manager.close().await;
    Ok(())
}

/// User messages recorded in an audit log, in order.
fn recorded_prompts(path: &std::path::Path) -> Result<Vec<String>> {
    let records = colloquy::audit::read_records(path)?;
    Ok(records
        .into_iter()
        .filter(|r| r.event_type == AuditEventType::HistoryAppend)
        .filter(|r| r.data.get("role").and_then(Value::as_str) == Some("user"))
        .filter_map(|r| r.data.get("text").and_then(Value::as_str).map(str::to_string))
        .collect())
}

/// Drive one turn, rendering events as they arrive.
async fn run_turn(manager: &mut SessionManager, message: &str, json: bool) -> Result<TurnResult> {
    let mut stream = manager.converse(message, ConverseOptions::new())?;
    let mut printed_text = false;
    let mut result = None;

    while let Some(event) = stream.next().await {
        if json {
            println!(
                "{}",
                serde_json::to_string(&event).context("serializing event")?
            );
        }
        match event {
            ConverseEvent::SessionStarted { session_id, model } => {
                debug!("session {session_id:?} (model {model:?})");
            }
            ConverseEvent::Partial { text } => {
                if !json {
                    if printed_text {
                        println!();
                    }
                    println!("{text}");
                }
                printed_text = true;
            }
            ConverseEvent::ToolUse { invocation } => {
                if !json {
                    eprintln!("[tool] {} {}", invocation.name, invocation.input);
                }
            }
            ConverseEvent::ToolResult { invocation } => {
                if !json && invocation.is_error {
                    eprintln!("[tool] {} failed", invocation.name);
                }
            }
            ConverseEvent::Passthrough { payload } => {
                debug!("passthrough: {payload}");
            }
            ConverseEvent::Complete(turn) => {
                result = Some(turn);
            }
        }
    }
    drop(stream);

    let result = result.ok_or_else(|| anyhow!("turn ended without a result"))?;
    if !json {
        if !printed_text || result.is_error {
            println!("{}", result.response);
        }
        eprintln!(
            "[session {}] cost ${:.4}, {} tool call(s)",
            result.session_id.as_deref().unwrap_or("-"),
            result.cost_usd,
            result.tools_used.len()
        );
    }
    Ok(result)
}

fn print_history(manager: &SessionManager, json: bool) -> Result<()> {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(manager.history()).context("serializing history")?
        );
        return Ok(());
    }
    for turn in manager.history() {
        let label = match turn.role {
            Role::User => "you",
            Role::Assistant => "assistant",
        };
        println!("{label}: {}", turn.text);
        for call in &turn.tool_calls {
            println!("  [tool] {}", call.name);
        }
    }
    Ok(())
}

fn handle_init(ctx: &RuntimeContext, cmd: InitCommand) -> Result<()> {
    if ctx.config_file.exists() && !cmd.force {
        return Err(anyhow!(
            "config already exists at {} (use --force to overwrite)",
            ctx.config_file.display()
        ));
    }
    config::write_default_config(&ctx.config_file)?;
    info!("wrote default config to {}", ctx.config_file.display());
    Ok(())
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            if ctx.common.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&ctx.config)
                        .context("serializing config to JSON")?
                );
            } else {
                print!(
                    "{}",
                    toml::to_string_pretty(&ctx.config).context("serializing config to TOML")?
                );
            }
            Ok(())
        }
        ConfigCommand::Path => {
            println!("{}", ctx.config_file.display());
            Ok(())
        }
    }
}

fn handle_completions(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
    Ok(())
}
