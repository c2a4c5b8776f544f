//! Delegation-aware attribution and policy hooks for AI coding agents.
//!
//! Hooks read the host's JSON payload on stdin and answer on stdout, with
//! diagnostics on stderr. State lives under `.baton/` in the project root.

use std::io::{self, Read};
use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use chrono::Duration;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::warn;

use baton::core::context::{SpawnEnv, spawn_env};
use baton::core::matcher::RuleMatcher;
use baton::core::tree::render_tree;
use baton::correlate::EventCorrelator;
use baton::exit_codes;
use baton::hook::{HookPayload, HookRuntime, fail_open_decision};
use baton::io::clock::SystemClock;
use baton::io::config::{ConfigPaths, load_policy_config, user_config_path};
use baton::io::env::{current_spawn_env, render_exports, utf8_var};
use baton::io::marker::read_marker;
use baton::io::paths::{BatonPaths, InitOptions, init_baton};
use baton::io::store::{SqliteStore, Store, UnavailableStore};
use baton::logging;
use baton::policy::PolicyEngine;
use baton::session::SessionRegistry;
use baton::settings::{render_entries, reset_layer, set_value, show_config};

#[derive(Parser)]
#[command(
    name = "baton",
    version,
    about = "Delegation-aware event attribution and policy enforcement"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.baton/` scaffolding and the state database.
    Init {
        /// Overwrite the config template and `.gitignore`.
        #[arg(short, long)]
        force: bool,
    },
    /// Handle a host hook; the payload is read from stdin.
    Hook {
        #[command(subcommand)]
        phase: HookPhase,
    },
    /// Print the environment a delegated subagent must inherit.
    SpawnEnv {
        /// Subagent type, also used as its agent label.
        #[arg(long)]
        subagent_type: String,
        /// Parent session (defaults to the current session).
        #[arg(long)]
        parent_session: Option<String>,
        /// Delegation event the subagent works under.
        #[arg(long)]
        parent_event: Option<String>,
        /// Print a JSON object instead of `export` lines.
        #[arg(long)]
        json: bool,
    },
    /// Inspect and manage sessions.
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },
    /// Print the call tree of a session and its subagents.
    Tree { session: String },
    /// Print breaker state for a session (defaults to the current session).
    Status {
        #[arg(long)]
        session: Option<String>,
    },
    /// Print every effective config key and the layer it came from.
    ShowConfig {
        #[arg(long)]
        json: bool,
    },
    /// Set a config key in the project layer (or the user layer with `--user`).
    SetConfig {
        key: String,
        value: String,
        #[arg(long)]
        user: bool,
    },
    /// Remove every override in the project layer (or the user layer with `--user`).
    ResetConfig {
        #[arg(long)]
        user: bool,
    },
}

#[derive(Subcommand, Clone, Copy)]
enum HookPhase {
    /// Before a tool runs: exit 0 to allow, 2 to block.
    PreTool,
    /// After a tool ran.
    PostTool,
}

#[derive(Subcommand)]
enum SessionAction {
    /// Close a session (defaults to the current session).
    Close { session: Option<String> },
    /// Re-parent a session.
    Link { child: String, parent: String },
    /// Mark sessions idle for longer than `--max-idle-secs` stale.
    Reap {
        #[arg(long, default_value_t = 3600)]
        max_idle_secs: i64,
    },
    /// Print a session record as JSON.
    Show { session: String },
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init { force } => cmd_init(force),
        Command::Hook { phase } => cmd_hook(phase),
        Command::SpawnEnv {
            subagent_type,
            parent_session,
            parent_event,
            json,
        } => cmd_spawn_env(&subagent_type, parent_session, parent_event, json),
        Command::Session { action } => cmd_session(action),
        Command::Tree { session } => cmd_tree(&session),
        Command::Status { session } => cmd_status(session),
        Command::ShowConfig { json } => cmd_show_config(json),
        Command::SetConfig { key, value, user } => cmd_set_config(&key, &value, user),
        Command::ResetConfig { user } => cmd_reset_config(user),
    }
}

/// Project locations resolved from a working directory.
struct Project {
    paths: BatonPaths,
    config_paths: ConfigPaths,
}

impl Project {
    fn discover(cwd: Option<&Path>) -> Result<Self> {
        let start = match cwd {
            Some(dir) => dir.to_path_buf(),
            None => std::env::current_dir().context("resolve current directory")?,
        };
        let paths = BatonPaths::discover(&start);
        let config_paths = ConfigPaths {
            project: paths.config_path.clone(),
            user: user_config_path(utf8_var),
        };
        Ok(Self {
            paths,
            config_paths,
        })
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.paths.db_path)
            .with_context(|| format!("open store {}", self.paths.db_path.display()))
    }

    /// Store for hooks: a failure to open degrades instead of erroring.
    fn open_store_lenient(&self) -> Box<dyn Store> {
        match SqliteStore::open(&self.paths.db_path) {
            Ok(store) => Box::new(store),
            Err(err) => {
                warn!(error = %err, "store unavailable");
                Box::new(UnavailableStore::new(err.to_string()))
            }
        }
    }

    /// Session named by the marker, or an error naming the flag to pass.
    fn current_session(&self, explicit: Option<String>) -> Result<String> {
        if let Some(id) = explicit {
            return Ok(id);
        }
        read_marker(&self.paths.marker_path)?
            .map(|marker| marker.session_id)
            .ok_or_else(|| anyhow!("no current session; pass a session id"))
    }
}

fn cmd_init(force: bool) -> Result<i32> {
    let root = std::env::current_dir().context("resolve current directory")?;
    let paths = init_baton(&root, &InitOptions { force })?;
    println!("initialized {}", paths.baton_dir.display());
    Ok(exit_codes::OK)
}

fn cmd_hook(phase: HookPhase) -> Result<i32> {
    let mut raw = String::new();
    let payload = match io::stdin()
        .read_to_string(&mut raw)
        .context("read hook payload")
        .and_then(|_| HookPayload::parse(&raw))
    {
        Ok(payload) => payload,
        Err(err) => {
            // An unreadable payload must not break the host's tool call.
            warn!(error = %format!("{err:#}"), "ignoring hook payload");
            if matches!(phase, HookPhase::PreTool) {
                print_json(&fail_open_decision())?;
            }
            return Ok(exit_codes::OK);
        }
    };

    let project = match Project::discover(payload.cwd.as_deref()) {
        Ok(project) => project,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "no project directory");
            if matches!(phase, HookPhase::PreTool) {
                print_json(&fail_open_decision())?;
            }
            return Ok(exit_codes::OK);
        }
    };
    let config = load_policy_config(&project.config_paths).policy;
    let store = project.open_store_lenient();
    let env = current_spawn_env();
    let runtime = HookRuntime {
        store: store.as_ref(),
        clock: &SystemClock,
        matcher: &RuleMatcher,
        config: &config,
        env: &env,
        marker_path: Some(&project.paths.marker_path),
    };

    match phase {
        HookPhase::PreTool => {
            let outcome = runtime.pre_tool(&payload);
            print_json(&outcome)?;
            if let Some(message) = &outcome.decision.message {
                eprintln!("{message}");
            }
            Ok(if outcome.decision.allow {
                exit_codes::OK
            } else {
                exit_codes::BLOCK
            })
        }
        HookPhase::PostTool => {
            print_json(&runtime.post_tool(&payload))?;
            Ok(exit_codes::OK)
        }
    }
}

fn cmd_spawn_env(
    subagent_type: &str,
    parent_session: Option<String>,
    parent_event: Option<String>,
    json: bool,
) -> Result<i32> {
    if subagent_type.trim().is_empty() {
        bail!("--subagent-type must not be empty");
    }
    let parent = match parent_session {
        Some(id) => id,
        None => {
            let project = Project::discover(None)?;
            let store = project.open_store()?;
            let registry = SessionRegistry::new(&store, &SystemClock)
                .with_marker(project.paths.marker_path.clone());
            let context = registry.extract_context(&current_spawn_env());
            registry.get_or_create(&context).id
        }
    };
    let env: SpawnEnv = spawn_env(&parent, parent_event.as_deref(), subagent_type.trim());
    if json {
        print_json(&env.to_vars())?;
    } else {
        print!("{}", render_exports(&env));
    }
    Ok(exit_codes::OK)
}

fn cmd_session(action: SessionAction) -> Result<i32> {
    let project = Project::discover(None)?;
    let store = project.open_store()?;
    let registry =
        SessionRegistry::new(&store, &SystemClock).with_marker(project.paths.marker_path.clone());
    match action {
        SessionAction::Close { session } => {
            let id = project.current_session(session)?;
            if !registry.close(&id)? {
                bail!("unknown session {id}");
            }
            println!("closed {id}");
        }
        SessionAction::Link { child, parent } => {
            registry.link(&child, &parent)?;
            println!("linked {child} -> {parent}");
        }
        SessionAction::Reap { max_idle_secs } => {
            let max_idle = Duration::try_seconds(max_idle_secs)
                .filter(|d| *d > Duration::zero())
                .ok_or_else(|| anyhow!("--max-idle-secs must be positive"))?;
            for id in registry.reap_stale(max_idle)? {
                println!("{id}");
            }
        }
        SessionAction::Show { session } => {
            let record = store
                .get_session(&session)?
                .ok_or_else(|| anyhow!("unknown session {session}"))?;
            print_json(&record)?;
        }
    }
    Ok(exit_codes::OK)
}

fn cmd_tree(session: &str) -> Result<i32> {
    let project = Project::discover(None)?;
    let store = project.open_store()?;
    let forest = EventCorrelator::new(&store, &SystemClock).call_tree(session)?;
    print!("{}", render_tree(&forest));
    Ok(exit_codes::OK)
}

#[derive(Serialize)]
struct StatusReport {
    session_id: String,
    state: baton::core::breaker::BreakerState,
    effective_count: usize,
    threshold: u32,
    mode: String,
}

fn cmd_status(session: Option<String>) -> Result<i32> {
    let project = Project::discover(None)?;
    let session_id = project.current_session(session)?;
    let store = project.open_store()?;
    let config = load_policy_config(&project.config_paths).policy;
    let (state, effective_count) =
        PolicyEngine::new(&store, &SystemClock, &RuleMatcher, &config).status(&session_id)?;
    print_json(&StatusReport {
        session_id,
        state,
        effective_count,
        threshold: config.circuit_breaker_violations,
        mode: config.mode.to_string(),
    })?;
    Ok(exit_codes::OK)
}

fn cmd_show_config(json: bool) -> Result<i32> {
    let project = Project::discover(None)?;
    let entries = show_config(&project.config_paths);
    if json {
        print_json(&entries)?;
    } else {
        print!("{}", render_entries(&entries));
    }
    Ok(exit_codes::OK)
}

fn cmd_set_config(key: &str, value: &str, user: bool) -> Result<i32> {
    let project = Project::discover(None)?;
    let entry = set_value(&project.config_paths, key, value, user)?;
    println!("{} = {}  # {}", entry.key, entry.value, entry.source);
    Ok(exit_codes::OK)
}

fn cmd_reset_config(user: bool) -> Result<i32> {
    let project = Project::discover(None)?;
    if reset_layer(&project.config_paths, user)? {
        println!("config reset");
    } else {
        println!("nothing to reset");
    }
    Ok(exit_codes::OK)
}

/// Serialize `value` to pretty-printed JSON on stdout.
fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize json")?;
    println!("{payload}");
    Ok(())
}
