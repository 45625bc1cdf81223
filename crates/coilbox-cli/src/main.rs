//! Coilbox CLI
//!
//! A command-line tool for running scripts in a suspendable wasm sandbox.

use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use coilbox::{
    Config, EXAMPLE_CONFIG, InputSource, OutputSink, ResourceLimits, Runner, run_to_completion,
};
use tracing::{Level, debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "coilbox")]
#[command(about = "A tool for running scripts in a suspendable wasm sandbox")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Overrides for the paths in the configuration file
#[derive(Args)]
struct ModuleArgs {
    /// Interpreter module (overrides `module_path`)
    #[arg(long)]
    module: Option<PathBuf>,

    /// Standard library directory (overrides `stdlib_path`)
    #[arg(long)]
    stdlib: Option<PathBuf>,

    /// Compiled artifact cache file (overrides `cache_path`)
    #[arg(long)]
    cache: Option<PathBuf>,
}

impl ModuleArgs {
    fn apply(self, config: &mut Config) {
        if let Some(module) = self.module {
            config.module_path = Some(module);
        }
        if let Some(stdlib) = self.stdlib {
            config.stdlib_path = Some(stdlib);
        }
        if let Some(cache) = self.cache {
            config.cache_path = Some(cache);
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new configuration file
    Init {
        /// Output path (default: coilbox.toml)
        #[arg(short, long, default_value = "coilbox.toml")]
        output: PathBuf,

        /// Overwrite existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Run a script (or the interpreter's interactive mode when no file is given)
    Run {
        /// Script to run
        #[arg(value_name = "FILE")]
        source: Option<PathBuf>,

        /// Input file fed to the guest's stdin (default: host stdin without FILE, empty with FILE)
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Instruction budget
        #[arg(short, long)]
        fuel: Option<u64>,

        /// Memory limit in bytes
        #[arg(short, long)]
        memory_limit: Option<u64>,

        /// Extra guest environment variable
        #[arg(short, long = "env", value_name = "KEY=VALUE", value_parser = parse_env_var)]
        envs: Vec<(String, String)>,

        #[command(flatten)]
        module: ModuleArgs,
    },

    /// Compile the interpreter module and populate the artifact cache
    Warm {
        #[command(flatten)]
        module: ModuleArgs,
    },

    /// Show the effective configuration
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::from_default_env().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    // Guest output owns stdout
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let mut config = if let Some(ref path) = cli.config {
        info!(?path, "loading configuration");
        Config::from_file(path).context("failed to load configuration")?
    } else {
        debug!("using default configuration");
        Config::default()
    };

    match cli.command {
        Commands::Init { output, force } => init_config(&output, force).await,
        Commands::Run {
            source,
            input,
            fuel,
            memory_limit,
            envs,
            module,
        } => {
            module.apply(&mut config);
            let limits = ResourceLimits {
                fuel,
                memory_bytes: memory_limit,
                ..ResourceLimits::unset()
            };
            let exit_code = run_script(
                config,
                source.as_deref(),
                input.as_deref(),
                &limits,
                envs,
            )
            .await?;
            if exit_code != 0 {
                std::process::exit(exit_code);
            }
            Ok(())
        }
        Commands::Warm { module } => {
            module.apply(&mut config);
            warm(config)
        }
        Commands::ShowConfig => {
            show_config(&config);
            Ok(())
        }
    }
}

async fn run_script(
    config: Config,
    source: Option<&Path>,
    input: Option<&Path>,
    overrides: &ResourceLimits,
    envs: Vec<(String, String)>,
) -> Result<i32> {
    let program = match source {
        Some(path) => Some(
            tokio::fs::read(path)
                .await
                .with_context(|| format!("failed to read script '{}'", path.display()))?,
        ),
        None => None,
    };

    let stdin = match stdin_plan(source, input) {
        StdinPlan::File(path) => InputSource::Bytes(
            tokio::fs::read(path)
                .await
                .context("failed to read input file")?,
        ),
        StdinPlan::Host => InputSource::Bytes(read_host_stdin().await?),
        StdinPlan::Empty => InputSource::Empty,
    };

    let limits = config.effective_limits(Some(overrides));
    let runner = Runner::new(config).context("failed to prepare interpreter")?;

    let mut sandbox = runner
        .sandbox()
        .limits(limits)
        .envs(envs)
        .stdin(stdin)
        .stdout(OutputSink::Inherit)
        .stderr(OutputSink::Inherit);
    if let Some(program) = program {
        sandbox = sandbox.program(program);
    }

    let mut controller = runner
        .instantiate(sandbox.build())
        .context("failed to create sandbox")?;

    info!(async_capable = controller.is_async_capable(), "running guest");
    match run_to_completion(&mut controller).await {
        Ok(exit_code) => {
            info!(
                exit_code,
                runs = controller.runs(),
                fuel_remaining = controller.fuel(),
                memory = controller.memory_bytes(),
                "guest finished"
            );
            controller.dispose();
            Ok(exit_code)
        }
        Err(e) if e.is_resource_exhaustion() => {
            warn!(error = %e, runs = controller.runs(), "guest exceeded its limits");
            Ok(1)
        }
        Err(e) => Err(e).context("execution failed"),
    }
}

/// Where the guest's stdin comes from
#[derive(Debug, PartialEq, Eq)]
enum StdinPlan<'a> {
    File(&'a Path),
    Host,
    Empty,
}

/// Host stdin is only forwarded to the interactive interpreter; a script run
/// from a file gets `--input` or nothing.
fn stdin_plan<'a>(source: Option<&Path>, input: Option<&'a Path>) -> StdinPlan<'a> {
    match (source, input) {
        (_, Some(path)) => StdinPlan::File(path),
        (None, None) => StdinPlan::Host,
        (Some(_), None) => StdinPlan::Empty,
    }
}

async fn read_host_stdin() -> Result<Vec<u8>> {
    tokio::task::spawn_blocking(|| {
        let mut buf = Vec::new();
        std::io::stdin().read_to_end(&mut buf).map(|_| buf)
    })
    .await
    .context("stdin reader panicked")?
    .context("failed to read stdin")
}

fn warm(config: Config) -> Result<()> {
    let runner = Runner::new(config).context("failed to prepare interpreter")?;
    println!("Cache: {:?}", runner.cache_status());
    println!("Async capable: {}", runner.artifact().is_async_capable());
    Ok(())
}

fn show_config(config: &Config) {
    let path = |p: &Option<PathBuf>| {
        p.as_ref()
            .map_or_else(|| "(unset)".to_string(), |p| p.display().to_string())
    };

    println!("Module: {}", path(&config.module_path));
    println!("Standard library: {}", path(&config.stdlib_path));
    println!("Artifact cache: {}", path(&config.cache_path));
    println!(
        "Bytecode cache dir: {}",
        config.bytecode_cache_dir.as_deref().unwrap_or("(disabled)")
    );
    println!("Program name: {}", config.program_name);
    println!();
    println!("Default resource limits:");
    println!("  Fuel: {:?}", config.default_limits.fuel);
    println!("  Memory: {:?} bytes", config.default_limits.memory_bytes);
    println!("  Table elements: {:?}", config.default_limits.table_elements);
    println!();
    println!("Mounts configured: {}", config.all_mounts().len());
    println!("Extra environment variables: {}", config.env.len());
}

async fn init_config(output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        anyhow::bail!(
            "Configuration file already exists at '{}'. Use --force to overwrite.",
            output.display()
        );
    }

    tokio::fs::write(output, EXAMPLE_CONFIG)
        .await
        .context("failed to write configuration file")?;

    println!("Created configuration file at '{}'", output.display());
    Ok(())
}

fn parse_env_var(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected KEY=VALUE, got '{s}'"))
}
