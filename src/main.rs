use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use tokio::io::BufReader;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use fluux_codemode::capabilities::builtin;
use fluux_codemode::frontend;
use fluux_codemode::{Config, ExecutionRequest, RegistryBuilder, Sandbox};

const DEFAULT_CONFIG_PATH: &str = "config/codemode.toml";

fn print_help() {
    println!(
        "\
fluux-codemode v{}

Runs short snippets against a curated catalog of service capabilities,
inside a sandbox bounded in time and output.

USAGE:
    fluux-codemode [OPTIONS] [COMMAND]

COMMANDS:
    serve                  Read JSON requests from stdin, one per line (default)
    run FILE               Execute one snippet file and print the result
    discover [QUERY]       Print the catalog: basic, full or a service name
                           [default: basic]
    quick-start SERVICE    Print a runnable example for SERVICE

OPTIONS:
    -c, --config PATH    Path to TOML configuration file
                         [default: config/codemode.toml, built-in defaults
                         if that file does not exist]
    -h, --help           Print this help message and exit
    -V, --version        Print version and exit

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG              Log level filter for tracing, written to stderr
                          (e.g. debug, fluux_codemode=debug,warn)
    TAVILY_API_KEY        API key for Tavily web search
                          (from https://tavily.com)
    PERPLEXITY_API_KEY    API key for Perplexity Sonar search
                          (from https://perplexity.ai)

EXAMPLES:
    fluux-codemode                                  # serve on stdin/stdout
    fluux-codemode discover full                    # full catalog
    fluux-codemode -c /etc/fluux/codemode.toml run snippet.fx
    RUST_LOG=debug fluux-codemode run snippet.fx    # with debug logging",
        env!("CARGO_PKG_VERSION"),
    );
}

#[derive(Debug, PartialEq)]
enum Command {
    Serve,
    Run(String),
    Discover(String),
    QuickStart(String),
}

#[derive(Debug, PartialEq)]
struct Cli {
    config_path: Option<String>,
    command: Command,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Cli> {
    let mut config_path = None;
    let mut positional = Vec::new();
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-c" | "--config" => {
                let path = args
                    .next()
                    .ok_or_else(|| anyhow!("{arg} expects a path"))?;
                config_path = Some(path);
            }
            flag if flag.starts_with('-') => bail!("unknown option: {flag}"),
            _ => positional.push(arg),
        }
    }

    let mut positional = positional.into_iter();
    let command = match positional.next().as_deref() {
        None | Some("serve") => Command::Serve,
        Some("run") => Command::Run(
            positional
                .next()
                .ok_or_else(|| anyhow!("run expects a snippet file"))?,
        ),
        Some("discover") => {
            Command::Discover(positional.next().unwrap_or_else(|| "basic".to_string()))
        }
        Some("quick-start") => Command::QuickStart(
            positional
                .next()
                .ok_or_else(|| anyhow!("quick-start expects a service name"))?,
        ),
        Some(other) => bail!("unknown command: {other} (see --help)"),
    };
    if let Some(extra) = positional.next() {
        bail!("unexpected argument: {extra}");
    }

    Ok(Cli {
        config_path,
        command,
    })
}

fn load_config(explicit: Option<&str>) -> Result<Config> {
    match explicit {
        Some(path) => {
            info!("Loading configuration from {path}");
            Config::load(path).with_context(|| format!("cannot load {path}"))
        }
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
            info!("Loading configuration from {DEFAULT_CONFIG_PATH}");
            Config::load(DEFAULT_CONFIG_PATH)
                .with_context(|| format!("cannot load {DEFAULT_CONFIG_PATH}"))
        }
        None => {
            warn!("{DEFAULT_CONFIG_PATH} not found, using built-in defaults");
            Ok(Config::default())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Handle --help / --version before anything else
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("fluux-codemode v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {}
        }
    }

    // stdout carries protocol output, so logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("fluux_codemode=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = parse_args(std::env::args().skip(1))?;
    let config = load_config(cli.config_path.as_deref())?;

    let mut builder = RegistryBuilder::new();
    builtin::register_configured(&mut builder, &config.capabilities)?;
    info!("Capabilities: {} registered", builder.len());
    let sandbox = Arc::new(Sandbox::new(Arc::new(builder.build()), config.sandbox.clone()));

    match cli.command {
        Command::Serve => {
            let stdin = BufReader::new(tokio::io::stdin());
            tokio::select! {
                result = frontend::serve(Arc::clone(&sandbox), stdin, tokio::io::stdout()) => result?,
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown signal received, exiting");
                }
            }
        }
        Command::Run(path) => {
            let code = std::fs::read_to_string(&path)
                .with_context(|| format!("cannot read snippet {path}"))?;
            let result = sandbox.execute(ExecutionRequest::new(code)).await;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.is_success() {
                std::process::exit(1);
            }
        }
        Command::Discover(query) => {
            let catalog = sandbox.discover(&query)?;
            println!("{}", serde_json::to_string_pretty(&catalog)?);
        }
        Command::QuickStart(service) => {
            println!("{}", sandbox.quick_start(&service)?);
        }
    }

    Ok(())
}
