//! `scope-client`: command-line access to the scope server and the stand.
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::info;
use tracing_subscriber::EnvFilter;

use scope_control::rpc::transfer::describe_image;
use scope_control::rpc::{proxy_namespace, ImageFetcher, Kwargs, Reply, RpcClient, ZmqConnector};
use scope_control::ScopeConfig;

#[derive(Parser)]
#[command(name = "scope-client")]
#[command(about = "Talk to the microscope server and stand", long_about = None)]
#[command(version)]
struct Cli {
    /// TOML configuration file (SCOPE_* environment variables still apply)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Server host, overriding the configuration
    #[arg(long)]
    host: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List every remote procedure with its signature
    Describe,

    /// Call a remote procedure; Ctrl-C interrupts it on the server
    Call {
        /// Qualified procedure name, e.g. stage.move_to
        command: String,
        /// Positional arguments as JSON (bare words are taken as strings)
        args: Vec<String>,
        /// Keyword argument as key=json; may be repeated
        #[arg(long = "kw", value_name = "KEY=JSON")]
        kwargs: Vec<String>,
    },

    /// Read a property, e.g. stage.x
    Get { property: String },

    /// Write a property
    Set { property: String, value: String },

    /// Fetch a named image buffer from the server
    Fetch {
        name: String,
        /// Leave the buffer registered on the server
        #[arg(long)]
        keep: bool,
    },

    /// Query the Leica stand over its serial port
    #[cfg(feature = "serial")]
    Leica {
        /// Five-digit command code
        code: u32,
        params: Vec<String>,
    },
}

fn parse_json_arg(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn parse_kwargs(raw: &[String]) -> Result<Kwargs> {
    let mut kwargs = Kwargs::new();
    for item in raw {
        let Some((key, value)) = item.split_once('=') else {
            bail!("keyword argument {item:?} is not KEY=JSON");
        };
        kwargs.insert(key.to_string(), parse_json_arg(value));
    }
    Ok(kwargs)
}

fn load_config(cli: &Cli) -> Result<ScopeConfig> {
    let mut config = match &cli.config {
        Some(path) => ScopeConfig::load_from(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => ScopeConfig::from_env().context("loading configuration from environment")?,
    };
    if let Some(host) = &cli.host {
        config.server.host = host.clone();
        config.validate()?;
    }
    Ok(config)
}

fn print_reply(reply: Reply) -> Result<()> {
    match reply {
        Reply::Value(value) => println!("{}", serde_json::to_string_pretty(&value)?),
        Reply::Binary(data) => println!("<{} bytes of binary data>", data.len()),
    }
    Ok(())
}

#[cfg(feature = "serial")]
fn query_stand(config: &ScopeConfig, code: u32, params: Vec<String>) -> Result<()> {
    use scope_control::device::leica::LEICA_TERMINATOR;
    use scope_control::device::LeicaDevice;
    use scope_control::messaging::{serial, LeicaStrategy, ResponseCorrelator};

    let (sink, source) = serial::open(&config.stand, LEICA_TERMINATOR)?;
    let correlator = Arc::new(ResponseCorrelator::spawn(LeicaStrategy::new(), sink, source)?);
    let stand = LeicaDevice::new(correlator.clone(), config.client.timeout());
    let response = stand.query(code, params.as_slice(), &format!("command {code:05}"))?;
    println!("{} {}", response.header, response.body);
    correlator.shutdown();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("scope_control=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        #[cfg(feature = "serial")]
        Commands::Leica { code, params } => {
            tokio::task::spawn_blocking(move || query_stand(&config, code, params)).await?
        }
        command => run_rpc(&config, command).await,
    }
}

async fn run_rpc(config: &ScopeConfig, command: Commands) -> Result<()> {
    let mut client = RpcClient::from_config(Arc::new(ZmqConnector), config)
        .await
        .with_context(|| format!("connecting to {}", config.server.rpc_addr()))?;
    info!("Connected to {}", config.server.rpc_addr());

    match command {
        Commands::Describe => {
            let client = client.into_shared();
            let root = proxy_namespace(&client).await?;
            print!("{}", root.describe_tree());
            println!("({} procedures)", root.functions_proxied().len());
        }
        Commands::Call { command, args, kwargs } => {
            let args: Vec<Value> = args.iter().map(String::as_str).map(parse_json_arg).collect();
            let kwargs = parse_kwargs(&kwargs)?;
            let reply = if config.client.interrupt {
                let ctrl_c = async {
                    // a failed handler install just means no interrupt
                    if tokio::signal::ctrl_c().await.is_err() {
                        std::future::pending::<()>().await;
                    }
                };
                client.call_interruptible(&command, &args, &kwargs, ctrl_c).await?
            } else {
                client.call(&command, &args, &kwargs).await?
            };
            print_reply(reply)?;
        }
        Commands::Get { property } => {
            let client = client.into_shared();
            let root = proxy_namespace(&client).await?;
            let value = root.get(&property).await?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        Commands::Set { property, value } => {
            let client = client.into_shared();
            let root = proxy_namespace(&client).await?;
            root.set(&property, parse_json_arg(&value)).await?;
        }
        Commands::Fetch { name, keep } => {
            let fetcher = ImageFetcher::new(client.into_shared());
            let image = fetcher.fetch(&name, !keep).await?;
            println!("{}", serde_json::to_string_pretty(&describe_image(&image))?);
        }
        #[cfg(feature = "serial")]
        Commands::Leica { .. } => bail!("the leica command talks to the stand, not the server"),
    }
    Ok(())
}
