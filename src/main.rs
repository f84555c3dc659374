mod config;

/// Version injected at compile time via ARMCTL_VERSION env var (set by CI/CD),
/// or the crate version for local builds.
pub const VERSION: &str = match option_env!("ARMCTL_VERSION") {
    Some(v) => v,
    None => env!("CARGO_PKG_VERSION"),
};

use anyhow::{Context as _, Result};
use armcore::auth::ClientSecretCredential;
use armcore::http::{Method, Request};
use armcore::lro::FinalResponse;
use armcore::{ArmClient, Context, FinalStateVia, Poller, ResponseError};
use clap::{Parser, Subcommand, ValueEnum};
use config::Config;
use serde_json::Value;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use url::Url;

/// Resource manager requests and long-running operations from the command line
#[derive(Parser, Debug)]
#[command(name = "armctl", version = VERSION, about, long_about = None)]
struct Args {
    /// Resource manager endpoint
    #[arg(long, global = true)]
    endpoint: Option<String>,

    /// Log level for debugging
    #[arg(long, value_enum, default_value = "off", global = true)]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send a request; mutating verbs are tracked as long-running operations
    Send {
        /// HTTP method
        #[arg(long, default_value = "GET")]
        method: String,

        /// Path and query, e.g. /subscriptions/{id}/resourceGroups/rg?api-version=2021-04-01
        #[arg(long)]
        path: String,

        /// JSON file sent as the request body
        #[arg(long)]
        body: Option<PathBuf>,

        /// Identifies the operation type inside resume tokens
        #[arg(long, default_value = "armctl.Operation")]
        poller_id: String,

        /// Where a POST operation's result lives
        #[arg(long, value_parser = parse_final_state)]
        final_state: Option<FinalStateVia>,

        /// Do not wait; emit a resume token instead
        #[arg(long)]
        no_wait: bool,

        /// Write the resume token to this file instead of stdout
        #[arg(long)]
        token_out: Option<PathBuf>,
    },

    /// Resume an operation from a token file and wait for it
    Resume {
        #[arg(long)]
        poller_id: String,

        /// File holding the resume token
        #[arg(long)]
        token: PathBuf,
    },

    /// Register a resource provider and wait until it is registered
    Register {
        #[arg(long)]
        subscription: String,

        /// Provider namespace, e.g. Microsoft.Storage
        #[arg(long)]
        namespace: String,
    },
}

fn parse_final_state(s: &str) -> std::result::Result<FinalStateVia, String> {
    s.parse().map_err(|e: armcore::Error| e.to_string())
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Option<Level> {
        match self {
            LogLevel::Off => None,
            LogLevel::Error => Some(Level::ERROR),
            LogLevel::Warn => Some(Level::WARN),
            LogLevel::Info => Some(Level::INFO),
            LogLevel::Debug => Some(Level::DEBUG),
            LogLevel::Trace => Some(Level::TRACE),
        }
    }
}

fn setup_logging(level: LogLevel) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let tracing_level = level.to_tracing_level()?;

    let log_path = get_log_path();

    if let Some(parent) = log_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    let file = match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
    {
        Ok(file) => file,
        Err(err) => {
            eprintln!("warning: cannot open log file {}: {}", log_path.display(), err);
            return None;
        }
    };

    let (non_blocking, guard) = tracing_appender::non_blocking(file);

    tracing_subscriber::fmt()
        .with_max_level(tracing_level)
        .with_writer(non_blocking.with_max_level(tracing_level))
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::info!("armctl {} started with log level: {:?}", VERSION, level);
    tracing::info!("Log file: {:?}", log_path);

    Some(guard)
}

fn get_log_path() -> PathBuf {
    if let Some(config_dir) = dirs::config_dir() {
        return config_dir.join("armctl").join("armctl.log");
    }
    if let Some(home) = dirs::home_dir() {
        return home.join(".armctl").join("armctl.log");
    }
    PathBuf::from("armctl.log")
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let _log_guard = setup_logging(args.log_level);

    let ctx = Context::new();
    {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Interrupted, cancelling");
                ctx.cancel();
            }
        });
    }

    match run(args, &ctx).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:#}");
            if err
                .downcast_ref::<armcore::Error>()
                .is_some_and(armcore::Error::is_retriable)
            {
                eprintln!("The service reported a transient failure; the command can be retried.");
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args, ctx: &Context) -> Result<()> {
    let config = Config::load();
    let endpoint = config.effective_endpoint(args.endpoint.as_deref());
    let endpoint = Url::parse(&endpoint).with_context(|| format!("Invalid endpoint {endpoint}"))?;

    let credential = ClientSecretCredential::from_env()
        .context("Failed to configure credentials from AZURE_* environment variables")?;
    let client = ArmClient::new(endpoint, Arc::new(credential), config.client_options())
        .context("Failed to create client")?;

    match args.command {
        Command::Send {
            method,
            path,
            body,
            poller_id,
            final_state,
            no_wait,
            token_out,
        } => {
            let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
                .with_context(|| format!("Invalid HTTP method {method}"))?;
            let mut request = Request::new(method.clone(), client.url(&path)?);
            if let Some(file) = body {
                let bytes = std::fs::read(&file)
                    .with_context(|| format!("Failed to read {}", file.display()))?;
                request = request.with_json_body(bytes);
            }

            if method == Method::GET || method == Method::HEAD {
                let response = client.send(ctx, request).await?;
                if !response.status().is_success() {
                    return Err(armcore::Error::from(ResponseError::from_response(&response)).into());
                }
                print_body(response.body());
                return Ok(());
            }

            let mut poller = client.begin(ctx, &poller_id, final_state, request).await?;
            if no_wait && !poller.done() {
                let token = poller.resume_token()?;
                match token_out {
                    Some(file) => {
                        std::fs::write(&file, token)
                            .with_context(|| format!("Failed to write {}", file.display()))?;
                        eprintln!("Operation is {}; resume token written to {}", poller.status(), file.display());
                    }
                    None => println!("{token}"),
                }
                return Ok(());
            }
            wait(&mut poller, ctx, &config).await
        }
        Command::Resume { poller_id, token } => {
            let token = std::fs::read_to_string(&token)
                .with_context(|| format!("Failed to read {}", token.display()))?;
            let mut poller = client.resume(&poller_id, token.trim())?;
            wait(&mut poller, ctx, &config).await
        }
        Command::Register {
            subscription,
            namespace,
        } => {
            let options = config.registration_options();
            let ctx = ctx.with_timeout(options.polling_duration);
            let provider = client
                .providers()
                .register_and_wait(&ctx, &subscription, &namespace, options.polling_delay)
                .await
                .with_context(|| format!("Failed to register {namespace}"))?;
            println!("{}", serde_json::to_string_pretty(&provider)?);
            Ok(())
        }
    }
}

async fn wait(poller: &mut Poller, ctx: &Context, config: &Config) -> Result<()> {
    eprintln!("Waiting for {} operation ({})", poller.kind(), poller.status());
    let result: FinalResponse<Value> = poller.poll_until_done(ctx, config.poll_frequency()).await?;
    eprintln!("Operation {} ({})", poller.status(), result.response.status());
    if let Some(value) = result.value {
        println!("{}", serde_json::to_string_pretty(&value)?);
    }
    Ok(())
}

fn print_body(body: &[u8]) {
    match serde_json::from_slice::<Value>(body) {
        Ok(value) => match serde_json::to_string_pretty(&value) {
            Ok(pretty) => println!("{pretty}"),
            Err(_) => println!("{}", String::from_utf8_lossy(body)),
        },
        Err(_) if body.is_empty() => {}
        Err(_) => println!("{}", String::from_utf8_lossy(body)),
    }
}
