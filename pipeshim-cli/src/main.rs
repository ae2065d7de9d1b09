use std::path::PathBuf;
use std::process;
use std::time::Duration;

use anyhow::Context;
use pipeshim::{Bridge, BridgeConfig, Controller, Scalar};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

mod demo;

const USAGE: &str = "\
Usage:
  pipeshim serve [--request-pipe <path>] [--response-pipe <path>]
                 [--status-interval-ms <ms>] [--companion <shell command>]
  pipeshim call  [--request-pipe <path>] [--response-pipe <path>]
                 [--timeout-ms <ms>] <method> [args...]

Commands:
  serve    Run a bridge with the demo operations until interrupted
  call     Send one request to a running bridge and print the response

Arguments to `call` are sent as booleans, integers or floats when they
parse as one, and as strings otherwise.

Environment:
  PIPESHIM_REQUEST_PIPE, PIPESHIM_RESPONSE_PIPE    default pipe paths
  PIPESHIM_LOG                                     debug, info, warn or error
  LOG_FORMAT=json                                  JSON log lines";

#[derive(Debug, PartialEq)]
enum Command {
    Serve(ServeArgs),
    Call(CallArgs),
}

#[derive(Debug, PartialEq)]
struct ServeArgs {
    config: BridgeConfig,
    status_interval: Duration,
    companion: Option<String>,
}

#[derive(Debug, PartialEq)]
struct CallArgs {
    config: BridgeConfig,
    timeout: Duration,
    method: String,
    args: Vec<Scalar>,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let config = match BridgeConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            process::exit(2);
        }
    };

    let args: Vec<String> = std::env::args().collect();
    let command = match parse_args(&args, config) {
        Ok(command) => command,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("{USAGE}");
            process::exit(2);
        }
    };

    let result = match command {
        Command::Serve(args) => serve(args).await,
        Command::Call(args) => call(args).await,
    };

    match result {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("error: {e:#}");
            process::exit(1);
        }
    }
}

fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("PIPESHIM_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("pipeshim={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

fn parse_args(args: &[String], mut config: BridgeConfig) -> Result<Command, String> {
    let subcommand = args.get(1).ok_or("missing command")?;
    let serve = match subcommand.as_str() {
        "serve" => true,
        "call" => false,
        "--help" | "-h" | "help" => return Err(String::new()),
        other => return Err(format!("unknown command: {other}")),
    };

    let mut status_interval = Duration::from_secs(1);
    let mut companion = None;
    let mut timeout = Duration::from_secs(30);
    let mut method: Option<String> = None;
    let mut call_args = Vec::new();

    let mut i = 2; // skip argv[0] and the command
    while i < args.len() {
        let arg = args[i].as_str();

        // Everything after the method is an argument, even if it looks like a flag.
        if method.is_some() {
            call_args.push(parse_scalar(arg));
            i += 1;
            continue;
        }

        match arg {
            "--request-pipe" => {
                i += 1;
                config.request_path =
                    PathBuf::from(args.get(i).ok_or("--request-pipe requires a value")?);
            }
            "--response-pipe" => {
                i += 1;
                config.response_path =
                    PathBuf::from(args.get(i).ok_or("--response-pipe requires a value")?);
            }
            "--status-interval-ms" if serve => {
                i += 1;
                status_interval = parse_millis("--status-interval-ms", args.get(i))?;
            }
            "--companion" if serve => {
                i += 1;
                companion = Some(args.get(i).ok_or("--companion requires a value")?.clone());
            }
            "--timeout-ms" if !serve => {
                i += 1;
                timeout = parse_millis("--timeout-ms", args.get(i))?;
            }
            "--help" | "-h" => return Err(String::new()),
            flag if flag.starts_with("--") => return Err(format!("unknown flag: {flag}")),
            other if serve => return Err(format!("unexpected argument: {other}")),
            name => method = Some(name.to_string()),
        }
        i += 1;
    }

    if serve {
        return Ok(Command::Serve(ServeArgs {
            config,
            status_interval,
            companion,
        }));
    }

    let method = method.ok_or("missing required argument: <method>")?;
    Ok(Command::Call(CallArgs {
        config,
        timeout,
        method,
        args: call_args,
    }))
}

fn parse_millis(flag: &str, value: Option<&String>) -> Result<Duration, String> {
    let value = value.ok_or_else(|| format!("{flag} requires a value"))?;
    value
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| format!("{flag}: '{value}' is not a number of milliseconds"))
}

/// Command-line text to the narrowest matching scalar.
fn parse_scalar(text: &str) -> Scalar {
    match text {
        "true" => return Scalar::Bool(true),
        "false" => return Scalar::Bool(false),
        _ => {}
    }
    if let Ok(n) = text.parse::<i64>() {
        return Scalar::Int(n);
    }
    if let Ok(f) = text.parse::<f64>()
        && f.is_finite()
    {
        return Scalar::Float(f);
    }
    Scalar::from(text)
}

async fn serve(args: ServeArgs) -> anyhow::Result<i32> {
    let mut bridge = Bridge::initialize(args.config, &demo::DemoOperations::new())
        .context("failed to start bridge")?;

    if let Some(companion) = args.companion {
        let mut command = std::process::Command::new("sh");
        command.arg("-c").arg(companion);
        bridge.spawn_companion(command)?;
    }

    tracing::info!(
        request = %bridge.config().request_path.display(),
        response = %bridge.config().response_path.display(),
        "Bridge ready, press Ctrl-C to stop"
    );

    let status = bridge.status();
    let mut ticker = tokio::time::interval(args.status_interval);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut last_panel = String::new();
    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "Failed to listen for Ctrl-C");
                }
                break;
            }
            _ = ticker.tick() => {
                let panel = status.snapshot().to_string();
                if panel != last_panel {
                    eprint!("{panel}");
                    last_panel = panel;
                }
            }
        }
    }

    tracing::info!("Interrupted, shutting down");
    tokio::task::block_in_place(|| bridge.shutdown());
    Ok(0)
}

async fn call(args: CallArgs) -> anyhow::Result<i32> {
    let mut controller = Controller::from_config(&args.config)
        .with_context(|| {
            format!(
                "cannot open response pipe {}",
                args.config.response_path.display()
            )
        })?
        .with_timeout(args.timeout);

    let response = controller.call(&args.method, args.args).await?;
    println!("{}", serde_json::to_string(&response)?);

    Ok(if response.is_error() { 1 } else { 0 })
}
