use std::process;
use std::sync::Arc;

use debuglet::transport::{ServerConfig, serve, serve_stdio};
use debuglet::{DebugService, ServiceConfig};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Options {
    server: ServerConfig,
    stdio: bool,
    terminate_on_disconnect: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            stdio: false,
            terminate_on_disconnect: true,
        }
    }
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let mut options = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!(
                "Usage: debuglet-adapter [--host <addr>] [--port <n>] [--stdio] [--no-terminate-on-disconnect]"
            );
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --host <addr>                  Address to listen on [default: 127.0.0.1]");
            eprintln!("  --port <n>                     Port to listen on [default: 5678]");
            eprintln!("  --stdio                        Serve a single session on stdin/stdout");
            eprintln!("  --no-terminate-on-disconnect   Leave launched debuggees running on disconnect");
            process::exit(2);
        }
    };

    if std::env::var("DEBUGLET_TERMINATE_ON_DISCONNECT").as_deref() == Ok("0") {
        options.terminate_on_disconnect = false;
    }

    init_tracing();

    if let Err(e) = run(options) {
        tracing::error!(error = %e, "debuglet-adapter failed");
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn parse_args(args: &[String]) -> Result<Options, String> {
    let mut options = Options::default();

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--host" => {
                i += 1;
                options.server.host = args.get(i).ok_or("--host requires a value")?.clone();
            }
            "--port" => {
                i += 1;
                let value = args.get(i).ok_or("--port requires a value")?;
                options.server.port = value
                    .parse()
                    .map_err(|_| format!("invalid port: {value}"))?;
            }
            "--stdio" => options.stdio = true,
            "--no-terminate-on-disconnect" => options.terminate_on_disconnect = false,
            "--help" | "-h" => return Err(String::new()),
            arg => return Err(format!("unexpected argument: {arg}")),
        }
        i += 1;
    }

    Ok(options)
}

/// Initialize tracing with DEBUGLET_LOG and LOG_FORMAT support.
///
/// Always writes to stderr; stdout may be carrying the protocol.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let base_level = match std::env::var("DEBUGLET_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!(
            "debuglet={level},debuglet_adapter={level}",
            level = base_level
        ))
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

fn run(options: Options) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let config = ServiceConfig::default().with_terminate_on_disconnect(options.terminate_on_disconnect);
    let service = Arc::new(DebugService::new(config));

    tracing::info!(
        version = debuglet::DEBUGLET_VERSION,
        terminate_on_disconnect = options.terminate_on_disconnect,
        "Starting debuglet-adapter"
    );

    runtime.block_on(async move {
        if options.stdio {
            serve_stdio(service).await
        } else {
            serve(options.server, service).await
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(rest: &[&str]) -> Vec<String> {
        std::iter::once("debuglet-adapter")
            .chain(rest.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn defaults_to_tcp_on_localhost() {
        let options = parse_args(&args(&[])).unwrap();
        assert_eq!(options, Options::default());
        assert_eq!(options.server.host, "127.0.0.1");
        assert_eq!(options.server.port, 5678);
        assert!(!options.stdio);
        assert!(options.terminate_on_disconnect);
    }

    #[test]
    fn parses_all_flags() {
        let options = parse_args(&args(&[
            "--host",
            "0.0.0.0",
            "--port",
            "4711",
            "--stdio",
            "--no-terminate-on-disconnect",
        ]))
        .unwrap();
        assert_eq!(options.server.host, "0.0.0.0");
        assert_eq!(options.server.port, 4711);
        assert!(options.stdio);
        assert!(!options.terminate_on_disconnect);
    }

    #[test]
    fn rejects_bad_input() {
        assert_eq!(
            parse_args(&args(&["--port"])).unwrap_err(),
            "--port requires a value"
        );
        assert_eq!(
            parse_args(&args(&["--port", "spam"])).unwrap_err(),
            "invalid port: spam"
        );
        assert_eq!(
            parse_args(&args(&["--eggs"])).unwrap_err(),
            "unexpected argument: --eggs"
        );
        assert_eq!(parse_args(&args(&["--help"])).unwrap_err(), "");
    }
}
