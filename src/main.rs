use std::process::ExitCode;
use std::sync::Arc;

use pg_jump::cancel::CancelRegistry;
use pg_jump::config::Config;
use pg_jump::listener::Listener;

struct Args {
    config_path: String,
    verbose: u8,
}

fn parse_args() -> Result<Args, String> {
    let mut config_path = None;
    let mut verbose: u8 = 0;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-c" | "--config" => {
                config_path = args.next();
            }
            "-v" => verbose = verbose.saturating_add(1),
            "-q" => verbose = 0,
            other => return Err(format!("unrecognized argument: {}", other)),
        }
    }

    let config_path = config_path.ok_or_else(|| "missing required --config <path>".to_string())?;
    Ok(Args {
        config_path,
        verbose,
    })
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = match parse_args() {
        Ok(a) => a,
        Err(e) => {
            eprintln!("pg-jump: {}", e);
            eprintln!("usage: pg-jump --config <path> [-v]");
            return ExitCode::FAILURE;
        }
    };

    init_logging(args.verbose);

    let config = match Config::load(&args.config_path) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            log::error!("failed to load config: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let registry = Arc::new(CancelRegistry::new());
    let listener = Listener::new(config, registry);
    let shutdown = listener.shutdown_handle();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("received interrupt, shutting down");
            shutdown.notify_one();
        }
    });

    match listener.serve().await {
        Ok(()) => {
            log::info!("server exiting");
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("server error: {}", e);
            ExitCode::FAILURE
        }
    }
}
