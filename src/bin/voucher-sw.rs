use std::env;
use std::path::PathBuf;

use voucher_sw::AppConfig;

fn print_usage() {
    eprintln!("Usage: voucher-sw [OPTIONS]");
    eprintln!();
    eprintln!("Runs the voucher portal's service worker as a local caching proxy.");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -c, --config <FILE>   Configuration file (default: <config dir>/voucher-sw/config.toml)");
    eprintln!("      --host <HOST>     Bind address (default: 127.0.0.1)");
    eprintln!("      --port <PORT>     Bind port (default: 8787)");
    eprintln!("      --origin <URL>    Backend origin (default: http://127.0.0.1:5000)");
    eprintln!("  -h, --help            Show this help");
    eprintln!();
    eprintln!("Logging is controlled with RUST_LOG (default: info).");
}

fn value(args: &[String], i: usize, flag: &str) -> String {
    args.get(i).cloned().unwrap_or_else(|| {
        eprintln!("Error: {flag} requires a value");
        std::process::exit(1);
    })
}

#[tokio::main]
async fn main() -> voucher_sw::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut config_path: Option<PathBuf> = None;
    let mut host: Option<String> = None;
    let mut port: Option<u16> = None;
    let mut origin: Option<String> = None;

    let args: Vec<String> = env::args().skip(1).collect();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "-c" | "--config" => {
                i += 1;
                config_path = Some(PathBuf::from(value(&args, i, "--config")));
            }
            "--host" => {
                i += 1;
                host = Some(value(&args, i, "--host"));
            }
            "--port" => {
                i += 1;
                let raw = value(&args, i, "--port");
                port = Some(raw.parse().unwrap_or_else(|_| {
                    eprintln!("Error: invalid port {raw:?}");
                    std::process::exit(1);
                }));
            }
            "--origin" => {
                i += 1;
                origin = Some(value(&args, i, "--origin"));
            }
            "-h" | "--help" => {
                print_usage();
                std::process::exit(0);
            }
            other => {
                eprintln!("Error: unknown argument {other:?}");
                print_usage();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    let mut config = AppConfig::load(config_path.as_deref())?;
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }
    if let Some(origin) = origin {
        config.worker.origin = origin;
    }
    config.validate()?;

    voucher_sw::server::run(config).await
}
