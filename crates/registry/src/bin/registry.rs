//! The domain registry process.

use clap::Parser;
use cosim_registry::{exit_codes, RegistryServer};
use tracing_subscriber::EnvFilter;

/// Bootstrap registry for a simulation domain.
#[derive(Parser)]
#[command(name = "cosim-registry", version)]
struct Args {
    /// Host to listen on.
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 8500)]
    port: u16,

    /// Log filter (tracing syntax, e.g. "info" or "cosim_registry=debug").
    #[arg(long, default_value = "info")]
    log: String,
}

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            std::process::exit(if e.use_stderr() {
                exit_codes::BAD_ARGUMENTS
            } else {
                exit_codes::OK
            });
        }
    };

    if tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(args.log.clone()))
        .try_init()
        .is_err()
    {
        eprintln!("invalid log filter: {}", args.log);
        std::process::exit(exit_codes::CONFIGURATION_ERROR);
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start runtime: {e}");
            std::process::exit(exit_codes::RUNTIME_ERROR);
        }
    };

    let code = runtime.block_on(async {
        let server = match RegistryServer::bind(&args.host, args.port).await {
            Ok(server) => server,
            Err(e) => {
                eprintln!("{e}");
                return exit_codes::RUNTIME_ERROR;
            }
        };
        println!(
            "registry listening on {} — press Ctrl-C to stop",
            server.local_addr()
        );
        let _ = tokio::signal::ctrl_c().await;
        exit_codes::OK
    });
    std::process::exit(code);
}
