//! Passive system monitor: joins a domain and prints state transitions.

use clap::Parser;
use cosim_config::ParticipantConfiguration;
use cosim_participant::Participant;
use cosim_registry::exit_codes;
use tracing_subscriber::EnvFilter;

/// Observe participant and system states of a running domain.
#[derive(Parser)]
#[command(name = "cosim-monitor", version)]
struct Args {
    /// Registry host to connect to.
    #[arg(long, short = 'u', default_value = "localhost")]
    host: String,

    /// Registry port to connect to.
    #[arg(long, default_value_t = 8500)]
    port: u16,

    /// Participant name used to take part in the simulation.
    #[arg(long, short = 'n', default_value = "SystemMonitor")]
    name: String,

    /// Path of a participant configuration JSON file.
    #[arg(long, short = 'c')]
    configuration: Option<String>,

    /// Log filter (tracing syntax).
    #[arg(long, default_value = "warn")]
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
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(args.log.clone()))
        .try_init();

    let mut config = match &args.configuration {
        Some(path) => match ParticipantConfiguration::from_json_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("{e}");
                std::process::exit(exit_codes::CONFIGURATION_ERROR);
            }
        },
        None => ParticipantConfiguration::default(),
    };
    config.participant_name = Some(args.name.clone());
    config.middleware.registry.hostname = args.host.clone();
    config.middleware.registry.port = args.port;

    let participant = match Participant::connect(config) {
        Ok(participant) => participant,
        Err(e) => {
            eprintln!("failed to join domain: {e}");
            std::process::exit(exit_codes::RUNTIME_ERROR);
        }
    };

    let monitor = participant.system_monitor();
    monitor.add_participant_status_handler(|status| {
        println!(
            "{}: {} ({})",
            status.participant_name, status.state, status.enter_reason
        );
    });
    monitor.add_system_state_handler(|state| {
        println!("system state: {state}");
    });

    println!(
        "monitoring domain at {}:{} — press Ctrl-C to stop",
        args.host, args.port
    );
    let (tx, rx) = std::sync::mpsc::channel::<()>();
    let _ = ctrlc_channel(tx);
    let _ = rx.recv();
    drop(participant);
    std::process::exit(exit_codes::OK);
}

/// Minimal Ctrl-C hookup without extra dependencies: a tokio runtime just
/// for the signal future.
fn ctrlc_channel(tx: std::sync::mpsc::Sender<()>) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("signal runtime");
        runtime.block_on(async {
            let _ = tokio::signal::ctrl_c().await;
        });
        let _ = tx.send(());
    })
}
