/***************************************/
/*        3rd party libraries          */
/***************************************/
use clap::{Parser, Subcommand};
use crossbeam_channel as cbc;
use log::{error, info};
use std::path::PathBuf;
use std::process::exit;
use std::thread::Builder;

/***************************************/
/*           Local modules             */
/***************************************/
#[macro_use]
mod shared;
mod bus;
mod config;
mod controller;
mod scheduler;

use bus::{RedisBus, RetryPolicy};
use config::Config;
use controller::ElevatorController;
use scheduler::Scheduler;
use shared::{BusError, ElevatorId};

/***************************************/
/*                CLI                  */
/***************************************/
#[derive(Parser, Debug)]
#[clap(name = "elevator-sim", about = "Elevator dispatch and simulation over a shared message bus")]
struct Cli {
    /// Path to the TOML configuration file
    #[clap(long, default_value = "config.toml")]
    config: PathBuf,

    /// Log filter used when RUST_LOG is not set
    #[clap(long, default_value = "info")]
    log_level: String,

    #[clap(subcommand)]
    mode: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Every configured controller plus one scheduler in this process
    Run,
    /// Only the scheduler
    Scheduler,
    /// Only the controller of one elevator
    Controller {
        #[clap(long)]
        id: ElevatorId,
    },
}

// Completion report of a component thread
type Exit = (String, Result<(), BusError>);

/***************************************/
/*                Main                 */
/***************************************/
fn main() {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .format_timestamp_millis()
        .init();

    // Load the configuration
    let config = unwrap_or_exit!(config::load_config(&cli.config));
    info!(
        "config_loaded: path={}, elevators={:?}, floors=[{}, {}]",
        cli.config.display(),
        config.elevator.ids,
        config.building.min_floor,
        config.building.max_floor
    );

    let (terminate_tx, terminate_rx) = cbc::unbounded::<()>();
    let (exit_tx, exit_rx) = cbc::unbounded::<Exit>();

    let components = match cli.mode {
        Mode::Run => {
            for &id in config.elevator.ids.iter() {
                start_controller(&config, id, terminate_rx.clone(), exit_tx.clone());
            }
            start_scheduler(&config, terminate_rx.clone(), exit_tx.clone());
            config.elevator.ids.len() + 1
        }
        Mode::Scheduler => {
            start_scheduler(&config, terminate_rx.clone(), exit_tx.clone());
            1
        }
        Mode::Controller { id } => {
            if !config.elevator.ids.contains(&id) {
                error!("unknown_elevator: id={}, configured={:?}", id, config.elevator.ids);
                exit(1);
            }
            start_controller(&config, id, terminate_rx.clone(), exit_tx.clone());
            1
        }
    };
    drop(exit_tx);
    install_shutdown_handler(terminate_tx, components);

    // Any component giving up takes the process down, the supervisor restarts it
    for _ in 0..components {
        match exit_rx.recv() {
            Ok((name, Ok(()))) => info!("component_stopped: {}", name),
            Ok((name, Err(e))) => {
                error!("component_failed: {}, error={}", name, e);
                exit(1);
            }
            Err(_) => break,
        }
    }
}

// SIGINT or SIGTERM stops every component, each flushing its pending state write
fn install_shutdown_handler(terminate_tx: cbc::Sender<()>, components: usize) {
    unwrap_or_exit!(ctrlc::set_handler(move || {
        info!("shutdown_requested: components={}", components);
        for _ in 0..components {
            let _ = terminate_tx.send(());
        }
    }));
}

fn connect(config: &Config) -> RedisBus {
    unwrap_or_exit!(RedisBus::new(&config.bus, RetryPolicy::new(&config.retry)))
}

fn start_controller(
    config: &Config,
    id: ElevatorId,
    terminate_rx: cbc::Receiver<()>,
    exit_tx: cbc::Sender<Exit>,
) {
    let name = format!("controller-{}", id);
    let controller = unwrap_or_exit!(ElevatorController::new(config, id, connect(config), terminate_rx));

    let thread_name = name.clone();
    unwrap_or_exit!(Builder::new().name(thread_name).spawn(move || {
        let result = controller.run();
        let _ = exit_tx.send((name, result));
    }));
}

fn start_scheduler(config: &Config, terminate_rx: cbc::Receiver<()>, exit_tx: cbc::Sender<Exit>) {
    let name = config.scheduler.consumer_name();
    let scheduler = Scheduler::new(config, connect(config), terminate_rx);

    let thread_name = name.clone();
    unwrap_or_exit!(Builder::new().name(thread_name).spawn(move || {
        let result = scheduler.run();
        let _ = exit_tx.send((name, result));
    }));
}
