use std::{error::Error, fs, path::PathBuf, process, sync::Mutex};

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use carpool::{
    bootstrap,
    cli::{Cli, Commands, LogLevelArg, parse_args},
    config::{Config, load_config},
    connector::{Connector, ExecutableSpawner, LaunchArgs},
    constants::SERVICE_NAME,
    directory::DirectoryServer,
    ipc::{ApplicationInfo, StopOutcome, SupervisorClient},
    logs,
    service::DaemonIdentity,
    supervisor::Supervisor,
};

fn main() -> Result<(), Box<dyn Error>> {
    let args = parse_args();

    if let Some(Commands::Supervise {
        daemon_level,
        daemon_port,
        daemon_log_dir,
        no_capture,
    }) = &args.command
    {
        run_supervisor(*daemon_level, *daemon_port, daemon_log_dir.clone(), !no_capture);
    }

    let mut config = load_config(args.config.as_deref())?;
    config.apply_overrides(args.port, args.log_dir.clone(), args.log_level);
    init_logging(&args, &config);

    if let Some(Commands::Directory) = args.command {
        return run_directory(config.port);
    }

    if args.start && args.stop {
        error!("Please only use EITHER --start or --stop.");
        return Err("--start and --stop cannot be combined".into());
    }

    let connector = Connector::new(config.port).with_startup_wait(config.startup_wait());
    let client = if args.start {
        if let Some(status) = connector.probe() {
            error!(
                "You have asked to start the supervisor daemon, but it appears to already be running (PID {}).",
                status.pid
            );
            return Err("supervisor already running".into());
        }
        let (client, status) =
            connector.start(&ExecutableSpawner::current()?, &launch_args(&config)?)?;
        info!("Supervisor daemon online (PID {})", status.pid);
        client
    } else if args.autostart {
        let (client, _) =
            connector.connect_or_start(&ExecutableSpawner::current()?, &launch_args(&config)?)?;
        client
    } else {
        match connector.connect() {
            Ok((client, _)) => client,
            Err(err) => {
                error!(
                    "The supervisor daemon does not appear to be running. Please start it with --start."
                );
                return Err(err.into());
            }
        }
    };

    if args.status {
        let status = client.status()?;
        println!("Supervisor online: {}\nPID: {}", status.online, status.pid);
    }

    if let Some(command) = args.command {
        handle_command(command, &client)?;
    }

    if args.stop {
        match client.stop()? {
            StopOutcome::Acknowledged => info!("Supervisor daemon stopped"),
            StopOutcome::Severed => info!("Supervisor daemon stopped (connection closed)"),
        }
    }

    Ok(())
}

fn handle_command(command: Commands, client: &SupervisorClient) -> Result<(), Box<dyn Error>> {
    match command {
        Commands::List { json } => {
            let applications = client.list_applications()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&applications)?);
            } else {
                print_applications(&applications);
            }
        }
        Commands::Add { command } => {
            let pid = client.add_application(command)?;
            println!("{pid}");
        }
        Commands::Remove { pid } => {
            client.remove_application(pid)?;
            println!("Removed application {pid}");
        }
        Commands::Directory | Commands::Supervise { .. } => {}
    }
    Ok(())
}

fn print_applications(applications: &[ApplicationInfo]) {
    if applications.is_empty() {
        println!("No applications running.");
        return;
    }

    println!(
        "{:<8} {:<8} {:<20} {:<30} LOG",
        "PID", "STATE", "STARTED", "COMMAND"
    );
    for app in applications {
        let state = match (app.is_running, app.exit_code) {
            (true, _) => "running".to_string(),
            (false, Some(code)) => format!("exit {code}"),
            (false, None) => "exited".to_string(),
        };
        let log = app
            .log_file
            .as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "-".into());
        println!(
            "{:<8} {:<8} {:<20} {:<30} {}",
            app.pid,
            state,
            app.started_at.format("%Y-%m-%d %H:%M:%S"),
            app.command,
            log
        );
    }
}

fn init_logging(args: &Cli, config: &Config) {
    let filter = if let Some(level) = args.log_level {
        EnvFilter::new(level.as_str())
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()))
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Resolves the arguments for a new daemon. The log directory is created and made
/// absolute because the daemon does not share the client's working directory.
fn launch_args(config: &Config) -> Result<LaunchArgs, Box<dyn Error>> {
    fs::create_dir_all(&config.log_dir)?;
    Ok(LaunchArgs {
        log_level: config.log_level.as_str().to_string(),
        port: config.port,
        log_dir: config.log_dir.canonicalize()?,
        capture_output: config.capture_output,
    })
}

fn run_directory(port: u16) -> Result<(), Box<dyn Error>> {
    let directory = DirectoryServer::spawn(port)?;
    println!("Directory listening on {}", directory.local_addr());
    directory.wait();
    Ok(())
}

fn run_supervisor(level: LogLevelArg, port: u16, log_dir: PathBuf, capture_output: bool) -> ! {
    match logs::open_supervisor_log(&log_dir) {
        Ok(file) => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(EnvFilter::new(level.as_str()))
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init();
        }
        Err(err) => {
            eprintln!("Failed to open supervisor log in {:?}: {err}", log_dir);
            process::exit(1);
        }
    }

    let identity = DaemonIdentity::current(log_dir, port);
    let mut supervisor = match Supervisor::bootstrap(identity, capture_output) {
        Ok(supervisor) => supervisor,
        Err(err) => {
            error!("Could not publish the supervisor on port {port}: {err}");
            process::exit(1);
        }
    };

    let registry = supervisor.registry();
    let endpoint = supervisor.endpoint().ok();
    if let Err(err) = ctrlc::set_handler(move || {
        info!("Termination signal received; stopping applications");
        registry.stop_all();
        if let Some(endpoint) = endpoint
            && let Err(err) = bootstrap::retract(port, SERVICE_NAME, endpoint)
        {
            warn!("Failed to withdraw '{SERVICE_NAME}': {err}");
        }
        process::exit(0);
    }) {
        warn!("Failed to install termination handler: {err}");
    }

    let code = match supervisor.run() {
        Ok(()) => 0,
        Err(err) => {
            error!("Supervisor exited with error: {err}");
            1
        }
    };

    drop(supervisor);
    process::exit(code);
}
