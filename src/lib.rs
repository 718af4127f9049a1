use std::ffi::OsString;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{command, Arg, ArgAction, ArgGroup, Command};
use ini::Ini;
use simplelog::{ColorChoice, LevelFilter, TermLogger, TerminalMode};

pub mod dispatch;
pub mod message;
pub mod queue;
pub mod transport;
pub mod web;

use dispatch::Dispatcher;
use queue::BrokerConfig;
use transport::Sendmail;

/// Mail command used if the config file doesn't name one.
pub const DEFAULT_MAIL_COMMAND: &str = "msmtp";

/// Address the HTTP listener binds to if the config file doesn't name one.
pub const DEFAULT_LISTEN_ADDR: SocketAddr =
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 8080));

/// Contents of a config file.
///
/// - `recipient` is the address every message is mailed to.
/// - `mail_command` is the sendmail-style program run for each message, with
///   `recipient` as its only argument.
/// - `work_dir` is the directory the mail command runs in.
/// - `listen_addr` is where the HTTP listener accepts connections.
/// - `log_level` is the most verbose level logged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub recipient: String,
    pub mail_command: String,
    pub work_dir: PathBuf,
    pub listen_addr: SocketAddr,
    pub log_level: LevelFilter,
}

/// Which listener a process runs. Exactly one is active.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum ListenerMode {
    Web,
    RabbitMq,
}

/// Main context for the program. Represents values injected into main() for easy testing.
///
/// Fields:
///
/// - `args`: command-line arguments
/// - `config_path`: path to a config file
#[derive(Debug)]
pub struct MainContext {
    pub args: Vec<String>,
    pub config_path: String,
}

/// Build a CLI parser for the program.
///
/// Exactly one of `--web` (serve `PUT /send` over HTTP) and `--rabbitmq`
/// (consume a RabbitMQ queue) must be given.
pub fn build_cli() -> Command {
    command!()
        .about("Forward messages received over HTTP or RabbitMQ to a local mail command")
        .arg(
            Arg::new("web")
                .long("web")
                .action(ArgAction::SetTrue)
                .help("Accept messages as JSON bodies of PUT /send requests"),
        )
        .arg(
            Arg::new("rabbitmq")
                .long("rabbitmq")
                .action(ArgAction::SetTrue)
                .help("Consume messages from the queue named by RABBITMQ_TOPIC. Connection details come from RABBITMQ_USERNAME, RABBITMQ_PASSWORD, RABBITMQ_HOST, RABBITMQ_PORT and RABBITMQ_VHOST."),
        )
        .group(
            ArgGroup::new("mode")
                .args(["web", "rabbitmq"])
                .required(true),
        )
}

/// Parse command-line arguments (including the program name) into a listener mode.
pub fn parse_mode<I, T>(args: I) -> Result<ListenerMode, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let matches = build_cli().try_get_matches_from(args)?;

    if matches.get_flag("web") {
        Ok(ListenerMode::Web)
    } else {
        Ok(ListenerMode::RabbitMq)
    }
}

/// Read a "key = value" style config file, and return the values as a Config struct.
///
/// The file must set `recipient`. `mailCommand`, `workDir`, `listenAddr` and
/// `logLevel` are optional, defaulting to `msmtp`, `.`, `0.0.0.0:8080` and
/// `info`.
///
pub fn read_config_ini<P>(file_path: P) -> Result<Config>
where
    P: AsRef<Path>,
{
    let file_path_ref = file_path.as_ref();
    let conf = Ini::load_from_file(file_path_ref).map_err(|e| {
        anyhow!(
            "Error reading config file {}: {}",
            file_path_ref.display(),
            e
        )
    })?;

    let section = conf.section(None::<String>).ok_or_else(|| {
        anyhow!(
            "Error reading config file {}: sections seem malformed",
            file_path_ref.display()
        )
    })?;

    let recipient = section
        .get("recipient")
        .filter(|recipient| !recipient.is_empty())
        .ok_or_else(|| {
            anyhow!(
                "Error reading config file {}: variable recipient not found",
                file_path_ref.display()
            )
        })?;

    let mail_command = section.get("mailCommand").unwrap_or(DEFAULT_MAIL_COMMAND);
    let work_dir = section.get("workDir").unwrap_or(".");

    let listen_addr = match section.get("listenAddr") {
        Some(addr) => SocketAddr::from_str(addr).with_context(|| {
            format!(
                "Error reading config file {}: listenAddr '{}' is not an address and port",
                file_path_ref.display(),
                addr
            )
        })?,
        None => DEFAULT_LISTEN_ADDR,
    };

    let log_level = match section.get("logLevel") {
        Some(level) => LevelFilter::from_str(level).map_err(|_| {
            anyhow!(
                "Error reading config file {}: logLevel '{}' is not a log level",
                file_path_ref.display(),
                level
            )
        })?,
        None => LevelFilter::Info,
    };

    Ok(Config {
        recipient: recipient.to_string(),
        mail_command: mail_command.to_string(),
        work_dir: PathBuf::from(work_dir),
        listen_addr,
        log_level,
    })
}

/// A listener, ready to run.
#[derive(Debug)]
pub enum Listener {
    Web,
    RabbitMq(BrokerConfig),
}

/// Run `listener` until it fails or the process is asked to stop.
pub async fn run(listener: Listener, config: &Config) -> Result<()> {
    let transport = Sendmail::new(&config.mail_command, &config.recipient, &config.work_dir);
    let dispatcher = Arc::new(Dispatcher::new(Arc::new(transport)));

    match listener {
        Listener::Web => web::serve(config.listen_addr, dispatcher, shutdown_signal()).await,
        Listener::RabbitMq(broker) => {
            tokio::select! {
                res = queue::listen(&broker, dispatcher) => res,
                _ = shutdown_signal() => Ok(()),
            }
        }
    }
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Unable to install Ctrl-C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                log::error!("Unable to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    log::info!("Shutting down");
}

/// set up logging to stderr at the given level.
fn init_logging(level: LevelFilter) {
    let _ = TermLogger::init(
        level,
        simplelog::Config::default(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    );
}

/// Print an error and exit; used for anything that goes wrong at startup.
fn die(e: anyhow::Error) -> ! {
    eprintln!("Error: {:#}", e);
    std::process::exit(1);
}

/// Main logic for the program.
///
/// Parses arguments (printing usage and exiting on a malformed invocation),
/// reads broker settings when in RabbitMQ mode (before any connection is
/// attempted) and the config file, then runs the chosen listener on a tokio
/// runtime. Any startup failure, or a fatal listener error, exits with status 1.
pub fn main(ctx: &MainContext) {
    let mode = parse_mode(ctx.args.iter()).unwrap_or_else(|e| e.exit());

    let listener = match mode {
        ListenerMode::Web => Listener::Web,
        ListenerMode::RabbitMq => {
            let broker = BrokerConfig::from_env().unwrap_or_else(|e| die(e));
            Listener::RabbitMq(broker)
        }
    };

    let config_path = &ctx.config_path;
    let config = read_config_ini(config_path).unwrap_or_else(|e| die(e));

    init_logging(config.log_level);

    log::debug!("Using config file: {:#?}", config_path);
    log::debug!("Read config: {:?}", config);

    let runtime = tokio::runtime::Runtime::new()
        .context("Failed to start async runtime")
        .unwrap_or_else(|e| die(e));

    if let Err(e) = runtime.block_on(run(listener, &config)) {
        die(e);
    }
}
