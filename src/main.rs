//! lanbench - zero-configuration LAN throughput measurement

use std::io::{self, BufRead, Write};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use lanbench::client::{Client, ClientConfig};
use lanbench::config::Config;
use lanbench::output::{output_json, output_plain};
use lanbench::protocol::ProtocolConfig;
use lanbench::serve::{Server, ServerConfig};
use lanbench::stats::RoundReport;
use lanbench::udp::Pacing;

/// Initialize logging to stderr, plus a daily-rotated file when `log_file`
/// is set
fn init_logging(log_file: Option<&str>, log_level: Option<&str>) -> Result<()> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let level = log_level.unwrap_or("info");
    let env_filter =
        EnvFilter::from_default_env().add_directive(format!("lanbench={}", level).parse()?);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(io::stderr)
        .without_time();

    let file_layer = match log_file {
        Some(file_path) => {
            let path = expand_log_path(file_path);
            let dir = path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            let name = path
                .file_name()
                .map(|n| n.to_os_string())
                .unwrap_or_else(|| "lanbench.log".into());
            std::fs::create_dir_all(&dir)?;

            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, name));
            // Dropping the guard stops the writer thread
            std::mem::forget(guard);

            Some(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(writer)
                    .with_ansi(false),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    Ok(())
}

/// Resolve a leading `~/` against the home directory
fn expand_log_path(file_path: &str) -> PathBuf {
    match (file_path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(file_path),
    }
}

#[derive(Parser)]
#[command(name = "lanbench")]
#[command(author, version, about = "Zero-configuration LAN throughput measurement")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Generate shell completions
    #[arg(long, value_name = "SHELL", value_parser = ["bash", "zsh", "fish", "powershell", "elvish"])]
    completions: Option<String>,

    /// Bytes requested by every transfer (e.g., 10M, 512K, 1000)
    #[arg(short, long, value_parser = parse_size)]
    size: Option<u64>,

    /// Number of parallel TCP transfers
    #[arg(long, value_name = "N", value_parser = parse_count)]
    tcp: Option<u32>,

    /// Number of parallel UDP transfers
    #[arg(long, value_name = "N", value_parser = parse_count)]
    udp: Option<u32>,

    /// End a UDP transfer after this long without a segment
    #[arg(long, value_parser = parse_duration)]
    idle_timeout: Option<Duration>,

    /// Stop after this many rounds (default: run forever)
    #[arg(short = 'n', long)]
    rounds: Option<u64>,

    /// JSON output
    #[arg(long)]
    json: bool,

    /// UDP port offers are broadcast to
    #[arg(long, env = "LANBENCH_DISCOVERY_PORT")]
    discovery_port: Option<u16>,

    /// Log file path (e.g., "~/.config/lanbench/lanbench.log")
    #[arg(long, env = "LANBENCH_LOG_FILE")]
    log_file: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, env = "LANBENCH_LOG_LEVEL")]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start server mode
    Serve {
        /// First port scanned for the data sockets
        #[arg(long)]
        port_start: Option<u16>,

        /// Last port scanned for the data sockets
        #[arg(long)]
        port_end: Option<u16>,

        /// Local address for the data sockets
        #[arg(long)]
        bind: Option<IpAddr>,

        /// Offer destination (e.g., 255.255.255.255, 192.168.1.255)
        #[arg(long)]
        broadcast: Option<IpAddr>,

        /// UDP segments sent back-to-back before pausing
        #[arg(long)]
        burst_size: Option<u64>,

        /// Pause after each UDP burst
        #[arg(long, value_parser = parse_duration)]
        burst_delay: Option<Duration>,

        /// Time between offers
        #[arg(long, default_value = "1s", value_parser = parse_duration)]
        interval: Duration,

        /// UDP port offers are broadcast to
        #[arg(long, env = "LANBENCH_DISCOVERY_PORT")]
        discovery_port: Option<u16>,

        /// Log file path (e.g., "~/.config/lanbench/lanbench.log")
        #[arg(long, env = "LANBENCH_LOG_FILE")]
        log_file: Option<String>,

        /// Log level (error, warn, info, debug, trace)
        #[arg(long, env = "LANBENCH_LOG_LEVEL")]
        log_level: Option<String>,
    },
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    humantime::parse_duration(s).map_err(|e| e.to_string())
}

fn parse_size(s: &str) -> Result<u64, String> {
    let s = s.trim().to_uppercase();
    let (num, suffix) = if s.ends_with('G') {
        (s.trim_end_matches('G'), 1024 * 1024 * 1024u64)
    } else if s.ends_with('M') {
        (s.trim_end_matches('M'), 1024 * 1024u64)
    } else if s.ends_with('K') {
        (s.trim_end_matches('K'), 1024u64)
    } else {
        (s.as_str(), 1u64)
    };

    let n = num.parse::<u64>().map_err(|e| e.to_string())?;
    let size = n
        .checked_mul(suffix)
        .ok_or_else(|| format!("size too large: {}", s))?;
    if size == 0 {
        return Err("size must be positive".to_string());
    }
    Ok(size)
}

/// Ask on `output` until `input` yields something `parse` accepts.
/// Fails only if `input` runs dry.
fn prompt_until<T, R, W, F>(input: &mut R, output: &mut W, question: &str, parse: F) -> Result<T>
where
    R: BufRead,
    W: Write,
    F: Fn(&str) -> Result<T, String>,
{
    loop {
        write!(output, "{}: ", question)?;
        output.flush()?;

        let mut line = String::new();
        if input.read_line(&mut line)? == 0 {
            bail!("no answer for \"{}\" on stdin", question);
        }

        match parse(line.trim()) {
            Ok(value) => return Ok(value),
            Err(e) => writeln!(output, "Invalid input ({}), please enter a positive integer", e)?,
        }
    }
}

fn parse_count(s: &str) -> Result<u32, String> {
    match s.parse::<u32>() {
        Ok(0) => Err("must be positive".to_string()),
        Ok(n) => Ok(n),
        Err(e) => Err(e.to_string()),
    }
}

/// A connection count from the config file; zero is ignored so the operator
/// gets asked instead
fn configured_count(value: Option<u32>, key: &str) -> Option<u32> {
    match value {
        Some(0) => {
            warn!("Ignoring {} = 0 from config: must be positive", key);
            None
        }
        other => other,
    }
}

fn generate_completions(shell: &str) {
    use clap::CommandFactory;
    use clap_complete::{Shell, generate};

    let mut cmd = Cli::command();
    let shell = match shell {
        "bash" => Shell::Bash,
        "zsh" => Shell::Zsh,
        "fish" => Shell::Fish,
        "powershell" => Shell::PowerShell,
        "elvish" => Shell::Elvish,
        _ => {
            eprintln!("Unknown shell: {}", shell);
            std::process::exit(1);
        }
    };
    generate(shell, &mut cmd, "lanbench", &mut io::stdout());
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle shell completions early (before logging init)
    if let Some(ref shell) = cli.completions {
        generate_completions(shell);
        return Ok(());
    }

    let file_config = Config::load().unwrap_or_else(|e| {
        eprintln!("Ignoring config file {}: {}", Config::config_path().display(), e);
        Config::default()
    });

    match cli.command {
        Some(Commands::Serve {
            port_start,
            port_end,
            bind,
            broadcast,
            burst_size,
            burst_delay,
            interval,
            discovery_port,
            log_file,
            log_level,
        }) => {
            init_logging(
                log_file
                    .as_deref()
                    .or(file_config.server.log_file.as_deref()),
                log_level
                    .as_deref()
                    .or(file_config.server.log_level.as_deref()),
            )?;

            let defaults = ServerConfig::default();
            let server_defaults = &file_config.server;

            let start = port_start
                .or(server_defaults.port_range_start)
                .unwrap_or(*defaults.port_range.start());
            let end = port_end
                .or(server_defaults.port_range_end)
                .unwrap_or(*defaults.port_range.end());
            if start > end {
                bail!("empty port range {}..={}", start, end);
            }

            let broadcast_addr = match broadcast {
                Some(addr) => addr,
                None => match server_defaults.broadcast_addr.as_deref() {
                    Some(addr) => addr.parse()?,
                    None => defaults.broadcast_addr,
                },
            };

            let config = ServerConfig {
                protocol: protocol_config(&file_config, discovery_port),
                bind_addr: bind.unwrap_or(defaults.bind_addr),
                broadcast_addr,
                broadcast_interval: interval,
                port_range: start..=end,
                pacing: Pacing {
                    burst_size: burst_size
                        .or(server_defaults.burst_size)
                        .unwrap_or(defaults.pacing.burst_size),
                    burst_delay: burst_delay
                        .or(server_defaults.burst_delay())
                        .unwrap_or(defaults.pacing.burst_delay),
                },
            };

            let server = Server::bind(config).await?;
            tokio::select! {
                result = server.run() => result?,
                _ = tokio::signal::ctrl_c() => info!("Interrupted, shutting down"),
            }
        }

        None => {
            init_logging(
                cli.log_file
                    .as_deref()
                    .or(file_config.client.log_file.as_deref()),
                cli.log_level
                    .as_deref()
                    .or(file_config.client.log_level.as_deref()),
            )?;

            let client_defaults = &file_config.client;
            let configured_size = match client_defaults.file_size.as_deref() {
                Some(s) => match parse_size(s) {
                    Ok(size) => Some(size),
                    Err(e) => {
                        warn!("Ignoring file_size {:?} from config: {}", s, e);
                        None
                    }
                },
                None => None,
            };

            let stdin = io::stdin();
            let mut input = stdin.lock();
            let mut prompt_out = io::stdout();

            let file_size = match cli.size.or(configured_size) {
                Some(size) => size,
                None => prompt_until(&mut input, &mut prompt_out, "File size in bytes", parse_size)?,
            };
            let tcp_connections = match cli
                .tcp
                .or(configured_count(client_defaults.tcp_connections, "tcp_connections"))
            {
                Some(n) => n,
                None => prompt_until(
                    &mut input,
                    &mut prompt_out,
                    "Number of TCP connections",
                    parse_count,
                )?,
            };
            let udp_connections = match cli
                .udp
                .or(configured_count(client_defaults.udp_connections, "udp_connections"))
            {
                Some(n) => n,
                None => prompt_until(
                    &mut input,
                    &mut prompt_out,
                    "Number of UDP connections",
                    parse_count,
                )?,
            };
            drop(input);

            let config = ClientConfig {
                protocol: protocol_config(&file_config, cli.discovery_port),
                file_size,
                tcp_connections,
                udp_connections,
                udp_idle_timeout: cli
                    .idle_timeout
                    .or(client_defaults.idle_timeout())
                    .unwrap_or(ClientConfig::default().udp_idle_timeout),
                rounds: cli.rounds,
            };

            run_client(config, cli.json).await?;
        }
    }

    Ok(())
}

/// Protocol constants: CLI discovery port, then config file, then built-ins
fn protocol_config(file_config: &Config, discovery_port: Option<u16>) -> ProtocolConfig {
    let mut protocol = file_config.protocol_config();
    if let Some(port) = discovery_port {
        protocol.discovery_port = port;
    }
    protocol
}

async fn run_client(config: ClientConfig, json: bool) -> Result<()> {
    let client = Client::new(config);
    let (tx, mut rx) = mpsc::channel::<RoundReport>(16);

    // Print reports in a separate task
    let print_handle = tokio::spawn(async move {
        while let Some(report) = rx.recv().await {
            let rendered = if json {
                output_json(&report)
            } else {
                output_plain(&report)
            };
            println!("{}", rendered);
            let _ = io::stdout().flush();
        }
    });

    let result = tokio::select! {
        result = client.run(tx) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
            Ok(())
        }
    };

    // The sender is gone either way, so the printer drains and exits
    let _ = print_handle.await;
    result
}
