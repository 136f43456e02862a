//! ptyd server binary
//!
//! Runs pty servers and inspects running ones.

use anyhow::{anyhow, Context, Result};
use nix::sys::signal::{self, SigHandler, Signal};
use ptyd::config::ServerConfig;
use ptyd::daemon::{
    ExitReason, ExitStatus, LaunchRequest, LegacyExit, LegacyServer, MultiServer,
    ServerConnection,
};
use std::env;
use std::process;

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        return Ok(());
    }

    let config = ServerConfig::load();
    let command = &args[1];

    match command.as_str() {
        "serve" => serve(&config),
        "legacy" => legacy(&config, &args[2..]),
        "status" => status(&config, args.get(2)),
        "list" => list(&config),
        "-h" | "--help" => {
            print_usage();
            Ok(())
        }
        _ => {
            eprintln!("Error: Unknown command '{}'", command);
            print_usage();
            process::exit(1);
        }
    }
}

/// Detach from terminal hangups and broken client sockets
fn ignore_hangups() -> Result<()> {
    // SAFETY: installing SIG_IGN has no handler code to race with
    unsafe {
        signal::signal(Signal::SIGHUP, SigHandler::SigIgn)?;
        signal::signal(Signal::SIGPIPE, SigHandler::SigIgn)?;
    }
    Ok(())
}

fn serve(config: &ServerConfig) -> Result<()> {
    ptyd::logging::init(config)?;
    ignore_hangups()?;

    let mut server = MultiServer::bind(&config.socket_paths(), config)?
        .with_shutdown_signals(&[signal_hook::consts::SIGTERM, signal_hook::consts::SIGINT])?;

    println!("{}", server.socket_path().display());

    match server.run()? {
        ExitReason::NoReportableChildren => {
            tracing::info!("exiting: no children left");
        }
        ExitReason::ShutdownRequested => {
            tracing::info!(children = server.reportable_count(), "exiting on signal");
        }
    }
    Ok(())
}

fn legacy(config: &ServerConfig, argv: &[String]) -> Result<()> {
    let program = argv
        .first()
        .ok_or_else(|| anyhow!("usage: ptyd legacy <program> [args...]"))?;

    ptyd::logging::init(config)?;
    ignore_hangups()?;

    let request = LaunchRequest {
        path: program.clone(),
        argv: argv.to_vec(),
        envp: env::vars().map(|(k, v)| format!("{}={}", k, v)).collect(),
        pwd: env::current_dir()
            .context("Failed to get current directory")?
            .to_string_lossy()
            .into_owned(),
        columns: env_dimension("COLUMNS", 80),
        rows: env_dimension("LINES", 24),
        pixel_width: 0,
        pixel_height: 0,
        is_utf8: true,
        unique_id: 0,
    };

    let mut server = LegacyServer::launch(&config.socket_paths(), &request, config)?;
    println!("{} {}", server.socket_path().display(), server.child_pid());

    match server.run()? {
        LegacyExit::ChildExited(status) => {
            tracing::info!(%status, "child exited");
            process::exit(match status {
                ExitStatus::Exited(code) => code,
                ExitStatus::Signaled { signal, .. } => 128 + signal,
                ExitStatus::Unknown => 1,
            });
        }
        LegacyExit::ClientDisconnected => Ok(()),
    }
}

fn env_dimension(name: &str, default: u16) -> u16 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn status(config: &ServerConfig, pid: Option<&String>) -> Result<()> {
    let pid: i32 = pid
        .ok_or_else(|| anyhow!("usage: ptyd status <pid>"))?
        .parse()
        .map_err(|_| anyhow!("Invalid pid"))?;

    let attachment = ServerConnection::connect(&config.socket_paths(), pid)?;
    let connection = &attachment.connection;

    println!("Server PID: {}", connection.server_pid());
    println!("Protocol:   {}", connection.protocol_version());
    println!("Children:   {}", attachment.children.len());

    for child in &attachment.children {
        println!(
            "  {:>7}  {:<12}  {:<10}  {}",
            child.pid,
            child.tty,
            if child.terminated { "terminated" } else { "running" },
            child.launch.argv.join(" ")
        );
    }

    Ok(())
}

fn list(config: &ServerConfig) -> Result<()> {
    let paths = config.socket_paths();
    let pids = paths
        .live_server_pids()
        .with_context(|| format!("Failed to scan {}", paths.dir().display()))?;

    if pids.is_empty() {
        println!("No servers found in {}", paths.dir().display());
    }
    for pid in pids {
        println!("{}", pid);
    }
    Ok(())
}

fn print_usage() {
    println!("ptyd v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Usage: ptyd <command>");
    println!();
    println!("Commands:");
    println!("  serve                      Run a multi-session server");
    println!("  legacy <program> [args]    Run one program behind a single-use server");
    println!("  status <pid>               Show the sessions held by a server");
    println!("  list                       List servers with sockets in the socket directory");
    println!("  -h, --help                 Show this help message");
    println!();
    println!("Environment:");
    println!("  PTYD_SOCKET_DIR, PTYD_LOG, PTYD_LOG_FILE, PTYD_DEFAULT_TERM");
}
