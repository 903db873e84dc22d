use anyhow::Result;
use clap::Parser;
use clap::Subcommand;

use rye_proc::parse_env_pairs;

/// Process helper for the rye runtime: exec, spawn, kill, status. Each
/// subcommand prints one JSON report on stdout.
#[derive(Parser)]
#[command(name = "rye-proc", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a command to completion with a timeout.
    Exec {
        #[arg(long)]
        cmd: String,
        /// Repeatable positional argument for the command.
        #[arg(long = "arg")]
        args: Vec<String>,
        #[arg(long)]
        cwd: Option<String>,
        /// Data piped to the child's stdin.
        #[arg(long)]
        stdin: Option<String>,
        /// Timeout in seconds.
        #[arg(long, default_value_t = 300)]
        timeout: u64,
        /// Repeatable KEY=VALUE environment entries.
        #[arg(long = "env")]
        env: Vec<String>,
    },
    /// Launch a detached process with log redirection.
    Spawn {
        #[arg(long)]
        cmd: String,
        #[arg(long = "arg")]
        args: Vec<String>,
        /// Log file receiving the child's stdout and stderr.
        #[arg(long)]
        log: Option<String>,
        #[arg(long = "env")]
        env: Vec<String>,
    },
    /// Terminate a process: SIGTERM, then SIGKILL after the grace period.
    Kill {
        #[arg(long)]
        pid: u32,
        /// Seconds to wait between SIGTERM and SIGKILL.
        #[arg(long, default_value_t = 3.0)]
        grace: f64,
    },
    /// Report whether a process is alive.
    Status {
        #[arg(long)]
        pid: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let report = match cli.command {
        Command::Exec {
            cmd,
            args,
            cwd,
            stdin,
            timeout,
            env,
        } => {
            let env = parse_env_pairs(&env);
            let report =
                rye_proc::exec(&cmd, &args, cwd.as_deref(), stdin.as_deref(), timeout, &env).await;
            serde_json::to_string(&report)?
        }
        Command::Spawn {
            cmd,
            args,
            log,
            env,
        } => {
            let env = parse_env_pairs(&env);
            let report = rye_proc::spawn_detached(&cmd, &args, log.as_deref(), &env);
            serde_json::to_string(&report)?
        }
        Command::Kill { pid, grace } => {
            let report = rye_proc::kill(pid, grace).await;
            serde_json::to_string(&report)?
        }
        Command::Status { pid } => {
            let report = rye_proc::StatusReport {
                pid,
                alive: rye_proc::is_alive(pid),
            };
            serde_json::to_string(&report)?
        }
    };
    println!("{report}");
    Ok(())
}
