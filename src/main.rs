use clap::{Parser, Subcommand};
use cluster_harness::config::load_config;
use cluster_harness::{CommandSpec, Harness};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Drive integration-test plumbing from the command line: run commands,
/// wait for cluster resources, and tear down process trees.
#[derive(Parser, Debug)]
#[command(name = "cluster-harness", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "harness.toml")]
    config: PathBuf,

    /// Cluster profile (overrides config)
    #[arg(short, long)]
    profile: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a command to completion and print its output
    Run {
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        argv: Vec<String>,
    },
    /// Wait for labeled pods to become ready
    WaitReady {
        #[arg(short, long, default_value = "default")]
        namespace: String,
        #[arg(short, long)]
        selector: String,
        /// Timeout in seconds (default: from config)
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Terminate a process and all of its children
    KillTree { pid: u32 },
    /// Print the host status of the profile
    Status,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(false)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    let mut config = match load_config(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(profile) = &cli.profile {
        config.cluster.profile = profile.clone();
    }
    let default_timeout = config.readiness.timeout();
    let harness = Harness::new(config);
    let case = harness.case("cli");

    match cli.command {
        Command::Run { argv } => {
            let Some((program, args)) = argv.split_first() else {
                return ExitCode::FAILURE;
            };
            let spec = CommandSpec::new(program.clone()).args(args.iter().cloned());
            match case.run(&spec).await {
                Ok(rr) => {
                    print!("{}", rr.stdout_str());
                    eprint!("{}", rr.stderr_str());
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    let rr = e.result();
                    print!("{}", rr.stdout_str());
                    eprint!("{}", rr.stderr_str());
                    tracing::error!("{e}");
                    let code = u8::try_from(rr.exit_code).unwrap_or(1);
                    ExitCode::from(code.max(1))
                }
            }
        }
        Command::WaitReady {
            namespace,
            selector,
            timeout,
        } => {
            let timeout = timeout.map(Duration::from_secs).unwrap_or(default_timeout);
            match case.wait_ready(&namespace, &selector, timeout).await {
                Ok(names) => {
                    for name in names {
                        println!("{name}");
                    }
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    tracing::error!(names = ?e.names(), "{e}");
                    ExitCode::FAILURE
                }
            }
        }
        Command::KillTree { pid } => {
            let report = case.terminator().terminate(pid).await;
            if report.not_found {
                println!("pid {pid} not found");
            }
            for p in &report.terminated {
                println!("terminated {p}");
            }
            for issue in &report.issues {
                eprintln!("{issue}");
            }
            ExitCode::SUCCESS
        }
        Command::Status => {
            println!("{}", case.cluster().host_status(case.cancel_token()).await);
            ExitCode::SUCCESS
        }
    }
}
