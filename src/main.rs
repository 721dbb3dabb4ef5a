//! `vortex` — enrolls with a controller over an ECDH+HMAC handshake, then
//! runs the resulting agent loop until a shutdown signal arrives.

use std::process::ExitCode;

use clap::{CommandFactory, Parser, Subcommand};
use tracing::{info, warn};

#[derive(Parser)]
#[command(
    name = "vortex",
    version,
    about = "Remote-controlled edge agent providing port-forwarding-as-a-service"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Agent lifecycle commands.
    Agent {
        #[command(subcommand)]
        command: AgentCommand,
    },
    /// Print a shell completion script to stdout.
    Completions {
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum AgentCommand {
    /// Enroll with the controller and run until terminated.
    Start(vortex_config::StartArgs),
}

#[tokio::main]
async fn main() -> ExitCode {
    match Cli::parse().command {
        Command::Agent {
            command: AgentCommand::Start(args),
        } => run_agent_start(args).await,
        Command::Completions { shell } => {
            print_completions(shell);
            ExitCode::SUCCESS
        }
    }
}

async fn run_agent_start(args: vortex_config::StartArgs) -> ExitCode {
    let config = match vortex_config::resolve(args) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("vortex: {e}");
            return ExitCode::FAILURE;
        }
    };

    let http = reqwest::Client::new();
    let (identity, creds) =
        match vortex_enroll::enroll(&http, &config.server, &config.id, &config.key).await {
            Ok(v) => v,
            Err(e) => {
                eprintln!("vortex: enrollment failed: {e}");
                return ExitCode::FAILURE;
            }
        };

    let agent = match vortex_core::run(identity, creds, &config).await {
        Ok(a) => a,
        Err(e) => {
            eprintln!("vortex: agent startup failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = wait_for_shutdown_signal().await {
        warn!(error = %e, "signal handling error, shutting down anyway");
    }
    info!("shutdown signal received");

    agent.shutdown().await;
    ExitCode::SUCCESS
}

async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

fn print_completions(shell: clap_complete::Shell) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    clap_complete::generate(shell, &mut cmd, name, &mut std::io::stdout());
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser as _;

    #[test]
    fn agent_start_parses_required_flags() {
        let cli = Cli::parse_from([
            "vortex", "agent", "start", "-i", "a1", "-s", "https://ctl", "-k", "04aa",
        ]);
        match cli.command {
            Command::Agent {
                command: AgentCommand::Start(args),
            } => {
                assert_eq!(args.id.as_deref(), Some("a1"));
                assert_eq!(args.server.as_deref(), Some("https://ctl"));
            }
            _ => panic!("expected Agent::Start"),
        }
    }

    #[test]
    fn completions_subcommand_parses_shell() {
        let cli = Cli::parse_from(["vortex", "completions", "bash"]);
        assert!(matches!(cli.command, Command::Completions { .. }));
    }
}
