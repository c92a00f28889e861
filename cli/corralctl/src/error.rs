//! Error handling and display for the CLI.

use colored::Colorize;
use corral_host::HostClientError;
use corral_scheduler::ClientError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("scheduler: {0}")]
    Scheduler(#[from] ClientError),

    #[error("host: {0}")]
    Host(#[from] HostClientError),

    #[error("registry: {0}")]
    Registry(#[from] corral_registry::RegistryError),

    #[error("job {0} is not placed on any host")]
    JobNotPlaced(String),

    #[error("no address is known for host {0}")]
    HostUnreachable(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Print an error in a user-friendly format.
pub fn print_error(err: &anyhow::Error) {
    eprintln!("{} {:#}", "Error:".red().bold(), err);

    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        let hint = match cli_err {
            CliError::Scheduler(ClientError::Io(_)) => {
                Some("Check that the scheduler is running and --scheduler points at it.")
            }
            CliError::Registry(_) => {
                Some("Check CORRAL_REGISTRY_URL, or pass --scheduler and --host-url directly.")
            }
            CliError::JobNotPlaced(_) => Some("Run `corralctl ps` to list placed jobs."),
            CliError::HostUnreachable(_) => {
                Some("Pass --host-url, or make sure the host is registered as corral-host.")
            }
            CliError::Host(HostClientError::Http(_)) => {
                Some("Check that the host agent is running and reachable.")
            }
            _ => None,
        };
        if let Some(hint) = hint {
            eprintln!("\n{}", format!("Hint: {hint}").yellow());
        }
    }
}
