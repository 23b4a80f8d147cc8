use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use hive::workflow::{WorkflowDocument, WorkflowExecutor};
use hive::{api, Config, Error, Orchestrator};

/// Hive - orchestrator for a pool of command-line worker processes
#[derive(Parser, Debug)]
#[command(name = "hive")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    HIVE_MAX_INSTANCES     Override pool capacity\n    HIVE_WORKER_PROGRAM    Override the worker program\n    HIVE_LISTEN_ADDR       Override the API listen address\n    RUST_LOG               Log filter (default: hive=info)")]
struct Cli {
    /// Path to the configuration file (default: ~/.hive/hive.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
enum Command {
    /// Run the REST/WebSocket server
    Serve {
        /// Listen address override
        #[arg(long)]
        addr: Option<SocketAddr>,

        /// Initial worker count override
        #[arg(long)]
        instances: Option<usize>,
    },

    /// Execute a workflow file and print aggregated results as JSON
    Run {
        /// Path to the workflow YAML file
        workflow: PathBuf,
    },

    /// Validate a workflow file without executing anything
    Validate {
        /// Path to the workflow YAML file
        workflow: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {}", err);
            exit_code_for(&err)
        }
    }
}

/// Exit codes: 0 success, 1 generic failure, 2 invalid usage (clap),
/// 3 configuration error, 4 workflow validation error.
fn exit_code_for(err: &Error) -> ExitCode {
    ExitCode::from(exit_code_value(err))
}

fn exit_code_value(err: &Error) -> u8 {
    match err {
        Error::Configuration(_) | Error::TomlParse(_) => 3,
        Error::WorkflowInvalid(_) => 4,
        _ => 1,
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("hive=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn run(cli: Cli) -> hive::Result<()> {
    let mut config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Command::Serve { addr, instances } => {
            if let Some(addr) = addr {
                config.listen_addr = addr;
            }
            if let Some(instances) = instances {
                config.initial_instances = instances;
            }
            config.validate()?;
            run_server(config)
        }
        Command::Run { workflow } => {
            let source = std::fs::read_to_string(&workflow)?;
            let document = WorkflowDocument::from_yaml(&source)?;
            run_workflow(config, document)
        }
        Command::Validate { workflow } => {
            let source = std::fs::read_to_string(&workflow)?;
            let document = WorkflowDocument::from_yaml(&source)?;
            println!("{}: ok ({} tasks)", workflow.display(), document.tasks.len());
            Ok(())
        }
    }
}

fn run_server(config: Config) -> hive::Result<()> {
    let addr = config.listen_addr;
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let orchestrator = Orchestrator::new(config);
        orchestrator.start().await?;
        api::serve(orchestrator, addr).await
    })
}

fn run_workflow(config: Config, document: WorkflowDocument) -> hive::Result<()> {
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let orchestrator = Orchestrator::new(config);
        orchestrator.start().await?;

        let executor = WorkflowExecutor::new(Arc::clone(&orchestrator));
        let outcome = executor.execute(&document).await?;
        orchestrator.shutdown().await;

        println!("{}", serde_json::to_string_pretty(&outcome)?);
        if outcome.failed > 0 {
            return Err(Error::WorkerExecution(format!(
                "{} of {} tasks did not complete",
                outcome.failed,
                outcome.failed + outcome.succeeded
            )));
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_serve_command_defaults() {
        let cli = Cli::try_parse_from(["hive", "serve"]).unwrap();
        match cli.command {
            Command::Serve { addr, instances } => {
                assert!(addr.is_none());
                assert!(instances.is_none());
            }
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_serve_command_with_addr() {
        let cli = Cli::try_parse_from(["hive", "serve", "--addr", "0.0.0.0:9000"]).unwrap();
        match cli.command {
            Command::Serve { addr, .. } => {
                assert_eq!(addr, Some("0.0.0.0:9000".parse().unwrap()));
            }
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_serve_command_with_instances() {
        let cli = Cli::try_parse_from(["hive", "serve", "--instances", "3"]).unwrap();
        match cli.command {
            Command::Serve { instances, .. } => assert_eq!(instances, Some(3)),
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_run_command() {
        let cli = Cli::try_parse_from(["hive", "run", "pipeline.yaml"]).unwrap();
        match cli.command {
            Command::Run { workflow } => {
                assert_eq!(workflow, PathBuf::from("pipeline.yaml"));
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_run_command_requires_file() {
        assert!(Cli::try_parse_from(["hive", "run"]).is_err());
    }

    #[test]
    fn test_validate_command() {
        let cli = Cli::try_parse_from(["hive", "validate", "w.yaml"]).unwrap();
        assert!(matches!(cli.command, Command::Validate { .. }));
    }

    #[test]
    fn test_config_flag() {
        let cli =
            Cli::try_parse_from(["hive", "--config", "/etc/hive.toml", "serve"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/etc/hive.toml")));
    }

    #[test]
    fn test_unknown_command_fails() {
        assert!(Cli::try_parse_from(["hive", "unknown"]).is_err());
    }

    #[test]
    fn test_missing_command_fails() {
        assert!(Cli::try_parse_from(["hive"]).is_err());
    }

    #[test]
    fn test_exit_code_mapping() {
        assert_eq!(exit_code_value(&Error::Configuration("x".to_string())), 3);
        assert_eq!(exit_code_value(&Error::WorkflowInvalid("x".to_string())), 4);
        assert_eq!(exit_code_value(&Error::WorkerExecution("x".to_string())), 1);
    }

    #[test]
    fn test_help_output_lists_commands() {
        use clap::CommandFactory;
        let help = Cli::command().render_help().to_string();
        assert!(help.contains("serve"));
        assert!(help.contains("run"));
        assert!(help.contains("validate"));
    }
}
