//! # apphost CLI Entry Point
//!
//! ## Usage
//!
//! ```bash
//! # Start the server rooted at /srv/apphost
//! apphost start --dir /srv/apphost
//!
//! # Print the services the master would fork workers for
//! apphost config --dir /srv/apphost
//! ```
//!
//! The master re-executes this binary with `start` for every worker and long
//! worker; the role markers in their environment decide what they run.

use std::path::PathBuf;

use anyhow::Result;
use apphost_common::config::{ServerSections, MASTER_SERVICE};
use argh::FromArgs;

#[derive(FromArgs)]
/// apphost - multi-application server
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Start(StartArgs),
    Config(ConfigArgs),
}

/// Arguments for starting a server process.
///
/// Without role markers in the environment the process becomes the master.
#[derive(FromArgs)]
#[argh(subcommand, name = "start")]
/// start the server
struct StartArgs {
    /// server root containing `config/` and `applications/`
    ///
    /// Defaults to the current directory.
    #[argh(option, short = 'd', default = "PathBuf::from(\".\")")]
    dir: PathBuf,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "config")]
/// print the expanded service table as JSON
struct ConfigArgs {
    /// server root containing `config/`
    #[argh(option, short = 'd', default = "PathBuf::from(\".\")")]
    dir: PathBuf,
}

/// Service table as printed by `apphost config`: every service after port
/// expansion, marked with whether the master forks a worker for it.
fn service_table(sections: &ServerSections, cpus: usize) -> Result<serde_json::Value> {
    let services = sections.services(cpus)?;
    let rows = services
        .iter()
        .map(|service| -> Result<serde_json::Value> {
            let mut row = serde_json::to_value(service)?;
            if let Some(obj) = row.as_object_mut() {
                obj.insert("address".into(), service.address().into());
                obj.insert("forked".into(), (service.name != MASTER_SERVICE).into());
            }
            Ok(row)
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(serde_json::Value::Array(rows))
}

fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    match cli.command {
        Commands::Start(args) => {
            let root = std::fs::canonicalize(&args.dir)
                .map_err(|e| anyhow::anyhow!("Invalid server root {}: {}", args.dir.display(), e))?;
            let code = apphost_supervisor::run(&root)?;
            std::process::exit(code);
        }
        Commands::Config(args) => {
            let sections = ServerSections::load(&args.dir)?;
            let table = service_table(&sections, apphost_supervisor::context::cpus())?;
            println!("{}", serde_json::to_string_pretty(&table)?);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cli_parse_start() {
        let args: Cli = Cli::from_args(&["apphost"], &["start", "--dir", "/srv/apphost"]).unwrap();
        match args.command {
            Commands::Start(StartArgs { dir }) => assert_eq!(dir, PathBuf::from("/srv/apphost")),
            _ => panic!("Expected Start command"),
        }
    }

    #[test]
    fn test_cli_parse_start_default_dir() {
        let args: Cli = Cli::from_args(&["apphost"], &["start"]).unwrap();
        match args.command {
            Commands::Start(StartArgs { dir }) => assert_eq!(dir, PathBuf::from(".")),
            _ => panic!("Expected Start command"),
        }
    }

    #[test]
    fn test_cli_parse_config() {
        let args: Cli = Cli::from_args(&["apphost"], &["config", "-d", "/srv"]).unwrap();
        assert!(matches!(args.command, Commands::Config(ConfigArgs { .. })));
    }

    #[test]
    fn test_cli_rejects_unknown_command() {
        assert!(Cli::from_args(&["apphost"], &["restart"]).is_err());
    }

    #[test]
    fn test_service_table_expands_ports() {
        let sections: ServerSections = toml::from_str(
            r#"
            [servers.master]
            protocol = "jstp"
            ports = [250]
            [servers.www]
            address = "127.0.0.1"
            ports = { from = 8001, count = 2 }
            "#,
        )
        .unwrap();
        let table = service_table(&sections, 4).unwrap();
        let rows = table.as_array().unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0]["name"], json!("master"));
        assert_eq!(rows[0]["forked"], json!(false));
        assert_eq!(rows[1]["name"], json!("www8001"));
        assert_eq!(rows[1]["address"], json!("127.0.0.1:8001"));
        assert_eq!(rows[2]["port"], json!(8002));
        assert_eq!(rows[2]["forked"], json!(true));
    }
}
