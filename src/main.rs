//! Backup/Restore Tool
//!
//! Provides CLI interface for backup, restore and remote target operations

use anyhow::{Context, Result};
use backuptool::config::AppConfig;
use backuptool::service::{BackupService, wait_for_terminal};
use backuptool::targets::TargetPayload;
use std::env;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Main entry point for the backup/restore tool
#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match run_app().await {
        Ok(_) => {
            println!("✅ Operation completed successfully.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_app() -> Result<()> {
    let config_path = env::var("CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config.json"));
    let app_config = AppConfig::load(&config_path, |key| env::var(key).ok())
        .with_context(|| format!("Failed to load application configuration from {}", config_path.display()))?;

    let args: Vec<String> = env::args().skip(1).collect();
    let choice = match args.first() {
        Some(arg) => arg.trim().to_string(),
        None => prompt("Select an operation:\n1. Take Backup (or type 'backup')\n2. Restore Backup (or type 'restore')\n3. List Backups (or type 'list')\nEnter your choice: ")?,
    };
    let rest = args.get(1..).unwrap_or_default();

    let service = BackupService::connect(&app_config)
        .await
        .context("Failed to initialize the backup service")?;

    match choice.as_str() {
        "1" | "backup" => {
            println!("🚀 Starting Backup Process...");
            let target_ids = rest
                .iter()
                .map(|id| parse_id(id))
                .collect::<Result<Vec<i32>>>()?;
            let outcome = service.create_backup(&target_ids).await.context("Backup process failed")?;
            println!("Backup {} ({:.2} MB)", outcome.backup_name, outcome.file_size_mb);
            for destination in &outcome.destinations {
                match &destination.error {
                    None => println!("  ✓ {}", destination.name),
                    Some(error) => println!("  ✗ {}: {}", destination.name, error),
                }
            }
        }
        "2" | "restore" => {
            let name = arg_or_prompt(rest, 0, "Backup file name: ")?;
            let restore_type = rest.get(1).cloned().unwrap_or_else(|| "full".to_string());
            println!("🔄 Starting {} Restore of {}...", restore_type, name);
            service
                .restore_backup(&name, &restore_type)
                .await
                .context("Restore process failed")?;
        }
        "3" | "list" => {
            for backup in service.list_backups()? {
                println!("{}  {:>10.2} MB  {}", backup.created_at_readable, backup.size_mb, backup.id);
            }
        }
        "status" => print_json(&service.status())?,
        "watch" => {
            let status = wait_for_terminal(
                service.context().status.as_ref(),
                Duration::from_secs(1),
                Duration::from_secs(3600),
            )
            .await;
            print_json(&status)?;
        }
        "info" => {
            let name = arg_or_prompt(rest, 0, "Backup file name: ")?;
            print_json(&service.backup_info(&name)?)?;
        }
        "delete" => {
            let name = arg_or_prompt(rest, 0, "Backup file name: ")?;
            service.delete_backup(&name)?;
        }
        "import" => {
            let source = arg_or_prompt(rest, 0, "Archive to import: ")?;
            let info = service.import_backup(Path::new(&source), rest.get(1).map(String::as_str))?;
            println!("Imported as {}", info.id);
        }
        "import-restore" => {
            let source = arg_or_prompt(rest, 0, "Archive to import: ")?;
            let restore_type = rest.get(1).cloned().unwrap_or_else(|| "full".to_string());
            let info = service
                .import_and_restore(Path::new(&source), None, &restore_type)
                .await
                .context("Restore of the imported archive failed")?;
            println!("Restored {}", info.id);
        }
        "push" => {
            let name = arg_or_prompt(rest, 0, "Backup file name: ")?;
            let target_id = parse_id(&arg_or_prompt(rest, 1, "Target id: ")?)?;
            service.push_backup(&name, target_id).await.context("Push failed")?;
        }
        "pull" => {
            let name = arg_or_prompt(rest, 0, "Backup file name: ")?;
            let target_id = parse_id(&arg_or_prompt(rest, 1, "Target id: ")?)?;
            let info = service.pull_backup(&name, target_id).await.context("Pull failed")?;
            println!("Downloaded {} ({:.2} MB)", info.id, info.size_mb);
        }
        "remote-list" => {
            let target_id = parse_id(&arg_or_prompt(rest, 0, "Target id: ")?)?;
            for name in service.list_remote(target_id).await? {
                println!("{}", name);
            }
        }
        "targets" => run_targets(&service, rest).await?,
        _ => {
            println!("❌ Invalid choice '{}'. Try 'backup', 'restore', 'list' or 'targets'.", choice);
            anyhow::bail!("Invalid operation choice");
        }
    }
    Ok(())
}

async fn run_targets(service: &BackupService, args: &[String]) -> Result<()> {
    let registry = service.targets();
    match args.first().map(String::as_str).unwrap_or("list") {
        "list" => print_json(&registry.list().await?)?,
        "upsert" => {
            let raw = arg_or_prompt(args, 1, "Target JSON: ")?;
            let payload: TargetPayload = serde_json::from_str(&raw).context("Target JSON is not valid")?;
            print_json(&registry.upsert(payload).await?)?;
        }
        "delete" => {
            let id = parse_id(&arg_or_prompt(args, 1, "Target id: ")?)?;
            if !registry.delete(id).await? {
                anyhow::bail!("Target {} not found", id);
            }
        }
        other => anyhow::bail!("Unknown targets command '{}'", other),
    }
    Ok(())
}

fn parse_id(raw: &str) -> Result<i32> {
    raw.trim()
        .parse()
        .with_context(|| format!("'{}' is not a valid target id", raw))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn arg_or_prompt(args: &[String], index: usize, label: &str) -> Result<String> {
    match args.get(index) {
        Some(value) => Ok(value.clone()),
        None => prompt(label),
    }
}

/// Prints `label` and returns the trimmed line the user types.
fn prompt(label: &str) -> Result<String> {
    use std::io::{Write, stdin, stdout};

    print!("{}", label);
    stdout().flush().context("Failed to flush stdout")?;

    let mut input = String::new();
    stdin().read_line(&mut input).context("Failed to read user input")?;
    Ok(input.trim().to_string())
}
