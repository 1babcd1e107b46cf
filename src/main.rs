use anyhow::{Context, Result};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use stower::config::Config;
use stower::coordinator::{Coordinator, NewJob};
use stower::db;
use stower::logging;
use stower::services::store::S3Store;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let _guard = logging::init();

    let mut args = std::env::args().skip(1);
    let (Some(source_folder), Some(destination_bucket)) = (args.next(), args.next()) else {
        eprintln!("usage: stower <source_folder> <destination_bucket> [pattern] [--watch]");
        std::process::exit(2);
    };
    let mut pattern = None;
    let mut watch = false;
    for arg in args {
        if arg == "--watch" {
            watch = true;
        } else {
            pattern = Some(arg);
        }
    }

    let mut config = Config::default();
    config.s3_endpoint = std::env::var("STOWER_S3_ENDPOINT").ok();
    config.s3_region = std::env::var("STOWER_S3_REGION").ok();
    config.s3_access_key = std::env::var("STOWER_S3_ACCESS_KEY").ok();
    config.s3_secret_key = std::env::var("STOWER_S3_SECRET_KEY").ok();
    if !watch {
        config.monitor_interval_secs = 0;
    }
    config.validate().context("invalid configuration")?;

    if let Some(parent) = Path::new(&config.database_path).parent() {
        std::fs::create_dir_all(parent).context("create state dir")?;
    }
    let conn = db::init_db(Path::new(&config.database_path))?;
    let store = S3Store::connect(&config).await?;

    let coordinator = Arc::new(Coordinator::new(
        config,
        Arc::new(Mutex::new(conn)),
        Arc::new(store),
    ));
    coordinator.start().await?;

    let job = coordinator.submit_job(NewJob {
        id: None,
        source_folder,
        destination_bucket,
        pattern,
    })?;

    loop {
        tokio::time::sleep(Duration::from_secs(1)).await;
        let status = coordinator.get_job(&job.id)?;
        info!(
            "Job {}: {} ({}/{} uploaded, {} failed)",
            status.id,
            status.state.as_str(),
            status.completed_files,
            status.total_files,
            status.failed_files
        );
        if status.state.is_terminal() {
            println!("{}", serde_json::to_string_pretty(&status)?);
            break;
        }
    }

    if watch {
        info!("Watching source for changes; press ctrl-c to exit");
        tokio::signal::ctrl_c().await?;
    }
    coordinator.shutdown().await;
    Ok(())
}
