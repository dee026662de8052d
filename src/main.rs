use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use colored::Colorize;
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::Builder,
    service::TowerToHyperService,
};
use rmcp::transport::streamable_http_server::{
    StreamableHttpService, session::local::LocalSessionManager,
};
use rmcp::{ServiceExt, transport::stdio};
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use plan_tracker::backend::{BackendKind, BackupMode, FileBackupBackend, open_backends};
use plan_tracker::cli::{Cli, Command, StartArguments};
use plan_tracker::error::{ServiceError, ServiceResult};
use plan_tracker::metadata::{PKG_NAME, PKG_VERSION};
use plan_tracker::server::TrackerServer;
use plan_tracker::sync::{Notice, NoticeLevel, SyncError, SyncManager};
use plan_tracker::transfer;

fn print_notices(notices: &mut broadcast::Receiver<Notice>) {
    while let Ok(notice) = notices.try_recv() {
        let line = match notice.level {
            NoticeLevel::Success => notice.message.green(),
            NoticeLevel::Info => notice.message.normal(),
            NoticeLevel::Warning => notice.message.yellow(),
            NoticeLevel::Error => notice.message.red(),
        };
        eprintln!("{line}");
    }
}

async fn start(sync: Arc<SyncManager>, args: StartArguments) -> ServiceResult<()> {
    args.validate().map_err(ServiceError::FromString)?;
    let mut handles = Vec::new();

    if args.enable_stdio {
        let service = TrackerServer::new(sync.clone())
            .serve(stdio())
            .await
            .map_err(|e| ServiceError::FromString(format!("stdio transport failed: {e}")))?;
        handles.push(tokio::spawn(async move {
            let _ = service.waiting().await;
        }));
    }

    if args.enable_http {
        let addr: SocketAddr = args
            .http_addr
            .parse()
            .map_err(|e| ServiceError::FromString(format!("Invalid MCP_HTTP_ADDR: {e}")))?;
        let factory_sync = sync.clone();
        let http_service = TowerToHyperService::new(StreamableHttpService::new(
            move || Ok(TrackerServer::new(factory_sync.clone())),
            LocalSessionManager::default().into(),
            Default::default(),
        ));
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!(%addr, "streamable HTTP transport listening");
        handles.push(tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let io = TokioIo::new(stream);
                let service = http_service.clone();
                tokio::spawn(async move {
                    let _ = Builder::new(TokioExecutor::default())
                        .serve_connection(io, service)
                        .await;
                });
            }
        }));
    }

    for handle in handles {
        let _ = handle.await;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ServiceResult<()> {
    // stdout belongs to the stdio transport.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    if let Command::Version = cli.command {
        println!("{PKG_NAME} {PKG_VERSION}");
        return Ok(());
    }

    let config = cli
        .storage
        .backend_config()
        .map_err(ServiceError::FromString)?;
    tracing::info!(
        backend = config.kind.as_str(),
        data_dir = %config.data_dir.display(),
        "starting {PKG_NAME}"
    );

    let sync = Arc::new(SyncManager::new(open_backends(&config)));
    let mut notices = sync.subscribe();
    // A failed load leaves an empty store; import still works from here.
    let report = match sync.load().await {
        Ok(report) => Some(report),
        Err(e) => {
            tracing::error!(error = %e, "continuing without stored data");
            None
        }
    };
    print_notices(&mut notices);

    match cli.command {
        Command::Start(args) => start(sync, args).await?,
        Command::Status => {
            let dashboard = sync.read(|s| s.dashboard()).await;
            let status = serde_json::json!({
                "backend": config.kind.as_str(),
                "status": sync.status(),
                "load": report,
                "dashboard": dashboard,
            });
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Export { out } => {
            let snapshot = sync.export().await;
            let path = transfer::write_export(&out, &snapshot).map_err(SyncError::from)?;
            println!("{} {}", "Exported to".green(), path.display());
        }
        Command::Import { file, yes } => {
            let raw = tokio::fs::read_to_string(&file).await?;
            let current = sync.data().await;
            if transfer::requires_confirmation(&current) && !yes {
                let confirmed = dialoguer::Confirm::new()
                    .with_prompt("Importing replaces the current plans and projects. Continue?")
                    .default(false)
                    .interact()?;
                if !confirmed {
                    println!("{}", "Import cancelled".yellow());
                    return Ok(());
                }
            }
            let result = sync.import(&raw).await;
            print_notices(&mut notices);
            let committed = result?;
            println!("Imported {} entities ({:?})", committed.value, committed.source);
        }
        Command::Backups { prune } => {
            let mode = match config.kind {
                BackendKind::Download => BackupMode::Download,
                _ => BackupMode::Archive,
            };
            let backups = FileBackupBackend::new(&config.backup_dir, mode);
            if let Some(keep) = prune {
                let removed = backups.prune(keep)?;
                println!("Removed {removed} old backups");
            }
            for path in backups.list_backups()? {
                println!("{}", path.display());
            }
        }
        Command::Seed { demo } => {
            let result = sync.seed_defaults().await;
            print_notices(&mut notices);
            println!("Added {} sample records", result?.value);
            if demo {
                let result = sync.seed_demo().await;
                print_notices(&mut notices);
                println!("Added {} sample plan entities", result?.value);
            }
        }
        Command::Version => {}
    }
    Ok(())
}
