use anyhow::Context;
use clap::Parser;
use ring_builder_service::catalog::types::Catalog;
use ring_builder_service::config::{Cli, Command, InitArgs, ServeArgs};
use ring_builder_service::mutation::service::CatalogService;
use ring_builder_service::ring::builder::WeightedRebalancer;
use ring_builder_service::server;
use ring_builder_service::store::file::FileStore;
use ring_builder_service::store::lock::LockManager;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(cli.log_level)
        .init();

    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Init(args) => init(args).await,
    }
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    if args.key.is_empty() {
        anyhow::bail!("--key must not be empty");
    }

    let backup_dir = args.backup_dir();
    tracing::info!("Data directory: {}", args.data_dir.display());
    tracing::info!("Backup directory: {}", backup_dir.display());
    tracing::info!("Lock timeout: {:?}", args.lock_timeout());

    // 1. Storage:
    let store = Arc::new(FileStore::new(&args.data_dir, backup_dir));

    // 2. Service:
    let service = Arc::new(CatalogService::new(
        store,
        LockManager::new(args.lock_timeout()),
        Arc::new(WeightedRebalancer::new()),
    ));

    // 3. HTTP Router:
    let app = server::router(service, &args.key);

    // 4. Start HTTP server:
    server::serve(args.bind, app).await
}

async fn init(args: InitArgs) -> anyhow::Result<()> {
    let replicas = usize::try_from(args.replicas).context("replica count too large")?;
    let catalog = Catalog::new(args.category, args.part_power, replicas, args.min_part_hours);

    let store = FileStore::new(&args.data_dir, args.data_dir.join("backups"));
    let token = store.create(&catalog).await?;
    tracing::info!(
        "Initialised {} with 2^{} partitions, {} replicas, min_part_hours {} ({})",
        args.category.builder_file(),
        args.part_power,
        replicas,
        args.min_part_hours,
        token
    );
    Ok(())
}
