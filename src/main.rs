//! Mining cluster server binary.

use clap::Parser;
use mining_cluster::config::Args;
use mining_cluster::error::{Error, Result};
use mining_cluster::server::Server;
use mining_cluster::store::Database;
use mining_cluster::{logging, web};
use std::path::Path;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let args = Args::parse();
    logging::init(&args.log_level);

    if let Err(e) = run(args).await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let db = open_database(&args)?;
    if args.create {
        println!(
            "Database created, launch your server with: mining-cluster -f {}",
            args.db_file
        );
        return Ok(());
    }

    info!("starting mining-cluster v{}", mining_cluster::VERSION);

    let server = Server::new(db);
    let listener = server.bind().await?;
    server.spawn_listener(listener);
    web::start(server.clone()).await?;
    server.provider().start()?;

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    Ok(())
}

/// Open the configured database, bootstrapping the schema when the file is
/// new (or the database transient).
fn open_database(args: &Args) -> Result<Database> {
    let exists = !args.in_memory() && Path::new(&args.db_file).exists();

    if !args.in_memory() && !exists && !args.create {
        return Err(Error::config(
            "database file doesn't exist; did you mean to use --create?",
        ));
    }
    if exists && args.create {
        return Err(Error::config(
            "database file already exists; delete it manually to start over",
        ));
    }
    if args.create && args.in_memory() {
        return Err(Error::config("no database filename specified, use --db-file"));
    }

    let db = if args.in_memory() {
        Database::in_memory()?
    } else {
        Database::open(&args.db_file)?
    };
    if !exists {
        db.populate(&args.config_pairs(), &args.admin_user, &args.admin_pass)?;
    }
    Ok(db)
}
