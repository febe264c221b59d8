use actix_web::{middleware, web, App, HttpServer};
use anyhow::Context;
use log::{info, warn};

use recompress_worker::{handlers, jobs, AppState, Config};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    init_logger();

    let config = Config::from_env().context("Failed to load configuration")?;

    info!("Initializing recompress worker");
    info!("Server configuration: {:?}", config);

    if let Some(endpoint) = &config.redis_endpoint {
        warn!(
            "REDIS_HOST is set ({}) but jobs are stored in {:?} at {}",
            endpoint,
            config.job_store,
            config.job_db_path.display()
        );
    }

    std::fs::create_dir_all(&config.scratch_dir).with_context(|| {
        format!(
            "Failed to create scratch directory {}",
            config.scratch_dir.display()
        )
    })?;

    let host = config.host.clone();
    let port = config.port;
    let http_workers = config.workers;
    let mode = config.mode;
    let retention = config.job_retention;

    let app_state =
        web::Data::new(AppState::from_config(config).context("Failed to open job store")?);

    for (index, worker) in app_state.job_workers().into_iter().enumerate() {
        info!("Starting job worker {}", index);
        tokio::spawn(worker.run());
    }
    if let Some(queue) = app_state.jobs.clone() {
        tokio::spawn(jobs::run_retention_sweeper(queue, retention));
    }

    info!("Starting {} server on {}:{}", mode.as_str(), host, port);

    HttpServer::new(move || {
        App::new()
            .app_data(app_state.clone())
            .wrap(middleware::Logger::default())
            .wrap(middleware::NormalizePath::trim())
            .wrap(middleware::DefaultHeaders::new().add(("X-Version", env!("CARGO_PKG_VERSION"))))
            .configure(handlers::routes(mode))
    })
    .bind((host.as_str(), port))?
    .workers(http_workers)
    .run()
    .await?;

    Ok(())
}

fn init_logger() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();
}
