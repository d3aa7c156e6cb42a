mod api;
mod config;
mod error;
mod library;
mod state;
mod textcache;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use actix_web::rt::System;
use actix_web::{App, HttpServer, middleware::Logger, web};
use anyhow::Result;
use audio_pipeline::player::{FilePlaylist, Player};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::library::Library;
use crate::state::AppState;

const DEFAULT_BIND: &str = "0.0.0.0:8080";

#[derive(Parser, Debug)]
#[command(name = "media-server")]
struct Args {
    /// HTTP bind address, e.g. 0.0.0.0:8080
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Media library root directory
    #[arg(long)]
    media_dir: Option<PathBuf>,

    /// Directory for server-owned files such as favorites
    #[arg(long)]
    storage_dir: Option<PathBuf>,

    /// Optional server config file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Files queued on the live player at startup
    files: Vec<PathBuf>,
}

#[actix_web::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,actix_web=info,media_server=info,audio_pipeline=info")
        }))
        .init();

    let cfg = match args.config.as_ref() {
        Some(path) => config::ServerConfig::load(path)?,
        None => config::ServerConfig::default(),
    };
    let bind = match args.bind {
        Some(addr) => addr,
        None => match config::bind_from_config(&cfg)? {
            Some(addr) => addr,
            None => DEFAULT_BIND.parse()?,
        },
    };
    let media_dir = match args.media_dir {
        Some(dir) => dir,
        None => config::media_dir_from_config(&cfg)?,
    };
    let storage_dir = match args.storage_dir {
        Some(dir) => dir,
        None => config::storage_dir_from_config(&cfg)?,
    };
    let streaming = config::stream_options_from_config(&cfg);
    let player_config = config::player_config_from_config(&cfg);
    tracing::info!(
        bind = %bind,
        media_dir = %media_dir.display(),
        storage_dir = %storage_dir.display(),
        queued = args.files.len(),
        "starting media-server"
    );

    let library = Library::open(&media_dir, &storage_dir)?;
    tracing::info!(prefix = crate::library::PREFIX, root = %library.root().display(), "media library opened");
    let player = Arc::new(Player::new(player_config));
    player.play(Box::new(FilePlaylist::new(args.files)))?;

    install_shutdown_handler(System::current())?;

    let state = web::Data::new(AppState::new(library, player.clone(), streaming));
    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .wrap(Logger::default())
            .service(api::track_stream)
            .service(api::track_info)
            .service(api::track_favorite)
            .service(api::track_unfavorite)
            .service(api::playlist_track)
            .service(api::playlist_info)
            .service(api::player_stream)
            .service(api::player_rpc)
    })
    .bind(bind)?
    .run()
    .await?;

    tracing::info!("stopping player");
    player.shutdown()?;
    Ok(())
}

/// Stop `system` on Ctrl-C so the server returns and the player shuts down.
fn install_shutdown_handler(system: System) -> Result<()> {
    ctrlc::set_handler(move || {
        tracing::info!("interrupt received");
        system.stop();
    })?;
    Ok(())
}
