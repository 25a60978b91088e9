// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The gateway binary: assembles the subsystems from configuration and
//! serves the WebSocket bridge.

use actix_web::{middleware, web, App, HttpServer};
use gateway::assets::{AssetFetcher, FsRoot, PackagedRoot, Root};
use gateway::cluster::Cluster;
use gateway::config::{GatewayConfig, RootSpec};
use gateway::gameserver::ServerManager;
use gateway::ingress::ws_index;
use gateway::spaces::{FsEditStore, SpaceManager, Verse};
use gateway::user::UserOrchestrator;
use log::{error, info, warn, LevelFilter};
use netutil::Session;
use std::path::PathBuf;
use std::sync::Arc;
use structopt::StructOpt;

/// Gateway options, to be specified as arguments.
#[derive(Debug, StructOpt)]
struct Options {
    /// Configuration file (JSON); a built-in lobby config is used if absent
    #[structopt(short, long)]
    config: Option<PathBuf>,
    /// Verbosity
    #[structopt(short, long, parse(from_occurrences))]
    verbose: usize,
    /// Log incoming HTTP requests
    #[structopt(long)]
    debug_http: bool,
    /// Log relay diagnostics
    #[structopt(long)]
    debug_relay: bool,
    /// Log socket diagnostics
    #[structopt(long)]
    debug_sockets: bool,
}

fn main() -> std::io::Result<()> {
    let options = Options::from_args();

    let mut logger = env_logger::builder();
    logger.format_timestamp(None);
    let level = match options.verbose {
        0 => LevelFilter::Error,
        1 => LevelFilter::Warn,
        2 => LevelFilter::Info,
        3 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    logger.filter_module(module_path!(), level);
    if options.debug_relay {
        logger.filter_module("gateway::relay", level);
    }
    if options.debug_sockets {
        logger.filter_module("gateway::ingress", level);
    }
    if options.debug_http {
        logger.filter_module("actix_web", LevelFilter::Info);
        logger.filter_module("actix_server", LevelFilter::Info);
    }
    logger.filter_level(level);
    logger.init();

    let config = match &options.config {
        Some(path) => GatewayConfig::load(path)?,
        None => GatewayConfig::fallback(),
    };

    actix_web::rt::System::new().block_on(async move {
        let session = Session::new();

        let mut roots: Vec<Arc<dyn Root>> = Vec::new();
        let mut packaged = Vec::new();
        for spec in &config.assets {
            match spec {
                RootSpec::Fs { path } => {
                    roots.push(Arc::new(FsRoot::new(path.clone())));
                }
                RootSpec::Packaged { cache, index_url } => {
                    match PackagedRoot::open(cache.clone(), index_url) {
                        Ok(root) => {
                            let root = Arc::new(root);
                            roots.push(root.clone());
                            packaged.push(root);
                        }
                        Err(err) => {
                            // Asset roots gate features, not startup.
                            warn!("skipping root {}: {}", index_url, err);
                        }
                    }
                }
            }
        }
        let fetcher = Arc::new(AssetFetcher::new(roots, &packaged));

        let verse = match Verse::load(&config.verse_dir) {
            Ok(verse) => Arc::new(verse),
            Err(err) => {
                warn!("could not load user spaces: {}", err);
                Arc::new(Verse::empty())
            }
        };

        let manager = Arc::new(ServerManager::new(
            session.child(),
            config.presets.clone(),
            config.ingress.base_port,
            config.info.enabled.then(|| config.info.clone()),
        ));
        let spaces = SpaceManager::new(
            manager.clone(),
            verse,
            fetcher,
            Arc::new(FsEditStore::new(config.edits_dir.clone())),
        );
        let cluster = Cluster::new(
            session.clone(),
            UserOrchestrator::new(),
            manager.clone(),
            spaces.clone(),
        );

        for preset in &config.spaces {
            if let Err(err) = spaces.start_preset_space(preset) {
                error!("failed to start space {}: {}", preset.alias, err);
                return Err(std::io::Error::other(err.to_string()));
            }
        }

        let bind = ("0.0.0.0", config.ingress.web_port);
        info!("listening for web clients on port {}", bind.1);

        let data = web::Data::new(cluster);
        HttpServer::new(move || {
            App::new()
                .wrap(middleware::Logger::default())
                .app_data(data.clone())
                .service(web::resource("/ws/").route(web::get().to(ws_index)))
        })
        .bind(bind)?
        .shutdown_timeout(3)
        .max_connections(2048)
        .backlog(512)
        .run()
        .await
    })
}
