use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;

use uprov_adb::{watch_devices, Adb};
use uprov_flashget::Cache;
use uprov_server::config::{Cli, Config};
use uprov_server::context::Context;
use uprov_server::heartbeat::HeartbeatClient;
use uprov_server::install::InstallManager;
use uprov_server::registry::DeviceRegistry;
use uprov_server::{hotplug, http, initd};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.initd {
        let server = cli
            .server
            .as_deref()
            .context("--server is required with --initd")?;
        print!("{}", initd::generate(server)?);
        return Ok(());
    }

    uprov_util::init_tracing().map_err(|err| anyhow::anyhow!("init tracing: {err}"))?;

    let server = cli
        .server
        .clone()
        .context("--server is required (coordinator host:port)")?;

    let resources_dir = match cli.resdir {
        Some(dir) => std::fs::canonicalize(&dir)
            .with_context(|| format!("resources directory {}", dir.display()))?,
        None => default_resources_dir()?,
    };
    let workdir = std::env::current_dir().context("working directory")?;
    let listen_port = if cli.port == 0 {
        uprov_util::free_port().context("allocate listen port")?
    } else {
        cli.port
    };

    let config = Config::new(listen_port, Some(server), workdir, resources_dir);

    // Bundled tools (adb among them) resolve from the resources directory.
    if let Some(path) = std::env::var_os("PATH") {
        let mut paths: Vec<_> = std::env::split_paths(&path).collect();
        paths.push(config.resources_dir.clone());
        std::env::set_var("PATH", std::env::join_paths(paths)?);
    }

    let adb = Adb::new();
    match adb.server_version().await {
        Ok(version) => tracing::info!(%version, "adb server reachable"),
        Err(err) => tracing::warn!(error = %err, "adb server probe failed"),
    }

    let cache = Arc::new(Cache::new(config.workdir.clone())?);
    cache.spawn_recycler();

    let heartbeat = config
        .heartbeat_url()
        .map(|url| Arc::new(HeartbeatClient::new(url, config.listen_port)));
    if let Some(heart) = &heartbeat {
        tracing::info!(id = heart.id(), "heartbeat client ready");
        if let Err(err) = heart.ping().await {
            tracing::warn!(error = %err, "initial heartbeat failed");
        }
        tokio::spawn(Arc::clone(heart).ping_forever());
    }

    let installs = InstallManager::new(cache);

    let ctx = Arc::new(Context {
        config: config.clone(),
        adb: adb.clone(),
        registry: DeviceRegistry::default(),
        heartbeat,
        installs,
        http: reqwest::Client::new(),
    });

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.listen_port))
        .await
        .with_context(|| format!("bind port {}", config.listen_port))?;
    tracing::info!(port = config.listen_port, "listening");

    let app = http::router(Arc::clone(&ctx));
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            tracing::error!(error = %err, "http server exited");
        }
    });

    let (events, watcher) = watch_devices(adb);
    hotplug::run(ctx, events).await;

    // The event channel only closes when the watcher is gone; surface its
    // error so the process exits non-zero.
    match watcher.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(anyhow::Error::new(err).context("device watcher failed")),
        Err(err) => Err(anyhow::Error::new(err).context("device watcher panicked")),
    }
}

fn default_resources_dir() -> anyhow::Result<PathBuf> {
    let exe = std::env::current_exe().context("locate executable")?;
    Ok(exe
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join("resources"))
}
