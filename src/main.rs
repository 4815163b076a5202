use clap::Parser;
use hyper::{
    server::conn::AddrStream,
    service::{make_service_fn, service_fn},
    Server,
};
use std::{convert::Infallible, net::SocketAddr, process, sync::Arc};

use hookforge::cli::Cli;
use hookforge::config::Config;
use hookforge::dispatcher::Dispatcher;
use hookforge::executor::{Executor, ExecutorConfig};
use hookforge::ext::{NoopAudit, NoopRateLimiter};
use hookforge::logging;
use hookforge::metrics::Metrics;
use hookforge::reload::ReloadSupervisor;
use hookforge::store::HookStore;

#[tokio::main]
async fn main() {
    logging::init_logging();

    let cli = Cli::parse();

    let mut cfg = match &cli.config {
        Some(path) => match Config::from_file(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("{e}");
                process::exit(1);
            }
        },
        None => Config::default(),
    };
    cli.apply_overrides(&mut cfg);

    if cfg.hooks_paths.is_empty() {
        eprintln!("no hook definition files configured (pass --hooks or set hooks_paths)");
        process::exit(1);
    }

    let cfg = Arc::new(cfg);
    let store = Arc::new(HookStore::new());

    // ReloadSupervisor::start always performs the initial load before
    // returning; when hot reload is disabled the supervisor (and its
    // watcher) is dropped right away, leaving the store populated.
    let supervisor = match ReloadSupervisor::start(
        cfg.hooks_paths.clone(),
        store.clone(),
        cfg.template_mode,
        cfg.verbose,
        cfg.no_panic,
    )
    .await
    {
        Ok(supervisor) => supervisor,
        Err(e) => {
            eprintln!("failed to load hook definitions: {e}");
            process::exit(1);
        }
    };
    let _reload = cfg.hot_reload.then_some(supervisor);

    let executor = Arc::new(Executor::new(ExecutorConfig {
        max_concurrent_hooks: cfg.max_concurrent_hooks,
        slot_acquisition_timeout: cfg.slot_acquisition_timeout(),
        hook_timeout: cfg.hook_timeout(),
        allowed_command_paths: cfg.allowed_command_paths.clone(),
        allow_auto_chmod: cfg.allow_auto_chmod,
    }));
    let metrics = Arc::new(Metrics::new());
    let dispatcher = Arc::new(Dispatcher::new(
        cfg.clone(),
        store.clone(),
        executor.clone(),
        metrics.clone(),
        Arc::new(NoopAudit),
        Arc::new(NoopRateLimiter),
    ));

    let addr = SocketAddr::from((cfg.bind_addr, cfg.bind_port));
    let make_svc = make_service_fn(move |conn: &AddrStream| {
        let dispatcher = dispatcher.clone();
        let remote_addr = conn.remote_addr();
        let log = logging::log_context(&remote_addr);
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let dispatcher = dispatcher.clone();
                let mut log = log.clone();
                async move {
                    log.start().req(&req);
                    let res = dispatcher.dispatch(req, remote_addr, &mut log).await;
                    log.res(&res).end();
                    logging::info!("{}", log.clf_with_timing());
                    res
                }
            }))
        }
    });

    let server = Server::bind(&addr).serve(make_svc);
    logging::info!("listening on {addr}");

    let shutdown_grace = cfg.shutdown_grace();
    let graceful = server.with_graceful_shutdown(shutdown_signal());
    if let Err(e) = graceful.await {
        eprintln!("server error: {e}");
        process::exit(1);
    }

    logging::info!("shutting down, draining async children (up to {shutdown_grace:?})");
    executor.wait_for_async_children(shutdown_grace).await;
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
