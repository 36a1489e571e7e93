//! Library entry point. Kept close to the teacher's shape (panic hook wired
//! into the logger before anything else starts, `server::spawn`/`server::serve`
//! as the process's one long-running task) with the Tauri desktop-shell glue
//! removed — this is a headless binary, not an app.

pub mod accounts;
pub mod billing;
pub mod classifier;
pub mod clock;
pub mod concurrency;
pub mod config;
pub mod db;
pub mod deferred;
pub mod forward;
pub mod gateway_error;
pub mod logger;
pub mod model;
pub mod orchestrator;
pub mod pricing;
pub mod quota;
pub mod scheduler;
pub mod server;
pub mod token_provider;
pub mod users;

/// Installs the panic-to-logger hook and brings up every process-wide
/// subsystem (db, logger, account/user/pricing stores, background tickers).
/// Split out from `main` so `server_main` stays a thin shim.
pub fn init() {
    std::panic::set_hook(Box::new(|panic_info| {
        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown location".to_string());

        crate::logger::error("panic", &format!("panic occurred: message='{message}', location='{location}'"));
        eprintln!("fatal panic: {message} at {location}");
    }));

    crate::db::init();
    crate::logger::init();
    crate::logger::info("startup", "initializing");

    let cfg = crate::config::load();
    crate::accounts::reload_from_config(&cfg);
    crate::users::reload_from_config(&cfg);
    crate::pricing::load_local();

    if let Some(remote_url) = cfg.pricing.remote_url.clone() {
        let hash_url = cfg.pricing.hash_url.clone().unwrap_or_default();
        crate::pricing::spawn_refresh_ticker(remote_url, hash_url, cfg.pricing.update_interval_hours.max(1) * 60);
    }

    crate::concurrency::spawn_cleanup_task(
        std::time::Duration::from_secs(120),
        std::time::Duration::from_secs(60),
    );
    crate::deferred::spawn_flush_loop(10);

    tokio::spawn(async {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(300));
        loop {
            ticker.tick().await;
            crate::accounts::prune_expired_sessions(crate::clock::now_epoch_secs());
        }
    });

    crate::logger::info("startup", "ready");
}
