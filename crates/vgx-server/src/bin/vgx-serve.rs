// src/bin/vgx-serve.rs
use std::sync::atomic::Ordering;
use vgx_server::logging::init_logging;
use vgx_server::{
    HttpStatus, PluginOutcome, PluginPhases, QueryParams, Registry, RequestView, ResponseSink, Server,
    ServerConfig,
};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Returns the request body and query parameters.
fn echo(
    _name: &str,
    _post: bool,
    params: &QueryParams,
    request: &RequestView<'_>,
    out: &mut ResponseSink<'_>,
) -> PluginOutcome {
    let body = String::from_utf8_lossy(request.content);
    let params: serde_json::Map<String, serde_json::Value> = params
        .iter()
        .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.to_string())))
        .collect();
    let value = serde_json::json!({
        "method": request.method.as_str(),
        "params": params,
        "body": body,
    });
    match out.write_json(&value) {
        Ok(()) => PluginOutcome::ok(),
        Err(e) => PluginOutcome::error(HttpStatus::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

fn ping(
    _name: &str,
    _post: bool,
    _params: &QueryParams,
    _request: &RequestView<'_>,
    out: &mut ResponseSink<'_>,
) -> PluginOutcome {
    match out.write(b"\"pong\"") {
        Ok(()) => PluginOutcome::ok(),
        Err(e) => PluginOutcome::error(HttpStatus::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let config = ServerConfig::from_env()?;
    let registry = Registry::builder()
        .plugin("echo", PluginPhases::NONE, echo)
        .builtin("ping", ping)
        .build();

    let handle = Server::from_config(config).registry(registry).start()?;
    tracing::info!(addr = %handle.local_addr(), "vgx-serve ready");

    let stop = handle.stop_flag();
    ctrlc::set_handler(move || {
        tracing::info!("received SIGINT, shutting down");
        stop.store(true, Ordering::Release);
    })?;

    handle.join()?;
    Ok(())
}
