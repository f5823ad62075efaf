use std::process::exit;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use agentgate::{
    Admission, Backend, BackendHealth, BatchCoordinator, BatchSettings, CacheSettings, CacheStore,
    Clock, GatewayConfig, GatewayHttpState, MemoryStore, Metrics, ModelRouter, OllamaBackend,
    Pipeline, PipelineSettings, RateLimiter, ResponseCache, RetrySettings, RetryingBackend,
    SystemClock,
};

const EXIT_CONFIG: i32 = 64;
const EXIT_BACKEND_UNREACHABLE: i32 = 69;
const EXIT_CACHE_UNREACHABLE: i32 = 74;
const EXIT_INTERRUPTED: i32 = 130;

const USAGE: &str =
    "usage: agentgate <config.json> [--listen HOST:PORT] [--backend-url URL] [--json-logs] [--strict]";

#[derive(Debug)]
struct CliArgs {
    config_path: String,
    listen: Option<String>,
    backend_url: Option<String>,
    json_logs: bool,
    strict: bool,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<CliArgs, String> {
    let config_path = args.next().ok_or(USAGE)?;

    let mut listen = None;
    let mut backend_url = None;
    let mut json_logs = false;
    let mut strict = false;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--listen" | "--addr" => {
                listen = Some(args.next().ok_or("missing value for --listen/--addr")?);
            }
            "--backend-url" => {
                backend_url = Some(args.next().ok_or("missing value for --backend-url")?);
            }
            "--json-logs" => {
                json_logs = true;
            }
            "--strict" => {
                strict = true;
            }
            other => return Err(format!("unknown arg: {other}")),
        }
    }

    Ok(CliArgs {
        config_path,
        listen,
        backend_url,
        json_logs,
        strict,
    })
}

fn init_tracing(log_level: &str, json_logs: bool) {
    let filter = tracing_subscriber::EnvFilter::try_new(log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() {
    let cli = match parse_args(std::env::args().skip(1)) {
        Ok(cli) => cli,
        Err(message) => {
            eprintln!("{message}");
            exit(EXIT_CONFIG);
        }
    };

    let mut config = match GatewayConfig::from_file(&cli.config_path) {
        Ok(config) => config,
        Err(message) => {
            eprintln!("{message}");
            exit(EXIT_CONFIG);
        }
    };
    if let Some(listen) = cli.listen {
        config.bind_address = listen;
    }
    if let Some(backend_url) = cli.backend_url {
        config.backend_url = backend_url;
    }
    let strict = cli.strict || config.strict_startup;
    if let Err(message) = config.validate() {
        eprintln!("{message}");
        exit(EXIT_CONFIG);
    }

    init_tracing(&config.log_level, cli.json_logs);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let metrics = Arc::new(Metrics::default());

    let transport = match OllamaBackend::new(
        &config.backend_url,
        Duration::from_secs(config.backend_timeout_s),
    ) {
        Ok(transport) => transport,
        Err(err) => {
            eprintln!("cannot build backend client: {err}");
            exit(EXIT_CONFIG);
        }
    };
    let backend: Arc<dyn Backend> = Arc::new(RetryingBackend::new(
        Arc::new(transport),
        RetrySettings {
            max_retries: config.backend_max_retries,
            total_deadline: Duration::from_secs(config.backend_total_deadline_s),
        },
        Arc::clone(&metrics),
    ));

    let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::new(
        config.cache_max_entries,
        Arc::clone(&clock),
    ));

    if strict {
        if backend.health().await != BackendHealth::Ok {
            eprintln!("backend unreachable at {}", config.backend_url);
            exit(EXIT_BACKEND_UNREACHABLE);
        }
        if let Err(err) = store.get("agentgate:startup-probe").await {
            eprintln!("cache store unreachable: {err}");
            exit(EXIT_CACHE_UNREACHABLE);
        }
    }

    let cache = Arc::new(ResponseCache::new(
        store,
        CacheSettings {
            enabled: config.cache_enabled,
            default_ttl: Duration::from_secs(config.cache_ttl_default_s),
            negative_ttl: Duration::from_secs(config.negative_ttl_s),
            schema_version: config.schema_version,
        },
        Arc::clone(&clock),
    ));

    let models = Arc::new(ModelRouter::new(
        config.model_aliases.clone(),
        Arc::clone(&clock),
    ));
    if let Err(err) = models.refresh_from(backend.as_ref()).await {
        warn!(error = %err, "initial model listing failed");
    }
    let _refresh_task = ModelRouter::spawn_refresh_task(
        Arc::clone(&models),
        Arc::clone(&backend),
        Duration::from_secs(config.model_refresh_interval_s),
    );

    let pipeline = Arc::new(Pipeline::new(
        cache,
        Arc::clone(&models),
        Arc::clone(&backend),
        Arc::clone(&metrics),
        PipelineSettings {
            schema_version: config.schema_version,
            cache_ttl_s: config.cache_ttl_default_s,
            request_deadline: Duration::from_secs(config.request_deadline_s),
            prompt_max_chars: config.prompt_max_chars,
            extra_state_keys: config.profile_extra_state_keys.clone(),
        },
    ));
    let batch = Arc::new(BatchCoordinator::new(
        Arc::clone(&pipeline),
        BatchSettings {
            max_concurrency: config.batch_max_concurrency,
            batch_deadline: config.batch_deadline_s.map(Duration::from_secs),
            max_tokens_ceiling: config.max_tokens_ceiling,
        },
    ));

    let admission = Arc::new(Admission::new(&config.api_keys));
    if admission.dev_fallback_active() {
        warn!("no api_keys configured; accepting the development key only");
    }
    let limiter = Arc::new(RateLimiter::new(config.default_rate, Arc::clone(&clock)));

    let state = GatewayHttpState::new(
        admission,
        limiter,
        pipeline,
        batch,
        models,
        backend,
        metrics,
        config.max_tokens_ceiling,
    );
    let app = agentgate::router(state);

    let listener = match tokio::net::TcpListener::bind(&config.bind_address).await {
        Ok(listener) => listener,
        Err(err) => {
            eprintln!("cannot bind {}: {err}", config.bind_address);
            exit(EXIT_CONFIG);
        }
    };

    info!(listen = %config.bind_address, backend = %config.backend_url, "agentgate listening");

    let interrupted = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&interrupted);
    let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown_flag.store(true, Ordering::SeqCst);
            info!("interrupt received, shutting down");
        }
    });

    if let Err(err) = serve.await {
        eprintln!("server error: {err}");
        exit(1);
    }

    if interrupted.load(Ordering::SeqCst) {
        exit(EXIT_INTERRUPTED);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_args() {
        let cli = parse_args(vec!["gateway.json".to_string()].into_iter()).expect("parse");
        assert_eq!(cli.config_path, "gateway.json");
        assert!(cli.listen.is_none());
        assert!(!cli.json_logs);
        assert!(!cli.strict);
    }

    #[test]
    fn parses_overrides() {
        let cli = parse_args(
            vec![
                "gateway.json".to_string(),
                "--listen".to_string(),
                "0.0.0.0:9999".to_string(),
                "--backend-url".to_string(),
                "http://host:11434".to_string(),
                "--strict".to_string(),
            ]
            .into_iter(),
        )
        .expect("parse");
        assert_eq!(cli.listen.as_deref(), Some("0.0.0.0:9999"));
        assert_eq!(cli.backend_url.as_deref(), Some("http://host:11434"));
        assert!(cli.strict);
    }

    #[test]
    fn rejects_unknown_args() {
        let err =
            parse_args(vec!["gateway.json".to_string(), "--wat".to_string()].into_iter())
                .expect_err("reject");
        assert!(err.contains("unknown arg"));
    }

    #[test]
    fn missing_config_path_shows_usage() {
        let err = parse_args(Vec::<String>::new().into_iter()).expect_err("reject");
        assert!(err.contains("usage:"));
    }
}
