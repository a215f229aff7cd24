// src/server.rs
use crate::config::Config;
use crate::error::{BffError, BffResult};
use crate::metrics::WorkerMetrics;
use crate::pool::FallbackPool;
use crate::router::Router;
use crate::syscalls;
use crate::worker::Worker;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub struct Server {
    host_port: String,
    workers: usize,
    max_connections: usize,
    fallback_connections: usize,
    request_timeout: Duration,
    keep_alive_timeout: Duration,
    repeat_guard: bool,
}

impl Server {
    pub fn bind(host_port: &str) -> Self {
        let defaults = Config::default();
        Self {
            host_port: host_port.to_string(),
            workers: defaults.workers,
            max_connections: defaults.max_connections,
            fallback_connections: defaults.fallback_connections,
            request_timeout: Duration::from_millis(defaults.request_timeout_ms),
            keep_alive_timeout: Duration::from_millis(defaults.keep_alive_timeout_ms),
            repeat_guard: defaults.repeat_guard,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            host_port: format!("{}:{}", config.host, config.port),
            workers: config.workers,
            max_connections: config.max_connections,
            fallback_connections: config.fallback_connections,
            request_timeout: Duration::from_millis(config.request_timeout_ms),
            keep_alive_timeout: Duration::from_millis(config.keep_alive_timeout_ms),
            repeat_guard: config.repeat_guard,
        }
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn max_connections(mut self, per_worker: usize) -> Self {
        self.max_connections = per_worker;
        self
    }

    pub fn fallback_connections(mut self, records: usize) -> Self {
        self.fallback_connections = records;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn keep_alive_timeout(mut self, timeout: Duration) -> Self {
        self.keep_alive_timeout = timeout;
        self
    }

    pub fn repeat_guard(mut self, enabled: bool) -> Self {
        self.repeat_guard = enabled;
        self
    }

    /// Serve until SIGINT or SIGTERM. SIGPIPE is ignored so a peer vanishing
    /// mid-write surfaces as EPIPE instead of killing the process.
    pub fn serve(self, router: Router) -> BffResult<()> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();
        ctrlc::set_handler(move || {
            info!("shutdown signal received");
            flag.store(true, Ordering::SeqCst);
        })
        .map_err(|e| BffError::Other(format!("failed to install signal handler: {}", e)))?;

        self.serve_until(router, shutdown)
    }

    /// Serve until `shutdown` becomes true. Embedders (and the integration
    /// tests) drive shutdown themselves through the flag.
    pub fn serve_until(self, router: Router, shutdown: Arc<AtomicBool>) -> BffResult<()> {
        unsafe {
            libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        }

        let (host, port) = self.parse_host_port();
        let listen_fd = syscalls::create_listen_socket(&host, port)?;
        info!(host = %host, port, workers = self.workers, "listening");

        let router = Arc::new(router);
        let fallback = Arc::new(FallbackPool::new(self.fallback_connections));
        let engine_cfg = crate::config::EngineConfig {
            max_connections: self.max_connections,
            request_timeout: self.request_timeout,
            keep_alive_timeout: self.keep_alive_timeout,
            repeat_guard: self.repeat_guard,
        };

        let mut worker_metrics = Vec::with_capacity(self.workers);
        for _ in 0..self.workers {
            worker_metrics.push(Arc::new(WorkerMetrics::new()));
        }
        spawn_metrics_reporter(worker_metrics.clone(), shutdown.clone());

        let core_ids = core_affinity::get_core_ids().unwrap_or_default();
        let mut handles = Vec::with_capacity(self.workers);

        for i in 0..self.workers {
            let core_id = if core_ids.is_empty() {
                None
            } else {
                core_ids.get(i % core_ids.len()).copied()
            };
            let router = router.clone();
            let metrics = worker_metrics[i].clone();
            let fallback = fallback.clone();
            let shutdown = shutdown.clone();
            let cfg = engine_cfg.clone();

            let handle = thread::Builder::new()
                .name(format!("bff-worker-{}", i))
                .spawn(move || {
                    if let Some(id) = core_id {
                        if core_affinity::set_for_current(id) {
                            debug!(worker = i, cpu = id.id, "worker pinned");
                        } else {
                            warn!(worker = i, cpu = id.id, "failed to pin worker");
                        }
                    }
                    let mut worker = Worker::new(i, listen_fd, router, metrics, fallback, cfg);
                    worker.run(shutdown);
                })?;
            handles.push(handle);
        }

        for handle in handles {
            if handle.join().is_err() {
                error!("worker thread panicked");
            }
        }

        syscalls::close_fd(listen_fd);
        info!("server shut down");
        Ok(())
    }

    fn parse_host_port(&self) -> (String, u16) {
        let mut parts = self.host_port.rsplitn(2, ':');
        let port = parts
            .next()
            .and_then(|p| p.parse().ok())
            .unwrap_or(8080);
        let host = parts.next().unwrap_or("0.0.0.0").to_string();
        (host, port)
    }
}

fn spawn_metrics_reporter(metrics: Vec<Arc<WorkerMetrics>>, shutdown: Arc<AtomicBool>) {
    use std::sync::atomic::Ordering::Relaxed;

    thread::Builder::new()
        .name("bff-metrics".to_string())
        .spawn(move || {
            while !shutdown.load(Ordering::Acquire) {
                thread::sleep(Duration::from_secs(5));
                if shutdown.load(Ordering::Acquire) {
                    break;
                }

                let mut requests = 0;
                let mut active = 0;
                let mut bytes = 0;
                let mut protocol_errors = 0;
                let mut timeouts = 0;
                for m in &metrics {
                    requests += m.req_count.load(Relaxed);
                    active += m.active_conns.load(Relaxed);
                    bytes += m.bytes_sent.load(Relaxed);
                    protocol_errors += m.protocol_errors.load(Relaxed);
                    timeouts += m.timeouts.load(Relaxed);
                }
                info!(
                    active,
                    requests, bytes, protocol_errors, timeouts, "server metrics"
                );
            }
        })
        .ok();
}
