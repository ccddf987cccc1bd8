use anyhow::Result;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use prometheus::{Encoder, Gauge, IntCounter, Registry, TextEncoder};
use std::net::SocketAddr;
use tokio::task::JoinHandle;
use tracing::{error, info};

pub struct Metrics {
    pub registry: Registry,
    pub tasks_completed: IntCounter,
    pub chunks: IntCounter,
    pub matches_found: IntCounter,
    pub kernel_launches: IntCounter,
    pub progress_percent: Gauge,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let tasks_completed = IntCounter::new("tasks_completed_total", "Tasks searched by local devices")?;
        let chunks = IntCounter::new("chunks_total", "Device chunks harvested")?;
        let matches_found = IntCounter::new("matches_found_total", "Matches reported to the coordinator")?;
        let kernel_launches = IntCounter::new("kernel_launches_total", "Kernel launches submitted")?;
        let progress_percent = Gauge::new("progress_percent", "Share of the task space aggregated")?;
        registry.register(Box::new(tasks_completed.clone()))?;
        registry.register(Box::new(chunks.clone()))?;
        registry.register(Box::new(matches_found.clone()))?;
        registry.register(Box::new(kernel_launches.clone()))?;
        registry.register(Box::new(progress_percent.clone()))?;
        Ok(Self {
            registry,
            tasks_completed,
            chunks,
            matches_found,
            kernel_launches,
            progress_percent,
        })
    }

    /// Text exposition of every registered metric.
    pub fn render(&self) -> Result<Vec<u8>> {
        encode(&self.registry)
    }

    pub async fn serve(&self, addr: SocketAddr) -> Result<JoinHandle<()>> {
        let registry = self.registry.clone();
        let make_svc = make_service_fn(move |_| {
            let registry = registry.clone();
            async move {
                Ok::<_, hyper::Error>(service_fn(move |_req: Request<Body>| {
                    let registry = registry.clone();
                    async move {
                        let resp = match encode(&registry) {
                            Ok(buffer) => Response::new(Body::from(buffer)),
                            Err(e) => {
                                error!("metrics encode failed: {e}");
                                let mut resp = Response::new(Body::empty());
                                *resp.status_mut() = hyper::StatusCode::INTERNAL_SERVER_ERROR;
                                resp
                            }
                        };
                        Ok::<_, hyper::Error>(resp)
                    }
                }))
            }
        });
        let server = Server::try_bind(&addr)?.serve(make_svc);
        info!("metrics listening on http://{}/", server.local_addr());
        let handle = tokio::spawn(async move {
            if let Err(e) = server.await {
                error!("metrics server error: {e}");
            }
        });
        Ok(handle)
    }
}

fn encode(registry: &Registry) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_show_up_in_exposition() {
        let m = Metrics::new().unwrap();
        m.tasks_completed.inc_by(620);
        m.matches_found.inc();
        m.progress_percent.set(42.5);
        let text = String::from_utf8(m.render().unwrap()).unwrap();
        assert!(text.contains("tasks_completed_total 620"));
        assert!(text.contains("matches_found_total 1"));
        assert!(text.contains("progress_percent 42.5"));
        assert!(text.contains("kernel_launches_total 0"));
    }

    #[tokio::test]
    async fn serve_binds_an_ephemeral_port() {
        let m = Metrics::new().unwrap();
        let handle = m.serve("127.0.0.1:0".parse().unwrap()).await.unwrap();
        handle.abort();
    }
}
