use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::config::Config;
use crate::export::HealthMetrics;
use crate::record::FhirClient;
use crate::server::Server;

/// App wires the record client, health metrics and telemetry server.
pub struct App {
    cfg: Config,
    health: Arc<HealthMetrics>,
    server: Option<Server<FhirClient>>,
}

impl App {
    /// Creates a new App, initializing health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        Ok(Self {
            cfg,
            health,
            server: None,
        })
    }

    /// Start all components and begin accepting connections.
    pub async fn start(&mut self) -> Result<()> {
        // Health first so probes respond while the listener comes up.
        self.health
            .start()
            .await
            .context("starting health metrics server")?;

        let client = Arc::new(self.create_record_client()?);

        let server = Server::new(
            self.cfg.server.clone(),
            client,
            Arc::clone(&self.health),
            self.cfg.record_store.max_in_flight,
        );

        let addr = server.start().await.context("starting telemetry server")?;
        info!(
            addr = %addr,
            record_store = %self.cfg.record_store.endpoint,
            "accepting device connections"
        );

        self.server = Some(server);

        Ok(())
    }

    /// Stop the server, drain report submissions and stop health metrics.
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(server) = self.server.take() {
            server.stop().await?;
        }

        self.health.stop().await?;

        Ok(())
    }

    /// Create the record store client with metrics callback.
    fn create_record_client(&self) -> Result<FhirClient> {
        let client =
            FhirClient::new(&self.cfg.record_store).context("creating record store client")?;

        let health = Arc::clone(&self.health);
        let client = client.with_metrics(Box::new(move |operation, status, duration| {
            health.observe_record_request(operation, status, duration);
        }));

        Ok(client)
    }
}
