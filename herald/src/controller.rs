use std::sync::{Arc, LazyLock};

use herald_common::{Signal, internal, logging};
use herald_delivery::{DeliveryConfig, DeliveryProcessor, SystemError};
use herald_metrics::MetricsConfig;
use serde::Deserialize;
use tokio::sync::broadcast;

use crate::{
    demo::{self, DemoConfig},
    notifier,
    simulated::{SimulatedChannel, SimulatedConfig},
};

pub const SIMULATED_CHANNEL: &str = "simulated";

fn default_channel() -> String {
    SIMULATED_CHANNEL.to_string()
}

#[derive(Debug, Deserialize)]
pub struct Herald {
    /// Name of the external channel to deliver through
    #[serde(default = "default_channel")]
    channel: String,
    #[serde(default)]
    simulated: SimulatedConfig,
    #[serde(default)]
    delivery: DeliveryConfig,
    #[serde(default)]
    metrics: MetricsConfig,
    #[serde(default)]
    demo: DemoConfig,
}

impl Default for Herald {
    fn default() -> Self {
        Self {
            channel: default_channel(),
            simulated: SimulatedConfig::default(),
            delivery: DeliveryConfig::default(),
            metrics: MetricsConfig::default(),
            demo: DemoConfig::default(),
        }
    }
}

pub static SHUTDOWN_BROADCAST: LazyLock<broadcast::Sender<Signal>> = LazyLock::new(|| {
    let (sender, _receiver) = broadcast::channel(64);
    sender
});

async fn shutdown() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!("CTRL+C entered -- Enter it again to force shutdown");
        }
        _ = terminate.recv() => {
            internal!("Terminate Signal received, shutting down");
        }
    };

    let mut receiver = SHUTDOWN_BROADCAST.subscribe();

    SHUTDOWN_BROADCAST
        .send(Signal::Shutdown)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Interrupted, e.to_string()))?;

    loop {
        tokio::select! {
            sig = receiver.recv() => {
                match sig {
                    Ok(s) => tracing::debug!("Received {s:?}"),
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(e) => tracing::debug!("Received: {e:?}"),
                }
            }

            _ = tokio::signal::ctrl_c() => {
                break;
            }
        }
    }

    Ok(())
}

impl Herald {
    /// Resolve the configured channel by name
    ///
    /// # Errors
    ///
    /// Returns [`SystemError::ServiceNotFound`] if no channel has that name.
    pub fn channel(&self) -> Result<Arc<SimulatedChannel>, SystemError> {
        match self.channel.as_str() {
            SIMULATED_CHANNEL => Ok(Arc::new(SimulatedChannel::new(&self.simulated))),
            other => Err(SystemError::ServiceNotFound(format!("channel '{other}'"))),
        }
    }

    pub const fn delivery(&self) -> &DeliveryConfig {
        &self.delivery
    }

    pub const fn demo(&self) -> &DemoConfig {
        &self.demo
    }

    /// Run the delivery pipeline, and the demo if enabled, until shutdown
    ///
    /// # Errors
    ///
    /// This function will return an error if metrics, the channel or the
    /// delivery processor fail to initialise.
    pub async fn run(self) -> anyhow::Result<()> {
        logging::init();
        herald_metrics::init_metrics(&self.metrics)?;

        internal!("Controller running");

        let channel = self.channel()?;
        let processor = Arc::new(DeliveryProcessor::new(
            self.delivery,
            Arc::clone(&channel) as Arc<dyn herald_delivery::ExternalChannel>,
        )?);

        let notifications = tokio::spawn(notifier::log_events(processor.subscribe()));

        let demo = if self.demo.enabled {
            let config = self.demo;
            let processor = Arc::clone(&processor);
            Some(tokio::spawn(async move {
                demo::run(config, processor, channel).await;
                // Same path as an operator-initiated shutdown
                let _ = SHUTDOWN_BROADCAST.send(Signal::Finalised);
            }))
        } else {
            None
        };

        let ret = tokio::select! {
            r = Arc::clone(&processor).serve(SHUTDOWN_BROADCAST.subscribe()) => {
                r.map_err(anyhow::Error::from)
            }
            r = shutdown() => {
                r
            }
        };

        internal!("Shutting down...");

        if let Some(demo) = demo {
            demo.abort();
        }
        notifications.abort();

        ret
    }
}
