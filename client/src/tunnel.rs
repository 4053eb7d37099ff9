//! Tunnel orchestration: session, relay, bridge.

use burrow_shared::protocol::CHANNEL_PATH;
use burrow_shared::{Error, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::bridge::{self, Bridge, ChannelEnd};
use crate::config::BurrowConfig;
use crate::provision::ProvisioningService;
use crate::proxy::LocalService;
use crate::session::{ActiveSession, RelayBundle, SessionManager, SessionPhase};
use crate::store::SessionStore;

#[derive(Debug, Clone, Copy)]
pub struct TunnelOptions {
    pub port: u16,
    /// Stop the remote context when the channel ends
    pub auto_shutdown: bool,
}

pub fn validate_port(port: u32) -> Result<u16> {
    u16::try_from(port)
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| Error::Configuration("Port must be a valid port number".into()))
}

/// A running tunnel: the public URL plus the handles to tear it down
pub struct Tunnel {
    options: TunnelOptions,
    session: SessionManager,
    active: ActiveSession,
    bridge: Bridge,
}

impl Tunnel {
    /// Provision or reuse a context for the local port, start the relay in
    /// it and attach the bridge. Returns once traffic can flow.
    pub async fn open(
        options: TunnelOptions,
        config: &BurrowConfig,
        provisioner: Arc<dyn ProvisioningService>,
        store: Arc<dyn SessionStore>,
    ) -> Result<Self> {
        validate_port(u32::from(options.port))?;
        let bundle = RelayBundle::load(config.relay_binary.as_deref())?;
        Self::open_with_bundle(options, config, &bundle, provisioner, store).await
    }

    pub async fn open_with_bundle(
        options: TunnelOptions,
        config: &BurrowConfig,
        bundle: &RelayBundle,
        provisioner: Arc<dyn ProvisioningService>,
        store: Arc<dyn SessionStore>,
    ) -> Result<Self> {
        let mut session = SessionManager::new(provisioner, store, config.context_spec());
        let active = session.provision(options.port).await?;
        let channel_url = bridge::channel_url(&active.public_url, CHANNEL_PATH)?;
        let local = LocalService::new(options.port)?;

        // A reused context may still run the relay; redeploying would
        // overwrite a running binary and start a second one on a bound port
        let running = if active.reused {
            match bridge::connect(&channel_url, local.clone()).await {
                Ok(bridge) => Some(bridge),
                Err(e) => {
                    debug!("No relay answering in reused sandbox: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let bridge = match running {
            Some(bridge) => {
                session.adopt_relay()?;
                bridge
            }
            None => {
                session.start_relay(bundle).await?;
                match bridge::connect_with_retry(&channel_url, local, &config.retry_policy()).await {
                    Ok(bridge) => bridge,
                    Err(e) => {
                        if options.auto_shutdown {
                            if let Err(stop_err) = session.shutdown().await {
                                warn!("Failed to stop sandbox after connect failure: {}", stop_err);
                            }
                        }
                        return Err(e);
                    }
                }
            }
        };
        session.mark_attached();
        session.mark_ready();
        info!("Tunnel ready: {} -> localhost:{}", active.public_url, options.port);

        Ok(Self {
            options,
            session,
            active,
            bridge,
        })
    }

    pub fn url(&self) -> &str {
        &self.active.public_url
    }

    pub fn session(&self) -> &ActiveSession {
        &self.active
    }

    pub fn phase(&self) -> SessionPhase {
        self.session.phase()
    }

    /// Wait for the channel to end. Cancel safe.
    pub async fn closed(&mut self) -> ChannelEnd {
        self.bridge.closed().await
    }

    /// Wait for the channel to end and, with auto shutdown, stop the context
    pub async fn supervise(&mut self) -> Result<ChannelEnd> {
        let end = self.closed().await;
        warn!("Channel ended: {}", end);
        if self.options.auto_shutdown {
            self.session.shutdown().await?;
        }
        Ok(end)
    }

    /// Close the channel, then stop the context. Safe to call repeatedly.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.bridge.close().await;
        self.session.shutdown().await
    }
}
