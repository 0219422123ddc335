//! Proxy server.
//!
//! Binds the hudsucker engine to the listen address with the Warden CA and
//! [`WardenHandler`].

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use hudsucker::rustls::crypto::aws_lc_rs::default_provider;
use hudsucker::Proxy;
use tokio::sync::broadcast;

use warden_core::config::WardenConfig;
use warden_core::ActivityLog;
use warden_storage::PolicyView;

use crate::api::PolicyApi;
use crate::ca::CaManager;
use crate::error::{ProxyError, Result};
use crate::handler::WardenHandler;

/// Everything the server needs to run.
#[derive(Clone)]
pub struct ProxyConfig {
    /// Address to bind the proxy to.
    pub addr: SocketAddr,
    pub ca_manager: CaManager,
    pub settings: Arc<WardenConfig>,
    pub policy: PolicyView,
    pub api: Arc<dyn PolicyApi>,
    pub activity: Arc<dyn ActivityLog>,
}

impl std::fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("addr", &self.addr)
            .field("ca_manager", &self.ca_manager)
            .field("api", &self.settings.api.base_url)
            .field("default_level", &self.policy.default_level())
            .finish()
    }
}

impl ProxyConfig {
    /// Listen address and CA directory come from `settings`.
    pub fn new(
        settings: Arc<WardenConfig>,
        policy: PolicyView,
        api: Arc<dyn PolicyApi>,
        activity: Arc<dyn ActivityLog>,
    ) -> Result<Self> {
        let ca_manager = CaManager::from_config(settings.ca_dir.as_deref())?;

        Ok(Self {
            addr: settings.listen_addr,
            ca_manager,
            settings,
            policy,
            api,
            activity,
        })
    }

    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    pub fn with_ca_manager(mut self, ca_manager: CaManager) -> Self {
        self.ca_manager = ca_manager;
        self
    }

    fn handler(&self) -> WardenHandler {
        WardenHandler::new(
            self.settings.clone(),
            self.policy.clone(),
            self.api.clone(),
            self.activity.clone(),
        )
    }
}

/// Intercepting proxy server.
pub struct ProxyServer {
    config: ProxyConfig,
}

impl ProxyServer {
    /// Creates the server, generating the CA if it is missing.
    pub fn new(config: ProxyConfig) -> Result<Self> {
        config.ca_manager.ensure_ca()?;
        Ok(Self { config })
    }

    pub fn addr(&self) -> SocketAddr {
        self.config.addr
    }

    /// Returns the CA certificate path for installation on clients.
    pub fn ca_cert_path(&self) -> std::path::PathBuf {
        self.config.ca_manager.cert_path()
    }

    pub fn ca_cert_der(&self) -> Result<Vec<u8>> {
        self.config.ca_manager.read_cert_der().map_err(ProxyError::Ca)
    }

    /// Serves until `shutdown` resolves or the listener fails.
    async fn serve<F>(config: ProxyConfig, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let authority = config.ca_manager.ensure_ca()?;
        let proxy = Proxy::builder()
            .with_addr(config.addr)
            .with_ca(authority)
            .with_rustls_connector(default_provider())
            .with_http_handler(config.handler())
            .with_graceful_shutdown(shutdown)
            .build()
            .map_err(|e| ProxyError::Proxy(e.to_string()))?;

        tracing::info!("Warden proxy listening on {}", config.addr);
        proxy
            .start()
            .await
            .map_err(|e| ProxyError::Proxy(e.to_string()))
    }

    /// Runs the proxy in the current task until it fails.
    pub async fn run(self) -> Result<()> {
        tracing::info!("CA certificate: {:?}", self.ca_cert_path());
        Self::serve(self.config, std::future::pending()).await
    }

    /// Starts the proxy in the background.
    pub fn start(self) -> Result<ProxyHandle> {
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);
        let addr = self.config.addr;

        let handle = tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.recv().await;
                tracing::info!("Proxy shutdown signal received");
            };
            if let Err(e) = Self::serve(self.config, shutdown).await {
                tracing::error!("Proxy error: {}", e);
            }
        });

        Ok(ProxyHandle {
            shutdown_tx,
            addr,
            handle,
        })
    }
}

/// Handle for controlling a running proxy server.
pub struct ProxyHandle {
    shutdown_tx: broadcast::Sender<()>,
    addr: SocketAddr,
    handle: tokio::task::JoinHandle<()>,
}

impl ProxyHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signals the proxy to stop accepting and drain.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    pub async fn wait(self) {
        let _ = self.handle.await;
    }

    pub async fn stop(self) {
        self.shutdown();
        self.wait().await;
    }
}
