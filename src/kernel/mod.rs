//! Kernel - owns and wires the runtime components.
//!
//! The Kernel holds one event bus, one module registry, one scheduler and one
//! error supervisor, all sharing the same bus. Hosts register modules, call
//! [`Kernel::boot`], then park on [`Kernel::run_until_shutdown`].

pub mod recovery;
pub mod registry;
pub mod types;

use std::sync::Arc;

use crate::eventbus::EventBus;
use crate::scheduler::UnifiedScheduler;
use crate::supervisor::{ErrorHandler, ShutdownReport};
use crate::types::{Config, Result};

pub use recovery::{with_recovery, with_recovery_async};
pub use registry::ModuleRegistry;
pub use types::{Module, ModuleInfo, ModuleManifest, ModuleStatus, StopReport};

/// Runtime root.
#[derive(Debug, Clone)]
pub struct Kernel {
    config: Config,
    bus: Arc<EventBus>,
    registry: Arc<ModuleRegistry>,
    scheduler: Arc<UnifiedScheduler>,
    supervisor: Arc<ErrorHandler>,
}

impl Kernel {
    /// Build every component from `config`.
    ///
    /// Fails only when the scheduler's default timezone is unknown.
    pub fn new(config: Config) -> Result<Self> {
        let bus = Arc::new(EventBus::new(config.event_bus.clone()));
        let registry = Arc::new(ModuleRegistry::new(Arc::clone(&bus)));
        let scheduler = Arc::new(
            UnifiedScheduler::new(config.scheduler.clone())?.with_event_bus(Arc::clone(&bus)),
        );
        let supervisor = ErrorHandler::new(
            config.error_handler.clone(),
            Arc::clone(&registry),
            Arc::clone(&bus),
        );
        supervisor.attach_scheduler(Arc::clone(&scheduler));

        Ok(Self {
            config,
            bus,
            registry,
            scheduler,
            supervisor,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.registry
    }

    pub fn scheduler(&self) -> &Arc<UnifiedScheduler> {
        &self.scheduler
    }

    pub fn supervisor(&self) -> &Arc<ErrorHandler> {
        &self.supervisor
    }

    /// Register a module with the registry.
    pub fn register(&self, id: &str, module: Arc<dyn Module>, manifest: ModuleManifest) -> Result<()> {
        self.registry.register(id, module, manifest)
    }

    /// Arm the supervisor, then initialize and start every module in
    /// dependency order.
    pub async fn boot(&self) -> Result<()> {
        self.supervisor.initialize();
        self.registry.initialize_modules().await?;
        self.registry.start_modules().await?;
        tracing::info!("kernel_booted: modules={}", self.registry.len());
        Ok(())
    }

    /// Wait for any shutdown trigger, then drive shutdown to completion.
    pub async fn run_until_shutdown(&self) -> ShutdownReport {
        let reason = self.supervisor.wait_for_shutdown().await;
        self.supervisor.shutdown(reason).await
    }

    /// Request graceful shutdown and wait for it.
    pub async fn shutdown(&self, reason: &str) -> ShutdownReport {
        self.supervisor.shutdown(reason).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventbus::topics;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Module for Recorder {
        async fn init(&self) -> Result<()> {
            self.log.lock().push(format!("init:{}", self.name));
            Ok(())
        }
        async fn start(&self) -> Result<()> {
            self.log.lock().push(format!("start:{}", self.name));
            Ok(())
        }
        async fn stop(&self) -> Result<()> {
            self.log.lock().push(format!("stop:{}", self.name));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_boot_and_shutdown_order() {
        let kernel = Kernel::new(Config::default()).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        kernel
            .register(
                "games",
                Arc::new(Recorder { name: "games", log: Arc::clone(&log) }),
                ModuleManifest::new("games", "1.0.0").requires(["storage"]),
            )
            .unwrap();
        kernel
            .register(
                "storage",
                Arc::new(Recorder { name: "storage", log: Arc::clone(&log) }),
                ModuleManifest::new("storage", "1.0.0"),
            )
            .unwrap();

        kernel.boot().await.unwrap();
        assert_eq!(kernel.registry().status("games"), Some(ModuleStatus::Started));

        let report = kernel.shutdown("test").await;
        assert!(report.is_clean());
        assert_eq!(report.stopped, vec!["games".to_string(), "storage".to_string()]);
        assert_eq!(
            *log.lock(),
            vec![
                "init:storage",
                "init:games",
                "start:storage",
                "start:games",
                "stop:games",
                "stop:storage"
            ]
        );
    }

    #[tokio::test]
    async fn test_emergency_signal_triggers_shutdown() {
        let kernel = Kernel::new(Config::default()).unwrap();
        kernel.boot().await.unwrap();

        kernel
            .bus()
            .emit(topics::EMERGENCY_SHUTDOWN, serde_json::json!({ "depth": 64 }));

        let report = kernel.run_until_shutdown().await;
        assert!(report.reason.contains("stack depth emergency"));
        assert!(kernel.scheduler().is_stopped());
    }
}
