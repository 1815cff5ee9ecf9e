use reqwest::Client;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use super::automation::AutomationDriverFactory;
use super::captcha::CaptchaSolver;
use super::traits::DriverFactory;
use crate::error::ReconcileError;
use crate::ledger::models::PanelKind;

/// Maps each panel kind to the factory that builds its driver
pub struct DriverRegistry {
    factories: HashMap<PanelKind, Arc<dyn DriverFactory>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with every panel kind routed through the automation worker
    pub fn with_automation(client: Client, automation_url: &str, solver: Arc<dyn CaptchaSolver>) -> Self {
        let mut registry = Self::new();
        for kind in PanelKind::all() {
            registry.register(Arc::new(AutomationDriverFactory::new(
                kind,
                client.clone(),
                automation_url,
                solver.clone(),
            )));
        }
        registry
    }

    /// Only call this during startup
    pub fn register(&mut self, factory: Arc<dyn DriverFactory>) {
        info!("Registering driver factory for panel kind: {}", factory.kind());
        self.factories.insert(factory.kind(), factory);
    }

    pub fn get(&self, kind: PanelKind) -> Result<Arc<dyn DriverFactory>, ReconcileError> {
        self.factories
            .get(&kind)
            .cloned()
            .ok_or_else(|| ReconcileError::DriverNotRegistered(kind.to_string()))
    }

    pub fn supports(&self, kind: PanelKind) -> bool {
        self.factories.contains_key(&kind)
    }

    pub fn registered_kinds(&self) -> Vec<PanelKind> {
        self.factories.keys().copied().collect()
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DriverError;
    use async_trait::async_trait;

    struct NoopSolver;

    #[async_trait]
    impl CaptchaSolver for NoopSolver {
        async fn solve(&self, _api_key: &str, _site_key: &str, _page_url: &str) -> Result<String, DriverError> {
            Ok(String::new())
        }
    }

    #[test]
    fn test_automation_registry_covers_every_kind() {
        let registry = DriverRegistry::with_automation(Client::new(), "http://automation.local", Arc::new(NoopSolver));

        for kind in PanelKind::all() {
            assert!(registry.supports(kind));
            assert_eq!(registry.get(kind).unwrap().kind(), kind);
        }
        assert_eq!(registry.registered_kinds().len(), PanelKind::all().len());
    }

    #[test]
    fn test_missing_kind_is_an_error() {
        let registry = DriverRegistry::new();
        assert!(matches!(
            registry.get(PanelKind::RushPlay),
            Err(ReconcileError::DriverNotRegistered(kind)) if kind == "rushplay"
        ));
    }
}
