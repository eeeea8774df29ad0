use crate::config::{AppConfig, SupplierConfig};
use crate::transport::HttpTransport;

/// Shared application state accessible to all handlers.
#[derive(Debug)]
pub struct AppState {
    pub config: AppConfig,
    pub transport: HttpTransport,
}

impl AppState {
    #[must_use]
    pub fn new(config: AppConfig, transport: HttpTransport) -> Self {
        Self { config, transport }
    }

    /// The supplier that lists `model`, else the default one, else the first.
    #[must_use]
    pub fn supplier_for(&self, model: &str) -> Option<&SupplierConfig> {
        let suppliers = &self.config.suppliers;
        suppliers
            .iter()
            .find(|supplier| supplier.models.iter().any(|listed| listed == model))
            .or_else(|| suppliers.iter().find(|supplier| supplier.is_default))
            .or_else(|| suppliers.first())
    }
}
