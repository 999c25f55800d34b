//! Registry mapping detector kind names to backends

use std::sync::Arc;

use serde_json::{Map, Value};

use super::{DetectorBackend, DetectorConfig, DetectorTransport, UdpBackend};
use crate::error::ServiceError;

/// Set of detector backends the service can start.
///
/// The set is fixed once the service is running; lookups never mutate it.
#[derive(Clone, Default)]
pub struct DetectorRegistry {
    backends: Vec<Arc<dyn DetectorBackend>>,
}

impl DetectorRegistry {
    /// Empty registry (tests register their own backends)
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in backends
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(UdpBackend::new());
        registry
    }

    /// Add a backend. A later backend with the same kind shadows nothing;
    /// lookups return the first match.
    pub fn register(&mut self, backend: impl DetectorBackend) {
        log::debug!("Registering detector backend: {}", backend.kind());
        self.backends.push(Arc::new(backend));
    }

    /// Canonical names of all registered kinds, in registration order
    pub fn supported(&self) -> Vec<String> {
        self.backends.iter().map(|b| b.kind().to_string()).collect()
    }

    fn find(&self, name: &str) -> Option<&Arc<dyn DetectorBackend>> {
        self.backends.iter().find(|b| b.matches(name))
    }

    /// Validate `start` arguments for the named kind
    pub fn parse(
        &self,
        kind: &str,
        args: &Map<String, Value>,
    ) -> Result<DetectorConfig, ServiceError> {
        let backend = self
            .find(kind)
            .ok_or_else(|| ServiceError::UnsupportedDetector(kind.to_string()))?;

        backend
            .parse(args)
            .map_err(ServiceError::InvalidConfiguration)
    }

    /// Bind a transport for an already validated configuration
    pub async fn bind(
        &self,
        config: &DetectorConfig,
    ) -> Result<Box<dyn DetectorTransport>, ServiceError> {
        let backend = self
            .find(config.kind())
            .ok_or_else(|| ServiceError::UnsupportedDetector(config.kind().to_string()))?;

        Ok(backend.bind(config).await?)
    }
}

/// Parse the `address`/`port` pair shared by endpoint-based detectors.
///
/// `address` may also be given as `ip`. `port` may be a JSON number or a
/// numeric string.
pub fn parse_endpoint(args: &Map<String, Value>) -> Result<(String, u16), String> {
    let address = args
        .get("address")
        .or_else(|| args.get("ip"))
        .ok_or_else(|| "missing required argument 'address'".to_string())?;

    let address = match address {
        Value::String(s) => s.trim().to_string(),
        other => return Err(format!("'address' must be a string, got {}", other)),
    };

    if address.is_empty() {
        return Err("'address' must not be empty".to_string());
    }
    if address.chars().any(char::is_whitespace) {
        return Err(format!("'address' contains whitespace: {:?}", address));
    }

    let port = args
        .get("port")
        .ok_or_else(|| "missing required argument 'port'".to_string())?;

    let port: i64 = match port {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| format!("'port' must be an integer, got {}", n))?,
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| format!("'port' is not a number: {:?}", s))?,
        other => return Err(format!("'port' must be an integer, got {}", other)),
    };

    let port = u16::try_from(port)
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| format!("'port' out of range: {}", port))?;

    Ok((address, port))
}
