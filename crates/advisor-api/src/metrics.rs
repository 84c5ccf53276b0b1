//! Prometheus registry owned by the server
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

pub struct GatewayMetrics {
    registry: Registry,
    api_requests: IntCounterVec,
    identity_types: IntCounterVec,
    rejected_service_accounts: IntCounter,
}

impl GatewayMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let api_requests = IntCounterVec::new(
            Opts::new("api_endpoints_requests", "Number of requests per API endpoint"),
            &["endpoint"],
        )?;
        let identity_types = IntCounterVec::new(
            Opts::new("rbac_identity_types", "Identity types seen by the authorization check"),
            &["type"],
        )?;
        let rejected_service_accounts = IntCounter::new(
            "rbac_service_accounts_rejected",
            "Service account requests without advisor permissions",
        )?;

        registry.register(Box::new(api_requests.clone()))?;
        registry.register(Box::new(identity_types.clone()))?;
        registry.register(Box::new(rejected_service_accounts.clone()))?;

        Ok(Self {
            registry,
            api_requests,
            identity_types,
            rejected_service_accounts,
        })
    }

    pub fn observe_request(&self, endpoint: &str) {
        self.api_requests.with_label_values(&[endpoint]).inc();
    }

    pub fn observe_identity_type(&self, account_type: &str) {
        self.identity_types.with_label_values(&[account_type]).inc();
    }

    pub fn observe_rejected_service_account(&self) {
        self.rejected_service_accounts.inc();
    }

    pub fn encode(&self) -> Result<String, prometheus::Error> {
        encode(&self.registry)
    }
}

pub fn encode(registry: &Registry) -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&registry.gather(), &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_are_exported() {
        let metrics = GatewayMetrics::new().unwrap();
        metrics.observe_request("/rule");
        metrics.observe_identity_type("ServiceAccount");
        metrics.observe_rejected_service_account();

        let text = metrics.encode().unwrap();
        assert!(text.contains("api_endpoints_requests{endpoint=\"/rule\"} 1"));
        assert!(text.contains("rbac_identity_types{type=\"ServiceAccount\"} 1"));
        assert!(text.contains("rbac_service_accounts_rejected 1"));
    }
}
