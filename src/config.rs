//! Configuration types for udrpc.

/// Nexus configuration.
///
/// One Nexus exists per process; every endpoint of the process shares its
/// hostname, management port, and drop hook.
#[derive(Debug, Clone)]
pub struct NexusConfig {
    /// Hostname other endpoints reach this process at.
    /// Default: "localhost"
    pub hostname: String,
    /// Well-known management UDP port shared by all endpoints of the
    /// process.
    /// Default: 31850
    pub mgmt_udp_port: u16,
    /// Probability of silently dropping an outgoing SM packet. Testing
    /// hook for loss injection.
    /// Default: 0.0
    pub drop_prob: f32,
}

impl Default for NexusConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            mgmt_udp_port: 31850,
            drop_prob: 0.0,
        }
    }
}

impl NexusConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the hostname.
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    /// Set the management UDP port.
    pub fn with_mgmt_udp_port(mut self, mgmt_udp_port: u16) -> Self {
        self.mgmt_udp_port = mgmt_udp_port;
        self
    }

    /// Set the SM packet drop probability.
    pub fn with_drop_prob(mut self, drop_prob: f32) -> Self {
        self.drop_prob = drop_prob;
        self
    }
}
