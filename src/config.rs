use crate::session::Role;

/// All analysis tunables in one immutable value.
///
/// The core keeps no global state: every stage receives the config it needs
/// from the caller. `Default` matches the behaviour of the trace producer's
/// own analyser.
#[derive(Debug, Clone)]
pub struct AnalysisConfig {
    /// Approved TLS cipher suite ids. Empty list disables the check.
    pub approved_ciphers: Vec<u16>,
    /// Case-insensitive hostname substring → role, checked in order.
    pub hostname_roles: Vec<(String, Role)>,
    /// IP prefix (textual, e.g. "10.1.") → role. Checked after SNI and port.
    pub ip_roles: Vec<(String, Role)>,
    /// Well-known server IPs → display label (public DNS resolvers etc.).
    pub ip_labels: Vec<(&'static str, &'static str)>,
    /// TLS analysis for role detection looks at most this many items per
    /// session.
    pub role_scan_items: usize,
    /// BER-TLV tag carrying channel data in SEND/RECEIVE DATA payloads
    /// (comprehension bit tolerated).
    pub channel_data_tag: u8,
    /// Report "No Service" location status as Critical instead of Warning.
    pub no_service_critical: bool,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        AnalysisConfig {
            approved_ciphers: Vec::new(),
            hostname_roles: vec![
                ("smdpplus".into(), Role::SmDpPlus),
                ("smdp".into(), Role::SmDpPlus),
                ("smds".into(), Role::SmDs),
                ("dpplus".into(), Role::Eim),
                ("eim".into(), Role::Eim),
                ("tac.".into(), Role::Tac),
                ("thales".into(), Role::Tac),
            ],
            ip_roles: Vec::new(),
            ip_labels: vec![
                ("212.30.200.199", "SIMIN DNS Serveur"),
                ("212.30.200.200", "SIMIN DNS Serveur"),
                ("8.8.8.8", "Google DNS"),
                ("8.8.4.4", "Google DNS"),
                ("1.1.1.1", "Cloudflare DNS"),
                ("1.0.0.1", "Cloudflare DNS"),
                ("9.9.9.9", "Quad9 DNS"),
                ("208.67.222.222", "OpenDNS"),
                ("208.67.220.220", "OpenDNS"),
            ],
            role_scan_items: 20,
            channel_data_tag: 0x36,
            no_service_critical: false,
        }
    }
}

impl AnalysisConfig {
    /// Display label for a well-known server IP, if any.
    pub fn label_for_ip(&self, ip: &str) -> Option<&'static str> {
        self.ip_labels
            .iter()
            .find(|(known, _)| *known == ip)
            .map(|(_, label)| *label)
    }

    /// Role for an IP from the configured prefix table.
    pub fn role_for_ip(&self, ip: &str) -> Option<Role> {
        self.ip_roles
            .iter()
            .find(|(prefix, _)| ip.starts_with(prefix.as_str()))
            .map(|(_, role)| *role)
    }

    /// Role for a hostname from the configured substring patterns.
    pub fn role_for_hostname(&self, hostname: &str) -> Option<Role> {
        let lower = hostname.to_ascii_lowercase();
        self.hostname_roles
            .iter()
            .find(|(pattern, _)| lower.contains(pattern.as_str()))
            .map(|(_, role)| *role)
    }
}
