use metrics::{Unit, describe_counter};

pub(crate) const TELEMETRY_COUNTER_TLS_CONNECTIONS: &str = "gangway_tls_connections_total";
pub(crate) const TELEMETRY_COUNTER_DAEMON_CONNECTIONS: &str = "gangway_daemon_connections_total";
pub(crate) const TELEMETRY_COUNTER_HTTP_REQUESTS: &str = "gangway_http_requests_total";
pub(crate) const TELEMETRY_COUNTER_DNS_QUERIES: &str = "gangway_dns_queries_total";
pub(crate) const TELEMETRY_COUNTER_SSH_SESSIONS: &str = "gangway_ssh_sessions_total";

// Registers metric metadata. Installing a recorder/exporter is left to the
// embedder; without one these are no-ops.
pub(crate) fn describe_telemetry() {
    describe_counter!(
        TELEMETRY_COUNTER_TLS_CONNECTIONS,
        Unit::Count,
        "Connections accepted on the TLS routing port"
    );
    describe_counter!(
        TELEMETRY_COUNTER_DAEMON_CONNECTIONS,
        Unit::Count,
        "Connections accepted on the fixed daemon port"
    );
    describe_counter!(
        TELEMETRY_COUNTER_HTTP_REQUESTS,
        Unit::Count,
        "Requests proxied on the plain HTTP port"
    );
    describe_counter!(
        TELEMETRY_COUNTER_DNS_QUERIES,
        Unit::Count,
        "DNS queries answered by the name resolver"
    );
    describe_counter!(
        TELEMETRY_COUNTER_SSH_SESSIONS,
        Unit::Count,
        "SSH sessions relayed to backend instances"
    );
}
