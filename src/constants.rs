//! Fixed protocol constants shared between the proxy and worker binaries.

/// Header the proxy reads to identify the tenant. Stripped before publish.
pub const TENANT_HEADER: &str = "X-UB-GUID";

/// Header the proxy adds so the origin can identify traffic from this system.
pub const TAG_HEADER_NAME: &str = "X-Hackerone";
pub const TAG_HEADER_VALUE: &str = "benteveo";

/// Routing key / queue name workers consume from.
pub const RPC_QUEUE: &str = "rpc_queue";

/// Sentinel prefix the codec uses to mark base64-encoded byte strings.
pub const BASE64_SENTINEL: &str = "application/base64:";

/// Broker's configured max message size, with margin subtracted (~130 MB cap).
pub const MAX_MESSAGE_SIZE: usize = 130 * 1024 * 1024 - (1024 * 1024);

/// Default wall-clock deadline for a dispatched RPC call.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 15_000;

/// Default outbound socket timeout used by the worker executor.
pub const DEFAULT_OUTBOUND_TIMEOUT_MS: u64 = 15_000;

/// Default number of write records drained per persistence cycle.
pub const DEFAULT_MAX_BULK_WRITE: usize = 100;

/// Default hard cap on the in-memory write queue.
pub const DEFAULT_WRITE_QUEUE_CAPACITY: usize = 10_000;

/// Interval between persistence pipeline drain cycles.
pub const PERSISTENCE_POLL_INTERVAL_MS: u64 = 50;

/// AMQP port the broker listens on.
pub const BROKER_PORT: u16 = 5672;

/// AMQP vhost used for the connection.
pub const BROKER_VHOST: &str = "/";
