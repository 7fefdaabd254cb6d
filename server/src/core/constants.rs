// =============================================================================
// Application Identity
// =============================================================================

/// Application name in title case (for display)
pub const APP_NAME: &str = "Parley";

/// Application name in lowercase (for paths and identifiers)
pub const APP_NAME_LOWER: &str = "parley";

// =============================================================================
// Configuration Files
// =============================================================================

/// Config file name
pub const CONFIG_FILE_NAME: &str = "parley.json";

/// Environment variable for config file path
pub const ENV_CONFIG: &str = "PARLEY_CONFIG";

// =============================================================================
// Environment Variables
// =============================================================================

/// Environment variable for log level/filter
pub const ENV_LOG: &str = "PARLEY_LOG";

/// Environment variable for server host
pub const ENV_HOST: &str = "PARLEY_HOST";

/// Environment variable for server port
pub const ENV_PORT: &str = "PARLEY_PORT";

/// Environment variable for the cluster node name of this process
pub const ENV_CLUSTER_SELF: &str = "PARLEY_CLUSTER_SELF";

/// Environment variable for the store backend
pub const ENV_STORE_BACKEND: &str = "PARLEY_STORE_BACKEND";

/// Orchestrators (Kubernetes) set this to the pod name; it overrides the
/// configured cluster node name when present.
pub const ENV_HOSTNAME: &str = "HOSTNAME";

// =============================================================================
// Server Defaults
// =============================================================================

/// Default server host
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default server port
pub const DEFAULT_PORT: u16 = 6060;

// =============================================================================
// Topic Queue Bounds
// =============================================================================

/// Join requests queued per topic
pub const TOPIC_REG_QUEUE_LEN: usize = 32;

/// Leave/eviction requests queued per topic
pub const TOPIC_UNREG_QUEUE_LEN: usize = 32;

/// Data/presence/info messages queued for fan-out per topic
pub const TOPIC_BROADCAST_QUEUE_LEN: usize = 256;

/// Meta requests queued per topic
pub const TOPIC_META_QUEUE_LEN: usize = 32;

/// Session updates queued per topic
pub const TOPIC_SUPD_QUEUE_LEN: usize = 32;

/// Exit requests queued per topic
pub const TOPIC_EXIT_QUEUE_LEN: usize = 1;

/// Cluster replies queued per proxy topic
pub const TOPIC_PROXY_QUEUE_LEN: usize = 256;

/// Hub control commands queued
pub const HUB_CMD_QUEUE_LEN: usize = 64;

/// Presence/offline routing messages queued at the hub
pub const HUB_ROUTE_QUEUE_LEN: usize = 4096;

// =============================================================================
// Topic Defaults
// =============================================================================

/// Seconds an idle master topic stays loaded with no attached sessions
pub const DEFAULT_IDLE_MASTER_TOPIC_TIMEOUT_SECS: u64 = 4;

/// Maximum number of subscribers per group topic
pub const DEFAULT_MAX_SUBSCRIBER_COUNT: usize = 256;

/// Maximum serialized message size in bytes
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 256 * 1024;

/// Maximum number of messages one `del.msg` call may affect
pub const DEFAULT_MAX_DELETE_COUNT: usize = 1024;

/// Outbound messages queued per client session
pub const DEFAULT_SESSION_QUEUE_LEN: usize = 128;

/// Milliseconds the `me` topic debounces user-agent announcements
pub const UA_TIMER_DELAY_MS: u64 = 5_000;

/// Milliseconds deferred presence notifications are coalesced before flush
pub const DEFERRED_NOTIFY_DELAY_MS: u64 = 500;

// =============================================================================
// Cluster Defaults
// =============================================================================

/// Virtual nodes per physical node on the consistent-hash ring
pub const RING_VNODES: usize = 100;

/// Default failover heartbeat interval in milliseconds
pub const DEFAULT_HEARTBEAT_MS: u64 = 1_000;

/// Heartbeats a follower may miss before it is considered down
pub const DEFAULT_NODE_FAIL_AFTER: u32 = 4;

/// Missed leader heartbeats before an election is called
pub const DEFAULT_VOTE_AFTER: u32 = 8;

/// Outbound cluster frames queued per peer connection
pub const CLUSTER_PEER_QUEUE_LEN: usize = 1024;

// =============================================================================
// Shutdown
// =============================================================================

/// Seconds to wait for background tasks during shutdown
pub const SHUTDOWN_TIMEOUT_SECS: u64 = 10;
