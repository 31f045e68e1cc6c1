/// Protocol version advertised in registration payloads.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Size of one transport frame payload. Larger messages are chunked.
pub const FRAME_CHUNK_SIZE: usize = 1024;

/// Largest frame payload a peer may announce.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Largest reassembled message accepted from a peer.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Default TCP port an agent listens on.
pub const DEFAULT_AGENT_PORT: u16 = 9380;

/// How often an agent pushes node data unless the client asks otherwise.
pub const DEFAULT_UPDATE_FREQUENCY_MS: u64 = 3_000;

/// Poll interval of edge-triggered command dispatchers.
pub const DEFAULT_COMMAND_POLL_MS: u64 = 500;

/// Interval of low-frequency dispatchers (registration, configuration).
pub const DEFAULT_REFRESH_SECS: u64 = 3_600;

/// Interval of the agent's resource listing push.
pub const DEFAULT_RESOURCE_LIST_SECS: u64 = 30;
