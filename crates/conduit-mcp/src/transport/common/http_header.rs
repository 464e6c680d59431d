pub const HEADER_SESSION_ID: &str = "Mcp-Session-Id";
pub const HEADER_X_ACCEL_BUFFERING: &str = "X-Accel-Buffering";

pub const JSON_MIME_TYPE: &str = "application/json";
pub const EVENT_STREAM_MIME_TYPE: &str = "text/event-stream";

pub const CACHE_CONTROL_NO_STORE: &str = "no-cache,no-store";
pub const CONTENT_ENCODING_IDENTITY: &str = "identity";
