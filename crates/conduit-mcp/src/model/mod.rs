//! Basic data types of the MCP wire protocol.
//!
//! `params` and `result` payloads are kept as opaque [`serde_json::Value`]
//! subtrees so that handlers can re-parse them with their own schemas. The
//! MCP `_meta` conventions (progress token, W3C trace context) are spliced in
//! and out by the session layer, see [`Meta`].

mod extensions;
mod meta;

use std::{borrow::Cow, fmt::Display, sync::Arc};

pub use extensions::Extensions;
pub use meta::Meta;
use serde::{Deserialize, Serialize, de};
use serde_json::Value;

pub type JsonObject = serde_json::Map<String, Value>;

/// MCP method names handled or emitted by this crate.
pub mod method {
    pub const INITIALIZE: &str = "initialize";
    pub const PING: &str = "ping";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
    pub const PROMPTS_LIST: &str = "prompts/list";
    pub const PROMPTS_GET: &str = "prompts/get";
    pub const RESOURCES_LIST: &str = "resources/list";
    pub const RESOURCES_READ: &str = "resources/read";
    pub const RESOURCES_SUBSCRIBE: &str = "resources/subscribe";
    pub const RESOURCES_UNSUBSCRIBE: &str = "resources/unsubscribe";
    pub const RESOURCES_TEMPLATES_LIST: &str = "resources/templates/list";
    pub const COMPLETION_COMPLETE: &str = "completion/complete";
    pub const LOGGING_SET_LEVEL: &str = "logging/setLevel";
    pub const NOTIFICATION_INITIALIZED: &str = "notifications/initialized";
    pub const NOTIFICATION_CANCELLED: &str = "notifications/cancelled";
    pub const NOTIFICATION_PROGRESS: &str = "notifications/progress";
}

/// The `jsonrpc` tag. Only `"2.0"` is accepted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JsonRpcVersion2_0;

impl Serialize for JsonRpcVersion2_0 {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str("2.0")
    }
}

impl<'de> Deserialize<'de> for JsonRpcVersion2_0 {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let version: Cow<'de, str> = Deserialize::deserialize(deserializer)?;
        if version != "2.0" {
            return Err(de::Error::custom(format!(
                "unsupported jsonrpc version: {version}"
            )));
        }
        Ok(JsonRpcVersion2_0)
    }
}

/// A JSON-RPC id or progress-token scalar.
///
/// Equality is type-exact: the string `"42"` and the number `42` are
/// different values.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NumberOrString {
    Number(i64),
    String(Arc<str>),
}

impl NumberOrString {
    pub fn into_json_value(self) -> Value {
        match self {
            NumberOrString::Number(n) => Value::from(n),
            NumberOrString::String(s) => Value::String(s.to_string()),
        }
    }
}

impl Display for NumberOrString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NumberOrString::Number(n) => Display::fmt(n, f),
            NumberOrString::String(s) => Display::fmt(s, f),
        }
    }
}

impl From<i64> for NumberOrString {
    fn from(value: i64) -> Self {
        NumberOrString::Number(value)
    }
}

impl From<&str> for NumberOrString {
    fn from(value: &str) -> Self {
        NumberOrString::String(value.into())
    }
}

impl From<String> for NumberOrString {
    fn from(value: String) -> Self {
        NumberOrString::String(value.into())
    }
}

impl Serialize for NumberOrString {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            NumberOrString::Number(n) => n.serialize(serializer),
            NumberOrString::String(s) => s.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for NumberOrString {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct NumberOrStringVisitor;
        impl de::Visitor<'_> for NumberOrStringVisitor {
            type Value = NumberOrString;
            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("an integer or a string")
            }
            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
                Ok(NumberOrString::Number(v))
            }
            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                i64::try_from(v)
                    .map(NumberOrString::Number)
                    .map_err(|_| E::custom("number out of range for a request id"))
            }
            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                Ok(NumberOrString::String(v.into()))
            }
        }
        deserializer.deserialize_any(NumberOrStringVisitor)
    }
}

pub type RequestId = NumberOrString;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProgressToken(pub NumberOrString);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: JsonRpcVersion2_0,
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: JsonRpcVersion2_0,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: JsonRpcVersion2_0,
    pub id: RequestId,
    pub result: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub jsonrpc: JsonRpcVersion2_0,
    pub id: RequestId,
    pub error: ErrorData,
}

/// One JSON-RPC 2.0 message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
    Error(JsonRpcError),
    Response(JsonRpcResponse),
}

impl JsonRpcMessage {
    pub fn request(id: RequestId, method: impl Into<String>, params: Option<Value>) -> Self {
        JsonRpcMessage::Request(JsonRpcRequest {
            jsonrpc: JsonRpcVersion2_0,
            id,
            method: method.into(),
            params,
        })
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        JsonRpcMessage::Notification(JsonRpcNotification {
            jsonrpc: JsonRpcVersion2_0,
            method: method.into(),
            params,
        })
    }

    pub fn response(id: RequestId, result: Value) -> Self {
        JsonRpcMessage::Response(JsonRpcResponse {
            jsonrpc: JsonRpcVersion2_0,
            id,
            result,
        })
    }

    pub fn error(id: RequestId, error: ErrorData) -> Self {
        JsonRpcMessage::Error(JsonRpcError {
            jsonrpc: JsonRpcVersion2_0,
            id,
            error,
        })
    }

    /// Stable label used in logs and telemetry.
    pub fn kind(&self) -> &'static str {
        match self {
            JsonRpcMessage::Request(_) => "request",
            JsonRpcMessage::Notification(_) => "notification",
            JsonRpcMessage::Response(_) => "response",
            JsonRpcMessage::Error(_) => "error",
        }
    }

    /// The correlation id, for messages that carry one.
    pub fn request_id(&self) -> Option<&RequestId> {
        match self {
            JsonRpcMessage::Request(r) => Some(&r.id),
            JsonRpcMessage::Response(r) => Some(&r.id),
            JsonRpcMessage::Error(e) => Some(&e.id),
            JsonRpcMessage::Notification(_) => None,
        }
    }

    pub fn into_request(self) -> Option<JsonRpcRequest> {
        match self {
            JsonRpcMessage::Request(r) => Some(r),
            _ => None,
        }
    }

    pub fn into_notification(self) -> Option<JsonRpcNotification> {
        match self {
            JsonRpcMessage::Notification(n) => Some(n),
            _ => None,
        }
    }
}

/// Standard and MCP-specific JSON-RPC error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorCode(pub i32);

impl ErrorCode {
    pub const PARSE_ERROR: Self = Self(-32700);
    pub const INVALID_REQUEST: Self = Self(-32600);
    pub const METHOD_NOT_FOUND: Self = Self(-32601);
    pub const INVALID_PARAMS: Self = Self(-32602);
    pub const INTERNAL_ERROR: Self = Self(-32603);
    pub const SERVER_ERROR: Self = Self(-32000);
    pub const SESSION_NOT_FOUND: Self = Self(-32001);
}

/// The `error` member of a JSON-RPC error message.
///
/// Message content is low-sensitivity by contract: handlers must not embed
/// secrets in it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorData {
    pub code: ErrorCode,
    pub message: Cow<'static, str>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorData {
    pub fn new(
        code: ErrorCode,
        message: impl Into<Cow<'static, str>>,
        data: Option<Value>,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            data,
        }
    }

    pub fn parse_error(message: impl Into<Cow<'static, str>>, data: Option<Value>) -> Self {
        Self::new(ErrorCode::PARSE_ERROR, message, data)
    }

    pub fn invalid_request(message: impl Into<Cow<'static, str>>, data: Option<Value>) -> Self {
        Self::new(ErrorCode::INVALID_REQUEST, message, data)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            ErrorCode::METHOD_NOT_FOUND,
            format!("method not found: {method}"),
            None,
        )
    }

    pub fn invalid_params(message: impl Into<Cow<'static, str>>, data: Option<Value>) -> Self {
        Self::new(ErrorCode::INVALID_PARAMS, message, data)
    }

    pub fn internal_error(message: impl Into<Cow<'static, str>>, data: Option<Value>) -> Self {
        Self::new(ErrorCode::INTERNAL_ERROR, message, data)
    }

    pub fn session_not_found() -> Self {
        Self::new(ErrorCode::SESSION_NOT_FOUND, "session not found", None)
    }
}

/// MCP protocol revision carried in the `initialize` handshake.
///
/// Unknown revisions round-trip as plain strings so a newer peer does not
/// break deserialization.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProtocolVersion(pub Cow<'static, str>);

impl ProtocolVersion {
    pub const V_2024_11_05: Self = Self(Cow::Borrowed("2024-11-05"));
    pub const V_2025_03_26: Self = Self(Cow::Borrowed("2025-03-26"));
    pub const V_2025_06_18: Self = Self(Cow::Borrowed("2025-06-18"));
    pub const LATEST: Self = Self::V_2025_06_18;

    pub const SUPPORTED: &'static [Self] =
        &[Self::V_2024_11_05, Self::V_2025_03_26, Self::V_2025_06_18];

    pub fn is_supported(&self) -> bool {
        Self::SUPPORTED.contains(self)
    }
}

impl Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::LATEST
    }
}

/// Name and version a peer announces about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Implementation {
    pub name: String,
    pub version: String,
}

impl Default for Implementation {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RootsCapability {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub list_changed: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientCapabilities {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experimental: Option<JsonObject>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roots: Option<RootsCapability>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sampling: Option<JsonObject>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptsCapability {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub list_changed: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourcesCapability {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscribe: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub list_changed: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolsCapability {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub list_changed: Option<bool>,
}

/// Capabilities a server declares during `initialize`. The endpoint
/// registers method handlers only for the declared subsets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerCapabilities {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experimental: Option<JsonObject>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<JsonObject>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completions: Option<JsonObject>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompts: Option<PromptsCapability>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourcesCapability>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<ToolsCapability>,
}

impl ServerCapabilities {
    pub fn builder() -> ServerCapabilitiesBuilder {
        ServerCapabilitiesBuilder::default()
    }
}

#[derive(Debug, Default)]
pub struct ServerCapabilitiesBuilder {
    capabilities: ServerCapabilities,
}

impl ServerCapabilitiesBuilder {
    pub fn enable_tools(mut self) -> Self {
        self.capabilities.tools = Some(ToolsCapability::default());
        self
    }

    pub fn enable_tools_with(mut self, tools: ToolsCapability) -> Self {
        self.capabilities.tools = Some(tools);
        self
    }

    pub fn enable_prompts(mut self) -> Self {
        self.capabilities.prompts = Some(PromptsCapability::default());
        self
    }

    pub fn enable_resources(mut self) -> Self {
        self.capabilities.resources = Some(ResourcesCapability::default());
        self
    }

    pub fn enable_resources_subscribe(mut self) -> Self {
        self.capabilities.resources = Some(ResourcesCapability {
            subscribe: Some(true),
            ..self.capabilities.resources.unwrap_or_default()
        });
        self
    }

    pub fn enable_completions(mut self) -> Self {
        self.capabilities.completions = Some(JsonObject::default());
        self
    }

    pub fn enable_logging(mut self) -> Self {
        self.capabilities.logging = Some(JsonObject::default());
        self
    }

    pub fn build(self) -> ServerCapabilities {
        self.capabilities
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeRequestParam {
    pub protocol_version: ProtocolVersion,
    #[serde(default)]
    pub capabilities: ClientCapabilities,
    pub client_info: Implementation,
}

impl Default for InitializeRequestParam {
    fn default() -> Self {
        Self {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ClientCapabilities::default(),
            client_info: Implementation::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: ProtocolVersion,
    #[serde(default)]
    pub capabilities: ServerCapabilities,
    pub server_info: Implementation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

impl Default for InitializeResult {
    fn default() -> Self {
        Self {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ServerCapabilities::default(),
            server_info: Implementation::default(),
            instructions: None,
        }
    }
}

pub type ClientInfo = InitializeRequestParam;
pub type ServerInfo = InitializeResult;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelledNotificationParam {
    pub request_id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressNotificationParam {
    pub progress_token: ProgressToken,
    #[serde(deserialize_with = "lenient::f64")]
    pub progress: f64,
    #[serde(
        default,
        deserialize_with = "lenient::option_f64",
        skip_serializing_if = "Option::is_none"
    )]
    pub total: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Numbers that may arrive as JSON strings.
mod lenient {
    use serde::{Deserialize, Deserializer, de};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Numberish {
        Number(f64),
        String(String),
    }

    fn resolve<E: de::Error>(value: Numberish) -> Result<f64, E> {
        match value {
            Numberish::Number(n) => Ok(n),
            Numberish::String(s) => s
                .parse::<f64>()
                .map_err(|_| E::custom(format!("not a number: {s:?}"))),
        }
    }

    pub fn f64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        resolve(Numberish::deserialize(deserializer)?)
    }

    pub fn option_f64<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<f64>, D::Error> {
        Option::<Numberish>::deserialize(deserializer)?
            .map(resolve)
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_request_id_equality_is_type_exact() {
        let number: RequestId = 42.into();
        let string: RequestId = "42".into();
        assert_ne!(number, string);
        assert_eq!(number, RequestId::Number(42));
        assert_eq!(string, RequestId::String("42".into()));
    }

    #[test]
    fn test_message_round_trip_request() {
        let message = JsonRpcMessage::request(
            1.into(),
            "tools/call",
            Some(json!({"name": "echo", "arguments": {"text": "hi"}})),
        );
        let encoded = serde_json::to_string(&message).unwrap();
        let decoded: JsonRpcMessage = serde_json::from_str(&encoded).unwrap();
        assert_eq!(message, decoded);
    }

    #[test]
    fn test_message_round_trip_all_variants() {
        let messages = [
            JsonRpcMessage::request("r-1".into(), "ping", None),
            JsonRpcMessage::notification("notifications/initialized", None),
            JsonRpcMessage::response(7.into(), json!({"ok": true})),
            JsonRpcMessage::error(
                8.into(),
                ErrorData::method_not_found("resources/write"),
            ),
        ];
        for message in messages {
            let encoded = serde_json::to_value(&message).unwrap();
            assert_eq!(encoded["jsonrpc"], "2.0");
            let decoded: JsonRpcMessage = serde_json::from_value(encoded).unwrap();
            assert_eq!(message, decoded);
        }
    }

    #[test]
    fn test_message_variant_discrimination() {
        let request: JsonRpcMessage =
            serde_json::from_value(json!({"jsonrpc": "2.0", "id": 1, "method": "ping"})).unwrap();
        assert!(matches!(request, JsonRpcMessage::Request(_)));

        let notification: JsonRpcMessage =
            serde_json::from_value(json!({"jsonrpc": "2.0", "method": "notifications/progress"}))
                .unwrap();
        assert!(matches!(notification, JsonRpcMessage::Notification(_)));

        let response: JsonRpcMessage =
            serde_json::from_value(json!({"jsonrpc": "2.0", "id": 1, "result": {}})).unwrap();
        assert!(matches!(response, JsonRpcMessage::Response(_)));

        let error: JsonRpcMessage = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": {"code": -32601, "message": "method not found"}
        }))
        .unwrap();
        assert!(matches!(error, JsonRpcMessage::Error(_)));
    }

    #[test]
    fn test_rejects_wrong_version() {
        let result = serde_json::from_value::<JsonRpcMessage>(
            json!({"jsonrpc": "1.0", "id": 1, "method": "ping"}),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_null_optionals_omitted_on_write() {
        let encoded =
            serde_json::to_value(JsonRpcMessage::request(1.into(), "ping", None)).unwrap();
        assert!(encoded.as_object().unwrap().get("params").is_none());

        let error = ErrorData::internal_error("boom", None);
        let encoded = serde_json::to_value(&error).unwrap();
        assert!(encoded.as_object().unwrap().get("data").is_none());
    }

    #[test]
    fn test_progress_reads_numbers_from_strings() {
        let param: ProgressNotificationParam = serde_json::from_value(json!({
            "progressToken": "op-1",
            "progress": "0.5",
            "total": "10",
        }))
        .unwrap();
        assert_eq!(param.progress, 0.5);
        assert_eq!(param.total, Some(10.0));
    }

    #[test]
    fn test_initialize_param_round_trip() {
        let param = InitializeRequestParam {
            protocol_version: ProtocolVersion::V_2025_03_26,
            capabilities: ClientCapabilities {
                roots: Some(RootsCapability {
                    list_changed: Some(true),
                }),
                ..Default::default()
            },
            client_info: Implementation {
                name: "test-client".into(),
                version: "1.0.0".into(),
            },
        };
        let encoded = serde_json::to_value(&param).unwrap();
        assert_eq!(encoded["protocolVersion"], "2025-03-26");
        assert_eq!(encoded["clientInfo"]["name"], "test-client");
        let decoded: InitializeRequestParam = serde_json::from_value(encoded).unwrap();
        assert_eq!(param, decoded);
    }

    #[test]
    fn test_protocol_version_support() {
        assert!(ProtocolVersion::V_2024_11_05.is_supported());
        assert!(!ProtocolVersion(Cow::Borrowed("1999-01-01")).is_supported());
    }

    #[test]
    fn test_capabilities_builder() {
        let capabilities = ServerCapabilities::builder()
            .enable_tools()
            .enable_resources_subscribe()
            .enable_logging()
            .build();
        assert!(capabilities.tools.is_some());
        assert_eq!(
            capabilities.resources.as_ref().unwrap().subscribe,
            Some(true)
        );
        assert!(capabilities.logging.is_some());
        assert!(capabilities.prompts.is_none());
    }
}
