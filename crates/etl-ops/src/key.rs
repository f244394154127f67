use base64::Engine;
use etl_schema::TypedValue;

/// Renders a decoded join/dedup key as a stable string suitable for a KV
/// key segment. Each variant is tagged so a string key and a numeric key
/// that happen to render the same digits never collide.
pub fn encode_key(value: &TypedValue) -> String {
    match value {
        TypedValue::Bool(b) => format!("b:{b}"),
        TypedValue::Int64(n) => format!("i:{n}"),
        TypedValue::UInt64(n) => format!("u:{n}"),
        TypedValue::Float64(f) => format!("f:{f}"),
        TypedValue::String(s) => format!("s:{}", base64::engine::general_purpose::STANDARD.encode(s)),
        TypedValue::Bytes(b) => format!("x:{}", base64::engine::general_purpose::STANDARD.encode(b)),
    }
}
