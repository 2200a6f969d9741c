//! Meta message builder (component B).
//!
//! Every meta message is a `#[derive(Serialize)]` struct per message kind,
//! matching the teacher's typed-wire-struct idiom
//! (`tunnel::protocol::RequestMeta`/`ResponseMeta`) rather than hand-built
//! maps, and encoded to MessagePack bytes as a named map (field name ->
//! value) so the wire shape matches spec §4.B exactly. No crate in the
//! retrieval pack speaks MessagePack, so `rmp-serde` is used here as a
//! deliberate, documented substitution (see DESIGN.md) — everything else
//! about this module (typed construction through `serde`, one encode step
//! at the end) follows the same shape the teacher uses for its own wire
//! structs.

use bytes::Bytes;
use serde::Serialize;

use super::registry::{SignalDefinition, SignalType};

pub const STREAMING_VERSION: &str = "1.0.1";
/// Unit object constants for the time domain, resolved from the original
/// discovery/meta implementation.
const TIME_UNIT_DISPLAY_NAME: &str = "s";
const TIME_UNIT_ID: u64 = 5457219;
const TIME_UNIT_QUANTITY: &str = "time";

fn encode<T: Serialize>(value: &T) -> Bytes {
    Bytes::from(rmp_serde::to_vec_named(value).expect("meta message structs are always encodable"))
}

#[derive(Serialize)]
struct ApiVersionMsg {
    method: &'static str,
    params: ApiVersionParams,
}

#[derive(Serialize)]
struct ApiVersionParams {
    version: &'static str,
}

pub fn build_api_version() -> Bytes {
    encode(&ApiVersionMsg {
        method: "apiVersion",
        params: ApiVersionParams {
            version: STREAMING_VERSION,
        },
    })
}

pub struct JsonRpcHttpConfig<'a> {
    pub enabled: bool,
    pub http_method: &'a str,
    pub http_version: &'a str,
    pub http_path: &'a str,
}

#[derive(Serialize)]
struct InitMsg {
    method: &'static str,
    params: InitParams,
}

#[derive(Serialize)]
struct InitParams {
    #[serde(rename = "streamId")]
    stream_id: String,
    supported: EmptyMap,
    #[serde(rename = "commandInterfaces")]
    command_interfaces: CommandInterfaces,
}

/// `supported` is always the empty map in this build; modeled as its own
/// zero-field struct rather than `serde_json::Value` so the whole message
/// stays one typed tree.
#[derive(Serialize)]
struct EmptyMap {}

#[derive(Serialize)]
struct CommandInterfaces {
    #[serde(rename = "jsonrpc-http", skip_serializing_if = "Option::is_none")]
    jsonrpc_http: Option<JsonRpcHttpInterface>,
}

#[derive(Serialize)]
struct JsonRpcHttpInterface {
    /// The original config macro defines this as the literal string "http",
    /// not a numeric port; reproduced verbatim for wire compatibility.
    port: &'static str,
    #[serde(rename = "apiVersion")]
    api_version: u32,
    #[serde(rename = "httpMethod")]
    http_method: String,
    #[serde(rename = "httpVersion")]
    http_version: String,
    #[serde(rename = "httpPath")]
    http_path: String,
}

pub fn build_init(stream_id: &str, jsonrpc: &JsonRpcHttpConfig<'_>) -> Bytes {
    let command_interfaces = CommandInterfaces {
        jsonrpc_http: jsonrpc.enabled.then(|| JsonRpcHttpInterface {
            port: "http",
            api_version: 1,
            http_method: jsonrpc.http_method.to_string(),
            http_version: jsonrpc.http_version.to_string(),
            http_path: jsonrpc.http_path.to_string(),
        }),
    };

    encode(&InitMsg {
        method: "init",
        params: InitParams {
            stream_id: stream_id.to_string(),
            supported: EmptyMap {},
            command_interfaces,
        },
    })
}

#[derive(Serialize)]
struct AvailabilityMsg<'a> {
    method: &'a str,
    params: AvailabilityParams<'a>,
}

#[derive(Serialize)]
struct AvailabilityParams<'a> {
    #[serde(rename = "signalIds")]
    signal_ids: &'a [&'a str],
}

/// `available`/`unavailable` — `method` is the literal message name, `ids`
/// the signal names meeting that message's availability/subscription
/// filter (spec §4.B).
pub fn build_available_list(method: &str, ids: &[&str]) -> Bytes {
    encode(&AvailabilityMsg {
        method,
        params: AvailabilityParams { signal_ids: ids },
    })
}

#[derive(Serialize)]
struct SubscribeAckMsg<'a> {
    method: &'static str,
    params: SubscribeAckParams<'a>,
}

#[derive(Serialize)]
struct SubscribeAckParams<'a> {
    #[serde(rename = "signalId")]
    signal_id: &'a str,
}

pub fn build_subscribe_ack(signal_id: &str) -> Bytes {
    encode(&SubscribeAckMsg {
        method: "subscribe",
        params: SubscribeAckParams { signal_id },
    })
}

/// No `params` key at all, per spec §4.B — a distinct struct rather than an
/// `Option<()>` field, since the key must be entirely absent, not null.
#[derive(Serialize)]
struct UnsubscribeAckMsg {
    method: &'static str,
}

pub fn build_unsubscribe_ack() -> Bytes {
    encode(&UnsubscribeAckMsg {
        method: "unsubscribe",
    })
}

fn rule_wire_name(rule: super::packet::Rule) -> &'static str {
    match rule {
        super::packet::Rule::Explicit => "explicit",
        super::packet::Rule::Linear => "linear",
        super::packet::Rule::Constant => "constant",
    }
}

#[derive(Serialize)]
struct SignalMsg {
    method: &'static str,
    params: SignalParams,
}

#[derive(Serialize)]
struct SignalParams {
    #[serde(rename = "tableId")]
    table_id: Option<String>,
    #[serde(rename = "valueIndex", skip_serializing_if = "Option::is_none")]
    value_index: Option<u64>,
    #[serde(rename = "relatedSignals")]
    related_signals: Vec<RelatedSignal>,
    definition: SignalDefinitionWire,
}

#[derive(Serialize)]
struct RelatedSignal {
    #[serde(rename = "type")]
    type_: &'static str,
    #[serde(rename = "signalId")]
    signal_id: String,
}

#[derive(Serialize)]
struct LinearSpec {
    delta: u64,
}

#[derive(Serialize)]
struct ResolutionSpec {
    num: u32,
    denom: u64,
}

#[derive(Serialize)]
struct UnitSpec {
    #[serde(rename = "displayName")]
    display_name: &'static str,
    #[serde(rename = "unitId")]
    unit_id: u64,
    quantity: &'static str,
}

#[derive(Serialize)]
struct SignalDefinitionWire {
    name: String,
    rule: &'static str,
    #[serde(rename = "dataType")]
    data_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    linear: Option<LinearSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    resolution: Option<ResolutionSpec>,
    #[serde(rename = "absoluteReference", skip_serializing_if = "Option::is_none")]
    absolute_reference: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    unit: Option<UnitSpec>,
}

/// `signal` definition meta. `value_index` is only included when non-zero
/// (spec §4.B: "present iff non-zero").
pub fn build_signal_definition(
    table_id: Option<&str>,
    value_index: Option<u64>,
    related: &[(SignalType, String)],
    def: &SignalDefinition,
) -> Bytes {
    let related_signals = related
        .iter()
        .map(|(ty, id)| RelatedSignal {
            type_: ty.wire_name(),
            signal_id: id.clone(),
        })
        .collect();

    let linear = (def.rule == super::packet::Rule::Linear).then(|| LinearSpec { delta: def.delta });

    let (resolution, absolute_reference, unit) = match &def.time {
        Some(time) => (
            Some(ResolutionSpec {
                num: 1,
                denom: time.resolution_denom(),
            }),
            Some(time.absolute_reference.clone()),
            Some(UnitSpec {
                display_name: TIME_UNIT_DISPLAY_NAME,
                unit_id: TIME_UNIT_ID,
                quantity: TIME_UNIT_QUANTITY,
            }),
        ),
        None => (None, None, None),
    };

    let definition = SignalDefinitionWire {
        name: def.name.clone(),
        rule: rule_wire_name(def.rule),
        data_type: def.datatype.wire_name(),
        linear,
        resolution,
        absolute_reference,
        unit,
    };

    encode(&SignalMsg {
        method: "signal",
        params: SignalParams {
            table_id: table_id.map(String::from),
            value_index: value_index.filter(|vi| *vi != 0),
            related_signals,
            definition,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::packet::{DataType, Rule};
    use serde_json::Value;

    fn decode(bytes: &Bytes) -> Value {
        rmp_serde::from_slice(bytes).unwrap()
    }

    #[test]
    fn s1_api_version_message_shape() {
        let msg = decode(&build_api_version());
        assert_eq!(msg["method"], "apiVersion");
        assert_eq!(msg["params"]["version"], "1.0.1");
    }

    #[test]
    fn s1_init_message_uses_literal_http_port_string() {
        let cfg = JsonRpcHttpConfig {
            enabled: true,
            http_method: "POST",
            http_version: "1.1",
            http_path: "/streaming_jsonrpc",
        };
        let msg = decode(&build_init("deadbeef", &cfg));
        assert_eq!(msg["method"], "init");
        assert_eq!(msg["params"]["streamId"], "deadbeef");
        let iface = &msg["params"]["commandInterfaces"]["jsonrpc-http"];
        assert_eq!(iface["port"], "http");
        assert_eq!(iface["apiVersion"], 1);
        assert_eq!(iface["httpMethod"], "POST");
        assert_eq!(iface["httpPath"], "/streaming_jsonrpc");
    }

    #[test]
    fn init_without_config_channel_has_empty_command_interfaces() {
        let cfg = JsonRpcHttpConfig {
            enabled: false,
            http_method: "POST",
            http_version: "1.1",
            http_path: "/streaming_jsonrpc",
        };
        let msg = decode(&build_init("deadbeef", &cfg));
        assert_eq!(
            msg["params"]["commandInterfaces"],
            serde_json::json!({})
        );
    }

    #[test]
    fn s2_signal_definition_for_explicit_scalar_has_no_linear_or_time_fields() {
        let def = SignalDefinition::new("v1", Rule::Explicit, DataType::Int32, SignalType::Value);
        let msg = decode(&build_signal_definition(None, None, &[], &def));
        assert_eq!(msg["method"], "signal");
        assert_eq!(msg["params"]["definition"]["name"], "v1");
        assert_eq!(msg["params"]["definition"]["rule"], "explicit");
        assert_eq!(msg["params"]["definition"]["dataType"], "int32");
        assert!(msg["params"]["definition"].get("linear").is_none());
        assert!(msg["params"].get("valueIndex").is_none());
    }

    #[test]
    fn value_index_present_only_when_nonzero() {
        let def = SignalDefinition::new("v1", Rule::Linear, DataType::Int32, SignalType::Value);
        let with_index = decode(&build_signal_definition(None, Some(7), &[], &def));
        assert_eq!(with_index["params"]["valueIndex"], 7);

        let without = decode(&build_signal_definition(None, None, &[], &def));
        assert!(without["params"].get("valueIndex").is_none());
    }
}
