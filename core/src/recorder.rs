//! Recording and replay of operation round trips.
//!
//! # Design
//! A connection carries a set of [`OperationRecorder`]s that observe four
//! stages of every operation: the typed request, the HTTP request, the
//! HTTP reply, and the typed outcome. Recorders see values only; they can
//! never reach back into the request being sent.
//!
//! Replay is not a recorder but a [`Transport`]: `ReplayTransport` serves
//! queued canned responses and logs what was sent, so a test exercises the
//! complete operation layer with the real codec and no socket.
//!
//! CIM objects cross into vector files as tagged JSON trees: every object
//! carries a `cim_object` discriminator naming its kind, and every other
//! key is a field of that kind.

use std::collections::VecDeque;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};

use serde_json::{json, Map, Value};

use crate::codec::{CimResponse, ReturnItem};
use crate::error::WbemError;
use crate::http::{HttpRequest, HttpResponse};
use crate::model::{
    CimInstance, CimInstanceName, CimProperty, CimQualifier, EmbeddedObject, NameMap,
};
use crate::transport::Transport;
use crate::types::{CimScalar, CimType, CimValue};

/// The typed request as a recorder sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationCall {
    pub method: String,
    pub params: Value,
}

/// The typed outcome as a recorder sees it.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationOutcome {
    Result(Value),
    Error {
        kind: String,
        cim_status: Option<u32>,
        message: String,
    },
}

impl OperationOutcome {
    pub fn from_error(error: &WbemError) -> Self {
        let kind = match error {
            WbemError::Cim(_) => "cim",
            WbemError::Connection(_) => "connection",
            WbemError::Auth(_) => "auth",
            WbemError::Timeout(_) => "timeout",
            WbemError::Http { .. } => "http",
            WbemError::Parse { .. } => "parse",
            WbemError::Version(_) => "version",
            WbemError::Model(_) => "model",
        };
        let cim_status = match error {
            WbemError::Cim(e) => Some(e.code),
            _ => None,
        };
        OperationOutcome::Error {
            kind: kind.to_string(),
            cim_status,
            message: error.to_string(),
        }
    }
}

/// Observes the four stages of an operation. Hooks run synchronously on
/// the calling thread, in stage order.
pub trait OperationRecorder {
    fn staged_request(&mut self, call: &OperationCall);
    fn staged_http_request(&mut self, request: &HttpRequest);
    fn staged_http_reply(&mut self, reply: &HttpResponse);
    fn staged_reply(&mut self, outcome: &OperationOutcome);
}

/// Lets a caller keep a handle on a recorder that is boxed into a
/// connection: attach `Arc<Mutex<R>>` and read `R` back out afterwards.
impl<R: OperationRecorder> OperationRecorder for Arc<Mutex<R>> {
    fn staged_request(&mut self, call: &OperationCall) {
        self.lock().expect("recorder").staged_request(call);
    }

    fn staged_http_request(&mut self, request: &HttpRequest) {
        self.lock().expect("recorder").staged_http_request(request);
    }

    fn staged_http_reply(&mut self, reply: &HttpResponse) {
        self.lock().expect("recorder").staged_http_reply(reply);
    }

    fn staged_reply(&mut self, outcome: &OperationOutcome) {
        self.lock().expect("recorder").staged_reply(outcome);
    }
}

// ---------------------------------------------------------------------------
// Vector recorder
// ---------------------------------------------------------------------------

/// Captures each operation as one JSON case in the vector-file shape.
#[derive(Debug, Default)]
pub struct VectorRecorder {
    cases: Vec<Value>,
    pending: Map<String, Value>,
}

impl VectorRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cases(&self) -> &[Value] {
        &self.cases
    }

    pub fn to_json(&self) -> Value {
        json!({ "cases": self.cases })
    }

    pub fn write_to(&self, path: impl AsRef<Path>) -> io::Result<()> {
        let text = serde_json::to_string_pretty(&self.to_json())?;
        std::fs::write(path, text)
    }
}

impl OperationRecorder for VectorRecorder {
    fn staged_request(&mut self, call: &OperationCall) {
        self.pending = Map::new();
        let mut op = Map::new();
        op.insert("method".to_string(), Value::String(call.method.clone()));
        op.insert("params".to_string(), call.params.clone());
        self.pending.insert("operation".to_string(), Value::Object(op));
    }

    fn staged_http_request(&mut self, request: &HttpRequest) {
        if let Ok(v) = serde_json::to_value(request) {
            self.pending.insert("http_request".to_string(), v);
        }
    }

    fn staged_http_reply(&mut self, reply: &HttpResponse) {
        if let Ok(v) = serde_json::to_value(reply) {
            self.pending.insert("http_response".to_string(), v);
        }
    }

    fn staged_reply(&mut self, outcome: &OperationOutcome) {
        let reply = match outcome {
            OperationOutcome::Result(v) => json!({ "result": v }),
            OperationOutcome::Error {
                kind,
                cim_status,
                message,
            } => json!({
                "error": { "kind": kind, "cim_status": cim_status, "message": message }
            }),
        };
        self.pending.insert("reply".to_string(), reply);
        self.cases.push(Value::Object(std::mem::take(&mut self.pending)));
    }
}

// ---------------------------------------------------------------------------
// Replay transport
// ---------------------------------------------------------------------------

/// Serves queued responses instead of reaching the network, logging every
/// request it was handed.
#[derive(Debug, Default)]
pub struct ReplayTransport {
    replies: VecDeque<HttpResponse>,
    log: Arc<Mutex<Vec<HttpRequest>>>,
}

impl ReplayTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_reply(&mut self, reply: HttpResponse) {
        self.replies.push_back(reply);
    }

    /// A shared handle onto the request log, usable after the transport is
    /// boxed into a connection.
    pub fn request_log(&self) -> Arc<Mutex<Vec<HttpRequest>>> {
        Arc::clone(&self.log)
    }
}

impl Transport for ReplayTransport {
    fn execute(&mut self, request: &HttpRequest) -> Result<HttpResponse, WbemError> {
        self.log.lock().expect("request log").push(request.clone());
        self.replies.pop_front().ok_or_else(|| {
            WbemError::Connection("replay transport has no queued reply".to_string())
        })
    }
}

// ---------------------------------------------------------------------------
// Tagged JSON conversions
// ---------------------------------------------------------------------------

fn vector_err(message: impl Into<String>) -> WbemError {
    WbemError::Model(format!("vector: {}", message.into()))
}

pub fn scalar_to_json(scalar: &CimScalar) -> Value {
    match scalar {
        CimScalar::Boolean(b) => json!(b),
        CimScalar::String(s) => json!(s),
        CimScalar::Char16(c) => json!(c.to_string()),
        CimScalar::Uint8(v) => json!(v),
        CimScalar::Uint16(v) => json!(v),
        CimScalar::Uint32(v) => json!(v),
        CimScalar::Uint64(v) => json!(v),
        CimScalar::Sint8(v) => json!(v),
        CimScalar::Sint16(v) => json!(v),
        CimScalar::Sint32(v) => json!(v),
        CimScalar::Sint64(v) => json!(v),
        // JSON has no NaN/Inf; reals travel as their wire text
        CimScalar::Real32(_) | CimScalar::Real64(_) => {
            json!(scalar.wire_text().expect("real has text"))
        }
        CimScalar::DateTime(dt) => json!(dt.to_string()),
        CimScalar::Reference(path) => instance_name_to_json(path),
    }
}

pub fn value_to_json(value: &CimValue) -> Value {
    match value {
        CimValue::Scalar(s) => scalar_to_json(s),
        CimValue::Array(items) => Value::Array(items.iter().map(scalar_to_json).collect()),
    }
}

/// Re-type a JSON leaf into a scalar. With no declared type the JSON kind
/// decides: strings stay strings, booleans stay booleans, and integers
/// take the widest signed form, matching how untyped key values decode
/// off the wire.
pub fn scalar_from_json(cim_type: Option<CimType>, value: &Value) -> Result<CimScalar, WbemError> {
    if let Some(ty) = cim_type {
        return match (ty, value) {
            (CimType::Reference, Value::Object(_)) => Ok(CimScalar::Reference(Box::new(
                instance_name_from_json(value)?,
            ))),
            (_, Value::String(s)) => {
                CimScalar::parse(ty, s).map_err(vector_err)
            }
            (_, Value::Bool(b)) if ty == CimType::Boolean => Ok(CimScalar::Boolean(*b)),
            (_, Value::Number(_)) => {
                let text = value.to_string();
                CimScalar::parse(ty, &text).map_err(vector_err)
            }
            _ => Err(vector_err(format!("cannot type {value} as {ty}"))),
        };
    }
    match value {
        Value::String(s) => Ok(CimScalar::String(s.clone())),
        Value::Bool(b) => Ok(CimScalar::Boolean(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(CimScalar::Sint64(i))
            } else if let Some(u) = n.as_u64() {
                Ok(CimScalar::Uint64(u))
            } else {
                Ok(CimScalar::Real64(n.as_f64().unwrap_or(f64::NAN)))
            }
        }
        Value::Object(_) => Ok(CimScalar::Reference(Box::new(instance_name_from_json(
            value,
        )?))),
        other => Err(vector_err(format!("cannot read scalar from {other}"))),
    }
}

pub fn instance_name_to_json(path: &CimInstanceName) -> Value {
    let mut keys = Vec::new();
    for kb in path.keybindings() {
        keys.push(json!({ "name": kb.name, "value": scalar_to_json(&kb.value) }));
    }
    let mut obj = Map::new();
    obj.insert("cim_object".to_string(), json!("CIMInstanceName"));
    obj.insert("classname".to_string(), json!(path.classname()));
    obj.insert("keybindings".to_string(), Value::Array(keys));
    if let Some(ns) = path.namespace() {
        obj.insert("namespace".to_string(), json!(ns));
    }
    if let Some(host) = path.host() {
        obj.insert("host".to_string(), json!(host));
    }
    Value::Object(obj)
}

pub fn instance_name_from_json(value: &Value) -> Result<CimInstanceName, WbemError> {
    let obj = tagged(value, "CIMInstanceName")?;
    let classname = str_field(obj, "classname")?;
    let mut path = CimInstanceName::new(&classname);
    if let Some(keys) = obj.get("keybindings") {
        let keys = keys
            .as_array()
            .ok_or_else(|| vector_err("keybindings must be an array"))?;
        for entry in keys {
            let entry = entry
                .as_object()
                .ok_or_else(|| vector_err("keybinding must be an object"))?;
            let name = entry
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| vector_err("keybinding lacks name"))?;
            let raw = entry
                .get("value")
                .ok_or_else(|| vector_err("keybinding lacks value"))?;
            path.bind_key(name, scalar_from_json(None, raw)?);
        }
    }
    if let Some(ns) = obj.get("namespace").and_then(Value::as_str) {
        path.set_namespace(ns)?;
    }
    if let Some(host) = obj.get("host").and_then(Value::as_str) {
        path.set_host(host);
    }
    Ok(path)
}

pub fn property_to_json(prop: &CimProperty) -> Value {
    let mut obj = Map::new();
    obj.insert("cim_object".to_string(), json!("CIMProperty"));
    obj.insert("name".to_string(), json!(prop.name));
    obj.insert("type".to_string(), json!(prop.cim_type.wire_name()));
    obj.insert(
        "value".to_string(),
        prop.value.as_ref().map(value_to_json).unwrap_or(Value::Null),
    );
    if prop.is_array {
        obj.insert("is_array".to_string(), json!(true));
    }
    if let Some(size) = prop.array_size {
        obj.insert("array_size".to_string(), json!(size));
    }
    if let Some(rc) = &prop.reference_class {
        obj.insert("reference_class".to_string(), json!(rc));
    }
    match prop.embedded_object {
        EmbeddedObject::None => {}
        EmbeddedObject::Instance => {
            obj.insert("embedded_object".to_string(), json!("instance"));
        }
        EmbeddedObject::Object => {
            obj.insert("embedded_object".to_string(), json!("object"));
        }
    }
    if prop.propagated {
        obj.insert("propagated".to_string(), json!(true));
    }
    if let Some(origin) = &prop.class_origin {
        obj.insert("class_origin".to_string(), json!(origin));
    }
    if !prop.qualifiers.is_empty() {
        obj.insert(
            "qualifiers".to_string(),
            Value::Array(prop.qualifiers.iter().map(qualifier_to_json).collect()),
        );
    }
    Value::Object(obj)
}

pub fn property_from_json(value: &Value) -> Result<CimProperty, WbemError> {
    let obj = tagged(value, "CIMProperty")?;
    let name = str_field(obj, "name")?;
    let type_name = str_field(obj, "type")?;
    let cim_type = CimType::from_wire_name(&type_name)
        .ok_or_else(|| vector_err(format!("unknown CIM type {type_name:?}")))?;
    let is_array = obj
        .get("is_array")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let raw = obj.get("value").unwrap_or(&Value::Null);
    let value = match raw {
        Value::Null => None,
        Value::Array(items) => Some(CimValue::Array(
            items
                .iter()
                .map(|i| scalar_from_json(Some(cim_type), i))
                .collect::<Result<Vec<_>, _>>()?,
        )),
        other => Some(CimValue::Scalar(scalar_from_json(Some(cim_type), other)?)),
    };
    let embedded_object = match obj.get("embedded_object").and_then(Value::as_str) {
        None => EmbeddedObject::None,
        Some("instance") => EmbeddedObject::Instance,
        Some("object") => EmbeddedObject::Object,
        Some(other) => return Err(vector_err(format!("invalid embedded_object {other:?}"))),
    };
    let mut qualifiers = NameMap::new();
    if let Some(Value::Array(items)) = obj.get("qualifiers") {
        for item in items {
            qualifiers.insert(qualifier_from_json(item)?);
        }
    }
    CimProperty {
        name,
        value,
        cim_type,
        reference_class: obj
            .get("reference_class")
            .and_then(Value::as_str)
            .map(str::to_string),
        embedded_object,
        is_array: is_array || matches!(raw, Value::Array(_)),
        array_size: obj
            .get("array_size")
            .and_then(Value::as_u64)
            .map(|v| v as u32),
        propagated: obj
            .get("propagated")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        class_origin: obj
            .get("class_origin")
            .and_then(Value::as_str)
            .map(str::to_string),
        qualifiers,
    }
    .validated()
}

fn qualifier_to_json(q: &CimQualifier) -> Value {
    let mut obj = Map::new();
    obj.insert("cim_object".to_string(), json!("CIMQualifier"));
    obj.insert("name".to_string(), json!(q.name));
    obj.insert("type".to_string(), json!(q.cim_type.wire_name()));
    obj.insert(
        "value".to_string(),
        q.value.as_ref().map(value_to_json).unwrap_or(Value::Null),
    );
    if q.propagated {
        obj.insert("propagated".to_string(), json!(true));
    }
    Value::Object(obj)
}

fn qualifier_from_json(value: &Value) -> Result<CimQualifier, WbemError> {
    let obj = tagged(value, "CIMQualifier")?;
    let name = str_field(obj, "name")?;
    let type_name = str_field(obj, "type")?;
    let cim_type = CimType::from_wire_name(&type_name)
        .ok_or_else(|| vector_err(format!("unknown CIM type {type_name:?}")))?;
    let raw = obj.get("value").unwrap_or(&Value::Null);
    let value = match raw {
        Value::Null => None,
        Value::Array(items) => Some(CimValue::Array(
            items
                .iter()
                .map(|i| scalar_from_json(Some(cim_type), i))
                .collect::<Result<Vec<_>, _>>()?,
        )),
        other => Some(CimValue::Scalar(scalar_from_json(Some(cim_type), other)?)),
    };
    Ok(CimQualifier {
        name,
        value,
        cim_type,
        propagated: obj
            .get("propagated")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        overridable: None,
        tosubclass: None,
        toinstance: None,
        translatable: None,
    })
}

pub fn instance_to_json(inst: &CimInstance) -> Value {
    let mut obj = Map::new();
    obj.insert("cim_object".to_string(), json!("CIMInstance"));
    obj.insert("classname".to_string(), json!(inst.classname));
    obj.insert(
        "properties".to_string(),
        Value::Array(inst.properties.iter().map(property_to_json).collect()),
    );
    if !inst.qualifiers.is_empty() {
        obj.insert(
            "qualifiers".to_string(),
            Value::Array(inst.qualifiers.iter().map(qualifier_to_json).collect()),
        );
    }
    if let Some(path) = inst.path() {
        obj.insert("path".to_string(), instance_name_to_json(path));
    }
    Value::Object(obj)
}

pub fn instance_from_json(value: &Value) -> Result<CimInstance, WbemError> {
    let obj = tagged(value, "CIMInstance")?;
    let classname = str_field(obj, "classname")?;
    let mut inst = CimInstance::new(&classname);
    if let Some(Value::Array(items)) = obj.get("properties") {
        for item in items {
            inst.properties.insert(property_from_json(item)?);
        }
    }
    if let Some(Value::Array(items)) = obj.get("qualifiers") {
        for item in items {
            inst.qualifiers.insert(qualifier_from_json(item)?);
        }
    }
    if let Some(path) = obj.get("path") {
        inst.set_path(instance_name_from_json(path)?)?;
    }
    Ok(inst)
}

/// JSON view of a decoded response, used for `staged_reply`.
pub fn response_to_json(response: &CimResponse) -> Value {
    let items: Vec<Value> = response
        .items
        .iter()
        .map(|item| match item {
            ReturnItem::Instance(inst) => instance_to_json(inst),
            ReturnItem::InstancePath(path) => instance_name_to_json(path),
            ReturnItem::Class(class) => json!({
                "cim_object": "CIMClass",
                "classname": class.classname,
            }),
            ReturnItem::ClassName(name) => json!({
                "cim_object": "CIMClassName",
                "classname": name.classname,
            }),
            ReturnItem::QualifierDeclaration(decl) => json!({
                "cim_object": "CIMQualifierDeclaration",
                "name": decl.name,
            }),
            ReturnItem::Value(v) => value_to_json(v),
        })
        .collect();
    let mut obj = Map::new();
    obj.insert("method".to_string(), json!(response.method));
    obj.insert("items".to_string(), Value::Array(items));
    if let Some(rv) = &response.return_value {
        obj.insert("return_value".to_string(), value_to_json(rv));
    }
    if !response.out_params.is_empty() {
        let params: Map<String, Value> = response
            .out_params
            .iter()
            .map(|(k, v)| (k.clone(), value_to_json(v)))
            .collect();
        obj.insert("out_params".to_string(), Value::Object(params));
    }
    Value::Object(obj)
}

fn tagged<'a>(value: &'a Value, kind: &str) -> Result<&'a Map<String, Value>, WbemError> {
    let obj = value
        .as_object()
        .ok_or_else(|| vector_err(format!("expected a {kind} object")))?;
    match obj.get("cim_object").and_then(Value::as_str) {
        Some(tag) if tag == kind => Ok(obj),
        Some(other) => Err(vector_err(format!("expected {kind}, found {other}"))),
        None => Err(vector_err(format!("object lacks cim_object tag ({kind})"))),
    }
}

fn str_field(obj: &Map<String, Value>, name: &str) -> Result<String, WbemError> {
    obj.get(name)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| vector_err(format!("missing string field {name:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_instance() -> CimInstance {
        let mut inst = CimInstance::new("Mock_Person");
        inst.properties.insert(CimProperty::string("Name", "Fritz"));
        inst.properties.insert(
            CimProperty::new("Age", CimType::Uint8, Some(CimScalar::Uint8(42))).unwrap(),
        );
        let mut path = CimInstanceName::with_keys(
            "Mock_Person",
            &[("Name", CimScalar::String("Fritz".to_string()))],
        );
        path.set_namespace("root/cimv2").unwrap();
        inst.set_path(path).unwrap();
        inst
    }

    #[test]
    fn instance_json_roundtrip() {
        let inst = sample_instance();
        let back = instance_from_json(&instance_to_json(&inst)).unwrap();
        assert_eq!(back, inst);
    }

    #[test]
    fn instance_name_json_roundtrip_with_reference_key() {
        let inner = CimInstanceName::with_keys("Mock_Disk", &[("Id", CimScalar::Sint64(7))]);
        let mut outer = CimInstanceName::new("Mock_Mount");
        outer.bind_key("Antecedent", CimScalar::Reference(Box::new(inner)));
        let back = instance_name_from_json(&instance_name_to_json(&outer)).unwrap();
        assert_eq!(back, outer);
    }

    #[test]
    fn tag_mismatch_is_rejected() {
        let v = json!({ "cim_object": "CIMInstance", "classname": "X", "properties": [] });
        assert!(instance_name_from_json(&v).is_err());
        assert!(instance_from_json(&v).is_ok());
    }

    #[test]
    fn reals_travel_as_wire_text() {
        let v = scalar_to_json(&CimScalar::Real64(f64::NAN));
        assert_eq!(v, json!("NAN"));
        let back = scalar_from_json(Some(CimType::Real64), &v).unwrap();
        assert_eq!(back, CimScalar::Real64(f64::NAN));
    }

    #[test]
    fn replay_transport_serves_in_order_and_logs() {
        let mut transport = ReplayTransport::new();
        transport.push_reply(HttpResponse {
            status: 200,
            headers: Vec::new(),
            body: "one".to_string(),
        });
        let log = transport.request_log();
        let request = HttpRequest {
            url: "http://h/cimom".to_string(),
            headers: Vec::new(),
            body: "b".to_string(),
            idempotent: true,
        };
        let reply = transport.execute(&request).unwrap();
        assert_eq!(reply.body, "one");
        assert_eq!(log.lock().unwrap().len(), 1);
        // queue exhausted
        assert!(matches!(
            transport.execute(&request),
            Err(WbemError::Connection(_))
        ));
    }

    #[test]
    fn vector_recorder_assembles_cases() {
        let mut recorder = VectorRecorder::new();
        recorder.staged_request(&OperationCall {
            method: "GetInstance".to_string(),
            params: json!({ "LocalOnly": false }),
        });
        recorder.staged_http_request(&HttpRequest {
            url: "http://h/cimom".to_string(),
            headers: Vec::new(),
            body: "<xml/>".to_string(),
            idempotent: true,
        });
        recorder.staged_http_reply(&HttpResponse {
            status: 200,
            headers: Vec::new(),
            body: "<xml/>".to_string(),
        });
        recorder.staged_reply(&OperationOutcome::Result(json!({ "items": [] })));

        assert_eq!(recorder.cases().len(), 1);
        let case = &recorder.cases()[0];
        assert_eq!(case["operation"]["method"], "GetInstance");
        assert_eq!(case["http_request"]["url"], "http://h/cimom");
        assert_eq!(case["http_response"]["status"], 200);
        assert!(case["reply"]["result"].is_object());
    }

    #[test]
    fn error_outcomes_carry_cim_status() {
        let err = WbemError::Cim(crate::error::CimError::new(2, "denied"));
        match OperationOutcome::from_error(&err) {
            OperationOutcome::Error {
                kind, cim_status, ..
            } => {
                assert_eq!(kind, "cim");
                assert_eq!(cim_status, Some(2));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
