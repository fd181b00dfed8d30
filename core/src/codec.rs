//! The CIM-XML codec: typed CIM objects to request documents, response
//! documents back to typed CIM objects.
//!
//! # Design
//! Encoding and decoding are separate, side-effect-free passes over plain
//! data, mirroring the split between building a request and interpreting a
//! reply. The encoder is deterministic: parameters are written in the
//! order given, so a request body is byte-stable for a given input and
//! message id. The decoder is strict: any element DSP0201 does not place
//! where it was found is a `Parse` error with the element's position, and
//! a `DTDVERSION` outside the 2.x family is a `Version` error before
//! anything else is looked at.
//!
//! Response out-parameters (`<PARAMVALUE>`) are keyed by their `NAME`
//! attribute, never by position, so reordered parameters decode
//! identically.

use crate::error::{CimError, WbemError};
use crate::model::{
    CimClass, CimClassName, CimInstance, CimInstanceName, CimMethod, CimParameter, CimProperty,
    CimQualifier, CimQualifierDeclaration, EmbeddedObject, NameMap,
};
use crate::types::{CimScalar, CimType, CimValue};
use crate::xml::{parse_document, XmlElement, XmlWriter};

pub const CIM_VERSION: &str = "2.0";
pub const DTD_VERSION: &str = "2.0";
pub const PROTOCOL_VERSION: &str = "1.0";

const SCOPE_NAMES: [&str; 7] = [
    "CLASS",
    "ASSOCIATION",
    "REFERENCE",
    "PROPERTY",
    "METHOD",
    "PARAMETER",
    "INDICATION",
];

// ---------------------------------------------------------------------------
// Request encoding
// ---------------------------------------------------------------------------

/// One `<IPARAMVALUE>` payload. The variant picks the child element the
/// DTD prescribes for that parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamPayload {
    Boolean(bool),
    Uint32(u32),
    Str(String),
    StringArray(Vec<String>),
    ClassName(String),
    InstanceName(CimInstanceName),
    Instance(CimInstance),
    /// Instance plus its path, as `<VALUE.NAMEDINSTANCE>`.
    NamedInstance(CimInstance),
}

/// Target of an extrinsic method call.
#[derive(Debug, Clone, PartialEq)]
pub enum MethodTarget {
    Instance(CimInstanceName),
    Class(String),
}

/// Encode an intrinsic operation request. `namespace` must already be
/// normalized; parameters are emitted in the order given.
pub fn encode_imethod_request(
    method: &str,
    namespace: &str,
    params: &[(&'static str, ParamPayload)],
    message_id: u64,
) -> Result<String, WbemError> {
    let mut w = message_prologue(message_id)?;
    w.start("IMETHODCALL");
    w.attr("NAME", method)?;
    write_local_namespace_path(&mut w, namespace)?;
    for (name, payload) in params {
        w.start("IPARAMVALUE");
        w.attr("NAME", name)?;
        write_param_payload(&mut w, payload)?;
        w.end();
    }
    w.end(); // IMETHODCALL
    Ok(message_epilogue(w))
}

/// Encode an extrinsic method call against an instance or class path.
pub fn encode_method_request(
    method: &str,
    namespace: &str,
    target: &MethodTarget,
    params: &[(String, CimValue)],
    message_id: u64,
) -> Result<String, WbemError> {
    let mut w = message_prologue(message_id)?;
    w.start("METHODCALL");
    w.attr("NAME", method)?;
    match target {
        MethodTarget::Instance(path) => {
            w.start("LOCALINSTANCEPATH");
            write_local_namespace_path(&mut w, namespace)?;
            write_instance_name(&mut w, path)?;
            w.end();
        }
        MethodTarget::Class(classname) => {
            w.start("LOCALCLASSPATH");
            write_local_namespace_path(&mut w, namespace)?;
            w.start("CLASSNAME");
            w.attr("NAME", classname)?;
            w.end();
            w.end();
        }
    }
    for (name, value) in params {
        w.start("PARAMVALUE");
        w.attr("NAME", name)?;
        if let Some(ty) = value.cim_type() {
            w.attr("PARAMTYPE", ty.wire_name())?;
        }
        write_value(&mut w, value)?;
        w.end();
    }
    w.end(); // METHODCALL
    Ok(message_epilogue(w))
}

fn message_prologue(message_id: u64) -> Result<XmlWriter, WbemError> {
    let mut w = XmlWriter::new();
    w.start("CIM");
    w.attr("CIMVERSION", CIM_VERSION)?;
    w.attr("DTDVERSION", DTD_VERSION)?;
    w.start("MESSAGE");
    w.attr("ID", &message_id.to_string())?;
    w.attr("PROTOCOLVERSION", PROTOCOL_VERSION)?;
    w.start("SIMPLEREQ");
    Ok(w)
}

fn message_epilogue(mut w: XmlWriter) -> String {
    w.end(); // SIMPLEREQ
    w.end(); // MESSAGE
    w.end(); // CIM
    w.finish()
}

fn write_param_payload(w: &mut XmlWriter, payload: &ParamPayload) -> Result<(), WbemError> {
    match payload {
        ParamPayload::Boolean(b) => {
            w.text_element("VALUE", if *b { "TRUE" } else { "FALSE" })?;
        }
        ParamPayload::Uint32(v) => w.text_element("VALUE", &v.to_string())?,
        ParamPayload::Str(s) => w.text_element("VALUE", s)?,
        ParamPayload::StringArray(items) => {
            w.start("VALUE.ARRAY");
            for item in items {
                w.text_element("VALUE", item)?;
            }
            w.end();
        }
        ParamPayload::ClassName(name) => {
            w.start("CLASSNAME");
            w.attr("NAME", name)?;
            w.end();
        }
        ParamPayload::InstanceName(path) => write_instance_name(w, path)?,
        ParamPayload::Instance(inst) => write_instance(w, inst)?,
        ParamPayload::NamedInstance(inst) => {
            let path = inst.path().ok_or_else(|| {
                WbemError::model(format!(
                    "instance of {:?} has no path to name it by",
                    inst.classname
                ))
            })?;
            w.start("VALUE.NAMEDINSTANCE");
            write_instance_name(w, path)?;
            write_instance(w, inst)?;
            w.end();
        }
    }
    Ok(())
}

fn write_local_namespace_path(w: &mut XmlWriter, namespace: &str) -> Result<(), WbemError> {
    w.start("LOCALNAMESPACEPATH");
    for part in namespace.split('/') {
        w.start("NAMESPACE");
        w.attr("NAME", part)?;
        w.end();
    }
    w.end();
    Ok(())
}

fn write_instance_name(w: &mut XmlWriter, path: &CimInstanceName) -> Result<(), WbemError> {
    w.start("INSTANCENAME");
    w.attr("CLASSNAME", path.classname())?;
    for kb in path.keybindings() {
        w.start("KEYBINDING");
        w.attr("NAME", &kb.name)?;
        write_key_value(w, &kb.value)?;
        w.end();
    }
    w.end();
    Ok(())
}

/// Wire text of a scalar, or a `Model` error for references, which have
/// no text form.
fn text_of(scalar: &CimScalar) -> Result<String, WbemError> {
    scalar.wire_text().ok_or_else(|| {
        WbemError::model("a reference value cannot be written as element text")
    })
}

fn write_key_value(w: &mut XmlWriter, value: &CimScalar) -> Result<(), WbemError> {
    if let CimScalar::Reference(path) = value {
        return write_value_reference(w, path);
    }
    let value_type = match value.cim_type() {
        CimType::Boolean => "boolean",
        ty if ty.is_integer() || ty.is_real() => "numeric",
        _ => "string",
    };
    w.start("KEYVALUE");
    w.attr("VALUETYPE", value_type)?;
    w.attr("TYPE", value.cim_type().wire_name())?;
    w.text(&text_of(value)?)?;
    w.end();
    Ok(())
}

/// A reference value is written with as much path as it carries: full
/// `INSTANCEPATH` with a host, `LOCALINSTANCEPATH` with a namespace,
/// bare `INSTANCENAME` otherwise.
fn write_value_reference(w: &mut XmlWriter, path: &CimInstanceName) -> Result<(), WbemError> {
    w.start("VALUE.REFERENCE");
    match (path.host(), path.namespace()) {
        (Some(host), Some(namespace)) => {
            w.start("INSTANCEPATH");
            w.start("NAMESPACEPATH");
            w.text_element("HOST", host)?;
            write_local_namespace_path(w, namespace)?;
            w.end();
            write_instance_name(w, path)?;
            w.end();
        }
        (None, Some(namespace)) => {
            w.start("LOCALINSTANCEPATH");
            write_local_namespace_path(w, namespace)?;
            write_instance_name(w, path)?;
            w.end();
        }
        _ => write_instance_name(w, path)?,
    }
    w.end();
    Ok(())
}

fn write_instance(w: &mut XmlWriter, inst: &CimInstance) -> Result<(), WbemError> {
    w.start("INSTANCE");
    w.attr("CLASSNAME", &inst.classname)?;
    for q in &inst.qualifiers {
        write_qualifier(w, q)?;
    }
    for p in &inst.properties {
        write_property(w, p)?;
    }
    w.end();
    Ok(())
}

fn write_property(w: &mut XmlWriter, prop: &CimProperty) -> Result<(), WbemError> {
    if prop.cim_type == CimType::Reference {
        if prop.is_array {
            return Err(WbemError::model(format!(
                "property {:?}: reference arrays have no wire form",
                prop.name
            )));
        }
        w.start("PROPERTY.REFERENCE");
        w.attr("NAME", &prop.name)?;
        if let Some(rc) = &prop.reference_class {
            w.attr("REFERENCECLASS", rc)?;
        }
        write_property_meta(w, prop)?;
        for q in &prop.qualifiers {
            write_qualifier(w, q)?;
        }
        if let Some(CimValue::Scalar(CimScalar::Reference(path))) = &prop.value {
            write_value_reference(w, path)?;
        }
        w.end();
        return Ok(());
    }

    if prop.is_array {
        w.start("PROPERTY.ARRAY");
        w.attr("NAME", &prop.name)?;
        w.attr("TYPE", prop.cim_type.wire_name())?;
        if let Some(size) = prop.array_size {
            w.attr("ARRAYSIZE", &size.to_string())?;
        }
        write_property_meta(w, prop)?;
        for q in &prop.qualifiers {
            write_qualifier(w, q)?;
        }
        if let Some(CimValue::Array(items)) = &prop.value {
            w.start("VALUE.ARRAY");
            for item in items {
                w.text_element("VALUE", &text_of(item)?)?;
            }
            w.end();
        }
        w.end();
        return Ok(());
    }

    w.start("PROPERTY");
    w.attr("NAME", &prop.name)?;
    w.attr("TYPE", prop.cim_type.wire_name())?;
    write_property_meta(w, prop)?;
    for q in &prop.qualifiers {
        write_qualifier(w, q)?;
    }
    if let Some(CimValue::Scalar(s)) = &prop.value {
        w.text_element("VALUE", &text_of(s)?)?;
    }
    w.end();
    Ok(())
}

fn write_property_meta(w: &mut XmlWriter, prop: &CimProperty) -> Result<(), WbemError> {
    if let Some(origin) = &prop.class_origin {
        w.attr("CLASSORIGIN", origin)?;
    }
    if prop.propagated {
        w.attr("PROPAGATED", "true")?;
    }
    match prop.embedded_object {
        EmbeddedObject::None => {}
        EmbeddedObject::Instance => w.attr("EmbeddedObject", "instance")?,
        EmbeddedObject::Object => w.attr("EmbeddedObject", "object")?,
    }
    Ok(())
}

fn write_qualifier(w: &mut XmlWriter, q: &CimQualifier) -> Result<(), WbemError> {
    w.start("QUALIFIER");
    w.attr("NAME", &q.name)?;
    w.attr("TYPE", q.cim_type.wire_name())?;
    if q.propagated {
        w.attr("PROPAGATED", "true")?;
    }
    for (key, flag) in [
        ("OVERRIDABLE", q.overridable),
        ("TOSUBCLASS", q.tosubclass),
        ("TOINSTANCE", q.toinstance),
        ("TRANSLATABLE", q.translatable),
    ] {
        if let Some(v) = flag {
            w.attr(key, if v { "true" } else { "false" })?;
        }
    }
    match &q.value {
        Some(CimValue::Scalar(s)) => {
            w.text_element("VALUE", &text_of(s)?)?;
        }
        Some(CimValue::Array(items)) => {
            w.start("VALUE.ARRAY");
            for item in items {
                w.text_element("VALUE", &text_of(item)?)?;
            }
            w.end();
        }
        None => {}
    }
    w.end();
    Ok(())
}

fn write_value(w: &mut XmlWriter, value: &CimValue) -> Result<(), WbemError> {
    match value {
        CimValue::Scalar(CimScalar::Reference(path)) => write_value_reference(w, path),
        CimValue::Scalar(s) => {
            w.text_element("VALUE", &text_of(s)?)
        }
        CimValue::Array(items) => {
            if items
                .iter()
                .any(|i| matches!(i, CimScalar::Reference(_)))
            {
                w.start("VALUE.REFARRAY");
                for item in items {
                    match item {
                        CimScalar::Reference(path) => write_value_reference(w, path)?,
                        other => {
                            return Err(WbemError::model(format!(
                                "mixed reference/{} array cannot be encoded",
                                other.cim_type()
                            )))
                        }
                    }
                }
                w.end();
                Ok(())
            } else {
                w.start("VALUE.ARRAY");
                for item in items {
                    w.text_element("VALUE", &text_of(item)?)?;
                }
                w.end();
                Ok(())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Response decoding
// ---------------------------------------------------------------------------

/// One entry of an `<IRETURNVALUE>`.
#[derive(Debug, Clone, PartialEq)]
pub enum ReturnItem {
    /// `INSTANCE`, or any of the with-path wrappings; the path (when the
    /// wire carried one) is attached to the instance.
    Instance(CimInstance),
    InstancePath(CimInstanceName),
    Class(CimClass),
    ClassName(CimClassName),
    QualifierDeclaration(CimQualifierDeclaration),
    /// A bare `VALUE`/`VALUE.ARRAY`; untyped on the wire, carried as
    /// strings.
    Value(CimValue),
}

/// The decoded payload of a method response, before the operation layer
/// maps it to its typed result.
#[derive(Debug, Clone, PartialEq)]
pub struct CimResponse {
    pub method: String,
    pub message_id: Option<String>,
    pub items: Vec<ReturnItem>,
    pub return_value: Option<CimValue>,
    pub out_params: Vec<(String, CimValue)>,
}

impl CimResponse {
    /// Out-parameter lookup by name, case-insensitively.
    pub fn out_param(&self, name: &str) -> Option<&CimValue> {
        self.out_params
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }
}

/// Decode a CIM-XML response body. A server `<ERROR>` becomes
/// `WbemError::Cim`; everything structurally unexpected becomes
/// `WbemError::Parse` with the position of the offending element.
pub fn decode_response(body: &str) -> Result<CimResponse, WbemError> {
    let root = parse_document(body)?;
    if root.name != "CIM" {
        return Err(root.parse_error(format!("expected <CIM> root, got <{}>", root.name)));
    }
    let dtd = root
        .attr("DTDVERSION")
        .ok_or_else(|| root.parse_error("<CIM> lacks DTDVERSION"))?;
    if !dtd.starts_with("2.") {
        return Err(WbemError::Version(format!("DTDVERSION {dtd:?}")));
    }

    let message = single_child(&root, "MESSAGE")?;
    if let Some(pv) = message.attr("PROTOCOLVERSION") {
        if !pv.starts_with("1.") {
            return Err(WbemError::Version(format!("PROTOCOLVERSION {pv:?}")));
        }
    }
    let message_id = message.attr("ID").map(str::to_string);

    let simplersp = single_child(message, "SIMPLERSP")?;
    let response = {
        let mut it = simplersp.elements();
        let first = it
            .next()
            .ok_or_else(|| simplersp.parse_error("<SIMPLERSP> is empty"))?;
        if it.next().is_some() {
            return Err(simplersp.parse_error("<SIMPLERSP> holds more than one response"));
        }
        first
    };

    let method = response
        .attr("NAME")
        .ok_or_else(|| response.parse_error(format!("<{}> lacks NAME", response.name)))?
        .to_string();

    let mut items = Vec::new();
    let mut return_value = None;
    let mut out_params = Vec::new();

    match response.name.as_str() {
        "IMETHODRESPONSE" => {
            for child in response.elements() {
                match child.name.as_str() {
                    "ERROR" => return Err(WbemError::Cim(decode_error(child)?)),
                    "IRETURNVALUE" => {
                        for entry in child.elements() {
                            items.push(decode_return_item(entry)?);
                        }
                    }
                    "PARAMVALUE" => out_params.push(decode_param_value(child)?),
                    other => {
                        return Err(child.parse_error(format!(
                            "unexpected <{other}> in <IMETHODRESPONSE>"
                        )))
                    }
                }
            }
        }
        "METHODRESPONSE" => {
            for child in response.elements() {
                match child.name.as_str() {
                    "ERROR" => return Err(WbemError::Cim(decode_error(child)?)),
                    "RETURNVALUE" => {
                        return_value = Some(decode_typed_value(
                            child,
                            child.attr("PARAMTYPE"),
                        )?);
                    }
                    "PARAMVALUE" => out_params.push(decode_param_value(child)?),
                    other => {
                        return Err(child.parse_error(format!(
                            "unexpected <{other}> in <METHODRESPONSE>"
                        )))
                    }
                }
            }
        }
        other => {
            return Err(response.parse_error(format!("unexpected <{other}> in <SIMPLERSP>")))
        }
    }

    Ok(CimResponse {
        method,
        message_id,
        items,
        return_value,
        out_params,
    })
}

fn single_child<'a>(parent: &'a XmlElement, name: &str) -> Result<&'a XmlElement, WbemError> {
    let mut found = None;
    for child in parent.elements() {
        if child.name != name {
            return Err(child.parse_error(format!(
                "unexpected <{}> in <{}>",
                child.name, parent.name
            )));
        }
        if found.is_some() {
            return Err(child.parse_error(format!("more than one <{name}> in <{}>", parent.name)));
        }
        found = Some(child);
    }
    found.ok_or_else(|| parent.parse_error(format!("<{}> lacks <{name}>", parent.name)))
}

fn decode_error(el: &XmlElement) -> Result<CimError, WbemError> {
    let code_text = el
        .attr("CODE")
        .ok_or_else(|| el.parse_error("<ERROR> lacks CODE"))?;
    let code = code_text
        .parse::<u32>()
        .map_err(|_| el.parse_error(format!("invalid ERROR CODE {code_text:?}")))?;
    let description = el.attr("DESCRIPTION").unwrap_or_default().to_string();
    let mut instances = Vec::new();
    for child in el.elements() {
        if child.name != "INSTANCE" {
            return Err(child.parse_error(format!("unexpected <{}> in <ERROR>", child.name)));
        }
        instances.push(decode_instance(child)?);
    }
    Ok(CimError {
        code,
        description,
        instances,
    })
}

fn decode_return_item(el: &XmlElement) -> Result<ReturnItem, WbemError> {
    Ok(match el.name.as_str() {
        "INSTANCE" => ReturnItem::Instance(decode_instance(el)?),
        "VALUE.NAMEDINSTANCE" => {
            let name_el = expect_child(el, "INSTANCENAME")?;
            let inst_el = expect_child(el, "INSTANCE")?;
            let path = decode_instance_name(name_el)?;
            let mut inst = decode_instance(inst_el)?;
            inst.set_path(path).map_err(reshape(el))?;
            ReturnItem::Instance(inst)
        }
        "VALUE.INSTANCEWITHPATH" => {
            let path_el = expect_child(el, "INSTANCEPATH")?;
            let inst_el = expect_child(el, "INSTANCE")?;
            let path = decode_instance_path(path_el)?;
            let mut inst = decode_instance(inst_el)?;
            inst.set_path(path).map_err(reshape(el))?;
            ReturnItem::Instance(inst)
        }
        "VALUE.OBJECTWITHPATH" => {
            if let Some(path_el) = find_child(el, "INSTANCEPATH") {
                let inst_el = expect_child(el, "INSTANCE")?;
                let path = decode_instance_path(path_el)?;
                let mut inst = decode_instance(inst_el)?;
                inst.set_path(path).map_err(reshape(el))?;
                ReturnItem::Instance(inst)
            } else {
                let class_el = expect_child(el, "CLASS")?;
                ReturnItem::Class(decode_class(class_el)?)
            }
        }
        "VALUE.OBJECT" => {
            if let Some(inst_el) = find_child(el, "INSTANCE") {
                ReturnItem::Instance(decode_instance(inst_el)?)
            } else {
                let class_el = expect_child(el, "CLASS")?;
                ReturnItem::Class(decode_class(class_el)?)
            }
        }
        "INSTANCENAME" => ReturnItem::InstancePath(decode_instance_name(el)?),
        "INSTANCEPATH" => ReturnItem::InstancePath(decode_instance_path(el)?),
        "OBJECTPATH" => {
            let inner = expect_child(el, "INSTANCEPATH")?;
            ReturnItem::InstancePath(decode_instance_path(inner)?)
        }
        "CLASS" => ReturnItem::Class(decode_class(el)?),
        "CLASSNAME" => {
            let name = el
                .attr("NAME")
                .ok_or_else(|| el.parse_error("<CLASSNAME> lacks NAME"))?;
            ReturnItem::ClassName(CimClassName::new(name))
        }
        "QUALIFIER.DECLARATION" => {
            ReturnItem::QualifierDeclaration(decode_qualifier_declaration(el)?)
        }
        "VALUE" => ReturnItem::Value(CimValue::Scalar(CimScalar::String(el.text()))),
        "VALUE.ARRAY" => {
            let mut items = Vec::new();
            for v in el.elements() {
                if v.name != "VALUE" {
                    return Err(v.parse_error(format!("unexpected <{}> in <VALUE.ARRAY>", v.name)));
                }
                items.push(CimScalar::String(v.text()));
            }
            ReturnItem::Value(CimValue::Array(items))
        }
        other => return Err(el.parse_error(format!("unexpected <{other}> in <IRETURNVALUE>"))),
    })
}

fn expect_child<'a>(parent: &'a XmlElement, name: &str) -> Result<&'a XmlElement, WbemError> {
    find_child(parent, name)
        .ok_or_else(|| parent.parse_error(format!("<{}> lacks <{name}>", parent.name)))
}

fn find_child<'a>(parent: &'a XmlElement, name: &str) -> Option<&'a XmlElement> {
    parent.elements().find(|e| e.name == name)
}

fn reshape(el: &XmlElement) -> impl Fn(WbemError) -> WbemError + '_ {
    move |e| match e {
        WbemError::Model(msg) => el.parse_error(msg),
        other => other,
    }
}

fn attr_bool(el: &XmlElement, name: &str) -> Result<Option<bool>, WbemError> {
    match el.attr(name) {
        None => Ok(None),
        Some(v) if v.eq_ignore_ascii_case("true") => Ok(Some(true)),
        Some(v) if v.eq_ignore_ascii_case("false") => Ok(Some(false)),
        Some(v) => Err(el.parse_error(format!("invalid boolean attribute {name}={v:?}"))),
    }
}

fn attr_type(el: &XmlElement, name: &str) -> Result<CimType, WbemError> {
    let text = el
        .attr(name)
        .ok_or_else(|| el.parse_error(format!("<{}> lacks {name}", el.name)))?;
    CimType::from_wire_name(text)
        .ok_or_else(|| el.parse_error(format!("unknown CIM type {text:?}")))
}

fn scalar_from_text(el: &XmlElement, cim_type: CimType, text: &str) -> Result<CimScalar, WbemError> {
    CimScalar::parse(cim_type, text).map_err(|msg| el.parse_error(msg))
}

pub(crate) fn decode_instance(el: &XmlElement) -> Result<CimInstance, WbemError> {
    let classname = el
        .attr("CLASSNAME")
        .ok_or_else(|| el.parse_error("<INSTANCE> lacks CLASSNAME"))?;
    let mut inst = CimInstance::new(classname);
    for child in el.elements() {
        match child.name.as_str() {
            "QUALIFIER" => inst.qualifiers.insert(decode_qualifier(child)?),
            "PROPERTY" => inst.properties.insert(decode_property(child)?),
            "PROPERTY.ARRAY" => inst.properties.insert(decode_property_array(child)?),
            "PROPERTY.REFERENCE" => inst.properties.insert(decode_property_reference(child)?),
            other => {
                return Err(child.parse_error(format!("unexpected <{other}> in <INSTANCE>")))
            }
        }
    }
    Ok(inst)
}

fn decode_property(el: &XmlElement) -> Result<CimProperty, WbemError> {
    let name = required_attr(el, "NAME")?;
    let cim_type = attr_type(el, "TYPE")?;
    let embedded = decode_embedded_attr(el)?;
    let mut qualifiers = NameMap::new();
    let mut value = None;
    for child in el.elements() {
        match child.name.as_str() {
            "QUALIFIER" => qualifiers.insert(decode_qualifier(child)?),
            "VALUE" => {
                value = Some(CimValue::Scalar(scalar_from_text(
                    child,
                    cim_type,
                    &child.text(),
                )?));
            }
            other => {
                return Err(child.parse_error(format!("unexpected <{other}> in <PROPERTY>")))
            }
        }
    }
    CimProperty {
        name,
        value,
        cim_type,
        reference_class: None,
        embedded_object: embedded,
        is_array: false,
        array_size: None,
        propagated: attr_bool(el, "PROPAGATED")?.unwrap_or(false),
        class_origin: el.attr("CLASSORIGIN").map(str::to_string),
        qualifiers,
    }
    .validated()
    .map_err(reshape(el))
}

fn decode_property_array(el: &XmlElement) -> Result<CimProperty, WbemError> {
    let name = required_attr(el, "NAME")?;
    let cim_type = attr_type(el, "TYPE")?;
    let array_size = match el.attr("ARRAYSIZE") {
        Some(raw) => Some(
            raw.parse::<u32>()
                .map_err(|_| el.parse_error(format!("invalid ARRAYSIZE {raw:?}")))?,
        ),
        None => None,
    };
    let mut qualifiers = NameMap::new();
    let mut value = None;
    for child in el.elements() {
        match child.name.as_str() {
            "QUALIFIER" => qualifiers.insert(decode_qualifier(child)?),
            "VALUE.ARRAY" => {
                let mut items = Vec::new();
                for v in child.elements() {
                    if v.name != "VALUE" {
                        return Err(
                            v.parse_error(format!("unexpected <{}> in <VALUE.ARRAY>", v.name))
                        );
                    }
                    items.push(scalar_from_text(v, cim_type, &v.text())?);
                }
                value = Some(CimValue::Array(items));
            }
            other => {
                return Err(child.parse_error(format!("unexpected <{other}> in <PROPERTY.ARRAY>")))
            }
        }
    }
    CimProperty {
        name,
        value,
        cim_type,
        reference_class: None,
        embedded_object: decode_embedded_attr(el)?,
        is_array: true,
        array_size,
        propagated: attr_bool(el, "PROPAGATED")?.unwrap_or(false),
        class_origin: el.attr("CLASSORIGIN").map(str::to_string),
        qualifiers,
    }
    .validated()
    .map_err(reshape(el))
}

fn decode_property_reference(el: &XmlElement) -> Result<CimProperty, WbemError> {
    let name = required_attr(el, "NAME")?;
    let mut qualifiers = NameMap::new();
    let mut value = None;
    for child in el.elements() {
        match child.name.as_str() {
            "QUALIFIER" => qualifiers.insert(decode_qualifier(child)?),
            "VALUE.REFERENCE" => {
                let path = decode_value_reference(child)?;
                value = Some(CimValue::Scalar(CimScalar::Reference(Box::new(path))));
            }
            other => {
                return Err(
                    child.parse_error(format!("unexpected <{other}> in <PROPERTY.REFERENCE>"))
                )
            }
        }
    }
    CimProperty {
        name,
        value,
        cim_type: CimType::Reference,
        reference_class: el.attr("REFERENCECLASS").map(str::to_string),
        embedded_object: EmbeddedObject::None,
        is_array: false,
        array_size: None,
        propagated: attr_bool(el, "PROPAGATED")?.unwrap_or(false),
        class_origin: el.attr("CLASSORIGIN").map(str::to_string),
        qualifiers,
    }
    .validated()
    .map_err(reshape(el))
}

fn decode_embedded_attr(el: &XmlElement) -> Result<EmbeddedObject, WbemError> {
    let raw = el.attr("EmbeddedObject").or_else(|| el.attr("EMBEDDEDOBJECT"));
    Ok(match raw {
        None => EmbeddedObject::None,
        Some(v) if v.eq_ignore_ascii_case("instance") => EmbeddedObject::Instance,
        Some(v) if v.eq_ignore_ascii_case("object") => EmbeddedObject::Object,
        Some(v) => {
            return Err(el.parse_error(format!("invalid EmbeddedObject value {v:?}")));
        }
    })
}

fn decode_value_reference(el: &XmlElement) -> Result<CimInstanceName, WbemError> {
    let inner = {
        let mut it = el.elements();
        let first = it
            .next()
            .ok_or_else(|| el.parse_error("<VALUE.REFERENCE> is empty"))?;
        if it.next().is_some() {
            return Err(el.parse_error("<VALUE.REFERENCE> holds more than one path"));
        }
        first
    };
    match inner.name.as_str() {
        "INSTANCENAME" => decode_instance_name(inner),
        "LOCALINSTANCEPATH" => {
            let ns_el = expect_child(inner, "LOCALNAMESPACEPATH")?;
            let name_el = expect_child(inner, "INSTANCENAME")?;
            let mut path = decode_instance_name(name_el)?;
            let ns = decode_local_namespace_path(ns_el)?;
            path.set_namespace(&ns).map_err(reshape(inner))?;
            Ok(path)
        }
        "INSTANCEPATH" => decode_instance_path(inner),
        other => Err(inner.parse_error(format!("unexpected <{other}> in <VALUE.REFERENCE>"))),
    }
}

pub(crate) fn decode_instance_name(el: &XmlElement) -> Result<CimInstanceName, WbemError> {
    let classname = el
        .attr("CLASSNAME")
        .ok_or_else(|| el.parse_error("<INSTANCENAME> lacks CLASSNAME"))?;
    let mut path = CimInstanceName::new(classname);
    for child in el.elements() {
        match child.name.as_str() {
            "KEYBINDING" => {
                let name = required_attr(child, "NAME")?;
                let value = decode_keybinding_value(child)?;
                path.bind_key(&name, value);
            }
            // the DTD also allows a single unnamed key
            "KEYVALUE" => {
                let value = decode_key_value(child)?;
                path.bind_key("", value);
            }
            "VALUE.REFERENCE" => {
                let referenced = decode_value_reference(child)?;
                path.bind_key("", CimScalar::Reference(Box::new(referenced)));
            }
            other => {
                return Err(child.parse_error(format!("unexpected <{other}> in <INSTANCENAME>")))
            }
        }
    }
    Ok(path)
}

fn decode_keybinding_value(el: &XmlElement) -> Result<CimScalar, WbemError> {
    let inner = {
        let mut it = el.elements();
        let first = it
            .next()
            .ok_or_else(|| el.parse_error("<KEYBINDING> is empty"))?;
        if it.next().is_some() {
            return Err(el.parse_error("<KEYBINDING> holds more than one value"));
        }
        first
    };
    match inner.name.as_str() {
        "KEYVALUE" => decode_key_value(inner),
        "VALUE.REFERENCE" => Ok(CimScalar::Reference(Box::new(decode_value_reference(
            inner,
        )?))),
        other => Err(inner.parse_error(format!("unexpected <{other}> in <KEYBINDING>"))),
    }
}

fn decode_key_value(el: &XmlElement) -> Result<CimScalar, WbemError> {
    let text = el.text();
    if let Some(ty_name) = el.attr("TYPE") {
        let cim_type = CimType::from_wire_name(ty_name)
            .ok_or_else(|| el.parse_error(format!("unknown CIM type {ty_name:?}")))?;
        return scalar_from_text(el, cim_type, &text);
    }
    match el.attr("VALUETYPE").unwrap_or("string") {
        "string" => Ok(CimScalar::String(text)),
        "boolean" => scalar_from_text(el, CimType::Boolean, &text),
        "numeric" => {
            // without a TYPE attribute the width is unknown; widest fits
            if let Ok(v) = CimScalar::parse(CimType::Sint64, &text) {
                Ok(v)
            } else if let Ok(v) = CimScalar::parse(CimType::Uint64, &text) {
                Ok(v)
            } else {
                scalar_from_text(el, CimType::Real64, &text)
            }
        }
        other => Err(el.parse_error(format!("invalid VALUETYPE {other:?}"))),
    }
}

fn decode_instance_path(el: &XmlElement) -> Result<CimInstanceName, WbemError> {
    let ns_path = expect_child(el, "NAMESPACEPATH")?;
    let host = expect_child(ns_path, "HOST")?.text();
    let local = expect_child(ns_path, "LOCALNAMESPACEPATH")?;
    let namespace = decode_local_namespace_path(local)?;
    let name_el = expect_child(el, "INSTANCENAME")?;
    let mut path = decode_instance_name(name_el)?;
    path.set_namespace(&namespace).map_err(reshape(el))?;
    path.set_host(host.trim());
    Ok(path)
}

fn decode_local_namespace_path(el: &XmlElement) -> Result<String, WbemError> {
    let mut parts = Vec::new();
    for child in el.elements() {
        if child.name != "NAMESPACE" {
            return Err(child.parse_error(format!(
                "unexpected <{}> in <LOCALNAMESPACEPATH>",
                child.name
            )));
        }
        parts.push(required_attr(child, "NAME")?);
    }
    if parts.is_empty() {
        return Err(el.parse_error("<LOCALNAMESPACEPATH> holds no <NAMESPACE>"));
    }
    Ok(parts.join("/"))
}

fn decode_qualifier(el: &XmlElement) -> Result<CimQualifier, WbemError> {
    let name = required_attr(el, "NAME")?;
    let cim_type = attr_type(el, "TYPE")?;
    let mut value = None;
    for child in el.elements() {
        match child.name.as_str() {
            "VALUE" => {
                value = Some(CimValue::Scalar(scalar_from_text(
                    child,
                    cim_type,
                    &child.text(),
                )?))
            }
            "VALUE.ARRAY" => {
                let mut items = Vec::new();
                for v in child.elements() {
                    if v.name != "VALUE" {
                        return Err(
                            v.parse_error(format!("unexpected <{}> in <VALUE.ARRAY>", v.name))
                        );
                    }
                    items.push(scalar_from_text(v, cim_type, &v.text())?);
                }
                value = Some(CimValue::Array(items));
            }
            other => {
                return Err(child.parse_error(format!("unexpected <{other}> in <QUALIFIER>")))
            }
        }
    }
    Ok(CimQualifier {
        name,
        value,
        cim_type,
        propagated: attr_bool(el, "PROPAGATED")?.unwrap_or(false),
        overridable: attr_bool(el, "OVERRIDABLE")?,
        tosubclass: attr_bool(el, "TOSUBCLASS")?,
        toinstance: attr_bool(el, "TOINSTANCE")?,
        translatable: attr_bool(el, "TRANSLATABLE")?,
    })
}

fn decode_qualifier_declaration(el: &XmlElement) -> Result<CimQualifierDeclaration, WbemError> {
    let name = required_attr(el, "NAME")?;
    let cim_type = attr_type(el, "TYPE")?;
    let is_array = attr_bool(el, "ISARRAY")?.unwrap_or(false);
    let array_size = match el.attr("ARRAYSIZE") {
        Some(raw) => Some(
            raw.parse::<u32>()
                .map_err(|_| el.parse_error(format!("invalid ARRAYSIZE {raw:?}")))?,
        ),
        None => None,
    };
    let mut scopes = Vec::new();
    let mut value = None;
    for child in el.elements() {
        match child.name.as_str() {
            "SCOPE" => {
                for scope in SCOPE_NAMES {
                    if attr_bool(child, scope)?.unwrap_or(false) {
                        scopes.push(scope.to_string());
                    }
                }
            }
            "VALUE" => {
                value = Some(CimValue::Scalar(scalar_from_text(
                    child,
                    cim_type,
                    &child.text(),
                )?))
            }
            "VALUE.ARRAY" => {
                let mut items = Vec::new();
                for v in child.elements() {
                    if v.name != "VALUE" {
                        return Err(
                            v.parse_error(format!("unexpected <{}> in <VALUE.ARRAY>", v.name))
                        );
                    }
                    items.push(scalar_from_text(v, cim_type, &v.text())?);
                }
                value = Some(CimValue::Array(items));
            }
            other => {
                return Err(child.parse_error(format!(
                    "unexpected <{other}> in <QUALIFIER.DECLARATION>"
                )))
            }
        }
    }
    Ok(CimQualifierDeclaration {
        name,
        cim_type,
        value,
        is_array,
        array_size,
        scopes,
        overridable: attr_bool(el, "OVERRIDABLE")?,
        tosubclass: attr_bool(el, "TOSUBCLASS")?,
        toinstance: attr_bool(el, "TOINSTANCE")?,
        translatable: attr_bool(el, "TRANSLATABLE")?,
    })
}

pub(crate) fn decode_class(el: &XmlElement) -> Result<CimClass, WbemError> {
    let name = required_attr(el, "NAME")?;
    let mut class = CimClass::new(&name);
    class.superclass = el.attr("SUPERCLASS").map(str::to_string);
    for child in el.elements() {
        match child.name.as_str() {
            "QUALIFIER" => class.qualifiers.insert(decode_qualifier(child)?),
            "PROPERTY" => class.properties.insert(decode_property(child)?),
            "PROPERTY.ARRAY" => class.properties.insert(decode_property_array(child)?),
            "PROPERTY.REFERENCE" => class.properties.insert(decode_property_reference(child)?),
            "METHOD" => class.methods.insert(decode_method(child)?),
            other => return Err(child.parse_error(format!("unexpected <{other}> in <CLASS>"))),
        }
    }
    Ok(class)
}

fn decode_method(el: &XmlElement) -> Result<CimMethod, WbemError> {
    let name = required_attr(el, "NAME")?;
    let return_type = match el.attr("TYPE") {
        Some(t) => CimType::from_wire_name(t)
            .ok_or_else(|| el.parse_error(format!("unknown CIM type {t:?}")))?,
        None => CimType::String,
    };
    let mut method = CimMethod::new(&name, return_type);
    method.class_origin = el.attr("CLASSORIGIN").map(str::to_string);
    method.propagated = attr_bool(el, "PROPAGATED")?.unwrap_or(false);
    for child in el.elements() {
        match child.name.as_str() {
            "QUALIFIER" => method.qualifiers.insert(decode_qualifier(child)?),
            "PARAMETER" => {
                let mut p = CimParameter::new(&required_attr(child, "NAME")?, attr_type(child, "TYPE")?);
                p.qualifiers = decode_parameter_qualifiers(child)?;
                method.parameters.insert(p);
            }
            "PARAMETER.ARRAY" => {
                let mut p = CimParameter::new(&required_attr(child, "NAME")?, attr_type(child, "TYPE")?);
                p.is_array = true;
                p.array_size = match child.attr("ARRAYSIZE") {
                    Some(raw) => Some(raw.parse::<u32>().map_err(|_| {
                        child.parse_error(format!("invalid ARRAYSIZE {raw:?}"))
                    })?),
                    None => None,
                };
                p.qualifiers = decode_parameter_qualifiers(child)?;
                method.parameters.insert(p);
            }
            "PARAMETER.REFERENCE" => {
                let mut p =
                    CimParameter::new(&required_attr(child, "NAME")?, CimType::Reference);
                p.reference_class = child.attr("REFERENCECLASS").map(str::to_string);
                p.qualifiers = decode_parameter_qualifiers(child)?;
                method.parameters.insert(p);
            }
            "PARAMETER.REFARRAY" => {
                let mut p =
                    CimParameter::new(&required_attr(child, "NAME")?, CimType::Reference);
                p.is_array = true;
                p.reference_class = child.attr("REFERENCECLASS").map(str::to_string);
                p.qualifiers = decode_parameter_qualifiers(child)?;
                method.parameters.insert(p);
            }
            other => return Err(child.parse_error(format!("unexpected <{other}> in <METHOD>"))),
        }
    }
    Ok(method)
}

fn decode_parameter_qualifiers(el: &XmlElement) -> Result<NameMap<CimQualifier>, WbemError> {
    let mut qualifiers = NameMap::new();
    for child in el.elements() {
        if child.name != "QUALIFIER" {
            return Err(child.parse_error(format!(
                "unexpected <{}> in <{}>",
                child.name, el.name
            )));
        }
        qualifiers.insert(decode_qualifier(child)?);
    }
    Ok(qualifiers)
}

fn decode_param_value(el: &XmlElement) -> Result<(String, CimValue), WbemError> {
    let name = required_attr(el, "NAME")?;
    let value = decode_typed_value(el, el.attr("PARAMTYPE"))?;
    Ok((name, value))
}

/// Decode the value child of a `<PARAMVALUE>`/`<RETURNVALUE>`, typed by
/// the `PARAMTYPE` attribute when present and carried as string otherwise.
fn decode_typed_value(el: &XmlElement, param_type: Option<&str>) -> Result<CimValue, WbemError> {
    let cim_type = match param_type {
        Some(t) => Some(
            CimType::from_wire_name(t)
                .ok_or_else(|| el.parse_error(format!("unknown CIM type {t:?}")))?,
        ),
        None => None,
    };
    let inner = match el.elements().next() {
        Some(e) => e,
        // an absent value decodes as an empty string scalar
        None => return Ok(CimValue::Scalar(CimScalar::String(el.text()))),
    };
    match inner.name.as_str() {
        "VALUE" => {
            let text = inner.text();
            match cim_type {
                Some(t) => Ok(CimValue::Scalar(scalar_from_text(inner, t, &text)?)),
                None => Ok(CimValue::Scalar(CimScalar::String(text))),
            }
        }
        "VALUE.ARRAY" => {
            let mut items = Vec::new();
            for v in inner.elements() {
                if v.name != "VALUE" {
                    return Err(v.parse_error(format!("unexpected <{}> in <VALUE.ARRAY>", v.name)));
                }
                let text = v.text();
                items.push(match cim_type {
                    Some(t) => scalar_from_text(v, t, &text)?,
                    None => CimScalar::String(text),
                });
            }
            Ok(CimValue::Array(items))
        }
        "VALUE.REFERENCE" => Ok(CimValue::Scalar(CimScalar::Reference(Box::new(
            decode_value_reference(inner)?,
        )))),
        other => Err(inner.parse_error(format!("unexpected <{other}> in <{}>", el.name))),
    }
}

fn required_attr(el: &XmlElement, name: &str) -> Result<String, WbemError> {
    el.attr(name)
        .map(str::to_string)
        .ok_or_else(|| el.parse_error(format!("<{}> lacks {name}", el.name)))
}
