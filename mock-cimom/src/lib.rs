//! A mock WBEM server for client tests.
//!
//! Speaks just enough CIM-XML over POST `/cimom` to exercise every client
//! operation family: instance CRUD on a small seeded store of
//! `Mock_Person` instances, plus the pull-enumeration session flow with
//! server-minted contexts. Request bodies are interpreted by scanning,
//! not by a full parser; the client under test is the side whose codec
//! matters.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::{net::TcpListener, sync::RwLock};
use uuid::Uuid;

const NAMESPACE: &str = "root/cimv2";
const CLASSNAME: &str = "Mock_Person";

#[derive(Clone, Debug)]
pub struct PersonRecord {
    pub name: String,
    pub address: String,
}

#[derive(Debug)]
struct EnumCursor {
    position: usize,
}

#[derive(Debug)]
struct Store {
    persons: Vec<PersonRecord>,
    contexts: HashMap<String, EnumCursor>,
    credentials: Option<(String, String)>,
}

pub type Db = Arc<RwLock<Store>>;

fn seeded(credentials: Option<(String, String)>) -> Db {
    Arc::new(RwLock::new(Store {
        persons: vec![
            PersonRecord {
                name: "Fritz".to_string(),
                address: "Fritz Town".to_string(),
            },
            PersonRecord {
                name: "Alice".to_string(),
                address: "Wonderland".to_string(),
            },
        ],
        contexts: HashMap::new(),
        credentials,
    }))
}

pub fn app() -> Router {
    Router::new()
        .route("/cimom", post(cimom))
        .with_state(seeded(None))
}

/// Same store, but requests must carry matching Basic credentials.
pub fn app_with_auth(user: &str, password: &str) -> Router {
    Router::new()
        .route("/cimom", post(cimom))
        .with_state(seeded(Some((user.to_string(), password.to_string()))))
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    axum::serve(listener, app()).await
}

pub async fn run_with_auth(
    listener: TcpListener,
    user: &str,
    password: &str,
) -> Result<(), std::io::Error> {
    axum::serve(listener, app_with_auth(user, password)).await
}

async fn cimom(State(db): State<Db>, headers: HeaderMap, body: String) -> Response {
    {
        let store = db.read().await;
        if let Some((user, password)) = &store.credentials {
            let expected = format!("Basic {}", BASE64.encode(format!("{user}:{password}")));
            let supplied = headers
                .get("Authorization")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();
            if supplied != expected {
                return (
                    StatusCode::UNAUTHORIZED,
                    [("WWW-Authenticate", "Basic realm=\"mock-cimom\"".to_string())],
                    String::new(),
                )
                    .into_response();
            }
        }
    }

    let is_method_call = headers
        .get("CIMOperation")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("MethodCall"))
        .unwrap_or(false);
    if !is_method_call {
        return (
            StatusCode::BAD_REQUEST,
            "missing CIMOperation: MethodCall".to_string(),
        )
            .into_response();
    }

    let message_id = extract_attr(&body, "<MESSAGE", "ID").unwrap_or_else(|| "0".to_string());
    let method = extract_attr(&body, "<IMETHODCALL", "NAME").unwrap_or_default();

    if request_namespace(&body) != NAMESPACE {
        return cim_error(&message_id, &method, 3, "namespace does not exist");
    }

    let mut store = db.write().await;
    match method.as_str() {
        "GetInstance" => {
            let key = key_value(&body).unwrap_or_default();
            match store.persons.iter().find(|p| p.name == key) {
                Some(p) => {
                    let inner = format!("<IRETURNVALUE>{}</IRETURNVALUE>", instance_xml(p));
                    cim_ok(&message_id, &method, &inner)
                }
                None => cim_error(&message_id, &method, 6, "no such instance"),
            }
        }
        "EnumerateInstances" => {
            let entries: String = store.persons.iter().map(named_instance_xml).collect();
            cim_ok(
                &message_id,
                &method,
                &format!("<IRETURNVALUE>{entries}</IRETURNVALUE>"),
            )
        }
        "EnumerateInstanceNames" => {
            let entries: String = store
                .persons
                .iter()
                .map(|p| instance_name_xml(&p.name))
                .collect();
            cim_ok(
                &message_id,
                &method,
                &format!("<IRETURNVALUE>{entries}</IRETURNVALUE>"),
            )
        }
        "CreateInstance" => {
            let name = match property_value(&body, "Name") {
                Some(n) => n,
                None => return cim_error(&message_id, &method, 4, "NewInstance lacks Name"),
            };
            if store.persons.iter().any(|p| p.name == name) {
                return cim_error(&message_id, &method, 11, "instance already exists");
            }
            let address = property_value(&body, "Address").unwrap_or_default();
            store.persons.push(PersonRecord {
                name: name.clone(),
                address,
            });
            let inner = format!("<IRETURNVALUE>{}</IRETURNVALUE>", instance_name_xml(&name));
            cim_ok(&message_id, &method, &inner)
        }
        "ModifyInstance" => {
            let name = property_value(&body, "Name").unwrap_or_default();
            match store.persons.iter_mut().find(|p| p.name == name) {
                Some(p) => {
                    if let Some(address) = property_value(&body, "Address") {
                        p.address = address;
                    }
                    cim_ok(&message_id, &method, "")
                }
                None => cim_error(&message_id, &method, 6, "no such instance"),
            }
        }
        "DeleteInstance" => {
            let key = key_value(&body).unwrap_or_default();
            let before = store.persons.len();
            store.persons.retain(|p| p.name != key);
            if store.persons.len() == before {
                cim_error(&message_id, &method, 6, "no such instance")
            } else {
                cim_ok(&message_id, &method, "")
            }
        }
        "OpenEnumerateInstances" => {
            let batch = param_uint(&body, "MaxObjectCount").unwrap_or(0) as usize;
            let total = store.persons.len();
            let served: String = store.persons[..batch.min(total)]
                .iter()
                .map(instance_with_path_xml)
                .collect();
            let position = batch.min(total);
            let eos = position >= total;
            let context = if eos {
                String::new()
            } else {
                let ctx = Uuid::new_v4().to_string();
                store.contexts.insert(ctx.clone(), EnumCursor { position });
                ctx
            };
            pull_reply(&message_id, &method, &served, eos, &context)
        }
        "PullInstancesWithPath" => {
            let ctx = param_value(&body, "EnumerationContext").unwrap_or_default();
            let cursor = match store.contexts.remove(&ctx) {
                Some(c) => c,
                None => {
                    return cim_error(&message_id, &method, 21, "invalid enumeration context")
                }
            };
            let batch = param_uint(&body, "MaxObjectCount").unwrap_or(0) as usize;
            let total = store.persons.len();
            let end = (cursor.position + batch).min(total);
            let served: String = store.persons[cursor.position..end]
                .iter()
                .map(instance_with_path_xml)
                .collect();
            let eos = end >= total;
            if !eos {
                store.contexts.insert(ctx.clone(), EnumCursor { position: end });
            }
            let context = if eos { String::new() } else { ctx };
            pull_reply(&message_id, &method, &served, eos, &context)
        }
        "CloseEnumeration" => {
            let ctx = param_value(&body, "EnumerationContext").unwrap_or_default();
            if store.contexts.remove(&ctx).is_none() {
                cim_error(&message_id, &method, 21, "invalid enumeration context")
            } else {
                cim_ok(&message_id, &method, "")
            }
        }
        _ => cim_error(&message_id, &method, 7, "operation not supported"),
    }
}

// ---------------------------------------------------------------------------
// Response templates
// ---------------------------------------------------------------------------

fn instance_xml(p: &PersonRecord) -> String {
    format!(
        "<INSTANCE CLASSNAME=\"{CLASSNAME}\">\
         <PROPERTY NAME=\"Name\" TYPE=\"string\"><VALUE>{}</VALUE></PROPERTY>\
         <PROPERTY NAME=\"Address\" TYPE=\"string\"><VALUE>{}</VALUE></PROPERTY>\
         </INSTANCE>",
        xml_escape(&p.name),
        xml_escape(&p.address)
    )
}

fn instance_name_xml(name: &str) -> String {
    format!(
        "<INSTANCENAME CLASSNAME=\"{CLASSNAME}\">\
         <KEYBINDING NAME=\"Name\"><KEYVALUE VALUETYPE=\"string\" TYPE=\"string\">{}</KEYVALUE></KEYBINDING>\
         </INSTANCENAME>",
        xml_escape(name)
    )
}

fn named_instance_xml(p: &PersonRecord) -> String {
    format!(
        "<VALUE.NAMEDINSTANCE>{}{}</VALUE.NAMEDINSTANCE>",
        instance_name_xml(&p.name),
        instance_xml(p)
    )
}

fn instance_with_path_xml(p: &PersonRecord) -> String {
    format!(
        "<VALUE.INSTANCEWITHPATH><INSTANCEPATH>\
         <NAMESPACEPATH><HOST>mock-cimom</HOST>\
         <LOCALNAMESPACEPATH><NAMESPACE NAME=\"root\"/><NAMESPACE NAME=\"cimv2\"/></LOCALNAMESPACEPATH>\
         </NAMESPACEPATH>{}</INSTANCEPATH>{}</VALUE.INSTANCEWITHPATH>",
        instance_name_xml(&p.name),
        instance_xml(p)
    )
}

fn envelope(message_id: &str, inner: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"utf-8\" ?>\n\
         <CIM CIMVERSION=\"2.0\" DTDVERSION=\"2.0\">\
         <MESSAGE ID=\"{message_id}\" PROTOCOLVERSION=\"1.0\">\
         <SIMPLERSP>{inner}</SIMPLERSP></MESSAGE></CIM>"
    )
}

fn respond(body: String) -> Response {
    (
        StatusCode::OK,
        [
            (
                "Content-Type",
                "application/xml; charset=\"utf-8\"".to_string(),
            ),
            ("CIMOperation", "MethodResponse".to_string()),
            ("WBEMServerResponseTime", "1200".to_string()),
        ],
        body,
    )
        .into_response()
}

fn cim_ok(message_id: &str, method: &str, inner: &str) -> Response {
    respond(envelope(
        message_id,
        &format!("<IMETHODRESPONSE NAME=\"{method}\">{inner}</IMETHODRESPONSE>"),
    ))
}

fn cim_error(message_id: &str, method: &str, code: u32, description: &str) -> Response {
    respond(envelope(
        message_id,
        &format!(
            "<IMETHODRESPONSE NAME=\"{method}\">\
             <ERROR CODE=\"{code}\" DESCRIPTION=\"{}\"/>\
             </IMETHODRESPONSE>",
            xml_escape(description)
        ),
    ))
}

fn pull_reply(message_id: &str, method: &str, served: &str, eos: bool, context: &str) -> Response {
    let context_param = if context.is_empty() {
        String::new()
    } else {
        format!(
            "<PARAMVALUE NAME=\"EnumerationContext\"><VALUE>{context}</VALUE></PARAMVALUE>"
        )
    };
    respond(envelope(
        message_id,
        &format!(
            "<IMETHODRESPONSE NAME=\"{method}\">\
             <IRETURNVALUE>{served}</IRETURNVALUE>\
             {context_param}\
             <PARAMVALUE NAME=\"EndOfSequence\" PARAMTYPE=\"boolean\"><VALUE>{}</VALUE></PARAMVALUE>\
             </IMETHODRESPONSE>",
            if eos { "TRUE" } else { "FALSE" }
        ),
    ))
}

// ---------------------------------------------------------------------------
// Request scanning
// ---------------------------------------------------------------------------

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn xml_unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Value of `attr="..."` inside the first occurrence of `element`.
fn extract_attr(body: &str, element: &str, attr: &str) -> Option<String> {
    let start = body.find(element)?;
    let tag_end = body[start..].find('>')? + start;
    let tag = &body[start..tag_end];
    let pat = format!("{attr}=\"");
    let vstart = tag.find(&pat)? + pat.len();
    let vend = tag[vstart..].find('"')? + vstart;
    Some(xml_unescape(&tag[vstart..vend]))
}

/// The namespace parts of the request's LOCALNAMESPACEPATH, joined.
fn request_namespace(body: &str) -> String {
    let mut parts = Vec::new();
    let mut rest = body;
    while let Some(pos) = rest.find("<NAMESPACE ") {
        let tail = &rest[pos..];
        if let Some(end) = tail.find('>') {
            let tag = &tail[..end];
            if let Some(vstart) = tag.find("NAME=\"") {
                let vstart = vstart + 6;
                if let Some(vend) = tag[vstart..].find('"') {
                    parts.push(xml_unescape(&tag[vstart..vstart + vend]));
                }
            }
            rest = &tail[end..];
        } else {
            break;
        }
    }
    parts.join("/")
}

/// Text of the first KEYVALUE element.
fn key_value(body: &str) -> Option<String> {
    let start = body.find("<KEYVALUE")?;
    let open_end = body[start..].find('>')? + start + 1;
    let close = body[open_end..].find("</KEYVALUE>")? + open_end;
    Some(xml_unescape(&body[open_end..close]))
}

/// Text of the VALUE inside `<IPARAMVALUE NAME="{name}">`.
fn param_value(body: &str, name: &str) -> Option<String> {
    let marker = format!("NAME=\"{name}\"");
    let at = body.find(&marker)?;
    let tail = &body[at..];
    let vstart = tail.find("<VALUE>")? + "<VALUE>".len();
    let vend = tail[vstart..].find("</VALUE>")? + vstart;
    Some(xml_unescape(&tail[vstart..vend]))
}

fn param_uint(body: &str, name: &str) -> Option<u64> {
    param_value(body, name)?.trim().parse().ok()
}

/// Text of `<PROPERTY NAME="{name}" ...><VALUE>` inside the request's
/// INSTANCE.
fn property_value(body: &str, name: &str) -> Option<String> {
    let marker = format!("<PROPERTY NAME=\"{name}\"");
    let at = body.find(&marker)?;
    let tail = &body[at..];
    let vstart = tail.find("<VALUE>")? + "<VALUE>".len();
    let vend = tail[vstart..].find("</VALUE>")? + vstart;
    Some(xml_unescape(&tail[vstart..vend]))
}
