//! The WBEM connection and its typed operations.
//!
//! # Design
//! `WbemConnection` owns everything one logical client needs: the target
//! URL, credentials, a default namespace, a monotonically increasing
//! message-id counter, the statistics table, the open-enumeration table,
//! and the recorder set. Operations take `&mut self`, which makes the
//! one-operation-at-a-time rule a compile-time fact; callers wanting
//! parallelism open one connection per task.
//!
//! Every operation follows the same pipeline: resolve the namespace,
//! encode the request, execute it through the transport, decode the
//! reply, map it to the operation's typed result. Recorders observe the
//! typed request, both HTTP halves, and the typed outcome; statistics
//! capture exact body byte lengths, wall-clock time, and the server-side
//! time when the server reports it.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::{json, Map, Value};
use tracing::debug;

use crate::codec::{
    self, CimResponse, MethodTarget, ParamPayload, ReturnItem,
};
use crate::error::WbemError;
use crate::http::{
    operation_headers, HttpRequest, HttpResponse, HDR_CIM_OPERATION, HDR_SERVER_RESPONSE_TIME,
};
use crate::model::{
    normalize_namespace, CimClass, CimClassName, CimInstance, CimInstanceName,
    CimQualifierDeclaration,
};
use crate::recorder::{
    self, OperationCall, OperationOutcome, OperationRecorder,
};
use crate::stats::Statistics;
use crate::transport::{Transport, TransportConfig, UreqTransport};
use crate::types::{CimScalar, CimValue};

pub const DEFAULT_NAMESPACE: &str = "root/cimv2";
pub const DEFAULT_HTTP_PATH: &str = "/cimom";

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builds a [`WbemConnection`]. All state is supplied here; the connection
/// reads no environment.
#[derive(Debug, Clone)]
pub struct WbemConnectionBuilder {
    url: String,
    credentials: Option<(String, String)>,
    default_namespace: Option<String>,
    timeout: Option<Duration>,
    verify_tls: bool,
    http_path: String,
    stats_enabled: bool,
}

impl WbemConnectionBuilder {
    /// `url` is `http://host[:port]` or `https://host[:port]`; ports
    /// default to 5988 and 5989.
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            credentials: None,
            default_namespace: Some(DEFAULT_NAMESPACE.to_string()),
            timeout: None,
            verify_tls: true,
            http_path: DEFAULT_HTTP_PATH.to_string(),
            stats_enabled: false,
        }
    }

    pub fn credentials(mut self, user: &str, password: &str) -> Self {
        self.credentials = Some((user.to_string(), password.to_string()));
        self
    }

    pub fn default_namespace(mut self, namespace: &str) -> Self {
        self.default_namespace = Some(namespace.to_string());
        self
    }

    /// Leave the connection without a default namespace; operations must
    /// then carry one themselves or on their object path.
    pub fn without_default_namespace(mut self) -> Self {
        self.default_namespace = None;
        self
    }

    /// One timeout covering connect, send, and receive.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn verify_tls(mut self, verify: bool) -> Self {
        self.verify_tls = verify;
        self
    }

    pub fn http_path(mut self, path: &str) -> Self {
        self.http_path = path.to_string();
        self
    }

    pub fn enable_statistics(mut self, enabled: bool) -> Self {
        self.stats_enabled = enabled;
        self
    }

    pub fn build(self) -> Result<WbemConnection, WbemError> {
        let transport = UreqTransport::new(&TransportConfig {
            timeout: self.timeout,
            verify_tls: self.verify_tls,
            credentials: self.credentials.clone(),
        });
        self.build_with_transport(Box::new(transport))
    }

    /// Build over an explicit transport (a replay transport in tests).
    pub fn build_with_transport(
        self,
        transport: Box<dyn Transport>,
    ) -> Result<WbemConnection, WbemError> {
        let url = normalize_url(&self.url)?;
        let default_namespace = match self.default_namespace {
            Some(ns) => Some(normalize_namespace(&ns)?),
            None => None,
        };
        Ok(WbemConnection {
            url,
            http_path: self.http_path,
            default_namespace,
            transport,
            message_id: 1000,
            statistics: Statistics::new(self.stats_enabled),
            open_contexts: HashMap::new(),
            recorders: Vec::new(),
        })
    }
}

fn normalize_url(url: &str) -> Result<String, WbemError> {
    let (scheme, rest) = url
        .split_once("://")
        .ok_or_else(|| WbemError::model(format!("URL {url:?} lacks a scheme")))?;
    let default_port = match scheme {
        "http" => 5988,
        "https" => 5989,
        other => {
            return Err(WbemError::model(format!(
                "unsupported URL scheme {other:?}"
            )))
        }
    };
    let authority = rest.trim_end_matches('/');
    if authority.is_empty() {
        return Err(WbemError::model(format!("URL {url:?} lacks a host")));
    }
    if authority.contains('/') {
        return Err(WbemError::model(format!(
            "URL {url:?} must not carry a path; configure http_path instead"
        )));
    }
    let has_port = authority
        .rsplit_once(':')
        .map(|(_, p)| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()))
        .unwrap_or(false);
    Ok(if has_port {
        format!("{scheme}://{authority}")
    } else {
        format!("{scheme}://{authority}:{default_port}")
    })
}

// ---------------------------------------------------------------------------
// Operation options
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct GetInstanceOptions {
    pub local_only: Option<bool>,
    pub include_qualifiers: Option<bool>,
    pub include_class_origin: Option<bool>,
    pub property_list: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default)]
pub struct EnumerateInstancesOptions {
    pub local_only: Option<bool>,
    pub deep_inheritance: Option<bool>,
    pub include_qualifiers: Option<bool>,
    pub include_class_origin: Option<bool>,
    pub property_list: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default)]
pub struct ModifyInstanceOptions {
    pub include_qualifiers: Option<bool>,
    pub property_list: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default)]
pub struct AssociatorsOptions {
    pub assoc_class: Option<String>,
    pub result_class: Option<String>,
    pub role: Option<String>,
    pub result_role: Option<String>,
    pub include_qualifiers: Option<bool>,
    pub include_class_origin: Option<bool>,
    pub property_list: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default)]
pub struct ReferencesOptions {
    pub result_class: Option<String>,
    pub role: Option<String>,
    pub include_qualifiers: Option<bool>,
    pub include_class_origin: Option<bool>,
    pub property_list: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default)]
pub struct GetClassOptions {
    pub local_only: Option<bool>,
    pub include_qualifiers: Option<bool>,
    pub include_class_origin: Option<bool>,
    pub property_list: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default)]
pub struct EnumerateClassesOptions {
    pub classname: Option<String>,
    pub deep_inheritance: Option<bool>,
    pub local_only: Option<bool>,
    pub include_qualifiers: Option<bool>,
    pub include_class_origin: Option<bool>,
}

/// Options shared by the `Open*` enumeration initiators.
#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    pub deep_inheritance: Option<bool>,
    pub include_class_origin: Option<bool>,
    pub property_list: Option<Vec<String>>,
    pub filter_query_language: Option<String>,
    pub filter_query: Option<String>,
    /// Server-side keepalive for the enumeration context, in seconds.
    pub operation_timeout: Option<u32>,
    pub continue_on_error: Option<bool>,
    pub max_object_count: Option<u32>,
    pub assoc_class: Option<String>,
    pub result_class: Option<String>,
    pub role: Option<String>,
    pub result_role: Option<String>,
}

/// One batch of a pull enumeration. While `eos` is false the context in
/// `context` identifies the open enumeration on the server; it is the
/// exact byte string the server returned.
#[derive(Debug, Clone, PartialEq)]
pub struct PullResult {
    pub instances: Vec<CimInstance>,
    pub eos: bool,
    pub context: Option<String>,
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// A stateful client connection to one WBEM server.
///
/// Not safe for concurrent operation calls; `&mut self` receivers
/// serialize operations per connection by construction.
pub struct WbemConnection {
    url: String,
    http_path: String,
    default_namespace: Option<String>,
    transport: Box<dyn Transport>,
    message_id: u64,
    statistics: Statistics,
    /// Open enumeration contexts, mapped to the namespace they run in.
    open_contexts: HashMap<String, String>,
    recorders: Vec<Box<dyn OperationRecorder>>,
}

impl WbemConnection {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn default_namespace(&self) -> Option<&str> {
        self.default_namespace.as_deref()
    }

    /// The id used by the most recent request.
    pub fn message_id(&self) -> u64 {
        self.message_id
    }

    pub fn statistics(&self) -> &Statistics {
        &self.statistics
    }

    pub fn reset_statistics(&mut self) {
        self.statistics.reset();
    }

    pub fn add_recorder(&mut self, recorder: Box<dyn OperationRecorder>) {
        self.recorders.push(recorder);
    }

    /// Recorders currently attached, for retrieval after a run.
    pub fn recorders(&self) -> &[Box<dyn OperationRecorder>] {
        &self.recorders
    }

    pub fn has_open_enumeration(&self) -> bool {
        !self.open_contexts.is_empty()
    }

    // -- instance operations ------------------------------------------------

    pub fn get_instance(
        &mut self,
        path: &CimInstanceName,
        namespace: Option<&str>,
        options: &GetInstanceOptions,
    ) -> Result<CimInstance, WbemError> {
        let ns = self.resolve_namespace(namespace, path.namespace())?;
        let mut params = vec![("InstanceName", ParamPayload::InstanceName(path.clone()))];
        push_bool(&mut params, "LocalOnly", options.local_only);
        push_bool(&mut params, "IncludeQualifiers", options.include_qualifiers);
        push_bool(&mut params, "IncludeClassOrigin", options.include_class_origin);
        push_list(&mut params, "PropertyList", &options.property_list);

        let mut result_path = path.clone();
        result_path.set_namespace(&ns)?;
        self.intrinsic("GetInstance", &ns, params, true, move |resp| {
            let mut instance = expect_single_instance(resp)?;
            instance.set_path(result_path)?;
            Ok(instance)
        })
    }

    pub fn enumerate_instances(
        &mut self,
        classname: &str,
        namespace: Option<&str>,
        options: &EnumerateInstancesOptions,
    ) -> Result<Vec<CimInstance>, WbemError> {
        let ns = self.resolve_namespace(namespace, None)?;
        let mut params = vec![("ClassName", ParamPayload::ClassName(classname.to_string()))];
        push_bool(&mut params, "LocalOnly", options.local_only);
        push_bool(&mut params, "DeepInheritance", options.deep_inheritance);
        push_bool(&mut params, "IncludeQualifiers", options.include_qualifiers);
        push_bool(&mut params, "IncludeClassOrigin", options.include_class_origin);
        push_list(&mut params, "PropertyList", &options.property_list);

        let attach = ns.clone();
        self.intrinsic("EnumerateInstances", &ns, params, true, move |resp| {
            expect_instances(resp, Some(&attach))
        })
    }

    pub fn enumerate_instance_names(
        &mut self,
        classname: &str,
        namespace: Option<&str>,
    ) -> Result<Vec<CimInstanceName>, WbemError> {
        let ns = self.resolve_namespace(namespace, None)?;
        let params = vec![("ClassName", ParamPayload::ClassName(classname.to_string()))];
        let attach = ns.clone();
        self.intrinsic("EnumerateInstanceNames", &ns, params, true, move |resp| {
            expect_paths(resp, &attach)
        })
    }

    pub fn create_instance(
        &mut self,
        new_instance: &CimInstance,
        namespace: Option<&str>,
    ) -> Result<CimInstanceName, WbemError> {
        let path_ns = new_instance.path().and_then(|p| p.namespace());
        let ns = self.resolve_namespace(namespace, path_ns)?;
        let params = vec![("NewInstance", ParamPayload::Instance(new_instance.clone()))];
        let attach = ns.clone();
        self.intrinsic("CreateInstance", &ns, params, false, move |resp| {
            let mut paths = expect_paths(resp, &attach)?;
            match paths.len() {
                1 => Ok(paths.remove(0)),
                n => Err(WbemError::parse_at(
                    format!("CreateInstance returned {n} paths, expected one"),
                    0,
                    0,
                )),
            }
        })
    }

    pub fn modify_instance(
        &mut self,
        modified_instance: &CimInstance,
        options: &ModifyInstanceOptions,
    ) -> Result<(), WbemError> {
        let path = modified_instance.path().ok_or_else(|| {
            WbemError::model("ModifyInstance requires an instance with a path")
        })?;
        let ns = self.resolve_namespace(None, path.namespace())?;
        let mut params = vec![(
            "ModifiedInstance",
            ParamPayload::NamedInstance(modified_instance.clone()),
        )];
        push_bool(&mut params, "IncludeQualifiers", options.include_qualifiers);
        push_list(&mut params, "PropertyList", &options.property_list);
        self.intrinsic("ModifyInstance", &ns, params, false, expect_empty)
    }

    pub fn delete_instance(
        &mut self,
        path: &CimInstanceName,
        namespace: Option<&str>,
    ) -> Result<(), WbemError> {
        let ns = self.resolve_namespace(namespace, path.namespace())?;
        let params = vec![("InstanceName", ParamPayload::InstanceName(path.clone()))];
        self.intrinsic("DeleteInstance", &ns, params, false, expect_empty)
    }

    // -- association traversal ----------------------------------------------

    pub fn associators(
        &mut self,
        path: &CimInstanceName,
        namespace: Option<&str>,
        options: &AssociatorsOptions,
    ) -> Result<Vec<CimInstance>, WbemError> {
        let ns = self.resolve_namespace(namespace, path.namespace())?;
        let mut params = vec![("ObjectName", ParamPayload::InstanceName(path.clone()))];
        push_str(&mut params, "AssocClass", &options.assoc_class);
        push_str(&mut params, "ResultClass", &options.result_class);
        push_str(&mut params, "Role", &options.role);
        push_str(&mut params, "ResultRole", &options.result_role);
        push_bool(&mut params, "IncludeQualifiers", options.include_qualifiers);
        push_bool(&mut params, "IncludeClassOrigin", options.include_class_origin);
        push_list(&mut params, "PropertyList", &options.property_list);
        let attach = ns.clone();
        self.intrinsic("Associators", &ns, params, true, move |resp| {
            expect_instances(resp, Some(&attach))
        })
    }

    pub fn associator_names(
        &mut self,
        path: &CimInstanceName,
        namespace: Option<&str>,
        options: &AssociatorsOptions,
    ) -> Result<Vec<CimInstanceName>, WbemError> {
        let ns = self.resolve_namespace(namespace, path.namespace())?;
        let mut params = vec![("ObjectName", ParamPayload::InstanceName(path.clone()))];
        push_str(&mut params, "AssocClass", &options.assoc_class);
        push_str(&mut params, "ResultClass", &options.result_class);
        push_str(&mut params, "Role", &options.role);
        push_str(&mut params, "ResultRole", &options.result_role);
        let attach = ns.clone();
        self.intrinsic("AssociatorNames", &ns, params, true, move |resp| {
            expect_paths(resp, &attach)
        })
    }

    pub fn references(
        &mut self,
        path: &CimInstanceName,
        namespace: Option<&str>,
        options: &ReferencesOptions,
    ) -> Result<Vec<CimInstance>, WbemError> {
        let ns = self.resolve_namespace(namespace, path.namespace())?;
        let mut params = vec![("ObjectName", ParamPayload::InstanceName(path.clone()))];
        push_str(&mut params, "ResultClass", &options.result_class);
        push_str(&mut params, "Role", &options.role);
        push_bool(&mut params, "IncludeQualifiers", options.include_qualifiers);
        push_bool(&mut params, "IncludeClassOrigin", options.include_class_origin);
        push_list(&mut params, "PropertyList", &options.property_list);
        let attach = ns.clone();
        self.intrinsic("References", &ns, params, true, move |resp| {
            expect_instances(resp, Some(&attach))
        })
    }

    pub fn reference_names(
        &mut self,
        path: &CimInstanceName,
        namespace: Option<&str>,
        options: &ReferencesOptions,
    ) -> Result<Vec<CimInstanceName>, WbemError> {
        let ns = self.resolve_namespace(namespace, path.namespace())?;
        let mut params = vec![("ObjectName", ParamPayload::InstanceName(path.clone()))];
        push_str(&mut params, "ResultClass", &options.result_class);
        push_str(&mut params, "Role", &options.role);
        let attach = ns.clone();
        self.intrinsic("ReferenceNames", &ns, params, true, move |resp| {
            expect_paths(resp, &attach)
        })
    }

    pub fn exec_query(
        &mut self,
        query_language: &str,
        query: &str,
        namespace: Option<&str>,
    ) -> Result<Vec<CimInstance>, WbemError> {
        let ns = self.resolve_namespace(namespace, None)?;
        let params = vec![
            ("QueryLanguage", ParamPayload::Str(query_language.to_string())),
            ("Query", ParamPayload::Str(query.to_string())),
        ];
        let attach = ns.clone();
        self.intrinsic("ExecQuery", &ns, params, true, move |resp| {
            expect_instances(resp, Some(&attach))
        })
    }

    // -- class and qualifier operations -------------------------------------

    pub fn get_class(
        &mut self,
        classname: &str,
        namespace: Option<&str>,
        options: &GetClassOptions,
    ) -> Result<CimClass, WbemError> {
        let ns = self.resolve_namespace(namespace, None)?;
        let mut params = vec![("ClassName", ParamPayload::ClassName(classname.to_string()))];
        push_bool(&mut params, "LocalOnly", options.local_only);
        push_bool(&mut params, "IncludeQualifiers", options.include_qualifiers);
        push_bool(&mut params, "IncludeClassOrigin", options.include_class_origin);
        push_list(&mut params, "PropertyList", &options.property_list);
        self.intrinsic("GetClass", &ns, params, true, expect_single_class)
    }

    pub fn enumerate_classes(
        &mut self,
        namespace: Option<&str>,
        options: &EnumerateClassesOptions,
    ) -> Result<Vec<CimClass>, WbemError> {
        let ns = self.resolve_namespace(namespace, None)?;
        let mut params = Vec::new();
        push_str(&mut params, "ClassName", &options.classname);
        push_bool(&mut params, "DeepInheritance", options.deep_inheritance);
        push_bool(&mut params, "LocalOnly", options.local_only);
        push_bool(&mut params, "IncludeQualifiers", options.include_qualifiers);
        push_bool(&mut params, "IncludeClassOrigin", options.include_class_origin);
        self.intrinsic("EnumerateClasses", &ns, params, true, expect_classes)
    }

    pub fn enumerate_class_names(
        &mut self,
        classname: Option<&str>,
        namespace: Option<&str>,
        deep_inheritance: Option<bool>,
    ) -> Result<Vec<CimClassName>, WbemError> {
        let ns = self.resolve_namespace(namespace, None)?;
        let mut params = Vec::new();
        push_str(&mut params, "ClassName", &classname.map(str::to_string));
        push_bool(&mut params, "DeepInheritance", deep_inheritance);
        let attach = ns.clone();
        self.intrinsic("EnumerateClassNames", &ns, params, true, move |resp| {
            let mut names = expect_class_names(resp)?;
            for name in &mut names {
                name.namespace = Some(attach.clone());
            }
            Ok(names)
        })
    }

    pub fn delete_class(
        &mut self,
        classname: &str,
        namespace: Option<&str>,
    ) -> Result<(), WbemError> {
        let ns = self.resolve_namespace(namespace, None)?;
        let params = vec![("ClassName", ParamPayload::ClassName(classname.to_string()))];
        self.intrinsic("DeleteClass", &ns, params, false, expect_empty)
    }

    pub fn get_qualifier(
        &mut self,
        qualifier_name: &str,
        namespace: Option<&str>,
    ) -> Result<CimQualifierDeclaration, WbemError> {
        let ns = self.resolve_namespace(namespace, None)?;
        let params = vec![(
            "QualifierName",
            ParamPayload::Str(qualifier_name.to_string()),
        )];
        self.intrinsic("GetQualifier", &ns, params, true, expect_single_qualifier)
    }

    pub fn enumerate_qualifiers(
        &mut self,
        namespace: Option<&str>,
    ) -> Result<Vec<CimQualifierDeclaration>, WbemError> {
        let ns = self.resolve_namespace(namespace, None)?;
        self.intrinsic("EnumerateQualifiers", &ns, Vec::new(), true, expect_qualifiers)
    }

    // -- pull enumeration ----------------------------------------------------

    pub fn open_enumerate_instances(
        &mut self,
        classname: &str,
        namespace: Option<&str>,
        options: &OpenOptions,
    ) -> Result<PullResult, WbemError> {
        let ns = self.resolve_namespace(namespace, None)?;
        let mut params = vec![("ClassName", ParamPayload::ClassName(classname.to_string()))];
        push_bool(&mut params, "DeepInheritance", options.deep_inheritance);
        self.push_open_tail(&mut params, options);
        self.open_call("OpenEnumerateInstances", ns, params)
    }

    pub fn open_associator_instances(
        &mut self,
        path: &CimInstanceName,
        namespace: Option<&str>,
        options: &OpenOptions,
    ) -> Result<PullResult, WbemError> {
        let ns = self.resolve_namespace(namespace, path.namespace())?;
        let mut params = vec![("InstanceName", ParamPayload::InstanceName(path.clone()))];
        push_str(&mut params, "AssocClass", &options.assoc_class);
        push_str(&mut params, "ResultClass", &options.result_class);
        push_str(&mut params, "Role", &options.role);
        push_str(&mut params, "ResultRole", &options.result_role);
        self.push_open_tail(&mut params, options);
        self.open_call("OpenAssociatorInstances", ns, params)
    }

    pub fn open_reference_instances(
        &mut self,
        path: &CimInstanceName,
        namespace: Option<&str>,
        options: &OpenOptions,
    ) -> Result<PullResult, WbemError> {
        let ns = self.resolve_namespace(namespace, path.namespace())?;
        let mut params = vec![("InstanceName", ParamPayload::InstanceName(path.clone()))];
        push_str(&mut params, "ResultClass", &options.result_class);
        push_str(&mut params, "Role", &options.role);
        self.push_open_tail(&mut params, options);
        self.open_call("OpenReferenceInstances", ns, params)
    }

    pub fn pull_instances_with_path(
        &mut self,
        context: &str,
        max_object_count: u32,
    ) -> Result<PullResult, WbemError> {
        let ns = self.context_namespace("PullInstancesWithPath", context)?;
        let params = vec![
            ("EnumerationContext", ParamPayload::Str(context.to_string())),
            ("MaxObjectCount", ParamPayload::Uint32(max_object_count)),
        ];
        let attach = ns.clone();
        let result = self.intrinsic("PullInstancesWithPath", &ns, params, true, move |resp| {
            pull_result(resp, &attach)
        })?;
        self.open_contexts.remove(context);
        if !result.eos {
            let next = result.context.clone().ok_or_else(|| {
                WbemError::parse_at(
                    "pull reply carries neither EndOfSequence nor a context".to_string(),
                    0,
                    0,
                )
            })?;
            self.open_contexts.insert(next, ns);
        }
        Ok(result)
    }

    pub fn close_enumeration(&mut self, context: &str) -> Result<(), WbemError> {
        let ns = self.context_namespace("CloseEnumeration", context)?;
        let params = vec![("EnumerationContext", ParamPayload::Str(context.to_string()))];
        let result = self.intrinsic("CloseEnumeration", &ns, params, true, expect_empty);
        if result.is_ok() {
            self.open_contexts.remove(context);
        }
        result
    }

    fn push_open_tail(&self, params: &mut Vec<(&'static str, ParamPayload)>, options: &OpenOptions) {
        push_bool(params, "IncludeClassOrigin", options.include_class_origin);
        push_list(params, "PropertyList", &options.property_list);
        push_str(params, "FilterQueryLanguage", &options.filter_query_language);
        push_str(params, "FilterQuery", &options.filter_query);
        if let Some(t) = options.operation_timeout {
            params.push(("OperationTimeout", ParamPayload::Uint32(t)));
        }
        push_bool(params, "ContinueOnError", options.continue_on_error);
        if let Some(n) = options.max_object_count {
            params.push(("MaxObjectCount", ParamPayload::Uint32(n)));
        }
    }

    fn open_call(
        &mut self,
        method: &'static str,
        ns: String,
        params: Vec<(&'static str, ParamPayload)>,
    ) -> Result<PullResult, WbemError> {
        let attach = ns.clone();
        let result = self.intrinsic(method, &ns, params, true, move |resp| {
            pull_result(resp, &attach)
        })?;
        if !result.eos {
            let context = result.context.clone().ok_or_else(|| {
                WbemError::parse_at(
                    "open reply carries neither EndOfSequence nor a context".to_string(),
                    0,
                    0,
                )
            })?;
            self.open_contexts.insert(context, ns);
        }
        Ok(result)
    }

    /// The namespace an open context runs in. A closed or unknown context
    /// fails here, before anything reaches the transport.
    fn context_namespace(&mut self, method: &str, context: &str) -> Result<String, WbemError> {
        match self.open_contexts.get(context) {
            Some(ns) => Ok(ns.clone()),
            None => {
                self.statistics.record_exception(method);
                Err(WbemError::model(format!(
                    "enumeration context {context:?} is not open on this connection"
                )))
            }
        }
    }

    // -- extrinsic methods ---------------------------------------------------

    /// Invoke a CIM-schema method. Returns the method's return value and
    /// its output parameters in server order.
    pub fn invoke_method(
        &mut self,
        target: &MethodTarget,
        method_name: &str,
        in_params: &[(String, CimValue)],
        namespace: Option<&str>,
    ) -> Result<(Option<CimValue>, Vec<(String, CimValue)>), WbemError> {
        let path_ns = match target {
            MethodTarget::Instance(p) => p.namespace(),
            MethodTarget::Class(_) => None,
        };
        let ns = self.resolve_namespace(namespace, path_ns)?;
        let cim_object = object_path_text(&ns, target);

        let params_json = {
            let mut map = Map::new();
            map.insert("namespace".to_string(), json!(ns));
            map.insert("target".to_string(), json!(cim_object));
            for (name, value) in in_params {
                map.insert(name.clone(), recorder::value_to_json(value));
            }
            Value::Object(map)
        };
        let call = OperationCall {
            method: method_name.to_string(),
            params: params_json,
        };

        let raw = self.execute_call_inner(method_name, &cim_object, call, false, |id| {
            codec::encode_method_request(method_name, &ns, target, in_params, id)
        });
        self.conclude(method_name, raw, |resp| {
            Ok((resp.return_value, resp.out_params))
        })
    }

    // -- shared pipeline -----------------------------------------------------

    fn resolve_namespace(
        &self,
        op_namespace: Option<&str>,
        path_namespace: Option<&str>,
    ) -> Result<String, WbemError> {
        let raw = op_namespace
            .or(path_namespace)
            .or(self.default_namespace.as_deref())
            .ok_or_else(|| {
                WbemError::model(
                    "no namespace: none on the operation, the object path, or the connection",
                )
            })?;
        normalize_namespace(raw)
    }

    fn intrinsic<T>(
        &mut self,
        method: &'static str,
        namespace: &str,
        params: Vec<(&'static str, ParamPayload)>,
        idempotent: bool,
        mapper: impl FnOnce(CimResponse) -> Result<T, WbemError>,
    ) -> Result<T, WbemError> {
        let call = OperationCall {
            method: method.to_string(),
            params: intrinsic_params_json(namespace, &params),
        };
        let raw = self.execute_call_inner(method, namespace, call, idempotent, |id| {
            codec::encode_imethod_request(method, namespace, &params, id)
        });
        self.conclude(method, raw, mapper)
    }

    /// Map the decoded response to its typed shape and deliver exactly one
    /// `staged_reply` per operation; failures anywhere in the pipeline
    /// count against `exception_count`.
    fn conclude<T>(
        &mut self,
        method: &str,
        raw: Result<CimResponse, WbemError>,
        mapper: impl FnOnce(CimResponse) -> Result<T, WbemError>,
    ) -> Result<T, WbemError> {
        let mapped = raw.and_then(|resp| {
            let reply_json = recorder::response_to_json(&resp);
            mapper(resp).map(|t| (t, reply_json))
        });
        match mapped {
            Ok((value, reply_json)) => {
                let outcome = OperationOutcome::Result(reply_json);
                self.notify(|r| r.staged_reply(&outcome));
                Ok(value)
            }
            Err(e) => {
                self.statistics.record_exception(method);
                let outcome = OperationOutcome::from_error(&e);
                self.notify(|r| r.staged_reply(&outcome));
                Err(e)
            }
        }
    }

    fn execute_call_inner(
        &mut self,
        method: &str,
        cim_object: &str,
        call: OperationCall,
        idempotent: bool,
        encode: impl FnOnce(u64) -> Result<String, WbemError>,
    ) -> Result<CimResponse, WbemError> {
        if !self.open_contexts.is_empty() && !is_pull_continuation(method) {
            return Err(WbemError::model(format!(
                "{method} is not permitted while an enumeration context is open"
            )));
        }

        self.message_id += 1;
        let id = self.message_id;
        debug!(method, cim_object, id, "request");
        self.notify(|r| r.staged_request(&call));

        let body = encode(id)?;
        let request = HttpRequest {
            url: format!("{}{}", self.url, self.http_path),
            headers: operation_headers(method, cim_object, body.len()),
            body,
            idempotent,
        };
        self.notify(|r| r.staged_http_request(&request));

        let request_len = request.body.len();
        let started = Instant::now();
        let response = self.transport.execute(&request)?;
        let client_time = started.elapsed();
        self.notify(|r| r.staged_http_reply(&response));

        let server_time = response
            .header(HDR_SERVER_RESPONSE_TIME)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_micros);
        self.statistics.record_round_trip(
            method,
            client_time,
            server_time,
            request_len,
            response.body.len(),
        );

        check_http_reply(&response)?;
        let decoded = codec::decode_response(&response.body)?;
        if let Some(reply_id) = &decoded.message_id {
            if reply_id != &id.to_string() {
                return Err(WbemError::parse_at(
                    format!("reply MESSAGE ID {reply_id:?} does not match request {id}"),
                    0,
                    0,
                ));
            }
        }
        Ok(decoded)
    }

    fn notify(&mut self, mut f: impl FnMut(&mut dyn OperationRecorder)) {
        for recorder in &mut self.recorders {
            f(recorder.as_mut());
        }
    }
}

fn check_http_reply(response: &HttpResponse) -> Result<(), WbemError> {
    if response.status == 401 {
        return Err(WbemError::Auth(
            "server rejected credentials (HTTP 401)".to_string(),
        ));
    }
    if response.status != 200 {
        return Err(WbemError::Http {
            status: response.status,
            reason: response.body.chars().take(200).collect(),
        });
    }
    match response.header(HDR_CIM_OPERATION) {
        Some(v) if v.eq_ignore_ascii_case("MethodResponse") => Ok(()),
        _ => Err(WbemError::Connection(
            "reply lacks CIMOperation: MethodResponse".to_string(),
        )),
    }
}

/// Pull continuations are the only traffic allowed while a context is
/// open.
fn is_pull_continuation(method: &str) -> bool {
    method.starts_with("Pull") || method == "CloseEnumeration"
}

fn push_bool(
    params: &mut Vec<(&'static str, ParamPayload)>,
    name: &'static str,
    value: Option<bool>,
) {
    if let Some(v) = value {
        params.push((name, ParamPayload::Boolean(v)));
    }
}

fn push_str(
    params: &mut Vec<(&'static str, ParamPayload)>,
    name: &'static str,
    value: &Option<String>,
) {
    if let Some(v) = value {
        params.push((name, ParamPayload::Str(v.clone())));
    }
}

fn push_list(
    params: &mut Vec<(&'static str, ParamPayload)>,
    name: &'static str,
    value: &Option<Vec<String>>,
) {
    if let Some(v) = value {
        params.push((name, ParamPayload::StringArray(v.clone())));
    }
}

fn intrinsic_params_json(namespace: &str, params: &[(&'static str, ParamPayload)]) -> Value {
    let mut map = Map::new();
    map.insert("namespace".to_string(), json!(namespace));
    for (name, payload) in params {
        let value = match payload {
            ParamPayload::Boolean(b) => json!(b),
            ParamPayload::Uint32(v) => json!(v),
            ParamPayload::Str(s) => json!(s),
            ParamPayload::StringArray(items) => json!(items),
            ParamPayload::ClassName(name) => json!(name),
            ParamPayload::InstanceName(path) => recorder::instance_name_to_json(path),
            ParamPayload::Instance(inst) | ParamPayload::NamedInstance(inst) => {
                recorder::instance_to_json(inst)
            }
        };
        map.insert((*name).to_string(), value);
    }
    Value::Object(map)
}

/// The CIMObject header form of an extrinsic target:
/// `namespace:Class.Key1="v1",Key2=v2`.
fn object_path_text(namespace: &str, target: &MethodTarget) -> String {
    match target {
        MethodTarget::Class(classname) => format!("{namespace}:{classname}"),
        MethodTarget::Instance(path) => {
            let keys: Vec<String> = path
                .keybindings()
                .iter()
                .map(|kb| {
                    let text = match &kb.value {
                        CimScalar::String(s) => format!("\"{s}\""),
                        CimScalar::Char16(c) => format!("\"{c}\""),
                        CimScalar::DateTime(dt) => format!("\"{dt}\""),
                        CimScalar::Reference(inner) => format!(
                            "\"{}\"",
                            object_path_text(
                                inner.namespace().unwrap_or(namespace),
                                &MethodTarget::Instance((**inner).clone()),
                            )
                        ),
                        other => other.wire_text().unwrap_or_default(),
                    };
                    format!("{}={}", kb.name, text)
                })
                .collect();
            if keys.is_empty() {
                format!("{namespace}:{}", path.classname())
            } else {
                format!("{namespace}:{}.{}", path.classname(), keys.join(","))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Response shape mapping
// ---------------------------------------------------------------------------

fn shape_error(what: &str) -> WbemError {
    WbemError::parse_at(format!("reply does not have the expected shape: {what}"), 0, 0)
}

fn expect_single_instance(resp: CimResponse) -> Result<CimInstance, WbemError> {
    let mut items = resp.items;
    match (items.len(), items.pop()) {
        (1, Some(ReturnItem::Instance(inst))) => Ok(inst),
        (n, _) => Err(shape_error(&format!("expected one instance, got {n} items"))),
    }
}

fn expect_instances(
    resp: CimResponse,
    attach_namespace: Option<&str>,
) -> Result<Vec<CimInstance>, WbemError> {
    let mut out = Vec::with_capacity(resp.items.len());
    for item in resp.items {
        match item {
            ReturnItem::Instance(mut inst) => {
                if let (Some(ns), Some(path)) = (attach_namespace, inst.path()) {
                    if path.namespace().is_none() {
                        let mut with_ns = path.clone();
                        with_ns.set_namespace(ns)?;
                        inst.set_path(with_ns)?;
                    }
                }
                out.push(inst);
            }
            other => return Err(shape_error(&format!("unexpected item {other:?}"))),
        }
    }
    Ok(out)
}

fn expect_paths(resp: CimResponse, attach_namespace: &str) -> Result<Vec<CimInstanceName>, WbemError> {
    let mut out = Vec::with_capacity(resp.items.len());
    for item in resp.items {
        match item {
            ReturnItem::InstancePath(mut path) => {
                if path.namespace().is_none() {
                    path.set_namespace(attach_namespace)?;
                }
                out.push(path);
            }
            other => return Err(shape_error(&format!("unexpected item {other:?}"))),
        }
    }
    Ok(out)
}

fn expect_single_class(resp: CimResponse) -> Result<CimClass, WbemError> {
    let mut items = resp.items;
    match (items.len(), items.pop()) {
        (1, Some(ReturnItem::Class(class))) => Ok(class),
        (n, _) => Err(shape_error(&format!("expected one class, got {n} items"))),
    }
}

fn expect_classes(resp: CimResponse) -> Result<Vec<CimClass>, WbemError> {
    resp.items
        .into_iter()
        .map(|item| match item {
            ReturnItem::Class(class) => Ok(class),
            other => Err(shape_error(&format!("unexpected item {other:?}"))),
        })
        .collect()
}

fn expect_class_names(resp: CimResponse) -> Result<Vec<CimClassName>, WbemError> {
    resp.items
        .into_iter()
        .map(|item| match item {
            ReturnItem::ClassName(name) => Ok(name),
            other => Err(shape_error(&format!("unexpected item {other:?}"))),
        })
        .collect()
}

fn expect_single_qualifier(resp: CimResponse) -> Result<CimQualifierDeclaration, WbemError> {
    let mut items = resp.items;
    match (items.len(), items.pop()) {
        (1, Some(ReturnItem::QualifierDeclaration(decl))) => Ok(decl),
        (n, _) => Err(shape_error(&format!(
            "expected one qualifier declaration, got {n} items"
        ))),
    }
}

fn expect_qualifiers(resp: CimResponse) -> Result<Vec<CimQualifierDeclaration>, WbemError> {
    resp.items
        .into_iter()
        .map(|item| match item {
            ReturnItem::QualifierDeclaration(decl) => Ok(decl),
            other => Err(shape_error(&format!("unexpected item {other:?}"))),
        })
        .collect()
}

fn expect_empty(resp: CimResponse) -> Result<(), WbemError> {
    if resp.items.is_empty() {
        Ok(())
    } else {
        Err(shape_error(&format!(
            "expected an empty reply, got {} items",
            resp.items.len()
        )))
    }
}

fn pull_result(resp: CimResponse, attach_namespace: &str) -> Result<PullResult, WbemError> {
    let eos = match resp.out_param("EndOfSequence") {
        Some(CimValue::Scalar(CimScalar::Boolean(b))) => *b,
        Some(CimValue::Scalar(CimScalar::String(s))) => match s.to_ascii_uppercase().as_str() {
            "TRUE" => true,
            "FALSE" => false,
            _ => return Err(shape_error("EndOfSequence is not a boolean")),
        },
        _ => return Err(shape_error("reply lacks EndOfSequence")),
    };
    let context = match resp.out_param("EnumerationContext") {
        Some(CimValue::Scalar(CimScalar::String(s))) if !s.is_empty() => Some(s.clone()),
        _ => None,
    };
    if !eos && context.is_none() {
        return Err(shape_error("open enumeration lacks an EnumerationContext"));
    }
    let instances = expect_instances(resp, Some(attach_namespace))?;
    Ok(PullResult {
        instances,
        eos,
        context,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::ReplayTransport;

    fn ok_response(inner: &str, id: u64) -> HttpResponse {
        HttpResponse {
            status: 200,
            headers: vec![
                ("CIMOperation".to_string(), "MethodResponse".to_string()),
                ("WBEMServerResponseTime".to_string(), "1500".to_string()),
            ],
            body: format!(
                "<?xml version=\"1.0\" encoding=\"utf-8\" ?>\n\
                 <CIM CIMVERSION=\"2.0\" DTDVERSION=\"2.0\">\
                 <MESSAGE ID=\"{id}\" PROTOCOLVERSION=\"1.0\">\
                 <SIMPLERSP>{inner}</SIMPLERSP></MESSAGE></CIM>"
            ),
        }
    }

    fn instance_reply(id: u64) -> HttpResponse {
        ok_response(
            "<IMETHODRESPONSE NAME=\"GetInstance\"><IRETURNVALUE>\
             <INSTANCE CLASSNAME=\"Mock_Person\">\
             <PROPERTY NAME=\"Name\" TYPE=\"string\"><VALUE>Fritz</VALUE></PROPERTY>\
             </INSTANCE></IRETURNVALUE></IMETHODRESPONSE>",
            id,
        )
    }

    fn connection_with(replies: Vec<HttpResponse>) -> (WbemConnection, std::sync::Arc<std::sync::Mutex<Vec<HttpRequest>>>) {
        let mut transport = ReplayTransport::new();
        for r in replies {
            transport.push_reply(r);
        }
        let log = transport.request_log();
        let conn = WbemConnectionBuilder::new("http://server")
            .credentials("tester", "secret")
            .enable_statistics(true)
            .build_with_transport(Box::new(transport))
            .unwrap();
        (conn, log)
    }

    fn person_path() -> CimInstanceName {
        CimInstanceName::with_keys(
            "Mock_Person",
            &[("Name", CimScalar::String("Fritz".to_string()))],
        )
    }

    #[test]
    fn url_normalization_applies_default_ports() {
        assert_eq!(normalize_url("http://srv").unwrap(), "http://srv:5988");
        assert_eq!(normalize_url("https://srv").unwrap(), "https://srv:5989");
        assert_eq!(normalize_url("http://srv:7788/").unwrap(), "http://srv:7788");
        assert!(normalize_url("ftp://srv").is_err());
        assert!(normalize_url("srv:5988").is_err());
        assert!(normalize_url("http://srv/cimom").is_err());
    }

    #[test]
    fn namespace_resolution_precedence() {
        let (conn, _) = connection_with(Vec::new());
        // operation namespace wins
        assert_eq!(
            conn.resolve_namespace(Some("root/op"), Some("root/path")).unwrap(),
            "root/op"
        );
        // then the path namespace
        assert_eq!(
            conn.resolve_namespace(None, Some("root/path")).unwrap(),
            "root/path"
        );
        // then the connection default
        assert_eq!(conn.resolve_namespace(None, None).unwrap(), "root/cimv2");
        // normalization applies wherever it came from
        assert_eq!(
            conn.resolve_namespace(Some("//root/mycim//"), None).unwrap(),
            "root/mycim"
        );
    }

    #[test]
    fn missing_namespace_fails_before_transport() {
        let mut transport = ReplayTransport::new();
        let log = transport.request_log();
        let mut conn = WbemConnectionBuilder::new("http://server")
            .without_default_namespace()
            .build_with_transport(Box::new(transport))
            .unwrap();
        let err = conn
            .enumerate_instance_names("Mock_Person", None)
            .unwrap_err();
        assert!(matches!(err, WbemError::Model(_)));
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn get_instance_attaches_namespaced_path() {
        let (mut conn, log) = connection_with(vec![instance_reply(1001)]);
        let inst = conn
            .get_instance(&person_path(), None, &GetInstanceOptions::default())
            .unwrap();
        assert_eq!(inst.classname, "Mock_Person");
        let path = inst.path().unwrap();
        assert_eq!(path.namespace(), Some("root/cimv2"));

        let sent = log.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].header("CIMMethod"), Some("GetInstance"));
        assert_eq!(sent[0].header("CIMObject"), Some("root/cimv2"));
        assert!(sent[0].idempotent);
    }

    #[test]
    fn message_id_advances_per_request() {
        let (mut conn, _) = connection_with(vec![instance_reply(1001), instance_reply(1002)]);
        assert_eq!(conn.message_id(), 1000);
        let a = conn
            .get_instance(&person_path(), None, &GetInstanceOptions::default())
            .unwrap();
        let b = conn
            .get_instance(&person_path(), None, &GetInstanceOptions::default())
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(conn.message_id(), 1002);
    }

    #[test]
    fn mismatched_reply_id_is_rejected() {
        let (mut conn, _) = connection_with(vec![instance_reply(4242)]);
        let err = conn
            .get_instance(&person_path(), None, &GetInstanceOptions::default())
            .unwrap_err();
        assert!(matches!(err, WbemError::Parse { .. }));
    }

    #[test]
    fn statistics_capture_exact_body_lengths() {
        let reply = instance_reply(1001);
        let reply_len = reply.body.len() as u64;
        let (mut conn, log) = connection_with(vec![reply]);
        conn.get_instance(&person_path(), None, &GetInstanceOptions::default())
            .unwrap();

        let request_len = log.lock().unwrap()[0].body.len() as u64;
        let stat = conn.statistics().get("GetInstance").unwrap();
        assert_eq!(stat.count, 1);
        assert_eq!(stat.exception_count, 0);
        assert_eq!(stat.request_len.sum, request_len);
        assert_eq!(stat.reply_len.sum, reply_len);
        assert_eq!(stat.server_time.sum, Duration::from_micros(1500));
    }

    #[test]
    fn disabled_statistics_stay_empty() {
        let mut transport = ReplayTransport::new();
        transport.push_reply(instance_reply(1001));
        let mut conn = WbemConnectionBuilder::new("http://server")
            .build_with_transport(Box::new(transport))
            .unwrap();
        conn.get_instance(&person_path(), None, &GetInstanceOptions::default())
            .unwrap();
        assert!(conn.statistics().is_empty());
    }

    #[test]
    fn cim_error_replies_count_as_exceptions() {
        let reply = ok_response(
            "<IMETHODRESPONSE NAME=\"GetInstance\">\
             <ERROR CODE=\"6\" DESCRIPTION=\"gone\"/></IMETHODRESPONSE>",
            1001,
        );
        let (mut conn, _) = connection_with(vec![reply]);
        let err = conn
            .get_instance(&person_path(), None, &GetInstanceOptions::default())
            .unwrap_err();
        match err {
            WbemError::Cim(e) => assert_eq!(e.code, 6),
            other => panic!("unexpected {other:?}"),
        }
        let stat = conn.statistics().get("GetInstance").unwrap();
        assert_eq!(stat.exception_count, 1);
        // the round trip completed, so lengths were still captured
        assert_eq!(stat.count, 1);
    }

    #[test]
    fn non_cim_reply_is_a_connection_error() {
        let reply = HttpResponse {
            status: 200,
            headers: Vec::new(),
            body: "<html>hello</html>".to_string(),
        };
        let (mut conn, _) = connection_with(vec![reply]);
        let err = conn
            .get_instance(&person_path(), None, &GetInstanceOptions::default())
            .unwrap_err();
        assert!(matches!(err, WbemError::Connection(_)));
    }

    #[test]
    fn http_error_statuses_map_to_http() {
        let reply = HttpResponse {
            status: 500,
            headers: Vec::new(),
            body: "boom".to_string(),
        };
        let (mut conn, _) = connection_with(vec![reply]);
        let err = conn
            .get_instance(&person_path(), None, &GetInstanceOptions::default())
            .unwrap_err();
        assert!(matches!(err, WbemError::Http { status: 500, .. }));
    }

    fn open_reply(id: u64, eos: bool, ctx: &str) -> HttpResponse {
        let ctx_param = if ctx.is_empty() {
            String::new()
        } else {
            format!("<PARAMVALUE NAME=\"EnumerationContext\"><VALUE>{ctx}</VALUE></PARAMVALUE>")
        };
        ok_response(
            &format!(
                "<IMETHODRESPONSE NAME=\"OpenEnumerateInstances\">\
                 <IRETURNVALUE>\
                 <VALUE.INSTANCEWITHPATH>\
                 <INSTANCEPATH><NAMESPACEPATH><HOST>server</HOST>\
                 <LOCALNAMESPACEPATH><NAMESPACE NAME=\"root\"/><NAMESPACE NAME=\"cimv2\"/></LOCALNAMESPACEPATH>\
                 </NAMESPACEPATH>\
                 <INSTANCENAME CLASSNAME=\"Mock_Person\">\
                 <KEYBINDING NAME=\"Name\"><KEYVALUE VALUETYPE=\"string\">Fritz</KEYVALUE></KEYBINDING>\
                 </INSTANCENAME></INSTANCEPATH>\
                 <INSTANCE CLASSNAME=\"Mock_Person\">\
                 <PROPERTY NAME=\"Name\" TYPE=\"string\"><VALUE>Fritz</VALUE></PROPERTY>\
                 </INSTANCE></VALUE.INSTANCEWITHPATH>\
                 </IRETURNVALUE>\
                 {ctx_param}\
                 <PARAMVALUE NAME=\"EndOfSequence\" PARAMTYPE=\"boolean\"><VALUE>{}</VALUE></PARAMVALUE>\
                 </IMETHODRESPONSE>",
                if eos { "TRUE" } else { "FALSE" }
            ),
            id,
        )
    }

    #[test]
    fn pull_lifecycle_tracks_contexts() {
        let pull_reply = {
            let mut r = open_reply(1002, true, "");
            r.body = r.body.replace("OpenEnumerateInstances", "PullInstancesWithPath");
            r
        };
        let (mut conn, log) = connection_with(vec![open_reply(1001, false, "ctx-9"), pull_reply]);

        let opened = conn
            .open_enumerate_instances("Mock_Person", None, &OpenOptions::default())
            .unwrap();
        assert!(!opened.eos);
        assert_eq!(opened.context.as_deref(), Some("ctx-9"));
        assert!(conn.has_open_enumeration());

        // non-pull traffic is refused locally while the context is open
        let err = conn
            .enumerate_instance_names("Mock_Person", None)
            .unwrap_err();
        assert!(matches!(err, WbemError::Model(_)));
        assert_eq!(log.lock().unwrap().len(), 1);

        let pulled = conn.pull_instances_with_path("ctx-9", 10).unwrap();
        assert!(pulled.eos);
        assert!(!conn.has_open_enumeration());

        // the context is spent; further pulls fail without transport
        let err = conn.pull_instances_with_path("ctx-9", 10).unwrap_err();
        assert!(matches!(err, WbemError::Model(_)));
        let err = conn.close_enumeration("ctx-9").unwrap_err();
        assert!(matches!(err, WbemError::Model(_)));
        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[test]
    fn close_enumeration_releases_the_context() {
        let close_reply = ok_response(
            "<IMETHODRESPONSE NAME=\"CloseEnumeration\"/>",
            1002,
        );
        let (mut conn, _) = connection_with(vec![open_reply(1001, false, "ctx-1"), close_reply]);
        conn.open_enumerate_instances("Mock_Person", None, &OpenOptions::default())
            .unwrap();
        conn.close_enumeration("ctx-1").unwrap();
        assert!(!conn.has_open_enumeration());
    }

    #[test]
    fn get_class_decodes_the_full_class_shape() {
        let reply = ok_response(
            "<IMETHODRESPONSE NAME=\"GetClass\"><IRETURNVALUE>\
             <CLASS NAME=\"Mock_Person\" SUPERCLASS=\"Mock_Entity\">\
             <PROPERTY NAME=\"Name\" TYPE=\"string\"/>\
             <METHOD NAME=\"Rename\" TYPE=\"uint32\">\
             <PARAMETER NAME=\"NewName\" TYPE=\"string\"/>\
             </METHOD></CLASS></IRETURNVALUE></IMETHODRESPONSE>",
            1001,
        );
        let (mut conn, log) = connection_with(vec![reply]);
        let class = conn
            .get_class("Mock_Person", None, &GetClassOptions::default())
            .unwrap();
        assert_eq!(class.superclass.as_deref(), Some("Mock_Entity"));
        assert!(class.methods.contains("Rename"));
        assert_eq!(log.lock().unwrap()[0].header("CIMMethod"), Some("GetClass"));
    }

    #[test]
    fn enumerate_qualifiers_decodes_declarations() {
        let reply = ok_response(
            "<IMETHODRESPONSE NAME=\"EnumerateQualifiers\"><IRETURNVALUE>\
             <QUALIFIER.DECLARATION NAME=\"Key\" TYPE=\"boolean\">\
             <SCOPE PROPERTY=\"true\"/><VALUE>FALSE</VALUE>\
             </QUALIFIER.DECLARATION>\
             <QUALIFIER.DECLARATION NAME=\"Description\" TYPE=\"string\"/>\
             </IRETURNVALUE></IMETHODRESPONSE>",
            1001,
        );
        let (mut conn, _) = connection_with(vec![reply]);
        let decls = conn.enumerate_qualifiers(None).unwrap();
        assert_eq!(decls.len(), 2);
        assert_eq!(decls[0].name, "Key");
        assert_eq!(decls[0].scopes, ["PROPERTY"]);
    }

    #[test]
    fn associators_attach_paths_from_the_wire() {
        let reply = ok_response(
            "<IMETHODRESPONSE NAME=\"Associators\"><IRETURNVALUE>\
             <VALUE.OBJECTWITHPATH>\
             <INSTANCEPATH><NAMESPACEPATH><HOST>server</HOST>\
             <LOCALNAMESPACEPATH><NAMESPACE NAME=\"root\"/><NAMESPACE NAME=\"cimv2\"/></LOCALNAMESPACEPATH>\
             </NAMESPACEPATH>\
             <INSTANCENAME CLASSNAME=\"Mock_Address\">\
             <KEYBINDING NAME=\"Id\"><KEYVALUE VALUETYPE=\"numeric\" TYPE=\"uint32\">5</KEYVALUE></KEYBINDING>\
             </INSTANCENAME></INSTANCEPATH>\
             <INSTANCE CLASSNAME=\"Mock_Address\">\
             <PROPERTY NAME=\"City\" TYPE=\"string\"><VALUE>Fritz Town</VALUE></PROPERTY>\
             </INSTANCE></VALUE.OBJECTWITHPATH>\
             </IRETURNVALUE></IMETHODRESPONSE>",
            1001,
        );
        let (mut conn, _) = connection_with(vec![reply]);
        let related = conn
            .associators(&person_path(), None, &AssociatorsOptions::default())
            .unwrap();
        assert_eq!(related.len(), 1);
        let path = related[0].path().unwrap();
        assert_eq!(path.host(), Some("server"));
        assert_eq!(path.namespace(), Some("root/cimv2"));
    }

    #[test]
    fn invoke_method_returns_value_and_out_params() {
        let reply = ok_response(
            "<METHODRESPONSE NAME=\"RequestStateChange\">\
             <RETURNVALUE PARAMTYPE=\"uint32\"><VALUE>0</VALUE></RETURNVALUE>\
             <PARAMVALUE NAME=\"Delay\" PARAMTYPE=\"uint32\"><VALUE>30</VALUE></PARAMVALUE>\
             </METHODRESPONSE>",
            1001,
        );
        let (mut conn, log) = connection_with(vec![reply]);
        let (returned, out) = conn
            .invoke_method(
                &MethodTarget::Instance(person_path()),
                "RequestStateChange",
                &[("RequestedState".to_string(), CimValue::uint32(3))],
                None,
            )
            .unwrap();
        assert_eq!(returned, Some(CimValue::uint32(0)));
        assert_eq!(out, vec![("Delay".to_string(), CimValue::uint32(30))]);

        let sent = log.lock().unwrap();
        assert_eq!(sent[0].header("CIMMethod"), Some("RequestStateChange"));
        assert_eq!(
            sent[0].header("CIMObject"),
            Some("root/cimv2:Mock_Person.Name=%22Fritz%22")
        );
        assert!(!sent[0].idempotent);
        assert!(sent[0].body.contains("<METHODCALL NAME=\"RequestStateChange\">"));
    }

    #[test]
    fn extrinsic_target_text_quotes_string_keys() {
        let target = MethodTarget::Instance(person_path());
        assert_eq!(
            object_path_text("root/cimv2", &target),
            "root/cimv2:Mock_Person.Name=\"Fritz\""
        );
        let class = MethodTarget::Class("Mock_Service".to_string());
        assert_eq!(
            object_path_text("root/cimv2", &class),
            "root/cimv2:Mock_Service"
        );
    }

    #[test]
    fn recorder_sees_all_four_stages() {
        use crate::recorder::VectorRecorder;
        use std::sync::{Arc, Mutex};

        let shared = Arc::new(Mutex::new(VectorRecorder::new()));
        let (mut conn, _) = connection_with(vec![instance_reply(1001)]);
        conn.add_recorder(Box::new(Arc::clone(&shared)));
        conn.get_instance(&person_path(), None, &GetInstanceOptions::default())
            .unwrap();

        let recorder = shared.lock().unwrap();
        assert_eq!(recorder.cases().len(), 1);
        let case = &recorder.cases()[0];
        assert_eq!(case["operation"]["method"], "GetInstance");
        assert_eq!(case["operation"]["params"]["namespace"], "root/cimv2");
        assert!(case["http_request"]["body"]
            .as_str()
            .unwrap()
            .contains("<IMETHODCALL NAME=\"GetInstance\">"));
        assert_eq!(case["http_response"]["status"], 200);
        assert!(case["reply"]["result"]["items"].is_array());
    }
}
