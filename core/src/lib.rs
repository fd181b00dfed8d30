//! WBEM client core: CIM operations over HTTP in the CIM-XML encoding
//! (DSP0200/DSP0201).
//!
//! # Overview
//! `WbemConnection` exposes one typed method per intrinsic CIM operation
//! and a generic extrinsic method invocation. Each operation encodes a
//! typed request tree to CIM-XML, executes it through a `Transport`, and
//! decodes the reply back into the typed CIM object model — or into one of
//! the taxonomized errors in [`WbemError`].
//!
//! # Design
//! - CIM objects are plain values; names compare case-insensitively but
//!   keep their original spelling.
//! - The HTTP boundary is data (`HttpRequest`/`HttpResponse`) behind the
//!   `Transport` trait, so tests replay canned traffic through the full
//!   operation layer with no socket.
//! - A connection is single-operation-at-a-time by construction
//!   (`&mut self`); open one connection per task for parallelism.
//! - Recorders observe the typed request, both HTTP halves, and the typed
//!   outcome of every operation.

pub mod codec;
pub mod connection;
pub mod datetime;
pub mod error;
pub mod http;
pub mod model;
pub mod recorder;
pub mod stats;
pub mod transport;
pub mod types;
pub mod xml;

pub use connection::{
    AssociatorsOptions, EnumerateClassesOptions, EnumerateInstancesOptions, GetClassOptions,
    GetInstanceOptions, ModifyInstanceOptions, OpenOptions, PullResult, ReferencesOptions,
    WbemConnection, WbemConnectionBuilder, DEFAULT_HTTP_PATH, DEFAULT_NAMESPACE,
};
pub use codec::MethodTarget;
pub use datetime::{CimDateTime, CimInterval, CimTimestamp};
pub use error::{CimError, WbemError};
pub use http::{HttpRequest, HttpResponse};
pub use model::{
    CimClass, CimClassName, CimInstance, CimInstanceName, CimKeyBinding, CimMethod, CimParameter,
    CimProperty, CimQualifier, CimQualifierDeclaration, EmbeddedObject, NameMap,
};
pub use recorder::{OperationCall, OperationOutcome, OperationRecorder, ReplayTransport, VectorRecorder};
pub use stats::{OperationStatistic, Statistics};
pub use transport::{Transport, TransportConfig, UreqTransport};
pub use types::{CimScalar, CimType, CimValue};
