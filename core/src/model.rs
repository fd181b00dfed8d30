//! The CIM object model: instances, classes, object paths, qualifiers.
//!
//! # Design
//! All objects here are plain values; holding one never implies holding a
//! live server resource. CIM names (class, property, method, parameter,
//! qualifier) compare case-insensitively but keep the spelling they arrived
//! with, so a decoded object re-encodes with the server's original casing.
//! `NameMap` provides that behavior for every named collection: an ordered
//! sequence of items plus a case-folded index.
//!
//! Invariants (violations are `WbemError::Model`):
//! - an instance path's classname matches the instance's classname,
//! - namespaces are stored normalized (no leading/trailing/repeated `/`),
//! - a property's `is_array` agrees with its value shape, `array_size`
//!   appears only on arrays, and `reference_class` only on references.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use crate::error::WbemError;
use crate::types::{CimScalar, CimType, CimValue};

/// Anything stored in a `NameMap`.
pub trait Named {
    fn name(&self) -> &str;
}

fn fold(name: &str) -> String {
    name.to_ascii_lowercase()
}

pub(crate) fn eq_ci(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

fn eq_ci_opt(a: &Option<String>, b: &Option<String>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => eq_ci(a, b),
        (None, None) => true,
        _ => false,
    }
}

/// Ordered, case-preserving collection with case-insensitive name lookup.
///
/// Insertion order is preserved on iteration (server order for decoded
/// objects, caller order for built ones). Inserting an item whose name is
/// already present replaces it in place. Equality is order-insensitive.
#[derive(Debug, Clone)]
pub struct NameMap<T: Named> {
    items: Vec<T>,
    index: HashMap<String, usize>,
}

impl<T: Named> NameMap<T> {
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn insert(&mut self, item: T) {
        let key = fold(item.name());
        match self.index.get(&key) {
            Some(&pos) => self.items[pos] = item,
            None => {
                self.index.insert(key, self.items.len());
                self.items.push(item);
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&T> {
        self.index.get(&fold(name)).map(|&pos| &self.items[pos])
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut T> {
        let pos = *self.index.get(&fold(name))?;
        Some(&mut self.items[pos])
    }

    pub fn remove(&mut self, name: &str) -> Option<T> {
        let pos = self.index.remove(&fold(name))?;
        let item = self.items.remove(pos);
        for slot in self.index.values_mut() {
            if *slot > pos {
                *slot -= 1;
            }
        }
        Some(item)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(&fold(name))
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<T: Named> Default for NameMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Named> FromIterator<T> for NameMap<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut map = NameMap::new();
        for item in iter {
            map.insert(item);
        }
        map
    }
}

impl<'a, T: Named> IntoIterator for &'a NameMap<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

impl<T: Named + PartialEq> PartialEq for NameMap<T> {
    fn eq(&self, other: &Self) -> bool {
        self.items.len() == other.items.len()
            && self
                .items
                .iter()
                .all(|item| other.get(item.name()) == Some(item))
    }
}

impl<T: Named + Eq> Eq for NameMap<T> {}

impl<T: Named + Hash> Hash for NameMap<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Order-independent: combine per-item hashes commutatively so the
        // result agrees with the order-insensitive equality.
        let mut combined: u64 = 0;
        for item in &self.items {
            let mut h = DefaultHasher::new();
            item.hash(&mut h);
            combined = combined.wrapping_add(h.finish());
        }
        combined.hash(state);
        self.items.len().hash(state);
    }
}

/// Strip leading/trailing `/` and collapse repeated `/` before a namespace
/// goes on the wire or into a path. An empty result is invalid.
pub fn normalize_namespace(namespace: &str) -> Result<String, WbemError> {
    let parts: Vec<&str> = namespace.split('/').filter(|p| !p.is_empty()).collect();
    if parts.is_empty() {
        return Err(WbemError::model(format!(
            "namespace {namespace:?} is empty after normalization"
        )));
    }
    Ok(parts.join("/"))
}

// ---------------------------------------------------------------------------
// Object paths
// ---------------------------------------------------------------------------

/// One key of an object path: a property name and its scalar value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CimKeyBinding {
    pub name: String,
    pub value: CimScalar,
}

impl CimKeyBinding {
    pub fn new(name: &str, value: CimScalar) -> Self {
        Self {
            name: name.to_string(),
            value,
        }
    }
}

impl Named for CimKeyBinding {
    fn name(&self) -> &str {
        &self.name
    }
}

impl Hash for CimKeyBinding {
    fn hash<H: Hasher>(&self, state: &mut H) {
        fold(&self.name).hash(state);
        self.value.hash(state);
    }
}

/// An instance path: classname, keybindings, and optionally the namespace
/// and host that scope it.
///
/// The namespace is always stored normalized; `set_namespace` rejects
/// namespaces that normalize to nothing.
#[derive(Debug, Clone)]
pub struct CimInstanceName {
    classname: String,
    keybindings: NameMap<CimKeyBinding>,
    namespace: Option<String>,
    host: Option<String>,
}

impl CimInstanceName {
    pub fn new(classname: &str) -> Self {
        Self {
            classname: classname.to_string(),
            keybindings: NameMap::new(),
            namespace: None,
            host: None,
        }
    }

    /// Convenience constructor for the common string-keyed case.
    pub fn with_keys(classname: &str, keys: &[(&str, CimScalar)]) -> Self {
        let mut path = Self::new(classname);
        for (name, value) in keys {
            path.bind_key(name, value.clone());
        }
        path
    }

    pub fn classname(&self) -> &str {
        &self.classname
    }

    pub fn keybindings(&self) -> &NameMap<CimKeyBinding> {
        &self.keybindings
    }

    pub fn bind_key(&mut self, name: &str, value: CimScalar) {
        self.keybindings.insert(CimKeyBinding::new(name, value));
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn set_namespace(&mut self, namespace: &str) -> Result<(), WbemError> {
        self.namespace = Some(normalize_namespace(namespace)?);
        Ok(())
    }

    pub fn clear_namespace(&mut self) {
        self.namespace = None;
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn set_host(&mut self, host: &str) {
        self.host = Some(host.to_string());
    }
}

impl PartialEq for CimInstanceName {
    fn eq(&self, other: &Self) -> bool {
        eq_ci(&self.classname, &other.classname)
            && self.keybindings == other.keybindings
            && eq_ci_opt(&self.namespace, &other.namespace)
            && eq_ci_opt(&self.host, &other.host)
    }
}

impl Eq for CimInstanceName {}

impl Hash for CimInstanceName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        fold(&self.classname).hash(state);
        self.keybindings.hash(state);
        self.namespace.as_deref().map(fold).hash(state);
        self.host.as_deref().map(fold).hash(state);
    }
}

/// A class path, as returned by class-name enumerations.
#[derive(Debug, Clone)]
pub struct CimClassName {
    pub classname: String,
    pub namespace: Option<String>,
    pub host: Option<String>,
}

impl CimClassName {
    pub fn new(classname: &str) -> Self {
        Self {
            classname: classname.to_string(),
            namespace: None,
            host: None,
        }
    }
}

impl PartialEq for CimClassName {
    fn eq(&self, other: &Self) -> bool {
        eq_ci(&self.classname, &other.classname)
            && eq_ci_opt(&self.namespace, &other.namespace)
            && eq_ci_opt(&self.host, &other.host)
    }
}

impl Eq for CimClassName {}

impl Hash for CimClassName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        fold(&self.classname).hash(state);
        self.namespace.as_deref().map(fold).hash(state);
        self.host.as_deref().map(fold).hash(state);
    }
}

// ---------------------------------------------------------------------------
// Qualifiers
// ---------------------------------------------------------------------------

/// How an embedded-object property is flagged on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EmbeddedObject {
    #[default]
    None,
    Instance,
    Object,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CimQualifier {
    pub name: String,
    pub value: Option<CimValue>,
    pub cim_type: CimType,
    pub propagated: bool,
    pub overridable: Option<bool>,
    pub tosubclass: Option<bool>,
    pub toinstance: Option<bool>,
    pub translatable: Option<bool>,
}

impl CimQualifier {
    pub fn new(name: &str, value: CimValue) -> Self {
        let cim_type = value.cim_type().unwrap_or(CimType::String);
        Self {
            name: name.to_string(),
            value: Some(value),
            cim_type,
            propagated: false,
            overridable: None,
            tosubclass: None,
            toinstance: None,
            translatable: None,
        }
    }
}

impl Named for CimQualifier {
    fn name(&self) -> &str {
        &self.name
    }
}

impl Hash for CimQualifier {
    fn hash<H: Hasher>(&self, state: &mut H) {
        fold(&self.name).hash(state);
        self.value.hash(state);
        self.cim_type.hash(state);
        self.propagated.hash(state);
    }
}

/// A qualifier type declaration, as returned by qualifier enumerations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CimQualifierDeclaration {
    pub name: String,
    pub cim_type: CimType,
    pub value: Option<CimValue>,
    pub is_array: bool,
    pub array_size: Option<u32>,
    /// Meta-element names the qualifier may be applied to, as named by the
    /// `SCOPE` attributes that were set (`CLASS`, `PROPERTY`, ...).
    pub scopes: Vec<String>,
    pub overridable: Option<bool>,
    pub tosubclass: Option<bool>,
    pub toinstance: Option<bool>,
    pub translatable: Option<bool>,
}

impl Named for CimQualifierDeclaration {
    fn name(&self) -> &str {
        &self.name
    }
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CimProperty {
    pub name: String,
    pub value: Option<CimValue>,
    pub cim_type: CimType,
    pub reference_class: Option<String>,
    pub embedded_object: EmbeddedObject,
    pub is_array: bool,
    pub array_size: Option<u32>,
    pub propagated: bool,
    pub class_origin: Option<String>,
    pub qualifiers: NameMap<CimQualifier>,
}

impl CimProperty {
    /// A scalar property. The value's type must match `cim_type`.
    pub fn new(name: &str, cim_type: CimType, value: Option<CimScalar>) -> Result<Self, WbemError> {
        let prop = Self {
            name: name.to_string(),
            value: value.map(CimValue::Scalar),
            cim_type,
            reference_class: None,
            embedded_object: EmbeddedObject::None,
            is_array: false,
            array_size: None,
            propagated: false,
            class_origin: None,
            qualifiers: NameMap::new(),
        };
        prop.validated()
    }

    /// An array property. Element types must match `cim_type`.
    pub fn new_array(
        name: &str,
        cim_type: CimType,
        value: Option<Vec<CimScalar>>,
    ) -> Result<Self, WbemError> {
        let prop = Self {
            name: name.to_string(),
            value: value.map(CimValue::Array),
            cim_type,
            reference_class: None,
            embedded_object: EmbeddedObject::None,
            is_array: true,
            array_size: None,
            propagated: false,
            class_origin: None,
            qualifiers: NameMap::new(),
        };
        prop.validated()
    }

    /// A reference property. `reference_class` is required when building
    /// locally; decoded properties may legitimately lack it.
    pub fn reference(
        name: &str,
        reference_class: &str,
        value: Option<CimInstanceName>,
    ) -> Result<Self, WbemError> {
        let prop = Self {
            name: name.to_string(),
            value: value.map(|p| CimValue::Scalar(CimScalar::Reference(Box::new(p)))),
            cim_type: CimType::Reference,
            reference_class: Some(reference_class.to_string()),
            embedded_object: EmbeddedObject::None,
            is_array: false,
            array_size: None,
            propagated: false,
            class_origin: None,
            qualifiers: NameMap::new(),
        };
        prop.validated()
    }

    pub fn string(name: &str, value: &str) -> Self {
        Self {
            name: name.to_string(),
            value: Some(CimValue::Scalar(CimScalar::String(value.to_string()))),
            cim_type: CimType::String,
            reference_class: None,
            embedded_object: EmbeddedObject::None,
            is_array: false,
            array_size: None,
            propagated: false,
            class_origin: None,
            qualifiers: NameMap::new(),
        }
    }

    /// Check the shape invariants; used by constructors and the decoder.
    pub fn validated(self) -> Result<Self, WbemError> {
        if let Some(value) = &self.value {
            if value.is_array() != self.is_array {
                return Err(WbemError::model(format!(
                    "property {:?}: value shape disagrees with is_array={}",
                    self.name, self.is_array
                )));
            }
            if let CimValue::Array(items) = value {
                if let Some(bad) = items.iter().find(|i| i.cim_type() != self.cim_type) {
                    return Err(WbemError::model(format!(
                        "property {:?}: array element of type {} in a {} array",
                        self.name,
                        bad.cim_type(),
                        self.cim_type
                    )));
                }
            } else if let CimValue::Scalar(s) = value {
                if s.cim_type() != self.cim_type {
                    return Err(WbemError::model(format!(
                        "property {:?}: value of type {} declared as {}",
                        self.name,
                        s.cim_type(),
                        self.cim_type
                    )));
                }
            }
        }
        if self.array_size.is_some() && !self.is_array {
            return Err(WbemError::model(format!(
                "property {:?}: array_size on a non-array property",
                self.name
            )));
        }
        if self.reference_class.is_some() && self.cim_type != CimType::Reference {
            return Err(WbemError::model(format!(
                "property {:?}: reference_class on a {} property",
                self.name, self.cim_type
            )));
        }
        Ok(self)
    }
}

impl Named for CimProperty {
    fn name(&self) -> &str {
        &self.name
    }
}

impl PartialEq for CimProperty {
    fn eq(&self, other: &Self) -> bool {
        eq_ci(&self.name, &other.name)
            && self.value == other.value
            && self.cim_type == other.cim_type
            && eq_ci_opt(&self.reference_class, &other.reference_class)
            && self.embedded_object == other.embedded_object
            && self.is_array == other.is_array
            && self.array_size == other.array_size
            && self.propagated == other.propagated
            && eq_ci_opt(&self.class_origin, &other.class_origin)
            && self.qualifiers == other.qualifiers
    }
}

impl Eq for CimProperty {}

impl Hash for CimProperty {
    fn hash<H: Hasher>(&self, state: &mut H) {
        fold(&self.name).hash(state);
        self.value.hash(state);
        self.cim_type.hash(state);
        self.is_array.hash(state);
    }
}

// ---------------------------------------------------------------------------
// Instances
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CimInstance {
    pub classname: String,
    pub properties: NameMap<CimProperty>,
    pub qualifiers: NameMap<CimQualifier>,
    path: Option<CimInstanceName>,
}

impl CimInstance {
    pub fn new(classname: &str) -> Self {
        Self {
            classname: classname.to_string(),
            properties: NameMap::new(),
            qualifiers: NameMap::new(),
            path: None,
        }
    }

    pub fn path(&self) -> Option<&CimInstanceName> {
        self.path.as_ref()
    }

    /// Attach an object path. Its classname must match the instance's.
    pub fn set_path(&mut self, path: CimInstanceName) -> Result<(), WbemError> {
        if !eq_ci(path.classname(), &self.classname) {
            return Err(WbemError::model(format!(
                "path classname {:?} does not match instance classname {:?}",
                path.classname(),
                self.classname
            )));
        }
        self.path = Some(path);
        Ok(())
    }

    pub fn take_path(&mut self) -> Option<CimInstanceName> {
        self.path.take()
    }
}

impl PartialEq for CimInstance {
    fn eq(&self, other: &Self) -> bool {
        eq_ci(&self.classname, &other.classname)
            && self.properties == other.properties
            && self.qualifiers == other.qualifiers
            && self.path == other.path
    }
}

impl Eq for CimInstance {}

impl Hash for CimInstance {
    fn hash<H: Hasher>(&self, state: &mut H) {
        fold(&self.classname).hash(state);
        self.properties.hash(state);
        self.path.hash(state);
    }
}

// ---------------------------------------------------------------------------
// Classes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CimParameter {
    pub name: String,
    pub cim_type: CimType,
    pub reference_class: Option<String>,
    pub is_array: bool,
    pub array_size: Option<u32>,
    pub qualifiers: NameMap<CimQualifier>,
}

impl CimParameter {
    pub fn new(name: &str, cim_type: CimType) -> Self {
        Self {
            name: name.to_string(),
            cim_type,
            reference_class: None,
            is_array: false,
            array_size: None,
            qualifiers: NameMap::new(),
        }
    }
}

impl Named for CimParameter {
    fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CimMethod {
    pub name: String,
    pub return_type: CimType,
    pub parameters: NameMap<CimParameter>,
    pub class_origin: Option<String>,
    pub propagated: bool,
    pub qualifiers: NameMap<CimQualifier>,
}

impl CimMethod {
    pub fn new(name: &str, return_type: CimType) -> Self {
        Self {
            name: name.to_string(),
            return_type,
            parameters: NameMap::new(),
            class_origin: None,
            propagated: false,
            qualifiers: NameMap::new(),
        }
    }
}

impl Named for CimMethod {
    fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Clone)]
pub struct CimClass {
    pub classname: String,
    pub superclass: Option<String>,
    pub properties: NameMap<CimProperty>,
    pub methods: NameMap<CimMethod>,
    pub qualifiers: NameMap<CimQualifier>,
}

impl CimClass {
    pub fn new(classname: &str) -> Self {
        Self {
            classname: classname.to_string(),
            superclass: None,
            properties: NameMap::new(),
            methods: NameMap::new(),
            qualifiers: NameMap::new(),
        }
    }
}

impl PartialEq for CimClass {
    fn eq(&self, other: &Self) -> bool {
        eq_ci(&self.classname, &other.classname)
            && eq_ci_opt(&self.superclass, &other.superclass)
            && self.properties == other.properties
            && self.methods == other.methods
            && self.qualifiers == other.qualifiers
    }
}

impl Eq for CimClass {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn hash_of<T: Hash>(v: &T) -> u64 {
        let mut h = DefaultHasher::new();
        v.hash(&mut h);
        h.finish()
    }

    #[test]
    fn name_map_preserves_insertion_order_and_case() {
        let mut map = NameMap::new();
        map.insert(CimProperty::string("CreationClassName", "a"));
        map.insert(CimProperty::string("Name", "b"));
        let names: Vec<&str> = map.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["CreationClassName", "Name"]);
        // lookup is case-insensitive, spelling preserved
        assert_eq!(map.get("NAME").unwrap().name, "Name");
        assert_eq!(map.get("creationclassname").unwrap().name, "CreationClassName");
    }

    #[test]
    fn name_map_replaces_in_place() {
        let mut map = NameMap::new();
        map.insert(CimProperty::string("First", "1"));
        map.insert(CimProperty::string("Second", "2"));
        map.insert(CimProperty::string("FIRST", "changed"));
        assert_eq!(map.len(), 2);
        let names: Vec<&str> = map.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["FIRST", "Second"]);
    }

    #[test]
    fn name_map_remove_reindexes() {
        let mut map = NameMap::new();
        map.insert(CimProperty::string("A", "1"));
        map.insert(CimProperty::string("B", "2"));
        map.insert(CimProperty::string("C", "3"));
        assert!(map.remove("b").is_some());
        assert_eq!(map.len(), 2);
        assert_eq!(map.get("C").unwrap().name, "C");
        assert!(map.get("B").is_none());
    }

    #[test]
    fn name_map_equality_ignores_order() {
        let mut a = NameMap::new();
        a.insert(CimProperty::string("X", "1"));
        a.insert(CimProperty::string("Y", "2"));
        let mut b = NameMap::new();
        b.insert(CimProperty::string("Y", "2"));
        b.insert(CimProperty::string("X", "1"));
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
    }

    #[test]
    fn namespace_normalization() {
        assert_eq!(normalize_namespace("root/cimv2").unwrap(), "root/cimv2");
        assert_eq!(normalize_namespace("//root/mycim//").unwrap(), "root/mycim");
        assert_eq!(normalize_namespace("root///deep//x").unwrap(), "root/deep/x");
        assert!(normalize_namespace("///").is_err());
        assert!(normalize_namespace("").is_err());
    }

    #[test]
    fn instance_name_equality_is_case_insensitive() {
        let mut a = CimInstanceName::with_keys(
            "Mock_Person",
            &[("Name", CimScalar::String("Fritz".to_string()))],
        );
        a.set_namespace("root/cimv2").unwrap();
        let mut b = CimInstanceName::with_keys(
            "MOCK_person",
            &[("NAME", CimScalar::String("Fritz".to_string()))],
        );
        b.set_namespace("ROOT/CIMV2").unwrap();
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));

        let c = CimInstanceName::with_keys(
            "Mock_Person",
            &[("Name", CimScalar::String("fritz".to_string()))],
        );
        // key values are compared case-sensitively
        assert_ne!(a, c);
    }

    #[test]
    fn reference_keybindings_nest() {
        let inner = CimInstanceName::with_keys(
            "Mock_Disk",
            &[("Id", CimScalar::Uint32(7))],
        );
        let mut outer = CimInstanceName::new("Mock_Mount");
        outer.bind_key("Antecedent", CimScalar::Reference(Box::new(inner.clone())));
        match &outer.keybindings().get("antecedent").unwrap().value {
            CimScalar::Reference(path) => assert_eq!(**path, inner),
            other => panic!("expected reference, got {other:?}"),
        }
    }

    #[test]
    fn set_namespace_normalizes() {
        let mut path = CimInstanceName::new("Mock_Person");
        path.set_namespace("//root/mycim//").unwrap();
        assert_eq!(path.namespace(), Some("root/mycim"));
        assert!(path.set_namespace("//").is_err());
    }

    #[test]
    fn instance_path_classname_must_match() {
        let mut inst = CimInstance::new("Mock_Person");
        let ok = CimInstanceName::new("mock_PERSON");
        assert!(inst.set_path(ok).is_ok());
        let bad = CimInstanceName::new("Mock_Disk");
        assert!(matches!(inst.set_path(bad), Err(WbemError::Model(_))));
    }

    #[test]
    fn property_shape_invariants() {
        assert!(CimProperty::new(
            "P",
            CimType::Uint8,
            Some(CimScalar::String("x".to_string()))
        )
        .is_err());

        let arr = CimProperty::new_array(
            "L",
            CimType::Uint8,
            Some(vec![CimScalar::Uint8(1), CimScalar::Uint8(2)]),
        )
        .unwrap();
        assert!(arr.is_array);

        let mut bad = CimProperty::string("S", "v");
        bad.array_size = Some(4);
        assert!(bad.validated().is_err());

        let mut bad = CimProperty::string("S", "v");
        bad.reference_class = Some("Mock_Disk".to_string());
        assert!(bad.validated().is_err());
    }

    #[test]
    fn instance_equality_is_structural() {
        let mut a = CimInstance::new("Mock_Person");
        a.properties.insert(CimProperty::string("Name", "Fritz"));
        a.properties.insert(CimProperty::string("Address", "Fritz Town"));

        // property names differ in case and order; still equal
        let mut b = CimInstance::new("mock_person");
        b.properties.insert(CimProperty::string("ADDRESS", "Fritz Town"));
        b.properties.insert(CimProperty::string("name", "Fritz"));
        assert_eq!(a, b);

        // a differing value breaks equality
        let mut c = CimInstance::new("Mock_Person");
        c.properties.insert(CimProperty::string("Name", "Fritz"));
        c.properties.insert(CimProperty::string("Address", "Elsewhere"));
        assert_ne!(a, c);
    }
}
