//! Descriptor-driven JSON mapper

use crate::entity::{ChildRow, EntityGraph, Fields, NaturalKey};
use crate::mapper::{ChildMapping, MapError, MapResult, Mapper, MappingDescriptor};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Maps JSON documents using one descriptor per family
#[derive(Debug, Clone, Default)]
pub struct JsonMapper {
    descriptors: HashMap<String, MappingDescriptor>,
}

impl JsonMapper {
    pub fn new(descriptors: impl IntoIterator<Item = MappingDescriptor>) -> Self {
        Self {
            descriptors: descriptors
                .into_iter()
                .map(|d| (d.family.clone(), d))
                .collect(),
        }
    }

    pub fn descriptor(&self, family: &str) -> Option<&MappingDescriptor> {
        self.descriptors.get(family)
    }
}

impl Mapper for JsonMapper {
    fn map(&self, family: &str, content: &[u8]) -> MapResult<EntityGraph> {
        let descriptor = self
            .descriptors
            .get(family)
            .ok_or_else(|| MapError::UnknownFamily(family.to_string()))?;

        let document: Value = serde_json::from_slice(content)
            .map_err(|e| MapError::InvalidContent(e.to_string()))?;
        let object = document.as_object().ok_or_else(|| MapError::UnexpectedShape {
            family: family.to_string(),
            path: "$".to_string(),
            detail: "expected a JSON object".to_string(),
        })?;

        let mut unmapped = Vec::new();
        let known = descriptor.known_fields();
        unmapped.extend(
            object
                .keys()
                .filter(|key| !known.contains(key.as_str()))
                .cloned(),
        );

        let natural_key = natural_key(descriptor, object)?;
        let fields = copy_fields(object, &descriptor.fields);

        let mut children = Vec::new();
        for mapping in &descriptor.children {
            children.extend(map_children(family, object, mapping, "", &mut unmapped)?);
        }

        if !unmapped.is_empty() {
            unmapped.sort();
            return Err(MapError::SchemaDrift {
                family: family.to_string(),
                version: descriptor.version,
                unmapped,
            });
        }

        let mut graph =
            EntityGraph::new(family, natural_key, fields).with_children(children);
        graph.mapping_version = descriptor.version;
        Ok(graph)
    }
}

fn natural_key(descriptor: &MappingDescriptor, object: &Map<String, Value>) -> MapResult<NaturalKey> {
    let mut components = Vec::with_capacity(descriptor.natural_key.len());

    for field in &descriptor.natural_key {
        let value = match object.get(field) {
            Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
            Some(Value::Number(n)) => n.to_string(),
            _ => {
                return Err(MapError::MissingNaturalKey {
                    family: descriptor.family.clone(),
                    field: field.clone(),
                })
            }
        };
        components.push((field.clone(), value));
    }

    Ok(NaturalKey::new(components))
}

/// Copies the named fields that are present in the source
fn copy_fields(object: &Map<String, Value>, names: &[String]) -> Fields {
    names
        .iter()
        .filter_map(|name| object.get(name).map(|v| (name.clone(), v.clone())))
        .collect()
}

fn map_children(
    family: &str,
    parent: &Map<String, Value>,
    mapping: &ChildMapping,
    prefix: &str,
    unmapped: &mut Vec<String>,
) -> MapResult<Vec<ChildRow>> {
    let path = format!("{}{}[]", prefix, mapping.source);

    let items = match parent.get(&mapping.source) {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Array(items)) => items,
        Some(_) => {
            return Err(MapError::UnexpectedShape {
                family: family.to_string(),
                path,
                detail: "expected an array".to_string(),
            })
        }
    };

    let known = mapping.known_fields();
    let mut rows = Vec::with_capacity(items.len());

    for item in items {
        let object = item.as_object().ok_or_else(|| MapError::UnexpectedShape {
            family: family.to_string(),
            path: path.clone(),
            detail: "expected an array of objects".to_string(),
        })?;

        for key in object.keys() {
            if !known.contains(key.as_str()) {
                let name = format!("{}.{}", path, key);
                if !unmapped.contains(&name) {
                    unmapped.push(name);
                }
            }
        }

        let mut nested = Vec::new();
        for child in &mapping.children {
            nested.extend(map_children(
                family,
                object,
                child,
                &format!("{}.", path),
                unmapped,
            )?);
        }

        rows.push(
            ChildRow::new(mapping.kind.clone(), copy_fields(object, &mapping.fields))
                .with_children(nested),
        );
    }

    Ok(rows)
}
