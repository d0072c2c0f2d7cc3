use crate::tree::ContainerReuse;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A node as written in a pipeline YAML file.
///
/// Exactly one of `serial`, `parallel`, `exec` and `lazy` must be present.
///
/// ```yaml
/// name: build and test
/// image: python:3.12
/// serial:
///   - name: fetch
///     exec: ./fetch.sh
///   - name: tests
///     parallel:
///       - name: unit
///         exec: pytest tests/unit
///       - name: generated
///         lazy: generated/tests.yaml
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeSpec {
    /// Name under the parent; optional only on the root
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub serial: Option<Vec<NodeSpec>>,

    #[serde(default)]
    pub parallel: Option<Vec<NodeSpec>>,

    /// Shell command of an Exec leaf
    #[serde(default)]
    pub exec: Option<String>,

    /// YAML file loaded when the Lazy node expands
    #[serde(default)]
    pub lazy: Option<String>,

    #[serde(default)]
    pub image: Option<String>,

    #[serde(default)]
    pub reuse: Option<ContainerReuse>,

    #[serde(default)]
    pub skip: bool,

    /// Serial nodes only
    #[serde(default)]
    pub stop_on_error: Option<bool>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default)]
    pub doc: Option<String>,

    #[serde(default)]
    pub cpu: Option<f64>,

    /// Memory hint in GB
    #[serde(default)]
    pub mem: Option<f64>,

    #[serde(default)]
    pub requires_docker: Option<bool>,
}

/// The variant a [`NodeSpec`] describes
#[derive(Debug, Clone, Copy)]
pub enum NodeBody<'a> {
    Serial(&'a [NodeSpec]),
    Parallel(&'a [NodeSpec]),
    Exec(&'a str),
    Lazy(&'a str),
}

impl NodeSpec {
    /// The declared variants, in declaration order
    pub fn bodies(&self) -> Vec<NodeBody<'_>> {
        let mut bodies = Vec::new();
        if let Some(children) = &self.serial {
            bodies.push(NodeBody::Serial(children));
        }
        if let Some(children) = &self.parallel {
            bodies.push(NodeBody::Parallel(children));
        }
        if let Some(cmd) = &self.exec {
            bodies.push(NodeBody::Exec(cmd));
        }
        if let Some(file) = &self.lazy {
            bodies.push(NodeBody::Lazy(file));
        }
        bodies
    }
}
