use crate::definition::models::{NodeBody, NodeSpec};
use crate::definition::DefinitionError;
use crate::error::ExpansionError;
use crate::execution::lazy::LazyContext;
use crate::tree::{Node, PATH_SEPARATOR};

use std::fs;
use std::path::{Path, PathBuf};

/// A loaded pipeline definition
#[derive(Debug, Clone)]
pub struct Definition {
    /// Display name from the root's `name` field
    pub name: Option<String>,
    pub spec: NodeSpec,
    pub root: Node,
}

/// Parser for canopy pipeline YAML files.
pub struct DefinitionParser;

impl DefinitionParser {
    /// Parse, validate and build a definition from a file path.
    ///
    /// Lazy entries resolve their files relative to this file's directory.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Definition, DefinitionError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| DefinitionError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::parse(&content, &base_dir)
    }

    /// Parse, validate and build a definition from a YAML string.
    pub fn parse(content: &str, base_dir: &Path) -> Result<Definition, DefinitionError> {
        let spec = Self::parse_spec(content)?;
        Self::validate(&spec)?;
        let root = Self::build(&spec, base_dir)?;
        Ok(Definition {
            name: spec.name.clone(),
            spec,
            root,
        })
    }

    /// Parse without validating.
    pub fn parse_spec(content: &str) -> Result<NodeSpec, DefinitionError> {
        let spec: NodeSpec = serde_yaml::from_str(content)?;
        Ok(spec)
    }

    /// Validate a parsed definition for structural correctness.
    pub fn validate(spec: &NodeSpec) -> Result<(), DefinitionError> {
        Self::validate_node(spec, &PATH_SEPARATOR.to_string())
    }

    fn validate_node(spec: &NodeSpec, path: &str) -> Result<(), DefinitionError> {
        let invalid = |message: String| DefinitionError::Invalid {
            path: path.to_string(),
            message,
        };

        let bodies = spec.bodies();
        let body = match bodies.as_slice() {
            [body] => *body,
            [] => {
                return Err(invalid(
                    "node must have one of 'serial', 'parallel', 'exec' or 'lazy'".to_string(),
                ))
            }
            _ => {
                return Err(invalid(
                    "node cannot combine 'serial', 'parallel', 'exec' or 'lazy'".to_string(),
                ))
            }
        };

        if spec.stop_on_error.is_some() && !matches!(body, NodeBody::Serial(_)) {
            return Err(invalid(
                "'stop_on_error' is only meaningful on serial nodes".to_string(),
            ));
        }

        let children = match body {
            NodeBody::Serial(children) | NodeBody::Parallel(children) => children,
            NodeBody::Exec(cmd) if cmd.trim().is_empty() => {
                return Err(invalid("'exec' command is empty".to_string()))
            }
            NodeBody::Lazy(file) if file.trim().is_empty() => {
                return Err(invalid("'lazy' file is empty".to_string()))
            }
            NodeBody::Exec(_) | NodeBody::Lazy(_) => return Ok(()),
        };

        let mut seen = std::collections::HashSet::new();
        for (index, child) in children.iter().enumerate() {
            let name = child
                .name
                .as_deref()
                .ok_or_else(|| invalid(format!("child {} has no 'name'", index)))?;
            crate::tree::node::validate_name(name)?;
            if !seen.insert(name) {
                return Err(invalid(format!("duplicate child name '{}'", name)));
            }
            Self::validate_node(child, &join(path, name))?;
        }
        Ok(())
    }

    /// Build the node tree for a validated definition.
    pub fn build(spec: &NodeSpec, base_dir: &Path) -> Result<Node, DefinitionError> {
        let mut node = match spec.bodies().first() {
            Some(NodeBody::Serial(children)) => {
                let mut node = Node::serial();
                Self::add_children(&mut node, children, base_dir)?;
                node
            }
            Some(NodeBody::Parallel(children)) => {
                let mut node = Node::parallel();
                Self::add_children(&mut node, children, base_dir)?;
                node
            }
            Some(NodeBody::Exec(cmd)) => Node::exec(*cmd),
            Some(NodeBody::Lazy(file)) => lazy_file_node(file, base_dir),
            None => {
                return Err(DefinitionError::Invalid {
                    path: spec.name.clone().unwrap_or_default(),
                    message: "node has no body".to_string(),
                })
            }
        };

        if let Some(image) = &spec.image {
            node = node.with_image(image.clone());
        }
        if let Some(reuse) = spec.reuse {
            node = node.with_reuse(reuse);
        }
        if let Some(stop_on_error) = spec.stop_on_error {
            node = node.with_stop_on_error(stop_on_error);
        }
        if let Some(doc) = &spec.doc {
            node = node.with_doc(doc.clone());
        }
        if let Some(cpu) = spec.cpu {
            node = node.with_cpu(cpu);
        }
        if let Some(mem) = spec.mem {
            node = node.with_mem(mem);
        }
        if let Some(requires_docker) = spec.requires_docker {
            node = node.with_requires_docker(requires_docker);
        }
        Ok(node
            .with_skip(spec.skip)
            .with_envs(spec.env.clone()))
    }

    fn add_children(
        node: &mut Node,
        children: &[NodeSpec],
        base_dir: &Path,
    ) -> Result<(), DefinitionError> {
        for child in children {
            let name = child.name.clone().ok_or_else(|| DefinitionError::Invalid {
                path: PATH_SEPARATOR.to_string(),
                message: "child has no 'name'".to_string(),
            })?;
            node.add(name, Self::build(child, base_dir)?)?;
        }
        Ok(())
    }
}

fn join(parent: &str, name: &str) -> String {
    if parent.ends_with(PATH_SEPARATOR) {
        format!("{}{}", parent, name)
    } else {
        format!("{}{}{}", parent, PATH_SEPARATOR, name)
    }
}

/// Lazy node that loads `file` when it expands.
///
/// The file is looked up in the scope's workspace first, so earlier leaves
/// in the same scope can generate it, then next to the definition.
fn lazy_file_node(file: &str, base_dir: &Path) -> Node {
    let file = PathBuf::from(file);
    let base_dir = base_dir.to_path_buf();
    Node::lazy(move |ctx: &LazyContext| {
        let path = locate(&file, ctx.workspace.as_deref(), &base_dir);
        let definition = DefinitionParser::from_file(&path).map_err(ExpansionError::from)?;
        Ok(definition.root)
    })
}

fn locate(file: &Path, workspace: Option<&Path>, base_dir: &Path) -> PathBuf {
    if file.is_absolute() {
        return file.to_path_buf();
    }
    if let Some(workspace) = workspace {
        let candidate = workspace.join(file);
        if candidate.is_file() {
            return candidate;
        }
    }
    base_dir.join(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::scope::ScopeId;
    use crate::tree::{ContainerReuse, NodeKind};
    use tempfile::TempDir;

    const PIPELINE: &str = r#"
name: demo
image: python:3.12
env:
  STAGE: ci
serial:
  - name: fetch
    exec: ./fetch.sh
    doc: download inputs
  - name: tests
    reuse: new
    parallel:
      - name: unit
        exec: pytest tests/unit
        cpu: 2
      - name: generated
        lazy: generated.yaml
  - name: cleanup
    exec: rm -rf build
    skip: true
"#;

    fn context(workspace: Option<PathBuf>) -> LazyContext {
        LazyContext {
            path: "/tests/generated".to_string(),
            args: Vec::new(),
            run_id: "run".to_string(),
            scope: ScopeId::new("run:/tests"),
            workspace,
            store: None,
        }
    }

    fn generator(node: &Node) -> crate::tree::LazyGenerator {
        match node.kind() {
            NodeKind::Lazy(generator) => generator.clone(),
            other => panic!("expected lazy node, got {}", other.label()),
        }
    }

    #[test]
    fn test_parse_pipeline() {
        let definition = DefinitionParser::parse(PIPELINE, Path::new(".")).unwrap();
        let root = &definition.root;

        assert_eq!(definition.name.as_deref(), Some("demo"));
        assert!(matches!(root.kind(), NodeKind::Serial));
        assert_eq!(root.attrs().image.as_ref().unwrap().as_str(), "python:3.12");
        assert_eq!(root.attrs().env.get("STAGE").map(String::as_str), Some("ci"));

        let names: Vec<&str> = root.children().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["fetch", "tests", "cleanup"]);

        let tests = root.get("tests").unwrap();
        assert_eq!(tests.attrs().reuse, ContainerReuse::New);
        assert_eq!(tests.get("unit").unwrap().attrs().resources.cpu, Some(2.0));
        assert!(matches!(tests.get("generated").unwrap().kind(), NodeKind::Lazy(_)));
        assert!(root.get("cleanup").unwrap().attrs().skip);
        assert_eq!(
            root.get("fetch").unwrap().attrs().doc.as_deref(),
            Some("download inputs")
        );
    }

    #[test]
    fn test_reject_missing_and_combined_bodies() {
        let err = DefinitionParser::parse("name: x\nimage: y\n", Path::new(".")).unwrap_err();
        assert!(err.to_string().contains("must have one of"));

        let err = DefinitionParser::parse("exec: a\nlazy: b.yaml\n", Path::new(".")).unwrap_err();
        assert!(err.to_string().contains("cannot combine"));
    }

    #[test]
    fn test_reject_bad_children() {
        let nameless = "serial:\n  - exec: a\n";
        let err = DefinitionParser::parse(nameless, Path::new(".")).unwrap_err();
        assert!(err.to_string().contains("has no 'name'"));

        let duplicate = "parallel:\n  - name: a\n    exec: a\n  - name: a\n    exec: b\n";
        let err = DefinitionParser::parse(duplicate, Path::new(".")).unwrap_err();
        assert!(err.to_string().contains("duplicate child name 'a'"));

        let slash = "serial:\n  - name: a/b\n    exec: a\n";
        assert!(matches!(
            DefinitionParser::parse(slash, Path::new(".")).unwrap_err(),
            DefinitionError::Tree(_)
        ));
    }

    #[test]
    fn test_stop_on_error_only_on_serial() {
        let yaml = "parallel:\n  - name: a\n    exec: a\nstop_on_error: false\n";
        let err = DefinitionParser::parse(yaml, Path::new(".")).unwrap_err();
        assert!(err.to_string().contains("only meaningful on serial"));

        let yaml = "serial:\n  - name: a\n    exec: a\nstop_on_error: false\n";
        let definition = DefinitionParser::parse(yaml, Path::new(".")).unwrap();
        assert!(!definition.root.attrs().stop_on_error);
    }

    #[test]
    fn test_unknown_field_is_yaml_error() {
        let err = DefinitionParser::parse("exec: a\ncommand: b\n", Path::new(".")).unwrap_err();
        assert!(matches!(err, DefinitionError::Yaml(_)));
    }

    #[test]
    fn test_lazy_file_prefers_workspace() {
        let definition_dir = TempDir::new().unwrap();
        let workspace = TempDir::new().unwrap();
        fs::write(
            definition_dir.path().join("gen.yaml"),
            "serial:\n  - name: from_definition\n    exec: a\n",
        )
        .unwrap();

        let node = lazy_file_node("gen.yaml", definition_dir.path());
        let generator = generator(&node);

        let expanded = (generator.func)(&context(Some(workspace.path().to_path_buf()))).unwrap();
        assert!(expanded.child("from_definition").is_some());

        fs::write(
            workspace.path().join("gen.yaml"),
            "parallel:\n  - name: from_workspace\n    exec: b\n",
        )
        .unwrap();
        let expanded = (generator.func)(&context(Some(workspace.path().to_path_buf()))).unwrap();
        assert!(expanded.child("from_workspace").is_some());
    }

    #[test]
    fn test_lazy_missing_file_is_expansion_error() {
        let dir = TempDir::new().unwrap();
        let node = lazy_file_node("missing.yaml", dir.path());
        let err = (generator(&node).func)(&context(None)).unwrap_err();
        assert!(err.message.contains("missing.yaml"));
    }

    #[test]
    fn test_from_file() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("pipeline.yaml");
        fs::write(&file, PIPELINE).unwrap();

        let definition = DefinitionParser::from_file(&file).unwrap();
        assert_eq!(definition.root.children().count(), 3);

        let err = DefinitionParser::from_file(dir.path().join("nope.yaml")).unwrap_err();
        assert!(matches!(err, DefinitionError::Io { .. }));
    }
}
