use crate::output;

use std::collections::BTreeSet;
use std::path::PathBuf;

use clap::Args;
use color_eyre::eyre::{bail, WrapErr};
use color_eyre::Result;

use canopy_engine::{DefinitionParser, NodeKind, ScopeTable, Tree};

/// Validate a definition YAML file
#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Path to the definition YAML file
    pub definition: PathBuf,
}

pub fn execute(args: ValidateArgs) -> Result<()> {
    let path = &args.definition;
    if !path.exists() {
        bail!("Definition file not found: {}", path.display());
    }

    output::status("Validating", &format!("{}", path.display()));

    let content = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("failed to read {}", path.display()))?;
    let spec = match DefinitionParser::parse_spec(&content) {
        Ok(spec) => spec,
        Err(e) => {
            output::error(&format!("Parse error: {}", e));
            std::process::exit(1);
        }
    };
    output::check("YAML syntax valid");

    if let Err(e) = DefinitionParser::validate(&spec) {
        output::error(&e.to_string());
        std::process::exit(1);
    }

    let base_dir = path
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    let root = match DefinitionParser::build(&spec, &base_dir) {
        Ok(root) => root,
        Err(e) => {
            output::error(&format!("Construction error: {}", e));
            std::process::exit(1);
        }
    };

    let tree = Tree::new(root);
    let counts = Counts::of(&tree);
    output::check(&format!(
        "Structure: {} groups, {} leaves, {} lazy nodes",
        counts.groups, counts.leaves, counts.lazy
    ));

    let scopes: BTreeSet<_> = ScopeTable::new("validate")
        .preview(&tree)?
        .into_iter()
        .map(|(_, scope)| scope)
        .collect();
    output::check(&format!("Static leaves resolve to {} scope(s)", scopes.len()));

    println!();
    output::success("Definition is valid");

    Ok(())
}

#[derive(Debug, Default, PartialEq)]
struct Counts {
    groups: usize,
    leaves: usize,
    lazy: usize,
}

impl Counts {
    fn of(tree: &Tree) -> Self {
        let mut counts = Counts::default();
        for id in tree.preorder() {
            match tree.kind(id) {
                NodeKind::Serial | NodeKind::Parallel => counts.groups += 1,
                NodeKind::Exec(_) => counts.leaves += 1,
                NodeKind::Lazy(_) => counts.lazy += 1,
            }
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_counts_by_kind() {
        let yaml = r#"
parallel:
  - name: unit
    exec: make test
  - name: suite
    serial:
      - name: generated
        lazy: suite.yaml
      - name: lint
        exec: make lint
"#;
        let definition = DefinitionParser::parse(yaml, Path::new(".")).unwrap();
        let counts = Counts::of(&Tree::new(definition.root));
        assert_eq!(
            counts,
            Counts {
                groups: 2,
                leaves: 2,
                lazy: 1,
            }
        );
    }
}
