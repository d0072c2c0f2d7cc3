use std::collections::HashMap;
use std::path::PathBuf;

use clap::Args;
use color_eyre::eyre::bail;
use color_eyre::Result;

use canopy_engine::{ContainerReuse, DefinitionParser, ScopeTable, Tree};

/// Print a definition's tree with kinds, reuse annotations and scopes
#[derive(Args, Debug)]
pub struct ShowArgs {
    /// Path to the definition YAML file
    pub definition: PathBuf,

    /// Run identifier used in the scope preview
    #[arg(long, value_name = "ID", default_value = "preview")]
    pub run_id: String,
}

pub fn execute(args: ShowArgs) -> Result<()> {
    if !args.definition.exists() {
        bail!("Definition file not found: {}", args.definition.display());
    }

    let definition = DefinitionParser::from_file(&args.definition)?;
    if let Some(name) = &definition.name {
        println!("{}", name);
    }
    print!("{}", render(&Tree::new(definition.root), &args.run_id)?);
    Ok(())
}

/// Tree rendering annotated with the scope each leaf will run in
fn render(tree: &Tree, run_id: &str) -> Result<String> {
    let scopes: HashMap<_, _> = ScopeTable::new(run_id).preview(tree)?.into_iter().collect();

    Ok(tree.render(|id| {
        let attrs = tree.attrs(id);
        let mut line = format!("[{}]", tree.kind(id).label());
        if attrs.reuse != ContainerReuse::Inherit {
            line.push_str(&format!(" reuse={}", attrs.reuse));
        }
        if let Some(image) = &attrs.image {
            line.push_str(&format!(" image={}", image));
        }
        if attrs.skip {
            line.push_str(" (skip)");
        }
        if let Some(scope) = scopes.get(&id) {
            line.push_str(&format!(" scope={}", scope));
        }
        if let Some(doc) = &attrs.doc {
            line.push_str(&format!("  # {}", doc));
        }
        line
    }))
}
