use anyhow::{bail, Context, Result};
use clap::{command, Parser};
use cryptpilot_provision::config::{BootConfig, PassphraseConfig, PathsConfig, ProvisionConfig};
use documented::DocumentedFields;
use shadow_rs::shadow;
use toml_edit::{Decor, DocumentMut, RawString, Table};

shadow!(build);

use crate::build::CLAP_LONG_VERSION;

/// Prints an annotated provision.toml with every setting at its default value.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
#[clap(long_version = CLAP_LONG_VERSION)]
pub struct Args {
    /// Include a sample `install_command` for the word list.
    #[clap(long)]
    pub with_install_command: bool,
}

trait AsAnnotatedToml {
    fn as_annotated_toml(&self) -> Result<DocumentMut>;
}

impl AsAnnotatedToml for ProvisionConfig {
    fn as_annotated_toml(&self) -> Result<DocumentMut> {
        let mut toml = toml_edit::ser::to_string_pretty(self)?.parse::<DocumentMut>()?;

        annotate_toml_table::<ProvisionConfig>(toml.as_table_mut())
            .context("Failed to annotate `ProvisionConfig`")?;
        if let Some(item) = toml.get_mut("paths").and_then(|item| item.as_table_mut()) {
            annotate_toml_table::<PathsConfig>(item).context("Failed to annotate `PathsConfig`")?;
        };
        if let Some(item) = toml.get_mut("boot").and_then(|item| item.as_table_mut()) {
            annotate_toml_table::<BootConfig>(item).context("Failed to annotate `BootConfig`")?;
        };
        if let Some(item) = toml.get_mut("passphrase").and_then(|item| item.as_table_mut()) {
            annotate_toml_table::<PassphraseConfig>(item)
                .context("Failed to annotate `PassphraseConfig`")?;
        };

        Ok(toml)
    }
}

fn append_docs_as_toml_comments(decor: &mut Decor, docs: &str) {
    let old_prefix = decor
        .prefix()
        .and_then(RawString::as_str)
        .unwrap_or_default();

    let comments = docs
        .lines()
        .map(|l| {
            if l.is_empty() {
                "#\n".into()
            } else {
                format!("# {l}\n")
            }
        })
        .collect::<String>();

    let new_prefix = match old_prefix.lines().last() {
        None => format!("{old_prefix}{comments}"),
        Some("") => format!("{old_prefix}{comments}"),
        Some(_) => format!("{old_prefix}#\n{comments}"),
    };
    decor.set_prefix(new_prefix);
}

/// Inserts the doc comments of the fields of `T` as comments above the
/// matching keys of `table`.
///
/// Not recursive: sub-tables get the docs of their field on `T`, their own
/// keys are left alone.
fn annotate_toml_table<T>(table: &mut Table) -> Result<()>
where
    T: DocumentedFields,
{
    use toml_edit::Item as I;

    for (mut key, value) in table.iter_mut() {
        let field_name = key.get();
        let Ok(docs) = T::get_field_docs(field_name) else {
            // ignore fields not known to `T`
            continue;
        };

        match value {
            I::None => bail!("Encountered a `None` key unexpectedly"),
            I::Value(_) => append_docs_as_toml_comments(key.leaf_decor_mut(), docs),
            I::Table(sub_table) => append_docs_as_toml_comments(sub_table.decor_mut(), docs),
            I::ArrayOfTables(array) => {
                let first_table = array
                    .iter_mut()
                    .next()
                    .context("Array of table should not be empty")?;
                append_docs_as_toml_comments(first_table.decor_mut(), docs);
            }
        }
    }

    Ok(())
}

pub fn get_provision_config(with_install_command: bool) -> ProvisionConfig {
    let mut config = ProvisionConfig::default();
    if with_install_command {
        config.passphrase.install_command = Some(
            ["apt-get", "install", "-y", "wamerican"]
                .into_iter()
                .map(Into::into)
                .collect(),
        );
    }
    config
}

fn main() -> Result<()> {
    let args = Args::parse();

    let doc = get_provision_config(args.with_install_command).as_annotated_toml()?;

    print!("{doc}");
    Ok(())
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn test_template_is_annotated_and_parses_back() -> Result<()> {
        let doc = get_provision_config(true).as_annotated_toml()?.to_string();

        assert!(doc.contains("# Number of words in the generated passphrase."));
        assert!(doc.contains("# Locations of the system files"));
        let config: ProvisionConfig = toml::from_str(&doc)?;
        assert_eq!(config, get_provision_config(true));
        Ok(())
    }
}
