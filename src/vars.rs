use minijinja::Environment;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::Path, path::PathBuf};

use crate::config::ConfigError;

/// Values substituted into `${ name }` placeholders of the config file.
#[derive(Debug, Default, Clone)]
pub struct DesplegarVars {
    inner: HashMap<String, String>,
}

impl<'de> Deserialize<'de> for DesplegarVars {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let inner = HashMap::deserialize(deserializer)?;
        Ok(Self { inner })
    }
}

impl Serialize for DesplegarVars {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.inner.serialize(serializer)
    }
}

/// Files next to the config that match desplegar.vars | *.desplegar.vars
/// Sorted
fn list_vars_files(config: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let search_dir = config.parent().map_or(Path::new("."), |p| {
        if p.as_os_str().is_empty() {
            Path::new(".")
        } else {
            p
        }
    });
    if let Ok(entries) = std::fs::read_dir(search_dir) {
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if let Some(file_name) = path.file_name().and_then(|s| s.to_str()) {
                if file_name == "desplegar.vars" || file_name.ends_with(".desplegar.vars") {
                    files.push(path);
                }
            }
        }
    }

    files.sort(); // Later files override earlier ones
    files
}

impl DesplegarVars {
    fn try_init_from_string(val: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(val)?)
    }

    fn combine(vars: Vec<Self>) -> Self {
        let mut combined_inner = HashMap::new();
        vars.into_iter().for_each(|var_set| {
            combined_inner.extend(var_set.inner);
        });
        Self {
            inner: combined_inner,
        }
    }

    /// Reads every vars file next to `config`. Unreadable or malformed
    /// files are logged and skipped.
    pub fn try_init(config: &Path) -> Self {
        let mut vars = Vec::new();
        for vars_file in list_vars_files(config) {
            match std::fs::read_to_string(&vars_file) {
                Ok(contents) => match Self::try_init_from_string(&contents) {
                    Ok(this_vars) => vars.push(this_vars),
                    Err(e) => log::error!("Error parsing vars file {vars_file:?}: {e}"),
                },
                Err(e) => log::error!("Error reading vars file {vars_file:?}: {e}"),
            }
        }
        Self::combine(vars)
    }
}

pub fn render_template(template_str: &str, vars: &DesplegarVars) -> Result<String, minijinja::Error> {
    let mut env = Environment::new();

    let syntax = minijinja::syntax::SyntaxConfig::builder()
        .variable_delimiters("${", "}")
        .build()?;

    env.set_syntax(syntax);
    env.set_undefined_behavior(minijinja::UndefinedBehavior::Strict);

    let template = env.template_from_str(template_str)?;
    template.render(vars)
}
