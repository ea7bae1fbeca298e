//! `environments.yaml`: environment name → cluster context, namespace and manifests.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Environments {
    #[serde(default)]
    pub environments: BTreeMap<String, Environment>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Environment {
    /// kubeconfig context; the current one when absent.
    pub context: Option<String>,
    pub namespace: Option<String>,
    /// Manifest files or directories used when none are given on the command line.
    #[serde(default)]
    pub manifests: Vec<PathBuf>,
}

/// What a run targets once the environment is resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub context: Option<String>,
    pub namespace: String,
    pub manifests: Vec<PathBuf>,
}

impl Environments {
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing environments file")
    }

    /// A missing file is not an error; every environment then targets the
    /// current context.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::from_yaml(&text).with_context(|| format!("in {}", path.display())).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
        }
    }

    pub fn resolve(&self, name: &str) -> Result<Target> {
        let env = self.environments.get(name).ok_or_else(|| {
            let known: Vec<&str> = self.environments.keys().map(String::as_str).collect();
            anyhow!("unknown environment {name} (known: {})", known.join(", "))
        })?;
        Ok(Target {
            context: env.context.clone(),
            namespace: env.namespace.clone().unwrap_or_else(|| "default".to_string()),
            manifests: env.manifests.clone(),
        })
    }
}

/// Target used without an environments file.
pub fn ambient_target(namespace: Option<String>) -> Target {
    Target { context: None, namespace: namespace.unwrap_or_else(|| "default".to_string()), manifests: Vec::new() }
}
