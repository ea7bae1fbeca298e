//! Store-visible annotation and label keys.

/// Holds `{"pristine": "<base64 of gzip of JSON>"}`.
pub const MANAGED: &str = "kfold.dev/managed";

/// Objects whose value equals the run's tag and that are not in the desired set get deleted.
pub const GC_TAG: &str = "kfold.dev/garbage-collect-tag";

/// `auto` (default if absent) or `ignore`.
pub const GC_STRATEGY: &str = "kfold.dev/garbage-collect-strategy";

/// Component the object was declared in.
pub const COMPONENT: &str = "kfold.dev/component";

pub const LABEL_DEPLOY_MANAGER: &str = "app.kubernetes.io/deploy-manager";
pub const DEPLOY_MANAGER: &str = "kfold";

pub const GC_STRATEGY_AUTO: &str = "auto";
pub const GC_STRATEGY_IGNORE: &str = "ignore";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcStrategy {
    Auto,
    Ignore,
    /// Unrecognised values never collect.
    Other,
}

impl GcStrategy {
    pub fn from_annotation(value: Option<&str>) -> Self {
        match value {
            None | Some(GC_STRATEGY_AUTO) => GcStrategy::Auto,
            Some(GC_STRATEGY_IGNORE) => GcStrategy::Ignore,
            Some(_) => GcStrategy::Other,
        }
    }
}
