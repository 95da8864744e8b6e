use serde::Deserialize;

use crate::meta::MetaValue;

/// A deployment request pushed by the coordinator to a group.
///
/// The coordinator serialises camelCase; PascalCase names are accepted too.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployCommand {
    #[serde(default, alias = "Env")]
    pub env: String,
    #[serde(default, alias = "Target")]
    pub target: String,
    #[serde(default, alias = "Tag")]
    pub tag: Option<String>,
    #[serde(default, alias = "Meta")]
    pub meta: Option<MetaValue>,
}
