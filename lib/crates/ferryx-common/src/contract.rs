/// Coordinator hub contract shared with the ferryx coordinator.
pub mod hub {
    /// Path of the deploy hub, appended to the configured coordinator URL.
    pub const PATH: &str = "/hubs/deploy";

    /// Server-to-worker event carrying a `DeployCommand` payload.
    pub const DEPLOY_EVENT: &str = "NewDeploy";

    /// Worker-to-server call issued after every (re)connect.
    /// Arguments: `[group]`
    pub const JOIN_GROUP: &str = "JoinGroup";

    /// Fixed subject claim of tokens minted from a raw shared key.
    pub const TOKEN_SUBJECT: &str = "ferryx-worker";
}

/// On-disk layout of operation directories.
pub mod operation {
    /// Default operation root; one subdirectory per sanitized group.
    pub const DEFAULT_ROOT: &str = "/ferryx/operation";

    /// Operator-managed template inside each group directory.
    pub const TEMPLATE_FILE: &str = "run.sh";

    /// Rendered scripts are written as `runtemp.<id>.sh` next to the template.
    pub const TEMP_PREFIX: &str = "runtemp.";
    pub const TEMP_SUFFIX: &str = ".sh";

    /// Fallback group directory name for empty or fully invalid group names.
    pub const DEFAULT_GROUP: &str = "default";
}

/// Placeholder grammar understood by the template renderer.
pub mod placeholder {
    pub const ENV: &str = "{{ferryx_Env}}";
    pub const TARGET: &str = "{{ferryx_Target}}";
    pub const TAG: &str = "{{ferryx_Tag}}";
    pub const GROUP: &str = "{{ferryx_Group}}";

    /// Prefix of path placeholders: `{{ferryx_Meta.<dotted.path>}}`.
    pub const META_PREFIX: &str = "{{ferryx_Meta.";
}
