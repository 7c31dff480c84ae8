//! Database CRD definition
//!
//! A Database resource declares one managed database instance. The operator
//! provisions the backing database through the configured provider and
//! publishes its connection details as an `ExternalName` Service and a
//! ConfigMap, both named after the resource.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// API group of the Database CRD
pub const GROUP: &str = "aws.pmacik.dev";

/// API version of the Database CRD
pub const VERSION: &str = "v1alpha1";

/// Kind of the Database CRD
pub const KIND: &str = "Database";

/// Plural resource name of the Database CRD
pub const PLURAL: &str = "databases";

/// Database is the Schema for the databases API
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "aws.pmacik.dev",
    version = "v1alpha1",
    kind = "Database",
    plural = "databases",
    shortname = "db",
    namespaced,
    status = "DatabaseStatus",
    derive = "PartialEq",
    printcolumn = r#"{"name":"Engine", "type":"string", "jsonPath":".spec.engine"}"#,
    printcolumn = r#"{"name":"Class", "type":"string", "jsonPath":".spec.class"}"#,
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseSpec {
    /// Master username of the database
    pub username: String,

    /// Reference to the secret holding the master password
    pub password: PasswordSecret,

    /// Name of the initial database to create
    pub db_name: String,

    /// Database engine (postgres, mysql, mariadb, aurora-postgresql, aurora-mysql)
    pub engine: String,

    /// Instance class, e.g. "db.t3.micro"
    pub class: String,

    /// Allocated storage in GiB
    pub size: i64,

    /// Deploy standby instances in multiple availability zones
    #[serde(default, rename = "multiAZ")]
    pub multi_az: bool,

    /// Whether the instance gets a publicly resolvable address
    #[serde(default)]
    pub publicly_accessible: bool,

    /// Encrypt the underlying storage
    #[serde(default)]
    pub storage_encrypted: bool,

    /// Storage type (gp2, gp3, io1, standard)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_type: Option<String>,

    /// Provisioned IOPS, required for io1 storage
    #[serde(default)]
    pub iops: i64,

    /// Days to keep automated backups, between 0 and 35 (0 disables backups)
    #[serde(default)]
    pub backup_retention_period: i64,

    /// Refuse deletion of the backing instance while set
    #[serde(default)]
    pub delete_protection: bool,
}

/// Reference to a key inside a Secret in the Database's namespace
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub struct PasswordSecret {
    /// Name of the Secret
    pub name: String,

    /// Key inside the Secret's data
    pub key: String,
}

/// Observed state of a Database, owned by the operator
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseStatus {
    /// Current provisioning state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<DatabaseState>,

    /// Detailed message around the state
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    /// Name of the ConfigMap holding connection configuration
    #[serde(default)]
    pub db_connection_config: String,

    /// Name of the Secret holding database credentials
    #[serde(default)]
    pub db_credentials: String,

    /// Generation of the spec the last terminal state was recorded for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// Provisioning state of a Database
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, JsonSchema)]
pub enum DatabaseState {
    /// Backing database is being allocated
    Creating,
    /// Endpoint Service is being published
    CreatingService,
    /// Connection ConfigMap is being published
    CreatingConfigMap,
    /// Database is provisioned and published
    #[serde(alias = "Created")]
    Completed,
    /// Provisioning stopped on an error, see the status message
    Failed,
}

impl DatabaseState {
    /// All states in declaration order
    pub const ALL: [DatabaseState; 5] = [
        DatabaseState::Creating,
        DatabaseState::CreatingService,
        DatabaseState::CreatingConfigMap,
        DatabaseState::Completed,
        DatabaseState::Failed,
    ];

    /// Whether the state is one of the in-progress provisioning steps
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            DatabaseState::Creating | DatabaseState::CreatingService | DatabaseState::CreatingConfigMap
        )
    }

    /// Whether no further transitions happen without outside intervention
    pub fn is_terminal(&self) -> bool {
        matches!(self, DatabaseState::Completed | DatabaseState::Failed)
    }
}

impl std::fmt::Display for DatabaseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DatabaseState::Creating => write!(f, "Creating"),
            DatabaseState::CreatingService => write!(f, "CreatingService"),
            DatabaseState::CreatingConfigMap => write!(f, "CreatingConfigMap"),
            DatabaseState::Completed => write!(f, "Completed"),
            DatabaseState::Failed => write!(f, "Failed"),
        }
    }
}

impl Database {
    /// Current provisioning state, if any has been recorded
    pub fn state(&self) -> Option<DatabaseState> {
        self.status.as_ref().and_then(|s| s.state)
    }
}
