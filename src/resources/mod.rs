pub mod common;
pub mod config_map;
pub mod dependents;
pub mod service;

pub use common::{
    API_VERSION, BACKEND_LABEL, DATABASE_LABEL, FIELD_MANAGER, ORIGIN_ANNOTATION, owner_reference,
    port_name, standard_labels,
};
pub use dependents::{ApplyOutcome, DependentReconciler};
