// Label on a Namespace naming the NamespaceClass it wants.
pub const NAMESPACECLASS_LABEL: &str = "namespaceclass.akuity.io/name";

// Field manager used for server-side apply of managed resources.
pub const BINDING_FIELD_MANAGER: &str = "namespaceclassbinding-controller";

// Reporter names for Kubernetes events.
pub const NAMESPACE_CONTROLLER_NAME: &str = "namespace-controller";
pub const BINDING_CONTROLLER_NAME: &str = "namespaceclassbinding-controller";

pub const CONDITION_TYPE_READY: &str = "Ready";

pub const REASON_RECONCILE_SUCCESS: &str = "ReconcileSuccess";
pub const REASON_CLASS_NOT_FOUND: &str = "ClassNotFound";
pub const REASON_PRUNE_FAILED: &str = "PruneFailed";
pub const REASON_APPLY_FAILED: &str = "ApplyFailed";

// Event reasons.
pub const EVENT_BINDING_CREATED: &str = "BindingCreated";
pub const EVENT_BINDING_UPDATED: &str = "BindingUpdated";
pub const EVENT_BINDING_REMOVED: &str = "BindingRemoved";
pub const EVENT_CLEANED_UP: &str = "CleanedUp";
pub const EVENT_RECONCILE_SUCCEEDED: &str = "ReconcileSucceeded";

// Attempts for a status read-modify-write before giving up on conflicts.
pub const STATUS_UPDATE_ATTEMPTS: u32 = 5;
