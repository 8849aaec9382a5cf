/// Errors from world, query and schedule operations.
///
/// Stale handles and duplicate components are not errors: they surface as
/// `false`/`None` results.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EcsError {
    #[error("cannot {operation} `{component}` while a query holds its pool")]
    QueryMutationConflict {
        component: &'static str,
        operation: &'static str,
    },
    #[error("cannot {operation} `{component}` while a query holds it for writing")]
    BorrowConflict {
        component: &'static str,
        operation: &'static str,
    },
    #[error("query requests `{component}` more than once with mutable access")]
    AccessConflict { component: &'static str },
    #[error("schedule `{label}` is already running")]
    ScheduleReentrant { label: &'static str },
}
