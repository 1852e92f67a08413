use {
    crate::{identity::MemberId, store::StoreError},
    std::{collections::HashSet, error::Error, mem},
    tonic::Code,
    tracing::warn,
};

///
/// Cooperative cancellation signal.
///
/// Raised when a caller cancels a blocking operation. It must never be absorbed by a
/// retry loop: wherever it appears in an error's cause chain, it is propagated as is.
///
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("interrupted: {reason}")]
pub struct Interrupted {
    reason: String,
}

impl Interrupted {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCategory {
    DeadlineExceeded,
    Cancelled,
    Unknown,
    Other(Code),
}

impl FailureCategory {
    pub fn code(&self) -> Code {
        match self {
            FailureCategory::DeadlineExceeded => Code::DeadlineExceeded,
            FailureCategory::Cancelled => Code::Cancelled,
            FailureCategory::Unknown => Code::Unknown,
            FailureCategory::Other(code) => *code,
        }
    }
}

pub fn classify(err: &StoreError) -> FailureCategory {
    match err.code() {
        Code::DeadlineExceeded => FailureCategory::DeadlineExceeded,
        Code::Cancelled => FailureCategory::Cancelled,
        Code::Unknown => FailureCategory::Unknown,
        code => FailureCategory::Other(code),
    }
}

///
/// Classifies `err` and emits one warning describing it.
///
/// `phase` reads as the tail of a sentence, e.g. `"renewing lease"`.
/// The error itself is only attached when it helps diagnosis: cancellations and unknown
/// failures (often a server-side or serialization bug).
///
pub fn log_store_error(err: &StoreError, member: &MemberId, phase: &str) -> FailureCategory {
    let category = classify(err);
    match category {
        FailureCategory::DeadlineExceeded => {
            warn!(%member, ?category, "[{member}] etcd request deadline exceeded, while {phase}");
        }
        FailureCategory::Cancelled => {
            warn!(%member, ?category, "[{member}] etcd request cancelled, while {phase}: {err:?}");
        }
        FailureCategory::Unknown => {
            warn!(%member, ?category, "[{member}] etcd request failure {:?} while {phase}: {err:?}", Code::Unknown);
        }
        FailureCategory::Other(code) => {
            warn!(%member, ?category, "[{member}] etcd request failure {code:?} while {phase}");
        }
    }
    category
}

///
/// Fails with the [`Interrupted`] signal if one is found anywhere in the cause chain of `err`.
///
/// The chain is walked through [`Error::source`] with a visited set, so a buggy error type
/// whose causes loop back on themselves still terminates.
///
pub fn assert_no_nested_interrupted(err: Option<&(dyn Error + 'static)>) -> Result<(), Interrupted> {
    let interrupted = visit_cause_chain(err)
        .into_iter()
        .find_map(|cause| cause.downcast_ref::<Interrupted>());
    match interrupted {
        Some(interrupted) => Err(interrupted.clone()),
        None => Ok(()),
    }
}

fn visit_cause_chain<'a>(
    err: Option<&'a (dyn Error + 'static)>,
) -> Vec<&'a (dyn Error + 'static)> {
    // Keyed by data address and size, never by vtable: the same node reached through two
    // coercion sites may carry two different vtables. The size tells apart a wrapper from a
    // first field sharing its address.
    let mut seen: HashSet<(*const (), usize)> = HashSet::new();
    let mut visited = Vec::new();
    let mut current = err;
    while let Some(cause) = current {
        let node = (
            cause as *const (dyn Error + 'static) as *const (),
            mem::size_of_val(cause),
        );
        if !seen.insert(node) {
            break;
        }
        visited.push(cause);
        current = cause.source();
    }
    visited
}
