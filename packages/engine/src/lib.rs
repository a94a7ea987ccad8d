pub mod error;
pub mod idempotency;
pub mod invoker;
pub mod redact;
pub mod references;
pub mod run;

pub use error::EngineError;
pub use idempotency::{idempotency_key, request_hash, IdempotencyStore, InMemoryIdempotencyStore};
pub use invoker::{
    ConnectorInvoker, CredentialResolver, FailKind, Invocation, InvocationContext, PollOutcome,
};
pub use redact::redact_value;
pub use run::{seed_outputs_for_replay, RunExecutor, RunOutcome, RunRequest};
