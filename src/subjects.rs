// Canonical subject catalog. This file is the source of truth for subject
// strings on the Rust side; keep it in sync with the producer's catalog.

// -----------------------------------------------------------------------------
// STREAMS / CONSUMERS
// -----------------------------------------------------------------------------

pub const SIGNAL_STREAM: &str = "ARBITER_SIGNALS";
pub const SIGNAL_DURABLE: &str = "ARBITER_SIGNAL_WORKER";

// -----------------------------------------------------------------------------
// SUBJECTS
// -----------------------------------------------------------------------------

pub const SIGNAL_INTAKE: &str = "arbiter.signal.intake.v1";
pub const SIGNAL_DLQ: &str = "arbiter.signal.dlq.v1";

// -----------------------------------------------------------------------------
// SUBSCRIPTION PATTERNS (WILDCARDS)
// -----------------------------------------------------------------------------

pub const SIGNAL_WILDCARD: &str = "arbiter.signal.>";
