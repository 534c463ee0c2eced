//! Identifier types used across the device pool.

use crate::define_id;

define_id!(
    /// Handle of a leased device. Doubles as the key of the pool slot that
    /// hosts it.
    DeviceId,
    "dev"
);

define_id!(
    /// Name of a worker process, unique for the lifetime of the agent.
    WorkerId,
    "wrk"
);
