/// Result code signalling success: a dedup hit on check, a finished merge.
pub const CODE_HIT: i32 = 700;

/// Result code returned by `/init` when the session could not be created.
pub const CODE_INIT_FAILED: i32 = 703;

/// Content type sent with every chunk PUT.
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Path segment of the existence-check endpoint.
pub const CHECK_PATH: &str = "/check";

/// Path segment of the session-init endpoint.
pub const INIT_PATH: &str = "/init";

/// Path segment of the merge/finalize endpoint.
pub const MERGE_PATH: &str = "/merge";
