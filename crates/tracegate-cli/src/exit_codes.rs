//! Exit codes of the `tracegate` binary. CI jobs gate on them.

pub const SUCCESS: i32 = 0;
pub const TEST_FAILURE: i32 = 1; // Regression found, or the result folder is unusable
pub const CONFIG_ERROR: i32 = 2; // Bad flags, unreadable repository, server unreachable
