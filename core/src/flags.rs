use env_flags::env_flags;

env_flags! {
    /// Upper bound on model-endpoint retries for transient failures.
    pub AMBIENT_REQUEST_MAX_RETRIES: u64 = 6;
}
