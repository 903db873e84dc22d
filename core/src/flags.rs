use env_flags::env_flags;

env_flags! {
    /// Base directory override for the user space. Defaults to `$HOME`.
    pub USER_SPACE: Option<&str> = None;

    /// Enables verbose traces across the runtime.
    pub RYE_DEBUG: Option<&str> = None;

    /// Auto-injected into child thread processes to maintain the parent
    /// chain.
    pub RYE_PARENT_THREAD_ID: Option<&str> = None;

    /// PEM-encoded Ed25519 private key to import in CI/serverless.
    pub RYE_SIGNING_KEY: Option<&str> = None;

    pub RYE_REQUEST_MAX_RETRIES: u64 = 4;
}

pub fn debug_enabled() -> bool {
    RYE_DEBUG.is_some_and(|v| !v.is_empty() && v != "0")
}
