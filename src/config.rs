//! Operator configuration.

/// Configuration loaded from environment variables. Unrecognized variables
/// are ignored.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory for temporary process-chain outputs
    pub tmp_path: String,

    /// Directory for persisted process-chain outputs
    pub out_path: String,

    /// Interval between submission lookups in milliseconds
    pub lookup_interval_ms: u64,

    /// Interval between orphan scans in milliseconds
    pub orphan_lookup_interval_ms: u64,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let tmp_path = std::env::var("DROVER_TMP_PATH")
            .map_err(|_| anyhow::anyhow!("DROVER_TMP_PATH must be set"))?;

        let out_path = std::env::var("DROVER_OUT_PATH")
            .map_err(|_| anyhow::anyhow!("DROVER_OUT_PATH must be set"))?;

        let lookup_interval_ms: u64 = std::env::var("DROVER_LOOKUP_INTERVAL_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(2000);

        let orphan_lookup_interval_ms: u64 = std::env::var("DROVER_ORPHAN_LOOKUP_INTERVAL_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(300_000);

        Ok(Config {
            tmp_path,
            out_path,
            lookup_interval_ms,
            orphan_lookup_interval_ms,
        })
    }
}
