use anyhow::{Context, Result};
use clap::Parser;
use std::{env, path::PathBuf, str::FromStr, time::Duration};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    /// Root of per-session chunk directories.
    pub chunk_dir: PathBuf,
    /// Flat directory holding reassembled artifacts.
    pub final_dir: PathBuf,
    /// Output directory for transcoded variants.
    pub transcoded_dir: PathBuf,
    pub database_url: String,
    pub ffmpeg_bin: String,
    pub transcode_timeout_secs: u64,
    pub session_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    pub max_chunk_bytes: usize,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Chunked media upload and transcoding service")]
pub struct Args {
    /// Host to bind to (overrides MEDIA_INGEST_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides MEDIA_INGEST_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory for in-flight chunks (overrides MEDIA_INGEST_CHUNK_DIR)
    #[arg(long)]
    pub chunk_dir: Option<PathBuf>,

    /// Directory for reassembled uploads (overrides MEDIA_INGEST_FINAL_DIR)
    #[arg(long)]
    pub final_dir: Option<PathBuf>,

    /// Directory for transcoded outputs (overrides MEDIA_INGEST_TRANSCODED_DIR)
    #[arg(long)]
    pub transcoded_dir: Option<PathBuf>,

    /// Database URL (overrides MEDIA_INGEST_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// ffmpeg binary to invoke (overrides MEDIA_INGEST_FFMPEG_BIN)
    #[arg(long)]
    pub ffmpeg_bin: Option<String>,

    /// Per-job transcode timeout in seconds (overrides MEDIA_INGEST_TRANSCODE_TIMEOUT_SECS)
    #[arg(long)]
    pub transcode_timeout_secs: Option<u64>,

    /// Idle time before an unfinished session is swept (overrides MEDIA_INGEST_SESSION_TTL_SECS)
    #[arg(long)]
    pub session_ttl_secs: Option<u64>,

    /// Interval between abandoned-session sweeps (overrides MEDIA_INGEST_SWEEP_INTERVAL_SECS)
    #[arg(long)]
    pub sweep_interval_secs: Option<u64>,

    /// Largest accepted chunk request body (overrides MEDIA_INGEST_MAX_CHUNK_BYTES)
    #[arg(long)]
    pub max_chunk_bytes: Option<usize>,

    /// Apply the schema and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();

        // --- Environment fallback ---
        let env_host = env::var("MEDIA_INGEST_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_number("MEDIA_INGEST_PORT", 3000u16)?;
        let env_chunks =
            env::var("MEDIA_INGEST_CHUNK_DIR").unwrap_or_else(|_| "./data/uploads".into());
        let env_final =
            env::var("MEDIA_INGEST_FINAL_DIR").unwrap_or_else(|_| "./data/final-uploads".into());
        let env_transcoded =
            env::var("MEDIA_INGEST_TRANSCODED_DIR").unwrap_or_else(|_| "./data/transcoded".into());
        let env_db = env::var("MEDIA_INGEST_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/media_ingest.db".into());
        let env_ffmpeg = env::var("MEDIA_INGEST_FFMPEG_BIN").unwrap_or_else(|_| "ffmpeg".into());
        let env_timeout = env_number("MEDIA_INGEST_TRANSCODE_TIMEOUT_SECS", 3600u64)?;
        let env_ttl = env_number("MEDIA_INGEST_SESSION_TTL_SECS", 86_400u64)?;
        let env_sweep = env_number("MEDIA_INGEST_SWEEP_INTERVAL_SECS", 600u64)?;
        let env_max_chunk = env_number("MEDIA_INGEST_MAX_CHUNK_BYTES", 64 * 1024 * 1024usize)?;

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            chunk_dir: args.chunk_dir.unwrap_or_else(|| env_chunks.into()),
            final_dir: args.final_dir.unwrap_or_else(|| env_final.into()),
            transcoded_dir: args.transcoded_dir.unwrap_or_else(|| env_transcoded.into()),
            database_url: args.database_url.unwrap_or(env_db),
            ffmpeg_bin: args.ffmpeg_bin.unwrap_or(env_ffmpeg),
            transcode_timeout_secs: args.transcode_timeout_secs.unwrap_or(env_timeout),
            session_ttl_secs: args.session_ttl_secs.unwrap_or(env_ttl),
            sweep_interval_secs: args.sweep_interval_secs.unwrap_or(env_sweep),
            max_chunk_bytes: args.max_chunk_bytes.unwrap_or(env_max_chunk),
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn transcode_timeout(&self) -> Duration {
        Duration::from_secs(self.transcode_timeout_secs)
    }

    /// Every directory the service writes into.
    pub fn data_dirs(&self) -> [&PathBuf; 3] {
        [&self.chunk_dir, &self.final_dir, &self.transcoded_dir]
    }
}

/// Read a numeric env var, using `default` when it is unset.
fn env_number<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", key)),
    }
}

#[cfg(test)]
impl AppConfig {
    /// Config rooted under a scratch directory, used by unit tests.
    pub fn for_tests(root: &std::path::Path) -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            chunk_dir: root.join("uploads"),
            final_dir: root.join("final-uploads"),
            transcoded_dir: root.join("transcoded"),
            database_url: "sqlite::memory:".into(),
            ffmpeg_bin: "ffmpeg".into(),
            transcode_timeout_secs: 30,
            session_ttl_secs: 3600,
            sweep_interval_secs: 60,
            max_chunk_bytes: 1024 * 1024,
        }
    }
}
