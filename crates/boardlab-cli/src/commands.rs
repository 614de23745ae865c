//! CLI command definitions.

use clap::Subcommand;

#[derive(Subcommand)]
pub enum Commands {
    /// Run the master: scheduling and worker coordination.
    Master {
        #[arg(long, env = "BOARDLAB_NATS_URL", default_value = "nats://localhost:4222")]
        nats_url: String,
        #[arg(
            long,
            env = "BOARDLAB_DATABASE_URL",
            default_value = "postgres://boardlab@localhost/boardlab"
        )]
        database_url: String,
        /// YAML environment file shipped to workers with every job.
        #[arg(long)]
        env_file: Option<String>,
    },
    /// Run the log ingestion service.
    Logs {
        #[arg(long, env = "BOARDLAB_NATS_URL", default_value = "nats://localhost:4222")]
        nats_url: String,
        #[arg(
            long,
            env = "BOARDLAB_DATABASE_URL",
            default_value = "postgres://boardlab@localhost/boardlab"
        )]
        database_url: String,
        /// Directory holding per-job output files.
        #[arg(long, default_value = "/var/lib/boardlab/jobs")]
        output_dir: String,
        /// Hostname this service pings the master under.
        #[arg(long, default_value = "boardlab-logs")]
        hostname: String,
    },
    /// Submit a job definition.
    Submit {
        /// Path to the job definition file.
        path: String,
        #[arg(
            long,
            env = "BOARDLAB_DATABASE_URL",
            default_value = "postgres://boardlab@localhost/boardlab"
        )]
        database_url: String,
    },
    /// Request cancellation of a job.
    Cancel {
        /// Job id (as printed by submit).
        job: String,
        #[arg(
            long,
            env = "BOARDLAB_DATABASE_URL",
            default_value = "postgres://boardlab@localhost/boardlab"
        )]
        database_url: String,
    },
    /// Show one job.
    Show {
        job: String,
        #[arg(
            long,
            env = "BOARDLAB_DATABASE_URL",
            default_value = "postgres://boardlab@localhost/boardlab"
        )]
        database_url: String,
    },
    /// List devices and their state.
    Devices {
        #[arg(
            long,
            env = "BOARDLAB_DATABASE_URL",
            default_value = "postgres://boardlab@localhost/boardlab"
        )]
        database_url: String,
    },
}
