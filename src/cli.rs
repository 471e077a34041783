use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "slink")]
#[command(version, about = "SLURM job launcher with a shared per-host proxy service")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Submit a command with srun and wait for it
    Run(SubmitArgs),

    /// Submit a command with sbatch
    Batch(SubmitArgs),

    /// Print the srun command or sbatch script without submitting
    Print {
        #[command(flatten)]
        args: SubmitArgs,

        /// Render the sbatch script instead of the srun command line
        #[arg(long)]
        batch: bool,
    },

    /// Release the shared proxy service for a job identifier
    Release {
        /// The job identifier that was registered at submission
        identifier: String,
    },

    /// Show the service registry
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Establish the forward tunnel (run inside a job allocation)
    Tunnel {
        /// Port the proxy listens on, on the login host
        #[arg(long)]
        service_port: u16,

        /// Loopback port to bind on this node
        #[arg(long)]
        loopback_port: u16,

        /// Host the proxy runs on
        #[arg(long)]
        login_host: String,

        /// Account to authenticate as
        #[arg(long)]
        login_user: String,
    },

    /// Pre-fetch the proxy binary and geo database
    Provision,
}

#[derive(Args)]
pub struct SubmitArgs {
    /// Partition to allocate from
    #[arg(short, long)]
    pub partition: Option<String>,

    /// Minimum number of nodes
    #[arg(short = 'N', long, default_value_t = 1)]
    pub nodes: u32,

    /// Number of tasks
    #[arg(short = 'n', long, default_value_t = 1)]
    pub ntasks: u32,

    /// GPU model to request (omit or "any" for untyped)
    #[arg(long)]
    pub gpu_type: Option<String>,

    /// Number of GPUs
    #[arg(short = 'G', long, default_value_t = 1)]
    pub gpus: u32,

    /// CPUs per task
    #[arg(short, long, default_value_t = 2)]
    pub cpus_per_task: u32,

    /// Real memory per node, e.g. 40G
    #[arg(long)]
    pub mem: Option<String>,

    /// Wall-clock limit
    #[arg(short = 't', long, default_value = "0-01:00:00")]
    pub time: String,

    /// Job name (shows up in squeue)
    #[arg(short = 'J', long)]
    pub jobname: Option<String>,

    /// Stdout path; %i expands to the job identifier
    #[arg(short, long)]
    pub output: Option<String>,

    /// Stderr path; %i expands to the job identifier
    #[arg(short, long)]
    pub error: Option<String>,

    /// Mail notification types (repeatable)
    #[arg(long)]
    pub mail_type: Vec<String>,

    /// Mail notification address
    #[arg(long)]
    pub mail_user: Option<String>,

    /// Route the job's traffic through the shared proxy service
    #[arg(long)]
    pub proxy: bool,

    /// Extra scheduler argument, passed through verbatim (repeatable)
    #[arg(long = "slurm-arg", value_name = "ARG", allow_hyphen_values = true)]
    pub extra: Vec<String>,

    /// The command to run
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

impl SubmitArgs {
    pub fn to_submit_config(&self) -> slink::submit::SubmitConfig {
        slink::submit::SubmitConfig {
            slurm: slink::submit::SlurmConfig {
                name: None,
                partition: self.partition.clone(),
                nodes: self.nodes,
                ntasks: self.ntasks,
                gpu_type: self.gpu_type.clone(),
                num_gpus: self.gpus,
                cpus_per_task: self.cpus_per_task,
                mem: self.mem.clone(),
                extra: self.extra.clone(),
                ..slink::submit::SlurmConfig::default()
            },
            jobname: self.jobname.clone(),
            proxy: self.proxy,
            time: self.time.clone(),
            output: self.output.clone(),
            error: self.error.clone(),
            mail_type: self.mail_type.clone(),
            mail_user: self.mail_user.clone(),
        }
    }
}
