use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};

pub const TUTORHOST_BEFORE_HELP: &str = concat!(
    "tutorhost ",
    env!("CARGO_PKG_VERSION"),
    " – local runtime for the tutor desktop client\n\n",
    "\x1b[1;36mRuntime\x1b[0m\n",
    "  provision        Install the Python runtime, sidecar code and its dependencies.\n",
    "  sidecar start    Launch the sidecar and keep it running until Ctrl-C.\n\n",
    "\x1b[1;36mContent\x1b[0m\n",
    "  bundles          List installed bundles or sync them with the backend.\n\n",
    "\x1b[1;36mSync\x1b[0m\n",
    "  queue            Enqueue, flush and inspect outbound sync streams.\n",
);

#[derive(Parser, Debug)]
#[command(
    name = "tutorhost",
    author,
    version,
    disable_help_subcommand = true,
    before_help = TUTORHOST_BEFORE_HELP
)]
#[allow(clippy::struct_excessive_bools)]
pub struct TutorhostCli {
    #[arg(
        short,
        long,
        help = "Suppress human output (errors still print to stderr)",
        global = true
    )]
    pub quiet: bool,
    #[arg(
        short,
        long,
        action = ArgAction::Count,
        help = "Increase logging (-vv reaches trace)",
        global = true
    )]
    pub verbose: u8,
    #[arg(long, help = "Force trace logging regardless of -v/-q", global = true)]
    pub trace: bool,
    #[arg(
        long,
        help = "Emit {status,message,details} JSON envelopes",
        global = true
    )]
    pub json: bool,
    #[arg(long, help = "Disable colored human output", global = true)]
    pub no_color: bool,
    #[arg(
        long,
        help = "Skip every network phase for this invocation (same as TUTORHOST_ONLINE=0)",
        global = true
    )]
    pub offline: bool,
    #[arg(
        long,
        value_name = "DIR",
        help = "Data root (defaults to TUTORHOST_HOME, then the platform data dir)",
        global = true
    )]
    pub root: Option<PathBuf>,
    #[command(subcommand)]
    pub command: CommandGroupCli,
}

#[derive(Subcommand, Debug)]
pub enum CommandGroupCli {
    #[command(about = "Bring the local Python environment and sidecar code up to date.")]
    Provision,
    #[command(about = "Inspect or update installed bundles.", subcommand)]
    Bundles(BundlesCommand),
    #[command(about = "Run the local sidecar.", subcommand)]
    Sidecar(SidecarCommand),
    #[command(about = "Work with durable outbound sync queues.", subcommand)]
    Queue(QueueCommand),
}

#[derive(Subcommand, Debug)]
pub enum BundlesCommand {
    #[command(about = "List bundles recorded in the local index.")]
    List,
    #[command(about = "Check the backend for updates and install required bundles.")]
    Sync(BundlesSyncArgs),
}

#[derive(Args, Debug)]
pub struct BundlesSyncArgs {
    #[arg(long, help = "Also install optional bundles")]
    pub all: bool,
}

#[derive(Subcommand, Debug)]
pub enum SidecarCommand {
    #[command(about = "Start the sidecar and supervise it until interrupted.")]
    Start(SidecarStartArgs),
}

#[derive(Args, Debug)]
pub struct SidecarStartArgs {
    #[arg(long, value_name = "PATH", help = "Python interpreter to run the sidecar with")]
    pub python: Option<PathBuf>,
    #[arg(long, env = "LLM_PROVIDER", help = "LLM provider name")]
    pub provider: String,
    #[arg(long, env = "LLM_API_KEY", hide_env_values = true, help = "LLM API key")]
    pub api_key: String,
    #[arg(long, help = "Model override")]
    pub model: Option<String>,
    #[arg(long, value_name = "URL", help = "Provider base URL override")]
    pub base_url: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum QueueCommand {
    #[command(about = "Append a JSON payload to a stream.")]
    Enqueue(EnqueueArgs),
    #[command(about = "Deliver every due item of a stream.")]
    Flush(FlushArgs),
    #[command(about = "Show items waiting in a stream.")]
    Pending(StreamArgs),
    #[command(name = "dead-letters", about = "Show items a stream gave up on.")]
    DeadLetters(StreamArgs),
}

#[derive(Args, Debug)]
pub struct StreamArgs {
    #[arg(value_name = "STREAM")]
    pub stream: String,
}

#[derive(Args, Debug)]
pub struct EnqueueArgs {
    #[arg(value_name = "STREAM")]
    pub stream: String,
    #[arg(value_name = "JSON", help = "Payload as a JSON document")]
    pub payload: String,
}

#[derive(Args, Debug)]
pub struct FlushArgs {
    #[arg(value_name = "STREAM")]
    pub stream: String,
    #[arg(long, value_name = "URL", help = "Delivery endpoint (defaults to the backend sync route)")]
    pub endpoint: Option<String>,
    #[arg(long, value_name = "N", help = "Dead-letter after N failed attempts")]
    pub max_retries: Option<u32>,
}
