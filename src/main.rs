use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use memoexec::command::{Command, ExecutionOptions, OutputRef};
use memoexec::config::ClientConfig;
use memoexec::constants::DEFAULT_SERVER_PORT;
use memoexec::digest::Digest;
use memoexec::tree::{build_tree, InputExclusion, InputSpec, Node};
use memoexec::Client;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// memoexec - run build actions on a remote execution service
#[derive(Parser)]
#[command(name = "memoexec", version)]
#[command(about = "Content-addressed remote execution client")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// JSON configuration file (defaults plus MEMOEXEC_* overrides otherwise)
    #[arg(long, global = true, env = "MEMOEXEC_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    /// Debug-level logs for memoexec
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a command remotely and print its outputs
    Run {
        /// Remote execution endpoint
        #[arg(long, env = "MEMOEXEC_REMOTE_URL")]
        remote: String,
        /// Local exec root all inputs are relative to
        #[arg(long, default_value = ".")]
        exec_root: PathBuf,
        /// Input file or directory (repeatable)
        #[arg(long = "input")]
        inputs: Vec<String>,
        /// Glob of paths to leave out (repeatable)
        #[arg(long = "exclude")]
        exclusions: Vec<String>,
        /// Output file the command produces (repeatable)
        #[arg(long = "output")]
        outputs: Vec<String>,
        /// Working directory relative to the exec root
        #[arg(long, default_value = "")]
        working_dir: String,
        /// NAME=VALUE environment variable (repeatable)
        #[arg(long = "env")]
        env: Vec<String>,
        /// Action timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
        /// Skip the action cache lookup
        #[arg(long)]
        force_remote: bool,
        /// Never read or write the action cache
        #[arg(long)]
        do_not_cache: bool,
        /// Write output files under the exec root
        #[arg(long)]
        download_outputs: bool,
        /// The command and its arguments
        #[arg(last = true, required = true)]
        args: Vec<String>,
    },
    /// Print the digest of a file
    Digest { path: PathBuf },
    /// Download one blob from the remote CAS
    Fetch {
        #[arg(long, env = "MEMOEXEC_REMOTE_URL")]
        remote: String,
        /// Digest as HASH/SIZE
        digest: Digest,
        /// Write the blob here instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Build the input tree for a directory and list it
    Tree {
        #[arg(default_value = ".")]
        exec_root: PathBuf,
        #[arg(long = "input")]
        inputs: Vec<String>,
        #[arg(long = "exclude")]
        exclusions: Vec<String>,
    },
    /// Serve an in-memory fake remote execution service
    Serve {
        #[arg(long, default_value_t = DEFAULT_SERVER_PORT)]
        port: u16,
    },
}

fn input_spec(inputs: Vec<String>, exclusions: Vec<String>) -> InputSpec {
    InputSpec {
        inputs: if inputs.is_empty() {
            vec![".".to_string()]
        } else {
            inputs
        },
        exclusions: exclusions
            .into_iter()
            .map(|p| InputExclusion::new(p, Default::default()))
            .collect(),
        virtual_inputs: Vec::new(),
    }
}

fn parse_env(pairs: Vec<String>) -> Result<BTreeMap<String, String>> {
    pairs
        .into_iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .with_context(|| format!("--env expects NAME=VALUE, got {:?}", pair))
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    memoexec::logging::init_logging(cli.json_logs, cli.verbose)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    let config = match &cli.config {
        Some(path) => {
            let mut config = ClientConfig::from_file(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?;
            config.apply_env();
            config
        }
        None => ClientConfig::from_env(),
    };

    match cli.command {
        Commands::Run {
            remote,
            exec_root,
            inputs,
            exclusions,
            outputs,
            working_dir,
            env,
            timeout,
            force_remote,
            do_not_cache,
            download_outputs,
            args,
        } => {
            let exec_root = exec_root
                .canonicalize()
                .with_context(|| format!("Exec root {} not found", exec_root.display()))?;
            let mut command = Command::new(args, exec_root);
            command.working_dir = working_dir;
            command.output_files = outputs;
            command.env = parse_env(env)?;
            command.timeout = timeout.map(Duration::from_secs);

            let options = ExecutionOptions {
                accept_cached: !force_remote,
                do_not_cache,
                download_outputs,
            };
            let client = Client::connect(&remote, config)?;
            let spec = input_spec(inputs, exclusions);
            let result = client.execute(&command, &spec, &options).await?;

            if result.action_result.is_some() {
                let stdout = client.fetch_output(&result, &OutputRef::Stdout).await?;
                let stderr = client.fetch_output(&result, &OutputRef::Stderr).await?;
                std::io::stdout().write_all(&stdout)?;
                std::io::stderr().write_all(&stderr)?;
            }
            eprintln!("{} (exit code {})", result.status, result.exit_code);
            if let Some(error) = &result.error {
                eprintln!("{}", error);
            }
            if !result.is_ok() || result.exit_code != 0 {
                std::process::exit(if result.exit_code > 0 { result.exit_code } else { 1 });
            }
        }
        Commands::Digest { path } => {
            let digest = Digest::of_file(&path)?;
            println!("{}", digest);
        }
        Commands::Fetch {
            remote,
            digest,
            output,
        } => {
            let client = Client::connect(&remote, config)?;
            let blobs = client
                .download(std::slice::from_ref(&digest), &CancellationToken::new())
                .await?;
            let data = blobs
                .get(&digest)
                .with_context(|| format!("{} was not returned", digest))?
                .read_all()?;
            match output {
                Some(path) => std::fs::write(&path, data)
                    .with_context(|| format!("Failed to write {}", path.display()))?,
                None => std::io::stdout().write_all(&data)?,
            }
        }
        Commands::Tree {
            exec_root,
            inputs,
            exclusions,
        } => {
            let tree = build_tree(&exec_root, &input_spec(inputs, exclusions))?;
            for (path, node) in tree.entries() {
                let kind = match node {
                    Node::File(f) if f.is_executable => "exec",
                    Node::File(_) => "file",
                    Node::Directory(_) => "dir",
                    Node::Symlink(_) => "link",
                };
                println!("{:<4} {} {}", kind, node.digest(), path);
            }
            println!("root {}", tree.root_digest);
        }
        Commands::Serve { port } => {
            #[cfg(feature = "server")]
            {
                let server = std::sync::Arc::new(memoexec::fake::FakeServer::new());
                memoexec::fake::server::serve(server, port).await?;
            }
            #[cfg(not(feature = "server"))]
            {
                let _ = port;
                anyhow::bail!("Server feature not enabled. Rebuild with --features server");
            }
        }
    }

    Ok(())
}
