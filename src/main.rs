//! casexec - run build actions through the content-addressed execution stack

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use casexec::ac::{ActionCache, BlobAccessActionCache};
use casexec::blobstore::{
    put_message, read_blob, BatchWritingBlobAccess, BlobAccess, DiskBlobAccess, MerkleBlobAccess,
    SizeDistinguishingBlobAccess,
};
use casexec::builder::{
    BuildExecutor, BuildQueue, CachedBuildQueue, CachingBuildExecutor, LocalBuildExecutor,
    WorkerBuildQueue,
};
use casexec::cas::{
    build_tree, BlobAccessContentAddressableStorage, ContentAddressableStorage,
    DirectoryCachingContentAddressableStorage, HardlinkingContentAddressableStorage,
};
use casexec::{
    Action, Command, Config, Digest, DigestKeyer, Error, ExecuteRequest, Hasher, IoResultExt,
    Operation, OperationResult,
};

#[derive(Parser)]
#[command(name = "casexec")]
#[command(about = "content-addressed build execution")]
#[command(version)]
struct Cli {
    /// config file; built-in defaults are used when absent
    #[arg(short, long, env = "CASEXEC_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// write the default configuration to a file
    InitConfig {
        /// destination path
        path: PathBuf,
    },

    /// print the digest of a file
    Digest {
        /// file to hash
        path: PathBuf,
    },

    /// upload an input tree, run a command against it and print the result
    Run {
        /// directory uploaded as the input root
        #[arg(short, long)]
        input: PathBuf,

        /// output file to collect, relative to the input root
        #[arg(long = "output-file")]
        output_files: Vec<String>,

        /// output directory to collect, relative to the input root
        #[arg(long = "output-dir")]
        output_directories: Vec<String>,

        /// instance name
        #[arg(long, default_value = "")]
        instance: String,

        /// environment variable for the command, as NAME=VALUE
        #[arg(short, long = "env")]
        env: Vec<String>,

        /// do not answer from the action cache
        #[arg(long)]
        skip_cache: bool,

        /// do not store the result in the action cache
        #[arg(long)]
        no_cache: bool,

        /// command and arguments
        #[arg(last = true, required = true)]
        argv: Vec<String>,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> casexec::Result<ExitCode> {
    match cli.command {
        Commands::InitConfig { path } => {
            Config::default().save(&path)?;
            println!("wrote default config to {}", path.display());
        }

        Commands::Digest { path } => {
            let mut file = File::open(&path).with_path(&path)?;
            let mut hasher = Hasher::new();
            io::copy(&mut file, &mut hasher).with_path(&path)?;
            let size = hasher.len();
            println!("{}", Digest::from_parts(hasher.finalize(), size));
        }

        Commands::Run {
            input,
            output_files,
            output_directories,
            instance,
            env,
            skip_cache,
            no_cache,
            argv,
        } => {
            let config = match &cli.config {
                Some(path) => Config::load(path)?,
                None => Config::default(),
            };

            let mut command = Command::new(argv);
            for pair in env {
                let (name, value) = pair.split_once('=').ok_or_else(|| {
                    Error::InvalidArgument(format!("environment variable {:?} is not NAME=VALUE", pair))
                })?;
                command = command.with_env(name, value);
            }

            let stack = Stack::open(&config)?;
            let action = stack.upload_inputs(&instance, &input, &command)?;
            let mut request = ExecuteRequest::new(
                instance,
                Action {
                    output_files,
                    output_directories,
                    do_not_cache: no_cache,
                    ..action
                },
            );
            request.skip_cache_lookup = skip_cache;

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .map_err(|e| Error::Internal(format!("failed to start runtime: {}", e)))?;
            let operation = runtime.block_on(stack.execute(request))?;
            return stack.report(&operation);
        }
    }

    Ok(ExitCode::SUCCESS)
}

/// storage, cache and execution layers wired up for one process
struct Stack {
    blobs: Arc<dyn BlobAccess>,
    executor: Arc<dyn BuildExecutor>,
    queue: Arc<WorkerBuildQueue>,
    frontend: CachedBuildQueue,
}

impl Stack {
    fn open(config: &Config) -> casexec::Result<Self> {
        let storage = &config.storage.path;
        let small: Arc<dyn BlobAccess> = Arc::new(DiskBlobAccess::open(
            storage.join("cas-small"),
            DigestKeyer::WithoutInstance,
        )?);
        let large: Arc<dyn BlobAccess> = Arc::new(DiskBlobAccess::open(
            storage.join("cas-large"),
            DigestKeyer::WithoutInstance,
        )?);
        let cutoff = i64::try_from(config.storage.size_cutoff_bytes).unwrap_or(i64::MAX);
        let blobs: Arc<dyn BlobAccess> = Arc::new(MerkleBlobAccess::new(Arc::new(
            SizeDistinguishingBlobAccess::new(small, large, cutoff),
        )));
        let batched: Arc<dyn BlobAccess> = Arc::new(BatchWritingBlobAccess::new(
            blobs.clone(),
            config.storage.batch_write_threshold,
        ));

        let cas: Arc<dyn ContentAddressableStorage> =
            Arc::new(BlobAccessContentAddressableStorage::new(batched));
        let cas: Arc<dyn ContentAddressableStorage> =
            Arc::new(DirectoryCachingContentAddressableStorage::new(
                cas,
                DigestKeyer::WithoutInstance,
                config.cache.max_directories,
            ));
        let cas: Arc<dyn ContentAddressableStorage> =
            Arc::new(HardlinkingContentAddressableStorage::new(
                cas,
                DigestKeyer::WithoutInstance,
                &config.cache.path,
                config.cache.max_files,
                config.cache.max_size_bytes,
            )?);

        let action_cache: Arc<dyn ActionCache> = Arc::new(BlobAccessActionCache::new(Arc::new(
            DiskBlobAccess::open(storage.join("ac"), DigestKeyer::WithInstance)?,
        )));

        let executor: Arc<dyn BuildExecutor> = Arc::new(CachingBuildExecutor::new(
            Arc::new(LocalBuildExecutor::new(cas, &config.executor)),
            action_cache.clone(),
        ));
        let queue = Arc::new(WorkerBuildQueue::from_config(&config.scheduler));
        let frontend = CachedBuildQueue::new(queue.clone(), action_cache);

        Ok(Self {
            blobs,
            executor,
            queue,
            frontend,
        })
    }

    /// store the input tree and command, returning an action without outputs
    fn upload_inputs(&self, instance: &str, input: &Path, command: &Command) -> casexec::Result<Action> {
        let uploader = BlobAccessContentAddressableStorage::new(self.blobs.clone());
        let tree = build_tree(&uploader, instance, input)?;
        for directory in tree.children.iter().chain(std::iter::once(&tree.root)) {
            put_message(self.blobs.as_ref(), instance, directory)?;
        }
        let input_root_digest = Digest::of_message(&tree.root)?;
        let command_digest = put_message(self.blobs.as_ref(), instance, command)?;
        tracing::debug!(input_root = %input_root_digest, command = %command_digest, "inputs uploaded");

        Ok(Action {
            command_digest,
            input_root_digest,
            output_files: vec![],
            output_directories: vec![],
            do_not_cache: false,
        })
    }

    async fn execute(&self, request: ExecuteRequest) -> casexec::Result<Operation> {
        let cancel = CancellationToken::new();
        let dispatcher = {
            let queue = self.queue.clone();
            let executor = self.executor.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { queue.run_local(executor.as_ref(), &cancel).await })
        };

        let result = self.submit_and_wait(request).await;

        cancel.cancel();
        if let Err(e) = dispatcher.await {
            tracing::warn!(error = %e, "dispatcher task failed");
        }
        result
    }

    async fn submit_and_wait(&self, request: ExecuteRequest) -> casexec::Result<Operation> {
        let operation = self.frontend.execute(request).await?;
        if operation.is_done() {
            return Ok(operation);
        }
        self.frontend.watch(&operation.name)?.wait().await
    }

    /// print the outcome and map it to a process exit code
    fn report(&self, operation: &Operation) -> casexec::Result<ExitCode> {
        let response = match &operation.result {
            Some(OperationResult::Response(response)) => response,
            Some(OperationResult::Error(status)) => {
                eprintln!("error: {}: {}", status.code, status.message);
                return Ok(ExitCode::FAILURE);
            }
            None => return Err(Error::Internal("operation has no result".to_string())),
        };
        if let Some(status) = &response.status {
            eprintln!("error: {}: {}", status.code, status.message);
            return Ok(ExitCode::FAILURE);
        }
        let Some(result) = &response.result else {
            return Err(Error::Internal("response has no result".to_string()));
        };

        let stdout = match (&result.stdout_raw, &result.stdout_digest) {
            (Some(raw), _) => raw.clone(),
            (None, Some(digest)) => read_blob(self.blobs.as_ref(), "", digest)?,
            (None, None) => vec![],
        };
        io::stdout()
            .write_all(&stdout)
            .map_err(|e| Error::Io { path: "stdout".into(), source: e })?;

        eprintln!(
            "action {} exited with {}{}",
            operation.action_digest,
            result.exit_code,
            if response.cached_result { " (cached)" } else { "" }
        );
        for file in &result.output_files {
            eprintln!("  {} {}", file.digest, file.path);
        }
        for dir in &result.output_directories {
            eprintln!("  {} {}/", dir.tree_digest, dir.path);
        }

        Ok(ExitCode::from(u8::try_from(result.exit_code).unwrap_or(1)))
    }
}
