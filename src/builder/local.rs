use std::fs::{self, File};
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::builder::{join_within, BuildExecutor};
use crate::cas::{build_tree, ContentAddressableStorage};
use crate::config::{ExecutorConfig, RunAs};
use crate::digest::Digest;
use crate::error::{Error, IoResultExt, Result};
use crate::fs::{clear_directory, read_small_file, set_mode};
use crate::types::{
    ActionResult, Command, ExecuteRequest, ExecuteResponse, OutputDirectory, OutputFile,
};

/// runs actions as child processes in a local build directory
///
/// ```text
/// <build_directory>/
///   root/     input tree, working directory of the command
///   tmp/      HOME and TMPDIR
///   stdout
///   stderr
/// ```
///
/// the build directory is wiped before every action, so one executor runs
/// one action at a time.
pub struct LocalBuildExecutor {
    cas: Arc<dyn ContentAddressableStorage>,
    build_directory: PathBuf,
    inline_output_limit: u64,
    timeout: Duration,
    run_as: Option<RunAs>,
    build_lock: tokio::sync::Mutex<()>,
}

#[derive(Clone)]
struct BuildLayout {
    root: PathBuf,
    tmp: PathBuf,
    stdout: PathBuf,
    stderr: PathBuf,
}

impl BuildLayout {
    fn new(build_directory: &Path) -> Self {
        Self {
            root: build_directory.join("root"),
            tmp: build_directory.join("tmp"),
            stdout: build_directory.join("stdout"),
            stderr: build_directory.join("stderr"),
        }
    }
}

impl LocalBuildExecutor {
    pub fn new(cas: Arc<dyn ContentAddressableStorage>, config: &ExecutorConfig) -> Self {
        Self {
            cas,
            build_directory: config.build_directory.clone(),
            inline_output_limit: config.inline_output_limit_bytes,
            timeout: config.default_timeout(),
            run_as: config.run_as,
            build_lock: tokio::sync::Mutex::new(()),
        }
    }

    async fn execute_action(
        &self,
        request: &ExecuteRequest,
        cancel: &CancellationToken,
    ) -> Result<ActionResult> {
        let layout = BuildLayout::new(&self.build_directory);

        let command = {
            let cas = self.cas.clone();
            let build_directory = self.build_directory.clone();
            let layout = layout.clone();
            let request = request.clone();
            tokio::task::spawn_blocking(move || {
                prepare(cas.as_ref(), &build_directory, &layout, &request)
            })
            .await
            .map_err(|e| Error::Internal(format!("prepare task failed: {}", e)))??
        };

        let exit_code = self.run(&command, &layout, cancel).await?;

        let cas = self.cas.clone();
        let request = request.clone();
        let inline_limit = self.inline_output_limit;
        tokio::task::spawn_blocking(move || {
            collect(cas.as_ref(), &layout, &request, exit_code, inline_limit)
        })
        .await
        .map_err(|e| Error::Internal(format!("collect task failed: {}", e)))?
    }

    async fn run(
        &self,
        command: &Command,
        layout: &BuildLayout,
        cancel: &CancellationToken,
    ) -> Result<i32> {
        let program = &command.arguments[0];
        let program_path = if program.contains('/') && !program.starts_with('/') {
            layout.root.join(program)
        } else {
            PathBuf::from(program)
        };

        let stdout = File::create(&layout.stdout).with_path(&layout.stdout)?;
        let stderr = File::create(&layout.stderr).with_path(&layout.stderr)?;

        let mut cmd = tokio::process::Command::new(&program_path);
        cmd.args(&command.arguments[1..])
            .current_dir(&layout.root)
            .env_clear()
            .env("HOME", &layout.tmp)
            .env("TMPDIR", &layout.tmp)
            .envs(
                command
                    .environment_variables
                    .iter()
                    .map(|v| (v.name.as_str(), v.value.as_str())),
            )
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true);
        if let Some(run_as) = self.run_as {
            if nix::unistd::geteuid().is_root() {
                cmd.uid(run_as.uid).gid(run_as.gid);
            }
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Execution(format!("failed to start {}: {}", program, e)))?;

        let status = tokio::select! {
            status = child.wait() => status.map_err(|e| Error::Execution(format!("failed to wait for {}: {}", program, e)))?,
            _ = tokio::time::sleep(self.timeout) => {
                let _ = child.kill().await;
                return Err(Error::DeadlineExceeded(self.timeout));
            }
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                return Err(Error::Cancelled);
            }
        };

        let exit_code = match (status.code(), status.signal()) {
            (Some(code), _) => code,
            (None, Some(signal)) => 128 + signal,
            (None, None) => -1,
        };
        tracing::debug!(program = %program, exit_code, "process exited");
        Ok(exit_code)
    }
}

#[async_trait]
impl BuildExecutor for LocalBuildExecutor {
    async fn execute(
        &self,
        request: &ExecuteRequest,
        cancel: &CancellationToken,
    ) -> ExecuteResponse {
        let _guard = self.build_lock.lock().await;
        match self.execute_action(request, cancel).await {
            Ok(result) => {
                tracing::info!(
                    instance = %request.instance_name,
                    exit_code = result.exit_code,
                    "action finished"
                );
                ExecuteResponse::from_result(result)
            }
            Err(e) => {
                tracing::warn!(instance = %request.instance_name, error = %e, "action failed");
                ExecuteResponse::from_error(e)
            }
        }
    }
}

/// reset the build directory, fetch the command and stage the input tree
fn prepare(
    cas: &dyn ContentAddressableStorage,
    build_directory: &Path,
    layout: &BuildLayout,
    request: &ExecuteRequest,
) -> Result<Command> {
    let instance = request.instance_name.as_str();
    let action = &request.action;

    clear_directory(build_directory)?;
    for dir in [&layout.root, &layout.tmp] {
        fs::create_dir(dir).with_path(dir)?;
        set_mode(dir, 0o777)?;
    }

    let command = cas.get_command(instance, &action.command_digest)?;
    if command.arguments.is_empty() {
        return Err(Error::InvalidArgument(
            "insufficient number of command arguments".to_string(),
        ));
    }

    stage_directory(cas, instance, &action.input_root_digest, &layout.root)?;

    for output in action.output_files.iter().chain(&action.output_directories) {
        let path = join_within(&layout.root, output)?;
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent).with_path(parent)?;
            }
            set_mode(parent, 0o777)?;
        }
    }
    Ok(command)
}

fn stage_directory(
    cas: &dyn ContentAddressableStorage,
    instance: &str,
    digest: &Digest,
    path: &Path,
) -> Result<()> {
    let directory = cas.get_directory(instance, digest)?;
    directory.validate()?;

    for file in &directory.files {
        cas.get_file(instance, &file.digest, &path.join(&file.name), file.is_executable)?;
    }
    for child in &directory.directories {
        let child_path = path.join(&child.name);
        fs::create_dir(&child_path).with_path(&child_path)?;
        set_mode(&child_path, 0o755)?;
        stage_directory(cas, instance, &child.digest, &child_path)?;
    }
    Ok(())
}

/// upload logs and declared outputs
fn collect(
    cas: &dyn ContentAddressableStorage,
    layout: &BuildLayout,
    request: &ExecuteRequest,
    exit_code: i32,
    inline_limit: u64,
) -> Result<ActionResult> {
    let instance = request.instance_name.as_str();
    let action = &request.action;

    let (stdout_digest, _) = cas.put_file(instance, &layout.stdout)?;
    let (stderr_digest, _) = cas.put_file(instance, &layout.stderr)?;
    let mut result = ActionResult {
        exit_code,
        stdout_raw: read_small_file(&layout.stdout, inline_limit)?,
        stdout_digest: Some(stdout_digest),
        stderr_raw: read_small_file(&layout.stderr, inline_limit)?,
        stderr_digest: Some(stderr_digest),
        ..Default::default()
    };

    for output in &action.output_files {
        let path = join_within(&layout.root, output)?;
        let meta = match fs::symlink_metadata(&path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(Error::Io { path, source: e }),
        };
        if !meta.is_file() {
            tracing::warn!(path = %output, "declared output file is not a regular file");
            continue;
        }
        let (digest, is_executable) = cas.put_file(instance, &path)?;
        result.output_files.push(OutputFile {
            path: output.clone(),
            digest,
            is_executable,
            contents: read_small_file(&path, inline_limit)?,
        });
    }

    for output in &action.output_directories {
        let path = join_within(&layout.root, output)?;
        match fs::symlink_metadata(&path) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                tracing::warn!(path = %output, "declared output directory is not a directory");
                continue;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(Error::Io { path, source: e }),
        }
        let tree = build_tree(cas, instance, &path)?;
        let tree_digest = cas.put_tree(instance, &tree)?;
        result.output_directories.push(OutputDirectory {
            path: output.clone(),
            tree_digest,
        });
    }

    cas.flush()?;
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blobstore::{
        get_message, put_message, read_blob, BlobAccess, MemoryBlobAccess, MerkleBlobAccess,
    };
    use crate::cas::BlobAccessContentAddressableStorage;
    use crate::digest::DigestKeyer;
    use crate::error::Code;
    use crate::types::{Action, Directory, FileNode, Tree};
    use tempfile::tempdir;

    struct Fixture {
        _dir: tempfile::TempDir,
        blobs: Arc<dyn BlobAccess>,
        executor: LocalBuildExecutor,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let blobs: Arc<dyn BlobAccess> = Arc::new(MerkleBlobAccess::new(Arc::new(
            MemoryBlobAccess::new(DigestKeyer::WithoutInstance),
        )));
        let cas = Arc::new(BlobAccessContentAddressableStorage::new(blobs.clone()));
        let config = ExecutorConfig {
            build_directory: dir.path().join("build"),
            inline_output_limit_bytes: 16,
            default_timeout_secs: 30,
            run_as: None,
        };
        Fixture {
            executor: LocalBuildExecutor::new(cas, &config),
            _dir: dir,
            blobs,
        }
    }

    impl Fixture {
        fn request(&self, command: Command, input_root: &Directory, outputs: &[&str]) -> ExecuteRequest {
            let command_digest = put_message(self.blobs.as_ref(), "", &command).unwrap();
            let input_root_digest = put_message(self.blobs.as_ref(), "", input_root).unwrap();
            ExecuteRequest::new(
                "",
                Action {
                    command_digest,
                    input_root_digest,
                    output_files: outputs.iter().map(|s| s.to_string()).collect(),
                    output_directories: vec![],
                    do_not_cache: false,
                },
            )
        }

        async fn run(&self, request: &ExecuteRequest) -> ExecuteResponse {
            self.executor
                .execute(request, &CancellationToken::new())
                .await
        }
    }

    fn sh(script: &str) -> Command {
        Command::new(["/bin/sh", "-c", script]).with_env("PATH", "/bin:/usr/bin")
    }

    #[tokio::test]
    async fn test_true_exits_zero() {
        let f = fixture();
        let request = f.request(Command::new(["/bin/true"]), &Directory::default(), &[]);
        let response = f.run(&request).await;

        assert!(response.is_ok(), "{:?}", response.status);
        let result = response.result.unwrap();
        assert_eq!(result.exit_code, 0);
        assert!(result.output_files.is_empty());
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_not_an_error() {
        let f = fixture();
        let request = f.request(sh("echo oops >&2; exit 3"), &Directory::default(), &[]);
        let response = f.run(&request).await;

        assert!(response.is_ok());
        let result = response.result.unwrap();
        assert_eq!(result.exit_code, 3);
        assert_eq!(result.stderr_raw.as_deref(), Some(&b"oops\n"[..]));
    }

    #[tokio::test]
    async fn test_signal_exit_code() {
        let f = fixture();
        let request = f.request(sh("kill -9 $$"), &Directory::default(), &[]);
        let result = f.run(&request).await.result.unwrap();
        assert_eq!(result.exit_code, 128 + 9);
    }

    #[tokio::test]
    async fn test_inputs_are_staged_and_outputs_collected() {
        let f = fixture();
        let input = Digest::of_bytes(b"hello input\n");
        crate::blobstore::put_bytes(f.blobs.as_ref(), "", &input, b"hello input\n".to_vec())
            .unwrap();
        let root = Directory {
            files: vec![FileNode {
                name: "in.txt".into(),
                digest: input,
                is_executable: false,
            }],
            directories: vec![],
        };

        let request = f.request(
            sh("cat in.txt > out/copy.txt; printf '%s' \"$HOME\" > out/home.txt"),
            &root,
            &["out/copy.txt", "out/home.txt", "missing.txt"],
        );
        let result = f.run(&request).await.result.unwrap();
        assert_eq!(result.exit_code, 0);

        // the missing declared output is silently omitted
        let paths: Vec<&str> = result.output_files.iter().map(|o| o.path.as_str()).collect();
        assert_eq!(paths, vec!["out/copy.txt", "out/home.txt"]);

        let copy = &result.output_files[0];
        assert_eq!(copy.contents.as_deref(), Some(&b"hello input\n"[..]));
        assert_eq!(
            read_blob(f.blobs.as_ref(), "", &copy.digest).unwrap(),
            b"hello input\n"
        );
        // $HOME is the absolute build path, longer than the inline limit
        let home = &result.output_files[1];
        assert!(home.contents.is_none());
        let home = read_blob(f.blobs.as_ref(), "", &home.digest).unwrap();
        assert!(String::from_utf8(home).unwrap().ends_with("/tmp"));
    }

    #[tokio::test]
    async fn test_large_output_is_not_inlined() {
        let f = fixture();
        let request = f.request(
            sh("printf '%064d' 0 > big.txt; printf '%064d' 0"),
            &Directory::default(),
            &["big.txt"],
        );
        let result = f.run(&request).await.result.unwrap();

        assert!(result.stdout_raw.is_none());
        let stdout_digest = result.stdout_digest.unwrap();
        assert_eq!(stdout_digest.size_bytes, 64);
        assert_eq!(read_blob(f.blobs.as_ref(), "", &stdout_digest).unwrap().len(), 64);
        assert!(result.output_files[0].contents.is_none());
    }

    #[tokio::test]
    async fn test_output_directory_uploaded_as_tree() {
        let f = fixture();
        let mut request = f.request(
            sh("mkdir -p gen/sub && echo a > gen/a && echo b > gen/sub/b"),
            &Directory::default(),
            &[],
        );
        request.action.output_directories = vec!["gen".into()];
        let result = f.run(&request).await.result.unwrap();

        assert_eq!(result.output_directories.len(), 1);
        let tree: Tree =
            get_message(f.blobs.as_ref(), "", &result.output_directories[0].tree_digest).unwrap();
        assert_eq!(tree.root.files[0].name, "a");
        assert_eq!(tree.root.directories[0].name, "sub");
        assert_eq!(tree.children.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_arguments_rejected() {
        let f = fixture();
        let request = f.request(Command::default(), &Directory::default(), &[]);
        let response = f.run(&request).await;

        let status = response.status.unwrap();
        assert_eq!(status.code, Code::InvalidArgument);
        assert!(status.message.contains("insufficient number of command arguments"));
    }

    #[tokio::test]
    async fn test_escaping_output_path_rejected() {
        let f = fixture();
        let request = f.request(Command::new(["/bin/true"]), &Directory::default(), &["../escape"]);
        let status = f.run(&request).await.status.unwrap();
        assert_eq!(status.code, Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let f = fixture();
        let request = f.request(
            Command::new(["/nonexistent/program"]),
            &Directory::default(),
            &[],
        );
        let status = f.run(&request).await.status.unwrap();
        assert_eq!(status.code, Code::Internal);
    }

    #[tokio::test]
    async fn test_cancellation_kills_process() {
        let f = fixture();
        let request = f.request(sh("sleep 30"), &Directory::default(), &[]);
        let cancel = CancellationToken::new();

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                cancel.cancel();
            })
        };
        let started = std::time::Instant::now();
        let response = f.executor.execute(&request, &cancel).await;
        canceller.await.unwrap();

        assert_eq!(response.status.unwrap().code, Code::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_timeout() {
        let dir = tempdir().unwrap();
        let blobs: Arc<dyn BlobAccess> =
            Arc::new(MemoryBlobAccess::new(DigestKeyer::WithoutInstance));
        let cas = Arc::new(BlobAccessContentAddressableStorage::new(blobs.clone()));
        let config = ExecutorConfig {
            build_directory: dir.path().join("build"),
            inline_output_limit_bytes: 16,
            default_timeout_secs: 1,
            run_as: None,
        };
        let executor = LocalBuildExecutor::new(cas, &config);
        let f = Fixture {
            _dir: dir,
            blobs,
            executor,
        };

        let request = f.request(sh("sleep 30"), &Directory::default(), &[]);
        let status = f.run(&request).await.status.unwrap();
        assert_eq!(status.code, Code::DeadlineExceeded);
    }
}
