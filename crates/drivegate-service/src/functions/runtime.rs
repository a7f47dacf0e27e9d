//! The runtime functions are prepared and invoked in.

use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tempfile::TempPath;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::ExecError;
use crate::caching::{CacheContents, CacheError};
use crate::config::FunctionsConfig;

/// The request a function is invoked with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionRequest {
    pub method: String,
    /// Path and query of the request, after routing.
    pub url: String,
    pub headers: BTreeMap<String, String>,
    #[serde(default, with = "base64_body")]
    pub body: Bytes,
}

/// What a function answered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FunctionResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    #[serde(with = "base64_body")]
    pub body: Bytes,
}

impl Default for FunctionResponse {
    fn default() -> Self {
        Self {
            status: 200,
            headers: BTreeMap::new(),
            body: Bytes::new(),
        }
    }
}

/// Bodies travel as base64 strings, so functions see exactly the bytes of the request.
mod base64_body {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(body: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded)
            .map(Bytes::from)
            .map_err(de::Error::custom)
    }
}

/// A prepared function, ready to be invoked any number of times.
#[async_trait]
pub trait FunctionHandler: Send + Sync + 'static {
    async fn invoke(&self, request: FunctionRequest) -> Result<FunctionResponse, ExecError>;
}

/// Turns function sources into [`FunctionHandler`]s.
#[async_trait]
pub trait FunctionRuntime: Send + Sync + 'static {
    /// Prepares `source` to be run with exactly the environment `env`.
    async fn prepare(
        &self,
        source: Bytes,
        env: BTreeMap<String, String>,
    ) -> CacheContents<Arc<dyn FunctionHandler>>;
}

/// Runs functions as child processes of a configured interpreter.
///
/// The source is written to a temporary file when the function is prepared. Every invocation
/// spawns the interpreter with that file, writes the JSON encoded [`FunctionRequest`] to its
/// stdin and reads a JSON encoded [`FunctionResponse`] from its stdout. Bodies on both sides are
/// base64 encoded.
#[derive(Debug, Clone)]
pub struct ProcessRuntime {
    program: String,
    args: Vec<String>,
    temp_dir: PathBuf,
}

impl ProcessRuntime {
    pub fn new(config: &FunctionsConfig) -> anyhow::Result<Self> {
        let (program, args) = config
            .command
            .split_first()
            .ok_or_else(|| anyhow::anyhow!("functions.command must not be empty"))?;

        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            temp_dir: config.temp_dir.clone().unwrap_or_else(std::env::temp_dir),
        })
    }
}

#[async_trait]
impl FunctionRuntime for ProcessRuntime {
    async fn prepare(
        &self,
        source: Bytes,
        env: BTreeMap<String, String>,
    ) -> CacheContents<Arc<dyn FunctionHandler>> {
        let temp_dir = self.temp_dir.clone();
        let path = tokio::task::spawn_blocking(move || -> io::Result<TempPath> {
            let mut file = tempfile::Builder::new()
                .prefix("drivegate-fn-")
                .tempfile_in(temp_dir)?;
            file.write_all(&source)?;
            file.flush()?;
            Ok(file.into_temp_path())
        })
        .await
        .map_err(CacheError::from_std_error)??;

        tracing::trace!(path = %path.display(), "Prepared function");

        Ok(Arc::new(ProcessHandler {
            program: self.program.clone(),
            args: self.args.clone(),
            path,
            env,
        }))
    }
}

/// A function prepared by [`ProcessRuntime`]. Its source file is removed when dropped.
struct ProcessHandler {
    program: String,
    args: Vec<String>,
    path: TempPath,
    env: BTreeMap<String, String>,
}

impl fmt::Debug for ProcessHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandler")
            .field("program", &self.program)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl FunctionHandler for ProcessHandler {
    async fn invoke(&self, request: FunctionRequest) -> Result<FunctionResponse, ExecError> {
        let input = serde_json::to_vec(&request).map_err(|e| ExecError::Failed(e.to_string()))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(&*self.path)
            .env_clear()
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| ExecError::Failed("no stdin".into()))?;
        let write = async move {
            match stdin.write_all(&input).await {
                // functions are free to ignore their input
                Err(err) if err.kind() == io::ErrorKind::BrokenPipe => Ok(()),
                result => result,
            }
        };

        let ((), output) = tokio::try_join!(write, child.wait_with_output())?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ExecError::Failed(format!(
                "{}: {}",
                output.status,
                stderr.trim()
            )));
        }

        serde_json::from_slice(&output.stdout)
            .map_err(|err| ExecError::Failed(format!("invalid function response: {err}")))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::test;

    fn runtime(temp_dir: &test::TempDir) -> ProcessRuntime {
        ProcessRuntime::new(&FunctionsConfig {
            command: vec!["/bin/sh".into()],
            allowed_env: vec![],
            temp_dir: Some(temp_dir.path().to_owned()),
        })
        .unwrap()
    }

    #[test]
    fn test_empty_command() {
        let config = FunctionsConfig {
            command: vec![],
            ..Default::default()
        };
        assert!(ProcessRuntime::new(&config).is_err());
    }

    #[tokio::test]
    async fn test_process_roundtrip() {
        test::setup();
        let temp_dir = test::tempdir();
        let runtime = runtime(&temp_dir);

        // `dW5zZXQ=` and `c2V0` are "unset" and "set"
        let source = r#"read -r request
if [ -z "$HOME" ]; then body=dW5zZXQ=; else body=c2V0; fi
printf '{"status": 201, "headers": {"x-greeting": "%s"}, "body": "%s"}' "$GREETING" "$body"
"#;
        let env = BTreeMap::from([("GREETING".to_owned(), "hello".to_owned())]);
        let handler = runtime.prepare(Bytes::from(source), env).await.unwrap();

        let response = handler
            .invoke(FunctionRequest {
                method: "GET".into(),
                url: "/hello.js".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(response.status, 201);
        assert_eq!(response.headers["x-greeting"], "hello");
        // the host environment is not inherited
        assert_eq!(response.body, "unset");
    }

    #[tokio::test]
    async fn test_binary_body() {
        test::setup();
        let temp_dir = test::tempdir();
        let runtime = runtime(&temp_dir);

        // answers with the body it was sent
        let source = r#"read -r request
body=${request#*\"body\":\"}
printf '{"body": "%s"}' "${body%%\"*}"
"#;
        let handler = runtime
            .prepare(Bytes::from(source), BTreeMap::new())
            .await
            .unwrap();

        let body = Bytes::from_static(&[0xff, 0xd8, 0x00, 0x41, 0x80]);
        let response = handler
            .invoke(FunctionRequest {
                method: "POST".into(),
                url: "/echo.js".into(),
                body: body.clone(),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.body, body);
    }

    #[test]
    fn test_body_encoding() {
        let request = FunctionRequest {
            body: Bytes::from_static(&[0xff, 0xd8]),
            ..Default::default()
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["body"], "/9g=");

        let response: FunctionResponse =
            serde_json::from_str(r#"{"headers": {"content-type": "image/jpeg"}, "body": "/9g="}"#)
                .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, Bytes::from_static(&[0xff, 0xd8]));

        let invalid = serde_json::from_str::<FunctionResponse>(r#"{"body": "not base64!"}"#);
        assert!(invalid.is_err());
    }

    #[tokio::test]
    async fn test_source_removed_with_handler() {
        test::setup();
        let temp_dir = test::tempdir();
        let runtime = runtime(&temp_dir);

        let handler = runtime
            .prepare(Bytes::from_static(b"exit 0"), BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(std::fs::read_dir(temp_dir.path()).unwrap().count(), 1);

        drop(handler);
        assert_eq!(std::fs::read_dir(temp_dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_failing_function() {
        test::setup();
        let temp_dir = test::tempdir();
        let runtime = runtime(&temp_dir);

        let handler = runtime
            .prepare(Bytes::from_static(b"echo boom >&2; exit 3"), BTreeMap::new())
            .await
            .unwrap();
        let err = handler.invoke(FunctionRequest::default()).await.unwrap_err();
        let ExecError::Failed(message) = err else {
            panic!("unexpected error {err:?}");
        };
        assert!(message.ends_with("boom"), "{message}");

        let handler = runtime
            .prepare(Bytes::from_static(b"echo not json"), BTreeMap::new())
            .await
            .unwrap();
        let err = handler.invoke(FunctionRequest::default()).await.unwrap_err();
        assert!(matches!(err, ExecError::Failed(_)));
    }
}
