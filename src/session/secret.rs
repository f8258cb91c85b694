//! Secret store used as the CI-side persistence backend.
//!
//! Writing goes through an external command (typically `gh secret set NAME`)
//! that reads the value from stdin. Reading is not possible through most
//! secret APIs, so [`CommandSecretStore`] reads the value back from the
//! environment variable the CI runner injects it into.

use std::process::Stdio;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::debug;

pub const NAME_PLACEHOLDER: &str = "{name}";
pub const DEFAULT_SECRET_COMMAND: &str = "gh secret set {name}";

#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn put_secret(&self, name: &str, plaintext: &str) -> Result<()>;

    /// Most secret stores are write-only from the caller's perspective.
    async fn get_secret(&self, _name: &str) -> Result<Option<String>> {
        Ok(None)
    }
}

#[derive(Debug, Clone)]
pub struct CommandSecretStore {
    program: String,
    args: Vec<String>,
}

impl CommandSecretStore {
    /// Parse a whitespace-separated command line. `{name}` in any argument is
    /// replaced with the secret name; when absent the name is appended.
    pub fn from_command_line(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
        })
    }

    fn args_for(&self, name: &str) -> Vec<String> {
        let mut args: Vec<String> = self
            .args
            .iter()
            .map(|a| a.replace(NAME_PLACEHOLDER, name))
            .collect();
        if !self.args.iter().any(|a| a.contains(NAME_PLACEHOLDER)) {
            args.push(name.to_string());
        }
        args
    }
}

#[async_trait]
impl SecretStore for CommandSecretStore {
    async fn put_secret(&self, name: &str, plaintext: &str) -> Result<()> {
        let args = self.args_for(name);
        debug!("secret: running {} {}", self.program, args.join(" "));
        let mut child = tokio::process::Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn secret command '{}'", self.program))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("secret command stdin unavailable"))?;
        // A command that exits without reading stdin surfaces through its
        // exit status below, not as a write error.
        if let Err(e) = stdin.write_all(plaintext.as_bytes()).await {
            if e.kind() != std::io::ErrorKind::BrokenPipe {
                return Err(e).context("failed to write secret to command stdin");
            }
        }
        drop(stdin);

        let output = child
            .wait_with_output()
            .await
            .context("secret command did not complete")?;
        if !output.status.success() {
            bail!(
                "secret command '{}' exited with {:?}: {}",
                self.program,
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    async fn get_secret(&self, name: &str) -> Result<Option<String>> {
        Ok(std::env::var(name).ok().filter(|v| !v.trim().is_empty()))
    }
}
