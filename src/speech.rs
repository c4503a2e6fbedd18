use std::process::Stdio;

use tokio::process::Command;
use tokio::task::JoinHandle;

use crate::config::{Config, FallbackConfig};
use crate::error::{Result, TokiError};
use crate::session::Inbox;

/// Local text-to-speech used when the tutor's audio is late.
///
/// `speak` returns once synthesis has been started; start and end are
/// reported through the inbox under the given utterance id. `cancel` stops
/// any utterance in progress and reports nothing further for it.
pub trait SpeechSynthesizer: Send {
    fn speak(&mut self, utterance: u64, text: &str, inbox: &Inbox) -> Result<()>;
    fn cancel(&mut self);
}

/// Speaks by running an external TTS program with the text as its last
/// argument, e.g. `espeak-ng -s 160 "text"`.
pub struct CommandSynthesizer {
    program: String,
    args: Vec<String>,
    current: Option<JoinHandle<()>>,
}

impl CommandSynthesizer {
    #[must_use]
    pub fn new(config: &FallbackConfig) -> Self {
        Self {
            program: Config::expand_path(&config.command)
                .to_string_lossy()
                .into_owned(),
            args: config.args.clone(),
            current: None,
        }
    }
}

impl SpeechSynthesizer for CommandSynthesizer {
    fn speak(&mut self, utterance: u64, text: &str, inbox: &Inbox) -> Result<()> {
        self.cancel();

        let child = Command::new(&self.program)
            .args(&self.args)
            .arg(text)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TokiError::Synthesis(format!("failed to run {}: {e}", self.program)))?;

        tracing::debug!("speaking utterance {utterance} with {}", self.program);
        inbox.synthesis_started(utterance);

        let inbox = inbox.clone();
        let program = self.program.clone();
        self.current = Some(tokio::spawn(async move {
            match child.wait_with_output().await {
                Ok(output) if output.status.success() => {}
                Ok(output) => {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    tracing::warn!("{program} exited with {}: {}", output.status, stderr.trim());
                }
                Err(e) => tracing::warn!("{program} failed: {e}"),
            }
            inbox.synthesis_finished(utterance);
        }));

        Ok(())
    }

    fn cancel(&mut self) {
        if let Some(task) = self.current.take() {
            // Aborting drops the child, which kills it.
            task.abort();
        }
    }
}

impl Drop for CommandSynthesizer {
    fn drop(&mut self) {
        self.cancel();
    }
}
