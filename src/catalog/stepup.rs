use std::io::{self, BufRead, Write};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use super::PhotoCatalog;

const CODE_LENGTH: usize = 6;

/// Drives an interactive step-up challenge against a catalog's
/// request/validate callback pair.
#[async_trait]
pub trait StepUpAuthenticator: Send + Sync {
    /// Returns `true` once the catalog accepted a code. Callers bound the
    /// wait with their own timeout.
    async fn verify(&self, catalog: &dyn PhotoCatalog) -> bool;
}

/// Whether `code` has the shape of a step-up code: exactly six ASCII digits.
pub fn is_valid_code(code: &str) -> bool {
    code.len() == CODE_LENGTH && code.chars().all(|c| c.is_ascii_digit())
}

/// Lines read from an input stream by a dedicated thread.
///
/// A blocking read cannot be cancelled, so one reader thread lives for the
/// whole process and every prompt takes its next line from the channel. A
/// prompt abandoned by a timeout leaves no read in flight; whatever was
/// typed in the meantime is discarded before the next prompt.
#[derive(Debug)]
pub struct LineReader {
    lines: Mutex<mpsc::UnboundedReceiver<io::Result<String>>>,
}

impl LineReader {
    pub fn new(lines: mpsc::UnboundedReceiver<io::Result<String>>) -> Self {
        Self {
            lines: Mutex::new(lines),
        }
    }

    /// Start a thread forwarding each line of `input`.
    pub fn spawn<R: BufRead + Send + 'static>(input: R) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        std::thread::spawn(move || {
            for line in input.lines() {
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
        Self::new(rx)
    }

    /// The process-wide reader over stdin.
    pub fn stdin() -> Arc<LineReader> {
        static STDIN: OnceLock<Arc<LineReader>> = OnceLock::new();
        STDIN
            .get_or_init(|| Arc::new(LineReader::spawn(io::BufReader::new(io::stdin()))))
            .clone()
    }

    /// Drop lines typed before this call, then wait for the next one.
    /// `None` once the input is closed.
    pub async fn next_fresh_line(&self) -> io::Result<Option<String>> {
        let mut lines = self.lines.lock().await;
        while let Ok(stale) = lines.try_recv() {
            tracing::debug!(ok = stale.is_ok(), "Discarding input typed before the prompt");
        }
        lines.recv().await.transpose()
    }
}

/// Prompts for the code on the controlling terminal.
#[derive(Debug, Clone)]
pub struct TerminalStepUp {
    attempts: u32,
    /// `None` reads stdin, whose reader thread starts at the first prompt.
    input: Option<Arc<LineReader>>,
}

impl TerminalStepUp {
    pub fn new(attempts: u32) -> Self {
        Self {
            attempts: attempts.max(1),
            input: None,
        }
    }

    pub fn with_input(attempts: u32, input: Arc<LineReader>) -> Self {
        Self {
            input: Some(input),
            ..Self::new(attempts)
        }
    }

    async fn prompt_code(&self) -> io::Result<String> {
        let input = self.input.clone().unwrap_or_else(LineReader::stdin);
        print!("Please enter the verification code from your trusted device: ");
        io::stdout().flush()?;
        match input.next_fresh_line().await? {
            Some(line) => Ok(line.trim().to_string()),
            None => Err(io::Error::new(io::ErrorKind::UnexpectedEof, "input closed")),
        }
    }
}

impl Default for TerminalStepUp {
    fn default() -> Self {
        Self::new(3)
    }
}

#[async_trait]
impl StepUpAuthenticator for TerminalStepUp {
    async fn verify(&self, catalog: &dyn PhotoCatalog) -> bool {
        if !catalog.request_new_code().await {
            tracing::error!("Failed to request a verification code");
            return false;
        }

        for attempt in 1..=self.attempts {
            let code = match self.prompt_code().await {
                Ok(code) => code,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to read verification code");
                    return false;
                }
            };

            if !is_valid_code(&code) {
                tracing::error!(
                    "Invalid code: must be exactly {} digits (attempt {}/{})",
                    CODE_LENGTH,
                    attempt,
                    self.attempts
                );
                continue;
            }

            if catalog.validate_code(&code).await {
                tracing::debug!("Code verification successful");
                return true;
            }
            tracing::error!(
                "Code verification failed: wrong code (attempt {}/{})",
                attempt,
                self.attempts
            );
        }
        false
    }
}
