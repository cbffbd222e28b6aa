//! Stage classifier backed by an external command.
//!
//! The command receives the image path as its last argument and prints the
//! detected stage on stdout (`2`, `stage 3`, `Stage_1`, ...). Anything that
//! does not name stage 1-3 is `Unknown`. The child is killed if the caller
//! gives up waiting.

use async_trait::async_trait;
use tokio::process::Command;

use crate::growth::{Classifier, ClassifierError, GrowthStage};

#[derive(Debug, Clone)]
pub struct CommandClassifier {
    program: String,
    args: Vec<String>,
}

impl CommandClassifier {
    /// Splits a configured command line on whitespace. `None` if empty.
    pub fn from_command_line(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
        })
    }
}

#[async_trait]
impl Classifier for CommandClassifier {
    async fn classify(&self, image_ref: &str) -> Result<GrowthStage, ClassifierError> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(image_ref)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ClassifierError::Unavailable(format!("spawn {}: {e}", self.program)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ClassifierError::Unavailable(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        let stage = parse_stage(&String::from_utf8_lossy(&output.stdout));
        tracing::debug!(image = image_ref, %stage, "classifier answered");
        Ok(stage)
    }
}

/// First token that names stage 1, 2 or 3 wins.
pub fn parse_stage(text: &str) -> GrowthStage {
    text.to_ascii_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .map(|token| token.strip_prefix("stage").unwrap_or(token))
        .find_map(|token| match token {
            "1" => Some(GrowthStage::Stage1),
            "2" => Some(GrowthStage::Stage2),
            "3" => Some(GrowthStage::Stage3),
            _ => None,
        })
        .unwrap_or(GrowthStage::Unknown)
}

// ===========================================================================
// Tests
// ===========================================================================
