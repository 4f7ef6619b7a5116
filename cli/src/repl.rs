//! Line-oriented chat loop over any async reader and writer.

use anyhow::Result;
use tally_engine::Agent;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

pub const BANNER: &str = "Tally calculator assistant. Type 'exit' to quit.";
pub const PROMPT: &str = "You: ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Input<'a> {
    Skip,
    Exit,
    Prompt(&'a str),
}

impl<'a> Input<'a> {
    pub fn classify(line: &'a str) -> Self {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            Self::Skip
        } else if trimmed.eq_ignore_ascii_case("exit") || trimmed.eq_ignore_ascii_case("quit") {
            Self::Exit
        } else {
            Self::Prompt(trimmed)
        }
    }
}

/// Drive `agent` until end of input, an exit command, or `interrupt` fires.
///
/// `interrupt` also cancels a turn in flight. Turn failures are reported and
/// the loop keeps going.
pub async fn run<R, W>(
    agent: &mut Agent,
    mut reader: R,
    mut writer: W,
    interrupt: impl Future<Output = ()>,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    tokio::pin!(interrupt);
    writer.write_all(format!("{BANNER}\n").as_bytes()).await?;

    let mut line = String::new();
    loop {
        writer.write_all(PROMPT.as_bytes()).await?;
        writer.flush().await?;

        line.clear();
        let read = tokio::select! {
            read = reader.read_line(&mut line) => read?,
            () = &mut interrupt => {
                writer.write_all(b"\n").await?;
                break;
            }
        };
        if read == 0 {
            writer.write_all(b"\n").await?;
            break;
        }

        let prompt = match Input::classify(&line) {
            Input::Skip => continue,
            Input::Exit => break,
            Input::Prompt(prompt) => prompt,
        };

        // Dropping an interrupted turn leaves history and memory untouched.
        let outcome = tokio::select! {
            outcome = agent.run_turn(prompt) => Some(outcome),
            () = &mut interrupt => None,
        };
        let Some(outcome) = outcome else {
            writer.write_all(b"\n").await?;
            break;
        };

        match outcome {
            Ok(answer) => {
                writer
                    .write_all(format!("Agent: {answer}\n").as_bytes())
                    .await?;
                if let Some(summary) = agent.memory_status().await {
                    writer
                        .write_all(format!("[memory: {summary}]\n").as_bytes())
                        .await?;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Turn failed");
                writer.write_all(format!("Error: {e:#}\n").as_bytes()).await?;
            }
        }
    }

    writer.flush().await?;
    Ok(())
}
