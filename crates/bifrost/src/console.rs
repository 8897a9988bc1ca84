//! Operator console: one command per input line, run as the console source.

use bifrost_event_system::{CommandError, CommandSource, Dispatcher};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{info, warn};

/// Reads commands until the input ends and returns how many succeeded.
pub async fn run_console<R>(dispatcher: Arc<Dispatcher>, input: R) -> usize
where
    R: AsyncBufRead + Unpin,
{
    info!("⌨️ Console ready. Type 'help' for available commands.");
    let mut lines = input.lines();
    let mut succeeded = 0;

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("⚠️ Console input failed: {}", e);
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match dispatcher.execute_command(line, &CommandSource::Console) {
            Ok(result) if result.success => {
                succeeded += 1;
                for output in result.message.iter().flat_map(|m| m.lines()) {
                    info!("{}", output);
                }
            }
            Ok(result) => {
                warn!("{}", result.message.as_deref().unwrap_or("Command failed"));
            }
            Err(CommandError::UnknownCommand(_)) => {
                warn!("❓ Unknown command. Type 'help' for available commands.");
            }
            Err(e) => warn!("⚠️ {}", e),
        }
    }

    succeeded
}

#[cfg(test)]
mod tests {
    use super::*;
    use bifrost_event_system::CommandResult;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_console_runs_each_line() {
        let dispatcher = Arc::new(Dispatcher::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        dispatcher
            .register_command("ping", "Replies with pong", &["p"], move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                CommandResult::success("pong")
            })
            .unwrap();
        dispatcher
            .register_command("fail", "Always fails", &[], |_| CommandResult::failure("nope"))
            .unwrap();

        let input: &[u8] = b"ping\n\n   \n/p\nbogus\nfail\n";
        let succeeded = run_console(dispatcher, input).await;

        assert_eq!(succeeded, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
