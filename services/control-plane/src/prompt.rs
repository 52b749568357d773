//! Interactive command prompt.
//!
//! Reads `COMMAND[,group]` lines, answers `help`/`h` and bad input itself,
//! and passes every valid command on through a channel. It never touches a
//! node connection.

use std::io::{self, BufRead, Write};
use std::thread;

use camfleet_manifest::Group;
use camfleet_proto::{Command, CommandKind};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::PromptError;

/// A parsed prompt line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptInput {
    Help,
    Command(Command),
}

/// Parse one prompt line.
pub fn parse_line(line: &str) -> Result<PromptInput, PromptError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(PromptError::Empty);
    }

    if line.eq_ignore_ascii_case("help") || line.eq_ignore_ascii_case("h") {
        return Ok(PromptInput::Help);
    }

    let (keyword, group) = match line.split_once(',') {
        Some((keyword, group)) => (keyword, Some(group.parse::<Group>()?)),
        None => (line, None),
    };

    let kind = CommandKind::from_keyword(keyword)
        .ok_or_else(|| PromptError::UnknownCommand(keyword.trim().to_string()))?;

    Ok(PromptInput::Command(Command { kind, group }))
}

/// The command vocabulary as printed for `help`.
pub fn help_text() -> String {
    let mut text = String::from("Commands (optionally followed by ,<group>):\n");
    for kind in CommandKind::ALL {
        text.push_str(&format!("  {:<20}{}\n", kind.as_str(), kind.description()));
    }

    let groups: Vec<_> = Group::ALL.iter().map(Group::as_str).collect();
    text.push_str(&format!("Groups: {}\n", groups.join(", ")));
    text
}

/// Answer prompt lines from `input` until it ends or the receiving side of
/// `commands` goes away.
///
/// Blocking; run it on its own thread.
pub fn run_prompt<R, W>(input: R, mut output: W, commands: mpsc::Sender<Command>) -> io::Result<()>
where
    R: BufRead,
    W: Write,
{
    for line in input.lines() {
        let line = line?;

        match parse_line(&line) {
            Ok(PromptInput::Help) => output.write_all(help_text().as_bytes())?,
            Ok(PromptInput::Command(command)) => {
                if commands.blocking_send(command).is_err() {
                    debug!("Command channel closed, prompt exiting");
                    break;
                }
            }
            Err(PromptError::Empty) => {}
            Err(e) => writeln!(output, "{e}")?,
        }
        output.flush()?;
    }

    Ok(())
}

/// Run the prompt on stdin and stdout from a dedicated thread.
pub fn spawn_stdin_prompt(commands: mpsc::Sender<Command>) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("prompt".to_string())
        .spawn(move || {
            let stdin = io::stdin();
            if let Err(e) = run_prompt(stdin.lock(), io::stdout(), commands) {
                tracing::error!(error = %e, "Prompt failed");
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use camfleet_manifest::UnknownGroup;
    use rstest::rstest;

    #[rstest]
    #[case("START", Command::new(CommandKind::Start))]
    #[case("  soft stop  ", Command::new(CommandKind::SoftStop))]
    #[case("FINISH PROCESSING,archive", Command::for_group(CommandKind::FinishProcessing, Group::Archive))]
    #[case("hard stop , Tracking", Command::for_group(CommandKind::HardStop, Group::Tracking))]
    fn test_parse_commands(#[case] line: &str, #[case] expected: Command) {
        assert_eq!(parse_line(line), Ok(PromptInput::Command(expected)));
    }

    #[rstest]
    #[case("help")]
    #[case("H")]
    fn test_parse_help(#[case] line: &str) {
        assert_eq!(parse_line(line), Ok(PromptInput::Help));
    }

    #[test]
    fn test_parse_rejects() {
        assert_eq!(parse_line("   "), Err(PromptError::Empty));
        assert_eq!(
            parse_line("REBOOT"),
            Err(PromptError::UnknownCommand("REBOOT".to_string()))
        );
        assert_eq!(
            parse_line("START,cameras"),
            Err(PromptError::UnknownGroup(UnknownGroup("cameras".to_string())))
        );
    }

    #[test]
    fn test_help_lists_vocabulary() {
        let help = help_text();
        for kind in CommandKind::ALL {
            assert!(help.contains(kind.as_str()));
        }
        assert!(help.contains("postprocessing"));
    }

    #[test]
    fn test_prompt_forwards_only_valid_commands() {
        let (tx, mut rx) = mpsc::channel(8);
        let input = "help\n\nbogus\nSTART,ingest\nhard stop\n";
        let mut output = Vec::new();

        run_prompt(input.as_bytes(), &mut output, tx).unwrap();

        assert_eq!(
            rx.try_recv().unwrap(),
            Command::for_group(CommandKind::Start, Group::Ingest)
        );
        assert_eq!(rx.try_recv().unwrap(), Command::new(CommandKind::HardStop));
        assert!(rx.try_recv().is_err());

        let output = String::from_utf8(output).unwrap();
        assert!(output.starts_with("Commands"));
        assert!(output.contains("unknown command 'bogus'"));
    }

    #[test]
    fn test_prompt_stops_when_channel_closes() {
        let (tx, rx) = mpsc::channel(8);
        drop(rx);

        run_prompt("START\nSTART\n".as_bytes(), io::sink(), tx).unwrap();
    }
}
