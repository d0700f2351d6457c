//! Line commands typed at the operator prompt.

use std::time::Duration;

use shared::domain::{MoveCommand, SpeedDirection};

pub const DEFAULT_DRIVE: Duration = Duration::from_millis(500);

pub const HELP: &str = "\
commands:
  devices                      list known devices
  connect <device> [operator]  take control of a device
  hold <f|b|l|r>               start holding a direction
  release <f|b|l|r>            stop holding a direction
  drive <f|b|l|r> [ms]         hold a direction for a while, then release
  speed <up|down>              step the motor speed
  test                         send the diagnostic command
  test-speed                   set the diagnostic motor speed
  status                       show session and telemetry
  disconnect                   release the device
  quit                         disconnect and exit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorCommand {
    Devices,
    Connect {
        device: String,
        operator: Option<String>,
    },
    Hold(MoveCommand),
    Release(MoveCommand),
    Drive {
        command: MoveCommand,
        duration: Duration,
    },
    Speed(SpeedDirection),
    Test,
    TestSpeed,
    Status,
    Disconnect,
    Help,
    Quit,
}

/// Parses one input line; `Ok(None)` for blank lines.
pub fn parse_line(line: &str) -> Result<Option<OperatorCommand>, String> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let args: Vec<&str> = words.collect();

    let command = match (verb.to_ascii_lowercase().as_str(), args.as_slice()) {
        ("devices" | "ls", []) => OperatorCommand::Devices,
        ("connect", [device]) => OperatorCommand::Connect {
            device: device.to_string(),
            operator: None,
        },
        ("connect", [device, operator @ ..]) if !operator.is_empty() => {
            OperatorCommand::Connect {
                device: device.to_string(),
                operator: Some(operator.join(" ")),
            }
        }
        ("hold", [direction]) => OperatorCommand::Hold(parse_direction(direction)?),
        ("release", [direction]) => OperatorCommand::Release(parse_direction(direction)?),
        ("drive", [direction]) => OperatorCommand::Drive {
            command: parse_direction(direction)?,
            duration: DEFAULT_DRIVE,
        },
        ("drive", [direction, millis]) => OperatorCommand::Drive {
            command: parse_direction(direction)?,
            duration: Duration::from_millis(
                millis
                    .parse()
                    .map_err(|_| format!("invalid duration in ms: {millis}"))?,
            ),
        },
        ("speed", [direction]) => OperatorCommand::Speed(
            direction
                .parse()
                .map_err(|_| format!("unknown speed direction: {direction}"))?,
        ),
        ("test", []) => OperatorCommand::Test,
        ("test-speed", []) => OperatorCommand::TestSpeed,
        ("status", []) => OperatorCommand::Status,
        ("disconnect", []) => OperatorCommand::Disconnect,
        ("help" | "?", []) => OperatorCommand::Help,
        ("quit" | "exit", []) => OperatorCommand::Quit,
        (verb, _) => return Err(format!("unrecognized command `{verb}`; type `help`")),
    };
    Ok(Some(command))
}

fn parse_direction(raw: &str) -> Result<MoveCommand, String> {
    raw.parse().map_err(|_| format!("unknown direction: {raw}"))
}

#[cfg(test)]
#[path = "tests/commands_tests.rs"]
mod tests;
