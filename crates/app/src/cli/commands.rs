//! Live commands read from stdin while the engine runs

use auscult_core::domain::settings::MainsFrequency;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    Mute,
    Unmute,
    /// Slider position in `[0, 1]`
    Gain(f32),
    Mains(MainsFrequency),
    Murmurs(bool),
    Status,
    Stop,
    Start,
    Quit,
    Help,
}

#[derive(Debug, Error, PartialEq)]
pub enum CommandError {
    #[error("empty command")]
    Empty,

    #[error("unknown command '{0}' (try 'help')")]
    Unknown(String),

    #[error("'{0}' needs an argument")]
    MissingArgument(&'static str),

    #[error("invalid argument for '{command}': {value}")]
    InvalidArgument { command: &'static str, value: String },
}

pub const HELP: &str = "\
commands:
  mute | unmute          silence or restore the output (envelope keeps flowing)
  gain <0..1>            set the gain slider position
  mains <50|60>          select the hum notch frequency
  murmurs <on|off>       widen the band to 400 Hz
  status                 print engine state and settings
  stop | start           stop or restart the engine
  quit                   exit";

fn parse_switch(value: &str) -> Option<bool> {
    match value {
        "on" | "true" | "1" | "yes" => Some(true),
        "off" | "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let name = words.next().ok_or(CommandError::Empty)?.to_ascii_lowercase();
        let arg = words.next();

        let command = match name.as_str() {
            "mute" => Command::Mute,
            "unmute" => Command::Unmute,
            "status" => Command::Status,
            "stop" => Command::Stop,
            "start" => Command::Start,
            "quit" | "exit" | "q" => Command::Quit,
            "help" | "?" => Command::Help,
            "gain" => {
                let value = arg.ok_or(CommandError::MissingArgument("gain"))?;
                let position = value
                    .parse::<f32>()
                    .ok()
                    .filter(|p| (0.0..=1.0).contains(p))
                    .ok_or_else(|| CommandError::InvalidArgument {
                        command: "gain",
                        value: value.to_string(),
                    })?;
                Command::Gain(position)
            }
            "mains" => {
                let value = arg.ok_or(CommandError::MissingArgument("mains"))?;
                let mains = value
                    .parse::<u32>()
                    .ok()
                    .and_then(|hz| MainsFrequency::try_from(hz).ok())
                    .ok_or_else(|| CommandError::InvalidArgument {
                        command: "mains",
                        value: value.to_string(),
                    })?;
                Command::Mains(mains)
            }
            "murmurs" => {
                let value = arg.ok_or(CommandError::MissingArgument("murmurs"))?;
                let enabled = parse_switch(value).ok_or_else(|| CommandError::InvalidArgument {
                    command: "murmurs",
                    value: value.to_string(),
                })?;
                Command::Murmurs(enabled)
            }
            _ => return Err(CommandError::Unknown(name)),
        };

        Ok(command)
    }
}
